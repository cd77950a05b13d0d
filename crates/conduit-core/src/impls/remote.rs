//! Remote store 共通の JSON クライアント
//!
//! transport の失敗は `StorageError::Unavailable`、2xx 以外は `Rejected`、
//! body が読めなければ `Encoding` です。retention の失敗はリトライしません。

use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use crate::ports::http::{HttpMethod, HttpReply, HttpRequest, HttpTransport, join_url};
use crate::ports::retention_store::StorageError;

#[derive(Clone)]
pub struct RemoteJson {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    timeout: Duration,
}

impl RemoteJson {
    pub fn new(transport: Arc<dyn HttpTransport>, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            timeout,
        }
    }

    pub fn request(&self, method: HttpMethod, path: &str) -> HttpRequest {
        HttpRequest::new(method, join_url(&self.base_url, path), self.timeout)
    }

    pub async fn send(&self, request: HttpRequest) -> Result<HttpReply, StorageError> {
        let url = request.url.clone();
        self.transport.send(request).await.map_err(|e| {
            tracing::warn!(dependency = %url, error = %e, "remote store call failed");
            StorageError::Unavailable(e.to_string())
        })
    }

    /// Send and require a 2xx reply.
    pub async fn send_ok(&self, request: HttpRequest) -> Result<HttpReply, StorageError> {
        let reply = self.send(request).await?;
        if !reply.is_success() {
            return Err(StorageError::Rejected {
                status: reply.status,
            });
        }
        Ok(reply)
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: HttpRequest) -> Result<T, StorageError> {
        let reply = self.send_ok(request).await?;
        decode(&reply)
    }

    /// Like `send_json`, but 404 is `None`.
    pub async fn send_optional<T: DeserializeOwned>(
        &self,
        request: HttpRequest,
    ) -> Result<Option<T>, StorageError> {
        let reply = self.send(request).await?;
        match reply.status {
            404 => Ok(None),
            _ if reply.is_success() => decode(&reply).map(Some),
            status => Err(StorageError::Rejected { status }),
        }
    }
}

fn decode<T: DeserializeOwned>(reply: &HttpReply) -> Result<T, StorageError> {
    serde_json::from_str(&reply.body).map_err(StorageError::encoding)
}
