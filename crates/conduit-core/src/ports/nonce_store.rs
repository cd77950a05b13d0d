//! NonceStore port - anti-replay 用の nonce 台帳
//!
//! `claim` は check-and-insert を一つの操作として行います。同じ caller の古い
//! nonce（cutoff より前）は claim のたびに掃除されます。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::record::NonceRecord;
use crate::ports::retention_store::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceClaim {
    Fresh,
    Replayed,
}

#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Record the nonce unless the caller already used it after `cutoff`.
    async fn claim(
        &self,
        record: NonceRecord,
        cutoff: DateTime<Utc>,
    ) -> Result<NonceClaim, StorageError>;

    /// Remove every nonce older than `cutoff`; returns how many were removed.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;
}
