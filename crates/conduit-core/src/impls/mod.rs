//! Implementations of the ports (storage backends, nonce stores, HTTP) and
//! the builtin handlers.

pub mod document_store;
pub mod handlers;
pub mod http_transport;
pub mod nonce_store;
pub mod proxy_store;
pub mod remote;
pub mod sqlite_store;

pub use self::document_store::DocumentRetentionStore;
pub use self::http_transport::ReqwestTransport;
pub use self::nonce_store::{InMemoryNonceStore, SqliteNonceStore};
pub use self::proxy_store::ProxyRetentionStore;
pub use self::remote::RemoteJson;
pub use self::sqlite_store::SqliteRetentionStore;
