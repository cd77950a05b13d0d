//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（SQLite, リモートの document API, HTTP collaborator）
//! へのインターフェースを提供し、実装の詳細を隠蔽します。

pub mod clock;
pub mod http;
pub mod id_generator;
pub mod nonce_store;
pub mod retention_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::http::{HttpMethod, HttpReply, HttpRequest, HttpTransport, TransportError};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::nonce_store::{NonceClaim, NonceStore};
pub use self::retention_store::{
    BackendKind, RetentionGuarantee, RetentionStore, StorageError, StoreStats,
};
