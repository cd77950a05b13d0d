//! App - アプリケーション層
//!
//! ports を組み合わせて、1 リクエストの処理とその周辺を実装します。
//!
//! # 主要コンポーネント
//! - **GatewayBuilder**: 設定から `App` を組み立てる（fail-fast）
//! - **Gateway**: validate → resolve → invoke → normalize → append
//! - **Admission / SecurityValidator**: dispatch 前の検証
//! - **ResilientBridge**: 外部 collaborator 呼び出し（retry + fallback）
//! - **ReadinessAggregator**: readiness と diagnostics
//! - **NonceReaper**: 期限切れ nonce の定期削除

pub mod admission;
pub mod bridge;
pub mod builder;
pub mod config;
pub mod gateway;
pub mod handler;
pub mod locks;
pub mod readiness;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod security;
pub mod selector;

// 主要な型を再エクスポート
pub use self::admission::{Admission, RequestContext};
pub use self::bridge::{BridgeOperation, BridgeResponse, ResilientBridge};
pub use self::builder::{App, BuildError, GatewayBuilder};
pub use self::config::{ConfigError, GatewayConfig};
pub use self::gateway::{FeedbackReceipt, Gateway, GatewayLimits};
pub use self::handler::{Handler, HandlerContext, HandlerError, HandlerOutput};
pub use self::readiness::{Diagnostics, Readiness, ReadinessAggregator};
pub use self::reaper::NonceReaper;
pub use self::security::{SecurityContext, sign_envelope};
