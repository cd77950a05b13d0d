//! conduit-core
//!
//! Gateway kernel: 検証済みのリクエストを handler に振り分け、結果を正規化して
//! (caller, handler) ごとに上限付きで保存します。
//!
//! # モジュール構成
//! - **domain**: envelope, record, response, feedback, errors, ids
//! - **ports**: 抽象化レイヤー（RetentionStore, NonceStore, HttpTransport, Clock, IdGenerator）
//! - **impls**: 実装（SQLite, document API, proxy, reqwest, builtin handlers）
//! - **app**: gateway, builder, security, bridge, readiness
//! - **observability**: tracing の初期化とリクエストカウンタ

pub mod app;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;

#[cfg(test)]
mod testing;
