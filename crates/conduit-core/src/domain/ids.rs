//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID + Phantom type
//! Interaction の ID は ULID を使います。生成器（`ports::id_generator`）が単調増加を
//! 保証するため、同じミリ秒内に作られた record 同士でも ID の大小で挿入順を復元できます。
//! retention の tie-break（timestamp desc, insertion desc）は remote backend ではこの性質に依存します。
//!
//! `GenerationId` だけは外部 collaborator が採番する正の整数なので ULID ではありません。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス（例: "ix-"）
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` は PhantomData で、実行時にはメモリを消費しません。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    /// Accepts both the prefixed display form and a bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

/// Interaction のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interaction {}

impl IdMarker for Interaction {
    fn prefix() -> &'static str {
        "ix-"
    }
}

/// Identifier of one stored interaction record.
pub type InteractionId = Id<Interaction>;

/// Identifier advertised by a content collaborator for one generation.
///
/// Always strictly positive; zero is rejected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct GenerationId(u64);

impl GenerationId {
    pub fn new(value: u64) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl TryFrom<u64> for GenerationId {
    type Error = String;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| "generation_id must be greater than zero".to_string())
    }
}

impl From<GenerationId> for u64 {
    fn from(id: GenerationId) -> Self {
        id.0
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interaction_id_displays_with_prefix_and_parses_back() {
        let id = InteractionId::from_ulid(Ulid::new());
        let shown = id.to_string();
        assert!(shown.starts_with("ix-"));

        let parsed: InteractionId = shown.parse().unwrap();
        assert_eq!(parsed, id);

        let bare: InteractionId = id.as_ulid().to_string().parse().unwrap();
        assert_eq!(bare, id);
    }

    #[test]
    fn interaction_id_serializes_as_bare_ulid_string() {
        let ulid = Ulid::new();
        let id = InteractionId::from_ulid(ulid);
        let v = serde_json::to_value(id).unwrap();
        assert_eq!(v, serde_json::Value::String(ulid.to_string()));
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        assert_eq!(std::mem::size_of::<InteractionId>(), std::mem::size_of::<Ulid>());
    }

    #[test]
    fn generation_id_rejects_zero() {
        assert!(GenerationId::new(0).is_none());
        assert_eq!(GenerationId::new(7).map(|g| g.get()), Some(7));

        let err = serde_json::from_value::<GenerationId>(serde_json::json!(0));
        assert!(err.is_err());
        let ok: GenerationId = serde_json::from_value(serde_json::json!(12)).unwrap();
        assert_eq!(ok.get(), 12);
    }
}
