//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース、プロセス内で単調増加

use crate::domain::ids::InteractionId;
use crate::ports::Clock;
use std::sync::Mutex;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_interaction_id(&self) -> InteractionId;
}

/// UlidGenerator は Clock の時刻で ULID を作ります。
///
/// 直前に払い出した ID 以下になる場合（同一ミリ秒、時計の巻き戻り）は直前の ID を
/// インクリメントして返すので、払い出し順 = ID の大小順が常に成り立ちます。
pub struct UlidGenerator<C> {
    clock: C,
    last: Mutex<Option<Ulid>>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            last: Mutex::new(None),
        }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let candidate = Ulid::from_parts(timestamp_ms, rand::random());

        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = match *last {
            Some(prev) if candidate <= prev => prev.increment().unwrap_or(candidate),
            _ => candidate,
        };
        *last = Some(next);
        next
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_interaction_id(&self) -> InteractionId {
        InteractionId::from(self.next_ulid())
    }
}
