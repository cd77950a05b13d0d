//! NonceReaper - freshness window を過ぎた nonce の定期削除
//!
//! - `shutdown_tx` に true を送ると止まる
//! - `shutdown_and_join()` でタスクの終了を待てる
//! - `NonceReaper` を drop した場合もタスクは止まる

use chrono::Duration;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ports::clock::Clock;
use crate::ports::nonce_store::NonceStore;

pub struct NonceReaper {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl NonceReaper {
    pub fn spawn(
        nonces: Arc<dyn NonceStore>,
        clock: Arc<dyn Clock>,
        drift: Duration,
        interval: std::time::Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        // sender が drop された（reaper ごと捨てられた）ら終了
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }
                match nonces.prune(clock.now() - drift).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "expired nonces reaped"),
                    Err(e) => tracing::warn!(error = %e, "nonce reaping failed"),
                }
            }
        });
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // receiver がすでに drop されていても問題ない
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::NonceRecord;
    use crate::impls::nonce_store::InMemoryNonceStore;
    use crate::ports::FixedClock;
    use crate::ports::nonce_store::NonceClaim;
    use crate::testing::caller;
    use chrono::{TimeZone, Utc};

    #[tokio::test(start_paused = true)]
    async fn expired_nonces_are_reaped_until_shutdown() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let nonces = Arc::new(InMemoryNonceStore::new());
        let record = NonceRecord {
            nonce: "n-1".to_string(),
            caller_id: caller("u1"),
            timestamp: t0,
        };
        let claim = nonces
            .claim(record, t0 - Duration::seconds(300))
            .await
            .unwrap();
        assert_eq!(claim, NonceClaim::Fresh);

        let reaper = NonceReaper::spawn(
            nonces.clone(),
            clock.clone(),
            Duration::seconds(300),
            std::time::Duration::from_secs(60),
        );
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        assert_eq!(nonces.len(), 1);

        clock.advance(Duration::seconds(301));
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        assert!(nonces.is_empty());

        reaper.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_reaper_stops_its_task() {
        let nonces = Arc::new(InMemoryNonceStore::new());
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        let reaper = NonceReaper::spawn(
            nonces,
            clock,
            Duration::seconds(300),
            std::time::Duration::from_secs(60),
        );
        let NonceReaper { shutdown_tx, join } = reaper;
        drop(shutdown_tx);

        tokio::time::timeout(std::time::Duration::from_secs(1), join)
            .await
            .expect("reaper task should exit once its sender is gone")
            .unwrap();
    }
}
