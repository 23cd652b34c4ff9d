//! Tick sources that pace the expiry worker.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Something the worker can wait on between cycles. `tick` must be
/// cancel-safe; the worker races it against the shutdown signal.
#[async_trait]
pub trait Ticker: Send {
    async fn tick(&mut self);
}

/// Fires every `period`, first one full period after creation. Ticks
/// missed while a cycle runs long are skipped rather than bunched up.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Ticks only when told to through its [`TickHandle`].
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

#[derive(Clone)]
pub struct TickHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl ManualTicker {
    pub fn new() -> (Self, TickHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, TickHandle { tx })
    }
}

impl TickHandle {
    /// Queue one tick. Returns false once the ticker is gone.
    pub fn tick(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) {
        // With every handle dropped no tick can ever arrive.
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_ticker_fires_per_handle_call() {
        let (mut ticker, handle) = ManualTicker::new();
        assert!(handle.tick());
        assert!(handle.tick());

        tokio::time::timeout(Duration::from_secs(1), ticker.tick())
            .await
            .expect("first tick");
        tokio::time::timeout(Duration::from_secs(1), ticker.tick())
            .await
            .expect("second tick");
        let third = tokio::time::timeout(Duration::from_millis(20), ticker.tick()).await;
        assert!(third.is_err(), "no tick was queued");
    }

    #[tokio::test]
    async fn test_manual_ticker_without_handles_never_fires() {
        let (mut ticker, handle) = ManualTicker::new();
        drop(handle);
        let result = tokio::time::timeout(Duration::from_millis(20), ticker.tick()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_interval_ticker_waits_one_period() {
        let started = Instant::now();
        let mut ticker = IntervalTicker::new(Duration::from_millis(30));
        ticker.tick().await;
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
