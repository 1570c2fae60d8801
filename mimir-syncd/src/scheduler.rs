use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Tick = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A fixed-period timer that can be stopped or restarted with a new period.
///
/// Ticks run inline on the timer task, so one timer never overlaps itself. The first tick fires
/// one full period after start.
pub struct RepeatingTask {
    name: &'static str,
    period: Duration,
    tick: Tick,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    pub fn start<F, Fut>(name: &'static str, period: Duration, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let tick: Tick = Arc::new(move || Box::pin(tick()));
        Self::spawn(name, period, tick)
    }

    fn spawn(name: &'static str, period: Duration, tick: Tick) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_tick = Arc::clone(&tick);
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = task_tick() => {}
                        }
                    }
                }
            }
        });
        debug!(timer = name, period_ms = period.as_millis() as u64, "timer started");
        Self {
            name,
            period,
            tick,
            cancel,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Cancels the timer and waits for its task to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
        debug!(timer = self.name, "timer stopped");
    }

    /// Stops the old timer before starting one with `period`, so the two never both fire.
    pub async fn restart(self, period: Duration) -> Self {
        let name = self.name;
        let tick = Arc::clone(&self.tick);
        self.stop().await;
        Self::spawn(name, period, tick)
    }
}
