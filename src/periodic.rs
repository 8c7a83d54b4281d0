//! Cooperative periodic tasks.
//!
//! A `Ticker` runs an async closure on a fixed period inside its own tokio task. It lives exactly
//! as long as the activity it serves: `start` when the activity begins, `stop` when it ends. The
//! closure may also end the ticker itself by returning `ControlFlow::Break`.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

pub struct Ticker {
    name: String,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Starts ticking. The first tick fires after one full `period`.
    pub fn start<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        if tick().await.is_break() {
                            tracing::debug!(ticker = %task_name, "Ticker finished on its own");
                            break;
                        }
                    }
                }
            }
        });
        tracing::debug!(ticker = %name, ?period, "Ticker started");
        Self {
            name,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops ticking and waits for an in-progress tick to complete.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            // The task may already have ended on its own.
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(ticker = %self.name, error = %e, "Ticker task ended abnormally");
            }
        }
        tracing::debug!(ticker = %self.name, "Ticker stopped");
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ticker_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let count = Arc::clone(&count);
            Ticker::start("count", Duration::from_millis(5), move || {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    ControlFlow::Continue(())
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        ticker.stop().await;
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "only {} ticks", seen);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_ticker_breaks_on_its_own() {
        let count = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let count = Arc::clone(&count);
            Ticker::start("three", Duration::from_millis(2), move || {
                let count = Arc::clone(&count);
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                }
            })
        };
        tokio::time::timeout(Duration::from_secs(1), async {
            while !ticker.is_finished() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        ticker.stop().await;
    }
}
