//! Timer-driven background tasks with explicit shutdown

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use mnemos_core::Result;

#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &str;

    /// Time between ticks.
    fn interval(&self) -> Duration;

    async fn tick(&self, now: DateTime<Utc>) -> Result<()>;
}

/// Owns the background tasks of one engine. Dropping the scheduler without
/// calling [`shutdown`](Self::shutdown) aborts them.
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Run `task` every `task.interval()`, starting one interval from now.
    pub fn schedule(&self, task: Arc<dyn ScheduledTask>) {
        let shutdown = self.shutdown_signal();
        info!(
            "[scheduler] {} every {}s",
            task.name(),
            task.interval().as_secs()
        );
        self.spawn(run_periodic(task, shutdown));
    }

    /// Track an arbitrary background future so shutdown waits for it.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.lock().push(tokio::spawn(future));
    }

    pub fn task_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Signal every task and wait for them to finish their current tick.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("[scheduler] task ended abnormally: {}", e);
            }
        }
        info!("[scheduler] stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

async fn run_periodic(task: Arc<dyn ScheduledTask>, mut shutdown: watch::Receiver<bool>) {
    let period = task.interval().max(Duration::from_millis(1));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                debug!("[scheduler] tick {}", task.name());
                if let Err(e) = task.tick(Utc::now()).await {
                    warn!("[scheduler] {} failed: {}", task.name(), e);
                }
            }
        }
    }
    debug!("[scheduler] {} stopped", task.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        ticks: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ScheduledTask for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn tick(&self, _now: DateTime<Utc>) -> Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(mnemos_core::MemoryError::Backend("boom".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ticks_until_shutdown() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(Counter {
            ticks: AtomicUsize::new(0),
            fail: false,
        });
        scheduler.schedule(counter.clone());
        assert_eq!(scheduler.task_count(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.shutdown().await;
        let seen = counter.ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "only {} ticks", seen);
        assert!(scheduler.is_shutting_down());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counter.ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_failing_task_keeps_ticking() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(Counter {
            ticks: AtomicUsize::new(0),
            fail: true,
        });
        scheduler.schedule(counter.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.shutdown().await;
        assert!(counter.ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_spawned_futures() {
        let scheduler = Scheduler::new();
        let mut signal = scheduler.shutdown_signal();
        let done = Arc::new(AtomicUsize::new(0));
        let flag = done.clone();
        scheduler.spawn(async move {
            let _ = signal.changed().await;
            flag.store(1, Ordering::SeqCst);
        });
        scheduler.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
