//! Periodic background tasks on the tokio runtime.
//!
//! Each registered task gets its own timer loop. Shutdown broadcasts a stop
//! signal that interrupts the wait between ticks; a cycle already running
//! finishes before its loop exits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{Error, Result};

/// Handed to a task for each cycle.
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

impl Context {
    /// True once shutdown has been signalled. Long cycles check this
    /// between units of work.
    pub fn is_shutting_down(&mut self) -> bool {
        !matches!(
            self.shutdown.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        )
    }
}

#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// Time between the starts of two cycles
    fn interval(&self) -> Duration;

    async fn execute(&self, ctx: Context) -> Result<()>;
}

pub struct Scheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Starts running `task` every `task.interval()`. The first cycle runs
    /// immediately.
    pub fn register(&self, task: Arc<dyn BackgroundTask>) -> Result<&Self> {
        let handle = self.spawn_timer_loop(task);
        self.tasks.lock()?.push(handle);
        Ok(self)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or_default()
    }

    fn spawn_timer_loop(&self, task: Arc<dyn BackgroundTask>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // A slow cycle delays the next one instead of bunching them up
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                run_id = run_id,
                                error = %e,
                                "Task execution failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), runs = run_id, "Task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Signals every task to stop and waits for their loops to exit.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        let handles: Vec<_> = self.tasks.lock()?.drain(..).collect();
        for handle in handles {
            handle
                .await
                .map_err(|e| Error::InvalidState(format!("Task join error: {}", e)))?;
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        interval: Duration,
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn execute(&self, _ctx: Context) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::InvalidState("cycle failed".to_string()));
            }
            Ok(())
        }
    }

    fn counting(interval_ms: u64, fail: bool) -> (Arc<CountingTask>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let task = Arc::new(CountingTask {
            interval: Duration::from_millis(interval_ms),
            runs: runs.clone(),
            fail,
        });
        (task, runs)
    }

    #[tokio::test]
    async fn test_task_runs_periodically() -> Result<()> {
        let scheduler = Scheduler::new();
        let (task, runs) = counting(10, false);
        scheduler.register(task)?;
        assert_eq!(scheduler.task_count(), 1);

        tokio::time::sleep(Duration::from_millis(55)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);

        scheduler.shutdown().await
    }

    #[tokio::test]
    async fn test_failing_cycle_does_not_stop_task() -> Result<()> {
        let scheduler = Scheduler::new();
        let (task, runs) = counting(10, true);
        scheduler.register(task)?;

        tokio::time::sleep(Duration::from_millis(55)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);

        scheduler.shutdown().await
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_wait() -> Result<()> {
        let scheduler = Scheduler::new();
        let (task, runs) = counting(60_000, false);
        scheduler.register(task)?;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = std::time::Instant::now();
        scheduler.shutdown().await?;
        assert!(start.elapsed() < Duration::from_secs(1));

        let after = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after);
        assert_eq!(after, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_context_sees_shutdown() {
        let (tx, rx) = broadcast::channel(1);
        let mut ctx = Context {
            task_name: "probe",
            run_id: 1,
            shutdown: rx,
        };
        assert!(!ctx.is_shutting_down());
        tx.send(()).ok();
        assert!(ctx.is_shutting_down());
    }
}
