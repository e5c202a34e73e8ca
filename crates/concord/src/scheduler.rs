//! Timers owned by one node runtime.
//!
//! A fired timer does not run code; it posts a command back into the
//! node's queue so the work happens on the node's event task. Dropping or
//! shutting down the scheduler aborts every outstanding timer.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

pub struct Scheduler<T> {
    tx: mpsc::Sender<T>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> Scheduler<T> {
    pub fn new(tx: mpsc::Sender<T>) -> Self {
        Self {
            tx,
            tasks: Vec::new(),
        }
    }

    /// Post `cmd` once after `delay`.
    pub fn schedule_once(&mut self, delay: Duration, cmd: T) {
        self.prune();
        let tx = self.tx.clone();
        self.tasks.push(tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(cmd).await;
        }));
    }

    /// Post a command built by `make` every `period`, first after one period.
    pub fn schedule_repeating<F>(&mut self, period: Duration, make: F)
    where
        F: Fn() -> T + Send + 'static,
    {
        self.prune();
        let tx = self.tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(make()).await.is_err() {
                    break;
                }
            }
        }));
    }

    /// Number of timers still pending.
    pub fn pending(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Abort every outstanding timer.
    pub fn shutdown(&mut self) {
        debug!("scheduler: cancelling {} timers", self.pending());
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn prune(&mut self) {
        self.tasks.retain(|t| !t.is_finished());
    }
}

impl<T> Drop for Scheduler<T> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schedule_once() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut scheduler = Scheduler::new(tx);
        scheduler.schedule_once(Duration::from_millis(10), 7u32);
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_schedule_repeating() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut scheduler = Scheduler::new(tx);
        scheduler.schedule_repeating(Duration::from_millis(5), || "tick");
        for _ in 0..3 {
            assert_eq!(rx.recv().await, Some("tick"));
        }
        scheduler.shutdown();
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut scheduler = Scheduler::new(tx);
        scheduler.schedule_once(Duration::from_millis(50), 1u32);
        scheduler.shutdown();
        drop(scheduler);
        // Every sender is gone once the aborted task is dropped.
        assert_eq!(rx.recv().await, None);
    }
}
