//! Out-of-Band Notifier
//!
//! Delivers events to listeners that opted out of ordered delivery. A single
//! dispatch loop pulls tasks from an unbounded queue, hands each one to the
//! runtime's blocking pool and waits for it for at most `join_timeout`. A task
//! that overruns is left to finish on its own; the loop moves on so that one
//! stalled listener cannot hold up the others.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

pub type OobTask = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(OobTask),
    /// Sentinel used by `shutdown` to wake a loop parked on an empty queue.
    Wake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotifierStats {
    pub started: u64,
    pub abandoned: u64,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    abandoned: AtomicU64,
}

pub struct OutOfBandNotifier {
    queue: mpsc::UnboundedSender<Message>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<Counters>,
    join_timeout: Duration,
}

impl OutOfBandNotifier {
    pub fn new(join_timeout: Duration) -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        Self {
            queue,
            pending: Mutex::new(Some(pending)),
            shutdown: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            join_timeout,
        }
    }

    /// Spawns the dispatch loop on `runtime`. Tasks submitted earlier are
    /// already queued and run once the loop starts.
    pub fn start(&self, runtime: &Handle) -> Result<()> {
        let Some(queue) = self.pending.lock().take() else {
            anyhow::bail!("out-of-band notifier already started");
        };

        runtime.spawn(dispatch_loop(
            queue,
            self.shutdown.clone(),
            self.counters.clone(),
            self.join_timeout,
        ));

        tracing::debug!(
            "Out-of-band notifier started (join timeout {:?})",
            self.join_timeout
        );
        Ok(())
    }

    pub fn submit(&self, task: OobTask) {
        if self.queue.send(Message::Run(task)).is_err() {
            tracing::trace!("Out-of-band notifier gone, dropping task");
        }
    }

    /// Stops dispatching queued tasks. A task already handed to a worker keeps
    /// running.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.queue.send(Message::Wake);
        tracing::debug!("Out-of-band notifier shutting down");
    }

    pub fn stats(&self) -> NotifierStats {
        NotifierStats {
            started: self.counters.started.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
        }
    }
}

async fn dispatch_loop(
    mut queue: mpsc::UnboundedReceiver<Message>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<Counters>,
    join_timeout: Duration,
) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let task = match queue.recv().await {
            Some(Message::Run(task)) => task,
            Some(Message::Wake) => continue,
            None => break,
        };

        let seq = counters.started.fetch_add(1, Ordering::Relaxed);
        let worker = tokio::task::spawn_blocking(task);

        // Dropping the JoinHandle on timeout detaches the worker; it is never
        // cancelled.
        match tokio::time::timeout(join_timeout, worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("Out-of-band task {} failed: {}", seq, e);
            }
            Err(_) => {
                counters.abandoned.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "Out-of-band task {} still running after {:?}, moving on",
                    seq,
                    join_timeout
                );
            }
        }
    }

    tracing::debug!("Out-of-band notifier stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runs_submitted_tasks() {
        let notifier = OutOfBandNotifier::new(Duration::from_millis(100));
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Submitted before start: must still run.
        let early = tx.clone();
        notifier.submit(Box::new(move || {
            let _ = early.send("early");
        }));
        notifier.start(&Handle::current()).unwrap();
        notifier.submit(Box::new(move || {
            let _ = tx.send("late");
        }));

        let mut seen = Vec::new();
        for _ in 0..2 {
            let value = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("task ran")
                .unwrap();
            seen.push(value);
        }
        seen.sort();
        assert_eq!(seen, vec!["early", "late"]);
        assert_eq!(notifier.stats().started, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_task_does_not_block_next() {
        let notifier = OutOfBandNotifier::new(Duration::from_millis(100));
        notifier.start(&Handle::current()).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let submitted = Instant::now();

        notifier.submit(Box::new(|| std::thread::sleep(Duration::from_millis(1500))));
        notifier.submit(Box::new(move || {
            let _ = tx.send(Instant::now());
        }));

        let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("second task ran")
            .unwrap();

        // One join timeout plus scheduling slack.
        assert!(delivered.duration_since(submitted) < Duration::from_millis(600));
        assert_eq!(notifier.stats().abandoned, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_stops_future_dispatch() {
        let notifier = OutOfBandNotifier::new(Duration::from_millis(100));
        notifier.start(&Handle::current()).unwrap();

        notifier.shutdown();
        notifier.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        notifier.submit(Box::new(move || {
            let _ = tx.send(());
        }));

        let outcome = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(!matches!(outcome, Ok(Some(()))), "no task may run after shutdown");
        assert_eq!(notifier.stats().started, 0);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let notifier = OutOfBandNotifier::new(Duration::from_millis(100));
        notifier.start(&Handle::current()).unwrap();
        assert!(notifier.start(&Handle::current()).is_err());
    }
}
