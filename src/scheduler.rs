// System
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, PoisonError};

// Third Party
use futures::future::{self, FutureExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error};

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Job {
    deadline: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Runs one-shot delayed tasks on a single worker task.
///
/// Tasks never overlap: the worker awaits each task to completion before it looks at the next
/// due one, so two retries can never race each other. A panicking task is logged and does not
/// take the worker down.
pub struct RetryScheduler {
    sender: mpsc::UnboundedSender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
    next_seq: AtomicU64,
}

impl RetryScheduler {
    /// Spawns the worker. Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run(receiver));
        Self {
            sender,
            worker: Mutex::new(Some(worker)),
            shut_down: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Run `task` once after `delay`. Returns false if the scheduler has been shut down, in which
    /// case the task is dropped without running.
    pub fn schedule_once<F>(&self, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            debug!("Scheduler is shut down, dropping task");
            return false;
        }
        let job = Job {
            deadline: Instant::now() + delay,
            seq: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
            task: Box::pin(task),
        };
        self.sender.send(job).is_ok()
    }

    /// Drop every pending task and stop the worker without waiting for a running task to finish.
    pub fn shutdown_now(&self) {
        if self.shut_down.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.abort();
        }
        debug!("Retry scheduler shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(AtomicOrdering::SeqCst)
    }

    async fn run(mut receiver: mpsc::UnboundedReceiver<Job>) {
        let mut pending: BinaryHeap<Reverse<Job>> = BinaryHeap::new();
        loop {
            let next_deadline = pending.peek().map(|Reverse(job)| job.deadline);
            let due = async move {
                match next_deadline {
                    Some(deadline) => time::sleep_until(deadline).await,
                    None => future::pending::<()>().await,
                }
            };

            tokio::select! {
                received = receiver.recv() => match received {
                    Some(job) => pending.push(Reverse(job)),
                    None => break,
                },
                _ = due => {
                    if let Some(Reverse(job)) = pending.pop() {
                        if AssertUnwindSafe(job.task).catch_unwind().await.is_err() {
                            error!("Scheduled task panicked");
                        }
                    }
                }
            }
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

#[cfg(test)]
mod tests {
    // System
    use std::sync::{Arc, Mutex};

    // Third Party
    use tokio::time::{self, Duration};

    // Local
    use super::RetryScheduler;

    #[tokio::test(start_paused = true)]
    async fn test_runs_task_after_delay() {
        let scheduler = RetryScheduler::new();
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        assert!(scheduler.schedule_once(Duration::from_secs(5), async move {
            *flag.lock().unwrap() = true;
        }));

        time::sleep(Duration::from_millis(4_900)).await;
        assert!(!*ran.lock().unwrap());
        time::sleep(Duration::from_millis(200)).await;
        assert!(*ran.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_tasks_in_deadline_order() {
        let scheduler = RetryScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, secs) in [("late", 3), ("early", 1), ("middle", 2)] {
            let order = order.clone();
            scheduler.schedule_once(Duration::from_secs(secs), async move {
                order.lock().unwrap().push(name);
            });
        }

        time::sleep(Duration::from_secs(4)).await;
        assert_eq!(*order.lock().unwrap(), vec!["early", "middle", "late"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_do_not_overlap() {
        let scheduler = RetryScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..2 {
            let log = log.clone();
            scheduler.schedule_once(Duration::from_secs(1), async move {
                log.lock().unwrap().push(format!("begin {}", id));
                time::sleep(Duration::from_secs(2)).await;
                log.lock().unwrap().push(format!("end {}", id));
            });
        }

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["begin 0", "end 0", "begin 1", "end 1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_does_not_kill_worker() {
        let scheduler = RetryScheduler::new();
        scheduler.schedule_once(Duration::from_secs(1), async {
            panic!("boom");
        });
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        scheduler.schedule_once(Duration::from_secs(2), async move {
            *flag.lock().unwrap() = true;
        });

        time::sleep(Duration::from_secs(3)).await;
        assert!(*ran.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_pending_tasks() {
        let scheduler = RetryScheduler::new();
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        scheduler.schedule_once(Duration::from_secs(5), async move {
            *flag.lock().unwrap() = true;
        });

        time::sleep(Duration::from_secs(1)).await;
        scheduler.shutdown_now();
        scheduler.shutdown_now();
        assert!(scheduler.is_shut_down());

        time::sleep(Duration::from_secs(10)).await;
        assert!(!*ran.lock().unwrap());
        assert!(!scheduler.schedule_once(Duration::from_secs(1), async {}));
    }
}
