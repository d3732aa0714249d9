//! Single-thread delayed task runner.
//!
//! ```text
//! schedule_after() --cmd--> [scheduler thread] --runs--> task()
//!                           min-heap by due time
//! ```
//!
//! Tasks run one at a time on the scheduler thread, earliest due first and in
//! submission order for equal deadlines. A panicking task is logged and the
//! thread keeps going.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run a task after a delay.
pub trait RetryTimer: Send + Sync {
    fn schedule_after(&self, delay: Duration, task: Task);
}

enum Command {
    Schedule { due: Instant, task: Task },
    Shutdown,
}

struct Entry {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap and we want the earliest first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

#[derive(Clone)]
pub struct Scheduler {
    tx: Sender<Command>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn start() -> io::Result<Self> {
        let (tx, rx) = unbounded();
        let handle = thread::Builder::new()
            .name("rackcast-scheduler".into())
            .spawn(move || run(rx))?;
        Ok(Self {
            tx,
            worker: Arc::new(Mutex::new(Some(handle))),
        })
    }

    pub fn schedule_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        self.schedule_at(Instant::now() + delay, task);
    }

    pub fn schedule_at(&self, due: Instant, task: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Command::Schedule {
            due,
            task: Box::new(task),
        });
    }

    /// Stop the thread. Pending tasks are dropped without running.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        // A task shutting down its own scheduler cannot join itself.
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

impl RetryTimer for Scheduler {
    fn schedule_after(&self, delay: Duration, task: Task) {
        Scheduler::schedule_after(self, delay, task);
    }
}

fn run(rx: Receiver<Command>) {
    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
    let mut seq: u64 = 0;

    loop {
        let command = match heap.peek() {
            None => match rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => return,
            },
            Some(next) => {
                let now = Instant::now();
                if next.due <= now {
                    None
                } else {
                    match rx.recv_timeout(next.due - now) {
                        Ok(cmd) => Some(cmd),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            }
        };

        match command {
            Some(Command::Schedule { due, task }) => {
                heap.push(Entry { due, seq, task });
                seq += 1;
            }
            Some(Command::Shutdown) => {
                debug!(pending = heap.len(), "scheduler stopping");
                return;
            }
            None => {
                let now = Instant::now();
                while heap.peek().is_some_and(|e| e.due <= now) {
                    if let Some(entry) = heap.pop() {
                        run_task(entry.task);
                    }
                }
            }
        }
    }
}

fn run_task(task: Task) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".into());
        error!("scheduled task panicked: {}", message);
    }
}
