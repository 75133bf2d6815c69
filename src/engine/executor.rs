//! Background worker for flush and failure jobs.
//!
//! Post-merge flushes and deferred engine failures must never run on the
//! thread that finished the merge, so they are handed to a dedicated worker
//! fed by an unbounded channel. The worker drains remaining jobs and exits
//! once every sender is gone.

use std::thread;

use crossbeam_channel::{unbounded, Sender};
use log::debug;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single background worker thread.
#[derive(Debug, Clone)]
pub(crate) struct FlushExecutor {
    sender: Sender<Job>,
}

impl FlushExecutor {
    pub(crate) fn new(name: &str) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let thread_name = format!("tsurugi-{name}");
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn {thread_name}: {e}"));
        FlushExecutor { sender }
    }

    /// Submit a job. Jobs submitted after shutdown are dropped.
    pub(crate) fn execute(&self, job: Job) {
        if self.sender.send(job).is_err() {
            debug!("background job rejected, executor is shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_off_the_submitting_thread() {
        let executor = FlushExecutor::new("test");
        let ran = Arc::new(AtomicUsize::new(0));
        let submitter = thread::current().id();

        for _ in 0..4 {
            let ran = ran.clone();
            executor.execute(Box::new(move || {
                assert_ne!(thread::current().id(), submitter);
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }

        for _ in 0..100 {
            if ran.load(Ordering::SeqCst) == 4 {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("background jobs did not run");
    }
}
