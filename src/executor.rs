//! Worker pool contract used to run produced tasks off the selector thread.

use std::thread::{self, JoinHandle};

use crossbeam_channel as chan;
use log::debug;
use parking_lot::Mutex;

/// Unit of work handed to an [`Executor`].
pub trait Job: Send + 'static {
    fn run(self: Box<Self>);

    /// Invoked instead of [`Job::run`] when the job is dropped without being
    /// executed, e.g. on executor rejection. Jobs holding resources use this
    /// to close them.
    fn discard(self: Box<Self>) {}
}

impl<F: FnOnce() + Send + 'static> Job for F {
    fn run(self: Box<Self>) {
        (*self)()
    }
}

/// Task executor shared by all selectors of a manager.
pub trait Executor: Send + Sync + 'static {
    /// Hands `job` to a worker thread. Once the executor is shut down the job
    /// is returned to the caller, which is expected to discard it.
    fn execute(&self, job: Box<dyn Job>) -> Result<(), Box<dyn Job>>;
}

/// Fixed-size worker pool backed by an unbounded channel.
pub struct ThreadPool {
    sender: Mutex<Option<chan::Sender<Box<dyn Job>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(threads: usize) -> ThreadPool {
        let (sender, receiver) = chan::unbounded::<Box<dyn Job>>();
        let workers = (0..threads.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("selnet-pool-{i}"))
                    .spawn(move || {
                        for job in receiver.iter() {
                            job.run();
                        }
                    })
                    .expect("unable to spawn pool worker")
            })
            .collect();
        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Stops accepting jobs, lets the workers drain the queue and joins them.
    /// Idempotent.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        debug!("thread pool shutting down");
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if thread::current().id() != worker.thread().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Box<dyn Job>) -> Result<(), Box<dyn Job>> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).map_err(|err| err.0),
            None => Err(job),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
