//! Eat-what-you-kill execution strategy.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::executor::{Executor, Job};

/// Source of the jobs driven by an execution strategy. A producer never
/// idles: [`Producer::produce`] either returns a job or blocks until one is
/// available, and returns `None` only once the source is exhausted.
///
/// The entire producer state lives in its fields so the produce duty can
/// migrate between threads between calls.
pub trait Producer: Send + 'static {
    fn produce(&mut self) -> Option<Box<dyn Job>>;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Idle,
    Producing,
    /// A produce request arrived while another thread was already producing;
    /// the current producer loops once more instead.
    Pending,
}

/// Runs a [`Producer`] so that produced jobs execute on the thread that
/// produced them: before running a job, the produce duty is handed to a pool
/// thread, keeping I/O processing cache-hot while production continues
/// elsewhere. If the pool rejects the handoff the calling thread takes the
/// duty back after running the job.
///
/// At most one thread executes [`Producer::produce`] at any instant.
pub struct EatWhatYouKill<P: Producer> {
    producer: Mutex<P>,
    state: Mutex<State>,
    executor: Arc<dyn Executor>,
}

impl<P: Producer> EatWhatYouKill<P> {
    pub fn new(producer: P, executor: Arc<dyn Executor>) -> Arc<EatWhatYouKill<P>> {
        Arc::new(Self {
            producer: Mutex::new(producer),
            state: Mutex::new(State::Idle),
            executor,
        })
    }

    pub(crate) fn with_producer<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut self.producer.lock())
    }

    /// Runs the production loop on the calling thread until the producer runs
    /// dry or the duty has been handed to a pool thread.
    pub fn produce(self: &Arc<Self>) {
        if !self.try_produce() {
            return;
        }
        self.producing_loop();
    }

    fn try_produce(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            State::Idle => {
                *state = State::Producing;
                true
            }
            State::Producing => {
                *state = State::Pending;
                false
            }
            State::Pending => false,
        }
    }

    fn producing_loop(self: &Arc<Self>) {
        loop {
            let job = self.producer.lock().produce();
            let Some(job) = job else {
                let mut state = self.state.lock();
                if *state == State::Pending {
                    *state = State::Producing;
                    continue;
                }
                *state = State::Idle;
                return;
            };

            // hand the produce duty to a pool thread, eat the job here
            *self.state.lock() = State::Idle;
            let duty = {
                let this = Arc::clone(self);
                Box::new(move || this.produce())
            };
            let handed = self.executor.execute(duty).is_ok();
            job.run();
            if handed {
                return;
            }
            // the pool rejected the handoff; take the duty back
            if !self.try_produce() {
                return;
            }
        }
    }
}
