//! Managed selector: the non-blocking I/O event dispatch core.
//!
//! A [`ManagedSelector`] wraps one OS readiness multiplexer and runs the
//! select loop that waits on it, dispatching readiness to the endpoints
//! attached to each registered channel. Mutations of multiplexer state are
//! submitted as [`SelectorUpdate`]s from any thread and applied by the loop
//! between waits. Produced per-key jobs are executed through the
//! eat-what-you-kill strategy so the I/O processing thread stays cache-hot.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Local;
use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::endpoint::EndPoint;
use crate::executor::Job;
use crate::manager::SelectorManager;
use crate::mux::{Multiplexer, Waker};
use crate::ops::{Ops, Token};

mod producer;
pub mod strategy;
mod update;

pub use self::update::{Accept, Acceptor, CloseConnections, Connect, SelectorUpdate};

use self::producer::SelectorProducer;
use self::strategy::EatWhatYouKill;
use self::update::{AttachEndPoint, CancelKey, ConnectState, DumpKeys, Start, StopSelector};

const DUMP_TIMEOUT: Duration = Duration::from_secs(5);

// lifecycle states; a stopped selector is not reusable
const NEW: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const STOPPING: u8 = 3;
const STOPPED: u8 = 4;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("selector is closed")]
    Closed,
    #[error("selector already started")]
    AlreadyStarted,
    #[error("executor rejected the selector producer")]
    StartRejected,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One managed selector instance. Cheap to clone; all clones share the same
/// selector.
pub struct ManagedSelector<M: SelectorManager> {
    inner: Arc<Inner<M>>,
}

struct Inner<M: SelectorManager> {
    manager: Arc<M>,
    id: u32,
    queue: Mutex<Queue<M>>,
    lifecycle: AtomicU8,
    key_count: AtomicUsize,
    strategy: OnceLock<Arc<EatWhatYouKill<SelectorProducer<M>>>>,
}

struct Queue<M: SelectorManager> {
    updates: VecDeque<Box<dyn SelectorUpdate<M>>>,
    /// True while the loop is blocked in the multiplexer wait. Guarded by the
    /// queue lock so concurrent submits collapse into a single wakeup.
    selecting: bool,
    waker: Option<Arc<dyn Waker>>,
}

impl<M: SelectorManager> Clone for ManagedSelector<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: SelectorManager> ManagedSelector<M> {
    pub fn new(manager: Arc<M>, id: u32) -> ManagedSelector<M> {
        let selector = ManagedSelector {
            inner: Arc::new(Inner {
                manager,
                id,
                queue: Mutex::new(Queue {
                    updates: VecDeque::new(),
                    selecting: false,
                    waker: None,
                }),
                lifecycle: AtomicU8::new(NEW),
                key_count: AtomicUsize::new(0),
                strategy: OnceLock::new(),
            }),
        };
        let executor = selector.inner.manager.executor();
        let producer = SelectorProducer::new(selector.clone());
        let _ = selector
            .inner
            .strategy
            .set(EatWhatYouKill::new(producer, executor));
        selector
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.load(Ordering::Acquire) == RUNNING
    }

    /// Best-effort count of live keys.
    pub fn size(&self) -> usize {
        self.inner.key_count.load(Ordering::Acquire)
    }

    /// Initialises the multiplexer, hands the producer to the worker pool and
    /// waits until the loop has observed the start. The selector is running
    /// once this returns.
    pub fn start(&self) -> Result<(), SelectorError> {
        if self
            .inner
            .lifecycle
            .compare_exchange(NEW, STARTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SelectorError::AlreadyStarted);
        }
        match self.do_start() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.lifecycle.store(STOPPED, Ordering::Release);
                Err(err)
            }
        }
    }

    fn do_start(&self) -> Result<(), SelectorError> {
        let mux = self.inner.manager.new_multiplexer()?;
        let waker = mux.waker();
        let strategy = self.strategy();
        strategy.with_producer(|producer| producer.install(mux));
        self.inner.queue.lock().waker = Some(waker);

        debug!("starting {}", self);
        // the producer never idles: it either produces a job or blocks in the
        // multiplexer wait
        let produce = {
            let strategy = Arc::clone(strategy);
            Box::new(move || strategy.produce())
        };
        if self.inner.manager.executor().execute(produce).is_err() {
            return Err(SelectorError::StartRejected);
        }

        let start = Start::new();
        let started = start.latch();
        self.submit(Box::new(start))?;
        // the latch guarantees the loop is running before start returns
        started.wait();
        Ok(())
    }

    /// Stops the selector: one wait cycle to close connections, then one to
    /// release the multiplexer. A second stop, or a stop of a selector that
    /// never ran, returns immediately.
    pub fn stop(&self) -> Result<(), SelectorError> {
        if self
            .inner
            .lifecycle
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        debug!("stopping {}", self);

        let close = CloseConnections::new();
        let complete = close.complete_latch();
        self.submit(Box::new(close))?;
        complete.wait();

        let stop = StopSelector::new();
        let stopped = stop.latch();
        self.submit(Box::new(stop))?;
        stopped.wait();

        self.inner.lifecycle.store(STOPPED, Ordering::Release);
        Ok(())
    }

    /// Enqueues `update` to be applied between multiplexer waits. Safe from
    /// any thread; wakes the loop only when it is blocked in the wait.
    pub fn submit(&self, update: Box<dyn SelectorUpdate<M>>) -> Result<(), SelectorError> {
        if self.inner.lifecycle.load(Ordering::Acquire) == STOPPED {
            return Err(SelectorError::Closed);
        }
        debug!("queued change {:?} on {}", update, self);
        let waker = {
            let mut queue = self.inner.queue.lock();
            queue.updates.push_back(update);
            if queue.selecting {
                queue.selecting = false;
                queue.waker.clone()
            } else {
                None
            }
        };
        if let Some(waker) = waker {
            debug!("wakeup on submit {}", self);
            if let Err(err) = waker.wake() {
                warn!("unable to wake selector {}: {}", self.inner.id, err);
            }
        }
        Ok(())
    }

    /// Cancels the key identified by `token` and dispatches destruction of
    /// its endpoint on a worker. Waking the loop promptly flushes the
    /// cancelled key so the peer observes the close.
    pub fn destroy_end_point(&self, token: Token, cause: Option<io::Error>) {
        debug!("destroying endpoint on key {} of {}", token, self);
        let _ = self.submit(Box::new(CancelKey::new(token, cause)));
    }

    /// Coherent point-in-time dump of the pending updates and the key set.
    pub fn dump(&self, out: &mut dyn io::Write, indent: &str) -> io::Result<()> {
        writeln!(out, "{indent}{self}")?;
        if self.inner.lifecycle.load(Ordering::Acquire) != RUNNING {
            return Ok(());
        }

        let dump = DumpKeys::new();
        let updates_at = Local::now().to_rfc3339();
        let (updates, waker) = {
            let mut queue = self.inner.queue.lock();
            let updates: Vec<String> = queue
                .updates
                .iter()
                .map(|update| format!("{update:?}"))
                .collect();
            // head of the queue so the next wake drains it immediately
            queue.updates.push_front(Box::new(dump.clone()));
            queue.selecting = false;
            (updates, queue.waker.clone())
        };
        debug!("wakeup on dump {}", self);
        if let Some(waker) = waker {
            if let Err(err) = waker.wake() {
                warn!("unable to wake selector {}: {}", self.inner.id, err);
            }
        }
        let keys = dump
            .get(DUMP_TIMEOUT)
            .unwrap_or_else(|| vec!["no dump keys retrieved".to_string()]);
        let keys_at = Local::now().to_rfc3339();

        writeln!(out, "{indent}+- updates @ {updates_at}")?;
        for update in &updates {
            writeln!(out, "{indent}|  +- {update}")?;
        }
        writeln!(out, "{indent}+- keys @ {keys_at}")?;
        for key in &keys {
            writeln!(out, "{indent}   +- {key}")?;
        }
        Ok(())
    }

    /// Wakes the loop only if it is blocked in the multiplexer wait.
    /// Concurrent callers collapse into a single wake signal.
    pub fn wakeup(&self) {
        let waker = {
            let mut queue = self.inner.queue.lock();
            if queue.selecting {
                queue.selecting = false;
                queue.waker.clone()
            } else {
                None
            }
        };
        if let Some(waker) = waker {
            debug!("wakeup {}", self);
            if let Err(err) = waker.wake() {
                warn!("unable to wake selector {}: {}", self.inner.id, err);
            }
        }
    }

    /// Hands `job` to the manager's executor, discarding it on rejection.
    pub(crate) fn execute(&self, job: Box<dyn Job>) {
        if let Err(job) = self.inner.manager.executor().execute(job) {
            job.discard();
        }
    }

    /// Creates the endpoint and connection for the key `token` and installs
    /// the endpoint on it. Runs on worker threads.
    pub(crate) fn create_end_point(
        &self,
        channel: &Arc<M::Channel>,
        token: Token,
        context: M::Context,
    ) -> io::Result<Arc<M::EndPoint>> {
        let manager = self.manager();
        let endpoint = manager.new_end_point(Arc::clone(channel), self.clone(), token)?;
        let connection = manager.new_connection(channel, &endpoint, context)?;
        endpoint.set_connection(Arc::clone(&connection));
        self.submit(Box::new(AttachEndPoint::new(token, Arc::clone(&endpoint))))
            .map_err(io::Error::other)?;
        manager.end_point_opened(&endpoint);
        manager.connection_opened(&connection);
        Ok(endpoint)
    }

    fn strategy(&self) -> &Arc<EatWhatYouKill<SelectorProducer<M>>> {
        self.inner
            .strategy
            .get()
            .expect("strategy installed at construction")
    }

    pub(crate) fn mark_running(&self) {
        self.inner.lifecycle.store(RUNNING, Ordering::Release);
    }

    pub(crate) fn clear_waker(&self) {
        self.inner.queue.lock().waker = None;
    }

    pub(crate) fn clear_selecting(&self) {
        self.inner.queue.lock().selecting = false;
    }

    /// Exchanges the pending updates with the producer-owned auxiliary deque
    /// so they can be applied without holding the lock.
    pub(crate) fn swap_updates(&self, updateable: &mut VecDeque<Box<dyn SelectorUpdate<M>>>) {
        let mut queue = self.inner.queue.lock();
        std::mem::swap(&mut queue.updates, updateable);
    }

    /// Returns true when more updates arrived while the last batch was being
    /// applied; otherwise marks the loop as selecting.
    pub(crate) fn finish_updates(&self) -> bool {
        let mut queue = self.inner.queue.lock();
        if queue.updates.is_empty() {
            queue.selecting = true;
            false
        } else {
            true
        }
    }

    fn pending_updates(&self) -> usize {
        self.inner.queue.lock().updates.len()
    }

    fn key_added(&self) {
        self.inner.key_count.fetch_add(1, Ordering::AcqRel);
    }

    fn key_removed(&self) {
        self.inner.key_count.fetch_sub(1, Ordering::AcqRel);
    }

    fn keys_cleared(&self) {
        self.inner.key_count.store(0, Ordering::Release);
    }
}

impl<M: SelectorManager> fmt::Display for ManagedSelector<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "selector id={} keys={} updates={}",
            self.inner.id,
            self.size(),
            self.pending_updates()
        )
    }
}

/// Per-channel registration owned by the selector core.
pub(crate) struct Key<M: SelectorManager> {
    pub(crate) token: Token,
    pub(crate) channel: Arc<M::Channel>,
    pub(crate) interest: Ops,
    pub(crate) ready: Ops,
    pub(crate) attachment: Attachment<M>,
}

/// What a key's readiness is dispatched to.
pub(crate) enum Attachment<M: SelectorManager> {
    /// Registered while its endpoint is still being created on a worker.
    Pending,
    EndPoint(Arc<M::EndPoint>),
    Connect(Arc<ConnectState<M>>),
    Acceptor,
}

impl<M: SelectorManager> Clone for Attachment<M> {
    fn clone(&self) -> Self {
        match self {
            Attachment::Pending => Attachment::Pending,
            Attachment::EndPoint(endpoint) => Attachment::EndPoint(Arc::clone(endpoint)),
            Attachment::Connect(connect) => Attachment::Connect(Arc::clone(connect)),
            Attachment::Acceptor => Attachment::Acceptor,
        }
    }
}

impl<M: SelectorManager> fmt::Debug for Attachment<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attachment::Pending => f.write_str("pending"),
            Attachment::EndPoint(endpoint) => write!(f, "{endpoint:?}"),
            Attachment::Connect(connect) => write!(f, "connect {:?}", connect.channel()),
            Attachment::Acceptor => f.write_str("acceptor"),
        }
    }
}

/// The multiplexer handle and key table, owned by whichever thread currently
/// holds the produce duty. Updates receive it mutably; endpoints use the
/// public surface to adjust their interest from their own updates.
pub struct SelectorState<M: SelectorManager> {
    selector: ManagedSelector<M>,
    mux: Option<M::Mux>,
    keys: HashMap<u32, Key<M>>,
    next_token: u32,
}

impl<M: SelectorManager> SelectorState<M> {
    pub(crate) fn new(selector: ManagedSelector<M>) -> SelectorState<M> {
        Self {
            selector,
            mux: None,
            keys: HashMap::new(),
            next_token: 0,
        }
    }

    pub fn selector(&self) -> &ManagedSelector<M> {
        &self.selector
    }

    pub fn manager(&self) -> &M {
        self.selector.manager()
    }

    pub fn size(&self) -> usize {
        self.keys.len()
    }

    /// Interest mask of a key; `None` when the key does not exist.
    pub fn interest(&self, token: Token) -> Option<Ops> {
        self.keys.get(&token.0).map(|key| key.interest)
    }

    /// Changes a key's interest mask on the multiplexer.
    pub fn set_interest(&mut self, token: Token, interest: Ops) -> io::Result<()> {
        let key = self
            .keys
            .get_mut(&token.0)
            .ok_or_else(|| io::Error::other("no such key"))?;
        let mux = self
            .mux
            .as_mut()
            .ok_or_else(|| io::Error::other("multiplexer released"))?;
        mux.reregister(&key.channel, token, interest)?;
        key.interest = interest;
        Ok(())
    }

    pub(crate) fn set_mux(&mut self, mux: M::Mux) {
        self.mux = Some(mux);
    }

    pub(crate) fn mux_mut(&mut self) -> Option<&mut M::Mux> {
        self.mux.as_mut()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.mux.is_some()
    }

    pub(crate) fn register(
        &mut self,
        channel: Arc<M::Channel>,
        interest: Ops,
        attachment: Attachment<M>,
    ) -> io::Result<Token> {
        let token = self.alloc_token();
        let mux = self
            .mux
            .as_mut()
            .ok_or_else(|| io::Error::other("multiplexer released"))?;
        mux.register(&channel, token, interest)?;
        self.keys.insert(
            token.0,
            Key {
                token,
                channel,
                interest,
                ready: Ops::NONE,
                attachment,
            },
        );
        self.selector.key_added();
        Ok(token)
    }

    pub(crate) fn cancel(&mut self, token: Token) -> Option<Key<M>> {
        let key = self.keys.remove(&token.0)?;
        if let Some(mux) = self.mux.as_mut() {
            if let Err(err) = mux.deregister(&key.channel) {
                debug!("unable to deregister {:?}: {}", key.channel, err);
            }
        }
        self.selector.key_removed();
        Some(key)
    }

    /// Replaces a key's attachment. Returns false when the key is gone.
    pub(crate) fn attach(&mut self, token: Token, attachment: Attachment<M>) -> bool {
        match self.keys.get_mut(&token.0) {
            Some(key) => {
                key.attachment = attachment;
                true
            }
            None => false,
        }
    }

    pub(crate) fn key(&self, token: Token) -> Option<&Key<M>> {
        self.keys.get(&token.0)
    }

    pub(crate) fn key_mut(&mut self, token: Token) -> Option<&mut Key<M>> {
        self.keys.get_mut(&token.0)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &Key<M>> {
        self.keys.values()
    }

    pub(crate) fn execute(&self, job: Box<dyn Job>) {
        self.selector.execute(job);
    }

    /// Drops the multiplexer handle and every key. The selector cannot
    /// register channels afterwards.
    pub(crate) fn release_mux(&mut self) {
        self.mux = None;
        self.keys.clear();
        self.selector.keys_cleared();
    }

    pub(crate) fn dump_keys(&self) -> Vec<String> {
        self.keys
            .values()
            .map(|key| {
                format!(
                    "key {} i={:?} r={:?} -> {:?}",
                    key.token, key.interest, key.ready, key.attachment
                )
            })
            .collect()
    }

    fn alloc_token(&mut self) -> Token {
        loop {
            let token = self.next_token;
            self.next_token = self.next_token.wrapping_add(1);
            if token != u32::MAX && !self.keys.contains_key(&token) {
                return Token(token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::endpoint::{Connection, EndPoint};
    use crate::executor::{Executor, ThreadPool};
    use crate::mux::Event;
    use crate::scheduler::{Scheduler, TimerScheduler};
    use crate::sync::Latch;
    use parking_lot::Condvar;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Instant;

    struct TestChannel {
        id: u32,
        closes: Arc<AtomicUsize>,
    }

    impl TestChannel {
        fn new(id: u32) -> TestChannel {
            Self::with_closes(id, Arc::new(AtomicUsize::new(0)))
        }

        fn with_closes(id: u32, closes: Arc<AtomicUsize>) -> TestChannel {
            Self { id, closes }
        }
    }

    impl Channel for TestChannel {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl fmt::Debug for TestChannel {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "chan#{}", self.id)
        }
    }

    #[derive(Default)]
    struct MuxState {
        ready: Vec<Event>,
        woken: bool,
    }

    struct MuxInner {
        state: Mutex<MuxState>,
        cv: Condvar,
        wakes: AtomicUsize,
        interests: Mutex<HashMap<u32, Ops>>,
    }

    impl MuxInner {
        fn new() -> Arc<MuxInner> {
            Arc::new(Self {
                state: Mutex::new(MuxState::default()),
                cv: Condvar::new(),
                wakes: AtomicUsize::new(0),
                interests: Mutex::new(HashMap::new()),
            })
        }

        fn push_ready(&self, token: Token, ready: Ops) {
            let mut state = self.state.lock();
            state.ready.push(Event { token, ready });
            self.cv.notify_all();
        }

        fn interest(&self, token: Token) -> Option<Ops> {
            self.interests.lock().get(&token.0).copied()
        }

        fn wakes(&self) -> usize {
            self.wakes.load(Ordering::SeqCst)
        }
    }

    struct TestMux {
        inner: Arc<MuxInner>,
    }

    impl Multiplexer<TestChannel> for TestMux {
        fn register(&mut self, _channel: &TestChannel, token: Token, interest: Ops) -> io::Result<()> {
            self.inner.interests.lock().insert(token.0, interest);
            Ok(())
        }

        fn reregister(&mut self, _channel: &TestChannel, token: Token, interest: Ops) -> io::Result<()> {
            self.inner.interests.lock().insert(token.0, interest);
            Ok(())
        }

        fn deregister(&mut self, _channel: &TestChannel) -> io::Result<()> {
            Ok(())
        }

        fn select(&mut self, out: &mut Vec<Event>) -> io::Result<usize> {
            let mut state = self.inner.state.lock();
            loop {
                if !state.ready.is_empty() {
                    let selected = state.ready.len();
                    out.append(&mut state.ready);
                    state.woken = false;
                    return Ok(selected);
                }
                if state.woken {
                    state.woken = false;
                    return Ok(0);
                }
                self.inner.cv.wait(&mut state);
            }
        }

        fn select_now(&mut self, out: &mut Vec<Event>) -> io::Result<usize> {
            let mut state = self.inner.state.lock();
            let selected = state.ready.len();
            out.append(&mut state.ready);
            Ok(selected)
        }

        fn waker(&self) -> Arc<dyn Waker> {
            Arc::new(TestWaker {
                inner: Arc::clone(&self.inner),
            })
        }
    }

    struct TestWaker {
        inner: Arc<MuxInner>,
    }

    impl Waker for TestWaker {
        fn wake(&self) -> io::Result<()> {
            self.inner.wakes.fetch_add(1, Ordering::SeqCst);
            let mut state = self.inner.state.lock();
            state.woken = true;
            self.inner.cv.notify_all();
            Ok(())
        }
    }

    struct TestConnection {
        closes: AtomicUsize,
    }

    impl Connection for TestConnection {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl fmt::Debug for TestConnection {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("test-connection")
        }
    }

    struct TestEndPoint {
        token: Token,
        closes: AtomicUsize,
        selected: AtomicUsize,
        updated: AtomicUsize,
        fail_selected: bool,
        job_counter: Option<Arc<AtomicUsize>>,
        connection: Mutex<Option<Arc<TestConnection>>>,
    }

    impl TestEndPoint {
        fn new(token: Token) -> Arc<TestEndPoint> {
            Arc::new(Self {
                token,
                closes: AtomicUsize::new(0),
                selected: AtomicUsize::new(0),
                updated: AtomicUsize::new(0),
                fail_selected: false,
                job_counter: None,
                connection: Mutex::new(None),
            })
        }

        fn with_jobs(token: Token, job_counter: Arc<AtomicUsize>) -> Arc<TestEndPoint> {
            Arc::new(Self {
                token,
                closes: AtomicUsize::new(0),
                selected: AtomicUsize::new(0),
                updated: AtomicUsize::new(0),
                fail_selected: false,
                job_counter: Some(job_counter),
                connection: Mutex::new(None),
            })
        }

        fn failing(token: Token) -> Arc<TestEndPoint> {
            Arc::new(Self {
                token,
                closes: AtomicUsize::new(0),
                selected: AtomicUsize::new(0),
                updated: AtomicUsize::new(0),
                fail_selected: true,
                job_counter: None,
                connection: Mutex::new(None),
            })
        }
    }

    impl EndPoint for TestEndPoint {
        type Connection = TestConnection;

        fn on_selected(&self, _ready: Ops) -> io::Result<Option<Box<dyn Job>>> {
            self.selected.fetch_add(1, Ordering::SeqCst);
            if self.fail_selected {
                return Err(io::Error::other("endpoint readiness failure"));
            }
            Ok(self.job_counter.as_ref().map(|counter| {
                let counter = Arc::clone(counter);
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }) as Box<dyn Job>
            }))
        }

        fn update_key(&self) {
            self.updated.fetch_add(1, Ordering::SeqCst);
        }

        fn connection(&self) -> Option<Arc<TestConnection>> {
            self.connection.lock().clone()
        }

        fn set_connection(&self, connection: Arc<TestConnection>) {
            *self.connection.lock() = Some(connection);
        }

        fn is_output_shutdown(&self) -> bool {
            self.closes.load(Ordering::SeqCst) > 0
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl fmt::Debug for TestEndPoint {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "endpoint#{}", self.token)
        }
    }

    struct CountingExecutor {
        delegate: ThreadPool,
        executions: AtomicUsize,
    }

    impl Executor for CountingExecutor {
        fn execute(&self, job: Box<dyn Job>) -> Result<(), Box<dyn Job>> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.delegate.execute(job)
        }
    }

    struct TestManager {
        executor: Arc<CountingExecutor>,
        scheduler: Arc<TimerScheduler>,
        mux: Arc<MuxInner>,
        connect_timeout: Duration,
        finish_connect: AtomicBool,
        finish_connect_calls: AtomicUsize,
        accept_queue: Mutex<VecDeque<TestChannel>>,
        selector: Mutex<Option<ManagedSelector<TestManager>>>,
        events: Mutex<Vec<String>>,
        endpoints: Mutex<Vec<Arc<TestEndPoint>>>,
        connect_failures: Mutex<Vec<io::ErrorKind>>,
    }

    impl TestManager {
        fn new() -> Arc<TestManager> {
            Self::with_connect_timeout(Duration::from_secs(15))
        }

        fn with_connect_timeout(connect_timeout: Duration) -> Arc<TestManager> {
            Arc::new(Self {
                executor: Arc::new(CountingExecutor {
                    delegate: ThreadPool::new(3),
                    executions: AtomicUsize::new(0),
                }),
                scheduler: Arc::new(TimerScheduler::new()),
                mux: MuxInner::new(),
                connect_timeout,
                finish_connect: AtomicBool::new(false),
                finish_connect_calls: AtomicUsize::new(0),
                accept_queue: Mutex::new(VecDeque::new()),
                selector: Mutex::new(None),
                events: Mutex::new(Vec::new()),
                endpoints: Mutex::new(Vec::new()),
                connect_failures: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, event: &str) {
            self.events.lock().push(event.to_string());
        }

        fn count(&self, event: &str) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|recorded| recorded.as_str() == event)
                .count()
        }

        fn executions(&self) -> usize {
            self.executor.executions.load(Ordering::SeqCst)
        }
    }

    impl SelectorManager for TestManager {
        type Channel = TestChannel;
        type Mux = TestMux;
        type EndPoint = TestEndPoint;
        type Connection = TestConnection;
        type Context = u32;

        fn new_multiplexer(&self) -> io::Result<TestMux> {
            Ok(TestMux {
                inner: Arc::clone(&self.mux),
            })
        }

        fn new_end_point(
            &self,
            _channel: Arc<TestChannel>,
            _selector: ManagedSelector<Self>,
            token: Token,
        ) -> io::Result<Arc<TestEndPoint>> {
            let endpoint = TestEndPoint::new(token);
            self.endpoints.lock().push(Arc::clone(&endpoint));
            Ok(endpoint)
        }

        fn new_connection(
            &self,
            _channel: &Arc<TestChannel>,
            _endpoint: &Arc<TestEndPoint>,
            _context: u32,
        ) -> io::Result<Arc<TestConnection>> {
            Ok(Arc::new(TestConnection {
                closes: AtomicUsize::new(0),
            }))
        }

        fn do_accept(&self, _server: &TestChannel) -> io::Result<Option<TestChannel>> {
            match self.accept_queue.lock().pop_front() {
                Some(channel) => {
                    self.record("accept");
                    Ok(Some(channel))
                }
                None => Ok(None),
            }
        }

        fn accepted(&self, channel: TestChannel) -> io::Result<()> {
            let selector = self.selector.lock().clone().expect("selector installed");
            let update = Accept::new(&selector, channel, 0);
            selector.submit(Box::new(update)).map_err(io::Error::other)
        }

        fn do_finish_connect(&self, _channel: &TestChannel) -> io::Result<bool> {
            self.finish_connect_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.finish_connect.load(Ordering::SeqCst))
        }

        fn is_connection_pending(&self, _channel: &TestChannel) -> bool {
            true
        }

        fn connect_timeout(&self) -> Duration {
            self.connect_timeout
        }

        fn executor(&self) -> Arc<dyn Executor> {
            Arc::clone(&self.executor) as Arc<dyn Executor>
        }

        fn scheduler(&self) -> Arc<dyn Scheduler> {
            Arc::clone(&self.scheduler) as Arc<dyn Scheduler>
        }

        fn on_accepting(&self, _channel: &TestChannel) {
            self.record("on_accepting");
        }

        fn on_accepted(&self, _channel: &TestChannel) {
            self.record("on_accepted");
        }

        fn on_accept_failed(&self, _channel: &TestChannel, _cause: &io::Error) {
            self.record("on_accept_failed");
        }

        fn end_point_opened(&self, _endpoint: &Arc<TestEndPoint>) {
            self.record("end_point_opened");
        }

        fn end_point_closed(&self, _endpoint: &Arc<TestEndPoint>) {
            self.record("end_point_closed");
        }

        fn connection_opened(&self, _connection: &Arc<TestConnection>) {
            self.record("connection_opened");
        }

        fn connection_closed(&self, _connection: &Arc<TestConnection>, _cause: Option<&io::Error>) {
            self.record("connection_closed");
        }

        fn connection_failed(
            &self,
            _channel: &TestChannel,
            cause: &io::Error,
            _context: Option<u32>,
        ) {
            self.connect_failures.lock().push(cause.kind());
            self.record("connection_failed");
        }
    }

    struct RecordingUpdate {
        seq: usize,
        log: Arc<Mutex<Vec<usize>>>,
    }

    impl SelectorUpdate<TestManager> for RecordingUpdate {
        fn update(self: Box<Self>, _state: &mut SelectorState<TestManager>) {
            self.log.lock().push(self.seq);
        }
    }

    impl fmt::Debug for RecordingUpdate {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "recording update {}", self.seq)
        }
    }

    struct InstallEndPoint {
        channel: TestChannel,
        endpoint: Arc<TestEndPoint>,
    }

    impl SelectorUpdate<TestManager> for InstallEndPoint {
        fn update(self: Box<Self>, state: &mut SelectorState<TestManager>) {
            let InstallEndPoint { channel, endpoint } = *self;
            state
                .register(Arc::new(channel), Ops::READ, Attachment::EndPoint(endpoint))
                .expect("register endpoint");
        }
    }

    impl fmt::Debug for InstallEndPoint {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "install {:?}", self.endpoint)
        }
    }

    struct BlockingUpdate {
        entered: Arc<Latch>,
        release: Arc<Latch>,
    }

    impl SelectorUpdate<TestManager> for BlockingUpdate {
        fn update(self: Box<Self>, _state: &mut SelectorState<TestManager>) {
            self.entered.fire();
            self.release.wait();
        }
    }

    impl fmt::Debug for BlockingUpdate {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("blocking update")
        }
    }

    fn new_selector(manager: &Arc<TestManager>) -> ManagedSelector<TestManager> {
        let selector = ManagedSelector::new(Arc::clone(manager), 0);
        *manager.selector.lock() = Some(selector.clone());
        selector
    }

    fn await_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out awaiting {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn should_start_and_stop_idempotently() {
        let manager = TestManager::new();
        let selector = new_selector(&manager);

        selector.start().unwrap();
        assert!(selector.is_running());
        // the producer was handed to the pool exactly once
        assert_eq!(1, manager.executions());
        assert_eq!(0, selector.size());

        selector.stop().unwrap();
        assert!(!selector.is_running());
        // a stopped selector rejects further submissions
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(matches!(
            selector.submit(Box::new(RecordingUpdate { seq: 0, log })),
            Err(SelectorError::Closed)
        ));
        // second stop returns immediately without re-waiting
        let second = Instant::now();
        selector.stop().unwrap();
        assert!(second.elapsed() < Duration::from_millis(100));
        // and a stopped selector cannot be restarted
        assert!(matches!(selector.start(), Err(SelectorError::AlreadyStarted)));
    }

    #[test]
    fn should_apply_updates_in_order_with_collapsed_wakeups() {
        let manager = TestManager::new();
        let selector = new_selector(&manager);
        selector.start().unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let base = manager.mux.wakes();
        for seq in 0..100 {
            selector
                .submit(Box::new(RecordingUpdate {
                    seq,
                    log: Arc::clone(&log),
                }))
                .unwrap();
        }
        await_until("all updates applied", || log.lock().len() == 100);
        assert_eq!((0..100).collect::<Vec<_>>(), *log.lock());
        // concurrent submissions collapse into at most one wake each
        let wakes = manager.mux.wakes() - base;
        assert!(wakes <= 100, "observed {wakes} wakes");

        selector.stop().unwrap();
    }

    #[test]
    fn should_accept_until_would_block() {
        let manager = TestManager::new();
        let selector = new_selector(&manager);
        selector.start().unwrap();

        {
            let mut pending = manager.accept_queue.lock();
            for id in 1..=3 {
                pending.push_back(TestChannel::new(id));
            }
        }
        selector
            .submit(Box::new(Acceptor::new(TestChannel::new(100))))
            .unwrap();
        await_until("acceptor registered", || selector.size() == 1);
        assert_eq!(Some(Ops::ACCEPT), manager.mux.interest(Token(0)));

        manager.mux.push_ready(Token(0), Ops::READ);
        await_until("endpoints created", || manager.endpoints.lock().len() == 3);
        await_until("keys registered", || selector.size() == 4);

        // accepted channels sit at interest 0 until their endpoints ask for more
        for token in 1..=3 {
            assert_eq!(Some(Ops::NONE), manager.mux.interest(Token(token)));
        }
        assert_eq!(3, manager.count("accept"));
        assert_eq!(3, manager.count("on_accepting"));
        assert_eq!(3, manager.count("on_accepted"));
        assert_eq!(3, manager.count("end_point_opened"));
        assert_eq!(3, manager.count("connection_opened"));
        assert_eq!(0, manager.count("on_accept_failed"));

        selector.stop().unwrap();
    }

    #[test]
    fn should_time_out_connect_exactly_once() {
        let manager = TestManager::with_connect_timeout(Duration::from_millis(50));
        let selector = new_selector(&manager);
        selector.start().unwrap();

        let closes = Arc::new(AtomicUsize::new(0));
        let channel = TestChannel::with_closes(7, Arc::clone(&closes));
        let connect = Connect::new(&selector, channel, 0);
        selector.submit(Box::new(connect)).unwrap();

        thread::sleep(Duration::from_millis(200));
        assert_eq!(1, closes.load(Ordering::SeqCst));
        assert_eq!(
            vec![io::ErrorKind::TimedOut],
            manager.connect_failures.lock().clone()
        );
        // the connect never became selectable
        assert_eq!(0, manager.finish_connect_calls.load(Ordering::SeqCst));
        await_until("timed out key removed", || selector.size() == 0);

        selector.stop().unwrap();
    }

    #[test]
    fn should_complete_connect_before_timeout() {
        let manager = TestManager::with_connect_timeout(Duration::from_millis(500));
        manager.finish_connect.store(true, Ordering::SeqCst);
        let selector = new_selector(&manager);
        selector.start().unwrap();

        let closes = Arc::new(AtomicUsize::new(0));
        let channel = TestChannel::with_closes(8, Arc::clone(&closes));
        let connect = Connect::new(&selector, channel, 0);
        selector.submit(Box::new(connect)).unwrap();
        await_until("connect registered", || selector.size() == 1);
        assert_eq!(Some(Ops::CONNECT), manager.mux.interest(Token(0)));

        manager.mux.push_ready(Token(0), Ops::WRITE);
        await_until("endpoint created", || manager.endpoints.lock().len() == 1);
        assert!(manager.finish_connect_calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(Some(Ops::NONE), manager.mux.interest(Token(0)));

        // the cancelled timeout stays silent past its deadline
        thread::sleep(Duration::from_millis(600));
        assert_eq!(0, manager.count("connection_failed"));
        assert_eq!(0, closes.load(Ordering::SeqCst));
        assert_eq!(1, manager.count("end_point_opened"));
        assert_eq!(1, manager.count("connection_opened"));

        selector.stop().unwrap();
    }

    #[test]
    fn should_dump_keys_and_pending_updates() {
        let manager = TestManager::new();
        let selector = new_selector(&manager);
        selector.start().unwrap();

        for i in 0..10 {
            selector
                .submit(Box::new(InstallEndPoint {
                    channel: TestChannel::new(i),
                    endpoint: TestEndPoint::new(Token(i)),
                }))
                .unwrap();
        }
        await_until("endpoints installed", || selector.size() == 10);

        // hold the loop inside an update so the next submissions stay pending
        let entered = Arc::new(Latch::new());
        let release = Arc::new(Latch::new());
        selector
            .submit(Box::new(BlockingUpdate {
                entered: Arc::clone(&entered),
                release: Arc::clone(&release),
            }))
            .unwrap();
        entered.wait();
        let log = Arc::new(Mutex::new(Vec::new()));
        for seq in 0..3 {
            selector
                .submit(Box::new(RecordingUpdate {
                    seq,
                    log: Arc::clone(&log),
                }))
                .unwrap();
        }

        let releaser = {
            let release = Arc::clone(&release);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                release.fire();
            })
        };

        let started = Instant::now();
        let mut out = Vec::new();
        selector.dump(&mut out, "").unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        releaser.join().unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("+- updates @ 2"), "missing updates label: {text}");
        assert!(text.contains("+- keys @ 2"), "missing keys label: {text}");
        let update_entries = text.lines().filter(|line| line.contains("recording update")).count();
        let key_entries = text.lines().filter(|line| line.contains("endpoint#")).count();
        assert_eq!(3, update_entries, "dump: {text}");
        assert_eq!(10, key_entries, "dump: {text}");

        selector.stop().unwrap();
    }

    #[test]
    fn should_run_endpoint_job_and_post_process_key() {
        let manager = TestManager::new();
        let selector = new_selector(&manager);
        selector.start().unwrap();

        let jobs = Arc::new(AtomicUsize::new(0));
        let endpoint = TestEndPoint::with_jobs(Token(0), Arc::clone(&jobs));
        selector
            .submit(Box::new(InstallEndPoint {
                channel: TestChannel::new(1),
                endpoint: Arc::clone(&endpoint),
            }))
            .unwrap();
        await_until("endpoint installed", || selector.size() == 1);

        manager.mux.push_ready(Token(0), Ops::READ);
        await_until("job executed", || jobs.load(Ordering::SeqCst) == 1);
        await_until("key post-processed", || {
            endpoint.updated.load(Ordering::SeqCst) >= 1
        });
        assert_eq!(1, endpoint.selected.load(Ordering::SeqCst));

        selector.stop().unwrap();
    }

    #[test]
    fn should_close_endpoint_when_readiness_processing_fails() {
        let manager = TestManager::new();
        let selector = new_selector(&manager);
        selector.start().unwrap();

        let failing = TestEndPoint::failing(Token(0));
        let healthy = TestEndPoint::new(Token(1));
        selector
            .submit(Box::new(InstallEndPoint {
                channel: TestChannel::new(1),
                endpoint: Arc::clone(&failing),
            }))
            .unwrap();
        selector
            .submit(Box::new(InstallEndPoint {
                channel: TestChannel::new(2),
                endpoint: Arc::clone(&healthy),
            }))
            .unwrap();
        await_until("endpoints installed", || selector.size() == 2);

        manager.mux.push_ready(Token(0), Ops::READ);
        manager.mux.push_ready(Token(1), Ops::READ);
        // the failure closes its endpoint and the loop moves to the next key
        await_until("failing endpoint closed", || {
            failing.closes.load(Ordering::SeqCst) >= 1
        });
        await_until("healthy endpoint still selected", || {
            healthy.selected.load(Ordering::SeqCst) == 1
        });
        assert_eq!(0, healthy.closes.load(Ordering::SeqCst));

        selector.stop().unwrap();
    }

    #[test]
    fn should_destroy_endpoint_and_notify_manager() {
        let manager = TestManager::new();
        let selector = new_selector(&manager);
        selector.start().unwrap();

        let endpoint = TestEndPoint::new(Token(0));
        endpoint.set_connection(Arc::new(TestConnection {
            closes: AtomicUsize::new(0),
        }));
        selector
            .submit(Box::new(InstallEndPoint {
                channel: TestChannel::new(1),
                endpoint: Arc::clone(&endpoint),
            }))
            .unwrap();
        await_until("endpoint installed", || selector.size() == 1);

        selector.destroy_end_point(Token(0), Some(io::Error::other("test cause")));
        await_until("endpoint destroyed", || manager.count("end_point_closed") == 1);
        assert_eq!(1, manager.count("connection_closed"));
        assert_eq!(0, selector.size());

        selector.stop().unwrap();
    }

    #[test]
    fn should_sweep_connections_and_skip_already_closed() {
        let manager = TestManager::new();
        let selector = new_selector(&manager);
        selector.start().unwrap();

        let endpoint = TestEndPoint::new(Token(0));
        let connection = Arc::new(TestConnection {
            closes: AtomicUsize::new(0),
        });
        endpoint.set_connection(Arc::clone(&connection));
        selector
            .submit(Box::new(InstallEndPoint {
                channel: TestChannel::new(1),
                endpoint: Arc::clone(&endpoint),
            }))
            .unwrap();
        await_until("endpoint installed", || selector.size() == 1);

        let closed = Arc::new(Mutex::new(std::collections::HashSet::new()));
        let sweep = CloseConnections::with_closed(Some(Arc::clone(&closed)));
        let no_end_points = sweep.no_end_points_latch();
        let complete = sweep.complete_latch();
        selector.submit(Box::new(sweep)).unwrap();
        complete.wait();
        assert_eq!(1, connection.closes.load(Ordering::SeqCst));
        // the endpoint had not shut down its output side yet
        assert!(!no_end_points.wait_for(Duration::from_millis(10)));

        // a retried sweep with the same closed set skips the endpoint and
        // reports zero remaining once the output side is shut down
        endpoint.close();
        let retry = CloseConnections::with_closed(Some(closed));
        let no_end_points = retry.no_end_points_latch();
        let complete = retry.complete_latch();
        selector.submit(Box::new(retry)).unwrap();
        complete.wait();
        assert!(no_end_points.wait_for(Duration::from_millis(10)));
        assert_eq!(1, connection.closes.load(Ordering::SeqCst));

        selector.stop().unwrap();
    }

    #[test]
    fn should_close_endpoints_on_stop() {
        let manager = TestManager::new();
        let selector = new_selector(&manager);
        selector.start().unwrap();

        let endpoint = TestEndPoint::new(Token(0));
        let connection = Arc::new(TestConnection {
            closes: AtomicUsize::new(0),
        });
        endpoint.set_connection(Arc::clone(&connection));
        selector
            .submit(Box::new(InstallEndPoint {
                channel: TestChannel::new(1),
                endpoint: Arc::clone(&endpoint),
            }))
            .unwrap();
        await_until("endpoint installed", || selector.size() == 1);

        selector.stop().unwrap();
        // the close sweep prefers the connection over the raw endpoint
        assert!(connection.closes.load(Ordering::SeqCst) >= 1);
        assert_eq!(0, selector.size());
    }
}
