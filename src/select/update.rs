//! The closed set of updates applied by the selector between waits.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::endpoint::{Connection, EndPoint};
use crate::executor::Job;
use crate::manager::SelectorManager;
use crate::ops::{Ops, Token};
use crate::scheduler::TimeoutHandle;
use crate::select::{Attachment, ManagedSelector, SelectorState};
use crate::sync::Latch;

/// A deferred mutation of selector state, applied exactly once by the
/// producer thread while the loop is not blocked in the multiplexer wait.
///
/// Failures must be handled inside `update`: one bad update must not abort
/// the loop or leak into unrelated updates.
pub trait SelectorUpdate<M: SelectorManager>: Send + fmt::Debug {
    fn update(self: Box<Self>, state: &mut SelectorState<M>);
}

/// Marks the selector running and releases the thread blocked in `start`.
pub(crate) struct Start {
    started: Arc<Latch>,
}

impl Start {
    pub(crate) fn new() -> Start {
        Self {
            started: Arc::new(Latch::new()),
        }
    }

    pub(crate) fn latch(&self) -> Arc<Latch> {
        Arc::clone(&self.started)
    }
}

impl<M: SelectorManager> SelectorUpdate<M> for Start {
    fn update(self: Box<Self>, state: &mut SelectorState<M>) {
        state.selector().mark_running();
        self.started.fire();
    }
}

impl fmt::Debug for Start {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("start")
    }
}

/// Long-lived passive registration of a server channel with accept interest.
/// Readiness is handled inside the loop: accept until would-block, handing
/// every accepted channel to the manager.
pub struct Acceptor<M: SelectorManager> {
    channel: M::Channel,
}

impl<M: SelectorManager> Acceptor<M> {
    pub fn new(channel: M::Channel) -> Acceptor<M> {
        Self { channel }
    }
}

impl<M: SelectorManager> SelectorUpdate<M> for Acceptor<M> {
    fn update(self: Box<Self>, state: &mut SelectorState<M>) {
        let channel = Arc::new(self.channel);
        match state.register(Arc::clone(&channel), Ops::ACCEPT, Attachment::Acceptor) {
            Ok(token) => debug!("acceptor {:?} on key {}", channel, token),
            Err(err) => {
                channel.close();
                warn!("unable to register acceptor {:?}: {}", channel, err);
            }
        }
    }
}

impl<M: SelectorManager> fmt::Debug for Acceptor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acceptor {:?}", self.channel)
    }
}

/// Registers an already-accepted channel with empty interest and schedules
/// endpoint creation on a worker.
pub struct Accept<M: SelectorManager> {
    channel: M::Channel,
    context: M::Context,
}

impl<M: SelectorManager> Accept<M> {
    pub fn new(selector: &ManagedSelector<M>, channel: M::Channel, context: M::Context) -> Accept<M> {
        selector.manager().on_accepting(&channel);
        Self { channel, context }
    }
}

impl<M: SelectorManager> SelectorUpdate<M> for Accept<M> {
    fn update(self: Box<Self>, state: &mut SelectorState<M>) {
        let Accept { channel, context } = *self;
        let channel = Arc::new(channel);
        match state.register(Arc::clone(&channel), Ops::NONE, Attachment::Pending) {
            Ok(token) => {
                let job = CreateEndPoint::accepted(state.selector().clone(), channel, token, context);
                state.execute(Box::new(job));
            }
            Err(err) => {
                channel.close();
                debug!("unable to register accepted channel {:?}: {}", channel, err);
                state.manager().on_accept_failed(&channel, &err);
            }
        }
    }
}

impl<M: SelectorManager> fmt::Debug for Accept<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "accept {:?}", self.channel)
    }
}

/// Registers a connecting channel with connect interest. The timeout is
/// scheduled at construction, before registration, and races the success path
/// through the single-shot failure flag in [`ConnectState`].
pub struct Connect<M: SelectorManager> {
    state: Arc<ConnectState<M>>,
}

impl<M: SelectorManager> Connect<M> {
    pub fn new(selector: &ManagedSelector<M>, channel: M::Channel, context: M::Context) -> Connect<M> {
        let state = Arc::new(ConnectState {
            selector: selector.clone(),
            channel: Arc::new(channel),
            context: Mutex::new(Some(context)),
            failed: AtomicBool::new(false),
            timeout: OnceLock::new(),
            token: OnceLock::new(),
        });
        let timeout = selector.manager().scheduler().schedule(
            selector.manager().connect_timeout(),
            Box::new({
                let state = Arc::clone(&state);
                move || state.on_timeout()
            }),
        );
        let _ = state.timeout.set(timeout);
        Connect { state }
    }
}

impl<M: SelectorManager> SelectorUpdate<M> for Connect<M> {
    fn update(self: Box<Self>, state: &mut SelectorState<M>) {
        let connect = self.state;
        if connect.is_failed() {
            // the timeout won before the registration was applied
            debug!("skipping registration of failed connect {:?}", connect.channel());
            return;
        }
        let channel = Arc::clone(connect.channel_arc());
        match state.register(channel, Ops::CONNECT, Attachment::Connect(Arc::clone(&connect))) {
            Ok(token) => {
                let _ = connect.token.set(token);
                debug!("connect {:?} pending on key {}", connect.channel(), token);
            }
            Err(err) => {
                connect.failed(err);
            }
        }
    }
}

impl<M: SelectorManager> fmt::Debug for Connect<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connect {:?}", self.state.channel())
    }
}

/// Shared state of one in-flight connect: the winner of the race between the
/// readiness path, the scheduled timeout and registration failure is decided
/// by the `failed` flag.
pub(crate) struct ConnectState<M: SelectorManager> {
    selector: ManagedSelector<M>,
    channel: Arc<M::Channel>,
    context: Mutex<Option<M::Context>>,
    failed: AtomicBool,
    timeout: OnceLock<TimeoutHandle>,
    token: OnceLock<Token>,
}

impl<M: SelectorManager> ConnectState<M> {
    pub(crate) fn channel(&self) -> &M::Channel {
        &self.channel
    }

    pub(crate) fn channel_arc(&self) -> &Arc<M::Channel> {
        &self.channel
    }

    pub(crate) fn take_context(&self) -> Option<M::Context> {
        self.context.lock().take()
    }

    /// Cancels the scheduled timeout; returns whether the cancel won, i.e.
    /// the timeout has not fired and never will.
    pub(crate) fn cancel_timeout(&self) -> bool {
        self.timeout.get().map_or(true, |timeout| timeout.cancel())
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Single-shot failure: exactly one of the success path, the timeout path
    /// and registration failure closes the channel and notifies the manager.
    /// Returns whether this call won the race.
    pub(crate) fn failed(&self, cause: io::Error) -> bool {
        if self
            .failed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(timeout) = self.timeout.get() {
            timeout.cancel();
        }
        debug!("connect {:?} failed: {}", self.channel, cause);
        self.channel.close();
        let context = self.take_context();
        self.selector
            .manager()
            .connection_failed(&self.channel, &cause, context);
        true
    }

    fn on_timeout(&self) {
        if self.selector.manager().is_connection_pending(&self.channel) {
            debug!("channel {:?} timed out while connecting, closing it", self.channel);
            let won = self.failed(io::Error::new(io::ErrorKind::TimedOut, "connect timeout"));
            if won {
                // the loop owns the key table, so the cleanup of the timed out
                // key round-trips through the queue
                if let Some(token) = self.token.get() {
                    let _ = self.selector.submit(Box::new(CancelKey::new(*token, None)));
                }
            }
        }
    }
}

/// Snapshots the current key set as human-readable strings from inside the
/// loop. Cloned so the dumping thread can await the result while the queue
/// owns the submitted copy.
#[derive(Clone)]
pub(crate) struct DumpKeys {
    inner: Arc<DumpKeysInner>,
}

struct DumpKeysInner {
    latch: Latch,
    keys: Mutex<Option<Vec<String>>>,
}

impl DumpKeys {
    pub(crate) fn new() -> DumpKeys {
        Self {
            inner: Arc::new(DumpKeysInner {
                latch: Latch::new(),
                keys: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn get(&self, timeout: Duration) -> Option<Vec<String>> {
        if self.inner.latch.wait_for(timeout) {
            self.inner.keys.lock().take()
        } else {
            None
        }
    }
}

impl<M: SelectorManager> SelectorUpdate<M> for DumpKeys {
    fn update(self: Box<Self>, state: &mut SelectorState<M>) {
        *self.inner.keys.lock() = Some(state.dump_keys());
        self.inner.latch.fire();
    }
}

impl fmt::Debug for DumpKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dump keys")
    }
}

/// Installs a freshly created endpoint on its key. Key attachments are owned
/// by the producer thread, so creation jobs running on workers round-trip
/// through this update.
pub(crate) struct AttachEndPoint<M: SelectorManager> {
    token: Token,
    endpoint: Arc<M::EndPoint>,
}

impl<M: SelectorManager> AttachEndPoint<M> {
    pub(crate) fn new(token: Token, endpoint: Arc<M::EndPoint>) -> AttachEndPoint<M> {
        Self { token, endpoint }
    }
}

impl<M: SelectorManager> SelectorUpdate<M> for AttachEndPoint<M> {
    fn update(self: Box<Self>, state: &mut SelectorState<M>) {
        let AttachEndPoint { token, endpoint } = *self;
        if !state.attach(token, Attachment::EndPoint(Arc::clone(&endpoint))) {
            debug!("key {} vanished before endpoint attach, closing {:?}", token, endpoint);
            endpoint.close();
        }
    }
}

impl<M: SelectorManager> fmt::Debug for AttachEndPoint<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attach endpoint on key {}", self.token)
    }
}

/// Cancels a key and, when an endpoint was attached, dispatches its
/// destruction on a worker.
pub(crate) struct CancelKey {
    token: Token,
    cause: Option<io::Error>,
}

impl CancelKey {
    pub(crate) fn new(token: Token, cause: Option<io::Error>) -> CancelKey {
        Self { token, cause }
    }
}

impl<M: SelectorManager> SelectorUpdate<M> for CancelKey {
    fn update(self: Box<Self>, state: &mut SelectorState<M>) {
        let CancelKey { token, cause } = *self;
        let Some(key) = state.cancel(token) else {
            debug!("cancel of unknown key {}", token);
            return;
        };
        if let Attachment::EndPoint(endpoint) = key.attachment {
            let job = DestroyEndPoint {
                selector: state.selector().clone(),
                endpoint,
                cause,
            };
            state.execute(Box::new(job));
        }
    }
}

impl fmt::Debug for CancelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancel key {}", self.token)
    }
}

/// Closes every connection or endpoint reachable via key attachments. Used
/// as the first phase of shutdown and available to callers draining a
/// selector gracefully. `complete` fires once the sweep ran; `no_end_points`
/// fires only when every endpoint had already shut down its output side.
pub struct CloseConnections {
    closed: Option<Arc<Mutex<HashSet<u32>>>>,
    no_end_points: Arc<Latch>,
    complete: Arc<Latch>,
}

impl CloseConnections {
    pub fn new() -> CloseConnections {
        Self::with_closed(None)
    }

    /// A sweep retried with the same `closed` set skips endpoints a previous
    /// sweep already closed.
    pub fn with_closed(closed: Option<Arc<Mutex<HashSet<u32>>>>) -> CloseConnections {
        Self {
            closed,
            no_end_points: Arc::new(Latch::new()),
            complete: Arc::new(Latch::new()),
        }
    }

    pub fn no_end_points_latch(&self) -> Arc<Latch> {
        Arc::clone(&self.no_end_points)
    }

    pub fn complete_latch(&self) -> Arc<Latch> {
        Arc::clone(&self.complete)
    }
}

impl Default for CloseConnections {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: SelectorManager> SelectorUpdate<M> for CloseConnections {
    fn update(self: Box<Self>, state: &mut SelectorState<M>) {
        debug!("closing {} connections on {}", state.size(), state.selector());
        let mut zero = true;
        let targets: Vec<(Token, Arc<M::EndPoint>)> = state
            .keys()
            .filter_map(|key| match &key.attachment {
                Attachment::EndPoint(endpoint) => Some((key.token, Arc::clone(endpoint))),
                _ => None,
            })
            .collect();
        for (token, endpoint) in targets {
            if !endpoint.is_output_shutdown() {
                zero = false;
            }
            if let Some(closed) = &self.closed {
                if !closed.lock().insert(token.0) {
                    continue;
                }
            }
            match endpoint.connection() {
                Some(connection) => connection.close(),
                None => endpoint.close(),
            }
        }
        if zero {
            self.no_end_points.fire();
        }
        self.complete.fire();
    }
}

impl fmt::Debug for CloseConnections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("close connections")
    }
}

/// Final phase of shutdown: close any remaining endpoints and release the
/// multiplexer handle. The selector is unusable afterwards.
pub(crate) struct StopSelector {
    stopped: Arc<Latch>,
}

impl StopSelector {
    pub(crate) fn new() -> StopSelector {
        Self {
            stopped: Arc::new(Latch::new()),
        }
    }

    pub(crate) fn latch(&self) -> Arc<Latch> {
        Arc::clone(&self.stopped)
    }
}

impl<M: SelectorManager> SelectorUpdate<M> for StopSelector {
    fn update(self: Box<Self>, state: &mut SelectorState<M>) {
        for key in state.keys() {
            if let Attachment::EndPoint(endpoint) = &key.attachment {
                endpoint.close();
            }
        }
        state.release_mux();
        state.selector().clear_waker();
        self.stopped.fire();
    }
}

impl fmt::Debug for StopSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("stop selector")
    }
}

/// Creates the endpoint and connection for a freshly registered key on a
/// worker thread, then installs the endpoint via [`AttachEndPoint`].
pub(crate) struct CreateEndPoint<M: SelectorManager> {
    selector: ManagedSelector<M>,
    channel: Arc<M::Channel>,
    token: Token,
    context: M::Context,
    origin: Origin<M>,
}

enum Origin<M: SelectorManager> {
    Accepted,
    Connected(Arc<ConnectState<M>>),
}

impl<M: SelectorManager> CreateEndPoint<M> {
    pub(crate) fn accepted(
        selector: ManagedSelector<M>,
        channel: Arc<M::Channel>,
        token: Token,
        context: M::Context,
    ) -> CreateEndPoint<M> {
        Self {
            selector,
            channel,
            token,
            context,
            origin: Origin::Accepted,
        }
    }

    pub(crate) fn connected(
        selector: ManagedSelector<M>,
        channel: Arc<M::Channel>,
        token: Token,
        context: M::Context,
        connect: Arc<ConnectState<M>>,
    ) -> CreateEndPoint<M> {
        Self {
            selector,
            channel,
            token,
            context,
            origin: Origin::Connected(connect),
        }
    }

    fn fail(
        selector: ManagedSelector<M>,
        channel: Arc<M::Channel>,
        token: Token,
        origin: Origin<M>,
        cause: io::Error,
    ) {
        warn!("unable to create endpoint for {:?}: {}", channel, cause);
        channel.close();
        let _ = selector.submit(Box::new(CancelKey::new(token, None)));
        match origin {
            Origin::Accepted => selector.manager().on_accept_failed(&channel, &cause),
            Origin::Connected(connect) => {
                connect.failed(cause);
            }
        }
    }
}

impl<M: SelectorManager> Job for CreateEndPoint<M> {
    fn run(self: Box<Self>) {
        let CreateEndPoint {
            selector,
            channel,
            token,
            context,
            origin,
        } = *self;
        match selector.create_end_point(&channel, token, context) {
            Ok(endpoint) => {
                debug!("created {:?}", endpoint);
                if let Origin::Accepted = origin {
                    selector.manager().on_accepted(&channel);
                }
            }
            Err(err) => Self::fail(selector, channel, token, origin, err),
        }
    }

    fn discard(self: Box<Self>) {
        let CreateEndPoint {
            selector,
            channel,
            token,
            context: _,
            origin,
        } = *self;
        let cause = io::Error::other("executor rejected endpoint creation");
        Self::fail(selector, channel, token, origin, cause);
    }
}

/// Reports endpoint destruction to the manager off the producer thread.
/// Discarding is equivalent to running: the notification must not be lost.
pub(crate) struct DestroyEndPoint<M: SelectorManager> {
    selector: ManagedSelector<M>,
    endpoint: Arc<M::EndPoint>,
    cause: Option<io::Error>,
}

impl<M: SelectorManager> Job for DestroyEndPoint<M> {
    fn run(self: Box<Self>) {
        let DestroyEndPoint {
            selector,
            endpoint,
            cause,
        } = *self;
        debug!("destroyed {:?}", endpoint);
        if let Some(connection) = endpoint.connection() {
            selector
                .manager()
                .connection_closed(&connection, cause.as_ref());
        }
        selector.manager().end_point_closed(&endpoint);
    }

    fn discard(self: Box<Self>) {
        self.run();
    }
}
