//! Host manager contract supplying collaborators and policy to selectors.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;
use crate::endpoint::{Connection, EndPoint};
use crate::executor::Executor;
use crate::mux::Multiplexer;
use crate::ops::Token;
use crate::scheduler::Scheduler;
use crate::select::ManagedSelector;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// The selector's host. Supplies the multiplexer, executor and scheduler,
/// creates endpoints and connections, performs the actual socket accept and
/// connect calls, and receives lifecycle notifications.
///
/// All notification methods default to no-ops so a manager only implements
/// the hooks it cares about.
pub trait SelectorManager: Send + Sync + Sized + 'static {
    type Channel: Channel;
    type Mux: Multiplexer<Self::Channel>;
    type EndPoint: EndPoint<Connection = Self::Connection>;
    type Connection: Connection;
    /// Caller-supplied value carried by an accept or connect until the
    /// connection is created from it.
    type Context: Send + 'static;

    fn new_multiplexer(&self) -> io::Result<Self::Mux>;

    /// Creates the endpoint for a channel whose key `token` was just
    /// registered with `selector`. The endpoint keeps the selector handle to
    /// submit interest updates and to destroy itself.
    fn new_end_point(
        &self,
        channel: Arc<Self::Channel>,
        selector: ManagedSelector<Self>,
        token: Token,
    ) -> io::Result<Arc<Self::EndPoint>>;

    fn new_connection(
        &self,
        channel: &Arc<Self::Channel>,
        endpoint: &Arc<Self::EndPoint>,
        context: Self::Context,
    ) -> io::Result<Arc<Self::Connection>>;

    /// Accepts one pending connection from `server`, or `None` once the
    /// kernel reports would-block.
    fn do_accept(&self, server: &Self::Channel) -> io::Result<Option<Self::Channel>>;

    /// Takes ownership of a freshly accepted channel, typically submitting an
    /// [`Accept`](crate::select::Accept) update to one of the manager's
    /// selectors. The manager closes the channel if it cannot dispatch it.
    fn accepted(&self, channel: Self::Channel) -> io::Result<()>;

    /// Checks whether the non-blocking connect on `channel` has completed.
    fn do_finish_connect(&self, channel: &Self::Channel) -> io::Result<bool>;

    fn is_connection_pending(&self, channel: &Self::Channel) -> bool;

    fn connect_timeout(&self) -> Duration {
        DEFAULT_CONNECT_TIMEOUT
    }

    fn executor(&self) -> Arc<dyn Executor>;

    fn scheduler(&self) -> Arc<dyn Scheduler>;

    fn on_accepting(&self, _channel: &Self::Channel) {}

    fn on_accepted(&self, _channel: &Self::Channel) {}

    fn on_accept_failed(&self, _channel: &Self::Channel, _cause: &io::Error) {}

    fn end_point_opened(&self, _endpoint: &Arc<Self::EndPoint>) {}

    fn end_point_closed(&self, _endpoint: &Arc<Self::EndPoint>) {}

    fn connection_opened(&self, _connection: &Arc<Self::Connection>) {}

    fn connection_closed(&self, _connection: &Arc<Self::Connection>, _cause: Option<&io::Error>) {}

    /// One of {success, timeout, explicit failure} reports here exactly once
    /// per connect. `context` is present unless it was already consumed by
    /// endpoint creation.
    fn connection_failed(
        &self,
        _channel: &Self::Channel,
        _cause: &io::Error,
        _context: Option<Self::Context>,
    ) {
    }

    /// Invoked when the multiplexer wait fails fatally, after the handle has
    /// been released and before the loop exits.
    fn on_select_failed(&self, _cause: &io::Error) {}
}
