//! Contracts between the selector core and the objects attached to its keys.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::executor::Job;
use crate::ops::Ops;

/// Higher-level connection object wired onto an endpoint by the manager. The
/// selector only ever closes it and reports its lifecycle.
pub trait Connection: Send + Sync + fmt::Debug + 'static {
    fn close(&self);
}

/// An endpoint registered with a managed selector via a key attachment.
///
/// Both [`EndPoint::on_selected`] and [`EndPoint::update_key`] are invoked
/// only from the selector producer thread; everything else may be called from
/// worker threads.
pub trait EndPoint: Send + Sync + fmt::Debug + 'static {
    type Connection: Connection;

    /// Reacts to readiness on the endpoint's key. Returns a job to run on a
    /// worker (the job may block) or `None` when the readiness was absorbed
    /// in place. On error the loop logs the failure, closes this endpoint
    /// and moves on to the next key. Must not re-enter the selector
    /// synchronously.
    fn on_selected(&self, ready: Ops) -> io::Result<Option<Box<dyn Job>>>;

    /// Invoked once per wait cycle, after every key selected in that cycle
    /// has been processed. The endpoint typically submits an update here to
    /// adjust its interest mask.
    fn update_key(&self);

    fn connection(&self) -> Option<Arc<Self::Connection>>;

    fn set_connection(&self, connection: Arc<Self::Connection>);

    /// Whether the endpoint has already shut down its output side. Used by
    /// the shutdown sweep to decide if any endpoints are still draining.
    fn is_output_shutdown(&self) -> bool;

    /// Best-effort close. Must be safe to call more than once.
    fn close(&self);
}
