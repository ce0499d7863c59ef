//! The single-consumer loop that drives a managed selector.

use std::collections::VecDeque;
use std::io;
use std::env;
use std::sync::{Arc, OnceLock};

use log::{debug, error, warn};

use crate::endpoint::EndPoint;
use crate::executor::Job;
use crate::manager::SelectorManager;
use crate::mux::{Event, Multiplexer};
use crate::ops::{Ops, Token};
use crate::select::strategy::Producer;
use crate::select::update::{ConnectState, CreateEndPoint, SelectorUpdate};
use crate::select::{Attachment, ManagedSelector, SelectorState};

/// Process-wide toggle forcing a non-blocking poll after a wait that reported
/// nothing selected, to drain readiness some platforms lose across a blocking
/// wait. Defaults to on when the host OS name contains `windows`.
pub(crate) fn force_select_now() -> bool {
    static FORCE: OnceLock<bool> = OnceLock::new();
    *FORCE.get_or_init(|| match env::var("SELNET_FORCE_SELECT_NOW") {
        Ok(value) => value.eq_ignore_ascii_case("true"),
        Err(_) => env::consts::OS.contains("windows"),
    })
}

/// Expands the raw read/write readiness reported by the multiplexer against
/// the key interest into accept/connect readiness.
fn expand_ready(raw: Ops, interest: Ops) -> Ops {
    let mut ready = Ops::NONE;
    if raw.contains(Ops::READ) {
        if interest.contains(Ops::ACCEPT) {
            ready |= Ops::ACCEPT;
        }
        if interest.contains(Ops::READ) {
            ready |= Ops::READ;
        }
    }
    if raw.contains(Ops::WRITE) {
        if interest.contains(Ops::CONNECT) {
            ready |= Ops::CONNECT;
        }
        if interest.contains(Ops::WRITE) {
            ready |= Ops::WRITE;
        }
    }
    ready
}

/// Alternates between draining the previously selected keys, applying queued
/// updates, post-processing the batch and blocking in the multiplexer wait.
/// All state survives across [`Producer::produce`] calls so the produce duty
/// can migrate between pool threads.
pub(crate) struct SelectorProducer<M: SelectorManager> {
    selector: ManagedSelector<M>,
    state: SelectorState<M>,
    updateable: VecDeque<Box<dyn SelectorUpdate<M>>>,
    selected: Vec<Event>,
    cursor: usize,
}

impl<M: SelectorManager> SelectorProducer<M> {
    pub(crate) fn new(selector: ManagedSelector<M>) -> SelectorProducer<M> {
        Self {
            state: SelectorState::new(selector.clone()),
            selector,
            updateable: VecDeque::new(),
            selected: Vec::new(),
            cursor: 0,
        }
    }

    pub(crate) fn install(&mut self, mux: M::Mux) {
        self.state.set_mux(mux);
    }

    fn process_selected(&mut self) -> Option<Box<dyn Job>> {
        while self.cursor < self.selected.len() {
            let event = self.selected[self.cursor];
            self.cursor += 1;
            let (ready, attachment) = match self.state.key_mut(event.token) {
                Some(key) => {
                    let ready = expand_ready(event.ready, key.interest);
                    key.ready = ready;
                    (ready, key.attachment.clone())
                }
                None => {
                    debug!("ignoring readiness for cancelled key {}", event.token);
                    continue;
                }
            };
            debug!("selected {:?} on key {}", ready, event.token);
            match attachment {
                Attachment::EndPoint(endpoint) => match endpoint.on_selected(ready) {
                    Ok(Some(job)) => return Some(job),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(
                            "unable to process key {} for {:?}: {}",
                            event.token, endpoint, err
                        );
                        endpoint.close();
                    }
                },
                Attachment::Connect(connect) => {
                    if ready.contains(Ops::CONNECT) {
                        self.process_connect(event.token, connect);
                    } else {
                        warn!(
                            "connect key {} selected without connect readiness: {:?}",
                            event.token, ready
                        );
                    }
                }
                Attachment::Acceptor => self.process_accept(event.token),
                Attachment::Pending => debug!("readiness on pending key {}", event.token),
            }
        }
        None
    }

    fn process_connect(&mut self, token: Token, connect: Arc<ConnectState<M>>) {
        let finished = self.state.manager().do_finish_connect(connect.channel());
        debug!("connected {:?} {:?}", finished, connect.channel());
        let failure = match finished {
            Ok(true) => {
                if connect.cancel_timeout() {
                    match self.finish_connect(token, &connect) {
                        Ok(()) => return,
                        Err(err) => err,
                    }
                } else {
                    // the timeout fired while the connect was completing
                    io::Error::new(io::ErrorKind::TimedOut, "concurrent connect timeout")
                }
            }
            Ok(false) => io::Error::new(io::ErrorKind::NotConnected, "connect did not complete"),
            Err(err) => err,
        };
        connect.failed(failure);
        self.state.cancel(token);
    }

    fn finish_connect(&mut self, token: Token, connect: &Arc<ConnectState<M>>) -> io::Result<()> {
        let context = connect
            .take_context()
            .ok_or_else(|| io::Error::other("connect context already consumed"))?;
        self.state.set_interest(token, Ops::NONE)?;
        self.state.attach(token, Attachment::Pending);
        let job = CreateEndPoint::connected(
            self.selector.clone(),
            Arc::clone(connect.channel_arc()),
            token,
            context,
            Arc::clone(connect),
        );
        self.state.execute(Box::new(job));
        Ok(())
    }

    fn process_accept(&mut self, token: Token) {
        let Some(key) = self.state.key(token) else {
            return;
        };
        let server = Arc::clone(&key.channel);
        loop {
            match self.state.manager().do_accept(&server) {
                Ok(Some(channel)) => {
                    if let Err(err) = self.state.manager().accepted(channel) {
                        warn!("accept dispatch failed on {:?}: {}", server, err);
                        self.state.manager().on_accept_failed(&server, &err);
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("accept failed on {:?}: {}", server, err);
                    self.state.manager().on_accept_failed(&server, &err);
                    break;
                }
            }
        }
    }

    fn process_updates(&mut self) {
        loop {
            self.selector.swap_updates(&mut self.updateable);
            debug!("updateable {}", self.updateable.len());
            for update in self.updateable.drain(..) {
                if !self.state.is_open() {
                    debug!("dropping {:?} after multiplexer release", update);
                    continue;
                }
                debug!("update {:?}", update);
                update.update(&mut self.state);
            }
            // more updates may have arrived while the swapped batch was
            // applied without the lock held
            if !self.selector.finish_updates() {
                break;
            }
        }
    }

    fn update_keys(&mut self) {
        // post-process only the keys that were selected in this cycle
        for event in &self.selected {
            let endpoint = match self.state.key_mut(event.token) {
                Some(key) => {
                    key.ready = Ops::NONE;
                    match &key.attachment {
                        Attachment::EndPoint(endpoint) => Some(Arc::clone(endpoint)),
                        _ => None,
                    }
                }
                None => None,
            };
            if let Some(endpoint) = endpoint {
                endpoint.update_key();
            }
        }
        self.selected.clear();
        self.cursor = 0;
    }

    fn select(&mut self) -> bool {
        self.selected.clear();
        self.cursor = 0;
        debug!(
            "selector {} waiting with {} keys",
            self.selector.id(),
            self.state.size()
        );
        let selected = {
            let Some(mux) = self.state.mux_mut() else {
                return false;
            };
            mux.select(&mut self.selected)
        };
        match selected {
            Ok(mut selected) => {
                if selected == 0 {
                    debug!("selector {} woken with none selected", self.selector.id());
                    if force_select_now() {
                        let drained = {
                            let Some(mux) = self.state.mux_mut() else {
                                return false;
                            };
                            mux.select_now(&mut self.selected)
                        };
                        match drained {
                            Ok(n) => selected = n,
                            Err(err) => {
                                self.on_select_failed(err);
                                return false;
                            }
                        }
                    }
                }
                self.selector.clear_selecting();
                debug!(
                    "selector {} woken up from select, {}/{} selected",
                    self.selector.id(),
                    selected,
                    self.state.size()
                );
                true
            }
            Err(err) => {
                self.on_select_failed(err);
                false
            }
        }
    }

    fn on_select_failed(&mut self, cause: io::Error) {
        self.state.release_mux();
        self.selector.clear_waker();
        if self.selector.is_running() {
            error!("fatal select failure on {}: {}", self.selector, cause);
            self.state.manager().on_select_failed(&cause);
        } else {
            debug!("select failure while stopping: {}", cause);
        }
    }
}

impl<M: SelectorManager> Producer for SelectorProducer<M> {
    fn produce(&mut self) -> Option<Box<dyn Job>> {
        loop {
            if let Some(job) = self.process_selected() {
                return Some(job);
            }
            self.process_updates();
            self.update_keys();
            if !self.select() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_expand_raw_readiness_against_interest() {
        assert_eq!(
            Ops::ACCEPT,
            expand_ready(Ops::READ, Ops::ACCEPT | Ops::WRITE)
        );
        assert_eq!(Ops::CONNECT, expand_ready(Ops::WRITE, Ops::CONNECT));
        assert_eq!(
            Ops::READ | Ops::WRITE,
            expand_ready(Ops::READ | Ops::WRITE, Ops::READ | Ops::WRITE)
        );
        assert_eq!(Ops::NONE, expand_ready(Ops::READ, Ops::WRITE));
        assert_eq!(Ops::NONE, expand_ready(Ops::NONE, Ops::READ));
    }
}
