//! OS readiness multiplexer abstraction and its mio-backed implementation.

use std::io;
use std::sync::Arc;

use crate::channel::Channel;
use crate::ops::{Ops, Token};

/// Raw readiness reported by a multiplexer wait. `ready` only ever carries
/// [`Ops::READ`] and [`Ops::WRITE`]; the selector expands it against the key
/// interest.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub token: Token,
    pub ready: Ops,
}

/// Handle used to interrupt a blocked [`Multiplexer::select`] from another
/// thread. A wake delivered while the multiplexer is not waiting makes the
/// next wait return immediately instead of being lost.
pub trait Waker: Send + Sync + 'static {
    fn wake(&self) -> io::Result<()>;
}

/// One operating-system readiness multiplexer (epoll, kqueue or equivalent).
///
/// All methods except the waker are invoked only from the selector producer
/// thread.
pub trait Multiplexer<C: Channel>: Send + 'static {
    fn register(&mut self, channel: &C, token: Token, interest: Ops) -> io::Result<()>;

    fn reregister(&mut self, channel: &C, token: Token, interest: Ops) -> io::Result<()>;

    fn deregister(&mut self, channel: &C) -> io::Result<()>;

    /// Blocks until readiness is available or a wake is delivered, appending
    /// the observed events to `out`. A wake with no ready channels reports
    /// zero events.
    fn select(&mut self, out: &mut Vec<Event>) -> io::Result<usize>;

    /// Non-blocking variant of [`Multiplexer::select`].
    fn select_now(&mut self, out: &mut Vec<Event>) -> io::Result<usize>;

    fn waker(&self) -> Arc<dyn Waker>;
}

#[cfg(unix)]
pub use self::mio_mux::MioMultiplexer;

#[cfg(unix)]
mod mio_mux {
    use std::collections::HashSet;
    use std::io;
    use std::os::unix::io::{AsRawFd, RawFd};
    use std::sync::Arc;
    use std::time::Duration;

    use mio::unix::SourceFd;
    use mio::{Events, Interest, Poll};

    use crate::channel::Channel;
    use crate::mux::{Event, Multiplexer, Waker};
    use crate::ops::{Ops, Token};

    // outside the u32 space used for selection keys
    const WAKE_TOKEN: mio::Token = mio::Token(usize::MAX);

    const NO_WAIT: Option<Duration> = Some(Duration::from_millis(0));

    /// Production multiplexer over [`mio::Poll`]. Channels are registered by
    /// raw file descriptor so they can stay shared with their endpoints.
    pub struct MioMultiplexer {
        poll: Poll,
        events: Events,
        waker: Arc<MioWaker>,
        // mio rejects empty interest sets, so keys registered with interest 0
        // are parked here until a real interest arrives
        parked: HashSet<RawFd>,
    }

    impl MioMultiplexer {
        pub fn new() -> io::Result<MioMultiplexer> {
            let poll = Poll::new()?;
            let waker = Arc::new(MioWaker(mio::Waker::new(poll.registry(), WAKE_TOKEN)?));
            Ok(Self {
                poll,
                events: Events::with_capacity(1024),
                waker,
                parked: HashSet::new(),
            })
        }

        fn interests(ops: Ops) -> Option<Interest> {
            match (ops.readable(), ops.writable()) {
                (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                (true, false) => Some(Interest::READABLE),
                (false, true) => Some(Interest::WRITABLE),
                (false, false) => None,
            }
        }

        fn poll(&mut self, out: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                // a signal may interrupt the wait; report a spurious wake
                Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
                Err(err) => return Err(err),
            }
            let mut selected = 0;
            for ev in self.events.iter() {
                if ev.token() == WAKE_TOKEN {
                    continue;
                }
                let mut ready = Ops::NONE;
                if ev.is_readable() || ev.is_read_closed() {
                    ready |= Ops::READ;
                }
                if ev.is_writable() || ev.is_write_closed() {
                    ready |= Ops::WRITE;
                }
                if ev.is_error() {
                    ready |= Ops::READ | Ops::WRITE;
                }
                if !ready.is_empty() {
                    out.push(Event {
                        token: Token(ev.token().0 as u32),
                        ready,
                    });
                    selected += 1;
                }
            }
            Ok(selected)
        }
    }

    impl<C: Channel + AsRawFd> Multiplexer<C> for MioMultiplexer {
        fn register(&mut self, channel: &C, token: Token, interest: Ops) -> io::Result<()> {
            let fd = channel.as_raw_fd();
            match Self::interests(interest) {
                Some(interests) => {
                    self.poll
                        .registry()
                        .register(&mut SourceFd(&fd), mio::Token(token.0 as usize), interests)
                }
                None => {
                    self.parked.insert(fd);
                    Ok(())
                }
            }
        }

        fn reregister(&mut self, channel: &C, token: Token, interest: Ops) -> io::Result<()> {
            let fd = channel.as_raw_fd();
            if self.parked.remove(&fd) {
                return self.register(channel, token, interest);
            }
            match Self::interests(interest) {
                Some(interests) => self.poll.registry().reregister(
                    &mut SourceFd(&fd),
                    mio::Token(token.0 as usize),
                    interests,
                ),
                None => {
                    self.poll.registry().deregister(&mut SourceFd(&fd))?;
                    self.parked.insert(fd);
                    Ok(())
                }
            }
        }

        fn deregister(&mut self, channel: &C) -> io::Result<()> {
            let fd = channel.as_raw_fd();
            if self.parked.remove(&fd) {
                return Ok(());
            }
            self.poll.registry().deregister(&mut SourceFd(&fd))
        }

        fn select(&mut self, out: &mut Vec<Event>) -> io::Result<usize> {
            self.poll(out, None)
        }

        fn select_now(&mut self, out: &mut Vec<Event>) -> io::Result<usize> {
            self.poll(out, NO_WAIT)
        }

        fn waker(&self) -> Arc<dyn Waker> {
            Arc::clone(&self.waker) as Arc<dyn Waker>
        }
    }

    struct MioWaker(mio::Waker);

    impl Waker for MioWaker {
        fn wake(&self) -> io::Result<()> {
            self.0.wake()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::channel::{TcpChannel, TcpServerChannel};

        #[test]
        fn should_return_no_events_on_wake() {
            let mut mux = MioMultiplexer::new().unwrap();
            let waker = Multiplexer::<TcpChannel>::waker(&mux);
            waker.wake().unwrap();
            let mut out = Vec::new();
            let selected = Multiplexer::<TcpChannel>::select(&mut mux, &mut out).unwrap();
            assert_eq!(0, selected);
            assert!(out.is_empty());
        }

        #[test]
        fn should_report_write_readiness_for_loopback_connect() {
            let server = TcpServerChannel::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = server.local_addr().unwrap();
            let channel = TcpChannel::connect_begin(addr).unwrap();

            let mut mux = MioMultiplexer::new().unwrap();
            mux.register(&channel, Token(7), Ops::CONNECT).unwrap();

            let mut out = Vec::new();
            while out.is_empty() {
                Multiplexer::<TcpChannel>::select(&mut mux, &mut out).unwrap();
            }
            assert_eq!(Token(7), out[0].token);
            assert!(out[0].ready.contains(Ops::WRITE));
            mux.deregister(&channel).unwrap();
        }

        #[test]
        fn should_park_empty_interest_until_interest_arrives() {
            let server = TcpServerChannel::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = server.local_addr().unwrap();
            let channel = TcpChannel::connect_begin(addr).unwrap();

            let mut mux = MioMultiplexer::new().unwrap();
            mux.register(&channel, Token(3), Ops::NONE).unwrap();

            let mut out = Vec::new();
            assert_eq!(
                0,
                Multiplexer::<TcpChannel>::select_now(&mut mux, &mut out).unwrap()
            );

            mux.reregister(&channel, Token(3), Ops::CONNECT).unwrap();
            while out.is_empty() {
                Multiplexer::<TcpChannel>::select(&mut mux, &mut out).unwrap();
            }
            assert!(out[0].ready.contains(Ops::WRITE));
        }
    }
}
