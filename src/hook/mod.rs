//! Interception of the socket connect family.
//!
//! The decision logic lives in [`Interceptor`], which talks to the operating
//! system only through [`SocketApi`]. On Windows the `winsock` module backs
//! that trait with the original (un-detoured) Winsock entry points and wires
//! the detours up through a [`HookTable`].

use std::io::{self, Read, Write};
use std::sync::Arc;

use socket2::{Domain, SockAddr};

use crate::config::ConfigCell;
use crate::control::EventQueue;
use crate::tracker::BlockingTracker;

mod interceptor;
mod table;
#[cfg(windows)]
pub(crate) mod winsock;

pub use interceptor::{Interceptor, Route};
pub use table::{Capability, HookTable, Patcher};

/// Raw socket handle value as the application sees it.
pub type SocketHandle = usize;

/// The un-intercepted socket operations a redirect needs.
///
/// Implementations must bypass the detours, otherwise the proxy dial would be
/// intercepted again.
pub trait SocketApi: Send + Sync {
    /// Connect `socket` to `addr` using the original connect.
    fn connect(&self, socket: SocketHandle, addr: &SockAddr) -> io::Result<()>;

    fn send(&self, socket: SocketHandle, buf: &[u8]) -> io::Result<usize>;

    fn recv(&self, socket: SocketHandle, buf: &mut [u8]) -> io::Result<usize>;

    /// Shut down both directions.
    fn shutdown(&self, socket: SocketHandle) -> io::Result<()>;

    fn set_nonblocking(&self, socket: SocketHandle, nonblocking: bool) -> io::Result<()>;

    fn local_addr(&self, socket: SocketHandle) -> io::Result<SockAddr>;

    fn peer_addr(&self, socket: SocketHandle) -> io::Result<SockAddr>;

    /// Address family the socket was created with, if it can be queried.
    fn domain(&self, socket: SocketHandle) -> Option<Domain> {
        let _ = socket;
        None
    }
}

impl<A: SocketApi + ?Sized> SocketApi for Arc<A> {
    fn connect(&self, socket: SocketHandle, addr: &SockAddr) -> io::Result<()> {
        (**self).connect(socket, addr)
    }

    fn send(&self, socket: SocketHandle, buf: &[u8]) -> io::Result<usize> {
        (**self).send(socket, buf)
    }

    fn recv(&self, socket: SocketHandle, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(socket, buf)
    }

    fn shutdown(&self, socket: SocketHandle) -> io::Result<()> {
        (**self).shutdown(socket)
    }

    fn set_nonblocking(&self, socket: SocketHandle, nonblocking: bool) -> io::Result<()> {
        (**self).set_nonblocking(socket, nonblocking)
    }

    fn local_addr(&self, socket: SocketHandle) -> io::Result<SockAddr> {
        (**self).local_addr(socket)
    }

    fn peer_addr(&self, socket: SocketHandle) -> io::Result<SockAddr> {
        (**self).peer_addr(socket)
    }

    fn domain(&self, socket: SocketHandle) -> Option<Domain> {
        (**self).domain(socket)
    }
}

/// Blocking byte stream over a socket handle, used for the SOCKS5 exchange.
pub struct SocketStream<'a, A: SocketApi + ?Sized> {
    api: &'a A,
    socket: SocketHandle,
}

impl<'a, A: SocketApi + ?Sized> SocketStream<'a, A> {
    pub fn new(api: &'a A, socket: SocketHandle) -> Self {
        Self { api, socket }
    }
}

impl<A: SocketApi + ?Sized> Read for SocketStream<'_, A> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.api.recv(self.socket, buf)
    }
}

impl<A: SocketApi + ?Sized> Write for SocketStream<'_, A> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.api.send(self.socket, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Everything the detours share: the config snapshot, the blocking-mode
/// tracker and the outbound event queue.
#[derive(Debug)]
pub struct HookState {
    pub config: Arc<ConfigCell>,
    pub tracker: BlockingTracker,
    pub events: EventQueue,
}

impl HookState {
    pub fn new(config: Arc<ConfigCell>, events: EventQueue) -> Self {
        Self {
            config,
            tracker: BlockingTracker::new(),
            events,
        }
    }
}
