//! Redirect decisions and the proxy dial for every connect-family API.

use std::io;
use std::net::{SocketAddr, SocketAddrV6};
use std::sync::Arc;

use socket2::{Domain, SockAddr};
use tracing::{debug, trace, warn};

use crate::control::{ConnectionEvent, ControlEvent};
use crate::endpoint::{same_address, Endpoint};
use crate::error::{HookError, Result};
use crate::services::resolve_name;
use crate::socks5;

use super::{HookState, SocketApi, SocketHandle, SocketStream};

/// Where a connect call should go.
#[derive(Debug, Clone)]
pub enum Route {
    /// Hand the call to the original API unchanged.
    Direct,
    /// Dial `proxy` and ask it to CONNECT to `target`.
    Proxy { proxy: SockAddr, target: Endpoint },
}

impl Route {
    /// The route as an IPv6 socket takes it: an IPv4 proxy is dialed through
    /// its IPv4-mapped address.
    pub fn for_ipv6_socket(self) -> Route {
        match self {
            Route::Proxy { proxy, target } => Route::Proxy {
                proxy: ipv4_mapped(proxy),
                target,
            },
            direct => direct,
        }
    }
}

fn ipv4_mapped(addr: SockAddr) -> SockAddr {
    match addr.as_socket() {
        Some(SocketAddr::V4(v4)) => {
            SockAddr::from(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0))
        }
        _ => addr,
    }
}

/// Decides, per call, whether a connect is redirected through the SOCKS5
/// proxy and performs the redirect.
///
/// Every `connect_*` method returns `None` when the call must be delegated to
/// the original API untouched; `Some` carries the outcome of a redirect.
pub struct Interceptor<A> {
    api: A,
    state: Arc<HookState>,
}

impl<A: SocketApi> Interceptor<A> {
    pub fn new(api: A, state: Arc<HookState>) -> Self {
        Self { api, state }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn state(&self) -> &Arc<HookState> {
        &self.state
    }

    /// Route a native destination. Non-IP families are never redirected.
    ///
    /// An IPv4-mapped destination is routed as the IPv4 address it maps. An
    /// IPv6 name means an IPv6 socket, which reaches an IPv4 proxy through
    /// the mapped form.
    pub fn route_native(&self, socket: SocketHandle, name: &SockAddr, syscall: &str) -> Route {
        let Some(target) = Endpoint::from_native(name) else {
            trace!(socket, syscall, family = ?name.family(), "not an IP destination");
            return Route::Direct;
        };
        let route = self.route(socket, target.unmapped(), syscall);
        if name.is_ipv6() {
            route.for_ipv6_socket()
        } else {
            route
        }
    }

    /// Route a destination.
    ///
    /// Loopback never leaves the host. Otherwise the attempt is logged if the
    /// config asks for it, and redirected unless there is no usable proxy or
    /// the destination is the proxy itself.
    pub fn route(&self, socket: SocketHandle, target: Endpoint, syscall: &str) -> Route {
        if target.is_loopback() {
            trace!(socket, %target, syscall, "loopback destination");
            return Route::Direct;
        }

        let config = self.state.config.get();
        if config.log {
            self.state.events.push(ControlEvent::Connection(ConnectionEvent {
                handle: socket as u64,
                target: target.clone(),
                proxy: config.proxy.clone(),
                syscall: syscall.to_string(),
            }));
        }

        let Some(proxy) = config.proxy_native() else {
            trace!(socket, %target, syscall, "no proxy configured");
            return Route::Direct;
        };
        if target
            .to_native()
            .is_some_and(|native| same_address(&native, &proxy))
        {
            debug!(socket, %target, syscall, "destination is the proxy");
            return Route::Direct;
        }

        debug!(socket, %target, syscall, "redirecting through proxy");
        Route::Proxy { proxy, target }
    }

    /// `connect` and `WSAConnect`.
    ///
    /// `dial` is the original call with the caller's extra arguments bound,
    /// so they reach the proxy dial as well.
    pub fn connect<F>(
        &self,
        socket: SocketHandle,
        name: &SockAddr,
        syscall: &str,
        dial: F,
    ) -> Option<Result<()>>
    where
        F: FnOnce(&SockAddr) -> io::Result<()>,
    {
        let Route::Proxy { proxy, target } = self.route_native(socket, name, syscall) else {
            return None;
        };
        Some(self.with_blocking(socket, false, || {
            self.redirect(socket, &proxy, &target, dial)
        }))
    }

    /// `WSAConnectByList`: redirect the first redirectable candidate and
    /// return the socket's local and peer addresses.
    pub fn connect_by_list(
        &self,
        socket: SocketHandle,
        candidates: &[SockAddr],
    ) -> Option<Result<(SockAddr, SockAddr)>> {
        for name in candidates {
            if let Route::Proxy { proxy, target } =
                self.route_native(socket, name, "WSAConnectByList")
            {
                return Some(self.with_blocking(socket, false, || {
                    self.redirect(socket, &proxy, &target, |addr| self.api.connect(socket, addr))?;
                    self.addresses(socket)
                }));
            }
        }
        None
    }

    /// `WSAConnectByNameA/W`. Names that are not literal IPs travel to the
    /// proxy as domains.
    pub fn connect_by_name(
        &self,
        socket: SocketHandle,
        node: &str,
        service: &str,
        syscall: &str,
    ) -> Option<Result<(SockAddr, SockAddr)>> {
        let Some(target) = resolve_name(node, service) else {
            trace!(socket, node, service, syscall, "unresolvable name");
            return None;
        };
        let mut route = self.route(socket, target.unmapped(), syscall);
        if self.api.domain(socket) == Some(Domain::IPV6) {
            route = route.for_ipv6_socket();
        }
        let Route::Proxy { proxy, target } = route else {
            return None;
        };
        Some(self.with_blocking(socket, false, || {
            self.redirect(socket, &proxy, &target, |addr| self.api.connect(socket, addr))?;
            self.addresses(socket)
        }))
    }

    /// `ConnectEx`: redirect in blocking mode and give the socket back in the
    /// mode the application asked for. `start` then issues the initial send
    /// the way the caller's call would have, so its completion reaches the
    /// caller through the usual channel (overlapped event or completion port).
    pub fn connect_ex<T, F>(
        &self,
        socket: SocketHandle,
        name: &SockAddr,
        start: F,
    ) -> Option<Result<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        let Route::Proxy { proxy, target } = self.route_native(socket, name, "ConnectEx") else {
            return None;
        };
        let connected = self.with_blocking(socket, true, || {
            self.redirect(socket, &proxy, &target, |addr| self.api.connect(socket, addr))
        });
        Some(connected.and_then(|()| start()))
    }

    /// Observe an `FIONBIO` request.
    pub fn record_blocking(&self, socket: SocketHandle, nonblocking: bool) {
        trace!(socket, nonblocking, "blocking mode requested");
        self.state.tracker.record(socket, nonblocking);
    }

    /// Report a child process if the controller wants to follow subprocesses.
    pub fn process_created(&self, pid: u32) -> bool {
        if !self.state.config.get().subprocess {
            return false;
        }
        debug!(pid, "reporting subprocess");
        self.state.events.push(ControlEvent::SubprocessCreated(pid))
    }

    /// Dial the proxy and run the SOCKS5 exchange. A failed exchange shuts
    /// the socket down before the error is returned.
    fn redirect<F>(
        &self,
        socket: SocketHandle,
        proxy: &SockAddr,
        target: &Endpoint,
        dial: F,
    ) -> Result<()>
    where
        F: FnOnce(&SockAddr) -> io::Result<()>,
    {
        dial(proxy).map_err(HookError::ProxyConnect)?;

        let mut stream = SocketStream::new(&self.api, socket);
        if let Err(e) = socks5::negotiate(&mut stream, target) {
            warn!(socket, %target, error = %e, "SOCKS5 negotiation failed");
            if let Err(err) = self.api.shutdown(socket) {
                debug!(socket, error = %err, "shutdown after failed negotiation");
            }
            return Err(e);
        }

        debug!(socket, %target, "connected through proxy");
        Ok(())
    }

    /// Run `f` with the socket in blocking mode when it was last set
    /// non-blocking (or when `force` is set), then restore the mode the
    /// application last requested.
    fn with_blocking<T>(
        &self,
        socket: SocketHandle,
        force: bool,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let nonblocking = self.state.tracker.is_nonblocking(socket);
        if !force && !nonblocking {
            return f();
        }

        self.api
            .set_nonblocking(socket, false)
            .map_err(HookError::ProxyConnect)?;
        let result = f();
        if nonblocking {
            if let Err(e) = self.api.set_nonblocking(socket, true) {
                warn!(socket, error = %e, "failed to restore non-blocking mode");
            }
        }
        result
    }

    fn addresses(&self, socket: SocketHandle) -> Result<(SockAddr, SockAddr)> {
        let local = self.api.local_addr(socket)?;
        let remote = self.api.peer_addr(socket)?;
        Ok((local, remote))
    }
}
