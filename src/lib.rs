//! sockshook - in-process SOCKS5 redirection of socket connects
//!
//! Loaded into a host process, this library detours the Winsock connect
//! family and sends outbound TCP connections through a SOCKS5 proxy, without
//! the application noticing. What to proxy is decided at runtime by a
//! controller the library reports to over a small protobuf control channel:
//! - `connect`, `WSAConnect`, `WSAConnectByList`, `WSAConnectByNameA/W` and
//!   `ConnectEx` are redirected; loopback and the proxy itself never are
//! - `ioctlsocket`/`WSAIoctl(FIONBIO)` are observed so redirects on
//!   non-blocking sockets run in blocking mode and restore the caller's mode
//! - every attempt can be reported to the controller, as can created
//!   subprocesses
//! - if the controller goes away the library falls back to plain
//!   pass-through and the host keeps running
//!
//! The decision logic is platform independent and works on anything that
//! implements [`SocketApi`]; only the detours themselves are Windows-only.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sockshook::{ConfigCell, EventQueue, HookState, ProxyConfig};
//!
//! let config = ProxyConfig::from_json(r#"{"proxy": "10.0.0.1:1080", "log": true}"#).unwrap();
//! let (events, _rx) = EventQueue::channel();
//! let state = HookState::new(Arc::new(ConfigCell::new(config)), events);
//!
//! assert!(state.config.get().log);
//! assert!(state.config.get().proxy_native().is_some());
//! ```
//!
//! # Controller
//!
//! With the `controller` feature, [`Controller`] serves injected processes:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sockshook::{ConsoleSink, Controller};
//!
//! # async fn run() -> sockshook::Result<()> {
//! let controller = Controller::new(Arc::new(ConsoleSink::stdout()));
//! controller.set_proxy("127.0.0.1:1080".parse()?);
//! controller.set_logging(true);
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:33321").await?;
//! controller.serve(listener).await
//! # }
//! ```

pub mod config;
pub mod control;
#[cfg(feature = "controller")]
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod hook;
pub mod runtime;
pub mod services;
pub mod socks5;
pub mod tracker;

#[cfg(windows)]
mod dll;

// Re-export commonly used items
pub use config::{ConfigCell, ProxyConfig};
pub use endpoint::{is_loopback, same_address, Endpoint};
pub use error::{HookError, ReplyCode, Result, Socks5ErrorKind};
pub use tracker::BlockingTracker;

// Re-export control channel types
pub use control::{
    ConnectionEvent, ControlClient, ControlEvent, EventQueue, DEFAULT_CONTROLLER_PORT,
};

// Re-export interception types
pub use hook::{
    Capability, HookState, HookTable, Interceptor, Patcher, Route, SocketApi, SocketHandle,
    SocketStream,
};

// Re-export runtime types
pub use runtime::{Runtime, RuntimeOptions, CONTROLLER_ENV};

#[cfg(feature = "controller")]
pub use controller::{ChannelSink, ConsoleSink, Controller, EventSink, LogSink, SinkEvent};
