use std::io::{self, Write};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::control::ConnectionEvent;

/// Receives what attached processes report.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// A process completed the `pid` handshake.
    async fn on_attach(&self, pid: u32);

    /// A process reported a connection attempt.
    async fn on_connect(&self, pid: u32, event: &ConnectionEvent);

    /// A process reported a child it created.
    async fn on_subprocess(&self, pid: u32, child: u32) {
        let _ = (pid, child);
    }

    /// The session of a process ended.
    async fn on_detach(&self, pid: u32);
}

/// One line per connection: `{pid}: {syscall} {target} via {proxy}`.
pub fn format_connection(pid: u32, event: &ConnectionEvent) -> String {
    match &event.proxy {
        Some(proxy) => format!("{}: {} {} via {}", pid, event.syscall, event.target, proxy),
        None => format!("{}: {} {}", pid, event.syscall, event.target),
    }
}

/// Human readable lines on a writer, stdout by default.
pub struct ConsoleSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    fn line(&self, line: String) {
        let mut out = self.out.lock();
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            warn!(error = %e, "failed to write console line");
        }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::stdout()
    }
}

#[async_trait]
impl EventSink for ConsoleSink {
    async fn on_attach(&self, pid: u32) {
        self.line(format!("{}: established injectee connection", pid));
    }

    async fn on_connect(&self, pid: u32, event: &ConnectionEvent) {
        self.line(format_connection(pid, event));
    }

    async fn on_subprocess(&self, pid: u32, child: u32) {
        self.line(format!("{}: subprocess {} created", pid, child));
    }

    async fn on_detach(&self, pid: u32) {
        self.line(format!("{}: closed", pid));
    }
}

/// Structured `tracing` records, the connection event attached as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn on_attach(&self, pid: u32) {
        info!(pid, "process attached");
    }

    async fn on_connect(&self, pid: u32, event: &ConnectionEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(pid, event = %json, "connection"),
            Err(e) => warn!(pid, error = %e, "failed to encode connection event"),
        }
    }

    async fn on_subprocess(&self, pid: u32, child: u32) {
        info!(pid, child, "subprocess created");
    }

    async fn on_detach(&self, pid: u32) {
        info!(pid, "process detached");
    }
}

/// Event forwarded by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Attached(u32),
    Connection { pid: u32, event: ConnectionEvent },
    Subprocess { pid: u32, child: u32 },
    Detached(u32),
}

/// Forwards everything into a channel, e.g. for a UI.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) {
        // Nobody listening any more.
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn on_attach(&self, pid: u32) {
        self.send(SinkEvent::Attached(pid));
    }

    async fn on_connect(&self, pid: u32, event: &ConnectionEvent) {
        self.send(SinkEvent::Connection {
            pid,
            event: event.clone(),
        });
    }

    async fn on_subprocess(&self, pid: u32, child: u32) {
        self.send(SinkEvent::Subprocess { pid, child });
    }

    async fn on_detach(&self, pid: u32) {
        self.send(SinkEvent::Detached(pid));
    }
}
