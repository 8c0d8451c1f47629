//! Controller side of the control channel.
//!
//! Accepts injected processes, pushes the current [`ProxyConfig`] on attach
//! and on every change, and hands what they report to an [`EventSink`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::control::codec::{read_frame, write_frame};
use crate::control::proto::{
    InjecteeMessage, InjectorMessage, OPCODE_CONNECT, OPCODE_PID, OPCODE_SUBPID,
};
use crate::control::ConnectionEvent;
use crate::endpoint::Endpoint;
use crate::error::Result;

mod sink;

pub use sink::{format_connection, ChannelSink, ConsoleSink, EventSink, LogSink, SinkEvent};

enum Command {
    Config(InjectorMessage),
    Close,
}

/// Serves injected processes.
pub struct Controller {
    config: Mutex<ProxyConfig>,
    sessions: Mutex<HashMap<u32, mpsc::UnboundedSender<Command>>>,
    sink: Arc<dyn EventSink>,
}

impl Controller {
    pub fn new(sink: Arc<dyn EventSink>) -> Arc<Self> {
        Self::with_config(ProxyConfig::default(), sink)
    }

    pub fn with_config(config: ProxyConfig, sink: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            sessions: Mutex::new(HashMap::new()),
            sink,
        })
    }

    /// Accept sessions until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "controller listening");
        }
        loop {
            let (stream, peer) = listener.accept().await?;
            let controller = self.clone();
            tokio::spawn(async move {
                controller.session(stream, peer).await;
            });
        }
    }

    /// Current config snapshot.
    pub fn config(&self) -> ProxyConfig {
        self.config.lock().clone()
    }

    pub fn set_proxy(&self, proxy: Endpoint) {
        self.update(|config| config.proxy = Some(proxy));
    }

    pub fn clear_proxy(&self) {
        self.update(|config| config.proxy = None);
    }

    pub fn set_logging(&self, enabled: bool) {
        self.update(|config| config.log = enabled);
    }

    pub fn set_subprocess(&self, enabled: bool) {
        self.update(|config| config.subprocess = enabled);
    }

    /// PIDs with a live session, ascending.
    pub fn clients(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.sessions.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// End the session of `pid`. Returns whether there was one.
    pub fn close(&self, pid: u32) -> bool {
        match self.sessions.lock().get(&pid) {
            Some(tx) => tx.send(Command::Close).is_ok(),
            None => false,
        }
    }

    /// Change the config and push the new snapshot to every session.
    ///
    /// The config lock is held across the broadcast and attach takes it
    /// first as well, so every session sees snapshots in change order.
    fn update(&self, change: impl FnOnce(&mut ProxyConfig)) {
        let mut config = self.config.lock();
        change(&mut config);
        debug!(config = ?*config, "config changed");

        let sessions = self.sessions.lock();
        for (pid, tx) in sessions.iter() {
            if tx.send(Command::Config(InjectorMessage::config(Some(&*config)))).is_err() {
                debug!(pid, "session gone before config push");
            }
        }
    }

    fn attach(&self, pid: u32, tx: mpsc::UnboundedSender<Command>) -> bool {
        let config = self.config.lock();
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&pid) {
            return false;
        }
        // Cannot fail, the receiver is still in the caller's hands.
        let _ = tx.send(Command::Config(InjectorMessage::config(Some(&*config))));
        sessions.insert(pid, tx);
        true
    }

    fn detach(&self, pid: u32) {
        self.sessions.lock().remove(&pid);
    }

    async fn session(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        stream.set_nodelay(true).ok();
        let (mut reader, mut writer) = stream.into_split();

        let pid = match read_frame::<_, InjecteeMessage>(&mut reader).await {
            Ok(InjecteeMessage {
                opcode,
                pid: Some(pid),
                ..
            }) if opcode == OPCODE_PID => pid,
            Ok(msg) => {
                warn!(%peer, opcode = %msg.opcode, "session did not start with pid");
                return;
            }
            Err(e) => {
                warn!(%peer, error = %e, "failed to read pid");
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if !self.attach(pid, tx) {
            warn!(%peer, pid, "pid already attached");
            return;
        }
        debug!(%peer, pid, "session attached");
        self.sink.on_attach(pid).await;

        let result = tokio::select! {
            result = self.read_reports(pid, &mut reader) => result,
            result = write_commands(&mut writer, rx) => result,
        };
        if let Err(e) = result {
            debug!(pid, error = %e, "session ended");
        }

        self.detach(pid);
        self.sink.on_detach(pid).await;
    }

    async fn read_reports(&self, pid: u32, reader: &mut OwnedReadHalf) -> Result<()> {
        loop {
            let msg: InjecteeMessage = read_frame(reader).await?;
            match msg.opcode.as_str() {
                OPCODE_CONNECT => match msg.connect.map(ConnectionEvent::from_wire) {
                    Some(Ok(event)) => self.sink.on_connect(pid, &event).await,
                    Some(Err(e)) => warn!(pid, error = %e, "dropping malformed connect report"),
                    None => warn!(pid, "connect message without payload"),
                },
                OPCODE_SUBPID => match msg.subpid {
                    Some(child) => self.sink.on_subprocess(pid, child).await,
                    None => warn!(pid, "subpid message without pid"),
                },
                other => debug!(pid, opcode = other, "ignoring message"),
            }
        }
    }
}

async fn write_commands(
    writer: &mut OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Command>,
) -> Result<()> {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Config(msg) => write_frame(writer, &msg).await?,
            Command::Close => break,
        }
    }
    Ok(())
}
