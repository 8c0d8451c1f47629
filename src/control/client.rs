use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ConfigCell, ProxyConfig};
use crate::error::{HookError, Result};

use super::codec::{read_frame, write_frame};
use super::proto::{InjecteeMessage, InjectorMessage, OPCODE_CONFIG};
use super::ControlEvent;

/// Injected side of the control channel.
pub struct ControlClient {
    endpoint: SocketAddr,
    pid: u32,
    config: Arc<ConfigCell>,
    events: mpsc::UnboundedReceiver<ControlEvent>,
}

impl ControlClient {
    pub fn new(
        endpoint: SocketAddr,
        pid: u32,
        config: Arc<ConfigCell>,
        events: mpsc::UnboundedReceiver<ControlEvent>,
    ) -> Self {
        Self {
            endpoint,
            pid,
            config,
            events,
        }
    }

    /// Connect, announce the PID, then pump config in and events out until
    /// either direction fails or the controller hangs up.
    ///
    /// Whatever ends the session, the config is reset so the detours fall
    /// back to plain pass-through.
    pub async fn run(mut self) -> Result<()> {
        let result = self.session().await;
        self.config.reset();
        match &result {
            Ok(()) => debug!(endpoint = %self.endpoint, "control channel closed"),
            Err(e) => warn!(endpoint = %self.endpoint, error = %e, "control channel failed, proxying disabled"),
        }
        result
    }

    async fn session(&mut self) -> Result<()> {
        let stream = TcpStream::connect(self.endpoint).await.map_err(|e| {
            HookError::Control(format!("Failed to connect to controller {}: {}", self.endpoint, e))
        })?;
        stream.set_nodelay(true).ok();
        let (mut reader, mut writer) = stream.into_split();

        write_frame(&mut writer, &InjecteeMessage::announce_pid(self.pid)).await?;
        debug!(endpoint = %self.endpoint, pid = self.pid, "control channel established");

        tokio::select! {
            result = read_updates(&mut reader, &self.config) => result,
            result = write_events(&mut writer, &mut self.events) => result,
        }
    }
}

async fn read_updates(reader: &mut OwnedReadHalf, config: &ConfigCell) -> Result<()> {
    loop {
        let msg: InjectorMessage = read_frame(reader).await?;
        if msg.opcode != OPCODE_CONFIG {
            debug!(opcode = %msg.opcode, "ignoring unknown controller message");
            continue;
        }

        match msg.config {
            Some(update) => {
                let update = ProxyConfig::try_from(update)?;
                debug!(?update, "config updated");
                config.set(update);
            }
            None => {
                debug!("config cleared");
                config.reset();
            }
        }
    }
}

async fn write_events(
    writer: &mut OwnedWriteHalf,
    events: &mut mpsc::UnboundedReceiver<ControlEvent>,
) -> Result<()> {
    while let Some(event) = events.recv().await {
        write_frame(writer, &event.to_message()).await?;
    }
    Ok(())
}
