//! Process-wide runtime of the injected component.
//!
//! A [`Runtime`] owns the shared [`HookState`] and the control channel
//! thread. It is attached before the detours are installed and detached
//! after they are disabled.

use std::env;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::ConfigCell;
use crate::control::{ControlClient, EventQueue, DEFAULT_CONTROLLER_PORT};
use crate::error::{HookError, Result};
use crate::hook::HookState;

/// Environment variable overriding the controller endpoint (`ip:port`).
pub const CONTROLLER_ENV: &str = "SOCKSHOOK_CONTROLLER";

const THREAD_NAME: &str = "sockshook-control";

static CURRENT: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

/// Startup options of the injected component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Controller to report to
    pub controller: SocketAddr,
    /// PID announced to the controller
    pub pid: u32,
}

impl RuntimeOptions {
    /// Defaults: controller on `127.0.0.1:33321`, this process's PID.
    pub fn new() -> Self {
        Self {
            controller: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_CONTROLLER_PORT)),
            pid: std::process::id(),
        }
    }

    pub fn with_controller(mut self, controller: SocketAddr) -> Self {
        self.controller = controller;
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Defaults, with the controller taken from [`CONTROLLER_ENV`] if set.
    pub fn from_env() -> Result<Self> {
        let options = Self::new();
        match env::var(CONTROLLER_ENV) {
            Ok(value) => Ok(options.with_controller(parse_controller(&value)?)),
            Err(env::VarError::NotPresent) => Ok(options),
            Err(e) => Err(HookError::ConfigError(format!("{}: {}", CONTROLLER_ENV, e))),
        }
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Literal `ip:port` only: this runs from `DllMain`, where a name lookup
/// under the loader lock can deadlock.
fn parse_controller(value: &str) -> Result<SocketAddr> {
    let value = value.trim();
    value
        .parse()
        .map_err(|e| HookError::ConfigError(format!("invalid controller '{}': {}", value, e)))
}

/// Shared state plus the control channel thread.
pub struct Runtime {
    state: Arc<HookState>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Start a runtime that is not registered as the process-wide one.
    ///
    /// The control channel runs on its own thread with a current-thread
    /// tokio runtime. Until the controller pushes a config, and again after
    /// the channel fails, the config is the default one.
    pub fn start(options: RuntimeOptions) -> Result<Self> {
        let config = Arc::new(ConfigCell::default());
        let (events, rx) = EventQueue::channel();
        let state = Arc::new(HookState::new(config.clone(), events));
        let client = ControlClient::new(options.controller, options.pid, config.clone(), rx);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!(error = %e, "failed to build control runtime, proxying disabled");
                        return;
                    }
                };

                rt.block_on(async move {
                    tokio::select! {
                        result = client.run() => {
                            if let Err(e) = result {
                                debug!(error = %e, "control channel stopped");
                            }
                        }
                        _ = shutdown_rx => debug!("control channel shut down"),
                    }
                });
                config.reset();
            })?;

        debug!(controller = %options.controller, pid = options.pid, "runtime started");
        Ok(Self {
            state,
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Start the process-wide runtime, or return the one already attached.
    pub fn attach(options: RuntimeOptions) -> Result<Arc<Runtime>> {
        let mut current = CURRENT.write();
        if let Some(runtime) = current.as_ref() {
            return Ok(runtime.clone());
        }
        let runtime = Arc::new(Self::start(options)?);
        *current = Some(runtime.clone());
        Ok(runtime)
    }

    /// The process-wide runtime, if attached.
    pub fn current() -> Option<Arc<Runtime>> {
        CURRENT.read().clone()
    }

    /// Unregister the process-wide runtime and signal its control channel to
    /// stop. Does not wait for the thread.
    pub fn detach() -> Option<Arc<Runtime>> {
        let runtime = CURRENT.write().take()?;
        runtime.shutdown();
        Some(runtime)
    }

    pub fn state(&self) -> &Arc<HookState> {
        &self.state
    }

    /// Ask the control channel to stop. Idempotent.
    pub fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the control thread to exit. Never call this while holding
    /// the loader lock.
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!("control thread panicked");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::control::proto::{InjecteeMessage, InjectorMessage, OPCODE_PID};
    use prost::Message;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn read_message(stream: &mut std::net::TcpStream) -> InjecteeMessage {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).unwrap();
        let mut buf = vec![0u8; u32::from_le_bytes(len) as usize];
        stream.read_exact(&mut buf).unwrap();
        InjecteeMessage::decode(buf.as_slice()).unwrap()
    }

    fn write_message(stream: &mut std::net::TcpStream, msg: &InjectorMessage) {
        let body = msg.encode_to_vec();
        stream.write_all(&(body.len() as u32).to_le_bytes()).unwrap();
        stream.write_all(&body).unwrap();
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_options_defaults_and_builders() {
        let options = RuntimeOptions::new();
        assert_eq!(options.controller, "127.0.0.1:33321".parse().unwrap());
        assert_eq!(options.pid, std::process::id());

        let options = options
            .with_controller("127.0.0.1:4000".parse().unwrap())
            .with_pid(12);
        assert_eq!(options.controller.port(), 4000);
        assert_eq!(options.pid, 12);
    }

    #[test]
    fn test_parse_controller() {
        assert_eq!(
            parse_controller(" 127.0.0.1:4000 ").unwrap(),
            "127.0.0.1:4000".parse().unwrap()
        );
        assert_eq!(
            parse_controller("[::1]:4000").unwrap(),
            "[::1]:4000".parse().unwrap()
        );
        assert!(parse_controller("127.0.0.1").is_err());
        assert!(parse_controller("not an address").is_err());
    }

    #[test]
    fn test_parse_controller_does_not_resolve_names() {
        let err = parse_controller("localhost:4000").unwrap_err();
        assert!(matches!(err, HookError::ConfigError(_)));
    }

    #[test]
    fn test_start_announces_pid_and_applies_config() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let options = RuntimeOptions::new()
            .with_controller(listener.local_addr().unwrap())
            .with_pid(4321);
        let runtime = Runtime::start(options).unwrap();

        let (mut stream, _) = listener.accept().unwrap();
        let hello = read_message(&mut stream);
        assert_eq!(hello.opcode, OPCODE_PID);
        assert_eq!(hello.pid, Some(4321));

        let config = ProxyConfig::new().with_proxy("10.0.0.1:1080".parse().unwrap());
        write_message(&mut stream, &InjectorMessage::config(Some(&config)));
        assert!(wait_for(|| runtime.state().config.get() == config));

        runtime.shutdown();
        runtime.join();
        assert_eq!(runtime.state().config.get(), ProxyConfig::default());
    }

    #[test]
    fn test_global_attach_and_detach() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let controller = listener.local_addr().unwrap();
        drop(listener);

        let options = RuntimeOptions::new().with_controller(controller);
        let first = Runtime::attach(options.clone()).unwrap();
        let second = Runtime::attach(options).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Runtime::current().is_some());

        let detached = Runtime::detach().unwrap();
        assert!(Arc::ptr_eq(&detached, &first));
        assert!(Runtime::current().is_none());
        detached.join();
        assert_eq!(detached.state().config.get(), ProxyConfig::default());
    }
}
