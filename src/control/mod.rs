//! Runtime control channel between the injected component and the controller.
//!
//! The injected side announces its PID, streams [`ControlEvent`]s out in
//! enqueue order and applies every config snapshot the controller pushes.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::endpoint::Endpoint;

mod client;
pub mod codec;
pub mod proto;

pub use client::ControlClient;

/// Port the injected component dials when nothing else is configured.
pub const DEFAULT_CONTROLLER_PORT: u16 = 33321;

/// One intercepted connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    /// Socket handle the application connected
    pub handle: u64,
    /// Destination the application asked for
    pub target: Endpoint,
    /// Proxy configured at the time of the call, if any
    pub proxy: Option<Endpoint>,
    /// Name of the intercepted API
    pub syscall: String,
}

impl ConnectionEvent {
    pub fn to_wire(&self) -> proto::Connect {
        proto::Connect {
            handle: self.handle,
            addr: Some(proto::Address::from(&self.target)),
            proxy: self.proxy.as_ref().map(proto::Address::from),
            syscall: self.syscall.clone(),
        }
    }

    pub fn from_wire(connect: proto::Connect) -> crate::Result<Self> {
        let target = connect
            .addr
            .ok_or_else(|| crate::HookError::Control("connect event without address".to_string()))?;
        Ok(ConnectionEvent {
            handle: connect.handle,
            target: Endpoint::try_from(target)?,
            proxy: connect.proxy.map(Endpoint::try_from).transpose()?,
            syscall: connect.syscall,
        })
    }
}

/// Outbound telemetry produced by the detours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Connection(ConnectionEvent),
    SubprocessCreated(u32),
}

impl ControlEvent {
    pub fn to_message(&self) -> proto::InjecteeMessage {
        match self {
            ControlEvent::Connection(event) => proto::InjecteeMessage::connect(event.to_wire()),
            ControlEvent::SubprocessCreated(pid) => {
                proto::InjecteeMessage::subprocess_created(*pid)
            }
        }
    }
}

/// Producer side of the outbound event queue.
///
/// Pushing never blocks and never fails loudly: once the channel is gone the
/// events are dropped, which is what degraded mode wants.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl EventQueue {
    /// Create a queue and the receiver the control channel drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ControlEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue an event; returns whether anyone is still listening.
    pub fn push(&self, event: ControlEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> ConnectionEvent {
        ConnectionEvent {
            handle: 0x1F4,
            target: "93.184.216.34:80".parse().unwrap(),
            proxy: Some("10.0.0.1:1080".parse().unwrap()),
            syscall: "connect".to_string(),
        }
    }

    #[test]
    fn test_connection_event_wire_conversion() {
        let event = event();
        let back = ConnectionEvent::from_wire(event.to_wire()).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_connection_event_without_address_is_rejected() {
        let mut wire = event().to_wire();
        wire.addr = None;
        assert!(ConnectionEvent::from_wire(wire).is_err());
    }

    #[test]
    fn test_event_messages_use_opcodes() {
        let msg = ControlEvent::Connection(event()).to_message();
        assert_eq!(msg.opcode, proto::OPCODE_CONNECT);
        let msg = ControlEvent::SubprocessCreated(9).to_message();
        assert_eq!(msg.opcode, proto::OPCODE_SUBPID);
        assert_eq!(msg.subpid, Some(9));
    }

    #[test]
    fn test_queue_is_fifo_and_drops_after_close() {
        let (queue, mut rx) = EventQueue::channel();
        assert!(queue.push(ControlEvent::SubprocessCreated(1)));
        assert!(queue.push(ControlEvent::SubprocessCreated(2)));
        assert_eq!(rx.try_recv().unwrap(), ControlEvent::SubprocessCreated(1));
        assert_eq!(rx.try_recv().unwrap(), ControlEvent::SubprocessCreated(2));

        drop(rx);
        assert!(queue.is_closed());
        assert!(!queue.push(ControlEvent::SubprocessCreated(3)));
    }
}
