//! Controller and injected-side control channel talking over loopback TCP

#![cfg(feature = "controller")]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::SockAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use sockshook::{
    ChannelSink, ConfigCell, ConnectionEvent, ControlClient, ControlEvent, Controller, Endpoint,
    EventQueue, HookState, Interceptor, ProxyConfig, Result, SinkEvent, SocketApi, SocketHandle,
};

/// Socket layer that must never be reached.
struct Untouched;

impl SocketApi for Untouched {
    fn connect(&self, _socket: SocketHandle, _addr: &SockAddr) -> io::Result<()> {
        panic!("connect on a pass-through socket")
    }

    fn send(&self, _socket: SocketHandle, _buf: &[u8]) -> io::Result<usize> {
        panic!("send on a pass-through socket")
    }

    fn recv(&self, _socket: SocketHandle, _buf: &mut [u8]) -> io::Result<usize> {
        panic!("recv on a pass-through socket")
    }

    fn shutdown(&self, _socket: SocketHandle) -> io::Result<()> {
        panic!("shutdown on a pass-through socket")
    }

    fn set_nonblocking(&self, _socket: SocketHandle, _nonblocking: bool) -> io::Result<()> {
        panic!("mode change on a pass-through socket")
    }

    fn local_addr(&self, _socket: SocketHandle) -> io::Result<SockAddr> {
        Err(io::ErrorKind::NotConnected.into())
    }

    fn peer_addr(&self, _socket: SocketHandle) -> io::Result<SockAddr> {
        Err(io::ErrorKind::NotConnected.into())
    }
}

async fn start_controller(
    config: ProxyConfig,
) -> (Arc<Controller>, SocketAddr, UnboundedReceiver<SinkEvent>) {
    let (sink, events) = ChannelSink::channel();
    let controller = Controller::with_config(config, Arc::new(sink));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(controller.clone().serve(listener));
    (controller, addr, events)
}

struct Injectee {
    config: Arc<ConfigCell>,
    queue: EventQueue,
    task: JoinHandle<Result<()>>,
}

fn start_injectee(controller: SocketAddr, pid: u32) -> Injectee {
    let config = Arc::new(ConfigCell::default());
    let (queue, rx) = EventQueue::channel();
    let client = ControlClient::new(controller, pid, config.clone(), rx);
    Injectee {
        config,
        queue,
        task: tokio::spawn(client.run()),
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn next_event(events: &mut UnboundedReceiver<SinkEvent>) -> SinkEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("sink event timed out")
        .expect("sink closed")
}

#[tokio::test]
async fn test_attach_receives_current_config() {
    let initial = ProxyConfig::new()
        .with_proxy("10.0.0.1:1080".parse().unwrap())
        .with_logging(true);
    let (controller, addr, mut events) = start_controller(initial.clone()).await;

    let injectee = start_injectee(addr, 100);
    assert!(matches!(next_event(&mut events).await, SinkEvent::Attached(100)));
    assert!(wait_for(|| injectee.config.get() == initial).await);
    assert_eq!(controller.clients(), vec![100]);
}

#[tokio::test]
async fn test_config_changes_reach_every_session() {
    let (controller, addr, mut events) = start_controller(ProxyConfig::default()).await;

    let first = start_injectee(addr, 1);
    let second = start_injectee(addr, 2);
    next_event(&mut events).await;
    next_event(&mut events).await;
    assert!(wait_for(|| controller.clients() == vec![1, 2]).await);

    controller.set_proxy("10.0.0.1:1080".parse().unwrap());
    controller.set_subprocess(true);

    let expected = ProxyConfig::new()
        .with_proxy("10.0.0.1:1080".parse().unwrap())
        .with_subprocess(true);
    assert!(wait_for(|| first.config.get() == expected).await);
    assert!(wait_for(|| second.config.get() == expected).await);
}

#[tokio::test]
async fn test_cleared_proxy_stops_redirection() {
    let initial = ProxyConfig::new().with_proxy("10.0.0.1:1080".parse().unwrap());
    let (controller, addr, mut events) = start_controller(initial).await;

    let injectee = start_injectee(addr, 5);
    next_event(&mut events).await;
    assert!(wait_for(|| injectee.config.get().proxy.is_some()).await);

    controller.clear_proxy();
    assert!(wait_for(|| injectee.config.get().proxy.is_none()).await);

    // Every later connect goes straight to the original call.
    let state = Arc::new(HookState::new(injectee.config.clone(), injectee.queue.clone()));
    let interceptor = Interceptor::new(Untouched, state);
    let target = SockAddr::from("93.184.216.34:80".parse::<SocketAddr>().unwrap());
    assert!(interceptor
        .connect(1, &target, "connect", |_| panic!("dialed the proxy"))
        .is_none());
}

#[tokio::test]
async fn test_reports_reach_the_sink() {
    let (_controller, addr, mut events) = start_controller(ProxyConfig::default()).await;

    let injectee = start_injectee(addr, 42);
    assert!(matches!(next_event(&mut events).await, SinkEvent::Attached(42)));

    let event = ConnectionEvent {
        handle: 0x1f4,
        target: Endpoint::domain("example.com", 443),
        proxy: Some("10.0.0.1:1080".parse().unwrap()),
        syscall: "WSAConnectByNameW".to_string(),
    };
    assert!(injectee.queue.push(ControlEvent::Connection(event.clone())));
    assert!(injectee.queue.push(ControlEvent::SubprocessCreated(43)));

    match next_event(&mut events).await {
        SinkEvent::Connection { pid, event: got } => {
            assert_eq!(pid, 42);
            assert_eq!(got, event);
        }
        other => panic!("unexpected sink event: {:?}", other),
    }
    match next_event(&mut events).await {
        SinkEvent::Subprocess { pid, child } => assert_eq!((pid, child), (42, 43)),
        other => panic!("unexpected sink event: {:?}", other),
    }
}

#[tokio::test]
async fn test_close_degrades_the_injectee() {
    let initial = ProxyConfig::new().with_proxy("10.0.0.1:1080".parse().unwrap());
    let (controller, addr, mut events) = start_controller(initial).await;

    let injectee = start_injectee(addr, 7);
    next_event(&mut events).await;
    assert!(wait_for(|| injectee.config.get().proxy.is_some()).await);

    assert!(controller.close(7));
    assert!(matches!(next_event(&mut events).await, SinkEvent::Detached(7)));

    // The channel ends on the injected side and the config falls back.
    let _ = tokio::time::timeout(Duration::from_secs(2), injectee.task)
        .await
        .expect("client did not stop");
    assert_eq!(injectee.config.get(), ProxyConfig::default());
    assert!(injectee.queue.is_closed());
    assert!(controller.clients().is_empty());
    assert!(!controller.close(7));
}

#[tokio::test]
async fn test_duplicate_pid_is_turned_away() {
    let initial = ProxyConfig::new().with_logging(true);
    let (controller, addr, mut events) = start_controller(initial.clone()).await;

    let first = start_injectee(addr, 9);
    next_event(&mut events).await;
    assert!(wait_for(|| first.config.get() == initial).await);

    let second = start_injectee(addr, 9);
    let _ = tokio::time::timeout(Duration::from_secs(2), second.task)
        .await
        .expect("duplicate session was not closed");
    assert_eq!(second.config.get(), ProxyConfig::default());

    assert_eq!(controller.clients(), vec![9]);
    assert_eq!(first.config.get(), initial);
}

#[tokio::test]
async fn test_no_controller_means_pass_through() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let injectee = start_injectee(addr, 3);
    let result = injectee.task.await.unwrap();
    assert!(result.is_err());
    assert_eq!(injectee.config.get(), ProxyConfig::default());
    assert!(injectee.queue.is_closed());
}
