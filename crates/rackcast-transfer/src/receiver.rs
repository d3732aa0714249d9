//! Inbound side: a listener thread that decodes datagrams and routes each
//! message by exact address match.
//!
//! Undecodable datagrams, unknown addresses and bad argument lists are
//! logged and dropped. Nothing that arrives on the socket stops the listener.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, OscError, RouteError};
use crate::osc::{decode_packet, ArgCursor, OscMessage};
use crate::registry::TransferRegistry;

pub const REGISTER_ADDRESS: &str = "/register";
pub const KEEPALIVE_ADDRESS: &str = "/keepalive";

/// Largest datagram we accept.
const RECV_BUFFER: usize = 65_536;
/// Kernel receive buffer.
const UDP_RECV_BUFFER: usize = 1024 * 1024;
/// Read timeout, so the loop notices shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type RouteHandler =
    Box<dyn Fn(&mut ArgCursor<'_>, SocketAddr) -> Result<(), OscError> + Send + Sync>;

/// Address -> handler table.
#[derive(Default)]
pub struct Routes {
    table: HashMap<String, RouteHandler>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route, builder style. A later route for the same address wins.
    pub fn route<F>(mut self, address: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut ArgCursor<'_>, SocketAddr) -> Result<(), OscError> + Send + Sync + 'static,
    {
        self.insert(address, handler);
        self
    }

    pub fn insert<F>(&mut self, address: impl Into<String>, handler: F)
    where
        F: Fn(&mut ArgCursor<'_>, SocketAddr) -> Result<(), OscError> + Send + Sync + 'static,
    {
        self.table.insert(address.into(), Box::new(handler));
    }

    /// Take every route from `other`. Existing addresses are kept.
    pub fn merge(&mut self, other: Routes) {
        for (address, handler) in other.table {
            if self.table.contains_key(&address) {
                warn!(%address, "route already installed, ignoring duplicate");
                continue;
            }
            self.table.insert(address, handler);
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.table.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Run the handler for `msg`. The handler must consume every argument.
    pub fn dispatch(&self, msg: &OscMessage, from: SocketAddr) -> Result<(), RouteError> {
        let handler = self
            .table
            .get(&msg.address)
            .ok_or_else(|| RouteError::NoRoute(msg.address.clone()))?;
        let mut args = msg.cursor();
        handler(&mut args, from)
            .and_then(|()| args.finish())
            .map_err(|source| RouteError::Arguments {
                address: msg.address.clone(),
                source,
            })
    }
}

/// `/ack_chunk transferId:i chunkNum:i` -> `TransferRegistry::ack`.
pub fn ack_route(
    registry: TransferRegistry,
) -> impl Fn(&mut ArgCursor<'_>, SocketAddr) -> Result<(), OscError> + Send + Sync + 'static {
    move |args: &mut ArgCursor<'_>, _from: SocketAddr| {
        let transfer_id = args.int32()?;
        let chunk_num = args.int32()?;
        // negative chunk numbers can never match a chunk
        if let Ok(chunk_num) = u32::try_from(chunk_num) {
            registry.ack(transfer_id, chunk_num);
        }
        Ok(())
    }
}

/// Listener counters.
#[derive(Default)]
pub struct ReceiveStats {
    pub datagrams: AtomicU64,
    pub messages: AtomicU64,
    pub malformed: AtomicU64,
    pub unrouted: AtomicU64,
}

pub struct Receiver {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stats: Arc<ReceiveStats>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Receiver {
    /// Spawn the listener on an already bound socket.
    pub fn start(socket: UdpSocket, routes: Routes) -> Result<Self, BridgeError> {
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ReceiveStats::default());

        let (r, s) = (running.clone(), stats.clone());
        let handle = thread::Builder::new()
            .name("rackcast-listen".into())
            .spawn(move || listen(socket, routes, r, s))?;

        info!(%local_addr, "receiver listening");
        Ok(Self {
            local_addr,
            running,
            stats,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &ReceiveStats {
        &self.stats
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn listen(socket: UdpSocket, routes: Routes, running: Arc<AtomicBool>, stats: Arc<ReceiveStats>) {
    let mut buf = vec![0u8; RECV_BUFFER];

    while running.load(Ordering::Acquire) {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            // Windows reports ICMP port unreachable from earlier sends here.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                warn!("receive failed: {}", e);
                thread::sleep(POLL_INTERVAL);
                continue;
            }
        };
        stats.datagrams.fetch_add(1, Ordering::Relaxed);
        handle_datagram(&routes, &buf[..n], from, &stats);
    }

    debug!("receiver stopped");
}

fn handle_datagram(routes: &Routes, data: &[u8], from: SocketAddr, stats: &ReceiveStats) {
    let packet = match decode_packet(data) {
        Ok(packet) => packet,
        Err(e) => {
            stats.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(%from, len = data.len(), "dropping undecodable datagram: {}", e);
            return;
        }
    };

    for msg in packet.into_messages() {
        stats.messages.fetch_add(1, Ordering::Relaxed);
        match routes.dispatch(&msg, from) {
            Ok(()) => {}
            Err(RouteError::NoRoute(address)) => {
                stats.unrouted.fetch_add(1, Ordering::Relaxed);
                warn!(%from, %address, "no route for message");
            }
            Err(e) => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(%from, "{}", e);
            }
        }
    }
}

/// Bind the listening socket, moving up one port at a time while the port is
/// taken. Port 0 binds an ephemeral port in one attempt.
pub fn bind_with_retries(base: SocketAddr, max_retries: u16) -> Result<UdpSocket, BridgeError> {
    let first = base.port();
    let last = if first == 0 { 0 } else { first.saturating_add(max_retries) };

    let mut last_err = None;
    for port in first..=last {
        let addr = SocketAddr::new(base.ip(), port);
        match create_recv_socket(addr) {
            Ok(socket) => {
                if port != first {
                    info!(port, wanted = first, "rx port was taken, using the next free one");
                }
                return Ok(socket);
            }
            Err(e) => {
                debug!(port, "bind failed: {}", e);
                last_err = Some(e);
            }
        }
    }

    Err(BridgeError::Bind {
        first,
        last,
        source: last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrInUse)),
    })
}

fn create_recv_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(false)?;
    socket.set_recv_buffer_size(UDP_RECV_BUFFER)?;
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::{unbounded, Sender};

    use super::*;
    use crate::osc::OscStream;

    const WAIT: Duration = Duration::from_secs(2);

    fn from() -> SocketAddr {
        "10.0.0.2:7746".parse().unwrap()
    }

    fn echo_routes(tx: Sender<(i32, String)>) -> Routes {
        Routes::new().route("/param", move |args, _| {
            let id = args.int32()?;
            let name = args.string()?.to_owned();
            let _ = tx.send((id, name));
            Ok(())
        })
    }

    #[test]
    fn dispatch_by_exact_address() {
        let (tx, rx) = unbounded();
        let routes = echo_routes(tx);

        let msg = OscMessage::new("/param").arg(3).arg("cutoff");
        routes.dispatch(&msg, from()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), (3, "cutoff".to_string()));

        let err = routes.dispatch(&OscMessage::new("/param/x"), from()).unwrap_err();
        assert_eq!(err, RouteError::NoRoute("/param/x".into()));
    }

    #[test]
    fn dispatch_rejects_bad_arguments() {
        let (tx, rx) = unbounded();
        let routes = echo_routes(tx);

        let extra = OscMessage::new("/param").arg(3).arg("cutoff").arg(1.0f32);
        assert!(matches!(
            routes.dispatch(&extra, from()),
            Err(RouteError::Arguments { source: OscError::ExcessArguments(1), .. })
        ));

        let wrong = OscMessage::new("/param").arg("cutoff").arg(3);
        assert!(matches!(
            routes.dispatch(&wrong, from()),
            Err(RouteError::Arguments { source: OscError::WrongArgumentType { .. }, .. })
        ));
        // the handler ran for the excess-args case before the check failed
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn merge_keeps_existing_routes() {
        let (tx, rx) = unbounded();
        let mut routes = echo_routes(tx);
        routes.merge(
            Routes::new()
                .route("/param", |_, _| Ok(()))
                .route("/other", |_, _| Ok(())),
        );
        assert_eq!(routes.len(), 2);
        assert!(routes.contains("/other"));

        routes
            .dispatch(&OscMessage::new("/param").arg(1).arg("q"), from())
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().0, 1);
    }

    #[test]
    fn listener_survives_garbage() {
        let (tx, rx) = unbounded();
        let socket = bind_with_retries("127.0.0.1:0".parse().unwrap(), 0).unwrap();
        let receiver = Receiver::start(socket, echo_routes(tx)).unwrap();
        let target = receiver.local_addr();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"not osc at all", target).unwrap();
        client
            .send_to(&OscMessage::new("/nowhere").encode().unwrap(), target)
            .unwrap();

        let mut stream = OscStream::new(256);
        stream.begin_bundle().unwrap();
        stream
            .write_message(&OscMessage::new("/param").arg(7).arg("resonance"))
            .unwrap();
        stream.end_bundle().unwrap();
        client.send_to(stream.as_bytes(), target).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (7, "resonance".to_string()));
        assert_eq!(receiver.stats().malformed.load(Ordering::Relaxed), 1);
        assert_eq!(receiver.stats().unrouted.load(Ordering::Relaxed), 1);
        receiver.shutdown();
    }

    #[test]
    fn bind_moves_past_taken_port() {
        let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let base = SocketAddr::new("127.0.0.1".parse().unwrap(), port);

        let socket = bind_with_retries(base, 5).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), port);

        assert!(matches!(
            bind_with_retries(base, 0),
            Err(BridgeError::Bind { .. })
        ));
    }

    #[test]
    fn ack_route_forwards_to_registry() {
        use crate::logging::NullLogger;
        use crate::registry::{BuilderSink, RegistryConfig};
        use crate::scheduler::{RetryTimer, Task};
        use crate::builder::MessageBuilder;
        use crate::transfer::TransferKind;

        struct Discard;
        impl BuilderSink for Discard {
            fn enqueue(&self, _builder: MessageBuilder) {}
        }
        impl RetryTimer for Discard {
            fn schedule_after(&self, _delay: Duration, _task: Task) {}
        }

        let registry = TransferRegistry::new(
            RegistryConfig::default(),
            Arc::new(Discard),
            Arc::new(Discard),
            Arc::new(NullLogger),
        );
        let id = registry.register(TransferKind::Generic, vec![0u8; 10]).unwrap();
        let routes = Routes::new().route("/ack_chunk", ack_route(registry.clone()));

        routes
            .dispatch(&OscMessage::new("/ack_chunk").arg(id).arg(-1), from())
            .unwrap();
        assert!(registry.is_processing(id));
        routes
            .dispatch(&OscMessage::new("/ack_chunk").arg(id).arg(0), from())
            .unwrap();
        assert!(!registry.is_processing(id));
    }
}
