//! Outbound side: one worker thread draining a FIFO of message builders.
//!
//! ```text
//! enqueue() --> [queue] --> [worker] --bundle--> OscStream --send_to--> target
//!                           skip noops          (scratch)              broadcast | direct
//! ```
//!
//! Send errors are logged and the datagram is dropped; chunk traffic is
//! re-sent by the registry's retry pass.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::builder::MessageBuilder;
use crate::osc::{OscStream, EMPTY_BUNDLE_SIZE};
use crate::registry::BuilderSink;

/// Kernel send buffer for the outbound socket.
const UDP_SEND_BUFFER: usize = 1024 * 1024;

/// Anything datagrams can be sent through.
pub trait Transmit: Send + Sync + 'static {
    fn transmit(&self, datagram: &[u8], target: SocketAddr) -> io::Result<usize>;
}

impl Transmit for UdpSocket {
    fn transmit(&self, datagram: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.send_to(datagram, target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTarget {
    Broadcast(SocketAddr),
    Direct(SocketAddr),
}

impl SendTarget {
    pub fn addr(&self) -> SocketAddr {
        match self {
            Self::Broadcast(addr) | Self::Direct(addr) => *addr,
        }
    }
}

/// Worker counters.
#[derive(Default)]
pub struct DispatchStats {
    pub datagrams_sent: AtomicU64,
    pub send_errors: AtomicU64,
    /// Messages skipped because they could never fit a datagram.
    pub unsendable: AtomicU64,
    /// Builders dropped by their skip check.
    pub skipped: AtomicU64,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    queue: Sender<MessageBuilder>,
    running: AtomicBool,
    broadcast: SocketAddr,
    target: RwLock<SendTarget>,
    capacity: usize,
    stats: DispatchStats,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn the worker. Datagrams are at most `capacity` bytes and go to
    /// `broadcast` until a direct peer is set.
    pub fn start(
        transport: Arc<dyn Transmit>,
        broadcast: SocketAddr,
        capacity: usize,
    ) -> io::Result<Self> {
        let (tx, rx) = unbounded();
        let inner = Arc::new(DispatcherInner {
            queue: tx,
            running: AtomicBool::new(true),
            broadcast,
            target: RwLock::new(SendTarget::Broadcast(broadcast)),
            capacity,
            stats: DispatchStats::default(),
            worker: Mutex::new(None),
        });

        let worker_inner = inner.clone();
        let handle = thread::Builder::new()
            .name("rackcast-dispatch".into())
            .spawn(move || worker_inner.run(rx, transport))?;
        *inner.worker.lock() = Some(handle);

        info!(dest = %broadcast, capacity, "dispatcher started");
        Ok(Self { inner })
    }

    pub fn enqueue(&self, builder: MessageBuilder) {
        if !self.inner.running.load(Ordering::Acquire) {
            debug!(builder = builder.name(), "dispatcher stopped, dropping builder");
            return;
        }
        // Only fails if the worker is gone; the builder is dropped either way.
        let _ = self.inner.queue.send(builder);
    }

    pub fn target(&self) -> SendTarget {
        *self.inner.target.read()
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.target(), SendTarget::Direct(_))
    }

    pub fn set_direct(&self, peer: SocketAddr) {
        let previous = std::mem::replace(&mut *self.inner.target.write(), SendTarget::Direct(peer));
        if previous != SendTarget::Direct(peer) {
            info!(%peer, "sending direct");
        }
    }

    pub fn set_broadcasting(&self) {
        let broadcast = SendTarget::Broadcast(self.inner.broadcast);
        let previous = std::mem::replace(&mut *self.inner.target.write(), broadcast);
        if previous != broadcast {
            info!(dest = %self.inner.broadcast, "sending broadcast");
        }
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.inner.stats
    }

    /// Stop the worker after the builder it is on. Anything still queued is
    /// dropped unsent.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.queue.send(MessageBuilder::noop());
        if let Some(handle) = self.inner.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl BuilderSink for Dispatcher {
    fn enqueue(&self, builder: MessageBuilder) {
        Dispatcher::enqueue(self, builder);
    }
}

impl DispatcherInner {
    fn run(&self, rx: Receiver<MessageBuilder>, transport: Arc<dyn Transmit>) {
        let mut stream = OscStream::new(self.capacity);

        for builder in rx.iter() {
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            self.dispatch(builder, &mut stream, &*transport);
        }

        let dropped = rx.try_iter().count();
        debug!(dropped, "dispatcher stopped");
    }

    fn dispatch(&self, mut builder: MessageBuilder, stream: &mut OscStream, transport: &dyn Transmit) {
        if builder.is_noop() {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            builder.done();
            return;
        }

        let mut sent = 0usize;
        while builder.has_remaining_messages() {
            stream.clear();
            // Cannot fail: capacity is validated above the empty bundle size.
            let _ = stream.begin_bundle();
            builder.bundle(stream);
            let _ = stream.end_bundle();

            if stream.len() <= EMPTY_BUNDLE_SIZE {
                // the rest was unencodable, already logged by the builder
                if !builder.has_remaining_messages() {
                    break;
                }
                warn!(
                    builder = builder.name(),
                    path = builder.next_path().unwrap_or("?"),
                    capacity = self.capacity,
                    "message does not fit in a datagram, skipping it"
                );
                self.stats.unsendable.fetch_add(1, Ordering::Relaxed);
                builder.advance();
                continue;
            }

            let target = *self.target.read();
            match transport.transmit(stream.as_bytes(), target.addr()) {
                Ok(_) => {
                    sent += 1;
                    self.stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(builder = builder.name(), dest = %target.addr(), "send failed: {}", e);
                    self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if sent > 0 {
            builder.finish();
        }
        let delay = builder.post_send_delay();
        builder.done();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

/// Outbound UDP socket with broadcast enabled, bound to an ephemeral port.
pub fn create_send_socket() -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(false)?;
    socket.set_broadcast(true)?;
    socket.set_send_buffer_size(UDP_SEND_BUFFER)?;
    socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into())?;
    Ok(socket.into())
}
