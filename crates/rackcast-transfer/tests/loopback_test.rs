/// Integration test: run a full bridge on loopback against a fake companion.
///
/// The companion decodes every `/chunked` message, acks it (unless told to
/// ignore a chunk) and reassembles payloads so they can be compared
/// byte-for-byte with what was registered.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rackcast_transfer::{
    decode_packet, Bridge, BridgeConfig, ChunkMessage, NullLogger, IdleMeter, OscMessage,
    OutcomeStatus, Routes, Transfer, TransferKind, ACK_CHUNK_ADDRESS, ANNOUNCE_ADDRESS, CHUNKED_ADDRESS,
    REGISTER_ADDRESS,
};

const WAIT: Duration = Duration::from_secs(10);

type Received = HashMap<i32, BTreeMap<u32, Bytes>>;

struct Companion {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    bridge_tx: crossbeam_channel::Sender<SocketAddr>,
    handle: JoinHandle<Received>,
}

impl Companion {
    /// Listen on loopback. Chunks numbered `ignore` are received but never acked.
    fn spawn(ignore: Option<u32>) -> (Self, UdpSocket) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let addr = socket.local_addr().unwrap();
        let control = socket.try_clone().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let (bridge_tx, bridge_rx) = crossbeam_channel::bounded::<SocketAddr>(1);

        let s = stop.clone();
        let handle = thread::spawn(move || {
            // acks go to the bridge's listener, not to the datagram source
            let Ok(ack_to) = bridge_rx.recv() else {
                return Received::new();
            };
            let mut received = Received::new();
            let mut buf = vec![0u8; 65_536];
            while !s.load(Ordering::Relaxed) {
                let (n, _) = match socket.recv_from(&mut buf) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let packet = decode_packet(&buf[..n]).expect("bridge sent undecodable datagram");
                for msg in packet.into_messages() {
                    if msg.address != CHUNKED_ADDRESS {
                        continue;
                    }
                    let chunk = ChunkMessage::parse(&msg).unwrap();
                    let header = chunk.header;
                    received
                        .entry(header.transfer_id)
                        .or_default()
                        .insert(header.chunk_num, chunk.data);
                    if ignore == Some(header.chunk_num) {
                        continue;
                    }
                    let ack = OscMessage::new(ACK_CHUNK_ADDRESS)
                        .arg(header.transfer_id)
                        .arg(header.chunk_num as i32);
                    socket.send_to(&ack.encode().unwrap(), ack_to).unwrap();
                }
            }
            received
        });

        (
            Self {
                addr,
                stop,
                bridge_tx,
                handle,
            },
            control,
        )
    }

    fn connect(&self, bridge: &Bridge) {
        self.bridge_tx.send(bridge.local_addr()).unwrap();
    }

    fn finish(self) -> Received {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().unwrap()
    }
}

fn config(companion: SocketAddr) -> BridgeConfig {
    BridgeConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        rx_port: 0,
        tx_port: companion.port(),
        broadcast_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        retry_interval: Duration::from_millis(50),
        ..BridgeConfig::default()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn start_bridge(config: BridgeConfig) -> Bridge {
    Bridge::start_with(config, Routes::new(), Arc::new(NullLogger), Arc::new(IdleMeter)).unwrap()
}

#[test]
fn loopback_transfer_reassembles() {
    let (companion, _control) = Companion::spawn(None);
    let bridge = start_bridge(config(companion.addr));
    companion.connect(&bridge);

    let outcomes = bridge.subscribe_outcomes();
    let payload = pattern(100_000);
    let id = bridge
        .register_transfer(TransferKind::Generic, payload.clone())
        .unwrap();
    assert!(bridge.is_processing(id));

    let outcome = outcomes.recv_timeout(WAIT).unwrap();
    assert_eq!(outcome.id, id);
    assert!(matches!(outcome.status, OutcomeStatus::Succeeded { .. }));
    assert!(!bridge.is_processing(id));

    let received = companion.finish();
    let chunks = &received[&id];
    assert_eq!(chunks.len(), outcome.num_chunks);
    let reassembled: Vec<u8> = chunks.values().flat_map(|b| b.iter().copied()).collect();
    assert_eq!(reassembled, payload);

    bridge.shutdown();
}

#[test]
fn loopback_image_transfer() {
    let (companion, _control) = Companion::spawn(None);
    let bridge = start_bridge(config(companion.addr));
    companion.connect(&bridge);

    let outcomes = bridge.subscribe_outcomes();
    let (width, height) = (64, 48);
    let rgba: Vec<u8> = (0..width * height)
        .flat_map(|i| [(i % width) as u8 * 4, (i / width) as u8 * 5, 0x80, 0xff])
        .collect();
    let payload = rackcast_transfer::Payload::image(width, height, rgba.clone()).unwrap();
    let id = bridge.send_payload(payload).unwrap();

    let outcome = outcomes.recv_timeout(WAIT).unwrap();
    assert!(matches!(outcome.status, OutcomeStatus::Succeeded { .. }));

    let received = companion.finish();
    let reassembled: Vec<u8> = received[&id].values().flat_map(|b| b.iter().copied()).collect();
    assert_eq!(reassembled.len(), outcome.size);
    assert!(reassembled.len() < rgba.len());
    let (header, pixels) = qoi::decode_to_vec(&reassembled).unwrap();
    assert_eq!((header.width, header.height), (width as u32, height as u32));
    assert_eq!(pixels, rgba);
    bridge.shutdown();
}

#[test]
fn loopback_unacked_chunk_fails() {
    let (companion, _control) = Companion::spawn(Some(0));
    let mut cfg = config(companion.addr);
    cfg.max_sends = 3;
    cfg.retry_interval = Duration::from_millis(20);
    let bridge = start_bridge(cfg);
    companion.connect(&bridge);

    let outcomes = bridge.subscribe_outcomes();
    let id = bridge
        .register_transfer(TransferKind::Generic, pattern(10_000))
        .unwrap();

    let outcome = outcomes.recv_timeout(WAIT).unwrap();
    assert_eq!(outcome.id, id);
    assert_eq!(outcome.status, OutcomeStatus::Failed { chunk_num: 0 });
    assert!(!bridge.is_processing(id));

    companion.finish();
    bridge.shutdown();
}

#[test]
fn in_flight_transfer_is_kept_unless_forced() {
    // never acks chunk 0, so the first transfer stays in flight
    let (companion, _control) = Companion::spawn(Some(0));
    let bridge = start_bridge(config(companion.addr));
    companion.connect(&bridge);

    let id = bridge.allocate_id();
    let first = Transfer::new(id, TransferKind::Generic, pattern(5000));
    assert_eq!(bridge.add_transfer(first, false), Some(id));

    let second = Transfer::new(id, TransferKind::Generic, pattern(10));
    assert_eq!(bridge.add_transfer(second, false), None);

    let outcomes = bridge.subscribe_outcomes();
    let forced = Transfer::new(id, TransferKind::Generic, pattern(10));
    assert_eq!(bridge.add_transfer(forced, true), Some(id));
    assert_eq!(outcomes.recv_timeout(WAIT).unwrap().status, OutcomeStatus::Superseded);

    companion.finish();
    bridge.shutdown();
}

#[test]
fn register_switches_to_direct() {
    let (companion, control) = Companion::spawn(None);
    let bridge = start_bridge(config(companion.addr));
    companion.connect(&bridge);
    assert!(!bridge.dispatcher().is_direct());

    let register = OscMessage::new(REGISTER_ADDRESS).encode().unwrap();
    control.send_to(&register, bridge.local_addr()).unwrap();

    let deadline = Instant::now() + WAIT;
    while !bridge.dispatcher().is_direct() {
        assert!(Instant::now() < deadline, "bridge never switched to direct");
        thread::sleep(Duration::from_millis(10));
    }
    assert!(bridge.liveness().is_tracking());
    assert_eq!(
        bridge.dispatcher().target().addr(),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), companion.addr.port())
    );

    companion.finish();
    bridge.shutdown();
}

/// Count `/announce` messages arriving on `socket` within `window`.
fn count_announces(socket: &UdpSocket, window: Duration) -> usize {
    let deadline = Instant::now() + window;
    let mut buf = vec![0u8; 65_536];
    let mut count = 0;
    while Instant::now() < deadline {
        let Ok((n, _)) = socket.recv_from(&mut buf) else {
            continue;
        };
        let Ok(packet) = decode_packet(&buf[..n]) else {
            continue;
        };
        count += packet
            .into_messages()
            .iter()
            .filter(|msg| msg.address == ANNOUNCE_ADDRESS)
            .count();
    }
    count
}

#[test]
fn dropping_bridge_stops_announcing() {
    let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
    listener.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
    let mut cfg = config(listener.local_addr().unwrap());
    cfg.heartbeat_interval = Duration::from_millis(20);

    let bridge = start_bridge(cfg);
    assert!(count_announces(&listener, Duration::from_millis(300)) > 0);

    drop(bridge);
    // anything already in flight lands within the first window
    count_announces(&listener, Duration::from_millis(100));
    assert_eq!(count_announces(&listener, Duration::from_millis(200)), 0);
}
