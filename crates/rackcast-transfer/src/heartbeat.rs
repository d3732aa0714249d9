//! Companion liveness: periodic heartbeats and the broadcast/direct switch.
//!
//! While nobody is registered the bridge broadcasts `/announce` so companions
//! can find it. `/register` makes the sender the direct peer; from then on
//! each tick sends `/heartbeat` with host load, and a companion that stops
//! sending `/keepalive` is dropped after enough missed ticks.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::builder::{Content, Heartbeat, MessageBuilder};
use crate::dispatcher::Dispatcher;
use crate::scheduler::Scheduler;

/// Host load readings reported in direct heartbeats, in percent.
pub trait HostMeter: Send + Sync {
    fn readings(&self) -> (f32, f32);
}

/// Reports zero load.
pub struct IdleMeter;

impl HostMeter for IdleMeter {
    fn readings(&self) -> (f32, f32) {
        (0.0, 0.0)
    }
}

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub interval: Duration,
    pub max_missed: u32,
    /// Advertised in `/announce`.
    pub rx_port: u16,
    /// Where the registered companion listens.
    pub tx_port: u16,
}

#[derive(Default)]
struct PeerState {
    last_keepalive: Option<Instant>,
    missed: u32,
}

#[derive(Clone)]
pub struct Liveness {
    inner: Arc<LivenessInner>,
}

struct LivenessInner {
    config: LivenessConfig,
    dispatcher: Dispatcher,
    meter: Arc<dyn HostMeter>,
    peer: Mutex<PeerState>,
}

impl Liveness {
    pub fn new(config: LivenessConfig, dispatcher: Dispatcher, meter: Arc<dyn HostMeter>) -> Self {
        Self {
            inner: Arc::new(LivenessInner {
                config,
                dispatcher,
                meter,
                peer: Mutex::new(PeerState::default()),
            }),
        }
    }

    /// Tick every interval on `scheduler` until the scheduler stops or this
    /// monitor is dropped.
    pub fn start(&self, scheduler: &Scheduler) {
        schedule_tick(Arc::downgrade(&self.inner), scheduler.clone());
    }

    /// A companion at `from` registered: send direct to it from now on.
    pub fn register(&self, from: SocketAddr) {
        let peer = SocketAddr::new(from.ip(), self.inner.config.tx_port);
        {
            let mut state = self.inner.peer.lock();
            state.last_keepalive = Some(Instant::now());
            state.missed = 0;
        }
        info!(%peer, "companion registered");
        self.inner.dispatcher.set_direct(peer);
    }

    pub fn keepalive(&self) {
        let mut state = self.inner.peer.lock();
        if state.last_keepalive.is_some() {
            state.last_keepalive = Some(Instant::now());
            state.missed = 0;
        }
    }

    /// Whether a registered companion is being tracked.
    pub fn is_tracking(&self) -> bool {
        self.inner.peer.lock().last_keepalive.is_some()
    }

    pub fn missed(&self) -> u32 {
        self.inner.peer.lock().missed
    }

    /// Send one heartbeat and account for a missing keepalive.
    pub fn tick(&self) {
        self.inner.tick();
    }
}

impl LivenessInner {
    fn tick(&self) {
        let heartbeat = if self.dispatcher.is_direct() {
            let (average, max) = self.meter.readings();
            Heartbeat::Direct { average, max }
        } else {
            Heartbeat::Announce {
                rx_port: self.config.rx_port,
                interval_ms: self.config.interval.as_millis() as u32,
            }
        };
        self.dispatcher
            .enqueue(MessageBuilder::new(Content::Heartbeat(heartbeat)));

        {
            let mut state = self.peer.lock();
            let Some(last) = state.last_keepalive else {
                return;
            };
            if last.elapsed() <= self.config.interval {
                return;
            }
            state.missed += 1;
            if state.missed < self.config.max_missed {
                return;
            }
            *state = PeerState::default();
        }

        warn!(
            missed = self.config.max_missed,
            "companion stopped sending keepalives, back to broadcast"
        );
        self.dispatcher.set_broadcasting();
    }
}

fn schedule_tick(weak: Weak<LivenessInner>, scheduler: Scheduler) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let interval = inner.config.interval;
    drop(inner);

    let next = scheduler.clone();
    scheduler.schedule_after(interval, move || {
        if let Some(inner) = weak.upgrade() {
            inner.tick();
            drop(inner);
            schedule_tick(weak, next);
        }
    });
}
