//! Stand-in host: the update loop, its request routes and demo payload sources.
//!
//! Requests arrive on the listener thread and are queued as `HostAction`s;
//! the update loop runs them, so producers only ever execute on one thread.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, info, warn};

use rackcast_transfer::osc::FloatOrInt;
use rackcast_transfer::{
    Bridge, Content, HostMeter, MessageBuilder, OscMessage, OutcomeStatus, Payload, PayloadSource,
    Routes, Transfer, TransferId, TransferKind, TransferOutcome,
};

/// Update loop period.
const FRAME: Duration = Duration::from_millis(16);

/// Demo panel size at scale 1.
const PANEL_WIDTH: i32 = 128;
const PANEL_HEIGHT: i32 = 380;
/// Largest texture edge we render.
const MAX_EDGE: i32 = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum HostAction {
    PatchInfo,
    RenderPanel {
        plugin: String,
        module: String,
        size: FloatOrInt,
        requested_id: TransferId,
    },
    ModuleStructure {
        plugin: String,
        module: String,
    },
}

/// Request routes. Each one only parses and queues an action.
pub fn routes(actions: Sender<HostAction>) -> Routes {
    let (a, b, c) = (actions.clone(), actions.clone(), actions);
    Routes::new()
        .route("/get/patch_info", move |_, _| {
            let _ = a.send(HostAction::PatchInfo);
            Ok(())
        })
        .route("/get/texture/panel", move |args, _| {
            let plugin = args.string()?.to_owned();
            let module = args.string()?.to_owned();
            let size = args.float_or_int32()?;
            let requested_id = args.int32()?;
            let _ = b.send(HostAction::RenderPanel {
                plugin,
                module,
                size,
                requested_id,
            });
            Ok(())
        })
        .route("/get/module_structure", move |args, _| {
            let plugin = args.string()?.to_owned();
            let module = args.string()?.to_owned();
            let _ = c.send(HostAction::ModuleStructure { plugin, module });
            Ok(())
        })
}

/// Update-loop load, reported in direct heartbeats.
#[derive(Default)]
pub struct LoadMeter {
    average: AtomicU32,
    max: AtomicU32,
}

impl LoadMeter {
    /// Record one frame that was busy for `busy` out of `frame`.
    pub fn record(&self, busy: Duration, frame: Duration) {
        let percent = (busy.as_secs_f32() / frame.as_secs_f32() * 100.0).min(100.0);
        let average = f32::from_bits(self.average.load(Ordering::Relaxed));
        self.average
            .store((average * 0.9 + percent * 0.1).to_bits(), Ordering::Relaxed);
        if percent > f32::from_bits(self.max.load(Ordering::Relaxed)) {
            self.max.store(percent.to_bits(), Ordering::Relaxed);
        }
    }
}

impl HostMeter for LoadMeter {
    /// Max resets on every read.
    fn readings(&self) -> (f32, f32) {
        let average = f32::from_bits(self.average.load(Ordering::Relaxed));
        let max = f32::from_bits(self.max.swap(0f32.to_bits(), Ordering::Relaxed));
        (average, max)
    }
}

/// Gradient RGBA test pattern standing in for a rendered panel.
pub struct TestPattern {
    pub width: i32,
    pub height: i32,
    pub seed: u8,
}

impl TestPattern {
    /// Size from a scale factor or a pixel height, keeping the panel's aspect.
    pub fn sized(size: FloatOrInt, seed: u8) -> Option<Self> {
        let scale = match size {
            FloatOrInt::Float(scale) => scale,
            FloatOrInt::Int(height) => height as f32 / PANEL_HEIGHT as f32,
        };
        if !scale.is_finite() || scale <= 0.0 {
            return None;
        }
        let width = (PANEL_WIDTH as f32 * scale).round() as i32;
        let height = (PANEL_HEIGHT as f32 * scale).round() as i32;
        if width < 1 || height < 1 || width > MAX_EDGE || height > MAX_EDGE {
            return None;
        }
        Some(Self { width, height, seed })
    }
}

impl PayloadSource for TestPattern {
    fn produce(&self) -> Option<Payload> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut rgba = Vec::with_capacity(w * h * 4);
        for y in 0..h {
            for x in 0..w {
                rgba.push((x * 255 / w.max(1)) as u8);
                rgba.push((y * 255 / h.max(1)) as u8);
                rgba.push(self.seed);
                rgba.push(0xff);
            }
        }
        Payload::image(self.width, self.height, rgba).ok()
    }
}

#[derive(Debug, Serialize)]
struct ParamInfo {
    id: i32,
    name: String,
    min: f32,
    max: f32,
    default: f32,
}

#[derive(Debug, Serialize)]
struct ModuleStructure<'a> {
    plugin: &'a str,
    module: &'a str,
    params: Vec<ParamInfo>,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

/// Serialized structural snapshot of a (made up) module.
pub struct StructureSnapshot {
    pub plugin: String,
    pub module: String,
}

impl PayloadSource for StructureSnapshot {
    fn produce(&self) -> Option<Payload> {
        let params = (0..64)
            .map(|id| ParamInfo {
                id,
                name: format!("{} param {}", self.module, id),
                min: 0.0,
                max: 10.0,
                default: 5.0,
            })
            .collect();
        let structure = ModuleStructure {
            plugin: &self.plugin,
            module: &self.module,
            params,
            inputs: (1..=8).map(|n| format!("in {}", n)).collect(),
            outputs: (1..=8).map(|n| format!("out {}", n)).collect(),
        };
        match serde_json::to_vec(&structure) {
            Ok(json) => Some(Payload::generic(json)),
            Err(e) => {
                warn!("failed to serialize module structure: {}", e);
                None
            }
        }
    }
}

pub struct Host<'a> {
    bridge: &'a Bridge,
    meter: Arc<LoadMeter>,
    frames: u64,
}

impl<'a> Host<'a> {
    pub fn new(bridge: &'a Bridge, meter: Arc<LoadMeter>) -> Self {
        Self {
            bridge,
            meter,
            frames: 0,
        }
    }

    /// Run actions until `running` is cleared or every sender is gone.
    pub fn run(
        &mut self,
        actions: &Receiver<HostAction>,
        outcomes: &Receiver<TransferOutcome>,
        running: &AtomicBool,
    ) {
        info!("host update loop running");
        while running.load(Ordering::SeqCst) {
            let frame_start = Instant::now();
            match actions.recv_timeout(FRAME) {
                Ok(action) => self.handle(action),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            for outcome in outcomes.try_iter() {
                log_outcome(&outcome);
            }
            self.frames += 1;
            self.meter.record(frame_start.elapsed(), FRAME);
        }
        info!(frames = self.frames, "host update loop stopped");
    }

    pub fn handle(&mut self, action: HostAction) {
        match action {
            HostAction::PatchInfo => {
                let info = OscMessage::new("/set/patch_info")
                    .arg("rackcast demo patch")
                    .arg(self.frames as i64);
                self.bridge
                    .enqueue(MessageBuilder::new(Content::Messages(vec![info])));
            }
            HostAction::RenderPanel {
                plugin,
                module,
                size,
                requested_id,
            } => {
                let Some(source) = TestPattern::sized(size, requested_id as u8) else {
                    warn!(%plugin, %module, ?size, "unusable panel size requested");
                    return;
                };
                let Some(payload) = source.produce() else {
                    return;
                };
                let transfer = Transfer::new(requested_id, payload.kind, payload.bytes);
                // A live preview may ask again before the last one landed.
                if self.bridge.add_transfer(transfer, false).is_none() {
                    debug!(requested_id, "panel still in flight, request dropped");
                }
            }
            HostAction::ModuleStructure { plugin, module } => {
                let source = StructureSnapshot { plugin, module };
                if let Some(payload) = source.produce() {
                    self.send(payload.bytes, payload.kind);
                }
            }
        }
    }

    fn send(&self, bytes: Bytes, kind: TransferKind) {
        match self.bridge.register_transfer(kind, bytes) {
            Some(id) => debug!(transfer_id = id, "transfer queued"),
            None => warn!("payload was empty, nothing sent"),
        }
    }
}

fn log_outcome(outcome: &TransferOutcome) {
    match outcome.status {
        OutcomeStatus::Succeeded { elapsed } => info!(
            transfer_id = outcome.id,
            bytes = outcome.size,
            ms = elapsed.as_millis() as u64,
            "delivered"
        ),
        OutcomeStatus::Failed { chunk_num } => warn!(
            transfer_id = outcome.id,
            chunk_num,
            chunks = outcome.num_chunks,
            "delivery failed"
        ),
        OutcomeStatus::Superseded => debug!(transfer_id = outcome.id, "superseded"),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn from() -> SocketAddr {
        "127.0.0.1:7746".parse().unwrap()
    }

    #[test]
    fn panel_route_queues_action() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let routes = routes(tx);
        let msg = OscMessage::new("/get/texture/panel")
            .arg("Fundamental")
            .arg("VCO")
            .arg(200i32)
            .arg(9i32);
        routes.dispatch(&msg, from()).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            HostAction::RenderPanel {
                plugin: "Fundamental".into(),
                module: "VCO".into(),
                size: FloatOrInt::Int(200),
                requested_id: 9,
            }
        );
    }

    #[test]
    fn panel_route_rejects_missing_size() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let routes = routes(tx);
        let msg = OscMessage::new("/get/texture/panel").arg("Fundamental").arg("VCO").arg("big");
        assert!(routes.dispatch(&msg, from()).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_pattern_sizes() {
        let half = TestPattern::sized(FloatOrInt::Float(0.5), 0).unwrap();
        assert_eq!((half.width, half.height), (64, 190));
        let tall = TestPattern::sized(FloatOrInt::Int(760), 0).unwrap();
        assert_eq!((tall.width, tall.height), (256, 760));
        assert!(TestPattern::sized(FloatOrInt::Float(0.0), 0).is_none());
        assert!(TestPattern::sized(FloatOrInt::Float(100.0), 0).is_none());

        let payload = half.produce().unwrap();
        assert_eq!(payload.kind, TransferKind::Image { width: 64, height: 190 });
        assert_eq!(payload.len(), 64 * 190 * 4);
    }

    #[test]
    fn structure_snapshot_is_json() {
        let source = StructureSnapshot {
            plugin: "Fundamental".into(),
            module: "VCF".into(),
        };
        let payload = source.produce().unwrap();
        assert_eq!(payload.kind, TransferKind::Generic);
        let value: serde_json::Value = serde_json::from_slice(&payload.bytes).unwrap();
        assert_eq!(value["module"], "VCF");
        assert_eq!(value["params"].as_array().unwrap().len(), 64);
    }

    #[test]
    fn load_meter_tracks_max_and_resets() {
        let meter = LoadMeter::default();
        meter.record(Duration::from_millis(8), Duration::from_millis(16));
        meter.record(Duration::from_millis(1), Duration::from_millis(16));
        let (average, max) = meter.readings();
        assert!(average > 0.0 && average < 50.0);
        assert!((max - 50.0).abs() < 0.01);
        assert_eq!(meter.readings().1, 0.0);
    }
}
