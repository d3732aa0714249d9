//! The bridge: one context object owning every service.
//!
//! ```text
//!   producer --register_transfer--> Registry --builders--> Dispatcher --UDP--> companion
//!                                      ^                                           |
//!                                      +------ ack ------ Receiver <----- UDP -----+
//!   Scheduler: registry retry passes, liveness ticks
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Receiver as OutcomeReceiver;
use tracing::info;

use crate::builder::{MessageBuilder, ACK_CHUNK_ADDRESS};
use crate::config::BridgeConfig;
use crate::dispatcher::{create_send_socket, Dispatcher, Transmit};
use crate::error::BridgeError;
use crate::heartbeat::{HostMeter, IdleMeter, Liveness, LivenessConfig};
use crate::logging::{TracingLogger, TransferLogger};
use crate::payload::Payload;
use crate::receiver::{
    ack_route, bind_with_retries, Receiver, Routes, KEEPALIVE_ADDRESS, REGISTER_ADDRESS,
};
use crate::registry::{TransferOutcome, TransferRegistry};
use crate::scheduler::Scheduler;
use crate::transfer::{Transfer, TransferId, TransferKind, TransferState};

pub struct Bridge {
    config: BridgeConfig,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    registry: TransferRegistry,
    liveness: Liveness,
    receiver: Receiver,
    stopped: AtomicBool,
}

impl Bridge {
    /// Start with tracing logs and no host meter. `routes` are installed next
    /// to the bridge's own.
    pub fn start(config: BridgeConfig, routes: Routes) -> Result<Self, BridgeError> {
        Self::start_with(config, routes, Arc::new(TracingLogger), Arc::new(IdleMeter))
    }

    pub fn start_with(
        config: BridgeConfig,
        routes: Routes,
        logger: Arc<dyn TransferLogger>,
        meter: Arc<dyn HostMeter>,
    ) -> Result<Self, BridgeError> {
        let transport: Arc<dyn Transmit> = Arc::new(create_send_socket()?);
        Self::start_on(config, routes, transport, logger, meter)
    }

    /// Start with an explicit outbound transport.
    pub fn start_on(
        config: BridgeConfig,
        routes: Routes,
        transport: Arc<dyn Transmit>,
        logger: Arc<dyn TransferLogger>,
        meter: Arc<dyn HostMeter>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let rx_socket = bind_with_retries(
            SocketAddr::new(config.bind_addr, config.rx_port),
            config.max_bind_retries,
        )?;
        let rx_port = rx_socket.local_addr()?.port();

        let scheduler = Scheduler::start()?;
        let broadcast = SocketAddr::new(config.broadcast_addr, config.tx_port);
        let dispatcher = match Dispatcher::start(transport, broadcast, config.datagram_capacity) {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                scheduler.shutdown();
                return Err(e.into());
            }
        };

        let registry = TransferRegistry::new(
            config.registry_config(),
            Arc::new(dispatcher.clone()),
            Arc::new(scheduler.clone()),
            logger,
        );

        let liveness = Liveness::new(
            LivenessConfig {
                interval: config.heartbeat_interval,
                max_missed: config.max_missed_heartbeats,
                rx_port,
                tx_port: config.tx_port,
            },
            dispatcher.clone(),
            meter,
        );
        liveness.start(&scheduler);

        let mut table = core_routes(&registry, &liveness);
        table.merge(routes);
        let receiver = match Receiver::start(rx_socket, table) {
            Ok(receiver) => receiver,
            Err(e) => {
                scheduler.shutdown();
                dispatcher.shutdown();
                return Err(e);
            }
        };

        info!(rx_port, %broadcast, "bridge started");
        Ok(Self {
            config,
            scheduler,
            dispatcher,
            registry,
            liveness,
            receiver,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Address the receiver actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.receiver.local_addr()
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub fn register_transfer(&self, kind: TransferKind, payload: impl Into<Bytes>) -> Option<TransferId> {
        self.registry.register(kind, payload)
    }

    pub fn send_payload(&self, payload: Payload) -> Option<TransferId> {
        self.registry.register(payload.kind, payload.bytes)
    }

    /// Add a transfer under its own id. Unless `force`, an in-flight transfer
    /// with that id is left alone and `None` is returned.
    pub fn add_transfer(&self, transfer: Transfer, force: bool) -> Option<TransferId> {
        self.registry.add_unless_processing(transfer, force)
    }

    pub fn ack(&self, id: TransferId, chunk_num: u32) {
        self.registry.ack(id, chunk_num);
    }

    pub fn is_processing(&self, id: TransferId) -> bool {
        self.registry.is_processing(id)
    }

    pub fn transfer_state(&self, id: TransferId) -> Option<TransferState> {
        self.registry.state(id)
    }

    pub fn enqueue(&self, builder: MessageBuilder) {
        self.dispatcher.enqueue(builder);
    }

    pub fn subscribe_outcomes(&self) -> OutcomeReceiver<TransferOutcome> {
        self.registry.subscribe_outcomes()
    }

    pub fn allocate_id(&self) -> TransferId {
        self.registry.allocate_id()
    }

    /// Stop listening, stop retries and heartbeats, then stop sending.
    /// Also runs on drop; later calls do nothing.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.receiver.shutdown();
        self.scheduler.shutdown();
        self.dispatcher.shutdown();
        info!("bridge stopped");
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn core_routes(registry: &TransferRegistry, liveness: &Liveness) -> Routes {
    let on_register = liveness.clone();
    let on_keepalive = liveness.clone();
    Routes::new()
        .route(ACK_CHUNK_ADDRESS, ack_route(registry.clone()))
        .route(REGISTER_ADDRESS, move |_, from| {
            on_register.register(from);
            Ok(())
        })
        .route(KEEPALIVE_ADDRESS, move |_, _| {
            on_keepalive.keepalive();
            Ok(())
        })
}
