//! Hub Function
//!
//! The hub function is the inbound half of hub service: an acceptor socket
//! context through which other nodes attach, and a switch relaying PDUs
//! between them. A node publishes hub service by enabling this component;
//! the uplink to *another* hub (if any) stays the hub connector's job.
//!
//! Relay rules:
//! - A PDU whose destination VMAC names a connected peer is forwarded to
//!   that peer, stamped with the sender's VMAC when the sender omitted it.
//! - A PDU addressed to the broadcast VMAC is forwarded to every other
//!   connected peer and also surfaced locally.
//! - A PDU without a destination, or addressed to this node, is surfaced
//!   to the owner for control-message handling.
//! - A newly accepted peer claiming a VMAC that is already attached
//!   replaces the older connection; a peer claiming the local VMAC is the
//!   fatal duplicate-address case and is reported upward.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, warn};

use crate::bvlc;
use crate::error::{Result, ScError};
use crate::runloop::EventPump;
use crate::socket::{
    ContextConfig, CtxEvent, SocketCtx, SocketCtxRole, SocketEvent, SocketEventSink, SocketSlot,
    SocketTransportFactory,
};
use crate::util::{ScUuid, Vmac};
use crate::HUB_CONNECTIONS_MAX;

/// Hub function configuration.
#[derive(Clone)]
pub struct HubFunctionConfig {
    /// CA certificate chain used to verify attaching peers
    pub ca_cert_chain: Vec<u8>,
    /// Local certificate chain
    pub cert_chain: Vec<u8>,
    /// Private key for the local certificate
    pub key: Vec<u8>,
    /// Stable local device identity
    pub local_uuid: ScUuid,
    /// Local overlay address
    pub local_vmac: Vmac,
    /// Largest BVLC message accepted locally
    pub max_bvlc_len: u16,
    /// Largest NPDU accepted locally
    pub max_npdu_len: u16,
    /// Accept handshake timeout
    pub connect_timeout: Duration,
    /// Idle heartbeat interval
    pub heartbeat_timeout: Duration,
    /// Graceful disconnect timeout
    pub disconnect_timeout: Duration,
    /// Listener port
    pub port: u16,
    /// Listener interface name
    pub iface: Option<String>,
}

/// Events emitted to the hub function's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubFunctionEvent {
    /// The listener is up and peers may attach
    Started,
    /// Stop completed
    Stopped,
    /// A PDU addressed to this node (or broadcast) arrived from a peer
    Received {
        /// The message bytes
        pdu: Vec<u8>,
    },
    /// A peer asserted our VMAC; the owner should restart with a new one
    DuplicatedVmac,
}

/// Hub function lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubFunctionState {
    /// Not started
    Idle,
    /// Waiting for the listener to come up
    Starting,
    /// Accepting and switching
    Started,
    /// Waiting for the context teardown
    Stopping,
}

/// Owner callback receiving hub function events.
pub type HubFunctionEventFn = dyn Fn(HubFunctionEvent) + Send + Sync;

struct Core {
    ctx: Option<SocketCtx>,
    state: HubFunctionState,
    local_vmac: Vmac,
}

struct Shared {
    core: Mutex<Core>,
    pump: EventPump<HubFunctionEvent>,
    event_func: Box<HubFunctionEventFn>,
}

/// Handle to a running hub function. Cloning shares the same instance.
#[derive(Clone)]
pub struct HubFunction {
    shared: Arc<Shared>,
}

struct Sink {
    shared: Weak<Shared>,
}

impl SocketEventSink for Sink {
    fn socket_event(&self, slot: SocketSlot, event: SocketEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_socket_event(slot, event);
        }
    }

    fn ctx_event(&self, event: CtxEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_ctx_event(event);
        }
    }
}

impl HubFunction {
    /// Validate the configuration and bring the listener up. `Started` is
    /// emitted once the transport reports the listener ready.
    pub fn start(
        cfg: HubFunctionConfig,
        factory: &dyn SocketTransportFactory,
        event_func: Box<HubFunctionEventFn>,
    ) -> Result<HubFunction> {
        let ctx_cfg = ContextConfig {
            ca_cert_chain: cfg.ca_cert_chain.clone(),
            cert_chain: cfg.cert_chain.clone(),
            key: cfg.key.clone(),
            local_uuid: cfg.local_uuid,
            local_vmac: cfg.local_vmac,
            max_bvlc_len: cfg.max_bvlc_len,
            max_npdu_len: cfg.max_npdu_len,
            connect_timeout: cfg.connect_timeout,
            heartbeat_timeout: cfg.heartbeat_timeout,
            disconnect_timeout: cfg.disconnect_timeout,
            port: cfg.port,
            iface: cfg.iface.clone(),
        };
        ctx_cfg.validate(SocketCtxRole::Acceptor)?;

        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                ctx: None,
                state: HubFunctionState::Idle,
                local_vmac: cfg.local_vmac,
            }),
            pump: EventPump::new(),
            event_func,
        });
        let sink: Arc<dyn SocketEventSink> = Arc::new(Sink {
            shared: Arc::downgrade(&shared),
        });
        {
            let mut core = shared.core.lock().unwrap();
            core.ctx = Some(SocketCtx::init(
                &ctx_cfg,
                SocketCtxRole::Acceptor,
                HUB_CONNECTIONS_MAX,
                factory,
                sink,
            )?);
            core.state = HubFunctionState::Starting;
            debug!("hub function starting on port {}", cfg.port);
        }
        Ok(HubFunction { shared })
    }

    /// Request a stop. `Stopped` is emitted once the context is released.
    /// Emits nothing itself, so it is safe to call from inside any event
    /// callback.
    pub fn stop(&self) {
        let mut core = self.shared.core.lock().unwrap();
        if matches!(
            core.state,
            HubFunctionState::Starting | HubFunctionState::Started
        ) {
            core.state = HubFunctionState::Stopping;
            if let Some(ctx) = core.ctx.as_mut() {
                ctx.deinit();
            }
            debug!("hub function stopping");
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HubFunctionState {
        self.shared.core.lock().unwrap().state
    }

    /// True once the listener is up.
    pub fn started(&self) -> bool {
        self.state() == HubFunctionState::Started
    }

    /// True once the hub function returned to idle.
    pub fn stopped(&self) -> bool {
        self.state() == HubFunctionState::Idle
    }

    /// Number of currently attached peers.
    pub fn peer_count(&self) -> usize {
        let core = self.shared.core.lock().unwrap();
        core.ctx
            .as_ref()
            .map(|ctx| ctx.connected_slots().len())
            .unwrap_or(0)
    }
}

impl Shared {
    fn deliver(self: &Arc<Self>) {
        self.pump.deliver(&|event| (self.event_func)(event));
    }

    fn handle_socket_event(self: &Arc<Self>, slot: SocketSlot, event: SocketEvent) {
        {
            let mut core = self.shared_core_apply(slot, &event);
            match event {
                SocketEvent::Connected { peer_vmac, .. } => {
                    self.on_peer_connected(&mut core, slot, peer_vmac);
                }
                SocketEvent::Disconnected { error } => {
                    if error == Some(ScError::DuplicatedVmac) {
                        self.pump.push(HubFunctionEvent::DuplicatedVmac);
                    }
                }
                SocketEvent::Received { pdu } => {
                    self.on_received(&mut core, slot, pdu);
                }
            }
        }
        self.deliver();
    }

    /// Lock the core and fold the event into slot bookkeeping first.
    fn shared_core_apply(
        &self,
        slot: SocketSlot,
        event: &SocketEvent,
    ) -> std::sync::MutexGuard<'_, Core> {
        let mut core = self.core.lock().unwrap();
        if let Some(ctx) = core.ctx.as_mut() {
            ctx.handle_socket_event(slot, event);
        }
        core
    }

    fn on_peer_connected(&self, core: &mut Core, slot: SocketSlot, peer_vmac: Option<Vmac>) {
        let Some(vmac) = peer_vmac else {
            return;
        };
        if vmac == core.local_vmac {
            warn!("peer {} attached claiming our own VMAC", vmac);
            self.pump.push(HubFunctionEvent::DuplicatedVmac);
            return;
        }
        // Newest connection wins a VMAC clash between peers.
        let stale = core.ctx.as_ref().and_then(|ctx| {
            ctx.connected_slots()
                .into_iter()
                .find(|&other| other != slot && ctx.peer_vmac(other) == Some(vmac))
        });
        if let Some(stale) = stale {
            debug!("peer {} reattached, dropping stale slot {}", vmac, stale);
            if let Some(ctx) = core.ctx.as_mut() {
                ctx.disconnect(stale);
            }
        }
    }

    fn on_received(&self, core: &mut Core, slot: SocketSlot, pdu: Vec<u8>) {
        let decoded = match bvlc::Decoded::decode(&pdu) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("hub function dropping undecodable PDU: {}", err);
                return;
            }
        };
        match decoded.dest {
            Some(dest) if dest.is_broadcast() => {
                self.relay(core, slot, &pdu, None);
                self.pump.push(HubFunctionEvent::Received { pdu });
            }
            Some(dest) if dest == core.local_vmac => {
                self.pump.push(HubFunctionEvent::Received { pdu });
            }
            Some(dest) => {
                let target = core
                    .ctx
                    .as_ref()
                    .and_then(|ctx| ctx.find_slot_by_vmac(&dest));
                match target {
                    Some(target) => self.relay(core, slot, &pdu, Some(target)),
                    None => debug!("hub function has no route to {}, PDU dropped", dest),
                }
            }
            None => {
                self.pump.push(HubFunctionEvent::Received { pdu });
            }
        }
    }

    /// Forward `pdu` to `target`, or to every connected peer except the
    /// source when `target` is `None`. Relay is best effort.
    fn relay(&self, core: &mut Core, source: SocketSlot, pdu: &[u8], target: Option<SocketSlot>) {
        let Some(ctx) = core.ctx.as_mut() else {
            return;
        };
        let stamped = match ctx.peer_vmac(source) {
            Some(origin) => match bvlc::insert_origin(pdu, &origin) {
                Ok(stamped) => stamped,
                Err(err) => {
                    warn!("hub function cannot stamp originator: {}", err);
                    return;
                }
            },
            None => pdu.to_vec(),
        };
        let targets = match target {
            Some(target) => vec![target],
            None => ctx
                .connected_slots()
                .into_iter()
                .filter(|&other| other != source)
                .collect(),
        };
        for target in targets {
            if let Err(err) = ctx.send(target, &stamped) {
                warn!("hub function relay to slot {} failed: {}", target, err);
            }
        }
    }

    fn handle_ctx_event(self: &Arc<Self>, event: CtxEvent) {
        {
            let mut core = self.core.lock().unwrap();
            match event {
                CtxEvent::Initialized => {
                    if core.state == HubFunctionState::Starting {
                        core.state = HubFunctionState::Started;
                        debug!("hub function started");
                        self.pump.push(HubFunctionEvent::Started);
                    }
                }
                CtxEvent::Deinitialized => {
                    let was_active = core.state != HubFunctionState::Idle;
                    core.state = HubFunctionState::Idle;
                    core.ctx = None;
                    if was_active {
                        debug!("hub function stopped");
                        self.pump.push(HubFunctionEvent::Stopped);
                    }
                }
            }
        }
        self.deliver();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, EventLog, ScriptedTransportFactory, TransportOp};

    const PEER_A: Vmac = Vmac([0x2A, 0, 0, 0, 0, 1]);
    const PEER_B: Vmac = Vmac([0x2B, 0, 0, 0, 0, 2]);
    const LOCAL: Vmac = Vmac([0x20, 0, 0, 0, 0, 9]);

    fn test_cfg() -> HubFunctionConfig {
        HubFunctionConfig {
            ca_cert_chain: vec![1],
            cert_chain: vec![2],
            key: vec![3],
            local_uuid: ScUuid([0x22; 16]),
            local_vmac: LOCAL,
            max_bvlc_len: 4096,
            max_npdu_len: 1440,
            connect_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(5),
            port: 4443,
            iface: None,
        }
    }

    fn started_hub(
        factory: &ScriptedTransportFactory,
    ) -> (HubFunction, Arc<EventLog<HubFunctionEvent>>) {
        crate::testing::init_test_logging();
        let log = Arc::new(EventLog::new());
        let log_in_cb = log.clone();
        let hub = HubFunction::start(
            test_cfg(),
            factory,
            Box::new(move |event| log_in_cb.push(event)),
        )
        .unwrap();
        log.wait_for(Duration::from_secs(2), |events| {
            events.contains(&HubFunctionEvent::Started)
        });
        (hub, log)
    }

    fn attach_peer(factory: &ScriptedTransportFactory, slot: SocketSlot, vmac: Vmac) {
        factory.transport(0).fire_socket(
            slot,
            SocketEvent::Connected {
                peer_vmac: Some(vmac),
                peer_uuid: None,
            },
        );
    }

    #[test]
    fn test_start_and_stop() {
        let factory = ScriptedTransportFactory::accepting();
        let (hub, log) = started_hub(&factory);
        assert!(hub.started());
        hub.stop();
        log.wait_for(Duration::from_secs(2), |events| {
            events.contains(&HubFunctionEvent::Stopped)
        });
        assert!(hub.stopped());
    }

    #[test]
    fn test_relays_to_destination_with_origin_stamp() {
        let factory = ScriptedTransportFactory::accepting();
        let (hub, _log) = started_hub(&factory);
        attach_peer(&factory, 0, PEER_A);
        attach_peer(&factory, 1, PEER_B);
        assert!(wait_until(Duration::from_secs(1), || hub.peer_count() == 2));

        // A PDU from peer A addressed to peer B, origin omitted.
        let pdu = bvlc::encode_encapsulated_npdu(7, None, Some(&PEER_B), &[0xAB]).unwrap();
        factory
            .transport(0)
            .fire_socket(0, SocketEvent::Received { pdu });

        assert!(wait_until(Duration::from_secs(1), || {
            !factory.transport(0).sent_pdus(1).is_empty()
        }));
        let relayed = factory.transport(0).sent_pdus(1).remove(0);
        let decoded = bvlc::Decoded::decode(&relayed).unwrap();
        assert_eq!(decoded.origin, Some(PEER_A));
        assert_eq!(decoded.dest, Some(PEER_B));
        hub.stop();
    }

    #[test]
    fn test_broadcast_relays_and_surfaces() {
        let factory = ScriptedTransportFactory::accepting();
        let (hub, log) = started_hub(&factory);
        attach_peer(&factory, 0, PEER_A);
        attach_peer(&factory, 1, PEER_B);
        assert!(wait_until(Duration::from_secs(1), || hub.peer_count() == 2));

        let pdu =
            bvlc::encode_encapsulated_npdu(8, Some(&PEER_A), Some(&Vmac::BROADCAST), &[0xCD])
                .unwrap();
        factory
            .transport(0)
            .fire_socket(0, SocketEvent::Received { pdu: pdu.clone() });

        // Forwarded to B (not back to A) and surfaced locally.
        assert!(wait_until(Duration::from_secs(1), || {
            factory.transport(0).sent_pdus(1).len() == 1
        }));
        assert!(factory.transport(0).sent_pdus(0).is_empty());
        log.wait_for(Duration::from_secs(1), |events| {
            events
                .iter()
                .any(|event| matches!(event, HubFunctionEvent::Received { pdu: p } if *p == pdu))
        });
        hub.stop();
    }

    #[test]
    fn test_pdu_for_local_vmac_is_surfaced_not_relayed() {
        let factory = ScriptedTransportFactory::accepting();
        let (hub, log) = started_hub(&factory);
        attach_peer(&factory, 0, PEER_A);
        attach_peer(&factory, 1, PEER_B);

        let pdu = bvlc::encode_encapsulated_npdu(9, Some(&PEER_A), Some(&LOCAL), &[1]).unwrap();
        factory
            .transport(0)
            .fire_socket(0, SocketEvent::Received { pdu: pdu.clone() });
        log.wait_for(Duration::from_secs(1), |events| {
            events
                .iter()
                .any(|event| matches!(event, HubFunctionEvent::Received { pdu: p } if *p == pdu))
        });
        assert!(factory.transport(0).sent_pdus(1).is_empty());
        hub.stop();
    }

    #[test]
    fn test_reattaching_vmac_drops_stale_slot() {
        let factory = ScriptedTransportFactory::accepting();
        let (hub, _log) = started_hub(&factory);
        attach_peer(&factory, 0, PEER_A);
        assert!(wait_until(Duration::from_secs(1), || hub.peer_count() == 1));
        attach_peer(&factory, 1, PEER_A);

        assert!(wait_until(Duration::from_secs(1), || {
            factory
                .transport(0)
                .ops()
                .iter()
                .any(|op| matches!(op, TransportOp::Disconnect { slot: 0 }))
        }));
        hub.stop();
    }

    #[test]
    fn test_peer_claiming_local_vmac_reports_duplicate() {
        let factory = ScriptedTransportFactory::accepting();
        let (hub, log) = started_hub(&factory);
        attach_peer(&factory, 0, LOCAL);
        log.wait_for(Duration::from_secs(1), |events| {
            events.contains(&HubFunctionEvent::DuplicatedVmac)
        });
        hub.stop();
    }
}
