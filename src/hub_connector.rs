//! Hub Connector
//!
//! The hub connector keeps a node attached to the secure-connect overlay
//! through one of two configured hub URLs. It owns an initiator socket
//! context with exactly two slots, one per hub role:
//!
//! - On start it dials the primary hub.
//! - If the primary connect fails it dials the failover hub.
//! - If both fail it waits `reconnect_timeout` and starts over with the
//!   primary.
//! - If an established connection drops it reports the disconnect and
//!   immediately re-dials the primary.
//! - A duplicate-VMAC rejection from either hub is fatal: the error is
//!   latched and the connector stops itself; recovery (a restart with a
//!   fresh VMAC) is the owner's decision.
//!
//! `stop` is asynchronous: it requests context teardown and returns; the
//! `Stopped` event arrives once the transport confirms deinitialization,
//! carrying the latched error when the connector died on a fatal one.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{Result, ScError};
use crate::runloop::{EventPump, Runloop, RunloopId};
use crate::socket::{
    ContextConfig, CtxEvent, SocketCtx, SocketCtxRole, SocketEvent, SocketEventSink, SocketSlot,
    SocketTransportFactory,
};
use crate::util::{ScUuid, Vmac};
use crate::WSURL_MAX_LEN;

/// Socket slot dialing the primary hub.
const PRIMARY: SocketSlot = 0;
/// Socket slot dialing the failover hub.
const FAILOVER: SocketSlot = 1;

/// Hub connector configuration. See the module docs for the lifecycle the
/// timeouts control.
#[derive(Clone)]
pub struct HubConnectorConfig {
    /// CA certificate chain used to verify the hubs
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
    /// Connect handshake timeout
    pub connect_timeout: Duration,
    /// Idle heartbeat interval
    pub heartbeat_timeout: Duration,
    /// Graceful disconnect timeout
    pub disconnect_timeout: Duration,
    /// Primary hub URL (`wss://...`)
    pub primary_url: String,
    /// Failover hub URL (`wss://...`)
    pub failover_url: String,
    /// Delay before retrying the primary after both hubs failed
    pub reconnect_timeout: Duration,
}

/// Events emitted to the connector's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubConnectorEvent {
    /// Attached to the primary hub
    ConnectedPrimary,
    /// Attached to the failover hub
    ConnectedFailover,
    /// An established hub connection dropped. A duplicate-VMAC rejection
    /// arrives here with `Some(ScError::DuplicatedVmac)` before the
    /// connector stops itself.
    Disconnected {
        /// Failure cause, when the transport reported one
        error: Option<ScError>,
    },
    /// A BVLC-SC message arrived from the hub
    Received {
        /// The message bytes
        pdu: Vec<u8>,
    },
    /// Stop completed; the connector is idle again
    Stopped {
        /// The latched fatal error, when the connector died on one
        error: Option<ScError>,
    },
}

/// Connector lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubConnectorState {
    /// Not started
    Idle,
    /// Dialing the primary hub
    ConnectingPrimary,
    /// Dialing the failover hub
    ConnectingFailover,
    /// Attached to the primary hub
    ConnectedPrimary,
    /// Attached to the failover hub
    ConnectedFailover,
    /// Both hubs failed; reconnect timer armed
    WaitForReconnect,
    /// Stop requested; waiting for the transport to release the context
    WaitForCtxDeinit,
    /// Fatal error latched; stop in progress
    Error,
}

/// Synchronous connection status, as reported in advertisements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubConnectorStatus {
    /// No hub connection established
    NotConnected,
    /// Attached to the primary hub
    ConnectedPrimary,
    /// Attached to the failover hub
    ConnectedFailover,
}

/// Owner callback receiving connector events.
pub type HubConnectorEventFn = dyn Fn(HubConnectorEvent) + Send + Sync;

struct Core {
    ctx: Option<SocketCtx>,
    state: HubConnectorState,
    started: bool,
    error: Option<ScError>,
    reconnect_at: Option<Instant>,
    reconnect_timeout: Duration,
    primary_url: String,
    failover_url: String,
    runloop_id: Option<RunloopId>,
}

struct Shared {
    core: Mutex<Core>,
    pump: EventPump<HubConnectorEvent>,
    event_func: Box<HubConnectorEventFn>,
    runloop: Runloop,
}

/// Handle to a running hub connector. Cloning shares the same connector.
#[derive(Clone)]
pub struct HubConnector {
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

impl HubConnector {
    /// Validate the configuration, initialize the socket context and begin
    /// connecting to the primary hub. On success the connector is started;
    /// progress is reported through `event_func`.
    pub fn start(
        cfg: HubConnectorConfig,
        runloop: Runloop,
        factory: &dyn SocketTransportFactory,
        event_func: Box<HubConnectorEventFn>,
    ) -> Result<HubConnector> {
        if cfg.primary_url.is_empty()
            || cfg.failover_url.is_empty()
            || cfg.primary_url.len() > WSURL_MAX_LEN
            || cfg.failover_url.len() > WSURL_MAX_LEN
            || cfg.reconnect_timeout.is_zero()
        {
            return Err(ScError::BadParam);
        }
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
            port: 0,
            iface: None,
        };
        ctx_cfg.validate(SocketCtxRole::Initiator)?;

        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                ctx: None,
                state: HubConnectorState::Idle,
                started: false,
                error: None,
                reconnect_at: None,
                reconnect_timeout: cfg.reconnect_timeout,
                primary_url: cfg.primary_url,
                failover_url: cfg.failover_url,
                runloop_id: None,
            }),
            pump: EventPump::new(),
            event_func,
            runloop: runloop.clone(),
        });

        let sink: Arc<dyn SocketEventSink> = Arc::new(Sink {
            shared: Arc::downgrade(&shared),
        });

        {
            let mut core = shared.core.lock().unwrap();
            core.ctx = Some(SocketCtx::init(
                &ctx_cfg,
                SocketCtxRole::Initiator,
                2,
                factory,
                sink,
            )?);

            // Tick callback; unregisters itself once the connector is gone.
            let weak = Arc::downgrade(&shared);
            let id_cell: Arc<Mutex<Option<RunloopId>>> = Arc::new(Mutex::new(None));
            let id_cell_in_cb = id_cell.clone();
            let runloop_in_cb = runloop.clone();
            let id = runloop.register(move || match weak.upgrade() {
                Some(shared) => shared.tick(),
                None => {
                    if let Some(id) = *id_cell_in_cb.lock().unwrap() {
                        runloop_in_cb.unregister(id);
                    }
                }
            });
            *id_cell.lock().unwrap() = Some(id);
            core.runloop_id = Some(id);

            core.state = HubConnectorState::ConnectingPrimary;
            let url = core.primary_url.clone();
            let connect_result = match core.ctx.as_mut() {
                Some(ctx) => ctx.connect(PRIMARY, &url),
                None => Err(ScError::InvalidOperation),
            };
            if let Err(err) = connect_result {
                debug!("hub connector start failed connecting to primary: {}", err);
                core.state = HubConnectorState::Idle;
                runloop.unregister(id);
                core.runloop_id = None;
                if let Some(ctx) = core.ctx.as_mut() {
                    ctx.deinit();
                }
                return Err(err);
            }
            core.started = true;
            debug!("hub connector started, dialing {}", core.primary_url);
        }
        Ok(HubConnector { shared })
    }

    /// Send a PDU to the currently connected hub. Valid only while
    /// attached to the primary or failover hub; otherwise the PDU is
    /// dropped and `InvalidOperation` returned.
    pub fn send(&self, pdu: &[u8]) -> Result<()> {
        let mut core = self.shared.core.lock().unwrap();
        if !core.started {
            return Err(ScError::InvalidOperation);
        }
        let slot = match core.state {
            HubConnectorState::ConnectedPrimary => PRIMARY,
            HubConnectorState::ConnectedFailover => FAILOVER,
            _ => {
                debug!("hub connector send dropped, state {:?}", core.state);
                return Err(ScError::InvalidOperation);
            }
        };
        core.ctx.as_mut().ok_or(ScError::InvalidOperation)?.send(slot, pdu)
    }

    /// Request a stop. Returns immediately; `Stopped` is emitted once the
    /// transport confirms the context teardown. Emits nothing itself, so
    /// it is safe to call from inside any event callback, including the
    /// owner's own.
    pub fn stop(&self) {
        let mut core = self.shared.core.lock().unwrap();
        self.shared.stop_locked(&mut core);
    }

    /// Current synchronous connection status.
    pub fn status(&self) -> HubConnectorStatus {
        match self.shared.core.lock().unwrap().state {
            HubConnectorState::ConnectedPrimary => HubConnectorStatus::ConnectedPrimary,
            HubConnectorState::ConnectedFailover => HubConnectorStatus::ConnectedFailover,
            _ => HubConnectorStatus::NotConnected,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HubConnectorState {
        self.shared.core.lock().unwrap().state
    }

    /// True from a successful `start` until the stop completes.
    pub fn started(&self) -> bool {
        self.shared.core.lock().unwrap().started
    }

    /// True once the connector returned to idle.
    pub fn stopped(&self) -> bool {
        !self.started()
    }
}

impl Shared {
    fn deliver(self: &Arc<Self>) {
        self.pump.deliver(&|event| (self.event_func)(event));
    }

    fn handle_socket_event(self: &Arc<Self>, slot: SocketSlot, event: SocketEvent) {
        {
            let mut core = self.core.lock().unwrap();
            if let Some(ctx) = core.ctx.as_mut() {
                ctx.handle_socket_event(slot, &event);
            }
            self.on_socket_event(&mut core, slot, event);
        }
        self.deliver();
    }

    fn on_socket_event(&self, core: &mut Core, slot: SocketSlot, event: SocketEvent) {
        match event {
            SocketEvent::Connected { .. } => match (core.state, slot) {
                (HubConnectorState::ConnectingPrimary, PRIMARY) => {
                    core.state = HubConnectorState::ConnectedPrimary;
                    debug!("hub connector attached to primary");
                    self.pump.push(HubConnectorEvent::ConnectedPrimary);
                }
                (HubConnectorState::ConnectingFailover, FAILOVER) => {
                    core.state = HubConnectorState::ConnectedFailover;
                    debug!("hub connector attached to failover");
                    self.pump.push(HubConnectorEvent::ConnectedFailover);
                }
                _ => {}
            },
            SocketEvent::Disconnected { error } => {
                if error == Some(ScError::DuplicatedVmac) {
                    warn!("hub connector rejected: duplicated VMAC");
                    core.state = HubConnectorState::Error;
                    core.error = Some(ScError::DuplicatedVmac);
                    self.pump.push(HubConnectorEvent::Disconnected {
                        error: Some(ScError::DuplicatedVmac),
                    });
                    self.stop_locked(core);
                    return;
                }
                match core.state {
                    HubConnectorState::ConnectingPrimary => {
                        self.connect_or_stop(core, FAILOVER);
                    }
                    HubConnectorState::ConnectingFailover => {
                        debug!(
                            "hub connector waiting {:?} before retrying the primary",
                            core.reconnect_timeout
                        );
                        core.state = HubConnectorState::WaitForReconnect;
                        core.reconnect_at = Some(Instant::now() + core.reconnect_timeout);
                    }
                    HubConnectorState::ConnectedPrimary
                    | HubConnectorState::ConnectedFailover => {
                        self.pump.push(HubConnectorEvent::Disconnected { error });
                        self.connect_or_stop(core, PRIMARY);
                    }
                    _ => {}
                }
            }
            SocketEvent::Received { pdu } => {
                self.pump.push(HubConnectorEvent::Received { pdu });
            }
        }
    }

    fn connect_or_stop(&self, core: &mut Core, slot: SocketSlot) {
        core.state = if slot == PRIMARY {
            HubConnectorState::ConnectingPrimary
        } else {
            HubConnectorState::ConnectingFailover
        };
        let url = if slot == PRIMARY {
            core.primary_url.clone()
        } else {
            core.failover_url.clone()
        };
        let result = match core.ctx.as_mut() {
            Some(ctx) => ctx.connect(slot, &url),
            None => Err(ScError::InvalidOperation),
        };
        if let Err(err) = result {
            warn!("hub connector fatal error dialing {}: {}", url, err);
            core.state = HubConnectorState::Error;
            core.error = Some(err);
            self.stop_locked(core);
        }
    }

    fn stop_locked(&self, core: &mut Core) {
        if core.started && core.state != HubConnectorState::WaitForCtxDeinit {
            core.state = HubConnectorState::WaitForCtxDeinit;
            if let Some(id) = core.runloop_id.take() {
                self.runloop.unregister(id);
            }
            if let Some(ctx) = core.ctx.as_mut() {
                ctx.deinit();
            }
            debug!("hub connector stopping");
        }
    }

    fn handle_ctx_event(self: &Arc<Self>, event: CtxEvent) {
        if event != CtxEvent::Deinitialized {
            return;
        }
        {
            let mut core = self.core.lock().unwrap();
            let was_started = core.started;
            core.started = false;
            core.state = HubConnectorState::Idle;
            core.ctx = None;
            let error = core.error.take();
            if was_started {
                debug!("hub connector stopped ({:?})", error);
                self.pump.push(HubConnectorEvent::Stopped { error });
            }
        }
        self.deliver();
    }

    fn tick(self: &Arc<Self>) {
        {
            let mut core = self.core.lock().unwrap();
            if core.state == HubConnectorState::WaitForReconnect {
                let expired = core
                    .reconnect_at
                    .is_some_and(|deadline| Instant::now() >= deadline);
                if expired {
                    core.reconnect_at = None;
                    self.connect_or_stop(&mut core, PRIMARY);
                }
            }
        }
        self.deliver();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, EventLog, ScriptedTransportFactory};
    use proptest::prelude::*;

    fn test_cfg(primary: &str, failover: &str, reconnect: Duration) -> HubConnectorConfig {
        HubConnectorConfig {
            ca_cert_chain: vec![1],
            cert_chain: vec![2],
            key: vec![3],
            local_uuid: ScUuid([0x11; 16]),
            local_vmac: Vmac([0x20, 1, 2, 3, 4, 5]),
            max_bvlc_len: 4096,
            max_npdu_len: 1440,
            connect_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(5),
            primary_url: primary.into(),
            failover_url: failover.into(),
            reconnect_timeout: reconnect,
        }
    }

    fn start_connector(
        factory: &ScriptedTransportFactory,
        runloop: &Runloop,
        cfg: HubConnectorConfig,
    ) -> (HubConnector, Arc<EventLog<HubConnectorEvent>>) {
        crate::testing::init_test_logging();
        let log = Arc::new(EventLog::new());
        let log_in_cb = log.clone();
        let connector = HubConnector::start(
            cfg,
            runloop.clone(),
            factory,
            Box::new(move |event| log_in_cb.push(event)),
        )
        .unwrap();
        (connector, log)
    }

    #[test]
    fn test_rejects_bad_params() {
        let factory = ScriptedTransportFactory::accepting();
        let runloop = Runloop::start(Duration::from_secs(3600));
        let cfg = test_cfg("", "wss://f:9999", Duration::from_secs(5));
        let result = HubConnector::start(
            cfg,
            runloop.clone(),
            &factory,
            Box::new(|_| {}),
        );
        assert!(matches!(result, Err(ScError::BadParam)));

        let mut cfg = test_cfg("wss://p:9999", "wss://f:9999", Duration::ZERO);
        cfg.reconnect_timeout = Duration::ZERO;
        let result = HubConnector::start(cfg, runloop.clone(), &factory, Box::new(|_| {}));
        assert!(matches!(result, Err(ScError::BadParam)));
        runloop.stop();
    }

    #[test]
    fn test_connect_send_stop() {
        let factory = ScriptedTransportFactory::accepting();
        let runloop = Runloop::start(Duration::from_millis(10));
        let cfg = test_cfg("wss://p:9999", "wss://f:9999", Duration::from_secs(5));
        let (connector, log) = start_connector(&factory, &runloop, cfg);

        log.wait_for(Duration::from_secs(2), |events| {
            events.contains(&HubConnectorEvent::ConnectedPrimary)
        });
        assert_eq!(connector.status(), HubConnectorStatus::ConnectedPrimary);

        connector.send(&[0x01, 0x00, 0x00, 0x2A]).unwrap();
        let transport = factory.transport(0);
        assert!(wait_until(Duration::from_secs(1), || {
            transport.sent_pdus(PRIMARY).len() == 1
        }));

        connector.stop();
        log.wait_for(Duration::from_secs(2), |events| {
            events
                .iter()
                .any(|event| matches!(event, HubConnectorEvent::Stopped { error: None }))
        });
        assert!(connector.stopped());
        assert_eq!(connector.state(), HubConnectorState::Idle);
        runloop.stop();
    }

    #[test]
    fn test_failover_when_primary_refuses() {
        let factory = ScriptedTransportFactory::accepting();
        factory.refuse_url("wss://p:9999");
        let runloop = Runloop::start(Duration::from_millis(10));
        let cfg = test_cfg("wss://p:9999", "wss://f:9999", Duration::from_secs(5));
        let (connector, log) = start_connector(&factory, &runloop, cfg);

        log.wait_for(Duration::from_secs(2), |events| {
            events.contains(&HubConnectorEvent::ConnectedFailover)
        });
        assert_eq!(connector.status(), HubConnectorStatus::ConnectedFailover);

        // The connect attempts went primary first, failover second.
        let transport = factory.transport(0);
        let urls = transport.connect_urls();
        assert_eq!(urls, vec!["wss://p:9999".to_string(), "wss://f:9999".to_string()]);
        connector.stop();
        runloop.stop();
    }

    #[test]
    fn test_reconnect_cycles_when_both_refuse() {
        let factory = ScriptedTransportFactory::accepting();
        factory.refuse_url("wss://p:9999");
        factory.refuse_url("wss://f:9999");
        let runloop = Runloop::start(Duration::from_millis(5));
        let cfg = test_cfg("wss://p:9999", "wss://f:9999", Duration::from_millis(60));
        let (connector, log) = start_connector(&factory, &runloop, cfg);

        // At least three full primary/failover cycles.
        let transport = factory.transport(0);
        assert!(wait_until(Duration::from_secs(5), || {
            transport
                .connect_urls()
                .iter()
                .filter(|url| url.as_str() == "wss://p:9999")
                .count()
                >= 3
        }));
        let urls = transport.connect_urls();
        // Strict alternation: p, f, p, f, ...
        for (i, url) in urls.iter().enumerate() {
            let expected = if i % 2 == 0 { "wss://p:9999" } else { "wss://f:9999" };
            assert_eq!(url, expected);
        }

        // Once the primary starts answering, the next cycle attaches.
        factory.accept_url("wss://p:9999");
        log.wait_for(Duration::from_secs(2), |events| {
            events.contains(&HubConnectorEvent::ConnectedPrimary)
        });
        connector.stop();
        runloop.stop();
    }

    #[test]
    fn test_fatal_connect_error_latches_and_stops() {
        let factory = ScriptedTransportFactory::accepting();
        let runloop = Runloop::start(Duration::from_millis(10));
        let cfg = test_cfg("wss://p:9999", "wss://f:9999", Duration::from_secs(5));
        let (connector, log) = start_connector(&factory, &runloop, cfg);

        log.wait_for(Duration::from_secs(2), |events| {
            events.contains(&HubConnectorEvent::ConnectedPrimary)
        });

        // The redial after this drop fails synchronously and fatally.
        factory.fail_connect_calls(true);
        factory.transport(0).fire_socket(
            PRIMARY,
            SocketEvent::Disconnected {
                error: Some(ScError::PeerDisconnected),
            },
        );

        log.wait_for(Duration::from_secs(2), |events| {
            events.iter().any(|event| {
                matches!(event, HubConnectorEvent::Stopped { error: Some(ScError::Transport(_)) })
            })
        });
        assert!(connector.stopped());
        runloop.stop();
    }

    #[test]
    fn test_reconnect_after_established_drop() {
        let factory = ScriptedTransportFactory::accepting();
        let runloop = Runloop::start(Duration::from_millis(10));
        let cfg = test_cfg("wss://p:9999", "wss://f:9999", Duration::from_secs(5));
        let (connector, log) = start_connector(&factory, &runloop, cfg);

        log.wait_for(Duration::from_secs(2), |events| {
            events.contains(&HubConnectorEvent::ConnectedPrimary)
        });

        // Drop the established connection.
        let transport = factory.transport(0);
        transport.fire_socket(
            PRIMARY,
            SocketEvent::Disconnected {
                error: Some(ScError::PeerDisconnected),
            },
        );

        log.wait_for(Duration::from_secs(2), |events| {
            let disconnected = events.iter().position(|event| {
                matches!(event, HubConnectorEvent::Disconnected { error: Some(ScError::PeerDisconnected) })
            });
            let reconnected = events
                .iter()
                .rposition(|event| *event == HubConnectorEvent::ConnectedPrimary);
            matches!((disconnected, reconnected), (Some(d), Some(r)) if d < r)
        });
        connector.stop();
        runloop.stop();
    }

    #[test]
    fn test_duplicated_vmac_is_fatal() {
        let factory = ScriptedTransportFactory::accepting();
        let runloop = Runloop::start(Duration::from_millis(10));
        let cfg = test_cfg("wss://p:9999", "wss://f:9999", Duration::from_secs(5));
        let (connector, log) = start_connector(&factory, &runloop, cfg);

        log.wait_for(Duration::from_secs(2), |events| {
            events.contains(&HubConnectorEvent::ConnectedPrimary)
        });
        let transport = factory.transport(0);
        transport.fire_socket(
            PRIMARY,
            SocketEvent::Disconnected {
                error: Some(ScError::DuplicatedVmac),
            },
        );

        log.wait_for(Duration::from_secs(2), |events| {
            events.iter().any(|event| {
                matches!(event, HubConnectorEvent::Stopped { error: Some(ScError::DuplicatedVmac) })
            })
        });
        let events = log.snapshot();
        let disconnected = events
            .iter()
            .position(|event| {
                matches!(event, HubConnectorEvent::Disconnected { error: Some(ScError::DuplicatedVmac) })
            })
            .expect("disconnect event present");
        let stopped = events
            .iter()
            .position(|event| matches!(event, HubConnectorEvent::Stopped { .. }))
            .expect("stopped event present");
        assert!(disconnected < stopped);
        assert!(connector.stopped());
        runloop.stop();
    }

    #[test]
    fn test_send_while_not_connected() {
        let factory = ScriptedTransportFactory::manual();
        let runloop = Runloop::start(Duration::from_secs(3600));
        let cfg = test_cfg("wss://p:9999", "wss://f:9999", Duration::from_secs(5));
        let (connector, _log) = start_connector(&factory, &runloop, cfg);
        // Still connecting: nothing has answered.
        assert_eq!(connector.send(&[1, 2, 3]), Err(ScError::InvalidOperation));
        runloop.stop();
    }

    /// Scripted socket events a reachability test can inject.
    #[derive(Debug, Clone)]
    enum Step {
        Connected(usize),
        DisconnectedClean(usize),
        DisconnectedError(usize),
        TimerExpired,
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0usize..2).prop_map(Step::Connected),
            (0usize..2).prop_map(Step::DisconnectedClean),
            (0usize..2).prop_map(Step::DisconnectedError),
            Just(Step::TimerExpired),
        ]
    }

    fn assert_state_slot_agreement(connector: &HubConnector) {
        let core = connector.shared.core.lock().unwrap();
        let Some(ctx) = core.ctx.as_ref() else {
            return;
        };
        assert!(ctx.non_idle_count() <= 1, "state {:?}", core.state);
        let expected_active = match core.state {
            HubConnectorState::ConnectingPrimary | HubConnectorState::ConnectedPrimary => {
                Some(PRIMARY)
            }
            HubConnectorState::ConnectingFailover | HubConnectorState::ConnectedFailover => {
                Some(FAILOVER)
            }
            _ => None,
        };
        match expected_active {
            Some(slot) => {
                assert_eq!(ctx.slot_state(1 - slot), crate::socket::SlotState::Idle);
                assert_ne!(ctx.slot_state(slot), crate::socket::SlotState::Idle);
            }
            None => {
                // Stop teardown may leave slots draining but never active.
                if core.state == HubConnectorState::Idle
                    || core.state == HubConnectorState::WaitForReconnect
                {
                    assert_eq!(ctx.non_idle_count(), 0);
                }
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// At most one of the two hub sockets is ever non-idle, and the
        /// active one always agrees with the state label.
        #[test]
        fn prop_at_most_one_active_socket(steps in prop::collection::vec(step_strategy(), 1..40)) {
            let factory = ScriptedTransportFactory::manual();
            let runloop = Runloop::start(Duration::from_secs(3600));
            let cfg = test_cfg("wss://p:9999", "wss://f:9999", Duration::from_millis(1));
            let (connector, _log) = start_connector(&factory, &runloop, cfg);
            let transport = factory.transport(0);

            for step in steps {
                // Only inject events a real transport could produce for
                // the slot's current lifecycle state.
                let plausible = {
                    let core = connector.shared.core.lock().unwrap();
                    match (&step, core.ctx.as_ref()) {
                        (_, None) => false,
                        (Step::Connected(slot), Some(ctx)) => {
                            ctx.slot_state(*slot) == crate::socket::SlotState::Connecting
                        }
                        (
                            Step::DisconnectedClean(slot) | Step::DisconnectedError(slot),
                            Some(ctx),
                        ) => ctx.slot_state(*slot) != crate::socket::SlotState::Idle,
                        (Step::TimerExpired, Some(_)) => true,
                    }
                };
                if !plausible {
                    continue;
                }
                match step {
                    Step::Connected(slot) => transport.fire_socket(
                        slot,
                        SocketEvent::Connected { peer_vmac: None, peer_uuid: None },
                    ),
                    Step::DisconnectedClean(slot) => transport
                        .fire_socket(slot, SocketEvent::Disconnected { error: None }),
                    Step::DisconnectedError(slot) => transport.fire_socket(
                        slot,
                        SocketEvent::Disconnected { error: Some(ScError::Timeout) },
                    ),
                    Step::TimerExpired => {
                        std::thread::sleep(Duration::from_millis(2));
                        connector.shared.tick();
                    }
                }
                assert_state_slot_agreement(&connector);
            }
            runloop.stop();
        }
    }
}
