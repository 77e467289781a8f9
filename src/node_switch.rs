//! Node Switch
//!
//! The node switch manages direct peer-to-peer connections: an initiator
//! context dialing remote nodes at the URLs learned through address
//! resolution, and an acceptor context through which remote nodes dial in.
//! PDUs for peers without an established direct connection fall back to
//! the hub path supplied by the owner.
//!
//! Connecting to a peer whose URLs are unknown parks the connection slot,
//! asks the owner to issue an address-resolution request, and waits up to
//! the configured resolution timeout for the answer to arrive via
//! [`NodeSwitch::process_address_resolution`].

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::bvlc;
use crate::error::{Result, ScError};
use crate::runloop::{EventPump, Runloop, RunloopId};
use crate::socket::{
    ContextConfig, CtxEvent, SocketCtx, SocketCtxRole, SocketEvent, SocketEventSink, SocketSlot,
    SocketTransportFactory,
};
use crate::util::{ScUuid, Vmac};
use crate::{DIRECT_CONNECTIONS_MAX, WSURL_MAX_LEN};

/// Node switch configuration.
#[derive(Clone)]
pub struct NodeSwitchConfig {
    /// CA certificate chain
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
    /// Listener port for incoming direct connections
    pub direct_port: u16,
    /// Listener interface name
    pub iface: Option<String>,
    /// How long a parked connect waits for an address resolution answer
    pub address_resolution_timeout: Duration,
}

/// Events emitted to the node switch's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSwitchEvent {
    /// Both contexts are up; direct connections may be made
    Started,
    /// Stop completed
    Stopped,
    /// A PDU arrived over a direct connection
    Received {
        /// The message bytes
        pdu: Vec<u8>,
    },
    /// A peer asserted our VMAC; the owner should restart with a new one
    DuplicatedVmac,
}

/// Node switch lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSwitchState {
    /// Not started
    Idle,
    /// Waiting for the listener to come up
    Starting,
    /// Operating
    Started,
    /// Waiting for both contexts to tear down
    Stopping,
}

/// Owner callback receiving node switch events.
pub type NodeSwitchEventFn = dyn Fn(NodeSwitchEvent) + Send + Sync;

/// Owner callback asked to issue an address-resolution request.
pub type ResolutionRequestFn = dyn Fn(Vmac) + Send + Sync;

/// Owner callback carrying a PDU over the hub path.
pub type HubSendFn = dyn Fn(&[u8]) -> Result<()> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq)]
enum DirectState {
    Idle,
    /// Parked until the owner delivers URLs for the destination
    AwaitingResolution { deadline: Instant },
    /// Dialing `urls[next]`; earlier entries already failed
    Connecting { urls: Vec<String>, next: usize },
    Connected,
}

struct DirectSlot {
    state: DirectState,
    dest: Option<Vmac>,
}

impl DirectSlot {
    fn clear(&mut self) {
        self.state = DirectState::Idle;
        self.dest = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CtxKind {
    Initiator,
    Acceptor,
}

struct Core {
    initiator: Option<SocketCtx>,
    acceptor: Option<SocketCtx>,
    direct: Vec<DirectSlot>,
    state: NodeSwitchState,
    local_vmac: Vmac,
    resolution_timeout: Duration,
    runloop_id: Option<RunloopId>,
}

struct Shared {
    core: Mutex<Core>,
    pump: EventPump<NodeSwitchEvent>,
    resolution_pump: EventPump<Vmac>,
    event_func: Box<NodeSwitchEventFn>,
    resolution_request: Box<ResolutionRequestFn>,
    hub_send: Box<HubSendFn>,
    runloop: Runloop,
}

/// Handle to a running node switch. Cloning shares the same instance.
#[derive(Clone)]
pub struct NodeSwitch {
    shared: Arc<Shared>,
}

struct Sink {
    shared: Weak<Shared>,
    kind: CtxKind,
}

impl SocketEventSink for Sink {
    fn socket_event(&self, slot: SocketSlot, event: SocketEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_socket_event(self.kind, slot, event);
        }
    }

    fn ctx_event(&self, event: CtxEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_ctx_event(self.kind, event);
        }
    }
}

impl NodeSwitch {
    /// Validate the configuration, bring up the dialer and listener
    /// contexts and register with the runloop. `Started` is emitted once
    /// the listener is up.
    pub fn start(
        cfg: NodeSwitchConfig,
        runloop: Runloop,
        factory: &dyn SocketTransportFactory,
        event_func: Box<NodeSwitchEventFn>,
        resolution_request: Box<ResolutionRequestFn>,
        hub_send: Box<HubSendFn>,
    ) -> Result<NodeSwitch> {
        if cfg.address_resolution_timeout.is_zero() {
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
            port: cfg.direct_port,
            iface: cfg.iface.clone(),
        };
        ctx_cfg.validate(SocketCtxRole::Acceptor)?;

        let mut direct = Vec::with_capacity(DIRECT_CONNECTIONS_MAX);
        direct.resize_with(DIRECT_CONNECTIONS_MAX, || DirectSlot {
            state: DirectState::Idle,
            dest: None,
        });
        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                initiator: None,
                acceptor: None,
                direct,
                state: NodeSwitchState::Idle,
                local_vmac: cfg.local_vmac,
                resolution_timeout: cfg.address_resolution_timeout,
                runloop_id: None,
            }),
            pump: EventPump::new(),
            resolution_pump: EventPump::new(),
            event_func,
            resolution_request,
            hub_send,
            runloop: runloop.clone(),
        });

        {
            let mut core = shared.core.lock().unwrap();
            let initiator_sink: Arc<dyn SocketEventSink> = Arc::new(Sink {
                shared: Arc::downgrade(&shared),
                kind: CtxKind::Initiator,
            });
            core.initiator = Some(SocketCtx::init(
                &ctx_cfg,
                SocketCtxRole::Initiator,
                DIRECT_CONNECTIONS_MAX,
                factory,
                initiator_sink,
            )?);
            let acceptor_sink: Arc<dyn SocketEventSink> = Arc::new(Sink {
                shared: Arc::downgrade(&shared),
                kind: CtxKind::Acceptor,
            });
            match SocketCtx::init(
                &ctx_cfg,
                SocketCtxRole::Acceptor,
                DIRECT_CONNECTIONS_MAX,
                factory,
                acceptor_sink,
            ) {
                Ok(ctx) => core.acceptor = Some(ctx),
                Err(err) => {
                    if let Some(ctx) = core.initiator.as_mut() {
                        ctx.deinit();
                    }
                    return Err(err);
                }
            }

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
            core.state = NodeSwitchState::Starting;
            debug!("node switch starting, listener port {}", cfg.direct_port);
        }
        Ok(NodeSwitch { shared })
    }

    /// Establish a direct connection to `dest`. With `urls` the dialing
    /// starts immediately; without, the connection is parked until an
    /// address resolution answer arrives (the owner is asked to request
    /// one).
    pub fn connect(&self, dest: Vmac, urls: &[String]) -> Result<()> {
        {
            let mut core = self.shared.core.lock().unwrap();
            if core.state != NodeSwitchState::Started {
                return Err(ScError::InvalidOperation);
            }
            if core.slot_for_dest(&dest).is_some() {
                // Already connected, dialing or parked.
                return Ok(());
            }
            let Some(slot) = core
                .direct
                .iter()
                .position(|entry| entry.state == DirectState::Idle)
            else {
                return Err(ScError::NoResources);
            };
            core.direct[slot].dest = Some(dest);
            let urls = filter_urls(urls);
            if urls.is_empty() {
                core.direct[slot].state = DirectState::AwaitingResolution {
                    deadline: Instant::now() + core.resolution_timeout,
                };
                self.shared.resolution_pump.push(dest);
                debug!("direct connect to {} parked awaiting resolution", dest);
            } else {
                core.direct[slot].state = DirectState::Connecting { urls, next: 0 };
                if !self.shared.dial_next(&mut core, slot) {
                    return Err(ScError::Transport("all candidate URLs failed".into()));
                }
            }
        }
        self.shared.deliver();
        Ok(())
    }

    /// Tear down the direct connection to `dest`, if any.
    pub fn disconnect(&self, dest: &Vmac) {
        let mut core = self.shared.core.lock().unwrap();
        if let Some(slot) = core.slot_for_dest(dest) {
            match core.direct[slot].state {
                DirectState::Connected | DirectState::Connecting { .. } => {
                    if let Some(ctx) = core.initiator.as_mut() {
                        ctx.disconnect(slot);
                    }
                }
                _ => core.direct[slot].clear(),
            }
        }
    }

    /// Consume a fresh URL set for `dest`: any parked connect starts
    /// dialing. Emits nothing itself, so the owner may call it with its
    /// own state locked.
    pub fn process_address_resolution(&self, dest: &Vmac, urls: &[String]) {
        let mut core = self.shared.core.lock().unwrap();
        if core.state != NodeSwitchState::Started {
            return;
        }
        let Some(slot) = core.slot_for_dest(dest) else {
            return;
        };
        if !matches!(core.direct[slot].state, DirectState::AwaitingResolution { .. }) {
            return;
        }
        let urls = filter_urls(urls);
        if urls.is_empty() {
            debug!("resolution for {} came back empty, releasing slot", dest);
            core.direct[slot].clear();
        } else {
            core.direct[slot].state = DirectState::Connecting { urls, next: 0 };
            self.shared.dial_next(&mut core, slot);
        }
    }

    /// Send a PDU: over the direct connection to its destination VMAC
    /// when one is established, otherwise over the hub path.
    pub fn send(&self, pdu: &[u8]) -> Result<()> {
        let direct_result = {
            let mut core = self.shared.core.lock().unwrap();
            if core.state != NodeSwitchState::Started {
                return Err(ScError::InvalidOperation);
            }
            let dest = bvlc::Decoded::decode(pdu).ok().and_then(|decoded| decoded.dest);
            match dest {
                Some(dest) => {
                    if let Some(slot) = core.connected_slot_for_dest(&dest) {
                        let result = core
                            .initiator
                            .as_mut()
                            .ok_or(ScError::InvalidOperation)
                            .and_then(|ctx| ctx.send(slot, pdu));
                        Some(result)
                    } else if let Some(slot) = core
                        .acceptor
                        .as_ref()
                        .and_then(|ctx| ctx.find_slot_by_vmac(&dest))
                    {
                        let result = core
                            .acceptor
                            .as_mut()
                            .ok_or(ScError::InvalidOperation)
                            .and_then(|ctx| ctx.send(slot, pdu));
                        Some(result)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        match direct_result {
            Some(result) => result,
            // Hub fallback outside the lock.
            None => (self.shared.hub_send)(pdu),
        }
    }

    /// Request a stop. `Stopped` is emitted once both contexts are down.
    /// Emits nothing itself, so it is safe to call from inside any event
    /// callback.
    pub fn stop(&self) {
        let mut core = self.shared.core.lock().unwrap();
        if matches!(
            core.state,
            NodeSwitchState::Starting | NodeSwitchState::Started
        ) {
            core.state = NodeSwitchState::Stopping;
            if let Some(id) = core.runloop_id.take() {
                self.shared.runloop.unregister(id);
            }
            if let Some(ctx) = core.initiator.as_mut() {
                ctx.deinit();
            }
            if let Some(ctx) = core.acceptor.as_mut() {
                ctx.deinit();
            }
            debug!("node switch stopping");
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeSwitchState {
        self.shared.core.lock().unwrap().state
    }

    /// True once both contexts are up.
    pub fn started(&self) -> bool {
        self.state() == NodeSwitchState::Started
    }

    /// True once the node switch returned to idle.
    pub fn stopped(&self) -> bool {
        self.state() == NodeSwitchState::Idle
    }

    /// True while a direct connection to `dest` is established.
    pub fn connected_to(&self, dest: &Vmac) -> bool {
        self.shared
            .core
            .lock()
            .unwrap()
            .connected_slot_for_dest(dest)
            .is_some()
    }
}

/// Drop empty and oversize URLs.
fn filter_urls(urls: &[String]) -> Vec<String> {
    urls.iter()
        .filter(|url| !url.is_empty() && url.len() <= WSURL_MAX_LEN)
        .cloned()
        .collect()
}

impl Core {
    fn slot_for_dest(&self, dest: &Vmac) -> Option<usize> {
        self.direct.iter().position(|entry| {
            entry.dest.as_ref() == Some(dest) && entry.state != DirectState::Idle
        })
    }

    fn connected_slot_for_dest(&self, dest: &Vmac) -> Option<usize> {
        self.direct.iter().position(|entry| {
            entry.dest.as_ref() == Some(dest) && entry.state == DirectState::Connected
        })
    }
}

impl Shared {
    fn deliver(self: &Arc<Self>) {
        self.resolution_pump
            .deliver(&|dest| (self.resolution_request)(dest));
        self.pump.deliver(&|event| (self.event_func)(event));
    }

    /// Dial the next candidate URL for `slot`. Returns false once the
    /// candidates are exhausted; the slot is released.
    fn dial_next(&self, core: &mut Core, slot: usize) -> bool {
        loop {
            let DirectState::Connecting { urls, next } = core.direct[slot].state.clone() else {
                return false;
            };
            let Some(url) = urls.get(next) else {
                debug!(
                    "direct connect to {:?} exhausted its URLs, releasing slot",
                    core.direct[slot].dest
                );
                core.direct[slot].clear();
                return false;
            };
            core.direct[slot].state = DirectState::Connecting {
                urls: urls.clone(),
                next: next + 1,
            };
            let result = match core.initiator.as_mut() {
                Some(ctx) => ctx.connect(slot, url),
                None => Err(ScError::InvalidOperation),
            };
            match result {
                Ok(()) => return true,
                Err(err) => {
                    debug!("direct dial of {} failed immediately: {}", url, err);
                    // Try the remaining candidates.
                }
            }
        }
    }

    fn handle_socket_event(self: &Arc<Self>, kind: CtxKind, slot: SocketSlot, event: SocketEvent) {
        {
            let mut core = self.core.lock().unwrap();
            let ctx = match kind {
                CtxKind::Initiator => core.initiator.as_mut(),
                CtxKind::Acceptor => core.acceptor.as_mut(),
            };
            if let Some(ctx) = ctx {
                ctx.handle_socket_event(slot, &event);
            }
            match kind {
                CtxKind::Initiator => self.on_initiator_event(&mut core, slot, event),
                CtxKind::Acceptor => self.on_acceptor_event(&mut core, slot, event),
            }
        }
        self.deliver();
    }

    fn on_initiator_event(&self, core: &mut Core, slot: SocketSlot, event: SocketEvent) {
        match event {
            SocketEvent::Connected { .. } => {
                if matches!(core.direct[slot].state, DirectState::Connecting { .. }) {
                    debug!("direct connection to {:?} established", core.direct[slot].dest);
                    core.direct[slot].state = DirectState::Connected;
                }
            }
            SocketEvent::Disconnected { error } => {
                if error == Some(ScError::DuplicatedVmac) {
                    warn!("direct peer rejected us: duplicated VMAC");
                    self.pump.push(NodeSwitchEvent::DuplicatedVmac);
                    core.direct[slot].clear();
                    return;
                }
                match core.direct[slot].state {
                    DirectState::Connecting { .. } => {
                        self.dial_next(core, slot);
                    }
                    _ => core.direct[slot].clear(),
                }
            }
            SocketEvent::Received { pdu } => {
                self.pump.push(NodeSwitchEvent::Received { pdu });
            }
        }
    }

    fn on_acceptor_event(&self, core: &mut Core, _slot: SocketSlot, event: SocketEvent) {
        match event {
            SocketEvent::Connected { peer_vmac, .. } => {
                if peer_vmac == Some(core.local_vmac) {
                    warn!("incoming direct peer claims our own VMAC");
                    self.pump.push(NodeSwitchEvent::DuplicatedVmac);
                }
            }
            SocketEvent::Disconnected { error } => {
                if error == Some(ScError::DuplicatedVmac) {
                    self.pump.push(NodeSwitchEvent::DuplicatedVmac);
                }
            }
            SocketEvent::Received { pdu } => {
                self.pump.push(NodeSwitchEvent::Received { pdu });
            }
        }
    }

    fn handle_ctx_event(self: &Arc<Self>, kind: CtxKind, event: CtxEvent) {
        {
            let mut core = self.core.lock().unwrap();
            match event {
                CtxEvent::Initialized => {
                    if kind == CtxKind::Acceptor && core.state == NodeSwitchState::Starting {
                        core.state = NodeSwitchState::Started;
                        debug!("node switch started");
                        self.pump.push(NodeSwitchEvent::Started);
                    }
                }
                CtxEvent::Deinitialized => {
                    match kind {
                        CtxKind::Initiator => core.initiator = None,
                        CtxKind::Acceptor => core.acceptor = None,
                    }
                    if core.initiator.is_none() && core.acceptor.is_none() {
                        let was_active = core.state != NodeSwitchState::Idle;
                        core.state = NodeSwitchState::Idle;
                        for entry in &mut core.direct {
                            entry.clear();
                        }
                        if was_active {
                            debug!("node switch stopped");
                            self.pump.push(NodeSwitchEvent::Stopped);
                        }
                    }
                }
            }
        }
        self.deliver();
    }

    fn tick(self: &Arc<Self>) {
        {
            let mut core = self.core.lock().unwrap();
            let now = Instant::now();
            for slot in 0..core.direct.len() {
                if let DirectState::AwaitingResolution { deadline } = core.direct[slot].state {
                    if now >= deadline {
                        debug!(
                            "address resolution for {:?} timed out, releasing slot",
                            core.direct[slot].dest
                        );
                        core.direct[slot].clear();
                    }
                }
            }
        }
        self.deliver();
    }
}
