//! Secure-Connect Node
//!
//! A node composes the hub connector, the optional hub function and the
//! optional node switch behind one start/stop/send/event surface — the
//! datalink boundary the BACnet routing layer talks to. On top of the
//! lifecycle aggregation it owns the address-resolution cache and the
//! handling of BVLC-SC control messages arriving from any sub-component.
//!
//! # Lifecycle
//!
//! Nodes are drawn from a fixed-size [`NodePool`]. `init` validates and
//! copies the configuration without touching the network; `start` brings
//! the enabled sub-components up and reports `Started` once all of them
//! are; `stop` is asynchronous and reports `Stopped` once all of them are
//! down; `deinit` returns the pool slot.
//!
//! # Duplicate-VMAC recovery
//!
//! The overlay requires unique VMACs. When any sub-component reports that
//! a remote peer asserted a collision, the node stops every sub-component,
//! regenerates a random local VMAC, starts everything again and emits
//! `Restarted`. PDUs in flight during the restart are lost, as they are
//! on any reconnect.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::bvlc::{self, AdvDirectStatus, AdvHubStatus, BvlcFunction, Payload};
use crate::error::{Result, ScError};
use crate::hub_connector::{
    HubConnector, HubConnectorConfig, HubConnectorEvent, HubConnectorStatus,
};
use crate::hub_function::{HubFunction, HubFunctionConfig, HubFunctionEvent};
use crate::node_switch::{NodeSwitch, NodeSwitchConfig, NodeSwitchEvent};
use crate::runloop::{EventPump, Runloop};
use crate::socket::SocketTransportFactory;
use crate::util::{next_message_id, ScUuid, Vmac};
use crate::{DIRECT_CONNECTIONS_MAX, NODES_MAX, NPDU_BUF_SIZE, RESOLUTION_URLS_MAX, WSURL_MAX_LEN};

const ERROR_STR_OPTION_NOT_UNDERSTOOD: &str = "'must understand' option not understood ";
const ERROR_STR_DIRECT_NOT_SUPPORTED: &str = "direct connections are not supported";

/// Node configuration, copied on `init`.
#[derive(Clone)]
pub struct NodeConfig {
    /// CA certificate chain
    pub ca_cert_chain: Vec<u8>,
    /// Local certificate chain
    pub cert_chain: Vec<u8>,
    /// Private key for the local certificate
    pub key: Vec<u8>,
    /// Stable local device identity
    pub local_uuid: ScUuid,
    /// Local overlay address; regenerated on duplicate-VMAC recovery
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
    /// Hub connector delay before retrying the primary hub
    pub reconnect_timeout: Duration,
    /// How long the node switch waits for an address resolution answer
    pub address_resolution_timeout: Duration,
    /// How long a cached address resolution stays valid
    pub address_resolution_freshness_timeout: Duration,
    /// Primary hub URL
    pub primary_url: String,
    /// Failover hub URL
    pub failover_url: String,
    /// Publish hub service to other nodes
    pub hub_function_enabled: bool,
    /// Listener port for the hub function
    pub hub_server_port: u16,
    /// Accept and initiate direct connections
    pub node_switch_enabled: bool,
    /// Listener port for incoming direct connections
    pub direct_server_port: u16,
    /// Listener interface name
    pub iface: Option<String>,
    /// Space-separated URLs advertised in address-resolution ACKs
    pub direct_connection_accept_uris: String,
}

/// Events emitted to the node's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Every enabled sub-component is up
    Started,
    /// Duplicate-VMAC recovery completed with a fresh VMAC
    Restarted,
    /// Every sub-component is down
    Stopped,
    /// An encapsulated NPDU arrived
    Received {
        /// The full BVLC-SC message bytes
        pdu: Vec<u8>,
    },
}

/// Node lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Configured but not running
    Idle,
    /// Waiting for the enabled sub-components to come up
    Starting,
    /// Operating
    Started,
    /// Duplicate-VMAC recovery in progress
    Restarting,
    /// Waiting for the sub-components to go down
    Stopping,
}

/// Owner callback receiving node events.
pub type NodeEventFn = dyn Fn(NodeEvent) + Send + Sync;

/// A cached address resolution: the URLs at which a remote VMAC accepts
/// direct connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressResolution {
    /// The remote VMAC the URLs belong to
    pub vmac: Vmac,
    /// Direct-connect URLs, most preferred first
    pub urls: Vec<String>,
}

#[derive(Clone)]
struct ResolutionEntry {
    used: bool,
    vmac: Vmac,
    urls: Vec<String>,
    fresh_until: Instant,
}

struct NodeCore {
    conf: NodeConfig,
    state: NodeState,
    resolution: Vec<ResolutionEntry>,
    hub_connector: Option<HubConnector>,
    hub_function: Option<HubFunction>,
    node_switch: Option<NodeSwitch>,
}

struct NodeShared {
    core: Mutex<NodeCore>,
    pump: EventPump<NodeEvent>,
    event_func: Box<NodeEventFn>,
    runloop: Runloop,
    factory: Arc<dyn SocketTransportFactory>,
}

/// Handle to a pooled node. Cloning shares the same node.
#[derive(Clone)]
pub struct Node {
    shared: Arc<NodeShared>,
    pool: Arc<PoolShared>,
    slot: usize,
}

struct PoolShared {
    runloop: Runloop,
    factory: Arc<dyn SocketTransportFactory>,
    slots: Mutex<Vec<Option<Arc<NodeShared>>>>,
}

/// Fixed pool of nodes sharing one runloop and one transport factory.
///
/// The pool is the only long-lived runtime object; its lifetime should
/// bracket the runloop's.
#[derive(Clone)]
pub struct NodePool {
    shared: Arc<PoolShared>,
}

impl NodePool {
    /// Create a pool with [`NODES_MAX`] slots.
    pub fn new(runloop: Runloop, factory: Arc<dyn SocketTransportFactory>) -> NodePool {
        let mut slots = Vec::with_capacity(NODES_MAX);
        slots.resize_with(NODES_MAX, || None);
        NodePool {
            shared: Arc::new(PoolShared {
                runloop,
                factory,
                slots: Mutex::new(slots),
            }),
        }
    }

    /// Validate `conf`, claim a pool slot and store a copy of the
    /// configuration. No network activity happens until `start`.
    pub fn init(&self, conf: NodeConfig, event_func: Box<NodeEventFn>) -> Result<Node> {
        validate_conf(&conf)?;
        let mut resolution = Vec::with_capacity(DIRECT_CONNECTIONS_MAX);
        resolution.resize_with(DIRECT_CONNECTIONS_MAX, || ResolutionEntry {
            used: false,
            vmac: Vmac::default(),
            urls: Vec::new(),
            fresh_until: Instant::now(),
        });
        let shared = Arc::new(NodeShared {
            core: Mutex::new(NodeCore {
                conf,
                state: NodeState::Idle,
                resolution,
                hub_connector: None,
                hub_function: None,
                node_switch: None,
            }),
            pump: EventPump::new(),
            event_func,
            runloop: self.shared.runloop.clone(),
            factory: self.shared.factory.clone(),
        });
        let mut slots = self.shared.slots.lock().unwrap();
        let Some(slot) = slots.iter().position(|entry| entry.is_none()) else {
            return Err(ScError::NoResources);
        };
        slots[slot] = Some(shared.clone());
        debug!("node allocated in pool slot {}", slot);
        Ok(Node {
            shared,
            pool: self.shared.clone(),
            slot,
        })
    }
}

fn validate_conf(conf: &NodeConfig) -> Result<()> {
    if conf.ca_cert_chain.is_empty() || conf.cert_chain.is_empty() || conf.key.is_empty() {
        return Err(ScError::BadParam);
    }
    if conf.max_bvlc_len == 0 || conf.max_npdu_len == 0 {
        return Err(ScError::BadParam);
    }
    if conf.connect_timeout.is_zero()
        || conf.heartbeat_timeout.is_zero()
        || conf.disconnect_timeout.is_zero()
        || conf.reconnect_timeout.is_zero()
        || conf.address_resolution_timeout.is_zero()
        || conf.address_resolution_freshness_timeout.is_zero()
    {
        return Err(ScError::BadParam);
    }
    if conf.primary_url.is_empty()
        || conf.failover_url.is_empty()
        || conf.primary_url.len() > WSURL_MAX_LEN
        || conf.failover_url.len() > WSURL_MAX_LEN
    {
        return Err(ScError::BadParam);
    }
    if conf.hub_function_enabled && conf.hub_server_port == 0 {
        return Err(ScError::BadParam);
    }
    if conf.node_switch_enabled && conf.direct_server_port == 0 {
        return Err(ScError::BadParam);
    }
    Ok(())
}

impl Node {
    /// Start the node. Valid only from idle; `Started` is emitted once
    /// every enabled sub-component is up. On failure already-started
    /// sub-components are rolled back and the node returns to idle.
    pub fn start(&self) -> Result<()> {
        let result = {
            let mut core = self.shared.core.lock().unwrap();
            if core.state != NodeState::Idle {
                return Err(ScError::InvalidOperation);
            }
            self.shared.start_state(&mut core, NodeState::Starting)
        };
        self.shared.deliver();
        result
    }

    /// Request a stop of every live sub-component. `Stopped` is emitted
    /// once all of them confirmed.
    pub fn stop(&self) {
        {
            let mut core = self.shared.core.lock().unwrap();
            if core.state != NodeState::Idle {
                core.state = NodeState::Stopping;
                self.shared.stop_components(&mut core);
            }
        }
        self.shared.deliver();
    }

    /// Return the pool slot. Valid only while idle.
    pub fn deinit(&self) -> Result<()> {
        {
            let core = self.shared.core.lock().unwrap();
            if core.state != NodeState::Idle {
                return Err(ScError::InvalidOperation);
            }
        }
        let mut slots = self.pool.slots.lock().unwrap();
        match slots.get_mut(self.slot) {
            Some(entry)
                if entry
                    .as_ref()
                    .is_some_and(|shared| Arc::ptr_eq(shared, &self.shared)) =>
            {
                *entry = None;
                debug!("node returned pool slot {}", self.slot);
                Ok(())
            }
            _ => Err(ScError::InvalidOperation),
        }
    }

    /// Send a PDU: via the node switch when enabled (with hub fallback),
    /// else via the hub connector. Valid only while started.
    pub fn send(&self, pdu: &[u8]) -> Result<()> {
        let core = self.shared.core.lock().unwrap();
        if core.state != NodeState::Started {
            return Err(ScError::InvalidOperation);
        }
        self.shared.send_via(&core, pdu)
    }

    /// Send a PDU over the hub connector regardless of the node switch —
    /// for traffic that must traverse the hub. Valid only while started.
    pub fn hub_connector_send(&self, pdu: &[u8]) -> Result<()> {
        let core = self.shared.core.lock().unwrap();
        if core.state != NodeState::Started {
            return Err(ScError::InvalidOperation);
        }
        core.hub_connector
            .as_ref()
            .ok_or(ScError::InvalidOperation)?
            .send(pdu)
    }

    /// The cached address resolution for `vmac`, unless it has gone
    /// stale. The cache is not mutated.
    pub fn get_address_resolution(&self, vmac: &Vmac) -> Option<AddressResolution> {
        let core = self.shared.core.lock().unwrap();
        if core.state != NodeState::Started {
            return None;
        }
        core.resolution
            .iter()
            .find(|entry| entry.used && entry.vmac == *vmac)
            .filter(|entry| Instant::now() < entry.fresh_until)
            .map(|entry| AddressResolution {
                vmac: entry.vmac,
                urls: entry.urls.clone(),
            })
    }

    /// Encode and send an address-resolution request for `dest`.
    pub fn send_address_resolution(&self, dest: &Vmac) -> Result<()> {
        self.shared.send_address_resolution(dest)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.shared.core.lock().unwrap().state
    }

    /// The node's current VMAC (it changes on duplicate-VMAC recovery).
    pub fn local_vmac(&self) -> Vmac {
        self.shared.core.lock().unwrap().conf.local_vmac
    }

    /// Hub connection status, as advertised to peers.
    pub fn hub_connector_status(&self) -> HubConnectorStatus {
        self.shared
            .core
            .lock()
            .unwrap()
            .hub_connector
            .as_ref()
            .map(|connector| connector.status())
            .unwrap_or(HubConnectorStatus::NotConnected)
    }
}

impl NodeCore {
    fn all_stopped(&self) -> bool {
        let connector_stopped = self
            .hub_connector
            .as_ref()
            .map_or(true, |connector| connector.stopped());
        let hub_function_stopped = !self.conf.hub_function_enabled
            || self
                .hub_function
                .as_ref()
                .map_or(true, |hub| hub.stopped());
        let node_switch_stopped = !self.conf.node_switch_enabled
            || self
                .node_switch
                .as_ref()
                .map_or(true, |switch| switch.stopped());
        connector_stopped && hub_function_stopped && node_switch_stopped
    }

    fn all_started(&self) -> bool {
        let connector_started = self
            .hub_connector
            .as_ref()
            .is_some_and(|connector| connector.started());
        let hub_function_started = !self.conf.hub_function_enabled
            || self
                .hub_function
                .as_ref()
                .is_some_and(|hub| hub.started());
        let node_switch_started = !self.conf.node_switch_enabled
            || self
                .node_switch
                .as_ref()
                .is_some_and(|switch| switch.started());
        connector_started && hub_function_started && node_switch_started
    }

    fn get_resolution_mut(&mut self, vmac: &Vmac) -> Option<&mut ResolutionEntry> {
        self.resolution
            .iter_mut()
            .find(|entry| entry.used && entry.vmac == *vmac)
    }

    fn alloc_resolution_mut(&mut self, vmac: &Vmac) -> Option<&mut ResolutionEntry> {
        if self.get_resolution_mut(vmac).is_some() {
            return self.get_resolution_mut(vmac);
        }
        let entry = self.resolution.iter_mut().find(|entry| !entry.used)?;
        entry.used = true;
        entry.vmac = *vmac;
        entry.urls.clear();
        Some(entry)
    }
}

impl NodeShared {
    fn deliver(self: &Arc<Self>) {
        self.pump.deliver(&|event| (self.event_func)(event));
    }

    /// Route a PDU the way `send` does, without the state check.
    fn send_via(&self, core: &NodeCore, pdu: &[u8]) -> Result<()> {
        if core.conf.node_switch_enabled {
            if let Some(switch) = core.node_switch.as_ref() {
                return switch.send(pdu);
            }
        }
        core.hub_connector
            .as_ref()
            .ok_or(ScError::InvalidOperation)?
            .send(pdu)
    }

    fn send_address_resolution(self: &Arc<Self>, dest: &Vmac) -> Result<()> {
        let pdu = bvlc::encode_address_resolution(next_message_id(), None, Some(dest))
            .map_err(|_| ScError::NoBuffers)?;
        let core = self.core.lock().unwrap();
        if core.state != NodeState::Started {
            return Err(ScError::InvalidOperation);
        }
        self.send_via(&core, &pdu)
    }

    /// Bring up every enabled sub-component. Called with the core locked,
    /// both for a fresh start and for the restart leg of duplicate-VMAC
    /// recovery.
    fn start_state(self: &Arc<Self>, core: &mut NodeCore, state: NodeState) -> Result<()> {
        core.state = state;
        core.hub_connector = None;
        core.hub_function = None;
        core.node_switch = None;

        if state == NodeState::Restarting {
            let fresh = Vmac::random();
            debug!(
                "node restarting with fresh VMAC {} (was {})",
                fresh, core.conf.local_vmac
            );
            core.conf.local_vmac = fresh;
        } else {
            for entry in &mut core.resolution {
                entry.used = false;
                entry.urls.clear();
            }
        }
        let conf = core.conf.clone();

        let weak = Arc::downgrade(self);
        let connector = match HubConnector::start(
            HubConnectorConfig {
                ca_cert_chain: conf.ca_cert_chain.clone(),
                cert_chain: conf.cert_chain.clone(),
                key: conf.key.clone(),
                local_uuid: conf.local_uuid,
                local_vmac: conf.local_vmac,
                max_bvlc_len: conf.max_bvlc_len,
                max_npdu_len: conf.max_npdu_len,
                connect_timeout: conf.connect_timeout,
                heartbeat_timeout: conf.heartbeat_timeout,
                disconnect_timeout: conf.disconnect_timeout,
                primary_url: conf.primary_url.clone(),
                failover_url: conf.failover_url.clone(),
                reconnect_timeout: conf.reconnect_timeout,
            },
            self.runloop.clone(),
            self.factory.as_ref(),
            Box::new(move |event| {
                if let Some(node) = weak.upgrade() {
                    node.on_hub_connector_event(event);
                }
            }),
        ) {
            Ok(connector) => connector,
            Err(err) => {
                core.state = NodeState::Idle;
                return Err(err);
            }
        };
        core.hub_connector = Some(connector.clone());

        if conf.hub_function_enabled {
            let weak = Arc::downgrade(self);
            match HubFunction::start(
                HubFunctionConfig {
                    ca_cert_chain: conf.ca_cert_chain.clone(),
                    cert_chain: conf.cert_chain.clone(),
                    key: conf.key.clone(),
                    local_uuid: conf.local_uuid,
                    local_vmac: conf.local_vmac,
                    max_bvlc_len: conf.max_bvlc_len,
                    max_npdu_len: conf.max_npdu_len,
                    connect_timeout: conf.connect_timeout,
                    heartbeat_timeout: conf.heartbeat_timeout,
                    disconnect_timeout: conf.disconnect_timeout,
                    port: conf.hub_server_port,
                    iface: conf.iface.clone(),
                },
                self.factory.as_ref(),
                Box::new(move |event| {
                    if let Some(node) = weak.upgrade() {
                        node.on_hub_function_event(event);
                    }
                }),
            ) {
                Ok(hub_function) => core.hub_function = Some(hub_function),
                Err(err) => {
                    core.state = NodeState::Idle;
                    connector.stop();
                    return Err(err);
                }
            }
        }

        if conf.node_switch_enabled {
            let weak = Arc::downgrade(self);
            let weak_for_resolution = Arc::downgrade(self);
            let connector_for_fallback = connector.clone();
            match NodeSwitch::start(
                NodeSwitchConfig {
                    ca_cert_chain: conf.ca_cert_chain.clone(),
                    cert_chain: conf.cert_chain.clone(),
                    key: conf.key.clone(),
                    local_uuid: conf.local_uuid,
                    local_vmac: conf.local_vmac,
                    max_bvlc_len: conf.max_bvlc_len,
                    max_npdu_len: conf.max_npdu_len,
                    connect_timeout: conf.connect_timeout,
                    heartbeat_timeout: conf.heartbeat_timeout,
                    disconnect_timeout: conf.disconnect_timeout,
                    direct_port: conf.direct_server_port,
                    iface: conf.iface.clone(),
                    address_resolution_timeout: conf.address_resolution_timeout,
                },
                self.runloop.clone(),
                self.factory.as_ref(),
                Box::new(move |event| {
                    if let Some(node) = weak.upgrade() {
                        node.on_node_switch_event(event);
                    }
                }),
                Box::new(move |dest| {
                    if let Some(node) = weak_for_resolution.upgrade() {
                        if let Err(err) = node.send_address_resolution(&dest) {
                            debug!("address resolution request for {} not sent: {}", dest, err);
                        }
                    }
                }),
                Box::new(move |pdu| connector_for_fallback.send(pdu)),
            ) {
                Ok(node_switch) => core.node_switch = Some(node_switch),
                Err(err) => {
                    core.state = NodeState::Idle;
                    if let Some(hub_function) = core.hub_function.as_ref() {
                        hub_function.stop();
                    }
                    connector.stop();
                    return Err(err);
                }
            }
        }

        // With no asynchronous sub-component enabled the node is already
        // fully up; otherwise the Started events drive the transition.
        self.process_start_event(core);
        Ok(())
    }

    fn stop_components(&self, core: &mut NodeCore) {
        if let Some(connector) = core.hub_connector.as_ref() {
            connector.stop();
        }
        if core.conf.hub_function_enabled {
            if let Some(hub_function) = core.hub_function.as_ref() {
                hub_function.stop();
            }
        }
        if core.conf.node_switch_enabled {
            if let Some(node_switch) = core.node_switch.as_ref() {
                node_switch.stop();
            }
        }
    }

    fn restart(self: &Arc<Self>, core: &mut NodeCore) {
        warn!("duplicated VMAC reported, restarting node");
        core.state = NodeState::Restarting;
        self.stop_components(core);
    }

    fn maybe_restart(self: &Arc<Self>, core: &mut NodeCore) {
        if core.state != NodeState::Stopping && core.state != NodeState::Restarting {
            self.restart(core);
        }
    }

    fn process_stop_event(self: &Arc<Self>, core: &mut NodeCore) {
        if !core.all_stopped() {
            return;
        }
        match core.state {
            NodeState::Stopping => {
                core.state = NodeState::Idle;
                debug!("node stopped");
                self.pump.push(NodeEvent::Stopped);
            }
            NodeState::Restarting => {
                if let Err(err) = self.start_state(core, NodeState::Restarting) {
                    warn!("node restart failed: {}", err);
                    core.state = NodeState::Idle;
                    self.pump.push(NodeEvent::Stopped);
                }
            }
            _ => {}
        }
    }

    fn process_start_event(self: &Arc<Self>, core: &mut NodeCore) {
        if !core.all_started() {
            return;
        }
        match core.state {
            NodeState::Starting => {
                core.state = NodeState::Started;
                debug!("node started");
                self.pump.push(NodeEvent::Started);
            }
            NodeState::Restarting => {
                core.state = NodeState::Started;
                debug!("node restarted with VMAC {}", core.conf.local_vmac);
                self.pump.push(NodeEvent::Restarted);
            }
            _ => {}
        }
    }

    fn on_hub_connector_event(self: &Arc<Self>, event: HubConnectorEvent) {
        {
            let mut core = self.core.lock().unwrap();
            match event {
                HubConnectorEvent::Stopped { .. } => {
                    core.hub_connector = None;
                    self.process_stop_event(&mut core);
                }
                HubConnectorEvent::Disconnected {
                    error: Some(ScError::DuplicatedVmac),
                } => {
                    self.maybe_restart(&mut core);
                }
                HubConnectorEvent::Received { pdu } => {
                    self.process_received(&mut core, pdu);
                }
                _ => {}
            }
        }
        self.deliver();
    }

    fn on_hub_function_event(self: &Arc<Self>, event: HubFunctionEvent) {
        {
            let mut core = self.core.lock().unwrap();
            match event {
                HubFunctionEvent::Started => self.process_start_event(&mut core),
                HubFunctionEvent::Stopped => {
                    core.hub_function = None;
                    self.process_stop_event(&mut core);
                }
                HubFunctionEvent::DuplicatedVmac => self.maybe_restart(&mut core),
                HubFunctionEvent::Received { pdu } => self.process_received(&mut core, pdu),
            }
        }
        self.deliver();
    }

    fn on_node_switch_event(self: &Arc<Self>, event: NodeSwitchEvent) {
        {
            let mut core = self.core.lock().unwrap();
            match event {
                NodeSwitchEvent::Started => self.process_start_event(&mut core),
                NodeSwitchEvent::Stopped => {
                    core.node_switch = None;
                    self.process_stop_event(&mut core);
                }
                NodeSwitchEvent::DuplicatedVmac => self.maybe_restart(&mut core),
                NodeSwitchEvent::Received { pdu } => self.process_received(&mut core, pdu),
            }
        }
        self.deliver();
    }

    /// Send a locally synthesized control response over the normal send
    /// path. Oversize responses and send failures are logged, never
    /// propagated.
    fn send_response(&self, core: &NodeCore, response: bvlc::Result<Vec<u8>>) {
        let response = match response {
            Ok(response) if response.len() <= NPDU_BUF_SIZE => response,
            Ok(_) => {
                debug!("control response exceeds the PDU buffer, dropped");
                return;
            }
            Err(err) => {
                debug!("control response could not be encoded: {}", err);
                return;
            }
        };
        if let Err(err) = self.send_via(core, &response) {
            warn!("control response not sent: {}", err);
        }
    }

    /// BVLC-SC control handling for every PDU a sub-component surfaces.
    fn process_received(self: &Arc<Self>, core: &mut NodeCore, pdu: Vec<u8>) {
        let decoded = match bvlc::Decoded::decode(&pdu) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("dropping undecodable PDU: {}", err);
                return;
            }
        };

        // A destination option we must understand but do not: drop, and
        // NAK when the originator expects a result.
        if let Some(option) = decoded
            .dest_options
            .iter()
            .find(|option| option.must_understand)
        {
            debug!("PDU with must-understand option dropped");
            if decoded.needs_result() {
                let response = bvlc::encode_result(
                    decoded.message_id,
                    None,
                    decoded.origin.as_ref(),
                    decoded.function,
                    Some(option.marker),
                    Some((
                        bvlc::ERROR_CLASS_COMMUNICATION,
                        bvlc::ERROR_CODE_HEADER_NOT_UNDERSTOOD,
                    )),
                    Some(ERROR_STR_OPTION_NOT_UNDERSTOOD),
                );
                self.send_response(core, response);
            }
            return;
        }

        match decoded.payload {
            Payload::Result(result) => {
                if result.function == BvlcFunction::AddressResolution && result.is_nak() {
                    let Some(origin) = decoded.origin else {
                        return;
                    };
                    debug!("address resolution NAK from {}", origin);
                    let freshness = core.conf.address_resolution_freshness_timeout;
                    match core.alloc_resolution_mut(&origin) {
                        Some(entry) => {
                            entry.urls.clear();
                            entry.fresh_until = Instant::now() + freshness;
                        }
                        None => {
                            debug!("no free resolution entry for {}", origin);
                        }
                    }
                } else {
                    debug!(
                        "unexpected result PDU for {:?} from {:?}",
                        result.function, decoded.origin
                    );
                }
            }
            Payload::Advertisement { .. } => {
                // Reserved for passive discovery.
            }
            Payload::AdvertisementSolicitation => {
                let hub_status = match core
                    .hub_connector
                    .as_ref()
                    .map(|connector| connector.status())
                {
                    Some(HubConnectorStatus::ConnectedPrimary) => AdvHubStatus::ConnectedToPrimary,
                    Some(HubConnectorStatus::ConnectedFailover) => {
                        AdvHubStatus::ConnectedToFailover
                    }
                    _ => AdvHubStatus::NoHubConnection,
                };
                let direct_status = if core.conf.node_switch_enabled {
                    AdvDirectStatus::Supported
                } else {
                    AdvDirectStatus::Unsupported
                };
                let response = bvlc::encode_advertisement(
                    next_message_id(),
                    None,
                    decoded.origin.as_ref(),
                    hub_status,
                    direct_status,
                    core.conf.max_bvlc_len,
                    core.conf.max_npdu_len,
                );
                self.send_response(core, response);
            }
            Payload::AddressResolution => {
                if core.conf.node_switch_enabled {
                    let response = bvlc::encode_address_resolution_ack(
                        decoded.message_id,
                        None,
                        decoded.origin.as_ref(),
                        &core.conf.direct_connection_accept_uris,
                    );
                    self.send_response(core, response);
                } else {
                    let response = bvlc::encode_result(
                        decoded.message_id,
                        None,
                        decoded.origin.as_ref(),
                        decoded.function,
                        None,
                        Some((
                            bvlc::ERROR_CLASS_COMMUNICATION,
                            bvlc::ERROR_CODE_OPTIONAL_FUNCTIONALITY_NOT_SUPPORTED,
                        )),
                        Some(ERROR_STR_DIRECT_NOT_SUPPORTED),
                    );
                    self.send_response(core, response);
                }
            }
            Payload::AddressResolutionAck { uri_list } => {
                let Some(origin) = decoded.origin else {
                    debug!("address resolution ACK without an originator, dropped");
                    return;
                };
                let urls = parse_uri_list(&uri_list);
                let freshness = core.conf.address_resolution_freshness_timeout;
                let stored = match core.alloc_resolution_mut(&origin) {
                    Some(entry) => {
                        entry.urls = urls.clone();
                        entry.fresh_until = Instant::now() + freshness;
                        true
                    }
                    None => {
                        debug!("no free resolution entry for {}", origin);
                        false
                    }
                };
                if stored {
                    debug!("{} resolves to {} URL(s)", origin, urls.len());
                    if let Some(switch) = core.node_switch.as_ref() {
                        switch.process_address_resolution(&origin, &urls);
                    }
                }
            }
            Payload::EncapsulatedNpdu(_) => {
                self.pump.push(NodeEvent::Received { pdu });
            }
            Payload::Other(_) => {
                debug!("PDU with function {:?} ignored", decoded.function);
            }
        }
    }
}

/// Split an address-resolution ACK payload into URLs: separated by the
/// space octet, empty tokens discarded, oversize URLs discarded, capped
/// at [`RESOLUTION_URLS_MAX`].
fn parse_uri_list(uri_list: &str) -> Vec<String> {
    uri_list
        .split(' ')
        .filter(|url| !url.is_empty() && url.len() <= WSURL_MAX_LEN)
        .take(RESOLUTION_URLS_MAX)
        .map(str::to_string)
        .collect()
}
