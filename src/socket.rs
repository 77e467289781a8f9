//! Socket Context Glue and Transport Abstraction
//!
//! Secure-connect components never touch WebSocket or TLS machinery
//! directly. Each component owns a [`SocketCtx`]: a set of socket slots
//! sharing one TLS configuration and one role (initiator or acceptor),
//! backed by a [`SocketTransport`] implementation supplied by the caller.
//! The transport delivers lifecycle events (connected, disconnected,
//! received, context initialized/deinitialized) upward through a
//! [`SocketEventSink`]; the context folds them into per-slot bookkeeping
//! before the owning state machine acts on them.
//!
//! Contract for transport implementations:
//! - Events must be delivered from the transport's own threads or tasks,
//!   never synchronously from within `connect`/`send_pdu`/`deinit` calls.
//! - Events for any one slot must be delivered in the order they occurred;
//!   no ordering is required across slots.
//! - `deinit` is asynchronous: the transport must eventually deliver
//!   [`CtxEvent::Deinitialized`], after which it delivers nothing else.
//! - Acceptor transports report a successfully started listener with
//!   [`CtxEvent::Initialized`], and report the peer's VMAC and UUID
//!   learned during the connect handshake in [`SocketEvent::Connected`].

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{Result, ScError};
use crate::util::{ScUuid, Vmac};

/// Index of a socket slot within its context.
pub type SocketSlot = usize;

/// Role of a socket context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketCtxRole {
    /// Outbound connections (hub connector, node-switch dialer)
    Initiator,
    /// Inbound connections (hub function, node-switch listener)
    Acceptor,
}

/// Configuration shared by every socket in a context.
///
/// Certificate, chain and key bytes are copied in; rotating credentials
/// requires a stop/start cycle.
#[derive(Clone)]
pub struct ContextConfig {
    /// CA certificate chain used to verify the remote side
    pub ca_cert_chain: Vec<u8>,
    /// Local certificate chain presented to the remote side
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
    /// TLS + WebSocket connect handshake timeout
    pub connect_timeout: Duration,
    /// Idle heartbeat interval
    pub heartbeat_timeout: Duration,
    /// Graceful disconnect timeout
    pub disconnect_timeout: Duration,
    /// Listener port (acceptor contexts only)
    pub port: u16,
    /// Listener interface name (acceptor contexts only)
    pub iface: Option<String>,
}

impl ContextConfig {
    /// Validate the configuration for the given role.
    pub fn validate(&self, role: SocketCtxRole) -> Result<()> {
        if self.ca_cert_chain.is_empty() || self.cert_chain.is_empty() || self.key.is_empty() {
            return Err(ScError::BadParam);
        }
        if self.max_bvlc_len == 0 || self.max_npdu_len == 0 {
            return Err(ScError::BadParam);
        }
        if self.connect_timeout.is_zero()
            || self.heartbeat_timeout.is_zero()
            || self.disconnect_timeout.is_zero()
        {
            return Err(ScError::BadParam);
        }
        if role == SocketCtxRole::Acceptor && self.port == 0 {
            return Err(ScError::BadParam);
        }
        Ok(())
    }
}

/// Per-socket event delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The connect (or accept) handshake completed.
    Connected {
        /// Remote VMAC learned during the handshake, if known
        peer_vmac: Option<Vmac>,
        /// Remote UUID learned during the handshake, if known
        peer_uuid: Option<ScUuid>,
    },
    /// The socket closed. `error` distinguishes failure causes; a
    /// duplicate-VMAC rejection arrives as `Some(ScError::DuplicatedVmac)`.
    Disconnected {
        /// Cause, when the close was not a clean local disconnect
        error: Option<ScError>,
    },
    /// A complete BVLC-SC message arrived.
    Received {
        /// The message bytes; not retained past the handling call
        pdu: Vec<u8>,
    },
}

/// Context-wide event delivered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxEvent {
    /// An acceptor context's listener is up
    Initialized,
    /// The context released all resources after a `deinit` request
    Deinitialized,
}

/// Upward event path from a transport into the owning component.
pub trait SocketEventSink: Send + Sync {
    /// Deliver a per-socket event.
    fn socket_event(&self, slot: SocketSlot, event: SocketEvent);
    /// Deliver a context-wide event.
    fn ctx_event(&self, event: CtxEvent);
}

/// The WebSocket-over-TLS transport primitive, supplied by the embedder.
pub trait SocketTransport: Send {
    /// Bind the transport to a configuration, role, slot count and event
    /// sink. For acceptor roles this starts the listener; readiness is
    /// reported asynchronously with [`CtxEvent::Initialized`].
    fn init(
        &mut self,
        cfg: &ContextConfig,
        role: SocketCtxRole,
        slot_count: usize,
        sink: Arc<dyn SocketEventSink>,
    ) -> Result<()>;

    /// Begin an outbound connect on `slot` to a `wss://` URL.
    fn connect(&mut self, slot: SocketSlot, url: &str) -> Result<()>;

    /// Send one BVLC-SC message on a connected slot.
    fn send_pdu(&mut self, slot: SocketSlot, pdu: &[u8]) -> Result<()>;

    /// Close one slot. Completion arrives as a `Disconnected` event.
    fn disconnect(&mut self, slot: SocketSlot);

    /// Release the whole context. Completion arrives as `Deinitialized`.
    fn deinit(&mut self);
}

/// Factory handing out transport instances, one per socket context.
pub trait SocketTransportFactory: Send + Sync {
    /// Create a transport for a context with the given role.
    fn create(&self, role: SocketCtxRole) -> Box<dyn SocketTransport>;
}

/// Lifecycle of a single socket slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Free
    #[default]
    Idle,
    /// Outbound connect in progress
    Connecting,
    /// Handshake complete, PDUs may flow
    Connected,
    /// Local close requested, close event pending
    Disconnecting,
}

#[derive(Default)]
struct Slot {
    state: SlotState,
    peer_vmac: Option<Vmac>,
    peer_uuid: Option<ScUuid>,
}

/// A collection of socket slots sharing one configuration and role.
///
/// Owned by exactly one component and only ever touched under that
/// component's state lock; the context itself carries no locking.
pub struct SocketCtx {
    transport: Box<dyn SocketTransport>,
    role: SocketCtxRole,
    slots: Vec<Slot>,
    deinit_requested: bool,
}

impl SocketCtx {
    /// Create and initialize a context.
    pub fn init(
        cfg: &ContextConfig,
        role: SocketCtxRole,
        slot_count: usize,
        factory: &dyn SocketTransportFactory,
        sink: Arc<dyn SocketEventSink>,
    ) -> Result<SocketCtx> {
        cfg.validate(role)?;
        if slot_count == 0 {
            return Err(ScError::BadParam);
        }
        let mut transport = factory.create(role);
        transport.init(cfg, role, slot_count, sink)?;
        let mut slots = Vec::with_capacity(slot_count);
        slots.resize_with(slot_count, Slot::default);
        debug!("socket context initialized: {:?}, {} slots", role, slot_count);
        Ok(SocketCtx {
            transport,
            role,
            slots,
            deinit_requested: false,
        })
    }

    /// Context role.
    pub fn role(&self) -> SocketCtxRole {
        self.role
    }

    /// Begin an outbound connect on an idle slot.
    pub fn connect(&mut self, slot: SocketSlot, url: &str) -> Result<()> {
        let entry = self.slots.get_mut(slot).ok_or(ScError::BadParam)?;
        if entry.state != SlotState::Idle {
            return Err(ScError::InvalidOperation);
        }
        entry.state = SlotState::Connecting;
        if let Err(err) = self.transport.connect(slot, url) {
            self.slots[slot] = Slot::default();
            return Err(err);
        }
        Ok(())
    }

    /// Send a PDU on a connected slot.
    pub fn send(&mut self, slot: SocketSlot, pdu: &[u8]) -> Result<()> {
        let entry = self.slots.get(slot).ok_or(ScError::BadParam)?;
        if entry.state != SlotState::Connected {
            return Err(ScError::InvalidOperation);
        }
        self.transport.send_pdu(slot, pdu)
    }

    /// Request a close of one slot.
    pub fn disconnect(&mut self, slot: SocketSlot) {
        if let Some(entry) = self.slots.get_mut(slot) {
            if matches!(entry.state, SlotState::Connecting | SlotState::Connected) {
                entry.state = SlotState::Disconnecting;
                self.transport.disconnect(slot);
            }
        }
    }

    /// Request context teardown; completion arrives as `Deinitialized`.
    pub fn deinit(&mut self) {
        if !self.deinit_requested {
            self.deinit_requested = true;
            self.transport.deinit();
        }
    }

    /// Fold a transport event into the slot bookkeeping. Must be called
    /// before the owning state machine inspects the event.
    pub fn handle_socket_event(&mut self, slot: SocketSlot, event: &SocketEvent) {
        let Some(entry) = self.slots.get_mut(slot) else {
            warn!("socket event for out-of-range slot {}", slot);
            return;
        };
        match event {
            SocketEvent::Connected { peer_vmac, peer_uuid } => {
                entry.state = SlotState::Connected;
                entry.peer_vmac = *peer_vmac;
                entry.peer_uuid = *peer_uuid;
            }
            SocketEvent::Disconnected { .. } => {
                *entry = Slot::default();
            }
            SocketEvent::Received { .. } => {}
        }
    }

    /// True once the slot completed its handshake.
    pub fn slot_connected(&self, slot: SocketSlot) -> bool {
        self.slots
            .get(slot)
            .is_some_and(|entry| entry.state == SlotState::Connected)
    }

    /// Lifecycle state of a slot.
    pub fn slot_state(&self, slot: SocketSlot) -> SlotState {
        self.slots.get(slot).map(|entry| entry.state).unwrap_or_default()
    }

    /// Remote VMAC recorded for a slot during the handshake.
    pub fn peer_vmac(&self, slot: SocketSlot) -> Option<Vmac> {
        self.slots.get(slot).and_then(|entry| entry.peer_vmac)
    }

    /// Find the connected slot whose peer has the given VMAC.
    pub fn find_slot_by_vmac(&self, vmac: &Vmac) -> Option<SocketSlot> {
        self.slots.iter().position(|entry| {
            entry.state == SlotState::Connected && entry.peer_vmac.as_ref() == Some(vmac)
        })
    }

    /// First idle slot, if any.
    pub fn free_slot(&self) -> Option<SocketSlot> {
        self.slots
            .iter()
            .position(|entry| entry.state == SlotState::Idle)
    }

    /// Slots currently connected.
    pub fn connected_slots(&self) -> Vec<SocketSlot> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.state == SlotState::Connected)
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Number of slots not in the idle state.
    pub fn non_idle_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.state != SlotState::Idle)
            .count()
    }
}
