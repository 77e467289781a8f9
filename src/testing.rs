//! Test Support
//!
//! A scripted stand-in for the WebSocket/TLS transport, plus small
//! synchronization helpers shared by the component tests. The scripted
//! transport records every call the stack makes and — in `accepting` mode —
//! services connect/deinit requests from its own pump thread, honoring the
//! transport contract that events are never delivered synchronously from
//! within a call.

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Result, ScError};
use crate::socket::{
    ContextConfig, CtxEvent, SocketCtxRole, SocketEvent, SocketEventSink, SocketSlot,
    SocketTransport, SocketTransportFactory,
};

/// Route `log` output into the test harness (RUST_LOG selects the level).
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `cond` until it holds or `timeout` elapses.
pub(crate) fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Ordered event recorder with blocking waits.
pub(crate) struct EventLog<E> {
    events: Mutex<Vec<E>>,
    wakeup: Condvar,
}

impl<E: Clone + Debug> EventLog<E> {
    pub fn new() -> Self {
        EventLog {
            events: Mutex::new(Vec::new()),
            wakeup: Condvar::new(),
        }
    }

    pub fn push(&self, event: E) {
        self.events.lock().unwrap().push(event);
        self.wakeup.notify_all();
    }

    pub fn snapshot(&self) -> Vec<E> {
        self.events.lock().unwrap().clone()
    }

    /// Block until `pred` holds over the recorded events; panic with the
    /// event trace on timeout.
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&[E]) -> bool) {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap();
        loop {
            if pred(&events) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                panic!("timed out waiting for events; recorded: {:?}", *events);
            }
            let (guard, _) = self.wakeup.wait_timeout(events, deadline - now).unwrap();
            events = guard;
        }
    }

    /// Number of recorded events matching `pred`.
    pub fn count(&self, pred: impl Fn(&E) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|event| pred(event)).count()
    }
}

/// A call the stack made into a scripted transport.
#[derive(Debug, Clone)]
pub(crate) enum TransportOp {
    Connect { slot: SocketSlot, url: String },
    Send { slot: SocketSlot, pdu: Vec<u8> },
    Disconnect { slot: SocketSlot },
    Deinit,
}

enum Pending {
    AcceptorInit,
    Connect { slot: SocketSlot, url: String },
    Disconnect { slot: SocketSlot },
    Deinit,
}

/// Observable state of one scripted transport instance (one per socket
/// context the stack created).
pub(crate) struct TransportState {
    role: Mutex<Option<SocketCtxRole>>,
    sink: Mutex<Option<Arc<dyn SocketEventSink>>>,
    ops: Mutex<Vec<TransportOp>>,
    pending: Mutex<VecDeque<Pending>>,
}

impl TransportState {
    fn new() -> Self {
        TransportState {
            role: Mutex::new(None),
            sink: Mutex::new(None),
            ops: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Deliver a socket event as if from the network.
    pub fn fire_socket(&self, slot: SocketSlot, event: SocketEvent) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.socket_event(slot, event);
        }
    }

    /// Deliver a context event as if from the network.
    pub fn fire_ctx(&self, event: CtxEvent) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.ctx_event(event);
        }
    }

    pub fn role(&self) -> Option<SocketCtxRole> {
        *self.role.lock().unwrap()
    }

    pub fn ops(&self) -> Vec<TransportOp> {
        self.ops.lock().unwrap().clone()
    }

    /// URLs passed to `connect`, in call order.
    pub fn connect_urls(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                TransportOp::Connect { url, .. } => Some(url),
                _ => None,
            })
            .collect()
    }

    /// PDUs passed to `send_pdu` for one slot, in call order.
    pub fn sent_pdus(&self, slot: SocketSlot) -> Vec<Vec<u8>> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                TransportOp::Send { slot: s, pdu } if s == slot => Some(pdu),
                _ => None,
            })
            .collect()
    }

    fn record(&self, op: TransportOp) {
        self.ops.lock().unwrap().push(op);
    }

    fn queue(&self, pending: Pending) {
        self.pending.lock().unwrap().push_back(pending);
    }

    fn next_pending(&self) -> Option<Pending> {
        self.pending.lock().unwrap().pop_front()
    }
}

struct FactoryShared {
    transports: Mutex<Vec<Arc<TransportState>>>,
    refused_urls: Mutex<HashSet<String>>,
    fail_connect_calls: AtomicBool,
    stopped: AtomicBool,
}

/// Factory handing out scripted transports and, in `accepting` mode,
/// running a pump thread that answers connect and deinit requests.
pub(crate) struct ScriptedTransportFactory {
    shared: Arc<FactoryShared>,
}

impl ScriptedTransportFactory {
    /// All connects succeed (unless a URL is refused), all deinits
    /// complete, acceptor listeners come up — driven by a pump thread.
    pub fn accepting() -> Self {
        Self::with_mode(true)
    }

    /// Nothing is answered automatically; tests fire every event.
    pub fn manual() -> Self {
        Self::with_mode(false)
    }

    fn with_mode(auto: bool) -> Self {
        let shared = Arc::new(FactoryShared {
            transports: Mutex::new(Vec::new()),
            refused_urls: Mutex::new(HashSet::new()),
            fail_connect_calls: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });
        if auto {
            let weak = Arc::downgrade(&shared);
            thread::spawn(move || pump_thread(weak));
        }
        ScriptedTransportFactory { shared }
    }

    /// Make connects to `url` fail with a disconnect event.
    pub fn refuse_url(&self, url: &str) {
        self.shared.refused_urls.lock().unwrap().insert(url.into());
    }

    /// Make connects to `url` succeed again.
    pub fn accept_url(&self, url: &str) {
        self.shared.refused_urls.lock().unwrap().remove(url);
    }

    /// Make `connect` calls return a synchronous fatal error.
    pub fn fail_connect_calls(&self, fail: bool) {
        self.shared.fail_connect_calls.store(fail, Ordering::SeqCst);
    }

    /// Transport instances in creation order.
    pub fn transports(&self) -> Vec<Arc<TransportState>> {
        self.shared.transports.lock().unwrap().clone()
    }

    /// The `index`-th transport the stack created.
    pub fn transport(&self, index: usize) -> Arc<TransportState> {
        self.transports()
            .get(index)
            .cloned()
            .expect("transport not created yet")
    }

    /// First transport created with the given role.
    pub fn transport_by_role(&self, role: SocketCtxRole) -> Option<Arc<TransportState>> {
        self.transports()
            .into_iter()
            .find(|transport| transport.role() == Some(role))
    }
}

impl Drop for ScriptedTransportFactory {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
    }
}

impl SocketTransportFactory for ScriptedTransportFactory {
    fn create(&self, _role: SocketCtxRole) -> Box<dyn SocketTransport> {
        let state = Arc::new(TransportState::new());
        self.shared.transports.lock().unwrap().push(state.clone());
        Box::new(ScriptedTransport {
            state,
            factory: Arc::downgrade(&self.shared),
        })
    }
}

struct ScriptedTransport {
    state: Arc<TransportState>,
    factory: Weak<FactoryShared>,
}

impl SocketTransport for ScriptedTransport {
    fn init(
        &mut self,
        _cfg: &ContextConfig,
        role: SocketCtxRole,
        _slot_count: usize,
        sink: Arc<dyn SocketEventSink>,
    ) -> Result<()> {
        *self.state.role.lock().unwrap() = Some(role);
        *self.state.sink.lock().unwrap() = Some(sink);
        if role == SocketCtxRole::Acceptor {
            self.state.queue(Pending::AcceptorInit);
        }
        Ok(())
    }

    fn connect(&mut self, slot: SocketSlot, url: &str) -> Result<()> {
        if let Some(factory) = self.factory.upgrade() {
            if factory.fail_connect_calls.load(Ordering::SeqCst) {
                return Err(ScError::Transport("scripted connect failure".into()));
            }
        }
        self.state.record(TransportOp::Connect {
            slot,
            url: url.into(),
        });
        self.state.queue(Pending::Connect {
            slot,
            url: url.into(),
        });
        Ok(())
    }

    fn send_pdu(&mut self, slot: SocketSlot, pdu: &[u8]) -> Result<()> {
        self.state.record(TransportOp::Send {
            slot,
            pdu: pdu.to_vec(),
        });
        Ok(())
    }

    fn disconnect(&mut self, slot: SocketSlot) {
        self.state.record(TransportOp::Disconnect { slot });
        self.state.queue(Pending::Disconnect { slot });
    }

    fn deinit(&mut self) {
        self.state.record(TransportOp::Deinit);
        self.state.queue(Pending::Deinit);
    }
}

fn pump_thread(weak: Weak<FactoryShared>) {
    loop {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        let transports = shared.transports.lock().unwrap().clone();
        for transport in transports {
            while let Some(pending) = transport.next_pending() {
                match pending {
                    Pending::AcceptorInit => transport.fire_ctx(CtxEvent::Initialized),
                    Pending::Connect { slot, url } => {
                        let refused = shared.refused_urls.lock().unwrap().contains(&url);
                        if refused {
                            transport.fire_socket(
                                slot,
                                SocketEvent::Disconnected {
                                    error: Some(ScError::Transport(
                                        "connection refused".into(),
                                    )),
                                },
                            );
                        } else {
                            transport.fire_socket(
                                slot,
                                SocketEvent::Connected {
                                    peer_vmac: None,
                                    peer_uuid: None,
                                },
                            );
                        }
                    }
                    Pending::Disconnect { slot } => {
                        transport.fire_socket(slot, SocketEvent::Disconnected { error: None });
                    }
                    Pending::Deinit => transport.fire_ctx(CtxEvent::Deinitialized),
                }
            }
        }
        drop(shared);
        thread::sleep(Duration::from_millis(2));
    }
}

/// Sink that just records what it is handed.
pub(crate) struct RecordingSink {
    pub socket_events: Mutex<Vec<(SocketSlot, SocketEvent)>>,
    pub ctx_events: Mutex<Vec<CtxEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        RecordingSink {
            socket_events: Mutex::new(Vec::new()),
            ctx_events: Mutex::new(Vec::new()),
        }
    }
}

impl SocketEventSink for RecordingSink {
    fn socket_event(&self, slot: SocketSlot, event: SocketEvent) {
        self.socket_events.lock().unwrap().push((slot, event));
    }

    fn ctx_event(&self, event: CtxEvent) {
        self.ctx_events.lock().unwrap().push(event);
    }
}
