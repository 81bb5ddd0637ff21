//! In-process transport for tests.
//!
//! A [`MemoryHub`] wires any number of nodes together by name. Frames cross
//! synchronously into the receiver's inbound sink, which makes multi-node
//! scenarios (query forwarding, fragmentation, DHT replication) runnable in
//! a single test process with no sockets.
//!
//! The MTU is configurable so fragmentation paths can be exercised with
//! small messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use umbra_crypto::identity::KeyPair;
use umbra_proto::hello::Hello;

use crate::{
    Inbound, InboundSink, Result, Transport, TransportError, TransportLink, PROTO_MEMORY,
};

static LINK_IDS: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct HubState {
    /// Inbound sinks by node name.
    sinks: HashMap<String, InboundSink>,
}

/// The shared switchboard connecting [`MemoryTransport`] instances.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport endpoint named `name` with the given MTU.
    pub fn endpoint(&self, name: &str, mtu: u32) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            name: name.to_string(),
            mtu,
        }
    }

    fn sink_for(&self, name: &str) -> Option<InboundSink> {
        self.lock().sinks.get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One node's attachment to a [`MemoryHub`].
pub struct MemoryTransport {
    hub: MemoryHub,
    name: String,
    mtu: u32,
}

impl MemoryTransport {
    /// The node name this endpoint answers to.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Transport for MemoryTransport {
    fn protocol(&self) -> u16 {
        PROTO_MEMORY
    }

    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn cost(&self) -> u32 {
        1
    }

    fn create_hello(&self, keys: &KeyPair, expiration: u64) -> Result<Hello> {
        Hello::create(
            keys,
            PROTO_MEMORY,
            self.mtu,
            expiration,
            self.name.as_bytes().to_vec(),
        )
        .map_err(|e| TransportError::InvalidAddress(e.to_string()))
    }

    fn verify_hello(&self, hello: &Hello) -> Result<()> {
        if hello.protocol != PROTO_MEMORY {
            return Err(TransportError::InvalidAddress(format!(
                "protocol {} is not the memory transport",
                hello.protocol
            )));
        }
        std::str::from_utf8(&hello.address)
            .map_err(|_| TransportError::InvalidAddress("address not UTF-8".to_string()))?;
        Ok(())
    }

    /// Open a link to the named endpoint.
    ///
    /// Both directions are built at once so the remote node can answer on
    /// the link its inbound frames arrive with. Our own server must be
    /// started first; a one-way node could never receive replies.
    fn connect(&self, hello: &Hello) -> Result<Arc<dyn TransportLink>> {
        self.verify_hello(hello)?;
        let target = String::from_utf8_lossy(&hello.address).into_owned();
        let remote_sink = self
            .hub
            .sink_for(&target)
            .ok_or_else(|| TransportError::Connection(format!("no endpoint named {target}")))?;
        let our_sink = self
            .hub
            .sink_for(&self.name)
            .ok_or(TransportError::ServerNotStarted)?;

        let forward = Arc::new(MemoryLink::new(remote_sink, target, self.mtu));
        let reverse = Arc::new(MemoryLink::new(our_sink, self.name.clone(), self.mtu));
        forward.set_peer_link(Arc::clone(&reverse) as Arc<dyn TransportLink>);
        reverse.set_peer_link(Arc::clone(&forward) as Arc<dyn TransportLink>);
        Ok(forward)
    }

    fn start_server(&self, sink: InboundSink) -> Result<()> {
        self.hub.lock().sinks.insert(self.name.clone(), sink);
        Ok(())
    }

    fn stop_server(&self) {
        self.hub.lock().sinks.remove(&self.name);
    }

    fn address_to_string(&self, hello: &Hello) -> String {
        String::from_utf8_lossy(&hello.address).into_owned()
    }
}

struct LinkState {
    /// Sink of the remote node; `None` after disconnect.
    sink: Option<InboundSink>,
    /// The link the remote node sees inbound frames on. Strong reference;
    /// broken by `disconnect` to avoid keeping a dead pair alive.
    peer_link: Option<Arc<dyn TransportLink>>,
}

struct MemoryLink {
    id: u64,
    remote: String,
    mtu: u32,
    state: Mutex<LinkState>,
}

impl MemoryLink {
    fn new(sink: InboundSink, remote: String, mtu: u32) -> Self {
        Self {
            id: LINK_IDS.fetch_add(1, Ordering::Relaxed),
            remote,
            mtu,
            state: Mutex::new(LinkState {
                sink: Some(sink),
                peer_link: None,
            }),
        }
    }

    fn set_peer_link(&self, link: Arc<dyn TransportLink>) {
        self.lock().peer_link = Some(link);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TransportLink for MemoryLink {
    fn link_id(&self) -> u64 {
        self.id
    }

    fn protocol(&self) -> u16 {
        PROTO_MEMORY
    }

    fn send(&self, frame: &[u8], _reliable: bool) -> Result<()> {
        if self.mtu != 0 && frame.len() > self.mtu as usize {
            return Err(TransportError::FrameTooLarge { size: frame.len() });
        }
        let (sink, peer_link) = {
            let state = self.lock();
            match (&state.sink, &state.peer_link) {
                (Some(s), Some(l)) => (s.clone(), Arc::clone(l)),
                _ => return Err(TransportError::LinkClosed),
            }
        };
        sink.send(Inbound {
            link: peer_link,
            frame: frame.to_vec(),
        })
        .map_err(|_| TransportError::LinkClosed)
    }

    fn disconnect(&self) {
        let mut state = self.lock();
        state.sink = None;
        state.peer_link = None;
    }

    fn describe(&self) -> String {
        format!("mem:{}", self.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn hello_for(hub: &MemoryHub, name: &str) -> Hello {
        let keys = KeyPair::generate();
        hub.endpoint(name, 1400)
            .create_hello(&keys, u64::MAX)
            .expect("hello")
    }

    #[test]
    fn test_connect_and_send() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a", 1400);
        let b = hub.endpoint("b", 1400);

        let (tx_a, _rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();
        a.start_server(tx_a).expect("serve a");
        b.start_server(tx_b).expect("serve b");

        let link = a.connect(&hello_for(&hub, "b")).expect("connect");
        link.send(b"frame one", false).expect("send");

        let inbound = rx_b.recv().expect("recv");
        assert_eq!(inbound.frame, b"frame one");
    }

    #[test]
    fn test_reply_path() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a", 1400);
        let b = hub.endpoint("b", 1400);

        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();
        a.start_server(tx_a).expect("serve a");
        b.start_server(tx_b).expect("serve b");

        let link = a.connect(&hello_for(&hub, "b")).expect("connect");
        link.send(b"ping", false).expect("send");

        let inbound = rx_b.recv().expect("recv");
        inbound.link.send(b"pong", false).expect("reply");
        assert_eq!(rx_a.recv().expect("recv").frame, b"pong");
    }

    #[test]
    fn test_mtu_enforced() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a", 16);
        let b = hub.endpoint("b", 16);
        let (tx_a, _rx_a) = mpsc::channel();
        let (tx_b, _rx_b) = mpsc::channel();
        a.start_server(tx_a).expect("serve");
        b.start_server(tx_b).expect("serve");

        let link = a.connect(&hello_for(&hub, "b")).expect("connect");
        assert!(matches!(
            link.send(&[0u8; 17], false),
            Err(TransportError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_disconnect_closes_link() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a", 1400);
        let b = hub.endpoint("b", 1400);
        let (tx_a, _rx_a) = mpsc::channel();
        let (tx_b, _rx_b) = mpsc::channel();
        a.start_server(tx_a).expect("serve");
        b.start_server(tx_b).expect("serve");

        let link = a.connect(&hello_for(&hub, "b")).expect("connect");
        link.disconnect();
        assert!(matches!(
            link.send(b"late", false),
            Err(TransportError::LinkClosed)
        ));
    }

    #[test]
    fn test_connect_unknown_endpoint() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a", 1400);
        let (tx_a, _rx_a) = mpsc::channel();
        a.start_server(tx_a).expect("serve");
        assert!(a.connect(&hello_for(&hub, "nowhere")).is_err());
    }

    #[test]
    fn test_connect_requires_own_server() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a", 1400);
        let b = hub.endpoint("b", 1400);
        let (tx_b, _rx_b) = mpsc::channel();
        b.start_server(tx_b).expect("serve");
        assert!(matches!(
            a.connect(&hello_for(&hub, "b")),
            Err(TransportError::ServerNotStarted)
        ));
    }
}
