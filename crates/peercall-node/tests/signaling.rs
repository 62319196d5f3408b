//! Two or three nodes talking over loopback TCP.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time::timeout;

use peercall_crypto::IdentityKeyPair;
use peercall_node::address::{Candidate, Neighbor};
use peercall_node::media::{MediaConnection, MediaEngine, MediaError, MediaEvent, PassthroughMedia};
use peercall_node::network::{BoxStream, Network, SystemNetwork};
use peercall_node::presence;
use peercall_node::store::EventKind;
use peercall_node::{
    acceptor, channel, CallSession, CallState, Contact, ContactState, NodeConfig, NodeEvent,
    NodeState, Notifier, Settings, StoreOwner,
};
use peercall_protocol::SignalMessage;

const WAIT: Duration = Duration::from_secs(10);

struct TestNode {
    node: Arc<NodeState>,
    port: u16,
    shutdown: watch::Sender<bool>,
    _dir: TempDir,
}

impl TestNode {
    async fn spawn(name: &str, peer_port: u16, configure: impl FnOnce(&mut Settings)) -> Self {
        Self::spawn_with(
            name,
            peer_port,
            configure,
            Arc::new(SystemNetwork),
            Arc::new(PassthroughMedia),
        )
        .await
    }

    async fn spawn_with(
        name: &str,
        peer_port: u16,
        configure: impl FnOnce(&mut Settings),
        network: Arc<dyn Network>,
        media: Arc<dyn MediaEngine>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::generate(name);
        configure(&mut settings);
        let store = StoreOwner::create_with_iterations(
            dir.path().join(format!("{name}.db")),
            "",
            settings,
            Notifier::default(),
            1_000,
        )
        .await
        .unwrap();

        let listener = acceptor::bind("127.0.0.1", 0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = NodeConfig {
            host: "127.0.0.1".into(),
            port,
            peer_port,
            store_path: dir.path().join(format!("{name}.db")),
            probe_read_timeout_ms: 2000,
            call_read_timeout_secs: 5,
            ring_timeout_secs: 5,
        };
        let node = NodeState::new(config, store, network, media).await.unwrap();

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(acceptor::run_acceptor(listener, node.clone(), shutdown_rx));
        Self {
            node,
            port,
            shutdown,
            _dir: dir,
        }
    }

    fn card(&self, name: &str) -> Contact {
        Contact::new(
            name,
            *self.node.identity.public(),
            vec![Candidate::parse("127.0.0.1").unwrap()],
        )
    }

    async fn knows(&self, other: &TestNode, name: &str) {
        assert!(self.node.store.add_contact(other.card(name)).await.unwrap());
    }

    async fn event_kinds(&self, count: usize) -> Vec<EventKind> {
        timeout(WAIT, async {
            loop {
                let events = self.node.store.events().await;
                if events.len() >= count {
                    return events.into_iter().map(|e| e.kind).collect();
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("call log not written")
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Connecting to anything blows up inside the task doing it.
struct ExplodingNetwork;

#[async_trait]
impl Network for ExplodingNetwork {
    async fn connect(&self, addr: SocketAddr, _timeout: Duration) -> io::Result<BoxStream> {
        panic!("connect to {addr} exploded");
    }

    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        SystemNetwork.resolve(host, port).await
    }

    fn interface_index(&self, name: &str) -> Option<u32> {
        SystemNetwork.interface_index(name)
    }

    fn interface_name(&self, index: u32) -> Option<String> {
        SystemNetwork.interface_name(index)
    }

    fn interfaces(&self) -> Vec<String> {
        Vec::new()
    }

    async fn neighbors(&self) -> Vec<Neighbor> {
        Vec::new()
    }
}

/// Media engine whose `open` waits until the test lets it through, and
/// which counts how often its connections get closed.
#[derive(Default)]
struct GatedMedia {
    entered: Notify,
    gate: Notify,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl MediaEngine for GatedMedia {
    async fn open(
        &self,
        ice_servers: &[String],
    ) -> Result<(Box<dyn MediaConnection>, mpsc::Receiver<MediaEvent>), MediaError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.gate.notified().await;
        let (inner, events) = PassthroughMedia.open(ice_servers).await?;
        let conn = CountingConnection {
            inner,
            closed: self.closed.clone(),
        };
        Ok((Box::new(conn), events))
    }
}

struct CountingConnection {
    inner: Box<dyn MediaConnection>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl MediaConnection for CountingConnection {
    async fn create_offer(&mut self) -> Result<String, MediaError> {
        self.inner.create_offer().await
    }

    async fn create_answer(&mut self, offer: &str) -> Result<String, MediaError> {
        self.inner.create_answer(offer).await
    }

    async fn apply_answer(&mut self, answer: &str) -> Result<(), MediaError> {
        self.inner.apply_answer(answer).await
    }

    async fn set_camera_enabled(&mut self, enabled: bool) -> Result<(), MediaError> {
        self.inner.set_camera_enabled(enabled).await
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<(), MediaError> {
        self.inner.send_data(data).await
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await;
    }
}

async fn next_incoming(events: &mut broadcast::Receiver<NodeEvent>) -> Arc<CallSession> {
    timeout(WAIT, async {
        loop {
            if let Ok(NodeEvent::IncomingCall(call)) = events.recv().await {
                return call;
            }
        }
    })
    .await
    .expect("no incoming call")
}

async fn reach(call: &CallSession, state: CallState) {
    let reached = timeout(WAIT, call.wait_for(|s| s == state || s.is_terminal()))
        .await
        .expect("call stalled");
    assert_eq!(reached, state);
}

fn drain(events: &mut broadcast::Receiver<NodeEvent>) -> Vec<NodeEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn presence_check_marks_contacts() {
    let bob = TestNode::spawn("bob", 0, |_| {}).await;
    let alice = TestNode::spawn("alice", bob.port, |_| {}).await;
    alice.knows(&bob, "bob").await;
    bob.knows(&alice, "alice").await;
    let nowhere = Contact::new("nowhere", *IdentityKeyPair::generate().public(), Vec::new());
    alice.node.store.add_contact(nowhere.clone()).await.unwrap();

    let results = presence::probe_all(&alice.node).await;
    assert_eq!(results.len(), 2);

    let bob_key = *bob.node.identity.public();
    let stored = alice.node.store.contact(&bob_key).await.unwrap();
    assert_eq!(stored.state, ContactState::Online);
    assert_eq!(
        stored.last_working_address,
        Some(Candidate::parse("127.0.0.1").unwrap())
    );
    let stored = alice.node.store.contact(nowhere.public_key()).await.unwrap();
    assert_eq!(stored.state, ContactState::NoAddresses);

    for contact in alice.node.store.contacts().await {
        assert!(!contact.state.is_pending());
    }

    // bob saw a ping from a known contact
    let alice_key = *alice.node.identity.public();
    let seen = timeout(WAIT, async {
        loop {
            let contact = bob.node.store.contact(&alice_key).await.unwrap();
            if contact.state == ContactState::Online {
                return contact;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert!(seen.last_working_address.is_some());
}

#[tokio::test]
async fn accepted_call_then_concurrent_hangup() {
    let bob = TestNode::spawn("bob", 0, |_| {}).await;
    let alice = TestNode::spawn("alice", bob.port, |_| {}).await;
    alice.knows(&bob, "bob").await;
    bob.knows(&alice, "alice").await;

    let mut bob_events = bob.node.notifier.subscribe();
    let mut alice_events = alice.node.notifier.subscribe();

    let call = alice
        .node
        .start_call(bob.node.identity.public())
        .await
        .unwrap();
    let incoming = next_incoming(&mut bob_events).await;
    assert_eq!(incoming.contact().name, "alice");
    assert!(incoming.remote_description().unwrap().starts_with("v=0"));
    assert!(incoming.accept());
    assert!(!incoming.accept());

    reach(&call, CallState::Connected).await;
    reach(&incoming, CallState::Connected).await;
    assert!(call.remote_description().is_some());

    tokio::join!(call.hangup(), call.hangup());
    assert_eq!(call.state(), CallState::Ended);
    assert!(alice.node.current_call().is_none());

    let ended = drain(&mut alice_events)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                NodeEvent::CallStateChanged {
                    state: CallState::Ended,
                    ..
                }
            )
        })
        .count();
    assert_eq!(ended, 1);
    assert_eq!(alice.event_kinds(1).await, vec![EventKind::OutgoingAccepted]);

    assert_eq!(
        timeout(WAIT, incoming.wait_terminal()).await.unwrap(),
        CallState::Ended
    );
    assert_eq!(bob.event_kinds(1).await, vec![EventKind::IncomingAccepted]);
    assert_eq!(alice.event_kinds(1).await.len(), 1);
}

#[tokio::test]
async fn declined_call_is_dismissed() {
    let bob = TestNode::spawn("bob", 0, |_| {}).await;
    let alice = TestNode::spawn("alice", bob.port, |_| {}).await;
    alice.knows(&bob, "bob").await;
    bob.knows(&alice, "alice").await;
    let mut bob_events = bob.node.notifier.subscribe();

    let call = alice
        .node
        .start_call(bob.node.identity.public())
        .await
        .unwrap();
    let incoming = next_incoming(&mut bob_events).await;
    reach(&call, CallState::Ringing).await;
    assert!(incoming.decline());

    reach(&call, CallState::Dismissed).await;
    assert_eq!(incoming.wait_terminal().await, CallState::Dismissed);
    assert_eq!(alice.event_kinds(1).await, vec![EventKind::OutgoingDeclined]);
    assert_eq!(bob.event_kinds(1).await, vec![EventKind::IncomingDeclined]);
}

#[tokio::test]
async fn caller_giving_up_while_ringing_is_missed() {
    let bob = TestNode::spawn("bob", 0, |_| {}).await;
    let alice = TestNode::spawn("alice", bob.port, |_| {}).await;
    alice.knows(&bob, "bob").await;
    bob.knows(&alice, "alice").await;
    let mut bob_events = bob.node.notifier.subscribe();

    let call = alice
        .node
        .start_call(bob.node.identity.public())
        .await
        .unwrap();
    let incoming = next_incoming(&mut bob_events).await;
    reach(&call, CallState::Ringing).await;
    call.hangup().await;

    assert_eq!(
        timeout(WAIT, incoming.wait_terminal()).await.unwrap(),
        CallState::Dismissed
    );
    assert_eq!(alice.event_kinds(1).await, vec![EventKind::OutgoingMissed]);
    assert_eq!(bob.event_kinds(1).await, vec![EventKind::IncomingMissed]);
}

#[tokio::test]
async fn unknown_caller_refused_when_blocking_unknown() {
    let bob = TestNode::spawn("bob", 0, |s| s.block_unknown = true).await;
    let alice = TestNode::spawn("alice", bob.port, |_| {}).await;
    alice.knows(&bob, "bob").await;
    let mut bob_events = bob.node.notifier.subscribe();

    let call = alice
        .node
        .start_call(bob.node.identity.public())
        .await
        .unwrap();
    let end = timeout(WAIT, call.wait_terminal()).await.unwrap();
    assert_eq!(end, CallState::ErrorNoConnection);
    assert!(bob.node.current_call().is_none());

    let alice_key = *alice.node.identity.public();
    let seen = drain(&mut bob_events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, NodeEvent::CallRejected { peer } if *peer == alice_key)));
    assert!(!seen.iter().any(|e| matches!(e, NodeEvent::IncomingCall(_))));
    assert!(bob.node.store.events().await.is_empty());
}

#[tokio::test]
async fn unknown_caller_rings_as_transient_contact() {
    let bob = TestNode::spawn("bob", 0, |_| {}).await;
    let alice = TestNode::spawn("alice", bob.port, |_| {}).await;
    alice.knows(&bob, "bob").await;
    let mut bob_events = bob.node.notifier.subscribe();

    let call = alice
        .node
        .start_call(bob.node.identity.public())
        .await
        .unwrap();
    let incoming = next_incoming(&mut bob_events).await;
    assert_eq!(incoming.contact().name, acceptor::UNKNOWN_CALLER);
    assert_eq!(
        incoming.contact().addresses(),
        &[Candidate::parse("127.0.0.1").unwrap()]
    );
    assert!(bob.node.store.contacts().await.is_empty());

    incoming.decline();
    reach(&call, CallState::Dismissed).await;
}

#[tokio::test]
async fn second_caller_gets_busy_dismissal() {
    let bob = TestNode::spawn("bob", 0, |_| {}).await;
    let alice = TestNode::spawn("alice", bob.port, |_| {}).await;
    let carol = TestNode::spawn("carol", bob.port, |_| {}).await;
    alice.knows(&bob, "bob").await;
    carol.knows(&bob, "bob").await;
    let mut bob_events = bob.node.notifier.subscribe();

    let first = alice
        .node
        .start_call(bob.node.identity.public())
        .await
        .unwrap();
    let incoming = next_incoming(&mut bob_events).await;
    incoming.accept();
    reach(&first, CallState::Connected).await;

    let second = carol
        .node
        .start_call(bob.node.identity.public())
        .await
        .unwrap();
    assert_eq!(
        timeout(WAIT, second.wait_terminal()).await.unwrap(),
        CallState::Dismissed
    );
    assert_eq!(bob.event_kinds(1).await, vec![EventKind::IncomingMissed]);
    assert_eq!(first.state(), CallState::Connected);

    first.hangup().await;
}

#[tokio::test]
async fn impostor_answer_is_authentication_error() {
    let alice = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let alice = TestNode::spawn("alice", port, |_| {}).await;
        let alice_key = *alice.node.identity.public();

        tokio::spawn(async move {
            let mallory = Arc::new(IdentityKeyPair::generate());
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = channel::split(Box::new(stream), mallory);
            // The call was sealed for bob, so mallory cannot read it.
            assert!(reader.recv_any().await.is_err());
            writer.send(&alice_key, &SignalMessage::Ringing).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        alice
    };
    let bob = IdentityKeyPair::generate();
    alice
        .node
        .store
        .add_contact(Contact::new(
            "bob",
            *bob.public(),
            vec![Candidate::parse("127.0.0.1").unwrap()],
        ))
        .await
        .unwrap();

    let call = alice.node.start_call(bob.public()).await.unwrap();
    assert_eq!(
        timeout(WAIT, call.wait_terminal()).await.unwrap(),
        CallState::ErrorAuthentication
    );
    assert_eq!(alice.event_kinds(1).await, vec![EventKind::OutgoingError]);
}

#[tokio::test]
async fn shutdown_announcement_marks_offline() {
    let bob = TestNode::spawn("bob", 0, |_| {}).await;
    let alice = TestNode::spawn("alice", bob.port, |_| {}).await;
    alice.knows(&bob, "bob").await;
    bob.knows(&alice, "alice").await;

    alice.node.announce_offline().await;

    let alice_key = *alice.node.identity.public();
    timeout(WAIT, async {
        while bob.node.store.contact(&alice_key).await.unwrap().state != ContactState::Offline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("bob never saw alice go offline");
}

#[tokio::test]
async fn prompted_call_disarms_on_hangup() {
    let bob = TestNode::spawn("bob", 0, |_| {}).await;
    let alice = TestNode::spawn("alice", bob.port, |s| s.prompt_outgoing_calls = true).await;
    alice.knows(&bob, "bob").await;

    let call = alice
        .node
        .start_call(bob.node.identity.public())
        .await
        .unwrap();
    assert_eq!(call.state(), CallState::Waiting);
    assert!(alice.node.current_call().is_some());

    call.hangup().await;
    assert_eq!(call.state(), CallState::Waiting);
    assert!(!call.start());
    assert!(alice.node.current_call().is_none());
    assert!(alice.node.store.events().await.is_empty());
}

#[tokio::test]
async fn crashed_presence_check_still_settles_every_contact() {
    let alice = TestNode::spawn_with(
        "alice",
        1,
        |_| {},
        Arc::new(ExplodingNetwork),
        Arc::new(PassthroughMedia),
    )
    .await;
    let loopback = vec![Candidate::parse("127.0.0.1").unwrap()];
    for name in ["bob", "carol"] {
        let key = *IdentityKeyPair::generate().public();
        let contact = Contact::new(name, key, loopback.clone());
        assert!(alice.node.store.add_contact(contact).await.unwrap());
    }
    let dave = Contact::new("dave", *IdentityKeyPair::generate().public(), Vec::new());
    assert!(alice.node.store.add_contact(dave).await.unwrap());
    let mut events = alice.node.notifier.subscribe();

    let results = presence::probe_all(&alice.node).await;
    assert_eq!(results.len(), 3);
    for contact in alice.node.store.contacts().await {
        let expected = if contact.addresses().is_empty() {
            ContactState::NoAddresses
        } else {
            ContactState::CommunicationFailed
        };
        assert_eq!(contact.state, expected, "{}", contact.name);
    }

    let refreshes = drain(&mut events)
        .iter()
        .filter(|e| matches!(e, NodeEvent::ContactsRefreshed))
        .count();
    assert_eq!(refreshes, 2);
}

#[tokio::test]
async fn hangup_while_media_opens_still_closes_media() {
    let bob = TestNode::spawn("bob", 0, |_| {}).await;
    let media = Arc::new(GatedMedia::default());
    let alice = TestNode::spawn_with(
        "alice",
        bob.port,
        |_| {},
        Arc::new(SystemNetwork),
        media.clone(),
    )
    .await;
    alice.knows(&bob, "bob").await;

    let call = alice
        .node
        .start_call(bob.node.identity.public())
        .await
        .unwrap();
    timeout(WAIT, media.entered.notified())
        .await
        .expect("media never opened");

    let hangup = tokio::spawn({
        let call = call.clone();
        async move { call.hangup().await }
    });
    reach(&call, CallState::Ended).await;
    media.gate.notify_one();
    timeout(WAIT, hangup).await.unwrap().unwrap();

    assert_eq!(call.state(), CallState::Ended);
    assert_eq!(media.opened.load(Ordering::SeqCst), 1);
    assert_eq!(media.closed.load(Ordering::SeqCst), 1);
    assert!(alice.node.current_call().is_none());
    assert_eq!(alice.event_kinds(1).await, vec![EventKind::OutgoingMissed]);
}

#[tokio::test]
async fn unanswered_call_rings_out() {
    let bob = TestNode::spawn("bob", 0, |_| {}).await;
    let alice = TestNode::spawn("alice", bob.port, |_| {}).await;
    alice.knows(&bob, "bob").await;
    bob.knows(&alice, "alice").await;
    let mut bob_events = bob.node.notifier.subscribe();

    let call = alice
        .node
        .start_call(bob.node.identity.public())
        .await
        .unwrap();
    let incoming = next_incoming(&mut bob_events).await;

    assert_eq!(
        timeout(WAIT, incoming.wait_terminal()).await.unwrap(),
        CallState::Dismissed
    );
    reach(&call, CallState::Dismissed).await;
    assert!(!incoming.accept());
    assert_eq!(bob.event_kinds(1).await, vec![EventKind::IncomingMissed]);
    assert_eq!(alice.event_kinds(1).await, vec![EventKind::OutgoingDeclined]);
}
