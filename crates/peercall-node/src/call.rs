//! Call sessions: the signaling state machine for one call.
//!
//! A session owns one signaling stream and one media connection. Its state
//! only moves forward (waiting, connecting, ringing, connected, then a
//! terminal state) and terminal states are final. Whoever reaches a
//! terminal state first wins; later attempts are no-ops. Cleanup runs once
//! no matter how many parties (the session task, a hangup, a media
//! disconnect) ask for it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use peercall_protocol::codec::{decode_control, encode_control};
use peercall_protocol::types::StreamState;
use peercall_protocol::{ControlMessage, SignalMessage};

use crate::address::Candidate;
use crate::channel::{self, ChannelError, SignalReader, SignalWriter};
use crate::connector::ConnectFailure;
use crate::media::{MediaConnection, MediaError, MediaEvent};
use crate::notify::NodeEvent;
use crate::state::NodeState;
use crate::store::{Contact, Event, EventKind};

/// How long a hangup waits to deliver its `dismissed`.
const HANGUP_SEND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Waiting,
    Connecting,
    Ringing,
    Connected,
    Dismissed,
    Ended,
    ErrorNoConnection,
    ErrorAuthentication,
    ErrorCryptography,
    ErrorConnectPort,
    ErrorNoAddresses,
    ErrorUnknownHost,
    ErrorOther,
}

impl CallState {
    fn phase(self) -> u8 {
        match self {
            CallState::Waiting => 0,
            CallState::Connecting => 1,
            CallState::Ringing => 2,
            CallState::Connected => 3,
            _ => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.phase() == 4
    }

    pub fn is_error(self) -> bool {
        self.is_terminal() && !matches!(self, CallState::Dismissed | CallState::Ended)
    }

    /// Forward-only by phase. A waiting call can only start connecting.
    pub fn can_transition_to(self, next: CallState) -> bool {
        if self == CallState::Waiting {
            return next == CallState::Connecting;
        }
        !self.is_terminal() && next.phase() > self.phase()
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Waiting => "waiting",
            CallState::Connecting => "connecting",
            CallState::Ringing => "ringing",
            CallState::Connected => "connected",
            CallState::Dismissed => "dismissed",
            CallState::Ended => "ended",
            CallState::ErrorNoConnection => "error: no connection",
            CallState::ErrorAuthentication => "error: authentication failed",
            CallState::ErrorCryptography => "error: cryptography",
            CallState::ErrorConnectPort => "error: app not running",
            CallState::ErrorNoAddresses => "error: no addresses",
            CallState::ErrorUnknownHost => "error: unknown host",
            CallState::ErrorOther => "error",
        };
        f.write_str(name)
    }
}

impl From<ConnectFailure> for CallState {
    fn from(failure: ConnectFailure) -> Self {
        match failure {
            ConnectFailure::NoAddresses => CallState::ErrorNoAddresses,
            ConnectFailure::UnknownHost => CallState::ErrorUnknownHost,
            ConnectFailure::AppNotRunning => CallState::ErrorConnectPort,
            ConnectFailure::NetworkUnreachable => CallState::ErrorNoConnection,
        }
    }
}

/// Terminal state for a signaling failure. Losing the stream is a normal
/// end once the call is up and an error before that.
fn failure_state(err: &ChannelError, connected: bool) -> CallState {
    match err {
        ChannelError::Closed | ChannelError::Transport(_) if connected => CallState::Ended,
        ChannelError::Closed | ChannelError::Transport(_) | ChannelError::Timeout => {
            CallState::ErrorNoConnection
        }
        ChannelError::Crypto(_) => CallState::ErrorCryptography,
        ChannelError::Impostor(_) => CallState::ErrorAuthentication,
        ChannelError::Malformed(_) => CallState::ErrorOther,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Accept,
    Decline,
}

#[derive(Default)]
struct Descriptions {
    local: Option<String>,
    remote: Option<String>,
}

/// Recovers the guard from a poisoned lock.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct CallSession {
    node: Arc<NodeState>,
    direction: Direction,
    contact: Contact,
    state: watch::Sender<CallState>,
    closing: watch::Sender<bool>,
    armed: AtomicBool,
    reached_connected: AtomicBool,
    declined: AtomicBool,
    cleaned: AtomicBool,
    writer: tokio::sync::Mutex<Option<SignalWriter>>,
    media: tokio::sync::Mutex<Option<Box<dyn MediaConnection>>>,
    decision: Mutex<Option<oneshot::Sender<Decision>>>,
    decision_rx: Mutex<Option<oneshot::Receiver<Decision>>>,
    descriptions: Mutex<Descriptions>,
    address: Mutex<Option<Candidate>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("direction", &self.direction)
            .field("peer", self.contact.public_key())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CallSession {
    fn new(node: Arc<NodeState>, direction: Direction, contact: Contact) -> Self {
        let (decision_tx, decision_rx) = oneshot::channel();
        Self {
            node,
            direction,
            contact,
            state: watch::Sender::new(CallState::Waiting),
            closing: watch::Sender::new(false),
            armed: AtomicBool::new(true),
            reached_connected: AtomicBool::new(false),
            declined: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            writer: tokio::sync::Mutex::new(None),
            media: tokio::sync::Mutex::new(None),
            decision: Mutex::new(Some(decision_tx)),
            decision_rx: Mutex::new(Some(decision_rx)),
            descriptions: Mutex::new(Descriptions::default()),
            address: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// An armed outgoing call. Nothing happens on the network until
    /// [`CallSession::start`].
    pub(crate) fn outgoing(node: Arc<NodeState>, contact: Contact) -> Arc<Self> {
        Arc::new(Self::new(node, Direction::Outgoing, contact))
    }

    /// A call whose `call` message was already read and authenticated by
    /// the acceptor. Ringing starts with [`CallSession::spawn_incoming`].
    pub(crate) fn incoming(
        node: Arc<NodeState>,
        contact: Contact,
        writer: SignalWriter,
        offer: String,
        address: Option<Candidate>,
    ) -> Arc<Self> {
        let mut session = Self::new(node, Direction::Incoming, contact);
        lock(&session.descriptions).remote = Some(offer);
        *lock(&session.address) = address;
        *session.writer.get_mut() = Some(writer);
        Arc::new(session)
    }

    pub(crate) fn spawn_incoming(self: &Arc<Self>, reader: SignalReader) {
        let task = tokio::spawn(self.clone().drive_incoming(reader));
        *lock(&self.task) = Some(task);
    }

    /// Turn away an incoming call because another one is in progress.
    pub(crate) async fn reject_busy(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(contact = %self.contact.name, "busy, dismissing incoming call");
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer
                .send(self.contact.public_key(), &SignalMessage::Dismissed)
                .await
            {
                debug!(contact = %self.contact.name, "dismissed not delivered: {}", e);
            }
            writer.close().await;
        }
        let event = Event::new(
            *self.contact.public_key(),
            EventKind::IncomingMissed,
            lock(&self.address).clone(),
        );
        if let Err(e) = self.node.store.add_event(event).await {
            self.node.notifier.error("call log", e);
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn local_description(&self) -> Option<String> {
        lock(&self.descriptions).local.clone()
    }

    pub fn remote_description(&self) -> Option<String> {
        lock(&self.descriptions).remote.clone()
    }

    /// Wait until the state satisfies `pred` and return it.
    pub async fn wait_for(&self, mut pred: impl FnMut(CallState) -> bool) -> CallState {
        let mut rx = self.state.subscribe();
        let reached = match rx.wait_for(|s| pred(*s)).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        reached
    }

    pub async fn wait_terminal(&self) -> CallState {
        self.wait_for(CallState::is_terminal).await
    }

    fn transition(&self, next: CallState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if !state.can_transition_to(next) {
                return false;
            }
            if *state == CallState::Waiting && !self.armed.load(Ordering::Acquire) {
                return false;
            }
            if next == CallState::Connected {
                self.reached_connected.store(true, Ordering::Release);
            }
            *state = next;
            true
        });
        if changed {
            info!(peer = %self.contact.public_key().short(), contact = %self.contact.name, state = %next, "call state changed");
            self.node.notifier.notify(NodeEvent::CallStateChanged {
                peer: *self.contact.public_key(),
                state: next,
            });
        }
        changed
    }

    fn signal_close(&self) {
        self.closing.send_replace(true);
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Dial an armed outgoing call. Returns false if it was already started
    /// or hung up.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.direction != Direction::Outgoing
            || self.state() != CallState::Waiting
            || !self.armed.load(Ordering::Acquire)
        {
            return false;
        }
        let mut task = lock(&self.task);
        if task.is_some() {
            return false;
        }
        *task = Some(tokio::spawn(self.clone().drive_outgoing()));
        true
    }

    /// Answer a ringing incoming call.
    pub fn accept(&self) -> bool {
        self.decide(Decision::Accept)
    }

    /// Reject a ringing incoming call.
    pub fn decline(&self) -> bool {
        self.decide(Decision::Decline)
    }

    fn decide(&self, decision: Decision) -> bool {
        if self.direction != Direction::Incoming {
            return false;
        }
        match lock(&self.decision).take() {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    /// End the call from this side.
    ///
    /// An armed call that never started is simply disarmed. Otherwise a
    /// best-effort `dismissed` is sent, the stream closed and the session
    /// task joined. Safe to call concurrently and repeatedly.
    pub async fn hangup(&self) {
        let mut disarmed = false;
        self.state.send_if_modified(|state| {
            if *state == CallState::Waiting {
                self.armed.store(false, Ordering::Release);
                disarmed = true;
            }
            false
        });
        if disarmed {
            info!(contact = %self.contact.name, "call disarmed before dialing");
            if !self.cleaned.swap(true, Ordering::AcqRel) {
                self.node.release_call(self);
            }
            return;
        }

        if self.transition(CallState::Ended) {
            let mut writer = self.writer.lock().await;
            if let Some(w) = writer.as_mut() {
                let dismissed = w.send(self.contact.public_key(), &SignalMessage::Dismissed);
                match tokio::time::timeout(HANGUP_SEND_TIMEOUT, dismissed).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(contact = %self.contact.name, "dismissed not delivered: {}", e)
                    }
                    Err(_) => debug!(contact = %self.contact.name, "dismissed timed out"),
                }
                w.close().await;
            }
        }

        self.signal_close();
        self.cleanup().await;

        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(contact = %self.contact.name, "call task failed: {}", e);
            }
        }
    }

    /// Toggle the local camera and tell the peer over the data channel.
    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        let mut media = self.media.lock().await;
        let conn = media.as_mut().ok_or(MediaError::Closed)?;
        conn.set_camera_enabled(enabled).await?;
        let msg = encode_control(&ControlMessage::StateChange(StreamState::from_enabled(enabled)))
            .map_err(|e| MediaError::Engine(e.to_string()))?;
        conn.send_data(&msg).await
    }

    async fn drive_outgoing(self: Arc<Self>) {
        let end = self.run_outgoing().await;
        self.finish(end).await;
    }

    async fn drive_incoming(self: Arc<Self>, reader: SignalReader) {
        let end = self.run_incoming(reader).await;
        self.finish(end).await;
    }

    async fn finish(&self, end: CallState) {
        self.transition(end);
        self.cleanup().await;
        // A hangup may have cleaned up while the task was still installing
        // the stream or media.
        self.release().await;
    }

    async fn run_outgoing(self: &Arc<Self>) -> CallState {
        if !self.transition(CallState::Connecting) {
            return self.state();
        }

        let connector = self.node.connector().await;
        let connected = match connector.connect(&self.contact).await {
            Ok(connected) => connected,
            Err(failure) => {
                warn!(contact = %self.contact.name, "cannot reach contact: {}", failure);
                return failure.into();
            }
        };
        let address = connected.working_address(self.node.network.as_ref());
        *lock(&self.address) = Some(address.clone());

        let (mut reader, writer) = channel::split(connected.stream, self.node.identity.clone());
        *self.writer.lock().await = Some(writer);
        if self.is_closing() {
            return self.state();
        }

        if let Err(e) = self.open_media().await {
            warn!(contact = %self.contact.name, "media engine failed: {}", e);
            return CallState::ErrorOther;
        }
        if self.is_closing() {
            return self.state();
        }

        let offer = match self.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(contact = %self.contact.name, "media engine failed: {}", e);
                return CallState::ErrorOther;
            }
        };

        if let Err(e) = self.send(SignalMessage::Call { offer }).await {
            warn!(contact = %self.contact.name, "sending call failed: {}", e);
            return failure_state(&e, false);
        }

        match self
            .recv(&mut reader, Some(self.node.config.call_read_timeout()))
            .await
        {
            None => return self.state(),
            Some(Ok(SignalMessage::Ringing)) => {
                self.transition(CallState::Ringing);
                if let Err(e) = self
                    .node
                    .store
                    .update_last_working_address(self.contact.public_key(), address)
                    .await
                {
                    self.node.notifier.error("store", e);
                }
            }
            Some(Ok(SignalMessage::Dismissed)) => return CallState::Dismissed,
            Some(Ok(other)) => {
                warn!(contact = %self.contact.name, action = other.action(), "expected ringing");
                return CallState::ErrorOther;
            }
            Some(Err(e)) => return self.signal_failure(&e, false),
        }

        let ring_wait = self.node.config.ring_timeout() + self.node.config.call_read_timeout();
        match self.recv(&mut reader, Some(ring_wait)).await {
            None => return self.state(),
            Some(Ok(SignalMessage::Connected { answer })) => {
                lock(&self.descriptions).remote = Some(answer.clone());
                if let Err(e) = self.apply_answer(&answer).await {
                    warn!(contact = %self.contact.name, "cannot apply answer: {}", e);
                    return CallState::ErrorOther;
                }
                self.transition(CallState::Connected);
            }
            Some(Ok(SignalMessage::Dismissed)) => return CallState::Dismissed,
            Some(Ok(other)) => {
                warn!(contact = %self.contact.name, action = other.action(), "expected connected");
                return CallState::ErrorOther;
            }
            Some(Err(e)) => return self.signal_failure(&e, false),
        }

        self.connected_loop(&mut reader).await
    }

    async fn run_incoming(self: &Arc<Self>, mut reader: SignalReader) -> CallState {
        if !self.transition(CallState::Connecting) {
            return self.state();
        }

        if let Err(e) = self.open_media().await {
            warn!(contact = %self.contact.name, "media engine failed: {}", e);
            return CallState::ErrorOther;
        }
        if self.is_closing() {
            return self.state();
        }

        if let Err(e) = self.send(SignalMessage::Ringing).await {
            return self.signal_failure(&e, false);
        }
        self.transition(CallState::Ringing);
        self.node
            .notifier
            .notify(NodeEvent::IncomingCall(self.clone()));

        let decision_rx = lock(&self.decision_rx).take();
        let Some(decision_rx) = decision_rx else {
            return CallState::ErrorOther;
        };

        let decision = tokio::select! {
            decision = decision_rx => decision.unwrap_or(Decision::Decline),
            msg = self.recv(&mut reader, None) => {
                return match msg {
                    None => self.state(),
                    Some(Ok(SignalMessage::Dismissed)) => {
                        info!(contact = %self.contact.name, "caller gave up");
                        CallState::Dismissed
                    }
                    Some(Ok(other)) => {
                        warn!(contact = %self.contact.name, action = other.action(), "unexpected message while ringing");
                        CallState::ErrorOther
                    }
                    Some(Err(e)) => self.signal_failure(&e, false),
                };
            }
            _ = tokio::time::sleep(self.node.config.ring_timeout()) => {
                info!(contact = %self.contact.name, "call not answered");
                if let Err(e) = self.send(SignalMessage::Dismissed).await {
                    debug!(contact = %self.contact.name, "dismissed not delivered: {}", e);
                }
                return CallState::Dismissed;
            }
        };

        if decision == Decision::Decline {
            self.declined.store(true, Ordering::Release);
            if let Err(e) = self.send(SignalMessage::Dismissed).await {
                debug!(contact = %self.contact.name, "dismissed not delivered: {}", e);
            }
            return CallState::Dismissed;
        }

        let offer = self.remote_description().unwrap_or_default();
        let answer = match self.create_answer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(contact = %self.contact.name, "cannot answer offer: {}", e);
                if let Err(e) = self.send(SignalMessage::Dismissed).await {
                    debug!(contact = %self.contact.name, "dismissed not delivered: {}", e);
                }
                return CallState::ErrorOther;
            }
        };
        if let Err(e) = self.send(SignalMessage::Connected { answer }).await {
            return self.signal_failure(&e, false);
        }
        self.transition(CallState::Connected);

        self.connected_loop(&mut reader).await
    }

    /// Connected: the signaling stream stays open until either side says
    /// `dismissed` or it drops.
    async fn connected_loop(&self, reader: &mut SignalReader) -> CallState {
        match self.recv(reader, None).await {
            None => self.state(),
            Some(Ok(SignalMessage::Dismissed)) => {
                info!(contact = %self.contact.name, "peer hung up");
                CallState::Ended
            }
            Some(Ok(other)) => {
                warn!(contact = %self.contact.name, action = other.action(), "unexpected message during call");
                CallState::ErrorOther
            }
            Some(Err(e)) => self.signal_failure(&e, true),
        }
    }

    fn signal_failure(&self, err: &ChannelError, connected: bool) -> CallState {
        let state = failure_state(err, connected);
        if state.is_error() {
            warn!(contact = %self.contact.name, "signaling failed: {}", err);
        } else {
            debug!(contact = %self.contact.name, "signaling closed: {}", err);
        }
        state
    }

    /// Next message from the peer. `None` once the session is closing.
    async fn recv(
        &self,
        reader: &mut SignalReader,
        limit: Option<Duration>,
    ) -> Option<Result<SignalMessage, ChannelError>> {
        let mut closing = self.closing.subscribe();
        let peer = *self.contact.public_key();
        let next = async {
            match limit {
                Some(limit) => tokio::time::timeout(limit, reader.recv_from(&peer))
                    .await
                    .unwrap_or(Err(ChannelError::Timeout)),
                None => reader.recv_from(&peer).await,
            }
        };
        tokio::select! {
            _ = closing.wait_for(|c| *c) => None,
            msg = next => Some(msg),
        }
    }

    async fn send(&self, msg: SignalMessage) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => w.send(self.contact.public_key(), &msg).await,
            None => Err(ChannelError::Closed),
        }
    }

    async fn open_media(self: &Arc<Self>) -> Result<(), MediaError> {
        let ice_servers = self.node.store.settings().await.ice_servers;
        let (conn, events) = self.node.media.open(&ice_servers).await?;
        *self.media.lock().await = Some(conn);
        self.spawn_media_pump(events);
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, MediaError> {
        let offer = self
            .media
            .lock()
            .await
            .as_mut()
            .ok_or(MediaError::Closed)?
            .create_offer()
            .await?;
        lock(&self.descriptions).local = Some(offer.clone());
        Ok(offer)
    }

    async fn create_answer(&self, offer: &str) -> Result<String, MediaError> {
        let answer = self
            .media
            .lock()
            .await
            .as_mut()
            .ok_or(MediaError::Closed)?
            .create_answer(offer)
            .await?;
        lock(&self.descriptions).local = Some(answer.clone());
        Ok(answer)
    }

    async fn apply_answer(&self, answer: &str) -> Result<(), MediaError> {
        self.media
            .lock()
            .await
            .as_mut()
            .ok_or(MediaError::Closed)?
            .apply_answer(answer)
            .await
    }

    fn spawn_media_pump(self: &Arc<Self>, mut events: mpsc::Receiver<MediaEvent>) {
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.on_media_event(event);
            }
        });
    }

    fn on_media_event(&self, event: MediaEvent) {
        let peer = *self.contact.public_key();
        match event {
            MediaEvent::StreamAvailable => {
                self.node.notifier.notify(NodeEvent::StreamAvailable { peer });
            }
            MediaEvent::Data(bytes) => match decode_control(&bytes) {
                Ok(ControlMessage::StateChange(state)) => {
                    self.node.notifier.notify(NodeEvent::RemoteCamera {
                        peer,
                        enabled: state.is_enabled(),
                    });
                }
                Err(e) => debug!(contact = %self.contact.name, "ignoring data channel message: {}", e),
            },
            MediaEvent::Disconnected => {
                if self.state() == CallState::Connected && self.transition(CallState::Ended) {
                    info!(contact = %self.contact.name, "media path closed");
                    self.signal_close();
                }
            }
        }
    }

    fn event_kind(&self, end: CallState) -> EventKind {
        let connected = self.reached_connected.load(Ordering::Acquire);
        match self.direction {
            Direction::Outgoing if connected => EventKind::OutgoingAccepted,
            Direction::Outgoing => match end {
                CallState::Dismissed => EventKind::OutgoingDeclined,
                CallState::Ended => EventKind::OutgoingMissed,
                _ => EventKind::OutgoingError,
            },
            Direction::Incoming if connected => EventKind::IncomingAccepted,
            Direction::Incoming if self.declined.load(Ordering::Acquire) => {
                EventKind::IncomingDeclined
            }
            Direction::Incoming => match end {
                CallState::Dismissed | CallState::Ended => EventKind::IncomingMissed,
                _ => EventKind::IncomingError,
            },
        }
    }

    /// Close the stream and media connection, whichever are still held.
    async fn release(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            writer.close().await;
        }
        let media = self.media.lock().await.take();
        if let Some(mut media) = media {
            media.close().await;
        }
    }

    /// Release everything the session holds and log the call. Runs once.
    async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        self.signal_close();
        self.release().await;

        let end = self.state();
        let event = Event::new(
            *self.contact.public_key(),
            self.event_kind(end),
            lock(&self.address).clone(),
        );
        debug!(contact = %self.contact.name, kind = ?event.kind, "logging call");
        if let Err(e) = self.node.store.add_event(event).await {
            self.node.notifier.error("call log", e);
        }

        self.node.release_call(self);
    }
}
