//! Authoritative side of the sync protocol.
//!
//! The presenter engine is the only writer of the shared state. Every
//! mutation goes through the same path:
//! - apply to a copy of the current state
//! - persist the copy (local-loopback channel)
//! - fan the same encoded payload out to every open channel
//! - only then adopt the copy and notify the presentation layer
//!
//! A failed save discards the copy; nothing is sent. New channels get the
//! full current state as their first frame.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PresenterConfig, SyncConfig};
use crate::discovery::{advertised_host, Announcement};
use crate::error::{CommitError, StoreError, TransportError};
use crate::identity::SessionId;
use crate::registry::ConnectionRegistry;
use crate::storage::StateStore;
use crate::transport::{self, ChannelEvent, ChannelId, ChannelState, Frame};
use crate::types::{SharedState, DEFAULT_INTERVAL_SECS};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 256;

/// A change requested by the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Put an image (data URI) into a slot
    SetSlot { index: usize, image: String },
    /// Empty a slot
    ClearSlot { index: usize },
    /// Seconds per slide; zero falls back to the default
    SetInterval { seconds: u32 },
    /// Begin playback; needs at least one image
    Start,
    /// Pause playback
    Stop,
}

impl Mutation {
    fn apply(self, state: &mut SharedState) -> Result<(), CommitError> {
        match self {
            Mutation::SetSlot { index, image } => {
                let slot = state
                    .slots
                    .get_mut(index)
                    .ok_or(CommitError::SlotOutOfRange { index })?;
                if image.is_empty() {
                    return Err(CommitError::EmptyImage { index });
                }
                *slot = Some(image);
            }
            Mutation::ClearSlot { index } => {
                let slot = state
                    .slots
                    .get_mut(index)
                    .ok_or(CommitError::SlotOutOfRange { index })?;
                *slot = None;
            }
            Mutation::SetInterval { seconds } => {
                state.interval_seconds = if seconds == 0 {
                    DEFAULT_INTERVAL_SECS
                } else {
                    seconds
                };
            }
            Mutation::Start => {
                if state.slide_count() == 0 {
                    return Err(CommitError::NoImages);
                }
                state.active = true;
            }
            Mutation::Stop => {
                state.active = false;
            }
        }
        Ok(())
    }
}

/// Request sent to a running engine
#[derive(Debug)]
pub enum Command {
    Apply {
        mutation: Mutation,
        reply: oneshot::Sender<Result<SharedState, CommitError>>,
    },
}

/// Owner of the shared state, the store and the connection registry
pub struct PresenterEngine {
    session: SessionId,
    state: SharedState,
    /// Encoded form of `state`, reused for snapshots
    frame: Option<Frame>,
    store: StateStore,
    registry: ConnectionRegistry,
    state_tx: watch::Sender<SharedState>,
    liveness_tx: watch::Sender<bool>,
}

impl PresenterEngine {
    /// Fresh engine: all slots absent, inactive, owned by `session`
    pub fn new(session: SessionId, store: StateStore) -> Self {
        let state = SharedState::new(session.clone());
        let (state_tx, _) = watch::channel(state.clone());
        let (liveness_tx, _) = watch::channel(false);

        Self {
            session,
            state,
            frame: None,
            store,
            registry: ConnectionRegistry::new(),
            state_tx,
            liveness_tx,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Current authoritative state
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Every adopted state, starting with the current one
    pub fn watch_state(&self) -> watch::Receiver<SharedState> {
        self.state_tx.subscribe()
    }

    /// Liveness indicator, recomputed after every registry change
    pub fn watch_liveness(&self) -> watch::Receiver<bool> {
        self.liveness_tx.subscribe()
    }

    /// Apply a mutation. On error the prior state is kept and nothing is sent.
    pub fn commit(&mut self, mutation: Mutation) -> Result<&SharedState, CommitError> {
        debug!("Presenter: applying {:?}", MutationSummary(&mutation));

        let mut next = self.state.clone();
        mutation.apply(&mut next)?;
        self.publish(next)?;
        Ok(&self.state)
    }

    /// Persist and fan out as one unit, then adopt `next`
    fn publish(&mut self, next: SharedState) -> Result<(), StoreError> {
        let encoded = match self.store.save(&next) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Presenter: discarding update: {}", e);
                return Err(e);
            }
        };

        let frame: Frame = Arc::from(encoded);
        let delivered = self.registry.fan_out(&frame);
        info!(
            "Presenter: published {} slide(s), active={}, to {} viewer(s)",
            next.slide_count(),
            next.active,
            delivered
        );

        self.state = next;
        self.frame = Some(frame);
        self.state_tx.send_replace(self.state.clone());
        self.refresh_liveness();
        Ok(())
    }

    /// React to a link task's report
    pub fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened(channel) => {
                let id = channel.id();
                self.registry.register(channel);
                self.send_snapshot(id);
            }
            ChannelEvent::Data { id, payload } => {
                // Followers never write
                debug!("Presenter: ignoring {} bytes from {}", payload.len(), id);
            }
            ChannelEvent::Closed { id } => {
                info!("Presenter: {} closed", id);
                self.registry.mark(id, ChannelState::Closed);
                self.registry.prune();
            }
            ChannelEvent::Failed { id, error } => {
                warn!("Presenter: {} failed: {}", id, error);
                self.registry.mark(id, ChannelState::Error);
                self.registry.prune();
            }
        }
        self.refresh_liveness();
    }

    /// Full current state to one newly opened channel
    fn send_snapshot(&mut self, id: ChannelId) {
        if self.frame.is_none() {
            match self.state.to_json() {
                Ok(encoded) => self.frame = Some(Arc::from(encoded)),
                Err(e) => {
                    error!("Presenter: cannot encode state: {}", e);
                    return;
                }
            }
        }
        let Some(frame) = self.frame.clone() else {
            return;
        };

        if self.registry.send_to(id, &frame) {
            debug!("Presenter: sent snapshot to {}", id);
        }
    }

    fn refresh_liveness(&mut self) {
        let connected = self.registry.is_anyone_connected();
        let changed = self.liveness_tx.send_if_modified(|current| {
            if *current != connected {
                *current = connected;
                true
            } else {
                false
            }
        });
        if changed {
            info!(
                "Presenter: {} viewer(s) connected",
                if connected { self.registry.len() } else { 0 }
            );
        }
    }

    /// Event loop: commands from the presentation layer, reports from links
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<ChannelEvent>,
        cancel: CancellationToken,
    ) {
        info!("Presenter: session {} running", self.session);

        loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    match command {
                        Command::Apply { mutation, reply } => {
                            let result = self.commit(mutation).map(|state| state.clone());
                            let _ = reply.send(result);
                        }
                    }
                }

                Some(event) = events.recv() => {
                    self.handle_event(event);
                }

                _ = cancel.cancelled() => {
                    info!("Presenter: session {} stopping", self.session);
                    break;
                }

                else => break,
            }
        }
    }
}

/// Log-friendly view of a mutation without the inline image
struct MutationSummary<'a>(&'a Mutation);

impl std::fmt::Debug for MutationSummary<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Mutation::SetSlot { index, image } => {
                write!(f, "SetSlot {{ index: {}, image: {} bytes }}", index, image.len())
            }
            other => write!(f, "{:?}", other),
        }
    }
}

/// Presentation-layer handle to a running presenter
pub struct PresenterHandle {
    session: SessionId,
    link: String,
    local_addr: SocketAddr,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SharedState>,
    liveness: watch::Receiver<bool>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    announcement: Option<Announcement>,
}

impl PresenterHandle {
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Link a viewer uses to reach this session
    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Apply a mutation and wait for the outcome
    pub async fn apply(&self, mutation: Mutation) -> Result<SharedState, CommitError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Apply { mutation, reply })
            .await
            .map_err(|_| CommitError::EngineStopped)?;
        response.await.map_err(|_| CommitError::EngineStopped)?
    }

    /// Last adopted state
    pub fn state(&self) -> SharedState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SharedState> {
        self.state.clone()
    }

    pub fn watch_liveness(&self) -> watch::Receiver<bool> {
        self.liveness.clone()
    }

    pub fn is_anyone_connected(&self) -> bool {
        *self.liveness.borrow()
    }

    /// Close every channel, stop accepting and withdraw the announcement
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        if let Some(announcement) = self.announcement {
            announcement.shutdown();
        }
        info!("Presenter: session {} shut down", self.session);
    }
}

/// Start an authoritative session: bind the endpoint, then run engine and accept loop
pub async fn start(
    session: SessionId,
    store: StateStore,
    config: &SyncConfig,
) -> Result<PresenterHandle, TransportError> {
    if config.store.clear_on_start {
        if let Err(e) = store.clear() {
            warn!("Presenter: could not clear previous state: {}", e);
        }
    }

    let listener = TcpListener::bind(config.presenter.listen).await?;
    let local_addr = listener.local_addr()?;
    let host = advertised_host(local_addr.ip(), &config.presenter.public_host);
    let link = transport::viewer_link(&host, local_addr.port(), &session);
    info!("Presenter: listening on {} (viewer link {})", local_addr, link);

    let announcement = if config.presenter.use_mdns {
        match Announcement::start(&session, local_addr.port()) {
            Ok(announcement) => Some(announcement),
            Err(e) => {
                warn!("Presenter: mDNS announcement failed: {}", e);
                None
            }
        }
    } else {
        None
    };

    let engine = PresenterEngine::new(session.clone(), store);
    let state = engine.watch_state();
    let liveness = engine.watch_liveness();

    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = CancellationToken::new();

    let engine_task = tokio::spawn(engine.run(command_rx, event_rx, cancel.clone()));
    let accept_task = tokio::spawn(serve(
        listener,
        session.clone(),
        config.presenter.clone(),
        event_tx,
        cancel.clone(),
    ));

    Ok(PresenterHandle {
        session,
        link,
        local_addr,
        commands: command_tx,
        state,
        liveness,
        cancel,
        tasks: vec![engine_task, accept_task],
        announcement,
    })
}

/// Accept loop. Failures are logged and retried after a fixed delay.
async fn serve(
    listener: TcpListener,
    session: SessionId,
    config: PresenterConfig,
    events: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!("Presenter: TCP connection from {}", peer);
                        let session = session.clone();
                        let events = events.clone();
                        let cancel = cancel.clone();
                        let max_message_size = config.max_message_size;
                        let handshake_timeout = config.handshake_timeout;

                        tokio::spawn(async move {
                            let handshake = transport::accept(stream, &session, max_message_size);
                            match tokio::time::timeout(handshake_timeout, handshake).await {
                                Ok(Ok(ws)) => {
                                    transport::attach(ws, ChannelId::next(), peer.to_string(), events, cancel).await;
                                }
                                Ok(Err(e)) => {
                                    debug!("Presenter: handshake with {} failed: {}", peer, e);
                                }
                                Err(_) => {
                                    debug!(
                                        "Presenter: handshake with {} timed out after {:?}",
                                        peer, handshake_timeout
                                    );
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!(
                            "Presenter: accept failed: {}; retrying in {:?}",
                            e, config.accept_retry_delay
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(config.accept_retry_delay) => {}
                            _ = cancel.cancelled() => break,
                        }
                    }
                }
            }

            _ = cancel.cancelled() => break,
        }
    }
    debug!("Presenter: accept loop stopped");
}
