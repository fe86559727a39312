//! WebSocket transport for shared-state payloads
//!
//! One text frame per serialized state. Each link runs in its own task and
//! reports to the owning engine through `ChannelEvent`s; the engine holds a
//! `Channel` handle to push frames.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    accept_hdr_async_with_config, connect_async_with_config,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        protocol::WebSocketConfig,
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::identity::SessionId;

/// Query parameter carrying the session identity
pub const SESSION_PARAM: &str = "id";

/// A serialized state, shared between every channel it is sent to
pub type Frame = Arc<str>;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Channel lifecycle. `Closed` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
    Error,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Error)
    }

    fn can_transition_to(self, next: ChannelState) -> bool {
        match (self, next) {
            (ChannelState::Connecting, ChannelState::Open) => true,
            (ChannelState::Connecting | ChannelState::Open, ChannelState::Closed) => true,
            (ChannelState::Connecting | ChannelState::Open, ChannelState::Error) => true,
            _ => false,
        }
    }
}

/// Link-side end of a channel's outbound slot.
///
/// Holds only the newest frame: every state replaces the previous one, so a
/// slow link skips stale frames instead of falling behind.
#[derive(Debug)]
pub struct Outbound(watch::Receiver<Option<Frame>>);

impl Outbound {
    /// Wait for a frame newer than the last one taken; `None` once the handle is gone
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            self.0.changed().await.ok()?;
            if let Some(frame) = self.0.borrow_and_update().clone() {
                return Some(frame);
            }
        }
    }

    /// Newest frame not yet taken, without waiting
    pub fn try_recv(&mut self) -> Option<Frame> {
        if !self.0.has_changed().unwrap_or(false) {
            return None;
        }
        self.0.borrow_and_update().clone()
    }
}

/// Engine-side handle to one link
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    peer: String,
    state: ChannelState,
    outbound: watch::Sender<Option<Frame>>,
}

impl Channel {
    /// A handle in `Connecting` state, plus the slot its frames land in
    pub fn new(id: ChannelId, peer: impl Into<String>) -> (Self, Outbound) {
        let (tx, rx) = watch::channel(None);
        let channel = Self {
            id,
            peer: peer.into(),
            state: ChannelState::Connecting,
            outbound: tx,
        };
        (channel, Outbound(rx))
    }

    /// A handle that is already open
    pub fn open(id: ChannelId, peer: impl Into<String>) -> (Self, Outbound) {
        let (mut channel, outbound) = Self::new(id, peer);
        channel.state = ChannelState::Open;
        (channel, outbound)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Apply a lifecycle transition; invalid ones are ignored
    pub fn transition(&mut self, next: ChannelState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Open, and its link task is still draining frames
    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open && !self.outbound.is_closed()
    }

    /// Fire-and-forget send. Dropped silently unless the channel is open;
    /// replaces any frame the link has not written yet.
    pub fn send(&self, frame: &Frame) -> bool {
        if !self.is_open() {
            debug!("Transport: dropping frame for {} ({:?})", self.id, self.state);
            return false;
        }
        self.outbound.send_replace(Some(frame.clone()));
        true
    }
}

/// What a link task reports to its engine
#[derive(Debug)]
pub enum ChannelEvent {
    /// Handshake done; the handle is open
    Opened(Channel),
    /// A text payload arrived
    Data { id: ChannelId, payload: String },
    /// The link ended cleanly
    Closed { id: ChannelId },
    /// The link (or the attempt to create it) failed
    Failed { id: ChannelId, error: TransportError },
}

impl ChannelEvent {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            ChannelEvent::Opened(channel) => channel.id(),
            ChannelEvent::Data { id, .. }
            | ChannelEvent::Closed { id }
            | ChannelEvent::Failed { id, .. } => *id,
        }
    }
}

/// Viewer link for a presenter endpoint
pub fn viewer_link(host: &str, port: u16, session: &SessionId) -> String {
    format!("ws://{}:{}/?{}={}", host, port, SESSION_PARAM, session)
}

/// Extract the session identity from a query string
pub fn session_param(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == SESSION_PARAM)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn ws_config(max_message_size: usize) -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(max_message_size),
        max_frame_size: Some(max_message_size),
        ..Default::default()
    }
}

/// Complete the server handshake, answering 404 unless the request names `session`
pub async fn accept(
    stream: TcpStream,
    session: &SessionId,
    max_message_size: usize,
) -> Result<WebSocketStream<TcpStream>, TransportError> {
    let expected = session.as_str().to_string();
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match session_param(request.uri().query()) {
            Some(id) if id == expected => Ok(response),
            other => {
                debug!("Transport: rejecting handshake for session {:?}", other);
                let mut rejection = ErrorResponse::new(Some("unknown session".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    };

    let ws = accept_hdr_async_with_config(stream, callback, Some(ws_config(max_message_size))).await?;
    Ok(ws)
}

/// Client handshake against a viewer link
pub async fn connect(
    url: &str,
    max_message_size: usize,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, TransportError> {
    let (ws, _response) =
        connect_async_with_config(url, Some(ws_config(max_message_size)), false).await?;
    Ok(ws)
}

/// Hand an established socket to its engine and pump it until it ends.
///
/// `Opened` is always reported before any `Data`, and exactly one of
/// `Closed`/`Failed` is reported last.
pub async fn attach<S>(
    ws: WebSocketStream<S>,
    id: ChannelId,
    peer: String,
    events: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (channel, outbound) = Channel::open(id, peer);
    if events.send(ChannelEvent::Opened(channel)).await.is_err() {
        return;
    }

    let event = match pump(ws, id, outbound, &events, cancel).await {
        Ok(()) => ChannelEvent::Closed { id },
        Err(error) => {
            warn!("Transport: {} failed: {}", id, error);
            ChannelEvent::Failed { id, error }
        }
    };
    let _ = events.send(event).await;
}

async fn pump<S>(
    ws: WebSocketStream<S>,
    id: ChannelId,
    mut outbound: Outbound,
    events: &mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        sink.send(Message::Text(frame.to_string().into())).await?;
                    }
                    None => {
                        // Handle dropped by the engine
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }

            msg = stream.next() => {
                let payload = match msg {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("Transport: {} sent non-UTF-8 binary frame", id);
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Transport: {} closed by peer", id);
                        return Ok(());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };

                if events.send(ChannelEvent::Data { id, payload }).await.is_err() {
                    return Ok(());
                }
            }

            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}
