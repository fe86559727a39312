//! Follower side of the sync protocol.
//!
//! A follower knows exactly one session identity and renders only states
//! stamped with it. States arrive from two places: the peer channel to the
//! presenter and the local-loopback subscription. Both go through
//! `FollowerEngine::accept`, which is the identity gate.
//!
//! The peer channel is kept alive forever: every close or failure schedules a
//! single reconnect after a fixed delay that depends on the failure class.

use std::future::pending;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ReconnectPolicy;
use crate::discovery;
use crate::error::{BackoffClass, ConfigurationError, LoadError, Rejection, TransportError};
use crate::identity::SessionId;
use crate::renderer::{Renderer, ViewStatus};
use crate::storage::{StateStore, Subscription};
use crate::transport::{self, Channel, ChannelEvent, ChannelId, SESSION_PARAM};
use crate::types::SharedState;

const EVENT_BUFFER: usize = 64;

/// How the presenter endpoint is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A full viewer link
    Direct(String),
    /// Browse mDNS for the session identity
    Discover,
}

/// The one session a follower tracks, and where to find it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerTarget {
    session: SessionId,
    endpoint: Endpoint,
}

impl ViewerTarget {
    pub fn new(session: SessionId, endpoint: Endpoint) -> Self {
        Self { session, endpoint }
    }

    /// Build a target from a viewer link or bare identity, plus an optional
    /// manually entered identity that takes precedence over the link's.
    pub fn parse(target: Option<&str>, id_override: Option<&str>) -> Result<Self, ConfigurationError> {
        let override_id = id_override
            .filter(|id| !id.trim().is_empty())
            .map(str::parse::<SessionId>)
            .transpose()?;

        let target = target.map(str::trim).filter(|t| !t.is_empty());
        match target {
            Some(link) if link.starts_with("ws://") || link.starts_with("wss://") => {
                let mut url =
                    Url::parse(link).map_err(|e| ConfigurationError::InvalidLink(e.to_string()))?;
                if url.host_str().is_none() {
                    return Err(ConfigurationError::InvalidLink(format!("{} has no host", link)));
                }

                let session = match override_id {
                    Some(id) => id,
                    None => transport::session_param(url.query())
                        .ok_or(ConfigurationError::MissingSessionId)?
                        .parse()?,
                };

                let others: Vec<(String, String)> = url
                    .query_pairs()
                    .filter(|(k, _)| k != SESSION_PARAM)
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                url.query_pairs_mut()
                    .clear()
                    .extend_pairs(others)
                    .append_pair(SESSION_PARAM, session.as_str());

                Ok(Self::new(session, Endpoint::Direct(url.to_string())))
            }
            Some(bare) => {
                let session = match override_id {
                    Some(id) => id,
                    None => bare.parse()?,
                };
                Ok(Self::new(session, Endpoint::Discover))
            }
            None => {
                let session = override_id.ok_or(ConfigurationError::MissingSessionId)?;
                Ok(Self::new(session, Endpoint::Discover))
            }
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Resolve to a connectable link. Discovery waits at most `timeout`.
    async fn resolve(&self, timeout: Duration) -> Result<String, TransportError> {
        match &self.endpoint {
            Endpoint::Direct(link) => Ok(link.clone()),
            Endpoint::Discover => {
                let addr = discovery::resolve(&self.session, timeout).await?;
                Ok(link_for(addr, &self.session))
            }
        }
    }
}

fn link_for(addr: SocketAddr, session: &SessionId) -> String {
    let host = match addr.ip() {
        IpAddr::V4(ip) => ip.to_string(),
        IpAddr::V6(ip) => format!("[{}]", ip),
    };
    transport::viewer_link(&host, addr.port(), session)
}

/// Where an incoming payload came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Peer,
    Loopback,
    Persisted,
}

/// Result of an accepted payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Handed to the renderer
    Rendered,
    /// Identical to the last rendered state; nothing to do
    Unchanged,
}

/// Identity-checked consumer of shared states
pub struct FollowerEngine<R: Renderer> {
    target: ViewerTarget,
    policy: ReconnectPolicy,
    renderer: R,
    /// Open peer channel, replaced wholesale on reconnect
    channel: Option<Channel>,
    /// Id of the connection attempt (and channel) currently in flight
    attempt: Option<ChannelId>,
    last_applied: Option<SharedState>,
}

impl<R: Renderer> FollowerEngine<R> {
    pub fn new(target: ViewerTarget, policy: ReconnectPolicy, renderer: R) -> Self {
        Self {
            target,
            policy,
            renderer,
            channel: None,
            attempt: None,
            last_applied: None,
        }
    }

    pub fn session(&self) -> &SessionId {
        self.target.session()
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Last state handed to the renderer
    pub fn last_applied(&self) -> Option<&SharedState> {
        self.last_applied.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.as_ref().map(Channel::is_open).unwrap_or(false)
    }

    /// Validate a raw payload and render it if it belongs to our session.
    ///
    /// Rejections are logged here; callers only need the outcome.
    pub fn accept(&mut self, raw: &str, source: Source) -> Result<Applied, Rejection> {
        let result = SharedState::from_json(raw)
            .map_err(Rejection::from)
            .and_then(|state| self.apply(state, source));

        match &result {
            Err(e @ Rejection::IdentityMismatch { .. }) => {
                warn!("Follower: dropping {:?} payload: {}", source, e)
            }
            Err(e) => debug!("Follower: dropping {:?} payload: {}", source, e),
            Ok(_) => {}
        }
        result
    }

    fn apply(&mut self, state: SharedState, source: Source) -> Result<Applied, Rejection> {
        state.validate()?;
        if &state.owner_id != self.target.session() {
            return Err(Rejection::IdentityMismatch {
                expected: self.target.session().clone(),
                got: state.owner_id,
            });
        }

        if self.last_applied.as_ref() == Some(&state) {
            debug!("Follower: {:?} payload unchanged", source);
            return Ok(Applied::Unchanged);
        }

        debug!(
            "Follower: rendering {} slide(s) from {:?}, active={}",
            state.slide_count(),
            source,
            state.active
        );
        self.renderer.render(&state);
        self.last_applied = Some(state);
        Ok(Applied::Rendered)
    }

    /// Render the persisted state if it belongs to our session; otherwise
    /// show that we are still linking.
    pub fn prime(&mut self, store: &StateStore) {
        let rendered = match store.load() {
            Ok(state) => match self.apply(state, Source::Persisted) {
                Ok(_) => true,
                Err(e) => {
                    debug!("Follower: ignoring persisted state: {}", e);
                    false
                }
            },
            Err(LoadError::Missing) => false,
            Err(e) => {
                debug!("Follower: persisted state unreadable: {}", e);
                false
            }
        };

        if !rendered {
            self.renderer.status(&ViewStatus::Linking);
        }
    }

    /// React to a link task's report. Returns the delay before the next
    /// connection attempt when one must be scheduled.
    pub fn handle_event(&mut self, event: ChannelEvent) -> Option<Duration> {
        let id = event.channel_id();
        if self.attempt != Some(id) {
            // Superseded attempt; dropping a stale handle closes its link
            debug!("Follower: ignoring event from stale {}", id);
            return None;
        }

        match event {
            ChannelEvent::Opened(channel) => {
                info!("Follower: connected to {} ({})", channel.peer(), self.target.session());
                self.channel = Some(channel);
                self.renderer.status(&ViewStatus::Connected);
                None
            }
            ChannelEvent::Data { payload, .. } => {
                let _ = self.accept(&payload, Source::Peer);
                None
            }
            ChannelEvent::Closed { .. } => {
                Some(self.schedule_reconnect(BackoffClass::Closed, "channel closed".to_string()))
            }
            ChannelEvent::Failed { error, .. } => {
                Some(self.schedule_reconnect(error.backoff_class(), error.to_string()))
            }
        }
    }

    fn schedule_reconnect(&mut self, class: BackoffClass, reason: String) -> Duration {
        self.channel = None;
        self.attempt = None;

        let delay = self.policy.delay_for(class);
        info!("Follower: {}; reconnecting in {:?}", reason, delay);
        self.renderer.status(&ViewStatus::Reconnecting { delay, reason });
        delay
    }

    /// Start one connection attempt; its outcome arrives as a `ChannelEvent`
    fn begin_connect(&mut self, events: &mpsc::Sender<ChannelEvent>, cancel: &CancellationToken) {
        let id = ChannelId::next();
        self.attempt = Some(id);
        self.channel = None;

        let target = self.target.clone();
        let timeout = self.policy.connect_timeout;
        let max_message_size = self.policy.max_message_size;
        let events = events.clone();
        let cancel = cancel.clone();
        debug!("Follower: attempt {} for {}", id, target.session());

        tokio::spawn(async move {
            let attempt = async {
                let link = target.resolve(timeout).await?;
                let ws = transport::connect(&link, max_message_size).await?;
                Ok::<_, TransportError>((ws, link))
            };

            let result = tokio::select! {
                result = tokio::time::timeout(timeout, attempt) => {
                    result.unwrap_or(Err(TransportError::Timeout(timeout)))
                }
                _ = cancel.cancelled() => return,
            };

            match result {
                Ok((ws, link)) => transport::attach(ws, id, link, events, cancel).await,
                Err(error) => {
                    let _ = events.send(ChannelEvent::Failed { id, error }).await;
                }
            }
        });
    }

    /// Follow the session until cancelled, returning the renderer.
    ///
    /// `loopback` is the local-loopback subscription, when one is available.
    pub async fn run(mut self, mut loopback: Option<Subscription>, cancel: CancellationToken) -> R {
        let (events_tx, mut events) = mpsc::channel(EVENT_BUFFER);
        let mut reconnect: Option<Pin<Box<Sleep>>> = None;

        info!("Follower: following session {}", self.target.session());
        self.begin_connect(&events_tx, &cancel);

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    if let Some(delay) = self.handle_event(event) {
                        // Replacing the timer drops any previously armed one
                        reconnect = Some(Box::pin(sleep(delay)));
                    }
                }

                raw = next_loopback(&mut loopback) => {
                    match raw {
                        Some(raw) => {
                            let _ = self.accept(&raw, Source::Loopback);
                        }
                        None => {
                            warn!("Follower: local-loopback subscription ended");
                            loopback = None;
                        }
                    }
                }

                _ = fire(&mut reconnect) => {
                    reconnect = None;
                    self.begin_connect(&events_tx, &cancel);
                }

                _ = cancel.cancelled() => {
                    info!("Follower: stopping");
                    break;
                }
            }
        }

        self.channel = None;
        self.renderer
    }
}

async fn next_loopback(loopback: &mut Option<Subscription>) -> Option<String> {
    match loopback {
        Some(subscription) => subscription.recv().await,
        None => pending().await,
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use std::sync::Arc;

    const IMG_A: &str = "data:image/png;base64,iVBORw0KGgo=";

    #[derive(Default)]
    struct Recorder {
        renders: Vec<SharedState>,
        statuses: Vec<ViewStatus>,
    }

    impl Renderer for Recorder {
        fn render(&mut self, state: &SharedState) {
            self.renders.push(state.clone());
        }

        fn status(&mut self, status: &ViewStatus) {
            self.statuses.push(status.clone());
        }
    }

    fn session(id: &str) -> SessionId {
        id.parse().unwrap()
    }

    fn follower() -> FollowerEngine<Recorder> {
        let target = ViewerTarget::new(session("obs-ab12cd"), Endpoint::Discover);
        FollowerEngine::new(target, ReconnectPolicy::default(), Recorder::default())
    }

    fn state_json(owner: &str) -> String {
        let mut state = SharedState::new(session(owner));
        state.slots[0] = Some(IMG_A.to_string());
        state.active = true;
        state.to_json().unwrap()
    }

    #[test]
    fn test_parse_link() {
        let target = ViewerTarget::parse(Some("ws://10.0.0.2:9470/?id=obs-ab12cd"), None).unwrap();
        assert_eq!(target.session().as_str(), "obs-ab12cd");
        assert_eq!(
            target.endpoint(),
            &Endpoint::Direct("ws://10.0.0.2:9470/?id=obs-ab12cd".to_string())
        );
    }

    #[test]
    fn test_parse_override_replaces_link_id() {
        let target =
            ViewerTarget::parse(Some("ws://studio:9470/?id=obs-old&x=1"), Some("obs-new")).unwrap();
        assert_eq!(target.session().as_str(), "obs-new");
        assert_eq!(
            target.endpoint(),
            &Endpoint::Direct("ws://studio:9470/?x=1&id=obs-new".to_string())
        );
    }

    #[test]
    fn test_parse_bare_identity_discovers() {
        let target = ViewerTarget::parse(Some("obs-ab12cd"), None).unwrap();
        assert_eq!(target.endpoint(), &Endpoint::Discover);

        let target = ViewerTarget::parse(None, Some("obs-ab12cd")).unwrap();
        assert_eq!(target.session().as_str(), "obs-ab12cd");
        assert_eq!(target.endpoint(), &Endpoint::Discover);
    }

    #[test]
    fn test_parse_missing_identity() {
        assert_eq!(
            ViewerTarget::parse(Some("ws://studio:9470/"), None),
            Err(ConfigurationError::MissingSessionId)
        );
        assert_eq!(ViewerTarget::parse(None, None), Err(ConfigurationError::MissingSessionId));
        assert_eq!(
            ViewerTarget::parse(Some("  "), Some("")),
            Err(ConfigurationError::MissingSessionId)
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            ViewerTarget::parse(Some("ws://"), None),
            Err(ConfigurationError::InvalidLink(_))
        ));
        assert!(matches!(
            ViewerTarget::parse(Some("obs/../etc"), None),
            Err(ConfigurationError::InvalidSessionId(_))
        ));
    }

    #[test]
    fn test_link_for_ipv6() {
        let addr: SocketAddr = "[::1]:9470".parse().unwrap();
        assert_eq!(link_for(addr, &session("obs-q")), "ws://[::1]:9470/?id=obs-q");
    }

    #[test]
    fn test_accept_matching_owner() {
        let mut follower = follower();
        let applied = follower.accept(&state_json("obs-ab12cd"), Source::Peer).unwrap();
        assert_eq!(applied, Applied::Rendered);
        assert_eq!(follower.renderer().renders.len(), 1);
        assert_eq!(follower.last_applied().unwrap().slots[0].as_deref(), Some(IMG_A));
    }

    #[test]
    fn test_mismatched_owner_never_rendered() {
        let mut follower = follower();
        let err = follower.accept(&state_json("obs-zz99"), Source::Loopback).unwrap_err();
        assert!(matches!(err, Rejection::IdentityMismatch { .. }));
        assert!(follower.renderer().renders.is_empty());
        assert!(follower.last_applied().is_none());
    }

    #[test]
    fn test_malformed_payloads_dropped() {
        let mut follower = follower();
        assert!(matches!(
            follower.accept("not json", Source::Peer),
            Err(Rejection::Malformed(_))
        ));
        assert!(matches!(
            follower.accept(
                r#"{"slots":[null,null,null,null,null],"intervalSeconds":0,"active":true,"ownerId":"obs-ab12cd"}"#,
                Source::Peer
            ),
            Err(Rejection::Shape(_))
        ));
        assert!(follower.renderer().renders.is_empty());
    }

    #[test]
    fn test_duplicate_payload_skipped() {
        let mut follower = follower();
        let raw = state_json("obs-ab12cd");
        assert_eq!(follower.accept(&raw, Source::Peer).unwrap(), Applied::Rendered);
        assert_eq!(follower.accept(&raw, Source::Loopback).unwrap(), Applied::Unchanged);
        assert_eq!(follower.renderer().renders.len(), 1);
    }

    #[test]
    fn test_prime_from_store() {
        let store = StateStore::new(Arc::new(MemoryBackend::new()), "k", 64 * 1024);

        // Nothing persisted: linking
        let mut follower = follower();
        follower.prime(&store);
        assert_eq!(follower.renderer().statuses, vec![ViewStatus::Linking]);

        // Stale value from another session: still linking
        let stale = SharedState::from_json(&state_json("obs-zz99")).unwrap();
        store.save(&stale).unwrap();
        let mut follower = self::follower();
        follower.prime(&store);
        assert!(follower.renderer().renders.is_empty());
        assert_eq!(follower.renderer().statuses, vec![ViewStatus::Linking]);

        // Our own session: rendered straight away
        let ours = SharedState::from_json(&state_json("obs-ab12cd")).unwrap();
        store.save(&ours).unwrap();
        let mut follower = self::follower();
        follower.prime(&store);
        assert_eq!(follower.renderer().renders, vec![ours]);
        assert!(follower.renderer().statuses.is_empty());
    }

    #[test]
    fn test_reconnect_delay_by_failure_class() {
        let mut follower = follower();
        let policy = ReconnectPolicy::default();

        let id = ChannelId::next();
        follower.attempt = Some(id);
        let delay = follower.handle_event(ChannelEvent::Failed {
            id,
            error: TransportError::PeerUnavailable("404".into()),
        });
        assert_eq!(delay, Some(policy.unavailable_delay));

        let id = ChannelId::next();
        follower.attempt = Some(id);
        let delay = follower.handle_event(ChannelEvent::Failed {
            id,
            error: TransportError::Timeout(policy.connect_timeout),
        });
        assert_eq!(delay, Some(policy.network_delay));

        let id = ChannelId::next();
        follower.attempt = Some(id);
        let (channel, _rx) = Channel::open(id, "presenter");
        assert_eq!(follower.handle_event(ChannelEvent::Opened(channel)), None);
        assert!(follower.is_connected());
        assert_eq!(follower.handle_event(ChannelEvent::Closed { id }), Some(policy.closed_delay));
        assert!(!follower.is_connected());

        assert!(matches!(
            follower.renderer().statuses.last(),
            Some(ViewStatus::Reconnecting { delay, .. }) if *delay == policy.closed_delay
        ));
    }

    #[test]
    fn test_stale_channel_events_ignored() {
        let mut follower = follower();
        let current = ChannelId::next();
        let stale = ChannelId::next();
        follower.attempt = Some(current);

        assert_eq!(follower.handle_event(ChannelEvent::Closed { id: stale }), None);
        assert_eq!(
            follower.handle_event(ChannelEvent::Data { id: stale, payload: state_json("obs-ab12cd") }),
            None
        );
        assert!(follower.renderer().renders.is_empty());
        assert_eq!(follower.attempt, Some(current));
    }

    #[test]
    fn test_peer_data_rendered() {
        let mut follower = follower();
        let id = ChannelId::next();
        follower.attempt = Some(id);
        let (channel, _rx) = Channel::open(id, "presenter");
        follower.handle_event(ChannelEvent::Opened(channel));

        follower.handle_event(ChannelEvent::Data { id, payload: state_json("obs-ab12cd") });
        follower.handle_event(ChannelEvent::Data { id, payload: state_json("obs-zz99") });
        assert_eq!(follower.renderer().renders.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_consumes_loopback() {
        let store = StateStore::new(Arc::new(MemoryBackend::new()), "k", 64 * 1024);
        let subscription = store.subscribe().unwrap();
        let target = ViewerTarget::new(
            session("obs-ab12cd"),
            Endpoint::Direct("ws://127.0.0.1:1/?id=obs-ab12cd".to_string()),
        );
        let engine = FollowerEngine::new(target, ReconnectPolicy::default(), Recorder::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.run(Some(subscription), cancel.clone()));

        store
            .save(&SharedState::from_json(&state_json("obs-zz99")).unwrap())
            .unwrap();
        store
            .save(&SharedState::from_json(&state_json("obs-ab12cd")).unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        cancel.cancel();
        let recorder = task.await.unwrap();
        assert_eq!(recorder.renders.len(), 1);
        assert_eq!(recorder.renders[0].owner_id.as_str(), "obs-ab12cd");
    }
}
