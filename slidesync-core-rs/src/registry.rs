//! Open channels on the authoritative side

use tracing::{debug, info};

use crate::transport::{Channel, ChannelId, ChannelState, Frame};

/// Channels currently attached to a presenter.
///
/// Owned by the presenter engine; constructed once per session.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    channels: Vec<Channel>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened inbound channel
    pub fn register(&mut self, channel: Channel) {
        info!(
            "Registry: {} registered from {} ({} total)",
            channel.id(),
            channel.peer(),
            self.channels.len() + 1
        );
        self.channels.push(channel);
    }

    /// Record a lifecycle change reported by a link task
    pub fn mark(&mut self, id: ChannelId, state: ChannelState) -> bool {
        match self.channels.iter_mut().find(|c| c.id() == id) {
            Some(channel) => channel.transition(state),
            None => false,
        }
    }

    /// Drop every channel that is no longer open. Returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|c| {
            let keep = c.is_open();
            if !keep {
                debug!("Registry: pruning {} ({:?})", c.id(), c.state());
            }
            keep
        });
        before - self.channels.len()
    }

    /// Prune, then send `frame` to every remaining channel. Returns deliveries queued.
    pub fn fan_out(&mut self, frame: &Frame) -> usize {
        self.prune();
        self.channels.iter().filter(|c| c.send(frame)).count()
    }

    /// Send to a single channel, if it is registered and open
    pub fn send_to(&self, id: ChannelId, frame: &Frame) -> bool {
        self.channels
            .iter()
            .find(|c| c.id() == id)
            .map(|c| c.send(frame))
            .unwrap_or(false)
    }

    /// Liveness indicator: at least one follower attached
    pub fn is_anyone_connected(&self) -> bool {
        self.channels.iter().any(|c| c.is_open())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
