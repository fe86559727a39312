//! Core types for the slidesync protocol

use crate::identity::SessionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed number of image slots in every shared state
pub const SLOT_COUNT: usize = 5;

/// Display duration used when none (or zero) is given
pub const DEFAULT_INTERVAL_SECS: u32 = 5;

/// A single slot: either absent or an inline image payload (data URI)
pub type Slot = Option<String>;

/// Reason a decoded state was rejected as malformed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("intervalSeconds must be positive")]
    ZeroInterval,

    #[error("ownerId is empty")]
    MissingOwner,

    #[error("slot {0} holds an empty image payload")]
    EmptySlot(usize),
}

/// The single synchronized value.
///
/// Always replaced wholesale on propagation, never patched. Serializes to the
/// wire payload `{ slots, intervalSeconds, active, ownerId }`; unknown fields
/// are ignored when decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedState {
    pub slots: [Slot; SLOT_COUNT],
    pub interval_seconds: u32,
    pub active: bool,
    pub owner_id: SessionId,
}

impl SharedState {
    /// Fresh state for an authoritative session: all slots absent, inactive
    pub fn new(owner_id: SessionId) -> Self {
        Self {
            slots: Default::default(),
            interval_seconds: DEFAULT_INTERVAL_SECS,
            active: false,
            owner_id,
        }
    }

    /// Serialize to the JSON wire payload
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from the JSON wire payload
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Check the invariants serde cannot express
    pub fn validate(&self) -> Result<(), ShapeError> {
        if self.interval_seconds == 0 {
            return Err(ShapeError::ZeroInterval);
        }
        if self.owner_id.as_str().is_empty() {
            return Err(ShapeError::MissingOwner);
        }
        if let Some(index) = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Some(image) if image.is_empty()))
        {
            return Err(ShapeError::EmptySlot(index));
        }
        Ok(())
    }

    /// Non-absent slots in slot order
    pub fn slides(&self) -> Vec<&str> {
        self.slots.iter().filter_map(|slot| slot.as_deref()).collect()
    }

    /// Number of non-absent slots
    pub fn slide_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether a viewer should be cycling slides right now
    pub fn is_playing(&self) -> bool {
        self.active && self.slide_count() > 0
    }
}

impl Default for SharedState {
    /// All-absent, inactive state with no owner; never matches a follower's target
    fn default() -> Self {
        Self::new(SessionId::unassigned())
    }
}
