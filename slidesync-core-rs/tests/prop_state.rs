//! Property tests for the shared state
//!
//! Tests invariants for:
//! - StateStore: lossless save/load under the quota, untouched value over it
//! - FollowerEngine: payloads owned by another session never reach the renderer

use std::sync::Arc;

use proptest::prelude::*;
use slidesync_core::{
    Endpoint, FollowerEngine, MemoryBackend, ReconnectPolicy, Rejection, Renderer, SessionId,
    SharedState, Source, StateStore, ViewerTarget,
};

const KEY: &str = "slidesync_state";
const TARGET: &str = "obs-target";

// ============================================================================
// Strategies
// ============================================================================

fn slot() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        ("(png|gif|jpeg|webp)", "[A-Za-z0-9+/]{4,64}")
            .prop_map(|(kind, body)| Some(format!("data:image/{};base64,{}", kind, body))),
    ]
}

fn owner() -> impl Strategy<Value = SessionId> {
    "[A-Za-z0-9_-]{1,24}".prop_map(|id| id.parse().unwrap())
}

fn shared_state() -> impl Strategy<Value = SharedState> {
    (
        prop::array::uniform5(slot()),
        1u32..=3600,
        any::<bool>(),
        owner(),
    )
        .prop_map(|(slots, interval_seconds, active, owner_id)| SharedState {
            slots,
            interval_seconds,
            active,
            owner_id,
        })
}

/// Counts what the follower hands over for display
#[derive(Default)]
struct Renders(Vec<SharedState>);

impl Renderer for Renders {
    fn render(&mut self, state: &SharedState) {
        self.0.push(state.clone());
    }
}

fn follower() -> FollowerEngine<Renders> {
    let target = ViewerTarget::new(TARGET.parse().unwrap(), Endpoint::Discover);
    FollowerEngine::new(target, ReconnectPolicy::default(), Renders::default())
}

// ============================================================================
// StateStore Property Tests
// ============================================================================

proptest! {
    /// Anything that fits the quota loads back exactly as saved
    #[test]
    fn save_then_load_is_lossless(state in shared_state()) {
        let store = StateStore::new(Arc::new(MemoryBackend::new()), KEY, usize::MAX);

        let encoded = store.save(&state).unwrap();
        prop_assert!(encoded.len() <= store.quota());
        prop_assert_eq!(store.load().unwrap(), state);
    }

    /// Over the quota: capacity error, previously stored value untouched
    #[test]
    fn over_quota_save_keeps_prior_value(
        before in shared_state(),
        after in shared_state()
    ) {
        let backend = Arc::new(MemoryBackend::new());
        let roomy = StateStore::new(backend.clone(), KEY, usize::MAX);
        roomy.save(&before).unwrap();

        let size = after.to_json().unwrap().len();
        let tight = StateStore::new(backend, KEY, size - 1);

        let err = tight.save(&after).unwrap_err();
        prop_assert!(err.is_capacity(), "expected capacity error, got {}", err);
        prop_assert_eq!(tight.load().unwrap(), before.clone());
        prop_assert_eq!(roomy.load().unwrap(), before);
    }
}

// ============================================================================
// Follower Identity Gate Property Tests
// ============================================================================

proptest! {
    /// No source can get another session's state rendered
    #[test]
    fn foreign_owner_never_rendered(state in shared_state()) {
        prop_assume!(state.owner_id.as_str() != TARGET);
        let raw = state.to_json().unwrap();

        let mut follower = follower();
        for source in [Source::Peer, Source::Loopback, Source::Persisted] {
            let result = follower.accept(&raw, source);
            prop_assert!(
                matches!(result, Err(Rejection::IdentityMismatch { .. })),
                "{:?} payload owned by {} was not rejected",
                source, state.owner_id
            );
        }
        prop_assert!(follower.renderer().0.is_empty());
        prop_assert!(follower.last_applied().is_none());
    }

    /// The same state re-owned by the target renders exactly once
    #[test]
    fn own_state_rendered_once(mut state in shared_state()) {
        state.owner_id = TARGET.parse().unwrap();
        let raw = state.to_json().unwrap();

        let mut follower = follower();
        follower.accept(&raw, Source::Peer).unwrap();
        follower.accept(&raw, Source::Loopback).unwrap();

        prop_assert_eq!(follower.renderer().0.as_slice(), &[state][..]);
    }
}
