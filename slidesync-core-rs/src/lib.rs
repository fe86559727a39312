//! Slidesync Core Library
//!
//! Single-writer state synchronization for a remote slideshow overlay.
//! A presenter owns one `SharedState` and pushes it wholesale to every
//! follower over WebSocket channels and a local-loopback store; followers
//! render only states stamped with the session they were pointed at.
//!
//! ## Architecture
//!
//! ```text
//!  presentation layer
//!        │ Mutation
//!        ▼
//! ┌──────────────────┐  save   ┌────────────┐  notify  ┌──────────────────┐
//! │ PresenterEngine  │────────►│ StateStore │─────────►│ FollowerEngine   │
//! │ (single writer)  │         └────────────┘          │ (identity gate)  │
//! │                  │  WebSocket fan-out              │                  │
//! │ ConnectionRegistry ──────────────────────────────► │ Renderer         │
//! └──────────────────┘   ws://host:port/?id=<session>  └──────────────────┘
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod follower;
pub mod identity;
pub mod media;
pub mod presenter;
pub mod registry;
pub mod renderer;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::{PresenterConfig, ReconnectPolicy, StoreConfig, SyncConfig};
pub use error::{CommitError, ConfigurationError, LoadError, Rejection, StoreError, TransportError};
pub use follower::{Applied, Endpoint, FollowerEngine, Source, ViewerTarget};
pub use identity::SessionId;
pub use media::DataUri;
pub use presenter::{start as start_presenter, Mutation, PresenterEngine, PresenterHandle};
pub use renderer::{Renderer, Slideshow, Surface, ViewStatus};
pub use storage::{FileBackend, MemoryBackend, StateStore};
pub use types::*;
