//! # Mesh Test Utilities
//!
//! Shared test utilities for the mesh client and the signal store.
//!
//! This crate provides mock implementations and fixtures so mesh flows can
//! run end to end in one process, without a network, a media engine or
//! camera hardware.
//!
//! ## Modules
//!
//! - `in_process` - [`SignalApi`](mesh_client::api::SignalApi) and push
//!   stream connector backed directly by a `SignalService`
//! - `mock_peer` - scriptable peer connector that records every link call
//! - `mock_media` - fake capture devices and tracks
//! - `scripted` - signal transport fed by hand from the test
//! - `fixtures` - a ready-made signal store, ids and payload builders
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mesh_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let store = TestSignalStore::new();
//!     let alice = store.join(TEST_ROOM, "A").await;
//!     let connector = MockPeerConnector::new();
//!     let devices = MockMediaDevices::new();
//!
//!     let parts = orchestrator_parts(TEST_ROOM, alice, connector, devices);
//!     // Spawn the orchestrator and drive it...
//! }
//! ```

pub mod fixtures;
pub mod in_process;
pub mod mock_media;
pub mod mock_peer;
pub mod scripted;

pub use fixtures::*;
pub use in_process::{InProcessSignalApi, InProcessStreamConnector};
pub use mock_media::{MockMediaDevices, MockTrack};
pub use mock_peer::{LinkLog, MockLinkRecord, MockPeerConnector};
pub use scripted::ChannelTransport;
pub use signal_service::clock::ManualClock;
