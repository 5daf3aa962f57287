//! Mesh client for Tabletop Mesh.
//!
//! Every participant of a room holds a direct peer connection to every other
//! participant. This crate drives that mesh from one peer's point of view:
//!
//! - [`api`] - signal store client (`sendSignal` / `listSignals`)
//! - [`transport`] - signal delivery, watermark pull or push stream
//! - [`orchestrator`] - per-peer connection state machines and mesh reconciliation
//! - [`media`] - local capture, mute and device switching
//! - [`session`] - one orchestrator per (local peer, room) scope
//!
//! Media engines and NAT traversal are not implemented here; they plug in
//! through [`orchestrator::PeerConnector`] and [`media::MediaDevices`].

#![warn(clippy::pedantic)]

pub mod api;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod orchestrator;
pub mod session;
pub mod transport;

pub use config::{MeshConfig, TransportKind};
pub use errors::MeshError;
