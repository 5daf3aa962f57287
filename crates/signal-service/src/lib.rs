//! Signal Store Service
//!
//! Durable, room-scoped mailbox of WebRTC signaling messages for the
//! Tabletop Mesh peer mesh.
//!
//! # Responsibilities
//!
//! - Accept signals from live room members (direct or broadcast addressing)
//! - Serve incremental reads (`since` watermark) as two targeted range reads
//! - Fan newly stored signals out to open push streams (at-most-once)
//! - Delete every signal older than the TTL on a fixed schedule
//!
//! # Architecture
//!
//! - [`store::SignalService`] enforces auth, addressing and membership rules
//!   and owns the storage seam ([`store::SignalRepository`])
//! - [`presence::PresenceDirectory`] answers "is this peer a live member now"
//! - [`hub::SignalHub`] broadcasts stored signals to stream subscribers
//! - [`tasks::expiry`] runs the TTL sweep until cancelled
//!
//! Storage backends: in-memory (single instance, tests) and Redis (sorted sets
//! per mailbox).

pub mod clock;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod hub;
pub mod observability;
pub mod presence;
pub mod routes;
pub mod store;
pub mod tasks;
