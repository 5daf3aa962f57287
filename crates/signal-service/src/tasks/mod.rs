//! Background tasks for the Signal Service.

pub mod expiry;

pub use expiry::{start_signal_expiry, ExpiryConfig};
