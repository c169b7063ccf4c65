//! Bluetooth communication layer.
//!
//! This module provides the platform transport, device discovery and the
//! connection lifecycle built on top of it.

pub mod bluez;
pub mod guard;
pub mod liveness;
pub mod manager;
pub mod reconnect;
pub mod scanner;
pub mod session;
pub mod transport;
