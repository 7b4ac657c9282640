//! ftlink library
//!
//! Two-channel file transfer: commands are negotiated on a control
//! connection, payloads travel on a separate per-command data connection.

pub mod checksum;
pub mod cli;
pub mod config;
pub mod error;
pub mod log;
pub mod logger;
pub mod net_async;
pub mod payload;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
