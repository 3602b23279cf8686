//! Odin download-mode protocol
//!
//! Frame layout in [`wire`], the command layer in [`commands`], and the
//! PIT transfer helpers in [`pit_transfer`].

pub mod commands;
pub mod pit_transfer;
pub mod wire;

pub use commands::{InitTargetInfo, OdinLink, ProtocolVersion, ShutdownMode};
