//! sindri library
//!
//! This library implements a host-side flasher for Samsung devices in
//! Odin download mode: PIT handling, firmware package expansion, and a
//! lock-step multi-device flash engine over USB or TCP.
//!
//! # Architecture
//!
//! The library is organized into layered architecture:
//!
//! - [`domain`]: Core data formats (partition information table)
//! - [`application`]: Use cases — planning, checksum verification, the
//!   multi-device flash coordinator
//! - [`infrastructure`]: Technology-specific implementations
//!   (transports, archive/LZ4 readers, the Odin wire protocol)
//! - [`presentation`]: User interfaces (CLI)
//! - [`error`]: Error types and handling

pub mod application;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod presentation;

pub use error::{Error, Result};
