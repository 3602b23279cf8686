//! Infrastructure Layer
//!
//! Technology-specific implementations: transports, archive and LZ4
//! readers, the Odin wire protocol, and platform glue.

pub mod io;
pub mod odin;
pub mod platform;
pub mod transport;
pub mod usb;
