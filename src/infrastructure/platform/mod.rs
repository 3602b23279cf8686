//! Platform glue: process-wide single-instance lock and the signal
//! shield that keeps a flash run alive through Ctrl+C.

pub mod signal_shield;
pub mod single_instance;

pub use signal_shield::SignalShield;
pub use single_instance::SingleInstanceLock;
