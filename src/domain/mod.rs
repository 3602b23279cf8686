//! Domain Layer - Core Data Formats
//!
//! Protocol-independent data that the rest of the system is built
//! around: the partition information table and its binary codec.

pub mod pit;

pub use pit::{Partition, PitTable};
