//! Domain layer - identifiers, records, and port definitions
//!
//! This module defines the core data model and the traits (ports) that
//! adapters implement.

pub mod model;
pub mod ports;
pub mod tags;

pub use model::*;
pub use ports::*;
pub use tags::*;
