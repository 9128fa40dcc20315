// Instance data model: descriptions, specs and lifecycle states.
pub mod config;
pub mod state;

pub use config::{NetworkInterface, VmDescription, VmImage};
pub use state::{VmSpecs, VmState};
