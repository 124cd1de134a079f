//! Path and host helpers

pub mod paths;
pub mod system;
