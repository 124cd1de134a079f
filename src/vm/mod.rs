pub mod args;
pub mod creator;
pub mod firmware;
pub mod manager;
pub mod store;
pub mod supervisor;
