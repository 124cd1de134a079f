//! VM configuration model, defaults and validation

pub mod constants;
pub mod defaults;
pub mod schema;
pub mod settings;
pub mod validate;
