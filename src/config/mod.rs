//! Configuration management
//!
//! Node address, bootstrap peer, data locations and mining settings.

pub mod settings;

pub use settings::Config;
