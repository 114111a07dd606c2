//! ---
//! atelier_section: "01-core-functionality"
//! atelier_subsection: "module"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Shared configuration and logging for Atelier services."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
//! Shared primitives for the Atelier workspace: configuration loading and
//! tracing initialisation consumed by the bus crate and binaries.

pub mod config;
pub mod logging;

pub use config::{AdapterMode, AppConfig, LoadedAppConfig, LoggingConfig, PubSubConfig};
pub use logging::{init_tracing, LogFormat};
