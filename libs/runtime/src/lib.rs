//! Ambient runtime for applications built on `ctxkit`: layered configuration,
//! logging setup and seeding a root context from configuration.

pub mod bootstrap;
pub mod config;
pub mod logging;

pub use bootstrap::build_context;
pub use config::{
    default_logging_config, AppConfig, CliArgs, ContextConfig, LogSection, LoggingConfig,
};
pub use logging::init_logging;
