//! Configuration Module
//!
//! Configuration loading for the multiplexer and the service binary.

mod settings;

pub use settings::{
    ConfigError, FeedSettings, MultiplexerConfig, MultiplexerSettings, ServerSettings,
    ServiceConfig,
};
