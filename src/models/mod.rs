mod config;
mod profile;

pub use config::{
    AppConfig, CooldownConfig, IngestConfig, SchedulerConfig, ServerConfig, UpstreamConfig,
};
pub use profile::{CheckName, CheckStatus, Profile};
