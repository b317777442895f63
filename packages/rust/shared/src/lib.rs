//! Shared types, error model, and configuration for batchscout.
//!
//! This crate is the foundation depended on by all other batchscout crates.
//! It provides:
//! - [`BatchScoutError`] and [`PhaseError`]: the error model
//! - Domain value types ([`JobId`], [`JobInput`], [`PhaseName`], [`Details`], [`Usage`])
//! - Configuration ([`AppConfig`], [`BatchConfig`], [`CrawlConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BatchConfig, BatchSection, CrawlConfig, CrawlSection, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{BatchScoutError, PhaseError, Result};
pub use types::{
    DetailValue, Details, JobError, JobId, JobInput, JobStatus, PhaseName, PhaseStatus, Usage,
};
