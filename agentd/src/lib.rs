pub mod cli;
pub mod config;
pub mod dentry;
pub mod driver;
pub mod error;
pub mod event;
pub mod kernel_maps;
pub mod load_controller;
pub mod metrics;
pub mod mount;
pub mod pool;
pub mod reorder;
pub mod resolver;
pub mod ring;
pub mod sink;

pub use config::{Config, CoreConfig, LoggingConfig, RuntimeConfig};
pub use error::{Classify, CoreError, Disposition, ResolutionShortfall};
pub use metrics::Metrics;
