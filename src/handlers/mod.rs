pub mod config;

pub use config::{get_config, update_config};
