// deltaup Engine - Core module structure
pub mod cli;
pub mod config;
pub mod keystore;
pub mod locks;
pub mod updater;

pub use config::UpdaterConfig;
pub use updater::{Updater, VersionResolver};
