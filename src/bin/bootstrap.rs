//! deltaup Bootstrapper
//!
//! A tiny launcher that resolves and launches the right bundle version.
//! It never updates itself; it only reads the updater config, asks the
//! resolver which bundle is authoritative and hands over to it.
//!
//! ## Environment
//! - `DELTAUP_CONFIG` - config file (default: platform data dir)
//! - `DELTAUP_RUNNER` - program that runs bundles, e.g. an interpreter
//! - `DELTAUP_IGNORE_UPDATES` - run the original bundle, ignoring cache and pin

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use deltaup_lib::engine::config::{self, UpdaterConfig};
use deltaup_lib::engine::updater::loader::{bootstrap, LaunchContext, ProcessLoader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("deltaup_bootstrap=info,deltaup_lib=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(config_path) = config::default_config_path() else {
        eprintln!("Error: Could not determine deltaup config location");
        return ExitCode::FAILURE;
    };

    let config = match UpdaterConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Could not load {}: {}", config_path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let install_dir = config
        .original_bundle
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    // Collect args (skip our own binary name)
    let args: Vec<String> = env::args().skip(1).collect();
    let ctx = LaunchContext::new(install_dir, config.cache_dir.clone(), args);

    let loader = match env::var_os("DELTAUP_RUNNER") {
        Some(runner) => ProcessLoader::with_runner(PathBuf::from(runner)),
        None => ProcessLoader::new(),
    };
    let ignore_updates = env::var_os("DELTAUP_IGNORE_UPDATES").is_some();

    match bootstrap(&config, &loader, &ctx, ignore_updates) {
        Ok((resolved, code)) => {
            info!("Version {} exited with {}", resolved.version, code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
        Err(e) => {
            error!("Launch failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
