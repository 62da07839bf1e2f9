//! Loader
//!
//! Hands control to a resolved bundle. Everything a launched bundle needs to
//! know about where it came from travels in an explicit [`LaunchContext`].

use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::info;

use super::error::UpdateError;
use super::version_manager::{BundleSource, ResolvedBundle, VersionResolver};
use crate::engine::config::UpdaterConfig;

pub const ENV_INSTALL_DIR: &str = "DELTAUP_INSTALL_DIR";
pub const ENV_CACHE_DIR: &str = "DELTAUP_CACHE_DIR";
pub const ENV_BUNDLE: &str = "DELTAUP_BUNDLE";
pub const ENV_ENTRY_POINT: &str = "DELTAUP_ENTRY_POINT";

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} was terminated by a signal")]
    Killed(PathBuf),
    #[error(transparent)]
    Resolve(#[from] UpdateError),
}

/// Immutable launch context passed across the reload boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchContext {
    pub install_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub args: Vec<String>,
}

impl LaunchContext {
    pub fn new(install_dir: PathBuf, cache_dir: PathBuf, args: Vec<String>) -> Self {
        Self {
            install_dir,
            cache_dir,
            args,
        }
    }
}

pub trait Loader {
    /// Run `entry_point` of `bundle` to completion, returning its exit code
    fn load_and_run(
        &self,
        bundle: &Path,
        entry_point: &str,
        ctx: &LaunchContext,
    ) -> Result<i32, LoaderError>;

    /// Re-launch the host executable, e.g. after an update landed
    fn restart_process(&self, executable: &Path, ctx: &LaunchContext) -> Result<i32, LoaderError>;
}

/// Runs bundles as child processes, directly or through a runner program
#[derive(Debug, Clone, Default)]
pub struct ProcessLoader {
    runner: Option<PathBuf>,
}

impl ProcessLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch bundles as `<runner> <bundle> <args...>`
    pub fn with_runner(runner: PathBuf) -> Self {
        Self {
            runner: Some(runner),
        }
    }

    fn wait(program: &Path, command: &mut Command) -> Result<i32, LoaderError> {
        let status = command.status().map_err(|source| LoaderError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;
        status
            .code()
            .ok_or_else(|| LoaderError::Killed(program.to_path_buf()))
    }
}

impl Loader for ProcessLoader {
    fn load_and_run(
        &self,
        bundle: &Path,
        entry_point: &str,
        ctx: &LaunchContext,
    ) -> Result<i32, LoaderError> {
        let (program, mut command) = match &self.runner {
            Some(runner) => {
                let mut command = Command::new(runner);
                command.arg(bundle);
                (runner.as_path(), command)
            }
            None => (bundle, Command::new(bundle)),
        };
        command
            .args(&ctx.args)
            .env(ENV_INSTALL_DIR, &ctx.install_dir)
            .env(ENV_CACHE_DIR, &ctx.cache_dir)
            .env(ENV_BUNDLE, bundle)
            .env(ENV_ENTRY_POINT, entry_point);
        info!("Launching {} ({})", bundle.display(), entry_point);
        Self::wait(program, &mut command)
    }

    fn restart_process(&self, executable: &Path, ctx: &LaunchContext) -> Result<i32, LoaderError> {
        info!("Restarting {}", executable.display());
        let mut command = Command::new(executable);
        command
            .args(&ctx.args)
            .env(ENV_INSTALL_DIR, &ctx.install_dir)
            .env(ENV_CACHE_DIR, &ctx.cache_dir);
        Self::wait(executable, &mut command)
    }
}

/// Resolve the bundle to run and hand it to `loader`.
///
/// With `ignore_updates` the original bundle runs regardless of cache or pin.
pub fn bootstrap(
    config: &UpdaterConfig,
    loader: &dyn Loader,
    ctx: &LaunchContext,
    ignore_updates: bool,
) -> Result<(ResolvedBundle, i32), LoaderError> {
    let resolved = if ignore_updates {
        info!("Ignoring updates, running the original bundle");
        ResolvedBundle {
            version: config.current_version,
            path: config.original_bundle.clone(),
            source: BundleSource::Original,
        }
    } else {
        VersionResolver::new(&config.cache_dir, config.bundle_extension())
            .resolve(config.current_version, &config.original_bundle)?
    };
    let code = loader.load_and_run(&resolved.path, &config.entry_point, ctx)?;
    Ok((resolved, code))
}
