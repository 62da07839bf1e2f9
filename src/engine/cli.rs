//! deltaup CLI Module
//! Command-line interface for publishing and applying updates

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::config;

#[derive(Parser, Debug)]
#[command(name = "deltaup")]
#[command(author = "deltaup Team")]
#[command(version)]
#[command(about = "Signed, delta-based self-update for application bundles", long_about = None)]
pub struct Cli {
    /// Updater config file (defaults to $DELTAUP_CONFIG, then the platform data dir)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Log at debug level
    #[arg(long, global = true)]
    pub debug_log: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a signing key and store it encrypted under a password
    Keygen {
        /// Key store file to create
        #[arg(short, long)]
        out: PathBuf,

        /// Read the password from this file instead of prompting
        #[arg(long)]
        password_file: Option<PathBuf>,
    },

    /// Compute patches for <WORKDIR>/builds and write a signed index to <WORKDIR>/site
    Prepare {
        /// Working directory containing builds/
        workdir: PathBuf,

        /// Base URL the patches will be served from; repeatable
        #[arg(long = "url", required = true)]
        urls: Vec<String>,

        /// Encrypted key store made by `keygen`; repeatable
        #[arg(long = "key", required = true)]
        keys: Vec<PathBuf>,

        /// Read the key store password from this file instead of prompting
        #[arg(long)]
        password_file: Option<PathBuf>,

        /// Gzip patches for this version and later
        #[arg(long)]
        gzip_from: Option<u32>,

        /// Bundle file extension
        #[arg(long, default_value = "jar")]
        ext: String,
    },

    /// Print the contents of an index file
    PrintIndex {
        /// Path to a signed index
        file: PathBuf,
    },

    /// Fetch, verify and apply available updates
    Update,

    /// Show which bundle would be launched
    Resolve,

    /// Pin the launched bundle to a version
    Pin {
        version: u32,
    },

    /// Remove the version pin
    Unpin,
}

impl Cli {
    pub fn get_config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(config::default_config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prepare() {
        let cli = Cli::parse_from([
            "deltaup",
            "prepare",
            "work",
            "--url",
            "https://a.example.com",
            "--url",
            "https://b.example.com",
            "--key",
            "k1.key",
            "--gzip-from",
            "3",
            "--password-file",
            "pw.txt",
        ]);
        match cli.command {
            Commands::Prepare { urls, keys, password_file, gzip_from, ext, .. } => {
                assert_eq!(urls.len(), 2);
                assert_eq!(keys, vec![PathBuf::from("k1.key")]);
                assert_eq!(password_file, Some(PathBuf::from("pw.txt")));
                assert_eq!(gzip_from, Some(3));
                assert_eq!(ext, "jar");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["deltaup", "pin", "4", "--format", "json", "-c", "u.json", "--debug-log"]);
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(cli.debug_log);
        assert_eq!(cli.get_config_path(), Some(PathBuf::from("u.json")));
        assert!(matches!(cli.command, Commands::Pin { version: 4 }));
    }

    #[test]
    fn test_keygen_requires_out() {
        assert!(Cli::try_parse_from(["deltaup", "keygen"]).is_err());
        let cli = Cli::parse_from(["deltaup", "keygen", "--out", "signer.key"]);
        match cli.command {
            Commands::Keygen { out, password_file } => {
                assert_eq!(out, PathBuf::from("signer.key"));
                assert!(password_file.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_prepare_requires_url() {
        assert!(Cli::try_parse_from(["deltaup", "prepare", "work", "--key", "k"]).is_err());
    }
}
