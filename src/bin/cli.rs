//! deltaup CLI - Main entry point for CLI binary
//!
//! This binary provides the `deltaup` tool for publishing signed update
//! sites and applying them to a local bundle cache.

use anyhow::{anyhow, Context};
use clap::Parser;
use deltaup_lib::engine::{
    cli::{Cli, Commands, OutputFormat},
    config::UpdaterConfig,
    keystore::{KdfParams, KeyStore},
    updater::{
        delta::GdiffEngine,
        manifest::SignedManifest,
        publish,
        signature::PrivateKey,
        UpdatePhase, Updater, VersionResolver,
    },
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug_log);

    if let Err(e) = run_cli(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "deltaup=debug,deltaup_lib=debug" } else { "deltaup=info,deltaup_lib=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let json_output = cli.format == OutputFormat::Json;
    let config_path = cli.get_config_path();

    match cli.command {
        Commands::Keygen { out, password_file } => {
            cmd_keygen(&out, password_file.as_deref(), json_output)
        }
        Commands::Prepare { workdir, urls, keys, password_file, gzip_from, ext } => cmd_prepare(
            &workdir,
            &urls,
            &keys,
            password_file.as_deref(),
            gzip_from,
            &ext,
            json_output,
        ),
        Commands::PrintIndex { file } => cmd_print_index(&file, json_output),
        Commands::Update => cmd_update(load_config(config_path)?, json_output),
        Commands::Resolve => cmd_resolve(&load_config(config_path)?, json_output),
        Commands::Pin { version } => cmd_pin(&load_config(config_path)?, Some(version), json_output),
        Commands::Unpin => cmd_pin(&load_config(config_path)?, None, json_output),
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<UpdaterConfig> {
    let path = path.ok_or_else(|| anyhow!("Could not determine config path; pass --config"))?;
    UpdaterConfig::load(&path).with_context(|| format!("loading {}", path.display()))
}

fn resolver(config: &UpdaterConfig) -> VersionResolver {
    VersionResolver::new(&config.cache_dir, config.bundle_extension())
}

const PASSWORD_ENV_VAR: &str = "DELTAUP_KEY_PASSWORD";

/// Password from --password-file, then $DELTAUP_KEY_PASSWORD, then a prompt
fn read_password(
    password_file: Option<&Path>,
    prompt: &str,
    confirm: bool,
) -> anyhow::Result<Zeroizing<String>> {
    let password = if let Some(path) = password_file {
        let text = Zeroizing::new(
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?,
        );
        Zeroizing::new(text.trim_end_matches(['\r', '\n']).to_string())
    } else if let Ok(value) = std::env::var(PASSWORD_ENV_VAR) {
        Zeroizing::new(value)
    } else {
        let first = prompt_line(prompt)?;
        if confirm && *first != *prompt_line("Repeat the password: ")? {
            anyhow::bail!("Passwords did not match");
        }
        first
    };

    if password.is_empty() {
        anyhow::bail!("Empty password");
    }
    Ok(password)
}

fn prompt_line(prompt: &str) -> anyhow::Result<Zeroizing<String>> {
    eprint!("{}", prompt);
    io::stderr().flush()?;
    let mut line = Zeroizing::new(String::new());
    io::stdin().read_line(&mut line)?;
    Ok(Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string()))
}

fn cmd_keygen(out: &Path, password_file: Option<&Path>, json: bool) -> anyhow::Result<()> {
    if out.exists() {
        anyhow::bail!("{} already exists", out.display());
    }
    let password = read_password(password_file, "Password for the new key: ", true)?;
    let key = PrivateKey::generate();
    let store = KeyStore::seal(&key, &password, KdfParams::default())?;
    store.save(out).with_context(|| format!("writing {}", out.display()))?;

    if json {
        println!("{}", serde_json::json!({
            "public_key": store.public_key,
            "key_file": out.display().to_string(),
        }));
    } else {
        println!("✅ Encrypted key written to {}", out.display());
        println!("   Public key: {}", store.public_key);
    }
    Ok(())
}

fn read_key(path: &Path, password_file: Option<&Path>) -> anyhow::Result<PrivateKey> {
    let store = KeyStore::load(path).with_context(|| format!("reading {}", path.display()))?;
    let prompt = format!("Password for {}: ", path.display());
    let password = read_password(password_file, &prompt, false)?;
    store.open(&password).with_context(|| format!("unlocking {}", path.display()))
}

fn cmd_prepare(
    workdir: &Path,
    urls: &[String],
    key_files: &[PathBuf],
    password_file: Option<&Path>,
    gzip_from: Option<u32>,
    ext: &str,
    json: bool,
) -> anyhow::Result<()> {
    let keys = key_files
        .iter()
        .map(|path| read_key(path, password_file))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let report = publish::prepare(workdir, urls, &keys, gzip_from, ext, &GdiffEngine::default())?;

    if json {
        let patches: Vec<_> = report
            .patches
            .iter()
            .map(|p| {
                serde_json::json!({
                    "version": p.version,
                    "path": p.path.display().to_string(),
                    "patch_hash": p.patch_hash.to_hex(),
                    "patch_size": p.patch_size,
                    "gzipped": p.gzipped,
                })
            })
            .collect();
        println!("{}", serde_json::json!({
            "success": true,
            "index": report.index_path.display().to_string(),
            "processed": report.processed_dir.display().to_string(),
            "patches": patches,
            "signers": keys.iter().map(|k| k.public_key().to_hex()).collect::<Vec<_>>(),
        }));
    } else {
        for patch in &report.patches {
            println!("{}: {}", patch.path.display(), patch.patch_hash);
        }
        println!("✅ Wrote {}", report.index_path.display());
        println!("   Normalised bundles in {}", report.processed_dir.display());
        for key in &keys {
            println!("   Signed with public key {}", key.public_key());
        }
    }
    Ok(())
}

fn cmd_print_index(file: &Path, json: bool) -> anyhow::Result<()> {
    let raw = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let signed = SignedManifest::from_bytes(&raw)?;

    if json {
        let manifest = deltaup_lib::engine::updater::Manifest::from_bytes(&signed.manifest)?;
        let entries: Vec<_> = manifest
            .entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "version": e.version,
                    "urls": e.urls,
                    "pre_hash": e.pre_hash.to_hex(),
                    "patch_hash": e.patch_hash.to_hex(),
                    "post_hash": e.post_hash.to_hex(),
                    "patch_size": e.patch_size,
                    "gzipped": e.gzipped,
                    "descriptions": e.descriptions,
                })
            })
            .collect();
        println!("{}", serde_json::json!({
            "format_version": manifest.format_version,
            "signatures": signed.signatures,
            "entries": entries,
        }));
    } else {
        print!("{}", publish::describe_index(&signed)?);
    }
    Ok(())
}

#[tokio::main]
async fn cmd_update(config: UpdaterConfig, json: bool) -> anyhow::Result<()> {
    let updater = Updater::new(config)?.resolve_baseline()?;
    let mut phases = updater.subscribe();

    if !json {
        tokio::spawn(async move {
            while phases.changed().await.is_ok() {
                let phase = phases.borrow_and_update().clone();
                if let UpdatePhase::Downloading { version, progress, .. } = phase {
                    eprint!("\r   Downloading {}: {:5.1}%", version, progress);
                }
            }
        });
    }

    let summary = updater.spawn().await??;

    if json {
        println!("{}", serde_json::to_string(&summary)?);
    } else if summary.applied.is_empty() {
        println!("✅ Up to date at version {}", summary.highest_version);
    } else {
        eprintln!();
        println!("✅ Updated to version {}", summary.highest_version);
        if let Some(notes) = summary.descriptions.get("en") {
            println!("   {}", notes.summary);
        }
    }
    Ok(())
}

fn cmd_resolve(config: &UpdaterConfig, json: bool) -> anyhow::Result<()> {
    let resolved = resolver(config).resolve(config.current_version, &config.original_bundle)?;
    if json {
        println!("{}", serde_json::to_string(&resolved)?);
    } else {
        println!("Version {} ({:?})", resolved.version, resolved.source);
        println!("   {}", resolved.path.display());
    }
    Ok(())
}

fn cmd_pin(config: &UpdaterConfig, version: Option<u32>, json: bool) -> anyhow::Result<()> {
    let resolver = resolver(config);
    match version {
        Some(v) => resolver.pin(v)?,
        None => resolver.unpin()?,
    }
    if json {
        println!("{}", serde_json::json!({ "success": true, "pinned": version }));
    } else {
        match version {
            Some(v) => println!("✅ Pinned to version {}", v),
            None => println!("✅ Unpinned"),
        }
    }
    Ok(())
}
