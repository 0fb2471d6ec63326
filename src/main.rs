use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use project_rag_incremental::bundle::BundleCodec;
use project_rag_incremental::config::Config;
use project_rag_incremental::manifest::Manifest;
use project_rag_incremental::paths::IncrementalLayout;
use project_rag_incremental::policy::{
    ChunkingDiagnostics, FileMetrics, ParserFallbackProfile, file_extension,
};
use project_rag_incremental::types::IndexMode;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rag-bundles")]
#[command(about = "Inspect incremental bundle caches and heavy-file decisions", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the platform config path)
    #[arg(long, global = true, env = "PROJECT_RAG_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Summarize the manifest of one build mode
    Stat {
        /// Repository cache directory (the parent of `incremental/`)
        cache_dir: PathBuf,
        #[arg(long, default_value = "code")]
        mode: IndexMode,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Read every bundle the manifest references and report failures by reason
    Verify {
        cache_dir: PathBuf,
        #[arg(long, default_value = "code")]
        mode: IndexMode,
    },

    /// Show the heavy-file decision for a file
    Policy {
        /// Repository-relative path; read from disk when sizes are not given
        path: String,
        #[arg(long, default_value = "code")]
        mode: IndexMode,
        #[arg(long)]
        bytes: Option<u64>,
        #[arg(long)]
        lines: Option<u64>,
        #[arg(long, default_value_t = 0)]
        chunks: usize,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::load_or_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

async fn read_manifest(cache_dir: &Path, mode: IndexMode) -> Result<(IncrementalLayout, Manifest)> {
    let layout = IncrementalLayout::new(cache_dir, mode);
    let bytes = tokio::fs::read(&layout.manifest_path)
        .await
        .with_context(|| format!("Failed to read {}", layout.manifest_path.display()))?;
    let manifest: Manifest = serde_json::from_slice(&bytes).context("Invalid manifest")?;
    manifest.validate_bundle_names()?;
    Ok((layout, manifest))
}

async fn stat(cache_dir: &Path, mode: IndexMode, json: bool) -> Result<()> {
    let (_, manifest) = read_manifest(cache_dir, mode).await?;
    let shards: usize = manifest
        .files
        .values()
        .map(|e| e.bundle_shard_names.len())
        .sum();
    let mut formats: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in manifest.files.values() {
        *formats.entry(entry.bundle_format.as_str()).or_default() += 1;
    }

    if json {
        let summary = serde_json::json!({
            "mode": manifest.mode,
            "schemaVersion": manifest.schema_version,
            "cacheSignature": manifest.cache_signature,
            "bundleFormat": manifest.bundle_format,
            "files": manifest.files.len(),
            "shards": shards,
            "formats": formats,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("mode:            {}", manifest.mode);
    println!("schema version:  {}", manifest.schema_version);
    println!("cache signature: {}", manifest.cache_signature);
    println!("bundle format:   {}", manifest.bundle_format);
    println!("files:           {}", manifest.files.len());
    println!("shards:          {}", shards);
    for (format, count) in formats {
        println!("  {:<8} {}", format, count);
    }
    Ok(())
}

async fn verify(config: &Config, cache_dir: &Path, mode: IndexMode) -> Result<()> {
    let (layout, manifest) = read_manifest(cache_dir, mode).await?;
    let codec = BundleCodec::new(config.codec.clone());

    let mut failures: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    for (rel, entry) in &manifest.files {
        if let Err(failure) = codec
            .read_shards(&layout.bundle_dir, &entry.bundle_shard_names, entry.bundle_format)
            .await
        {
            failures
                .entry(failure.reason_code())
                .or_default()
                .push(rel.clone());
        }
    }

    let failed: usize = failures.values().map(Vec::len).sum();
    println!(
        "verified {} bundle(s), {} unreadable",
        manifest.files.len(),
        failed
    );
    for (reason, files) in &failures {
        println!("  {} ({})", reason, files.len());
        for file in files.iter().take(10) {
            println!("    {}", file);
        }
    }
    if failed > 0 {
        bail!("{} bundle(s) failed verification", failed);
    }
    Ok(())
}

async fn policy(
    config: &Config,
    path: &str,
    mode: IndexMode,
    bytes: Option<u64>,
    lines: Option<u64>,
    chunks: usize,
) -> Result<()> {
    let (bytes, lines) = match (bytes, lines) {
        (Some(bytes), Some(lines)) => (bytes, lines),
        _ => {
            let content = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path))?;
            let line_count = content.iter().filter(|b| **b == b'\n').count() as u64;
            (
                bytes.unwrap_or(content.len() as u64),
                lines.unwrap_or(line_count),
            )
        }
    };
    let extension = file_extension(path);
    let metrics = FileMetrics {
        rel_path: path,
        extension,
        bytes,
        lines,
        chunks,
    };

    let decision = config.heavy_file_policy().evaluate(mode, &metrics);
    let profile = ParserFallbackProfile::resolve(
        mode,
        decision.downshift,
        decision.skip_tokenization,
        &ChunkingDiagnostics::default(),
    );
    let report = serde_json::json!({
        "path": path,
        "mode": mode,
        "bytes": bytes,
        "lines": lines,
        "chunks": chunks,
        "decision": decision,
        "parser": {
            "mode": profile.mode().as_str(),
            "reason": profile.reason_code(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Stat {
            cache_dir,
            mode,
            json,
        } => stat(&cache_dir, mode, json).await,
        Command::Verify { cache_dir, mode } => verify(&config, &cache_dir, mode).await,
        Command::Policy {
            path,
            mode,
            bytes,
            lines,
            chunks,
        } => policy(&config, &path, mode, bytes, lines, chunks).await,
    }
}
