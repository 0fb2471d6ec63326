//! # Project RAG Incremental - Bundle Cache and Heavy-File Policy
//!
//! The per-file analysis cache behind repository indexing. Parsing, tokenizing and
//! relation extraction are expensive, so their results are stored as per-file
//! "bundles" and reused across builds for as long as the source file is unchanged.
//!
//! ## Overview
//!
//! For each file, the heavy-file policy decides how much analysis to spend on it.
//! Upstream analyzers produce chunk records, which the bundle codec writes next to a
//! manifest of file fingerprints. The next build reconciles the manifest against
//! the working tree to decide what to reuse, and a cross-file writeback pass patches
//! bundles whose relation data changed.
//!
//! ## Key Features
//!
//! - **Heavy-File Policy**: size/path driven downshift, tokenization skip, chunk
//!   coalescing and parser fallback profiles
//! - **Two Wire Formats**: JSON with append-only patch sidecars, or a checksummed
//!   binary envelope
//! - **Sharding**: oversized bundles split into ordered shards
//! - **Safe Reuse**: size/mtime fingerprints with content-hash verification for
//!   coarse timestamps
//! - **Adaptive Writeback**: CPU-load aware worker pool with hot-file priority
//!
//! ## Architecture
//!
//! ```text
//!   chunk records ──► policy ──► BundleCodec ──► incremental/<mode>/files/
//!                                    │
//!                                    ▼
//!                         IncrementalState (manifest.json, build.lock)
//!                                    │
//!              next build ──► reconcile ──► reuse / rebuild
//!                                    │
//!            cross-file relations ──► writeback ──► patch or rewrite
//! ```
//!
//! ## Modules
//!
//! - [`policy`]: Heavy-file thresholds, parser fallback and chunk coalescing
//! - [`bundle`]: Bundle codec, binary envelope, patches and payload offload
//! - [`manifest`]: Manifest format and per-build incremental state
//! - [`reconcile`]: Per-file and whole-index reuse decisions
//! - [`writeback`]: Cross-file bundle refresh with adaptive concurrency
//! - [`config`]: Configuration management with environment variable support
//! - [`types`]: Bundle, chunk and file types
//! - [`error`]: Error types and result aliases
//! - [`paths`]: Cache layout and path normalization
//! - [`fs_lock`]: Cross-process build lock
//!
//! ## Usage Example
//!
//! ```no_run
//! use project_rag_incremental::config::Config;
//! use project_rag_incremental::manifest::IncrementalState;
//! use project_rag_incremental::reconcile::read_cached_bundle;
//! use project_rag_incremental::types::{FileEntry, IndexMode};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::new()?;
//!     let mut state =
//!         IncrementalState::load_or_init(Path::new("/tmp/cache/repo"), IndexMode::Code, &config, None)
//!             .await?;
//!
//!     let file = FileEntry::from_disk("src/main.rs", "/work/repo/src/main.rs");
//!     match read_cached_bundle(&state, &file).await {
//!         Ok(bundle) => println!("reused {} chunks", bundle.chunks.len()),
//!         Err(miss) => println!("recompute: {}", miss),
//!     }
//!
//!     state.prune_and_persist(["src/main.rs"]).await?;
//!     Ok(())
//! }
//! ```

/// Bundle codec: JSON and binary wire formats, patches, sharding
pub mod bundle;

/// Configuration management with environment variable overrides
pub mod config;

/// Error types and utilities
pub mod error;

/// Filesystem build lock for cross-process coordination
pub mod fs_lock;

/// Incremental manifest and per-build cache state
pub mod manifest;

/// Cache layout and path normalization utilities
pub mod paths;

/// Heavy-file policy engine
pub mod policy;

/// Cache reconciliation: per-file and whole-index reuse
pub mod reconcile;

/// Core bundle, chunk and file types
pub mod types;

/// Cross-file bundle writeback
pub mod writeback;
