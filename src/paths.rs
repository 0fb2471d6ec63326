/// Centralized path computation for the incremental cache
///
/// Covers platform default directories plus the on-disk layout of one mode:
/// `incremental/<mode>/manifest.json` and `incremental/<mode>/files/<shard>`.
use crate::types::{BundleFormat, IndexMode};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

const APP_FOLDER: &str = "project-rag";

/// Number of hex characters kept from the path digest in shard names
const SHARD_NAME_HASH_LEN: usize = 40;

/// Suffix of the append-only patch log next to a JSON bundle
pub const PATCH_SIDECAR_SUFFIX: &str = ".patch.jsonl";

/// Platform-agnostic path utilities
pub struct PlatformPaths;

impl PlatformPaths {
    /// Get the appropriate cache directory for the current platform
    pub fn cache_dir() -> PathBuf {
        dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Get the appropriate config directory for the current platform
    pub fn config_dir() -> PathBuf {
        dirs::config_dir().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Default root under which per-repository caches live
    ///
    /// Returns: {cache_dir}/project-rag/repos
    pub fn default_cache_root() -> PathBuf {
        Self::cache_dir().join(APP_FOLDER).join("repos")
    }

    /// Get default config file path
    ///
    /// Returns: {config_dir}/project-rag/incremental.toml
    pub fn default_config_path() -> PathBuf {
        Self::config_dir().join(APP_FOLDER).join("incremental.toml")
    }

    /// Cache directory for one repository, keyed by a digest of its root path
    pub fn repo_cache_dir(cache_root: &Path, repo_root: &Path) -> PathBuf {
        let digest = hex_digest(repo_root.to_string_lossy().as_bytes());
        cache_root.join(&digest[..16])
    }
}

/// Directory layout of one build mode's incremental cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalLayout {
    pub incremental_dir: PathBuf,
    pub bundle_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub lock_path: PathBuf,
}

impl IncrementalLayout {
    pub fn new(repo_cache_root: &Path, mode: IndexMode) -> Self {
        let incremental_dir = repo_cache_root.join("incremental").join(mode.as_str());
        Self {
            bundle_dir: incremental_dir.join("files"),
            manifest_path: incremental_dir.join("manifest.json"),
            lock_path: incremental_dir.join("build.lock"),
            incremental_dir,
        }
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Normalize a repository-relative path: `/` separators, no leading `./` or `/`
pub fn normalize_rel_path(rel: &str) -> String {
    let mut normalized = rel.replace('\\', "/");
    while let Some(stripped) = normalized.strip_prefix("./") {
        normalized = stripped.to_string();
    }
    normalized.trim_start_matches('/').to_string()
}

/// Content-derived shard file name for a file's bundle.
///
/// Shard 0 is `<digest>.<ext>`; later shards insert `.partNNNN` before the extension.
pub fn bundle_file_name(rel: &str, format: BundleFormat, shard_index: usize) -> String {
    let digest = hex_digest(normalize_rel_path(rel).as_bytes());
    let stem = &digest[..SHARD_NAME_HASH_LEN];
    if shard_index == 0 {
        format!("{}.{}", stem, format.extension())
    } else {
        format!("{}.part{:04}.{}", stem, shard_index, format.extension())
    }
}

/// Path of the patch sidecar belonging to a bundle shard
pub fn patch_sidecar_path(bundle_path: &Path) -> PathBuf {
    let mut name = bundle_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PATCH_SIDECAR_SUFFIX);
    bundle_path.with_file_name(name)
}

/// A bundle name is safe to join onto the bundle directory only when it is a bare
/// file name
pub fn is_bare_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Lexically resolve `.` and `..` without touching the filesystem
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `rel` against `root` and return it only if it stays inside `root`
pub fn resolve_within(root: &Path, rel: &str) -> Option<PathBuf> {
    let root = lexical_normalize(root);
    let candidate = lexical_normalize(&root.join(rel));
    if candidate.starts_with(&root) {
        Some(candidate)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let layout = IncrementalLayout::new(Path::new("/cache/repo"), IndexMode::Prose);
        assert_eq!(
            layout.incremental_dir,
            PathBuf::from("/cache/repo/incremental/prose")
        );
        assert_eq!(
            layout.bundle_dir,
            PathBuf::from("/cache/repo/incremental/prose/files")
        );
        assert_eq!(
            layout.manifest_path,
            PathBuf::from("/cache/repo/incremental/prose/manifest.json")
        );
    }

    #[test]
    fn test_normalize_rel_path() {
        assert_eq!(normalize_rel_path("src\\lib\\a.rs"), "src/lib/a.rs");
        assert_eq!(normalize_rel_path("./src/a.rs"), "src/a.rs");
        assert_eq!(normalize_rel_path("/src/a.rs"), "src/a.rs");
        assert_eq!(normalize_rel_path("src/a.rs"), "src/a.rs");
    }

    #[test]
    fn test_bundle_file_name() {
        let first = bundle_file_name("src/x.js", BundleFormat::Json, 0);
        let second = bundle_file_name("src/x.js", BundleFormat::Json, 1);
        let binary = bundle_file_name("src/x.js", BundleFormat::Binary, 0);

        assert!(first.ends_with(".json"));
        assert_eq!(first.len(), SHARD_NAME_HASH_LEN + ".json".len());
        assert!(second.ends_with(".part0001.json"));
        assert_eq!(&first[..40], &second[..40]);
        assert!(binary.ends_with(".bin"));
        assert!(is_bare_file_name(&first));

        // Separator style must not change the name
        assert_eq!(first, bundle_file_name("src\\x.js", BundleFormat::Json, 0));
        assert_ne!(first, bundle_file_name("src/y.js", BundleFormat::Json, 0));
    }

    #[test]
    fn test_patch_sidecar_path() {
        let path = patch_sidecar_path(Path::new("/b/files/abc.json"));
        assert_eq!(path, PathBuf::from("/b/files/abc.json.patch.jsonl"));
    }

    #[test]
    fn test_is_bare_file_name() {
        assert!(is_bare_file_name("abc.json"));
        assert!(!is_bare_file_name("../abc.json"));
        assert!(!is_bare_file_name("dir/abc.json"));
        assert!(!is_bare_file_name("dir\\abc.json"));
        assert!(!is_bare_file_name(".."));
        assert!(!is_bare_file_name(""));
    }

    #[test]
    fn test_resolve_within() {
        let root = Path::new("/out/index");
        assert_eq!(
            resolve_within(root, "pieces/a.json"),
            Some(PathBuf::from("/out/index/pieces/a.json"))
        );
        assert_eq!(
            resolve_within(root, "pieces/../b.json"),
            Some(PathBuf::from("/out/index/b.json"))
        );
        assert!(resolve_within(root, "../escape.json").is_none());
        assert!(resolve_within(root, "/etc/passwd").is_none());
        assert!(resolve_within(Path::new("/out/index"), "../index-other/x").is_none());
    }

    #[test]
    fn test_repo_cache_dir_stable() {
        let a = PlatformPaths::repo_cache_dir(Path::new("/c"), Path::new("/repo/a"));
        let b = PlatformPaths::repo_cache_dir(Path::new("/c"), Path::new("/repo/a"));
        let c = PlatformPaths::repo_cache_dir(Path::new("/c"), Path::new("/repo/b"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
