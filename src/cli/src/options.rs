//! Command-line option groups shared by the subcommands.

use clap::Args;
use tokio::sync::mpsc;

/// Which manifest files to resolve.
#[derive(Debug, Clone, Args)]
pub struct FilenameOptions {
    /// Manifest file or directory to resolve; `-` reads stdin.
    #[arg(short = 'f', long = "filename", value_name = "FILE", required = true)]
    pub filenames: Vec<String>,

    /// Process directories recursively.
    #[arg(short = 'R', long = "recursive")]
    pub recursive: bool,
}

/// How published images are named.
#[derive(Debug, Clone, Args, Default)]
pub struct NameOptions {
    /// Use the full reference path in image names instead of the last
    /// segment.
    #[arg(short = 'P', long = "preserve-import-paths")]
    pub preserve_import_paths: bool,
}

/// Daemon vs registry publishing.
#[derive(Debug, Clone, Args, Default)]
pub struct LocalOptions {
    /// Side-load images into the local container daemon instead of
    /// pushing to a registry.
    #[arg(short = 'L', long = "local")]
    pub local: bool,

    /// Allow pushing to an insecure (HTTP) registry.
    #[arg(long = "insecure-registry")]
    pub insecure_registry: bool,
}

/// Extra tags applied to every published image.
#[derive(Debug, Clone, Args, Default)]
pub struct TagsOptions {
    /// Additional tags to apply, repeatable.
    #[arg(short = 't', long = "tags", value_name = "TAG")]
    pub tags: Vec<String>,
}

/// How builds run.
#[derive(Debug, Clone, Args)]
pub struct BuildOptions {
    /// Maximum number of concurrent builds.
    #[arg(short = 'j', long = "jobs", default_value_t = 4)]
    pub concurrent_builds: usize,

    /// Disable compiler optimizations (for debuggers).
    #[arg(long = "disable-optimizations")]
    pub disable_optimizations: bool,

    /// Accept bare, scheme-less reference paths in manifests.
    #[arg(long = "legacy-import-paths")]
    pub legacy_import_paths: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            concurrent_builds: 4,
            disable_optimizations: false,
            legacy_import_paths: false,
        }
    }
}

fn is_manifest(path: &std::path::Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml") | Some("json")
    )
}

fn enumerate_dir(dir: &std::path::Path, recursive: bool, tx: &mpsc::UnboundedSender<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!("skipping {}: {}", dir.display(), err);
            return;
        }
    };
    let mut entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                enumerate_dir(&path, recursive, tx);
            }
        } else if is_manifest(&path) {
            let _ = tx.send(path.to_string_lossy().to_string());
        }
    }
}

/// Stream the file names to resolve. The channel shape leaves room to
/// hook a filesystem watcher up as another producer.
pub fn enumerate_files(options: &FilenameOptions) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let options = options.clone();

    for name in &options.filenames {
        if name == "-" {
            let _ = tx.send(name.clone());
            continue;
        }
        let path = std::path::PathBuf::from(name);
        if path.is_dir() {
            enumerate_dir(&path, options.recursive, &tx);
        } else {
            let _ = tx.send(name.clone());
        }
    }
    rx
}
