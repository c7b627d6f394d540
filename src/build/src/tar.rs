//! Deterministic tar assembly for image layers.
//!
//! Layer digests must be stable across hosts, so entries carry a fixed
//! 0555 mode and no uid/gid/mtime, paths always use forward slashes,
//! directory contents are walked in name order, and parent directories
//! are emitted before the files under them.

use std::io::Write;
use std::path::Path;

use kolite_core::error::{KoError, Result};

/// Directory holding the built binary inside the image.
pub const APP_DIR: &str = "/ko-app";

/// Where kodata contents land inside the image.
pub const KODATA_ROOT: &str = "/var/run/ko";

const LAYER_MODE: u32 = 0o555;

fn append_dir<W: Write>(builder: &mut tar::Builder<W>, name: &str) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_mode(LAYER_MODE);
    header.set_size(0);
    header.set_cksum();
    builder
        .append_data(&mut header, name, std::io::empty())
        .map_err(|e| KoError::Tar(format!("failed to add directory {}: {}", name, e)))
}

fn append_file<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(LAYER_MODE);
    header.set_size(data.len() as u64);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| KoError::Tar(format!("failed to add file {}: {}", name, e)))
}

/// Emit directory entries for every ancestor of `dir`, outermost first.
fn append_parent_dirs<W: Write>(builder: &mut tar::Builder<W>, dir: &str) -> Result<()> {
    if dir.is_empty() || dir == "." || dir == "/" {
        return Ok(());
    }
    let parent = match dir.rfind('/') {
        Some(0) => "/",
        Some(i) => &dir[..i],
        None => ".",
    };
    append_parent_dirs(builder, parent)?;
    append_dir(builder, dir)
}

/// Tar a single binary at `name` (e.g. `/ko-app/app`), parent
/// directories included.
pub fn tar_binary(name: &str, binary: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.preserve_absolute(true);

    let parent = match name.rfind('/') {
        Some(0) => "/",
        Some(i) => &name[..i],
        None => ".",
    };
    append_parent_dirs(&mut builder, parent)?;

    let data = std::fs::read(binary)
        .map_err(|e| KoError::Tar(format!("failed to read {}: {}", binary.display(), e)))?;
    append_file(&mut builder, name, &data)?;

    builder
        .into_inner()
        .map_err(|e| KoError::Tar(format!("failed to finalize tar: {}", e)))
}

/// Tar the data directory rooted at `root`, mapped to `chroot` inside
/// the image. Symlinks are dereferenced; a symlink to a directory causes
/// recursive descent into its target. A missing root yields a tar with
/// only the chroot directory entry.
pub fn tar_dir(root: &Path, chroot: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.preserve_absolute(true);
    append_dir(&mut builder, chroot)?;
    if root.is_dir() {
        walk(&mut builder, root, chroot)?;
    }
    builder
        .into_inner()
        .map_err(|e| KoError::Tar(format!("failed to finalize tar: {}", e)))
}

/// Tar the `kodata` directory for the image's `/var/run/ko` tree.
pub fn tar_kodata(kodata: &Path) -> Result<Vec<u8>> {
    tar_dir(kodata, KODATA_ROOT)
}

fn walk<W: Write>(builder: &mut tar::Builder<W>, dir: &Path, chroot: &str) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| KoError::Tar(format!("failed to read {}: {}", dir.display(), e)))?
        .collect::<std::io::Result<_>>()
        .map_err(|e| KoError::Tar(format!("failed to read entry in {}: {}", dir.display(), e)))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let host_path = entry.path();
        let name = format!("{}/{}", chroot, entry.file_name().to_string_lossy());

        // Chase symlinks to their target.
        let host_path = std::fs::canonicalize(&host_path).map_err(|e| {
            KoError::Tar(format!("failed to resolve {}: {}", host_path.display(), e))
        })?;
        let metadata = std::fs::metadata(&host_path).map_err(|e| {
            KoError::Tar(format!("failed to stat {}: {}", host_path.display(), e))
        })?;

        if metadata.is_dir() {
            append_dir(builder, &name)?;
            walk(builder, &host_path, &name)?;
        } else {
            let data = std::fs::read(&host_path).map_err(|e| {
                KoError::Tar(format!("failed to read {}: {}", host_path.display(), e))
            })?;
            append_file(builder, &name, &data)?;
        }
    }
    Ok(())
}
