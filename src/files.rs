//! Local path validation and transfer-list construction.
//!
//! Validation runs before the handshake: a conversation never starts
//! against an unreadable source or unwritable destination. In directory
//! mode the source paths are walked into an ordered list of entries, each
//! carrying the segment path from its top-level origin down, so the
//! receiver can rebuild the tree (and rename it consistently) on its side.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrzszError};

/// One node in the set or tree being transferred.
///
/// `path_id` groups nodes that descend from the same top-level source path;
/// the receiver decides a local name for that id once and reuses it, so a
/// renamed directory keeps all its children together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(skip)]
    pub abs_path: PathBuf,
    pub path_id: u64,
    pub path_name: Vec<String>,
    pub is_dir: bool,
}

impl FileRecord {
    /// Last path segment: the entry's own name.
    pub fn name(&self) -> &str {
        self.path_name.last().map(String::as_str).unwrap_or("")
    }
}

/// Fail-closed check that the destination can take files.
pub fn check_path_writable(dest: &Path) -> Result<()> {
    if !dest.is_dir() {
        return Err(TrzszError::local(format!(
            "Not a directory: {}",
            dest.display()
        )));
    }
    if !is_writable(dest) {
        return Err(TrzszError::local(format!(
            "No permission to write: {}",
            dest.display()
        )));
    }
    Ok(())
}

/// Validate the source paths and build the ordered transfer list.
///
/// Without directory mode every path must be a readable regular file. With
/// it, directories are walked depth-first and every node (including the
/// directories themselves) becomes an entry.
pub fn collect_transfer_list(paths: &[PathBuf], directory: bool) -> Result<Vec<FileRecord>> {
    let mut entries = Vec::new();
    for (idx, path) in paths.iter().enumerate() {
        let meta = fs::metadata(path)
            .map_err(|_| TrzszError::local(format!("No such file: {}", path.display())))?;
        if meta.is_dir() && !directory {
            return Err(TrzszError::local(format!(
                "Is a directory: {}",
                path.display()
            )));
        }
        if !meta.is_dir() && !meta.is_file() {
            return Err(TrzszError::local(format!(
                "Not a regular file: {}",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TrzszError::local(format!("Invalid path: {}", path.display())))?;
        walk(path, idx as u64, vec![name], meta.is_dir(), &mut entries)?;
    }
    for entry in &entries {
        if !entry.is_dir && !is_readable(&entry.abs_path) {
            return Err(TrzszError::local(format!(
                "No permission to read: {}",
                entry.abs_path.display()
            )));
        }
    }
    Ok(entries)
}

/// With overwrite enabled there is no auto-rename to keep two same-named
/// sources apart, so the collision is refused up front.
pub fn check_duplicate_names(entries: &[FileRecord]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for entry in entries {
        if !seen.insert(&entry.path_name) {
            return Err(TrzszError::local(format!(
                "Duplicate name: {}",
                entry.path_name.join("/")
            )));
        }
    }
    Ok(())
}

fn walk(
    path: &Path,
    path_id: u64,
    path_name: Vec<String>,
    is_dir: bool,
    out: &mut Vec<FileRecord>,
) -> Result<()> {
    out.push(FileRecord {
        abs_path: path.to_path_buf(),
        path_id,
        path_name: path_name.clone(),
        is_dir,
    });
    if !is_dir {
        return Ok(());
    }
    let mut children: Vec<_> = fs::read_dir(path)
        .map_err(|e| TrzszError::local(format!("Fail to read directory {}: {e}", path.display())))?
        .collect::<std::io::Result<_>>()?;
    children.sort_by_key(|c| c.file_name());
    for child in children {
        let child_path = child.path();
        let child_meta = fs::metadata(&child_path)?;
        if !child_meta.is_dir() && !child_meta.is_file() {
            continue; // sockets, fifos and friends are not transferable
        }
        let mut segments = path_name.clone();
        segments.push(child.file_name().to_string_lossy().into_owned());
        walk(&child_path, path_id, segments, child_meta.is_dir(), out)?;
    }
    Ok(())
}

#[cfg(unix)]
fn is_writable(path: &Path) -> bool {
    access_ok(path, libc::W_OK)
}

#[cfg(unix)]
fn is_readable(path: &Path) -> bool {
    access_ok(path, libc::R_OK)
}

#[cfg(unix)]
fn access_ok(path: &Path, mode: libc::c_int) -> bool {
    use std::os::unix::ffi::OsStrExt;
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // access(2) mirrors what the original relied on; a false negative here
    // only produces an earlier, clearer error than the open would.
    unsafe { libc::access(cpath.as_ptr(), mode) == 0 }
}

#[cfg(not(unix))]
fn is_writable(path: &Path) -> bool {
    !fs::metadata(path)
        .map(|m| m.permissions().readonly())
        .unwrap_or(true)
}

#[cfg(not(unix))]
fn is_readable(path: &Path) -> bool {
    fs::File::open(path).is_ok()
}
