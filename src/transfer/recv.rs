//! Receiver side of the per-entry exchange.
//!
//! Mirrors the sender's lockstep: echo NUM, then per entry pick a local
//! name and ack it, echo SIZE, ack every chunk with its length, and verify
//! the digest. Every path created here is tracked so a stop-and-delete can
//! roll the whole transfer back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::callback::TransferCallback;
use crate::error::{Result, TrzszError};
use crate::files::FileRecord;
use crate::protocol::frame::FrameRead;
use crate::protocol::Conversation;

/// Paths created during a transfer, in creation order. Rollback removes
/// them newest-first so children go before their directories.
#[derive(Debug, Default)]
pub struct CreatedFiles {
    paths: Vec<PathBuf>,
}

impl CreatedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Remove everything that was created, returning the paths actually
    /// deleted. Removal failures are skipped: rollback runs on an error
    /// path and must not raise new ones.
    pub fn delete_all(&mut self) -> Vec<String> {
        let mut deleted = Vec::new();
        for path in self.paths.drain(..).rev() {
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path).is_ok()
            } else {
                std::fs::remove_file(&path).is_ok()
            };
            if removed {
                deleted.push(path.display().to_string());
            }
        }
        deleted
    }
}

/// Receive every entry the sender announced. Returns the chosen local
/// names, deduplicated, for the final human-readable summary.
pub async fn recv_files<F, W, C>(
    conv: &mut Conversation<F, W>,
    dest: &Path,
    callback: &mut C,
    created: &mut CreatedFiles,
) -> Result<Vec<String>>
where
    F: FrameRead,
    W: AsyncWrite + Unpin + Send,
    C: TransferCallback,
{
    let num = recv_file_num(conv, callback).await?;

    let mut name_map: HashMap<u64, String> = HashMap::new();
    let mut local_list: Vec<String> = Vec::new();
    for _ in 0..num {
        let entry = recv_file_name(conv, dest, &mut name_map, created, callback).await?;
        if !local_list.contains(&entry.local_name) {
            local_list.push(entry.local_name.clone());
        }

        let Some(mut file) = entry.file else {
            continue; // directory entry, no content follows
        };

        let size = recv_file_size(conv, callback).await?;
        let digest = recv_file_data(conv, &mut file, size, callback).await?;
        drop(file);
        recv_file_md5(conv, &entry.entry_name, &digest, callback).await?;
    }

    Ok(local_list)
}

struct ReceivedEntry {
    /// Open destination file, or `None` for a directory entry.
    file: Option<tokio::fs::File>,
    /// Top-level local name, possibly auto-renamed.
    local_name: String,
    /// The entry's own name, for progress display and error messages.
    entry_name: String,
}

async fn recv_file_num<F, W, C>(conv: &mut Conversation<F, W>, callback: &mut C) -> Result<u64>
where
    F: FrameRead,
    W: AsyncWrite + Unpin + Send,
    C: TransferCallback,
{
    let num = conv.recv_integer("NUM", false).await?;
    conv.send_integer("SUCC", num).await?;
    callback.on_num(num);
    Ok(num)
}

async fn recv_file_name<F, W, C>(
    conv: &mut Conversation<F, W>,
    dest: &Path,
    name_map: &mut HashMap<u64, String>,
    created: &mut CreatedFiles,
    callback: &mut C,
) -> Result<ReceivedEntry>
where
    F: FrameRead,
    W: AsyncWrite + Unpin + Send,
    C: TransferCallback,
{
    let entry = if conv.config.directory {
        let record: FileRecord = conv.recv_json("NAME", false).await?;
        for segment in &record.path_name {
            check_entry_name(segment)?;
        }
        create_dir_or_file(dest, &record, conv.config.overwrite, name_map, created).await?
    } else {
        let name = conv.recv_string("NAME", false).await?;
        check_entry_name(&name)?;
        let local_name = if conv.config.overwrite {
            name.clone()
        } else {
            unused_name(dest, &name)?
        };
        let path = dest.join(&local_name);
        let file = create_file(&path).await?;
        created.track(path);
        ReceivedEntry {
            file: Some(file),
            local_name,
            entry_name: name,
        }
    };
    conv.send_string("SUCC", &entry.local_name).await?;
    callback.on_name(&entry.entry_name);
    Ok(entry)
}

async fn recv_file_size<F, W, C>(conv: &mut Conversation<F, W>, callback: &mut C) -> Result<u64>
where
    F: FrameRead,
    W: AsyncWrite + Unpin + Send,
    C: TransferCallback,
{
    let size = conv.recv_integer("SIZE", false).await?;
    conv.send_integer("SUCC", size).await?;
    callback.on_size(size);
    Ok(size)
}

async fn recv_file_data<F, W, C>(
    conv: &mut Conversation<F, W>,
    file: &mut tokio::fs::File,
    size: u64,
    callback: &mut C,
) -> Result<Vec<u8>>
where
    F: FrameRead,
    W: AsyncWrite + Unpin + Send,
    C: TransferCallback,
{
    let mut md5 = Md5::new();
    let mut step = 0u64;
    callback.on_step(step);

    while step < size {
        let begin = Instant::now();
        let chunk = conv.recv_data().await?;
        file.write_all(&chunk).await?;
        step += chunk.len() as u64;
        callback.on_step(step);
        conv.send_integer("SUCC", chunk.len() as u64).await?;
        md5.update(&chunk);
        conv.note_chunk_time(begin.elapsed());
    }

    file.flush().await?;
    Ok(md5.finalize().to_vec())
}

async fn recv_file_md5<F, W, C>(
    conv: &mut Conversation<F, W>,
    name: &str,
    digest: &[u8],
    callback: &mut C,
) -> Result<()>
where
    F: FrameRead,
    W: AsyncWrite + Unpin + Send,
    C: TransferCallback,
{
    let expect = conv.recv_binary("MD5", false).await?;
    if expect != digest {
        return Err(TrzszError::Integrity(format!("Check MD5 of {name} failed")));
    }
    conv.send_binary("SUCC", digest).await?;
    callback.on_done();
    Ok(())
}

// ----------------------------------------------------------------------
// Local path resolution
// ----------------------------------------------------------------------

/// Resolve a directory-mode entry into a local path, renaming its
/// top-level origin consistently: the first entry of a `path_id` decides
/// the local name, and every later entry of the same id reuses it.
async fn create_dir_or_file(
    dest: &Path,
    record: &FileRecord,
    overwrite: bool,
    name_map: &mut HashMap<u64, String>,
    created: &mut CreatedFiles,
) -> Result<ReceivedEntry> {
    let top = record
        .path_name
        .first()
        .ok_or_else(|| TrzszError::protocol("empty path in name record"))?;

    let local_name = if overwrite {
        top.clone()
    } else if let Some(cached) = name_map.get(&record.path_id) {
        cached.clone()
    } else {
        let fresh = unused_name(dest, top)?;
        name_map.insert(record.path_id, fresh.clone());
        fresh
    };

    let mut path = dest.join(&local_name);
    for segment in &record.path_name[1..] {
        path.push(segment);
    }

    if record.is_dir {
        create_directory(&path, created).await?;
        return Ok(ReceivedEntry {
            file: None,
            local_name,
            entry_name: record.name().to_string(),
        });
    }

    if let Some(parent) = path.parent() {
        create_directory(parent, created).await?;
    }
    let file = create_file(&path).await?;
    created.track(path);
    Ok(ReceivedEntry {
        file: Some(file),
        local_name,
        entry_name: record.name().to_string(),
    })
}

async fn create_directory(path: &Path, created: &mut CreatedFiles) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        return Err(TrzszError::local(format!(
            "Not a directory: {}",
            path.display()
        )));
    }
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|_| TrzszError::local(format!("Fail to create directory: {}", path.display())))?;
    created.track(path.to_path_buf());
    Ok(())
}

async fn create_file(path: &Path) -> Result<tokio::fs::File> {
    if path.is_dir() {
        return Err(TrzszError::local(format!(
            "Is a directory: {}",
            path.display()
        )));
    }
    tokio::fs::File::create(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            TrzszError::local(format!("No permission to write: {}", path.display()))
        } else {
            TrzszError::local(format!("Fail to create file: {}", path.display()))
        }
    })
}

/// A received name must stay a single path component inside the
/// destination. Anything that could climb out of it is refused before any
/// path is built.
fn check_entry_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(TrzszError::protocol(format!("Invalid file name: {name}")));
    }
    Ok(())
}

/// Pick a name that does not collide: the announced name if free, else the
/// first free `name.0` through `name.999`.
fn unused_name(dest: &Path, name: &str) -> Result<String> {
    if !dest.join(name).exists() {
        return Ok(name.to_string());
    }
    for i in 0..1000 {
        let candidate = format!("{name}.{i}");
        if !dest.join(&candidate).exists() {
            return Ok(candidate);
        }
    }
    Err(TrzszError::local("Fail to assign new file name"))
}
