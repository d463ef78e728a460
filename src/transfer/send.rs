//! Sender side of the per-entry exchange.
//!
//! One pass over the ordered transfer list, in lockstep with the receiver:
//! NUM once, then per entry NAME -> SIZE -> DATA chunks -> MD5, each unit
//! acknowledged before the next is sent. Chunk length acks are an
//! echo-based integrity check independent of the final digest.

use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::Instant;

use crate::callback::TransferCallback;
use crate::error::{Result, TrzszError};
use crate::files::FileRecord;
use crate::protocol::frame::FrameRead;
use crate::protocol::Conversation;
use crate::transfer::flow::ChunkSizer;

/// Send every entry in the list. Returns the receiver-confirmed remote
/// names, deduplicated, for the final human-readable summary.
pub async fn send_files<F, W, C>(
    conv: &mut Conversation<F, W>,
    files: &[FileRecord],
    callback: &mut C,
) -> Result<Vec<String>>
where
    F: FrameRead,
    W: AsyncWrite + Unpin + Send,
    C: TransferCallback,
{
    send_file_num(conv, files.len() as u64, callback).await?;

    let mut remote_list: Vec<String> = Vec::new();
    for file in files {
        let remote_name = send_file_name(conv, file, callback).await?;
        if !remote_list.contains(&remote_name) {
            remote_list.push(remote_name);
        }

        if file.is_dir {
            continue;
        }

        let size = send_file_size(conv, file, callback).await?;
        let digest = send_file_data(conv, file, size, callback).await?;
        send_file_md5(conv, &digest, callback).await?;
    }

    Ok(remote_list)
}

async fn send_file_num<F, W, C>(
    conv: &mut Conversation<F, W>,
    num: u64,
    callback: &mut C,
) -> Result<()>
where
    F: FrameRead,
    W: AsyncWrite + Unpin + Send,
    C: TransferCallback,
{
    conv.send_integer("NUM", num).await?;
    conv.check_integer(num).await?;
    callback.on_num(num);
    Ok(())
}

async fn send_file_name<F, W, C>(
    conv: &mut Conversation<F, W>,
    file: &FileRecord,
    callback: &mut C,
) -> Result<String>
where
    F: FrameRead,
    W: AsyncWrite + Unpin + Send,
    C: TransferCallback,
{
    if conv.config.directory {
        conv.send_json("NAME", file).await?;
    } else {
        conv.send_string("NAME", file.name()).await?;
    }
    // The ack carries back the receiver-chosen local name.
    let remote_name = conv.recv_string("SUCC", false).await?;
    callback.on_name(file.name());
    Ok(remote_name)
}

async fn send_file_size<F, W, C>(
    conv: &mut Conversation<F, W>,
    file: &FileRecord,
    callback: &mut C,
) -> Result<u64>
where
    F: FrameRead,
    W: AsyncWrite + Unpin + Send,
    C: TransferCallback,
{
    let size = tokio::fs::metadata(&file.abs_path).await?.len();
    conv.send_integer("SIZE", size).await?;
    conv.check_integer(size).await?;
    callback.on_size(size);
    Ok(size)
}

async fn send_file_data<F, W, C>(
    conv: &mut Conversation<F, W>,
    file: &FileRecord,
    size: u64,
    callback: &mut C,
) -> Result<Vec<u8>>
where
    F: FrameRead,
    W: AsyncWrite + Unpin + Send,
    C: TransferCallback,
{
    let mut reader = tokio::fs::File::open(&file.abs_path).await?;
    let mut sizer = ChunkSizer::new(conv.config.max_buf_size);
    let mut md5 = Md5::new();
    let mut step = 0u64;
    callback.on_step(step);

    while step < size {
        let begin = Instant::now();
        let chunk = read_chunk(&mut reader, sizer.size()).await?;
        if chunk.is_empty() {
            return Err(TrzszError::protocol(format!(
                "File size of {} changed during transfer",
                file.abs_path.display()
            )));
        }
        conv.send_data(&chunk).await?;
        md5.update(&chunk);
        conv.check_integer(chunk.len() as u64).await?;
        step += chunk.len() as u64;
        callback.on_step(step);

        let elapsed = begin.elapsed();
        sizer.record(chunk.len() as u64, elapsed);
        conv.note_chunk_time(elapsed);
    }

    Ok(md5.finalize().to_vec())
}

async fn send_file_md5<F, W, C>(
    conv: &mut Conversation<F, W>,
    digest: &[u8],
    callback: &mut C,
) -> Result<()>
where
    F: FrameRead,
    W: AsyncWrite + Unpin + Send,
    C: TransferCallback,
{
    conv.send_binary("MD5", digest).await?;
    conv.check_binary(digest).await?;
    callback.on_done();
    Ok(())
}

async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, want: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; want as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
