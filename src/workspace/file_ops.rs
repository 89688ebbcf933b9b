//! Block-level file content operations
//!
//! A file is split in `blocksize` areas; area `i` covers
//! `[i * blocksize, (i + 1) * blocksize)` and is backed by at most one block.
//! Areas without a block, and the part of an area past its block's end, read
//! as zeros. Writes never modify a block: the touched areas are rewritten
//! into new blocks and the manifest is pointed at them (copy-on-write).

use crate::error::{Result, WorkspaceError};
use crate::models::FileManifest;
use crate::storage::BlockStore;

/// Largest number of bytes returned by one read.
pub const MAX_READ_SIZE: u64 = 64 * 1024 * 1024;

/// Read up to `size` bytes at `offset`; fewer at end of file, none past it.
///
/// A single read returns at most [`MAX_READ_SIZE`] bytes, so reading a
/// large sparse file takes several calls.
pub async fn read_range(
    blocks: &BlockStore,
    file: &FileManifest,
    offset: u64,
    size: u64,
) -> Result<Vec<u8>> {
    if offset >= file.size || size == 0 {
        return Ok(Vec::new());
    }
    let end = offset
        .saturating_add(size.min(MAX_READ_SIZE))
        .min(file.size);
    let bs = file.blocksize;
    let mut out = Vec::with_capacity((end - offset).min(bs) as usize);

    let mut pos = offset;
    while pos < end {
        let index = pos / bs;
        let in_block = (pos - index * bs) as usize;
        let take = (bs - in_block as u64).min(end - pos) as usize;
        let start_len = out.len();

        if let Some(block) = file.block_at(index) {
            let data = blocks.read(block).await?;
            let avail_end = data.len().min(in_block + take);
            if in_block < avail_end {
                out.extend_from_slice(&data[in_block..avail_end]);
            }
        }
        out.resize(start_len + take, 0);
        pos += take as u64;
    }
    Ok(out)
}

/// Write `data` at `offset`, growing the file if needed.
///
/// Returns the offset right after the written bytes.
///
/// # Errors
///
/// `FileTooLarge` if the write would end past `u64::MAX`; the file is left
/// untouched.
pub async fn write_range(
    blocks: &BlockStore,
    file: &mut FileManifest,
    offset: u64,
    data: &[u8],
) -> Result<u64> {
    let len = data.len() as u64;
    let end = offset
        .checked_add(len)
        .ok_or(WorkspaceError::FileTooLarge { offset, len })?;
    if data.is_empty() {
        return Ok(end);
    }
    let bs = file.blocksize;

    let mut pos = offset;
    while pos < end {
        let index = pos / bs;
        let block_start = index * bs;
        let in_block = (pos - block_start) as usize;
        let take = (bs - in_block as u64).min(end - pos) as usize;
        let src = (pos - offset) as usize;

        // Current content of the area, zero padded up to the old end of file
        let existing_len = bs.min(file.size.saturating_sub(block_start)) as usize;
        let mut buf = match file.block_at(index) {
            Some(block) if !(in_block == 0 && take >= existing_len) => blocks.read(block).await?,
            _ => Vec::new(),
        };
        buf.resize(existing_len.max(in_block + take), 0);
        buf[in_block..in_block + take].copy_from_slice(&data[src..src + take]);

        let block = blocks.write(block_start, &buf).await?;
        file.set_block(block);
        pos += take as u64;
    }

    file.size = file.size.max(end);
    Ok(end)
}

/// Truncate or zero-extend the file to `length` bytes.
pub async fn resize(blocks: &BlockStore, file: &mut FileManifest, length: u64) -> Result<()> {
    if length >= file.size {
        // the new tail is a hole
        file.size = length;
        return Ok(());
    }

    file.blocks.retain(|block| block.offset < length);
    let straddling = file
        .blocks
        .last()
        .filter(|block| block.offset.saturating_add(block.size) > length)
        .cloned();
    if let Some(block) = straddling {
        let mut data = blocks.read(&block).await?;
        data.truncate((length - block.offset) as usize);
        let rewritten = blocks.write(block.offset, &data).await?;
        file.set_block(rewritten);
    }

    file.size = length;
    Ok(())
}
