use dayson_core::{CoreError, Result};
use log::warn;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub const MAX_BLOCK_LEN: usize = 100 * 1024 * 1024;
const FREE_SPACE_HEADROOM: u64 = 1024 * 1024;

/// Checksum over a block payload: `h = h*31 + b` in wrapping i32
/// arithmetic.
pub fn block_checksum(bytes: &[u8]) -> i32 {
    let mut h: i32 = 0;
    for &b in bytes {
        h = h.wrapping_mul(31).wrapping_add(b as i32);
    }
    h
}

/// Append-only file of checksum-protected blocks. The offset where a
/// block's length field starts is the stable handle handed to callers.
///
/// Single writer, many readers: the writer holds the append handle under
/// the write lock; readers take the read lock and open their own handle, so
/// no cursor is shared.
pub struct BlockStore {
    path: PathBuf,
    writer: RwLock<File>,
}

impl BlockStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: RwLock::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `[len | checksum | bytes]` and returns the block offset. On
    /// any write failure the file is truncated back to its pre-write length
    /// before the error is re-raised.
    pub fn store(&self, bytes: &[u8]) -> Result<u64> {
        self.store_with_available(bytes, available_space_for(&self.path))
    }

    fn store_with_available(&self, bytes: &[u8], available: Option<u64>) -> Result<u64> {
        if bytes.len() > MAX_BLOCK_LEN {
            return Err(CoreError::InvalidArgument(format!(
                "block of {} bytes exceeds the {MAX_BLOCK_LEN} byte limit",
                bytes.len()
            )));
        }
        if let Some(available) = available {
            let needed = bytes.len() as u64 + FREE_SPACE_HEADROOM;
            if available < needed {
                return Err(CoreError::OutOfSpace(format!(
                    "{needed} bytes needed, {available} available"
                )));
            }
        }
        let mut file = self
            .writer
            .write()
            .expect("block store writer lock poisoned");
        let offset = file.seek(SeekFrom::End(0))?;
        let checksum = block_checksum(bytes);
        let result = (|| -> Result<()> {
            file.write_all(&(bytes.len() as i32).to_le_bytes())?;
            file.write_all(&checksum.to_le_bytes())?;
            file.write_all(bytes)?;
            file.flush()?;
            file.sync_data()?;
            Ok(())
        })();
        if let Err(e) = result {
            if let Err(trunc) = file.set_len(offset) {
                warn!("rollback of block at {offset} failed: {trunc}");
            }
            let _ = file.seek(SeekFrom::End(0));
            return Err(e);
        }
        Ok(offset)
    }

    /// Reads the block at `offset`, verifying the stored length bound and
    /// checksum.
    pub fn get(&self, offset: u64) -> Result<Vec<u8>> {
        let _shared = self
            .writer
            .read()
            .expect("block store writer lock poisoned");
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; 8];
        read_exact(&mut file, &mut header, offset)?;
        let len = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let stored_checksum = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len < 0 || len as usize > MAX_BLOCK_LEN {
            return Err(CoreError::CorruptData(format!(
                "block at {offset} claims {len} bytes"
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        read_exact(&mut file, &mut bytes, offset)?;
        let checksum = block_checksum(&bytes);
        if checksum != stored_checksum {
            return Err(CoreError::CorruptData(format!(
                "block at {offset}: checksum {checksum} != stored {stored_checksum}"
            )));
        }
        Ok(bytes)
    }

    pub fn len(&self) -> Result<u64> {
        let file = self
            .writer
            .read()
            .expect("block store writer lock poisoned");
        Ok(file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncates the store to zero length.
    pub fn clear(&self) -> Result<()> {
        let mut file = self
            .writer
            .write()
            .expect("block store writer lock poisoned");
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

fn read_exact(file: &mut File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CoreError::CorruptData(format!("block at {offset} truncated"))
        } else {
            CoreError::IoFailure(e)
        }
    })
}

fn available_space_for(path: &Path) -> Option<u64> {
    let probe = path.parent().unwrap_or(path);
    let canonical = probe.canonicalize().ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| canonical.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}
