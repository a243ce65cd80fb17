//! Spool-to-temp-then-consume: an unbounded on-disk FIFO of fixed records.
//!
//! A [`TempSpooler`] buffers records in memory up to a small batch, then
//! appends them to a temporary file whose layout is a `u64` record count
//! followed by the packed records. The on-disk count always equals the number
//! of records readable after the header. Replay streams the file in small
//! blocks so memory stays bounded no matter how much was spooled.
//!
//! Running out of disk space is recovered locally: the spool truncates itself
//! back to empty and reports how many records were lost; the caller keeps
//! going.
//!
//! The backing file is placed using environment hints (`TMPDIR`, `/tmp`,
//! `/var/tmp`), skipping network filesystems when a local one is required —
//! spooling sample data over NFS defeats the point of the spool.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytemuck::Pod;
use tempfile::NamedTempFile;

use crate::error::{DaqError, DaqResult};

/// Records buffered in memory before a disk append.
const SPOOL_BATCH: usize = 100;

/// Records per block when replaying.
const SPOOL_READ_BLOCK: usize = 10;

/// Size of the record-count header.
const HEADER_SIZE: u64 = 8;

/// Filesystem magic numbers for network filesystems we refuse to spool onto.
const NETWORK_FS_MAGICS: &[i64] = &[
    0x6969,        // NFS
    0x517b,        // SMB
    0xff53_4d42,   // CIFS
    0x7375_7245,   // Coda
    0x564c,        // NCP
    0x5346_414f,   // AFS
];

/// Disk-backed FIFO of `T` records with bounded in-memory batching.
pub struct TempSpooler<T: Pod> {
    file: NamedTempFile,
    on_disk: u64,
    pending: Vec<T>,
}

impl<T: Pod> TempSpooler<T> {
    /// Create a spooler backed by a fresh temp file.
    ///
    /// `require_local` refuses directories on network filesystems.
    pub fn new(prefix: &str, require_local: bool) -> DaqResult<Self> {
        let dir = pick_spool_dir(require_local);
        let mut file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".spool")
            .tempfile_in(dir)?;
        file.as_file_mut().write_u64::<LittleEndian>(0)?;
        Ok(TempSpooler {
            file,
            on_disk: 0,
            pending: Vec::new(),
        })
    }

    /// Path of the backing file (removed when the spooler is dropped).
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Records spooled and not yet truncated (disk plus memory tail).
    pub fn num_spooled(&self) -> u64 {
        self.on_disk + self.pending.len() as u64
    }

    /// Records currently in the file (header value).
    pub fn num_on_disk(&self) -> u64 {
        self.on_disk
    }

    /// Queue records; appends to disk once the batch threshold is reached.
    ///
    /// On `DiskFull` the spool is reset to empty and the error reports the
    /// total number of records lost.
    pub fn spool(&mut self, records: &[T]) -> DaqResult<()> {
        self.pending.extend_from_slice(records);
        if self.pending.len() >= SPOOL_BATCH {
            self.flush()?;
        }
        Ok(())
    }

    /// Append the in-memory tail to disk and update the header.
    pub fn flush(&mut self) -> DaqResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let bytes: &[u8] = bytemuck::cast_slice(&self.pending);
        let file = self.file.as_file_mut();

        let write_result = file
            .seek(SeekFrom::End(0))
            .and_then(|_| file.write_all(bytes));
        if let Err(e) = write_result {
            if is_out_of_space(&e) {
                let records_lost = self.on_disk + self.pending.len() as u64;
                self.reset_after_full();
                return Err(DaqError::DiskFull { records_lost });
            }
            return Err(e.into());
        }

        self.on_disk += self.pending.len() as u64;
        self.pending.clear();
        self.write_header()
    }

    fn write_header(&mut self) -> DaqResult<()> {
        let file = self.file.as_file_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_u64::<LittleEndian>(self.on_disk)?;
        Ok(())
    }

    /// Best-effort recovery from a full disk: drop everything.
    fn reset_after_full(&mut self) {
        self.pending.clear();
        self.on_disk = 0;
        let file = self.file.as_file_mut();
        let _ = file.set_len(0);
        let _ = file.seek(SeekFrom::Start(0));
        let _ = file.write_u64::<LittleEndian>(0);
    }

    /// Reset to empty.
    pub fn truncate(&mut self) -> DaqResult<()> {
        self.pending.clear();
        self.on_disk = 0;
        let file = self.file.as_file_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_u64::<LittleEndian>(0)?;
        Ok(())
    }

    /// Stream every spooled record, in insertion order, through `op`.
    ///
    /// Disk records come first (read in blocks of [`SPOOL_READ_BLOCK`]), then
    /// the in-memory tail.
    pub fn for_each<F: FnMut(&T)>(&mut self, mut op: F) -> DaqResult<()> {
        let record_size = std::mem::size_of::<T>();
        if self.on_disk > 0 {
            let file = self.file.as_file_mut();
            file.seek(SeekFrom::Start(0))?;
            let header = file.read_u64::<LittleEndian>()?;
            if header != self.on_disk {
                return Err(DaqError::FileCorrupt(format!(
                    "spool header says {} records, expected {}",
                    header, self.on_disk
                )));
            }

            let mut left = self.on_disk as usize;
            let mut block = vec![0u8; record_size * SPOOL_READ_BLOCK];
            while left > 0 {
                let n = left.min(SPOOL_READ_BLOCK);
                let bytes = &mut block[..n * record_size];
                file.read_exact(bytes)?;
                for chunk in bytes.chunks_exact(record_size) {
                    // the block buffer is byte-aligned; copy out of it
                    let record: T = bytemuck::pod_read_unaligned(chunk);
                    op(&record);
                }
                left -= n;
            }
        }
        for record in &self.pending {
            op(record);
        }
        Ok(())
    }
}

fn is_out_of_space(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(code) if code == libc::ENOSPC || code == libc::EFBIG)
}

/// Choose a directory for spool files from environment hints.
fn pick_spool_dir(require_local: bool) -> PathBuf {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(tmp) = std::env::var("TMPDIR") {
        candidates.push(PathBuf::from(tmp));
    }
    candidates.push(PathBuf::from("/tmp"));
    candidates.push(PathBuf::from("/var/tmp"));

    for dir in candidates {
        if !dir.is_dir() {
            continue;
        }
        if !require_local || is_local_filesystem(&dir) {
            return dir;
        }
    }
    std::env::temp_dir()
}

/// True unless the directory's filesystem-type identifier is a known
/// network filesystem. Unknown types count as local.
#[cfg(unix)]
fn is_local_filesystem(dir: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;

    let Ok(cpath) = std::ffi::CString::new(dir.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: statfs only writes into the zeroed buffer we hand it and reads
    // the NUL-terminated path; both outlive the call.
    unsafe {
        let mut stat: libc::statfs = std::mem::zeroed();
        if libc::statfs(cpath.as_ptr(), &mut stat) != 0 {
            return false;
        }
        !NETWORK_FS_MAGICS.contains(&(stat.f_type as i64))
    }
}

#[cfg(not(unix))]
fn is_local_filesystem(_dir: &Path) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[repr(C)]
    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    struct Record16 {
        a: u64,
        b: u64,
    }

    #[test]
    fn spool_then_replay_in_order() {
        let mut spool: TempSpooler<Record16> = TempSpooler::new("t_spool", true).unwrap();
        let records: Vec<Record16> = (0..250).map(|i| Record16 { a: i, b: i * 2 }).collect();
        spool.spool(&records).unwrap();
        assert_eq!(spool.num_spooled(), 250);
        // spooled as one slice over the batch threshold: all of it hits disk
        assert_eq!(spool.num_on_disk(), 250);

        let mut sum = 0u64;
        let mut count = 0u64;
        spool
            .for_each(|r| {
                assert_eq!(r.a * 2, r.b);
                sum += r.a;
                count += 1;
            })
            .unwrap();
        assert_eq!(count, 250);
        assert_eq!(sum, (0..250u64).sum::<u64>());

        // on-disk header agrees
        let mut f = File::open(spool.path()).unwrap();
        assert_eq!(f.read_u64::<LittleEndian>().unwrap(), 250);
    }

    #[test]
    fn memory_tail_is_replayed_after_disk_records() {
        let mut spool: TempSpooler<Record16> = TempSpooler::new("t_spool", true).unwrap();
        for i in 0..105u64 {
            spool.spool(&[Record16 { a: i, b: 0 }]).unwrap();
        }
        assert_eq!(spool.num_spooled(), 105);
        assert!(spool.num_on_disk() >= 100);

        let mut seen = Vec::new();
        spool.for_each(|r| seen.push(r.a)).unwrap();
        assert_eq!(seen, (0..105).collect::<Vec<_>>());
    }

    #[test]
    fn truncate_resets_everything() {
        let mut spool: TempSpooler<Record16> = TempSpooler::new("t_spool", true).unwrap();
        spool
            .spool(&(0..128).map(|i| Record16 { a: i, b: i }).collect::<Vec<_>>())
            .unwrap();
        spool.truncate().unwrap();
        assert_eq!(spool.num_spooled(), 0);

        let mut visits = 0;
        spool.for_each(|_| visits += 1).unwrap();
        assert_eq!(visits, 0);

        // still usable after a truncate
        spool.spool(&[Record16 { a: 9, b: 9 }]).unwrap();
        assert_eq!(spool.num_spooled(), 1);
    }

    #[test]
    fn spool_dir_exists() {
        let dir = pick_spool_dir(true);
        assert!(dir.is_dir());
    }
}
