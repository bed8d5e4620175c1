//! Tape drive seam
//!
//! The session never talks to hardware directly; it goes through
//! [`TapeDrive`]. [`DirectoryDrive`] is the stock implementation: each
//! volume is a directory and each tape file `fseq` a regular file
//! `<root>/<vid>/<fseq:05>.tape`. Tape marks are buffered until the drive is
//! flushed, the same contract a real drive with buffered tape marks has.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{DriveError, DriveErrorKind};
use crate::request::{TapeMode, TapeRequest};

pub type DriveResult<T> = std::result::Result<T, DriveError>;

/// Default block size for device groups whose name contains "SD3"
pub const SD3_BLOCK_SIZE: usize = 256 * 1024;
/// Fallback block size when neither the request nor the device group says
pub const DEFAULT_BLOCK_SIZE: usize = 32 * 1024;

pub trait TapeFileWriter: Send {
    fn write(&mut self, data: &[u8]) -> DriveResult<()>;
    /// Terminate the tape file with a tape mark. The mark is buffered and
    /// only durable after [`TapeDrive::flush`].
    fn close(self: Box<Self>) -> DriveResult<()>;
}

pub trait TapeFileReader: Send {
    /// Read the next chunk of the tape file; 0 means the tape mark was hit
    fn read(&mut self, buf: &mut [u8]) -> DriveResult<usize>;
}

pub trait TapeDrive: Send + Sync {
    fn mount(&self, tape: &TapeRequest) -> DriveResult<()>;
    fn open_write(&self, tape: &TapeRequest, fseq: u32) -> DriveResult<Box<dyn TapeFileWriter>>;
    fn open_read(&self, tape: &TapeRequest, fseq: u32) -> DriveResult<Box<dyn TapeFileReader>>;
    /// Make every buffered tape mark durable
    fn flush(&self, tape: &TapeRequest) -> DriveResult<()>;
    fn unmount(&self, tape: &TapeRequest) -> DriveResult<()>;
    /// Hand the drive back to the scheduler
    fn release(&self, unit: &str) -> DriveResult<()>;

    /// Block size for a file that did not specify one
    fn default_block_size(&self, dgn: &str, recordlength: i32) -> usize {
        if dgn.contains("SD3") {
            SD3_BLOCK_SIZE
        } else if recordlength > 0 {
            recordlength as usize
        } else {
            DEFAULT_BLOCK_SIZE
        }
    }
}

#[derive(Debug, Default)]
struct DriveState {
    mounted: Option<String>,
    pending_marks: Vec<PathBuf>,
}

/// Drive emulation on top of a directory tree
pub struct DirectoryDrive {
    root: PathBuf,
    state: Arc<Mutex<DriveState>>,
    flushes: AtomicU64,
    releases: AtomicU64,
}

impl DirectoryDrive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Arc::new(Mutex::new(DriveState::default())),
            flushes: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tape_file_path(&self, vid: &str, fseq: u32) -> PathBuf {
        self.root.join(vid).join(format!("{:05}.tape", fseq))
    }

    pub fn mounted(&self) -> Option<String> {
        self.state.lock().mounted.clone()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    fn check_mounted(&self, tape: &TapeRequest) -> DriveResult<()> {
        match self.state.lock().mounted.as_deref() {
            Some(v) if v == tape.vid => Ok(()),
            Some(other) => Err(DriveError::new(
                DriveErrorKind::Fatal,
                format!("volume {} requested but {} is mounted", tape.vid, other),
            )),
            None => Err(DriveError::new(
                DriveErrorKind::Fatal,
                format!("volume {} not mounted", tape.vid),
            )),
        }
    }
}

fn io_kind(e: &std::io::Error) -> DriveErrorKind {
    if e.raw_os_error() == Some(libc::ENOSPC) {
        DriveErrorKind::EndOfVolume
    } else if e.kind() == ErrorKind::Interrupted || e.kind() == ErrorKind::TimedOut {
        DriveErrorKind::Retryable
    } else {
        DriveErrorKind::Fatal
    }
}

struct DirWriter {
    path: PathBuf,
    file: File,
    state: Arc<Mutex<DriveState>>,
}

impl TapeFileWriter for DirWriter {
    fn write(&mut self, data: &[u8]) -> DriveResult<()> {
        self.file.write_all(data).map_err(|e| {
            DriveError::io(io_kind(&e), format!("write {}", self.path.display()), e)
        })
    }

    fn close(self: Box<Self>) -> DriveResult<()> {
        let DirWriter { path, file, state } = *self;
        drop(file);
        state.lock().pending_marks.push(path);
        Ok(())
    }
}

struct DirReader {
    file: File,
}

impl TapeFileReader for DirReader {
    fn read(&mut self, buf: &mut [u8]) -> DriveResult<usize> {
        self.file
            .read(buf)
            .map_err(|e| DriveError::io(io_kind(&e), "read tape file", e))
    }
}

impl TapeDrive for DirectoryDrive {
    fn mount(&self, tape: &TapeRequest) -> DriveResult<()> {
        let dir = self.root.join(&tape.vid);
        let mut st = self.state.lock();
        if st.mounted.as_deref() == Some(tape.vid.as_str()) {
            debug!(vid = %tape.vid, "volume already mounted");
            return Ok(());
        }
        match tape.mode {
            TapeMode::Write => fs::create_dir_all(&dir).map_err(|e| {
                DriveError::io(io_kind(&e), format!("mount {}", tape.vid), e)
            })?,
            TapeMode::Read => {
                if !dir.is_dir() {
                    return Err(DriveError::new(
                        DriveErrorKind::Fatal,
                        format!("volume {} not found", tape.vid),
                    ));
                }
            }
        }
        info!(vid = %tape.vid, unit = %tape.unit, "mounted");
        st.mounted = Some(tape.vid.clone());
        Ok(())
    }

    fn open_write(&self, tape: &TapeRequest, fseq: u32) -> DriveResult<Box<dyn TapeFileWriter>> {
        self.check_mounted(tape)?;
        let path = self.tape_file_path(&tape.vid, fseq);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| DriveError::io(io_kind(&e), format!("position to fseq {fseq}"), e))?;
        Ok(Box::new(DirWriter {
            path,
            file,
            state: Arc::clone(&self.state),
        }))
    }

    fn open_read(&self, tape: &TapeRequest, fseq: u32) -> DriveResult<Box<dyn TapeFileReader>> {
        self.check_mounted(tape)?;
        let path = self.tape_file_path(&tape.vid, fseq);
        match File::open(&path) {
            Ok(file) => Ok(Box::new(DirReader { file })),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(DriveError::new(
                DriveErrorKind::EndOfData,
                format!("fseq {fseq} beyond end of data on {}", tape.vid),
            )),
            Err(e) => Err(DriveError::io(io_kind(&e), format!("position to fseq {fseq}"), e)),
        }
    }

    fn flush(&self, tape: &TapeRequest) -> DriveResult<()> {
        let pending = std::mem::take(&mut self.state.lock().pending_marks);
        for p in &pending {
            let f = File::open(p)
                .map_err(|e| DriveError::io(io_kind(&e), format!("flush {}", tape.vid), e))?;
            f.sync_all()
                .map_err(|e| DriveError::io(io_kind(&e), format!("flush {}", tape.vid), e))?;
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        debug!(vid = %tape.vid, marks = pending.len(), "flushed tape marks");
        Ok(())
    }

    fn unmount(&self, tape: &TapeRequest) -> DriveResult<()> {
        let pending = !self.state.lock().pending_marks.is_empty();
        if pending {
            self.flush(tape)?;
        }
        self.state.lock().mounted = None;
        info!(vid = %tape.vid, "unmounted");
        Ok(())
    }

    fn release(&self, unit: &str) -> DriveResult<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        info!(unit, "drive released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tape(vid: &str, mode: TapeMode) -> TapeRequest {
        TapeRequest {
            vid: vid.into(),
            mode,
            ..Default::default()
        }
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DirectoryDrive::new(dir.path());
        let t = tape("V00001", TapeMode::Write);
        drive.mount(&t).unwrap();
        let mut w = drive.open_write(&t, 1).unwrap();
        w.write(b"payload").unwrap();
        w.close().unwrap();
        drive.flush(&t).unwrap();
        drive.unmount(&t).unwrap();

        let r = tape("V00001", TapeMode::Read);
        drive.mount(&r).unwrap();
        let mut rd = drive.open_read(&r, 1).unwrap();
        let mut buf = [0u8; 16];
        let n = rd.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");
        assert_eq!(rd.read(&mut buf).unwrap(), 0);
        assert!(drive.tape_file_path("V00001", 1).ends_with("V00001/00001.tape"));
    }

    #[test]
    fn test_unmount_flushes_buffered_marks() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DirectoryDrive::new(dir.path());
        let t = tape("V00002", TapeMode::Write);
        drive.mount(&t).unwrap();
        drive.open_write(&t, 1).unwrap().close().unwrap();
        assert_eq!(drive.flush_count(), 0);
        drive.unmount(&t).unwrap();
        assert_eq!(drive.flush_count(), 1);

        drive.mount(&t).unwrap();
        drive.unmount(&t).unwrap();
        assert_eq!(drive.flush_count(), 1);
    }

    #[test]
    fn test_read_past_last_file_is_end_of_data() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("V00003")).unwrap();
        let drive = DirectoryDrive::new(dir.path());
        let t = tape("V00003", TapeMode::Read);
        drive.mount(&t).unwrap();
        let err = drive.open_read(&t, 4).err().unwrap();
        assert_eq!(err.kind, DriveErrorKind::EndOfData);
    }

    #[test]
    fn test_unknown_volume_cannot_be_read() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DirectoryDrive::new(dir.path());
        assert!(drive.mount(&tape("NOPE01", TapeMode::Read)).is_err());
    }

    #[test]
    fn test_default_block_size_by_device_group() {
        let drive = DirectoryDrive::new("/nonexistent");
        assert_eq!(drive.default_block_size("SD3_A", 0), SD3_BLOCK_SIZE);
        assert_eq!(drive.default_block_size("T10K", 80), 80);
        assert_eq!(drive.default_block_size("T10K", 0), DEFAULT_BLOCK_SIZE);
    }
}
