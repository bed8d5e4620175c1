//! Tape and disk transfer threads
//!
//! One tape worker and a pool of disk workers move data through the shared
//! buffer ring. Both sides walk the ring in the same order: a disk worker
//! pops a file from the [`DiskQueue`] and takes its buffer-ring ticket in the
//! same step, so the ring carries files in exactly the order the tape worker
//! visits them.
//!
//! Writing a tape, disk workers fill buffers and the tape worker drains them
//! onto the drive; reading, the roles swap. A tape file is a concatenation
//! group: the group's first file positions the drive and the tape mark is
//! written after its last member.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::buffer::BufferPool;
use crate::client::FlushMode;
use crate::control::{Cancellation, ProcessingControl, Wake};
use crate::drive::{TapeDrive, TapeFileWriter};
use crate::error::{DriveErrorKind, Result, RtcpError};
use crate::protocol::Severity;
use crate::request::{
    Concat, DumpTapeRequest, FileEntry, FileId, FileRequest, ProcStatus, RequestGraph, TapeId,
    TapeMode, TapeRequest,
};
use crate::serialize::Ticket;

fn now() -> u32 {
    chrono::Utc::now().timestamp().max(0) as u32
}

/// Whether a file still has to be moved in this attempt
pub fn needs_transfer(entry: &FileEntry) -> bool {
    let status = entry.req.proc_status;
    !entry.exhausted_placeholder
        && status != ProcStatus::RequestMoreWork
        && !status.is_terminal()
        && !entry.req.err.severity.is_failed()
}

/// Any tape request still waiting on a continuation from the client
pub fn has_pending_placeholder(graph: &RequestGraph) -> bool {
    graph
        .tape_ids()
        .any(|t| graph.tape(t).dump.is_none() && graph.pending_placeholder(t).is_some())
}

/// Files the disk side must see, in tape-worker order
pub fn transfer_order(graph: &RequestGraph) -> Vec<FileId> {
    graph
        .tape_ids()
        .filter(|t| graph.tape(*t).dump.is_none())
        .flat_map(|t| graph.tape(t).files.clone())
        .filter(|f| needs_transfer(graph.file(*f)))
        .collect()
}

/// A write-mode file closes its tape file unless the next file of the same
/// tape request is concatenated to it
fn ends_tape_file(graph: &RequestGraph, file: FileId) -> bool {
    let files = &graph.tape(graph.file(file).tape).files;
    files
        .iter()
        .position(|f| *f == file)
        .and_then(|p| files.get(p + 1))
        .map_or(true, |next| graph.file(*next).req.concat != Concat::WithPrevious)
}

#[derive(Debug, Default)]
struct QueueState {
    files: VecDeque<FileId>,
    closed: bool,
}

/// Files waiting for a disk worker
#[derive(Debug, Default)]
pub struct DiskQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    processed: AtomicUsize,
}

impl DiskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<I: IntoIterator<Item = FileId>>(&self, files: I) {
        let mut st = self.state.lock();
        st.files.extend(files);
        self.cond.notify_all();
    }

    /// No more files will be pushed; idle workers exit
    pub fn close(&self) {
        let mut st = self.state.lock();
        st.closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Files completed by disk workers
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Pop the next file together with its place on the buffer ring. None
    /// once the queue is closed and drained.
    pub fn pop_with_ticket<'c>(
        &self,
        control: &'c ProcessingControl,
    ) -> Result<Option<(FileId, Ticket<'c>)>> {
        let mut st = self.state.lock();
        loop {
            if control.cancellation().is_cancelled() {
                return Err(RtcpError::Cancelled);
            }
            if let Some(file) = st.files.pop_front() {
                let ticket = control.buffer_ring.enqueue()?;
                return Ok(Some((file, ticket)));
            }
            if st.closed {
                return Ok(None);
            }
            self.cond.wait(&mut st);
        }
    }
}

impl Wake for DiskQueue {
    fn wake_all(&self) {
        let _st = self.state.lock();
        self.cond.notify_all();
    }
}

/// Everything one transfer attempt shares between its threads
pub struct TransferContext {
    pub session: String,
    pub control: Arc<ProcessingControl>,
    pub pool: Arc<BufferPool>,
    pub drive: Arc<dyn TapeDrive>,
    pub queue: Arc<DiskQueue>,
    pub flush_mode: FlushMode,
    pub reuse_mounted_volume: bool,
    /// Next ring slot on the disk side; only touched by the ring holder
    disk_ring: AtomicUsize,
}

impl TransferContext {
    pub fn new(
        session: impl Into<String>,
        control: Arc<ProcessingControl>,
        pool: Arc<BufferPool>,
        drive: Arc<dyn TapeDrive>,
        flush_mode: FlushMode,
        reuse_mounted_volume: bool,
    ) -> Self {
        let queue = Arc::new(DiskQueue::new());
        control.register(&queue);
        Self {
            session: session.into(),
            control,
            pool,
            drive,
            queue,
            flush_mode,
            reuse_mounted_volume,
            disk_ring: AtomicUsize::new(0),
        }
    }

    fn cancel(&self) -> &Cancellation {
        self.control.cancellation()
    }

    fn file_snapshot(&self, file: FileId) -> (FileRequest, TapeMode) {
        let g = self.control.requests();
        let entry = g.file(file);
        (entry.req.clone(), g.tape(entry.tape).req.mode)
    }

    fn useful_size(&self, req: &FileRequest) -> Result<usize> {
        let block = req.blocksize.max(0) as usize;
        self.pool.useful_size(block).ok_or_else(|| {
            RtcpError::InvalidRequest(format!(
                "{}: block size {} does not fit a {} byte buffer",
                req.file_path,
                req.blocksize,
                self.pool.buffer_size()
            ))
        })
    }

    /// Record a worker failure on the request and the session. A cancelled
    /// wait only means someone else already did.
    fn report_failure(&self, tape: Option<TapeId>, file: Option<FileId>, err: &RtcpError) {
        if matches!(err, RtcpError::Cancelled) {
            debug!(session = %self.session, "worker stopped by session error state");
            return;
        }
        let (code, severity, message) = (err.code(), err.severity(), err.to_string());
        error!(session = %self.session, code, ?severity, "transfer error: {}", message);
        if tape.is_some() || file.is_some() {
            self.control
                .set_request_status(tape, file, code, severity, &message);
        }
        self.control.set_error(code, severity, &message);
    }
}

// --- disk side ---

pub struct DiskWorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl DiskWorkerPool {
    pub fn start(ctx: Arc<TransferContext>, workers: usize) -> std::io::Result<Self> {
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers.max(1) {
            let ctx = Arc::clone(&ctx);
            let handle = thread::Builder::new()
                .name(format!("disk-{}-{}", ctx.session, id))
                .spawn(move || disk_worker(&ctx, id))?;
            handles.push(handle);
        }
        Ok(Self { handles })
    }

    pub fn join(self) {
        for h in self.handles {
            if h.join().is_err() {
                error!("disk worker panicked");
            }
        }
    }
}

fn disk_worker(ctx: &TransferContext, id: usize) {
    debug!(session = %ctx.session, worker = id, "disk worker started");
    loop {
        let (file, ticket) = match ctx.queue.pop_with_ticket(&ctx.control) {
            Ok(Some(next)) => next,
            Ok(None) => break,
            Err(e) => {
                ctx.report_failure(None, None, &e);
                break;
            }
        };
        if let Err(e) = disk_transfer(ctx, file, ticket) {
            let tape = ctx.control.requests().file(file).tape;
            ctx.report_failure(Some(tape), Some(file), &e);
            break;
        }
        ctx.queue.processed.fetch_add(1, Ordering::SeqCst);
    }
    debug!(session = %ctx.session, worker = id, "disk worker exiting");
}

fn disk_transfer(ctx: &TransferContext, file: FileId, ticket: Ticket<'_>) -> Result<()> {
    let _ring = ticket.wait(ctx.cancel())?;
    let (req, mode) = ctx.file_snapshot(file);
    match mode {
        TapeMode::Write => fill_from_disk(ctx, file, &req),
        TapeMode::Read => drain_to_disk(ctx, file, &req),
    }
}

/// Tape write: read the disk file into consecutive ring buffers
fn fill_from_disk(ctx: &TransferContext, file: FileId, req: &FileRequest) -> Result<()> {
    let useful = ctx.useful_size(req)?;
    let ends = ends_tape_file(&ctx.control.requests(), file);
    ctx.control.requests().file_mut(file).req.times.start_transfer_disk = now();

    let mut disk = File::open(&req.file_path)?;
    let size = disk.metadata()?.len();
    let mut cursor = ctx.disk_ring.load(Ordering::SeqCst);
    let mut total = 0u64;
    loop {
        let mut lease = ctx.pool.buffer(cursor).fill(ctx.cancel())?;
        cursor += 1;
        let data = lease.data_mut();
        data.resize(useful, 0);
        let mut filled = 0;
        while filled < useful {
            let n = disk.read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);
        total += filled as u64;
        let last = filled < useful || total >= size;
        lease.commit(last && ends, last);
        if last {
            break;
        }
    }
    ctx.disk_ring.store(cursor, Ordering::SeqCst);

    let mut g = ctx.control.requests();
    let entry = &mut g.file_mut(file).req;
    entry.bytes_in = total;
    entry.host_bytes = total;
    entry.times.end_transfer_disk = now();
    debug!(session = %ctx.session, fseq = req.tape_fseq, bytes = total, path = %req.file_path, "disk file read");
    Ok(())
}

/// Tape read: write consecutive ring buffers into the disk file. Running out
/// of disk space fails this file only; its buffers are still drained so the
/// tape side can reach the next file boundary.
fn drain_to_disk(ctx: &TransferContext, file: FileId, req: &FileRequest) -> Result<()> {
    let append = req.concat == Concat::WithPrevious;
    let _append_guard = if append {
        Some(ctx.control.disk_append.acquire(ctx.cancel())?)
    } else {
        None
    };
    ctx.control.requests().file_mut(file).req.times.start_transfer_disk = now();

    let mut opts = OpenOptions::new();
    opts.create(true);
    if append {
        opts.append(true);
    } else {
        opts.write(true).truncate(true);
    }
    let mut disk = opts.open(&req.file_path)?;

    let mut cursor = ctx.disk_ring.load(Ordering::SeqCst);
    let mut total = 0u64;
    let mut no_space = false;
    loop {
        let lease = ctx.pool.buffer(cursor).drain(ctx.cancel())?;
        cursor += 1;
        if !no_space && !lease.data().is_empty() {
            match disk.write_all(lease.data()) {
                Ok(()) => total += lease.data().len() as u64,
                Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
                    no_space = true;
                    ctx.control.flag_out_of_space();
                    let tape = ctx.control.requests().file(file).tape;
                    ctx.control.set_request_status(
                        Some(tape),
                        Some(file),
                        libc::ENOSPC,
                        Severity::FAILED | Severity::USER_ERROR,
                        &format!("{}: no space left on device", req.file_path),
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        if lease.last_buffer() {
            break;
        }
    }
    ctx.disk_ring.store(cursor, Ordering::SeqCst);
    if no_space {
        warn!(session = %ctx.session, path = %req.file_path, "disk file abandoned, out of space");
        return Ok(());
    }
    disk.flush()?;

    {
        let mut g = ctx.control.requests();
        let entry = &mut g.file_mut(file).req;
        entry.bytes_out = total;
        entry.host_bytes = total;
        entry.times.end_transfer_disk = now();
    }
    ctx.control.set_proc_status(file, ProcStatus::Finished);
    ctx.control.file_done(file);
    debug!(session = %ctx.session, fseq = req.tape_fseq, bytes = total, path = %req.file_path, "disk file written");
    Ok(())
}

// --- tape side ---

/// Buffered tape marks waiting for a drive flush
#[derive(Debug)]
pub struct Flusher {
    mode: FlushMode,
    pending: Vec<FileId>,
    tape_files: u64,
    bytes: u64,
}

impl Flusher {
    pub fn new(mode: FlushMode) -> Self {
        Self {
            mode,
            pending: Vec::new(),
            tape_files: 0,
            bytes: 0,
        }
    }

    pub fn pending(&self) -> &[FileId] {
        &self.pending
    }

    /// A tape file was closed; flush if the mode says so
    pub fn tape_file_closed(
        &mut self,
        control: &ProcessingControl,
        drive: &dyn TapeDrive,
        tape: &TapeRequest,
        group: Vec<FileId>,
        bytes: u64,
    ) -> Result<()> {
        self.pending.extend(group);
        self.tape_files += 1;
        self.bytes += bytes;
        let due = match self.mode {
            FlushMode::NFlushesPerFile => true,
            FlushMode::OneFlushPerNFiles {
                max_bytes,
                max_files,
            } => self.tape_files >= max_files || self.bytes >= max_bytes,
        };
        if due {
            self.flush(control, drive, tape)?;
        }
        Ok(())
    }

    /// Make every pending tape mark durable; the files behind them are done
    pub fn flush(
        &mut self,
        control: &ProcessingControl,
        drive: &dyn TapeDrive,
        tape: &TapeRequest,
    ) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        drive.flush(tape)?;
        debug!(vid = %tape.vid, files = self.pending.len(), bytes = self.bytes, "tape marks flushed");
        let t = now();
        for f in self.pending.drain(..) {
            control.requests().file_mut(f).req.times.end_transfer_tape = t;
            control.set_proc_status(f, ProcStatus::Finished);
            control.file_done(f);
        }
        self.tape_files = 0;
        self.bytes = 0;
        Ok(())
    }
}

pub struct TapeWorker {
    handle: JoinHandle<()>,
}

impl TapeWorker {
    pub fn start(ctx: Arc<TransferContext>) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("tape-{}", ctx.session))
            .spawn(move || {
                let mut run = TapeRun::new(&ctx);
                if let Err(e) = run.run() {
                    run.fail(e);
                }
                ctx.control.tape_worker_done();
            })?;
        Ok(Self { handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// false if the thread panicked
    pub fn join(self) -> bool {
        if self.handle.join().is_err() {
            error!("tape worker panicked");
            return false;
        }
        true
    }
}

struct TapeRun<'a> {
    ctx: &'a TransferContext,
    ring: usize,
    tape: Option<TapeId>,
    tape_req: Option<TapeRequest>,
    file: Option<FileId>,
    writer: Option<Box<dyn TapeFileWriter>>,
    /// Members of the tape file being written
    group: Vec<FileId>,
    group_bytes: u64,
    flusher: Flusher,
}

impl<'a> TapeRun<'a> {
    fn new(ctx: &'a TransferContext) -> Self {
        Self {
            ctx,
            ring: 0,
            tape: None,
            tape_req: None,
            file: None,
            writer: None,
            group: Vec::new(),
            group_bytes: 0,
            flusher: Flusher::new(ctx.flush_mode),
        }
    }

    fn run(&mut self) -> Result<()> {
        let tapes: Vec<TapeId> = self.ctx.control.requests().tape_ids().collect();
        for tape in tapes {
            let (req, has_work) = {
                let g = self.ctx.control.requests();
                let entry = g.tape(tape);
                let has_work = entry.dump.is_none()
                    && (g.pending_placeholder(tape).is_some()
                        || entry.files.iter().any(|f| needs_transfer(g.file(*f))));
                (entry.req.clone(), has_work)
            };
            if !has_work {
                continue;
            }
            self.tape = Some(tape);
            self.tape_req = Some(req.clone());
            self.mount(tape, &req)?;
            self.run_tape(tape, &req)?;
            self.finish_tape(tape, &req)?;
            self.tape_req = None;
        }
        if !self.ctx.reuse_mounted_volume {
            self.ctx.control.mark_drive_for_release();
        }
        Ok(())
    }

    fn mount(&mut self, tape: TapeId, req: &TapeRequest) -> Result<()> {
        self.ctx.control.requests().tape_mut(tape).req.times.start_mount = now();
        self.ctx.drive.mount(req)?;
        self.ctx.control.requests().tape_mut(tape).req.times.end_mount = now();
        info!(session = %self.ctx.session, vid = %req.vid, mode = ?req.mode, "volume mounted");
        Ok(())
    }

    fn run_tape(&mut self, tape: TapeId, req: &TapeRequest) -> Result<()> {
        let mut i = 0;
        loop {
            if self.ctx.cancel().is_cancelled() {
                return Err(RtcpError::Cancelled);
            }
            let next = {
                let g = self.ctx.control.requests();
                g.tape(tape).files.get(i).map(|f| {
                    let entry = g.file(*f);
                    let placeholder = entry.req.proc_status == ProcStatus::RequestMoreWork
                        && !entry.exhausted_placeholder;
                    (*f, placeholder, needs_transfer(entry))
                })
            };
            let Some((file, placeholder, pending)) = next else {
                break;
            };
            if placeholder {
                self.flusher
                    .flush(&self.ctx.control, self.ctx.drive.as_ref(), req)?;
                debug!(session = %self.ctx.session, vid = %req.vid, "asking client for more work");
                self.ctx.control.request_more_work(file)?;
                // The placeholder slot now holds the continuation, if any
                continue;
            }
            if !pending {
                i += 1;
                continue;
            }
            if self.ctx.control.out_of_space() {
                self.ctx.control.set_error(
                    libc::ENOSPC,
                    Severity::FAILED | Severity::USER_ERROR,
                    "disk full, transfer stopped",
                );
                return Err(RtcpError::Cancelled);
            }
            self.file = Some(file);
            match req.mode {
                TapeMode::Write => self.write_file(req, file)?,
                TapeMode::Read => self.read_file(req, file)?,
            }
            self.file = None;
            i += 1;
        }
        Ok(())
    }

    fn finish_tape(&mut self, tape: TapeId, req: &TapeRequest) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            warn!(vid = %req.vid, "tape file left open at end of request, closing");
            writer.close()?;
            let group = std::mem::take(&mut self.group);
            self.flusher.tape_file_closed(
                &self.ctx.control,
                self.ctx.drive.as_ref(),
                req,
                group,
                self.group_bytes,
            )?;
        }
        self.flusher
            .flush(&self.ctx.control, self.ctx.drive.as_ref(), req)?;
        if self.ctx.reuse_mounted_volume {
            debug!(vid = %req.vid, "keeping volume mounted");
            return Ok(());
        }
        self.ctx.control.requests().tape_mut(tape).req.times.start_unmount = now();
        self.ctx.drive.unmount(req)?;
        self.ctx.control.requests().tape_mut(tape).req.times.end_unmount = now();
        Ok(())
    }

    fn position(&self, req: &TapeRequest, file: FileId) {
        let t = now();
        {
            let mut g = self.ctx.control.requests();
            let times = &mut g.file_mut(file).req.times;
            times.start_position = t;
            times.end_position = t;
            times.start_transfer_tape = t;
        }
        self.ctx.control.set_proc_status(file, ProcStatus::Positioned);
        debug!(session = %self.ctx.session, vid = %req.vid, "positioned");
    }

    fn write_file(&mut self, req: &TapeRequest, file: FileId) -> Result<()> {
        let (freq, _) = self.ctx.file_snapshot(file);
        if freq.concat != Concat::WithPrevious || self.writer.is_none() {
            let _pos = self.ctx.control.tape_position.acquire(self.ctx.cancel())?;
            self.writer = Some(self.ctx.drive.open_write(req, freq.tape_fseq)?);
            self.group.clear();
            self.group_bytes = 0;
        }
        self.position(req, file);
        self.group.push(file);

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| RtcpError::Sequence("no open tape file".into()))?;
        let mut total = 0u64;
        let closes = loop {
            let lease = self.ctx.pool.buffer(self.ring).drain(self.ctx.cancel())?;
            self.ring += 1;
            if !lease.data().is_empty() {
                writer.write(lease.data())?;
                total += lease.data().len() as u64;
            }
            if lease.last_buffer() {
                break lease.end_of_tape_file();
            }
        };
        self.ctx.control.requests().file_mut(file).req.bytes_out = total;
        self.group_bytes += total;
        debug!(session = %self.ctx.session, fseq = freq.tape_fseq, bytes = total, "file written to tape");

        if closes {
            if let Some(writer) = self.writer.take() {
                writer.close()?;
            }
            let group = std::mem::take(&mut self.group);
            self.flusher.tape_file_closed(
                &self.ctx.control,
                self.ctx.drive.as_ref(),
                req,
                group,
                self.group_bytes,
            )?;
        }
        Ok(())
    }

    fn read_file(&mut self, req: &TapeRequest, file: FileId) -> Result<()> {
        let (freq, _) = self.ctx.file_snapshot(file);
        let useful = self.ctx.useful_size(&freq)?;
        let block = freq.blocksize.max(1) as usize;
        let to_eod = freq.concat == Concat::ToEndOfData;
        self.position(req, file);

        let mut fseq = freq.tape_fseq;
        let mut total = 0u64;
        let mut tape_files = 0u32;
        loop {
            let reader = {
                let _pos = self.ctx.control.tape_position.acquire(self.ctx.cancel())?;
                self.ctx.drive.open_read(req, fseq)
            };
            let mut reader = match reader {
                Ok(r) => r,
                Err(e) if to_eod && tape_files > 0 && e.kind == DriveErrorKind::EndOfData => {
                    // Close the disk file after the last tape file
                    let lease = self.ctx.pool.buffer(self.ring).fill(self.ctx.cancel())?;
                    self.ring += 1;
                    lease.commit(false, true);
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            loop {
                let mut lease = self.ctx.pool.buffer(self.ring).fill(self.ctx.cancel())?;
                self.ring += 1;
                let data = lease.data_mut();
                data.resize(useful, 0);
                let mut filled = 0;
                let mut mark = false;
                while filled < useful {
                    let end = (filled + block).min(useful);
                    let n = reader.read(&mut data[filled..end])?;
                    if n == 0 {
                        mark = true;
                        break;
                    }
                    filled += n;
                }
                data.truncate(filled);
                total += filled as u64;
                lease.commit(mark, mark && !to_eod);
                if mark {
                    break;
                }
            }
            tape_files += 1;
            if !to_eod {
                break;
            }
            fseq += 1;
        }

        {
            let mut g = self.ctx.control.requests();
            let entry = &mut g.file_mut(file).req;
            entry.bytes_in = total;
            entry.times.end_transfer_tape = now();
        }
        debug!(session = %self.ctx.session, fseq = freq.tape_fseq, tape_files, bytes = total, "tape file read");
        Ok(())
    }

    /// Terminal error path: attribute the error, settle what can be settled
    /// and take the volume down
    fn fail(&mut self, err: RtcpError) {
        let eov = matches!(&err, RtcpError::Drive(d) if d.kind == DriveErrorKind::EndOfVolume);
        if eov {
            self.end_of_volume();
        }
        self.ctx.report_failure(self.tape, self.file, &err);
        self.writer = None;
        if let Some(req) = self.tape_req.take() {
            if let Err(e) = self.ctx.drive.unmount(&req) {
                warn!(vid = %req.vid, "unmount after error failed: {}", e);
            }
        }
    }

    /// Files already behind a tape mark are kept; the tape file in progress
    /// did not fit
    fn end_of_volume(&mut self) {
        if let Some(req) = self.tape_req.clone() {
            if let Err(e) = self
                .flusher
                .flush(&self.ctx.control, self.ctx.drive.as_ref(), &req)
            {
                warn!(vid = %req.vid, "flush at end of volume failed: {}", e);
            }
            info!(session = %self.ctx.session, vid = %req.vid, "end of volume reached");
        }
        let mut hit = std::mem::take(&mut self.group);
        if let Some(f) = self.file {
            if !hit.contains(&f) {
                hit.push(f);
            }
        }
        for f in hit {
            if self.ctx.control.set_proc_status(f, ProcStatus::EovHit) {
                self.ctx.control.file_done(f);
            }
        }
    }
}

// --- dump ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpSummary {
    pub files: u32,
    pub blocks: u64,
    pub bytes: u64,
}

/// Read a volume block by block and report what is on it
pub fn dump_tape(
    drive: &dyn TapeDrive,
    tape: &TapeRequest,
    dump: &DumpTapeRequest,
    cancel: &Cancellation,
) -> Result<DumpSummary> {
    let block_size = if dump.block_size > 0 {
        dump.block_size as usize
    } else {
        drive.default_block_size(&tape.dgn, 0)
    };
    let first = dump.start_file.max(1) as u32;
    let from_block = dump.from_block.max(1) as u64;
    let to_block = if dump.to_block > 0 {
        Some(dump.to_block as u64)
    } else {
        None
    };

    drive.mount(tape)?;
    let mut summary = DumpSummary::default();
    let mut buf = vec![0u8; block_size];
    let mut fseq = first;
    let result = loop {
        if cancel.is_cancelled() {
            break Err(RtcpError::Cancelled);
        }
        if dump.max_file > 0 && summary.files >= dump.max_file as u32 {
            break Ok(());
        }
        let mut reader = match drive.open_read(tape, fseq) {
            Ok(r) => r,
            Err(e) if e.kind == DriveErrorKind::EndOfData => break Ok(()),
            Err(e) => break Err(e.into()),
        };
        let (mut blocks, mut bytes) = (0u64, 0u64);
        let mut block_no = 0u64;
        let read = loop {
            if dump.max_bytes > 0 && bytes >= dump.max_bytes as u64 {
                break Ok(());
            }
            if to_block.is_some_and(|last| block_no >= last) {
                break Ok(());
            }
            match reader.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    block_no += 1;
                    if block_no >= from_block {
                        blocks += 1;
                        bytes += n as u64;
                    }
                }
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = read {
            break Err(e.into());
        }
        info!(vid = %tape.vid, fseq, blocks, bytes, "dumped tape file");
        summary.files += 1;
        summary.blocks += blocks;
        summary.bytes += bytes;
        fseq += 1;
    };
    if let Err(e) = drive.unmount(tape) {
        warn!(vid = %tape.vid, "unmount after dump failed: {}", e);
    }
    result?;
    info!(
        vid = %tape.vid,
        files = summary.files,
        blocks = summary.blocks,
        bytes = summary.bytes,
        "tape dump complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::SupervisorEvent;
    use crate::drive::DirectoryDrive;
    use std::path::Path;
    use std::time::Duration;

    struct Harness {
        control: Arc<ProcessingControl>,
        drive: Arc<DirectoryDrive>,
        files: Vec<FileId>,
        _dir: tempfile::TempDir,
    }

    fn harness(mode: TapeMode, files: Vec<FileRequest>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(DirectoryDrive::new(dir.path().join("tapes")));
        let control = Arc::new(ProcessingControl::new(2));
        let ids = {
            let mut g = control.requests();
            let t = g.add_tape(TapeRequest {
                vid: "V00001".into(),
                mode,
                ..Default::default()
            });
            files.into_iter().map(|f| g.add_file(t, f)).collect()
        };
        Harness {
            control,
            drive,
            files: ids,
            _dir: dir,
        }
    }

    fn file(path: &Path, fseq: u32, concat: Concat) -> FileRequest {
        FileRequest {
            file_path: path.to_string_lossy().into_owned(),
            tape_fseq: fseq,
            blocksize: 1024,
            concat,
            ..Default::default()
        }
    }

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    /// Run one attempt the way the session controller does, minus the client
    fn run(h: &Harness, mode: FlushMode) -> Vec<FileId> {
        let pool = Arc::new(BufferPool::allocate(3, 4096).unwrap());
        h.control.register(&pool);
        let drive: Arc<dyn TapeDrive> = h.drive.clone();
        let ctx = Arc::new(TransferContext::new(
            "t",
            Arc::clone(&h.control),
            pool,
            drive,
            mode,
            false,
        ));
        ctx.queue.push(transfer_order(&h.control.requests()));
        ctx.queue.close();
        let disks = DiskWorkerPool::start(Arc::clone(&ctx), 2).unwrap();
        let tape = TapeWorker::start(Arc::clone(&ctx)).unwrap();
        let mut done = Vec::new();
        loop {
            match h.control.next_supervisor_event(Duration::from_millis(50)) {
                Some(SupervisorEvent::FileDone(f)) => done.push(f),
                Some(SupervisorEvent::TapeDone) => break,
                Some(SupervisorEvent::MoreWork(_)) => panic!("no placeholder in this test"),
                None if tape.is_finished() => break,
                None => {}
            }
        }
        tape.join();
        ctx.queue.close();
        disks.join();
        done.extend(h.control.take_completed());
        done
    }

    fn status(h: &Harness, f: FileId) -> ProcStatus {
        h.control.requests().file(f).req.proc_status
    }

    #[test]
    fn test_queue_pops_in_order_and_closes() {
        let control = ProcessingControl::new(2);
        let (a, b) = {
            let mut g = control.requests();
            let t = g.add_tape(TapeRequest::default());
            (g.add_file(t, FileRequest::default()), g.add_file(t, FileRequest::default()))
        };
        let q = DiskQueue::new();
        q.push([a, b]);
        q.close();
        let (first, t1) = q.pop_with_ticket(&control).unwrap().unwrap();
        let (second, t2) = q.pop_with_ticket(&control).unwrap().unwrap();
        assert_eq!((first, second), (a, b));
        assert_eq!(control.buffer_ring.waiting(), 2);
        drop((t1, t2));
        assert!(q.pop_with_ticket(&control).unwrap().is_none());
    }

    #[test]
    fn test_queue_wait_is_cancelled() {
        let control = Arc::new(ProcessingControl::new(2));
        let q = Arc::new(DiskQueue::new());
        control.register(&q);
        let (c2, q2) = (Arc::clone(&control), Arc::clone(&q));
        let h = thread::spawn(move || q2.pop_with_ticket(&c2).map(|r| r.is_some()));
        thread::sleep(Duration::from_millis(50));
        control.set_error(libc::EIO, Severity::FAILED, "stop");
        assert!(matches!(h.join().unwrap(), Err(RtcpError::Cancelled)));
    }

    #[test]
    fn test_write_concat_group_shares_one_tape_file() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, c) = (dir.path().join("a"), dir.path().join("b"), dir.path().join("c"));
        std::fs::write(&a, payload(10_000, 1)).unwrap();
        std::fs::write(&b, payload(3_000, 2)).unwrap();
        std::fs::write(&c, b"").unwrap();
        let h = harness(
            TapeMode::Write,
            vec![
                file(&a, 1, Concat::Standalone),
                file(&b, 1, Concat::WithPrevious),
                file(&c, 2, Concat::Standalone),
            ],
        );

        let done = run(&h, FlushMode::NFlushesPerFile);

        assert_eq!(done.len(), 3);
        assert_eq!(h.control.check_error(), Severity::OK);
        for f in &h.files {
            assert_eq!(status(&h, *f), ProcStatus::Finished);
        }
        let mut expected = payload(10_000, 1);
        expected.extend(payload(3_000, 2));
        assert_eq!(std::fs::read(h.drive.tape_file_path("V00001", 1)).unwrap(), expected);
        assert_eq!(std::fs::read(h.drive.tape_file_path("V00001", 2)).unwrap().len(), 0);
        assert_eq!(h.drive.flush_count(), 2);
        assert_eq!(h.control.requests().file(h.files[0]).req.bytes_out, 10_000);
        assert!(h.control.drive_release_requested());
        assert!(h.drive.mounted().is_none());
    }

    #[test]
    fn test_one_flush_per_n_files_batches_marks() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<_> = (0..3).map(|i| dir.path().join(format!("f{i}"))).collect();
        let mut reqs = Vec::new();
        for (i, p) in paths.iter().enumerate() {
            std::fs::write(p, payload(500, i as u8)).unwrap();
            reqs.push(file(p, i as u32 + 1, Concat::Standalone));
        }
        let h = harness(TapeMode::Write, reqs);

        let done = run(
            &h,
            FlushMode::OneFlushPerNFiles {
                max_bytes: u64::MAX,
                max_files: 50,
            },
        );

        assert_eq!(done.len(), 3);
        // One flush at the end of the tape covers every file
        assert_eq!(h.drive.flush_count(), 1);
    }

    #[test]
    fn test_read_back_with_previous_and_to_eod() {
        let dir = tempfile::tempdir().unwrap();
        let tapes = dir.path().join("tapes").join("V00001");
        std::fs::create_dir_all(&tapes).unwrap();
        for fseq in 1..=3u32 {
            std::fs::write(tapes.join(format!("{fseq:05}.tape")), payload(5_000, fseq as u8)).unwrap();
        }
        let joined = dir.path().join("joined");
        let all = dir.path().join("all");

        let mut h = harness(
            TapeMode::Read,
            vec![
                file(&joined, 1, Concat::Standalone),
                file(&joined, 2, Concat::WithPrevious),
                file(&all, 1, Concat::ToEndOfData),
            ],
        );
        h.drive = Arc::new(DirectoryDrive::new(dir.path().join("tapes")));

        let done = run(&h, FlushMode::NFlushesPerFile);

        assert_eq!(h.control.check_error(), Severity::OK);
        assert_eq!(done.len(), 3);
        let mut expected = payload(5_000, 1);
        expected.extend(payload(5_000, 2));
        assert_eq!(std::fs::read(&joined).unwrap(), expected);
        expected.extend(payload(5_000, 3));
        assert_eq!(std::fs::read(&all).unwrap(), expected);
        assert_eq!(h.control.requests().file(h.files[2]).req.bytes_in, 15_000);
    }

    #[test]
    fn test_missing_disk_file_fails_session() {
        let h = harness(
            TapeMode::Write,
            vec![file(Path::new("/nonexistent/rtcpd/input"), 1, Concat::Standalone)],
        );
        run(&h, FlushMode::NFlushesPerFile);
        assert!(h.control.check_error().is_failed());
        let (code, sev) = h.control.check_request_status(None, Some(h.files[0])).unwrap();
        assert_eq!(code, libc::ENOENT);
        assert!(sev.is_failed());
        assert!(h.drive.mounted().is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_disk_full_drains_then_fails() {
        if !Path::new("/dev/full").exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let tapes = dir.path().join("tapes").join("V00001");
        std::fs::create_dir_all(&tapes).unwrap();
        std::fs::write(tapes.join("00001.tape"), payload(9_000, 1)).unwrap();
        std::fs::write(tapes.join("00002.tape"), payload(100, 2)).unwrap();
        let mut h = harness(
            TapeMode::Read,
            vec![
                file(Path::new("/dev/full"), 1, Concat::Standalone),
                file(&dir.path().join("second"), 2, Concat::Standalone),
            ],
        );
        h.drive = Arc::new(DirectoryDrive::new(dir.path().join("tapes")));

        run(&h, FlushMode::NFlushesPerFile);
        if !h.control.check_error().is_failed() {
            // Tape side finished first; the controller settles it
            assert!(h.control.out_of_space());
        }
        let (code, sev) = h.control.check_request_status(None, Some(h.files[0])).unwrap();
        assert_eq!(code, libc::ENOSPC);
        assert!(sev.contains(Severity::FAILED | Severity::USER_ERROR));
        assert_ne!(status(&h, h.files[0]), ProcStatus::Finished);
    }

    #[test]
    fn test_flusher_counts_files_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DirectoryDrive::new(dir.path());
        let control = ProcessingControl::new(1);
        let tape = TapeRequest {
            vid: "V00009".into(),
            mode: TapeMode::Write,
            ..Default::default()
        };
        let ids: Vec<FileId> = {
            let mut g = control.requests();
            let t = g.add_tape(tape.clone());
            (0..3).map(|_| g.add_file(t, FileRequest::default())).collect()
        };
        let mut fl = Flusher::new(FlushMode::OneFlushPerNFiles {
            max_bytes: 1_000,
            max_files: 10,
        });
        fl.tape_file_closed(&control, &drive, &tape, vec![ids[0]], 600).unwrap();
        assert_eq!(drive.flush_count(), 0);
        assert_eq!(fl.pending(), &[ids[0]]);
        fl.tape_file_closed(&control, &drive, &tape, vec![ids[1]], 600).unwrap();
        assert_eq!(drive.flush_count(), 1);
        assert!(fl.pending().is_empty());
        assert_eq!(control.take_completed(), vec![ids[0], ids[1]]);
        assert_eq!(control.requests().file(ids[2]).req.proc_status, ProcStatus::Waiting);
    }

    #[test]
    fn test_dump_counts_blocks_until_end_of_data() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DirectoryDrive::new(dir.path());
        let tape = TapeRequest {
            vid: "V00003".into(),
            mode: TapeMode::Read,
            ..Default::default()
        };
        std::fs::create_dir_all(dir.path().join("V00003")).unwrap();
        std::fs::write(drive.tape_file_path("V00003", 1), payload(2_500, 0)).unwrap();
        std::fs::write(drive.tape_file_path("V00003", 2), payload(1_000, 0)).unwrap();

        let dump = DumpTapeRequest {
            block_size: 1_000,
            ..Default::default()
        };
        let s = dump_tape(&drive, &tape, &dump, &Cancellation::new()).unwrap();
        assert_eq!(s, DumpSummary { files: 2, blocks: 4, bytes: 3_500 });
        assert!(drive.mounted().is_none());

        let one = DumpTapeRequest {
            block_size: 1_000,
            max_file: 1,
            ..Default::default()
        };
        assert_eq!(dump_tape(&drive, &tape, &one, &Cancellation::new()).unwrap().files, 1);
    }
}
