//! Session controller
//!
//! One [`SessionController`] runs per accepted connection. It drives the
//! session through an explicit state loop:
//!
//! ```text
//! ReceivingClientInfo -> Authenticating -> ConnectingBack -> BuildingRequestList
//!   -> CheckingRequest -> AllocatingBuffers -> {DumpTape | RunningTransfer}
//!   -> LocalRetry? -> ReleasingDrive -> Done
//! ```
//!
//! Any step may fail; the error is merged into the session error state and
//! the loop goes straight to ReleasingDrive. A caller that has not been
//! answered yet gets a negative reply right away.

use std::collections::HashSet;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::accounting::{AccountingKind, AccountingRecord, AccountingSink};
use crate::buffer::BufferPool;
use crate::client::{self, AccountDb, ClientChannel, ClientListener, FlushMode};
use crate::config::Config;
use crate::control::{ErrorReport, ProcessingControl, SupervisorEvent};
use crate::drive::TapeDrive;
use crate::error::{Result, RtcpError};
use crate::protocol::{reqtype, timeouts, Severity};
use crate::protocol_core::{self as codec, ClientInfo, ClientReconnect, Message};
use crate::reqlist::{Continuation, RequestChecker, RequestListBuilder, SessionCredentials};
use crate::request::{DumpTapeRequest, FileId, FileRequest, ProcStatus, TapeRequest};
use crate::worker::{self, DiskWorkerPool, DumpSummary, TapeWorker, TransferContext};

/// Collaborators shared by every session of a daemon
pub struct SessionEnv {
    pub config: Config,
    pub drive: Arc<dyn TapeDrive>,
    pub accounts: Arc<dyn AccountDb>,
    pub accounting: Arc<dyn AccountingSink>,
}

/// The handle the daemon keeps on a live session
pub struct Session {
    pub id: String,
    pub peer: String,
    pub control: Arc<ProcessingControl>,
}

impl Session {
    pub fn new(peer: impl Into<String>, max_workers: usize) -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self {
            id,
            peer: peer.into(),
            control: Arc::new(ProcessingControl::new(max_workers)),
        }
    }

    pub fn abort(&self, by: &'static str) {
        self.control.abort(by);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    ReceivingClientInfo,
    Authenticating,
    ConnectingBack,
    BuildingRequestList,
    CheckingRequest,
    AllocatingBuffers,
    DumpTape,
    RunningTransfer,
    LocalRetry,
    ReleasingDrive,
    Done,
}

/// Outcome of one session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session: String,
    pub severity: Severity,
    /// 0 or a negative errno, as sent to the client
    pub status: i32,
    pub message: String,
    pub retries: u32,
    pub files: Vec<FileRequest>,
    pub files_reported: usize,
    pub drive_released: bool,
    pub flush_mode: Option<FlushMode>,
    pub buffers_allocated: usize,
    pub dumps: Vec<DumpSummary>,
    pub states: Vec<SessionState>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// Status and text the client sees for a given error state
fn end_status(report: &ErrorReport) -> (i32, String) {
    let sev = report.severity;
    if sev.is_failed() || sev.contains(Severity::RESELECT_SERVICE) {
        let code = if report.code != 0 { report.code } else { libc::EIO };
        let message = if report.message.is_empty() {
            "request failed".to_string()
        } else {
            report.message.clone()
        };
        (-code, message)
    } else if sev.contains(Severity::END_OF_DATA) {
        (0, "end of volume reached".to_string())
    } else {
        (0, String::new())
    }
}

pub struct SessionController {
    env: Arc<SessionEnv>,
    session: Arc<Session>,
    caller: Option<TcpStream>,
    info: Option<ClientInfo>,
    credentials: Option<SessionCredentials>,
    channel: Option<Arc<ClientChannel>>,
    listener: Option<ClientListener>,
    pool: Option<Arc<BufferPool>>,
    flush_mode: Option<FlushMode>,
    /// Request list bytes received over all builder runs
    received: usize,
    retries: u32,
    reported: HashSet<FileId>,
    replied: bool,
    /// Close without answering anybody
    silent: bool,
    client_lost: bool,
    drive_released: bool,
    buffers_allocated: usize,
    dumps: Vec<DumpSummary>,
    states: Vec<SessionState>,
    started: Instant,
}

impl SessionController {
    /// `caller` is the accepted connection from the scheduler or bridge
    pub fn new(env: Arc<SessionEnv>, session: Arc<Session>, caller: TcpStream) -> Self {
        Self {
            env,
            session,
            caller: Some(caller),
            info: None,
            credentials: None,
            channel: None,
            listener: None,
            pool: None,
            flush_mode: None,
            received: 0,
            retries: 0,
            reported: HashSet::new(),
            replied: false,
            silent: false,
            client_lost: false,
            drive_released: false,
            buffers_allocated: 0,
            dumps: Vec::new(),
            states: Vec::new(),
            started: Instant::now(),
        }
    }

    fn control(&self) -> &ProcessingControl {
        &self.session.control
    }

    fn config(&self) -> &Config {
        &self.env.config
    }

    pub fn run(mut self) -> SessionReport {
        info!(session = %self.session.id, peer = %self.session.peer, "session started");
        let mut state = SessionState::ReceivingClientInfo;
        loop {
            self.states.push(state);
            debug!(session = %self.session.id, ?state, "session state");
            let next = match state {
                SessionState::ReceivingClientInfo => self.receive_client_info(),
                SessionState::Authenticating => self.authenticate(),
                SessionState::ConnectingBack => self.connect_back(),
                SessionState::BuildingRequestList => self.build_request_list(),
                SessionState::CheckingRequest => self.check_request(),
                SessionState::AllocatingBuffers => self.allocate_buffers(),
                SessionState::DumpTape => self.dump(),
                SessionState::RunningTransfer => self.transfer(),
                SessionState::LocalRetry => self.local_retry(),
                SessionState::ReleasingDrive => self.release_drive(),
                SessionState::Done => break,
            };
            state = match next {
                Ok(s) => s,
                Err(e) => self.fail(e),
            };
        }
        self.finish()
    }

    fn fail(&mut self, err: RtcpError) -> SessionState {
        if !matches!(err, RtcpError::Cancelled) {
            let message = err.to_string();
            error!(session = %self.session.id, code = err.code(), "session error: {}", message);
            self.control().set_error(err.code(), err.severity(), &message);
        }
        if !self.replied && !self.silent {
            let (status, message) = end_status(&self.control().error_report());
            if let Err(e) = self.reply_to_caller(status, &message) {
                warn!(session = %self.session.id, "cannot answer caller: {}", e);
            }
        }
        SessionState::ReleasingDrive
    }

    fn reply_to_caller(&mut self, status: i32, message: &str) -> Result<()> {
        if self.replied {
            return Ok(());
        }
        self.replied = true;
        let req_type = self
            .info
            .as_ref()
            .map_or(reqtype::CLIENT_INFO, ClientInfo::req_type);
        if let Some(mut caller) = self.caller.take() {
            codec::write_frame(&mut caller, req_type, &codec::encode_status_reply(status, message))?;
            debug!(session = %self.session.id, status, "answered caller");
        }
        Ok(())
    }

    fn info(&self) -> Result<&ClientInfo> {
        self.info
            .as_ref()
            .ok_or_else(|| RtcpError::Sequence("no client info".into()))
    }

    fn channel(&self) -> Result<Arc<ClientChannel>> {
        self.channel
            .clone()
            .ok_or_else(|| RtcpError::Sequence("no client connection".into()))
    }

    fn remaining_budget(&self) -> usize {
        self.config().max_request_bytes.saturating_sub(self.received)
    }

    // --- states ---

    fn receive_client_info(&mut self) -> Result<SessionState> {
        if self.config().no_more_tapes_file.exists() {
            warn!(
                session = %self.session.id,
                path = %self.config().no_more_tapes_file.display(),
                "tape service interrupted, dropping request"
            );
            self.silent = true;
            let err = RtcpError::NoMoreTapes;
            self.control().set_error(err.code(), err.severity(), &err.to_string());
            return Ok(SessionState::Done);
        }
        let timeout = self.config().net_timeout();
        let caller = self
            .caller
            .as_mut()
            .ok_or_else(|| RtcpError::Protocol("caller connection gone".into()))?;
        caller.set_read_timeout(Some(timeout))?;
        caller.set_write_timeout(Some(timeout))?;
        let frame = codec::read_frame(caller)?;
        let info = codec::decode_client_info(&frame)?;
        info!(
            session = %self.session.id,
            uid = info.uid,
            gid = info.gid,
            host = %info.host,
            port = info.callback_port,
            unit = %info.unit,
            dgn = %info.dgn,
            bridge = info.bridge.is_some(),
            "client info received"
        );
        self.info = Some(info);
        Ok(SessionState::Authenticating)
    }

    fn authenticate(&mut self) -> Result<SessionState> {
        let cfg = &self.env.config;
        let info = self
            .info
            .as_ref()
            .ok_or_else(|| RtcpError::Sequence("no client info".into()))?;
        let account = client::authenticate(
            info,
            self.env.accounts.as_ref(),
            cfg.min_uid,
            &cfg.fallback_account,
        )?;
        let flush_mode = client::resolve_flush_mode(info, cfg.buffered_tape_marks);
        info!(session = %self.session.id, account = %account.name, ?flush_mode, "client authenticated");
        self.credentials = Some(SessionCredentials {
            uid: info.uid,
            gid: info.gid,
            vol_req_id: info.vol_req_id,
        });
        self.flush_mode = Some(flush_mode);
        Ok(SessionState::ConnectingBack)
    }

    fn connect_back(&mut self) -> Result<SessionState> {
        let info = self.info()?;
        let stream = client::connect_back(&info.host, info.callback_port, self.config().net_timeout())?;
        self.channel = Some(Arc::new(ClientChannel::new(stream)));
        self.reply_to_caller(0, "")?;
        Ok(SessionState::BuildingRequestList)
    }

    fn build_request_list(&mut self) -> Result<SessionState> {
        let credentials = self
            .credentials
            .ok_or_else(|| RtcpError::Sequence("client not authenticated".into()))?;
        let channel = self.channel()?;
        let control = Arc::clone(&self.session.control);
        let mut builder = RequestListBuilder::new(credentials, self.remaining_budget());
        let built = {
            let mut stream = channel.lock();
            builder.build(&mut *stream, control.request_graph(), None)
        };
        self.received += builder.received();
        let summary = built?;
        info!(
            session = %self.session.id,
            tapes = summary.tapes,
            files = summary.files,
            bytes = summary.bytes,
            "request list received"
        );
        self.handle_reconnect(summary.reconnect)?;
        self.account(AccountingKind::Receipt);
        Ok(SessionState::CheckingRequest)
    }

    fn handle_reconnect(&mut self, reconnect: Option<ClientReconnect>) -> Result<()> {
        if let Some(r) = reconnect {
            let stream = client::connect_back(&r.host, r.callback_port, self.config().net_timeout())?;
            self.channel()?.replace(stream);
            info!(session = %self.session.id, host = %r.host, port = r.callback_port, "switched to new client callback");
        }
        Ok(())
    }

    fn check_request(&mut self) -> Result<SessionState> {
        let checker = RequestChecker::new(self.env.drive.as_ref(), self.config().buffer_size());
        let mut graph = self.control().requests();
        checker.check_graph(&mut graph)?;
        Ok(SessionState::AllocatingBuffers)
    }

    fn allocate_buffers(&mut self) -> Result<SessionState> {
        let pool = Arc::new(BufferPool::allocate(
            self.config().nb_bufs,
            self.config().buffer_size(),
        )?);
        self.control().register(&pool);
        self.buffers_allocated = pool.len();
        self.pool = Some(pool);
        self.account(AccountingKind::CommandStart);

        let g = self.control().requests();
        let dumps = g.tape_ids().any(|t| g.tape(t).dump.is_some());
        Ok(if dumps {
            SessionState::DumpTape
        } else {
            SessionState::RunningTransfer
        })
    }

    fn dump(&mut self) -> Result<SessionState> {
        let jobs: Vec<(TapeRequest, DumpTapeRequest)> = {
            let g = self.control().requests();
            let jobs = g
                .tape_ids()
                .filter_map(|t| g.tape(t).dump.map(|d| (g.tape(t).req.clone(), d)))
                .collect();
            jobs
        };
        for (tape, dump) in jobs {
            let summary = worker::dump_tape(
                self.env.drive.as_ref(),
                &tape,
                &dump,
                self.control().cancellation(),
            )?;
            self.dumps.push(summary);
        }
        let more = {
            let g = self.control().requests();
            !worker::transfer_order(&g).is_empty() || worker::has_pending_placeholder(&g)
        };
        if more {
            return Ok(SessionState::RunningTransfer);
        }
        self.control().mark_drive_for_release();
        Ok(SessionState::ReleasingDrive)
    }

    fn transfer(&mut self) -> Result<SessionState> {
        self.run_transfer()?;
        if self.control().check_error().contains(Severity::LOCAL_RETRY) {
            Ok(SessionState::LocalRetry)
        } else {
            Ok(SessionState::ReleasingDrive)
        }
    }

    fn start_listener(&mut self) -> Result<()> {
        if self.listener.is_none() {
            let channel = self.channel()?;
            self.listener = Some(ClientListener::spawn(
                self.session.id.clone(),
                channel,
                Arc::clone(&self.session.control),
            )?);
        }
        Ok(())
    }

    fn run_transfer(&mut self) -> Result<()> {
        let pool = self
            .pool
            .clone()
            .ok_or_else(|| RtcpError::Sequence("transfer without buffers".into()))?;
        let control = Arc::clone(&self.session.control);
        let ctx = Arc::new(TransferContext::new(
            self.session.id.clone(),
            Arc::clone(&control),
            pool,
            Arc::clone(&self.env.drive),
            self.flush_mode.unwrap_or(FlushMode::NFlushesPerFile),
            self.config().reuse_mounted_volume,
        ));
        {
            let g = control.requests();
            ctx.queue.push(worker::transfer_order(&g));
            if !worker::has_pending_placeholder(&g) {
                ctx.queue.close();
            }
        }
        self.start_listener()?;

        let disks = match DiskWorkerPool::start(Arc::clone(&ctx), self.config().disk_workers) {
            Ok(d) => d,
            Err(e) => {
                let err = RtcpError::from(e);
                control.set_error(err.code(), Severity::FAILED | Severity::SYSTEM_ERROR, "cannot start disk workers");
                return Err(err);
            }
        };
        let tape = match TapeWorker::start(Arc::clone(&ctx)) {
            Ok(t) => t,
            Err(e) => {
                let err = RtcpError::from(e);
                control.set_error(err.code(), Severity::FAILED | Severity::SYSTEM_ERROR, "cannot start tape worker");
                ctx.queue.close();
                disks.join();
                return Err(err);
            }
        };
        info!(session = %self.session.id, attempt = self.retries + 1, "transfer started");

        let tick = Duration::from_millis(timeouts::SUPERVISE_TICK_MS);
        loop {
            match control.next_supervisor_event(tick) {
                Some(SupervisorEvent::FileDone(f)) => self.report_file(f),
                Some(SupervisorEvent::MoreWork(placeholder)) => self.more_work(&ctx, placeholder),
                Some(SupervisorEvent::TapeDone) => break,
                None if tape.is_finished() => break,
                None => {}
            }
        }
        if !tape.join() {
            control.set_error(libc::EIO, Severity::FAILED | Severity::SYSTEM_ERROR, "tape worker died");
        }
        ctx.queue.close();
        disks.join();
        for f in control.take_completed() {
            self.report_file(f);
        }
        if control.out_of_space() {
            control.set_error(
                libc::ENOSPC,
                Severity::FAILED | Severity::USER_ERROR,
                "disk full, transfer stopped",
            );
        }
        debug!(
            session = %self.session.id,
            disk_files = ctx.queue.processed(),
            severity = ?control.check_error(),
            "transfer attempt finished"
        );
        Ok(())
    }

    /// Answer the tape worker's request for more work. The worker is always
    /// acknowledged; on failure the error state wakes it instead.
    fn more_work(&mut self, ctx: &TransferContext, placeholder: FileId) {
        match self.fetch_more_work(placeholder) {
            Ok(files) => {
                debug!(session = %self.session.id, files = files.len(), "continuation received");
                ctx.queue.push(files);
                if !worker::has_pending_placeholder(&self.control().requests()) {
                    ctx.queue.close();
                }
            }
            Err(e) => {
                let message = e.to_string();
                error!(session = %self.session.id, "more-work request failed: {}", message);
                self.control().set_error(e.code(), e.severity(), &message);
            }
        }
        self.control().ack_more_work();
    }

    fn fetch_more_work(&mut self, placeholder: FileId) -> Result<Vec<FileId>> {
        let credentials = self
            .credentials
            .ok_or_else(|| RtcpError::Sequence("client not authenticated".into()))?;
        let control = Arc::clone(&self.session.control);
        let drive = Arc::clone(&self.env.drive);
        let buffer_size = self
            .pool
            .as_ref()
            .map_or(self.config().buffer_size(), |p| p.buffer_size());
        let (tape, echo) = {
            let g = control.requests();
            let entry = g.file(placeholder);
            (entry.tape, entry.req.clone())
        };
        let channel = self.channel()?;
        let mut builder = RequestListBuilder::new(credentials, self.remaining_budget())
            .with_checker(RequestChecker::new(drive.as_ref(), buffer_size));
        let built = {
            let mut stream = channel.lock();
            codec::write_message(&mut *stream, &Message::File(echo))?;
            codec::recv_ack(&mut *stream, reqtype::FILE_REQ)?;
            builder.build(
                &mut *stream,
                control.request_graph(),
                Some(Continuation { tape, placeholder }),
            )
        };
        self.received += builder.received();
        let summary = built?;
        self.handle_reconnect(summary.reconnect)?;

        let g = control.requests();
        let files = summary
            .new_files
            .into_iter()
            .filter(|f| worker::needs_transfer(g.file(*f)))
            .collect();
        Ok(files)
    }

    fn report_file(&mut self, file: FileId) {
        if self.client_lost || !self.reported.insert(file) {
            return;
        }
        let Some(channel) = self.channel.clone() else {
            return;
        };
        let req = self.control().requests().file(file).req.clone();
        debug!(
            session = %self.session.id,
            fseq = req.tape_fseq,
            status = ?req.proc_status,
            "reporting file"
        );
        if let Err(e) = channel.report_file(&req) {
            warn!(session = %self.session.id, "cannot report to client: {}", e);
            self.client_lost = true;
            self.control().set_error(
                e.code(),
                Severity::FAILED | Severity::USER_ERROR,
                "lost contact with client",
            );
        }
    }

    /// Local retries allowed: the failing tape request's own budget, else
    /// the configured default
    fn retry_limit(&self) -> u32 {
        let g = self.control().requests();
        let tape = g
            .tape_ids()
            .find(|t| g.tape(*t).req.err.severity.contains(Severity::LOCAL_RETRY))
            .or_else(|| g.tape_ids().next());
        let budget = tape.map(|t| g.tape(t).req.err.max_tape_retry);
        match budget {
            Some(n) if n >= 0 => n as u32,
            _ => self.config().max_local_retries,
        }
    }

    fn local_retry(&mut self) -> Result<SessionState> {
        let limit = self.retry_limit();
        let report = self.control().error_report();
        if self.retries >= limit {
            warn!(session = %self.session.id, retries = self.retries, limit, "local retry limit reached");
            let message = format!(
                "giving up after {} local retries: {}",
                self.retries, report.message
            );
            let retrying: Vec<FileId> = {
                let g = self.control().requests();
                let ids = g
                    .file_ids()
                    .into_iter()
                    .filter(|f| g.file(*f).req.err.severity.contains(Severity::LOCAL_RETRY))
                    .collect();
                ids
            };
            for f in retrying {
                self.control().set_request_status(
                    None,
                    Some(f),
                    report.code,
                    Severity::FAILED | Severity::SYSTEM_ERROR,
                    &message,
                );
            }
            self.control().set_error(
                report.code,
                Severity::FAILED | Severity::SYSTEM_ERROR,
                &message,
            );
            return Ok(SessionState::ReleasingDrive);
        }

        self.retries += 1;
        info!(
            session = %self.session.id,
            retry = self.retries,
            limit,
            "local retry: {}",
            report.message
        );
        {
            let control = Arc::clone(&self.session.control);
            let mut g = control.requests();
            g.reset_request();
            // rewound files are reported again once they finish
            self.reported
                .retain(|f| g.file(*f).req.proc_status.is_terminal());
        }
        if let Some(pool) = &self.pool {
            pool.reset();
        }
        if !self.control().clear_for_retry() {
            return Ok(SessionState::ReleasingDrive);
        }
        Ok(SessionState::RunningTransfer)
    }

    fn release_drive(&mut self) -> Result<SessionState> {
        if self.pool.is_some() {
            self.account(AccountingKind::CommandData);
        }
        let sev = self.control().check_error();
        if (sev.is_failed() || sev.contains(Severity::RESELECT_SERVICE))
            && !sev.contains(Severity::NO_RELEASE)
        {
            self.control().mark_drive_for_release();
        }
        if !self.control().drive_release_requested() {
            debug!(session = %self.session.id, "keeping drive");
            return Ok(SessionState::Done);
        }
        let unit = {
            let g = self.control().requests();
            let unit = g
                .tape_ids()
                .map(|t| g.tape(t).req.unit.clone())
                .find(|u| !u.is_empty());
            unit
        }
        .or_else(|| self.info.as_ref().map(|i| i.unit.clone()))
        .filter(|u| !u.is_empty());
        match unit {
            Some(unit) => match self.env.drive.release(&unit) {
                Ok(()) => {
                    self.drive_released = true;
                    info!(session = %self.session.id, unit = %unit, "drive released");
                }
                Err(e) => warn!(session = %self.session.id, unit = %unit, "drive release failed: {}", e),
            },
            None => debug!(session = %self.session.id, "no drive assigned, nothing to release"),
        }
        Ok(SessionState::Done)
    }

    fn finish(mut self) -> SessionReport {
        if let Some(listener) = self.listener.take() {
            listener.stop();
        }

        // Files that ended in error without passing through a worker
        let leftovers: Vec<FileId> = {
            let g = self.control().requests();
            let ids = g
                .file_ids()
                .into_iter()
                .filter(|f| {
                    let e = g.file(*f);
                    let sev = e.req.err.severity;
                    !e.exhausted_placeholder && sev != Severity::NONE && sev != Severity::OK
                })
                .collect();
            ids
        };
        for f in leftovers {
            self.report_file(f);
        }

        let report = self.control().error_report();
        let (status, message) = end_status(&report);
        if !self.silent {
            if !self.replied {
                if let Err(e) = self.reply_to_caller(status, &message) {
                    warn!(session = %self.session.id, "cannot answer caller: {}", e);
                }
            }
            if let Some(channel) = self.channel.clone() {
                if !self.client_lost {
                    if let Err(e) = channel.end_of_request(status, &message) {
                        warn!(session = %self.session.id, "end of request not acknowledged: {}", e);
                    }
                }
            }
        }

        self.account(AccountingKind::CommandCompletion);
        if status != 0 {
            self.account(AccountingKind::Error);
        }

        let files: Vec<FileRequest> = {
            let g = self.control().requests();
            let files = g.file_ids().into_iter().map(|f| g.file(f).req.clone()).collect();
            files
        };
        if let Some(pool) = self.pool.take() {
            pool.free();
        }

        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        if status == 0 {
            let bytes: u64 = files
                .iter()
                .filter(|f| f.proc_status == ProcStatus::Finished)
                .map(|f| f.bytes_in.max(f.bytes_out))
                .sum();
            let kib = bytes / 1024;
            info!(
                session = %self.session.id,
                kib,
                kib_per_sec = (kib as f64 / elapsed) as u64,
                retries = self.retries,
                "request successful"
            );
        } else {
            error!(
                session = %self.session.id,
                status,
                severity = ?report.severity,
                retries = self.retries,
                "request failed: {}",
                message
            );
        }

        SessionReport {
            session: self.session.id.clone(),
            severity: report.severity,
            status,
            message,
            retries: self.retries,
            files,
            files_reported: self.reported.len(),
            drive_released: self.drive_released,
            flush_mode: self.flush_mode,
            buffers_allocated: self.buffers_allocated,
            dumps: std::mem::take(&mut self.dumps),
            states: std::mem::take(&mut self.states),
        }
    }

    fn account(&self, kind: AccountingKind) {
        let Some(info) = &self.info else {
            return;
        };
        let mut rec = AccountingRecord::new(&self.session.id, kind);
        rec.uid = info.uid;
        rec.gid = info.gid;
        rec.client_host = info.host.clone();
        rec.unit = info.unit.clone();
        rec.dgn = info.dgn.clone();
        rec.retries = self.retries;

        let report = self.control().error_report();
        let (status, message) = end_status(&report);
        rec.status = status;
        rec.severity = report.severity.bits();
        if !message.is_empty() {
            rec.message = Some(message);
        }
        {
            let g = self.control().requests();
            if let Some(t) = g.tape_ids().next() {
                let tape = &g.tape(t).req;
                rec.command = tape.mode.command().to_string();
                rec.vid = tape.vid.clone();
                if !tape.unit.is_empty() {
                    rec.unit = tape.unit.clone();
                }
                if !tape.dgn.is_empty() {
                    rec.dgn = tape.dgn.clone();
                }
            }
            for f in g.file_ids() {
                let e = g.file(f);
                if e.req.proc_status == ProcStatus::Finished && !e.exhausted_placeholder {
                    rec.files += 1;
                    rec.bytes_in += e.req.bytes_in;
                    rec.bytes_out += e.req.bytes_out;
                }
            }
        }
        self.env.accounting.record(&rec);
    }
}
