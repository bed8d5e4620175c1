//! Session-wide processing control
//!
//! One [`ProcessingControl`] exists per session. It owns the global error
//! state, the request graph (guarded by the request-status lock), the
//! serialized-access domains, the "more work" negotiation flags and the
//! cancellation broadcast that guarantees no participant stays blocked once
//! the session enters a FAILED / RESELECT / LOCAL_RETRY / END_OF_DATA state.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::protocol::Severity;
use crate::request::{FileId, ProcStatus, RequestGraph, TapeId, TapeMode};
use crate::serialize::SerializedAccess;

/// How long `check_error` waits for the control lock before assuming the
/// session is unrecoverable
const CONTROL_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Anything a blocked thread may be waiting on. `wake_all` must take the
/// waiter's mutex before notifying so the wakeup cannot be lost.
pub trait Wake: Send + Sync {
    fn wake_all(&self);
}

/// Cancellation flag observed by every blocking primitive
#[derive(Debug, Default)]
pub struct Cancellation {
    cancelled: AtomicBool,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReport {
    pub severity: Severity,
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Default)]
struct MoreWork {
    requested: Option<FileId>,
    acked: bool,
    tape_done: bool,
    /// Files that reached a terminal state and still need reporting
    completed: VecDeque<FileId>,
}

/// What woke the supervising controller thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    FileDone(FileId),
    MoreWork(FileId),
    TapeDone,
}

pub struct ProcessingControl {
    error: Mutex<ErrorReport>,
    requests: Mutex<RequestGraph>,
    more_work: Mutex<MoreWork>,
    more_work_cv: Condvar,
    cancel: Cancellation,
    pub disk_append: SerializedAccess,
    pub tape_position: SerializedAccess,
    pub buffer_ring: SerializedAccess,
    waiters: Mutex<Vec<Weak<dyn Wake>>>,
    out_of_space: AtomicBool,
    release_drive: AtomicBool,
}

impl ProcessingControl {
    /// `max_workers` bounds the fairness queues: one slot per disk worker
    /// plus the tape worker.
    pub fn new(max_workers: usize) -> Self {
        let slots = max_workers.max(1) + 1;
        Self {
            error: Mutex::new(ErrorReport {
                severity: Severity::OK,
                ..Default::default()
            }),
            requests: Mutex::new(RequestGraph::new()),
            more_work: Mutex::new(MoreWork::default()),
            more_work_cv: Condvar::new(),
            cancel: Cancellation::new(),
            disk_append: SerializedAccess::new("disk-file-append", slots),
            tape_position: SerializedAccess::new("tape-position", slots),
            buffer_ring: SerializedAccess::new("buffer-ring", slots),
            waiters: Mutex::new(Vec::new()),
            out_of_space: AtomicBool::new(false),
            release_drive: AtomicBool::new(false),
        }
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    /// Register an extra wait domain (buffer pool, disk work queue) for the
    /// cancellation broadcast. Only a weak reference is kept.
    pub fn register<W: Wake + 'static>(&self, waiter: &Arc<W>) {
        let weak: Weak<dyn Wake> = Arc::downgrade(waiter) as Weak<dyn Wake>;
        let mut waiters = self.waiters.lock();
        waiters.retain(|w| w.strong_count() > 0);
        waiters.push(weak);
    }

    /// Merge a new error into the global state.
    ///
    /// Once FAILED is set the call only logs. Error-class severities strip OK
    /// and LOCAL_RETRY. A result carrying FAILED, RESELECT_SERVICE,
    /// LOCAL_RETRY or END_OF_DATA wakes every blocked participant.
    pub fn set_error(&self, code: i32, severity: Severity, message: &str) -> Severity {
        let result = {
            let mut state = self.error.lock();
            if state.severity.is_failed() {
                debug!(code, ?severity, "session already FAILED, error ignored: {}", message);
                return state.severity;
            }
            state.severity.escalate(severity);
            if code != 0 {
                state.code = code;
            }
            if !message.is_empty() && state.message.is_empty() {
                state.message = message.to_string();
            }
            state.severity
        };
        debug!(code, ?severity, ?result, "set_error: {}", message);
        if result.intersects(Severity::BROADCAST) {
            self.broadcast_exception();
        }
        result
    }

    /// Current global severity. Fails safe to FAILED when the control lock
    /// cannot be taken.
    pub fn check_error(&self) -> Severity {
        match self.error.try_lock_for(CONTROL_LOCK_TIMEOUT) {
            Some(state) => state.severity,
            None => {
                error!("check_error: control lock unavailable, assuming FAILED");
                Severity::FAILED
            }
        }
    }

    pub fn error_report(&self) -> ErrorReport {
        self.error.lock().clone()
    }

    /// Prepare the error state for another local attempt. Refused once the
    /// session has FAILED.
    pub fn clear_for_retry(&self) -> bool {
        {
            let mut state = self.error.lock();
            if state.severity.is_failed() {
                return false;
            }
            *state = ErrorReport {
                severity: Severity::OK,
                ..Default::default()
            };
        }
        {
            let mut mw = self.more_work.lock();
            let completed = std::mem::take(&mut mw.completed);
            *mw = MoreWork {
                completed,
                ..Default::default()
            };
        }
        self.out_of_space.store(false, Ordering::SeqCst);
        self.cancel.clear();
        true
    }

    /// Wake every thread blocked on any session wait domain
    pub fn broadcast_exception(&self) {
        self.cancel.set();
        {
            let _guard = self.more_work.lock();
            self.more_work_cv.notify_all();
        }
        self.disk_append.wake_all();
        self.tape_position.wake_all();
        self.buffer_ring.wake_all();
        let waiters: Vec<Arc<dyn Wake>> =
            self.waiters.lock().iter().filter_map(|w| w.upgrade()).collect();
        for w in waiters {
            w.wake_all();
        }
    }

    /// Convenience for user or operator aborts
    pub fn abort(&self, by: &'static str) {
        warn!("request aborted by {}", by);
        self.set_error(
            libc::ECANCELED,
            Severity::FAILED | Severity::USER_ERROR,
            &format!("request aborted by {by}"),
        );
    }

    // --- request-status domain ---

    /// Lock the request graph (request-status lock)
    pub fn requests(&self) -> MutexGuard<'_, RequestGraph> {
        self.requests.lock()
    }

    /// The request-status lock itself, for code that locks per message
    pub fn request_graph(&self) -> &Mutex<RequestGraph> {
        &self.requests
    }

    /// Record an error on a tape and/or file request. A FAILED request keeps
    /// its state. On tape-write requests a FAILED or LOCAL_RETRY file
    /// propagates backwards through its concatenation group.
    pub fn set_request_status(
        &self,
        tape: Option<TapeId>,
        file: Option<FileId>,
        code: i32,
        severity: Severity,
        message: &str,
    ) {
        debug!(code, ?severity, "set_request_status: {}", message);
        let mut graph = self.requests.lock();
        if let Some(t) = tape {
            merge_request_error(&mut graph.tape_mut(t).req.err, code, severity, message);
        }
        if let Some(f) = file {
            let owner = graph.file(f).tape;
            let write = graph.tape(owner).req.mode == TapeMode::Write;
            let targets = if write && severity.intersects(Severity::FAILED | Severity::LOCAL_RETRY)
            {
                let group = graph.group_of(f);
                let pos = group.iter().position(|g| *g == f).unwrap_or(0);
                group[..=pos].to_vec()
            } else {
                vec![f]
            };
            for id in targets {
                merge_request_error(&mut graph.file_mut(id).req.err, code, severity, message);
            }
        }
    }

    /// (code, severity) of exactly one of tape or file
    pub fn check_request_status(
        &self,
        tape: Option<TapeId>,
        file: Option<FileId>,
    ) -> Option<(i32, Severity)> {
        let graph = self.requests.lock();
        match (tape, file) {
            (Some(t), None) => {
                let err = &graph.tape(t).req.err;
                Some((err.code, err.severity))
            }
            (None, Some(f)) => {
                let err = &graph.file(f).req.err;
                Some((err.code, err.severity))
            }
            _ => None,
        }
    }

    /// Advance a file's processing status. Backward moves are refused.
    pub fn set_proc_status(&self, file: FileId, status: ProcStatus) -> bool {
        let mut graph = self.requests.lock();
        let req = &mut graph.file_mut(file).req;
        if !req.proc_status.can_advance_to(status) {
            warn!(
                fseq = req.tape_fseq,
                "refusing status change {:?} -> {:?}", req.proc_status, status
            );
            return false;
        }
        req.proc_status = status;
        true
    }

    // --- more-work negotiation ---

    /// Called by the tape worker on reaching a placeholder. Blocks until the
    /// controller has answered or the session is cancelled.
    pub fn request_more_work(&self, placeholder: FileId) -> crate::error::Result<()> {
        let mut mw = self.more_work.lock();
        mw.requested = Some(placeholder);
        mw.acked = false;
        self.more_work_cv.notify_all();
        loop {
            if mw.acked {
                mw.acked = false;
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(crate::error::RtcpError::Cancelled);
            }
            self.more_work_cv.wait(&mut mw);
        }
    }

    pub fn ack_more_work(&self) {
        let mut mw = self.more_work.lock();
        mw.acked = true;
        self.more_work_cv.notify_all();
    }

    /// Queue a finished file for status reporting
    pub fn file_done(&self, file: FileId) {
        let mut mw = self.more_work.lock();
        mw.completed.push_back(file);
        self.more_work_cv.notify_all();
    }

    /// Everything queued by `file_done` and not yet picked up
    pub fn take_completed(&self) -> Vec<FileId> {
        self.more_work.lock().completed.drain(..).collect()
    }

    pub fn tape_worker_done(&self) {
        let mut mw = self.more_work.lock();
        mw.tape_done = true;
        self.more_work_cv.notify_all();
    }

    /// Wait up to `timeout` for something the controller must act on
    pub fn next_supervisor_event(&self, timeout: Duration) -> Option<SupervisorEvent> {
        let mut mw = self.more_work.lock();
        loop {
            if let Some(f) = mw.completed.pop_front() {
                return Some(SupervisorEvent::FileDone(f));
            }
            if let Some(f) = mw.requested.take() {
                return Some(SupervisorEvent::MoreWork(f));
            }
            if mw.tape_done {
                return Some(SupervisorEvent::TapeDone);
            }
            if self.more_work_cv.wait_for(&mut mw, timeout).timed_out() {
                return None;
            }
        }
    }

    // --- flags ---

    /// Disk ran out of space; in-flight files drain before this is acted on
    pub fn flag_out_of_space(&self) {
        if !self.out_of_space.swap(true, Ordering::SeqCst) {
            warn!("disk out of space, draining in-flight files");
        }
    }

    pub fn out_of_space(&self) -> bool {
        self.out_of_space.load(Ordering::SeqCst)
    }

    /// Decide that the drive must be released. Only the first caller wins.
    pub fn mark_drive_for_release(&self) -> bool {
        !self.release_drive.swap(true, Ordering::SeqCst)
    }

    pub fn drive_release_requested(&self) -> bool {
        self.release_drive.load(Ordering::SeqCst)
    }
}

fn merge_request_error(
    err: &mut crate::request::ErrorInfo,
    code: i32,
    severity: Severity,
    message: &str,
) {
    // Don't reset a FAILED status
    if err.severity.is_failed() {
        return;
    }
    err.code = code;
    err.severity.escalate(severity);
    if !message.is_empty() {
        err.message = message.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Concat, FileRequest, TapeRequest};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_failed_is_never_downgraded() {
        let ctl = ProcessingControl::new(2);
        ctl.set_error(libc::EIO, Severity::FAILED | Severity::SYSTEM_ERROR, "boom");
        let before = ctl.check_error();
        for sev in [
            Severity::OK,
            Severity::LOCAL_RETRY,
            Severity::END_OF_DATA,
            Severity::RESELECT_SERVICE,
        ] {
            ctl.set_error(1, sev, "later");
        }
        assert_eq!(ctl.check_error(), before);
        assert_eq!(ctl.error_report().message, "boom");
        assert!(!ctl.clear_for_retry());
    }

    #[test]
    fn test_error_class_clears_local_retry() {
        let ctl = ProcessingControl::new(2);
        ctl.set_error(libc::EAGAIN, Severity::LOCAL_RETRY, "retry");
        assert!(ctl.check_error().contains(Severity::LOCAL_RETRY));
        ctl.set_error(libc::EIO, Severity::SYSTEM_ERROR, "syerr");
        let sev = ctl.check_error();
        assert!(!sev.contains(Severity::LOCAL_RETRY));
        assert!(!sev.contains(Severity::OK));
        assert!(sev.contains(Severity::SYSTEM_ERROR));
    }

    #[test]
    fn test_local_retry_broadcasts_and_clears() {
        let ctl = ProcessingControl::new(2);
        ctl.set_error(libc::EAGAIN, Severity::LOCAL_RETRY, "retry");
        assert!(ctl.cancellation().is_cancelled());
        assert!(ctl.clear_for_retry());
        assert!(!ctl.cancellation().is_cancelled());
        assert_eq!(ctl.check_error(), Severity::OK);
    }

    #[test]
    fn test_informational_error_does_not_cancel() {
        let ctl = ProcessingControl::new(2);
        ctl.set_error(0, Severity::NO_RELEASE, "");
        assert!(!ctl.cancellation().is_cancelled());
    }

    struct CountingWaiter(AtomicUsize);
    impl Wake for CountingWaiter {
        fn wake_all(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_broadcast_reaches_registered_waiters() {
        let ctl = ProcessingControl::new(2);
        let w = Arc::new(CountingWaiter(AtomicUsize::new(0)));
        ctl.register(&w);
        ctl.set_error(libc::EIO, Severity::FAILED, "x");
        assert_eq!(w.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_more_work_wait_is_cancelled() {
        let ctl = Arc::new(ProcessingControl::new(2));
        let f = {
            let mut g = ctl.requests();
            let t = g.add_tape(TapeRequest::default());
            g.add_file(t, FileRequest::default())
        };
        let c2 = Arc::clone(&ctl);
        let h = thread::spawn(move || c2.request_more_work(f));
        assert_eq!(
            ctl.next_supervisor_event(Duration::from_secs(5)),
            Some(SupervisorEvent::MoreWork(f))
        );
        ctl.set_error(libc::EIO, Severity::FAILED, "dying");
        assert!(h.join().unwrap().is_err());
    }

    #[test]
    fn test_request_status_propagates_back_through_write_group() {
        let ctl = ProcessingControl::new(2);
        let (a, b, c) = {
            let mut g = ctl.requests();
            let t = g.add_tape(TapeRequest {
                mode: TapeMode::Write,
                ..Default::default()
            });
            let a = g.add_file(t, FileRequest::default());
            let b = g.add_file(
                t,
                FileRequest {
                    concat: Concat::WithPrevious,
                    ..Default::default()
                },
            );
            let c = g.add_file(t, FileRequest::default());
            (a, b, c)
        };
        ctl.set_request_status(None, Some(b), libc::EIO, Severity::FAILED, "tape error");
        assert!(ctl.check_request_status(None, Some(a)).unwrap().1.is_failed());
        assert!(ctl.check_request_status(None, Some(b)).unwrap().1.is_failed());
        assert!(!ctl.check_request_status(None, Some(c)).unwrap().1.is_failed());

        // FAILED request state is sticky
        ctl.set_request_status(None, Some(a), 0, Severity::OK, "");
        assert_eq!(ctl.check_request_status(None, Some(a)).unwrap().0, libc::EIO);
    }

    #[test]
    fn test_drive_release_flag_set_once() {
        let ctl = ProcessingControl::new(1);
        assert!(!ctl.drive_release_requested());
        assert!(ctl.mark_drive_for_release());
        assert!(!ctl.mark_drive_for_release());
        assert!(ctl.drive_release_requested());
    }
}
