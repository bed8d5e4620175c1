//! Tape and file request model
//!
//! A session's work is an ordered list of tape requests, each owning an
//! ordered list of file requests. Both live in a [`RequestGraph`] arena and
//! are addressed by [`TapeId`] / [`FileId`] so worker threads can refer to a
//! request without holding a borrow of the graph.

use crate::protocol::{concat, proc_status, Severity, MODE_READ, MODE_WRITE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TapeMode {
    #[default]
    Read,
    Write,
}

impl TapeMode {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            MODE_READ => Some(TapeMode::Read),
            MODE_WRITE => Some(TapeMode::Write),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            TapeMode::Read => MODE_READ,
            TapeMode::Write => MODE_WRITE,
        }
    }

    /// Accounting/log command name
    pub fn command(self) -> &'static str {
        match self {
            TapeMode::Read => "cptpdsk",
            TapeMode::Write => "cpdsktp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concat {
    #[default]
    Standalone,
    /// Appended to the previous file of the same tape request
    WithPrevious,
    /// Concatenate everything up to end of data into one disk file
    ToEndOfData,
}

impl Concat {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            concat::STANDALONE => Some(Concat::Standalone),
            concat::WITH_PREVIOUS => Some(Concat::WithPrevious),
            concat::TO_EOD => Some(Concat::ToEndOfData),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Concat::Standalone => concat::STANDALONE,
            Concat::WithPrevious => concat::WITH_PREVIOUS,
            Concat::ToEndOfData => concat::TO_EOD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcStatus {
    #[default]
    Waiting,
    Positioned,
    PartiallyFinished,
    Finished,
    EovHit,
    Unreachable,
    /// Placeholder asking the client for more work once reached
    RequestMoreWork,
}

impl ProcStatus {
    /// Unknown codes fall back to WAITING, like a fresh request
    pub fn from_code(code: u32) -> Self {
        match code {
            proc_status::POSITIONED => ProcStatus::Positioned,
            proc_status::PARTIALLY_FINISHED => ProcStatus::PartiallyFinished,
            proc_status::FINISHED => ProcStatus::Finished,
            proc_status::EOV_HIT => ProcStatus::EovHit,
            proc_status::UNREACHABLE => ProcStatus::Unreachable,
            proc_status::REQUEST_MORE_WORK => ProcStatus::RequestMoreWork,
            _ => ProcStatus::Waiting,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            ProcStatus::Waiting => proc_status::WAITING,
            ProcStatus::Positioned => proc_status::POSITIONED,
            ProcStatus::PartiallyFinished => proc_status::PARTIALLY_FINISHED,
            ProcStatus::Finished => proc_status::FINISHED,
            ProcStatus::EovHit => proc_status::EOV_HIT,
            ProcStatus::Unreachable => proc_status::UNREACHABLE,
            ProcStatus::RequestMoreWork => proc_status::REQUEST_MORE_WORK,
        }
    }

    /// Progress rank; status may only move to an equal or higher rank
    /// outside of a local-retry reset.
    fn rank(self) -> u8 {
        match self {
            ProcStatus::RequestMoreWork => 0,
            ProcStatus::Waiting => 1,
            ProcStatus::Positioned => 2,
            ProcStatus::PartiallyFinished
            | ProcStatus::Finished
            | ProcStatus::EovHit
            | ProcStatus::Unreachable => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    pub fn can_advance_to(self, next: ProcStatus) -> bool {
        next.rank() >= self.rank()
    }
}

/// Per-request error state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    pub message: String,
    pub severity: Severity,
    pub code: i32,
    /// Maximum local retries allowed for this request (< 0 = server default)
    pub max_tape_retry: i32,
    pub max_copy_retry: i32,
}

impl ErrorInfo {
    /// Reset code, message and severity. Retry budgets are kept.
    pub fn clear(&mut self) {
        self.message.clear();
        self.severity = Severity::NONE;
        self.code = 0;
    }
}

/// Unix timestamps (seconds) of one mount
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TapeTimes {
    pub start_request: u32,
    pub start_rtcpd: u32,
    pub start_mount: u32,
    pub end_mount: u32,
    pub start_unmount: u32,
    pub end_unmount: u32,
}

/// Unix timestamps (seconds) of one file transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileTimes {
    pub start_position: u32,
    pub end_position: u32,
    pub start_transfer_disk: u32,
    pub end_transfer_disk: u32,
    pub start_transfer_tape: u32,
    pub end_transfer_tape: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TapeRequest {
    pub vid: String,
    pub vsn: String,
    pub label: String,
    pub devtype: String,
    pub density: String,
    pub unit: String,
    /// Device group the drive belongs to
    pub dgn: String,
    pub vol_req_id: u32,
    pub job_id: u32,
    pub mode: TapeMode,
    pub start_file: u32,
    pub end_file: u32,
    pub side: u32,
    pub tprc: i32,
    pub times: TapeTimes,
    pub err: ErrorInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRequest {
    pub file_path: String,
    pub tape_path: String,
    pub recfm: String,
    pub fid: String,
    pub ifce: String,
    pub vol_req_id: u32,
    pub job_id: u32,
    pub position_method: u32,
    pub tape_fseq: u32,
    pub disk_fseq: u32,
    pub blocksize: i32,
    pub recordlength: i32,
    pub convert: i32,
    pub tp_err_action: i32,
    pub concat: Concat,
    pub proc_status: ProcStatus,
    pub cprc: i32,
    pub offset: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub host_bytes: u64,
    pub max_size: u64,
    pub times: FileTimes,
    pub err: ErrorInfo,
}

impl FileRequest {
    fn rewind(&mut self) {
        self.proc_status = ProcStatus::Waiting;
        self.bytes_in = 0;
        self.bytes_out = 0;
        self.host_bytes = 0;
        self.cprc = 0;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpTapeRequest {
    pub max_bytes: i32,
    pub block_size: i32,
    pub convert: i32,
    pub tp_err_action: i32,
    pub start_file: i32,
    pub max_file: i32,
    pub from_block: i32,
    pub to_block: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TapeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(usize);

impl TapeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl FileId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct TapeEntry {
    pub req: TapeRequest,
    pub files: Vec<FileId>,
    pub dump: Option<DumpTapeRequest>,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub req: FileRequest,
    pub tape: TapeId,
    /// Placeholder that was answered with an empty continuation
    pub exhausted_placeholder: bool,
}

/// Arena of all requests of one session
#[derive(Debug, Clone, Default)]
pub struct RequestGraph {
    tapes: Vec<TapeEntry>,
    files: Vec<FileEntry>,
}

impl RequestGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tape(&mut self, req: TapeRequest) -> TapeId {
        let id = TapeId(self.tapes.len());
        self.tapes.push(TapeEntry {
            req,
            files: Vec::new(),
            dump: None,
        });
        id
    }

    /// Append a file to the given tape request
    pub fn add_file(&mut self, tape: TapeId, req: FileRequest) -> FileId {
        let id = FileId(self.files.len());
        self.files.push(FileEntry {
            req,
            tape,
            exhausted_placeholder: false,
        });
        self.tapes[tape.0].files.push(id);
        id
    }

    pub fn last_tape(&self) -> Option<TapeId> {
        if self.tapes.is_empty() {
            None
        } else {
            Some(TapeId(self.tapes.len() - 1))
        }
    }

    pub fn tape(&self, id: TapeId) -> &TapeEntry {
        &self.tapes[id.0]
    }

    pub fn tape_mut(&mut self, id: TapeId) -> &mut TapeEntry {
        &mut self.tapes[id.0]
    }

    pub fn file(&self, id: FileId) -> &FileEntry {
        &self.files[id.0]
    }

    pub fn file_mut(&mut self, id: FileId) -> &mut FileEntry {
        &mut self.files[id.0]
    }

    pub fn tape_ids(&self) -> impl Iterator<Item = TapeId> {
        (0..self.tapes.len()).map(TapeId)
    }

    /// All files in request order (tape order, then file order)
    pub fn file_ids(&self) -> Vec<FileId> {
        self.tapes.iter().flat_map(|t| t.files.iter().copied()).collect()
    }

    pub fn tape_count(&self) -> usize {
        self.tapes.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tapes.is_empty()
    }

    /// First placeholder of a tape request still waiting for a continuation
    pub fn pending_placeholder(&self, tape: TapeId) -> Option<FileId> {
        self.tapes[tape.0].files.iter().copied().find(|f| {
            let entry = &self.files[f.0];
            entry.req.proc_status == ProcStatus::RequestMoreWork && !entry.exhausted_placeholder
        })
    }

    /// Replace a placeholder's request in place, keeping its id
    pub fn replace_placeholder(&mut self, id: FileId, req: FileRequest) {
        let entry = &mut self.files[id.0];
        entry.req = req;
        entry.exhausted_placeholder = false;
    }

    /// Previous file of the same tape request, if any
    pub fn previous_in_tape(&self, id: FileId) -> Option<FileId> {
        let tape = &self.tapes[self.files[id.0].tape.0];
        let pos = tape.files.iter().position(|f| *f == id)?;
        if pos == 0 {
            None
        } else {
            Some(tape.files[pos - 1])
        }
    }

    /// Files of `tape` partitioned into concatenation groups. A group starts at
    /// any file not flagged WithPrevious and extends over following
    /// WithPrevious files.
    pub fn concat_groups(&self, tape: TapeId) -> Vec<Vec<FileId>> {
        let mut groups: Vec<Vec<FileId>> = Vec::new();
        for id in &self.tapes[tape.0].files {
            let starts_group = self.files[id.0].req.concat != Concat::WithPrevious;
            match groups.last_mut() {
                Some(group) if !starts_group => group.push(*id),
                _ => groups.push(vec![*id]),
            }
        }
        groups
    }

    /// The concatenation group containing `id`
    pub fn group_of(&self, id: FileId) -> Vec<FileId> {
        let tape = self.files[id.0].tape;
        self.concat_groups(tape)
            .into_iter()
            .find(|g| g.contains(&id))
            .unwrap_or_else(|| vec![id])
    }

    /// Roll back partial progress before a local retry.
    ///
    /// Files still WAITING or POSITIONED go back to WAITING with counters
    /// zeroed. On tape-write requests a concatenation group whose files did not
    /// all reach FINISHED is rewound as a whole, error state included: a
    /// partially written group cannot be resumed mid-group. Files carrying
    /// FAILED keep their error state.
    pub fn reset_request(&mut self) {
        for tape in 0..self.tapes.len() {
            let mode = self.tapes[tape].req.mode;
            let ids = self.tapes[tape].files.clone();

            for id in &ids {
                let file = &mut self.files[id.0].req;
                if matches!(file.proc_status, ProcStatus::Waiting | ProcStatus::Positioned) {
                    file.rewind();
                    if !file.err.severity.is_failed() {
                        file.err.clear();
                    }
                }
            }

            if mode == TapeMode::Write {
                for group in self.concat_groups(TapeId(tape)) {
                    let complete = group
                        .iter()
                        .all(|id| self.files[id.0].req.proc_status == ProcStatus::Finished);
                    if complete {
                        continue;
                    }
                    for id in group {
                        let file = &mut self.files[id.0].req;
                        if file.proc_status == ProcStatus::RequestMoreWork {
                            continue;
                        }
                        file.rewind();
                        if !file.err.severity.is_failed() {
                            file.err.clear();
                        }
                    }
                }
            }

            let tape_err = &mut self.tapes[tape].req.err;
            if !tape_err.severity.is_failed() {
                tape_err.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(fseq: u32, concat: Concat, status: ProcStatus, bytes: u64) -> FileRequest {
        FileRequest {
            file_path: format!("/data/f{fseq}"),
            tape_fseq: fseq,
            concat,
            proc_status: status,
            bytes_in: bytes,
            bytes_out: bytes,
            ..Default::default()
        }
    }

    fn write_tape() -> TapeRequest {
        TapeRequest {
            vid: "T00001".into(),
            mode: TapeMode::Write,
            ..Default::default()
        }
    }

    #[test]
    fn test_unfinished_group_is_rewound_whole() {
        let mut g = RequestGraph::new();
        let t = g.add_tape(write_tape());
        let a = g.add_file(t, file(1, Concat::Standalone, ProcStatus::Finished, 100));
        let b = g.add_file(t, file(2, Concat::WithPrevious, ProcStatus::PartiallyFinished, 40));
        g.file_mut(b).req.err.severity = Severity::LOCAL_RETRY;

        g.reset_request();

        for id in [a, b] {
            let f = &g.file(id).req;
            assert_eq!(f.proc_status, ProcStatus::Waiting);
            assert_eq!(f.bytes_in, 0);
            assert_eq!(f.bytes_out, 0);
            assert_eq!(f.err.severity, Severity::NONE);
        }
    }

    #[test]
    fn test_finished_group_untouched() {
        let mut g = RequestGraph::new();
        let t = g.add_tape(write_tape());
        let a = g.add_file(t, file(1, Concat::Standalone, ProcStatus::Finished, 100));
        let b = g.add_file(t, file(2, Concat::WithPrevious, ProcStatus::Finished, 50));
        let c = g.add_file(t, file(3, Concat::Standalone, ProcStatus::Positioned, 10));

        g.reset_request();

        assert_eq!(g.file(a).req.proc_status, ProcStatus::Finished);
        assert_eq!(g.file(a).req.bytes_in, 100);
        assert_eq!(g.file(b).req.proc_status, ProcStatus::Finished);
        assert_eq!(g.file(b).req.bytes_in, 50);
        assert_eq!(g.file(c).req.proc_status, ProcStatus::Waiting);
        assert_eq!(g.file(c).req.bytes_in, 0);
    }

    #[test]
    fn test_read_mode_does_not_rewind_finished_group_members() {
        let mut g = RequestGraph::new();
        let t = g.add_tape(TapeRequest {
            mode: TapeMode::Read,
            ..write_tape()
        });
        let a = g.add_file(t, file(1, Concat::Standalone, ProcStatus::Finished, 100));
        let b = g.add_file(t, file(2, Concat::WithPrevious, ProcStatus::Positioned, 7));

        g.reset_request();

        assert_eq!(g.file(a).req.proc_status, ProcStatus::Finished);
        assert_eq!(g.file(b).req.proc_status, ProcStatus::Waiting);
        assert_eq!(g.file(b).req.bytes_in, 0);
    }

    #[test]
    fn test_reset_keeps_failed_error_state() {
        let mut g = RequestGraph::new();
        let t = g.add_tape(write_tape());
        let a = g.add_file(t, file(1, Concat::Standalone, ProcStatus::Positioned, 5));
        g.file_mut(a).req.err.severity = Severity::FAILED | Severity::USER_ERROR;

        g.reset_request();

        assert_eq!(g.file(a).req.proc_status, ProcStatus::Waiting);
        assert!(g.file(a).req.err.severity.is_failed());
    }

    #[test]
    fn test_concat_groups_partition() {
        let mut g = RequestGraph::new();
        let t = g.add_tape(write_tape());
        let a = g.add_file(t, file(1, Concat::Standalone, ProcStatus::Waiting, 0));
        let b = g.add_file(t, file(2, Concat::WithPrevious, ProcStatus::Waiting, 0));
        let c = g.add_file(t, file(3, Concat::Standalone, ProcStatus::Waiting, 0));
        let d = g.add_file(t, file(4, Concat::WithPrevious, ProcStatus::Waiting, 0));
        let e = g.add_file(t, file(5, Concat::WithPrevious, ProcStatus::Waiting, 0));

        assert_eq!(g.concat_groups(t), vec![vec![a, b], vec![c, d, e]]);
        assert_eq!(g.group_of(d), vec![c, d, e]);
        assert_eq!(g.previous_in_tape(c), Some(b));
        assert_eq!(g.previous_in_tape(a), None);
    }

    #[test]
    fn test_status_monotonic_rank() {
        assert!(ProcStatus::Waiting.can_advance_to(ProcStatus::Positioned));
        assert!(ProcStatus::Positioned.can_advance_to(ProcStatus::Finished));
        assert!(!ProcStatus::Finished.can_advance_to(ProcStatus::Waiting));
        assert!(!ProcStatus::Positioned.can_advance_to(ProcStatus::Waiting));
        assert!(ProcStatus::RequestMoreWork.can_advance_to(ProcStatus::Waiting));
    }

    #[test]
    fn test_unknown_proc_status_defaults_to_waiting() {
        assert_eq!(ProcStatus::from_code(0), ProcStatus::Waiting);
        assert_eq!(ProcStatus::from_code(999), ProcStatus::Waiting);
    }
}
