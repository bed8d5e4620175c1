//! Request list reception
//!
//! [`RequestListBuilder`] reads the client's stream of tape, file and dump
//! requests into the session's [`RequestGraph`], acknowledging each message
//! before reading the next. It runs once after the callback connection is
//! up, and again each time the tape worker reaches a "more work"
//! placeholder. [`RequestChecker`] holds the per-request validation shared by
//! both paths.

use parking_lot::Mutex;
use std::io::{Read, Write};
use tracing::{debug, info, warn};

use crate::drive::TapeDrive;
use crate::error::{Result, RtcpError};
use crate::protocol::reqtype;
use crate::protocol_core::{self as codec, ClientReconnect, Message};
use crate::request::{
    Concat, FileId, FileRequest, ProcStatus, RequestGraph, TapeId, TapeMode, TapeRequest,
};

/// Identity every message of the session must be consistent with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCredentials {
    pub uid: u32,
    pub gid: u32,
    pub vol_req_id: u32,
}

/// Where a continuation lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continuation {
    pub tape: TapeId,
    pub placeholder: FileId,
}

#[derive(Debug, Default)]
pub struct BuildSummary {
    pub tapes: usize,
    pub files: usize,
    pub bytes: usize,
    /// Files added or filled in by this call, in arrival order
    pub new_files: Vec<FileId>,
    /// Last reconnect announcement seen, if any
    pub reconnect: Option<ClientReconnect>,
}

pub struct RequestListBuilder<'a> {
    credentials: SessionCredentials,
    max_bytes: usize,
    received: usize,
    checker: Option<RequestChecker<'a>>,
}

impl<'a> RequestListBuilder<'a> {
    pub fn new(credentials: SessionCredentials, max_bytes: usize) -> Self {
        Self {
            credentials,
            max_bytes,
            received: 0,
            checker: None,
        }
    }

    /// Validate continuation file requests as they arrive
    pub fn with_checker(mut self, checker: RequestChecker<'a>) -> Self {
        self.checker = Some(checker);
        self
    }

    /// Bytes received so far over all invocations
    pub fn received(&self) -> usize {
        self.received
    }

    /// Read messages until NOMORE_REQ.
    ///
    /// With `continuation` set, file requests go to that tape request, the
    /// first one taking over the placeholder's slot; tape requests are not
    /// allowed. An empty continuation retires the placeholder.
    pub fn build<S: Read + Write>(
        &mut self,
        stream: &mut S,
        graph: &Mutex<RequestGraph>,
        continuation: Option<Continuation>,
    ) -> Result<BuildSummary> {
        let mut summary = BuildSummary::default();
        let mut placeholder = continuation.map(|c| c.placeholder);
        let mut current_tape = continuation.map(|c| c.tape);

        loop {
            let frame = codec::read_frame(stream)?;
            self.received += frame.wire_len();
            summary.bytes += frame.wire_len();
            if self.received > self.max_bytes {
                let err = RtcpError::RequestTooLong {
                    received: self.received,
                    limit: self.max_bytes,
                };
                let _ = codec::send_ack(stream, frame.req_type, -err.code());
                return Err(err);
            }

            let msg = match codec::decode_message(&frame) {
                Ok(m) => m,
                Err(e) => {
                    let _ = codec::send_ack(stream, frame.req_type, -e.code());
                    return Err(e);
                }
            };
            debug!(req = reqtype::name(frame.req_type), len = frame.body.len(), "request list message");

            let accepted = match msg {
                Message::NoMore => {
                    codec::send_ack(stream, frame.req_type, 0)?;
                    break;
                }
                other => self.accept(other, graph, continuation, &mut current_tape, &mut placeholder, &mut summary),
            };
            if let Err(e) = accepted {
                warn!("rejecting {}: {}", reqtype::name(frame.req_type), e);
                let _ = codec::send_ack(stream, frame.req_type, -e.code());
                return Err(e);
            }
            codec::send_ack(stream, frame.req_type, 0)?;
        }

        if let Some(ph) = placeholder {
            // Client had nothing more for us
            let mut g = graph.lock();
            let entry = g.file_mut(ph);
            entry.exhausted_placeholder = true;
            entry.req.proc_status = ProcStatus::Finished;
            info!(fseq = entry.req.tape_fseq, "no more work from client");
        }

        debug!(
            tapes = summary.tapes,
            files = summary.files,
            bytes = summary.bytes,
            total = self.received,
            "request list received"
        );
        Ok(summary)
    }

    fn accept(
        &self,
        msg: Message,
        graph: &Mutex<RequestGraph>,
        continuation: Option<Continuation>,
        current_tape: &mut Option<TapeId>,
        placeholder: &mut Option<FileId>,
        summary: &mut BuildSummary,
    ) -> Result<()> {
        match msg {
            Message::Tape(tape) | Message::TapeErr(tape) => {
                if continuation.is_some() {
                    return Err(RtcpError::Sequence(
                        "tape request not allowed in a more-work continuation".into(),
                    ));
                }
                if tape.vol_req_id != self.credentials.vol_req_id {
                    return Err(RtcpError::Sequence(format!(
                        "tape request VolReqID {} does not match session {}",
                        tape.vol_req_id, self.credentials.vol_req_id
                    )));
                }
                debug!(vid = %tape.vid, mode = ?tape.mode, "tape request");
                *current_tape = Some(graph.lock().add_tape(tape));
                summary.tapes += 1;
            }
            Message::File(mut file) | Message::FileErr(mut file) => {
                let tape = current_tape.ok_or_else(|| {
                    RtcpError::Sequence("file request received before any tape request".into())
                })?;
                let mut g = graph.lock();
                if g.tape(tape).dump.is_some() {
                    return Err(RtcpError::Sequence(
                        "file request after dump-tape request".into(),
                    ));
                }
                if let Some(checker) = &self.checker {
                    if continuation.is_some() {
                        // A continuation starts a new tape file
                        let first = placeholder.is_some() || g.tape(tape).files.is_empty();
                        checker.check_file(&g.tape(tape).req, &mut file, first)?;
                    }
                }
                let id = match placeholder.take() {
                    Some(ph) => {
                        g.replace_placeholder(ph, file);
                        ph
                    }
                    None => g.add_file(tape, file),
                };
                summary.files += 1;
                summary.new_files.push(id);
            }
            Message::DumpTape(dump) => {
                let tape = current_tape.ok_or_else(|| {
                    RtcpError::Sequence("dump-tape request received before any tape request".into())
                })?;
                let mut g = graph.lock();
                let entry = g.tape_mut(tape);
                if !entry.files.is_empty() {
                    return Err(RtcpError::Sequence(
                        "dump-tape request mixed with file requests".into(),
                    ));
                }
                entry.dump = Some(dump);
            }
            Message::Reconnect(r) => {
                if r.uid != self.credentials.uid || r.gid != self.credentials.gid {
                    return Err(RtcpError::PermissionDenied(format!(
                        "reconnect as {}/{} on a session owned by {}/{}",
                        r.uid, r.gid, self.credentials.uid, self.credentials.gid
                    )));
                }
                info!(host = %r.host, port = r.callback_port, "client announced new callback address");
                summary.reconnect = Some(r);
            }
            Message::Ping => {}
            Message::Abort => return Err(RtcpError::Aborted("user")),
            Message::EndOf { .. } | Message::NoMore => {
                return Err(RtcpError::Protocol("unexpected end-of-request message".into()))
            }
        }
        Ok(())
    }
}

/// Validation applied to every tape and file request before it is worked on
pub struct RequestChecker<'a> {
    drive: &'a dyn TapeDrive,
    buffer_size: usize,
}

impl<'a> RequestChecker<'a> {
    pub fn new(drive: &'a dyn TapeDrive, buffer_size: usize) -> Self {
        Self { drive, buffer_size }
    }

    pub fn check_tape(&self, tape: &TapeRequest) -> Result<()> {
        if tape.vid.is_empty() {
            return Err(RtcpError::InvalidRequest("tape request without volume id".into()));
        }
        Ok(())
    }

    /// Fill in defaults (block size) and reject what cannot be transferred
    pub fn check_file(
        &self,
        tape: &TapeRequest,
        file: &mut FileRequest,
        first_in_tape: bool,
    ) -> Result<()> {
        if file.proc_status == ProcStatus::RequestMoreWork {
            return Ok(());
        }
        let invalid = |what: String| Err(RtcpError::InvalidRequest(what));

        if file.file_path.is_empty() {
            return invalid(format!("fseq {}: no disk path", file.tape_fseq));
        }
        if file.tape_fseq == 0 {
            return invalid(format!("{}: tape file sequence must be positive", file.file_path));
        }
        if file.concat == Concat::WithPrevious && first_in_tape {
            return invalid(format!(
                "{}: first file of a tape cannot be concatenated to a previous one",
                file.file_path
            ));
        }
        if file.concat == Concat::ToEndOfData && tape.mode == TapeMode::Write {
            return invalid(format!(
                "{}: concatenate-to-end-of-data is only valid when reading",
                file.file_path
            ));
        }
        if file.blocksize < 0 || file.recordlength < 0 {
            return invalid(format!("{}: negative block or record size", file.file_path));
        }
        if file.blocksize == 0 {
            file.blocksize = self
                .drive
                .default_block_size(&tape.dgn, file.recordlength)
                .min(i32::MAX as usize) as i32;
            debug!(fseq = file.tape_fseq, blocksize = file.blocksize, dgn = %tape.dgn, "default block size");
        }
        if file.recfm.starts_with('F')
            && file.recordlength > 0
            && file.blocksize % file.recordlength != 0
        {
            return invalid(format!(
                "{}: block size {} not a multiple of record length {}",
                file.file_path, file.blocksize, file.recordlength
            ));
        }
        if file.blocksize as usize > self.buffer_size {
            return invalid(format!(
                "{}: block size {} exceeds buffer size {}",
                file.file_path, file.blocksize, self.buffer_size
            ));
        }
        Ok(())
    }

    /// Check a whole freshly received request list
    pub fn check_graph(&self, graph: &mut RequestGraph) -> Result<()> {
        if graph.is_empty() {
            return Err(RtcpError::InvalidRequest("empty request list".into()));
        }
        let tapes: Vec<TapeId> = graph.tape_ids().collect();
        for t in tapes {
            self.check_tape(&graph.tape(t).req)?;
            let entry = graph.tape(t);
            if entry.dump.is_some() && entry.req.mode == TapeMode::Write {
                return Err(RtcpError::InvalidRequest(format!(
                    "{}: dump-tape request on a write mount",
                    entry.req.vid
                )));
            }
            let tape_req = entry.req.clone();
            let files = entry.files.clone();
            for (i, f) in files.into_iter().enumerate() {
                self.check_file(&tape_req, &mut graph.file_mut(f).req, i == 0)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::DirectoryDrive;
    use std::io::Cursor;

    /// Scripted client: reads come from `input`, acks go to `output`
    struct Scripted {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Scripted {
        fn new(msgs: &[Message]) -> Self {
            let mut wire = Vec::new();
            for m in msgs {
                codec::write_message(&mut wire, m).unwrap();
            }
            Self {
                input: Cursor::new(wire),
                output: Vec::new(),
            }
        }

        fn acks(&self) -> Vec<(u32, i32)> {
            self.output
                .chunks(12)
                .map(|c| {
                    let mut h = [0u8; 12];
                    h.copy_from_slice(c);
                    let (t, s) = codec::parse_frame_header(&h).unwrap();
                    (t, s as i32)
                })
                .collect()
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    const CREDS: SessionCredentials = SessionCredentials {
        uid: 1000,
        gid: 1000,
        vol_req_id: 77,
    };

    fn tape() -> Message {
        Message::Tape(TapeRequest {
            vid: "V00001".into(),
            vol_req_id: 77,
            mode: TapeMode::Write,
            ..Default::default()
        })
    }

    fn file(fseq: u32, concat: Concat) -> Message {
        Message::File(FileRequest {
            file_path: format!("/data/f{fseq}"),
            tape_fseq: fseq,
            concat,
            ..Default::default()
        })
    }

    #[test]
    fn test_builds_graph_and_acks_each_message() {
        let mut s = Scripted::new(&[
            tape(),
            file(1, Concat::Standalone),
            file(2, Concat::WithPrevious),
            Message::NoMore,
        ]);
        let graph = Mutex::new(RequestGraph::new());
        let mut b = RequestListBuilder::new(CREDS, 1 << 20);
        let summary = b.build(&mut s, &graph, None).unwrap();

        assert_eq!(summary.tapes, 1);
        assert_eq!(summary.files, 2);
        let g = graph.lock();
        assert_eq!(g.tape_count(), 1);
        assert_eq!(g.file_count(), 2);
        assert_eq!(
            s.acks(),
            vec![
                (reqtype::TAPE_REQ, 0),
                (reqtype::FILE_REQ, 0),
                (reqtype::FILE_REQ, 0),
                (reqtype::NOMORE_REQ, 0)
            ]
        );
    }

    #[test]
    fn test_file_before_tape_rejected() {
        let mut s = Scripted::new(&[file(1, Concat::Standalone), Message::NoMore]);
        let graph = Mutex::new(RequestGraph::new());
        let err = RequestListBuilder::new(CREDS, 1 << 20)
            .build(&mut s, &graph, None)
            .unwrap_err();
        assert!(matches!(err, RtcpError::Sequence(_)));
        assert!(err.severity().is_failed());
        assert_eq!(s.acks(), vec![(reqtype::FILE_REQ, -libc::EINVAL)]);
        assert!(graph.lock().is_empty());
    }

    #[test]
    fn test_dump_before_tape_rejected() {
        let mut s = Scripted::new(&[
            Message::DumpTape(Default::default()),
            Message::NoMore,
        ]);
        let graph = Mutex::new(RequestGraph::new());
        let err = RequestListBuilder::new(CREDS, 1 << 20)
            .build(&mut s, &graph, None)
            .unwrap_err();
        assert!(matches!(err, RtcpError::Sequence(_)));
    }

    #[test]
    fn test_cumulative_budget_enforced() {
        let mut msgs = vec![tape()];
        for i in 1..=50 {
            msgs.push(file(i, Concat::Standalone));
        }
        msgs.push(Message::NoMore);
        let mut s = Scripted::new(&msgs);
        let graph = Mutex::new(RequestGraph::new());
        let err = RequestListBuilder::new(CREDS, 2048)
            .build(&mut s, &graph, None)
            .unwrap_err();
        assert!(matches!(err, RtcpError::RequestTooLong { limit: 2048, .. }));
        assert_eq!(err.code(), libc::E2BIG);
        let last = *s.acks().last().unwrap();
        assert_eq!(last.1, -libc::E2BIG);
    }

    #[test]
    fn test_reconnect_with_other_credentials_is_permission_error() {
        let mut s = Scripted::new(&[
            tape(),
            Message::Reconnect(ClientReconnect {
                vol_req_id: 77,
                callback_port: 6000,
                uid: 0,
                gid: 0,
                host: "evil".into(),
            }),
            Message::NoMore,
        ]);
        let graph = Mutex::new(RequestGraph::new());
        let err = RequestListBuilder::new(CREDS, 1 << 20)
            .build(&mut s, &graph, None)
            .unwrap_err();
        assert!(matches!(err, RtcpError::PermissionDenied(_)));
    }

    #[test]
    fn test_vol_req_id_mismatch_rejected() {
        let mut s = Scripted::new(&[
            Message::Tape(TapeRequest {
                vid: "V00001".into(),
                vol_req_id: 78,
                ..Default::default()
            }),
            Message::NoMore,
        ]);
        let graph = Mutex::new(RequestGraph::new());
        assert!(RequestListBuilder::new(CREDS, 1 << 20)
            .build(&mut s, &graph, None)
            .is_err());
    }

    fn graph_with_placeholder() -> (Mutex<RequestGraph>, Continuation) {
        let mut g = RequestGraph::new();
        let t = g.add_tape(TapeRequest {
            vid: "V00001".into(),
            vol_req_id: 77,
            mode: TapeMode::Write,
            ..Default::default()
        });
        g.add_file(
            t,
            FileRequest {
                file_path: "/data/f1".into(),
                tape_fseq: 1,
                proc_status: ProcStatus::Finished,
                ..Default::default()
            },
        );
        let ph = g.add_file(
            t,
            FileRequest {
                proc_status: ProcStatus::RequestMoreWork,
                ..Default::default()
            },
        );
        (
            Mutex::new(g),
            Continuation {
                tape: t,
                placeholder: ph,
            },
        )
    }

    #[test]
    fn test_continuation_fills_placeholder_in_place() {
        let (graph, cont) = graph_with_placeholder();
        let dir = tempfile::tempdir().unwrap();
        let drive = DirectoryDrive::new(dir.path());
        let mut s = Scripted::new(&[
            file(2, Concat::Standalone),
            file(3, Concat::Standalone),
            Message::NoMore,
        ]);
        let mut b = RequestListBuilder::new(CREDS, 1 << 20)
            .with_checker(RequestChecker::new(&drive, 1 << 20));
        let summary = b.build(&mut s, &graph, Some(cont)).unwrap();

        let g = graph.lock();
        assert_eq!(summary.new_files[0], cont.placeholder);
        assert_eq!(g.file(cont.placeholder).req.tape_fseq, 2);
        assert_eq!(g.file(cont.placeholder).req.proc_status, ProcStatus::Waiting);
        // Block size resolved on arrival
        assert_eq!(g.file(cont.placeholder).req.blocksize, 32 * 1024);
        assert_eq!(g.tape(cont.tape).files.len(), 3);
        assert!(g.pending_placeholder(cont.tape).is_none());
    }

    #[test]
    fn test_empty_continuation_retires_placeholder() {
        let (graph, cont) = graph_with_placeholder();
        let mut s = Scripted::new(&[Message::NoMore]);
        let summary = RequestListBuilder::new(CREDS, 1 << 20)
            .build(&mut s, &graph, Some(cont))
            .unwrap();
        assert!(summary.new_files.is_empty());
        let g = graph.lock();
        assert!(g.file(cont.placeholder).exhausted_placeholder);
        assert!(g.pending_placeholder(cont.tape).is_none());
    }

    #[test]
    fn test_invalid_continuation_file_rejected_immediately() {
        let (graph, cont) = graph_with_placeholder();
        let dir = tempfile::tempdir().unwrap();
        let drive = DirectoryDrive::new(dir.path());
        let mut s = Scripted::new(&[file(0, Concat::Standalone), Message::NoMore]);
        let err = RequestListBuilder::new(CREDS, 1 << 20)
            .with_checker(RequestChecker::new(&drive, 1 << 20))
            .build(&mut s, &graph, Some(cont))
            .unwrap_err();
        assert!(matches!(err, RtcpError::InvalidRequest(_)));
        assert_eq!(s.acks(), vec![(reqtype::FILE_REQ, -libc::EINVAL)]);
    }

    #[test]
    fn test_checker_rejects_leading_concatenation_and_big_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DirectoryDrive::new(dir.path());
        let checker = RequestChecker::new(&drive, 64 * 1024);
        let t = TapeRequest {
            vid: "V1".into(),
            mode: TapeMode::Write,
            ..Default::default()
        };
        let mut f = FileRequest {
            file_path: "/d/a".into(),
            tape_fseq: 1,
            concat: Concat::WithPrevious,
            ..Default::default()
        };
        assert!(checker.check_file(&t, &mut f, true).is_err());
        f.concat = Concat::Standalone;
        f.blocksize = 128 * 1024;
        assert!(checker.check_file(&t, &mut f, true).is_err());
        f.blocksize = 0;
        checker.check_file(&t, &mut f, true).unwrap();
        assert_eq!(f.blocksize, 32 * 1024);
    }
}
