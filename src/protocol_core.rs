//! Wire codec for the request/acknowledge protocol
//!
//! Every message is a 12 byte big-endian header (magic, request type, body
//! length) followed by the body. Acknowledgements are header-shaped: the
//! length slot carries the status instead. Strings are NUL-terminated and
//! bounded per field.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::error::{Result, RtcpError};
use crate::protocol::{limits, reqtype, Severity, HEADER_LEN, MAGIC, MAX_FRAME_SIZE};
use crate::request::{
    Concat, DumpTapeRequest, ErrorInfo, FileRequest, FileTimes, ProcStatus, TapeMode, TapeRequest,
    TapeTimes,
};

/// Validate a message body size against MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(RtcpError::Protocol(format!(
            "message body too large: {} bytes (max: {})",
            size, MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

/// Build message header
/// Format: MAGIC (4) | REQTYPE (4) | LENGTH (4), big-endian
pub fn build_frame_header(req_type: u32, len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    header[4..8].copy_from_slice(&req_type.to_be_bytes());
    header[8..12].copy_from_slice(&len.to_be_bytes());
    header
}

/// Parse message header
/// Returns: (req_type, length-or-status)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u32, u32)> {
    let mut cur = Cursor::new(&header[..]);
    let magic = cur.read_u32::<BigEndian>()?;
    // Verify magic
    if magic != MAGIC {
        return Err(RtcpError::Protocol(format!("invalid magic {:#x}", magic)));
    }
    let req_type = cur.read_u32::<BigEndian>()?;
    let len = cur.read_u32::<BigEndian>()?;
    Ok((req_type, len))
}

/// One received message, body still encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub req_type: u32,
    pub body: Vec<u8>,
}

impl Frame {
    /// Bytes this message occupied on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }
}

pub fn read_frame<R: Read>(r: &mut R) -> Result<Frame> {
    let mut hdr = [0u8; HEADER_LEN];
    r.read_exact(&mut hdr)?;
    let (req_type, len) = parse_frame_header(&hdr)?;
    validate_frame_size(len as usize)?;
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)?;
    Ok(Frame { req_type, body })
}

pub fn write_frame<W: Write>(w: &mut W, req_type: u32, body: &[u8]) -> Result<()> {
    validate_frame_size(body.len())?;
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&build_frame_header(req_type, body.len() as u32));
    buf.extend_from_slice(body);
    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}

pub fn send_ack<W: Write>(w: &mut W, req_type: u32, status: i32) -> Result<()> {
    w.write_all(&build_frame_header(req_type, status as u32))?;
    w.flush()?;
    Ok(())
}

/// Wait for the acknowledgement of `req_type`; returns the status it carries
pub fn recv_ack<R: Read>(r: &mut R, req_type: u32) -> Result<i32> {
    let mut hdr = [0u8; HEADER_LEN];
    r.read_exact(&mut hdr)?;
    let (echo, status) = parse_frame_header(&hdr)?;
    if echo != req_type {
        return Err(RtcpError::Protocol(format!(
            "expected ack for {}, got {}",
            reqtype::name(req_type),
            reqtype::name(echo)
        )));
    }
    Ok(status as i32)
}

// --- body primitives ---

fn put_str(buf: &mut Vec<u8>, s: &str, max: usize) {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    buf.extend_from_slice(&s.as_bytes()[..end]);
    buf.push(0);
}

fn get_str(cur: &mut Cursor<&[u8]>, max: usize, field: &str) -> Result<String> {
    let start = cur.position() as usize;
    let body: &[u8] = cur.get_ref();
    let rest = body.get(start..).unwrap_or(&[]);
    let nul = rest
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| RtcpError::Protocol(format!("{field}: missing string terminator")))?;
    if nul > max {
        return Err(RtcpError::Protocol(format!(
            "{field}: {nul} bytes exceeds limit {max}"
        )));
    }
    let s = std::str::from_utf8(&rest[..nul])
        .map_err(|_| RtcpError::Protocol(format!("{field}: invalid utf-8")))?
        .to_string();
    cur.set_position((start + nul + 1) as u64);
    Ok(s)
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    // Writing into a Vec cannot fail
    let _ = buf.write_u32::<BigEndian>(v);
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    let _ = buf.write_i32::<BigEndian>(v);
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    let _ = buf.write_u64::<BigEndian>(v);
}

fn truncated(e: std::io::Error) -> RtcpError {
    RtcpError::Protocol(format!("truncated message body: {e}"))
}

fn get_u32(cur: &mut Cursor<&[u8]>) -> Result<u32> {
    cur.read_u32::<BigEndian>().map_err(truncated)
}

fn get_i32(cur: &mut Cursor<&[u8]>) -> Result<i32> {
    cur.read_i32::<BigEndian>().map_err(truncated)
}

fn get_u64(cur: &mut Cursor<&[u8]>) -> Result<u64> {
    cur.read_u64::<BigEndian>().map_err(truncated)
}

fn put_err(buf: &mut Vec<u8>, err: &ErrorInfo) {
    put_str(buf, &err.message, limits::ERRMSG);
    put_u32(buf, err.severity.bits());
    put_i32(buf, err.code);
    put_i32(buf, err.max_tape_retry);
    put_i32(buf, err.max_copy_retry);
}

fn get_err(cur: &mut Cursor<&[u8]>) -> Result<ErrorInfo> {
    Ok(ErrorInfo {
        message: get_str(cur, limits::ERRMSG, "errmsgtxt")?,
        severity: Severity::from_bits(get_u32(cur)?),
        code: get_i32(cur)?,
        max_tape_retry: get_i32(cur)?,
        max_copy_retry: get_i32(cur)?,
    })
}

// --- handshake ---

/// Flush tuning announced by a bridging caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeFlushParams {
    pub mode: u32,
    pub max_bytes_before_flush: u64,
    pub max_files_before_flush: u64,
}

/// Who is asking for the session and where to call back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub vol_req_id: u32,
    pub callback_port: u32,
    pub uid: u32,
    pub gid: u32,
    pub host: String,
    pub dgn: String,
    pub unit: String,
    pub name: String,
    /// Present only for bridging callers
    pub bridge: Option<BridgeFlushParams>,
}

impl ClientInfo {
    pub fn req_type(&self) -> u32 {
        if self.bridge.is_some() {
            reqtype::BRIDGE_CLIENT_INFO
        } else {
            reqtype::CLIENT_INFO
        }
    }
}

pub fn encode_client_info(info: &ClientInfo) -> Vec<u8> {
    let mut b = Vec::with_capacity(128);
    put_u32(&mut b, info.vol_req_id);
    put_u32(&mut b, info.callback_port);
    put_u32(&mut b, info.uid);
    put_u32(&mut b, info.gid);
    put_str(&mut b, &info.host, limits::NAME);
    put_str(&mut b, &info.dgn, limits::NAME);
    put_str(&mut b, &info.unit, limits::NAME);
    put_str(&mut b, &info.name, limits::NAME);
    if let Some(p) = &info.bridge {
        put_u32(&mut b, p.mode);
        put_u64(&mut b, p.max_bytes_before_flush);
        put_u64(&mut b, p.max_files_before_flush);
    }
    b
}

pub fn decode_client_info(frame: &Frame) -> Result<ClientInfo> {
    let bridge = match frame.req_type {
        reqtype::CLIENT_INFO => false,
        reqtype::BRIDGE_CLIENT_INFO => true,
        other => {
            return Err(RtcpError::Protocol(format!(
                "expected client info, got {}",
                reqtype::name(other)
            )))
        }
    };
    let mut cur = Cursor::new(frame.body.as_slice());
    let mut info = ClientInfo {
        vol_req_id: get_u32(&mut cur)?,
        callback_port: get_u32(&mut cur)?,
        uid: get_u32(&mut cur)?,
        gid: get_u32(&mut cur)?,
        host: get_str(&mut cur, limits::NAME, "clientHost")?,
        dgn: get_str(&mut cur, limits::NAME, "dgn")?,
        unit: get_str(&mut cur, limits::NAME, "driveUnit")?,
        name: get_str(&mut cur, limits::NAME, "clientName")?,
        bridge: None,
    };
    if bridge {
        info.bridge = Some(BridgeFlushParams {
            mode: get_u32(&mut cur)?,
            max_bytes_before_flush: get_u64(&mut cur)?,
            max_files_before_flush: get_u64(&mut cur)?,
        });
    }
    Ok(info)
}

/// Reply to the VDQM/bridge caller: status (negative on failure) and text
pub fn encode_status_reply(status: i32, message: &str) -> Vec<u8> {
    let mut b = Vec::with_capacity(8 + message.len());
    put_i32(&mut b, status);
    put_str(&mut b, message, limits::ERRMSG);
    b
}

pub fn decode_status_reply(body: &[u8]) -> Result<(i32, String)> {
    let mut cur = Cursor::new(body);
    let status = get_i32(&mut cur)?;
    let message = get_str(&mut cur, limits::ERRMSG, "message")?;
    Ok((status, message))
}

// --- request list messages ---

/// Client announcing a new callback address mid-session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReconnect {
    pub vol_req_id: u32,
    pub callback_port: u32,
    pub uid: u32,
    pub gid: u32,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Tape(TapeRequest),
    TapeErr(TapeRequest),
    File(FileRequest),
    FileErr(FileRequest),
    DumpTape(DumpTapeRequest),
    Reconnect(ClientReconnect),
    NoMore,
    Abort,
    Ping,
    EndOf { status: i32, message: String },
}

impl Message {
    pub fn req_type(&self) -> u32 {
        match self {
            Message::Tape(_) => reqtype::TAPE_REQ,
            Message::TapeErr(_) => reqtype::TAPEERR_REQ,
            Message::File(_) => reqtype::FILE_REQ,
            Message::FileErr(_) => reqtype::FILEERR_REQ,
            Message::DumpTape(_) => reqtype::DUMPTAPE_REQ,
            Message::Reconnect(_) => reqtype::CLIENT_RECONNECT,
            Message::NoMore => reqtype::NOMORE_REQ,
            Message::Abort => reqtype::ABORT_REQ,
            Message::Ping => reqtype::PING_REQ,
            Message::EndOf { .. } => reqtype::ENDOF_REQ,
        }
    }
}

fn put_tape_times(b: &mut Vec<u8>, t: &TapeTimes) {
    for v in [
        t.start_request,
        t.start_rtcpd,
        t.start_mount,
        t.end_mount,
        t.start_unmount,
        t.end_unmount,
    ] {
        put_u32(b, v);
    }
}

fn get_tape_times(cur: &mut Cursor<&[u8]>) -> Result<TapeTimes> {
    Ok(TapeTimes {
        start_request: get_u32(cur)?,
        start_rtcpd: get_u32(cur)?,
        start_mount: get_u32(cur)?,
        end_mount: get_u32(cur)?,
        start_unmount: get_u32(cur)?,
        end_unmount: get_u32(cur)?,
    })
}

fn put_file_times(b: &mut Vec<u8>, t: &FileTimes) {
    for v in [
        t.start_position,
        t.end_position,
        t.start_transfer_disk,
        t.end_transfer_disk,
        t.start_transfer_tape,
        t.end_transfer_tape,
    ] {
        put_u32(b, v);
    }
}

fn get_file_times(cur: &mut Cursor<&[u8]>) -> Result<FileTimes> {
    Ok(FileTimes {
        start_position: get_u32(cur)?,
        end_position: get_u32(cur)?,
        start_transfer_disk: get_u32(cur)?,
        end_transfer_disk: get_u32(cur)?,
        start_transfer_tape: get_u32(cur)?,
        end_transfer_tape: get_u32(cur)?,
    })
}

pub fn encode_tape_request(t: &TapeRequest) -> Vec<u8> {
    let mut b = Vec::with_capacity(256);
    put_str(&mut b, &t.vid, limits::VID);
    put_str(&mut b, &t.vsn, limits::VID);
    put_str(&mut b, &t.label, limits::NAME);
    put_str(&mut b, &t.devtype, limits::NAME);
    put_str(&mut b, &t.density, limits::NAME);
    put_str(&mut b, &t.unit, limits::NAME);
    put_str(&mut b, &t.dgn, limits::NAME);
    put_u32(&mut b, t.vol_req_id);
    put_u32(&mut b, t.job_id);
    put_u32(&mut b, t.mode.code());
    put_u32(&mut b, t.start_file);
    put_u32(&mut b, t.end_file);
    put_u32(&mut b, t.side);
    put_i32(&mut b, t.tprc);
    put_tape_times(&mut b, &t.times);
    put_err(&mut b, &t.err);
    b
}

pub fn decode_tape_request(body: &[u8]) -> Result<TapeRequest> {
    let mut cur = Cursor::new(body);
    let c = &mut cur;
    let vid = get_str(c, limits::VID, "vid")?;
    let vsn = get_str(c, limits::VID, "vsn")?;
    let label = get_str(c, limits::NAME, "label")?;
    let devtype = get_str(c, limits::NAME, "devtype")?;
    let density = get_str(c, limits::NAME, "density")?;
    let unit = get_str(c, limits::NAME, "unit")?;
    let dgn = get_str(c, limits::NAME, "dgn")?;
    let vol_req_id = get_u32(c)?;
    let job_id = get_u32(c)?;
    let mode_code = get_u32(c)?;
    let mode = TapeMode::from_code(mode_code)
        .ok_or_else(|| RtcpError::Protocol(format!("invalid tape mode {mode_code}")))?;
    Ok(TapeRequest {
        vid,
        vsn,
        label,
        devtype,
        density,
        unit,
        dgn,
        vol_req_id,
        job_id,
        mode,
        start_file: get_u32(c)?,
        end_file: get_u32(c)?,
        side: get_u32(c)?,
        tprc: get_i32(c)?,
        times: get_tape_times(c)?,
        err: get_err(c)?,
    })
}

pub fn encode_file_request(f: &FileRequest) -> Vec<u8> {
    let mut b = Vec::with_capacity(512);
    put_str(&mut b, &f.file_path, limits::PATH);
    put_str(&mut b, &f.tape_path, limits::PATH);
    put_str(&mut b, &f.recfm, limits::NAME);
    put_str(&mut b, &f.fid, limits::NAME);
    put_str(&mut b, &f.ifce, limits::NAME);
    put_u32(&mut b, f.vol_req_id);
    put_u32(&mut b, f.job_id);
    put_u32(&mut b, f.position_method);
    put_u32(&mut b, f.tape_fseq);
    put_u32(&mut b, f.disk_fseq);
    put_i32(&mut b, f.blocksize);
    put_i32(&mut b, f.recordlength);
    put_i32(&mut b, f.convert);
    put_i32(&mut b, f.tp_err_action);
    put_u32(&mut b, f.concat.code());
    put_u32(&mut b, f.proc_status.code());
    put_i32(&mut b, f.cprc);
    put_u64(&mut b, f.offset);
    put_u64(&mut b, f.bytes_in);
    put_u64(&mut b, f.bytes_out);
    put_u64(&mut b, f.host_bytes);
    put_u64(&mut b, f.max_size);
    put_file_times(&mut b, &f.times);
    put_err(&mut b, &f.err);
    b
}

pub fn decode_file_request(body: &[u8]) -> Result<FileRequest> {
    let mut cur = Cursor::new(body);
    let c = &mut cur;
    let file_path = get_str(c, limits::PATH, "filePath")?;
    let tape_path = get_str(c, limits::PATH, "tapePath")?;
    let recfm = get_str(c, limits::NAME, "recfm")?;
    let fid = get_str(c, limits::NAME, "fid")?;
    let ifce = get_str(c, limits::NAME, "ifce")?;
    let vol_req_id = get_u32(c)?;
    let job_id = get_u32(c)?;
    let position_method = get_u32(c)?;
    let tape_fseq = get_u32(c)?;
    let disk_fseq = get_u32(c)?;
    let blocksize = get_i32(c)?;
    let recordlength = get_i32(c)?;
    let convert = get_i32(c)?;
    let tp_err_action = get_i32(c)?;
    let concat_code = get_u32(c)?;
    let concat = Concat::from_code(concat_code)
        .ok_or_else(|| RtcpError::Protocol(format!("invalid concatenation flag {concat_code}")))?;
    Ok(FileRequest {
        file_path,
        tape_path,
        recfm,
        fid,
        ifce,
        vol_req_id,
        job_id,
        position_method,
        tape_fseq,
        disk_fseq,
        blocksize,
        recordlength,
        convert,
        tp_err_action,
        concat,
        proc_status: ProcStatus::from_code(get_u32(c)?),
        cprc: get_i32(c)?,
        offset: get_u64(c)?,
        bytes_in: get_u64(c)?,
        bytes_out: get_u64(c)?,
        host_bytes: get_u64(c)?,
        max_size: get_u64(c)?,
        times: get_file_times(c)?,
        err: get_err(c)?,
    })
}

pub fn encode_dump_tape(d: &DumpTapeRequest) -> Vec<u8> {
    let mut b = Vec::with_capacity(32);
    for v in [
        d.max_bytes,
        d.block_size,
        d.convert,
        d.tp_err_action,
        d.start_file,
        d.max_file,
        d.from_block,
        d.to_block,
    ] {
        put_i32(&mut b, v);
    }
    b
}

pub fn decode_dump_tape(body: &[u8]) -> Result<DumpTapeRequest> {
    let mut cur = Cursor::new(body);
    let c = &mut cur;
    Ok(DumpTapeRequest {
        max_bytes: get_i32(c)?,
        block_size: get_i32(c)?,
        convert: get_i32(c)?,
        tp_err_action: get_i32(c)?,
        start_file: get_i32(c)?,
        max_file: get_i32(c)?,
        from_block: get_i32(c)?,
        to_block: get_i32(c)?,
    })
}

fn encode_reconnect(r: &ClientReconnect) -> Vec<u8> {
    let mut b = Vec::with_capacity(64);
    put_u32(&mut b, r.vol_req_id);
    put_u32(&mut b, r.callback_port);
    put_u32(&mut b, r.uid);
    put_u32(&mut b, r.gid);
    put_str(&mut b, &r.host, limits::NAME);
    b
}

fn decode_reconnect(body: &[u8]) -> Result<ClientReconnect> {
    let mut cur = Cursor::new(body);
    let c = &mut cur;
    Ok(ClientReconnect {
        vol_req_id: get_u32(c)?,
        callback_port: get_u32(c)?,
        uid: get_u32(c)?,
        gid: get_u32(c)?,
        host: get_str(c, limits::NAME, "clientHost")?,
    })
}

pub fn encode_message(msg: &Message) -> Vec<u8> {
    match msg {
        Message::Tape(t) | Message::TapeErr(t) => encode_tape_request(t),
        Message::File(f) | Message::FileErr(f) => encode_file_request(f),
        Message::DumpTape(d) => encode_dump_tape(d),
        Message::Reconnect(r) => encode_reconnect(r),
        Message::NoMore | Message::Abort | Message::Ping => Vec::new(),
        Message::EndOf { status, message } => encode_status_reply(*status, message),
    }
}

pub fn decode_message(frame: &Frame) -> Result<Message> {
    let body = frame.body.as_slice();
    Ok(match frame.req_type {
        reqtype::TAPE_REQ => Message::Tape(decode_tape_request(body)?),
        reqtype::TAPEERR_REQ => Message::TapeErr(decode_tape_request(body)?),
        reqtype::FILE_REQ => Message::File(decode_file_request(body)?),
        reqtype::FILEERR_REQ => Message::FileErr(decode_file_request(body)?),
        reqtype::DUMPTAPE_REQ => Message::DumpTape(decode_dump_tape(body)?),
        reqtype::CLIENT_RECONNECT => Message::Reconnect(decode_reconnect(body)?),
        reqtype::NOMORE_REQ => Message::NoMore,
        reqtype::ABORT_REQ => Message::Abort,
        reqtype::PING_REQ => Message::Ping,
        reqtype::ENDOF_REQ => {
            let (status, message) = decode_status_reply(body)?;
            Message::EndOf { status, message }
        }
        other => {
            return Err(RtcpError::Protocol(format!(
                "unexpected request type {:#x}",
                other
            )))
        }
    })
}

pub fn write_message<W: Write>(w: &mut W, msg: &Message) -> Result<()> {
    write_frame(w, msg.req_type(), &encode_message(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_round_trip() {
        let header = build_frame_header(reqtype::FILE_REQ, 12345);
        let (parsed_type, parsed_len) = parse_frame_header(&header).unwrap();
        assert_eq!(parsed_type, reqtype::FILE_REQ);
        assert_eq!(parsed_len, 12345);
        // Big-endian on the wire
        assert_eq!(&header[0..4], &[0, 0, 0x62, 0x02]);
    }

    #[test]
    fn test_parse_frame_header_invalid_magic() {
        let mut header = build_frame_header(reqtype::TAPE_REQ, 10);
        header[3] = 0xFF;
        assert!(matches!(
            parse_frame_header(&header),
            Err(RtcpError::Protocol(_))
        ));
    }

    #[test]
    fn test_validate_frame_size_edge_cases() {
        assert!(validate_frame_size(0).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE + 1).is_err());
        assert!(validate_frame_size(usize::MAX).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected_on_read() {
        let header = build_frame_header(reqtype::FILE_REQ, (MAX_FRAME_SIZE + 1) as u32);
        let mut r = Cursor::new(header.to_vec());
        assert!(read_frame(&mut r).is_err());
    }

    #[test]
    fn test_ack_carries_status() {
        let mut wire = Vec::new();
        send_ack(&mut wire, reqtype::TAPE_REQ, -13).unwrap();
        assert_eq!(wire.len(), HEADER_LEN);
        let mut r = Cursor::new(wire);
        assert_eq!(recv_ack(&mut r, reqtype::TAPE_REQ).unwrap(), -13);
    }

    #[test]
    fn test_ack_for_wrong_type_is_protocol_error() {
        let mut wire = Vec::new();
        send_ack(&mut wire, reqtype::FILE_REQ, 0).unwrap();
        let mut r = Cursor::new(wire);
        assert!(recv_ack(&mut r, reqtype::TAPE_REQ).is_err());
    }

    #[test]
    fn test_file_request_survives_the_wire() {
        let f = FileRequest {
            file_path: "/data/run1/f001".into(),
            tape_fseq: 7,
            blocksize: 262144,
            concat: Concat::WithPrevious,
            proc_status: ProcStatus::Finished,
            bytes_in: 1 << 33,
            err: ErrorInfo {
                message: "ok".into(),
                severity: Severity::OK,
                max_tape_retry: -1,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut wire = Vec::new();
        write_message(&mut wire, &Message::File(f.clone())).unwrap();
        let frame = read_frame(&mut Cursor::new(wire)).unwrap();
        assert_eq!(decode_message(&frame).unwrap(), Message::File(f));
    }

    #[test]
    fn test_bridge_client_info_carries_flush_params() {
        let info = ClientInfo {
            vol_req_id: 42,
            callback_port: 5015,
            uid: 1000,
            gid: 1000,
            host: "bridge01".into(),
            dgn: "T10K".into(),
            unit: "drive0".into(),
            name: "alice".into(),
            bridge: Some(BridgeFlushParams {
                mode: 2,
                max_bytes_before_flush: 1 << 30,
                max_files_before_flush: 50,
            }),
        };
        let frame = Frame {
            req_type: info.req_type(),
            body: encode_client_info(&info),
        };
        assert_eq!(frame.req_type, reqtype::BRIDGE_CLIENT_INFO);
        assert_eq!(decode_client_info(&frame).unwrap(), info);
    }

    #[test]
    fn test_overlong_vid_is_truncated_on_encode() {
        let t = TapeRequest {
            vid: "TOOLONGVID".into(),
            ..Default::default()
        };
        let back = decode_tape_request(&encode_tape_request(&t)).unwrap();
        assert_eq!(back.vid, "TOOLON");
    }

    #[test]
    fn test_unterminated_string_rejected() {
        let body = b"abc".to_vec();
        assert!(decode_tape_request(&body).is_err());
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let mut t = encode_tape_request(&TapeRequest::default());
        // vid, vsn and five empty strings, then vol_req_id and job_id
        let mode_at = 7 + 8;
        t[mode_at..mode_at + 4].copy_from_slice(&9u32.to_be_bytes());
        assert!(decode_tape_request(&t).is_err());
    }
}
