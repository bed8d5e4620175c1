//! Client side of a session: who the client is, whether we believe it, and
//! the control connection we call back on.

use parking_lot::{Mutex, MutexGuard};
use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::control::ProcessingControl;
use crate::error::{Result, RtcpError};
use crate::protocol::{flush_mode, reqtype, timeouts, Severity};
use crate::protocol_core::{self as codec, ClientInfo, Message};
use crate::request::FileRequest;

/// A local account as far as authentication is concerned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

pub trait AccountDb: Send + Sync {
    fn user_by_uid(&self, uid: u32) -> Option<Account>;
    fn user_by_name(&self, name: &str) -> Option<Account>;
    /// Login names listed as members of group `gid`
    fn group_members(&self, gid: u32) -> Option<Vec<String>>;
}

/// The host's passwd and group databases
pub struct LocalAccounts;

#[cfg(unix)]
impl AccountDb for LocalAccounts {
    fn user_by_uid(&self, uid: u32) -> Option<Account> {
        use nix::unistd::{Uid, User};
        User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| Account {
                name: u.name,
                uid: u.uid.as_raw(),
                gid: u.gid.as_raw(),
            })
    }

    fn user_by_name(&self, name: &str) -> Option<Account> {
        use nix::unistd::User;
        User::from_name(name).ok().flatten().map(|u| Account {
            name: u.name,
            uid: u.uid.as_raw(),
            gid: u.gid.as_raw(),
        })
    }

    fn group_members(&self, gid: u32) -> Option<Vec<String>> {
        use nix::unistd::{Gid, Group};
        Group::from_gid(Gid::from_raw(gid))
            .ok()
            .flatten()
            .map(|g| g.mem)
    }
}

#[cfg(not(unix))]
impl AccountDb for LocalAccounts {
    fn user_by_uid(&self, _uid: u32) -> Option<Account> {
        None
    }
    fn user_by_name(&self, _name: &str) -> Option<Account> {
        None
    }
    fn group_members(&self, _gid: u32) -> Option<Vec<String>> {
        None
    }
}

/// Check the identity the caller claims.
///
/// The uid must be at least `min_uid`, resolve locally and carry the claimed
/// login name; the gid must be the account's primary group or one it is a
/// member of. A client whose uid is unknown (or named differently) here is
/// still accepted if it claims the fallback account and that account's gid.
pub fn authenticate(
    info: &ClientInfo,
    db: &dyn AccountDb,
    min_uid: u32,
    fallback_account: &str,
) -> Result<Account> {
    if info.uid < min_uid {
        return Err(RtcpError::PermissionDenied(format!(
            "uid {} below minimum allowed {}",
            info.uid, min_uid
        )));
    }

    if let Some(acct) = db.user_by_uid(info.uid) {
        if acct.name == info.name {
            let member = acct.gid == info.gid
                || db
                    .group_members(info.gid)
                    .map_or(false, |m| m.iter().any(|n| *n == acct.name));
            if member {
                return Ok(acct);
            }
            return Err(RtcpError::PermissionDenied(format!(
                "{} (uid {}) is not a member of gid {}",
                acct.name, info.uid, info.gid
            )));
        }
        debug!(
            uid = info.uid,
            local = %acct.name,
            claimed = %info.name,
            "login name mismatch, trying fallback account"
        );
    }

    if !fallback_account.is_empty() && info.name == fallback_account {
        if let Some(acct) = db.user_by_name(fallback_account) {
            if acct.gid == info.gid {
                return Ok(acct);
            }
        }
    }

    Err(RtcpError::PermissionDenied(format!(
        "cannot authenticate {} (uid {}, gid {}) from {}",
        info.name, info.uid, info.gid, info.host
    )))
}

/// How often buffered tape marks are flushed to the medium
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    NFlushesPerFile,
    OneFlushPerNFiles { max_bytes: u64, max_files: u64 },
}

/// One flush per N files only when a bridge asked for it, buffered tape
/// marks are enabled and N is more than one file
pub fn resolve_flush_mode(info: &ClientInfo, buffered_tape_marks: bool) -> FlushMode {
    match info.bridge {
        Some(p)
            if p.mode == flush_mode::ONE_FLUSH_PER_N_FILES
                && buffered_tape_marks
                && p.max_files_before_flush > 1 =>
        {
            FlushMode::OneFlushPerNFiles {
                max_bytes: p.max_bytes_before_flush.max(1),
                max_files: p.max_files_before_flush,
            }
        }
        _ => FlushMode::NFlushesPerFile,
    }
}

/// Open the connection the client advertised for status and requests
pub fn connect_back(host: &str, port: u32, net_timeout: Duration) -> Result<TcpStream> {
    let port = u16::try_from(port)
        .map_err(|_| RtcpError::Protocol(format!("invalid callback port {port}")))?;
    let addrs = (host, port).to_socket_addrs()?;
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, Duration::from_millis(timeouts::CONNECT_MS)) {
            Ok(s) => {
                s.set_read_timeout(Some(net_timeout))?;
                s.set_write_timeout(Some(net_timeout))?;
                crate::net::tune_socket(&s);
                info!(%addr, "connected back to client");
                return Ok(s);
            }
            Err(e) => last = Some(e),
        }
    }
    Err(last
        .map(RtcpError::Io)
        .unwrap_or_else(|| RtcpError::Protocol(format!("no address for {host}:{port}"))))
}

/// The callback connection, shared between the controller and the listener
pub struct ClientChannel {
    stream: Mutex<TcpStream>,
}

impl ClientChannel {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Mutex::new(stream),
        }
    }

    /// Exclusive use of the connection for a whole request/ack exchange
    pub fn lock(&self) -> MutexGuard<'_, TcpStream> {
        self.stream.lock()
    }

    /// Switch to a new connection after a client reconnect
    pub fn replace(&self, stream: TcpStream) {
        *self.stream.lock() = stream;
    }

    /// Echo a file request with its updated status; the client acks it
    pub fn report_file(&self, file: &FileRequest) -> Result<()> {
        let mut s = self.lock();
        codec::write_message(&mut *s, &Message::File(file.clone()))?;
        codec::recv_ack(&mut *s, reqtype::FILE_REQ)?;
        Ok(())
    }

    /// Final status of the whole session
    pub fn end_of_request(&self, status: i32, message: &str) -> Result<()> {
        let mut s = self.lock();
        codec::write_message(
            &mut *s,
            &Message::EndOf {
                status,
                message: message.to_string(),
            },
        )?;
        codec::recv_ack(&mut *s, reqtype::ENDOF_REQ)?;
        Ok(())
    }
}

/// Watches the client connection for ABORT and PING while the transfer runs
pub struct ClientListener {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ClientListener {
    pub fn spawn(
        session: String,
        channel: Arc<ClientChannel>,
        control: Arc<ProcessingControl>,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("client-listener-{session}"))
            .spawn(move || listen(&channel, &control, &flag))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                warn!("client listener panicked");
            }
        }
    }
}

impl Drop for ClientListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn listen(channel: &ClientChannel, control: &ProcessingControl, stop: &AtomicBool) {
    let poll = Duration::from_millis(timeouts::LISTEN_POLL_MS);
    while !stop.load(Ordering::SeqCst) {
        if let Some(mut s) = channel.stream.try_lock_for(poll) {
            match poll_once(&mut s) {
                Ok(Some(msg)) => handle_unsolicited(&mut *s, control, msg),
                Ok(None) => {}
                Err(e) => {
                    if !stop.load(Ordering::SeqCst) {
                        warn!("client connection lost: {}", e);
                        control.set_error(
                            libc::ECONNRESET,
                            Severity::FAILED | Severity::USER_ERROR,
                            "client connection lost",
                        );
                    }
                    return;
                }
            }
        }
        thread::sleep(poll);
    }
}

/// Non-blocking check for a pending message
fn poll_once(s: &mut TcpStream) -> Result<Option<Message>> {
    let mut probe = [0u8; 1];
    s.set_nonblocking(true)?;
    let peeked = s.peek(&mut probe);
    s.set_nonblocking(false)?;
    match peeked {
        Ok(0) => Err(RtcpError::Io(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "peer closed the connection",
        ))),
        Ok(_) => {
            let frame = codec::read_frame(s)?;
            Ok(Some(codec::decode_message(&frame)?))
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn handle_unsolicited<S: Read + std::io::Write>(s: &mut S, control: &ProcessingControl, msg: Message) {
    match msg {
        Message::Ping => {
            debug!("PING from client");
            if let Err(e) = codec::send_ack(s, reqtype::PING_REQ, 0) {
                warn!("ping ack failed: {}", e);
            }
        }
        Message::Abort => {
            let _ = codec::send_ack(s, reqtype::ABORT_REQ, 0);
            control.abort("user");
        }
        other => warn!(
            "ignoring unexpected {} from client",
            reqtype::name(other.req_type())
        ),
    }
}
