//! Daemon accept loop: one session thread per caller connection.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::protocol::timeouts;
use crate::session::{Session, SessionController, SessionEnv, SessionReport};

/// TCP_NODELAY plus keepalive probing so a vanished peer is noticed
pub fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let fd = stream.as_raw_fd();
        let set = |level: libc::c_int, name: libc::c_int, value: libc::c_int| unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const _ as *const libc::c_void,
                std::mem::size_of_val(&value) as libc::socklen_t,
            )
        };
        set(libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1);
        #[cfg(target_os = "linux")]
        {
            set(libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, 60);
            set(libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, 10);
            set(libc::IPPROTO_TCP, libc::TCP_KEEPCNT, 6);
        }
    }
}

pub struct Daemon {
    env: Arc<SessionEnv>,
    sessions: Mutex<Vec<Weak<Session>>>,
    shutdown: AtomicBool,
}

impl Daemon {
    pub fn new(env: SessionEnv) -> Self {
        Self {
            env: Arc::new(env),
            sessions: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn env(&self) -> &SessionEnv {
        &self.env
    }

    /// Abort every live session; returns how many were hit
    pub fn abort_all(&self, by: &'static str) -> usize {
        let live = self.live_sessions();
        for s in &live {
            s.abort(by);
        }
        live.len()
    }

    /// Operator shutdown: abort running sessions and stop accepting
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let n = self.abort_all("operator");
        info!(sessions = n, "shutting down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|w| w.strong_count() > 0);
        sessions.iter().filter_map(Weak::upgrade).collect()
    }

    /// Accept callers until [`Daemon::shutdown`], then wait for running
    /// sessions to wind down
    pub fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        listener
            .set_nonblocking(true)
            .context("set listener non-blocking")?;
        if let Ok(addr) = listener.local_addr() {
            info!(bind = %addr, "rtcpd listening");
        }
        let poll = Duration::from_millis(timeouts::LISTEN_POLL_MS);
        let mut workers: Vec<JoinHandle<SessionReport>> = Vec::new();

        while !self.is_shutting_down() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let daemon = Arc::clone(self);
                    let spawned = thread::Builder::new()
                        .name(format!("session-{peer}"))
                        .spawn(move || daemon.handle(stream));
                    match spawned {
                        Ok(h) => workers.push(h),
                        Err(e) => error!(%peer, "cannot start session thread: {}", e),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(poll),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => warn!("accept error: {}", e),
            }
            workers.retain(|h| !h.is_finished());
        }

        for h in workers {
            if h.join().is_err() {
                error!("session thread panicked");
            }
        }
        Ok(())
    }

    /// Run one session to completion on the calling thread
    pub fn handle(self: &Arc<Self>, stream: TcpStream) -> SessionReport {
        let _ = stream.set_nonblocking(false);
        tune_socket(&stream);
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let session = Arc::new(Session::new(peer, self.env.config.disk_workers + 1));
        self.sessions.lock().push(Arc::downgrade(&session));
        if self.is_shutting_down() {
            session.abort("operator");
        }
        SessionController::new(Arc::clone(&self.env), session, stream).run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::NoopAccounting;
    use crate::client::LocalAccounts;
    use crate::config::Config;
    use crate::drive::DirectoryDrive;

    fn daemon() -> Arc<Daemon> {
        Arc::new(Daemon::new(SessionEnv {
            config: Config::default(),
            drive: Arc::new(DirectoryDrive::new("/nonexistent")),
            accounts: Arc::new(LocalAccounts),
            accounting: Arc::new(NoopAccounting),
        }))
    }

    #[test]
    fn test_abort_all_reaches_live_sessions_only() {
        let d = daemon();
        let live = Arc::new(Session::new("a", 2));
        d.sessions.lock().push(Arc::downgrade(&live));
        {
            let gone = Arc::new(Session::new("b", 2));
            d.sessions.lock().push(Arc::downgrade(&gone));
        }
        assert_eq!(d.abort_all("operator"), 1);
        assert!(live.control.check_error().is_failed());
        assert_eq!(d.live_sessions().len(), 1);
    }

    #[test]
    fn test_serve_returns_after_shutdown() {
        let d = daemon();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server = {
            let d = Arc::clone(&d);
            thread::spawn(move || d.serve(listener))
        };
        thread::sleep(Duration::from_millis(50));
        d.shutdown();
        assert!(server.join().unwrap().is_ok());
        assert!(d.is_shutting_down());
    }
}
