//! Shared protocol constants for the RTCOPY request/acknowledge transport

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

// Protocol header constants
pub const MAGIC: u32 = 0x6202;

/// magic + reqtype + len
pub const HEADER_LEN: usize = 12;

// Maximum body size of one message. Tape and file requests are a few hundred
// bytes; anything larger is a misbehaving peer.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

// Request type IDs (keep numeric stable, clients hardcode them)
pub mod reqtype {
    pub const TAPE_REQ: u32 = 0x2001;
    pub const FILE_REQ: u32 = 0x2002;
    pub const NOMORE_REQ: u32 = 0x2003;
    pub const TAPEERR_REQ: u32 = 0x2004;
    pub const FILEERR_REQ: u32 = 0x2005;
    pub const ENDOF_REQ: u32 = 0x2006;
    pub const ABORT_REQ: u32 = 0x2007;
    pub const DUMPTAPE_REQ: u32 = 0x2009;
    pub const PING_REQ: u32 = 0x200C;
    pub const CLIENT_RECONNECT: u32 = 0x200E;

    // Sent by VDQM (ordinary client) or the tape bridge on the accept socket
    pub const CLIENT_INFO: u32 = 0x3006;
    pub const BRIDGE_CLIENT_INFO: u32 = 0x3007;

    pub fn name(t: u32) -> &'static str {
        match t {
            TAPE_REQ => "TAPE_REQ",
            FILE_REQ => "FILE_REQ",
            NOMORE_REQ => "NOMORE_REQ",
            TAPEERR_REQ => "TAPEERR_REQ",
            FILEERR_REQ => "FILEERR_REQ",
            ENDOF_REQ => "ENDOF_REQ",
            ABORT_REQ => "ABORT_REQ",
            DUMPTAPE_REQ => "DUMPTAPE_REQ",
            PING_REQ => "PING_REQ",
            CLIENT_RECONNECT => "CLIENT_RECONNECT",
            CLIENT_INFO => "CLIENT_INFO",
            BRIDGE_CLIENT_INFO => "BRIDGE_CLIENT_INFO",
            _ => "UNKNOWN",
        }
    }
}

// File processing status as carried in FILE_REQ
pub mod proc_status {
    pub const WAITING: u32 = 1;
    pub const POSITIONED: u32 = 2;
    pub const PARTIALLY_FINISHED: u32 = 3;
    pub const FINISHED: u32 = 4;
    pub const EOV_HIT: u32 = 5;
    pub const UNREACHABLE: u32 = 6;
    pub const REQUEST_MORE_WORK: u32 = 7;
}

// Concatenation flags as carried in FILE_REQ
pub mod concat {
    pub const STANDALONE: u32 = 1;
    pub const WITH_PREVIOUS: u32 = 2;
    pub const TO_EOD: u32 = 4;
}

// Tape flush modes announced by the bridge
pub mod flush_mode {
    pub const N_FLUSHES_PER_FILE: u32 = 1;
    pub const ONE_FLUSH_PER_N_FILES: u32 = 2;
}

// Tape access mode
pub const MODE_READ: u32 = 0;
pub const MODE_WRITE: u32 = 1;

// Field size limits (bytes, without the terminating NUL)
pub mod limits {
    pub const VID: usize = 6;
    pub const PATH: usize = 1023;
    pub const NAME: usize = 255;
    pub const ERRMSG: usize = 255;
}

/// Severity bitmask shared by the global error state, tape requests and
/// file requests. Bits are combinable.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Severity(u32);

impl Severity {
    pub const NONE: Severity = Severity(0);
    pub const OK: Severity = Severity(0x0001);
    pub const RETRY_OK: Severity = Severity(0x0002);
    pub const RESELECT_SERVICE: Severity = Severity(0x0004);
    pub const FAILED: Severity = Severity(0x0008);
    pub const USER_ERROR: Severity = Severity(0x0010);
    pub const SYSTEM_ERROR: Severity = Severity(0x0020);
    pub const UNKNOWN_ERROR: Severity = Severity(0x0040);
    pub const SERVICE_ERROR: Severity = Severity(0x0080);
    pub const NO_RELEASE: Severity = Severity(0x0100);
    pub const LOCAL_RETRY: Severity = Severity(0x0200);
    pub const END_OF_DATA: Severity = Severity(0x0800);

    /// Any of these clears OK and LOCAL_RETRY when merged in
    pub const ERROR_CLASS: Severity = Severity(
        Self::FAILED.0
            | Self::RESELECT_SERVICE.0
            | Self::USER_ERROR.0
            | Self::SYSTEM_ERROR.0
            | Self::UNKNOWN_ERROR.0
            | Self::SERVICE_ERROR.0,
    );

    /// Any of these wakes every blocked participant of the session
    pub const BROADCAST: Severity = Severity(
        Self::FAILED.0 | Self::RESELECT_SERVICE.0 | Self::LOCAL_RETRY.0 | Self::END_OF_DATA.0,
    );

    pub const fn from_bits(bits: u32) -> Self {
        Severity(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Severity) -> bool {
        other.0 != 0 && (self.0 & other.0) == other.0
    }

    pub const fn intersects(self, other: Severity) -> bool {
        (self.0 & other.0) != 0
    }

    pub const fn is_failed(self) -> bool {
        self.contains(Self::FAILED)
    }

    pub fn remove(&mut self, other: Severity) {
        self.0 &= !other.0;
    }

    /// Merge `new` into `self` following the escalation rule: error-class bits
    /// strip OK and LOCAL_RETRY before being OR-ed in.
    pub fn escalate(&mut self, new: Severity) {
        if new.intersects(Self::ERROR_CLASS) {
            self.remove(Self::OK | Self::LOCAL_RETRY);
        }
        self.0 |= new.0;
    }
}

impl BitOr for Severity {
    type Output = Severity;
    fn bitor(self, rhs: Severity) -> Severity {
        Severity(self.0 | rhs.0)
    }
}

impl BitOrAssign for Severity {
    fn bitor_assign(&mut self, rhs: Severity) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Severity {
    type Output = Severity;
    fn bitand(self, rhs: Severity) -> Severity {
        Severity(self.0 & rhs.0)
    }
}

impl Not for Severity {
    type Output = Severity;
    fn not(self) -> Severity {
        Severity(!self.0)
    }
}

impl fmt::Debug for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(Severity, &str)] = &[
            (Severity::OK, "OK"),
            (Severity::RETRY_OK, "RETRY_OK"),
            (Severity::RESELECT_SERVICE, "RESELECT_SERV"),
            (Severity::FAILED, "FAILED"),
            (Severity::USER_ERROR, "USERR"),
            (Severity::SYSTEM_ERROR, "SYERR"),
            (Severity::UNKNOWN_ERROR, "UNERR"),
            (Severity::SERVICE_ERROR, "SEERR"),
            (Severity::NO_RELEASE, "NORLS"),
            (Severity::LOCAL_RETRY, "LOCAL_RETRY"),
            (Severity::END_OF_DATA, "EOD"),
        ];
        if self.0 == 0 {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(*bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        let unknown = self.0 & !NAMES.iter().fold(0, |acc, (b, _)| acc | b.0);
        if unknown != 0 {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{:#x}", unknown)?;
        }
        Ok(())
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// Centralized timeout constants
pub mod timeouts {
    // Poll interval used by the client listener while idle (ms)
    pub const LISTEN_POLL_MS: u64 = 200;

    // Connection establishment timeout for the callback connection (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Upper bound on one controller wait before re-checking worker state (ms)
    pub const SUPERVISE_TICK_MS: u64 = 250;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalate_clears_ok_and_local_retry() {
        let mut sev = Severity::OK | Severity::LOCAL_RETRY;
        sev.escalate(Severity::SYSTEM_ERROR);
        assert!(!sev.contains(Severity::OK));
        assert!(!sev.contains(Severity::LOCAL_RETRY));
        assert!(sev.contains(Severity::SYSTEM_ERROR));
    }

    #[test]
    fn test_escalate_keeps_ok_for_informational_bits() {
        let mut sev = Severity::OK;
        sev.escalate(Severity::NO_RELEASE);
        assert!(sev.contains(Severity::OK));
        assert!(sev.contains(Severity::NO_RELEASE));
    }

    #[test]
    fn test_severity_debug_names() {
        let sev = Severity::FAILED | Severity::USER_ERROR;
        assert_eq!(format!("{:?}", sev), "FAILED|USERR");
        assert_eq!(format!("{:?}", Severity::NONE), "NONE");
    }

    #[test]
    fn test_contains_empty_is_false() {
        assert!(!Severity::FAILED.contains(Severity::NONE));
    }
}
