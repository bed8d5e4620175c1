//! Command line options for the rtcpd binary

use clap::Parser;
use std::path::PathBuf;

/// Tape copy daemon
#[derive(Clone, Debug, Parser)]
#[command(name = "rtcpd", version, about)]
pub struct DaemonOpts {
    /// Bind address (host:port); overrides the configuration file
    #[arg(long)]
    pub bind: Option<String>,

    /// Configuration file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Directory holding the emulated volumes
    #[arg(long)]
    pub tape_root: Option<PathBuf>,

    /// Append accounting records as JSON lines to this file
    #[arg(long)]
    pub accounting_log: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_are_optional() {
        let opts = DaemonOpts::try_parse_from(["rtcpd"]).unwrap();
        assert!(opts.bind.is_none());
        assert!(opts.config.is_none());

        let opts = DaemonOpts::try_parse_from([
            "rtcpd",
            "--bind",
            "127.0.0.1:5011",
            "-c",
            "/tmp/rtcpd.toml",
            "--tape-root",
            "/srv/tapes",
        ])
        .unwrap();
        assert_eq!(opts.bind.as_deref(), Some("127.0.0.1:5011"));
        assert_eq!(opts.tape_root, Some(PathBuf::from("/srv/tapes")));
    }
}
