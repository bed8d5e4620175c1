use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::net::TcpListener;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rtcpd::accounting::{AccountingSink, JsonlAccounting, NoopAccounting};
use rtcpd::cli::DaemonOpts;
use rtcpd::client::LocalAccounts;
use rtcpd::config::Config;
use rtcpd::drive::DirectoryDrive;
use rtcpd::net::Daemon;
use rtcpd::session::SessionEnv;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing();

    let mut config = Config::load(opts.config.as_deref())?;
    if let Some(bind) = opts.bind {
        config.bind = bind;
    }
    if let Some(root) = opts.tape_root {
        config.tape_root = root;
    }
    if let Some(log) = opts.accounting_log {
        config.accounting_log = Some(log);
    }
    config.validate()?;

    if !config.tape_root.is_dir() {
        std::fs::create_dir_all(&config.tape_root)
            .with_context(|| format!("create tape root {}", config.tape_root.display()))?;
    }
    let accounting: Arc<dyn AccountingSink> = match &config.accounting_log {
        Some(path) => Arc::new(JsonlAccounting::new(path)?),
        None => Arc::new(NoopAccounting),
    };

    info!(
        host = %hostname::get().map(|h| h.to_string_lossy().into_owned()).unwrap_or_default(),
        bind = %config.bind,
        tape_root = %config.tape_root.display(),
        buffers = config.nb_bufs,
        buffer_size = config.buffer_size(),
        disk_workers = config.disk_workers,
        "starting rtcpd"
    );
    if config.bind.starts_with("0.0.0.0") {
        warn!("listening on all interfaces");
    }

    let listener =
        TcpListener::bind(&config.bind).with_context(|| format!("bind {}", config.bind))?;
    let daemon = Arc::new(Daemon::new(SessionEnv {
        drive: Arc::new(DirectoryDrive::new(&config.tape_root)),
        accounts: Arc::new(LocalAccounts),
        accounting,
        config,
    }));

    {
        let daemon = Arc::clone(&daemon);
        ctrlc::set_handler(move || daemon.shutdown()).context("install signal handler")?;
    }
    daemon.serve(listener)?;
    info!("rtcpd stopped");
    Ok(())
}
