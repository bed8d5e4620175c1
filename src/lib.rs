//! rtcpd
//!
//! Tape copy daemon: accepts copy requests from a volume scheduler or a
//! bridge, calls the requesting client back for the request list, and moves
//! data between disk files and tape files through a shared buffer ring.

pub mod accounting;
pub mod buffer;
pub mod cli;
pub mod client;
pub mod config;
pub mod control;
pub mod drive;
pub mod error;
pub mod net;
pub mod protocol;
pub mod protocol_core;
pub mod reqlist;
pub mod request;
pub mod serialize;
pub mod session;
pub mod worker;
