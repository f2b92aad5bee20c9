//! In-workspace SSH server for remote development agents.
//!
//! Terminates SSH connections from users and their IDE extensions inside a
//! workspace. Authentication is intentionally absent: the overlay network in
//! front of the agent authenticates, and the deterministic host key exists
//! only so clients have something to ignore. Sessions run as the workspace
//! OS user, with support for:
//!
//! - interactive shells and exec commands, with or without a PTY
//! - the SFTP subsystem
//! - local and remote TCP and Unix-socket forwarding
//! - X11 and agent forwarding
//!
//! Sessions are classified by the magic environment variable IDE extensions
//! set (`CODER_SSH_SESSION_TYPE`) for connection accounting, and common file
//! transfer commands can be blocked by policy.

pub mod banner;
pub mod command;
pub mod config;
pub mod container;
pub mod magic;
pub mod metrics;
pub mod x11;

mod agent;
mod exec;
mod handler;
mod jetbrains;
mod server;
mod session;
mod sftp;

pub use config::{Banner, Config, DisconnectFn, FileConfig, ReportConnectionFn};
pub use jetbrains::MAGIC_PROCESS_CMDLINE_JETBRAINS;
pub use magic::MagicSessionType;
pub use metrics::MetricsSnapshot;
pub use server::{ConnStats, Server};
pub use session::{
    BLOCKED_FILE_TRANSFER_EXIT_CODE, BLOCKED_FILE_TRANSFER_MESSAGE, SESSION_ERROR_EXIT_CODE,
};
