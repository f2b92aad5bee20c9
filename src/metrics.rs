//! Connection and session counters.
//!
//! Counters are plain atomics readable through [`MetricsSnapshot`]; the outer
//! agent scrapes the snapshot into whatever backend it runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::magic::MagicSessionType;

const MAGIC_TYPES: usize = 4;

/// Counters kept by the SSH server.
#[derive(Default)]
pub struct ServerMetrics {
    pub(crate) failed_connections_total: AtomicU64,
    pub(crate) sftp_connections_total: AtomicU64,
    pub(crate) sftp_server_errors: AtomicU64,
    pub(crate) x11_handler_errors: AtomicU64,

    // Indexed by magic type, then pty yes/no.
    sessions_total: [[AtomicU64; 2]; MAGIC_TYPES],
    session_errors: Mutex<HashMap<SessionErrorKey, u64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionErrorKey {
    pub magic_type: MagicSessionType,
    pub pty: bool,
    pub reason: &'static str,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn session_started(&self, magic_type: MagicSessionType, pty: bool) {
        self.sessions_total[magic_type.index()][usize::from(pty)].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_error(&self, magic_type: MagicSessionType, pty: bool, reason: &'static str) {
        let key = SessionErrorKey {
            magic_type,
            pty,
            reason,
        };
        let mut errors = self.session_errors.lock().unwrap();
        *errors.entry(key).or_insert(0) += 1;
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut sessions_total = HashMap::new();
        for magic_type in [
            MagicSessionType::Unknown,
            MagicSessionType::Ssh,
            MagicSessionType::VsCode,
            MagicSessionType::JetBrains,
        ] {
            for pty in [false, true] {
                let count = self.sessions_total[magic_type.index()][usize::from(pty)]
                    .load(Ordering::Relaxed);
                if count > 0 {
                    sessions_total.insert((magic_type, pty), count);
                }
            }
        }

        MetricsSnapshot {
            failed_connections_total: self.failed_connections_total.load(Ordering::Relaxed),
            sftp_connections_total: self.sftp_connections_total.load(Ordering::Relaxed),
            sftp_server_errors: self.sftp_server_errors.load(Ordering::Relaxed),
            x11_handler_errors: self.x11_handler_errors.load(Ordering::Relaxed),
            sessions_total,
            session_errors: self.session_errors.lock().unwrap().clone(),
        }
    }
}

/// Copy of the counters at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub failed_connections_total: u64,
    pub sftp_connections_total: u64,
    pub sftp_server_errors: u64,
    pub x11_handler_errors: u64,
    pub sessions_total: HashMap<(MagicSessionType, bool), u64>,
    pub session_errors: HashMap<SessionErrorKey, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = ServerMetrics::new();
        metrics.session_started(MagicSessionType::VsCode, true);
        metrics.session_started(MagicSessionType::VsCode, true);
        metrics.session_started(MagicSessionType::Ssh, false);
        metrics.session_error(MagicSessionType::Ssh, false, "start_command");
        metrics.failed_connections_total.fetch_add(1, Ordering::Relaxed);

        let snap = metrics.snapshot();
        assert_eq!(snap.failed_connections_total, 1);
        assert_eq!(snap.sessions_total[&(MagicSessionType::VsCode, true)], 2);
        assert_eq!(snap.sessions_total[&(MagicSessionType::Ssh, false)], 1);
        assert_eq!(
            snap.session_errors[&SessionErrorKey {
                magic_type: MagicSessionType::Ssh,
                pty: false,
                reason: "start_command",
            }],
            1
        );
    }
}
