//! JetBrains Gateway connection accounting.
//!
//! JetBrains launches hundreds of short-lived SSH sessions, so sessions are
//! not counted individually; instead the single persistent direct-tcpip
//! channel to the IDE backend is detected and counted. Detection walks procfs
//! for the process listening on the forwarded port and looks for the
//! JetBrains marker in its command line, so it is Linux-only.

use std::path::Path;

use uuid::Uuid;

use crate::config::DisconnectFn;
use crate::magic::MagicSessionType;
use crate::server::Shared;

/// Marker JetBrains software always carries on its command line.
pub const MAGIC_PROCESS_CMDLINE_JETBRAINS: &str = "idea.vendor.name=JetBrains";

/// Counts one JetBrains forward channel for as long as it is alive.
pub(crate) struct JetBrainsForward {
    shared: std::sync::Arc<Shared>,
    disconnected: Option<DisconnectFn>,
}

impl JetBrainsForward {
    /// Inspects a direct-tcpip target; when the destination port belongs to a
    /// JetBrains process, returns a guard that holds the connection count.
    pub(crate) fn watch(
        shared: &std::sync::Arc<Shared>,
        remote_addr: &str,
        port: u32,
    ) -> Option<Self> {
        let port = u16::try_from(port).ok()?;
        if !port_owned_by_jetbrains(Path::new("/proc"), port) {
            return None;
        }

        tracing::info!(port, "discovered forwarded jetbrains process");
        shared
            .conn_count_jetbrains
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let disconnected = (shared.config.report_connection)(
            Uuid::new_v4(),
            MagicSessionType::JetBrains,
            remote_addr,
        );
        Some(Self {
            shared: shared.clone(),
            disconnected: Some(disconnected),
        })
    }
}

impl Drop for JetBrainsForward {
    fn drop(&mut self) {
        self.shared
            .conn_count_jetbrains
            .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        if let Some(disconnected) = self.disconnected.take() {
            disconnected(0, "connection closed");
        }
    }
}

/// Whether the local process listening on `port` is JetBrains software.
fn port_owned_by_jetbrains(proc_root: &Path, port: u16) -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }

    let inodes: Vec<u64> = ["net/tcp", "net/tcp6"]
        .iter()
        .filter_map(|table| std::fs::read_to_string(proc_root.join(table)).ok())
        .flat_map(|content| listening_inodes(&content, port))
        .collect();
    if inodes.is_empty() {
        return false;
    }

    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return false;
    };
    for entry in entries.flatten() {
        let pid_dir = entry.path();
        if !entry
            .file_name()
            .to_string_lossy()
            .chars()
            .all(|c| c.is_ascii_digit())
        {
            continue;
        }
        if !process_owns_socket(&pid_dir, &inodes) {
            continue;
        }
        if let Ok(cmdline) = std::fs::read(pid_dir.join("cmdline")) {
            if cmdline_is_jetbrains(&cmdline) {
                return true;
            }
        }
    }
    false
}

/// Socket inodes in LISTEN state bound to `port`, parsed from a
/// `/proc/net/tcp`-format table.
fn listening_inodes(table: &str, port: u16) -> Vec<u64> {
    const TCP_LISTEN: &str = "0A";

    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            let inode = fields.get(9)?;

            let local_port = u16::from_str_radix(local.rsplit(':').next()?, 16).ok()?;
            if local_port == port && *state == TCP_LISTEN {
                inode.parse().ok()
            } else {
                None
            }
        })
        .collect()
}

fn process_owns_socket(pid_dir: &Path, inodes: &[u64]) -> bool {
    let Ok(fds) = std::fs::read_dir(pid_dir.join("fd")) else {
        return false;
    };
    for fd in fds.flatten() {
        if let Ok(target) = std::fs::read_link(fd.path()) {
            let target = target.to_string_lossy();
            if let Some(inode) = target
                .strip_prefix("socket:[")
                .and_then(|rest| rest.strip_suffix(']'))
                .and_then(|inode| inode.parse::<u64>().ok())
            {
                if inodes.contains(&inode) {
                    return true;
                }
            }
        }
    }
    false
}

fn cmdline_is_jetbrains(cmdline: &[u8]) -> bool {
    // cmdline arguments are NUL-separated.
    String::from_utf8_lossy(cmdline).contains(MAGIC_PROCESS_CMDLINE_JETBRAINS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listening_inodes() {
        // 0x1A0B = 6667, state 0A = LISTEN, inode 34062.
        let table = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1A0B 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 34062 1
   1: 0100007F:1A0B 00000000:0000 01 00000000:00000000 00:00000000 00000000  1000        0 34063 1
   2: 0100007F:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 10001 1";

        assert_eq!(listening_inodes(table, 6667), vec![34062]);
        assert_eq!(listening_inodes(table, 22), vec![10001]);
        assert!(listening_inodes(table, 8080).is_empty());
    }

    #[test]
    fn test_cmdline_is_jetbrains() {
        let cmdline = b"java\0-Didea.vendor.name=JetBrains\0-jar\0remote-dev.jar\0";
        assert!(cmdline_is_jetbrains(cmdline));
        assert!(!cmdline_is_jetbrains(b"sshd\0-D\0"));
    }
}
