//! Per-session dispatch.
//!
//! Every accepted session channel runs through the same state machine:
//! classify the client from its magic environment, admit it against the
//! tracker, apply the file-transfer guard, then route to the PTY runner, the
//! non-PTY runner, or the SFTP subsystem. The dispatcher owns the terminal
//! exit code and reports the connection exactly once.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, CryptoVec, Sig};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::command::{build_command, ExecEnv, SystemExecEnv};
use crate::config::{Config, DisconnectFn};
use crate::container::ContainerExecEnv;
use crate::exec::{run_non_pty, run_pty, PtyRequest, WindowSize};
use crate::magic::{extract_container_info, extract_session_type, MagicSessionType};
use crate::server::{SessionEntry, SessionGuard, Shared};
use crate::sftp::run_sftp;

/// Something went wrong with the session itself, rather than the command
/// exiting non-zero. High enough not to shadow real exit codes.
pub const SESSION_ERROR_EXIT_CODE: u32 = 229;

/// The server refused to run a file-transfer command.
pub const BLOCKED_FILE_TRANSFER_EXIT_CODE: u32 = 65;
pub const BLOCKED_FILE_TRANSFER_MESSAGE: &str = "File transfer has been disabled.";

/// Command basenames refused when file transfer is blocked.
const BLOCKED_FILE_TRANSFER_COMMANDS: &[&str] = &["nc", "rsync", "scp", "sftp"];

/// Everything the connection handler collected about one session channel
/// before the start request arrived.
pub(crate) struct SessionInit {
    pub id: Uuid,
    pub remote_addr: String,
    pub channel: Channel<Msg>,
    pub handle: Handle,
    pub channel_id: ChannelId,
    pub env: Vec<(String, String)>,
    pub raw_command: String,
    pub subsystem: Option<String>,
    pub pty: Option<PtyRequest>,
    pub x11_screen: Option<u32>,
    pub agent_requested: bool,
    pub sigs: mpsc::Receiver<Sig>,
    pub resizes: mpsc::Receiver<WindowSize>,
}

/// Reports the connection's final exit code and reason exactly once. If the
/// session is torn down without an explicit exit, the default of 1 is
/// reported, mirroring a bare channel close.
struct Reporter {
    disconnected: Option<DisconnectFn>,
}

impl Reporter {
    fn new(disconnected: Option<DisconnectFn>) -> Self {
        Self { disconnected }
    }

    fn finish(&mut self, code: i32, reason: &str) {
        if let Some(disconnected) = self.disconnected.take() {
            disconnected(code, reason);
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.finish(1, "session closed");
    }
}

/// Brackets a connection counter around the session's lifetime.
struct SessionCount {
    shared: Arc<Shared>,
    magic_type: MagicSessionType,
}

impl SessionCount {
    fn new(shared: &Arc<Shared>, magic_type: MagicSessionType) -> Self {
        match magic_type {
            MagicSessionType::VsCode => {
                shared.conn_count_vscode.fetch_add(1, Ordering::Relaxed);
            }
            MagicSessionType::Ssh => {
                shared.conn_count_ssh.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        Self {
            shared: shared.clone(),
            magic_type,
        }
    }
}

impl Drop for SessionCount {
    fn drop(&mut self) {
        match self.magic_type {
            MagicSessionType::VsCode => {
                self.shared.conn_count_vscode.fetch_sub(1, Ordering::Relaxed);
            }
            MagicSessionType::Ssh => {
                self.shared.conn_count_ssh.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// Sends the exit status after all output, then tears the channel down.
async fn exit(handle: &Handle, channel: ChannelId, code: u32) {
    let _ = handle.exit_status_request(channel, code).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

/// Whether the session must be refused as a restricted file transfer.
///
/// Consider this a "do not trespass" sign rather than a boundary: a user can
/// still smuggle a renamed binary or upload with curl.
fn file_transfer_blocked(config: &Config, subsystem: Option<&str>, raw_command: &str) -> bool {
    if !config.block_file_transfer {
        return false;
    }
    if subsystem == Some("sftp") {
        return true;
    }

    let argv = shell_words::split(raw_command)
        .unwrap_or_else(|_| raw_command.split_whitespace().map(String::from).collect());
    let Some(first) = argv.first() else {
        return false;
    };
    // The binary may be invoked by absolute path, /usr/bin/scp.
    let base = std::path::Path::new(first)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| first.clone());

    BLOCKED_FILE_TRANSFER_COMMANDS.contains(&base.as_str())
}

/// Runs one session channel to completion.
pub(crate) async fn dispatch(shared: Arc<Shared>, init: SessionInit) {
    let SessionInit {
        id,
        remote_addr,
        channel,
        handle,
        channel_id,
        env,
        raw_command,
        subsystem,
        pty,
        x11_screen,
        agent_requested,
        sigs,
        resizes,
    } = init;

    tracing::info!(%id, %remote_addr, "handling ssh session");

    let (magic_type, raw_type, env) = extract_session_type(env);

    let entry = SessionEntry {
        handle: handle.clone(),
        channel: channel_id,
    };
    let Some(_session_guard) = SessionGuard::register(&shared, id, entry) else {
        let reason = "unable to accept new session, server is closing";
        // Report the connection attempt even though it wasn't accepted.
        let disconnected = (shared.config.report_connection)(id, magic_type, &remote_addr);
        tracing::info!(reason);
        // Close without an exit status; there is no process status to report.
        let _ = handle.close(channel_id).await;
        disconnected(1, reason);
        return;
    };

    let _count_guard;
    let mut reporter = match magic_type {
        // JetBrains launches hundreds of sessions; those are accounted on
        // the persistent forward channel instead.
        MagicSessionType::JetBrains => Reporter::new(None),
        other => {
            if other == MagicSessionType::Unknown {
                tracing::warn!(%raw_type, "invalid magic ssh session type specified");
            }
            _count_guard = SessionCount::new(&shared, other);
            Reporter::new(Some((shared.config.report_connection)(
                id,
                other,
                &remote_addr,
            )))
        }
    };

    if file_transfer_blocked(&shared.config, subsystem.as_deref(), &raw_command) {
        tracing::warn!(?subsystem, %raw_command, "file transfer blocked");
        if subsystem.is_none() {
            // Response format: <status code><message body>\n. The sftp
            // subsystem gets no message; it would break the frame parser.
            let message = format!("\x02{}\n", BLOCKED_FILE_TRANSFER_MESSAGE);
            let _ = handle
                .data(channel_id, CryptoVec::from_slice(message.as_bytes()))
                .await;
        }
        exit(&handle, channel_id, BLOCKED_FILE_TRANSFER_EXIT_CODE).await;
        reporter.finish(BLOCKED_FILE_TRANSFER_EXIT_CODE as i32, "file transfer blocked");
        return;
    }

    let (container, container_user, mut env) = extract_container_info(env);
    if let Some(container) = &container {
        tracing::debug!(%container, ?container_user, "container info");
    }

    match subsystem.as_deref() {
        None => {}
        Some("sftp") => {
            if shared.config.experimental_containers && container.is_some() {
                let reason = "sftp not yet supported with containers";
                exit(&handle, channel_id, 1).await;
                reporter.finish(1, reason);
                return;
            }
            let cwd = match SystemExecEnv.home_dir() {
                Ok(home) => home,
                Err(err) => {
                    tracing::warn!(error = %err, "get sftp working directory failed, unable to get home dir");
                    std::path::PathBuf::from("/")
                }
            };
            run_sftp(shared.metrics.clone(), channel, cwd).await;
            // Without an explicit exit status the bare channel close makes
            // some clients (scp over the sftp backend) report failure.
            exit(&handle, channel_id, 0).await;
            reporter.finish(0, "");
            return;
        }
        Some(other) => {
            tracing::warn!(subsystem = other, "unsupported subsystem");
            exit(&handle, channel_id, 1).await;
            reporter.finish(1, &format!("unsupported subsystem: {other}"));
            return;
        }
    }

    let is_pty = pty.is_some();

    if let Some(screen) = x11_screen {
        match shared.x11.start(handle.clone()).await {
            Ok(display) => {
                env.push(("DISPLAY".to_string(), format!("localhost:{display}.{screen}")));
            }
            Err(err) => {
                tracing::error!(error = %err, "x11 handler failed");
                shared.metrics.session_error(magic_type, is_pty, "x11_handler");
                exit(&handle, channel_id, 1).await;
                reporter.finish(1, "x11 handler failed");
                return;
            }
        }
    }

    let exec_env: Box<dyn ExecEnv> = match container {
        Some(container) if shared.config.experimental_containers => {
            Box::new(ContainerExecEnv::new(container, container_user))
        }
        _ => Box::new(SystemExecEnv),
    };
    let home_dir = exec_env.home_dir().ok();

    let mut spec = match build_command(&shared.config, &raw_command, env, exec_env.as_ref()) {
        Ok(spec) => spec,
        Err(err) => {
            shared.metrics.session_error(magic_type, is_pty, "create_command");
            tracing::warn!(error = %err, "ssh session failed");
            exit(&handle, channel_id, SESSION_ERROR_EXIT_CODE).await;
            reporter.finish(SESSION_ERROR_EXIT_CODE as i32, &err.to_string());
            return;
        }
    };

    let _agent_guard;
    if agent_requested {
        match crate::agent::start_agent_listener(id, handle.clone()).await {
            Ok((socket_path, guard)) => {
                spec.env.push((
                    "SSH_AUTH_SOCK".to_string(),
                    socket_path.to_string_lossy().into_owned(),
                ));
                _agent_guard = guard;
            }
            Err(err) => {
                shared.metrics.session_error(magic_type, is_pty, "listener");
                tracing::warn!(error = %err, "ssh session failed");
                exit(&handle, channel_id, SESSION_ERROR_EXIT_CODE).await;
                reporter.finish(SESSION_ERROR_EXIT_CODE as i32, &err.to_string());
                return;
            }
        }
    }

    let (reader, writer) = tokio::io::split(channel.into_stream());

    let result = if let Some(pty_req) = pty {
        run_pty(
            &shared,
            magic_type,
            spec,
            &raw_command,
            home_dir,
            pty_req,
            reader,
            writer,
            sigs,
            resizes,
        )
        .await
    } else {
        run_non_pty(
            &shared,
            magic_type,
            spec,
            reader,
            writer,
            handle.clone(),
            channel_id,
            sigs,
        )
        .await
    };

    match result {
        Ok(status) => {
            if status.success() {
                tracing::info!("normal ssh session exit");
                exit(&handle, channel_id, 0).await;
                reporter.finish(0, "");
            } else {
                // A killed process has no exit code; transmitting -1 would
                // arrive as 4294967295, so report 255 like OpenSSH.
                let raw_code = status.code().unwrap_or(-1);
                let code = match raw_code {
                    -1 => 255,
                    code => code,
                };
                tracing::info!(process_exit_code = raw_code, exit_code = code, "ssh session returned");
                exit(&handle, channel_id, code as u32).await;
                reporter.finish(code, &format!("process exited with error status: {raw_code}"));
            }
        }
        Err(err) => {
            tracing::warn!(error = ?err, "ssh session failed");
            exit(&handle, channel_id, SESSION_ERROR_EXIT_CODE).await;
            reporter.finish(SESSION_ERROR_EXIT_CODE as i32, &err.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(block: bool) -> Config {
        Config {
            block_file_transfer: block,
            ..Config::default()
        }
    }

    #[test]
    fn test_guard_disabled() {
        assert!(!file_transfer_blocked(&config(false), Some("sftp"), ""));
        assert!(!file_transfer_blocked(&config(false), None, "scp -t /tmp"));
    }

    #[test]
    fn test_guard_sftp_subsystem() {
        assert!(file_transfer_blocked(&config(true), Some("sftp"), ""));
    }

    #[test]
    fn test_guard_commands() {
        let config = config(true);
        assert!(file_transfer_blocked(&config, None, "scp -t /tmp"));
        assert!(file_transfer_blocked(&config, None, "/usr/bin/scp -t /tmp"));
        assert!(file_transfer_blocked(&config, None, "rsync --server ."));
        assert!(file_transfer_blocked(&config, None, "nc -l 8080"));
        assert!(file_transfer_blocked(&config, None, "sftp"));

        assert!(!file_transfer_blocked(&config, None, ""));
        assert!(!file_transfer_blocked(&config, None, "echo scp"));
        assert!(!file_transfer_blocked(&config, None, "curl example.com"));
        // Blocking is by basename, not substring.
        assert!(!file_transfer_blocked(&config, None, "scp2 -t /tmp"));
    }
}
