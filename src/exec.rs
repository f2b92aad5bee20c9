//! Session process runners.
//!
//! [`run_pty`] attaches the child to a fresh pseudo-terminal and pumps the
//! channel, signals, and window resizes. [`run_non_pty`] runs the child with
//! piped stdio in its own process group; its lifetime is deliberately NOT
//! tied to the session. OpenSSH keeps a detached command running after the
//! client disconnects, and so do we. Only server close terminates it, via a
//! group SIGHUP on tracked processes.
//!
//! Both runners treat a non-zero exit status as the product of the session,
//! not an error.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec, Sig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::banner::{is_login_shell, is_quiet_login, render_banner, render_motd};
use crate::command::CommandSpec;
use crate::magic::MagicSessionType;
use crate::server::{ProcessGuard, Shared};

/// PTY parameters requested by the client.
#[derive(Debug, Clone)]
pub(crate) struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

/// Window dimensions from a window-change request.
pub(crate) type WindowSize = (u32, u32);

/// Maps an SSH signal name to the OS signal delivered to the child.
fn os_signal(sig: &Sig) -> Option<Signal> {
    Some(match sig {
        Sig::ABRT => Signal::SIGABRT,
        Sig::ALRM => Signal::SIGALRM,
        Sig::FPE => Signal::SIGFPE,
        Sig::HUP => Signal::SIGHUP,
        Sig::ILL => Signal::SIGILL,
        Sig::INT => Signal::SIGINT,
        Sig::KILL => Signal::SIGKILL,
        Sig::PIPE => Signal::SIGPIPE,
        Sig::QUIT => Signal::SIGQUIT,
        Sig::SEGV => Signal::SIGSEGV,
        Sig::TERM => Signal::SIGTERM,
        Sig::USR1 => Signal::SIGUSR1,
        Sig::Custom(name) if name == "USR2" => Signal::SIGUSR2,
        Sig::Custom(_) => return None,
    })
}

fn deliver_signal(
    shared: &Shared,
    magic_type: MagicSessionType,
    pty: bool,
    pid: Pid,
    sig: &Sig,
) {
    let Some(signal) = os_signal(sig) else {
        tracing::debug!(signal = ?sig, "ignoring unsupported signal");
        return;
    };
    tracing::info!(signal = %signal, "received signal from client");
    if let Err(err) = nix::sys::signal::kill(pid, signal) {
        tracing::warn!(signal = %signal, error = %err, "signaling the process failed");
        shared.metrics.session_error(magic_type, pty, "signal");
    }
}

fn clip(dim: u32) -> u16 {
    dim.min(u32::from(u16::MAX)) as u16
}

/// Runs a command attached to a newly allocated PTY.
///
/// The output copy happens on this task so the exit status is only observed
/// after the last output byte has been handed to the channel.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_pty<R, W>(
    shared: &Arc<Shared>,
    magic_type: MagicSessionType,
    spec: CommandSpec,
    raw_command: &str,
    home_dir: Option<PathBuf>,
    pty_req: PtyRequest,
    reader: R,
    mut writer: W,
    sigs: mpsc::Receiver<Sig>,
    resizes: mpsc::Receiver<WindowSize>,
) -> Result<ExitStatus>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    shared.metrics.session_started(magic_type, true);

    if is_login_shell(raw_command) {
        for banner in (shared.config.announcement_banners)() {
            if let Some(rendered) = render_banner(&banner) {
                if let Err(err) = writer.write_all(rendered.as_bytes()).await {
                    tracing::error!(error = %err, "failed to show announcement banner");
                    shared
                        .metrics
                        .session_error(magic_type, true, "announcement_banner");
                    break;
                }
            }
        }
    }

    if !is_quiet_login(raw_command, home_dir.as_deref()) {
        let motd_path = (shared.config.motd_file)();
        match render_motd(motd_path.as_deref()) {
            Ok(Some(motd)) => {
                if let Err(err) = writer.write_all(motd.as_bytes()).await {
                    tracing::error!(error = %err, "failed to show MOTD");
                    shared.metrics.session_error(magic_type, true, "motd");
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(error = %err, "failed to show MOTD");
                shared.metrics.session_error(magic_type, true, "motd");
            }
        }
    }

    let mut env = spec.env;
    env.push(("TERM".to_string(), pty_req.term.clone()));

    let pty = pty_process::Pty::new().context("allocate pty")?;
    let pts = pty.pts().context("open pts")?;

    let mut command = pty_process::Command::new(&spec.program);
    command
        .args(&spec.args)
        .env_clear()
        .envs(env)
        .current_dir(&spec.dir);
    let mut child = match command.spawn(&pts) {
        Ok(child) => child,
        Err(err) => {
            shared.metrics.session_error(magic_type, true, "start_command");
            return Err(err).context("start command");
        }
    };
    let pid = Pid::from_raw(child.id().map(|id| id as i32).unwrap_or_default());

    let Some(_process_guard) = ProcessGuard::register(shared, pid) else {
        // The server is closing; the process was never admitted.
        let _ = child.start_kill();
        anyhow::bail!("failed to track process: server is closing");
    };

    // Resizing only works once the child has been spawned.
    if let Err(err) = pty.resize(pty_process::Size::new(
        clip(pty_req.rows),
        clip(pty_req.cols),
    )) {
        tracing::warn!(error = %err, "failed to set initial pty size");
        shared.metrics.session_error(magic_type, true, "resize");
    }

    let (mut pty_reader, pty_writer) = pty.into_split();
    let pty_writer = Arc::new(tokio::sync::Mutex::new(pty_writer));

    let fan_in = tokio::spawn(signal_resize_fan_in(
        shared.clone(),
        magic_type,
        pid,
        pty_writer.clone(),
        sigs,
        resizes,
    ));

    let input_writer = pty_writer.clone();
    let input_shared = shared.clone();
    let input_copy = tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(err) = input_writer.lock().await.write_all(&buf[..n]).await {
                        tracing::debug!(error = %err, "pty input copy ended");
                        input_shared
                            .metrics
                            .session_error(magic_type, true, "input_io_copy");
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Client-bound copy stays on this task: when it finishes, every output
    // byte is already queued ahead of the exit status we report next.
    let mut copied = 0u64;
    let mut copy_err = None;
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        match pty_reader.read(&mut buf).await {
            // The pty read fails with EIO once the child exits and the
            // buffered output has been drained; that is the normal end.
            Ok(0) | Err(_) => break,
            Ok(n) => {
                copied += n as u64;
                if let Err(err) = writer.write_all(&buf[..n]).await {
                    shared
                        .metrics
                        .session_error(magic_type, true, "output_io_copy");
                    copy_err = Some(anyhow::Error::from(err).context("copy error"));
                    break;
                }
            }
        }
    }
    tracing::debug!(bytes = copied, "copy output done");

    input_copy.abort();

    if let Some(err) = copy_err {
        fan_in.abort();
        return Err(err);
    }

    // All output is in; wait for the exit status. Returns immediately when
    // the TTY closed because the command exited.
    let wait_result = child.wait().await;
    fan_in.abort();
    drop(pty_writer);

    match wait_result {
        Ok(status) => Ok(status),
        Err(err) => {
            tracing::warn!(error = %err, "process wait exited with error");
            shared.metrics.session_error(magic_type, true, "wait");
            Err(err).context("process wait")
        }
    }
}

/// Consumes client signals and window resizes for a PTY session.
///
/// Either source may retire (sender dropped) while the other stays live; the
/// loop only exits once both are gone.
async fn signal_resize_fan_in(
    shared: Arc<Shared>,
    magic_type: MagicSessionType,
    pid: Pid,
    pty_writer: Arc<tokio::sync::Mutex<pty_process::OwnedWritePty>>,
    sigs: mpsc::Receiver<Sig>,
    resizes: mpsc::Receiver<WindowSize>,
) {
    let mut sigs = Some(sigs);
    let mut resizes = Some(resizes);
    loop {
        tokio::select! {
            sig = async { sigs.as_mut().unwrap().recv().await }, if sigs.is_some() => {
                match sig {
                    Some(sig) => deliver_signal(&shared, magic_type, true, pid, &sig),
                    None => sigs = None,
                }
            }
            win = async { resizes.as_mut().unwrap().recv().await }, if resizes.is_some() => {
                match win {
                    Some((cols, rows)) => {
                        let size = pty_process::Size::new(clip(rows), clip(cols));
                        if let Err(err) = pty_writer.lock().await.resize(size) {
                            // A closed pty means the command already exited.
                            tracing::debug!(error = %err, "failed to resize tty");
                            shared.metrics.session_error(magic_type, true, "resize");
                        }
                    }
                    None => resizes = None,
                }
            }
            else => break,
        }
    }
}

/// Runs a command without a TTY.
///
/// The child joins its own process group and is not cancelled when the
/// session ends; it stays tracked so server close can SIGHUP the group.
pub(crate) async fn run_non_pty<R, W>(
    shared: &Arc<Shared>,
    magic_type: MagicSessionType,
    spec: CommandSpec,
    reader: R,
    mut writer: W,
    handle: Handle,
    channel_id: ChannelId,
    mut sigs: mpsc::Receiver<Sig>,
) -> Result<ExitStatus>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    shared.metrics.session_started(magic_type, false);

    let mut command = tokio::process::Command::new(&spec.program);
    command
        .args(&spec.args)
        .env_clear()
        .envs(spec.env)
        .current_dir(&spec.dir)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            shared.metrics.session_error(magic_type, false, "start_command");
            return Err(err).context("start command");
        }
    };
    let pid = Pid::from_raw(child.id().map(|id| id as i32).unwrap_or_default());

    let Some(_process_guard) = ProcessGuard::register(shared, pid) else {
        let _ = child.start_kill();
        anyhow::bail!("failed to track process: server is closing");
    };

    // Assigning the channel directly as stdin blocks some platforms waiting
    // for the first byte; an explicit pipe with its own copy task does not.
    let Some(mut stdin) = child.stdin.take() else {
        shared.metrics.session_error(magic_type, false, "stdin_pipe");
        anyhow::bail!("create stdin pipe");
    };
    let stdin_shared = shared.clone();
    let stdin_copy = tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if stdin.write_all(&buf[..n]).await.is_err() {
                        stdin_shared
                            .metrics
                            .session_error(magic_type, false, "stdin_io_copy");
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        // Dropping the pipe delivers EOF to the child.
    });

    let signal_shared = shared.clone();
    let signal_task = tokio::spawn(async move {
        while let Some(sig) = sigs.recv().await {
            deliver_signal(&signal_shared, magic_type, false, pid, &sig);
        }
    });

    let mut stderr = child.stderr.take().context("stderr pipe")?;
    let stderr_handle = handle.clone();
    let stderr_pump = tokio::spawn(async move {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stderr_handle
                        .extended_data(channel_id, 1, CryptoVec::from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    let mut stdout = child.stdout.take().context("stdout pipe")?;
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // A write failure means the client went away; keep draining
                // so the child never blocks on a full pipe.
                if writer.write_all(&buf[..n]).await.is_err() {
                    let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
                    break;
                }
            }
        }
    }

    let _ = stderr_pump.await;

    let wait_result = child.wait().await;
    stdin_copy.abort();
    signal_task.abort();

    wait_result.context("wait for command")
}
