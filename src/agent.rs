//! SSH agent forwarding.
//!
//! When the client requests agent forwarding, the server hosts a Unix socket
//! inside the session and relays every connection back to the client's agent
//! over an `auth-agent@openssh.com` channel. The socket path is exported as
//! `SSH_AUTH_SOCK`.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use russh::server::Handle;
use tokio::net::UnixListener;
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Owns the forwarding socket for one session; dropping it stops the
/// listener and removes the socket directory.
pub(crate) struct AgentListenerGuard {
    dir: PathBuf,
    task: AbortHandle,
}

impl Drop for AgentListenerGuard {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub(crate) async fn start_agent_listener(
    id: Uuid,
    handle: Handle,
) -> Result<(PathBuf, AgentListenerGuard)> {
    let dir = std::env::temp_dir().join(format!("workspace-sshd-agent-{id}"));
    tokio::fs::create_dir_all(&dir)
        .await
        .context("create agent socket dir")?;
    // The socket must only be reachable by the workspace user.
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
        .context("restrict agent socket dir")?;

    let socket_path = dir.join("agent.sock");
    let listener = UnixListener::bind(&socket_path).context("new agent listener")?;

    let task = tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::debug!(error = %err, "agent listener closed");
                    return;
                }
            };
            let handle = handle.clone();
            tokio::spawn(async move {
                match handle.channel_open_agent().await {
                    Ok(channel) => {
                        let mut channel_stream = channel.into_stream();
                        let _ =
                            tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await;
                    }
                    Err(err) => {
                        tracing::warn!(error = ?err, "failed to open agent channel");
                    }
                }
            });
        }
    });

    Ok((
        socket_path,
        AgentListenerGuard {
            dir,
            task: task.abort_handle(),
        },
    ))
}
