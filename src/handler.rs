//! Per-connection SSH handling.
//!
//! One [`ConnectionHandler`] exists per TCP connection. It accumulates the
//! requests a client sends before starting a session (environment, PTY, X11,
//! agent forwarding), then hands the channel to the session dispatcher on the
//! shell/exec/subsystem request. Signals and window changes arriving after
//! the start are forwarded into the running session over bounded queues.
//!
//! The handler also owns the connection's forwarding features: direct-tcpip
//! and direct-streamlocal channels, and the reverse tcpip/streamlocal
//! forward listeners.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Sig};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::exec::{PtyRequest, WindowSize};
use crate::jetbrains::JetBrainsForward;
use crate::server::Shared;
use crate::session::{dispatch, SessionInit};

/// Per-channel state collected before the session starts.
#[derive(Default)]
struct ChannelState {
    channel: Option<Channel<Msg>>,
    env: Vec<(String, String)>,
    pty: Option<PtyRequest>,
    x11_screen: Option<u32>,
    agent_requested: bool,
    sig_tx: Option<mpsc::Sender<Sig>>,
    resize_tx: Option<mpsc::Sender<WindowSize>>,
}

/// Handles one SSH connection.
pub(crate) struct ConnectionHandler {
    shared: Arc<Shared>,
    peer_addr: SocketAddr,
    channels: HashMap<ChannelId, ChannelState>,
    remote_forwards: HashMap<(String, u32), tokio::task::JoinHandle<()>>,
    streamlocal_forwards: HashMap<String, tokio::task::JoinHandle<()>>,
}

impl ConnectionHandler {
    pub(crate) fn new(shared: Arc<Shared>, peer_addr: SocketAddr) -> Self {
        Self {
            shared,
            peer_addr,
            channels: HashMap::new(),
            remote_forwards: HashMap::new(),
            streamlocal_forwards: HashMap::new(),
        }
    }

    /// Hands the channel to the session dispatcher. Each channel runs at
    /// most one session; duplicate start requests fail.
    fn start_session(
        &mut self,
        channel_id: ChannelId,
        raw_command: String,
        subsystem: Option<String>,
        session: &mut Session,
    ) -> Result<()> {
        let Some(state) = self.channels.get_mut(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        let Some(channel) = state.channel.take() else {
            tracing::warn!(?channel_id, "session already started on channel");
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        // Signals are naturally rate-limited, so a depth of one is enough;
        // resizes can burst while a terminal is being dragged.
        let (sig_tx, sig_rx) = mpsc::channel(1);
        let (resize_tx, resize_rx) = mpsc::channel(16);
        state.sig_tx = Some(sig_tx);
        state.resize_tx = Some(resize_tx);

        let init = SessionInit {
            id: Uuid::new_v4(),
            remote_addr: self.peer_addr.to_string(),
            channel,
            handle: session.handle(),
            channel_id,
            env: state.env.clone(),
            raw_command,
            subsystem,
            pty: state.pty.clone(),
            x11_screen: state.x11_screen,
            agent_requested: state.agent_requested,
            sigs: sig_rx,
            resizes: resize_rx,
        };

        session.channel_success(channel_id)?;
        tokio::spawn(dispatch(self.shared.clone(), init));
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        for (_, task) in self.remote_forwards.drain() {
            task.abort();
        }
        for (path, task) in self.streamlocal_forwards.drain() {
            task.abort();
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    /// The overlay network in front of the agent authenticates; the SSH
    /// layer accepts everyone.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        tracing::debug!(user, "accepting connection without authentication");
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(channel_id = ?channel.id(), "session channel opened");
        self.channels.insert(
            channel.id(),
            ChannelState {
                channel: Some(channel),
                ..ChannelState::default()
            },
        );
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state
                .env
                .push((variable_name.to_string(), variable_value.to_string()));
            session.channel_success(channel_id)?;
        } else {
            session.channel_failure(channel_id)?;
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(term, cols = col_width, rows = row_height, "pty request");
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state.pty = Some(PtyRequest {
                term: term.to_string(),
                cols: col_width,
                rows: row_height,
            });
            session.channel_success(channel_id)?;
        } else {
            session.channel_failure(channel_id)?;
        }
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel_id: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(screen = x11_screen_number, "x11 request");
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state.x11_screen = Some(x11_screen_number);
            session.channel_success(channel_id)?;
        } else {
            session.channel_failure(channel_id)?;
        }
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("agent forwarding request");
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state.agent_requested = true;
            session.channel_success(channel_id)?;
            Ok(true)
        } else {
            session.channel_failure(channel_id)?;
            Ok(false)
        }
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_session(channel_id, String::new(), None, session)
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw_command = String::from_utf8_lossy(data).into_owned();
        self.start_session(channel_id, raw_command, None, session)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_session(channel_id, String::new(), Some(name.to_string()), session)
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self
            .channels
            .get(&channel_id)
            .and_then(|state| state.resize_tx.as_ref())
        {
            // A full queue just means the session hasn't caught up with a
            // resize burst; the latest size will still arrive.
            let _ = tx.try_send((col_width, row_height));
        }
        Ok(())
    }

    async fn signal(
        &mut self,
        channel_id: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self
            .channels
            .get(&channel_id)
            .and_then(|state| state.sig_tx.as_ref())
        {
            let _ = tx.send(signal).await;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(?channel_id, "channel closed");
        // Dropping the state retires the signal and resize sources.
        self.channels.remove(&channel_id);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            host = host_to_connect,
            port = port_to_connect,
            orig_host = originator_address,
            orig_port = originator_port,
            "direct-tcpip request"
        );

        let shared = self.shared.clone();
        let remote_addr = self.peer_addr.to_string();
        let target = format!("{host_to_connect}:{port_to_connect}");
        tokio::spawn(async move {
            // The watcher classifies the IDE's persistent forward channel;
            // holding it brackets the JetBrains connection count.
            let watch = JetBrainsForward::watch(&shared, &remote_addr, port_to_connect);
            match TcpStream::connect(&target).await {
                Ok(mut stream) => {
                    let mut channel_stream = channel.into_stream();
                    let _ =
                        tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await;
                }
                Err(err) => {
                    tracing::warn!(target, error = %err, "direct-tcpip connect failed");
                }
            }
            drop(watch);
        });

        Ok(true)
    }

    async fn channel_open_direct_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(socket_path, "direct-streamlocal request");

        let socket_path = socket_path.to_string();
        tokio::spawn(async move {
            match UnixStream::connect(&socket_path).await {
                Ok(mut stream) => {
                    let mut channel_stream = channel.into_stream();
                    let _ =
                        tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await;
                }
                Err(err) => {
                    tracing::warn!(socket_path, error = %err, "direct-streamlocal connect failed");
                }
            }
        });

        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let bind_host = if address.is_empty() || address == "*" {
            "127.0.0.1"
        } else {
            address
        };
        let listen_addr = format!("{bind_host}:{port}");

        let listener = match TcpListener::bind(&listen_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(listen_addr, error = %err, "tcpip-forward bind failed");
                return Ok(false);
            }
        };
        if *port == 0 {
            if let Ok(addr) = listener.local_addr() {
                *port = u32::from(addr.port());
            }
        }
        tracing::debug!(address, port = *port, "started remote forward");

        let handle = session.handle();
        let forwarded_address = address.to_string();
        let forwarded_port = *port;
        let task = tokio::spawn(async move {
            loop {
                let (mut stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "remote forward accept failed");
                        return;
                    }
                };
                let handle = handle.clone();
                let address = forwarded_address.clone();
                tokio::spawn(async move {
                    match handle
                        .channel_open_forwarded_tcpip(
                            address,
                            forwarded_port,
                            peer.ip().to_string(),
                            u32::from(peer.port()),
                        )
                        .await
                    {
                        Ok(channel) => {
                            let mut channel_stream = channel.into_stream();
                            let _ = tokio::io::copy_bidirectional(
                                &mut stream,
                                &mut channel_stream,
                            )
                            .await;
                        }
                        Err(err) => {
                            tracing::warn!(error = ?err, "failed to open forwarded-tcpip channel");
                        }
                    }
                });
            }
        });

        self.remote_forwards
            .insert((address.to_string(), *port), task);
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if let Some(task) = self.remote_forwards.remove(&(address.to_string(), port)) {
            task.abort();
            tracing::debug!(address, port, "cancelled remote forward");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn streamlocal_forward(
        &mut self,
        socket_path: &str,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let listener = match UnixListener::bind(socket_path) {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(socket_path, error = %err, "streamlocal-forward bind failed");
                return Ok(false);
            }
        };
        tracing::debug!(socket_path, "started streamlocal forward");

        let handle = session.handle();
        let forwarded_path = socket_path.to_string();
        let task = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "streamlocal forward accept failed");
                        return;
                    }
                };
                let handle = handle.clone();
                let path = forwarded_path.clone();
                tokio::spawn(async move {
                    match handle.channel_open_forwarded_streamlocal(path).await {
                        Ok(channel) => {
                            let mut channel_stream = channel.into_stream();
                            let _ = tokio::io::copy_bidirectional(
                                &mut stream,
                                &mut channel_stream,
                            )
                            .await;
                        }
                        Err(err) => {
                            tracing::warn!(error = ?err, "failed to open forwarded-streamlocal channel");
                        }
                    }
                });
            }
        });

        self.streamlocal_forwards
            .insert(socket_path.to_string(), task);
        Ok(true)
    }

    async fn cancel_streamlocal_forward(
        &mut self,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if let Some(task) = self.streamlocal_forwards.remove(socket_path) {
            task.abort();
            let _ = std::fs::remove_file(socket_path);
            tracing::debug!(socket_path, "cancelled streamlocal forward");
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
