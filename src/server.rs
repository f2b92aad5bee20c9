//! Server lifecycle and resource tracking.
//!
//! The server tracks every listener, connection, session, and child process
//! it owns so that [`Server::close`] is deterministic: stop accepting, close
//! sessions and connections, SIGHUP surviving process groups, then wait for
//! every handler task to drain. While a close is in flight no new resource is
//! admitted; once it completes the server can be served again.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::PrivateKey;
use russh::server::Handle;
use russh::{ChannelId, MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use crate::config::Config;
use crate::handler::ConnectionHandler;
use crate::metrics::{MetricsSnapshot, ServerMetrics};
use crate::x11::X11Forwarder;

/// Keep-alives replace the absolute timeout at or above this threshold.
const KEEPALIVE_THRESHOLD: Duration = Duration::from_secs(3);
const KEEPALIVE_PROBES: usize = 3;

/// Snapshot of the per-client-type connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnStats {
    pub sessions: i64,
    pub vscode: i64,
    pub jetbrains: i64,
}

/// State shared between the server, connection handlers, and session tasks.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) metrics: Arc<ServerMetrics>,
    pub(crate) tracker: Tracker,
    pub(crate) x11: X11Forwarder,
    pub(crate) conn_count_vscode: AtomicI64,
    pub(crate) conn_count_jetbrains: AtomicI64,
    pub(crate) conn_count_ssh: AtomicI64,
}

/// The in-workspace SSH server.
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let metrics = Arc::new(ServerMetrics::new());
        let x11 = X11Forwarder::new(
            config.x11_display_offset,
            config.x11_network.clone(),
            metrics.clone(),
        );
        Self {
            shared: Arc::new(Shared {
                config,
                metrics,
                tracker: Tracker::new(),
                x11,
                conn_count_vscode: AtomicI64::new(0),
                conn_count_jetbrains: AtomicI64::new(0),
                conn_count_ssh: AtomicI64::new(0),
            }),
        }
    }

    pub fn conn_stats(&self) -> ConnStats {
        ConnStats {
            sessions: self.shared.conn_count_ssh.load(Ordering::Relaxed),
            vscode: self.shared.conn_count_vscode.load(Ordering::Relaxed),
            jetbrains: self.shared.conn_count_jetbrains.load(Ordering::Relaxed),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Installs a host key deterministically derived from `seed`, replacing
    /// any existing key of the same algorithm.
    ///
    /// Clients are expected to ignore host key verification: the overlay
    /// network in front of this server authenticates, so the host key adds
    /// no security and determinism keeps reconnects quiet.
    pub fn update_host_signer(&self, seed: u64) -> Result<()> {
        let key = deterministic_host_key(seed)?;
        let mut state = self.shared.tracker.state.lock().unwrap();
        state
            .host_keys
            .retain(|existing| existing.algorithm() != key.algorithm());
        state.host_keys.push(key);
        Ok(())
    }

    /// Accepts connections on `listener` until the server is closed or
    /// accepting fails; accept errors are returned verbatim.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        {
            let state = self.shared.tracker.state.lock().unwrap();
            if state.host_keys.is_empty() {
                bail!("no host keys set");
            }
        }

        let local_addr = listener.local_addr().ok();
        let (listener_id, stop) = self.shared.tracker.register_listener().await;
        let _guard = ListenerGuard {
            shared: self.shared.clone(),
            id: listener_id,
        };
        tracing::info!(listen_addr = ?local_addr, "started serving listener");

        let result = loop {
            tokio::select! {
                _ = stop.notified() => break Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tokio::spawn(handle_conn(
                                self.shared.clone(),
                                listener_id,
                                stream,
                                peer,
                            ));
                        }
                        Err(err) => break Err(err.into()),
                    }
                }
            }
        };
        tracing::info!(listen_addr = ?local_addr, "stopped serving listener");
        result
    }

    /// Closes the server and all active connections.
    ///
    /// Re-entrant: a concurrent caller blocks until the in-flight close
    /// completes and then observes "server is closed". Afterwards the server
    /// can be served again.
    pub async fn close(&self) -> Result<()> {
        close_inner(&self.shared).await
    }

    /// Stops the server, giving up after `timeout`. The underlying close
    /// keeps running even when the timeout fires first.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let shared = self.shared.clone();
        let close = tokio::spawn(async move { close_inner(&shared).await });
        match tokio::time::timeout(timeout, close).await {
            Ok(joined) => joined.context("close task")?.context("close server"),
            Err(_) => bail!("shutdown deadline exceeded"),
        }
    }

}

impl Shared {
    /// Snapshot of the transport configuration for one connection. Built per
    /// connection so host-key updates apply to the next handshake.
    pub(crate) fn transport_config(&self) -> Arc<russh::server::Config> {
        let keys = self.tracker.state.lock().unwrap().host_keys.clone();
        let mut config = russh::server::Config {
            methods: MethodSet::from(&[MethodKind::None][..]),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys,
            ..Default::default()
        };
        match self.config.max_timeout {
            Some(timeout) if timeout >= KEEPALIVE_THRESHOLD => {
                config.keepalive_interval = Some(timeout / KEEPALIVE_PROBES as u32);
                config.keepalive_max = KEEPALIVE_PROBES;
            }
            Some(timeout) if !timeout.is_zero() => {
                config.inactivity_timeout = Some(timeout);
            }
            _ => {}
        }
        Arc::new(config)
    }
}

async fn handle_conn(shared: Arc<Shared>, listener_id: u64, stream: TcpStream, peer: SocketAddr) {
    let Some((conn_id, stop)) = shared.tracker.register_conn(listener_id) else {
        tracing::info!(remote_addr = %peer, "received connection after server closed");
        return;
    };
    let _guard = ConnGuard {
        shared: shared.clone(),
        id: conn_id,
    };
    tracing::info!(remote_addr = %peer, "started serving ssh connection");

    let config = shared.transport_config();
    let handler = ConnectionHandler::new(shared.clone(), peer);
    match russh::server::run_stream(config, stream, handler).await {
        Ok(session) => {
            tokio::select! {
                result = session => {
                    if let Err(err) = result {
                        tracing::warn!(remote_addr = %peer, error = %err, "ssh connection ended with error");
                    }
                }
                // Dropping the running session tears the connection down.
                _ = stop.notified() => {
                    tracing::debug!(remote_addr = %peer, "connection closed by server");
                }
            }
        }
        Err(err) => {
            tracing::warn!(remote_addr = %peer, error = %err, "ssh connection failed");
            shared
                .metrics
                .failed_connections_total
                .fetch_add(1, Ordering::Relaxed);
        }
    }
    tracing::info!(remote_addr = %peer, "ssh connection complete");
}

async fn close_inner(shared: &Arc<Shared>) -> Result<()> {
    let outcome = {
        let mut state = shared.tracker.state.lock().unwrap();
        if let Some(closing) = &state.closing {
            Err(closing.subscribe())
        } else {
            let (tx, _) = watch::channel(());
            state.closing = Some(tx);
            Ok((
                state.listeners.values().cloned().collect::<Vec<_>>(),
                state.sessions.values().cloned().collect::<Vec<_>>(),
                state.conns.values().map(|c| c.stop.clone()).collect::<Vec<_>>(),
                state.processes.iter().copied().collect::<Vec<_>>(),
            ))
        }
    };
    let (listeners, sessions, conns, processes) = match outcome {
        Err(mut rx) => {
            // Wait for the in-flight close to finish.
            let _ = rx.changed().await;
            bail!("server is closed");
        }
        Ok(tuple) => tuple,
    };

    tracing::debug!(count = listeners.len(), "closing all active listeners");
    for stop in listeners {
        stop.notify_one();
    }

    // Close the channel rather than sending an exit status: reporting an
    // exit here would overwrite the real process status, and OpenSSH
    // clients already map the bare close to 255.
    tracing::debug!(count = sessions.len(), "closing all active sessions");
    for session in sessions {
        let _ = session.handle.close(session.channel).await;
    }

    tracing::debug!(count = conns.len(), "closing all active connections");
    for stop in conns {
        stop.notify_one();
    }

    for pid in processes {
        let pid = Pid::from_raw(pid);
        if nix::sys::signal::killpg(pid, Signal::SIGHUP).is_err() {
            let _ = nix::sys::signal::kill(pid, Signal::SIGHUP);
        }
    }

    tracing::debug!("closing X11 forwarding");
    shared.x11.close();

    tracing::debug!("waiting for all handlers to exit");
    shared.tracker.wait_group.wait().await;

    {
        let mut state = shared.tracker.state.lock().unwrap();
        // Dropping the sender wakes everyone blocked on the close.
        state.closing = None;
    }
    tracing::debug!("closing server done");

    Ok(())
}

/// Deterministic RSA-2048 host key derived from a 64-bit seed.
fn deterministic_host_key(seed: u64) -> Result<PrivateKey> {
    use rand_chacha::rand_core::SeedableRng;

    let mut rng = rand_chacha::ChaCha20Rng::seed_from_u64(seed);
    let keypair = RsaKeypair::random(&mut rng, 2048).context("generate host key")?;
    PrivateKey::new(KeypairData::Rsa(keypair), "workspace-sshd").context("encode host key")
}

/// A session registered with the tracker; closing the channel (not exiting
/// it) is how server close tears the session down.
#[derive(Clone)]
pub(crate) struct SessionEntry {
    pub(crate) handle: Handle,
    pub(crate) channel: ChannelId,
}

struct ConnEntry {
    #[allow(dead_code)]
    listener: u64,
    stop: Arc<Notify>,
}

#[derive(Default)]
struct TrackState {
    next_id: u64,
    listeners: HashMap<u64, Arc<Notify>>,
    conns: HashMap<u64, ConnEntry>,
    sessions: HashMap<Uuid, SessionEntry>,
    processes: HashSet<i32>,
    host_keys: Vec<PrivateKey>,
    closing: Option<watch::Sender<()>>,
}

impl TrackState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Registers and deregisters the resources the server owns. Admission fails
/// while a close is in flight; every admission increments the wait group the
/// close drains. The lock is only ever held for map mutation, never across
/// I/O or the drain.
pub(crate) struct Tracker {
    state: Mutex<TrackState>,
    wait_group: WaitGroup,
}

impl Tracker {
    fn new() -> Self {
        Self {
            state: Mutex::new(TrackState::default()),
            wait_group: WaitGroup::default(),
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.state.lock().unwrap().closing.is_some()
    }

    /// Registers a listener. Unlike the other registrations this waits for an
    /// in-flight close to finish, because serving again after a close is
    /// supported.
    pub(crate) async fn register_listener(&self) -> (u64, Arc<Notify>) {
        loop {
            let mut rx = {
                let mut state = self.state.lock().unwrap();
                match &state.closing {
                    Some(closing) => closing.subscribe(),
                    None => {
                        let id = state.alloc_id();
                        let stop = Arc::new(Notify::new());
                        state.listeners.insert(id, stop.clone());
                        self.wait_group.add();
                        return (id, stop);
                    }
                }
            };
            let _ = rx.changed().await;
        }
    }

    pub(crate) fn unregister_listener(&self, id: u64) {
        if self.state.lock().unwrap().listeners.remove(&id).is_some() {
            self.wait_group.done();
        }
    }

    /// Registers a connection, verifying its parent listener is still
    /// tracked. A `None` means the caller must drop the connection.
    pub(crate) fn register_conn(&self, listener_id: u64) -> Option<(u64, Arc<Notify>)> {
        let mut state = self.state.lock().unwrap();
        if state.closing.is_some() || !state.listeners.contains_key(&listener_id) {
            return None;
        }
        let id = state.alloc_id();
        let stop = Arc::new(Notify::new());
        state.conns.insert(
            id,
            ConnEntry {
                listener: listener_id,
                stop: stop.clone(),
            },
        );
        self.wait_group.add();
        Some((id, stop))
    }

    pub(crate) fn unregister_conn(&self, id: u64) {
        if self.state.lock().unwrap().conns.remove(&id).is_some() {
            self.wait_group.done();
        }
    }

    pub(crate) fn register_session(&self, id: Uuid, entry: SessionEntry) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closing.is_some() {
            return false;
        }
        state.sessions.insert(id, entry);
        self.wait_group.add();
        true
    }

    pub(crate) fn unregister_session(&self, id: Uuid) {
        if self.state.lock().unwrap().sessions.remove(&id).is_some() {
            self.wait_group.done();
        }
    }

    pub(crate) fn register_process(&self, pid: i32) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closing.is_some() {
            return false;
        }
        state.processes.insert(pid);
        self.wait_group.add();
        true
    }

    pub(crate) fn unregister_process(&self, pid: i32) {
        if self.state.lock().unwrap().processes.remove(&pid) {
            self.wait_group.done();
        }
    }
}

struct ListenerGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.shared.tracker.unregister_listener(self.id);
    }
}

struct ConnGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.shared.tracker.unregister_conn(self.id);
    }
}

/// Deregisters a session when its dispatcher task ends, however it ends.
pub(crate) struct SessionGuard {
    shared: Arc<Shared>,
    id: Uuid,
}

impl SessionGuard {
    pub(crate) fn register(shared: &Arc<Shared>, id: Uuid, entry: SessionEntry) -> Option<Self> {
        if !shared.tracker.register_session(id, entry) {
            return None;
        }
        Some(Self {
            shared: shared.clone(),
            id,
        })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.shared.tracker.unregister_session(self.id);
    }
}

/// Keeps a child process tracked for shutdown-time termination until its
/// runner finishes with it.
pub(crate) struct ProcessGuard {
    shared: Arc<Shared>,
    pid: Pid,
}

impl ProcessGuard {
    pub(crate) fn register(shared: &Arc<Shared>, pid: Pid) -> Option<Self> {
        if !shared.tracker.register_process(pid.as_raw()) {
            return None;
        }
        Some(Self {
            shared: shared.clone(),
            pid,
        })
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.shared.tracker.unregister_process(self.pid.as_raw());
    }
}

/// Counts outstanding handler tasks so close can drain them.
#[derive(Default)]
struct WaitGroup {
    count: AtomicUsize,
    drained: Notify,
}

impl WaitGroup {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.drained.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> Tracker {
        Tracker::new()
    }

    #[tokio::test]
    async fn test_conn_requires_tracked_listener() {
        let tracker = tracker();
        assert!(tracker.register_conn(99).is_none());

        let (listener_id, _stop) = tracker.register_listener().await;
        let (conn_id, _) = tracker.register_conn(listener_id).unwrap();

        tracker.unregister_conn(conn_id);
        tracker.unregister_listener(listener_id);
        tracker.wait_group.wait().await;
    }

    #[tokio::test]
    async fn test_closing_blocks_admission() {
        let tracker = tracker();
        let (listener_id, _stop) = tracker.register_listener().await;

        let (tx, _) = watch::channel(());
        tracker.state.lock().unwrap().closing = Some(tx);

        assert!(tracker.register_conn(listener_id).is_none());
        assert!(!tracker.register_process(1234));
        assert!(tracker.is_closing());
    }

    #[tokio::test]
    async fn test_wait_group_drains() {
        let wg = WaitGroup::default();
        wg.add();
        wg.add();

        let waited = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let waited2 = waited.clone();

        wg.done();
        let wait = async {
            wg.wait().await;
            waited2.store(true, Ordering::SeqCst);
        };
        let release = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(!waited.load(Ordering::SeqCst));
            wg.done();
        };
        tokio::join!(wait, release);
        assert!(waited.load(Ordering::SeqCst));
    }

    #[test]
    fn test_deterministic_host_key() {
        let a = deterministic_host_key(7).unwrap();
        let b = deterministic_host_key(7).unwrap();
        assert_eq!(a.public_key(), b.public_key());

        let c = deterministic_host_key(8).unwrap();
        assert_ne!(a.public_key(), c.public_key());
    }
}
