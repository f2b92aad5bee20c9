//! X11 forwarding.
//!
//! When a session requests X11 forwarding, the server allocates a local
//! display, listens on its TCP port, and relays every accepted connection
//! back to the client over an `x11` channel. The [`X11Network`] trait is the
//! listener factory; tests inject an in-memory implementation.

use std::io;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use russh::server::Handle;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::AbortHandle;

use crate::metrics::ServerMetrics;

/// X11 displays map to TCP port 6000 + display.
const X11_PORT_BASE: u32 = 6000;

/// How many displays past the offset are probed before giving up.
const MAX_DISPLAYS: u32 = 200;

/// A bidirectional byte stream from an X client.
pub trait X11Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> X11Stream for T {}

/// An accepted-connection source for one display.
pub trait X11Listener: Send {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<Box<dyn X11Stream>>>;
}

/// Networking used for X11 forwarding listeners.
pub trait X11Network: Send + Sync {
    /// Binds a listener for the given display number. Fails if the display
    /// is already taken.
    fn listen(&self, display: u32) -> BoxFuture<'_, io::Result<Box<dyn X11Listener>>>;
}

/// Standard-library-backed networking on the loopback interface.
pub struct OsX11Network;

struct OsX11Listener(TcpListener);

impl X11Listener for OsX11Listener {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<Box<dyn X11Stream>>> {
        Box::pin(async {
            let (stream, _) = self.0.accept().await?;
            Ok(Box::new(stream) as Box<dyn X11Stream>)
        })
    }
}

impl X11Network for OsX11Network {
    fn listen(&self, display: u32) -> BoxFuture<'_, io::Result<Box<dyn X11Listener>>> {
        Box::pin(async move {
            let addr = format!("127.0.0.1:{}", X11_PORT_BASE + display);
            let listener = TcpListener::bind(addr).await?;
            Ok(Box::new(OsX11Listener(listener)) as Box<dyn X11Listener>)
        })
    }
}

/// Hosts the X11 listeners for all sessions of the server.
pub(crate) struct X11Forwarder {
    display_offset: u32,
    network: Arc<dyn X11Network>,
    metrics: Arc<ServerMetrics>,
    relays: Mutex<Vec<AbortHandle>>,
}

impl X11Forwarder {
    pub(crate) fn new(
        display_offset: u32,
        network: Arc<dyn X11Network>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            display_offset,
            network,
            metrics,
            relays: Mutex::new(Vec::new()),
        }
    }

    /// Starts forwarding for one session: allocates a display, spawns the
    /// accept loop, and returns the display number for `$DISPLAY`.
    pub(crate) async fn start(&self, handle: Handle) -> Result<u32> {
        let (display, listener) = match self.allocate_display().await {
            Ok(allocated) => allocated,
            Err(err) => {
                self.metrics
                    .x11_handler_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Err(err);
            }
        };

        let task = tokio::spawn(accept_loop(listener, handle, self.metrics.clone()));
        self.relays.lock().unwrap().push(task.abort_handle());

        Ok(display)
    }

    async fn allocate_display(&self) -> Result<(u32, Box<dyn X11Listener>)> {
        let mut last_err = None;
        for display in self.display_offset..self.display_offset + MAX_DISPLAYS {
            match self.network.listen(display).await {
                Ok(listener) => return Ok((display, listener)),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow::anyhow!("no display range configured")))
        .context("allocate X11 display")
    }

    /// Stops every relay. Listeners and in-flight connections are dropped.
    pub(crate) fn close(&self) {
        let relays = std::mem::take(&mut *self.relays.lock().unwrap());
        for relay in relays {
            relay.abort();
        }
    }
}

async fn accept_loop(mut listener: Box<dyn X11Listener>, handle: Handle, metrics: Arc<ServerMetrics>) {
    loop {
        let mut stream = match listener.accept().await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(error = %err, "x11 listener closed");
                return;
            }
        };

        let channel = match handle.channel_open_x11("localhost", 0).await {
            Ok(channel) => channel,
            Err(err) => {
                tracing::warn!(error = ?err, "failed to open x11 channel");
                metrics
                    .x11_handler_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                continue;
            }
        };

        tokio::spawn(async move {
            let mut channel_stream = channel.into_stream();
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// In-memory network where a fixed set of displays is already taken.
    struct FakeNetwork {
        busy: HashSet<u32>,
    }

    struct IdleListener;

    impl X11Listener for IdleListener {
        fn accept(&mut self) -> BoxFuture<'_, io::Result<Box<dyn X11Stream>>> {
            Box::pin(futures::future::pending())
        }
    }

    impl X11Network for FakeNetwork {
        fn listen(&self, display: u32) -> BoxFuture<'_, io::Result<Box<dyn X11Listener>>> {
            let busy = self.busy.contains(&display);
            Box::pin(async move {
                if busy {
                    Err(io::Error::new(io::ErrorKind::AddrInUse, "display in use"))
                } else {
                    Ok(Box::new(IdleListener) as Box<dyn X11Listener>)
                }
            })
        }
    }

    #[tokio::test]
    async fn test_allocates_first_free_display() {
        let forwarder = X11Forwarder::new(
            10,
            Arc::new(FakeNetwork {
                busy: [10, 11].into_iter().collect(),
            }),
            Arc::new(ServerMetrics::new()),
        );
        let (display, _) = forwarder.allocate_display().await.unwrap();
        assert_eq!(display, 12);
    }

    #[tokio::test]
    async fn test_all_displays_busy() {
        let forwarder = X11Forwarder::new(
            10,
            Arc::new(FakeNetwork {
                busy: (10..10 + MAX_DISPLAYS).collect(),
            }),
            Arc::new(ServerMetrics::new()),
        );
        assert!(forwarder.allocate_display().await.is_err());
    }
}
