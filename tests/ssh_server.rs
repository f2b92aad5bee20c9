//! End-to-end tests driving the server over a loopback listener with a real
//! SSH client.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use russh::client;
use russh::{ChannelMsg, Disconnect, Sig};
use tokio::net::TcpListener;

use workspace_sshd::{
    Banner, Config, MagicSessionType, Server, BLOCKED_FILE_TRANSFER_EXIT_CODE,
    BLOCKED_FILE_TRANSFER_MESSAGE,
};

/// Accepts any host key; the server's deterministic key is not meant to be
/// verified.
struct TestClientHandler;

impl client::Handler for TestClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct TestClient {
    handle: client::Handle<TestClientHandler>,
}

#[derive(Debug, Default)]
struct SessionResult {
    output: Vec<u8>,
    exit_status: Option<u32>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, addr, TestClientHandler)
            .await
            .context("connect")?;
        let auth = handle
            .authenticate_none("workspace")
            .await
            .context("authenticate")?;
        anyhow::ensure!(auth.success(), "authentication rejected");
        Ok(Self { handle })
    }

    /// Runs a command and collects output until the channel closes.
    async fn exec(&self, command: &str, env: &[(&str, &str)]) -> Result<SessionResult> {
        let channel = self.handle.channel_open_session().await?;
        for (key, value) in env {
            channel.set_env(false, *key, *value).await?;
        }
        channel.exec(true, command).await?;
        collect(channel).await
    }

    async fn disconnect(self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "bye", "en")
            .await?;
        Ok(())
    }
}

async fn collect(mut channel: russh::Channel<client::Msg>) -> Result<SessionResult> {
    let mut result = SessionResult::default();
    loop {
        let Some(msg) = tokio::time::timeout(Duration::from_secs(30), channel.wait())
            .await
            .context("timed out waiting for channel")?
        else {
            break;
        };
        match msg {
            ChannelMsg::Data { data } => result.output.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, .. } => result.output.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => result.exit_status = Some(exit_status),
            _ => {}
        }
    }
    Ok(result)
}

async fn start_server(config: Config) -> (Arc<Server>, SocketAddr) {
    let server = Arc::new(Server::new(config));
    server.update_host_signer(42).expect("host signer");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let serve = server.clone();
    tokio::spawn(async move {
        let _ = serve.serve(listener).await;
    });
    (server, addr)
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_exec_output_and_exit() {
    let (server, addr) = start_server(Config::default()).await;
    let client = TestClient::connect(addr).await.unwrap();

    let result = client.exec("echo hi", &[]).await.unwrap();
    assert_eq!(result.exit_status, Some(0));
    assert_eq!(String::from_utf8_lossy(&result.output), "hi\n");

    client.disconnect().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_exit_code_propagation() {
    let (server, addr) = start_server(Config::default()).await;
    let client = TestClient::connect(addr).await.unwrap();

    let result = client.exec("exit 7", &[]).await.unwrap();
    assert_eq!(result.exit_status, Some(7));

    client.disconnect().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_injected_environment() {
    let (server, addr) = start_server(Config::default()).await;
    let client = TestClient::connect(addr).await.unwrap();

    let result = client
        .exec("env", &[("CODER_SSH_SESSION_TYPE", "vscode"), ("FOO", "bar")])
        .await
        .unwrap();
    let output = String::from_utf8_lossy(&result.output);

    // The magic variable never reaches the executed command.
    assert!(!output.contains("CODER_SSH_SESSION_TYPE"));
    assert!(output.contains("FOO=bar"));
    assert!(output.contains("SSH_CLIENT=0.0.0.0 0 0"));
    assert!(output.contains("SSH_CONNECTION=0.0.0.0 0 0.0.0.0 0"));
    assert!(output.contains("USER="));
    assert!(output.contains("SHELL="));

    client.disconnect().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_vscode_connection_counted() {
    let (server, addr) = start_server(Config::default()).await;
    let client = TestClient::connect(addr).await.unwrap();

    assert_eq!(server.conn_stats().vscode, 0);

    let server_during = server.clone();
    let exec = tokio::spawn(async move {
        client
            .exec("sleep 2", &[("CODER_SSH_SESSION_TYPE", "vscode")])
            .await
    });
    wait_for("vscode session to be counted", || {
        server_during.conn_stats().vscode == 1
    })
    .await;

    exec.await.unwrap().unwrap();
    wait_for("vscode session to be released", || {
        server.conn_stats().vscode == 0
    })
    .await;

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_blocked_scp() {
    let config = Config {
        block_file_transfer: true,
        ..Config::default()
    };
    let (server, addr) = start_server(config).await;
    let client = TestClient::connect(addr).await.unwrap();

    let result = client.exec("/usr/bin/scp -t /tmp", &[]).await.unwrap();
    assert_eq!(result.exit_status, Some(BLOCKED_FILE_TRANSFER_EXIT_CODE));
    assert_eq!(
        result.output,
        format!("\x02{BLOCKED_FILE_TRANSFER_MESSAGE}\n").as_bytes()
    );

    client.disconnect().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_report_connection() {
    #[derive(Default)]
    struct Reports {
        connected: Vec<MagicSessionType>,
        disconnected: Vec<(i32, String)>,
    }
    let reports = Arc::new(Mutex::new(Reports::default()));
    let reports_hook = reports.clone();

    let config = Config {
        report_connection: Arc::new(move |_id, magic_type, _addr| {
            reports_hook.lock().unwrap().connected.push(magic_type);
            let reports = reports_hook.clone();
            Box::new(move |code, reason: &str| {
                reports
                    .lock()
                    .unwrap()
                    .disconnected
                    .push((code, reason.to_string()));
            })
        }),
        ..Config::default()
    };
    let (server, addr) = start_server(config).await;
    let client = TestClient::connect(addr).await.unwrap();

    let result = client.exec("true", &[]).await.unwrap();
    assert_eq!(result.exit_status, Some(0));

    wait_for("disconnect report", || {
        !reports.lock().unwrap().disconnected.is_empty()
    })
    .await;
    {
        let reports = reports.lock().unwrap();
        assert_eq!(reports.connected, vec![MagicSessionType::Ssh]);
        assert_eq!(reports.disconnected, vec![(0, String::new())]);
    }

    client.disconnect().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_non_pty_command_survives_disconnect() {
    let (server, addr) = start_server(Config::default()).await;
    let client = TestClient::connect(addr).await.unwrap();

    let pid_file = std::env::temp_dir().join(format!("detach-pid-{}", std::process::id()));
    let _ = std::fs::remove_file(&pid_file);

    let command = format!("echo $$ > {} && sleep 30", pid_file.display());
    let channel = client.handle.channel_open_session().await.unwrap();
    channel.exec(true, command.as_str()).await.unwrap();

    let pid_path = pid_file.clone();
    wait_for("child to report its pid", move || pid_path.exists()).await;
    let pid: i32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let pid = nix::unistd::Pid::from_raw(pid);

    // Disconnecting the client must not kill the command.
    drop(channel);
    client.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    nix::sys::signal::kill(pid, None).expect("child died on disconnect");

    // Closing the server delivers the group SIGHUP, and the close drains
    // within a bounded wait.
    tokio::time::timeout(Duration::from_secs(10), server.close())
        .await
        .expect("close did not finish in time")
        .unwrap();
    wait_for("child to terminate on close", move || {
        nix::sys::signal::kill(pid, None).is_err()
    })
    .await;

    let _ = std::fs::remove_file(&pid_file);
}

#[tokio::test]
async fn test_signal_forwarded_to_child() {
    let (server, addr) = start_server(Config::default()).await;
    let client = TestClient::connect(addr).await.unwrap();

    let channel = client.handle.channel_open_session().await.unwrap();
    channel
        .exec(
            true,
            "trap 'echo caught; exit 42' INT; echo ready; sleep 10 & wait $!",
        )
        .await
        .unwrap();

    // Wait for the trap to be installed before signaling.
    let mut channel = channel;
    let mut output = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), channel.wait())
            .await
            .expect("timed out waiting for ready")
        {
            Some(ChannelMsg::Data { data }) => {
                output.extend_from_slice(&data);
                if output.windows(6).any(|w| w == b"ready\n") {
                    break;
                }
            }
            Some(_) => {}
            None => panic!("channel closed before ready"),
        }
    }

    channel.signal(Sig::INT).await.unwrap();
    let result = collect(channel).await.unwrap();
    assert_eq!(result.exit_status, Some(42));
    assert!(String::from_utf8_lossy(&result.output).contains("caught"));

    client.disconnect().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_pty_session_has_terminal() {
    let config = Config {
        announcement_banners: Arc::new(|| {
            vec![Banner {
                enabled: true,
                message: "workspace maintenance tonight".to_string(),
            }]
        }),
        ..Config::default()
    };
    let (server, addr) = start_server(config).await;
    let client = TestClient::connect(addr).await.unwrap();

    let channel = client.handle.channel_open_session().await.unwrap();
    channel
        .request_pty(false, "xterm", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    channel.exec(true, "tty").await.unwrap();
    let result = collect(channel).await.unwrap();

    assert_eq!(result.exit_status, Some(0));
    let output = String::from_utf8_lossy(&result.output);
    assert!(output.contains("/dev/"), "not a terminal: {output}");
    // Banners only show on login shells, not exec commands.
    assert!(!output.contains("workspace maintenance"));

    client.disconnect().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_pty_login_shell_banner() {
    let config = Config {
        announcement_banners: Arc::new(|| {
            vec![Banner {
                enabled: true,
                message: "workspace maintenance tonight".to_string(),
            }]
        }),
        ..Config::default()
    };
    let (server, addr) = start_server(config).await;
    let client = TestClient::connect(addr).await.unwrap();

    let mut channel = client.handle.channel_open_session().await.unwrap();
    channel
        .request_pty(false, "xterm", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    channel.request_shell(true).await.unwrap();

    let mut output = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), channel.wait())
            .await
            .expect("timed out waiting for banner")
        {
            Some(ChannelMsg::Data { data }) => {
                output.extend_from_slice(&data);
                if String::from_utf8_lossy(&output).contains("workspace maintenance tonight") {
                    break;
                }
            }
            Some(_) => {}
            None => panic!("channel closed before banner"),
        }
    }

    channel.data(&b"exit\n"[..]).await.unwrap();
    let _ = collect(channel).await;

    client.disconnect().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_reentrant_and_server_reusable() {
    let (server, addr) = start_server(Config::default()).await;

    // Hold a session open with a SIGHUP-immune command so the first close
    // stays in flight long enough for the second caller to observe it.
    let client = TestClient::connect(addr).await.unwrap();
    let exec = {
        let client_channel = client.handle.channel_open_session().await.unwrap();
        client_channel
            .exec(true, "trap '' HUP; sleep 3")
            .await
            .unwrap();
        client_channel
    };

    let first = {
        let server = server.clone();
        tokio::spawn(async move { server.close().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = server.close().await;
    assert!(second.is_err(), "concurrent close must observe closed server");

    first.await.unwrap().unwrap();
    drop(exec);

    // After close completes, the server serves again.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve = server.clone();
    tokio::spawn(async move {
        let _ = serve.serve(listener).await;
    });

    let client = TestClient::connect(addr).await.unwrap();
    let result = client.exec("echo again", &[]).await.unwrap();
    assert_eq!(result.exit_status, Some(0));
    assert_eq!(String::from_utf8_lossy(&result.output), "again\n");

    client.disconnect().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_serve_requires_host_key() {
    let server = Server::new(Config::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let err = server.serve(listener).await.unwrap_err();
    assert!(err.to_string().contains("no host keys"));
}

#[tokio::test]
async fn test_unsupported_subsystem_rejected() {
    let (server, addr) = start_server(Config::default()).await;
    let client = TestClient::connect(addr).await.unwrap();

    let channel = client.handle.channel_open_session().await.unwrap();
    channel.request_subsystem(true, "nope").await.unwrap();
    let result = collect(channel).await.unwrap();
    assert_eq!(result.exit_status, Some(1));

    client.disconnect().await.unwrap();
    server.close().await.unwrap();
}
