//! The accept loop (spec §6): one task per connection, newline-delimited
//! JSON in both directions. Framing and dispatch are platform-independent;
//! only the transport (a named pipe on Windows, a Unix domain socket
//! elsewhere) is conditionally compiled.

use std::sync::Arc;
use std::time::Duration;

use pha_engine::PolicyEngine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::CallerIdentity;
use crate::dispatch::dispatch_line;

/// Bounds how many queued outbound lines (progress frames + the terminal
/// response) a connection buffers before backpressure hits the engine-side
/// sender; 64 comfortably covers the longest `Apply` progress stream
/// without unbounded growth if a client stops reading.
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Spec §5: "the IPC read is bounded by a 1 MiB per-message ceiling".
const MAX_MESSAGE_BYTES: usize = 1_048_576;

/// Spec §5: "Connection idle beyond a small bound (~30 s without bytes) may
/// be reaped."
const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Lower bound applied to a caller-supplied listener pool size -- a pool of
/// zero would mean the transport never accepts a connection.
const MIN_LISTENER_POOL_SIZE: usize = 1;

#[cfg(windows)]
pub mod transport {
    use super::*;
    use std::io;
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
    use tokio::task::JoinSet;

    pub fn pipe_name() -> String {
        format!(r"\\.\pipe\{}", pha_protocol::IPC_ENDPOINT_NAME)
    }

    /// Runs `pool_size` concurrently-accepting pipe instances (spec §5:
    /// "a small fixed pool (default 4) of listener instances") until
    /// `shutdown` fires. Each slot owns one pipe instance at a time: once a
    /// client connects, the slot hands the connection off to
    /// [`super::handle_connection`] and immediately creates a fresh
    /// instance so the slot can accept its next client while the first is
    /// still being served.
    pub async fn serve(
        engine: Arc<PolicyEngine>,
        pipe_name: &str,
        shutdown: CancellationToken,
        pool_size: usize,
    ) -> io::Result<()> {
        let pool_size = pool_size.max(MIN_LISTENER_POOL_SIZE);

        // Only the very first instance overall needs `first_pipe_instance`
        // (it fails creation if a pipe by this name already exists) --
        // every other slot, and every replacement instance a slot creates
        // after a client connects, is an ordinary additional instance of
        // the same named pipe.
        let mut first_instance = Some(ServerOptions::new().first_pipe_instance(true).create(pipe_name)?);

        let mut slots = JoinSet::new();
        for _ in 0..pool_size {
            let pipe_name = pipe_name.to_string();
            let engine = engine.clone();
            let shutdown = shutdown.clone();
            let initial = first_instance.take();
            slots.spawn(run_pipe_slot(engine, pipe_name, shutdown, initial));
        }

        tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            Some(result) = slots.join_next() => {
                match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(io::Error::other(format!("listener pool slot panicked: {e}"))),
                }
            }
        }
    }

    /// One listener pool slot: owns a single pipe instance, accepts one
    /// client, re-arms with a fresh instance, and repeats until `shutdown`.
    async fn run_pipe_slot(
        engine: Arc<PolicyEngine>,
        pipe_name: String,
        shutdown: CancellationToken,
        initial: Option<NamedPipeServer>,
    ) -> io::Result<()> {
        let mut server = match initial {
            Some(server) => server,
            None => ServerOptions::new().create(&pipe_name)?,
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                result = server.connect() => {
                    result?;
                    let connected = server;
                    server = ServerOptions::new().create(&pipe_name)?;

                    let identity = match super::auth::platform::identify(&connected) {
                        Ok(identity) => identity,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to identify named pipe caller; dropping connection");
                            continue;
                        }
                    };

                    let engine = engine.clone();
                    let conn_cancel = shutdown.child_token();
                    tokio::spawn(async move {
                        super::handle_named_pipe_connection(engine, connected, identity, conn_cancel).await;
                    });
                }
            }
        }
    }
}

#[cfg(not(windows))]
pub mod transport {
    use super::*;
    use std::io;
    use std::path::Path;
    use tokio::net::UnixListener;
    use tokio::task::JoinSet;

    /// Binds the socket, removing any stale socket file left behind by a
    /// previous, uncleanly-terminated run (mirrors the cleanup the legacy
    /// Unix-socket IPC server performed), then runs `pool_size`
    /// concurrently-accepting tasks against it (spec §5: "a small fixed
    /// pool (default 4) of listener instances") until `shutdown` fires.
    /// A single `UnixListener` accepts fine from multiple tasks at once --
    /// the kernel wakes one acceptor per incoming connection -- so the
    /// pool is `pool_size` tasks sharing one bound listener rather than
    /// `pool_size` separate sockets, the Unix analogue of the Windows
    /// named-pipe instance pool above.
    pub async fn serve(
        engine: Arc<PolicyEngine>,
        socket_path: &Path,
        shutdown: CancellationToken,
        pool_size: usize,
    ) -> io::Result<()> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = Arc::new(UnixListener::bind(socket_path)?);
        let pool_size = pool_size.max(MIN_LISTENER_POOL_SIZE);

        let mut slots = JoinSet::new();
        for _ in 0..pool_size {
            let listener = listener.clone();
            let engine = engine.clone();
            let shutdown = shutdown.clone();
            slots.spawn(run_accept_slot(listener, engine, shutdown));
        }

        tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            Some(result) = slots.join_next() => {
                match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(io::Error::other(format!("listener pool slot panicked: {e}"))),
                }
            }
        }
    }

    async fn run_accept_slot(
        listener: Arc<UnixListener>,
        engine: Arc<PolicyEngine>,
        shutdown: CancellationToken,
    ) -> io::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted?;
                    let identity = match super::auth::platform::identify(&stream) {
                        Ok(identity) => identity,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to identify socket peer; dropping connection");
                            continue;
                        }
                    };

                    let engine = engine.clone();
                    let conn_cancel = shutdown.child_token();
                    tokio::spawn(async move {
                        super::handle_unix_connection(engine, stream, identity, conn_cancel).await;
                    });
                }
            }
        }
    }
}

use crate::auth;

#[cfg(windows)]
async fn handle_named_pipe_connection(
    engine: Arc<PolicyEngine>,
    pipe: tokio::net::windows::named_pipe::NamedPipeServer,
    identity: CallerIdentity,
    cancel: CancellationToken,
) {
    let (reader, writer) = tokio::io::split(pipe);
    handle_connection(engine, reader, writer, identity, cancel, CONNECTION_IDLE_TIMEOUT).await;
}

#[cfg(not(windows))]
async fn handle_unix_connection(
    engine: Arc<PolicyEngine>,
    stream: tokio::net::UnixStream,
    identity: CallerIdentity,
    cancel: CancellationToken,
) {
    let (reader, writer) = stream.into_split();
    handle_connection(engine, reader, writer, identity, cancel, CONNECTION_IDLE_TIMEOUT).await;
}

/// Reads one newline-terminated message from `reader`, closing the
/// connection (an error return) rather than buffering past `max_bytes`
/// (spec §5: the 1 MiB per-message ceiling). Lossy UTF-8 conversion matches
/// `AsyncBufReadExt::lines()`'s own behavior for malformed input -- the
/// JSON parse a line away will reject it either way.
async fn read_line_bounded<R>(reader: &mut BufReader<R>, max_bytes: usize) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if buf.is_empty() {
                None
            } else {
                Some(String::from_utf8_lossy(&buf).into_owned())
            });
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                buf.extend_from_slice(&available[..=pos]);
                reader.consume(pos + 1);
                if buf.len() > max_bytes {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("message of {} bytes exceeded the {max_bytes}-byte ceiling", buf.len()),
                    ));
                }
                return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
            }
            None => {
                let consumed = available.len();
                buf.extend_from_slice(available);
                reader.consume(consumed);
                if buf.len() > max_bytes {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("message exceeded the {max_bytes}-byte ceiling before a line terminator"),
                    ));
                }
            }
        }
    }
}

/// Drives one connection: reads newline-delimited command lines, dispatches
/// each to the engine, and writes back every outbound line (progress frames
/// then the terminal response) as it's produced. A read error, EOF, an
/// oversized message, or ~30 s without bytes (spec §5) all end the
/// connection; in-flight work keeps running against its own
/// `cancel.child_token()` so a dropped client doesn't leak a dangling
/// `Apply`, it just stops getting progress updates.
async fn handle_connection<R, W>(
    engine: Arc<PolicyEngine>,
    reader: R,
    mut writer: W,
    identity: CallerIdentity,
    cancel: CancellationToken,
    idle_timeout: Duration,
) where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);

    loop {
        let read_result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(idle_timeout, read_line_bounded(&mut reader, MAX_MESSAGE_BYTES)) => result,
        };

        let line = match read_result {
            Err(_elapsed) => {
                tracing::info!(timeout = ?idle_timeout, "connection idle too long; closing");
                break;
            }
            Ok(Ok(Some(line))) if !line.trim().is_empty() => line,
            Ok(Ok(Some(_))) => continue,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "connection read error");
                break;
            }
        };

        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_CHANNEL_CAPACITY);
        let command_cancel = cancel.child_token();
        let engine_clone = engine.clone();
        let identity_clone = identity.clone();
        let dispatch_task = tokio::spawn(async move {
            dispatch_line(&engine_clone, &identity_clone, &line, &command_cancel, &out_tx).await;
        });

        while let Some(out_line) = out_rx.recv().await {
            if let Err(e) = writer.write_all(out_line.as_bytes()).await {
                tracing::warn!(error = %e, "failed writing response");
                cancel.cancel();
                break;
            }
            let _ = writer.write_all(b"\n").await;
            if let Err(e) = writer.flush().await {
                tracing::warn!(error = %e, "failed flushing response");
                cancel.cancel();
                break;
            }
        }

        if let Err(e) = dispatch_task.await {
            tracing::warn!(error = %e, "dispatch task panicked");
        }

        if cancel.is_cancelled() {
            break;
        }
    }
}

#[cfg(all(test, not(windows)))]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use pha_catalog::Catalog;
    use pha_engine::{PolicyEngine, SystemProbe};
    use pha_executors::ExecutorError;
    use pha_executors::ExecutorRegistry;
    use pha_protocol::envelope::{CommandEnvelope, CommandType, ResponseEnvelope};
    use pha_protocol::commands::{AuditParams, AuditResult};
    use pha_protocol::sysinfo::SystemInfo;
    use pha_restore::RestorePointManager;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    const SCRIPT_POLICY: &str = r#"
policy_id = "tel-001"
version = "1.0.0"
name = "Disable diagnostic telemetry"
description = "Sets telemetry reporting to the minimum level"
category = "telemetry"
tags = ["privacy"]
risk_level = "low"
support_status = "supported"

[mechanism]
mechanism = "script"
apply_command = "true"
revert_command = "true"
probe_command = "true"

[applicability]
min_build = 10240
supported_skus = ["Professional"]

[reversibility]
reversible = true
how = "re-run with the previous telemetry level"
"#;

    struct TestProbe;

    impl SystemProbe for TestProbe {
        fn probe(&self) -> Result<SystemInfo, ExecutorError> {
            Ok(SystemInfo {
                build_number: 22621,
                version_string: "10.0.22621".to_string(),
                sku_name: "Professional".to_string(),
                domain_joined: false,
                mdm_managed: false,
                tamper_protection_enabled: true,
            })
        }
    }

    fn test_engine(dir: &std::path::Path) -> Arc<PolicyEngine> {
        std::fs::write(dir.join("tel-001.toml"), SCRIPT_POLICY).unwrap();
        let catalog = Arc::new(Catalog::load(dir.to_path_buf()).unwrap());
        let executors = Arc::new(ExecutorRegistry::with_default_executors());
        let store = Arc::new(pha_store::Store::open_in_memory().unwrap());
        let restore = Arc::new(RestorePointManager::new());
        let probe: Arc<dyn SystemProbe> = Arc::new(TestProbe);
        Arc::new(PolicyEngine::new(catalog, executors, store, restore, probe))
    }

    #[tokio::test]
    async fn unix_socket_round_trips_an_audit_command() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let socket_path = dir.path().join("phagentd.sock");
        let cancel = CancellationToken::new();

        let serve_cancel = cancel.clone();
        let serve_engine = engine.clone();
        let serve_path = socket_path.clone();
        let serve_handle = tokio::spawn(async move {
            transport::serve(serve_engine, &serve_path, serve_cancel, 2).await.ok();
        });

        // Give the accept loop a moment to bind before connecting.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        let command = CommandEnvelope::new(CommandType::Audit, AuditParams { policy_ids: None });
        let mut line = serde_json::to_string(&command).unwrap();
        line.push('\n');
        client.write_all(line.as_bytes()).await.unwrap();

        let mut reader = BufReader::new(&mut client);
        let mut response_line = String::new();
        reader.read_line(&mut response_line).await.unwrap();

        let response: ResponseEnvelope<AuditResult> = serde_json::from_str(&response_line).unwrap();
        assert!(response.success);
        assert_eq!(response.command_id, command.command_id);
        let result = response.result.unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].policy_id, "tel-001");

        cancel.cancel();
        let _ = serve_handle.await;
    }

    #[tokio::test]
    async fn listener_pool_serves_concurrent_clients() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let socket_path = dir.path().join("phagentd.sock");
        let cancel = CancellationToken::new();

        let serve_cancel = cancel.clone();
        let serve_engine = engine.clone();
        let serve_path = socket_path.clone();
        let serve_handle = tokio::spawn(async move {
            transport::serve(serve_engine, &serve_path, serve_cancel, 4).await.ok();
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let command = CommandEnvelope::new(CommandType::Audit, AuditParams { policy_ids: None });
        let mut line = serde_json::to_string(&command).unwrap();
        line.push('\n');

        let audit_once = || {
            let socket_path = socket_path.clone();
            let line = line.clone();
            async move {
                let mut client = UnixStream::connect(&socket_path).await.unwrap();
                client.write_all(line.as_bytes()).await.unwrap();
                let mut reader = BufReader::new(&mut client);
                let mut response_line = String::new();
                reader.read_line(&mut response_line).await.unwrap();
                let response: ResponseEnvelope<AuditResult> = serde_json::from_str(&response_line).unwrap();
                assert!(response.success);
            }
        };

        // Three clients connecting at once exercise more than one pool slot
        // without relying on any single slot serializing them.
        tokio::join!(audit_once(), audit_once(), audit_once());

        cancel.cancel();
        let _ = serve_handle.await;
    }

    #[tokio::test]
    async fn unauthorized_caller_is_rejected_for_apply() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let (out_tx, mut out_rx) = mpsc::channel::<String>(4);
        let identity = CallerIdentity {
            integrity_rid: 0x1000,
            is_admin: false,
            is_code_signed: false,
            process_id: 1,
            description: String::new(),
        };
        let cancel = CancellationToken::new();

        let command = CommandEnvelope::new(
            CommandType::Apply,
            pha_protocol::commands::ApplyParams {
                policy_ids: vec!["tel-001".to_string()],
                dry_run: true,
                create_restore_point: false,
                continue_on_error: false,
            },
        );
        let line = serde_json::to_string(&command).unwrap();

        dispatch_line(&engine, &identity, &line, &cancel, &out_tx).await;
        drop(out_tx);

        let response_line = out_rx.recv().await.unwrap();
        let response: ResponseEnvelope<()> = serde_json::from_str(&response_line).unwrap();
        assert!(!response.success);
        assert_eq!(response.errors[0].code, "Unauthorized");
    }

    #[tokio::test]
    async fn read_line_bounded_returns_a_line_under_the_limit() {
        let mut reader = BufReader::new(std::io::Cursor::new(b"hello world\n".to_vec()));
        let line = read_line_bounded(&mut reader, MAX_MESSAGE_BYTES).await.unwrap();
        assert_eq!(line.as_deref(), Some("hello world\n"));
    }

    #[tokio::test]
    async fn read_line_bounded_returns_none_at_eof_with_no_data() {
        let mut reader = BufReader::new(std::io::Cursor::new(Vec::<u8>::new()));
        let line = read_line_bounded(&mut reader, MAX_MESSAGE_BYTES).await.unwrap();
        assert!(line.is_none());
    }

    #[tokio::test]
    async fn read_line_bounded_rejects_a_message_over_the_ceiling() {
        let mut oversized = vec![b'a'; 64];
        oversized.push(b'\n');
        let mut reader = BufReader::new(std::io::Cursor::new(oversized));
        let err = read_line_bounded(&mut reader, 16).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn read_line_bounded_rejects_an_unterminated_oversized_stream() {
        let oversized = vec![b'a'; 64];
        let mut reader = BufReader::new(std::io::Cursor::new(oversized));
        let err = read_line_bounded(&mut reader, 16).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn idle_connection_is_closed_after_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let identity = CallerIdentity {
            integrity_rid: 0x3000,
            is_admin: true,
            is_code_signed: true,
            process_id: 1,
            description: String::new(),
        };
        let cancel = CancellationToken::new();

        let (client, server) = tokio::io::duplex(1024);
        let (server_reader, server_writer) = tokio::io::split(server);
        let handle = tokio::spawn(handle_connection(
            engine,
            server_reader,
            server_writer,
            identity,
            cancel,
            Duration::from_millis(20),
        ));

        // Hold the client end open (no EOF) and send nothing; the server
        // side should close on its own once idle past the (test-shortened)
        // timeout, rather than waiting for EOF or cancellation.
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("connection task should finish once idle-reaped")
            .unwrap();
        drop(client);
    }
}
