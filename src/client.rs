//! Client deploy orchestrator
//!
//! One deployment runs strictly in sequence: archive the source tree, connect,
//! send `META`, stream the archive as binary frames, send `DATA_DONE`, then wait
//! for the agent's `DONE`. A receive loop runs as its own task from the moment
//! the connection is up, so `PROGRESS`/`ERROR` lines are shown while data is
//! still being sent.

use crate::archive::{self, EncodedArchive};
use crate::cli::ClientOpts;
use crate::error::{DeployError, Result};
use crate::fs_enum::validate_source_dir;
use crate::progress::{console_or_silent, format_bytes, render_bytes, render_each};
use crate::protocol::timeouts::CLOSE_GRACE_MS;
use crate::protocol::{ControlMessage, MAX_FRAME_SIZE};
use crate::transport::{self, Message, MessageReader, MessageWriter};
use crate::url::{parse_server_addr, ServerAddr};
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Everything one deployment needs, built once from the command line
#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub server: ServerAddr,
    pub source: PathBuf,
    pub destinations: Vec<String>,
    pub chunk_size: usize,
    pub rate_limit: Duration,
    pub show_progress: bool,
}

fn invalid(what: &str, msg: &str) -> DeployError {
    DeployError::io(what, io::Error::new(io::ErrorKind::InvalidInput, msg.to_string()))
}

impl DeployConfig {
    pub fn from_opts(opts: &ClientOpts) -> Result<Self> {
        let server =
            parse_server_addr(&opts.addr).ok_or_else(|| invalid(&opts.addr, "invalid server address"))?;
        let config = DeployConfig {
            server,
            source: opts.src.clone(),
            destinations: dedupe(&opts.destinations),
            chunk_size: opts.chunk_size,
            rate_limit: Duration::from_millis(opts.rate_limit_ms),
            show_progress: !opts.quiet,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_source_dir(&self.source)?;
        if self.destinations.is_empty() {
            return Err(invalid("--dst", "at least one destination is required"));
        }
        for d in &self.destinations {
            if d.is_empty() {
                return Err(invalid("--dst", "destination must not be empty"));
            }
            if d.contains(',') {
                return Err(invalid(d, "destination must not contain ','"));
            }
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_FRAME_SIZE {
            return Err(invalid(
                "--chunk-size",
                &format!("must be between 1 and {}", MAX_FRAME_SIZE),
            ));
        }
        Ok(())
    }
}

fn dedupe(destinations: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(destinations.len());
    for d in destinations {
        if !out.contains(d) {
            out.push(d.clone());
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Archiving,
    AwaitingConnection,
    SendingMeta,
    SendingData,
    AwaitingServerCompletion,
    Closed,
}

/// Client-side view of one transfer
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub total_byte_size: u64,
    pub item_count: u64,
    pub destinations: Vec<String>,
    pub bytes_sent: u64,
}

impl TransferSession {
    pub fn new(archive: &EncodedArchive, destinations: &[String]) -> Self {
        Self {
            total_byte_size: archive.bytes.len() as u64,
            item_count: archive.item_count,
            destinations: destinations.to_vec(),
            bytes_sent: 0,
        }
    }

    pub fn meta(&self) -> ControlMessage {
        ControlMessage::Meta {
            byte_size: self.total_byte_size,
            item_count: self.item_count,
            destinations: self.destinations.clone(),
        }
    }

    pub fn record_sent(&mut self, n: usize) {
        self.bytes_sent += n as u64;
    }
}

/// Outcome of a deployment that reached `DONE`
#[derive(Debug, Clone)]
pub struct DeployReport {
    pub byte_size: u64,
    pub item_count: u64,
    pub completed: Vec<String>,
    pub errors: Vec<String>,
    pub elapsed: Duration,
}

impl DeployReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// What the receive loop saw before it stopped
#[derive(Debug, Default)]
pub struct ReceiveSummary {
    pub completed: Vec<String>,
    pub errors: Vec<String>,
    pub done: bool,
    pub failure: Option<DeployError>,
}

/// Read server messages until `DONE`, a close, or a read failure.
/// `ERROR` lines are printed and recorded; reading continues so that later
/// destinations still report.
pub async fn receive_loop<R: AsyncRead + Unpin>(mut reader: MessageReader<R>, show: bool) -> ReceiveSummary {
    let mut summary = ReceiveSummary::default();
    loop {
        let text = match reader.next().await {
            Ok(Some(Message::Text(t))) => t,
            Ok(Some(Message::Binary(_))) => {
                summary.failure = Some(DeployError::protocol("unexpected data frame from server"));
                return summary;
            }
            Ok(Some(Message::Close)) | Ok(None) => return summary,
            Err(e) => {
                summary.failure = Some(e);
                return summary;
            }
        };
        match ControlMessage::parse(&text) {
            Ok(ControlMessage::Progress(p)) => {
                if show {
                    println!("{}", p);
                }
            }
            Ok(ControlMessage::ProgressDone(dst)) => {
                if show {
                    println!("deployed: {}", dst);
                }
                summary.completed.push(dst);
            }
            Ok(ControlMessage::Error(e)) => {
                eprintln!("ERROR: {}", e);
                summary.errors.push(e);
            }
            Ok(ControlMessage::Done) => {
                summary.done = true;
                return summary;
            }
            Ok(other) => {
                summary.failure = Some(DeployError::protocol(format!(
                    "unexpected {} from server",
                    other.name()
                )));
                return summary;
            }
            Err(e) => {
                summary.failure = Some(e);
                return summary;
            }
        }
    }
}

async fn interrupted(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nobody can interrupt any more
            std::future::pending::<()>().await;
        }
    }
}

pub struct Deployer {
    config: DeployConfig,
    state: ClientState,
}

impl Deployer {
    pub fn new(config: DeployConfig) -> Self {
        Self {
            config,
            state: ClientState::Idle,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub async fn run(&mut self, mut interrupt: watch::Receiver<bool>) -> Result<DeployReport> {
        let started = Instant::now();
        let show = self.config.show_progress;
        let rate_limit = self.config.rate_limit;

        self.state = ClientState::Archiving;
        let source = self.config.source.clone();
        let flag = interrupt.clone();
        let encode = tokio::task::spawn_blocking(move || {
            let mut progress = console_or_silent(show, render_each, rate_limit);
            archive::encode_cancellable(&source, &mut *progress, &|| *flag.borrow())
        });
        let encoded = tokio::select! {
            joined = encode => joined.map_err(|e| {
                DeployError::io(&self.config.source, io::Error::new(io::ErrorKind::Other, e.to_string()))
            })??,
            _ = interrupted(&mut interrupt) => {
                self.state = ClientState::Closed;
                return Err(DeployError::Interrupted);
            }
        };
        if show {
            println!("archive size: {}", format_bytes(encoded.bytes.len() as u64));
        }
        let mut session = TransferSession::new(&encoded, &self.config.destinations);

        self.state = ClientState::AwaitingConnection;
        let (reader, mut writer) = transport::connect(&self.config.server.to_string()).await?;
        let mut receiver = tokio::spawn(receive_loop(reader, show));

        self.state = ClientState::SendingMeta;
        if let Err(e) = writer.send_control(&session.meta()).await {
            return Err(self.fail(writer, receiver, e).await);
        }

        self.state = ClientState::SendingData;
        let mut progress = console_or_silent(show, render_bytes, rate_limit);
        for chunk in encoded.bytes.chunks(self.config.chunk_size) {
            if *interrupt.borrow() {
                return Err(self.abort(writer, receiver).await);
            }
            if let Err(e) = writer.send_binary(chunk).await {
                return Err(self.fail(writer, receiver, e).await);
            }
            session.record_sent(chunk.len());
            progress.advance(session.bytes_sent, session.total_byte_size, "sent");
        }
        progress.finish(session.bytes_sent, session.total_byte_size, "sent");
        drop(progress);
        if let Err(e) = writer.send_control(&ControlMessage::DataDone).await {
            return Err(self.fail(writer, receiver, e).await);
        }

        self.state = ClientState::AwaitingServerCompletion;
        let summary = tokio::select! {
            joined = &mut receiver => joined.map_err(|e| {
                DeployError::connection("receive loop", io::Error::new(io::ErrorKind::Other, e.to_string()))
            })?,
            _ = interrupted(&mut interrupt) => {
                return Err(self.abort(writer, receiver).await);
            }
        };
        let _ = writer.close().await;
        self.state = ClientState::Closed;

        if !summary.done {
            return Err(unfinished(summary));
        }
        Ok(DeployReport {
            byte_size: session.total_byte_size,
            item_count: session.item_count,
            completed: summary.completed,
            errors: summary.errors,
            elapsed: started.elapsed(),
        })
    }

    /// Close our side and give the receive loop a short grace period
    async fn shutdown(&mut self, mut writer: MessageWriter, mut receiver: JoinHandle<ReceiveSummary>) -> Option<ReceiveSummary> {
        let _ = writer.close().await;
        self.state = ClientState::Closed;
        match timeout(Duration::from_millis(CLOSE_GRACE_MS), &mut receiver).await {
            Ok(Ok(summary)) => Some(summary),
            Ok(Err(_)) => None,
            Err(_) => {
                receiver.abort();
                None
            }
        }
    }

    async fn abort(&mut self, writer: MessageWriter, receiver: JoinHandle<ReceiveSummary>) -> DeployError {
        self.shutdown(writer, receiver).await;
        DeployError::Interrupted
    }

    /// A send failed; prefer what the server said over our own write error
    async fn fail(&mut self, writer: MessageWriter, receiver: JoinHandle<ReceiveSummary>, err: DeployError) -> DeployError {
        match self.shutdown(writer, receiver).await {
            Some(summary) if !summary.errors.is_empty() => DeployError::Remote(summary.errors.join("; ")),
            _ => err,
        }
    }
}

fn unfinished(summary: ReceiveSummary) -> DeployError {
    if !summary.errors.is_empty() {
        return DeployError::Remote(summary.errors.join("; "));
    }
    summary.failure.unwrap_or(DeployError::ConnectionClosed)
}

/// Run one deployment to completion
pub async fn deploy(config: DeployConfig, interrupt: watch::Receiver<bool>) -> Result<DeployReport> {
    Deployer::new(config).run(interrupt).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::fs;
    use tempfile::TempDir;

    fn opts(src: &std::path::Path, extra: &[&str]) -> ClientOpts {
        let mut args = vec!["rdeploy", "--addr", "127.0.0.1:9", "--src", src.to_str().unwrap()];
        args.extend_from_slice(extra);
        ClientOpts::parse_from(args)
    }

    #[test]
    fn config_from_opts_dedupes_in_order() {
        let src = TempDir::new().unwrap();
        let config = DeployConfig::from_opts(&opts(
            src.path(),
            &["--dst", "/srv/b", "--dst", "/srv/a", "--dst", "/srv/b"],
        ))
        .unwrap();
        assert_eq!(config.destinations, vec!["/srv/b", "/srv/a"]);
        assert_eq!(config.server.port, 9);
        assert_eq!(config.chunk_size, 4096);
        assert!(config.show_progress);
    }

    #[test]
    fn config_rejects_bad_input() {
        let src = TempDir::new().unwrap();
        let comma = DeployConfig::from_opts(&opts(src.path(), &["--dst", "/srv/a,/srv/b"]));
        assert!(comma.unwrap_err().to_string().contains("','"));

        let chunk = DeployConfig::from_opts(&opts(src.path(), &["--dst", "/srv/a", "--chunk-size", "0"]));
        assert!(chunk.is_err());

        let missing = src.path().join("nope");
        let err = DeployConfig::from_opts(&opts(&missing, &["--dst", "/srv/a"])).unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        let file = src.path().join("file.txt");
        fs::write(&file, b"x").unwrap();
        let err = DeployConfig::from_opts(&opts(&file, &["--dst", "/srv/a"])).unwrap_err();
        assert!(err.to_string().contains("is not a directory"));
    }

    #[test]
    fn transfer_session_tracks_bytes() {
        let encoded = EncodedArchive {
            bytes: vec![0; 10_000],
            item_count: 3,
        };
        let mut session = TransferSession::new(&encoded, &["/srv/a".to_string()]);
        assert_eq!(session.meta().to_string(), "META|10000|3|/srv/a");
        session.record_sent(4096);
        session.record_sent(4096);
        assert_eq!(session.bytes_sent, 8192);
    }

    #[tokio::test]
    async fn receive_loop_keeps_listening_after_error() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut server = MessageWriter::new(a);
        let reader = MessageReader::new(b);

        server.send_control(&ControlMessage::Progress("[50%] 1/2 lib".into())).await.unwrap();
        server.send_control(&ControlMessage::Error("/srv/b: denied".into())).await.unwrap();
        server.send_control(&ControlMessage::ProgressDone("/srv/a".into())).await.unwrap();
        server.send_control(&ControlMessage::Done).await.unwrap();

        let summary = receive_loop(reader, false).await;
        assert!(summary.done);
        assert_eq!(summary.completed, vec!["/srv/a"]);
        assert_eq!(summary.errors, vec!["/srv/b: denied"]);
        assert!(summary.failure.is_none());
    }

    #[tokio::test]
    async fn receive_loop_close_without_done() {
        let (a, b) = tokio::io::duplex(1024);
        let mut server = MessageWriter::new(a);
        server.send_control(&ControlMessage::Error("protocol error: duplicate META".into())).await.unwrap();
        server.close().await.unwrap();

        let summary = receive_loop(MessageReader::new(b), false).await;
        assert!(!summary.done);
        assert!(matches!(unfinished(summary), DeployError::Remote(ref t) if t.contains("duplicate META")));
    }

    #[tokio::test]
    async fn connect_failure_is_connection_error() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        // Bind then drop to get a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let config = DeployConfig {
            server: ServerAddr {
                host: "127.0.0.1".into(),
                port,
            },
            source: src.path().to_path_buf(),
            destinations: vec!["/srv/a".into()],
            chunk_size: 4096,
            rate_limit: Duration::from_millis(200),
            show_progress: false,
        };
        let (_tx, rx) = watch::channel(false);
        let mut deployer = Deployer::new(config);
        assert_eq!(deployer.state(), ClientState::Idle);
        let err = deployer.run(rx).await.unwrap_err();
        assert!(matches!(err, DeployError::Connection { .. }));
        assert_eq!(deployer.state(), ClientState::AwaitingConnection);
    }
}
