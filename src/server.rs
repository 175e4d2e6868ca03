//! Deployment agent: per-connection state machine, destination fan-out and
//! the accept loop.
//!
//! Each connection runs as one task reading inbound frames, plus a writer task
//! that owns the write half and drains an outbound queue. Extraction runs on
//! the blocking pool and reports through the same queue, so progress reaches
//! the client while the archive is being unpacked.

use crate::archive;
use crate::error::{DeployError, Result};
use crate::journal::{DeployJournal, DeployJournalEntry, DeployStatus};
use crate::logger::Logger;
use crate::progress::{render_each, ForwardProgress, Progress};
use crate::protocol::ControlMessage;
use crate::transport::{self, Message, MessageWriter};
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Initial receive buffer capacity cap
const INITIAL_BUFFER_CAP: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub rate_limit: Duration,
    pub strict_size: bool,
    pub max_archive_bytes: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            rate_limit: Duration::from_millis(crate::protocol::timeouts::PROGRESS_TICK_MS),
            strict_size: false,
            max_archive_bytes: crate::config::DEFAULT_MAX_ARCHIVE_BYTES,
        }
    }
}

/// What the client declared in META
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    pub byte_size: u64,
    pub item_count: u64,
    pub destinations: Vec<String>,
}

/// Everything needed to fan out once DATA_DONE arrives
#[derive(Debug)]
pub struct ReceivedArchive {
    pub meta: SessionMeta,
    pub archive: Vec<u8>,
    /// Set when the accumulated length differs from the declared size
    pub size_mismatch: Option<DeployError>,
}

#[derive(Debug)]
pub enum Step {
    Continue,
    Deploy(ReceivedArchive),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    AwaitingMeta,
    AccumulatingData,
    Completed,
}

enum ServerState {
    AwaitingMeta,
    AccumulatingData { meta: SessionMeta, buffer: Vec<u8> },
    Completed,
}

/// Inbound side of one connection. Owns the receive buffer exclusively.
pub struct ServerSession {
    state: ServerState,
    max_archive_bytes: u64,
}

impl ServerSession {
    pub fn new(max_archive_bytes: u64) -> Self {
        Self {
            state: ServerState::AwaitingMeta,
            max_archive_bytes,
        }
    }

    pub fn phase(&self) -> ServerPhase {
        match self.state {
            ServerState::AwaitingMeta => ServerPhase::AwaitingMeta,
            ServerState::AccumulatingData { .. } => ServerPhase::AccumulatingData,
            ServerState::Completed => ServerPhase::Completed,
        }
    }

    pub fn buffered(&self) -> usize {
        match self.state {
            ServerState::AccumulatingData { ref buffer, .. } => buffer.len(),
            _ => 0,
        }
    }

    pub fn on_message(&mut self, message: Message) -> Result<Step> {
        match message {
            Message::Close => Ok(Step::Closed),
            Message::Binary(data) => self.on_data(data),
            Message::Text(text) => {
                let control = ControlMessage::parse(&text)?;
                self.on_control(control)
            }
        }
    }

    fn on_data(&mut self, data: Vec<u8>) -> Result<Step> {
        match self.state {
            ServerState::AccumulatingData { ref mut buffer, .. } => {
                if (buffer.len() + data.len()) as u64 > self.max_archive_bytes {
                    return Err(DeployError::protocol(format!(
                        "archive exceeds {} bytes",
                        self.max_archive_bytes
                    )));
                }
                buffer.extend_from_slice(&data);
                Ok(Step::Continue)
            }
            ServerState::AwaitingMeta => Err(DeployError::protocol("data frame before META")),
            ServerState::Completed => Err(DeployError::protocol("data frame after DATA_DONE")),
        }
    }

    fn on_control(&mut self, control: ControlMessage) -> Result<Step> {
        match control {
            ControlMessage::Meta {
                byte_size,
                item_count,
                destinations,
            } => {
                if !matches!(self.state, ServerState::AwaitingMeta) {
                    return Err(DeployError::protocol("duplicate META on one connection"));
                }
                if byte_size > self.max_archive_bytes {
                    return Err(DeployError::protocol(format!(
                        "declared size {} exceeds limit of {} bytes",
                        byte_size, self.max_archive_bytes
                    )));
                }
                self.state = ServerState::AccumulatingData {
                    meta: SessionMeta {
                        byte_size,
                        item_count,
                        destinations,
                    },
                    buffer: Vec::with_capacity(byte_size.min(INITIAL_BUFFER_CAP) as usize),
                };
                Ok(Step::Continue)
            }
            ControlMessage::DataDone => {
                match std::mem::replace(&mut self.state, ServerState::Completed) {
                    ServerState::AccumulatingData { meta, buffer } => {
                        let received = buffer.len() as u64;
                        let size_mismatch = (received != meta.byte_size).then(|| {
                            DeployError::SizeMismatch {
                                declared: meta.byte_size,
                                received,
                            }
                        });
                        Ok(Step::Deploy(ReceivedArchive {
                            meta,
                            archive: buffer,
                            size_mismatch,
                        }))
                    }
                    ServerState::AwaitingMeta => {
                        self.state = ServerState::AwaitingMeta;
                        Err(DeployError::protocol("DATA_DONE before META"))
                    }
                    ServerState::Completed => Err(DeployError::protocol("duplicate DATA_DONE")),
                }
            }
            other => Err(DeployError::protocol(format!(
                "unexpected {} from client",
                other.name()
            ))),
        }
    }
}

/// Result of extracting into one destination
#[derive(Debug)]
pub struct DestinationOutcome {
    pub destination: String,
    pub result: Result<u64>,
}

/// Extract `archive` into every destination in order. A failing destination
/// reports `ERROR` and the next one still runs; each success reports
/// `PROG DONE`.
pub fn fan_out(
    archive: &[u8],
    destinations: &[String],
    progress: &mut dyn Progress,
    notify: &mut dyn FnMut(ControlMessage),
) -> Vec<DestinationOutcome> {
    let mut outcomes = Vec::with_capacity(destinations.len());
    for destination in destinations {
        let result = extract_one(archive, destination, progress);
        match result {
            Ok(_) => notify(ControlMessage::ProgressDone(destination.clone())),
            Err(ref e) => notify(ControlMessage::Error(format!("{}: {}", destination, e))),
        }
        outcomes.push(DestinationOutcome {
            destination: destination.clone(),
            result,
        });
    }
    outcomes
}

fn extract_one(archive: &[u8], destination: &str, progress: &mut dyn Progress) -> Result<u64> {
    let path = Path::new(destination);
    if !path.is_absolute() {
        return Err(DeployError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "destination must be an absolute path"),
        ));
    }
    // Decoding consumes its reader, so each destination gets a fresh cursor
    archive::decode(Cursor::new(archive), path, progress)
}

enum Outbound {
    Control(ControlMessage),
    Close,
}

async fn write_loop(mut writer: MessageWriter, mut rx: mpsc::UnboundedReceiver<Outbound>) -> Result<()> {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Control(msg) => writer.send_control(&msg).await?,
            Outbound::Close => break,
        }
    }
    writer.close().await
}

struct ServerContext {
    options: ServerOptions,
    logger: Arc<dyn Logger>,
    journal: Option<DeployJournal>,
}

impl ServerContext {
    fn record(&self, entry: DeployJournalEntry) {
        if let Some(ref journal) = self.journal {
            if let Err(e) = journal.add_entry(&entry) {
                let context = format!("journal {}", journal.path().display());
                self.logger.error(&entry.session_id, &context, &e.to_string());
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) -> Result<()> {
    let started = Instant::now();
    let session_id = uuid::Uuid::new_v4().to_string();
    ctx.logger.connection(&session_id, &peer);

    let (mut reader, writer) = transport::split(stream);
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let writer_task = tokio::spawn(write_loop(writer, rx));
    let mut session = ServerSession::new(ctx.options.max_archive_bytes);

    let result = loop {
        let message = match reader.next().await {
            Ok(Some(m)) => m,
            Ok(None) => {
                if session.phase() == ServerPhase::AwaitingMeta {
                    break Ok(());
                }
                break Err(DeployError::ConnectionClosed);
            }
            Err(e) => break Err(e),
        };

        let was_awaiting_meta = session.phase() == ServerPhase::AwaitingMeta;
        match session.on_message(message) {
            Ok(Step::Continue) => {
                if was_awaiting_meta && session.phase() == ServerPhase::AccumulatingData {
                    if let ServerState::AccumulatingData { ref meta, .. } = session.state {
                        ctx.logger.meta(&session_id, meta.byte_size, meta.item_count, &meta.destinations);
                    }
                }
            }
            Ok(Step::Closed) => break Ok(()),
            Ok(Step::Deploy(received)) => {
                break deploy_received(received, &session_id, &peer, &ctx, &tx, started).await;
            }
            Err(e) => {
                let _ = tx.send(Outbound::Control(ControlMessage::Error(e.to_string())));
                if e.is_fatal_to_connection() {
                    break Err(e);
                }
                ctx.logger.error(&session_id, "message", &e.to_string());
            }
        }
    };

    if let Err(ref e) = result {
        ctx.logger.error(&session_id, "connection", &e.to_string());
    }
    let _ = tx.send(Outbound::Close);
    drop(tx);
    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => ctx.logger.error(&session_id, "write", &e.to_string()),
        Err(e) => ctx.logger.error(&session_id, "write", &e.to_string()),
    }
    result
}

async fn deploy_received(
    received: ReceivedArchive,
    session_id: &str,
    peer: &SocketAddr,
    ctx: &Arc<ServerContext>,
    tx: &mpsc::UnboundedSender<Outbound>,
    started: Instant,
) -> Result<()> {
    let ReceivedArchive {
        meta,
        archive,
        size_mismatch,
    } = received;
    let bytes = archive.len() as u64;
    let peer = peer.to_string();

    if let Some(err) = size_mismatch {
        let text = err.to_string();
        ctx.logger.error(session_id, "size", &text);
        ctx.record(
            DeployJournalEntry::new(session_id, &peer, "", DeployStatus::SizeMismatch)
                .with_counts(0, bytes)
                .with_error(text.clone()),
        );
        let _ = tx.send(Outbound::Control(ControlMessage::Error(text)));
        if ctx.options.strict_size {
            return Err(err);
        }
    }

    let destinations = meta.destinations.clone();
    let rate_limit = ctx.options.rate_limit;
    let progress_tx = tx.clone();
    let notify_tx = tx.clone();
    let outcomes = tokio::task::spawn_blocking(move || {
        let mut progress = ForwardProgress::new(rate_limit, render_each, move |text| {
            let _ = progress_tx.send(Outbound::Control(ControlMessage::Progress(text)));
        });
        let mut notify = move |msg: ControlMessage| {
            let _ = notify_tx.send(Outbound::Control(msg));
        };
        fan_out(&archive, &destinations, &mut progress, &mut notify)
    })
    .await
    .map_err(|e| {
        DeployError::io(
            "",
            std::io::Error::new(std::io::ErrorKind::Other, format!("extraction task failed: {}", e)),
        )
    })?;

    for outcome in &outcomes {
        match outcome.result {
            Ok(items) => {
                ctx.logger.extracted(session_id, &outcome.destination, items);
                ctx.record(
                    DeployJournalEntry::new(session_id, &peer, &outcome.destination, DeployStatus::Completed)
                        .with_counts(items, bytes),
                );
            }
            Err(ref e) => {
                ctx.logger.error(session_id, &outcome.destination, &e.to_string());
                ctx.record(
                    DeployJournalEntry::new(session_id, &peer, &outcome.destination, DeployStatus::Failed)
                        .with_counts(0, bytes)
                        .with_error(e.to_string()),
                );
            }
        }
    }

    let _ = tx.send(Outbound::Control(ControlMessage::Done));
    ctx.logger.done(session_id, bytes, outcomes.len(), started.elapsed().as_secs_f64());
    Ok(())
}

/// Accept connections until `shutdown` flips to true
async fn serve(listener: TcpListener, ctx: Arc<ServerContext>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        ctx.logger.error("-", "accept", &e.to_string());
                        continue;
                    }
                };
                // Spawn per-connection task; connections share nothing mutable
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, peer, ctx).await;
                });
            }
        }
    }
}

/// The agent as seen by a service host: bind, `start(logger)`, `stop()`
pub struct DeployServer {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    options: ServerOptions,
    journal: Option<DeployJournal>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<Result<()>>>,
}

impl DeployServer {
    pub async fn bind(addr: &str, options: ServerOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DeployError::connection(format!("bind {}", addr), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DeployError::connection(format!("bind {}", addr), e))?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener: Some(listener),
            local_addr,
            options,
            journal: None,
            shutdown,
            task: None,
        })
    }

    pub fn with_journal(mut self, journal: DeployJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting connections. Must be called from within a runtime.
    pub fn start(&mut self, logger: Arc<dyn Logger>) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| DeployError::protocol("server already started"))?;
        logger.listening(&self.local_addr);
        let ctx = Arc::new(ServerContext {
            options: self.options.clone(),
            logger,
            journal: self.journal.clone(),
        });
        let shutdown = self.shutdown.subscribe();
        self.task = Some(tokio::spawn(serve(listener, ctx, shutdown)));
        Ok(())
    }

    /// Stop accepting. Connections already in flight run to completion.
    pub async fn stop(&mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.wait().await
    }

    /// Wait for the accept loop to exit
    pub async fn wait(&mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task.await.map_err(|e| {
                DeployError::connection(
                    "accept loop",
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                )
            })?,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use std::fs;
    use tempfile::TempDir;

    fn meta_text(byte_size: u64, dests: &[&str]) -> Message {
        Message::Text(
            ControlMessage::Meta {
                byte_size,
                item_count: 1,
                destinations: dests.iter().map(|d| d.to_string()).collect(),
            }
            .to_string(),
        )
    }

    #[test]
    fn accumulates_until_data_done() {
        let mut session = ServerSession::new(1024);
        assert_eq!(session.phase(), ServerPhase::AwaitingMeta);
        assert!(matches!(session.on_message(meta_text(6, &["/a"])).unwrap(), Step::Continue));
        assert_eq!(session.phase(), ServerPhase::AccumulatingData);
        session.on_message(Message::Binary(vec![1, 2, 3])).unwrap();
        session.on_message(Message::Binary(vec![4, 5, 6])).unwrap();
        assert_eq!(session.buffered(), 6);

        match session.on_message(Message::Text("DATA_DONE".into())).unwrap() {
            Step::Deploy(received) => {
                assert_eq!(received.archive, vec![1, 2, 3, 4, 5, 6]);
                assert_eq!(received.meta.destinations, vec!["/a"]);
                assert!(received.size_mismatch.is_none());
            }
            other => panic!("unexpected step: {:?}", other),
        }
        assert_eq!(session.phase(), ServerPhase::Completed);
    }

    #[test]
    fn duplicate_meta_is_protocol_error() {
        let mut session = ServerSession::new(1024);
        session.on_message(meta_text(3, &["/a"])).unwrap();
        session.on_message(Message::Binary(vec![1])).unwrap();
        let err = session.on_message(meta_text(3, &["/b"])).unwrap_err();
        assert!(matches!(err, DeployError::Protocol(_)));
        // Buffered data is untouched by the rejected message
        assert_eq!(session.buffered(), 1);
    }

    #[test]
    fn data_before_meta_is_protocol_error() {
        let mut session = ServerSession::new(1024);
        assert!(matches!(
            session.on_message(Message::Binary(vec![1])),
            Err(DeployError::Protocol(_))
        ));
        assert!(matches!(
            session.on_message(Message::Text("DATA_DONE".into())),
            Err(DeployError::Protocol(_))
        ));
        assert_eq!(session.phase(), ServerPhase::AwaitingMeta);
    }

    #[test]
    fn size_mismatch_is_reported_not_blocking() {
        let mut session = ServerSession::new(1024);
        session.on_message(meta_text(10, &["/a"])).unwrap();
        session.on_message(Message::Binary(vec![0; 4])).unwrap();
        match session.on_message(Message::Text("DATA_DONE".into())).unwrap() {
            Step::Deploy(received) => assert!(matches!(
                received.size_mismatch,
                Some(DeployError::SizeMismatch { declared: 10, received: 4 })
            )),
            other => panic!("unexpected step: {:?}", other),
        }
    }

    #[test]
    fn enforces_archive_limit() {
        let mut session = ServerSession::new(8);
        assert!(session.on_message(meta_text(9, &["/a"])).is_err());

        let mut session = ServerSession::new(8);
        session.on_message(meta_text(4, &["/a"])).unwrap();
        session.on_message(Message::Binary(vec![0; 8])).unwrap();
        assert!(session.on_message(Message::Binary(vec![0; 1])).is_err());
    }

    #[test]
    fn rejects_server_side_messages_and_unknown_text() {
        let mut session = ServerSession::new(1024);
        assert!(matches!(
            session.on_message(Message::Text("DONE".into())),
            Err(DeployError::Protocol(_))
        ));
        let err = session.on_message(Message::Text("ST".into())).unwrap_err();
        assert!(err.to_string().contains("unknown command"));
        assert!(matches!(session.on_message(Message::Close).unwrap(), Step::Closed));
    }

    #[test]
    fn fan_out_isolates_failing_destination() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(src.path().join("b")).unwrap();
        fs::write(src.path().join("b").join("c.txt"), b"").unwrap();
        let encoded = archive::encode(src.path(), &mut NoProgress).unwrap();

        let dst = TempDir::new().unwrap();
        let first = dst.path().join("one");
        let blocked = dst.path().join("blocked");
        fs::write(&blocked, b"a file, not a directory").unwrap();
        let third = dst.path().join("three");
        let destinations: Vec<String> = [&first, &blocked, &third]
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();

        let mut sent = Vec::new();
        let outcomes = fan_out(&encoded.bytes, &destinations, &mut NoProgress, &mut |m: ControlMessage| sent.push(m));

        assert_eq!(outcomes.len(), 3);
        assert_eq!(*outcomes[0].result.as_ref().unwrap(), 3);
        assert!(matches!(outcomes[1].result, Err(DeployError::Io { .. })));
        assert_eq!(*outcomes[2].result.as_ref().unwrap(), 3);

        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], ControlMessage::ProgressDone(destinations[0].clone()));
        assert!(matches!(sent[1], ControlMessage::Error(ref t) if t.starts_with(&destinations[1])));
        assert_eq!(sent[2], ControlMessage::ProgressDone(destinations[2].clone()));

        assert_eq!(fs::read(third.join("a.txt")).unwrap(), b"hello");
        assert!(third.join("b").join("c.txt").is_file());
    }

    #[test]
    fn relative_destination_fails_alone() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        let encoded = archive::encode(src.path(), &mut NoProgress).unwrap();
        let dst = TempDir::new().unwrap();
        let good = dst.path().join("good").to_string_lossy().into_owned();

        let mut sent = Vec::new();
        let outcomes = fan_out(
            &encoded.bytes,
            &["relative/dir".to_string(), good.clone()],
            &mut NoProgress,
            &mut |m: ControlMessage| sent.push(m),
        );
        assert!(outcomes[0].result.is_err());
        assert!(outcomes[1].result.is_ok());
        assert_eq!(sent[1], ControlMessage::ProgressDone(good));
        assert!(!Path::new("relative/dir").exists());
    }
}
