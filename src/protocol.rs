//! Shared protocol constants and control messages for the deploy channel

use crate::error::{DeployError, Result};
use std::fmt;

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"RDPL";
pub const VERSION: u16 = 1;

// Maximum frame payload size (64MB) - prevents DoS via memory exhaustion
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Default size of each binary data frame sent by the client
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

pub const DEFAULT_PORT: u16 = 8081;

// Frame kinds: the channel's message-type tag
pub mod frame {
    pub const TEXT: u8 = 1;
    pub const BINARY: u8 = 2;
    pub const CLOSE: u8 = 3;
}

// Centralized timeout constants
pub mod timeouts {
    // Base timeout for writes (ms)
    pub const WRITE_BASE_MS: u64 = 10_000;

    // Base timeout for payload reads once a header has arrived (ms)
    pub const READ_BASE_MS: u64 = 10_000;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 1_000;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Default interval between forwarded progress updates (ms)
    pub const PROGRESS_TICK_MS: u64 = 200;

    // How long the client waits for the peer to acknowledge a close (ms)
    pub const CLOSE_GRACE_MS: u64 = 1_000;

    // Calculate write deadline based on payload size (ms)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        WRITE_BASE_MS + mb * PER_MB_MS
    }

    // Calculate read deadline based on payload size (ms)
    pub fn read_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        READ_BASE_MS + mb * PER_MB_MS
    }
}

const META_PREFIX: &str = "META|";
const DATA_DONE: &str = "DATA_DONE";
const DONE: &str = "DONE";
const PROGRESS_PREFIX: &str = "PROGRESS:";
const PROGRESS_DONE_PREFIX: &str = "PROG DONE:";
const ERROR_PREFIX: &str = "ERROR:";

/// Text control messages exchanged over the channel
///
/// `Meta` and `DataDone` travel client to server; everything else travels
/// server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Meta {
        byte_size: u64,
        item_count: u64,
        destinations: Vec<String>,
    },
    DataDone,
    Progress(String),
    ProgressDone(String),
    Done,
    Error(String),
}

impl ControlMessage {
    /// Parse a text frame payload
    pub fn parse(text: &str) -> Result<Self> {
        if let Some(rest) = text.strip_prefix(META_PREFIX) {
            return parse_meta(rest);
        }
        if text == DATA_DONE {
            return Ok(ControlMessage::DataDone);
        }
        if text == DONE {
            return Ok(ControlMessage::Done);
        }
        if let Some(rest) = strip_tag(text, PROGRESS_PREFIX) {
            return Ok(ControlMessage::Progress(rest.to_string()));
        }
        if let Some(rest) = strip_tag(text, PROGRESS_DONE_PREFIX) {
            return Ok(ControlMessage::ProgressDone(rest.to_string()));
        }
        if let Some(rest) = strip_tag(text, ERROR_PREFIX) {
            return Ok(ControlMessage::Error(rest.to_string()));
        }
        Err(DeployError::protocol(format!(
            "unknown command: {}",
            truncate_for_log(text)
        )))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Meta { .. } => "META",
            ControlMessage::DataDone => "DATA_DONE",
            ControlMessage::Progress(_) => "PROGRESS",
            ControlMessage::ProgressDone(_) => "PROG DONE",
            ControlMessage::Done => "DONE",
            ControlMessage::Error(_) => "ERROR",
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Meta {
                byte_size,
                item_count,
                destinations,
            } => write!(
                f,
                "{}{}|{}|{}",
                META_PREFIX,
                byte_size,
                item_count,
                destinations.join(",")
            ),
            ControlMessage::DataDone => f.write_str(DATA_DONE),
            ControlMessage::Progress(text) => write!(f, "{} {}", PROGRESS_PREFIX, text),
            ControlMessage::ProgressDone(text) => write!(f, "{} {}", PROGRESS_DONE_PREFIX, text),
            ControlMessage::Done => f.write_str(DONE),
            ControlMessage::Error(text) => write!(f, "{} {}", ERROR_PREFIX, text),
        }
    }
}

fn strip_tag<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(tag)?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

fn parse_meta(rest: &str) -> Result<ControlMessage> {
    let mut fields = rest.splitn(3, '|');
    let byte_size = fields
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| DeployError::protocol("META: bad byte size"))?;
    let item_count = fields
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| DeployError::protocol("META: bad item count"))?;
    let destinations: Vec<String> = fields
        .next()
        .unwrap_or("")
        .split(',')
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect();
    if destinations.is_empty() {
        return Err(DeployError::protocol(
            "META: at least one destination is required",
        ));
    }
    Ok(ControlMessage::Meta {
        byte_size,
        item_count,
        destinations,
    })
}

fn truncate_for_log(text: &str) -> &str {
    match text.char_indices().nth(64) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_wire_format() {
        let msg = ControlMessage::Meta {
            byte_size: 1234,
            item_count: 3,
            destinations: vec!["/srv/a".into(), "/srv/b".into()],
        };
        assert_eq!(msg.to_string(), "META|1234|3|/srv/a,/srv/b");
        assert_eq!(ControlMessage::parse("META|1234|3|/srv/a,/srv/b").unwrap(), msg);
    }

    #[test]
    fn server_messages_wire_format() {
        assert_eq!(
            ControlMessage::Progress("[50%] 1/2 /srv/a".into()).to_string(),
            "PROGRESS: [50%] 1/2 /srv/a"
        );
        assert_eq!(
            ControlMessage::ProgressDone("/srv/a".into()).to_string(),
            "PROG DONE: /srv/a"
        );
        assert_eq!(ControlMessage::Done.to_string(), "DONE");
        assert_eq!(
            ControlMessage::Error("invalid data size".into()).to_string(),
            "ERROR: invalid data size"
        );
        assert_eq!(ControlMessage::DataDone.to_string(), "DATA_DONE");
    }

    #[test]
    fn parses_server_messages() {
        assert_eq!(
            ControlMessage::parse("PROG DONE: C:\\deploy\\app").unwrap(),
            ControlMessage::ProgressDone("C:\\deploy\\app".into())
        );
        assert_eq!(
            ControlMessage::parse("ERROR: inavlid data size").unwrap(),
            ControlMessage::Error("inavlid data size".into())
        );
        assert_eq!(ControlMessage::parse("DONE").unwrap(), ControlMessage::Done);
        assert_eq!(
            ControlMessage::parse("PROGRESS:tight").unwrap(),
            ControlMessage::Progress("tight".into())
        );
    }

    #[test]
    fn meta_destination_may_contain_pipe() {
        let parsed = ControlMessage::parse("META|10|1|/odd|name").unwrap();
        assert_eq!(
            parsed,
            ControlMessage::Meta {
                byte_size: 10,
                item_count: 1,
                destinations: vec!["/odd|name".into()],
            }
        );
    }

    #[test]
    fn rejects_malformed_meta() {
        assert!(matches!(
            ControlMessage::parse("META|abc|1|/a"),
            Err(DeployError::Protocol(_))
        ));
        assert!(matches!(
            ControlMessage::parse("META|10|x|/a"),
            Err(DeployError::Protocol(_))
        ));
        assert!(matches!(
            ControlMessage::parse("META|10|1|"),
            Err(DeployError::Protocol(_))
        ));
        assert!(matches!(
            ControlMessage::parse("META|10"),
            Err(DeployError::Protocol(_))
        ));
    }

    #[test]
    fn rejects_unknown_commands() {
        let err = ControlMessage::parse("HELLO").unwrap_err();
        assert!(err.to_string().contains("unknown command"));
        // Tags are case sensitive
        assert!(ControlMessage::parse("done").is_err());
    }

    #[test]
    fn deadlines_scale_with_payload() {
        assert_eq!(timeouts::write_deadline_ms(0), timeouts::WRITE_BASE_MS);
        assert_eq!(
            timeouts::write_deadline_ms(1),
            timeouts::WRITE_BASE_MS + timeouts::PER_MB_MS
        );
        assert_eq!(
            timeouts::read_deadline_ms(3 * 1_048_576),
            timeouts::READ_BASE_MS + 3 * timeouts::PER_MB_MS
        );
    }
}
