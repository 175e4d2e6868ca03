use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{DeployError, Result};

/// Server event sink handed to the agent when it starts
pub trait Logger: Send + Sync {
    fn listening(&self, _addr: &SocketAddr) {}
    fn connection(&self, _session: &str, _peer: &SocketAddr) {}
    fn meta(&self, _session: &str, _byte_size: u64, _item_count: u64, _destinations: &[String]) {}
    fn extracted(&self, _session: &str, _dst: &str, _items: u64) {}
    fn error(&self, _session: &str, _context: &str, _msg: &str) {}
    fn done(&self, _session: &str, _bytes: u64, _destinations: usize, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

/// Timestamped text lines to a file or stderr
pub struct TextLogger {
    out: Mutex<Box<dyn Write + Send>>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| DeployError::io(path, e))?;
        Ok(Self {
            out: Mutex::new(Box::new(f)),
        })
    }

    pub fn stderr() -> Self {
        Self {
            out: Mutex::new(Box::new(std::io::stderr())),
        }
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.out.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn listening(&self, addr: &SocketAddr) {
        self.line(&format!("LISTEN addr={}", addr));
    }
    fn connection(&self, session: &str, peer: &SocketAddr) {
        self.line(&format!("CONNECT session={} peer={}", session, peer));
    }
    fn meta(&self, session: &str, byte_size: u64, item_count: u64, destinations: &[String]) {
        self.line(&format!(
            "META session={} bytes={} items={} dst={}",
            session,
            byte_size,
            item_count,
            destinations.join(",")
        ));
    }
    fn extracted(&self, session: &str, dst: &str, items: u64) {
        self.line(&format!("EXTRACT session={} dst={} items={}", session, dst, items));
    }
    fn error(&self, session: &str, context: &str, msg: &str) {
        self.line(&format!("ERROR session={} ctx={} msg={}", session, context, msg));
    }
    fn done(&self, session: &str, bytes: u64, destinations: usize, seconds: f64) {
        self.line(&format!(
            "DONE session={session} bytes={bytes} destinations={destinations} seconds={seconds:.3}"
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_logger_appends_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs").join("agent.log");
        let logger = TextLogger::new(&path).unwrap();
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        logger.connection("s1", &peer);
        logger.meta("s1", 10, 3, &["/a".to_string(), "/b".to_string()]);
        logger.error("s1", "extract", "boom");
        drop(logger);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("CONNECT session=s1 peer=127.0.0.1:5000"));
        assert!(lines[1].ends_with("META session=s1 bytes=10 items=3 dst=/a,/b"));
        assert!(lines[2].ends_with("ERROR session=s1 ctx=extract msg=boom"));
        assert!(lines[0].starts_with('['));
    }
}
