//! Rate-limited progress reporting
//!
//! A `Progress` receives raw `(count, total, message)` updates. `advance` may be
//! called thousands of times per second and only emits when the rate-limit
//! interval has elapsed since the last emission; `finish` always emits and
//! resets the limiter so the same instance can report the next operation.
//! What gets emitted is decided by an injected render function, where it goes
//! by the concrete type:
//! - `ConsoleProgress` draws in place on the terminal (indicatif)
//! - `ForwardProgress` hands rendered text to a sink (e.g. the network peer)
//! - `NoProgress` discards everything

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

/// Pure rendering of a progress update
pub type RenderFn = fn(u64, u64, &str) -> String;

pub trait Progress {
    fn advance(&mut self, count: u64, total: u64, message: &str);
    fn finish(&mut self, count: u64, total: u64, message: &str);
}

const KB: f64 = 1024.0;
const MB: f64 = KB * KB;
const GB: f64 = MB * KB;
const TB: f64 = GB * KB;

pub fn format_bytes(x: u64) -> String {
    let y = x as f64;
    if y > TB {
        format!("{:.2} TB", y / TB)
    } else if y > GB {
        format!("{:.2} GB", y / GB)
    } else if y > MB {
        format!("{:.2} MB", y / MB)
    } else if y > KB {
        format!("{:.2} KB", y / KB)
    } else {
        format!("{} B", x)
    }
}

fn percent(count: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        100.0 * count as f64 / total as f64
    }
}

/// `[42%] 1.50 MB sent`
pub fn render_bytes(count: u64, total: u64, message: &str) -> String {
    format!("[{:.0}%] {} {}", percent(count, total), format_bytes(count), message)
}

/// `[42%] 12/30 compressing: lib`
pub fn render_each(count: u64, total: u64, message: &str) -> String {
    format!("[{:.0}%] {}/{} {}", percent(count, total), count, total, message)
}

/// Message passthrough
pub fn render_message(_count: u64, _total: u64, message: &str) -> String {
    message.to_string()
}

/// Shared rate-limiting core
#[derive(Debug, Clone)]
pub struct RateLimiter {
    last_emit: Instant,
    interval: Duration,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit: Instant::now(),
            interval,
        }
    }

    /// True (and re-arms) when more than `interval` has passed since the last emission
    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }

    pub(crate) fn ready_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_emit) > self.interval {
            self.last_emit = now;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.last_emit = Instant::now();
    }
}

/// Forwards rendered progress text to a sink
pub struct ForwardProgress<F: FnMut(String)> {
    limiter: RateLimiter,
    render: RenderFn,
    sink: F,
}

impl<F: FnMut(String)> ForwardProgress<F> {
    pub fn new(interval: Duration, render: RenderFn, sink: F) -> Self {
        Self {
            limiter: RateLimiter::new(interval),
            render,
            sink,
        }
    }
}

impl<F: FnMut(String)> Progress for ForwardProgress<F> {
    fn advance(&mut self, count: u64, total: u64, message: &str) {
        if self.limiter.ready() {
            (self.sink)((self.render)(count, total, message));
        }
    }

    fn finish(&mut self, count: u64, total: u64, message: &str) {
        (self.sink)((self.render)(count, total, message));
        self.limiter.reset();
    }
}

/// In-place terminal progress line
pub struct ConsoleProgress {
    limiter: RateLimiter,
    render: RenderFn,
    line: ProgressBar,
}

impl ConsoleProgress {
    pub fn new(interval: Duration, render: RenderFn) -> Self {
        let line = ProgressBar::new_spinner();
        line.set_style(
            ProgressStyle::default_spinner()
                .template("{msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        Self {
            limiter: RateLimiter::new(interval),
            render,
            line,
        }
    }
}

impl Progress for ConsoleProgress {
    fn advance(&mut self, count: u64, total: u64, message: &str) {
        if self.limiter.ready() {
            self.line.set_message((self.render)(count, total, message));
        }
    }

    fn finish(&mut self, count: u64, total: u64, message: &str) {
        let text = (self.render)(count, total, message);
        self.line.set_message(String::new());
        self.line.suspend(|| println!("{}", text));
        self.limiter.reset();
    }
}

impl Drop for ConsoleProgress {
    fn drop(&mut self) {
        self.line.finish_and_clear();
    }
}

pub struct NoProgress;

impl Progress for NoProgress {
    fn advance(&mut self, _count: u64, _total: u64, _message: &str) {}
    fn finish(&mut self, _count: u64, _total: u64, _message: &str) {}
}

/// Console output when `show` is set, silence otherwise
pub fn console_or_silent(show: bool, render: RenderFn, interval: Duration) -> Box<dyn Progress + Send> {
    if show {
        Box::new(ConsoleProgress::new(interval, render))
    } else {
        Box::new(NoProgress)
    }
}
