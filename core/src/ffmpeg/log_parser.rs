//! Line-at-a-time parser over ffmpeg's merged stdout/stderr, grounded in
//! `lumberjack/apps/ffmpeg/log_parser.py::LogParser`. Runs as a background
//! task reading from the transcoder's child process and broadcasting
//! [`Event`]s on an [`EventBus`].

use std::sync::{Arc, Mutex};

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::trace;

use crate::events::{Event, EventBus};

/// Parses one `Duration: HH:MM:SS` or `time=HH:MM:SS` token into seconds.
fn parse_timestamp(pattern: &Regex, line: &str) -> Option<u64> {
    let caps = pattern.captures(line)?;
    let hms = caps.get(1)?.as_str();
    let mut parts = hms.split(':');
    let h: u64 = parts.next()?.parse().ok()?;
    let m: u64 = parts.next()?.parse().ok()?;
    let s: u64 = parts.next()?.parse().ok()?;
    Some(h * 3600 + m * 60 + s)
}

/// Running state the parser accumulates across lines: the source's total
/// duration (parsed once) and the most recent `time=` position.
struct ParseState {
    duration_pattern: Regex,
    time_pattern: Regex,
    output_pattern: Regex,
    duration_seconds: u64,
    time_seconds: u64,
}

impl ParseState {
    fn new() -> Self {
        Self {
            duration_pattern: Regex::new(r"Duration:\s*(\d+:\d{2}:\d{2})").unwrap(),
            time_pattern: Regex::new(r"time=(\d+:\d{2}:\d{2})").unwrap(),
            output_pattern: Regex::new(r"Opening .* for writing").unwrap(),
            duration_seconds: 1,
            time_seconds: 0,
        }
    }

    /// Feeds one line and returns the events it produces, mirroring
    /// `LogParser.generate_events_from_log`.
    fn feed(&mut self, line: &str) -> Vec<Event> {
        if let Some(secs) = parse_timestamp(&self.duration_pattern, line) {
            if self.duration_seconds == 1 {
                self.duration_seconds = secs.max(1);
            }
        }
        if let Some(secs) = parse_timestamp(&self.time_pattern, line) {
            self.time_seconds = secs;
        }

        let percentage = (100.0 * self.time_seconds as f64 / self.duration_seconds as f64).round();
        let percentage = percentage.clamp(0.0, 100.0) as u8;

        let mut events = vec![Event::Progress(percentage)];
        if self.output_pattern.is_match(line) {
            events.push(Event::Output {
                transcode_completed: false,
            });
        }
        events
    }
}

/// Drives an [`EventBus`] from a transcoder's combined stdout/stderr stream
/// until it closes. Owns the bus so observers registered before `run` see
/// every event, including the terminal `transcode_completed` one.
pub struct LogParser {
    bus: Arc<Mutex<EventBus>>,
}

impl LogParser {
    pub fn new(bus: Arc<Mutex<EventBus>>) -> Self {
        Self { bus }
    }

    /// Reads `reader` line by line until EOF, notifying the bus for each
    /// parsed event, then emits the terminal `transcode_completed` output
    /// event. Mirrors `LogParser.run`/`generate_events_from_log`.
    pub async fn run<R: AsyncRead + Unpin>(self, reader: R) {
        let mut lines = BufReader::new(reader).lines();
        let mut state = ParseState::new();

        while let Ok(Some(line)) = lines.next_line().await {
            trace!(%line, "ffmpeg log line");
            self.notify_all(state.feed(&line));
        }

        self.notify_all(vec![Event::Output {
            transcode_completed: true,
        }]);
    }

    /// Reads ffmpeg's stdout and stderr concurrently as if they were one
    /// merged stream (ffmpeg is invoked with stderr redirected to stdout's
    /// fd, but `tokio::process` can't dup2 two pipes together, so the merge
    /// happens here instead), notifying the bus as lines arrive from either.
    pub async fn run_merged<O, E>(self, stdout: O, stderr: E)
    where
        O: AsyncRead + Unpin,
        E: AsyncRead + Unpin,
    {
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut state = ParseState::new();
        let mut out_done = false;
        let mut err_done = false;

        while !out_done || !err_done {
            tokio::select! {
                line = out_lines.next_line(), if !out_done => {
                    match line {
                        Ok(Some(line)) => self.notify_all(state.feed(&line)),
                        _ => out_done = true,
                    }
                }
                line = err_lines.next_line(), if !err_done => {
                    match line {
                        Ok(Some(line)) => self.notify_all(state.feed(&line)),
                        _ => err_done = true,
                    }
                }
            }
        }

        self.notify_all(vec![Event::Output {
            transcode_completed: true,
        }]);
    }

    fn notify_all(&self, events: Vec<Event>) {
        let mut bus = self.bus.lock().unwrap();
        for event in events {
            bus.notify(event);
        }
    }
}
