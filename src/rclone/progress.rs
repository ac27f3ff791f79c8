//! rclone output parsing / rclone 输出解析
//!
//! Output is framed into lines by [`OutputLineCodec`] and then matched against a
//! small grammar by [`ProgressExtractor`]:
//!
//! - summary: `[Transferred:] <X> / <Y>, <P>%, <S>/s, ETA <T>`
//! - file in flight: `Transferring: <name>` or ` * <name>: 45% /10Mi, ...`
//! - stats block headers (`Checks:`, `Elapsed time:`, ...): dropped
//!
//! Anything else on stdout is dropped; anything else on stderr becomes an error event.

use bytes::BytesMut;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use tokio_util::codec::Decoder;

use crate::task::{ProgressEvent, ProgressUpdate};
use crate::utils::{parse_bytes, parse_eta, parse_rate};

/// Longest line kept before a forced split / 单行最大长度
pub const MAX_LINE_BYTES: usize = 64 * 1024;

static ANSI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").unwrap());

const SIZE: &str = r"\d+(?:\.\d+)?\s*[KMGT]?i?B?";

static SUMMARY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)(?:Transferred:\s*)?(?P<done>{size})\s*/\s*(?P<total>{size})\s*,\s*(?P<pct>\d+%|-)\s*,\s*(?P<speed>{size}/s)\s*,\s*ETA\s*(?P<eta>\S+)",
        size = SIZE
    ))
    .unwrap()
});

static TRANSFERRING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*Transferring:\s*(?P<name>\S.*?)\s*$").unwrap());

static BULLET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\*\s+(?P<name>.+?):\s*(?:\d+%|transferring|checking)").unwrap());

static STATS_HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:Transferred|Transferring|Checks|Deleted|Renamed|Elapsed time|Errors|Server Side Copies|Server Side Moves|Listed):",
    )
    .unwrap()
});

static FATAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Fatal error|CRITICAL").unwrap());

/// Split raw process output into clean lines / 将进程输出切分为行
///
/// `\r` counts as a terminator because `--progress` redraws in place. Partial
/// lines stay buffered until a terminator arrives or the stream ends.
#[derive(Debug, Default)]
pub struct OutputLineCodec {
    _private: (),
}

impl OutputLineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn clean(raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw);
        ANSI_RE.replace_all(&text, "").trim_end().to_string()
    }
}

impl Decoder for OutputLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            let terminator = buf.iter().position(|b| *b == b'\n' || *b == b'\r');
            let raw = match terminator {
                Some(idx) => {
                    let line = buf.split_to(idx + 1);
                    line[..idx].to_vec()
                }
                None if buf.len() > MAX_LINE_BYTES => buf.split_to(MAX_LINE_BYTES).to_vec(),
                None => return Ok(None),
            };
            let line = Self::clean(&raw);
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split_to(buf.len());
        let line = Self::clean(&rest);
        Ok((!line.trim().is_empty()).then_some(line))
    }
}

/// Which pipe a line came from / 输出来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Parse a summary line into a progress update / 解析进度汇总行
///
/// Returns `None` when the line is not a summary or its byte counts are unparseable.
pub fn parse_summary(line: &str) -> Option<ProgressUpdate> {
    let caps = SUMMARY_RE.captures(line)?;

    let transferred = match parse_bytes(&caps["done"]) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("Dropping progress line with bad transferred size ({}): {}", e, line);
            return None;
        }
    };
    let total = match parse_bytes(&caps["total"]) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("Dropping progress line with bad total size ({}): {}", e, line);
            return None;
        }
    };

    Some(ProgressUpdate {
        transferred_bytes: transferred,
        total_bytes: total,
        speed_bytes_per_sec: parse_rate(&caps["speed"]).ok(),
        eta_seconds: parse_eta(&caps["eta"]),
        current_file: None,
        raw_line: Some(line.trim().to_string()),
    })
}

/// Extract the in-flight filename, if the line names one / 解析当前传输文件名
pub fn parse_transferring(line: &str) -> Option<String> {
    TRANSFERRING_RE
        .captures(line)
        .or_else(|| BULLET_RE.captures(line))
        .map(|caps| caps["name"].trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Per-task line matcher / 单个任务的进度提取器
#[derive(Debug)]
pub struct ProgressExtractor {
    task_id: String,
    pending_file: Option<String>,
}

impl ProgressExtractor {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self { task_id: task_id.into(), pending_file: None }
    }

    /// Feed one complete line; returns at most one event / 处理一行输出
    pub fn feed(&mut self, stream: Stream, line: &str) -> Option<ProgressEvent> {
        if line.trim().is_empty() {
            return None;
        }

        if let Some(mut update) = parse_summary(line) {
            update.current_file = self.pending_file.take();
            return Some(ProgressEvent::progress(self.task_id.clone(), update));
        }

        // 文件名单独不产生事件，合并到下一条进度
        if let Some(name) = parse_transferring(line) {
            self.pending_file = Some(name);
            return None;
        }

        if STATS_HEADER_RE.is_match(line) {
            return None;
        }

        match stream {
            Stream::Stdout => None,
            Stream::Stderr => Some(ProgressEvent::error(
                self.task_id.clone(),
                line.trim(),
                FATAL_RE.is_match(line),
            )),
        }
    }
}
