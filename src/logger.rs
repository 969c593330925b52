//! Session Logger
//!
//! Append-only JSONL persistence for three independent streams: chat turns,
//! activation snapshots and tool executions. Each stream is partitioned by
//! UTC calendar day (`{stream}_{YYYYMMDD}.jsonl`) and has its own lock, so
//! the capture path and the tool path append concurrently without a global
//! lock.
//!
//! ## Crash safety
//!
//! A record is serialised to a single line and written with one `write_all`
//! on an append-mode handle, then synced. An interrupted write can leave an
//! unterminated fragment at the end of a file. Before the next append to
//! that file the fragment is closed with a newline, so it stays an isolated
//! line and never swallows the following record. Readers skip such
//! truncated lines with a warning; a complete line that is not a valid
//! record is corruption and is reported.
//!
//! Historical entries are never rewritten or deleted.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::records::{ActivationSnapshot, ChatTurnRecord, Timestamped, ToolExecutionRecord};

/// Log file extension
const LOG_EXT: &str = "jsonl";

/// The three independent log streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStream {
    Chat,
    Activations,
    Tools,
}

impl LogStream {
    pub const ALL: [LogStream; 3] = [LogStream::Chat, LogStream::Activations, LogStream::Tools];

    pub fn prefix(self) -> &'static str {
        match self {
            LogStream::Chat => "chat",
            LogStream::Activations => "activations",
            LogStream::Tools => "tools",
        }
    }

    /// File name of this stream's partition for `date`.
    pub fn file_name(self, date: NaiveDate) -> String {
        format!("{}_{}.{LOG_EXT}", self.prefix(), date.format("%Y%m%d"))
    }
}

/// Parse a `YYYYMMDD` partition date.
pub fn parse_partition_date(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y%m%d")
        .map_err(|e| PipelineError::Config(format!("invalid log date '{text}' (want YYYYMMDD): {e}")))
}

/// Currently open partition of one stream.
struct OpenPartition {
    date: NaiveDate,
    path: PathBuf,
    file: File,
}

/// Serialised appender for one stream.
struct StreamWriter {
    stream: LogStream,
    partition: Mutex<Option<OpenPartition>>,
}

impl StreamWriter {
    fn new(stream: LogStream) -> Self {
        Self {
            stream,
            partition: Mutex::new(None),
        }
    }

    fn append<T: Serialize + Timestamped>(&self, dir: &Path, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let date = record.timestamp().date_naive();

        let mut guard = self.partition.lock();
        let mut partition = match guard.take() {
            Some(open) if open.date == date => open,
            _ => self.open_partition(dir, date)?,
        };
        // On failure the partition stays closed; reopening repairs a partial line.
        partition.file.write_all(&line)?;
        partition.file.sync_data()?;
        debug!(
            "Appended {} bytes to {}",
            line.len(),
            partition.path.display()
        );
        *guard = Some(partition);
        Ok(())
    }

    fn open_partition(&self, dir: &Path, date: NaiveDate) -> Result<OpenPartition> {
        let path = dir.join(self.stream.file_name(date));
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        if ends_mid_record(&mut file)? {
            warn!("Terminating interrupted record in {}", path.display());
            file.write_all(b"\n")?;
            file.sync_data()?;
        }
        info!("Opened {} log: {}", self.stream.prefix(), path.display());
        Ok(OpenPartition { date, path, file })
    }
}

/// Whether a non-empty file lacks its final newline.
fn ends_mid_record(file: &mut File) -> Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Writer for the three session log streams.
pub struct SessionLogger {
    dir: PathBuf,
    chat: StreamWriter,
    activations: StreamWriter,
    tools: StreamWriter,
}

impl SessionLogger {
    /// Create a logger rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            chat: StreamWriter::new(LogStream::Chat),
            activations: StreamWriter::new(LogStream::Activations),
            tools: StreamWriter::new(LogStream::Tools),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_chat(&self, record: &ChatTurnRecord) -> Result<()> {
        self.chat.append(&self.dir, record)
    }

    pub fn log_activation(&self, snapshot: &ActivationSnapshot) -> Result<()> {
        self.activations.append(&self.dir, snapshot)
    }

    pub fn log_tool_execution(&self, record: &ToolExecutionRecord) -> Result<()> {
        self.tools.append(&self.dir, record)
    }

    /// Entry counts and file paths for one day.
    pub fn session_summary(&self, date: NaiveDate) -> Result<SessionSummary> {
        SessionSummary::collect(&self.dir, date)
    }
}

/// Read one stream partition, tolerating interrupted writes.
///
/// The file is read once; only newline-terminated lines are considered, so
/// concurrent appends after the read are simply not seen. Lines cut short
/// by a crash are skipped. A missing partition is an empty stream.
pub fn read_stream<T: DeserializeOwned>(
    dir: &Path,
    stream: LogStream,
    date: NaiveDate,
) -> Result<Vec<T>> {
    let path = dir.join(stream.file_name(date));
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    parse_lines(&path, &bytes)
}

fn parse_lines<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<Vec<T>> {
    let complete_len = bytes
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1);
    if complete_len < bytes.len() {
        warn!(
            "Ignoring {}-byte trailing fragment in {}",
            bytes.len() - complete_len,
            path.display()
        );
    }

    let mut records = Vec::new();
    for (i, line) in bytes[..complete_len].split(|&b| b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice(line) {
            Ok(record) => records.push(record),
            // Input ending inside a value is an interrupted write closed on reopen
            Err(e) if e.is_eof() => warn!(
                "Skipping truncated record at {}:{}",
                path.display(),
                i + 1
            ),
            Err(e) => {
                return Err(PipelineError::CorruptLog {
                    path: path.to_path_buf(),
                    line: i + 1,
                    reason: e.to_string(),
                })
            }
        }
    }
    Ok(records)
}

/// Count complete, non-truncated lines of a stream partition.
fn count_entries(path: &Path) -> Result<usize> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes
            .split(|&b| b == b'\n')
            .rev()
            .skip(1) // text after the last newline is empty or a fragment
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .filter(|line| {
                !matches!(serde_json::from_slice::<IgnoredAny>(line), Err(e) if e.is_eof())
            })
            .count()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Per-stream entry counts for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub date: NaiveDate,
    pub chat_entries: usize,
    pub activation_entries: usize,
    pub tool_executions: usize,
    pub chat_file: PathBuf,
    pub activations_file: PathBuf,
    pub tools_file: PathBuf,
}

impl SessionSummary {
    pub fn collect(dir: &Path, date: NaiveDate) -> Result<Self> {
        let chat_file = dir.join(LogStream::Chat.file_name(date));
        let activations_file = dir.join(LogStream::Activations.file_name(date));
        let tools_file = dir.join(LogStream::Tools.file_name(date));
        Ok(Self {
            date,
            chat_entries: count_entries(&chat_file)?,
            activation_entries: count_entries(&activations_file)?,
            tool_executions: count_entries(&tools_file)?,
            chat_file,
            activations_file,
            tools_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{FinishReason, Role};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn chat_at(h: u32, m: u32, s: u32) -> ChatTurnRecord {
        ChatTurnRecord {
            turn_id: Uuid::new_v4(),
            timestamp: Utc.with_ymd_and_hms(2026, 2, 2, h, m, s).unwrap(),
            role: Role::Assistant,
            content: "hello".into(),
            tools_enabled: false,
            finish_reason: FinishReason::Stop,
            prompt: None,
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 2).unwrap()
    }

    #[test]
    fn test_file_names() {
        assert_eq!(LogStream::Chat.file_name(day()), "chat_20260202.jsonl");
        assert_eq!(LogStream::Tools.file_name(day()), "tools_20260202.jsonl");
        assert_eq!(parse_partition_date("20260202").unwrap(), day());
        assert!(parse_partition_date("2026-02-02").is_err());
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionLogger::new(dir.path()).unwrap();
        let a = chat_at(9, 1, 35);
        let b = chat_at(9, 5, 0);
        logger.log_chat(&a).unwrap();
        logger.log_chat(&b).unwrap();

        let back: Vec<ChatTurnRecord> = read_stream(dir.path(), LogStream::Chat, day()).unwrap();
        assert_eq!(back, vec![a, b]);
    }

    #[test]
    fn test_partition_follows_record_date() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionLogger::new(dir.path()).unwrap();
        let mut late = chat_at(23, 59, 59);
        logger.log_chat(&late).unwrap();
        late.timestamp = Utc.with_ymd_and_hms(2026, 2, 3, 0, 0, 1).unwrap();
        logger.log_chat(&late).unwrap();

        assert!(dir.path().join("chat_20260202.jsonl").exists());
        assert!(dir.path().join("chat_20260203.jsonl").exists());
    }

    #[test]
    fn test_trailing_fragment_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionLogger::new(dir.path()).unwrap();
        logger.log_chat(&chat_at(9, 0, 0)).unwrap();

        let path = dir.path().join("chat_20260202.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"turn_id":"00000000-0000-0000-0000-0"#).unwrap();

        let back: Vec<ChatTurnRecord> = read_stream(dir.path(), LogStream::Chat, day()).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(logger.session_summary(day()).unwrap().chat_entries, 1);
    }

    #[test]
    fn test_restart_after_interrupted_write() {
        let dir = tempfile::tempdir().unwrap();
        let first = chat_at(9, 0, 0);
        {
            let logger = SessionLogger::new(dir.path()).unwrap();
            logger.log_chat(&first).unwrap();
        }
        let path = dir.path().join("chat_20260202.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"turn_id":"0000"#).unwrap();
        drop(file);

        let logger = SessionLogger::new(dir.path()).unwrap();
        let second = chat_at(9, 1, 0);
        let third = chat_at(9, 2, 0);
        logger.log_chat(&second).unwrap();
        logger.log_chat(&third).unwrap();

        let back: Vec<ChatTurnRecord> = read_stream(dir.path(), LogStream::Chat, day()).unwrap();
        assert_eq!(back, vec![first, second, third]);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().nth(1), Some(r#"{"turn_id":"0000"#));
        assert_eq!(logger.session_summary(day()).unwrap().chat_entries, 3);
    }

    #[test]
    fn test_truncated_line_skipped_anywhere() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat_20260202.jsonl");
        let good = serde_json::to_string(&chat_at(9, 0, 0)).unwrap();
        let cut = &good[..good.len() / 2];
        std::fs::write(&path, format!("{cut}\n{good}\n{cut}\n{good}\n")).unwrap();

        let back: Vec<ChatTurnRecord> = read_stream(dir.path(), LogStream::Chat, day()).unwrap();
        assert_eq!(back.len(), 2);
    }

    #[test]
    fn test_corrupt_middle_line_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat_20260202.jsonl");
        let good = serde_json::to_string(&chat_at(9, 0, 0)).unwrap();
        std::fs::write(&path, format!("{good}\n{{broken\n{good}\n")).unwrap();

        let err = read_stream::<ChatTurnRecord>(dir.path(), LogStream::Chat, day()).unwrap_err();
        assert!(matches!(err, PipelineError::CorruptLog { line: 2, .. }));
    }

    #[test]
    fn test_missing_partition_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let back: Vec<ToolExecutionRecord> =
            read_stream(dir.path(), LogStream::Tools, day()).unwrap();
        assert!(back.is_empty());
        let summary = SessionSummary::collect(dir.path(), day()).unwrap();
        assert_eq!(summary.tool_executions, 0);
    }

    #[test]
    fn test_concurrent_appenders() {
        let dir = tempfile::tempdir().unwrap();
        let logger = std::sync::Arc::new(SessionLogger::new(dir.path()).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let logger = std::sync::Arc::clone(&logger);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        if t % 2 == 0 {
                            logger.log_chat(&chat_at(10, t, i)).unwrap();
                        } else {
                            logger
                                .log_tool_execution(&ToolExecutionRecord {
                                    timestamp: Utc.with_ymd_and_hms(2026, 2, 2, 10, t, i).unwrap(),
                                    tool_name: "check_my_activations".into(),
                                    arguments: serde_json::json!({}),
                                    result: Some(serde_json::json!({"ok": true})),
                                })
                                .unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let chats: Vec<ChatTurnRecord> = read_stream(dir.path(), LogStream::Chat, day()).unwrap();
        let tools: Vec<ToolExecutionRecord> =
            read_stream(dir.path(), LogStream::Tools, day()).unwrap();
        assert_eq!(chats.len(), 100);
        assert_eq!(tools.len(), 100);
    }
}
