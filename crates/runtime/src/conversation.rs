//! Conversation log — the only authoritative record of raw dialogue.
//!
//! One append-only JSONL file per session under the conversations
//! directory: a session-start header line followed by one record per turn.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    SessionStart {
        conversation_id: String,
        started_at: DateTime<Utc>,
    },
    Turn {
        turn_index: usize,
        timestamp: DateTime<Utc>,
        user: String,
        assistant: String,
    },
}

#[derive(Debug, Clone)]
pub struct ConversationLog {
    path: PathBuf,
}

impl ConversationLog {
    /// Create the session file (`YYYY-MM-DD_HHMMSS_<id8>.jsonl`) and write
    /// the header record.
    pub fn start(dir: impl AsRef<Path>, conversation_id: &str) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("create conversations dir {}", dir.display()))?;

        let stamp = Local::now().format("%Y-%m-%d_%H%M%S");
        let short_id: String = conversation_id.chars().take(8).collect();
        let path = dir.join(format!("{stamp}_{short_id}.jsonl"));

        let log = Self { path };
        log.append(&LogRecord::SessionStart {
            conversation_id: conversation_id.to_string(),
            started_at: Utc::now(),
        })?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_turn(&self, turn_index: usize, user: &str, assistant: &str) -> Result<()> {
        self.append(&LogRecord::Turn {
            turn_index,
            timestamp: Utc::now(),
            user: user.to_string(),
            assistant: assistant.to_string(),
        })
    }

    fn append(&self, record: &LogRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("serialize log record")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open conversation log {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Read a session file back; malformed lines are skipped.
    pub fn load(path: impl AsRef<Path>) -> Result<Vec<LogRecord>> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("open conversation log {}", path.display()))?;
        let reader = BufReader::new(file);

        Ok(reader
            .lines()
            .filter_map(|line| {
                let line = line.ok()?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return None;
                }
                serde_json::from_str(trimmed).ok()
            })
            .collect())
    }
}
