//! Append-only per-session event journal.
//!
//! One JSON object per line. A line that fails to parse (a torn write from a
//! killed process) is skipped on read.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Severity, Verdict};
use crate::{shlog_warn, Result};

/// A state-changing input, in the order the session received it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PipelineEvent {
    SessionStarted {
        at: DateTime<Utc>,
    },
    Classified {
        text: String,
        at: DateTime<Utc>,
    },
    /// A delegation that passed the gate.
    Delegated {
        capability: String,
        at: DateTime<Utc>,
    },
    StageReported {
        capability: String,
        verdict: Verdict,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        severity: Option<Severity>,
        at: DateTime<Utc>,
    },
    Cancelled {
        at: DateTime<Utc>,
    },
    Reset {
        keep_classification: bool,
        at: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            PipelineEvent::SessionStarted { at }
            | PipelineEvent::Classified { at, .. }
            | PipelineEvent::Delegated { at, .. }
            | PipelineEvent::StageReported { at, .. }
            | PipelineEvent::Cancelled { at }
            | PipelineEvent::Reset { at, .. } => *at,
        }
    }
}

pub fn append(path: &Path, event: &PipelineEvent) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Read every event in `path`. A missing journal reads as empty.
pub fn read(path: &Path) -> Result<Vec<PipelineEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(fs::File::open(path)?);
    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(event) => events.push(event),
            Err(e) => shlog_warn!(
                "journal: skipping unreadable line {} of {}: {}",
                index + 1,
                path.display(),
                e
            ),
        }
    }
    Ok(events)
}
