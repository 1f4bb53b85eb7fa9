//! Exporting the session log to disk.

use crate::orchestrator::LogEntry;
use anyhow::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TranscriptFormat {
    Text,
    Jsonl,
    Csv,
}

impl TranscriptFormat {
    /// `.csv` and `.jsonl`/`.json` select those formats; anything else is text.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
            Some("csv") => TranscriptFormat::Csv,
            Some("jsonl") | Some("json") => TranscriptFormat::Jsonl,
            _ => TranscriptFormat::Text,
        }
    }
}

pub fn default_file_name(now: OffsetDateTime) -> String {
    let stamp = now
        .format(format_description!("[year][month][day]_[hour][minute][second]"))
        .unwrap_or_else(|_| now.unix_timestamp().to_string());
    format!("linxtap_log_{stamp}.txt")
}

/// `[HH:MM:SS] text`, the way the log panel shows it.
pub fn text_line(entry: &LogEntry) -> String {
    let clock = entry
        .timestamp
        .format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default();
    format!("[{}] {}", clock, entry.text)
}

pub fn json_line(entry: &LogEntry) -> Result<String> {
    let obj = serde_json::json!({
        "timestamp": rfc3339(entry.timestamp),
        "kind": entry.kind.as_str(),
        "text": entry.text,
    });
    Ok(serde_json::to_string(&obj)?)
}

fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

pub fn write_transcript(path: &Path, entries: &[LogEntry], format: TranscriptFormat) -> Result<()> {
    match format {
        TranscriptFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(File::create(path)?);
            wtr.write_record(["timestamp", "kind", "text"])?;
            for e in entries {
                wtr.write_record([rfc3339(e.timestamp).as_str(), e.kind.as_str(), e.text.as_str()])?;
            }
            wtr.flush()?;
        }
        TranscriptFormat::Jsonl => {
            let mut w = BufWriter::new(File::create(path)?);
            for e in entries {
                writeln!(w, "{}", json_line(e)?)?;
            }
            w.flush()?;
        }
        TranscriptFormat::Text => {
            let mut w = BufWriter::new(File::create(path)?);
            for e in entries {
                writeln!(w, "{}", text_line(e))?;
            }
            w.flush()?;
        }
    }
    Ok(())
}
