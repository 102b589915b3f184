use crate::utils::{format_timestamp, parse_timestamp};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

pub const CSV_HEADER: [&str; 2] = ["Timestamp", "Pulse Rate (bpm)"];

/// One paced iteration: a frame's capture instant and the pulse rate known then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    pub timestamp: NaiveDateTime,
    pub pulse_rate: u16,
}

/// End-of-session persistence of the accumulated records.
#[allow(async_fn_in_trait)]
pub trait DurableSink {
    fn location(&self) -> &Path;
    /// Persist every record. Returns the number of rows written.
    async fn flush(&mut self, records: &[FrameRecord]) -> Result<usize>;
}

/// Pulse log written once at the end of a session.
///
/// The file is truncated and rewritten in full, then synced to disk. A
/// second flush in the same session is ignored.
#[derive(Debug)]
pub struct CsvLog {
    path: PathBuf,
    flushed: bool,
}

impl CsvLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CsvLog { path: path.into(), flushed: false }
    }

    #[allow(dead_code)]
    pub fn is_flushed(&self) -> bool {
        self.flushed
    }
}

impl DurableSink for CsvLog {
    fn location(&self) -> &Path {
        &self.path
    }

    async fn flush(&mut self, records: &[FrameRecord]) -> Result<usize> {
        if self.flushed {
            tracing::warn!("pulse log {} already flushed this session, ignoring", self.path.display());
            return Ok(0);
        }
        // Only one attempt per session, successful or not.
        self.flushed = true;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }

        let body = render(records)?;
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening pulse log {}", self.path.display()))?;
        f.write_all(&body).await?;
        f.sync_all().await?;

        tracing::info!("saved {} pulse records to {}", records.len(), self.path.display());
        Ok(records.len())
    }
}

/// Serialize the log in memory; the file write itself stays async.
fn render(records: &[FrameRecord]) -> Result<Vec<u8>> {
    let mut wtr = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::with_capacity(32 + records.len() * 34));
    wtr.write_record(CSV_HEADER)?;
    for r in records {
        wtr.write_record([format_timestamp(&r.timestamp), r.pulse_rate.to_string()])?;
    }
    wtr.into_inner()
        .map_err(|e| anyhow!("serializing pulse log: {}", e.error()))
}

/// Parse a pulse log back into records.
#[allow(dead_code)]
pub async fn read_log(path: &Path) -> Result<Vec<FrameRecord>> {
    let text = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading pulse log {}", path.display()))?;
    let mut rdr = csv::ReaderBuilder::new().from_reader(text.as_slice());

    let header = rdr.headers()?;
    if header.iter().ne(CSV_HEADER) {
        return Err(anyhow!("unexpected pulse log header: {:?}", header));
    }

    let mut records = Vec::new();
    for (idx, row) in rdr.records().enumerate() {
        let row = row.with_context(|| format!("row {}", idx + 1))?;
        let (Some(ts), Some(rate)) = (row.get(0), row.get(1)) else {
            return Err(anyhow!("row {}: expected 2 fields, got {}", idx + 1, row.len()));
        };
        records.push(FrameRecord {
            timestamp: parse_timestamp(ts)?,
            pulse_rate: rate
                .parse()
                .with_context(|| format!("row {}: invalid pulse rate {:?}", idx + 1, rate))?,
        });
    }
    Ok(records)
}
