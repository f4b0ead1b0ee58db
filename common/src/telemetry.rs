//! Telemetry input: chunk-sent and chunk-acked events over a time window.
//!
//! The storage behind a [`TelemetrySource`] is not part of the pipeline. Two
//! adapters ship here: [`JsonlTelemetrySource`] reads one record per line
//! from a directory, [`MemoryTelemetrySource`] serves fixed vectors (tests,
//! replays).
//!
//! ```text
//! <dir>/
//! ├── video_sent.jsonl
//! ├── video_acked.jsonl
//! └── experiments.json      (optional: expt_id -> {"cc": ..})
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, TtpError};

pub const SENT_FILE: &str = "video_sent.jsonl";
pub const ACKED_FILE: &str = "video_acked.jsonl";
pub const EXPERIMENTS_FILE: &str = "experiments.json";

/// One client's stream on a channel within an experiment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId {
    pub user: String,
    pub init_id: u32,
    pub channel: String,
    pub expt_id: u32,
}

/// A `video_sent` event, in the units the media server reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentRecord {
    #[serde(flatten)]
    pub session: SessionId,
    pub video_ts: i64,
    pub time: DateTime<Utc>,
    /// Chunk size in bytes.
    pub size: f64,
    /// Bytes per second.
    pub delivery_rate: f64,
    pub cwnd: f64,
    pub in_flight: f64,
    /// Microseconds.
    pub min_rtt: f64,
    /// Microseconds.
    pub rtt: f64,
}

/// A `video_acked` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckedRecord {
    #[serde(flatten)]
    pub session: SessionId,
    pub video_ts: i64,
    pub time: DateTime<Utc>,
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(TtpError::Config(format!(
                "empty time window: {} .. {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, t: &DateTime<Utc>) -> bool {
        *t >= self.start && *t < self.end
    }
}

/// Per-experiment settings the pipeline cares about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentInfo {
    #[serde(default)]
    pub cc: Option<String>,
    #[serde(default)]
    pub abr: Option<String>,
}

/// Source of raw chunk telemetry.
pub trait TelemetrySource: Send + Sync {
    fn query_sent(&self, window: &TimeWindow) -> Result<Vec<SentRecord>>;

    fn query_acked(&self, window: &TimeWindow) -> Result<Vec<AckedRecord>>;

    /// Congestion control used by an experiment, if known.
    fn congestion_control(&self, _expt_id: u32) -> Result<Option<String>> {
        Ok(None)
    }
}

// ============================================================================
// JSON LINES ADAPTER
// ============================================================================

pub struct JsonlTelemetrySource {
    dir: PathBuf,
    experiments: RwLock<HashMap<u32, ExperimentInfo>>,
    malformed_lines: AtomicU64,
}

impl JsonlTelemetrySource {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(TtpError::TelemetryUnavailable(format!(
                "telemetry directory {:?} does not exist",
                dir
            )));
        }

        let experiments = read_catalog(&dir)?;
        info!("Loaded {} experiment configs", experiments.len());

        Ok(Self {
            dir,
            experiments: RwLock::new(experiments),
            malformed_lines: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lines skipped because they did not parse.
    pub fn malformed_lines(&self) -> u64 {
        self.malformed_lines.load(Ordering::Relaxed)
    }

    fn read_window<T, F>(&self, file_name: &str, window: &TimeWindow, time_of: F) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> &DateTime<Utc>,
    {
        let path = self.dir.join(file_name);
        let file = File::open(&path)
            .map_err(|e| TtpError::TelemetryUnavailable(format!("{:?}: {}", path, e)))?;

        let mut records = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(record) => {
                    if window.contains(time_of(&record)) {
                        records.push(record);
                    }
                }
                Err(e) => {
                    self.malformed_lines.fetch_add(1, Ordering::Relaxed);
                    debug!("Skipping {}:{}: {}", file_name, lineno + 1, e);
                }
            }
        }

        debug!(
            "Read {} records from {:?} in [{}, {})",
            records.len(),
            path,
            window.start.to_rfc3339(),
            window.end.to_rfc3339()
        );
        Ok(records)
    }
}

impl TelemetrySource for JsonlTelemetrySource {
    fn query_sent(&self, window: &TimeWindow) -> Result<Vec<SentRecord>> {
        self.read_window(SENT_FILE, window, |r: &SentRecord| &r.time)
    }

    fn query_acked(&self, window: &TimeWindow) -> Result<Vec<AckedRecord>> {
        self.read_window(ACKED_FILE, window, |r: &AckedRecord| &r.time)
    }

    fn congestion_control(&self, expt_id: u32) -> Result<Option<String>> {
        if let Some(info) = self.experiments.read().get(&expt_id) {
            return Ok(info.cc.clone());
        }

        // experiments are appended while the service runs
        let catalog = read_catalog(&self.dir)?;
        let mut experiments = self.experiments.write();
        *experiments = catalog;
        match experiments.get(&expt_id) {
            Some(info) => {
                debug!("Reloaded experiment catalog for experiment {}", expt_id);
                Ok(info.cc.clone())
            }
            None => {
                warn!("No config for experiment {}", expt_id);
                Ok(None)
            }
        }
    }
}

/// `experiments.json` keyed by numeric id; a missing file is an empty catalog.
fn read_catalog(dir: &Path) -> Result<HashMap<u32, ExperimentInfo>> {
    let path = dir.join(EXPERIMENTS_FILE);
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| TtpError::TelemetryUnavailable(format!("{:?}: {}", path, e)))?;
    let raw: HashMap<String, ExperimentInfo> = serde_json::from_str(&content)?;
    let mut parsed = HashMap::with_capacity(raw.len());
    for (key, info) in raw {
        let id = key
            .parse::<u32>()
            .map_err(|_| TtpError::Config(format!("experiment id {:?} is not an integer", key)))?;
        parsed.insert(id, info);
    }
    Ok(parsed)
}

// ============================================================================
// IN-MEMORY ADAPTER
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MemoryTelemetrySource {
    pub sent: Vec<SentRecord>,
    pub acked: Vec<AckedRecord>,
    pub experiments: HashMap<u32, ExperimentInfo>,
}

impl MemoryTelemetrySource {
    pub fn new(sent: Vec<SentRecord>, acked: Vec<AckedRecord>) -> Self {
        Self {
            sent,
            acked,
            experiments: HashMap::new(),
        }
    }

    pub fn with_experiment(mut self, expt_id: u32, cc: &str) -> Self {
        self.experiments.insert(
            expt_id,
            ExperimentInfo {
                cc: Some(cc.to_string()),
                abr: None,
            },
        );
        self
    }
}

impl TelemetrySource for MemoryTelemetrySource {
    fn query_sent(&self, window: &TimeWindow) -> Result<Vec<SentRecord>> {
        Ok(self
            .sent
            .iter()
            .filter(|r| window.contains(&r.time))
            .cloned()
            .collect())
    }

    fn query_acked(&self, window: &TimeWindow) -> Result<Vec<AckedRecord>> {
        Ok(self
            .acked
            .iter()
            .filter(|r| window.contains(&r.time))
            .cloned()
            .collect())
    }

    fn congestion_control(&self, expt_id: u32) -> Result<Option<String>> {
        Ok(self.experiments.get(&expt_id).and_then(|e| e.cc.clone()))
    }
}
