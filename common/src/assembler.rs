//! Joins `video_sent` and `video_acked` events into per-session chunk runs.
//!
//! A session's run is contiguous: every accepted `video_ts` extends the
//! previous one by exactly one chunk stride. The first gap, or the first
//! record with unusable statistics, closes the run and every later chunk of
//! that session in the same pass is dropped, so features never reference
//! chunks across lost telemetry. Records are scanned in send order.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{MILLION, PKT_BYTES, TCP_FEATURES};
use crate::data_quality::validate_sent;
use crate::error::{Result, TtpError};
use crate::telemetry::{AckedRecord, SentRecord, SessionId, TelemetrySource, TimeWindow};

/// A chunk after the join, in training units (packets, packets/s, seconds).
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub video_ts: i64,
    pub sent_time: DateTime<Utc>,
    pub acked_time: Option<DateTime<Utc>>,
    /// Seconds between send and ack; `None` until a valid ack arrives.
    pub trans_time: Option<f64>,
    pub size: f64,
    pub delivery_rate: f64,
    pub cwnd: f64,
    pub in_flight: f64,
    pub min_rtt: f64,
    pub rtt: f64,
}

impl Chunk {
    pub fn from_sent(record: &SentRecord) -> Self {
        Chunk {
            video_ts: record.video_ts,
            sent_time: record.time,
            acked_time: None,
            trans_time: None,
            size: record.size / PKT_BYTES,
            delivery_rate: record.delivery_rate / PKT_BYTES,
            cwnd: record.cwnd,
            in_flight: record.in_flight,
            min_rtt: record.min_rtt / MILLION,
            rtt: record.rtt / MILLION,
        }
    }

    /// `[delivery_rate, cwnd, in_flight, min_rtt, rtt]`
    pub fn tcp_features(&self) -> [f64; TCP_FEATURES] {
        [
            self.delivery_rate,
            self.cwnd,
            self.in_flight,
            self.min_rtt,
            self.rtt,
        ]
    }
}

/// Ordered chunks of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub chunks: BTreeMap<i64, Chunk>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            chunks: BTreeMap::new(),
        }
    }

    pub fn get(&self, video_ts: i64) -> Option<&Chunk> {
        self.chunks.get(&video_ts)
    }

    /// The chunk at `video_ts`, only if it has a valid transmission time.
    pub fn acked(&self, video_ts: i64) -> Option<&Chunk> {
        self.chunks.get(&video_ts).filter(|c| c.trans_time.is_some())
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Diagnostic counters for one assembly pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyStats {
    pub sent_records: u64,
    pub acked_records: u64,
    pub filtered_by_cc: u64,
    pub rejected_records: u64,
    pub gap_dropped: u64,
    pub orphan_acks: u64,
    pub nonpositive_trans_time: u64,
    pub unacked_chunks: u64,
    pub sessions: u64,
    pub chunks: u64,
}

/// Output of one pass over a time window.
#[derive(Debug, Clone, Default)]
pub struct Assembly {
    pub sessions: BTreeMap<SessionId, Session>,
    pub stats: AssemblyStats,
}

#[derive(Debug)]
struct RunState {
    session: Session,
    /// Every `video_ts` reported for the session, accepted or not.
    seen: HashSet<i64>,
    last_video_ts: Option<i64>,
    closed: bool,
}

#[derive(Debug, Clone)]
pub struct ChunkAssembler {
    video_duration: i64,
    cc: Option<String>,
}

impl ChunkAssembler {
    pub fn new(video_duration: i64) -> Self {
        Self {
            video_duration,
            cc: None,
        }
    }

    /// Keep only sessions whose experiment ran the given congestion control.
    pub fn with_cc_filter(mut self, cc: Option<String>) -> Self {
        self.cc = cc;
        self
    }

    pub fn assemble<S>(&self, source: &S, window: &TimeWindow) -> Result<Assembly>
    where
        S: TelemetrySource + ?Sized,
    {
        let sent = source.query_sent(window)?;
        let acked = source.query_acked(window)?;
        self.assemble_records(sent, acked, |expt_id| source.congestion_control(expt_id))
    }

    pub fn assemble_records<F>(
        &self,
        mut sent: Vec<SentRecord>,
        acked: Vec<AckedRecord>,
        mut cc_of: F,
    ) -> Result<Assembly>
    where
        F: FnMut(u32) -> Result<Option<String>>,
    {
        let mut stats = AssemblyStats::default();
        let mut runs: BTreeMap<SessionId, RunState> = BTreeMap::new();
        let mut keep_cache: HashMap<u32, bool> = HashMap::new();

        let mut keep = |expt_id: u32| -> Result<bool> {
            let Some(wanted) = self.cc.as_deref() else {
                return Ok(true);
            };
            if let Some(&keep) = keep_cache.get(&expt_id) {
                return Ok(keep);
            }
            let keep = cc_of(expt_id)?.as_deref() == Some(wanted);
            keep_cache.insert(expt_id, keep);
            Ok(keep)
        };

        sent.sort_by(|a, b| {
            (&a.session, a.time, a.video_ts).cmp(&(&b.session, b.time, b.video_ts))
        });

        for record in sent {
            stats.sent_records += 1;

            if !keep(record.session.expt_id)? {
                stats.filtered_by_cc += 1;
                continue;
            }

            let run = runs
                .entry(record.session.clone())
                .or_insert_with(|| RunState {
                    session: Session::new(record.session.clone()),
                    seen: HashSet::new(),
                    last_video_ts: None,
                    closed: false,
                });

            if !run.seen.insert(record.video_ts) {
                return Err(TtpError::TelemetryInconsistent(format!(
                    "duplicate video_sent for {:?} at video_ts {}",
                    record.session, record.video_ts
                )));
            }

            if run.closed {
                stats.gap_dropped += 1;
                continue;
            }

            if let Err(reason) = validate_sent(&record) {
                debug!(
                    "Rejected video_sent {:?}@{}: {}; closing run",
                    record.session, record.video_ts, reason
                );
                run.closed = true;
                stats.rejected_records += 1;
                continue;
            }

            if let Some(last) = run.last_video_ts {
                if record.video_ts != last + self.video_duration {
                    debug!(
                        "Gap in {:?}: {} does not follow {}; closing run",
                        record.session, record.video_ts, last
                    );
                    run.closed = true;
                    stats.gap_dropped += 1;
                    continue;
                }
            }

            run.last_video_ts = Some(record.video_ts);
            run.session
                .chunks
                .insert(record.video_ts, Chunk::from_sent(&record));
        }

        for record in acked {
            stats.acked_records += 1;

            if !keep(record.session.expt_id)? {
                stats.filtered_by_cc += 1;
                continue;
            }

            let Some(run) = runs.get_mut(&record.session) else {
                stats.orphan_acks += 1;
                continue;
            };
            let Some(chunk) = run.session.chunks.get_mut(&record.video_ts) else {
                stats.orphan_acks += 1;
                continue;
            };

            if chunk.acked_time.is_some() {
                return Err(TtpError::TelemetryInconsistent(format!(
                    "duplicate video_acked for {:?} at video_ts {}",
                    record.session, record.video_ts
                )));
            }

            let elapsed = record.time - chunk.sent_time;
            let trans_time = match elapsed.num_microseconds() {
                Some(us) => us as f64 / MILLION,
                None => f64::INFINITY,
            };

            if !(trans_time > 0.0 && trans_time.is_finite()) {
                stats.nonpositive_trans_time += 1;
                run.session.chunks.remove(&record.video_ts);
                continue;
            }

            chunk.acked_time = Some(record.time);
            chunk.trans_time = Some(trans_time);
        }

        let sessions: BTreeMap<SessionId, Session> = runs
            .into_iter()
            .filter(|(_, run)| !run.session.is_empty())
            .map(|(id, run)| (id, run.session))
            .collect();

        stats.sessions = sessions.len() as u64;
        for session in sessions.values() {
            stats.chunks += session.len() as u64;
            stats.unacked_chunks += session
                .chunks
                .values()
                .filter(|c| c.trans_time.is_none())
                .count() as u64;
        }

        info!(
            "Assembled {} chunks in {} sessions ({} unacked, {} gap-dropped, {} orphan acks, {} rejected)",
            stats.chunks,
            stats.sessions,
            stats.unacked_chunks,
            stats.gap_dropped,
            stats.orphan_acks,
            stats.rejected_records
        );

        Ok(Assembly { sessions, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const VD: i64 = 180_180;

    fn session(expt_id: u32) -> SessionId {
        SessionId {
            user: "bob".into(),
            init_id: 42,
            channel: "abc".into(),
            expt_id,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn sent(expt_id: u32, idx: i64) -> SentRecord {
        SentRecord {
            session: session(expt_id),
            video_ts: idx * VD,
            time: t0() + Duration::seconds(2 * idx),
            size: 150_000.0,
            delivery_rate: 3_000_000.0,
            cwnd: 50.0,
            in_flight: 4.0,
            min_rtt: 10_000.0,
            rtt: 20_000.0,
        }
    }

    fn acked(expt_id: u32, idx: i64, after_ms: i64) -> AckedRecord {
        AckedRecord {
            session: session(expt_id),
            video_ts: idx * VD,
            time: t0() + Duration::seconds(2 * idx) + Duration::milliseconds(after_ms),
        }
    }

    fn no_cc(_: u32) -> Result<Option<String>> {
        Ok(None)
    }

    #[test]
    fn test_join_computes_trans_time_and_units() {
        let assembler = ChunkAssembler::new(VD);
        let assembly = assembler
            .assemble_records(vec![sent(1, 0), sent(1, 1)], vec![acked(1, 0, 750)], no_cc)
            .unwrap();

        let s = &assembly.sessions[&session(1)];
        let c0 = s.get(0).unwrap();
        assert!((c0.trans_time.unwrap() - 0.75).abs() < 1e-12);
        assert!((c0.size - 100.0).abs() < 1e-12);
        assert!((c0.delivery_rate - 2_000.0).abs() < 1e-12);
        assert!((c0.min_rtt - 0.01).abs() < 1e-12);
        assert!((c0.rtt - 0.02).abs() < 1e-12);
        assert!(s.get(VD).unwrap().trans_time.is_none());
        assert_eq!(assembly.stats.unacked_chunks, 1);
    }

    #[test]
    fn test_gap_closes_run() {
        let assembler = ChunkAssembler::new(VD);
        let records = vec![sent(1, 0), sent(1, 1), sent(1, 3), sent(1, 4)];
        let assembly = assembler.assemble_records(records, vec![], no_cc).unwrap();

        let s = &assembly.sessions[&session(1)];
        assert_eq!(s.chunks.keys().copied().collect::<Vec<_>>(), vec![0, VD]);
        assert_eq!(assembly.stats.gap_dropped, 2);
    }

    #[test]
    fn test_orphan_ack_counted() {
        let assembler = ChunkAssembler::new(VD);
        let assembly = assembler
            .assemble_records(vec![sent(1, 0)], vec![acked(1, 5, 100), acked(2, 0, 100)], no_cc)
            .unwrap();
        assert_eq!(assembly.stats.orphan_acks, 2);
    }

    #[test]
    fn test_nonpositive_trans_time_dropped() {
        let assembler = ChunkAssembler::new(VD);
        let assembly = assembler
            .assemble_records(vec![sent(1, 0), sent(1, 1)], vec![acked(1, 0, 0), acked(1, 1, 300)], no_cc)
            .unwrap();
        let s = &assembly.sessions[&session(1)];
        assert!(s.get(0).is_none());
        assert!(s.acked(VD).is_some());
        assert_eq!(assembly.stats.nonpositive_trans_time, 1);
    }

    #[test]
    fn test_duplicate_sent_is_inconsistent() {
        let assembler = ChunkAssembler::new(VD);
        let result = assembler.assemble_records(vec![sent(1, 0), sent(1, 0)], vec![], no_cc);
        assert!(matches!(result, Err(TtpError::TelemetryInconsistent(_))));
    }

    #[test]
    fn test_duplicate_ack_is_inconsistent() {
        let assembler = ChunkAssembler::new(VD);
        let result = assembler.assemble_records(
            vec![sent(1, 0)],
            vec![acked(1, 0, 100), acked(1, 0, 200)],
            no_cc,
        );
        assert!(matches!(result, Err(TtpError::TelemetryInconsistent(_))));
    }

    #[test]
    fn test_cc_filter() {
        let assembler = ChunkAssembler::new(VD).with_cc_filter(Some("bbr".into()));
        let lookup = |expt_id: u32| -> Result<Option<String>> {
            Ok(Some(if expt_id == 1 { "bbr" } else { "cubic" }.to_string()))
        };
        let assembly = assembler
            .assemble_records(vec![sent(1, 0), sent(2, 0)], vec![acked(2, 0, 100)], lookup)
            .unwrap();
        assert_eq!(assembly.sessions.len(), 1);
        assert!(assembly.sessions.contains_key(&session(1)));
        assert_eq!(assembly.stats.filtered_by_cc, 2);
    }

    #[test]
    fn test_duplicate_after_gap_is_inconsistent() {
        let assembler = ChunkAssembler::new(VD);
        let result =
            assembler.assemble_records(vec![sent(1, 0), sent(1, 2), sent(1, 2)], vec![], no_cc);
        assert!(matches!(result, Err(TtpError::TelemetryInconsistent(_))));
    }

    #[test]
    fn test_duplicate_of_rejected_record_is_inconsistent() {
        let assembler = ChunkAssembler::new(VD);
        let mut bad = sent(1, 1);
        bad.cwnd = f64::INFINITY;
        let result = assembler.assemble_records(
            vec![sent(1, 0), bad.clone(), bad],
            vec![],
            no_cc,
        );
        assert!(matches!(result, Err(TtpError::TelemetryInconsistent(_))));
    }

    #[test]
    fn test_out_of_order_records_are_sorted() {
        let assembler = ChunkAssembler::new(VD);
        let records = vec![sent(1, 3), sent(1, 0), sent(1, 4), sent(1, 2), sent(1, 1)];
        let acks = vec![acked(1, 4, 200), acked(1, 0, 200), acked(1, 2, 200)];
        let assembly = assembler.assemble_records(records, acks, no_cc).unwrap();

        let s = &assembly.sessions[&session(1)];
        assert_eq!(s.len(), 5);
        assert_eq!(assembly.stats.gap_dropped, 0);
        assert!(s.acked(4 * VD).is_some());
    }

    #[test]
    fn test_zero_rtt_record_is_kept() {
        let assembler = ChunkAssembler::new(VD);
        let mut zero = sent(1, 1);
        zero.rtt = 0.0;
        zero.size = 0.0;
        let assembly = assembler
            .assemble_records(vec![sent(1, 0), zero, sent(1, 2)], vec![], no_cc)
            .unwrap();
        assert_eq!(assembly.sessions[&session(1)].len(), 3);
        assert_eq!(assembly.stats.rejected_records, 0);
    }

    #[test]
    fn test_non_finite_record_closes_run() {
        let assembler = ChunkAssembler::new(VD);
        let mut bad = sent(1, 1);
        bad.rtt = f64::NAN;
        let assembly = assembler
            .assemble_records(vec![sent(1, 0), bad, sent(1, 2), sent(1, 3)], vec![], no_cc)
            .unwrap();

        let s = &assembly.sessions[&session(1)];
        assert_eq!(s.chunks.keys().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(assembly.stats.rejected_records, 1);
        assert_eq!(assembly.stats.gap_dropped, 2);
    }

    #[test]
    fn test_invalid_record_rejected() {
        let assembler = ChunkAssembler::new(VD);
        let mut bad = sent(1, 0);
        bad.rtt = f64::NAN;
        let assembly = assembler.assemble_records(vec![bad], vec![], no_cc).unwrap();
        assert!(assembly.sessions.is_empty());
        assert_eq!(assembly.stats.rejected_records, 1);
    }
}
