use std::sync::atomic::AtomicBool;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;
use ttp_common::artifact;
use ttp_common::{
    train_all, AckedRecord, CandleFitter, ChunkAssembler, Discretizer, FeatureBuilder,
    MemoryTelemetrySource, ModelConfig, Normalizer, PointEstimate, ReplaySampler, SentRecord,
    SessionId, TimeWindow, TrainOptions, TtpEnsemble,
};

const VD: i64 = 180_180;

fn session(user: &str) -> SessionId {
    SessionId {
        user: user.into(),
        init_id: 7,
        channel: "cbs".into(),
        expt_id: 3,
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
}

/// `n` contiguous chunks sent 2 s apart from `at`, each acked after `(i % 5 + 1) * 150` ms.
fn records(
    id: &SessionId,
    at: DateTime<Utc>,
    n: i64,
) -> (Vec<SentRecord>, Vec<AckedRecord>) {
    let mut sent = Vec::new();
    let mut acked = Vec::new();
    for i in 0..n {
        let time = at + Duration::seconds(2 * i);
        sent.push(SentRecord {
            session: id.clone(),
            video_ts: i * VD,
            time,
            size: 90_000.0 + 1_500.0 * i as f64,
            delivery_rate: 1_500_000.0 + 15_000.0 * i as f64,
            cwnd: 20.0 + i as f64,
            in_flight: (i % 4) as f64,
            min_rtt: 12_000.0,
            rtt: 18_000.0 + 100.0 * i as f64,
        });
        acked.push(AckedRecord {
            session: id.clone(),
            video_ts: i * VD,
            time: time + Duration::milliseconds((i % 5 + 1) * 150),
        });
    }
    (sent, acked)
}

fn whole_day() -> TimeWindow {
    TimeWindow::new(start(), start() + Duration::days(1)).unwrap()
}

#[test]
fn test_contiguous_session_emits_one_row_per_horizon_at_ninth_chunk() {
    let (sent, acked) = records(&session("a"), start(), 14);
    let source = MemoryTelemetrySource::new(sent, acked);
    let assembly = ChunkAssembler::new(VD).assemble(&source, &whole_day()).unwrap();
    assert_eq!(assembly.stats.chunks, 14);

    let config = ModelConfig::default();
    let datasets = FeatureBuilder::from_config(&config).build(&assembly.sessions).unwrap();
    assert_eq!(datasets.len(), 5);

    for (h, dataset) in datasets.iter().enumerate() {
        // every anchor whose target lies inside the 14 chunks
        assert_eq!(dataset.len(), 14 - h);
        // anchors are emitted in order, so row 8 is anchored at the ninth chunk
        let row = dataset.features(8);
        assert_eq!(row.len(), 62);
        let target = &assembly.sessions[&session("a")].chunks[&((8 + h as i64) * VD)];
        assert_eq!(row[61], target.size);
        assert_eq!(dataset.label(8), target.trans_time.unwrap());
    }
}

#[test]
fn test_single_chunk_session_pads_with_anchor_tcp_and_zeros() {
    let (sent, acked) = records(&session("b"), start(), 1);
    let source = MemoryTelemetrySource::new(sent, acked);
    let assembly = ChunkAssembler::new(VD).assemble(&source, &whole_day()).unwrap();
    let anchor = assembly.sessions[&session("b")].chunks[&0].clone();

    let datasets = FeatureBuilder::from_config(&ModelConfig::default()).build(&assembly.sessions).unwrap();
    assert_eq!(datasets[0].len(), 1);
    assert!(datasets[1..].iter().all(|d| d.is_empty()));

    let row = datasets[0].features(0);
    let tcp = anchor.tcp_features();
    for slot in 0..8 {
        let block = &row[slot * 7..slot * 7 + 7];
        assert_eq!(&block[..5], &tcp);
        assert_eq!(&block[5..], &[0.0, 0.0]);
    }
    assert_eq!(&row[56..61], &tcp);
    assert_eq!(row[61], anchor.size);
}

#[test]
fn test_discretization_boundaries() {
    let d = Discretizer::from_config(&ModelConfig::default());
    let cases = [(0.24, 0), (0.25, 1), (0.75, 2), (9.75, 20), (100.0, 20)];
    for (t, bin) in cases {
        assert_eq!(d.bin(t), bin, "t = {}", t);
    }
}

#[test]
fn test_normalizer_merge() {
    let mut norm = Normalizer::new(2);
    norm.observe(&[1.0, 2.0, 3.0, 4.0]).unwrap();
    norm.observe(&[5.0, 6.0]).unwrap();
    assert!((norm.mean()[0] - 3.0).abs() < 1e-12);
    assert!((norm.mean()[1] - 4.0).abs() < 1e-12);
    for s in norm.std() {
        assert!((s * s - 8.0 / 3.0).abs() < 1e-9);
    }
}

fn replay_source(end: DateTime<Utc>, days: i64) -> MemoryTelemetrySource {
    let mut sent = Vec::new();
    let mut acked = Vec::new();
    for d in 0..days {
        let day_start = end - Duration::days(d + 1);
        for s in 0..50 {
            let id = session(&format!("day{}-user{}", d, s));
            let (mut sn, mut ak) = records(&id, day_start + Duration::minutes(s), 12);
            sent.append(&mut sn);
            acked.append(&mut ak);
        }
    }
    MemoryTelemetrySource::new(sent, acked)
}

#[test]
fn test_replay_caps_bound_each_day_and_total() {
    let end = Utc.with_ymd_and_hms(2024, 5, 10, 11, 0, 0).unwrap();
    let source = replay_source(end, 3);
    let config = ModelConfig {
        cl_max_data_size: 1000,
        cl_max_days: 3,
        seed: Some(99),
        ..Default::default()
    };
    let sampler = ReplaySampler::from_config(&config);
    assert_eq!(sampler.day_caps(), vec![369, 332, 298]);

    let assembler = ChunkAssembler::new(VD);
    let builder = FeatureBuilder::from_config(&config);
    let first = sampler.sample(&source, &assembler, &builder, end).unwrap();
    let second = sampler.sample(&source, &assembler, &builder, end).unwrap();

    // 50 sessions of 12 chunks give 600 horizon-0 rows per day
    assert_eq!(first[0].len(), 369 + 332 + 298);
    assert!(first.iter().all(|d| d.len() <= 1000));
    assert_eq!(first, second);
}

#[test]
fn test_train_all_then_load_ensemble() {
    let dir = TempDir::new().unwrap();
    let config = ModelConfig {
        past_chunks: 2,
        future_chunks: 2,
        num_epochs_cold: 2,
        checkpoint: 1,
        lr: 1e-2,
        seed: Some(4),
        ..Default::default()
    };

    let mut sent = Vec::new();
    let mut acked = Vec::new();
    for s in 0..4 {
        let (mut sn, mut ak) = records(&session(&format!("u{}", s)), start(), 10);
        sent.append(&mut sn);
        acked.append(&mut ak);
    }
    let source = MemoryTelemetrySource::new(sent, acked);
    let assembly = ChunkAssembler::new(VD).assemble(&source, &whole_day()).unwrap();
    let datasets = FeatureBuilder::from_config(&config).build(&assembly.sessions).unwrap();

    let fitter = CandleFitter::new(config.clone(), TrainOptions::from_config(&config, false, false));
    let summaries = train_all(&fitter, &datasets, None, dir.path(), &AtomicBool::new(false)).unwrap();
    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|s| s.epochs == 2 && s.train_loss.is_finite()));

    for name in artifact::published_files(2) {
        assert!(dir.path().join(&name).is_file(), "missing {}", name);
    }

    let ensemble = TtpEnsemble::load(dir.path(), 2, Discretizer::from_config(&config)).unwrap();
    let x = datasets[1].features(0);
    let dist = ensemble.predict_distribution(1, x).unwrap();
    assert_eq!(dist.len(), 21);
    assert!((dist.iter().sum::<f64>() - 1.0).abs() < 1e-9);

    // the portable pair and the native artifact describe the same model
    let native = artifact::load_native(&dir.path().join("py-1.pt")).unwrap();
    let from_native = native.predict_distribution(x).unwrap();
    for (a, b) in dist.iter().zip(&from_native) {
        assert!((a - b).abs() < 1e-12);
    }
    let p = ensemble.predictor(1).unwrap();
    assert_eq!(p.normalizer(), native.normalizer());
    assert!(p.predict(x, PointEstimate::Median).unwrap() >= 0.0);
}
