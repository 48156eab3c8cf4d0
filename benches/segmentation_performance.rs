use criterion::{Criterion, black_box, criterion_group, criterion_main};
use lapcoach::analysis::{analyze_sections, segment_lap};
use lapcoach::config::{AnalysisConfig, SegmenterConfig};
use lapcoach::store::LapId;
use lapcoach::telemetry::{SessionKind, SimStatus, Wheels};
use lapcoach::{CoachConfig, InMemoryStore, LapSessionTracker, Sample, SourceSnapshot};
use std::time::Duration;

/// Lateral g and steering of a circuit with a corner every 150 samples,
/// alternating direction, with some single sample noise on the straights.
fn cornering(i: usize) -> (f32, f32) {
    let phase = i % 150;
    let sign = if (i / 150) % 2 == 0 { 1. } else { -1. };
    match phase {
        100..140 => (1.3 * sign, 0.25 * sign),
        30 | 61 => (0.4, 0.),
        _ => (0.03, 0.01),
    }
}

fn create_lap(len: usize) -> Vec<Sample> {
    (0..len)
        .map(|i| {
            let (g_lat, steering) = cornering(i);
            Sample {
                lap_id: LapId(1),
                timestamp: i as f64 * 0.1,
                speed: 120. + (i % 150) as f32 * 0.5,
                g_lat,
                steering,
                throttle: 0.8,
                tire_temp: Wheels::splat(85.),
                ..Default::default()
            }
        })
        .collect()
}

fn create_session(laps: i32, samples_per_lap: usize) -> Vec<SourceSnapshot> {
    (0..laps)
        .flat_map(|lap| {
            (0..samples_per_lap).map(move |i| {
                let (g_lat, steering_rad) = cornering(i);
                SourceSnapshot {
                    status: SimStatus::Live,
                    session_kind: SessionKind::Race,
                    track_name: "monza".to_string(),
                    car_name: "ks_ferrari_488_gt3".to_string(),
                    completed_laps: lap,
                    last_lap_time_ms: if lap > 0 { 100_000 } else { 0 },
                    is_valid_lap: true,
                    current_sector_index: (i * 3 / samples_per_lap) as i32,
                    last_sector_time_ms: 33_000,
                    speed_kmh: 150.,
                    g_lat,
                    steering_rad,
                    timestamp_s: i as f64 * 0.1,
                    ..Default::default()
                }
            })
        })
        .collect()
}

fn bench_segmentation(c: &mut Criterion) {
    let mut group = c.benchmark_group("segmentation");
    let config = SegmenterConfig::default();

    for len in [1_000, 10_000] {
        let lap = create_lap(len);
        group.bench_function(format!("segment_lap_{}_samples", len), |b| {
            b.iter(|| black_box(segment_lap(black_box(&lap), &config)));
        });
    }

    let lap = create_lap(1_000);
    let sections = segment_lap(&lap, &config);
    let analysis_config = AnalysisConfig::default();
    group.bench_function("analyze_sections_1000_samples", |b| {
        b.iter(|| black_box(analyze_sections(black_box(&sections), &analysis_config)));
    });

    group.finish();
}

fn bench_tracker(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker");
    let snapshots = create_session(5, 1_000);

    group.bench_function("process_5_laps_in_memory", |b| {
        b.iter(|| {
            let mut tracker = LapSessionTracker::new(InMemoryStore::new(), CoachConfig::default());
            for snapshot in &snapshots {
                black_box(tracker.process(snapshot));
            }
            black_box(tracker.shutdown())
        });
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(50);
    targets = bench_segmentation, bench_tracker
}
criterion_main!(benches);
