use log::debug;
use serde::{Deserialize, Serialize};
use uom::si::{
    angle::{degree, radian},
    f32::Angle,
};

use crate::{config::SegmenterConfig, telemetry::Sample};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SectionType {
    Straight,
    Corner,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Left,
    Right,
}

/// A contiguous run of same-classification samples within one lap.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Section {
    /// 1-based position of the section in the lap
    pub id: u32,
    pub section_type: SectionType,
    /// Set for corners only
    pub direction: Option<Direction>,
    pub start_idx: usize,
    /// Inclusive
    pub end_idx: usize,
    pub points: Vec<Sample>,
}

impl Section {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn is_corner(&self) -> bool {
        self.section_type == SectionType::Corner
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Run {
    section_type: SectionType,
    direction: Option<Direction>,
    start: usize,
    end: usize,
}

impl Run {
    fn starting_at(idx: usize, (section_type, direction): (SectionType, Option<Direction>)) -> Self {
        Self {
            section_type,
            direction,
            start: idx,
            end: idx,
        }
    }

    fn len(&self) -> usize {
        self.end - self.start + 1
    }

    fn same_kind(&self, other: &Run) -> bool {
        self.section_type == other.section_type && self.direction == other.direction
    }
}

/// Classify one sample as straight or corner. Corners turn right when the
/// lateral acceleration is positive.
pub fn classify(sample: &Sample, config: &SegmenterConfig) -> (SectionType, Option<Direction>) {
    let steering_deg = Angle::new::<radian>(sample.steering).get::<degree>().abs();
    if sample.g_lat.abs() > config.corner_g_lat || steering_deg > config.corner_steering_deg {
        let direction = if sample.g_lat > 0. {
            Direction::Right
        } else {
            Direction::Left
        };
        (SectionType::Corner, Some(direction))
    } else {
        (SectionType::Straight, None)
    }
}

/// First pass: group consecutive samples by classification and fold runs
/// shorter than the minimum length into their neighbours.
fn group_runs(samples: &[Sample], config: &SegmenterConfig) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    let Some(first) = samples.first() else {
        return runs;
    };
    let mut current = Run::starting_at(0, classify(first, config));

    for (idx, sample) in samples.iter().enumerate().skip(1) {
        let kind = classify(sample, config);
        if kind.0 == current.section_type {
            if kind.1 != current.direction {
                // A corner changing direction is a real chicane, however short.
                runs.push(current);
                current = Run::starting_at(idx, kind);
            } else {
                current.end = idx;
            }
            continue;
        }

        if current.len() >= config.min_section_samples {
            runs.push(current);
            current = Run::starting_at(idx, kind);
        } else if let Some(previous) = runs.last_mut() {
            previous.end = idx - 1;
            current = Run::starting_at(idx, kind);
        } else {
            // Nothing before this noise yet: the next run absorbs it.
            current = Run {
                end: idx,
                ..Run::starting_at(current.start, kind)
            };
        }
    }

    match runs.last_mut() {
        Some(previous) if current.len() < config.min_section_samples => {
            previous.end = current.end;
        }
        _ => runs.push(current),
    }
    runs
}

/// Second pass: cluster runs left to right. A cluster keeps its own type and
/// direction while it absorbs neighbours.
fn merge_runs(runs: &[Run], config: &SegmenterConfig) -> Vec<Run> {
    let mut merged = Vec::with_capacity(runs.len());
    let Some(first) = runs.first() else {
        return merged;
    };
    let mut cluster = *first;

    for (i, next) in runs.iter().enumerate().skip(1) {
        let after = runs.get(i + 1);
        let should_merge = if cluster.same_kind(next) {
            true
        } else {
            match (cluster.section_type, next.section_type) {
                (SectionType::Corner, SectionType::Straight) => {
                    next.len() < config.max_corner_gap_samples
                        && after.is_some_and(|a| {
                            a.section_type == SectionType::Corner
                                && a.direction == cluster.direction
                        })
                }
                (SectionType::Straight, SectionType::Corner) => {
                    next.len() < config.max_straight_wobble_samples
                        && after.is_some_and(|a| a.section_type == SectionType::Straight)
                }
                _ => false,
            }
        };

        if should_merge {
            cluster.end = next.end;
        } else {
            merged.push(cluster);
            cluster = *next;
        }
    }
    merged.push(cluster);
    merged
}

/// Split one lap's samples into an ordered cover of straights and corners.
pub fn segment_lap(samples: &[Sample], config: &SegmenterConfig) -> Vec<Section> {
    let runs = group_runs(samples, config);
    let merged = merge_runs(&runs, config);
    debug!(
        "Segmented {} samples into {} raw and {} merged sections",
        samples.len(),
        runs.len(),
        merged.len()
    );

    merged
        .into_iter()
        .enumerate()
        .map(|(i, run)| Section {
            id: i as u32 + 1,
            section_type: run.section_type,
            direction: run.direction,
            start_idx: run.start,
            end_idx: run.end,
            points: samples[run.start..=run.end].to_vec(),
        })
        .collect()
}
