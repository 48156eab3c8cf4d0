use itertools::{Itertools, MinMaxResult};
use serde::{Deserialize, Serialize};

use crate::{config::AnalysisConfig, telemetry::Sample};

use super::{
    recommendations,
    segmenter::{Direction, Section, SectionType},
};

/// Performance figures for one section. Speeds in km/h, time in seconds,
/// pedal figures in percent.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SectionMetrics {
    pub entry_speed: f32,
    pub exit_speed: f32,
    pub avg_speed: f32,
    pub min_speed: f32,
    pub max_speed: f32,
    pub time: f64,
    pub avg_g_lat: f32,
    pub avg_g_long: f32,
    pub max_g_lat: f32,
    pub max_g_long: f32,
    pub avg_brake_pct: f32,
    pub max_brake_pct: f32,
    pub avg_throttle_pct: f32,
    pub max_throttle_pct: f32,
    pub full_throttle_pct: f32,
    pub max_tires_out: i32,
    pub is_valid: bool,
    pub recommendation: Option<String>,
    pub recommended_speed: Option<f32>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnalyzedSection {
    pub section_id: u32,
    pub section_type: SectionType,
    pub direction: Option<Direction>,
    pub start_idx: usize,
    pub end_idx: usize,
    pub metrics: SectionMetrics,
}

impl AnalyzedSection {
    pub fn is_corner(&self) -> bool {
        self.section_type == SectionType::Corner
    }

    pub fn is_off_track_corner(&self) -> bool {
        self.is_corner() && !self.metrics.is_valid
    }
}

pub(crate) fn round_to(value: f32, decimals: i32) -> f32 {
    let factor = 10f32.powi(decimals);
    (value * factor).round() / factor
}

fn round_to_f64(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Mean of the values; absent when there are none.
pub(crate) fn mean(values: impl IntoIterator<Item = f32>) -> Option<f32> {
    let (sum, count) = values
        .into_iter()
        .fold((0f64, 0usize), |(sum, count), v| (sum + v as f64, count + 1));
    (count > 0).then(|| (sum / count as f64) as f32)
}

/// Largest of the values; absent when there are none.
pub(crate) fn peak(values: impl IntoIterator<Item = f32>) -> Option<f32> {
    values.into_iter().reduce(f32::max)
}

/// Entry speed to aim for in a corner the driver went off at.
///
/// Aims for the apex speed plus a margin when the driver did slow down for the
/// corner, otherwise for a fixed share of the entry speed. The result is never
/// at or above the entry speed.
pub fn recommended_entry_speed(entry_speed: f32, min_speed: f32, config: &AnalysisConfig) -> f32 {
    let fallback = round_to(entry_speed * config.fallback_entry_factor, 1);
    let recommended = if min_speed > 0. && min_speed < entry_speed {
        round_to(min_speed * config.apex_margin, 1)
    } else {
        fallback
    };
    if recommended >= entry_speed {
        fallback
    } else {
        recommended
    }
}

/// Metrics for one section, or `None` for a section without samples.
pub fn section_metrics(
    points: &[Sample],
    section_type: SectionType,
    config: &AnalysisConfig,
) -> Option<SectionMetrics> {
    let first = points.first()?;
    let last = points.last()?;

    let (min_speed, max_speed) = match points.iter().map(|p| p.speed).minmax_by(f32::total_cmp) {
        MinMaxResult::NoElements => return None,
        MinMaxResult::OneElement(v) => (v, v),
        MinMaxResult::MinMax(min, max) => (min, max),
    };
    let max_tires_out = points.iter().map(|p| p.tires_out).max().unwrap_or(0);
    let is_valid = max_tires_out <= config.offtrack_tires_out;

    let full_throttle = points
        .iter()
        .filter(|p| p.throttle >= config.full_throttle)
        .count();

    let (recommendation, recommended_speed) = if !is_valid && section_type == SectionType::Corner
    {
        (
            Some(recommendations::OFF_TRACK.to_string()),
            Some(recommended_entry_speed(first.speed, min_speed, config)),
        )
    } else {
        (None, None)
    };

    Some(SectionMetrics {
        entry_speed: round_to(first.speed, 2),
        exit_speed: round_to(last.speed, 2),
        avg_speed: round_to(mean(points.iter().map(|p| p.speed))?, 2),
        min_speed: round_to(min_speed, 2),
        max_speed: round_to(max_speed, 2),
        time: round_to_f64(last.timestamp - first.timestamp, 3),
        avg_g_lat: round_to(mean(points.iter().map(|p| p.g_lat.abs()))?, 2),
        avg_g_long: round_to(mean(points.iter().map(|p| p.g_long.abs()))?, 2),
        max_g_lat: round_to(peak(points.iter().map(|p| p.g_lat.abs()))?, 2),
        max_g_long: round_to(peak(points.iter().map(|p| p.g_long.abs()))?, 2),
        avg_brake_pct: round_to(mean(points.iter().map(|p| p.brake * 100.))?, 1),
        max_brake_pct: round_to(peak(points.iter().map(|p| p.brake * 100.))?, 1),
        avg_throttle_pct: round_to(mean(points.iter().map(|p| p.throttle * 100.))?, 1),
        max_throttle_pct: round_to(peak(points.iter().map(|p| p.throttle * 100.))?, 1),
        full_throttle_pct: round_to(full_throttle as f32 * 100. / points.len() as f32, 1),
        max_tires_out,
        is_valid,
        recommendation,
        recommended_speed,
    })
}

pub fn analyze_sections(sections: &[Section], config: &AnalysisConfig) -> Vec<AnalyzedSection> {
    sections
        .iter()
        .filter_map(|section| {
            let metrics = section_metrics(&section.points, section.section_type, config)?;
            Some(AnalyzedSection {
                section_id: section.id,
                section_type: section.section_type,
                direction: section.direction,
                start_idx: section.start_idx,
                end_idx: section.end_idx,
                metrics,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(timestamp: f64, speed: f32, tires_out: i32) -> Sample {
        Sample {
            timestamp,
            speed,
            tires_out,
            g_lat: 1.0,
            throttle: 0.5,
            ..Default::default()
        }
    }

    fn section(points: Vec<Sample>, section_type: SectionType) -> Section {
        Section {
            id: 1,
            section_type,
            direction: Some(Direction::Right),
            start_idx: 0,
            end_idx: points.len() - 1,
            points,
        }
    }

    #[test]
    fn test_apex_based_recommendation() {
        let config = AnalysisConfig::default();
        assert_eq!(recommended_entry_speed(120., 80., &config), 92.0);
    }

    #[test]
    fn test_never_slowed_falls_back_to_entry_share() {
        let config = AnalysisConfig::default();
        assert_eq!(recommended_entry_speed(100., 0., &config), 85.0);
    }

    #[test]
    fn test_recommendation_clamped_below_entry() {
        let config = AnalysisConfig::default();
        // 95 * 1.15 would be above the 100 km/h entry
        assert_eq!(recommended_entry_speed(100., 95., &config), 85.0);
        // entry was the slowest point of the corner
        assert_eq!(recommended_entry_speed(60., 60., &config), 51.0);
    }

    #[test]
    fn test_off_track_corner_metrics() {
        let points = vec![
            point(10.0, 120., 0),
            point(10.1, 100., 3),
            point(10.2, 80., 4),
            point(10.3, 95., 1),
        ];
        let analyzed = analyze_sections(
            &[section(points, SectionType::Corner)],
            &AnalysisConfig::default(),
        );
        let metrics = &analyzed[0].metrics;

        assert!(!metrics.is_valid);
        assert!(analyzed[0].is_off_track_corner());
        assert_eq!(metrics.max_tires_out, 4);
        assert_eq!(metrics.entry_speed, 120.);
        assert_eq!(metrics.exit_speed, 95.);
        assert_eq!(metrics.min_speed, 80.);
        assert_eq!(metrics.max_speed, 120.);
        assert_eq!(metrics.avg_speed, 98.75);
        assert_eq!(metrics.time, 0.3);
        assert_eq!(metrics.recommended_speed, Some(92.0));
        assert!(metrics.recommendation.is_some());
    }

    #[test]
    fn test_two_tires_out_is_still_valid() {
        let points = vec![point(0., 100., 2), point(0.1, 90., 2)];
        let analyzed = analyze_sections(
            &[section(points, SectionType::Corner)],
            &AnalysisConfig::default(),
        );
        assert!(analyzed[0].metrics.is_valid);
        assert_eq!(analyzed[0].metrics.recommended_speed, None);
    }

    #[test]
    fn test_off_track_straight_has_no_recommendation() {
        let points = vec![point(0., 200., 4), point(0.1, 210., 4)];
        let analyzed = analyze_sections(
            &[section(points, SectionType::Straight)],
            &AnalysisConfig::default(),
        );
        assert!(!analyzed[0].metrics.is_valid);
        assert!(!analyzed[0].is_off_track_corner());
        assert_eq!(analyzed[0].metrics.recommended_speed, None);
    }

    #[test]
    fn test_pedal_figures_are_percentages() {
        let mut points = vec![point(0., 100., 0), point(0.1, 100., 0)];
        points[0].throttle = 1.0;
        points[1].brake = 0.4;
        points[1].throttle = 0.;
        let metrics = section_metrics(&points, SectionType::Straight, &AnalysisConfig::default())
            .unwrap();
        assert_eq!(metrics.max_throttle_pct, 100.);
        assert_eq!(metrics.avg_throttle_pct, 50.);
        assert_eq!(metrics.full_throttle_pct, 50.);
        assert_eq!(metrics.max_brake_pct, 40.);
        assert_eq!(metrics.avg_brake_pct, 20.);
    }

    #[test]
    fn test_single_point_section_has_zero_time() {
        let metrics = section_metrics(
            &[point(5.0, 70., 0)],
            SectionType::Corner,
            &AnalysisConfig::default(),
        )
        .unwrap();
        assert_eq!(metrics.time, 0.);
        assert_eq!(metrics.min_speed, metrics.max_speed);
    }

    #[test]
    fn test_folds_of_nothing_are_absent() {
        assert_eq!(mean(Vec::<f32>::new()), None);
        assert_eq!(peak(Vec::<f32>::new()), None);
        assert_eq!(mean([1., 2., 3.]), Some(2.));
        assert!(section_metrics(&[], SectionType::Straight, &AnalysisConfig::default()).is_none());
    }
}
