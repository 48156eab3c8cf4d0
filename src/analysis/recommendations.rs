//! Coaching text shown to the driver after a session.

use itertools::Itertools;

use crate::store::RecordsBroken;

pub(crate) const OFF_TRACK: &str = "Went off track";

pub(crate) fn unavailable(cause: &str) -> String {
    format!("analysis unavailable: {}", cause)
}

pub(crate) fn not_enough_laps(min_laps: usize) -> String {
    let word = if min_laps == 1 { "lap" } else { "laps" };
    format!(
        "Complete at least {} {} for a detailed analysis",
        min_laps, word
    )
}

pub(crate) fn no_complete_laps() -> String {
    "No complete laps found. Make sure to cross the finish line.".to_string()
}

pub(crate) fn records_broken(best_lap_time: f64, broken: &RecordsBroken) -> String {
    let mut message = "New personal records set! ".to_string();
    if broken.lap {
        message.push_str(&format!("Best lap: {:.3}s. ", best_lap_time));
    }
    if !broken.sectors.is_empty() {
        message.push_str(&format!(
            "Improved sectors: {}. ",
            broken.sectors.iter().map(|s| format!("S{}", s)).join(", ")
        ));
    }
    if !broken.sections.is_empty() {
        message.push_str(&format!("{} sections improved.", broken.sections.len()));
    }
    message.trim_end().to_string()
}

pub(crate) fn off_track_corner(corner: usize, entry_speed: f32, recommended_speed: f32) -> String {
    format!(
        "Corner {}: you went off track at {:.0} km/h. Brake earlier to stay on track, \
         recommended entry speed: {:.0} km/h.",
        corner, entry_speed, recommended_speed
    )
}

pub(crate) fn slower_apex(corner: usize, delta_kmh: f32) -> String {
    format!(
        "Corner {}: your apex speed was {:.1} km/h slower than on your best lap. \
         Carry more speed through the corner or adjust your line.",
        corner, delta_kmh
    )
}

pub(crate) fn tire_cold(tire: &str, temp: f32, (low, high): (f32, f32)) -> String {
    format!(
        "{} tire: {:.1}°C is below the optimal range ({}-{}°C). \
         Consider a more aggressive pace or pressure changes.",
        tire, temp, low, high
    )
}

pub(crate) fn tire_hot(tire: &str, temp: f32, (low, high): (f32, f32)) -> String {
    format!(
        "{} tire: {:.1}°C is above the optimal range ({}-{}°C). \
         You may be overloading this tire. Consider smoother inputs or lower pressure.",
        tire, temp, low, high
    )
}

pub(crate) fn front_imbalance(diff: f32) -> String {
    format!(
        "Front tire temperature imbalance of {:.1}°C. \
         Check your cornering line, you may be loading one side more than the other.",
        diff
    )
}

pub(crate) fn rear_imbalance(diff: f32) -> String {
    format!(
        "Rear tire temperature imbalance of {:.1}°C. \
         This can point to setup issues or inconsistent corner exits.",
        diff
    )
}

pub(crate) fn consistency(variation_pct: f64) -> String {
    if variation_pct < 1. {
        format!(
            "Excellent consistency! Your lap times vary by only {:.2}%. \
             Keep this rhythm and look for small gains.",
            variation_pct
        )
    } else if variation_pct < 2. {
        format!(
            "Good consistency with {:.2}% variation. \
             Keep it up while you look for faster laps.",
            variation_pct
        )
    } else {
        format!(
            "Lap time variation is {:.2}%. \
             Work on consistency before chasing faster laps.",
            variation_pct
        )
    }
}

pub(crate) fn sector_lost(sector: usize, diff: f64) -> String {
    format!(
        "Sector {}: you lost {:.3}s compared to your best lap. Review this part of the track.",
        sector, diff
    )
}

pub(crate) fn sector_gained(sector: usize, diff: f64) -> String {
    format!(
        "Sector {}: you gained {:.3}s! Great improvement here.",
        sector, diff
    )
}
