//! Human-emulation plans.
//!
//! A plan is sampled once per attempt and then replayed against a page by the
//! browser client.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::identity::Viewport;
use crate::timing::HumanDelay;

/// Bounds for the randomized interaction performed before extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulationSettings {
    /// Number of scroll passes, inclusive range.
    pub scroll_steps: (u32, u32),
    /// Pixels per scroll pass, inclusive range.
    pub scroll_distance: (i64, i64),
    /// Pause after each scroll pass.
    pub scroll_pause: HumanDelay,
    /// Number of pointer waypoints, inclusive range.
    pub pointer_moves: (u32, u32),
    /// Pause between pointer waypoints.
    pub pointer_pause: HumanDelay,
    /// Final "reading" delay before the DOM is read.
    pub reading_delay: HumanDelay,
}

impl Default for EmulationSettings {
    fn default() -> Self {
        Self {
            scroll_steps: (2, 5),
            scroll_distance: (180, 620),
            scroll_pause: HumanDelay::new(250, 1_200),
            pointer_moves: (3, 7),
            pointer_pause: HumanDelay::new(80, 200),
            reading_delay: HumanDelay::new(2_000, 5_000),
        }
    }
}

/// One step of a plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gesture {
    /// Scroll the window by `dy` pixels.
    Scroll { dy: i64 },
    /// Move the pointer to a viewport coordinate.
    Pointer { x: f64, y: f64 },
    Pause(Duration),
}

/// A sampled gesture sequence, always ending with the reading pause.
#[derive(Debug, Clone, PartialEq)]
pub struct EmulationPlan {
    pub gestures: Vec<Gesture>,
}

impl EmulationPlan {
    /// Samples a plan for the given viewport.
    pub fn sample<R: Rng + ?Sized>(
        settings: &EmulationSettings,
        viewport: Viewport,
        rng: &mut R,
    ) -> Self {
        let mut gestures = Vec::new();

        let passes = range_u32(rng, settings.scroll_steps);
        for _ in 0..passes {
            let (lo, hi) = ordered(settings.scroll_distance);
            gestures.push(Gesture::Scroll {
                dy: rng.gen_range(lo..=hi),
            });
            gestures.push(Gesture::Pause(settings.scroll_pause.sample(rng)));
        }

        let moves = range_u32(rng, settings.pointer_moves);
        let width = f64::from(viewport.width.max(2));
        let height = f64::from(viewport.height.max(2));
        let mut from = (width / 2.0, height / 2.0);
        for _ in 0..moves {
            let to = (
                rng.gen_range(width * 0.05..width * 0.95),
                rng.gen_range(height * 0.05..height * 0.95),
            );
            for (x, y) in pointer_path(from, to, 4) {
                gestures.push(Gesture::Pointer { x, y });
            }
            gestures.push(Gesture::Pause(settings.pointer_pause.sample(rng)));
            from = to;
        }

        gestures.push(Gesture::Pause(settings.reading_delay.sample(rng)));
        Self { gestures }
    }

    /// Sum of all pauses in the plan.
    pub fn total_pause(&self) -> Duration {
        self.gestures
            .iter()
            .filter_map(|g| match g {
                Gesture::Pause(d) => Some(*d),
                _ => None,
            })
            .sum()
    }
}

/// Evenly spaced points from `from` (exclusive) to `to` (inclusive).
pub fn pointer_path(from: (f64, f64), to: (f64, f64), steps: usize) -> Vec<(f64, f64)> {
    let steps = steps.max(1);
    (1..=steps)
        .map(|i| {
            let t = i as f64 / steps as f64;
            (from.0 + (to.0 - from.0) * t, from.1 + (to.1 - from.1) * t)
        })
        .collect()
}

fn range_u32<R: Rng + ?Sized>(rng: &mut R, bounds: (u32, u32)) -> u32 {
    let (lo, hi) = ordered(bounds);
    rng.gen_range(lo..=hi)
}

fn ordered<T: PartialOrd>(bounds: (T, T)) -> (T, T) {
    if bounds.0 <= bounds.1 {
        bounds
    } else {
        (bounds.1, bounds.0)
    }
}
