//! Setpoint ramps swept during a sink test

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A commanded value at a position in the sweep
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Setpoint {
    /// Position in the sweep, which is also the number of steps since the start
    pub index: usize,

    /// Target value to write to the device
    pub value: f64,
}

/// Linear sweep from `start` to `end` over `duration_s`, advancing every `step_s`
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct RampConfig {
    pub start: f64,
    pub end: f64,
    pub duration_s: f64,
    pub step_s: f64,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 1.0,
            duration_s: 10.0,
            step_s: 0.5,
        }
    }
}

impl RampConfig {
    pub fn new(start: f64, end: f64, duration_s: f64, step_s: f64) -> Self {
        Self {
            start,
            end,
            duration_s,
            step_s,
        }
    }

    /// Number of whole step intervals that fit in the duration.
    /// Zero for a non-positive or non-finite interval.
    pub fn step_count(&self) -> usize {
        if !(self.step_s > 0.0) || !self.step_s.is_finite() || !(self.duration_s > 0.0) {
            return 0;
        }

        // Absorb float error so that e.g. 0.3 / 0.1 lands on 3, not 2
        let n = self.duration_s / self.step_s + 1e-9;
        if !n.is_finite() {
            return 0;
        }
        n.floor() as usize
    }

    /// Change in value over the whole sweep
    pub fn delta(&self) -> f64 {
        self.end - self.start
    }

    /// Time between setpoints, if the interval is usable as a timer period
    pub fn step_period(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.step_s)
            .ok()
            .filter(|d| !d.is_zero())
    }
}

/// Precomputed sequence of setpoints for one ramp configuration.
///
/// The points are only replaced wholesale by [Ramp::update];
/// a degenerate configuration leaves the previous sequence in place.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Ramp {
    cfg: Option<RampConfig>,
    points: Vec<Setpoint>,
}

impl Ramp {
    /// Generate a ramp, which will be empty if the configuration is degenerate
    pub fn new(cfg: &RampConfig) -> Self {
        let mut ramp = Self::default();
        ramp.update(cfg);
        ramp
    }

    /// Regenerate the setpoints for a new configuration.
    ///
    /// Returns `false` without touching the existing points if the configuration
    /// has no whole steps or no change in value.
    pub fn update(&mut self, cfg: &RampConfig) -> bool {
        let n = cfg.step_count();
        let delta = cfg.delta();
        if n == 0 || delta == 0.0 || !delta.is_finite() {
            debug!(?cfg, "Ignoring degenerate ramp configuration");
            return false;
        }

        self.points = (0..=n)
            .map(|i| Setpoint {
                index: i,
                value: cfg.start + (i as f64) * delta / (n as f64),
            })
            .collect();
        self.cfg = Some(*cfg);

        debug!(steps = n, "Generated ramp");
        true
    }

    /// The configuration that produced the current points, if any
    pub fn config(&self) -> Option<&RampConfig> {
        self.cfg.as_ref()
    }

    pub fn points(&self) -> &[Setpoint] {
        &self.points
    }

    pub fn get(&self, index: usize) -> Option<&Setpoint> {
        self.points.get(index)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_steps_at_half_second() {
        let ramp = Ramp::new(&RampConfig::new(0.0, 10.0, 2.0, 0.5));

        let values: Vec<f64> = ramp.points().iter().map(|p| p.value).collect();
        assert_eq!(values, vec![0.0, 2.5, 5.0, 7.5, 10.0]);

        let indices: Vec<usize> = ramp.points().iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn descending_ramp_is_monotonic() {
        let ramp = Ramp::new(&RampConfig::new(3.0, 1.0, 5.0, 1.0));
        assert_eq!(ramp.len(), 6);
        assert!(ramp.points().windows(2).all(|w| w[1].value < w[0].value));
        assert_eq!(ramp.points().first().unwrap().value, 3.0);
        assert_eq!(ramp.points().last().unwrap().value, 1.0);
    }

    #[test]
    fn partial_steps_are_truncated() {
        let cfg = RampConfig::new(0.0, 1.0, 1.2, 0.5);
        assert_eq!(cfg.step_count(), 2);

        // Float division that lands just under a whole number still counts the step
        let cfg = RampConfig::new(0.0, 1.0, 0.3, 0.1);
        assert_eq!(cfg.step_count(), 3);
    }

    #[test]
    fn degenerate_requests_keep_previous_ramp() {
        let mut ramp = Ramp::new(&RampConfig::new(0.0, 10.0, 2.0, 0.5));
        let before = ramp.clone();

        assert!(!ramp.update(&RampConfig::new(0.0, 10.0, 0.0, 0.5)));
        assert_eq!(ramp, before);

        assert!(!ramp.update(&RampConfig::new(4.0, 4.0, 2.0, 0.5)));
        assert_eq!(ramp, before);

        assert!(!ramp.update(&RampConfig::new(0.0, 10.0, 2.0, 0.0)));
        assert_eq!(ramp, before);

        assert!(!ramp.update(&RampConfig::new(0.0, 10.0, 0.4, 0.5)));
        assert_eq!(ramp, before);
    }

    #[test]
    fn degenerate_initial_ramp_is_empty() {
        let ramp = Ramp::new(&RampConfig::new(1.0, 1.0, 2.0, 0.5));
        assert!(ramp.is_empty());
        assert!(ramp.config().is_none());
    }

    #[test]
    fn step_period() {
        assert_eq!(
            RampConfig::new(0.0, 1.0, 1.0, 0.25).step_period(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(RampConfig::new(0.0, 1.0, 1.0, 0.0).step_period(), None);
        assert_eq!(RampConfig::new(0.0, 1.0, 1.0, -1.0).step_period(), None);
    }
}
