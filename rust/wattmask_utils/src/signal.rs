// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Signal generation
//!
//! [`SignalGenerator`] is a stateful source of bounded waveforms used for
//! mask targets: gaussian noise, piecewise-uniform noise, sinusoids, and
//! noisy sinusoids. Four parameters configure a generator; their meaning
//! depends on the waveform:
//!
//! | Waveform  | value                            | p1     | p2        | p3        | p4      |
//! |-----------|----------------------------------|--------|-----------|-----------|---------|
//! | Normal    | N(p1, p2)                        | mean   | stddev    | -         | -       |
//! | Uniform   | U[p1, p2]                        | lower  | upper     | -         | -       |
//! | Sine      | p1 + p3 sin(2 pi p2 t)           | offset | frequency | amplitude | -       |
//! | GaussSine | Sine + N(0, p4)                  | offset | frequency | amplitude | stddev  |
//!
//! Generated values always stay inside the generator's `[min_val, max_val]`
//! bounds. Each parameter can optionally be re-drawn from a uniform range;
//! parameters and ranges are sanitized against the bounds and against the
//! sampling frequency after every change.

use anyhow::bail;
use anyhow::Result;
use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;
use rand_distr::Distribution;
use rand_distr::Normal;

/// A sinusoid must complete at least this many cycles while its properties
/// are held, which caps its frequency at sample_freq / MIN_SINE_CYCLES.
pub const MIN_SINE_CYCLES: f64 = 4.0;

/// Bounds of the discrete uniform distribution mask generators draw their
/// property hold periods from, in planner invocations.
pub const PROP_HOLD_MIN: u32 = 12;
pub const PROP_HOLD_MAX: u32 = 125;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Waveform {
    Normal,
    Uniform,
    Sine,
    GaussSine,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Param {
    One,
    Two,
    Three,
    Four,
}

impl Param {
    pub const ALL: [Param; 4] = [Param::One, Param::Two, Param::Three, Param::Four];

    fn idx(self) -> usize {
        match self {
            Param::One => 0,
            Param::Two => 1,
            Param::Three => 2,
            Param::Four => 3,
        }
    }
}

#[derive(Debug)]
pub struct SignalGenerator {
    waveform: Waveform,
    min_val: f64,
    max_val: f64,
    params: [f64; 4],
    /// Uniform re-draw ranges, active when the matching flag is set.
    ranges: [(f64, f64); 4],
    randomize: [bool; 4],
    time: f64,
    sample_freq: f64,
    rng: SmallRng,
}

impl SignalGenerator {
    /// Build a generator for the given waveform and bounds. `tick_ms` is the
    /// runtime's sampling interval; the sinusoid time base advances at
    /// 1000 / (3 * tick_ms) Hz, one third of the sampling frequency, keeping
    /// a 3x oversampling margin over the Nyquist limit.
    pub fn new(
        waveform: Waveform,
        tick_ms: u64,
        min_val: f64,
        max_val: f64,
        params: [f64; 4],
    ) -> Result<Self> {
        Self::with_rng(
            waveform,
            tick_ms,
            min_val,
            max_val,
            params,
            SmallRng::from_entropy(),
        )
    }

    /// Deterministic variant for tests.
    pub fn with_seed(
        waveform: Waveform,
        tick_ms: u64,
        min_val: f64,
        max_val: f64,
        params: [f64; 4],
        seed: u64,
    ) -> Result<Self> {
        Self::with_rng(
            waveform,
            tick_ms,
            min_val,
            max_val,
            params,
            SmallRng::seed_from_u64(seed),
        )
    }

    fn with_rng(
        waveform: Waveform,
        tick_ms: u64,
        min_val: f64,
        max_val: f64,
        params: [f64; 4],
        rng: SmallRng,
    ) -> Result<Self> {
        if min_val > max_val {
            bail!("Min {} should be smaller than max {}", min_val, max_val);
        }
        if tick_ms == 0 {
            bail!("Sampling interval must be nonzero");
        }
        let mut gen = Self {
            waveform,
            min_val,
            max_val,
            params,
            ranges: [(0.0, 0.0); 4],
            randomize: [false; 4],
            time: 0.0,
            sample_freq: 1000.0 / (3.0 * tick_ms as f64),
            rng,
        };
        gen.sanitize_params();
        Ok(gen)
    }

    pub fn waveform(&self) -> Waveform {
        self.waveform
    }

    pub fn sample_freq(&self) -> f64 {
        self.sample_freq
    }

    pub fn param(&self, p: Param) -> f64 {
        self.params[p.idx()]
    }

    pub fn params(&self) -> [f64; 4] {
        self.params
    }

    /// The range a parameter may be re-drawn from. A parameter that is not
    /// randomized reports its current value as a degenerate range.
    pub fn param_range(&self, p: Param) -> (f64, f64) {
        if self.randomize[p.idx()] {
            self.ranges[p.idx()]
        } else {
            (self.params[p.idx()], self.params[p.idx()])
        }
    }

    /// Enable random re-draws of a parameter from the given range.
    pub fn enable_randomized_param(&mut self, p: Param, range: (f64, f64)) -> Result<()> {
        self.randomize[p.idx()] = true;
        self.set_param_range(p, range)
    }

    pub fn set_param_range(&mut self, p: Param, range: (f64, f64)) -> Result<()> {
        self.ranges[p.idx()] = self.sanitize_range(p, range)?;
        Ok(())
    }

    /// Draw a fresh value for a randomized parameter from its range and
    /// re-apply sanitization. Parameters without the randomize flag keep
    /// their value.
    pub fn select_new_val_for_param(&mut self, p: Param) {
        if !self.randomize[p.idx()] {
            return;
        }
        let (lo, hi) = self.ranges[p.idx()];
        let val = self.rng.gen_range(lo..=hi);
        self.set_param(p, val);
    }

    pub fn set_param(&mut self, p: Param, val: f64) {
        self.params[p.idx()] = val;
        self.sanitize_params();
    }

    /// Produce the next value of the waveform, clamped to the generator
    /// bounds. Sinusoid time advances by one sample per call.
    pub fn next_value(&mut self) -> f64 {
        let [p1, p2, p3, p4] = self.params;
        let new_value = match self.waveform {
            Waveform::Normal => self.gauss(p1, p2),
            Waveform::Uniform => self.rng.gen_range(p1..=p2),
            Waveform::Sine | Waveform::GaussSine => {
                let mut v = p1 + p3 * (2.0 * std::f64::consts::PI * p2 * self.time).sin();
                self.time += 1.0 / self.sample_freq;
                if self.waveform == Waveform::GaussSine {
                    v += self.gauss(0.0, p4);
                }
                v
            }
        };
        new_value.clamp(self.min_val, self.max_val)
    }

    fn gauss(&mut self, mean: f64, stddev: f64) -> f64 {
        if stddev > 0.0 {
            // The stddev is sanitized nonnegative, so construction cannot
            // fail here.
            match Normal::new(mean, stddev) {
                Ok(dist) => dist.sample(&mut self.rng),
                Err(_) => mean,
            }
        } else {
            mean
        }
    }

    fn min_sine_freq(&self) -> f64 {
        self.sample_freq / PROP_HOLD_MAX as f64
    }

    fn max_sine_freq(&self) -> f64 {
        self.sample_freq / MIN_SINE_CYCLES
    }

    /// Re-establish the parameter invariants after any change:
    /// p1 stays inside the bounds, sinusoid frequency stays between the
    /// slowest property-hold-visible cycle and the oversampling limit, the
    /// sinusoid peak-to-peak span fits the bounds, and a uniform range stays
    /// ordered inside the bounds (collapsing to the full bounds if it
    /// degenerates).
    fn sanitize_params(&mut self) {
        self.params[0] = self.params[0].clamp(self.min_val, self.max_val);

        match self.waveform {
            Waveform::Sine | Waveform::GaussSine => {
                self.params[1] = self.params[1].min(self.max_sine_freq());
                self.params[1] = self.params[1].max(self.min_sine_freq());

                let p1 = self.params[0];
                let p3 = self.params[2];
                if p1 + p3 > self.max_val && p1 - p3 < self.min_val {
                    self.params[2] = (self.max_val - p1).min(p1 - self.min_val);
                } else if p1 + p3 > self.max_val {
                    self.params[2] = self.max_val - p1;
                } else if p1 - p3 < self.min_val {
                    self.params[2] = p1 - self.min_val;
                }
            }
            Waveform::Uniform => {
                self.params[1] = self.params[1].max(self.params[0]);
                self.params[1] = self.params[1].min(self.max_val);
                if self.params[1] == self.params[0] {
                    self.params[0] = self.min_val;
                    self.params[1] = self.max_val;
                }
            }
            Waveform::Normal => {}
        }
    }

    fn sanitize_range(&self, p: Param, range: (f64, f64)) -> Result<(f64, f64)> {
        let (mut lo, mut hi) = range;
        if lo > hi {
            bail!("Range min {} should be smaller than max {}", lo, hi);
        }

        let value_like = matches!(p, Param::One | Param::Three)
            || (p == Param::Two && self.waveform == Waveform::Uniform);
        let freq_like = p == Param::Two
            && matches!(self.waveform, Waveform::Sine | Waveform::GaussSine);

        if value_like {
            lo = lo.clamp(self.min_val, self.max_val);
            hi = hi.clamp(self.min_val, self.max_val);
        } else if freq_like {
            lo = lo.clamp(self.min_sine_freq(), self.max_sine_freq());
            hi = hi.clamp(self.min_sine_freq(), self.max_sine_freq());
        }

        Ok((lo, hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK_MS: u64 = 20;

    fn make(waveform: Waveform, min: f64, max: f64, params: [f64; 4]) -> SignalGenerator {
        SignalGenerator::with_seed(waveform, TICK_MS, min, max, params, 42).unwrap()
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        assert!(SignalGenerator::new(Waveform::Normal, TICK_MS, 10.0, 0.0, [0.0; 4]).is_err());
    }

    #[test]
    fn values_stay_in_bounds() {
        let cases = [
            make(Waveform::Normal, 0.0, 100.0, [50.0, 400.0, 0.0, 0.0]),
            make(Waveform::Uniform, 0.0, 100.0, [0.0, 100.0, 0.0, 0.0]),
            make(Waveform::Sine, 0.0, 100.0, [50.0, 1.0, 50.0, 0.0]),
            make(Waveform::GaussSine, 0.0, 100.0, [50.0, 1.0, 50.0, 200.0]),
        ];
        for mut g in cases {
            for _ in 0..500 {
                let v = g.next_value();
                assert!((0.0..=100.0).contains(&v), "{:?} escaped: {}", g.waveform(), v);
            }
        }
    }

    #[test]
    fn sine_amplitude_fits_bounds() {
        // After sanitization p1 +- p3 must lie inside [min, max].
        let g = make(Waveform::Sine, 0.0, 100.0, [80.0, 1.0, 90.0, 0.0]);
        let [p1, _, p3, _] = g.params();
        assert!(p1 + p3 <= 100.0);
        assert!(p1 - p3 >= 0.0);

        let g = make(Waveform::Sine, 0.0, 100.0, [20.0, 1.0, 50.0, 0.0]);
        let [p1, _, p3, _] = g.params();
        assert!(p1 - p3 >= 0.0);
        assert!(p1 + p3 <= 100.0);
    }

    #[test]
    fn sine_frequency_is_clamped() {
        let g = make(Waveform::Sine, 0.0, 100.0, [50.0, 1e6, 10.0, 0.0]);
        assert!(g.param(Param::Two) <= g.sample_freq() / MIN_SINE_CYCLES);

        let g = make(Waveform::Sine, 0.0, 100.0, [50.0, 1e-9, 10.0, 0.0]);
        assert!(g.param(Param::Two) >= g.sample_freq() / PROP_HOLD_MAX as f64);
    }

    #[test]
    fn sine_traces_expected_samples() {
        // Offset 50, amplitude 50, frequency sample_freq/10: ten samples per
        // cycle of 50 + 50 sin(2 pi k / 10).
        let sample_freq = 1000.0 / (3.0 * TICK_MS as f64);
        let mut g = make(
            Waveform::Sine,
            0.0,
            100.0,
            [50.0, sample_freq / 10.0, 50.0, 0.0],
        );
        for k in 0..30 {
            let expect = 50.0 + 50.0 * (2.0 * std::f64::consts::PI * k as f64 / 10.0).sin();
            let got = g.next_value();
            assert!(
                (got - expect.clamp(0.0, 100.0)).abs() < 1e-9,
                "sample {}: {} vs {}",
                k,
                got,
                expect
            );
        }
    }

    #[test]
    fn uniform_range_collapse_resets_to_bounds() {
        let g = make(Waveform::Uniform, 10.0, 90.0, [50.0, 30.0, 0.0, 0.0]);
        // Upper below lower collapses the range back to the full bounds.
        assert_eq!(g.param(Param::One), 10.0);
        assert_eq!(g.param(Param::Two), 90.0);
    }

    #[test]
    fn offset_is_clamped() {
        let g = make(Waveform::Normal, 0.0, 100.0, [500.0, 1.0, 0.0, 0.0]);
        assert_eq!(g.param(Param::One), 100.0);
    }

    #[test]
    fn randomized_param_redraws_within_range() {
        let mut g = make(Waveform::Normal, 0.0, 100.0, [50.0, 5.0, 0.0, 0.0]);
        g.enable_randomized_param(Param::One, (-50.0, 150.0)).unwrap();
        // The range itself is sanitized to the bounds.
        assert_eq!(g.param_range(Param::One), (0.0, 100.0));

        for _ in 0..100 {
            g.select_new_val_for_param(Param::One);
            let p1 = g.param(Param::One);
            assert!((0.0..=100.0).contains(&p1));
        }
    }

    #[test]
    fn unrandomized_param_is_stable() {
        let mut g = make(Waveform::Normal, 0.0, 100.0, [50.0, 5.0, 0.0, 0.0]);
        g.select_new_val_for_param(Param::Two);
        assert_eq!(g.param(Param::Two), 5.0);
        assert_eq!(g.param_range(Param::Two), (5.0, 5.0));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut g = make(Waveform::Normal, 0.0, 100.0, [50.0, 5.0, 0.0, 0.0]);
        assert!(g.enable_randomized_param(Param::One, (60.0, 40.0)).is_err());
    }
}
