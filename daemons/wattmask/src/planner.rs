// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Planners produce the per-tick target vector a controller tracks. The
//! base planner republishes constant targets loaded from files, or replays a
//! precomputed target matrix row by row. The mask generator drives one
//! signal generator per output to synthesize the waveform that masks the
//! host's natural power profile, optionally re-drawing the waveform
//! parameters at random hold intervals so the mask itself is hard to model.

use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::ValueEnum;
use log::debug;
use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;

use wattmask_utils::graph::PortArena;
use wattmask_utils::graph::PortId;
use wattmask_utils::linalg::Matrix;
use wattmask_utils::linalg::Vector;
use wattmask_utils::misc::read_from_file;
use wattmask_utils::signal::Param;
use wattmask_utils::signal::SignalGenerator;
use wattmask_utils::signal::Waveform;
use wattmask_utils::signal::PROP_HOLD_MAX;
use wattmask_utils::signal::PROP_HOLD_MIN;

/// Mask selection, as spelled on the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
#[clap(rename_all = "verbatim")]
pub enum MaskKind {
    Constant,
    Uniform,
    Gauss,
    GaussSine,
    Sine,
    Preset,
}

struct MaskState {
    waveform: Waveform,
    randomize_props: bool,
    hold_counter: u32,
    hold_period: u32,
    /// One generator per output pin.
    signals: Vec<SignalGenerator>,
    rng: SmallRng,
}

impl MaskState {
    /// Property-change gate: fires when the hold counter wraps, and only
    /// when parameter randomization is enabled.
    fn should_props_change(&mut self) -> bool {
        if self.randomize_props {
            if self.hold_counter == self.hold_period {
                self.hold_counter = 0;
                return true;
            }
            self.hold_counter += 1;
        }
        false
    }
}

enum PlannerKind {
    Constant,
    Preset { rows: Matrix, cursor: usize },
    Mask(MaskState),
}

pub struct Planner {
    name: String,
    dir: PathBuf,
    prefix: String,
    /// Out: new targets, block-wired to the controller.
    pub new_targets: PortId,
    /// In: current actuator values.
    pub curr_inputs: PortId,
    /// In: current measurements.
    pub curr_outputs: PortId,
    targets: Vector,
    min_limits: Vector,
    max_limits: Vector,
    period: u32,
    cycles: u32,
    kind: PlannerKind,
}

impl Planner {
    /// Constant or preset-replay planner. Limits and default targets come
    /// from `<dir>/<prefix>_{maxLimits,minLimits,targets}.txt`; a preset
    /// planner additionally loads `_presetlen.txt` and `_presets.txt`.
    pub fn new(
        arena: &mut PortArena,
        name: &str,
        dir: &Path,
        prefix: &str,
        period: u32,
        use_preset: bool,
    ) -> Result<Self> {
        let (targets, min_limits, max_limits) = Self::load_limits(dir, prefix)?;

        let kind = if use_preset {
            let len: usize = read_from_file(&dir.join(format!("{}_presetlen.txt", prefix)))?;
            let rows = Matrix::from_file(
                &dir.join(format!("{}_presets.txt", prefix)),
                len,
                targets.len(),
            )?;
            PlannerKind::Preset { rows, cursor: 0 }
        } else {
            PlannerKind::Constant
        };

        Ok(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            new_targets: arena.add_output_port("newOutputTargetVals"),
            curr_inputs: arena.add_input_port("currInputVals"),
            curr_outputs: arena.add_input_port("currOutputVals"),
            targets,
            min_limits,
            max_limits,
            period,
            cycles: period,
            kind,
        })
    }

    /// Mask-generating planner: one signal generator per output, seeded
    /// from the limit files. `tick_ms` is the runtime sampling interval;
    /// the planner itself fires every `period` ticks.
    #[allow(clippy::too_many_arguments)]
    pub fn new_mask(
        arena: &mut PortArena,
        name: &str,
        dir: &Path,
        prefix: &str,
        period: u32,
        waveform: Waveform,
        randomize_props: bool,
        tick_ms: u64,
    ) -> Result<Self> {
        let mut planner = Self::new(arena, name, dir, prefix, period, false)?;
        let mut rng = SmallRng::from_entropy();

        // A Uniform mask is piecewise constant: a target is held for a
        // random period rather than re-drawn on every invocation, so it
        // needs a hold period even without property randomization.
        let hold_period = if randomize_props || waveform == Waveform::Uniform {
            rng.gen_range(PROP_HOLD_MIN..=PROP_HOLD_MAX)
        } else {
            0
        };
        debug!("{}: initial property hold period {}", name, hold_period);

        let mut signals = Vec::with_capacity(planner.targets.len());
        for i in 0..planner.targets.len() {
            let (lo, hi) = (planner.min_limits[i], planner.max_limits[i]);
            let spread = (hi - lo) / 6.0;
            let params = match waveform {
                Waveform::Normal => [planner.targets[i], spread, 0.0, 0.0],
                Waveform::Sine | Waveform::GaussSine => [
                    planner.targets[i],
                    1000.0 / (5.0 * period as f64 * tick_ms as f64),
                    spread,
                    spread,
                ],
                Waveform::Uniform => [lo, hi, 0.0, 0.0],
            };
            let mut signal = SignalGenerator::new(waveform, tick_ms, lo, hi, params)?;

            if randomize_props {
                signal.enable_randomized_param(Param::One, (lo, hi))?;
                match waveform {
                    Waveform::Normal => {
                        signal.enable_randomized_param(Param::Two, (0.0, spread))?;
                    }
                    Waveform::Sine | Waveform::GaussSine => {
                        signal.enable_randomized_param(
                            Param::Two,
                            (
                                1000.0 / (hold_period as f64 * period as f64 * tick_ms as f64),
                                1000.0 / (4.0 * period as f64 * tick_ms as f64),
                            ),
                        )?;
                        signal.enable_randomized_param(Param::Three, (lo, hi))?;
                        signal.enable_randomized_param(Param::Four, (0.0, spread))?;
                    }
                    Waveform::Uniform => {}
                }
            }
            signals.push(signal);
        }

        planner.kind = PlannerKind::Mask(MaskState {
            waveform,
            randomize_props,
            hold_counter: 0,
            hold_period,
            signals,
            rng,
        });
        Ok(planner)
    }

    fn load_limits(dir: &Path, prefix: &str) -> Result<(Vector, Vector, Vector)> {
        let load = |suffix: &str| {
            Vector::from_file(&dir.join(format!("{}_{}.txt", prefix, suffix)))
                .with_context(|| format!("Failed to load planner {} file", suffix))
        };
        let targets = load("targets")?;
        let min_limits = load("minLimits")?;
        let max_limits = load("maxLimits")?;
        if min_limits.len() != targets.len() || max_limits.len() != targets.len() {
            bail!(
                "Planner limit files disagree on width: {} targets, {} min, {} max",
                targets.len(),
                min_limits.len(),
                max_limits.len()
            );
        }
        Ok((targets, min_limits, max_limits))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_outputs(&self) -> usize {
        self.targets.len()
    }

    /// Reload the default targets and rewind the preset cursor.
    pub fn reset(&mut self) -> Result<()> {
        let (targets, _, _) = Self::load_limits(&self.dir, &self.prefix)?;
        self.targets = targets;
        if let PlannerKind::Preset { cursor, .. } = &mut self.kind {
            *cursor = 0;
        }
        Ok(())
    }

    /// Per-tick action: recompute targets when the period counter wraps,
    /// republish them otherwise, and publish the result.
    pub fn run(&mut self, arena: &mut PortArena) -> Result<()> {
        let fire = if self.cycles == self.period {
            self.cycles = 1;
            true
        } else {
            self.cycles += 1;
            false
        };

        let new_targets = self.compute_new_targets(arena, fire);
        debug!("{}: targets {}", self.name, new_targets);
        arena.update_port(self.new_targets, &new_targets)
    }

    fn compute_new_targets(&mut self, arena: &mut PortArena, mut fire: bool) -> Vector {
        let _outputs = arena.read_port(self.curr_outputs);
        let _inputs = arena.read_port(self.curr_inputs);

        match &mut self.kind {
            PlannerKind::Constant => {}
            PlannerKind::Preset { rows, cursor } => {
                self.targets = rows.row(*cursor).to_vec().into();
                *cursor = (*cursor + 1) % rows.rows();
            }
            PlannerKind::Mask(mask) => {
                // The hold gate replaces the period gate for a Uniform mask.
                if mask.waveform == Waveform::Uniform {
                    if mask.hold_counter == mask.hold_period {
                        mask.hold_counter = 0;
                        mask.hold_period = mask.rng.gen_range(PROP_HOLD_MIN..=PROP_HOLD_MAX);
                        fire = true;
                    } else {
                        mask.hold_counter += 1;
                        fire = false;
                    }
                }

                if fire {
                    let new_props = mask.should_props_change();
                    if new_props {
                        mask.hold_period = mask.rng.gen_range(PROP_HOLD_MIN..=PROP_HOLD_MAX);
                        debug!("New mask properties, next change in {}", mask.hold_period);
                    }
                    let mut vals = Vec::with_capacity(mask.signals.len());
                    for signal in mask.signals.iter_mut() {
                        if new_props {
                            for p in Param::ALL {
                                signal.select_new_val_for_param(p);
                            }
                        }
                        vals.push(signal.next_value());
                    }
                    self.targets = vals.into();
                }
            }
        }
        self.targets.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_limit_files(dir: &Path, prefix: &str, width: usize) {
        let write = |suffix: &str, contents: &str| {
            std::fs::write(dir.join(format!("{}_{}.txt", prefix, suffix)), contents).unwrap()
        };
        match width {
            1 => {
                write("targets", "50\n");
                write("minLimits", "0\n");
                write("maxLimits", "100\n");
            }
            2 => {
                write("targets", "50 60\n");
                write("minLimits", "0 0\n");
                write("maxLimits", "100 100\n");
            }
            _ => unreachable!(),
        }
    }

    fn wire_pins(arena: &mut PortArena, planner: &Planner, width: usize) {
        for i in 0..width {
            let pin = format!("out{}", i);
            arena.add_pin(planner.new_targets, &pin).unwrap();
            arena.add_pin(planner.curr_outputs, &pin).unwrap();
        }
        arena.add_pin(planner.curr_inputs, "in0").unwrap();
    }

    #[test]
    fn constant_planner_republishes_targets() {
        let tmp = TempDir::new().unwrap();
        write_limit_files(tmp.path(), "p", 2);

        let mut arena = PortArena::new();
        let mut planner = Planner::new(&mut arena, "p", tmp.path(), "p", 1, false).unwrap();
        wire_pins(&mut arena, &planner, 2);

        for _ in 0..3 {
            planner.run(&mut arena).unwrap();
            assert_eq!(arena.transmit_all(planner.new_targets).as_slice(), &[50.0, 60.0]);
        }
    }

    #[test]
    fn preset_planner_replays_rows_cyclically() {
        let tmp = TempDir::new().unwrap();
        write_limit_files(tmp.path(), "p", 2);
        std::fs::write(tmp.path().join("p_presetlen.txt"), "3\n").unwrap();
        std::fs::write(tmp.path().join("p_presets.txt"), "10 20\n30 40\n50 60\n").unwrap();

        let mut arena = PortArena::new();
        let mut planner = Planner::new(&mut arena, "p", tmp.path(), "p", 1, true).unwrap();
        wire_pins(&mut arena, &planner, 2);

        let expect = [
            [10.0, 20.0],
            [30.0, 40.0],
            [50.0, 60.0],
            [10.0, 20.0],
            [30.0, 40.0],
        ];
        for row in expect {
            planner.run(&mut arena).unwrap();
            assert_eq!(arena.transmit_all(planner.new_targets).as_slice(), &row);
        }
    }

    #[test]
    fn preset_length_mismatch_is_fatal() {
        let tmp = TempDir::new().unwrap();
        write_limit_files(tmp.path(), "p", 2);
        std::fs::write(tmp.path().join("p_presetlen.txt"), "3\n").unwrap();
        std::fs::write(tmp.path().join("p_presets.txt"), "10 20\n30 40\n").unwrap();

        let mut arena = PortArena::new();
        assert!(Planner::new(&mut arena, "p", tmp.path(), "p", 1, true).is_err());
    }

    #[test]
    fn limit_width_mismatch_is_fatal() {
        let tmp = TempDir::new().unwrap();
        write_limit_files(tmp.path(), "p", 2);
        std::fs::write(tmp.path().join("p_minLimits.txt"), "0\n").unwrap();

        let mut arena = PortArena::new();
        assert!(Planner::new(&mut arena, "p", tmp.path(), "p", 1, false).is_err());
    }

    #[test]
    fn period_gates_recomputation() {
        let tmp = TempDir::new().unwrap();
        write_limit_files(tmp.path(), "p", 1);
        std::fs::write(tmp.path().join("p_presetlen.txt"), "2\n").unwrap();
        std::fs::write(tmp.path().join("p_presets.txt"), "1\n2\n").unwrap();

        let mut arena = PortArena::new();
        let mut planner = Planner::new(&mut arena, "p", tmp.path(), "p", 2, true).unwrap();
        wire_pins(&mut arena, &planner, 1);

        // period=2: recompute, hold, recompute, hold.
        let expect = [1.0, 1.0, 2.0, 2.0];
        for val in expect {
            planner.run(&mut arena).unwrap();
            assert_eq!(arena.transmit_all(planner.new_targets).as_slice(), &[val]);
        }
    }

    #[test]
    fn mask_targets_stay_inside_limits() {
        let tmp = TempDir::new().unwrap();
        write_limit_files(tmp.path(), "p", 2);

        let mut arena = PortArena::new();
        let mut planner = Planner::new_mask(
            &mut arena,
            "p",
            tmp.path(),
            "p",
            1,
            Waveform::GaussSine,
            true,
            20,
        )
        .unwrap();
        wire_pins(&mut arena, &planner, 2);

        for _ in 0..300 {
            planner.run(&mut arena).unwrap();
            let targets = arena.transmit_all(planner.new_targets);
            for v in targets.iter() {
                assert!((0.0..=100.0).contains(v), "target escaped limits: {}", v);
            }
        }
    }

    #[test]
    fn uniform_mask_holds_targets_between_draws() {
        let tmp = TempDir::new().unwrap();
        write_limit_files(tmp.path(), "p", 1);

        let mut arena = PortArena::new();
        let mut planner = Planner::new_mask(
            &mut arena,
            "p",
            tmp.path(),
            "p",
            1,
            Waveform::Uniform,
            false,
            20,
        )
        .unwrap();
        wire_pins(&mut arena, &planner, 1);

        // Values may only change when a hold period expires, and hold
        // periods stay within the distribution bounds.
        let mut last = None;
        let mut run_len = 0u32;
        let mut runs = vec![];
        for _ in 0..2000 {
            planner.run(&mut arena).unwrap();
            let v = arena.transmit_all(planner.new_targets)[0];
            match last {
                Some(prev) if prev == v => run_len += 1,
                Some(_) => {
                    runs.push(run_len);
                    run_len = 1;
                }
                None => run_len = 1,
            }
            last = Some(v);
        }
        assert!(!runs.is_empty(), "uniform mask never changed value");
        for run in runs {
            // A run ends one invocation after the hold period elapses.
            assert!(
                run >= PROP_HOLD_MIN && run <= PROP_HOLD_MAX + 2,
                "run length {} outside hold bounds",
                run
            );
        }
    }

    #[test]
    fn reset_rewinds_preset_cursor() {
        let tmp = TempDir::new().unwrap();
        write_limit_files(tmp.path(), "p", 2);
        std::fs::write(tmp.path().join("p_presetlen.txt"), "3\n").unwrap();
        std::fs::write(tmp.path().join("p_presets.txt"), "10 20\n30 40\n50 60\n").unwrap();

        let mut arena = PortArena::new();
        let mut planner = Planner::new(&mut arena, "p", tmp.path(), "p", 1, true).unwrap();
        wire_pins(&mut arena, &planner, 2);

        planner.run(&mut arena).unwrap();
        planner.run(&mut arena).unwrap();
        planner.reset().unwrap();
        planner.run(&mut arena).unwrap();
        assert_eq!(arena.transmit_all(planner.new_targets).as_slice(), &[10.0, 20.0]);
    }
}
