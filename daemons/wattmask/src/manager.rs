// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The manager owns every module and wire, builds the dataflow graph from
//! the registered sensors, inputs, controllers, and planners, and drives the
//! soft-periodic tick loop:
//!
//! 1. Sample every sensor and input from the host.
//! 2. Emit the display line.
//! 3. Transfer the read wires.
//! 4. Mask mode: transfer block wires, run planners, run controllers.
//!    Sysid mode: advance the excitation hold counters.
//! 5. Transfer the write wires.
//! 6. Apply every input to the host.
//! 7. Sleep until the next period.
//!
//! A shutdown request (the interrupt flag) takes effect between ticks; the
//! inputs are reset to safe values before exit.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Result;
use clap::ValueEnum;
use log::debug;
use log::info;
use log::warn;
use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;

use wattmask_utils::graph::PortArena;
use wattmask_utils::graph::PortId;
use wattmask_utils::graph::Wire;
use wattmask_utils::signal::Waveform;

use crate::controller::ControlLaw;
use crate::controller::Controller;
use crate::inputs::Input;
use crate::planner::MaskKind;
use crate::planner::Planner;
use crate::sensors::Sensor;

const DEFAULT_MIN_HOLD: u32 = 2;
const DEFAULT_MAX_HOLD: u32 = 20;

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
#[clap(rename_all = "verbatim")]
pub enum Mode {
    /// Observe only.
    Baseline,
    /// Drive inputs with piecewise-constant random excitation for offline
    /// model fitting.
    Sysid,
    /// Track synthetic target waveforms to mask the power profile.
    Mask,
}

pub struct Manager {
    mode: Mode,
    tick: Duration,
    tick_ms: u64,
    arena: PortArena,
    sensors: Vec<Sensor>,
    inputs: Vec<Input>,
    controllers: Vec<Controller>,
    planners: Vec<Planner>,
    read_wires: Vec<Wire>,
    write_wires: Vec<Wire>,
    block_wires: Vec<Wire>,

    sysid_names: Vec<String>,
    sysid_indices: Vec<usize>,
    hold_periods: Vec<u32>,
    min_holds: Vec<u32>,
    max_holds: Vec<u32>,
    hold_counters: Vec<u32>,

    rng: SmallRng,
}

impl Manager {
    pub fn new(tick_ms: u64, mode: Mode) -> Self {
        Self {
            mode,
            tick: Duration::from_millis(tick_ms),
            tick_ms,
            arena: PortArena::new(),
            sensors: vec![],
            inputs: vec![],
            controllers: vec![],
            planners: vec![],
            read_wires: vec![],
            write_wires: vec![],
            block_wires: vec![],
            sysid_names: vec![],
            sysid_indices: vec![],
            hold_periods: vec![],
            min_holds: vec![],
            max_holds: vec![],
            hold_counters: vec![],
            rng: SmallRng::from_entropy(),
        }
    }

    /// Modules create their ports here before registration.
    pub fn arena_mut(&mut self) -> &mut PortArena {
        &mut self.arena
    }

    pub fn add_sensor(&mut self, sensor: Sensor) -> Result<()> {
        let new_pins = self.arena.pin_names(sensor.out_port());
        for existing in &self.sensors {
            for pin in self.arena.pin_names(existing.out_port()) {
                if new_pins.contains(&pin) {
                    bail!("Cannot add two sensors with same name: {}", pin);
                }
            }
        }
        self.sensors.push(sensor);
        Ok(())
    }

    pub fn add_input(&mut self, input: Input) -> Result<()> {
        let new_pins = self.arena.pin_names(input.out_port());
        for existing in &self.inputs {
            for pin in self.arena.pin_names(existing.out_port()) {
                if new_pins.contains(&pin) {
                    bail!("Cannot add two inputs with same name: {}", pin);
                }
            }
        }
        self.inputs.push(input);
        Ok(())
    }

    /// Configure which inputs Sysid mode excites and the per-input hold
    /// bounds in ticks. Empty bound lists fall back to the defaults.
    pub fn add_sysid_params(
        &mut self,
        names: Vec<String>,
        min_hold: Vec<u32>,
        max_hold: Vec<u32>,
        init_hold: Vec<u32>,
    ) -> Result<()> {
        let n = names.len();
        self.sysid_names = names;
        self.hold_counters = vec![0; n];

        self.hold_periods = match init_hold.len() {
            0 => vec![DEFAULT_MIN_HOLD + 1; n],
            len if len == n => init_hold,
            _ => bail!("Incorrect number of hold periods specified"),
        };
        self.min_holds = match min_hold.len() {
            0 => vec![DEFAULT_MIN_HOLD; n],
            len if len == n => min_hold,
            _ => bail!("Incorrect number of min hold periods specified"),
        };
        self.max_holds = match max_hold.len() {
            0 => vec![DEFAULT_MAX_HOLD; n],
            len if len == n => max_hold,
            _ => bail!("Incorrect number of max hold periods specified"),
        };
        Ok(())
    }

    /// Register a controller over the named sensor outputs and actuator
    /// inputs. Names may refer to whole ports or single pins. One read wire
    /// feeds each selection into the controller, and one write wire carries
    /// the new actuator values back.
    pub fn add_controller(
        &mut self,
        name: &str,
        output_names: &[&str],
        input_names: &[&str],
        law: ControlLaw,
        period: u32,
    ) -> Result<()> {
        let mut op_groups = vec![];
        for op_name in output_names {
            let idx = self.sensor_index(op_name)?;
            let src = self.sensors[idx].out_port();
            let pins = self.pin_selection(op_name, src);
            op_groups.push((src, pins));
        }
        let mut ip_groups = vec![];
        for ip_name in input_names {
            let idx = self.input_index(ip_name)?;
            let src = self.inputs[idx].out_port();
            let dst = self.inputs[idx].in_port();
            let pins = self.pin_selection(ip_name, src);
            ip_groups.push((src, dst, pins));
        }

        let ctl = Controller::new(&mut self.arena, name, law, period);

        // All pins first: a port's pin layout freezes at its first wire.
        for (_, pins) in &op_groups {
            self.arena.add_pins(ctl.curr_outputs, pins)?;
            self.arena.add_pins(ctl.target_inputs, pins)?;
            self.arena.add_pins(ctl.curr_targets_echo, pins)?;
        }
        for (_, _, pins) in &ip_groups {
            self.arena.add_pins(ctl.curr_inputs, pins)?;
            self.arena.add_pins(ctl.new_inputs, pins)?;
        }

        for (src, pins) in &op_groups {
            let wire = Wire::by_names(&mut self.arena, *src, pins, ctl.curr_outputs, pins, 0)?;
            self.read_wires.push(wire);
        }
        for (src, dst, pins) in &ip_groups {
            let wire = Wire::by_names(&mut self.arena, *src, pins, ctl.curr_inputs, pins, 0)?;
            self.read_wires.push(wire);
            let wire = Wire::by_names(&mut self.arena, ctl.new_inputs, pins, *dst, pins, 0)?;
            self.write_wires.push(wire);
        }

        self.controllers.push(ctl);
        Ok(())
    }

    /// Register a target generator feeding the named controller. The
    /// planner mirrors the controller's measurement and input pins and a
    /// zero-delay block wire carries its targets into the controller.
    #[allow(clippy::too_many_arguments)]
    pub fn add_mask_generator(
        &mut self,
        name: &str,
        controller_name: &str,
        kind: MaskKind,
        dir: &Path,
        prefix: &str,
        period: u32,
        randomize_props: bool,
    ) -> Result<()> {
        let ctl_idx = match self
            .controllers
            .iter()
            .position(|c| c.name() == controller_name)
        {
            Some(idx) => idx,
            None => bail!(
                "Incorrect controller name {} to attach mask generator to",
                controller_name
            ),
        };

        let waveform = match kind {
            MaskKind::Constant => None,
            MaskKind::Preset => None,
            MaskKind::Uniform => Some(Waveform::Uniform),
            MaskKind::Gauss => Some(Waveform::Normal),
            MaskKind::Sine => Some(Waveform::Sine),
            MaskKind::GaussSine => Some(Waveform::GaussSine),
        };
        let planner = match waveform {
            Some(waveform) => Planner::new_mask(
                &mut self.arena,
                name,
                dir,
                prefix,
                period,
                waveform,
                randomize_props,
                self.tick_ms,
            )?,
            None => Planner::new(
                &mut self.arena,
                name,
                dir,
                prefix,
                period,
                kind == MaskKind::Preset,
            )?,
        };

        let target_pins = self.arena.pin_names(self.controllers[ctl_idx].curr_outputs);
        if planner.num_outputs() != target_pins.len() {
            bail!(
                "Planner {} generates {} targets but controller {} tracks {} outputs",
                name,
                planner.num_outputs(),
                controller_name,
                target_pins.len()
            );
        }
        let input_pins = self.arena.pin_names(self.controllers[ctl_idx].curr_inputs);

        self.arena.add_pins(planner.curr_outputs, &target_pins)?;
        self.arena.add_pins(planner.new_targets, &target_pins)?;
        self.arena.add_pins(planner.curr_inputs, &input_pins)?;

        for pin in &target_pins {
            let idx = self.sensor_index(pin)?;
            let src = self.sensors[idx].out_port();
            let wire = Wire::by_name(&mut self.arena, src, pin, planner.curr_outputs, pin, 0)?;
            self.read_wires.push(wire);
        }
        let block = Wire::new(
            &mut self.arena,
            planner.new_targets,
            self.controllers[ctl_idx].target_inputs,
            0,
        )?;
        self.block_wires.push(block);
        for pin in &input_pins {
            let idx = self.input_index(pin)?;
            let src = self.inputs[idx].out_port();
            let wire = Wire::by_name(&mut self.arena, src, pin, planner.curr_inputs, pin, 0)?;
            self.read_wires.push(wire);
        }

        self.planners.push(planner);
        Ok(())
    }

    /// A registered name selects either a whole port or one of its pins.
    fn pin_selection(&self, name: &str, port: PortId) -> Vec<String> {
        if self.arena.port_name(port) == name {
            self.arena.pin_names(port)
        } else {
            vec![name.to_string()]
        }
    }

    fn sensor_index(&self, name: &str) -> Result<usize> {
        for (idx, sensor) in self.sensors.iter().enumerate() {
            if sensor.name() == name
                || self.arena.pin_names(sensor.out_port()).iter().any(|p| p == name)
            {
                return Ok(idx);
            }
        }
        bail!("Cannot find non-existing sensor name {}", name);
    }

    fn input_index(&self, name: &str) -> Result<usize> {
        for (idx, input) in self.inputs.iter().enumerate() {
            if input.name() == name
                || self.arena.pin_names(input.out_port()).iter().any(|p| p == name)
            {
                return Ok(idx);
            }
        }
        bail!("Cannot find non-existing input name {}", name);
    }

    fn update_from_system(&mut self) {
        for sensor in &mut self.sensors {
            if let Err(e) = sensor.update_from_system(&mut self.arena) {
                warn!("Sensor {} update failed: {}", sensor.name(), e);
            }
        }
        for input in &mut self.inputs {
            if let Err(e) = input.update_from_system(&mut self.arena) {
                warn!("Input {} update failed: {}", input.name(), e);
            }
        }
    }

    fn apply_to_system(&mut self) {
        for input in &mut self.inputs {
            if let Err(e) = input.apply_to_system(&mut self.arena) {
                warn!("Input {} apply failed: {}", input.name(), e);
            }
        }
    }

    fn header_line(&self) -> String {
        let mut line = String::new();
        for sensor in &self.sensors {
            for name in self.arena.pin_names(sensor.out_port()) {
                let _ = write!(line, "{} ", name);
            }
        }
        for input in &self.inputs {
            for name in self.arena.pin_names(input.out_port()) {
                let _ = write!(line, "{} ", name);
            }
        }
        if self.mode == Mode::Mask {
            for ctl in &self.controllers {
                for name in self.arena.pin_names(ctl.curr_targets_echo) {
                    let _ = write!(line, "Target@{} ", name);
                }
            }
        }
        line.trim_end().to_string()
    }

    fn values_line(&mut self) -> String {
        let mut line = String::new();
        for i in 0..self.sensors.len() {
            let vals = self.arena.transmit_all(self.sensors[i].out_port());
            for v in vals.iter() {
                let _ = write!(line, "{:.3} ", v);
            }
        }
        for i in 0..self.inputs.len() {
            let vals = self.arena.transmit_all(self.inputs[i].out_port());
            for v in vals.iter() {
                let _ = write!(line, "{:.2} ", v);
            }
        }
        if self.mode == Mode::Mask {
            for i in 0..self.controllers.len() {
                let vals = self.arena.transmit_all(self.controllers[i].curr_targets_echo);
                for v in vals.iter() {
                    let _ = write!(line, "{:.2} ", v);
                }
            }
        }
        line.trim_end().to_string()
    }

    fn run_sysid(&mut self) -> Result<()> {
        for i in 0..self.sysid_indices.len() {
            self.hold_counters[i] += 1;
            if self.hold_counters[i] == self.hold_periods[i] {
                let idx = self.sysid_indices[i];
                self.inputs[idx].set_random_value(&mut self.arena, &mut self.rng)?;
                self.hold_counters[i] = 0;
                self.hold_periods[i] = self
                    .rng
                    .gen_range(self.min_holds[i]..=self.max_holds[i]);
                debug!(
                    "New hold period for input {} is {}",
                    self.inputs[idx].name(),
                    self.hold_periods[i]
                );
            }
        }
        Ok(())
    }

    fn reset_inputs(&mut self) {
        for input in &mut self.inputs {
            debug!("Resetting {}", input.name());
            input.reset();
        }
    }

    fn complete_init(&mut self) -> Result<()> {
        if self.mode == Mode::Sysid {
            if self.sysid_names.is_empty() {
                bail!("Sysid mode requires excitation input names");
            }
            let names = self.sysid_names.clone();
            for name in &names {
                let idx = self.input_index(name)?;
                self.sysid_indices.push(idx);
            }
            for i in 0..self.inputs.len() {
                if log::log_enabled!(log::Level::Debug) {
                    let lat = self.inputs[i].measure_write_latency();
                    debug!(
                        "Write latency for {}: max-min {} us, min-max {} us",
                        self.inputs[i].name(),
                        lat[0],
                        lat[1]
                    );
                }
                self.inputs[i].set_min_value(&mut self.arena)?;
            }
        }
        println!("{}", self.header_line());
        Ok(())
    }

    /// One pass of the loop body, without the sleep.
    fn tick_once(&mut self) -> Result<()> {
        self.update_from_system();
        println!("{}", self.values_line());
        for wire in &mut self.read_wires {
            wire.transfer(&mut self.arena)?;
        }
        match self.mode {
            Mode::Mask => {
                for wire in &mut self.block_wires {
                    wire.transfer(&mut self.arena)?;
                }
                for planner in &mut self.planners {
                    planner.run(&mut self.arena)?;
                }
                for ctl in &mut self.controllers {
                    ctl.run(&mut self.arena)?;
                }
            }
            Mode::Sysid => self.run_sysid()?,
            Mode::Baseline => {}
        }
        for wire in &mut self.write_wires {
            wire.transfer(&mut self.arena)?;
        }
        self.apply_to_system();
        Ok(())
    }

    /// The tick loop. Runs until the shutdown flag is raised, then resets
    /// every input. The in-progress tick always completes; the flag is only
    /// checked between ticks.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        self.complete_init()?;

        // Prime the readings and apply the initial safe values once before
        // entering the loop.
        self.update_from_system();
        self.apply_to_system();

        let mut next_tick_at = Instant::now() + self.tick;
        while !shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            if next_tick_at > now {
                std::thread::sleep(next_tick_at - now);
            }
            next_tick_at += self.tick;
            let now = Instant::now();
            if next_tick_at < now {
                next_tick_at = now + self.tick;
            }
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            self.tick_once()?;
        }

        info!("Shutting down, resetting inputs");
        self.reset_inputs();
        Ok(())
    }
}
