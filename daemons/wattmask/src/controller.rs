// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Controllers consume current targets, measurements, and actuator values,
//! and produce new actuator values. The robust law is a discrete-time linear
//! state-space update with normalization on the tracking error and
//! denormalization on the actuator delta:
//!
//! ```text
//! e  = r - y
//! es = e (.) scale_down
//! x' = A x + B es
//! du = C x + D es
//! u' = du (.) scale_up + u
//! ```
//!
//! The coefficient matrices come from plain-text files produced by the
//! offline synthesis flow.

use std::path::Path;

use anyhow::bail;
use anyhow::Result;
use log::debug;

use wattmask_utils::graph::PortArena;
use wattmask_utils::graph::PortId;
use wattmask_utils::linalg::Matrix;
use wattmask_utils::linalg::Vector;
use wattmask_utils::misc::read_from_file;

/// Coefficients and state of the robust state-space law.
pub struct StateSpace {
    a: Matrix,
    b: Matrix,
    c: Matrix,
    d: Matrix,
    state: Vector,
    /// Denormalization of the actuator delta, one entry per input.
    scale_in_up: Vector,
    /// Normalization of the tracking error, one entry per measurement.
    scale_out_down: Vector,
}

impl StateSpace {
    /// Load a controller from `<dir>/<prefix>_*.txt`. Dimension files fix
    /// the shapes; a coefficient file that does not match them exactly is a
    /// configuration error.
    pub fn from_files(dir: &Path, prefix: &str) -> Result<Self> {
        let file = |suffix: &str| dir.join(format!("{}_{}.txt", prefix, suffix));

        let dimension: usize = read_from_file(&file("dimension"))?;
        let num_inputs: usize = read_from_file(&file("numInputs"))?;
        let num_ymeas: usize = read_from_file(&file("numYmeas"))?;

        let a = Matrix::from_file(&file("A"), dimension, dimension)?;
        let b = Matrix::from_file(&file("B"), dimension, num_ymeas)?;
        let c = Matrix::from_file(&file("C"), num_inputs, dimension)?;
        let d = Matrix::from_file(&file("D"), num_inputs, num_ymeas)?;

        let scale_in_up = Vector::from_file(&file("scaleInputsUp"))?;
        if scale_in_up.len() != num_inputs {
            bail!(
                "scaleInputsUp holds {} entries, expected {}",
                scale_in_up.len(),
                num_inputs
            );
        }
        let scale_out_down = Vector::from_file(&file("scaleYmeasDown"))?;
        if scale_out_down.len() != num_ymeas {
            bail!(
                "scaleYmeasDown holds {} entries, expected {}",
                scale_out_down.len(),
                num_ymeas
            );
        }

        Ok(Self {
            a,
            b,
            c,
            d,
            state: Vector::zeros(dimension),
            scale_in_up,
            scale_out_down,
        })
    }

    pub fn num_inputs(&self) -> usize {
        self.scale_in_up.len()
    }

    pub fn num_measurements(&self) -> usize {
        self.scale_out_down.len()
    }

    /// One update step; commits the new internal state and returns the new
    /// actuator vector.
    fn step(&mut self, u: &Vector, r: &Vector, y: &Vector) -> Result<Vector> {
        let err = r.sub(y)?.mul_elem(&self.scale_out_down)?;

        let new_state = self.a.matvec(&self.state)?.add(&self.b.matvec(&err)?)?;
        let delta = self.c.matvec(&self.state)?.add(&self.d.matvec(&err)?)?;
        let new_u = delta.mul_elem(&self.scale_in_up)?.add(u)?;

        self.state = new_state;
        Ok(new_u)
    }
}

pub enum ControlLaw {
    /// Republish the current actuator values; used to exercise the graph
    /// plumbing without a synthesized controller.
    Hold,
    StateSpace(StateSpace),
}

pub struct Controller {
    name: String,
    /// Out: actuator values for the next tick.
    pub new_inputs: PortId,
    /// Out: echo of the targets currently tracked, for the display.
    pub curr_targets_echo: PortId,
    /// In: actuator values as last sampled.
    pub curr_inputs: PortId,
    /// In: current measurements.
    pub curr_outputs: PortId,
    /// In: targets from the planner.
    pub target_inputs: PortId,
    period: u32,
    cycles: u32,
    law: ControlLaw,
}

impl Controller {
    /// Ports start empty; the manager appends pins while wiring.
    pub fn new(arena: &mut PortArena, name: &str, law: ControlLaw, period: u32) -> Self {
        Self {
            name: name.to_string(),
            new_inputs: arena.add_output_port("newInputVals"),
            curr_targets_echo: arena.add_output_port("currOutputTargetVals"),
            curr_inputs: arena.add_input_port("currInputVals"),
            curr_outputs: arena.add_input_port("outputVals"),
            target_inputs: arena.add_input_port("outputTargetVals"),
            period,
            cycles: period,
            law,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-tick action. The law only fires when the period counter wraps;
    /// off-cycle ticks republish the current actuator values. Targets are
    /// echoed on every tick.
    pub fn run(&mut self, arena: &mut PortArena) -> Result<()> {
        let fire = if self.cycles == self.period {
            self.cycles = 1;
            true
        } else {
            self.cycles += 1;
            false
        };

        let new_vals = self.compute_new_inputs(arena, fire)?;
        debug!("{}: new inputs {}", self.name, new_vals);
        arena.update_port(self.new_inputs, &new_vals)?;

        let targets = arena.read_port(self.target_inputs);
        arena.update_port(self.curr_targets_echo, &targets)
    }

    fn compute_new_inputs(&mut self, arena: &mut PortArena, fire: bool) -> Result<Vector> {
        let curr_inputs = arena.read_port(self.curr_inputs);
        match &mut self.law {
            ControlLaw::Hold => Ok(curr_inputs),
            ControlLaw::StateSpace(ss) => {
                let targets = arena.read_port(self.target_inputs);
                let outputs = arena.read_port(self.curr_outputs);
                if fire {
                    ss.step(&curr_inputs, &targets, &outputs)
                } else {
                    Ok(curr_inputs)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// A 1-state, 2-input, 1-measurement controller with easy numbers.
    fn write_controller_files(dir: &Path, prefix: &str) {
        let write = |suffix: &str, contents: &str| {
            std::fs::write(dir.join(format!("{}_{}.txt", prefix, suffix)), contents).unwrap()
        };
        write("dimension", "1\n");
        write("numInputs", "2\n");
        write("numYmeas", "1\n");
        write("A", "0.5\n");
        write("B", "1\n");
        write("C", "1\n2\n");
        write("D", "0.25\n0.5\n");
        write("scaleInputsUp", "10 100\n");
        write("scaleYmeasDown", "0.1\n");
    }

    fn wired_controller(arena: &mut PortArena, law: ControlLaw, period: u32) -> Controller {
        let ctl = Controller::new(arena, "ctl", law, period);
        for port in [ctl.curr_outputs, ctl.target_inputs, ctl.curr_targets_echo] {
            arena.add_pin(port, "Power").unwrap();
        }
        for port in [ctl.curr_inputs, ctl.new_inputs] {
            arena.add_pin(port, "Freq").unwrap();
            arena.add_pin(port, "Idle").unwrap();
        }
        ctl
    }

    fn feed(
        arena: &mut PortArena,
        ctl: &Controller,
        u: [f64; 2],
        y: f64,
        r: f64,
    ) {
        arena
            .receive_all(ctl.curr_inputs, &u.to_vec().into())
            .unwrap();
        arena.receive_all(ctl.curr_outputs, &vec![y].into()).unwrap();
        arena.receive_all(ctl.target_inputs, &vec![r].into()).unwrap();
    }

    #[test]
    fn load_rejects_bad_dimensions() {
        let tmp = TempDir::new().unwrap();
        write_controller_files(tmp.path(), "ctl");
        std::fs::write(tmp.path().join("ctl_B.txt"), "1 2 3\n").unwrap();
        assert!(StateSpace::from_files(tmp.path(), "ctl").is_err());
    }

    #[test]
    fn load_rejects_bad_scale_lengths() {
        let tmp = TempDir::new().unwrap();
        write_controller_files(tmp.path(), "ctl");
        std::fs::write(tmp.path().join("ctl_scaleInputsUp.txt"), "10\n").unwrap();
        assert!(StateSpace::from_files(tmp.path(), "ctl").is_err());
    }

    #[test]
    fn state_space_follows_affine_recurrence() {
        let tmp = TempDir::new().unwrap();
        write_controller_files(tmp.path(), "ctl");
        let ss = StateSpace::from_files(tmp.path(), "ctl").unwrap();

        let mut arena = PortArena::new();
        let mut ctl = wired_controller(&mut arena, ControlLaw::StateSpace(ss), 1);

        // Hand-computed recurrence with x0 = 0:
        //   es_k = (r_k - y_k) * 0.1
        //   u_{k+1} = u_k + [1; 2] x_k (.) [10; 100] + [0.25; 0.5] es_k (.) [10; 100]
        //   x_{k+1} = 0.5 x_k + es_k
        //
        // Step 1: u=(5, 50), y=20, r=30  ->  es=1
        //   u' = (5 + 2.5, 50 + 50) = (7.5, 100); x' = 1
        feed(&mut arena, &ctl, [5.0, 50.0], 20.0, 30.0);
        ctl.run(&mut arena).unwrap();
        let u1 = arena.transmit_all(ctl.new_inputs);
        assert_eq!(u1.as_slice(), &[7.5, 100.0]);

        // Step 2: u=(7.5, 100), y=25, r=30  ->  es=0.5
        //   u' = (7.5 + 1*1*10 + 0.25*0.5*10, 100 + 2*1*100 + 0.5*0.5*100)
        //      = (18.75, 325); x' = 1
        feed(&mut arena, &ctl, [7.5, 100.0], 25.0, 30.0);
        ctl.run(&mut arena).unwrap();
        let u2 = arena.transmit_all(ctl.new_inputs);
        assert_eq!(u2.as_slice(), &[18.75, 325.0]);
    }

    #[test]
    fn off_period_ticks_republish_current_inputs() {
        let tmp = TempDir::new().unwrap();
        write_controller_files(tmp.path(), "ctl");
        let ss = StateSpace::from_files(tmp.path(), "ctl").unwrap();

        let mut arena = PortArena::new();
        let mut ctl = wired_controller(&mut arena, ControlLaw::StateSpace(ss), 2);

        // period=2 and cycles starts at period, so tick 1 fires, tick 2
        // republishes.
        feed(&mut arena, &ctl, [5.0, 50.0], 20.0, 30.0);
        ctl.run(&mut arena).unwrap();
        assert_eq!(arena.transmit_all(ctl.new_inputs).as_slice(), &[7.5, 100.0]);

        feed(&mut arena, &ctl, [7.5, 100.0], 29.0, 30.0);
        ctl.run(&mut arena).unwrap();
        assert_eq!(
            arena.transmit_all(ctl.new_inputs).as_slice(),
            &[7.5, 100.0]
        );
    }

    #[test]
    fn targets_are_echoed_every_tick() {
        let mut arena = PortArena::new();
        let mut ctl = wired_controller(&mut arena, ControlLaw::Hold, 1);

        feed(&mut arena, &ctl, [1.0, 2.0], 0.0, 42.0);
        ctl.run(&mut arena).unwrap();
        assert_eq!(arena.transmit_all(ctl.curr_targets_echo).as_slice(), &[42.0]);
    }

    #[test]
    fn hold_law_republishes_inputs() {
        let mut arena = PortArena::new();
        let mut ctl = wired_controller(&mut arena, ControlLaw::Hold, 1);

        feed(&mut arena, &ctl, [3.0, 4.0], 0.0, 0.0);
        ctl.run(&mut arena).unwrap();
        assert_eq!(arena.transmit_all(ctl.new_inputs).as_slice(), &[3.0, 4.0]);
    }
}
