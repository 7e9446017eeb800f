// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

mod controller;
mod inputs;
mod manager;
mod planner;
mod sensors;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;

use controller::ControlLaw;
use controller::StateSpace;
use inputs::Input;
use manager::Manager;
use manager::Mode;
use planner::MaskKind;
use sensors::Sensor;

/// wattmask: a closed-loop runtime that shapes the power signature of a
/// multi-core host.
///
/// Each tick the runtime samples hardware telemetry (time, RAPL CPU power)
/// and drives three actuators: per-core CPU frequency, forced idle through
/// Intel Powerclamp, and the intensity of the companion power-balloon
/// workload.
///
/// Baseline mode only observes. Sysid mode excites selected actuators with
/// bounded piecewise-constant random signals so an offline procedure can fit
/// a plant model. Mask mode closes the loop: a planner generates synthetic
/// target waveforms and a robust state-space controller tracks them,
/// masking the machine's natural power profile.
///
/// The sample stream goes to stdout, one space-separated line per tick,
/// preceded by a header line of pin names. Diagnostics go to stderr.
#[derive(Debug, Parser)]
struct Opts {
    /// Operating mode.
    #[clap(long, value_enum)]
    mode: Mode,

    /// Space-separated names of the inputs to excite in Sysid mode, e.g.
    /// "CPUFreq IdlePct PBalloon".
    #[clap(long, default_value = "")]
    idips: String,

    /// Target waveform for Mask mode.
    #[clap(long, value_enum)]
    mask: Option<MaskKind>,

    /// Directory holding the controller and planner coefficient files.
    #[clap(long)]
    ctldir: Option<PathBuf>,

    /// File-name prefix of the coefficient files under --ctldir.
    #[clap(long)]
    ctlfile: Option<String>,

    /// Tick period in milliseconds.
    #[clap(long, default_value = "20")]
    interval_ms: u64,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// The controller fires every tick; the mask generator every third
/// controller invocation, giving the loop time to converge between target
/// moves.
const CONTROLLER_PERIOD: u32 = 1;
const MASK_GEN_PERIOD: u32 = 3;

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let mut manager = Manager::new(opts.interval_ms, opts.mode);

    let time = Sensor::time(manager.arena_mut(), "Time")?;
    manager.add_sensor(time)?;
    let power = Sensor::cpu_power(manager.arena_mut(), "CPUPower")?;
    manager.add_sensor(power)?;

    let freq = Input::cpu_freq(manager.arena_mut(), "CPUFreq")?;
    manager.add_input(freq)?;
    let idle = Input::idle_inject(manager.arena_mut(), "IdlePct")?;
    manager.add_input(idle)?;
    let balloon = Input::power_balloon(manager.arena_mut(), "PBalloon")?;
    manager.add_input(balloon)?;

    match opts.mode {
        Mode::Baseline => {}
        Mode::Sysid => {
            let names: Vec<String> = opts.idips.split_whitespace().map(String::from).collect();
            if names.is_empty() {
                bail!("No --idips specified. --idips should list input names");
            }
            manager.add_sysid_params(names, vec![], vec![], vec![])?;
        }
        Mode::Mask => {
            let mask = match opts.mask {
                Some(mask) => mask,
                None => bail!(
                    "No --mask specified. --mask should be one of \
                     Constant, Uniform, Gauss, GaussSine, Sine, Preset"
                ),
            };
            let dir = match &opts.ctldir {
                Some(dir) => dir.clone(),
                None => bail!("No --ctldir specified."),
            };
            let prefix = match &opts.ctlfile {
                Some(prefix) => prefix.clone(),
                None => bail!("No --ctlfile specified."),
            };

            let law = ControlLaw::StateSpace(StateSpace::from_files(&dir, &prefix)?);
            manager.add_controller(
                "WattController",
                &["CPUPower"],
                &["CPUFreq", "IdlePct", "PBalloon"],
                law,
                CONTROLLER_PERIOD,
            )?;

            // A Uniform mask is already piecewise random; parameter
            // randomization applies to the other waveforms.
            let randomize = mask != MaskKind::Uniform;
            manager.add_mask_generator(
                "WattMaskGen",
                "WattController",
                mask,
                &dir,
                &prefix,
                MASK_GEN_PERIOD * CONTROLLER_PERIOD,
                randomize,
            )?;
        }
    }

    info!("wattmask starting in {:?} mode", opts.mode);
    manager.run(shutdown)
}
