// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Inputs (actuators) both sample and write one knob of the host. Each
//! carries a discrete set of allowed values; whatever arrives on the input
//! port is quantized to the nearest allowed value before being applied.
//!
//! Three inputs are defined: per-core CPU frequency, forced-idle injection
//! through Intel Powerclamp, and the level of the companion power-balloon
//! workload.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::debug;
use rand::rngs::SmallRng;
use rand::Rng;

use wattmask_utils::graph::PortArena;
use wattmask_utils::graph::PortId;
use wattmask_utils::linalg::Vector;
use wattmask_utils::misc::read_cpulist;
use wattmask_utils::misc::read_from_file;
use wattmask_utils::misc::write_to_file;
use wattmask_utils::misc::ROOT_PREFIX;

use crate::sensors::SensorCore;

/// Frequency grid step synthesized when the host does not publish
/// scaling_available_frequencies, in kHz.
const FREQ_GRID_STEP: f64 = 200000.0;

/// Quantize to the nearest allowed value. Ties resolve to the first
/// equal-distance candidate encountered. An empty allowed set passes the
/// value through.
pub fn quantize(allowed: &[f64], val: f64) -> f64 {
    let mut best = val;
    let mut best_dist = f64::INFINITY;
    for &cand in allowed {
        let dist = (cand - val).abs();
        if dist < best_dist {
            best_dist = dist;
            best = cand;
        }
    }
    best
}

/// Sensor state plus the write side: the input port, the allowed values and
/// their extremes, and the last requested/applied write.
pub struct InputCore {
    pub sensor: SensorCore,
    in_port: PortId,
    allowed: Vec<f64>,
    min_val: f64,
    max_val: f64,
    mid_val: f64,
    requested: f64,
    actual: f64,
}

impl InputCore {
    fn new(arena: &mut PortArena, name: &str) -> Result<Self> {
        let in_port = arena.add_input_port(name);
        arena.add_pin(in_port, name)?;
        Ok(Self {
            sensor: SensorCore::new(arena, name, &[name])?,
            in_port,
            allowed: vec![],
            min_val: 0.0,
            max_val: 0.0,
            mid_val: 0.0,
            requested: 0.0,
            actual: 0.0,
        })
    }

    fn set_allowed(&mut self, allowed: Vec<f64>) -> Result<()> {
        if allowed.is_empty() {
            bail!("No allowed values for input {}", self.sensor.name());
        }
        self.min_val = allowed.iter().cloned().fold(f64::INFINITY, f64::min);
        self.max_val = allowed.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        self.mid_val = (self.min_val + self.max_val) / 2.0;
        self.allowed = allowed;
        Ok(())
    }

    fn prepare(&mut self, val: f64) {
        self.requested = val;
        self.actual = quantize(&self.allowed, val);
    }
}

pub enum Input {
    CpuFreq(CpuFreq),
    IdleInject(IdleInject),
    PowerBalloon(PowerBalloon),
}

impl Input {
    pub fn cpu_freq(arena: &mut PortArena, name: &str) -> Result<Self> {
        Ok(Input::CpuFreq(CpuFreq::with_root(arena, name, &ROOT_PREFIX)?))
    }

    pub fn idle_inject(arena: &mut PortArena, name: &str) -> Result<Self> {
        Ok(Input::IdleInject(IdleInject::with_root(
            arena,
            name,
            &ROOT_PREFIX,
        )?))
    }

    pub fn power_balloon(arena: &mut PortArena, name: &str) -> Result<Self> {
        Ok(Input::PowerBalloon(PowerBalloon::with_root(
            arena,
            name,
            &ROOT_PREFIX,
        )?))
    }

    pub fn core(&self) -> &InputCore {
        match self {
            Input::CpuFreq(i) => &i.core,
            Input::IdleInject(i) => &i.core,
            Input::PowerBalloon(i) => &i.core,
        }
    }

    fn core_mut(&mut self) -> &mut InputCore {
        match self {
            Input::CpuFreq(i) => &mut i.core,
            Input::IdleInject(i) => &mut i.core,
            Input::PowerBalloon(i) => &mut i.core,
        }
    }

    pub fn name(&self) -> &str {
        self.core().sensor.name()
    }

    pub fn out_port(&self) -> PortId {
        self.core().sensor.out_port()
    }

    pub fn in_port(&self) -> PortId {
        self.core().in_port
    }

    pub fn allowed_values(&self) -> &[f64] {
        &self.core().allowed
    }

    /// Sample the realized actuator value and publish it.
    pub fn update_from_system(&mut self, arena: &mut PortArena) -> Result<()> {
        let now = Instant::now();
        match self {
            Input::CpuFreq(i) => i.read(arena, now)?,
            Input::IdleInject(i) => i.read(now),
            Input::PowerBalloon(i) => i.read(now),
        }
        let core = self.core();
        arena.update_port(core.sensor.out_port(), &core.sensor.values)
    }

    /// Quantize and apply whatever arrived on the input port since the last
    /// tick. A port with no unread values skips the write entirely.
    pub fn apply_to_system(&mut self, arena: &mut PortArena) -> Result<()> {
        if !arena.values_unread(self.core().in_port) {
            debug!("No new values for {}", self.name());
            return Ok(());
        }
        let req = arena.read_port(self.core().in_port);
        let core = self.core_mut();
        core.prepare(req[0]);
        debug!(
            "{}: asked to write {}, writing {}",
            self.name(),
            self.core().requested,
            self.core().actual
        );
        self.write();
        Ok(())
    }

    fn write(&mut self) {
        match self {
            Input::CpuFreq(i) => i.write(),
            Input::IdleInject(i) => i.write(),
            Input::PowerBalloon(i) => i.write(),
        }
    }

    pub fn set_random_value(&mut self, arena: &mut PortArena, rng: &mut SmallRng) -> Result<()> {
        let allowed = &self.core().allowed;
        let val = allowed[rng.gen_range(0..allowed.len())];
        arena.receive_all(self.core().in_port, &vec![val].into())
    }

    pub fn set_min_value(&mut self, arena: &mut PortArena) -> Result<()> {
        arena.receive_all(self.core().in_port, &vec![self.core().min_val].into())
    }

    /// Drive the actuator to a safe post-run state.
    pub fn reset(&mut self) {
        match self {
            Input::CpuFreq(i) => i.reset(),
            Input::IdleInject(i) => i.reset(),
            Input::PowerBalloon(i) => i.reset(),
        }
    }

    /// Time a max-to-min and a min-to-max write, in microseconds. Used to
    /// characterize actuation latency before a system-identification run.
    pub fn measure_write_latency(&mut self) -> Vector {
        let (min_val, max_val) = (self.core().min_val, self.core().max_val);

        self.core_mut().prepare(max_val);
        self.write();

        self.core_mut().prepare(min_val);
        let begin = Instant::now();
        self.write();
        let max_to_min = begin.elapsed().as_micros() as f64;

        self.core_mut().prepare(max_val);
        let begin = Instant::now();
        self.write();
        let min_to_max = begin.elapsed().as_micros() as f64;

        vec![max_to_min, min_to_max].into()
    }
}

/// CPU frequency, in kHz as cpufreq reports it.
///
/// With the userspace governor, writes go to scaling_setspeed on every core.
/// Under any other governor the min/max band is pinned to the target value;
/// to raise the frequency max is updated before min, to lower it min before
/// max, so the band stays valid throughout.
pub struct CpuFreq {
    core: InputCore,
    root: String,
    cpu_ids: Vec<usize>,
    cpuinfo_min: f64,
    cpuinfo_max: f64,
    userspace_governor: bool,
}

impl CpuFreq {
    pub fn with_root(arena: &mut PortArena, name: &str, root: &str) -> Result<Self> {
        let present: String = read_from_file(&PathBuf::from(format!(
            "{}/sys/devices/system/cpu/present",
            root
        )))
        .context("Failed to read present CPUs")?;
        let cpu_ids = read_cpulist(&present)?;
        if cpu_ids.is_empty() {
            bail!("No present CPUs");
        }
        let first = cpu_ids[0];

        let freq_dir = format!("{}/sys/devices/system/cpu/cpu{}/cpufreq", root, first);
        let cpuinfo_min: f64 = read_from_file(&PathBuf::from(format!(
            "{}/cpuinfo_min_freq",
            freq_dir
        )))?;
        let cpuinfo_max: f64 = read_from_file(&PathBuf::from(format!(
            "{}/cpuinfo_max_freq",
            freq_dir
        )))?;

        let allowed = match read_from_file::<String>(&PathBuf::from(format!(
            "{}/scaling_available_frequencies",
            freq_dir
        ))) {
            Ok(text) => {
                let mut vals = vec![];
                for tok in text.split_whitespace() {
                    match tok.parse::<f64>() {
                        Ok(v) => vals.push(v),
                        Err(_) => bail!("Bad frequency {:?} in scaling_available_frequencies", tok),
                    }
                }
                vals
            }
            Err(_) => {
                let mut vals = vec![];
                let mut v = cpuinfo_min;
                while v <= cpuinfo_max {
                    vals.push(v);
                    v += FREQ_GRID_STEP;
                }
                vals
            }
        };

        let governor: String = read_from_file(&PathBuf::from(format!(
            "{}/scaling_governor",
            freq_dir
        )))
        .unwrap_or_default();

        let mut core = InputCore::new(arena, name)?;
        core.set_allowed(allowed)?;
        let mut input = Self {
            core,
            root: root.to_string(),
            cpu_ids,
            cpuinfo_min,
            cpuinfo_max,
            userspace_governor: governor == "userspace",
        };
        input.read(arena, Instant::now())?;
        Ok(input)
    }

    fn freq_path(&self, cpu: usize, file: &str) -> PathBuf {
        PathBuf::from(format!(
            "{}/sys/devices/system/cpu/cpu{}/cpufreq/{}",
            self.root, cpu, file
        ))
    }

    fn read_cur_freq(&self) -> f64 {
        let mut cur = 0.0;
        for &cpu in &self.cpu_ids {
            match read_from_file::<f64>(&self.freq_path(cpu, "scaling_cur_freq")) {
                Ok(v) if v > cur => cur = v,
                Ok(_) => {}
                Err(e) => debug!("Frequency read failed: {}", e),
            }
        }
        cur
    }

    fn read(&mut self, arena: &mut PortArena, now: Instant) -> Result<()> {
        self.core.sensor.begin_sample(now);
        let cur = self.read_cur_freq();
        self.core.sensor.values[0] = cur;
        // The governor may not have honored the last write yet; keep the
        // request armed until the realized frequency matches.
        if self.core.actual != 0.0 && cur != self.core.actual {
            arena.receive_all(self.core.in_port, &vec![self.core.actual].into())?;
        }
        Ok(())
    }

    fn write_all(&self, file: &str, val: u64) {
        for &cpu in &self.cpu_ids {
            if let Err(e) = write_to_file(&self.freq_path(cpu, file), val) {
                debug!("Frequency write failed: {}", e);
            }
        }
    }

    fn write(&mut self) {
        let cur = self.read_cur_freq();
        let new = self.core.actual;
        if new == cur {
            return;
        }
        let val = new as u64;
        if self.userspace_governor {
            self.write_all("scaling_setspeed", val);
        } else if new > cur {
            self.write_all("scaling_max_freq", val);
            self.write_all("scaling_min_freq", val);
        } else {
            self.write_all("scaling_min_freq", val);
            self.write_all("scaling_max_freq", val);
        }
    }

    fn reset(&mut self) {
        if self.userspace_governor {
            return;
        }
        self.write_all("scaling_max_freq", self.cpuinfo_max as u64);
        self.write_all("scaling_min_freq", self.cpuinfo_min as u64);
    }
}

/// Forced-idle duty cycle through the Intel Powerclamp cooling device.
///
/// The kernel echoes back whatever was written to cur_state whether or not
/// the clamp engaged, so the sensor side reports the in-memory copy of the
/// last write instead of trusting the readback.
pub struct IdleInject {
    core: InputCore,
    cur_state_path: PathBuf,
}

impl IdleInject {
    pub fn with_root(arena: &mut PortArena, name: &str, root: &str) -> Result<Self> {
        let mut device_dir = None;
        let paths = glob(&format!("{}/sys/class/thermal/*/type", root))?;
        for type_path in paths.filter_map(Result::ok) {
            let dev_type: String = read_from_file(&type_path).unwrap_or_default();
            if dev_type == "intel_powerclamp" {
                device_dir = type_path.parent().map(|p| p.to_path_buf());
            }
        }
        let device_dir = match device_dir {
            Some(dir) => dir,
            None => bail!("Intel Powerclamp does not exist"),
        };

        let max_state: u32 = read_from_file(&device_dir.join("max_state"))?;
        let allowed = (0..=max_state).step_by(4).map(f64::from).collect();

        let mut core = InputCore::new(arena, name)?;
        core.set_allowed(allowed)?;
        let mut input = Self {
            core,
            cur_state_path: device_dir.join("cur_state"),
        };
        input.core.prepare(input.core.min_val);
        arena.receive_all(input.core.in_port, &vec![input.core.min_val].into())?;
        input.read(Instant::now());
        Ok(input)
    }

    fn read(&mut self, now: Instant) {
        self.core.sensor.begin_sample(now);
        if let Ok(-1) = read_from_file::<i64>(&self.cur_state_path) {
            self.core.sensor.values[0] = 0.0;
        }
    }

    fn write(&mut self) {
        let new = self.core.actual as u32;
        if new == self.core.sensor.values[0] as u32 {
            return;
        }
        if let Err(e) = write_to_file(&self.cur_state_path, new) {
            debug!("Powerclamp write failed: {}", e);
            return;
        }
        self.core.sensor.values[0] = self.core.actual;
    }

    fn reset(&mut self) {
        if let Err(e) = write_to_file(&self.cur_state_path, 0u32) {
            debug!("Powerclamp reset failed: {}", e);
        }
        self.core.sensor.values[0] = 0.0;
    }
}

/// Intensity level of the external power-balloon workload, exchanged over
/// two /dev/shm files: the balloon publishes its maximum level, the runtime
/// writes the requested level.
pub struct PowerBalloon {
    core: InputCore,
    level_path: PathBuf,
}

impl PowerBalloon {
    pub fn with_root(arena: &mut PortArena, name: &str, root: &str) -> Result<Self> {
        let max_path = PathBuf::from(format!("{}/dev/shm/powerBalloonMax.txt", root));
        let max_level: u32 = read_from_file(&max_path)
            .with_context(|| format!("{:?} does not exist", max_path))?;
        let allowed = (0..=max_level).step_by(2).map(f64::from).collect();

        let mut core = InputCore::new(arena, name)?;
        core.set_allowed(allowed)?;
        let mut input = Self {
            core,
            level_path: PathBuf::from(format!("{}/dev/shm/powerBalloon.txt", root)),
        };
        arena.receive_all(input.core.in_port, &vec![input.core.min_val].into())?;
        input.read(Instant::now());
        Ok(input)
    }

    fn read(&mut self, now: Instant) {
        self.core.sensor.begin_sample(now);
        match read_from_file::<f64>(&self.level_path) {
            Ok(v) => self.core.sensor.values[0] = v,
            Err(e) => debug!("Balloon read failed: {}", e),
        }
    }

    fn write(&mut self) {
        if self.core.sensor.values[0] as u32 == self.core.actual as u32 {
            return;
        }
        if let Err(e) = write_to_file(&self.level_path, self.core.actual as u32) {
            debug!("Balloon write failed: {}", e);
        }
    }

    fn reset(&mut self) {
        if let Err(e) = write_to_file(&self.level_path, self.core.min_val as u32) {
            debug!("Balloon reset failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use tempfile::TempDir;

    fn write(root: &std::path::Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn read(root: &std::path::Path, rel: &str) -> String {
        std::fs::read_to_string(root.join(rel)).unwrap()
    }

    fn fake_cpufreq_tree(root: &std::path::Path, cpus: &[usize], governor: &str) {
        write(
            root,
            "sys/devices/system/cpu/present",
            &format!("0-{}\n", cpus.len() - 1),
        );
        for &cpu in cpus {
            let dir = format!("sys/devices/system/cpu/cpu{}/cpufreq", cpu);
            write(root, &format!("{}/cpuinfo_min_freq", dir), "1000000\n");
            write(root, &format!("{}/cpuinfo_max_freq", dir), "1400000\n");
            write(
                root,
                &format!("{}/scaling_available_frequencies", dir),
                "1000000 1200000 1400000\n",
            );
            write(root, &format!("{}/scaling_governor", dir), governor);
            write(root, &format!("{}/scaling_cur_freq", dir), "1000000\n");
            write(root, &format!("{}/scaling_min_freq", dir), "1000000\n");
            write(root, &format!("{}/scaling_max_freq", dir), "1400000\n");
            write(root, &format!("{}/scaling_setspeed", dir), "1000000\n");
        }
    }

    fn fake_balloon_tree(root: &std::path::Path, max: u32) {
        write(root, "dev/shm/powerBalloonMax.txt", &format!("{}\n", max));
        write(root, "dev/shm/powerBalloon.txt", "0\n");
    }

    // ==================== Quantization ====================

    #[test]
    fn quantize_picks_nearest() {
        let allowed = [1000000.0, 1200000.0, 1400000.0];
        assert_eq!(quantize(&allowed, 1290000.0), 1200000.0);
        assert_eq!(quantize(&allowed, 1310000.0), 1400000.0);
    }

    #[test]
    fn quantize_ties_resolve_to_first_candidate() {
        let allowed = [1000000.0, 1200000.0, 1400000.0];
        assert_eq!(quantize(&allowed, 1300000.0), 1200000.0);

        // Order matters: reversed list flips the winner.
        let reversed = [1400000.0, 1200000.0, 1000000.0];
        assert_eq!(quantize(&reversed, 1300000.0), 1400000.0);
    }

    #[test]
    fn quantize_empty_passes_through() {
        assert_eq!(quantize(&[], 123.0), 123.0);
    }

    // ==================== PowerBalloon ====================

    #[test]
    fn balloon_allowed_set_and_write() {
        let tmp = TempDir::new().unwrap();
        fake_balloon_tree(tmp.path(), 20);

        let mut arena = PortArena::new();
        let mut balloon =
            PowerBalloon::with_root(&mut arena, "PBalloon", tmp.path().to_str().unwrap()).unwrap();
        assert_eq!(balloon.core.allowed.len(), 11);
        assert_eq!(balloon.core.min_val, 0.0);
        assert_eq!(balloon.core.max_val, 20.0);

        balloon.core.prepare(7.3);
        assert_eq!(balloon.core.actual, 8.0);
        balloon.write();
        assert_eq!(read(tmp.path(), "dev/shm/powerBalloon.txt"), "8");
    }

    #[test]
    fn balloon_reset_writes_min() {
        let tmp = TempDir::new().unwrap();
        fake_balloon_tree(tmp.path(), 20);

        let mut arena = PortArena::new();
        let mut balloon =
            PowerBalloon::with_root(&mut arena, "PBalloon", tmp.path().to_str().unwrap()).unwrap();
        balloon.core.prepare(20.0);
        balloon.write();
        balloon.reset();
        assert_eq!(read(tmp.path(), "dev/shm/powerBalloon.txt"), "0");
    }

    #[test]
    fn balloon_requires_max_file() {
        let tmp = TempDir::new().unwrap();
        let mut arena = PortArena::new();
        assert!(
            PowerBalloon::with_root(&mut arena, "PBalloon", tmp.path().to_str().unwrap()).is_err()
        );
    }

    // ==================== IdleInject ====================

    #[test]
    fn idle_inject_finds_powerclamp() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "sys/class/thermal/cooling_device0/type", "Fan\n");
        write(
            tmp.path(),
            "sys/class/thermal/cooling_device1/type",
            "intel_powerclamp\n",
        );
        write(tmp.path(), "sys/class/thermal/cooling_device1/max_state", "48\n");
        write(tmp.path(), "sys/class/thermal/cooling_device1/cur_state", "0\n");

        let mut arena = PortArena::new();
        let mut idle =
            IdleInject::with_root(&mut arena, "IdlePct", tmp.path().to_str().unwrap()).unwrap();
        assert_eq!(idle.core.allowed, (0..=48).step_by(4).map(f64::from).collect::<Vec<_>>());

        idle.core.prepare(9.9);
        idle.write();
        assert_eq!(
            read(tmp.path(), "sys/class/thermal/cooling_device1/cur_state"),
            "8"
        );
        // Sensor side reports the in-memory copy.
        assert_eq!(idle.core.sensor.values[0], 8.0);
    }

    #[test]
    fn idle_inject_requires_powerclamp() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "sys/class/thermal/cooling_device0/type", "Fan\n");
        let mut arena = PortArena::new();
        assert!(
            IdleInject::with_root(&mut arena, "IdlePct", tmp.path().to_str().unwrap()).is_err()
        );
    }

    // ==================== CpuFreq ====================

    #[test]
    fn cpu_freq_reads_available_frequencies() {
        let tmp = TempDir::new().unwrap();
        fake_cpufreq_tree(tmp.path(), &[0, 1], "performance\n");

        let mut arena = PortArena::new();
        let freq = CpuFreq::with_root(&mut arena, "CPUFreq", tmp.path().to_str().unwrap()).unwrap();
        assert_eq!(freq.core.allowed, vec![1000000.0, 1200000.0, 1400000.0]);
        assert!(!freq.userspace_governor);
        assert_eq!(freq.core.sensor.values[0], 1000000.0);
    }

    #[test]
    fn cpu_freq_synthesizes_grid_without_available_file() {
        let tmp = TempDir::new().unwrap();
        fake_cpufreq_tree(tmp.path(), &[0], "performance\n");
        std::fs::remove_file(
            tmp.path()
                .join("sys/devices/system/cpu/cpu0/cpufreq/scaling_available_frequencies"),
        )
        .unwrap();

        let mut arena = PortArena::new();
        let freq = CpuFreq::with_root(&mut arena, "CPUFreq", tmp.path().to_str().unwrap()).unwrap();
        assert_eq!(freq.core.allowed, vec![1000000.0, 1200000.0, 1400000.0]);
    }

    #[test]
    fn cpu_freq_raise_updates_band_on_all_cores() {
        let tmp = TempDir::new().unwrap();
        fake_cpufreq_tree(tmp.path(), &[0, 1], "performance\n");

        let mut arena = PortArena::new();
        let mut freq =
            CpuFreq::with_root(&mut arena, "CPUFreq", tmp.path().to_str().unwrap()).unwrap();
        freq.core.prepare(1400000.0);
        freq.write();

        for cpu in 0..2 {
            let dir = format!("sys/devices/system/cpu/cpu{}/cpufreq", cpu);
            assert_eq!(read(tmp.path(), &format!("{}/scaling_max_freq", dir)), "1400000");
            assert_eq!(read(tmp.path(), &format!("{}/scaling_min_freq", dir)), "1400000");
        }
    }

    #[test]
    fn cpu_freq_userspace_governor_uses_setspeed() {
        let tmp = TempDir::new().unwrap();
        fake_cpufreq_tree(tmp.path(), &[0], "userspace\n");

        let mut arena = PortArena::new();
        let mut freq =
            CpuFreq::with_root(&mut arena, "CPUFreq", tmp.path().to_str().unwrap()).unwrap();
        assert!(freq.userspace_governor);
        freq.core.prepare(1200000.0);
        freq.write();
        assert_eq!(
            read(tmp.path(), "sys/devices/system/cpu/cpu0/cpufreq/scaling_setspeed"),
            "1200000"
        );
        // The min/max band is untouched.
        assert_eq!(
            read(tmp.path(), "sys/devices/system/cpu/cpu0/cpufreq/scaling_max_freq"),
            "1400000\n"
        );
    }

    #[test]
    fn cpu_freq_reset_restores_cpuinfo_bounds() {
        let tmp = TempDir::new().unwrap();
        fake_cpufreq_tree(tmp.path(), &[0], "performance\n");

        let mut arena = PortArena::new();
        let mut freq =
            CpuFreq::with_root(&mut arena, "CPUFreq", tmp.path().to_str().unwrap()).unwrap();
        freq.core.prepare(1200000.0);
        freq.write();
        freq.reset();

        assert_eq!(
            read(tmp.path(), "sys/devices/system/cpu/cpu0/cpufreq/scaling_min_freq"),
            "1000000"
        );
        assert_eq!(
            read(tmp.path(), "sys/devices/system/cpu/cpu0/cpufreq/scaling_max_freq"),
            "1400000"
        );
    }

    // ==================== Port plumbing ====================

    #[test]
    fn apply_skips_without_unread_values() {
        let tmp = TempDir::new().unwrap();
        fake_balloon_tree(tmp.path(), 20);

        let mut arena = PortArena::new();
        let balloon =
            PowerBalloon::with_root(&mut arena, "PBalloon", tmp.path().to_str().unwrap()).unwrap();
        let mut input = Input::PowerBalloon(balloon);

        // Drain the min-value posted at construction, then apply again: the
        // second apply must not touch the file.
        input.apply_to_system(&mut arena).unwrap();
        write(tmp.path(), "dev/shm/powerBalloon.txt", "sentinel");
        input.apply_to_system(&mut arena).unwrap();
        assert_eq!(read(tmp.path(), "dev/shm/powerBalloon.txt"), "sentinel");
    }

    #[test]
    fn random_values_come_from_allowed_set() {
        let tmp = TempDir::new().unwrap();
        fake_balloon_tree(tmp.path(), 20);

        let mut arena = PortArena::new();
        let balloon =
            PowerBalloon::with_root(&mut arena, "PBalloon", tmp.path().to_str().unwrap()).unwrap();
        let mut input = Input::PowerBalloon(balloon);
        let mut rng = SmallRng::seed_from_u64(7);

        for _ in 0..50 {
            input.set_random_value(&mut arena, &mut rng).unwrap();
            let posted = arena.read_port(input.in_port())[0];
            assert!(input.allowed_values().contains(&posted));
        }
    }
}
