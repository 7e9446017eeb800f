// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Sensors sample one quantity from the host per tick and publish it to
//! their output port. Two are defined: a monotonic time reading and the
//! average CPU power computed from the RAPL energy accumulators.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::bail;
use anyhow::Result;
use glob::glob;
use log::debug;

use wattmask_utils::linalg::Vector;
use wattmask_utils::misc::read_from_file;
use wattmask_utils::misc::ROOT_PREFIX;
use wattmask_utils::graph::PortArena;
use wattmask_utils::graph::PortId;

/// State common to every sensor: the output port, the current and previous
/// sample vectors, and the sample instants that power-style sensors derive
/// rates from.
#[derive(Debug)]
pub struct SensorCore {
    name: String,
    out: PortId,
    pub values: Vector,
    pub prev_values: Vector,
    pub sampled_at: Instant,
    pub prev_sampled_at: Instant,
}

impl SensorCore {
    pub fn new(arena: &mut PortArena, name: &str, pin_names: &[&str]) -> Result<Self> {
        let out = arena.add_output_port(name);
        for pin in pin_names {
            arena.add_pin(out, pin)?;
        }
        let now = Instant::now();
        Ok(Self {
            name: name.to_string(),
            out,
            values: Vector::zeros(pin_names.len()),
            prev_values: Vector::zeros(pin_names.len()),
            sampled_at: now,
            prev_sampled_at: now,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn out_port(&self) -> PortId {
        self.out
    }

    pub(crate) fn begin_sample(&mut self, now: Instant) {
        self.prev_values = self.values.clone();
        self.prev_sampled_at = self.sampled_at;
        self.sampled_at = now;
    }
}

pub enum Sensor {
    Time(TimeSensor),
    CpuPower(CpuPowerSensor),
}

impl Sensor {
    pub fn time(arena: &mut PortArena, name: &str) -> Result<Self> {
        Ok(Sensor::Time(TimeSensor::new(arena, name)?))
    }

    pub fn cpu_power(arena: &mut PortArena, name: &str) -> Result<Self> {
        Ok(Sensor::CpuPower(CpuPowerSensor::with_root(
            arena,
            name,
            &ROOT_PREFIX,
        )?))
    }

    pub fn core(&self) -> &SensorCore {
        match self {
            Sensor::Time(s) => &s.core,
            Sensor::CpuPower(s) => &s.core,
        }
    }

    pub fn name(&self) -> &str {
        &self.core().name
    }

    pub fn out_port(&self) -> PortId {
        self.core().out
    }

    /// Take a fresh sample and publish it to the output port.
    pub fn update_from_system(&mut self, arena: &mut PortArena) -> Result<()> {
        let now = Instant::now();
        match self {
            Sensor::Time(s) => s.read(now),
            Sensor::CpuPower(s) => s.read(now),
        }
        let core = self.core();
        arena.update_port(core.out, &core.values)
    }
}

/// Seconds on the monotonic clock, as a real number. Rate computations
/// elsewhere also use the monotonic clock, so the sample stream stays
/// consistent across wall-clock adjustments.
pub struct TimeSensor {
    core: SensorCore,
}

impl TimeSensor {
    pub fn new(arena: &mut PortArena, name: &str) -> Result<Self> {
        let mut sensor = Self {
            core: SensorCore::new(arena, name, &[name])?,
        };
        sensor.read(Instant::now());
        Ok(sensor)
    }

    fn read(&mut self, now: Instant) {
        self.core.begin_sample(now);
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        self.core.values[0] = ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9;
    }
}

/// Average CPU power in watts, from the RAPL energy accumulators: the
/// microjoule delta since the previous sample divided by the elapsed
/// microseconds.
pub struct CpuPowerSensor {
    core: SensorCore,
    energy_files: Vec<PathBuf>,
    energy_ctr: f64,
}

impl CpuPowerSensor {
    pub fn with_root(arena: &mut PortArena, name: &str, root: &str) -> Result<Self> {
        let rapl = format!("{}/sys/class/powercap/intel-rapl", root);
        let mut energy_files = vec![];

        // If the first subdomain covers all cores, its single accumulator is
        // enough; otherwise sum the package-level domains.
        let sub_name: String =
            read_from_file(&PathBuf::from(format!("{}/intel-rapl:0/intel-rapl:0:0/name", rapl)))
                .unwrap_or_default();
        if sub_name.contains("core") {
            energy_files.push(PathBuf::from(format!(
                "{}/intel-rapl:0/intel-rapl:0:0/energy_uj",
                rapl
            )));
        } else {
            let paths = glob(&format!("{}/intel-rapl:[0-9]*/energy_uj", rapl))?;
            for path in paths.filter_map(Result::ok) {
                energy_files.push(path);
            }
        }
        if energy_files.is_empty() {
            bail!("No RAPL energy accumulators found under {}", rapl);
        }
        debug!("RAPL accumulators: {:?}", energy_files);

        let mut sensor = Self {
            core: SensorCore::new(arena, name, &[name])?,
            energy_files,
            energy_ctr: 0.0,
        };
        // Prime the counter so the first per-tick delta is meaningful
        // instead of the accumulator's absolute value.
        sensor.energy_ctr = sensor.read_energy();
        Ok(sensor)
    }

    fn read_energy(&self) -> f64 {
        let mut total = 0.0;
        for file in &self.energy_files {
            match read_from_file::<f64>(file) {
                Ok(uj) => total += uj,
                Err(e) => debug!("Energy read failed: {}", e),
            }
        }
        total
    }

    fn read(&mut self, now: Instant) {
        self.core.begin_sample(now);

        let ctr = self.read_energy();
        let delta_uj = ctr - self.energy_ctr;
        self.energy_ctr = ctr;

        let delta_us = self
            .core
            .sampled_at
            .duration_since(self.core.prev_sampled_at)
            .as_micros() as f64;
        self.core.values[0] = if delta_us > 0.0 {
            delta_uj / delta_us
        } else {
            0.0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &std::path::Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn time_sensor_is_monotonic() {
        let mut arena = PortArena::new();
        let mut sensor = Sensor::time(&mut arena, "Time").unwrap();

        sensor.update_from_system(&mut arena).unwrap();
        let first = arena.transmit_all(sensor.out_port())[0];
        sensor.update_from_system(&mut arena).unwrap();
        let second = arena.transmit_all(sensor.out_port())[0];

        assert!(first > 0.0);
        assert!(second >= first);
    }

    #[test]
    fn cpu_power_sums_package_domains() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "sys/class/powercap/intel-rapl/intel-rapl:0/intel-rapl:0:0/name", "uncore\n");
        write(root, "sys/class/powercap/intel-rapl/intel-rapl:0/energy_uj", "1000\n");
        write(root, "sys/class/powercap/intel-rapl/intel-rapl:1/energy_uj", "2000\n");

        let mut arena = PortArena::new();
        let sensor =
            CpuPowerSensor::with_root(&mut arena, "CPUPower", root.to_str().unwrap()).unwrap();
        assert_eq!(sensor.energy_files.len(), 2);
        assert_eq!(sensor.energy_ctr, 3000.0);
    }

    #[test]
    fn cpu_power_prefers_core_domain() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "sys/class/powercap/intel-rapl/intel-rapl:0/intel-rapl:0:0/name", "core\n");
        write(root, "sys/class/powercap/intel-rapl/intel-rapl:0/intel-rapl:0:0/energy_uj", "500\n");
        write(root, "sys/class/powercap/intel-rapl/intel-rapl:0/energy_uj", "9999\n");

        let mut arena = PortArena::new();
        let sensor =
            CpuPowerSensor::with_root(&mut arena, "CPUPower", root.to_str().unwrap()).unwrap();
        assert_eq!(sensor.energy_files.len(), 1);
        assert_eq!(sensor.energy_ctr, 500.0);
    }

    #[test]
    fn cpu_power_requires_rapl() {
        let tmp = TempDir::new().unwrap();
        let mut arena = PortArena::new();
        assert!(
            CpuPowerSensor::with_root(&mut arena, "CPUPower", tmp.path().to_str().unwrap())
                .is_err()
        );
    }

    #[test]
    fn cpu_power_reports_watts() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "sys/class/powercap/intel-rapl/intel-rapl:0/intel-rapl:0:0/name", "pkg\n");
        write(root, "sys/class/powercap/intel-rapl/intel-rapl:0/energy_uj", "0\n");

        let mut arena = PortArena::new();
        let mut sensor =
            CpuPowerSensor::with_root(&mut arena, "CPUPower", root.to_str().unwrap()).unwrap();

        // 40 W over 50 ms elapses 2000 uJ.
        write(root, "sys/class/powercap/intel-rapl/intel-rapl:0/energy_uj", "2000\n");
        let earlier = Instant::now() - std::time::Duration::from_millis(50);
        sensor.core.sampled_at = earlier;
        sensor.read(earlier + std::time::Duration::from_millis(50));

        let watts = sensor.core.values[0];
        assert!((watts - 0.04).abs() < 0.01, "got {} W", watts);
    }
}
