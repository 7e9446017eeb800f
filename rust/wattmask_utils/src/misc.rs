// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fmt::Display;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use sscanf::sscanf;

lazy_static::lazy_static! {
    /// Prefix applied to every absolute sysfs / /dev/shm path the runtime
    /// opens. Empty in production; tests and development sandboxes point it
    /// at a scratch tree.
    pub static ref ROOT_PREFIX: String =
        std::env::var("WATTMASK_SYSFS_PREFIX").unwrap_or("".to_string());
}

/// Read a whitespace-trimmed value from a pseudo-file. Files are opened per
/// access so the runtime stays valid across hotplug events.
pub fn read_from_file<T>(path: &Path) -> Result<T>
where
    T: FromStr,
{
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(_) => {
            bail!("Failed to open or read file {:?}", path);
        }
    };

    match val.trim().parse::<T>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            bail!("Failed to parse {:?} from {:?}", val.trim(), path);
        }
    }
}

/// Write a single value to a pseudo-file, replacing its contents.
pub fn write_to_file<T>(path: &Path, val: T) -> Result<()>
where
    T: Display,
{
    let mut file =
        File::create(path).with_context(|| format!("Failed to open {:?} for writing", path))?;
    write!(file, "{}", val)?;
    Ok(())
}

/// Parse a kernel cpulist ("0-3,8" style) into the list of CPU ids it spans.
pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0');
    let cpu_groups: Vec<&str> = cpulist.split(',').collect();
    let mut cpu_ids = vec![];
    for group in cpu_groups.iter() {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}
