// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Dataflow graph
//!
//! Every runtime module (sensor, input, controller, planner) exposes ports;
//! each port is an ordered bundle of named pins, and each pin holds one real
//! value. Wires copy selected pins from an output port to same-width
//! selections on an input port, optionally delayed by a number of ticks.
//!
//! A central [`PortArena`] owns all ports. Modules and wires refer to ports
//! through stable [`PortId`] handles plus pin indices, so there are no
//! reference cycles and the topology is cheap to inspect from tests.
//!
//! The graph is composed statically during setup and is immutable while
//! ticking: pins may be appended to a port only until the first wire touches
//! it, and a destination pin may be claimed by at most one wire.

use anyhow::bail;
use anyhow::Result;

use crate::linalg::Vector;

#[derive(Debug)]
struct Pin {
    name: String,
    value: f64,
    connected: bool,
    unread: bool,
}

impl Pin {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: 0.0,
            connected: false,
            unread: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortKind {
    /// The owning module writes, the outside reads.
    Output,
    /// The outside writes, the owning module reads.
    Input,
}

#[derive(Debug)]
struct Port {
    name: String,
    kind: PortKind,
    pins: Vec<Pin>,
    /// Set once any wire references this port; pin layout is frozen after.
    wired: bool,
}

/// Stable handle to a port in a [`PortArena`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PortId(usize);

#[derive(Debug, Default)]
pub struct PortArena {
    ports: Vec<Port>,
}

impl PortArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port(&mut self, name: &str, kind: PortKind) -> PortId {
        self.ports.push(Port {
            name: name.to_string(),
            kind,
            pins: vec![],
            wired: false,
        });
        PortId(self.ports.len() - 1)
    }

    pub fn add_output_port(&mut self, name: &str) -> PortId {
        self.add_port(name, PortKind::Output)
    }

    pub fn add_input_port(&mut self, name: &str) -> PortId {
        self.add_port(name, PortKind::Input)
    }

    fn port(&self, id: PortId) -> &Port {
        &self.ports[id.0]
    }

    fn port_mut(&mut self, id: PortId) -> &mut Port {
        &mut self.ports[id.0]
    }

    pub fn port_name(&self, id: PortId) -> &str {
        &self.port(id).name
    }

    pub fn kind(&self, id: PortId) -> PortKind {
        self.port(id).kind
    }

    pub fn num_pins(&self, id: PortId) -> usize {
        self.port(id).pins.len()
    }

    pub fn pin_names(&self, id: PortId) -> Vec<String> {
        self.port(id).pins.iter().map(|p| p.name.clone()).collect()
    }

    pub fn pin_index(&self, id: PortId, name: &str) -> Result<usize> {
        let port = self.port(id);
        match port.pins.iter().position(|p| p.name == name) {
            Some(idx) => Ok(idx),
            None => bail!("Pin {} does not exist in port {}", name, port.name),
        }
    }

    /// Append a pin. Fails once the port participates in any wire, and on
    /// duplicate pin names within the port.
    pub fn add_pin(&mut self, id: PortId, name: &str) -> Result<()> {
        let port = self.port_mut(id);
        if port.wired {
            bail!(
                "Cannot add pin {} to port {}: port is already wired",
                name,
                port.name
            );
        }
        if port.pins.iter().any(|p| p.name == name) {
            bail!("Port {} already has a pin named {}", port.name, name);
        }
        port.pins.push(Pin::new(name));
        Ok(())
    }

    pub fn add_pins(&mut self, id: PortId, names: &[String]) -> Result<()> {
        for name in names {
            self.add_pin(id, name)?;
        }
        Ok(())
    }

    fn check_selection(&self, id: PortId, sel: &[usize]) -> Result<()> {
        let port = self.port(id);
        for &pin in sel {
            if pin >= port.pins.len() {
                bail!(
                    "Pin index {} out of range for port {} of width {}",
                    pin,
                    port.name,
                    port.pins.len()
                );
            }
        }
        Ok(())
    }

    /// Read selected pins of an output port, clearing their unread bits.
    pub fn transmit(&mut self, id: PortId, sel: &[usize]) -> Result<Vector> {
        self.check_selection(id, sel)?;
        let port = self.port_mut(id);
        let mut vals = Vec::with_capacity(sel.len());
        for &pin in sel {
            port.pins[pin].unread = false;
            vals.push(port.pins[pin].value);
        }
        Ok(vals.into())
    }

    /// Read every pin of an output port in pin order.
    pub fn transmit_all(&mut self, id: PortId) -> Vector {
        let sel: Vec<usize> = (0..self.num_pins(id)).collect();
        self.transmit(id, &sel).unwrap_or_default()
    }

    /// Module-side publish: set every pin of an output port and mark it
    /// unread. The vector width must match the pin count.
    pub fn update_port(&mut self, id: PortId, vals: &Vector) -> Result<()> {
        let port = self.port_mut(id);
        if vals.len() != port.pins.len() {
            bail!(
                "Port {} has {} pins but {} values were published",
                port.name,
                port.pins.len(),
                vals.len()
            );
        }
        for (pin, val) in port.pins.iter_mut().zip(vals.iter()) {
            pin.value = *val;
            pin.unread = true;
        }
        Ok(())
    }

    /// Outside-in write: set selected pins of an input port and mark them
    /// unread.
    pub fn receive(&mut self, id: PortId, sel: &[usize], vals: &Vector) -> Result<()> {
        if sel.len() != vals.len() {
            bail!(
                "Selection of width {} received {} values on port {}",
                sel.len(),
                vals.len(),
                self.port(id).name
            );
        }
        self.check_selection(id, sel)?;
        let port = self.port_mut(id);
        for (&pin, val) in sel.iter().zip(vals.iter()) {
            port.pins[pin].value = *val;
            port.pins[pin].unread = true;
        }
        Ok(())
    }

    /// Outside-in write across the whole input port.
    pub fn receive_all(&mut self, id: PortId, vals: &Vector) -> Result<()> {
        let sel: Vec<usize> = (0..self.num_pins(id)).collect();
        self.receive(id, &sel, vals)
    }

    /// Module-side read of an input port, clearing unread bits.
    pub fn read_port(&mut self, id: PortId) -> Vector {
        let port = self.port_mut(id);
        let mut vals = Vec::with_capacity(port.pins.len());
        for pin in port.pins.iter_mut() {
            pin.unread = false;
            vals.push(pin.value);
        }
        vals.into()
    }

    /// True if any pin of an input port holds a value the module has not
    /// read yet.
    pub fn values_unread(&self, id: PortId) -> bool {
        self.port(id).pins.iter().any(|p| p.unread)
    }

    /// Mark pins as wire endpoints. Destination (input-port) pins may be
    /// claimed at most once across all wires; source fan-out is unrestricted.
    fn mark_connected(&mut self, id: PortId, sel: &[usize]) -> Result<()> {
        self.check_selection(id, sel)?;
        let port = self.port_mut(id);
        for &pin in sel {
            if port.kind == PortKind::Input && port.pins[pin].connected {
                bail!(
                    "{}[{}] is already connected",
                    port.name,
                    port.pins[pin].name
                );
            }
            port.pins[pin].connected = true;
        }
        port.wired = true;
        Ok(())
    }
}

/// One-directional, possibly delayed copy link between pin selections.
#[derive(Debug)]
pub struct Wire {
    src: PortId,
    dst: PortId,
    src_pins: Vec<usize>,
    dst_pins: Vec<usize>,
    delay: u32,
    cycles: u32,
}

impl Wire {
    /// Whole-port to whole-port.
    pub fn new(arena: &mut PortArena, src: PortId, dst: PortId, delay: u32) -> Result<Self> {
        let src_pins: Vec<usize> = (0..arena.num_pins(src)).collect();
        let dst_pins: Vec<usize> = (0..arena.num_pins(dst)).collect();
        Self::by_indices(arena, src, src_pins, dst, dst_pins, delay)
    }

    /// Single pin to single pin, by index.
    pub fn by_index(
        arena: &mut PortArena,
        src: PortId,
        src_pin: usize,
        dst: PortId,
        dst_pin: usize,
        delay: u32,
    ) -> Result<Self> {
        Self::by_indices(arena, src, vec![src_pin], dst, vec![dst_pin], delay)
    }

    /// Contiguous index ranges, both ends inclusive.
    pub fn by_range(
        arena: &mut PortArena,
        src: PortId,
        src_range: (usize, usize),
        dst: PortId,
        dst_range: (usize, usize),
        delay: u32,
    ) -> Result<Self> {
        let src_pins: Vec<usize> = (src_range.0..=src_range.1).collect();
        let dst_pins: Vec<usize> = (dst_range.0..=dst_range.1).collect();
        Self::by_indices(arena, src, src_pins, dst, dst_pins, delay)
    }

    /// Explicit index lists.
    pub fn by_indices(
        arena: &mut PortArena,
        src: PortId,
        src_pins: Vec<usize>,
        dst: PortId,
        dst_pins: Vec<usize>,
        delay: u32,
    ) -> Result<Self> {
        if arena.kind(src) != PortKind::Output {
            bail!("Wire source {} is not an output port", arena.port_name(src));
        }
        if arena.kind(dst) != PortKind::Input {
            bail!(
                "Wire destination {} is not an input port",
                arena.port_name(dst)
            );
        }
        if src_pins.len() != dst_pins.len() {
            bail!(
                "Destination {} of width {} does not match source {} of width {}",
                arena.port_name(dst),
                dst_pins.len(),
                arena.port_name(src),
                src_pins.len()
            );
        }
        arena.mark_connected(src, &src_pins)?;
        arena.mark_connected(dst, &dst_pins)?;
        Ok(Self {
            src,
            dst,
            src_pins,
            dst_pins,
            delay,
            cycles: 0,
        })
    }

    /// Explicit name lists.
    pub fn by_names(
        arena: &mut PortArena,
        src: PortId,
        src_names: &[String],
        dst: PortId,
        dst_names: &[String],
        delay: u32,
    ) -> Result<Self> {
        let mut src_pins = Vec::with_capacity(src_names.len());
        for name in src_names {
            src_pins.push(arena.pin_index(src, name)?);
        }
        let mut dst_pins = Vec::with_capacity(dst_names.len());
        for name in dst_names {
            dst_pins.push(arena.pin_index(dst, name)?);
        }
        Self::by_indices(arena, src, src_pins, dst, dst_pins, delay)
    }

    /// Single pin to single pin, by name.
    pub fn by_name(
        arena: &mut PortArena,
        src: PortId,
        src_name: &str,
        dst: PortId,
        dst_name: &str,
        delay: u32,
    ) -> Result<Self> {
        Self::by_names(
            arena,
            src,
            &[src_name.to_string()],
            dst,
            &[dst_name.to_string()],
            delay,
        )
    }

    /// Per-tick action: copy source pins to destination pins once the cycle
    /// counter reaches the configured delay, otherwise keep counting. Delay
    /// zero transfers on every tick.
    pub fn transfer(&mut self, arena: &mut PortArena) -> Result<()> {
        if self.cycles == self.delay {
            self.cycles = 0;
            let vals = arena.transmit(self.src, &self.src_pins)?;
            arena.receive(self.dst, &self.dst_pins, &vals)?;
        } else {
            self.cycles += 1;
        }
        Ok(())
    }
}
