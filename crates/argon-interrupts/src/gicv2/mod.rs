//! ARM Generic Interrupt Controller v2 model, including the GICv2
//! virtualization extension (hypervisor list registers).
//!
//! The model is the pure interrupt state machine: per-line
//! enable/pending/active/level state, per-processor banked register views,
//! priority arbitration with preemption, and the acknowledge/end-of-interrupt
//! protocol on both the physical and the virtual path. Bus address decode is
//! the surrounding machine's job; it calls the per-block
//! `distif_*`/`cpuif_*`/`vifctrl_*`/`vcpuif_*` register handlers with the
//! accessing processor id and a block-relative offset.
//!
//! Interrupt ids follow the architecture: 0..16 are software-generated
//! (SGI), 16..32 private peripheral (PPI, one instance per processor), 32..
//! shared peripheral (SPI). Output lines (one IRQ and one VIRQ level per
//! processor) are recomputed after every mutation; consumers poll
//! [`Gicv2::irq_asserted`] or drain [`Gicv2::take_events`].

mod cpu_interface;
mod distributor;
mod snapshot;
mod virt;

pub(crate) use cpu_interface::CpuInterface;
pub(crate) use distributor::Distributor;
pub(crate) use virt::{HcrFlags, ListRegister, VirtCpuInterface, VirtInterfaceControl};

/// Software-generated interrupts: ids `0..16`.
pub const NUM_SGI: u16 = 16;
/// Private peripheral interrupts: ids `16..32`.
pub const NUM_PPI: u16 = 16;
/// First shared peripheral interrupt id.
pub const NUM_PRIVATE: u16 = NUM_SGI + NUM_PPI;
/// Architectural limit on usable interrupt ids.
pub const MAX_IRQ: u16 = 1020;
/// Hard limit on processors (target masks are 8-bit).
pub const MAX_CPU: usize = 8;
/// Id returned by an acknowledge when no eligible interrupt exists.
pub const SPURIOUS_IRQ: u16 = 1023;
/// Running priority when nothing is being serviced.
pub const IDLE_PRIORITY: u32 = 0xFF;
/// List-register slots per processor (GIC-400 has four).
pub const NUM_LIST_REGS: usize = 4;
/// Lowest binary point implemented on the virtual path.
pub const VIRT_MIN_BPR: u32 = 2;

/// Target mask covering every possible processor.
pub(crate) const ALL_CPU: u8 = 0xFF;

pub(crate) const CTLR_ENABLE: u32 = 1 << 0;
pub(crate) const COMPONENT_ID: u32 = 0xB105_F00D;
/// ARM-implementer interface identification.
pub(crate) const INTERFACE_IIDR: u32 = 0x0002_043B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Edge,
    Level,
}

/// Delivery model: `NToN` delivers to each processor in the target mask
/// independently, `NTo1` to exactly one processor (acknowledge/EOI then act
/// on all processors at once).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetModel {
    NToN,
    NTo1,
}

/// Per-line interrupt state. All bitmasks are indexed by processor.
#[derive(Debug, Clone)]
pub(crate) struct IrqState {
    pub enabled: u8,
    pub pending: u8,
    pub active: u8,
    pub level: u8,
    /// Set on acknowledge, cleared on a wire transition; keeps an already
    /// acknowledged level-triggered line from re-pending until the wire
    /// toggles.
    pub signaled: u8,
    pub model: TargetModel,
    pub trigger: Trigger,
}

impl Default for IrqState {
    fn default() -> Self {
        Self {
            enabled: 0,
            pending: 0,
            active: 0,
            level: 0,
            signaled: 0,
            model: TargetModel::NToN,
            trigger: Trigger::Edge,
        }
    }
}

/// Edge event on one of the per-processor output lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEvent {
    Irq { cpu: usize, level: bool },
    Virq { cpu: usize, level: bool },
}

#[derive(Debug, Clone, Copy)]
pub struct GicConfig {
    pub num_cpus: usize,
    /// Shared peripheral lines wired into the distributor. Rounded up to a
    /// multiple of 32 (the distributor register granularity).
    pub num_spis: usize,
}

#[derive(Debug)]
pub struct Gicv2 {
    num_cpus: usize,
    num_irqs: u16,
    lines: Vec<IrqState>,
    dist: Distributor,
    cpuif: CpuInterface,
    vifctrl: VirtInterfaceControl,
    vcpuif: VirtCpuInterface,
    irq_out: [bool; MAX_CPU],
    virq_out: [bool; MAX_CPU],
    events: Vec<LineEvent>,
}

impl Gicv2 {
    pub fn new(config: GicConfig) -> Self {
        assert!(
            (1..=MAX_CPU).contains(&config.num_cpus),
            "unsupported processor count {}",
            config.num_cpus
        );
        let num_spis = config.num_spis.div_ceil(32) * 32;
        assert!(
            num_spis <= (MAX_IRQ - NUM_PRIVATE) as usize,
            "too many shared interrupt lines ({})",
            config.num_spis
        );
        let num_irqs = NUM_PRIVATE + num_spis as u16;

        let mut gic = Self {
            num_cpus: config.num_cpus,
            num_irqs,
            lines: vec![IrqState::default(); num_irqs as usize],
            dist: Distributor::new(num_spis),
            cpuif: CpuInterface::new(num_irqs),
            vifctrl: VirtInterfaceControl::new(),
            vcpuif: VirtCpuInterface::new(),
            irq_out: [false; MAX_CPU],
            virq_out: [false; MAX_CPU],
            events: Vec::new(),
        };
        gic.reset();
        gic
    }

    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    pub fn num_irqs(&self) -> u16 {
        self.num_irqs
    }

    /// Returns the model to its reset state (configuration is preserved).
    pub fn reset(&mut self) {
        for line in &mut self.lines {
            *line = IrqState::default();
        }
        // SGIs are enabled by default and cannot be disabled.
        for irq in 0..NUM_SGI {
            self.enable_irq(irq, ALL_CPU);
        }
        self.dist.reset();
        self.cpuif.reset();
        self.vifctrl.reset();
        self.vcpuif.reset();
        self.irq_out = [false; MAX_CPU];
        self.virq_out = [false; MAX_CPU];
        self.events.clear();
    }

    // ---- interrupt state table -------------------------------------------

    pub(crate) fn enable_irq(&mut self, irq: u16, mask: u8) {
        self.lines[irq as usize].enabled |= mask;
    }

    pub(crate) fn disable_irq(&mut self, irq: u16, mask: u8) {
        if irq < NUM_SGI {
            return; // SGIs cannot be disabled
        }
        self.lines[irq as usize].enabled &= !mask;
    }

    pub(crate) fn is_irq_enabled(&self, irq: u16, mask: u8) -> bool {
        self.lines[irq as usize].enabled & mask != 0
    }

    pub(crate) fn set_irq_pending(&mut self, irq: u16, pending: bool, mask: u8) {
        let line = &mut self.lines[irq as usize];
        if pending {
            line.pending |= mask;
        } else {
            line.pending &= !mask;
        }
    }

    pub(crate) fn is_irq_pending(&self, irq: u16, mask: u8) -> bool {
        self.lines[irq as usize].pending & mask != 0
    }

    /// True if the line requests service for any processor in `mask`: either
    /// latched pending, or level-triggered with the wire asserted and not yet
    /// acknowledged.
    pub(crate) fn test_pending(&self, irq: u16, mask: u8) -> bool {
        let line = &self.lines[irq as usize];
        if line.pending & mask != 0 {
            return true;
        }
        line.trigger == Trigger::Level && line.level & mask != 0 && line.signaled & mask == 0
    }

    pub(crate) fn set_irq_active(&mut self, irq: u16, active: bool, mask: u8) {
        let line = &mut self.lines[irq as usize];
        if active {
            line.active |= mask;
        } else {
            line.active &= !mask;
        }
    }

    pub(crate) fn is_irq_active(&self, irq: u16, mask: u8) -> bool {
        self.lines[irq as usize].active & mask != 0
    }

    pub(crate) fn set_irq_level(&mut self, irq: u16, level: bool, mask: u8) {
        let line = &mut self.lines[irq as usize];
        if level {
            line.level |= mask;
        } else {
            line.level &= !mask;
        }
    }

    pub(crate) fn get_irq_level(&self, irq: u16, mask: u8) -> bool {
        self.lines[irq as usize].level & mask != 0
    }

    pub(crate) fn set_irq_signaled(&mut self, irq: u16, signaled: bool, mask: u8) {
        let line = &mut self.lines[irq as usize];
        if signaled {
            line.signaled |= mask;
        } else {
            line.signaled &= !mask;
        }
    }

    pub(crate) fn set_irq_trigger(&mut self, irq: u16, trigger: Trigger) {
        self.lines[irq as usize].trigger = trigger;
    }

    pub(crate) fn get_irq_trigger(&self, irq: u16) -> Trigger {
        self.lines[irq as usize].trigger
    }

    pub(crate) fn get_irq_model(&self, irq: u16) -> TargetModel {
        self.lines[irq as usize].model
    }

    pub(crate) fn get_irq_priority(&self, cpu: usize, irq: u16) -> u8 {
        if irq < NUM_SGI {
            self.dist.sgi_priority[cpu][irq as usize]
        } else if irq < NUM_PRIVATE {
            self.dist.ppi_priority[cpu][(irq - NUM_SGI) as usize]
        } else if irq < self.num_irqs {
            self.dist.spi_priority[(irq - NUM_PRIVATE) as usize]
        } else {
            log::error!("priority request for invalid irq {irq}");
            0
        }
    }

    /// Validates the processor id attached to a register access. Invalid ids
    /// degrade to processor 0 with a warning rather than failing the access.
    pub(crate) fn check_cpu(&self, cpu: usize) -> usize {
        if cpu >= self.num_cpus {
            log::warn!("invalid cpu {cpu}, assuming 0");
            0
        } else {
            cpu
        }
    }

    // ---- wire inputs ------------------------------------------------------

    /// Level transition on a private peripheral wire of one processor.
    pub fn set_ppi_level(&mut self, cpu: usize, irq: u16, level: bool) {
        if cpu >= self.num_cpus {
            log::warn!("ppi level change for invalid cpu {cpu} ignored");
            return;
        }
        if !(NUM_SGI..NUM_PRIVATE).contains(&irq) {
            log::warn!("ppi level change for invalid irq {irq} ignored");
            return;
        }
        let mask = 1u8 << cpu;
        self.set_irq_level(irq, level, mask);
        self.set_irq_signaled(irq, false, ALL_CPU);
        if self.get_irq_trigger(irq) == Trigger::Edge && level {
            self.set_irq_pending(irq, true, mask);
        }
        self.update(false);
    }

    /// Level transition on a shared peripheral wire. Edge-triggered lines
    /// latch pending for the processors in the line's target register.
    pub fn set_spi_level(&mut self, irq: u16, level: bool) {
        if !(NUM_PRIVATE..self.num_irqs).contains(&irq) {
            log::warn!("spi level change for invalid irq {irq} ignored");
            return;
        }
        let targets = self.dist.spi_targets[(irq - NUM_PRIVATE) as usize];
        self.set_irq_level(irq, level, ALL_CPU);
        self.set_irq_signaled(irq, false, ALL_CPU);
        if self.get_irq_trigger(irq) == Trigger::Edge && level {
            self.set_irq_pending(irq, true, targets);
        }
        self.update(false);
    }

    // ---- output lines -----------------------------------------------------

    pub fn irq_asserted(&self, cpu: usize) -> bool {
        self.irq_out[cpu]
    }

    pub fn virq_asserted(&self, cpu: usize) -> bool {
        self.virq_out[cpu]
    }

    /// Drains the queued output-line edges accumulated since the last call.
    pub fn take_events(&mut self) -> Vec<LineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Recomputes both output paths from current state. Intended for use
    /// after a snapshot restore; levels are not part of the snapshot.
    pub fn sync_lines(&mut self) {
        self.update(false);
        self.update(true);
    }

    fn set_output(&mut self, cpu: usize, virt: bool, level: bool) {
        let out = if virt {
            &mut self.virq_out[cpu]
        } else {
            &mut self.irq_out[cpu]
        };
        if *out == level {
            return;
        }
        *out = level;
        log::debug!(
            "{} {}[{cpu}]",
            if level { "raising" } else { "lowering" },
            if virt { "virq" } else { "irq" },
        );
        self.events.push(if virt {
            LineEvent::Virq { cpu, level }
        } else {
            LineEvent::Irq { cpu, level }
        });
    }

    // ---- arbitration ------------------------------------------------------

    /// Recomputes, for every processor, the best candidate on the given path
    /// and drives the output line. Idempotent; invoked after every mutation.
    pub(crate) fn update(&mut self, virt: bool) {
        for cpu in 0..self.num_cpus {
            if virt {
                self.update_virtual(cpu);
            } else {
                self.update_physical(cpu);
            }
        }
    }

    fn update_physical(&mut self, cpu: usize) {
        self.cpuif.hppir[cpu] = SPURIOUS_IRQ;
        if self.dist.ctlr & CTLR_ENABLE == 0 || self.cpuif.ctlr[cpu] & CTLR_ENABLE == 0 {
            self.set_output(cpu, false, false);
            return;
        }

        let mask = 1u8 << cpu;
        let mut best_irq = SPURIOUS_IRQ;
        let mut best_prio = IDLE_PRIORITY;

        // Scan order is part of the contract: SGIs, then PPIs, then SPIs,
        // ascending id within each class; ties keep the first hit.
        for irq in 0..NUM_SGI {
            if self.is_candidate(irq, mask) {
                let prio = self.dist.sgi_priority[cpu][irq as usize] as u32;
                if prio < best_prio {
                    best_prio = prio;
                    best_irq = irq;
                }
            }
        }
        for irq in NUM_SGI..NUM_PRIVATE {
            if self.is_candidate(irq, mask) {
                let prio = self.dist.ppi_priority[cpu][(irq - NUM_SGI) as usize] as u32;
                if prio < best_prio {
                    best_prio = prio;
                    best_irq = irq;
                }
            }
        }
        for irq in NUM_PRIVATE..self.num_irqs {
            let idx = (irq - NUM_PRIVATE) as usize;
            if self.dist.spi_targets[idx] & mask != 0 && self.is_candidate(irq, mask) {
                let prio = self.dist.spi_priority[idx] as u32;
                if prio < best_prio {
                    best_prio = prio;
                    best_irq = irq;
                }
            }
        }

        let mut line = false;
        if best_prio < self.cpuif.pmr[cpu] {
            self.cpuif.hppir[cpu] = best_irq;
            // Best-pending is necessary but not sufficient: the candidate
            // must also preempt whatever is currently being serviced.
            if best_prio < self.cpuif.rpr[cpu] {
                line = true;
            }
        }
        self.set_output(cpu, false, line);
    }

    fn update_virtual(&mut self, cpu: usize) {
        self.vcpuif.hppir[cpu] = SPURIOUS_IRQ;
        if !HcrFlags::from_bits_retain(self.vifctrl.hcr[cpu]).contains(HcrFlags::EN) {
            self.set_output(cpu, true, false);
            return;
        }

        let mut best_slot = None;
        let mut best_prio = IDLE_PRIORITY;
        for (idx, slot) in self.vifctrl.lr[cpu].iter().enumerate() {
            if slot.pending && (slot.prio as u32) < best_prio {
                best_prio = slot.prio as u32;
                best_slot = Some(idx);
            }
        }

        let mut line = false;
        if best_prio < self.vcpuif.pmr[cpu] {
            if let Some(idx) = best_slot {
                self.vcpuif.hppir[cpu] = self.vifctrl.lr[cpu][idx].virtual_id;
            }
            if best_prio < self.vcpuif.rpr[cpu] {
                line = true;
            }
        }
        self.set_output(cpu, true, line);
    }

    fn is_candidate(&self, irq: u16, mask: u8) -> bool {
        self.is_irq_enabled(irq, mask)
            && self.test_pending(irq, mask)
            && !self.is_irq_active(irq, mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gic(num_cpus: usize) -> Gicv2 {
        let mut gic = Gicv2::new(GicConfig {
            num_cpus,
            num_spis: 64,
        });
        // Forward interrupts globally and on every cpu interface; leave the
        // priority mask wide open.
        gic.distif_write(0, distributor::GICD_CTLR, 1);
        for cpu in 0..num_cpus {
            gic.cpuif_write(cpu, cpu_interface::GICC_CTLR, 1);
            gic.cpuif_write(cpu, cpu_interface::GICC_PMR, 0xFF);
        }
        gic
    }

    #[test]
    fn sgis_are_always_enabled() {
        let gic = Gicv2::new(GicConfig {
            num_cpus: 2,
            num_spis: 32,
        });
        for irq in 0..NUM_SGI {
            assert!(gic.is_irq_enabled(irq, ALL_CPU));
        }
    }

    #[test]
    fn spi_count_rounds_up_to_register_granularity() {
        let gic = Gicv2::new(GicConfig {
            num_cpus: 1,
            num_spis: 5,
        });
        assert_eq!(gic.num_irqs(), NUM_PRIVATE + 32);
    }

    #[test]
    fn edge_spi_latches_pending_on_rising_level() {
        let mut gic = gic(1);
        gic.distif_write(0, 0x104, 1 << 0); // enable SPI 32
        gic.distif_write(0, 0x820, 0x01); // target cpu 0

        gic.set_spi_level(32, true);
        assert!(gic.is_irq_pending(32, 1));

        // Edge pending stays latched after the wire drops.
        gic.set_spi_level(32, false);
        assert!(gic.is_irq_pending(32, 1));
    }

    #[test]
    fn level_spi_tracks_wire_until_acknowledged() {
        let mut gic = gic(1);
        gic.distif_write(0, 0x104, 1 << 0);
        gic.distif_write(0, 0x820, 0x01);
        gic.distif_write(0, 0xC08, 0); // SPI 32 level-triggered

        gic.set_spi_level(32, true);
        assert!(gic.test_pending(32, 1));
        assert!(gic.irq_asserted(0));

        gic.set_spi_level(32, false);
        assert!(!gic.test_pending(32, 1));
        assert!(!gic.irq_asserted(0));
    }

    #[test]
    fn output_follows_priority_mask() {
        let mut gic = gic(1);
        gic.distif_write(0, 0x104, 1 << 0);
        gic.distif_write(0, 0x820, 0x01);
        gic.distif_write(0, 0x420, 0x80); // SPI 32 priority 0x80
        gic.set_spi_level(32, true);
        assert!(gic.irq_asserted(0));

        // Mask out everything at or below priority 0x80.
        gic.cpuif_write(0, cpu_interface::GICC_PMR, 0x80);
        assert!(!gic.irq_asserted(0));
    }

    #[test]
    fn arbitration_prefers_lower_numeric_priority() {
        let mut gic = gic(1);
        gic.distif_write(0, 0x104, 0b11); // SPIs 32, 33
        gic.distif_write(0, 0x820, 0x0101);
        gic.distif_write(0, 0x420, 0x10_20); // 32 at 0x20, 33 at 0x10
        gic.set_spi_level(32, true);
        gic.set_spi_level(33, true);

        assert_eq!(gic.cpuif_read(0, cpu_interface::GICC_HPPIR), 33);
        assert!(gic.irq_asserted(0));
        assert_eq!(gic.cpuif_read(0, cpu_interface::GICC_IAR), 33);
        // The remaining 0x20 candidate does not preempt a 0x10 service.
        assert!(!gic.irq_asserted(0));
    }

    #[test]
    fn equal_priority_ties_follow_scan_order() {
        let mut gic = gic(1);
        gic.distif_write(0, 0x104, 0b11);
        gic.distif_write(0, 0x820, 0x0101);
        gic.set_spi_level(32, true);
        gic.set_spi_level(33, true);
        assert_eq!(gic.cpuif_read(0, cpu_interface::GICC_HPPIR), 32);

        // An SGI at the same priority outranks both shared lines.
        gic.distif_write(0, distributor::GICD_SGIR, (2 << 24) | 4);
        assert_eq!(gic.cpuif_read(0, cpu_interface::GICC_HPPIR), 4);
    }

    #[test]
    fn take_events_reports_line_edges_once() {
        let mut gic = gic(1);
        gic.distif_write(0, 0x104, 1 << 0);
        gic.distif_write(0, 0x820, 0x01);
        gic.set_spi_level(32, true);

        let events = gic.take_events();
        assert!(events.contains(&LineEvent::Irq {
            cpu: 0,
            level: true
        }));
        assert!(gic.take_events().is_empty());
    }

    #[test]
    fn disabled_distributor_forces_output_low() {
        let mut gic = gic(1);
        gic.distif_write(0, 0x104, 1 << 0);
        gic.distif_write(0, 0x820, 0x01);
        gic.set_spi_level(32, true);
        assert!(gic.irq_asserted(0));

        gic.distif_write(0, distributor::GICD_CTLR, 0);
        assert!(!gic.irq_asserted(0));
    }
}
