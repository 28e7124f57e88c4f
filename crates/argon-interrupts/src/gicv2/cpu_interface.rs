//! Physical processor interface block (`GICC_*`), banked per processor.
//!
//! Implements the acknowledge / end-of-interrupt protocol, the running
//! priority used for preemption, and the service chain that lets nested
//! interrupts complete out of order.

use super::{
    Gicv2, COMPONENT_ID, CTLR_ENABLE, IDLE_PRIORITY, INTERFACE_IIDR, MAX_CPU, NUM_SGI,
    SPURIOUS_IRQ,
};

pub(crate) const GICC_CTLR: u64 = 0x000;
pub(crate) const GICC_PMR: u64 = 0x004;
pub(crate) const GICC_BPR: u64 = 0x008;
pub(crate) const GICC_IAR: u64 = 0x00C;
pub(crate) const GICC_EOIR: u64 = 0x010;
pub(crate) const GICC_RPR: u64 = 0x014;
pub(crate) const GICC_HPPIR: u64 = 0x018;
pub(crate) const GICC_ABPR: u64 = 0x01C;
pub(crate) const GICC_APR: u64 = 0x0D0;
pub(crate) const GICC_IIDR: u64 = 0x0FC;
pub(crate) const GICC_CIDR: u64 = 0xFF0;
pub(crate) const GICC_DIR: u64 = 0x1000;

#[derive(Debug)]
pub(crate) struct CpuInterface {
    pub ctlr: [u32; MAX_CPU],
    pub pmr: [u32; MAX_CPU],
    pub bpr: [u32; MAX_CPU],
    /// Running priority: the priority of the interrupt being serviced, or
    /// [`IDLE_PRIORITY`] when none is. Only strictly higher (numerically
    /// lower) candidates assert the line.
    pub rpr: [u32; MAX_CPU],
    /// Highest-priority pending id, refreshed by every arbitration pass.
    pub hppir: [u16; MAX_CPU],
    pub apr: [u32; MAX_CPU],
    pub dir: [u32; MAX_CPU],
    /// Id currently being serviced per processor.
    pub current: [u16; MAX_CPU],
    /// Per id and processor: the id service returns to when this one
    /// completes. Together with `current` this forms the service chain that
    /// out-of-order completion splices out of.
    pub resume: Vec<[u16; MAX_CPU]>,
}

impl CpuInterface {
    pub fn new(num_irqs: u16) -> Self {
        Self {
            ctlr: [0; MAX_CPU],
            pmr: [0; MAX_CPU],
            bpr: [0; MAX_CPU],
            rpr: [IDLE_PRIORITY; MAX_CPU],
            hppir: [SPURIOUS_IRQ; MAX_CPU],
            apr: [0; MAX_CPU],
            dir: [0; MAX_CPU],
            current: [SPURIOUS_IRQ; MAX_CPU],
            resume: vec![[SPURIOUS_IRQ; MAX_CPU]; num_irqs as usize],
        }
    }

    pub fn reset(&mut self) {
        let num_irqs = self.resume.len() as u16;
        *self = Self::new(num_irqs);
    }
}

impl Gicv2 {
    pub fn cpuif_read(&mut self, cpu: usize, offset: u64) -> u32 {
        let cpu = self.check_cpu(cpu);
        match offset {
            GICC_CTLR => self.cpuif.ctlr[cpu],
            GICC_PMR => self.cpuif.pmr[cpu],
            // The aliased binary point register shares storage with BPR.
            GICC_BPR | GICC_ABPR => self.cpuif.bpr[cpu],
            GICC_IAR => self.acknowledge(cpu),
            GICC_EOIR => {
                log::warn!("invalid read of end-of-interrupt register");
                0
            }
            GICC_RPR => self.cpuif.rpr[cpu],
            GICC_HPPIR => self.cpuif.hppir[cpu] as u32,
            GICC_APR => self.cpuif.apr[cpu],
            GICC_IIDR => INTERFACE_IIDR,
            GICC_CIDR..=0xFFC => {
                let byte = (offset - GICC_CIDR) / 4;
                (COMPONENT_ID >> (byte * 8)) & 0xFF
            }
            GICC_DIR => self.cpuif.dir[cpu],
            _ => {
                log::warn!("read of unknown cpu interface register at offset {offset:#x}");
                0
            }
        }
    }

    pub fn cpuif_write(&mut self, cpu: usize, offset: u64, value: u32) {
        let cpu = self.check_cpu(cpu);
        match offset {
            GICC_CTLR => {
                self.cpuif.ctlr[cpu] = value & CTLR_ENABLE;
            }
            GICC_PMR => {
                self.cpuif.pmr[cpu] = value & 0xFF;
            }
            GICC_BPR | GICC_ABPR => {
                self.cpuif.bpr[cpu] = value & 0x7;
            }
            GICC_IAR => {
                log::warn!("invalid write to interrupt acknowledge register");
                return;
            }
            GICC_EOIR => {
                self.end_of_interrupt(cpu, value);
                return; // refreshes the outputs itself
            }
            GICC_APR => {
                self.cpuif.apr[cpu] = value;
            }
            GICC_DIR => {
                self.cpuif.dir[cpu] = value;
            }
            GICC_RPR | GICC_HPPIR | GICC_IIDR | GICC_CIDR..=0xFFC => {} // read-only
            _ => {
                log::warn!("write to unknown cpu interface register at offset {offset:#x}");
                return;
            }
        }
        self.update(false);
    }

    /// `GICC_IAR` read: claims the highest-priority pending interrupt.
    ///
    /// Returns the interrupt id, with the requesting processor id in bits
    /// [12:10] for SGIs. Returns [`SPURIOUS_IRQ`] without side effects when
    /// nothing eligible is pending.
    fn acknowledge(&mut self, cpu: usize) -> u32 {
        let irq = self.cpuif.hppir[cpu];
        if irq == SPURIOUS_IRQ {
            return SPURIOUS_IRQ as u32;
        }
        // The candidate may have been computed before the running priority
        // rose; re-check instead of handing out a non-preempting id.
        if self.get_irq_priority(cpu, irq) as u32 >= self.cpuif.rpr[cpu] {
            return SPURIOUS_IRQ as u32;
        }

        let mask = self.ack_mask(cpu, irq);
        let ack = if irq < NUM_SGI {
            let sources = self.sgi_sources(cpu, irq);
            let src = if sources == 0 {
                log::warn!("sgi {irq} pending without a requesting processor");
                0
            } else {
                sources.trailing_zeros() as u8
            };
            self.clear_sgi_source(cpu, irq, src);
            if self.sgi_sources(cpu, irq) == 0 {
                self.set_irq_pending(irq, false, mask);
            }
            ((src as u32 & 0x7) << 10) | irq as u32
        } else {
            self.set_irq_pending(irq, false, mask);
            irq as u32
        };

        // Push the interrupted service onto the chain, then make this id the
        // one being serviced.
        self.cpuif.resume[irq as usize][cpu] = self.cpuif.current[cpu];
        self.set_current(cpu, irq);
        self.set_irq_active(irq, true, mask);
        self.set_irq_signaled(irq, true, mask);
        self.update(false);
        ack
    }

    /// `GICC_EOIR` write: completes service of an interrupt.
    ///
    /// Completing the one currently being serviced resumes its predecessor
    /// on the chain. Completing any other in-service id splices it out of
    /// the chain without changing the running priority.
    fn end_of_interrupt(&mut self, cpu: usize, value: u32) {
        let current = self.cpuif.current[cpu];
        if current == SPURIOUS_IRQ {
            log::warn!("end of interrupt with no interrupt in service");
            return;
        }
        let irq = (value & 0x3FF) as u16;
        if irq >= self.num_irqs {
            log::warn!("end of interrupt for invalid irq {irq} ignored");
            return;
        }

        if irq == current {
            let resume = self.cpuif.resume[irq as usize][cpu];
            self.set_current(cpu, resume);
            let mask = self.ack_mask(cpu, irq);
            self.set_irq_active(irq, false, mask);
        } else {
            // Walk the chain from the head looking for the entry that
            // resumes to `irq` and bridge over it.
            let mut iter = current;
            loop {
                let next = self.cpuif.resume[iter as usize][cpu];
                if next == irq {
                    self.cpuif.resume[iter as usize][cpu] =
                        self.cpuif.resume[irq as usize][cpu];
                    break;
                }
                if next == SPURIOUS_IRQ {
                    log::debug!("end of interrupt for irq {irq} not in service");
                    break;
                }
                iter = next;
            }
        }
        self.update(false);
    }

    fn set_current(&mut self, cpu: usize, irq: u16) {
        self.cpuif.current[cpu] = irq;
        self.cpuif.rpr[cpu] = if irq == SPURIOUS_IRQ {
            IDLE_PRIORITY
        } else {
            self.get_irq_priority(cpu, irq) as u32
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gicv2::distributor::{GICD_CTLR, GICD_IPRIORITYR, GICD_ISENABLER, GICD_SGIR};
    use crate::gicv2::{GicConfig, Gicv2};

    fn gic(num_cpus: usize) -> Gicv2 {
        let mut gic = Gicv2::new(GicConfig {
            num_cpus,
            num_spis: 64,
        });
        gic.distif_write(0, GICD_CTLR, 1);
        for cpu in 0..num_cpus {
            gic.cpuif_write(cpu, GICC_CTLR, 1);
            gic.cpuif_write(cpu, GICC_PMR, 0xFF);
        }
        gic
    }

    fn raise_spi(gic: &mut Gicv2, irq: u16, prio: u8, targets: u32) {
        let word = GICD_ISENABLER + 4 * (irq as u64 / 32);
        gic.distif_write(0, word, 1 << (irq % 32));

        // Priority and target words are shared by four lines each; merge the
        // new byte instead of wiping the neighbors.
        let shift = (irq as u32 % 4) * 8;
        let prio_reg = GICD_IPRIORITYR + (irq as u64 / 4) * 4;
        let merged = (gic.distif_read(0, prio_reg) & !(0xFF << shift)) | ((prio as u32) << shift);
        gic.distif_write(0, prio_reg, merged);
        let target_reg = 0x800 + (irq as u64 / 4) * 4;
        let merged = (gic.distif_read(0, target_reg) & !(0xFF << shift)) | (targets << shift);
        gic.distif_write(0, target_reg, merged);

        gic.set_spi_level(irq, true);
        gic.set_spi_level(irq, false);
    }

    #[test]
    fn acknowledge_claims_and_activates() {
        let mut gic = gic(1);
        raise_spi(&mut gic, 40, 0x20, 0x01);
        assert!(gic.irq_asserted(0));
        assert_eq!(gic.cpuif_read(0, GICC_HPPIR), 40);

        assert_eq!(gic.cpuif_read(0, GICC_IAR), 40);
        assert!(gic.is_irq_active(40, 1));
        assert!(!gic.is_irq_pending(40, 1));
        assert_eq!(gic.cpuif_read(0, GICC_RPR), 0x20);
        assert!(!gic.irq_asserted(0));

        gic.cpuif_write(0, GICC_EOIR, 40);
        assert!(!gic.is_irq_active(40, 1));
        assert_eq!(gic.cpuif_read(0, GICC_RPR), IDLE_PRIORITY);
    }

    #[test]
    fn acknowledge_without_pending_is_spurious() {
        let mut gic = gic(1);
        assert_eq!(gic.cpuif_read(0, GICC_IAR), SPURIOUS_IRQ as u32);
    }

    #[test]
    fn priority_mask_gates_acknowledge() {
        let mut gic = gic(1);
        raise_spi(&mut gic, 40, 0x80, 0x01);
        gic.cpuif_write(0, GICC_PMR, 0x80);
        assert!(!gic.irq_asserted(0));
        assert_eq!(gic.cpuif_read(0, GICC_IAR), SPURIOUS_IRQ as u32);
        assert!(gic.is_irq_pending(40, 1));
    }

    #[test]
    fn higher_priority_interrupt_preempts() {
        let mut gic = gic(1);
        raise_spi(&mut gic, 40, 0x40, 0x01);
        assert_eq!(gic.cpuif_read(0, GICC_IAR), 40);

        // An equal-priority candidate may not preempt.
        raise_spi(&mut gic, 41, 0x40, 0x01);
        assert!(!gic.irq_asserted(0));

        raise_spi(&mut gic, 42, 0x10, 0x01);
        assert!(gic.irq_asserted(0));
        assert_eq!(gic.cpuif_read(0, GICC_IAR), 42);
        assert_eq!(gic.cpuif_read(0, GICC_RPR), 0x10);

        // Completing the nested interrupt resumes the interrupted one.
        gic.cpuif_write(0, GICC_EOIR, 42);
        assert_eq!(gic.cpuif_read(0, GICC_RPR), 0x40);
        gic.cpuif_write(0, GICC_EOIR, 40);
        assert_eq!(gic.cpuif_read(0, GICC_RPR), IDLE_PRIORITY);

        // Now the equal-priority one gets its turn.
        assert_eq!(gic.cpuif_read(0, GICC_IAR), 41);
    }

    #[test]
    fn out_of_order_completion_splices_the_chain() {
        let mut gic = gic(1);
        raise_spi(&mut gic, 40, 0x60, 0x01);
        assert_eq!(gic.cpuif_read(0, GICC_IAR), 40);
        raise_spi(&mut gic, 41, 0x40, 0x01);
        assert_eq!(gic.cpuif_read(0, GICC_IAR), 41);
        raise_spi(&mut gic, 42, 0x20, 0x01);
        assert_eq!(gic.cpuif_read(0, GICC_IAR), 42);

        // Complete the middle of the chain first: running priority stays at
        // the innermost level.
        gic.cpuif_write(0, GICC_EOIR, 41);
        assert_eq!(gic.cpuif_read(0, GICC_RPR), 0x20);

        // Completing the innermost now resumes 40 directly.
        gic.cpuif_write(0, GICC_EOIR, 42);
        assert_eq!(gic.cpuif_read(0, GICC_RPR), 0x60);
        gic.cpuif_write(0, GICC_EOIR, 40);
        assert_eq!(gic.cpuif_read(0, GICC_RPR), IDLE_PRIORITY);
    }

    #[test]
    fn eoi_without_service_is_ignored() {
        let mut gic = gic(1);
        gic.cpuif_write(0, GICC_EOIR, 40);
        assert_eq!(gic.cpuif_read(0, GICC_RPR), IDLE_PRIORITY);
    }

    #[test]
    fn sgi_acknowledge_reports_source_and_drains_per_source() {
        let mut gic = gic(4);
        // Processors 1 and 3 both signal SGI 2 at processor 0.
        gic.distif_write(1, GICD_SGIR, (0b0001 << 16) | 2);
        gic.distif_write(3, GICD_SGIR, (0b0001 << 16) | 2);

        let ack = gic.cpuif_read(0, GICC_IAR);
        assert_eq!(ack & 0x3FF, 2);
        assert_eq!((ack >> 10) & 0x7, 1); // lowest source first
        gic.cpuif_write(0, GICC_EOIR, ack & 0x3FF);

        // Still pending for the second source.
        assert!(gic.is_irq_pending(2, 1 << 0));
        let ack = gic.cpuif_read(0, GICC_IAR);
        assert_eq!((ack >> 10) & 0x7, 3);
        gic.cpuif_write(0, GICC_EOIR, ack & 0x3FF);
        assert!(!gic.is_irq_pending(2, 1 << 0));
    }

    #[test]
    fn banked_interfaces_are_independent() {
        let mut gic = gic(2);
        raise_spi(&mut gic, 40, 0x30, 0b11);
        assert!(gic.irq_asserted(0));
        assert!(gic.irq_asserted(1));

        // Each targeted processor services its own instance of the line.
        assert_eq!(gic.cpuif_read(1, GICC_IAR), 40);
        assert!(!gic.irq_asserted(1));
        assert!(gic.irq_asserted(0));
        assert_eq!(gic.cpuif_read(0, GICC_IAR), 40);
        assert_eq!(gic.cpuif_read(0, GICC_RPR), 0x30);
        assert_eq!(gic.cpuif_read(1, GICC_RPR), 0x30);
    }
}
