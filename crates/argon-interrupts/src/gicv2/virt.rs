//! Virtualization extension: hypervisor view (`GICH_*`) and virtual
//! processor interface (`GICV_*`), banked per processor.
//!
//! A hypervisor injects interrupts for its guest by filling list registers;
//! the guest then runs the usual acknowledge / end-of-interrupt protocol
//! against the virtual interface, which operates purely on the list-register
//! slots. Hardware-mapped slots forward the guest's completion to the
//! physical line's active state.

use super::{
    Gicv2, IDLE_PRIORITY, INTERFACE_IIDR, MAX_CPU, NUM_LIST_REGS, NUM_SGI, SPURIOUS_IRQ,
    VIRT_MIN_BPR,
};

bitflags::bitflags! {
    /// Hypervisor control register bits. Only the global enable is acted
    /// upon; the maintenance-interrupt enables are stored for readback.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcrFlags: u32 {
        const EN = 1 << 0;
        const UIE = 1 << 1;
        const LRENPIE = 1 << 2;
        const NPIE = 1 << 3;
    }
}

pub(crate) const GICH_HCR: u64 = 0x00;
pub(crate) const GICH_VTR: u64 = 0x04;
pub(crate) const GICH_VMCR: u64 = 0x08;
pub(crate) const GICH_APR: u64 = 0xF0;
pub(crate) const GICH_LR: u64 = 0x100;

pub(crate) const GICV_CTLR: u64 = 0x00;
pub(crate) const GICV_PMR: u64 = 0x04;
pub(crate) const GICV_BPR: u64 = 0x08;
pub(crate) const GICV_IAR: u64 = 0x0C;
pub(crate) const GICV_EOIR: u64 = 0x10;
pub(crate) const GICV_RPR: u64 = 0x14;
pub(crate) const GICV_HPPIR: u64 = 0x18;
pub(crate) const GICV_APR: u64 = 0xD0;
pub(crate) const GICV_IIDR: u64 = 0xFC;

const LR_HW: u32 = 1 << 31;
const LR_STATE_PENDING: u32 = 1 << 28;
const LR_STATE_ACTIVE: u32 = 1 << 29;
const LR_EOI: u32 = 1 << 19;

/// One list-register slot, kept decoded. `raw` preserves the bits the model
/// does not act on so reads return what was written.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ListRegister {
    pub raw: u32,
    pub pending: bool,
    pub active: bool,
    pub hw: bool,
    /// Five-bit virtual priority as written, not shifted to eight bits.
    pub prio: u8,
    pub virtual_id: u16,
    /// Physical id for hardware-mapped slots, zero otherwise.
    pub physical_id: u16,
    /// Requesting processor reported by a virtual SGI acknowledge.
    pub cpu_id: u8,
}

impl ListRegister {
    pub fn decode(raw: u32) -> Self {
        let hw = raw & LR_HW != 0;
        Self {
            raw,
            pending: raw & LR_STATE_PENDING != 0,
            active: raw & LR_STATE_ACTIVE != 0,
            hw,
            prio: ((raw >> 23) & 0x1F) as u8,
            virtual_id: (raw & 0x3FF) as u16,
            physical_id: if hw { ((raw >> 10) & 0x3FF) as u16 } else { 0 },
            cpu_id: if hw { 0 } else { ((raw >> 10) & 0x7) as u8 },
        }
    }

    fn encode(&self) -> u32 {
        let mut raw = self.raw & !(LR_STATE_PENDING | LR_STATE_ACTIVE);
        if self.pending {
            raw |= LR_STATE_PENDING;
        }
        if self.active {
            raw |= LR_STATE_ACTIVE;
        }
        raw
    }
}

#[derive(Debug)]
pub(crate) struct VirtInterfaceControl {
    pub hcr: [u32; MAX_CPU],
    /// Active-priorities bitmask, one bit per preemption level.
    pub apr: [u32; MAX_CPU],
    pub lr: [[ListRegister; NUM_LIST_REGS]; MAX_CPU],
}

impl VirtInterfaceControl {
    pub fn new() -> Self {
        Self {
            hcr: [0; MAX_CPU],
            apr: [0; MAX_CPU],
            lr: [[ListRegister::default(); NUM_LIST_REGS]; MAX_CPU],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[derive(Debug)]
pub(crate) struct VirtCpuInterface {
    pub ctlr: [u32; MAX_CPU],
    pub pmr: [u32; MAX_CPU],
    pub bpr: [u32; MAX_CPU],
    pub rpr: [u32; MAX_CPU],
    pub hppir: [u16; MAX_CPU],
    pub apr: [u32; MAX_CPU],
}

impl VirtCpuInterface {
    pub fn new() -> Self {
        Self {
            ctlr: [0; MAX_CPU],
            pmr: [0; MAX_CPU],
            bpr: [VIRT_MIN_BPR; MAX_CPU],
            rpr: [IDLE_PRIORITY; MAX_CPU],
            hppir: [SPURIOUS_IRQ; MAX_CPU],
            apr: [0; MAX_CPU],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Converts an active-priorities bitmask back to an eight-bit running
/// priority: the lowest set bit marks the highest active preemption level.
pub(crate) fn apr_to_priority(apr: u32) -> u32 {
    if apr == 0 {
        IDLE_PRIORITY
    } else {
        apr.trailing_zeros() << (VIRT_MIN_BPR + 1)
    }
}

impl Gicv2 {
    // ---- hypervisor view (GICH) ------------------------------------------

    pub fn vifctrl_read(&self, cpu: usize, offset: u64) -> u32 {
        let cpu = self.check_cpu(cpu);
        match offset {
            GICH_HCR => self.vifctrl.hcr[cpu],
            GICH_VTR => 0x9000_0000 | (NUM_LIST_REGS as u32 - 1),
            GICH_VMCR => {
                ((self.vcpuif.pmr[cpu] >> 3) << 27)
                    | ((self.vcpuif.bpr[cpu] & 0x3) << 21)
                    | (self.vcpuif.ctlr[cpu] & 0x1FF)
            }
            GICH_APR => self.vifctrl.apr[cpu],
            GICH_LR..=0x10C => {
                let slot = ((offset - GICH_LR) / 4) as usize;
                self.vifctrl.lr[cpu][slot].encode()
            }
            _ => {
                log::warn!("read of unknown virtual control register at offset {offset:#x}");
                0
            }
        }
    }

    pub fn vifctrl_write(&mut self, cpu: usize, offset: u64, value: u32) {
        let cpu = self.check_cpu(cpu);
        match offset {
            GICH_HCR => {
                self.vifctrl.hcr[cpu] = value;
            }
            GICH_VTR => {} // read-only
            GICH_VMCR => {
                self.vcpuif.pmr[cpu] = ((value >> 27) & 0x1F) << 3;
                self.vcpuif.bpr[cpu] = (value >> 21) & 0x3;
                self.vcpuif.ctlr[cpu] = value & 0x1FF;
            }
            GICH_APR => {
                self.vifctrl.apr[cpu] = value;
                self.vcpuif.rpr[cpu] = apr_to_priority(value);
            }
            GICH_LR..=0x10C => {
                let slot = ((offset - GICH_LR) / 4) as usize;
                let lr = ListRegister::decode(value);
                if !lr.hw && value & LR_EOI != 0 {
                    log::error!("maintenance interrupts are not implemented");
                }
                // The completion path bounds-checks the virtual id against
                // the configured line count, so such an injection can be
                // acknowledged but never completed.
                if lr.virtual_id >= self.num_irqs {
                    log::warn!(
                        "list register virtual irq {} exceeds the line count",
                        lr.virtual_id
                    );
                }
                self.vifctrl.lr[cpu][slot] = lr;
            }
            _ => {
                log::warn!("write to unknown virtual control register at offset {offset:#x}");
                return;
            }
        }
        self.update(true);
    }

    // ---- guest view (GICV) -----------------------------------------------

    pub fn vcpuif_read(&mut self, cpu: usize, offset: u64) -> u32 {
        let cpu = self.check_cpu(cpu);
        match offset {
            GICV_CTLR => self.vcpuif.ctlr[cpu],
            GICV_PMR => self.vcpuif.pmr[cpu],
            GICV_BPR => self.vcpuif.bpr[cpu],
            GICV_IAR => self.virtual_acknowledge(cpu),
            GICV_EOIR => {
                log::warn!("invalid read of virtual end-of-interrupt register");
                0
            }
            GICV_RPR => self.vcpuif.rpr[cpu],
            GICV_HPPIR => self.vcpuif.hppir[cpu] as u32,
            GICV_APR => self.vcpuif.apr[cpu],
            GICV_IIDR => INTERFACE_IIDR,
            _ => {
                log::warn!("read of unknown virtual cpu register at offset {offset:#x}");
                0
            }
        }
    }

    pub fn vcpuif_write(&mut self, cpu: usize, offset: u64, value: u32) {
        let cpu = self.check_cpu(cpu);
        match offset {
            GICV_CTLR => {
                if value > 1 {
                    log::error!("group 1 virtual interrupts are not implemented");
                }
                self.vcpuif.ctlr[cpu] = value & 0x1FF;
            }
            GICV_PMR => {
                self.vcpuif.pmr[cpu] = value & 0xFF;
            }
            GICV_BPR => {
                self.vcpuif.bpr[cpu] = (value & 0x7).max(VIRT_MIN_BPR);
            }
            GICV_IAR => {
                log::warn!("invalid write to virtual acknowledge register");
                return;
            }
            GICV_EOIR => {
                self.virtual_eoi(cpu, value);
                return; // refreshes the outputs itself
            }
            GICV_APR => {
                self.vcpuif.apr[cpu] = value;
            }
            GICV_RPR | GICV_HPPIR | GICV_IIDR => {} // read-only
            _ => {
                log::warn!("write to unknown virtual cpu register at offset {offset:#x}");
                return;
            }
        }
        self.update(true);
    }

    /// First slot holding `virq` in a live (pending or active) state.
    fn find_slot(&self, cpu: usize, virq: u16) -> Option<usize> {
        self.vifctrl.lr[cpu]
            .iter()
            .position(|lr| lr.virtual_id == virq && (lr.pending || lr.active))
    }

    fn virtual_acknowledge(&mut self, cpu: usize) -> u32 {
        let virq = self.vcpuif.hppir[cpu];
        if virq == SPURIOUS_IRQ {
            return SPURIOUS_IRQ as u32;
        }
        let Some(slot) = self.find_slot(cpu, virq) else {
            log::error!("no list register holds pending virtual irq {virq}");
            return SPURIOUS_IRQ as u32;
        };
        let prio = self.vifctrl.lr[cpu][slot].prio;
        if (prio as u32) >= self.vcpuif.rpr[cpu] {
            return SPURIOUS_IRQ as u32;
        }

        // Track the claimed preemption level in the active-priorities mask
        // and raise the running priority to the group boundary.
        let prio8 = (prio as u32) << 3;
        let group_mask = (!0u32) << ((self.vcpuif.bpr[cpu] & 0x7) + 1);
        self.vcpuif.rpr[cpu] = prio8 & group_mask;
        let level = prio8 >> (VIRT_MIN_BPR + 1);
        self.vifctrl.apr[cpu] |= 1 << (level % 32);

        let lr = &mut self.vifctrl.lr[cpu][slot];
        lr.active = true;
        lr.pending = false;
        let cpu_id = lr.cpu_id as u32;
        self.update(true);
        ((cpu_id & 0x7) << 10) | virq as u32
    }

    fn virtual_eoi(&mut self, cpu: usize, value: u32) {
        let virq = (value & 0x3FF) as u16;
        if virq >= self.num_irqs {
            log::warn!("virtual end of interrupt for invalid irq {virq} ignored");
            return;
        }
        let Some(slot) = self.find_slot(cpu, virq) else {
            log::error!("virtual irq {virq} is not in service");
            return;
        };

        // Drop the highest active preemption level and recompute the
        // running priority from what remains.
        let apr = self.vifctrl.apr[cpu];
        self.vifctrl.apr[cpu] = apr & apr.wrapping_sub(1);
        self.vcpuif.rpr[cpu] = apr_to_priority(self.vifctrl.apr[cpu]);

        let lr = &mut self.vifctrl.lr[cpu][slot];
        lr.active = false;
        if lr.hw {
            let phys = lr.physical_id;
            if (NUM_SGI..self.num_irqs).contains(&phys) {
                self.set_irq_active(phys, false, 1 << cpu);
            } else {
                log::error!("list register maps invalid physical irq {phys}");
            }
        }
        self.update(true);
    }
}
