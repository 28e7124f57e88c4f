//! Distributor register block (`GICD_*`).
//!
//! Holds the shared interrupt configuration: enables, pending/active latches,
//! priorities, target masks, trigger configuration and software-generated
//! interrupt (SGI) bookkeeping. Registers for ids below 32 are banked per
//! processor, so every access carries the accessing processor id.

use super::{
    Gicv2, TargetModel, Trigger, ALL_CPU, COMPONENT_ID, CTLR_ENABLE, MAX_CPU, NUM_PPI,
    NUM_PRIVATE, NUM_SGI,
};

pub(crate) const GICD_CTLR: u64 = 0x000;
pub(crate) const GICD_TYPER: u64 = 0x004;
pub(crate) const GICD_IIDR: u64 = 0x008;
pub(crate) const GICD_ISENABLER: u64 = 0x100;
pub(crate) const GICD_ICENABLER: u64 = 0x180;
pub(crate) const GICD_ISPENDR: u64 = 0x200;
pub(crate) const GICD_ICPENDR: u64 = 0x280;
pub(crate) const GICD_ISACTIVER: u64 = 0x300;
pub(crate) const GICD_ICACTIVER: u64 = 0x380;
pub(crate) const GICD_IPRIORITYR: u64 = 0x400;
pub(crate) const GICD_ITARGETSR: u64 = 0x800;
pub(crate) const GICD_ICFGR: u64 = 0xC00;
pub(crate) const GICD_SGIR: u64 = 0xF00;
pub(crate) const GICD_CPENDSGIR: u64 = 0xF10;
pub(crate) const GICD_SPENDSGIR: u64 = 0xF20;
pub(crate) const GICD_CIDR: u64 = 0xFF0;

/// Distributor register storage. Line state (enable/pending/active) lives in
/// the shared interrupt state table; this struct only holds what has no
/// per-line bitmask representation.
#[derive(Debug)]
pub(crate) struct Distributor {
    pub ctlr: u32,
    pub iidr: u32,
    /// Banked priorities for ids 0..16 and 16..32.
    pub sgi_priority: [[u8; NUM_SGI as usize]; MAX_CPU],
    pub ppi_priority: [[u8; NUM_SGI as usize]; MAX_CPU],
    pub spi_priority: Vec<u8>,
    pub spi_targets: Vec<u8>,
    /// Trigger configuration words, two bits per id. SGIs are fixed
    /// edge-triggered and have no stored word.
    pub cfg_ppi: u32,
    pub cfg_spi: Vec<u32>,
    /// Per target processor, per SGI: bitmask of requesting source
    /// processors. An SGI stays pending until every source is acknowledged.
    pub sgi_sources: [[u8; NUM_SGI as usize]; MAX_CPU],
}

const CFG_RESET: u32 = 0xAAAA_AAAA; // all edge-triggered

impl Distributor {
    pub fn new(num_spis: usize) -> Self {
        Self {
            ctlr: 0,
            iidr: 0,
            sgi_priority: [[0; NUM_SGI as usize]; MAX_CPU],
            ppi_priority: [[0; NUM_SGI as usize]; MAX_CPU],
            spi_priority: vec![0; num_spis],
            spi_targets: vec![0; num_spis],
            cfg_ppi: CFG_RESET,
            cfg_spi: vec![CFG_RESET; num_spis / 16],
            sgi_sources: [[0; NUM_SGI as usize]; MAX_CPU],
        }
    }

    pub fn reset(&mut self) {
        let num_spis = self.spi_priority.len();
        *self = Self::new(num_spis);
    }
}

impl Gicv2 {
    /// Per-processor mask used for the shared line-state bitmasks: banked
    /// registers touch only the accessing processor, SPI registers all.
    fn access_mask(&self, cpu: usize, irq: u16) -> u8 {
        if irq < NUM_PRIVATE {
            1 << cpu
        } else {
            ALL_CPU
        }
    }

    pub fn distif_read(&self, cpu: usize, offset: u64) -> u32 {
        let cpu = self.check_cpu(cpu);
        match offset {
            GICD_CTLR => self.dist.ctlr,
            GICD_TYPER => {
                let it_lines = (self.num_irqs / 32 - 1) as u32;
                (((self.num_cpus as u32 - 1) & 0x7) << 5) | (it_lines & 0x1F)
            }
            GICD_IIDR => self.dist.iidr,
            GICD_ISENABLER..=0x17C | GICD_ICENABLER..=0x1FC => {
                let base = if offset >= GICD_ICENABLER {
                    GICD_ICENABLER
                } else {
                    GICD_ISENABLER
                };
                self.read_line_bits(cpu, offset - base, |gic, irq, mask| {
                    gic.is_irq_enabled(irq, mask)
                })
            }
            GICD_ISPENDR..=0x27C | GICD_ICPENDR..=0x2FC => {
                let base = if offset >= GICD_ICPENDR {
                    GICD_ICPENDR
                } else {
                    GICD_ISPENDR
                };
                self.read_line_bits(cpu, offset - base, |gic, irq, mask| {
                    gic.test_pending(irq, mask)
                })
            }
            GICD_ISACTIVER..=0x37C => {
                self.read_line_bits(cpu, offset - GICD_ISACTIVER, |gic, irq, mask| {
                    gic.is_irq_active(irq, mask)
                })
            }
            GICD_ICACTIVER..=0x3FC => 0,
            GICD_IPRIORITYR..=0x7F8 => {
                let first = ((offset - GICD_IPRIORITYR) / 4 * 4) as u16;
                let mut value = 0u32;
                for byte in 0..4 {
                    let irq = first + byte as u16;
                    if irq < self.num_irqs {
                        value |= (self.get_irq_priority(cpu, irq) as u32) << (byte * 8);
                    }
                }
                value
            }
            GICD_ITARGETSR..=0x81C => 0x0101_0101 << cpu,
            0x820..=0xBF8 => {
                let first = ((offset - GICD_ITARGETSR) / 4 * 4) as u16;
                let mut value = 0u32;
                for byte in 0..4 {
                    let irq = first + byte as u16;
                    if (NUM_PRIVATE..self.num_irqs).contains(&irq) {
                        let idx = (irq - NUM_PRIVATE) as usize;
                        value |= (self.dist.spi_targets[idx] as u32) << (byte * 8);
                    }
                }
                value
            }
            GICD_ICFGR => CFG_RESET, // SGIs are fixed edge-triggered
            0xC04 => self.dist.cfg_ppi,
            0xC08..=0xCFC => {
                let word = ((offset - 0xC08) / 4) as usize;
                self.dist.cfg_spi.get(word).copied().unwrap_or_else(|| {
                    log::warn!("read of unimplemented trigger config word {word}");
                    0
                })
            }
            GICD_SGIR => {
                log::warn!("invalid read of sgi control register");
                0
            }
            GICD_CPENDSGIR..=0xF1C | GICD_SPENDSGIR..=0xF2C => {
                let base = if offset >= GICD_SPENDSGIR {
                    GICD_SPENDSGIR
                } else {
                    GICD_CPENDSGIR
                };
                let first = ((offset - base) / 4 * 4) as usize;
                let mut value = 0u32;
                for byte in 0..4 {
                    value |= (self.dist.sgi_sources[cpu][first + byte] as u32) << (byte * 8);
                }
                value
            }
            GICD_CIDR..=0xFFC => {
                let byte = (offset - GICD_CIDR) / 4;
                (COMPONENT_ID >> (byte * 8)) & 0xFF
            }
            _ => {
                log::warn!("read of unknown distributor register at offset {offset:#x}");
                0
            }
        }
    }

    pub fn distif_write(&mut self, cpu: usize, offset: u64, value: u32) {
        let cpu = self.check_cpu(cpu);
        match offset {
            GICD_CTLR => {
                self.dist.ctlr = value & CTLR_ENABLE;
            }
            GICD_TYPER => {} // read-only
            GICD_IIDR => {
                self.dist.iidr = value;
            }
            GICD_ISENABLER..=0x17C => {
                self.for_line_bits(cpu, offset - GICD_ISENABLER, value, |gic, irq, mask| {
                    gic.enable_irq(irq, mask);
                    // Re-arm an already-high level line so it pends again.
                    if gic.get_irq_trigger(irq) == Trigger::Level && gic.get_irq_level(irq, mask)
                    {
                        gic.set_irq_pending(irq, true, mask);
                    }
                });
            }
            GICD_ICENABLER..=0x1FC => {
                self.for_line_bits(cpu, offset - GICD_ICENABLER, value, |gic, irq, mask| {
                    gic.disable_irq(irq, mask);
                });
            }
            GICD_ISPENDR..=0x27C => {
                self.for_line_bits(cpu, offset - GICD_ISPENDR, value, |gic, irq, mask| {
                    // SGI pending is controlled through GICD_SGIR and the
                    // per-source pending registers only.
                    if irq < NUM_SGI {
                        return;
                    }
                    let mask = if irq < NUM_PRIVATE {
                        mask
                    } else {
                        gic.dist.spi_targets[(irq - NUM_PRIVATE) as usize]
                    };
                    gic.set_irq_pending(irq, true, mask);
                });
            }
            GICD_ICPENDR..=0x2FC => {
                self.for_line_bits(cpu, offset - GICD_ICPENDR, value, |gic, irq, mask| {
                    if irq < NUM_SGI {
                        return;
                    }
                    gic.set_irq_pending(irq, false, mask);
                });
            }
            GICD_ISACTIVER..=0x37C => {} // active state is read-only here
            GICD_ICACTIVER..=0x3FC => {
                self.for_line_bits(cpu, offset - GICD_ICACTIVER, value, |gic, irq, mask| {
                    gic.set_irq_active(irq, false, mask);
                });
            }
            GICD_IPRIORITYR..=0x7F8 => {
                let first = ((offset - GICD_IPRIORITYR) / 4 * 4) as u16;
                for byte in 0..4 {
                    let irq = first + byte as u16;
                    if irq >= self.num_irqs {
                        continue;
                    }
                    let prio = (value >> (byte * 8)) as u8;
                    if irq < NUM_SGI {
                        self.dist.sgi_priority[cpu][irq as usize] = prio;
                    } else if irq < NUM_PRIVATE {
                        self.dist.ppi_priority[cpu][(irq - NUM_SGI) as usize] = prio;
                    } else {
                        self.dist.spi_priority[(irq - NUM_PRIVATE) as usize] = prio;
                    }
                }
            }
            GICD_ITARGETSR..=0x81C => {} // private targets are read-only
            0x820..=0xBF8 => {
                let first = ((offset - GICD_ITARGETSR) / 4 * 4) as u16;
                for byte in 0..4 {
                    let irq = first + byte as u16;
                    if (NUM_PRIVATE..self.num_irqs).contains(&irq) {
                        let idx = (irq - NUM_PRIVATE) as usize;
                        self.dist.spi_targets[idx] = (value >> (byte * 8)) as u8;
                    }
                }
            }
            GICD_ICFGR => {} // SGI trigger config is fixed
            0xC04 => {
                self.dist.cfg_ppi = value & CFG_RESET;
                for i in 0..NUM_PPI {
                    let trigger = if value & (2 << (i * 2)) != 0 {
                        Trigger::Edge
                    } else {
                        Trigger::Level
                    };
                    self.set_irq_trigger(NUM_SGI + i, trigger);
                }
            }
            0xC08..=0xCFC => {
                let word = ((offset - 0xC08) / 4) as usize;
                if word >= self.dist.cfg_spi.len() {
                    log::warn!("write to unimplemented trigger config word {word}");
                } else {
                    self.dist.cfg_spi[word] = value & CFG_RESET;
                    for i in 0..16u16 {
                        let trigger = if value & (2 << (i * 2)) != 0 {
                            Trigger::Edge
                        } else {
                            Trigger::Level
                        };
                        self.set_irq_trigger(NUM_PRIVATE + word as u16 * 16 + i, trigger);
                    }
                }
            }
            GICD_SGIR => {
                self.generate_sgi(cpu, value);
                return; // generate_sgi refreshes the outputs itself
            }
            GICD_CPENDSGIR..=0xF1C => {
                let first = ((offset - GICD_CPENDSGIR) / 4 * 4) as usize;
                for byte in 0..4 {
                    let sgi = first + byte;
                    let clear = (value >> (byte * 8)) as u8;
                    self.dist.sgi_sources[cpu][sgi] &= !clear;
                    if self.dist.sgi_sources[cpu][sgi] == 0 {
                        self.set_irq_pending(sgi as u16, false, 1 << cpu);
                    }
                }
            }
            GICD_SPENDSGIR..=0xF2C => {
                let first = ((offset - GICD_SPENDSGIR) / 4 * 4) as usize;
                for byte in 0..4 {
                    let sgi = first + byte;
                    let sources = (value >> (byte * 8)) as u8;
                    if sources == 0 {
                        continue;
                    }
                    self.dist.sgi_sources[cpu][sgi] |= sources;
                    self.set_irq_pending(sgi as u16, true, 1 << cpu);
                    self.set_irq_signaled(sgi as u16, false, 1 << cpu);
                }
            }
            GICD_CIDR..=0xFFC => {} // read-only
            _ => {
                log::warn!("write to unknown distributor register at offset {offset:#x}");
                return;
            }
        }
        self.update(false);
    }

    /// Software-generated interrupt trigger (`GICD_SGIR` write). The target
    /// filter selects the listed processors, all other processors, or the
    /// requesting processor itself.
    fn generate_sgi(&mut self, src_cpu: usize, value: u32) {
        let sgi = (value & 0xF) as u16;
        let filter = (value >> 24) & 0x3;
        let targets = match filter {
            0 => ((value >> 16) & 0xFF) as u8,
            1 => ALL_CPU & !(1 << src_cpu),
            2 => 1 << src_cpu,
            _ => {
                log::warn!("illegal sgi target filter {filter}, request ignored");
                return;
            }
        };

        self.set_irq_pending(sgi, true, targets);
        for target in 0..MAX_CPU {
            if targets & (1 << target) != 0 {
                self.dist.sgi_sources[target][sgi as usize] |= 1 << src_cpu;
            }
        }
        self.set_irq_signaled(sgi, false, targets);
        self.update(false);
    }

    /// Per-target pending sources of one SGI, as seen by `cpu`.
    pub(crate) fn sgi_sources(&self, cpu: usize, sgi: u16) -> u8 {
        self.dist.sgi_sources[cpu][sgi as usize]
    }

    pub(crate) fn clear_sgi_source(&mut self, cpu: usize, sgi: u16, src: u8) {
        self.dist.sgi_sources[cpu][sgi as usize] &= !(1 << src);
    }

    fn read_line_bits(
        &self,
        cpu: usize,
        rel: u64,
        test: impl Fn(&Gicv2, u16, u8) -> bool,
    ) -> u32 {
        let first = (rel / 4 * 32) as u16;
        let mut value = 0u32;
        for bit in 0..32 {
            let irq = first + bit as u16;
            if irq < self.num_irqs && test(self, irq, self.access_mask(cpu, irq)) {
                value |= 1 << bit;
            }
        }
        value
    }

    fn for_line_bits(
        &mut self,
        cpu: usize,
        rel: u64,
        value: u32,
        mut apply: impl FnMut(&mut Gicv2, u16, u8),
    ) {
        let first = (rel / 4 * 32) as u16;
        for bit in 0..32 {
            if value & (1 << bit) == 0 {
                continue;
            }
            let irq = first + bit as u16;
            if irq >= self.num_irqs {
                continue;
            }
            let mask = self.access_mask(cpu, irq);
            apply(self, irq, mask);
        }
    }
}

// Delivery model of a line is currently fixed at construction; kept as a
// query so the acknowledge path reads the same for both models.
impl Gicv2 {
    pub(crate) fn ack_mask(&self, cpu: usize, irq: u16) -> u8 {
        match self.get_irq_model(irq) {
            TargetModel::NTo1 => ALL_CPU,
            TargetModel::NToN => 1 << cpu,
        }
    }
}
