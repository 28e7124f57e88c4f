//! Snapshot support. Wire levels are transient inputs and are not saved;
//! call [`Gicv2::sync_lines`] after a restore to recompute the outputs and
//! the highest-priority-pending registers from the restored state.

use argon_io_snapshot::codec::{Decoder, Encoder};
use argon_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};

use super::{Gicv2, IrqState, ListRegister, TargetModel, Trigger, MAX_CPU, NUM_LIST_REGS};

const TAG_DIST_CTLR: u16 = 1;
const TAG_DIST_IIDR: u16 = 2;
const TAG_LINES: u16 = 3;
const TAG_SGI_PRIORITY: u16 = 4;
const TAG_PPI_PRIORITY: u16 = 5;
const TAG_SPI_PRIORITY: u16 = 6;
const TAG_SPI_TARGETS: u16 = 7;
const TAG_TRIGGER_CFG: u16 = 8;
const TAG_SGI_SOURCES: u16 = 9;
const TAG_CPUIF: u16 = 10;
const TAG_RESUME: u16 = 11;
const TAG_VIFCTRL: u16 = 12;
const TAG_VCPUIF: u16 = 13;

impl IoSnapshot for Gicv2 {
    const DEVICE_ID: [u8; 4] = *b"GIC2";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u32(TAG_DIST_CTLR, self.dist.ctlr);
        w.field_u32(TAG_DIST_IIDR, self.dist.iidr);

        let mut enc = Encoder::new().u16(self.num_irqs);
        for line in &self.lines {
            enc = enc
                .u8(line.enabled)
                .u8(line.pending)
                .u8(line.active)
                .u8(line.level)
                .u8(line.signaled)
                .u8((line.trigger == Trigger::Level) as u8)
                .u8((line.model == TargetModel::NTo1) as u8);
        }
        w.field_bytes(TAG_LINES, enc.finish());

        w.field_bytes(
            TAG_SGI_PRIORITY,
            self.dist.sgi_priority.iter().flatten().copied().collect(),
        );
        w.field_bytes(
            TAG_PPI_PRIORITY,
            self.dist.ppi_priority.iter().flatten().copied().collect(),
        );

        let mut enc = Encoder::new().u16(self.dist.spi_priority.len() as u16);
        for &prio in &self.dist.spi_priority {
            enc = enc.u8(prio);
        }
        w.field_bytes(TAG_SPI_PRIORITY, enc.finish());

        let mut enc = Encoder::new().u16(self.dist.spi_targets.len() as u16);
        for &targets in &self.dist.spi_targets {
            enc = enc.u8(targets);
        }
        w.field_bytes(TAG_SPI_TARGETS, enc.finish());

        let mut enc = Encoder::new()
            .u32(self.dist.cfg_ppi)
            .u16(self.dist.cfg_spi.len() as u16);
        for &word in &self.dist.cfg_spi {
            enc = enc.u32(word);
        }
        w.field_bytes(TAG_TRIGGER_CFG, enc.finish());

        w.field_bytes(
            TAG_SGI_SOURCES,
            self.dist.sgi_sources.iter().flatten().copied().collect(),
        );

        let mut enc = Encoder::new();
        for cpu in 0..MAX_CPU {
            enc = enc
                .u32(self.cpuif.ctlr[cpu])
                .u32(self.cpuif.pmr[cpu])
                .u32(self.cpuif.bpr[cpu])
                .u32(self.cpuif.rpr[cpu])
                .u32(self.cpuif.apr[cpu])
                .u32(self.cpuif.dir[cpu])
                .u16(self.cpuif.current[cpu]);
        }
        w.field_bytes(TAG_CPUIF, enc.finish());

        let mut enc = Encoder::new().u16(self.num_irqs);
        for chain in &self.cpuif.resume {
            for cpu in 0..MAX_CPU {
                enc = enc.u16(chain[cpu]);
            }
        }
        w.field_bytes(TAG_RESUME, enc.finish());

        let mut enc = Encoder::new();
        for cpu in 0..MAX_CPU {
            enc = enc.u32(self.vifctrl.hcr[cpu]).u32(self.vifctrl.apr[cpu]);
            for slot in &self.vifctrl.lr[cpu] {
                enc = enc.u32(slot.raw).bool(slot.pending).bool(slot.active);
            }
        }
        w.field_bytes(TAG_VIFCTRL, enc.finish());

        let mut enc = Encoder::new();
        for cpu in 0..MAX_CPU {
            enc = enc
                .u32(self.vcpuif.ctlr[cpu])
                .u32(self.vcpuif.pmr[cpu])
                .u32(self.vcpuif.bpr[cpu])
                .u32(self.vcpuif.rpr[cpu])
                .u32(self.vcpuif.apr[cpu]);
        }
        w.field_bytes(TAG_VCPUIF, enc.finish());

        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;
        self.reset();

        if let Some(ctlr) = r.u32(TAG_DIST_CTLR)? {
            self.dist.ctlr = ctlr;
        }
        if let Some(iidr) = r.u32(TAG_DIST_IIDR)? {
            self.dist.iidr = iidr;
        }

        if let Some(payload) = r.bytes(TAG_LINES) {
            let mut d = Decoder::new(payload);
            let count = d.u16()?;
            for irq in 0..count {
                let line = IrqState {
                    enabled: d.u8()?,
                    pending: d.u8()?,
                    active: d.u8()?,
                    level: d.u8()?,
                    signaled: d.u8()?,
                    trigger: if d.u8()? != 0 {
                        Trigger::Level
                    } else {
                        Trigger::Edge
                    },
                    model: if d.u8()? != 0 {
                        TargetModel::NTo1
                    } else {
                        TargetModel::NToN
                    },
                };
                if irq < self.num_irqs {
                    self.lines[irq as usize] = line;
                }
            }
            d.finish()?;
        }

        if let Some(payload) = r.bytes(TAG_SGI_PRIORITY) {
            let mut d = Decoder::new(payload);
            for cpu in 0..MAX_CPU {
                for irq in 0..self.dist.sgi_priority[cpu].len() {
                    self.dist.sgi_priority[cpu][irq] = d.u8()?;
                }
            }
            d.finish()?;
        }
        if let Some(payload) = r.bytes(TAG_PPI_PRIORITY) {
            let mut d = Decoder::new(payload);
            for cpu in 0..MAX_CPU {
                for irq in 0..self.dist.ppi_priority[cpu].len() {
                    self.dist.ppi_priority[cpu][irq] = d.u8()?;
                }
            }
            d.finish()?;
        }

        if let Some(payload) = r.bytes(TAG_SPI_PRIORITY) {
            let mut d = Decoder::new(payload);
            let count = d.u16()? as usize;
            for idx in 0..count {
                let prio = d.u8()?;
                if idx < self.dist.spi_priority.len() {
                    self.dist.spi_priority[idx] = prio;
                }
            }
            d.finish()?;
        }
        if let Some(payload) = r.bytes(TAG_SPI_TARGETS) {
            let mut d = Decoder::new(payload);
            let count = d.u16()? as usize;
            for idx in 0..count {
                let targets = d.u8()?;
                if idx < self.dist.spi_targets.len() {
                    self.dist.spi_targets[idx] = targets;
                }
            }
            d.finish()?;
        }

        if let Some(payload) = r.bytes(TAG_TRIGGER_CFG) {
            let mut d = Decoder::new(payload);
            self.dist.cfg_ppi = d.u32()?;
            let count = d.u16()? as usize;
            for idx in 0..count {
                let word = d.u32()?;
                if idx < self.dist.cfg_spi.len() {
                    self.dist.cfg_spi[idx] = word;
                }
            }
            d.finish()?;
        }

        if let Some(payload) = r.bytes(TAG_SGI_SOURCES) {
            let mut d = Decoder::new(payload);
            for cpu in 0..MAX_CPU {
                for sgi in 0..self.dist.sgi_sources[cpu].len() {
                    self.dist.sgi_sources[cpu][sgi] = d.u8()?;
                }
            }
            d.finish()?;
        }

        if let Some(payload) = r.bytes(TAG_CPUIF) {
            let mut d = Decoder::new(payload);
            for cpu in 0..MAX_CPU {
                self.cpuif.ctlr[cpu] = d.u32()?;
                self.cpuif.pmr[cpu] = d.u32()?;
                self.cpuif.bpr[cpu] = d.u32()?;
                self.cpuif.rpr[cpu] = d.u32()?;
                self.cpuif.apr[cpu] = d.u32()?;
                self.cpuif.dir[cpu] = d.u32()?;
                self.cpuif.current[cpu] = d.u16()?;
            }
            d.finish()?;
        }

        if let Some(payload) = r.bytes(TAG_RESUME) {
            let mut d = Decoder::new(payload);
            let count = d.u16()?;
            for irq in 0..count {
                for cpu in 0..MAX_CPU {
                    let resume = d.u16()?;
                    if irq < self.num_irqs {
                        self.cpuif.resume[irq as usize][cpu] = resume;
                    }
                }
            }
            d.finish()?;
        }

        if let Some(payload) = r.bytes(TAG_VIFCTRL) {
            let mut d = Decoder::new(payload);
            for cpu in 0..MAX_CPU {
                self.vifctrl.hcr[cpu] = d.u32()?;
                self.vifctrl.apr[cpu] = d.u32()?;
                for slot in 0..NUM_LIST_REGS {
                    // Re-derive the decoded fields from the raw word; the
                    // live state bits override what was last written.
                    let mut lr = ListRegister::decode(d.u32()?);
                    lr.pending = d.bool()?;
                    lr.active = d.bool()?;
                    self.vifctrl.lr[cpu][slot] = lr;
                }
            }
            d.finish()?;
        }

        if let Some(payload) = r.bytes(TAG_VCPUIF) {
            let mut d = Decoder::new(payload);
            for cpu in 0..MAX_CPU {
                self.vcpuif.ctlr[cpu] = d.u32()?;
                self.vcpuif.pmr[cpu] = d.u32()?;
                self.vcpuif.bpr[cpu] = d.u32()?;
                self.vcpuif.rpr[cpu] = d.u32()?;
                self.vcpuif.apr[cpu] = d.u32()?;
            }
            d.finish()?;
        }

        Ok(())
    }
}
