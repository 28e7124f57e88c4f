//! End-to-end scenarios driven purely through the guest-visible register
//! interface, the way firmware would program the controller.

use argon_interrupts::{GicConfig, Gicv2, LineEvent};
use argon_io_snapshot::IoSnapshot;

const GICD_CTLR: u64 = 0x000;
const GICD_ISENABLER1: u64 = 0x104;
const GICD_IPRIORITYR: u64 = 0x400;
const GICD_ITARGETSR: u64 = 0x800;
const GICD_ICFGR2: u64 = 0xC08;
const GICD_SGIR: u64 = 0xF00;

const GICC_CTLR: u64 = 0x000;
const GICC_PMR: u64 = 0x004;
const GICC_IAR: u64 = 0x00C;
const GICC_EOIR: u64 = 0x010;
const GICC_RPR: u64 = 0x014;

const GICH_HCR: u64 = 0x00;
const GICH_LR0: u64 = 0x100;
const GICV_CTLR: u64 = 0x00;
const GICV_PMR: u64 = 0x04;
const GICV_IAR: u64 = 0x0C;
const GICV_EOIR: u64 = 0x10;

const SPURIOUS: u32 = 1023;

fn boot(num_cpus: usize) -> Gicv2 {
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

/// A device raises an edge-triggered shared interrupt; the targeted
/// processor takes it, services it, and the controller goes quiet again.
#[test]
fn edge_spi_full_service_cycle() {
    let mut gic = boot(2);
    gic.distif_write(0, GICD_ISENABLER1, 1 << 1); // SPI 33
    gic.distif_write(0, GICD_IPRIORITYR + 32, 0xA0 << 8);
    gic.distif_write(0, GICD_ITARGETSR + 32, 0x02 << 8); // cpu 1 only

    gic.set_spi_level(33, true);
    gic.set_spi_level(33, false);

    assert!(!gic.irq_asserted(0));
    assert!(gic.irq_asserted(1));
    assert_eq!(
        gic.take_events(),
        vec![LineEvent::Irq {
            cpu: 1,
            level: true
        }]
    );

    assert_eq!(gic.cpuif_read(1, GICC_IAR), 33);
    assert_eq!(gic.cpuif_read(1, GICC_RPR), 0xA0);
    assert!(!gic.irq_asserted(1));

    gic.cpuif_write(1, GICC_EOIR, 33);
    assert_eq!(gic.cpuif_read(1, GICC_RPR), 0xFF);
    assert_eq!(gic.cpuif_read(1, GICC_IAR), SPURIOUS);

    // A second pulse delivers again.
    gic.set_spi_level(33, true);
    assert!(gic.irq_asserted(1));
}

/// A level-triggered line delivers once per assertion of the wire: after
/// the acknowledge it stays quiet until the device toggles the wire again.
#[test]
fn level_spi_delivers_once_per_wire_assertion() {
    let mut gic = boot(1);
    gic.distif_write(0, GICD_ISENABLER1, 1 << 0); // SPI 32
    gic.distif_write(0, GICD_ITARGETSR + 32, 0x01);
    gic.distif_write(0, GICD_ICFGR2, 0); // level-triggered

    gic.set_spi_level(32, true);
    assert_eq!(gic.cpuif_read(0, GICC_IAR), 32);
    gic.cpuif_write(0, GICC_EOIR, 32);

    // Acknowledged already; the held-high wire does not redeliver.
    assert!(!gic.irq_asserted(0));
    assert_eq!(gic.cpuif_read(0, GICC_IAR), SPURIOUS);

    gic.set_spi_level(32, false);
    gic.set_spi_level(32, true);
    assert!(gic.irq_asserted(0));
    assert_eq!(gic.cpuif_read(0, GICC_IAR), 32);
    gic.set_spi_level(32, false);
    gic.cpuif_write(0, GICC_EOIR, 32);
    assert!(!gic.irq_asserted(0));
}

/// Two processors signal each other with SGIs; each acknowledge carries
/// the id of the requesting processor.
#[test]
fn cross_processor_software_interrupts() {
    let mut gic = boot(4);

    // Processor 0 kicks everyone else, processor 2 answers back.
    gic.distif_write(0, GICD_SGIR, (1 << 24) | 7);
    gic.distif_write(2, GICD_SGIR, (2 << 16) | 8);

    let ack = gic.cpuif_read(2, GICC_IAR);
    assert_eq!(ack & 0x3FF, 7);
    assert_eq!((ack >> 10) & 0x7, 0);
    gic.cpuif_write(2, GICC_EOIR, 7);

    // Processor 1 has both SGIs pending; the lower id wins the tie.
    let ack = gic.cpuif_read(1, GICC_IAR);
    assert_eq!(ack & 0x3FF, 7);
    assert_eq!((ack >> 10) & 0x7, 0);
    gic.cpuif_write(1, GICC_EOIR, 7);

    let ack = gic.cpuif_read(1, GICC_IAR);
    assert_eq!(ack & 0x3FF, 8);
    assert_eq!((ack >> 10) & 0x7, 2);
    gic.cpuif_write(1, GICC_EOIR, 8);

    // Processor 0 excluded itself from its own broadcast.
    assert_eq!(gic.cpuif_read(0, GICC_IAR) & 0x3FF, SPURIOUS);
}

/// Nested preemption with out-of-order completion: the guest finishes the
/// middle handler first and the running priority only drops when the
/// innermost one completes.
#[test]
fn nested_preemption_completes_out_of_order() {
    let mut gic = boot(1);
    gic.distif_write(0, GICD_ISENABLER1, 0b111); // SPIs 32..35
    gic.distif_write(0, GICD_ITARGETSR + 32, 0x01_01_01);
    gic.distif_write(0, GICD_IPRIORITYR + 32, 0x20_40_60);

    gic.set_spi_level(32, true);
    assert_eq!(gic.cpuif_read(0, GICC_IAR), 32);
    gic.set_spi_level(33, true);
    assert_eq!(gic.cpuif_read(0, GICC_IAR), 33);
    gic.set_spi_level(34, true);
    assert_eq!(gic.cpuif_read(0, GICC_IAR), 34);
    assert_eq!(gic.cpuif_read(0, GICC_RPR), 0x20);

    gic.cpuif_write(0, GICC_EOIR, 33);
    assert_eq!(gic.cpuif_read(0, GICC_RPR), 0x20);
    gic.cpuif_write(0, GICC_EOIR, 34);
    assert_eq!(gic.cpuif_read(0, GICC_RPR), 0x60);
    gic.cpuif_write(0, GICC_EOIR, 32);
    assert_eq!(gic.cpuif_read(0, GICC_RPR), 0xFF);
}

/// A hypervisor injects a virtual interrupt and the guest services it
/// through the virtual interface without touching physical state.
#[test]
fn hypervisor_injection_round_trip() {
    let mut gic = boot(1);
    gic.vifctrl_write(0, GICH_HCR, 1);
    gic.vcpuif_write(0, GICV_CTLR, 1);
    gic.vcpuif_write(0, GICV_PMR, 0xFF);

    gic.vifctrl_write(0, GICH_LR0, (1 << 28) | (6 << 23) | 72);
    assert!(gic.virq_asserted(0));
    assert!(!gic.irq_asserted(0));

    assert_eq!(gic.vcpuif_read(0, GICV_IAR), 72);
    assert!(!gic.virq_asserted(0));
    gic.vcpuif_write(0, GICV_EOIR, 72);
    assert_eq!(gic.vcpuif_read(0, GICV_IAR), SPURIOUS);
    assert_eq!(gic.vifctrl_read(0, GICH_LR0) & (0b11 << 28), 0);
}

/// Snapshot taken mid-service restores to an equivalent controller.
#[test]
fn snapshot_round_trip_mid_service() {
    let mut gic = boot(1);
    gic.distif_write(0, GICD_ISENABLER1, 0b11);
    gic.distif_write(0, GICD_ITARGETSR + 32, 0x01_01);
    gic.distif_write(0, GICD_IPRIORITYR + 32, 0x30_50);
    gic.set_spi_level(32, true);
    assert_eq!(gic.cpuif_read(0, GICC_IAR), 32);
    gic.set_spi_level(33, true);

    let bytes = gic.save_state();
    let mut restored = Gicv2::new(GicConfig {
        num_cpus: 1,
        num_spis: 64,
    });
    restored.load_state(&bytes).unwrap();
    restored.sync_lines();

    // SPI 33 preempts the restored service of SPI 32.
    assert!(restored.irq_asserted(0));
    assert_eq!(restored.cpuif_read(0, GICC_IAR), 33);
    restored.cpuif_write(0, GICC_EOIR, 33);
    restored.cpuif_write(0, GICC_EOIR, 32);
    assert_eq!(restored.cpuif_read(0, GICC_RPR), 0xFF);
}
