//! Device tree generation for ARM64 boot
//!
//! Describes CPUs, memory, the GICv3, the architected timer, the UART, and
//! every virtio-mmio transport to the guest kernel.

use vm_fdt::FdtWriter;

use crate::hv::GicLayout;
use crate::{Error, Result};

const GIC_PHANDLE: u32 = 1;

/// Interrupt specifier types.
const GIC_SPI: u32 = 0;
const GIC_PPI: u32 = 1;
const IRQ_TYPE_LEVEL_HIGH: u32 = 4;

/// Everything the device tree needs to say.
#[derive(Debug, Clone)]
pub struct FdtConfig {
    pub cmdline: String,
    pub num_cpus: u32,
    pub ram_base: u64,
    pub ram_size: u64,
    pub initrd: Option<(u64, u64)>,
    pub gic: GicLayout,
    pub uart_base: u64,
    /// UART interrupt as an SPI number (relative, i.e. INTID - 32).
    pub uart_spi: u32,
    /// Virtio transports as `(mmio base, size, relative SPI)`.
    pub virtio: Vec<(u64, u64, u32)>,
}

/// Serialize the configuration as a DTB.
pub fn build(cfg: &FdtConfig) -> Result<Vec<u8>> {
    let err = |e: vm_fdt::Error| Error::Config(format!("fdt: {e}"));

    let mut fdt = FdtWriter::new().map_err(err)?;
    let root = fdt.begin_node("").map_err(err)?;
    fdt.property_string("compatible", "linux,dummy-virt").map_err(err)?;
    fdt.property_u32("#address-cells", 2).map_err(err)?;
    fdt.property_u32("#size-cells", 2).map_err(err)?;
    fdt.property_u32("interrupt-parent", GIC_PHANDLE).map_err(err)?;

    // /cpus
    let cpus = fdt.begin_node("cpus").map_err(err)?;
    fdt.property_u32("#address-cells", 1).map_err(err)?;
    fdt.property_u32("#size-cells", 0).map_err(err)?;
    for cpu in 0..cfg.num_cpus {
        let node = fdt.begin_node(&format!("cpu@{cpu}")).map_err(err)?;
        fdt.property_string("device_type", "cpu").map_err(err)?;
        fdt.property_string("compatible", "arm,arm-v8").map_err(err)?;
        fdt.property_string("enable-method", "psci").map_err(err)?;
        fdt.property_u32("reg", cpu).map_err(err)?;
        fdt.end_node(node).map_err(err)?;
    }
    fdt.end_node(cpus).map_err(err)?;

    // /memory
    let memory = fdt
        .begin_node(&format!("memory@{:x}", cfg.ram_base))
        .map_err(err)?;
    fdt.property_string("device_type", "memory").map_err(err)?;
    fdt.property_array_u64("reg", &[cfg.ram_base, cfg.ram_size])
        .map_err(err)?;
    fdt.end_node(memory).map_err(err)?;

    // /chosen
    let chosen = fdt.begin_node("chosen").map_err(err)?;
    fdt.property_string("bootargs", &cfg.cmdline).map_err(err)?;
    if let Some((start, end)) = cfg.initrd {
        fdt.property_u64("linux,initrd-start", start).map_err(err)?;
        fdt.property_u64("linux,initrd-end", end).map_err(err)?;
    }
    fdt.property_string("stdout-path", &format!("/uart@{:x}", cfg.uart_base))
        .map_err(err)?;
    fdt.end_node(chosen).map_err(err)?;

    // /psci
    let psci = fdt.begin_node("psci").map_err(err)?;
    fdt.property_string_list(
        "compatible",
        vec!["arm,psci-1.0".into(), "arm,psci-0.2".into()],
    )
    .map_err(err)?;
    fdt.property_string("method", "hvc").map_err(err)?;
    fdt.end_node(psci).map_err(err)?;

    // /timer: the four architected PPIs.
    let cpu_mask = ((1u32 << cfg.num_cpus) - 1) << 8;
    let timer = fdt.begin_node("timer").map_err(err)?;
    fdt.property_string("compatible", "arm,armv8-timer").map_err(err)?;
    fdt.property_null("always-on").map_err(err)?;
    let mut irqs = Vec::new();
    for ppi in [13u32, 14, 11, 10] {
        irqs.extend_from_slice(&[GIC_PPI, ppi, cpu_mask | IRQ_TYPE_LEVEL_HIGH]);
    }
    fdt.property_array_u32("interrupts", &irqs).map_err(err)?;
    fdt.end_node(timer).map_err(err)?;

    // GICv3: distributor + redistributor frames.
    let gic = fdt
        .begin_node(&format!("intc@{:x}", cfg.gic.dist_base))
        .map_err(err)?;
    fdt.property_string("compatible", "arm,gic-v3").map_err(err)?;
    fdt.property_u32("#interrupt-cells", 3).map_err(err)?;
    fdt.property_null("interrupt-controller").map_err(err)?;
    fdt.property_array_u64(
        "reg",
        &[
            cfg.gic.dist_base,
            cfg.gic.dist_size,
            cfg.gic.redist_base,
            cfg.gic.redist_size,
        ],
    )
    .map_err(err)?;
    fdt.property_u32("phandle", GIC_PHANDLE).map_err(err)?;
    fdt.end_node(gic).map_err(err)?;

    // UART.
    let uart = fdt
        .begin_node(&format!("uart@{:x}", cfg.uart_base))
        .map_err(err)?;
    fdt.property_string("compatible", "ns16550a").map_err(err)?;
    fdt.property_array_u64("reg", &[cfg.uart_base, 0x1000]).map_err(err)?;
    fdt.property_u32("clock-frequency", 1_843_200).map_err(err)?;
    fdt.property_u32("reg-shift", 2).map_err(err)?;
    fdt.property_array_u32(
        "interrupts",
        &[GIC_SPI, cfg.uart_spi, IRQ_TYPE_LEVEL_HIGH],
    )
    .map_err(err)?;
    fdt.end_node(uart).map_err(err)?;

    // Virtio transports.
    for &(base, size, spi) in &cfg.virtio {
        let node = fdt
            .begin_node(&format!("virtio_mmio@{base:x}"))
            .map_err(err)?;
        fdt.property_string("compatible", "virtio,mmio").map_err(err)?;
        fdt.property_array_u64("reg", &[base, size]).map_err(err)?;
        fdt.property_array_u32("interrupts", &[GIC_SPI, spi, IRQ_TYPE_LEVEL_HIGH])
            .map_err(err)?;
        fdt.property_null("dma-coherent").map_err(err)?;
        fdt.end_node(node).map_err(err)?;
    }

    fdt.end_node(root).map_err(err)?;
    fdt.finish().map_err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal DTB parser: walks the structure block and returns
    /// `(node path, property name, raw bytes)` triples.
    fn parse_props(blob: &[u8]) -> Vec<(String, String, Vec<u8>)> {
        let be32 = |off: usize| u32::from_be_bytes(blob[off..off + 4].try_into().unwrap());
        assert_eq!(be32(0), 0xd00d_feed, "FDT magic");
        let off_struct = be32(8) as usize;
        let off_strings = be32(12) as usize;

        let mut props = Vec::new();
        let mut path: Vec<String> = Vec::new();
        let mut pos = off_struct;
        loop {
            let token = be32(pos);
            pos += 4;
            match token {
                1 => {
                    // BEGIN_NODE: NUL-terminated name, padded to 4.
                    let end = blob[pos..].iter().position(|&b| b == 0).unwrap();
                    let name = String::from_utf8_lossy(&blob[pos..pos + end]).into_owned();
                    path.push(name);
                    pos = (pos + end + 1 + 3) & !3;
                }
                2 => {
                    path.pop();
                }
                3 => {
                    let len = be32(pos) as usize;
                    let nameoff = be32(pos + 4) as usize;
                    let name_start = off_strings + nameoff;
                    let name_end = blob[name_start..].iter().position(|&b| b == 0).unwrap();
                    let name =
                        String::from_utf8_lossy(&blob[name_start..name_start + name_end])
                            .into_owned();
                    let value = blob[pos + 8..pos + 8 + len].to_vec();
                    props.push((path.join("/"), name, value));
                    pos = (pos + 8 + len + 3) & !3;
                }
                4 => {} // NOP
                9 => return props,
                other => panic!("unknown FDT token {other}"),
            }
        }
    }

    fn config() -> FdtConfig {
        FdtConfig {
            cmdline: "console=ttyS0 quiet".into(),
            num_cpus: 2,
            ram_base: 0x4000_0000,
            ram_size: 256 * 1024 * 1024,
            initrd: Some((0x4800_0000, 0x4810_0000)),
            gic: GicLayout {
                dist_base: 0x0800_0000,
                dist_size: 0x1_0000,
                redist_base: 0x080a_0000,
                redist_size: 0x4_0000,
                maintenance_irq: 9,
            },
            uart_base: 0x0900_0000,
            uart_spi: 1,
            virtio: vec![(0x0a00_0000, 0x200, 16), (0x0a00_1000, 0x200, 17)],
        }
    }

    fn find<'a>(
        props: &'a [(String, String, Vec<u8>)],
        path: &str,
        name: &str,
    ) -> Option<&'a [u8]> {
        props
            .iter()
            .find(|(p, n, _)| p == path && n == name)
            .map(|(_, _, v)| v.as_slice())
    }

    #[test]
    fn blob_parses_and_round_trips_declared_properties() {
        let blob = build(&config()).unwrap();
        let props = parse_props(&blob);

        assert_eq!(
            find(&props, "/chosen", "bootargs").unwrap(),
            b"console=ttyS0 quiet\0"
        );
        // memory reg: base and size as big-endian u64 pairs.
        let reg = find(&props, "/memory@40000000", "reg").unwrap();
        assert_eq!(
            u64::from_be_bytes(reg[..8].try_into().unwrap()),
            0x4000_0000
        );
        assert_eq!(
            u64::from_be_bytes(reg[8..16].try_into().unwrap()),
            256 * 1024 * 1024
        );
        // initrd range.
        assert_eq!(
            u64::from_be_bytes(
                find(&props, "/chosen", "linux,initrd-start")
                    .unwrap()
                    .try_into()
                    .unwrap()
            ),
            0x4800_0000
        );
        // PSCI method.
        assert_eq!(find(&props, "/psci", "method").unwrap(), b"hvc\0");
    }

    #[test]
    fn one_cpu_node_per_vcpu() {
        let blob = build(&config()).unwrap();
        let props = parse_props(&blob);
        assert!(find(&props, "/cpus/cpu@0", "reg").is_some());
        assert!(find(&props, "/cpus/cpu@1", "reg").is_some());
        assert!(find(&props, "/cpus/cpu@2", "reg").is_none());
    }

    #[test]
    fn gic_node_carries_both_frames() {
        let blob = build(&config()).unwrap();
        let props = parse_props(&blob);
        let reg = find(&props, "/intc@8000000", "reg").unwrap();
        let vals: Vec<u64> = reg
            .chunks(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(vals, vec![0x0800_0000, 0x1_0000, 0x080a_0000, 0x4_0000]);
        assert!(find(&props, "/intc@8000000", "interrupt-controller").is_some());
    }

    #[test]
    fn timer_has_four_ppis() {
        let blob = build(&config()).unwrap();
        let props = parse_props(&blob);
        let irqs = find(&props, "/timer", "interrupts").unwrap();
        assert_eq!(irqs.len(), 4 * 3 * 4);
        // First triple: PPI 13.
        assert_eq!(u32::from_be_bytes(irqs[0..4].try_into().unwrap()), 1);
        assert_eq!(u32::from_be_bytes(irqs[4..8].try_into().unwrap()), 13);
    }

    #[test]
    fn virtio_nodes_present_with_spis() {
        let blob = build(&config()).unwrap();
        let props = parse_props(&blob);
        let irq = find(&props, "/virtio_mmio@a001000", "interrupts").unwrap();
        assert_eq!(u32::from_be_bytes(irq[4..8].try_into().unwrap()), 17);
        assert_eq!(
            find(&props, "/virtio_mmio@a000000", "compatible").unwrap(),
            b"virtio,mmio\0"
        );
    }
}
