//! ACPI table generation (x86)
//!
//! RSDP v2 at a fixed scannable address pointing at an XSDT in the reserved
//! region at the top of guest RAM, with FADT/DSDT, MADT, and HPET tables.
//! The DSDT carries the serial port, the RTC, and one LNRO0005 node per
//! virtio-mmio transport so the kernel enumerates them with their GSIs.

use crate::devices::hpet;
use crate::memory::GuestRam;
use crate::Result;

/// Fixed RSDP location in the legacy BIOS scan window.
pub const RSDP_ADDR: u64 = 0x000e_0000;

/// Size of the reserved table region at the top of RAM.
pub const ACPI_REGION_SIZE: u64 = 0x1_0000;

const OEM_ID: &[u8; 6] = b"CCVMM ";
const OEM_TABLE_ID: &[u8; 8] = b"CCVMMCOR";

/// Where the tables landed; the e820 map reserves `region`.
#[derive(Debug, Clone, Copy)]
pub struct AcpiInfo {
    pub rsdp: u64,
    pub region_base: u64,
    pub region_size: u64,
}

/// A virtio-mmio transport to describe in the DSDT.
#[derive(Debug, Clone, Copy)]
pub struct VirtioMmioDesc {
    pub base: u64,
    pub size: u32,
    pub gsi: u32,
}

fn checksum(data: &[u8]) -> u8 {
    let sum: u8 = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Standard 36-byte table header; checksum patched after the body exists.
fn header(signature: &[u8; 4], total_len: u32, revision: u8) -> Vec<u8> {
    let mut h = Vec::with_capacity(36);
    h.extend_from_slice(signature);
    h.extend_from_slice(&total_len.to_le_bytes());
    h.push(revision);
    h.push(0); // checksum placeholder
    h.extend_from_slice(OEM_ID);
    h.extend_from_slice(OEM_TABLE_ID);
    h.extend_from_slice(&1u32.to_le_bytes()); // OEM revision
    h.extend_from_slice(b"CCVM"); // creator id
    h.extend_from_slice(&1u32.to_le_bytes()); // creator revision
    h
}

fn finish_table(mut table: Vec<u8>) -> Vec<u8> {
    let len = table.len() as u32;
    table[4..8].copy_from_slice(&len.to_le_bytes());
    table[9] = 0;
    table[9] = checksum(&table);
    table
}

/// AML PkgLength. The value encodes the body plus the length bytes
/// themselves; width steps at 62/4094/1048574 bytes of body.
pub fn encode_pkg_length(out: &mut Vec<u8>, body_len: usize) {
    if body_len <= 0x3e {
        out.push((body_len + 1) as u8);
    } else if body_len <= 0xffe {
        let total = body_len + 2;
        out.push((1u8 << 6) | ((total & 0x0f) as u8));
        out.push(((total >> 4) & 0xff) as u8);
    } else if body_len <= 0xf_fffe {
        let total = body_len + 3;
        out.push((2u8 << 6) | ((total & 0x0f) as u8));
        out.push(((total >> 4) & 0xff) as u8);
        out.push(((total >> 12) & 0xff) as u8);
    } else {
        let total = body_len + 4;
        out.push((3u8 << 6) | ((total & 0x0f) as u8));
        out.push(((total >> 4) & 0xff) as u8);
        out.push(((total >> 12) & 0xff) as u8);
        out.push(((total >> 20) & 0xff) as u8);
    }
}

/// Name(name, String) AML.
fn aml_name_string(out: &mut Vec<u8>, name: &[u8; 4], value: &str) {
    out.push(0x08); // NameOp
    out.extend_from_slice(name);
    out.push(0x0d); // StringPrefix
    out.extend_from_slice(value.as_bytes());
    out.push(0x00);
}

/// Name(name, Integer) AML with the compact integer encodings.
fn aml_name_int(out: &mut Vec<u8>, name: &[u8; 4], value: u32) {
    out.push(0x08);
    out.extend_from_slice(name);
    match value {
        0 => out.push(0x00),
        1 => out.push(0x01),
        2..=0xff => {
            out.push(0x0a);
            out.push(value as u8);
        }
        _ => {
            out.push(0x0c); // DWordPrefix
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Name(_CRS, Buffer { resources }) AML.
fn aml_name_crs(out: &mut Vec<u8>, resources: &[u8]) {
    out.push(0x08);
    out.extend_from_slice(b"_CRS");
    out.push(0x11); // BufferOp
    // BufferSize integer, compact encodings.
    let mut size = Vec::new();
    match resources.len() {
        0 => size.push(0x00),
        1 => size.push(0x01),
        n @ 2..=0xff => {
            size.push(0x0a);
            size.push(n as u8);
        }
        n => {
            size.push(0x0b);
            size.extend_from_slice(&(n as u16).to_le_bytes());
        }
    }
    encode_pkg_length(out, size.len() + resources.len());
    out.extend_from_slice(&size);
    out.extend_from_slice(resources);
}

/// Device(name) { body } AML.
fn aml_device(out: &mut Vec<u8>, name: &[u8; 4], body: &[u8]) {
    out.push(0x5b); // ExtOpPrefix
    out.push(0x82); // DeviceOp
    encode_pkg_length(out, 4 + body.len());
    out.extend_from_slice(name);
    out.extend_from_slice(body);
}

/// IO port resource descriptor (16-bit decode).
fn resource_io(resources: &mut Vec<u8>, base: u16, len: u8) {
    resources.push(0x47);
    resources.push(0x01); // 16-bit decode
    resources.extend_from_slice(&base.to_le_bytes());
    resources.extend_from_slice(&base.to_le_bytes());
    resources.push(1); // alignment
    resources.push(len);
}

/// Legacy IRQ descriptor.
fn resource_irq(resources: &mut Vec<u8>, irq: u8) {
    resources.push(0x22);
    resources.extend_from_slice(&(1u16 << irq).to_le_bytes());
}

/// Memory32Fixed + Extended Interrupt pair for a virtio-mmio node.
fn resource_mmio_with_gsi(resources: &mut Vec<u8>, base: u32, size: u32, gsi: u32) {
    resources.push(0x86); // Memory32Fixed
    resources.extend_from_slice(&9u16.to_le_bytes());
    resources.push(0x01); // read/write
    resources.extend_from_slice(&base.to_le_bytes());
    resources.extend_from_slice(&size.to_le_bytes());

    resources.push(0x89); // Extended Interrupt
    resources.extend_from_slice(&6u16.to_le_bytes());
    resources.push(0x0d); // consumer, level, active-high, exclusive
    resources.push(1);
    resources.extend_from_slice(&gsi.to_le_bytes());
}

fn end_tag(resources: &mut Vec<u8>) {
    resources.push(0x79);
    resources.push(0x00);
}

fn build_dsdt(virtio: &[VirtioMmioDesc]) -> Vec<u8> {
    let mut devices = Vec::new();

    // COM1.
    let mut body = Vec::new();
    aml_name_string(&mut body, b"_HID", "PNP0501");
    aml_name_int(&mut body, b"_UID", 0);
    let mut res = Vec::new();
    resource_io(&mut res, 0x3f8, 8);
    resource_irq(&mut res, 4);
    end_tag(&mut res);
    aml_name_crs(&mut body, &res);
    aml_device(&mut devices, b"COM1", &body);

    // RTC.
    let mut body = Vec::new();
    aml_name_string(&mut body, b"_HID", "PNP0B00");
    let mut res = Vec::new();
    resource_io(&mut res, 0x70, 2);
    resource_irq(&mut res, 8);
    end_tag(&mut res);
    aml_name_crs(&mut body, &res);
    aml_device(&mut devices, b"RTC_", &body);

    // One LNRO0005 node per virtio transport.
    for (i, dev) in virtio.iter().enumerate() {
        let mut body = Vec::new();
        aml_name_string(&mut body, b"_HID", "LNRO0005");
        aml_name_int(&mut body, b"_UID", i as u32);
        aml_name_int(&mut body, b"_STA", 0x0f);
        let mut res = Vec::new();
        resource_mmio_with_gsi(&mut res, dev.base as u32, dev.size, dev.gsi);
        end_tag(&mut res);
        aml_name_crs(&mut body, &res);
        let name = [b'V', b'R', b'T', b'0' + i as u8];
        aml_device(&mut devices, &name, &body);
    }

    // Scope(\_SB_) { devices }
    let mut aml = Vec::new();
    aml.push(0x10); // ScopeOp
    encode_pkg_length(&mut aml, 5 + devices.len());
    aml.extend_from_slice(&[0x5c, 0x5f, 0x53, 0x42, 0x5f]); // \_SB_
    aml.extend_from_slice(&devices);

    let mut table = header(b"DSDT", 0, 2);
    table.extend_from_slice(&aml);
    finish_table(table)
}

fn build_fadt(dsdt_addr: u64) -> Vec<u8> {
    let mut t = header(b"FACP", 0, 6);
    t.resize(276, 0);
    // HW_REDUCED_ACPI | PWR_BUTTON | SLP_BUTTON: no PM hardware here.
    let flags: u32 = (1 << 20) | (1 << 4) | (1 << 5);
    t[112..116].copy_from_slice(&flags.to_le_bytes());
    // IAPC_BOOT_ARCH: VGA not present, no MSI restrictions.
    t[109..111].copy_from_slice(&(1u16 << 2).to_le_bytes());
    t[131] = 5; // FADT minor version
    t[140..148].copy_from_slice(&dsdt_addr.to_le_bytes()); // X_DSDT
    finish_table(t)
}

fn build_madt(num_cpus: u32) -> Vec<u8> {
    let mut t = header(b"APIC", 0, 4);
    t.extend_from_slice(&0xfee0_0000u32.to_le_bytes()); // local APIC address
    t.extend_from_slice(&1u32.to_le_bytes()); // PCAT_COMPAT: 8259 pair present

    for cpu in 0..num_cpus {
        // Processor Local APIC.
        t.push(0);
        t.push(8);
        t.push(cpu as u8);
        t.push(cpu as u8);
        t.extend_from_slice(&1u32.to_le_bytes()); // enabled
    }

    // I/O APIC.
    t.push(1);
    t.push(12);
    t.push(0); // id
    t.push(0);
    t.extend_from_slice(&(crate::devices::ioapic::IOAPIC_BASE as u32).to_le_bytes());
    t.extend_from_slice(&0u32.to_le_bytes()); // GSI base

    // Interrupt source overrides: PIT on GSI2, ACPI defaults for the rest.
    for (source, gsi) in [(0u8, 2u32)] {
        t.push(2);
        t.push(10);
        t.push(0); // ISA bus
        t.push(source);
        t.extend_from_slice(&gsi.to_le_bytes());
        t.extend_from_slice(&0u16.to_le_bytes()); // conforms to bus spec
    }

    finish_table(t)
}

fn build_hpet() -> Vec<u8> {
    let mut t = header(b"HPET", 0, 1);
    // Event timer block id: vendor, 64-bit counter, comparator count, rev 1.
    let block_id: u32 =
        (0x8086 << 16) | (1 << 13) | (((hpet::NUM_TIMERS as u32 - 1) & 0x1f) << 8) | 1;
    t.extend_from_slice(&block_id.to_le_bytes());
    // Base address as a generic address structure (system memory).
    t.push(0); // space id: memory
    t.push(64); // register bit width
    t.push(0); // bit offset
    t.push(0); // access size
    t.extend_from_slice(&hpet::HPET_BASE.to_le_bytes());
    t.push(0); // hpet number
    t.extend_from_slice(&0x80u16.to_le_bytes()); // minimum clock tick
    t.push(0); // page protection
    finish_table(t)
}

fn build_xsdt(tables: &[u64]) -> Vec<u8> {
    let mut t = header(b"XSDT", 0, 1);
    for &addr in tables {
        t.extend_from_slice(&addr.to_le_bytes());
    }
    finish_table(t)
}

fn build_rsdp(xsdt_addr: u64) -> Vec<u8> {
    let mut r = Vec::with_capacity(36);
    r.extend_from_slice(b"RSD PTR ");
    r.push(0); // checksum placeholder
    r.extend_from_slice(OEM_ID);
    r.push(2); // revision: ACPI 2.0+
    r.extend_from_slice(&0u32.to_le_bytes()); // rsdt (unused)
    r.extend_from_slice(&36u32.to_le_bytes()); // length
    r.extend_from_slice(&xsdt_addr.to_le_bytes());
    r.push(0); // extended checksum placeholder
    r.extend_from_slice(&[0u8; 3]);
    r[8] = checksum(&r[..20]);
    r[32] = checksum(&r);
    r
}

/// Write the full table set into guest RAM. Tables live in the top
/// `ACPI_REGION_SIZE` of the RAM window; the RSDP goes to the legacy scan
/// area.
pub fn install(ram: &GuestRam, num_cpus: u32, virtio: &[VirtioMmioDesc]) -> Result<AcpiInfo> {
    let region_base = ram.end() - ACPI_REGION_SIZE;

    let dsdt_addr = region_base;
    let dsdt = build_dsdt(virtio);
    ram.write_at(dsdt_addr, &dsdt)?;

    let fadt_addr = region_base + 0x2000;
    ram.write_at(fadt_addr, &build_fadt(dsdt_addr))?;

    let madt_addr = region_base + 0x3000;
    ram.write_at(madt_addr, &build_madt(num_cpus))?;

    let hpet_addr = region_base + 0x4000;
    ram.write_at(hpet_addr, &build_hpet())?;

    let xsdt_addr = region_base + 0x5000;
    ram.write_at(xsdt_addr, &build_xsdt(&[fadt_addr, madt_addr, hpet_addr]))?;

    ram.write_at(RSDP_ADDR, &build_rsdp(xsdt_addr))?;

    Ok(AcpiInfo {
        rsdp: RSDP_ADDR,
        region_base,
        region_size: ACPI_REGION_SIZE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sums_to_zero(table: &[u8]) -> bool {
        table.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) == 0
    }

    #[test]
    fn pkg_length_boundary_widths() {
        for (body, expected) in [
            (62usize, 1usize),
            (63, 2),
            (4094, 2),
            (4095, 3),
            (1_048_574, 3),
            (1_048_575, 4),
        ] {
            let mut buf = Vec::new();
            encode_pkg_length(&mut buf, body);
            assert_eq!(buf.len(), expected, "body size {body}");
        }
    }

    #[test]
    fn pkg_length_small_values() {
        let mut buf = Vec::new();
        encode_pkg_length(&mut buf, 10);
        assert_eq!(buf, vec![11]);
        let mut buf = Vec::new();
        encode_pkg_length(&mut buf, 98);
        // total 100 = 0x64: byte0 = 0x44, byte1 = 0x06
        assert_eq!(buf, vec![0x44, 0x06]);
    }

    #[test]
    fn tables_checksum_to_zero() {
        let virtio = [VirtioMmioDesc {
            base: 0xd000_0000,
            size: 0x200,
            gsi: 16,
        }];
        for table in [
            build_dsdt(&virtio),
            build_fadt(0x1000),
            build_madt(2),
            build_hpet(),
            build_xsdt(&[1, 2, 3]),
        ] {
            assert!(sums_to_zero(&table), "{:?}", &table[..4]);
            let len = u32::from_le_bytes(table[4..8].try_into().unwrap());
            assert_eq!(len as usize, table.len());
        }
    }

    #[test]
    fn rsdp_checksums() {
        let rsdp = build_rsdp(0xeeee_0000);
        assert_eq!(rsdp.len(), 36);
        assert!(sums_to_zero(&rsdp[..20]), "v1 checksum");
        assert!(sums_to_zero(&rsdp), "extended checksum");
        assert_eq!(&rsdp[..8], b"RSD PTR ");
        assert_eq!(
            u64::from_le_bytes(rsdp[24..32].try_into().unwrap()),
            0xeeee_0000
        );
    }

    #[test]
    fn dsdt_mentions_every_virtio_node() {
        let virtio = [
            VirtioMmioDesc {
                base: 0xd000_0000,
                size: 0x200,
                gsi: 16,
            },
            VirtioMmioDesc {
                base: 0xd000_1000,
                size: 0x200,
                gsi: 17,
            },
        ];
        let dsdt = build_dsdt(&virtio);
        let count = dsdt
            .windows(8)
            .filter(|w| *w == b"LNRO0005")
            .count();
        assert_eq!(count, 2);
        assert!(dsdt.windows(4).any(|w| w == b"VRT0"));
        assert!(dsdt.windows(4).any(|w| w == b"VRT1"));
        assert!(dsdt.windows(7).any(|w| w == b"PNP0501"));
    }

    #[test]
    fn madt_counts_cpus() {
        let madt = build_madt(4);
        // 4 LAPIC entries of 8 bytes, one IOAPIC of 12, one override of 10.
        let body = madt.len() - 36 - 8;
        assert_eq!(body, 4 * 8 + 12 + 10);
    }

    #[test]
    fn install_reserves_top_of_ram() {
        let ram = GuestRam::new(0, 8 * 1024 * 1024).unwrap();
        let info = install(&ram, 1, &[]).unwrap();
        assert_eq!(info.region_base, 8 * 1024 * 1024 - ACPI_REGION_SIZE);
        let mut sig = [0u8; 8];
        ram.read_at(info.rsdp, &mut sig).unwrap();
        assert_eq!(&sig, b"RSD PTR ");
    }
}
