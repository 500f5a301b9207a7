//! x86-64 Linux boot: bzImage/ELF loading and the zero page
//!
//! Parses the bzImage setup header (or ELF program headers), places kernel,
//! initramfs, command line, identity-mapped page tables, and the
//! `boot_params` zero page into guest RAM, and reports the register state
//! the first vCPU needs to enter the 64-bit kernel.

use linux_loader::bootparam::{boot_e820_entry, boot_params};
use tracing::{debug, info};
use vm_memory::ByteValued;

use super::acpi::AcpiInfo;
use crate::memory::GuestRam;
use crate::{Error, Result};

/// Guest-physical layout constants.
pub mod layout {
    /// Identity-mapped page tables for the 64-bit entry.
    pub const PAGE_TABLE_ADDR: u64 = 0x9000;
    /// The boot_params zero page.
    pub const ZERO_PAGE_ADDR: u64 = 0x7000;
    /// Kernel command line.
    pub const CMDLINE_ADDR: u64 = 0x2_0000;
    pub const CMDLINE_MAX: usize = 4096;
    /// Fallback load address for non-LOADED_HIGH kernels.
    pub const LOW_LOAD_ADDR: u64 = 0x1_0000;
    /// Load address for LOADED_HIGH kernels without a preference.
    pub const HIGH_LOAD_ADDR: u64 = 0x10_0000;
}

const HDRS_MAGIC: u32 = 0x5372_6448; // "HdrS"
const XLF_KERNEL_64: u16 = 1 << 0;
const LOADED_HIGH: u8 = 1 << 0;

/// E820 entry types.
const E820_RAM: u32 = 1;
const E820_RESERVED: u32 = 2;

/// Register state for entering the kernel.
#[derive(Debug, Clone, Copy)]
pub struct X86BootInfo {
    pub entry_rip: u64,
    pub zero_page: u64,
    pub page_table: u64,
}

/// Load an x86-64 kernel image of either supported format.
pub fn load_kernel(
    ram: &GuestRam,
    kernel: &[u8],
    cmdline: &str,
    initramfs: &[u8],
    acpi: &AcpiInfo,
) -> Result<X86BootInfo> {
    if kernel.len() >= 4 && &kernel[..4] == b"\x7fELF" {
        load_elf(ram, kernel, cmdline, initramfs, acpi)
    } else {
        load_bzimage(ram, kernel, cmdline, initramfs, acpi)
    }
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn load_bzimage(
    ram: &GuestRam,
    kernel: &[u8],
    cmdline: &str,
    initramfs: &[u8],
    acpi: &AcpiInfo,
) -> Result<X86BootInfo> {
    if kernel.len() < 0x268 {
        return Err(Error::Config("kernel image too short for a setup header".into()));
    }
    if read_u32(kernel, 0x202) != HDRS_MAGIC {
        return Err(Error::Config("kernel image has no HdrS magic".into()));
    }
    let xloadflags = read_u16(kernel, 0x236);
    if xloadflags & XLF_KERNEL_64 == 0 {
        return Err(Error::Config("kernel has no 64-bit entry point".into()));
    }

    let setup_sects = match kernel[0x1f1] {
        0 => 4, // historical default
        n => n as u64,
    };
    let payload_offset = 512 * (1 + setup_sects);
    if payload_offset as usize >= kernel.len() {
        return Err(Error::Config("setup sectors exceed the image".into()));
    }
    let payload = &kernel[payload_offset as usize..];

    let loadflags = kernel[0x211];
    let pref_address = read_u64(kernel, 0x258);
    let init_size = read_u32(kernel, 0x260) as u64;
    let load_addr = if pref_address != 0 {
        pref_address
    } else if loadflags & LOADED_HIGH != 0 {
        layout::HIGH_LOAD_ADDR
    } else {
        layout::LOW_LOAD_ADDR
    };

    let clear = init_size.max(payload.len() as u64);
    if load_addr + clear > acpi.region_base {
        return Err(Error::Config(format!(
            "kernel needs {clear:#x} bytes at {load_addr:#x}, past usable RAM"
        )));
    }
    ram.zero(load_addr, clear)?;
    ram.write_at(load_addr, payload)?;
    info!(
        load_addr = format_args!("{load_addr:#x}"),
        len = payload.len(),
        "loaded bzImage payload"
    );

    let initramfs_addr = place_initramfs(ram, load_addr + clear, initramfs, acpi)?;
    write_cmdline(ram, cmdline)?;
    build_zero_page(
        ram,
        Some(&kernel[0x1f1..]),
        cmdline.len(),
        initramfs_addr,
        initramfs.len() as u64,
        acpi,
    )?;
    setup_page_tables(ram)?;

    Ok(X86BootInfo {
        // startup_64 sits 0x200 past the protected-mode entry.
        entry_rip: load_addr + 0x200,
        zero_page: layout::ZERO_PAGE_ADDR,
        page_table: layout::PAGE_TABLE_ADDR,
    })
}

fn load_elf(
    ram: &GuestRam,
    kernel: &[u8],
    cmdline: &str,
    initramfs: &[u8],
    acpi: &AcpiInfo,
) -> Result<X86BootInfo> {
    if kernel.len() < 64 || kernel[4] != 2 || kernel[5] != 1 {
        return Err(Error::Config("not a 64-bit little-endian ELF".into()));
    }
    let entry = read_u64(kernel, 24);
    let phoff = read_u64(kernel, 32) as usize;
    let phentsize = read_u16(kernel, 54) as usize;
    let phnum = read_u16(kernel, 56) as usize;

    let mut top = 0u64;
    for i in 0..phnum {
        let ph = phoff + i * phentsize;
        if ph + 56 > kernel.len() {
            return Err(Error::Config("program header past end of file".into()));
        }
        let p_type = read_u32(kernel, ph);
        if p_type != 1 {
            continue; // PT_LOAD only
        }
        let offset = read_u64(kernel, ph + 8) as usize;
        let paddr = read_u64(kernel, ph + 24);
        let filesz = read_u64(kernel, ph + 32) as usize;
        let memsz = read_u64(kernel, ph + 40);
        if offset + filesz > kernel.len() {
            return Err(Error::Config("segment data past end of file".into()));
        }
        if paddr < ram.base() || paddr + memsz > ram.end() {
            return Err(Error::Config(format!(
                "segment at {paddr:#x}+{memsz:#x} outside guest RAM"
            )));
        }
        ram.zero(paddr, memsz)?;
        ram.write_at(paddr, &kernel[offset..offset + filesz])?;
        top = top.max(paddr + memsz);
        debug!(
            paddr = format_args!("{paddr:#x}"),
            filesz, memsz, "loaded PT_LOAD segment"
        );
    }
    if top == 0 {
        return Err(Error::Config("ELF kernel has no loadable segments".into()));
    }

    let initramfs_addr = place_initramfs(ram, top, initramfs, acpi)?;
    write_cmdline(ram, cmdline)?;
    build_zero_page(
        ram,
        None,
        cmdline.len(),
        initramfs_addr,
        initramfs.len() as u64,
        acpi,
    )?;
    setup_page_tables(ram)?;

    Ok(X86BootInfo {
        entry_rip: entry,
        zero_page: layout::ZERO_PAGE_ADDR,
        page_table: layout::PAGE_TABLE_ADDR,
    })
}

/// Place the initramfs 2 MiB-aligned after the kernel, below the ACPI region.
fn place_initramfs(
    ram: &GuestRam,
    kernel_end: u64,
    initramfs: &[u8],
    acpi: &AcpiInfo,
) -> Result<u64> {
    if initramfs.is_empty() {
        return Ok(0);
    }
    let addr = (kernel_end + 0x1f_ffff) & !0x1f_ffff;
    if addr + initramfs.len() as u64 > acpi.region_base {
        return Err(Error::Config(format!(
            "initramfs of {:#x} bytes does not fit at {addr:#x}",
            initramfs.len()
        )));
    }
    ram.write_at(addr, initramfs)?;
    debug!(addr = format_args!("{addr:#x}"), len = initramfs.len(), "placed initramfs");
    Ok(addr)
}

fn write_cmdline(ram: &GuestRam, cmdline: &str) -> Result<()> {
    if cmdline.len() + 1 > layout::CMDLINE_MAX {
        return Err(Error::Config("kernel command line too long".into()));
    }
    let mut bytes = cmdline.as_bytes().to_vec();
    bytes.push(0);
    ram.write_at(layout::CMDLINE_ADDR, &bytes)
}

/// Assemble and write the boot_params page.
fn build_zero_page(
    ram: &GuestRam,
    setup_header: Option<&[u8]>,
    cmdline_len: usize,
    initramfs_addr: u64,
    initramfs_len: u64,
    acpi: &AcpiInfo,
) -> Result<()> {
    let mut params = boot_params::default();

    if let Some(raw) = setup_header {
        let hdr_len = std::mem::size_of_val(&params.hdr).min(raw.len());
        // SAFETY: setup_header is a plain-old-data #[repr(C)] struct from
        // linux-loader; copying raw little-endian bytes over it is its
        // defined wire representation.
        let hdr_slice = unsafe {
            std::slice::from_raw_parts_mut(&mut params.hdr as *mut _ as *mut u8, hdr_len)
        };
        hdr_slice.copy_from_slice(&raw[..hdr_len]);
    } else {
        // ELF kernels get a synthetic modern header.
        params.hdr.header = HDRS_MAGIC;
        params.hdr.version = 0x020f;
        params.hdr.kernel_alignment = 0x0100_0000;
    }

    params.hdr.type_of_loader = 0xff;
    params.hdr.cmd_line_ptr = layout::CMDLINE_ADDR as u32;
    params.hdr.cmdline_size = cmdline_len as u32;
    params.ext_cmd_line_ptr = (layout::CMDLINE_ADDR >> 32) as u32;
    params.hdr.ramdisk_image = initramfs_addr as u32;
    params.hdr.ramdisk_size = initramfs_len as u32;
    params.ext_ramdisk_image = (initramfs_addr >> 32) as u32;
    params.ext_ramdisk_size = (initramfs_len >> 32) as u32;
    params.acpi_rsdp_addr = acpi.rsdp;

    // E820: all guest RAM usable, minus the sub-1MiB hole and the reserved
    // ACPI region. Entries are sorted by base.
    let mut idx = 0;
    let mut push = |addr: u64, size: u64, type_: u32| {
        params.e820_table[idx] = boot_e820_entry { addr, size, type_ };
        idx += 1;
    };
    push(0, 0x9fc00, E820_RAM);
    push(0x10_0000, acpi.region_base - 0x10_0000, E820_RAM);
    push(acpi.region_base, acpi.region_size, E820_RESERVED);
    params.e820_entries = idx as u8;

    ram.write_at(layout::ZERO_PAGE_ADDR, params.as_slice())?;
    Ok(())
}

/// Identity-map the first GiB with 2 MiB pages for the 64-bit entry.
fn setup_page_tables(ram: &GuestRam) -> Result<()> {
    let pml4 = layout::PAGE_TABLE_ADDR;
    let pdpte = pml4 + 0x1000;
    let pde = pml4 + 0x2000;

    ram.zero(pml4, 0x3000)?;
    ram.write_u64(pml4, pdpte | 0x3)?; // present | writable
    ram.write_u64(pdpte, pde | 0x3)?;
    for i in 0..512u64 {
        // present | writable | page-size (2 MiB)
        ram.write_u64(pde + i * 8, (i * 0x20_0000) | 0x83)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::acpi;

    fn test_ram() -> GuestRam {
        GuestRam::new(0, 64 * 1024 * 1024).unwrap()
    }

    fn test_acpi(ram: &GuestRam) -> AcpiInfo {
        acpi::install(ram, 1, &[]).unwrap()
    }

    /// A minimal, well-formed bzImage: 1 setup sector + payload.
    fn fake_bzimage(payload: &[u8], pref_address: u64) -> Vec<u8> {
        let mut img = vec![0u8; 1024];
        img[0x1f1] = 1; // setup_sects
        img[0x202..0x206].copy_from_slice(&HDRS_MAGIC.to_le_bytes());
        img[0x211] = LOADED_HIGH;
        img[0x236..0x238].copy_from_slice(&XLF_KERNEL_64.to_le_bytes());
        img[0x258..0x260].copy_from_slice(&pref_address.to_le_bytes());
        img[0x260..0x264].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        img.extend_from_slice(payload);
        img
    }

    #[test]
    fn rejects_bad_magic_and_32_bit_kernels() {
        let ram = test_ram();
        let acpi = test_acpi(&ram);
        let junk = vec![0u8; 0x1000];
        assert!(load_kernel(&ram, &junk, "", &[], &acpi).is_err());

        let mut no64 = fake_bzimage(b"xx", 0);
        no64[0x236] = 0;
        assert!(load_kernel(&ram, &no64, "", &[], &acpi).is_err());
    }

    #[test]
    fn bzimage_lands_at_pref_address() {
        let ram = test_ram();
        let acpi = test_acpi(&ram);
        let img = fake_bzimage(b"KERNELPAYLOAD", 0x200_0000);
        let info = load_kernel(&ram, &img, "console=ttyS0", &[], &acpi).unwrap();
        assert_eq!(info.entry_rip, 0x200_0000 + 0x200);
        let mut buf = [0u8; 13];
        ram.read_at(0x200_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"KERNELPAYLOAD");
    }

    #[test]
    fn loaded_high_defaults_to_one_megabyte() {
        let ram = test_ram();
        let acpi = test_acpi(&ram);
        let img = fake_bzimage(b"PAYLOAD", 0);
        let info = load_kernel(&ram, &img, "", &[], &acpi).unwrap();
        assert_eq!(info.entry_rip, layout::HIGH_LOAD_ADDR + 0x200);
    }

    #[test]
    fn e820_is_sorted_contiguous_with_one_reservation() {
        let ram = test_ram();
        let acpi = test_acpi(&ram);
        let img = fake_bzimage(b"P", 0);
        load_kernel(&ram, &img, "quiet", b"CPIO", &acpi).unwrap();

        // Read the e820 table back out of the zero page.
        let nr = {
            let mut b = [0u8; 1];
            ram.read_at(layout::ZERO_PAGE_ADDR + 0x1e8, &mut b).unwrap();
            b[0]
        };
        assert_eq!(nr, 3);
        let mut table = Vec::new();
        for i in 0..nr as u64 {
            let base = ram.read_u64(layout::ZERO_PAGE_ADDR + 0x2d0 + 20 * i).unwrap();
            let size = ram
                .read_u64(layout::ZERO_PAGE_ADDR + 0x2d0 + 20 * i + 8)
                .unwrap();
            let type_ = ram
                .read_u32(layout::ZERO_PAGE_ADDR + 0x2d0 + 20 * i + 16)
                .unwrap();
            table.push((base, size, type_));
        }
        // Sorted by base.
        assert!(table.windows(2).all(|w| w[0].0 < w[1].0));
        // Exactly one reserved entry, covering the ACPI region.
        let reserved: Vec<_> = table.iter().filter(|e| e.2 == E820_RESERVED).collect();
        assert_eq!(reserved.len(), 1);
        assert_eq!(reserved[0].0, acpi.region_base);
        assert_eq!(reserved[0].1, acpi.region_size);
        // RAM above 1 MiB runs contiguously up to the reservation.
        let high = table.iter().find(|e| e.0 == 0x10_0000).unwrap();
        assert_eq!(high.0 + high.1, acpi.region_base);
    }

    #[test]
    fn elf_segments_load_at_paddr() {
        let ram = test_ram();
        let acpi = test_acpi(&ram);

        // Build a one-segment ELF by hand.
        let mut elf = vec![0u8; 0x78];
        elf[..4].copy_from_slice(b"\x7fELF");
        elf[4] = 2;
        elf[5] = 1;
        elf[24..32].copy_from_slice(&0x40_0000u64.to_le_bytes()); // entry
        elf[32..40].copy_from_slice(&0x40u64.to_le_bytes()); // phoff
        elf[54..56].copy_from_slice(&56u16.to_le_bytes());
        elf[56..58].copy_from_slice(&1u16.to_le_bytes());
        // Program header at 0x40.
        elf[0x40..0x44].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        elf[0x48..0x50].copy_from_slice(&0x78u64.to_le_bytes()); // offset
        elf[0x58..0x60].copy_from_slice(&0x40_0000u64.to_le_bytes()); // paddr
        elf[0x60..0x68].copy_from_slice(&4u64.to_le_bytes()); // filesz
        elf[0x68..0x70].copy_from_slice(&16u64.to_le_bytes()); // memsz
        elf.extend_from_slice(b"CODE");

        let info = load_kernel(&ram, &elf, "", &[], &acpi).unwrap();
        assert_eq!(info.entry_rip, 0x40_0000);
        let mut buf = [0u8; 4];
        ram.read_at(0x40_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"CODE");
    }

    #[test]
    fn initramfs_is_two_mib_aligned() {
        let ram = test_ram();
        let acpi = test_acpi(&ram);
        let img = fake_bzimage(b"PAYLOAD", 0x100_0000);
        load_kernel(&ram, &img, "", b"ARCHIVE!", &acpi).unwrap();
        let ramdisk = ram.read_u32(layout::ZERO_PAGE_ADDR + 0x218).unwrap() as u64;
        assert_eq!(ramdisk % 0x20_0000, 0);
        let mut buf = [0u8; 8];
        ram.read_at(ramdisk, &mut buf).unwrap();
        assert_eq!(&buf, b"ARCHIVE!");
    }

    #[test]
    fn page_tables_identity_map_first_gib() {
        let ram = test_ram();
        setup_page_tables(&ram).unwrap();
        assert_eq!(
            ram.read_u64(layout::PAGE_TABLE_ADDR).unwrap(),
            (layout::PAGE_TABLE_ADDR + 0x1000) | 3
        );
        // PDE 3 maps 6 MiB.
        assert_eq!(
            ram.read_u64(layout::PAGE_TABLE_ADDR + 0x2000 + 3 * 8).unwrap(),
            3 * 0x20_0000 | 0x83
        );
    }
}
