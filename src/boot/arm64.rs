//! ARM64 Linux boot: Image probing and placement
//!
//! Accepts a raw `Image` (magic at 0x38) or a gzip stream preceded by up to
//! a 1 MiB decompression stub. The kernel lands at the 2 MiB-aligned base
//! plus its requested text offset; initramfs and FDT follow page-aligned.

use std::io::Read;

use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::memory::GuestRam;
use crate::{Error, Result};

/// "ARM\x64"
const IMAGE_MAGIC: u32 = 0x644d_5241;
/// Offset of the magic in the Image header.
const MAGIC_OFFSET: usize = 0x38;
/// How far into the file the gzip marker may sit.
const MAX_STUB: usize = 1 << 20;

/// Register state for entering the kernel.
#[derive(Debug, Clone, Copy)]
pub struct Arm64BootInfo {
    pub entry_pc: u64,
    pub fdt_addr: u64,
    pub initramfs_start: u64,
    pub initramfs_end: u64,
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn is_image(data: &[u8]) -> bool {
    data.len() > MAGIC_OFFSET + 4
        && u32::from_le_bytes(data[MAGIC_OFFSET..MAGIC_OFFSET + 4].try_into().unwrap())
            == IMAGE_MAGIC
}

/// Return the decompressed Image, inflating a gzip payload if present.
pub fn decompress_kernel(data: &[u8]) -> Result<Vec<u8>> {
    if is_image(data) {
        return Ok(data.to_vec());
    }
    // Look for the gzip magic within the stub window.
    let window = &data[..data.len().min(MAX_STUB)];
    let start = window
        .windows(2)
        .position(|w| w == [0x1f, 0x8b])
        .ok_or_else(|| Error::Config("kernel is neither an ARM64 Image nor gzip".into()))?;
    debug!(stub = start, "found gzip stream behind decompression stub");
    let mut inflated = Vec::new();
    GzDecoder::new(&data[start..])
        .read_to_end(&mut inflated)
        .map_err(|e| Error::Config(format!("gzip inflate failed: {e}")))?;
    if !is_image(&inflated) {
        return Err(Error::Config("inflated payload is not an ARM64 Image".into()));
    }
    Ok(inflated)
}

/// Load the kernel and initramfs; the FDT slot is reserved after them.
pub fn load_kernel(ram: &GuestRam, kernel: &[u8], initramfs: &[u8]) -> Result<Arm64BootInfo> {
    let image = decompress_kernel(kernel)?;
    let text_offset = read_u64(&image, 8);
    let image_size = read_u64(&image, 16).max(image.len() as u64);

    let base = (ram.base() + 0x1f_ffff) & !0x1f_ffff;
    let load_addr = base + text_offset;
    if load_addr + image_size > ram.end() {
        return Err(Error::Config(format!(
            "kernel of {image_size:#x} bytes does not fit at {load_addr:#x}"
        )));
    }
    ram.write_at(load_addr, &image)?;
    info!(
        load_addr = format_args!("{load_addr:#x}"),
        len = image.len(),
        "loaded ARM64 Image"
    );

    let initramfs_start = (load_addr + image_size + 0xfff) & !0xfff;
    if initramfs_start + initramfs.len() as u64 > ram.end() {
        return Err(Error::Config("initramfs does not fit in guest RAM".into()));
    }
    ram.write_at(initramfs_start, initramfs)?;
    let initramfs_end = initramfs_start + initramfs.len() as u64;

    let fdt_addr = (initramfs_end + 0xffff) & !0xffff;

    Ok(Arm64BootInfo {
        entry_pc: load_addr,
        fdt_addr,
        initramfs_start,
        initramfs_end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn fake_image(text_offset: u64, payload: &[u8]) -> Vec<u8> {
        let mut img = vec![0u8; 64];
        img[8..16].copy_from_slice(&text_offset.to_le_bytes());
        img[16..24].copy_from_slice(&(64 + payload.len() as u64).to_le_bytes());
        img[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&IMAGE_MAGIC.to_le_bytes());
        img.extend_from_slice(payload);
        img
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn raw_image_passes_through() {
        let img = fake_image(0x8_0000, b"kernel");
        assert_eq!(decompress_kernel(&img).unwrap(), img);
    }

    #[test]
    fn gzip_with_stub_offsets() {
        let img = fake_image(0, b"payload");
        let gz = gzip(&img);
        for stub in [0usize, 1, 95, 96] {
            let mut data = vec![0u8; stub];
            data.extend_from_slice(&gz);
            assert_eq!(
                decompress_kernel(&data).unwrap(),
                img,
                "stub of {stub} bytes"
            );
        }
    }

    #[test]
    fn oversized_stub_fails() {
        let img = fake_image(0, b"payload");
        let gz = gzip(&img);
        let mut data = vec![0u8; MAX_STUB + 16];
        data.extend_from_slice(&gz);
        assert!(decompress_kernel(&data).is_err());
    }

    #[test]
    fn junk_is_rejected() {
        assert!(decompress_kernel(&vec![0u8; 4096]).is_err());
        // gzip of something that is not an Image
        let gz = gzip(b"not a kernel at all");
        assert!(decompress_kernel(&gz).is_err());
    }

    #[test]
    fn placement_respects_text_offset_and_alignment() {
        let ram = GuestRam::new(0, 32 * 1024 * 1024).unwrap();
        let img = fake_image(0x8_0000, b"CODE");
        let info = load_kernel(&ram, &img, b"INITRAMFS").unwrap();
        assert_eq!(info.entry_pc, 0x8_0000);
        let mut magic = [0u8; 4];
        ram.read_at(info.entry_pc + MAGIC_OFFSET as u64, &mut magic)
            .unwrap();
        assert_eq!(u32::from_le_bytes(magic), IMAGE_MAGIC);

        assert_eq!(info.initramfs_start % 0x1000, 0);
        let mut buf = [0u8; 9];
        ram.read_at(info.initramfs_start, &mut buf).unwrap();
        assert_eq!(&buf, b"INITRAMFS");
        assert_eq!(info.fdt_addr % 0x1_0000, 0);
        assert!(info.fdt_addr >= info.initramfs_end);
    }

    #[test]
    fn nonzero_ram_base_is_honored() {
        let ram = GuestRam::new(0x8000_0000, 16 * 1024 * 1024).unwrap();
        let img = fake_image(0, b"X");
        let info = load_kernel(&ram, &img, &[]).unwrap();
        assert_eq!(info.entry_pc, 0x8000_0000);
    }
}
