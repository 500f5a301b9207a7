//! Boot pipeline
//!
//! Architecture-specific loaders place kernel, initramfs, and platform
//! description tables (ACPI or FDT) into guest RAM and report the entry
//! register state; [`initramfs`] packs the synthesized `/init`.

pub mod acpi;
pub mod arm64;
pub mod fdt;
pub mod initramfs;
pub mod x86;

use crate::codegen::Target;
use crate::guest::InitConfig;
use crate::Result;

/// Build the initramfs for one guest: the compiled `/init` plus the device
/// nodes the early userspace needs before devtmpfs is up. `mem_node` packs
/// an extra `/mem` character device with the given major/minor.
pub fn build_initramfs(
    cfg: &InitConfig,
    target: Target,
    mem_node: Option<(u32, u32)>,
) -> Result<Vec<u8>> {
    let init_elf = crate::guest::build_init_elf(cfg, target)?;
    let mut builder = initramfs::InitramfsBuilder::new()
        .dir("/dev", 0o755)
        .file("/init", 0o755, init_elf)
        .char_dev("/dev/console", 0o600, 5, 1);
    if let Some((major, minor)) = mem_node {
        builder = builder.char_dev("/mem", 0o600, major, minor);
    }
    builder.build()
}
