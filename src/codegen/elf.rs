//! Minimal static ELF emission
//!
//! One `PT_LOAD` for text, one for BSS (zero file size). Position-dependent
//! `ET_EXEC`; the entry point is the first method.

use super::link::Image;
use super::Target;

const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

const EHDR_LEN: usize = 64;
const PHDR_LEN: usize = 56;
/// File offset of the text segment; congruent to the vaddr modulo the page.
const TEXT_FILE_OFFSET: u64 = 0x1000;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

struct Le(Vec<u8>);

impl Le {
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
}

/// Serialize the linked image as an executable ELF.
pub fn emit(target: Target, image: &Image) -> Vec<u8> {
    let machine = match target {
        Target::X86_64 => EM_X86_64,
        Target::Aarch64 => EM_AARCH64,
    };

    let mut out = Le(Vec::with_capacity(
        TEXT_FILE_OFFSET as usize + image.text.len(),
    ));

    // ELF header.
    out.0.extend_from_slice(&[
        0x7f, b'E', b'L', b'F', // magic
        2,    // ELFCLASS64
        1,    // little endian
        1,    // EV_CURRENT
        0,    // ELFOSABI_NONE
        0, 0, 0, 0, 0, 0, 0, 0, // padding
    ]);
    out.u16(2); // ET_EXEC
    out.u16(machine);
    out.u32(1); // EV_CURRENT
    out.u64(image.entry);
    out.u64(EHDR_LEN as u64); // e_phoff
    out.u64(0); // e_shoff
    out.u32(0); // e_flags
    out.u16(EHDR_LEN as u16);
    out.u16(PHDR_LEN as u16);
    out.u16(2); // e_phnum
    out.u16(0); // e_shentsize
    out.u16(0); // e_shnum
    out.u16(0); // e_shstrndx

    // Text program header.
    out.u32(PT_LOAD);
    out.u32(PF_R | PF_X);
    out.u64(TEXT_FILE_OFFSET);
    out.u64(image.text_vaddr);
    out.u64(image.text_vaddr); // paddr
    out.u64(image.text.len() as u64);
    out.u64(image.text.len() as u64);
    out.u64(0x1000); // align

    // BSS program header: nothing in the file, memory only.
    out.u32(PT_LOAD);
    out.u32(PF_R | PF_W);
    out.u64(0);
    out.u64(image.bss_vaddr);
    out.u64(image.bss_vaddr);
    out.u64(0); // filesz
    out.u64(image.bss_size);
    out.u64(0x1000);

    // Pad to the text file offset, then the code.
    out.0.resize(TEXT_FILE_OFFSET as usize, 0);
    out.0.extend_from_slice(&image.text);
    out.0
}
