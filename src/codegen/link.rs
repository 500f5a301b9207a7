//! Token linking and relocation
//!
//! Lowered methods carry 64-bit prefix tokens wherever they reference a
//! method or global address. Linking concatenates the methods (entrypoint
//! first, 16-byte padded), lays BSS out after text, rewrites every token to
//! its concrete address, and fails if any token survives.

use std::collections::HashMap;

use super::{Global, GLOBAL_TOKEN_PREFIX, METHOD_TOKEN_PREFIX};
use crate::{Error, Result};

/// Text segment virtual address (file-page aligned).
pub const TEXT_VADDR: u64 = 0x40_1000;

/// Output of one method lowering: machine code plus the offsets of every
/// 8-byte token word that needs patching.
#[derive(Debug, Default)]
pub struct MethodCode {
    pub code: Vec<u8>,
    pub reloc_sites: Vec<usize>,
}

/// A fully linked program image.
#[derive(Debug)]
pub struct Image {
    pub text: Vec<u8>,
    pub text_vaddr: u64,
    pub bss_vaddr: u64,
    pub bss_size: u64,
    pub entry: u64,
}

pub fn link(methods: &[(String, MethodCode)], globals: &[(String, Global)]) -> Result<Image> {
    if methods.is_empty() {
        return Err(Error::Config("program has no methods".into()));
    }

    // Concatenate methods, each padded to a 16-byte boundary.
    let mut text = Vec::new();
    let mut method_offsets = HashMap::new();
    let mut sites = Vec::new();
    for (name, mc) in methods {
        if method_offsets.insert(name.clone(), text.len() as u64).is_some() {
            return Err(Error::Config(format!("duplicate method {name:?}")));
        }
        sites.extend(mc.reloc_sites.iter().map(|&s| text.len() + s));
        text.extend_from_slice(&mc.code);
        while text.len() % 16 != 0 {
            text.push(0);
        }
    }

    // BSS after text, page aligned; each global at its requested alignment.
    let bss_vaddr = (TEXT_VADDR + text.len() as u64 + 0xfff) & !0xfff;
    let mut bss_size = 0u64;
    let mut global_offsets = HashMap::new();
    for (name, g) in globals {
        let align = g.align.max(1);
        bss_size = (bss_size + align - 1) & !(align - 1);
        if global_offsets.insert(name.clone(), bss_size).is_some() {
            return Err(Error::Config(format!("duplicate global {name:?}")));
        }
        bss_size += g.size;
    }

    // Patch recorded token sites.
    for &site in &sites {
        let word = u64::from_le_bytes(text[site..site + 8].try_into().unwrap());
        let prefix = (word >> 48) as u16;
        let hash = word & 0x0000_ffff_ffff_ffff;
        let resolved = match prefix {
            METHOD_TOKEN_PREFIX => method_offsets
                .iter()
                .find(|(name, _)| super::fnv48(name) == hash)
                .map(|(_, &off)| TEXT_VADDR + off)
                .ok_or_else(|| Error::Config(format!("unresolved method token {word:#x}")))?,
            GLOBAL_TOKEN_PREFIX => global_offsets
                .iter()
                .find(|(name, _)| super::fnv48(name) == hash)
                .map(|(_, &off)| bss_vaddr + off)
                .ok_or_else(|| Error::Config(format!("unresolved global token {word:#x}")))?,
            other => {
                return Err(Error::Config(format!(
                    "relocation site holds non-token word with prefix {other:#x}"
                )))
            }
        };
        text[site..site + 8].copy_from_slice(&resolved.to_le_bytes());
    }

    // Verification pass: no 8-byte window anywhere in the image may still
    // look like a token.
    for i in 0..text.len().saturating_sub(7) {
        let word = u64::from_le_bytes(text[i..i + 8].try_into().unwrap());
        let prefix = (word >> 48) as u16;
        if prefix == METHOD_TOKEN_PREFIX || prefix == GLOBAL_TOKEN_PREFIX {
            return Err(Error::Config(format!(
                "unpatched relocation token {word:#x} at text offset {i:#x}"
            )));
        }
    }

    Ok(Image {
        text,
        text_vaddr: TEXT_VADDR,
        bss_vaddr,
        bss_size,
        entry: TEXT_VADDR,
    })
}
