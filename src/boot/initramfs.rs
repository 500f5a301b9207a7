//! Initramfs construction (newc CPIO)
//!
//! Packs the synthesized `/init` ELF (and optional device nodes) into the
//! archive format the kernel unpacks before invoking `/init`.

use crate::{Error, Result};

const MAGIC: &[u8; 6] = b"070701";
const TRAILER: &str = "TRAILER!!!";

/// One archive entry.
#[derive(Debug, Clone)]
pub enum Entry {
    File {
        path: String,
        mode: u32,
        data: Vec<u8>,
    },
    Dir {
        path: String,
        mode: u32,
    },
    CharDev {
        path: String,
        mode: u32,
        major: u32,
        minor: u32,
    },
}

/// Builder for a newc archive.
#[derive(Default)]
pub struct InitramfsBuilder {
    entries: Vec<Entry>,
}

impl InitramfsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, path: &str, mode: u32, data: Vec<u8>) -> Self {
        self.entries.push(Entry::File {
            path: path.to_string(),
            mode,
            data,
        });
        self
    }

    pub fn dir(mut self, path: &str, mode: u32) -> Self {
        self.entries.push(Entry::Dir {
            path: path.to_string(),
            mode,
        });
        self
    }

    pub fn char_dev(mut self, path: &str, mode: u32, major: u32, minor: u32) -> Self {
        self.entries.push(Entry::CharDev {
            path: path.to_string(),
            mode,
            major,
            minor,
        });
        self
    }

    pub fn build(self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for (i, entry) in self.entries.iter().enumerate() {
            let ino = i as u32 + 1;
            match entry {
                Entry::File { path, mode, data } => {
                    write_entry(&mut out, ino, libc::S_IFREG as u32 | mode, path, data, 0, 0)?;
                }
                Entry::Dir { path, mode } => {
                    write_entry(&mut out, ino, libc::S_IFDIR as u32 | mode, path, &[], 0, 0)?;
                }
                Entry::CharDev {
                    path,
                    mode,
                    major,
                    minor,
                } => {
                    write_entry(
                        &mut out,
                        ino,
                        libc::S_IFCHR as u32 | mode,
                        path,
                        &[],
                        *major,
                        *minor,
                    )?;
                }
            }
        }
        write_entry(&mut out, 0, 0, TRAILER, &[], 0, 0)?;
        Ok(out)
    }
}

fn hex8(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(format!("{v:08X}").as_bytes());
}

fn pad4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

fn write_entry(
    out: &mut Vec<u8>,
    ino: u32,
    mode: u32,
    path: &str,
    data: &[u8],
    rdev_major: u32,
    rdev_minor: u32,
) -> Result<()> {
    // The kernel's parser takes names without a leading slash.
    let name = path.trim_start_matches('/');
    if name.is_empty() {
        return Err(Error::Config("empty initramfs entry name".into()));
    }
    if data.len() > u32::MAX as usize {
        return Err(Error::Config(format!("initramfs entry {path:?} too large")));
    }

    out.extend_from_slice(MAGIC);
    hex8(out, ino); // c_ino
    hex8(out, mode); // c_mode
    hex8(out, 0); // c_uid
    hex8(out, 0); // c_gid
    hex8(out, 1); // c_nlink
    hex8(out, 0); // c_mtime
    hex8(out, data.len() as u32); // c_filesize
    hex8(out, 0); // c_devmajor
    hex8(out, 0); // c_devminor
    hex8(out, rdev_major); // c_rdevmajor
    hex8(out, rdev_minor); // c_rdevminor
    hex8(out, name.len() as u32 + 1); // c_namesize (incl. NUL)
    hex8(out, 0); // c_check
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    pad4(out);
    out.extend_from_slice(data);
    pad4(out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal newc parser for round-trip checks.
    fn parse(archive: &[u8]) -> Vec<(String, u32, Vec<u8>)> {
        let mut entries = Vec::new();
        let mut pos = 0;
        loop {
            assert_eq!(&archive[pos..pos + 6], MAGIC, "bad magic at {pos}");
            let field = |i: usize| -> u32 {
                let s = std::str::from_utf8(&archive[pos + 6 + i * 8..pos + 14 + i * 8]).unwrap();
                u32::from_str_radix(s, 16).unwrap()
            };
            let mode = field(1);
            let filesize = field(6) as usize;
            let namesize = field(11) as usize;
            let name_start = pos + 110;
            let name =
                std::str::from_utf8(&archive[name_start..name_start + namesize - 1]).unwrap();
            let mut data_start = name_start + namesize;
            data_start = (data_start + 3) & !3;
            if name == TRAILER {
                return entries;
            }
            let data = archive[data_start..data_start + filesize].to_vec();
            entries.push((name.to_string(), mode, data));
            pos = (data_start + filesize + 3) & !3;
        }
    }

    #[test]
    fn round_trip_preserves_contents_and_modes() {
        let archive = InitramfsBuilder::new()
            .file("/init", 0o755, b"\x7fELF-code".to_vec())
            .dir("/dev", 0o755)
            .file("/etc/motd", 0o644, b"hi".to_vec())
            .build()
            .unwrap();

        let entries = parse(&archive);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0, "init");
        assert_eq!(entries[0].1, libc::S_IFREG as u32 | 0o755);
        assert_eq!(entries[0].2, b"\x7fELF-code");
        assert_eq!(entries[1].0, "dev");
        assert_eq!(entries[1].1 & libc::S_IFMT as u32, libc::S_IFDIR as u32);
        assert_eq!(entries[2].2, b"hi");
    }

    #[test]
    fn char_device_carries_rdev() {
        let archive = InitramfsBuilder::new()
            .char_dev("/mem", 0o600, 1, 1)
            .build()
            .unwrap();
        // rdevmajor is field 9, rdevminor field 10.
        let field = |i: usize| {
            let s = std::str::from_utf8(&archive[6 + i * 8..14 + i * 8]).unwrap();
            u32::from_str_radix(s, 16).unwrap()
        };
        assert_eq!(field(1) & libc::S_IFMT as u32, libc::S_IFCHR as u32);
        assert_eq!(field(9), 1);
        assert_eq!(field(10), 1);
    }

    #[test]
    fn archive_ends_with_trailer() {
        let archive = InitramfsBuilder::new()
            .file("/init", 0o755, vec![1, 2, 3])
            .build()
            .unwrap();
        let text = String::from_utf8_lossy(&archive);
        assert!(text.contains(TRAILER));
        assert_eq!(archive.len() % 4, 0);
    }

    #[test]
    fn alignment_of_name_and_data() {
        let archive = InitramfsBuilder::new()
            .file("/a", 0o644, b"xyz".to_vec())
            .file("/bb", 0o644, b"q".to_vec())
            .build()
            .unwrap();
        // If padding is wrong the parser derails; a clean parse is the check.
        let entries = parse(&archive);
        assert_eq!(entries[0].2, b"xyz");
        assert_eq!(entries[1].2, b"q");
    }
}
