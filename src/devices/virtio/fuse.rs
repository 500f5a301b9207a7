//! FUSE wire format
//!
//! The subset of the FUSE protocol the virtiofs driver in a Linux guest
//! speaks: request/response headers, opcode numbers, and the fixed-layout
//! bodies, parsed and emitted with explicit little-endian accessors.

/// Protocol version we implement.
pub const FUSE_KERNEL_VERSION: u32 = 7;
pub const FUSE_KERNEL_MINOR_VERSION: u32 = 31;

/// Request header length.
pub const IN_HEADER_LEN: usize = 40;
/// Response header length.
pub const OUT_HEADER_LEN: usize = 16;

/// Opcodes.
pub mod op {
    pub const LOOKUP: u32 = 1;
    pub const FORGET: u32 = 2;
    pub const GETATTR: u32 = 3;
    pub const SETATTR: u32 = 4;
    pub const READLINK: u32 = 5;
    pub const SYMLINK: u32 = 6;
    pub const MKNOD: u32 = 8;
    pub const MKDIR: u32 = 9;
    pub const UNLINK: u32 = 10;
    pub const RMDIR: u32 = 11;
    pub const RENAME: u32 = 12;
    pub const LINK: u32 = 13;
    pub const OPEN: u32 = 14;
    pub const READ: u32 = 15;
    pub const WRITE: u32 = 16;
    pub const STATFS: u32 = 17;
    pub const RELEASE: u32 = 18;
    pub const FSYNC: u32 = 20;
    pub const SETXATTR: u32 = 21;
    pub const GETXATTR: u32 = 22;
    pub const LISTXATTR: u32 = 23;
    pub const REMOVEXATTR: u32 = 24;
    pub const FLUSH: u32 = 25;
    pub const INIT: u32 = 26;
    pub const OPENDIR: u32 = 27;
    pub const READDIR: u32 = 28;
    pub const RELEASEDIR: u32 = 29;
    pub const FSYNCDIR: u32 = 30;
    pub const ACCESS: u32 = 34;
    pub const CREATE: u32 = 35;
    pub const INTERRUPT: u32 = 36;
    pub const DESTROY: u32 = 38;
    pub const BATCH_FORGET: u32 = 42;
    pub const READDIRPLUS: u32 = 44;
    pub const RENAME2: u32 = 45;
}

/// SETATTR valid-field bits.
pub mod setattr_valid {
    pub const MODE: u32 = 1 << 0;
    pub const UID: u32 = 1 << 1;
    pub const GID: u32 = 1 << 2;
    pub const SIZE: u32 = 1 << 3;
    pub const ATIME: u32 = 1 << 4;
    pub const MTIME: u32 = 1 << 5;
}

/// Little-endian reader over a request body.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn u16(&mut self) -> Option<u16> {
        let b = self.bytes(2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Option<u32> {
        let b = self.bytes(4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Option<u64> {
        let b = self.bytes(8)?;
        let mut v = [0u8; 8];
        v.copy_from_slice(b);
        Some(u64::from_le_bytes(v))
    }

    pub fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }

    /// A NUL-terminated string.
    pub fn cstr(&mut self) -> Option<&'a str> {
        let rest = &self.buf[self.pos..];
        let nul = rest.iter().position(|&b| b == 0)?;
        let s = std::str::from_utf8(&rest[..nul]).ok()?;
        self.pos += nul + 1;
        Some(s)
    }

    /// Everything left, unconsumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }
}

/// Little-endian response builder.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    pub fn pad_to(&mut self, align: usize) -> &mut Self {
        while self.buf.len() % align != 0 {
            self.buf.push(0);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Parsed request header.
#[derive(Debug, Clone, Copy)]
pub struct InHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl InHeader {
    pub fn parse(r: &mut Reader<'_>) -> Option<Self> {
        let len = r.u32()?;
        let opcode = r.u32()?;
        let unique = r.u64()?;
        let nodeid = r.u64()?;
        let uid = r.u32()?;
        let gid = r.u32()?;
        let pid = r.u32()?;
        let _padding = r.u32()?;
        Some(Self {
            len,
            opcode,
            unique,
            nodeid,
            uid,
            gid,
            pid,
        })
    }
}

/// Build a complete response: header (len filled in) plus body.
pub fn response(unique: u64, error: i32, body: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.u32((OUT_HEADER_LEN + body.len()) as u32)
        .i32(error)
        .u64(unique)
        .bytes(body);
    w.into_bytes()
}

/// Emit a `fuse_attr` (88 bytes).
pub fn write_attr(w: &mut Writer, attr: &crate::fs::Attr) {
    w.u64(attr.ino)
        .u64(attr.size)
        .u64(attr.blocks)
        .u64(attr.atime)
        .u64(attr.mtime)
        .u64(attr.ctime)
        .u32(0) // atimensec
        .u32(0) // mtimensec
        .u32(0) // ctimensec
        .u32(attr.mode)
        .u32(attr.nlink)
        .u32(attr.uid)
        .u32(attr.gid)
        .u32(attr.rdev)
        .u32(attr.blksize)
        .u32(0); // flags
}

/// Emit a `fuse_attr_out` body: zero validity, then the attr.
pub fn attr_out(attr: &crate::fs::Attr) -> Vec<u8> {
    let mut w = Writer::new();
    w.u64(0) // attr_valid: no client-side caching
        .u32(0) // attr_valid_nsec
        .u32(0); // dummy
    write_attr(&mut w, attr);
    w.into_bytes()
}

/// Emit a `fuse_entry_out` body (128 bytes).
pub fn entry_out(nodeid: u64, attr: &crate::fs::Attr) -> Vec<u8> {
    let mut w = Writer::new();
    w.u64(nodeid)
        .u64(0) // generation
        .u64(0) // entry_valid
        .u64(0) // attr_valid
        .u32(0) // entry_valid_nsec
        .u32(0); // attr_valid_nsec
    write_attr(&mut w, attr);
    w.into_bytes()
}

/// Append one `fuse_dirent`, 8-byte aligned. Returns false if it would not
/// fit within `max`.
pub fn push_dirent(w: &mut Writer, max: usize, ino: u64, off: u64, kind: u32, name: &str) -> bool {
    let entry_len = 24 + name.len();
    let padded = (entry_len + 7) & !7;
    if w.len() + padded > max {
        return false;
    }
    w.u64(ino)
        .u64(off)
        .u32(name.len() as u32)
        .u32(kind)
        .bytes(name.as_bytes())
        .pad_to(8);
    true
}

/// Append one `fuse_direntplus` (entry_out + dirent). Returns false if it
/// would not fit within `max`.
pub fn push_direntplus(
    w: &mut Writer,
    max: usize,
    nodeid: u64,
    attr: &crate::fs::Attr,
    off: u64,
    kind: u32,
    name: &str,
) -> bool {
    let entry_len = 128 + 24 + name.len();
    let padded = (entry_len + 7) & !7;
    if w.len() + padded > max {
        return false;
    }
    w.bytes(&entry_out(nodeid, attr));
    w.u64(attr.ino)
        .u64(off)
        .u32(name.len() as u32)
        .u32(kind)
        .bytes(name.as_bytes())
        .pad_to(8);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut w = Writer::new();
        w.u32(64).u32(op::LOOKUP).u64(7).u64(1).u32(0).u32(0).u32(42).u32(0);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), IN_HEADER_LEN);
        let mut r = Reader::new(&bytes);
        let h = InHeader::parse(&mut r).unwrap();
        assert_eq!(h.opcode, op::LOOKUP);
        assert_eq!(h.unique, 7);
        assert_eq!(h.nodeid, 1);
        assert_eq!(h.pid, 42);
    }

    #[test]
    fn response_length_covers_header_and_body() {
        let resp = response(9, 0, &[1, 2, 3]);
        assert_eq!(resp.len(), OUT_HEADER_LEN + 3);
        assert_eq!(u32::from_le_bytes(resp[0..4].try_into().unwrap()), 19);
        assert_eq!(i32::from_le_bytes(resp[4..8].try_into().unwrap()), 0);
        assert_eq!(u64::from_le_bytes(resp[8..16].try_into().unwrap()), 9);
    }

    #[test]
    fn error_response_carries_negative_errno() {
        let resp = response(3, -libc::ENOENT, &[]);
        assert_eq!(
            i32::from_le_bytes(resp[4..8].try_into().unwrap()),
            -libc::ENOENT
        );
    }

    #[test]
    fn attr_layout_is_88_bytes() {
        let mut w = Writer::new();
        write_attr(&mut w, &crate::fs::Attr::default());
        assert_eq!(w.len(), 88);
        assert_eq!(attr_out(&crate::fs::Attr::default()).len(), 104);
        assert_eq!(entry_out(1, &crate::fs::Attr::default()).len(), 128);
    }

    #[test]
    fn cstr_parsing() {
        let mut r = Reader::new(b"hello\0world\0");
        assert_eq!(r.cstr(), Some("hello"));
        assert_eq!(r.cstr(), Some("world"));
        assert_eq!(r.cstr(), None);
    }

    #[test]
    fn dirent_padding() {
        let mut w = Writer::new();
        assert!(push_dirent(&mut w, 4096, 5, 1, 4, "abc"));
        assert_eq!(w.len(), 32); // 24 + 3, padded to 8
        assert!(!push_dirent(&mut w, 40, 6, 2, 4, "toolongname"));
    }
}
