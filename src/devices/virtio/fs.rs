//! virtio-fs device backend (FUSE over virtqueues)
//!
//! A FUSE server reachable over a hiprio queue and a request queue. All
//! filesystem semantics come from the [`FsBackend`] collaborator; this
//! module owns the protocol work and the node table.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use super::fuse::{self, op, InHeader, Reader, Writer};
use super::queue::DescChain;
use super::VirtioBackend;
use crate::fs::{FsBackend, SetAttr};
use crate::memory::GuestRam;
use crate::Result;

/// Virtio device type for a file system device.
pub const VIRTIO_ID_FS: u32 = 26;

/// The root nodeid, always live.
pub const ROOT_NODEID: u64 = 1;

const MAX_WRITE: u32 = 1 << 20;

/// INIT flag bits we are willing to negotiate.
mod init_flags {
    pub const ASYNC_READ: u32 = 1 << 0;
    pub const DO_READDIRPLUS: u32 = 1 << 13;
    pub const READDIRPLUS_AUTO: u32 = 1 << 14;
    pub const PARALLEL_DIROPS: u32 = 1 << 18;
    pub const MAX_PAGES: u32 = 1 << 22;

    pub const SUPPORTED: u32 =
        ASYNC_READ | DO_READDIRPLUS | READDIRPLUS_AUTO | PARALLEL_DIROPS | MAX_PAGES;
}

type OpResult = std::result::Result<Option<Vec<u8>>, i32>;

pub struct VirtioFs {
    tag: String,
    backend: Box<dyn FsBackend>,
    /// nodeid → lookup count. The root is implicit and never forgotten.
    nodes: HashMap<u64, u64>,
}

impl VirtioFs {
    pub fn new(tag: impl Into<String>, backend: Box<dyn FsBackend>) -> Self {
        Self {
            tag: tag.into(),
            backend,
            nodes: HashMap::new(),
        }
    }

    fn remember(&mut self, nodeid: u64) {
        if nodeid != ROOT_NODEID {
            *self.nodes.entry(nodeid).or_insert(0) += 1;
        }
    }

    fn forget(&mut self, nodeid: u64, nlookup: u64) {
        if nodeid == ROOT_NODEID {
            return;
        }
        match self.nodes.get_mut(&nodeid) {
            Some(count) if *count > nlookup => *count -= nlookup,
            Some(count) => {
                if *count < nlookup {
                    warn!(
                        nodeid,
                        count, nlookup, "forget exceeds lookup count, discarding node"
                    );
                }
                self.nodes.remove(&nodeid);
            }
            None => warn!(nodeid, "forget for unknown node"),
        }
    }

    /// A nodeid the guest may legally reference.
    fn check_node(&self, nodeid: u64) -> std::result::Result<u64, i32> {
        if nodeid == ROOT_NODEID || self.nodes.contains_key(&nodeid) {
            Ok(nodeid)
        } else {
            Err(libc::ESTALE)
        }
    }

    fn dispatch(&mut self, header: &InHeader, body: &mut Reader<'_>) -> OpResult {
        match header.opcode {
            op::INIT => self.do_init(body),
            op::DESTROY => {
                self.nodes.clear();
                Ok(Some(Vec::new()))
            }
            op::LOOKUP => self.do_lookup(header, body),
            op::FORGET => {
                let nlookup = body.u64().ok_or(libc::EINVAL)?;
                self.forget(header.nodeid, nlookup);
                Ok(None)
            }
            op::BATCH_FORGET => {
                let count = body.u32().ok_or(libc::EINVAL)?;
                let _dummy = body.u32();
                for _ in 0..count {
                    let (Some(nodeid), Some(nlookup)) = (body.u64(), body.u64()) else {
                        break;
                    };
                    self.forget(nodeid, nlookup);
                }
                Ok(None)
            }
            op::GETATTR => {
                let ino = self.check_node(header.nodeid)?;
                let attr = self.backend.getattr(ino)?;
                Ok(Some(fuse::attr_out(&attr)))
            }
            op::SETATTR => self.do_setattr(header, body),
            op::READLINK => {
                let ino = self.check_node(header.nodeid)?;
                Ok(Some(self.backend.readlink(ino)?))
            }
            op::SYMLINK => {
                let parent = self.check_node(header.nodeid)?;
                let name = body.cstr().ok_or(libc::EINVAL)?;
                let target = body.cstr().ok_or(libc::EINVAL)?;
                let attr = self.backend.symlink(parent, name, target)?;
                self.remember(attr.ino);
                Ok(Some(fuse::entry_out(attr.ino, &attr)))
            }
            op::MKNOD => {
                let parent = self.check_node(header.nodeid)?;
                let mode = body.u32().ok_or(libc::EINVAL)?;
                let rdev = body.u32().ok_or(libc::EINVAL)?;
                let _umask = body.u32();
                let _padding = body.u32();
                let name = body.cstr().ok_or(libc::EINVAL)?;
                let attr = self.backend.mknod(parent, name, mode, rdev)?;
                self.remember(attr.ino);
                Ok(Some(fuse::entry_out(attr.ino, &attr)))
            }
            op::MKDIR => {
                let parent = self.check_node(header.nodeid)?;
                let mode = body.u32().ok_or(libc::EINVAL)?;
                let _umask = body.u32();
                let name = body.cstr().ok_or(libc::EINVAL)?;
                let attr = self.backend.mkdir(parent, name, mode)?;
                self.remember(attr.ino);
                Ok(Some(fuse::entry_out(attr.ino, &attr)))
            }
            op::UNLINK => {
                let parent = self.check_node(header.nodeid)?;
                let name = body.cstr().ok_or(libc::EINVAL)?;
                self.backend.unlink(parent, name)?;
                Ok(Some(Vec::new()))
            }
            op::RMDIR => {
                let parent = self.check_node(header.nodeid)?;
                let name = body.cstr().ok_or(libc::EINVAL)?;
                self.backend.rmdir(parent, name)?;
                Ok(Some(Vec::new()))
            }
            op::RENAME | op::RENAME2 => {
                let parent = self.check_node(header.nodeid)?;
                let newdir = body.u64().ok_or(libc::EINVAL)?;
                if header.opcode == op::RENAME2 {
                    let _flags = body.u32();
                    let _padding = body.u32();
                }
                let newdir = self.check_node(newdir)?;
                let name = body.cstr().ok_or(libc::EINVAL)?;
                let newname = body.cstr().ok_or(libc::EINVAL)?;
                self.backend.rename(parent, name, newdir, newname)?;
                Ok(Some(Vec::new()))
            }
            op::LINK => {
                let oldnodeid = body.u64().ok_or(libc::EINVAL)?;
                let oldnodeid = self.check_node(oldnodeid)?;
                let newparent = self.check_node(header.nodeid)?;
                let newname = body.cstr().ok_or(libc::EINVAL)?;
                let attr = self.backend.link(oldnodeid, newparent, newname)?;
                self.remember(attr.ino);
                Ok(Some(fuse::entry_out(attr.ino, &attr)))
            }
            op::OPEN | op::OPENDIR => {
                let ino = self.check_node(header.nodeid)?;
                let flags = body.u32().ok_or(libc::EINVAL)?;
                let fh = self.backend.open(ino, flags)?;
                let mut w = Writer::new();
                w.u64(fh).u32(0).u32(0);
                Ok(Some(w.into_bytes()))
            }
            op::READ => {
                let ino = self.check_node(header.nodeid)?;
                let fh = body.u64().ok_or(libc::EINVAL)?;
                let offset = body.u64().ok_or(libc::EINVAL)?;
                let size = body.u32().ok_or(libc::EINVAL)?;
                Ok(Some(self.backend.read(ino, fh, offset, size)?))
            }
            op::WRITE => {
                let ino = self.check_node(header.nodeid)?;
                let fh = body.u64().ok_or(libc::EINVAL)?;
                let offset = body.u64().ok_or(libc::EINVAL)?;
                let size = body.u32().ok_or(libc::EINVAL)?;
                let _write_flags = body.u32();
                let _lock_owner = body.u64();
                let _flags = body.u32();
                let _padding = body.u32();
                let data = body.rest();
                if data.len() < size as usize {
                    return Err(libc::EINVAL);
                }
                let written = self.backend.write(ino, fh, offset, &data[..size as usize])?;
                let mut w = Writer::new();
                w.u32(written).u32(0);
                Ok(Some(w.into_bytes()))
            }
            op::STATFS => {
                let ino = self.check_node(header.nodeid)?;
                let st = self.backend.statfs(ino)?;
                let mut w = Writer::new();
                w.u64(st.blocks)
                    .u64(st.bfree)
                    .u64(st.bavail)
                    .u64(st.files)
                    .u64(st.ffree)
                    .u32(st.bsize)
                    .u32(st.namelen)
                    .u32(st.bsize) // frsize
                    .u32(0);
                for _ in 0..6 {
                    w.u32(0);
                }
                Ok(Some(w.into_bytes()))
            }
            op::RELEASE | op::RELEASEDIR => {
                let ino = self.check_node(header.nodeid)?;
                let fh = body.u64().ok_or(libc::EINVAL)?;
                self.backend.release(ino, fh)?;
                Ok(Some(Vec::new()))
            }
            op::FSYNC | op::FSYNCDIR => {
                let ino = self.check_node(header.nodeid)?;
                let fh = body.u64().ok_or(libc::EINVAL)?;
                self.backend.fsync(ino, fh)?;
                Ok(Some(Vec::new()))
            }
            op::FLUSH => Ok(Some(Vec::new())),
            op::READDIR => self.do_readdir(header, body, false),
            op::READDIRPLUS => self.do_readdir(header, body, true),
            op::ACCESS => {
                let ino = self.check_node(header.nodeid)?;
                let mask = body.u32().ok_or(libc::EINVAL)?;
                self.backend.access(ino, mask)?;
                Ok(Some(Vec::new()))
            }
            op::CREATE => self.do_create(header, body),
            op::INTERRUPT => Ok(None),
            op::GETXATTR | op::LISTXATTR | op::SETXATTR | op::REMOVEXATTR => Err(libc::ENOSYS),
            other => {
                trace!(opcode = other, "unknown FUSE opcode");
                Err(libc::ENOSYS)
            }
        }
    }

    fn do_init(&mut self, body: &mut Reader<'_>) -> OpResult {
        let major = body.u32().ok_or(libc::EINVAL)?;
        let minor = body.u32().ok_or(libc::EINVAL)?;
        let max_readahead = body.u32().unwrap_or(0);
        let flags = body.u32().unwrap_or(0);
        debug!(major, minor, "FUSE INIT");
        if major != fuse::FUSE_KERNEL_VERSION {
            // Version mismatch: reply with ours, the client re-INITs.
            let mut w = Writer::new();
            w.u32(fuse::FUSE_KERNEL_VERSION).u32(fuse::FUSE_KERNEL_MINOR_VERSION);
            return Ok(Some(w.into_bytes()));
        }
        let mut w = Writer::new();
        w.u32(fuse::FUSE_KERNEL_VERSION)
            .u32(minor.min(fuse::FUSE_KERNEL_MINOR_VERSION))
            .u32(max_readahead)
            .u32(flags & init_flags::SUPPORTED)
            .u16(64) // max_background
            .u16(48) // congestion_threshold
            .u32(MAX_WRITE)
            .u32(1) // time_gran
            .u16((MAX_WRITE / 4096) as u16) // max_pages
            .u16(0); // map_alignment
        for _ in 0..8 {
            w.u32(0);
        }
        Ok(Some(w.into_bytes()))
    }

    fn do_lookup(&mut self, header: &InHeader, body: &mut Reader<'_>) -> OpResult {
        let parent = self.check_node(header.nodeid)?;
        let name = body.cstr().ok_or(libc::EINVAL)?;
        let attr = self.backend.lookup(parent, name)?;
        self.remember(attr.ino);
        Ok(Some(fuse::entry_out(attr.ino, &attr)))
    }

    fn do_setattr(&mut self, header: &InHeader, body: &mut Reader<'_>) -> OpResult {
        let ino = self.check_node(header.nodeid)?;
        let valid = body.u32().ok_or(libc::EINVAL)?;
        let _padding = body.u32();
        let _fh = body.u64();
        let size = body.u64().ok_or(libc::EINVAL)?;
        let _lock_owner = body.u64();
        let atime = body.u64().unwrap_or(0);
        let mtime = body.u64().unwrap_or(0);
        let _ctime = body.u64();
        let _atimensec = body.u32();
        let _mtimensec = body.u32();
        let _ctimensec = body.u32();
        let mode = body.u32().unwrap_or(0);
        let _unused = body.u32();
        let uid = body.u32().unwrap_or(0);
        let gid = body.u32().unwrap_or(0);

        use fuse::setattr_valid as v;
        let changes = SetAttr {
            size: (valid & v::SIZE != 0).then_some(size),
            mode: (valid & v::MODE != 0).then_some(mode),
            uid: (valid & v::UID != 0).then_some(uid),
            gid: (valid & v::GID != 0).then_some(gid),
            atime: (valid & v::ATIME != 0).then_some(atime),
            mtime: (valid & v::MTIME != 0).then_some(mtime),
        };
        let attr = self.backend.setattr(ino, changes)?;
        Ok(Some(fuse::attr_out(&attr)))
    }

    fn do_create(&mut self, header: &InHeader, body: &mut Reader<'_>) -> OpResult {
        let parent = self.check_node(header.nodeid)?;
        let flags = body.u32().ok_or(libc::EINVAL)?;
        let mode = body.u32().ok_or(libc::EINVAL)?;
        let _umask = body.u32();
        let _padding = body.u32();
        let name = body.cstr().ok_or(libc::EINVAL)?;
        let attr = self
            .backend
            .mknod(parent, name, libc::S_IFREG as u32 | (mode & 0o7777), 0)?;
        self.remember(attr.ino);
        let fh = self.backend.open(attr.ino, flags)?;
        let mut out = fuse::entry_out(attr.ino, &attr);
        let mut w = Writer::new();
        w.u64(fh).u32(0).u32(0);
        out.extend_from_slice(&w.into_bytes());
        Ok(Some(out))
    }

    fn do_readdir(&mut self, header: &InHeader, body: &mut Reader<'_>, plus: bool) -> OpResult {
        let ino = self.check_node(header.nodeid)?;
        let _fh = body.u64().ok_or(libc::EINVAL)?;
        let offset = body.u64().ok_or(libc::EINVAL)?;
        let size = body.u32().ok_or(libc::EINVAL)? as usize;

        let entries = self.backend.readdir(ino, offset)?;
        let mut w = Writer::new();
        let mut next_off = offset;
        for entry in entries {
            next_off += 1;
            let fits = if plus {
                let (nodeid, attr) = if entry.name == "." || entry.name == ".." {
                    // Dot entries never contribute lookups; nodeid 0 tells
                    // the client not to cache them.
                    (0, crate::fs::Attr {
                        ino: entry.ino,
                        ..Default::default()
                    })
                } else {
                    match self.backend.getattr(entry.ino) {
                        Ok(attr) => (entry.ino, attr),
                        Err(_) => (0, crate::fs::Attr {
                            ino: entry.ino,
                            ..Default::default()
                        }),
                    }
                };
                let pushed = fuse::push_direntplus(
                    &mut w, size, nodeid, &attr, next_off, entry.kind, &entry.name,
                );
                if pushed && nodeid != 0 {
                    self.remember(nodeid);
                }
                pushed
            } else {
                fuse::push_dirent(&mut w, size, entry.ino, next_off, entry.kind, &entry.name)
            };
            if !fits {
                break;
            }
        }
        Ok(Some(w.into_bytes()))
    }

    /// Service one request buffer, producing the bytes to send back.
    fn serve(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let mut r = Reader::new(request);
        let header = InHeader::parse(&mut r)?;
        trace!(
            opcode = header.opcode,
            unique = header.unique,
            nodeid = header.nodeid,
            "FUSE request"
        );
        match self.dispatch(&header, &mut r) {
            Ok(Some(body)) => Some(fuse::response(header.unique, 0, &body)),
            Ok(None) => None,
            Err(errno) => Some(fuse::response(header.unique, -errno, &[])),
        }
    }

    #[cfg(test)]
    pub(crate) fn lookup_count(&self, nodeid: u64) -> u64 {
        self.nodes.get(&nodeid).copied().unwrap_or(0)
    }
}

impl VirtioBackend for VirtioFs {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_FS
    }

    fn config_space(&self) -> Vec<u8> {
        // struct virtio_fs_config { char tag[36]; le32 num_request_queues; }
        let mut cfg = vec![0u8; 40];
        let tag = self.tag.as_bytes();
        cfg[..tag.len().min(36)].copy_from_slice(&tag[..tag.len().min(36)]);
        cfg[36..40].copy_from_slice(&1u32.to_le_bytes());
        cfg
    }

    fn num_queues(&self) -> usize {
        2 // hiprio + one request queue
    }

    fn queue_max_size(&self) -> u16 {
        128
    }

    fn handle_queue(&mut self, _queue: u16, chain: &mut DescChain, ram: &GuestRam) -> Result<u32> {
        let request = chain.read_out(ram)?;
        match self.serve(&request) {
            // Reply-less requests (FORGET and friends) post no buffers.
            Some(response) if chain.in_len() > 0 => chain.write_in(ram, &response),
            _ => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::queue::test_ring::TestRing;
    use super::*;
    use crate::fs::MemFs;

    fn server() -> VirtioFs {
        let mut fs = MemFs::new();
        fs.add_file("/etc/hostname", 0o644, b"box\n");
        fs.add_dir("/tmp", 0o777);
        VirtioFs::new("rootfs", Box::new(fs))
    }

    fn request(opcode: u32, nodeid: u64, body: &[u8]) -> Vec<u8> {
        let mut w = Writer::new();
        w.u32((fuse::IN_HEADER_LEN + body.len()) as u32)
            .u32(opcode)
            .u64(0x1234)
            .u64(nodeid)
            .u32(0)
            .u32(0)
            .u32(1)
            .u32(0)
            .bytes(body);
        w.into_bytes()
    }

    fn parse_out(resp: &[u8]) -> (i32, &[u8]) {
        let error = i32::from_le_bytes(resp[4..8].try_into().unwrap());
        (error, &resp[fuse::OUT_HEADER_LEN..])
    }

    #[test]
    fn init_negotiates_minor_version() {
        let mut srv = server();
        let mut body = Writer::new();
        body.u32(7).u32(38).u32(65536).u32(u32::MAX);
        let resp = srv.serve(&request(op::INIT, 0, &body.into_bytes())).unwrap();
        let (err, out) = parse_out(&resp);
        assert_eq!(err, 0);
        assert_eq!(out.len(), 64);
        assert_eq!(u32::from_le_bytes(out[0..4].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(out[4..8].try_into().unwrap()), 31);
        let flags = u32::from_le_bytes(out[12..16].try_into().unwrap());
        assert_eq!(flags & !init_flags::SUPPORTED, 0);
    }

    #[test]
    fn lookup_returns_entry_and_counts() {
        let mut srv = server();
        let resp = srv.serve(&request(op::LOOKUP, 1, b"etc\0")).unwrap();
        let (err, out) = parse_out(&resp);
        assert_eq!(err, 0);
        assert_eq!(out.len(), 128);
        let nodeid = u64::from_le_bytes(out[0..8].try_into().unwrap());
        assert_ne!(nodeid, 0);
        assert_eq!(srv.lookup_count(nodeid), 1);
        srv.serve(&request(op::LOOKUP, 1, b"etc\0")).unwrap();
        assert_eq!(srv.lookup_count(nodeid), 2);
    }

    #[test]
    fn lookup_missing_is_negative_enoent() {
        let mut srv = server();
        let resp = srv.serve(&request(op::LOOKUP, 1, b"nope\0")).unwrap();
        let (err, _) = parse_out(&resp);
        assert_eq!(err, -libc::ENOENT);
    }

    #[test]
    fn forget_balances_lookups() {
        let mut srv = server();
        let resp = srv.serve(&request(op::LOOKUP, 1, b"etc\0")).unwrap();
        let nodeid = u64::from_le_bytes(resp[16..24].try_into().unwrap());
        srv.serve(&request(op::LOOKUP, 1, b"etc\0")).unwrap();
        let mut body = Writer::new();
        body.u64(1);
        assert!(srv.serve(&request(op::FORGET, nodeid, &body.into_bytes())).is_none());
        assert_eq!(srv.lookup_count(nodeid), 1);
        // Over-forget logs and discards.
        let mut body = Writer::new();
        body.u64(5);
        srv.serve(&request(op::FORGET, nodeid, &body.into_bytes()));
        assert_eq!(srv.lookup_count(nodeid), 0);
        // Using the discarded node now fails with ESTALE.
        let resp = srv.serve(&request(op::GETATTR, nodeid, &[0u8; 16])).unwrap();
        assert_eq!(parse_out(&resp).0, -libc::ESTALE);
    }

    #[test]
    fn read_write_round_trip_via_wire() {
        let mut srv = server();
        // LOOKUP /etc, then hostname.
        let resp = srv.serve(&request(op::LOOKUP, 1, b"etc\0")).unwrap();
        let etc = u64::from_le_bytes(resp[16..24].try_into().unwrap());
        let resp = srv.serve(&request(op::LOOKUP, etc, b"hostname\0")).unwrap();
        let file = u64::from_le_bytes(resp[16..24].try_into().unwrap());

        // OPEN.
        let mut body = Writer::new();
        body.u32(libc::O_RDWR as u32).u32(0);
        let resp = srv.serve(&request(op::OPEN, file, &body.into_bytes())).unwrap();
        let (err, out) = parse_out(&resp);
        assert_eq!(err, 0);
        let fh = u64::from_le_bytes(out[0..8].try_into().unwrap());

        // WRITE "net\n" at 0.
        let mut body = Writer::new();
        body.u64(fh).u64(0).u32(4).u32(0).u64(0).u32(0).u32(0).bytes(b"net\n");
        let resp = srv.serve(&request(op::WRITE, file, &body.into_bytes())).unwrap();
        let (err, out) = parse_out(&resp);
        assert_eq!(err, 0);
        assert_eq!(u32::from_le_bytes(out[0..4].try_into().unwrap()), 4);

        // READ back.
        let mut body = Writer::new();
        body.u64(fh).u64(0).u32(16).u32(0).u64(0).u32(0).u32(0);
        let resp = srv.serve(&request(op::READ, file, &body.into_bytes())).unwrap();
        let (err, out) = parse_out(&resp);
        assert_eq!(err, 0);
        assert_eq!(out, b"net\n");
    }

    #[test]
    fn readdir_lists_root() {
        let mut srv = server();
        let mut body = Writer::new();
        body.u64(0).u64(0).u32(4096).u32(0);
        let resp = srv.serve(&request(op::READDIR, 1, &body.into_bytes())).unwrap();
        let (err, out) = parse_out(&resp);
        assert_eq!(err, 0);
        // Walk the dirents and collect names.
        let mut names = Vec::new();
        let mut pos = 0;
        while pos + 24 <= out.len() {
            let namelen = u32::from_le_bytes(out[pos + 16..pos + 20].try_into().unwrap()) as usize;
            names.push(
                std::str::from_utf8(&out[pos + 24..pos + 24 + namelen])
                    .unwrap()
                    .to_string(),
            );
            pos += (24 + namelen + 7) & !7;
        }
        assert!(names.contains(&"etc".to_string()));
        assert!(names.contains(&"tmp".to_string()));
    }

    #[test]
    fn unknown_opcode_is_enosys() {
        let mut srv = server();
        let resp = srv.serve(&request(9999, 1, &[])).unwrap();
        assert_eq!(parse_out(&resp).0, -libc::ENOSYS);
        let resp = srv.serve(&request(op::GETXATTR, 1, &[0u8; 8])).unwrap();
        assert_eq!(parse_out(&resp).0, -libc::ENOSYS);
    }

    #[test]
    fn config_space_carries_tag() {
        let srv = server();
        let cfg = srv.config_space();
        assert_eq!(cfg.len(), 40);
        assert_eq!(&cfg[..6], b"rootfs");
        assert_eq!(u32::from_le_bytes(cfg[36..40].try_into().unwrap()), 1);
    }

    #[test]
    fn serves_chain_end_to_end() {
        let mut ring = TestRing::new(16);
        let req = request(op::GETATTR, 1, &[0u8; 16]);
        ring.ram.write_at(0x8000, &req).unwrap();
        ring.post(&[(0x8000, req.len() as u32, false), (0x9000, 256, true)]);
        let mut chain = ring.q.pop(&ring.ram).unwrap().unwrap();

        let mut srv = server();
        let written = srv.handle_queue(1, &mut chain, &ring.ram).unwrap();
        assert_eq!(written as usize, fuse::OUT_HEADER_LEN + 104);
        let mut resp = vec![0u8; written as usize];
        ring.ram.read_at(0x9000, &mut resp).unwrap();
        assert_eq!(parse_out(&resp).0, 0);
    }
}
