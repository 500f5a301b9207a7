//! Container filesystem interface
//!
//! The virtio-fs device is a protocol server; everything it knows about
//! files comes through [`FsBackend`]. The container-image side (OCI layer
//! stacks, overlay composition) lives outside this crate — [`MemFs`] is an
//! in-memory implementation for tests, [`passthrough`] serves a host
//! directory.

pub mod passthrough;

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub use passthrough::PassthroughFs;

/// Backend inode number. Inode 1 is always the root directory.
pub type Inode = u64;

/// Errno-style error code (positive number, e.g. `libc::ENOENT`).
pub type Errno = i32;

pub type FsResult<T> = std::result::Result<T, Errno>;

/// File attributes, stat-shaped.
#[derive(Debug, Clone, Copy, Default)]
pub struct Attr {
    pub ino: Inode,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    /// Full mode including the file-type bits (S_IFREG etc).
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

/// Fields a SETATTR request may change.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
}

/// One directory entry as returned by `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: Inode,
    /// d_type value (DT_REG, DT_DIR, ...).
    pub kind: u32,
    pub name: String,
}

/// statfs numbers for the filesystem behind an inode.
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
}

impl Default for StatFs {
    fn default() -> Self {
        Self {
            blocks: 1 << 20,
            bfree: 1 << 19,
            bavail: 1 << 19,
            files: 1 << 16,
            ffree: 1 << 15,
            bsize: 4096,
            namelen: 255,
        }
    }
}

/// The filesystem operations the FUSE server forwards.
///
/// Handles (`fh`) are backend-defined tokens returned by `open`/`opendir`
/// and passed back on read/write/release.
pub trait FsBackend: Send {
    fn lookup(&mut self, parent: Inode, name: &str) -> FsResult<Attr>;
    fn getattr(&mut self, ino: Inode) -> FsResult<Attr>;
    fn setattr(&mut self, ino: Inode, changes: SetAttr) -> FsResult<Attr>;
    fn readlink(&mut self, ino: Inode) -> FsResult<Vec<u8>>;
    fn symlink(&mut self, parent: Inode, name: &str, target: &str) -> FsResult<Attr>;
    fn mknod(&mut self, parent: Inode, name: &str, mode: u32, rdev: u32) -> FsResult<Attr>;
    fn mkdir(&mut self, parent: Inode, name: &str, mode: u32) -> FsResult<Attr>;
    fn unlink(&mut self, parent: Inode, name: &str) -> FsResult<()>;
    fn rmdir(&mut self, parent: Inode, name: &str) -> FsResult<()>;
    fn rename(&mut self, parent: Inode, name: &str, newparent: Inode, newname: &str)
        -> FsResult<()>;
    fn link(&mut self, ino: Inode, newparent: Inode, newname: &str) -> FsResult<Attr>;
    fn open(&mut self, ino: Inode, flags: u32) -> FsResult<u64>;
    fn read(&mut self, ino: Inode, fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>>;
    fn write(&mut self, ino: Inode, fh: u64, offset: u64, data: &[u8]) -> FsResult<u32>;
    fn release(&mut self, ino: Inode, fh: u64) -> FsResult<()>;
    /// Entries starting at `offset` (an opaque cookie from a prior entry).
    fn readdir(&mut self, ino: Inode, offset: u64) -> FsResult<Vec<DirEntry>>;
    fn statfs(&mut self, ino: Inode) -> FsResult<StatFs>;
    fn access(&mut self, ino: Inode, mask: u32) -> FsResult<()>;
    fn fsync(&mut self, _ino: Inode, _fh: u64) -> FsResult<()> {
        Ok(())
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// d_type from a mode.
pub(crate) fn dtype_of(mode: u32) -> u32 {
    (mode >> 12) & 0xf
}

// ---------------------------------------------------------------------------
// In-memory filesystem for tests
// ---------------------------------------------------------------------------

struct MemNode {
    attr: Attr,
    data: Vec<u8>,
    target: String,
    children: BTreeMap<String, Inode>,
    parent: Inode,
}

/// A small in-memory tree used by the unit tests and demos.
pub struct MemFs {
    nodes: BTreeMap<Inode, MemNode>,
    next_ino: Inode,
    next_fh: u64,
}

impl MemFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            1,
            MemNode {
                attr: Attr {
                    ino: 1,
                    mode: libc::S_IFDIR as u32 | 0o755,
                    nlink: 2,
                    blksize: 4096,
                    mtime: now_secs(),
                    ..Default::default()
                },
                data: Vec::new(),
                target: String::new(),
                children: BTreeMap::new(),
                parent: 1,
            },
        );
        Self {
            nodes,
            next_ino: 2,
            next_fh: 1,
        }
    }

    /// Create a regular file with contents, building the path as needed.
    pub fn add_file(&mut self, path: &str, mode: u32, data: &[u8]) {
        let (dir, name) = self.ensure_parents(path);
        let ino = self.insert_node(dir, name, libc::S_IFREG as u32 | mode);
        let node = self.nodes.get_mut(&ino).unwrap();
        node.attr.size = data.len() as u64;
        node.attr.blocks = (data.len() as u64 + 511) / 512;
        node.data = data.to_vec();
    }

    pub fn add_dir(&mut self, path: &str, mode: u32) {
        let (dir, name) = self.ensure_parents(path);
        if !name.is_empty() {
            self.insert_node(dir, name, libc::S_IFDIR as u32 | mode);
        }
    }

    pub fn add_symlink(&mut self, path: &str, target: &str) {
        let (dir, name) = self.ensure_parents(path);
        let ino = self.insert_node(dir, name, libc::S_IFLNK as u32 | 0o777);
        self.nodes.get_mut(&ino).unwrap().target = target.to_string();
    }

    fn ensure_parents(&mut self, path: &str) -> (Inode, String) {
        let mut dir = 1;
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        for part in &parts[..parts.len().saturating_sub(1)] {
            dir = match self.nodes[&dir].children.get(*part) {
                Some(&child) => child,
                None => self.insert_node(dir, part.to_string(), libc::S_IFDIR as u32 | 0o755),
            };
        }
        (dir, parts.last().copied().unwrap_or("").to_string())
    }

    fn insert_node(&mut self, parent: Inode, name: String, mode: u32) -> Inode {
        if let Some(&existing) = self.nodes[&parent].children.get(&name) {
            return existing;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(
            ino,
            MemNode {
                attr: Attr {
                    ino,
                    mode,
                    nlink: 1,
                    blksize: 4096,
                    mtime: now_secs(),
                    ..Default::default()
                },
                data: Vec::new(),
                target: String::new(),
                children: BTreeMap::new(),
                parent,
            },
        );
        self.nodes.get_mut(&parent).unwrap().children.insert(name, ino);
        ino
    }

    fn node(&self, ino: Inode) -> FsResult<&MemNode> {
        self.nodes.get(&ino).ok_or(libc::ENOENT)
    }

    fn node_mut(&mut self, ino: Inode) -> FsResult<&mut MemNode> {
        self.nodes.get_mut(&ino).ok_or(libc::ENOENT)
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FsBackend for MemFs {
    fn lookup(&mut self, parent: Inode, name: &str) -> FsResult<Attr> {
        let &child = self.node(parent)?.children.get(name).ok_or(libc::ENOENT)?;
        Ok(self.node(child)?.attr)
    }

    fn getattr(&mut self, ino: Inode) -> FsResult<Attr> {
        Ok(self.node(ino)?.attr)
    }

    fn setattr(&mut self, ino: Inode, changes: SetAttr) -> FsResult<Attr> {
        let node = self.node_mut(ino)?;
        if let Some(size) = changes.size {
            node.data.resize(size as usize, 0);
            node.attr.size = size;
        }
        if let Some(mode) = changes.mode {
            node.attr.mode = (node.attr.mode & libc::S_IFMT as u32) | (mode & 0o7777);
        }
        if let Some(uid) = changes.uid {
            node.attr.uid = uid;
        }
        if let Some(gid) = changes.gid {
            node.attr.gid = gid;
        }
        if let Some(atime) = changes.atime {
            node.attr.atime = atime;
        }
        if let Some(mtime) = changes.mtime {
            node.attr.mtime = mtime;
        }
        Ok(node.attr)
    }

    fn readlink(&mut self, ino: Inode) -> FsResult<Vec<u8>> {
        let node = self.node(ino)?;
        if node.attr.mode & libc::S_IFMT as u32 != libc::S_IFLNK as u32 {
            return Err(libc::EINVAL);
        }
        Ok(node.target.clone().into_bytes())
    }

    fn symlink(&mut self, parent: Inode, name: &str, target: &str) -> FsResult<Attr> {
        if self.node(parent)?.children.contains_key(name) {
            return Err(libc::EEXIST);
        }
        let ino = self.insert_node(parent, name.to_string(), libc::S_IFLNK as u32 | 0o777);
        self.nodes.get_mut(&ino).unwrap().target = target.to_string();
        Ok(self.nodes[&ino].attr)
    }

    fn mknod(&mut self, parent: Inode, name: &str, mode: u32, rdev: u32) -> FsResult<Attr> {
        if self.node(parent)?.children.contains_key(name) {
            return Err(libc::EEXIST);
        }
        let ino = self.insert_node(parent, name.to_string(), mode);
        let node = self.nodes.get_mut(&ino).unwrap();
        node.attr.rdev = rdev;
        Ok(node.attr)
    }

    fn mkdir(&mut self, parent: Inode, name: &str, mode: u32) -> FsResult<Attr> {
        if self.node(parent)?.children.contains_key(name) {
            return Err(libc::EEXIST);
        }
        let ino = self.insert_node(parent, name.to_string(), libc::S_IFDIR as u32 | (mode & 0o7777));
        Ok(self.nodes[&ino].attr)
    }

    fn unlink(&mut self, parent: Inode, name: &str) -> FsResult<()> {
        let &child = self.node(parent)?.children.get(name).ok_or(libc::ENOENT)?;
        if self.node(child)?.attr.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32 {
            return Err(libc::EISDIR);
        }
        self.node_mut(parent)?.children.remove(name);
        self.nodes.remove(&child);
        Ok(())
    }

    fn rmdir(&mut self, parent: Inode, name: &str) -> FsResult<()> {
        let &child = self.node(parent)?.children.get(name).ok_or(libc::ENOENT)?;
        let node = self.node(child)?;
        if node.attr.mode & libc::S_IFMT as u32 != libc::S_IFDIR as u32 {
            return Err(libc::ENOTDIR);
        }
        if !node.children.is_empty() {
            return Err(libc::ENOTEMPTY);
        }
        self.node_mut(parent)?.children.remove(name);
        self.nodes.remove(&child);
        Ok(())
    }

    fn rename(
        &mut self,
        parent: Inode,
        name: &str,
        newparent: Inode,
        newname: &str,
    ) -> FsResult<()> {
        let &child = self.node(parent)?.children.get(name).ok_or(libc::ENOENT)?;
        self.node_mut(parent)?.children.remove(name);
        self.node_mut(newparent)?
            .children
            .insert(newname.to_string(), child);
        self.node_mut(child)?.parent = newparent;
        Ok(())
    }

    fn link(&mut self, ino: Inode, newparent: Inode, newname: &str) -> FsResult<Attr> {
        self.node(ino)?;
        if self.node(newparent)?.children.contains_key(newname) {
            return Err(libc::EEXIST);
        }
        self.node_mut(newparent)?
            .children
            .insert(newname.to_string(), ino);
        let node = self.node_mut(ino)?;
        node.attr.nlink += 1;
        Ok(node.attr)
    }

    fn open(&mut self, ino: Inode, _flags: u32) -> FsResult<u64> {
        self.node(ino)?;
        let fh = self.next_fh;
        self.next_fh += 1;
        Ok(fh)
    }

    fn read(&mut self, ino: Inode, _fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let node = self.node(ino)?;
        let start = (offset as usize).min(node.data.len());
        let end = (start + size as usize).min(node.data.len());
        Ok(node.data[start..end].to_vec())
    }

    fn write(&mut self, ino: Inode, _fh: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        let node = self.node_mut(ino)?;
        let end = offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(data);
        node.attr.size = node.data.len() as u64;
        node.attr.blocks = (node.attr.size + 511) / 512;
        node.attr.mtime = now_secs();
        Ok(data.len() as u32)
    }

    fn release(&mut self, _ino: Inode, _fh: u64) -> FsResult<()> {
        Ok(())
    }

    fn readdir(&mut self, ino: Inode, offset: u64) -> FsResult<Vec<DirEntry>> {
        let node = self.node(ino)?;
        if node.attr.mode & libc::S_IFMT as u32 != libc::S_IFDIR as u32 {
            return Err(libc::ENOTDIR);
        }
        let mut entries = vec![
            DirEntry {
                ino,
                kind: dtype_of(libc::S_IFDIR as u32),
                name: ".".into(),
            },
            DirEntry {
                ino: node.parent,
                kind: dtype_of(libc::S_IFDIR as u32),
                name: "..".into(),
            },
        ];
        for (name, &child) in &node.children {
            entries.push(DirEntry {
                ino: child,
                kind: dtype_of(self.nodes[&child].attr.mode),
                name: name.clone(),
            });
        }
        Ok(entries.into_iter().skip(offset as usize).collect())
    }

    fn statfs(&mut self, _ino: Inode) -> FsResult<StatFs> {
        Ok(StatFs::default())
    }

    fn access(&mut self, ino: Inode, _mask: u32) -> FsResult<()> {
        self.node(ino)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_lookup() {
        let mut fs = MemFs::new();
        fs.add_file("/bin/sh", 0o755, b"#!");
        let bin = fs.lookup(1, "bin").unwrap();
        assert_eq!(bin.mode & libc::S_IFMT as u32, libc::S_IFDIR as u32);
        let sh = fs.lookup(bin.ino, "sh").unwrap();
        assert_eq!(sh.size, 2);
        assert!(fs.lookup(1, "missing").is_err());
    }

    #[test]
    fn read_write_round_trip() {
        let mut fs = MemFs::new();
        fs.add_file("/data", 0o644, b"");
        let ino = fs.lookup(1, "data").unwrap().ino;
        let fh = fs.open(ino, 0).unwrap();
        let payload = vec![0xabu8; 65536];
        assert_eq!(fs.write(ino, fh, 0, &payload).unwrap(), 65536);
        assert_eq!(fs.getattr(ino).unwrap().size, 65536);
        let back = fs.read(ino, fh, 0, 65536).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn truncate_via_setattr() {
        let mut fs = MemFs::new();
        fs.add_file("/f", 0o644, b"0123456789");
        let ino = fs.lookup(1, "f").unwrap().ino;
        let attr = fs
            .setattr(
                ino,
                SetAttr {
                    size: Some(4),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(attr.size, 4);
        assert_eq!(fs.read(ino, 0, 0, 16).unwrap(), b"0123");
    }

    #[test]
    fn readdir_with_offset() {
        let mut fs = MemFs::new();
        fs.add_file("/a", 0o644, b"");
        fs.add_file("/b", 0o644, b"");
        let all = fs.readdir(1, 0).unwrap();
        assert_eq!(all.len(), 4); // . .. a b
        let rest = fs.readdir(1, 3).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, "b");
    }

    #[test]
    fn rmdir_rules() {
        let mut fs = MemFs::new();
        fs.add_dir("/d", 0o755);
        fs.add_file("/d/f", 0o644, b"");
        let d = fs.lookup(1, "d").unwrap().ino;
        assert_eq!(fs.rmdir(1, "d").unwrap_err(), libc::ENOTEMPTY);
        fs.unlink(d, "f").unwrap();
        fs.rmdir(1, "d").unwrap();
        assert!(fs.lookup(1, "d").is_err());
    }

    #[test]
    fn symlink_round_trip() {
        let mut fs = MemFs::new();
        fs.add_symlink("/link", "/target");
        let ino = fs.lookup(1, "link").unwrap().ino;
        assert_eq!(fs.readlink(ino).unwrap(), b"/target");
    }
}
