//! Host-directory filesystem backend
//!
//! Serves a directory on the host (an unpacked container root) through the
//! [`FsBackend`] interface. Inodes are table-allocated per path; file
//! handles wrap open host files.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::{dtype_of, Attr, DirEntry, Errno, FsBackend, FsResult, Inode, SetAttr, StatFs};

fn errno_of(err: &std::io::Error) -> Errno {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn attr_of(ino: Inode, md: &std::fs::Metadata) -> Attr {
    Attr {
        ino,
        size: md.size(),
        blocks: md.blocks(),
        atime: md.atime().max(0) as u64,
        mtime: md.mtime().max(0) as u64,
        ctime: md.ctime().max(0) as u64,
        mode: md.mode(),
        nlink: md.nlink() as u32,
        uid: md.uid(),
        gid: md.gid(),
        rdev: md.rdev() as u32,
        blksize: md.blksize() as u32,
    }
}

/// Serves one host directory tree.
pub struct PassthroughFs {
    root: PathBuf,
    paths: BTreeMap<Inode, PathBuf>,
    /// host (dev, ino) → our inode, so hard links share a number.
    by_host: HashMap<(u64, u64), Inode>,
    next_ino: Inode,
    handles: HashMap<u64, Option<File>>,
    next_fh: u64,
}

impl PassthroughFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut paths = BTreeMap::new();
        paths.insert(1, root.clone());
        Self {
            root,
            paths,
            by_host: HashMap::new(),
            next_ino: 2,
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, ino: Inode) -> FsResult<PathBuf> {
        self.paths.get(&ino).cloned().ok_or(libc::ENOENT)
    }

    fn intern(&mut self, path: PathBuf, md: &std::fs::Metadata) -> Inode {
        let key = (md.dev(), md.ino());
        if let Some(&ino) = self.by_host.get(&key) {
            // Path may have moved (rename); keep the mapping fresh.
            self.paths.insert(ino, path);
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.by_host.insert(key, ino);
        self.paths.insert(ino, path);
        ino
    }

    fn stat(&mut self, path: &Path) -> FsResult<(Inode, Attr)> {
        let md = std::fs::symlink_metadata(path).map_err(|e| errno_of(&e))?;
        let ino = self.intern(path.to_path_buf(), &md);
        Ok((ino, attr_of(ino, &md)))
    }
}

impl FsBackend for PassthroughFs {
    fn lookup(&mut self, parent: Inode, name: &str) -> FsResult<Attr> {
        let path = self.path_of(parent)?.join(name);
        self.stat(&path).map(|(_, attr)| attr)
    }

    fn getattr(&mut self, ino: Inode) -> FsResult<Attr> {
        let path = self.path_of(ino)?;
        let md = std::fs::symlink_metadata(&path).map_err(|e| errno_of(&e))?;
        Ok(attr_of(ino, &md))
    }

    fn setattr(&mut self, ino: Inode, changes: SetAttr) -> FsResult<Attr> {
        let path = self.path_of(ino)?;
        if let Some(size) = changes.size {
            let f = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| errno_of(&e))?;
            f.set_len(size).map_err(|e| errno_of(&e))?;
        }
        if let Some(mode) = changes.mode {
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| errno_of(&e))?;
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            let c = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)?;
            let uid = changes.uid.map(|u| u as libc::uid_t).unwrap_or(u32::MAX);
            let gid = changes.gid.map(|g| g as libc::gid_t).unwrap_or(u32::MAX);
            // SAFETY: c is a valid NUL-terminated path for the call duration.
            let rc = unsafe { libc::lchown(c.as_ptr(), uid, gid) };
            if rc != 0 {
                warn!(path = %path.display(), "lchown failed, ignoring");
            }
        }
        self.getattr(ino)
    }

    fn readlink(&mut self, ino: Inode) -> FsResult<Vec<u8>> {
        let path = self.path_of(ino)?;
        let target = std::fs::read_link(&path).map_err(|e| errno_of(&e))?;
        Ok(target.as_os_str().as_bytes().to_vec())
    }

    fn symlink(&mut self, parent: Inode, name: &str, target: &str) -> FsResult<Attr> {
        let path = self.path_of(parent)?.join(name);
        std::os::unix::fs::symlink(target, &path).map_err(|e| errno_of(&e))?;
        self.stat(&path).map(|(_, attr)| attr)
    }

    fn mknod(&mut self, parent: Inode, name: &str, mode: u32, rdev: u32) -> FsResult<Attr> {
        let path = self.path_of(parent)?.join(name);
        if mode & libc::S_IFMT as u32 == libc::S_IFREG as u32 || mode & libc::S_IFMT as u32 == 0 {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .map_err(|e| errno_of(&e))?;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| errno_of(&e))?;
        } else {
            let c = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)?;
            // SAFETY: c is a valid NUL-terminated path for the call duration.
            let rc = unsafe { libc::mknod(c.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EIO));
            }
        }
        self.stat(&path).map(|(_, attr)| attr)
    }

    fn mkdir(&mut self, parent: Inode, name: &str, mode: u32) -> FsResult<Attr> {
        let path = self.path_of(parent)?.join(name);
        std::fs::create_dir(&path).map_err(|e| errno_of(&e))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| errno_of(&e))?;
        self.stat(&path).map(|(_, attr)| attr)
    }

    fn unlink(&mut self, parent: Inode, name: &str) -> FsResult<()> {
        let path = self.path_of(parent)?.join(name);
        std::fs::remove_file(&path).map_err(|e| errno_of(&e))
    }

    fn rmdir(&mut self, parent: Inode, name: &str) -> FsResult<()> {
        let path = self.path_of(parent)?.join(name);
        std::fs::remove_dir(&path).map_err(|e| errno_of(&e))
    }

    fn rename(
        &mut self,
        parent: Inode,
        name: &str,
        newparent: Inode,
        newname: &str,
    ) -> FsResult<()> {
        let from = self.path_of(parent)?.join(name);
        let to = self.path_of(newparent)?.join(newname);
        std::fs::rename(&from, &to).map_err(|e| errno_of(&e))?;
        if let Ok(md) = std::fs::symlink_metadata(&to) {
            self.intern(to, &md);
        }
        Ok(())
    }

    fn link(&mut self, ino: Inode, newparent: Inode, newname: &str) -> FsResult<Attr> {
        let from = self.path_of(ino)?;
        let to = self.path_of(newparent)?.join(newname);
        std::fs::hard_link(&from, &to).map_err(|e| errno_of(&e))?;
        self.stat(&to).map(|(_, attr)| attr)
    }

    fn open(&mut self, ino: Inode, flags: u32) -> FsResult<u64> {
        let path = self.path_of(ino)?;
        let md = std::fs::symlink_metadata(&path).map_err(|e| errno_of(&e))?;
        let fh = self.next_fh;
        self.next_fh += 1;
        if md.is_dir() {
            self.handles.insert(fh, None);
            return Ok(fh);
        }
        let access = flags as i32 & libc::O_ACCMODE;
        let file = OpenOptions::new()
            .read(access == libc::O_RDONLY || access == libc::O_RDWR)
            .write(access == libc::O_WRONLY || access == libc::O_RDWR)
            .append(flags as i32 & libc::O_APPEND != 0)
            .open(&path)
            .map_err(|e| errno_of(&e))?;
        self.handles.insert(fh, Some(file));
        Ok(fh)
    }

    fn read(&mut self, _ino: Inode, fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let file = self
            .handles
            .get_mut(&fh)
            .and_then(|f| f.as_mut())
            .ok_or(libc::EBADF)?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| errno_of(&e))?;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(errno_of(&e)),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write(&mut self, _ino: Inode, fh: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        let file = self
            .handles
            .get_mut(&fh)
            .and_then(|f| f.as_mut())
            .ok_or(libc::EBADF)?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| errno_of(&e))?;
        file.write_all(data).map_err(|e| errno_of(&e))?;
        Ok(data.len() as u32)
    }

    fn release(&mut self, _ino: Inode, fh: u64) -> FsResult<()> {
        self.handles.remove(&fh);
        Ok(())
    }

    fn readdir(&mut self, ino: Inode, offset: u64) -> FsResult<Vec<DirEntry>> {
        let path = self.path_of(ino)?;
        let mut entries = vec![
            DirEntry {
                ino,
                kind: dtype_of(libc::S_IFDIR as u32),
                name: ".".into(),
            },
            DirEntry {
                ino,
                kind: dtype_of(libc::S_IFDIR as u32),
                name: "..".into(),
            },
        ];
        let mut names: Vec<_> = std::fs::read_dir(&path)
            .map_err(|e| errno_of(&e))?
            .filter_map(|e| e.ok())
            .collect();
        names.sort_by_key(|e| e.file_name());
        for entry in names {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(md) = std::fs::symlink_metadata(entry.path()) else {
                continue;
            };
            let kind = if md.file_type().is_symlink() {
                dtype_of(libc::S_IFLNK as u32)
            } else if md.is_dir() {
                dtype_of(libc::S_IFDIR as u32)
            } else if md.file_type().is_char_device() {
                dtype_of(libc::S_IFCHR as u32)
            } else if md.file_type().is_block_device() {
                dtype_of(libc::S_IFBLK as u32)
            } else {
                dtype_of(libc::S_IFREG as u32)
            };
            let child_ino = self.intern(entry.path(), &md);
            entries.push(DirEntry {
                ino: child_ino,
                kind,
                name,
            });
        }
        Ok(entries.into_iter().skip(offset as usize).collect())
    }

    fn statfs(&mut self, _ino: Inode) -> FsResult<StatFs> {
        Ok(StatFs::default())
    }

    fn access(&mut self, ino: Inode, _mask: u32) -> FsResult<()> {
        let path = self.path_of(ino)?;
        std::fs::symlink_metadata(&path)
            .map(|_| ())
            .map_err(|e| errno_of(&e))
    }

    fn fsync(&mut self, _ino: Inode, fh: u64) -> FsResult<()> {
        if let Some(Some(file)) = self.handles.get(&fh) {
            file.sync_all().map_err(|e| errno_of(&e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_read_and_readdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hi there").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let mut fs = PassthroughFs::new(dir.path());
        let attr = fs.lookup(1, "hello.txt").unwrap();
        assert_eq!(attr.size, 8);

        let fh = fs.open(attr.ino, libc::O_RDONLY as u32).unwrap();
        assert_eq!(fs.read(attr.ino, fh, 3, 16).unwrap(), b"there");
        fs.release(attr.ino, fh).unwrap();

        let names: Vec<_> = fs.readdir(1, 0).unwrap().into_iter().map(|e| e.name).collect();
        assert!(names.contains(&"hello.txt".to_string()));
        assert!(names.contains(&"sub".to_string()));
    }

    #[test]
    fn write_and_truncate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let mut fs = PassthroughFs::new(dir.path());
        let ino = fs.lookup(1, "f").unwrap().ino;
        let fh = fs.open(ino, libc::O_RDWR as u32).unwrap();
        fs.write(ino, fh, 0, b"0123456789").unwrap();
        fs.setattr(
            ino,
            SetAttr {
                size: Some(4),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(fs.getattr(ino).unwrap().size, 4);
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"0123");
    }

    #[test]
    fn hard_links_share_inode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        std::fs::hard_link(dir.path().join("a"), dir.path().join("b")).unwrap();
        let mut fs = PassthroughFs::new(dir.path());
        let a = fs.lookup(1, "a").unwrap();
        let b = fs.lookup(1, "b").unwrap();
        assert_eq!(a.ino, b.ino);
    }

    #[test]
    fn mkdir_unlink_rename() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = PassthroughFs::new(dir.path());
        fs.mkdir(1, "d", 0o755).unwrap();
        assert!(dir.path().join("d").is_dir());
        fs.mknod(1, "file", libc::S_IFREG as u32 | 0o644, 0).unwrap();
        fs.rename(1, "file", 1, "renamed").unwrap();
        assert!(dir.path().join("renamed").exists());
        fs.unlink(1, "renamed").unwrap();
        assert!(!dir.path().join("renamed").exists());
        fs.rmdir(1, "d").unwrap();
    }
}
