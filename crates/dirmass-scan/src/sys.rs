//! Fd-relative syscall plumbing.
//!
//! The walker keeps one open file descriptor per directory level so that
//! relative lookups stay valid while the filesystem mutates underneath it.

use std::ffi::CStr;
use std::io;
use std::mem::{self, MaybeUninit};
use std::os::unix::io::RawFd;

use dirmass_core::{EntryStat, Ext};

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[cfg(target_os = "linux")]
fn errno_ptr() -> *mut libc::c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(not(target_os = "linux"))]
fn errno_ptr() -> *mut libc::c_int {
    unsafe { libc::__error() }
}

/// An owned directory file descriptor.
pub struct DirHandle {
    fd: RawFd,
}

impl DirHandle {
    /// Open the scan root by absolute path. Symlinks are followed here only.
    pub fn open_root(path: &CStr) -> io::Result<Self> {
        let fd = cvt(unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        })?;
        Ok(Self { fd })
    }

    /// Open a subdirectory relative to `dirfd`, refusing symlinks.
    pub fn open_at(dirfd: RawFd, name: &CStr) -> io::Result<Self> {
        let fd = cvt(unsafe {
            libc::openat(
                dirfd,
                name.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            )
        })?;
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn fstat(&self) -> io::Result<libc::stat> {
        let mut st = MaybeUninit::<libc::stat>::uninit();
        cvt(unsafe { libc::fstat(self.fd, st.as_mut_ptr()) })?;
        Ok(unsafe { st.assume_init() })
    }

    fn into_raw(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Drop for DirHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Iterates a directory's raw byte names, `.` and `..` skipped.
pub struct DirStream {
    dir: *mut libc::DIR,
    fd: RawFd,
}

impl DirStream {
    /// Take ownership of a handle and start iterating it.
    pub fn new(handle: DirHandle) -> io::Result<Self> {
        let fd = handle.into_raw();
        let dir = unsafe { libc::fdopendir(fd) };
        if dir.is_null() {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(err);
        }
        Ok(Self { dir, fd })
    }

    /// The descriptor backing this stream, for `openat`/`fstatat` lookups.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Next name, or `None` at end of directory.
    pub fn next_name(&mut self) -> Option<io::Result<Vec<u8>>> {
        loop {
            unsafe {
                *errno_ptr() = 0;
            }
            let ent = unsafe { libc::readdir(self.dir) };
            if ent.is_null() {
                let err = io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(0) | None => None,
                    Some(_) => Some(Err(err)),
                };
            }
            let name = unsafe { CStr::from_ptr((*ent).d_name.as_ptr()) }.to_bytes();
            if name == b"." || name == b".." {
                continue;
            }
            return Some(Ok(name.to_vec()));
        }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe {
            libc::closedir(self.dir);
        }
    }
}

/// `fstatat` relative to an open directory.
pub fn stat_at(dirfd: RawFd, name: &CStr, follow: bool) -> io::Result<libc::stat> {
    let flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
    let mut st = MaybeUninit::<libc::stat>::uninit();
    cvt(unsafe { libc::fstatat(dirfd, name.as_ptr(), st.as_mut_ptr(), flags) })?;
    Ok(unsafe { st.assume_init() })
}

/// Open a file relative to `dirfd` and read up to `buf.len()` bytes.
pub fn read_file_at(dirfd: RawFd, name: &CStr, buf: &mut [u8]) -> io::Result<usize> {
    let fd = cvt(unsafe {
        libc::openat(dirfd, name.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC)
    })?;
    let mut got = 0;
    let result = loop {
        if got == buf.len() {
            break Ok(got);
        }
        let n = unsafe {
            libc::read(
                fd,
                buf[got..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - got,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break Err(err);
        }
        if n == 0 {
            break Ok(got);
        }
        got += n as usize;
    };
    unsafe {
        libc::close(fd);
    }
    result
}

/// Filesystem magic of the filesystem holding `fd`.
#[cfg(target_os = "linux")]
pub fn fs_magic(fd: RawFd) -> io::Result<libc::c_long> {
    let mut st = MaybeUninit::<libc::statfs>::uninit();
    cvt(unsafe { libc::fstatfs(fd, st.as_mut_ptr()) })?;
    Ok(unsafe { st.assume_init() }.f_type as libc::c_long)
}

/// Translate a raw stat record into the model's stat form.
///
/// Hardlink classification is left to the caller; it depends on symlink
/// handling the stat record alone cannot see.
pub fn stat_to_entry(st: &libc::stat, extended: bool) -> EntryStat {
    let fmt = st.st_mode & libc::S_IFMT;
    let is_dir = fmt == libc::S_IFDIR;
    let regular = fmt == libc::S_IFREG;
    EntryStat {
        is_dir,
        is_symlink: fmt == libc::S_IFLNK,
        notreg: !is_dir && !regular,
        hardlink: false,
        size: st.st_size.max(0) as u64,
        blocks: st.st_blocks.max(0) as u64,
        dev: st.st_dev as u64,
        ino: st.st_ino,
        nlink: st.st_nlink as u32,
        ext: extended.then(|| Ext {
            uid: st.st_uid,
            gid: st.st_gid,
            mode: st.st_mode as u32,
            mtime: st.st_mtime.max(0) as u64,
        }),
    }
}
