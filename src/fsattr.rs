//! File attribute helpers: NOCOW, extended attributes, timestamps.
//!
//! Everything here is best-effort from the importer's point of view; callers
//! decide whether a failure is worth a warning or silence.

use std::ffi::{CStr, CString};
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

// <linux/fs.h>, 64-bit layout.
const FS_IOC_GETFLAGS: libc::c_ulong = 0x8008_6601;
const FS_IOC_SETFLAGS: libc::c_ulong = 0x4008_6602;
const FS_NOCOW_FL: libc::c_long = 0x0080_0000;

/// Toggle the NOCOW attribute on an open file. In-place writes to VM images
/// fragment badly on COW filesystems like btrfs; filesystems without the
/// flag return an error the caller is expected to ignore.
pub fn set_nocow(f: &File, on: bool) -> io::Result<()> {
    let fd = f.as_raw_fd();

    let mut flags: libc::c_long = 0;
    if unsafe { libc::ioctl(fd, FS_IOC_GETFLAGS, &mut flags) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let new_flags = if on {
        flags | FS_NOCOW_FL
    } else {
        flags & !FS_NOCOW_FL
    };
    if new_flags == flags {
        return Ok(());
    }

    if unsafe { libc::ioctl(fd, FS_IOC_SETFLAGS, &new_flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set an extended attribute on an open file.
pub fn set_xattr(f: &File, name: &str, value: &[u8]) -> io::Result<()> {
    let c_name = CString::new(name).map_err(|_| invalid_input("xattr name"))?;
    let r = unsafe {
        libc::fsetxattr(
            f.as_raw_fd(),
            c_name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read an extended attribute from an open file.
pub fn get_xattr(f: &File, name: &str) -> io::Result<Vec<u8>> {
    let c_name = CString::new(name).map_err(|_| invalid_input("xattr name"))?;
    fgetxattr(f, &c_name)
}

fn fgetxattr(f: &File, name: &CStr) -> io::Result<Vec<u8>> {
    let fd = f.as_raw_fd();

    let size = unsafe { libc::fgetxattr(fd, name.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut buf = vec![0u8; size as usize];
    let size = unsafe {
        libc::fgetxattr(
            fd,
            name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if size < 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(size as usize);
    Ok(buf)
}

/// Copy the user-settable extended attributes from one open file to another.
/// `security.*` attributes are skipped. A destination filesystem without
/// xattr support ends the copy silently.
pub fn copy_xattrs(src: &File, dst: &File) -> io::Result<()> {
    let fd = src.as_raw_fd();

    let size = unsafe { libc::flistxattr(fd, std::ptr::null_mut(), 0) };
    if size < 0 {
        let err = io::Error::last_os_error();
        if matches!(
            err.raw_os_error(),
            Some(libc::ENOTSUP) | Some(libc::ENODATA)
        ) {
            return Ok(());
        }
        return Err(err);
    }
    if size == 0 {
        return Ok(());
    }

    let mut names = vec![0u8; size as usize];
    let size = unsafe {
        libc::flistxattr(fd, names.as_mut_ptr() as *mut libc::c_char, names.len())
    };
    if size < 0 {
        return Err(io::Error::last_os_error());
    }

    for name in names[..size as usize].split(|&b| b == 0) {
        if name.is_empty() || name.starts_with(b"security.") {
            continue;
        }
        let c_name = CString::new(name).map_err(|_| invalid_input("xattr name"))?;

        let value = match fgetxattr(src, &c_name) {
            Ok(v) => v,
            // Raced away between list and get.
            Err(e) if e.raw_os_error() == Some(libc::ENODATA) => continue,
            Err(e) => return Err(e),
        };

        let r = unsafe {
            libc::fsetxattr(
                dst.as_raw_fd(),
                c_name.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                0,
            )
        };
        if r < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOTSUP) {
                return Ok(());
            }
            return Err(err);
        }
    }

    Ok(())
}

/// Set both access and modification time of an open file to `t`.
pub fn set_file_times(f: &File, t: SystemTime) -> io::Result<()> {
    let ts = timespec_from(t)?;
    futimens(f, &[ts, ts])
}

/// Copy access and modification times from one open file to another with
/// nanosecond precision.
pub fn copy_times(src: &File, dst: &File) -> io::Result<()> {
    let meta = src.metadata()?;
    let times = [
        libc::timespec {
            tv_sec: meta.atime(),
            tv_nsec: meta.atime_nsec(),
        },
        libc::timespec {
            tv_sec: meta.mtime(),
            tv_nsec: meta.mtime_nsec(),
        },
    ];
    futimens(dst, &times)
}

/// Record the creation time of an open file as a `user.crtime_usec` xattr
/// (microseconds since the epoch, little endian), for filesystems that do
/// not expose a real birth time.
pub fn set_crtime(f: &File, t: SystemTime) -> io::Result<()> {
    let usec = t
        .duration_since(UNIX_EPOCH)
        .map_err(|_| invalid_input("time before epoch"))?
        .as_micros() as u64;
    set_xattr(f, "user.crtime_usec", &usec.to_le_bytes())
}

/// Remove whatever sits at `path`: a file, a symlink, or a whole directory
/// tree. A missing target is fine.
pub fn force_remove(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn futimens(f: &File, times: &[libc::timespec; 2]) -> io::Result<()> {
    if unsafe { libc::futimens(f.as_raw_fd(), times.as_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn timespec_from(t: SystemTime) -> io::Result<libc::timespec> {
    let d = t
        .duration_since(UNIX_EPOCH)
        .map_err(|_| invalid_input("time before epoch"))?;
    Ok(libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    })
}

fn invalid_input(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, what.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn temp_file(tag: &str) -> (PathBuf, File) {
        let path = std::env::temp_dir().join(format!(
            "imgpull-test-fsattr-{tag}-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = fs::remove_file(&path);
        let f = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        (path, f)
    }

    #[test]
    fn test_xattr_roundtrip() {
        let (path, f) = temp_file("xattr");
        if let Err(e) = set_xattr(&f, "user.imgpull_test", b"hello") {
            // tmpfs without user xattr support, for example.
            eprintln!("skipping xattr test: {e}");
            let _ = fs::remove_file(&path);
            return;
        }
        assert_eq!(get_xattr(&f, "user.imgpull_test").unwrap(), b"hello");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_copy_xattrs() {
        let (src_path, src) = temp_file("xcopy-src");
        let (dst_path, dst) = temp_file("xcopy-dst");
        if set_xattr(&src, "user.imgpull_a", b"1").is_ok() {
            set_xattr(&src, "user.imgpull_b", b"2").unwrap();
            copy_xattrs(&src, &dst).unwrap();
            assert_eq!(get_xattr(&dst, "user.imgpull_a").unwrap(), b"1");
            assert_eq!(get_xattr(&dst, "user.imgpull_b").unwrap(), b"2");
        }
        let _ = fs::remove_file(&src_path);
        let _ = fs::remove_file(&dst_path);
    }

    #[test]
    fn test_set_file_times() {
        let (path, f) = temp_file("times");
        let t = UNIX_EPOCH + Duration::from_secs(1_000_000_000);
        set_file_times(&f, t).unwrap();
        let meta = f.metadata().unwrap();
        assert_eq!(meta.mtime(), 1_000_000_000);
        assert_eq!(meta.atime(), 1_000_000_000);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_copy_times() {
        let (src_path, src) = temp_file("ctimes-src");
        let (dst_path, dst) = temp_file("ctimes-dst");
        let t = UNIX_EPOCH + Duration::from_secs(1_234_567_890);
        set_file_times(&src, t).unwrap();
        copy_times(&src, &dst).unwrap();
        assert_eq!(dst.metadata().unwrap().mtime(), 1_234_567_890);
        let _ = fs::remove_file(&src_path);
        let _ = fs::remove_file(&dst_path);
    }

    #[test]
    fn test_force_remove() {
        let dir = std::env::temp_dir().join(format!(
            "imgpull-test-rm-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("sub/file"), b"x").unwrap();

        force_remove(&dir).unwrap();
        assert!(!dir.exists());

        // Missing target is not an error.
        force_remove(&dir).unwrap();

        let file = std::env::temp_dir().join(format!(
            "imgpull-test-rm-file-{}",
            std::process::id()
        ));
        fs::write(&file, b"x").unwrap();
        force_remove(&file).unwrap();
        assert!(!file.exists());
    }
}
