pub mod config;
pub mod download;
pub mod error;
pub mod fsattr;
pub mod paths;
pub mod qcow2;
pub mod session;
pub mod sparse;

use std::ffi::CString;
use std::path::PathBuf;

use anyhow::{bail, Result};

pub use download::RAW_MAX_SIZE;
pub use error::ImportError;
pub use session::ImportSession;

pub struct SudoUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

/// Returns info about the real user behind `sudo`, if applicable.
///
/// Looks up `SUDO_USER` in the environment. Returns `None` if the variable
/// is unset, empty, or set to "root" (running `sudo` as root is a no-op).
pub fn sudo_user() -> Option<SudoUser> {
    let name = std::env::var("SUDO_USER").ok()?;
    if name.is_empty() || name == "root" {
        return None;
    }
    let c_name = CString::new(name.as_bytes()).ok()?;
    let pw = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if pw.is_null() {
        return None;
    }
    let home = unsafe { std::ffi::CStr::from_ptr((*pw).pw_dir) }
        .to_str()
        .ok()?;
    Some(SudoUser {
        name,
        uid: unsafe { (*pw).pw_uid },
        gid: unsafe { (*pw).pw_gid },
        home: PathBuf::from(home),
    })
}

/// Check that `url` is an absolute HTTP(S) URL with a non-empty remainder.
pub fn http_url_is_valid(url: &str) -> bool {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    match rest {
        Some(rest) => !rest.is_empty(),
        None => false,
    }
}

/// Validate a machine name for use as a local image name.
pub fn validate_machine_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("machine name cannot be empty");
    }
    if name.len() > 64 {
        bail!("machine name may be at most 64 characters");
    }
    let first = name.as_bytes()[0];
    if !first.is_ascii_alphanumeric() {
        bail!("machine name must start with a letter or digit");
    }
    for ch in name.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '-' && ch != '_' && ch != '.' {
            bail!("machine name may only contain letters, digits, '-', '_', and '.'");
        }
    }
    Ok(())
}
