//! Cache-file naming for downloaded images.
//!
//! A cached image lives in the image root as
//! `.raw-<escaped url>[.<escaped etag>].raw`. The escaping is reversible so
//! the directory scan for previously cached ETags can invert it.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Bytes that must not appear verbatim in a cache file name. `%` is in the
/// set so the encoding stays reversible.
const FILENAME_ESCAPE: &[u8] = b"/.#\"'%";

/// Percent-encode `s` for use as a single path component. Control bytes and
/// non-ASCII bytes are escaped along with [`FILENAME_ESCAPE`].
pub fn escape_filename(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if FILENAME_ESCAPE.contains(&b) || b < 0x21 || b > 0x7e {
            out.push_str(&format!("%{b:02X}"));
        } else {
            out.push(b as char);
        }
    }
    out
}

/// Invert [`escape_filename`]. Returns `None` for truncated or non-hex
/// escapes and for results that are not valid UTF-8.
pub fn unescape_filename(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// A syntactically valid HTTP ETag: a quoted string, optionally with a weak
/// `W/` prefix.
pub fn etag_is_valid(etag: &str) -> bool {
    let rest = etag.strip_prefix("W/").unwrap_or(etag);
    rest.len() >= 2 && rest.starts_with('"') && rest.ends_with('"')
}

/// The content-addressed cache path for `(url, etag)` under `image_root`.
pub fn cache_path(image_root: &Path, url: &str, etag: Option<&str>) -> PathBuf {
    let mut name = String::from(".raw-");
    name.push_str(&escape_filename(url));
    if let Some(etag) = etag {
        name.push('.');
        name.push_str(&escape_filename(etag));
    }
    name.push_str(".raw");
    image_root.join(name)
}

/// The path of the user-visible writable copy named `local`.
pub fn local_path(image_root: &Path, local: &str) -> PathBuf {
    image_root.join(format!("{local}.raw"))
}

/// Scan the image root for previously cached copies of `url` and collect
/// their ETags. Entries that do not unescape to a valid ETag are skipped;
/// a missing image root yields an empty list.
pub fn find_old_etags(image_root: &Path, url: &str) -> Result<Vec<String>> {
    let escaped_url = escape_filename(url);

    let dir = match fs::read_dir(image_root) {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read {}", image_root.display()))
        }
    };

    let mut etags = Vec::new();
    for entry in dir {
        let entry = entry
            .with_context(|| format!("failed to read entry in {}", image_root.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(rest) = name.strip_prefix(".raw-") else {
            continue;
        };
        let Some(rest) = rest.strip_prefix(escaped_url.as_str()) else {
            continue;
        };
        let Some(rest) = rest.strip_prefix('.') else {
            continue;
        };
        let Some(middle) = rest.strip_suffix(".raw") else {
            continue;
        };
        if middle.is_empty() {
            continue;
        }
        let Some(etag) = unescape_filename(middle) else {
            continue;
        };
        if !etag_is_valid(&etag) {
            continue;
        }
        etags.push(etag);
    }

    Ok(etags)
}

fn random_hex(len: usize) -> Result<String> {
    let mut buf = vec![0u8; len.div_ceil(2)];
    let mut f = File::open("/dev/urandom").context("failed to open /dev/urandom")?;
    f.read_exact(&mut buf)
        .context("failed to read /dev/urandom")?;
    let mut out = String::with_capacity(len);
    for b in &buf {
        out.push_str(&format!("{b:02x}"));
    }
    out.truncate(len);
    Ok(out)
}

/// A random hidden sibling of `path`, suitable for exclusive creation and a
/// same-directory rename into place.
pub fn tempfn_random(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("path has no file name: {}", path.display()))?;
    let suffix = random_hex(16)?;
    Ok(path.with_file_name(format!(".{file_name}.tmp-{suffix}")))
}
