//! Per-URL download: conditional fetch, stream sniffing, XZ decompression,
//! sparse writing, and finalization into the image cache.
//!
//! The flow for one URL is linear: scan the cache for prior ETags, issue a
//! conditional GET, classify the first bytes of the body, stream the rest
//! through the decoder into a sparse temp file, then finalize (truncate,
//! QCOW2 conversion, provenance attributes, read-only chmod, atomic rename)
//! and optionally materialize a writable copy. Cancellation is polled at
//! every chunk and before the irreversible steps.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use xz2::stream::{Action, Status, Stream};

use crate::error::ImportError;
use crate::{fsattr, paths, qcow2, sparse};

/// Hard cap on the uncompressed size of an imported image: 8 GiB.
pub const RAW_MAX_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// XZ stream signature.
const XZ_SIGNATURE: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];

/// Zero runs at least this long become holes.
const SPARSE_WINDOW: usize = 64;

/// Decoder output is drained in chunks of this size.
const DECODE_BUF_SIZE: usize = 16 * 1024;

/// Body read chunk size.
const READ_BUF_SIZE: usize = 64 * 1024;

pub(crate) struct Download {
    url: String,
    local: Option<String>,
    force_local: bool,
    image_root: PathBuf,
    verbose: bool,
    cancelled: Arc<AtomicBool>,

    temp_path: Option<PathBuf>,
    final_path: Option<PathBuf>,
    etag: Option<String>,
    old_etags: Vec<String>,

    content_length: Option<u64>,
    written_compressed: u64,
    written_uncompressed: u64,

    payload: Vec<u8>,
    mtime: Option<SystemTime>,

    disk: Option<File>,
    lzma: Option<Stream>,
    compressed: bool,

    progress_percent: u64,
    start: Instant,
    last_status: Option<Instant>,
}

impl Download {
    pub(crate) fn new(
        url: String,
        local: Option<String>,
        force_local: bool,
        image_root: PathBuf,
        verbose: bool,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            url,
            local,
            force_local,
            image_root,
            verbose,
            cancelled,
            temp_path: None,
            final_path: None,
            etag: None,
            old_etags: Vec::new(),
            content_length: None,
            written_compressed: 0,
            written_uncompressed: 0,
            payload: Vec::new(),
            mtime: None,
            disk: None,
            lzma: None,
            compressed: false,
            progress_percent: 0,
            start: Instant::now(),
            last_status: None,
        }
    }

    /// Run the download to completion. On success the cached image exists at
    /// its final path and the writable copy, if requested, is in place.
    pub(crate) fn run(&mut self, agent: &ureq::Agent) -> Result<()> {
        if self.verbose {
            eprintln!("getting {}", self.url);
        }

        self.old_etags = paths::find_old_etags(&self.image_root, &self.url)?;

        let mut request = agent.get(self.url.as_str());
        if !self.old_etags.is_empty() {
            let joined = self.old_etags.join(", ");
            request = request.header("If-None-Match", joined.as_str());
        }

        let response = request.call().map_err(|e| {
            ImportError::Transfer(format!("transfer from {} failed: {e}", self.url))
        })?;

        self.read_headers(&response);

        // A fresh ETag matching a cached copy means the body, if the server
        // sent one at all, can be skipped entirely.
        if let Some(etag) = &self.etag {
            if self.old_etags.iter().any(|old| old == etag) {
                if self.verbose {
                    eprintln!("image already downloaded, skipping");
                }
                return self.finish_success();
            }
        }

        let status = response.status().as_u16();
        if status == 304 {
            if self.verbose {
                eprintln!("image already downloaded, skipping");
            }
            return self.finish_success();
        }
        if status >= 300 {
            return Err(ImportError::Transfer(format!(
                "http request to {} failed with status {status}",
                self.url
            ))
            .into());
        }
        if status < 200 {
            return Err(ImportError::Transfer(format!(
                "http request to {} finished with unexpected status {status}",
                self.url
            ))
            .into());
        }

        let mut reader = response.into_body().into_reader();
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            self.check_cancelled()?;
            let n = reader.read(&mut buf).map_err(|e| {
                ImportError::Transfer(format!("read from {} failed: {e}", self.url))
            })?;
            if n == 0 {
                break;
            }
            self.write_body(&buf[..n])?;
            self.report_progress();
        }

        // A body shorter than the signature never triggered detection;
        // classify it with what there is.
        if self.disk.is_none() && !self.payload.is_empty() {
            self.detect(true)?;
        }

        if self.disk.is_none() {
            return Err(ImportError::Transfer(format!(
                "no data received from {}",
                self.url
            ))
            .into());
        }

        if let Some(expected) = self.content_length {
            if self.written_compressed != expected {
                return Err(ImportError::Transfer(format!(
                    "download truncated ({} of {expected} bytes)",
                    self.written_compressed
                ))
                .into());
            }
        }

        self.finalize()?;
        self.finish_success()
    }

    fn read_headers(&mut self, response: &ureq::http::Response<ureq::Body>) {
        let headers = response.headers();

        if let Some(v) = headers.get("etag").and_then(|v| v.to_str().ok()) {
            self.etag = Some(v.trim().to_string());
        }

        if let Some(v) = headers.get("content-length").and_then(|v| v.to_str().ok()) {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.content_length = Some(n);
                if self.verbose {
                    eprintln!("downloading {}", format_bytes(n));
                }
            }
        }

        if let Some(v) = headers.get("last-modified").and_then(|v| v.to_str().ok()) {
            if let Ok(t) = chrono::DateTime::parse_from_rfc2822(v.trim()) {
                self.mtime = Some(SystemTime::from(t));
            }
        }
    }

    /// Feed one body chunk: accumulate in the sniff buffer until the stream
    /// is classified, then stream through the write path.
    fn write_body(&mut self, data: &[u8]) -> Result<()> {
        if self.disk.is_none() {
            self.payload.extend_from_slice(data);
            return self.detect(false);
        }
        self.write_compressed(data)
    }

    /// Classify the buffered stream head once the signature length is in,
    /// open the target file and drain the buffer through the write path.
    /// With `force`, classify whatever is buffered.
    fn detect(&mut self, force: bool) -> Result<()> {
        if self.payload.len() < XZ_SIGNATURE.len() && !force {
            return Ok(());
        }

        self.compressed = self.payload.starts_with(&XZ_SIGNATURE);
        if self.verbose {
            eprintln!(
                "stream is xz compressed: {}",
                if self.compressed { "yes" } else { "no" }
            );
        }

        if self.compressed {
            let stream =
                Stream::new_stream_decoder(u64::MAX, xz2::stream::TELL_UNSUPPORTED_CHECK)
                    .map_err(|e| {
                        ImportError::Transfer(format!("failed to initialize xz decoder: {e}"))
                    })?;
            self.lzma = Some(stream);
        }

        self.open_disk_for_write()?;

        let payload = std::mem::take(&mut self.payload);
        self.write_compressed(&payload)
    }

    /// Idempotent. Creates the temp file next to the final cache path and
    /// turns off copy-on-write on it.
    fn open_disk_for_write(&mut self) -> Result<()> {
        if self.disk.is_some() {
            return Ok(());
        }

        let final_path =
            paths::cache_path(&self.image_root, &self.url, self.etag.as_deref());
        let temp_path = paths::tempfn_random(&final_path)?;

        let disk = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o644)
            .custom_flags(libc::O_NOCTTY)
            .open(&temp_path)
            .with_context(|| format!("failed to create {}", temp_path.display()))?;

        if let Err(e) = fsattr::set_nocow(&disk, true) {
            eprintln!(
                "warning: failed to set file attributes on {}: {e}",
                temp_path.display()
            );
        }

        self.final_path = Some(final_path);
        self.temp_path = Some(temp_path);
        self.disk = Some(disk);
        Ok(())
    }

    /// Account a chunk of (possibly compressed) body bytes and route it to
    /// the disk, through the decoder when the stream is XZ.
    fn write_compressed(&mut self, data: &[u8]) -> Result<()> {
        let total = self
            .written_compressed
            .checked_add(data.len() as u64)
            .ok_or(ImportError::Overflow)?;
        if let Some(limit) = self.content_length {
            if total > limit {
                return Err(ImportError::TooLarge { limit }.into());
            }
        }

        if !self.compressed {
            self.write_uncompressed(data)?;
        } else {
            let mut lzma = self.lzma.take().context("xz decoder not initialized")?;
            let r = self.decode_into_disk(&mut lzma, data);
            self.lzma = Some(lzma);
            r?;
        }

        self.written_compressed = total;
        Ok(())
    }

    fn decode_into_disk(&mut self, lzma: &mut Stream, data: &[u8]) -> Result<()> {
        let mut out = vec![0u8; DECODE_BUF_SIZE];
        let mut consumed = 0;

        while consumed < data.len() {
            let before_in = lzma.total_in();
            let before_out = lzma.total_out();

            let status = lzma
                .process(&data[consumed..], &mut out, Action::Run)
                .map_err(|e| ImportError::Transfer(format!("decompression failed: {e}")))?;
            if !matches!(status, Status::Ok | Status::StreamEnd) {
                return Err(ImportError::Transfer(
                    "decompression failed: unexpected decoder state".into(),
                )
                .into());
            }

            let read = (lzma.total_in() - before_in) as usize;
            let written = (lzma.total_out() - before_out) as usize;
            if written > 0 {
                self.write_uncompressed(&out[..written])?;
            }
            if read == 0 && written == 0 {
                return Err(
                    ImportError::Transfer("trailing data after xz stream".into()).into()
                );
            }
            consumed += read;
        }

        Ok(())
    }

    fn write_uncompressed(&mut self, data: &[u8]) -> Result<()> {
        let total = self
            .written_uncompressed
            .checked_add(data.len() as u64)
            .ok_or(ImportError::Overflow)?;
        if total > RAW_MAX_SIZE {
            return Err(ImportError::TooLarge {
                limit: RAW_MAX_SIZE,
            }
            .into());
        }

        let disk = self.disk.as_mut().context("target file not open")?;
        let n = sparse::sparse_write(disk, data, SPARSE_WINDOW)
            .context("failed to write image")?;
        if n < data.len() {
            return Err(ImportError::Transfer("short write".into()).into());
        }

        self.written_uncompressed = total;
        Ok(())
    }

    /// Turn the fully written temp file into the cached image.
    fn finalize(&mut self) -> Result<()> {
        self.check_cancelled()?;

        // The sparse writer may have seeked past the last write; pin the
        // file size to what was actually produced.
        let disk = self.disk.as_ref().context("target file not open")?;
        disk.set_len(self.written_uncompressed)
            .context("failed to truncate image")?;

        self.maybe_convert_qcow2()?;

        let disk = self.disk.as_ref().context("target file not open")?;
        if let Some(etag) = &self.etag {
            let _ = fsattr::set_xattr(disk, "user.source_etag", etag.as_bytes());
        }
        let _ = fsattr::set_xattr(disk, "user.source_url", self.url.as_bytes());

        if let Some(mtime) = self.mtime {
            let _ = fsattr::set_file_times(disk, mtime);
            let _ = fsattr::set_crtime(disk, mtime);
        }

        let meta = disk.metadata().context("failed to stat image")?;
        let _ = disk.set_permissions(fs::Permissions::from_mode(
            meta.permissions().mode() & 0o7444,
        ));

        self.check_cancelled()?;

        let temp_path = self.temp_path.as_ref().context("temp path not set")?;
        let final_path = self.final_path.as_ref().context("final path not set")?;
        fs::rename(temp_path, final_path).with_context(|| {
            format!("failed to move image into place at {}", final_path.display())
        })?;
        self.temp_path = None;

        if self.verbose {
            eprintln!("completed writing image {}", final_path.display());
        }
        Ok(())
    }

    /// Replace the temp file with a raw unpacking when it turns out to be a
    /// QCOW2 container.
    fn maybe_convert_qcow2(&mut self) -> Result<()> {
        let disk = self.disk.as_ref().context("target file not open")?;
        if !qcow2::probe(disk).context("failed to probe for qcow2")? {
            return Ok(());
        }

        let final_path = self.final_path.as_ref().context("final path not set")?;
        let converted_path = paths::tempfn_random(final_path)?;
        let converted = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o644)
            .custom_flags(libc::O_NOCTTY)
            .open(&converted_path)
            .with_context(|| format!("failed to create {}", converted_path.display()))?;

        if self.verbose {
            eprintln!("unpacking qcow2 image");
        }

        if let Err(e) = qcow2::convert(disk, &converted) {
            let _ = fs::remove_file(&converted_path);
            return Err(e.context("failed to convert qcow2 image"));
        }

        if let Some(old) = self.temp_path.take() {
            let _ = fs::remove_file(&old);
        }
        self.temp_path = Some(converted_path);
        self.disk = Some(converted);
        Ok(())
    }

    /// Terminal success: materialize the writable copy if one was requested,
    /// then let go of the descriptor.
    fn finish_success(&mut self) -> Result<()> {
        self.make_local_copy()?;
        self.disk = None;
        Ok(())
    }

    fn make_local_copy(&mut self) -> Result<()> {
        let Some(local) = self.local.clone() else {
            return Ok(());
        };

        // Copy from the open descriptor when there is one; after a
        // short-circuited download there is none, so reopen the cached image.
        match self.disk.as_mut() {
            Some(disk) => {
                disk.seek(SeekFrom::Start(0))
                    .context("failed to seek image")?;
            }
            None => {
                let path =
                    paths::cache_path(&self.image_root, &self.url, self.etag.as_deref());
                let f = File::open(&path).with_context(|| {
                    format!("failed to open cached image {}", path.display())
                })?;
                self.disk = Some(f);
            }
        }
        let source = self.disk.as_mut().context("image not open")?;

        let dest = paths::local_path(&self.image_root, &local);
        if self.force_local {
            let _ = fsattr::force_remove(&dest);
        }

        let temp = paths::tempfn_random(&dest)?;
        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o664)
            .custom_flags(libc::O_NOCTTY)
            .open(&temp)
            .with_context(|| {
                format!("failed to create writable copy at {}", temp.display())
            })?;

        if let Err(e) = fsattr::set_nocow(&out, true) {
            eprintln!(
                "warning: failed to set file attributes on {}: {e}",
                temp.display()
            );
        }

        if let Err(e) = io::copy(source, &mut out) {
            let _ = fs::remove_file(&temp);
            return Err(e)
                .with_context(|| format!("failed to write {}", temp.display()));
        }

        let _ = fsattr::copy_times(source, &out);
        let _ = fsattr::copy_xattrs(source, &out);

        drop(out);

        if let Err(e) = fs::rename(&temp, &dest) {
            let _ = fs::remove_file(&temp);
            return Err(e).with_context(|| {
                format!("failed to move writable image into place at {}", dest.display())
            });
        }

        if self.verbose {
            eprintln!("created new local image {}", dest.display());
        }
        Ok(())
    }

    /// Emit a progress line when at least a second has passed since the last
    /// one and the percentage moved. Once the transfer is over a second old,
    /// include the projected time left.
    fn report_progress(&mut self) {
        let Some(total) = self.content_length else {
            return;
        };
        if total == 0 {
            return;
        }

        let dlnow = self.written_compressed;
        let percent = 100 * dlnow / total;
        let now = Instant::now();

        let due = match self.last_status {
            Some(last) => now.duration_since(last) >= Duration::from_secs(1),
            None => true,
        };
        if !due || percent == self.progress_percent {
            return;
        }

        let elapsed = now.duration_since(self.start);
        if self.verbose {
            if elapsed >= Duration::from_secs(1) && dlnow > 0 {
                let done = elapsed.as_secs_f64();
                let left = (done * total as f64 / dlnow as f64 - done).max(0.0);
                eprintln!(
                    "got {percent}%, {} left",
                    format_duration(Duration::from_secs_f64(left))
                );
            } else {
                eprintln!("got {percent}%");
            }
        }

        self.progress_percent = percent;
        self.last_status = Some(now);
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(ImportError::Cancelled.into());
        }
        Ok(())
    }
}

impl Drop for Download {
    fn drop(&mut self) {
        if let Some(temp) = self.temp_path.take() {
            let _ = fs::remove_file(&temp);
        }
    }
}

fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if n < 1024 {
        return format!("{n} B");
    }
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}min", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}min {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
