//! Hole-preserving file writes.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};

/// Write `buf` at the current position of `f`, seeking over runs of zero
/// bytes of at least `window` bytes instead of writing them.
///
/// A trailing hole does not extend the file, so the caller must truncate the
/// file to its logical size once all writes are done.
pub fn sparse_write(f: &mut File, buf: &[u8], window: usize) -> io::Result<usize> {
    debug_assert!(window > 0);

    let mut off = 0;
    while off < buf.len() {
        let zeros = count_zeros(&buf[off..]);
        if zeros >= window {
            f.seek(SeekFrom::Current(zeros as i64))?;
            off += zeros;
            continue;
        }

        // Write up to the start of the next hole-worthy zero run.
        let mut end = off + zeros;
        while end < buf.len() {
            let run = count_zeros(&buf[end..]);
            if run >= window {
                break;
            }
            end += run;
            end += buf[end..].iter().take_while(|&&b| b != 0).count();
        }
        f.write_all(&buf[off..end])?;
        off = end;
    }

    Ok(buf.len())
}

fn count_zeros(buf: &[u8]) -> usize {
    buf.iter().take_while(|&&b| b == 0).count()
}
