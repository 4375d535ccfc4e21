//! Minimal QCOW2 support: detection and conversion to a raw image.
//!
//! Handles version 2 and 3 images with standard clusters, which is what
//! cloud vendors publish. Encryption, backing files, compressed clusters,
//! and images carrying incompatible feature bits are rejected. Unallocated
//! and zero clusters become holes in the output.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use anyhow::{bail, Context, Result};

/// QCOW2 magic bytes: "QFI\xfb".
const QCOW2_MAGIC: u32 = 0x5146_49fb;

const QCOW2_CRYPT_NONE: u32 = 0;

/// Compressed-cluster marker in L2 entries.
const QCOW2_OFLAG_COMPRESSED: u64 = 1 << 62;
/// Reads-as-zero marker in version 3 L2 entries.
const QCOW2_OFLAG_ZERO: u64 = 1;

/// Host-offset bits of an L1/L2 entry.
const QCOW2_OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;

struct Header {
    version: u32,
    backing_file_offset: u64,
    cluster_bits: u32,
    size: u64,
    crypt_method: u32,
    l1_size: u32,
    l1_table_offset: u64,
    incompatible_features: u64,
}

/// Report whether the open file is a QCOW2 image. Uses positioned reads, so
/// the file offset is left alone. A file too short for the header is simply
/// not QCOW2.
pub fn probe(f: &File) -> io::Result<bool> {
    let mut buf = [0u8; 8];
    match f.read_exact_at(&mut buf, 0) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e),
    }
    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok(magic == QCOW2_MAGIC && (version == 2 || version == 3))
}

/// Unpack the QCOW2 image in `src` into `dst` as a raw image.
///
/// The destination is sized to the virtual disk first; only allocated,
/// non-zero clusters are written, so the output stays sparse.
pub fn convert(src: &File, dst: &File) -> Result<()> {
    let h = read_header(src)?;

    if h.backing_file_offset != 0 {
        bail!("qcow2 images with backing files are not supported");
    }
    if h.crypt_method != QCOW2_CRYPT_NONE {
        bail!("encrypted qcow2 images are not supported");
    }
    if h.incompatible_features != 0 {
        bail!("qcow2 image uses unsupported incompatible features");
    }
    if !(9..=21).contains(&h.cluster_bits) {
        bail!("invalid qcow2 cluster size (2^{} bytes)", h.cluster_bits);
    }

    let cluster_size = 1u64 << h.cluster_bits;
    let l2_entries = cluster_size / 8;

    dst.set_len(h.size)
        .context("failed to size raw image")?;

    let mut l1 = vec![0u8; h.l1_size as usize * 8];
    src.read_exact_at(&mut l1, h.l1_table_offset)
        .context("failed to read qcow2 L1 table")?;

    let mut l2 = vec![0u8; cluster_size as usize];
    let mut cluster = vec![0u8; cluster_size as usize];

    for (i, l1e) in l1.chunks_exact(8).enumerate() {
        let l2_offset = be64(l1e) & QCOW2_OFFSET_MASK;
        if l2_offset == 0 {
            continue;
        }

        src.read_exact_at(&mut l2, l2_offset)
            .context("failed to read qcow2 L2 table")?;

        for (j, l2e) in l2.chunks_exact(8).enumerate() {
            let l2e = be64(l2e);
            if l2e & QCOW2_OFLAG_COMPRESSED != 0 {
                bail!("compressed qcow2 clusters are not supported");
            }
            if h.version >= 3 && l2e & QCOW2_OFLAG_ZERO != 0 {
                continue;
            }
            let host = l2e & QCOW2_OFFSET_MASK;
            if host == 0 {
                continue;
            }

            let guest = (i as u64 * l2_entries + j as u64) * cluster_size;
            if guest >= h.size {
                break;
            }

            let n = (h.size - guest).min(cluster_size) as usize;
            src.read_exact_at(&mut cluster[..n], host)
                .context("failed to read qcow2 cluster")?;
            if cluster[..n].iter().any(|&b| b != 0) {
                dst.write_all_at(&cluster[..n], guest)
                    .context("failed to write raw cluster")?;
            }
        }
    }

    Ok(())
}

fn read_header(f: &File) -> Result<Header> {
    let mut buf = [0u8; 80];
    f.read_exact_at(&mut buf, 0)
        .context("failed to read qcow2 header")?;

    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != QCOW2_MAGIC {
        bail!("not a qcow2 image");
    }
    let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if version != 2 && version != 3 {
        bail!("unsupported qcow2 version {version}");
    }

    Ok(Header {
        version,
        backing_file_offset: be64(&buf[8..16]),
        cluster_bits: u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]),
        size: be64(&buf[24..32]),
        crypt_method: u32::from_be_bytes([buf[32], buf[33], buf[34], buf[35]]),
        l1_size: u32::from_be_bytes([buf[36], buf[37], buf[38], buf[39]]),
        l1_table_offset: be64(&buf[40..48]),
        incompatible_features: if version >= 3 { be64(&buf[72..80]) } else { 0 },
    })
}

fn be64(b: &[u8]) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(b);
    u64::from_be_bytes(a)
}

/// Build an in-memory version 3 QCOW2 image holding `payload` at guest
/// offset 0, for tests elsewhere in the crate.
#[cfg(test)]
pub(crate) fn build_test_image(payload: &[u8]) -> Vec<u8> {
    const CLUSTER_BITS: u32 = 12;
    const CLUSTER: usize = 1 << CLUSTER_BITS;
    assert!(payload.len() <= CLUSTER, "test image is single-cluster");

    // Layout: header cluster, L1 table, L2 table, one data cluster.
    let l1_offset = CLUSTER as u64;
    let l2_offset = 2 * CLUSTER as u64;
    let data_offset = 3 * CLUSTER as u64;
    let copied = 1u64 << 63;

    let mut img = vec![0u8; 4 * CLUSTER];
    img[0..4].copy_from_slice(&QCOW2_MAGIC.to_be_bytes());
    img[4..8].copy_from_slice(&3u32.to_be_bytes());
    img[20..24].copy_from_slice(&CLUSTER_BITS.to_be_bytes());
    img[24..32].copy_from_slice(&(payload.len() as u64).to_be_bytes());
    img[36..40].copy_from_slice(&1u32.to_be_bytes()); // l1_size
    img[40..48].copy_from_slice(&l1_offset.to_be_bytes());
    img[96..100].copy_from_slice(&4u32.to_be_bytes()); // refcount_order
    img[100..104].copy_from_slice(&104u32.to_be_bytes()); // header_length

    img[CLUSTER..CLUSTER + 8].copy_from_slice(&(l2_offset | copied).to_be_bytes());
    img[2 * CLUSTER..2 * CLUSTER + 8]
        .copy_from_slice(&(data_offset | copied).to_be_bytes());
    img[3 * CLUSTER..3 * CLUSTER + payload.len()].copy_from_slice(payload);
    img
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::path::PathBuf;

    fn temp_file(tag: &str, contents: &[u8]) -> (PathBuf, File) {
        let path = std::env::temp_dir().join(format!(
            "imgpull-test-qcow2-{tag}-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = fs::remove_file(&path);
        let mut f = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        f.write_all(contents).unwrap();
        (path, f)
    }

    #[test]
    fn test_probe() {
        let payload = vec![0xabu8; 512];
        let (path, f) = temp_file("probe-yes", &build_test_image(&payload));
        assert!(probe(&f).unwrap());
        let _ = fs::remove_file(&path);

        let (path, f) = temp_file("probe-no", b"QFI\xfbXXXX");
        // Magic matches but the version is garbage.
        assert!(!probe(&f).unwrap());
        let _ = fs::remove_file(&path);

        let (path, f) = temp_file("probe-short", b"QFI");
        assert!(!probe(&f).unwrap());
        let _ = fs::remove_file(&path);

        let (path, f) = temp_file("probe-raw", &vec![0u8; 4096]);
        assert!(!probe(&f).unwrap());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_convert_single_cluster() {
        let mut payload = vec![0u8; 4096];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let (src_path, src) = temp_file("conv-src", &build_test_image(&payload));
        let (dst_path, dst) = temp_file("conv-dst", b"");

        convert(&src, &dst).unwrap();

        assert_eq!(dst.metadata().unwrap().len(), 4096);
        let mut out = vec![0u8; 4096];
        dst.read_exact_at(&mut out, 0).unwrap();
        assert_eq!(out, payload);

        let _ = fs::remove_file(&src_path);
        let _ = fs::remove_file(&dst_path);
    }

    #[test]
    fn test_convert_unallocated_reads_zero() {
        // An image whose L1 entry is empty: the whole disk reads as zeros.
        let mut img = build_test_image(&[1u8; 16]);
        let cluster = 4096;
        for b in &mut img[cluster..cluster + 8] {
            *b = 0;
        }
        let (src_path, src) = temp_file("unalloc-src", &img);
        let (dst_path, dst) = temp_file("unalloc-dst", b"");

        convert(&src, &dst).unwrap();

        assert_eq!(dst.metadata().unwrap().len(), 16);
        let mut out = vec![0xffu8; 16];
        dst.read_exact_at(&mut out, 0).unwrap();
        assert_eq!(out, vec![0u8; 16]);

        let _ = fs::remove_file(&src_path);
        let _ = fs::remove_file(&dst_path);
    }

    #[test]
    fn test_convert_rejects_compressed_clusters() {
        let mut img = build_test_image(&[2u8; 16]);
        let l2 = 2 * 4096;
        let entry = be64(&img[l2..l2 + 8]) | QCOW2_OFLAG_COMPRESSED;
        img[l2..l2 + 8].copy_from_slice(&entry.to_be_bytes());
        let (src_path, src) = temp_file("compressed-src", &img);
        let (dst_path, dst) = temp_file("compressed-dst", b"");

        let err = convert(&src, &dst).unwrap_err();
        assert!(err.to_string().contains("compressed"));

        let _ = fs::remove_file(&src_path);
        let _ = fs::remove_file(&dst_path);
    }

    #[test]
    fn test_convert_rejects_encryption() {
        let mut img = build_test_image(&[3u8; 16]);
        img[32..36].copy_from_slice(&1u32.to_be_bytes()); // AES
        let (src_path, src) = temp_file("crypt-src", &img);
        let (dst_path, dst) = temp_file("crypt-dst", b"");

        let err = convert(&src, &dst).unwrap_err();
        assert!(err.to_string().contains("encrypted"));

        let _ = fs::remove_file(&src_path);
        let _ = fs::remove_file(&dst_path);
    }
}
