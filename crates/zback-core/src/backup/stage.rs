use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::backup::splitter::RawVolume;
use crate::compress::Compressor;
use crate::crypto::VolumeCipher;
use crate::digest::{DigestWriter, PayloadDigests};
use crate::error::Result;

/// A volume whose payload is finalized on disk and ready for fan-out.
#[derive(Debug)]
pub(crate) struct StagedVolume {
    pub index: u64,
    pub raw_size: u64,
    pub digests: PayloadDigests,
    pub path: PathBuf,
}

pub(crate) fn payload_path(working_dir: &Path, job_tag: &str, index: u64) -> PathBuf {
    working_dir.join(format!("{job_tag}.v{index}.payload"))
}

/// Run one volume through the stage chain:
/// spill file → compressor → sign/encrypt → digest tee → payload file.
///
/// Digests cover the final bytes, because those are what the backend stores
/// and what its server-side MD5 check will see. The raw spill file is
/// deleted here; the payload file is the scheduler's to delete after every
/// destination has acknowledged it.
///
/// The chain is streaming except for the OpenPGP stage, which materializes
/// the (already compressed) volume once, as an rpgp message built in
/// memory. That holds the per-worker footprint to O(compressed volume).
pub(crate) fn stage_volume(
    raw: RawVolume,
    compressor: Compressor,
    cipher: Option<&VolumeCipher>,
    working_dir: &Path,
    job_tag: &str,
) -> Result<StagedVolume> {
    let out_path = payload_path(working_dir, job_tag, raw.index);
    let result = stage_inner(&raw, compressor, cipher, &out_path);

    // The spill file is consumed regardless of outcome; on error the
    // half-written payload must not linger either.
    let _ = std::fs::remove_file(&raw.path);
    if result.is_err() {
        let _ = std::fs::remove_file(&out_path);
    }

    let digests = result?;
    debug!(
        "staged volume {} ({} -> {} bytes)",
        raw.index, raw.raw_size, digests.len
    );
    Ok(StagedVolume {
        index: raw.index,
        raw_size: raw.raw_size,
        digests,
        path: out_path,
    })
}

fn stage_inner(
    raw: &RawVolume,
    compressor: Compressor,
    cipher: Option<&VolumeCipher>,
    out_path: &Path,
) -> Result<PayloadDigests> {
    let mut source = File::open(&raw.path)?;
    let out = File::create(out_path)?;
    let mut digest_writer = DigestWriter::new(out);

    match cipher {
        None => {
            // Fully streaming: compressor writes straight into the tee.
            let mut encoder = compressor.writer(Box::new(&mut digest_writer))?;
            std::io::copy(&mut source, &mut encoder)?;
            encoder.finish()?;
        }
        Some(cipher) => {
            // Compress to memory, seal as one OpenPGP message, tee it out.
            let mut compressed = Vec::new();
            {
                let mut encoder = compressor.writer(Box::new(&mut compressed))?;
                std::io::copy(&mut source, &mut encoder)?;
                encoder.finish()?;
            }
            let sealed = cipher.seal(&compressed)?;
            digest_writer.write_all(&sealed)?;
        }
    }

    let (out, digests) = digest_writer.finalize()?;
    out.sync_all()?;
    Ok(digests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_of;

    fn raw_volume(dir: &Path, index: u64, data: &[u8]) -> RawVolume {
        let path = dir.join(format!("test.v{index}.spill"));
        std::fs::write(&path, data).unwrap();
        RawVolume {
            index,
            raw_size: data.len() as u64,
            path,
        }
    }

    #[test]
    fn stages_identity_payload_with_digests_over_final_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_volume(dir.path(), 0, b"send stream bytes");

        let staged =
            stage_volume(raw, Compressor::None, None, dir.path(), "test").unwrap();

        let payload = std::fs::read(&staged.path).unwrap();
        assert_eq!(payload, b"send stream bytes");
        assert_eq!(staged.digests.len, payload.len() as u64);
        assert_eq!(staged.digests.sha256, sha256_of(&payload));
        assert_eq!(staged.raw_size, 17);
    }

    #[test]
    fn staged_payload_decompresses_back_to_the_spill() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = b"compressible ".repeat(1000);
        let raw = raw_volume(dir.path(), 3, &data);

        let staged = stage_volume(
            raw,
            Compressor::Zstd { level: 3 },
            None,
            dir.path(),
            "test",
        )
        .unwrap();

        let payload = std::fs::read(&staged.path).unwrap();
        assert!(payload.len() < data.len());
        // Digest is over the compressed payload, not the raw stream.
        assert_eq!(staged.digests.sha256, sha256_of(&payload));

        let mut decoded = Vec::new();
        crate::compress::reader_for_id("zstd", Box::new(std::io::Cursor::new(payload)))
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn spill_file_is_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_volume(dir.path(), 1, b"data");
        let spill = raw.path.clone();
        let staged = stage_volume(raw, Compressor::Lz4, None, dir.path(), "test").unwrap();
        assert!(!spill.exists());
        assert!(staged.path.exists());
    }
}
