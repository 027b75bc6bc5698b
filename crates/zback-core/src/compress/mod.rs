use std::io::{Read, Write};

use crate::error::{Result, ZbackError};

/// Compression codec applied to each volume before encryption and upload.
///
/// The codec id is recorded in the manifest so restore can pick the inverse
/// without guessing from object keys. `None` is the identity stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    None,
    Gzip {
        level: u32,
    },
    Xz {
        level: u32,
    },
    Zstd {
        level: i32,
    },
    Lz4,
}

impl Default for Compressor {
    fn default() -> Self {
        Compressor::Gzip { level: 6 }
    }
}

impl Compressor {
    /// Parse the `--compressor` / `--compression-level` flag pair.
    pub fn from_flag(name: &str, level: Option<i32>) -> Result<Self> {
        match name {
            "none" | "off" => Ok(Compressor::None),
            "gzip" => {
                let level = level.unwrap_or(6);
                if !(0..=9).contains(&level) {
                    return Err(ZbackError::InvalidInput(format!(
                        "gzip level must be 0-9, got {level}"
                    )));
                }
                Ok(Compressor::Gzip { level: level as u32 })
            }
            "xz" => {
                let level = level.unwrap_or(6);
                if !(0..=9).contains(&level) {
                    return Err(ZbackError::InvalidInput(format!(
                        "xz level must be 0-9, got {level}"
                    )));
                }
                Ok(Compressor::Xz { level: level as u32 })
            }
            "zstd" => {
                let level = level.unwrap_or(3);
                if !(1..=22).contains(&level) {
                    return Err(ZbackError::InvalidInput(format!(
                        "zstd level must be 1-22, got {level}"
                    )));
                }
                Ok(Compressor::Zstd { level })
            }
            "lz4" => Ok(Compressor::Lz4),
            other => Err(ZbackError::InvalidInput(format!(
                "unknown compressor: '{other}'"
            ))),
        }
    }

    /// Codec id recorded in the manifest.
    pub fn id(&self) -> &'static str {
        match self {
            Compressor::None => "none",
            Compressor::Gzip { .. } => "gzip",
            Compressor::Xz { .. } => "xz",
            Compressor::Zstd { .. } => "zstd",
            Compressor::Lz4 => "lz4",
        }
    }

    /// Object key extension for the compressed payload.
    pub fn extension(&self) -> &'static str {
        match self {
            Compressor::None => "",
            Compressor::Gzip { .. } => ".gz",
            Compressor::Xz { .. } => ".xz",
            Compressor::Zstd { .. } => ".zst",
            Compressor::Lz4 => ".lz4",
        }
    }

    /// Wrap `inner` in a streaming encoder.
    pub fn writer<'a>(
        &self,
        inner: Box<dyn Write + Send + 'a>,
    ) -> Result<Box<dyn FinishingWriter + Send + 'a>> {
        Ok(match *self {
            Compressor::None => Box::new(IdentityWriter(inner)),
            Compressor::Gzip { level } => Box::new(flate2::write::GzEncoder::new(
                inner,
                flate2::Compression::new(level),
            )),
            Compressor::Xz { level } => Box::new(xz2::write::XzEncoder::new(inner, level)),
            Compressor::Zstd { level } => Box::new(
                zstd::stream::write::Encoder::new(inner, level)
                    .map_err(|e| ZbackError::Other(format!("zstd init: {e}")))?,
            ),
            Compressor::Lz4 => Box::new(lz4_flex::frame::FrameEncoder::new(inner)),
        })
    }
}

/// Wrap `inner` in the streaming decoder for a manifest codec id.
pub fn reader_for_id(id: &str, inner: Box<dyn Read + Send>) -> Result<Box<dyn Read + Send>> {
    Ok(match id {
        "none" => inner,
        "gzip" => Box::new(flate2::read::MultiGzDecoder::new(inner)),
        "xz" => Box::new(xz2::read::XzDecoder::new(inner)),
        "zstd" => Box::new(
            zstd::stream::read::Decoder::new(inner)
                .map_err(|e| ZbackError::Decompression(format!("zstd init: {e}")))?,
        ),
        "lz4" => Box::new(lz4_flex::frame::FrameDecoder::new(inner)),
        other => {
            return Err(ZbackError::InvalidInput(format!(
                "manifest names unknown compressor '{other}'"
            )))
        }
    })
}

/// A streaming encoder that must be explicitly finished so trailing codec
/// frames reach the inner writer.
pub trait FinishingWriter: Write {
    fn finish(self: Box<Self>) -> Result<()>;
}

struct IdentityWriter<'a>(Box<dyn Write + Send + 'a>);

impl Write for IdentityWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl FinishingWriter for IdentityWriter<'_> {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.0.flush()?;
        Ok(())
    }
}

impl<'a> FinishingWriter for flate2::write::GzEncoder<Box<dyn Write + Send + 'a>> {
    fn finish(self: Box<Self>) -> Result<()> {
        let mut inner = (*self).finish()?;
        inner.flush()?;
        Ok(())
    }
}

impl<'a> FinishingWriter for xz2::write::XzEncoder<Box<dyn Write + Send + 'a>> {
    fn finish(self: Box<Self>) -> Result<()> {
        let mut inner = (*self).finish()?;
        inner.flush()?;
        Ok(())
    }
}

impl<'a> FinishingWriter for zstd::stream::write::Encoder<'static, Box<dyn Write + Send + 'a>> {
    fn finish(self: Box<Self>) -> Result<()> {
        let mut inner = (*self).finish()?;
        inner.flush()?;
        Ok(())
    }
}

impl<'a> FinishingWriter for lz4_flex::frame::FrameEncoder<Box<dyn Write + Send + 'a>> {
    fn finish(self: Box<Self>) -> Result<()> {
        let mut inner = (*self)
            .finish()
            .map_err(|e| ZbackError::Other(format!("lz4 finish: {e}")))?;
        inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(codec: Compressor, payload: &[u8]) -> Vec<u8> {
        let mut encoded: Vec<u8> = Vec::new();
        {
            let mut w = codec
                .writer(Box::new(std::io::Cursor::new(&mut encoded)))
                .unwrap();
            w.write_all(payload).unwrap();
            w.finish().unwrap();
        }
        let source: Box<dyn Read + Send> = Box::new(std::io::Cursor::new(encoded));
        let mut decoded = Vec::new();
        reader_for_id(codec.id(), source)
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();
        decoded
    }

    #[test]
    fn gzip_roundtrip() {
        let payload = b"a zfs send stream stand-in, compressible aaaaaaaaaaaaaaaa".repeat(64);
        assert_eq!(roundtrip(Compressor::Gzip { level: 6 }, &payload), payload);
    }

    #[test]
    fn zstd_roundtrip() {
        let payload = vec![7u8; 128 * 1024];
        assert_eq!(roundtrip(Compressor::Zstd { level: 3 }, &payload), payload);
    }

    #[test]
    fn lz4_and_identity_roundtrip() {
        let payload = b"short".to_vec();
        assert_eq!(roundtrip(Compressor::Lz4, &payload), payload);
        assert_eq!(roundtrip(Compressor::None, &payload), payload);
    }

    #[test]
    fn flag_parsing() {
        assert_eq!(
            Compressor::from_flag("zstd", Some(7)).unwrap(),
            Compressor::Zstd { level: 7 }
        );
        assert_eq!(
            Compressor::from_flag("gzip", None).unwrap(),
            Compressor::Gzip { level: 6 }
        );
        assert_eq!(Compressor::from_flag("none", None).unwrap(), Compressor::None);
        assert!(Compressor::from_flag("brotli", None).is_err());
        assert!(Compressor::from_flag("gzip", Some(12)).is_err());
    }

    #[test]
    fn extensions_match_ids() {
        assert_eq!(Compressor::Xz { level: 2 }.extension(), ".xz");
        assert_eq!(Compressor::None.extension(), "");
        assert_eq!(Compressor::Lz4.id(), "lz4");
    }

    #[test]
    fn unknown_id_is_rejected_on_restore() {
        let source: Box<dyn Read + Send> = Box::new(std::io::Cursor::new(Vec::new()));
        assert!(reader_for_id("sna", source).is_err());
    }
}
