//! Streaming compression of stored objects.
//!
//! The method used for an object is encoded in its extension, so readers
//! select the decompressor from the object name rather than from settings.

use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    #[default]
    Lz4,
    Zstd,
    None,
}

impl CompressionMethod {
    pub const ALL: [CompressionMethod; 3] = [Self::Lz4, Self::Zstd, Self::None];

    /// Object-name extension, without the dot. Empty for uncompressed data.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Lz4 => "lz4",
            Self::Zstd => "zst",
            Self::None => "",
        }
    }

    pub fn object_name(self, base: &str) -> String {
        match self {
            Self::None => base.to_string(),
            _ => format!("{base}.{}", self.extension()),
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.extension() == ext)
    }

    /// Method of a stored object together with the name it had before compression.
    pub fn from_object_name(name: &str) -> (Self, &str) {
        if let Some((base, ext)) = name.rsplit_once('.') {
            if let Some(method) = Self::from_extension(ext).filter(|m| *m != Self::None) {
                return (method, base);
            }
        }
        (Self::None, name)
    }

    pub fn compressor<W: Write>(self, inner: W) -> Result<Compressor<W>> {
        Ok(match self {
            Self::Lz4 => Compressor::Lz4(lz4_flex::frame::FrameEncoder::new(inner)),
            Self::Zstd => Compressor::Zstd(zstd::Encoder::new(inner, ZSTD_LEVEL)?),
            Self::None => Compressor::Plain(inner),
        })
    }

    pub fn decompressor<'a, R: Read + Send + 'a>(self, inner: R) -> Result<Box<dyn Read + Send + 'a>> {
        Ok(match self {
            Self::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(inner)),
            Self::Zstd => Box::new(zstd::Decoder::with_buffer(BufReader::new(inner))?),
            Self::None => Box::new(inner),
        })
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
            Self::None => "none",
        })
    }
}

impl FromStr for CompressionMethod {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lz4" => Ok(Self::Lz4),
            "zstd" | "zst" => Ok(Self::Zstd),
            "none" | "" => Ok(Self::None),
            other => Err(Error::UnsupportedCompression(other.to_string())),
        }
    }
}

/// Writer compressing into `W`. `finish` must be called to flush the frame.
pub enum Compressor<W: Write> {
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
    Plain(W),
}

impl<W: Write> Compressor<W> {
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Lz4(encoder) => encoder.finish().map_err(io::Error::other),
            Self::Zstd(encoder) => encoder.finish(),
            Self::Plain(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
        }
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Lz4(encoder) => encoder.write(buf),
            Self::Zstd(encoder) => encoder.write(buf),
            Self::Plain(inner) => inner.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Lz4(encoder) => encoder.flush(),
            Self::Zstd(encoder) => encoder.flush(),
            Self::Plain(inner) => inner.flush(),
        }
    }
}
