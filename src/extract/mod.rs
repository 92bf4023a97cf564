mod tar;

pub use tar::extract_tar;

use std::io::{BufReader, Read};

use flate2::read::GzDecoder;

/// Bytes sniffed from the head of the stream to pick a decompressor.
pub(crate) const PEEK_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Compression {
    Plain,
    Gzip,
    Zstd,
    Xz,
}

impl Compression {
    pub(crate) fn detect(data: &[u8]) -> Self {
        match data {
            [0x1f, 0x8b, ..] => Self::Gzip,
            [0x28, 0xb5, 0x2f, 0xfd, ..] => Self::Zstd,
            [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00, ..] => Self::Xz,
            _ => Self::Plain,
        }
    }

    pub(crate) fn decoder<R: Read>(self, reader: R) -> std::io::Result<Decoder<R>> {
        Ok(match self {
            Self::Plain => Decoder::Plain(reader),
            Self::Gzip => Decoder::Gzip(Box::new(GzDecoder::new(reader))),
            Self::Zstd => Decoder::Zstd(Box::new(zstd::stream::Decoder::new(reader)?)),
            Self::Xz => Decoder::Xz(Box::new(xz2::read::XzDecoder::new(reader))),
        })
    }
}

pub(crate) enum Decoder<R: Read> {
    Plain(R),
    Gzip(Box<GzDecoder<R>>),
    Zstd(Box<zstd::stream::Decoder<'static, BufReader<R>>>),
    Xz(Box<xz2::read::XzDecoder<R>>),
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::Gzip(r) => r.read(buf),
            Self::Zstd(r) => r.read(buf),
            Self::Xz(r) => r.read(buf),
        }
    }
}
