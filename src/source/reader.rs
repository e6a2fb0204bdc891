//! Decompress a stored file and split it into raw lines.

use bytes::Bytes;
use chrono::NaiveDate;
use snafu::prelude::*;
use std::borrow::Cow;
use std::io::Read;
use tracing::debug;

use crate::config::CompressionFormat;
use crate::emit;
use crate::error::{GzipDecompressionSnafu, ReaderError, ZstdDecompressionSnafu};
use crate::metrics::events::BytesRead;
use crate::record::RawLine;

/// Turns file contents into [`RawLine`]s.
#[derive(Debug, Clone, Copy)]
pub struct LineReader {
    compression: CompressionFormat,
}

impl LineReader {
    pub fn new(compression: CompressionFormat) -> Self {
        Self { compression }
    }

    /// Decompress `data` according to the configured format.
    pub fn decompress<'a>(&self, data: &'a [u8], path: &str) -> Result<Cow<'a, [u8]>, ReaderError> {
        emit!(BytesRead {
            bytes: data.len() as u64,
        });

        let decompressed = match self.compression {
            CompressionFormat::None => return Ok(Cow::Borrowed(data)),
            CompressionFormat::Gzip => {
                let mut decoder = flate2::read::GzDecoder::new(data);
                let mut buf = Vec::new();
                decoder
                    .read_to_end(&mut buf)
                    .context(GzipDecompressionSnafu { path })?;
                buf
            }
            CompressionFormat::Zstd => {
                zstd::decode_all(data).context(ZstdDecompressionSnafu { path })?
            }
        };

        debug!(
            "Decompressed {} -> {} bytes for {}",
            data.len(),
            decompressed.len(),
            path
        );
        Ok(Cow::Owned(decompressed))
    }

    /// Split a file into lines numbered from 1.
    ///
    /// `\r\n` and `\n` both end a line; a trailing newline does not start an
    /// extra empty line. Lines are handed on as bytes, unvalidated, so
    /// fixed-width positions survive bytes that are not UTF-8.
    pub fn read(
        &self,
        data: &Bytes,
        file_id: &str,
        business_day: NaiveDate,
    ) -> Result<Vec<RawLine>, ReaderError> {
        let content = match self.decompress(data, file_id)? {
            Cow::Borrowed(_) => data.clone(),
            Cow::Owned(decompressed) => Bytes::from(decompressed),
        };
        Ok(split_lines(&content)
            .enumerate()
            .map(|(i, line)| RawLine {
                file_id: file_id.to_string(),
                line_number: i as u64 + 1,
                content: content.slice_ref(line),
                business_day,
            })
            .collect())
    }

    /// Number of lines `read` would produce.
    pub fn count_lines(&self, data: &Bytes, path: &str) -> Result<u64, ReaderError> {
        let content = self.decompress(data, path)?;
        Ok(split_lines(&content).count() as u64)
    }
}

fn split_lines(content: &[u8]) -> impl Iterator<Item = &[u8]> {
    let body = content.strip_suffix(b"\n").unwrap_or(content);
    let empty = content.is_empty();
    body.split(|b| *b == b'\n')
        .filter(move |_| !empty)
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}
