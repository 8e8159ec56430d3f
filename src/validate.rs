//! Block-aligned, hash-verifying read over one package entry.
//!
//! A [`ValidatingStream`] never hands a caller a byte whose containing block
//! has not been hashed and compared against the block map. A mismatch
//! poisons the stream: every later read or seek also fails.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::block_map::{BlockMapFile, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, Sha256Algorithm};
use crate::zip_source::{PackageSource, ZipContainer, ZipEntryInfo};

/// A read-only, seekable stream over one package entry's plaintext, verified
/// block by block against its [`BlockMapFile`].
///
/// Each block is fetched on demand through [`ZipContainer::read_window`]:
/// at most one block's worth of plaintext is ever held in memory, regardless
/// of the entry's total size.
pub struct ValidatingStream<S: PackageSource> {
    zip: Arc<ZipContainer<S>>,
    file_name: String,
    blocks: Vec<crate::block_map::Block>,
    uncompressed_size: u64,
    compressed_size: u64,
    compression_checked: bool,
    /// Plaintext of the block named by `window_block_index`, if any.
    window: Vec<u8>,
    window_block_index: Option<usize>,
    position: u64,
    /// Number of leading blocks already hashed and confirmed good.
    validated_through: usize,
    poisoned: bool,
}

impl<S: PackageSource> ValidatingStream<S> {
    /// Wraps `zip`'s view of `file`'s entry for verification against
    /// `file`'s declared blocks.
    ///
    /// Checks only the uncompressed length here; the compressed-size
    /// cross-check against the block map's declared per-block sizes is
    /// deferred to the first read (see [`check_compression`](Self::check_compression)),
    /// since it is not needed to serve any byte and `PackageReader::open` is
    /// documented to fail only with [`Error::NotFound`] or
    /// [`Error::ZipFormatError`].
    pub(crate) fn new(
        zip: Arc<ZipContainer<S>>,
        file: &BlockMapFile,
        info: &ZipEntryInfo,
    ) -> Result<Self> {
        if info.uncompressed_size != file.uncompressed_size() {
            return Err(Error::ZipFormatError(format!(
                "{:?}: zip entry has {} uncompressed bytes, block map declares {}",
                file.name(),
                info.uncompressed_size,
                file.uncompressed_size()
            )));
        }

        Ok(Self {
            zip,
            file_name: file.name().to_string(),
            blocks: file.blocks().to_vec(),
            uncompressed_size: file.uncompressed_size(),
            compressed_size: info.compressed_size,
            compression_checked: false,
            window: Vec::new(),
            window_block_index: None,
            position: 0,
            validated_through: 0,
            poisoned: false,
        })
    }

    /// Checks the block map's declared per-block compressed sizes against
    /// the ZIP entry's actual compressed length, once, on first use. A
    /// mismatch here means the block map was built against a different
    /// encoding of this file than the one actually stored in the package.
    fn check_compression(&mut self) -> Result<()> {
        if self.compression_checked {
            return Ok(());
        }
        self.compression_checked = true;

        let declared: u64 = self
            .blocks
            .iter()
            .map(|b| b.compressed_size_or_default())
            .sum();
        let declares_compressed_sizes = self.blocks.iter().any(|b| b.compressed_size().is_some());
        if declares_compressed_sizes && declared != self.compressed_size {
            self.poisoned = true;
            return Err(Error::BlockMapCompressionMismatch {
                file_name: self.file_name.clone(),
                declared,
                actual: self.compressed_size,
            });
        }
        Ok(())
    }

    /// Fetches, hashes, and compares block `index`, poisoning the stream on
    /// mismatch. Leaves `window`/`window_block_index` holding the verified
    /// bytes on success.
    fn validate_block(&mut self, index: usize) -> Result<()> {
        debug_assert_eq!(index, self.validated_through);
        let start = BLOCK_SIZE * index as u64;
        let len = (self.uncompressed_size - start).min(BLOCK_SIZE) as usize;
        let buf = self
            .zip
            .read_window(&self.file_name, start, len)
            .map_err(|_| {
                self.poisoned = true;
                Error::BlockMapHashMismatch {
                    file_name: self.file_name.clone(),
                    block_index: index,
                }
            })?;

        let digest = Sha256Algorithm::digest(&buf);
        if digest.as_slice() != self.blocks[index].hash() {
            self.poisoned = true;
            tracing::debug!(file = %self.file_name, block = index, "block hash mismatch");
            return Err(Error::BlockMapHashMismatch {
                file_name: self.file_name.clone(),
                block_index: index,
            });
        }
        tracing::trace!(file = %self.file_name, block = index, "block verified");
        self.window = buf;
        self.window_block_index = Some(index);
        self.validated_through += 1;
        Ok(())
    }

    /// Ensures every block up to and including the one containing plaintext
    /// offset `upto` has been validated.
    fn validate_through_offset(&mut self, upto: u64) -> Result<()> {
        let needed = if upto == 0 {
            0
        } else {
            ((upto - 1) / BLOCK_SIZE + 1) as usize
        };
        while self.validated_through < needed.min(self.blocks.len()) {
            self.validate_block(self.validated_through)?;
        }
        Ok(())
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::BlockMapHashMismatch {
                file_name: self.file_name.clone(),
                block_index: self.validated_through,
            });
        }
        Ok(())
    }

    /// Ensures `window` holds the plaintext of `block_index`, which must
    /// already have been validated. A block seeked back into after later
    /// blocks were read is re-fetched here but not re-hashed: its hash was
    /// already checked the first time `validate_block` reached it, and nothing
    /// in the underlying package can change between reads of the same open
    /// stream.
    fn ensure_window_loaded(&mut self, block_index: usize) -> Result<()> {
        if self.window_block_index == Some(block_index) {
            return Ok(());
        }
        debug_assert!(block_index < self.validated_through);
        let start = BLOCK_SIZE * block_index as u64;
        let len = (self.uncompressed_size - start).min(BLOCK_SIZE) as usize;
        let buf = self.zip.read_window(&self.file_name, start, len)?;
        self.window = buf;
        self.window_block_index = Some(block_index);
        Ok(())
    }
}

impl<S: PackageSource> Read for ValidatingStream<S> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.check_poisoned()?;
        self.check_compression()?;
        if self.position >= self.uncompressed_size {
            return Ok(0);
        }
        let want_through = (self.position + 1).min(self.uncompressed_size);
        self.validate_through_offset(want_through)?;

        let remaining_in_file = (self.uncompressed_size - self.position) as usize;
        let block_index = (self.position / BLOCK_SIZE) as usize;
        let block_end = (BLOCK_SIZE * (block_index as u64 + 1)).min(self.uncompressed_size);
        let remaining_in_block = (block_end - self.position) as usize;
        let n = out.len().min(remaining_in_file).min(remaining_in_block);

        self.ensure_window_loaded(block_index)?;
        let block_start = BLOCK_SIZE * block_index as u64;
        let offset_in_block = (self.position - block_start) as usize;
        out[..n].copy_from_slice(&self.window[offset_in_block..offset_in_block + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl<S: PackageSource> Seek for ValidatingStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.check_poisoned()?;
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(delta) => self.uncompressed_size as i64 + delta,
            SeekFrom::Current(delta) => self.position as i64 + delta,
        };
        if new_pos < 0 || new_pos as u64 > self.uncompressed_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek out of bounds",
            ));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_map::BlockMap;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use sha2::{Digest, Sha256};
    use std::io::{Cursor, Write};
    use zip::write::{FileOptions, ZipWriter};
    use zip::CompressionMethod;

    fn block_map_file(uncompressed_size: u64, block_bytes: &[&[u8]]) -> BlockMapFile {
        let hash_method = "http://www.w3.org/2001/04/xmlenc#sha256";
        let mut xml = format!(
            r#"<?xml version="1.0"?><BlockMap xmlns="http://schemas.microsoft.com/appx/2010/blockmap" HashMethod="{hash_method}"><File Name="f" Size="{uncompressed_size}" LfhSize="31">"#
        );
        for bytes in block_bytes {
            let hash = BASE64.encode(Sha256::digest(bytes));
            xml.push_str(&format!(r#"<Block Hash="{hash}"/>"#));
        }
        xml.push_str("</File></BlockMap>");
        let map = BlockMap::parse(xml.as_bytes()).unwrap();
        map.file("f").unwrap().clone()
    }

    /// Builds a single-entry, stored (uncompressed) ZIP container holding
    /// `data` under the name `"f"`, and returns it alongside its entry info.
    fn container(data: &[u8]) -> (Arc<ZipContainer<Arc<Vec<u8>>>>, ZipEntryInfo) {
        let mut buf = Vec::new();
        {
            let mut zip = ZipWriter::new(Cursor::new(&mut buf));
            let opts = FileOptions::default().compression_method(CompressionMethod::Stored);
            zip.start_file("f", opts).unwrap();
            zip.write_all(data).unwrap();
            zip.finish().unwrap();
        }
        let container = ZipContainer::new(Arc::new(buf)).unwrap();
        let info = container.entry_info("f").unwrap();
        (Arc::new(container), info)
    }

    #[test]
    fn reads_full_file() {
        let data = b"\x01\x02\x03";
        let file = block_map_file(3, &[data]);
        let (zip, info) = container(data);
        let mut stream = ValidatingStream::new(zip, &file, &info).unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn detects_corruption_before_releasing_block() {
        let data = b"\x01\x02\x03";
        let file = block_map_file(3, &[data]);
        let corrupted = b"\x01\x02\x04";
        let (zip, info) = container(corrupted);
        let mut stream = ValidatingStream::new(zip, &file, &info).unwrap();
        let mut out = [0u8; 3];
        let err = stream.read(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn seek_then_read_matches_full_read() {
        let mut data = vec![0u8; BLOCK_SIZE as usize + 1];
        data[BLOCK_SIZE as usize] = 9;
        let file = block_map_file(
            data.len() as u64,
            &[&data[..BLOCK_SIZE as usize], &data[BLOCK_SIZE as usize..]],
        );
        let (zip, info) = container(&data);
        let mut stream = ValidatingStream::new(zip, &file, &info).unwrap();
        stream.seek(SeekFrom::Start(BLOCK_SIZE)).unwrap();
        let mut out = [0u8; 1];
        stream.read_exact(&mut out).unwrap();
        assert_eq!(out[0], 9);
    }

    #[test]
    fn seeking_back_into_a_validated_block_does_not_rehash() {
        let mut data = vec![0u8; BLOCK_SIZE as usize + 1];
        data[0] = 5;
        data[BLOCK_SIZE as usize] = 9;
        let file = block_map_file(
            data.len() as u64,
            &[&data[..BLOCK_SIZE as usize], &data[BLOCK_SIZE as usize..]],
        );
        let (zip, info) = container(&data);
        let mut stream = ValidatingStream::new(zip, &file, &info).unwrap();
        stream.seek(SeekFrom::Start(BLOCK_SIZE)).unwrap();
        let mut out = [0u8; 1];
        stream.read_exact(&mut out).unwrap();
        assert_eq!(out[0], 9);

        stream.seek(SeekFrom::Start(0)).unwrap();
        let mut first = [0u8; 1];
        stream.read_exact(&mut first).unwrap();
        assert_eq!(first[0], 5);
    }

    #[test]
    fn empty_file_is_immediate_eof() {
        let file = block_map_file(0, &[]);
        let (zip, info) = container(&[]);
        let mut stream = ValidatingStream::new(zip, &file, &info).unwrap();
        let mut out = [0u8; 1];
        assert_eq!(stream.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn compression_mismatch_surfaces_on_first_read_not_construction() {
        let data = b"the quick brown fox";
        let hash_method = "http://www.w3.org/2001/04/xmlenc#sha256";
        let hash = BASE64.encode(Sha256::digest(data));
        let xml = format!(
            r#"<?xml version="1.0"?><BlockMap xmlns="http://schemas.microsoft.com/appx/2010/blockmap" HashMethod="{hash_method}"><File Name="f" Size="{}" LfhSize="31"><Block Hash="{hash}" Size="999"/></File></BlockMap>"#,
            data.len()
        );
        let map = BlockMap::parse(xml.as_bytes()).unwrap();
        let file = map.file("f").unwrap().clone();
        let (zip, info) = container(data);

        let mut stream = ValidatingStream::new(zip, &file, &info)
            .expect("construction only checks uncompressed size");
        let mut out = [0u8; 1];
        let err = stream.read(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }
}
