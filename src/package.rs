//! Package reader facade: resolves a file name to a [`ValidatingStream`] and
//! enumerates the files the block map knows about.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use zip::CompressionMethod;

use crate::block_map::BlockMap;
use crate::error::{Error, Result};
use crate::validate::ValidatingStream;
use crate::zip_source::{PackageSource, ZipContainer};

const BLOCK_MAP_ENTRY: &str = "AppxBlockMap.xml";

/// Reads an MSIX/APPX package's block map and serves verified streams over
/// its payload files.
///
/// The block map, not the ZIP central directory, is authoritative for
/// [`files`](Self::files): a file present in the ZIP but absent from the
/// block map is not something this reader will open.
pub struct PackageReader<S: PackageSource> {
    zip: Arc<ZipContainer<S>>,
    block_map: BlockMap,
}

impl<S: PackageSource> PackageReader<S> {
    /// Opens `source` as an MSIX/APPX package, parsing and structurally
    /// validating `AppxBlockMap.xml` before returning.
    pub fn open(source: S) -> Result<Self> {
        let zip = ZipContainer::new(source)?;
        let (_, block_map_bytes) = zip.read_whole(BLOCK_MAP_ENTRY)?;
        let block_map = BlockMap::parse(block_map_bytes.as_slice())?;
        tracing::debug!(
            files = block_map.files().count(),
            hash_method = block_map.hash_method(),
            "parsed block map"
        );
        Ok(Self {
            zip: Arc::new(zip),
            block_map,
        })
    }

    /// File names tracked by the block map, in document order.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.block_map.files()
    }

    /// The parsed block map itself, for callers that need direct access to
    /// its files and digests (e.g. to cross-reference against a manifest).
    /// To hash the block map's own raw bytes, use
    /// [`underlying_block_map_stream`](Self::underlying_block_map_stream).
    pub fn block_map(&self) -> &BlockMap {
        &self.block_map
    }

    /// Returns a fresh stream over the raw, undecoded bytes of
    /// `AppxBlockMap.xml` itself, for callers that need to hash the block
    /// map's own bytes (e.g. as part of validating `AppxSignature.p7x`
    /// outside this crate, where the block map's hash is one of the
    /// quantities the signature covers).
    pub fn underlying_block_map_stream(&self) -> Result<Cursor<Vec<u8>>> {
        let (_, bytes) = self.zip.read_whole(BLOCK_MAP_ENTRY)?;
        Ok(Cursor::new(bytes))
    }

    /// Opens a validating stream over `name`.
    ///
    /// Fails with [`Error::NotFound`] if `name` is not tracked by the block
    /// map, and with [`Error::ZipFormatError`] if the ZIP entry's local file
    /// header size disagrees with the block map's declared `LfhSize`, or
    /// uses a compression method this reader does not support. A mismatch
    /// between the block map's declared per-block compressed sizes and the
    /// ZIP entry's actual compressed length is not checked here: it surfaces
    /// as [`Error::BlockMapCompressionMismatch`] only once the returned
    /// stream is first read.
    pub fn open(&self, name: &str) -> Result<ValidatingStream<S>> {
        let file = self
            .block_map
            .file(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let info = self.zip.entry_info(name)?;

        if info.local_file_header_size != file.local_file_header_size() {
            return Err(Error::ZipFormatError(format!(
                "{name:?}: zip local file header is {} bytes, block map declares {}",
                info.local_file_header_size,
                file.local_file_header_size()
            )));
        }
        if !matches!(
            info.compression,
            CompressionMethod::Stored | CompressionMethod::Deflated
        ) {
            return Err(Error::ZipFormatError(format!(
                "{name:?}: unsupported compression method {:?}",
                info.compression
            )));
        }

        ValidatingStream::new(Arc::clone(&self.zip), file, &info)
    }
}

impl PackageReader<PathBuf> {
    /// Opens a package stored as a file on disk.
    pub fn open_path(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(path.into())
    }
}
