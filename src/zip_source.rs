//! Thin adapter from the `zip` crate's central-directory reader onto the
//! entry surface the validating stream needs.
//!
//! The generic ZIP central-directory reader itself is treated as an external
//! collaborator: this module locates entries and hands back their bytes, it
//! does not reimplement ZIP parsing.

use std::io::{self, Cursor, Read, Seek};
use std::path::PathBuf;
use std::sync::Arc;

use zip::read::{ZipArchive, ZipFile};
use zip::CompressionMethod;

use crate::error::{Error, Result};

/// Something a [`ZipContainer`] can open independent, positioned readers
/// against. Each call to [`open`](Self::open) must yield a reader over the
/// *same* underlying bytes, independent of any other open reader, so that
/// multiple entries (or repeated opens of the same entry) can be read
/// concurrently.
pub trait PackageSource {
    /// The reader type yielded by [`open`](Self::open).
    type Reader: Read + Seek;

    /// Opens a fresh, independently-positioned reader over the package.
    fn open(&self) -> std::io::Result<Self::Reader>;
}

impl PackageSource for PathBuf {
    type Reader = std::fs::File;

    fn open(&self) -> std::io::Result<Self::Reader> {
        std::fs::File::open(self)
    }
}

/// An in-memory package, useful for tests and for small packages already
/// loaded into memory.
impl PackageSource for Arc<Vec<u8>> {
    type Reader = Cursor<Arc<Vec<u8>>>;

    fn open(&self) -> std::io::Result<Self::Reader> {
        Ok(Cursor::new(self.clone()))
    }
}

/// Metadata about one ZIP entry, with the name translated to the block map's
/// `\`-separated convention.
#[derive(Clone, Debug)]
pub struct ZipEntryInfo {
    /// Entry name, `\`-separated.
    pub name: String,
    /// `Stored` or `Deflated`; anything else is rejected before this struct
    /// is constructed.
    pub compression: CompressionMethod,
    /// On-disk (possibly compressed) length.
    pub compressed_size: u64,
    /// Plaintext length.
    pub uncompressed_size: u64,
    /// Byte length of this entry's local file header, including its name and
    /// extra field.
    pub local_file_header_size: u32,
}

/// View over a package's ZIP container.
pub struct ZipContainer<S: PackageSource> {
    source: S,
}

impl<S: PackageSource> ZipContainer<S> {
    /// Opens `source` as a ZIP container, failing fast if the central
    /// directory cannot be read.
    pub fn new(source: S) -> Result<Self> {
        let reader = source.open()?;
        ZipArchive::new(reader)?;
        Ok(Self { source })
    }

    /// Lists every entry in the container, in central-directory order.
    pub fn entries(&self) -> Result<Vec<ZipEntryInfo>> {
        let reader = self.source.open()?;
        let mut archive = ZipArchive::new(reader)?;
        let mut out = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let file = archive.by_index(i)?;
            out.push(entry_info(&file));
        }
        Ok(out)
    }

    /// Looks up `name` (a block-map-style, `\`-separated path) and returns
    /// its metadata, without reading any of its body.
    pub fn entry_info(&self, name: &str) -> Result<ZipEntryInfo> {
        let reader = self.source.open()?;
        let mut archive = ZipArchive::new(reader)?;
        let zip_name = name.replace('\\', "/");
        let file = archive
            .by_name(&zip_name)
            .map_err(|_| Error::NotFound(name.to_string()))?;
        Ok(entry_info(&file))
    }

    /// Reads the entirety of a small, whole control file such as
    /// `AppxBlockMap.xml` into memory.
    ///
    /// This is only appropriate for files the block map itself does not
    /// track (the block map is not authenticated block-by-block against
    /// itself) and that are small by construction; payload files must go
    /// through [`read_window`](Self::read_window) instead so a multi-GiB
    /// entry is never buffered whole.
    pub fn read_whole(&self, name: &str) -> Result<(ZipEntryInfo, Vec<u8>)> {
        let reader = self.source.open()?;
        let mut archive = ZipArchive::new(reader)?;
        let zip_name = name.replace('\\', "/");
        let mut file = archive
            .by_name(&zip_name)
            .map_err(|_| Error::NotFound(name.to_string()))?;
        let info = entry_info(&file);
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)?;
        Ok((info, buf))
    }

    /// Reads exactly `len` plaintext bytes of `name` starting `skip` bytes
    /// into the entry's decompressed content.
    ///
    /// Re-opens the archive and the entry's decompressor from scratch on
    /// every call and discards the leading `skip` bytes before reading the
    /// requested window: a deflate bitstream cannot be decoded starting
    /// from an arbitrary byte, so there is no way to resume a held-open
    /// decompressor across calls without the validating stream and this
    /// container becoming self-referential. The discard is a plain
    /// sequential `Read`, not an allocation, so memory stays bounded to one
    /// block (`len` bytes) regardless of `skip` or of the entry's total
    /// size; callers revisiting an already-validated block pay CPU to
    /// re-derive it, never extra memory, matching the pattern already used
    /// for backward seeks over the validated prefix.
    pub fn read_window(&self, name: &str, skip: u64, len: usize) -> Result<Vec<u8>> {
        let reader = self.source.open()?;
        let mut archive = ZipArchive::new(reader)?;
        let zip_name = name.replace('\\', "/");
        let mut file = archive
            .by_name(&zip_name)
            .map_err(|_| Error::NotFound(name.to_string()))?;
        if skip > 0 {
            io::copy(&mut (&mut file).take(skip), &mut io::sink())?;
        }
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn entry_info(file: &ZipFile) -> ZipEntryInfo {
    let name = file.name().replace('/', "\\");
    // Fixed 30-byte local file header, plus the variable-length name and
    // extra field that follow it.
    let local_file_header_size = 30 + file.name_raw().len() as u32 + file.extra_data().len() as u32;
    ZipEntryInfo {
        name,
        compression: file.compression(),
        compressed_size: file.compressed_size(),
        uncompressed_size: file.size(),
        local_file_header_size,
    }
}
