use std::io;

/// Errors produced while parsing a block map, opening a package entry, or
/// validating a stream against its block map.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The block-map document is not well-formed XML, or its root element
    /// does not match the expected `BlockMap` schema (wrong tag name, or
    /// missing/wrong `http://schemas.microsoft.com/appx/2010/blockmap`
    /// namespace).
    #[error("malformed block map xml: {0}")]
    BlockMapXmlError(String),

    /// The XML parsed, but violates a structural rule of the block map: a
    /// duplicate or reserved file name, a malformed digest, or a block count
    /// inconsistent with the declared file size.
    #[error("block map semantic error: {0}")]
    BlockMapSemanticError(String),

    /// The ZIP container could not be read, or uses a feature this reader
    /// does not support (an unsupported compression method, a local file
    /// header that disagrees with the block map's `LfhSize`).
    #[error("zip format error: {0}")]
    ZipFormatError(String),

    /// A block's computed hash does not match the digest declared for it in
    /// the block map, or the decompressor ended before producing the
    /// expected number of plaintext bytes for a block.
    #[error("block {block_index} of {file_name:?} failed hash verification")]
    BlockMapHashMismatch {
        /// Name of the file being read, as recorded in the block map.
        file_name: String,
        /// Zero-based index of the block that failed to verify.
        block_index: usize,
    },

    /// The sum of the block map's declared compressed block sizes for a file
    /// does not match the compressed length of the corresponding ZIP entry.
    #[error("{file_name:?} declares {declared} compressed bytes across its blocks, zip entry has {actual}")]
    BlockMapCompressionMismatch {
        /// Name of the file whose sizes disagree.
        file_name: String,
        /// Total compressed size implied by the block map.
        declared: u64,
        /// Compressed size reported by the ZIP entry.
        actual: u64,
    },

    /// The requested file is not tracked by the block map (or, depending on
    /// context, is absent from the ZIP container).
    #[error("{0:?} not found")]
    NotFound(String),

    /// The operation is not implemented because the core is read-only.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Underlying I/O failure reading the package or block map stream.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<quick_xml::de::DeError> for Error {
    fn from(e: quick_xml::de::DeError) -> Self {
        Error::BlockMapXmlError(e.to_string())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(e) => Error::Io(e),
            zip::result::ZipError::FileNotFound => Error::NotFound(String::new()),
            other => Error::ZipFormatError(other.to_string()),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
