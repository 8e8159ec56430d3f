//! Block-map-driven reader and validator for MSIX/APPX packages.
//!
//! An MSIX/APPX package is a ZIP archive whose payload files are authenticated
//! by `AppxBlockMap.xml`: every file is split into 64 KiB blocks, each with a
//! declared SHA-256 hash. This crate parses that block map ([`block_map`])
//! and opens payload files as [`validate::ValidatingStream`]s that hash every
//! block before releasing its bytes to the caller, so a corrupted or tampered
//! package fails closed rather than silently serving bad data.
//!
//! The detached package signature (`AppxSignature.p7x`), the manifest
//! (`AppxManifest.xml`) schema, and `[Content_Types].xml` are out of scope:
//! this crate reads what the block map itself can authenticate.
//!
//! ```no_run
//! use msix_blockmap::PackageReader;
//! use std::io::Read;
//!
//! # fn run() -> msix_blockmap::Result<()> {
//! let package = PackageReader::open_path("app.msix")?;
//! for name in package.files() {
//!     println!("{name}");
//! }
//! let mut manifest = package.open("AppxManifest.xml")?;
//! let mut contents = String::new();
//! manifest.read_to_string(&mut contents)?;
//! # Ok(())
//! # }
//! ```

pub mod block_map;
pub mod error;
mod hash;
pub mod package;
pub mod validate;
pub mod zip_source;

pub use block_map::{Block, BlockMap, BlockMapFile};
pub use error::{Error, Result};
pub use package::PackageReader;
pub use validate::ValidatingStream;
pub use zip_source::{PackageSource, ZipEntryInfo};
