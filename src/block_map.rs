//! In-memory block-map model (wire format in [`AppxBlockMap.xml`]) and the
//! parser that turns the XML into it.
//!
//! [`AppxBlockMap.xml`]: https://learn.microsoft.com/en-us/uwp/schemas/blockmapschema/element-blockmap

use std::collections::HashMap;
use std::io::Read;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use quick_xml::events::Event;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Default block size, in uncompressed bytes. The final block of a file may
/// be shorter; no block is ever longer.
pub const BLOCK_SIZE: u64 = 65536;

const RESERVED_NAME: &str = "[Content_Types].xml";
const SHA256_DIGEST_LEN: usize = 32;
const BLOCKMAP_NAMESPACE: &str = "http://schemas.microsoft.com/appx/2010/blockmap";

/// One block of a file's uncompressed content.
#[derive(Clone, Debug)]
pub struct Block {
    hash: Vec<u8>,
    compressed_size: Option<u64>,
}

impl Block {
    /// SHA-256 (or whatever the block map's `HashMethod` names) digest of
    /// this block's uncompressed bytes.
    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    /// Size of this block as stored in the ZIP entry, when declared.
    /// Meaningless for stored (uncompressed) entries, where the on-disk size
    /// always equals the plaintext size.
    pub fn compressed_size(&self) -> Option<u64> {
        self.compressed_size
    }

    /// [`compressed_size`](Self::compressed_size) with the historical
    /// 65536 default applied when the block map omits `Block/@Size`.
    /// Only meaningful for stored entries; a deflate entry's true
    /// compressed length always comes from the ZIP entry itself.
    pub fn compressed_size_or_default(&self) -> u64 {
        self.compressed_size.unwrap_or(BLOCK_SIZE)
    }
}

/// One file tracked by a [`BlockMap`].
#[derive(Clone, Debug)]
pub struct BlockMapFile {
    name: String,
    uncompressed_size: u64,
    local_file_header_size: u32,
    blocks: Vec<Block>,
}

impl BlockMapFile {
    /// Path of this file, `\`-separated, as recorded in the block map.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total uncompressed size of the file.
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    /// Size of this entry's ZIP local file header, for cross-checking
    /// against the actual container.
    pub fn local_file_header_size(&self) -> u32 {
        self.local_file_header_size
    }

    /// Blocks making up the file's content, in order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Plaintext length of the block at `index`.
    pub fn block_len(&self, index: usize) -> u64 {
        let remaining = self.uncompressed_size - BLOCK_SIZE * index as u64;
        remaining.min(BLOCK_SIZE)
    }
}

/// Parsed, immutable representation of `AppxBlockMap.xml`.
#[derive(Clone, Debug)]
pub struct BlockMap {
    hash_method: String,
    files: HashMap<String, BlockMapFile>,
    order: Vec<String>,
}

impl BlockMap {
    /// Parses a block map from its XML representation.
    ///
    /// Rejects a document whose root element isn't `BlockMap` in the
    /// `http://schemas.microsoft.com/appx/2010/blockmap` namespace, then
    /// applies the structural checks the schema itself cannot express:
    /// duplicate or reserved file names, malformed digests, and block
    /// counts inconsistent with the declared file size.
    pub fn parse<R: Read>(mut reader: R) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        check_root(&bytes)?;
        let raw: RawBlockMap = quick_xml::de::from_reader(bytes.as_slice())?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawBlockMap) -> Result<Self> {
        let mut files = HashMap::with_capacity(raw.files.len());
        let mut order = Vec::with_capacity(raw.files.len());

        for raw_file in raw.files {
            if raw_file.name == RESERVED_NAME {
                return Err(Error::BlockMapSemanticError(format!(
                    "{RESERVED_NAME:?} cannot be tracked by the block map"
                )));
            }
            if files.contains_key(&raw_file.name) {
                return Err(Error::BlockMapSemanticError(format!(
                    "duplicate file name {:?}",
                    raw_file.name
                )));
            }

            let blocks = raw_file
                .blocks
                .into_iter()
                .map(|b| decode_block(&raw_file.name, b))
                .collect::<Result<Vec<_>>>()?;

            let expected_blocks = if raw_file.size == 0 {
                0
            } else {
                ((raw_file.size - 1) / BLOCK_SIZE + 1) as usize
            };
            if blocks.len() != expected_blocks {
                return Err(Error::BlockMapSemanticError(format!(
                    "{:?} declares size {} ({} blocks) but lists {} blocks",
                    raw_file.name,
                    raw_file.size,
                    expected_blocks,
                    blocks.len()
                )));
            }

            order.push(raw_file.name.clone());
            files.insert(
                raw_file.name.clone(),
                BlockMapFile {
                    name: raw_file.name,
                    uncompressed_size: raw_file.size,
                    local_file_header_size: raw_file.lfh_size,
                    blocks,
                },
            );
        }

        Ok(Self {
            hash_method: raw.hash_method,
            files,
            order,
        })
    }

    /// The hash algorithm URI declared by the block map, e.g.
    /// `http://www.w3.org/2001/04/xmlenc#sha256`.
    pub fn hash_method(&self) -> &str {
        &self.hash_method
    }

    /// File names tracked by the block map, in document order.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Looks up a tracked file by its `\`-separated name.
    pub fn file(&self, name: &str) -> Option<&BlockMapFile> {
        self.files.get(name)
    }
}

/// Scans for the document's root element and rejects anything other than
/// `BlockMap` declared in [`BLOCKMAP_NAMESPACE`], before the (namespace-blind)
/// serde deserialization pass runs. `quick-xml`'s serde integration matches
/// elements by local name only, so this is the only place that namespace is
/// actually checked.
fn check_root(bytes: &[u8]) -> Result<()> {
    let mut reader = quick_xml::Reader::from_reader(bytes);
    reader.trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader
            .read_event(&mut buf)
            .map_err(|e| Error::BlockMapXmlError(e.to_string()))?
        {
            Event::Start(e) | Event::Empty(e) => {
                if e.name().as_ref() != b"BlockMap" {
                    return Err(Error::BlockMapXmlError(format!(
                        "unexpected root element {:?}, expected \"BlockMap\"",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }
                let in_namespace = e.attributes().filter_map(|a| a.ok()).any(|a| {
                    a.key.as_ref() == b"xmlns" && a.value.as_ref() == BLOCKMAP_NAMESPACE.as_bytes()
                });
                if !in_namespace {
                    return Err(Error::BlockMapXmlError(format!(
                        "root element is not in the {BLOCKMAP_NAMESPACE:?} namespace"
                    )));
                }
                return Ok(());
            }
            Event::Eof => {
                return Err(Error::BlockMapXmlError("empty document".to_string()));
            }
            _ => {}
        }
        buf.clear();
    }
}

fn decode_block(file_name: &str, raw: RawBlock) -> Result<Block> {
    let hash = BASE64.decode(raw.hash.as_bytes()).map_err(|e| {
        Error::BlockMapSemanticError(format!("{file_name:?}: invalid block hash base64: {e}"))
    })?;
    if hash.len() != SHA256_DIGEST_LEN {
        return Err(Error::BlockMapSemanticError(format!(
            "{file_name:?}: block hash is {} bytes, expected {SHA256_DIGEST_LEN}",
            hash.len()
        )));
    }
    Ok(Block {
        hash,
        compressed_size: raw.size,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename = "BlockMap")]
struct RawBlockMap {
    #[serde(rename = "@HashMethod")]
    hash_method: String,
    #[serde(rename = "File", default)]
    files: Vec<RawFile>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(rename = "@Name")]
    name: String,
    #[serde(rename = "@Size")]
    size: u64,
    #[serde(rename = "@LfhSize")]
    lfh_size: u32,
    #[serde(rename = "Block", default)]
    blocks: Vec<RawBlock>,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    #[serde(rename = "@Hash")]
    hash: String,
    #[serde(rename = "@Size")]
    size: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xml(files: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<BlockMap xmlns="http://schemas.microsoft.com/appx/2010/blockmap" HashMethod="http://www.w3.org/2001/04/xmlenc#sha256">
{files}
</BlockMap>"#
        )
    }

    fn digest32(byte: u8) -> String {
        BASE64.encode([byte; 32])
    }

    #[test]
    fn parses_empty_file() {
        let doc = xml(r#"<File Name="empty.bin" Size="0" LfhSize="30"/>"#);
        let map = BlockMap::parse(doc.as_bytes()).unwrap();
        let f = map.file("empty.bin").unwrap();
        assert_eq!(f.uncompressed_size(), 0);
        assert!(f.blocks().is_empty());
    }

    #[test]
    fn parses_aligned_and_unaligned_blocks() {
        let doc = xml(&format!(
            r#"<File Name="a.bin" Size="65537" LfhSize="30">
                <Block Hash="{}"/>
                <Block Hash="{}"/>
            </File>"#,
            digest32(1),
            digest32(2)
        ));
        let map = BlockMap::parse(doc.as_bytes()).unwrap();
        let f = map.file("a.bin").unwrap();
        assert_eq!(f.blocks().len(), 2);
        assert_eq!(f.block_len(0), 65536);
        assert_eq!(f.block_len(1), 1);
    }

    #[test]
    fn rejects_reserved_name() {
        let doc = xml(r#"<File Name="[Content_Types].xml" Size="0" LfhSize="30"/>"#);
        assert!(matches!(
            BlockMap::parse(doc.as_bytes()),
            Err(Error::BlockMapSemanticError(_))
        ));
    }

    #[test]
    fn rejects_duplicate_name() {
        let doc = xml(
            r#"<File Name="x" Size="0" LfhSize="30"/><File Name="x" Size="0" LfhSize="30"/>"#,
        );
        assert!(matches!(
            BlockMap::parse(doc.as_bytes()),
            Err(Error::BlockMapSemanticError(_))
        ));
    }

    #[test]
    fn rejects_block_count_mismatch() {
        let doc = xml(r#"<File Name="a.bin" Size="65537" LfhSize="30">
            <Block Hash="{}"/>
        </File>"#);
        let doc = doc.replace("{}", &digest32(1));
        assert!(matches!(
            BlockMap::parse(doc.as_bytes()),
            Err(Error::BlockMapSemanticError(_))
        ));
    }

    #[test]
    fn rejects_wrong_root_element() {
        let doc = r#"<?xml version="1.0" encoding="UTF-8"?>
<NotABlockMap xmlns="http://schemas.microsoft.com/appx/2010/blockmap"/>"#;
        assert!(matches!(
            BlockMap::parse(doc.as_bytes()),
            Err(Error::BlockMapXmlError(_))
        ));
    }

    #[test]
    fn rejects_wrong_namespace() {
        let doc = r#"<?xml version="1.0" encoding="UTF-8"?>
<BlockMap xmlns="http://example.com/not-the-blockmap-schema" HashMethod="http://www.w3.org/2001/04/xmlenc#sha256"/>"#;
        assert!(matches!(
            BlockMap::parse(doc.as_bytes()),
            Err(Error::BlockMapXmlError(_))
        ));
    }

    #[test]
    fn rejects_bad_digest_length() {
        let doc = xml(&format!(
            r#"<File Name="a.bin" Size="1" LfhSize="30">
                <Block Hash="{}"/>
            </File>"#,
            BASE64.encode([1u8; 20])
        ));
        assert!(matches!(
            BlockMap::parse(doc.as_bytes()),
            Err(Error::BlockMapSemanticError(_))
        ));
    }
}
