use std::fmt;

use crate::block::padded_byte_len;
use crate::card::Card;
use crate::error::{Error, Result};
use crate::header::{Anchor, Header};
use crate::layout::{axes, Registry};
use crate::value::Value;

/// Fieldless discriminant of [`HduKind`], used to key collaborator tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HduKindTag {
    Primary,
    Image,
    AsciiTable,
    BinaryTable,
    Groups,
    CompressedImage,
    Nonstandard,
    Corrupted,
}

/// The kind of an HDU, decided from the first cards of its header.
#[derive(Debug, Clone, PartialEq)]
pub enum HduKind {
    /// Primary array (`SIMPLE = T`).
    Primary,
    /// Image extension (`XTENSION = 'IMAGE'`).
    Image,
    /// ASCII table extension (`XTENSION = 'TABLE'`).
    AsciiTable,
    /// Binary table extension (`XTENSION = 'BINTABLE'` or `'A3DTABLE'`).
    BinaryTable,
    /// Random-groups primary array (`GROUPS = T`).
    Groups,
    /// Tile-compressed image stored in a binary table (`ZIMAGE = T`), only
    /// recognised when a compression collaborator is registered.
    CompressedImage,
    /// Payload the core treats as opaque bytes.
    Nonstandard {
        /// `XTENSION` value of an unrecognised extension; `None` for a primary
        /// header with `SIMPLE = F`.
        xtension: Option<String>,
    },
    /// Header or data that could not be read back into a valid HDU.
    Corrupted {
        /// What went wrong.
        reason: String,
    },
}

impl HduKind {
    /// Dispatch on the header's first card.
    pub fn classify(header: &Header, registry: &Registry) -> HduKind {
        let first = match header.get(0usize) {
            Some(card) => card,
            None => return HduKind::corrupted("empty header"),
        };
        match first.keyword() {
            "SIMPLE" => {
                if header.value("GROUPS") == Some(Value::Logical(true)) {
                    return HduKind::Groups;
                }
                match first.value() {
                    Some(Value::Logical(true)) => HduKind::Primary,
                    Some(Value::Logical(false)) => HduKind::Nonstandard { xtension: None },
                    _ => HduKind::corrupted("SIMPLE is not a logical value"),
                }
            }
            "XTENSION" => match first.value() {
                Some(Value::String(xtension)) => match xtension.trim_end() {
                    "TABLE" => HduKind::AsciiTable,
                    "IMAGE" => HduKind::Image,
                    "BINTABLE" | "A3DTABLE" => {
                        if registry.has_compression()
                            && header.value("ZIMAGE") == Some(Value::Logical(true))
                        {
                            HduKind::CompressedImage
                        } else {
                            HduKind::BinaryTable
                        }
                    }
                    other => HduKind::Nonstandard {
                        xtension: Some(other.to_string()),
                    },
                },
                _ => HduKind::corrupted("XTENSION is not a string"),
            },
            _ => HduKind::corrupted("header starts with neither SIMPLE nor XTENSION"),
        }
    }

    pub(crate) fn corrupted(reason: impl Into<String>) -> HduKind {
        HduKind::Corrupted {
            reason: reason.into(),
        }
    }

    /// The payload-free discriminant, used to pick a [`Layout`](crate::layout::Layout).
    pub fn tag(&self) -> HduKindTag {
        match self {
            HduKind::Primary => HduKindTag::Primary,
            HduKind::Image => HduKindTag::Image,
            HduKind::AsciiTable => HduKindTag::AsciiTable,
            HduKind::BinaryTable => HduKindTag::BinaryTable,
            HduKind::Groups => HduKindTag::Groups,
            HduKind::CompressedImage => HduKindTag::CompressedImage,
            HduKind::Nonstandard { .. } => HduKindTag::Nonstandard,
            HduKind::Corrupted { .. } => HduKindTag::Corrupted,
        }
    }

    /// Kinds that may only appear first in a file.
    pub fn is_primary(&self) -> bool {
        matches!(
            self,
            HduKind::Primary | HduKind::Groups | HduKind::Nonstandard { xtension: None }
        )
    }

    /// Kinds that may only appear after the first HDU.
    pub fn is_extension(&self) -> bool {
        matches!(
            self,
            HduKind::Image
                | HduKind::AsciiTable
                | HduKind::BinaryTable
                | HduKind::CompressedImage
                | HduKind::Nonstandard { xtension: Some(_) }
        )
    }

    /// The scanner could not establish this HDU's header or extent.
    pub fn is_corrupted(&self) -> bool {
        matches!(self, HduKind::Corrupted { .. })
    }
}

impl fmt::Display for HduKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HduKind::Primary => "Primary",
            HduKind::Image => "Image",
            HduKind::AsciiTable => "AsciiTable",
            HduKind::BinaryTable => "BinTable",
            HduKind::Groups => "Groups",
            HduKind::CompressedImage => "CompImage",
            HduKind::Nonstandard { .. } => "Nonstandard",
            HduKind::Corrupted { .. } => "Corrupted",
        };
        f.write_str(name)
    }
}

/// A single Header Data Unit: its header, where it lives on disk and, once
/// read or assigned, its payload bytes.
#[derive(Debug, Clone)]
pub struct Hdu {
    /// The header cards.
    pub(crate) header: Header,
    /// Kind decided at scan or insertion time.
    pub(crate) kind: HduKind,
    /// Byte offset of the first header block in the backing file.
    pub(crate) header_offset: u64,
    /// Bytes the header occupied on disk (whole blocks).
    pub(crate) header_span: u64,
    /// Byte offset where the data segment begins.
    pub(crate) data_offset: u64,
    /// Length of the data segment in bytes (unpadded).
    pub(crate) data_length: u64,
    /// Length of the data segment including block padding.
    pub(crate) padded_data_length: u64,
    /// Lazily populated payload; `Some` once loaded or assigned.
    pub(crate) payload: Option<Vec<u8>>,
    /// The payload was reassigned and must be written.
    pub(crate) dirty: bool,
    /// Not yet present in the backing file.
    pub(crate) new: bool,
    /// Byte-range writes (relative to the data start) waiting for flush.
    pub(crate) patches: Vec<(u64, Vec<u8>)>,
}

impl Hdu {
    /// A new in-memory HDU. The kind is derived from the header with the
    /// standard collaborators; containers re-derive it with their own.
    pub fn new(header: Header, data: Vec<u8>) -> Hdu {
        let kind = HduKind::classify(&header, &Registry::standard());
        let data_length = data.len() as u64;
        Hdu {
            header,
            kind,
            header_offset: 0,
            header_span: 0,
            data_offset: 0,
            data_length,
            padded_data_length: padded_byte_len(data_length),
            payload: Some(data),
            dirty: true,
            new: true,
            patches: Vec::new(),
        }
    }

    /// An empty primary HDU: `SIMPLE = T`, `BITPIX = 8`, `NAXIS = 0`,
    /// `EXTEND = T`.
    pub fn empty_primary() -> Result<Hdu> {
        let header = Header::from_cards(vec![
            Card::new("SIMPLE", true, Some("conforms to FITS standard"))?,
            Card::new("BITPIX", 8, Some("array data type"))?,
            Card::new("NAXIS", 0, Some("number of array dimensions"))?,
            Card::new("EXTEND", true, None)?,
        ]);
        Ok(Hdu::new(header, Vec::new()))
    }

    /// A descriptor for an HDU found in a backing file, payload not loaded.
    pub(crate) fn scanned(
        header: Header,
        kind: HduKind,
        header_offset: u64,
        header_span: u64,
        data_length: u64,
        padded_data_length: u64,
    ) -> Hdu {
        Hdu {
            header,
            kind,
            header_offset,
            header_span,
            data_offset: header_offset + header_span,
            data_length,
            padded_data_length,
            payload: None,
            dirty: false,
            new: false,
            patches: Vec::new(),
        }
    }

    /// The header cards.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Kind decided at scan or insertion time.
    pub fn kind(&self) -> &HduKind {
        &self.kind
    }

    /// Byte offset of the first header block; zero until written.
    pub fn header_offset(&self) -> u64 {
        self.header_offset
    }

    /// Byte offset of the data segment.
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    /// Data bytes, before block padding.
    pub fn data_length(&self) -> u64 {
        self.data_length
    }

    /// Data bytes on disk, padding included.
    pub fn padded_data_length(&self) -> u64 {
        self.padded_data_length
    }

    /// Whether the payload is held in memory.
    pub fn is_loaded(&self) -> bool {
        self.payload.is_some()
    }

    /// The payload was replaced and has not been written yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Not yet present in the backing file.
    pub fn is_new(&self) -> bool {
        self.new
    }

    /// The payload, if it has been loaded or assigned.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// `EXTNAME`, or `PRIMARY` for primary kinds without one.
    pub fn name(&self) -> String {
        match self.header.value("EXTNAME") {
            Some(Value::String(name)) => name.trim_end().to_string(),
            _ if self.kind.is_primary() => String::from("PRIMARY"),
            _ => String::new(),
        }
    }

    /// `EXTVER`, defaulting to 1.
    pub fn ver(&self) -> i64 {
        self.header
            .value("EXTVER")
            .and_then(|v| v.as_integer())
            .unwrap_or(1)
    }

    /// Whether an edited header or an assigned payload no longer fits the
    /// blocks it occupies on disk.
    pub(crate) fn is_resized(&self) -> bool {
        if self.new {
            return true;
        }
        let header_resized =
            self.header.is_modified() && self.header.padded_len() != self.header_span;
        let data_resized = self.dirty
            && self
                .payload
                .as_ref()
                .is_some_and(|p| padded_byte_len(p.len() as u64) != self.padded_data_length);
        header_resized || data_resized
    }

    /// Replace the payload. The caller is responsible for keeping the header's
    /// size keywords consistent.
    pub(crate) fn assign(&mut self, data: Vec<u8>) {
        self.payload = Some(data);
        self.dirty = true;
        self.patches.clear();
    }

    /// Record that the HDU now sits at `header_offset` with a header of
    /// `header_span` bytes, and clear every pending-change flag.
    ///
    /// A corrupted HDU whose bytes were left where the scanner found them
    /// keeps its scanned span, which need not be whole blocks.
    pub(crate) fn mark_written(&mut self, header_offset: u64, header_span: u64) {
        let rewritten = self.new || self.dirty;
        self.header_offset = header_offset;
        self.header_span = header_span;
        self.data_offset = header_offset + header_span;
        if let Some(payload) = &self.payload {
            self.data_length = payload.len() as u64;
        }
        if rewritten || !self.kind.is_corrupted() {
            self.padded_data_length = padded_byte_len(self.data_length);
        }
        self.dirty = false;
        self.new = false;
        self.patches.clear();
        self.header.mark_saved();
    }

    /// One-line description: index, name, kind, card count and dimensions.
    pub fn summary(&self, index: usize) -> String {
        let dims = match self.kind {
            HduKind::Corrupted { .. } => String::new(),
            _ => axes(&self.header)
                .map(|d| {
                    let d: Vec<String> = d.iter().map(u64::to_string).collect();
                    format!("({})", d.join(", "))
                })
                .unwrap_or_default(),
        };
        format!(
            "{index:<4}{:<12}{:<12}{:>5}   {dims}",
            self.name(),
            self.kind.to_string(),
            self.header.len()
        )
    }

    /// Turn a primary image into an image extension.
    pub(crate) fn make_extension(&mut self) -> Result<()> {
        match self.kind {
            HduKind::Primary => {}
            HduKind::Image => return Ok(()),
            _ => {
                return Err(Error::Structural(format!(
                    "a {} HDU cannot become an image extension",
                    self.kind
                )))
            }
        }
        let naxis = self.header.value("NAXIS").and_then(|v| v.as_integer()).unwrap_or(0);
        let header = &mut self.header;
        header.remove(0)?;
        header.insert(0, Card::new("XTENSION", "IMAGE", Some("Image extension"))?);
        if header.contains("EXTEND") {
            header.delete("EXTEND")?;
        }
        let anchor = if naxis > 0 {
            format!("NAXIS{naxis}")
        } else {
            String::from("NAXIS")
        };
        header.update("PCOUNT", 0, Some("number of parameters"), Some(Anchor::After(&anchor)))?;
        header.update("GCOUNT", 1, Some("number of groups"), Some(Anchor::After("PCOUNT")))?;
        self.kind = HduKind::Image;
        Ok(())
    }

    /// Turn an image extension into a primary image.
    pub(crate) fn make_primary(&mut self) -> Result<()> {
        match self.kind {
            HduKind::Image => {}
            HduKind::Primary => return Ok(()),
            _ => {
                return Err(Error::Structural(format!(
                    "a {} HDU cannot become a primary HDU",
                    self.kind
                )))
            }
        }
        let header = &mut self.header;
        header.remove(0)?;
        header.insert(0, Card::new("SIMPLE", true, Some("conforms to FITS standard"))?);
        for keyword in ["PCOUNT", "GCOUNT"] {
            if header.contains(keyword) {
                header.delete(keyword)?;
            }
        }
        self.kind = HduKind::Primary;
        Ok(())
    }
}
