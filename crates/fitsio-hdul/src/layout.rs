//! Collaborators that size HDU payloads and list the keywords a header must
//! carry.
//!
//! The container never interprets payload bytes itself. For each HDU kind a
//! [`Layout`] reports how many data bytes follow the header and which
//! mandatory keywords [`verify`](crate::verify) should check. The standard
//! FITS rules are installed by [`Registry::standard`]; callers may replace any
//! of them or add a compression collaborator.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::hdu::HduKindTag;
use crate::header::Header;
use crate::value::Value;

/// Sizing and checklist rules for one HDU kind.
pub trait Layout: fmt::Debug + Send + Sync {
    /// Number of data bytes (before block padding) described by `header`.
    fn data_size(&self, header: &Header) -> Result<u64>;

    /// Mandatory keywords for `header`, in the order they must appear.
    fn requirements(&self, header: &Header) -> Vec<Requirement>;
}

/// What a required keyword's value must look like.
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    /// Any value.
    Present,
    Logical(bool),
    Integer(i64),
    IntegerIn(Vec<i64>),
    /// Inclusive integer range.
    Range(i64, i64),
    NonNegative,
    /// String equal to this after trimming trailing blanks.
    Text(String),
}

impl Check {
    /// Whether `value` satisfies the check.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Check::Present, _) => true,
            (Check::Logical(want), Value::Logical(got)) => want == got,
            (Check::Integer(want), Value::Integer(got)) => want == got,
            (Check::IntegerIn(set), Value::Integer(got)) => set.contains(got),
            (Check::Range(lo, hi), Value::Integer(got)) => (*lo..=*hi).contains(got),
            (Check::NonNegative, Value::Integer(got)) => *got >= 0,
            (Check::Text(want), Value::String(got)) => got.trim_end() == want,
            _ => false,
        }
    }
}

/// One entry of a mandatory-keyword checklist.
#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    pub keyword: String,
    /// Required card index, if the keyword's position is fixed.
    pub position: Option<usize>,
    pub check: Check,
    /// Value inserted by the fix remedy when the keyword is missing or wrong.
    pub default: Option<Value>,
}

impl Requirement {
    /// A keyword that must sit at card index `position`.
    pub fn at(keyword: impl Into<String>, position: usize, check: Check) -> Self {
        Requirement {
            keyword: keyword.into(),
            position: Some(position),
            check,
            default: None,
        }
    }

    /// A keyword that must appear somewhere.
    pub fn present(keyword: impl Into<String>, check: Check) -> Self {
        Requirement {
            keyword: keyword.into(),
            position: None,
            check,
            default: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

// ── Standard sizing ──

const BITPIX_VALUES: [i64; 6] = [8, 16, 32, 64, -32, -64];

fn integer(header: &Header, keyword: &str) -> Result<i64> {
    match header.value(keyword) {
        Some(Value::Integer(n)) => Ok(n),
        Some(_) => Err(Error::Structural(format!("{keyword} is not an integer"))),
        None => Err(Error::Structural(format!("missing {keyword}"))),
    }
}

fn optional_integer(header: &Header, keyword: &str, default: i64) -> Result<i64> {
    match header.value(keyword) {
        None => Ok(default),
        Some(_) => integer(header, keyword),
    }
}

fn overflow() -> Error {
    Error::Structural("data size overflow".into())
}

/// The axis lengths `NAXIS1..NAXISn`.
pub fn axes(header: &Header) -> Result<Vec<u64>> {
    let naxis = integer(header, "NAXIS")?;
    if !(0..=999).contains(&naxis) {
        return Err(Error::Structural(format!("NAXIS = {naxis} out of range")));
    }
    (1..=naxis)
        .map(|i| {
            let keyword = format!("NAXIS{i}");
            let n = integer(header, &keyword)?;
            u64::try_from(n).map_err(|_| Error::Structural(format!("{keyword} = {n} is negative")))
        })
        .collect()
}

/// `|BITPIX|/8 · GCOUNT · (PCOUNT + NAXIS1 · … · NAXISn)`.
///
/// Primary arrays ignore `PCOUNT`/`GCOUNT`; random-groups arrays skip
/// `NAXIS1`, which is zero by convention.
pub fn standard_data_size(header: &Header, extension: bool, groups: bool) -> Result<u64> {
    let bitpix = integer(header, "BITPIX")?;
    let bytes_per_value = bitpix.unsigned_abs() / 8;
    if bytes_per_value == 0 {
        return Err(Error::Structural(format!("BITPIX = {bitpix} is invalid")));
    }
    let dims = axes(header)?;
    if dims.is_empty() {
        return Ok(0);
    }
    let dims = if groups { &dims[1..] } else { &dims[..] };
    let elements = dims
        .iter()
        .try_fold(1u64, |acc, &d| acc.checked_mul(d))
        .ok_or_else(overflow)?;

    let (pcount, gcount) = if extension || groups {
        let pcount = optional_integer(header, "PCOUNT", 0)?;
        let gcount = optional_integer(header, "GCOUNT", 1)?;
        let pcount = u64::try_from(pcount)
            .map_err(|_| Error::Structural(format!("PCOUNT = {pcount} is negative")))?;
        let gcount = u64::try_from(gcount)
            .map_err(|_| Error::Structural(format!("GCOUNT = {gcount} is negative")))?;
        (pcount, gcount)
    } else {
        (0, 1)
    };

    bytes_per_value
        .checked_mul(gcount)
        .and_then(|n| n.checked_mul(pcount.checked_add(elements)?))
        .ok_or_else(overflow)
}

fn naxis_of(header: &Header) -> i64 {
    header
        .value("NAXIS")
        .and_then(|v| v.as_integer())
        .unwrap_or(0)
        .clamp(0, 999)
}

/// `BITPIX`, `NAXIS` and `NAXISn` at positions 1, 2, 3.. .
fn array_requirements(header: &Header, naxis_check: Check) -> Vec<Requirement> {
    let mut reqs = vec![
        Requirement::at("BITPIX", 1, Check::IntegerIn(BITPIX_VALUES.to_vec())).with_default(8),
        Requirement::at("NAXIS", 2, naxis_check).with_default(0),
    ];
    for i in 1..=naxis_of(header) {
        reqs.push(
            Requirement::at(format!("NAXIS{i}"), 2 + i as usize, Check::NonNegative).with_default(1),
        );
    }
    reqs
}

fn table_requirements(xtension: &str, pcount: Check) -> Vec<Requirement> {
    vec![
        Requirement::at("XTENSION", 0, Check::Text(xtension.into())).with_default(xtension),
        Requirement::at("BITPIX", 1, Check::Integer(8)).with_default(8),
        Requirement::at("NAXIS", 2, Check::Integer(2)).with_default(2),
        Requirement::at("NAXIS1", 3, Check::NonNegative).with_default(0),
        Requirement::at("NAXIS2", 4, Check::NonNegative).with_default(0),
        Requirement::at("PCOUNT", 5, pcount).with_default(0),
        Requirement::at("GCOUNT", 6, Check::Integer(1)).with_default(1),
        Requirement::at("TFIELDS", 7, Check::Range(0, 999)).with_default(0),
    ]
}

// ── Standard layouts ──

/// Primary array (`SIMPLE = T`).
#[derive(Debug, Clone, Copy, Default)]
pub struct PrimaryLayout;

impl Layout for PrimaryLayout {
    fn data_size(&self, header: &Header) -> Result<u64> {
        standard_data_size(header, false, false)
    }

    fn requirements(&self, header: &Header) -> Vec<Requirement> {
        let mut reqs = vec![Requirement::at("SIMPLE", 0, Check::Logical(true)).with_default(true)];
        reqs.extend(array_requirements(header, Check::Range(0, 999)));
        reqs
    }
}

/// Random-groups primary array (`GROUPS = T`).
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupsLayout;

impl Layout for GroupsLayout {
    fn data_size(&self, header: &Header) -> Result<u64> {
        standard_data_size(header, false, true)
    }

    fn requirements(&self, header: &Header) -> Vec<Requirement> {
        let mut reqs = vec![Requirement::at("SIMPLE", 0, Check::Logical(true)).with_default(true)];
        reqs.extend(array_requirements(header, Check::Range(1, 999)));
        if let Some(naxis1) = reqs.iter_mut().find(|r| r.keyword == "NAXIS1") {
            naxis1.check = Check::Integer(0);
            naxis1.default = Some(Value::Integer(0));
        }
        reqs.push(Requirement::present("GROUPS", Check::Logical(true)).with_default(true));
        reqs.push(Requirement::present("PCOUNT", Check::NonNegative).with_default(0));
        reqs.push(Requirement::present("GCOUNT", Check::NonNegative).with_default(1));
        reqs
    }
}

/// `XTENSION = 'IMAGE'`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageLayout;

impl Layout for ImageLayout {
    fn data_size(&self, header: &Header) -> Result<u64> {
        standard_data_size(header, true, false)
    }

    fn requirements(&self, header: &Header) -> Vec<Requirement> {
        let mut reqs =
            vec![Requirement::at("XTENSION", 0, Check::Text("IMAGE".into())).with_default("IMAGE")];
        reqs.extend(array_requirements(header, Check::Range(0, 999)));
        let next = 3 + naxis_of(header) as usize;
        reqs.push(Requirement::at("PCOUNT", next, Check::Integer(0)).with_default(0));
        reqs.push(Requirement::at("GCOUNT", next + 1, Check::Integer(1)).with_default(1));
        reqs
    }
}

/// `XTENSION = 'TABLE'`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsciiTableLayout;

impl Layout for AsciiTableLayout {
    fn data_size(&self, header: &Header) -> Result<u64> {
        standard_data_size(header, true, false)
    }

    fn requirements(&self, _header: &Header) -> Vec<Requirement> {
        table_requirements("TABLE", Check::Integer(0))
    }
}

/// `XTENSION = 'BINTABLE'` (or the legacy `A3DTABLE`).
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryTableLayout;

impl Layout for BinaryTableLayout {
    fn data_size(&self, header: &Header) -> Result<u64> {
        standard_data_size(header, true, false)
    }

    fn requirements(&self, header: &Header) -> Vec<Requirement> {
        let xtension = match header.value("XTENSION") {
            Some(Value::String(s)) if s.trim_end() == "A3DTABLE" => "A3DTABLE",
            _ => "BINTABLE",
        };
        table_requirements(xtension, Check::NonNegative)
    }
}

/// Anything else: an unrecognised conforming extension, or a primary
/// header with `SIMPLE = F`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonstandardLayout;

impl Layout for NonstandardLayout {
    fn data_size(&self, header: &Header) -> Result<u64> {
        let extension = header.get(0usize).map(|c| c.keyword()) == Some("XTENSION");
        standard_data_size(header, extension, false)
    }

    fn requirements(&self, header: &Header) -> Vec<Requirement> {
        if header.get(0usize).map(|c| c.keyword()) != Some("XTENSION") {
            return Vec::new();
        }
        vec![
            Requirement::at("XTENSION", 0, Check::Present),
            Requirement::at("BITPIX", 1, Check::IntegerIn(BITPIX_VALUES.to_vec())),
            Requirement::at("NAXIS", 2, Check::Range(0, 999)),
            Requirement::present("PCOUNT", Check::NonNegative).with_default(0),
            Requirement::present("GCOUNT", Check::NonNegative).with_default(1),
        ]
    }
}

// ── Registry ──

/// One [`Layout`] per HDU kind, plus an optional tile-compression
/// collaborator.
#[derive(Clone)]
pub struct Registry {
    primary: Arc<dyn Layout>,
    groups: Arc<dyn Layout>,
    image: Arc<dyn Layout>,
    ascii_table: Arc<dyn Layout>,
    binary_table: Arc<dyn Layout>,
    nonstandard: Arc<dyn Layout>,
    compression: Option<Arc<dyn Layout>>,
}

impl Registry {
    /// The FITS standard size rule and mandatory keyword lists, without
    /// compression support.
    pub fn standard() -> Self {
        Registry {
            primary: Arc::new(PrimaryLayout),
            groups: Arc::new(GroupsLayout),
            image: Arc::new(ImageLayout),
            ascii_table: Arc::new(AsciiTableLayout),
            binary_table: Arc::new(BinaryTableLayout),
            nonstandard: Arc::new(NonstandardLayout),
            compression: None,
        }
    }

    /// Replace the layout used for one kind. Registering for
    /// [`HduKindTag::CompressedImage`] installs the compression collaborator;
    /// [`HduKindTag::Corrupted`] is ignored.
    pub fn register(&mut self, tag: HduKindTag, layout: Arc<dyn Layout>) {
        match tag {
            HduKindTag::Primary => self.primary = layout,
            HduKindTag::Groups => self.groups = layout,
            HduKindTag::Image => self.image = layout,
            HduKindTag::AsciiTable => self.ascii_table = layout,
            HduKindTag::BinaryTable => self.binary_table = layout,
            HduKindTag::CompressedImage => self.compression = Some(layout),
            HduKindTag::Nonstandard => self.nonstandard = layout,
            HduKindTag::Corrupted => {}
        }
    }

    pub fn with_compression(mut self, layout: Arc<dyn Layout>) -> Self {
        self.compression = Some(layout);
        self
    }

    /// Whether tile-compressed images can be sized.
    pub fn has_compression(&self) -> bool {
        self.compression.is_some()
    }

    /// The layout responsible for `tag`; corrupted HDUs have none.
    pub fn layout(&self, tag: HduKindTag) -> Option<&dyn Layout> {
        let layout = match tag {
            HduKindTag::Primary => &self.primary,
            HduKindTag::Groups => &self.groups,
            HduKindTag::Image => &self.image,
            HduKindTag::AsciiTable => &self.ascii_table,
            HduKindTag::BinaryTable => &self.binary_table,
            HduKindTag::CompressedImage => self.compression.as_ref().unwrap_or(&self.binary_table),
            HduKindTag::Nonstandard => &self.nonstandard,
            HduKindTag::Corrupted => return None,
        };
        Some(&**layout)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::standard()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("primary", &self.primary)
            .field("groups", &self.groups)
            .field("image", &self.image)
            .field("ascii_table", &self.ascii_table)
            .field("binary_table", &self.binary_table)
            .field("nonstandard", &self.nonstandard)
            .field("compression", &self.compression)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::Card;

    fn header(cards: &[(&str, Value)]) -> Header {
        Header::from_cards(
            cards
                .iter()
                .map(|(k, v)| Card::new(k, v.clone(), None).unwrap())
                .collect(),
        )
    }

    fn image(bitpix: i64, dims: &[i64]) -> Header {
        let mut cards = vec![
            ("SIMPLE", Value::Logical(true)),
            ("BITPIX", Value::Integer(bitpix)),
            ("NAXIS", Value::Integer(dims.len() as i64)),
        ];
        let names: Vec<String> = (1..=dims.len()).map(|i| format!("NAXIS{i}")).collect();
        for (name, &d) in names.iter().zip(dims) {
            cards.push((name.as_str(), Value::Integer(d)));
        }
        header(&cards)
    }

    #[test]
    fn naxis_zero_has_no_data() {
        assert_eq!(PrimaryLayout.data_size(&image(8, &[])).unwrap(), 0);
    }

    #[test]
    fn image_sizes() {
        assert_eq!(PrimaryLayout.data_size(&image(16, &[100, 200])).unwrap(), 40_000);
        assert_eq!(PrimaryLayout.data_size(&image(-64, &[10])).unwrap(), 80);
    }

    #[test]
    fn bintable_with_heap() {
        let h = header(&[
            ("XTENSION", Value::String("BINTABLE".into())),
            ("BITPIX", Value::Integer(8)),
            ("NAXIS", Value::Integer(2)),
            ("NAXIS1", Value::Integer(16)),
            ("NAXIS2", Value::Integer(10)),
            ("PCOUNT", Value::Integer(100)),
            ("GCOUNT", Value::Integer(1)),
            ("TFIELDS", Value::Integer(2)),
        ]);
        assert_eq!(BinaryTableLayout.data_size(&h).unwrap(), 260);
        assert!(BinaryTableLayout
            .requirements(&h)
            .iter()
            .all(|r| r.check.accepts(&h.value(r.keyword.as_str()).unwrap())));
    }

    #[test]
    fn random_groups_skip_naxis1() {
        let h = header(&[
            ("SIMPLE", Value::Logical(true)),
            ("BITPIX", Value::Integer(-32)),
            ("NAXIS", Value::Integer(3)),
            ("NAXIS1", Value::Integer(0)),
            ("NAXIS2", Value::Integer(3)),
            ("NAXIS3", Value::Integer(4)),
            ("GROUPS", Value::Logical(true)),
            ("PCOUNT", Value::Integer(2)),
            ("GCOUNT", Value::Integer(5)),
        ]);
        assert_eq!(GroupsLayout.data_size(&h).unwrap(), 4 * 5 * (2 + 12));
    }

    #[test]
    fn missing_keywords_are_structural() {
        let h = header(&[("SIMPLE", Value::Logical(true)), ("NAXIS", Value::Integer(0))]);
        assert!(matches!(PrimaryLayout.data_size(&h), Err(Error::Structural(_))));
        let h = image(8, &[-1]);
        assert!(PrimaryLayout.data_size(&h).is_err());
    }

    #[test]
    fn overflow_is_reported() {
        let h = image(64, &[i64::MAX, i64::MAX]);
        assert!(PrimaryLayout.data_size(&h).is_err());
    }

    #[test]
    fn image_requirement_positions() {
        let reqs = ImageLayout.requirements(&image(8, &[3, 4]));
        let placed: Vec<(&str, Option<usize>)> = reqs
            .iter()
            .map(|r| (r.keyword.as_str(), r.position))
            .collect();
        assert_eq!(
            placed,
            [
                ("XTENSION", Some(0)),
                ("BITPIX", Some(1)),
                ("NAXIS", Some(2)),
                ("NAXIS1", Some(3)),
                ("NAXIS2", Some(4)),
                ("PCOUNT", Some(5)),
                ("GCOUNT", Some(6)),
            ]
        );
    }

    #[test]
    fn checks() {
        assert!(Check::Text("IMAGE".into()).accepts(&Value::String("IMAGE   ".into())));
        assert!(!Check::Logical(true).accepts(&Value::Integer(1)));
        assert!(Check::Range(0, 999).accepts(&Value::Integer(999)));
        assert!(!Check::NonNegative.accepts(&Value::Integer(-1)));
        assert!(Check::IntegerIn(vec![8, 16]).accepts(&Value::Integer(16)));
    }

    #[test]
    fn registry_lookup() {
        let registry = Registry::standard();
        assert!(registry.layout(HduKindTag::Corrupted).is_none());
        assert!(!registry.has_compression());
        let h = image(8, &[10]);
        let size = registry.layout(HduKindTag::Primary).unwrap().data_size(&h).unwrap();
        assert_eq!(size, 10);

        let registry = registry.with_compression(Arc::new(BinaryTableLayout));
        assert!(registry.has_compression());
    }
}
