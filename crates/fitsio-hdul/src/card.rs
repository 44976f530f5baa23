//! The card codec: one 80-column header record and its text grammar.
//!
//! A [`Card`] keeps the image it was parsed from (or last rendered to) so an
//! unmodified card always writes back byte for byte. Long string values span
//! several physical records under the `CONTINUE` convention; the image then
//! holds all of them.

use tracing::warn;

use crate::block::CARD_SIZE;
use crate::error::{Error, Result};
use crate::options::ParseMode;
use crate::value::{
    check_value, escape_string, format_fixed, format_float, format_value, is_printable,
    parse_number, parse_value_field, quote_string, Value,
};

/// Keywords whose cards carry free text instead of a value.
pub const COMMENTARY_KEYWORDS: [&str; 3] = ["", "COMMENT", "HISTORY"];

/// Columns available to the text of a commentary card.
pub const COMMENTARY_WIDTH: usize = 72;

/// Characters of escaped string that fit between the quotes of one record.
const STRING_FIELD_WIDTH: usize = 68;

/// Comment characters that fit after `CONTINUE  '&' / `.
const CONTINUE_COMMENT_WIDTH: usize = 64;

const HIERARCH_PREFIX: &str = "HIERARCH ";
const CONTINUE_KEYWORD: &str = "CONTINUE";

/// Layout of the value field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CardFormat {
    /// Strings open in column 11; other values are right-justified to column 30.
    #[default]
    Fixed,
    /// Value placed anywhere after the indicator.
    Free,
}

/// The parsed field of a record-valued keyword card (`'AXIS.1: 2'`).
#[derive(Debug, Clone, PartialEq)]
pub struct RecordField {
    /// Dotted field specifier, e.g. `AXIS.1`.
    pub specifier: String,
    /// The numeric value following the colon.
    pub value: f64,
}

/// A single header card, possibly spanning several records when it holds a
/// long string.
#[derive(Debug, Clone)]
pub struct Card {
    keyword: String,
    hierarch: bool,
    value: Option<Value>,
    comment: Option<String>,
    format: CardFormat,
    /// Number token as it was written; reused when only the comment changes.
    raw: Option<String>,
    field: Option<RecordField>,
    /// Why the record could not be decoded, for cards kept verbatim.
    opaque: Option<String>,
    image: String,
}

impl PartialEq for Card {
    fn eq(&self, other: &Self) -> bool {
        self.keyword == other.keyword && self.value == other.value && self.comment == other.comment
    }
}

impl Card {
    /// Construct a value card, normalising the keyword.
    ///
    /// Keywords longer than eight characters, containing blanks or carrying
    /// a `HIERARCH ` prefix become HIERARCH cards. Fails with a syntax error
    /// for illegal keywords or values and with a size error when the card
    /// cannot be laid out in 80 columns.
    pub fn new(keyword: &str, value: impl Into<Value>, comment: Option<&str>) -> Result<Card> {
        let (keyword, hierarch) = normalize_keyword(keyword)?;
        if !hierarch {
            if is_commentary_keyword(&keyword) {
                return Err(Error::syntax(keyword, "commentary keywords take text, not a value"));
            }
            if keyword == "END" || keyword == CONTINUE_KEYWORD {
                return Err(Error::syntax(keyword, "reserved keyword"));
            }
        }
        let value = value.into();
        check_value(&value).map_err(|reason| Error::syntax(keyword.clone(), reason))?;
        let comment = checked_comment(comment)?;

        let field = if hierarch { None } else { record_field(&value) };
        let mut card = Card {
            keyword,
            hierarch,
            value: Some(value),
            comment,
            format: if hierarch { CardFormat::Free } else { CardFormat::Fixed },
            raw: None,
            field,
            opaque: None,
            image: String::new(),
        };
        card.image = card.render()?;
        Ok(card)
    }

    /// Construct a commentary card (`COMMENT`, `HISTORY` or blank keyword).
    pub fn commentary(keyword: &str, text: &str) -> Result<Card> {
        let keyword = keyword.trim().to_ascii_uppercase();
        if !is_commentary_keyword(&keyword) {
            return Err(Error::syntax(keyword, "not a commentary keyword"));
        }
        if !text.bytes().all(is_printable) {
            return Err(Error::syntax(text, "non-printable character in text"));
        }
        if text.len() > COMMENTARY_WIDTH {
            return Err(Error::Size(format!(
                "{keyword} text is {} columns, limit is {COMMENTARY_WIDTH}",
                text.len()
            )));
        }
        let text = text.trim_end();
        let mut card = Card::valueless(&keyword, text);
        card.image = card.render()?;
        Ok(card)
    }

    /// An all-blank card.
    pub fn blank() -> Card {
        Card::valueless("", "")
    }

    /// The header terminator.
    pub(crate) fn end() -> Card {
        Card::valueless("END", "")
    }

    /// Construct a record-valued keyword card: `KEYWORD = 'FIELD.N: value'`.
    pub fn record(keyword: &str, specifier: &str, value: f64, comment: Option<&str>) -> Result<Card> {
        if !is_field_specifier(specifier) {
            return Err(Error::syntax(specifier, "invalid field specifier"));
        }
        if !value.is_finite() {
            return Err(Error::syntax(specifier, "non-finite float"));
        }
        let card = Card::new(keyword, format!("{specifier}: {}", format_field_number(value)), comment)?;
        if card.hierarch {
            return Err(Error::syntax(keyword, "record-valued keywords are limited to 8 characters"));
        }
        Ok(card)
    }

    fn valueless(keyword: &str, text: &str) -> Card {
        let image = format!("{keyword:<8}{text:<COMMENTARY_WIDTH$}");
        Card {
            keyword: keyword.to_string(),
            hierarch: false,
            value: None,
            comment: (!text.is_empty()).then(|| text.to_string()),
            format: CardFormat::Fixed,
            raw: None,
            field: None,
            opaque: None,
            image,
        }
    }

    /// Parse one 80-byte record, rejecting anything malformed.
    pub fn parse(record: &[u8]) -> Result<Card> {
        Card::parse_with(record, ParseMode::Strict)
    }

    /// Parse one 80-byte record.
    ///
    /// Under [`ParseMode::Lenient`] a record that does not decode is kept
    /// verbatim as an opaque commentary card; [`Card::opaque_reason`]
    /// reports why.
    pub fn parse_with(record: &[u8], mode: ParseMode) -> Result<Card> {
        if record.len() != CARD_SIZE {
            return Err(Error::Size(format!(
                "card record is {} bytes, expected {CARD_SIZE}",
                record.len()
            )));
        }
        let printable = record.iter().all(|&b| is_printable(b));
        let image: String = record
            .iter()
            .map(|&b| if is_printable(b) { b as char } else { ' ' })
            .collect();

        let decoded = if printable {
            decode(&image)
        } else {
            Err("non-printable character")
        };
        match decoded {
            Ok(card) => Ok(card),
            Err(reason) => match mode {
                ParseMode::Strict => Err(Error::syntax(image.trim_end(), reason)),
                ParseMode::Lenient => {
                    warn!(card = image.trim_end(), reason, "keeping unparsable card verbatim");
                    Ok(Card::opaque(image, reason))
                }
            },
        }
    }

    fn opaque(image: String, reason: &str) -> Card {
        Card {
            keyword: image[..8].trim_end().to_string(),
            hierarch: false,
            value: None,
            comment: Some(image[8..].trim_end().to_string()),
            format: CardFormat::Fixed,
            raw: None,
            field: None,
            opaque: Some(reason.to_string()),
            image,
        }
    }

    // ── Accessors ──

    /// Keyword, upper-case for standard cards, without the `HIERARCH ` prefix
    /// for extended ones.
    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    /// The value, or `None` for commentary and opaque cards.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// The comment; for valueless cards, their text.
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Text of a valueless card (commentary, or a keyword without `= `).
    pub fn text(&self) -> &str {
        match self.value {
            None => self.comment.as_deref().unwrap_or(""),
            Some(_) => "",
        }
    }

    /// Fixed or free layout of the value field.
    pub fn format(&self) -> CardFormat {
        self.format
    }

    /// Whether the card uses the `HIERARCH` convention.
    pub fn is_hierarch(&self) -> bool {
        self.hierarch
    }

    /// Whether this card carries commentary text (blank, `COMMENT`, `HISTORY`
    /// or an opaque record).
    pub fn is_commentary(&self) -> bool {
        self.opaque.is_some() || (!self.hierarch && is_commentary_keyword(&self.keyword))
    }

    /// An all-blank filler card.
    pub fn is_blank(&self) -> bool {
        self.opaque.is_none() && self.keyword.is_empty() && self.text().is_empty()
    }

    /// The `END` terminator.
    pub fn is_end(&self) -> bool {
        !self.hierarch && self.keyword == "END" && self.value.is_none()
    }

    /// A record kept verbatim because it did not decode.
    pub fn is_opaque(&self) -> bool {
        self.opaque.is_some()
    }

    /// Why an opaque card could not be decoded.
    pub fn opaque_reason(&self) -> Option<&str> {
        self.opaque.as_deref()
    }

    /// The record-valued field, when the string value follows that convention.
    pub fn field(&self) -> Option<&RecordField> {
        self.field.as_ref()
    }

    /// `KEYWORD.FIELD` for record-valued cards.
    pub fn compound_key(&self) -> Option<String> {
        self.field
            .as_ref()
            .map(|f| format!("{}.{}", self.keyword, f.specifier))
    }

    /// The rendered image: 80 columns per physical record.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Number of physical records the card occupies.
    pub fn record_count(&self) -> usize {
        self.image.len() / CARD_SIZE
    }

    // ── Mutation ──

    /// Replace the value and re-render.
    pub fn set_value(&mut self, value: impl Into<Value>) -> Result<()> {
        self.ensure_editable()?;
        if self.value.is_none() {
            return Err(Error::syntax(self.keyword.clone(), "valueless card cannot take a value"));
        }
        let value = value.into();
        check_value(&value).map_err(|reason| Error::syntax(self.keyword.clone(), reason))?;
        let field = if self.hierarch { None } else { record_field(&value) };
        let mut next = self.clone();
        next.value = Some(value);
        next.raw = None;
        next.field = field;
        next.commit()?;
        *self = next;
        Ok(())
    }

    /// Replace the comment (or, on a commentary card, the text) and re-render.
    pub fn set_comment(&mut self, comment: Option<&str>) -> Result<()> {
        self.ensure_editable()?;
        let comment = checked_comment(comment)?;
        if self.value.is_none() {
            if let Some(text) = &comment {
                if text.len() > COMMENTARY_WIDTH {
                    return Err(Error::Size(format!(
                        "{} text is {} columns, limit is {COMMENTARY_WIDTH}",
                        self.keyword,
                        text.len()
                    )));
                }
            }
        }
        let mut next = self.clone();
        next.comment = comment;
        next.commit()?;
        *self = next;
        Ok(())
    }

    /// Replace the number of a record-valued card, keeping its specifier.
    pub fn set_field_value(&mut self, value: f64) -> Result<()> {
        let specifier = match &self.field {
            Some(field) => field.specifier.clone(),
            None => {
                return Err(Error::syntax(self.keyword.clone(), "not a record-valued card"));
            }
        };
        if !value.is_finite() {
            return Err(Error::syntax(specifier, "non-finite float"));
        }
        self.set_value(format!("{specifier}: {}", format_field_number(value)))
    }

    /// Change the keyword, keeping value and comment.
    pub(crate) fn set_keyword(&mut self, keyword: &str) -> Result<()> {
        self.ensure_editable()?;
        let mut next = self.clone();
        if self.value.is_none() {
            let keyword = keyword.trim().to_ascii_uppercase();
            if !is_valid_keyword(&keyword) {
                return Err(Error::syntax(keyword, "illegal keyword characters"));
            }
            next.keyword = keyword;
        } else {
            let (keyword, hierarch) = normalize_keyword(keyword)?;
            next.keyword = keyword;
            next.hierarch = hierarch;
            if hierarch {
                next.format = CardFormat::Free;
                next.field = None;
            } else {
                next.field = next.value.as_ref().and_then(record_field);
            }
        }
        next.commit()?;
        *self = next;
        Ok(())
    }

    fn ensure_editable(&self) -> Result<()> {
        match &self.opaque {
            Some(_) => Err(Error::syntax(
                self.image.trim_end(),
                "unparsable card cannot be edited",
            )),
            None => Ok(()),
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.image = self.render()?;
        Ok(())
    }

    // ── Rendering ──

    fn render(&self) -> Result<String> {
        if self.hierarch {
            return self.render_hierarch();
        }
        let value = match &self.value {
            Some(value) => value,
            None => return self.render_valueless(),
        };
        let head = if self.keyword == CONTINUE_KEYWORD {
            String::from("CONTINUE  ")
        } else {
            format!("{:<8}= ", self.keyword)
        };

        if let Value::String(s) = value {
            let field = match self.format {
                CardFormat::Fixed => format_fixed(value),
                CardFormat::Free => quote_string(s, false),
            };
            let image = with_comment(head + &field, self.comment.as_deref());
            if image.len() <= CARD_SIZE {
                return Ok(pad_record(image));
            }
            return Ok(self.render_long_string(s));
        }

        let field = match (self.format, &self.raw) {
            (CardFormat::Fixed, Some(raw)) => format!("{raw:>20}"),
            (CardFormat::Free, Some(raw)) => raw.clone(),
            (CardFormat::Fixed, None) => format_fixed(value),
            (CardFormat::Free, None) => format_value(value),
        };
        let image = with_comment(head + &field, self.comment.as_deref());
        self.check_width(&image)?;
        Ok(pad_record(image))
    }

    fn render_valueless(&self) -> Result<String> {
        let image = format!("{:<8}{}", self.keyword, self.comment.as_deref().unwrap_or(""));
        self.check_width(&image)?;
        Ok(pad_record(image))
    }

    fn render_hierarch(&self) -> Result<String> {
        let token = match (&self.raw, &self.value) {
            (Some(raw), _) => raw.clone(),
            (None, Some(value)) => format_value(value),
            (None, None) => String::new(),
        };
        let image = with_comment(
            format!("{HIERARCH_PREFIX}{} = {token}", self.keyword),
            self.comment.as_deref(),
        );
        self.check_width(&image)?;
        Ok(pad_record(image))
    }

    fn render_long_string(&self, s: &str) -> String {
        let escaped = escape_string(s);
        let comment = self.comment.as_deref().unwrap_or("");

        let mut chunks = split_escaped(&escaped, STRING_FIELD_WIDTH);
        let mut comment_inline = comment.is_empty();
        if !comment.is_empty() {
            let last = chunks[chunks.len() - 1];
            // `CONTINUE  '` + chunk + `' / ` + comment
            comment_inline = 11 + last.len() + 4 + comment.len() <= CARD_SIZE;
            if !comment_inline {
                chunks = split_escaped(&escaped, STRING_FIELD_WIDTH - 1);
            }
        }

        let mut records = Vec::new();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let head = if i == 0 {
                format!("{:<8}= ", self.keyword)
            } else {
                String::from("CONTINUE  ")
            };
            let record = if i < last || !comment_inline {
                format!("{head}'{chunk}&'")
            } else if comment.is_empty() {
                format!("{head}'{chunk}'")
            } else {
                format!("{head}'{chunk}' / {comment}")
            };
            records.push(pad_record(record));
        }

        if !comment_inline {
            let parts = split_comment(comment, CONTINUE_COMMENT_WIDTH);
            let last = parts.len() - 1;
            for (i, part) in parts.iter().enumerate() {
                let marker = if i < last { "&" } else { "" };
                records.push(pad_record(format!("CONTINUE  '{marker}' / {part}")));
            }
        }
        records.concat()
    }

    fn check_width(&self, image: &str) -> Result<()> {
        if image.len() > CARD_SIZE {
            return Err(Error::Size(format!(
                "card {} needs {} columns",
                self.keyword,
                image.len()
            )));
        }
        Ok(())
    }

    // ── CONTINUE assembly ──

    /// Whether a following `CONTINUE` record would extend this card's value.
    pub(crate) fn expects_continuation(&self) -> bool {
        !self.hierarch
            && self.opaque.is_none()
            && matches!(&self.value, Some(Value::String(s)) if s.ends_with('&'))
    }

    /// Whether this record can extend a long string.
    pub(crate) fn is_continuation(&self) -> bool {
        self.keyword == CONTINUE_KEYWORD && matches!(self.value, Some(Value::String(_)))
    }

    /// Absorb a `CONTINUE` record into this card.
    pub(crate) fn absorb(&mut self, next: Card) {
        if let (Some(Value::String(head)), Some(Value::String(tail))) = (&mut self.value, next.value) {
            head.pop();
            head.push_str(&tail);
        }
        let tail = match continue_comment(&next.image) {
            Some(raw) => Some(raw.to_string()),
            None => next.comment,
        };
        // Text reaching column 80 was cut mid-text; shorter pieces lost one blank.
        let cut_mid_text = self.image.as_bytes().last().is_some_and(|&b| b != b' ');
        self.comment = match (self.comment.take(), tail) {
            (Some(a), Some(b)) if cut_mid_text => Some(a + &b),
            (Some(a), Some(b)) => Some(format!("{a} {b}")),
            (a, b) => a.or(b),
        };
        self.image.push_str(&next.image);
        self.field = self.value.as_ref().and_then(record_field);
    }
}

/// Decode a printable 80-column image.
fn decode(image: &str) -> std::result::Result<Card, &'static str> {
    if image[..9].eq_ignore_ascii_case(HIERARCH_PREFIX) {
        if let Some(eq) = image.find('=') {
            return decode_hierarch(image, eq);
        }
    }

    let keyword = image[..8].trim_end();
    if !is_valid_keyword(keyword) {
        return Err("illegal keyword characters");
    }
    let text = image[8..].trim_end();

    if is_commentary_keyword(keyword) || keyword == "END" {
        let mut card = Card::valueless(keyword, text);
        card.image = image.to_string();
        return Ok(card);
    }

    let (indicator, field) = if keyword == CONTINUE_KEYWORD {
        (&image[8..10] == "  ", &image[10..])
    } else {
        (&image[8..10] == "= ", &image[10..])
    };
    if !indicator {
        let mut card = Card::valueless(keyword, text);
        card.image = image.to_string();
        return Ok(card);
    }

    let parsed = match parse_value_field(field) {
        Ok(parsed) => parsed,
        // A CONTINUE record without a string is plain text.
        Err(_) if keyword == CONTINUE_KEYWORD => {
            let mut card = Card::valueless(keyword, text);
            card.image = image.to_string();
            return Ok(card);
        }
        Err(reason) => return Err(reason),
    };
    if keyword == CONTINUE_KEYWORD && !matches!(parsed.value, Value::String(_)) {
        let mut card = Card::valueless(keyword, text);
        card.image = image.to_string();
        return Ok(card);
    }

    let numeric = !matches!(parsed.value, Value::String(_) | Value::Undefined);
    Ok(Card {
        keyword: keyword.to_string(),
        hierarch: false,
        field: record_field(&parsed.value),
        value: Some(parsed.value),
        comment: parsed.comment,
        format: if parsed.fixed && keyword != CONTINUE_KEYWORD {
            CardFormat::Fixed
        } else {
            CardFormat::Free
        },
        raw: numeric.then_some(parsed.raw),
        opaque: None,
        image: image.to_string(),
    })
}

fn decode_hierarch(image: &str, eq: usize) -> std::result::Result<Card, &'static str> {
    let keyword = image[9..eq].trim();
    if keyword.is_empty() {
        return Err("empty HIERARCH keyword");
    }
    let parsed = parse_value_field(&image[eq + 1..])?;
    let numeric = !matches!(parsed.value, Value::String(_) | Value::Undefined);
    Ok(Card {
        keyword: keyword.to_string(),
        hierarch: true,
        value: Some(parsed.value),
        comment: parsed.comment,
        format: CardFormat::Free,
        raw: numeric.then_some(parsed.raw),
        field: None,
        opaque: None,
        image: image.to_string(),
    })
}

/// `true` if `keyword` is at most 8 characters from `[A-Z0-9_-]`.
pub fn is_valid_keyword(keyword: &str) -> bool {
    keyword.len() <= 8
        && keyword
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

/// Blank, `COMMENT` or `HISTORY`.
pub fn is_commentary_keyword(keyword: &str) -> bool {
    COMMENTARY_KEYWORDS.contains(&keyword)
}

/// Split a user-supplied keyword into its stored form and HIERARCH flag.
pub(crate) fn normalize_keyword(keyword: &str) -> Result<(String, bool)> {
    let trimmed = keyword.trim();
    let (name, hierarch) = match strip_hierarch(trimmed) {
        Some(rest) => (rest.trim(), true),
        None => (trimmed, trimmed.len() > 8 || trimmed.contains(' ')),
    };
    if hierarch {
        if name.is_empty() || !name.bytes().all(|b| is_printable(b) && b != b'=') {
            return Err(Error::syntax(keyword, "illegal HIERARCH keyword"));
        }
        return Ok((name.to_string(), true));
    }
    let upper = name.to_ascii_uppercase();
    if !is_valid_keyword(&upper) {
        return Err(Error::syntax(keyword, "illegal keyword characters"));
    }
    Ok((upper, false))
}

pub(crate) fn strip_hierarch(keyword: &str) -> Option<&str> {
    if keyword.len() >= HIERARCH_PREFIX.len()
        && keyword[..HIERARCH_PREFIX.len()].eq_ignore_ascii_case(HIERARCH_PREFIX)
    {
        Some(&keyword[HIERARCH_PREFIX.len()..])
    } else {
        None
    }
}

fn checked_comment(comment: Option<&str>) -> Result<Option<String>> {
    match comment {
        Some(c) if !c.bytes().all(is_printable) => {
            Err(Error::syntax(c, "non-printable character in comment"))
        }
        Some(c) => {
            let c = c.trim_end();
            Ok((!c.is_empty()).then(|| c.to_string()))
        }
        None => Ok(None),
    }
}

fn with_comment(head: String, comment: Option<&str>) -> String {
    match comment {
        Some(comment) => format!("{head} / {comment}"),
        None => head,
    }
}

fn pad_record(record: String) -> String {
    format!("{record:<CARD_SIZE$}")
}

/// Cut an escaped string into quote-field chunks: every chunk but the last
/// leaves room for the `&` marker, and no chunk ends between the two quotes
/// of an escaped pair.
fn split_escaped(escaped: &str, last_width: usize) -> Vec<&str> {
    let bytes = escaped.as_bytes();
    let mut chunks = Vec::new();
    let mut start = 0;
    while bytes.len() - start > last_width {
        let mut end = start;
        while end < bytes.len() {
            let step = if bytes[end] == b'\'' { 2 } else { 1 };
            if end + step - start > STRING_FIELD_WIDTH - 1 {
                break;
            }
            end += step;
        }
        chunks.push(&escaped[start..end]);
        start = end;
    }
    chunks.push(&escaped[start..]);
    chunks
}

/// Break a comment into pieces of at most `width` characters.
///
/// A piece shorter than `width` ends at a blank that follows text, and that
/// one blank is dropped. Without such a blank the piece is cut at exactly
/// `width` characters. [`Card::absorb`] rejoins pieces by the same rule.
fn split_comment(comment: &str, width: usize) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = comment;
    while rest.len() > width {
        let bytes = rest.as_bytes();
        match (1..width).rev().find(|&i| bytes[i] == b' ' && bytes[i - 1] != b' ') {
            Some(i) => {
                parts.push(&rest[..i]);
                rest = &rest[i + 1..];
            }
            None => {
                parts.push(&rest[..width]);
                rest = &rest[width..];
            }
        }
    }
    parts.push(rest);
    parts
}

/// Comment text of a `CONTINUE` record, keeping any blanks after the one
/// that follows the slash.
fn continue_comment(image: &str) -> Option<&str> {
    let field = image.get(10..CARD_SIZE)?;
    let bytes = field.as_bytes();
    let mut i = field.find('\'')? + 1;
    loop {
        match *bytes.get(i)? {
            b'\'' if bytes.get(i + 1) == Some(&b'\'') => i += 2,
            b'\'' => break,
            _ => i += 1,
        }
    }
    let text = field[i + 1..].trim_start_matches(' ').strip_prefix('/')?;
    let text = text.strip_prefix(' ').unwrap_or(text).trim_end();
    (!text.is_empty()).then_some(text)
}

/// Recognise `field.spec: number` inside a string value.
fn record_field(value: &Value) -> Option<RecordField> {
    let text = value.as_str()?;
    let (specifier, number) = text.split_once(':')?;
    let specifier = specifier.trim();
    if !is_field_specifier(specifier) {
        return None;
    }
    let value = parse_number(number.trim())?.as_float()?;
    Some(RecordField {
        specifier: specifier.to_string(),
        value,
    })
}

/// `identifier(.digits)?(.identifier(.digits)?)*`
pub(crate) fn is_field_specifier(spec: &str) -> bool {
    let is_identifier = |part: &str| {
        let mut bytes = part.bytes();
        matches!(bytes.next(), Some(b) if b.is_ascii_alphabetic() || b == b'_')
            && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
    };
    let is_index = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());

    let mut previous_was_identifier = false;
    for (i, part) in spec.split('.').enumerate() {
        if is_identifier(part) {
            previous_was_identifier = true;
        } else if i > 0 && previous_was_identifier && is_index(part) {
            previous_was_identifier = false;
        } else {
            return false;
        }
    }
    true
}

fn format_field_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format_float(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(s: &str) -> Vec<u8> {
        format!("{s:<80}").into_bytes()
    }

    fn records(card: &Card) -> Vec<&str> {
        (0..card.record_count())
            .map(|i| &card.image()[i * CARD_SIZE..(i + 1) * CARD_SIZE])
            .collect()
    }

    /// Decode the physical records of a card image back into one card.
    fn reparse(image: &str) -> Card {
        let mut cards = image
            .as_bytes()
            .chunks(CARD_SIZE)
            .map(|r| Card::parse(r).unwrap());
        let mut head = cards.next().unwrap();
        for next in cards {
            assert!(head.expects_continuation() && next.is_continuation());
            head.absorb(next);
        }
        head
    }

    #[test]
    fn parse_simple_card() {
        let card = Card::parse(&record(
            "SIMPLE  =                    T / conforms to FITS standard",
        ))
        .unwrap();
        assert_eq!(card.keyword(), "SIMPLE");
        assert_eq!(card.value(), Some(&Value::Logical(true)));
        assert_eq!(card.comment(), Some("conforms to FITS standard"));
        assert_eq!(card.format(), CardFormat::Fixed);
    }

    #[test]
    fn parse_escaped_quote() {
        let card = Card::parse(&record("ABC     = 'abc''s value'")).unwrap();
        assert_eq!(card.value(), Some(&Value::String("abc's value".into())));
        assert_eq!(card.format(), CardFormat::Fixed);
    }

    #[test]
    fn parse_free_format() {
        let card = Card::parse(&record("NAXIS1  = 100 / width")).unwrap();
        assert_eq!(card.value(), Some(&Value::Integer(100)));
        assert_eq!(card.format(), CardFormat::Free);
        let card = Card::parse(&record("OBJECT  =   'M31'")).unwrap();
        assert_eq!(card.format(), CardFormat::Free);
    }

    #[test]
    fn parse_commentary() {
        let card = Card::parse(&record("COMMENT   = not a value / really")).unwrap();
        assert!(card.is_commentary());
        assert!(card.value().is_none());
        assert_eq!(card.text(), "  = not a value / really");

        let card = Card::parse(&record("HISTORY written by hand")).unwrap();
        assert_eq!(card.text(), "written by hand");

        let blank = Card::parse(&record("")).unwrap();
        assert!(blank.is_blank());
    }

    #[test]
    fn parse_end_and_keyword_without_indicator() {
        assert!(Card::parse(&record("END")).unwrap().is_end());
        let card = Card::parse(&record("DATE    2001-01-01")).unwrap();
        assert_eq!(card.keyword(), "DATE");
        assert!(card.value().is_none());
        assert_eq!(card.text(), "2001-01-01");
    }

    #[test]
    fn undefined_value() {
        let card = Card::parse(&record("BLANK   =                      / no value")).unwrap();
        assert_eq!(card.value(), Some(&Value::Undefined));
        assert_eq!(card.comment(), Some("no value"));
    }

    #[test]
    fn strict_rejects_lowercase_keyword() {
        let err = Card::parse(&record("bitpix  =                   16")).unwrap_err();
        assert!(matches!(err, Error::Syntax { .. }));
    }

    #[test]
    fn lenient_keeps_bad_card_verbatim() {
        let raw = record("bitpix  =                   16");
        let card = Card::parse_with(&raw, ParseMode::Lenient).unwrap();
        assert!(card.is_opaque());
        assert!(card.is_commentary());
        assert_eq!(card.image().as_bytes(), &raw[..]);
        assert_eq!(card.opaque_reason(), Some("illegal keyword characters"));
    }

    #[test]
    fn unterminated_string_is_syntax_error() {
        let err = Card::parse(&record("OBJECT  = 'M31")).unwrap_err();
        assert!(matches!(err, Error::Syntax { reason: "unterminated string", .. }));
    }

    #[test]
    fn bad_value_token() {
        assert!(Card::parse(&record("NAXIS   =   2X")).is_err());
    }

    #[test]
    fn non_printable_bytes() {
        let mut raw = record("OBJECT  = 'M31'");
        raw[20] = 0x07;
        assert!(Card::parse(&raw).is_err());
        let card = Card::parse_with(&raw, ParseMode::Lenient).unwrap();
        assert!(card.is_opaque());
        assert!(card.image().bytes().all(is_printable));
    }

    #[test]
    fn wrong_record_length() {
        assert!(matches!(Card::parse(b"SIMPLE"), Err(Error::Size(_))));
    }

    #[test]
    fn render_fixed_cards() {
        let card = Card::new("naxis", 2, Some("number of axes")).unwrap();
        assert_eq!(card.keyword(), "NAXIS");
        assert_eq!(
            card.image(),
            format!("{:<80}", "NAXIS   =                    2 / number of axes")
        );
        let card = Card::new("OBJECT", "M31", None).unwrap();
        assert_eq!(card.image(), format!("{:<80}", "OBJECT  = 'M31     '"));
        let card = Card::new("EMPTY", "", None).unwrap();
        assert_eq!(card.image(), format!("{:<80}", "EMPTY   = ''"));
    }

    #[test]
    fn parsed_images_are_preserved() {
        for text in [
            "SIMPLE  =                    T / conforms to FITS standard",
            "EXPTIME =   1.50000000000E+03 / old style float",
            "NAXIS1  = 100 / free",
            "CRVAL1  = 0012.5",
            "OBJECT  = 'abc''s value'      /comment without blank",
            "HISTORY   odd spacing",
            "HIERARCH ESO DET CHIP = 5 / chip",
        ] {
            let raw = record(text);
            let card = Card::parse(&raw).unwrap();
            assert_eq!(card.image().as_bytes(), &raw[..], "{text}");
        }
    }

    #[test]
    fn comment_edit_keeps_number_text() {
        let mut card = Card::parse(&record("EXPTIME =    1.50000000000E+03 / old")).unwrap();
        card.set_comment(Some("new")).unwrap();
        assert_eq!(
            card.image(),
            format!("{:<80}", "EXPTIME =    1.50000000000E+03 / new")
        );
        card.set_value(2.5).unwrap();
        assert_eq!(card.image(), format!("{:<80}", "EXPTIME =                  2.5 / new"));
    }

    #[test]
    fn constructed_cards_round_trip() {
        let cards = [
            Card::new("BITPIX", -32, Some("bits")).unwrap(),
            Card::new("BSCALE", 1.25, None).unwrap(),
            Card::new("EXTEND", true, None).unwrap(),
            Card::new("OBJECT", "it's here", Some("target")).unwrap(),
            Card::new("CPX", Value::ComplexFloat(1.5, -2.0), None).unwrap(),
            Card::new("CPXI", Value::ComplexInt(3, 4), None).unwrap(),
            Card::new("UNDEF", Value::Undefined, Some("nothing")).unwrap(),
            Card::new("HIERARCH ESO TEL ALT", 45.5, Some("deg")).unwrap(),
            Card::commentary("HISTORY", "processed").unwrap(),
            Card::blank(),
        ];
        for card in cards {
            let back = reparse(card.image());
            assert_eq!(back, card, "{}", card.image());
            assert_eq!(back.image(), card.image());
        }
    }

    #[test]
    fn long_string_180_chars() {
        let value: String = (0..180).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        let card = Card::new("LONGSTR", value.as_str(), None).unwrap();
        let recs = records(&card);
        assert_eq!(recs.len(), 3);
        assert!(recs[0].starts_with("LONGSTR = '"));
        assert!(recs[0].trim_end().ends_with("&'"));
        assert!(recs[1].starts_with("CONTINUE  '"));
        assert!(recs[1].trim_end().ends_with("&'"));
        assert!(!recs[2].trim_end().ends_with("&'"));

        let joined: String = recs
            .iter()
            .map(|r| {
                let inner = r.trim_end();
                let inner = &inner[11..inner.len() - 1];
                inner.strip_suffix('&').unwrap_or(inner).to_string()
            })
            .collect();
        assert_eq!(joined, value);
        assert_eq!(reparse(card.image()).value(), Some(&Value::String(value)));
    }

    #[test]
    fn long_string_never_splits_escaped_quote() {
        let value = "'".repeat(100);
        let card = Card::new("QUOTES", value.as_str(), Some("q")).unwrap();
        for rec in records(&card) {
            let inner = rec.trim_end();
            let quotes = inner[10..].split(" / ").next().unwrap();
            let inner = &quotes[1..quotes.len() - 1];
            let inner = inner.strip_suffix('&').unwrap_or(inner);
            assert_eq!(inner.len() % 2, 0, "{rec}");
        }
        let back = reparse(card.image());
        assert_eq!(back.value(), Some(&Value::String(value)));
        assert_eq!(back.comment(), Some("q"));
    }

    #[test]
    fn long_comment_moves_to_continue_cards() {
        let value = "x".repeat(68);
        let comment = "word ".repeat(30);
        let comment = comment.trim_end();
        let card = Card::new("KEY", value.as_str(), Some(comment)).unwrap();
        assert!(card.record_count() >= 3);
        let back = reparse(card.image());
        assert_eq!(back.value(), Some(&Value::String(value)));
        assert_eq!(back.comment(), Some(comment));
    }

    #[test]
    fn long_comment_without_blanks_round_trips() {
        let value = "v".repeat(100);
        let comment = "c".repeat(100);
        let card = Card::new("KEY", value.as_str(), Some(&comment)).unwrap();
        let back = reparse(card.image());
        assert_eq!(back.value(), Some(&Value::String(value)));
        assert_eq!(back.comment(), Some(comment.as_str()));
    }

    #[test]
    fn long_comment_keeps_runs_of_blanks() {
        let value = "v".repeat(70);
        let comments = [
            format!("{}  {}", "a".repeat(63), "b".repeat(40)),
            format!("{}   {}", "a".repeat(30), "b".repeat(80)),
            format!("{} {}    tail", "a".repeat(62), "b".repeat(10)),
        ];
        for comment in &comments {
            let card = Card::new("KEY", value.as_str(), Some(comment)).unwrap();
            let back = reparse(card.image());
            assert_eq!(back.comment(), Some(comment.as_str()), "{:?}", records(&card));
        }
    }

    #[test]
    fn long_comment_on_number_is_size_error() {
        let comment = "c".repeat(60);
        assert!(matches!(
            Card::new("NAXIS", 2, Some(&comment)),
            Err(Error::Size(_))
        ));
    }

    #[test]
    fn hierarch_cards() {
        let card = Card::parse(&record("HIERARCH ESO DET CHIP NAME = 'CCD-44' / chip id")).unwrap();
        assert!(card.is_hierarch());
        assert_eq!(card.keyword(), "ESO DET CHIP NAME");
        assert_eq!(card.value(), Some(&Value::String("CCD-44".into())));
        assert_eq!(card.comment(), Some("chip id"));

        let card = Card::new("A_VERY_LONG_KEYWORD", 1, None).unwrap();
        assert!(card.is_hierarch());
        assert!(card.image().starts_with("HIERARCH A_VERY_LONG_KEYWORD = 1"));
    }

    #[test]
    fn hierarch_too_long() {
        let keyword = format!("HIERARCH {}", "K".repeat(60));
        assert!(matches!(
            Card::new(&keyword, "a long enough value", None),
            Err(Error::Size(_))
        ));
    }

    #[test]
    fn record_valued_cards() {
        let card = Card::parse(&record("DP1     = 'AXIS.1: 1'")).unwrap();
        let field = card.field().unwrap();
        assert_eq!(field.specifier, "AXIS.1");
        assert_eq!(field.value, 1.0);
        assert_eq!(card.compound_key().as_deref(), Some("DP1.AXIS.1"));

        let mut card = Card::record("DP1", "NAUX", 2.0, None).unwrap();
        assert_eq!(card.value(), Some(&Value::String("NAUX: 2".into())));
        card.set_field_value(3.5).unwrap();
        assert_eq!(card.field().unwrap().value, 3.5);

        assert!(Card::parse(&record("OBJECT  = 'not: a number'")).unwrap().field().is_none());
        assert!(Card::record("DP1", "1.AXIS", 1.0, None).is_err());
    }

    #[test]
    fn field_specifier_grammar() {
        assert!(is_field_specifier("AXIS"));
        assert!(is_field_specifier("AXIS.1"));
        assert!(is_field_specifier("AXIS.1.SCALE"));
        assert!(is_field_specifier("AXIS.1.SCALE.2"));
        assert!(!is_field_specifier("AXIS.1.2"));
        assert!(!is_field_specifier("1"));
        assert!(!is_field_specifier("AXIS."));
        assert!(!is_field_specifier(""));
    }

    #[test]
    fn constructor_validation() {
        assert!(Card::new("BAD KEY!", 1, None).is_ok());
        assert!(Card::new("bad=key", 1, None).is_err());
        assert!(Card::new("COMMENT", 1, None).is_err());
        assert!(Card::new("END", 1, None).is_err());
        assert!(Card::new("CONTINUE", "x", None).is_err());
        assert!(Card::new("X", f64::INFINITY, None).is_err());
        assert!(Card::commentary("OBJECT", "x").is_err());
        assert!(matches!(
            Card::commentary("COMMENT", &"z".repeat(73)),
            Err(Error::Size(_))
        ));
    }

    #[test]
    fn opaque_cards_reject_edits() {
        let mut card = Card::parse_with(&record("bad     = 1"), ParseMode::Lenient).unwrap();
        assert!(card.set_comment(Some("x")).is_err());
    }

    #[test]
    fn rename_keeps_value() {
        let mut card = Card::new("OLD", 7, Some("c")).unwrap();
        card.set_keyword("new").unwrap();
        assert_eq!(card.keyword(), "NEW");
        assert_eq!(card.value(), Some(&Value::Integer(7)));
        assert!(card.image().starts_with("NEW     ="));
    }

    #[test]
    fn comment_splitting() {
        assert_eq!(split_comment("abc def", 64), vec!["abc def"]);
        assert_eq!(split_comment("aaaa bbbb", 6), vec!["aaaa", "bbbb"]);
        assert_eq!(split_comment("abcdefgh", 3), vec!["abc", "def", "gh"]);
        assert_eq!(split_comment("ab  cdef", 4), vec!["ab", " cde", "f"]);
    }
}
