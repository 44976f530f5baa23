//! Ordered, keyword-indexed collections of cards.

use tracing::warn;

use crate::block::{pad_header, padded_byte_len, CARD_SIZE};
use crate::card::{
    is_commentary_keyword, is_field_specifier, normalize_keyword, strip_hierarch, Card,
    COMMENTARY_WIDTH,
};
use crate::error::{Error, Result};
use crate::options::{Options, ParseMode};
use crate::value::Value;

// ── Lookup keys ──

/// Where a key landed inside a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    pub index: usize,
    /// The key addressed the field of a record-valued card rather than the
    /// card itself.
    pub field: bool,
}

/// Types that can identify cards within a [`Header`].
///
/// Implemented for a card index (`usize`), a keyword (`&str`, `String`),
/// which may also be a compound record-valued key such as `DP1.AXIS.1`,
/// and `(keyword, n)` naming the n-th (0-based) card with that keyword.
pub trait CardKey {
    /// The first card this key identifies.
    fn locate(&self, header: &Header) -> Option<Located>;

    /// Every card this key identifies, in header order.
    fn locate_all(&self, header: &Header) -> Vec<usize> {
        self.locate(header).map(|l| vec![l.index]).unwrap_or_default()
    }

    /// Text used in error messages.
    fn describe(&self) -> String;
}

impl CardKey for usize {
    fn locate(&self, header: &Header) -> Option<Located> {
        (*self < header.cards.len()).then_some(Located {
            index: *self,
            field: false,
        })
    }

    fn describe(&self) -> String {
        format!("card #{self}")
    }
}

impl CardKey for &str {
    fn locate(&self, header: &Header) -> Option<Located> {
        if let Some(index) = header.positions(self).next() {
            return Some(Located {
                index,
                field: false,
            });
        }
        header.compound_position(self).map(|index| Located { index, field: true })
    }

    fn locate_all(&self, header: &Header) -> Vec<usize> {
        let all: Vec<usize> = header.positions(self).collect();
        if !all.is_empty() {
            return all;
        }
        header.compound_position(self).into_iter().collect()
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

impl CardKey for String {
    fn locate(&self, header: &Header) -> Option<Located> {
        self.as_str().locate(header)
    }

    fn locate_all(&self, header: &Header) -> Vec<usize> {
        self.as_str().locate_all(header)
    }

    fn describe(&self) -> String {
        self.clone()
    }
}

impl CardKey for (&str, usize) {
    fn locate(&self, header: &Header) -> Option<Located> {
        header.positions(self.0).nth(self.1).map(|index| Located {
            index,
            field: false,
        })
    }

    fn describe(&self) -> String {
        format!("{}[{}]", self.0, self.1)
    }
}

/// Insertion point for [`Header::update`] when the keyword is new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor<'a> {
    Before(&'a str),
    After(&'a str),
}

// ── Header ──

/// The cards of one HDU header, in order, without the `END` card.
#[derive(Debug, Clone, Default)]
pub struct Header {
    cards: Vec<Card>,
    case_sensitive: bool,
    modified: bool,
}

/// Result of decoding raw header records.
#[derive(Debug)]
pub(crate) struct Decoded {
    pub header: Header,
    pub warnings: Vec<String>,
    pub found_end: bool,
}

impl Header {
    /// An empty header with default options.
    pub fn new() -> Self {
        Header::default()
    }

    /// An empty header using the case sensitivity of `options`.
    pub fn with_options(options: &Options) -> Self {
        Header {
            case_sensitive: options.case_sensitive,
            ..Header::default()
        }
    }

    /// A header holding `cards` in order.
    pub fn from_cards(cards: Vec<Card>) -> Self {
        Header {
            cards,
            ..Header::default()
        }
    }

    /// Decode a complete serialized header (records up to and including
    /// `END`), rejecting malformed cards.
    pub fn from_bytes(bytes: &[u8]) -> Result<Header> {
        let decoded = Header::decode(bytes, ParseMode::Strict)?;
        if !decoded.found_end {
            return Err(Error::Structural("header has no END card".into()));
        }
        Ok(decoded.header)
    }

    /// Decode 80-byte records until `END`, joining `CONTINUE` chains.
    pub(crate) fn decode(bytes: &[u8], mode: ParseMode) -> Result<Decoded> {
        let mut cards: Vec<Card> = Vec::new();
        let mut warnings = Vec::new();
        let mut found_end = false;

        for (i, record) in bytes.chunks_exact(CARD_SIZE).enumerate() {
            if is_end_record(record) {
                found_end = true;
                break;
            }
            let card = Card::parse_with(record, mode)?;
            if let Some(reason) = card.opaque_reason() {
                warnings.push(format!(
                    "card {i} kept verbatim ({reason}): {}",
                    card.image().trim_end()
                ));
            }
            match cards.last_mut() {
                Some(prev) if prev.expects_continuation() && card.is_continuation() => {
                    prev.absorb(card)
                }
                _ => cards.push(card),
            }
        }

        Ok(Decoded {
            header: Header::from_cards(cards),
            warnings,
            found_end,
        })
    }

    pub(crate) fn set_case_sensitive(&mut self, case_sensitive: bool) {
        self.case_sensitive = case_sensitive;
    }

    // ── Inspection ──

    /// Number of logical cards (a long string counts once).
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// All cards, excluding `END`.
    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Card> {
        self.cards.iter()
    }

    /// Keywords in card order, duplicates included.
    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.cards.iter().map(Card::keyword)
    }

    /// Whether any card has changed since the header was read or last written.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn mark_saved(&mut self) {
        self.modified = false;
    }

    /// The first card matching `key`.
    pub fn get<K: CardKey>(&self, key: K) -> Option<&Card> {
        key.locate(self).map(|l| &self.cards[l.index])
    }

    /// Value of the first matching card. A compound record-valued key yields
    /// the field's number.
    pub fn value<K: CardKey>(&self, key: K) -> Option<Value> {
        let located = key.locate(self)?;
        let card = &self.cards[located.index];
        if located.field {
            return card.field().map(|f| Value::Float(f.value));
        }
        card.value().cloned()
    }

    /// Comment of the first card with this keyword.
    pub fn comments(&self, keyword: &str) -> Option<&str> {
        self.get(keyword).and_then(Card::comment)
    }

    /// Text of every `HISTORY` card.
    pub fn history(&self) -> Vec<&str> {
        self.commentary_text("HISTORY")
    }

    /// Text of every card with the given commentary keyword.
    pub fn commentary_text(&self, keyword: &str) -> Vec<&str> {
        self.positions(keyword).map(|i| self.cards[i].text()).collect()
    }

    /// Index of the first card matching `key`.
    pub fn index_of<K: CardKey>(&self, key: K) -> Option<usize> {
        key.locate(self).map(|l| l.index)
    }

    pub fn contains<K: CardKey>(&self, key: K) -> bool {
        key.locate(self).is_some()
    }

    /// Number of cards carrying `keyword`.
    pub fn count(&self, keyword: &str) -> usize {
        self.positions(keyword).count()
    }

    /// Cards whose keyword matches a pattern where `*` stands for any run of
    /// word characters, `?` for exactly one and `...` for any run of
    /// non-blank characters. Matching ignores case.
    pub fn wildcard_select(&self, pattern: &str) -> Vec<&Card> {
        let tokens = compile_pattern(pattern);
        self.cards
            .iter()
            .filter(|c| !c.is_opaque() && glob_match(&tokens, c.keyword().as_bytes()))
            .collect()
    }

    /// Number of blank filler cards directly preceding `END`.
    pub fn count_trailing_blanks(&self) -> usize {
        self.cards.iter().rev().take_while(|c| c.is_blank()).count()
    }

    /// An independent deep copy of every card.
    pub fn copy(&self) -> Header {
        let mut copy = self.clone();
        copy.modified = false;
        copy
    }

    // ── Mutation ──

    /// Replace the value of the first matching card.
    pub fn set<K: CardKey>(&mut self, key: K, value: impl Into<Value>) -> Result<()> {
        let located = key
            .locate(self)
            .ok_or_else(|| Error::KeywordNotFound(key.describe()))?;
        let value = value.into();
        let card = &mut self.cards[located.index];
        if located.field {
            let number = value
                .as_float()
                .ok_or_else(|| Error::syntax(key.describe(), "record-valued field must be numeric"))?;
            if card.field().map(|f| f.value) == Some(number) {
                return Ok(());
            }
            card.set_field_value(number)?;
        } else {
            if card.value() == Some(&value) {
                return Ok(());
            }
            card.set_value(value)?;
        }
        self.modified = true;
        Ok(())
    }

    /// Replace the comment of the first matching card.
    pub fn set_comment<K: CardKey>(&mut self, key: K, comment: Option<&str>) -> Result<()> {
        let index = self.require(&key)?;
        self.cards[index].set_comment(comment)?;
        self.modified = true;
        Ok(())
    }

    /// Upsert: update the first card with `keyword` in place (keeping its
    /// comment unless a new one is given), or create it relative to `anchor`,
    /// or append it.
    pub fn update(
        &mut self,
        keyword: &str,
        value: impl Into<Value>,
        comment: Option<&str>,
        anchor: Option<Anchor<'_>>,
    ) -> Result<()> {
        let value = value.into();
        if let Some(located) = keyword.locate(self) {
            self.set(keyword, value)?;
            if comment.is_some() && !located.field {
                self.set_comment(located.index, comment)?;
            }
            return Ok(());
        }

        let card = new_card(keyword, value, comment)?;
        match anchor {
            None => self.append(card),
            Some(Anchor::Before(key)) => {
                let index = self.require(&key)?;
                self.insert(index, card);
            }
            Some(Anchor::After(key)) => {
                let index = self.require(&key)?;
                self.insert(index + 1, card);
            }
        }
        Ok(())
    }

    /// Insert a card at `index`, consuming trailing blank filler so the
    /// header does not grow when room is available.
    pub fn insert(&mut self, index: usize, card: Card) {
        let index = index.min(self.cards.len());
        let records = card.record_count();
        let blank = card.is_blank();
        self.cards.insert(index, card);
        if !blank {
            self.use_blanks(records);
        }
        self.modified = true;
    }

    /// Append a card.
    ///
    /// Blank cards go to the very end. Commentary cards follow the last
    /// non-blank card; any other card follows the last non-commentary card.
    /// Trailing blank filler is consumed.
    pub fn append(&mut self, card: Card) {
        self.append_at(card, false);
    }

    /// Append a card after the last non-blank card regardless of its kind.
    pub fn append_bottom(&mut self, card: Card) {
        self.append_at(card, true);
    }

    fn append_at(&mut self, card: Card, bottom: bool) {
        if card.is_blank() {
            self.cards.push(card);
            self.modified = true;
            return;
        }
        let mut index = self.cards.len() - self.count_trailing_blanks();
        if !bottom && !card.is_commentary() {
            while index > 0 && self.cards[index - 1].is_commentary() {
                index -= 1;
            }
        }
        let records = card.record_count();
        self.cards.insert(index, card);
        self.use_blanks(records);
        self.modified = true;
    }

    /// Remove up to `records` trailing blank cards.
    fn use_blanks(&mut self, records: usize) {
        for _ in 0..records {
            match self.cards.last() {
                Some(card) if card.is_blank() => {
                    self.cards.pop();
                }
                _ => break,
            }
        }
    }

    /// Append one or more `COMMENT` cards carrying `text`.
    pub fn add_comment(&mut self, text: &str) -> Result<()> {
        self.add_commentary("COMMENT", text)
    }

    /// Append one or more `HISTORY` cards carrying `text`.
    pub fn add_history(&mut self, text: &str) -> Result<()> {
        self.add_commentary("HISTORY", text)
    }

    /// Append one or more blank-keyword cards carrying `text`.
    pub fn add_blank(&mut self, text: &str) -> Result<()> {
        self.add_commentary("", text)
    }

    fn add_commentary(&mut self, keyword: &str, text: &str) -> Result<()> {
        if text.is_empty() {
            let card = Card::commentary(keyword, "")?;
            self.append(card);
            return Ok(());
        }
        for chunk in text.as_bytes().chunks(COMMENTARY_WIDTH) {
            let chunk = String::from_utf8_lossy(chunk);
            let card = Card::commentary(keyword, &chunk)?;
            self.append(card);
        }
        Ok(())
    }

    /// Remove every card the key identifies: all cards with a keyword, or
    /// exactly one for an index or `(keyword, n)`. Returns how many went.
    pub fn delete<K: CardKey>(&mut self, key: K) -> Result<usize> {
        let positions = key.locate_all(self);
        if positions.is_empty() {
            return Err(Error::KeywordNotFound(key.describe()));
        }
        for &index in positions.iter().rev() {
            self.cards.remove(index);
        }
        self.modified = true;
        Ok(positions.len())
    }

    /// Remove and return the card at `index`.
    pub fn remove(&mut self, index: usize) -> Result<Card> {
        if index >= self.cards.len() {
            return Err(Error::KeywordNotFound(index.describe()));
        }
        self.modified = true;
        Ok(self.cards.remove(index))
    }

    /// Swap the card at `index` for `card` without touching blank filler.
    pub(crate) fn replace(&mut self, index: usize, card: Card) {
        if let Some(slot) = self.cards.get_mut(index) {
            *slot = card;
            self.modified = true;
        }
    }

    /// Move the card at `from` so that it ends up at position `to`.
    pub(crate) fn relocate(&mut self, from: usize, to: usize) {
        if from == to || from >= self.cards.len() {
            return;
        }
        let card = self.cards.remove(from);
        let to = to.min(self.cards.len());
        self.cards.insert(to, card);
        self.modified = true;
    }

    /// Rename the first card with keyword `old`.
    ///
    /// `CONTINUE` is never a valid target, commentary and regular keywords
    /// cannot be exchanged, and renaming onto an existing keyword requires
    /// `force`.
    pub fn rename(&mut self, old: &str, new: &str, force: bool) -> Result<()> {
        let (target, hierarch) = normalize_keyword(new)?;
        if !hierarch && target == "CONTINUE" {
            return Err(Error::syntax(new, "CONTINUE cannot be used as a keyword name"));
        }
        let index = self.require(&old)?;
        let target_commentary = !hierarch && is_commentary_keyword(&target);
        if self.cards[index].is_commentary() != target_commentary {
            return Err(Error::syntax(
                new,
                "regular and commentary keywords cannot be renamed into each other",
            ));
        }
        if !force && !target_commentary && self.contains(target.as_str()) {
            return Err(Error::DuplicateKeyword(target));
        }
        self.cards[index].set_keyword(new)?;
        self.modified = true;
        Ok(())
    }

    /// Drop the structural keywords so the remaining cards can be reused for
    /// a header of a different HDU kind.
    pub fn strip(&mut self) {
        let before = self.cards.len();
        self.cards.retain(|c| !is_structural_keyword(c.keyword()));
        if self.cards.len() != before {
            self.modified = true;
        }
    }

    // ── Serialization ──

    /// Physical records of all cards, excluding `END`.
    pub fn record_count(&self) -> usize {
        self.cards.iter().map(Card::record_count).sum()
    }

    /// Size of the serialized header, `END` and padding included.
    pub fn padded_len(&self) -> u64 {
        padded_byte_len(((self.record_count() + 1) * CARD_SIZE) as u64)
    }

    /// Serialize the cards, `END` and blank padding to whole blocks.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.padded_len() as usize);
        for card in &self.cards {
            buf.extend_from_slice(card.image().as_bytes());
        }
        buf.extend_from_slice(Card::end().image().as_bytes());
        pad_header(&mut buf);
        buf
    }

    // ── Internals ──

    fn keyword_matches(&self, card: &Card, key: &str) -> bool {
        if card.is_opaque() {
            return false;
        }
        let key = strip_hierarch(key.trim_start()).unwrap_or(key).trim();
        if self.case_sensitive {
            card.keyword() == key
        } else {
            card.keyword().eq_ignore_ascii_case(key)
        }
    }

    fn positions<'a>(&'a self, key: &'a str) -> impl Iterator<Item = usize> + 'a {
        self.cards
            .iter()
            .enumerate()
            .filter(move |(_, c)| self.keyword_matches(c, key))
            .map(|(i, _)| i)
    }

    fn compound_position(&self, key: &str) -> Option<usize> {
        if !key.contains('.') {
            return None;
        }
        self.cards.iter().position(|c| match c.compound_key() {
            Some(compound) if self.case_sensitive => compound == key,
            Some(compound) => compound.eq_ignore_ascii_case(key),
            None => false,
        })
    }

    fn require<K: CardKey>(&self, key: &K) -> Result<usize> {
        key.locate(self)
            .map(|l| l.index)
            .ok_or_else(|| Error::KeywordNotFound(key.describe()))
    }
}

impl<'a> IntoIterator for &'a Header {
    type Item = &'a Card;
    type IntoIter = std::slice::Iter<'a, Card>;

    fn into_iter(self) -> Self::IntoIter {
        self.cards.iter()
    }
}

/// A card for `update`: compound `KEY.FIELD` keys create record-valued cards.
fn new_card(keyword: &str, value: Value, comment: Option<&str>) -> Result<Card> {
    if let Some((base, specifier)) = keyword.split_once('.') {
        if base.len() <= 8 && is_field_specifier(specifier) {
            let number = value
                .as_float()
                .ok_or_else(|| Error::syntax(keyword, "record-valued field must be numeric"))?;
            return Card::record(base, specifier, number, comment);
        }
    }
    Card::new(keyword, value, comment)
}

/// `true` when an 80-byte record carries the `END` keyword.
pub(crate) fn is_end_record(record: &[u8]) -> bool {
    record.len() >= 8 && &record[..8] == b"END     "
}

fn is_structural_keyword(keyword: &str) -> bool {
    const FIXED: [&str; 13] = [
        "SIMPLE", "XTENSION", "BITPIX", "NAXIS", "EXTEND", "PCOUNT", "GCOUNT", "GROUPS",
        "THEAP", "TFIELDS", "CHECKSUM", "DATASUM", "ZIMAGE",
    ];
    const INDEXED: [&str; 10] = [
        "NAXIS", "TTYPE", "TFORM", "TSCAL", "TZERO", "TNULL", "TUNIT", "TDISP", "TDIM", "TBCOL",
    ];
    if FIXED.contains(&keyword) {
        return true;
    }
    INDEXED.iter().any(|prefix| {
        keyword
            .strip_prefix(prefix)
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    })
}

// ── Wildcards ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    /// `*`: zero or more word characters.
    Word,
    /// `?`: exactly one word character.
    One,
    /// `...`: zero or more non-blank characters.
    Rest,
    Literal(u8),
}

fn compile_pattern(pattern: &str) -> Vec<Token> {
    let bytes = pattern.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i..].starts_with(b"...") {
            tokens.push(Token::Rest);
            i += 3;
            continue;
        }
        tokens.push(match bytes[i] {
            b'*' => Token::Word,
            b'?' => Token::One,
            b => Token::Literal(b),
        });
        i += 1;
    }
    tokens
}

fn is_word(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn glob_match(tokens: &[Token], text: &[u8]) -> bool {
    let Some((first, rest)) = tokens.split_first() else {
        return text.is_empty();
    };
    match *first {
        Token::Word | Token::Rest => {
            let allowed = |b: &u8| match first {
                Token::Word => is_word(*b),
                _ => !b.is_ascii_whitespace(),
            };
            let run = text.iter().take_while(|b| allowed(b)).count();
            (0..=run).any(|n| glob_match(rest, &text[n..]))
        }
        Token::One => text.first().is_some_and(|&b| is_word(b)) && glob_match(rest, &text[1..]),
        Token::Literal(c) => {
            text.first().is_some_and(|b| b.eq_ignore_ascii_case(&c)) && glob_match(rest, &text[1..])
        }
    }
}

/// Log and collect the warnings produced while decoding a header.
pub(crate) fn report_warnings(context: &str, warnings: &[String]) {
    for w in warnings {
        warn!(context, warning = w.as_str(), "header recovered");
    }
}
