//! Typed header values and the grammar of the value field (columns 11-80).

use std::fmt;

/// A parsed FITS header value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// FITS logical value (`T` or `F`).
    Logical(bool),
    /// FITS integer value.
    Integer(i64),
    /// FITS floating-point value.
    Float(f64),
    /// FITS character string (content between single quotes).
    String(String),
    /// FITS complex integer `(real, imaginary)`.
    ComplexInt(i64, i64),
    /// FITS complex float `(real, imaginary)`.
    ComplexFloat(f64, f64),
    /// A value indicator followed by nothing: the keyword is defined but its
    /// value is not.
    Undefined,
}

impl Value {
    pub fn as_logical(&self) -> Option<bool> {
        match self {
            Value::Logical(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the value as `f64`, widening integers.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            other => f.write_str(&format_value(other)),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Logical(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(n as i64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Integer(n as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

// ── Parsing ──

/// A decoded value field.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ValueField {
    pub value: Value,
    pub comment: Option<String>,
    /// The value token exactly as written, used to re-render numbers
    /// without reformatting them.
    pub raw: String,
    /// Whether the value sits in the fixed-format position (strings opening in
    /// column 11, other tokens ending in column 30).
    pub fixed: bool,
}

/// Parse the text that follows the `= ` value indicator.
///
/// Index 0 of `field` is card column 11.
pub(crate) fn parse_value_field(field: &str) -> Result<ValueField, &'static str> {
    let bytes = field.as_bytes();
    let start = bytes.iter().position(|&b| b != b' ').unwrap_or(bytes.len());

    if start < bytes.len() && bytes[start] == b'\'' {
        let (value, end) = parse_string(&field[start..])?;
        let comment = parse_comment(&field[start + end..])?;
        return Ok(ValueField {
            value: Value::String(value),
            comment,
            raw: field[start..start + end].to_string(),
            fixed: start == 0,
        });
    }

    let token_end = field.find('/').unwrap_or(field.len());
    let comment = parse_comment(&field[token_end..])?;
    let token = field[..token_end].trim_end();
    let text = token.trim_start();
    let fixed = token.len() == 20 || text.is_empty();

    let value = match text {
        "" => Value::Undefined,
        "T" => Value::Logical(true),
        "F" => Value::Logical(false),
        t if t.starts_with('(') => parse_complex(t).ok_or("unparsable complex value")?,
        t => parse_number(t).ok_or("unparsable value token")?,
    };

    Ok(ValueField {
        value,
        comment,
        raw: text.to_string(),
        fixed,
    })
}

/// Parse a quoted string starting at `field[0] == '\''`.
///
/// Returns the unescaped content (trailing blanks removed, leading blanks
/// kept) and the byte offset just past the closing quote.
pub(crate) fn parse_string(field: &str) -> Result<(String, usize), &'static str> {
    let bytes = field.as_bytes();
    let mut value = String::new();
    let mut i = 1;
    loop {
        if i >= bytes.len() {
            return Err("unterminated string");
        }
        if bytes[i] == b'\'' {
            if bytes.get(i + 1) == Some(&b'\'') {
                value.push('\'');
                i += 2;
            } else {
                i += 1;
                break;
            }
        } else {
            value.push(bytes[i] as char);
            i += 1;
        }
    }
    let trimmed = value.trim_end_matches(' ').len();
    value.truncate(trimmed);
    Ok((value, i))
}

/// Parse whatever follows the value token: blanks, then optionally `/` and
/// free comment text.
fn parse_comment(rest: &str) -> Result<Option<String>, &'static str> {
    let rest = rest.trim_start_matches(' ');
    if rest.is_empty() {
        return Ok(None);
    }
    match rest.strip_prefix('/') {
        Some(comment) => {
            let comment = comment.trim_start_matches(' ').trim_end();
            Ok((!comment.is_empty()).then(|| comment.to_string()))
        }
        None => Err("unexpected text after value"),
    }
}

/// Try to parse a complex value `(real, imag)`.
fn parse_complex(text: &str) -> Option<Value> {
    let inner = text.strip_prefix('(')?.strip_suffix(')')?;
    let (left, right) = inner.split_once(',')?;
    let re = parse_number(left.trim())?;
    let im = parse_number(right.trim())?;
    match (re, im) {
        (Value::Integer(re), Value::Integer(im)) => Some(Value::ComplexInt(re, im)),
        (re, im) => Some(Value::ComplexFloat(re.as_float()?, im.as_float()?)),
    }
}

/// Parse a numeric token.
///
/// Accepts `[+-]? *(\.\d+|\d+(\.\d*)?) *([deDE] *[+-]? *\d+)?`. Leading zeros
/// of the integer part are stripped before conversion so that a literal such
/// as `007` is always read as decimal 7.
pub(crate) fn parse_number(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut i = 0;
    let skip_blanks = |i: &mut usize| {
        while *i < bytes.len() && bytes[*i] == b' ' {
            *i += 1;
        }
    };
    let digits = |i: &mut usize| -> String {
        let start = *i;
        while *i < bytes.len() && bytes[*i].is_ascii_digit() {
            *i += 1;
        }
        text[start..*i].to_string()
    };

    let mut negative = false;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        negative = bytes[i] == b'-';
        i += 1;
    }
    skip_blanks(&mut i);

    let mut int_part = digits(&mut i);
    let mut has_point = false;
    let mut frac_part = String::new();
    if i < bytes.len() && bytes[i] == b'.' {
        has_point = true;
        i += 1;
        frac_part = digits(&mut i);
    }
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }

    let mut exponent = None;
    let mut j = i;
    skip_blanks(&mut j);
    if j < bytes.len() && matches!(bytes[j], b'd' | b'D' | b'e' | b'E') {
        j += 1;
        skip_blanks(&mut j);
        let mut exp_negative = false;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            exp_negative = bytes[j] == b'-';
            j += 1;
        }
        skip_blanks(&mut j);
        let exp_digits = digits(&mut j);
        if exp_digits.is_empty() {
            return None;
        }
        exponent = Some(format!("{}{}", if exp_negative { "-" } else { "" }, exp_digits));
        i = j;
    }
    skip_blanks(&mut i);
    if i != bytes.len() {
        return None;
    }

    // Legacy leading-zero strip: `0*` followed by the digit group.
    let zeros = int_part.bytes().take_while(|&b| b == b'0').count();
    if zeros == int_part.len() {
        int_part = if frac_part.is_empty() {
            String::from("0")
        } else {
            String::new()
        };
    } else {
        int_part.drain(..zeros);
    }

    let sign = if negative { "-" } else { "" };
    if !has_point && exponent.is_none() {
        if let Ok(n) = format!("{sign}{int_part}").parse::<i64>() {
            return Some(Value::Integer(n));
        }
    }

    let int_part = if int_part.is_empty() { "0" } else { &int_part };
    let frac_part = if frac_part.is_empty() { "0" } else { &frac_part };
    let normalized = match exponent {
        Some(exp) => format!("{sign}{int_part}.{frac_part}E{exp}"),
        None => format!("{sign}{int_part}.{frac_part}"),
    };
    normalized.parse::<f64>().ok().map(Value::Float)
}

// ── Writing ──

/// Check that a value can be written into a card at all.
pub(crate) fn check_value(value: &Value) -> Result<(), &'static str> {
    match value {
        Value::Float(f) if !f.is_finite() => Err("non-finite float"),
        Value::ComplexFloat(re, im) if !re.is_finite() || !im.is_finite() => {
            Err("non-finite float")
        }
        Value::String(s) if !s.bytes().all(is_printable) => {
            Err("non-printable character in string")
        }
        _ => Ok(()),
    }
}

/// Whether `b` is legal inside a card image.
pub(crate) fn is_printable(b: u8) -> bool {
    (0x20..=0x7E).contains(&b)
}

/// Render a value token without any column justification.
pub(crate) fn format_value(value: &Value) -> String {
    match value {
        Value::Logical(b) => String::from(if *b { "T" } else { "F" }),
        Value::Integer(n) => n.to_string(),
        Value::Float(f) => format_float(*f),
        Value::String(s) => quote_string(s, false),
        Value::ComplexInt(re, im) => format!("({re}, {im})"),
        Value::ComplexFloat(re, im) => format!("({}, {})", format_float(*re), format_float(*im)),
        Value::Undefined => String::new(),
    }
}

/// Render a value token laid out for the fixed format: strings open in
/// column 11 and are padded to at least 8 characters, everything else is
/// right-justified to end in column 30.
pub(crate) fn format_fixed(value: &Value) -> String {
    match value {
        Value::String(s) if s.is_empty() => String::from("''"),
        Value::String(s) => format!("{:<20}", quote_string(s, true)),
        Value::Undefined => String::new(),
        other => format!("{:>20}", format_value(other)),
    }
}

/// Escape embedded quotes and wrap in single quotes.
pub(crate) fn quote_string(s: &str, pad_to_eight: bool) -> String {
    let escaped = escape_string(s);
    if pad_to_eight {
        format!("'{escaped:<8}'")
    } else {
        format!("'{escaped}'")
    }
}

pub(crate) fn escape_string(s: &str) -> String {
    s.replace('\'', "''")
}

/// Format a float so that it always carries a decimal point or exponent and
/// never exceeds 20 characters.
pub(crate) fn format_float(f: f64) -> String {
    let shortest = format!("{f:?}").to_uppercase();
    if shortest.len() <= 20 {
        return shortest;
    }
    // Start with high precision and reduce until the result fits.
    let mut precision = 15usize;
    loop {
        let s = format!("{:.prec$E}", f, prec = precision);
        if s.len() <= 20 || precision == 0 {
            return s;
        }
        precision -= 1;
    }
}
