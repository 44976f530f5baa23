//! Explicit configuration threaded into headers, the scanner and containers.

use crate::layout::Registry;
use crate::verify::VerifyOption;

/// How the card codec treats records it cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Any malformed record aborts the enclosing operation.
    Strict,
    /// Malformed records are kept verbatim as opaque commentary cards and a
    /// warning is recorded.
    #[default]
    Lenient,
}

/// Settings for reading and writing a container.
///
/// ```
/// use fitsio_hdul::{Options, ParseMode, VerifyOption};
///
/// let options = Options::default()
///     .with_parse_mode(ParseMode::Strict)
///     .with_output_verify(VerifyOption::Fix)
///     .with_checksum(true);
/// assert!(options.checksum);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub parse_mode: ParseMode,
    /// Verification applied before any byte is written.
    pub output_verify: VerifyOption,
    /// Whether keyword lookups distinguish case.
    pub case_sensitive: bool,
    /// Stamp `CHECKSUM`/`DATASUM` on every header that is written.
    pub checksum: bool,
    /// Collaborators that size payloads and supply keyword checklists.
    pub registry: Registry,
}

impl Options {
    pub fn with_parse_mode(mut self, mode: ParseMode) -> Self {
        self.parse_mode = mode;
        self
    }

    pub fn with_output_verify(mut self, option: VerifyOption) -> Self {
        self.output_verify = option;
        self
    }

    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }
}
