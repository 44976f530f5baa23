use std::path::PathBuf;

use thiserror::Error;

/// All errors that can occur while decoding, editing or writing FITS data.
#[derive(Debug, Error)]
pub enum Error {
    /// A malformed card image or an illegal keyword/value handed to a card
    /// constructor.
    #[error("syntax error in {text:?}: {reason}")]
    Syntax {
        /// The offending card image, keyword or token.
        text: String,
        /// What is wrong with it.
        reason: &'static str,
    },
    /// The block/HDU structure of the file is broken or non-conforming.
    #[error("structural error: {0}")]
    Structural(String),
    /// A mutation was attempted that the open mode does not permit.
    #[error("read-only: {0}")]
    ReadOnly(String),
    /// An encoded card or payload does not fit its declared size.
    #[error("size error: {0}")]
    Size(String),
    /// No card with the requested keyword exists.
    #[error("keyword not found: {0}")]
    KeywordNotFound(String),
    /// A rename would duplicate an existing non-commentary keyword.
    #[error("keyword already exists: {0}")]
    DuplicateKeyword(String),
    /// No HDU matches the requested index or name.
    #[error("HDU not found: {0}")]
    HduNotFound(String),
    /// The destination of a write already exists and overwrite was not requested.
    #[error("file already exists: {}", .0.display())]
    FileExists(PathBuf),
    /// Read, write, seek or rename failure of the backing stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn syntax(text: impl Into<String>, reason: &'static str) -> Self {
        Error::Syntax {
            text: text.into(),
            reason,
        }
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(e: tempfile::PersistError) -> Self {
        Error::Io(e.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_syntax() {
        let e = Error::syntax("bitpix  = 16", "illegal keyword characters");
        assert_eq!(
            e.to_string(),
            "syntax error in \"bitpix  = 16\": illegal keyword characters"
        );
    }

    #[test]
    fn display_structural() {
        let e = Error::Structural("missing END card".into());
        assert_eq!(e.to_string(), "structural error: missing END card");
    }

    #[test]
    fn display_read_only() {
        let e = Error::ReadOnly("delete HDU".into());
        assert_eq!(e.to_string(), "read-only: delete HDU");
    }

    #[test]
    fn display_file_exists() {
        let e = Error::FileExists(PathBuf::from("out.fits"));
        assert_eq!(e.to_string(), "file already exists: out.fits");
    }

    #[test]
    fn io_error_from_conversion() {
        let io_err = std::io::Error::other("oops");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
    }

    #[test]
    fn std_error_source() {
        use std::error::Error as StdError;

        let e = Error::Size("card too long".into());
        assert!(e.source().is_none());

        let e = Error::Io(std::io::Error::other("inner"));
        assert!(e.source().is_some());
    }
}
