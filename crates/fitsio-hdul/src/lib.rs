//! FITS container core: the 80-byte card codec, ordered headers, the 2880-byte
//! block scanner and an HDU list that edits files without losing them.
//!
//! ```no_run
//! use fitsio_hdul::{HduList, OpenMode};
//!
//! let mut hdul = HduList::open("image.fits", OpenMode::Update)?;
//! hdul.header_mut(0)?.add_history("recalibrated")?;
//! hdul.delete(1)?;
//! hdul.close()?;
//! # Ok::<(), fitsio_hdul::Error>(())
//! ```

pub mod block;
pub mod card;
pub mod checksum;
pub mod error;
pub mod hdu;
pub mod hdulist;
pub mod header;
mod io;
pub mod layout;
pub mod options;
pub mod scan;
pub mod value;
pub mod verify;

pub use block::{BLOCK_SIZE, CARDS_PER_BLOCK, CARD_SIZE};
pub use card::{Card, CardFormat, RecordField};
pub use checksum::ChecksumStatus;
pub use error::{Error, Result};
pub use hdu::{Hdu, HduKind, HduKindTag};
pub use hdulist::{FileInfo, HduList, OpenMode};
pub use header::{Anchor, CardKey, Header};
pub use layout::{Check, Layout, Registry, Requirement};
pub use options::{Options, ParseMode};
pub use scan::{scan, Scan};
pub use value::Value;
pub use verify::{Finding, VerifyOption};
