//! The block scanner: turns a byte stream into HDU descriptors.
//!
//! Headers are read block by block until a block holds the `END` card. The
//! payload extent comes from the kind's [`Layout`](crate::layout::Layout);
//! the scanner only records offsets and skips over the data without reading
//! it. Damage never aborts the scan: an HDU whose header or extent cannot be
//! established becomes [`HduKind::Corrupted`] and scanning resumes at the next
//! block that opens an extension header.

use std::io::{Read, Seek};

use tracing::{debug, warn};

use crate::block::{padded_byte_len, BLOCK_SIZE, CARD_SIZE};
use crate::error::{Error, Result};
use crate::hdu::{Hdu, HduKind};
use crate::header::{is_end_record, report_warnings, Header};
use crate::io::{read_at, stream_len};
use crate::options::Options;

const XTENSION_PREFIX: &[u8] = b"XTENSION=";

/// Everything learned from one pass over a stream.
#[derive(Debug, Default)]
pub struct Scan {
    pub hdus: Vec<Hdu>,
    /// Recovered problems: unparsable cards, truncation, ignored bytes.
    pub warnings: Vec<String>,
}

/// Scan a whole stream from offset 0.
///
/// Only I/O failures, and malformed cards under
/// [`ParseMode::Strict`](crate::options::ParseMode::Strict), are errors.
pub fn scan<R: Read + Seek>(stream: &mut R, options: &Options) -> Result<Scan> {
    let file_len = stream_len(stream)?;
    let block = BLOCK_SIZE as u64;
    let mut result = Scan::default();
    let mut offset = 0u64;

    while offset < file_len {
        if file_len - offset < block {
            let message = format!(
                "ignoring {} trailing bytes at offset {offset}",
                file_len - offset
            );
            warn!(offset, "{message}");
            result.warnings.push(message);
            break;
        }
        let index = result.hdus.len();

        // Header blocks, up to the one holding END.
        let mut header_bytes = Vec::new();
        let mut pos = offset;
        let mut found_end = false;
        while pos + block <= file_len {
            let bytes = read_at(stream, pos, BLOCK_SIZE)?;
            if pos > offset && bytes.starts_with(XTENSION_PREFIX) {
                break;
            }
            pos += block;
            found_end = bytes.chunks_exact(CARD_SIZE).any(is_end_record);
            header_bytes.extend_from_slice(&bytes);
            if found_end {
                break;
            }
        }
        let header_span = pos - offset;

        let decoded = Header::decode(&header_bytes, options.parse_mode)?;
        let mut header = decoded.header;
        header.set_case_sensitive(options.case_sensitive);
        if !decoded.warnings.is_empty() {
            let context = format!("HDU {index}");
            report_warnings(&context, &decoded.warnings);
            result
                .warnings
                .extend(decoded.warnings.iter().map(|w| format!("{context}: {w}")));
        }

        if !found_end {
            let reason = String::from("header has no END card");
            warn!(index, offset, "{reason}");
            result.warnings.push(format!("HDU {index}: {reason}"));
            result.hdus.push(Hdu::scanned(
                header,
                HduKind::Corrupted { reason },
                offset,
                header_span,
                0,
                0,
            ));
            offset = pos;
            continue;
        }

        let data_offset = pos;
        let kind = HduKind::classify(&header, &options.registry);
        let size = match (&kind, options.registry.layout(kind.tag())) {
            (_, Some(layout)) => layout.data_size(&header),
            (HduKind::Corrupted { reason }, None) => Err(Error::Structural(reason.clone())),
            (_, None) => Err(Error::Structural(format!("no layout for {kind}"))),
        };

        let hdu = match size {
            Ok(size) if data_offset.checked_add(size).is_some_and(|end| end <= file_len) => {
                let padded = padded_byte_len(size).min(file_len - data_offset);
                if padded < padded_byte_len(size) {
                    let message = format!("HDU {index}: data padding truncated at end of file");
                    warn!(index, "{message}");
                    result.warnings.push(message);
                }
                debug!(
                    index,
                    %kind,
                    header_offset = offset,
                    data_offset,
                    data_length = size,
                    "scanned HDU"
                );
                Hdu::scanned(header, kind, offset, header_span, size, padded)
            }
            Ok(size) => {
                let remaining = file_len - data_offset;
                let reason = format!("data of {size} bytes runs past end of file");
                warn!(index, remaining, "{reason}");
                result.warnings.push(format!("HDU {index}: {reason}"));
                Hdu::scanned(
                    header,
                    HduKind::Corrupted { reason },
                    offset,
                    header_span,
                    remaining,
                    remaining,
                )
            }
            Err(e) => {
                let next = resync(stream, data_offset, file_len)?;
                let skipped = next - data_offset;
                let reason = match kind {
                    HduKind::Corrupted { reason } => reason,
                    _ => e.to_string(),
                };
                warn!(index, skipped, "{reason}; resuming at offset {next}");
                result.warnings.push(format!("HDU {index}: {reason}"));
                Hdu::scanned(
                    header,
                    HduKind::Corrupted { reason },
                    offset,
                    header_span,
                    skipped,
                    skipped,
                )
            }
        };
        offset = hdu.data_offset + hdu.padded_data_length;
        result.hdus.push(hdu);
    }

    Ok(result)
}

/// Offset of the next block at or after `from` that starts an extension
/// header, or end of file.
fn resync<R: Read + Seek>(stream: &mut R, from: u64, file_len: u64) -> Result<u64> {
    let mut pos = from;
    while pos + BLOCK_SIZE as u64 <= file_len {
        let head = read_at(stream, pos, XTENSION_PREFIX.len())?;
        if head == XTENSION_PREFIX {
            return Ok(pos);
        }
        pos += BLOCK_SIZE as u64;
    }
    Ok(file_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::block::data_padding;
    use crate::options::ParseMode;

    fn header_block(cards: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for c in cards {
            out.extend_from_slice(format!("{c:<80}").as_bytes());
        }
        out.extend_from_slice(format!("{:<80}", "END").as_bytes());
        out.resize(padded_byte_len(out.len() as u64) as usize, b' ');
        out
    }

    fn with_data(mut header: Vec<u8>, len: usize) -> Vec<u8> {
        header.extend(std::iter::repeat(7u8).take(len));
        header.extend(data_padding(len as u64));
        header
    }

    fn primary(naxis1: usize) -> Vec<u8> {
        let naxis1_card = format!("NAXIS1  = {naxis1:>20}");
        with_data(
            header_block(&[
                "SIMPLE  =                    T",
                "BITPIX  =                    8",
                "NAXIS   =                    1",
                &naxis1_card,
            ]),
            naxis1,
        )
    }

    fn image_ext(name: &str, naxis1: usize) -> Vec<u8> {
        let naxis1_card = format!("NAXIS1  = {naxis1:>20}");
        let name_card = format!("EXTNAME = '{name}'");
        with_data(
            header_block(&[
                "XTENSION= 'IMAGE   '",
                "BITPIX  =                    8",
                "NAXIS   =                    1",
                &naxis1_card,
                "PCOUNT  =                    0",
                "GCOUNT  =                    1",
                &name_card,
            ]),
            naxis1,
        )
    }

    fn scan_bytes(bytes: Vec<u8>) -> Scan {
        scan(&mut Cursor::new(bytes), &Options::default()).unwrap()
    }

    #[test]
    fn empty_stream_has_no_hdus() {
        let result = scan_bytes(Vec::new());
        assert!(result.hdus.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn offsets_of_three_hdus() {
        let mut bytes = primary(100);
        bytes.extend(image_ext("A", 3000));
        bytes.extend(image_ext("B", 0));
        let result = scan_bytes(bytes);
        assert_eq!(result.hdus.len(), 3);

        let h = &result.hdus;
        assert_eq!(h[0].kind(), &HduKind::Primary);
        assert_eq!((h[0].header_offset(), h[0].data_offset()), (0, 2880));
        assert_eq!((h[0].data_length(), h[0].padded_data_length()), (100, 2880));
        assert_eq!((h[1].header_offset(), h[1].data_offset()), (5760, 8640));
        assert_eq!((h[1].data_length(), h[1].padded_data_length()), (3000, 5760));
        assert_eq!(h[2].header_offset(), 14400);
        assert_eq!(h[2].padded_data_length(), 0);
        assert_eq!(h[2].name(), "B");
        assert!(h.iter().all(|hdu| !hdu.is_loaded()));
    }

    #[test]
    fn multi_block_header() {
        let mut cards: Vec<String> = vec![
            "SIMPLE  =                    T".into(),
            "BITPIX  =                    8".into(),
            "NAXIS   =                    0".into(),
        ];
        for i in 0..40 {
            cards.push(format!("KEY{i:<5}= {i:>20}"));
        }
        let refs: Vec<&str> = cards.iter().map(String::as_str).collect();
        let result = scan_bytes(header_block(&refs));
        assert_eq!(result.hdus.len(), 1);
        assert_eq!(result.hdus[0].header().len(), 43);
        assert_eq!(result.hdus[0].data_offset(), 5760);
    }

    #[test]
    fn missing_end_is_corrupted() {
        let mut bytes = header_block(&["SIMPLE  =                    T"]);
        bytes[80..83].copy_from_slice(b"   ");
        let result = scan_bytes(bytes);
        assert_eq!(result.hdus.len(), 1);
        assert!(result.hdus[0].kind().is_corrupted());
        assert_eq!(result.hdus[0].header().len(), 36);
    }

    #[test]
    fn unterminated_header_stops_at_next_extension() {
        let mut bytes = header_block(&["SIMPLE  =                    T"]);
        bytes[80..83].copy_from_slice(b"   ");
        bytes.extend(image_ext("NEXT", 10));
        let result = scan_bytes(bytes);
        assert_eq!(result.hdus.len(), 2);
        assert!(result.hdus[0].kind().is_corrupted());
        assert_eq!(result.hdus[1].name(), "NEXT");
    }

    #[test]
    fn unknown_extent_resyncs() {
        let mut bytes = primary(10);
        bytes.extend(with_data(
            header_block(&["XTENSION= 'IMAGE   '", "NAXIS   =                    1"]),
            4000,
        ));
        bytes.extend(image_ext("GOOD", 10));
        let result = scan_bytes(bytes);
        assert_eq!(result.hdus.len(), 3);
        let bad = &result.hdus[1];
        assert!(bad.kind().is_corrupted());
        assert_eq!(bad.data_length(), 5760);
        assert_eq!(result.hdus[2].name(), "GOOD");
    }

    #[test]
    fn data_past_eof_is_corrupted() {
        let mut bytes = primary(5000);
        bytes.truncate(2880 + 2880);
        let result = scan_bytes(bytes);
        assert_eq!(result.hdus.len(), 1);
        assert!(result.hdus[0].kind().is_corrupted());
        assert_eq!(result.hdus[0].data_length(), 2880);
    }

    #[test]
    fn extreme_declared_size_is_corrupted() {
        let naxis1 = format!("NAXIS1  = {:>20}", i64::MAX);
        let mut bytes = with_data(
            header_block(&[
                "SIMPLE  =                    T",
                "BITPIX  =                   16",
                "NAXIS   =                    1",
                &naxis1,
            ]),
            0,
        );
        bytes.extend(image_ext("A", 10));
        let file_len = bytes.len() as u64;

        let result = scan_bytes(bytes);
        assert_eq!(result.hdus.len(), 1);
        let hdu = &result.hdus[0];
        assert!(hdu.kind().is_corrupted());
        assert_eq!(hdu.data_offset(), 2880);
        assert_eq!(hdu.data_length(), file_len - 2880);
        assert!(result.warnings[0].contains("runs past end of file"));
    }

    #[test]
    fn trailing_fragment_ignored() {
        let mut bytes = primary(10);
        bytes.extend_from_slice(&[0u8; 100]);
        let result = scan_bytes(bytes);
        assert_eq!(result.hdus.len(), 1);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn strict_mode_aborts_on_bad_card() {
        let bytes = with_data(
            header_block(&["SIMPLE  =                    T", "bitpix  =                    8"]),
            0,
        );
        let strict = Options::default().with_parse_mode(ParseMode::Strict);
        assert!(scan(&mut Cursor::new(bytes.clone()), &strict).is_err());

        let result = scan_bytes(bytes);
        assert_eq!(result.hdus.len(), 1);
        assert_eq!(result.warnings.len(), 2);
    }
}
