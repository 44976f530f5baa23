//! FITS CHECKSUM and DATASUM keyword support.
//!
//! Implements the HEASARC ones-complement checksum convention: `DATASUM` is
//! the 32-bit ones-complement sum of the data blocks, and `CHECKSUM` is
//! chosen so that the whole HDU (header and data) sums to negative zero.

use std::io::{self, Read, Seek};

use crate::block::BLOCK_SIZE;
use crate::error::Result;
use crate::header::Header;
use crate::io::read_at;
use crate::value::Value;

const CHECKSUM_PLACEHOLDER: &str = "0000000000000000";

// ── Ones-complement sum (cfitsio `ffcsum`) ──

/// Ones-complement sum of `data` taken as big-endian 32-bit words, zero
/// padded to a whole number of blocks.
pub fn checksum_bytes(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut blocks = data.chunks_exact(BLOCK_SIZE);
    for block in blocks.by_ref() {
        sum = accumulate_block(sum, block);
    }
    let rest = blocks.remainder();
    if !rest.is_empty() {
        let mut last = [0u8; BLOCK_SIZE];
        last[..rest.len()].copy_from_slice(rest);
        sum = accumulate_block(sum, &last);
    }
    sum
}

fn accumulate_block(sum: u32, block: &[u8]) -> u32 {
    let mut hi = sum >> 16;
    let mut lo = sum & 0xFFFF;
    for word in block.chunks_exact(4) {
        hi += u16::from_be_bytes([word[0], word[1]]) as u32;
        lo += u16::from_be_bytes([word[2], word[3]]) as u32;
    }
    fold(hi, lo)
}

fn fold(mut hi: u32, mut lo: u32) -> u32 {
    let mut hicarry = hi >> 16;
    let mut locarry = lo >> 16;
    while (hicarry | locarry) != 0 {
        hi = (hi & 0xFFFF) + locarry;
        lo = (lo & 0xFFFF) + hicarry;
        hicarry = hi >> 16;
        locarry = lo >> 16;
    }
    (hi << 16) | lo
}

/// Ones-complement addition of two sums.
pub fn add_sums(a: u32, b: u32) -> u32 {
    fold((a >> 16) + (b >> 16), (a & 0xFFFF) + (b & 0xFFFF))
}

/// Sum `len` bytes of a stream starting at `offset`, one block at a time.
pub(crate) fn stream_sum<R: Read + Seek>(stream: &mut R, offset: u64, len: u64) -> io::Result<u32> {
    let mut sum = 0u32;
    let mut done = 0u64;
    while done < len {
        let take = (len - done).min(BLOCK_SIZE as u64) as usize;
        let mut block = read_at(stream, offset + done, take)?;
        block.resize(BLOCK_SIZE, 0);
        sum = accumulate_block(sum, &block);
        done += take as u64;
    }
    Ok(sum)
}

// ── ASCII encoding (cfitsio `ffesum` / `ffdsum`) ──

/// Punctuation between the digits and the letters, never emitted.
const EXCLUDE: [u8; 13] = [
    b':', b';', b'<', b'=', b'>', b'?', b'@', b'[', b'\\', b']', b'^', b'_', b'`',
];
const ASCII_OFFSET: i32 = b'0' as i32;

/// Encode a sum as 16 ASCII characters, optionally of its complement.
pub fn encode_checksum(sum: u32, complement: bool) -> [u8; 16] {
    let value = if complement { !sum } else { sum };

    let mut asc = [0u8; 16];
    for byte in 0..4usize {
        let b = ((value >> (24 - 8 * byte)) & 0xFF) as i32;
        let quotient = b / 4 + ASCII_OFFSET;
        let mut ch = [quotient; 4];
        ch[0] += b % 4;

        // Nudge pairs off the excluded characters; each pair keeps its sum.
        loop {
            let mut adjusted = false;
            for &ex in &EXCLUDE {
                let ex = ex as i32;
                for j in [0, 2] {
                    if ch[j] == ex || ch[j + 1] == ex {
                        ch[j] += 1;
                        ch[j + 1] -= 1;
                        adjusted = true;
                    }
                }
            }
            if !adjusted {
                break;
            }
        }

        for (j, c) in ch.iter().enumerate() {
            asc[4 * j + byte] = *c as u8;
        }
    }

    // Rotate right by one.
    let mut out = [0u8; 16];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = asc[(i + 15) % 16];
    }
    out
}

/// Decode 16 ASCII characters produced by [`encode_checksum`].
pub fn decode_checksum(ascii: &[u8; 16], complement: bool) -> u32 {
    let mut cbuf = [0i32; 16];
    for (i, slot) in cbuf.iter_mut().enumerate() {
        *slot = ascii[(i + 1) % 16] as i32 - ASCII_OFFSET;
    }
    let mut hi = 0u32;
    let mut lo = 0u32;
    for quad in cbuf.chunks_exact(4) {
        hi = hi.wrapping_add(((quad[0] << 8) + quad[1]) as u32);
        lo = lo.wrapping_add(((quad[2] << 8) + quad[3]) as u32);
    }
    let sum = fold(hi, lo);
    if complement {
        !sum
    } else {
        sum
    }
}

// ── Stamping and verification ──

/// Write `DATASUM` and `CHECKSUM` into `header` for a data unit whose sum is
/// `datasum`, so the serialized HDU sums to negative zero.
pub fn stamp(header: &mut Header, datasum: u32) -> Result<()> {
    header.update(
        "DATASUM",
        datasum.to_string(),
        Some("data unit checksum"),
        None,
    )?;
    header.update(
        "CHECKSUM",
        CHECKSUM_PLACEHOLDER,
        Some("HDU checksum"),
        None,
    )?;
    let total = add_sums(checksum_bytes(&header.to_bytes()), datasum);
    let encoded = encode_checksum(total, true);
    let text: String = encoded.iter().map(|&b| b as char).collect();
    header.set("CHECKSUM", text)
}

/// Outcome of checking the stored sums of one HDU. `None` means the keyword
/// is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChecksumStatus {
    pub datasum: Option<bool>,
    pub checksum: Option<bool>,
}

impl ChecksumStatus {
    /// No stored sum disagrees with the bytes.
    pub fn is_ok(&self) -> bool {
        self.datasum != Some(false) && self.checksum != Some(false)
    }
}

/// Compare the keywords in `header` with the sums of the bytes it was read
/// from.
pub fn check(header: &Header, header_sum: u32, datasum: u32) -> ChecksumStatus {
    let datasum_ok = header.value("DATASUM").map(|stored| {
        let stored = match stored {
            Value::String(s) => s.trim().parse::<u64>().ok(),
            Value::Integer(n) => u64::try_from(n).ok(),
            _ => None,
        };
        stored == Some(datasum as u64)
    });
    let checksum_ok = header.contains("CHECKSUM").then(|| {
        let total = add_sums(header_sum, datasum);
        total == 0 || total == 0xFFFF_FFFF
    });
    ChecksumStatus {
        datasum: datasum_ok,
        checksum: checksum_ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::padded_byte_len;
    use crate::card::Card;

    fn primary(naxis1: i64) -> Header {
        Header::from_cards(vec![
            Card::new("SIMPLE", true, None).unwrap(),
            Card::new("BITPIX", 8, None).unwrap(),
            Card::new("NAXIS", 1, None).unwrap(),
            Card::new("NAXIS1", naxis1, None).unwrap(),
        ])
    }

    fn hdu_bytes(header: &Header, data: &[u8]) -> Vec<u8> {
        let mut bytes = header.to_bytes();
        let start = bytes.len();
        bytes.extend_from_slice(data);
        bytes.resize(start + padded_byte_len(data.len() as u64) as usize, 0);
        bytes
    }

    #[test]
    fn encode_zero() {
        assert_eq!(&encode_checksum(0, false), b"0000000000000000");
        assert_eq!(&encode_checksum(0xFFFF_FFFF, true), b"0000000000000000");
    }

    #[test]
    fn known_vector() {
        // cfitsio: 1234567890 encodes as "dCW2fBU0dBU0dBU0".
        assert_eq!(&encode_checksum(1234567890, false), b"dCW2fBU0dBU0dBU0");
        assert_eq!(decode_checksum(b"dCW2fBU0dBU0dBU0", false), 1234567890);
    }

    #[test]
    fn encoding_is_alphanumeric_and_reversible() {
        for v in [0u32, 1, 255, 65535, 0xDEAD_BEEF, 0xFFFF_FFFF] {
            let encoded = encode_checksum(v, true);
            assert!(encoded.iter().all(u8::is_ascii_alphanumeric));
            assert_eq!(decode_checksum(&encoded, true), v);
        }
    }

    #[test]
    fn sums_of_uniform_blocks() {
        assert_eq!(checksum_bytes(&[0u8; BLOCK_SIZE]), 0);
        assert_eq!(checksum_bytes(&[0xFFu8; BLOCK_SIZE]), 0xFFFF_FFFF);
        assert_eq!(checksum_bytes(&[1, 2, 3]), checksum_bytes(&{
            let mut b = vec![0u8; BLOCK_SIZE];
            b[..3].copy_from_slice(&[1, 2, 3]);
            b
        }));
    }

    #[test]
    fn complement_adds_to_negative_zero() {
        let x = 0x1234_5678u32;
        let total = add_sums(x, !x);
        assert!(total == 0 || total == 0xFFFF_FFFF);
        assert_eq!(add_sums(x, 0), x);
    }

    #[test]
    fn stamped_hdu_verifies() {
        let data = vec![42u8; 10];
        let mut header = primary(10);
        let datasum = checksum_bytes(&data);
        stamp(&mut header, datasum).unwrap();

        let bytes = hdu_bytes(&header, &data);
        let total = checksum_bytes(&bytes);
        assert!(total == 0 || total == 0xFFFF_FFFF, "{total:#010X}");

        let header_sum = checksum_bytes(&header.to_bytes());
        let status = check(&header, header_sum, datasum);
        assert_eq!(status.datasum, Some(true));
        assert_eq!(status.checksum, Some(true));
    }

    #[test]
    fn restamping_replaces_keywords() {
        let mut header = primary(4);
        stamp(&mut header, 999).unwrap();
        stamp(&mut header, 0).unwrap();
        assert_eq!(header.count("CHECKSUM"), 1);
        assert_eq!(header.count("DATASUM"), 1);
        assert_eq!(header.value("DATASUM"), Some(Value::String("0".into())));
    }

    #[test]
    fn corrupted_data_fails() {
        let data = vec![0u8; 100];
        let mut header = primary(100);
        stamp(&mut header, checksum_bytes(&data)).unwrap();

        let mut damaged = data.clone();
        damaged[0] = 0xFF;
        let status = check(&header, checksum_bytes(&header.to_bytes()), checksum_bytes(&damaged));
        assert_eq!(status.datasum, Some(false));
        assert_eq!(status.checksum, Some(false));
        assert!(!status.is_ok());
    }

    #[test]
    fn unstamped_header_is_ok() {
        let header = primary(0);
        let status = check(&header, 0, 0);
        assert_eq!(status, ChecksumStatus::default());
        assert!(status.is_ok());
    }

    #[test]
    fn stream_sum_matches_in_memory() {
        use std::io::Cursor;

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut stream = Cursor::new(data.clone());
        assert_eq!(stream_sum(&mut stream, 0, 5000).unwrap(), checksum_bytes(&data));
        assert_eq!(stream_sum(&mut stream, 100, 50).unwrap(), checksum_bytes(&data[100..150]));
    }
}
