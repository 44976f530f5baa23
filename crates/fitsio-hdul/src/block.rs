//! Block and record geometry.

/// Every header and data unit occupies a whole number of these.
pub const BLOCK_SIZE: usize = 2880;

/// One card record.
pub const CARD_SIZE: usize = 80;

pub const CARDS_PER_BLOCK: usize = BLOCK_SIZE / CARD_SIZE;

/// Fill after the `END` card.
pub const HEADER_PAD_BYTE: u8 = b' ';

/// Fill after the last data byte.
pub const DATA_PAD_BYTE: u8 = 0;

/// Blocks spanned by `num_bytes` of content; zero bytes span no block.
pub const fn blocks_needed(num_bytes: u64) -> u64 {
    num_bytes.div_ceil(BLOCK_SIZE as u64)
}

/// `num_bytes` rounded up to a block boundary.
pub const fn padded_byte_len(num_bytes: u64) -> u64 {
    blocks_needed(num_bytes) * BLOCK_SIZE as u64
}

/// Fill bytes between `num_bytes` of content and the next block boundary.
pub const fn pad_len(num_bytes: u64) -> u64 {
    padded_byte_len(num_bytes) - num_bytes
}

/// Extend a serialized header with blanks to the next block boundary.
pub fn pad_header(buf: &mut Vec<u8>) {
    let target = padded_byte_len(buf.len() as u64) as usize;
    buf.resize(target, HEADER_PAD_BYTE);
}

/// The zero fill that follows a data segment of `num_bytes`.
pub fn data_padding(num_bytes: u64) -> Vec<u8> {
    vec![DATA_PAD_BYTE; pad_len(num_bytes) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_counts_at_boundaries() {
        let cases = [(0, 0), (1, 1), (2879, 1), (2880, 1), (2881, 2), (5761, 3)];
        for (bytes, blocks) in cases {
            assert_eq!(blocks_needed(bytes), blocks, "{bytes} bytes");
        }
    }

    #[test]
    fn padding_reaches_the_next_boundary_only() {
        for n in [0u64, 1, 79, 80, 2879, 2880, 2881, 10_000, 1 << 20] {
            let padded = padded_byte_len(n);
            assert_eq!(padded % BLOCK_SIZE as u64, 0);
            assert!(padded >= n && padded - n < BLOCK_SIZE as u64);
            assert_eq!(pad_len(n), padded - n);
        }
        assert_eq!(CARDS_PER_BLOCK, 36);
    }

    #[test]
    fn header_fill_is_blank() {
        let mut buf = vec![b'A'; CARD_SIZE];
        pad_header(&mut buf);
        assert_eq!(buf.len(), BLOCK_SIZE);
        assert!(buf[CARD_SIZE..].iter().all(|&b| b == b' '));

        let mut full = vec![b'B'; BLOCK_SIZE];
        pad_header(&mut full);
        assert_eq!(full.len(), BLOCK_SIZE);
    }

    #[test]
    fn data_fill_is_zero() {
        let pad = data_padding(100);
        assert_eq!(pad.len(), BLOCK_SIZE - 100);
        assert!(pad.iter().all(|&b| b == 0));
        assert!(data_padding(0).is_empty());
        assert!(data_padding(BLOCK_SIZE as u64).is_empty());
    }
}
