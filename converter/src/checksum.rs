//! Internet checksum (RFC 1071) shared by the IPv4 header and the UDP pseudo-header.

/// Running ones'-complement sum over big-endian 16-bit words.
///
/// Bytes can be fed in several chunks. A chunk of odd length leaves its last byte pending, so the
/// result is the same as summing the concatenation of all chunks.
#[derive(Debug, Default, Clone, Copy)]
pub struct Checksum {
    sum: u32,
    pending: Option<u8>,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one aligned word into the sum.
    fn add_word(&mut self, word: u16) {
        self.sum += u32::from(word);
        self.sum = (self.sum & 0xffff) + (self.sum >> 16);
    }

    /// Add a value as two big-endian bytes, continuing after any pending odd byte.
    pub fn add_u16(&mut self, word: u16) -> &mut Self {
        self.add_bytes(&word.to_be_bytes())
    }

    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        self.add_bytes(&value.to_be_bytes())
    }

    pub fn add_bytes(&mut self, mut bytes: &[u8]) -> &mut Self {
        if let Some(high) = self.pending.take() {
            let Some((&low, rest)) = bytes.split_first() else {
                self.pending = Some(high);

                return self;
            };

            self.add_word(u16::from_be_bytes([high, low]));

            bytes = rest;
        }

        let mut words = bytes.chunks_exact(2);

        for word in &mut words {
            self.add_word(u16::from_be_bytes([word[0], word[1]]));
        }

        self.pending = words.remainder().first().copied();

        self
    }

    /// Ones'-complement of the folded sum. A pending odd byte is padded with a zero.
    pub fn finish(&self) -> u16 {
        let mut sum = self.sum;

        if let Some(high) = self.pending {
            sum += u32::from(high) << 8;
            sum = (sum & 0xffff) + (sum >> 16);
        }

        !(sum as u16)
    }
}

/// One-shot checksum over a byte buffer.
pub fn internet_checksum(data: &[u8]) -> u16 {
    Checksum::new().add_bytes(data).finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty() {
        assert_eq!(internet_checksum(&[]), 0xffff);
    }

    #[test]
    fn rfc1071_example() {
        // Sum of the RFC 1071 section 3 words is 0xddf2
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];

        assert_eq!(internet_checksum(&data), !0xddf2);
    }

    #[test]
    fn odd_length_is_zero_padded() {
        assert_eq!(
            internet_checksum(&[0x12, 0x34, 0x56]),
            internet_checksum(&[0x12, 0x34, 0x56, 0x00])
        );
    }

    #[test]
    fn all_ones_sum_stays_all_ones() {
        // 0x8000 + 0x7fff = 0xffff, complement is zero
        assert_eq!(internet_checksum(&[0x80, 0x00, 0x7f, 0xff]), 0x0000);
    }

    #[test]
    fn words_match_bytes() {
        let mut words = Checksum::new();
        words.add_u16(0x4500).add_u32(0x001c_0000);

        assert_eq!(words.finish(), internet_checksum(&[0x45, 0x00, 0x00, 0x1c, 0x00, 0x00]));
    }

    #[test]
    fn words_after_odd_byte() {
        let mut mixed = Checksum::new();
        mixed.add_bytes(&[0x01]).add_u16(0x0203).add_u32(0x0405_0607);

        assert_eq!(
            mixed.finish(),
            internet_checksum(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07])
        );
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_result(data: Vec<u8>, split in 0usize..64) {
            let split = split.min(data.len());
            let (head, tail) = data.split_at(split);

            let mut chunked = Checksum::new();
            chunked.add_bytes(head).add_bytes(tail);

            prop_assert_eq!(chunked.finish(), internet_checksum(&data));
        }

        #[test]
        fn appended_checksum_verifies(mut data: Vec<u8>) {
            if data.len() % 2 == 1 {
                data.push(0);
            }

            let checksum = internet_checksum(&data);
            data.extend_from_slice(&checksum.to_be_bytes());

            prop_assert_eq!(internet_checksum(&data), 0);
        }
    }
}
