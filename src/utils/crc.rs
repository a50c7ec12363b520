/// CRC32 implementations used by the transport-stream side of the server.
///
/// `Crc32Mpeg2` validates PSI tables (PAT/PMT) per ITU-T H.222.0 /
/// ISO/IEC 13818-1. `ChannelUid` derives the persistent 31-bit channel
/// identifier from a channel identity string; it uses the same polynomial
/// but processes the input as little-endian 32-bit words with the first
/// word (inverted) as seed, and masks the high bit so the result stays
/// representable as a signed id. The word-wise variant must not change:
/// cached channel files are keyed by it.

const CRC32_POLY: u32 = 0x04C11DB7;

/// MPEG-2 CRC32 calculator used for Transport Stream PSI table validation
pub struct Crc32Mpeg2 {
    table: [u32; 256],
}

impl Crc32Mpeg2 {
    pub fn new() -> Self {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut crc = (i as u32) << 24;
            for _ in 0..8 {
                crc = if (crc & 0x8000_0000) != 0 {
                    (crc << 1) ^ CRC32_POLY
                } else {
                    crc << 1
                };
            }
            *entry = crc;
        }
        Self { table }
    }

    /// Calculates the CRC32 checksum for the given data using the MPEG-2
    /// algorithm (initial value 0xFFFFFFFF, no reflection, no final xor).
    pub fn calculate(&self, data: &[u8]) -> u32 {
        let mut crc = 0xFFFF_FFFFu32;
        for &byte in data {
            let index = ((crc >> 24) ^ (byte as u32)) & 0xFF;
            crc = (crc << 8) ^ self.table[index as usize];
        }
        crc
    }
}

impl Default for Crc32Mpeg2 {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash for channel UIDs.
///
/// Inputs shorter than four bytes hash to 0; longer inputs are padded with
/// zero bytes to a whole number of 32-bit words.
pub struct ChannelUid {
    table: [u32; 256],
}

impl ChannelUid {
    pub fn new() -> Self {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut crc = (i as u32) << 24;
            for _ in 0..8 {
                crc = if (crc & 0x8000_0000) != 0 {
                    (crc << 1) ^ CRC32_POLY
                } else {
                    crc << 1
                };
            }
            // table entries live in network byte order
            *entry = crc.swap_bytes();
        }
        Self { table }
    }

    pub fn hash(&self, id: &str) -> u32 {
        let bytes = id.as_bytes();
        if bytes.len() < 4 {
            return 0;
        }

        let mut padded = bytes.to_vec();
        while padded.len() % 4 != 0 {
            padded.push(0);
        }

        let mut words = padded
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));

        let mut r = !words.next().unwrap();
        for word in words {
            for _ in 0..4 {
                r = self.table[(r & 0xFF) as usize] ^ (r >> 8);
            }
            r ^= word;
        }

        (!r) & 0x7FFF_FFFF
    }
}

impl Default for ChannelUid {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_mpeg2() {
        let crc = Crc32Mpeg2::new();

        // Known MPEG-2 CRC test vector
        let test_data = [0x01, 0x01];
        assert_eq!(crc.calculate(&test_data), 0xD66FB816);

        // PMT-like section data must yield a stable non-zero CRC
        let pmt_data = [
            0x02, 0xB0, 0x17, 0x00, 0x01, 0xC1, 0x00, 0x00, 0xE1, 0x00, 0xF0, 0x00, 0x1B, 0xE1,
            0x01, 0xF0, 0x00,
        ];
        assert_ne!(crc.calculate(&pmt_data), 0);
    }

    #[test]
    fn test_channel_uid_stable() {
        let hasher = ChannelUid::new();

        // value is load-bearing: cache files on disk are keyed by it
        let uid = hasher.hash("S19.2E-1-1019-10301");
        assert_eq!(uid, hasher.hash("S19.2E-1-1019-10301"));
        assert_ne!(uid, 0);
        assert_eq!(uid & 0x8000_0000, 0);

        assert_ne!(uid, hasher.hash("S19.2E-1-1019-10302"));
    }

    #[test]
    fn test_channel_uid_short_input() {
        let hasher = ChannelUid::new();
        assert_eq!(hasher.hash(""), 0);
        assert_eq!(hasher.hash("abc"), 0);
    }

    #[test]
    fn test_channel_uid_single_word() {
        let hasher = ChannelUid::new();
        // a single word never enters the table loop
        let uid = hasher.hash("abcd");
        assert_eq!(uid, u32::from_le_bytes(*b"abcd") & 0x7FFF_FFFF);
    }
}
