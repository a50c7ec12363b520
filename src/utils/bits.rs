use crate::Result;
use crate::ServerError;

/// MSB-first bit reader over a byte slice.
///
/// Used by the elementary-stream parsers to pick apart codec headers
/// (ADTS/AC-3 syncframes, H.264/H.265 parameter sets, MPEG-2 sequence
/// headers) and by the PSI section parser.
pub struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
    bit_position: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            bit_position: 0,
        }
    }

    pub fn read_bits(&mut self, count: u8) -> Result<u32> {
        if count > 32 {
            return Err(ServerError::InvalidData(
                "Cannot read more than 32 bits".into(),
            ));
        }

        let mut result = 0u32;
        let mut bits_left = count;

        while bits_left > 0 {
            if self.position >= self.data.len() {
                return Err(ServerError::InvalidData("Reached end of data".into()));
            }

            let byte = self.data[self.position];
            let bits_in_byte = 8 - self.bit_position;
            let bits_to_read = bits_in_byte.min(bits_left);

            let mask = ((1u16 << bits_to_read) - 1) as u8;
            let shifted = (byte >> (8 - self.bit_position - bits_to_read)) & mask;

            result = (result << bits_to_read) | shifted as u32;

            self.bit_position += bits_to_read;
            if self.bit_position >= 8 {
                self.position += 1;
                self.bit_position = 0;
            }

            bits_left -= bits_to_read;
        }

        Ok(result)
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? == 1)
    }

    /// Unsigned Exp-Golomb code (ue(v) in H.264/H.265).
    pub fn read_golomb(&mut self) -> Result<u32> {
        let mut leading_zeros = 0u32;

        while self.read_bits(1)? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(ServerError::InvalidData("golomb code too long".into()));
            }
        }

        if leading_zeros == 0 {
            return Ok(0);
        }

        let remaining = self.read_bits(leading_zeros as u8)?;
        Ok((1 << leading_zeros) - 1 + remaining)
    }

    /// Signed Exp-Golomb code (se(v) in H.264/H.265).
    pub fn read_signed_golomb(&mut self) -> Result<i32> {
        let code = self.read_golomb()?;
        if code == 0 {
            return Ok(0);
        }
        let neg = (code & 1) == 0;
        let abs = ((code + 1) >> 1) as i32;
        Ok(if neg { -abs } else { abs })
    }

    pub fn skip_bits(&mut self, count: u32) -> Result<()> {
        let new_pos = self.position * 8 + self.bit_position as usize + count as usize;
        self.position = new_pos / 8;
        self.bit_position = (new_pos % 8) as u8;

        if self.position > self.data.len() {
            return Err(ServerError::InvalidData(
                "Attempted to skip past end of data".into(),
            ));
        }

        Ok(())
    }

    /// Remaining readable bits.
    pub fn remaining(&self) -> usize {
        self.data.len() * 8 - (self.position * 8 + self.bit_position as usize)
    }
}
