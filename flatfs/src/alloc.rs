use std::fmt::Write;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum State {
    Free,
    Used,
}

/// A fixed length bit array laid over a byte buffer. Bit `i` lives in byte `i / 8`
/// under the mask `1 << (i % 8)`, so a buffer of `ceil(len / 8)` bytes is enough to
/// track `len` resources.
///
/// The vector never owns more than the buffer it is handed. Passing an owned `Vec<u8>`
/// gives an owning bitmap, passing a borrowed slice (for example a region of an on
/// disk block) gives a view.
#[derive(Debug, Clone)]
pub struct BitVector<B> {
    buf: B,
    len: usize,
}

impl BitVector<Vec<u8>> {
    /// Allocates a zeroed (all free) bit vector able to track `len` bits.
    pub fn zeroed(len: usize) -> Self {
        Self {
            buf: vec![0; Self::bytes_for(len)],
            len,
        }
    }
}

impl<B> BitVector<B> {
    /// The number of bytes needed to store `len` bits.
    pub const fn bytes_for(len: usize) -> usize {
        (len + 7) / 8
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<B: AsRef<[u8]>> BitVector<B> {
    /// Wraps `buf` as a vector of `len` bits.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is too short to hold `len` bits.
    pub fn new(buf: B, len: usize) -> Self {
        assert!(
            buf.as_ref().len() >= Self::bytes_for(len),
            "Buffer of {} bytes cannot hold {} bits.",
            buf.as_ref().len(),
            len
        );
        Self { buf, len }
    }

    pub fn get(&self, i: usize) -> State {
        assert!(i < self.len, "Bit index {} out of range {}.", i, self.len);
        let byte = self.buf.as_ref()[i / 8];
        match (byte >> (i % 8)) & 0b01 {
            0 => State::Free,
            1 => State::Used,
            _ => unreachable!("Bit state returned a non 0 or 1 value. This likely indicates an error with bitmasking"),
        }
    }

    /// Returns the lowest index whose bit is clear, scanning `0..len` in order.
    pub fn first_clear(&self) -> Option<usize> {
        (0..self.len).find(|&i| self.get(i) == State::Free)
    }

    /// Counts the bits currently clear.
    pub fn count_free(&self) -> usize {
        (0..self.len).filter(|&i| self.get(i) == State::Free).count()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf.as_ref()[..Self::bytes_for(self.len)]
    }

    /// Renders the bits as `0`/`1` characters in groups of eight, lowest index first.
    pub fn dump(&self) -> String {
        let mut out = String::with_capacity(self.len + self.len / 8);
        for i in 0..self.len {
            if i > 0 && i % 8 == 0 {
                out.push(' ');
            }
            let bit = match self.get(i) {
                State::Free => 0,
                State::Used => 1,
            };
            // Writing into a String cannot fail.
            let _ = write!(out, "{}", bit);
        }
        out
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BitVector<B> {
    pub fn set(&mut self, i: usize, state: State) {
        assert!(i < self.len, "Bit index {} out of range {}.", i, self.len);
        let mask = 0b01_u8 << (i % 8);
        let byte = &mut self.buf.as_mut()[i / 8];
        match state {
            State::Used => *byte |= mask,
            State::Free => *byte &= !mask,
        }
    }

    pub fn set_reserved(&mut self, i: usize) {
        self.set(i, State::Used);
    }

    pub fn set_free(&mut self, i: usize) {
        self.set(i, State::Free);
    }

    /// Overwrites the backing bytes, e.g. with a bitmap read back from disk.
    pub fn load(&mut self, bytes: &[u8]) {
        let n = Self::bytes_for(self.len);
        self.buf.as_mut()[..n].copy_from_slice(&bytes[..n]);
    }

    /// Clears every bit.
    pub fn clear(&mut self) {
        let n = Self::bytes_for(self.len);
        self.buf.as_mut()[..n].iter_mut().for_each(|b| *b = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_read_and_write_values_to_bitmap() {
        let mut bmp = BitVector::zeroed(256);

        bmp.set_reserved(2);

        assert_eq!(bmp.get(0), State::Free);
        assert_eq!(bmp.get(2), State::Used);
        assert_eq!(bmp.as_bytes()[0], 0b0000_0100);
    }

    #[test]
    fn can_set_values_at_ends_of_bitmap() {
        let mut bmp = BitVector::zeroed(256);

        bmp.set_reserved(0);
        bmp.set_reserved(255);

        assert_eq!(bmp.get(0), State::Used);
        assert_eq!(bmp.get(255), State::Used);
    }

    #[test]
    fn can_toggle_block_between_free_and_used() {
        let mut bmp = BitVector::zeroed(64);

        bmp.set_reserved(10);
        bmp.set_reserved(11);
        assert_eq!(bmp.get(10), State::Used);

        bmp.set_free(10);
        assert_eq!(bmp.get(10), State::Free);
        // Clearing a bit must leave its neighbours alone.
        assert_eq!(bmp.get(11), State::Used);
    }

    #[test]
    fn first_clear_returns_lowest_free_index() {
        let mut bmp = BitVector::zeroed(16);
        assert_eq!(bmp.first_clear(), Some(0));

        for i in 0..5 {
            bmp.set_reserved(i);
        }
        assert_eq!(bmp.first_clear(), Some(5));

        bmp.set_free(2);
        assert_eq!(bmp.first_clear(), Some(2));
    }

    #[test]
    fn first_clear_on_full_bitmap_is_none() {
        let mut bmp = BitVector::zeroed(10);
        for i in 0..10 {
            bmp.set_reserved(i);
        }
        assert_eq!(bmp.first_clear(), None);
        assert_eq!(bmp.count_free(), 0);
    }

    #[test]
    fn first_clear_ignores_padding_bits_past_len() {
        // 10 bits live in 2 bytes, the last 6 bits of the second byte are padding.
        let mut bmp = BitVector::new(vec![0xff, 0b0000_0011], 10);
        assert_eq!(bmp.first_clear(), None);
        bmp.set_free(9);
        assert_eq!(bmp.first_clear(), Some(9));
    }

    #[test]
    fn can_operate_on_borrowed_buffer() {
        let mut raw = [0_u8; 4];
        {
            let mut view = BitVector::new(&mut raw[..], 32);
            view.set_reserved(9);
        }
        assert_eq!(raw[1], 0b0000_0010);
    }

    #[test]
    fn dump_groups_bits_by_byte() {
        let mut bmp = BitVector::zeroed(12);
        bmp.set_reserved(0);
        bmp.set_reserved(9);
        assert_eq!(bmp.dump(), "10000000 0100");
    }

    #[test]
    #[should_panic]
    fn out_of_range_index_panics() {
        let bmp = BitVector::zeroed(8);
        bmp.get(8);
    }

    #[test]
    #[should_panic]
    fn undersized_buffer_panics() {
        BitVector::new(vec![0_u8; 1], 9);
    }
}
