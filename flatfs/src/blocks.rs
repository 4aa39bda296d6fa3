use crate::alloc::{BitVector, State};
use crate::fs::{FsError, BLOCK_COUNT, BLOCK_SIZE};

/// The in-memory block image together with its allocation bitmap. Blocks are handed out
/// lowest index first and are zeroed as they are allocated so a new owner never sees the
/// bytes of a previous one.
pub struct BlockStore {
    /// `BLOCK_COUNT * BLOCK_SIZE` bytes, block `i` at `i * BLOCK_SIZE`.
    image: Vec<u8>,
    /// One bit per block, set while the block is owned.
    bitmap: BitVector<Vec<u8>>,
}

impl BlockStore {
    /// A zero filled image with every block free.
    pub fn new() -> Self {
        Self::from_image(vec![0; BLOCK_COUNT * BLOCK_SIZE])
    }

    /// Adopts an image loaded from disk. All blocks start out free, allocation state is
    /// restored separately with [`BlockStore::load_bitmap`].
    ///
    /// # Panics
    ///
    /// Panics if the image is not exactly `BLOCK_COUNT * BLOCK_SIZE` bytes.
    pub fn from_image(image: Vec<u8>) -> Self {
        assert_eq!(
            image.len(),
            BLOCK_COUNT * BLOCK_SIZE,
            "Block image must span exactly {} blocks.",
            BLOCK_COUNT
        );
        Self {
            image,
            bitmap: BitVector::zeroed(BLOCK_COUNT),
        }
    }

    pub fn get_block(&self, blocknr: usize) -> Result<&[u8], FsError> {
        let range = Self::range(blocknr)?;
        Ok(&self.image[range])
    }

    pub fn get_block_mut(&mut self, blocknr: usize) -> Result<&mut [u8], FsError> {
        let range = Self::range(blocknr)?;
        Ok(&mut self.image[range])
    }

    /// Reserves the first free block and zeroes its contents.
    pub fn alloc_block(&mut self) -> Result<usize, FsError> {
        let blocknr = self.bitmap.first_clear().ok_or(FsError::NoSpace)?;
        self.bitmap.set_reserved(blocknr);
        self.get_block_mut(blocknr)?.iter_mut().for_each(|b| *b = 0);
        debug!("Allocated block {}.", blocknr);
        Ok(blocknr)
    }

    /// Returns a block to the free pool. Freeing a block that is not allocated is an error
    /// since it means two owners believed they held it.
    pub fn free_block(&mut self, blocknr: usize) -> Result<(), FsError> {
        Self::range(blocknr)?;
        if self.bitmap.get(blocknr) == State::Free {
            return Err(FsError::Corrupted(format!(
                "block {} freed while not allocated",
                blocknr
            )));
        }
        self.bitmap.set_free(blocknr);
        debug!("Freed block {}.", blocknr);
        Ok(())
    }

    pub fn is_allocated(&self, blocknr: usize) -> bool {
        blocknr < BLOCK_COUNT && self.bitmap.get(blocknr) == State::Used
    }

    pub fn free_count(&self) -> usize {
        self.bitmap.count_free()
    }

    /// The whole image, in block order.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn bitmap(&self) -> &BitVector<Vec<u8>> {
        &self.bitmap
    }

    /// Replaces the allocation state with a bitmap read back from disk.
    pub fn load_bitmap(&mut self, bytes: &[u8]) {
        self.bitmap.load(bytes);
    }

    /// Marks every block free without touching block contents.
    pub fn reset_allocations(&mut self) {
        self.bitmap.clear();
    }

    fn range(blocknr: usize) -> Result<std::ops::Range<usize>, FsError> {
        if blocknr >= BLOCK_COUNT {
            return Err(FsError::OutOfRange(blocknr));
        }
        let start = blocknr * BLOCK_SIZE;
        Ok(start..start + BLOCK_SIZE)
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}
