use std::path::Path;

/// The block number to access ranging from 0 (the first block) to n - 1 (the last
/// block) where n is number of blocks available.
pub type BlockNumber = usize;

/// A fixed geometry block device the storage engine loads from and flushes to.
///
/// Tried to map as closely as possible to the prescribed interface found here:
/// http://web.mit.edu/6.033/1997/handouts/html/04sfs.html.
///
/// In cases where implementing the interface as described would lead to non-idiomatic
/// rust code, I opted to use a more rust-y interface.
pub trait BlockStorage {
    /// Opens a disk at the specified path, creating it when missing. This method does not
    /// validate the storage blocks, it is up for clients to ensure disks are appropriately
    /// initialized.
    fn open_disk<P: AsRef<Path>>(path: P, nblocks: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized;
    /// Bytes in one block.
    fn block_size(&self) -> usize;
    /// The total number of blocks on the device.
    fn block_count(&self) -> usize;
    /// Reads disk block number into provided buffer.
    ///
    /// # Errors
    ///
    /// Attempting to read a block out of range will return an error.
    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes provided buffer into the specified block number.
    ///
    /// # Errors
    ///
    /// Attempting to write a block out of range will return an error.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()>;
    /// Writes `buf` at byte `offset` within block `blocknr`, leaving the rest of the block
    /// as it is on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the range does not fit inside the block.
    fn write_at(
        &mut self,
        blocknr: BlockNumber,
        offset: usize,
        buf: &[u8],
    ) -> std::io::Result<()>;
    /// Flush any buffered disk IO from memory. This is useful if it must guaranteed
    /// the disk writes actually occurred, for instance, if being re-read from
    /// disk.
    fn sync_disk(&mut self) -> std::io::Result<()>;

    /// Reads every block into `image`, which must hold `block_count * block_size` bytes.
    fn read_image(&mut self, image: &mut [u8]) -> std::io::Result<()> {
        let block_size = self.block_size();
        for (blocknr, chunk) in image.chunks_mut(block_size).enumerate() {
            self.read_block(blocknr, chunk)?;
        }
        Ok(())
    }

    /// Writes every block of `image` back to the device.
    fn write_image(&mut self, image: &[u8]) -> std::io::Result<()> {
        let block_size = self.block_size();
        for (blocknr, chunk) in image.chunks(block_size).enumerate() {
            self.write_block(blocknr, chunk)?;
        }
        Ok(())
    }

    /// The user owning the device, reported as the owner of every file on it.
    fn owner(&self) -> std::io::Result<u32> {
        Ok(0)
    }
}
