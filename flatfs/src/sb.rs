use std::convert::TryInto;

use crate::fs::{FsError, BLOCK_COUNT, BLOCK_SIZE, INODE_COUNT};

pub const SB_MAGIC: u32 = 0x4E55_4653; // NUFS

/// Length of the encoded header fields.
const HEADER_LEN: usize = 24;
/// The block allocation bitmap follows the header in the superblock.
pub const BITMAP_OFFSET: usize = HEADER_LEN;

/// The first block of the image, describing its geometry and allocation counts so a
/// mount can tell a formatted image from raw bytes.
///
/// ## Layout
/// ==================================================================
/// | magic | block size | blocks | inodes | free blocks | free inodes | block bitmap |
/// ==================================================================
/// Every header field is a big endian u32.
#[derive(Debug, PartialEq, Clone)]
pub struct SuperBlock {
    /// A 32-bit identifying string, in this case NUFS.
    pub sb_magic: u32,
    /// Bytes per block.
    pub block_size: u32,
    /// Blocks in the image, metadata blocks included.
    pub blocks_count: u32,
    /// Slots in the inode table.
    pub inodes_count: u32,
    /// Blocks available to be allocated by the system.
    pub free_blocks_count: u32,
    /// The number of remaining available inodes.
    pub free_inodes_count: u32,
}

impl SuperBlock {
    pub fn new() -> Self {
        Self {
            sb_magic: SB_MAGIC,
            block_size: BLOCK_SIZE as u32,
            blocks_count: BLOCK_COUNT as u32,
            inodes_count: INODE_COUNT as u32,
            free_blocks_count: 0,
            free_inodes_count: 0,
        }
    }

    /// Reads the super block header from a buffer of exactly BLOCK_SIZE.
    pub fn parse(buf: &[u8]) -> Result<Self, FsError> {
        if buf.len() != BLOCK_SIZE {
            return Err(FsError::Corrupted(format!(
                "superblock buffer is {} bytes, expected {}",
                buf.len(),
                BLOCK_SIZE
            )));
        }
        let field = |i: usize| {
            let start = i * 4;
            // The slice is always 4 bytes long.
            u32::from_be_bytes(buf[start..start + 4].try_into().unwrap_or([0; 4]))
        };

        let sb_magic = field(0);
        if sb_magic != SB_MAGIC {
            return Err(FsError::Corrupted(format!(
                "superblock magic constant invalid: {:#010x}",
                sb_magic
            )));
        }

        Ok(Self {
            sb_magic,
            block_size: field(1),
            blocks_count: field(2),
            inodes_count: field(3),
            free_blocks_count: field(4),
            free_inodes_count: field(5),
        })
    }

    /// Whether the image was formatted with the geometry this build uses.
    pub fn matches_geometry(&self) -> bool {
        self.block_size as usize == BLOCK_SIZE
            && self.blocks_count as usize == BLOCK_COUNT
            && self.inodes_count as usize == INODE_COUNT
    }

    /// Writes the header to the front of `buf`.
    pub fn write(&self, buf: &mut [u8]) {
        let fields = [
            self.sb_magic,
            self.block_size,
            self.blocks_count,
            self.inodes_count,
            self.free_blocks_count,
            self.free_inodes_count,
        ];
        for (chunk, value) in buf[..HEADER_LEN].chunks_mut(4).zip(fields.iter()) {
            chunk.copy_from_slice(&value.to_be_bytes());
        }
    }

    /// Serializes the SuperBlock into a BLOCK_SIZE buffer for writing to disk.
    pub fn serialize(&self) -> Vec<u8> {
        let mut sb_encoded = vec![0; BLOCK_SIZE];
        self.write(&mut sb_encoded);
        sb_encoded
    }
}

impl Default for SuperBlock {
    fn default() -> Self {
        Self::new()
    }
}
