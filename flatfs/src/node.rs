use crate::blocks::BlockStore;
use crate::fs::{FsError, BLOCK_SIZE, INODE_COUNT, ROOT_INUM};

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// File type mask and the two types this filesystem stores.
pub const S_IFMT: u32 = 0o170_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;

const ROOT_DEFAULT_MODE: u32 = S_IFDIR | 0o755;
/// Marks an inode that owns no data block.
const NO_BLOCK: u32 = u32::MAX;

/// Size of one packed inode record on disk.
pub const INODE_SIZE: usize = std::mem::size_of::<Inode>();

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Copy, Clone, Debug, PartialEq)]
pub struct Inode {
    /// The number of directory entries referring to this inode, zero when free.
    refs: u32,
    /// The file mode, type and permission bits (e.g. drwxr-xr-x).
    mode: u32,
    /// The total size of the file in bytes, never more than one block.
    size: u32,
    /// The single data block owned by this inode, or `NO_BLOCK`.
    block: u32,
}

impl Inode {
    fn root() -> Self {
        Self {
            refs: 1,
            mode: ROOT_DEFAULT_MODE,
            size: 0,
            block: NO_BLOCK,
        }
    }

    fn fresh() -> Self {
        Self {
            refs: 1,
            mode: 0,
            size: 0,
            block: NO_BLOCK,
        }
    }

    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// The data block backing this inode, if one has been allocated.
    pub fn block(&self) -> Option<usize> {
        match self.block {
            NO_BLOCK => None,
            b => Some(b as usize),
        }
    }

    pub fn is_free(&self) -> bool {
        self.refs == 0
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub(crate) fn set_mode(&mut self, mode: u32) {
        self.mode = mode;
    }

    pub(crate) fn set_block(&mut self, blocknr: Option<usize>) {
        self.block = blocknr.map_or(NO_BLOCK, |b| b as u32);
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        debug_assert!(size <= BLOCK_SIZE);
        self.size = size as u32;
    }
}

/// The fixed table of every inode in the filesystem. Slot 0 always holds the root
/// directory.
pub struct InodeTable {
    nodes: [Inode; INODE_COUNT],
}

impl InodeTable {
    /// A table with every slot free except the root directory.
    pub fn new() -> Self {
        let mut nodes = [Inode::new_zeroed(); INODE_COUNT];
        nodes[ROOT_INUM] = Inode::root();
        Self { nodes }
    }

    /// Reads a table serialized with [`InodeTable::serialize`].
    pub fn parse(buf: &[u8]) -> Result<Self, FsError> {
        let nodes = <[Inode; INODE_COUNT]>::read_from_prefix(buf).ok_or_else(|| {
            FsError::Corrupted(format!(
                "inode table needs {} bytes, got {}",
                INODE_COUNT * INODE_SIZE,
                buf.len()
            ))
        })?;
        Ok(Self { nodes })
    }

    /// Packs every inode record back to back.
    pub fn serialize(&self) -> &[u8] {
        self.nodes.as_bytes()
    }

    /// Claims the lowest numbered free inode. The caller fills in the mode.
    pub fn alloc(&mut self) -> Result<usize, FsError> {
        let inum = self
            .nodes
            .iter()
            .position(Inode::is_free)
            .ok_or(FsError::NoSpace)?;
        self.nodes[inum] = Inode::fresh();
        debug!("Allocated inode {}.", inum);
        Ok(inum)
    }

    /// Resets the slot to the free state. Any data block must already have been released.
    pub fn free(&mut self, inum: usize) -> Result<(), FsError> {
        let node = self.get_mut(inum)?;
        debug_assert!(node.block().is_none(), "inode {} freed while owning a block", inum);
        *node = Inode::new_zeroed();
        debug!("Freed inode {}.", inum);
        Ok(())
    }

    pub fn get(&self, inum: usize) -> Result<&Inode, FsError> {
        self.nodes.get(inum).ok_or(FsError::OutOfRange(inum))
    }

    pub fn get_mut(&mut self, inum: usize) -> Result<&mut Inode, FsError> {
        self.nodes.get_mut(inum).ok_or(FsError::OutOfRange(inum))
    }

    /// The data block of `inum`, if it has one.
    pub fn get_bnum(&self, inum: usize) -> Result<Option<usize>, FsError> {
        Ok(self.get(inum)?.block())
    }

    /// Extends `inum` to `new_size` bytes. The inode may own at most one block, so sizes
    /// past `BLOCK_SIZE` are rejected and a block is only allocated when none is held.
    pub fn grow(
        &mut self,
        inum: usize,
        new_size: usize,
        blocks: &mut BlockStore,
    ) -> Result<(), FsError> {
        let node = self.get_mut(inum)?;
        if new_size <= node.size() {
            return Ok(());
        }
        if new_size > BLOCK_SIZE {
            return Err(FsError::FileTooLarge { size: new_size });
        }
        if node.block().is_none() {
            let blocknr = blocks.alloc_block()?;
            node.set_block(Some(blocknr));
        }
        node.set_size(new_size);
        Ok(())
    }

    /// Cuts `inum` down to `new_size` bytes, handing its block back once it is empty.
    pub fn shrink(
        &mut self,
        inum: usize,
        new_size: usize,
        blocks: &mut BlockStore,
    ) -> Result<(), FsError> {
        let node = self.get_mut(inum)?;
        let old_size = node.size();
        if new_size >= old_size && new_size > 0 {
            return Ok(());
        }
        if let Some(blocknr) = node.block() {
            if new_size == 0 {
                blocks.free_block(blocknr)?;
                node.set_block(None);
            } else {
                // Bytes past the end read as zeros once the file grows again.
                blocks.get_block_mut(blocknr)?[new_size..old_size]
                    .iter_mut()
                    .for_each(|b| *b = 0);
            }
        }
        node.set_size(new_size);
        Ok(())
    }

    /// Validates records read back from an image against the block bitmap. Returns the
    /// data blocks owned by live inodes.
    pub fn check(&self, blocks: &BlockStore) -> Result<Vec<usize>, FsError> {
        let corrupt = |inum: usize, what: &str| {
            Err(FsError::Corrupted(format!("inode {} {}", inum, what)))
        };
        let mut owned: Vec<usize> = Vec::new();

        for (inum, node) in self.nodes.iter().enumerate() {
            if node.is_free() {
                if *node != Inode::new_zeroed() {
                    return corrupt(inum, "is free but not zeroed");
                }
                continue;
            }
            let kind = node.mode() & S_IFMT;
            if kind != S_IFDIR && kind != S_IFREG {
                return corrupt(inum, "has an unknown file type");
            }
            if node.size() > BLOCK_SIZE {
                return corrupt(inum, "is larger than one block");
            }
            match node.block() {
                None if node.size() > 0 || node.is_dir() => {
                    return corrupt(inum, "has data but no block")
                }
                None => (),
                Some(b) if !blocks.is_allocated(b) => {
                    return corrupt(inum, "points at an unallocated block")
                }
                Some(b) if owned.contains(&b) => return corrupt(inum, "shares its block"),
                Some(b) => owned.push(b),
            }
        }
        Ok(owned)
    }

    pub fn free_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_free()).count()
    }

    /// Number of live inodes, the root included.
    pub fn total_nodes(&self) -> usize {
        INODE_COUNT - self.free_count()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_record_is_packed() {
        assert_eq!(INODE_SIZE, 16);
        assert!(INODE_COUNT * INODE_SIZE <= BLOCK_SIZE);
    }

    #[test]
    fn new_table_holds_only_root() {
        let table = InodeTable::new();
        let root = table.get(ROOT_INUM).unwrap();
        assert_eq!(root.refs(), 1);
        assert_eq!(root.mode(), 0o040_755);
        assert_eq!(root.size(), 0);
        assert!(root.is_dir());
        assert_eq!(table.total_nodes(), 1);
    }

    #[test]
    fn alloc_returns_smallest_free_inode() {
        let mut table = InodeTable::new();
        assert_eq!(table.alloc().unwrap(), 1);
        assert_eq!(table.alloc().unwrap(), 2);
        assert_eq!(table.alloc().unwrap(), 3);

        table.free(2).unwrap();
        assert_eq!(table.alloc().unwrap(), 2);

        let node = table.get(2).unwrap();
        assert_eq!(node.refs(), 1);
        assert_eq!(node.size(), 0);
        assert_eq!(node.block(), None);
    }

    #[test]
    fn full_table_returns_no_space() {
        let mut table = InodeTable::new();
        for _ in 1..INODE_COUNT {
            table.alloc().unwrap();
        }
        match table.alloc() {
            Err(FsError::NoSpace) => (),
            other => panic!("expected NoSpace, got {:?}", other),
        }
        assert_eq!(table.free_count(), 0);
    }

    #[test]
    fn get_out_of_range_errors() {
        let mut table = InodeTable::new();
        assert!(table.get(INODE_COUNT - 1).is_ok());
        assert!(matches!(table.get(INODE_COUNT), Err(FsError::OutOfRange(_))));
        assert!(matches!(table.free(INODE_COUNT), Err(FsError::OutOfRange(_))));
    }

    #[test]
    fn grow_allocates_a_single_block() {
        let mut table = InodeTable::new();
        let mut blocks = BlockStore::new();
        let inum = table.alloc().unwrap();

        table.grow(inum, 10, &mut blocks).unwrap();
        let first = table.get_bnum(inum).unwrap();
        assert_eq!(first, Some(0));
        assert_eq!(table.get(inum).unwrap().size(), 10);

        table.grow(inum, BLOCK_SIZE, &mut blocks).unwrap();
        assert_eq!(table.get_bnum(inum).unwrap(), first);
        assert_eq!(blocks.free_count(), crate::fs::BLOCK_COUNT - 1);
    }

    #[test]
    fn grow_to_smaller_size_is_noop() {
        let mut table = InodeTable::new();
        let mut blocks = BlockStore::new();
        let inum = table.alloc().unwrap();
        table.grow(inum, 100, &mut blocks).unwrap();
        table.grow(inum, 50, &mut blocks).unwrap();
        assert_eq!(table.get(inum).unwrap().size(), 100);
    }

    #[test]
    fn grow_past_block_size_is_too_large() {
        let mut table = InodeTable::new();
        let mut blocks = BlockStore::new();
        let inum = table.alloc().unwrap();

        match table.grow(inum, BLOCK_SIZE + 1, &mut blocks) {
            Err(FsError::FileTooLarge { size }) => assert_eq!(size, BLOCK_SIZE + 1),
            other => panic!("expected FileTooLarge, got {:?}", other),
        }
        assert_eq!(table.get(inum).unwrap().size(), 0);
        assert_eq!(blocks.free_count(), crate::fs::BLOCK_COUNT);
    }

    #[test]
    fn shrink_to_zero_releases_block() {
        let mut table = InodeTable::new();
        let mut blocks = BlockStore::new();
        let inum = table.alloc().unwrap();
        table.grow(inum, 64, &mut blocks).unwrap();

        table.shrink(inum, 32, &mut blocks).unwrap();
        assert_eq!(table.get(inum).unwrap().size(), 32);
        assert!(blocks.is_allocated(0));

        table.shrink(inum, 0, &mut blocks).unwrap();
        assert_eq!(table.get_bnum(inum).unwrap(), None);
        assert!(!blocks.is_allocated(0));
    }

    #[test]
    fn shrink_zeroes_the_trimmed_tail() {
        let mut table = InodeTable::new();
        let mut blocks = BlockStore::new();
        let inum = table.alloc().unwrap();
        table.grow(inum, 6, &mut blocks).unwrap();
        let blocknr = table.get_bnum(inum).unwrap().unwrap();
        blocks.get_block_mut(blocknr).unwrap()[..6].copy_from_slice(b"abcdef");

        table.shrink(inum, 2, &mut blocks).unwrap();
        assert_eq!(&blocks.get_block(blocknr).unwrap()[..6], b"ab\0\0\0\0");
    }

    #[test]
    fn failed_shrink_keeps_size_and_block() {
        let mut table = InodeTable::new();
        let mut blocks = BlockStore::new();
        let inum = table.alloc().unwrap();
        table.grow(inum, 8, &mut blocks).unwrap();
        blocks.free_block(0).unwrap();

        assert!(matches!(
            table.shrink(inum, 0, &mut blocks),
            Err(FsError::Corrupted(_))
        ));
        assert_eq!(table.get(inum).unwrap().size(), 8);
        assert_eq!(table.get_bnum(inum).unwrap(), Some(0));
    }

    #[test]
    fn check_accepts_a_consistent_table() {
        let mut table = InodeTable::new();
        let mut blocks = BlockStore::new();
        let root_block = blocks.alloc_block().unwrap();
        table.get_mut(ROOT_INUM).unwrap().set_block(Some(root_block));
        let inum = table.alloc().unwrap();
        table.get_mut(inum).unwrap().set_mode(S_IFREG | 0o644);
        table.grow(inum, 3, &mut blocks).unwrap();
        let empty = table.alloc().unwrap();
        table.get_mut(empty).unwrap().set_mode(S_IFREG | 0o600);

        assert_eq!(table.check(&blocks).unwrap(), vec![root_block, 1]);
    }

    #[test]
    fn check_rejects_damaged_records() {
        let mut blocks = BlockStore::new();
        let root_block = blocks.alloc_block().unwrap();
        let file_block = blocks.alloc_block().unwrap();
        let base = || {
            let mut table = InodeTable::new();
            table.get_mut(ROOT_INUM).unwrap().set_block(Some(root_block));
            let inum = table.alloc().unwrap();
            let node = table.get_mut(inum).unwrap();
            node.set_mode(S_IFREG | 0o644);
            node.set_block(Some(file_block));
            node.size = 3;
            table
        };
        assert!(base().check(&blocks).is_ok());

        let damage: [fn(&mut InodeTable); 8] = [
            |t| t.nodes[1].size = BLOCK_SIZE as u32 + 1,
            |t| t.nodes[1].block = NO_BLOCK,
            |t| t.nodes[1].block = crate::fs::BLOCK_COUNT as u32,
            |t| t.nodes[1].block = 7,
            |t| t.nodes[1].block = t.nodes[ROOT_INUM].block,
            |t| t.nodes[1].mode = 0o644,
            |t| t.nodes[2].size = 5,
            |t| t.nodes[ROOT_INUM].block = NO_BLOCK,
        ];

        for (i, f) in damage.iter().enumerate() {
            let mut table = base();
            f(&mut table);
            match table.check(&blocks) {
                Err(FsError::Corrupted(_)) => (),
                other => panic!("case {}: expected Corrupted, got {:?}", i, other),
            }
        }
    }

    #[test]
    fn table_survives_serialization() {
        let mut table = InodeTable::new();
        let mut blocks = BlockStore::new();
        let inum = table.alloc().unwrap();
        table.get_mut(inum).unwrap().set_mode(S_IFREG | 0o644);
        table.grow(inum, 2, &mut blocks).unwrap();

        let parsed = InodeTable::parse(table.serialize()).unwrap();
        assert_eq!(parsed.get(inum).unwrap(), table.get(inum).unwrap());
        assert_eq!(parsed.total_nodes(), 2);
    }

    #[test]
    fn parse_short_buffer_errors() {
        assert!(InodeTable::parse(&[0; 16]).is_err());
    }
}
