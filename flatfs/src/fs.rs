use std::path::Path;

use crate::blocks::BlockStore;
use crate::dir::{self, Directory};
use crate::io::{BlockStorage, FileBlockEmulator};
use crate::node::{InodeTable, S_IFDIR, S_IFMT, S_IFREG};
use crate::sb::{SuperBlock, BITMAP_OFFSET};

use thiserror::Error;

pub const BLOCK_SIZE: usize = 4096;
pub const BLOCK_COUNT: usize = 256;
pub const INODE_COUNT: usize = 128;
pub const ROOT_INUM: usize = 0;

/// Known locations.
const SUPERBLOCK_INDEX: usize = 0;
const INODE_TABLE_INDEX: usize = 1;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("found no file at path")]
    NotFound,
    #[error("file already exists")]
    Exists,
    #[error("no space left on device")]
    NoSpace,
    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("index {0} out of range")]
    OutOfRange(usize),
    #[error("file of {size} bytes does not fit in a single block")]
    FileTooLarge { size: usize },
    #[error("name too long: {0}")]
    NameTooLong(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid file system layout: {0}")]
    Corrupted(String),
    #[error("device error")]
    Io(#[from] std::io::Error),
}

// Linux errno values handed to the call dispatcher.
const ENOENT: i32 = 2;
const EIO: i32 = 5;
const EEXIST: i32 = 17;
const ENOTDIR: i32 = 20;
const EISDIR: i32 = 21;
const EINVAL: i32 = 22;
const EFBIG: i32 = 27;
const ENOSPC: i32 = 28;
const ERANGE: i32 = 34;
const ENAMETOOLONG: i32 = 36;
const ENOTEMPTY: i32 = 39;

impl FsError {
    /// The negative status code a filesystem call returns for this error.
    pub fn errno(&self) -> i32 {
        -match self {
            FsError::NotFound => ENOENT,
            FsError::Exists => EEXIST,
            FsError::NoSpace => ENOSPC,
            FsError::NotDirectory => ENOTDIR,
            FsError::IsDirectory => EISDIR,
            FsError::NotEmpty => ENOTEMPTY,
            FsError::OutOfRange(_) => ERANGE,
            FsError::FileTooLarge { .. } => EFBIG,
            FsError::NameTooLong(_) => ENAMETOOLONG,
            FsError::InvalidArgument(_) => EINVAL,
            FsError::Corrupted(_) => EIO,
            FsError::Io(e) => e.raw_os_error().unwrap_or(EIO),
        }
    }
}

/// File attributes reported by [`StorageEngine::stat`].
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub inum: usize,
    pub mode: u32,
    pub size: usize,
    /// Directory entries referring to the inode.
    pub refs: u32,
    /// The owning user.
    pub uid: u32,
    /// The data block holding the content, if any.
    pub block: Option<usize>,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

/// A fixed 256 block, 1 MiB file system over a flat namespace: every path names an entry
/// of the root directory, and every file or directory owns at most one data block.
///
/// # Layout
/// ===============================================================
/// | SuperBlock + block bitmap | Inode table | Root dir | Data Region |
/// ===============================================================
///
/// The whole image lives in memory. Writes are persisted as they happen; metadata
/// (superblock, bitmap, inode table, directories) reaches the device on [`sync`] and
/// [`shutdown`].
///
/// [`sync`]: StorageEngine::sync
/// [`shutdown`]: StorageEngine::shutdown
pub struct StorageEngine<T: BlockStorage> {
    dev: T,
    blocks: BlockStore,
    inodes: InodeTable,
    owner: u32,
}

impl StorageEngine<FileBlockEmulator> {
    /// Opens the backing image at `path`, creating it when missing, and mounts it.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, FsError> {
        info!("Opening backing image {}.", path.as_ref().display());
        let dev = FileBlockEmulator::open_disk(path, BLOCK_COUNT)?;
        Self::init(dev)
    }
}

impl<T: BlockStorage> StorageEngine<T> {
    /// Loads the full block image from `dev` and mounts it. An image carrying a valid
    /// superblock gets its allocation state and inode table back, anything else is
    /// formatted: the loaded bytes stay but every block not needed by the metadata and
    /// the root directory is free.
    pub fn init(mut dev: T) -> Result<Self, FsError> {
        if dev.block_size() != BLOCK_SIZE || dev.block_count() != BLOCK_COUNT {
            return Err(FsError::InvalidArgument(format!(
                "device geometry {}x{} does not match {}x{}",
                dev.block_count(),
                dev.block_size(),
                BLOCK_COUNT,
                BLOCK_SIZE
            )));
        }

        let mut image = vec![0; BLOCK_COUNT * BLOCK_SIZE];
        dev.read_image(&mut image)?;
        let owner = dev.owner()?;

        let mut fs = StorageEngine {
            dev,
            blocks: BlockStore::from_image(image),
            inodes: InodeTable::new(),
            owner,
        };

        let sb = SuperBlock::parse(fs.blocks.get_block(SUPERBLOCK_INDEX)?);
        match sb {
            Ok(sb) if sb.matches_geometry() => {
                if let Err(e) = fs.restore() {
                    warn!("Could not restore metadata ({}), formatting.", e);
                    fs.format()?;
                }
            }
            Ok(sb) => {
                warn!(
                    "Image formatted for {} blocks of {} bytes, formatting.",
                    sb.blocks_count, sb.block_size
                );
                fs.format()?;
            }
            Err(e) => {
                info!("No filesystem found ({}), formatting.", e);
                fs.format()?;
            }
        }

        info!(
            "Mounted: {} free blocks, {} free inodes.",
            fs.blocks.free_count(),
            fs.inodes.free_count()
        );
        Ok(fs)
    }

    /// Resets allocation state and lays out the metadata blocks and an empty root
    /// directory.
    fn format(&mut self) -> Result<(), FsError> {
        self.blocks.reset_allocations();
        self.inodes = InodeTable::new();

        // The metadata blocks are the first two to be handed out.
        for &reserved in &[SUPERBLOCK_INDEX, INODE_TABLE_INDEX] {
            let blocknr = self.blocks.alloc_block()?;
            debug_assert_eq!(blocknr, reserved);
        }

        let root_block = self.blocks.alloc_block()?;
        Directory::new().store(self.blocks.get_block_mut(root_block)?)?;
        self.inodes.get_mut(ROOT_INUM)?.set_block(Some(root_block));

        self.write_metadata()?;
        for blocknr in &[SUPERBLOCK_INDEX, INODE_TABLE_INDEX, root_block] {
            self.persist_block(*blocknr)?;
        }
        info!("Formatted image, root directory in block {}.", root_block);
        Ok(())
    }

    /// Reads the bitmap and inode table stored in the metadata blocks.
    fn restore(&mut self) -> Result<(), FsError> {
        let bitmap_len = self.blocks.bitmap().as_bytes().len();
        let bitmap = self.blocks.get_block(SUPERBLOCK_INDEX)?
            [BITMAP_OFFSET..BITMAP_OFFSET + bitmap_len]
            .to_vec();
        self.blocks.load_bitmap(&bitmap);
        self.inodes = InodeTable::parse(self.blocks.get_block(INODE_TABLE_INDEX)?)?;

        let root = self.inodes.get(ROOT_INUM)?;
        let root_block = match root.block() {
            Some(b) if root.is_dir() && self.blocks.is_allocated(b) => b,
            _ => return Err(FsError::Corrupted("root directory is missing".to_string())),
        };

        // Every allocated block is a metadata block or owned by exactly one inode.
        let owned = self.inodes.check(&self.blocks)?;
        let metadata = [SUPERBLOCK_INDEX, INODE_TABLE_INDEX];
        if metadata.iter().any(|b| !self.blocks.is_allocated(*b) || owned.contains(b)) {
            return Err(FsError::Corrupted("metadata blocks are not reserved".to_string()));
        }
        let in_use = BLOCK_COUNT - self.blocks.free_count();
        if in_use != owned.len() + metadata.len() {
            return Err(FsError::Corrupted(format!(
                "{} blocks allocated but {} accounted for",
                in_use,
                owned.len() + metadata.len()
            )));
        }

        for inum in 0..INODE_COUNT {
            let node = self.inodes.get(inum)?;
            match node.block() {
                Some(blocknr) if !node.is_free() && node.is_dir() => {
                    Directory::load(self.blocks.get_block(blocknr)?)?;
                }
                _ => (),
            }
        }
        let mut named = Vec::new();
        for inum in Directory::load(self.blocks.get_block(root_block)?)?.inums() {
            let live = self.inodes.get(inum).map(|n| !n.is_free()).unwrap_or(false);
            if inum == ROOT_INUM || !live || named.contains(&inum) {
                return Err(FsError::Corrupted(format!(
                    "root entry points at inode {}",
                    inum
                )));
            }
            named.push(inum);
        }
        info!("Restored filesystem, {} inodes in use.", self.inodes.total_nodes());
        Ok(())
    }

    /// Writes the superblock, block bitmap and inode table into their blocks in memory.
    fn write_metadata(&mut self) -> Result<(), FsError> {
        let sb = SuperBlock {
            free_blocks_count: self.blocks.free_count() as u32,
            free_inodes_count: self.inodes.free_count() as u32,
            ..SuperBlock::new()
        };
        let bitmap = self.blocks.bitmap().as_bytes().to_vec();
        let block = self.blocks.get_block_mut(SUPERBLOCK_INDEX)?;
        sb.write(block);
        block[BITMAP_OFFSET..BITMAP_OFFSET + bitmap.len()].copy_from_slice(&bitmap);

        let table = self.inodes.serialize().to_vec();
        self.blocks.get_block_mut(INODE_TABLE_INDEX)?[..table.len()].copy_from_slice(&table);
        Ok(())
    }

    fn persist_block(&mut self, blocknr: usize) -> Result<(), FsError> {
        let block = self.blocks.get_block(blocknr)?;
        self.dev.write_block(blocknr, block)?;
        Ok(())
    }

    /// Splits the entry name off an absolute path. `/` is the root itself and has none.
    fn entry_name(path: &str) -> Result<Option<&str>, FsError> {
        let name = path.strip_prefix('/').ok_or_else(|| {
            FsError::InvalidArgument("path must start with \"/\"".to_string())
        })?;
        Ok(if name.is_empty() { None } else { Some(name) })
    }

    /// Maps a path onto its inode number. The namespace is flat: everything after the
    /// leading `/` is one entry name in the root directory, slashes included.
    pub fn resolve(&self, path: &str) -> Result<usize, FsError> {
        match Self::entry_name(path)? {
            None => Ok(ROOT_INUM),
            Some(name) => self.read_dir(ROOT_INUM)?.lookup(name),
        }
    }

    fn read_dir(&self, inum: usize) -> Result<Directory, FsError> {
        let node = self.inodes.get(inum)?;
        if !node.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let blocknr = node.block().ok_or_else(|| {
            FsError::Corrupted(format!("directory inode {} has no block", inum))
        })?;
        Directory::load(self.blocks.get_block(blocknr)?)
    }

    /// Applies `f` to the root directory, storing it back only if `f` succeeds.
    fn update_root<F>(&mut self, f: F) -> Result<(), FsError>
    where
        F: FnOnce(&mut Directory) -> Result<(), FsError>,
    {
        let mut root = self.read_dir(ROOT_INUM)?;
        f(&mut root)?;
        let blocknr = self
            .inodes
            .get_bnum(ROOT_INUM)?
            .ok_or_else(|| FsError::Corrupted("root directory has no block".to_string()))?;
        root.store(self.blocks.get_block_mut(blocknr)?)
    }

    /// Checks that `name` can be added to the root before anything is allocated for it.
    fn check_insert(&self, name: &str) -> Result<(), FsError> {
        dir::check_name(name)?;
        let root = self.read_dir(ROOT_INUM)?;
        if root.lookup(name).is_ok() {
            return Err(FsError::Exists);
        }
        if root.is_full() {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    pub fn access(&self, path: &str) -> Result<(), FsError> {
        debug!("access: path={}", path);
        self.resolve(path).map(|_| ())
    }

    pub fn stat(&self, path: &str) -> Result<Stat, FsError> {
        debug!("stat: path={}", path);
        let inum = self.resolve(path)?;
        let node = self.inodes.get(inum)?;
        Ok(Stat {
            inum,
            mode: node.mode(),
            size: node.size(),
            refs: node.refs(),
            uid: self.owner,
            block: node.block(),
        })
    }

    /// Copies up to `buf.len()` bytes starting at `offset` into `buf`. Reading at or past
    /// the end of the file returns 0.
    pub fn read(&self, path: &str, buf: &mut [u8], offset: usize) -> Result<usize, FsError> {
        debug!("read: path={}, size={}, offset={}", path, buf.len(), offset);
        let inum = self.resolve(path)?;
        let node = self.inodes.get(inum)?;
        if node.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if offset >= node.size() {
            return Ok(0);
        }

        let len = buf.len().min(node.size() - offset);
        let blocknr = node.block().ok_or_else(|| {
            FsError::Corrupted(format!("inode {} has data but no block", inum))
        })?;
        let block = self.blocks.get_block(blocknr)?;
        buf[..len].copy_from_slice(&block[offset..offset + len]);
        debug!("Read {} bytes from {}.", len, path);
        Ok(len)
    }

    /// Writes `data` at `offset`, growing the file as needed, and persists the written
    /// range to the device straight away.
    pub fn write(&mut self, path: &str, data: &[u8], offset: usize) -> Result<usize, FsError> {
        debug!("write: path={}, size={}, offset={}", path, data.len(), offset);
        let inum = self.resolve(path)?;
        let node = self.inodes.get(inum)?;
        if node.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let old_size = node.size();
        let end = offset
            .checked_add(data.len())
            .ok_or(FsError::FileTooLarge { size: usize::MAX })?;
        if end > old_size {
            debug!("Growing inode {} to {} bytes.", inum, end);
            self.inodes.grow(inum, end, &mut self.blocks)?;
        }

        let blocknr = self.inodes.get_bnum(inum)?.ok_or_else(|| {
            FsError::Corrupted(format!("inode {} grew without a block", inum))
        })?;
        // A write past the end persists the zero hole in front of it as well.
        let start = offset.min(old_size);
        let kept = end.min(old_size).max(offset);
        let block = self.blocks.get_block_mut(blocknr)?;
        let previous = block[offset..kept].to_vec();
        block[start..offset].iter_mut().for_each(|b| *b = 0);
        block[offset..end].copy_from_slice(data);

        if let Err(e) = self.dev.write_at(blocknr, start, &block[start..end]) {
            error!("Failed to persist {} bytes of {}: {}", end - start, path, e);
            block[offset..kept].copy_from_slice(&previous);
            self.inodes.shrink(inum, old_size, &mut self.blocks)?;
            return Err(e.into());
        }
        debug!(
            "Persisted {} bytes at image offset {}.",
            end - start,
            blocknr * BLOCK_SIZE + start
        );
        Ok(data.len())
    }

    /// Sets the size of a file, zero filling when it grows.
    pub fn truncate(&mut self, path: &str, size: usize) -> Result<(), FsError> {
        debug!("truncate: path={}, size={}", path, size);
        let inum = self.resolve(path)?;
        let node = self.inodes.get(inum)?;
        if node.is_dir() {
            return Err(FsError::IsDirectory);
        }
        let old_size = node.size();

        if size > old_size {
            self.inodes.grow(inum, size, &mut self.blocks)?;
            // Bytes past the old end may hold leftovers from an earlier, longer file.
            if let Some(blocknr) = self.inodes.get_bnum(inum)? {
                self.blocks.get_block_mut(blocknr)?[old_size..size]
                    .iter_mut()
                    .for_each(|b| *b = 0);
            }
        } else {
            self.inodes.shrink(inum, size, &mut self.blocks)?;
        }
        Ok(())
    }

    /// Creates an empty regular file. A mode without type bits is taken as a regular file.
    pub fn create(&mut self, path: &str, mode: u32) -> Result<(), FsError> {
        debug!("create: path={}, mode={:o}", path, mode);
        let name = Self::entry_name(path)?.ok_or(FsError::Exists)?;
        self.check_insert(name)?;

        let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { mode };
        if mode & S_IFMT == S_IFDIR {
            return Err(FsError::InvalidArgument(
                "use make_directory for directories".to_string(),
            ));
        }

        let inum = self.inodes.alloc()?;
        self.inodes.get_mut(inum)?.set_mode(mode);
        if let Err(e) = self.update_root(|root| root.put(name, inum)) {
            self.inodes.free(inum)?;
            return Err(e);
        }
        info!("Created {} as inode {}.", path, inum);
        Ok(())
    }

    /// Unlinks a regular file, releasing its inode and data block.
    pub fn remove(&mut self, path: &str) -> Result<(), FsError> {
        debug!("remove: path={}", path);
        let name = Self::entry_name(path)?.ok_or(FsError::IsDirectory)?;
        let inum = self.resolve(path)?;
        if self.inodes.get(inum)?.is_dir() {
            return Err(FsError::IsDirectory);
        }

        self.inodes.shrink(inum, 0, &mut self.blocks)?;
        self.inodes.free(inum)?;
        self.update_root(|root| root.delete(name))?;
        info!("Removed {} (inode {}).", path, inum);
        Ok(())
    }

    /// Creates a directory. Its data block is allocated and initialized up front so a
    /// directory always has somewhere to keep its entries.
    pub fn make_directory(&mut self, path: &str, mode: u32) -> Result<(), FsError> {
        debug!("make_directory: path={}, mode={:o}", path, mode);
        let name = Self::entry_name(path)?.ok_or(FsError::Exists)?;
        self.check_insert(name)?;

        let inum = self.inodes.alloc()?;
        let blocknr = match self.blocks.alloc_block() {
            Ok(b) => b,
            Err(e) => {
                self.inodes.free(inum)?;
                return Err(e);
            }
        };
        Directory::new().store(self.blocks.get_block_mut(blocknr)?)?;
        let node = self.inodes.get_mut(inum)?;
        node.set_mode((mode & !S_IFMT) | S_IFDIR);
        node.set_block(Some(blocknr));

        if let Err(e) = self.update_root(|root| root.put(name, inum)) {
            self.release(inum)?;
            return Err(e);
        }
        info!("Created directory {} as inode {}.", path, inum);
        Ok(())
    }

    /// Removes an empty directory.
    pub fn remove_directory(&mut self, path: &str) -> Result<(), FsError> {
        debug!("remove_directory: path={}", path);
        let name = Self::entry_name(path)?.ok_or_else(|| {
            FsError::InvalidArgument("cannot remove the root directory".to_string())
        })?;
        let inum = self.resolve(path)?;
        if !self.read_dir(inum)?.is_empty() {
            return Err(FsError::NotEmpty);
        }

        self.release(inum)?;
        self.update_root(|root| root.delete(name))?;
        info!("Removed directory {} (inode {}).", path, inum);
        Ok(())
    }

    /// Entry names of the directory at `path`, in storage order.
    pub fn list(&self, path: &str) -> Result<Vec<String>, FsError> {
        debug!("list: path={}", path);
        let inum = self.resolve(path)?;
        Ok(self.read_dir(inum)?.list())
    }

    /// Frees the inode together with its block.
    fn release(&mut self, inum: usize) -> Result<(), FsError> {
        if let Some(blocknr) = self.inodes.get_bnum(inum)? {
            self.blocks.free_block(blocknr)?;
            self.inodes.get_mut(inum)?.set_block(None);
        }
        self.inodes.free(inum)
    }

    /// Writes the metadata into the image and flushes the whole image to the device.
    pub fn sync(&mut self) -> Result<(), FsError> {
        self.write_metadata()?;
        self.dev.write_image(self.blocks.image())?;
        self.dev.sync_disk()?;
        debug!("Synced image to device.");
        Ok(())
    }

    /// Flushes everything and hands the device back. The engine is gone afterwards.
    pub fn shutdown(mut self) -> Result<T, FsError> {
        info!("Shutting down, flushing image.");
        self.sync()?;
        Ok(self.dev)
    }

    pub fn free_blocks(&self) -> usize {
        self.blocks.free_count()
    }

    pub fn free_inodes(&self) -> usize {
        self.inodes.free_count()
    }

    /// A `0`/`1` rendering of the block bitmap.
    pub fn dump_bitmap(&self) -> String {
        self.blocks.bitmap().dump()
    }
}
