use crate::fs::{FsError, BLOCK_SIZE};

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Maximum number of entries one directory block holds.
pub const MAX_ENTRIES: usize = 32;
/// Longest entry name in bytes, one byte of the name field is kept for the terminator.
pub const MAX_NAME_LEN: usize = 27;

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Copy, Clone, Debug)]
struct DirEntry {
    name: [u8; MAX_NAME_LEN + 1],
    inum: u32,
}

impl DirEntry {
    fn new(name: &str, inum: usize) -> Self {
        let mut entry = Self::new_zeroed();
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry.inum = inum as u32;
        entry
    }

    fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..end]
    }

    fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }
}

/// An ordered name to inode number mapping, stored at the start of a directory inode's
/// data block. Entries keep their insertion order, which is also the listing order.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Copy, Clone, Debug)]
pub struct Directory {
    entry_count: u32,
    entries: [DirEntry; MAX_ENTRIES],
}

/// Bytes of a data block taken up by a directory.
pub const DIRECTORY_SIZE: usize = std::mem::size_of::<Directory>();

impl Directory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::new_zeroed()
    }

    /// Reads the directory stored at the start of `block`.
    pub fn load(block: &[u8]) -> Result<Self, FsError> {
        let dir = Self::read_from_prefix(block).ok_or_else(|| {
            FsError::Corrupted(format!("directory block too short: {} bytes", block.len()))
        })?;
        if dir.len() > MAX_ENTRIES {
            return Err(FsError::Corrupted(format!(
                "directory claims {} entries",
                dir.entry_count
            )));
        }
        Ok(dir)
    }

    /// Writes the directory to the start of `block`, leaving the rest of the block alone.
    pub fn store(&self, block: &mut [u8]) -> Result<(), FsError> {
        self.write_to_prefix(block).ok_or_else(|| {
            FsError::Corrupted(format!("directory block too short: {} bytes", block.len()))
        })
    }

    /// Appends `name -> inum`. Names are compared byte for byte, case sensitive.
    pub fn put(&mut self, name: &str, inum: usize) -> Result<(), FsError> {
        check_name(name)?;
        if self.position(name).is_some() {
            return Err(FsError::Exists);
        }
        if self.is_full() {
            return Err(FsError::NoSpace);
        }
        let slot = self.len();
        self.entries[slot] = DirEntry::new(name, inum);
        self.entry_count += 1;
        Ok(())
    }

    /// Removes `name`, shifting later entries down so survivors keep their order.
    pub fn delete(&mut self, name: &str) -> Result<(), FsError> {
        let i = self.position(name).ok_or(FsError::NotFound)?;
        let count = self.len();
        self.entries.copy_within(i + 1..count, i);
        self.entries[count - 1] = DirEntry::new_zeroed();
        self.entry_count -= 1;
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<usize, FsError> {
        self.position(name)
            .map(|i| self.entries[i].inum as usize)
            .ok_or(FsError::NotFound)
    }

    /// Entry names in storage order.
    pub fn list(&self) -> Vec<String> {
        self.live().iter().map(DirEntry::name).collect()
    }

    /// Inode numbers of the entries, in storage order.
    pub fn inums(&self) -> impl Iterator<Item = usize> + '_ {
        self.live().iter().map(|e| e.inum as usize)
    }

    pub fn len(&self) -> usize {
        self.entry_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= MAX_ENTRIES
    }

    fn live(&self) -> &[DirEntry] {
        &self.entries[..self.len()]
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.live()
            .iter()
            .position(|e| e.name_bytes() == name.as_bytes())
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

/// Validates a name before it is stored in an entry.
pub fn check_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() {
        return Err(FsError::InvalidArgument("empty name".to_string()));
    }
    if name.as_bytes().contains(&0) {
        return Err(FsError::InvalidArgument(
            "name contains a NUL byte".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::NameTooLong(name.to_string()));
    }
    Ok(())
}

// A directory must fit inside the single block its inode owns.
const _: () = assert!(DIRECTORY_SIZE <= BLOCK_SIZE);
