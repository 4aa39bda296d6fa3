use crate::io::{BlockNumber, BlockStorage};
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

/// 4k is a common block size for file systems. Disks commonly are composed of
/// 512 byte blocks mapping each file system block to 8 hard disk blocks.
pub const BLOCK_SIZE_BYTES: usize = 4096;

pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of a block.
    fd: File,
    /// The total number of blocks available in the file store.
    block_count: usize,
}

/// Emulates block disk/flash storage in userspace using a file as block storage. The
/// backing image of a mounted filesystem is one of these.
impl FileBlockEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    fn check_range(&self, blocknr: BlockNumber) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block out of range",
            ));
        }
        Ok(())
    }
}

impl BlockStorage for FileBlockEmulator {
    fn open_disk<P: AsRef<Path>>(dest: P, nblocks: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized,
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dest)?;
        FileBlockEmulatorBuilder::from(file)
            .with_block_count(nblocks)
            // Keep whatever an existing image already holds.
            .clear_medium(false)
            .build()
    }

    fn block_size(&self) -> usize {
        BLOCK_SIZE_BYTES
    }

    fn block_count(&self) -> usize {
        self.block_count
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;

        if buf.len() < BLOCK_SIZE_BYTES {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }
        self.fd
            .seek(SeekFrom::Start((blocknr * BLOCK_SIZE_BYTES) as u64))?;
        // Limit the read to just the block specified.
        self.fd.read_exact(&mut buf[..BLOCK_SIZE_BYTES])
    }

    /// This method truncates writes that exceed the total block size.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;
        self.fd
            .seek(SeekFrom::Start((blocknr * BLOCK_SIZE_BYTES) as u64))?;

        let max = BLOCK_SIZE_BYTES.min(buf.len());
        self.fd.write_all(&buf[0..max])
    }

    fn write_at(
        &mut self,
        blocknr: BlockNumber,
        offset: usize,
        buf: &[u8],
    ) -> std::io::Result<()> {
        self.check_range(blocknr)?;
        if offset + buf.len() > BLOCK_SIZE_BYTES {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "write crosses the end of the block",
            ));
        }
        self.fd.seek(SeekFrom::Start(
            (blocknr * BLOCK_SIZE_BYTES + offset) as u64,
        ))?;
        self.fd.write_all(buf)
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }

    /// Flushes the image in one sequential pass rather than block by block.
    fn write_image(&mut self, image: &[u8]) -> std::io::Result<()> {
        if image.len() != self.block_count * BLOCK_SIZE_BYTES {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "image does not match device size",
            ));
        }
        self.fd.seek(SeekFrom::Start(0))?;
        self.fd.write_all(image)
    }

    #[cfg(unix)]
    fn owner(&self) -> std::io::Result<u32> {
        use std::os::unix::fs::MetadataExt;
        Ok(self.fd.metadata()?.uid())
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    block_count: usize,
    clear_medium: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            // A better default here might be the size of the file rounded down
            // to the nearest block.
            block_count: 0,
            clear_medium: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the number of desired blocks in the block store device.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Whether the builder zeroes the medium. When false, existing contents are kept and
    /// a short file is only extended with zeros up to the device size.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    /// This builder assumed ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally, ownership
    /// of the file is transfered to the emulator meaning this builder can only
    /// be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        if self.block_count == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block device needs at least one block",
            ));
        }
        if self.clear_medium {
            self.zero_block()?;
        } else {
            self.extend()?;
        }
        Ok(FileBlockEmulator {
            fd: self.fd,
            block_count: self.block_count,
        })
    }

    fn zero_block(&mut self) -> std::io::Result<()> {
        self.fd.seek(SeekFrom::Start(0))?;
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the "disk" block, buffering each write to prevent excessive reads.
        for _ in 0..self.block_count {
            bfd.write_all(vec![0x00; BLOCK_SIZE_BYTES].as_slice())?;
        }
        bfd.flush()
    }

    fn extend(&mut self) -> std::io::Result<()> {
        let want = (self.block_count * BLOCK_SIZE_BYTES) as u64;
        if self.fd.metadata()?.len() < want {
            self.fd.set_len(want)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_emulator_allocates_correct_num_bytes() {
        let fs_block = tempfile::tempfile().unwrap();
        let mut disk_emu = FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(4)
            .build()
            .expect("failed to allocate file block");
        disk_emu.sync_disk().unwrap();
        assert_eq!(disk_emu.into_file().metadata().unwrap().len(), 4 * 4096);
    }

    #[test]
    fn can_read_and_write_blocks() {
        let fs_block = tempfile::tempfile().unwrap();
        let mut disk_emu = FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(4)
            .build()
            .expect("failed to allocate file block");

        // Allocate a block with a non-zero character.
        let block = vec![0x55; 4096];
        disk_emu.write_block(2, &block).unwrap();
        disk_emu.sync_disk().unwrap();

        let mut read_block = vec![0x00; 4096];
        // Read a different block.
        disk_emu.read_block(3, read_block.as_mut_slice()).unwrap();
        assert_eq!(read_block, vec![0x00; 4096]);

        // Read the block with data.
        let mut filled_block = vec![0x00; 4096];
        disk_emu.read_block(2, filled_block.as_mut_slice()).unwrap();
        assert_eq!(filled_block, vec![0x55; 4096]);
    }

    #[test]
    fn read_block_beyond_range_errors() {
        let fs_block = tempfile::tempfile().unwrap();
        let mut disk_emu = FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(1)
            .build()
            .expect("failed to allocate file block");

        let mut block = vec![0x55; 4096];
        assert!(disk_emu.read_block(1, &mut block).is_err());
        assert!(disk_emu.write_block(1, &block).is_err());
    }

    #[test]
    fn write_at_touches_only_the_given_range() {
        let fs_block = tempfile::tempfile().unwrap();
        let mut disk_emu = FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(2)
            .build()
            .unwrap();

        disk_emu.write_at(1, 10, b"hi").unwrap();

        let mut block = vec![0xFF; 4096];
        disk_emu.read_block(1, &mut block).unwrap();
        assert_eq!(&block[10..12], b"hi");
        assert_eq!(block[9], 0);
        assert_eq!(block[12], 0);
    }

    #[test]
    fn write_at_crossing_block_end_errors() {
        let fs_block = tempfile::tempfile().unwrap();
        let mut disk_emu = FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(2)
            .build()
            .unwrap();
        assert!(disk_emu.write_at(0, 4095, b"ab").is_err());
    }

    #[test]
    fn keeping_medium_preserves_contents_and_extends() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        disk.reopen().unwrap().write_all(b"hello").unwrap();

        let mut disk_emu = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(2)
            .clear_medium(false)
            .build()
            .unwrap();

        let mut image = vec![0; 2 * 4096];
        disk_emu.read_image(&mut image).unwrap();
        assert_eq!(&image[0..5], b"hello");
        assert_eq!(disk_emu.into_file().metadata().unwrap().len(), 2 * 4096);
    }

    #[test]
    fn image_round_trips_through_device() {
        let fs_block = tempfile::tempfile().unwrap();
        let mut disk_emu = FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(3)
            .build()
            .unwrap();

        let image: Vec<u8> = (0..3 * 4096).map(|i| (i % 251) as u8).collect();
        disk_emu.write_image(&image).unwrap();

        let mut read_back = vec![0; 3 * 4096];
        disk_emu.read_image(&mut read_back).unwrap();
        assert_eq!(read_back, image);
        assert!(disk_emu.write_image(&image[..4096]).is_err());
    }

    #[test]
    fn zero_blocks_is_rejected() {
        let fs_block = tempfile::tempfile().unwrap();
        assert!(FileBlockEmulatorBuilder::from(fs_block).build().is_err());
    }
}
