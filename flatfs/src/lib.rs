//! A small persistent file store: a flat namespace of paths mapped onto a 1 MiB image of
//! 4 KiB blocks, with a bitmap block allocator and a fixed inode table.
#[macro_use]
extern crate log;

mod alloc;
mod blocks;
mod dir;
mod fs;
pub mod io;
mod node;
mod sb;

pub use crate::alloc::{BitVector, State};
pub use crate::blocks::BlockStore;
pub use crate::dir::{Directory, MAX_ENTRIES, MAX_NAME_LEN};
pub use crate::fs::{FsError, Stat, StorageEngine, BLOCK_COUNT, BLOCK_SIZE, INODE_COUNT, ROOT_INUM};
pub use crate::node::{Inode, InodeTable, S_IFDIR, S_IFMT, S_IFREG};
pub use crate::sb::SuperBlock;
