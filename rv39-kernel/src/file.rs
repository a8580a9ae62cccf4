//! Interfaces the process layer needs from the file system, which lives outside this crate.
//! Both are reference counted by their implementation: `dup` takes a reference, `close`/`put` drops one.

use crate::error::KernelResult;

pub trait OpenFile: Sync {
    /// Reads up to `buffer.len()` bytes at `offset`, returning how many were read (0 at end of file)
    /// # Errors
    /// Whatever the file system reports
    fn read_at(&self, buffer: &mut [u8], offset: usize) -> KernelResult<usize>;

    fn dup(&self);

    fn close(&self);
}

pub trait WorkingDir: Sync {
    fn dup(&self);

    fn put(&self);
}

pub type FileRef = &'static dyn OpenFile;
pub type DirRef = &'static dyn WorkingDir;
