use std::io;

/// Random-access byte store the piece manager persists blocks into.
///
/// Creating, sizing and closing the backing store is up to whoever builds the handle.
pub trait Storage {
    /// Write all of `data` starting at `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Read into `buf` starting at `offset`; returns the number of bytes read, which is
    /// short only when the store ends before `buf` is full.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

impl<S: Storage + ?Sized> Storage for &mut S {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_at(offset, data)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_at(offset, data)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }
}

pub mod disk;
pub mod memory;

pub use disk::DiskFile;
pub use memory::MemoryStorage;
