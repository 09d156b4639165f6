//! Shared-memory regions handed to the compositor

use memmap2::MmapMut;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

/// Anonymous close-on-exec memfd of `size` bytes
pub fn create_memfd(size: usize) -> io::Result<OwnedFd> {
    let name = c"screenrecorder-shm";
    let fd = rustix::fs::memfd_create(name, rustix::fs::MemfdFlags::CLOEXEC)?;
    rustix::fs::ftruncate(&fd, size as u64)?;
    Ok(fd)
}

/// A memfd together with its writable mapping.
///
/// The mapping lives exactly as long as the region: it is established in
/// [`ShmRegion::new`] and released when the region is dropped.
pub struct ShmRegion {
    fd: OwnedFd,
    map: MmapMut,
}

impl ShmRegion {
    pub fn new(size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared-memory region must not be empty",
            ));
        }
        let fd = create_memfd(size)?;
        let map = unsafe { MmapMut::map_mut(&fd)? };
        Ok(Self { fd, map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    #[cfg(test)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

impl AsFd for ShmRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
