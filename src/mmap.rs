//! Memory-mapping facility for the storage layer that sits next to the index.
//!
//! The index itself never maps memory; these helpers give the surrounding engine one place for
//! its mmap, madvise and fadvise calls, with every OS failure surfaced as
//! [`IndexError::Mmap`].

use crate::error::IndexError;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::File;
use std::io;
use std::ops::Deref;

#[derive(Debug)]
enum Mapping {
    /// Private, zero-initialised, read/write.
    Anonymous(MmapMut),
    /// Shared, read-only view of a file prefix.
    File(Mmap),
}

/// A live memory mapping. Dropping it unmaps silently; use [`unmap`] to observe failures.
#[derive(Debug)]
pub struct MappedBuffer {
    mapping: Mapping,
}

fn mmap_error(op: &'static str, source: io::Error) -> IndexError {
    IndexError::Mmap { op, source }
}

/// Maps `len` bytes.
///
/// Without a file the mapping is anonymous, private, zero-initialised and writable. With a file it
/// is a read-only shared mapping of the first `len` bytes, which must exist. `len` must be
/// non-zero.
pub fn map(file: Option<&File>, len: usize) -> Result<MappedBuffer, IndexError> {
    if len == 0 {
        return Err(mmap_error(
            "map",
            io::Error::new(io::ErrorKind::InvalidInput, "cannot map zero bytes"),
        ));
    }

    let mapping = match file {
        None => Mapping::Anonymous(MmapMut::map_anon(len).map_err(|e| mmap_error("map", e))?),
        Some(file) => {
            let file_len = file.metadata().map_err(|e| mmap_error("map", e))?.len();
            if file_len < len as u64 {
                return Err(mmap_error(
                    "map",
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("file has {} bytes, {} requested", file_len, len),
                    ),
                ));
            }
            // SAFETY: the mapping is read-only; callers must not truncate the file while mapped.
            let mmap = unsafe { MmapOptions::new().len(len).map(file) }
                .map_err(|e| mmap_error("map", e))?;
            Mapping::File(mmap)
        }
    };
    Ok(MappedBuffer { mapping })
}

/// Unmaps `buffer`, reporting the OS result.
pub fn unmap(buffer: MappedBuffer) -> Result<(), IndexError> {
    #[cfg(unix)]
    {
        let (ptr, len) = (buffer.as_ptr(), buffer.len());
        // `map` never sets an offset (`map_anon(len)` and `MmapOptions::new().len(len)`), so
        // memmap2 applies no alignment adjustment and `ptr` is the start of the whole region.
        // Mapping at a non-zero offset would break this and leak or double-unmap.
        debug_assert_eq!(ptr as usize % page_size(), 0, "mapping does not start on a page");
        // The region is released below; memmap2 must not unmap it again.
        std::mem::forget(buffer);
        // SAFETY: `ptr`/`len` describe a page-aligned region mapped at offset 0 that nothing else
        // references after the forget above.
        let rc = unsafe { libc::munmap(ptr as *mut libc::c_void, len) };
        if rc != 0 {
            return Err(mmap_error("munmap", io::Error::last_os_error()));
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        drop(buffer);
        Ok(())
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

impl MappedBuffer {
    pub fn len(&self) -> usize {
        match &self.mapping {
            Mapping::Anonymous(m) => m.len(),
            Mapping::File(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.mapping, Mapping::Anonymous(_))
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.mapping {
            Mapping::Anonymous(m) => &m[..],
            Mapping::File(m) => &m[..],
        }
    }

    /// Writable view; `None` for file mappings, which are read-only.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match &mut self.mapping {
            Mapping::Anonymous(m) => Some(&mut m[..]),
            Mapping::File(_) => None,
        }
    }

    /// Hints that the whole mapping will be read soon.
    pub fn will_need(&self) -> Result<(), IndexError> {
        #[cfg(unix)]
        {
            self.advise(libc::MADV_WILLNEED, "madvise(WILLNEED)")
        }
        #[cfg(not(unix))]
        {
            Ok(())
        }
    }

    /// Hints that the pages are no longer needed. Anonymous pages read back as zero afterwards
    /// on Linux.
    pub fn dont_need(&self) -> Result<(), IndexError> {
        #[cfg(unix)]
        {
            self.advise(libc::MADV_DONTNEED, "madvise(DONTNEED)")
        }
        #[cfg(not(unix))]
        {
            Ok(())
        }
    }

    #[cfg(unix)]
    fn advise(&self, advice: libc::c_int, op: &'static str) -> Result<(), IndexError> {
        // SAFETY: the range is exactly this live mapping.
        let rc = unsafe { libc::madvise(self.as_ptr() as *mut libc::c_void, self.len(), advice) };
        if rc != 0 {
            return Err(mmap_error(op, io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Deref for MappedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Advises the kernel that the first `len` bytes of `file` will be read soon.
pub fn fadvise_will_need(file: &File, len: u64) -> Result<(), IndexError> {
    #[cfg(target_os = "linux")]
    {
        fadvise(file, len, libc::POSIX_FADV_WILLNEED, "fadvise(WILLNEED)")
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (file, len);
        Ok(())
    }
}

/// Advises the kernel that the cached pages of the first `len` bytes of `file` can be dropped.
pub fn fadvise_dont_need(file: &File, len: u64) -> Result<(), IndexError> {
    #[cfg(target_os = "linux")]
    {
        fadvise(file, len, libc::POSIX_FADV_DONTNEED, "fadvise(DONTNEED)")
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (file, len);
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn fadvise(file: &File, len: u64, advice: libc::c_int, op: &'static str) -> Result<(), IndexError> {
    use std::os::unix::io::AsRawFd;

    let len = libc::off_t::try_from(len).map_err(|_| {
        mmap_error(
            op,
            io::Error::new(io::ErrorKind::InvalidInput, "length exceeds off_t"),
        )
    })?;
    // posix_fadvise returns the error number instead of setting errno.
    let rc = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, len, advice) };
    if rc != 0 {
        return Err(mmap_error(op, io::Error::from_raw_os_error(rc)));
    }
    Ok(())
}
