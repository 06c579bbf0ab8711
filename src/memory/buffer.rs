//! Page-aligned host buffers backing guest memory.

use crate::error::{Error, Result};

use super::PAGE_SIZE;

/// Host memory that backs a guest-physical region.
///
/// The allocation is page-aligned and zero-initialized. Once a buffer is
/// mapped the backend accesses the same pages, so all access from the
/// harness goes through copying `read`/`write` calls rather than long-lived
/// slices.
pub struct GuestMemory {
    /// Pointer to the allocated memory
    ptr: *mut u8,
    /// Size of the allocation in bytes
    size: usize,
}

// Safety: GuestMemory owns its allocation and only hands out copies of its
// contents, never references into it.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    /// Allocate a new guest memory buffer, rounded up to whole pages.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::MemoryAllocationFailed(
                "Size must be greater than 0".to_string(),
            ));
        }

        let page_size = PAGE_SIZE as usize;
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::MemoryAllocationFailed(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size: aligned_size,
        })
    }

    /// Allocate a buffer and fill it with `byte`.
    pub fn filled(size: usize, byte: u8) -> Result<Self> {
        let mem = Self::new(size)?;
        unsafe {
            std::ptr::write_bytes(mem.ptr, byte, mem.size);
        }
        Ok(mem)
    }

    /// Allocate a buffer holding a copy of `data`; any tail is zeroed.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mem = Self::new(data.len())?;
        mem.write(0, data)?;
        Ok(mem)
    }

    /// Host address of the first byte.
    pub fn host_addr(&self) -> usize {
        self.ptr as usize
    }

    /// Get the size of the buffer in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Read bytes starting at `offset`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;

        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), buf.as_mut_ptr(), buf.len());
        }

        Ok(())
    }

    /// Write bytes starting at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
        }

        Ok(())
    }

    /// Copy the whole buffer out.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr, out.as_mut_ptr(), self.size);
        }
        out
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::InvalidGuestAddress(
                (offset as u64).saturating_add(len as u64),
            )),
        }
    }
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("host_addr", &format_args!("0x{:x}", self.host_addr()))
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}
