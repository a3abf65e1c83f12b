#[cfg(target_os = "windows")]
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ,
    PAGE_PROTECTION_FLAGS, PAGE_READWRITE, VirtualAlloc, VirtualFree,
    VirtualProtect,
};

/// Page-aligned block of memory which is filled once, then made executable
///
/// The region starts out readable and writable; after
/// [`make_executable`](Mmap::make_executable), it is readable and executable
/// and can no longer be written.
pub struct Mmap {
    /// Pointer to a memory-mapped region, which may be uninitialized
    ptr: *mut std::ffi::c_void,

    /// Total length of the region
    len: usize,

    /// Number of bytes that have been initialized
    written: usize,

    /// Whether the region has been switched to read + execute
    executable: bool,
}

// SAFETY: this is philosophically a `Box<[u8]>`, and is never written after
// it becomes executable, so it can be sent to and shared between threads
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    pub const PAGE_SIZE: usize = 4096;

    /// Builds a new read-write `Mmap` that can hold at least `len` bytes
    #[cfg(not(target_os = "windows"))]
    pub fn new(len: usize) -> Result<Self, std::io::Error> {
        let len = len.max(1).next_multiple_of(Self::PAGE_SIZE);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(Self {
                ptr,
                len,
                written: 0,
                executable: false,
            })
        }
    }

    #[cfg(target_os = "windows")]
    pub fn new(len: usize) -> Result<Self, std::io::Error> {
        let len = len.max(1).next_multiple_of(Self::PAGE_SIZE);

        let ptr = unsafe {
            VirtualAlloc(None, len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };

        if ptr.is_null() {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(Self {
                ptr,
                len,
                written: 0,
                executable: false,
            })
        }
    }

    /// Builds a new `Mmap` holding a copy of `data`
    pub fn from_bytes(data: &[u8]) -> Result<Self, std::io::Error> {
        let mut out = Self::new(data.len())?;
        out.extend(data);
        Ok(out)
    }

    /// Returns the size of the allocation
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns the number of bytes written
    #[cfg(test)]
    pub fn written(&self) -> usize {
        self.written
    }

    /// Appends bytes to the written region
    ///
    /// # Panics
    /// If the region is already executable, or `data` does not fit
    pub fn extend(&mut self, data: &[u8]) {
        assert!(!self.executable, "cannot write to an executable mmap");
        assert!(self.written + data.len() <= self.len, "mmap overflow");
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.ptr as *mut u8).add(self.written),
                data.len(),
            );
        }
        self.written += data.len();
    }

    /// Switches the region from read + write to read + execute
    #[cfg(not(target_os = "windows"))]
    pub fn make_executable(&mut self) -> Result<(), std::io::Error> {
        let r = unsafe {
            libc::mprotect(
                self.ptr,
                self.len,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if r != 0 {
            return Err(std::io::Error::last_os_error());
        }
        self.executable = true;
        Ok(())
    }

    #[cfg(target_os = "windows")]
    pub fn make_executable(&mut self) -> Result<(), std::io::Error> {
        let mut prev = PAGE_PROTECTION_FLAGS::default();
        unsafe {
            VirtualProtect(self.ptr, self.len, PAGE_EXECUTE_READ, &mut prev)
        }
        .map_err(|_| std::io::Error::last_os_error())?;
        self.executable = true;
        Ok(())
    }

    /// Checks whether [`make_executable`](Mmap::make_executable) succeeded
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Treats the memory-mapped data as a slice
    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.ptr as *const u8, self.written)
        }
    }

    /// Returns the inner pointer
    pub fn as_ptr(&self) -> *const std::ffi::c_void {
        self.ptr
    }
}

#[cfg(not(target_os = "windows"))]
impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len as libc::size_t);
        }
    }
}

#[cfg(target_os = "windows")]
impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            let _ = VirtualFree(self.ptr, 0, MEM_RELEASE);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_to_page() {
        let m = Mmap::from_bytes(&[0xC3; 10]).unwrap();
        assert_eq!(m.len(), Mmap::PAGE_SIZE);
        assert_eq!(m.written(), 10);
        assert_eq!(m.as_slice(), &[0xC3; 10]);

        let m = Mmap::new(Mmap::PAGE_SIZE + 1).unwrap();
        assert_eq!(m.len(), 2 * Mmap::PAGE_SIZE);
    }

    #[test]
    fn test_make_executable() {
        let mut m = Mmap::from_bytes(&[0x90, 0xC3]).unwrap();
        assert!(!m.is_executable());
        m.make_executable().unwrap();
        assert!(m.is_executable());
        assert_eq!(m.as_slice(), &[0x90, 0xC3]);
    }

    #[test]
    #[should_panic(expected = "executable")]
    fn test_no_write_after_protect() {
        let mut m = Mmap::from_bytes(&[0xC3]).unwrap();
        m.make_executable().unwrap();
        m.extend(&[0x90]);
    }
}
