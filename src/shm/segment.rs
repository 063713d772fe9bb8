//! Named shared memory segments
//!
//! POSIX shared memory objects mapped read-write. A fixed header at the
//! start of every segment carries the allocator state and a small
//! directory of named objects, so any attached process can find the
//! records other processes placed there.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::io;
use std::mem;

pub(super) const SEGMENT_MAGIC: u32 = 0x4856_4653;

/// Slots in the named object directory
pub(super) const DIR_CAPACITY: usize = 8;

/// Bytes per directory entry name, including the terminating zero
pub(super) const DIR_NAME_LEN: usize = 24;

#[repr(C)]
pub(super) struct DirEntry {
    pub name: [u8; DIR_NAME_LEN],
    pub offset: u32,
}

#[repr(C)]
pub(super) struct Header {
    pub magic: u32,
    pub size: u32,
    pub bump: u32,
    pub free_head: u32,
    pub dir: [DirEntry; DIR_CAPACITY],
}

/// A named shared memory segment mapped into this process.
///
/// The mapping is released on drop; the named object itself persists
/// until [`SharedSegment::unlink`] removes it.
pub struct SharedSegment {
    name: String,
    base: *mut u8,
    size: usize,
}

// The raw base pointer is only dereferenced through the accessor
// methods, which all operate on plain-old-data records. Cross-process
// consistency is the caller's job (the instance mutex).
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Open the named segment, creating and initializing it if it does
    /// not exist yet. Returns whether this call created it.
    pub fn create_or_open(name: &str, size: usize) -> Result<(Self, bool)> {
        let posix = posix_name(name)?;

        loop {
            let fd = unsafe {
                libc::shm_open(
                    posix.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    0o600 as libc::c_uint,
                )
            };

            if fd >= 0 {
                if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
                    let err = io::Error::last_os_error();
                    unsafe {
                        libc::close(fd);
                        libc::shm_unlink(posix.as_ptr());
                    }
                    return Err(Error::Io(err));
                }
                let segment = Self::map(name.to_string(), fd, size)?;
                segment.init_header();
                return Ok((segment, true));
            }

            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(Error::Io(err));
            }

            match Self::open(name) {
                Ok(segment) => return Ok((segment, false)),
                // Lost a race against a concurrent unlink; try creating again.
                Err(Error::SegmentNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Open an existing named segment; fails with `SegmentNotFound` if
    /// no such object exists.
    pub fn open(name: &str) -> Result<Self> {
        let posix = posix_name(name)?;

        let fd = unsafe { libc::shm_open(posix.as_ptr(), libc::O_RDWR, 0o600 as libc::c_uint) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Err(Error::SegmentNotFound(name.to_string()));
            }
            return Err(Error::Io(err));
        }

        let mut stat = mem::MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Io(err));
        }
        let size = unsafe { stat.assume_init() }.st_size as usize;

        let segment = Self::map(name.to_string(), fd, size)?;
        if segment.header().magic != SEGMENT_MAGIC {
            return Err(Error::Internal(format!(
                "segment {} is not a hookvfs segment",
                name
            )));
        }
        Ok(segment)
    }

    /// Remove the named object from the system namespace. Existing
    /// mappings stay valid until their holders drop them.
    pub fn unlink(name: &str) -> Result<()> {
        let posix = posix_name(name)?;
        if unsafe { libc::shm_unlink(posix.as_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(Error::Io(err));
            }
        }
        Ok(())
    }

    fn map(name: String, fd: libc::c_int, size: usize) -> Result<Self> {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };

        if base == libc::MAP_FAILED {
            return Err(Error::Io(err));
        }

        Ok(SharedSegment {
            name,
            base: base as *mut u8,
            size,
        })
    }

    fn init_header(&self) {
        let bump = align4(mem::size_of::<Header>()) as u32;
        let header = self.header_mut();
        header.magic = SEGMENT_MAGIC;
        header.size = self.size as u32;
        header.bump = bump;
        header.free_head = 0;
        for entry in header.dir.iter_mut() {
            entry.name = [0; DIR_NAME_LEN];
            entry.offset = 0;
        }
    }

    pub(super) fn header(&self) -> &Header {
        unsafe { &*(self.base as *const Header) }
    }

    #[allow(clippy::mut_from_ref)]
    pub(super) fn header_mut(&self) -> &mut Header {
        unsafe { &mut *(self.base as *mut Header) }
    }

    pub(super) fn base(&self) -> *mut u8 {
        self.base
    }

    /// Logical (unsanitized) segment name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Find an object registered in the segment directory
    pub fn find_named(&self, name: &str) -> Option<u32> {
        let header = self.header();
        for entry in header.dir.iter() {
            if entry.offset != 0 && dir_name_matches(&entry.name, name) {
                return Some(entry.offset);
            }
        }
        None
    }

    /// Register an object in the segment directory
    pub fn insert_named(&self, name: &str, offset: u32) -> Result<()> {
        if name.len() >= DIR_NAME_LEN {
            return Err(Error::Internal(format!("object name too long: {}", name)));
        }
        if self.find_named(name).is_some() {
            return Err(Error::Internal(format!("object already registered: {}", name)));
        }

        let header = self.header_mut();
        for entry in header.dir.iter_mut() {
            if entry.offset == 0 {
                entry.name = [0; DIR_NAME_LEN];
                entry.name[..name.len()].copy_from_slice(name.as_bytes());
                entry.offset = offset;
                return Ok(());
            }
        }
        Err(Error::SegmentExhausted(self.name.clone()))
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

fn dir_name_matches(stored: &[u8; DIR_NAME_LEN], name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() >= DIR_NAME_LEN {
        return false;
    }
    &stored[..bytes.len()] == bytes && stored[bytes.len()] == 0
}

pub(super) fn align4(value: usize) -> usize {
    (value + 3) & !3
}

/// Map a logical segment name onto the host namespace: a single leading
/// slash and no interior separators.
fn posix_name(name: &str) -> Result<CString> {
    if name.is_empty() {
        return Err(Error::Config("segment name must not be empty".to_string()));
    }

    let sanitized: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_whitespace() { '-' } else { c })
        .collect();

    CString::new(format!("/{}", sanitized))
        .map_err(|_| Error::Config(format!("segment name contains NUL: {}", name)))
}
