//! Sealed memfd allocation and mmap wrappers used by the shared transport region.
//!
//! Two flavors are exposed:
//! - [`SealedMemfd`]: allocates a fresh, seal-capable anonymous file and maps it
//!   read/write. Used by the server side of a transport pair (§4.2, §4.7).
//! - [`AttachedMmap`]: maps an existing file descriptor (received from a peer)
//!   read/write at a given offset/size. Used by the client side on attach.
//!
//! Both own the backing file descriptor for the lifetime of the mapping; the
//! sealed memfd itself survives independently in the kernel until every
//! holder closes its fd, so one peer's destruction never invalidates the
//! other's mapping (§4.2 "Destruction").

use memmap2::MmapMut;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// Seals applied to a freshly created transport memfd: the region may not
/// grow or shrink once sized, so neither peer can invalidate the other's
/// mapping by resizing the backing file.
const TRANSPORT_SEALS: libc::c_int = libc::F_SEAL_SHRINK | libc::F_SEAL_GROW;

/// Common surface both mapping flavors expose to callers that only need a
/// base pointer and a length, regardless of how the mapping was obtained.
pub trait MappedRegion {
    fn base_ptr(&mut self) -> *mut u8;
    fn region_len(&self) -> usize;
}

impl MappedRegion for SealedMemfd {
    fn base_ptr(&mut self) -> *mut u8 {
        self.as_mut_ptr()
    }
    fn region_len(&self) -> usize {
        self.len()
    }
}

impl MappedRegion for AttachedMmap {
    fn base_ptr(&mut self) -> *mut u8 {
        self.as_mut_ptr()
    }
    fn region_len(&self) -> usize {
        self.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MmapError {
    #[error("memfd_create failed")]
    MemfdCreate(#[source] io::Error),
    #[error("failed to size transport region to {size} bytes")]
    Truncate {
        size: u64,
        #[source]
        source: io::Error,
    },
    #[error("failed to seal transport region")]
    Seal(#[source] io::Error),
    #[error("mmap failed")]
    MapFailed(#[source] io::Error),
}

/// A freshly allocated, size-sealed anonymous shared region (server side).
pub struct SealedMemfd {
    file: File,
    mmap: MmapMut,
}

impl SealedMemfd {
    /// Allocates an anonymous memfd of `size_bytes`, seals it against
    /// grow/shrink, and maps it read/write.
    pub fn create(size_bytes: u64) -> Result<Self, MmapError> {
        let fd = create_memfd("transport-region")?;
        // SAFETY: fd was just returned by memfd_create and is owned exclusively here.
        let file = unsafe { File::from_raw_fd(fd.into_raw_fd()) };
        file.set_len(size_bytes)
            .map_err(|source| MmapError::Truncate { size: size_bytes, source })?;

        seal(&file, TRANSPORT_SEALS)?;

        // SAFETY: `file` owns a regular memfd sized above; no other mapping
        // of this region exists yet in this process.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(MmapError::MapFailed)?;

        Ok(Self { file, mmap })
    }

    /// Duplicates the backing file descriptor for transmission to a peer.
    /// The duplicate is independent of this instance's lifetime.
    pub fn dup_fd(&self) -> io::Result<OwnedFd> {
        let raw: RawFd = self.file.as_raw_fd();
        // SAFETY: dup() returns a new fd referring to the same open file
        // description; ownership of the new fd transfers to the OwnedFd.
        let dup = unsafe { libc::dup(raw) };
        if dup < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(dup) })
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

/// A mapping of a peer-supplied memfd at a given offset/size (client side).
pub struct AttachedMmap {
    _file: File,
    mmap: MmapMut,
}

impl AttachedMmap {
    /// Maps `[offset, offset + size)` of `fd` read/write.
    ///
    /// Takes ownership of `fd`; the caller should have already `dup`'d it if
    /// they need to keep their own handle alive.
    pub fn from_fd(fd: OwnedFd, offset: u64, size: u64) -> Result<Self, MmapError> {
        // SAFETY: fd is a valid owned file descriptor handed to us by the caller.
        let file = unsafe { File::from_raw_fd(fd.into_raw_fd()) };

        // SAFETY: the region [offset, offset+size) is assumed valid for this
        // fd; callers validate the area header against `size` after mapping
        // (see transport-shm's attach path, which surfaces PROTOCOL on mismatch).
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .offset(offset)
                .len(size as usize)
                .map_mut(&file)
        }
        .map_err(MmapError::MapFailed)?;

        Ok(Self { _file: file, mmap })
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

fn create_memfd(name: &str) -> Result<OwnedFd, MmapError> {
    let cname = std::ffi::CString::new(name).expect("memfd name has no interior NUL");
    // SAFETY: cname is a valid NUL-terminated C string for the duration of the call.
    let fd = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_ALLOW_SEALING | libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(MmapError::MemfdCreate(io::Error::last_os_error()));
    }
    // SAFETY: fd is a freshly created, valid, owned file descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn seal(file: &File, seals: libc::c_int) -> Result<(), MmapError> {
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_ADD_SEALS, seals) };
    if rc < 0 {
        return Err(MmapError::Seal(io::Error::last_os_error()));
    }
    Ok(())
}
