//! Named shared-memory segments.
//!
//! A segment is a fixed-size file under `/dev/shm`, memory-mapped into every
//! process that opens it. Pointers are not portable between address spaces,
//! so objects inside a segment are referenced by byte offset from the
//! segment base and every dereference routes through [`SharedSegment::at`].
//!
//! The first bytes of every segment hold a [`SegmentHeader`]: a magic/version
//! stamp, a bump allocator, and a small directory mapping string keys to
//! offsets so a well-known object (the port header) can be found by name.

mod lock;
mod sync;

pub use lock::{NamedLock, NamedLockGuard};
pub use sync::{IpcCondvar, IpcMutex, IpcMutexGuard};

use std::alloc::Layout;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::{fs, ptr};

use memmap2::{MmapMut, MmapOptions};

use crate::error::PortError;

/// Magic value identifying a valid segment: `"SHMGATE1"`.
const SEGMENT_MAGIC: u64 = u64::from_be_bytes(*b"SHMGATE1");

/// Current segment layout version.
const SEGMENT_VERSION: u32 = 1;

/// Maximum number of named objects per segment.
const DIRECTORY_CAPACITY: usize = 8;

/// Maximum length of a directory key in bytes.
const KEY_CAPACITY: usize = 24;

/// Directory where segment and lock files are created.
///
/// `/dev/shm` where available (a tmpfs, so mappings never touch a disk),
/// falling back to the system temp directory elsewhere.
pub fn segment_dir() -> &'static Path {
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| {
        let shm = PathBuf::from("/dev/shm");
        if shm.is_dir() {
            shm
        } else {
            std::env::temp_dir()
        }
    })
}

/// One named-object directory entry.
#[repr(C)]
struct DirEntry {
    key: [u8; KEY_CAPACITY],
    offset: u64,
    in_use: u32,
    _pad: u32,
}

/// Header at offset 0 of every segment.
///
/// Mutated only while the segment's named lock is held (during port
/// creation), so the plain fields need no further synchronization.
#[repr(C, align(64))]
struct SegmentHeader {
    magic: u64,
    version: u32,
    _pad: u32,
    size: u64,
    alloc_top: u64,
    directory: [DirEntry; DIRECTORY_CAPACITY],
}

/// A named, fixed-size, memory-mapped shared segment.
pub struct SharedSegment {
    _mmap: MmapMut,
    base: *mut u8,
    len: usize,
    name: String,
    path: PathBuf,
}

// Safety: the mapping lives as long as `self`, and every object inside it is
// either atomic or guarded by the in-segment mutex of the structure that
// owns it.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Creates a new segment of `size` bytes.
    ///
    /// Creation is exclusive: if a segment named `name` already exists the
    /// call fails. The whole mapping is zero-filled up front, which both
    /// establishes the initial state of every in-segment object and faults
    /// the pages into physical memory before the first push pays for it.
    pub fn create(name: &str, size: usize) -> Result<Self, PortError> {
        let path = segment_dir().join(name);

        let create = || -> io::Result<MmapMut> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(0o666) // Peers may run under different users
                .open(&path)?;
            file.set_len(size as u64)?;
            unsafe { MmapOptions::new().map_mut(&file) }
        };

        let mut mmap = create().map_err(|source| PortError::SegmentCreate {
            name: name.to_string(),
            source,
        })?;

        let base = mmap.as_mut_ptr();
        unsafe {
            ptr::write_bytes(base, 0, size);

            let header = &mut *(base as *mut SegmentHeader);
            header.magic = SEGMENT_MAGIC;
            header.version = SEGMENT_VERSION;
            header.size = size as u64;
            header.alloc_top = align_up(std::mem::size_of::<SegmentHeader>(), 64) as u64;
        }

        Ok(Self {
            _mmap: mmap,
            base,
            len: size,
            name: name.to_string(),
            path,
        })
    }

    /// Opens an existing segment by name.
    ///
    /// Fails with [`PortError::SegmentOpen`] if the file is missing and with
    /// [`PortError::SegmentCorrupt`] if it exists but does not carry a valid
    /// header (e.g. left behind by an incompatible or interrupted writer).
    pub fn open(name: &str) -> Result<Self, PortError> {
        let path = segment_dir().join(name);

        let open = || -> io::Result<(MmapMut, usize)> {
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let len = file.metadata()?.len() as usize;
            let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
            Ok((mmap, len))
        };

        let (mut mmap, len) = open().map_err(|source| PortError::SegmentOpen {
            name: name.to_string(),
            source,
        })?;

        let base = mmap.as_mut_ptr();
        let valid = len >= std::mem::size_of::<SegmentHeader>() && {
            let header = unsafe { &*(base as *const SegmentHeader) };
            header.magic == SEGMENT_MAGIC
                && header.version == SEGMENT_VERSION
                && header.size == len as u64
        };
        if !valid {
            return Err(PortError::SegmentCorrupt {
                name: name.to_string(),
            });
        }

        Ok(Self {
            _mmap: mmap,
            base,
            len,
            name: name.to_string(),
            path,
        })
    }

    /// Unlinks the segment file `name`. Existing mappings stay usable until
    /// the processes holding them drop their segments.
    pub fn remove(name: &str) -> io::Result<()> {
        fs::remove_file(segment_dir().join(name))
    }

    /// The segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The mapped size in bytes.
    pub fn size(&self) -> usize {
        self.len
    }

    /// Converts a segment offset into an address in this process.
    ///
    /// # Safety
    ///
    /// `offset` must point at a properly aligned, initialized `T` inside the
    /// segment, and the caller must respect the synchronization rules of the
    /// object behind it.
    pub unsafe fn at<T>(&self, offset: u64) -> *mut T {
        debug_assert!(offset as usize + std::mem::size_of::<T>() <= self.len);
        debug_assert_eq!(offset as usize % std::mem::align_of::<T>(), 0);
        self.base.add(offset as usize) as *mut T
    }

    /// Converts an address inside this segment back into an offset.
    pub fn offset_of<T>(&self, ptr: *const T) -> u64 {
        let addr = ptr as usize;
        let base = self.base as usize;
        debug_assert!(addr >= base && addr + std::mem::size_of::<T>() <= base + self.len);
        (addr - base) as u64
    }

    /// Reserves space for one `T` under a directory key, so other processes
    /// can locate it with [`find`](Self::find).
    ///
    /// Only valid while the segment's named lock is held.
    pub fn construct<T>(&self, key: &str) -> Result<u64, PortError> {
        assert!(key.len() <= KEY_CAPACITY, "directory key too long");
        assert!(self.find::<T>(key).is_none(), "directory key already used");

        let offset = self.alloc(Layout::new::<T>())?;

        let header = unsafe { &mut *(self.base as *mut SegmentHeader) };
        let entry = header
            .directory
            .iter_mut()
            .find(|entry| entry.in_use == 0)
            .expect("segment directory full");
        entry.key[..key.len()].copy_from_slice(key.as_bytes());
        entry.offset = offset;
        entry.in_use = 1;

        Ok(offset)
    }

    /// Looks up the offset registered under `key`.
    pub fn find<T>(&self, key: &str) -> Option<u64> {
        let header = unsafe { &*(self.base as *const SegmentHeader) };
        header
            .directory
            .iter()
            .filter(|entry| entry.in_use != 0)
            .find(|entry| {
                let len = entry.key.iter().position(|&b| b == 0).unwrap_or(KEY_CAPACITY);
                &entry.key[..len] == key.as_bytes()
            })
            .map(|entry| entry.offset)
    }

    /// Reserves space for one anonymous `T`.
    pub fn alloc_one<T>(&self) -> Result<u64, PortError> {
        self.alloc(Layout::new::<T>())
    }

    /// Reserves space for an anonymous `[T; count]`.
    pub fn alloc_array<T>(&self, count: usize) -> Result<u64, PortError> {
        let layout = Layout::array::<T>(count).map_err(|_| self.exhausted())?;
        self.alloc(layout)
    }

    /// Bump allocation from the area past the header. Only valid while the
    /// segment's named lock is held.
    fn alloc(&self, layout: Layout) -> Result<u64, PortError> {
        let header = unsafe { &mut *(self.base as *mut SegmentHeader) };
        let offset = align_up(header.alloc_top as usize, layout.align());
        if offset + layout.size() > self.len {
            return Err(self.exhausted());
        }
        header.alloc_top = (offset + layout.size()) as u64;
        Ok(offset as u64)
    }

    fn exhausted(&self) -> PortError {
        PortError::SegmentCreate {
            name: self.name.clone(),
            source: io::Error::new(io::ErrorKind::OutOfMemory, "segment space exhausted"),
        }
    }
}

/// Bytes a fresh segment spends on its own header before the first
/// allocation; used by callers sizing a segment for a known set of objects.
pub(crate) const fn reserved_bytes() -> usize {
    align_up(std::mem::size_of::<SegmentHeader>(), 64)
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
