//! Platform address spaces
//!
//! Windows goes straight to the Virtual* API. Linux reads the memory map
//! from `/proc/self/maps` and maps pages with mmap; since munmap needs a
//! length, it keeps a table of its own allocations and only releases those.

pub use imp::OsAddressSpace;

#[cfg(windows)]
mod imp {
    use crate::memory::AddressSpace;
    use hands_common::memory::{MemoryRegion, MemoryState, MemoryType};
    use hands_common::{Error, Result};
    use std::ffi::c_void;
    use windows::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION,
        MEM_COMMIT, MEM_IMAGE, MEM_MAPPED, MEM_RELEASE, MEM_RESERVE, PAGE_PROTECTION_FLAGS,
        VIRTUAL_ALLOCATION_TYPE,
    };

    #[derive(Debug, Default)]
    pub struct OsAddressSpace;

    impl OsAddressSpace {
        pub fn new() -> Self {
            Self
        }
    }

    fn region_from_mbi(mbi: &MEMORY_BASIC_INFORMATION) -> MemoryRegion {
        let state = if mbi.State == MEM_COMMIT {
            MemoryState::Commit
        } else if mbi.State == MEM_RESERVE {
            MemoryState::Reserve
        } else {
            MemoryState::Free
        };

        let region_type = if mbi.Type.0 & MEM_IMAGE.0 != 0 {
            MemoryType::Image
        } else if mbi.Type.0 & MEM_MAPPED.0 != 0 {
            MemoryType::Mapped
        } else if state == MemoryState::Free {
            MemoryType::None
        } else {
            MemoryType::Private
        };

        MemoryRegion {
            base: mbi.BaseAddress as usize,
            size: mbi.RegionSize,
            protect: mbi.Protect.0,
            state,
            region_type,
        }
    }

    impl AddressSpace for OsAddressSpace {
        fn query(&self, address: usize) -> Option<MemoryRegion> {
            let mut mbi = MEMORY_BASIC_INFORMATION::default();
            let written = unsafe {
                VirtualQuery(
                    Some(address as *const c_void),
                    &mut mbi,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            (written != 0).then(|| region_from_mbi(&mbi))
        }

        fn allocate(&self, size: usize, allocation_type: u32, protect: u32) -> Result<usize> {
            let address = unsafe {
                VirtualAlloc(
                    None,
                    size,
                    VIRTUAL_ALLOCATION_TYPE(allocation_type),
                    PAGE_PROTECTION_FLAGS(protect),
                )
            };
            if address.is_null() {
                return Err(Error::ResourceExhausted(format!(
                    "VirtualAlloc of {} bytes failed: {}",
                    size,
                    std::io::Error::last_os_error()
                )));
            }
            Ok(address as usize)
        }

        fn release(&self, address: usize) -> Result<()> {
            unsafe { VirtualFree(address as *mut c_void, 0, MEM_RELEASE) }.map_err(|e| {
                Error::MemoryAccess {
                    address,
                    message: format!("VirtualFree failed: {}", e),
                }
            })
        }

        fn protect(&self, address: usize, size: usize, protect: u32) -> Result<u32> {
            let mut old = PAGE_PROTECTION_FLAGS::default();
            unsafe {
                VirtualProtect(
                    address as *const c_void,
                    size,
                    PAGE_PROTECTION_FLAGS(protect),
                    &mut old,
                )
            }
            .map_err(|e| Error::MemoryAccess {
                address,
                message: format!("VirtualProtect failed: {}", e),
            })?;
            Ok(old.0)
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    use crate::memory::{commits, AddressSpace};
    use hands_common::memory::{
        MemoryRegion, MemoryState, MemoryType, Protection, MEM_COMMIT, MEM_RESERVE,
        PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
        PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
    };
    use hands_common::{Error, Result};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tracing::warn;

    /// One line of `/proc/self/maps`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct Mapping {
        pub start: usize,
        pub end: usize,
        pub read: bool,
        pub write: bool,
        pub execute: bool,
        pub path: String,
    }

    impl Mapping {
        pub(crate) fn parse(line: &str) -> Option<Self> {
            let mut fields = line.split_whitespace();
            let range = fields.next()?;
            let perms = fields.next()?.as_bytes();
            let path = fields.nth(3).unwrap_or("").to_string();

            let (start, end) = range.split_once('-')?;
            let start = usize::from_str_radix(start, 16).ok()?;
            let end = usize::from_str_radix(end, 16).ok()?;
            if perms.len() < 3 || end <= start {
                return None;
            }

            Some(Self {
                start,
                end,
                read: perms[0] == b'r',
                write: perms[1] == b'w',
                execute: perms[2] == b'x',
                path,
            })
        }

        fn to_region(&self) -> MemoryRegion {
            let protect = Protection::new(self.read, self.write, self.execute).to_windows();
            let state = if protect == PAGE_NOACCESS {
                MemoryState::Reserve
            } else {
                MemoryState::Commit
            };
            let region_type = if self.path.starts_with('/') {
                if self.execute {
                    MemoryType::Image
                } else {
                    MemoryType::Mapped
                }
            } else {
                MemoryType::Private
            };

            MemoryRegion {
                base: self.start,
                size: self.end - self.start,
                protect,
                state,
                region_type,
            }
        }
    }

    /// Region containing `address`, or the free gap around it.
    pub(crate) fn region_at(mappings: &[Mapping], address: usize) -> MemoryRegion {
        let mut gap_start = 0usize;
        for mapping in mappings {
            if address < mapping.start {
                return free_region(gap_start, mapping.start);
            }
            if address < mapping.end {
                return mapping.to_region();
            }
            gap_start = mapping.end;
        }
        free_region(gap_start, usize::MAX)
    }

    fn free_region(start: usize, end: usize) -> MemoryRegion {
        MemoryRegion {
            base: start,
            size: end - start,
            protect: 0,
            state: MemoryState::Free,
            region_type: MemoryType::None,
        }
    }

    fn read_mappings() -> Option<Vec<Mapping>> {
        match std::fs::read_to_string("/proc/self/maps") {
            Ok(content) => Some(content.lines().filter_map(Mapping::parse).collect()),
            Err(e) => {
                warn!(target: "hands_core::memory", error = %e, "Failed to read memory map");
                None
            }
        }
    }

    fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    /// `PROT_*` bits for a `PAGE_*` value; modifiers such as guard pages
    /// have no equivalent and are refused.
    pub(crate) fn prot_flags(protect: u32) -> Option<libc::c_int> {
        let prot = match protect {
            PAGE_NOACCESS => libc::PROT_NONE,
            PAGE_READONLY => libc::PROT_READ,
            PAGE_READWRITE | PAGE_WRITECOPY => libc::PROT_READ | libc::PROT_WRITE,
            PAGE_EXECUTE => libc::PROT_EXEC,
            PAGE_EXECUTE_READ => libc::PROT_READ | libc::PROT_EXEC,
            PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY => {
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
            }
            _ => return None,
        };
        Some(prot)
    }

    #[derive(Debug, Default)]
    pub struct OsAddressSpace {
        /// Base address to mapped length of every live allocation.
        allocations: Mutex<HashMap<usize, usize>>,
    }

    impl OsAddressSpace {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl AddressSpace for OsAddressSpace {
        fn query(&self, address: usize) -> Option<MemoryRegion> {
            let mappings = read_mappings()?;
            Some(region_at(&mappings, address))
        }

        fn allocate(&self, size: usize, allocation_type: u32, protect: u32) -> Result<usize> {
            if size == 0 {
                return Err(Error::MemoryAccess {
                    address: 0,
                    message: "Allocation size must be non-zero".into(),
                });
            }
            if allocation_type & (MEM_COMMIT | MEM_RESERVE) == 0 {
                return Err(Error::MemoryAccess {
                    address: 0,
                    message: format!("Unsupported allocation type {:#x}", allocation_type),
                });
            }
            let prot = prot_flags(protect).ok_or_else(|| Error::MemoryAccess {
                address: 0,
                message: format!("Unsupported protection {:#x}", protect),
            })?;

            let page = page_size();
            let length = size
                .checked_add(page - 1)
                .map(|n| n / page * page)
                .ok_or_else(|| Error::ResourceExhausted(format!("{} bytes", size)))?;

            let (prot, extra) = if commits(allocation_type) {
                (prot, 0)
            } else {
                (libc::PROT_NONE, libc::MAP_NORESERVE)
            };

            let address = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    length,
                    prot,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra,
                    -1,
                    0,
                )
            };
            if address == libc::MAP_FAILED {
                return Err(Error::ResourceExhausted(format!(
                    "mmap of {} bytes failed: {}",
                    length,
                    std::io::Error::last_os_error()
                )));
            }

            let address = address as usize;
            self.allocations.lock().insert(address, length);
            Ok(address)
        }

        fn release(&self, address: usize) -> Result<()> {
            let length = self
                .allocations
                .lock()
                .remove(&address)
                .ok_or_else(|| Error::MemoryAccess {
                    address,
                    message: "Not the base of an agent allocation".into(),
                })?;

            if unsafe { libc::munmap(address as *mut libc::c_void, length) } != 0 {
                let err = std::io::Error::last_os_error();
                self.allocations.lock().insert(address, length);
                return Err(Error::MemoryAccess {
                    address,
                    message: format!("munmap failed: {}", err),
                });
            }
            Ok(())
        }

        fn protect(&self, address: usize, size: usize, protect: u32) -> Result<u32> {
            let prot = prot_flags(protect).ok_or_else(|| Error::MemoryAccess {
                address,
                message: format!("Unsupported protection {:#x}", protect),
            })?;

            let old = self.query(address).map(|r| r.protect).unwrap_or(0);

            let page = page_size();
            let start = address / page * page;
            let end = address
                .checked_add(size.max(1))
                .and_then(|end| end.checked_add(page - 1))
                .map(|end| end / page * page)
                .ok_or_else(|| Error::MemoryAccess {
                    address,
                    message: "Range overflows the address space".into(),
                })?;

            if unsafe { libc::mprotect(start as *mut libc::c_void, end - start, prot) } != 0 {
                return Err(Error::MemoryAccess {
                    address,
                    message: format!("mprotect failed: {}", std::io::Error::last_os_error()),
                });
            }
            Ok(old)
        }
    }

}

#[cfg(not(any(windows, target_os = "linux", target_os = "android")))]
mod imp {
    use crate::memory::AddressSpace;
    use hands_common::memory::MemoryRegion;
    use hands_common::{Error, Result};

    /// Memory map access is not implemented on this platform; every
    /// validation fails and nothing is allocated.
    #[derive(Debug, Default)]
    pub struct OsAddressSpace;

    impl OsAddressSpace {
        pub fn new() -> Self {
            Self
        }
    }

    fn unsupported(address: usize) -> Error {
        Error::MemoryAccess {
            address,
            message: "Memory map access is not supported on this platform".into(),
        }
    }

    impl AddressSpace for OsAddressSpace {
        fn query(&self, _address: usize) -> Option<MemoryRegion> {
            None
        }

        fn allocate(&self, _size: usize, _allocation_type: u32, _protect: u32) -> Result<usize> {
            Err(unsupported(0))
        }

        fn release(&self, address: usize) -> Result<()> {
            Err(unsupported(address))
        }

        fn protect(&self, address: usize, _size: usize, _protect: u32) -> Result<u32> {
            Err(unsupported(address))
        }
    }
}
