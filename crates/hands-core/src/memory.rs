//! Memory access engine
//!
//! Every operation that touches target memory first walks the live memory
//! map over the requested range. Nothing is cached: mappings can change
//! between two requests.

use crate::address_space::OsAddressSpace;
use crate::fault;
use hands_common::memory::{MemoryRegion, MEM_COMMIT};
use hands_common::{Error, Result};
use tracing::{debug, trace};

/// Operating-system view of the process's own address space.
pub trait AddressSpace: Send + Sync {
    /// Region containing `address`, or `None` if the address cannot be queried.
    fn query(&self, address: usize) -> Option<MemoryRegion>;

    fn allocate(&self, size: usize, allocation_type: u32, protect: u32) -> Result<usize>;

    /// Release an allocation by its base address.
    fn release(&self, address: usize) -> Result<()>;

    /// Apply `protect` to the pages covering the range; returns the previous value.
    fn protect(&self, address: usize, size: usize, protect: u32) -> Result<u32>;
}

/// Read/write/allocate/protect against the current process.
pub struct MemoryEngine<A: AddressSpace = OsAddressSpace> {
    space: A,
}

impl MemoryEngine<OsAddressSpace> {
    pub fn native() -> Self {
        Self::new(OsAddressSpace::new())
    }
}

impl Default for MemoryEngine<OsAddressSpace> {
    fn default() -> Self {
        Self::native()
    }
}

impl<A: AddressSpace> MemoryEngine<A> {
    pub fn new(space: A) -> Self {
        Self { space }
    }

    pub fn address_space(&self) -> &A {
        &self.space
    }

    /// Check that `[address, address + length)` is committed and carries an
    /// accessible protection on every page. A zero length still requires
    /// the region at `address` itself to qualify.
    pub fn validate_range(&self, address: usize, length: usize) -> Result<()> {
        let end = address.checked_add(length).ok_or_else(|| Error::MemoryAccess {
            address,
            message: format!("Range of {} bytes overflows the address space", length),
        })?;

        let mut cursor = address;
        loop {
            let region = self.space.query(cursor).ok_or_else(|| Error::MemoryAccess {
                address: cursor,
                message: "Address cannot be queried".into(),
            })?;

            if !region.is_accessible() {
                return Err(Error::MemoryAccess {
                    address: cursor,
                    message: format!(
                        "Region at {:#x} is {:?} with protection {:#x}",
                        region.base, region.state, region.protect
                    ),
                });
            }

            let next = region.end();
            if next <= cursor {
                return Err(Error::MemoryAccess {
                    address: cursor,
                    message: "Memory map walk made no progress".into(),
                });
            }
            cursor = next;

            if cursor >= end {
                return Ok(());
            }
        }
    }

    pub fn read(&self, address: usize, length: usize) -> Result<Vec<u8>> {
        self.validate_range(address, length)?;

        let mut buffer = vec![0u8; length];
        if length > 0 {
            let destination = buffer.as_mut_ptr() as usize;
            fault::guarded(|| unsafe {
                std::ptr::copy_nonoverlapping(
                    address as *const u8,
                    destination as *mut u8,
                    length,
                )
            })?;
        }
        trace!(target: "hands_core::memory", address = format!("{:#x}", address), length, "Read memory");
        Ok(buffer)
    }

    pub fn write(&self, address: usize, data: &[u8]) -> Result<()> {
        self.validate_range(address, data.len())?;

        if !data.is_empty() {
            let source = data.as_ptr() as usize;
            let length = data.len();
            fault::guarded(|| unsafe {
                std::ptr::copy_nonoverlapping(source as *const u8, address as *mut u8, length)
            })?;
        }
        trace!(target: "hands_core::memory", address = format!("{:#x}", address), length = data.len(), "Wrote memory");
        Ok(())
    }

    /// Allocation failures are reported, never retried.
    pub fn allocate(&self, size: usize, allocation_type: u32, protect: u32) -> Result<usize> {
        let address = self.space.allocate(size, allocation_type, protect)?;
        debug!(
            target: "hands_core::memory",
            address = format!("{:#x}", address),
            size,
            allocation_type = format!("{:#x}", allocation_type),
            protect = format!("{:#x}", protect),
            "Allocated memory"
        );
        Ok(address)
    }

    /// Only addresses inside a committed, accessible region are released.
    pub fn free(&self, address: usize) -> Result<()> {
        self.validate_range(address, 0)?;
        self.space.release(address)?;
        debug!(target: "hands_core::memory", address = format!("{:#x}", address), "Released memory");
        Ok(())
    }

    /// Returns the previous protection.
    pub fn protect(&self, address: usize, size: usize, protect: u32) -> Result<u32> {
        self.validate_range(address, size)?;
        let old = self.space.protect(address, size, protect)?;
        debug!(
            target: "hands_core::memory",
            address = format!("{:#x}", address),
            size,
            old = format!("{:#x}", old),
            new = format!("{:#x}", protect),
            "Changed protection"
        );
        Ok(old)
    }

    /// Protection at `address`; 0 when it has no mapping.
    pub fn query(&self, address: usize) -> u32 {
        self.space
            .query(address)
            .map(|region| region.protect)
            .unwrap_or(0)
    }

    /// Full memory map, lowest address first.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        let mut regions = Vec::new();
        let mut cursor = 0usize;
        while let Some(region) = self.space.query(cursor) {
            let next = region.end();
            regions.push(region);
            if next <= cursor || next == usize::MAX {
                break;
            }
            cursor = next;
        }
        regions
    }

    pub fn committed_regions(&self) -> impl Iterator<Item = MemoryRegion> {
        self.regions()
            .into_iter()
            .filter(|region| region.state == hands_common::memory::MemoryState::Commit)
    }
}

/// Whether the allocation flags request committed pages.
pub fn commits(allocation_type: u32) -> bool {
    allocation_type & MEM_COMMIT != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use hands_common::memory::{
        MemoryState, MemoryType, PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_GUARD, PAGE_NOACCESS,
        PAGE_READONLY, PAGE_READWRITE,
    };
    use parking_lot::Mutex;

    /// Address space described by a fixed list of regions.
    struct FakeSpace {
        regions: Vec<MemoryRegion>,
        released: Mutex<Vec<usize>>,
    }

    impl FakeSpace {
        fn new(layout: &[(usize, usize, MemoryState, u32)]) -> Self {
            let regions = layout
                .iter()
                .map(|&(base, size, state, protect)| MemoryRegion {
                    base,
                    size,
                    protect,
                    state,
                    region_type: MemoryType::Private,
                })
                .collect();
            Self {
                regions,
                released: Mutex::new(Vec::new()),
            }
        }
    }

    impl AddressSpace for FakeSpace {
        fn query(&self, address: usize) -> Option<MemoryRegion> {
            self.regions.iter().find(|r| r.contains(address)).cloned()
        }

        fn allocate(&self, _size: usize, _allocation_type: u32, _protect: u32) -> Result<usize> {
            Err(Error::ResourceExhausted("fake space is full".into()))
        }

        fn release(&self, address: usize) -> Result<()> {
            self.released.lock().push(address);
            Ok(())
        }

        fn protect(&self, address: usize, _size: usize, _protect: u32) -> Result<u32> {
            Ok(self.query(address).map(|r| r.protect).unwrap_or(0))
        }
    }

    const PAGE: usize = 0x1000;

    fn engine() -> MemoryEngine<FakeSpace> {
        use MemoryState::*;
        MemoryEngine::new(FakeSpace::new(&[
            (0x0000, 0x10 * PAGE, Free, 0),
            (0x10000, PAGE, Commit, PAGE_READWRITE),
            (0x11000, 2 * PAGE, Commit, PAGE_READONLY),
            (0x13000, PAGE, Commit, PAGE_EXECUTE_READ),
            (0x14000, PAGE, Commit, PAGE_NOACCESS),
            (0x15000, PAGE, Commit, PAGE_READWRITE | PAGE_GUARD),
            (0x16000, PAGE, Reserve, PAGE_NOACCESS),
            (0x17000, PAGE, Commit, PAGE_EXECUTE),
            (0x18000, PAGE, Commit, PAGE_READWRITE),
        ]))
    }

    #[test]
    fn test_validate_single_region() {
        let engine = engine();
        assert!(engine.validate_range(0x10000, PAGE).is_ok());
        assert!(engine.validate_range(0x10010, 16).is_ok());
    }

    #[test]
    fn test_validate_spans_contiguous_regions() {
        let engine = engine();
        // read-write, read-only (two pages), execute-read
        assert!(engine.validate_range(0x10800, 0x3000).is_ok());
        assert!(engine.validate_range(0x10000, 4 * PAGE).is_ok());
    }

    #[test]
    fn test_validate_rejects_disallowed_protection() {
        let engine = engine();
        assert!(engine.validate_range(0x14000, 1).is_err());
        assert!(engine.validate_range(0x15000, 1).is_err());
        assert!(engine.validate_range(0x17000, 1).is_err());
    }

    #[test]
    fn test_validate_rejects_range_reaching_bad_page() {
        let engine = engine();
        // Starts fine, runs one byte into the no-access page.
        assert!(engine.validate_range(0x13000, PAGE + 1).is_err());
        // Ends exactly at its boundary.
        assert!(engine.validate_range(0x13000, PAGE).is_ok());
    }

    #[test]
    fn test_validate_rejects_uncommitted() {
        let engine = engine();
        assert!(engine.validate_range(0x16000, 8).is_err());
        assert!(engine.validate_range(0x100, 8).is_err());
        // Past the end of the known map.
        assert!(engine.validate_range(0x19000, 8).is_err());
        assert!(engine.validate_range(0x18800, PAGE).is_err());
    }

    #[test]
    fn test_validate_zero_length_checks_address() {
        let engine = engine();
        assert!(engine.validate_range(0x10000, 0).is_ok());
        assert!(engine.validate_range(0, 0).is_err());
        assert!(engine.validate_range(0x14000, 0).is_err());
    }

    #[test]
    fn test_validate_rejects_overflow() {
        let engine = engine();
        assert!(engine.validate_range(usize::MAX - 4, 16).is_err());
    }

    #[test]
    fn test_free_validates_first() {
        let engine = engine();
        assert!(engine.free(0x16000).is_err());
        assert!(engine.free(0x10000).is_ok());
        assert_eq!(*engine.address_space().released.lock(), vec![0x10000]);
    }

    #[test]
    fn test_query_sentinel() {
        let engine = engine();
        assert_eq!(engine.query(0x11000), PAGE_READONLY);
        assert_eq!(engine.query(0x100000), 0);
    }

    #[test]
    fn test_protect_validates_range() {
        let engine = engine();
        assert_eq!(
            engine.protect(0x10000, PAGE, PAGE_READONLY).unwrap(),
            PAGE_READWRITE
        );
        assert!(engine.protect(0x14000, PAGE, PAGE_READWRITE).is_err());
    }

    #[test]
    fn test_allocate_failure_is_reported() {
        let engine = engine();
        assert!(matches!(
            engine.allocate(PAGE, MEM_COMMIT, PAGE_READWRITE),
            Err(Error::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_regions_walks_whole_map() {
        let engine = engine();
        let regions = engine.regions();
        assert_eq!(regions.len(), 9);
        assert_eq!(regions[0].base, 0);
        assert_eq!(regions.last().map(|r| r.base), Some(0x18000));
        assert_eq!(engine.committed_regions().count(), 7);
    }

    #[test]
    fn test_commits_flag() {
        assert!(commits(MEM_COMMIT));
        assert!(commits(MEM_COMMIT | hands_common::memory::MEM_RESERVE));
        assert!(!commits(hands_common::memory::MEM_RESERVE));
    }
}
