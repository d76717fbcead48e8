//! Memory-related types
//!
//! Protection and allocation values use the Windows numeric encoding on every
//! platform; the controller speaks this encoding on the wire.

use serde::{Deserialize, Serialize};

pub const PAGE_NOACCESS: u32 = 0x01;
pub const PAGE_READONLY: u32 = 0x02;
pub const PAGE_READWRITE: u32 = 0x04;
pub const PAGE_WRITECOPY: u32 = 0x08;
pub const PAGE_EXECUTE: u32 = 0x10;
pub const PAGE_EXECUTE_READ: u32 = 0x20;
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
pub const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;
pub const PAGE_GUARD: u32 = 0x100;

pub const MEM_COMMIT: u32 = 0x1000;
pub const MEM_RESERVE: u32 = 0x2000;

/// Protection values a range may carry and still be touched by the agent.
/// The comparison is exact: modifier bits such as `PAGE_GUARD` disqualify.
pub const ACCESSIBLE_PROTECTIONS: [u32; 6] = [
    PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE,
    PAGE_EXECUTE_WRITECOPY,
    PAGE_READONLY,
    PAGE_READWRITE,
    PAGE_WRITECOPY,
];

pub fn is_accessible_protection(protect: u32) -> bool {
    ACCESSIBLE_PROTECTIONS.contains(&protect)
}

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    /// Writes produce a private copy of the page.
    #[serde(default)]
    pub copy_on_write: bool,
}

impl Protection {
    pub fn new(read: bool, write: bool, execute: bool) -> Self {
        Self {
            read,
            write,
            execute,
            copy_on_write: false,
        }
    }

    pub fn from_windows(protect: u32) -> Self {
        let base = protect & 0xFF;
        let execute = matches!(
            base,
            PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY
        );
        let read = matches!(
            base,
            PAGE_READONLY
                | PAGE_READWRITE
                | PAGE_WRITECOPY
                | PAGE_EXECUTE_READ
                | PAGE_EXECUTE_READWRITE
                | PAGE_EXECUTE_WRITECOPY
        );
        let write = matches!(
            base,
            PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY
        );
        let copy_on_write = matches!(base, PAGE_WRITECOPY | PAGE_EXECUTE_WRITECOPY);

        Self {
            read,
            write,
            execute,
            copy_on_write,
        }
    }

    /// Closest Windows protection value. Write without read is widened to
    /// read-write since no such page protection exists.
    pub fn to_windows(&self) -> u32 {
        match (self.read || self.write, self.write, self.execute, self.copy_on_write) {
            (false, _, false, _) => PAGE_NOACCESS,
            (false, _, true, _) => PAGE_EXECUTE,
            (true, false, false, _) => PAGE_READONLY,
            (true, false, true, _) => PAGE_EXECUTE_READ,
            (true, true, false, false) => PAGE_READWRITE,
            (true, true, false, true) => PAGE_WRITECOPY,
            (true, true, true, false) => PAGE_EXECUTE_READWRITE,
            (true, true, true, true) => PAGE_EXECUTE_WRITECOPY,
        }
    }
}

/// Memory region information, as reported by the OS at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub base: usize,
    pub size: usize,
    /// Raw protection value (`PAGE_*`), 0 for free regions.
    pub protect: u32,
    pub state: MemoryState,
    pub region_type: MemoryType,
}

impl MemoryRegion {
    pub fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end()
    }

    pub fn protection(&self) -> Protection {
        Protection::from_windows(self.protect)
    }

    pub fn is_accessible(&self) -> bool {
        self.state == MemoryState::Commit && is_accessible_protection(self.protect)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryState {
    Commit,
    Reserve,
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryType {
    Image,
    Mapped,
    Private,
    None,
}
