use log::trace;
use shadow::Shadow;

use crate::region::Region;

pub type Result<T> = std::result::Result<T, Error>;

/// The access class that faulted, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
            Access::Execute => write!(f, "execute"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No region contains the address.
    #[error("{access} of unmapped address {addr:#010x}")]
    NotMapped { addr: u32, access: Access },

    /// A region contains the address but its attributes forbid the access.
    #[error("{access} of protected address {addr:#010x}")]
    ProtectionViolation { addr: u32, access: Access },

    /// A new region would overlap one already installed.
    #[error("region {base:#010x}+{size:#x} overlaps an existing region")]
    RegionOverlap { base: u32, size: u32 },

    /// Removal or lookup by base of a region that is not installed.
    #[error("no region at {addr:#010x}")]
    NoSuchRegion { addr: u32 },

    /// The mmap arena is exhausted.
    #[error("out of guest address space ({size:#x} bytes requested)")]
    OutOfAddressSpace { size: u32 },
}

pub const PAGE_SIZE: u32 = 4096;

/// Bottom of the arena handed out to `mmap` and shared buffers.
const VM_LOW: u32 = 0x3000_0000;
/// Top of the arena (exclusive).
const VM_HIGH: u32 = 0x4000_0000;

pub fn round_up_to_page(size: u32) -> u32 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// First-fit free-list allocator for the mmap arena. Ranges released by
/// `munmap`/`shbuf_release` become reusable and coalesce with neighbours.
struct VmAllocator {
    /// Disjoint free ranges `(base, size)`, sorted by base.
    free: Vec<(u32, u32)>,
}

impl VmAllocator {
    fn new() -> Self {
        Self {
            free: vec![(VM_LOW, VM_HIGH - VM_LOW)],
        }
    }

    fn allocate(&mut self, size: u32, alignment: u32) -> Option<u32> {
        let alignment = alignment.max(PAGE_SIZE);
        for i in 0..self.free.len() {
            let (base, len) = self.free[i];
            let aligned = base.checked_add(alignment - 1)? & !(alignment - 1);
            let pad = aligned - base;
            if len < pad || len - pad < size {
                continue;
            }
            self.free.remove(i);
            if pad > 0 {
                self.free.insert(i, (base, pad));
            }
            let tail = len - pad - size;
            if tail > 0 {
                let at = self.free.partition_point(|&(b, _)| b < aligned + size);
                self.free.insert(at, (aligned + size, tail));
            }
            return Some(aligned);
        }
        None
    }

    fn release(&mut self, base: u32, size: u32) {
        let at = self.free.partition_point(|&(b, _)| b < base);
        self.free.insert(at, (base, size));
        // Coalesce with the right then the left neighbour.
        if at + 1 < self.free.len() && self.free[at].0 + self.free[at].1 == self.free[at + 1].0 {
            self.free[at].1 += self.free[at + 1].1;
            self.free.remove(at + 1);
        }
        if at > 0 && self.free[at - 1].0 + self.free[at - 1].1 == self.free[at].0 {
            self.free[at - 1].1 += self.free[at].1;
            self.free.remove(at);
        }
    }
}

/// Owner of every guest memory region. All typed access, instruction fetch
/// and guest↔host copies go through here so the shadow state stays coherent.
pub struct Mmu {
    /// Regions sorted by base address; lookup is a binary search. Region
    /// counts stay in the tens, so this beats anything fancier.
    regions: Vec<Region>,
    tls_region: Option<Region>,
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            tls_region: None,
        }
    }

    pub fn add_region(&mut self, region: Region) -> Result<()> {
        let at = self
            .regions
            .partition_point(|r| r.base() < region.base());
        let overlaps_prev = at > 0 && self.regions[at - 1].end() > region.base();
        let overlaps_next = at < self.regions.len() && region.end() > self.regions[at].base();
        if overlaps_prev || overlaps_next {
            return Err(Error::RegionOverlap {
                base: region.base(),
                size: region.size(),
            });
        }
        trace!("mmu: install {region:?}");
        self.regions.insert(at, region);
        Ok(())
    }

    /// Remove the region whose base is exactly `base`, returning it.
    pub fn remove_region(&mut self, base: u32) -> Result<Region> {
        let at = self
            .regions
            .binary_search_by_key(&base, Region::base)
            .map_err(|_| Error::NoSuchRegion { addr: base })?;
        let region = self.regions.remove(at);
        trace!("mmu: remove {region:?}");
        Ok(region)
    }

    pub fn find_region(&self, addr: u32) -> Option<&Region> {
        if let Some(tls) = &self.tls_region {
            if tls.contains(addr) {
                return Some(tls);
            }
        }
        let at = self.regions.partition_point(|r| r.base() <= addr);
        at.checked_sub(1)
            .map(|i| &self.regions[i])
            .filter(|r| r.contains(addr))
    }

    pub fn find_region_mut(&mut self, addr: u32) -> Option<&mut Region> {
        if self.tls_region.as_ref().is_some_and(|tls| tls.contains(addr)) {
            return self.tls_region.as_mut();
        }
        let at = self.regions.partition_point(|r| r.base() <= addr);
        at.checked_sub(1)
            .map(move |i| &mut self.regions[i])
            .filter(|r| r.contains(addr))
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn set_tls_region(&mut self, region: Region) {
        self.tls_region = Some(region);
    }

    pub fn tls_region(&self) -> Option<&Region> {
        self.tls_region.as_ref()
    }

    pub fn shbuf_region(&self, shbuf_id: i32) -> Option<&Region> {
        self.regions.iter().find(|r| r.shbuf_id() == Some(shbuf_id))
    }

    pub fn shbuf_region_mut(&mut self, shbuf_id: i32) -> Option<&mut Region> {
        self.regions
            .iter_mut()
            .find(|r| r.shbuf_id() == Some(shbuf_id))
    }

    /// Locate the region for a typed access of `width` bytes, verifying the
    /// access does not straddle a region boundary.
    fn region_for(&self, addr: u32, width: u32, access: Access) -> Result<&Region> {
        let region = self
            .find_region(addr)
            .ok_or(Error::NotMapped { addr, access })?;
        if addr - region.base() + width > region.size() {
            // The tail bytes fall outside; typed accesses never span regions.
            return Err(Error::NotMapped {
                addr: region.end(),
                access,
            });
        }
        let permitted = match access {
            Access::Read => region.readable,
            Access::Write => region.writable,
            Access::Execute => region.executable,
        };
        if !permitted {
            return Err(Error::ProtectionViolation { addr, access });
        }
        Ok(region)
    }

    fn region_for_mut(&mut self, addr: u32, width: u32, access: Access) -> Result<&mut Region> {
        // Validate through the shared path, then reborrow mutably.
        self.region_for(addr, width, access)?;
        Ok(self.find_region_mut(addr).unwrap())
    }

    pub fn read8(&self, addr: u32) -> Result<Shadow<u8>> {
        let region = self.region_for(addr, 1, Access::Read)?;
        Ok(region.read8(addr - region.base()))
    }

    pub fn read16(&self, addr: u32) -> Result<Shadow<u16>> {
        let region = self.region_for(addr, 2, Access::Read)?;
        Ok(region.read16(addr - region.base()))
    }

    pub fn read32(&self, addr: u32) -> Result<Shadow<u32>> {
        let region = self.region_for(addr, 4, Access::Read)?;
        Ok(region.read32(addr - region.base()))
    }

    /// Instruction fetch; requires the executable attribute instead of
    /// readability.
    pub fn fetch8(&self, addr: u32) -> Result<Shadow<u8>> {
        let region = self.region_for(addr, 1, Access::Execute)?;
        Ok(region.read8(addr - region.base()))
    }

    pub fn write8(&mut self, addr: u32, value: Shadow<u8>) -> Result<()> {
        let region = self.region_for_mut(addr, 1, Access::Write)?;
        region.write8(addr - region.base(), value);
        Ok(())
    }

    pub fn write16(&mut self, addr: u32, value: Shadow<u16>) -> Result<()> {
        let region = self.region_for_mut(addr, 2, Access::Write)?;
        region.write16(addr - region.base(), value);
        Ok(())
    }

    pub fn write32(&mut self, addr: u32, value: Shadow<u32>) -> Result<()> {
        let region = self.region_for_mut(addr, 4, Access::Write)?;
        region.write32(addr - region.base(), value);
        Ok(())
    }

    /// Copy guest memory into a host buffer. The span may cross region
    /// boundaries as long as every byte is mapped and readable.
    pub fn copy_from_vm(&self, buf: &mut [u8], addr: u32) -> Result<()> {
        let mut copied = 0usize;
        let mut addr = addr;
        while copied < buf.len() {
            let region = self.find_region(addr).ok_or(Error::NotMapped {
                addr,
                access: Access::Read,
            })?;
            if !region.readable {
                return Err(Error::ProtectionViolation {
                    addr,
                    access: Access::Read,
                });
            }
            let offset = (addr - region.base()) as usize;
            let n = (buf.len() - copied).min(region.size() as usize - offset);
            buf[copied..copied + n].copy_from_slice(&region.data()[offset..offset + n]);
            copied += n;
            addr = addr.wrapping_add(n as u32);
        }
        Ok(())
    }

    /// Copy a host buffer into guest memory, marking the destination bytes
    /// initialized. The span may cross region boundaries.
    pub fn copy_to_vm(&mut self, addr: u32, buf: &[u8]) -> Result<()> {
        let mut copied = 0usize;
        let mut addr = addr;
        while copied < buf.len() {
            let region = self.find_region_mut(addr).ok_or(Error::NotMapped {
                addr,
                access: Access::Write,
            })?;
            if !region.writable {
                return Err(Error::ProtectionViolation {
                    addr,
                    access: Access::Write,
                });
            }
            let offset = (addr - region.base()) as usize;
            let n = (buf.len() - copied).min(region.size() as usize - offset);
            region.data_mut()[offset..offset + n].copy_from_slice(&buf[copied..copied + n]);
            region.shadow_mut()[offset..offset + n].fill(1);
            copied += n;
            addr = addr.wrapping_add(n as u32);
        }
        Ok(())
    }

    /// Convenience wrapper returning an owned host copy of guest memory.
    pub fn copy_buffer_from_vm(&self, addr: u32, len: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.copy_from_vm(&mut buf, addr)?;
        Ok(buf)
    }

    /// Read a NUL-terminated guest string of at most `max` bytes.
    pub fn read_cstring_from_vm(&self, addr: u32, max: u32) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for i in 0..max {
            let byte = self.read8(addr.wrapping_add(i))?.value();
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        Ok(bytes)
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

/// The mmap arena allocator lives beside the MMU rather than inside it so
/// that region install/remove stays independent of placement policy.
pub struct VmArena {
    allocator: VmAllocator,
}

impl VmArena {
    pub fn new() -> Self {
        Self {
            allocator: VmAllocator::new(),
        }
    }

    pub fn allocate(&mut self, size: u32, alignment: u32) -> Result<u32> {
        self.allocator
            .allocate(size, alignment)
            .ok_or(Error::OutOfAddressSpace { size })
    }

    pub fn release(&mut self, base: u32, size: u32) {
        self.allocator.release(base, size);
    }
}

impl Default for VmArena {
    fn default() -> Self {
        Self::new()
    }
}
