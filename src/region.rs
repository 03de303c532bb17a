use shadow::Shadow;

/// Payload distinguishing how a region came to exist and what extra state it
/// carries. The variants correspond to the three region producers: the
/// loader and stack bootstrap (`Simple`), the `mmap` syscall (`Mmap`) and the
/// shared-buffer syscall family (`SharedBuffer`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionKind {
    Simple,
    Mmap {
        prot: u32,
        flags: u32,
        fd: i32,
        offset: u32,
    },
    SharedBuffer {
        shbuf_id: i32,
        sealed: bool,
        volatile: bool,
    },
}

enum Backing {
    Owned(Vec<u8>),
    /// Aliases memory owned by a host mapping (shared buffers). Unmapped on
    /// drop; the emulator is single-threaded so no other access races this.
    Host {
        ptr: *mut u8,
        len: usize,
    },
}

/// A contiguous span of guest virtual memory with one shadow byte per data
/// byte (0 = uninitialized, 1 = initialized).
pub struct Region {
    base: u32,
    size: u32,
    backing: Backing,
    shadow: Vec<u8>,
    kind: RegionKind,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub is_stack: bool,
    pub is_text: bool,
}

impl Region {
    /// A zero-filled, fully uninitialized region, readable and writable.
    pub fn simple(base: u32, size: u32) -> Self {
        debug_assert!(size > 0);
        Self {
            base,
            size,
            backing: Backing::Owned(vec![0; size as usize]),
            shadow: vec![0; size as usize],
            kind: RegionKind::Simple,
            readable: true,
            writable: true,
            executable: false,
            is_stack: false,
            is_text: false,
        }
    }

    pub fn mmap_anonymous(base: u32, size: u32, prot: u32) -> Self {
        let mut region = Self::simple(base, size);
        region.kind = RegionKind::Mmap {
            prot,
            flags: 0,
            fd: -1,
            offset: 0,
        };
        region
    }

    pub fn mmap_file_backed(
        base: u32,
        size: u32,
        prot: u32,
        flags: u32,
        fd: i32,
        offset: u32,
        contents: &[u8],
    ) -> Self {
        let mut region = Self::simple(base, size);
        region.kind = RegionKind::Mmap {
            prot,
            flags,
            fd,
            offset,
        };
        let len = contents.len().min(size as usize);
        region.data_mut()[..len].copy_from_slice(&contents[..len]);
        // File contents are initialized data; the page-rounding tail stays
        // uninitialized.
        region.shadow[..len].fill(1);
        region
    }

    /// A region aliasing a host-visible mapping. The mapping becomes owned by
    /// the region and is unmapped when the region is dropped.
    ///
    /// # Safety
    ///
    /// `host_ptr` must be a mapping of at least `size` bytes that stays valid
    /// until the region is dropped, and nothing else may unmap it.
    pub unsafe fn shared_buffer(base: u32, size: u32, shbuf_id: i32, host_ptr: *mut u8) -> Self {
        Self {
            base,
            size,
            backing: Backing::Host {
                ptr: host_ptr,
                len: size as usize,
            },
            // Shared buffer contents come from another process; treat them as
            // initialized.
            shadow: vec![1; size as usize],
            kind: RegionKind::SharedBuffer {
                shbuf_id,
                sealed: false,
                volatile: false,
            },
            readable: true,
            writable: true,
            executable: false,
            is_stack: false,
            is_text: false,
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// One past the last address in the region.
    pub fn end(&self) -> u32 {
        self.base + self.size
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    pub fn kind(&self) -> &RegionKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut RegionKind {
        &mut self.kind
    }

    pub fn shbuf_id(&self) -> Option<i32> {
        match self.kind {
            RegionKind::SharedBuffer { shbuf_id, .. } => Some(shbuf_id),
            _ => None,
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::Owned(data) => data,
            // SAFETY: construction guarantees the mapping covers `len` bytes
            // and outlives the region.
            Backing::Host { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Owned(data) => data,
            // SAFETY: as above; `&mut self` gives exclusive access.
            Backing::Host { ptr, len } => unsafe { std::slice::from_raw_parts_mut(*ptr, *len) },
        }
    }

    pub fn shadow(&self) -> &[u8] {
        &self.shadow
    }

    pub fn shadow_mut(&mut self) -> &mut [u8] {
        &mut self.shadow
    }

    /// Read one byte at a region-relative offset, expanding the per-byte
    /// shadow state to a per-bit mask.
    pub fn read8(&self, offset: u32) -> Shadow<u8> {
        let i = offset as usize;
        let mask = if self.shadow[i] != 0 { 0xff } else { 0x00 };
        Shadow::with_mask(self.data()[i], mask)
    }

    pub fn read16(&self, offset: u32) -> Shadow<u16> {
        Shadow::<u16>::from_le_parts([self.part(offset), self.part(offset + 1)])
    }

    pub fn read32(&self, offset: u32) -> Shadow<u32> {
        Shadow::<u32>::from_le_parts([
            self.part(offset),
            self.part(offset + 1),
            self.part(offset + 2),
            self.part(offset + 3),
        ])
    }

    fn part(&self, offset: u32) -> (u8, u8) {
        let i = offset as usize;
        let mask = if self.shadow[i] != 0 { 0xff } else { 0x00 };
        (self.data()[i], mask)
    }

    /// Write one byte. The shadow byte becomes initialized only when the
    /// whole incoming bit mask is set; a partially defined byte stays (or
    /// becomes) uninitialized, which is the conservative collapse from
    /// per-bit masks to per-byte memory shadow.
    pub fn write8(&mut self, offset: u32, value: Shadow<u8>) {
        let i = offset as usize;
        self.data_mut()[i] = value.value();
        self.shadow[i] = if value.is_fully_initialized() { 1 } else { 0 };
    }

    pub fn write16(&mut self, offset: u32, value: Shadow<u16>) {
        for (i, (byte, mask)) in value.to_le_parts().into_iter().enumerate() {
            self.write8(offset + i as u32, Shadow::with_mask(byte, mask));
        }
    }

    pub fn write32(&mut self, offset: u32, value: Shadow<u32>) {
        for (i, (byte, mask)) in value.to_le_parts().into_iter().enumerate() {
            self.write8(offset + i as u32, Shadow::with_mask(byte, mask));
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Backing::Host { ptr, len } = self.backing {
            // SAFETY: the region owns this mapping; see `shared_buffer`.
            unsafe {
                libc::munmap(ptr.cast(), len);
            }
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Region {{ {:#010x}..{:#010x} {}{}{}{} {:?} }}",
            self.base,
            self.end(),
            if self.readable { 'r' } else { '-' },
            if self.writable { 'w' } else { '-' },
            if self.executable { 'x' } else { '-' },
            if self.is_stack { 's' } else { '-' },
            self.kind,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_region_is_uninitialized() {
        let region = Region::simple(0x1000, 16);
        assert!(region.read8(0).is_fully_uninitialized());
        assert!(region.read32(4).is_fully_uninitialized());
    }

    #[test]
    fn write_then_read_round_trips_value_and_shadow() {
        let mut region = Region::simple(0x1000, 16);
        region.write32(0, Shadow::initialized(0xdead_beef));
        let back = region.read32(0);
        assert_eq!(back.value(), 0xdead_beef);
        assert!(back.is_fully_initialized());

        region.write32(8, Shadow::uninitialized(0x1111_1111));
        assert!(region.read32(8).is_fully_uninitialized());
        assert_eq!(region.read32(8).value(), 0x1111_1111);
    }

    #[test]
    fn mixed_shadow_expands_per_byte() {
        let mut region = Region::simple(0, 8);
        region.write8(0, Shadow::initialized(0xaa));
        region.write8(1, Shadow::uninitialized(0xbb));
        region.write8(2, Shadow::initialized(0xcc));
        region.write8(3, Shadow::initialized(0xdd));
        let word = region.read32(0);
        assert_eq!(word.value(), 0xddcc_bbaa);
        assert_eq!(word.mask(), 0xffff_00ff);
    }

    #[test]
    fn partially_defined_byte_collapses_to_uninitialized() {
        let mut region = Region::simple(0, 4);
        region.write8(0, Shadow::with_mask(0xf0, 0xf0));
        assert!(region.read8(0).is_fully_uninitialized());
    }

    #[test]
    fn file_backed_mmap_tail_is_uninitialized() {
        let region = Region::mmap_file_backed(0x3000_0000, 0x1000, 0, 0, 3, 0, b"abc");
        assert!(region.read8(0).is_fully_initialized());
        assert_eq!(region.read8(2).value(), b'c');
        assert!(region.read8(3).is_fully_uninitialized());
    }
}
