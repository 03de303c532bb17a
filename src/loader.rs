//! Guest program image parsing and region installation.
//!
//! The image is parsed once into an owned snapshot (entry point, loadable
//! segments, symbol table) which outlives the raw bytes. Loadable segments
//! become simple regions whose file-backed range is shadow-initialized and
//! whose BSS tail stays uninitialized; a TLS segment produces the fixed TCB
//! region plus the 4-byte TLS pointer cell at guest address zero.

use goblin::elf::program_header::{PF_W, PF_X, PT_LOAD, PT_TLS};
use goblin::elf::Elf;
use log::trace;
use shadow::Shadow;

use crate::mmu::Mmu;
use crate::region::Region;

pub type Result<T> = std::result::Result<T, Error>;

/// Fixed guest address of the thread control block built from PT_TLS.
pub const TCB_BASE: u32 = 0x2000_0000;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read program image: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse program image: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("program image is not a 32-bit little-endian executable")]
    NotIa32,

    #[error("segment {vaddr:#x}+{memsz:#x} does not fit the guest address space")]
    BadSegment { vaddr: u64, memsz: u64 },

    #[error("segment file range {offset:#x}+{filesz:#x} lies outside the image")]
    BadFileRange { offset: u64, filesz: u64 },

    #[error("required symbol `{0}` is missing from the image")]
    MissingSymbol(&'static str),

    #[error(transparent)]
    Mmu(#[from] crate::mmu::Error),
}

struct LoadSegment {
    vaddr: u32,
    memsz: u32,
    flags: u32,
    file_bytes: Vec<u8>,
}

struct Symbol {
    name: String,
    start: u32,
    size: u32,
}

/// Immutable snapshot of a parsed guest executable.
pub struct ProgramImage {
    entry: u32,
    segments: Vec<LoadSegment>,
    tls: Option<LoadSegment>,
    /// Function symbols sorted by start address.
    symbols: Vec<Symbol>,
}

impl ProgramImage {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let elf = Elf::parse(bytes)?;
        if elf.is_64 || !elf.little_endian {
            return Err(Error::NotIa32);
        }

        let mut segments = Vec::new();
        let mut tls = None;
        for header in &elf.program_headers {
            if header.p_type != PT_LOAD && header.p_type != PT_TLS {
                continue;
            }
            let vaddr = u32::try_from(header.p_vaddr).map_err(|_| Error::BadSegment {
                vaddr: header.p_vaddr,
                memsz: header.p_memsz,
            })?;
            let memsz = u32::try_from(header.p_memsz)
                .ok()
                .filter(|memsz| vaddr.checked_add(*memsz).is_some())
                .ok_or(Error::BadSegment {
                    vaddr: header.p_vaddr,
                    memsz: header.p_memsz,
                })?;
            let file_range = usize::try_from(header.p_offset)
                .ok()
                .zip(usize::try_from(header.p_filesz).ok())
                .and_then(|(offset, filesz)| {
                    let end = offset.checked_add(filesz)?;
                    bytes.get(offset..end)
                })
                .ok_or(Error::BadFileRange {
                    offset: header.p_offset,
                    filesz: header.p_filesz,
                })?;

            let segment = LoadSegment {
                vaddr,
                memsz,
                flags: header.p_flags,
                file_bytes: file_range.to_vec(),
            };
            if header.p_type == PT_TLS {
                tls = Some(segment);
            } else {
                segments.push(segment);
            }
        }

        let mut symbols: Vec<Symbol> = elf
            .syms
            .iter()
            .filter(|sym| sym.st_value != 0)
            .filter_map(|sym| {
                let name = elf.strtab.get_at(sym.st_name)?;
                Some(Symbol {
                    name: name.to_string(),
                    start: sym.st_value as u32,
                    size: sym.st_size as u32,
                })
            })
            .collect();
        symbols.sort_by_key(|sym| sym.start);

        Ok(Self {
            entry: elf.entry as u32,
            segments,
            tls,
            symbols,
        })
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Install every loadable segment (and the TLS scaffolding, when
    /// present) into the MMU.
    pub fn install(&self, mmu: &mut Mmu) -> Result<()> {
        for segment in &self.segments {
            let mut region = Region::simple(segment.vaddr, segment.memsz);
            let copied = segment.file_bytes.len().min(segment.memsz as usize);
            region.data_mut()[..copied].copy_from_slice(&segment.file_bytes[..copied]);
            // Bytes present in the file image are initialized data; the BSS
            // tail keeps shadow zero.
            region.shadow_mut()[..copied].fill(1);
            region.executable = segment.flags & PF_X != 0;
            if region.executable && segment.flags & PF_W == 0 {
                region.is_text = true;
                region.writable = false;
            }
            trace!(
                "loader: segment {:#010x}+{:#x} ({:#x} from file)",
                segment.vaddr,
                segment.memsz,
                copied
            );
            mmu.add_region(region)?;
        }

        if let Some(tls) = &self.tls {
            let mut tcb = Region::simple(TCB_BASE, tls.memsz);
            let copied = tls.file_bytes.len().min(tls.memsz as usize);
            tcb.data_mut()[..copied].copy_from_slice(&tls.file_bytes[..copied]);
            tcb.shadow_mut()[..copied].fill(1);
            let tcb_end = tcb.end();
            mmu.add_region(tcb)?;

            // The guest finds its TLS base through a fixed 32-bit cell at
            // address zero pointing at the end of the TCB.
            let mut pointer = Region::simple(0, 4);
            pointer.write32(0, Shadow::initialized(tcb_end));
            mmu.set_tls_region(pointer);
            trace!("loader: tcb {TCB_BASE:#010x}+{:#x}", tls.memsz);
        }

        Ok(())
    }

    /// `[start, end)` of a symbol the emulator cannot run without.
    pub fn required_symbol_range(&self, name: &'static str) -> Result<(u32, u32)> {
        self.symbols
            .iter()
            .find(|sym| sym.name == name)
            .map(|sym| (sym.start, sym.start + sym.size))
            .ok_or(Error::MissingSymbol(name))
    }

    /// Resolve an address to the containing function symbol and the offset
    /// into it.
    pub fn symbolicate(&self, addr: u32) -> Option<(&str, u32)> {
        let at = self.symbols.partition_point(|sym| sym.start <= addr);
        let sym = &self.symbols[at.checked_sub(1)?];
        if sym.size > 0 && addr - sym.start >= sym.size {
            return None;
        }
        Some((&sym.name, addr - sym.start))
    }
}
