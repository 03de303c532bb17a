//! Shared fixtures: a minimal IA-32 byte emitter and an ELF32 image builder
//! for constructing guest programs in-memory.

#![allow(dead_code)]

use visor::{Emulator, ProgramImage};

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

/// Hand-rolled instruction emitter. Everything not covered by a helper goes
/// through [Asm::raw] with the encoding spelled out at the call site.
pub struct Asm {
    base: u32,
    pub bytes: Vec<u8>,
}

impl Asm {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            bytes: Vec::new(),
        }
    }

    /// Address of the next emitted byte.
    pub fn here(&self) -> u32 {
        self.base + self.bytes.len() as u32
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// `mov r32, imm32`; register by x86 encoding index.
    pub fn mov_reg_imm(&mut self, reg: u8, imm: u32) -> &mut Self {
        self.bytes.push(0xb8 + reg);
        self.bytes.extend_from_slice(&imm.to_le_bytes());
        self
    }

    pub fn int_syscall(&mut self) -> &mut Self {
        self.raw(&[0xcd, 0x82])
    }

    /// Load EAX/EBX/ECX/EDX and fire the syscall gate.
    pub fn syscall3(&mut self, nr: u32, a1: u32, a2: u32, a3: u32) -> &mut Self {
        self.mov_reg_imm(0, nr)
            .mov_reg_imm(3, a1)
            .mov_reg_imm(1, a2)
            .mov_reg_imm(2, a3)
            .int_syscall()
    }

    /// `exit(status)`.
    pub fn exit(&mut self, status: u32) -> &mut Self {
        self.syscall3(visor::syscall::Sysno::Exit as u32, status, 0, 0)
    }

    pub fn push_imm8(&mut self, value: i8) -> &mut Self {
        self.raw(&[0x6a, value as u8])
    }

    pub fn push_reg(&mut self, reg: u8) -> &mut Self {
        self.raw(&[0x50 + reg])
    }

    pub fn call(&mut self, target: u32) -> &mut Self {
        let rel = target.wrapping_sub(self.here() + 5);
        self.bytes.push(0xe8);
        self.bytes.extend_from_slice(&rel.to_le_bytes());
        self
    }

    pub fn ret(&mut self) -> &mut Self {
        self.raw(&[0xc3])
    }

    pub fn add_esp(&mut self, n: i8) -> &mut Self {
        self.raw(&[0x83, 0xc4, n as u8])
    }

    pub fn sub_esp(&mut self, n: i8) -> &mut Self {
        self.raw(&[0x83, 0xec, n as u8])
    }
}

struct Segment {
    p_type: u32,
    vaddr: u32,
    data: Vec<u8>,
    memsz: u32,
    flags: u32,
}

struct Symbol {
    name: String,
    value: u32,
    size: u32,
}

/// Builds a minimal but well-formed ELF32 executable: program headers for
/// the given segments, plus `.symtab`/`.strtab` sections so symbol lookup
/// works. `malloc`/`free` placeholders are added automatically when a test
/// does not define its own.
pub struct ImageBuilder {
    entry: u32,
    segments: Vec<Segment>,
    symbols: Vec<Symbol>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            entry: 0,
            segments: Vec::new(),
            symbols: Vec::new(),
        }
    }

    pub fn entry(mut self, entry: u32) -> Self {
        self.entry = entry;
        self
    }

    pub fn text(mut self, vaddr: u32, data: Vec<u8>) -> Self {
        let memsz = data.len() as u32;
        self.segments.push(Segment {
            p_type: 1, // PT_LOAD
            vaddr,
            data,
            memsz,
            flags: PF_R | PF_X,
        });
        self
    }

    pub fn data(mut self, vaddr: u32, data: Vec<u8>, memsz: u32) -> Self {
        let memsz = memsz.max(data.len() as u32);
        self.segments.push(Segment {
            p_type: 1,
            vaddr,
            data,
            memsz,
            flags: PF_R | PF_W,
        });
        self
    }

    pub fn tls(mut self, data: Vec<u8>, memsz: u32) -> Self {
        let memsz = memsz.max(data.len() as u32);
        self.segments.push(Segment {
            p_type: 7, // PT_TLS
            vaddr: 0,
            data,
            memsz,
            flags: PF_R,
        });
        self
    }

    pub fn symbol(mut self, name: &str, value: u32, size: u32) -> Self {
        self.symbols.push(Symbol {
            name: name.to_string(),
            value,
            size,
        });
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        // The loader refuses images without the allocator symbols; tests
        // that do not exercise the tracer get empty ranges.
        for required in ["malloc", "free"] {
            if !self.symbols.iter().any(|sym| sym.name == required) {
                self.symbols.push(Symbol {
                    name: required.to_string(),
                    value: 0x0fff_0000,
                    size: 0,
                });
            }
        }

        const EHSIZE: u32 = 52;
        const PHENTSIZE: u32 = 32;
        const SHENTSIZE: u32 = 40;

        let phnum = self.segments.len() as u32;
        let mut offset = EHSIZE + phnum * PHENTSIZE;

        // Lay out segment blobs.
        let mut seg_offsets = Vec::new();
        for segment in &self.segments {
            seg_offsets.push(offset);
            offset += segment.data.len() as u32;
        }

        // Symbol table (with leading null entry) and its string table.
        while offset % 4 != 0 {
            offset += 1;
        }
        let symtab_off = offset;
        let symtab_size = 16 * (1 + self.symbols.len() as u32);
        offset += symtab_size;

        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for symbol in &self.symbols {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(symbol.name.as_bytes());
            strtab.push(0);
        }
        let strtab_off = offset;
        offset += strtab.len() as u32;

        let shstrtab: &[u8] = b"\0.symtab\0.strtab\0.shstrtab\0";
        let shstrtab_off = offset;
        offset += shstrtab.len() as u32;

        while offset % 4 != 0 {
            offset += 1;
        }
        let shoff = offset;

        let mut out = Vec::new();
        // ELF header.
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out.extend_from_slice(&3u16.to_le_bytes()); // EM_386
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&EHSIZE.to_le_bytes()); // e_phoff
        out.extend_from_slice(&shoff.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes());
        out.extend_from_slice(&(phnum as u16).to_le_bytes());
        out.extend_from_slice(&(SHENTSIZE as u16).to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes()); // e_shnum
        out.extend_from_slice(&3u16.to_le_bytes()); // e_shstrndx

        // Program headers.
        for (segment, seg_offset) in self.segments.iter().zip(&seg_offsets) {
            out.extend_from_slice(&segment.p_type.to_le_bytes());
            out.extend_from_slice(&seg_offset.to_le_bytes());
            out.extend_from_slice(&segment.vaddr.to_le_bytes());
            out.extend_from_slice(&segment.vaddr.to_le_bytes()); // p_paddr
            out.extend_from_slice(&(segment.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&segment.memsz.to_le_bytes());
            out.extend_from_slice(&segment.flags.to_le_bytes());
            out.extend_from_slice(&0x1000u32.to_le_bytes());
        }

        // Segment blobs.
        for segment in &self.segments {
            out.extend_from_slice(&segment.data);
        }
        while out.len() < symtab_off as usize {
            out.push(0);
        }

        // Symbol table.
        out.extend_from_slice(&[0; 16]);
        for (symbol, name_offset) in self.symbols.iter().zip(&name_offsets) {
            out.extend_from_slice(&name_offset.to_le_bytes());
            out.extend_from_slice(&symbol.value.to_le_bytes());
            out.extend_from_slice(&symbol.size.to_le_bytes());
            out.push(0x12); // GLOBAL FUNC
            out.push(0);
            out.extend_from_slice(&0xfff1u16.to_le_bytes()); // SHN_ABS
        }

        out.extend_from_slice(&strtab);
        out.extend_from_slice(shstrtab);
        while out.len() < shoff as usize {
            out.push(0);
        }

        // Section headers: null, .symtab, .strtab, .shstrtab.
        let shdr = |out: &mut Vec<u8>,
                    name: u32,
                    sh_type: u32,
                    sh_offset: u32,
                    size: u32,
                    link: u32,
                    info: u32,
                    entsize: u32| {
            out.extend_from_slice(&name.to_le_bytes());
            out.extend_from_slice(&sh_type.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // sh_flags
            out.extend_from_slice(&0u32.to_le_bytes()); // sh_addr
            out.extend_from_slice(&sh_offset.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&link.to_le_bytes());
            out.extend_from_slice(&info.to_le_bytes());
            out.extend_from_slice(&4u32.to_le_bytes()); // sh_addralign
            out.extend_from_slice(&entsize.to_le_bytes());
        };
        shdr(&mut out, 0, 0, 0, 0, 0, 0, 0);
        shdr(&mut out, 1, 2, symtab_off, symtab_size, 2, 1, 16); // SHT_SYMTAB
        shdr(&mut out, 9, 3, strtab_off, strtab.len() as u32, 0, 0, 0); // SHT_STRTAB
        shdr(
            &mut out,
            17,
            3,
            shstrtab_off,
            shstrtab.len() as u32,
            0,
            0,
            0,
        );

        out
    }
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the built image and construct an emulator around it.
pub fn emulator_for(builder: ImageBuilder, arguments: &[&str]) -> Emulator {
    let bytes = builder.build();
    let image = ProgramImage::from_bytes(&bytes).expect("failed to parse test image");
    let arguments: Vec<String> = arguments.iter().map(|arg| arg.to_string()).collect();
    Emulator::new(image, &arguments, &[]).expect("failed to construct emulator")
}
