//! Streaming IA-32 instruction decoder.
//!
//! Covers the subset of the 32-bit instruction set the soft CPU executes:
//! the common data movement, ALU, shift, control-transfer and stack forms
//! compilers emit, plus `int imm8` for syscalls. Prefixes, 16-bit operand
//! forms and everything else decode to an error, which the dispatch loop
//! turns into a fatal diagnostic.

use crate::cpu::Fetcher;
use crate::mmu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] mmu::Error),

    #[error("unsupported opcode {opcode:#04x} at {addr:#010x}")]
    UnsupportedOpcode { opcode: u32, addr: u32 },

    #[error("unsupported {group} sub-opcode {sub} at {addr:#010x}")]
    UnsupportedSubOpcode {
        group: &'static str,
        sub: u8,
        addr: u32,
    },
}

/// Operand width of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W8,
    W32,
}

/// A decoded memory operand: `[base + index * scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    pub base: Option<u8>,
    /// Index register and left-shift amount (0..=3). ESP can never index.
    pub index: Option<(u8, u8)>,
    pub disp: i32,
}

impl MemRef {
    fn absolute(disp: i32) -> Self {
        Self {
            base: None,
            index: None,
            disp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Register by encoding index; 8-bit operands use the AL..BH numbering.
    Reg(u8),
    Mem(MemRef),
    Imm(u32),
    None,
}

/// Condition codes in encoding order of the low nibble of `Jcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    L,
    Ge,
    Le,
    G,
}

impl Cond {
    fn from_nibble(nibble: u8) -> Option<Self> {
        Some(match nibble {
            0x0 => Cond::O,
            0x1 => Cond::No,
            0x2 => Cond::B,
            0x3 => Cond::Ae,
            0x4 => Cond::E,
            0x5 => Cond::Ne,
            0x6 => Cond::Be,
            0x7 => Cond::A,
            0x8 => Cond::S,
            0x9 => Cond::Ns,
            0xc => Cond::L,
            0xd => Cond::Ge,
            0xe => Cond::Le,
            0xf => Cond::G,
            // 0xa/0xb test the parity flag, which the soft CPU does not
            // model.
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::No => "no",
            Cond::B => "b",
            Cond::Ae => "ae",
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::Be => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::Ns => "ns",
            Cond::L => "l",
            Cond::Ge => "ge",
            Cond::Le => "le",
            Cond::G => "g",
        }
    }
}

/// Opcode classes the execution layer dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Mov,
    Movzx { src: Width },
    Movsx { src: Width },
    Lea,
    Push,
    Pop,
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
    Inc,
    Dec,
    Not,
    Neg,
    Mul,
    Imul,
    Div,
    Idiv,
    Cdq,
    Shl,
    Shr,
    Sar,
    Jmp,
    Jcc(Cond),
    Call,
    Ret { pop: u16 },
    Leave,
    Int { vector: u8 },
    Nop,
    Hlt,
}

/// One decoded instruction. `dst`/`src` follow the Intel operand order.
#[derive(Debug, Clone, Copy)]
pub struct Insn {
    pub op: Op,
    pub width: Width,
    pub dst: Operand,
    pub src: Operand,
}

impl Insn {
    fn new(op: Op, width: Width, dst: Operand, src: Operand) -> Self {
        Self {
            op,
            width,
            dst,
            src,
        }
    }

    fn no_operands(op: Op) -> Self {
        Self::new(op, Width::W32, Operand::None, Operand::None)
    }
}

/// ModRM byte split into its three fields.
struct ModRm {
    mode: u8,
    reg: u8,
    rm: u8,
}

fn fetch_modrm(f: &mut Fetcher) -> Result<ModRm> {
    let byte = f.fetch8()?;
    Ok(ModRm {
        mode: byte >> 6,
        reg: (byte >> 3) & 7,
        rm: byte & 7,
    })
}

/// Decode the r/m side of a ModRM byte into an operand, consuming any SIB
/// byte and displacement.
fn rm_operand(f: &mut Fetcher, modrm: &ModRm) -> Result<Operand> {
    if modrm.mode == 3 {
        return Ok(Operand::Reg(modrm.rm));
    }

    let mut mem = if modrm.rm == 4 {
        let sib = f.fetch8()?;
        let scale = sib >> 6;
        let index = (sib >> 3) & 7;
        let base = sib & 7;
        MemRef {
            base: if base == 5 && modrm.mode == 0 {
                None
            } else {
                Some(base)
            },
            index: if index == 4 { None } else { Some((index, scale)) },
            disp: 0,
        }
    } else if modrm.rm == 5 && modrm.mode == 0 {
        MemRef::absolute(0)
    } else {
        MemRef {
            base: Some(modrm.rm),
            index: None,
            disp: 0,
        }
    };

    mem.disp = match modrm.mode {
        1 => f.fetch8()? as i8 as i32,
        2 => f.fetch32()? as i32,
        // Baseless forms (rm=5, or SIB base=5) carry a 32-bit displacement.
        0 if mem.base.is_none() => f.fetch32()? as i32,
        _ => 0,
    };

    Ok(Operand::Mem(mem))
}

fn alu_op(index: u8) -> Option<Op> {
    Some(match index {
        0 => Op::Add,
        1 => Op::Or,
        4 => Op::And,
        5 => Op::Sub,
        6 => Op::Xor,
        7 => Op::Cmp,
        // 2/3 are adc/sbb, which the soft CPU does not implement.
        _ => return None,
    })
}

fn shift_op(index: u8) -> Option<Op> {
    Some(match index {
        4 => Op::Shl,
        5 => Op::Shr,
        7 => Op::Sar,
        _ => return None,
    })
}

/// Decode one instruction from the stream. On return the fetch cursor (and
/// therefore EIP) points at the following instruction.
pub fn decode(f: &mut Fetcher) -> Result<Insn> {
    let start = f.addr();
    let opcode = f.fetch8()?;

    let insn = match opcode {
        // ALU r/m, r and r, r/m forms: 0x00-0x3b in a regular pattern.
        0x00 | 0x08 | 0x20 | 0x28 | 0x30 | 0x38 => {
            let op = alu_op(opcode >> 3).unwrap();
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            Insn::new(op, Width::W8, rm, Operand::Reg(modrm.reg))
        }
        0x01 | 0x09 | 0x21 | 0x29 | 0x31 | 0x39 => {
            let op = alu_op(opcode >> 3).unwrap();
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            Insn::new(op, Width::W32, rm, Operand::Reg(modrm.reg))
        }
        0x02 | 0x0a | 0x22 | 0x2a | 0x32 | 0x3a => {
            let op = alu_op(opcode >> 3).unwrap();
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            Insn::new(op, Width::W8, Operand::Reg(modrm.reg), rm)
        }
        0x03 | 0x0b | 0x23 | 0x2b | 0x33 | 0x3b => {
            let op = alu_op(opcode >> 3).unwrap();
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            Insn::new(op, Width::W32, Operand::Reg(modrm.reg), rm)
        }
        // ALU al/eax, imm forms.
        0x04 | 0x0c | 0x24 | 0x2c | 0x34 | 0x3c => {
            let op = alu_op(opcode >> 3).unwrap();
            let imm = f.fetch8()?;
            Insn::new(op, Width::W8, Operand::Reg(0), Operand::Imm(imm.into()))
        }
        0x05 | 0x0d | 0x25 | 0x2d | 0x35 | 0x3d => {
            let op = alu_op(opcode >> 3).unwrap();
            let imm = f.fetch32()?;
            Insn::new(op, Width::W32, Operand::Reg(0), Operand::Imm(imm))
        }

        0x0f => return decode_0f(f, start),

        0x40..=0x47 => Insn::new(
            Op::Inc,
            Width::W32,
            Operand::Reg(opcode & 7),
            Operand::None,
        ),
        0x48..=0x4f => Insn::new(
            Op::Dec,
            Width::W32,
            Operand::Reg(opcode & 7),
            Operand::None,
        ),
        0x50..=0x57 => Insn::new(
            Op::Push,
            Width::W32,
            Operand::None,
            Operand::Reg(opcode & 7),
        ),
        0x58..=0x5f => Insn::new(
            Op::Pop,
            Width::W32,
            Operand::Reg(opcode & 7),
            Operand::None,
        ),

        0x68 => {
            let imm = f.fetch32()?;
            Insn::new(Op::Push, Width::W32, Operand::None, Operand::Imm(imm))
        }
        0x6a => {
            let imm = f.fetch8()? as i8 as i32 as u32;
            Insn::new(Op::Push, Width::W32, Operand::None, Operand::Imm(imm))
        }

        0x70..=0x7f => {
            let cond = Cond::from_nibble(opcode & 0xf).ok_or(Error::UnsupportedOpcode {
                opcode: opcode.into(),
                addr: start,
            })?;
            let rel = f.fetch8()? as i8 as i32;
            let target = f.addr().wrapping_add(rel as u32);
            Insn::new(
                Op::Jcc(cond),
                Width::W32,
                Operand::None,
                Operand::Imm(target),
            )
        }

        // Group 1: ALU r/m, imm.
        0x80 => {
            let modrm = fetch_modrm(f)?;
            let op = alu_op(modrm.reg).ok_or(Error::UnsupportedSubOpcode {
                group: "group1",
                sub: modrm.reg,
                addr: start,
            })?;
            let rm = rm_operand(f, &modrm)?;
            let imm = f.fetch8()?;
            Insn::new(op, Width::W8, rm, Operand::Imm(imm.into()))
        }
        0x81 => {
            let modrm = fetch_modrm(f)?;
            let op = alu_op(modrm.reg).ok_or(Error::UnsupportedSubOpcode {
                group: "group1",
                sub: modrm.reg,
                addr: start,
            })?;
            let rm = rm_operand(f, &modrm)?;
            let imm = f.fetch32()?;
            Insn::new(op, Width::W32, rm, Operand::Imm(imm))
        }
        0x83 => {
            let modrm = fetch_modrm(f)?;
            let op = alu_op(modrm.reg).ok_or(Error::UnsupportedSubOpcode {
                group: "group1",
                sub: modrm.reg,
                addr: start,
            })?;
            let rm = rm_operand(f, &modrm)?;
            let imm = f.fetch8()? as i8 as i32 as u32;
            Insn::new(op, Width::W32, rm, Operand::Imm(imm))
        }

        0x84 => {
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            Insn::new(Op::Test, Width::W8, rm, Operand::Reg(modrm.reg))
        }
        0x85 => {
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            Insn::new(Op::Test, Width::W32, rm, Operand::Reg(modrm.reg))
        }

        0x88 => {
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            Insn::new(Op::Mov, Width::W8, rm, Operand::Reg(modrm.reg))
        }
        0x89 => {
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            Insn::new(Op::Mov, Width::W32, rm, Operand::Reg(modrm.reg))
        }
        0x8a => {
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            Insn::new(Op::Mov, Width::W8, Operand::Reg(modrm.reg), rm)
        }
        0x8b => {
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            Insn::new(Op::Mov, Width::W32, Operand::Reg(modrm.reg), rm)
        }
        0x8d => {
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            Insn::new(Op::Lea, Width::W32, Operand::Reg(modrm.reg), rm)
        }
        0x8f => {
            let modrm = fetch_modrm(f)?;
            if modrm.reg != 0 {
                return Err(Error::UnsupportedSubOpcode {
                    group: "group1a",
                    sub: modrm.reg,
                    addr: start,
                });
            }
            let rm = rm_operand(f, &modrm)?;
            Insn::new(Op::Pop, Width::W32, rm, Operand::None)
        }

        0x90 => Insn::no_operands(Op::Nop),
        0x99 => Insn::no_operands(Op::Cdq),

        0xb0..=0xb7 => {
            let imm = f.fetch8()?;
            Insn::new(
                Op::Mov,
                Width::W8,
                Operand::Reg(opcode & 7),
                Operand::Imm(imm.into()),
            )
        }
        0xb8..=0xbf => {
            let imm = f.fetch32()?;
            Insn::new(
                Op::Mov,
                Width::W32,
                Operand::Reg(opcode & 7),
                Operand::Imm(imm),
            )
        }

        // Shift group, count forms: imm8, 1, cl.
        0xc0 | 0xc1 | 0xd0 | 0xd1 | 0xd2 | 0xd3 => {
            let width = if opcode & 1 == 0 { Width::W8 } else { Width::W32 };
            let modrm = fetch_modrm(f)?;
            let op = shift_op(modrm.reg).ok_or(Error::UnsupportedSubOpcode {
                group: "shift",
                sub: modrm.reg,
                addr: start,
            })?;
            let rm = rm_operand(f, &modrm)?;
            let count = match opcode {
                0xc0 | 0xc1 => Operand::Imm(f.fetch8()?.into()),
                0xd0 | 0xd1 => Operand::Imm(1),
                // Shift by CL.
                _ => Operand::Reg(1),
            };
            Insn::new(op, width, rm, count)
        }

        0xc2 => {
            let pop = f.fetch16()?;
            Insn::no_operands(Op::Ret { pop })
        }
        0xc3 => Insn::no_operands(Op::Ret { pop: 0 }),

        0xc6 => {
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            let imm = f.fetch8()?;
            Insn::new(Op::Mov, Width::W8, rm, Operand::Imm(imm.into()))
        }
        0xc7 => {
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            let imm = f.fetch32()?;
            Insn::new(Op::Mov, Width::W32, rm, Operand::Imm(imm))
        }

        0xc9 => Insn::no_operands(Op::Leave),

        0xcd => {
            let vector = f.fetch8()?;
            Insn::no_operands(Op::Int { vector })
        }

        0xe8 => {
            let rel = f.fetch32()? as i32;
            let target = f.addr().wrapping_add(rel as u32);
            Insn::new(Op::Call, Width::W32, Operand::None, Operand::Imm(target))
        }
        0xe9 => {
            let rel = f.fetch32()? as i32;
            let target = f.addr().wrapping_add(rel as u32);
            Insn::new(Op::Jmp, Width::W32, Operand::None, Operand::Imm(target))
        }
        0xeb => {
            let rel = f.fetch8()? as i8 as i32;
            let target = f.addr().wrapping_add(rel as u32);
            Insn::new(Op::Jmp, Width::W32, Operand::None, Operand::Imm(target))
        }

        // Group 3: unary ALU and multiply/divide.
        0xf6 | 0xf7 => {
            let width = if opcode == 0xf6 { Width::W8 } else { Width::W32 };
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            match modrm.reg {
                0 => {
                    let imm = match width {
                        Width::W8 => f.fetch8()?.into(),
                        Width::W32 => f.fetch32()?,
                    };
                    Insn::new(Op::Test, width, rm, Operand::Imm(imm))
                }
                2 => Insn::new(Op::Not, width, rm, Operand::None),
                3 => Insn::new(Op::Neg, width, rm, Operand::None),
                4 => Insn::new(Op::Mul, width, Operand::None, rm),
                5 => Insn::new(Op::Imul, width, Operand::None, rm),
                6 => Insn::new(Op::Div, width, Operand::None, rm),
                7 => Insn::new(Op::Idiv, width, Operand::None, rm),
                sub => {
                    return Err(Error::UnsupportedSubOpcode {
                        group: "group3",
                        sub,
                        addr: start,
                    })
                }
            }
        }

        0xf4 => Insn::no_operands(Op::Hlt),

        // Group 5: inc/dec/call/jmp/push on r/m.
        0xff => {
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            match modrm.reg {
                0 => Insn::new(Op::Inc, Width::W32, rm, Operand::None),
                1 => Insn::new(Op::Dec, Width::W32, rm, Operand::None),
                2 => Insn::new(Op::Call, Width::W32, Operand::None, rm),
                4 => Insn::new(Op::Jmp, Width::W32, Operand::None, rm),
                6 => Insn::new(Op::Push, Width::W32, Operand::None, rm),
                sub => {
                    return Err(Error::UnsupportedSubOpcode {
                        group: "group5",
                        sub,
                        addr: start,
                    })
                }
            }
        }

        _ => {
            return Err(Error::UnsupportedOpcode {
                opcode: opcode.into(),
                addr: start,
            })
        }
    };

    Ok(insn)
}

/// Two-byte (`0x0f`-prefixed) opcodes.
fn decode_0f(f: &mut Fetcher, start: u32) -> Result<Insn> {
    let opcode = f.fetch8()?;
    let insn = match opcode {
        0x80..=0x8f => {
            let cond = Cond::from_nibble(opcode & 0xf).ok_or(Error::UnsupportedOpcode {
                opcode: 0x0f00 | u32::from(opcode),
                addr: start,
            })?;
            let rel = f.fetch32()? as i32;
            let target = f.addr().wrapping_add(rel as u32);
            Insn::new(
                Op::Jcc(cond),
                Width::W32,
                Operand::None,
                Operand::Imm(target),
            )
        }
        0xaf => {
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            Insn::new(Op::Imul, Width::W32, Operand::Reg(modrm.reg), rm)
        }
        // Byte-source movzx/movsx; the 16-bit source forms are not modelled.
        0xb6 | 0xbe => {
            let modrm = fetch_modrm(f)?;
            let rm = rm_operand(f, &modrm)?;
            let op = if opcode == 0xb6 {
                Op::Movzx { src: Width::W8 }
            } else {
                Op::Movsx { src: Width::W8 }
            };
            Insn::new(op, Width::W32, Operand::Reg(modrm.reg), rm)
        }
        _ => {
            return Err(Error::UnsupportedOpcode {
                opcode: 0x0f00 | u32::from(opcode),
                addr: start,
            })
        }
    };
    Ok(insn)
}

/// Render an instruction for the `--trace` output.
pub fn format_insn(insn: &Insn) -> String {
    use crate::cpu::Reg;

    let operand = |operand: &Operand, width: Width| -> String {
        match operand {
            Operand::Reg(r) => match width {
                Width::W8 => Reg::name8(*r).to_string(),
                Width::W32 => Reg::from_index(*r).name().to_string(),
            },
            Operand::Imm(imm) => format!("{imm:#x}"),
            Operand::Mem(m) => {
                let mut out = String::from("[");
                if let Some(base) = m.base {
                    out.push_str(Reg::from_index(base).name());
                }
                if let Some((index, scale)) = m.index {
                    if out.len() > 1 {
                        out.push('+');
                    }
                    out.push_str(Reg::from_index(index).name());
                    out.push_str(&format!("*{}", 1 << scale));
                }
                if m.disp != 0 || out.len() == 1 {
                    if m.disp < 0 {
                        out.push_str(&format!("-{:#x}", -(m.disp as i64)));
                    } else {
                        if out.len() > 1 {
                            out.push('+');
                        }
                        out.push_str(&format!("{:#x}", m.disp));
                    }
                }
                out.push(']');
                out
            }
            Operand::None => String::new(),
        }
    };

    let mnemonic = match insn.op {
        Op::Mov => "mov",
        Op::Movzx { .. } => "movzx",
        Op::Movsx { .. } => "movsx",
        Op::Lea => "lea",
        Op::Push => "push",
        Op::Pop => "pop",
        Op::Add => "add",
        Op::Or => "or",
        Op::And => "and",
        Op::Sub => "sub",
        Op::Xor => "xor",
        Op::Cmp => "cmp",
        Op::Test => "test",
        Op::Inc => "inc",
        Op::Dec => "dec",
        Op::Not => "not",
        Op::Neg => "neg",
        Op::Mul => "mul",
        Op::Imul => "imul",
        Op::Div => "div",
        Op::Idiv => "idiv",
        Op::Cdq => "cdq",
        Op::Shl => "shl",
        Op::Shr => "shr",
        Op::Sar => "sar",
        Op::Jmp => "jmp",
        Op::Jcc(cond) => return format!("j{} {}", cond.name(), operand(&insn.src, insn.width)),
        Op::Call => "call",
        Op::Ret { .. } => "ret",
        Op::Leave => "leave",
        Op::Int { vector } => return format!("int {vector:#x}"),
        Op::Nop => "nop",
        Op::Hlt => "hlt",
    };

    let dst = operand(&insn.dst, insn.width);
    let src = operand(&insn.src, insn.width);
    match (dst.is_empty(), src.is_empty()) {
        (true, true) => mnemonic.to_string(),
        (false, true) => format!("{mnemonic} {dst}"),
        (true, false) => format!("{mnemonic} {src}"),
        (false, false) => format!("{mnemonic} {dst}, {src}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::SoftCpu;
    use crate::mmu::Mmu;
    use crate::region::Region;
    use shadow::Shadow;

    fn decode_bytes(bytes: &[u8]) -> Result<(Insn, u32)> {
        let mut mmu = Mmu::new();
        let mut text = Region::simple(0x1000, 0x100);
        text.executable = true;
        for (i, b) in bytes.iter().enumerate() {
            text.write8(i as u32, Shadow::initialized(*b));
        }
        mmu.add_region(text).unwrap();

        let mut cpu = SoftCpu::new();
        cpu.set_eip(0x1000);
        let mut fetcher = Fetcher::new(&mut cpu, &mmu);
        let insn = decode(&mut fetcher)?;
        Ok((insn, cpu.eip()))
    }

    #[test]
    fn mov_reg_imm() {
        let (insn, end) = decode_bytes(&[0xb8, 0x2a, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(insn.op, Op::Mov);
        assert_eq!(insn.dst, Operand::Reg(0));
        assert_eq!(insn.src, Operand::Imm(42));
        assert_eq!(end, 0x1005);
    }

    #[test]
    fn mov_reg_mem_with_disp() {
        // mov eax, [ebp-8]
        let (insn, _) = decode_bytes(&[0x8b, 0x45, 0xf8]).unwrap();
        assert_eq!(insn.op, Op::Mov);
        assert_eq!(insn.dst, Operand::Reg(0));
        assert_eq!(
            insn.src,
            Operand::Mem(MemRef {
                base: Some(5),
                index: None,
                disp: -8
            })
        );
    }

    #[test]
    fn sib_with_scaled_index() {
        // mov eax, [ebx+esi*4+0x10]
        let (insn, _) = decode_bytes(&[0x8b, 0x44, 0xb3, 0x10]).unwrap();
        assert_eq!(
            insn.src,
            Operand::Mem(MemRef {
                base: Some(3),
                index: Some((6, 2)),
                disp: 0x10
            })
        );
    }

    #[test]
    fn esp_relative_addressing() {
        // mov eax, [esp]
        let (insn, _) = decode_bytes(&[0x8b, 0x04, 0x24]).unwrap();
        assert_eq!(
            insn.src,
            Operand::Mem(MemRef {
                base: Some(4),
                index: None,
                disp: 0
            })
        );
    }

    #[test]
    fn absolute_addressing() {
        // mov eax, [0x08049000]
        let (insn, _) = decode_bytes(&[0x8b, 0x05, 0x00, 0x90, 0x04, 0x08]).unwrap();
        assert_eq!(
            insn.src,
            Operand::Mem(MemRef {
                base: None,
                index: None,
                disp: 0x0804_9000u32 as i32
            })
        );
    }

    #[test]
    fn group1_sign_extended_imm8() {
        // sub esp, 0x10
        let (insn, _) = decode_bytes(&[0x83, 0xec, 0x10]).unwrap();
        assert_eq!(insn.op, Op::Sub);
        assert_eq!(insn.dst, Operand::Reg(4));
        assert_eq!(insn.src, Operand::Imm(0x10));

        // add eax, -1
        let (insn, _) = decode_bytes(&[0x83, 0xc0, 0xff]).unwrap();
        assert_eq!(insn.op, Op::Add);
        assert_eq!(insn.src, Operand::Imm(0xffff_ffff));
    }

    #[test]
    fn relative_jumps_resolve_to_absolute_targets() {
        // jmp +2 (short): next eip 0x1002, target 0x1004
        let (insn, _) = decode_bytes(&[0xeb, 0x02]).unwrap();
        assert_eq!(insn.op, Op::Jmp);
        assert_eq!(insn.src, Operand::Imm(0x1004));

        // jz -2 (short loop back onto itself)
        let (insn, _) = decode_bytes(&[0x74, 0xfe]).unwrap();
        assert_eq!(insn.op, Op::Jcc(Cond::E));
        assert_eq!(insn.src, Operand::Imm(0x1000));

        // call rel32
        let (insn, _) = decode_bytes(&[0xe8, 0x10, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(insn.op, Op::Call);
        assert_eq!(insn.src, Operand::Imm(0x1015));
    }

    #[test]
    fn int_and_ret() {
        let (insn, _) = decode_bytes(&[0xcd, 0x82]).unwrap();
        assert_eq!(insn.op, Op::Int { vector: 0x82 });

        let (insn, _) = decode_bytes(&[0xc2, 0x08, 0x00]).unwrap();
        assert_eq!(insn.op, Op::Ret { pop: 8 });
    }

    #[test]
    fn group3_and_group5() {
        // div ebx
        let (insn, _) = decode_bytes(&[0xf7, 0xf3]).unwrap();
        assert_eq!(insn.op, Op::Div);
        assert_eq!(insn.src, Operand::Reg(3));

        // call [eax]
        let (insn, _) = decode_bytes(&[0xff, 0x10]).unwrap();
        assert_eq!(insn.op, Op::Call);
        assert_eq!(
            insn.src,
            Operand::Mem(MemRef {
                base: Some(0),
                index: None,
                disp: 0
            })
        );
    }

    #[test]
    fn movzx_byte() {
        // movzx eax, byte [esp]
        let (insn, _) = decode_bytes(&[0x0f, 0xb6, 0x04, 0x24]).unwrap();
        assert_eq!(insn.op, Op::Movzx { src: Width::W8 });
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        assert!(matches!(
            decode_bytes(&[0xf1]),
            Err(Error::UnsupportedOpcode { .. })
        ));
    }

    #[test]
    fn formatting_smoke() {
        let (insn, _) = decode_bytes(&[0x8b, 0x45, 0xf8]).unwrap();
        assert_eq!(format_insn(&insn), "mov eax, [ebp-0x8]");
        let (insn, _) = decode_bytes(&[0xcd, 0x82]).unwrap();
        assert_eq!(format_insn(&insn), "int 0x82");
    }
}
