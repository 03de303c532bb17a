//! Execution of decoded instructions against the soft CPU and MMU.
//!
//! Each opcode class has one handler; dispatch is a direct match on
//! [Op]. Handlers propagate shadow state through the value algebra and
//! report taint when incompletely initialized data reaches a
//! control-affecting position: a consumed flag, a jump or call target, or an
//! address computation.

use shadow::Shadow;

use crate::cpu::{Flag, Flags, Reg, SoftCpu};
use crate::decoder::{Cond, Insn, MemRef, Op, Operand, Width};
use crate::mmu::{self, Mmu};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Memory(#[from] mmu::Error),

    #[error("divide error at {addr:#010x}")]
    DivideError { addr: u32 },

    #[error("privileged instruction at {addr:#010x}")]
    PrivilegedInstruction { addr: u32 },

    #[error("unsupported interrupt vector {vector:#04x} at {addr:#010x}")]
    UnsupportedInterrupt { vector: u8, addr: u32 },
}

/// What the dispatch loop should do after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Continue with the instruction EIP now points at (handlers update EIP
    /// themselves for transfers).
    Next,
    /// The instruction was the syscall gate; the loop must invoke the
    /// virtualization layer with EAX/EBX/ECX/EDX.
    Syscall,
}

/// A control-affecting use of uninitialized data. Non-fatal; the underlying
/// value is used and execution continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Taint {
    BranchCondition,
    JumpTarget,
    Address,
}

impl std::fmt::Display for Taint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Taint::BranchCondition => write!(f, "branch condition"),
            Taint::JumpTarget => write!(f, "jump target"),
            Taint::Address => write!(f, "memory address"),
        }
    }
}

/// Borrowed execution context for a single instruction. Taint reports
/// accumulate here and are drained by the dispatch loop, which owns the
/// diagnostics channel.
pub struct ExecCtx<'a> {
    pub cpu: &'a mut SoftCpu,
    pub mmu: &'a mut Mmu,
    pub taints: &'a mut Vec<Taint>,
}

impl ExecCtx<'_> {
    pub fn execute(&mut self, insn: &Insn) -> Result<Flow> {
        match insn.op {
            Op::Mov => self.mov(insn)?,
            Op::Movzx { .. } => self.movzx(insn, false)?,
            Op::Movsx { .. } => self.movzx(insn, true)?,
            Op::Lea => {
                let Operand::Mem(mem) = insn.src else {
                    unreachable!("lea source is always a memory operand");
                };
                let addr = self.ea_shadow(&mem);
                self.write32_op(&insn.dst, addr)?;
            }
            Op::Push => {
                let value = self.read32_op(&insn.src)?;
                self.cpu.push32(self.mmu, value)?;
            }
            Op::Pop => {
                let value = self.cpu.pop32(self.mmu)?;
                self.write32_op(&insn.dst, value)?;
            }
            Op::Add | Op::Or | Op::And | Op::Sub | Op::Xor | Op::Cmp | Op::Test => {
                match insn.width {
                    Width::W8 => self.alu8(insn)?,
                    Width::W32 => self.alu32(insn)?,
                }
            }
            Op::Inc | Op::Dec => self.incdec(insn)?,
            Op::Not => {
                let value = self.read32_op(&insn.dst)?;
                self.write32_op(&insn.dst, !value)?;
            }
            Op::Neg => self.neg(insn)?,
            Op::Mul => self.mul(insn)?,
            Op::Imul => self.imul(insn)?,
            Op::Div => self.div(insn)?,
            Op::Idiv => self.idiv(insn)?,
            Op::Cdq => {
                let edx = self.cpu.reg32(Reg::Eax).sar(Shadow::initialized(31));
                self.cpu.set_reg32(Reg::Edx, edx);
            }
            Op::Shl | Op::Shr | Op::Sar => self.shift(insn)?,
            Op::Jmp => {
                let target = self.branch_target(&insn.src)?;
                self.cpu.set_eip(target);
            }
            Op::Jcc(cond) => {
                let flag = eval_cond(&self.cpu.flags, cond);
                if !flag.defined {
                    self.taints.push(Taint::BranchCondition);
                }
                if flag.value {
                    let target = self.branch_target(&insn.src)?;
                    self.cpu.set_eip(target);
                }
            }
            Op::Call => {
                let target = self.branch_target(&insn.src)?;
                let ret = Shadow::initialized(self.cpu.eip());
                self.cpu.push32(self.mmu, ret)?;
                self.cpu.set_eip(target);
            }
            Op::Ret { pop } => {
                let ret = self.cpu.pop32(self.mmu)?;
                if !ret.is_fully_initialized() {
                    self.taints.push(Taint::JumpTarget);
                }
                let esp = self.cpu.esp().value().wrapping_add(pop.into());
                self.cpu.set_esp(Shadow::initialized(esp));
                self.cpu.set_eip(ret.value());
            }
            Op::Leave => {
                self.cpu.set_esp(self.cpu.reg32(Reg::Ebp));
                let ebp = self.cpu.pop32(self.mmu)?;
                self.cpu.set_reg32(Reg::Ebp, ebp);
            }
            Op::Int { vector } => {
                if vector == crate::syscall::SYSCALL_VECTOR {
                    return Ok(Flow::Syscall);
                }
                return Err(Error::UnsupportedInterrupt {
                    vector,
                    addr: self.cpu.base_eip(),
                });
            }
            Op::Nop => {}
            Op::Hlt => {
                return Err(Error::PrivilegedInstruction {
                    addr: self.cpu.base_eip(),
                })
            }
        }

        Ok(Flow::Next)
    }

    /// Effective-address arithmetic with shadow propagation; no report.
    fn ea_shadow(&self, mem: &MemRef) -> Shadow<u32> {
        let mut addr = Shadow::initialized(mem.disp as u32);
        if let Some(base) = mem.base {
            addr = addr.add(self.cpu.reg32(Reg::from_index(base)));
        }
        if let Some((index, scale)) = mem.index {
            let scaled = self
                .cpu
                .reg32(Reg::from_index(index))
                .shl(Shadow::initialized(scale.into()));
            addr = addr.add(scaled);
        }
        addr
    }

    /// Resolve a memory operand to a concrete address, reporting taint when
    /// the address arithmetic involved uninitialized bits.
    fn ea(&mut self, mem: &MemRef) -> u32 {
        let addr = self.ea_shadow(mem);
        if !addr.is_fully_initialized() {
            self.taints.push(Taint::Address);
        }
        addr.value()
    }

    fn read32_op(&mut self, operand: &Operand) -> Result<Shadow<u32>> {
        match operand {
            Operand::Reg(r) => Ok(self.cpu.reg32(Reg::from_index(*r))),
            Operand::Imm(v) => Ok(Shadow::initialized(*v)),
            Operand::Mem(mem) => {
                let addr = self.ea(mem);
                Ok(self.mmu.read32(addr)?)
            }
            Operand::None => unreachable!("missing operand"),
        }
    }

    fn write32_op(&mut self, operand: &Operand, value: Shadow<u32>) -> Result<()> {
        match operand {
            Operand::Reg(r) => {
                self.cpu.set_reg32(Reg::from_index(*r), value);
                Ok(())
            }
            Operand::Mem(mem) => {
                let addr = self.ea(mem);
                Ok(self.mmu.write32(addr, value)?)
            }
            _ => unreachable!("bad destination operand"),
        }
    }

    fn read8_op(&mut self, operand: &Operand) -> Result<Shadow<u8>> {
        match operand {
            Operand::Reg(r) => Ok(self.cpu.reg8(*r)),
            Operand::Imm(v) => Ok(Shadow::initialized(*v as u8)),
            Operand::Mem(mem) => {
                let addr = self.ea(mem);
                Ok(self.mmu.read8(addr)?)
            }
            Operand::None => unreachable!("missing operand"),
        }
    }

    fn write8_op(&mut self, operand: &Operand, value: Shadow<u8>) -> Result<()> {
        match operand {
            Operand::Reg(r) => {
                self.cpu.set_reg8(*r, value);
                Ok(())
            }
            Operand::Mem(mem) => {
                let addr = self.ea(mem);
                Ok(self.mmu.write8(addr, value)?)
            }
            _ => unreachable!("bad destination operand"),
        }
    }

    /// Jump/call target; indirect targets through registers or memory are
    /// checked for full initialization.
    fn branch_target(&mut self, operand: &Operand) -> Result<u32> {
        let target = self.read32_op(operand)?;
        if !matches!(operand, Operand::Imm(_)) && !target.is_fully_initialized() {
            self.taints.push(Taint::JumpTarget);
        }
        Ok(target.value())
    }

    fn mov(&mut self, insn: &Insn) -> Result<()> {
        match insn.width {
            Width::W8 => {
                let value = self.read8_op(&insn.src)?;
                self.write8_op(&insn.dst, value)
            }
            Width::W32 => {
                let value = self.read32_op(&insn.src)?;
                self.write32_op(&insn.dst, value)
            }
        }
    }

    fn movzx(&mut self, insn: &Insn, sign: bool) -> Result<()> {
        let source = self.read8_op(&insn.src)?;
        let extended = if sign {
            source.sext32()
        } else {
            source.zext32()
        };
        self.write32_op(&insn.dst, extended)
    }

    fn alu32(&mut self, insn: &Insn) -> Result<()> {
        let a = self.read32_op(&insn.dst)?;
        let b = self.read32_op(&insn.src)?;
        let defined = a.is_fully_initialized() && b.is_fully_initialized();
        let (result, cf, of) = alu_compute32(insn.op, a, b);
        set_arith_flags(
            &mut self.cpu.flags,
            result.value() == 0,
            result.value() & 0x8000_0000 != 0,
            cf,
            of,
            defined,
        );
        if !matches!(insn.op, Op::Cmp | Op::Test) {
            self.write32_op(&insn.dst, result)?;
        }
        Ok(())
    }

    fn alu8(&mut self, insn: &Insn) -> Result<()> {
        let a = self.read8_op(&insn.dst)?;
        let b = self.read8_op(&insn.src)?;
        let defined = a.is_fully_initialized() && b.is_fully_initialized();
        let (result, cf, of) = alu_compute8(insn.op, a, b);
        set_arith_flags(
            &mut self.cpu.flags,
            result.value() == 0,
            result.value() & 0x80 != 0,
            cf,
            of,
            defined,
        );
        if !matches!(insn.op, Op::Cmp | Op::Test) {
            self.write8_op(&insn.dst, result)?;
        }
        Ok(())
    }

    /// `inc`/`dec` update all arithmetic flags except CF.
    fn incdec(&mut self, insn: &Insn) -> Result<()> {
        let a = self.read32_op(&insn.dst)?;
        let one = Shadow::initialized(1u32);
        let (result, of) = if insn.op == Op::Inc {
            let r = a.add(one);
            (r, add_overflows(a.value(), 1, r.value()))
        } else {
            let r = a.sub(one);
            (r, sub_overflows(a.value(), 1, r.value()))
        };
        let defined = a.is_fully_initialized();
        let cf = self.cpu.flags.cf;
        set_arith_flags(
            &mut self.cpu.flags,
            result.value() == 0,
            result.value() & 0x8000_0000 != 0,
            false,
            of,
            defined,
        );
        self.cpu.flags.cf = cf;
        self.write32_op(&insn.dst, result)
    }

    fn neg(&mut self, insn: &Insn) -> Result<()> {
        let a = self.read32_op(&insn.dst)?;
        let result = a.neg();
        set_arith_flags(
            &mut self.cpu.flags,
            result.value() == 0,
            result.value() & 0x8000_0000 != 0,
            a.value() != 0,
            a.value() == 0x8000_0000,
            a.is_fully_initialized(),
        );
        self.write32_op(&insn.dst, result)
    }

    fn shift(&mut self, insn: &Insn) -> Result<()> {
        let count = match insn.src {
            Operand::Imm(v) => Shadow::initialized(v),
            // Shift by CL.
            Operand::Reg(1) => self.cpu.reg8(1).zext32(),
            _ => unreachable!("bad shift count operand"),
        };
        let n = count.value() & 31;
        if n == 0 {
            // A zero count leaves the flags untouched; still a write so the
            // destination operand faults consistently.
            return match insn.width {
                Width::W8 => {
                    let v = self.read8_op(&insn.dst)?;
                    self.write8_op(&insn.dst, v)
                }
                Width::W32 => {
                    let v = self.read32_op(&insn.dst)?;
                    self.write32_op(&insn.dst, v)
                }
            };
        }

        match insn.width {
            Width::W8 => {
                let a = self.read8_op(&insn.dst)?;
                let (result, cf, of) = shift_compute(
                    insn.op,
                    u32::from(a.value()),
                    8,
                    n,
                    match insn.op {
                        Op::Shl => a.shl(count),
                        Op::Shr => a.shr(count),
                        _ => a.sar(count),
                    },
                );
                let defined = a.is_fully_initialized() && count.is_fully_initialized();
                set_arith_flags(
                    &mut self.cpu.flags,
                    result.value() == 0,
                    result.value() & 0x80 != 0,
                    cf,
                    of,
                    defined,
                );
                self.write8_op(&insn.dst, result)
            }
            Width::W32 => {
                let a = self.read32_op(&insn.dst)?;
                let (result, cf, of) = shift_compute(
                    insn.op,
                    a.value(),
                    32,
                    n,
                    match insn.op {
                        Op::Shl => a.shl(count),
                        Op::Shr => a.shr(count),
                        _ => a.sar(count),
                    },
                );
                let defined = a.is_fully_initialized() && count.is_fully_initialized();
                set_arith_flags(
                    &mut self.cpu.flags,
                    result.value() == 0,
                    result.value() & 0x8000_0000 != 0,
                    cf,
                    of,
                    defined,
                );
                self.write32_op(&insn.dst, result)
            }
        }
    }

    fn mul(&mut self, insn: &Insn) -> Result<()> {
        match insn.width {
            Width::W8 => {
                let a = self.cpu.reg8(0); // al
                let b = self.read8_op(&insn.src)?;
                let defined = a.is_fully_initialized() && b.is_fully_initialized();
                let product = u16::from(a.value()) * u16::from(b.value());
                let ax = wrap16(product, defined);
                let eax = self.cpu.reg32(Reg::Eax).with_low16(ax);
                self.cpu.set_reg32(Reg::Eax, eax);
                self.mul_flags(product >> 8 != 0, defined);
            }
            Width::W32 => {
                let a = self.cpu.reg32(Reg::Eax);
                let b = self.read32_op(&insn.src)?;
                let defined = a.is_fully_initialized() && b.is_fully_initialized();
                let product = u64::from(a.value()) * u64::from(b.value());
                self.cpu.set_reg32(Reg::Eax, wrap32(product as u32, defined));
                self.cpu
                    .set_reg32(Reg::Edx, wrap32((product >> 32) as u32, defined));
                self.mul_flags(product >> 32 != 0, defined);
            }
        }
        Ok(())
    }

    fn imul(&mut self, insn: &Insn) -> Result<()> {
        // Two-operand form: dst = dst * r/m, truncated.
        if let Operand::Reg(_) = insn.dst {
            let a = self.read32_op(&insn.dst)?;
            let b = self.read32_op(&insn.src)?;
            let defined = a.is_fully_initialized() && b.is_fully_initialized();
            let product = i64::from(a.value() as i32) * i64::from(b.value() as i32);
            let truncated = product as i32;
            self.write32_op(&insn.dst, wrap32(truncated as u32, defined))?;
            self.mul_flags(i64::from(truncated) != product, defined);
            return Ok(());
        }

        match insn.width {
            Width::W8 => {
                let a = self.cpu.reg8(0);
                let b = self.read8_op(&insn.src)?;
                let defined = a.is_fully_initialized() && b.is_fully_initialized();
                let product = i16::from(a.value() as i8) * i16::from(b.value() as i8);
                let eax = self
                    .cpu
                    .reg32(Reg::Eax)
                    .with_low16(wrap16(product as u16, defined));
                self.cpu.set_reg32(Reg::Eax, eax);
                self.mul_flags(i16::from(product as i8) != product, defined);
            }
            Width::W32 => {
                let a = self.cpu.reg32(Reg::Eax);
                let b = self.read32_op(&insn.src)?;
                let defined = a.is_fully_initialized() && b.is_fully_initialized();
                let product = i64::from(a.value() as i32) * i64::from(b.value() as i32);
                self.cpu
                    .set_reg32(Reg::Eax, wrap32(product as u32, defined));
                self.cpu
                    .set_reg32(Reg::Edx, wrap32((product >> 32) as u32, defined));
                self.mul_flags(i64::from(product as i32) != product, defined);
            }
        }
        Ok(())
    }

    /// CF and OF are the product-overflow bit; ZF and SF are architecturally
    /// undefined after multiplies, which the flag model expresses directly.
    fn mul_flags(&mut self, overflow: bool, defined: bool) {
        self.cpu.flags.cf = Flag {
            value: overflow,
            defined,
        };
        self.cpu.flags.of = Flag {
            value: overflow,
            defined,
        };
        self.cpu.flags.zf = Flag::undefined();
        self.cpu.flags.sf = Flag::undefined();
    }

    fn div(&mut self, insn: &Insn) -> Result<()> {
        let addr = self.cpu.base_eip();
        match insn.width {
            Width::W8 => {
                let divisor = self.read8_op(&insn.src)?;
                let eax = self.cpu.reg32(Reg::Eax);
                let dividend = u16::from(eax.low16().value());
                let defined = eax.low16().is_fully_initialized() && divisor.is_fully_initialized();
                if divisor.value() == 0 {
                    return Err(Error::DivideError { addr });
                }
                let q = dividend / u16::from(divisor.value());
                let r = dividend % u16::from(divisor.value());
                if q > 0xff {
                    return Err(Error::DivideError { addr });
                }
                let ax = u16::from_le_bytes([q as u8, r as u8]);
                let eax = eax.with_low16(wrap16(ax, defined));
                self.cpu.set_reg32(Reg::Eax, eax);
            }
            Width::W32 => {
                let divisor = self.read32_op(&insn.src)?;
                let eax = self.cpu.reg32(Reg::Eax);
                let edx = self.cpu.reg32(Reg::Edx);
                let defined = eax.is_fully_initialized()
                    && edx.is_fully_initialized()
                    && divisor.is_fully_initialized();
                if divisor.value() == 0 {
                    return Err(Error::DivideError { addr });
                }
                let dividend = (u64::from(edx.value()) << 32) | u64::from(eax.value());
                let q = dividend / u64::from(divisor.value());
                let r = dividend % u64::from(divisor.value());
                if q > u64::from(u32::MAX) {
                    return Err(Error::DivideError { addr });
                }
                self.cpu.set_reg32(Reg::Eax, wrap32(q as u32, defined));
                self.cpu.set_reg32(Reg::Edx, wrap32(r as u32, defined));
            }
        }
        self.div_flags();
        Ok(())
    }

    fn idiv(&mut self, insn: &Insn) -> Result<()> {
        let addr = self.cpu.base_eip();
        match insn.width {
            Width::W8 => {
                let divisor = self.read8_op(&insn.src)?;
                let eax = self.cpu.reg32(Reg::Eax);
                let dividend = eax.low16().value() as i16;
                let defined = eax.low16().is_fully_initialized() && divisor.is_fully_initialized();
                let d = i16::from(divisor.value() as i8);
                if d == 0 {
                    return Err(Error::DivideError { addr });
                }
                let q = dividend.wrapping_div(d);
                let r = dividend.wrapping_rem(d);
                if q > i16::from(i8::MAX) || q < i16::from(i8::MIN) {
                    return Err(Error::DivideError { addr });
                }
                let ax = u16::from_le_bytes([q as u8, r as u8]);
                let eax = eax.with_low16(wrap16(ax, defined));
                self.cpu.set_reg32(Reg::Eax, eax);
            }
            Width::W32 => {
                let divisor = self.read32_op(&insn.src)?;
                let eax = self.cpu.reg32(Reg::Eax);
                let edx = self.cpu.reg32(Reg::Edx);
                let defined = eax.is_fully_initialized()
                    && edx.is_fully_initialized()
                    && divisor.is_fully_initialized();
                let d = i64::from(divisor.value() as i32);
                if d == 0 {
                    return Err(Error::DivideError { addr });
                }
                let dividend =
                    ((u64::from(edx.value()) << 32) | u64::from(eax.value())) as i64;
                let q = dividend.wrapping_div(d);
                let r = dividend.wrapping_rem(d);
                if q > i64::from(i32::MAX) || q < i64::from(i32::MIN) {
                    return Err(Error::DivideError { addr });
                }
                self.cpu.set_reg32(Reg::Eax, wrap32(q as u32, defined));
                self.cpu.set_reg32(Reg::Edx, wrap32(r as u32, defined));
            }
        }
        self.div_flags();
        Ok(())
    }

    fn div_flags(&mut self) {
        self.cpu.flags = Flags {
            cf: Flag::undefined(),
            zf: Flag::undefined(),
            sf: Flag::undefined(),
            of: Flag::undefined(),
        };
    }
}

fn wrap32(value: u32, defined: bool) -> Shadow<u32> {
    if defined {
        Shadow::initialized(value)
    } else {
        Shadow::uninitialized(value)
    }
}

fn wrap16(value: u16, defined: bool) -> Shadow<u16> {
    if defined {
        Shadow::initialized(value)
    } else {
        Shadow::uninitialized(value)
    }
}

fn add_overflows(a: u32, b: u32, r: u32) -> bool {
    (!(a ^ b) & (a ^ r)) & 0x8000_0000 != 0
}

fn sub_overflows(a: u32, b: u32, r: u32) -> bool {
    ((a ^ b) & (a ^ r)) & 0x8000_0000 != 0
}

fn alu_compute32(op: Op, a: Shadow<u32>, b: Shadow<u32>) -> (Shadow<u32>, bool, bool) {
    match op {
        Op::Add => {
            let r = a.add(b);
            let cf = u64::from(a.value()) + u64::from(b.value()) > u64::from(u32::MAX);
            (r, cf, add_overflows(a.value(), b.value(), r.value()))
        }
        Op::Sub | Op::Cmp => {
            let r = a.sub(b);
            let cf = a.value() < b.value();
            (r, cf, sub_overflows(a.value(), b.value(), r.value()))
        }
        Op::And | Op::Test => (a & b, false, false),
        Op::Or => (a | b, false, false),
        Op::Xor => (a ^ b, false, false),
        _ => unreachable!("not an ALU op"),
    }
}

fn alu_compute8(op: Op, a: Shadow<u8>, b: Shadow<u8>) -> (Shadow<u8>, bool, bool) {
    let sign = 0x80u8;
    match op {
        Op::Add => {
            let r = a.add(b);
            let cf = u16::from(a.value()) + u16::from(b.value()) > 0xff;
            let of = (!(a.value() ^ b.value()) & (a.value() ^ r.value())) & sign != 0;
            (r, cf, of)
        }
        Op::Sub | Op::Cmp => {
            let r = a.sub(b);
            let cf = a.value() < b.value();
            let of = ((a.value() ^ b.value()) & (a.value() ^ r.value())) & sign != 0;
            (r, cf, of)
        }
        Op::And | Op::Test => (a & b, false, false),
        Op::Or => (a | b, false, false),
        Op::Xor => (a ^ b, false, false),
        _ => unreachable!("not an ALU op"),
    }
}

/// Shift flag computation over the pre-shift value. `n` has already been
/// masked to 1..=31. OF follows the architectural count-of-one definitions
/// and is left alone for larger counts.
fn shift_compute<T: shadow::Width>(
    op: Op,
    original: u32,
    bits: u32,
    n: u32,
    result: Shadow<T>,
) -> (Shadow<T>, bool, bool) {
    let msb_mask = 1u32 << (bits - 1);
    let (cf, of) = match op {
        Op::Shl => {
            let cf = if n <= bits {
                original >> (bits - n) & 1 != 0
            } else {
                false
            };
            let result_msb = result.value().msb();
            (cf, cf != result_msb)
        }
        Op::Shr => {
            let cf = original >> (n - 1) & 1 != 0;
            (cf, original & msb_mask != 0)
        }
        _ => {
            let cf = (original as i32) >> (n - 1) & 1 != 0;
            (cf, false)
        }
    };
    (result, cf, of)
}

fn set_arith_flags(flags: &mut Flags, zf: bool, sf: bool, cf: bool, of: bool, defined: bool) {
    flags.cf = Flag { value: cf, defined };
    flags.zf = Flag { value: zf, defined };
    flags.sf = Flag { value: sf, defined };
    flags.of = Flag { value: of, defined };
}

fn eval_cond(flags: &Flags, cond: Cond) -> Flag {
    let not = |f: Flag| Flag {
        value: !f.value,
        defined: f.defined,
    };
    let or = |a: Flag, b: Flag| Flag {
        value: a.value || b.value,
        defined: a.defined && b.defined,
    };
    let xor = |a: Flag, b: Flag| Flag {
        value: a.value != b.value,
        defined: a.defined && b.defined,
    };

    match cond {
        Cond::O => flags.of,
        Cond::No => not(flags.of),
        Cond::B => flags.cf,
        Cond::Ae => not(flags.cf),
        Cond::E => flags.zf,
        Cond::Ne => not(flags.zf),
        Cond::Be => or(flags.cf, flags.zf),
        Cond::A => not(or(flags.cf, flags.zf)),
        Cond::S => flags.sf,
        Cond::Ns => not(flags.sf),
        Cond::L => xor(flags.sf, flags.of),
        Cond::Ge => not(xor(flags.sf, flags.of)),
        Cond::Le => or(flags.zf, xor(flags.sf, flags.of)),
        Cond::G => not(or(flags.zf, xor(flags.sf, flags.of))),
    }
}
