//! The emulator: owns the soft CPU, the MMU, the parsed program image and
//! the allocation tracer, and drives the fetch/decode/dispatch loop.
//!
//! Lifecycle: construction loads the image and bootstraps the stack
//! (`Constructed → Loaded`), [Emulator::exec] runs the guest (`Running`)
//! until the `exit` syscall flips the shutdown flag (`Shutdown`, terminal).
//! The exit status is only meaningful after shutdown.

use log::debug;
use shadow::Shadow;

use crate::cpu::{Fetcher, Reg, SoftCpu};
use crate::decoder::{self, Insn, Op};
use crate::exec::{ExecCtx, Flow, Taint};
use crate::loader::ProgramImage;
use crate::mmu::{Mmu, VmArena};
use crate::region::Region;
use crate::report::{report, HIGHLIGHT, RESET};
use crate::tracer::MallocTracer;
use crate::{exec, loader, mmu};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Loader(#[from] loader::Error),

    #[error(transparent)]
    Memory(#[from] mmu::Error),

    #[error(transparent)]
    Decode(#[from] decoder::Error),

    #[error(transparent)]
    Exec(#[from] exec::Error),

    #[error("unimplemented syscall {function}")]
    UnimplementedSyscall { function: u32 },

    #[error("unimplemented ioctl request {request:#x}")]
    UnimplementedIoctl { request: u32 },

    #[error("unimplemented fcntl command {cmd}")]
    UnimplementedFcntl { cmd: i32 },

    #[error("unimplemented socket option {option} for level {level}")]
    UnimplementedSockopt { level: i32, option: i32 },

    #[error("munmap size {size:#x} does not match the region at {addr:#010x}")]
    MunmapSizeMismatch { addr: u32, size: u32 },

    #[error("shared buffer {id} is not installed")]
    UnknownSharedBuffer { id: i32 },
}

/// Base of the guest stack region.
pub const STACK_BASE: u32 = 0x1000_0000;
/// Size of the guest stack region.
pub const STACK_SIZE: u32 = 64 * 1024;

/// Frame-pointer walks stop after this many frames.
const MAX_BACKTRACE_FRAMES: usize = 64;

/// A call into the guest allocator whose result is pending. The matching
/// `ret` to `ret_addr` carries the chunk address in EAX.
struct PendingMalloc {
    ret_addr: u32,
    size: u32,
}

pub struct Emulator {
    pub(crate) cpu: SoftCpu,
    pub(crate) mmu: Mmu,
    pub(crate) arena: VmArena,
    pub(crate) image: ProgramImage,
    pub(crate) tracer: MallocTracer,
    pub(crate) shutdown: bool,
    pub(crate) exit_status: i32,
    malloc_range: (u32, u32),
    free_range: (u32, u32),
    pending_mallocs: Vec<PendingMalloc>,
    taint_violations: u64,
    trace: bool,
}

impl Emulator {
    /// Load the image, install its regions, and build the initial stack
    /// frame. Fails before any guest instruction runs if the image cannot
    /// be loaded or lacks the allocator symbols.
    pub fn new(image: ProgramImage, arguments: &[String], environment: &[String]) -> Result<Self> {
        let mut mmu = Mmu::new();
        image.install(&mut mmu)?;
        let malloc_range = image.required_symbol_range("malloc")?;
        let free_range = image.required_symbol_range("free")?;

        let mut cpu = SoftCpu::new();
        cpu.set_eip(image.entry());
        debug!(
            "loaded image, entry {:#010x}, malloc {:#010x}..{:#010x}, free {:#010x}..{:#010x}",
            image.entry(),
            malloc_range.0,
            malloc_range.1,
            free_range.0,
            free_range.1
        );

        let mut emulator = Self {
            cpu,
            mmu,
            arena: VmArena::new(),
            image,
            tracer: MallocTracer::new(),
            shutdown: false,
            exit_status: 0,
            malloc_range,
            free_range,
            pending_mallocs: Vec::new(),
            taint_violations: 0,
            trace: false,
        };
        emulator.setup_stack(arguments, environment)?;
        Ok(emulator)
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    pub fn cpu(&self) -> &SoftCpu {
        &self.cpu
    }

    pub fn tracer(&self) -> &MallocTracer {
        &self.tracer
    }

    pub fn taint_violations(&self) -> u64 {
        self.taint_violations
    }

    /// Build the SysV IA-32 process frame: argument and environment strings,
    /// the envp and argv pointer arrays, then `envp`, `argv`, `argc` and the
    /// alignment words, everything shadow-initialized.
    fn setup_stack(&mut self, arguments: &[String], environment: &[String]) -> Result<()> {
        let mut stack = Region::simple(STACK_BASE, STACK_SIZE);
        stack.is_stack = true;
        self.mmu.add_region(stack)?;
        self.cpu
            .set_esp(Shadow::initialized(STACK_BASE + STACK_SIZE));

        let mut argv_entries = Vec::with_capacity(arguments.len());
        for argument in arguments {
            self.cpu.push_string(&mut self.mmu, argument.as_bytes())?;
            argv_entries.push(self.cpu.esp().value());
        }

        let mut env_entries = Vec::with_capacity(environment.len());
        for variable in environment {
            self.cpu.push_string(&mut self.mmu, variable.as_bytes())?;
            env_entries.push(self.cpu.esp().value());
        }

        let push = |cpu: &mut SoftCpu, mmu: &mut Mmu, value: u32| {
            cpu.push32(mmu, Shadow::initialized(value))
        };

        push(&mut self.cpu, &mut self.mmu, 0)?; // envp terminator
        for entry in env_entries.iter().rev() {
            push(&mut self.cpu, &mut self.mmu, *entry)?;
        }
        let envp = self.cpu.esp().value();

        push(&mut self.cpu, &mut self.mmu, 0)?; // argv terminator
        for entry in argv_entries.iter().rev() {
            push(&mut self.cpu, &mut self.mmu, *entry)?;
        }
        let argv = self.cpu.esp().value();

        push(&mut self.cpu, &mut self.mmu, 0)?; // alignment
        push(&mut self.cpu, &mut self.mmu, envp)?;
        push(&mut self.cpu, &mut self.mmu, argv)?;
        push(&mut self.cpu, &mut self.mmu, argv_entries.len() as u32)?;
        push(&mut self.cpu, &mut self.mmu, 0)?; // alignment

        Ok(())
    }

    /// Run the guest to completion. Returns the guest exit status; fatal
    /// diagnostics have already been reported when this returns an error.
    pub fn exec(&mut self) -> Result<i32> {
        while !self.shutdown {
            if let Err(error) = self.step() {
                report!("{error}");
                self.dump_backtrace();
                return Err(error);
            }
        }

        self.tracer
            .dump_leak_report(|addr| self.describe_frame(addr));
        Ok(self.exit_status)
    }

    /// One fetch/decode/dispatch iteration. Shutdown is only observed
    /// between instructions, never mid-instruction.
    fn step(&mut self) -> Result<()> {
        self.cpu.save_base_eip();

        let insn = {
            let mut fetcher = Fetcher::new(&mut self.cpu, &self.mmu);
            decoder::decode(&mut fetcher)?
        };

        if self.trace {
            report!(
                "  {:#010x}  {HIGHLIGHT}{}{RESET}",
                self.cpu.base_eip(),
                decoder::format_insn(&insn)
            );
        }

        let mut taints = Vec::new();
        let result = {
            let mut ctx = ExecCtx {
                cpu: &mut self.cpu,
                mmu: &mut self.mmu,
                taints: &mut taints,
            };
            ctx.execute(&insn)
        };

        // Report taint before a fault from the same instruction, so a read
        // through an uninitialized pointer produces both diagnostics in
        // order.
        for taint in taints {
            self.did_taint_violation(taint);
        }
        let flow = result?;

        if let Flow::Syscall = flow {
            let function = self.cpu.reg32(Reg::Eax).value();
            let arg1 = self.cpu.reg32(Reg::Ebx).value();
            let arg2 = self.cpu.reg32(Reg::Ecx).value();
            let arg3 = self.cpu.reg32(Reg::Edx).value();
            let rc = self.virt_syscall(function, arg1, arg2, arg3)?;
            self.cpu.set_reg32(Reg::Eax, Shadow::initialized(rc));
        }

        self.observe_allocator(&insn)?;

        if self.trace {
            report!("  {}", self.cpu.dump());
        }

        Ok(())
    }

    fn did_taint_violation(&mut self, taint: Taint) {
        self.taint_violations += 1;
        report!(
            "Use of uninitialized data as {taint} at {addr:#010x}",
            addr = self.cpu.base_eip()
        );
        self.dump_backtrace();
    }

    /// True while the current instruction lies inside the guest allocator;
    /// keeps the tracer from recording the allocator's internal calls.
    pub fn is_in_malloc_or_free(&self) -> bool {
        let eip = self.cpu.base_eip();
        in_range(self.malloc_range, eip) || in_range(self.free_range, eip)
    }

    /// Watch calls into the recorded `malloc`/`free` symbol ranges and the
    /// returns back out of them. At a `call` into malloc the argument and
    /// return address are on top of the stack; the matching `ret` lands on
    /// that return address with the chunk pointer in EAX.
    fn observe_allocator(&mut self, insn: &Insn) -> Result<()> {
        match insn.op {
            Op::Call => {
                if self.is_in_malloc_or_free() {
                    return Ok(());
                }
                let target = self.cpu.eip();
                let esp = self.cpu.esp().value();
                if in_range(self.malloc_range, target) {
                    let ret_addr = self.mmu.read32(esp)?.value();
                    let size = self.mmu.read32(esp.wrapping_add(4))?.value();
                    self.pending_mallocs.push(PendingMalloc { ret_addr, size });
                } else if in_range(self.free_range, target) {
                    let ptr = self.mmu.read32(esp.wrapping_add(4))?.value();
                    self.tracer.target_did_free(ptr);
                }
            }
            Op::Ret { .. } => {
                let eip = self.cpu.eip();
                if let Some(at) = self
                    .pending_mallocs
                    .iter()
                    .rposition(|pending| pending.ret_addr == eip)
                {
                    let pending = self.pending_mallocs.remove(at);
                    let address = self.cpu.reg32(Reg::Eax).value();
                    let backtrace = self.raw_backtrace();
                    self.tracer
                        .target_did_malloc(address, pending.size, backtrace);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Collect return addresses by walking the guest EBP chain. Starts at
    /// the current instruction; stops on a null return address, an
    /// unreadable frame, or the frame cap.
    pub fn raw_backtrace(&self) -> Vec<u32> {
        let mut backtrace = vec![self.cpu.base_eip()];
        let mut frame = self.cpu.reg32(Reg::Ebp).value();
        while frame != 0 && backtrace.len() < MAX_BACKTRACE_FRAMES {
            let Ok(ret) = self.mmu.read32(frame.wrapping_add(4)) else {
                break;
            };
            if ret.value() == 0 {
                break;
            }
            backtrace.push(ret.value());
            let Ok(next) = self.mmu.read32(frame) else {
                break;
            };
            frame = next.value();
        }
        backtrace
    }

    pub fn dump_backtrace(&self) {
        for addr in self.raw_backtrace() {
            report!("    {}", self.describe_frame(addr));
        }
    }

    fn describe_frame(&self, addr: u32) -> String {
        match self.image.symbolicate(addr) {
            Some((symbol, offset)) => format!("{addr:#010x}  {symbol} +{offset:#x}"),
            None => format!("{addr:#010x}"),
        }
    }
}

fn in_range(range: (u32, u32), addr: u32) -> bool {
    addr >= range.0 && addr < range.1
}
