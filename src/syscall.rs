//! Guest syscall virtualization.
//!
//! [Emulator::virt_syscall] demultiplexes the number the guest put in EAX
//! and services each call by marshalling arguments out of guest memory,
//! performing the matching host operation, and marshalling results back.
//! Host failures come back to the guest as negative errno values; only
//! conditions the emulator cannot continue past (unknown syscall, unknown
//! ioctl/fcntl/sockopt, munmap size mismatch) surface as errors.
//!
//! Parameter structs are decoded field-by-field from the little-endian
//! bytes the guest wrote; lengths are always taken from the copied struct
//! and every write-back is bounds-checked against the size the guest
//! supplied.

use std::ffi::CString;

use log::{trace, warn};

use crate::emulator::{Emulator, Error, Result};
use crate::mmu::{round_up_to_page, PAGE_SIZE};
use crate::region::{Region, RegionKind};
use crate::report::{report, HIGHLIGHT, RESET};

/// The software interrupt vector guests use for syscalls.
pub const SYSCALL_VECTOR: u8 = 0x82;

/// Guest mmap protection and flag bits.
pub const PROT_READ: u32 = 0x1;
pub const PROT_WRITE: u32 = 0x2;
pub const PROT_EXEC: u32 = 0x4;
pub const MAP_ANONYMOUS: u32 = 0x20;

/// Longest path the marshalling layer will stage.
const PATH_MAX: u32 = 4096;

macro_rules! syscalls {
    ($($name:ident = $num:literal,)*) => {
        /// The guest syscall numbering of this emulator's ABI.
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Sysno {
            $($name = $num,)*
        }

        impl Sysno {
            pub fn from_raw(raw: u32) -> Option<Self> {
                match raw {
                    $($num => Some(Self::$name),)*
                    _ => None,
                }
            }
        }
    };
}

syscalls! {
    Exit = 1,
    Read = 2,
    Write = 3,
    Open = 4,
    Close = 5,
    Lseek = 6,
    Fstat = 7,
    Stat = 8,
    Mkdir = 9,
    Unlink = 10,
    Realpath = 11,
    Pipe = 12,
    Fcntl = 13,
    Ioctl = 14,
    GetDirEntries = 15,
    Mmap = 16,
    Munmap = 17,
    Mprotect = 18,
    Madvise = 19,
    SetMmapName = 20,
    Fork = 21,
    Execve = 22,
    Waitpid = 23,
    Kill = 24,
    Usleep = 25,
    Getpid = 26,
    Gettid = 27,
    Getuid = 28,
    Getgid = 29,
    Setuid = 30,
    Setgid = 31,
    Getgroups = 32,
    Gethostname = 33,
    GetProcessName = 34,
    Getrandom = 35,
    Gettimeofday = 36,
    ClockGettime = 37,
    Socket = 38,
    Bind = 39,
    Connect = 40,
    Listen = 41,
    Accept = 42,
    Recvfrom = 43,
    Getsockopt = 44,
    Setsockopt = 45,
    Select = 46,
    Pledge = 47,
    Unveil = 48,
    Dbgputstr = 49,
    Dbgputch = 50,
    Fchmod = 51,
    ShbufCreate = 52,
    ShbufGet = 53,
    ShbufAllowPid = 54,
    ShbufAllowAll = 55,
    ShbufRelease = 56,
    ShbufSeal = 57,
    ShbufSetVolatile = 58,
}

/// The errno of the last failed host call, in the guest's negative-return
/// encoding.
fn neg_errno() -> u32 {
    let errno = std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO);
    (-errno) as u32
}

fn neg(errno: i32) -> u32 {
    (-errno) as u32
}

/// Encode a host return value: negative means errno.
fn host_result(rc: i64) -> u32 {
    if rc < 0 {
        neg_errno()
    } else {
        rc as u32
    }
}

/// View a plain-old-data host struct as bytes for `copy_to_vm`.
///
/// # Safety
///
/// `T` must have no padding requirements beyond byte access; the syscall
/// layer only uses this on `#[repr(C)]` kernel structs.
unsafe fn as_bytes<T>(value: &T) -> &[u8] {
    std::slice::from_raw_parts((value as *const T).cast::<u8>(), std::mem::size_of::<T>())
}

/// Mutable byte view, for filling host structs from guest memory.
///
/// # Safety
///
/// As [as_bytes]; additionally every bit pattern must be valid for `T`.
unsafe fn as_bytes_mut<T>(value: &mut T) -> &mut [u8] {
    std::slice::from_raw_parts_mut((value as *mut T).cast::<u8>(), std::mem::size_of::<T>())
}

/// Little-endian field cursor over a copied guest parameter struct.
struct Fields<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn u32(&mut self) -> u32 {
        let value = u32::from_le_bytes(self.buf[self.at..self.at + 4].try_into().unwrap());
        self.at += 4;
        value
    }

    fn i32(&mut self) -> i32 {
        self.u32() as i32
    }
}

impl Emulator {
    /// Entry point from the soft CPU's `INT 0x82` gate.
    pub fn virt_syscall(&mut self, function: u32, arg1: u32, arg2: u32, arg3: u32) -> Result<u32> {
        let Some(sysno) = Sysno::from_raw(function) else {
            report!("Unimplemented syscall: {function}");
            self.dump_backtrace();
            return Err(Error::UnimplementedSyscall { function });
        };

        match sysno {
            Sysno::Exit => {
                self.virt_exit(arg1 as i32);
                Ok(0)
            }
            Sysno::Read => self.virt_read(arg1 as i32, arg2, arg3 as i32),
            Sysno::Write => self.virt_write(arg1 as i32, arg2, arg3 as i32),
            Sysno::Open => self.virt_open(arg1),
            Sysno::Close => Ok(host_result(unsafe { libc::close(arg1 as i32) }.into())),
            Sysno::Lseek => Ok(host_result(unsafe {
                libc::lseek(arg1 as i32, (arg2 as i32).into(), arg3 as i32)
            })),
            Sysno::Fstat => self.virt_fstat(arg1 as i32, arg2),
            Sysno::Stat => self.virt_stat(arg1),
            Sysno::Mkdir => self.virt_mkdir(arg1, arg2, arg3),
            Sysno::Unlink => self.virt_unlink(arg1, arg2),
            Sysno::Realpath => self.virt_realpath(arg1),
            Sysno::Pipe => self.virt_pipe(arg1, arg2 as i32),
            Sysno::Fcntl => self.virt_fcntl(arg1 as i32, arg2 as i32, arg3),
            Sysno::Ioctl => self.virt_ioctl(arg1 as i32, arg2, arg3),
            Sysno::GetDirEntries => self.virt_get_dir_entries(arg1 as i32, arg2, arg3 as i32),
            Sysno::Mmap => self.virt_mmap(arg1),
            Sysno::Munmap => self.virt_munmap(arg1, arg2),
            Sysno::Mprotect | Sysno::Madvise | Sysno::Pledge | Sysno::Unveil
            | Sysno::SetMmapName => {
                // Accepted and ignored; the emulator neither enforces guest
                // page protection changes nor models the host policy layer.
                trace!("{sysno:?}(...) = 0 (noop)");
                Ok(0)
            }
            Sysno::Fork => self.virt_fork(),
            Sysno::Execve => self.virt_execve(arg1),
            Sysno::Waitpid => self.virt_waitpid(arg1 as i32, arg2, arg3 as i32),
            Sysno::Kill => Ok(host_result(
                unsafe { libc::kill(arg1 as i32, arg2 as i32) }.into(),
            )),
            Sysno::Usleep => Ok(host_result(unsafe { libc::usleep(arg1) }.into())),
            Sysno::Getpid => Ok(unsafe { libc::getpid() } as u32),
            Sysno::Gettid => Ok(unsafe { libc::syscall(libc::SYS_gettid) } as u32),
            Sysno::Getuid => Ok(unsafe { libc::getuid() }),
            Sysno::Getgid => Ok(unsafe { libc::getgid() }),
            Sysno::Setuid => Ok(host_result(unsafe { libc::setuid(arg1) }.into())),
            Sysno::Setgid => Ok(host_result(unsafe { libc::setgid(arg1) }.into())),
            Sysno::Getgroups => self.virt_getgroups(arg1 as i32, arg2),
            Sysno::Gethostname => self.virt_gethostname(arg1, arg2 as i32),
            Sysno::GetProcessName => self.virt_get_process_name(arg1, arg2 as i32),
            Sysno::Getrandom => self.virt_getrandom(arg1, arg2, arg3),
            Sysno::Gettimeofday => self.virt_gettimeofday(arg1),
            Sysno::ClockGettime => self.virt_clock_gettime(arg1 as i32, arg2),
            Sysno::Socket => Ok(host_result(
                unsafe { libc::socket(arg1 as i32, arg2 as i32, arg3 as i32) }.into(),
            )),
            Sysno::Bind => self.virt_bind(arg1 as i32, arg2, arg3),
            Sysno::Connect => self.virt_connect(arg1 as i32, arg2, arg3),
            Sysno::Listen => Ok(host_result(
                unsafe { libc::listen(arg1 as i32, arg2 as i32) }.into(),
            )),
            Sysno::Accept => self.virt_accept(arg1 as i32, arg2, arg3),
            Sysno::Recvfrom => self.virt_recvfrom(arg1),
            Sysno::Getsockopt => self.virt_getsockopt(arg1),
            Sysno::Setsockopt => self.virt_setsockopt(arg1),
            Sysno::Select => self.virt_select(arg1),
            Sysno::Dbgputstr => self.virt_dbgputstr(arg1, arg2),
            Sysno::Dbgputch => self.virt_dbgputch(arg1 as u8),
            Sysno::Fchmod => Ok(host_result(
                unsafe { libc::fchmod(arg1 as i32, arg2) }.into(),
            )),
            Sysno::ShbufCreate => self.virt_shbuf_create(arg1 as i32, arg2),
            Sysno::ShbufGet => self.virt_shbuf_get(arg1 as i32, arg2),
            Sysno::ShbufAllowPid => self.virt_shbuf_allow_pid(arg1 as i32, arg2 as i32),
            Sysno::ShbufAllowAll => self.virt_shbuf_allow_all(arg1 as i32),
            Sysno::ShbufRelease => self.virt_shbuf_release(arg1 as i32),
            Sysno::ShbufSeal => self.virt_shbuf_seal(arg1 as i32),
            Sysno::ShbufSetVolatile => self.virt_shbuf_set_volatile(arg1 as i32, arg2 != 0),
        }
    }

    /// Stage a guest path as a NUL-terminated host string. The inner result
    /// is the guest-facing errno encoding for invalid paths.
    fn staged_path(&self, ptr: u32, len: u32) -> Result<std::result::Result<CString, u32>> {
        if len > PATH_MAX {
            return Ok(Err(neg(libc::ENAMETOOLONG)));
        }
        let bytes = self.mmu.copy_buffer_from_vm(ptr, len)?;
        Ok(CString::new(bytes).map_err(|_| neg(libc::EINVAL)))
    }

    fn virt_exit(&mut self, status: i32) {
        report!("  {HIGHLIGHT}Syscall: exit({status}){RESET}, shutting down!");
        self.exit_status = status;
        self.shutdown = true;
    }

    fn virt_read(&mut self, fd: i32, buffer: u32, size: i32) -> Result<u32> {
        if size < 0 {
            return Ok(neg(libc::EINVAL));
        }
        let mut host_buffer = vec![0u8; size as usize];
        let rc = unsafe { libc::read(fd, host_buffer.as_mut_ptr().cast(), host_buffer.len()) };
        if rc < 0 {
            return Ok(neg_errno());
        }
        self.mmu.copy_to_vm(buffer, &host_buffer[..rc as usize])?;
        trace!("read({fd}, {buffer:#x}, {size}) = {rc}");
        Ok(rc as u32)
    }

    fn virt_write(&mut self, fd: i32, data: u32, size: i32) -> Result<u32> {
        if size < 0 {
            return Ok(neg(libc::EINVAL));
        }
        let buffer = self.mmu.copy_buffer_from_vm(data, size as u32)?;
        let rc = unsafe { libc::write(fd, buffer.as_ptr().cast(), buffer.len()) };
        trace!("write({fd}, {data:#x}, {size}) = {rc}");
        Ok(host_result(rc as i64))
    }

    fn virt_open(&mut self, params_addr: u32) -> Result<u32> {
        let params = self.mmu.copy_buffer_from_vm(params_addr, 20)?;
        let mut fields = Fields::new(&params);
        let dirfd = fields.i32();
        let path_ptr = fields.u32();
        let path_len = fields.u32();
        let options = fields.i32();
        let mode = fields.u32();

        let path = match self.staged_path(path_ptr, path_len)? {
            Ok(path) => path,
            Err(rc) => return Ok(rc),
        };
        let rc = unsafe { libc::openat(dirfd, path.as_ptr(), options, mode) };
        trace!("open({path:?}, {options:#x}, {mode:#o}) = {rc}");
        Ok(host_result(rc.into()))
    }

    fn virt_fstat(&mut self, fd: i32, statbuf: u32) -> Result<u32> {
        let mut host_statbuf: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(fd, &mut host_statbuf) };
        if rc < 0 {
            return Ok(neg_errno());
        }
        self.mmu
            .copy_to_vm(statbuf, unsafe { as_bytes(&host_statbuf) })?;
        trace!("fstat({fd}, {statbuf:#x}) = {rc}");
        Ok(rc as u32)
    }

    fn virt_stat(&mut self, params_addr: u32) -> Result<u32> {
        let params = self.mmu.copy_buffer_from_vm(params_addr, 16)?;
        let mut fields = Fields::new(&params);
        let path_ptr = fields.u32();
        let path_len = fields.u32();
        let statbuf = fields.u32();
        let follow_symlinks = fields.u32() != 0;

        let path = match self.staged_path(path_ptr, path_len)? {
            Ok(path) => path,
            Err(rc) => return Ok(rc),
        };
        let mut host_statbuf: libc::stat = unsafe { std::mem::zeroed() };
        let rc = if follow_symlinks {
            unsafe { libc::stat(path.as_ptr(), &mut host_statbuf) }
        } else {
            unsafe { libc::lstat(path.as_ptr(), &mut host_statbuf) }
        };
        if rc < 0 {
            return Ok(neg_errno());
        }
        self.mmu
            .copy_to_vm(statbuf, unsafe { as_bytes(&host_statbuf) })?;
        trace!("stat({path:?}, follow={follow_symlinks}) = {rc}");
        Ok(rc as u32)
    }

    fn virt_mkdir(&mut self, path: u32, path_length: u32, mode: u32) -> Result<u32> {
        let path = match self.staged_path(path, path_length)? {
            Ok(path) => path,
            Err(rc) => return Ok(rc),
        };
        let rc = unsafe { libc::mkdir(path.as_ptr(), mode) };
        trace!("mkdir({path:?}, {mode:#o}) = {rc}");
        Ok(host_result(rc.into()))
    }

    fn virt_unlink(&mut self, path: u32, path_length: u32) -> Result<u32> {
        let path = match self.staged_path(path, path_length)? {
            Ok(path) => path,
            Err(rc) => return Ok(rc),
        };
        let rc = unsafe { libc::unlink(path.as_ptr()) };
        trace!("unlink({path:?}) = {rc}");
        Ok(host_result(rc.into()))
    }

    fn virt_realpath(&mut self, params_addr: u32) -> Result<u32> {
        let params = self.mmu.copy_buffer_from_vm(params_addr, 16)?;
        let mut fields = Fields::new(&params);
        let path_ptr = fields.u32();
        let path_len = fields.u32();
        let buffer_ptr = fields.u32();
        let buffer_size = fields.u32();

        let path = match self.staged_path(path_ptr, path_len)? {
            Ok(path) => path,
            Err(rc) => return Ok(rc),
        };
        let mut host_buffer = [0u8; PATH_MAX as usize];
        let resolved =
            unsafe { libc::realpath(path.as_ptr(), host_buffer.as_mut_ptr().cast()) };
        if resolved.is_null() {
            return Ok(neg_errno());
        }
        let resolved_len = host_buffer.iter().position(|b| *b == 0).unwrap_or(0) + 1;
        let copy_len = resolved_len.min(buffer_size as usize);
        self.mmu
            .copy_to_vm(buffer_ptr, &host_buffer[..copy_len])?;
        trace!("realpath({path:?}) = 0");
        Ok(0)
    }

    fn virt_pipe(&mut self, pipefd: u32, flags: i32) -> Result<u32> {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), flags) };
        if rc < 0 {
            return Ok(neg_errno());
        }
        self.mmu.copy_to_vm(pipefd, unsafe { as_bytes(&fds) })?;
        trace!("pipe({:?}) = {rc}", fds);
        Ok(rc as u32)
    }

    /// Only commands with plain scalar semantics are forwarded; anything
    /// else must be looked at before it can be whitelisted.
    fn virt_fcntl(&mut self, fd: i32, cmd: i32, arg: u32) -> Result<u32> {
        match cmd {
            libc::F_DUPFD | libc::F_GETFD | libc::F_SETFD | libc::F_GETFL | libc::F_SETFL => {}
            _ => {
                report!("Unimplemented fcntl command: {cmd}");
                self.dump_backtrace();
                return Err(Error::UnimplementedFcntl { cmd });
            }
        }
        let rc = unsafe { libc::fcntl(fd, cmd, arg) };
        trace!("fcntl({fd}, {cmd}, {arg:#x}) = {rc}");
        Ok(host_result(rc.into()))
    }

    fn virt_ioctl(&mut self, fd: i32, request: u32, arg: u32) -> Result<u32> {
        if request as u64 == libc::TIOCGWINSZ {
            let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
            if rc < 0 {
                return Ok(neg_errno());
            }
            self.mmu.copy_to_vm(arg, unsafe { as_bytes(&ws) })?;
            trace!("ioctl({fd}, TIOCGWINSZ) = 0");
            return Ok(0);
        }
        report!("Unsupported ioctl: {request:#x}");
        self.dump_backtrace();
        Err(Error::UnimplementedIoctl { request })
    }

    fn virt_get_dir_entries(&mut self, fd: i32, buffer: u32, size: i32) -> Result<u32> {
        if size < 0 {
            return Ok(neg(libc::EINVAL));
        }
        let mut host_buffer = vec![0u8; size as usize];
        let rc = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                fd,
                host_buffer.as_mut_ptr(),
                host_buffer.len(),
            )
        };
        if rc < 0 {
            return Ok(neg_errno());
        }
        self.mmu.copy_to_vm(buffer, &host_buffer[..rc as usize])?;
        trace!("get_dir_entries({fd}, {buffer:#x}, {size}) = {rc}");
        Ok(rc as u32)
    }

    fn virt_mmap(&mut self, params_addr: u32) -> Result<u32> {
        let params = self.mmu.copy_buffer_from_vm(params_addr, 28)?;
        let mut fields = Fields::new(&params);
        let addr = fields.u32();
        let size = fields.u32();
        let alignment = fields.u32();
        let prot = fields.u32();
        let flags = fields.u32();
        let fd = fields.i32();
        let offset = fields.u32();

        if size == 0 {
            return Ok(neg(libc::EINVAL));
        }
        if addr != 0 {
            // Placement requests are not honoured; the arena decides.
            warn!("mmap with address hint {addr:#x} ignored");
        }

        let final_size = round_up_to_page(size);
        let final_address = self.arena.allocate(final_size, alignment.max(PAGE_SIZE))?;

        let mut region = if flags & MAP_ANONYMOUS != 0 {
            Region::mmap_anonymous(final_address, final_size, prot)
        } else {
            let mut contents = vec![0u8; final_size as usize];
            let rc = unsafe {
                libc::pread(
                    fd,
                    contents.as_mut_ptr().cast(),
                    contents.len(),
                    offset.into(),
                )
            };
            if rc < 0 {
                self.arena.release(final_address, final_size);
                return Ok(neg_errno());
            }
            contents.truncate(rc as usize);
            Region::mmap_file_backed(final_address, final_size, prot, flags, fd, offset, &contents)
        };
        region.readable = prot & PROT_READ != 0;
        region.writable = prot & PROT_WRITE != 0;
        region.executable = prot & PROT_EXEC != 0;
        self.mmu.add_region(region)?;

        trace!("mmap({size:#x}, prot={prot:#x}, flags={flags:#x}, fd={fd}) = {final_address:#010x}");
        Ok(final_address)
    }

    fn virt_munmap(&mut self, address: u32, size: u32) -> Result<u32> {
        let region = self
            .mmu
            .find_region(address)
            .ok_or(crate::mmu::Error::NoSuchRegion { addr: address })?;
        let base = region.base();
        let region_size = region.size();
        if region_size != round_up_to_page(size) {
            // Partial unmap of a region is not supported.
            return Err(Error::MunmapSizeMismatch {
                addr: address,
                size,
            });
        }
        self.mmu.remove_region(base)?;
        self.arena.release(base, region_size);
        trace!("munmap({address:#010x}, {size:#x}) = 0");
        Ok(0)
    }

    fn virt_fork(&mut self) -> Result<u32> {
        // Both sides of the fork keep emulating; the child gets its own copy
        // of guest memory through host copy-on-write.
        let rc = unsafe { libc::fork() };
        trace!("fork() = {rc}");
        Ok(host_result(rc.into()))
    }

    fn virt_execve(&mut self, params_addr: u32) -> Result<u32> {
        let params = self.mmu.copy_buffer_from_vm(params_addr, 24)?;
        let mut fields = Fields::new(&params);
        let path_ptr = fields.u32();
        let path_len = fields.u32();
        let argv_ptr = fields.u32();
        let argv_len = fields.u32();
        let envp_ptr = fields.u32();
        let envp_len = fields.u32();

        let path = match self.staged_path(path_ptr, path_len)? {
            Ok(path) => path,
            Err(rc) => return Ok(rc),
        };
        let arguments = self.copy_string_list(argv_ptr, argv_len)?;
        let environment = self.copy_string_list(envp_ptr, envp_len)?;

        report!("  {HIGHLIGHT}Syscall:{RESET} execve");
        report!("    - {path:?}");
        for argument in &arguments {
            report!("    - {}", String::from_utf8_lossy(argument));
        }

        // Re-execute the emulator itself so the new program stays
        // supervised.
        let emulator = std::env::current_exe()
            .ok()
            .and_then(|path| CString::new(path.into_os_string().into_encoded_bytes()).ok());
        let Some(emulator) = emulator else {
            return Ok(neg(libc::ENOENT));
        };

        let mut argv_strings = vec![emulator.clone(), path];
        // argv[0] of the guest is replaced by the program path; the
        // remaining guest arguments ride along unchanged.
        for argument in arguments.iter().skip(1) {
            let Ok(argument) = CString::new(argument.clone()) else {
                return Ok(neg(libc::EINVAL));
            };
            argv_strings.push(argument);
        }
        let mut envp_strings = Vec::with_capacity(environment.len());
        for variable in environment {
            let Ok(variable) = CString::new(variable) else {
                return Ok(neg(libc::EINVAL));
            };
            envp_strings.push(variable);
        }

        let mut argv: Vec<*const libc::c_char> =
            argv_strings.iter().map(|s| s.as_ptr()).collect();
        argv.push(std::ptr::null());
        let mut envp: Vec<*const libc::c_char> =
            envp_strings.iter().map(|s| s.as_ptr()).collect();
        envp.push(std::ptr::null());

        unsafe { libc::execve(emulator.as_ptr(), argv.as_ptr(), envp.as_ptr()) };
        // execve only returns on failure.
        Ok(neg_errno())
    }

    /// Deep-copy a guest `{ pointer, length }` string-list array.
    fn copy_string_list(&self, list_ptr: u32, list_len: u32) -> Result<Vec<Vec<u8>>> {
        let mut strings = Vec::with_capacity(list_len as usize);
        for i in 0..list_len {
            let entry = self
                .mmu
                .copy_buffer_from_vm(list_ptr.wrapping_add(i * 8), 8)?;
            let mut fields = Fields::new(&entry);
            let ptr = fields.u32();
            let len = fields.u32().min(PATH_MAX);
            strings.push(self.mmu.copy_buffer_from_vm(ptr, len)?);
        }
        Ok(strings)
    }

    fn virt_waitpid(&mut self, pid: i32, status_ptr: u32, options: i32) -> Result<u32> {
        let mut status = 0i32;
        let rc = unsafe { libc::waitpid(pid, &mut status, options) };
        if rc < 0 {
            return Ok(neg_errno());
        }
        if status_ptr != 0 {
            self.mmu.copy_to_vm(status_ptr, &status.to_le_bytes())?;
        }
        trace!("waitpid({pid}) = {rc}, status {status:#x}");
        Ok(rc as u32)
    }

    fn virt_getgroups(&mut self, count: i32, groups: u32) -> Result<u32> {
        if count < 0 {
            return Ok(neg(libc::EINVAL));
        }
        if count == 0 {
            return Ok(host_result(
                unsafe { libc::getgroups(0, std::ptr::null_mut()) }.into(),
            ));
        }
        let mut host_groups = vec![0 as libc::gid_t; count as usize];
        let rc = unsafe { libc::getgroups(count, host_groups.as_mut_ptr()) };
        if rc < 0 {
            return Ok(neg_errno());
        }
        let bytes: Vec<u8> = host_groups[..rc as usize]
            .iter()
            .flat_map(|gid| gid.to_le_bytes())
            .collect();
        self.mmu.copy_to_vm(groups, &bytes)?;
        trace!("getgroups({count}) = {rc}");
        Ok(rc as u32)
    }

    fn virt_gethostname(&mut self, buffer: u32, buffer_size: i32) -> Result<u32> {
        if buffer_size < 0 {
            return Ok(neg(libc::EINVAL));
        }
        let mut host_buffer = vec![0u8; buffer_size as usize];
        let rc = unsafe {
            libc::gethostname(host_buffer.as_mut_ptr().cast(), host_buffer.len())
        };
        if rc < 0 {
            return Ok(neg_errno());
        }
        self.mmu.copy_to_vm(buffer, &host_buffer)?;
        trace!("gethostname({buffer:#x}, {buffer_size}) = {rc}");
        Ok(rc as u32)
    }

    fn virt_get_process_name(&mut self, buffer: u32, size: i32) -> Result<u32> {
        if size < 0 {
            return Ok(neg(libc::EINVAL));
        }
        let mut name = [0u8; 16];
        let rc = unsafe { libc::prctl(libc::PR_GET_NAME, name.as_mut_ptr()) };
        if rc < 0 {
            return Ok(neg_errno());
        }
        let copy_len = name.len().min(size as usize);
        self.mmu.copy_to_vm(buffer, &name[..copy_len])?;
        Ok(0)
    }

    fn virt_getrandom(&mut self, buffer: u32, buffer_size: u32, flags: u32) -> Result<u32> {
        let mut host_buffer = vec![0u8; buffer_size as usize];
        let rc = unsafe {
            libc::getrandom(host_buffer.as_mut_ptr().cast(), host_buffer.len(), flags)
        };
        if rc < 0 {
            return Ok(neg_errno());
        }
        self.mmu.copy_to_vm(buffer, &host_buffer[..rc as usize])?;
        trace!("getrandom({buffer:#x}, {buffer_size}) = {rc}");
        Ok(rc as u32)
    }

    fn virt_gettimeofday(&mut self, timeval: u32) -> Result<u32> {
        let mut host_timeval: libc::timeval = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::gettimeofday(&mut host_timeval, std::ptr::null_mut()) };
        if rc < 0 {
            return Ok(neg_errno());
        }
        self.mmu
            .copy_to_vm(timeval, unsafe { as_bytes(&host_timeval) })?;
        Ok(rc as u32)
    }

    fn virt_clock_gettime(&mut self, clock_id: i32, timespec: u32) -> Result<u32> {
        let mut host_timespec: libc::timespec = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::clock_gettime(clock_id, &mut host_timespec) };
        if rc < 0 {
            return Ok(neg_errno());
        }
        self.mmu
            .copy_to_vm(timespec, unsafe { as_bytes(&host_timespec) })?;
        Ok(rc as u32)
    }

    fn virt_bind(&mut self, sockfd: i32, address: u32, address_length: u32) -> Result<u32> {
        let buffer = self.mmu.copy_buffer_from_vm(address, address_length)?;
        let rc = unsafe {
            libc::bind(
                sockfd,
                buffer.as_ptr().cast(),
                buffer.len() as libc::socklen_t,
            )
        };
        trace!("bind({sockfd}, {address:#x}, {address_length}) = {rc}");
        Ok(host_result(rc.into()))
    }

    fn virt_connect(&mut self, sockfd: i32, address: u32, address_size: u32) -> Result<u32> {
        let buffer = self.mmu.copy_buffer_from_vm(address, address_size)?;
        let rc = unsafe {
            libc::connect(
                sockfd,
                buffer.as_ptr().cast(),
                buffer.len() as libc::socklen_t,
            )
        };
        trace!("connect({sockfd}, {address:#x}, {address_size}) = {rc}");
        Ok(host_result(rc.into()))
    }

    fn virt_accept(&mut self, sockfd: i32, address: u32, address_length: u32) -> Result<u32> {
        let guest_length = if address_length != 0 {
            let bytes = self.mmu.copy_buffer_from_vm(address_length, 4)?;
            Fields::new(&bytes).u32()
        } else {
            0
        };

        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut host_length = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::accept(
                sockfd,
                if address != 0 {
                    (&mut storage as *mut libc::sockaddr_storage).cast()
                } else {
                    std::ptr::null_mut()
                },
                if address != 0 {
                    &mut host_length
                } else {
                    std::ptr::null_mut()
                },
            )
        };
        if rc < 0 {
            return Ok(neg_errno());
        }
        if address != 0 {
            let copy_len = (host_length as usize)
                .min(guest_length as usize)
                .min(std::mem::size_of::<libc::sockaddr_storage>());
            let bytes = unsafe { as_bytes(&storage) };
            self.mmu.copy_to_vm(address, &bytes[..copy_len])?;
        }
        if address_length != 0 {
            self.mmu
                .copy_to_vm(address_length, &(host_length as u32).to_le_bytes())?;
        }
        trace!("accept({sockfd}) = {rc}");
        Ok(rc as u32)
    }

    fn virt_recvfrom(&mut self, params_addr: u32) -> Result<u32> {
        let params = self.mmu.copy_buffer_from_vm(params_addr, 24)?;
        let mut fields = Fields::new(&params);
        let sockfd = fields.i32();
        let buffer_ptr = fields.u32();
        let buffer_len = fields.u32();
        let flags = fields.i32();
        let addr_ptr = fields.u32();
        let addr_length_ptr = fields.u32();

        let mut host_buffer = vec![0u8; buffer_len as usize];
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        // The guest's length lives behind the pointer field of the
        // parameter struct.
        let guest_addr_length = if addr_length_ptr != 0 {
            let bytes = self.mmu.copy_buffer_from_vm(addr_length_ptr, 4)?;
            Fields::new(&bytes).u32()
        } else {
            0
        };
        let mut host_addr_length =
            std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let rc = unsafe {
            libc::recvfrom(
                sockfd,
                host_buffer.as_mut_ptr().cast(),
                host_buffer.len(),
                flags,
                if addr_ptr != 0 {
                    (&mut storage as *mut libc::sockaddr_storage).cast()
                } else {
                    std::ptr::null_mut()
                },
                if addr_ptr != 0 {
                    &mut host_addr_length
                } else {
                    std::ptr::null_mut()
                },
            )
        };
        if rc < 0 {
            return Ok(neg_errno());
        }

        self.mmu
            .copy_to_vm(buffer_ptr, &host_buffer[..rc as usize])?;
        if addr_ptr != 0 {
            let copy_len = (host_addr_length as usize)
                .min(guest_addr_length as usize)
                .min(std::mem::size_of::<libc::sockaddr_storage>());
            let bytes = unsafe { as_bytes(&storage) };
            self.mmu.copy_to_vm(addr_ptr, &bytes[..copy_len])?;
        }
        if addr_length_ptr != 0 {
            self.mmu
                .copy_to_vm(addr_length_ptr, &(host_addr_length as u32).to_le_bytes())?;
        }
        trace!("recvfrom({sockfd}, {buffer_ptr:#x}, {buffer_len}) = {rc}");
        Ok(rc as u32)
    }

    fn virt_getsockopt(&mut self, params_addr: u32) -> Result<u32> {
        let params = self.mmu.copy_buffer_from_vm(params_addr, 20)?;
        let mut fields = Fields::new(&params);
        let sockfd = fields.i32();
        let level = fields.i32();
        let option = fields.i32();
        let value_ptr = fields.u32();
        let value_size = fields.u32();

        if level == libc::SOL_SOCKET && option == libc::SO_PEERCRED {
            let mut creds: libc::ucred = unsafe { std::mem::zeroed() };
            let mut creds_size = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    sockfd,
                    libc::SOL_SOCKET,
                    libc::SO_PEERCRED,
                    (&mut creds as *mut libc::ucred).cast(),
                    &mut creds_size,
                )
            };
            if rc < 0 {
                return Ok(neg_errno());
            }
            // Never write more than the guest said its buffer holds.
            let copy_len = (creds_size as usize).min(value_size as usize);
            let bytes = unsafe { as_bytes(&creds) };
            self.mmu.copy_to_vm(value_ptr, &bytes[..copy_len])?;
            trace!("getsockopt({sockfd}, SO_PEERCRED) = {rc}");
            return Ok(rc as u32);
        }

        report!("Unimplemented getsockopt option: level {level}, option {option}");
        self.dump_backtrace();
        Err(Error::UnimplementedSockopt { level, option })
    }

    fn virt_setsockopt(&mut self, params_addr: u32) -> Result<u32> {
        let params = self.mmu.copy_buffer_from_vm(params_addr, 20)?;
        let mut fields = Fields::new(&params);
        let sockfd = fields.i32();
        let level = fields.i32();
        let option = fields.i32();
        let value_ptr = fields.u32();
        let value_size = fields.u32();

        if level == libc::SOL_SOCKET && option == libc::SO_RCVTIMEO {
            if value_size as usize > 128 {
                return Ok(neg(libc::EINVAL));
            }
            let value = self.mmu.copy_buffer_from_vm(value_ptr, value_size)?;
            let rc = unsafe {
                libc::setsockopt(
                    sockfd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    value.as_ptr().cast(),
                    value.len() as libc::socklen_t,
                )
            };
            trace!("setsockopt({sockfd}, SO_RCVTIMEO) = {rc}");
            return Ok(host_result(rc.into()));
        }

        report!("Unimplemented setsockopt option: level {level}, option {option}");
        self.dump_backtrace();
        Err(Error::UnimplementedSockopt { level, option })
    }

    fn virt_select(&mut self, params_addr: u32) -> Result<u32> {
        let params = self.mmu.copy_buffer_from_vm(params_addr, 24)?;
        let mut fields = Fields::new(&params);
        let nfds = fields.i32();
        let readfds_ptr = fields.u32();
        let writefds_ptr = fields.u32();
        let exceptfds_ptr = fields.u32();
        let timeout_ptr = fields.u32();
        let sigmask_ptr = fields.u32();

        let mut readfds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut writefds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut exceptfds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut timeout: libc::timespec = unsafe { std::mem::zeroed() };
        let mut sigmask: libc::sigset_t = unsafe { std::mem::zeroed() };

        if readfds_ptr != 0 {
            self.mmu
                .copy_from_vm(unsafe { as_bytes_mut(&mut readfds) }, readfds_ptr)?;
        }
        if writefds_ptr != 0 {
            self.mmu
                .copy_from_vm(unsafe { as_bytes_mut(&mut writefds) }, writefds_ptr)?;
        }
        if exceptfds_ptr != 0 {
            self.mmu
                .copy_from_vm(unsafe { as_bytes_mut(&mut exceptfds) }, exceptfds_ptr)?;
        }
        if timeout_ptr != 0 {
            self.mmu
                .copy_from_vm(unsafe { as_bytes_mut(&mut timeout) }, timeout_ptr)?;
        }
        if sigmask_ptr != 0 {
            // The guest mask is a 32-bit word; it lands in the low bytes of
            // the host set.
            let bytes = self.mmu.copy_buffer_from_vm(sigmask_ptr, 4)?;
            (unsafe { as_bytes_mut(&mut sigmask) })[..4].copy_from_slice(&bytes);
        }

        let rc = unsafe {
            libc::pselect(
                nfds,
                if readfds_ptr != 0 { &mut readfds } else { std::ptr::null_mut() },
                if writefds_ptr != 0 { &mut writefds } else { std::ptr::null_mut() },
                if exceptfds_ptr != 0 { &mut exceptfds } else { std::ptr::null_mut() },
                if timeout_ptr != 0 { &timeout } else { std::ptr::null() },
                if sigmask_ptr != 0 { &sigmask } else { std::ptr::null() },
            )
        };
        if rc < 0 {
            return Ok(neg_errno());
        }

        if readfds_ptr != 0 {
            self.mmu
                .copy_to_vm(readfds_ptr, unsafe { as_bytes(&readfds) })?;
        }
        if writefds_ptr != 0 {
            self.mmu
                .copy_to_vm(writefds_ptr, unsafe { as_bytes(&writefds) })?;
        }
        if exceptfds_ptr != 0 {
            self.mmu
                .copy_to_vm(exceptfds_ptr, unsafe { as_bytes(&exceptfds) })?;
        }
        if timeout_ptr != 0 {
            self.mmu
                .copy_to_vm(timeout_ptr, unsafe { as_bytes(&timeout) })?;
        }
        trace!("select({nfds}) = {rc}");
        Ok(rc as u32)
    }

    fn virt_dbgputstr(&mut self, characters: u32, length: u32) -> Result<u32> {
        use std::io::Write;
        let buffer = self.mmu.copy_buffer_from_vm(characters, length)?;
        let _ = std::io::stderr().write_all(&buffer);
        Ok(0)
    }

    fn virt_dbgputch(&mut self, ch: u8) -> Result<u32> {
        use std::io::Write;
        let _ = std::io::stderr().write_all(&[ch]);
        Ok(0)
    }

    fn virt_shbuf_create(&mut self, size: i32, buffer_out: u32) -> Result<u32> {
        if size <= 0 {
            return Ok(neg(libc::EINVAL));
        }
        let rounded = round_up_to_page(size as u32);

        let fd = unsafe {
            libc::memfd_create(c"shbuf".as_ptr(), libc::MFD_ALLOW_SEALING)
        };
        if fd < 0 {
            return Ok(neg_errno());
        }
        if unsafe { libc::ftruncate(fd, rounded.into()) } < 0 {
            let rc = neg_errno();
            unsafe { libc::close(fd) };
            return Ok(rc);
        }
        let host_data = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                rounded as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if host_data == libc::MAP_FAILED {
            let rc = neg_errno();
            unsafe { libc::close(fd) };
            return Ok(rc);
        }

        let address = self.arena.allocate(rounded, PAGE_SIZE)?;
        // SAFETY: the mapping covers `rounded` bytes and the region takes
        // ownership of it.
        let region = unsafe { Region::shared_buffer(address, rounded, fd, host_data.cast()) };
        self.mmu.add_region(region)?;
        self.mmu.copy_to_vm(buffer_out, &address.to_le_bytes())?;
        trace!("shbuf_create({size}) = {fd}, guest {address:#010x}");
        Ok(fd as u32)
    }

    fn virt_shbuf_get(&mut self, shbuf_id: i32, size_ptr: u32) -> Result<u32> {
        let mut statbuf: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(shbuf_id, &mut statbuf) } < 0 {
            return Ok(neg_errno());
        }
        let size = statbuf.st_size as u32;
        let host_data = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                shbuf_id,
                0,
            )
        };
        if host_data == libc::MAP_FAILED {
            return Ok(neg_errno());
        }

        let address = self.arena.allocate(size, PAGE_SIZE)?;
        // SAFETY: as in `virt_shbuf_create`.
        let region = unsafe { Region::shared_buffer(address, size, shbuf_id, host_data.cast()) };
        self.mmu.add_region(region)?;
        self.mmu.copy_to_vm(size_ptr, &size.to_le_bytes())?;
        trace!("shbuf_get({shbuf_id}) = {address:#010x}, {size} bytes");
        Ok(address)
    }

    fn virt_shbuf_allow_pid(&mut self, shbuf_id: i32, peer_pid: i32) -> Result<u32> {
        let region = self
            .mmu
            .shbuf_region(shbuf_id)
            .ok_or(Error::UnknownSharedBuffer { id: shbuf_id })?;
        if let RegionKind::SharedBuffer { sealed: true, .. } = region.kind() {
            return Ok(neg(libc::EPERM));
        }
        // There is no host-side peer ACL to forward to; accepting the pid is
        // the whole contract.
        trace!("shbuf_allow_pid({shbuf_id}, {peer_pid}) = 0");
        Ok(0)
    }

    fn virt_shbuf_allow_all(&mut self, shbuf_id: i32) -> Result<u32> {
        self.mmu
            .shbuf_region(shbuf_id)
            .ok_or(Error::UnknownSharedBuffer { id: shbuf_id })?;
        trace!("shbuf_allow_all({shbuf_id}) = 0");
        Ok(0)
    }

    fn virt_shbuf_release(&mut self, shbuf_id: i32) -> Result<u32> {
        let region = self
            .mmu
            .shbuf_region(shbuf_id)
            .ok_or(Error::UnknownSharedBuffer { id: shbuf_id })?;
        let base = region.base();
        let size = region.size();
        // Dropping the region unmaps the host aliasing.
        self.mmu.remove_region(base)?;
        self.arena.release(base, size);
        unsafe { libc::close(shbuf_id) };
        trace!("shbuf_release({shbuf_id}) = 0");
        Ok(0)
    }

    fn virt_shbuf_seal(&mut self, shbuf_id: i32) -> Result<u32> {
        let region = self
            .mmu
            .shbuf_region_mut(shbuf_id)
            .ok_or(Error::UnknownSharedBuffer { id: shbuf_id })?;
        let RegionKind::SharedBuffer { sealed, .. } = region.kind_mut() else {
            unreachable!("shbuf index returned a non-shared-buffer region");
        };
        let rc = unsafe {
            libc::fcntl(
                shbuf_id,
                libc::F_ADD_SEALS,
                libc::F_SEAL_SHRINK | libc::F_SEAL_GROW,
            )
        };
        if rc < 0 {
            return Ok(neg_errno());
        }
        *sealed = true;
        trace!("shbuf_seal({shbuf_id}) = 0");
        Ok(0)
    }

    fn virt_shbuf_set_volatile(&mut self, shbuf_id: i32, is_volatile: bool) -> Result<u32> {
        let region = self
            .mmu
            .shbuf_region_mut(shbuf_id)
            .ok_or(Error::UnknownSharedBuffer { id: shbuf_id })?;
        let RegionKind::SharedBuffer { volatile, .. } = region.kind_mut() else {
            unreachable!("shbuf index returned a non-shared-buffer region");
        };
        *volatile = is_volatile;
        trace!("shbuf_set_volatile({shbuf_id}, {is_volatile}) = 0");
        Ok(0)
    }
}
