//! Allocation tracking for the leak report.
//!
//! The dispatch loop drives this through two hooks: `target_did_malloc` when
//! a call into the guest's `malloc` returns, and `target_did_free` when the
//! guest enters `free`. Freed entries are kept so double frees can be told
//! apart from frees of never-allocated pointers.

use std::collections::BTreeMap;

use crate::report::report;

#[derive(Debug, Clone)]
pub struct Allocation {
    pub address: u32,
    pub size: u32,
    pub freed: bool,
    /// Guest return addresses at the time of allocation.
    pub backtrace: Vec<u32>,
}

#[derive(Default)]
pub struct MallocTracer {
    allocations: BTreeMap<u32, Allocation>,
}

impl MallocTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_did_malloc(&mut self, address: u32, size: u32, backtrace: Vec<u32>) {
        if address == 0 {
            // Failed allocation; nothing to track.
            return;
        }
        let previous = self.allocations.insert(
            address,
            Allocation {
                address,
                size,
                freed: false,
                backtrace,
            },
        );
        if let Some(previous) = previous {
            if !previous.freed {
                report!(
                    "malloc({size}) returned {address:#010x} which is already a live allocation"
                );
            }
        }
    }

    pub fn target_did_free(&mut self, address: u32) {
        if address == 0 {
            // free(NULL) is a no-op.
            return;
        }
        match self.allocations.get_mut(&address) {
            Some(allocation) if allocation.freed => {
                report!("double free of {address:#010x}");
            }
            Some(allocation) => allocation.freed = true,
            None => {
                report!("free of untracked pointer {address:#010x}");
            }
        }
    }

    /// Live allocations at shutdown.
    pub fn leaks(&self) -> Vec<&Allocation> {
        self.allocations
            .values()
            .filter(|allocation| !allocation.freed)
            .collect()
    }

    /// Print the leak report. `describe_frame` renders one backtrace
    /// address; symbolication lives with the emulator, not here.
    pub fn dump_leak_report(&self, describe_frame: impl Fn(u32) -> String) {
        let leaks = self.leaks();
        if leaks.is_empty() {
            report!("No leaks detected");
            return;
        }

        let mut total = 0u64;
        for leak in &leaks {
            report!(
                "Leak of {size} byte(s) at {address:#010x}, allocated at:",
                size = leak.size,
                address = leak.address
            );
            for frame in &leak.backtrace {
                report!("    {}", describe_frame(*frame));
            }
            total += u64::from(leak.size);
        }
        report!("{} leak(s) found, {total} byte(s) total", leaks.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_free_pairs_leave_no_leaks() {
        let mut tracer = MallocTracer::new();
        tracer.target_did_malloc(0x5000, 16, vec![]);
        tracer.target_did_free(0x5000);
        assert!(tracer.leaks().is_empty());
    }

    #[test]
    fn unfreed_allocation_is_a_leak() {
        let mut tracer = MallocTracer::new();
        tracer.target_did_malloc(0x5000, 16, vec![0x1000]);
        tracer.target_did_malloc(0x6000, 32, vec![0x1004]);
        tracer.target_did_free(0x6000);
        let leaks = tracer.leaks();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].address, 0x5000);
        assert_eq!(leaks[0].size, 16);
    }

    #[test]
    fn free_of_null_is_ignored() {
        let mut tracer = MallocTracer::new();
        tracer.target_did_free(0);
        assert!(tracer.leaks().is_empty());
    }

    #[test]
    fn address_reuse_after_free_is_tracked() {
        let mut tracer = MallocTracer::new();
        tracer.target_did_malloc(0x5000, 16, vec![]);
        tracer.target_did_free(0x5000);
        tracer.target_did_malloc(0x5000, 24, vec![]);
        let leaks = tracer.leaks();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].size, 24);
    }
}
