//! KVM hardware virtualization backend
//!
//! Guest memory is mapped directly into a VM with dirty logging enabled,
//! so a restore only copies the pages the guest actually wrote. Control
//! returns on hypervisor exits; a periodic SIGALRM kick interrupts
//! `KVM_RUN` so the wall-clock limit can fire even when the guest never
//! exits on its own.

use kvm_bindings::{
    kvm_clear_dirty_log, kvm_clear_dirty_log__bindgen_ty_1, kvm_dtable, kvm_enable_cap, kvm_fpu,
    kvm_guest_debug, kvm_msr_entry, kvm_regs, kvm_segment, kvm_userspace_memory_region, Msrs,
    KVMIO, KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP, KVM_GUESTDBG_USE_SW_BP,
    KVM_MAX_CPUID_ENTRIES, KVM_MEM_LOG_DIRTY_PAGES,
};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use rustc_hash::FxHashSet;
use vmm_sys_util::ioctl::{ioctl_with_ref, ioctl_with_val};

use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::addrs::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::backend::{
    page_fault_kind, Backend, BackendType, Error, Fault, FaultKind, RunOutcome,
};
use crate::config::Config;
use crate::memory::Memory;
use crate::regs::{GuestRegs, Segment};
use crate::snapshot::Snapshot;
use crate::timer;
use crate::trace::{TraceType, Tracer};
use crate::{FxIndexSet, KICK_GUEST};

/// Expression that calculates an ioctl number
macro_rules! ioctl_expr {
    ($dir:expr, $ty:expr, $nr:expr, $size:expr) => {
        (($dir << vmm_sys_util::ioctl::_IOC_DIRSHIFT)
            | ($ty << vmm_sys_util::ioctl::_IOC_TYPESHIFT)
            | ($nr << vmm_sys_util::ioctl::_IOC_NRSHIFT)
            | ($size << vmm_sys_util::ioctl::_IOC_SIZESHIFT)) as ::std::os::raw::c_ulong
    };
}

/// Declare a function that returns an ioctl number
macro_rules! ioctl_ioc_nr {
    ($name:ident, $dir:expr, $ty:expr, $nr:expr, $size:expr) => {
        #[allow(non_snake_case)]
        #[allow(clippy::cast_lossless)]
        fn $name() -> ::std::os::raw::c_ulong {
            ioctl_expr!($dir, $ty, $nr, $size)
        }
    };
}

/// Declare an ioctl that reads and writes data
macro_rules! ioctl_iowr_nr {
    ($name:ident, $ty:expr, $nr:expr, $size:ty) => {
        ioctl_ioc_nr!(
            $name,
            vmm_sys_util::ioctl::_IOC_READ | vmm_sys_util::ioctl::_IOC_WRITE,
            $ty,
            $nr,
            ::std::mem::size_of::<$size>() as u32
        );
    };
}

/// Declare an ioctl that transfers no data
macro_rules! ioctl_io_nr {
    ($name:ident, $ty:expr, $nr:expr) => {
        ioctl_ioc_nr!($name, vmm_sys_util::ioctl::_IOC_NONE, $ty, $nr, 0);
    };
}

ioctl_iowr_nr!(KVM_CLEAR_DIRTY_LOG, KVMIO, 0xc0, kvm_clear_dirty_log);
ioctl_io_nr!(KVM_CHECK_EXTENSION, KVMIO, 0x03);

/// `KVM_CAP_MANUAL_DIRTY_LOG_PROTECT2`: get/clear dirty log split so the
/// log can be harvested without blanket write protection
const KVM_CAP_MANUAL_DIRTY_LOG_PROTECT2: u64 = 168;

const MSR_IA32_TSC: u32 = 0x10;
const MSR_IA32_SYSENTER_CS: u32 = 0x174;
const MSR_IA32_SYSENTER_ESP: u32 = 0x175;
const MSR_IA32_SYSENTER_EIP: u32 = 0x176;
const MSR_IA32_PAT: u32 = 0x277;
const MSR_STAR: u32 = 0xc000_0081;
const MSR_LSTAR: u32 = 0xc000_0082;
const MSR_CSTAR: u32 = 0xc000_0083;
const MSR_SFMASK: u32 = 0xc000_0084;
const MSR_KERNEL_GS_BASE: u32 = 0xc000_0102;

/// Breakpoint exception vector reported in debug exits
const BP_VECTOR: u32 = 3;

/// The KVM execution backend
pub struct KvmBackend {
    _kvm: Kvm,
    vm: VmFd,
    vcpu: VcpuFd,

    /// Guest memory, registered with the VM
    memory: Memory,

    /// Clean baseline shared with the snapshot
    clean: Arc<RwLock<Memory>>,

    /// Sanitized register baseline applied on every restore
    baseline_regs: GuestRegs,

    /// Host-visible register state, synced back after each run
    regs: GuestRegs,

    config: Config,
    reset_addresses: FxHashSet<u64>,

    /// Wall clock limit in seconds. Zero disables limiting.
    limit_secs: u64,

    trace_type: TraceType,
    tracer: Tracer,
    single_step: bool,
    restored_once: bool,

    /// Whether the host supports split get/clear dirty logging
    manual_dirty_log: bool,

    /// Pages in the one registered memory slot
    slot_pages: u32,
}

fn kvm_segment_from(seg: &Segment) -> kvm_segment {
    kvm_segment {
        base: seg.base,
        limit: seg.limit,
        selector: seg.selector,
        type_: seg.type_(),
        present: seg.present(),
        dpl: seg.dpl(),
        db: seg.db(),
        s: seg.s(),
        l: seg.l(),
        g: seg.g(),
        avl: seg.avl(),
        unusable: u8::from(seg.present() == 0),
        padding: 0,
    }
}

impl KvmBackend {
    /// Bind a KVM VM to the snapshot: create the VM and vCPU, register the
    /// guest memory with dirty logging, and start the kick timer
    pub fn new(snapshot: &Snapshot) -> Result<Self, Error> {
        let kvm =
            Kvm::new().map_err(|err| Error::Unavailable(BackendType::Kvm, err.to_string()))?;

        let vm = kvm.create_vm()?;

        let clean = snapshot.memory.clone();
        let mut memory = {
            let guard = clean
                .read()
                .map_err(|_| Error::Restore("clean snapshot lock poisoned".to_string()))?;
            guard.duplicate()?
        };

        let region = kvm_userspace_memory_region {
            slot: 0,
            flags: KVM_MEM_LOG_DIRTY_PAGES,
            guest_phys_addr: 0,
            memory_size: memory.size(),
            userspace_addr: memory.host_addr(),
        };

        // Safe because the backing mapping lives as long as the VmFd
        unsafe { vm.set_user_memory_region(region)? };

        let manual_dirty_log =
            unsafe { ioctl_with_val(&kvm, KVM_CHECK_EXTENSION(), KVM_CAP_MANUAL_DIRTY_LOG_PROTECT2) }
                > 0;

        if manual_dirty_log {
            let mut cap = kvm_enable_cap::default();
            cap.cap = u32::try_from(KVM_CAP_MANUAL_DIRTY_LOG_PROTECT2)
                .map_err(|err| Error::Hypervisor(err.to_string()))?;
            cap.args[0] = 1;
            vm.enable_cap(&cap)?;
        }

        let vcpu = vm.create_vcpu(0)?;
        let cpuid = kvm.get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)?;
        vcpu.set_cpuid2(&cpuid)?;

        timer::init_kick_timer().map_err(|err| Error::Hypervisor(err.to_string()))?;

        let slot_pages = u32::try_from(memory.size() / PAGE_SIZE)
            .map_err(|err| Error::Hypervisor(err.to_string()))?;

        let reset_addresses = snapshot
            .config
            .reset_addresses
            .iter()
            .map(|addr| addr.0)
            .collect();

        Ok(Self {
            _kvm: kvm,
            vm,
            vcpu,
            memory,
            clean,
            baseline_regs: snapshot.regs.clone(),
            regs: snapshot.regs.clone(),
            config: snapshot.config.clone(),
            reset_addresses,
            limit_secs: 0,
            trace_type: TraceType::None,
            tracer: Tracer::new(TraceType::None),
            single_step: false,
            restored_once: false,
            manual_dirty_log,
            slot_pages,
        })
    }

    /// Push the host-visible general purpose registers into the vCPU
    fn load_regs(&self) -> Result<(), Error> {
        let r = &self.regs;
        let regs = kvm_regs {
            rax: r.rax,
            rbx: r.rbx,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            rsp: r.rsp,
            rbp: r.rbp,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
            rip: r.rip,
            // Bit 1 is fixed
            rflags: r.rflags | 2,
        };
        self.vcpu.set_regs(&regs)?;
        Ok(())
    }

    /// Seed segment, control, and table registers from the baseline
    fn load_sregs(&self) -> Result<(), Error> {
        let b = &self.baseline_regs;
        let mut sregs = self.vcpu.get_sregs()?;

        sregs.cs = kvm_segment_from(&b.cs);
        sregs.ds = kvm_segment_from(&b.ds);
        sregs.es = kvm_segment_from(&b.es);
        sregs.fs = kvm_segment_from(&b.fs);
        sregs.gs = kvm_segment_from(&b.gs);
        sregs.ss = kvm_segment_from(&b.ss);
        sregs.tr = kvm_segment_from(&b.tr);
        sregs.ldt = kvm_segment_from(&b.ldtr);

        sregs.gdt = kvm_dtable {
            base: b.gdtr.base,
            limit: b.gdtr.limit,
            padding: [0; 3],
        };
        sregs.idt = kvm_dtable {
            base: b.idtr.base,
            limit: b.idtr.limit,
            padding: [0; 3],
        };

        sregs.cr0 = b.cr0;
        sregs.cr2 = b.cr2;
        sregs.cr3 = b.cr3;
        sregs.cr4 = b.cr4;
        sregs.cr8 = b.cr8;
        sregs.efer = b.efer;
        sregs.apic_base = b.apic_base;

        self.vcpu.set_sregs(&sregs)?;
        Ok(())
    }

    /// Seed the model specific registers from the baseline
    fn load_msrs(&self) -> Result<(), Error> {
        let b = &self.baseline_regs;
        let entries = [
            kvm_msr_entry {
                index: MSR_IA32_TSC,
                data: b.tsc,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_IA32_SYSENTER_CS,
                data: b.sysenter_cs,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_IA32_SYSENTER_ESP,
                data: b.sysenter_esp,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_IA32_SYSENTER_EIP,
                data: b.sysenter_eip,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_IA32_PAT,
                data: b.pat,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_STAR,
                data: b.star,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_LSTAR,
                data: b.lstar,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_CSTAR,
                data: b.cstar,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_SFMASK,
                data: b.sfmask,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_KERNEL_GS_BASE,
                data: b.kernel_gs_base,
                ..Default::default()
            },
        ];

        let msrs =
            Msrs::from_entries(&entries).map_err(|err| Error::Hypervisor(format!("{err:?}")))?;
        self.vcpu.set_msrs(&msrs)?;
        Ok(())
    }

    /// Seed the FPU state from the baseline
    fn load_fpu(&self) -> Result<(), Error> {
        let b = &self.baseline_regs;
        let mut fpu = kvm_fpu {
            fcw: b.fpcw,
            fsw: b.fpsw,
            ftwx: (b.fptw & 0xff) as u8,
            mxcsr: b.mxcsr,
            ..Default::default()
        };

        for (i, val) in b.fpst.iter().enumerate() {
            fpu.fpr[i][..8].copy_from_slice(&val[0].to_le_bytes());
            fpu.fpr[i][8..16].copy_from_slice(&val[1].to_le_bytes());
        }
        for (i, val) in b.xmm.iter().enumerate() {
            fpu.xmm[i][..8].copy_from_slice(&val[0].to_le_bytes());
            fpu.xmm[i][8..16].copy_from_slice(&val[1].to_le_bytes());
        }

        self.vcpu.set_fpu(&fpu)?;
        Ok(())
    }

    /// Configure single step and software breakpoint trapping
    fn load_guest_debug(&self) -> Result<(), Error> {
        let mut control = 0;
        if self.single_step {
            control |= KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP;
        }
        if !self.reset_addresses.is_empty() {
            control |= KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_USE_SW_BP;
        }

        let dbg = kvm_guest_debug {
            control,
            ..Default::default()
        };
        self.vcpu.set_guest_debug(&dbg)?;
        Ok(())
    }

    /// Pull the guest registers back into the host-visible copy
    fn sync_regs(&mut self) -> Result<(), Error> {
        let regs = self.vcpu.get_regs()?;
        let r = &mut self.regs;
        r.rax = regs.rax;
        r.rbx = regs.rbx;
        r.rcx = regs.rcx;
        r.rdx = regs.rdx;
        r.rsi = regs.rsi;
        r.rdi = regs.rdi;
        r.rsp = regs.rsp;
        r.rbp = regs.rbp;
        r.r8 = regs.r8;
        r.r9 = regs.r9;
        r.r10 = regs.r10;
        r.r11 = regs.r11;
        r.r12 = regs.r12;
        r.r13 = regs.r13;
        r.r14 = regs.r14;
        r.r15 = regs.r15;
        r.rip = regs.rip;
        r.rflags = regs.rflags;
        Ok(())
    }

    /// Fold the pages KVM logged as written by the guest into the memory's
    /// own dirty set, then clear the log so the next run starts with a
    /// clean slate. Runs after every `KVM_RUN` so `dirty_pages` reflects
    /// guest writes, and again on restore to catch aborted runs.
    fn harvest_dirty_log(&mut self) -> Result<usize, Error> {
        let mut bitmap = self
            .vm
            .get_dirty_log(0, usize::try_from(self.memory.size()).unwrap_or(usize::MAX))?;

        let mut harvested = 0;
        for (word_index, word) in bitmap.iter().enumerate() {
            let mut word = *word;
            while word != 0 {
                let bit = word.trailing_zeros();
                word &= word - 1;

                let page_index = word_index as u64 * 64 + u64::from(bit);
                self.memory.set_dirty(PhysAddr(page_index * PAGE_SIZE));
                harvested += 1;
            }
        }

        if self.manual_dirty_log && harvested > 0 {
            let clear = kvm_clear_dirty_log {
                slot: 0,
                num_pages: self.slot_pages,
                first_page: 0,
                __bindgen_anon_1: kvm_clear_dirty_log__bindgen_ty_1 {
                    dirty_bitmap: bitmap.as_mut_ptr().cast::<libc::c_void>(),
                },
            };

            // Safe because the fd is a VM fd and the bitmap covers the slot
            let ret = unsafe { ioctl_with_ref(&self.vm, KVM_CLEAR_DIRTY_LOG(), &clear) };
            if ret != 0 {
                return Err(Error::Restore(format!(
                    "KVM_CLEAR_DIRTY_LOG failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }

        Ok(harvested)
    }

    /// Patch an `int3` over each reset address. Goes through a physical
    /// write since snapshot code pages are usually read-only to the guest.
    fn plant_reset_breakpoints(&mut self) -> Result<(), Error> {
        let cr3 = self.baseline_regs.cr3();
        let addrs: Vec<u64> = self.reset_addresses.iter().copied().collect();

        for addr in addrs {
            let virt = VirtAddr(addr);
            let translation = self.memory.translate(virt, cr3);
            let Some(phys) = translation.phys_addr() else {
                return Err(Error::Memory(
                    crate::memory::Error::WriteToUnmappedVirtualAddress(virt),
                ));
            };
            self.memory.write_phys_dirty(phys, &[0xcc])?;
        }

        Ok(())
    }

    /// Classify a triple fault from the queued exception state
    fn classify_shutdown(&mut self) -> Result<RunOutcome, Error> {
        let events = self.vcpu.get_vcpu_events()?;
        let sregs = self.vcpu.get_sregs()?;
        self.sync_regs()?;
        let ip = VirtAddr(self.regs.rip);

        let fault = match u32::from(events.exception.nr) {
            14 => Fault {
                kind: page_fault_kind(events.exception.error_code),
                addr: VirtAddr(sregs.cr2),
                ip,
            },
            6 => Fault {
                kind: FaultKind::InvalidOpcode,
                addr: VirtAddr(0),
                ip,
            },
            0 => Fault {
                kind: FaultKind::DivideError,
                addr: VirtAddr(0),
                ip,
            },
            vector => Fault {
                kind: FaultKind::Unknown(vector),
                addr: VirtAddr(sregs.cr2),
                ip,
            },
        };

        Ok(RunOutcome::Crashed(fault))
    }

    fn limit(&self) -> Option<Duration> {
        (self.limit_secs != 0).then(|| Duration::from_secs(self.limit_secs))
    }
}

impl Backend for KvmBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Kvm
    }

    fn set_limit(&mut self, limit: u64) {
        self.limit_secs = limit;
    }

    fn set_trace_type(&mut self, kind: TraceType) -> Result<(), Error> {
        if self.restored_once {
            return Err(Error::ConfiguredAfterRestore("trace type"));
        }
        if !BackendType::Kvm.supports_trace_type(kind) {
            return Err(Error::UnsupportedCapability(
                BackendType::Kvm,
                "tenet traces",
            ));
        }
        self.trace_type = kind;
        self.tracer = Tracer::new(kind);
        Ok(())
    }

    fn enable_single_step(&mut self) -> Result<(), Error> {
        if self.restored_once {
            return Err(Error::ConfiguredAfterRestore("single step"));
        }
        // Trap-based stepping is only worth its cost for plain rip traces
        if self.trace_type != TraceType::Rip {
            return Err(Error::UnsupportedCapability(
                BackendType::Kvm,
                "single step outside rip traces",
            ));
        }
        self.single_step = true;
        Ok(())
    }

    fn enable_edge_coverage(&mut self) -> Result<(), Error> {
        Err(Error::UnsupportedCapability(
            BackendType::Kvm,
            "edge coverage",
        ))
    }

    fn restore(&mut self) -> Result<(), Error> {
        let clean = self.clean.clone();
        let clean = clean
            .read()
            .map_err(|_| Error::Restore("clean snapshot lock poisoned".to_string()))?;

        // Catch guest writes from a run that never reached its own harvest
        let guest_pages = self.harvest_dirty_log()?;
        let restored = self
            .memory
            .restore_from(&clean)
            .map_err(|err| Error::Restore(err.to_string()))?;
        drop(clean);

        log::trace!("kvm restore reverted {restored} pages ({guest_pages} late harvested)");

        self.regs = self.baseline_regs.clone();
        self.load_regs()?;
        self.load_sregs()?;
        self.load_msrs()?;
        self.load_fpu()?;
        self.load_guest_debug()?;

        self.plant_reset_breakpoints()?;

        self.tracer = Tracer::new(self.trace_type);
        self.restored_once = true;
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn run(&mut self, input: &[u8]) -> Result<RunOutcome, Error> {
        if !input.is_empty() {
            let addr = self.config.input_addr.ok_or(Error::NoInputAddress)?;
            if input.len() > self.config.max_input_size {
                return Err(Error::InputTooLarge(input.len(), self.config.max_input_size));
            }

            let cr3 = self.regs.cr3();
            self.memory.write_bytes_dirty(addr, cr3, input)?;
            if let Some(len_addr) = self.config.input_len_addr {
                self.memory.write_u64_dirty(len_addr, cr3, input.len() as u64)?;
            }
        }

        // Harness code may have adjusted registers since the restore
        self.load_regs()?;

        let start = Instant::now();
        let limit = self.limit();

        timer::unblock_sigalrm().map_err(|err| Error::Hypervisor(err.to_string()))?;

        let outcome = loop {
            match self.vcpu.run() {
                Ok(VcpuExit::Hlt) => break RunOutcome::Completed,

                Ok(VcpuExit::Debug(debug)) => {
                    let rip = debug.pc;

                    if debug.exception == BP_VECTOR {
                        if self.reset_addresses.contains(&rip) {
                            break RunOutcome::Completed;
                        }
                        break RunOutcome::Crashed(Fault {
                            kind: FaultKind::Breakpoint,
                            addr: VirtAddr(0),
                            ip: VirtAddr(rip),
                        });
                    }

                    // Single step trap
                    self.tracer.record_rip(VirtAddr(rip));

                    if let Some(limit) = limit {
                        if start.elapsed() >= limit {
                            break RunOutcome::LimitExceeded;
                        }
                    }
                }

                Ok(
                    VcpuExit::IoIn(..)
                    | VcpuExit::IoOut(..)
                    | VcpuExit::MmioRead(..)
                    | VcpuExit::MmioWrite(..),
                ) => {
                    self.sync_regs()?;
                    break RunOutcome::Crashed(Fault {
                        kind: FaultKind::UnexpectedIo,
                        addr: VirtAddr(0),
                        ip: VirtAddr(self.regs.rip),
                    });
                }

                Ok(VcpuExit::Shutdown) => break self.classify_shutdown()?,

                Ok(VcpuExit::FailEntry(reason, cpu)) => {
                    timer::block_sigalrm().ok();
                    return Err(Error::Hypervisor(format!(
                        "KVM_RUN entry failure: reason {reason:#x} on cpu {cpu}"
                    )));
                }

                Ok(VcpuExit::InternalError) => {
                    timer::block_sigalrm().ok();
                    return Err(Error::Hypervisor("KVM internal error".to_string()));
                }

                Ok(other) => {
                    timer::block_sigalrm().ok();
                    return Err(Error::Hypervisor(format!("unexpected exit: {other:?}")));
                }

                Err(err) if err.errno() == libc::EINTR => {
                    // Kick timer fired
                    KICK_GUEST.store(false, Ordering::SeqCst);
                    if let Some(limit) = limit {
                        if start.elapsed() >= limit {
                            break RunOutcome::LimitExceeded;
                        }
                    }
                }

                Err(err) => {
                    timer::block_sigalrm().ok();
                    return Err(Error::Kvm(err));
                }
            }
        };

        timer::block_sigalrm().map_err(|err| Error::Hypervisor(err.to_string()))?;

        self.sync_regs()?;

        // Fold guest writes into the dirty set so dirty_pages sees them
        self.harvest_dirty_log()?;

        // Coarse coverage: the exit rip always lands in the trace
        self.tracer.record_rip(VirtAddr(self.regs.rip));

        log::debug!("kvm run: {outcome} after {:?}", start.elapsed());
        Ok(outcome)
    }

    fn regs(&self) -> &GuestRegs {
        &self.regs
    }

    fn regs_mut(&mut self) -> &mut GuestRegs {
        &mut self.regs
    }

    fn read_bytes(&mut self, addr: VirtAddr, buf: &mut [u8]) -> Result<(), Error> {
        let cr3 = self.regs.cr3();
        Ok(self.memory.read_bytes(addr, cr3, buf)?)
    }

    fn write_bytes(&mut self, addr: VirtAddr, bytes: &[u8]) -> Result<(), Error> {
        let cr3 = self.regs.cr3();
        Ok(self.memory.write_bytes_dirty(addr, cr3, bytes)?)
    }

    fn take_trace(&mut self) -> Tracer {
        std::mem::replace(&mut self.tracer, Tracer::new(self.trace_type))
    }

    fn edges(&self) -> Option<&FxIndexSet<(VirtAddr, VirtAddr)>> {
        None
    }

    fn dirty_pages(&self) -> usize {
        self.memory.dirty_pages().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    /// These tests only run on hosts with a usable /dev/kvm
    fn kvm_available() -> bool {
        Kvm::new().is_ok()
    }

    #[test]
    fn capability_gating_rejects_edge_coverage_and_tenet() {
        if !kvm_available() {
            return;
        }

        let snapshot = testutil::snapshot_with_code(&[0xf4]);
        let mut backend = KvmBackend::new(&snapshot).unwrap();

        assert!(matches!(
            backend.enable_edge_coverage(),
            Err(Error::UnsupportedCapability(BackendType::Kvm, _))
        ));
        assert!(matches!(
            backend.set_trace_type(TraceType::Tenet),
            Err(Error::UnsupportedCapability(BackendType::Kvm, _))
        ));

        // Single step requires a rip trace
        assert!(backend.enable_single_step().is_err());
        backend.set_trace_type(TraceType::Rip).unwrap();
        assert!(backend.enable_single_step().is_ok());
    }

    #[test]
    fn hlt_completes_and_matches_emulator() {
        if !kvm_available() {
            return;
        }

        let snapshot = testutil::snapshot_with_code(&[0xf4]);
        let mut backend = KvmBackend::new(&snapshot).unwrap();
        backend.set_limit(5);
        backend.restore().unwrap();

        let outcome = backend.run(&[]).unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        // Same snapshot through the emulator classifies identically
        let mut emu = crate::backend::emulator::EmulatorBackend::new(&snapshot).unwrap();
        emu.restore().unwrap();
        assert_eq!(emu.run(&[]).unwrap(), outcome);

        // And leaves the same register state behind
        let (hw, sw) = (backend.regs(), emu.regs());
        assert_eq!(hw.rip, sw.rip);
        assert_eq!(hw.rsp, sw.rsp);
        assert_eq!(hw.rax, sw.rax);
        assert_eq!(hw.rbx, sw.rbx);
        assert_eq!(hw.rcx, sw.rcx);
        assert_eq!(hw.rdx, sw.rdx);
        assert_eq!(hw.rsi, sw.rsi);
        assert_eq!(hw.rdi, sw.rdi);
    }

    #[test]
    fn guest_writes_show_up_in_dirty_pages_and_restore() {
        if !kvm_available() {
            return;
        }

        // mov qword [0x402000], 42 ; hlt
        let snapshot = testutil::snapshot_with_code(&[
            0x48, 0xc7, 0x04, 0x25, 0x00, 0x20, 0x40, 0x00, 0x2a, 0x00, 0x00, 0x00, 0xf4,
        ]);
        let mut backend = KvmBackend::new(&snapshot).unwrap();
        backend.set_limit(5);
        backend.restore().unwrap();

        assert_eq!(backend.run(&[]).unwrap(), RunOutcome::Completed);

        // The written data page is in the dirty set; page table walks may
        // have dirtied accessed/dirty bits on top
        assert!(backend.dirty_pages() >= 1);

        let mut buf = [0u8; 8];
        backend
            .read_bytes(VirtAddr(testutil::DATA_VADDR), &mut buf)
            .unwrap();
        assert_eq!(u64::from_le_bytes(buf), 42);

        // Restore reverts the write and empties the dirty set
        backend.restore().unwrap();
        assert_eq!(backend.dirty_pages(), 0);
        backend
            .read_bytes(VirtAddr(testutil::DATA_VADDR), &mut buf)
            .unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0);
    }
}
