//! Windows Hypervisor Platform backend
//!
//! The WHP equivalent of the KVM backend: guest memory is mapped into a
//! partition with dirty page tracking, runs end on halt, fault, or a
//! wall-clock limit. WHP has no signal-based kick, so a watchdog thread
//! cancels `WHvRunVirtualProcessor` when the limit expires.

use rustc_hash::FxHashSet;

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use windows_sys::Win32::System::Hypervisor::{
    WHvCancelRunVirtualProcessor, WHvCapabilityCodeHypervisorPresent, WHvCreatePartition,
    WHvCreateVirtualProcessor, WHvDeletePartition, WHvDeleteVirtualProcessor, WHvGetCapability,
    WHvGetVirtualProcessorRegisters, WHvMapGpaRange, WHvMapGpaRangeFlagExecute,
    WHvMapGpaRangeFlagRead, WHvMapGpaRangeFlagTrackDirtyPages, WHvMapGpaRangeFlagWrite,
    WHvPartitionPropertyCodeExceptionExitBitmap, WHvPartitionPropertyCodeExtendedVmExits,
    WHvPartitionPropertyCodeProcessorCount, WHvQueryGpaRangeDirtyBitmap, WHvRunVirtualProcessor,
    WHvRunVpExitReasonCanceled, WHvRunVpExitReasonException, WHvRunVpExitReasonMemoryAccess,
    WHvRunVpExitReasonX64Halt, WHvRunVpExitReasonX64IoPortAccess, WHvSetPartitionProperty,
    WHvSetVirtualProcessorRegisters, WHvSetupPartition, WHvX64RegisterApicBase, WHvX64RegisterCr0,
    WHvX64RegisterCr2, WHvX64RegisterCr3, WHvX64RegisterCr4, WHvX64RegisterCr8, WHvX64RegisterCs,
    WHvX64RegisterDr0, WHvX64RegisterDr1, WHvX64RegisterDr2, WHvX64RegisterDr3, WHvX64RegisterDr6,
    WHvX64RegisterDr7, WHvX64RegisterDs, WHvX64RegisterEfer, WHvX64RegisterEs, WHvX64RegisterFs,
    WHvX64RegisterGdtr, WHvX64RegisterGs, WHvX64RegisterIdtr, WHvX64RegisterKernelGsBase,
    WHvX64RegisterLdtr, WHvX64RegisterLstar, WHvX64RegisterR10, WHvX64RegisterR11,
    WHvX64RegisterR12, WHvX64RegisterR13, WHvX64RegisterR14, WHvX64RegisterR15, WHvX64RegisterR8,
    WHvX64RegisterR9, WHvX64RegisterRax, WHvX64RegisterRbp, WHvX64RegisterRbx, WHvX64RegisterRcx,
    WHvX64RegisterRdi, WHvX64RegisterRdx, WHvX64RegisterRflags, WHvX64RegisterRip,
    WHvX64RegisterRsi, WHvX64RegisterRsp, WHvX64RegisterSfmask, WHvX64RegisterSs,
    WHvX64RegisterStar, WHvX64RegisterSysenterCs, WHvX64RegisterSysenterEip,
    WHvX64RegisterSysenterEsp, WHvX64RegisterTr, WHV_CAPABILITY, WHV_PARTITION_HANDLE,
    WHV_PARTITION_PROPERTY, WHV_REGISTER_NAME, WHV_REGISTER_VALUE, WHV_RUN_VP_EXIT_CONTEXT,
    WHV_X64_SEGMENT_REGISTER, WHV_X64_TABLE_REGISTER,
};

use crate::addrs::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::backend::{
    page_fault_kind, Backend, BackendType, Error, Fault, FaultKind, RunOutcome,
};
use crate::config::Config;
use crate::memory::Memory;
use crate::regs::{GuestRegs, Segment};
use crate::snapshot::Snapshot;
use crate::trace::{TraceType, Tracer};
use crate::FxIndexSet;

/// Exception vectors the partition is asked to exit on
const EXCEPTION_EXIT_BITMAP: u64 =
    (1 << 0) | (1 << 1) | (1 << 3) | (1 << 6) | (1 << 14);

/// `ExceptionExit` bit of the extended vm exits property
const EXTENDED_EXIT_EXCEPTION: u64 = 1 << 2;

/// Trap flag in rflags, drives single stepping
const RFLAGS_TF: u64 = 1 << 8;

/// How often the watchdog checks the deadline
const WATCHDOG_TICK: Duration = Duration::from_millis(50);

/// A partition handle that can cross into the watchdog thread.
///
/// WHP partition handles are process-global tokens; the only call made off
/// the run thread is `WHvCancelRunVirtualProcessor`, which is documented as
/// callable from any thread.
#[derive(Copy, Clone)]
struct PartitionHandle(WHV_PARTITION_HANDLE);

unsafe impl Send for PartitionHandle {}

fn check_hresult(context: &'static str, hr: i32) -> Result<(), Error> {
    if hr < 0 {
        return Err(Error::Hypervisor(format!("{context} failed: {hr:#x}")));
    }
    Ok(())
}

fn whv_segment(seg: &Segment) -> WHV_X64_SEGMENT_REGISTER {
    let mut out: WHV_X64_SEGMENT_REGISTER = unsafe { std::mem::zeroed() };
    out.Base = seg.base;
    out.Limit = seg.limit;
    out.Selector = seg.selector;
    out.Anonymous.Attributes = seg.attr;
    out
}

fn whv_table(base: u64, limit: u16) -> WHV_X64_TABLE_REGISTER {
    let mut out: WHV_X64_TABLE_REGISTER = unsafe { std::mem::zeroed() };
    out.Base = base;
    out.Limit = limit;
    out
}

fn reg64(val: u64) -> WHV_REGISTER_VALUE {
    let mut out: WHV_REGISTER_VALUE = unsafe { std::mem::zeroed() };
    out.Reg64 = val;
    out
}

/// The Windows Hypervisor Platform execution backend
pub struct WhvBackend {
    partition: PartitionHandle,

    /// Guest memory, mapped into the partition
    memory: Memory,

    /// Clean baseline shared with the snapshot
    clean: Arc<RwLock<Memory>>,

    baseline_regs: GuestRegs,
    regs: GuestRegs,

    config: Config,
    reset_addresses: FxHashSet<u64>,

    /// Wall clock limit in seconds. Zero disables limiting.
    limit_secs: u64,

    trace_type: TraceType,
    tracer: Tracer,
    single_step: bool,
    restored_once: bool,

    /// Bitmap words covering the mapped range
    bitmap_words: usize,
}

impl WhvBackend {
    /// Create a partition bound to the snapshot, with dirty tracking and
    /// exception exits enabled
    pub fn new(snapshot: &Snapshot) -> Result<Self, Error> {
        let mut capability: WHV_CAPABILITY = unsafe { std::mem::zeroed() };
        let mut written = 0u32;
        let hr = unsafe {
            WHvGetCapability(
                WHvCapabilityCodeHypervisorPresent,
                std::ptr::addr_of_mut!(capability).cast::<c_void>(),
                u32::try_from(std::mem::size_of::<WHV_CAPABILITY>())
                    .map_err(|err| Error::Hypervisor(err.to_string()))?,
                &mut written,
            )
        };
        if hr < 0 || unsafe { capability.HypervisorPresent } == 0 {
            return Err(Error::Unavailable(
                BackendType::Whv,
                "hypervisor platform not present".to_string(),
            ));
        }

        let mut handle: WHV_PARTITION_HANDLE = 0;
        check_hresult("WHvCreatePartition", unsafe {
            WHvCreatePartition(&mut handle)
        })?;
        let partition = PartitionHandle(handle);

        let mut property: WHV_PARTITION_PROPERTY = unsafe { std::mem::zeroed() };
        property.ProcessorCount = 1;
        Self::set_property(
            partition,
            WHvPartitionPropertyCodeProcessorCount,
            &property,
        )?;

        let mut property: WHV_PARTITION_PROPERTY = unsafe { std::mem::zeroed() };
        property.ExtendedVmExits.AsUINT64 = EXTENDED_EXIT_EXCEPTION;
        Self::set_property(partition, WHvPartitionPropertyCodeExtendedVmExits, &property)?;

        let mut property: WHV_PARTITION_PROPERTY = unsafe { std::mem::zeroed() };
        property.ExceptionExitBitmap = EXCEPTION_EXIT_BITMAP;
        Self::set_property(
            partition,
            WHvPartitionPropertyCodeExceptionExitBitmap,
            &property,
        )?;

        check_hresult("WHvSetupPartition", unsafe { WHvSetupPartition(handle) })?;
        check_hresult("WHvCreateVirtualProcessor", unsafe {
            WHvCreateVirtualProcessor(handle, 0, 0)
        })?;

        let clean = snapshot.memory.clone();
        let mut memory = {
            let guard = clean
                .read()
                .map_err(|_| Error::Restore("clean snapshot lock poisoned".to_string()))?;
            guard.duplicate()?
        };

        let flags = WHvMapGpaRangeFlagRead
            | WHvMapGpaRangeFlagWrite
            | WHvMapGpaRangeFlagExecute
            | WHvMapGpaRangeFlagTrackDirtyPages;
        check_hresult("WHvMapGpaRange", unsafe {
            WHvMapGpaRange(
                handle,
                memory.host_addr() as *const c_void,
                0,
                memory.size(),
                flags,
            )
        })?;

        let pages = memory.size() / PAGE_SIZE;
        let bitmap_words = usize::try_from((pages + 63) / 64)
            .map_err(|err| Error::Hypervisor(err.to_string()))?;

        let reset_addresses = snapshot
            .config
            .reset_addresses
            .iter()
            .map(|addr| addr.0)
            .collect();

        Ok(Self {
            partition,
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
            bitmap_words,
        })
    }

    fn set_property(
        partition: PartitionHandle,
        code: i32,
        property: &WHV_PARTITION_PROPERTY,
    ) -> Result<(), Error> {
        check_hresult("WHvSetPartitionProperty", unsafe {
            WHvSetPartitionProperty(
                partition.0,
                code,
                std::ptr::from_ref(property).cast::<c_void>(),
                u32::try_from(std::mem::size_of::<WHV_PARTITION_PROPERTY>())
                    .map_err(|err| Error::Hypervisor(err.to_string()))?,
            )
        })
    }

    /// The register names pushed to and pulled from the partition, in the
    /// order the value arrays use
    const GP_NAMES: [WHV_REGISTER_NAME; 18] = [
        WHvX64RegisterRax,
        WHvX64RegisterRbx,
        WHvX64RegisterRcx,
        WHvX64RegisterRdx,
        WHvX64RegisterRsi,
        WHvX64RegisterRdi,
        WHvX64RegisterRsp,
        WHvX64RegisterRbp,
        WHvX64RegisterR8,
        WHvX64RegisterR9,
        WHvX64RegisterR10,
        WHvX64RegisterR11,
        WHvX64RegisterR12,
        WHvX64RegisterR13,
        WHvX64RegisterR14,
        WHvX64RegisterR15,
        WHvX64RegisterRip,
        WHvX64RegisterRflags,
    ];

    /// Push the host-visible general purpose registers into the vCPU. The
    /// trap flag rides along when single stepping.
    fn load_regs(&self) -> Result<(), Error> {
        let r = &self.regs;
        let mut rflags = r.rflags | 2;
        if self.single_step {
            rflags |= RFLAGS_TF;
        }

        let values = [
            reg64(r.rax),
            reg64(r.rbx),
            reg64(r.rcx),
            reg64(r.rdx),
            reg64(r.rsi),
            reg64(r.rdi),
            reg64(r.rsp),
            reg64(r.rbp),
            reg64(r.r8),
            reg64(r.r9),
            reg64(r.r10),
            reg64(r.r11),
            reg64(r.r12),
            reg64(r.r13),
            reg64(r.r14),
            reg64(r.r15),
            reg64(r.rip),
            reg64(rflags),
        ];

        check_hresult("WHvSetVirtualProcessorRegisters", unsafe {
            WHvSetVirtualProcessorRegisters(
                self.partition.0,
                0,
                Self::GP_NAMES.as_ptr(),
                Self::GP_NAMES.len() as u32,
                values.as_ptr(),
            )
        })
    }

    /// Seed segment, table, control, and model specific registers from the
    /// baseline
    fn load_system_regs(&self) -> Result<(), Error> {
        let b = &self.baseline_regs;

        let names: [WHV_REGISTER_NAME; 24] = [
            WHvX64RegisterCs,
            WHvX64RegisterDs,
            WHvX64RegisterEs,
            WHvX64RegisterFs,
            WHvX64RegisterGs,
            WHvX64RegisterSs,
            WHvX64RegisterTr,
            WHvX64RegisterLdtr,
            WHvX64RegisterGdtr,
            WHvX64RegisterIdtr,
            WHvX64RegisterCr0,
            WHvX64RegisterCr2,
            WHvX64RegisterCr3,
            WHvX64RegisterCr4,
            WHvX64RegisterCr8,
            WHvX64RegisterEfer,
            WHvX64RegisterApicBase,
            WHvX64RegisterStar,
            WHvX64RegisterLstar,
            WHvX64RegisterSfmask,
            WHvX64RegisterKernelGsBase,
            WHvX64RegisterSysenterCs,
            WHvX64RegisterSysenterEsp,
            WHvX64RegisterSysenterEip,
        ];

        let mut values: [WHV_REGISTER_VALUE; 24] = unsafe { std::mem::zeroed() };
        values[0].Segment = whv_segment(&b.cs);
        values[1].Segment = whv_segment(&b.ds);
        values[2].Segment = whv_segment(&b.es);
        values[3].Segment = whv_segment(&b.fs);
        values[4].Segment = whv_segment(&b.gs);
        values[5].Segment = whv_segment(&b.ss);
        values[6].Segment = whv_segment(&b.tr);
        values[7].Segment = whv_segment(&b.ldtr);
        values[8].Table = whv_table(b.gdtr.base, b.gdtr.limit);
        values[9].Table = whv_table(b.idtr.base, b.idtr.limit);
        values[10] = reg64(b.cr0);
        values[11] = reg64(b.cr2);
        values[12] = reg64(b.cr3);
        values[13] = reg64(b.cr4);
        values[14] = reg64(b.cr8);
        values[15] = reg64(b.efer);
        values[16] = reg64(b.apic_base);
        values[17] = reg64(b.star);
        values[18] = reg64(b.lstar);
        values[19] = reg64(b.sfmask);
        values[20] = reg64(b.kernel_gs_base);
        values[21] = reg64(b.sysenter_cs);
        values[22] = reg64(b.sysenter_esp);
        values[23] = reg64(b.sysenter_eip);

        check_hresult("WHvSetVirtualProcessorRegisters", unsafe {
            WHvSetVirtualProcessorRegisters(
                self.partition.0,
                0,
                names.as_ptr(),
                names.len() as u32,
                values.as_ptr(),
            )
        })?;

        // Debug registers are cleared by the sanitizer; push the zeros
        let dr_names: [WHV_REGISTER_NAME; 6] = [
            WHvX64RegisterDr0,
            WHvX64RegisterDr1,
            WHvX64RegisterDr2,
            WHvX64RegisterDr3,
            WHvX64RegisterDr6,
            WHvX64RegisterDr7,
        ];
        let dr_values = [
            reg64(b.dr0),
            reg64(b.dr1),
            reg64(b.dr2),
            reg64(b.dr3),
            reg64(b.dr6),
            reg64(b.dr7),
        ];

        check_hresult("WHvSetVirtualProcessorRegisters", unsafe {
            WHvSetVirtualProcessorRegisters(
                self.partition.0,
                0,
                dr_names.as_ptr(),
                dr_names.len() as u32,
                dr_values.as_ptr(),
            )
        })
    }

    /// Pull the guest registers back into the host-visible copy
    fn sync_regs(&mut self) -> Result<(), Error> {
        let mut values: [WHV_REGISTER_VALUE; 18] = unsafe { std::mem::zeroed() };

        check_hresult("WHvGetVirtualProcessorRegisters", unsafe {
            WHvGetVirtualProcessorRegisters(
                self.partition.0,
                0,
                Self::GP_NAMES.as_ptr(),
                Self::GP_NAMES.len() as u32,
                values.as_mut_ptr(),
            )
        })?;

        let r = &mut self.regs;
        unsafe {
            r.rax = values[0].Reg64;
            r.rbx = values[1].Reg64;
            r.rcx = values[2].Reg64;
            r.rdx = values[3].Reg64;
            r.rsi = values[4].Reg64;
            r.rdi = values[5].Reg64;
            r.rsp = values[6].Reg64;
            r.rbp = values[7].Reg64;
            r.r8 = values[8].Reg64;
            r.r9 = values[9].Reg64;
            r.r10 = values[10].Reg64;
            r.r11 = values[11].Reg64;
            r.r12 = values[12].Reg64;
            r.r13 = values[13].Reg64;
            r.r14 = values[14].Reg64;
            r.r15 = values[15].Reg64;
            r.rip = values[16].Reg64;
            r.rflags = values[17].Reg64 & !RFLAGS_TF;
        }
        Ok(())
    }

    /// Fold the pages the partition marked dirty into the memory's own
    /// dirty set, so `dirty_pages` and the next restore both see them. The
    /// query also clears the hardware dirty state.
    fn harvest_dirty_log(&mut self) -> Result<usize, Error> {
        let mut bitmap = vec![0u64; self.bitmap_words];

        check_hresult("WHvQueryGpaRangeDirtyBitmap", unsafe {
            WHvQueryGpaRangeDirtyBitmap(
                self.partition.0,
                0,
                self.memory.size(),
                bitmap.as_mut_ptr(),
                u32::try_from(bitmap.len() * std::mem::size_of::<u64>())
                    .map_err(|err| Error::Hypervisor(err.to_string()))?,
            )
        })?;

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

        Ok(harvested)
    }

    /// Patch an `int3` over each reset address through a physical write
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

    /// Start a watchdog that cancels the vCPU when the deadline passes
    fn spawn_watchdog(
        &self,
        deadline: Instant,
        done: Arc<AtomicBool>,
    ) -> std::thread::JoinHandle<()> {
        let partition = self.partition;
        std::thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                if Instant::now() >= deadline {
                    unsafe { WHvCancelRunVirtualProcessor(partition.0, 0, 0) };
                    return;
                }
                std::thread::sleep(WATCHDOG_TICK);
            }
        })
    }
}

impl Drop for WhvBackend {
    fn drop(&mut self) {
        unsafe {
            WHvDeleteVirtualProcessor(self.partition.0, 0);
            WHvDeletePartition(self.partition.0);
        }
    }
}

impl Backend for WhvBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Whv
    }

    fn set_limit(&mut self, limit: u64) {
        self.limit_secs = limit;
    }

    fn set_trace_type(&mut self, kind: TraceType) -> Result<(), Error> {
        if self.restored_once {
            return Err(Error::ConfiguredAfterRestore("trace type"));
        }
        if !BackendType::Whv.supports_trace_type(kind) {
            return Err(Error::UnsupportedCapability(
                BackendType::Whv,
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
        if self.trace_type != TraceType::Rip {
            return Err(Error::UnsupportedCapability(
                BackendType::Whv,
                "single step outside rip traces",
            ));
        }
        self.single_step = true;
        Ok(())
    }

    fn enable_edge_coverage(&mut self) -> Result<(), Error> {
        Err(Error::UnsupportedCapability(
            BackendType::Whv,
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

        log::trace!("whv restore reverted {restored} pages ({guest_pages} late harvested)");

        self.regs = self.baseline_regs.clone();
        self.load_regs()?;
        self.load_system_regs()?;
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

        self.load_regs()?;

        let start = Instant::now();
        let done = Arc::new(AtomicBool::new(false));
        let watchdog = (self.limit_secs != 0).then(|| {
            let deadline = start + Duration::from_secs(self.limit_secs);
            self.spawn_watchdog(deadline, done.clone())
        });

        let outcome = loop {
            let mut exit: WHV_RUN_VP_EXIT_CONTEXT = unsafe { std::mem::zeroed() };
            let hr = unsafe {
                WHvRunVirtualProcessor(
                    self.partition.0,
                    0,
                    std::ptr::addr_of_mut!(exit).cast::<c_void>(),
                    u32::try_from(std::mem::size_of::<WHV_RUN_VP_EXIT_CONTEXT>())
                        .map_err(|err| Error::Hypervisor(err.to_string()))?,
                )
            };
            if hr < 0 {
                done.store(true, Ordering::SeqCst);
                return Err(Error::Hypervisor(format!(
                    "WHvRunVirtualProcessor failed: {hr:#x}"
                )));
            }

            let rip = exit.VpContext.Rip;

            #[allow(non_upper_case_globals)]
            match exit.ExitReason {
                WHvRunVpExitReasonX64Halt => break RunOutcome::Completed,

                WHvRunVpExitReasonException => {
                    let exception = unsafe { exit.Anonymous.VpException };
                    match u32::from(exception.ExceptionType) {
                        // Breakpoint: planted at reset addresses
                        3 => {
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
                        1 => {
                            self.tracer.record_rip(VirtAddr(rip));
                        }

                        14 => {
                            break RunOutcome::Crashed(Fault {
                                kind: page_fault_kind(exception.ErrorCode),
                                addr: VirtAddr(exception.ExceptionParameter),
                                ip: VirtAddr(rip),
                            });
                        }

                        6 => {
                            break RunOutcome::Crashed(Fault {
                                kind: FaultKind::InvalidOpcode,
                                addr: VirtAddr(0),
                                ip: VirtAddr(rip),
                            })
                        }

                        0 => {
                            break RunOutcome::Crashed(Fault {
                                kind: FaultKind::DivideError,
                                addr: VirtAddr(0),
                                ip: VirtAddr(rip),
                            })
                        }

                        vector => {
                            break RunOutcome::Crashed(Fault {
                                kind: FaultKind::Unknown(vector),
                                addr: VirtAddr(0),
                                ip: VirtAddr(rip),
                            })
                        }
                    }
                }

                WHvRunVpExitReasonMemoryAccess => {
                    let access = unsafe { exit.Anonymous.MemoryAccess };
                    let info = unsafe { access.AccessInfo.AsUINT32 };
                    let kind = match info & 0b11 {
                        0 => FaultKind::ReadUnmapped,
                        1 => FaultKind::WriteUnmapped,
                        _ => FaultKind::ExecViolation,
                    };
                    break RunOutcome::Crashed(Fault {
                        kind,
                        addr: VirtAddr(access.Gva),
                        ip: VirtAddr(rip),
                    });
                }

                WHvRunVpExitReasonX64IoPortAccess => {
                    break RunOutcome::Crashed(Fault {
                        kind: FaultKind::UnexpectedIo,
                        addr: VirtAddr(0),
                        ip: VirtAddr(rip),
                    })
                }

                WHvRunVpExitReasonCanceled => {
                    if self.limit_secs != 0
                        && start.elapsed() >= Duration::from_secs(self.limit_secs)
                    {
                        break RunOutcome::LimitExceeded;
                    }
                }

                reason => {
                    done.store(true, Ordering::SeqCst);
                    return Err(Error::Hypervisor(format!("unexpected exit: {reason}")));
                }
            }
        };

        done.store(true, Ordering::SeqCst);
        if let Some(watchdog) = watchdog {
            let _ = watchdog.join();
        }

        self.sync_regs()?;

        // Fold guest writes into the dirty set so dirty_pages sees them
        self.harvest_dirty_log()?;

        // Coarse coverage: the exit rip always lands in the trace
        self.tracer.record_rip(VirtAddr(self.regs.rip));

        log::debug!("whv run: {outcome} after {:?}", start.elapsed());
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

    fn whv_available() -> bool {
        let mut capability: WHV_CAPABILITY = unsafe { std::mem::zeroed() };
        let mut written = 0u32;
        let hr = unsafe {
            WHvGetCapability(
                WHvCapabilityCodeHypervisorPresent,
                std::ptr::addr_of_mut!(capability).cast::<c_void>(),
                std::mem::size_of::<WHV_CAPABILITY>() as u32,
                &mut written,
            )
        };
        hr >= 0 && unsafe { capability.HypervisorPresent } != 0
    }

    #[test]
    fn capability_gating_rejects_edge_coverage_and_tenet() {
        if !whv_available() {
            return;
        }

        let snapshot = testutil::snapshot_with_code(&[0xf4]);
        let mut backend = WhvBackend::new(&snapshot).unwrap();

        assert!(backend.enable_edge_coverage().is_err());
        assert!(backend.set_trace_type(TraceType::Tenet).is_err());
    }

    #[test]
    fn hlt_completes() {
        if !whv_available() {
            return;
        }

        let snapshot = testutil::snapshot_with_code(&[0xf4]);
        let mut backend = WhvBackend::new(&snapshot).unwrap();
        backend.set_limit(5);
        backend.restore().unwrap();

        assert_eq!(backend.run(&[]).unwrap(), RunOutcome::Completed);
    }

    #[test]
    fn guest_writes_show_up_in_dirty_pages_and_restore() {
        if !whv_available() {
            return;
        }

        // mov qword [0x402000], 42 ; hlt
        let snapshot = testutil::snapshot_with_code(&[
            0x48, 0xc7, 0x04, 0x25, 0x00, 0x20, 0x40, 0x00, 0x2a, 0x00, 0x00, 0x00, 0xf4,
        ]);
        let mut backend = WhvBackend::new(&snapshot).unwrap();
        backend.set_limit(5);
        backend.restore().unwrap();

        assert_eq!(backend.run(&[]).unwrap(), RunOutcome::Completed);
        assert!(backend.dirty_pages() >= 1);

        let mut buf = [0u8; 8];
        backend
            .read_bytes(VirtAddr(testutil::DATA_VADDR), &mut buf)
            .unwrap();
        assert_eq!(u64::from_le_bytes(buf), 42);

        backend.restore().unwrap();
        assert_eq!(backend.dirty_pages(), 0);
        backend
            .read_bytes(VirtAddr(testutil::DATA_VADDR), &mut buf)
            .unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0);
    }
}
