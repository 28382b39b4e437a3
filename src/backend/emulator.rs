//! Software instruction emulator backend
//!
//! Interprets guest instructions one at a time against the [`Memory`]
//! image. This is the only backend with an exact retired-instruction limit,
//! full per-instruction tracing, and per-edge coverage, which makes it the
//! backend of choice whenever deterministic trace output is required. It is
//! also the slowest, by design.

use iced_x86::{
    ConditionCode as CC, Decoder, DecoderError, DecoderOptions, Instruction, Mnemonic, OpKind,
    Register,
};
use rustc_hash::FxHashSet;

use std::sync::{Arc, RwLock};

use crate::addrs::{Cr3, VirtAddr, PAGE_SIZE};
use crate::backend::{Backend, BackendType, Error, Fault, FaultKind, RunOutcome};
use crate::config::Config;
use crate::memory::{Error as MemError, Memory};
use crate::regs::GuestRegs;
use crate::snapshot::Snapshot;
use crate::trace::{AccessKind, MemAccess, TraceType, Tracer};
use crate::FxIndexSet;

// rflags bits maintained by the interpreter
const CF: u64 = 1 << 0;
const PF: u64 = 1 << 2;
const AF: u64 = 1 << 4;
const ZF: u64 = 1 << 6;
const SF: u64 = 1 << 7;
const OF: u64 = 1 << 11;

/// Result of executing one instruction
enum Step {
    /// Keep executing
    Continue,

    /// The run is over
    Done(RunOutcome),
}

/// The software emulation backend
pub struct EmulatorBackend {
    /// Working guest memory image
    memory: Memory,

    /// Clean baseline shared with the snapshot
    clean: Arc<RwLock<Memory>>,

    /// Current register state
    regs: GuestRegs,

    /// Sanitized register baseline applied on every restore
    baseline_regs: GuestRegs,

    /// Snapshot configuration (input address, reset addresses)
    config: Config,

    /// Addresses that end a run successfully
    reset_addresses: FxHashSet<u64>,

    /// Instruction limit. Zero disables limiting.
    limit: u64,

    /// Instructions retired by the last run
    instructions_executed: u64,

    /// Active trace type
    trace_type: TraceType,

    /// Trace for the current run
    tracer: Tracer,

    /// Cumulative taken control flow edges, when enabled
    edges: Option<FxIndexSet<(VirtAddr, VirtAddr)>>,

    /// Memory accesses made by the instruction currently executing
    pending_accesses: Vec<MemAccess>,

    /// Set once the first restore has happened, freezing instrumentation
    restored_once: bool,
}

/// Execute a guest operand expression: guest memory faults finish the run
/// as crashed, everything else propagates as a backend error
macro_rules! guest {
    ($self_:ident, $ip:ident, $expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(Error::Memory(err)) => {
                let fault = $self_.mem_fault(err, $ip)?;
                return Ok(Step::Done(RunOutcome::Crashed(fault)));
            }
            Err(err) => return Err(err),
        }
    };
}

impl EmulatorBackend {
    /// Bind an emulator to a snapshot, duplicating its clean memory image
    pub fn new(snapshot: &Snapshot) -> Result<Self, Error> {
        let clean = snapshot.memory.clone();
        let memory = {
            let guard = clean
                .read()
                .map_err(|_| Error::Restore("clean snapshot lock poisoned".to_string()))?;
            guard.duplicate()?
        };

        let reset_addresses = snapshot
            .config
            .reset_addresses
            .iter()
            .map(|addr| addr.0)
            .collect();

        Ok(Self {
            memory,
            clean,
            regs: snapshot.regs.clone(),
            baseline_regs: snapshot.regs.clone(),
            config: snapshot.config.clone(),
            reset_addresses,
            limit: 0,
            instructions_executed: 0,
            trace_type: TraceType::None,
            tracer: Tracer::new(TraceType::None),
            edges: None,
            pending_accesses: Vec::new(),
            restored_once: false,
        })
    }

    /// Instructions retired by the last run
    #[must_use]
    pub fn instructions_executed(&self) -> u64 {
        self.instructions_executed
    }

    fn cr3(&self) -> Cr3 {
        self.regs.cr3()
    }

    /// Classify a guest memory error as a fault, or propagate host-side
    /// failures
    fn mem_fault(&self, err: MemError, ip: VirtAddr) -> Result<Fault, Error> {
        let (kind, addr) = match err {
            MemError::ReadFromUnmappedVirtualAddress(addr) => (FaultKind::ReadUnmapped, addr),
            MemError::WriteToUnmappedVirtualAddress(addr) => (FaultKind::WriteUnmapped, addr),
            MemError::WriteToReadOnlyMemory(addr) => (FaultKind::WriteReadOnly, addr),
            other => return Err(Error::Memory(other)),
        };

        Ok(Fault { kind, addr, ip })
    }

    // ---- register file ----

    fn read_full(&self, reg: Register) -> Result<u64, Error> {
        let value = match reg {
            Register::RAX => self.regs.rax,
            Register::RBX => self.regs.rbx,
            Register::RCX => self.regs.rcx,
            Register::RDX => self.regs.rdx,
            Register::RSI => self.regs.rsi,
            Register::RDI => self.regs.rdi,
            Register::RBP => self.regs.rbp,
            Register::RSP => self.regs.rsp,
            Register::R8 => self.regs.r8,
            Register::R9 => self.regs.r9,
            Register::R10 => self.regs.r10,
            Register::R11 => self.regs.r11,
            Register::R12 => self.regs.r12,
            Register::R13 => self.regs.r13,
            Register::R14 => self.regs.r14,
            Register::R15 => self.regs.r15,
            Register::RIP => self.regs.rip,
            _ => {
                return Err(Error::UnsupportedInstruction(
                    format!("{reg:?} source operand"),
                    VirtAddr(self.regs.rip),
                ))
            }
        };
        Ok(value)
    }

    fn write_full(&mut self, reg: Register, value: u64) -> Result<(), Error> {
        let slot = match reg {
            Register::RAX => &mut self.regs.rax,
            Register::RBX => &mut self.regs.rbx,
            Register::RCX => &mut self.regs.rcx,
            Register::RDX => &mut self.regs.rdx,
            Register::RSI => &mut self.regs.rsi,
            Register::RDI => &mut self.regs.rdi,
            Register::RBP => &mut self.regs.rbp,
            Register::RSP => &mut self.regs.rsp,
            Register::R8 => &mut self.regs.r8,
            Register::R9 => &mut self.regs.r9,
            Register::R10 => &mut self.regs.r10,
            Register::R11 => &mut self.regs.r11,
            Register::R12 => &mut self.regs.r12,
            Register::R13 => &mut self.regs.r13,
            Register::R14 => &mut self.regs.r14,
            Register::R15 => &mut self.regs.r15,
            Register::RIP => &mut self.regs.rip,
            _ => {
                return Err(Error::UnsupportedInstruction(
                    format!("{reg:?} destination operand"),
                    VirtAddr(self.regs.rip),
                ))
            }
        };
        *slot = value;
        Ok(())
    }

    fn is_high_byte(reg: Register) -> bool {
        matches!(
            reg,
            Register::AH | Register::BH | Register::CH | Register::DH
        )
    }

    fn read_reg(&self, reg: Register) -> Result<u64, Error> {
        if reg == Register::None {
            return Ok(0);
        }

        let full = self.read_full(reg.full_register())?;
        if Self::is_high_byte(reg) {
            return Ok((full >> 8) & 0xff);
        }

        Ok(match reg.size() {
            1 => full & 0xff,
            2 => full & 0xffff,
            4 => full & 0xffff_ffff,
            _ => full,
        })
    }

    fn write_reg(&mut self, reg: Register, value: u64) -> Result<(), Error> {
        let full_reg = reg.full_register();
        let current = self.read_full(full_reg)?;

        let new = if Self::is_high_byte(reg) {
            (current & !0xff00) | ((value & 0xff) << 8)
        } else {
            match reg.size() {
                1 => (current & !0xff) | (value & 0xff),
                2 => (current & !0xffff) | (value & 0xffff),
                // 32 bit destinations zero extend
                4 => value & 0xffff_ffff,
                _ => value,
            }
        };

        self.write_full(full_reg, new)
    }

    // ---- operands ----

    fn mem_addr(&self, instr: &Instruction) -> Result<VirtAddr, Error> {
        if instr.memory_base() == Register::RIP {
            return Ok(VirtAddr(instr.memory_displacement64()));
        }

        let base = self.read_reg(instr.memory_base())?;
        let index = self.read_reg(instr.memory_index())?;
        let mut addr = base
            .wrapping_add(index.wrapping_mul(u64::from(instr.memory_index_scale())))
            .wrapping_add(instr.memory_displacement64());

        match instr.memory_segment() {
            Register::FS => addr = addr.wrapping_add(self.regs.fs.base),
            Register::GS => addr = addr.wrapping_add(self.regs.gs.base),
            _ => {}
        }

        Ok(VirtAddr(addr))
    }

    fn imm_value(instr: &Instruction, op: u32) -> u64 {
        #[allow(clippy::cast_sign_loss)]
        match instr.op_kind(op) {
            OpKind::Immediate8 => u64::from(instr.immediate8()),
            OpKind::Immediate8to16 => instr.immediate8to16() as i64 as u64,
            OpKind::Immediate8to32 => instr.immediate8to32() as i64 as u64,
            OpKind::Immediate8to64 => instr.immediate8to64() as u64,
            OpKind::Immediate16 => u64::from(instr.immediate16()),
            OpKind::Immediate32 => u64::from(instr.immediate32()),
            OpKind::Immediate32to64 => instr.immediate32to64() as u64,
            OpKind::Immediate64 => instr.immediate64(),
            _ => 0,
        }
    }

    fn op_size(&self, instr: &Instruction, op: u32) -> usize {
        match instr.op_kind(op) {
            OpKind::Register => instr.op_register(op).size(),
            OpKind::Memory => instr.memory_size().size(),
            _ => 8,
        }
    }

    fn read_mem(&mut self, addr: VirtAddr, size: usize) -> Result<u64, Error> {
        let mut bytes = [0u8; 8];
        self.memory.read_bytes(addr, self.regs.cr3(), &mut bytes[..size])?;

        if self.trace_type == TraceType::Tenet {
            self.pending_accesses.push(MemAccess {
                kind: AccessKind::Read,
                addr,
                data: bytes[..size].to_vec(),
            });
        }

        Ok(u64::from_le_bytes(bytes))
    }

    fn write_mem(&mut self, addr: VirtAddr, size: usize, value: u64) -> Result<(), Error> {
        let bytes = value.to_le_bytes();
        self.memory
            .write_bytes_dirty(addr, self.regs.cr3(), &bytes[..size])?;

        if self.trace_type == TraceType::Tenet {
            self.pending_accesses.push(MemAccess {
                kind: AccessKind::Write,
                addr,
                data: bytes[..size].to_vec(),
            });
        }

        Ok(())
    }

    fn read_op(&mut self, instr: &Instruction, op: u32) -> Result<u64, Error> {
        match instr.op_kind(op) {
            OpKind::Register => self.read_reg(instr.op_register(op)),
            OpKind::Memory => {
                let addr = self.mem_addr(instr)?;
                self.read_mem(addr, instr.memory_size().size())
            }
            _ => Ok(Self::imm_value(instr, op)),
        }
    }

    fn write_op(&mut self, instr: &Instruction, op: u32, value: u64) -> Result<(), Error> {
        match instr.op_kind(op) {
            OpKind::Register => self.write_reg(instr.op_register(op), value),
            OpKind::Memory => {
                let addr = self.mem_addr(instr)?;
                self.write_mem(addr, instr.memory_size().size(), value)
            }
            _ => Ok(()),
        }
    }

    // ---- flags ----

    fn flag(&self, flag: u64) -> bool {
        self.regs.rflags & flag != 0
    }

    fn set_flag(&mut self, flag: u64, set: bool) {
        if set {
            self.regs.rflags |= flag;
        } else {
            self.regs.rflags &= !flag;
        }
    }

    fn size_mask(size: usize) -> u64 {
        match size {
            1 => 0xff,
            2 => 0xffff,
            4 => 0xffff_ffff,
            _ => u64::MAX,
        }
    }

    fn sign_bit(size: usize) -> u64 {
        1 << (size * 8 - 1)
    }

    fn sign_extend(value: u64, size: usize) -> u64 {
        #[allow(clippy::cast_sign_loss)]
        match size {
            1 => value as u8 as i8 as i64 as u64,
            2 => value as u16 as i16 as i64 as u64,
            4 => value as u32 as i32 as i64 as u64,
            _ => value,
        }
    }

    fn set_result_flags(&mut self, result: u64, size: usize) {
        let result = result & Self::size_mask(size);
        self.set_flag(ZF, result == 0);
        self.set_flag(SF, result & Self::sign_bit(size) != 0);

        #[allow(clippy::cast_possible_truncation)]
        let low = result as u8;
        self.set_flag(PF, low.count_ones() % 2 == 0);
    }

    fn do_add(&mut self, a: u64, b: u64, carry_in: u64, size: usize) -> u64 {
        let mask = Self::size_mask(size);
        let a = a & mask;
        let b = b & mask;

        let full = u128::from(a) + u128::from(b) + u128::from(carry_in);
        #[allow(clippy::cast_possible_truncation)]
        let result = (full as u64) & mask;

        self.set_flag(CF, full > u128::from(mask));
        self.set_flag(OF, (!(a ^ b) & (a ^ result) & Self::sign_bit(size)) != 0);
        self.set_flag(AF, ((a ^ b ^ result) & 0x10) != 0);
        self.set_result_flags(result, size);
        result
    }

    fn do_sub(&mut self, a: u64, b: u64, borrow_in: u64, size: usize) -> u64 {
        let mask = Self::size_mask(size);
        let a = a & mask;
        let b = b & mask;

        let result = a.wrapping_sub(b).wrapping_sub(borrow_in) & mask;

        self.set_flag(CF, u128::from(b) + u128::from(borrow_in) > u128::from(a));
        self.set_flag(OF, ((a ^ b) & (a ^ result) & Self::sign_bit(size)) != 0);
        self.set_flag(AF, ((a ^ b ^ result) & 0x10) != 0);
        self.set_result_flags(result, size);
        result
    }

    fn do_logic(&mut self, result: u64, size: usize) -> u64 {
        let result = result & Self::size_mask(size);
        self.set_flag(CF, false);
        self.set_flag(OF, false);
        self.set_result_flags(result, size);
        result
    }

    fn condition(&self, cc: CC) -> bool {
        let cf = self.flag(CF);
        let zf = self.flag(ZF);
        let sf = self.flag(SF);
        let of = self.flag(OF);
        let pf = self.flag(PF);

        match cc {
            CC::o => of,
            CC::no => !of,
            CC::b => cf,
            CC::ae => !cf,
            CC::e => zf,
            CC::ne => !zf,
            CC::be => cf || zf,
            CC::a => !cf && !zf,
            CC::s => sf,
            CC::ns => !sf,
            CC::p => pf,
            CC::np => !pf,
            CC::l => sf != of,
            CC::ge => sf == of,
            CC::le => zf || (sf != of),
            CC::g => !zf && (sf == of),
            CC::None => true,
        }
    }

    // ---- stack and control flow ----

    fn push(&mut self, value: u64) -> Result<(), Error> {
        self.regs.rsp = self.regs.rsp.wrapping_sub(8);
        self.write_mem(VirtAddr(self.regs.rsp), 8, value)
    }

    fn pop(&mut self) -> Result<u64, Error> {
        let value = self.read_mem(VirtAddr(self.regs.rsp), 8)?;
        self.regs.rsp = self.regs.rsp.wrapping_add(8);
        Ok(value)
    }

    fn record_edge(&mut self, src: VirtAddr, dst: VirtAddr) {
        if let Some(edges) = &mut self.edges {
            edges.insert((src, dst));
        }
    }

    /// Resolve a direct or indirect branch target from operand 0
    fn branch_target(&mut self, instr: &Instruction) -> Result<u64, Error> {
        match instr.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Ok(instr.near_branch_target())
            }
            OpKind::Register => self.read_reg(instr.op0_register()),
            OpKind::Memory => {
                let addr = self.mem_addr(instr)?;
                self.read_mem(addr, 8)
            }
            _ => Ok(instr.near_branch_target()),
        }
    }

    // ---- execution ----

    /// Fetch up to 16 instruction bytes at `ip`, stopping at unmapped or
    /// non-executable memory
    fn fetch(&self, ip: VirtAddr, bytes: &mut [u8; 16]) -> usize {
        let cr3 = self.cr3();
        let mut avail = 0usize;

        while avail < 16 {
            let addr = ip.offset(avail as u64);
            let translation = self.memory.translate(addr, cr3);
            let Some(phys) = translation.phys_addr() else {
                break;
            };
            if !translation.perms.executable {
                break;
            }

            let in_page = (PAGE_SIZE - addr.page_offset()) as usize;
            let chunk = (16 - avail).min(in_page);
            if self
                .memory
                .read_phys(phys, &mut bytes[avail..avail + chunk])
                .is_err()
            {
                break;
            }
            avail += chunk;
        }

        avail
    }

    /// Decode and execute exactly one instruction
    fn step(&mut self) -> Result<Step, Error> {
        let ip = VirtAddr(self.regs.rip);

        // Reaching a reset address is the guest signalling it is done
        if self.reset_addresses.contains(&ip.0) {
            return Ok(Step::Done(RunOutcome::Completed));
        }

        let mut bytes = [0u8; 16];
        let avail = self.fetch(ip, &mut bytes);
        if avail == 0 {
            return Ok(Step::Done(RunOutcome::Crashed(Fault {
                kind: FaultKind::ExecViolation,
                addr: ip,
                ip,
            })));
        }

        let mut decoder = Decoder::with_ip(64, &bytes[..avail], ip.0, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() {
            // The decoder running out of bytes means the instruction
            // straddles into memory that cannot be fetched from
            if decoder.last_error() == DecoderError::NoMoreBytes {
                return Ok(Step::Done(RunOutcome::Crashed(Fault {
                    kind: FaultKind::ExecViolation,
                    addr: ip.offset(avail as u64),
                    ip,
                })));
            }

            return Ok(Step::Done(RunOutcome::Crashed(Fault {
                kind: FaultKind::InvalidOpcode,
                addr: VirtAddr(0),
                ip,
            })));
        }

        self.tracer.record_rip(ip);
        self.pending_accesses.clear();

        // Fall-through address; control flow overwrites it
        self.regs.rip = instr.next_ip();

        let step = self.execute(&instr, ip)?;

        if matches!(step, Step::Continue) && self.trace_type == TraceType::Tenet {
            let accesses = std::mem::take(&mut self.pending_accesses);
            let regs = self.regs.clone();
            self.tracer.record_tenet(&regs, &accesses);
        }

        Ok(step)
    }

    #[allow(clippy::too_many_lines)]
    fn execute(&mut self, instr: &Instruction, ip: VirtAddr) -> Result<Step, Error> {
        // Conditional near jumps, any condition
        if instr.is_jcc_short_or_near() {
            if self.condition(instr.condition_code()) {
                let target = instr.near_branch_target();
                self.record_edge(ip, VirtAddr(target));
                self.regs.rip = target;
            }
            return Ok(Step::Continue);
        }

        let mnemonic = instr.mnemonic();
        match mnemonic {
            Mnemonic::Nop => {}

            Mnemonic::Hlt => return Ok(Step::Done(RunOutcome::Completed)),

            Mnemonic::Int3 => {
                return Ok(Step::Done(RunOutcome::Crashed(Fault {
                    kind: FaultKind::Breakpoint,
                    addr: VirtAddr(0),
                    ip,
                })));
            }

            Mnemonic::Int => {
                #[allow(clippy::cast_possible_truncation)]
                let vector = Self::imm_value(instr, 0) as u32;
                return Ok(Step::Done(RunOutcome::Crashed(Fault {
                    kind: FaultKind::Unknown(vector),
                    addr: VirtAddr(0),
                    ip,
                })));
            }

            Mnemonic::Mov | Mnemonic::Movzx => {
                let value = guest!(self, ip, self.read_op(instr, 1));
                guest!(self, ip, self.write_op(instr, 0, value));
            }

            Mnemonic::Movsx | Mnemonic::Movsxd => {
                let src_size = self.op_size(instr, 1);
                let value = guest!(self, ip, self.read_op(instr, 1));
                let extended = Self::sign_extend(value, src_size);
                guest!(self, ip, self.write_op(instr, 0, extended));
            }

            Mnemonic::Lea => {
                let addr = guest!(self, ip, self.mem_addr(instr));
                guest!(self, ip, self.write_reg(instr.op0_register(), addr.0));
            }

            Mnemonic::Add | Mnemonic::Adc => {
                let size = self.op_size(instr, 0);
                let a = guest!(self, ip, self.read_op(instr, 0));
                let b = guest!(self, ip, self.read_op(instr, 1));
                let carry = u64::from(mnemonic == Mnemonic::Adc && self.flag(CF));
                let result = self.do_add(a, b, carry, size);
                guest!(self, ip, self.write_op(instr, 0, result));
            }

            Mnemonic::Sub | Mnemonic::Sbb => {
                let size = self.op_size(instr, 0);
                let a = guest!(self, ip, self.read_op(instr, 0));
                let b = guest!(self, ip, self.read_op(instr, 1));
                let borrow = u64::from(mnemonic == Mnemonic::Sbb && self.flag(CF));
                let result = self.do_sub(a, b, borrow, size);
                guest!(self, ip, self.write_op(instr, 0, result));
            }

            Mnemonic::Cmp => {
                let size = self.op_size(instr, 0);
                let a = guest!(self, ip, self.read_op(instr, 0));
                let b = guest!(self, ip, self.read_op(instr, 1));
                self.do_sub(a, b, 0, size);
            }

            Mnemonic::Test => {
                let size = self.op_size(instr, 0);
                let a = guest!(self, ip, self.read_op(instr, 0));
                let b = guest!(self, ip, self.read_op(instr, 1));
                self.do_logic(a & b, size);
            }

            Mnemonic::And | Mnemonic::Or | Mnemonic::Xor => {
                let size = self.op_size(instr, 0);
                let a = guest!(self, ip, self.read_op(instr, 0));
                let b = guest!(self, ip, self.read_op(instr, 1));
                let result = match mnemonic {
                    Mnemonic::And => a & b,
                    Mnemonic::Or => a | b,
                    _ => a ^ b,
                };
                let result = self.do_logic(result, size);
                guest!(self, ip, self.write_op(instr, 0, result));
            }

            Mnemonic::Not => {
                let size = self.op_size(instr, 0);
                let a = guest!(self, ip, self.read_op(instr, 0));
                guest!(self, ip, self.write_op(instr, 0, !a & Self::size_mask(size)));
            }

            Mnemonic::Neg => {
                let size = self.op_size(instr, 0);
                let a = guest!(self, ip, self.read_op(instr, 0));
                let result = self.do_sub(0, a, 0, size);
                guest!(self, ip, self.write_op(instr, 0, result));
            }

            Mnemonic::Inc | Mnemonic::Dec => {
                let size = self.op_size(instr, 0);
                let a = guest!(self, ip, self.read_op(instr, 0));

                // inc/dec preserve CF
                let saved_cf = self.flag(CF);
                let result = if mnemonic == Mnemonic::Inc {
                    self.do_add(a, 1, 0, size)
                } else {
                    self.do_sub(a, 1, 0, size)
                };
                self.set_flag(CF, saved_cf);

                guest!(self, ip, self.write_op(instr, 0, result));
            }

            Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar => {
                let size = self.op_size(instr, 0);
                let a = guest!(self, ip, self.read_op(instr, 0));
                let raw_count = guest!(self, ip, self.read_op(instr, 1));

                #[allow(clippy::cast_possible_truncation)]
                let count = (raw_count & if size == 8 { 0x3f } else { 0x1f }) as u32;

                if count != 0 {
                    let mask = Self::size_mask(size);
                    let bits = (size * 8) as u32;
                    let a = a & mask;

                    let (result, carry) = match mnemonic {
                        Mnemonic::Shl => {
                            let result = if count < 64 { (a << count) & mask } else { 0 };
                            let carry = if count <= bits {
                                (a >> (bits - count)) & 1 != 0
                            } else {
                                false
                            };
                            (result, carry)
                        }
                        Mnemonic::Shr => {
                            let result = if count < 64 { a >> count } else { 0 };
                            let carry = (a >> (count - 1).min(63)) & 1 != 0;
                            (result, carry)
                        }
                        _ => {
                            #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
                            let signed = Self::sign_extend(a, size) as i64;
                            let result = (signed >> count.min(63)) as u64 & mask;
                            let carry = (signed >> (count - 1).min(63)) & 1 != 0;
                            (result, carry)
                        }
                    };

                    self.set_flag(CF, carry);
                    if count == 1 {
                        let of = match mnemonic {
                            Mnemonic::Shl => (result & Self::sign_bit(size) != 0) != carry,
                            Mnemonic::Shr => a & Self::sign_bit(size) != 0,
                            _ => false,
                        };
                        self.set_flag(OF, of);
                    }
                    self.set_result_flags(result, size);

                    guest!(self, ip, self.write_op(instr, 0, result));
                }
            }

            Mnemonic::Push => {
                let value = guest!(self, ip, self.read_op(instr, 0));
                guest!(self, ip, self.push(value));
            }

            Mnemonic::Pop => {
                let value = guest!(self, ip, self.pop());
                guest!(self, ip, self.write_op(instr, 0, value));
            }

            Mnemonic::Call => {
                let target = guest!(self, ip, self.branch_target(instr));
                let return_addr = instr.next_ip();
                guest!(self, ip, self.push(return_addr));
                self.record_edge(ip, VirtAddr(target));
                self.regs.rip = target;
            }

            Mnemonic::Ret => {
                let target = guest!(self, ip, self.pop());
                if instr.op_count() > 0 {
                    // ret imm16 releases callee arguments
                    self.regs.rsp = self.regs.rsp.wrapping_add(Self::imm_value(instr, 0));
                }
                self.record_edge(ip, VirtAddr(target));
                self.regs.rip = target;
            }

            Mnemonic::Jmp => {
                let target = guest!(self, ip, self.branch_target(instr));
                self.record_edge(ip, VirtAddr(target));
                self.regs.rip = target;
            }

            Mnemonic::Cdq => {
                let edx = if self.regs.rax & 0x8000_0000 != 0 {
                    0xffff_ffff
                } else {
                    0
                };
                self.write_reg(Register::EDX, edx)?;
            }

            Mnemonic::Cqo => {
                #[allow(clippy::cast_possible_wrap)]
                let rdx = if (self.regs.rax as i64) < 0 { u64::MAX } else { 0 };
                self.regs.rdx = rdx;
            }

            Mnemonic::Cdqe => {
                self.regs.rax = Self::sign_extend(self.regs.rax, 4);
            }

            Mnemonic::Div => {
                let size = self.op_size(instr, 0);
                let divisor = guest!(self, ip, self.read_op(instr, 0));
                if let Some(fault) = self.do_div(divisor, size, ip) {
                    return Ok(Step::Done(RunOutcome::Crashed(fault)));
                }
            }

            Mnemonic::Mul => {
                let size = self.op_size(instr, 0);
                let a = guest!(self, ip, self.read_op(instr, 0));
                self.do_mul(a, size);
            }

            Mnemonic::Imul => {
                guest!(self, ip, self.do_imul(instr));
            }

            Mnemonic::Xchg => {
                let a = guest!(self, ip, self.read_op(instr, 0));
                let b = guest!(self, ip, self.read_op(instr, 1));
                guest!(self, ip, self.write_op(instr, 0, b));
                guest!(self, ip, self.write_op(instr, 1, a));
            }

            Mnemonic::Cld => self.set_flag(1 << 10, false),
            Mnemonic::Std => self.set_flag(1 << 10, true),
            Mnemonic::Clc => self.set_flag(CF, false),
            Mnemonic::Stc => self.set_flag(CF, true),

            _ => {
                // SETcc and CMOVcc carry a condition code without being jumps
                let cc = instr.condition_code();
                if cc != CC::None && instr.op_count() == 1 {
                    let value = u64::from(self.condition(cc));
                    guest!(self, ip, self.write_op(instr, 0, value));
                } else if cc != CC::None && instr.op_count() == 2 {
                    if self.condition(cc) {
                        let value = guest!(self, ip, self.read_op(instr, 1));
                        guest!(self, ip, self.write_op(instr, 0, value));
                    }
                } else {
                    return Err(Error::UnsupportedInstruction(
                        format!("{mnemonic:?}"),
                        ip,
                    ));
                }
            }
        }

        Ok(Step::Continue)
    }

    /// Unsigned divide of rdx:rax (truncated to `size`) by `divisor`
    fn do_div(&mut self, divisor: u64, size: usize, ip: VirtAddr) -> Option<Fault> {
        let fault = Fault {
            kind: FaultKind::DivideError,
            addr: VirtAddr(0),
            ip,
        };

        if size == 1 {
            let dividend = self.regs.rax & 0xffff;
            let divisor = divisor & 0xff;
            if divisor == 0 {
                return Some(fault);
            }
            let quotient = dividend / divisor;
            let remainder = dividend % divisor;
            if quotient > 0xff {
                return Some(fault);
            }
            self.regs.rax = (self.regs.rax & !0xffff) | (remainder << 8) | quotient;
            return None;
        }

        let mask = Self::size_mask(size);
        let divisor = u128::from(divisor & mask);
        if divisor == 0 {
            return Some(fault);
        }

        let dividend = if size == 8 {
            (u128::from(self.regs.rdx) << 64) | u128::from(self.regs.rax)
        } else {
            (u128::from(self.regs.rdx & mask) << (size * 8)) | u128::from(self.regs.rax & mask)
        };

        let quotient = dividend / divisor;
        let remainder = dividend % divisor;
        if quotient > u128::from(mask) {
            return Some(fault);
        }

        #[allow(clippy::cast_possible_truncation)]
        match size {
            2 => {
                self.regs.rax = (self.regs.rax & !0xffff) | (quotient as u64);
                self.regs.rdx = (self.regs.rdx & !0xffff) | (remainder as u64);
            }
            _ => {
                // 32 and 64 bit destinations zero extend
                self.regs.rax = quotient as u64;
                self.regs.rdx = remainder as u64;
            }
        }

        None
    }

    /// Unsigned widening multiply of rax by `a`
    fn do_mul(&mut self, a: u64, size: usize) {
        let mask = Self::size_mask(size);

        if size == 1 {
            let result = (self.regs.rax & 0xff) * (a & 0xff);
            self.regs.rax = (self.regs.rax & !0xffff) | (result & 0xffff);
            let overflow = result > 0xff;
            self.set_flag(CF, overflow);
            self.set_flag(OF, overflow);
            return;
        }

        let full = u128::from(self.regs.rax & mask) * u128::from(a & mask);
        #[allow(clippy::cast_possible_truncation)]
        let low = (full as u64) & mask;
        #[allow(clippy::cast_possible_truncation)]
        let high = ((full >> (size * 8)) as u64) & mask;

        match size {
            2 => {
                self.regs.rax = (self.regs.rax & !0xffff) | low;
                self.regs.rdx = (self.regs.rdx & !0xffff) | high;
            }
            _ => {
                self.regs.rax = low;
                self.regs.rdx = high;
            }
        }

        let overflow = high != 0;
        self.set_flag(CF, overflow);
        self.set_flag(OF, overflow);
    }

    /// All three imul forms
    fn do_imul(&mut self, instr: &Instruction) -> Result<(), Error> {
        #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
        match instr.op_count() {
            1 => {
                let size = self.op_size(instr, 0);
                let mask = Self::size_mask(size);
                let a = Self::sign_extend(self.regs.rax & mask, size) as i64;
                let b = Self::sign_extend(self.read_op(instr, 0)?, size) as i64;
                let full = i128::from(a) * i128::from(b);
                let low = (full as u64) & mask;
                let high = ((full >> (size * 8)) as u64) & mask;

                match size {
                    1 => self.regs.rax = (self.regs.rax & !0xffff) | (full as u64 & 0xffff),
                    2 => {
                        self.regs.rax = (self.regs.rax & !0xffff) | low;
                        self.regs.rdx = (self.regs.rdx & !0xffff) | high;
                    }
                    _ => {
                        self.regs.rax = low;
                        self.regs.rdx = high;
                    }
                }

                let overflow = full != i128::from(Self::sign_extend(low, size) as i64);
                self.set_flag(CF, overflow);
                self.set_flag(OF, overflow);
            }
            count @ (2 | 3) => {
                let size = self.op_size(instr, 0);
                let mask = Self::size_mask(size);

                let (a, b) = if count == 2 {
                    (self.read_op(instr, 0)?, self.read_op(instr, 1)?)
                } else {
                    (self.read_op(instr, 1)?, Self::imm_value(instr, 2))
                };

                let a = Self::sign_extend(a & mask, size) as i64;
                let b = Self::sign_extend(b & mask, size) as i64;
                let full = i128::from(a) * i128::from(b);
                let result = (full as u64) & mask;

                self.write_op(instr, 0, result)?;

                let overflow = full != i128::from(Self::sign_extend(result, size) as i64);
                self.set_flag(CF, overflow);
                self.set_flag(OF, overflow);
            }
            _ => {}
        }

        Ok(())
    }
}

impl Backend for EmulatorBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Emulator
    }

    fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }

    fn set_trace_type(&mut self, kind: TraceType) -> Result<(), Error> {
        if self.restored_once {
            return Err(Error::ConfiguredAfterRestore("trace type"));
        }
        self.trace_type = kind;
        self.tracer = Tracer::new(kind);
        Ok(())
    }

    fn enable_single_step(&mut self) -> Result<(), Error> {
        // The interpreter already steps every instruction
        if self.restored_once {
            return Err(Error::ConfiguredAfterRestore("single step"));
        }
        Ok(())
    }

    fn enable_edge_coverage(&mut self) -> Result<(), Error> {
        if self.restored_once {
            return Err(Error::ConfiguredAfterRestore("edge coverage"));
        }
        if self.edges.is_none() {
            self.edges = Some(FxIndexSet::default());
        }
        Ok(())
    }

    fn restore(&mut self) -> Result<(), Error> {
        let clean = self
            .clean
            .read()
            .map_err(|_| Error::Restore("clean snapshot lock poisoned".to_string()))?;

        let restored = self
            .memory
            .restore_from(&clean)
            .map_err(|err| Error::Restore(err.to_string()))?;
        log::trace!("emulator restore reverted {restored} pages");

        self.regs = self.baseline_regs.clone();
        self.tracer = Tracer::new(self.trace_type);
        self.restored_once = true;
        Ok(())
    }

    fn run(&mut self, input: &[u8]) -> Result<RunOutcome, Error> {
        if !input.is_empty() {
            let addr = self.config.input_addr.ok_or(Error::NoInputAddress)?;
            if input.len() > self.config.max_input_size {
                return Err(Error::InputTooLarge(input.len(), self.config.max_input_size));
            }

            self.memory.write_bytes_dirty(addr, self.regs.cr3(), input)?;
            if let Some(len_addr) = self.config.input_len_addr {
                self.memory
                    .write_u64_dirty(len_addr, self.regs.cr3(), input.len() as u64)?;
            }
        }

        self.instructions_executed = 0;

        let outcome = loop {
            match self.step()? {
                Step::Done(outcome) => break outcome,
                Step::Continue => {}
            }

            self.instructions_executed += 1;
            if self.limit != 0 && self.instructions_executed >= self.limit {
                break RunOutcome::LimitExceeded;
            }
        };

        log::debug!(
            "emulator run: {outcome} after {} instructions",
            self.instructions_executed
        );
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
        self.edges.as_ref()
    }

    fn dirty_pages(&self) -> usize {
        self.memory.dirty_pages().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn emulator(code: &[u8]) -> EmulatorBackend {
        let snapshot = testutil::snapshot_with_code(code);
        EmulatorBackend::new(&snapshot).unwrap()
    }

    #[test]
    fn hlt_completes_with_zero_dirty_pages() {
        let mut emu = emulator(&[0xf4]);
        emu.set_limit(0);
        emu.restore().unwrap();

        let outcome = emu.run(&[]).unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(emu.dirty_pages(), 0);
    }

    #[test]
    fn infinite_loop_hits_exact_instruction_limit() {
        // jmp $
        let mut emu = emulator(&[0xeb, 0xfe]);
        emu.set_limit(100);
        emu.restore().unwrap();

        let outcome = emu.run(&[]).unwrap();
        assert_eq!(outcome, RunOutcome::LimitExceeded);
        assert_eq!(emu.instructions_executed(), 100);
    }

    #[test]
    fn write_to_unmapped_memory_crashes() {
        // mov [0x500000], rax
        let mut emu = emulator(&[0x48, 0x89, 0x04, 0x25, 0x00, 0x00, 0x50, 0x00]);
        emu.restore().unwrap();

        let outcome = emu.run(&[]).unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Crashed(Fault {
                kind: FaultKind::WriteUnmapped,
                addr: VirtAddr(0x50_0000),
                ip: VirtAddr(testutil::CODE_VADDR),
            })
        );
    }

    #[test]
    fn write_to_read_only_page_crashes() {
        // mov [0x400800], rax (inside the code page)
        let mut emu = emulator(&[0x48, 0x89, 0x04, 0x25, 0x00, 0x08, 0x40, 0x00]);
        emu.restore().unwrap();

        let outcome = emu.run(&[]).unwrap();
        let RunOutcome::Crashed(fault) = outcome else {
            panic!("expected crash, got {outcome:?}");
        };
        assert_eq!(fault.kind, FaultKind::WriteReadOnly);
        assert_eq!(fault.addr, VirtAddr(0x40_0800));
    }

    #[test]
    fn divide_by_zero_crashes() {
        // xor edx, edx ; div edx
        let mut emu = emulator(&[0x31, 0xd2, 0xf7, 0xf2]);
        emu.restore().unwrap();

        let outcome = emu.run(&[]).unwrap();
        let RunOutcome::Crashed(fault) = outcome else {
            panic!("expected crash, got {outcome:?}");
        };
        assert_eq!(fault.kind, FaultKind::DivideError);
        assert_eq!(fault.ip, VirtAddr(testutil::CODE_VADDR + 2));
    }

    #[test]
    fn int3_crashes_as_breakpoint() {
        let mut emu = emulator(&[0xcc]);
        emu.restore().unwrap();

        let outcome = emu.run(&[]).unwrap();
        let RunOutcome::Crashed(fault) = outcome else {
            panic!("expected crash, got {outcome:?}");
        };
        assert_eq!(fault.kind, FaultKind::Breakpoint);
    }

    #[test]
    fn guest_write_is_dirty_tracked_and_restored() {
        // mov qword [0x402000], 42 ; hlt
        let mut emu = emulator(&[
            0x48, 0xc7, 0x04, 0x25, 0x00, 0x20, 0x40, 0x00, 0x2a, 0x00, 0x00, 0x00, 0xf4,
        ]);
        emu.restore().unwrap();

        assert_eq!(emu.run(&[]).unwrap(), RunOutcome::Completed);

        // Exactly the one written page is dirty
        assert_eq!(emu.dirty_pages(), 1);

        let mut buf = [0u8; 8];
        emu.read_bytes(VirtAddr(testutil::DATA_VADDR), &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 42);

        // Restore reverts the write and clears the dirty set
        emu.restore().unwrap();
        assert_eq!(emu.dirty_pages(), 0);
        emu.read_bytes(VirtAddr(testutil::DATA_VADDR), &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0);

        // Restoring again with no run in between changes nothing
        emu.restore().unwrap();
        assert_eq!(emu.dirty_pages(), 0);
        assert_eq!(emu.regs().rip, testutil::CODE_VADDR);
    }

    #[test]
    fn rip_trace_records_exact_sequence() {
        // xor eax, eax
        // loop: inc eax ; cmp eax, 3 ; jne loop
        // hlt
        let mut emu = emulator(&[
            0x31, 0xc0, 0xff, 0xc0, 0x83, 0xf8, 0x03, 0x75, 0xf9, 0xf4,
        ]);
        emu.set_trace_type(TraceType::Rip).unwrap();
        emu.enable_single_step().unwrap();
        emu.restore().unwrap();

        assert_eq!(emu.run(&[]).unwrap(), RunOutcome::Completed);
        assert_eq!(emu.regs().rax, 3);

        let base = testutil::CODE_VADDR;
        let expected: Vec<VirtAddr> = [
            0, 2, 4, 7, 2, 4, 7, 2, 4, 7, 9,
        ]
        .iter()
        .map(|off| VirtAddr(base + off))
        .collect();

        let trace = emu.take_trace();
        assert_eq!(trace.rips(), expected.as_slice());
    }

    #[test]
    fn edge_coverage_records_taken_branches() {
        let mut emu = emulator(&[
            0x31, 0xc0, 0xff, 0xc0, 0x83, 0xf8, 0x03, 0x75, 0xf9, 0xf4,
        ]);
        emu.enable_edge_coverage().unwrap();
        emu.restore().unwrap();
        emu.run(&[]).unwrap();

        let base = testutil::CODE_VADDR;
        let edges = emu.edges().unwrap();
        assert!(edges.contains(&(VirtAddr(base + 7), VirtAddr(base + 2))));

        // The fall-through at the loop exit is not an edge
        assert_eq!(edges.len(), 1);
    }

    #[test]
    fn call_and_ret_balance_the_stack() {
        // call 0x400008 ; hlt ; nop ; nop ; ret
        let mut emu = emulator(&[
            0xe8, 0x03, 0x00, 0x00, 0x00, 0xf4, 0x90, 0x90, 0xc3,
        ]);
        emu.restore().unwrap();

        assert_eq!(emu.run(&[]).unwrap(), RunOutcome::Completed);
        assert_eq!(emu.regs().rsp, testutil::INITIAL_RSP);

        // rip sits past the hlt, matching hardware halt exits
        assert_eq!(emu.regs().rip, testutil::CODE_VADDR + 6);

        // Only the stack page was written
        assert_eq!(emu.dirty_pages(), 1);
    }

    #[test]
    fn reset_address_completes_before_executing() {
        let mut snapshot = testutil::snapshot_with_code(&[0x90, 0x90, 0xf4]);
        snapshot
            .config
            .reset_addresses
            .push(VirtAddr(testutil::CODE_VADDR + 2));

        let mut emu = EmulatorBackend::new(&snapshot).unwrap();
        emu.set_trace_type(TraceType::Rip).unwrap();
        emu.restore().unwrap();

        assert_eq!(emu.run(&[]).unwrap(), RunOutcome::Completed);

        // Both nops traced, the hlt at the reset address never ran
        assert_eq!(emu.take_trace().rips().len(), 2);
    }

    #[test]
    fn input_is_injected_and_reverted_by_restore() {
        let mut snapshot = testutil::snapshot_with_code(&[0xf4]);
        snapshot.config.input_addr = Some(VirtAddr(testutil::DATA_VADDR));
        snapshot.config.input_len_addr = Some(VirtAddr(testutil::DATA_VADDR + 0xff8));

        let mut emu = EmulatorBackend::new(&snapshot).unwrap();
        emu.restore().unwrap();

        assert_eq!(emu.run(b"AB").unwrap(), RunOutcome::Completed);

        let mut buf = [0u8; 2];
        emu.read_bytes(VirtAddr(testutil::DATA_VADDR), &mut buf).unwrap();
        assert_eq!(&buf, b"AB");

        let mut len = [0u8; 8];
        emu.read_bytes(VirtAddr(testutil::DATA_VADDR + 0xff8), &mut len)
            .unwrap();
        assert_eq!(u64::from_le_bytes(len), 2);

        emu.restore().unwrap();
        emu.read_bytes(VirtAddr(testutil::DATA_VADDR), &mut buf).unwrap();
        assert_eq!(buf, [0, 0]);
    }

    #[test]
    fn run_with_input_but_no_input_addr_is_an_error() {
        let mut emu = emulator(&[0xf4]);
        emu.restore().unwrap();
        assert!(matches!(emu.run(b"data"), Err(Error::NoInputAddress)));
    }

    #[test]
    fn sub_register_writes_preserve_or_zero_extend() {
        // mov al, 0xff ; movzx ecx, al ; movsx edx, al ; hlt
        let mut emu = emulator(&[
            0xb0, 0xff, 0x0f, 0xb6, 0xc8, 0x0f, 0xbe, 0xd0, 0xf4,
        ]);
        emu.restore().unwrap();

        assert_eq!(emu.run(&[]).unwrap(), RunOutcome::Completed);
        assert_eq!(emu.regs().rax & 0xff, 0xff);
        assert_eq!(emu.regs().rcx, 0xff);

        // movsx to a 32 bit destination zero extends into the full register
        assert_eq!(emu.regs().rdx, 0xffff_ffff);
    }

    #[test]
    fn execute_from_non_executable_page_crashes() {
        // mov rax, 0x402000 ; jmp rax
        let mut emu = emulator(&[
            0x48, 0xc7, 0xc0, 0x00, 0x20, 0x40, 0x00, 0xff, 0xe0,
        ]);
        emu.restore().unwrap();

        let outcome = emu.run(&[]).unwrap();
        let RunOutcome::Crashed(fault) = outcome else {
            panic!("expected crash, got {outcome:?}");
        };
        assert_eq!(fault.kind, FaultKind::ExecViolation);
        assert_eq!(fault.addr, VirtAddr(testutil::DATA_VADDR));
    }

    #[test]
    fn unsupported_register_operand_is_an_error() {
        // mov eax, cs ; hlt - segment register reads are not implemented
        let mut emu = emulator(&[0x8c, 0xc8, 0xf4]);
        emu.restore().unwrap();

        assert!(matches!(
            emu.run(&[]),
            Err(Error::UnsupportedInstruction(..))
        ));
    }

    #[test]
    fn instruction_straddling_an_unmapped_page_is_an_exec_fault() {
        // Fill the code page with nops and end it on the first two bytes
        // of a longer mov, so the fetch runs into the unmapped next page
        let mut code = vec![0x90u8; 0x1000];
        code[0xffe] = 0x48;
        code[0xfff] = 0xc7;

        let mut emu = emulator(&code);
        emu.restore().unwrap();

        let outcome = emu.run(&[]).unwrap();
        let RunOutcome::Crashed(fault) = outcome else {
            panic!("expected crash, got {outcome:?}");
        };
        assert_eq!(fault.kind, FaultKind::ExecViolation);
        assert_eq!(fault.addr, VirtAddr(testutil::CODE_VADDR + 0x1000));
        assert_eq!(fault.ip, VirtAddr(testutil::CODE_VADDR + 0xffe));
    }

    #[test]
    fn instrumentation_is_frozen_after_first_restore() {
        let mut emu = emulator(&[0xf4]);
        emu.restore().unwrap();

        assert!(matches!(
            emu.set_trace_type(TraceType::Rip),
            Err(Error::ConfiguredAfterRestore(_))
        ));
        assert!(matches!(
            emu.enable_edge_coverage(),
            Err(Error::ConfiguredAfterRestore(_))
        ));
    }
}
