//! Hot-path promotion to the native tier (the `dynarec` feature).
//!
//! Blocks earn native compilation by visit count; once hot, the loop body
//! headed by the block is gathered, lowered to the backend's region form,
//! and compiled. Compiled regions live in a bounded LFU code cache, and a
//! compile failure is cached so the block stays on the template tier
//! without retry storms.

use std::collections::{BTreeSet, HashMap};

use rv32_dynarec::{
    CompileError, CompileRequest, CompiledRegion, Cond, GuestRegs, MemWidth, Op, RegionBlock,
    RegionCompiler, RuntimeCallbacks,
};

use crate::cache::Cache;
use crate::cfg;
use crate::cpu::Cpu;
use crate::io::SystemIo;
use crate::ir::{Artifact, Block, BlockArena, BlockRef, IrInsn, Opcode};
use crate::riscv::{EngineConfig, RiscV};

pub(crate) struct NativeTier {
    backend: Box<dyn RegionCompiler>,
    code_cache: Cache<CompiledRegion>,
    failed: BTreeSet<u32>,
    hot_counts: HashMap<u32, u32>,
    hot_threshold: u32,
}

impl NativeTier {
    /// Backend selection from `RV32_DYNAREC`, mirroring how the engine
    /// itself is chosen: unset/off means no native tier.
    pub(crate) fn from_env(config: &EngineConfig) -> Option<Self> {
        let raw = std::env::var("RV32_DYNAREC").ok()?;
        let normalized = raw.trim().to_ascii_lowercase();
        let backend: Box<dyn RegionCompiler> = match normalized.as_str() {
            "" | "0" | "off" | "false" | "no" => return None,
            "1" | "on" | "true" | "yes" | "cranelift" => {
                Box::new(rv32_dynarec::clif::CraneliftBackend::default())
            }
            "x64" => {
                #[cfg(all(unix, target_arch = "x86_64"))]
                {
                    Box::new(rv32_dynarec::x64::X64Backend::new())
                }
                #[cfg(not(all(unix, target_arch = "x86_64")))]
                {
                    log::warn!("RV32_DYNAREC=x64 is not supported on this host; using cranelift");
                    Box::new(rv32_dynarec::clif::CraneliftBackend::default())
                }
            }
            _ => {
                log::warn!("Unknown RV32_DYNAREC value {:?}; native tier disabled", raw);
                return None;
            }
        };
        Some(Self::new(backend, config))
    }

    pub(crate) fn new(backend: Box<dyn RegionCompiler>, config: &EngineConfig) -> Self {
        Self {
            backend,
            code_cache: Cache::new(config.lfu_capacity),
            failed: BTreeSet::new(),
            hot_counts: HashMap::new(),
            hot_threshold: config.hot_threshold.max(1),
        }
    }

    fn should_attempt_compile(&mut self, pc: u32) -> bool {
        let count = self.hot_counts.entry(pc).or_insert(0);
        *count = count.saturating_add(1);
        *count >= self.hot_threshold
    }
}

impl RiscV {
    /// Engine with an explicitly chosen native backend.
    pub fn with_native_backend(config: EngineConfig, backend: Box<dyn RegionCompiler>) -> Self {
        let mut rv = Self::new(config);
        rv.native = Some(NativeTier::new(backend, &rv.config));
        rv
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.native {
            Some(tier) => tier.backend.name(),
            None => "template",
        }
    }

    /// Try to run `block_ref` through the native tier. Returns true if a
    /// native region executed (PC and cycle already advanced).
    pub(crate) fn try_native<I: SystemIo>(
        &mut self,
        io: &mut I,
        block_ref: BlockRef,
        cycle_target: u64,
    ) -> bool {
        let Some(block) = self.arena.get(block_ref) else {
            return false;
        };
        let pc = block.pc_start;

        let cached = {
            let Some(tier) = self.native.as_mut() else {
                return false;
            };
            if tier.code_cache.get(pc).is_some() {
                true
            } else if tier.failed.contains(&pc) || !tier.should_attempt_compile(pc) {
                return false;
            } else {
                false
            }
        };
        if cached {
            return self.run_native(io, pc, cycle_target);
        }

        let body = cfg::detect_loop(&self.arena, block_ref);
        let blocks = match convert_region(&self.arena, &body) {
            Ok(blocks) => blocks,
            Err(err) => {
                log::debug!("native promotion rejected at {:#010x}: {:?}", pc, err);
                self.mark_failed(pc);
                return false;
            }
        };
        let request = CompileRequest {
            root: pc,
            blocks: &blocks,
        };
        let compiled = {
            let Some(tier) = self.native.as_mut() else {
                return false;
            };
            match tier.backend.compile(&request) {
                Ok(region) => {
                    tier.hot_counts.remove(&pc);
                    Ok(tier.code_cache.put(pc, region).map(|(old_pc, _)| old_pc))
                }
                Err(err) => Err(err),
            }
        };
        match compiled {
            Ok(evicted) => {
                if let Some(old_pc) = evicted {
                    self.clear_native_artifact(old_pc);
                }
                if let Some(root) = self.arena.get_mut(block_ref) {
                    root.artifact = Artifact::Native;
                }
                self.stats.native_regions += 1;
                self.run_native(io, pc, cycle_target)
            }
            Err(err) => {
                log::debug!(
                    "native compile failed at {:#010x} (backend={}): {:?}",
                    pc,
                    self.backend_name(),
                    err
                );
                self.mark_failed(pc);
                false
            }
        }
    }

    fn mark_failed(&mut self, pc: u32) {
        if let Some(tier) = self.native.as_mut() {
            tier.failed.insert(pc);
            tier.hot_counts.remove(&pc);
        }
        self.stats.native_compile_failures += 1;
    }

    fn clear_native_artifact(&mut self, pc: u32) {
        let stale = self
            .arena
            .iter()
            .find(|(_, b)| b.pc_start == pc && b.artifact == Artifact::Native)
            .map(|(r, _)| r);
        if let Some(r) = stale {
            if let Some(block) = self.arena.get_mut(r) {
                block.artifact = Artifact::None;
            }
        }
    }

    fn run_native<I: SystemIo>(&mut self, io: &mut I, pc: u32, cycle_target: u64) -> bool {
        let mut regs = GuestRegs::new();
        regs.x = self.cpu.x;
        regs.pc = self.cpu.pc;
        regs.cycle = self.cpu.cycle;
        regs.cycle_limit = cycle_target;

        let mut ctx = CallbackContext::<I> {
            regs: &mut regs,
            cpu: &mut self.cpu,
            io,
        };
        let callbacks = RuntimeCallbacks {
            user: (&mut ctx as *mut CallbackContext<I>).cast::<u8>(),
            read_b: cb_read_b::<I>,
            read_s: cb_read_s::<I>,
            read_w: cb_read_w::<I>,
            write_b: cb_write_b::<I>,
            write_s: cb_write_s::<I>,
            write_w: cb_write_w::<I>,
            ecall: cb_ecall::<I>,
            ebreak: cb_ebreak::<I>,
        };

        let Some(tier) = self.native.as_ref() else {
            return false;
        };
        let Some(region) = tier.code_cache.peek(pc) else {
            return false;
        };
        region.execute(&mut regs, &callbacks);

        self.cpu.x = regs.x;
        self.cpu.x[0] = 0;
        self.cpu.pc = regs.pc;
        self.cpu.cycle = regs.cycle;
        self.stats.native_executions += 1;
        true
    }
}

struct CallbackContext<I: SystemIo> {
    regs: *mut GuestRegs,
    cpu: *mut Cpu,
    io: *mut I,
}

unsafe extern "C" fn cb_read_b<I: SystemIo>(user: *mut u8, addr: u32) -> u32 {
    // SAFETY: user is the CallbackContext<I> built in `run_native`.
    let ctx = unsafe { &mut *(user as *mut CallbackContext<I>) };
    // SAFETY: pointers come from live mutable references held by `run_native`.
    let io = unsafe { &mut *ctx.io };
    u32::from(io.mem_read_b(addr))
}

unsafe extern "C" fn cb_read_s<I: SystemIo>(user: *mut u8, addr: u32) -> u32 {
    // SAFETY: user is the CallbackContext<I> built in `run_native`.
    let ctx = unsafe { &mut *(user as *mut CallbackContext<I>) };
    // SAFETY: pointers come from live mutable references held by `run_native`.
    let io = unsafe { &mut *ctx.io };
    u32::from(io.mem_read_s(addr))
}

unsafe extern "C" fn cb_read_w<I: SystemIo>(user: *mut u8, addr: u32) -> u32 {
    // SAFETY: user is the CallbackContext<I> built in `run_native`.
    let ctx = unsafe { &mut *(user as *mut CallbackContext<I>) };
    // SAFETY: pointers come from live mutable references held by `run_native`.
    let io = unsafe { &mut *ctx.io };
    io.mem_read_w(addr)
}

unsafe extern "C" fn cb_write_b<I: SystemIo>(user: *mut u8, addr: u32, data: u32) {
    // SAFETY: user is the CallbackContext<I> built in `run_native`.
    let ctx = unsafe { &mut *(user as *mut CallbackContext<I>) };
    // SAFETY: pointers come from live mutable references held by `run_native`.
    let io = unsafe { &mut *ctx.io };
    io.mem_write_b(addr, data as u8);
}

unsafe extern "C" fn cb_write_s<I: SystemIo>(user: *mut u8, addr: u32, data: u32) {
    // SAFETY: user is the CallbackContext<I> built in `run_native`.
    let ctx = unsafe { &mut *(user as *mut CallbackContext<I>) };
    // SAFETY: pointers come from live mutable references held by `run_native`.
    let io = unsafe { &mut *ctx.io };
    io.mem_write_s(addr, data as u16);
}

unsafe extern "C" fn cb_write_w<I: SystemIo>(user: *mut u8, addr: u32, data: u32) {
    // SAFETY: user is the CallbackContext<I> built in `run_native`.
    let ctx = unsafe { &mut *(user as *mut CallbackContext<I>) };
    // SAFETY: pointers come from live mutable references held by `run_native`.
    let io = unsafe { &mut *ctx.io };
    io.mem_write_w(addr, data);
}

/// Environment-call and breakpoint callbacks run against the real CPU
/// state, so the guest registers are synced across the boundary both ways.
unsafe extern "C" fn cb_ecall<I: SystemIo>(user: *mut u8) {
    // SAFETY: user is the CallbackContext<I> built in `run_native`.
    let ctx = unsafe { &mut *(user as *mut CallbackContext<I>) };
    // SAFETY: pointers come from live mutable references held by `run_native`.
    let (regs, cpu, io) = unsafe { (&mut *ctx.regs, &mut *ctx.cpu, &mut *ctx.io) };
    cpu.x = regs.x;
    cpu.pc = regs.pc;
    cpu.cycle = regs.cycle;
    io.on_ecall(cpu);
    regs.x = cpu.x;
    regs.pc = cpu.pc;
    regs.cycle = cpu.cycle;
}

unsafe extern "C" fn cb_ebreak<I: SystemIo>(user: *mut u8) {
    // SAFETY: user is the CallbackContext<I> built in `run_native`.
    let ctx = unsafe { &mut *(user as *mut CallbackContext<I>) };
    // SAFETY: pointers come from live mutable references held by `run_native`.
    let (regs, cpu, io) = unsafe { (&mut *ctx.regs, &mut *ctx.cpu, &mut *ctx.io) };
    cpu.x = regs.x;
    cpu.pc = regs.pc;
    cpu.cycle = regs.cycle;
    io.on_ebreak(cpu);
    regs.x = cpu.x;
    regs.pc = cpu.pc;
    regs.cycle = cpu.cycle;
}

fn convert_region(arena: &BlockArena, body: &[BlockRef]) -> Result<Vec<RegionBlock>, CompileError> {
    body.iter()
        .filter_map(|r| arena.get(*r))
        .map(convert_block)
        .collect()
}

fn convert_block(block: &Block) -> Result<RegionBlock, CompileError> {
    let mut ops = Vec::new();
    let mut n_insn = 0u32;
    for insn in &block.ir {
        n_insn += convert_insn(insn, &mut ops)?;
    }
    Ok(RegionBlock {
        pc_start: block.pc_start,
        pc_end: block.pc_end,
        n_insn,
        ops,
    })
}

/// Lower one IR node to backend ops. PC-relative values are resolved to
/// absolutes so backends never consult the guest PC mid-block. Returns
/// how many cycle units the node retires.
fn convert_insn(insn: &IrInsn, ops: &mut Vec<Op>) -> Result<u32, CompileError> {
    use Opcode::*;
    let (rd, rs1, rs2) = (insn.rd, insn.rs1, insn.rs2);
    let imm = insn.imm;
    let next_pc = insn.pc.wrapping_add(u32::from(insn.insn_len));
    let op = match insn.opcode {
        Nop | Fence => Op::Nop,
        Lui => Op::Li { rd, imm },
        Auipc => Op::Li {
            rd,
            imm: insn.pc.wrapping_add(imm as u32) as i32,
        },
        FusedLi => Op::Li {
            rd,
            imm: insn
                .pc
                .wrapping_add(insn.imm as u32)
                .wrapping_add(insn.imm2 as u32) as i32,
        },
        Addi => Op::Addi { rd, rs1, imm },
        Slti => Op::Slti { rd, rs1, imm },
        Sltiu => Op::Sltiu { rd, rs1, imm },
        Xori => Op::Xori { rd, rs1, imm },
        Ori => Op::Ori { rd, rs1, imm },
        Andi => Op::Andi { rd, rs1, imm },
        Slli => Op::Slli { rd, rs1, shamt: insn.shamt },
        Srli => Op::Srli { rd, rs1, shamt: insn.shamt },
        Srai => Op::Srai { rd, rs1, shamt: insn.shamt },
        Add => Op::Add { rd, rs1, rs2 },
        Sub => Op::Sub { rd, rs1, rs2 },
        Sll => Op::Sll { rd, rs1, rs2 },
        Slt => Op::Slt { rd, rs1, rs2 },
        Sltu => Op::Sltu { rd, rs1, rs2 },
        Xor => Op::Xor { rd, rs1, rs2 },
        Srl => Op::Srl { rd, rs1, rs2 },
        Sra => Op::Sra { rd, rs1, rs2 },
        Or => Op::Or { rd, rs1, rs2 },
        And => Op::And { rd, rs1, rs2 },
        Mul => Op::Mul { rd, rs1, rs2 },
        Mulh => Op::Mulh { rd, rs1, rs2 },
        Mulhsu => Op::Mulhsu { rd, rs1, rs2 },
        Mulhu => Op::Mulhu { rd, rs1, rs2 },
        Div => Op::Div { rd, rs1, rs2 },
        Divu => Op::Divu { rd, rs1, rs2 },
        Rem => Op::Rem { rd, rs1, rs2 },
        Remu => Op::Remu { rd, rs1, rs2 },
        Lb | Lbu => Op::Load {
            width: MemWidth::Byte,
            signed: insn.opcode == Lb,
            rd,
            rs1,
            imm,
        },
        Lh | Lhu => Op::Load {
            width: MemWidth::Half,
            signed: insn.opcode == Lh,
            rd,
            rs1,
            imm,
        },
        Lw => Op::Load {
            width: MemWidth::Word,
            signed: false,
            rd,
            rs1,
            imm,
        },
        Sb => Op::Store { width: MemWidth::Byte, rs1, rs2, imm },
        Sh => Op::Store { width: MemWidth::Half, rs1, rs2, imm },
        Sw => Op::Store { width: MemWidth::Word, rs1, rs2, imm },
        FusedLw => {
            for part in &insn.fused {
                ops.push(Op::Load {
                    width: MemWidth::Word,
                    signed: false,
                    rd: part.reg,
                    rs1: part.rs1,
                    imm: part.imm,
                });
            }
            return Ok(insn.fused.len() as u32);
        }
        FusedSw => {
            for part in &insn.fused {
                ops.push(Op::Store {
                    width: MemWidth::Word,
                    rs1: part.rs1,
                    rs2: part.reg,
                    imm: part.imm,
                });
            }
            return Ok(insn.fused.len() as u32);
        }
        Jal => Op::Jump {
            rd,
            link: next_pc,
            target: insn.pc.wrapping_add(imm as u32),
        },
        Jalr => Op::JumpReg {
            rd,
            rs1,
            imm,
            link: next_pc,
        },
        Beq | Bne | Blt | Bge | Bltu | Bgeu => Op::Branch {
            cond: match insn.opcode {
                Beq => Cond::Eq,
                Bne => Cond::Ne,
                Blt => Cond::Lt,
                Bge => Cond::Ge,
                Bltu => Cond::Ltu,
                _ => Cond::Geu,
            },
            rs1,
            rs2,
            taken: insn.pc.wrapping_add(imm as u32),
            fallthrough: next_pc,
        },
        Ecall => Op::EnvCall { pc: insn.pc },
        Ebreak => Op::Break { pc: insn.pc },
        // CSR, WFI, MRET and the fetch barrier need the engine's own
        // machinery; regions containing them stay on the template tier.
        Csrrw | Csrrs | Csrrc | Csrrwi | Csrrsi | Csrrci | Wfi | Mret | FenceI => {
            return Err(CompileError::Unsupported { pc: insn.pc });
        }
    };
    ops.push(op);
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::riscv::tests::TestIo;
    use crate::riscv::{BlockCachePolicy, StopReason};

    fn hot_config() -> EngineConfig {
        EngineConfig {
            hot_threshold: 2,
            block_cache: BlockCachePolicy::Lfu,
            ..EngineConfig::default()
        }
    }

    fn loop_program() -> Vec<u32> {
        vec![
            0x0640_0293, // addi t0, x0, 100
            0x0000_0313, // addi t1, x0, 0
            // loop:
            0x0053_0333, // add  t1, t1, t0
            0xfff2_8293, // addi t0, t0, -1
            0xfe02_9ce3, // bne  t0, x0, -8
            0x1050_0073, // wfi
        ]
    }

    fn run_with_backend(backend: Box<dyn RegionCompiler>) -> (RiscV, TestIo) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut io = TestIo::new(0x1000);
        io.load_words(0, &loop_program());
        let mut rv = RiscV::with_native_backend(hot_config(), backend);
        rv.reset(0);
        let reason = rv.step(&mut io, 100_000);
        assert_eq!(reason, StopReason::WaitForInterrupt);
        (rv, io)
    }

    fn check_sum_result(rv: &RiscV) {
        assert_eq!(rv.reg(5), 0); // t0 counted down
        assert_eq!(rv.reg(6), 5050); // sum 1..=100
        assert!(rv.stats().native_regions >= 1, "loop was never promoted");
        assert!(rv.stats().native_executions >= 1);
    }

    #[test]
    fn cranelift_backend_runs_the_hot_loop() {
        let (rv, _) = run_with_backend(Box::new(rv32_dynarec::clif::CraneliftBackend::default()));
        check_sum_result(&rv);
        assert_eq!(rv.backend_name(), "cranelift");
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    #[test]
    fn x64_backend_runs_the_hot_loop() {
        let (rv, _) = run_with_backend(Box::new(rv32_dynarec::x64::X64Backend::new()));
        check_sum_result(&rv);
        assert_eq!(rv.backend_name(), "x86-64");
    }

    #[test]
    fn unsupported_blocks_are_fail_cached_once() {
        let mut io = TestIo::new(0x1000);
        io.load_words(
            0,
            &[
                0x3400_9073, // csrw mscratch, x1 (unsupported natively)
                0x0000_006f, // jal x0, 0
            ],
        );
        let mut rv = RiscV::with_native_backend(
            hot_config(),
            Box::new(rv32_dynarec::clif::CraneliftBackend::default()),
        );
        rv.reset(0);
        rv.step(&mut io, 64);
        assert_eq!(rv.stats().native_compile_failures, 1);
        assert_eq!(rv.stats().native_executions, 0);
    }

    #[test]
    fn backends_match_the_template_tier_on_memory_and_division() {
        let program = [
            0x4000_0513u32, // addi a0, x0, 1024
            0x0fa0_0093,    // addi x1, x0, 250
            0x0070_0113,    // addi x2, x0, 7
            // loop:
            0x0220_c1b3, // div  x3, x1, x2
            0x0220_e233, // rem  x4, x1, x2
            0x0035_2023, // sw   x3, 0(a0)
            0x0005_2283, // lw   t0, 0(a0)
            0xfff0_8093, // addi x1, x1, -1
            0x0640_0393, // addi x7, x0, 100
            0xfe70_94e3, // bne  x1, x7, -24
            0x1050_0073, // wfi
        ];
        let mut io_t = TestIo::new(0x1000);
        io_t.load_words(0, &program);
        let mut template = RiscV::new(EngineConfig::default());
        template.reset(0);
        template.step(&mut io_t, 100_000);

        let mut io_n = TestIo::new(0x1000);
        io_n.load_words(0, &program);
        let mut native = RiscV::with_native_backend(
            hot_config(),
            Box::new(rv32_dynarec::clif::CraneliftBackend::default()),
        );
        native.reset(0);
        native.step(&mut io_n, 100_000);

        for r in 0..8 {
            assert_eq!(template.reg(r), native.reg(r), "x{r} diverged");
        }
        assert_eq!(template.pc(), native.pc());
        assert_eq!(io_t.mem, io_n.mem);
        assert!(native.stats().native_executions >= 1);
    }
}
