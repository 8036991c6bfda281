//! The engine: translation-cache-driven dispatch loop, block formation,
//! and the embedder-facing API.

use crate::block_map::BlockMap;
use crate::cache::Cache;
use crate::code_page::{CodePagePool, DEFAULT_N_PAGES};
use crate::cpu::{Cpu, Exception};
use crate::io::SystemIo;
use crate::ir::{Artifact, Block, BlockArena, BlockRef, IrInsn, MemOp, Opcode};
use crate::stats::Stats;
use crate::template::{self, PageOutcome};
use crate::{decode, parse_env_u32, parse_env_usize};

/// Which translation-cache policy backs the block cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCachePolicy {
    /// Open-addressed table, flushed wholesale on overflow. Cheap lookups,
    /// link-safe invalidation; the default for the template-compiler path.
    FlushAll,
    /// Bounded LFU. Evicts block-by-block, so translated work survives
    /// overflow; preferred when native compilation makes blocks expensive.
    Lfu,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub block_cache: BlockCachePolicy,
    /// Policy A table size (rounded up to a power of two).
    pub block_map_capacity: u32,
    /// Policy B entry bound.
    pub lfu_capacity: usize,
    /// Block formation guard. Clamped so a maximal block always fits one
    /// code page.
    pub max_block_insns: u32,
    pub n_code_pages: usize,
    /// Visit count at which a block is considered for native promotion.
    pub hot_threshold: u32,
}

/// Hard cap on block length: the widest non-terminator fragment is 8
/// bytes, so 510 instructions plus terminator and halt stay within a page.
const MAX_BLOCK_INSNS_LIMIT: u32 = 510;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_cache: BlockCachePolicy::FlushAll,
            block_map_capacity: 1024,
            lfu_capacity: 1024,
            max_block_insns: 256,
            n_code_pages: DEFAULT_N_PAGES,
            hot_threshold: 64,
        }
    }
}

impl EngineConfig {
    /// Default configuration with `RV32_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("RV32_BLOCK_CACHE") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "flush" => config.block_cache = BlockCachePolicy::FlushAll,
                "lfu" => config.block_cache = BlockCachePolicy::Lfu,
                other => log::warn!("Unknown RV32_BLOCK_CACHE value {:?}; keeping default", other),
            }
        }
        config.block_map_capacity =
            parse_env_u32("RV32_BLOCK_MAP_CAPACITY", config.block_map_capacity);
        config.lfu_capacity = parse_env_usize("RV32_LFU_CAPACITY", config.lfu_capacity);
        config.max_block_insns = parse_env_u32("RV32_MAX_BLOCK_INSNS", config.max_block_insns);
        config.n_code_pages = parse_env_usize("RV32_CODE_PAGES", config.n_code_pages);
        config.hot_threshold = parse_env_u32("RV32_DYNAREC_HOT_THRESHOLD", config.hot_threshold);
        config
    }

    fn max_insns(&self) -> u32 {
        self.max_block_insns.clamp(1, MAX_BLOCK_INSNS_LIMIT)
    }
}

/// Why a `step` call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Cycle budget exhausted.
    Budget,
    /// The halt flag was raised.
    Halted,
    /// The guest executed WFI.
    WaitForInterrupt,
    /// A synchronous trap was delivered; PC now points at the handler.
    Trap(Exception),
}

enum Lookup {
    Map(BlockMap),
    Lfu(Cache<BlockRef>),
}

/// Which edge a block's terminator exercised, for profile feedback.
#[derive(Clone, Copy)]
enum Edge {
    Taken,
    Untaken,
}

pub struct RiscV {
    pub(crate) cpu: Cpu,
    pub(crate) arena: BlockArena,
    lookup: Lookup,
    pool: CodePagePool,
    pub(crate) config: EngineConfig,
    pub(crate) stats: Stats,
    #[cfg(feature = "dynarec")]
    pub(crate) native: Option<crate::jit::NativeTier>,
}

impl RiscV {
    pub fn new(config: EngineConfig) -> Self {
        let lookup = match config.block_cache {
            BlockCachePolicy::FlushAll => Lookup::Map(BlockMap::new(config.block_map_capacity)),
            BlockCachePolicy::Lfu => Lookup::Lfu(Cache::new(config.lfu_capacity)),
        };
        Self {
            cpu: Cpu::new(),
            arena: BlockArena::new(),
            lookup,
            pool: CodePagePool::new(config.n_code_pages),
            #[cfg(feature = "dynarec")]
            native: crate::jit::NativeTier::from_env(&config),
            config,
            stats: Stats::default(),
        }
    }

    /// Engine with environment-derived configuration.
    pub fn from_env() -> Self {
        Self::new(EngineConfig::from_env())
    }

    /// Reset guest state and discard all translations.
    pub fn reset(&mut self, entry_pc: u32) {
        self.cpu.reset(entry_pc);
        self.flush_translations();
    }

    pub fn halt(&mut self) {
        self.cpu.halt = true;
    }

    pub fn has_halted(&self) -> bool {
        self.cpu.halt
    }

    pub fn pc(&self) -> u32 {
        self.cpu.pc
    }

    /// Set the PC; rejects misaligned addresses (16-bit granularity, since
    /// compressed instructions are decoded).
    pub fn set_pc(&mut self, pc: u32) -> bool {
        if pc & 1 != 0 {
            return false;
        }
        self.cpu.pc = pc;
        true
    }

    pub fn reg(&self, reg: u32) -> u32 {
        if reg < 32 {
            self.cpu.x[reg as usize]
        } else {
            !0
        }
    }

    pub fn set_reg(&mut self, reg: u32, value: u32) {
        if (1..32).contains(&reg) {
            self.cpu.x[reg as usize] = value;
        }
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn cycle(&self) -> u64 {
        self.cpu.cycle
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Per-block visit frequency, for the embedder's statistics reporting.
    pub fn profile(&self, mut f: impl FnMut(u32, u64, u32)) {
        for (_, block) in self.arena.iter() {
            f(block.pc_start, block.visits, block.n_insn);
        }
    }

    /// Run translated code until `cycles` guest instructions have retired,
    /// the guest halts or waits, or a trap unwinds out of a block.
    pub fn step<I: SystemIo>(&mut self, io: &mut I, cycles: u32) -> StopReason {
        let cycle_target = self.cpu.cycle.saturating_add(u64::from(cycles));
        let mut prev: Option<(BlockRef, Edge)> = None;

        while self.cpu.cycle < cycle_target {
            if self.cpu.halt {
                return StopReason::Halted;
            }

            let pc = self.cpu.pc;
            let predicted = prev
                .and_then(|(p, _)| self.arena.get(p).and_then(|b| b.prediction))
                .filter(|r| self.arena.get(*r).is_some_and(|b| b.pc_start == pc));
            let block_ref = match predicted {
                Some(r) => {
                    self.stats.predict_hits += 1;
                    r
                }
                None => match self.find_or_translate(io, &mut prev) {
                    Ok(r) => r,
                    Err(word) => {
                        self.cpu.trap(Exception::IllegalInsn, word);
                        return StopReason::Trap(Exception::IllegalInsn);
                    }
                },
            };

            if let Some((p, edge)) = prev.take() {
                self.record_edge(p, edge, block_ref);
            }

            #[cfg(feature = "dynarec")]
            if self.native.is_some() && self.try_native(io, block_ref, cycle_target) {
                continue;
            }

            let Some(slot) = self.ensure_page(block_ref) else {
                // Compile failure here means a block bigger than a page,
                // which the formation guard rules out.
                debug_assert!(false, "template compilation failed");
                return StopReason::Halted;
            };

            let outcome = {
                let page = self.pool.page(slot);
                template::execute(page.bytes(), &mut self.cpu, io)
            };
            if let Some(block) = self.arena.get_mut(block_ref) {
                block.visits += 1;
            }

            match outcome {
                PageOutcome::Jump => prev = Some((block_ref, Edge::Taken)),
                PageOutcome::Branch { taken } => {
                    let edge = if taken { Edge::Taken } else { Edge::Untaken };
                    prev = Some((block_ref, edge));
                }
                PageOutcome::Exit => return StopReason::WaitForInterrupt,
                PageOutcome::Trap(cause) => return StopReason::Trap(cause),
                PageOutcome::FellThrough => {
                    debug_assert!(false, "block fell through to the halt fragment");
                    prev = None;
                }
            }
        }
        if self.cpu.halt {
            StopReason::Halted
        } else {
            StopReason::Budget
        }
    }

    /// Record profile feedback on the block that just transferred control
    /// to `next`. Only statically-targeted terminators grow successor
    /// links; indirect jumps and environment calls stay unlinked.
    fn record_edge(&mut self, p: BlockRef, edge: Edge, next: BlockRef) {
        let Some(block) = self.arena.get_mut(p) else {
            return;
        };
        let tail = block.tail_mut();
        let static_target =
            tail.opcode == Opcode::Jal || tail.opcode.is_conditional_branch();
        match edge {
            Edge::Taken if static_target => {
                tail.branch_taken = true;
                tail.taken = Some(next);
            }
            Edge::Untaken if tail.opcode.is_conditional_branch() => {
                tail.branch_untaken = true;
                tail.untaken = Some(next);
            }
            _ => {}
        }
    }

    /// Cache lookup at the current PC, translating and inserting on a miss.
    /// Errs with the raw word when the first instruction fails to decode.
    fn find_or_translate<I: SystemIo>(
        &mut self,
        io: &mut I,
        prev: &mut Option<(BlockRef, Edge)>,
    ) -> Result<BlockRef, u32> {
        let pc = self.cpu.pc;
        match &mut self.lookup {
            Lookup::Map(map) => {
                if let Some(r) = map.lookup(pc) {
                    debug_assert!(self.arena.get(r).is_some(), "stale map entry");
                    return Ok(r);
                }
            }
            Lookup::Lfu(cache) => {
                if let Some(&r) = cache.get(pc) {
                    debug_assert!(self.arena.get(r).is_some(), "stale cache entry");
                    return Ok(r);
                }
            }
        }
        self.stats.cache_misses += 1;

        let over_limit = matches!(&self.lookup, Lookup::Map(map) if map.needs_clear());
        if over_limit {
            self.flush_translations();
            *prev = None;
        }

        let block = self.translate_block(io)?;
        let r = self.arena.insert(block);
        match &mut self.lookup {
            Lookup::Map(map) => map.insert(pc, r),
            Lookup::Lfu(cache) => {
                if let Some((_, old)) = cache.put(pc, r) {
                    self.arena.remove(old);
                }
            }
        }

        // Predict only after a miss: mispredicting after a miss is costly
        // and predicting after a hit buys nothing.
        if let Some((p, _)) = *prev {
            if let Some(prev_block) = self.arena.get_mut(p) {
                prev_block.prediction = Some(r);
            }
        }
        Ok(r)
    }

    /// Form a block starting at the current PC: decode until the first
    /// control-transfer instruction or the length guard. A decode failure
    /// past the first instruction truncates the block instead; the
    /// truncated tail forces a re-lookup at the faulting address, which
    /// then reports the illegal instruction with the preceding effects
    /// already applied.
    fn translate_block<I: SystemIo>(&mut self, io: &mut I) -> Result<Block, u32> {
        let mut block = Block::new(self.cpu.pc);
        let max_insns = self.config.max_insns();
        while block.n_insn < max_insns {
            let word = io.mem_ifetch(block.pc_end);
            match decode::decode(word, block.pc_end) {
                Ok(insn) => {
                    let is_branch = insn.opcode.can_branch();
                    block.pc_end = block.pc_end.wrapping_add(u32::from(insn.insn_len));
                    block.ir.push(insn);
                    block.n_insn += 1;
                    if is_branch {
                        break;
                    }
                }
                Err(err) => {
                    if block.ir.is_empty() {
                        return Err(err.word);
                    }
                    break;
                }
            }
        }
        block.tail_mut().terminator = true;
        fuse_block(&mut block);
        self.stats.blocks_translated += 1;
        Ok(block)
    }

    /// Make sure the block has a compiled code page; returns its slot.
    fn ensure_page(&mut self, r: BlockRef) -> Option<u32> {
        let block = self.arena.get(r)?;
        if let Artifact::Page { slot, .. } = block.artifact {
            return Some(slot);
        }
        let (slot, revoked) = self.pool.acquire_next(r);
        if let Some(old) = revoked {
            if old != r {
                if let Some(old_block) = self.arena.get_mut(old) {
                    old_block.artifact = Artifact::None;
                }
                self.stats.page_recycles += 1;
            }
        }
        let compiled = {
            let block = self.arena.get(r)?;
            let page = self.pool.page_mut(slot);
            template::compile_block(block, page)
        };
        if let Err(e) = compiled {
            log::error!("template compile failed at {:#010x}: {:?}", self.cpu.pc, e);
            return None;
        }
        let len = self.pool.page(slot).len() as u32;
        self.arena.get_mut(r)?.artifact = Artifact::Page { slot, len };
        self.stats.pages_compiled += 1;
        Some(slot)
    }

    /// Destroy all translated state: every block, the lookup table, and
    /// code-page ownership.
    pub(crate) fn flush_translations(&mut self) {
        self.arena.clear();
        match &mut self.lookup {
            Lookup::Map(map) => map.clear(),
            Lookup::Lfu(cache) => cache.clear(),
        }
        self.pool.release_all();
        self.stats.flushes += 1;
    }
}

/// Rewrite adjacent simple instruction patterns into fused macro-ops:
/// AUIPC+ADDI address materialization, and runs of adjacent word
/// stores/loads. A fused node counts as one IR node but expands back to
/// one fragment per sub-operation at compile time.
fn fuse_block(block: &mut Block) {
    let ir = std::mem::take(&mut block.ir);
    let mut out: Vec<IrInsn> = Vec::with_capacity(ir.len());
    let mut i = 0;
    while i < ir.len() {
        let insn = &ir[i];
        if insn.opcode == Opcode::Auipc && !insn.terminator && i + 1 < ir.len() {
            let next = &ir[i + 1];
            if next.opcode == Opcode::Addi
                && !next.terminator
                && next.rd == insn.rd
                && next.rs1 == insn.rd
                && insn.rd != 0
            {
                let mut fused =
                    IrInsn::new(Opcode::FusedLi, insn.pc, insn.insn_len + next.insn_len);
                fused.rd = insn.rd;
                fused.imm = insn.imm;
                fused.imm2 = next.imm;
                out.push(fused);
                i += 2;
                continue;
            }
        }
        if matches!(insn.opcode, Opcode::Sw | Opcode::Lw)
            && insn.insn_len == 4
            && !insn.terminator
        {
            let op = insn.opcode;
            let mut j = i + 1;
            while j < ir.len()
                && ir[j].opcode == op
                && ir[j].insn_len == 4
                && !ir[j].terminator
            {
                j += 1;
            }
            if j - i >= 2 {
                let fused_op = if op == Opcode::Sw {
                    Opcode::FusedSw
                } else {
                    Opcode::FusedLw
                };
                let mut fused = IrInsn::new(fused_op, insn.pc, 4);
                fused.imm2 = (j - i) as i32;
                fused.fused = ir[i..j]
                    .iter()
                    .map(|n| MemOp {
                        rs1: n.rs1,
                        reg: if op == Opcode::Sw { n.rs2 } else { n.rd },
                        imm: n.imm,
                    })
                    .collect();
                out.push(fused);
                i = j;
                continue;
            }
        }
        out.push(insn.clone());
        i += 1;
    }
    block.ir = out;
    block.n_insn = block.ir.len() as u32;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct TestIo {
        pub mem: Vec<u8>,
        pub ecalls: u32,
    }

    impl TestIo {
        pub fn new(size: usize) -> Self {
            Self {
                mem: vec![0; size],
                ecalls: 0,
            }
        }

        pub fn load_words(&mut self, start: u32, words: &[u32]) {
            for (i, word) in words.iter().enumerate() {
                let at = start as usize + i * 4;
                self.mem[at..at + 4].copy_from_slice(&word.to_le_bytes());
            }
        }
    }

    impl SystemIo for TestIo {
        fn mem_ifetch(&mut self, addr: u32) -> u32 {
            let i = addr as usize;
            u32::from_le_bytes([
                self.mem[i],
                self.mem[i + 1],
                self.mem[i + 2],
                self.mem[i + 3],
            ])
        }
        fn mem_read_b(&mut self, addr: u32) -> u8 {
            self.mem[addr as usize]
        }
        fn mem_read_s(&mut self, addr: u32) -> u16 {
            let i = addr as usize;
            u16::from_le_bytes([self.mem[i], self.mem[i + 1]])
        }
        fn mem_read_w(&mut self, addr: u32) -> u32 {
            self.mem_ifetch(addr)
        }
        fn mem_write_b(&mut self, addr: u32, data: u8) {
            self.mem[addr as usize] = data;
        }
        fn mem_write_s(&mut self, addr: u32, data: u16) {
            self.mem[addr as usize..addr as usize + 2].copy_from_slice(&data.to_le_bytes());
        }
        fn mem_write_w(&mut self, addr: u32, data: u32) {
            self.mem[addr as usize..addr as usize + 4].copy_from_slice(&data.to_le_bytes());
        }
        fn on_ecall(&mut self, cpu: &mut Cpu) {
            self.ecalls += 1;
            // Syscall convention for tests: a7 == 93 means exit.
            if cpu.x[17] == 93 {
                cpu.halt = true;
            } else {
                cpu.pc = cpu.pc.wrapping_add(4);
            }
        }
    }

    #[test]
    fn cold_start_loop_costs_one_miss_and_one_compile() {
        let mut io = TestIo::new(0x1000);
        io.load_words(
            0,
            &[
                0x0050_0093, // addi x1, x0, 5
                0x0010_8133, // add  x2, x1, x1
                0xfe01_1ce3, // bne  x2, x0, -8  (taken: back to start)
            ],
        );
        let mut rv = RiscV::new(EngineConfig::default());
        rv.reset(0);

        let reason = rv.step(&mut io, 10);
        assert_eq!(reason, StopReason::Budget);
        assert_eq!(rv.reg(1), 5);
        assert_eq!(rv.reg(2), 10);
        assert_eq!(rv.pc(), 0); // at the branch target
        assert_eq!(rv.stats().cache_misses, 1);
        assert_eq!(rv.stats().pages_compiled, 1);
        assert!(rv.cycle() >= 10);
    }

    #[test]
    fn blocks_stop_at_the_first_control_transfer() {
        let mut io = TestIo::new(0x1000);
        io.load_words(
            0,
            &[
                0x0050_0093, // addi x1, x0, 5
                0x0080_006f, // jal x0, +8
                0x0010_8133, // add (skipped)
                0x0000_006f, // jal x0, 0 (self-loop)
            ],
        );
        let mut rv = RiscV::new(EngineConfig::default());
        rv.reset(0);
        rv.step(&mut io, 8);

        // Two blocks were formed, each ending at its first branch.
        assert_eq!(rv.stats().blocks_translated, 2);
        let mut lens = Vec::new();
        rv.profile(|pc, _, n| lens.push((pc, n)));
        lens.sort_unstable();
        assert_eq!(lens, vec![(0, 2), (12, 1)]);
        assert_eq!(rv.reg(2), 0); // skipped instruction never ran
    }

    #[test]
    fn prediction_skips_cache_lookups_in_a_two_block_loop() {
        let mut io = TestIo::new(0x1000);
        io.load_words(
            0,
            &[
                0x0080_006f, // A: jal x0, +8
                0x0000_0013, // (padding nop)
                0xff9f_f06f, // B: jal x0, -8
            ],
        );
        let mut rv = RiscV::new(EngineConfig::default());
        rv.reset(0);
        rv.step(&mut io, 9);

        assert_eq!(rv.stats().cache_misses, 2);
        // A -> B is predicted from the second round on.
        assert!(rv.stats().predict_hits >= 3, "predict_hits = {}", rv.stats().predict_hits);
    }

    #[test]
    fn every_block_has_exactly_one_terminal_transfer() {
        let mut io = TestIo::new(0x1000);
        // A mix of straight-line code, branches, and a guard-truncated
        // block (illegal tail).
        io.load_words(
            0,
            &[
                0x0050_0093, // addi x1, x0, 5
                0x0010_8133, // add x2, x1, x1
                0x0000_0463, // beq x0, x0, +8
                0x0000_0013, // nop (unreached)
                0x0050_0093, // addi (branch target)
                0xffff_ffff, // illegal -> truncation
            ],
        );
        let mut rv = RiscV::new(EngineConfig::default());
        rv.reset(0);
        rv.step(&mut io, 16);

        assert!(rv.stats().blocks_translated >= 2);
        for (_, block) in rv.arena.iter() {
            let transfers = block
                .ir
                .iter()
                .filter(|i| i.opcode.can_branch())
                .count();
            assert!(transfers <= 1, "block at {:#x} has {} transfers", block.pc_start, transfers);
            if transfers == 1 {
                assert!(block.tail().opcode.can_branch());
            }
            assert!(block.tail().terminator);
            for insn in &block.ir[..block.ir.len() - 1] {
                assert!(!insn.terminator);
            }
        }
    }

    #[test]
    fn illegal_first_instruction_traps() {
        let mut io = TestIo::new(0x100);
        let mut rv = RiscV::new(EngineConfig::default());
        rv.reset(0x40);
        rv.cpu_mut().csr.mtvec = 0x80;

        let reason = rv.step(&mut io, 4);
        assert_eq!(reason, StopReason::Trap(Exception::IllegalInsn));
        assert_eq!(rv.pc(), 0x80);
        assert_eq!(rv.cpu().csr.mcause, 2);
        assert_eq!(rv.cpu().csr.mepc, 0x40);
    }

    #[test]
    fn illegal_tail_truncates_but_prefix_still_executes() {
        let mut io = TestIo::new(0x1000);
        io.load_words(
            0,
            &[
                0x0050_0093, // addi x1, x0, 5
                0xffff_ffff, // illegal
            ],
        );
        let mut rv = RiscV::new(EngineConfig::default());
        rv.reset(0);
        rv.cpu_mut().csr.mtvec = 0x800;

        let reason = rv.step(&mut io, 4);
        // The valid prefix retires, then the re-lookup at the illegal word
        // delivers the trap.
        assert_eq!(reason, StopReason::Trap(Exception::IllegalInsn));
        assert_eq!(rv.reg(1), 5);
        assert_eq!(rv.cpu().csr.mepc, 4);
        assert_eq!(rv.pc(), 0x800);
    }

    #[test]
    fn ecall_reaches_the_io_callback_and_can_halt() {
        let mut io = TestIo::new(0x1000);
        io.load_words(
            0,
            &[
                0x05d0_0893, // addi a7, x0, 93
                0x0000_0073, // ecall
            ],
        );
        let mut rv = RiscV::new(EngineConfig::default());
        rv.reset(0);

        let reason = rv.step(&mut io, 100);
        assert_eq!(reason, StopReason::Halted);
        assert!(rv.has_halted());
        assert_eq!(io.ecalls, 1);
    }

    #[test]
    fn lfu_policy_produces_the_same_execution() {
        let program = [
            0x0050_0093u32, // addi x1, x0, 5
            0x0010_8133,    // add x2, x1, x1
            0xfe01_1ce3,    // bne x2, x0, -8
        ];
        let mut io_a = TestIo::new(0x1000);
        io_a.load_words(0, &program);
        let mut io_b = TestIo::new(0x1000);
        io_b.load_words(0, &program);

        let mut flush = RiscV::new(EngineConfig::default());
        flush.reset(0);
        flush.step(&mut io_a, 30);

        let mut lfu = RiscV::new(EngineConfig {
            block_cache: BlockCachePolicy::Lfu,
            ..EngineConfig::default()
        });
        lfu.reset(0);
        lfu.step(&mut io_b, 30);

        assert_eq!(flush.reg(1), lfu.reg(1));
        assert_eq!(flush.reg(2), lfu.reg(2));
        assert_eq!(flush.pc(), lfu.pc());
        assert_eq!(flush.cycle(), lfu.cycle());
    }

    #[test]
    fn fusion_collapses_auipc_addi_and_store_runs() {
        let mut io = TestIo::new(0x1000);
        io.load_words(
            0x100,
            &[
                0x0000_0517, // auipc a0, 0
                0x0105_0513, // addi a0, a0, 16
                0x0015_0593, // addi a1, a0, 1  (breaks the pattern pair)
                0x00a5_2023, // sw a0, 0(a0)
                0x00b5_2223, // sw a1, 4(a0)
                0x00a5_2423, // sw a0, 8(a0)
                0x0000_006f, // jal x0, 0
            ],
        );
        let mut rv = RiscV::new(EngineConfig::default());
        rv.reset(0x100);
        rv.step(&mut io, 6);

        // auipc+addi fused, three stores fused: 7 instructions -> 4 nodes.
        let mut nodes = 0;
        rv.profile(|pc, _, n| {
            if pc == 0x100 {
                nodes = n;
            }
        });
        assert_eq!(nodes, 4);
        assert_eq!(rv.reg(10), 0x110);
        assert_eq!(rv.reg(11), 0x111);
        assert_eq!(io.mem_read_w(0x110), 0x110);
        assert_eq!(io.mem_read_w(0x114), 0x111);
        assert_eq!(io.mem_read_w(0x118), 0x110);
    }

    #[test]
    fn wfi_stops_the_step_loop() {
        let mut io = TestIo::new(0x100);
        io.load_words(0, &[0x1050_0073]); // wfi
        let mut rv = RiscV::new(EngineConfig::default());
        rv.reset(0);
        assert_eq!(rv.step(&mut io, 100), StopReason::WaitForInterrupt);
        assert_eq!(rv.pc(), 0);
    }
}
