//! Direct x86-64 emitter.
//!
//! Register convention inside a region: rbx holds the guest register file
//! base, r12 the callback table, eax/ecx/edx/esi are scratch. Guest
//! registers live in memory and are addressed by struct offset; every
//! block starts with a cycle-budget check so loops chained inside the
//! region cannot outrun the dispatch loop's budget.
//!
//! Jumps between blocks are emitted with empty displacements and recorded
//! in the jump-patch table; once the whole region is down, each entry is
//! resolved against the PC-to-offset map or the exit/entry stubs.

use std::collections::HashMap;

use crate::code_buf::CodeBuf;
use crate::{
    layout, CompileError, CompileRequest, CompiledRegion, Cond, Jump, JumpTarget, MemWidth, Op,
    RegionBlock, RegionCompiler,
};

/// Fixed emit-buffer capacity; overrunning it is an ordinary compile
/// failure, never a partial region.
const BUF_CAP: usize = 64 * 1024;

#[derive(Default)]
pub struct X64Backend;

impl X64Backend {
    pub fn new() -> Self {
        Self
    }
}

impl RegionCompiler for X64Backend {
    fn name(&self) -> &'static str {
        "x86-64"
    }

    fn compile(&mut self, request: &CompileRequest<'_>) -> Result<CompiledRegion, CompileError> {
        let mut state = JitState::new();
        emit_prologue(&mut state);
        state.entry_loc = state.offset();

        emit_chain(&mut state, request, request.root);
        // Region blocks the depth-first walk never reached (only possible
        // through indirect control flow) still get emitted so every
        // recorded Pc target resolves.
        for block in request.blocks {
            if !state.offset_map.contains_key(&block.pc_start) {
                emit_chain(&mut state, request, block.pc_start);
            }
        }

        state.exit_loc = state.offset();
        emit_epilogue(&mut state);

        if state.overflow {
            return Err(CompileError::BufferFull);
        }
        resolve_jumps(&mut state)?;

        let n_blocks = state.offset_map.len() as u32;
        let buf = CodeBuf::new(&state.buf)?;
        let entry = buf.entry(0);
        Ok(CompiledRegion::with_buf(request.root, n_blocks, entry, buf))
    }
}

struct JitState {
    buf: Vec<u8>,
    overflow: bool,
    jumps: Vec<Jump>,
    offset_map: HashMap<u32, usize>,
    entry_loc: usize,
    exit_loc: usize,
}

impl JitState {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            overflow: false,
            jumps: Vec::new(),
            offset_map: HashMap::new(),
            entry_loc: 0,
            exit_loc: 0,
        }
    }

    fn offset(&self) -> usize {
        self.buf.len()
    }

    fn emit(&mut self, bytes: &[u8]) {
        if self.buf.len() + bytes.len() > BUF_CAP {
            self.overflow = true;
            return;
        }
        self.buf.extend_from_slice(bytes);
    }

    fn emit_u32(&mut self, value: u32) {
        self.emit(&value.to_le_bytes());
    }

    fn patch8(&mut self, at: usize) {
        if self.overflow {
            return;
        }
        let rel = self.offset() - (at + 2);
        debug_assert!(rel <= i8::MAX as usize);
        self.buf[at + 1] = rel as u8;
    }

    fn patch32(&mut self, at: usize, insn_len: usize) {
        if self.overflow {
            return;
        }
        let rel = (self.offset() as i64 - (at + insn_len) as i64) as i32;
        self.buf[at + insn_len - 4..at + insn_len].copy_from_slice(&rel.to_le_bytes());
    }

    /// mov eax, [rbx + x[reg]]
    fn load_eax(&mut self, reg: u8) {
        self.emit(&[0x8b, 0x43, layout::xreg(reg) as u8]);
    }

    /// mov ecx, [rbx + x[reg]]
    fn load_ecx(&mut self, reg: u8) {
        self.emit(&[0x8b, 0x4b, layout::xreg(reg) as u8]);
    }

    /// mov [rbx + x[reg]], eax — writes to x0 are dropped.
    fn store_eax(&mut self, reg: u8) {
        if reg != 0 {
            self.emit(&[0x89, 0x43, layout::xreg(reg) as u8]);
        }
    }

    /// mov dword [rbx + x[reg]], imm
    fn store_imm(&mut self, reg: u8, value: u32) {
        if reg != 0 {
            self.emit(&[0xc7, 0x43, layout::xreg(reg) as u8]);
            self.emit_u32(value);
        }
    }

    /// mov dword [rbx + pc], imm
    fn set_pc(&mut self, value: u32) {
        self.emit(&[0xc7, 0x83]);
        self.emit_u32(layout::pc() as u32);
        self.emit_u32(value);
    }

    /// mov rdi, [r12] — callback user pointer into arg0.
    fn load_user_arg(&mut self) {
        self.emit(&[0x49, 0x8b, 0x3c, 0x24]);
    }

    /// call qword [r12 + off]
    fn call_cb(&mut self, off: i32) {
        self.emit(&[0x41, 0xff, 0x54, 0x24, off as u8]);
    }

    /// jmp rel32 recorded in the patch table.
    fn jmp_patched(&mut self, target: JumpTarget) {
        self.jumps.push(Jump {
            offset_loc: self.offset() + 1,
            target,
        });
        self.emit(&[0xe9, 0, 0, 0, 0]);
    }
}

fn emit_prologue(s: &mut JitState) {
    s.emit(&[0x55]); // push rbp
    s.emit(&[0x53]); // push rbx
    s.emit(&[0x41, 0x54]); // push r12
    s.emit(&[0x48, 0x89, 0xfb]); // mov rbx, rdi
    s.emit(&[0x49, 0x89, 0xf4]); // mov r12, rsi
}

fn emit_epilogue(s: &mut JitState) {
    s.emit(&[0x41, 0x5c]); // pop r12
    s.emit(&[0x5b]); // pop rbx
    s.emit(&[0x5d]); // pop rbp
    s.emit(&[0xc3]); // ret
}

/// Emit `pc`'s block, then chase its statically known successors
/// depth-first so the common fallthrough path lays out linearly.
fn emit_chain(state: &mut JitState, request: &CompileRequest<'_>, pc: u32) {
    if state.offset_map.contains_key(&pc) {
        return;
    }
    let Some(block) = request.block(pc) else {
        return;
    };
    emit_block(state, request, block);
    match block.ops.last() {
        Some(&Op::Branch { taken, fallthrough, .. }) => {
            emit_chain(state, request, fallthrough);
            emit_chain(state, request, taken);
        }
        Some(&Op::Jump { target, .. }) => {
            emit_chain(state, request, target);
        }
        Some(op) if op.is_terminator() => {}
        _ => emit_chain(state, request, block.pc_end),
    }
}

fn emit_block(state: &mut JitState, request: &CompileRequest<'_>, block: &RegionBlock) {
    state.offset_map.insert(block.pc_start, state.offset());

    // cycle += n_insn; bail out to the dispatch loop once past the budget.
    state.emit(&[0x48, 0x81, 0x83]);
    state.emit_u32(layout::cycle() as u32);
    state.emit_u32(block.n_insn);
    state.emit(&[0x48, 0x8b, 0x83]); // mov rax, [rbx + cycle]
    state.emit_u32(layout::cycle() as u32);
    state.emit(&[0x48, 0x3b, 0x83]); // cmp rax, [rbx + cycle_limit]
    state.emit_u32(layout::cycle_limit() as u32);
    state.emit(&[0x72, 0x0f]); // jb body (over set_pc + jmp)
    state.set_pc(block.pc_start);
    state.jmp_patched(JumpTarget::Exit);

    for op in &block.ops {
        emit_op(state, request, *op);
    }
    if !block.ops.last().is_some_and(|op| op.is_terminator()) {
        jump_to(state, request, block.pc_end);
    }
}

/// Transfer control to the block at `target`: chain within the region,
/// exit through the trampoline otherwise.
fn jump_to(state: &mut JitState, request: &CompileRequest<'_>, target: u32) {
    if request.contains(target) {
        let jt = if target == request.root {
            JumpTarget::Enter
        } else {
            JumpTarget::Pc(target)
        };
        state.jmp_patched(jt);
    } else {
        state.set_pc(target);
        state.jmp_patched(JumpTarget::Exit);
    }
}

fn cc_opcode(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x84,  // je
        Cond::Ne => 0x85,  // jne
        Cond::Lt => 0x8c,  // jl
        Cond::Ge => 0x8d,  // jge
        Cond::Ltu => 0x82, // jb
        Cond::Geu => 0x83, // jae
    }
}

fn emit_op(s: &mut JitState, request: &CompileRequest<'_>, op: Op) {
    match op {
        Op::Nop => {}
        Op::Li { rd, imm } => s.store_imm(rd, imm as u32),
        Op::Addi { rd, rs1, imm } => {
            s.load_eax(rs1);
            s.emit(&[0x05]); // add eax, imm32
            s.emit_u32(imm as u32);
            s.store_eax(rd);
        }
        Op::Slti { rd, rs1, imm } => {
            s.load_eax(rs1);
            s.emit(&[0x3d]); // cmp eax, imm32
            s.emit_u32(imm as u32);
            s.emit(&[0x0f, 0x9c, 0xc0]); // setl al
            s.emit(&[0x0f, 0xb6, 0xc0]); // movzx eax, al
            s.store_eax(rd);
        }
        Op::Sltiu { rd, rs1, imm } => {
            s.load_eax(rs1);
            s.emit(&[0x3d]);
            s.emit_u32(imm as u32);
            s.emit(&[0x0f, 0x92, 0xc0]); // setb al
            s.emit(&[0x0f, 0xb6, 0xc0]);
            s.store_eax(rd);
        }
        Op::Xori { rd, rs1, imm } => {
            s.load_eax(rs1);
            s.emit(&[0x35]); // xor eax, imm32
            s.emit_u32(imm as u32);
            s.store_eax(rd);
        }
        Op::Ori { rd, rs1, imm } => {
            s.load_eax(rs1);
            s.emit(&[0x0d]); // or eax, imm32
            s.emit_u32(imm as u32);
            s.store_eax(rd);
        }
        Op::Andi { rd, rs1, imm } => {
            s.load_eax(rs1);
            s.emit(&[0x25]); // and eax, imm32
            s.emit_u32(imm as u32);
            s.store_eax(rd);
        }
        Op::Slli { rd, rs1, shamt } => {
            s.load_eax(rs1);
            s.emit(&[0xc1, 0xe0, shamt]); // shl eax, imm8
            s.store_eax(rd);
        }
        Op::Srli { rd, rs1, shamt } => {
            s.load_eax(rs1);
            s.emit(&[0xc1, 0xe8, shamt]); // shr eax, imm8
            s.store_eax(rd);
        }
        Op::Srai { rd, rs1, shamt } => {
            s.load_eax(rs1);
            s.emit(&[0xc1, 0xf8, shamt]); // sar eax, imm8
            s.store_eax(rd);
        }
        Op::Add { rd, rs1, rs2 } => {
            s.load_eax(rs1);
            s.emit(&[0x03, 0x43, layout::xreg(rs2) as u8]); // add eax, [rbx+rs2]
            s.store_eax(rd);
        }
        Op::Sub { rd, rs1, rs2 } => {
            s.load_eax(rs1);
            s.emit(&[0x2b, 0x43, layout::xreg(rs2) as u8]); // sub
            s.store_eax(rd);
        }
        Op::Xor { rd, rs1, rs2 } => {
            s.load_eax(rs1);
            s.emit(&[0x33, 0x43, layout::xreg(rs2) as u8]);
            s.store_eax(rd);
        }
        Op::Or { rd, rs1, rs2 } => {
            s.load_eax(rs1);
            s.emit(&[0x0b, 0x43, layout::xreg(rs2) as u8]);
            s.store_eax(rd);
        }
        Op::And { rd, rs1, rs2 } => {
            s.load_eax(rs1);
            s.emit(&[0x23, 0x43, layout::xreg(rs2) as u8]);
            s.store_eax(rd);
        }
        Op::Sll { rd, rs1, rs2 } | Op::Srl { rd, rs1, rs2 } | Op::Sra { rd, rs1, rs2 } => {
            s.load_ecx(rs2);
            s.emit(&[0x83, 0xe1, 0x1f]); // and ecx, 31
            s.load_eax(rs1);
            let sub = match op {
                Op::Sll { .. } => 0xe0, // shl eax, cl
                Op::Srl { .. } => 0xe8, // shr
                _ => 0xf8,              // sar
            };
            s.emit(&[0xd3, sub]);
            s.store_eax(rd);
        }
        Op::Slt { rd, rs1, rs2 } => {
            s.load_eax(rs1);
            s.emit(&[0x3b, 0x43, layout::xreg(rs2) as u8]); // cmp eax, [rbx+rs2]
            s.emit(&[0x0f, 0x9c, 0xc0]);
            s.emit(&[0x0f, 0xb6, 0xc0]);
            s.store_eax(rd);
        }
        Op::Sltu { rd, rs1, rs2 } => {
            s.load_eax(rs1);
            s.emit(&[0x3b, 0x43, layout::xreg(rs2) as u8]);
            s.emit(&[0x0f, 0x92, 0xc0]);
            s.emit(&[0x0f, 0xb6, 0xc0]);
            s.store_eax(rd);
        }
        Op::Mul { rd, rs1, rs2 } => {
            s.load_eax(rs1);
            s.emit(&[0x0f, 0xaf, 0x43, layout::xreg(rs2) as u8]); // imul eax, [rbx+rs2]
            s.store_eax(rd);
        }
        Op::Mulh { rd, rs1, rs2 } => {
            s.emit(&[0x48, 0x63, 0x43, layout::xreg(rs1) as u8]); // movsxd rax
            s.emit(&[0x48, 0x63, 0x4b, layout::xreg(rs2) as u8]); // movsxd rcx
            s.emit(&[0x48, 0x0f, 0xaf, 0xc1]); // imul rax, rcx
            s.emit(&[0x48, 0xc1, 0xe8, 0x20]); // shr rax, 32
            s.store_eax(rd);
        }
        Op::Mulhsu { rd, rs1, rs2 } => {
            s.emit(&[0x48, 0x63, 0x43, layout::xreg(rs1) as u8]); // movsxd rax
            s.load_ecx(rs2); // zero-extends into rcx
            s.emit(&[0x48, 0x0f, 0xaf, 0xc1]);
            s.emit(&[0x48, 0xc1, 0xe8, 0x20]);
            s.store_eax(rd);
        }
        Op::Mulhu { rd, rs1, rs2 } => {
            s.load_eax(rs1);
            s.load_ecx(rs2);
            s.emit(&[0x48, 0x0f, 0xaf, 0xc1]);
            s.emit(&[0x48, 0xc1, 0xe8, 0x20]);
            s.store_eax(rd);
        }
        // The host divide traps on zero and overflow; the guest defines
        // results for both, so they are dispatched around idiv explicitly.
        Op::Div { rd, rs1, rs2 } => {
            s.load_ecx(rs2);
            s.load_eax(rs1);
            s.emit(&[0x85, 0xc9]); // test ecx, ecx
            s.emit(&[0x75, 0x07]); // jne checked
            s.emit(&[0xb8, 0xff, 0xff, 0xff, 0xff]); // eax = -1
            let j_zero = s.offset();
            s.emit(&[0xeb, 0x00]); // jmp done
            s.emit(&[0x83, 0xf9, 0xff]); // cmp ecx, -1
            s.emit(&[0x75, 0x07]); // jne divide
            s.emit(&[0x3d, 0x00, 0x00, 0x00, 0x80]); // cmp eax, i32::MIN
            let j_ovf = s.offset();
            s.emit(&[0x74, 0x00]); // je done (quotient = dividend)
            s.emit(&[0x99]); // cdq
            s.emit(&[0xf7, 0xf9]); // idiv ecx
            s.patch8(j_zero);
            s.patch8(j_ovf);
            s.store_eax(rd);
        }
        Op::Divu { rd, rs1, rs2 } => {
            s.load_ecx(rs2);
            s.load_eax(rs1);
            s.emit(&[0x85, 0xc9]);
            s.emit(&[0x75, 0x07]); // jne divide
            s.emit(&[0xb8, 0xff, 0xff, 0xff, 0xff]);
            let j_zero = s.offset();
            s.emit(&[0xeb, 0x00]);
            s.emit(&[0x31, 0xd2]); // xor edx, edx
            s.emit(&[0xf7, 0xf1]); // div ecx
            s.patch8(j_zero);
            s.store_eax(rd);
        }
        Op::Rem { rd, rs1, rs2 } => {
            s.load_ecx(rs2);
            s.load_eax(rs1);
            s.emit(&[0x85, 0xc9]);
            s.emit(&[0x75, 0x02]); // jne checked (remainder = dividend)
            let j_zero = s.offset();
            s.emit(&[0xeb, 0x00]);
            s.emit(&[0x83, 0xf9, 0xff]); // cmp ecx, -1
            s.emit(&[0x75, 0x0b]); // jne divide
            s.emit(&[0x3d, 0x00, 0x00, 0x00, 0x80]);
            s.emit(&[0x75, 0x04]); // jne divide
            s.emit(&[0x31, 0xc0]); // xor eax, eax (overflow remainder = 0)
            let j_ovf = s.offset();
            s.emit(&[0xeb, 0x00]);
            s.emit(&[0x99]);
            s.emit(&[0xf7, 0xf9]);
            s.emit(&[0x89, 0xd0]); // mov eax, edx
            s.patch8(j_zero);
            s.patch8(j_ovf);
            s.store_eax(rd);
        }
        Op::Remu { rd, rs1, rs2 } => {
            s.load_ecx(rs2);
            s.load_eax(rs1);
            s.emit(&[0x85, 0xc9]);
            s.emit(&[0x75, 0x02]);
            let j_zero = s.offset();
            s.emit(&[0xeb, 0x00]);
            s.emit(&[0x31, 0xd2]);
            s.emit(&[0xf7, 0xf1]);
            s.emit(&[0x89, 0xd0]);
            s.patch8(j_zero);
            s.store_eax(rd);
        }
        Op::Load { width, signed, rd, rs1, imm } => {
            s.emit(&[0x8b, 0x73, layout::xreg(rs1) as u8]); // mov esi, [rbx+rs1]
            s.emit(&[0x81, 0xc6]); // add esi, imm32
            s.emit_u32(imm as u32);
            s.load_user_arg();
            s.call_cb(match width {
                MemWidth::Byte => layout::cb_read_b(),
                MemWidth::Half => layout::cb_read_s(),
                MemWidth::Word => layout::cb_read_w(),
            });
            match (width, signed) {
                (MemWidth::Byte, true) => s.emit(&[0x0f, 0xbe, 0xc0]), // movsx eax, al
                (MemWidth::Half, true) => s.emit(&[0x0f, 0xbf, 0xc0]), // movsx eax, ax
                _ => {}
            }
            s.store_eax(rd);
        }
        Op::Store { width, rs1, rs2, imm } => {
            s.emit(&[0x8b, 0x73, layout::xreg(rs1) as u8]);
            s.emit(&[0x81, 0xc6]);
            s.emit_u32(imm as u32);
            s.emit(&[0x8b, 0x53, layout::xreg(rs2) as u8]); // mov edx, [rbx+rs2]
            s.load_user_arg();
            s.call_cb(match width {
                MemWidth::Byte => layout::cb_write_b(),
                MemWidth::Half => layout::cb_write_s(),
                MemWidth::Word => layout::cb_write_w(),
            });
        }
        Op::Jump { rd, link, target } => {
            s.store_imm(rd, link);
            jump_to(s, request, target);
        }
        Op::JumpReg { rd, rs1, imm, link } => {
            s.load_eax(rs1);
            s.emit(&[0x05]);
            s.emit_u32(imm as u32);
            s.emit(&[0x25]); // and eax, !1
            s.emit_u32(!1);
            s.store_imm(rd, link);
            s.emit(&[0x89, 0x83]); // mov [rbx+pc], eax
            s.emit_u32(layout::pc() as u32);
            s.jmp_patched(JumpTarget::Exit);
        }
        Op::Branch { cond, rs1, rs2, taken, fallthrough } => {
            s.load_eax(rs1);
            s.emit(&[0x3b, 0x43, layout::xreg(rs2) as u8]);
            let jcc = s.offset();
            s.emit(&[0x0f, cc_opcode(cond), 0, 0, 0, 0]);
            jump_to(s, request, fallthrough);
            s.patch32(jcc, 6);
            jump_to(s, request, taken);
        }
        // Environment calls run through the embedder and cannot be chained;
        // whatever PC the callback leaves behind is where the loop resumes.
        Op::EnvCall { pc } => {
            s.set_pc(pc);
            s.load_user_arg();
            s.call_cb(layout::cb_ecall());
            s.jmp_patched(JumpTarget::Exit);
        }
        Op::Break { pc } => {
            s.set_pc(pc);
            s.load_user_arg();
            s.call_cb(layout::cb_ebreak());
            s.jmp_patched(JumpTarget::Exit);
        }
    }
}

/// Resolve every pending jump to a concrete rel32 displacement.
fn resolve_jumps(state: &mut JitState) -> Result<(), CompileError> {
    for i in 0..state.jumps.len() {
        let jump = state.jumps[i];
        let target_loc = match jump.target {
            JumpTarget::Pc(pc) => *state
                .offset_map
                .get(&pc)
                .ok_or(CompileError::UnresolvedJump { target_pc: pc })?,
            JumpTarget::Exit => state.exit_loc,
            JumpTarget::Enter => state.entry_loc,
        };
        let rel = (target_loc as i64 - (jump.offset_loc as i64 + 4)) as i32;
        state.buf[jump.offset_loc..jump.offset_loc + 4].copy_from_slice(&rel.to_le_bytes());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{diamond_region, loop_region, TestMem};
    use crate::GuestRegs;

    fn run(
        blocks: &[RegionBlock],
        root: u32,
        setup: impl FnOnce(&mut GuestRegs),
    ) -> (GuestRegs, TestMem) {
        let mut backend = X64Backend::new();
        let request = CompileRequest { root, blocks };
        let region = backend.compile(&request).expect("compile");
        let mut regs = GuestRegs::new();
        regs.pc = root;
        setup(&mut regs);
        let mut mem = TestMem::new(0x1000);
        let callbacks = mem.callbacks();
        region.execute(&mut regs, &callbacks);
        (regs, mem)
    }

    #[test]
    fn straight_line_block_round_trips() {
        let blocks = vec![RegionBlock {
            pc_start: 0x100,
            pc_end: 0x118,
            n_insn: 6,
            ops: vec![
                Op::Li { rd: 1, imm: 6 },
                Op::Addi { rd: 2, rs1: 1, imm: 7 },
                Op::Mul { rd: 3, rs1: 1, rs2: 2 },
                Op::Div { rd: 4, rs1: 2, rs2: 1 },
                Op::Store { width: MemWidth::Word, rs1: 0, rs2: 3, imm: 0x80 },
                Op::Load { width: MemWidth::Word, signed: false, rd: 5, rs1: 0, imm: 0x80 },
            ],
        }];
        let (regs, mem) = run(&blocks, 0x100, |_| {});
        assert_eq!(regs.x[1], 6);
        assert_eq!(regs.x[2], 13);
        assert_eq!(regs.x[3], 78);
        assert_eq!(regs.x[4], 2);
        assert_eq!(regs.x[5], 78);
        assert_eq!(mem.word(0x80), 78);
        assert_eq!(regs.pc, 0x118); // exit at pc_end
        assert_eq!(regs.cycle, 6);
    }

    #[test]
    fn writes_to_x0_are_discarded() {
        let blocks = vec![RegionBlock {
            pc_start: 0,
            pc_end: 8,
            n_insn: 2,
            ops: vec![
                Op::Li { rd: 0, imm: 99 },
                Op::Addi { rd: 0, rs1: 0, imm: 1 },
            ],
        }];
        let (regs, _) = run(&blocks, 0, |_| {});
        assert_eq!(regs.x[0], 0);
    }

    #[test]
    fn diamond_region_resolves_and_reconverges() {
        let blocks = diamond_region();

        let (regs, _) = run(&blocks, 0x100, |r| r.x[1] = 0);
        assert_eq!(regs.x[3], 22); // taken arm: 11 doubled
        assert_eq!(regs.pc, 0x404);

        let (regs, _) = run(&blocks, 0x100, |r| r.x[1] = 5);
        assert_eq!(regs.x[3], 44); // fallthrough arm: 22 doubled
        assert_eq!(regs.pc, 0x404);
    }

    #[test]
    fn loop_back_edge_runs_to_completion() {
        let blocks = loop_region();
        let (regs, _) = run(&blocks, 0x100, |r| r.x[1] = 100);
        assert_eq!(regs.x[2], 5050);
        assert_eq!(regs.x[1], 0);
        assert_eq!(regs.pc, 0x10c);
        assert_eq!(regs.cycle, 300);
    }

    #[test]
    fn loop_exits_when_the_cycle_budget_runs_out() {
        let blocks = loop_region();
        let mut backend = X64Backend::new();
        let request = CompileRequest { root: 0x100, blocks: &blocks };
        let region = backend.compile(&request).expect("compile");

        let mut regs = GuestRegs::new();
        regs.pc = 0x100;
        regs.x[1] = 100;
        regs.cycle_limit = 9;
        let mut mem = TestMem::new(0x10);
        let callbacks = mem.callbacks();
        region.execute(&mut regs, &callbacks);

        // Two full iterations fit under the budget; the third entry bails.
        assert_eq!(regs.x[2], 100 + 99);
        assert_eq!(regs.pc, 0x100);
        assert!(regs.cycle >= 9);
        assert!(regs.x[1] > 0);
    }

    #[test]
    fn division_edge_cases_follow_the_guest_isa() {
        let blocks = vec![RegionBlock {
            pc_start: 0,
            pc_end: 16,
            n_insn: 4,
            ops: vec![
                Op::Div { rd: 3, rs1: 1, rs2: 2 },
                Op::Rem { rd: 4, rs1: 1, rs2: 2 },
                Op::Divu { rd: 5, rs1: 1, rs2: 2 },
                Op::Remu { rd: 6, rs1: 1, rs2: 2 },
            ],
        }];

        // Division by zero.
        let (regs, _) = run(&blocks, 0, |r| {
            r.x[1] = 7;
            r.x[2] = 0;
        });
        assert_eq!(regs.x[3], !0);
        assert_eq!(regs.x[4], 7);
        assert_eq!(regs.x[5], !0);
        assert_eq!(regs.x[6], 7);

        // Signed overflow: i32::MIN / -1.
        let (regs, _) = run(&blocks, 0, |r| {
            r.x[1] = i32::MIN as u32;
            r.x[2] = !0;
        });
        assert_eq!(regs.x[3], i32::MIN as u32);
        assert_eq!(regs.x[4], 0);
        assert_eq!(regs.x[5], 0); // 0x8000_0000 / 0xffff_ffff
        assert_eq!(regs.x[6], i32::MIN as u32);
    }

    #[test]
    fn ecall_sets_pc_and_exits_to_the_dispatch_loop() {
        let blocks = vec![RegionBlock {
            pc_start: 0x100,
            pc_end: 0x108,
            n_insn: 2,
            ops: vec![
                Op::Li { rd: 1, imm: 42 },
                Op::EnvCall { pc: 0x104 },
            ],
        }];
        let (regs, mem) = run(&blocks, 0x100, |_| {});
        assert_eq!(mem.ecalls, 1);
        assert_eq!(regs.pc, 0x104);
        assert_eq!(regs.x[1], 42);
    }

    #[test]
    fn pending_jumps_resolve_with_no_sentinels_left() {
        let mut state = JitState::new();
        state.buf = vec![0; 64];
        state.offset_map.insert(0x100, 40);
        state.entry_loc = 8;
        state.exit_loc = 60;
        state.jumps = vec![
            Jump { offset_loc: 10, target: JumpTarget::Pc(0x100) },
            Jump { offset_loc: 20, target: JumpTarget::Exit },
            Jump { offset_loc: 30, target: JumpTarget::Enter },
        ];
        resolve_jumps(&mut state).expect("resolve");

        let rel = |at: usize| {
            i32::from_le_bytes([
                state.buf[at],
                state.buf[at + 1],
                state.buf[at + 2],
                state.buf[at + 3],
            ])
        };
        assert_eq!(rel(10), 40 - (10 + 4));
        assert_eq!(rel(20), 60 - (20 + 4));
        assert_eq!(rel(30), 8 - (30 + 4) as i32);

        state.jumps.push(Jump { offset_loc: 50, target: JumpTarget::Pc(0xdead) });
        assert_eq!(
            resolve_jumps(&mut state),
            Err(CompileError::UnresolvedJump { target_pc: 0xdead })
        );
    }
}
