//! The template compiler: copy-and-patch compilation of blocks into code
//! pages, and the executor that runs a compiled page.
//!
//! Every instruction variant has a fixed-length fragment: a tag byte
//! followed by the operands the handler needs, patched in at compile time
//! (pc-relative values are resolved to absolutes). Fragment lengths live
//! in a table derived once at startup, so compiling a block is a straight
//! concatenation of `fragment_len(tag)`-sized records, terminated by the
//! halt fragment. Control never leaves a page except through the final
//! fragment's outcome or a trap.
//!
//! Traps are not a non-local jump here: a handler that must abort delivers
//! the trap through [`Cpu::trap`] and returns a distinguished outcome the
//! dispatch loop pattern-matches on.

use std::sync::OnceLock;

use crate::code_page::{CodePage, PageFull};
use crate::cpu::{Cpu, Exception};
use crate::io::SystemIo;
use crate::ir::{Block, IrInsn, Opcode};

/// Artificial terminator for blocks cut short by the length guard or a
/// decode failure: forces a translation-cache re-lookup at `pc_end`.
pub const GUARD_TAG: u8 = 0xfe;
/// Defensive trailer: reaching it means a real terminator never fired.
pub const HALT_TAG: u8 = 0xff;

/// How execution left a code page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// Unconditional transfer; PC has been updated.
    Jump,
    /// Conditional branch; PC updated, edge recorded for profile feedback.
    Branch { taken: bool },
    /// Instruction that ends the whole step loop (WFI).
    Exit,
    /// Synchronous trap, already delivered to the trap-control state.
    Trap(Exception),
    /// Fell off the end into the halt fragment.
    FellThrough,
}

enum Step {
    Next,
    Jump,
    Branch { taken: bool },
    Exit,
    Trap(Exception),
    FellThrough,
}

type Handler = fn(&mut Cpu, &mut dyn SystemIo, &[u8]) -> Step;

/// Total fragment length (tag byte included) for a tag.
pub fn fragment_len(tag: u8) -> usize {
    usize::from(len_table()[tag as usize])
}

fn len_table() -> &'static [u8; 256] {
    static TABLE: OnceLock<[u8; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut t = [0u8; 256];
        for tag in 0..=255u8 {
            t[tag as usize] = raw_len(tag);
        }
        t
    })
}

fn raw_len(tag: u8) -> u8 {
    use Opcode::*;
    if tag == GUARD_TAG || tag == HALT_TAG {
        return 1;
    }
    let Some(op) = opcode_from_tag(tag) else {
        // Unassigned tags still carry a length so a corrupt page fails
        // through op_invalid instead of slicing out of bounds.
        return 1;
    };
    match op {
        Nop | Fence => 2,
        Lui | Auipc | FusedLi => 7,
        Addi | Slti | Sltiu | Xori | Ori | Andi => 8,
        Slli | Srli | Srai => 5,
        Add | Sub | Sll | Slt | Sltu | Xor | Srl | Sra | Or | And => 5,
        Mul | Mulh | Mulhsu | Mulhu | Div | Divu | Rem | Remu => 5,
        Lb | Lh | Lw | Lbu | Lhu | FusedLw => 8,
        Sb | Sh | Sw | FusedSw => 8,
        Jal => 10,
        Jalr => 11,
        Beq | Bne | Blt | Bge | Bltu | Bgeu => 11,
        Csrrw | Csrrs | Csrrc | Csrrwi | Csrrsi | Csrrci => 5,
        FenceI => 5,
        Ecall | Ebreak | Wfi | Mret => 1,
    }
}

fn opcode_from_tag(tag: u8) -> Option<Opcode> {
    if usize::from(tag) < crate::ir::N_OPCODES {
        // SAFETY: Opcode is a dense repr(u8) enum and the tag is in range.
        Some(unsafe { std::mem::transmute::<u8, Opcode>(tag) })
    } else {
        None
    }
}

/// Compile `block` into `page`: one fragment per IR node (fused nodes
/// expand to one fragment per sub-operation), an artificial terminator if
/// the block was cut short, then the halt fragment.
pub fn compile_block(block: &Block, page: &mut CodePage) -> Result<(), PageFull> {
    for insn in &block.ir {
        emit_insn(insn, page)?;
    }
    if !block.tail().opcode.can_branch() {
        page.push(GUARD_TAG)?;
    }
    page.push(HALT_TAG)?;
    Ok(())
}

fn emit_insn(insn: &IrInsn, page: &mut CodePage) -> Result<(), PageFull> {
    use Opcode::*;
    let tag = insn.opcode as u8;
    match insn.opcode {
        Nop | Fence => page.extend(&[tag, insn.insn_len]),
        Lui => emit_li(page, tag, insn.rd, insn.imm, insn.insn_len),
        Auipc => emit_li(
            page,
            tag,
            insn.rd,
            insn.pc.wrapping_add(insn.imm as u32) as i32,
            insn.insn_len,
        ),
        FusedLi => emit_li(
            page,
            tag,
            insn.rd,
            insn.pc
                .wrapping_add(insn.imm as u32)
                .wrapping_add(insn.imm2 as u32) as i32,
            insn.insn_len,
        ),
        Addi | Slti | Sltiu | Xori | Ori | Andi => {
            page.extend(&[tag, insn.rd, insn.rs1])?;
            w32(page, insn.imm as u32)?;
            page.push(insn.insn_len)
        }
        Slli | Srli | Srai => page.extend(&[tag, insn.rd, insn.rs1, insn.shamt, insn.insn_len]),
        Add | Sub | Sll | Slt | Sltu | Xor | Srl | Sra | Or | And | Mul | Mulh | Mulhsu
        | Mulhu | Div | Divu | Rem | Remu => {
            page.extend(&[tag, insn.rd, insn.rs1, insn.rs2, insn.insn_len])
        }
        Lb | Lh | Lw | Lbu | Lhu => {
            page.extend(&[tag, insn.rd, insn.rs1])?;
            w32(page, insn.imm as u32)?;
            page.push(insn.insn_len)
        }
        Sb | Sh | Sw => {
            page.extend(&[tag, insn.rs1, insn.rs2])?;
            w32(page, insn.imm as u32)?;
            page.push(insn.insn_len)
        }
        FusedLw => {
            for part in &insn.fused {
                page.extend(&[tag, part.reg, part.rs1])?;
                w32(page, part.imm as u32)?;
                page.push(4)?;
            }
            Ok(())
        }
        FusedSw => {
            for part in &insn.fused {
                page.extend(&[tag, part.rs1, part.reg])?;
                w32(page, part.imm as u32)?;
                page.push(4)?;
            }
            Ok(())
        }
        Jal => {
            page.extend(&[tag, insn.rd])?;
            w32(page, insn.pc.wrapping_add(u32::from(insn.insn_len)))?;
            w32(page, insn.pc.wrapping_add(insn.imm as u32))
        }
        Jalr => {
            page.extend(&[tag, insn.rd, insn.rs1])?;
            w32(page, insn.imm as u32)?;
            w32(page, insn.pc.wrapping_add(u32::from(insn.insn_len)))
        }
        Beq | Bne | Blt | Bge | Bltu | Bgeu => {
            page.extend(&[tag, insn.rs1, insn.rs2])?;
            w32(page, insn.pc.wrapping_add(insn.imm as u32))?;
            w32(page, insn.pc.wrapping_add(u32::from(insn.insn_len)))
        }
        Csrrw | Csrrs | Csrrc | Csrrwi | Csrrsi | Csrrci => {
            page.extend(&[tag, insn.rd, insn.rs1])?;
            page.extend(&(insn.imm as u16).to_le_bytes())
        }
        FenceI => {
            page.push(tag)?;
            w32(page, insn.pc.wrapping_add(u32::from(insn.insn_len)))
        }
        Ecall | Ebreak | Wfi | Mret => page.push(tag),
    }
}

fn emit_li(page: &mut CodePage, tag: u8, rd: u8, value: i32, len: u8) -> Result<(), PageFull> {
    page.extend(&[tag, rd])?;
    w32(page, value as u32)?;
    page.push(len)
}

fn w32(page: &mut CodePage, value: u32) -> Result<(), PageFull> {
    page.extend(&value.to_le_bytes())
}

/// Run a compiled page against the CPU. Returns only through a terminator
/// fragment's outcome; the halt fragment is the backstop for blocks whose
/// terminator failed to transfer, which is an engine bug.
pub fn execute(page: &[u8], cpu: &mut Cpu, io: &mut dyn SystemIo) -> PageOutcome {
    let table = handler_table();
    let mut off = 0usize;
    loop {
        let tag = page[off];
        let len = fragment_len(tag);
        let step = table[tag as usize](cpu, io, &page[off + 1..off + len]);
        if tag < GUARD_TAG {
            cpu.cycle += 1;
        }
        match step {
            Step::Next => off += len,
            Step::Jump => return PageOutcome::Jump,
            Step::Branch { taken } => return PageOutcome::Branch { taken },
            Step::Exit => return PageOutcome::Exit,
            Step::Trap(cause) => return PageOutcome::Trap(cause),
            Step::FellThrough => return PageOutcome::FellThrough,
        }
    }
}

fn handler_table() -> &'static [Handler; 256] {
    static TABLE: OnceLock<[Handler; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        use Opcode::*;
        let mut t: [Handler; 256] = [op_invalid; 256];
        let mut set = |op: Opcode, h: Handler| t[op as usize] = h;
        set(Nop, op_nop);
        set(Fence, op_nop);
        set(Lui, op_li);
        set(Auipc, op_li);
        set(FusedLi, op_li);
        set(Addi, op_addi);
        set(Slti, op_slti);
        set(Sltiu, op_sltiu);
        set(Xori, op_xori);
        set(Ori, op_ori);
        set(Andi, op_andi);
        set(Slli, op_slli);
        set(Srli, op_srli);
        set(Srai, op_srai);
        set(Add, op_add);
        set(Sub, op_sub);
        set(Sll, op_sll);
        set(Slt, op_slt);
        set(Sltu, op_sltu);
        set(Xor, op_xor);
        set(Srl, op_srl);
        set(Sra, op_sra);
        set(Or, op_or);
        set(And, op_and);
        set(Mul, op_mul);
        set(Mulh, op_mulh);
        set(Mulhsu, op_mulhsu);
        set(Mulhu, op_mulhu);
        set(Div, op_div);
        set(Divu, op_divu);
        set(Rem, op_rem);
        set(Remu, op_remu);
        set(Lb, op_lb);
        set(Lh, op_lh);
        set(Lw, op_lw);
        set(Lbu, op_lbu);
        set(Lhu, op_lhu);
        set(FusedLw, op_lw);
        set(Sb, op_sb);
        set(Sh, op_sh);
        set(Sw, op_sw);
        set(FusedSw, op_sw);
        set(Jal, op_jal);
        set(Jalr, op_jalr);
        set(Beq, op_beq);
        set(Bne, op_bne);
        set(Blt, op_blt);
        set(Bge, op_bge);
        set(Bltu, op_bltu);
        set(Bgeu, op_bgeu);
        set(Csrrw, op_csrrw);
        set(Csrrs, op_csrrs);
        set(Csrrc, op_csrrc);
        set(Csrrwi, op_csrrwi);
        set(Csrrsi, op_csrrsi);
        set(Csrrci, op_csrrci);
        set(FenceI, op_fencei);
        set(Ecall, op_ecall);
        set(Ebreak, op_ebreak);
        set(Wfi, op_wfi);
        set(Mret, op_mret);
        t[GUARD_TAG as usize] = op_guard;
        t[HALT_TAG as usize] = op_halt;
        t
    })
}

#[inline]
fn r32(p: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([p[at], p[at + 1], p[at + 2], p[at + 3]])
}

#[inline]
fn set_reg(cpu: &mut Cpu, rd: u8, value: u32) {
    if rd != 0 {
        cpu.x[rd as usize] = value;
    }
}

fn op_invalid(_cpu: &mut Cpu, _io: &mut dyn SystemIo, _p: &[u8]) -> Step {
    debug_assert!(false, "executed fragment with no handler");
    Step::FellThrough
}

fn op_nop(cpu: &mut Cpu, _io: &mut dyn SystemIo, p: &[u8]) -> Step {
    cpu.pc = cpu.pc.wrapping_add(u32::from(p[0]));
    Step::Next
}

fn op_li(cpu: &mut Cpu, _io: &mut dyn SystemIo, p: &[u8]) -> Step {
    set_reg(cpu, p[0], r32(p, 1));
    cpu.pc = cpu.pc.wrapping_add(u32::from(p[5]));
    Step::Next
}

macro_rules! alu_imm {
    ($name:ident, |$rs1:ident, $imm:ident| $body:expr) => {
        fn $name(cpu: &mut Cpu, _io: &mut dyn SystemIo, p: &[u8]) -> Step {
            let $rs1 = cpu.x[p[1] as usize];
            let $imm = r32(p, 2);
            set_reg(cpu, p[0], $body);
            cpu.pc = cpu.pc.wrapping_add(u32::from(p[6]));
            Step::Next
        }
    };
}

alu_imm!(op_addi, |rs1, imm| rs1.wrapping_add(imm));
alu_imm!(op_slti, |rs1, imm| ((rs1 as i32) < imm as i32) as u32);
alu_imm!(op_sltiu, |rs1, imm| (rs1 < imm) as u32);
alu_imm!(op_xori, |rs1, imm| rs1 ^ imm);
alu_imm!(op_ori, |rs1, imm| rs1 | imm);
alu_imm!(op_andi, |rs1, imm| rs1 & imm);

macro_rules! shift_imm {
    ($name:ident, |$rs1:ident, $sh:ident| $body:expr) => {
        fn $name(cpu: &mut Cpu, _io: &mut dyn SystemIo, p: &[u8]) -> Step {
            let $rs1 = cpu.x[p[1] as usize];
            let $sh = u32::from(p[2]);
            set_reg(cpu, p[0], $body);
            cpu.pc = cpu.pc.wrapping_add(u32::from(p[3]));
            Step::Next
        }
    };
}

shift_imm!(op_slli, |rs1, sh| rs1 << sh);
shift_imm!(op_srli, |rs1, sh| rs1 >> sh);
shift_imm!(op_srai, |rs1, sh| ((rs1 as i32) >> sh) as u32);

macro_rules! alu_reg {
    ($name:ident, |$rs1:ident, $rs2:ident| $body:expr) => {
        fn $name(cpu: &mut Cpu, _io: &mut dyn SystemIo, p: &[u8]) -> Step {
            let $rs1 = cpu.x[p[1] as usize];
            let $rs2 = cpu.x[p[2] as usize];
            set_reg(cpu, p[0], $body);
            cpu.pc = cpu.pc.wrapping_add(u32::from(p[3]));
            Step::Next
        }
    };
}

alu_reg!(op_add, |rs1, rs2| rs1.wrapping_add(rs2));
alu_reg!(op_sub, |rs1, rs2| rs1.wrapping_sub(rs2));
alu_reg!(op_sll, |rs1, rs2| rs1 << (rs2 & 0x1f));
alu_reg!(op_slt, |rs1, rs2| ((rs1 as i32) < rs2 as i32) as u32);
alu_reg!(op_sltu, |rs1, rs2| (rs1 < rs2) as u32);
alu_reg!(op_xor, |rs1, rs2| rs1 ^ rs2);
alu_reg!(op_srl, |rs1, rs2| rs1 >> (rs2 & 0x1f));
alu_reg!(op_sra, |rs1, rs2| ((rs1 as i32) >> (rs2 & 0x1f)) as u32);
alu_reg!(op_or, |rs1, rs2| rs1 | rs2);
alu_reg!(op_and, |rs1, rs2| rs1 & rs2);
alu_reg!(op_mul, |rs1, rs2| rs1.wrapping_mul(rs2));
alu_reg!(op_mulh, |rs1, rs2| {
    ((i64::from(rs1 as i32) * i64::from(rs2 as i32)) >> 32) as u32
});
alu_reg!(op_mulhsu, |rs1, rs2| {
    ((i64::from(rs1 as i32) * i64::from(rs2)) >> 32) as u32
});
alu_reg!(op_mulhu, |rs1, rs2| ((u64::from(rs1) * u64::from(rs2)) >> 32) as u32);
// Division results for divisor zero and signed overflow are the
// architecturally defined ones, not the host's.
alu_reg!(op_div, |rs1, rs2| {
    let dividend = rs1 as i32;
    let divisor = rs2 as i32;
    if divisor == 0 {
        !0
    } else if dividend == i32::MIN && divisor == -1 {
        rs1
    } else {
        (dividend / divisor) as u32
    }
});
alu_reg!(op_divu, |rs1, rs2| if rs2 == 0 { !0 } else { rs1 / rs2 });
alu_reg!(op_rem, |rs1, rs2| {
    let dividend = rs1 as i32;
    let divisor = rs2 as i32;
    if divisor == 0 {
        rs1
    } else if dividend == i32::MIN && divisor == -1 {
        0
    } else {
        (dividend % divisor) as u32
    }
});
alu_reg!(op_remu, |rs1, rs2| if rs2 == 0 { rs1 } else { rs1 % rs2 });

fn op_lb(cpu: &mut Cpu, io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let addr = cpu.x[p[1] as usize].wrapping_add(r32(p, 2));
    let value = io.mem_read_b(addr) as i8 as i32 as u32;
    set_reg(cpu, p[0], value);
    cpu.pc = cpu.pc.wrapping_add(u32::from(p[6]));
    Step::Next
}

fn op_lbu(cpu: &mut Cpu, io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let addr = cpu.x[p[1] as usize].wrapping_add(r32(p, 2));
    let value = u32::from(io.mem_read_b(addr));
    set_reg(cpu, p[0], value);
    cpu.pc = cpu.pc.wrapping_add(u32::from(p[6]));
    Step::Next
}

fn op_lh(cpu: &mut Cpu, io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let addr = cpu.x[p[1] as usize].wrapping_add(r32(p, 2));
    if addr & 1 != 0 {
        cpu.trap(Exception::LoadMisaligned, addr);
        return Step::Trap(Exception::LoadMisaligned);
    }
    let value = io.mem_read_s(addr) as i16 as i32 as u32;
    set_reg(cpu, p[0], value);
    cpu.pc = cpu.pc.wrapping_add(u32::from(p[6]));
    Step::Next
}

fn op_lhu(cpu: &mut Cpu, io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let addr = cpu.x[p[1] as usize].wrapping_add(r32(p, 2));
    if addr & 1 != 0 {
        cpu.trap(Exception::LoadMisaligned, addr);
        return Step::Trap(Exception::LoadMisaligned);
    }
    let value = u32::from(io.mem_read_s(addr));
    set_reg(cpu, p[0], value);
    cpu.pc = cpu.pc.wrapping_add(u32::from(p[6]));
    Step::Next
}

fn op_lw(cpu: &mut Cpu, io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let addr = cpu.x[p[1] as usize].wrapping_add(r32(p, 2));
    if addr & 3 != 0 {
        cpu.trap(Exception::LoadMisaligned, addr);
        return Step::Trap(Exception::LoadMisaligned);
    }
    let value = io.mem_read_w(addr);
    set_reg(cpu, p[0], value);
    cpu.pc = cpu.pc.wrapping_add(u32::from(p[6]));
    Step::Next
}

fn op_sb(cpu: &mut Cpu, io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let addr = cpu.x[p[0] as usize].wrapping_add(r32(p, 2));
    io.mem_write_b(addr, cpu.x[p[1] as usize] as u8);
    cpu.pc = cpu.pc.wrapping_add(u32::from(p[6]));
    Step::Next
}

fn op_sh(cpu: &mut Cpu, io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let addr = cpu.x[p[0] as usize].wrapping_add(r32(p, 2));
    if addr & 1 != 0 {
        cpu.trap(Exception::StoreMisaligned, addr);
        return Step::Trap(Exception::StoreMisaligned);
    }
    io.mem_write_s(addr, cpu.x[p[1] as usize] as u16);
    cpu.pc = cpu.pc.wrapping_add(u32::from(p[6]));
    Step::Next
}

fn op_sw(cpu: &mut Cpu, io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let addr = cpu.x[p[0] as usize].wrapping_add(r32(p, 2));
    if addr & 3 != 0 {
        cpu.trap(Exception::StoreMisaligned, addr);
        return Step::Trap(Exception::StoreMisaligned);
    }
    io.mem_write_w(addr, cpu.x[p[1] as usize]);
    cpu.pc = cpu.pc.wrapping_add(u32::from(p[6]));
    Step::Next
}

fn op_jal(cpu: &mut Cpu, _io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let link = r32(p, 1);
    let target = r32(p, 5);
    if target & 1 != 0 {
        cpu.trap(Exception::InsnMisaligned, target);
        return Step::Trap(Exception::InsnMisaligned);
    }
    set_reg(cpu, p[0], link);
    cpu.pc = target;
    Step::Jump
}

fn op_jalr(cpu: &mut Cpu, _io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let target = cpu.x[p[1] as usize].wrapping_add(r32(p, 2)) & !1;
    set_reg(cpu, p[0], r32(p, 6));
    cpu.pc = target;
    Step::Jump
}

macro_rules! branch {
    ($name:ident, |$rs1:ident, $rs2:ident| $cond:expr) => {
        fn $name(cpu: &mut Cpu, _io: &mut dyn SystemIo, p: &[u8]) -> Step {
            let $rs1 = cpu.x[p[0] as usize];
            let $rs2 = cpu.x[p[1] as usize];
            if $cond {
                let target = r32(p, 2);
                if target & 1 != 0 {
                    cpu.trap(Exception::InsnMisaligned, target);
                    return Step::Trap(Exception::InsnMisaligned);
                }
                cpu.pc = target;
                Step::Branch { taken: true }
            } else {
                cpu.pc = r32(p, 6);
                Step::Branch { taken: false }
            }
        }
    };
}

branch!(op_beq, |rs1, rs2| rs1 == rs2);
branch!(op_bne, |rs1, rs2| rs1 != rs2);
branch!(op_blt, |rs1, rs2| (rs1 as i32) < rs2 as i32);
branch!(op_bge, |rs1, rs2| (rs1 as i32) >= rs2 as i32);
branch!(op_bltu, |rs1, rs2| rs1 < rs2);
branch!(op_bgeu, |rs1, rs2| rs1 >= rs2);

fn csr_addr(p: &[u8]) -> u32 {
    u32::from(u16::from_le_bytes([p[2], p[3]]))
}

fn op_csrrw(cpu: &mut Cpu, _io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let value = cpu.x[p[1] as usize];
    let old = cpu.csr_csrrw(csr_addr(p), value);
    set_reg(cpu, p[0], old);
    cpu.pc = cpu.pc.wrapping_add(4);
    Step::Next
}

fn op_csrrs(cpu: &mut Cpu, _io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let mask = cpu.x[p[1] as usize];
    let old = cpu.csr_csrrs(csr_addr(p), mask);
    set_reg(cpu, p[0], old);
    cpu.pc = cpu.pc.wrapping_add(4);
    Step::Next
}

fn op_csrrc(cpu: &mut Cpu, _io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let mask = cpu.x[p[1] as usize];
    let old = cpu.csr_csrrc(csr_addr(p), mask);
    set_reg(cpu, p[0], old);
    cpu.pc = cpu.pc.wrapping_add(4);
    Step::Next
}

fn op_csrrwi(cpu: &mut Cpu, _io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let old = cpu.csr_csrrw(csr_addr(p), u32::from(p[1]));
    set_reg(cpu, p[0], old);
    cpu.pc = cpu.pc.wrapping_add(4);
    Step::Next
}

fn op_csrrsi(cpu: &mut Cpu, _io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let old = cpu.csr_csrrs(csr_addr(p), u32::from(p[1]));
    set_reg(cpu, p[0], old);
    cpu.pc = cpu.pc.wrapping_add(4);
    Step::Next
}

fn op_csrrci(cpu: &mut Cpu, _io: &mut dyn SystemIo, p: &[u8]) -> Step {
    let old = cpu.csr_csrrc(csr_addr(p), u32::from(p[1]));
    set_reg(cpu, p[0], old);
    cpu.pc = cpu.pc.wrapping_add(4);
    Step::Next
}

fn op_fencei(cpu: &mut Cpu, _io: &mut dyn SystemIo, p: &[u8]) -> Step {
    // Instruction-stream barrier: end the block and force a fresh lookup.
    cpu.pc = r32(p, 0);
    Step::Jump
}

fn op_ecall(cpu: &mut Cpu, io: &mut dyn SystemIo, _p: &[u8]) -> Step {
    io.on_ecall(cpu);
    Step::Jump
}

fn op_ebreak(cpu: &mut Cpu, io: &mut dyn SystemIo, _p: &[u8]) -> Step {
    io.on_ebreak(cpu);
    Step::Jump
}

fn op_wfi(_cpu: &mut Cpu, _io: &mut dyn SystemIo, _p: &[u8]) -> Step {
    Step::Exit
}

fn op_mret(cpu: &mut Cpu, _io: &mut dyn SystemIo, _p: &[u8]) -> Step {
    cpu.pc = cpu.csr.mepc;
    Step::Jump
}

fn op_guard(_cpu: &mut Cpu, _io: &mut dyn SystemIo, _p: &[u8]) -> Step {
    // PC already sits at pc_end; hand control back for a cache lookup.
    Step::Jump
}

fn op_halt(_cpu: &mut Cpu, _io: &mut dyn SystemIo, _p: &[u8]) -> Step {
    Step::FellThrough
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_page::{CodePagePool, CODE_PAGE_SIZE};
    use crate::ir::{BlockRef, MemOp};

    struct TestIo {
        mem: Vec<u8>,
    }

    impl TestIo {
        fn new(size: usize) -> Self {
            Self { mem: vec![0; size] }
        }
    }

    impl SystemIo for TestIo {
        fn mem_ifetch(&mut self, addr: u32) -> u32 {
            self.mem_read_w(addr & !3)
        }
        fn mem_read_b(&mut self, addr: u32) -> u8 {
            self.mem[addr as usize]
        }
        fn mem_read_s(&mut self, addr: u32) -> u16 {
            let i = addr as usize;
            u16::from_le_bytes([self.mem[i], self.mem[i + 1]])
        }
        fn mem_read_w(&mut self, addr: u32) -> u32 {
            let i = addr as usize;
            u32::from_le_bytes([
                self.mem[i],
                self.mem[i + 1],
                self.mem[i + 2],
                self.mem[i + 3],
            ])
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
    }

    fn insn(opcode: Opcode, pc: u32) -> IrInsn {
        IrInsn::new(opcode, pc, 4)
    }

    fn block_of(insns: Vec<IrInsn>) -> Block {
        let mut block = Block::new(insns[0].pc);
        block.pc_end = {
            let last = insns.last().unwrap();
            last.pc + u32::from(last.insn_len)
        };
        block.n_insn = insns.len() as u32;
        block.ir = insns;
        block.tail_mut().terminator = true;
        block
    }

    fn compile(block: &Block) -> (CodePagePool, u32) {
        let mut pool = CodePagePool::new(1);
        let (slot, _) = pool.acquire_next(BlockRef {
            index: 0,
            generation: 0,
        });
        compile_block(block, pool.page_mut(slot)).unwrap();
        (pool, slot)
    }

    #[test]
    fn fragment_lengths_account_for_every_byte() {
        let mut insns = Vec::new();
        for i in 0..10u32 {
            let mut node = insn(Opcode::Addi, 0x1000 + i * 4);
            node.rd = 5;
            node.rs1 = 5;
            node.imm = 1;
            insns.push(node);
        }
        let block = block_of(insns);
        let (pool, slot) = compile(&block);

        let expected: usize = block
            .ir
            .iter()
            .map(|i| fragment_len(i.opcode as u8))
            .sum::<usize>()
            + fragment_len(GUARD_TAG)
            + fragment_len(HALT_TAG);
        assert_eq!(pool.page(slot).len(), expected);
    }

    #[test]
    fn maximum_length_block_fits_one_page() {
        // The widest non-terminator fragment is 8 bytes; at the default
        // 256-instruction cap the page has plenty of headroom, and even the
        // hard config clamp of 510 stays inside one page.
        let mut insns = Vec::new();
        for i in 0..510u32 {
            let mut node = insn(Opcode::Addi, 0x1000 + i * 4);
            node.rd = 1;
            node.rs1 = 1;
            node.imm = 1;
            insns.push(node);
        }
        let block = block_of(insns);
        let (pool, slot) = compile(&block);
        assert!(pool.page(slot).len() <= CODE_PAGE_SIZE);
        assert_eq!(pool.page(slot).len(), 510 * 8 + 2);
    }

    #[test]
    fn straight_line_arithmetic_executes() {
        let mut li = insn(Opcode::Lui, 0x1000);
        li.rd = 1;
        li.imm = 0x5000;
        let mut add = insn(Opcode::Add, 0x1004);
        add.rd = 2;
        add.rs1 = 1;
        add.rs2 = 1;
        let block = block_of(vec![li, add]);
        let (pool, slot) = compile(&block);

        let mut cpu = Cpu::new();
        cpu.pc = 0x1000;
        let mut io = TestIo::new(0);
        let outcome = execute(pool.page(slot).bytes(), &mut cpu, &mut io);
        assert_eq!(outcome, PageOutcome::Jump); // artificial terminator
        assert_eq!(cpu.x[1], 0x5000);
        assert_eq!(cpu.x[2], 0xa000);
        assert_eq!(cpu.pc, 0x1008);
        assert_eq!(cpu.cycle, 2);
    }

    #[test]
    fn taken_and_untaken_branches_report_their_edge() {
        let mut li = insn(Opcode::Addi, 0x1000);
        li.rd = 1;
        li.imm = 7;
        let mut beq = insn(Opcode::Beq, 0x1004);
        beq.rs1 = 1;
        beq.rs2 = 0;
        beq.imm = 0x100;
        let block = block_of(vec![li.clone(), beq]);
        let (pool, slot) = compile(&block);

        let mut cpu = Cpu::new();
        cpu.pc = 0x1000;
        let mut io = TestIo::new(0);
        let outcome = execute(pool.page(slot).bytes(), &mut cpu, &mut io);
        assert_eq!(outcome, PageOutcome::Branch { taken: false });
        assert_eq!(cpu.pc, 0x1008);

        let mut bne = insn(Opcode::Bne, 0x1004);
        bne.rs1 = 1;
        bne.rs2 = 0;
        bne.imm = 0x100;
        let block = block_of(vec![li, bne]);
        let (pool, slot) = compile(&block);
        let mut cpu = Cpu::new();
        cpu.pc = 0x1000;
        let outcome = execute(pool.page(slot).bytes(), &mut cpu, &mut io);
        assert_eq!(outcome, PageOutcome::Branch { taken: true });
        assert_eq!(cpu.pc, 0x1104);
    }

    #[test]
    fn misaligned_load_traps_through_the_outcome() {
        let mut lw = insn(Opcode::Lw, 0x1000);
        lw.rd = 3;
        lw.rs1 = 1;
        lw.imm = 2;
        let block = block_of(vec![lw]);
        let (pool, slot) = compile(&block);

        let mut cpu = Cpu::new();
        cpu.pc = 0x1000;
        cpu.csr.mtvec = 0x8000;
        cpu.x[1] = 0x2000; // addr = 0x2002, misaligned
        let mut io = TestIo::new(0x3000);
        let outcome = execute(pool.page(slot).bytes(), &mut cpu, &mut io);
        assert_eq!(outcome, PageOutcome::Trap(Exception::LoadMisaligned));
        assert_eq!(cpu.pc, 0x8000);
        assert_eq!(cpu.csr.mtval, 0x2002);
        assert_eq!(cpu.csr.mepc, 0x1000);
    }

    #[test]
    fn fused_store_run_expands_to_one_fragment_per_part() {
        let mut fused = insn(Opcode::FusedSw, 0x1000);
        fused.fused = vec![
            MemOp { rs1: 1, reg: 2, imm: 0 },
            MemOp { rs1: 1, reg: 3, imm: 4 },
            MemOp { rs1: 1, reg: 4, imm: 8 },
        ];
        fused.imm2 = 3;
        let block = block_of(vec![fused]);
        let (pool, slot) = compile(&block);
        assert_eq!(
            pool.page(slot).len(),
            3 * fragment_len(Opcode::FusedSw as u8) + 2
        );

        let mut cpu = Cpu::new();
        cpu.pc = 0x1000;
        cpu.x[1] = 0x100;
        cpu.x[2] = 0xaa;
        cpu.x[3] = 0xbb;
        cpu.x[4] = 0xcc;
        let mut io = TestIo::new(0x200);
        let outcome = execute(pool.page(slot).bytes(), &mut cpu, &mut io);
        assert_eq!(outcome, PageOutcome::Jump);
        assert_eq!(cpu.pc, 0x100c);
        assert_eq!(io.mem_read_w(0x100), 0xaa);
        assert_eq!(io.mem_read_w(0x104), 0xbb);
        assert_eq!(io.mem_read_w(0x108), 0xcc);
    }

    #[test]
    fn wfi_exits_and_mret_returns_to_mepc() {
        let block = block_of(vec![insn(Opcode::Wfi, 0x1000)]);
        let (pool, slot) = compile(&block);
        let mut cpu = Cpu::new();
        cpu.pc = 0x1000;
        let mut io = TestIo::new(0);
        assert_eq!(
            execute(pool.page(slot).bytes(), &mut cpu, &mut io),
            PageOutcome::Exit
        );
        assert_eq!(cpu.pc, 0x1000);

        let block = block_of(vec![insn(Opcode::Mret, 0x1000)]);
        let (pool, slot) = compile(&block);
        cpu.csr.mepc = 0x4444;
        assert_eq!(
            execute(pool.page(slot).bytes(), &mut cpu, &mut io),
            PageOutcome::Jump
        );
        assert_eq!(cpu.pc, 0x4444);
    }
}
