//! RV32IM + Zicsr instruction decoding, including the compressed subset.
//!
//! Compressed encodings are expanded to their 32-bit equivalents at decode
//! time; only `insn_len` remembers that the guest encoding was 2 bytes.

use crate::ir::{IrInsn, Opcode};

/// Illegal or unsupported encoding, carrying the raw instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal instruction encoding {word:#010x}")]
pub struct IllegalInsn {
    pub word: u32,
}

#[inline]
fn sext(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Decode the instruction at `pc` from the fetched word. For compressed
/// instructions only the low 16 bits of `word` are meaningful.
pub fn decode(word: u32, pc: u32) -> Result<IrInsn, IllegalInsn> {
    if word & 3 == 3 {
        decode_32(word, pc)
    } else {
        decode_16(word as u16, pc)
    }
}

fn decode_32(word: u32, pc: u32) -> Result<IrInsn, IllegalInsn> {
    let rd = ((word >> 7) & 0x1f) as u8;
    let funct3 = (word >> 12) & 7;
    let rs1 = ((word >> 15) & 0x1f) as u8;
    let rs2 = ((word >> 20) & 0x1f) as u8;
    let funct7 = word >> 25;

    let imm_i = (word as i32) >> 20;
    let imm_s = (((word & 0xfe00_0000) as i32) >> 20) | ((word >> 7) & 0x1f) as i32;
    let imm_b = sext(
        ((word >> 31) << 12)
            | (((word >> 7) & 1) << 11)
            | (((word >> 25) & 0x3f) << 5)
            | (((word >> 8) & 0xf) << 1),
        13,
    );
    let imm_u = (word & 0xffff_f000) as i32;
    let imm_j = sext(
        ((word >> 31) << 20)
            | (((word >> 12) & 0xff) << 12)
            | (((word >> 20) & 1) << 11)
            | (((word >> 21) & 0x3ff) << 1),
        21,
    );

    let mut insn = IrInsn::new(Opcode::Nop, pc, 4);
    insn.rd = rd;
    insn.rs1 = rs1;
    insn.rs2 = rs2;

    match word & 0x7f {
        0x37 => {
            insn.opcode = Opcode::Lui;
            insn.imm = imm_u;
        }
        0x17 => {
            insn.opcode = Opcode::Auipc;
            insn.imm = imm_u;
        }
        0x6f => {
            insn.opcode = Opcode::Jal;
            insn.imm = imm_j;
        }
        0x67 if funct3 == 0 => {
            insn.opcode = Opcode::Jalr;
            insn.imm = imm_i;
        }
        0x63 => {
            insn.opcode = match funct3 {
                0 => Opcode::Beq,
                1 => Opcode::Bne,
                4 => Opcode::Blt,
                5 => Opcode::Bge,
                6 => Opcode::Bltu,
                7 => Opcode::Bgeu,
                _ => return Err(IllegalInsn { word }),
            };
            insn.imm = imm_b;
        }
        0x03 => {
            insn.opcode = match funct3 {
                0 => Opcode::Lb,
                1 => Opcode::Lh,
                2 => Opcode::Lw,
                4 => Opcode::Lbu,
                5 => Opcode::Lhu,
                _ => return Err(IllegalInsn { word }),
            };
            insn.imm = imm_i;
        }
        0x23 => {
            insn.opcode = match funct3 {
                0 => Opcode::Sb,
                1 => Opcode::Sh,
                2 => Opcode::Sw,
                _ => return Err(IllegalInsn { word }),
            };
            insn.imm = imm_s;
        }
        0x13 => {
            insn.imm = imm_i;
            insn.opcode = match funct3 {
                0 => Opcode::Addi,
                2 => Opcode::Slti,
                3 => Opcode::Sltiu,
                4 => Opcode::Xori,
                6 => Opcode::Ori,
                7 => Opcode::Andi,
                1 if funct7 == 0x00 => {
                    insn.shamt = rs2;
                    Opcode::Slli
                }
                5 if funct7 == 0x00 => {
                    insn.shamt = rs2;
                    Opcode::Srli
                }
                5 if funct7 == 0x20 => {
                    insn.shamt = rs2;
                    Opcode::Srai
                }
                _ => return Err(IllegalInsn { word }),
            };
        }
        0x33 => {
            insn.opcode = match (funct7, funct3) {
                (0x00, 0) => Opcode::Add,
                (0x20, 0) => Opcode::Sub,
                (0x00, 1) => Opcode::Sll,
                (0x00, 2) => Opcode::Slt,
                (0x00, 3) => Opcode::Sltu,
                (0x00, 4) => Opcode::Xor,
                (0x00, 5) => Opcode::Srl,
                (0x20, 5) => Opcode::Sra,
                (0x00, 6) => Opcode::Or,
                (0x00, 7) => Opcode::And,
                (0x01, 0) => Opcode::Mul,
                (0x01, 1) => Opcode::Mulh,
                (0x01, 2) => Opcode::Mulhsu,
                (0x01, 3) => Opcode::Mulhu,
                (0x01, 4) => Opcode::Div,
                (0x01, 5) => Opcode::Divu,
                (0x01, 6) => Opcode::Rem,
                (0x01, 7) => Opcode::Remu,
                _ => return Err(IllegalInsn { word }),
            };
        }
        0x0f => {
            insn.opcode = match funct3 {
                0 => Opcode::Fence,
                1 => Opcode::FenceI,
                _ => return Err(IllegalInsn { word }),
            };
        }
        0x73 => match funct3 {
            0 => {
                insn.opcode = match word {
                    0x0000_0073 => Opcode::Ecall,
                    0x0010_0073 => Opcode::Ebreak,
                    0x1050_0073 => Opcode::Wfi,
                    0x3020_0073 => Opcode::Mret,
                    _ => return Err(IllegalInsn { word }),
                };
            }
            1..=3 | 5..=7 => {
                insn.opcode = match funct3 {
                    1 => Opcode::Csrrw,
                    2 => Opcode::Csrrs,
                    3 => Opcode::Csrrc,
                    5 => Opcode::Csrrwi,
                    6 => Opcode::Csrrsi,
                    7 => Opcode::Csrrci,
                    _ => unreachable!(),
                };
                // CSR number travels in imm; rs1 is a register index or a
                // 5-bit immediate depending on the variant.
                insn.imm = ((word >> 20) & 0xfff) as i32;
            }
            _ => return Err(IllegalInsn { word }),
        },
        _ => return Err(IllegalInsn { word }),
    }
    Ok(insn)
}

fn decode_16(half: u16, pc: u32) -> Result<IrInsn, IllegalInsn> {
    let word = u32::from(half);
    let illegal = IllegalInsn { word };
    let funct3 = (word >> 13) & 7;
    // The all-zero halfword is defined illegal; catching it here also stops
    // block formation from walking zero-filled memory.
    if word == 0 {
        return Err(illegal);
    }

    let mut insn = IrInsn::new(Opcode::Nop, pc, 2);
    let rc1 = (8 + ((word >> 7) & 7)) as u8; // rs1'/rd'
    let rc2 = (8 + ((word >> 2) & 7)) as u8; // rs2'/rd'
    let rfull = ((word >> 7) & 0x1f) as u8;
    let rs2_full = ((word >> 2) & 0x1f) as u8;

    match word & 3 {
        0 => match funct3 {
            0 => {
                // C.ADDI4SPN
                let imm = (((word >> 7) & 0xf) << 6)
                    | (((word >> 11) & 3) << 4)
                    | (((word >> 5) & 1) << 3)
                    | (((word >> 6) & 1) << 2);
                if imm == 0 {
                    return Err(illegal);
                }
                insn.opcode = Opcode::Addi;
                insn.rd = rc2;
                insn.rs1 = 2;
                insn.imm = imm as i32;
            }
            2 => {
                // C.LW
                insn.opcode = Opcode::Lw;
                insn.rd = rc2;
                insn.rs1 = rc1;
                insn.imm = c_mem_imm(word) as i32;
            }
            6 => {
                // C.SW
                insn.opcode = Opcode::Sw;
                insn.rs1 = rc1;
                insn.rs2 = rc2;
                insn.imm = c_mem_imm(word) as i32;
            }
            _ => return Err(illegal),
        },
        1 => match funct3 {
            0 => {
                // C.NOP / C.ADDI
                insn.opcode = Opcode::Addi;
                insn.rd = rfull;
                insn.rs1 = rfull;
                insn.imm = c_imm6(word);
            }
            1 | 5 => {
                // C.JAL / C.J
                insn.opcode = Opcode::Jal;
                insn.rd = if funct3 == 1 { 1 } else { 0 };
                insn.imm = sext(
                    (((word >> 12) & 1) << 11)
                        | (((word >> 8) & 1) << 10)
                        | (((word >> 9) & 3) << 8)
                        | (((word >> 6) & 1) << 7)
                        | (((word >> 7) & 1) << 6)
                        | (((word >> 2) & 1) << 5)
                        | (((word >> 11) & 1) << 4)
                        | (((word >> 3) & 7) << 1),
                    12,
                );
            }
            2 => {
                // C.LI
                insn.opcode = Opcode::Addi;
                insn.rd = rfull;
                insn.rs1 = 0;
                insn.imm = c_imm6(word);
            }
            3 => {
                if rfull == 2 {
                    // C.ADDI16SP
                    let imm = sext(
                        (((word >> 12) & 1) << 9)
                            | (((word >> 3) & 3) << 7)
                            | (((word >> 5) & 1) << 6)
                            | (((word >> 2) & 1) << 5)
                            | (((word >> 6) & 1) << 4),
                        10,
                    );
                    if imm == 0 {
                        return Err(illegal);
                    }
                    insn.opcode = Opcode::Addi;
                    insn.rd = 2;
                    insn.rs1 = 2;
                    insn.imm = imm;
                } else {
                    // C.LUI
                    let imm = sext(
                        (((word >> 12) & 1) << 17) | (((word >> 2) & 0x1f) << 12),
                        18,
                    );
                    if imm == 0 || rfull == 0 {
                        return Err(illegal);
                    }
                    insn.opcode = Opcode::Lui;
                    insn.rd = rfull;
                    insn.imm = imm;
                }
            }
            4 => match (word >> 10) & 3 {
                0 | 1 => {
                    let shamt = ((((word >> 12) & 1) << 5) | ((word >> 2) & 0x1f)) as u8;
                    if shamt >= 32 {
                        return Err(illegal);
                    }
                    insn.opcode = if (word >> 10) & 3 == 0 {
                        Opcode::Srli
                    } else {
                        Opcode::Srai
                    };
                    insn.rd = rc1;
                    insn.rs1 = rc1;
                    insn.shamt = shamt;
                }
                2 => {
                    insn.opcode = Opcode::Andi;
                    insn.rd = rc1;
                    insn.rs1 = rc1;
                    insn.imm = c_imm6(word);
                }
                _ => {
                    if (word >> 12) & 1 != 0 {
                        return Err(illegal);
                    }
                    insn.opcode = match (word >> 5) & 3 {
                        0 => Opcode::Sub,
                        1 => Opcode::Xor,
                        2 => Opcode::Or,
                        _ => Opcode::And,
                    };
                    insn.rd = rc1;
                    insn.rs1 = rc1;
                    insn.rs2 = rc2;
                }
            },
            _ => {
                // C.BEQZ / C.BNEZ
                insn.opcode = if funct3 == 6 { Opcode::Beq } else { Opcode::Bne };
                insn.rs1 = rc1;
                insn.rs2 = 0;
                insn.imm = sext(
                    (((word >> 12) & 1) << 8)
                        | (((word >> 5) & 3) << 6)
                        | (((word >> 2) & 1) << 5)
                        | (((word >> 10) & 3) << 3)
                        | (((word >> 3) & 3) << 1),
                    9,
                );
            }
        },
        _ => match funct3 {
            0 => {
                // C.SLLI
                let shamt = ((((word >> 12) & 1) << 5) | ((word >> 2) & 0x1f)) as u8;
                if shamt >= 32 {
                    return Err(illegal);
                }
                insn.opcode = Opcode::Slli;
                insn.rd = rfull;
                insn.rs1 = rfull;
                insn.shamt = shamt;
            }
            2 => {
                // C.LWSP
                if rfull == 0 {
                    return Err(illegal);
                }
                insn.opcode = Opcode::Lw;
                insn.rd = rfull;
                insn.rs1 = 2;
                insn.imm = ((((word >> 2) & 3) << 6)
                    | (((word >> 12) & 1) << 5)
                    | (((word >> 4) & 7) << 2)) as i32;
            }
            4 => {
                let bit12 = (word >> 12) & 1;
                match (bit12, rfull, rs2_full) {
                    (0, 0, 0) => return Err(illegal),
                    (0, _, 0) => {
                        // C.JR
                        insn.opcode = Opcode::Jalr;
                        insn.rd = 0;
                        insn.rs1 = rfull;
                    }
                    (0, _, _) => {
                        // C.MV
                        insn.opcode = Opcode::Add;
                        insn.rd = rfull;
                        insn.rs1 = 0;
                        insn.rs2 = rs2_full;
                    }
                    (1, 0, 0) => insn.opcode = Opcode::Ebreak,
                    (1, _, 0) => {
                        // C.JALR
                        insn.opcode = Opcode::Jalr;
                        insn.rd = 1;
                        insn.rs1 = rfull;
                    }
                    (1, _, _) => {
                        // C.ADD
                        insn.opcode = Opcode::Add;
                        insn.rd = rfull;
                        insn.rs1 = rfull;
                        insn.rs2 = rs2_full;
                    }
                    _ => unreachable!(),
                }
            }
            6 => {
                // C.SWSP
                insn.opcode = Opcode::Sw;
                insn.rs1 = 2;
                insn.rs2 = rs2_full;
                insn.imm =
                    ((((word >> 7) & 3) << 6) | (((word >> 9) & 0xf) << 2)) as i32;
            }
            _ => return Err(illegal),
        },
    }
    Ok(insn)
}

fn c_mem_imm(word: u32) -> u32 {
    (((word >> 5) & 1) << 6) | (((word >> 10) & 7) << 3) | (((word >> 6) & 1) << 2)
}

fn c_imm6(word: u32) -> i32 {
    sext((((word >> 12) & 1) << 5) | ((word >> 2) & 0x1f), 6)
}
