//! Cranelift-driven backend.
//!
//! Same contract as the direct emitter, with the toolkit doing the host
//! instruction selection: each region block becomes a Cranelift block,
//! chained branches become block-to-block jumps (the builder resolves
//! forward references), and everything else funnels through one exit
//! block that writes the guest PC and returns.

use std::collections::HashMap;

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, AbiParam, Block, InstBuilder, MemFlags, SigRef, Type, Value};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, Linkage, Module};

use crate::{
    layout, CompileError, CompileRequest, CompiledRegion, Cond, MemWidth, Op, RegionCompiler,
    RegionFn,
};

pub struct CraneliftBackend {
    module: JITModule,
    context: cranelift_codegen::Context,
    builder_context: FunctionBuilderContext,
    next_symbol_id: u64,
}

impl Default for CraneliftBackend {
    fn default() -> Self {
        let mut flag_builder = settings::builder();
        // Favor runtime speed for hot loop bodies.
        flag_builder
            .set("opt_level", "speed")
            .expect("set cranelift opt_level");
        let flags = settings::Flags::new(flag_builder);

        let isa_builder = cranelift_native::builder().expect("create host ISA builder");
        let isa = isa_builder.finish(flags).expect("finish host ISA");
        let jit_builder = JITBuilder::with_isa(isa, default_libcall_names());
        let module = JITModule::new(jit_builder);
        let context = module.make_context();

        Self {
            module,
            context,
            builder_context: FunctionBuilderContext::new(),
            next_symbol_id: 0,
        }
    }
}

fn backend_err<E: std::fmt::Display>(what: &str) -> impl FnOnce(E) -> CompileError + '_ {
    move |e| CompileError::Backend {
        message: format!("{what}: {e}"),
    }
}

impl RegionCompiler for CraneliftBackend {
    fn name(&self) -> &'static str {
        "cranelift"
    }

    fn compile(&mut self, request: &CompileRequest<'_>) -> Result<CompiledRegion, CompileError> {
        let ptr_type = self.module.target_config().pointer_type();

        self.context.clear();
        self.context.func.signature.params.clear();
        self.context.func.signature.returns.clear();
        self.context
            .func
            .signature
            .params
            .push(AbiParam::new(ptr_type));
        self.context
            .func
            .signature
            .params
            .push(AbiParam::new(ptr_type));

        let mut sig_read = self.module.make_signature();
        sig_read.params.push(AbiParam::new(ptr_type));
        sig_read.params.push(AbiParam::new(types::I32));
        sig_read.returns.push(AbiParam::new(types::I32));
        let mut sig_write = self.module.make_signature();
        sig_write.params.push(AbiParam::new(ptr_type));
        sig_write.params.push(AbiParam::new(types::I32));
        sig_write.params.push(AbiParam::new(types::I32));
        let mut sig_env = self.module.make_signature();
        sig_env.params.push(AbiParam::new(ptr_type));

        {
            let mut builder =
                FunctionBuilder::new(&mut self.context.func, &mut self.builder_context);
            let sig_read = builder.import_signature(sig_read);
            let sig_write = builder.import_signature(sig_write);
            let sig_env = builder.import_signature(sig_env);

            let entry = builder.create_block();
            builder.append_block_params_for_function_params(entry);
            builder.switch_to_block(entry);
            let regs = builder.block_params(entry)[0];
            let cbs = builder.block_params(entry)[1];

            let mut flags = MemFlags::new();
            flags.set_notrap();
            flags.set_aligned();

            let mut heads: HashMap<u32, Block> = HashMap::new();
            for block in request.blocks {
                heads.insert(block.pc_start, builder.create_block());
            }
            let exit_block = builder.create_block();
            builder.append_block_param(exit_block, types::I32);

            let root_head = *heads
                .get(&request.root)
                .ok_or(CompileError::Backend {
                    message: "root block missing from compile request".into(),
                })?;
            builder.ins().jump(root_head, &[]);

            let mut emit = Emit {
                b: builder,
                regs,
                cbs,
                flags,
                sig_read,
                sig_write,
                sig_env,
                ptr_type,
                heads,
                exit_block,
            };

            for block in request.blocks {
                let head = emit.heads[&block.pc_start];
                emit.b.switch_to_block(head);

                // Per-block cycle accounting and budget check: loops
                // chained inside the region must still honor the dispatch
                // loop's budget.
                let cycle = emit
                    .b
                    .ins()
                    .load(types::I64, emit.flags, emit.regs, layout::cycle());
                let n = emit.b.ins().iconst(types::I64, i64::from(block.n_insn));
                let sum = emit.b.ins().iadd(cycle, n);
                emit.b
                    .ins()
                    .store(emit.flags, sum, emit.regs, layout::cycle());
                let limit =
                    emit.b
                        .ins()
                        .load(types::I64, emit.flags, emit.regs, layout::cycle_limit());
                let over = emit
                    .b
                    .ins()
                    .icmp(IntCC::UnsignedGreaterThanOrEqual, sum, limit);
                let body = emit.b.create_block();
                let here = emit.const_u32(block.pc_start);
                emit.b.ins().brif(over, emit.exit_block, &[here], body, &[]);
                emit.b.switch_to_block(body);

                let mut terminated = false;
                for op in &block.ops {
                    terminated = emit.op(*op);
                }
                if !terminated {
                    emit.goto(block.pc_end);
                }
            }

            emit.b.switch_to_block(emit.exit_block);
            let final_pc = emit.b.block_params(emit.exit_block)[0];
            emit.b
                .ins()
                .store(emit.flags, final_pc, emit.regs, layout::pc());
            emit.b.ins().return_(&[]);

            emit.b.seal_all_blocks();
            emit.b.finalize();
        }

        let symbol = format!("rv32_region_{}", self.next_symbol_id);
        self.next_symbol_id += 1;

        let func_id = self
            .module
            .declare_function(&symbol, Linkage::Local, &self.context.func.signature)
            .map_err(backend_err("declare_function"))?;
        self.module
            .define_function(func_id, &mut self.context)
            .map_err(backend_err("define_function"))?;
        self.module.clear_context(&mut self.context);
        self.module
            .finalize_definitions()
            .map_err(backend_err("finalize_definitions"))?;

        let code = self.module.get_finalized_function(func_id);
        // SAFETY: the function was built with exactly the RegionFn
        // signature; the JIT module keeps its memory alive for the
        // backend's lifetime.
        let entry = unsafe { std::mem::transmute::<*const u8, RegionFn>(code) };
        Ok(CompiledRegion::new(
            request.root,
            request.blocks.len() as u32,
            entry,
        ))
    }
}

struct Emit<'a> {
    b: FunctionBuilder<'a>,
    regs: Value,
    cbs: Value,
    flags: MemFlags,
    sig_read: SigRef,
    sig_write: SigRef,
    sig_env: SigRef,
    ptr_type: Type,
    heads: HashMap<u32, Block>,
    exit_block: Block,
}

impl Emit<'_> {
    fn const_i32(&mut self, value: i32) -> Value {
        self.b.ins().iconst(types::I32, i64::from(value))
    }

    fn const_u32(&mut self, value: u32) -> Value {
        self.const_i32(value as i32)
    }

    fn load_reg(&mut self, reg: u8) -> Value {
        if reg == 0 {
            self.b.ins().iconst(types::I32, 0)
        } else {
            self.b
                .ins()
                .load(types::I32, self.flags, self.regs, layout::xreg(reg))
        }
    }

    fn store_reg(&mut self, reg: u8, value: Value) {
        if reg != 0 {
            self.b
                .ins()
                .store(self.flags, value, self.regs, layout::xreg(reg));
        }
    }

    /// Jump to the block at `target`, chaining within the region and
    /// exiting through the shared trampoline otherwise.
    fn goto(&mut self, target: u32) {
        if let Some(&head) = self.heads.get(&target) {
            self.b.ins().jump(head, &[]);
        } else {
            let pc = self.const_u32(target);
            self.b.ins().jump(self.exit_block, &[pc]);
        }
    }

    fn cb_fn(&mut self, offset: i32) -> (Value, Value) {
        let user = self
            .b
            .ins()
            .load(self.ptr_type, self.flags, self.cbs, layout::cb_user());
        let fptr = self
            .b
            .ins()
            .load(self.ptr_type, self.flags, self.cbs, offset);
        (user, fptr)
    }

    fn bool_to_reg(&mut self, flag: Value) -> Value {
        self.b.ins().uextend(types::I32, flag)
    }

    /// Emit one op; returns true if it terminated the block.
    fn op(&mut self, op: Op) -> bool {
        match op {
            Op::Nop => {}
            Op::Li { rd, imm } => {
                let v = self.const_i32(imm);
                self.store_reg(rd, v);
            }
            Op::Addi { rd, rs1, imm } => {
                let a = self.load_reg(rs1);
                let b = self.const_i32(imm);
                let v = self.b.ins().iadd(a, b);
                self.store_reg(rd, v);
            }
            Op::Slti { rd, rs1, imm } => {
                let a = self.load_reg(rs1);
                let flag = self.b.ins().icmp_imm(IntCC::SignedLessThan, a, i64::from(imm));
                let v = self.bool_to_reg(flag);
                self.store_reg(rd, v);
            }
            Op::Sltiu { rd, rs1, imm } => {
                let a = self.load_reg(rs1);
                let flag = self
                    .b
                    .ins()
                    .icmp_imm(IntCC::UnsignedLessThan, a, i64::from(imm));
                let v = self.bool_to_reg(flag);
                self.store_reg(rd, v);
            }
            Op::Xori { rd, rs1, imm } => {
                let a = self.load_reg(rs1);
                let b = self.const_i32(imm);
                let v = self.b.ins().bxor(a, b);
                self.store_reg(rd, v);
            }
            Op::Ori { rd, rs1, imm } => {
                let a = self.load_reg(rs1);
                let b = self.const_i32(imm);
                let v = self.b.ins().bor(a, b);
                self.store_reg(rd, v);
            }
            Op::Andi { rd, rs1, imm } => {
                let a = self.load_reg(rs1);
                let b = self.const_i32(imm);
                let v = self.b.ins().band(a, b);
                self.store_reg(rd, v);
            }
            Op::Slli { rd, rs1, shamt } => {
                let a = self.load_reg(rs1);
                let v = self.b.ins().ishl_imm(a, i64::from(shamt));
                self.store_reg(rd, v);
            }
            Op::Srli { rd, rs1, shamt } => {
                let a = self.load_reg(rs1);
                let v = self.b.ins().ushr_imm(a, i64::from(shamt));
                self.store_reg(rd, v);
            }
            Op::Srai { rd, rs1, shamt } => {
                let a = self.load_reg(rs1);
                let v = self.b.ins().sshr_imm(a, i64::from(shamt));
                self.store_reg(rd, v);
            }
            Op::Add { rd, rs1, rs2 } => {
                let (a, b) = (self.load_reg(rs1), self.load_reg(rs2));
                let v = self.b.ins().iadd(a, b);
                self.store_reg(rd, v);
            }
            Op::Sub { rd, rs1, rs2 } => {
                let (a, b) = (self.load_reg(rs1), self.load_reg(rs2));
                let v = self.b.ins().isub(a, b);
                self.store_reg(rd, v);
            }
            Op::Xor { rd, rs1, rs2 } => {
                let (a, b) = (self.load_reg(rs1), self.load_reg(rs2));
                let v = self.b.ins().bxor(a, b);
                self.store_reg(rd, v);
            }
            Op::Or { rd, rs1, rs2 } => {
                let (a, b) = (self.load_reg(rs1), self.load_reg(rs2));
                let v = self.b.ins().bor(a, b);
                self.store_reg(rd, v);
            }
            Op::And { rd, rs1, rs2 } => {
                let (a, b) = (self.load_reg(rs1), self.load_reg(rs2));
                let v = self.b.ins().band(a, b);
                self.store_reg(rd, v);
            }
            Op::Sll { rd, rs1, rs2 } | Op::Srl { rd, rs1, rs2 } | Op::Sra { rd, rs1, rs2 } => {
                let amount = self.load_reg(rs2);
                let masked = self.b.ins().band_imm(amount, 0x1f);
                let a = self.load_reg(rs1);
                let v = match op {
                    Op::Sll { .. } => self.b.ins().ishl(a, masked),
                    Op::Srl { .. } => self.b.ins().ushr(a, masked),
                    _ => self.b.ins().sshr(a, masked),
                };
                self.store_reg(rd, v);
            }
            Op::Slt { rd, rs1, rs2 } => {
                let (a, b) = (self.load_reg(rs1), self.load_reg(rs2));
                let flag = self.b.ins().icmp(IntCC::SignedLessThan, a, b);
                let v = self.bool_to_reg(flag);
                self.store_reg(rd, v);
            }
            Op::Sltu { rd, rs1, rs2 } => {
                let (a, b) = (self.load_reg(rs1), self.load_reg(rs2));
                let flag = self.b.ins().icmp(IntCC::UnsignedLessThan, a, b);
                let v = self.bool_to_reg(flag);
                self.store_reg(rd, v);
            }
            Op::Mul { rd, rs1, rs2 } => {
                let (a, b) = (self.load_reg(rs1), self.load_reg(rs2));
                let v = self.b.ins().imul(a, b);
                self.store_reg(rd, v);
            }
            Op::Mulh { rd, rs1, rs2 } | Op::Mulhsu { rd, rs1, rs2 } | Op::Mulhu { rd, rs1, rs2 } => {
                let a = self.load_reg(rs1);
                let b = self.load_reg(rs2);
                let a64 = if matches!(op, Op::Mulhu { .. }) {
                    self.b.ins().uextend(types::I64, a)
                } else {
                    self.b.ins().sextend(types::I64, a)
                };
                let b64 = if matches!(op, Op::Mulh { .. }) {
                    self.b.ins().sextend(types::I64, b)
                } else {
                    self.b.ins().uextend(types::I64, b)
                };
                let prod = self.b.ins().imul(a64, b64);
                let hi = self.b.ins().ushr_imm(prod, 32);
                let v = self.b.ins().ireduce(types::I32, hi);
                self.store_reg(rd, v);
            }
            // Guest-defined divide semantics: the divisor is substituted
            // before the host divide so it can never trap, then the result
            // is selected from the architectural cases.
            Op::Div { rd, rs1, rs2 } | Op::Rem { rd, rs1, rs2 } => {
                let a = self.load_reg(rs1);
                let b = self.load_reg(rs2);
                let is_zero = self.b.ins().icmp_imm(IntCC::Equal, b, 0);
                let is_min = self
                    .b
                    .ins()
                    .icmp_imm(IntCC::Equal, a, i64::from(i32::MIN));
                let is_m1 = self.b.ins().icmp_imm(IntCC::Equal, b, -1);
                let overflow = self.b.ins().band(is_min, is_m1);
                let trapping = self.b.ins().bor(is_zero, overflow);
                let one = self.const_i32(1);
                let safe = self.b.ins().select(trapping, one, b);
                let v = if matches!(op, Op::Div { .. }) {
                    let q = self.b.ins().sdiv(a, safe);
                    let q = self.b.ins().select(overflow, a, q);
                    let neg1 = self.const_i32(-1);
                    self.b.ins().select(is_zero, neg1, q)
                } else {
                    let r = self.b.ins().srem(a, safe);
                    let zero = self.const_i32(0);
                    let r = self.b.ins().select(overflow, zero, r);
                    self.b.ins().select(is_zero, a, r)
                };
                self.store_reg(rd, v);
            }
            Op::Divu { rd, rs1, rs2 } | Op::Remu { rd, rs1, rs2 } => {
                let a = self.load_reg(rs1);
                let b = self.load_reg(rs2);
                let is_zero = self.b.ins().icmp_imm(IntCC::Equal, b, 0);
                let one = self.const_i32(1);
                let safe = self.b.ins().select(is_zero, one, b);
                let v = if matches!(op, Op::Divu { .. }) {
                    let q = self.b.ins().udiv(a, safe);
                    let neg1 = self.const_i32(-1);
                    self.b.ins().select(is_zero, neg1, q)
                } else {
                    let r = self.b.ins().urem(a, safe);
                    self.b.ins().select(is_zero, a, r)
                };
                self.store_reg(rd, v);
            }
            Op::Load { width, signed, rd, rs1, imm } => {
                let base = self.load_reg(rs1);
                let off = self.const_i32(imm);
                let addr = self.b.ins().iadd(base, off);
                let (user, fptr) = self.cb_fn(match width {
                    MemWidth::Byte => layout::cb_read_b(),
                    MemWidth::Half => layout::cb_read_s(),
                    MemWidth::Word => layout::cb_read_w(),
                });
                let call = self
                    .b
                    .ins()
                    .call_indirect(self.sig_read, fptr, &[user, addr]);
                let ret = self.b.inst_results(call)[0];
                let v = match (width, signed) {
                    (MemWidth::Byte, true) => {
                        let narrow = self.b.ins().ireduce(types::I8, ret);
                        self.b.ins().sextend(types::I32, narrow)
                    }
                    (MemWidth::Half, true) => {
                        let narrow = self.b.ins().ireduce(types::I16, ret);
                        self.b.ins().sextend(types::I32, narrow)
                    }
                    _ => ret,
                };
                self.store_reg(rd, v);
            }
            Op::Store { width, rs1, rs2, imm } => {
                let base = self.load_reg(rs1);
                let off = self.const_i32(imm);
                let addr = self.b.ins().iadd(base, off);
                let value = self.load_reg(rs2);
                let (user, fptr) = self.cb_fn(match width {
                    MemWidth::Byte => layout::cb_write_b(),
                    MemWidth::Half => layout::cb_write_s(),
                    MemWidth::Word => layout::cb_write_w(),
                });
                self.b
                    .ins()
                    .call_indirect(self.sig_write, fptr, &[user, addr, value]);
            }
            Op::Jump { rd, link, target } => {
                let link_v = self.const_u32(link);
                self.store_reg(rd, link_v);
                self.goto(target);
                return true;
            }
            Op::JumpReg { rd, rs1, imm, link } => {
                let base = self.load_reg(rs1);
                let off = self.const_i32(imm);
                let sum = self.b.ins().iadd(base, off);
                let target = self.b.ins().band_imm(sum, -2);
                let link_v = self.const_u32(link);
                self.store_reg(rd, link_v);
                self.b.ins().jump(self.exit_block, &[target]);
                return true;
            }
            Op::Branch { cond, rs1, rs2, taken, fallthrough } => {
                let (a, b) = (self.load_reg(rs1), self.load_reg(rs2));
                let cc = match cond {
                    Cond::Eq => IntCC::Equal,
                    Cond::Ne => IntCC::NotEqual,
                    Cond::Lt => IntCC::SignedLessThan,
                    Cond::Ge => IntCC::SignedGreaterThanOrEqual,
                    Cond::Ltu => IntCC::UnsignedLessThan,
                    Cond::Geu => IntCC::UnsignedGreaterThanOrEqual,
                };
                let flag = self.b.ins().icmp(cc, a, b);
                let taken_const = self.const_u32(taken);
                let fall_const = self.const_u32(fallthrough);
                let (tb, ta): (Block, Vec<Value>) = match self.heads.get(&taken) {
                    Some(&h) => (h, vec![]),
                    None => (self.exit_block, vec![taken_const]),
                };
                let (fb, fa): (Block, Vec<Value>) = match self.heads.get(&fallthrough) {
                    Some(&h) => (h, vec![]),
                    None => (self.exit_block, vec![fall_const]),
                };
                self.b.ins().brif(flag, tb, &ta, fb, &fa);
                return true;
            }
            Op::EnvCall { pc } | Op::Break { pc } => {
                let pc_v = self.const_u32(pc);
                self.b.ins().store(self.flags, pc_v, self.regs, layout::pc());
                let off = if matches!(op, Op::EnvCall { .. }) {
                    layout::cb_ecall()
                } else {
                    layout::cb_ebreak()
                };
                let (user, fptr) = self.cb_fn(off);
                self.b.ins().call_indirect(self.sig_env, fptr, &[user]);
                // The callback owns the PC from here; reload it and leave.
                let new_pc =
                    self.b
                        .ins()
                        .load(types::I32, self.flags, self.regs, layout::pc());
                self.b.ins().jump(self.exit_block, &[new_pc]);
                return true;
            }
        }
        false
    }
}
