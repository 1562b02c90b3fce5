//! Method lowering engine
//!
//! Translates one method body from its evaluation-stack form into SSA. The
//! operand stack is simulated at compile time: every IL instruction pops its
//! operands as typed [`StackValue`]s and pushes results, so no runtime stack
//! exists in the output. Stack contents flowing across block boundaries are
//! joined with phis created by the first predecessor reaching the block.
//!
//! The lowering of each instruction family lives in its own file:
//!
//! - `stack`: stack values and representation changes
//! - `blocks`: block discovery and joins
//! - `arith`: arithmetic, comparisons, conversions and branches
//! - `memory`: arguments, locals, fields, statics, indirect access and arrays
//! - `objects`: allocation, boxing, casts, tokens and strings
//! - `calls`: direct, virtual, interface and indirect calls
//! - `exception`: protected regions, landing pads and handler dispatch

mod arith;
mod blocks;
mod calls;
mod exception;
mod memory;
mod objects;
mod stack;

use ilaot_metadata::{FlowControl, Instruction, InstructionAt, MethodBody, MethodImpl, MethodRef, Offset, TypeRef};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, instrument};

use crate::abi::{AbiClass, Signature};
use crate::class::rtti::{RTTI_INITIALIZED, RTTI_VTABLE};
use crate::compiler::Compiler;
use crate::error::{CompileError, CompileResult};
use crate::function::{FunctionId, FunctionKind};
use crate::ir::{BlockId, Callee, FunctionBuilder, IntPredicate, IrType, Terminator, Value};
use crate::layout::{Completeness, TypeId};
use crate::resolver::{resolve_strict, GenericContext};
use crate::runtime::RuntimeFn;

use self::blocks::JoinSlot;
use self::exception::Regions;
pub(crate) use self::stack::StackValue;

/// How control leaves the instruction just lowered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Falls through into the next instruction
    Implicit,
    /// Already branched to every successor
    Explicit,
    /// Does not continue (return, throw, unconditional branch)
    None,
}

/// Prefixes pending for the next instruction
#[derive(Debug, Clone, Default)]
struct Prefixes {
    constrained: Option<TypeRef>,
    volatile: bool,
    unaligned: Option<u8>,
    tail: bool,
}

/// Stack slot backing an argument or local
#[derive(Debug, Clone, Copy)]
struct Slot {
    ptr: Value,
    ty: TypeId,
}

pub(crate) struct MethodLowerer<'c, 'a> {
    cx: &'c mut Compiler<'a>,
    function: FunctionId,
    method: MethodRef,
    symbol: String,
    body: &'a MethodBody,
    sig: Signature,
    b: FunctionBuilder,
    stack: Vec<StackValue>,
    args: Vec<Slot>,
    locals: Vec<Slot>,
    /// Block starting at each discovered IL offset
    blocks: FxHashMap<Offset, BlockId>,
    /// Phis receiving the stack at a block entry, fixed by the first predecessor
    joins: FxHashMap<Offset, Vec<JoinSlot>>,
    /// Blocks whose instructions have been lowered
    visited: FxHashSet<Offset>,
    regions: Regions,
    flow: Flow,
    prefixes: Prefixes,
    offset: Offset,
    next_offset: Offset,
}

impl<'a> Compiler<'a> {
    /// Lower the body of a queued function
    pub(crate) fn lower_function(&mut self, function: FunctionId) -> CompileResult<()> {
        match self.function_info(function).kind {
            FunctionKind::Il => MethodLowerer::new(self, function)?.run(),
            FunctionKind::PInvoke => self.lower_native_stub(function),
            FunctionKind::Delegate => self.lower_delegate_member(function),
            _ => Ok(()),
        }
    }

    /// Body of a native method: make sure the class bound its entry point,
    /// then call through the descriptor slot
    fn lower_native_stub(&mut self, function: FunctionId) -> CompileResult<()> {
        let owner = self.function_info(function).owner;
        self.ensure(owner, Completeness::VTableEmitted)?;
        let class = self.class_of(owner)?;
        let info = self.function_info(function);
        let slot = info
            .slot
            .ok_or_else(|| CompileError::malformed(format!("native method {} has no slot", info.symbol)))?;
        let func = info
            .func
            .ok_or_else(|| CompileError::malformed(format!("native method {} is not declared", info.symbol)))?;
        let sig = info.sig.ir.clone();
        let header = self.rtti_types().header;
        let rtti = Value::Global(self.class_info(class).rtti);

        let mut b = FunctionBuilder::new(&sig.params);
        if let Some(init) = self.class_init_fn(class) {
            let call = b.create_block("init");
            let ready = b.create_block("ready");
            let flag = b.struct_gep(header, rtti, &[RTTI_INITIALIZED]);
            let state = b.load(IrType::I8, flag);
            let pending = b.icmp(IntPredicate::Eq, state, Value::i8(0));
            b.cond_br(pending, call, ready);
            b.switch_to_block(call);
            b.call(Callee::Direct(init), Vec::new(), IrType::Void);
            b.br(ready);
            b.switch_to_block(ready);
        }
        let slot_ptr = b.gep(header, rtti, vec![Value::i32(0), Value::i32(RTTI_VTABLE as i32), Value::i32(slot as i32)]);
        let target = b.load(IrType::Ptr, slot_ptr);
        let args = (0..sig.params.len()).map(|i| b.param(i)).collect();
        let result = b.call(Callee::Indirect { ptr: target, sig: sig.clone() }, args, sig.ret);
        b.ret(result);

        self.module.set_body(func, b.finish());
        debug!(function = %self.function_info(function).symbol, slot, "emitted native stub");
        Ok(())
    }
}

impl<'c, 'a> MethodLowerer<'c, 'a> {
    fn new(cx: &'c mut Compiler<'a>, function: FunctionId) -> CompileResult<Self> {
        let asm = cx.asm;
        let info = cx.function_info(function);
        let method = info.method.clone();
        let symbol = info.symbol.clone();
        let sig = info.sig.clone();
        let def = asm.method(method.method);
        let body = match (&def.implementation, &def.body) {
            (MethodImpl::Il, Some(body)) | (MethodImpl::Runtime, Some(body)) => body,
            _ => return Err(CompileError::malformed(format!("{} has no body", symbol))),
        };
        let b = FunctionBuilder::new(&sig.ir.params);
        Ok(MethodLowerer {
            cx,
            function,
            method,
            symbol,
            body,
            sig,
            b,
            stack: Vec::new(),
            args: Vec::new(),
            locals: Vec::new(),
            blocks: FxHashMap::default(),
            joins: FxHashMap::default(),
            visited: FxHashSet::default(),
            regions: Regions::default(),
            flow: Flow::None,
            prefixes: Prefixes::default(),
            offset: 0,
            next_offset: 0,
        })
    }

    #[instrument(level = "debug", skip_all, fields(method = %self.symbol))]
    fn run(mut self) -> CompileResult<()> {
        let body = self.body;
        if body.instructions.is_empty() {
            return Err(CompileError::malformed(format!("{} has an empty body", self.symbol)));
        }
        self.discover_blocks()?;
        self.prologue()?;
        let first = self.block_at(0)?;
        self.b.br(first);

        for (index, at) in body.instructions.iter().enumerate() {
            self.offset = at.offset;
            self.next_offset = body.next_offset(index);
            if let Err(e) = self.lower_at(at) {
                return Err(CompileError::Lowering {
                    method: self.symbol.clone(),
                    offset: at.offset,
                    instruction: at.instr.mnemonic().to_string(),
                    source: Box::new(e),
                });
            }
        }
        self.finish()
    }

    fn lower_at(&mut self, at: &InstructionAt) -> CompileResult<()> {
        if let Some(&block) = self.blocks.get(&at.offset) {
            if self.flow == Flow::Implicit && !self.b.is_terminated() {
                let target = self.merge_into(at.offset)?;
                self.b.br(target);
            }
            self.b.switch_to_block(block);
            self.enter_block(at.offset)?;
        }
        self.update_regions()?;
        self.flow = Flow::Implicit;
        self.lower_instruction(&at.instr)?;
        if at.instr.flow_control() != FlowControl::Meta {
            self.prefixes = Prefixes::default();
        }
        Ok(())
    }

    fn lower_instruction(&mut self, instr: &Instruction) -> CompileResult<()> {
        use Instruction as I;
        match instr {
            I::Nop | I::Break | I::Readonly => {}
            I::Pop => {
                self.pop()?;
            }
            I::Dup => {
                let top = self.peek()?;
                self.stack.push(top);
            }
            I::Ret => self.lower_ret()?,

            I::LdcI4(v) => self.push_int32(Value::i32(*v))?,
            I::LdcI8(v) => self.push_prim(ilaot_metadata::PrimitiveType::I8, Value::i64(*v))?,
            I::LdcR4(v) => self.push_prim(ilaot_metadata::PrimitiveType::R8, Value::Float { ty: IrType::F64, value: *v as f64 })?,
            I::LdcR8(v) => self.push_prim(ilaot_metadata::PrimitiveType::R8, Value::Float { ty: IrType::F64, value: *v })?,
            I::Ldnull => {
                let object = self.object_type()?;
                self.push(object, Value::Null);
            }
            I::Ldstr(text) => self.lower_ldstr(text)?,

            I::Ldarg(i) => self.lower_ldarg(*i)?,
            I::Ldarga(i) => self.lower_ldarga(*i)?,
            I::Starg(i) => self.lower_starg(*i)?,
            I::Ldloc(i) => self.lower_ldloc(*i)?,
            I::Ldloca(i) => self.lower_ldloca(*i)?,
            I::Stloc(i) => self.lower_stloc(*i)?,

            I::Ldfld(f) => self.lower_ldfld(f)?,
            I::Ldflda(f) => self.lower_ldflda(f)?,
            I::Stfld(f) => self.lower_stfld(f)?,
            I::Ldsfld(f) => self.lower_ldsfld(f)?,
            I::Ldsflda(f) => self.lower_ldsflda(f)?,
            I::Stsfld(f) => self.lower_stsfld(f)?,

            I::Ldind(kind) => self.lower_ldind(*kind)?,
            I::Stind(kind) => self.lower_stind(*kind)?,
            I::Ldobj(t) => self.lower_ldobj(t)?,
            I::Stobj(t) => self.lower_stobj(t)?,
            I::Cpobj(t) => self.lower_cpobj(t)?,
            I::Initobj(t) => self.lower_initobj(t)?,
            I::Sizeof(t) => self.lower_sizeof(t)?,
            I::Localloc => self.lower_localloc()?,

            I::Call(m) => self.lower_call(m, false)?,
            I::Callvirt(m) => self.lower_call(m, true)?,
            I::Calli(sig) => self.lower_calli(sig)?,
            I::Newobj(m) => self.lower_newobj(m)?,
            I::Ldftn(m) => self.lower_ldftn(m)?,
            I::Ldvirtftn(m) => self.lower_ldvirtftn(m)?,

            I::Constrained(t) => self.prefixes.constrained = Some(t.clone()),
            I::Volatile => self.prefixes.volatile = true,
            I::Unaligned(align) => self.prefixes.unaligned = Some(*align),
            I::Tail => self.prefixes.tail = true,

            I::Box(t) => self.lower_box(t)?,
            I::Unbox(t) => self.lower_unbox(t)?,
            I::UnboxAny(t) => self.lower_unbox_any(t)?,
            I::Castclass(t) => self.lower_type_test(t, true)?,
            I::Isinst(t) => self.lower_type_test(t, false)?,
            I::Ldtoken(t) => self.lower_ldtoken(t)?,

            I::Newarr(t) => self.lower_newarr(t)?,
            I::Ldlen => self.lower_ldlen()?,
            I::Ldelema(t) => self.lower_ldelema(t)?,
            I::Ldelem(kind) => self.lower_ldelem(kind)?,
            I::Stelem(kind) => self.lower_stelem(kind)?,

            I::Br(target) => {
                let block = self.merge_into(*target)?;
                self.b.br(block);
                self.flow = Flow::None;
            }
            I::Brtrue(target) => self.lower_truth_branch(*target, true)?,
            I::Brfalse(target) => self.lower_truth_branch(*target, false)?,
            I::Branch { cond, target } => self.lower_compare_branch(*cond, *target)?,
            I::Switch(targets) => self.lower_switch(targets)?,

            I::Compare(op) => self.lower_compare(*op)?,
            I::Binary { op, overflow } => self.lower_binary(*op, *overflow)?,
            I::Unary(op) => self.lower_unary(*op)?,
            I::Conv { target, overflow } => self.lower_conv(*target, *overflow)?,

            I::Throw => self.lower_throw()?,
            I::Rethrow => self.lower_rethrow()?,
            I::Leave(target) => self.lower_leave(*target)?,
            I::Endfinally => self.lower_endfinally()?,
        }
        Ok(())
    }

    /// Argument and local slots, plus the exception bookkeeping slots
    fn prologue(&mut self) -> CompileResult<()> {
        let sig = self.sig.clone();
        if let Some(this) = sig.this {
            let ty = if self.cx.type_info(this).is_value_type { self.by_ref(this)? } else { this };
            let slot = self.b.alloca(IrType::Ptr);
            let incoming = self.b.param(sig.this_index());
            self.b.store(incoming, slot);
            self.args.push(Slot { ptr: slot, ty });
        }
        for (i, param) in sig.params.iter().enumerate() {
            let incoming = self.b.param(sig.param_index(i));
            let ptr = match param.class {
                AbiClass::Indirect => incoming,
                AbiClass::Direct | AbiClass::Coerced(_) => {
                    let shape = self.cx.type_info(param.ty).value;
                    let slot = self.b.alloca(shape);
                    self.b.store(incoming, slot);
                    slot
                }
            };
            self.args.push(Slot { ptr, ty: param.ty });
        }

        let body = self.body;
        for local in &body.locals {
            let ty = self.resolve_type(local)?;
            let shape = self.cx.type_info(ty).value;
            let ptr = self.b.alloca(shape);
            if body.init_locals {
                self.zero_fill(ptr, ty)?;
            }
            self.locals.push(Slot { ptr, ty });
        }

        if !body.exception_clauses.is_empty() {
            self.init_exception_slots();
        }
        Ok(())
    }

    fn lower_ret(&mut self) -> CompileResult<()> {
        match self.sig.ret {
            None => self.b.ret(None),
            Some(ret) => {
                let value = self.pop()?;
                match ret.class {
                    AbiClass::Direct => {
                        let v = self.from_stack(value, ret.ty)?;
                        self.b.ret(Some(v));
                    }
                    AbiClass::Indirect => {
                        let sret = self.b.param(0);
                        self.store_value(sret, value, ret.ty)?;
                        self.b.ret(None);
                    }
                    AbiClass::Coerced(carrier) => {
                        let shape = self.cx.type_info(ret.ty).value;
                        let tmp = self.b.alloca(shape);
                        self.store_value(tmp, value, ret.ty)?;
                        let v = self.b.load(carrier, tmp);
                        self.b.ret(Some(v));
                    }
                }
            }
        }
        self.flow = Flow::None;
        Ok(())
    }

    fn finish(mut self) -> CompileResult<()> {
        self.close_finally_switches()?;
        let open: Vec<BlockId> =
            self.b.body().blocks.iter().filter(|blk| blk.terminator.is_none()).map(|blk| blk.id).collect();
        for id in open {
            self.b.body_mut().block_mut(id).terminator = Terminator::Unreachable;
        }

        let func = self
            .cx
            .function_info(self.function)
            .func
            .ok_or_else(|| CompileError::malformed(format!("{} is not declared", self.symbol)))?;
        let landing_pads = self.regions.landing_pads;
        let blocks = self.b.body().blocks.len();
        let body = self.b.finish();
        self.cx.module.set_body(func, body);
        if landing_pads > 0 {
            let personality = self.cx.runtime_fn(RuntimeFn::Personality);
            self.cx.module.function_mut(func).personality = Some(personality);
        }
        debug!(blocks, landing_pads, "lowered method");
        Ok(())
    }

    // ===== Type helpers =====

    /// Close a type reference in this method's generic context
    fn resolve_type(&mut self, ty: &TypeRef) -> CompileResult<TypeId> {
        let ctx = GenericContext::for_method(&self.method);
        let closed = resolve_strict(&ctx, ty, self.cx.asm)?;
        self.cx.type_of(&closed, Completeness::StackComplete)
    }

    fn resolve_method(&self, method: &MethodRef) -> MethodRef {
        let ctx = GenericContext::for_method(&self.method);
        crate::resolver::resolve_method(&ctx, method)
    }

    fn by_ref(&mut self, ty: TypeId) -> CompileResult<TypeId> {
        let inner = self.cx.type_info(ty).ty.clone();
        self.cx.type_of(&TypeRef::by_ref(inner), Completeness::StackComplete)
    }

    fn object_type(&mut self) -> CompileResult<TypeId> {
        let object = self.cx.asm.well_known(ilaot_metadata::WellKnown::Object)?;
        self.cx.type_of(&TypeRef::Named(object), Completeness::Opaque)
    }

    fn iptr(&self) -> IrType {
        self.cx.target.int_ptr_type()
    }

    fn iptr_const(&self, value: u64) -> Value {
        Value::int(self.iptr(), value as i64)
    }

    fn block_name(offset: Offset) -> String {
        format!("IL_{:04x}", offset)
    }
}

#[cfg(test)]
mod tests;
