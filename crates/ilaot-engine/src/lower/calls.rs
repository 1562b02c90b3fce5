//! Calls
//!
//! Every call site marshals its operands with the callee's classified
//! signature: indirect values travel through caller-owned buffers, coerced
//! values through an integer carrier, and an indirect return adds a leading
//! buffer argument.

use ilaot_metadata::{CallSiteSig, MethodRef};
use tracing::trace;

use super::{MethodLowerer, StackValue};
use crate::abi::{AbiClass, AbiParam, Signature};
use crate::class::imt::bucket_of;
use crate::class::rtti::{RTTI_IMT, RTTI_VTABLE};
use crate::error::{CompileError, CompileResult};
use crate::function::FunctionId;
use crate::ir::{Callee, IrType, Value};
use crate::layout::{Completeness, StackCategory, TypeId};
use crate::resolver::GenericContext;
use crate::runtime::RuntimeFn;

impl<'c, 'a> MethodLowerer<'c, 'a> {
    /// Plain call, or an invoke unwinding to the current landing pad
    pub(super) fn emit_call(&mut self, callee: Callee, args: Vec<Value>, ret: IrType) -> Option<Value> {
        self.emit_call_with(callee, args, ret, false)
    }

    /// Tail calls are only marked outside protected regions
    fn emit_call_with(&mut self, callee: Callee, args: Vec<Value>, ret: IrType, tail: bool) -> Option<Value> {
        match self.regions.landing {
            Some(pad) => {
                let cont = self.b.create_block("invoke.cont");
                self.b.invoke(callee, args, ret, cont, pad)
            }
            None => self.b.call_with(callee, args, ret, tail),
        }
    }

    /// Marshal operands, call, and push the unmarshalled result
    pub(super) fn emit_abi_call(
        &mut self,
        sig: &Signature,
        callee: Callee,
        this: Option<Value>,
        args: Vec<StackValue>,
    ) -> CompileResult<()> {
        if args.len() != sig.params.len() {
            return Err(CompileError::malformed(format!(
                "call passes {} arguments to a signature with {}",
                args.len(),
                sig.params.len()
            )));
        }
        let mut values = Vec::with_capacity(sig.ir.params.len());
        let sret = match sig.ret {
            Some(AbiParam { ty, class: AbiClass::Indirect }) => {
                let shape = self.cx.type_info(ty).value;
                let buffer = self.b.alloca(shape);
                values.push(buffer);
                Some(buffer)
            }
            _ => None,
        };
        if let Some(this) = this {
            values.push(this);
        }
        for (param, arg) in sig.params.iter().zip(args) {
            let v = self.marshal_arg(*param, arg)?;
            values.push(v);
        }

        // a tail call must not see this frame's buffers
        let tail = self.prefixes.tail
            && sret.is_none()
            && sig.params.iter().all(|p| p.class == AbiClass::Direct);
        let result = self.emit_call_with(callee, values, sig.ir.ret, tail);
        let Some(ret) = sig.ret else { return Ok(()) };
        let shape = self.cx.type_info(ret.ty).value;
        let value = match (ret.class, sret, result) {
            (AbiClass::Indirect, Some(buffer), _) => self.b.load(shape, buffer),
            (AbiClass::Direct, _, Some(v)) => v,
            (AbiClass::Coerced(_), _, Some(carrier)) => {
                let tmp = self.b.alloca(shape);
                self.b.store(carrier, tmp);
                self.b.load(shape, tmp)
            }
            _ => return Err(CompileError::malformed("call produced no value for a non-void signature")),
        };
        self.push_stored(ret.ty, value);
        Ok(())
    }

    fn marshal_arg(&mut self, param: AbiParam, arg: StackValue) -> CompileResult<Value> {
        match param.class {
            AbiClass::Direct => self.from_stack(arg, param.ty),
            AbiClass::Indirect => {
                let shape = self.cx.type_info(param.ty).value;
                let buffer = self.b.alloca(shape);
                let v = self.from_stack(arg, param.ty)?;
                self.b.store(v, buffer);
                Ok(buffer)
            }
            AbiClass::Coerced(carrier) => {
                let shape = self.cx.type_info(param.ty).value;
                let tmp = self.b.alloca(shape);
                let v = self.from_stack(arg, param.ty)?;
                self.b.store(v, tmp);
                Ok(self.b.load(carrier, tmp))
            }
        }
    }

    fn direct_callee(&self, function: FunctionId) -> CompileResult<Callee> {
        let info = self.cx.function_info(function);
        info.func
            .map(Callee::Direct)
            .ok_or_else(|| CompileError::malformed(format!("direct call to abstract {}", info.symbol)))
    }

    /// Entry point of `function` selected by the receiver's runtime type
    fn virtual_callee(&mut self, function: FunctionId, receiver: Value) -> CompileResult<Callee> {
        let owner = self.cx.function_info(function).owner;
        let header = self.cx.rtti_types().header;
        let rtti = self.b.load(IrType::Ptr, receiver);

        if self.cx.type_info(owner).is_interface {
            let method_id = self.cx.function_info(function).method_id;
            let bucket = bucket_of(method_id);
            let entry_ptr =
                self.b.gep(header, rtti, vec![Value::i32(0), Value::i32(RTTI_IMT as i32), Value::i32(bucket as i32)]);
            let entry = self.b.load(IrType::Ptr, entry_ptr);
            let key = self.cx.interface_key(function);
            let resolve = self.cx.runtime_fn(RuntimeFn::ResolveInterfaceCall);
            let target = self
                .emit_call(Callee::Direct(resolve), vec![Value::Global(key), entry], IrType::Ptr)
                .ok_or_else(|| CompileError::malformed("interface resolution returned no entry point"))?;
            trace!(function = %self.cx.function_info(function).symbol, bucket, "interface dispatch");
            let sig = self.cx.function_info(function).sig.ir.clone();
            return Ok(Callee::Indirect { ptr: target, sig });
        }

        self.cx.ensure(owner, Completeness::VTableEmitted)?;
        let info = self.cx.function_info(function);
        let slot = info
            .slot
            .ok_or_else(|| CompileError::malformed(format!("{} has no virtual table slot", info.symbol)))?;
        let sig = info.sig.ir.clone();
        let slot_ptr =
            self.b.gep(header, rtti, vec![Value::i32(0), Value::i32(RTTI_VTABLE as i32), Value::i32(slot as i32)]);
        let target = self.b.load(IrType::Ptr, slot_ptr);
        Ok(Callee::Indirect { ptr: target, sig })
    }

    /// `call` and `callvirt`
    pub(super) fn lower_call(&mut self, target: &MethodRef, virtual_call: bool) -> CompileResult<()> {
        let method = self.resolve_method(target);
        if let Some(constrained) = self.prefixes.constrained.take() {
            let ty = self.resolve_type(&constrained)?;
            return self.lower_constrained_call(ty, &method);
        }
        let asm = self.cx.asm;
        let def = asm.method(method.method);
        let function = self.cx.function_of(&method)?;
        let sig = self.cx.function_info(function).sig.clone();

        let args = self.pop_n(def.params.len())?;
        let this = if def.has_this() { Some(self.pop()?) } else { None };
        if def.is_static {
            let class = self.cx.class_for(&method.declaring)?;
            self.guard_class_init(class)?;
        }

        let receiver = this.map(|t| self.ptr_value(t));
        let callee = match receiver {
            Some(r) if virtual_call && def.is_virtual => {
                if !method.generic_args.is_empty() {
                    return Err(CompileError::unsupported("virtual call to a generic method"));
                }
                self.virtual_callee(function, r)?
            }
            _ => self.direct_callee(function)?,
        };
        self.emit_abi_call(&sig, callee, receiver, args)
    }

    /// `constrained. T callvirt M`: call T's own implementation on the
    /// address, or box and dispatch normally
    fn lower_constrained_call(&mut self, ty: TypeId, method: &MethodRef) -> CompileResult<()> {
        let asm = self.cx.asm;
        let def = asm.method(method.method);
        let declared = self.cx.function_of(method)?;
        let args = self.pop_n(def.params.len())?;
        let address = self.pop()?;
        let address = self.ptr_value(address);

        let receiver = if self.cx.type_info(ty).is_value_type {
            if let Some(own) = self.value_type_implementation(ty, declared)? {
                let sig = self.cx.function_info(own).sig.clone();
                let callee = self.direct_callee(own)?;
                return self.emit_abi_call(&sig, callee, Some(address), args);
            }
            let loaded = self.load_value(address, ty)?;
            let value = self.to_stack(ty, loaded);
            let category = self.cx.type_info(ty).category;
            self.box_value(ty, StackValue { category, ty, value })?
        } else {
            self.b.load(IrType::Ptr, address)
        };

        let sig = self.cx.function_info(declared).sig.clone();
        let callee = if def.is_virtual { self.virtual_callee(declared, receiver)? } else { self.direct_callee(declared)? };
        self.emit_abi_call(&sig, callee, Some(receiver), args)
    }

    /// Method declared on value type `ty` overriding or implementing `declared`
    fn value_type_implementation(
        &mut self,
        ty: TypeId,
        declared: FunctionId,
    ) -> CompileResult<Option<FunctionId>> {
        let asm = self.cx.asm;
        let Some(def) = self.cx.type_info(ty).def else { return Ok(None) };
        let owner = self.cx.type_info(ty).ty.clone();
        let name = asm.method(self.cx.function_info(declared).def()).name.clone();
        let declaring_owner = self.cx.function_info(declared).owner;
        let qualified = self.cx.type_info(declaring_owner).def.map(|d| format!("{}.{}", asm.type_full_name(d), name));
        for &m in &asm.type_def(def).methods {
            let d = asm.method(m);
            let matches_name = d.name == name || qualified.as_deref() == Some(d.name.as_str());
            if d.is_static || !d.generic_params.is_empty() || !matches_name {
                continue;
            }
            let candidate = self.cx.function_of(&MethodRef::new(owner.clone(), m))?;
            if self.cx.same_signature(candidate, declared) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// `calli`: the target address is on top of the arguments
    pub(super) fn lower_calli(&mut self, site: &CallSiteSig) -> CompileResult<()> {
        let target = self.pop()?;
        let target = self.ptr_value(target);
        let ctx = GenericContext::for_method(&self.method);
        let sig = self.cx.call_site_signature(&ctx, site)?;
        let args = self.pop_n(site.params.len())?;
        let this = if site.has_this {
            let t = self.pop()?;
            Some(self.ptr_value(t))
        } else {
            None
        };
        let callee = Callee::Indirect { ptr: target, sig: sig.ir.clone() };
        self.emit_abi_call(&sig, callee, this, args)
    }

    pub(super) fn lower_ldftn(&mut self, target: &MethodRef) -> CompileResult<()> {
        let method = self.resolve_method(target);
        let function = self.cx.function_of(&method)?;
        let Callee::Direct(func) = self.direct_callee(function)? else {
            return Err(CompileError::malformed("function address of an indirect target"));
        };
        self.push_prim(ilaot_metadata::PrimitiveType::I, Value::Function(func))
    }

    pub(super) fn lower_ldvirtftn(&mut self, target: &MethodRef) -> CompileResult<()> {
        let method = self.resolve_method(target);
        let function = self.cx.function_of(&method)?;
        let object = self.pop()?;
        if object.category != StackCategory::Object {
            return Err(CompileError::malformed("ldvirtftn needs an object receiver"));
        }
        let callee = if self.cx.asm.method(method.method).is_virtual {
            self.virtual_callee(function, object.value)?
        } else {
            self.direct_callee(function)?
        };
        let address = match callee {
            Callee::Indirect { ptr, .. } => ptr,
            Callee::Direct(func) => Value::Function(func),
        };
        self.push_prim(ilaot_metadata::PrimitiveType::I, address)
    }
}
