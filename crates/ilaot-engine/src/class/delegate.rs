//! Delegate method bodies
//!
//! Delegate types declare their constructor and `Invoke` without a body.
//! The constructor records the bound target and the code pointer in the
//! fields inherited from `System.Delegate`; `Invoke` calls through the code
//! pointer, passing the target as receiver when one is bound.

use ilaot_metadata::WellKnown;
use tracing::debug;

use crate::compiler::Compiler;
use crate::error::{CompileError, CompileResult};
use crate::function::FunctionId;
use crate::ir::{Callee, FuncSig, FunctionBuilder, IntPredicate, IrType, Value};
use crate::layout::{FieldLocator, TypeId};

impl<'a> Compiler<'a> {
    pub(crate) fn lower_delegate_member(&mut self, function: FunctionId) -> CompileResult<()> {
        let info = self.function_info(function);
        let owner = info.owner;
        let is_ctor = self.asm.method(info.def()).name == ".ctor";
        let target_path = self.delegate_field_path(owner, "_target")?;
        let method_path = self.delegate_field_path(owner, "_methodPtr")?;

        let info = self.function_info(function);
        let func = info
            .func
            .ok_or_else(|| CompileError::malformed(format!("delegate method {} is not declared", info.symbol)))?;
        let sig = info.sig.clone();
        let object = self.type_info(owner).object;
        let iptr = self.target.int_ptr_type();

        let mut b = FunctionBuilder::new(&sig.ir.params);
        let this = b.param(sig.this_index());
        let target_slot = b.struct_gep(object, this, &target_path);
        let method_slot = b.struct_gep(object, this, &method_path);
        if is_ctor {
            if sig.params.len() != 2 {
                return Err(CompileError::malformed(format!("delegate constructor {} takes (object, IntPtr)", info.symbol)));
            }
            let target = b.param(sig.param_index(0));
            let method = b.param(sig.param_index(1));
            b.store(target, target_slot);
            b.store(method, method_slot);
            b.ret(None);
        } else {
            let target = b.load(IrType::Ptr, target_slot);
            let code = b.load(iptr, method_slot);
            let code = b.int_cast(code, IrType::Ptr, false);
            let unbound = b.create_block("unbound");
            let bound = b.create_block("bound");
            let is_null = b.icmp(IntPredicate::Eq, target, Value::Null);
            b.cond_br(is_null, unbound, bound);

            // static target: the delegate's own parameters, no receiver
            b.switch_to_block(unbound);
            let this_index = sig.this_index();
            let mut params = sig.ir.params.clone();
            params.remove(this_index);
            let args = (0..sig.ir.params.len()).filter(|i| *i != this_index).map(|i| b.param(i)).collect();
            let shape = FuncSig::new(params, sig.ir.ret);
            let result = b.call(Callee::Indirect { ptr: code, sig: shape }, args, sig.ir.ret);
            b.ret(result);

            // instance target takes the receiver's place
            b.switch_to_block(bound);
            let mut args: Vec<_> = (0..sig.ir.params.len()).map(|i| b.param(i)).collect();
            args[this_index] = target;
            let result = b.call(Callee::Indirect { ptr: code, sig: sig.ir.clone() }, args, sig.ir.ret);
            b.ret(result);
        }

        self.module.set_body(func, b.finish());
        debug!(function = %self.function_info(function).symbol, ctor = is_ctor, "emitted delegate body");
        Ok(())
    }

    /// Struct path from a delegate object to a field declared on `System.Delegate`
    fn delegate_field_path(&mut self, owner: TypeId, name: &str) -> CompileResult<Vec<u32>> {
        let asm = self.asm;
        let delegate = asm.well_known(WellKnown::Delegate)?;
        let field = asm
            .find_field(delegate, name)
            .ok_or_else(|| CompileError::malformed(format!("System.Delegate has no {} field", name)))?;
        let (found, levels) = self.find_instance_field(owner, field)?;
        let FieldLocator::Index(index) = found.locator else {
            return Err(CompileError::malformed(format!("System.Delegate.{} has an explicit offset", name)));
        };
        let mut path = vec![1];
        path.extend(std::iter::repeat(0).take(levels as usize));
        path.push(index);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::Compiler;
    use crate::config::CompilerConfig;
    use crate::function::FunctionKind;
    use crate::ir::{Callee, Instr, Terminator};
    use ilaot_metadata::{AssemblyBuilder, MethodRef, TypeRef, WellKnown};

    #[test]
    fn test_delegate_members_are_synthesized() {
        let mut b = AssemblyBuilder::with_core_library("App");
        let multicast = b.assembly().well_known(WellKnown::MulticastDelegate).unwrap();
        let object = b.assembly().well_known(WellKnown::Object).unwrap();
        let handler = b.class("App", "Handler").base(TypeRef::Named(multicast)).sealed().finish();
        let ctor = b
            .ctor(handler)
            .runtime()
            .param("object", TypeRef::Named(object))
            .param("method", TypeRef::INTPTR)
            .finish();
        let invoke = b
            .method(handler, "Invoke")
            .virtual_()
            .runtime()
            .param("value", TypeRef::INT32)
            .returns(TypeRef::INT32)
            .finish();
        let begin = b.method(handler, "BeginInvoke").virtual_().runtime().finish();
        let asm = b.build().unwrap();
        let mut cx = Compiler::new(&asm, CompilerConfig::default()).unwrap();

        let ctor = cx.function_of(&MethodRef::new(TypeRef::Named(handler), ctor)).unwrap();
        let invoke = cx.function_of(&MethodRef::new(TypeRef::Named(handler), invoke)).unwrap();
        let begin = cx.function_of(&MethodRef::new(TypeRef::Named(handler), begin)).unwrap();
        assert_eq!(cx.function_info(ctor).kind, FunctionKind::Delegate);
        assert_eq!(cx.function_info(invoke).kind, FunctionKind::Delegate);
        assert_eq!(cx.function_info(begin).kind, FunctionKind::Runtime);
        cx.drain().unwrap();

        let func = cx.module().function(cx.function_info(ctor).func.unwrap());
        let body = func.body.as_ref().unwrap();
        let stores = body.blocks.iter().flat_map(|b| &b.instrs).filter(|i| matches!(i, Instr::Store { .. })).count();
        assert_eq!(stores, 2);

        // one call per arm: receiver-less for static targets, bound otherwise
        let func = cx.module().function(cx.function_info(invoke).func.unwrap());
        let body = func.body.as_ref().unwrap();
        let shapes: Vec<usize> = body
            .blocks
            .iter()
            .flat_map(|b| &b.instrs)
            .filter_map(|i| match i {
                Instr::Call { callee: Callee::Indirect { sig, .. }, .. } => Some(sig.params.len()),
                _ => None,
            })
            .collect();
        assert_eq!(shapes, vec![1, 2]);
        let returns = body.blocks.iter().filter(|b| matches!(b.terminator, Terminator::Ret(Some(_)))).count();
        assert_eq!(returns, 2);
    }
}
