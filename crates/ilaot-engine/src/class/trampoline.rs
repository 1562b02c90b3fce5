//! Unboxing entry points for value-type methods
//!
//! Dispatch tables hold code expecting a boxed receiver. Value-type instance
//! methods take a pointer to the raw data, so their slots hold a trampoline
//! that steps over the object header and tail-calls the real method.

use tracing::trace;

use crate::compiler::Compiler;
use crate::error::{CompileError, CompileResult};
use crate::function::{FunctionId, FunctionKind};
use crate::ir::{Callee, Constant, FuncId, FunctionBuilder, Linkage};

impl<'a> Compiler<'a> {
    /// Trampoline of a value-type instance method, synthesized once
    pub fn trampoline_of(&mut self, function: FunctionId) -> CompileResult<FuncId> {
        let info = self.function_info(function);
        if let Some(t) = info.trampoline {
            return Ok(t);
        }
        let target = info
            .func
            .ok_or_else(|| CompileError::malformed(format!("trampoline for abstract {}", info.symbol)))?;
        let name = format!("{}_UnboxTrampoline", info.symbol);
        let sig = info.sig.ir.clone();
        let this_index = info.sig.this_index();
        let object = self.type_info(info.owner).object;

        let mut b = FunctionBuilder::new(&sig.params);
        let mut args: Vec<_> = (0..sig.params.len()).map(|i| b.param(i)).collect();
        args[this_index] = b.struct_gep(object, args[this_index], &[1]);
        let result = b.call_with(Callee::Direct(target), args, sig.ret, true);
        b.ret(result);

        let t = self.module.get_or_declare_function(&name, sig, Linkage::LinkOnceAny);
        self.module.set_body(t, b.finish());
        self.function_info_mut(function).trampoline = Some(t);
        trace!(function = %self.function_info(function).symbol, "synthesized unbox trampoline");
        Ok(t)
    }

    /// Address stored in a vtable or IMT slot for `function`
    pub(crate) fn dispatch_address(&mut self, function: FunctionId) -> CompileResult<Constant> {
        let info = self.function_info(function);
        match (info.kind, info.func) {
            (FunctionKind::Abstract, _) | (FunctionKind::PInvoke, _) | (_, None) => Ok(Constant::Null),
            (_, Some(func)) => {
                let boxed_receiver = info.sig.this.is_some() && self.type_info(info.owner).is_value_type;
                if boxed_receiver {
                    Ok(Constant::FuncAddr(self.trampoline_of(function)?))
                } else {
                    Ok(Constant::FuncAddr(func))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::Compiler;
    use crate::config::CompilerConfig;
    use crate::ir::{Instr, Terminator};
    use ilaot_metadata::{AssemblyBuilder, Instruction, MethodRef, TypeRef};

    #[test]
    fn test_trampoline_skips_header() {
        let mut b = AssemblyBuilder::with_core_library("App");
        let point = b.value_type("App", "Point").finish();
        b.field(point, "x", TypeRef::INT32);
        let get = b
            .method(point, "GetX")
            .returns(TypeRef::INT32)
            .body(|body| {
                body.emit(Instruction::LdcI4(0));
                body.emit(Instruction::Ret);
            })
            .finish();
        let asm = b.build().unwrap();
        let mut cx = Compiler::new(&asm, CompilerConfig::default()).unwrap();

        let f = cx.function_of(&MethodRef::new(TypeRef::Named(point), get)).unwrap();
        let t = cx.trampoline_of(f).unwrap();
        assert_eq!(cx.trampoline_of(f).unwrap(), t);

        let func = cx.module().function(t);
        assert_eq!(func.name, "System.Int32 App.Point::GetX()_UnboxTrampoline");
        let body = func.body.as_ref().unwrap();
        let entry = body.block(body.layout[0]);
        assert!(matches!(&entry.instrs[0], Instr::Gep { indices, .. } if indices.len() == 2));
        assert!(matches!(&entry.instrs[1], Instr::Call { tail: true, .. }));
        assert!(matches!(entry.terminator, Terminator::Ret(Some(_))));
    }
}
