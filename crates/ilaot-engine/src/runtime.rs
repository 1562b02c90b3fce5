//! Runtime boundary
//!
//! Functions the generated code calls into. They are declared on first use
//! with external linkage and fixed names.

use crate::compiler::Compiler;
use crate::ir::{FuncId, FuncSig, IrType, Linkage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeFn {
    /// `(ptr rtti, iptr size) -> ptr`
    AllocObject,
    /// `(ptr exception)`
    Throw,
    ThrowInvalidCast,
    ThrowOverflow,
    /// `(ptr method_key, ptr imt_entry) -> ptr`
    ResolveInterfaceCall,
    /// `(ptr object, ptr interface_rtti) -> i1`
    IsInstInterface,
    /// `(ptr chars, i32 length) -> ptr`
    NewString,
    /// `(ptr rtti) -> i32`, the selector value for a catch type
    TypeIdFor,
    /// `(ptr library_name) -> ptr`
    LoadLibrary,
    /// `(ptr library, ptr entry_point) -> ptr`
    GetProcAddress,
    /// `(ptr module_name)`
    RegisterModule,
    Personality,
}

impl RuntimeFn {
    pub fn name(self) -> &'static str {
        match self {
            RuntimeFn::AllocObject => "ilaot_alloc_object",
            RuntimeFn::Throw => "ilaot_throw",
            RuntimeFn::ThrowInvalidCast => "ilaot_throw_invalid_cast",
            RuntimeFn::ThrowOverflow => "ilaot_throw_overflow",
            RuntimeFn::ResolveInterfaceCall => "ilaot_resolve_interface_call",
            RuntimeFn::IsInstInterface => "ilaot_is_inst_interface",
            RuntimeFn::NewString => "ilaot_new_string",
            RuntimeFn::TypeIdFor => "ilaot_typeid_for",
            RuntimeFn::LoadLibrary => "ilaot_load_library",
            RuntimeFn::GetProcAddress => "ilaot_get_proc_address",
            RuntimeFn::RegisterModule => "ilaot_register_module",
            RuntimeFn::Personality => "ilaot_personality",
        }
    }

    pub fn signature(self, iptr: IrType) -> FuncSig {
        use IrType::*;
        match self {
            RuntimeFn::AllocObject => FuncSig::new(vec![Ptr, iptr], Ptr),
            RuntimeFn::Throw => FuncSig::new(vec![Ptr], Void),
            RuntimeFn::ThrowInvalidCast | RuntimeFn::ThrowOverflow => FuncSig::new(vec![], Void),
            RuntimeFn::ResolveInterfaceCall => FuncSig::new(vec![Ptr, Ptr], Ptr),
            RuntimeFn::IsInstInterface => FuncSig::new(vec![Ptr, Ptr], I1),
            RuntimeFn::NewString => FuncSig::new(vec![Ptr, I32], Ptr),
            RuntimeFn::TypeIdFor => FuncSig::new(vec![Ptr], I32),
            RuntimeFn::LoadLibrary => FuncSig::new(vec![Ptr], Ptr),
            RuntimeFn::GetProcAddress => FuncSig::new(vec![Ptr, Ptr], Ptr),
            RuntimeFn::RegisterModule => FuncSig::new(vec![Ptr], Void),
            RuntimeFn::Personality => FuncSig::new(vec![I32, I32, I64, Ptr, Ptr], I32),
        }
    }

    /// Whether control never returns from the call
    pub fn is_noreturn(self) -> bool {
        matches!(self, RuntimeFn::Throw | RuntimeFn::ThrowInvalidCast | RuntimeFn::ThrowOverflow)
    }
}

impl<'a> Compiler<'a> {
    pub(crate) fn runtime_fn(&mut self, f: RuntimeFn) -> FuncId {
        let iptr = self.target.int_ptr_type();
        self.module.get_or_declare_function(f.name(), f.signature(iptr), Linkage::External)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use ilaot_metadata::AssemblyBuilder;

    #[test]
    fn test_declared_once() {
        let asm = AssemblyBuilder::new("App").build().unwrap();
        let mut cx = Compiler::new(&asm, CompilerConfig::default()).unwrap();
        let a = cx.runtime_fn(RuntimeFn::AllocObject);
        let b = cx.runtime_fn(RuntimeFn::AllocObject);
        assert_eq!(a, b);
        let f = cx.module.function(a);
        assert_eq!(f.name, "ilaot_alloc_object");
        assert!(f.is_declaration());
        assert_eq!(f.sig.params, vec![IrType::Ptr, IrType::I64]);
    }
}
