//! Function descriptors
//!
//! One descriptor per closed method identity. Creating a descriptor declares
//! its native symbol and queues the body for lowering when it is compiled in
//! this module.

use std::fmt::Write as _;

use ilaot_metadata::{MethodDef, MethodDefId, MethodImpl, MethodRef, ModuleId, TypeRef, WellKnown};
use tracing::debug;

use crate::abi::Signature;
use crate::class::imt::method_id;
use crate::compiler::Compiler;
use crate::error::{CompileError, CompileResult};
use crate::ir::{FuncId, Linkage};
use crate::layout::{Completeness, TypeId};
use crate::resolver::is_still_open;

/// Handle into the function table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

/// Where the implementation of a function comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Bytecode body lowered into this module
    Il,
    /// Provided elsewhere under the same symbol
    External,
    /// Provided by the runtime under the method's symbol
    InternalCall,
    /// Synthesized by the runtime
    Runtime,
    /// Delegate constructor or invoker synthesized in this module
    Delegate,
    /// Native entry point resolved by the class initializer
    PInvoke,
    /// No implementation; occupies a slot only
    Abstract,
}

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub id: FunctionId,
    pub method: MethodRef,
    pub owner: TypeId,
    pub symbol: String,
    pub sig: Signature,
    pub kind: FunctionKind,
    /// `None` for abstract methods
    pub func: Option<FuncId>,
    /// Virtual table slot, assigned when the owner's class is built
    pub slot: Option<u32>,
    /// Name hash selecting the interface dispatch bucket
    pub method_id: u32,
    /// Unboxing entry for value-type instance methods
    pub trampoline: Option<FuncId>,
}

impl FunctionInfo {
    pub fn def(&self) -> MethodDefId {
        self.method.method
    }
}

impl<'a> Compiler<'a> {
    /// Descriptor for a closed method, created on first request
    pub fn function_of(&mut self, method: &MethodRef) -> CompileResult<FunctionId> {
        if let Some(id) = self.function_index.get(method) {
            return Ok(*id);
        }
        if is_still_open(self.asm, method) {
            return Err(CompileError::GenericResolutionFailure { ty: self.method_symbol(method) });
        }
        let asm = self.asm;
        let def = asm.method(method.method);
        let owner = self.type_of(&method.declaring, Completeness::Opaque)?;
        let sig = self.signature_of(method)?;
        let symbol = self.method_symbol(method);
        let local = self.method_linkage(method);

        let kind = match (&def.implementation, local) {
            (MethodImpl::InternalCall, _) => FunctionKind::InternalCall,
            (MethodImpl::Runtime, Some(_)) if def.body.is_none() && self.is_delegate_member(def) => {
                FunctionKind::Delegate
            }
            (MethodImpl::Runtime, _) if def.body.is_none() => FunctionKind::Runtime,
            (MethodImpl::PInvoke(_), _) => FunctionKind::PInvoke,
            _ if def.is_abstract => FunctionKind::Abstract,
            (_, Some(_)) if def.body.is_some() => FunctionKind::Il,
            _ => FunctionKind::External,
        };
        let func = match kind {
            FunctionKind::Abstract => None,
            FunctionKind::InternalCall => {
                Some(self.module.get_or_declare_function(&symbol, sig.ir.clone(), Linkage::ExternalWeak))
            }
            FunctionKind::Runtime => Some(self.module.get_or_declare_function(&symbol, sig.ir.clone(), Linkage::External)),
            FunctionKind::PInvoke => Some(self.module.get_or_declare_function(&symbol, sig.ir.clone(), Linkage::Internal)),
            FunctionKind::Il | FunctionKind::Delegate => {
                let linkage = local.unwrap_or(Linkage::External);
                Some(self.module.get_or_declare_function(&symbol, sig.ir.clone(), linkage))
            }
            FunctionKind::External => {
                let linkage = if self.config.weak_externals { Linkage::ExternalWeak } else { Linkage::External };
                Some(self.module.get_or_declare_function(&symbol, sig.ir.clone(), linkage))
            }
        };

        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(FunctionInfo {
            id,
            method: method.clone(),
            owner,
            symbol,
            sig,
            kind,
            func,
            slot: None,
            method_id: method_id(&asm.method_full_name(&method.declaring, method.method)),
            trampoline: None,
        });
        self.function_index.insert(method.clone(), id);
        debug!(symbol = %self.functions[id.0 as usize].symbol, kind = ?kind, "declared function");

        if matches!(kind, FunctionKind::Il | FunctionKind::PInvoke | FunctionKind::Delegate) {
            self.method_queue.push_back(id);
        }
        self.enqueue_class(owner);
        Ok(id)
    }

    /// Instance constructor or `Invoke` of a type deriving from `MulticastDelegate`
    fn is_delegate_member(&self, def: &MethodDef) -> bool {
        let Ok(multicast) = self.asm.well_known(WellKnown::MulticastDelegate) else {
            return false;
        };
        let owner = self.asm.type_def(def.declaring);
        owner.base == Some(TypeRef::Named(multicast)) && (def.name == ".ctor" || def.name == "Invoke") && def.has_this()
    }

    pub fn function_info(&self, id: FunctionId) -> &FunctionInfo {
        &self.functions[id.0 as usize]
    }

    pub(crate) fn function_info_mut(&mut self, id: FunctionId) -> &mut FunctionInfo {
        &mut self.functions[id.0 as usize]
    }

    /// Native symbol: the full method name, with method arguments spelled out
    pub fn method_symbol(&self, method: &MethodRef) -> String {
        let asm = self.asm;
        if method.generic_args.is_empty() {
            return asm.method_full_name(&method.declaring, method.method);
        }
        let def = asm.method(method.method);
        let mut name = format!("{} {}::{}<", def.ret.display(asm), method.declaring.display(asm), def.name);
        for (i, arg) in method.generic_args.iter().enumerate() {
            if i > 0 {
                name.push(',');
            }
            let _ = write!(name, "{}", arg.display(asm));
        }
        name.push_str(">(");
        for (i, p) in def.params.iter().enumerate() {
            if i > 0 {
                name.push(',');
            }
            let _ = write!(name, "{}", p.ty.display(asm));
        }
        name.push(')');
        name
    }

    /// Linkage of a locally emitted method, `None` when it belongs elsewhere
    pub(crate) fn method_linkage(&self, method: &MethodRef) -> Option<Linkage> {
        if !method.generic_args.is_empty() {
            return Some(Linkage::LinkOnceAny);
        }
        self.type_ref_linkage(&method.declaring)
    }

    /// Linkage of a type's emitted descriptors, `None` when it belongs elsewhere
    pub(crate) fn type_ref_linkage(&self, ty: &TypeRef) -> Option<Linkage> {
        match ty {
            TypeRef::GenericInstance { .. } | TypeRef::Array(_) | TypeRef::Pointer(_) | TypeRef::ByRef(_) => {
                Some(Linkage::LinkOnceAny)
            }
            TypeRef::Named(def) => {
                (self.asm.type_def(*def).module == ModuleId::MAIN).then_some(Linkage::External)
            }
            TypeRef::Primitive(p) => {
                match self.asm.find_type("System", &p.full_name()["System.".len()..]) {
                    Some(def) => (self.asm.type_def(def).module == ModuleId::MAIN).then_some(Linkage::External),
                    None => Some(Linkage::LinkOnceAny),
                }
            }
            TypeRef::GenericParam { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use ilaot_metadata::AssemblyBuilder;

    #[test]
    fn test_memoized_and_queued() {
        let mut b = AssemblyBuilder::with_core_library("App");
        let calc = b.class("App", "Calc").finish();
        let add = b
            .method(calc, "Add")
            .static_()
            .param("a", TypeRef::INT32)
            .param("b", TypeRef::INT32)
            .returns(TypeRef::INT32)
            .body(|body| {
                body.emit(ilaot_metadata::Instruction::Ldarg(0));
                body.emit(ilaot_metadata::Instruction::Ret);
            })
            .finish();
        let asm = b.build().unwrap();
        let mut cx = Compiler::new(&asm, CompilerConfig::default()).unwrap();

        let m = MethodRef::new(TypeRef::Named(calc), add);
        let f = cx.function_of(&m).unwrap();
        assert_eq!(cx.function_of(&m).unwrap(), f);
        let info = cx.function_info(f);
        assert_eq!(info.symbol, "System.Int32 App.Calc::Add(System.Int32,System.Int32)");
        assert_eq!(info.kind, FunctionKind::Il);
        assert_eq!(cx.method_queue.len(), 1);
        let func = cx.module.function(info.func.unwrap());
        assert_eq!(func.linkage, Linkage::External);
    }

    #[test]
    fn test_foreign_methods_are_declarations() {
        let asm = AssemblyBuilder::with_core_library("App").build().unwrap();
        let object = asm.well_known(ilaot_metadata::WellKnown::Object).unwrap();
        let to_string = asm.find_method(object, "ToString").unwrap();
        let mut cx = Compiler::new(&asm, CompilerConfig { weak_externals: true, ..Default::default() }).unwrap();

        let f = cx.function_of(&MethodRef::new(TypeRef::Named(object), to_string)).unwrap();
        let info = cx.function_info(f);
        assert_eq!(info.kind, FunctionKind::External);
        assert!(cx.method_queue.is_empty());
        assert_eq!(cx.module.function(info.func.unwrap()).linkage, Linkage::ExternalWeak);
    }

    #[test]
    fn test_open_method_rejected() {
        let mut b = AssemblyBuilder::with_core_library("App");
        let boxed = b.class("App", "Box`1").generic_param("T").finish();
        let get = b.method(boxed, "Get").returns(TypeRef::type_param(0)).finish();
        let asm = b.build().unwrap();
        let mut cx = Compiler::new(&asm, CompilerConfig::default()).unwrap();
        let err = cx.function_of(&MethodRef::new(TypeRef::Named(boxed), get)).unwrap_err();
        assert!(matches!(err, CompileError::GenericResolutionFailure { .. }));
    }
}
