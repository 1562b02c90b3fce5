//! Virtual table construction
//!
//! The base table is copied in full. Declared methods then claim slots:
//! overrides reuse the slot of the base declaration they match, everything
//! else appends. Static and non-virtual methods occupy slots too; the slot
//! stores their resolved entry point.

use ilaot_metadata::MethodRef;
use tracing::trace;

use crate::class::imt::IMT_SIZE;
use crate::class::ClassId;
use crate::compiler::Compiler;
use crate::error::{CompileError, CompileResult};
use crate::function::FunctionId;
use crate::layout::TypeId;

impl<'a> Compiler<'a> {
    pub(crate) fn build_vtable(&mut self, ty: TypeId, base: Option<ClassId>) -> CompileResult<Vec<FunctionId>> {
        let mut vtable = base.map(|b| self.classes[b.0 as usize].vtable.clone()).unwrap_or_default();
        let info = self.type_info(ty);
        let Some(def) = info.def else { return Ok(vtable) };
        let owner = info.ty.clone();
        let asm = self.asm;

        // Virtual methods first so overrides see the inherited slots, then
        // instance methods, then statics
        let methods = &asm.type_def(def).methods;
        let mut ordered: Vec<_> = methods.iter().copied().filter(|m| asm.method(*m).is_virtual).collect();
        ordered.extend(methods.iter().copied().filter(|m| {
            let d = asm.method(*m);
            !d.is_virtual && !d.is_static
        }));
        ordered.extend(methods.iter().copied().filter(|m| asm.method(*m).is_static));

        for m in ordered {
            let d = asm.method(m);
            if !d.generic_params.is_empty() {
                continue;
            }
            let function = self.function_of(&MethodRef::new(owner.clone(), m))?;
            let slot = if d.is_virtual && !d.is_new_slot {
                let slot = self.find_override_slot(&vtable, function).ok_or_else(|| {
                    CompileError::malformed(format!(
                        "no base slot for override {}",
                        self.function_info(function).symbol
                    ))
                })?;
                vtable[slot] = function;
                slot
            } else {
                vtable.push(function);
                vtable.len() - 1
            };
            self.function_info_mut(function).slot = Some(slot as u32);
            trace!(function = %self.function_info(function).symbol, slot, "assigned vtable slot");
        }
        Ok(vtable)
    }

    /// Most derived inherited virtual slot with the same name and signature
    fn find_override_slot(&self, vtable: &[FunctionId], function: FunctionId) -> Option<usize> {
        let f = self.function_info(function);
        let name = &self.asm.method(f.def()).name;
        vtable.iter().rposition(|candidate| {
            let c = self.function_info(*candidate);
            let cdef = self.asm.method(c.def());
            cdef.is_virtual && &cdef.name == name && self.same_signature(function, *candidate)
        })
    }

    /// Parameter and return types match after resolution in each declaring context
    pub(crate) fn same_signature(&self, a: FunctionId, b: FunctionId) -> bool {
        let (a, b) = (&self.function_info(a).sig, &self.function_info(b).sig);
        a.params.len() == b.params.len()
            && a.params.iter().zip(&b.params).all(|(x, y)| x.ty == y.ty)
            && a.ret.map(|r| r.ty) == b.ret.map(|r| r.ty)
    }

    /// Interface methods dispatch through buckets rather than table slots
    pub(crate) fn assign_interface_slots(&mut self, ty: TypeId) -> CompileResult<Vec<FunctionId>> {
        let info = self.type_info(ty);
        let Some(def) = info.def else { return Ok(Vec::new()) };
        let owner = info.ty.clone();
        let asm = self.asm;
        for &m in &asm.type_def(def).methods {
            let d = asm.method(m);
            if d.is_static || !d.generic_params.is_empty() {
                continue;
            }
            let function = self.function_of(&MethodRef::new(owner.clone(), m))?;
            let bucket = self.function_info(function).method_id % IMT_SIZE as u32;
            self.function_info_mut(function).slot = Some(bucket);
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::Compiler;
    use crate::config::CompilerConfig;
    use crate::error::CompileError;
    use ilaot_metadata::{AssemblyBuilder, TypeRef};

    #[test]
    fn test_override_reuses_slot() {
        let mut b = AssemblyBuilder::with_core_library("App");
        let shape = b.class("App", "Shape").finish();
        b.method(shape, "Area").virtual_().returns(TypeRef::DOUBLE).finish();
        b.method(shape, "Name").virtual_().returns(TypeRef::INT32).finish();
        let square = b.class("App", "Square").base(TypeRef::Named(shape)).finish();
        b.method(square, "Name").override_().returns(TypeRef::INT32).finish();
        b.method(square, "Side").returns(TypeRef::DOUBLE).finish();
        let asm = b.build().unwrap();
        let mut cx = Compiler::new(&asm, CompilerConfig::default()).unwrap();

        let base = cx.class_for(&TypeRef::Named(shape)).unwrap();
        let derived = cx.class_for(&TypeRef::Named(square)).unwrap();
        let base_vt = cx.class_info(base).vtable.clone();
        let derived_vt = cx.class_info(derived).vtable.clone();

        let name_slot = base_vt.iter().position(|f| cx.function_info(*f).symbol.ends_with("Shape::Name()")).unwrap();
        assert!(cx.function_info(derived_vt[name_slot]).symbol.ends_with("Square::Name()"));
        assert_eq!(&derived_vt[..name_slot], &base_vt[..name_slot]);
        assert_eq!(derived_vt.len(), base_vt.len() + 1);
    }

    #[test]
    fn test_unmatched_override_is_malformed() {
        let mut b = AssemblyBuilder::with_core_library("App");
        let lone = b.class("App", "Lone").finish();
        b.method(lone, "Missing").override_().finish();
        let asm = b.build().unwrap();
        let mut cx = Compiler::new(&asm, CompilerConfig::default()).unwrap();
        let err = cx.class_for(&TypeRef::Named(lone)).unwrap_err();
        assert!(matches!(err, CompileError::MalformedInput { .. }));
    }
}
