//! Parameter-passing classification
//!
//! Every parameter and return value is classified once per signature and the
//! same classification drives the callee prologue and every call site.

use ilaot_metadata::{CallSiteSig, MethodRef, TypeRef};

use crate::compiler::Compiler;
use crate::error::{CompileError, CompileResult};
use crate::ir::{FuncSig, IrType};
use crate::layout::{Completeness, StackCategory, TypeId};
use crate::resolver::{resolve_strict, GenericContext};

/// How a value crosses a call boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiClass {
    /// In a register-sized value of the type's own shape
    Direct,
    /// Through a caller-owned buffer; returns use a leading pointer parameter
    Indirect,
    /// Bit-cast through an integer carrier of the same size
    Coerced(IrType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiParam {
    pub ty: TypeId,
    pub class: AbiClass,
}

/// Classified signature of a closed method
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    /// Type of the receiver; value-type receivers are passed by reference
    pub this: Option<TypeId>,
    pub params: Vec<AbiParam>,
    /// `None` for `void`
    pub ret: Option<AbiParam>,
    pub ir: FuncSig,
}

impl Signature {
    pub fn has_sret(&self) -> bool {
        matches!(self.ret, Some(AbiParam { class: AbiClass::Indirect, .. }))
    }

    /// IR parameter index of the receiver
    pub fn this_index(&self) -> usize {
        self.has_sret() as usize
    }

    /// IR parameter index of declared parameter `i`
    pub fn param_index(&self, i: usize) -> usize {
        self.has_sret() as usize + self.this.is_some() as usize + i
    }
}

impl<'a> Compiler<'a> {
    pub fn classify(&mut self, id: TypeId) -> CompileResult<AbiClass> {
        self.ensure(id, Completeness::StackComplete)?;
        let info = self.type_info(id);
        match info.category {
            StackCategory::Unknown => Err(CompileError::AbiClassificationError {
                message: format!("{} cannot be passed or returned", info.name),
            }),
            StackCategory::Value => {
                let size = self.target.size_of(&self.module, info.value);
                match size {
                    1 | 2 | 4 | 8 if self.config.abi_coercion => Ok(AbiClass::Coerced(IrType::int(size as u32 * 8))),
                    _ => Ok(AbiClass::Indirect),
                }
            }
            _ => Ok(AbiClass::Direct),
        }
    }

    /// IR type carrying a classified value across the boundary
    pub fn abi_ir_type(&self, param: AbiParam) -> IrType {
        match param.class {
            AbiClass::Direct => self.type_info(param.ty).value,
            AbiClass::Indirect => IrType::Ptr,
            AbiClass::Coerced(carrier) => carrier,
        }
    }

    fn classify_param(&mut self, ctx: &GenericContext<'_>, ty: &TypeRef) -> CompileResult<AbiParam> {
        let closed = resolve_strict(ctx, ty, self.asm)?;
        let id = self.type_of(&closed, Completeness::StackComplete)?;
        Ok(AbiParam { ty: id, class: self.classify(id)? })
    }

    fn finish_signature(&self, this: Option<TypeId>, params: Vec<AbiParam>, ret: Option<AbiParam>) -> Signature {
        let mut ir_params = Vec::with_capacity(params.len() + 2);
        let ir_ret = match ret {
            Some(r) if r.class == AbiClass::Indirect => {
                ir_params.push(IrType::Ptr);
                IrType::Void
            }
            Some(r) => self.abi_ir_type(r),
            None => IrType::Void,
        };
        if this.is_some() {
            ir_params.push(IrType::Ptr);
        }
        ir_params.extend(params.iter().map(|p| self.abi_ir_type(*p)));
        Signature { this, params, ret, ir: FuncSig::new(ir_params, ir_ret) }
    }

    /// Signature of a closed method reference
    pub fn signature_of(&mut self, method: &MethodRef) -> CompileResult<Signature> {
        let asm = self.asm;
        let def = asm.method(method.method);
        let ctx = GenericContext::for_method(method);
        let this = if def.has_this() { Some(self.type_of(&method.declaring, Completeness::Opaque)?) } else { None };
        let mut params = Vec::with_capacity(def.params.len());
        for p in &def.params {
            params.push(self.classify_param(&ctx, &p.ty)?);
        }
        let ret = if def.ret.is_void() { None } else { Some(self.classify_param(&ctx, &def.ret)?) };
        Ok(self.finish_signature(this, params, ret))
    }

    /// Signature of a `calli` call site
    pub fn call_site_signature(&mut self, ctx: &GenericContext<'_>, sig: &CallSiteSig) -> CompileResult<Signature> {
        let this = if sig.has_this {
            let object = self.asm.well_known(ilaot_metadata::WellKnown::Object)?;
            Some(self.type_of(&TypeRef::Named(object), Completeness::Opaque)?)
        } else {
            None
        };
        let mut params = Vec::with_capacity(sig.params.len());
        for p in &sig.params {
            params.push(self.classify_param(ctx, p)?);
        }
        let ret = if sig.ret.is_void() { None } else { Some(self.classify_param(ctx, &sig.ret)?) };
        Ok(self.finish_signature(this, params, ret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use ilaot_metadata::AssemblyBuilder;

    #[test]
    fn test_classification() {
        let mut b = AssemblyBuilder::with_core_library("App");
        let pair = b.value_type("App", "Pair").finish();
        b.field(pair, "a", TypeRef::INT32);
        b.field(pair, "b", TypeRef::INT32);
        let big = b.value_type("App", "Big").finish();
        b.field(big, "a", TypeRef::INT64);
        b.field(big, "b", TypeRef::INT64);
        b.field(big, "c", TypeRef::INT64);
        let asm = b.build().unwrap();
        let mut cx = Compiler::new(&asm, CompilerConfig::default()).unwrap();

        let p = cx.type_of(&TypeRef::Named(pair), Completeness::StackComplete).unwrap();
        assert_eq!(cx.classify(p).unwrap(), AbiClass::Coerced(IrType::I64));
        let g = cx.type_of(&TypeRef::Named(big), Completeness::StackComplete).unwrap();
        assert_eq!(cx.classify(g).unwrap(), AbiClass::Indirect);
        let i = cx.type_of(&TypeRef::INT32, Completeness::StackComplete).unwrap();
        assert_eq!(cx.classify(i).unwrap(), AbiClass::Direct);
        let v = cx.type_of(&TypeRef::VOID, Completeness::StackComplete).unwrap();
        assert!(matches!(cx.classify(v), Err(CompileError::AbiClassificationError { .. })));
    }

    #[test]
    fn test_sret_signature() {
        let mut b = AssemblyBuilder::with_core_library("App");
        let big = b.value_type("App", "Big").finish();
        for name in ["a", "b", "c"] {
            b.field(big, name, TypeRef::INT64);
        }
        let make = b.method(big, "Scale").param("k", TypeRef::INT32).returns(TypeRef::Named(big)).finish();
        let asm = b.build().unwrap();
        let mut cx = Compiler::new(&asm, CompilerConfig::default()).unwrap();

        let sig = cx.signature_of(&MethodRef::new(TypeRef::Named(big), make)).unwrap();
        assert!(sig.has_sret());
        assert_eq!(sig.ir.params, vec![IrType::Ptr, IrType::Ptr, IrType::I32]);
        assert_eq!(sig.ir.ret, IrType::Void);
        assert_eq!(sig.this_index(), 1);
        assert_eq!(sig.param_index(0), 2);
    }
}
