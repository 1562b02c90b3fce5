//! Generic resolver
//!
//! Substitutes formal generic parameters (`!n`, `!!n`) with the actual
//! arguments of a type and/or method instantiation. Substitution walks the
//! whole reference once and reports closure alongside the result, so callers
//! never re-scan a reference to learn whether it is still open.

use std::borrow::Cow;

use ilaot_metadata::{Assembly, FieldRef, GenericOwner, MethodRef, TypeRef};

use crate::error::{CompileError, CompileResult};

/// Actual arguments in scope for a substitution
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericContext<'a> {
    /// Arguments of the declaring type instantiation, aligned to its formals
    pub type_args: Option<&'a [TypeRef]>,
    /// Arguments of the method instantiation, aligned to the method's formals
    pub method_args: Option<&'a [TypeRef]>,
}

impl<'a> GenericContext<'a> {
    /// No substitution in scope
    pub fn empty() -> Self {
        Self::default()
    }

    /// Context established by a (possibly instantiated) declaring type
    pub fn for_type(declaring: &'a TypeRef) -> Self {
        match declaring {
            TypeRef::GenericInstance { args, .. } => GenericContext { type_args: Some(args), method_args: None },
            _ => Self::default(),
        }
    }

    /// Context inside the body or signature of `method`
    pub fn for_method(method: &'a MethodRef) -> Self {
        let mut ctx = Self::for_type(&method.declaring);
        if !method.generic_args.is_empty() {
            ctx.method_args = Some(&method.generic_args);
        }
        ctx
    }

    /// Whether a substitution would change anything
    pub fn is_empty(&self) -> bool {
        self.type_args.is_none() && self.method_args.is_none()
    }

    fn lookup(&self, owner: GenericOwner, index: u16) -> Option<&'a TypeRef> {
        let args = match owner {
            GenericOwner::Type => self.type_args?,
            GenericOwner::Method => self.method_args?,
        };
        args.get(index as usize)
    }
}

/// Result of substitution plus its closure flag
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<'t> {
    pub ty: Cow<'t, TypeRef>,
    pub closed: bool,
}

/// Substitute inside `ty`, borrowing when nothing changed
pub fn substitute<'t>(ctx: &GenericContext<'_>, ty: &'t TypeRef) -> Resolved<'t> {
    match ty {
        TypeRef::Primitive(_) | TypeRef::Named(_) => Resolved { ty: Cow::Borrowed(ty), closed: true },
        TypeRef::GenericParam { owner, index } => match ctx.lookup(*owner, *index) {
            Some(actual) => Resolved { ty: Cow::Owned(actual.clone()), closed: actual.is_closed() },
            None => Resolved { ty: Cow::Borrowed(ty), closed: false },
        },
        TypeRef::Array(e) | TypeRef::Pointer(e) | TypeRef::ByRef(e) => {
            let inner = substitute(ctx, e);
            let closed = inner.closed;
            let ty = match inner.ty {
                Cow::Borrowed(_) => Cow::Borrowed(ty),
                Cow::Owned(new) => Cow::Owned(rewrap(ty, new)),
            };
            Resolved { ty, closed }
        }
        TypeRef::GenericInstance { def, args } => {
            let mut closed = true;
            let mut changed: Option<Vec<TypeRef>> = None;
            for (i, arg) in args.iter().enumerate() {
                let r = substitute(ctx, arg);
                closed &= r.closed;
                match (r.ty, &mut changed) {
                    (Cow::Owned(new), None) => {
                        let mut v: Vec<TypeRef> = args[..i].to_vec();
                        v.push(new);
                        changed = Some(v);
                    }
                    (Cow::Owned(new), Some(v)) => v.push(new),
                    (Cow::Borrowed(same), Some(v)) => v.push(same.clone()),
                    (Cow::Borrowed(_), None) => {}
                }
            }
            let ty = match changed {
                Some(args) => Cow::Owned(TypeRef::GenericInstance { def: *def, args }),
                None => Cow::Borrowed(ty),
            };
            Resolved { ty, closed }
        }
    }
}

fn rewrap(shape: &TypeRef, element: TypeRef) -> TypeRef {
    match shape {
        TypeRef::Array(_) => TypeRef::array_of(element),
        TypeRef::Pointer(_) => TypeRef::pointer_to(element),
        _ => TypeRef::by_ref(element),
    }
}

/// Permissive resolution: partially open results are allowed
pub fn resolve<'t>(ctx: &GenericContext<'_>, ty: &'t TypeRef) -> Cow<'t, TypeRef> {
    substitute(ctx, ty).ty
}

/// Strict resolution: the result must be closed
pub fn resolve_strict(ctx: &GenericContext<'_>, ty: &TypeRef, asm: &Assembly) -> CompileResult<TypeRef> {
    let r = substitute(ctx, ty);
    if !r.closed {
        return Err(CompileError::GenericResolutionFailure { ty: r.ty.display(asm).to_string() });
    }
    Ok(r.ty.into_owned())
}

/// Resolve the declaring type and generic arguments of a method reference
pub fn resolve_method(ctx: &GenericContext<'_>, method: &MethodRef) -> MethodRef {
    if ctx.is_empty() {
        return method.clone();
    }
    MethodRef {
        declaring: resolve(ctx, &method.declaring).into_owned(),
        method: method.method,
        generic_args: method.generic_args.iter().map(|a| resolve(ctx, a).into_owned()).collect(),
    }
}

pub fn resolve_field(ctx: &GenericContext<'_>, field: &FieldRef) -> FieldRef {
    FieldRef { declaring: resolve(ctx, &field.declaring).into_owned(), field: field.field }
}

/// True when the method cannot be lowered as-is: its declaring type or one of
/// its generic arguments is open, or it is a generic method definition used
/// without arguments
pub fn is_still_open(asm: &Assembly, method: &MethodRef) -> bool {
    if !method.declaring.is_closed() || !method.generic_args.iter().all(TypeRef::is_closed) {
        return true;
    }
    let def = asm.method(method.method);
    if def.generic_params.len() != method.generic_args.len() {
        return true;
    }
    match method.declaring.def_id() {
        Some(ty) => {
            let params = asm.type_def(ty).generic_params.len();
            params != method.declaring.generic_args().len()
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilaot_metadata::{AssemblyBuilder, TypeDefId};

    fn list_of(arg: TypeRef) -> TypeRef {
        TypeRef::GenericInstance { def: TypeDefId(7), args: vec![arg] }
    }

    #[test]
    fn test_substitutes_nested_params() {
        let args = [TypeRef::INT32];
        let ctx = GenericContext { type_args: Some(&args), method_args: None };
        let open = TypeRef::array_of(list_of(TypeRef::type_param(0)));
        let r = substitute(&ctx, &open);
        assert!(r.closed);
        assert_eq!(*r.ty, TypeRef::array_of(list_of(TypeRef::INT32)));
    }

    #[test]
    fn test_identity_preserved_without_substitution() {
        let args = [TypeRef::INT32];
        let ctx = GenericContext { type_args: Some(&args), method_args: None };
        let ty = TypeRef::pointer_to(list_of(TypeRef::DOUBLE));
        assert!(matches!(resolve(&ctx, &ty), Cow::Borrowed(_)));
    }

    #[test]
    fn test_method_params_use_method_context() {
        let type_args = [TypeRef::INT32];
        let method_args = [TypeRef::DOUBLE];
        let ctx = GenericContext { type_args: Some(&type_args), method_args: Some(&method_args) };
        let ty = list_of(TypeRef::method_param(0));
        assert_eq!(resolve(&ctx, &ty).into_owned(), list_of(TypeRef::DOUBLE));
    }

    #[test]
    fn test_strict_rejects_open_result() {
        let asm = AssemblyBuilder::new("Test").build().unwrap();
        let ctx = GenericContext::empty();
        let err = resolve_strict(&ctx, &TypeRef::type_param(0), &asm).unwrap_err();
        assert!(matches!(err, CompileError::GenericResolutionFailure { .. }));

        let param = TypeRef::type_param(0);
        let permissive = resolve(&ctx, &param);
        assert_eq!(*permissive, param);
    }

    #[test]
    fn test_still_open_methods() {
        let mut b = AssemblyBuilder::new("Test");
        let boxed = b.class("App", "Box`1").generic_param("T").finish();
        let get = b.method(boxed, "Get").returns(TypeRef::type_param(0)).finish();
        let map = b.method(boxed, "Map").generic_param("U").finish();
        let asm = b.build().unwrap();

        let open = MethodRef::new(TypeRef::Named(boxed), get);
        assert!(is_still_open(&asm, &open));

        let closed_ty = TypeRef::GenericInstance { def: boxed, args: vec![TypeRef::INT32] };
        assert!(!is_still_open(&asm, &MethodRef::new(closed_ty.clone(), get)));
        assert!(is_still_open(&asm, &MethodRef::new(closed_ty.clone(), map)));

        let map_int = MethodRef { declaring: closed_ty, method: map, generic_args: vec![TypeRef::INT32] };
        assert!(!is_still_open(&asm, &map_int));
    }
}
