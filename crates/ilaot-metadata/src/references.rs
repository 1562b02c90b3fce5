//! Reachable-reference enumeration
//!
//! Walks signatures and instruction operands of every definition and reports
//! each distinct type, method and field reference once, in discovery order.

use rustc_hash::FxHashSet;

use crate::assembly::{Assembly, FieldRef, MethodRef};
use crate::body::ClauseKind;
use crate::instruction::{ElementKind, Instruction};
use crate::types::{TypeDefId, TypeRef};

/// A reference reachable from the assembly
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Type(TypeRef),
    Method(MethodRef),
    Field(FieldRef),
}

impl Reference {
    /// Outermost definition the reference depends on
    pub fn type_def(&self) -> Option<TypeDefId> {
        fn root(ty: &TypeRef) -> Option<TypeDefId> {
            match ty.element() {
                Some(e) => root(e),
                None => ty.def_id(),
            }
        }
        match self {
            Reference::Type(t) => root(t),
            Reference::Method(m) => root(&m.declaring),
            Reference::Field(f) => root(&f.declaring),
        }
    }
}

#[derive(Default)]
struct Collector {
    seen: FxHashSet<Reference>,
    out: Vec<Reference>,
}

impl Collector {
    fn push(&mut self, r: Reference) {
        if self.seen.insert(r.clone()) {
            self.out.push(r);
        }
    }

    fn ty(&mut self, t: &TypeRef) {
        self.push(Reference::Type(t.clone()));
    }

    fn method(&mut self, m: &MethodRef) {
        self.ty(&m.declaring);
        for arg in &m.generic_args {
            self.ty(arg);
        }
        self.push(Reference::Method(m.clone()));
    }

    fn field(&mut self, f: &FieldRef) {
        self.ty(&f.declaring);
        self.push(Reference::Field(f.clone()));
    }

    fn instruction(&mut self, instr: &Instruction) {
        match instr {
            Instruction::Ldfld(f)
            | Instruction::Ldflda(f)
            | Instruction::Stfld(f)
            | Instruction::Ldsfld(f)
            | Instruction::Ldsflda(f)
            | Instruction::Stsfld(f) => self.field(f),
            Instruction::Call(m)
            | Instruction::Callvirt(m)
            | Instruction::Newobj(m)
            | Instruction::Ldftn(m)
            | Instruction::Ldvirtftn(m) => self.method(m),
            Instruction::Calli(sig) => {
                for p in &sig.params {
                    self.ty(p);
                }
                self.ty(&sig.ret);
            }
            Instruction::Ldobj(t)
            | Instruction::Stobj(t)
            | Instruction::Cpobj(t)
            | Instruction::Initobj(t)
            | Instruction::Sizeof(t)
            | Instruction::Constrained(t)
            | Instruction::Box(t)
            | Instruction::Unbox(t)
            | Instruction::UnboxAny(t)
            | Instruction::Castclass(t)
            | Instruction::Isinst(t)
            | Instruction::Ldtoken(t)
            | Instruction::Newarr(t)
            | Instruction::Ldelema(t)
            | Instruction::Ldelem(ElementKind::Any(t))
            | Instruction::Stelem(ElementKind::Any(t)) => self.ty(t),
            _ => {}
        }
    }
}

impl Assembly {
    /// Every type and member reference reachable from definitions
    pub fn references(&self) -> Vec<Reference> {
        let mut c = Collector::default();

        for ty in &self.types {
            if let Some(base) = &ty.base {
                c.ty(base);
            }
            for iface in &ty.interfaces {
                c.ty(iface);
            }
        }
        for field in &self.fields {
            c.ty(&field.ty);
        }
        for method in &self.methods {
            c.ty(&method.ret);
            for p in &method.params {
                c.ty(&p.ty);
            }
            let Some(body) = &method.body else { continue };
            for local in &body.locals {
                c.ty(local);
            }
            for clause in &body.exception_clauses {
                if let ClauseKind::Catch(t) = &clause.kind {
                    c.ty(t);
                }
            }
            for at in &body.instructions {
                c.instruction(&at.instr);
            }
        }
        c.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::AssemblyBuilder;

    #[test]
    fn test_references_are_deduplicated() {
        let mut b = AssemblyBuilder::new("Test");
        let ty = b.class("App", "Program").finish();
        let callee = b.method(ty, "Helper").static_().finish();
        let target = MethodRef::new(TypeRef::Named(ty), callee);
        b.method(ty, "Main")
            .static_()
            .body(|body| {
                body.emit(Instruction::Call(target.clone()));
                body.emit(Instruction::Call(target.clone()));
                body.emit(Instruction::Ret);
            })
            .finish();
        let asm = b.build().unwrap();

        let refs = asm.references();
        let calls = refs.iter().filter(|r| matches!(r, Reference::Method(_))).count();
        assert_eq!(calls, 1);
        assert!(refs.contains(&Reference::Type(TypeRef::Named(ty))));
        assert!(refs.contains(&Reference::Type(TypeRef::VOID)));
    }
}
