//! Class & dispatch engine
//!
//! Builds, once per concrete type, the virtual table, the interface
//! dispatch table, static storage, the runtime type descriptor and the
//! class initializer.

pub mod delegate;
pub mod imt;
pub mod init;
pub mod rtti;
pub mod trampoline;
pub mod vtable;

use ilaot_metadata::{FieldDefId, TypeRef, WellKnown};
use tracing::debug;

use crate::compiler::Compiler;
use crate::error::{CompileError, CompileResult};
use crate::function::FunctionId;
use crate::ir::{FuncId, GlobalId, IrType};
use crate::layout::{Completeness, TypeId};
use crate::resolver::{resolve_strict, GenericContext};

pub use imt::{ImtEntry, IMT_SIZE};

/// Handle into the class table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// A static field and its index in the statics struct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticField {
    pub field: FieldDefId,
    pub ty: TypeId,
    pub index: u32,
}

#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub id: ClassId,
    pub ty: TypeId,
    /// Interfaces report the root object class here
    pub base: Option<ClassId>,
    pub depth: u32,
    pub vtable: Vec<FunctionId>,
    /// Every implemented interface, inherited and implicit ones included
    pub interfaces: Vec<TypeId>,
    /// [`IMT_SIZE`] buckets of resolved interface methods
    pub imt: Vec<Vec<ImtEntry>>,
    pub rtti: GlobalId,
    /// Concrete struct type of the RTTI global
    pub rtti_type: IrType,
    pub statics: Vec<StaticField>,
    pub statics_type: IrType,
    pub cctor: Option<FunctionId>,
    pub init: Option<FuncId>,
}

impl ClassInfo {
    pub fn static_field(&self, field: FieldDefId) -> Option<&StaticField> {
        self.statics.iter().find(|s| s.field == field)
    }
}

impl<'a> Compiler<'a> {
    /// Class descriptor of a type, built on first request
    pub fn class_of(&mut self, ty: TypeId) -> CompileResult<ClassId> {
        if let Some(id) = self.class_index.get(&ty) {
            return Ok(*id);
        }
        self.ensure(ty, Completeness::TypeComplete)?;
        let info = self.type_info(ty);
        if info.category == crate::layout::StackCategory::Unknown {
            return Err(CompileError::unsupported(format!("class descriptor for {}", info.name)));
        }
        let is_interface = info.is_interface;
        let base_ty = info.base;

        let (base, depth) = if is_interface {
            let object = self.asm.well_known(WellKnown::Object)?;
            let object = self.type_of(&TypeRef::Named(object), Completeness::TypeComplete)?;
            (Some(self.class_of(object)?), 0)
        } else {
            match base_ty {
                Some(b) => {
                    self.ensure(b, Completeness::VTableEmitted)?;
                    let class = self.class_of(b)?;
                    (Some(class), self.classes[class.0 as usize].depth + 1)
                }
                None => (None, 0),
            }
        };

        let vtable = if is_interface { self.assign_interface_slots(ty)? } else { self.build_vtable(ty, base)? };
        let interfaces = self.all_interfaces(ty)?;
        let rtti = self.rtti_global(ty);
        let rtti_type = self.module.global(rtti).ty;
        let (statics, statics_type) = self.layout_statics(ty)?;

        let id = ClassId(self.classes.len() as u32);
        self.classes.push(ClassInfo {
            id,
            ty,
            base,
            depth,
            vtable,
            interfaces,
            imt: vec![Vec::new(); IMT_SIZE],
            rtti,
            rtti_type,
            statics,
            statics_type,
            cctor: None,
            init: None,
        });
        self.class_index.insert(ty, id);

        if !is_interface {
            let imt = self.build_imt(id)?;
            self.classes[id.0 as usize].imt = imt;
        }
        self.emit_class_init(id)?;
        self.emit_rtti(id)?;
        self.types[ty].state = Completeness::VTableEmitted;

        let class = &self.classes[id.0 as usize];
        debug!(
            ty = %self.type_info(ty).name,
            depth = class.depth,
            vtable = class.vtable.len(),
            interfaces = class.interfaces.len(),
            "built class"
        );
        Ok(id)
    }

    pub fn class_info(&self, id: ClassId) -> &ClassInfo {
        &self.classes[id.0 as usize]
    }

    /// Class descriptor of a type reference, building whatever is missing
    pub fn class_for(&mut self, ty: &TypeRef) -> CompileResult<ClassId> {
        let id = self.type_of(ty, Completeness::VTableEmitted)?;
        self.class_of(id)
    }

    /// Interfaces a type implements: declared ones, the ones those extend,
    /// inherited ones and shape-granted ones, without duplicates
    pub fn all_interfaces(&mut self, ty: TypeId) -> CompileResult<Vec<TypeId>> {
        let mut result = Vec::new();
        let mut pending: Vec<TypeRef> = Vec::new();
        let mut current = Some(ty);
        while let Some(id) = current {
            let info = self.type_info(id);
            pending.extend(info.implicit_interfaces.iter().cloned());
            if let Some(def) = info.def {
                let ctx = GenericContext::for_type(&info.ty);
                for iface in &self.asm.type_def(def).interfaces {
                    pending.push(resolve_strict(&ctx, iface, self.asm)?);
                }
            }
            current = info.base;
        }
        while let Some(iface) = pending.pop() {
            let id = self.type_of(&iface, Completeness::Opaque)?;
            if result.contains(&id) || id == ty {
                continue;
            }
            result.push(id);
            if let Some(def) = self.type_info(id).def {
                let ctx = GenericContext::for_type(&iface);
                for inner in &self.asm.type_def(def).interfaces {
                    pending.push(resolve_strict(&ctx, inner, self.asm)?);
                }
            }
        }
        Ok(result)
    }

    /// Static fields in declaration order, and the struct holding them
    fn layout_statics(&mut self, ty: TypeId) -> CompileResult<(Vec<StaticField>, IrType)> {
        let info = self.type_info(ty);
        let name = format!("{}.statics", info.name);
        let owner = info.ty.clone();
        let mut statics = Vec::new();
        let mut shapes = Vec::new();
        if let (Some(def), false) = (info.def, info.is_interface) {
            let ctx = GenericContext::for_type(&owner);
            for &field in &self.asm.type_def(def).fields {
                let fd = self.asm.field(field);
                if !fd.is_static {
                    continue;
                }
                let fty = resolve_strict(&ctx, &fd.ty, self.asm)?;
                let fid = self.type_of(&fty, Completeness::StackComplete)?;
                statics.push(StaticField { field, ty: fid, index: shapes.len() as u32 });
                shapes.push(self.type_info(fid).value);
            }
        }
        let statics_type = self.module.struct_with_body(&name, shapes);
        Ok((statics, statics_type))
    }

    /// Ancestor classes from the root down to `class` itself
    pub fn class_chain(&self, class: ClassId) -> Vec<ClassId> {
        let mut chain = Vec::new();
        let mut current = Some(class);
        while let Some(c) = current {
            chain.push(c);
            let info = &self.classes[c.0 as usize];
            current = if self.type_info(info.ty).is_interface { None } else { info.base };
        }
        chain.reverse();
        chain
    }
}
