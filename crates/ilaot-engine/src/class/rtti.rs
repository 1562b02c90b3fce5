//! Runtime type descriptors
//!
//! Every type gets one `{name}.rtti` global. The first five fields are shared
//! by all descriptors; concrete types continue with the hierarchy, dispatch
//! tables and static storage:
//!
//! | index | field |
//! |-------|-------|
//! | 0 | base descriptor |
//! | 1 | concrete flag |
//! | 2 | identity (module name, token) |
//! | 3 | extra type info |
//! | 4 | runtime cache slot |
//! | 5 | supertype count |
//! | 6 | interface count |
//! | 7 | supertypes, root first |
//! | 8 | interfaces |
//! | 9 | class-initialized flag |
//! | 10 | object size |
//! | 11 | element size |
//! | 12 | interface dispatch table |
//! | 13 | vtable length |
//! | 14 | vtable |
//! | 15 | static fields |

use ilaot_metadata::{ModuleId, TypeRef, WellKnown};
use tracing::trace;

use crate::class::imt::IMT_SIZE;
use crate::class::ClassId;
use crate::compiler::Compiler;
use crate::error::CompileResult;
use crate::ir::{Constant, GlobalId, IrType, Linkage, StructId};
use crate::layout::{Completeness, StackCategory, TypeId};

pub const RTTI_SUPERTYPE_COUNT: u32 = 5;
pub const RTTI_SUPERTYPES: u32 = 7;
pub const RTTI_INITIALIZED: u32 = 9;
pub const RTTI_IMT: u32 = 12;
pub const RTTI_VTABLE: u32 = 14;
pub const RTTI_STATICS: u32 = 15;

/// Kind tag stored in the low bits of the extra-info element pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementTag {
    Array = 1,
    Pointer = 2,
    ByRef = 3,
}

/// Struct types shared by all descriptors
#[derive(Debug, Clone, Copy)]
pub struct RttiTypes {
    /// Common prefix ending in an open vtable, used for dynamic addressing
    pub header: IrType,
    pub identity: IrType,
    /// `{ ptr key, ptr entry }` element of an IMT collision list
    pub imt_pair: IrType,
}

impl<'a> Compiler<'a> {
    pub(crate) fn rtti_types(&mut self) -> RttiTypes {
        if let Some(types) = self.rtti_types {
            return types;
        }
        let iptr = self.target.int_ptr_type();
        let identity = self.module.struct_with_body("ilaot.type_identity", vec![IrType::Ptr, IrType::I32]);
        let imt = self.module.array_of(IrType::Ptr, IMT_SIZE as u64);
        let open_vtable = self.module.array_of(IrType::Ptr, 0);
        let header = self.module.struct_with_body(
            "ilaot.rtti",
            vec![
                IrType::Ptr,
                IrType::I8,
                identity,
                IrType::Ptr,
                IrType::Ptr,
                IrType::I32,
                IrType::I32,
                IrType::Ptr,
                IrType::Ptr,
                IrType::I8,
                iptr,
                iptr,
                imt,
                IrType::I32,
                open_vtable,
            ],
        );
        let imt_pair = self.module.struct_with_body("ilaot.imt_entry", vec![IrType::Ptr, IrType::Ptr]);
        let types = RttiTypes { header, identity, imt_pair };
        self.rtti_types = Some(types);
        types
    }

    /// Descriptor global of a type, declared on first use
    pub fn rtti_global(&mut self, ty: TypeId) -> GlobalId {
        if let Some(g) = self.type_info(ty).rtti {
            return g;
        }
        let name = format!("{}.rtti", self.type_info(ty).name);
        let shape = IrType::Struct(self.module.declare_struct(&name));
        let emitted = self.type_info(ty).category != StackCategory::Unknown;
        let linkage = match self.type_ref_linkage(&self.type_info(ty).ty) {
            Some(linkage) if emitted => linkage,
            _ if self.config.weak_externals => Linkage::ExternalWeak,
            _ => Linkage::External,
        };
        let g = self.module.add_global(&name, shape, linkage);
        self.types[ty].rtti = Some(g);
        if emitted {
            self.enqueue_class(ty);
        }
        g
    }

    /// Set the descriptor body, and its contents when the type is local
    pub(crate) fn emit_rtti(&mut self, class: ClassId) -> CompileResult<()> {
        let c = self.classes[class.0 as usize].clone();
        let info = self.type_info(c.ty).clone();
        let local = self.type_ref_linkage(&info.ty).is_some();
        let shapes = self.rtti_types();
        let IrType::Struct(sid) = c.rtti_type else { return Ok(()) };

        let base = match c.base {
            Some(b) => Constant::GlobalAddr(self.classes[b.0 as usize].rtti),
            None => Constant::Null,
        };
        let concrete = !info.def.map(|d| self.asm.type_def(d).is_abstract).unwrap_or(false);
        let (module, token) = match info.def {
            Some(d) => (self.asm.type_def(d).module, self.asm.type_def(d).token),
            None => (ModuleId::MAIN, 0),
        };
        let identity = Constant::Struct {
            ty: shapes.identity,
            fields: vec![Constant::GlobalAddr(self.module_name_global(module)), Constant::i32(token as i32)],
        };
        let extra = self.extra_type_info(c.ty, &info.ty)?;
        let head = vec![base, Constant::i8(concrete as i8), identity, extra, Constant::Null];

        if info.is_interface {
            self.module.set_struct_body(sid, vec![IrType::Ptr, IrType::I8, shapes.identity, IrType::Ptr, IrType::Ptr], false);
            if local {
                self.module.set_initializer(c.rtti, Constant::Struct { ty: c.rtti_type, fields: head });
            }
            return Ok(());
        }

        let iptr = self.target.int_ptr_type();
        let imt_ty = self.module.array_of(IrType::Ptr, IMT_SIZE as u64);
        let vtable_ty = self.module.array_of(IrType::Ptr, c.vtable.len() as u64);
        self.module.set_struct_body(
            sid,
            vec![
                IrType::Ptr,
                IrType::I8,
                shapes.identity,
                IrType::Ptr,
                IrType::Ptr,
                IrType::I32,
                IrType::I32,
                IrType::Ptr,
                IrType::Ptr,
                IrType::I8,
                iptr,
                iptr,
                imt_ty,
                IrType::I32,
                vtable_ty,
                c.statics_type,
            ],
            false,
        );
        if !local {
            return Ok(());
        }

        let chain: Vec<Constant> =
            self.class_chain(class).iter().map(|k| Constant::GlobalAddr(self.classes[k.0 as usize].rtti)).collect();
        let supertypes = self.private_pointer_array(&format!("{}.supertypes", info.name), chain);

        let mut ifaces = Vec::with_capacity(c.interfaces.len());
        for iface in &c.interfaces {
            ifaces.push(Constant::GlobalAddr(self.rtti_global(*iface)));
        }
        let interfaces = if ifaces.is_empty() {
            Constant::Null
        } else {
            self.private_pointer_array(&format!("{}.interfaces", info.name), ifaces)
        };

        let object_size = self.target.size_of(&self.module, info.object);
        let element_size = match info.element {
            Some(e) if info.is_array() => self.value_size(e)?,
            _ => 0,
        };

        let imt = self.imt_constant(class)?;
        let mut slots = Vec::with_capacity(c.vtable.len());
        for f in &c.vtable {
            slots.push(self.dispatch_address(*f)?);
        }
        let statics = self.statics_initializer(class)?;

        let mut fields = head;
        fields.extend([
            Constant::i32(c.depth as i32 + 1),
            Constant::i32(c.interfaces.len() as i32),
            supertypes,
            interfaces,
            Constant::i8(c.init.is_none() as i8),
            Constant::int(iptr, object_size as i64),
            Constant::int(iptr, element_size as i64),
            imt,
            Constant::i32(c.vtable.len() as i32),
            Constant::Array { ty: vtable_ty, elements: slots },
            statics,
        ]);
        self.module.set_initializer(c.rtti, Constant::Struct { ty: c.rtti_type, fields });
        trace!(ty = %info.name, vtable = c.vtable.len(), supertypes = c.depth + 1, "emitted descriptor");
        Ok(())
    }

    /// Element descriptor for arrays, pointers and by-refs; argument list for
    /// generic instances
    fn extra_type_info(&mut self, id: TypeId, ty: &TypeRef) -> CompileResult<Constant> {
        let tag = match ty {
            TypeRef::Array(_) => Some(ElementTag::Array),
            TypeRef::Pointer(_) => Some(ElementTag::Pointer),
            TypeRef::ByRef(_) => Some(ElementTag::ByRef),
            _ => None,
        };
        if let (Some(tag), Some(element)) = (tag, self.type_info(id).element) {
            let global = self.rtti_global(element);
            return Ok(Constant::TaggedGlobalAddr { global, tag: tag as u64 });
        }
        if let TypeRef::GenericInstance { args, .. } = ty {
            let mut elements = Vec::with_capacity(args.len() + 1);
            for arg in args {
                let arg = self.type_of(arg, Completeness::Opaque)?;
                elements.push(Constant::GlobalAddr(self.rtti_global(arg)));
            }
            elements.push(Constant::Null);
            let name = format!("{}.generic_args", self.type_info(id).name);
            return Ok(self.private_pointer_array(&name, elements));
        }
        Ok(Constant::Null)
    }

    fn private_pointer_array(&mut self, name: &str, elements: Vec<Constant>) -> Constant {
        let ty = self.module.array_of(IrType::Ptr, elements.len() as u64);
        let g = self.module.add_global(name, ty, Linkage::Private);
        self.module.global_mut(g).constant = true;
        self.module.set_initializer(g, Constant::Array { ty, elements });
        Constant::GlobalAddr(g)
    }

    /// Static block contents: zero, or the field's initial bytes
    fn statics_initializer(&mut self, class: ClassId) -> CompileResult<Constant> {
        let c = &self.classes[class.0 as usize];
        let statics = c.statics.clone();
        let statics_type = c.statics_type;
        let mut fields = Vec::with_capacity(statics.len());
        for s in &statics {
            let shape = self.type_info(s.ty).value;
            let initial = self.asm.field(s.field).initial_value.as_deref();
            fields.push(match initial {
                Some(bytes) => self.constant_from_bytes(s.ty, shape, bytes),
                None => Constant::Zero(shape),
            });
        }
        Ok(Constant::Struct { ty: statics_type, fields })
    }

    /// Little-endian decode of an initial value into a constant of `shape`
    fn constant_from_bytes(&self, ty: TypeId, shape: IrType, bytes: &[u8]) -> Constant {
        let mut raw = [0u8; 8];
        let n = bytes.len().min(8);
        raw[..n].copy_from_slice(&bytes[..n]);
        let info = self.type_info(ty);
        match shape {
            IrType::F32 => Constant::Float { ty: shape, value: f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64 },
            IrType::F64 => Constant::Float { ty: shape, value: f64::from_le_bytes(raw) },
            t if t.is_int() => {
                let bits = t.int_bits().unwrap_or(64);
                let unsigned = u64::from_le_bytes(raw);
                let value = if bits >= 64 {
                    unsigned as i64
                } else {
                    let shift = 64 - bits;
                    ((unsigned << shift) as i64) >> shift
                };
                Constant::Int { ty: t, value }
            }
            IrType::Struct(sid) if info.custom_layout => self.custom_layout_bytes(sid, shape, bytes),
            other => Constant::Zero(other),
        }
    }

    fn custom_layout_bytes(&self, sid: StructId, shape: IrType, bytes: &[u8]) -> Constant {
        let fields = self.module.struct_fields(sid);
        let [IrType::Array(block)] = fields else { return Constant::Zero(shape) };
        let len = self.module.array_type(*block).len as usize;
        let mut data = bytes.to_vec();
        data.resize(len, 0);
        Constant::Struct { ty: shape, fields: vec![Constant::Bytes(data)] }
    }

    /// Descriptor of the root object class
    pub(crate) fn object_rtti(&mut self) -> CompileResult<GlobalId> {
        let object = self.asm.well_known(WellKnown::Object)?;
        let object = self.type_of(&TypeRef::Named(object), Completeness::Opaque)?;
        Ok(self.rtti_global(object))
    }
}
