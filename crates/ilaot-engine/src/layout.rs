//! Type & layout engine
//!
//! Maps closed type references to native shapes:
//!
//! - *data*: raw fields without header
//! - *value*: what a local, argument or field of the type occupies
//! - *object*: header + data, for reference instances and boxed values
//!
//! Types are created lazily and completed in stages so recursive type graphs
//! can refer to each other before their bodies are known.

use std::ops::{Index, IndexMut};

use ilaot_metadata::{ClassLayout, FieldDefId, PrimitiveType, TypeDefId, TypeKind, TypeRef, WellKnown};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::compiler::Compiler;
use crate::error::{CompileError, CompileResult};
use crate::ir::{align_to, GlobalId, IrType, StructId};
use crate::resolver::{resolve_strict, GenericContext};

/// Handle into the type table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

/// Classification of a value on the evaluation stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackCategory {
    Unknown,
    Int32,
    Int64,
    NativeInt,
    Float,
    Value,
    Object,
    Reference,
}

/// Completion stage of a type; only ever increases
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Completeness {
    /// Identity and category fixed, bodies may be empty
    Opaque,
    /// Usable on the stack: value-type bodies are final
    StackComplete,
    /// Every body is final and field locators are assigned
    TypeComplete,
    /// Class descriptor built
    VTableEmitted,
}

/// Where a field lives inside its declaring type's data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldLocator {
    /// Index into the data struct
    Index(u32),
    /// Byte offset into the custom-layout byte block
    Offset(u32),
}

/// An instance field of a laid-out type
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub field: FieldDefId,
    pub declaring: TypeId,
    pub ty: TypeId,
    pub locator: FieldLocator,
}

/// Descriptor of one closed type
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub id: TypeId,
    pub ty: TypeRef,
    pub name: String,
    /// Definition backing the type (primitives map to their core library type)
    pub def: Option<TypeDefId>,
    pub category: StackCategory,
    pub data: IrType,
    pub value: IrType,
    pub object: IrType,
    pub state: Completeness,
    /// Hierarchy parent, used for class layout and supertype checks
    pub base: Option<TypeId>,
    /// Number of ancestors
    pub depth: u32,
    /// Element of arrays, pointers and by-refs
    pub element: Option<TypeId>,
    /// Own instance fields, in declaration order
    pub fields: Vec<FieldInfo>,
    pub is_value_type: bool,
    pub is_interface: bool,
    pub custom_layout: bool,
    /// Index of the byte block in the data struct under custom layout
    pub bytes_index: Option<u32>,
    /// Interfaces granted by shape rather than by declaration
    pub implicit_interfaces: Vec<TypeRef>,
    /// Runtime type descriptor global, declared on first use
    pub rtti: Option<GlobalId>,
    body_done: bool,
    in_progress: bool,
}

impl TypeInfo {
    pub fn data_struct(&self) -> Option<StructId> {
        match self.data {
            IrType::Struct(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self.ty, TypeRef::Array(_))
    }

    pub fn primitive(&self) -> Option<PrimitiveType> {
        match self.ty {
            TypeRef::Primitive(p) => Some(p),
            _ => None,
        }
    }
}

/// Global table of type descriptors, keyed by closed identity
#[derive(Debug, Default)]
pub struct TypeTable {
    infos: Vec<TypeInfo>,
    index: FxHashMap<TypeRef, TypeId>,
}

impl TypeTable {
    pub fn lookup(&self, ty: &TypeRef) -> Option<TypeId> {
        self.index.get(ty).copied()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeInfo> {
        self.infos.iter()
    }

    fn insert(&mut self, info: TypeInfo) -> TypeId {
        let id = info.id;
        self.index.insert(info.ty.clone(), id);
        self.infos.push(info);
        id
    }
}

impl Index<TypeId> for TypeTable {
    type Output = TypeInfo;

    fn index(&self, id: TypeId) -> &TypeInfo {
        &self.infos[id.0 as usize]
    }
}

impl IndexMut<TypeId> for TypeTable {
    fn index_mut(&mut self, id: TypeId) -> &mut TypeInfo {
        &mut self.infos[id.0 as usize]
    }
}

impl<'a> Compiler<'a> {
    /// Descriptor for `ty`, advanced to at least `min`
    pub fn type_of(&mut self, ty: &TypeRef, min: Completeness) -> CompileResult<TypeId> {
        let ty = self.canonical(ty);
        let id = match self.types.lookup(&ty) {
            Some(id) => id,
            None => self.create_type(ty)?,
        };
        self.ensure(id, min)?;
        Ok(id)
    }

    pub fn type_info(&self, id: TypeId) -> &TypeInfo {
        &self.types[id]
    }

    /// Named references to core primitive definitions share the primitive identity
    fn canonical(&self, ty: &TypeRef) -> TypeRef {
        if let TypeRef::Named(def) = ty {
            let d = self.asm.type_def(*def);
            if d.namespace == "System" && d.declaring.is_none() {
                if let Some(p) = PrimitiveType::from_full_name(&self.asm.type_full_name(*def)) {
                    return TypeRef::Primitive(p);
                }
            }
        }
        ty.clone()
    }

    /// Advance a type to at least `min`; lower requests are no-ops
    pub fn ensure(&mut self, id: TypeId, min: Completeness) -> CompileResult<()> {
        let info = &self.types[id];
        if info.state >= min {
            return Ok(());
        }
        let needs_body = min >= Completeness::TypeComplete
            || (min >= Completeness::StackComplete && info.category == StackCategory::Value);
        if needs_body {
            self.finish_body(id)?;
        }
        if min == Completeness::VTableEmitted {
            self.ensure(id, Completeness::TypeComplete)?;
            self.types[id].state = Completeness::VTableEmitted;
            self.class_of(id)?;
        } else {
            let info = &mut self.types[id];
            info.state = info.state.max(min);
        }
        Ok(())
    }

    /// IR integer type used for a primitive
    pub(crate) fn primitive_shape(&self, p: PrimitiveType) -> (StackCategory, IrType) {
        match p {
            PrimitiveType::Void => (StackCategory::Unknown, IrType::Void),
            PrimitiveType::Boolean | PrimitiveType::I1 | PrimitiveType::U1 => (StackCategory::Int32, IrType::I8),
            PrimitiveType::Char => (StackCategory::Int32, IrType::int(self.config.char_encoding.unit_bits())),
            PrimitiveType::I2 | PrimitiveType::U2 => (StackCategory::Int32, IrType::I16),
            PrimitiveType::I4 | PrimitiveType::U4 => (StackCategory::Int32, IrType::I32),
            PrimitiveType::I8 | PrimitiveType::U8 => (StackCategory::Int64, IrType::I64),
            PrimitiveType::I | PrimitiveType::U => (StackCategory::NativeInt, self.target.int_ptr_type()),
            PrimitiveType::R4 => (StackCategory::Float, IrType::F32),
            PrimitiveType::R8 => (StackCategory::Float, IrType::F64),
        }
    }

    fn create_type(&mut self, ty: TypeRef) -> CompileResult<TypeId> {
        if !ty.is_closed() {
            return Err(CompileError::GenericResolutionFailure { ty: ty.display(self.asm).to_string() });
        }
        let id = TypeId(self.types.len() as u32);
        let name = ty.display(self.asm).to_string();
        let mut info = TypeInfo {
            id,
            ty: ty.clone(),
            name: name.clone(),
            def: ty.def_id(),
            category: StackCategory::Unknown,
            data: IrType::Void,
            value: IrType::Void,
            object: IrType::Void,
            state: Completeness::Opaque,
            base: None,
            depth: 0,
            element: None,
            fields: Vec::new(),
            is_value_type: false,
            is_interface: false,
            custom_layout: false,
            bytes_index: None,
            implicit_interfaces: Vec::new(),
            rtti: None,
            body_done: true,
            in_progress: false,
        };

        match &ty {
            TypeRef::Primitive(p) => {
                let (category, shape) = self.primitive_shape(*p);
                info.category = category;
                info.data = shape;
                info.value = shape;
                if *p != PrimitiveType::Void {
                    info.is_value_type = true;
                    info.def = self.asm.find_type("System", &p.full_name()["System.".len()..]);
                    info.object = self.object_shape(&name, shape);
                }
            }
            TypeRef::Pointer(_) => {
                info.category = StackCategory::NativeInt;
                info.data = IrType::Ptr;
                info.value = IrType::Ptr;
                info.object = IrType::Ptr;
            }
            TypeRef::ByRef(_) => {
                info.category = StackCategory::Reference;
                info.data = IrType::Ptr;
                info.value = IrType::Ptr;
                info.object = IrType::Ptr;
            }
            TypeRef::Array(elem) => {
                let iptr = self.target.int_ptr_type();
                info.category = StackCategory::Object;
                info.data = self.module.struct_with_body(&name, vec![iptr, IrType::Ptr]);
                info.value = IrType::Ptr;
                info.object = self.object_shape(&name, info.data);
                info.implicit_interfaces = self.implicit_interfaces(elem);
                info.def = None;
            }
            TypeRef::Named(def) | TypeRef::GenericInstance { def, .. } => {
                let d = self.asm.type_def(*def);
                match d.kind {
                    TypeKind::Interface => {
                        info.category = StackCategory::Object;
                        info.is_interface = true;
                        info.data = self.module.struct_with_body(&name, Vec::new());
                        info.value = IrType::Ptr;
                        info.object = self.object_shape(&name, info.data);
                    }
                    TypeKind::Enum { underlying } => {
                        let (category, shape) = self.primitive_shape(underlying);
                        info.category = category;
                        info.is_value_type = true;
                        info.data = shape;
                        info.value = shape;
                        info.object = self.object_shape(&name, shape);
                    }
                    TypeKind::ValueType => {
                        let data = IrType::Struct(self.module.declare_struct(&name));
                        info.category = StackCategory::Value;
                        info.is_value_type = true;
                        info.custom_layout = d.has_custom_layout();
                        info.data = data;
                        info.value = data;
                        info.object = self.object_shape(&name, data);
                        info.body_done = false;
                    }
                    TypeKind::Class => {
                        let data = IrType::Struct(self.module.declare_struct(&name));
                        info.category = StackCategory::Object;
                        info.custom_layout = d.has_custom_layout();
                        info.data = data;
                        info.value = IrType::Ptr;
                        info.object = self.object_shape(&name, data);
                        info.body_done = false;
                    }
                }
            }
            TypeRef::GenericParam { .. } => return Err(CompileError::GenericResolutionFailure { ty: name }),
        }

        trace!(ty = %name, category = ?info.category, "created type");
        let id = self.types.insert(info);

        // Links are filled after insertion so cyclic references find the entry
        let element = ty.element().cloned();
        if let Some(element) = element {
            let elem = self.type_of(&element, Completeness::Opaque)?;
            self.types[id].element = Some(elem);
        }
        if let Some(base) = self.hierarchy_base(&ty)? {
            let base = self.type_of(&base, Completeness::Opaque)?;
            let depth = self.types[base].depth + 1;
            let info = &mut self.types[id];
            info.base = Some(base);
            info.depth = depth;
        }
        Ok(id)
    }

    fn object_shape(&mut self, name: &str, data: IrType) -> IrType {
        self.module.struct_with_body(&format!("{}.object", name), vec![IrType::Ptr, data])
    }

    /// Parent in the class hierarchy, resolved in the type's own context
    fn hierarchy_base(&self, ty: &TypeRef) -> CompileResult<Option<TypeRef>> {
        let well_known = |role| self.asm.well_known(role).ok().map(TypeRef::Named);
        Ok(match ty {
            TypeRef::Primitive(PrimitiveType::Void) => None,
            TypeRef::Primitive(_) => well_known(WellKnown::ValueType),
            TypeRef::Array(_) => well_known(WellKnown::Array).or_else(|| well_known(WellKnown::Object)),
            TypeRef::Named(def) | TypeRef::GenericInstance { def, .. } => {
                let d = self.asm.type_def(*def);
                match &d.base {
                    Some(base) if !d.is_interface() => {
                        Some(resolve_strict(&GenericContext::for_type(ty), base, self.asm)?)
                    }
                    _ => None,
                }
            }
            _ => None,
        })
    }

    /// Interfaces granted by shape: `T[]` conforms to the list family over `T`
    fn implicit_interfaces(&self, element: &TypeRef) -> Vec<TypeRef> {
        WellKnown::ARRAY_INTERFACES
            .iter()
            .filter_map(|role| self.asm.well_known(*role).ok())
            .map(|def| TypeRef::GenericInstance { def, args: vec![element.clone()] })
            .collect()
    }

    /// Fill the data struct of a class or value type and assign field locators
    fn finish_body(&mut self, id: TypeId) -> CompileResult<()> {
        let info = &self.types[id];
        if info.body_done {
            return Ok(());
        }
        if info.in_progress {
            if info.category == StackCategory::Value {
                return Err(CompileError::malformed(format!("value type {} contains itself", info.name)));
            }
            return Ok(());
        }
        self.types[id].in_progress = true;
        let result = self.layout_fields(id);
        let info = &mut self.types[id];
        info.in_progress = false;
        result?;
        info.body_done = true;
        debug!(ty = %info.name, fields = info.fields.len(), custom = info.custom_layout, "laid out type");
        Ok(())
    }

    fn layout_fields(&mut self, id: TypeId) -> CompileResult<()> {
        let info = &self.types[id];
        let ty = info.ty.clone();
        let category = info.category;
        let custom = info.custom_layout;
        let data_id = info.data_struct().ok_or_else(|| CompileError::malformed("aggregate without data struct"))?;
        let def_id = info.def.ok_or_else(|| CompileError::malformed("aggregate without definition"))?;
        let def = self.asm.type_def(def_id);

        let mut elements = Vec::new();
        if category == StackCategory::Object {
            if let Some(base) = self.types[id].base {
                self.ensure(base, Completeness::TypeComplete)?;
                elements.push(self.types[base].data);
            }
        }

        let ctx = GenericContext::for_type(&ty);
        let mut fields = Vec::new();
        for &field in &def.fields {
            let fd = self.asm.field(field);
            if fd.is_static {
                continue;
            }
            let fty = resolve_strict(&ctx, &fd.ty, self.asm)?;
            let fid = self.type_of(&fty, Completeness::StackComplete)?;
            fields.push((field, fid));
        }

        let mut infos = Vec::with_capacity(fields.len());
        if custom {
            let mut end = 0u64;
            let mut offset = 0u64;
            for &(field, fid) in &fields {
                let shape = self.types[fid].value;
                let size = self.target.size_of(&self.module, shape);
                let at = match def.layout {
                    ClassLayout::Explicit => match self.asm.field(field).offset {
                        Some(off) => off as u64,
                        None => {
                            return Err(CompileError::malformed(format!(
                                "field {} of explicit layout type has no offset",
                                self.asm.field(field).name
                            )))
                        }
                    },
                    ClassLayout::Sequential { pack } => {
                        let natural = self.target.align_of(&self.module, shape);
                        align_to(offset, natural.min(pack as u64).max(1))
                    }
                    ClassLayout::Auto => offset,
                };
                offset = at + size;
                end = end.max(at + size);
                infos.push(FieldInfo { field, declaring: id, ty: fid, locator: FieldLocator::Offset(at as u32) });
            }
            let size = end.max(def.class_size.unwrap_or(0) as u64);
            let bytes = self.module.array_of(IrType::I8, size);
            self.types[id].bytes_index = Some(elements.len() as u32);
            elements.push(bytes);
        } else {
            for &(field, fid) in &fields {
                let index = elements.len() as u32;
                elements.push(self.types[fid].value);
                infos.push(FieldInfo { field, declaring: id, ty: fid, locator: FieldLocator::Index(index) });
            }
        }

        self.module.set_struct_body(data_id, elements, false);
        self.types[id].fields = infos;
        Ok(())
    }

    /// Instance field of `owner` or one of its ancestors, with the number of
    /// base-embedding levels between them
    pub fn find_instance_field(&mut self, owner: TypeId, field: FieldDefId) -> CompileResult<(FieldInfo, u32)> {
        self.ensure(owner, Completeness::TypeComplete)?;
        let mut current = Some(owner);
        let mut levels = 0;
        while let Some(id) = current {
            self.ensure(id, Completeness::TypeComplete)?;
            let info = &self.types[id];
            if let Some(found) = info.fields.iter().find(|f| f.field == field) {
                return Ok((found.clone(), levels));
            }
            if info.category != StackCategory::Object {
                break;
            }
            current = info.base;
            levels += 1;
        }
        Err(CompileError::malformed(format!(
            "field {} not found on {}",
            self.asm.field(field).name,
            self.types[owner].name
        )))
    }

    /// IR type of a value of this type on the evaluation stack
    pub fn stack_type(&self, id: TypeId) -> IrType {
        let info = &self.types[id];
        match info.category {
            StackCategory::Int32 => IrType::I32,
            StackCategory::Int64 => IrType::I64,
            StackCategory::Unknown => IrType::Void,
            StackCategory::Object | StackCategory::Reference => IrType::Ptr,
            _ => info.value,
        }
    }

    /// Size in bytes of the value shape
    pub fn value_size(&mut self, id: TypeId) -> CompileResult<u64> {
        self.ensure(id, Completeness::StackComplete)?;
        Ok(self.target.size_of(&self.module, self.types[id].value))
    }

    /// Size in bytes of the object shape (header included)
    pub fn object_size(&mut self, id: TypeId) -> CompileResult<u64> {
        self.ensure(id, Completeness::TypeComplete)?;
        Ok(self.target.size_of(&self.module, self.types[id].object))
    }

    /// Whether the type is signed when treated as an integer
    pub fn is_signed(&self, id: TypeId) -> bool {
        match self.types[id].primitive() {
            Some(p) => !p.is_unsigned(),
            None => match self.types[id].def.map(|d| self.asm.type_def(d).kind) {
                Some(TypeKind::Enum { underlying }) => !underlying.is_unsigned(),
                _ => true,
            },
        }
    }
}
