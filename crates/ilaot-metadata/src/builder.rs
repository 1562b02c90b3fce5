//! Programmatic assembly construction
//!
//! Builds an [`Assembly`] in memory so tools and tests can produce input
//! without a binary metadata reader. Branches reference [`Label`]s that are
//! resolved to byte offsets when the method body is finished.

use crate::assembly::{
    Assembly, ClassLayout, FieldDef, MetadataError, MethodDef, MethodImpl, ModuleInfo, Param,
    PInvokeInfo, TypeDef, TypeKind, WellKnown,
};
use crate::body::{ClauseKind, ExceptionClause, InstructionAt, MethodBody};
use crate::instruction::{BranchCondition, Instruction, Offset};
use crate::types::{FieldDefId, MethodDefId, ModuleId, PrimitiveType, TypeDefId, TypeRef};

const TYPE_TOKEN: u32 = 0x0200_0000;
const FIELD_TOKEN: u32 = 0x0400_0000;
const METHOD_TOKEN: u32 = 0x0600_0000;

/// Name of the core library module added by [`AssemblyBuilder::with_core_library`]
pub const CORE_LIBRARY: &str = "mscorlib";

/// Incrementally assembles definitions
pub struct AssemblyBuilder {
    asm: Assembly,
    error: Option<MetadataError>,
}

impl AssemblyBuilder {
    /// Empty assembly whose module 0 is named `name`
    pub fn new(name: &str) -> Self {
        let asm = Assembly {
            name: name.to_string(),
            modules: vec![ModuleInfo { name: name.to_string() }],
            ..Default::default()
        };
        Self { asm, error: None }
    }

    /// Assembly with a minimal core library registered as module 1
    pub fn with_core_library(name: &str) -> Self {
        let mut b = Self::new(name);
        let core = b.add_module(CORE_LIBRARY);
        add_core_types(&mut b, core);
        b
    }

    pub fn add_module(&mut self, name: &str) -> ModuleId {
        self.asm.modules.push(ModuleInfo { name: name.to_string() });
        ModuleId(self.asm.modules.len() as u32 - 1)
    }

    /// Access the assembly built so far
    pub fn assembly(&self) -> &Assembly {
        &self.asm
    }

    pub fn set_well_known(&mut self, role: WellKnown, ty: TypeDefId) {
        self.asm.well_known.insert(role, ty);
    }

    pub fn well_known(&self, role: WellKnown) -> Option<TypeDefId> {
        self.asm.well_known.get(&role).copied()
    }

    pub fn entry_point(&mut self, method: MethodDefId) {
        self.asm.entry_point = Some(method);
    }

    pub fn class(&mut self, namespace: &str, name: &str) -> TypeBuilder<'_> {
        let base = self.well_known(WellKnown::Object).map(TypeRef::Named);
        self.type_def(namespace, name, TypeKind::Class, base)
    }

    pub fn value_type(&mut self, namespace: &str, name: &str) -> TypeBuilder<'_> {
        let base = self.well_known(WellKnown::ValueType).map(TypeRef::Named);
        self.type_def(namespace, name, TypeKind::ValueType, base)
    }

    pub fn enum_type(&mut self, namespace: &str, name: &str, underlying: PrimitiveType) -> TypeBuilder<'_> {
        let base = self.well_known(WellKnown::Enum).map(TypeRef::Named);
        self.type_def(namespace, name, TypeKind::Enum { underlying }, base)
    }

    pub fn interface(&mut self, namespace: &str, name: &str) -> TypeBuilder<'_> {
        let mut builder = self.type_def(namespace, name, TypeKind::Interface, None);
        builder.def.is_abstract = true;
        builder
    }

    fn type_def(&mut self, namespace: &str, name: &str, kind: TypeKind, base: Option<TypeRef>) -> TypeBuilder<'_> {
        let token = TYPE_TOKEN | (self.asm.types.len() as u32 + 1);
        let def = TypeDef {
            namespace: namespace.to_string(),
            name: name.to_string(),
            module: ModuleId::MAIN,
            token,
            kind,
            is_abstract: false,
            is_sealed: false,
            base,
            interfaces: Vec::new(),
            generic_params: Vec::new(),
            layout: ClassLayout::Auto,
            class_size: None,
            fields: Vec::new(),
            methods: Vec::new(),
            nested: Vec::new(),
            declaring: None,
        };
        TypeBuilder { owner: self, def }
    }

    /// Instance field
    pub fn field(&mut self, ty: TypeDefId, name: &str, field_ty: TypeRef) -> FieldDefId {
        self.push_field(ty, name, field_ty, false, None, None)
    }

    /// Instance field at an explicit byte offset
    pub fn field_at(&mut self, ty: TypeDefId, name: &str, field_ty: TypeRef, offset: u32) -> FieldDefId {
        self.push_field(ty, name, field_ty, false, Some(offset), None)
    }

    pub fn static_field(&mut self, ty: TypeDefId, name: &str, field_ty: TypeRef) -> FieldDefId {
        self.push_field(ty, name, field_ty, true, None, None)
    }

    /// Static field with initial contents
    pub fn static_field_with_data(&mut self, ty: TypeDefId, name: &str, field_ty: TypeRef, data: Vec<u8>) -> FieldDefId {
        self.push_field(ty, name, field_ty, true, None, Some(data))
    }

    fn push_field(
        &mut self,
        ty: TypeDefId,
        name: &str,
        field_ty: TypeRef,
        is_static: bool,
        offset: Option<u32>,
        initial_value: Option<Vec<u8>>,
    ) -> FieldDefId {
        let id = FieldDefId(self.asm.fields.len() as u32);
        self.asm.fields.push(FieldDef {
            declaring: ty,
            name: name.to_string(),
            ty: field_ty,
            is_static,
            offset,
            initial_value,
        });
        if let Some(def) = self.asm.types.get_mut(ty.0 as usize) {
            def.fields.push(id);
        } else {
            self.record(MetadataError::UnknownType(ty.0));
        }
        id
    }

    /// Method returning `void` with no parameters until configured
    pub fn method(&mut self, ty: TypeDefId, name: &str) -> MethodBuilder<'_> {
        let token = METHOD_TOKEN | (self.asm.methods.len() as u32 + 1);
        let def = MethodDef {
            declaring: ty,
            name: name.to_string(),
            token,
            is_static: false,
            is_virtual: false,
            is_new_slot: false,
            is_abstract: false,
            is_special_name: false,
            implementation: MethodImpl::Il,
            generic_params: Vec::new(),
            params: Vec::new(),
            ret: TypeRef::VOID,
            body: None,
        };
        MethodBuilder { owner: self, def }
    }

    /// Instance constructor
    pub fn ctor(&mut self, ty: TypeDefId) -> MethodBuilder<'_> {
        let mut m = self.method(ty, ".ctor");
        m.def.is_special_name = true;
        m
    }

    /// Static constructor
    pub fn cctor(&mut self, ty: TypeDefId) -> MethodBuilder<'_> {
        let mut m = self.method(ty, ".cctor");
        m.def.is_special_name = true;
        m.def.is_static = true;
        m
    }

    fn record(&mut self, error: MetadataError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Finish and validate the assembly
    pub fn build(self) -> Result<Assembly, MetadataError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.asm.validate()?;
        Ok(self.asm)
    }
}

/// Configures one type definition
pub struct TypeBuilder<'a> {
    owner: &'a mut AssemblyBuilder,
    def: TypeDef,
}

impl TypeBuilder<'_> {
    pub fn base(mut self, base: TypeRef) -> Self {
        self.def.base = Some(base);
        self
    }

    pub fn no_base(mut self) -> Self {
        self.def.base = None;
        self
    }

    pub fn implements(mut self, iface: TypeRef) -> Self {
        self.def.interfaces.push(iface);
        self
    }

    pub fn generic_param(mut self, name: &str) -> Self {
        self.def.generic_params.push(name.to_string());
        self
    }

    pub fn layout(mut self, layout: ClassLayout) -> Self {
        self.def.layout = layout;
        self
    }

    pub fn class_size(mut self, size: u32) -> Self {
        self.def.class_size = Some(size);
        self
    }

    pub fn abstract_(mut self) -> Self {
        self.def.is_abstract = true;
        self
    }

    pub fn sealed(mut self) -> Self {
        self.def.is_sealed = true;
        self
    }

    pub fn module(mut self, module: ModuleId) -> Self {
        self.def.module = module;
        self
    }

    pub fn nested_in(mut self, outer: TypeDefId) -> Self {
        self.def.declaring = Some(outer);
        self
    }

    pub fn finish(self) -> TypeDefId {
        let id = TypeDefId(self.owner.asm.types.len() as u32);
        if let Some(outer) = self.def.declaring {
            match self.owner.asm.types.get_mut(outer.0 as usize) {
                Some(outer) => outer.nested.push(id),
                None => self.owner.record(MetadataError::UnknownType(outer.0)),
            }
        }
        self.owner.asm.types.push(self.def);
        id
    }
}

/// Configures one method definition
pub struct MethodBuilder<'a> {
    owner: &'a mut AssemblyBuilder,
    def: MethodDef,
}

impl MethodBuilder<'_> {
    pub fn static_(mut self) -> Self {
        self.def.is_static = true;
        self
    }

    /// Virtual method occupying a fresh slot
    pub fn virtual_(mut self) -> Self {
        self.def.is_virtual = true;
        self.def.is_new_slot = true;
        self
    }

    /// Virtual method reusing an inherited slot
    pub fn override_(mut self) -> Self {
        self.def.is_virtual = true;
        self.def.is_new_slot = false;
        self
    }

    pub fn abstract_(mut self) -> Self {
        self.def.is_abstract = true;
        self
    }

    pub fn special_name(mut self) -> Self {
        self.def.is_special_name = true;
        self
    }

    pub fn generic_param(mut self, name: &str) -> Self {
        self.def.generic_params.push(name.to_string());
        self
    }

    pub fn param(mut self, name: &str, ty: TypeRef) -> Self {
        self.def.params.push(Param { name: name.to_string(), ty });
        self
    }

    pub fn returns(mut self, ty: TypeRef) -> Self {
        self.def.ret = ty;
        self
    }

    pub fn internal_call(mut self) -> Self {
        self.def.implementation = MethodImpl::InternalCall;
        self
    }

    pub fn runtime(mut self) -> Self {
        self.def.implementation = MethodImpl::Runtime;
        self
    }

    pub fn pinvoke(mut self, module: &str, entry_point: &str) -> Self {
        self.def.implementation = MethodImpl::PInvoke(PInvokeInfo {
            module: module.to_string(),
            entry_point: entry_point.to_string(),
            attributes: 0,
        });
        self.def.is_static = true;
        self
    }

    /// Attach an IL body assembled by `f`
    pub fn body(mut self, f: impl FnOnce(&mut BodyBuilder)) -> Self {
        let mut body = BodyBuilder::new();
        f(&mut body);
        match body.build() {
            Ok(body) => self.def.body = Some(body),
            Err(e) => self.owner.record(e),
        }
        self
    }

    pub fn finish(self) -> MethodDefId {
        let id = MethodDefId(self.owner.asm.methods.len() as u32);
        match self.owner.asm.types.get_mut(self.def.declaring.0 as usize) {
            Some(ty) => ty.methods.push(id),
            None => self.owner.record(MetadataError::UnknownType(self.def.declaring.0)),
        }
        self.owner.asm.methods.push(self.def);
        id
    }
}

/// A position in a body under construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

/// Assembles an instruction list with symbolic branch targets
#[derive(Default)]
pub struct BodyBuilder {
    instructions: Vec<Instruction>,
    /// Instruction index each label is placed at
    labels: Vec<Option<usize>>,
    /// Branch instruction index and the labels of its targets, in order
    fixups: Vec<(usize, Vec<Label>)>,
    clauses: Vec<(ClauseKind, [Label; 4])>,
    locals: Vec<TypeRef>,
}

impl BodyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a local and return its index
    pub fn local(&mut self, ty: TypeRef) -> u16 {
        self.locals.push(ty);
        self.locals.len() as u16 - 1
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Place `label` at the next emitted instruction
    pub fn mark(&mut self, label: Label) {
        self.labels[label.0 as usize] = Some(self.instructions.len());
    }

    /// New label placed at the next emitted instruction
    pub fn here(&mut self) -> Label {
        let l = self.label();
        self.mark(l);
        l
    }

    pub fn emit(&mut self, instr: Instruction) -> &mut Self {
        self.instructions.push(instr);
        self
    }

    fn emit_branch(&mut self, instr: Instruction, targets: Vec<Label>) -> &mut Self {
        self.fixups.push((self.instructions.len(), targets));
        self.emit(instr)
    }

    pub fn br(&mut self, target: Label) -> &mut Self {
        self.emit_branch(Instruction::Br(0), vec![target])
    }

    pub fn brtrue(&mut self, target: Label) -> &mut Self {
        self.emit_branch(Instruction::Brtrue(0), vec![target])
    }

    pub fn brfalse(&mut self, target: Label) -> &mut Self {
        self.emit_branch(Instruction::Brfalse(0), vec![target])
    }

    pub fn branch(&mut self, cond: BranchCondition, target: Label) -> &mut Self {
        self.emit_branch(Instruction::Branch { cond, target: 0 }, vec![target])
    }

    pub fn leave(&mut self, target: Label) -> &mut Self {
        self.emit_branch(Instruction::Leave(0), vec![target])
    }

    pub fn switch(&mut self, targets: &[Label]) -> &mut Self {
        self.emit_branch(Instruction::Switch(vec![0; targets.len()]), targets.to_vec())
    }

    /// Register an exception clause from label-delimited ranges
    pub fn clause(&mut self, kind: ClauseKind, try_start: Label, try_end: Label, handler_start: Label, handler_end: Label) {
        self.clauses.push((kind, [try_start, try_end, handler_start, handler_end]));
    }

    /// Resolve labels and lay instructions out at their encoded offsets
    pub fn build(self) -> Result<MethodBody, MetadataError> {
        let mut offsets = Vec::with_capacity(self.instructions.len() + 1);
        let mut offset: Offset = 0;
        for instr in &self.instructions {
            offsets.push(offset);
            offset += instr.encoded_size();
        }
        offsets.push(offset);

        let resolve = |label: Label| -> Result<Offset, MetadataError> {
            self.labels[label.0 as usize].map(|index| offsets[index]).ok_or(MetadataError::UnplacedLabel(label.0))
        };

        let mut instructions = self.instructions.clone();
        for (index, targets) in &self.fixups {
            let resolved = targets.iter().map(|l| resolve(*l)).collect::<Result<Vec<_>, _>>()?;
            for (slot, value) in instructions[*index].branch_targets_mut().into_iter().zip(resolved) {
                *slot = value;
            }
        }

        let mut exception_clauses = Vec::with_capacity(self.clauses.len());
        for (kind, [ts, te, hs, he]) in &self.clauses {
            exception_clauses.push(ExceptionClause {
                kind: kind.clone(),
                try_start: resolve(*ts)?,
                try_end: resolve(*te)?,
                handler_start: resolve(*hs)?,
                handler_end: resolve(*he)?,
            });
        }

        let instructions = instructions
            .into_iter()
            .zip(offsets.iter())
            .map(|(instr, offset)| InstructionAt { offset: *offset, instr })
            .collect();

        Ok(MethodBody { locals: self.locals, init_locals: true, instructions, exception_clauses })
    }
}

fn add_core_types(b: &mut AssemblyBuilder, core: ModuleId) {
    let object = b.class("System", "Object").no_base().module(core).finish();
    b.set_well_known(WellKnown::Object, object);
    b.ctor(object).finish();

    let string = b.class("System", "String").sealed().module(core).finish();
    b.set_well_known(WellKnown::String, string);
    b.field(string, "m_stringLength", TypeRef::INT32);
    b.field(string, "m_firstChar", TypeRef::Primitive(PrimitiveType::Char));

    b.method(object, "ToString").virtual_().returns(TypeRef::Named(string)).finish();
    b.method(object, "GetHashCode").virtual_().returns(TypeRef::INT32).finish();

    let value_type = b.class("System", "ValueType").abstract_().module(core).finish();
    b.set_well_known(WellKnown::ValueType, value_type);

    let enum_ = b.class("System", "Enum").base(TypeRef::Named(value_type)).abstract_().module(core).finish();
    b.set_well_known(WellKnown::Enum, enum_);

    let exception = b.class("System", "Exception").module(core).finish();
    b.set_well_known(WellKnown::Exception, exception);
    b.ctor(exception).finish();

    let delegate = b.class("System", "Delegate").abstract_().module(core).finish();
    b.set_well_known(WellKnown::Delegate, delegate);
    b.field(delegate, "_target", TypeRef::Named(object));
    b.field(delegate, "_methodPtr", TypeRef::INTPTR);
    let multicast = b
        .class("System", "MulticastDelegate")
        .base(TypeRef::Named(delegate))
        .abstract_()
        .module(core)
        .finish();
    b.set_well_known(WellKnown::MulticastDelegate, multicast);

    let generic = "System.Collections.Generic";
    let t = TypeRef::type_param(0);
    let instance = |def: TypeDefId| TypeRef::GenericInstance { def, args: vec![TypeRef::type_param(0)] };

    let enumerable = b.interface(generic, "IEnumerable`1").generic_param("T").module(core).finish();
    b.set_well_known(WellKnown::IEnumerable, enumerable);

    let collection = b
        .interface(generic, "ICollection`1")
        .generic_param("T")
        .implements(instance(enumerable))
        .module(core)
        .finish();
    b.set_well_known(WellKnown::ICollection, collection);
    b.method(collection, "get_Count").virtual_().abstract_().special_name().returns(TypeRef::INT32).finish();

    let list = b
        .interface(generic, "IList`1")
        .generic_param("T")
        .implements(instance(collection))
        .implements(instance(enumerable))
        .module(core)
        .finish();
    b.set_well_known(WellKnown::IList, list);
    b.method(list, "get_Item")
        .virtual_()
        .abstract_()
        .special_name()
        .param("index", TypeRef::INT32)
        .returns(t.clone())
        .finish();

    let ro_collection = b
        .interface(generic, "IReadOnlyCollection`1")
        .generic_param("T")
        .implements(instance(enumerable))
        .module(core)
        .finish();
    b.set_well_known(WellKnown::IReadOnlyCollection, ro_collection);

    let ro_list = b
        .interface(generic, "IReadOnlyList`1")
        .generic_param("T")
        .implements(instance(ro_collection))
        .implements(instance(enumerable))
        .module(core)
        .finish();
    b.set_well_known(WellKnown::IReadOnlyList, ro_list);

    let array = b.class("System", "Array").abstract_().module(core).finish();
    b.set_well_known(WellKnown::Array, array);
    b.method(array, "InternalArray_get_Count").generic_param("T").returns(TypeRef::INT32).finish();
    b.method(array, "InternalArray_get_Item")
        .generic_param("T")
        .param("index", TypeRef::INT32)
        .returns(TypeRef::method_param(0))
        .finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_resolve_to_offsets() {
        let mut body = BodyBuilder::new();
        let end = body.label();
        body.emit(Instruction::LdcI4(0));
        body.brfalse(end);
        body.emit(Instruction::Nop);
        body.mark(end);
        body.emit(Instruction::Ret);
        let body = body.build().unwrap();

        assert_eq!(body.instructions[1].instr, Instruction::Brfalse(11));
        assert_eq!(body.instructions[3].offset, 11);
    }

    #[test]
    fn test_unplaced_label_is_an_error() {
        let mut body = BodyBuilder::new();
        let nowhere = body.label();
        body.br(nowhere);
        assert!(matches!(body.build(), Err(MetadataError::UnplacedLabel(0))));
    }

    #[test]
    fn test_core_library_roles() {
        let asm = AssemblyBuilder::with_core_library("App").build().unwrap();
        let object = asm.well_known(WellKnown::Object).unwrap();
        assert_eq!(asm.type_full_name(object), "System.Object");
        assert_eq!(asm.type_def(object).module, ModuleId(1));
        for role in WellKnown::ARRAY_INTERFACES {
            assert!(asm.type_def(asm.well_known(role).unwrap()).is_interface());
        }
    }

    #[test]
    fn test_clause_offsets() {
        let mut body = BodyBuilder::new();
        let try_start = body.here();
        body.emit(Instruction::Nop);
        let out = body.label();
        body.leave(out);
        let handler = body.here();
        body.emit(Instruction::Endfinally);
        let handler_end = body.here();
        body.mark(out);
        body.emit(Instruction::Ret);
        body.clause(ClauseKind::Finally, try_start, handler, handler, handler_end);
        let body = body.build().unwrap();

        let clause = &body.exception_clauses[0];
        assert_eq!((clause.try_start, clause.try_end), (0, 6));
        assert_eq!((clause.handler_start, clause.handler_end), (6, 7));
        assert_eq!(body.instructions[1].instr, Instruction::Leave(7));
    }
}
