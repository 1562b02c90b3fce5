//! Arguments, locals, fields, statics, indirect access and arrays

use ilaot_metadata::{ElementKind, FieldRef, IndirectKind, PrimitiveType, TypeRef};

use super::{MethodLowerer, StackValue};
use crate::class::rtti::{RTTI_INITIALIZED, RTTI_STATICS};
use crate::class::ClassId;
use crate::error::{CompileError, CompileResult};
use crate::ir::{BinOp, Callee, IntPredicate, IrType, Value};
use crate::layout::{Completeness, FieldLocator, StackCategory, TypeId};
use crate::resolver::{resolve_field, GenericContext};

impl<'c, 'a> MethodLowerer<'c, 'a> {
    // ===== Typed memory access =====

    /// Load a `ty` from memory and push it, honoring pending prefixes
    pub(super) fn load_push(&mut self, ptr: Value, ty: TypeId) -> CompileResult<()> {
        let v = self.load_value(ptr, ty)?;
        self.push_stored(ty, v);
        Ok(())
    }

    pub(super) fn load_value(&mut self, ptr: Value, ty: TypeId) -> CompileResult<Value> {
        self.cx.ensure(ty, Completeness::StackComplete)?;
        let shape = self.cx.type_info(ty).value;
        let align = self.prefixes.unaligned.map(u32::from);
        Ok(self.b.load_with(shape, ptr, self.prefixes.volatile, align))
    }

    pub(super) fn store_value(&mut self, ptr: Value, sv: StackValue, ty: TypeId) -> CompileResult<()> {
        self.cx.ensure(ty, Completeness::StackComplete)?;
        let v = self.from_stack(sv, ty)?;
        let align = self.prefixes.unaligned.map(u32::from);
        self.b.store_with(v, ptr, self.prefixes.volatile, align);
        Ok(())
    }

    /// Zero the storage of a `ty` at `ptr`
    pub(super) fn zero_fill(&mut self, ptr: Value, ty: TypeId) -> CompileResult<()> {
        let shape = self.cx.type_info(ty).value;
        if shape.is_aggregate() {
            let size = self.cx.value_size(ty)?;
            let len = self.iptr_const(size);
            self.b.memset(ptr, Value::i8(0), len);
        } else {
            self.b.store(crate::compiler::zero_value(shape), ptr);
        }
        Ok(())
    }

    // ===== Arguments and locals =====

    fn arg(&self, index: u16) -> CompileResult<super::Slot> {
        self.args
            .get(index as usize)
            .copied()
            .ok_or_else(|| CompileError::malformed(format!("argument {} out of range", index)))
    }

    fn local(&self, index: u16) -> CompileResult<super::Slot> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or_else(|| CompileError::malformed(format!("local {} out of range", index)))
    }

    pub(super) fn lower_ldarg(&mut self, index: u16) -> CompileResult<()> {
        let slot = self.arg(index)?;
        self.load_push(slot.ptr, slot.ty)
    }

    pub(super) fn lower_ldarga(&mut self, index: u16) -> CompileResult<()> {
        let slot = self.arg(index)?;
        let ty = self.by_ref(slot.ty)?;
        self.push(ty, slot.ptr);
        Ok(())
    }

    pub(super) fn lower_starg(&mut self, index: u16) -> CompileResult<()> {
        let slot = self.arg(index)?;
        let v = self.pop()?;
        self.store_value(slot.ptr, v, slot.ty)
    }

    pub(super) fn lower_ldloc(&mut self, index: u16) -> CompileResult<()> {
        let slot = self.local(index)?;
        self.load_push(slot.ptr, slot.ty)
    }

    pub(super) fn lower_ldloca(&mut self, index: u16) -> CompileResult<()> {
        let slot = self.local(index)?;
        let ty = self.by_ref(slot.ty)?;
        self.push(ty, slot.ptr);
        Ok(())
    }

    pub(super) fn lower_stloc(&mut self, index: u16) -> CompileResult<()> {
        let slot = self.local(index)?;
        let v = self.pop()?;
        self.store_value(slot.ptr, v, slot.ty)
    }

    // ===== Instance fields =====

    /// Address of an instance field reached from `owner`
    fn field_address(&mut self, owner: StackValue, field: &FieldRef) -> CompileResult<(Value, TypeId)> {
        let ctx = GenericContext::for_method(&self.method);
        let field = resolve_field(&ctx, field);
        let declaring = self.cx.type_of(&field.declaring, Completeness::TypeComplete)?;
        let (found, levels) = self.cx.find_instance_field(declaring, field.field)?;
        let info = self.cx.type_info(declaring);
        let (object, data) = (info.object, info.data);
        let through_header = info.category == StackCategory::Object && !info.is_value_type;

        // Objects are reached through their header; values and references
        // to values point at the raw data
        let (base_ty, ptr, mut path) = match owner.category {
            StackCategory::Value => {
                let tmp = self.b.alloca(data);
                self.b.store(owner.value, tmp);
                (data, tmp, Vec::new())
            }
            StackCategory::Object => (object, owner.value, vec![1]),
            StackCategory::Reference | StackCategory::NativeInt => {
                let ptr = self.ptr_value(owner);
                if through_header {
                    (object, ptr, vec![1])
                } else {
                    (data, ptr, Vec::new())
                }
            }
            other => return Err(CompileError::malformed(format!("field access on a {:?} value", other))),
        };
        path.extend(std::iter::repeat(0).take(levels as usize));
        let address = match found.locator {
            FieldLocator::Index(index) => {
                path.push(index);
                self.b.struct_gep(base_ty, ptr, &path)
            }
            FieldLocator::Offset(offset) => {
                let bytes = self.cx.type_info(found.declaring).bytes_index.ok_or_else(|| {
                    CompileError::malformed(format!("{} has no explicit layout block", self.cx.type_info(found.declaring).name))
                })?;
                path.push(bytes);
                let block = self.b.struct_gep(base_ty, ptr, &path);
                let offset = self.iptr_const(offset as u64);
                self.b.gep(IrType::I8, block, vec![offset])
            }
        };
        Ok((address, found.ty))
    }

    pub(super) fn lower_ldfld(&mut self, field: &FieldRef) -> CompileResult<()> {
        let owner = self.pop()?;
        let (ptr, ty) = self.field_address(owner, field)?;
        self.load_push(ptr, ty)
    }

    pub(super) fn lower_ldflda(&mut self, field: &FieldRef) -> CompileResult<()> {
        let owner = self.pop()?;
        let (ptr, ty) = self.field_address(owner, field)?;
        let by_ref = self.by_ref(ty)?;
        self.push(by_ref, ptr);
        Ok(())
    }

    pub(super) fn lower_stfld(&mut self, field: &FieldRef) -> CompileResult<()> {
        let value = self.pop()?;
        let owner = self.pop()?;
        let (ptr, ty) = self.field_address(owner, field)?;
        self.store_value(ptr, value, ty)
    }

    // ===== Static fields =====

    /// Run the class initializer unless it already ran, skipped for the
    /// class whose method is being lowered
    pub(super) fn guard_class_init(&mut self, class: ClassId) -> CompileResult<()> {
        let own = self.cx.function_info(self.function).owner;
        if self.cx.class_info(class).ty == own {
            return Ok(());
        }
        let Some(init) = self.cx.class_init_fn(class) else { return Ok(()) };
        let header = self.cx.rtti_types().header;
        let rtti = Value::Global(self.cx.class_info(class).rtti);
        let flag = self.b.struct_gep(header, rtti, &[RTTI_INITIALIZED]);
        let state = self.b.load(IrType::I8, flag);
        let pending = self.b.icmp(IntPredicate::Eq, state, Value::i8(0));
        let call = self.b.create_block("cctor.init");
        let cont = self.b.create_block("cctor.cont");
        self.b.cond_br(pending, call, cont);
        self.b.switch_to_block(call);
        self.emit_call(Callee::Direct(init), Vec::new(), IrType::Void);
        self.b.br(cont);
        self.b.switch_to_block(cont);
        Ok(())
    }

    fn static_address(&mut self, field: &FieldRef) -> CompileResult<(Value, TypeId)> {
        let ctx = GenericContext::for_method(&self.method);
        let field = resolve_field(&ctx, field);
        let class = self.cx.class_for(&field.declaring)?;
        self.guard_class_init(class)?;
        let info = self.cx.class_info(class);
        let entry = info.static_field(field.field).copied().ok_or_else(|| {
            CompileError::malformed(format!("{} is not a static field", self.cx.asm.field(field.field).name))
        })?;
        let (rtti_type, rtti) = (info.rtti_type, info.rtti);
        let ptr = self.b.struct_gep(rtti_type, Value::Global(rtti), &[RTTI_STATICS, entry.index]);
        Ok((ptr, entry.ty))
    }

    pub(super) fn lower_ldsfld(&mut self, field: &FieldRef) -> CompileResult<()> {
        let (ptr, ty) = self.static_address(field)?;
        self.load_push(ptr, ty)
    }

    pub(super) fn lower_ldsflda(&mut self, field: &FieldRef) -> CompileResult<()> {
        let (ptr, ty) = self.static_address(field)?;
        let by_ref = self.by_ref(ty)?;
        self.push(by_ref, ptr);
        Ok(())
    }

    pub(super) fn lower_stsfld(&mut self, field: &FieldRef) -> CompileResult<()> {
        let value = self.pop()?;
        let (ptr, ty) = self.static_address(field)?;
        self.store_value(ptr, value, ty)
    }

    // ===== Indirect access =====

    fn indirect_type(&mut self, kind: IndirectKind) -> CompileResult<TypeId> {
        let p = match kind {
            IndirectKind::I1 => PrimitiveType::I1,
            IndirectKind::U1 => PrimitiveType::U1,
            IndirectKind::I2 => PrimitiveType::I2,
            IndirectKind::U2 => PrimitiveType::U2,
            IndirectKind::I4 => PrimitiveType::I4,
            IndirectKind::U4 => PrimitiveType::U4,
            IndirectKind::I8 => PrimitiveType::I8,
            IndirectKind::I => PrimitiveType::I,
            IndirectKind::R4 => PrimitiveType::R4,
            IndirectKind::R8 => PrimitiveType::R8,
            IndirectKind::Ref => return self.object_type(),
        };
        self.prim(p)
    }

    pub(super) fn lower_ldind(&mut self, kind: IndirectKind) -> CompileResult<()> {
        let address = self.pop()?;
        let mut ty = self.indirect_type(kind)?;
        if kind == IndirectKind::Ref {
            if let Some(element) = self.cx.type_info(address.ty).element {
                ty = element;
            }
        }
        let ptr = self.ptr_value(address);
        self.load_push(ptr, ty)
    }

    pub(super) fn lower_stind(&mut self, kind: IndirectKind) -> CompileResult<()> {
        let value = self.pop()?;
        let address = self.pop()?;
        let ty = self.indirect_type(kind)?;
        let ptr = self.ptr_value(address);
        self.store_value(ptr, value, ty)
    }

    pub(super) fn lower_ldobj(&mut self, ty: &TypeRef) -> CompileResult<()> {
        let ty = self.resolve_type(ty)?;
        let address = self.pop()?;
        let ptr = self.ptr_value(address);
        self.load_push(ptr, ty)
    }

    pub(super) fn lower_stobj(&mut self, ty: &TypeRef) -> CompileResult<()> {
        let ty = self.resolve_type(ty)?;
        let value = self.pop()?;
        let address = self.pop()?;
        let ptr = self.ptr_value(address);
        self.store_value(ptr, value, ty)
    }

    pub(super) fn lower_cpobj(&mut self, ty: &TypeRef) -> CompileResult<()> {
        let ty = self.resolve_type(ty)?;
        let src = self.pop()?;
        let dest = self.pop()?;
        let size = self.cx.value_size(ty)?;
        let (src, dest) = (self.ptr_value(src), self.ptr_value(dest));
        let len = self.iptr_const(size);
        self.b.memcpy(dest, src, len, self.prefixes.volatile);
        Ok(())
    }

    pub(super) fn lower_initobj(&mut self, ty: &TypeRef) -> CompileResult<()> {
        let ty = self.resolve_type(ty)?;
        let address = self.pop()?;
        let ptr = self.ptr_value(address);
        let size = self.cx.value_size(ty)?;
        let len = self.iptr_const(size);
        self.b.memset(ptr, Value::i8(0), len);
        Ok(())
    }

    pub(super) fn lower_sizeof(&mut self, ty: &TypeRef) -> CompileResult<()> {
        let ty = self.resolve_type(ty)?;
        let size = self.cx.value_size(ty)?;
        self.push_int32(Value::i32(size as i32))
    }

    pub(super) fn lower_localloc(&mut self) -> CompileResult<()> {
        let size = self.pop()?;
        let count = self.index_value(size);
        let ptr = self.b.alloca_array(IrType::I8, count);
        let ty = self.cx.type_of(&TypeRef::pointer_to(TypeRef::Primitive(PrimitiveType::U1)), Completeness::StackComplete)?;
        self.push(ty, ptr);
        Ok(())
    }

    // ===== Arrays =====

    /// Address of the length word of an array object
    pub(super) fn array_length_ptr(&mut self, array: Value) -> Value {
        let offset = self.iptr_const(self.cx.target.pointer_size());
        self.b.gep(IrType::I8, array, vec![offset])
    }

    /// Address of the element-data pointer of an array object
    pub(super) fn array_data_ptr(&mut self, array: Value) -> Value {
        let offset = self.iptr_const(2 * self.cx.target.pointer_size());
        self.b.gep(IrType::I8, array, vec![offset])
    }

    fn element_address(&mut self, array: StackValue, index: StackValue, element: TypeId) -> CompileResult<Value> {
        self.cx.ensure(element, Completeness::StackComplete)?;
        let slot = self.array_data_ptr(array.value);
        let data = self.b.load(IrType::Ptr, slot);
        let index = self.index_value(index);
        let shape = self.cx.type_info(element).value;
        Ok(self.b.gep(shape, data, vec![index]))
    }

    fn element_type(&mut self, kind: &ElementKind, array: StackValue) -> CompileResult<TypeId> {
        let p = match kind {
            ElementKind::I1 => PrimitiveType::I1,
            ElementKind::U1 => PrimitiveType::U1,
            ElementKind::I2 => PrimitiveType::I2,
            ElementKind::U2 => PrimitiveType::U2,
            ElementKind::I4 => PrimitiveType::I4,
            ElementKind::U4 => PrimitiveType::U4,
            ElementKind::I8 => PrimitiveType::I8,
            ElementKind::I => PrimitiveType::I,
            ElementKind::R4 => PrimitiveType::R4,
            ElementKind::R8 => PrimitiveType::R8,
            ElementKind::Any(t) => return self.resolve_type(t),
            ElementKind::Ref => {
                return match self.cx.type_info(array.ty).element {
                    Some(element) => Ok(element),
                    None => self.object_type(),
                }
            }
        };
        self.prim(p)
    }

    pub(super) fn lower_ldlen(&mut self) -> CompileResult<()> {
        let array = self.pop()?;
        let ptr = self.array_length_ptr(array.value);
        let iptr = self.iptr();
        let len = self.b.load(iptr, ptr);
        self.push_prim(PrimitiveType::U, len)
    }

    pub(super) fn lower_ldelema(&mut self, ty: &TypeRef) -> CompileResult<()> {
        let element = self.resolve_type(ty)?;
        let index = self.pop()?;
        let array = self.pop()?;
        let ptr = self.element_address(array, index, element)?;
        let by_ref = self.by_ref(element)?;
        self.push(by_ref, ptr);
        Ok(())
    }

    pub(super) fn lower_ldelem(&mut self, kind: &ElementKind) -> CompileResult<()> {
        let index = self.pop()?;
        let array = self.pop()?;
        let element = self.element_type(kind, array)?;
        let ptr = self.element_address(array, index, element)?;
        self.load_push(ptr, element)
    }

    pub(super) fn lower_stelem(&mut self, kind: &ElementKind) -> CompileResult<()> {
        let value = self.pop()?;
        let index = self.pop()?;
        let array = self.pop()?;
        let element = self.element_type(kind, array)?;
        let ptr = self.element_address(array, index, element)?;
        self.store_value(ptr, value, element)
    }

    /// Byte size of `count` elements plus the array object itself
    pub(super) fn array_allocation_size(&mut self, array: TypeId, element: TypeId, count: Value) -> CompileResult<Value> {
        let header = self.cx.object_size(array)?;
        let element_size = self.cx.value_size(element)?;
        let (element_size, header) = (self.iptr_const(element_size), self.iptr_const(header));
        let scaled = self.b.binary(BinOp::Mul, count, element_size);
        Ok(self.b.binary(BinOp::Add, scaled, header))
    }
}
