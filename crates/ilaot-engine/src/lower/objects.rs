//! Allocation, boxing, type tests, tokens and string literals

use ilaot_metadata::{MethodRef, PrimitiveType, TypeRef, WellKnown};

use super::{MethodLowerer, StackValue};
use crate::class::rtti::{RTTI_SUPERTYPES, RTTI_SUPERTYPE_COUNT};
use crate::config::CharEncoding;
use crate::error::{CompileError, CompileResult};
use crate::ir::{Callee, Constant, GlobalId, IntPredicate, IrType, Linkage, Value};
use crate::layout::{Completeness, StackCategory, TypeId};
use crate::runtime::RuntimeFn;

impl<'c, 'a> MethodLowerer<'c, 'a> {
    /// Allocate an object of class `ty` with `size` bytes
    fn allocate(&mut self, ty: TypeId, size: Value) -> CompileResult<Value> {
        let class = self.cx.class_of(ty)?;
        let rtti = Value::Global(self.cx.class_info(class).rtti);
        let alloc = self.cx.runtime_fn(RuntimeFn::AllocObject);
        self.emit_call(Callee::Direct(alloc), vec![rtti, size], IrType::Ptr)
            .ok_or_else(|| CompileError::malformed("allocation returned no object"))
    }

    fn allocate_object(&mut self, ty: TypeId) -> CompileResult<Value> {
        let size = self.cx.object_size(ty)?;
        let size = self.iptr_const(size);
        self.allocate(ty, size)
    }

    pub(super) fn lower_newobj(&mut self, ctor: &MethodRef) -> CompileResult<()> {
        let method = self.resolve_method(ctor);
        let asm = self.cx.asm;
        let def = asm.method(method.method);
        let function = self.cx.function_of(&method)?;
        let info = self.cx.function_info(function);
        let (owner, sig) = (info.owner, info.sig.clone());
        let callee = info
            .func
            .map(Callee::Direct)
            .ok_or_else(|| CompileError::malformed(format!("constructor {} has no body", info.symbol)))?;
        let args = self.pop_n(def.params.len())?;
        self.cx.ensure(owner, Completeness::TypeComplete)?;

        if self.cx.type_info(owner).is_value_type {
            let shape = self.cx.type_info(owner).value;
            let tmp = self.b.alloca(shape);
            self.zero_fill(tmp, owner)?;
            self.emit_abi_call(&sig, callee, Some(tmp), args)?;
            return self.load_push(tmp, owner);
        }

        let class = self.cx.class_of(owner)?;
        self.guard_class_init(class)?;
        let object = self.allocate_object(owner)?;
        self.emit_abi_call(&sig, callee, Some(object), args)?;
        self.push(owner, object);
        Ok(())
    }

    pub(super) fn lower_newarr(&mut self, element: &TypeRef) -> CompileResult<()> {
        let element = self.resolve_type(element)?;
        let count = self.pop()?;
        let count = self.index_value(count);
        let element_ref = self.cx.type_info(element).ty.clone();
        let array = self.cx.type_of(&TypeRef::array_of(element_ref), Completeness::TypeComplete)?;

        let size = self.array_allocation_size(array, element, count)?;
        let object = self.allocate(array, size)?;
        let len = self.array_length_ptr(object);
        self.b.store(count, len);
        let header = self.cx.object_size(array)?;
        let offset = self.iptr_const(header);
        let data = self.b.gep(IrType::I8, object, vec![offset]);
        let data_slot = self.array_data_ptr(object);
        self.b.store(data, data_slot);
        self.push(array, object);
        Ok(())
    }

    /// Copy a value into a fresh box of its type
    pub(super) fn box_value(&mut self, ty: TypeId, value: StackValue) -> CompileResult<Value> {
        let object = self.allocate_object(ty)?;
        let shape = self.cx.type_info(ty).object;
        let data = self.b.struct_gep(shape, object, &[1]);
        self.store_value(data, value, ty)?;
        Ok(object)
    }

    pub(super) fn lower_box(&mut self, ty: &TypeRef) -> CompileResult<()> {
        let ty = self.resolve_type(ty)?;
        let value = self.pop()?;
        if !self.cx.type_info(ty).is_value_type {
            self.stack.push(value);
            return Ok(());
        }
        let object = self.box_value(ty, value)?;
        let boxed = self.object_type()?;
        self.push(boxed, object);
        Ok(())
    }

    /// Raise invalid-cast unless `object` is a non-null box of exactly `ty`
    fn check_exact(&mut self, object: Value, ty: TypeId) -> CompileResult<()> {
        let rtti = self.cx.rtti_global(ty);
        let not_null = self.b.create_block("unbox.header");
        let ok = self.b.create_block("unbox.ok");
        let fail = self.b.create_block("unbox.fail");
        let is_null = self.b.icmp(IntPredicate::Eq, object, Value::Null);
        self.b.cond_br(is_null, fail, not_null);

        self.b.switch_to_block(not_null);
        let header = self.b.load(IrType::Ptr, object);
        let same = self.b.icmp(IntPredicate::Eq, header, Value::Global(rtti));
        self.b.cond_br(same, ok, fail);

        self.b.switch_to_block(fail);
        self.raise_invalid_cast();
        self.b.switch_to_block(ok);
        Ok(())
    }

    fn raise_invalid_cast(&mut self) {
        let throw = self.cx.runtime_fn(RuntimeFn::ThrowInvalidCast);
        self.emit_call(Callee::Direct(throw), Vec::new(), IrType::Void);
        self.b.unreachable();
    }

    pub(super) fn lower_unbox(&mut self, ty: &TypeRef) -> CompileResult<()> {
        let ty = self.resolve_type(ty)?;
        let object = self.pop()?;
        self.check_exact(object.value, ty)?;
        let shape = self.cx.type_info(ty).object;
        let data = self.b.struct_gep(shape, object.value, &[1]);
        let by_ref = self.by_ref(ty)?;
        self.push(by_ref, data);
        Ok(())
    }

    pub(super) fn lower_unbox_any(&mut self, ty: &TypeRef) -> CompileResult<()> {
        let id = self.resolve_type(ty)?;
        if !self.cx.type_info(id).is_value_type {
            return self.lower_type_test(ty, true);
        }
        let object = self.pop()?;
        self.check_exact(object.value, id)?;
        let shape = self.cx.type_info(id).object;
        let data = self.b.struct_gep(shape, object.value, &[1]);
        self.load_push(data, id)
    }

    /// `isinst` / `castclass`: a null check, a type check and a merge
    pub(super) fn lower_type_test(&mut self, target: &TypeRef, throwing: bool) -> CompileResult<()> {
        let ty = self.resolve_type(target)?;
        let object = self.pop()?;
        if object.category != StackCategory::Object {
            return Err(CompileError::malformed(format!("type test on a {:?} value", object.category)));
        }
        let rtti = Value::Global(self.cx.rtti_global(ty));
        let info = self.cx.type_info(ty);
        let (is_interface, exact, depth) = (info.is_interface, info.is_value_type || info.is_array(), info.depth);

        let check = self.b.create_block("cast.check");
        let fail = self.b.create_block("cast.fail");
        let merge = self.b.create_block("cast.merge");
        let is_null = self.b.icmp(IntPredicate::Eq, object.value, Value::Null);
        let entry = self.b.current_block();
        self.b.cond_br(is_null, merge, check);

        self.b.switch_to_block(check);
        let passed = if is_interface {
            let test = self.cx.runtime_fn(RuntimeFn::IsInstInterface);
            self.emit_call(Callee::Direct(test), vec![object.value, rtti], IrType::I1)
                .ok_or_else(|| CompileError::malformed("interface test returned no value"))?
        } else if exact {
            let header = self.b.load(IrType::Ptr, object.value);
            self.b.icmp(IntPredicate::Eq, header, rtti)
        } else {
            // supertypes[depth] exists when the chain is long enough
            let descriptor = self.cx.rtti_types().header;
            let header = self.b.load(IrType::Ptr, object.value);
            let count_ptr = self.b.struct_gep(descriptor, header, &[RTTI_SUPERTYPE_COUNT]);
            let count = self.b.load(IrType::I32, count_ptr);
            let deep_enough = self.b.icmp(IntPredicate::Ugt, count, Value::i32(depth as i32));
            let ancestor = self.b.create_block("cast.ancestor");
            self.b.cond_br(deep_enough, ancestor, fail);
            self.b.switch_to_block(ancestor);
            let list_ptr = self.b.struct_gep(descriptor, header, &[RTTI_SUPERTYPES]);
            let list = self.b.load(IrType::Ptr, list_ptr);
            let index = self.iptr_const(depth as u64);
            let slot = self.b.gep(IrType::Ptr, list, vec![index]);
            let ancestor = self.b.load(IrType::Ptr, slot);
            self.b.icmp(IntPredicate::Eq, ancestor, rtti)
        };
        let tested = self.b.current_block();
        self.b.cond_br(passed, merge, fail);

        self.b.switch_to_block(fail);
        if throwing {
            self.raise_invalid_cast();
        } else {
            self.b.br(merge);
        }

        self.b.switch_to_block(merge);
        let result = self.b.phi(merge, IrType::Ptr);
        self.b.add_incoming(merge, result, Value::Null, entry);
        self.b.add_incoming(merge, result, object.value, tested);
        if !throwing {
            self.b.add_incoming(merge, result, Value::Null, fail);
        }
        self.push(ty, Value::Reg(result));
        Ok(())
    }

    /// `ldtoken` on a type pushes its descriptor address
    pub(super) fn lower_ldtoken(&mut self, ty: &TypeRef) -> CompileResult<()> {
        let ty = self.resolve_type(ty)?;
        let rtti = self.cx.rtti_global(ty);
        self.push_prim(PrimitiveType::I, Value::Global(rtti))
    }

    pub(super) fn lower_ldstr(&mut self, text: &str) -> CompileResult<()> {
        let (chars, len) = self.string_data(text);
        let new_string = self.cx.runtime_fn(RuntimeFn::NewString);
        let string = self
            .emit_call(Callee::Direct(new_string), vec![Value::Global(chars), Value::i32(len as i32)], IrType::Ptr)
            .ok_or_else(|| CompileError::malformed("string construction returned no object"))?;
        let string_def = self.cx.asm.well_known(WellKnown::String)?;
        let ty = self.cx.type_of(&TypeRef::Named(string_def), Completeness::Opaque)?;
        self.push(ty, string);
        Ok(())
    }

    /// Interned character data of a literal in the configured encoding
    fn string_data(&mut self, text: &str) -> (GlobalId, usize) {
        let encoding = self.cx.config.char_encoding;
        let (elements, len): (Vec<Constant>, usize) = match encoding {
            CharEncoding::Utf16 => {
                let units: Vec<u16> = text.encode_utf16().collect();
                (units.iter().map(|u| Constant::int(IrType::I16, *u as i16 as i64)).collect(), units.len())
            }
            CharEncoding::Utf8 => (text.bytes().map(|b| Constant::i8(b as i8)).collect(), text.len()),
        };
        if let Some(g) = self.cx.strings.get(text) {
            return (*g, len);
        }
        let unit = IrType::int(encoding.unit_bits());
        let ty = self.cx.module.array_of(unit, elements.len() as u64);
        let g = self.cx.module.add_global("str", ty, Linkage::Private);
        self.cx.module.global_mut(g).constant = true;
        self.cx.module.set_initializer(g, Constant::Array { ty, elements });
        self.cx.strings.insert(text.to_string(), g);
        (g, len)
    }
}
