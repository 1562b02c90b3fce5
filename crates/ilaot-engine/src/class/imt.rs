//! Interface dispatch table
//!
//! Interface methods hash into one of [`IMT_SIZE`] buckets. A bucket holding
//! a single method stores its entry point directly; colliding methods share a
//! null-terminated list of `(method key, entry point)` pairs whose address is
//! stored with the low bit set. The key is a per-method identity global, so
//! methods whose names hash alike stay distinct.

use ilaot_metadata::{MethodRef, TypeRef, WellKnown};
use tracing::trace;

use crate::class::ClassId;
use crate::compiler::Compiler;
use crate::error::{CompileError, CompileResult};
use crate::function::FunctionId;
use crate::ir::{Constant, GlobalId, IrType, Linkage};
use crate::layout::TypeId;

pub const IMT_SIZE: usize = 19;

/// Prefix of the array helpers implementing the array interface family
pub const ARRAY_HELPER_PREFIX: &str = "InternalArray_";

/// One resolved interface method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImtEntry {
    /// Interface method being implemented
    pub declared: FunctionId,
    pub function: FunctionId,
}

/// Bucket hash of a method's full name
pub fn method_id(full_name: &str) -> u32 {
    full_name.chars().fold(17u32, |hash, c| hash.wrapping_mul(23).wrapping_add(c as u32))
}

pub fn bucket_of(method_id: u32) -> usize {
    (method_id % IMT_SIZE as u32) as usize
}

impl<'a> Compiler<'a> {
    /// Resolve every interface method of the class into its bucket
    pub(crate) fn build_imt(&mut self, class: ClassId) -> CompileResult<Vec<Vec<ImtEntry>>> {
        let mut imt = vec![Vec::new(); IMT_SIZE];
        let interfaces = self.classes[class.0 as usize].interfaces.clone();
        let asm = self.asm;
        for iface in interfaces {
            let iface_ref = self.type_info(iface).ty.clone();
            let Some(def) = self.type_info(iface).def else { continue };
            for &m in &asm.type_def(def).methods {
                let d = asm.method(m);
                if d.is_static || !d.generic_params.is_empty() {
                    continue;
                }
                let declared = self.function_of(&MethodRef::new(iface_ref.clone(), m))?;
                let implementation = self.resolve_interface_method(class, iface, declared)?;
                let method_id = self.function_info(declared).method_id;
                let bucket = &mut imt[bucket_of(method_id)];
                if bucket.iter().any(|e: &ImtEntry| e.declared == declared) {
                    continue;
                }
                bucket.push(ImtEntry { declared, function: implementation });
                trace!(
                    method = %self.function_info(declared).symbol,
                    implementation = %self.function_info(implementation).symbol,
                    bucket = bucket_of(method_id),
                    "resolved interface method"
                );
            }
        }
        Ok(imt)
    }

    /// Identity global of an interface method, shared across modules
    pub(crate) fn interface_key(&mut self, declared: FunctionId) -> GlobalId {
        if let Some(&key) = self.imt_keys.get(&declared) {
            return key;
        }
        let name = format!("{}.imtkey", self.function_info(declared).symbol);
        let key = self.module.add_global(&name, IrType::I8, Linkage::LinkOnceAny);
        self.module.global_mut(key).constant = true;
        self.module.set_initializer(key, Constant::int(IrType::I8, 0));
        self.imt_keys.insert(declared, key);
        key
    }

    /// Concrete function implementing `declared` for instances of `class`
    fn resolve_interface_method(&mut self, class: ClassId, iface: TypeId, declared: FunctionId) -> CompileResult<FunctionId> {
        let asm = self.asm;
        let name = asm.method(self.function_info(declared).def()).name.clone();
        let qualified = match self.type_info(iface).def {
            Some(def) => format!("{}.{}", asm.type_full_name(def), name),
            None => name.clone(),
        };

        // Direct match walking from the class towards the root
        let mut chain = self.class_chain(class);
        chain.reverse();
        for k in chain {
            let kty = self.classes[k.0 as usize].ty;
            let owner = self.type_info(kty).ty.clone();
            let Some(def) = self.type_info(kty).def else { continue };
            for &m in &asm.type_def(def).methods {
                let d = asm.method(m);
                if d.is_static || !d.generic_params.is_empty() || (d.name != name && d.name != qualified) {
                    continue;
                }
                let candidate = self.function_of(&MethodRef::new(owner.clone(), m))?;
                if !self.same_signature(candidate, declared) {
                    continue;
                }
                if d.is_virtual {
                    if let Some(slot) = self.function_info(candidate).slot {
                        return Ok(self.classes[class.0 as usize].vtable[slot as usize]);
                    }
                }
                return Ok(candidate);
            }
        }

        // Arrays implement the list family through generic helpers on the array type
        let cty = self.classes[class.0 as usize].ty;
        if let TypeRef::Array(element) = &self.type_info(cty).ty {
            let element = (**element).clone();
            let array = asm.well_known(WellKnown::Array)?;
            if let Some(helper) = asm.find_method(array, &format!("{}{}", ARRAY_HELPER_PREFIX, name)) {
                let method = MethodRef { declaring: TypeRef::Named(array), method: helper, generic_args: vec![element] };
                return self.function_of(&method);
            }
        }

        Err(CompileError::malformed(format!(
            "{} does not implement {}",
            self.type_info(cty).name,
            self.function_info(declared).symbol
        )))
    }

    /// IMT constant: one pointer per bucket, tagged for collision lists
    pub(crate) fn imt_constant(&mut self, class: ClassId) -> CompileResult<Constant> {
        let imt = self.classes[class.0 as usize].imt.clone();
        let name = self.type_info(self.classes[class.0 as usize].ty).name.clone();
        let linkage = self.type_ref_linkage(&self.type_info(self.classes[class.0 as usize].ty).ty);
        let slots_ty = self.module.array_of(IrType::Ptr, IMT_SIZE as u64);
        let mut slots = Vec::with_capacity(IMT_SIZE);
        for (bucket, entries) in imt.iter().enumerate() {
            let slot = match entries.as_slice() {
                [] => Constant::Null,
                [single] => self.dispatch_address(single.function)?,
                // descriptors of foreign types are declarations
                _ if linkage.is_none() => Constant::Null,
                many => {
                    let pair = self.imt_pair_type();
                    let mut elements = Vec::with_capacity(many.len() + 1);
                    for entry in many {
                        let addr = self.dispatch_address(entry.function)?;
                        let key = self.interface_key(entry.declared);
                        elements.push(Constant::Struct { ty: pair, fields: vec![Constant::GlobalAddr(key), addr] });
                    }
                    elements.push(Constant::Struct { ty: pair, fields: vec![Constant::Null, Constant::Null] });
                    let list_ty = self.module.array_of(pair, elements.len() as u64);
                    let list = self.module.add_global(&format!("{}.imt.{}", name, bucket), list_ty, Linkage::Private);
                    self.module.global_mut(list).constant = true;
                    self.module.set_initializer(list, Constant::Array { ty: list_ty, elements });
                    Constant::TaggedGlobalAddr { global: list, tag: 1 }
                }
            };
            slots.push(slot);
        }
        Ok(Constant::Array { ty: slots_ty, elements: slots })
    }

    fn imt_pair_type(&mut self) -> IrType {
        self.rtti_types().imt_pair
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_id_hash() {
        let expected = "ab".chars().fold(17u32, |h, c| h * 23 + c as u32);
        assert_eq!(method_id("ab"), expected);
        assert_eq!(method_id(""), 17);
        // Long names wrap instead of overflowing
        let long = "x".repeat(64);
        let _ = method_id(&long);
    }

    #[test]
    fn test_bucket_range() {
        for name in ["System.Void App.IA::Run()", "System.Int32 App.IB::Count()"] {
            assert!(bucket_of(method_id(name)) < IMT_SIZE);
        }
    }
}
