//! IR type system
//!
//! Pointers are opaque: every address is `ptr` and the pointee type is carried
//! by the instruction that dereferences it. Aggregate types are interned in the
//! owning [`Module`](super::module::Module) and referenced by id.

use std::fmt;

use super::module::Module;

/// Named aggregate type handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructId(pub u32);

/// Interned fixed-length array type handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayTypeId(pub u32);

/// IR value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrType {
    Void,
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Ptr,
    Struct(StructId),
    Array(ArrayTypeId),
}

impl IrType {
    /// Integer type of the given bit width
    pub fn int(bits: u32) -> IrType {
        match bits {
            1 => IrType::I1,
            8 => IrType::I8,
            16 => IrType::I16,
            32 => IrType::I32,
            _ => IrType::I64,
        }
    }

    pub fn is_int(self) -> bool {
        matches!(self, IrType::I1 | IrType::I8 | IrType::I16 | IrType::I32 | IrType::I64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, IrType::F32 | IrType::F64)
    }

    pub fn is_aggregate(self) -> bool {
        matches!(self, IrType::Struct(_) | IrType::Array(_))
    }

    /// Bit width of an integer type
    pub fn int_bits(self) -> Option<u32> {
        match self {
            IrType::I1 => Some(1),
            IrType::I8 => Some(8),
            IrType::I16 => Some(16),
            IrType::I32 => Some(32),
            IrType::I64 => Some(64),
            _ => None,
        }
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::Void => write!(f, "void"),
            IrType::I1 => write!(f, "i1"),
            IrType::I8 => write!(f, "i8"),
            IrType::I16 => write!(f, "i16"),
            IrType::I32 => write!(f, "i32"),
            IrType::I64 => write!(f, "i64"),
            IrType::F32 => write!(f, "float"),
            IrType::F64 => write!(f, "double"),
            IrType::Ptr => write!(f, "ptr"),
            IrType::Struct(id) => write!(f, "%struct.{}", id.0),
            IrType::Array(id) => write!(f, "%array.{}", id.0),
        }
    }
}

/// Named aggregate; the body stays `None` until set
#[derive(Debug, Clone, PartialEq)]
pub struct StructType {
    pub name: String,
    pub body: Option<Vec<IrType>>,
    pub packed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrayType {
    pub element: IrType,
    pub len: u64,
}

/// Size and alignment rules of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetData {
    pointer_bytes: u32,
}

impl TargetData {
    pub fn new(pointer_bits: u32) -> Self {
        Self { pointer_bytes: pointer_bits / 8 }
    }

    pub fn pointer_size(&self) -> u64 {
        self.pointer_bytes as u64
    }

    /// Integer type as wide as a pointer
    pub fn int_ptr_type(&self) -> IrType {
        IrType::int(self.pointer_bytes * 8)
    }

    /// Allocation size in bytes, including tail padding
    pub fn size_of(&self, module: &Module, ty: IrType) -> u64 {
        match ty {
            IrType::Void => 0,
            IrType::I1 | IrType::I8 => 1,
            IrType::I16 => 2,
            IrType::I32 | IrType::F32 => 4,
            IrType::I64 | IrType::F64 => 8,
            IrType::Ptr => self.pointer_size(),
            IrType::Array(id) => {
                let array = module.array_type(id);
                self.size_of(module, array.element) * array.len
            }
            IrType::Struct(id) => {
                let s = module.struct_type(id);
                let Some(fields) = &s.body else { return 0 };
                let mut offset = 0;
                for field in fields {
                    if !s.packed {
                        offset = align_to(offset, self.align_of(module, *field));
                    }
                    offset += self.size_of(module, *field);
                }
                align_to(offset, self.align_of(module, ty))
            }
        }
    }

    /// ABI alignment in bytes
    pub fn align_of(&self, module: &Module, ty: IrType) -> u64 {
        match ty {
            IrType::Void | IrType::I1 | IrType::I8 => 1,
            IrType::I16 => 2,
            IrType::I32 | IrType::F32 => 4,
            IrType::I64 | IrType::F64 => 8.min(self.pointer_size().max(4)),
            IrType::Ptr => self.pointer_size(),
            IrType::Array(id) => self.align_of(module, module.array_type(id).element),
            IrType::Struct(id) => {
                let s = module.struct_type(id);
                if s.packed {
                    return 1;
                }
                s.body
                    .as_ref()
                    .map(|fields| fields.iter().map(|f| self.align_of(module, *f)).max().unwrap_or(1))
                    .unwrap_or(1)
            }
        }
    }

    /// Byte offset of field `index` inside a struct
    pub fn field_offset(&self, module: &Module, id: StructId, index: usize) -> u64 {
        let s = module.struct_type(id);
        let Some(fields) = &s.body else { return 0 };
        let mut offset = 0;
        for (i, field) in fields.iter().enumerate() {
            if !s.packed {
                offset = align_to(offset, self.align_of(module, *field));
            }
            if i == index {
                return offset;
            }
            offset += self.size_of(module, *field);
        }
        offset
    }
}

/// Round `offset` up to a multiple of `align`
pub fn align_to(offset: u64, align: u64) -> u64 {
    if align <= 1 {
        offset
    } else {
        offset.div_ceil(align) * align
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_layout_padding() {
        let mut module = Module::new("test");
        let s = module.declare_struct("S");
        module.set_struct_body(s, vec![IrType::I8, IrType::I32, IrType::I8], false);
        let target = TargetData::new(64);
        assert_eq!(target.size_of(&module, IrType::Struct(s)), 12);
        assert_eq!(target.field_offset(&module, s, 1), 4);
        assert_eq!(target.align_of(&module, IrType::Struct(s)), 4);
    }

    #[test]
    fn test_packed_and_arrays() {
        let mut module = Module::new("test");
        let s = module.declare_struct("P");
        module.set_struct_body(s, vec![IrType::I8, IrType::I32], true);
        let target = TargetData::new(32);
        assert_eq!(target.size_of(&module, IrType::Struct(s)), 5);
        let arr = module.array_of(IrType::Ptr, 19);
        assert_eq!(target.size_of(&module, arr), 76);
        assert_eq!(target.int_ptr_type(), IrType::I32);
    }
}
