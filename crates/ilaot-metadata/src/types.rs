//! Type references
//!
//! A [`TypeRef`] is a structural description of a type as it appears in a
//! signature or an instruction operand. Two references are the same type
//! exactly when they compare equal, so a `TypeRef` doubles as the identity
//! key of every per-type table downstream.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::assembly::Assembly;

/// Index of a type definition inside an [`Assembly`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeDefId(pub u32);

/// Index of a method definition inside an [`Assembly`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodDefId(pub u32);

/// Index of a field definition inside an [`Assembly`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldDefId(pub u32);

/// Index into the assembly's module table (0 is the module being compiled)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u32);

impl ModuleId {
    /// The module currently being compiled
    pub const MAIN: ModuleId = ModuleId(0);
}

/// Built-in scalar types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveType {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    /// Native-width signed integer
    I,
    /// Native-width unsigned integer
    U,
    R4,
    R8,
}

impl PrimitiveType {
    pub const ALL: [PrimitiveType; 15] = [
        PrimitiveType::Void,
        PrimitiveType::Boolean,
        PrimitiveType::Char,
        PrimitiveType::I1,
        PrimitiveType::U1,
        PrimitiveType::I2,
        PrimitiveType::U2,
        PrimitiveType::I4,
        PrimitiveType::U4,
        PrimitiveType::I8,
        PrimitiveType::U8,
        PrimitiveType::I,
        PrimitiveType::U,
        PrimitiveType::R4,
        PrimitiveType::R8,
    ];

    /// Inverse of [`full_name`](Self::full_name)
    pub fn from_full_name(name: &str) -> Option<PrimitiveType> {
        Self::ALL.into_iter().find(|p| p.full_name() == name)
    }

    /// Fully-qualified runtime name
    pub fn full_name(self) -> &'static str {
        match self {
            PrimitiveType::Void => "System.Void",
            PrimitiveType::Boolean => "System.Boolean",
            PrimitiveType::Char => "System.Char",
            PrimitiveType::I1 => "System.SByte",
            PrimitiveType::U1 => "System.Byte",
            PrimitiveType::I2 => "System.Int16",
            PrimitiveType::U2 => "System.UInt16",
            PrimitiveType::I4 => "System.Int32",
            PrimitiveType::U4 => "System.UInt32",
            PrimitiveType::I8 => "System.Int64",
            PrimitiveType::U8 => "System.UInt64",
            PrimitiveType::I => "System.IntPtr",
            PrimitiveType::U => "System.UIntPtr",
            PrimitiveType::R4 => "System.Single",
            PrimitiveType::R8 => "System.Double",
        }
    }

    /// Whether the type is an integer interpreted as unsigned
    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            PrimitiveType::Boolean
                | PrimitiveType::Char
                | PrimitiveType::U1
                | PrimitiveType::U2
                | PrimitiveType::U4
                | PrimitiveType::U8
                | PrimitiveType::U
        )
    }

    /// Whether the type is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, PrimitiveType::R4 | PrimitiveType::R8)
    }
}

/// Which declaration a generic parameter belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenericOwner {
    /// Declared by the enclosing generic type (`!n`)
    Type,
    /// Declared by the generic method itself (`!!n`)
    Method,
}

/// Reference to a (possibly open) type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeRef {
    Primitive(PrimitiveType),
    /// Non-generic type definition, or a generic definition used open
    Named(TypeDefId),
    /// Instantiation of a generic type definition
    GenericInstance { def: TypeDefId, args: Vec<TypeRef> },
    /// Single-dimension zero-based array
    Array(Box<TypeRef>),
    /// Unmanaged pointer
    Pointer(Box<TypeRef>),
    /// Managed by-reference
    ByRef(Box<TypeRef>),
    /// Formal generic parameter
    GenericParam { owner: GenericOwner, index: u16 },
}

impl TypeRef {
    pub const VOID: TypeRef = TypeRef::Primitive(PrimitiveType::Void);
    pub const BOOLEAN: TypeRef = TypeRef::Primitive(PrimitiveType::Boolean);
    pub const INT32: TypeRef = TypeRef::Primitive(PrimitiveType::I4);
    pub const INT64: TypeRef = TypeRef::Primitive(PrimitiveType::I8);
    pub const INTPTR: TypeRef = TypeRef::Primitive(PrimitiveType::I);
    pub const DOUBLE: TypeRef = TypeRef::Primitive(PrimitiveType::R8);

    /// `T[]`
    pub fn array_of(element: TypeRef) -> TypeRef {
        TypeRef::Array(Box::new(element))
    }

    /// `T*`
    pub fn pointer_to(element: TypeRef) -> TypeRef {
        TypeRef::Pointer(Box::new(element))
    }

    /// `T&`
    pub fn by_ref(element: TypeRef) -> TypeRef {
        TypeRef::ByRef(Box::new(element))
    }

    /// `!index`
    pub fn type_param(index: u16) -> TypeRef {
        TypeRef::GenericParam { owner: GenericOwner::Type, index }
    }

    /// `!!index`
    pub fn method_param(index: u16) -> TypeRef {
        TypeRef::GenericParam { owner: GenericOwner::Method, index }
    }

    /// Definition backing a named or instantiated type
    pub fn def_id(&self) -> Option<TypeDefId> {
        match self {
            TypeRef::Named(def) | TypeRef::GenericInstance { def, .. } => Some(*def),
            _ => None,
        }
    }

    /// Generic arguments of an instantiation (empty otherwise)
    pub fn generic_args(&self) -> &[TypeRef] {
        match self {
            TypeRef::GenericInstance { args, .. } => args,
            _ => &[],
        }
    }

    /// Element of an array, pointer or by-reference type
    pub fn element(&self) -> Option<&TypeRef> {
        match self {
            TypeRef::Array(e) | TypeRef::Pointer(e) | TypeRef::ByRef(e) => Some(e),
            _ => None,
        }
    }

    /// True when the reference mentions no generic parameter at any depth
    pub fn is_closed(&self) -> bool {
        match self {
            TypeRef::Primitive(_) | TypeRef::Named(_) => true,
            TypeRef::GenericInstance { args, .. } => args.iter().all(TypeRef::is_closed),
            TypeRef::Array(e) | TypeRef::Pointer(e) | TypeRef::ByRef(e) => e.is_closed(),
            TypeRef::GenericParam { .. } => false,
        }
    }

    /// Whether this is the `void` primitive
    pub fn is_void(&self) -> bool {
        matches!(self, TypeRef::Primitive(PrimitiveType::Void))
    }

    /// Render with type names resolved against `assembly`
    pub fn display<'a>(&'a self, assembly: &'a Assembly) -> TypeRefDisplay<'a> {
        TypeRefDisplay { ty: self, assembly }
    }
}

/// [`fmt::Display`] adapter returned by [`TypeRef::display`]
pub struct TypeRefDisplay<'a> {
    ty: &'a TypeRef,
    assembly: &'a Assembly,
}

impl fmt::Display for TypeRefDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ty {
            TypeRef::Primitive(p) => f.write_str(p.full_name()),
            TypeRef::Named(def) => write!(f, "{}", self.assembly.type_full_name(*def)),
            TypeRef::GenericInstance { def, args } => {
                write!(f, "{}<", self.assembly.type_full_name(*def))?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", arg.display(self.assembly))?;
                }
                f.write_str(">")
            }
            TypeRef::Array(e) => write!(f, "{}[]", e.display(self.assembly)),
            TypeRef::Pointer(e) => write!(f, "{}*", e.display(self.assembly)),
            TypeRef::ByRef(e) => write!(f, "{}&", e.display(self.assembly)),
            TypeRef::GenericParam { owner: GenericOwner::Type, index } => write!(f, "!{}", index),
            TypeRef::GenericParam { owner: GenericOwner::Method, index } => write!(f, "!!{}", index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_detection() {
        let open = TypeRef::GenericInstance {
            def: TypeDefId(3),
            args: vec![TypeRef::array_of(TypeRef::type_param(0))],
        };
        assert!(!open.is_closed());

        let closed = TypeRef::GenericInstance {
            def: TypeDefId(3),
            args: vec![TypeRef::array_of(TypeRef::INT32)],
        };
        assert!(closed.is_closed());
        assert!(TypeRef::by_ref(TypeRef::Named(TypeDefId(1))).is_closed());
    }

    #[test]
    fn test_structural_identity() {
        let a = TypeRef::pointer_to(TypeRef::INT32);
        let b = TypeRef::pointer_to(TypeRef::Primitive(PrimitiveType::I4));
        assert_eq!(a, b);
        assert_ne!(a, TypeRef::by_ref(TypeRef::INT32));
    }

    #[test]
    fn test_primitive_traits() {
        assert!(PrimitiveType::U2.is_unsigned());
        assert!(!PrimitiveType::I8.is_unsigned());
        assert!(PrimitiveType::R4.is_float());
        assert_eq!(PrimitiveType::I.full_name(), "System.IntPtr");
    }
}
