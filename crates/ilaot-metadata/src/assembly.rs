//! Resolved assembly metadata
//!
//! Definitions live in flat arenas indexed by [`TypeDefId`], [`MethodDefId`]
//! and [`FieldDefId`]. Module 0 is the module being compiled; the others are
//! referenced libraries whose definitions are only declared, never lowered.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::body::MethodBody;
use crate::types::{FieldDefId, MethodDefId, ModuleId, PrimitiveType, TypeDefId, TypeRef};

/// Metadata errors
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Unknown type definition #{0}")]
    UnknownType(u32),

    #[error("Unknown method definition #{0}")]
    UnknownMethod(u32),

    #[error("Unknown field definition #{0}")]
    UnknownField(u32),

    #[error("Unknown module #{0}")]
    UnknownModule(u32),

    #[error("Well-known type {0:?} is not defined")]
    MissingWellKnown(WellKnown),

    #[error("Label {0} was never placed")]
    UnplacedLabel(u32),

    #[error("Invalid metadata: {0}")]
    Invalid(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Types the engine refers to by role rather than by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WellKnown {
    Object,
    String,
    ValueType,
    Enum,
    Array,
    Exception,
    Delegate,
    MulticastDelegate,
    IList,
    ICollection,
    IEnumerable,
    IReadOnlyList,
    IReadOnlyCollection,
}

impl WellKnown {
    /// Generic interfaces every `T[]` implicitly implements over `T`
    pub const ARRAY_INTERFACES: [WellKnown; 5] = [
        WellKnown::IList,
        WellKnown::ICollection,
        WellKnown::IEnumerable,
        WellKnown::IReadOnlyList,
        WellKnown::IReadOnlyCollection,
    ];
}

/// A module of the assembly set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    Class,
    ValueType,
    Interface,
    Enum { underlying: PrimitiveType },
}

/// Field layout requested by the declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClassLayout {
    #[default]
    Auto,
    /// Sequential with a packing size (0 = default)
    Sequential { pack: u32 },
    /// Every field carries an explicit offset
    Explicit,
}

/// A type definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub namespace: String,
    pub name: String,
    pub module: ModuleId,
    /// Metadata token, carried into RTTI for introspection
    pub token: u32,
    pub kind: TypeKind,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub is_sealed: bool,
    #[serde(default)]
    pub base: Option<TypeRef>,
    #[serde(default)]
    pub interfaces: Vec<TypeRef>,
    /// Names of formal generic parameters, in order
    #[serde(default)]
    pub generic_params: Vec<String>,
    #[serde(default)]
    pub layout: ClassLayout,
    /// Declared total size for custom layouts
    #[serde(default)]
    pub class_size: Option<u32>,
    #[serde(default)]
    pub fields: Vec<FieldDefId>,
    #[serde(default)]
    pub methods: Vec<MethodDefId>,
    #[serde(default)]
    pub nested: Vec<TypeDefId>,
    #[serde(default)]
    pub declaring: Option<TypeDefId>,
}

impl TypeDef {
    pub fn is_interface(&self) -> bool {
        matches!(self.kind, TypeKind::Interface)
    }

    /// Value types include enums
    pub fn is_value_type(&self) -> bool {
        matches!(self.kind, TypeKind::ValueType | TypeKind::Enum { .. })
    }

    /// Whether the field block must be laid out by explicit byte offsets
    pub fn has_custom_layout(&self) -> bool {
        match self.layout {
            ClassLayout::Explicit => true,
            ClassLayout::Sequential { pack } => pack != 0,
            ClassLayout::Auto => false,
        }
    }
}

/// A field definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub declaring: TypeDefId,
    pub name: String,
    pub ty: TypeRef,
    #[serde(default)]
    pub is_static: bool,
    /// Byte offset under explicit layout
    #[serde(default)]
    pub offset: Option<u32>,
    /// Initial contents of an RVA static
    #[serde(default)]
    pub initial_value: Option<Vec<u8>>,
}

/// Platform-invoke binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PInvokeInfo {
    pub module: String,
    pub entry_point: String,
    #[serde(default)]
    pub attributes: u16,
}

/// How a method is implemented
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MethodImpl {
    #[default]
    Il,
    /// Provided by the runtime under the method's symbol
    InternalCall,
    /// Synthesized by the runtime (delegates and the like)
    Runtime,
    PInvoke(PInvokeInfo),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: TypeRef,
}

/// A method definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub declaring: TypeDefId,
    pub name: String,
    pub token: u32,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_virtual: bool,
    #[serde(default)]
    pub is_new_slot: bool,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub is_special_name: bool,
    #[serde(default)]
    pub implementation: MethodImpl,
    #[serde(default)]
    pub generic_params: Vec<String>,
    #[serde(default)]
    pub params: Vec<Param>,
    pub ret: TypeRef,
    #[serde(default)]
    pub body: Option<MethodBody>,
}

impl MethodDef {
    pub fn has_this(&self) -> bool {
        !self.is_static
    }

    pub fn is_constructor(&self) -> bool {
        self.is_special_name && self.name == ".ctor"
    }

    pub fn is_static_constructor(&self) -> bool {
        self.is_special_name && self.is_static && self.name == ".cctor"
    }
}

/// A method as referenced from a call site or signature
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    /// Declaring type, possibly a generic instantiation
    pub declaring: TypeRef,
    pub method: MethodDefId,
    /// Method-level generic arguments
    #[serde(default)]
    pub generic_args: Vec<TypeRef>,
}

impl MethodRef {
    pub fn new(declaring: TypeRef, method: MethodDefId) -> Self {
        Self { declaring, method, generic_args: Vec::new() }
    }
}

/// A field as referenced from an instruction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub declaring: TypeRef,
    pub field: FieldDefId,
}

/// A complete set of resolved definitions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assembly {
    pub name: String,
    pub modules: Vec<ModuleInfo>,
    pub types: Vec<TypeDef>,
    pub methods: Vec<MethodDef>,
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub well_known: BTreeMap<WellKnown, TypeDefId>,
    #[serde(default)]
    pub entry_point: Option<MethodDefId>,
}

impl Assembly {
    /// Parse an assembly from its JSON form and check cross references
    pub fn from_json(text: &str) -> Result<Self, MetadataError> {
        let assembly: Assembly = serde_json::from_str(text)?;
        assembly.validate()?;
        Ok(assembly)
    }

    pub fn to_json(&self) -> Result<String, MetadataError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn type_def(&self, id: TypeDefId) -> &TypeDef {
        &self.types[id.0 as usize]
    }

    pub fn method(&self, id: MethodDefId) -> &MethodDef {
        &self.methods[id.0 as usize]
    }

    pub fn field(&self, id: FieldDefId) -> &FieldDef {
        &self.fields[id.0 as usize]
    }

    pub fn module(&self, id: ModuleId) -> &ModuleInfo {
        &self.modules[id.0 as usize]
    }

    /// Definition registered for a well-known role
    pub fn well_known(&self, role: WellKnown) -> Result<TypeDefId, MetadataError> {
        self.well_known.get(&role).copied().ok_or(MetadataError::MissingWellKnown(role))
    }

    /// `Namespace.Name`, with nested types joined by `/`
    pub fn type_full_name(&self, id: TypeDefId) -> String {
        let def = self.type_def(id);
        match def.declaring {
            Some(outer) => format!("{}/{}", self.type_full_name(outer), def.name),
            None if def.namespace.is_empty() => def.name.clone(),
            None => format!("{}.{}", def.namespace, def.name),
        }
    }

    /// Look a type up by namespace and name
    pub fn find_type(&self, namespace: &str, name: &str) -> Option<TypeDefId> {
        self.types
            .iter()
            .position(|t| t.namespace == namespace && t.name == name && t.declaring.is_none())
            .map(|i| TypeDefId(i as u32))
    }

    /// First method of `ty` with the given name
    pub fn find_method(&self, ty: TypeDefId, name: &str) -> Option<MethodDefId> {
        self.type_def(ty).methods.iter().copied().find(|m| self.method(*m).name == name)
    }

    /// First field of `ty` with the given name
    pub fn find_field(&self, ty: TypeDefId, name: &str) -> Option<FieldDefId> {
        self.type_def(ty).fields.iter().copied().find(|f| self.field(*f).name == name)
    }

    /// Check that every id stored in the arenas is in range
    pub fn validate(&self) -> Result<(), MetadataError> {
        let types = self.types.len() as u32;
        let methods = self.methods.len() as u32;
        let fields = self.fields.len() as u32;
        let check_type = |id: TypeDefId| {
            if id.0 < types { Ok(()) } else { Err(MetadataError::UnknownType(id.0)) }
        };

        for ty in &self.types {
            if ty.module.0 as usize >= self.modules.len() {
                return Err(MetadataError::UnknownModule(ty.module.0));
            }
            for m in &ty.methods {
                if m.0 >= methods {
                    return Err(MetadataError::UnknownMethod(m.0));
                }
            }
            for f in &ty.fields {
                if f.0 >= fields {
                    return Err(MetadataError::UnknownField(f.0));
                }
            }
            for n in &ty.nested {
                check_type(*n)?;
            }
        }
        for m in &self.methods {
            check_type(m.declaring)?;
        }
        for f in &self.fields {
            check_type(f.declaring)?;
        }
        for id in self.well_known.values() {
            check_type(*id)?;
        }
        if let Some(entry) = self.entry_point {
            if entry.0 >= methods {
                return Err(MetadataError::UnknownMethod(entry.0));
            }
        }
        for reference in self.references() {
            if let Some(def) = reference.type_def() {
                check_type(def)?;
            }
        }
        Ok(())
    }

    /// Full signature text used for method identity hashing:
    /// `RetType DeclaringType::Name(P1,P2)`
    pub fn method_full_name(&self, declaring: &TypeRef, id: MethodDefId) -> String {
        let method = self.method(id);
        let params: Vec<String> =
            method.params.iter().map(|p| p.ty.display(self).to_string()).collect();
        format!(
            "{} {}::{}({})",
            method.ret.display(self),
            declaring.display(self),
            method.name,
            params.join(",")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::AssemblyBuilder;

    #[test]
    fn test_full_names() {
        let mut b = AssemblyBuilder::new("Test");
        let outer = b.class("App", "Outer").finish();
        let inner = b.class("", "Inner").nested_in(outer).finish();
        let asm = b.build().unwrap();
        assert_eq!(asm.type_full_name(outer), "App.Outer");
        assert_eq!(asm.type_full_name(inner), "App.Outer/Inner");
    }

    #[test]
    fn test_json_round_trip_validates() {
        let mut b = AssemblyBuilder::new("Test");
        b.class("App", "Program").finish();
        let asm = b.build().unwrap();
        let text = asm.to_json().unwrap();
        let back = Assembly::from_json(&text).unwrap();
        assert_eq!(back, asm);
    }

    #[test]
    fn test_validate_rejects_dangling_method() {
        let mut b = AssemblyBuilder::new("Test");
        let ty = b.class("App", "Program").finish();
        let mut asm = b.build().unwrap();
        asm.types[ty.0 as usize].methods.push(MethodDefId(99));
        assert!(matches!(asm.validate(), Err(MetadataError::UnknownMethod(99))));
    }

    #[test]
    fn test_method_full_name() {
        let mut b = AssemblyBuilder::new("Test");
        let ty = b.class("App", "Calc").finish();
        let m = b
            .method(ty, "Add")
            .param("a", TypeRef::INT32)
            .param("b", TypeRef::INT32)
            .returns(TypeRef::INT32)
            .finish();
        let asm = b.build().unwrap();
        assert_eq!(
            asm.method_full_name(&TypeRef::Named(ty), m),
            "System.Int32 App.Calc::Add(System.Int32,System.Int32)"
        );
    }
}
