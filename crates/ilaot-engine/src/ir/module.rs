//! IR module: named types, globals and functions
//!
//! This is the boundary handed to a native code generator. Names are unique
//! within their namespace (functions and globals share none).

use rustc_hash::FxHashMap;

use super::instr::{FuncSig, FunctionBody};
use super::types::{ArrayType, ArrayTypeId, IrType, StructId, StructType};

/// Global variable handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub u32);

/// Function handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

/// Symbol visibility and merge behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Linkage {
    External,
    ExternalWeak,
    /// Duplicates across compilation units are merged
    LinkOnceAny,
    Private,
    Internal,
}

/// Constant initializer tree
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int { ty: IrType, value: i64 },
    Float { ty: IrType, value: f64 },
    Null,
    /// All-zero value of a type
    Zero(IrType),
    Struct { ty: IrType, fields: Vec<Constant> },
    Array { ty: IrType, elements: Vec<Constant> },
    GlobalAddr(GlobalId),
    FuncAddr(FuncId),
    /// Address of a global with an integer added to its low bits
    TaggedGlobalAddr { global: GlobalId, tag: u64 },
    /// Raw bytes for an `[i8 x N]` slot
    Bytes(Vec<u8>),
}

impl Constant {
    pub fn i8(value: i8) -> Constant {
        Constant::Int { ty: IrType::I8, value: value as i64 }
    }

    pub fn i32(value: i32) -> Constant {
        Constant::Int { ty: IrType::I32, value: value as i64 }
    }

    pub fn int(ty: IrType, value: i64) -> Constant {
        Constant::Int { ty, value }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub name: String,
    pub ty: IrType,
    pub linkage: Linkage,
    pub constant: bool,
    pub initializer: Option<Constant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub sig: FuncSig,
    pub linkage: Linkage,
    /// Personality routine for functions with landing pads
    pub personality: Option<FuncId>,
    /// `None` for declarations
    pub body: Option<FunctionBody>,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.body.is_none()
    }
}

/// A complete IR module
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    structs: Vec<StructType>,
    arrays: Vec<ArrayType>,
    array_index: FxHashMap<ArrayType, ArrayTypeId>,
    globals: Vec<Global>,
    global_names: FxHashMap<String, GlobalId>,
    functions: Vec<Function>,
    function_names: FxHashMap<String, FuncId>,
    /// Functions run before `main`, in registration order
    pub ctors: Vec<FuncId>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Module { name: name.to_string(), ..Default::default() }
    }

    // ===== Types =====

    /// Declare an opaque named struct
    pub fn declare_struct(&mut self, name: &str) -> StructId {
        let id = StructId(self.structs.len() as u32);
        self.structs.push(StructType { name: name.to_string(), body: None, packed: false });
        id
    }

    pub fn set_struct_body(&mut self, id: StructId, fields: Vec<IrType>, packed: bool) {
        let s = &mut self.structs[id.0 as usize];
        s.body = Some(fields);
        s.packed = packed;
    }

    /// Declare and define a struct in one step
    pub fn struct_with_body(&mut self, name: &str, fields: Vec<IrType>) -> IrType {
        let id = self.declare_struct(name);
        self.set_struct_body(id, fields, false);
        IrType::Struct(id)
    }

    pub fn struct_type(&self, id: StructId) -> &StructType {
        &self.structs[id.0 as usize]
    }

    pub fn structs(&self) -> impl Iterator<Item = (StructId, &StructType)> {
        self.structs.iter().enumerate().map(|(i, s)| (StructId(i as u32), s))
    }

    /// Field types of a struct (empty while opaque)
    pub fn struct_fields(&self, id: StructId) -> &[IrType] {
        self.structs[id.0 as usize].body.as_deref().unwrap_or(&[])
    }

    /// Interned `[element x len]`
    pub fn array_of(&mut self, element: IrType, len: u64) -> IrType {
        let key = ArrayType { element, len };
        if let Some(id) = self.array_index.get(&key) {
            return IrType::Array(*id);
        }
        let id = ArrayTypeId(self.arrays.len() as u32);
        self.arrays.push(key);
        self.array_index.insert(key, id);
        IrType::Array(id)
    }

    pub fn array_type(&self, id: ArrayTypeId) -> ArrayType {
        self.arrays[id.0 as usize]
    }

    /// Render a type, spelling out aggregates by name
    pub fn type_name(&self, ty: IrType) -> String {
        match ty {
            IrType::Struct(id) => format!("%\"{}\"", self.struct_type(id).name),
            IrType::Array(id) => {
                let a = self.array_type(id);
                format!("[{} x {}]", a.len, self.type_name(a.element))
            }
            other => other.to_string(),
        }
    }

    // ===== Globals =====

    /// Add a global; the name is made unique if already taken
    pub fn add_global(&mut self, name: &str, ty: IrType, linkage: Linkage) -> GlobalId {
        let name = self.unique_name(name);
        let id = GlobalId(self.globals.len() as u32);
        self.global_names.insert(name.clone(), id);
        self.globals.push(Global { name, ty, linkage, constant: false, initializer: None });
        id
    }

    fn unique_name(&self, name: &str) -> String {
        if !self.global_names.contains_key(name) && !self.function_names.contains_key(name) {
            return name.to_string();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{}.{}", name, n);
            if !self.global_names.contains_key(&candidate) && !self.function_names.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.0 as usize]
    }

    pub fn global_mut(&mut self, id: GlobalId) -> &mut Global {
        &mut self.globals[id.0 as usize]
    }

    pub fn get_global(&self, name: &str) -> Option<GlobalId> {
        self.global_names.get(name).copied()
    }

    pub fn set_initializer(&mut self, id: GlobalId, init: Constant) {
        self.globals[id.0 as usize].initializer = Some(init);
    }

    pub fn globals(&self) -> impl Iterator<Item = (GlobalId, &Global)> {
        self.globals.iter().enumerate().map(|(i, g)| (GlobalId(i as u32), g))
    }

    // ===== Functions =====

    /// Look up `name`, declaring it with `sig` when absent
    pub fn get_or_declare_function(&mut self, name: &str, sig: FuncSig, linkage: Linkage) -> FuncId {
        if let Some(id) = self.function_names.get(name) {
            return *id;
        }
        let name = self.unique_name(name);
        let id = FuncId(self.functions.len() as u32);
        self.function_names.insert(name.clone(), id);
        self.functions.push(Function { name, sig, linkage, personality: None, body: None });
        id
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn get_function(&self, name: &str) -> Option<FuncId> {
        self.function_names.get(name).copied()
    }

    pub fn set_body(&mut self, id: FuncId, body: FunctionBody) {
        self.functions[id.0 as usize].body = Some(body);
    }

    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.functions.iter().enumerate().map(|(i, f)| (FuncId(i as u32), f))
    }

    /// Functions that have a body
    pub fn defined_functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.functions().filter(|(_, f)| f.body.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_types_are_interned() {
        let mut module = Module::new("m");
        let a = module.array_of(IrType::Ptr, 19);
        let b = module.array_of(IrType::Ptr, 19);
        let c = module.array_of(IrType::I8, 19);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(module.type_name(c), "[19 x i8]");
    }

    #[test]
    fn test_names_stay_unique() {
        let mut module = Module::new("m");
        let sig = FuncSig::new(vec![], IrType::Void);
        let f = module.get_or_declare_function("f", sig.clone(), Linkage::External);
        assert_eq!(module.get_or_declare_function("f", sig, Linkage::External), f);
        let g = module.add_global("f", IrType::I32, Linkage::Private);
        assert_eq!(module.global(g).name, "f.1");
        assert_eq!(module.get_global("f.1"), Some(g));
    }
}
