//! Compilation session and driver entry points
//!
//! A [`Compiler`] owns every table of one compilation unit: types, classes
//! and functions keyed by closed identity, plus the work queues that drive
//! the transitive closure over reachable instantiations.

use std::collections::VecDeque;

use ilaot_metadata::{Assembly, MethodRef, ModuleId, TypeDefId, TypeRef};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::class::rtti::RttiTypes;
use crate::class::{ClassId, ClassInfo};
use crate::config::CompilerConfig;
use crate::error::{CompileError, CompileResult};
use crate::function::{FunctionId, FunctionInfo};
use crate::ir::{
    verify_module, Callee, Constant, FuncSig, FunctionBuilder, GlobalId, IrType, Linkage, Module, TargetData, Value,
};
use crate::layout::{Completeness, TypeId, TypeTable};
use crate::runtime::RuntimeFn;

pub struct Compiler<'a> {
    pub(crate) asm: &'a Assembly,
    pub(crate) config: CompilerConfig,
    pub(crate) target: TargetData,
    pub(crate) module: Module,
    pub(crate) types: TypeTable,
    pub(crate) classes: Vec<ClassInfo>,
    pub(crate) class_index: FxHashMap<TypeId, ClassId>,
    pub(crate) functions: Vec<FunctionInfo>,
    pub(crate) function_index: FxHashMap<MethodRef, FunctionId>,
    pub(crate) class_queue: VecDeque<TypeId>,
    pub(crate) method_queue: VecDeque<FunctionId>,
    /// Interned string literal data
    pub(crate) strings: FxHashMap<String, GlobalId>,
    /// Module name constants referenced by type identities
    pub(crate) module_names: FxHashMap<ModuleId, GlobalId>,
    /// Null-terminated byte strings (library and entry point names)
    pub(crate) cstrings: FxHashMap<String, GlobalId>,
    /// Identity globals of interface methods, keying IMT collision lists
    pub(crate) imt_keys: FxHashMap<FunctionId, GlobalId>,
    /// Shared RTTI access types, created on first use
    pub(crate) rtti_types: Option<RttiTypes>,
}

impl<'a> Compiler<'a> {
    pub fn new(asm: &'a Assembly, config: CompilerConfig) -> CompileResult<Self> {
        let bits = config.resolved_pointer_width()?;
        Ok(Compiler {
            asm,
            config,
            target: TargetData::new(bits),
            module: Module::new(&asm.name),
            types: TypeTable::default(),
            classes: Vec::new(),
            class_index: FxHashMap::default(),
            functions: Vec::new(),
            function_index: FxHashMap::default(),
            class_queue: VecDeque::new(),
            method_queue: VecDeque::new(),
            strings: FxHashMap::default(),
            module_names: FxHashMap::default(),
            cstrings: FxHashMap::default(),
            imt_keys: FxHashMap::default(),
            rtti_types: None,
        })
    }

    pub fn assembly(&self) -> &'a Assembly {
        self.asm
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// The module under construction
    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn target(&self) -> &TargetData {
        &self.target
    }

    /// Request full class emission for a closed type
    pub fn register_type(&mut self, ty: &TypeRef) -> CompileResult<TypeId> {
        let id = self.type_of(ty, Completeness::Opaque)?;
        self.enqueue_class(id);
        Ok(id)
    }

    /// Register every closed type defined in the main module
    pub fn process_module(&mut self) -> CompileResult<usize> {
        let mut count = 0;
        for (index, def) in self.asm.types.iter().enumerate() {
            if def.module != ModuleId::MAIN || !def.generic_params.is_empty() {
                continue;
            }
            self.register_type(&TypeRef::Named(TypeDefId(index as u32)))?;
            count += 1;
        }
        info!(module = %self.asm.name, types = count, "registered module types");
        Ok(count)
    }

    /// Drain the work queues, then emit module-level entry points
    pub fn generate_module(mut self) -> CompileResult<Module> {
        self.drain()?;
        self.emit_module_initializer();
        if self.config.emit_main {
            self.emit_main()?;
            self.drain()?;
        }
        verify_module(&self.module)?;
        info!(
            functions = self.module.defined_functions().count(),
            types = self.types.len(),
            classes = self.classes.len(),
            "generated module"
        );
        Ok(self.module)
    }

    /// Lower queued classes and methods until both queues are empty
    pub fn drain(&mut self) -> CompileResult<()> {
        loop {
            if let Some(ty) = self.class_queue.pop_front() {
                self.ensure(ty, Completeness::VTableEmitted)?;
                continue;
            }
            if let Some(function) = self.method_queue.pop_front() {
                self.lower_function(function)?;
                continue;
            }
            return Ok(());
        }
    }

    /// Queue a type for class emission unless it already has a class
    pub(crate) fn enqueue_class(&mut self, id: TypeId) {
        if self.types[id].state < Completeness::VTableEmitted && !self.class_queue.contains(&id) {
            self.class_queue.push_back(id);
        }
    }

    fn emit_module_initializer(&mut self) {
        let mut b = FunctionBuilder::new(&[]);
        if !self.config.test_mode {
            let register = self.runtime_fn(RuntimeFn::RegisterModule);
            let name = self.module_name_global(ModuleId::MAIN);
            b.call(Callee::Direct(register), vec![Value::Global(name)], IrType::Void);
        }
        b.ret(None);
        let init = self.module.get_or_declare_function(
            "initialize_module",
            FuncSig::new(vec![], IrType::Void),
            Linkage::Internal,
        );
        self.module.set_body(init, b.finish());
        self.module.ctors.push(init);
    }

    /// `main(argc, argv)` calling the assembly entry point
    fn emit_main(&mut self) -> CompileResult<()> {
        let Some(entry) = self.asm.entry_point else {
            return Ok(());
        };
        let def = self.asm.method(entry);
        let method = MethodRef::new(TypeRef::Named(def.declaring), entry);
        let function = self.function_of(&method)?;
        let info = self.function_info(function);
        let func = info.func.ok_or_else(|| CompileError::malformed("entry point is abstract"))?;
        let ret_ty = info.sig.ir.ret;
        let args: Vec<Value> = info.sig.ir.params.iter().map(|ty| zero_value(*ty)).collect();

        let mut b = FunctionBuilder::new(&[IrType::I32, IrType::Ptr]);
        let result = b.call(Callee::Direct(func), args, ret_ty);
        let code = match result {
            Some(v) if ret_ty.is_int() => b.int_cast(v, IrType::I32, true),
            _ => Value::i32(0),
        };
        b.ret(Some(code));
        let main = self.module.get_or_declare_function(
            "main",
            FuncSig::new(vec![IrType::I32, IrType::Ptr], IrType::I32),
            Linkage::External,
        );
        self.module.set_body(main, b.finish());
        debug!(entry = %self.function_info(function).symbol, "emitted main");
        Ok(())
    }

    /// Private null-terminated constant holding a module's name
    pub(crate) fn module_name_global(&mut self, module: ModuleId) -> GlobalId {
        if let Some(g) = self.module_names.get(&module) {
            return *g;
        }
        let name = self.asm.module(module).name.clone();
        let g = self.bytes_global(&format!("module.name.{}", module.0), &name);
        self.module_names.insert(module, g);
        g
    }

    /// Private null-terminated constant for a native name
    pub(crate) fn cstring(&mut self, text: &str) -> GlobalId {
        if let Some(g) = self.cstrings.get(text) {
            return *g;
        }
        let g = self.bytes_global("cstr", text);
        self.cstrings.insert(text.to_string(), g);
        g
    }

    fn bytes_global(&mut self, name: &str, text: &str) -> GlobalId {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        let ty = self.module.array_of(IrType::I8, bytes.len() as u64);
        let g = self.module.add_global(name, ty, Linkage::Private);
        self.module.global_mut(g).constant = true;
        self.module.set_initializer(g, Constant::Bytes(bytes));
        g
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }
}

/// Placeholder argument of the given type
pub(crate) fn zero_value(ty: IrType) -> Value {
    match ty {
        IrType::Ptr => Value::Null,
        t if t.is_int() => Value::int(t, 0),
        t if t.is_float() => Value::Float { ty: t, value: 0.0 },
        t => Value::Undef(t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilaot_metadata::{AssemblyBuilder, Instruction};

    #[test]
    fn test_empty_module_has_initializer() {
        let asm = AssemblyBuilder::new("Empty").build().unwrap();
        let cx = Compiler::new(&asm, CompilerConfig::default()).unwrap();
        let module = cx.generate_module().unwrap();
        assert_eq!(module.ctors.len(), 1);
        let init = module.function(module.ctors[0]);
        assert_eq!(init.name, "initialize_module");
        assert!(module.get_function("ilaot_register_module").is_some());
        assert!(module.get_function("main").is_none());
    }

    #[test]
    fn test_test_mode_skips_registration() {
        let asm = AssemblyBuilder::new("Empty").build().unwrap();
        let config = CompilerConfig { test_mode: true, ..Default::default() };
        let module = Compiler::new(&asm, config).unwrap().generate_module().unwrap();
        assert!(module.get_function("ilaot_register_module").is_none());
    }

    #[test]
    fn test_main_calls_entry_point() {
        let mut b = AssemblyBuilder::with_core_library("App");
        let program = b.class("App", "Program").finish();
        let entry = b
            .method(program, "Main")
            .static_()
            .returns(TypeRef::INT32)
            .body(|body| {
                body.emit(Instruction::LdcI4(3));
                body.emit(Instruction::Ret);
            })
            .finish();
        b.entry_point(entry);
        let asm = b.build().unwrap();

        let mut cx = Compiler::new(&asm, CompilerConfig::default()).unwrap();
        assert_eq!(cx.process_module().unwrap(), 1);
        let module = cx.generate_module().unwrap();
        let main = module.get_function("main").unwrap();
        assert!(!module.function(main).is_declaration());
        let entry = module.get_function("System.Int32 App.Program::Main()").unwrap();
        assert!(!module.function(entry).is_declaration());
    }
}
