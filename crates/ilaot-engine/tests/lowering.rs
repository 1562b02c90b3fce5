use ilaot_engine::ir::{Callee, Instr, IrType, Module, Terminator};
use ilaot_engine::{CharEncoding, ClassInitPolicy, Compiler, CompilerConfig, RuntimeFn};
use ilaot_metadata::{Assembly, AssemblyBuilder, FieldRef, Instruction, TypeRef};

fn compile(asm: &Assembly, config: CompilerConfig) -> Module {
    let mut cx = Compiler::new(asm, config).unwrap();
    cx.process_module().unwrap();
    cx.generate_module().unwrap()
}

fn calls(module: &Module, function: &str, target: &str) -> usize {
    let Some(target) = module.get_function(target) else { return 0 };
    let (_, f) = module.defined_functions().find(|(_, f)| f.name.contains(function)).unwrap();
    f.body
        .as_ref()
        .unwrap()
        .blocks
        .iter()
        .flat_map(|b| &b.instrs)
        .filter(|i| matches!(i, Instr::Call { callee: Callee::Direct(c), .. } if *c == target))
        .count()
}

fn hello(text: &str) -> Assembly {
    let mut b = AssemblyBuilder::with_core_library("Hello");
    let program = b.class("Hello", "Program").finish();
    let text = text.to_string();
    let main = b
        .method(program, "Main")
        .static_()
        .returns(TypeRef::INT32)
        .body(move |body| {
            body.emit(Instruction::Ldstr(text));
            body.emit(Instruction::Pop);
            body.emit(Instruction::LdcI4(0));
            body.emit(Instruction::Ret);
        })
        .finish();
    b.entry_point(main);
    b.build().unwrap()
}

#[test]
fn test_config_file_selects_target_and_encoding() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ilaot.toml");
    std::fs::write(&path, "target-triple = \"i686-unknown-linux-gnu\"\nchar-encoding = \"utf8\"\ntest-mode = true\n")
        .unwrap();
    let config = CompilerConfig::load(&path).unwrap();
    assert_eq!(config.char_encoding, CharEncoding::Utf8);
    assert_eq!(config.resolved_pointer_width().unwrap(), 32);

    let asm = hello("hello");
    let cx = Compiler::new(&asm, config.clone()).unwrap();
    assert_eq!(cx.target().pointer_size(), 4);
    drop(cx);

    let module = compile(&asm, config);
    let literal = module
        .globals()
        .filter(|(_, g)| g.name.starts_with("str") && g.constant)
        .find_map(|(_, g)| match g.ty {
            IrType::Array(id) => Some(module.array_type(id)),
            _ => None,
        })
        .unwrap();
    assert_eq!(literal.element, IrType::I8);
    assert_eq!(literal.len, 5);
    assert_eq!(calls(&module, "::Main(", RuntimeFn::NewString.name()), 1);
}

#[test]
fn test_utf16_literals_are_interned() {
    let mut b = AssemblyBuilder::with_core_library("Hello");
    let program = b.class("Hello", "Program").finish();
    b.method(program, "Twice")
        .static_()
        .body(|body| {
            body.emit(Instruction::Ldstr("hé".to_string()));
            body.emit(Instruction::Pop);
            body.emit(Instruction::Ldstr("hé".to_string()));
            body.emit(Instruction::Pop);
            body.emit(Instruction::Ret);
        })
        .finish();
    let asm = b.build().unwrap();

    let module = compile(&asm, CompilerConfig { test_mode: true, ..Default::default() });
    let literals: Vec<_> = module
        .globals()
        .filter_map(|(_, g)| match g.ty {
            IrType::Array(id) if g.name.starts_with("str") => Some(module.array_type(id)),
            _ => None,
        })
        .collect();
    assert_eq!(literals.len(), 1);
    assert_eq!(literals[0].element, IrType::I16);
    assert_eq!(literals[0].len, 2);
    assert_eq!(calls(&module, "::Twice(", RuntimeFn::NewString.name()), 2);
}

#[test]
fn test_module_initializer_registers_unless_testing() {
    let asm = hello("x");
    let module = compile(&asm, CompilerConfig::default());
    assert_eq!(module.ctors.len(), 1);
    assert_eq!(module.function(module.ctors[0]).name, "initialize_module");
    assert_eq!(calls(&module, "initialize_module", RuntimeFn::RegisterModule.name()), 1);

    let module = compile(&asm, CompilerConfig { test_mode: true, ..Default::default() });
    assert_eq!(module.ctors.len(), 1);
    assert_eq!(calls(&module, "initialize_module", RuntimeFn::RegisterModule.name()), 0);
}

fn counter_assembly() -> Assembly {
    let mut b = AssemblyBuilder::with_core_library("App");
    let counter = b.class("App", "Counter").finish();
    let count = b.static_field(counter, "count", TypeRef::INT32);
    let field = FieldRef { declaring: TypeRef::Named(counter), field: count };
    let store = field.clone();
    b.cctor(counter)
        .body(move |body| {
            body.emit(Instruction::LdcI4(1));
            body.emit(Instruction::Stsfld(store));
            body.emit(Instruction::Ret);
        })
        .finish();
    let program = b.class("App", "Program").finish();
    b.method(program, "Read")
        .static_()
        .returns(TypeRef::INT32)
        .body(move |body| {
            body.emit(Instruction::Ldsfld(field));
            body.emit(Instruction::Ret);
        })
        .finish();
    b.build().unwrap()
}

#[test]
fn test_static_access_guards_class_init() {
    let asm = counter_assembly();
    let module = compile(&asm, CompilerConfig { test_mode: true, ..Default::default() });

    assert_eq!(calls(&module, "::Read(", "App.Counter_inittype"), 1);
    let (_, read) = module.defined_functions().find(|(_, f)| f.name.contains("::Read(")).unwrap();
    let body = read.body.as_ref().unwrap();
    assert!(body.blocks.iter().any(|b| b.name == "cctor.init"));
    assert!(body.blocks.iter().any(|b| b.name == "cctor.cont"));

    // the constructor's own accesses are not guarded
    assert_eq!(calls(&module, "::.cctor(", "App.Counter_inittype"), 0);
}

#[test]
fn test_atomic_policy_claims_with_cmpxchg() {
    let asm = counter_assembly();
    let config = CompilerConfig { test_mode: true, class_init: ClassInitPolicy::Atomic, ..Default::default() };
    let module = compile(&asm, config);
    let init = module.get_function("App.Counter_inittype").unwrap();
    let body = module.function(init).body.as_ref().unwrap();
    let instrs: Vec<&Instr> = body.blocks.iter().flat_map(|b| &b.instrs).collect();
    assert!(instrs.iter().any(|i| matches!(i, Instr::CmpXchg { .. })));
    assert!(!instrs.iter().any(|i| matches!(i, Instr::Store { .. })));

    let relaxed = compile(&asm, CompilerConfig { test_mode: true, ..Default::default() });
    let init = relaxed.get_function("App.Counter_inittype").unwrap();
    let body = relaxed.function(init).body.as_ref().unwrap();
    assert!(!body.blocks.iter().flat_map(|b| &b.instrs).any(|i| matches!(i, Instr::CmpXchg { .. })));
}

#[test]
fn test_main_returns_entry_result() {
    let asm = hello("x");
    let module = compile(&asm, CompilerConfig { test_mode: true, ..Default::default() });
    let main = module.get_function("main").unwrap();
    let main = module.function(main);
    assert_eq!(main.sig.params, vec![IrType::I32, IrType::Ptr]);
    let body = main.body.as_ref().unwrap();
    assert!(body.blocks.iter().any(|b| matches!(b.terminator, Terminator::Ret(Some(_)))));

    let without = compile(&asm, CompilerConfig { test_mode: true, emit_main: false, ..Default::default() });
    assert!(without.get_function("main").is_none());
}
