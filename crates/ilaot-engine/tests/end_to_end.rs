use ilaot_engine::ir::{Callee, Function, Instr, IrType, Module, Value};
use ilaot_engine::{Compiler, CompilerConfig, RuntimeFn};
use ilaot_metadata::{
    Assembly, AssemblyBuilder, ClauseKind, FieldRef, Instruction, MethodRef, TypeRef, WellKnown,
};

fn compile(asm: &Assembly) -> Module {
    let mut cx = Compiler::new(asm, CompilerConfig { test_mode: true, ..Default::default() }).unwrap();
    cx.process_module().unwrap();
    cx.generate_module().unwrap()
}

fn function<'m>(module: &'m Module, fragment: &str) -> &'m Function {
    module.defined_functions().map(|(_, f)| f).find(|f| f.name.contains(fragment)).unwrap()
}

fn instrs(f: &Function) -> impl Iterator<Item = &Instr> {
    f.body.as_ref().unwrap().blocks.iter().flat_map(|b| &b.instrs)
}

fn direct_calls(module: &Module, f: &Function, target: &str) -> usize {
    let Some(target) = module.get_function(target) else { return 0 };
    instrs(f).filter(|i| matches!(i, Instr::Call { callee: Callee::Direct(c), .. } if *c == target)).count()
}

/// `Point { x, y }` implementing `IPrintable.Show()`, shown boxed and unboxed
fn printable_point() -> Assembly {
    let mut b = AssemblyBuilder::with_core_library("App");
    let printable = b.interface("App", "IPrintable").finish();
    let show = b.method(printable, "Show").virtual_().abstract_().returns(TypeRef::INT32).finish();
    let point = b.value_type("App", "Point").implements(TypeRef::Named(printable)).finish();
    let x = b.field(point, "x", TypeRef::INT32);
    b.field(point, "y", TypeRef::INT32);
    let x = FieldRef { declaring: TypeRef::Named(point), field: x };
    let load_x = x.clone();
    let point_show = b
        .method(point, "Show")
        .virtual_()
        .returns(TypeRef::INT32)
        .body(move |body| {
            body.emit(Instruction::Ldarg(0));
            body.emit(Instruction::Ldfld(load_x));
            body.emit(Instruction::Ret);
        })
        .finish();

    let program = b.class("App", "Program").finish();
    let iface_show = MethodRef::new(TypeRef::Named(printable), show);
    let direct_show = MethodRef::new(TypeRef::Named(point), point_show);
    let store_x = x.clone();
    b.method(program, "Boxed")
        .static_()
        .returns(TypeRef::INT32)
        .body(move |body| {
            let p = body.local(TypeRef::Named(point));
            body.emit(Instruction::Ldloca(p));
            body.emit(Instruction::Initobj(TypeRef::Named(point)));
            body.emit(Instruction::Ldloca(p));
            body.emit(Instruction::LdcI4(7));
            body.emit(Instruction::Stfld(store_x));
            body.emit(Instruction::Ldloc(p));
            body.emit(Instruction::Box(TypeRef::Named(point)));
            body.emit(Instruction::Callvirt(iface_show));
            body.emit(Instruction::Ret);
        })
        .finish();
    b.method(program, "Unboxed")
        .static_()
        .returns(TypeRef::INT32)
        .body(move |body| {
            let p = body.local(TypeRef::Named(point));
            body.emit(Instruction::Ldloca(p));
            body.emit(Instruction::LdcI4(7));
            body.emit(Instruction::Stfld(x));
            body.emit(Instruction::Ldloca(p));
            body.emit(Instruction::Call(direct_show));
            body.emit(Instruction::Ret);
        })
        .finish();
    b.build().unwrap()
}

#[test]
fn test_boxed_interface_call_routes_through_trampoline() {
    let asm = printable_point();
    let module = compile(&asm);
    let show = "System.Int32 App.Point::Show()";

    let boxed = function(&module, "::Boxed(");
    assert_eq!(direct_calls(&module, boxed, RuntimeFn::AllocObject.name()), 1);
    assert_eq!(direct_calls(&module, boxed, RuntimeFn::ResolveInterfaceCall.name()), 1);
    assert!(instrs(boxed).any(|i| matches!(i, Instr::Call { callee: Callee::Indirect { .. }, .. })));
    assert_eq!(direct_calls(&module, boxed, show), 0);

    // the boxed entry unwraps and forwards to the same body the direct call uses
    let trampoline = function(&module, "App.Point::Show()_UnboxTrampoline");
    assert_eq!(direct_calls(&module, trampoline, show), 1);
    let unboxed = function(&module, "::Unboxed(");
    assert_eq!(direct_calls(&module, unboxed, show), 1);
    assert_eq!(direct_calls(&module, unboxed, RuntimeFn::AllocObject.name()), 0);
}

#[test]
fn test_constrained_call_on_value_type_skips_boxing() {
    let mut b = AssemblyBuilder::with_core_library("App");
    let printable = b.interface("App", "IPrintable").finish();
    let show = b.method(printable, "Show").virtual_().abstract_().returns(TypeRef::INT32).finish();
    let point = b.value_type("App", "Point").implements(TypeRef::Named(printable)).finish();
    b.field(point, "x", TypeRef::INT32);
    b.method(point, "Show")
        .virtual_()
        .returns(TypeRef::INT32)
        .body(|body| {
            body.emit(Instruction::LdcI4(1));
            body.emit(Instruction::Ret);
        })
        .finish();
    let program = b.class("App", "Program").finish();
    b.method(program, "Generic")
        .static_()
        .returns(TypeRef::INT32)
        .body(move |body| {
            let p = body.local(TypeRef::Named(point));
            body.emit(Instruction::Ldloca(p));
            body.emit(Instruction::Constrained(TypeRef::Named(point)));
            body.emit(Instruction::Callvirt(MethodRef::new(TypeRef::Named(printable), show)));
            body.emit(Instruction::Ret);
        })
        .finish();
    let asm = b.build().unwrap();

    let module = compile(&asm);
    let generic = function(&module, "::Generic(");
    assert_eq!(direct_calls(&module, generic, "System.Int32 App.Point::Show()"), 1);
    assert_eq!(direct_calls(&module, generic, RuntimeFn::AllocObject.name()), 0);
    assert_eq!(direct_calls(&module, generic, RuntimeFn::ResolveInterfaceCall.name()), 0);
}

#[test]
fn test_catch_matches_exact_descriptor_and_clears_slots() {
    let mut b = AssemblyBuilder::with_core_library("App");
    let exception = b.assembly().well_known(WellKnown::Exception).unwrap();
    let failure = b.class("App", "Failure").base(TypeRef::Named(exception)).finish();
    let ctor = b
        .ctor(failure)
        .body(|body| {
            body.emit(Instruction::Ret);
        })
        .finish();
    let program = b.class("App", "Program").finish();
    let fail = b
        .method(program, "Fail")
        .static_()
        .body(move |body| {
            body.emit(Instruction::Newobj(MethodRef::new(TypeRef::Named(failure), ctor)));
            body.emit(Instruction::Throw);
        })
        .finish();
    b.method(program, "Recover")
        .static_()
        .returns(TypeRef::INT32)
        .body(move |body| {
            let end = body.label();
            let try_start = body.here();
            body.emit(Instruction::Call(MethodRef::new(TypeRef::Named(program), fail)));
            body.leave(end);
            let handler = body.here();
            body.emit(Instruction::Pop);
            body.leave(end);
            let handler_end = body.here();
            body.mark(end);
            body.emit(Instruction::LdcI4(1));
            body.emit(Instruction::Ret);
            body.clause(ClauseKind::Catch(TypeRef::Named(failure)), try_start, handler, handler, handler_end);
        })
        .finish();
    let asm = b.build().unwrap();

    let module = compile(&asm);
    let recover = function(&module, "::Recover(");
    let descriptor = module.get_global("App.Failure.rtti").unwrap();
    let typeid = module.get_function(RuntimeFn::TypeIdFor.name()).unwrap();
    let queries: Vec<&Vec<Value>> = instrs(recover)
        .filter_map(|i| match i {
            Instr::Call { callee: Callee::Direct(c), args, .. } if *c == typeid => Some(args),
            _ => None,
        })
        .collect();
    assert_eq!(queries, vec![&vec![Value::Global(descriptor)]]);

    // slots start cleared in the entry block and are cleared again on catch entry
    let null_stores = instrs(recover).filter(|i| matches!(i, Instr::Store { value: Value::Null, .. })).count();
    let zero_selectors = instrs(recover)
        .filter(|i| matches!(i, Instr::Store { value: Value::Int { ty: IrType::I32, value: 0 }, .. }))
        .count();
    assert!(null_stores >= 2);
    assert!(zero_selectors >= 2);
}
