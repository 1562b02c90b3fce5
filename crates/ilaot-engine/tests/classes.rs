use ilaot_engine::class::imt::{bucket_of, method_id, IMT_SIZE};
use ilaot_engine::class::rtti::RTTI_IMT;
use ilaot_engine::ir::{Callee, Constant, Instr, Linkage, Value};
use ilaot_engine::{Compiler, CompilerConfig, Completeness, RuntimeFn};
use ilaot_metadata::{Assembly, AssemblyBuilder, Instruction, MethodRef, TypeDefId, TypeRef};

fn test_config() -> CompilerConfig {
    CompilerConfig { test_mode: true, ..Default::default() }
}

/// Two method names of `App.IWide` that hash into the same bucket
fn colliding_names() -> (String, String, usize) {
    let mut seen: Vec<Option<String>> = vec![None; IMT_SIZE];
    for i in 0.. {
        let name = format!("M{i}");
        let bucket = bucket_of(method_id(&format!("System.Void App.IWide::{name}()")));
        if let Some(first) = seen[bucket].take() {
            return (first, name, bucket);
        }
        seen[bucket] = Some(name);
    }
    unreachable!()
}

fn wide_assembly() -> (Assembly, TypeDefId, usize) {
    let (first, second, bucket) = colliding_names();
    let mut b = AssemblyBuilder::with_core_library("App");
    let iface = b.interface("App", "IWide").finish();
    for name in [&first, &second] {
        b.method(iface, name).virtual_().abstract_().finish();
    }
    let widget = b.class("App", "Widget").implements(TypeRef::Named(iface)).finish();
    for name in [&first, &second] {
        b.method(widget, name)
            .virtual_()
            .body(|body| {
                body.emit(Instruction::Ret);
            })
            .finish();
    }
    (b.build().unwrap(), widget, bucket)
}

#[test]
fn test_layout_is_idempotent() {
    let mut b = AssemblyBuilder::with_core_library("App");
    let point = b.value_type("App", "Point").finish();
    b.field(point, "x", TypeRef::INT32);
    b.field(point, "y", TypeRef::INT32);
    let asm = b.build().unwrap();
    let mut cx = Compiler::new(&asm, test_config()).unwrap();

    let ty = TypeRef::Named(point);
    let opaque = cx.type_of(&ty, Completeness::Opaque).unwrap();
    let complete = cx.type_of(&ty, Completeness::TypeComplete).unwrap();
    assert_eq!(opaque, complete);
    assert_eq!(cx.type_of(&ty, Completeness::TypeComplete).unwrap(), complete);
    assert!(cx.type_info(complete).is_value_type);
    assert_eq!(cx.value_size(complete).unwrap(), 8);
}

#[test]
fn test_colliding_interface_methods_share_a_list() {
    let (asm, widget, bucket) = wide_assembly();
    let mut cx = Compiler::new(&asm, test_config()).unwrap();
    cx.register_type(&TypeRef::Named(widget)).unwrap();
    cx.drain().unwrap();

    let class = cx.class_for(&TypeRef::Named(widget)).unwrap();
    let imt = cx.class_info(class).imt.clone();
    assert_eq!(imt.len(), IMT_SIZE);
    assert_eq!(imt[bucket].len(), 2);
    assert_eq!(imt.iter().map(Vec::len).sum::<usize>(), 2);

    let module = cx.generate_module().unwrap();
    let list = module.get_global(&format!("App.Widget.imt.{bucket}")).unwrap();
    let list = module.global(list);
    assert_eq!(list.linkage, Linkage::Private);
    let Some(Constant::Array { elements, .. }) = &list.initializer else { panic!("collision list without entries") };
    // two pairs and the terminator
    assert_eq!(elements.len(), 3);
}

#[test]
fn test_imt_slots_are_direct_or_tagged() {
    let (first, second, shared) = colliding_names();
    let solo = (0..)
        .map(|i| format!("S{i}"))
        .find(|name| bucket_of(method_id(&format!("System.Void App.IWide::{name}()"))) != shared)
        .unwrap();
    let solo_bucket = bucket_of(method_id(&format!("System.Void App.IWide::{solo}()")));

    let mut b = AssemblyBuilder::with_core_library("App");
    let iface = b.interface("App", "IWide").finish();
    for name in [&first, &second, &solo] {
        b.method(iface, name).virtual_().abstract_().finish();
    }
    let widget = b.class("App", "Widget").implements(TypeRef::Named(iface)).finish();
    for name in [&first, &second, &solo] {
        b.method(widget, name)
            .virtual_()
            .body(|body| {
                body.emit(Instruction::Ret);
            })
            .finish();
    }
    let asm = b.build().unwrap();
    let mut cx = Compiler::new(&asm, test_config()).unwrap();
    cx.register_type(&TypeRef::Named(widget)).unwrap();
    let module = cx.generate_module().unwrap();

    let rtti = module.global(module.get_global("App.Widget.rtti").unwrap());
    let Some(Constant::Struct { fields, .. }) = &rtti.initializer else { panic!("descriptor without initializer") };
    let Constant::Array { elements: slots, .. } = &fields[RTTI_IMT as usize] else { panic!("IMT is not an array") };
    assert_eq!(slots.len(), IMT_SIZE);

    let solo_fn = module.get_function(&format!("System.Void App.Widget::{solo}()")).unwrap();
    assert_eq!(slots[solo_bucket], Constant::FuncAddr(solo_fn));
    let list = module.get_global(&format!("App.Widget.imt.{shared}")).unwrap();
    assert_eq!(slots[shared], Constant::TaggedGlobalAddr { global: list, tag: 1 });
    let mut others = slots.iter().enumerate().filter(|(i, _)| *i != solo_bucket && *i != shared);
    assert!(others.all(|(_, slot)| *slot == Constant::Null));
}

#[test]
fn test_same_hash_methods_keep_distinct_keys() {
    // equal after two characters: 'A' * 23 + 'x' == 'B' * 23 + 'a'
    let ax = "System.Void App.IPair::Ax()";
    let ba = "System.Void App.IPair::Ba()";
    assert_eq!(method_id(ax), method_id(ba));
    let bucket = bucket_of(method_id(ax));

    let mut b = AssemblyBuilder::with_core_library("App");
    let iface = b.interface("App", "IPair").finish();
    let ax_def = b.method(iface, "Ax").virtual_().abstract_().finish();
    let ba_def = b.method(iface, "Ba").virtual_().abstract_().finish();
    let pair = b.class("App", "Pair").implements(TypeRef::Named(iface)).finish();
    for name in ["Ax", "Ba"] {
        b.method(pair, name)
            .virtual_()
            .body(|body| {
                body.emit(Instruction::Ret);
            })
            .finish();
    }
    let program = b.class("App", "Program").finish();
    b.method(program, "CallBa")
        .static_()
        .param("pair", TypeRef::Named(iface))
        .body(move |body| {
            body.emit(Instruction::Ldarg(0));
            body.emit(Instruction::Callvirt(MethodRef::new(TypeRef::Named(iface), ba_def)));
            body.emit(Instruction::Ret);
        })
        .finish();
    let asm = b.build().unwrap();
    let mut cx = Compiler::new(&asm, test_config()).unwrap();
    cx.process_module().unwrap();
    cx.drain().unwrap();

    let class = cx.class_for(&TypeRef::Named(pair)).unwrap();
    let entries = cx.class_info(class).imt[bucket].clone();
    assert_eq!(entries.len(), 2);
    let declared_ax = cx.function_of(&MethodRef::new(TypeRef::Named(iface), ax_def)).unwrap();
    let declared_ba = cx.function_of(&MethodRef::new(TypeRef::Named(iface), ba_def)).unwrap();
    let declared: Vec<_> = entries.iter().map(|e| e.declared).collect();
    assert!(declared.contains(&declared_ax) && declared.contains(&declared_ba));
    assert_ne!(entries[0].function, entries[1].function);

    let module = cx.generate_module().unwrap();
    let key_ax = module.get_global(&format!("{ax}.imtkey")).unwrap();
    let key_ba = module.get_global(&format!("{ba}.imtkey")).unwrap();
    assert_ne!(key_ax, key_ba);
    assert_eq!(module.global(key_ba).linkage, Linkage::LinkOnceAny);

    let list = module.global(module.get_global(&format!("App.Pair.imt.{bucket}")).unwrap());
    let Some(Constant::Array { elements, .. }) = &list.initializer else { panic!("collision list without entries") };
    let keys: Vec<&Constant> = elements
        .iter()
        .map(|pair| match pair {
            Constant::Struct { fields, .. } => &fields[0],
            other => panic!("unexpected list element {other:?}"),
        })
        .collect();
    assert_eq!(keys, vec![&Constant::GlobalAddr(key_ax), &Constant::GlobalAddr(key_ba), &Constant::Null]);

    // the call site resolves by the key of the method it calls
    let resolve = module.get_function(RuntimeFn::ResolveInterfaceCall.name()).unwrap();
    let (_, caller) = module.defined_functions().find(|(_, f)| f.name.contains("::CallBa(")).unwrap();
    let body = caller.body.as_ref().unwrap();
    let resolved: Vec<&Value> = body
        .blocks
        .iter()
        .flat_map(|b| &b.instrs)
        .filter_map(|i| match i {
            Instr::Call { callee: Callee::Direct(c), args, .. } if *c == resolve => Some(&args[0]),
            _ => None,
        })
        .collect();
    assert_eq!(resolved, vec![&Value::Global(key_ba)]);
}

#[test]
fn test_foreign_class_declares_no_collision_list() {
    let (first, second, bucket) = colliding_names();
    let mut b = AssemblyBuilder::with_core_library("App");
    let lib = b.add_module("Lib");
    let iface = b.interface("App", "IWide").finish();
    for name in [&first, &second] {
        b.method(iface, name).virtual_().abstract_().finish();
    }
    let widget = b.class("Lib", "Widget").implements(TypeRef::Named(iface)).module(lib).finish();
    for name in [&first, &second] {
        b.method(widget, name).virtual_().finish();
    }
    let asm = b.build().unwrap();
    let mut cx = Compiler::new(&asm, test_config()).unwrap();
    cx.register_type(&TypeRef::Named(widget)).unwrap();
    cx.drain().unwrap();

    let class = cx.class_for(&TypeRef::Named(widget)).unwrap();
    assert_eq!(cx.class_info(class).imt[bucket].len(), 2);
    let module = cx.generate_module().unwrap();
    assert!(module.get_global(&format!("Lib.Widget.imt.{bucket}")).is_none());
    let rtti = module.global(module.get_global("Lib.Widget.rtti").unwrap());
    assert!(rtti.initializer.is_none());
}

#[test]
fn test_value_type_interface_slot_uses_trampoline() {
    let mut b = AssemblyBuilder::with_core_library("App");
    let printable = b.interface("App", "IPrintable").finish();
    b.method(printable, "Print").virtual_().abstract_().returns(TypeRef::INT32).finish();
    let point = b.value_type("App", "Point").implements(TypeRef::Named(printable)).finish();
    b.field(point, "x", TypeRef::INT32);
    let print = b
        .method(point, "Print")
        .virtual_()
        .returns(TypeRef::INT32)
        .body(|body| {
            body.emit(Instruction::LdcI4(1));
            body.emit(Instruction::Ret);
        })
        .finish();
    let asm = b.build().unwrap();
    let mut cx = Compiler::new(&asm, test_config()).unwrap();
    cx.process_module().unwrap();
    cx.drain().unwrap();

    let class = cx.class_for(&TypeRef::Named(point)).unwrap();
    let function = cx.function_of(&MethodRef::new(TypeRef::Named(point), print)).unwrap();
    let bucket = bucket_of(method_id("System.Int32 App.IPrintable::Print()"));
    let entries = &cx.class_info(class).imt[bucket];
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].function, function);

    let trampoline = cx.trampoline_of(function).unwrap();
    let module = cx.generate_module().unwrap();
    let func = module.function(trampoline);
    assert_eq!(func.name, "System.Int32 App.Point::Print()_UnboxTrampoline");
    assert_eq!(func.linkage, Linkage::LinkOnceAny);
    assert!(!func.is_declaration());
}

#[test]
fn test_generic_instances_get_separate_bodies() {
    let mut b = AssemblyBuilder::with_core_library("App");
    let holder = b.class("App", "Holder").generic_param("T").finish();
    let id = b
        .method(holder, "Id")
        .static_()
        .param("value", TypeRef::type_param(0))
        .returns(TypeRef::type_param(0))
        .body(|body| {
            body.emit(Instruction::Ldarg(0));
            body.emit(Instruction::Ret);
        })
        .finish();
    let program = b.class("App", "Program").finish();
    let of = |arg: TypeRef| TypeRef::GenericInstance { def: holder, args: vec![arg] };
    let main = b
        .method(program, "Main")
        .static_()
        .returns(TypeRef::INT32)
        .body(|body| {
            body.emit(Instruction::LdcI4(5));
            body.emit(Instruction::Call(MethodRef::new(of(TypeRef::INT32), id)));
            body.emit(Instruction::Pop);
            body.emit(Instruction::LdcR8(1.5));
            body.emit(Instruction::Call(MethodRef::new(of(TypeRef::DOUBLE), id)));
            body.emit(Instruction::Pop);
            body.emit(Instruction::LdcI4(0));
            body.emit(Instruction::Ret);
        })
        .finish();
    b.entry_point(main);
    let asm = b.build().unwrap();

    let mut cx = Compiler::new(&asm, test_config()).unwrap();
    assert_eq!(cx.process_module().unwrap(), 1);
    let module = cx.generate_module().unwrap();

    let bodies: Vec<&str> = module
        .defined_functions()
        .map(|(_, f)| f.name.as_str())
        .filter(|name| name.contains("::Id("))
        .collect();
    assert_eq!(bodies.len(), 2);
    assert!(bodies.iter().any(|n| n.contains("App.Holder<System.Int32>")));
    assert!(bodies.iter().any(|n| n.contains("App.Holder<System.Double>")));
    assert!(module.get_function("main").is_some());
}

#[test]
fn test_open_type_is_a_resolution_failure() {
    let mut b = AssemblyBuilder::with_core_library("App");
    let holder = b.class("App", "Holder").generic_param("T").finish();
    let asm = b.build().unwrap();
    let mut cx = Compiler::new(&asm, test_config()).unwrap();
    let open = TypeRef::GenericInstance { def: holder, args: vec![TypeRef::type_param(0)] };
    let err = cx.register_type(&open).unwrap_err();
    assert!(matches!(err, ilaot_engine::CompileError::GenericResolutionFailure { .. }));
}
