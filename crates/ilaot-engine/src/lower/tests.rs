use ilaot_metadata::{
    Assembly, AssemblyBuilder, BinaryOp, ClauseKind, ConvTarget, Instruction, MethodRef, OverflowCheck, TypeDefId,
    TypeRef,
};

use crate::compiler::Compiler;
use crate::config::CompilerConfig;
use crate::error::{CompileError, CompileResult};
use crate::ir::{Block, CastOp, FunctionBody, Instr, Module, Terminator};

fn compile(asm: &Assembly) -> CompileResult<Module> {
    let config = CompilerConfig { test_mode: true, ..Default::default() };
    let mut cx = Compiler::new(asm, config)?;
    cx.process_module()?;
    cx.generate_module()
}

fn body_of<'m>(module: &'m Module, name: &str) -> &'m FunctionBody {
    let (_, f) = module
        .defined_functions()
        .find(|(_, f)| f.name.contains(name))
        .unwrap_or_else(|| panic!("no function named like {name}"));
    f.body.as_ref().unwrap()
}

fn block<'b>(body: &'b FunctionBody, name: &str) -> &'b Block {
    body.blocks.iter().find(|b| b.name == name).unwrap_or_else(|| panic!("no block {name}"))
}

fn has_block(body: &FunctionBody, prefix: &str) -> bool {
    body.blocks.iter().any(|b| b.name.starts_with(prefix))
}

fn program(b: &mut AssemblyBuilder) -> TypeDefId {
    b.class("App", "Program").finish()
}

#[test]
fn test_straight_line_arithmetic() {
    let mut b = AssemblyBuilder::with_core_library("App");
    let p = program(&mut b);
    b.method(p, "Add")
        .static_()
        .param("a", TypeRef::INT32)
        .param("b", TypeRef::INT32)
        .returns(TypeRef::INT32)
        .body(|body| {
            body.emit(Instruction::Ldarg(0));
            body.emit(Instruction::Ldarg(1));
            body.emit(Instruction::Binary { op: BinaryOp::Add, overflow: OverflowCheck::None });
            body.emit(Instruction::Ret);
        })
        .finish();
    let asm = b.build().unwrap();

    let module = compile(&asm).unwrap();
    let body = body_of(&module, "::Add(");
    let adds = body
        .blocks
        .iter()
        .flat_map(|b| &b.instrs)
        .filter(|i| matches!(i, Instr::Binary { op: crate::ir::BinOp::Add, .. }))
        .count();
    assert_eq!(adds, 1);
    assert!(body.blocks.iter().any(|b| matches!(b.terminator, Terminator::Ret(Some(_)))));
}

#[test]
fn test_stack_merge_creates_phi() {
    let mut b = AssemblyBuilder::with_core_library("App");
    let p = program(&mut b);
    b.method(p, "Pick")
        .static_()
        .param("flag", TypeRef::INT32)
        .returns(TypeRef::INT32)
        .body(|body| {
            let one = body.label();
            let done = body.label();
            body.emit(Instruction::Ldarg(0));
            body.brtrue(one);
            body.emit(Instruction::LdcI4(10));
            body.br(done);
            body.mark(one);
            body.emit(Instruction::LdcI4(20));
            body.mark(done);
            body.emit(Instruction::Ret);
        })
        .finish();
    let asm = b.build().unwrap();

    let module = compile(&asm).unwrap();
    let body = body_of(&module, "::Pick(");
    let joins: Vec<&Block> = body.blocks.iter().filter(|b| !b.phis.is_empty()).collect();
    assert_eq!(joins.len(), 1);
    assert_eq!(joins[0].phis.len(), 1);
    assert_eq!(joins[0].phis[0].incoming.len(), 2);
}

#[test]
fn test_merge_of_float_and_object_is_malformed() {
    let mut b = AssemblyBuilder::with_core_library("App");
    let p = program(&mut b);
    b.method(p, "Mixed")
        .static_()
        .param("flag", TypeRef::INT32)
        .body(|body| {
            let other = body.label();
            let done = body.label();
            body.emit(Instruction::Ldarg(0));
            body.brtrue(other);
            body.emit(Instruction::Ldnull);
            body.br(done);
            body.mark(other);
            body.emit(Instruction::LdcR8(1.5));
            body.mark(done);
            body.emit(Instruction::Pop);
            body.emit(Instruction::Ret);
        })
        .finish();
    let asm = b.build().unwrap();

    let err = compile(&asm).unwrap_err();
    assert!(matches!(err, CompileError::Lowering { .. }));
    assert!(matches!(err.root(), CompileError::MalformedInput { .. }));
}

#[test]
fn test_backward_branch_with_stack_is_malformed() {
    let mut b = AssemblyBuilder::with_core_library("App");
    let p = program(&mut b);
    b.method(p, "Spin")
        .static_()
        .body(|body| {
            let top = body.here();
            body.emit(Instruction::LdcI4(1));
            body.br(top);
        })
        .finish();
    let asm = b.build().unwrap();

    let err = compile(&asm).unwrap_err();
    assert!(err.to_string().contains("backward branch"));
}

#[test]
fn test_checked_add_branches_to_overflow() {
    let mut b = AssemblyBuilder::with_core_library("App");
    let p = program(&mut b);
    b.method(p, "Checked")
        .static_()
        .param("a", TypeRef::INT32)
        .returns(TypeRef::INT32)
        .body(|body| {
            body.emit(Instruction::Ldarg(0));
            body.emit(Instruction::LdcI4(1));
            body.emit(Instruction::Binary { op: BinaryOp::Add, overflow: OverflowCheck::Signed });
            body.emit(Instruction::Ret);
        })
        .finish();
    let asm = b.build().unwrap();

    let module = compile(&asm).unwrap();
    let body = body_of(&module, "::Checked(");
    assert!(has_block(body, "ovf.throw"));
    assert!(has_block(body, "ovf.cont"));
    let throw = module.get_function("ilaot_throw_overflow").unwrap();
    assert!(matches!(block(body, "ovf.throw").terminator, Terminator::Unreachable));
    assert!(block(body, "ovf.throw").instrs.iter().any(|i| matches!(
        i,
        Instr::Call { callee: crate::ir::Callee::Direct(f), .. } if *f == throw
    )));
}

#[test]
fn test_isinst_joins_null_and_object() {
    let mut b = AssemblyBuilder::with_core_library("App");
    let p = program(&mut b);
    let object = TypeRef::Named(b.assembly().well_known(ilaot_metadata::WellKnown::Object).unwrap());
    b.method(p, "AsProgram")
        .static_()
        .param("o", object.clone())
        .returns(object)
        .body(|body| {
            body.emit(Instruction::Ldarg(0));
            body.emit(Instruction::Isinst(TypeRef::Named(p)));
            body.emit(Instruction::Ret);
        })
        .finish();
    let asm = b.build().unwrap();

    let module = compile(&asm).unwrap();
    let body = body_of(&module, "::AsProgram(");
    let merge = block(body, "cast.merge");
    assert_eq!(merge.phis.len(), 1);
    assert_eq!(merge.phis[0].incoming.len(), 3);
    assert!(has_block(body, "cast.ancestor"));
}

#[test]
fn test_try_catch_gets_landing_pad() {
    let mut b = AssemblyBuilder::with_core_library("App");
    let exception = b.assembly().well_known(ilaot_metadata::WellKnown::Exception).unwrap();
    let error = b.class("App", "Failure").base(TypeRef::Named(exception)).finish();
    let error_ctor = b
        .ctor(error)
        .body(|body| {
            body.emit(Instruction::Ret);
        })
        .finish();
    let p = program(&mut b);
    let fail = b
        .method(p, "Fail")
        .static_()
        .body(|body| {
            body.emit(Instruction::Newobj(MethodRef::new(TypeRef::Named(error), error_ctor)));
            body.emit(Instruction::Throw);
        })
        .finish();
    b.method(p, "Guarded")
        .static_()
        .body(|body| {
            let end = body.label();
            let try_start = body.here();
            body.emit(Instruction::Call(MethodRef::new(TypeRef::Named(p), fail)));
            body.leave(end);
            let handler = body.here();
            body.emit(Instruction::Pop);
            body.leave(end);
            let handler_end = body.here();
            body.mark(end);
            body.emit(Instruction::Ret);
            body.clause(ClauseKind::Catch(TypeRef::Named(error)), try_start, handler, handler, handler_end);
        })
        .finish();
    let asm = b.build().unwrap();

    let module = compile(&asm).unwrap();
    let (_, guarded) = module.defined_functions().find(|(_, f)| f.name.contains("::Guarded(")).unwrap();
    assert_eq!(guarded.personality, module.get_function("ilaot_personality"));
    let body = guarded.body.as_ref().unwrap();

    let pads: Vec<&Instr> =
        body.blocks.iter().flat_map(|b| &b.instrs).filter(|i| matches!(i, Instr::LandingPad { .. })).collect();
    assert_eq!(pads.len(), 1);
    let Instr::LandingPad { catches, cleanup, .. } = pads[0] else { unreachable!() };
    assert_eq!(catches.len(), 1);
    assert!(!cleanup);

    assert!(body.blocks.iter().any(|b| matches!(b.terminator, Terminator::Invoke { .. })));
    assert!(has_block(body, "catch.dispatch.0"));
    assert!(matches!(block(body, "eh.resume").terminator, Terminator::Resume { .. }));
}

#[test]
fn test_leave_through_nested_finally() {
    let mut b = AssemblyBuilder::with_core_library("App");
    let p = program(&mut b);
    b.method(p, "Nested")
        .static_()
        .body(|body| {
            let end = body.label();
            let outer_try = body.here();
            let inner_try = body.here();
            body.emit(Instruction::Nop);
            body.leave(end);
            let inner_handler = body.here();
            body.emit(Instruction::Endfinally);
            let inner_end = body.here();
            body.leave(end);
            let outer_handler = body.here();
            body.emit(Instruction::Endfinally);
            let outer_end = body.here();
            body.mark(end);
            body.emit(Instruction::Ret);
            body.clause(ClauseKind::Finally, inner_try, inner_handler, inner_handler, inner_end);
            body.clause(ClauseKind::Finally, outer_try, outer_handler, outer_handler, outer_end);
        })
        .finish();
    let asm = b.build().unwrap();

    let module = compile(&asm).unwrap();
    let body = body_of(&module, "::Nested(");
    let mut switches: Vec<&Vec<(i64, crate::ir::BlockId)>> = body
        .blocks
        .iter()
        .filter_map(|b| match &b.terminator {
            Terminator::Switch { cases, .. } => Some(cases),
            _ => None,
        })
        .collect();
    switches.sort_by_key(|cases| cases.len());
    assert_eq!(switches.len(), 2);

    // inner finally hands off to the outer one
    let hop = block(body, "leave.0");
    assert_eq!(switches[0].as_slice(), &[(0, hop.id)]);
    assert!(matches!(hop.terminator, Terminator::Br(_)));

    // outer finally resumes at the leave target from both leaves
    let outer: Vec<i64> = switches[1].iter().map(|(id, _)| *id).collect();
    assert_eq!(outer, vec![1, 2]);
    assert_eq!(switches[1][0].1, switches[1][1].1);
}

fn casts(body: &FunctionBody) -> Vec<CastOp> {
    body.blocks
        .iter()
        .flat_map(|b| &b.instrs)
        .filter_map(|i| match i {
            Instr::Cast { op, .. } => Some(*op),
            _ => None,
        })
        .collect()
}

#[test]
fn test_conversion_family() {
    use CastOp::*;
    use ConvTarget as T;
    use OverflowCheck as O;
    let (i4, i8, r8) = (TypeRef::INT32, TypeRef::INT64, TypeRef::DOUBLE);
    // source, target, check, result, required casts, forbidden casts, overflow branch
    let cases = [
        (i4.clone(), T::I8, O::None, i8.clone(), vec![SExt], vec![ZExt], false),
        (i4.clone(), T::U8, O::None, i8.clone(), vec![ZExt], vec![SExt], false),
        (i4.clone(), T::I8, O::Signed, i8.clone(), vec![SExt], vec![ZExt], false),
        (i4.clone(), T::I8, O::Unsigned, i8.clone(), vec![ZExt], vec![SExt], false),
        (i4.clone(), T::U8, O::Unsigned, i8.clone(), vec![ZExt], vec![SExt], false),
        (i4.clone(), T::U8, O::Signed, i8.clone(), vec![SExt], vec![ZExt], true),
        (i8.clone(), T::I4, O::Signed, i4.clone(), vec![Trunc, SExt], vec![ZExt], true),
        (i4.clone(), T::U1, O::Unsigned, i4.clone(), vec![Trunc, ZExt], vec![SExt], true),
        (r8.clone(), T::I4, O::Signed, i4.clone(), vec![FpToSi, SiToFp], vec![FpToUi], true),
        (r8.clone(), T::U4, O::None, i4.clone(), vec![FpToUi], vec![FpToSi], false),
        (i4.clone(), T::R8, O::None, r8.clone(), vec![SiToFp], vec![UiToFp], false),
        (i4.clone(), T::RUn, O::None, r8.clone(), vec![UiToFp], vec![SiToFp], false),
    ];

    let mut b = AssemblyBuilder::with_core_library("App");
    let p = program(&mut b);
    for (index, (source, target, overflow, result, ..)) in cases.iter().enumerate() {
        let (target, overflow) = (*target, *overflow);
        b.method(p, &format!("C{index}"))
            .static_()
            .param("value", source.clone())
            .returns(result.clone())
            .body(move |body| {
                body.emit(Instruction::Ldarg(0));
                body.emit(Instruction::Conv { target, overflow });
                body.emit(Instruction::Ret);
            })
            .finish();
    }
    let asm = b.build().unwrap();
    let module = compile(&asm).unwrap();

    for (index, (_, target, overflow, _, required, forbidden, checked)) in cases.iter().enumerate() {
        let body = body_of(&module, &format!("::C{index}("));
        let ops = casts(body);
        let case = format!("{target:?} {overflow:?}");
        for op in required {
            assert!(ops.contains(op), "{case}: missing {op:?} in {ops:?}");
        }
        for op in forbidden {
            assert!(!ops.contains(op), "{case}: unexpected {op:?} in {ops:?}");
        }
        assert_eq!(has_block(body, "ovf.throw"), *checked, "{case}");
    }
}

#[test]
fn test_unsigned_checked_widening_zero_extends() {
    let mut b = AssemblyBuilder::with_core_library("App");
    let p = program(&mut b);
    b.method(p, "Widen")
        .static_()
        .param("value", TypeRef::INT32)
        .returns(TypeRef::INT64)
        .body(|body| {
            body.emit(Instruction::Ldarg(0));
            body.emit(Instruction::Conv { target: ConvTarget::I8, overflow: OverflowCheck::Unsigned });
            body.emit(Instruction::Ret);
        })
        .finish();
    let asm = b.build().unwrap();

    let module = compile(&asm).unwrap();
    let body = body_of(&module, "::Widen(");
    assert_eq!(casts(body), vec![CastOp::ZExt]);
    assert!(!has_block(body, "ovf.throw"));
}
