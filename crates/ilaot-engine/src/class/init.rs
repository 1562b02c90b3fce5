//! Class initializers
//!
//! `{name}_inittype` claims the descriptor's initialized flag, binds the
//! class's native entry points into their vtable slots and runs the static
//! constructor. Call sites guard it with an inline flag check.

use ilaot_metadata::{MethodImpl, MethodRef};
use tracing::debug;

use crate::class::rtti::{RTTI_INITIALIZED, RTTI_VTABLE};
use crate::class::ClassId;
use crate::compiler::Compiler;
use crate::config::ClassInitPolicy;
use crate::error::CompileResult;
use crate::function::{FunctionId, FunctionKind};
use crate::ir::{Callee, FuncId, FuncSig, FunctionBuilder, IntPredicate, IrType, Linkage, Value};
use crate::runtime::RuntimeFn;

impl<'a> Compiler<'a> {
    pub(crate) fn emit_class_init(&mut self, class: ClassId) -> CompileResult<()> {
        let ty = self.classes[class.0 as usize].ty;
        let owner = self.type_info(ty).ty.clone();
        let asm = self.asm;

        let mut cctor = None;
        if let Some(def) = self.type_info(ty).def {
            if let Some(&m) = asm.type_def(def).methods.iter().find(|m| asm.method(**m).is_static_constructor()) {
                cctor = Some(self.function_of(&MethodRef::new(owner, m))?);
            }
        }
        let natives: Vec<FunctionId> = self.classes[class.0 as usize]
            .vtable
            .iter()
            .copied()
            .filter(|f| {
                let info = self.function_info(*f);
                info.kind == FunctionKind::PInvoke && info.owner == ty
            })
            .collect();
        self.classes[class.0 as usize].cctor = cctor;
        if cctor.is_none() && natives.is_empty() {
            return Ok(());
        }

        let header = self.rtti_types().header;
        let rtti = Value::Global(self.classes[class.0 as usize].rtti);
        let load_library = self.runtime_fn(RuntimeFn::LoadLibrary);
        let get_proc = self.runtime_fn(RuntimeFn::GetProcAddress);

        let mut b = FunctionBuilder::new(&[]);
        let run = b.create_block("run");
        let done = b.create_block("done");
        let flag = b.struct_gep(header, rtti, &[RTTI_INITIALIZED]);
        let first = match self.config.class_init {
            ClassInitPolicy::Relaxed => {
                let state = b.load(IrType::I8, flag);
                b.icmp(IntPredicate::Eq, state, Value::i8(0))
            }
            ClassInitPolicy::Atomic => {
                let previous = b.cmpxchg(flag, Value::i8(0), Value::i8(1));
                b.icmp(IntPredicate::Eq, previous, Value::i8(0))
            }
        };
        b.cond_br(first, run, done);

        b.switch_to_block(run);
        if self.config.class_init == ClassInitPolicy::Relaxed {
            b.store(Value::i8(1), flag);
        }
        for f in &natives {
            let info = self.function_info(*f);
            let MethodImpl::PInvoke(binding) = &asm.method(info.def()).implementation else { continue };
            let Some(slot) = info.slot else { continue };
            let library = Value::Global(self.cstring(&binding.module));
            let entry = Value::Global(self.cstring(&binding.entry_point));
            let handle = b.call(Callee::Direct(load_library), vec![library], IrType::Ptr).unwrap_or(Value::Null);
            let address =
                b.call(Callee::Direct(get_proc), vec![handle, entry], IrType::Ptr).unwrap_or(Value::Null);
            let slot_ptr = b.gep(header, rtti, vec![Value::i32(0), Value::i32(RTTI_VTABLE as i32), Value::i32(slot as i32)]);
            b.store(address, slot_ptr);
        }
        if let Some(func) = cctor.and_then(|c| self.function_info(c).func) {
            b.call(Callee::Direct(func), Vec::new(), IrType::Void);
        }
        b.br(done);
        b.switch_to_block(done);
        b.ret(None);

        let name = format!("{}_inittype", self.type_info(ty).name);
        let init = self.module.get_or_declare_function(&name, FuncSig::new(vec![], IrType::Void), Linkage::LinkOnceAny);
        self.module.set_body(init, b.finish());
        self.classes[class.0 as usize].init = Some(init);
        debug!(ty = %self.type_info(ty).name, natives = natives.len(), cctor = cctor.is_some(), "emitted class initializer");
        Ok(())
    }

    /// Initializer of a class, when it has one
    pub fn class_init_fn(&self, class: ClassId) -> Option<FuncId> {
        self.classes[class.0 as usize].init
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::Compiler;
    use crate::config::{ClassInitPolicy, CompilerConfig};
    use crate::ir::Instr;
    use ilaot_metadata::{AssemblyBuilder, Instruction, TypeRef};

    fn assembly() -> (ilaot_metadata::Assembly, ilaot_metadata::TypeDefId) {
        let mut b = AssemblyBuilder::with_core_library("App");
        let native = b.class("App", "Native").finish();
        b.method(native, "getpid").pinvoke("libc", "getpid").returns(TypeRef::INT32).finish();
        b.cctor(native).body(|body| {
            body.emit(Instruction::Ret);
        }).finish();
        (b.build().unwrap(), native)
    }

    #[test]
    fn test_initializer_binds_natives() {
        let (asm, native) = assembly();
        let mut cx = Compiler::new(&asm, CompilerConfig::default()).unwrap();
        let class = cx.class_for(&TypeRef::Named(native)).unwrap();
        let init = cx.class_init_fn(class).unwrap();
        let func = cx.module().function(init);
        assert_eq!(func.name, "App.Native_inittype");

        let body = func.body.as_ref().unwrap();
        let run = body.find_block("run").unwrap();
        let calls: Vec<_> = body.block(run).instrs.iter().filter(|i| i.is_call()).collect();
        // load library, resolve entry, static constructor
        assert_eq!(calls.len(), 3);
        assert!(cx.module().get_function("ilaot_get_proc_address").is_some());
        assert!(cx.class_info(class).cctor.is_some());
    }

    #[test]
    fn test_atomic_policy_uses_cmpxchg() {
        let (asm, native) = assembly();
        let config = CompilerConfig { class_init: ClassInitPolicy::Atomic, ..Default::default() };
        let mut cx = Compiler::new(&asm, config).unwrap();
        let class = cx.class_for(&TypeRef::Named(native)).unwrap();
        let init = cx.class_init_fn(class).unwrap();
        let body = cx.module().function(init).body.as_ref().unwrap();
        let entry = body.block(body.layout[0]);
        assert!(entry.instrs.iter().any(|i| matches!(i, Instr::CmpXchg { .. })));
    }

    #[test]
    fn test_no_initializer_without_work() {
        let mut b = AssemblyBuilder::with_core_library("App");
        let plain = b.class("App", "Plain").finish();
        let asm = b.build().unwrap();
        let mut cx = Compiler::new(&asm, CompilerConfig::default()).unwrap();
        let class = cx.class_for(&TypeRef::Named(plain)).unwrap();
        assert!(cx.class_init_fn(class).is_none());
    }
}
