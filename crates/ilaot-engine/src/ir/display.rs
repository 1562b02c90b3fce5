//! Pretty-printing for IR
//!
//! Textual dump of a whole module, loosely following LLVM assembly syntax.

use std::fmt::{self, Write};

use super::instr::{
    BinOp, Block, Callee, CastOp, CheckedOp, FloatPredicate, FunctionBody, Instr, IntPredicate,
    Terminator, Value,
};
use super::module::{Constant, Function, Linkage, Module};

impl fmt::Display for Linkage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Linkage::External => "external",
            Linkage::ExternalWeak => "extern_weak",
            Linkage::LinkOnceAny => "linkonce",
            Linkage::Private => "private",
            Linkage::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::SDiv => "sdiv",
            BinOp::UDiv => "udiv",
            BinOp::SRem => "srem",
            BinOp::URem => "urem",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::AShr => "ashr",
            BinOp::LShr => "lshr",
            BinOp::FAdd => "fadd",
            BinOp::FSub => "fsub",
            BinOp::FMul => "fmul",
            BinOp::FDiv => "fdiv",
            BinOp::FRem => "frem",
        };
        f.write_str(s)
    }
}

impl fmt::Display for CheckedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckedOp::SAdd => "sadd.with.overflow",
            CheckedOp::UAdd => "uadd.with.overflow",
            CheckedOp::SSub => "ssub.with.overflow",
            CheckedOp::USub => "usub.with.overflow",
            CheckedOp::SMul => "smul.with.overflow",
            CheckedOp::UMul => "umul.with.overflow",
        };
        f.write_str(s)
    }
}

impl fmt::Display for IntPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntPredicate::Eq => "eq",
            IntPredicate::Ne => "ne",
            IntPredicate::Sgt => "sgt",
            IntPredicate::Sge => "sge",
            IntPredicate::Slt => "slt",
            IntPredicate::Sle => "sle",
            IntPredicate::Ugt => "ugt",
            IntPredicate::Uge => "uge",
            IntPredicate::Ult => "ult",
            IntPredicate::Ule => "ule",
        };
        f.write_str(s)
    }
}

impl fmt::Display for FloatPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FloatPredicate::Oeq => "oeq",
            FloatPredicate::One => "one",
            FloatPredicate::Ogt => "ogt",
            FloatPredicate::Oge => "oge",
            FloatPredicate::Olt => "olt",
            FloatPredicate::Ole => "ole",
            FloatPredicate::Ueq => "ueq",
            FloatPredicate::Une => "une",
            FloatPredicate::Ugt => "ugt",
            FloatPredicate::Uge => "uge",
            FloatPredicate::Ult => "ult",
            FloatPredicate::Ule => "ule",
        };
        f.write_str(s)
    }
}

impl fmt::Display for CastOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CastOp::Trunc => "trunc",
            CastOp::ZExt => "zext",
            CastOp::SExt => "sext",
            CastOp::FpToSi => "fptosi",
            CastOp::FpToUi => "fptoui",
            CastOp::SiToFp => "sitofp",
            CastOp::UiToFp => "uitofp",
            CastOp::FpTrunc => "fptrunc",
            CastOp::FpExt => "fpext",
            CastOp::PtrToInt => "ptrtoint",
            CastOp::IntToPtr => "inttoptr",
            CastOp::Bitcast => "bitcast",
        };
        f.write_str(s)
    }
}

/// Formatting context: operands need the module for symbol names
struct Printer<'a> {
    module: &'a Module,
    body: Option<&'a FunctionBody>,
}

impl Printer<'_> {
    fn value(&self, v: &Value) -> String {
        match v {
            Value::Reg(r) => r.to_string(),
            Value::Int { value, .. } => value.to_string(),
            Value::Float { value, .. } => format!("{:?}", value),
            Value::Null => "null".to_string(),
            Value::Undef(_) => "undef".to_string(),
            Value::Global(g) => format!("@{}", self.module.global(*g).name),
            Value::Function(func) => format!("@{}", self.module.function(*func).name),
        }
    }

    /// `type value`
    fn typed(&self, v: &Value) -> String {
        let ty = match self.body {
            Some(body) => body.value_type(v),
            None => super::types::IrType::Ptr,
        };
        format!("{} {}", self.module.type_name(ty), self.value(v))
    }

    fn args(&self, args: &[Value]) -> String {
        args.iter().map(|a| self.typed(a)).collect::<Vec<_>>().join(", ")
    }

    fn callee(&self, callee: &Callee) -> String {
        match callee {
            Callee::Direct(func) => format!("@{}", self.module.function(*func).name),
            Callee::Indirect { ptr, .. } => self.value(ptr),
        }
    }

    fn label(&self, id: super::instr::BlockId) -> String {
        match self.body {
            Some(body) => format!("%{}", body.block(id).name),
            None => id.to_string(),
        }
    }

    fn constant(&self, c: &Constant) -> String {
        match c {
            Constant::Int { value, .. } => value.to_string(),
            Constant::Float { value, .. } => format!("{:?}", value),
            Constant::Null => "null".to_string(),
            Constant::Zero(_) => "zeroinitializer".to_string(),
            Constant::Struct { fields, .. } => {
                let inner: Vec<String> = fields.iter().map(|f| self.constant(f)).collect();
                format!("{{ {} }}", inner.join(", "))
            }
            Constant::Array { elements, .. } => {
                let inner: Vec<String> = elements.iter().map(|e| self.constant(e)).collect();
                format!("[{}]", inner.join(", "))
            }
            Constant::GlobalAddr(g) => format!("@{}", self.module.global(*g).name),
            Constant::FuncAddr(func) => format!("@{}", self.module.function(*func).name),
            Constant::TaggedGlobalAddr { global, tag } => {
                format!("(@{} + {})", self.module.global(*global).name, tag)
            }
            Constant::Bytes(bytes) => {
                let mut s = String::from("c\"");
                for b in bytes {
                    let _ = write!(s, "\\{:02X}", b);
                }
                s.push('"');
                s
            }
        }
    }

    fn instr(&self, instr: &Instr) -> String {
        let m = self.module;
        match instr {
            Instr::Alloca { dest, ty, count } => match count {
                Some(n) => format!("{} = alloca {}, {}", dest, m.type_name(*ty), self.typed(n)),
                None => format!("{} = alloca {}", dest, m.type_name(*ty)),
            },
            Instr::Load { dest, ty, ptr, volatile, align } => format!(
                "{} = load{} {}, ptr {}{}",
                dest,
                if *volatile { " volatile" } else { "" },
                m.type_name(*ty),
                self.value(ptr),
                align.map(|a| format!(", align {}", a)).unwrap_or_default()
            ),
            Instr::Store { value, ptr, volatile, align } => format!(
                "store{} {}, ptr {}{}",
                if *volatile { " volatile" } else { "" },
                self.typed(value),
                self.value(ptr),
                align.map(|a| format!(", align {}", a)).unwrap_or_default()
            ),
            Instr::Gep { dest, base_ty, ptr, indices } => format!(
                "{} = getelementptr inbounds {}, ptr {}, {}",
                dest,
                m.type_name(*base_ty),
                self.value(ptr),
                self.args(indices)
            ),
            Instr::MemSet { ptr, byte, len, volatile } => format!(
                "call void @memset(ptr {}, {}, {}, i1 {})",
                self.value(ptr),
                self.typed(byte),
                self.typed(len),
                volatile
            ),
            Instr::MemCopy { dest, src, len, volatile } => format!(
                "call void @memcpy(ptr {}, ptr {}, {}, i1 {})",
                self.value(dest),
                self.value(src),
                self.typed(len),
                volatile
            ),
            Instr::CmpXchg { dest, ptr, expected, new } => format!(
                "{} = cmpxchg ptr {}, {}, {}",
                dest,
                self.value(ptr),
                self.typed(expected),
                self.typed(new)
            ),
            Instr::Binary { dest, op, lhs, rhs } => {
                format!("{} = {} {}, {}", dest, op, self.typed(lhs), self.value(rhs))
            }
            Instr::CheckedBinary { dest, overflow, op, lhs, rhs } => format!(
                "{}, {} = {} {}, {}",
                dest,
                overflow,
                op,
                self.typed(lhs),
                self.value(rhs)
            ),
            Instr::FNeg { dest, value } => format!("{} = fneg {}", dest, self.typed(value)),
            Instr::ICmp { dest, pred, lhs, rhs } => {
                format!("{} = icmp {} {}, {}", dest, pred, self.typed(lhs), self.value(rhs))
            }
            Instr::FCmp { dest, pred, lhs, rhs } => {
                format!("{} = fcmp {} {}, {}", dest, pred, self.typed(lhs), self.value(rhs))
            }
            Instr::Cast { dest, op, value, ty } => {
                format!("{} = {} {} to {}", dest, op, self.typed(value), m.type_name(*ty))
            }
            Instr::Call { dest, callee, args, tail } => {
                let prefix = dest.map(|d| format!("{} = ", d)).unwrap_or_default();
                format!(
                    "{}{}call {}({})",
                    prefix,
                    if *tail { "tail " } else { "" },
                    self.callee(callee),
                    self.args(args)
                )
            }
            Instr::LandingPad { exn, selector, catches, cleanup } => {
                let mut s = format!("{}, {} = landingpad", exn, selector);
                if *cleanup {
                    s.push_str(" cleanup");
                }
                for c in catches {
                    let _ = write!(s, " catch ptr @{}", m.global(*c).name);
                }
                s
            }
        }
    }

    fn terminator(&self, term: &Terminator) -> String {
        match term {
            Terminator::Br(t) => format!("br label {}", self.label(*t)),
            Terminator::CondBr { cond, then_block, else_block } => format!(
                "br {}, label {}, label {}",
                self.typed(cond),
                self.label(*then_block),
                self.label(*else_block)
            ),
            Terminator::Switch { value, default, cases } => {
                let cases: Vec<String> =
                    cases.iter().map(|(v, b)| format!("{}: label {}", v, self.label(*b))).collect();
                format!("switch {}, label {} [{}]", self.typed(value), self.label(*default), cases.join(", "))
            }
            Terminator::Ret(None) => "ret void".to_string(),
            Terminator::Ret(Some(v)) => format!("ret {}", self.typed(v)),
            Terminator::Invoke { dest, callee, args, normal, unwind } => {
                let prefix = dest.map(|d| format!("{} = ", d)).unwrap_or_default();
                format!(
                    "{}invoke {}({}) to label {} unwind label {}",
                    prefix,
                    self.callee(callee),
                    self.args(args),
                    self.label(*normal),
                    self.label(*unwind)
                )
            }
            Terminator::Resume { exn, selector } => {
                format!("resume {}, {}", self.typed(exn), self.typed(selector))
            }
            Terminator::Unreachable => "unreachable".to_string(),
            Terminator::None => "; <no terminator>".to_string(),
        }
    }

    fn block(&self, f: &mut fmt::Formatter<'_>, block: &Block) -> fmt::Result {
        writeln!(f, "{}:", block.name)?;
        for phi in &block.phis {
            let incoming: Vec<String> = phi
                .incoming
                .iter()
                .map(|(v, b)| format!("[ {}, {} ]", self.value(v), self.label(*b)))
                .collect();
            writeln!(f, "  {} = phi {} {}", phi.dest, self.module.type_name(phi.ty), incoming.join(", "))?;
        }
        for instr in &block.instrs {
            writeln!(f, "  {}", self.instr(instr))?;
        }
        writeln!(f, "  {}", self.terminator(&block.terminator))
    }

    fn function(&self, f: &mut fmt::Formatter<'_>, func: &Function) -> fmt::Result {
        let params: Vec<String> = func.sig.params.iter().map(|p| self.module.type_name(*p)).collect();
        let ret = self.module.type_name(func.sig.ret);
        match &func.body {
            None => writeln!(f, "declare {} {} @{}({})", func.linkage, ret, func.name, params.join(", ")),
            Some(body) => {
                let params: Vec<String> = params
                    .iter()
                    .enumerate()
                    .map(|(i, p)| format!("{} {}", p, self.value(&body.param(i))))
                    .collect();
                write!(f, "define {} {} @{}({})", func.linkage, ret, func.name, params.join(", "))?;
                if let Some(p) = func.personality {
                    write!(f, " personality @{}", self.module.function(p).name)?;
                }
                writeln!(f, " {{")?;
                for block in body.ordered_blocks() {
                    self.block(f, block)?;
                }
                writeln!(f, "}}")
            }
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        let globals = Printer { module: self, body: None };

        for (_, s) in self.structs() {
            match &s.body {
                None => writeln!(f, "%\"{}\" = type opaque", s.name)?,
                Some(fields) => {
                    let fields: Vec<String> = fields.iter().map(|t| self.type_name(*t)).collect();
                    let (open, close) = if s.packed { ("<{", "}>") } else { ("{", "}") };
                    writeln!(f, "%\"{}\" = type {} {} {}", s.name, open, fields.join(", "), close)?;
                }
            }
        }

        for (_, g) in self.globals() {
            match &g.initializer {
                Some(init) => writeln!(
                    f,
                    "@{} = {} {} {} {}",
                    g.name,
                    g.linkage,
                    if g.constant { "constant" } else { "global" },
                    self.type_name(g.ty),
                    globals.constant(init)
                )?,
                None => writeln!(f, "@{} = {} global {}", g.name, g.linkage, self.type_name(g.ty))?,
            }
        }

        if !self.ctors.is_empty() {
            let names: Vec<String> =
                self.ctors.iter().map(|c| format!("@{}", self.function(*c).name)).collect();
            writeln!(f, "@llvm.global_ctors = [{}]", names.join(", "))?;
        }

        for (_, func) in self.functions() {
            writeln!(f)?;
            let printer = Printer { module: self, body: func.body.as_ref() };
            printer.function(f, func)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::builder::FunctionBuilder;
    use super::super::instr::FuncSig;
    use super::super::types::IrType;
    use super::*;

    #[test]
    fn test_function_dump() {
        let mut module = Module::new("demo");
        let sig = FuncSig::new(vec![IrType::I32, IrType::I32], IrType::I32);
        let f = module.get_or_declare_function("add", sig, Linkage::External);
        let mut b = FunctionBuilder::new(&[IrType::I32, IrType::I32]);
        let sum = b.binary(BinOp::Add, b.param(0), b.param(1));
        b.ret(Some(sum));
        module.set_body(f, b.finish());

        let text = module.to_string();
        assert!(text.contains("define external i32 @add(i32 %r0, i32 %r1) {"));
        assert!(text.contains("%r2 = add i32 %r0, %r1"));
        assert!(text.contains("ret i32 %r2"));
    }
}
