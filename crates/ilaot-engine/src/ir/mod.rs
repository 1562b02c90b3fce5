//! SSA intermediate representation
//!
//! The native backend boundary: the engine emits into a [`Module`] and a code
//! generator consumes it.

pub mod builder;
pub mod display;
pub mod instr;
pub mod module;
pub mod types;
pub mod verify;

pub use builder::FunctionBuilder;
pub use instr::{
    BinOp, Block, BlockId, Callee, CastOp, CheckedOp, FloatPredicate, FuncSig, FunctionBody, Instr,
    IntPredicate, Phi, Reg, Terminator, Value,
};
pub use module::{Constant, FuncId, Function, Global, GlobalId, Linkage, Module};
pub use types::{align_to, ArrayTypeId, IrType, StructId, StructType, TargetData};
pub use verify::{verify_body, verify_module, VerifyError};
