//! ilaot metadata model
//!
//! This crate provides the resolved type, field and method definitions, the
//! typed instruction stream and exception clauses consumed by the ilaot
//! lowering engine, plus an in-memory builder for assembling input.

#![warn(rust_2018_idioms)]

pub mod assembly;
pub mod body;
pub mod builder;
pub mod instruction;
pub mod references;
pub mod types;

pub use assembly::{
    Assembly, ClassLayout, FieldDef, FieldRef, MetadataError, MethodDef, MethodImpl, MethodRef,
    ModuleInfo, Param, PInvokeInfo, TypeDef, TypeKind, WellKnown,
};
pub use body::{ClauseKind, ExceptionClause, InstructionAt, MethodBody};
pub use builder::{AssemblyBuilder, BodyBuilder, Label, MethodBuilder, TypeBuilder};
pub use instruction::{
    BinaryOp, BranchCondition, CallSiteSig, CompareOp, ConvTarget, ElementKind, FlowControl,
    IndirectKind, Instruction, Offset, OverflowCheck, UnaryOp,
};
pub use references::Reference;
pub use types::{FieldDefId, GenericOwner, MethodDefId, ModuleId, PrimitiveType, TypeDefId, TypeRef};
