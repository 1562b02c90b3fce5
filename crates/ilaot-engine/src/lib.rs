//! ilaot lowering engine
//!
//! Compiles a resolved assembly ahead of time into an SSA [`ir::Module`]:
//! - **Generic resolution**: closing references against a generic context (`resolver`)
//! - **Types and layout**: storage shapes, stack categories, staged completion (`layout`)
//! - **Classes and dispatch**: vtables, interface tables, descriptors, class init (`class`)
//! - **Method lowering**: stack bytecode to SSA, protected regions (`lower`)
//! - **Driver**: `register_type`, `process_module`, `generate_module` (`compiler`)
//!
//! # Example
//!
//! ```rust,ignore
//! use ilaot_engine::{Compiler, CompilerConfig};
//!
//! let asm = ilaot_metadata::Assembly::load(path)?;
//! let mut compiler = Compiler::new(&asm, CompilerConfig::default())?;
//! compiler.process_module()?;
//! let module = compiler.generate_module()?;
//! println!("{}", module);
//! ```

#![warn(rust_2018_idioms)]

pub mod abi;
pub mod class;
pub mod compiler;
pub mod config;
pub mod error;
pub mod function;
pub mod ir;
pub mod layout;
pub mod resolver;
pub mod runtime;

mod lower;

pub use compiler::Compiler;
pub use config::{CharEncoding, ClassInitPolicy, CompilerConfig, ConfigError};
pub use error::{CompileError, CompileResult};
pub use layout::{Completeness, StackCategory, TypeId, TypeInfo};
pub use runtime::RuntimeFn;
