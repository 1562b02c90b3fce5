//! Method bodies and exception clauses

use serde::{Deserialize, Serialize};

use crate::instruction::{Instruction, Offset};
use crate::types::TypeRef;

/// An instruction together with its byte offset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionAt {
    pub offset: Offset,
    pub instr: Instruction,
}

/// Handler kind of an exception clause
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClauseKind {
    Catch(TypeRef),
    Finally,
    Fault,
}

/// A protected region and its handler; ranges are half-open
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExceptionClause {
    pub kind: ClauseKind,
    pub try_start: Offset,
    pub try_end: Offset,
    pub handler_start: Offset,
    pub handler_end: Offset,
}

impl ExceptionClause {
    pub fn try_contains(&self, offset: Offset) -> bool {
        offset >= self.try_start && offset < self.try_end
    }

    pub fn handler_contains(&self, offset: Offset) -> bool {
        offset >= self.handler_start && offset < self.handler_end
    }
}

/// Decoded body of an IL method
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    #[serde(default)]
    pub locals: Vec<TypeRef>,
    #[serde(default = "default_init_locals")]
    pub init_locals: bool,
    pub instructions: Vec<InstructionAt>,
    #[serde(default)]
    pub exception_clauses: Vec<ExceptionClause>,
}

fn default_init_locals() -> bool {
    true
}

impl MethodBody {
    /// Byte length of the encoded body
    pub fn code_size(&self) -> Offset {
        self.instructions.last().map(|i| i.offset + i.instr.encoded_size()).unwrap_or(0)
    }

    /// Index of the instruction starting at `offset`
    pub fn index_of(&self, offset: Offset) -> Option<usize> {
        self.instructions.binary_search_by_key(&offset, |i| i.offset).ok()
    }

    /// Offset of the instruction following `index` (code size at the end)
    pub fn next_offset(&self, index: usize) -> Offset {
        let at = &self.instructions[index];
        at.offset + at.instr.encoded_size()
    }
}
