//! Block discovery and stack joins

use std::collections::BTreeSet;

use ilaot_metadata::{ClauseKind, FlowControl, Offset};
use tracing::trace;

use super::{Flow, MethodLowerer, StackValue};
use crate::error::{CompileError, CompileResult};
use crate::ir::{BlockId, IrType, Reg, Value};
use crate::layout::{StackCategory, TypeId};

/// Phi receiving one stack slot at a block entry
#[derive(Debug, Clone, Copy)]
pub(super) struct JoinSlot {
    pub phi: Reg,
    pub ty: IrType,
    pub category: StackCategory,
    pub stack_ty: TypeId,
}

impl<'c, 'a> MethodLowerer<'c, 'a> {
    /// One block per branch target, per instruction following a control
    /// transfer, and per handler entry
    pub(super) fn discover_blocks(&mut self) -> CompileResult<()> {
        let body = self.body;
        let mut starts = BTreeSet::new();
        starts.insert(0);
        for (i, at) in body.instructions.iter().enumerate() {
            starts.extend(at.instr.branch_targets());
            if matches!(
                at.instr.flow_control(),
                FlowControl::Branch | FlowControl::CondBranch | FlowControl::Return | FlowControl::Throw
            ) {
                let next = body.next_offset(i);
                if next < body.code_size() {
                    starts.insert(next);
                }
            }
        }
        for clause in &body.exception_clauses {
            starts.insert(clause.handler_start);
        }

        for offset in starts {
            if body.index_of(offset).is_none() {
                return Err(CompileError::malformed(format!(
                    "{} is not an instruction boundary",
                    Self::block_name(offset)
                )));
            }
            let block = self.b.create_block(&Self::block_name(offset));
            self.blocks.insert(offset, block);
        }
        trace!(blocks = self.blocks.len(), "discovered blocks");
        Ok(())
    }

    pub(super) fn block_at(&self, offset: Offset) -> CompileResult<BlockId> {
        self.blocks
            .get(&offset)
            .copied()
            .ok_or_else(|| CompileError::malformed(format!("no block starts at {}", Self::block_name(offset))))
    }

    /// Hand the current stack to `target` along the edge about to be
    /// emitted from the current block
    pub(super) fn merge_into(&mut self, target: Offset) -> CompileResult<BlockId> {
        let block = self.block_at(target)?;
        let from = self.b.current_block();

        let Some(slots) = self.joins.get(&target).cloned() else {
            if self.visited.contains(&target) && !self.stack.is_empty() {
                return Err(CompileError::malformed(format!(
                    "backward branch to {} with a non-empty stack",
                    Self::block_name(target)
                )));
            }
            let mut slots = Vec::with_capacity(self.stack.len());
            for sv in self.stack.clone() {
                let ty = self.b.value_type(&sv.value);
                let phi = self.b.phi(block, ty);
                self.b.add_incoming(block, phi, sv.value, from);
                slots.push(JoinSlot { phi, ty, category: sv.category, stack_ty: sv.ty });
            }
            self.joins.insert(target, slots);
            return Ok(block);
        };

        if slots.len() != self.stack.len() {
            return Err(CompileError::malformed(format!(
                "stack depth {} does not match {} at {}",
                self.stack.len(),
                slots.len(),
                Self::block_name(target)
            )));
        }
        for (slot, sv) in slots.iter().zip(self.stack.clone()) {
            if slot.category != sv.category {
                return Err(CompileError::malformed(format!(
                    "stack slot kinds {:?} and {:?} meet at {}",
                    slot.category,
                    sv.category,
                    Self::block_name(target)
                )));
            }
            let signed = self.cx.is_signed(sv.ty);
            let value = self.coerce(sv.value, slot.ty, signed)?;
            self.b.add_incoming(block, slot.phi, value, from);
        }
        Ok(block)
    }

    /// Rebuild the stack at a block start
    pub(super) fn enter_block(&mut self, offset: Offset) -> CompileResult<()> {
        self.visited.insert(offset);
        let body = self.body;
        if let Some(index) = body.exception_clauses.iter().position(|c| c.handler_start == offset) {
            self.stack.clear();
            if let ClauseKind::Catch(_) = &body.exception_clauses[index].kind {
                self.begin_catch(index)?;
            }
            return Ok(());
        }
        self.stack = match self.joins.get(&offset) {
            Some(slots) => slots
                .iter()
                .map(|s| StackValue { category: s.category, ty: s.stack_ty, value: Value::Reg(s.phi) })
                .collect(),
            None => Vec::new(),
        };
        Ok(())
    }

    pub(super) fn lower_switch(&mut self, targets: &[Offset]) -> CompileResult<()> {
        let selector = self.pop()?;
        let value = self.int_value(selector);
        let value = self.b.int_cast(value, IrType::I32, false);
        let mut cases = Vec::with_capacity(targets.len());
        for (i, target) in targets.iter().enumerate() {
            cases.push((i as i64, self.merge_into(*target)?));
        }
        let fallthrough = self.merge_into(self.next_offset)?;
        self.b.switch(value, fallthrough, cases);
        self.flow = Flow::Explicit;
        Ok(())
    }
}
