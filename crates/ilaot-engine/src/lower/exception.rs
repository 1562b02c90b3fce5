//! Protected regions
//!
//! While a try region is active, every call is emitted as an invoke whose
//! unwind edge is the current landing pad. The pad saves the exception and
//! its selector into method slots, marks the pending leave target as unset,
//! and jumps to the innermost handler's dispatch block. Dispatch blocks chain
//! outward until a handler matches or the exception resumes unwinding.
//!
//! `leave` through one or more finally handlers records one numbered exit per
//! handler. Each `endfinally` becomes a switch over the recorded numbers whose
//! default continues unwinding, so the switches can only be closed once the
//! whole body has been lowered.

use ilaot_metadata::ClauseKind;
use rustc_hash::FxHashMap;
use tracing::trace;

use super::{Flow, MethodLowerer};
use crate::error::{CompileError, CompileResult};
use crate::ir::{BlockId, Callee, IntPredicate, IrType, Terminator, Value};
use crate::layout::StackCategory;
use crate::runtime::RuntimeFn;

/// Leave target value meaning "continue unwinding"
const UNSET_TARGET: i32 = -1;

/// Per-method exception bookkeeping
#[derive(Debug, Clone, Copy)]
struct EhSlots {
    exn: Value,
    selector: Value,
    /// Leave target number for the finally handler being run
    target: Value,
}

#[derive(Debug, Default)]
pub(super) struct Regions {
    /// Clauses whose try region covers the current offset, innermost first
    active: Vec<usize>,
    /// Unwind destination for calls at the current offset
    pub landing: Option<BlockId>,
    dispatch: FxHashMap<usize, BlockId>,
    slots: Option<EhSlots>,
    resume: Option<BlockId>,
    next_leave: i32,
    /// Numbered exits out of each finally handler
    exits: FxHashMap<usize, Vec<(i64, BlockId)>>,
    /// `endfinally` blocks waiting for their switch
    endfinally: Vec<(usize, BlockId, Value)>,
    /// Exception object bound at each catch handler's entry
    caught: FxHashMap<usize, Value>,
    pub landing_pads: usize,
}

impl<'c, 'a> MethodLowerer<'c, 'a> {
    pub(super) fn init_exception_slots(&mut self) {
        let exn = self.b.alloca(IrType::Ptr);
        let selector = self.b.alloca(IrType::I32);
        let target = self.b.alloca(IrType::I32);
        self.b.store(Value::Null, exn);
        self.b.store(Value::i32(0), selector);
        self.b.store(Value::i32(0), target);
        self.regions.slots = Some(EhSlots { exn, selector, target });
    }

    fn eh_slots(&self) -> CompileResult<EhSlots> {
        self.regions
            .slots
            .ok_or_else(|| CompileError::malformed("exception handling outside a method with clauses"))
    }

    /// Track the try regions covering the current offset, rebuilding the
    /// landing pad whenever they change
    pub(super) fn update_regions(&mut self) -> CompileResult<()> {
        let body = self.body;
        let offset = self.offset;
        let active: Vec<usize> = body
            .exception_clauses
            .iter()
            .enumerate()
            .filter(|(_, c)| c.try_contains(offset))
            .map(|(i, _)| i)
            .collect();
        if active == self.regions.active {
            return Ok(());
        }
        self.regions.active = active;
        self.regions.landing = if self.regions.active.is_empty() { None } else { Some(self.build_landing_pad()?) };
        Ok(())
    }

    fn build_landing_pad(&mut self) -> CompileResult<BlockId> {
        let body = self.body;
        let slots = self.eh_slots()?;
        let active = self.regions.active.clone();
        let innermost = active
            .first()
            .copied()
            .ok_or_else(|| CompileError::malformed("landing pad without an active region"))?;

        let mut catches = Vec::new();
        let mut cleanup = false;
        for &k in &active {
            match &body.exception_clauses[k].kind {
                ClauseKind::Catch(ty) => {
                    let ty = self.resolve_type(ty)?;
                    catches.push(self.cx.rtti_global(ty));
                }
                ClauseKind::Finally | ClauseKind::Fault => cleanup = true,
            }
        }

        let here = self.b.current_block();
        let first = self.dispatch(innermost)?;
        let pad = self.b.create_block(&format!("lpad.{}", self.regions.landing_pads));
        self.b.switch_to_block(pad);
        let (exn, selector) = self.b.landing_pad(catches, cleanup);
        self.b.store(exn, slots.exn);
        self.b.store(selector, slots.selector);
        self.b.store(Value::i32(UNSET_TARGET), slots.target);
        self.b.br(first);
        self.b.switch_to_block(here);

        self.regions.landing_pads += 1;
        trace!(offset = self.offset, clauses = ?active, "landing pad");
        Ok(pad)
    }

    /// Entry of clause `k`'s handling when an exception reaches it
    fn dispatch(&mut self, k: usize) -> CompileResult<BlockId> {
        if let Some(&block) = self.regions.dispatch.get(&k) {
            return Ok(block);
        }
        let body = self.body;
        let clause = &body.exception_clauses[k];
        let handler = self.block_at(clause.handler_start)?;
        let here = self.b.current_block();

        let block = match &clause.kind {
            ClauseKind::Finally => handler,
            ClauseKind::Fault => {
                let block = self.b.create_block("fault.dispatch");
                self.b.switch_to_block(block);
                self.b.br(handler);
                block
            }
            ClauseKind::Catch(ty) => {
                let ty = self.resolve_type(ty)?;
                let rtti = self.cx.rtti_global(ty);
                let slots = self.eh_slots()?;
                let block = self.b.create_block(&format!("catch.dispatch.{k}"));
                self.regions.dispatch.insert(k, block);
                let next = self.outward(k)?;

                self.b.switch_to_block(block);
                let selector = self.b.load(IrType::I32, slots.selector);
                let typeid = self.cx.runtime_fn(RuntimeFn::TypeIdFor);
                let expected = self
                    .b
                    .call(Callee::Direct(typeid), vec![Value::Global(rtti)], IrType::I32)
                    .ok_or_else(|| CompileError::malformed("type id query returned no value"))?;
                let matched = self.b.icmp(IntPredicate::Eq, selector, expected);
                self.b.cond_br(matched, handler, next);
                block
            }
        };
        self.b.switch_to_block(here);
        self.regions.dispatch.insert(k, block);
        Ok(block)
    }

    /// Where an exception goes after clause `k` declines it
    fn outward(&mut self, k: usize) -> CompileResult<BlockId> {
        let body = self.body;
        let start = body.exception_clauses[k].try_start;
        let enclosing = body
            .exception_clauses
            .iter()
            .enumerate()
            .skip(k + 1)
            .find(|(_, c)| c.try_contains(start))
            .map(|(j, _)| j);
        match enclosing {
            Some(j) => self.dispatch(j),
            None => self.resume_block(),
        }
    }

    fn resume_block(&mut self) -> CompileResult<BlockId> {
        if let Some(block) = self.regions.resume {
            return Ok(block);
        }
        let slots = self.eh_slots()?;
        let here = self.b.current_block();
        let block = self.b.create_block("eh.resume");
        self.b.switch_to_block(block);
        let exn = self.b.load(IrType::Ptr, slots.exn);
        let selector = self.b.load(IrType::I32, slots.selector);
        self.b.resume(exn, selector);
        self.b.switch_to_block(here);
        self.regions.resume = Some(block);
        Ok(block)
    }

    /// Catch handler entry: take ownership of the pending exception
    pub(super) fn begin_catch(&mut self, k: usize) -> CompileResult<()> {
        let body = self.body;
        let ClauseKind::Catch(ty) = &body.exception_clauses[k].kind else {
            return Err(CompileError::malformed("catch entry of a non-catch clause"));
        };
        let slots = self.eh_slots()?;
        let exn = self.b.load(IrType::Ptr, slots.exn);
        self.b.store(Value::Null, slots.exn);
        self.b.store(Value::i32(0), slots.selector);
        self.regions.caught.insert(k, exn);
        let ty = self.resolve_type(ty)?;
        self.push(ty, exn);
        Ok(())
    }

    fn raise(&mut self, exn: Value) {
        let throw = self.cx.runtime_fn(RuntimeFn::Throw);
        self.emit_call(Callee::Direct(throw), vec![exn], IrType::Void);
        self.b.unreachable();
        self.flow = Flow::None;
    }

    pub(super) fn lower_throw(&mut self) -> CompileResult<()> {
        let exn = self.pop()?;
        if exn.category != StackCategory::Object {
            return Err(CompileError::malformed(format!("throw of a {:?} value", exn.category)));
        }
        self.stack.clear();
        self.raise(exn.value);
        Ok(())
    }

    pub(super) fn lower_rethrow(&mut self) -> CompileResult<()> {
        let body = self.body;
        let offset = self.offset;
        let k = body
            .exception_clauses
            .iter()
            .position(|c| matches!(c.kind, ClauseKind::Catch(_)) && c.handler_contains(offset))
            .ok_or_else(|| CompileError::malformed("rethrow outside a catch handler"))?;
        let exn = self
            .regions
            .caught
            .get(&k)
            .copied()
            .ok_or_else(|| CompileError::malformed("rethrow before the catch handler entry"))?;
        self.stack.clear();
        self.raise(exn);
        Ok(())
    }

    /// `leave`: run every finally between here and `target`, innermost first
    pub(super) fn lower_leave(&mut self, target: ilaot_metadata::Offset) -> CompileResult<()> {
        self.stack.clear();
        let body = self.body;
        let finallys: Vec<usize> = self
            .regions
            .active
            .iter()
            .copied()
            .filter(|&k| {
                let clause = &body.exception_clauses[k];
                matches!(clause.kind, ClauseKind::Finally) && !clause.try_contains(target)
            })
            .collect();
        let dest = self.merge_into(target)?;
        self.flow = Flow::None;
        if finallys.is_empty() {
            self.b.br(dest);
            return Ok(());
        }

        let slots = self.eh_slots()?;
        let ids: Vec<i32> = finallys
            .iter()
            .map(|_| {
                let id = self.regions.next_leave;
                self.regions.next_leave += 1;
                id
            })
            .collect();
        let here = self.b.current_block();
        for (n, &k) in finallys.iter().enumerate() {
            let next = match finallys.get(n + 1) {
                Some(&outer) => {
                    let handler = self.block_at(body.exception_clauses[outer].handler_start)?;
                    let hop = self.b.create_block(&format!("leave.{}", ids[n]));
                    self.b.switch_to_block(hop);
                    self.b.store(Value::i32(ids[n + 1]), slots.target);
                    self.b.br(handler);
                    hop
                }
                None => dest,
            };
            self.regions.exits.entry(k).or_default().push((ids[n] as i64, next));
        }
        self.b.switch_to_block(here);
        let first = self.block_at(body.exception_clauses[finallys[0]].handler_start)?;
        self.b.store(Value::i32(ids[0]), slots.target);
        self.b.br(first);
        trace!(target, exits = finallys.len(), "leave through finally");
        Ok(())
    }

    pub(super) fn lower_endfinally(&mut self) -> CompileResult<()> {
        let body = self.body;
        let offset = self.offset;
        let k = body
            .exception_clauses
            .iter()
            .position(|c| matches!(c.kind, ClauseKind::Finally | ClauseKind::Fault) && c.handler_contains(offset))
            .ok_or_else(|| CompileError::malformed("endfinally outside a finally or fault handler"))?;
        self.stack.clear();
        self.flow = Flow::None;
        if let ClauseKind::Fault = body.exception_clauses[k].kind {
            let next = self.outward(k)?;
            self.b.br(next);
            return Ok(());
        }
        let slots = self.eh_slots()?;
        let target = self.b.load(IrType::I32, slots.target);
        let block = self.b.current_block();
        self.regions.endfinally.push((k, block, target));
        Ok(())
    }

    /// Turn every `endfinally` into a switch over its handler's exits
    pub(super) fn close_finally_switches(&mut self) -> CompileResult<()> {
        let pending = std::mem::take(&mut self.regions.endfinally);
        for (k, block, value) in pending {
            let default = self.outward(k)?;
            let cases = self.regions.exits.get(&k).cloned().unwrap_or_default();
            self.b.body_mut().block_mut(block).terminator = Terminator::Switch { value, default, cases };
        }
        Ok(())
    }
}
