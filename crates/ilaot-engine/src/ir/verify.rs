//! Structural IR checks
//!
//! Every laid-out block must be terminated and every phi must carry exactly
//! one incoming value per predecessor edge.

use thiserror::Error;

use super::instr::FunctionBody;
use super::module::Module;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("{function}: block '{block}' has no terminator")]
    Unterminated { function: String, block: String },

    #[error("{function}: phi in block '{block}' has {incoming} incoming values for {preds} predecessor edges")]
    PhiMismatch { function: String, block: String, incoming: usize, preds: usize },

    #[error("{function}: phi in block '{block}' names a block that is not a predecessor")]
    PhiForeignBlock { function: String, block: String },
}

/// Verify one function body
pub fn verify_body(name: &str, body: &FunctionBody) -> Result<(), VerifyError> {
    for block in body.ordered_blocks() {
        if block.terminator.is_none() {
            return Err(VerifyError::Unterminated { function: name.to_string(), block: block.name.clone() });
        }
    }
    for block in body.ordered_blocks() {
        if block.phis.is_empty() {
            continue;
        }
        let mut preds = body.predecessors(block.id);
        preds.sort();
        for phi in &block.phis {
            if phi.incoming.len() != preds.len() {
                return Err(VerifyError::PhiMismatch {
                    function: name.to_string(),
                    block: block.name.clone(),
                    incoming: phi.incoming.len(),
                    preds: preds.len(),
                });
            }
            let mut from: Vec<_> = phi.incoming.iter().map(|(_, b)| *b).collect();
            from.sort();
            if from != preds {
                return Err(VerifyError::PhiForeignBlock { function: name.to_string(), block: block.name.clone() });
            }
        }
    }
    Ok(())
}

/// Verify every defined function of a module
pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    for (_, func) in module.defined_functions() {
        if let Some(body) = &func.body {
            verify_body(&func.name, body)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::builder::FunctionBuilder;
    use super::super::instr::Value;
    use super::super::types::IrType;
    use super::*;

    #[test]
    fn test_detects_missing_terminator() {
        let mut b = FunctionBuilder::new(&[]);
        b.create_block("dangling");
        b.ret(None);
        let err = verify_body("f", &b.finish()).unwrap_err();
        assert_eq!(err, VerifyError::Unterminated { function: "f".into(), block: "dangling".into() });
    }

    #[test]
    fn test_phi_incoming_counts() {
        let mut b = FunctionBuilder::new(&[IrType::I1]);
        let left = b.create_block("left");
        let right = b.create_block("right");
        let join = b.create_block("join");
        b.cond_br(b.param(0), left, right);
        b.switch_to_block(left);
        b.br(join);
        b.switch_to_block(right);
        b.br(join);
        let phi = b.phi(join, IrType::I32);
        b.add_incoming(join, phi, Value::i32(1), left);
        b.switch_to_block(join);
        b.ret(Some(phi.into()));

        let err = verify_body("f", b.body()).unwrap_err();
        assert!(matches!(err, VerifyError::PhiMismatch { incoming: 1, preds: 2, .. }));

        b.add_incoming(join, phi, Value::i32(2), right);
        assert!(verify_body("f", b.body()).is_ok());
    }
}
