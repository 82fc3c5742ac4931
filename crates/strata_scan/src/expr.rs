//! Expression-evaluation hook for group-by keys and aggregates.
//!
//! The scan pipeline never interprets expressions itself; a collaborator
//! supplies an evaluator and the pipeline feeds it indexed columns as cover
//! values. Pure index-position grouping never calls the hook.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Result, ScanError};

/// Environment one evaluation sees: indexed columns by name, plus the
/// document id when the expression depends on it.
#[derive(Debug, Default)]
pub struct EvalEnv {
    pub covers: BTreeMap<String, Value>,
    pub docid: Option<Vec<u8>>,
}

/// Opaque expression evaluator supplied by the request compiler.
pub trait ExprEvaluator: Send + Sync {
    fn evaluate(&self, expr: &str, env: &EvalEnv) -> Result<Value>;
}

/// Evaluator for requests whose groups and aggregates are all index-position
/// references or precomputed constants. Reaching it is a request-compiler
/// bug, so it fails loudly instead of guessing.
#[derive(Debug, Default)]
pub struct NoopEvaluator;

impl ExprEvaluator for NoopEvaluator {
    fn evaluate(&self, expr: &str, _env: &EvalEnv) -> Result<Value> {
        Err(ScanError::Expr(format!(
            "no evaluator configured for expression {expr:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_evaluator_rejects_every_expression() {
        let env = EvalEnv::default();
        assert!(matches!(
            NoopEvaluator.evaluate("LOWER(`city`)", &env),
            Err(ScanError::Expr(_))
        ));
    }
}
