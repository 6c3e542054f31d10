use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;
use tracing::trace;

use crate::error::GuestError;
use crate::host::{CompiledExpression, ExecutionPoint, LanguageEvaluator, NodeId};
use crate::session::{SessionShared, SuspensionGuard};
use crate::stable::StableBoolean;
use crate::value::Value;

struct Cached {
    version: u64,
    expression: Arc<dyn CompiledExpression>,
}

/// Breakpoint condition with per-node parse cache.
///
/// Parsed expressions are tagged with the condition version and reparsed
/// after the text changes.
pub(super) struct Condition {
    text: Mutex<Option<SmolStr>>,
    version: AtomicU64,
    exists: StableBoolean,
    cache: Mutex<FxHashMap<NodeId, Cached>>,
}

impl Condition {
    pub(super) fn new(text: Option<SmolStr>) -> Self {
        let text = text.filter(|text| !text.trim().is_empty());
        Self {
            exists: StableBoolean::new(text.is_some()),
            text: Mutex::new(text),
            version: AtomicU64::new(0),
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    pub(super) fn is_set(&self) -> bool {
        self.exists.get()
    }

    pub(super) fn text(&self) -> Option<SmolStr> {
        self.text.lock().clone()
    }

    pub(super) fn set(&self, text: Option<SmolStr>) {
        let mut current = self.text.lock();
        self.exists.set(text.is_some());
        *current = text;
        self.version.fetch_add(1, Ordering::AcqRel);
        self.cache.lock().clear();
    }

    /// Evaluate with suspension disabled in `sessions` on this thread.
    ///
    /// Failures and non-boolean results count as true and are returned.
    pub(super) fn evaluate(
        &self,
        breakpoint: u64,
        point: ExecutionPoint<'_>,
        evaluator: Option<Arc<dyn LanguageEvaluator>>,
        sessions: &[Arc<SessionShared>],
    ) -> (bool, Option<GuestError>) {
        let (text, version) = {
            let text = self.text.lock();
            (text.clone(), self.version.load(Ordering::Acquire))
        };
        let Some(text) = text else {
            return (true, None);
        };
        let Some(evaluator) = evaluator else {
            return (
                true,
                Some(GuestError::new("no language evaluator for breakpoint conditions")),
            );
        };
        let expression = match self.compiled(point, &text, version, evaluator.as_ref()) {
            Ok(expression) => expression,
            Err(err) => return (true, Some(err)),
        };
        let Some(frame) = point.top_frame() else {
            return (true, Some(GuestError::new("no frame to evaluate the condition in")));
        };

        let result = {
            let _guard = SuspensionGuard::new(sessions, std::thread::current().id());
            expression.evaluate(frame.as_ref())
        };
        trace!(breakpoint, condition = %text, result = ?result, "condition evaluated");
        match result {
            Ok(Value::Bool(value)) => (value, None),
            Ok(value) => (
                true,
                Some(GuestError::with_value(
                    format!("condition '{text}' did not evaluate to a boolean"),
                    value,
                )),
            ),
            Err(err) => (true, Some(err)),
        }
    }

    fn compiled(
        &self,
        point: ExecutionPoint<'_>,
        text: &str,
        version: u64,
        evaluator: &dyn LanguageEvaluator,
    ) -> Result<Arc<dyn CompiledExpression>, GuestError> {
        let node = point.context.node_id();
        if let Some(cached) = self.cache.lock().get(&node) {
            if cached.version == version {
                return Ok(cached.expression.clone());
            }
        }
        let expression = evaluator.parse(Some(point.context), text)?;
        if self.version.load(Ordering::Acquire) == version {
            self.cache.lock().insert(
                node,
                Cached {
                    version,
                    expression: expression.clone(),
                },
            );
        }
        Ok(expression)
    }
}
