//! Reference host for driving the debugger in tests.
//!
//! An in-memory instrumenter, a small tree-walking guest language and an
//! expression evaluator over frame locals.

#![allow(missing_docs)]

mod eval;
mod instrumenter;
mod interp;
mod lang;

use std::sync::Arc;

pub use eval::FrameEvaluator;
pub use instrumenter::MemoryInstrumenter;
pub use interp::{Frame, Interpreter, RunError};
pub use lang::{
    parse_expression, BinaryOp, Expr, ExprKind, Function, NodeInfo, ParseError, Program, Stmt,
    StmtKind, UnaryOp, LANGUAGE,
};

use crate::config::DebuggerConfig;
use crate::debugger::Debugger;
use crate::value::Value;

/// A host runtime with a debugger attached.
pub struct TestHost {
    interpreter: Arc<Interpreter>,
    debugger: Debugger,
}

impl TestHost {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DebuggerConfig::default())
    }

    #[must_use]
    pub fn with_config(config: DebuggerConfig) -> Self {
        let instrumenter = MemoryInstrumenter::new();
        let debugger = Debugger::builder(instrumenter.clone())
            .evaluator(FrameEvaluator::new())
            .config(config)
            .build();
        Self {
            interpreter: Interpreter::new(instrumenter),
            debugger,
        }
    }

    /// Creates a host with `text` loaded as `uri`.
    pub fn from_source(uri: &str, text: &str) -> Result<Self, ParseError> {
        let host = Self::new();
        host.load(uri, text)?;
        Ok(host)
    }

    pub fn load(&self, uri: &str, text: &str) -> Result<Arc<Program>, ParseError> {
        self.interpreter.load(uri, text)
    }

    /// Call a guest function on the current thread.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, RunError> {
        self.interpreter.call(name, args)
    }

    #[must_use]
    pub fn debugger(&self) -> &Debugger {
        &self.debugger
    }

    #[must_use]
    pub fn interpreter(&self) -> &Arc<Interpreter> {
        &self.interpreter
    }

    #[must_use]
    pub fn instrumenter(&self) -> &Arc<MemoryInstrumenter> {
        self.interpreter.instrumenter()
    }

    #[must_use]
    pub fn output(&self) -> Vec<String> {
        self.interpreter.output()
    }
}

impl Default for TestHost {
    fn default() -> Self {
        Self::new()
    }
}
