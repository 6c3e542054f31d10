use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use smol_str::SmolStr;
use thiserror::Error;
use tracing::trace;

use crate::error::{Interrupt, KillSignal};
use crate::host::{
    BindingId, CallStack, ExecutionEventListener, ExecutionPoint, HostFrame, TryBlock, UnwindAction,
};
use crate::source::SourceSection;
use crate::value::{GuestException, Value};

use super::eval::{apply_binary, apply_unary, truthy};
use super::instrumenter::MemoryInstrumenter;
use super::lang::{BinaryOp, Expr, ExprKind, NodeInfo, ParseError, Program, Stmt, StmtKind};

const MAX_DEPTH: usize = 200;

/// Outcome of a guest call that did not return normally.
#[derive(Debug, Clone, Error)]
pub enum RunError {
    /// A debugging session killed the call.
    #[error("{0}")]
    Killed(KillSignal),
    #[error("uncaught exception: {}", .0.message())]
    Exception(Arc<GuestException>),
    #[error("{0}")]
    Runtime(SmolStr),
}

/// A guest call frame.
pub struct Frame {
    name: SmolStr,
    internal: bool,
    locals: Mutex<FxHashMap<SmolStr, Value>>,
    current: Mutex<Option<SourceSection>>,
    try_blocks: Mutex<Vec<TryBlock>>,
}

impl Frame {
    fn new(name: SmolStr, internal: bool) -> Self {
        Self {
            name,
            internal,
            locals: Mutex::new(FxHashMap::default()),
            current: Mutex::new(None),
            try_blocks: Mutex::new(Vec::new()),
        }
    }

    fn reset(&self, params: &[SmolStr], args: &[Value]) {
        let mut locals = self.locals.lock();
        locals.clear();
        locals.extend(params.iter().cloned().zip(args.iter().cloned()));
        self.try_blocks.lock().clear();
    }

    fn set(&self, name: &SmolStr, value: Value) {
        self.locals.lock().insert(name.clone(), value);
    }
}

impl HostFrame for Frame {
    fn name(&self) -> Option<SmolStr> {
        Some(self.name.clone())
    }

    fn source_section(&self) -> Option<SourceSection> {
        self.current.lock().clone()
    }

    fn read_local(&self, name: &str) -> Option<Value> {
        self.locals.lock().get(name).cloned()
    }

    fn is_internal(&self) -> bool {
        self.internal
    }

    fn enclosing_try_blocks(&self) -> Vec<TryBlock> {
        self.try_blocks.lock().iter().rev().cloned().collect()
    }
}

struct Stack<'a>(&'a [Arc<Frame>]);

impl CallStack for Stack<'_> {
    fn frames(&self) -> Vec<Arc<dyn HostFrame>> {
        self.0
            .iter()
            .rev()
            .map(|frame| frame.clone() as Arc<dyn HostFrame>)
            .collect()
    }
}

enum Flow {
    Return(Value),
    Throw(Arc<GuestException>),
    Interrupt(Interrupt),
}

type Listeners = Vec<(BindingId, Arc<dyn ExecutionEventListener>)>;

/// Tree-walking interpreter notifying the instrumenter at every node.
///
/// Calls may run concurrently on any number of threads.
pub struct Interpreter {
    instrumenter: Arc<MemoryInstrumenter>,
    programs: RwLock<Vec<Arc<Program>>>,
    output: Mutex<Vec<String>>,
    next_node: AtomicU64,
}

impl Interpreter {
    #[must_use]
    pub fn new(instrumenter: Arc<MemoryInstrumenter>) -> Arc<Self> {
        Arc::new(Self {
            instrumenter,
            programs: RwLock::new(Vec::new()),
            output: Mutex::new(Vec::new()),
            next_node: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn instrumenter(&self) -> &Arc<MemoryInstrumenter> {
        &self.instrumenter
    }

    /// Parse `text` and announce it to source listeners.
    pub fn load(&self, uri: &str, text: &str) -> Result<Arc<Program>, ParseError> {
        let first = self.next_node.load(Ordering::Acquire);
        let program = Arc::new(Program::parse_with_ids(uri, text, first)?);
        self.next_node
            .fetch_max(program.last_node_id() + 1, Ordering::AcqRel);
        self.programs.write().push(program.clone());
        self.instrumenter.load_source(program.source.clone());
        Ok(program)
    }

    /// Lines printed by guest `print` statements.
    #[must_use]
    pub fn output(&self) -> Vec<String> {
        self.output.lock().clone()
    }

    fn program_defining(&self, name: &str) -> Option<Arc<Program>> {
        self.programs
            .read()
            .iter()
            .rev()
            .find(|program| program.function(name).is_some())
            .cloned()
    }

    /// Call a guest function on the current thread.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, RunError> {
        let mut exec = Exec {
            interp: self,
            frames: Vec::new(),
        };
        match exec.call_function(name, args, None) {
            Ok(value) | Err(Flow::Return(value)) => Ok(value),
            Err(Flow::Throw(exception)) => Err(RunError::Exception(exception)),
            Err(Flow::Interrupt(Interrupt::Kill(signal))) => {
                trace!(function = name, "guest call killed");
                Err(RunError::Killed(signal))
            }
            Err(Flow::Interrupt(Interrupt::Unwind(signal))) => Err(RunError::Runtime(
                format!("unwind to frame {} left the guest call", signal.depth()).into(),
            )),
        }
    }
}

struct Exec<'a> {
    interp: &'a Interpreter,
    frames: Vec<Arc<Frame>>,
}

impl Exec<'_> {
    fn top(&self) -> Option<&Arc<Frame>> {
        self.frames.last()
    }

    fn throw(&self, message: impl Into<SmolStr>, info: &NodeInfo) -> Flow {
        let message = message.into();
        Flow::Throw(GuestException::thrown_at(
            Value::String(message.clone()),
            message,
            info.section.clone(),
        ))
    }

    /// Run `body` as the node `info`, notifying the attached listeners.
    fn instrumented(
        &mut self,
        info: &NodeInfo,
        mut body: impl FnMut(&mut Self) -> Result<Value, Flow>,
    ) -> Result<Value, Flow> {
        loop {
            if let Some(frame) = self.top() {
                *frame.current.lock() = Some(info.section.clone());
            }
            let listeners = self.interp.instrumenter.listeners_at(info);
            let result = match self.notify_enter(info, &listeners) {
                Ok(()) => body(self),
                Err(interrupt) => Err(Flow::Interrupt(interrupt)),
            };
            let listeners = self.interp.instrumenter.listeners_at(info);
            return match result {
                Ok(value) => self.notify_return(info, &listeners, value),
                Err(Flow::Return(value)) => {
                    let value = self.notify_return(info, &listeners, value)?;
                    Err(Flow::Return(value))
                }
                Err(Flow::Throw(exception)) => {
                    self.notify_exceptional(info, &listeners, &exception)?;
                    Err(Flow::Throw(exception))
                }
                Err(Flow::Interrupt(Interrupt::Unwind(signal))) => {
                    if self.notify_unwind(info, &listeners)? {
                        trace!(node = info.id.0, "re-entering node after unwind");
                        continue;
                    }
                    Err(Flow::Interrupt(Interrupt::Unwind(signal)))
                }
                Err(kill) => Err(kill),
            };
        }
    }

    fn notify_enter(&self, info: &NodeInfo, listeners: &Listeners) -> Result<(), Interrupt> {
        let stack = Stack(&self.frames);
        let point = ExecutionPoint::new(info, &stack);
        for (_, listener) in listeners {
            listener.on_enter(point)?;
        }
        Ok(())
    }

    fn notify_return(
        &self,
        info: &NodeInfo,
        listeners: &Listeners,
        mut value: Value,
    ) -> Result<Value, Flow> {
        let stack = Stack(&self.frames);
        let point = ExecutionPoint::new(info, &stack);
        for (_, listener) in listeners.iter().rev() {
            match listener.on_return_value(point, &value) {
                Ok(Some(replaced)) => value = replaced,
                Ok(None) => {}
                Err(interrupt) => return Err(Flow::Interrupt(interrupt)),
            }
        }
        Ok(value)
    }

    fn notify_exceptional(
        &self,
        info: &NodeInfo,
        listeners: &Listeners,
        exception: &Arc<GuestException>,
    ) -> Result<(), Flow> {
        let stack = Stack(&self.frames);
        let point = ExecutionPoint::new(info, &stack);
        for (_, listener) in listeners.iter().rev() {
            listener
                .on_return_exceptional(point, exception)
                .map_err(Flow::Interrupt)?;
        }
        Ok(())
    }

    /// Returns whether a listener asked to re-enter the node.
    fn notify_unwind(&self, info: &NodeInfo, listeners: &Listeners) -> Result<bool, Flow> {
        let stack = Stack(&self.frames);
        let point = ExecutionPoint::new(info, &stack);
        let mut reenter = false;
        for (_, listener) in listeners.iter().rev() {
            if listener.on_unwind(point).map_err(Flow::Interrupt)? == UnwindAction::Reenter {
                reenter = true;
            }
        }
        Ok(reenter)
    }

    fn call_function(
        &mut self,
        name: &str,
        args: Vec<Value>,
        site: Option<&NodeInfo>,
    ) -> Result<Value, Flow> {
        let Some(program) = self.interp.program_defining(name) else {
            return Err(match site {
                Some(site) => self.throw(format!("unknown function '{name}'"), site),
                None => Flow::Throw(GuestException::new(
                    Value::from(name),
                    format!("unknown function '{name}'"),
                )),
            });
        };
        let Some(function) = program.function(name) else {
            return Err(Flow::Throw(GuestException::new(Value::Null, "function vanished")));
        };
        if args.len() != function.params.len() {
            let message = format!(
                "'{name}' expects {} arguments, got {}",
                function.params.len(),
                args.len()
            );
            return Err(self.throw(message, site.unwrap_or(&function.root)));
        }
        if self.frames.len() >= MAX_DEPTH {
            return Err(self.throw("stack overflow", site.unwrap_or(&function.root)));
        }
        let frame = Arc::new(Frame::new(function.name.clone(), function.root.internal));
        self.frames.push(frame.clone());
        let result = self.instrumented(&function.root, |exec| {
            frame.reset(&function.params, &args);
            match exec.block(&function.body) {
                Ok(()) => Ok(Value::Null),
                Err(Flow::Return(value)) => Ok(value),
                Err(other) => Err(other),
            }
        });
        self.frames.pop();
        result
    }

    fn block(&mut self, statements: &[Stmt]) -> Result<(), Flow> {
        for statement in statements {
            self.instrumented(&statement.info, |exec| exec.execute(statement))?;
        }
        Ok(())
    }

    fn condition(&mut self, expr: &Expr) -> Result<bool, Flow> {
        let value = self.expr(expr)?;
        truthy(&value).map_err(|message| self.throw(message, &expr.info))
    }

    fn execute(&mut self, statement: &Stmt) -> Result<Value, Flow> {
        match &statement.kind {
            StmtKind::Assign(name, expr) => {
                let value = self.expr(expr)?;
                if let Some(frame) = self.top() {
                    frame.set(name, value);
                }
            }
            StmtKind::Expr(expr) => {
                self.expr(expr)?;
            }
            StmtKind::While(condition, body) => {
                while self.condition(condition)? {
                    self.block(body)?;
                }
            }
            StmtKind::If(condition, then, otherwise) => {
                if self.condition(condition)? {
                    self.block(then)?;
                } else {
                    self.block(otherwise)?;
                }
            }
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.expr(expr)?,
                    None => Value::Null,
                };
                return Err(Flow::Return(value));
            }
            StmtKind::Throw(expr) => {
                let value = self.expr(expr)?;
                let message = value.to_string();
                return Err(Flow::Throw(GuestException::thrown_at(
                    value,
                    message,
                    statement.info.section.clone(),
                )));
            }
            StmtKind::Try {
                body,
                binding,
                handler,
            } => {
                let frame = self.top().cloned();
                if let Some(frame) = &frame {
                    frame
                        .try_blocks
                        .lock()
                        .push(TryBlock::catch_all(Some(statement.info.section.clone())));
                }
                let result = self.block(body);
                if let Some(frame) = &frame {
                    frame.try_blocks.lock().pop();
                }
                match result {
                    Err(Flow::Throw(exception)) => {
                        if let Some(frame) = &frame {
                            frame.set(binding, exception.value().clone());
                        }
                        self.block(handler)?;
                    }
                    other => other?,
                }
            }
            StmtKind::Debugger => {}
            StmtKind::Print(expr) => {
                let value = self.expr(expr)?;
                self.interp.output.lock().push(value.to_string());
            }
        }
        Ok(Value::Null)
    }

    fn expr(&mut self, expr: &Expr) -> Result<Value, Flow> {
        self.instrumented(&expr.info, |exec| exec.evaluate(expr))
    }

    fn evaluate(&mut self, expr: &Expr) -> Result<Value, Flow> {
        match &expr.kind {
            ExprKind::Literal(value) => Ok(value.clone()),
            ExprKind::Var(name) => self
                .top()
                .and_then(|frame| frame.read_local(name))
                .ok_or_else(|| self.throw(format!("undefined variable '{name}'"), &expr.info)),
            ExprKind::Unary(op, operand) => {
                let value = self.expr(operand)?;
                apply_unary(*op, &value).map_err(|message| self.throw(message, &expr.info))
            }
            ExprKind::Binary(op @ (BinaryOp::And | BinaryOp::Or), left, right) => {
                let left = self.condition(left)?;
                if left == (*op == BinaryOp::Or) {
                    return Ok(Value::Bool(left));
                }
                Ok(Value::Bool(self.condition(right)?))
            }
            ExprKind::Binary(op, left, right) => {
                let left = self.expr(left)?;
                let right = self.expr(right)?;
                apply_binary(*op, &left, &right).map_err(|message| self.throw(message, &expr.info))
            }
            ExprKind::Call(name, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.expr(arg)?);
                }
                if let Some(frame) = self.top() {
                    *frame.current.lock() = Some(expr.info.section.clone());
                }
                self.call_function(name, values, Some(&expr.info))
            }
        }
    }
}

