use std::sync::Arc;

use smol_str::SmolStr;

use crate::error::GuestError;
use crate::host::{CompiledExpression, EventContext, HostFrame, LanguageEvaluator};
use crate::value::Value;

use super::lang::{parse_expression, BinaryOp, Expr, ExprKind, UnaryOp};

pub(super) fn truthy(value: &Value) -> Result<bool, SmolStr> {
    match value {
        Value::Bool(value) => Ok(*value),
        Value::Null => Ok(false),
        Value::Int(value) => Ok(*value != 0),
        other => Err(format!("'{other}' is not a boolean").into()),
    }
}

pub(super) fn apply_unary(op: UnaryOp, value: &Value) -> Result<Value, SmolStr> {
    match (op, value) {
        (UnaryOp::Neg, Value::Int(value)) => Ok(Value::Int(value.wrapping_neg())),
        (UnaryOp::Neg, Value::Float(value)) => Ok(Value::Float(-value)),
        (UnaryOp::Not, value) => Ok(Value::Bool(!truthy(value)?)),
        (UnaryOp::Neg, other) => Err(format!("cannot negate '{other}'").into()),
    }
}

pub(super) fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, SmolStr> {
    use BinaryOp::*;
    let value = match (op, left, right) {
        (Eq, left, right) => Value::Bool(left == right),
        (Ne, left, right) => Value::Bool(left != right),
        (And, left, right) => Value::Bool(truthy(left)? && truthy(right)?),
        (Or, left, right) => Value::Bool(truthy(left)? || truthy(right)?),
        (Add, Value::String(left), right) => Value::String(format!("{left}{right}").into()),
        (Add, left, Value::String(right)) => Value::String(format!("{left}{right}").into()),
        (_, Value::Int(left), Value::Int(right)) => {
            let (left, right) = (*left, *right);
            match op {
                Add => Value::Int(left.wrapping_add(right)),
                Sub => Value::Int(left.wrapping_sub(right)),
                Mul => Value::Int(left.wrapping_mul(right)),
                Div | Rem if right == 0 => return Err("division by zero".into()),
                Div => Value::Int(left.wrapping_div(right)),
                Rem => Value::Int(left.wrapping_rem(right)),
                Lt => Value::Bool(left < right),
                Le => Value::Bool(left <= right),
                Gt => Value::Bool(left > right),
                Ge => Value::Bool(left >= right),
                Eq | Ne | And | Or => unreachable!("handled above"),
            }
        }
        (op, left, right) => {
            return Err(format!("unsupported operands for {op:?}: '{left}' and '{right}'").into());
        }
    };
    Ok(value)
}

/// Evaluates side-effect free expressions against frame locals.
pub struct FrameEvaluator;

impl FrameEvaluator {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

struct Compiled(Expr);

impl Compiled {
    fn evaluate_expr(expr: &Expr, frame: &dyn HostFrame) -> Result<Value, GuestError> {
        match &expr.kind {
            ExprKind::Literal(value) => Ok(value.clone()),
            ExprKind::Var(name) => frame
                .read_local(name)
                .ok_or_else(|| GuestError::new(format!("undefined variable '{name}'"))),
            ExprKind::Unary(op, operand) => {
                let value = Self::evaluate_expr(operand, frame)?;
                apply_unary(*op, &value).map_err(GuestError::new)
            }
            ExprKind::Binary(op, left, right) => {
                let left = Self::evaluate_expr(left, frame)?;
                let right = Self::evaluate_expr(right, frame)?;
                apply_binary(*op, &left, &right).map_err(GuestError::new)
            }
            ExprKind::Call(name, _) => Err(GuestError::new(format!(
                "cannot call '{name}' from the debugger"
            ))),
        }
    }
}

impl CompiledExpression for Compiled {
    fn evaluate(&self, frame: &dyn HostFrame) -> Result<Value, GuestError> {
        Self::evaluate_expr(&self.0, frame)
    }
}

impl LanguageEvaluator for FrameEvaluator {
    fn parse(
        &self,
        _context: Option<&dyn EventContext>,
        code: &str,
    ) -> Result<Arc<dyn CompiledExpression>, GuestError> {
        let expr = parse_expression(code).map_err(|err| GuestError::new(err.to_string()))?;
        Ok(Arc::new(Compiled(expr)))
    }
}
