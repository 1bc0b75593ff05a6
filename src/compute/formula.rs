//! Reverse Polish notation calculator for datasource post-processing.
//!
//! Formulas arrive as a linear token list from the datasource files,
//! e.g. `[8, "mul", "%(ds_max)s", "div", 100, "mul"]` applied after the
//! computed value is pushed first. Operators come from a closed table;
//! nothing is resolved by name against an open namespace.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Formula evaluation error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("unknown formula token {0:?}")]
    UnknownToken(String),
    #[error("operator {0} needs two operands on the stack")]
    StackUnderflow(Op),
    #[error("formula left {0} values on the stack")]
    TrailingOperands(usize),
}

/// The closed set of binary operators a formula may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Gt,
    Lt,
    And,
    Or,
}

impl Op {
    /// Look a token up in the operator table.
    ///
    /// The trailing underscores on `and_`/`or_` match the spellings the
    /// datasource files already use.
    fn from_token(token: &str) -> Option<Op> {
        match token {
            "add" => Some(Op::Add),
            "sub" => Some(Op::Sub),
            "mul" => Some(Op::Mul),
            "div" => Some(Op::Div),
            "eq" => Some(Op::Eq),
            "gt" => Some(Op::Gt),
            "lt" => Some(Op::Lt),
            "and_" => Some(Op::And),
            "or_" => Some(Op::Or),
            _ => None,
        }
    }

    fn apply(self, lhs: &CalcValue, rhs: &CalcValue) -> CalcValue {
        match self {
            Op::Add => CalcValue::Number(lhs.as_f64() + rhs.as_f64()),
            Op::Sub => CalcValue::Number(lhs.as_f64() - rhs.as_f64()),
            Op::Mul => CalcValue::Number(lhs.as_f64() * rhs.as_f64()),
            Op::Div => CalcValue::Number(lhs.as_f64() / rhs.as_f64()),
            Op::Eq => CalcValue::Bool(lhs.as_f64() == rhs.as_f64()),
            Op::Gt => CalcValue::Bool(lhs.as_f64() > rhs.as_f64()),
            Op::Lt => CalcValue::Bool(lhs.as_f64() < rhs.as_f64()),
            Op::And => CalcValue::Bool(lhs.truthy() && rhs.truthy()),
            Op::Or => CalcValue::Bool(lhs.truthy() || rhs.truthy()),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Eq => "eq",
            Op::Gt => "gt",
            Op::Lt => "lt",
            Op::And => "and_",
            Op::Or => "or_",
        };
        f.write_str(name)
    }
}

/// One value on the calculator stack.
#[derive(Debug, Clone, PartialEq)]
pub enum CalcValue {
    Number(f64),
    Bool(bool),
}

impl CalcValue {
    /// Numeric view; booleans count as 1 and 0.
    pub fn as_f64(&self) -> f64 {
        match self {
            CalcValue::Number(n) => *n,
            CalcValue::Bool(true) => 1.0,
            CalcValue::Bool(false) => 0.0,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            CalcValue::Number(n) => *n != 0.0,
            CalcValue::Bool(b) => *b,
        }
    }
}

/// Evaluate a token sequence on a stack machine.
///
/// Null tokens are skipped. A string token is first looked up in the
/// operator table; otherwise it must parse as a number or as the
/// literals `true`/`false` (case-insensitive, whitespace-trimmed). An
/// operator pops `rhs` then `lhs` and pushes `lhs OP rhs`, so the
/// operand pushed first is the left one. At most one value may remain
/// at the end; none is a valid empty result.
pub fn rpn_calculator(elements: &[Value]) -> Result<Option<CalcValue>, FormulaError> {
    let mut stack: Vec<CalcValue> = Vec::new();

    for element in elements {
        if element.is_null() {
            continue;
        }

        if let Some(op) = element.as_str().and_then(Op::from_token) {
            let rhs = stack.pop().ok_or(FormulaError::StackUnderflow(op))?;
            let lhs = stack.pop().ok_or(FormulaError::StackUnderflow(op))?;
            stack.push(op.apply(&lhs, &rhs));
        } else {
            stack.push(parse_literal(element)?);
        }
    }

    if stack.len() > 1 {
        return Err(FormulaError::TrailingOperands(stack.len()));
    }
    Ok(stack.pop())
}

fn parse_literal(element: &Value) -> Result<CalcValue, FormulaError> {
    match element {
        Value::Number(n) => match n.as_f64() {
            Some(f) => Ok(CalcValue::Number(f)),
            None => Err(FormulaError::UnknownToken(n.to_string())),
        },
        Value::Bool(b) => Ok(CalcValue::Bool(*b)),
        Value::String(s) => {
            if let Ok(f) = s.trim().parse::<f64>() {
                return Ok(CalcValue::Number(f));
            }
            match s.trim().to_lowercase().as_str() {
                "true" => Ok(CalcValue::Bool(true)),
                "false" => Ok(CalcValue::Bool(false)),
                _ => Err(FormulaError::UnknownToken(s.clone())),
            }
        }
        other => Err(FormulaError::UnknownToken(other.to_string())),
    }
}
