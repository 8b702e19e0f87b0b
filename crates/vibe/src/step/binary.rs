//! Binary and unary operator semantics on wrapped values.
//!
//! Errors are values: any errored operand propagates, first operand wins.
//! String concatenation treats null as empty text; arithmetic with null
//! yields an errored result.

use crate::{
    error::{ErrorDetails, SourceLoc},
    program::{BinaryOp, UnaryOp},
    value::{Payload, ValueSource, WrappedValue},
};

/// Applies a binary operator. Never panics; failures become errored values
/// carrying the given location.
pub fn apply_binary(op: BinaryOp, lhs: &WrappedValue, rhs: &WrappedValue, loc: SourceLoc) -> WrappedValue {
    if let Some(detail) = lhs.error_details().or_else(|| rhs.error_details()) {
        return WrappedValue::as_error(detail.clone());
    }
    let result = combine(op, lhs.payload(), rhs.payload());
    match result {
        Ok(payload) => WrappedValue::wrap(payload, ValueSource::Literal),
        Err(detail) => WrappedValue::as_error(detail.at(loc)),
    }
}

/// Applies a unary operator.
pub fn apply_unary(op: UnaryOp, operand: &WrappedValue, loc: SourceLoc) -> WrappedValue {
    if let Some(detail) = operand.error_details() {
        return WrappedValue::as_error(detail.clone());
    }
    let result = match (op, operand.payload()) {
        (UnaryOp::Neg, Payload::Int(i)) => i
            .checked_neg()
            .map(Payload::Int)
            .ok_or_else(|| ErrorDetails::value_error("integer overflow in negation")),
        (UnaryOp::Neg, Payload::Float(f)) => Ok(Payload::Float(-f)),
        (UnaryOp::Neg, Payload::Null) => Err(ErrorDetails::value_error("cannot negate null")),
        (UnaryOp::Neg, other) => Err(ErrorDetails::value_error(format!("cannot negate {}", other.type_name()))),
        (UnaryOp::Not, Payload::Bool(b)) => Ok(Payload::Bool(!b)),
        (UnaryOp::Not, other) => Err(ErrorDetails::value_error(format!(
            "'not' requires a boolean, got {}",
            other.type_name()
        ))),
    };
    match result {
        Ok(payload) => WrappedValue::wrap(payload, ValueSource::Literal),
        Err(detail) => WrappedValue::as_error(detail.at(loc)),
    }
}

fn combine(op: BinaryOp, lhs: &Payload, rhs: &Payload) -> Result<Payload, ErrorDetails> {
    match op {
        BinaryOp::Add => add(lhs, rhs),
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => arithmetic(op, lhs, rhs),
        BinaryOp::Eq => Ok(Payload::Bool(payload_eq(lhs, rhs))),
        BinaryOp::Ne => Ok(Payload::Bool(!payload_eq(lhs, rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => compare(op, lhs, rhs),
        BinaryOp::And | BinaryOp::Or => logical(op, lhs, rhs),
    }
}

/// `+` concatenates when either side is text; otherwise it is numeric.
fn add(lhs: &Payload, rhs: &Payload) -> Result<Payload, ErrorDetails> {
    if matches!(lhs, Payload::Text(_)) || matches!(rhs, Payload::Text(_)) {
        // Null renders as empty text in concatenation.
        return Ok(Payload::Text(format!("{}{}", lhs.display_text(), rhs.display_text())));
    }
    arithmetic(BinaryOp::Add, lhs, rhs)
}

fn arithmetic(op: BinaryOp, lhs: &Payload, rhs: &Payload) -> Result<Payload, ErrorDetails> {
    let (a, b) = match (numeric(lhs), numeric(rhs)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            let offender = if numeric(lhs).is_none() { lhs } else { rhs };
            if offender.is_null() {
                return Err(ErrorDetails::value_error(format!(
                    "arithmetic '{}' with null operand",
                    op.symbol()
                )));
            }
            return Err(ErrorDetails::value_error(format!(
                "cannot apply '{}' to {}",
                op.symbol(),
                offender.type_name()
            )));
        }
    };
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => int_arithmetic(op, x, y),
        (x, y) => float_arithmetic(op, x.as_f64(), y.as_f64()),
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }
}

fn numeric(payload: &Payload) -> Option<Num> {
    match payload {
        Payload::Int(i) => Some(Num::Int(*i)),
        Payload::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

fn int_arithmetic(op: BinaryOp, x: i64, y: i64) -> Result<Payload, ErrorDetails> {
    let overflow = || ErrorDetails::value_error("integer overflow");
    match op {
        BinaryOp::Add => x.checked_add(y).map(Payload::Int).ok_or_else(overflow),
        BinaryOp::Sub => x.checked_sub(y).map(Payload::Int).ok_or_else(overflow),
        BinaryOp::Mul => x.checked_mul(y).map(Payload::Int).ok_or_else(overflow),
        BinaryOp::Div => {
            if y == 0 {
                Err(ErrorDetails::value_error("division by zero"))
            } else if x % y == 0 {
                Ok(Payload::Int(x / y))
            } else {
                Ok(Payload::Float(x as f64 / y as f64))
            }
        }
        BinaryOp::Mod => {
            if y == 0 {
                Err(ErrorDetails::value_error("modulo by zero"))
            } else {
                Ok(Payload::Int(x % y))
            }
        }
        _ => unreachable!("arithmetic dispatch covers only + - * / %"),
    }
}

fn float_arithmetic(op: BinaryOp, x: f64, y: f64) -> Result<Payload, ErrorDetails> {
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => {
            if y == 0.0 {
                return Err(ErrorDetails::value_error("division by zero"));
            }
            x / y
        }
        BinaryOp::Mod => {
            if y == 0.0 {
                return Err(ErrorDetails::value_error("modulo by zero"));
            }
            x % y
        }
        _ => unreachable!("arithmetic dispatch covers only + - * / %"),
    };
    if result.is_finite() {
        Ok(Payload::Float(result))
    } else {
        Err(ErrorDetails::value_error("arithmetic produced a non-finite number"))
    }
}

/// Structural equality, with numeric cross-comparison between ints and
/// floats. `x == null` is the runtime's only sanctioned truthiness check.
fn payload_eq(lhs: &Payload, rhs: &Payload) -> bool {
    match (numeric(lhs), numeric(rhs)) {
        (Some(a), Some(b)) => match (a, b) {
            (Num::Int(x), Num::Int(y)) => x == y,
            (x, y) => x.as_f64() == y.as_f64(),
        },
        _ => lhs == rhs,
    }
}

fn compare(op: BinaryOp, lhs: &Payload, rhs: &Payload) -> Result<Payload, ErrorDetails> {
    let ordering = match (lhs, rhs) {
        (Payload::Text(a), Payload::Text(b)) => a.cmp(b),
        _ => match (numeric(lhs), numeric(rhs)) {
            (Some(a), Some(b)) => a
                .as_f64()
                .partial_cmp(&b.as_f64())
                .ok_or_else(|| ErrorDetails::value_error("cannot compare non-finite numbers"))?,
            _ => {
                return Err(ErrorDetails::value_error(format!(
                    "cannot compare {} with {}",
                    lhs.type_name(),
                    rhs.type_name()
                )));
            }
        },
    };
    let result = match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        _ => unreachable!("compare dispatch covers only < <= > >="),
    };
    Ok(Payload::Bool(result))
}

fn logical(op: BinaryOp, lhs: &Payload, rhs: &Payload) -> Result<Payload, ErrorDetails> {
    let (Payload::Bool(a), Payload::Bool(b)) = (lhs, rhs) else {
        let offender = if matches!(lhs, Payload::Bool(_)) { rhs } else { lhs };
        return Err(ErrorDetails::value_error(format!(
            "'{}' requires booleans, got {}",
            op.symbol(),
            offender.type_name()
        )));
    };
    Ok(Payload::Bool(match op {
        BinaryOp::And => *a && *b,
        BinaryOp::Or => *a || *b,
        _ => unreachable!("logical dispatch covers only and/or"),
    }))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn loc() -> SourceLoc {
        SourceLoc::new("test.vibe", 1, 1)
    }

    fn int(v: i64) -> WrappedValue {
        WrappedValue::wrap(Payload::Int(v), ValueSource::Literal)
    }

    fn text(v: &str) -> WrappedValue {
        WrappedValue::wrap(Payload::Text(v.to_owned()), ValueSource::Literal)
    }

    #[test]
    fn integer_addition() {
        let out = apply_binary(BinaryOp::Add, &int(10), &int(20), loc());
        assert_eq!(*out.payload(), Payload::Int(30));
    }

    #[test]
    fn errored_operand_propagates_first() {
        let a = WrappedValue::as_error(ErrorDetails::value_error("lhs bad"));
        let b = WrappedValue::as_error(ErrorDetails::value_error("rhs bad"));
        let out = apply_binary(BinaryOp::Add, &a, &b, loc());
        assert_eq!(out.error_details().unwrap().message, "lhs bad");
        // Transitivity: (a + b) + c still carries a's details.
        let out2 = apply_binary(BinaryOp::Add, &out, &int(1), loc());
        assert_eq!(out2.error_details().unwrap().message, "lhs bad");
    }

    #[test]
    fn arithmetic_with_null_errors() {
        let null = WrappedValue::null();
        let out = apply_binary(BinaryOp::Add, &null, &int(5), loc());
        assert!(out.error_details().unwrap().message.contains("null"));
    }

    #[test]
    fn concat_treats_null_as_empty() {
        let null = WrappedValue::null();
        let out = apply_binary(BinaryOp::Add, &text("a"), &null, loc());
        assert_eq!(*out.payload(), Payload::Text("a".to_owned()));
        let out = apply_binary(BinaryOp::Add, &text("n="), &int(3), loc());
        assert_eq!(*out.payload(), Payload::Text("n=3".to_owned()));
    }

    #[test]
    fn division_produces_float_when_inexact() {
        let out = apply_binary(BinaryOp::Div, &int(10), &int(4), loc());
        assert_eq!(*out.payload(), Payload::Float(2.5));
        let out = apply_binary(BinaryOp::Div, &int(10), &int(2), loc());
        assert_eq!(*out.payload(), Payload::Int(5));
        let out = apply_binary(BinaryOp::Div, &int(1), &int(0), loc());
        assert!(out.is_errored());
    }

    #[test]
    fn equality_crosses_int_and_float() {
        let out = apply_binary(
            BinaryOp::Eq,
            &int(2),
            &WrappedValue::wrap(Payload::Float(2.0), ValueSource::Literal),
            loc(),
        );
        assert_eq!(*out.payload(), Payload::Bool(true));
    }

    #[test]
    fn null_equality_is_the_null_check() {
        let out = apply_binary(BinaryOp::Eq, &WrappedValue::null(), &WrappedValue::null(), loc());
        assert_eq!(*out.payload(), Payload::Bool(true));
        let out = apply_binary(BinaryOp::Eq, &int(1), &WrappedValue::null(), loc());
        assert_eq!(*out.payload(), Payload::Bool(false));
    }

    #[test]
    fn logical_requires_booleans() {
        let out = apply_binary(BinaryOp::And, &int(1), &int(2), loc());
        assert!(out.is_errored());
    }

    #[test]
    fn unary_minus_on_null_errors() {
        let out = apply_unary(UnaryOp::Neg, &WrappedValue::null(), loc());
        assert!(out.is_errored());
    }
}
