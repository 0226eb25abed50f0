//! Evaluates parsed expressions. Null, false, zero and empty values are falsy.

use super::parser::{CmpOp, Expr};
use super::ExpressionError;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

/// A runtime value. Dicts keep insertion order and allow non-string keys.
#[derive(Debug, Clone)]
pub enum Val {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<Val>),
    Dict(Vec<(Val, Val)>),
}

impl Val {
    pub fn truthy(&self) -> bool {
        match self {
            Val::Null => false,
            Val::Bool(b) => *b,
            Val::Num(n) => *n != 0.0,
            Val::Str(s) => !s.is_empty(),
            Val::List(items) => !items.is_empty(),
            Val::Dict(entries) => !entries.is_empty(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Val::Null => "null",
            Val::Bool(_) => "bool",
            Val::Num(_) => "number",
            Val::Str(_) => "str",
            Val::List(_) => "list",
            Val::Dict(_) => "dict",
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Val::Num(n) => Some(*n),
            Val::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn loose_eq(&self, other: &Val) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a == b;
        }
        match (self, other) {
            (Val::Null, Val::Null) => true,
            (Val::Str(a), Val::Str(b)) => a == b,
            (Val::List(a), Val::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Val::Dict(a), Val::Dict(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        b.iter()
                            .any(|(k2, v2)| k.loose_eq(k2) && v.loose_eq(v2))
                    })
            }
            _ => false,
        }
    }

    fn order(&self, other: &Val, op: CmpOp) -> Result<Ordering, ExpressionError> {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a.partial_cmp(&b).ok_or_else(|| unorderable(op, self, other));
        }
        match (self, other) {
            (Val::Str(a), Val::Str(b)) => Ok(a.cmp(b)),
            (Val::List(a), Val::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    if !x.loose_eq(y) {
                        return x.order(y, op);
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            _ => Err(unorderable(op, self, other)),
        }
    }

    fn contains(&self, needle: &Val) -> Result<bool, ExpressionError> {
        match self {
            Val::List(items) => Ok(items.iter().any(|item| item.loose_eq(needle))),
            Val::Dict(entries) => Ok(entries.iter().any(|(k, _)| k.loose_eq(needle))),
            Val::Str(haystack) => match needle {
                Val::Str(n) => Ok(haystack.contains(n.as_str())),
                other => Err(ExpressionError::Evaluation(format!(
                    "'in <str>' requires str as left operand, not {}",
                    other.type_name()
                ))),
            },
            other => Err(ExpressionError::Evaluation(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }
}

impl From<&Value> for Val {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Val::Null,
            Value::Bool(b) => Val::Bool(*b),
            Value::Number(n) => Val::Num(n.as_f64().unwrap_or_default()),
            Value::String(s) => Val::Str(s.clone()),
            Value::Array(items) => Val::List(items.iter().map(Val::from).collect()),
            Value::Object(map) => Val::Dict(
                map.iter()
                    .map(|(k, v)| (Val::Str(k.clone()), Val::from(v)))
                    .collect(),
            ),
        }
    }
}

fn unorderable(op: CmpOp, left: &Val, right: &Val) -> ExpressionError {
    let symbol = match op {
        CmpOp::Lt => "<",
        CmpOp::Le => "<=",
        CmpOp::Gt => ">",
        CmpOp::Ge => ">=",
        _ => "comparison",
    };
    ExpressionError::Evaluation(format!(
        "'{}' not supported between '{}' and '{}'",
        symbol,
        left.type_name(),
        right.type_name()
    ))
}

pub fn eval(expr: &Expr) -> Result<Val, ExpressionError> {
    match expr {
        Expr::Null => Ok(Val::Null),
        Expr::Bool(b) => Ok(Val::Bool(*b)),
        Expr::Number(n) => Ok(Val::Num(*n)),
        Expr::Str(s) => Ok(Val::Str(s.clone())),
        Expr::List(items) => Ok(Val::List(
            items.iter().map(eval).collect::<Result<_, _>>()?,
        )),
        Expr::Dict(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                out.push((eval(k)?, eval(v)?));
            }
            Ok(Val::Dict(out))
        }
        Expr::Not(inner) => Ok(Val::Bool(!eval(inner)?.truthy())),
        Expr::And(left, right) => {
            let l = eval(left)?;
            if l.truthy() {
                eval(right)
            } else {
                Ok(l)
            }
        }
        Expr::Or(left, right) => {
            let l = eval(left)?;
            if l.truthy() {
                Ok(l)
            } else {
                eval(right)
            }
        }
        Expr::Compare(first, rest) => {
            let mut left = eval(first)?;
            for (op, operand) in rest {
                let right = eval(operand)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Val::Bool(false));
                }
                left = right;
            }
            Ok(Val::Bool(true))
        }
        Expr::Call(name, args) => {
            let values = args.iter().map(eval).collect::<Result<Vec<_>, _>>()?;
            call(name, &values)
        }
    }
}

fn compare(op: CmpOp, left: &Val, right: &Val) -> Result<bool, ExpressionError> {
    Ok(match op {
        CmpOp::Eq => left.loose_eq(right),
        CmpOp::Ne => !left.loose_eq(right),
        CmpOp::Lt => left.order(right, op)? == Ordering::Less,
        CmpOp::Le => left.order(right, op)? != Ordering::Greater,
        CmpOp::Gt => left.order(right, op)? == Ordering::Greater,
        CmpOp::Ge => left.order(right, op)? != Ordering::Less,
        CmpOp::In => right.contains(left)?,
        CmpOp::NotIn => !right.contains(left)?,
    })
}

fn call(name: &str, args: &[Val]) -> Result<Val, ExpressionError> {
    match (name, args) {
        ("regex_match", [Val::Str(pattern), Val::Str(text)]) => {
            let re = Regex::new(pattern).map_err(|e| {
                ExpressionError::Evaluation(format!("Invalid regex '{}': {}", pattern, e))
            })?;
            Ok(Val::Bool(re.is_match(text)))
        }
        ("regex_match", _) => Err(ExpressionError::Evaluation(
            "regex_match expects (pattern: str, text: str)".into(),
        )),
        ("is_empty", [value]) => Ok(Val::Bool(match value {
            Val::Null => true,
            Val::Str(s) => s.is_empty(),
            Val::List(items) => items.is_empty(),
            Val::Dict(entries) => entries.is_empty(),
            _ => false,
        })),
        ("length", [value]) => match value {
            Val::Str(s) => Ok(Val::Num(s.chars().count() as f64)),
            Val::List(items) => Ok(Val::Num(items.len() as f64)),
            Val::Dict(entries) => Ok(Val::Num(entries.len() as f64)),
            other => Err(ExpressionError::Evaluation(format!(
                "object of type '{}' has no length",
                other.type_name()
            ))),
        },
        (name, args) => Err(ExpressionError::Evaluation(format!(
            "{} takes 1 argument ({} given)",
            name,
            args.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse;
    use super::*;

    fn run(input: &str) -> Val {
        eval(&parse(input).unwrap()).unwrap()
    }

    #[test]
    fn test_and_or_return_operands() {
        assert!(matches!(run("0 or 'x'"), Val::Str(s) if s == "x"));
        assert!(matches!(run("[] and 1"), Val::List(items) if items.is_empty()));
        assert!(matches!(run("1 or 2 or 0"), Val::Num(n) if n == 1.0));
    }

    #[test]
    fn test_numeric_equality_across_bool() {
        assert!(run("true == 1").truthy());
        assert!(run("1 == 1.0").truthy());
        assert!(!run("'1' == 1").truthy());
    }

    #[test]
    fn test_membership() {
        assert!(run("2 in [1, 2]").truthy());
        assert!(run("'ell' in 'hello'").truthy());
        assert!(run("'k' in {'k': 1}").truthy());
        assert!(run("3 not in [1, 2]").truthy());
    }

    #[test]
    fn test_functions() {
        assert!(run("is_empty('')").truthy());
        assert!(!run("is_empty(0)").truthy());
        assert!(run("length([1, 2, 3]) == 3").truthy());
        assert!(run("regex_match('^a.c$', 'abc')").truthy());
    }

    #[test]
    fn test_type_errors() {
        assert!(eval(&parse("'a' < 1").unwrap()).is_err());
        assert!(eval(&parse("1 in 2").unwrap()).is_err());
        assert!(eval(&parse("length(1)").unwrap()).is_err());
        assert!(eval(&parse("regex_match('(', 'x')").unwrap()).is_err());
    }

    #[test]
    fn test_json_conversion() {
        let value = serde_json::json!({"a": [1, "b", null]});
        assert!(Val::from(&value).truthy());
    }
}
