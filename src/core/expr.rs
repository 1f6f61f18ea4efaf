//! Purpose: Parse and evaluate loop-count, length, and conditional expressions.
//! Exports: `CountExpr`, `CondExpr`, `ArithOp`, `CmpOp`, `ValueLookup`.
//! Role: Resolves `"<op> <operand>"` against previously decoded field values.
//! Invariants: Text is parsed once at schema compile time; evaluation never re-parses.
//! Invariants: An absent referenced field is `UnknownTag`, except for the bare presence test.
use std::cmp::Ordering;

use crate::core::error::{Error, ErrorKind};
use crate::core::record::{DataKind, FieldValue, Number};

/// Read access to the fields decoded (or supplied) so far.
pub trait ValueLookup {
    fn lookup(&self, qualified: &str) -> Option<&FieldValue>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    NumEq,
    NumNe,
    BitAnd,
}

// Longest operators first so `>=` wins over `>`.
const OPERATORS: [&str; 14] = [
    ">=", "<=", "==", "!=", "eq", "ne", ">", "<", "&", "+", "-", "*", "/", "%",
];

fn split_operator(text: &str) -> Option<(&'static str, &str)> {
    let text = text.trim();
    OPERATORS
        .iter()
        .find(|op| text.starts_with(**op))
        .map(|op| (*op, text[op.len()..].trim()))
}

fn invalid(text: &str, message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidExpression)
        .with_message(message)
        .with_hint(format!("expression: `{text}`"))
}

fn resolve<'a>(values: &'a dyn ValueLookup, reference: &str) -> Result<&'a FieldValue, Error> {
    values.lookup(reference).ok_or_else(|| {
        Error::new(ErrorKind::UnknownTag)
            .with_message("referenced field has not been decoded")
            .with_tag(reference.to_string())
    })
}

/// Arithmetic adjustment applied to a referenced numeric value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CountExpr {
    op: Option<(ArithOp, i64)>,
}

impl CountExpr {
    pub fn parse(text: &str) -> Result<Self, Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let (op, operand) =
            split_operator(text).ok_or_else(|| invalid(text, "unknown operator"))?;
        let op = match op {
            "+" => ArithOp::Add,
            "-" => ArithOp::Sub,
            "*" => ArithOp::Mul,
            "/" => ArithOp::Div,
            "%" => ArithOp::Rem,
            _ => return Err(invalid(text, format!("`{op}` is not an arithmetic operator"))),
        };
        let operand = operand
            .parse::<i64>()
            .map_err(|err| invalid(text, "operand must be an integer").with_source(err))?;
        if operand == 0 && matches!(op, ArithOp::Div | ArithOp::Rem) {
            return Err(invalid(text, "division by zero"));
        }
        Ok(Self {
            op: Some((op, operand)),
        })
    }

    pub fn op(&self) -> Option<(ArithOp, i64)> {
        self.op
    }

    pub fn apply(&self, value: i64) -> i64 {
        match self.op {
            None => value,
            Some((ArithOp::Add, rhs)) => value.saturating_add(rhs),
            Some((ArithOp::Sub, rhs)) => value.saturating_sub(rhs),
            Some((ArithOp::Mul, rhs)) => value.saturating_mul(rhs),
            Some((ArithOp::Div, rhs)) => value.checked_div(rhs).unwrap_or(i64::MAX),
            Some((ArithOp::Rem, rhs)) => value.checked_rem(rhs).unwrap_or(0),
        }
    }

    /// The stored value that makes `apply` yield `target`, if exactly one exists.
    pub fn invert(&self, target: i64) -> Option<i64> {
        match self.op {
            None => Some(target),
            Some((ArithOp::Add, rhs)) => target.checked_sub(rhs),
            Some((ArithOp::Sub, rhs)) => target.checked_add(rhs),
            Some((ArithOp::Mul, rhs)) => {
                if rhs != 0 && target % rhs == 0 {
                    Some(target / rhs)
                } else {
                    None
                }
            }
            Some((ArithOp::Div, rhs)) => {
                let candidate = target.checked_mul(rhs)?;
                (self.apply(candidate) == target).then_some(candidate)
            }
            Some((ArithOp::Rem, _)) => None,
        }
    }

    pub fn eval(&self, values: &dyn ValueLookup, reference: &str) -> Result<i64, Error> {
        let field = resolve(values, reference)?;
        Ok(self.apply(field.as_i64()?))
    }

    /// Loop iteration count; negative results clamp to zero.
    pub fn eval_count(&self, values: &dyn ValueLookup, reference: &str) -> Result<usize, Error> {
        let value = self.eval(values, reference)?;
        Ok(usize::try_from(value.max(0)).unwrap_or(usize::MAX))
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CondExpr {
    test: Option<(CmpOp, Operand)>,
}

#[derive(Clone, Debug, PartialEq)]
enum Operand {
    Text(String),
    Number(Number),
    Mask(u64),
}

impl CondExpr {
    pub fn parse(text: &str) -> Result<Self, Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let (op, operand) =
            split_operator(text).ok_or_else(|| invalid(text, "unknown operator"))?;
        let op = match op {
            "eq" => CmpOp::Eq,
            "ne" => CmpOp::Ne,
            ">" => CmpOp::Gt,
            "<" => CmpOp::Lt,
            ">=" => CmpOp::Ge,
            "<=" => CmpOp::Le,
            "==" => CmpOp::NumEq,
            "!=" => CmpOp::NumNe,
            "&" => CmpOp::BitAnd,
            _ => return Err(invalid(text, format!("`{op}` is not a comparison operator"))),
        };
        let operand = match op {
            CmpOp::Eq | CmpOp::Ne => Operand::Text(operand.to_string()),
            CmpOp::BitAnd => Operand::Mask(parse_mask(operand).ok_or_else(|| {
                invalid(text, "bit mask must be a decimal or 0x-prefixed integer")
            })?),
            _ => Operand::Number(parse_number(operand).ok_or_else(|| {
                invalid(text, "numeric comparison needs a numeric operand")
            })?),
        };
        Ok(Self {
            test: Some((op, operand)),
        })
    }

    pub fn op(&self) -> Option<CmpOp> {
        self.test.as_ref().map(|(op, _)| *op)
    }

    pub fn eval(&self, values: &dyn ValueLookup, reference: &str) -> Result<bool, Error> {
        let Some((op, operand)) = &self.test else {
            return Ok(values
                .lookup(reference)
                .is_some_and(|field| !field.is_blank()));
        };
        let field = resolve(values, reference)?;
        match (op, operand) {
            (CmpOp::Eq | CmpOp::Ne, Operand::Text(expected)) => {
                let equal = match field.kind() {
                    DataKind::Binary => field.raw() == expected.as_bytes(),
                    DataKind::Text | DataKind::Numeric => field.as_text()? == expected.as_str(),
                };
                Ok(equal == (*op == CmpOp::Eq))
            }
            (CmpOp::BitAnd, Operand::Mask(mask)) => Ok(field.as_bits()? & mask != 0),
            (_, Operand::Number(expected)) => {
                let ordering = compare_numbers(field.as_number()?, *expected);
                Ok(match op {
                    CmpOp::Gt => ordering == Ordering::Greater,
                    CmpOp::Lt => ordering == Ordering::Less,
                    CmpOp::Ge => ordering != Ordering::Less,
                    CmpOp::Le => ordering != Ordering::Greater,
                    CmpOp::NumEq => ordering == Ordering::Equal,
                    _ => ordering != Ordering::Equal,
                })
            }
            _ => Err(Error::new(ErrorKind::Internal).with_message("operator/operand pairing")),
        }
    }
}

fn parse_number(text: &str) -> Option<Number> {
    if let Ok(value) = text.parse::<i64>() {
        return Some(Number::Int(value));
    }
    text.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .map(Number::Decimal)
}

fn parse_mask(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse::<u64>().ok(),
    }
}

fn compare_numbers(lhs: Number, rhs: Number) -> Ordering {
    match (lhs, rhs) {
        (Number::Int(a), Number::Int(b)) => a.cmp(&b),
        (a, b) => a.as_f64().total_cmp(&b.as_f64()),
    }
}

#[cfg(test)]
mod tests {
    use super::{ArithOp, CmpOp, CondExpr, CountExpr};
    use crate::core::error::ErrorKind;
    use crate::core::record::{FieldValue, Record};

    fn table() -> Record {
        Record::from_fields(
            "T",
            [
                FieldValue::text("A", "0002"),
                FieldValue::text("NAME", "GEOD "),
                FieldValue::text("BLANK", "   "),
                FieldValue::binary("FLAGS", vec![0x00, 0x05]),
                FieldValue::text("RATIO", "1.5"),
            ],
        )
        .expect("table")
    }

    #[test]
    fn count_expressions_accept_optional_whitespace() {
        assert_eq!(CountExpr::parse("*1").expect("parse").op(), Some((ArithOp::Mul, 1)));
        assert_eq!(CountExpr::parse("* 4").expect("parse").op(), Some((ArithOp::Mul, 4)));
        assert_eq!(CountExpr::parse("").expect("parse").op(), None);
    }

    #[test]
    fn count_expressions_reject_bad_text() {
        for text in ["eq 2", "* x", "/ 0", "% 0", "^ 2"] {
            let err = CountExpr::parse(text).expect_err(text);
            assert_eq!(err.kind(), ErrorKind::InvalidExpression, "{text}");
        }
    }

    #[test]
    fn loop_counts_apply_operator_and_clamp() {
        let values = table();
        let times_four = CountExpr::parse("* 4").expect("parse");
        assert_eq!(times_four.eval_count(&values, "A").expect("eval"), 8);
        let minus = CountExpr::parse("- 5").expect("parse");
        assert_eq!(minus.eval_count(&values, "A").expect("eval"), 0);
        let rem = CountExpr::parse("% 2").expect("parse");
        assert_eq!(rem.eval_count(&values, "A").expect("eval"), 0);
    }

    #[test]
    fn count_on_missing_or_text_field_fails() {
        let values = table();
        let expr = CountExpr::default();
        assert_eq!(
            expr.eval(&values, "MISSING").expect_err("unknown").kind(),
            ErrorKind::UnknownTag
        );
        assert_eq!(
            expr.eval(&values, "NAME").expect_err("text").kind(),
            ErrorKind::TypeMismatch
        );
    }

    #[test]
    fn inversion_recovers_stored_value() {
        assert_eq!(CountExpr::parse("+ 3").expect("parse").invert(10), Some(7));
        assert_eq!(CountExpr::parse("- 3").expect("parse").invert(10), Some(13));
        assert_eq!(CountExpr::parse("* 4").expect("parse").invert(12), Some(3));
        assert_eq!(CountExpr::parse("* 4").expect("parse").invert(10), None);
        assert_eq!(CountExpr::parse("/ 2").expect("parse").invert(5), Some(10));
        assert_eq!(CountExpr::parse("% 2").expect("parse").invert(1), None);
    }

    #[test]
    fn string_comparisons_use_trimmed_text() {
        let values = table();
        assert!(CondExpr::parse("eq GEOD").expect("parse").eval(&values, "NAME").expect("eval"));
        assert!(CondExpr::parse("ne UTM").expect("parse").eval(&values, "NAME").expect("eval"));
        assert!(!CondExpr::parse("ne GEOD").expect("parse").eval(&values, "NAME").expect("eval"));
    }

    #[test]
    fn numeric_comparisons() {
        let values = table();
        let cases = [
            ("> 0", true),
            ("< 2", false),
            (">= 2", true),
            ("<= 1", false),
            ("== 2", true),
            ("!= 2", false),
        ];
        for (text, expected) in cases {
            let expr = CondExpr::parse(text).expect("parse");
            assert_eq!(expr.eval(&values, "A").expect("eval"), expected, "{text}");
        }
        let decimal = CondExpr::parse("> 1").expect("parse");
        assert!(decimal.eval(&values, "RATIO").expect("eval"));
    }

    #[test]
    fn numeric_comparison_on_text_is_type_mismatch() {
        let values = table();
        let err = CondExpr::parse("> 0")
            .expect("parse")
            .eval(&values, "NAME")
            .expect_err("mismatch");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn presence_test_never_errors() {
        let values = table();
        let presence = CondExpr::parse("").expect("parse");
        assert_eq!(presence.op(), None);
        assert!(presence.eval(&values, "NAME").expect("present"));
        assert!(!presence.eval(&values, "BLANK").expect("blank"));
        assert!(!presence.eval(&values, "MISSING").expect("absent"));
    }

    #[test]
    fn bit_tests_on_binary_fields() {
        let values = table();
        let expr = CondExpr::parse("& 0x04").expect("parse");
        assert_eq!(expr.op(), Some(CmpOp::BitAnd));
        assert!(expr.eval(&values, "FLAGS").expect("eval"));
        let miss = CondExpr::parse("& 2").expect("parse");
        assert!(!miss.eval(&values, "FLAGS").expect("eval"));
    }

    #[test]
    fn comparison_with_unknown_tag_fails() {
        let values = table();
        let err = CondExpr::parse("eq X")
            .expect("parse")
            .eval(&values, "NOPE")
            .expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::UnknownTag);
    }
}
