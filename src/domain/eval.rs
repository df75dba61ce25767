//! Expression and predicate evaluation against the current records.

use std::collections::{HashMap, HashSet};

use crate::domain::ast::{
    BinaryOp, CaseExpr, CompareOp, Expr, Function, FunctionCall, LogicalOp, Predicate, Query,
};
use crate::domain::error::QueryError;
use crate::domain::functions::{Ciphers, apply_scalar};
use crate::domain::rewrite::visit_query_calls;
use crate::domain::schema::FileData;
use crate::domain::value::Value;

/// How aggregate calls behave during an evaluation.
pub enum GroupAccess<'a> {
    /// Plain row evaluation; aggregates yield null.
    None,
    /// Read finished aggregates from the group row; `output` holds the
    /// group's computed selections.
    Finalize {
        acc: &'a [Value],
        output: &'a [Value],
    },
}

/// Per-query evaluation state: `inc` counters, distinct-aggregate sets and
/// the ciphers for `encrypt`/`decrypt`.
#[derive(Debug)]
pub struct Evaluator {
    counters: Vec<f64>,
    steps: Vec<f64>,
    distinct: HashMap<usize, HashSet<Value>>,
    ciphers: Ciphers,
}

impl Evaluator {
    pub fn new(query: &Query, ciphers: Ciphers) -> Evaluator {
        let mut steps = vec![1.0; query.counters];
        visit_query_calls(query, &mut |call| {
            if call.func == Function::Inc {
                if let Some(step) = call.option.as_deref().and_then(|s| s.parse().ok()) {
                    steps[call.slot] = step;
                }
            }
        });
        Evaluator {
            counters: vec![1.0; query.counters],
            steps,
            distinct: HashMap::new(),
            ciphers,
        }
    }

    pub fn eval(
        &mut self,
        expr: &Expr,
        files: &[FileData],
        group: &mut GroupAccess<'_>,
    ) -> Result<Value, QueryError> {
        let value = match expr {
            Expr::Column(col) => {
                let raw = files
                    .get(col.file)
                    .and_then(|f| f.reader.cell(col.index))
                    .unwrap_or("");
                Value::from_cell(raw, col.data_type)
            }
            Expr::Literal(lit) => lit.value.clone(),
            Expr::Nested(inner) => self.eval(inner, files, group)?,
            Expr::Negate(inner) => self.eval(inner, files, group)?.negate(),
            Expr::Binary { op, left, right } => {
                let l = self.eval(left, files, group)?;
                let r = self.eval(right, files, group)?;
                match op {
                    BinaryOp::Add => l.add(&r),
                    BinaryOp::Sub => l.sub(&r),
                    BinaryOp::Mul => l.mul(&r),
                    BinaryOp::Div => l.div(&r),
                    BinaryOp::Rem => l.rem(&r),
                    BinaryOp::Pow => l.pow(&r),
                }
            }
            Expr::Case(case) => self.eval_case(case, files, group)?,
            Expr::Function(call) => self.eval_call(call, files, group)?,
            Expr::Output(index) => match group {
                GroupAccess::Finalize { output, .. } => {
                    output.get(*index).cloned().unwrap_or(Value::Null)
                }
                _ => Value::Null,
            },
        };
        Ok(value)
    }

    fn eval_case(
        &mut self,
        case: &CaseExpr,
        files: &[FileData],
        group: &mut GroupAccess<'_>,
    ) -> Result<Value, QueryError> {
        match case {
            CaseExpr::Searched {
                branches,
                otherwise,
            } => {
                for (condition, result) in branches {
                    if self.test(condition, files, group)? {
                        return self.eval(result, files, group);
                    }
                }
                match otherwise {
                    Some(e) => self.eval(e, files, group),
                    None => Ok(Value::Null),
                }
            }
            CaseExpr::Simple {
                operand,
                branches,
                otherwise,
            } => {
                let subject = self.eval(operand, files, group)?;
                for (candidate, result) in branches {
                    if subject.equal(&self.eval(candidate, files, group)?) {
                        return self.eval(result, files, group);
                    }
                }
                match otherwise {
                    Some(e) => self.eval(e, files, group),
                    None => Ok(Value::Null),
                }
            }
        }
    }

    fn eval_call(
        &mut self,
        call: &FunctionCall,
        files: &[FileData],
        group: &mut GroupAccess<'_>,
    ) -> Result<Value, QueryError> {
        if call.func.is_aggregate() {
            return self.eval_aggregate(call, files, group);
        }
        match call.func {
            Function::Inc => {
                let Some(current) = self.counters.get_mut(call.slot) else {
                    return Ok(Value::Null);
                };
                let value = *current;
                *current += self.steps.get(call.slot).copied().unwrap_or(1.0);
                Ok(Value::Float(value))
            }
            Function::Encrypt | Function::Decrypt => {
                let arg = match call.args.first() {
                    Some(e) => self.eval(e, files, group)?,
                    None => Value::Null,
                };
                let cipher = self.ciphers.get(call.option.as_deref());
                match (arg, cipher) {
                    (Value::Null, _) | (_, None) => Ok(Value::Null),
                    (v, Some(c)) if call.func == Function::Encrypt => {
                        Ok(Value::Text(c.encrypt(&v.to_string())?))
                    }
                    (v, Some(c)) => Ok(c
                        .decrypt(&v.to_string())
                        .map(Value::Text)
                        .unwrap_or(Value::Null)),
                }
            }
            func => {
                let mut args = Vec::with_capacity(call.args.len());
                for arg in &call.args {
                    args.push(self.eval(arg, files, group)?);
                }
                Ok(apply_scalar(func, &args, call.option.as_deref()))
            }
        }
    }

    fn eval_aggregate(
        &mut self,
        call: &FunctionCall,
        files: &[FileData],
        group: &mut GroupAccess<'_>,
    ) -> Result<Value, QueryError> {
        match group {
            GroupAccess::None => Ok(Value::Null),
            GroupAccess::Finalize { acc, .. } => {
                Ok(match (call.func, acc.get(call.slot)) {
                    (Function::Count, None | Some(Value::Null)) => Value::Int(0),
                    (_, Some(v)) => v.eval(),
                    (_, None) => Value::Null,
                })
            }
        }
    }

    /// Fold every aggregate call in `expr` into its slot of `acc`, in every
    /// case branch and predicate operand.
    pub fn accumulate(
        &mut self,
        expr: &Expr,
        files: &[FileData],
        acc: &mut [Value],
    ) -> Result<(), QueryError> {
        match expr {
            Expr::Function(call) if call.func.is_aggregate() => {
                self.fold_call(call, files, acc)
            }
            Expr::Function(call) => {
                for arg in &call.args {
                    self.accumulate(arg, files, acc)?;
                }
                Ok(())
            }
            Expr::Negate(e) | Expr::Nested(e) => self.accumulate(e, files, acc),
            Expr::Binary { left, right, .. } => {
                self.accumulate(left, files, acc)?;
                self.accumulate(right, files, acc)
            }
            Expr::Case(case) => {
                match case.as_ref() {
                    CaseExpr::Searched {
                        branches,
                        otherwise,
                    } => {
                        for (condition, result) in branches {
                            self.accumulate_predicate(condition, files, acc)?;
                            self.accumulate(result, files, acc)?;
                        }
                        if let Some(e) = otherwise {
                            self.accumulate(e, files, acc)?;
                        }
                    }
                    CaseExpr::Simple {
                        operand,
                        branches,
                        otherwise,
                    } => {
                        self.accumulate(operand, files, acc)?;
                        for (candidate, result) in branches {
                            self.accumulate(candidate, files, acc)?;
                            self.accumulate(result, files, acc)?;
                        }
                        if let Some(e) = otherwise {
                            self.accumulate(e, files, acc)?;
                        }
                    }
                }
                Ok(())
            }
            Expr::Column(_) | Expr::Literal(_) | Expr::Output(_) => Ok(()),
        }
    }

    fn accumulate_predicate(
        &mut self,
        predicate: &Predicate,
        files: &[FileData],
        acc: &mut [Value],
    ) -> Result<(), QueryError> {
        match predicate {
            Predicate::Compare { left, right, .. } => {
                self.accumulate(left, files, acc)?;
                self.accumulate(right, files, acc)
            }
            Predicate::Between {
                expr, low, high, ..
            } => {
                self.accumulate(expr, files, acc)?;
                self.accumulate(low, files, acc)?;
                self.accumulate(high, files, acc)
            }
            Predicate::In { expr, list, .. } => {
                self.accumulate(expr, files, acc)?;
                for item in list {
                    self.accumulate(item, files, acc)?;
                }
                Ok(())
            }
            Predicate::Like { expr, .. } => self.accumulate(expr, files, acc),
            Predicate::Logical { left, right, .. } => {
                self.accumulate_predicate(left, files, acc)?;
                self.accumulate_predicate(right, files, acc)
            }
            Predicate::Not(inner) | Predicate::Nested(inner) => {
                self.accumulate_predicate(inner, files, acc)
            }
        }
    }

    fn fold_call(
        &mut self,
        call: &FunctionCall,
        files: &[FileData],
        acc: &mut [Value],
    ) -> Result<(), QueryError> {
        let value = match call.args.first() {
            Some(arg) => self.eval(arg, files, &mut GroupAccess::None)?,
            None => Value::Null,
        };
        if value.is_null() {
            return Ok(());
        }
        if call.distinct
            && !self
                .distinct
                .entry(call.slot)
                .or_default()
                .insert(value.clone())
        {
            return Ok(());
        }
        if let Some(slot) = acc.get_mut(call.slot) {
            fold(call.func, slot, value);
        }
        Ok(())
    }

    /// Evaluate a predicate to a boolean.
    pub fn test(
        &mut self,
        predicate: &Predicate,
        files: &[FileData],
        group: &mut GroupAccess<'_>,
    ) -> Result<bool, QueryError> {
        let result = match predicate {
            Predicate::Compare {
                op,
                left,
                right,
                negated,
            } => {
                let l = self.eval(left, files, group)?;
                let r = self.eval(right, files, group)?;
                let matched = match op {
                    CompareOp::Eq => l.equal(&r),
                    CompareOp::NotEq => !l.equal(&r),
                    CompareOp::Lt => l.less(&r),
                    CompareOp::LtEq => l.less_eq(&r),
                    CompareOp::Gt => l.greater(&r),
                    CompareOp::GtEq => l.greater_eq(&r),
                };
                matched != *negated
            }
            Predicate::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let v = self.eval(expr, files, group)?;
                let a = self.eval(low, files, group)?;
                let b = self.eval(high, files, group)?;
                let (low, high) = if a.greater(&b) { (b, a) } else { (a, b) };
                (v.greater_eq(&low) && v.less_eq(&high)) != *negated
            }
            Predicate::In {
                expr,
                list,
                negated,
            } => {
                let v = self.eval(expr, files, group)?;
                let mut found = false;
                for item in list {
                    if v.equal(&self.eval(item, files, group)?) {
                        found = true;
                        break;
                    }
                }
                found != *negated
            }
            Predicate::Like {
                expr,
                pattern,
                negated,
            } => {
                let v = self.eval(expr, files, group)?;
                let matched = !v.is_null() && pattern.is_match(&v.to_string());
                matched != *negated
            }
            Predicate::Logical { op, left, right } => match op {
                LogicalOp::And => {
                    self.test(left, files, group)? && self.test(right, files, group)?
                }
                LogicalOp::Or => {
                    self.test(left, files, group)? || self.test(right, files, group)?
                }
                LogicalOp::Xor => {
                    self.test(left, files, group)? != self.test(right, files, group)?
                }
            },
            Predicate::Not(inner) => !self.test(inner, files, group)?,
            Predicate::Nested(inner) => self.test(inner, files, group)?,
        };
        Ok(result)
    }
}

/// Fold a non-null value into an aggregate slot. The first value
/// initializes the slot.
fn fold(func: Function, slot: &mut Value, value: Value) {
    if slot.is_null() {
        *slot = match func {
            Function::Count => Value::Int(1),
            Function::Avg => Value::Average {
                sum: Box::new(value),
                count: 1,
            },
            Function::Stdev | Function::Stdevp => Value::StdDev {
                samples: value.as_f64().into_iter().collect(),
                sample: func == Function::Stdev,
            },
            _ => value,
        };
        return;
    }
    match (func, &mut *slot) {
        (Function::Avg, Value::Average { sum, count }) => {
            **sum = sum.add(&value);
            *count += 1;
        }
        (Function::Stdev | Function::Stdevp, Value::StdDev { samples, .. }) => {
            samples.extend(value.as_f64());
        }
        (Function::Sum, _) => *slot = slot.add(&value),
        (Function::Count, _) => *slot = slot.add(&Value::Int(1)),
        (Function::Min, _) => {
            if slot.greater(&value) {
                *slot = value;
            }
        }
        (Function::Max, _) => {
            if slot.less(&value) {
                *slot = value;
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn fold_all(func: Function, values: &[Value]) -> Value {
        let mut slot = Value::Null;
        for v in values {
            fold(func, &mut slot, v.clone());
        }
        slot.eval()
    }

    #[test]
    fn folds_sum_count_min_max() {
        let values = [Value::Int(3), Value::Int(1), Value::Int(2)];
        assert_eq!(fold_all(Function::Sum, &values), Value::Int(6));
        assert_eq!(fold_all(Function::Count, &values), Value::Int(3));
        assert_eq!(fold_all(Function::Min, &values), Value::Int(1));
        assert_eq!(fold_all(Function::Max, &values), Value::Int(3));
    }

    #[test]
    fn folds_average_and_deviation() {
        let values = [Value::Int(1), Value::Int(2)];
        assert_eq!(fold_all(Function::Avg, &values), Value::Float(1.5));

        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].map(Value::Float);
        match fold_all(Function::Stdevp, &values) {
            Value::Float(x) => assert_relative_eq!(x, 2.0),
            other => panic!("unexpected {other:?}"),
        }
        match fold_all(Function::Stdev, &values) {
            Value::Float(x) => assert_relative_eq!(x, 2.138089935, epsilon = 1e-9),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn deviation_slot_grows_in_place() {
        let mut slot = Value::Null;
        for i in 1..=10_000 {
            fold(Function::Stdevp, &mut slot, Value::Int(i));
        }
        match &slot {
            Value::StdDev { samples, sample } => {
                assert_eq!(samples.len(), 10_000);
                assert!(!sample);
            }
            other => panic!("unexpected {other:?}"),
        }
        // population deviation of 1..=n is sqrt((n^2 - 1) / 12)
        let expected = ((10_000f64 * 10_000.0 - 1.0) / 12.0).sqrt();
        assert_relative_eq!(slot.eval().as_f64().unwrap(), expected, epsilon = 1e-6);

        let mut slot = Value::Null;
        for i in 1..=10_000 {
            fold(Function::Avg, &mut slot, Value::Int(i));
        }
        assert_eq!(slot.eval(), Value::Float(5000.5));
    }

    #[test]
    fn min_of_text_uses_text_order() {
        let values = [Value::Text("pear".into()), Value::Text("apple".into())];
        assert_eq!(fold_all(Function::Min, &values), Value::Text("apple".into()));
    }
}
