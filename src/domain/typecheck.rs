//! Static typing of expressions and predicates.
//!
//! `check` computes a node's type bottom-up; `enforce` pushes a type back
//! down, coercing literal text into typed values.

use crate::domain::ast::{BinaryOp, CaseExpr, Expr, Function, FunctionCall, Literal, Predicate};
use crate::domain::error::QueryError;
use crate::domain::schema::{DataType, narrowest_type};
use crate::domain::temporal::{parse_date, parse_duration};
use crate::domain::value::Value;

/// Result of combining two operand types, indexed by `type * 2 + is_literal`
/// for null, int, float, date, duration and text.
#[rustfmt::skip]
const TYPE_CHART: [[u8; 12]; 12] = [
    [5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5],
    [5, 5, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5],
    [5, 1, 1, 1, 2, 2, 3, 1, 4, 4, 5, 1],
    [5, 1, 1, 1, 2, 2, 3, 1, 4, 4, 5, 5],
    [5, 2, 2, 2, 2, 2, 3, 2, 4, 2, 5, 2],
    [5, 2, 2, 2, 2, 2, 3, 2, 4, 4, 5, 5],
    [5, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3],
    [5, 3, 1, 1, 2, 2, 3, 3, 3, 3, 5, 5],
    [5, 4, 4, 4, 4, 4, 3, 3, 4, 4, 5, 4],
    [5, 4, 4, 4, 2, 4, 3, 3, 4, 4, 5, 5],
    [5, 5, 5, 5, 5, 5, 3, 5, 5, 5, 5, 5],
    [5, 5, 1, 5, 2, 5, 3, 5, 4, 5, 5, 5],
];

const CHART_TYPES: [DataType; 6] = [
    DataType::Null,
    DataType::Int,
    DataType::Float,
    DataType::Date,
    DataType::Duration,
    DataType::Text,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInfo {
    pub data_type: DataType,
    pub literal: bool,
}

impl TypeInfo {
    fn new(data_type: DataType, literal: bool) -> Self {
        Self { data_type, literal }
    }
}

/// Combine two operand types through the type chart.
pub fn combine(left: TypeInfo, right: TypeInfo) -> TypeInfo {
    let row = left.data_type.index() * 2 + usize::from(left.literal);
    let col = right.data_type.index() * 2 + usize::from(right.literal);
    TypeInfo::new(
        CHART_TYPES[usize::from(TYPE_CHART[row][col])],
        left.literal && right.literal,
    )
}

/// Operand mixes whose operands keep their own types: date arithmetic and
/// scaling a duration.
fn temporal_result(op: BinaryOp, left: DataType, right: DataType) -> Option<DataType> {
    use DataType::{Date, Duration, Float, Int};
    match (op, left, right) {
        (BinaryOp::Add, Date, Duration) | (BinaryOp::Add, Duration, Date) => Some(Date),
        (BinaryOp::Sub, Date, Duration) => Some(Date),
        (BinaryOp::Sub, Date, Date) => Some(Duration),
        (BinaryOp::Add | BinaryOp::Sub, Duration, Duration) => Some(Duration),
        (BinaryOp::Mul, Duration, Int | Float) | (BinaryOp::Mul, Int | Float, Duration) => {
            Some(Duration)
        }
        (BinaryOp::Div, Duration, Int | Float) => Some(Duration),
        _ => None,
    }
}

fn check_operator(op: BinaryOp, left: DataType, right: DataType, result: DataType) -> Result<(), QueryError> {
    use DataType::{Date, Duration, Int, Null, Text};
    let numeric = |t: DataType| t.is_numeric() || t == Null;
    let fail = |what: &str| {
        Err(QueryError::type_error(format!(
            "{what}: {left} {} {right}",
            op.symbol()
        )))
    };
    match op {
        BinaryOp::Add | BinaryOp::Sub => {
            if op == BinaryOp::Add && left == Date && right == Date {
                return fail("cannot add two dates");
            }
            let ok = (numeric(left) && numeric(right))
                || result == Text
                || temporal_result(op, left, right).is_some();
            if !ok {
                return fail("incompatible operands");
            }
        }
        BinaryOp::Rem => {
            if !matches!(left, Int | Null) || !matches!(right, Int | Null) {
                return fail("modulus needs integers");
            }
        }
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Pow => {
            if op == BinaryOp::Div && left.is_numeric() && right == Duration {
                return fail("cannot divide a number by a duration");
            }
            let ok = (numeric(left) && numeric(right))
                || (op != BinaryOp::Pow && temporal_result(op, left, right).is_some());
            if !ok {
                return fail("operator needs numeric operands");
            }
        }
    }
    Ok(())
}

/// Type checker for one query. `outputs` holds the types of the query's
/// selections, for expressions that refer to finished output columns.
#[derive(Debug, Default)]
pub struct Checker {
    pub outputs: Vec<DataType>,
}

impl Checker {
    pub fn check(&self, expr: &mut Expr) -> Result<TypeInfo, QueryError> {
        match expr {
            Expr::Column(col) => Ok(TypeInfo::new(col.data_type, false)),
            Expr::Literal(lit) => Ok(TypeInfo::new(literal_type(lit), true)),
            Expr::Output(i) => Ok(TypeInfo::new(
                self.outputs.get(*i).copied().unwrap_or(DataType::Null),
                false,
            )),
            Expr::Nested(inner) => self.check(inner),
            Expr::Negate(inner) => {
                let info = self.check(inner)?;
                if !matches!(
                    info.data_type,
                    DataType::Int | DataType::Float | DataType::Duration | DataType::Null
                ) {
                    return Err(QueryError::type_error(format!(
                        "cannot negate a {} value",
                        info.data_type
                    )));
                }
                Ok(info)
            }
            Expr::Binary { op, left, right } => {
                let l = self.check(left)?;
                let r = self.check(right)?;
                let result = match temporal_result(*op, l.data_type, r.data_type) {
                    Some(t) => TypeInfo::new(t, l.literal && r.literal),
                    None => combine(l, r),
                };
                check_operator(*op, l.data_type, r.data_type, result.data_type)?;
                Ok(result)
            }
            Expr::Case(case) => self.check_case(case),
            Expr::Function(call) => self.check_function(call),
        }
    }

    fn check_case(&self, case: &mut CaseExpr) -> Result<TypeInfo, QueryError> {
        let (results, otherwise): (Vec<&mut Expr>, &mut Option<Expr>) = match case {
            CaseExpr::Searched {
                branches,
                otherwise,
            } => {
                for (condition, _) in branches.iter_mut() {
                    self.check_predicate(condition)?;
                }
                (branches.iter_mut().map(|(_, e)| e).collect(), otherwise)
            }
            CaseExpr::Simple {
                operand,
                branches,
                otherwise,
            } => {
                let mut compare = self.check(operand)?;
                for (candidate, _) in branches.iter_mut() {
                    compare = combine(compare, self.check(candidate)?);
                }
                self.enforce(operand, compare.data_type)?;
                for (candidate, _) in branches.iter_mut() {
                    self.enforce(candidate, compare.data_type)?;
                }
                (branches.iter_mut().map(|(_, e)| e).collect(), otherwise)
            }
        };

        let mut unified: Option<TypeInfo> = None;
        for result in results.into_iter().chain(otherwise.as_mut()) {
            let info = self.check(result)?;
            unified = Some(match unified {
                Some(u) => combine(u, info),
                None => info,
            });
        }
        Ok(unified.unwrap_or(TypeInfo::new(DataType::Null, true)))
    }

    fn check_function(&self, call: &mut FunctionCall) -> Result<TypeInfo, QueryError> {
        let mut infos = Vec::with_capacity(call.args.len());
        for arg in call.args.iter_mut() {
            infos.push(self.check(arg)?);
        }
        let arg = infos
            .first()
            .copied()
            .unwrap_or(TypeInfo::new(DataType::Null, true));
        let ty = arg.data_type;
        let name = call.func.name();
        let require = |ok: bool, what: &str| {
            if ok || ty == DataType::Null {
                Ok(())
            } else {
                Err(QueryError::type_error(format!(
                    "{name} needs {what}, found {ty}"
                )))
            }
        };

        let result = match call.func {
            Function::Stdev | Function::Stdevp => {
                require(ty.is_numeric(), "a numeric argument")?;
                DataType::Float
            }
            Function::Sum => {
                require(ty.is_numeric() || ty == DataType::Duration, "a numeric or duration argument")?;
                ty
            }
            Function::Avg => {
                require(ty.is_numeric() || ty == DataType::Duration, "a numeric or duration argument")?;
                if ty == DataType::Int { DataType::Float } else { ty }
            }
            Function::Abs => {
                require(ty.is_numeric() || ty == DataType::Duration, "a numeric or duration argument")?;
                ty
            }
            Function::Min | Function::Max => ty,
            Function::Count => DataType::Int,
            Function::Year
            | Function::Month
            | Function::Week
            | Function::DayOfWeek
            | Function::DayOfYear
            | Function::DayOfMonth
            | Function::Hour => {
                require(ty == DataType::Date, "a date argument")?;
                DataType::Int
            }
            Function::MonthName | Function::DayName => {
                require(ty == DataType::Date, "a date argument")?;
                DataType::Text
            }
            Function::Coalesce => infos
                .iter()
                .copied()
                .reduce(combine)
                .map(|i| i.data_type)
                .unwrap_or(DataType::Null),
            Function::Format | Function::Encrypt | Function::Decrypt => DataType::Text,
            Function::Inc => {
                if let Some(step) = &call.option {
                    if step.parse::<f64>().is_err() {
                        return Err(QueryError::type_error(format!(
                            "inc step '{step}' is not a number"
                        )));
                    }
                }
                DataType::Float
            }
        };
        call.data_type = result;

        let literal = match call.func {
            f if f.is_aggregate() => false,
            Function::Inc => true,
            _ => infos.iter().all(|i| i.literal),
        };
        Ok(TypeInfo::new(result, literal))
    }

    /// Push `target` down into `expr`, coercing literals.
    pub fn enforce(&self, expr: &mut Expr, target: DataType) -> Result<(), QueryError> {
        match expr {
            Expr::Literal(lit) => coerce_literal(lit, target),
            Expr::Column(_) | Expr::Output(_) => Ok(()),
            Expr::Nested(inner) | Expr::Negate(inner) => self.enforce(inner, target),
            Expr::Binary { op, left, right } => {
                let l = self.check(left)?.data_type;
                let r = self.check(right)?.data_type;
                if temporal_result(*op, l, r).is_some() {
                    self.enforce(left, l)?;
                    self.enforce(right, r)
                } else {
                    self.enforce(left, target)?;
                    self.enforce(right, target)
                }
            }
            Expr::Case(case) => match case.as_mut() {
                CaseExpr::Searched {
                    branches,
                    otherwise,
                } => {
                    for (_, result) in branches.iter_mut() {
                        self.enforce(result, target)?;
                    }
                    match otherwise {
                        Some(e) => self.enforce(e, target),
                        None => Ok(()),
                    }
                }
                CaseExpr::Simple {
                    branches,
                    otherwise,
                    ..
                } => {
                    for (_, result) in branches.iter_mut() {
                        self.enforce(result, target)?;
                    }
                    match otherwise {
                        Some(e) => self.enforce(e, target),
                        None => Ok(()),
                    }
                }
            },
            Expr::Function(call) => {
                let arg_target = match call.func {
                    Function::Year
                    | Function::Month
                    | Function::MonthName
                    | Function::Week
                    | Function::DayOfWeek
                    | Function::DayName
                    | Function::DayOfYear
                    | Function::DayOfMonth
                    | Function::Hour => Some(DataType::Date),
                    Function::Abs | Function::Coalesce if target != DataType::Null => Some(target),
                    _ => None,
                };
                for arg in call.args.iter_mut() {
                    let t = match arg_target {
                        Some(t) => t,
                        None => self.check(arg)?.data_type,
                    };
                    self.enforce(arg, t)?;
                }
                Ok(())
            }
        }
    }

    /// Type a predicate: each comparison unifies its operands and coerces them.
    pub fn check_predicate(&self, predicate: &mut Predicate) -> Result<(), QueryError> {
        match predicate {
            Predicate::Compare { left, right, .. } => {
                let t = combine(self.check(left)?, self.check(right)?).data_type;
                self.enforce(left, t)?;
                self.enforce(right, t)
            }
            Predicate::Between {
                expr, low, high, ..
            } => {
                let t = combine(
                    combine(self.check(expr)?, self.check(low)?),
                    self.check(high)?,
                )
                .data_type;
                self.enforce(expr, t)?;
                self.enforce(low, t)?;
                self.enforce(high, t)
            }
            Predicate::In { expr, list, .. } => {
                let mut unified = self.check(expr)?;
                for item in list.iter_mut() {
                    unified = combine(unified, self.check(item)?);
                }
                self.enforce(expr, unified.data_type)?;
                for item in list.iter_mut() {
                    self.enforce(item, unified.data_type)?;
                }
                Ok(())
            }
            Predicate::Like { expr, .. } => {
                let t = self.check(expr)?.data_type;
                self.enforce(expr, t)
            }
            Predicate::Logical { left, right, .. } => {
                self.check_predicate(left)?;
                self.check_predicate(right)
            }
            Predicate::Not(inner) | Predicate::Nested(inner) => self.check_predicate(inner),
        }
    }
}

fn literal_type(lit: &Literal) -> DataType {
    if lit.value.is_null() {
        DataType::Null
    } else {
        narrowest_type(&lit.text, DataType::Null)
    }
}

fn coerce_literal(lit: &mut Literal, target: DataType) -> Result<(), QueryError> {
    if lit.value.is_null() && lit.text.eq_ignore_ascii_case("null") {
        return Ok(());
    }
    let text = lit.text.trim();
    let value = match target {
        DataType::Null => Some(Value::Null),
        DataType::Text => Some(Value::Text(lit.text.clone())),
        DataType::Int => text.parse().ok().map(Value::Int),
        DataType::Float => text.parse().ok().map(Value::Float),
        DataType::Date => parse_date(text).map(Value::Date),
        DataType::Duration => parse_duration(text).map(Value::Duration),
    };
    match value {
        Some(v) => {
            lit.value = v;
            Ok(())
        }
        None => Err(QueryError::type_error(format!(
            "could not read '{}' as {target}",
            lit.text
        ))),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AggInfo {
    pub literal: bool,
    pub aggregate: bool,
}

fn merge(parts: &[AggInfo]) -> Result<AggInfo, QueryError> {
    let aggregate = parts.iter().any(|p| p.aggregate);
    if aggregate && parts.iter().any(|p| !p.aggregate && !p.literal) {
        return Err(QueryError::type_error(
            "aggregates can only be combined with other aggregates or literals",
        ));
    }
    Ok(AggInfo {
        literal: parts.iter().all(|p| p.literal),
        aggregate,
    })
}

/// Check that aggregates are not nested and only combine with aggregates
/// or literals.
pub fn agg_check(expr: &Expr) -> Result<AggInfo, QueryError> {
    match expr {
        Expr::Literal(_) => Ok(AggInfo {
            literal: true,
            aggregate: false,
        }),
        Expr::Column(_) => Ok(AggInfo::default()),
        Expr::Output(_) => Ok(AggInfo {
            literal: false,
            aggregate: true,
        }),
        Expr::Nested(inner) | Expr::Negate(inner) => agg_check(inner),
        Expr::Binary { left, right, .. } => merge(&[agg_check(left)?, agg_check(right)?]),
        Expr::Function(call) if call.func.is_aggregate() => {
            if call.args.iter().any(Expr::has_aggregate) {
                return Err(QueryError::type_error(format!(
                    "aggregate functions cannot be nested inside {}",
                    call.func.name()
                )));
            }
            Ok(AggInfo {
                literal: false,
                aggregate: true,
            })
        }
        Expr::Function(call) => {
            if call.func == Function::Inc {
                return Ok(AggInfo {
                    literal: true,
                    aggregate: false,
                });
            }
            let parts = call
                .args
                .iter()
                .map(agg_check)
                .collect::<Result<Vec<_>, _>>()?;
            merge(&parts)
        }
        Expr::Case(case) => {
            let mut parts = Vec::new();
            let mut predicate_columns = false;
            match case.as_ref() {
                CaseExpr::Searched {
                    branches,
                    otherwise,
                } => {
                    for (condition, result) in branches {
                        let mut files = Vec::new();
                        condition.files(&mut files);
                        predicate_columns |= !files.is_empty() && !condition.has_aggregate();
                        parts.push(agg_check(result)?);
                    }
                    if let Some(e) = otherwise {
                        parts.push(agg_check(e)?);
                    }
                }
                CaseExpr::Simple {
                    operand,
                    branches,
                    otherwise,
                } => {
                    parts.push(agg_check(operand)?);
                    for (candidate, result) in branches {
                        parts.push(agg_check(candidate)?);
                        parts.push(agg_check(result)?);
                    }
                    if let Some(e) = otherwise {
                        parts.push(agg_check(e)?);
                    }
                }
            }
            let info = merge(&parts)?;
            if info.aggregate && predicate_columns {
                return Err(QueryError::type_error(
                    "aggregates can only be combined with other aggregates or literals",
                ));
            }
            Ok(info)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ast::ColumnRef;

    fn column(data_type: DataType) -> Expr {
        Expr::Column(ColumnRef {
            file: 0,
            index: 0,
            name: "c".to_string(),
            data_type,
        })
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn aggregate(func: Function, arg: Expr) -> Expr {
        Expr::Function(Box::new(FunctionCall {
            func,
            args: vec![arg],
            distinct: false,
            data_type: DataType::Null,
            slot: 0,
            option: None,
        }))
    }

    #[test]
    fn chart_combines_columns_and_literals() {
        let int_col = TypeInfo::new(DataType::Int, false);
        let float_lit = TypeInfo::new(DataType::Float, true);
        let text_lit = TypeInfo::new(DataType::Text, true);
        assert_eq!(combine(int_col, float_lit).data_type, DataType::Float);
        assert_eq!(combine(int_col, text_lit).data_type, DataType::Int);
        let text_col = TypeInfo::new(DataType::Text, false);
        assert_eq!(combine(int_col, text_col).data_type, DataType::Text);
        let date_col = TypeInfo::new(DataType::Date, false);
        assert_eq!(combine(date_col, text_lit).data_type, DataType::Date);
    }

    #[test]
    fn int_column_plus_float_literal_coerces_literal() {
        let checker = Checker::default();
        let mut expr = binary(BinaryOp::Add, column(DataType::Int), Expr::literal("2.5"));
        let info = checker.check(&mut expr).unwrap();
        assert_eq!(info.data_type, DataType::Float);
        checker.enforce(&mut expr, info.data_type).unwrap();
        match expr {
            Expr::Binary { right, .. } => match *right {
                Expr::Literal(lit) => assert_eq!(lit.value, Value::Float(2.5)),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn date_arithmetic_keeps_operand_types() {
        let checker = Checker::default();
        let mut diff = binary(BinaryOp::Sub, column(DataType::Date), column(DataType::Date));
        assert_eq!(checker.check(&mut diff).unwrap().data_type, DataType::Duration);

        let mut shifted = binary(BinaryOp::Add, column(DataType::Date), Expr::literal("3 days"));
        assert_eq!(checker.check(&mut shifted).unwrap().data_type, DataType::Date);
        checker.enforce(&mut shifted, DataType::Date).unwrap();
    }

    #[test]
    fn operator_semantics_reject_bad_mixes() {
        let checker = Checker::default();
        let mut sum_dates = binary(BinaryOp::Add, column(DataType::Date), column(DataType::Date));
        assert!(checker.check(&mut sum_dates).is_err());

        let mut float_mod = binary(BinaryOp::Rem, column(DataType::Float), Expr::literal("2"));
        assert!(checker.check(&mut float_mod).is_err());

        let mut by_duration = binary(BinaryOp::Div, column(DataType::Int), column(DataType::Duration));
        assert!(checker.check(&mut by_duration).is_err());

        let mut text_times = binary(BinaryOp::Mul, column(DataType::Text), Expr::literal("2"));
        assert!(checker.check(&mut text_times).is_err());
    }

    #[test]
    fn function_parameter_rules() {
        let checker = Checker::default();
        let mut avg = aggregate(Function::Avg, column(DataType::Int));
        assert_eq!(checker.check(&mut avg).unwrap().data_type, DataType::Float);

        let mut sum_text = aggregate(Function::Sum, column(DataType::Text));
        assert!(checker.check(&mut sum_text).is_err());

        let mut year = aggregate(Function::Year, column(DataType::Date));
        assert_eq!(checker.check(&mut year).unwrap().data_type, DataType::Int);

        let mut year_of_int = aggregate(Function::Year, column(DataType::Int));
        assert!(checker.check(&mut year_of_int).is_err());
    }

    #[test]
    fn unparsable_literal_is_a_type_error() {
        let checker = Checker::default();
        let mut lit = Expr::literal("abc");
        assert!(checker.enforce(&mut lit, DataType::Int).is_err());
    }

    #[test]
    fn aggregates_mix_only_with_aggregates_or_literals() {
        let ok = binary(
            BinaryOp::Add,
            aggregate(Function::Sum, column(DataType::Int)),
            Expr::literal("1"),
        );
        assert!(agg_check(&ok).unwrap().aggregate);

        let bad = binary(
            BinaryOp::Add,
            aggregate(Function::Sum, column(DataType::Int)),
            column(DataType::Int),
        );
        assert!(agg_check(&bad).is_err());

        let nested = aggregate(Function::Sum, aggregate(Function::Max, column(DataType::Int)));
        assert!(agg_check(&nested).is_err());
    }

    #[test]
    fn between_unifies_all_three_operands() {
        let checker = Checker::default();
        let mut p = Predicate::Between {
            expr: column(DataType::Float),
            low: Expr::literal("1"),
            high: Expr::literal("2"),
            negated: false,
        };
        checker.check_predicate(&mut p).unwrap();
        match p {
            Predicate::Between { low: Expr::Literal(lit), .. } => {
                assert!(matches!(lit.value, Value::Float(_)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
