//! Post-parse analysis: type checking of every clause, pruning, column
//! naming, aggregate slot assignment and having hoisting.

use crate::domain::ast::{CaseExpr, Expr, FunctionCall, Predicate, Query, Selection};
use crate::domain::error::QueryError;
use crate::domain::schema::{ColumnDetail, DataType};
use crate::domain::typecheck::{Checker, agg_check, combine};

/// Validate and annotate a parsed query in place.
pub fn analyze(query: &mut Query) -> Result<(), QueryError> {
    check_aggregate_placement(query)?;

    let mut checker = Checker::default();
    for selection in query.selections.iter_mut() {
        type_selection(&checker, selection)?;
    }

    prune(query);
    extract_distinct(query)?;

    if query.grouping {
        if let Some(order) = query.order_by.as_mut() {
            let mut hidden = Selection::new(order.expr.clone());
            hidden.hidden = true;
            agg_check(&hidden.expr)?;
            type_selection(&checker, &mut hidden)?;
            order.selection = Some(query.selections.len());
            query.selections.push(hidden);
        }
    }

    checker.outputs = query.selections.iter().map(|s| s.data_type).collect();
    hoist_having_aggregates(query, &mut checker)?;
    if let Some(having) = query.having.as_mut() {
        checker.check_predicate(having)?;
    }

    name_columns(query);
    assign_slots(query);
    check_joins(query, &checker)?;

    if let Some(filter) = query.filter.as_mut() {
        checker.check_predicate(filter)?;
    }
    for expr in query.group_by.iter_mut() {
        let info = checker.check(expr)?;
        checker.enforce(expr, info.data_type)?;
    }
    if !query.grouping {
        if let Some(order) = query.order_by.as_mut() {
            let info = checker.check(&mut order.expr)?;
            checker.enforce(&mut order.expr, info.data_type)?;
        }
    }
    Ok(())
}

/// Output columns of an analyzed query.
pub fn output_columns(query: &Query) -> Vec<ColumnDetail> {
    query
        .visible()
        .enumerate()
        .map(|(i, s)| ColumnDetail {
            name: s.name.clone(),
            data_type: s.data_type,
            position: i + 1,
        })
        .collect()
}

fn type_selection(checker: &Checker, selection: &mut Selection) -> Result<(), QueryError> {
    let info = checker.check(&mut selection.expr)?;
    checker.enforce(&mut selection.expr, info.data_type)?;
    selection.data_type = info.data_type;
    Ok(())
}

fn check_aggregate_placement(query: &Query) -> Result<(), QueryError> {
    for selection in &query.selections {
        agg_check(&selection.expr)?;
    }
    if query.filter.as_ref().is_some_and(Predicate::has_aggregate) {
        return Err(QueryError::type_error(
            "aggregate functions are not allowed in WHERE",
        ));
    }
    if query.group_by.iter().any(Expr::has_aggregate) {
        return Err(QueryError::type_error(
            "aggregate functions are not allowed in GROUP BY",
        ));
    }
    if query
        .joins
        .iter()
        .any(|j| j.driving.has_aggregate() || j.joined.has_aggregate())
    {
        return Err(QueryError::type_error(
            "aggregate functions are not allowed in a join condition",
        ));
    }
    if query.having.is_some() && !query.grouping {
        return Err(QueryError::type_error(
            "HAVING needs GROUP BY or an aggregate",
        ));
    }
    if !query.group_by.is_empty() {
        let mut distinct_aggregate = false;
        for selection in &query.selections {
            visit_calls(&selection.expr, &mut |call| {
                distinct_aggregate |= call.distinct;
            });
        }
        if distinct_aggregate {
            return Err(QueryError::type_error(
                "DISTINCT aggregates cannot be combined with GROUP BY",
            ));
        }
    }
    Ok(())
}

/// Visit every function call in `expr`, including those inside case
/// conditions.
fn visit_calls(expr: &Expr, f: &mut dyn FnMut(&FunctionCall)) {
    match expr {
        Expr::Function(call) => {
            f(call);
            call.args.iter().for_each(|a| visit_calls(a, f));
        }
        Expr::Negate(e) | Expr::Nested(e) => visit_calls(e, f),
        Expr::Binary { left, right, .. } => {
            visit_calls(left, f);
            visit_calls(right, f);
        }
        Expr::Case(case) => match case.as_ref() {
            CaseExpr::Searched {
                branches,
                otherwise,
            } => {
                for (p, e) in branches {
                    visit_predicate_calls(p, f);
                    visit_calls(e, f);
                }
                if let Some(e) = otherwise {
                    visit_calls(e, f);
                }
            }
            CaseExpr::Simple {
                operand,
                branches,
                otherwise,
            } => {
                visit_calls(operand, f);
                for (w, t) in branches {
                    visit_calls(w, f);
                    visit_calls(t, f);
                }
                if let Some(e) = otherwise {
                    visit_calls(e, f);
                }
            }
        },
        Expr::Column(_) | Expr::Literal(_) | Expr::Output(_) => {}
    }
}

/// Visit every function call anywhere in the query.
pub fn visit_query_calls(query: &Query, f: &mut dyn FnMut(&FunctionCall)) {
    for selection in &query.selections {
        visit_calls(&selection.expr, f);
    }
    for predicate in query.filter.iter().chain(query.having.iter()) {
        visit_predicate_calls(predicate, f);
    }
    for expr in &query.group_by {
        visit_calls(expr, f);
    }
    if let Some(order) = &query.order_by {
        visit_calls(&order.expr, f);
    }
    for join in &query.joins {
        visit_calls(&join.driving, f);
        visit_calls(&join.joined, f);
    }
}

fn visit_predicate_calls(predicate: &Predicate, f: &mut dyn FnMut(&FunctionCall)) {
    match predicate {
        Predicate::Compare { left, right, .. } => {
            visit_calls(left, f);
            visit_calls(right, f);
        }
        Predicate::Between {
            expr, low, high, ..
        } => {
            visit_calls(expr, f);
            visit_calls(low, f);
            visit_calls(high, f);
        }
        Predicate::In { expr, list, .. } => {
            visit_calls(expr, f);
            list.iter().for_each(|e| visit_calls(e, f));
        }
        Predicate::Like { expr, .. } => visit_calls(expr, f),
        Predicate::Logical { left, right, .. } => {
            visit_predicate_calls(left, f);
            visit_predicate_calls(right, f);
        }
        Predicate::Not(inner) | Predicate::Nested(inner) => visit_predicate_calls(inner, f),
    }
}

fn visit_calls_mut(expr: &mut Expr, f: &mut dyn FnMut(&mut FunctionCall)) {
    match expr {
        Expr::Function(call) => {
            f(call);
            call.args.iter_mut().for_each(|a| visit_calls_mut(a, f));
        }
        Expr::Negate(e) | Expr::Nested(e) => visit_calls_mut(e, f),
        Expr::Binary { left, right, .. } => {
            visit_calls_mut(left, f);
            visit_calls_mut(right, f);
        }
        Expr::Case(case) => match case.as_mut() {
            CaseExpr::Searched {
                branches,
                otherwise,
            } => {
                for (p, e) in branches.iter_mut() {
                    visit_predicate_calls_mut(p, f);
                    visit_calls_mut(e, f);
                }
                if let Some(e) = otherwise {
                    visit_calls_mut(e, f);
                }
            }
            CaseExpr::Simple {
                operand,
                branches,
                otherwise,
            } => {
                visit_calls_mut(operand, f);
                for (w, t) in branches.iter_mut() {
                    visit_calls_mut(w, f);
                    visit_calls_mut(t, f);
                }
                if let Some(e) = otherwise {
                    visit_calls_mut(e, f);
                }
            }
        },
        Expr::Column(_) | Expr::Literal(_) | Expr::Output(_) => {}
    }
}

fn visit_predicate_calls_mut(predicate: &mut Predicate, f: &mut dyn FnMut(&mut FunctionCall)) {
    match predicate {
        Predicate::Compare { left, right, .. } => {
            visit_calls_mut(left, f);
            visit_calls_mut(right, f);
        }
        Predicate::Between {
            expr, low, high, ..
        } => {
            visit_calls_mut(expr, f);
            visit_calls_mut(low, f);
            visit_calls_mut(high, f);
        }
        Predicate::In { expr, list, .. } => {
            visit_calls_mut(expr, f);
            list.iter_mut().for_each(|e| visit_calls_mut(e, f));
        }
        Predicate::Like { expr, .. } => visit_calls_mut(expr, f),
        Predicate::Logical { left, right, .. } => {
            visit_predicate_calls_mut(left, f);
            visit_predicate_calls_mut(right, f);
        }
        Predicate::Not(inner) | Predicate::Nested(inner) => visit_predicate_calls_mut(inner, f),
    }
}

// ---- pruning ----

fn prune(query: &mut Query) {
    for selection in query.selections.iter_mut() {
        prune_expr(&mut selection.expr);
    }
    if let Some(p) = query.filter.as_mut() {
        prune_predicate(p);
    }
    if let Some(p) = query.having.as_mut() {
        prune_predicate(p);
    }
    for expr in query.group_by.iter_mut() {
        prune_expr(expr);
    }
    if let Some(order) = query.order_by.as_mut() {
        prune_expr(&mut order.expr);
    }
    for join in query.joins.iter_mut() {
        prune_expr(&mut join.driving);
        prune_expr(&mut join.joined);
    }
}

/// Replace parenthesised pass-through nodes with their contents.
pub fn prune_expr(expr: &mut Expr) {
    while let Expr::Nested(inner) = expr {
        let inner = std::mem::replace(inner.as_mut(), Expr::Output(0));
        *expr = inner;
    }
    match expr {
        Expr::Negate(e) => prune_expr(e),
        Expr::Binary { left, right, .. } => {
            prune_expr(left);
            prune_expr(right);
        }
        Expr::Function(call) => call.args.iter_mut().for_each(prune_expr),
        Expr::Case(case) => match case.as_mut() {
            CaseExpr::Searched {
                branches,
                otherwise,
            } => {
                for (p, e) in branches.iter_mut() {
                    prune_predicate(p);
                    prune_expr(e);
                }
                if let Some(e) = otherwise {
                    prune_expr(e);
                }
            }
            CaseExpr::Simple {
                operand,
                branches,
                otherwise,
            } => {
                prune_expr(operand);
                for (w, t) in branches.iter_mut() {
                    prune_expr(w);
                    prune_expr(t);
                }
                if let Some(e) = otherwise {
                    prune_expr(e);
                }
            }
        },
        Expr::Nested(_) | Expr::Column(_) | Expr::Literal(_) | Expr::Output(_) => {}
    }
}

fn empty_in() -> Predicate {
    Predicate::In {
        expr: Expr::Output(0),
        list: Vec::new(),
        negated: false,
    }
}

pub fn prune_predicate(predicate: &mut Predicate) {
    while let Predicate::Nested(inner) = predicate {
        let inner = std::mem::replace(inner.as_mut(), empty_in());
        *predicate = inner;
    }
    match predicate {
        Predicate::Compare { left, right, .. } => {
            prune_expr(left);
            prune_expr(right);
        }
        Predicate::Between {
            expr, low, high, ..
        } => {
            prune_expr(expr);
            prune_expr(low);
            prune_expr(high);
        }
        Predicate::In { expr, list, .. } => {
            prune_expr(expr);
            list.iter_mut().for_each(prune_expr);
        }
        Predicate::Like { expr, .. } => prune_expr(expr),
        Predicate::Logical { left, right, .. } => {
            prune_predicate(left);
            prune_predicate(right);
        }
        Predicate::Not(inner) => prune_predicate(inner),
        Predicate::Nested(_) => {}
    }
}

/// Move the `DISTINCT` selection's expression into the query. A
/// `DISTINCT HIDDEN` selection is dropped from the output.
fn extract_distinct(query: &mut Query) -> Result<(), QueryError> {
    let marked: Vec<usize> = query
        .selections
        .iter()
        .enumerate()
        .filter(|(_, s)| s.distinct)
        .map(|(i, _)| i)
        .collect();
    match marked.as_slice() {
        [] => Ok(()),
        [index] => {
            if query.grouping {
                return Err(QueryError::type_error(
                    "DISTINCT cannot be used in a grouped query",
                ));
            }
            let selection = &mut query.selections[*index];
            selection.distinct = false;
            query.distinct = Some(selection.expr.clone());
            if selection.hidden {
                query.selections.remove(*index);
            }
            Ok(())
        }
        _ => Err(QueryError::type_error(
            "only one DISTINCT expression is allowed",
        )),
    }
}

// ---- having ----

fn hoist_having_aggregates(query: &mut Query, checker: &mut Checker) -> Result<(), QueryError> {
    let Some(mut having) = query.having.take() else {
        return Ok(());
    };
    hoist_predicate(&mut having, &mut query.selections, checker)?;
    query.having = Some(having);
    Ok(())
}

fn hoist_predicate(
    predicate: &mut Predicate,
    selections: &mut Vec<Selection>,
    checker: &mut Checker,
) -> Result<(), QueryError> {
    match predicate {
        Predicate::Compare { left, right, .. } => {
            hoist_side(left, selections, checker)?;
            hoist_side(right, selections, checker)
        }
        Predicate::Between {
            expr, low, high, ..
        } => {
            hoist_side(expr, selections, checker)?;
            hoist_side(low, selections, checker)?;
            hoist_side(high, selections, checker)
        }
        Predicate::In { expr, list, .. } => {
            hoist_side(expr, selections, checker)?;
            for item in list.iter_mut() {
                hoist_side(item, selections, checker)?;
            }
            Ok(())
        }
        Predicate::Like { expr, .. } => hoist_side(expr, selections, checker),
        Predicate::Logical { left, right, .. } => {
            hoist_predicate(left, selections, checker)?;
            hoist_predicate(right, selections, checker)
        }
        Predicate::Not(inner) | Predicate::Nested(inner) => {
            hoist_predicate(inner, selections, checker)
        }
    }
}

fn hoist_side(
    side: &mut Expr,
    selections: &mut Vec<Selection>,
    checker: &mut Checker,
) -> Result<(), QueryError> {
    let info = agg_check(side)?;
    if info.literal {
        return Ok(());
    }
    if !info.aggregate {
        return Err(QueryError::type_error(
            "HAVING conditions may only compare aggregates and literals",
        ));
    }
    let mut hidden = Selection::new(side.clone());
    hidden.hidden = true;
    type_selection(checker, &mut hidden)?;
    let index = selections.len();
    checker.outputs.push(hidden.data_type);
    selections.push(hidden);
    *side = Expr::Output(index);
    Ok(())
}

// ---- naming and slots ----

fn name_columns(query: &mut Query) {
    let mut position = 0;
    for selection in query.selections.iter_mut().filter(|s| !s.hidden) {
        position += 1;
        selection.name = match (&selection.alias, &selection.expr) {
            (Some(alias), _) => alias.clone(),
            (None, Expr::Column(col)) => col.name.clone(),
            _ => format!("col{position}"),
        };
    }
}

/// Give each aggregate call an accumulator slot, and each plain selection of
/// a grouped query a slot for its value.
fn assign_slots(query: &mut Query) {
    if !query.grouping {
        return;
    }
    let mut next = 0;
    for selection in query.selections.iter_mut() {
        if selection.expr.has_aggregate() {
            visit_calls_mut(&mut selection.expr, &mut |call| {
                if call.func.is_aggregate() {
                    call.slot = next;
                    next += 1;
                }
            });
        } else {
            selection.group_slot = Some(next);
            next += 1;
        }
    }
    query.group_width = next;
}

// ---- joins ----

fn single_file(expr: &Expr) -> Result<usize, QueryError> {
    let mut files = Vec::new();
    expr.files(&mut files);
    match files.as_slice() {
        [file] => Ok(*file),
        _ => Err(QueryError::type_error(
            "each side of a join condition must reference exactly one file",
        )),
    }
}

fn check_joins(query: &mut Query, checker: &Checker) -> Result<(), QueryError> {
    for join in query.joins.iter_mut() {
        let left = single_file(&join.driving)?;
        let right = single_file(&join.joined)?;
        if left == right {
            return Err(QueryError::type_error(
                "a join condition must compare two different files",
            ));
        }
        if left == join.file {
            std::mem::swap(&mut join.driving, &mut join.joined);
        }
        if left.max(right) != join.file {
            return Err(QueryError::type_error(
                "a join condition must compare the joined file with an earlier file",
            ));
        }

        let t = combine(checker.check(&mut join.driving)?, checker.check(&mut join.joined)?)
            .data_type;
        if t == DataType::Null {
            return Err(QueryError::type_error("join keys have no usable type"));
        }
        checker.enforce(&mut join.driving, t)?;
        checker.enforce(&mut join.joined, t)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::engine::EngineConfig;
    use crate::domain::parser::parse;
    use std::io::Write;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        sales: String,
        regions: String,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let sales = dir.path().join("sales.csv");
        let mut f = std::fs::File::create(&sales).unwrap();
        write!(f, "region,amount,day\nA,1,2024-01-01\nB,5,2024-01-02\nA,2,2024-01-03\n").unwrap();
        let regions = dir.path().join("regions.csv");
        let mut f = std::fs::File::create(&regions).unwrap();
        write!(f, "code,label\nA,Alpha\nB,Beta\n").unwrap();
        Fixture {
            sales: sales.display().to_string(),
            regions: regions.display().to_string(),
            _dir: dir,
        }
    }

    fn analyzed(query: &str) -> Result<Query, QueryError> {
        let (mut q, _) = parse(query, &EngineConfig::default())?;
        analyze(&mut q)?;
        Ok(q)
    }

    #[test]
    fn names_columns_from_alias_source_or_position() {
        let f = fixture();
        let q = analyzed(&format!(
            "select region, amount * 2, total = amount from '{}'",
            f.sales
        ))
        .unwrap();
        let names: Vec<String> = output_columns(&q).into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["region", "col2", "total"]);
    }

    #[test]
    fn grouped_order_by_becomes_hidden_selection() {
        let f = fixture();
        let q = analyzed(&format!(
            "select region, sum(amount) from '{}' group by region order by sum(amount)",
            f.sales
        ))
        .unwrap();
        assert_eq!(q.selections.len(), 3);
        assert!(q.selections[2].hidden);
        assert_eq!(q.order_by.as_ref().unwrap().selection, Some(2));
        assert_eq!(output_columns(&q).len(), 2);
    }

    #[test]
    fn having_aggregates_are_hoisted() {
        let f = fixture();
        let q = analyzed(&format!(
            "select region from '{}' group by region having max(amount) > 1",
            f.sales
        ))
        .unwrap();
        assert_eq!(q.selections.len(), 2);
        match q.having.unwrap() {
            Predicate::Compare { left, .. } => assert!(matches!(left, Expr::Output(1))),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(q.group_width, 2);
    }

    #[test]
    fn aggregates_in_case_conditions_get_their_own_slots() {
        let f = fixture();
        let q = analyzed(&format!(
            "select case when sum(amount) > 5 and max(amount) > 2 then min(amount) else 0 end \
             from '{}'",
            f.sales
        ))
        .unwrap();
        let mut slots = Vec::new();
        visit_query_calls(&q, &mut |call| {
            if call.func.is_aggregate() {
                slots.push(call.slot);
            }
        });
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2]);
        assert_eq!(q.group_width, 3);
    }

    #[test]
    fn having_rejects_plain_columns() {
        let f = fixture();
        let err = analyzed(&format!(
            "select region, sum(amount) from '{}' group by region having amount > 1",
            f.sales
        ))
        .unwrap_err();
        assert!(err.to_string().contains("HAVING"));
    }

    #[test]
    fn aggregates_rejected_in_where() {
        let f = fixture();
        let err = analyzed(&format!("select region from '{}' where sum(amount) > 1", f.sales))
            .unwrap_err();
        assert!(err.to_string().contains("WHERE"));
    }

    #[test]
    fn aggregate_with_column_is_rejected() {
        let f = fixture();
        assert!(analyzed(&format!("select sum(amount) + amount from '{}'", f.sales)).is_err());
    }

    #[test]
    fn distinct_hidden_is_removed_from_output() {
        let f = fixture();
        let q = analyzed(&format!(
            "select distinct hidden region, amount from '{}'",
            f.sales
        ))
        .unwrap();
        assert!(q.distinct.is_some());
        assert_eq!(q.selections.len(), 1);
    }

    #[test]
    fn distinct_aggregate_with_group_by_is_rejected() {
        let f = fixture();
        assert!(
            analyzed(&format!(
                "select region, count(distinct amount) from '{}' group by region",
                f.sales
            ))
            .is_err()
        );
    }

    #[test]
    fn join_sides_are_normalized() {
        let f = fixture();
        let q = analyzed(&format!(
            "select s.amount, r.label from '{}' s join '{}' r on r.code = s.region",
            f.sales, f.regions
        ))
        .unwrap();
        let join = &q.joins[0];
        assert_eq!(single_file(&join.driving).unwrap(), 0);
        assert_eq!(single_file(&join.joined).unwrap(), 1);
    }

    #[test]
    fn join_on_one_file_is_rejected() {
        let f = fixture();
        assert!(
            analyzed(&format!(
                "select * from '{}' s join '{}' r on s.region = s.amount",
                f.sales, f.regions
            ))
            .is_err()
        );
    }

    #[test]
    fn prune_removes_parentheses() {
        let f = fixture();
        let q = analyzed(&format!("select ((amount)) from '{}'", f.sales)).unwrap();
        assert!(matches!(q.selections[0].expr, Expr::Column(_)));
        assert_eq!(q.selections[0].name, "amount");
    }
}
