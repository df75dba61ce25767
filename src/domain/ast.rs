//! Query tree produced by the parser and annotated by the type checker.

use regex::Regex;

use crate::domain::schema::DataType;
use crate::domain::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Pow => "^",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Stdev,
    Stdevp,
    Abs,
    Format,
    Coalesce,
    Year,
    Month,
    MonthName,
    Week,
    DayOfWeek,
    DayName,
    DayOfYear,
    DayOfMonth,
    Hour,
    Encrypt,
    Decrypt,
    Inc,
}

impl Function {
    pub fn lookup(name: &str) -> Option<Function> {
        let func = match name.to_ascii_lowercase().as_str() {
            "sum" => Function::Sum,
            "avg" => Function::Avg,
            "min" => Function::Min,
            "max" => Function::Max,
            "count" => Function::Count,
            "stdev" => Function::Stdev,
            "stdevp" => Function::Stdevp,
            "abs" => Function::Abs,
            "format" => Function::Format,
            "coalesce" => Function::Coalesce,
            "year" => Function::Year,
            "month" => Function::Month,
            "monthname" => Function::MonthName,
            "week" => Function::Week,
            "day" | "dayofweek" => Function::DayOfWeek,
            "dayname" => Function::DayName,
            "dayofyear" => Function::DayOfYear,
            "dayofmonth" => Function::DayOfMonth,
            "hour" => Function::Hour,
            "encrypt" => Function::Encrypt,
            "decrypt" => Function::Decrypt,
            "inc" => Function::Inc,
            _ => return None,
        };
        Some(func)
    }

    pub fn is_aggregate(self) -> bool {
        matches!(
            self,
            Function::Sum
                | Function::Avg
                | Function::Min
                | Function::Max
                | Function::Count
                | Function::Stdev
                | Function::Stdevp
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Sum => "sum",
            Function::Avg => "avg",
            Function::Min => "min",
            Function::Max => "max",
            Function::Count => "count",
            Function::Stdev => "stdev",
            Function::Stdevp => "stdevp",
            Function::Abs => "abs",
            Function::Format => "format",
            Function::Coalesce => "coalesce",
            Function::Year => "year",
            Function::Month => "month",
            Function::MonthName => "monthname",
            Function::Week => "week",
            Function::DayOfWeek => "dayofweek",
            Function::DayName => "dayname",
            Function::DayOfYear => "dayofyear",
            Function::DayOfMonth => "dayofmonth",
            Function::Hour => "hour",
            Function::Encrypt => "encrypt",
            Function::Decrypt => "decrypt",
            Function::Inc => "inc",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnRef {
    pub file: usize,
    pub index: usize,
    pub name: String,
    pub data_type: DataType,
}

#[derive(Debug, Clone)]
pub struct Literal {
    pub text: String,
    /// Coerced value; set from `text` by the type checker.
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub func: Function,
    pub args: Vec<Expr>,
    pub distinct: bool,
    /// Resolved result type.
    pub data_type: DataType,
    /// Accumulator slot for aggregates, or counter slot for `inc`.
    pub slot: usize,
    /// Literal second argument of `format`, `encrypt` and `decrypt`.
    pub option: Option<String>,
}

#[derive(Debug, Clone)]
pub enum CaseExpr {
    Searched {
        branches: Vec<(Predicate, Expr)>,
        otherwise: Option<Expr>,
    },
    Simple {
        operand: Expr,
        branches: Vec<(Expr, Expr)>,
        otherwise: Option<Expr>,
    },
}

#[derive(Debug, Clone)]
pub enum Expr {
    Column(ColumnRef),
    Literal(Literal),
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Case(Box<CaseExpr>),
    Function(Box<FunctionCall>),
    /// Parenthesised expression, removed by the rewriter.
    Nested(Box<Expr>),
    /// A finished column of the current group's output row.
    Output(usize),
}

impl Expr {
    pub fn literal(text: impl Into<String>) -> Expr {
        let text = text.into();
        Expr::Literal(Literal {
            value: Value::Text(text.clone()),
            text,
        })
    }

    /// True when an aggregate call appears anywhere in this expression.
    pub fn has_aggregate(&self) -> bool {
        match self {
            Expr::Function(call) => {
                call.func.is_aggregate() || call.args.iter().any(Expr::has_aggregate)
            }
            Expr::Negate(e) | Expr::Nested(e) => e.has_aggregate(),
            Expr::Binary { left, right, .. } => left.has_aggregate() || right.has_aggregate(),
            Expr::Case(case) => match case.as_ref() {
                CaseExpr::Searched {
                    branches,
                    otherwise,
                } => {
                    branches
                        .iter()
                        .any(|(p, e)| p.has_aggregate() || e.has_aggregate())
                        || otherwise.as_ref().is_some_and(Expr::has_aggregate)
                }
                CaseExpr::Simple {
                    operand,
                    branches,
                    otherwise,
                } => {
                    operand.has_aggregate()
                        || branches
                            .iter()
                            .any(|(w, t)| w.has_aggregate() || t.has_aggregate())
                        || otherwise.as_ref().is_some_and(Expr::has_aggregate)
                }
            },
            Expr::Column(_) | Expr::Literal(_) | Expr::Output(_) => false,
        }
    }

    /// Every file referenced by a column in this expression.
    pub fn files(&self, out: &mut Vec<usize>) {
        match self {
            Expr::Column(c) => {
                if !out.contains(&c.file) {
                    out.push(c.file);
                }
            }
            Expr::Negate(e) | Expr::Nested(e) => e.files(out),
            Expr::Binary { left, right, .. } => {
                left.files(out);
                right.files(out);
            }
            Expr::Function(call) => call.args.iter().for_each(|a| a.files(out)),
            Expr::Case(case) => match case.as_ref() {
                CaseExpr::Searched {
                    branches,
                    otherwise,
                } => {
                    for (p, e) in branches {
                        p.files(out);
                        e.files(out);
                    }
                    if let Some(e) = otherwise {
                        e.files(out);
                    }
                }
                CaseExpr::Simple {
                    operand,
                    branches,
                    otherwise,
                } => {
                    operand.files(out);
                    for (w, t) in branches {
                        w.files(out);
                        t.files(out);
                    }
                    if let Some(e) = otherwise {
                        e.files(out);
                    }
                }
            },
            Expr::Literal(_) | Expr::Output(_) => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Compare {
        op: CompareOp,
        left: Expr,
        right: Expr,
        negated: bool,
    },
    Between {
        expr: Expr,
        low: Expr,
        high: Expr,
        negated: bool,
    },
    In {
        expr: Expr,
        list: Vec<Expr>,
        negated: bool,
    },
    Like {
        expr: Expr,
        pattern: Regex,
        negated: bool,
    },
    Logical {
        op: LogicalOp,
        left: Box<Predicate>,
        right: Box<Predicate>,
    },
    Not(Box<Predicate>),
    /// Parenthesised predicate, removed by the rewriter.
    Nested(Box<Predicate>),
}

impl Predicate {
    pub fn has_aggregate(&self) -> bool {
        match self {
            Predicate::Compare { left, right, .. } => left.has_aggregate() || right.has_aggregate(),
            Predicate::Between {
                expr, low, high, ..
            } => expr.has_aggregate() || low.has_aggregate() || high.has_aggregate(),
            Predicate::In { expr, list, .. } => {
                expr.has_aggregate() || list.iter().any(Expr::has_aggregate)
            }
            Predicate::Like { expr, .. } => expr.has_aggregate(),
            Predicate::Logical { left, right, .. } => {
                left.has_aggregate() || right.has_aggregate()
            }
            Predicate::Not(p) | Predicate::Nested(p) => p.has_aggregate(),
        }
    }

    pub fn files(&self, out: &mut Vec<usize>) {
        match self {
            Predicate::Compare { left, right, .. } => {
                left.files(out);
                right.files(out);
            }
            Predicate::Between {
                expr, low, high, ..
            } => {
                expr.files(out);
                low.files(out);
                high.files(out);
            }
            Predicate::In { expr, list, .. } => {
                expr.files(out);
                list.iter().for_each(|e| e.files(out));
            }
            Predicate::Like { expr, .. } => expr.files(out),
            Predicate::Logical { left, right, .. } => {
                left.files(out);
                right.files(out);
            }
            Predicate::Not(p) | Predicate::Nested(p) => p.files(out),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub expr: Expr,
    pub alias: Option<String>,
    /// Final output name, set by the rewriter.
    pub name: String,
    pub data_type: DataType,
    /// Computed but not part of the output (sort keys, having aggregates).
    pub hidden: bool,
    /// Marked `DISTINCT`; extracted into [`Query::distinct`] by the rewriter.
    pub distinct: bool,
    /// Slot holding this selection's value in a group row, when grouping
    /// and the expression has no aggregate.
    pub group_slot: Option<usize>,
}

impl Selection {
    pub fn new(expr: Expr) -> Self {
        Selection {
            expr,
            alias: None,
            name: String::new(),
            data_type: DataType::Null,
            hidden: false,
            distinct: false,
            group_slot: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStrategy {
    /// Keep whole records of the joined file in memory.
    Small,
    /// Keep byte offsets and re-read records on demand.
    Big,
}

#[derive(Debug, Clone)]
pub struct JoinClause {
    pub kind: JoinKind,
    pub strategy: JoinStrategy,
    pub file: usize,
    /// Key expression over earlier files.
    pub driving: Expr,
    /// Key expression over the joined file.
    pub joined: Expr,
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub expr: Expr,
    pub ascending: bool,
    /// Index of the hidden sort selection when grouping.
    pub selection: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Bare integers name columns by ordinal.
    pub ordinal_columns: bool,
    pub no_header: bool,
}

#[derive(Debug, Clone)]
pub struct Query {
    pub options: QueryOptions,
    pub selections: Vec<Selection>,
    pub joins: Vec<JoinClause>,
    pub filter: Option<Predicate>,
    pub group_by: Vec<Expr>,
    pub having: Option<Predicate>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub distinct: Option<Expr>,
    /// Any aggregate makes the query grouped.
    pub grouping: bool,
    /// Width of a group's accumulator row.
    pub group_width: usize,
    /// Number of `inc` counters.
    pub counters: usize,
}

impl Query {
    pub fn visible(&self) -> impl Iterator<Item = &Selection> {
        self.selections.iter().filter(|s| !s.hidden)
    }
}
