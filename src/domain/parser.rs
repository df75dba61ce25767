//! Recursive descent parser for the query language.
//!
//! Input files are opened while parsing: the parser jumps ahead to `FROM`,
//! opens and samples every file named there, and only then parses the select
//! list, so column names resolve against known schemas.

use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::domain::ast::{
    BinaryOp, CaseExpr, ColumnRef, CompareOp, Expr, Function, FunctionCall, JoinClause, JoinKind,
    JoinStrategy, Literal, LogicalOp, OrderBy, Predicate, Query, QueryOptions, Selection,
};
use crate::domain::engine::EngineConfig;
use crate::domain::error::{ParseError, QueryError};
use crate::domain::lexer::{Keyword, Operator, Token, TokenKind, scan};
use crate::domain::schema::{DataType, FileData, ReadOptions};
use crate::domain::value::Value;

const JOIN_WORDS: &[&str] = &["join", "sjoin", "bjoin"];
const JOIN_MODIFIERS: &[&str] = &["left", "inner", "outer"];
const RESERVED_WORDS: &[&str] = &[
    "join", "sjoin", "bjoin", "left", "inner", "outer", "on", "nh", "noheader",
];

/// Per-query compile state: the token stream, open files and aliases.
pub struct QueryContext<'a> {
    tokens: Vec<Token>,
    pos: usize,
    config: &'a EngineConfig,
    files: Vec<FileData>,
    aliases: HashMap<String, usize>,
    options: QueryOptions,
    grouping: bool,
    counters: usize,
}

/// Parse `text` into a query tree, opening the files it names.
pub fn parse(text: &str, config: &EngineConfig) -> Result<(Query, Vec<FileData>), QueryError> {
    let tokens = scan(text)?;
    let mut ctx = QueryContext {
        tokens,
        pos: 0,
        config,
        files: Vec::new(),
        aliases: HashMap::new(),
        options: QueryOptions::default(),
        grouping: false,
        counters: 0,
    };
    let query = ctx.parse_query()?;
    Ok((query, ctx.files))
}

impl<'a> QueryContext<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eos {
            self.pos += 1;
        }
        token
    }

    fn error_at(token: &Token, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            line: token.line,
            col: token.col,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        Self::error_at(self.peek(), message)
    }

    fn describe(token: &Token) -> String {
        match token.kind {
            TokenKind::Eos => "end of query".to_string(),
            _ => format!("'{}'", token.text),
        }
    }

    fn consume_keyword(&mut self, kw: Keyword) -> bool {
        if self.peek().is_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: Keyword, name: &str) -> Result<(), ParseError> {
        if self.consume_keyword(kw) {
            Ok(())
        } else {
            Err(self.error(format!(
                "expected {name}, found {}",
                Self::describe(self.peek())
            )))
        }
    }

    fn consume_op(&mut self, op: Operator) -> bool {
        if self.peek().is_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: Operator, symbol: &str) -> Result<(), ParseError> {
        if self.consume_op(op) {
            Ok(())
        } else {
            Err(self.error(format!(
                "expected '{symbol}', found {}",
                Self::describe(self.peek())
            )))
        }
    }

    fn consume_word(&mut self, words: &[&str]) -> Option<String> {
        let token = self.peek();
        let matched = words.iter().find(|w| token.is_word(w))?;
        let matched = matched.to_string();
        self.advance();
        Some(matched)
    }

    fn expect_word(&mut self, what: &str) -> Result<Token, ParseError> {
        if self.peek().kind == TokenKind::Word {
            Ok(self.advance())
        } else {
            Err(self.error(format!(
                "expected {what}, found {}",
                Self::describe(self.peek())
            )))
        }
    }

    fn parse_count(&mut self, what: &str) -> Result<usize, ParseError> {
        let token = self.expect_word(what)?;
        token
            .text
            .parse::<usize>()
            .map_err(|_| Self::error_at(&token, format!("invalid {what}: '{}'", token.text)))
    }

    fn parse_query(&mut self) -> Result<Query, QueryError> {
        self.parse_options();
        let select_start = self.pos;
        let from_pos = self.find_from()?;

        self.pos = from_pos;
        let joins = self.parse_from()?;
        let after_from = self.pos;

        self.pos = select_start;
        let (selections, top) = self.parse_select()?;
        if self.pos != from_pos {
            return Err(self
                .error(format!("unexpected {} in select list", Self::describe(self.peek())))
                .into());
        }
        self.pos = after_from;

        let filter = if self.consume_keyword(Keyword::Where) {
            Some(self.parse_predicates()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.consume_keyword(Keyword::Group) {
            self.expect_keyword(Keyword::By, "BY")?;
            loop {
                group_by.push(self.parse_expr_add()?);
                if self.consume_op(Operator::Comma) || self.starts_expression() {
                    continue;
                }
                break;
            }
        }

        let having = if self.consume_keyword(Keyword::Having) {
            Some(self.parse_predicates()?)
        } else {
            None
        };

        let order_by = if self.consume_keyword(Keyword::Order) {
            self.expect_keyword(Keyword::By, "BY")?;
            let expr = self.parse_expr_add()?;
            let ascending = if self.consume_keyword(Keyword::Asc) {
                true
            } else {
                self.consume_word(&["desc"]);
                false
            };
            Some(OrderBy {
                expr,
                ascending,
                selection: None,
            })
        } else {
            None
        };

        let mut limit = top;
        if self.consume_keyword(Keyword::Limit) {
            limit = Some(self.parse_count("limit")?);
        }

        if self.peek().kind != TokenKind::Eos {
            return Err(self
                .error(format!("unexpected {}", Self::describe(self.peek())))
                .into());
        }

        let grouping = self.grouping || !group_by.is_empty();
        Ok(Query {
            options: self.options,
            selections,
            joins,
            filter,
            group_by,
            having,
            order_by,
            limit,
            distinct: None,
            grouping,
            group_width: 0,
            counters: self.counters,
        })
    }

    fn parse_options(&mut self) {
        while let Some(word) = self.consume_word(&["c", "nh", "noheader", "h", "header"]) {
            match word.as_str() {
                "c" => self.options.ordinal_columns = true,
                "nh" | "noheader" => self.options.no_header = true,
                _ => self.options.no_header = false,
            }
        }
    }

    fn find_from(&self) -> Result<usize, ParseError> {
        let mut depth = 0usize;
        for (i, token) in self.tokens.iter().enumerate().skip(self.pos) {
            match token.kind {
                TokenKind::Op(Operator::LParen) => depth += 1,
                TokenKind::Op(Operator::RParen) => depth = depth.saturating_sub(1),
                TokenKind::Keyword(Keyword::From) if depth == 0 => return Ok(i),
                TokenKind::Eos => return Err(Self::error_at(token, "expected FROM")),
                _ => {}
            }
        }
        Err(self.error("expected FROM"))
    }

    fn starts_expression(&self) -> bool {
        let token = self.peek();
        match token.kind {
            TokenKind::Word => !RESERVED_WORDS.iter().any(|w| token.is_word(w)),
            TokenKind::Keyword(Keyword::Case) => true,
            TokenKind::Op(Operator::LParen | Operator::Minus) => true,
            _ => false,
        }
    }

    // ---- FROM / JOIN ----

    fn parse_from(&mut self) -> Result<Vec<JoinClause>, QueryError> {
        self.expect_keyword(Keyword::From, "FROM")?;
        let (path, has_header, alias) = self.parse_file_spec(false)?;
        self.open_file(path, has_header, alias)?;

        let mut joins = Vec::new();
        loop {
            let mut kind = JoinKind::Inner;
            let mut modified = false;
            while let Some(word) = self.consume_word(JOIN_MODIFIERS) {
                modified = true;
                if word != "inner" {
                    kind = JoinKind::Left;
                }
            }
            let forced = match self.consume_word(JOIN_WORDS).as_deref() {
                Some("sjoin") => Some(JoinStrategy::Small),
                Some("bjoin") => Some(JoinStrategy::Big),
                Some(_) => None,
                None if modified => {
                    return Err(self
                        .error(format!("expected JOIN, found {}", Self::describe(self.peek())))
                        .into());
                }
                None => break,
            };

            let join_token = self.peek().clone();
            let (path, has_header, alias) = self.parse_file_spec(true)?;
            let file = self.open_file(path, has_header, alias)?;

            if self.consume_word(&["on"]).is_none() {
                return Err(self
                    .error(format!("expected ON, found {}", Self::describe(self.peek())))
                    .into());
            }
            let driving = self.parse_expr_add()?;
            self.expect_op(Operator::Eq, "=")?;
            let joined = self.parse_expr_add()?;
            if [Keyword::And, Keyword::Or, Keyword::Xor]
                .iter()
                .any(|kw| self.peek().is_keyword(*kw))
            {
                return Err(self
                    .error("a join condition must be a single '=' comparison")
                    .into());
            }

            let size = self.files[file].size;
            let strategy = forced.unwrap_or(if size > self.config.join_size_threshold {
                JoinStrategy::Big
            } else {
                JoinStrategy::Small
            });
            tracing::debug!(
                line = join_token.line,
                file,
                size,
                ?strategy,
                ?kind,
                "join"
            );
            joins.push(JoinClause {
                kind,
                strategy,
                file,
                driving,
                joined,
            });
        }
        Ok(joins)
    }

    /// `file [NH] [[AS] alias] [NH]`. Joined files must carry an alias.
    fn parse_file_spec(
        &mut self,
        alias_required: bool,
    ) -> Result<(PathBuf, bool, Option<String>), QueryError> {
        let path = self.parse_file_name()?;
        let mut has_header = !self.options.no_header;
        if self.consume_word(&["nh", "noheader"]).is_some() {
            has_header = false;
        }

        let alias = if self.consume_keyword(Keyword::As) {
            Some(self.expect_word("alias")?.text)
        } else if self.peek().kind == TokenKind::Word
            && !RESERVED_WORDS.iter().any(|w| self.peek().is_word(w))
        {
            Some(self.advance().text)
        } else {
            None
        };
        if alias_required && alias.is_none() {
            return Err(self
                .error(format!("joined file {} needs an alias", path.display()))
                .into());
        }

        if self.consume_word(&["nh", "noheader"]).is_some() {
            has_header = false;
        }
        Ok((path, has_header, alias))
    }

    /// A quoted path, or adjacent unquoted tokens such as `data/q1-2024.csv`.
    fn parse_file_name(&mut self) -> Result<PathBuf, ParseError> {
        let first = self.peek().clone();
        let name = if first.is_quoted() {
            self.advance();
            first.text
        } else {
            if !matches!(
                first.kind,
                TokenKind::Word | TokenKind::Op(Operator::Slash)
            ) {
                return Err(self.error(format!(
                    "expected file name, found {}",
                    Self::describe(&first)
                )));
            }
            let mut name = self.advance().text;
            let (mut line, mut end) = (first.line, first.col + first.text.chars().count());
            loop {
                let next = self.peek();
                let joinable = matches!(
                    next.kind,
                    TokenKind::Word
                        | TokenKind::Keyword(_)
                        | TokenKind::Op(Operator::Slash | Operator::Minus | Operator::Plus)
                ) && !next.is_quoted();
                if !joinable || next.line != line || next.col != end {
                    break;
                }
                line = next.line;
                end = next.col + next.text.chars().count();
                name.push_str(&self.advance().text);
            }
            name
        };

        let path = match name.strip_prefix("~/") {
            Some(rest) => match std::env::var_os("HOME") {
                Some(home) => PathBuf::from(home).join(rest),
                None => PathBuf::from(&name),
            },
            None => PathBuf::from(&name),
        };
        Ok(path)
    }

    fn open_file(
        &mut self,
        path: PathBuf,
        has_header: bool,
        alias: Option<String>,
    ) -> Result<usize, QueryError> {
        let options = ReadOptions {
            delimiter: self.config.delimiter,
            has_header,
            sample_rows: self.config.sample_rows,
        };
        let data = FileData::open(&path, options)?;
        let id = self.files.len();
        if let Some(alias) = alias {
            self.aliases.insert(alias.to_lowercase(), id);
        }
        if let Some(stem) = data.stem() {
            self.aliases.entry(stem.to_lowercase()).or_insert(id);
        }
        self.files.push(data);
        Ok(id)
    }

    // ---- SELECT ----

    fn parse_select(&mut self) -> Result<(Vec<Selection>, Option<usize>), ParseError> {
        self.expect_keyword(Keyword::Select, "SELECT")?;
        let top = if self.peek().is_word("top") {
            self.advance();
            Some(self.parse_count("top count")?)
        } else {
            None
        };

        let mut selections = Vec::new();
        while !self.peek().is_keyword(Keyword::From) && self.peek().kind != TokenKind::Eos {
            if self.consume_op(Operator::Star) {
                selections.extend(self.all_columns());
            } else {
                selections.push(self.parse_selection()?);
            }
            if !self.consume_op(Operator::Comma) {
                break;
            }
        }
        if selections.is_empty() {
            selections = self.all_columns();
        }
        Ok((selections, top))
    }

    fn all_columns(&self) -> Vec<Selection> {
        self.files
            .iter()
            .enumerate()
            .flat_map(|(file, data)| {
                data.columns.iter().enumerate().map(move |(index, col)| {
                    Selection::new(Expr::Column(ColumnRef {
                        file,
                        index,
                        name: col.name.clone(),
                        data_type: col.data_type,
                    }))
                })
            })
            .collect()
    }

    fn parse_selection(&mut self) -> Result<Selection, ParseError> {
        let mut distinct = false;
        let mut hidden = false;
        if self.consume_keyword(Keyword::Distinct) {
            distinct = true;
            hidden = self.consume_word(&["hidden"]).is_some();
        }

        let mut alias = None;
        if self.peek().kind == TokenKind::Word && self.peek_at(1).is_op(Operator::Eq) {
            alias = Some(self.advance().text);
            self.advance();
        }

        let expr = self.parse_expr_add()?;
        if self.consume_keyword(Keyword::As) {
            alias = Some(self.expect_word("alias")?.text);
        }

        let mut selection = Selection::new(expr);
        selection.alias = alias;
        selection.distinct = distinct;
        selection.hidden = hidden;
        Ok(selection)
    }

    // ---- expressions ----

    fn parse_expr_add(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_expr_mult()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Op(Operator::Plus) => BinaryOp::Add,
                TokenKind::Op(Operator::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_expr_mult()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_expr_mult(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_expr_neg()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Op(Operator::Star) => BinaryOp::Mul,
                TokenKind::Op(Operator::Slash) => BinaryOp::Div,
                TokenKind::Op(Operator::Percent) => BinaryOp::Rem,
                TokenKind::Op(Operator::Caret) => BinaryOp::Pow,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_expr_neg()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_expr_neg(&mut self) -> Result<Expr, ParseError> {
        if self.consume_op(Operator::Minus) {
            return Ok(Expr::Negate(Box::new(self.parse_expr_case()?)));
        }
        self.parse_expr_case()
    }

    fn parse_expr_case(&mut self) -> Result<Expr, ParseError> {
        if !self.consume_keyword(Keyword::Case) {
            return self.parse_value();
        }

        let case = if self.peek().is_keyword(Keyword::When) {
            let mut branches = Vec::new();
            while self.consume_keyword(Keyword::When) {
                let condition = self.parse_predicates()?;
                self.expect_keyword(Keyword::Then, "THEN")?;
                branches.push((condition, self.parse_expr_add()?));
            }
            let otherwise = self.parse_case_else()?;
            CaseExpr::Searched {
                branches,
                otherwise,
            }
        } else {
            let operand = self.parse_expr_add()?;
            let mut branches = Vec::new();
            while self.consume_keyword(Keyword::When) {
                let candidate = self.parse_expr_add()?;
                self.expect_keyword(Keyword::Then, "THEN")?;
                branches.push((candidate, self.parse_expr_add()?));
            }
            if branches.is_empty() {
                return Err(self.error("CASE needs at least one WHEN"));
            }
            let otherwise = self.parse_case_else()?;
            CaseExpr::Simple {
                operand,
                branches,
                otherwise,
            }
        };
        Ok(Expr::Case(Box::new(case)))
    }

    fn parse_case_else(&mut self) -> Result<Option<Expr>, ParseError> {
        let otherwise = if self.consume_keyword(Keyword::Else) {
            Some(self.parse_expr_add()?)
        } else {
            None
        };
        self.expect_keyword(Keyword::End, "END")?;
        Ok(otherwise)
    }

    fn parse_value(&mut self) -> Result<Expr, ParseError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Op(Operator::LParen) => {
                self.advance();
                let inner = self.parse_expr_add()?;
                self.expect_op(Operator::RParen, ")")?;
                Ok(Expr::Nested(Box::new(inner)))
            }
            TokenKind::Word => {
                if !token.is_quoted() && self.peek_at(1).is_op(Operator::LParen) {
                    if let Some(func) = Function::lookup(&token.text) {
                        self.advance();
                        return self.parse_function(func, &token);
                    }
                }
                self.advance();
                self.resolve_word(&token)
            }
            _ => Err(self.error(format!(
                "expected expression, found {}",
                Self::describe(&token)
            ))),
        }
    }

    fn parse_function(&mut self, func: Function, name: &Token) -> Result<Expr, ParseError> {
        self.expect_op(Operator::LParen, "(")?;
        if func.is_aggregate() {
            self.grouping = true;
        }

        let distinct = func.is_aggregate() && self.consume_keyword(Keyword::Distinct);
        let mut args = Vec::new();
        let mut option = None;

        if func == Function::Count && self.consume_op(Operator::Star) {
            args.push(Expr::literal("1"));
        } else if func == Function::Inc {
            if !self.peek().is_op(Operator::RParen) {
                option = Some(self.expect_word("increment")?.text);
            }
        } else if !self.peek().is_op(Operator::RParen) {
            args.push(self.parse_expr_add()?);
            while self.consume_op(Operator::Comma) {
                if matches!(
                    func,
                    Function::Format | Function::Encrypt | Function::Decrypt
                ) {
                    option = Some(self.expect_word("literal argument")?.text);
                    break;
                }
                args.push(self.parse_expr_add()?);
            }
        }
        self.expect_op(Operator::RParen, ")")?;

        let arity_ok = match func {
            Function::Inc => args.is_empty(),
            Function::Coalesce => !args.is_empty(),
            _ => args.len() == 1,
        };
        if !arity_ok {
            return Err(Self::error_at(
                name,
                format!("wrong number of arguments to {}", func.name()),
            ));
        }

        let slot = if func == Function::Inc {
            self.counters += 1;
            self.counters - 1
        } else {
            0
        };
        Ok(Expr::Function(Box::new(FunctionCall {
            func,
            args,
            distinct,
            data_type: DataType::Null,
            slot,
            option,
        })))
    }

    /// Resolve a word to a column reference, or fall back to a literal.
    fn resolve_word(&self, token: &Token) -> Result<Expr, ParseError> {
        let text = &token.text;
        if token.quote == Some('\'') {
            return Ok(Expr::literal(text.clone()));
        }
        if !token.is_quoted() && text.eq_ignore_ascii_case("null") {
            return Ok(Expr::Literal(Literal {
                text: text.clone(),
                value: Value::Null,
            }));
        }

        if let Some((prefix, column)) = text.split_once('.') {
            if let Some(&file) = self.aliases.get(&prefix.to_lowercase()) {
                return self.column_in(file, column).ok_or_else(|| {
                    Self::error_at(token, format!("no column '{column}' in '{prefix}'"))
                });
            }
        }

        for file in 0..self.files.len() {
            if let Some(index) = self.files[file].column_index(text) {
                return Ok(self.column(file, index));
            }
        }

        if !token.is_quoted() && !self.files.is_empty() {
            if let Some(col) = self.ordinal(text) {
                return Ok(col);
            }
        }

        Ok(Expr::literal(text.clone()))
    }

    fn ordinal(&self, text: &str) -> Option<Expr> {
        let digits = match text.strip_prefix(['c', 'C']) {
            Some(rest) => rest,
            None if self.options.ordinal_columns => text,
            None => return None,
        };
        let n: usize = digits.parse().ok()?;
        (1..=self.files[0].width()).contains(&n).then(|| self.column(0, n - 1))
    }

    fn column_in(&self, file: usize, name: &str) -> Option<Expr> {
        if let Some(index) = self.files[file].column_index(name) {
            return Some(self.column(file, index));
        }
        let n: usize = name.strip_prefix(['c', 'C'])?.parse().ok()?;
        (1..=self.files[file].width())
            .contains(&n)
            .then(|| self.column(file, n - 1))
    }

    fn column(&self, file: usize, index: usize) -> Expr {
        let col = &self.files[file].columns[index];
        Expr::Column(ColumnRef {
            file,
            index,
            name: col.name.clone(),
            data_type: col.data_type,
        })
    }

    // ---- predicates ----

    fn parse_predicates(&mut self) -> Result<Predicate, ParseError> {
        let negate = self.consume_keyword(Keyword::Not);
        let mut left = self.parse_predicate_compare()?;
        if negate {
            left = Predicate::Not(Box::new(left));
        }
        let op = match self.peek().kind {
            TokenKind::Keyword(Keyword::And) => LogicalOp::And,
            TokenKind::Keyword(Keyword::Or) => LogicalOp::Or,
            TokenKind::Keyword(Keyword::Xor) => LogicalOp::Xor,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_predicates()?;
        Ok(Predicate::Logical {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_predicate_compare(&mut self) -> Result<Predicate, ParseError> {
        let negate = self.consume_keyword(Keyword::Not);
        let predicate = self.parse_predicate_inner()?;
        Ok(if negate {
            Predicate::Not(Box::new(predicate))
        } else {
            predicate
        })
    }

    fn parse_predicate_inner(&mut self) -> Result<Predicate, ParseError> {
        if self.peek().is_op(Operator::LParen) {
            let saved = self.pos;
            self.advance();
            if let Ok(inner) = self.parse_predicates() {
                if self.consume_op(Operator::RParen) {
                    return Ok(Predicate::Nested(Box::new(inner)));
                }
            }
            // Not a parenthesised predicate; reparse as an expression.
            self.pos = saved;
        }

        let left = self.parse_expr_add()?;
        let negated = self.consume_keyword(Keyword::Not) || self.consume_op(Operator::Bang);
        let token = self.advance();
        let op = match token.kind {
            TokenKind::Op(Operator::Eq) => CompareOp::Eq,
            TokenKind::Op(Operator::NotEq) => CompareOp::NotEq,
            TokenKind::Op(Operator::Lt) => CompareOp::Lt,
            TokenKind::Op(Operator::LtEq) => CompareOp::LtEq,
            TokenKind::Op(Operator::Gt) => CompareOp::Gt,
            TokenKind::Op(Operator::GtEq) => CompareOp::GtEq,
            TokenKind::Keyword(Keyword::Between) => {
                let low = self.parse_expr_add()?;
                self.expect_keyword(Keyword::And, "AND")?;
                let high = self.parse_expr_add()?;
                return Ok(Predicate::Between {
                    expr: left,
                    low,
                    high,
                    negated,
                });
            }
            TokenKind::Keyword(Keyword::In) => {
                self.expect_op(Operator::LParen, "(")?;
                let mut list = vec![self.parse_expr_add()?];
                while self.consume_op(Operator::Comma) {
                    list.push(self.parse_expr_add()?);
                }
                self.expect_op(Operator::RParen, ")")?;
                return Ok(Predicate::In {
                    expr: left,
                    list,
                    negated,
                });
            }
            TokenKind::Keyword(Keyword::Like) => {
                let pattern = self.expect_word("LIKE pattern")?;
                return Ok(Predicate::Like {
                    expr: left,
                    pattern: like_regex(&pattern.text)
                        .map_err(|e| Self::error_at(&pattern, e.to_string()))?,
                    negated,
                });
            }
            _ => {
                return Err(Self::error_at(
                    &token,
                    format!(
                        "expected comparison operator, found {}",
                        Self::describe(&token)
                    ),
                ));
            }
        };
        let right = self.parse_expr_add()?;
        Ok(Predicate::Compare {
            op,
            left,
            right,
            negated,
        })
    }
}

/// Translate a LIKE pattern into an anchored, case-insensitive regex.
pub fn like_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::from("(?is)^");
    for ch in pattern.chars() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, String) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("people.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "name,age,city\nann,31,Oslo\nbob,45,Rome\n").unwrap();
        (dir, path.display().to_string())
    }

    fn parse_ok(query: &str) -> (Query, Vec<FileData>) {
        parse(query, &EngineConfig::default()).unwrap()
    }

    fn parse_err(query: &str) -> String {
        match parse(query, &EngineConfig::default()) {
            Err(e) => e.to_string(),
            Ok(_) => panic!("expected an error for {query}"),
        }
    }

    #[test]
    fn select_star_expands_all_columns() {
        let (_dir, path) = fixture();
        let (query, files) = parse_ok(&format!("select * from '{path}'"));
        assert_eq!(files.len(), 1);
        assert_eq!(query.selections.len(), 3);
    }

    #[test]
    fn empty_select_list_means_all_columns() {
        let (_dir, path) = fixture();
        let (query, _) = parse_ok(&format!("select from '{path}'"));
        assert_eq!(query.selections.len(), 3);
    }

    #[test]
    fn unquoted_paths_are_reassembled() {
        let (_dir, path) = fixture();
        let (query, files) = parse_ok(&format!("select name from {path}"));
        assert_eq!(files[0].path, PathBuf::from(&path));
        assert_eq!(query.selections.len(), 1);
    }

    #[test]
    fn resolves_columns_and_literals() {
        let (_dir, path) = fixture();
        let (query, _) = parse_ok(&format!(
            "select NAME, people.age, c3, 'city', \"city\", 12 from '{path}'"
        ));
        let kinds: Vec<bool> = query
            .selections
            .iter()
            .map(|s| matches!(s.expr, Expr::Column(_)))
            .collect();
        assert_eq!(kinds, vec![true, true, true, false, true, false]);
    }

    #[test]
    fn ordinal_option_turns_numbers_into_columns() {
        let (_dir, path) = fixture();
        let (query, _) = parse_ok(&format!("c select 2 from '{path}'"));
        match &query.selections[0].expr {
            Expr::Column(c) => assert_eq!(c.name, "age"),
            other => panic!("expected column, got {other:?}"),
        }
    }

    #[test]
    fn aliases_both_forms() {
        let (_dir, path) = fixture();
        let (query, _) = parse_ok(&format!("select n = name, age as years from '{path}'"));
        assert_eq!(query.selections[0].alias.as_deref(), Some("n"));
        assert_eq!(query.selections[1].alias.as_deref(), Some("years"));
    }

    #[test]
    fn case_parses_in_both_forms() {
        let (_dir, path) = fixture();
        let (query, _) = parse_ok(&format!(
            "select case when age > 40 then 'old' when age > 30 then 'mid' end, \
             case city when 'Oslo' then 1 else 0 end from '{path}'"
        ));
        match &query.selections[0].expr {
            Expr::Case(case) => match case.as_ref() {
                CaseExpr::Searched {
                    branches,
                    otherwise,
                } => {
                    assert_eq!(branches.len(), 2);
                    assert!(otherwise.is_none());
                }
                other => panic!("expected searched case, got {other:?}"),
            },
            other => panic!("expected case, got {other:?}"),
        }
        match &query.selections[1].expr {
            Expr::Case(case) => match case.as_ref() {
                CaseExpr::Simple {
                    branches,
                    otherwise,
                    ..
                } => {
                    assert_eq!(branches.len(), 1);
                    assert!(otherwise.is_some());
                }
                other => panic!("expected simple case, got {other:?}"),
            },
            other => panic!("expected case, got {other:?}"),
        }
        assert!(parse_err(&format!("select case when age > 1 then 1 from '{path}'"))
            .contains("expected END"));
    }

    #[test]
    fn aggregates_make_the_query_grouped() {
        let (_dir, path) = fixture();
        let (query, _) = parse_ok(&format!("select count(*) from '{path}'"));
        assert!(query.grouping);
        let (query, _) = parse_ok(&format!("select name from '{path}'"));
        assert!(!query.grouping);
    }

    #[test]
    fn clauses_parse_in_order() {
        let (_dir, path) = fixture();
        let (query, _) = parse_ok(&format!(
            "select city, sum(age) from '{path}' where age > 1 group by city \
             having sum(age) > 10 order by city asc limit 5"
        ));
        assert!(query.filter.is_some());
        assert_eq!(query.group_by.len(), 1);
        assert!(query.having.is_some());
        assert!(query.order_by.as_ref().unwrap().ascending);
        assert_eq!(query.limit, Some(5));
    }

    #[test]
    fn top_sets_limit() {
        let (_dir, path) = fixture();
        let (query, _) = parse_ok(&format!("select top 1 name from '{path}'"));
        assert_eq!(query.limit, Some(1));
    }

    #[test]
    fn parenthesised_expression_inside_predicate() {
        let (_dir, path) = fixture();
        let (query, _) = parse_ok(&format!(
            "select name from '{path}' where (age + 1) > 40 and (city = 'Rome')"
        ));
        match query.filter.unwrap() {
            Predicate::Logical { left, right, .. } => {
                assert!(matches!(*left, Predicate::Compare { .. }));
                assert!(matches!(*right, Predicate::Nested(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bang_equals_negates() {
        let (_dir, path) = fixture();
        let (query, _) = parse_ok(&format!("select name from '{path}' where age != 31"));
        assert!(matches!(
            query.filter,
            Some(Predicate::Compare {
                op: CompareOp::Eq,
                negated: true,
                ..
            })
        ));
    }

    #[test]
    fn missing_from_is_an_error() {
        assert!(parse_err("select a").contains("expected FROM"));
    }

    #[test]
    fn trailing_garbage_is_an_error() {
        let (_dir, path) = fixture();
        assert!(parse_err(&format!("select name from '{path}' where age > 1 )")).contains("unexpected"));
    }

    #[test]
    fn join_requires_alias_and_single_comparison() {
        let (_dir, path) = fixture();
        assert!(
            parse_err(&format!(
                "select * from '{path}' p join '{path}' on p.name = name"
            ))
            .contains("alias")
        );
        assert!(
            parse_err(&format!(
                "select * from '{path}' p join '{path}' q on p.name = q.name and p.age = q.age"
            ))
            .contains("single")
        );
    }

    #[test]
    fn join_strategy_follows_size_threshold() {
        let (_dir, path) = fixture();
        let config = EngineConfig {
            join_size_threshold: 1,
            ..EngineConfig::default()
        };
        let (query, _) = parse(
            &format!("select * from '{path}' p left join '{path}' q on p.name = q.name"),
            &config,
        )
        .unwrap();
        assert_eq!(query.joins[0].strategy, JoinStrategy::Big);
        assert_eq!(query.joins[0].kind, JoinKind::Left);

        let (query, _) = parse(
            &format!("select * from '{path}' p sjoin '{path}' q on p.name = q.name"),
            &config,
        )
        .unwrap();
        assert_eq!(query.joins[0].strategy, JoinStrategy::Small);
    }

    #[test]
    fn like_pattern_translation() {
        let re = like_regex("a%b_").unwrap();
        assert!(re.is_match("AxyzBc"));
        assert!(!re.is_match("ab"));
        let re = like_regex("1.5%").unwrap();
        assert!(re.is_match("1.50"));
        assert!(!re.is_match("105"));
    }
}
