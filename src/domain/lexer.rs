//! Query tokenizer.
//!
//! A small table-driven DFA: every input character is classified, and the
//! (state, class) pair selects the next transition. Quoted text is captured
//! verbatim and never treated as a keyword.

use crate::domain::error::LexError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    And,
    Or,
    Xor,
    Select,
    From,
    Having,
    As,
    Where,
    Limit,
    Order,
    By,
    Distinct,
    Asc,
    Between,
    Like,
    Case,
    When,
    Then,
    Else,
    End,
    In,
    Group,
    Not,
}

impl Keyword {
    fn lookup(word: &str) -> Option<Keyword> {
        let kw = match word.to_ascii_lowercase().as_str() {
            "and" => Keyword::And,
            "or" => Keyword::Or,
            "xor" => Keyword::Xor,
            "select" => Keyword::Select,
            "from" => Keyword::From,
            "having" => Keyword::Having,
            "as" => Keyword::As,
            "where" => Keyword::Where,
            "limit" => Keyword::Limit,
            "order" => Keyword::Order,
            "by" => Keyword::By,
            "distinct" => Keyword::Distinct,
            "asc" => Keyword::Asc,
            "between" => Keyword::Between,
            "like" => Keyword::Like,
            "case" => Keyword::Case,
            "when" => Keyword::When,
            "then" => Keyword::Then,
            "else" => Keyword::Else,
            "end" => Keyword::End,
            "in" => Keyword::In,
            "group" => Keyword::Group,
            "not" => Keyword::Not,
            _ => return None,
        };
        Some(kw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Bang,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    SingleQuote,
    DoubleQuote,
    Comma,
    LParen,
    RParen,
    Star,
    Plus,
    Minus,
    Percent,
    Slash,
    Caret,
}

impl Operator {
    fn lookup(text: &str) -> Option<Operator> {
        let op = match text {
            "=" => Operator::Eq,
            "!" => Operator::Bang,
            "<>" => Operator::NotEq,
            "<" => Operator::Lt,
            "<=" => Operator::LtEq,
            ">" => Operator::Gt,
            ">=" => Operator::GtEq,
            "'" => Operator::SingleQuote,
            "\"" => Operator::DoubleQuote,
            "," => Operator::Comma,
            "(" => Operator::LParen,
            ")" => Operator::RParen,
            "*" => Operator::Star,
            "+" => Operator::Plus,
            "-" => Operator::Minus,
            "%" => Operator::Percent,
            "/" => Operator::Slash,
            "^" => Operator::Caret,
            _ => return None,
        };
        Some(op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    Keyword(Keyword),
    Op(Operator),
    Eos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub col: usize,
    /// The quote character for quoted text.
    pub quote: Option<char>,
}

impl Token {
    pub fn is_quoted(&self) -> bool {
        self.quote.is_some()
    }

    pub fn is_keyword(&self, kw: Keyword) -> bool {
        self.kind == TokenKind::Keyword(kw)
    }

    pub fn is_op(&self, op: Operator) -> bool {
        self.kind == TokenKind::Op(op)
    }

    /// True for an unquoted word equal to `word`, ignoring case.
    pub fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.quote.is_none() && self.text.eq_ignore_ascii_case(word)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Alnum,
    WordPunct,
    Special,
    Equals,
    AngleOpen,
    Separator,
    Other,
}

const CLASSES: usize = 7;

fn classify(ch: char) -> CharClass {
    match ch {
        '<' | '>' => CharClass::AngleOpen,
        '=' => CharClass::Equals,
        '*' | '!' | '\'' | '"' | '(' | ')' | ',' | '+' | '-' | '%' | '/' | '^' => {
            CharClass::Special
        }
        '\\' | ':' | '_' | '.' | '[' | ']' | '~' | '{' | '}' => CharClass::WordPunct,
        ' ' | '\t' | '\n' | '\r' | ';' | '\0' => CharClass::Separator,
        c if c.is_alphanumeric() => CharClass::Alnum,
        _ => CharClass::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    SingleSpecial,
    MaybeDouble,
    Word,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// Consume the character and move to the state.
    Shift(State),
    /// Skip the character without starting a token.
    Skip,
    /// Finish the pending token without consuming the character.
    Emit,
    Fail,
}

use State::{Initial, MaybeDouble, SingleSpecial, Word as InWord};
use Transition::{Emit, Fail, Shift, Skip};

// Rows follow `State`, columns follow `CharClass`.
#[rustfmt::skip]
const TABLE: [[Transition; CLASSES]; 4] = [
    // Alnum        WordPunct      Special              Equals               AngleOpen            Separator Other
    [Shift(InWord), Shift(InWord), Shift(SingleSpecial), Shift(SingleSpecial), Shift(MaybeDouble), Skip, Fail],
    [Emit,          Emit,          Emit,                Emit,                Emit,                Emit, Emit],
    [Emit,          Emit,          Emit,                Shift(SingleSpecial), Shift(SingleSpecial), Emit, Emit],
    [Shift(InWord), Shift(InWord), Emit,                Emit,                Emit,                Emit, Emit],
];

fn row(state: State) -> usize {
    match state {
        Initial => 0,
        SingleSpecial => 1,
        MaybeDouble => 2,
        InWord => 3,
    }
}

fn column(class: CharClass) -> usize {
    match class {
        CharClass::Alnum => 0,
        CharClass::WordPunct => 1,
        CharClass::Special => 2,
        CharClass::Equals => 3,
        CharClass::AngleOpen => 4,
        CharClass::Separator => 5,
        CharClass::Other => 6,
    }
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl Scanner {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn error(&self, found: char, message: impl Into<String>) -> LexError {
        LexError {
            message: message.into(),
            found,
            line: self.line,
            col: self.col,
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, LexError> {
        let mut state = Initial;
        let mut text = String::new();
        let (mut line, mut col) = (self.line, self.col);

        loop {
            let Some(ch) = self.peek() else {
                break;
            };
            match TABLE[row(state)][column(classify(ch))] {
                Shift(next) => {
                    if state == Initial {
                        line = self.line;
                        col = self.col;
                    }
                    text.push(ch);
                    self.bump();
                    state = next;
                }
                Skip => {
                    self.bump();
                }
                Emit => break,
                Fail if state == Initial => {
                    return Err(self.error(ch, format!("unexpected character '{ch}'")));
                }
                Fail => break,
            }
        }

        if state == Initial {
            return Ok(None);
        }

        if state == InWord {
            let kind = match Keyword::lookup(&text) {
                Some(kw) => TokenKind::Keyword(kw),
                None => TokenKind::Word,
            };
            return Ok(Some(Token {
                kind,
                text,
                line,
                col,
                quote: None,
            }));
        }

        let op = Operator::lookup(&text).ok_or_else(|| LexError {
            message: format!("unrecognized operator '{text}'"),
            found: text.chars().last().unwrap_or(' '),
            line,
            col,
        })?;

        if matches!(op, Operator::SingleQuote | Operator::DoubleQuote) {
            let quote = text.chars().next().unwrap_or('\'');
            let mut body = String::new();
            loop {
                match self.bump() {
                    Some(c) if c == quote => break,
                    Some(c) => body.push(c),
                    None => {
                        return Err(LexError {
                            message: "unterminated quote".to_string(),
                            found: quote,
                            line,
                            col,
                        });
                    }
                }
            }
            return Ok(Some(Token {
                kind: TokenKind::Word,
                text: body,
                line,
                col,
                quote: Some(quote),
            }));
        }

        Ok(Some(Token {
            kind: TokenKind::Op(op),
            text,
            line,
            col,
            quote: None,
        }))
    }
}

/// Split query text into tokens, terminated by an end-of-stream token.
pub fn scan(input: &str) -> Result<Vec<Token>, LexError> {
    let mut scanner = Scanner {
        chars: input.chars().collect(),
        pos: 0,
        line: 1,
        col: 1,
    };
    let mut tokens = Vec::new();
    while let Some(token) = scanner.next_token()? {
        tokens.push(token);
    }
    tokens.push(Token {
        kind: TokenKind::Eos,
        text: String::new(),
        line: scanner.line,
        col: scanner.col,
        quote: None,
    });
    Ok(tokens)
}
