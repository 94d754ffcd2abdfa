//! # Operation parser
//!
//! Lexes and parses the SQL-like operator language into [`Operation`] ASTs.
//! Keywords and function names are case-insensitive, field names are
//! case-sensitive. Comments run from `--` to end of line.

use crate::error::{Result, WeirError};
use crate::expr::{
    Aggregate, BinaryOp, CaseClause, CsvField, EventDuration, EventTime, Expr, ExprKind,
    ExportSpec, FlushHow, ListenProto, Operation, SelectField, StatefulFn, TopClause, TupleRef,
    UnaryOp,
};
use crate::value::{ScalarType, Value};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i128),
    TypedInt(i128, ScalarType),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    Comma,
    Dot,
    Hash,
    Dollar,
    Star,
    Plus,
    Minus,
    Slash,
    DSlash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn err(message: impl Into<String>) -> WeirError {
    WeirError::syntax("", message)
}

/// Cut the input into tokens. `--` starts a comment running to end of line.
fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '-' => {
                chars.next();
                if chars.peek() == Some(&'-') {
                    // comment to end of line
                    for c in chars.by_ref() {
                        if c == '\n' {
                            break;
                        }
                    }
                } else {
                    tokens.push(Token::Minus);
                }
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '#' => {
                chars.next();
                tokens.push(Token::Hash);
            }
            '$' => {
                chars.next();
                tokens.push(Token::Dollar);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    tokens.push(Token::DSlash);
                } else {
                    tokens.push(Token::Slash);
                }
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '<' => {
                chars.next();
                match chars.peek() {
                    Some('=') => {
                        chars.next();
                        tokens.push(Token::Le);
                    }
                    Some('>') => {
                        chars.next();
                        tokens.push(Token::Ne);
                    }
                    _ => tokens.push(Token::Lt),
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => return Err(err("unterminated string literal")),
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some('\\') => s.push('\\'),
                            Some('"') => s.push('"'),
                            Some(c) => {
                                return Err(err(format!("unknown escape '\\{c}' in string")))
                            }
                            None => return Err(err("unterminated string literal")),
                        },
                        Some(c) => s.push(c),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                tokens.push(lex_number(&mut chars)?);
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(s));
            }
            c => return Err(err(format!("unexpected character '{c}'"))),
        }
    }
    Ok(tokens)
}

fn lex_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<Token> {
    let mut digits = String::new();
    let mut is_float = false;
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            digits.push(c);
            chars.next();
        } else if c == '.' {
            // a dot only belongs to the number when a digit follows;
            // `30.foo` must lex as 30, '.', ident
            let mut ahead = chars.clone();
            ahead.next();
            if ahead.peek().is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                digits.push('.');
                chars.next();
            } else {
                break;
            }
        } else if c == 'e' || c == 'E' {
            let mut ahead = chars.clone();
            ahead.next();
            let next = ahead.peek().copied();
            if next.is_some_and(|c| c.is_ascii_digit() || c == '-' || c == '+') {
                is_float = true;
                digits.push('e');
                chars.next();
                if let Some(&s) = chars.peek() {
                    if s == '-' || s == '+' {
                        digits.push(s);
                        chars.next();
                    }
                }
            } else {
                break;
            }
        } else {
            break;
        }
    }
    if is_float {
        let v: f64 = digits
            .parse()
            .map_err(|_| err(format!("bad float literal '{digits}'")))?;
        return Ok(Token::Float(v));
    }
    let v: i128 = digits
        .parse()
        .map_err(|_| err(format!("bad integer literal '{digits}'")))?;
    // optional width suffix: 1i16, 255u8, ...
    if let Some(&c) = chars.peek() {
        if c == 'i' || c == 'u' {
            let mut ahead = chars.clone();
            let mut suffix = String::new();
            suffix.push(c);
            ahead.next();
            while let Some(&d) = ahead.peek() {
                if d.is_ascii_digit() {
                    suffix.push(d);
                    ahead.next();
                } else {
                    break;
                }
            }
            if let Some(t) = ScalarType::parse(&suffix) {
                *chars = ahead;
                return Ok(Token::TypedInt(v, t));
            }
        }
    }
    Ok(Token::Int(v))
}

/// Recursive-descent parser over the token stream.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, t: &Token) -> bool {
        if self.peek() == Some(t) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, t: &Token, what: &str) -> Result<()> {
        if self.eat(t) {
            Ok(())
        } else {
            Err(err(format!("expected {what}")))
        }
    }

    /// Case-insensitive keyword check without consuming.
    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(kw))
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(err(format!("expected '{kw}'")))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            _ => Err(err(format!("expected {what}"))),
        }
    }

    fn expect_usize(&mut self, what: &str) -> Result<usize> {
        match self.next() {
            Some(Token::Int(v)) if v >= 0 => {
                usize::try_from(v).map_err(|_| err(format!("{what} out of range")))
            }
            _ => Err(err(format!("expected {what}"))),
        }
    }

    fn expect_number(&mut self, what: &str) -> Result<f64> {
        match self.next() {
            Some(Token::Int(v)) => Ok(v as f64),
            Some(Token::Float(v)) => Ok(v),
            _ => Err(err(format!("expected {what}"))),
        }
    }

    // ---- operations -------------------------------------------------------

    fn parse_operation(&mut self) -> Result<Operation> {
        if self.eat_keyword("YIELD") {
            return self.parse_yield();
        }
        if self.eat_keyword("READ") {
            return self.parse_read_csv();
        }
        if self.eat_keyword("LISTEN") {
            return self.parse_listen();
        }
        if self.eat_keyword("SELECT") {
            return self.parse_select();
        }
        Err(err("expected YIELD, READ, LISTEN or SELECT"))
    }

    fn parse_yield(&mut self) -> Result<Operation> {
        let (fields, all_others) = self.parse_select_fields()?;
        if all_others {
            return Err(err("YIELD cannot select '*': it has no input"));
        }
        let every = if self.eat_keyword("EVERY") {
            Some(self.expect_number("interval after EVERY")?)
        } else {
            None
        };
        Ok(Operation::Yield { fields, every })
    }

    fn parse_read_csv(&mut self) -> Result<Operation> {
        self.expect_keyword("FROM")?;
        self.expect_keyword("CSV")?;
        let path = match self.next() {
            Some(Token::Str(s)) => s,
            _ => return Err(err("expected CSV file path string")),
        };
        let mut separator = ',';
        let mut has_header = true;
        loop {
            if self.eat_keyword("SEPARATOR") {
                match self.next() {
                    Some(Token::Str(s)) if s.chars().count() == 1 => {
                        separator = s.chars().next().unwrap_or(',');
                    }
                    _ => return Err(err("SEPARATOR wants a one-character string")),
                }
            } else if self.eat_keyword("NO") {
                self.expect_keyword("HEADER")?;
                has_header = false;
            } else {
                break;
            }
        }
        self.expect(&Token::LParen, "'(' opening the CSV schema")?;
        let mut fields = Vec::new();
        loop {
            let name = self.expect_ident("CSV column name")?;
            let tname = self.expect_ident("CSV column type")?;
            let typ = ScalarType::parse(&tname)
                .ok_or_else(|| err(format!("unknown type '{tname}' for column '{name}'")))?;
            let nullable = self.eat_keyword("NULL");
            fields.push(CsvField {
                name,
                typ,
                nullable,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen, "')' closing the CSV schema")?;
        Ok(Operation::ReadCsv {
            fields,
            path,
            separator,
            has_header,
        })
    }

    fn parse_listen(&mut self) -> Result<Operation> {
        self.expect_keyword("FOR")?;
        let proto = self.expect_ident("protocol name")?;
        if proto.eq_ignore_ascii_case("lines") {
            Ok(Operation::Listen {
                proto: ListenProto::Lines,
            })
        } else {
            Err(err(format!("unknown LISTEN protocol '{proto}'")))
        }
    }

    fn parse_select(&mut self) -> Result<Operation> {
        let (fields, all_others) = self.parse_select_fields()?;
        let mut from = Vec::new();
        if self.eat_keyword("FROM") {
            loop {
                let mut name = self.expect_ident("parent node name")?;
                // other-layer parents are named layer/node
                while self.eat(&Token::Slash) || self.eat(&Token::Dot) {
                    let part = self.expect_ident("node name")?;
                    name.push('/');
                    name.push_str(&part);
                }
                from.push(name);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        let where_ = if self.eat_keyword("WHERE") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let mut key = Vec::new();
        if self.eat_keyword("GROUP") {
            self.expect_keyword("BY")?;
            loop {
                key.push(self.parse_expr()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        let top = if self.eat_keyword("TOP") {
            let k = self.expect_usize("k after TOP")?;
            self.expect_keyword("BY")?;
            let by = self.parse_expr()?;
            let when = if self.eat_keyword("WHEN") {
                Some(self.parse_expr()?)
            } else {
                None
            };
            Some(TopClause { k, by, when })
        } else {
            None
        };

        let mut commit_when = Expr::bool_const(true);
        let mut flush_when = None;
        let mut flush_how = FlushHow::Reset;
        if self.eat_keyword("COMMIT") {
            let keep_all = if self.eat_keyword("AND") {
                self.expect_keyword("KEEP")?;
                self.expect_keyword("ALL")?;
                true
            } else {
                false
            };
            self.expect_keyword("WHEN")?;
            commit_when = self.parse_expr()?;
            if keep_all {
                flush_when = Some(Expr::bool_const(false));
            }
        }
        if self.eat_keyword("FLUSH") {
            if self.eat_keyword("SLIDE") {
                flush_how = FlushHow::Slide(self.expect_usize("n after SLIDE")?);
            } else if self.eat_keyword("KEEP") {
                self.expect(&Token::LParen, "'(' after KEEP")?;
                flush_how = FlushHow::KeepOnly(self.parse_expr()?);
                self.expect(&Token::RParen, "')' after KEEP predicate")?;
            } else if self.eat_keyword("REMOVE") {
                self.expect(&Token::LParen, "'(' after REMOVE")?;
                flush_how = FlushHow::RemoveAll(self.parse_expr()?);
                self.expect(&Token::RParen, "')' after REMOVE predicate")?;
            }
            if self.eat_keyword("WHEN") {
                flush_when = Some(self.parse_expr()?);
            }
        }

        let export = if self.eat_keyword("EXPORT") {
            let event_time = if self.eat_keyword("EVENT") {
                self.expect_keyword("STARTING")?;
                self.expect_keyword("AT")?;
                let start_field = self.expect_ident("event start field")?;
                let start_scale = self.parse_scale()?;
                let duration = if self.eat_keyword("WITH") {
                    self.expect_keyword("DURATION")?;
                    EventDuration::Const(self.expect_number("duration")?)
                } else if self.eat_keyword("AND") {
                    self.expect_keyword("STOPPING")?;
                    self.expect_keyword("AT")?;
                    let name = self.expect_ident("event stop field")?;
                    let scale = self.parse_scale()?;
                    EventDuration::StopField { name, scale }
                } else {
                    EventDuration::Const(0.0)
                };
                Some(EventTime {
                    start_field,
                    start_scale,
                    duration,
                })
            } else {
                None
            };
            Some(ExportSpec { event_time })
        } else {
            None
        };

        Ok(Operation::Aggregate(Aggregate {
            fields,
            all_others,
            from,
            where_,
            key,
            top,
            commit_when,
            flush_when,
            flush_how,
            export,
        }))
    }

    fn parse_scale(&mut self) -> Result<f64> {
        if self.eat(&Token::Star) {
            self.expect_number("scale factor")
        } else {
            Ok(1.0)
        }
    }

    fn parse_select_fields(&mut self) -> Result<(Vec<SelectField>, bool)> {
        let mut fields = Vec::new();
        let mut all_others = false;
        loop {
            if self.eat(&Token::Star) {
                if all_others {
                    return Err(err("'*' may appear only once"));
                }
                all_others = true;
            } else {
                let expr = self.parse_expr()?;
                let name = if self.eat_keyword("AS") {
                    self.expect_ident("field name after AS")?
                } else {
                    match &expr.kind {
                        ExprKind::Field(_, n) => n.clone(),
                        _ => {
                            return Err(err(format!(
                                "'{expr}' needs an AS clause to name its output field"
                            )))
                        }
                    }
                };
                fields.push(SelectField { expr, name });
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok((fields, all_others))
    }

    // ---- expressions ------------------------------------------------------
    // precedence: OR < AND < NOT < comparison < additive < multiplicative
    //             < unary minus < primary

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    // AND/OR double as aggregate names; after a complete operand they are
    // always the binary operator, which is what these two loops rely on.

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat_keyword("OR") {
            let rhs = self.parse_and()?;
            lhs = Expr::new(ExprKind::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.eat_keyword("AND") {
            let rhs = self.parse_not()?;
            lhs = Expr::new(ExprKind::Binary(
                BinaryOp::And,
                Box::new(lhs),
                Box::new(rhs),
            ));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat_keyword("NOT") {
            let e = self.parse_not()?;
            return Ok(Expr::new(ExprKind::Unary(UnaryOp::Not, Box::new(e))));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(BinaryOp::Eq),
            Some(Token::Ne) => Some(BinaryOp::Ne),
            Some(Token::Lt) => Some(BinaryOp::Lt),
            Some(Token::Le) => Some(BinaryOp::Le),
            Some(Token::Gt) => Some(BinaryOp::Gt),
            Some(Token::Ge) => Some(BinaryOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let rhs = self.parse_additive()?;
            return Ok(Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs))));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::DSlash) => BinaryOp::IDiv,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Minus) {
            let e = self.parse_unary()?;
            return Ok(Expr::new(ExprKind::Unary(UnaryOp::Neg, Box::new(e))));
        }
        self.parse_primary()
    }

    fn stateful_by_name(name: &str) -> Option<StatefulFn> {
        let f = match name.to_ascii_uppercase().as_str() {
            "MIN" => StatefulFn::Min,
            "MAX" => StatefulFn::Max,
            "SUM" => StatefulFn::Sum,
            "AVG" => StatefulFn::Avg,
            "AND" => StatefulFn::AndAll,
            "OR" => StatefulFn::OrAll,
            "FIRST" => StatefulFn::First,
            "LAST" => StatefulFn::Last,
            "PERCENTILE" => StatefulFn::Percentile,
            "LAG" => StatefulFn::Lag,
            "MOVING_AVG" => StatefulFn::MovingAvg,
            "SMOOTH" => StatefulFn::Smooth,
            "FIT_LIN" => StatefulFn::FitLin,
            "REMEMBER" => StatefulFn::Remember,
            _ => return None,
        };
        Some(f)
    }

    fn unary_fn_by_name(name: &str) -> Option<UnaryOp> {
        let f = match name.to_ascii_uppercase().as_str() {
            "DEFINED" => UnaryOp::Defined,
            "ABS" => UnaryOp::Abs,
            "LENGTH" => UnaryOp::Length,
            "LOWER" => UnaryOp::Lower,
            "UPPER" => UnaryOp::Upper,
            _ => return None,
        };
        Some(f)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Int(v)) => Ok(Expr::int_literal(v)),
            Some(Token::TypedInt(v, t)) => {
                let val = Value::int_of(t, v)
                    .ok_or_else(|| err(format!("literal {v} does not fit {t}")))?;
                Ok(Expr::constant(val))
            }
            Some(Token::Float(v)) => Ok(Expr::constant(Value::Float(v))),
            Some(Token::Str(s)) => Ok(Expr::constant(Value::Str(s))),
            Some(Token::Dollar) => {
                let name = self.expect_ident("parameter name after '$'")?;
                Ok(Expr::new(ExprKind::Param(name)))
            }
            Some(Token::LParen) => {
                let e = self.parse_expr()?;
                self.expect(&Token::RParen, "closing ')'")?;
                Ok(e)
            }
            Some(Token::Ident(name)) => self.parse_ident_expr(name),
            Some(t) => Err(err(format!("unexpected token {t:?} in expression"))),
            None => Err(err("unexpected end of expression")),
        }
    }

    fn parse_ident_expr(&mut self, name: String) -> Result<Expr> {
        let upper = name.to_ascii_uppercase();
        match upper.as_str() {
            "TRUE" => return Ok(Expr::bool_const(true)),
            "FALSE" => return Ok(Expr::bool_const(false)),
            "NULL" => return Ok(Expr::constant(Value::Null(ScalarType::Any))),
            "CASE" => return self.parse_case(),
            "IF" => return self.parse_if(),
            "COALESCE" => {
                self.expect(&Token::LParen, "'(' after COALESCE")?;
                let mut es = Vec::new();
                loop {
                    es.push(self.parse_expr()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RParen, "')' after COALESCE")?;
                return Ok(Expr::new(ExprKind::Coalesce(es)));
            }
            "SPLIT" => {
                self.expect(&Token::LParen, "'(' after SPLIT")?;
                let sep = self.parse_expr()?;
                self.expect(&Token::Comma, "',' between SPLIT arguments")?;
                let e = self.parse_expr()?;
                self.expect(&Token::RParen, "')' after SPLIT")?;
                return Ok(Expr::new(ExprKind::Split(Box::new(sep), Box::new(e))));
            }
            _ => {}
        }

        if let Some(func) = Self::stateful_by_name(&name) {
            return self.parse_stateful(func);
        }
        if let Some(op) = Self::unary_fn_by_name(&name) {
            self.expect(&Token::LParen, "'(' after function name")?;
            let e = self.parse_expr()?;
            self.expect(&Token::RParen, "closing ')'")?;
            return Ok(Expr::new(ExprKind::Unary(op, Box::new(e))));
        }

        // tuple-qualified or unqualified field reference
        match upper.as_str() {
            "IN" | "OUT" | "PREVIOUS" | "GROUP" if self.peek() == Some(&Token::Dot) => {
                self.pos += 1;
                let tuple = match upper.as_str() {
                    "IN" => TupleRef::In,
                    "OUT" => TupleRef::Out,
                    "PREVIOUS" => TupleRef::Previous,
                    _ => TupleRef::Group,
                };
                if tuple == TupleRef::Group {
                    if self.eat_keyword("first") {
                        self.expect(&Token::Dot, "'.' after group.first")?;
                        let f = self.parse_field_name()?;
                        return Ok(Expr::field(TupleRef::GroupFirst, f));
                    }
                    if self.eat_keyword("last") {
                        self.expect(&Token::Dot, "'.' after group.last")?;
                        let f = self.parse_field_name()?;
                        return Ok(Expr::field(TupleRef::GroupLast, f));
                    }
                }
                let f = self.parse_field_name()?;
                Ok(Expr::field(tuple, f))
            }
            _ => Ok(Expr::field(TupleRef::Unqualified, name)),
        }
    }

    /// A field name: plain identifier, or a `#`-prefixed virtual like `#count`.
    fn parse_field_name(&mut self) -> Result<String> {
        if self.eat(&Token::Hash) {
            let n = self.expect_ident("virtual field name after '#'")?;
            Ok(format!("#{n}"))
        } else {
            self.expect_ident("field name")
        }
    }

    fn parse_stateful(&mut self, func: StatefulFn) -> Result<Expr> {
        let args = if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let mut args = Vec::new();
            loop {
                args.push(self.parse_expr()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen, "closing ')'")?;
            // `SUM(x)` is SUM applied to a parenthesized expression
            args
        } else {
            // prefix form binds tightly: `SUM 1 > 500` is `(SUM 1) > 500`
            vec![self.parse_unary()?]
        };
        if args.len() != func.arity() {
            return Err(err(format!(
                "{} takes {} argument(s), got {}",
                func.name(),
                func.arity(),
                args.len()
            )));
        }
        Ok(Expr::new(ExprKind::Stateful(func, args)))
    }

    fn parse_case(&mut self) -> Result<Expr> {
        let mut clauses = Vec::new();
        while self.eat_keyword("WHEN") {
            let cond = self.parse_expr()?;
            self.expect_keyword("THEN")?;
            let then = self.parse_expr()?;
            clauses.push(CaseClause { cond, then });
        }
        if clauses.is_empty() {
            return Err(err("CASE needs at least one WHEN clause"));
        }
        let else_ = if self.eat_keyword("ELSE") {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        self.expect_keyword("END")?;
        Ok(Expr::new(ExprKind::Case { clauses, else_ }))
    }

    /// `IF c THEN v [ELSE e]` sugar for a single-clause CASE.
    fn parse_if(&mut self) -> Result<Expr> {
        let cond = self.parse_expr()?;
        self.expect_keyword("THEN")?;
        let then = self.parse_expr()?;
        let else_ = if self.eat_keyword("ELSE") {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        Ok(Expr::new(ExprKind::Case {
            clauses: vec![CaseClause { cond, then }],
            else_,
        }))
    }
}

/// Parse one operation definition.
pub fn parse_operation(source: &str) -> Result<Operation> {
    let tokens = tokenize(source)?;
    let mut p = Parser { tokens, pos: 0 };
    let op = p.parse_operation()?;
    if let Some(t) = p.peek() {
        return Err(err(format!("trailing input at {t:?}")));
    }
    Ok(op)
}

/// Parse a standalone expression (used by tests and parameter binding).
pub fn parse_expr(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    let mut p = Parser { tokens, pos: 0 };
    let e = p.parse_expr()?;
    if let Some(t) = p.peek() {
        return Err(err(format!("trailing input at {t:?}")));
    }
    Ok(e)
}
