//! In-process destination that interprets the ClickHouse dialect this service
//! emits: `TRUNCATE TABLE`, `ALTER TABLE … UPDATE … WHERE`, `ALTER TABLE …
//! DELETE WHERE` and `SELECT * FROM`. Like the real destination it has no
//! uniqueness constraint, so repeated inserts duplicate rows.

use std::collections::{HashMap, HashSet};
use std::iter::Peekable;
use std::str::Chars;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Number, Value};

use super::clickhouse::render_insert;
use super::{DestinationStore, ResultSet, Summary};
use crate::error::{Result, SinkError};

type Row = Map<String, Value>;

#[derive(Debug, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, Table>,
    rejected: HashSet<String>,
    statements: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, name: &str, columns: &[&str]) -> Self {
        self.create_table(name, columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn create_table(&self, name: &str, columns: Vec<String>) {
        self.lock().tables.insert(
            name.to_string(),
            Table {
                columns,
                rows: Vec::new(),
            },
        );
    }

    /// Make every later write to `table` fail, as a destination outage would.
    pub fn reject_writes_to(&self, table: &str) {
        self.lock().rejected.insert(table.to_string());
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Every statement received, inserts rendered as `INSERT … VALUES`.
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn writable(&mut self, table: &str) -> Result<&mut Table> {
        if self.rejected.contains(table) {
            return Err(SinkError::ClickHouse(format!(
                "writes to {} are rejected",
                table
            )));
        }
        self.tables
            .get_mut(table)
            .ok_or_else(|| SinkError::ClickHouse(format!("Table {} doesn't exist", table)))
    }
}

#[async_trait]
impl DestinationStore for MemoryStore {
    async fn execute(&self, statement: &str) -> Result<Summary> {
        let parsed = Parser::new(statement)?.statement()?;

        let mut inner = self.lock();
        inner.statements.push(statement.to_string());

        match parsed {
            Statement::Truncate { table } => {
                inner.writable(&table)?.rows.clear();
            }
            Statement::Update {
                table,
                assignments,
                conditions,
            } => {
                let target = inner.writable(&table)?;
                check_columns(target, assignments.iter().map(|(c, _)| c.as_str()))?;
                check_columns(target, conditions.iter().map(Condition::column))?;

                for row in target.rows.iter_mut() {
                    if conditions.iter().all(|c| c.matches(row)) {
                        for (column, value) in &assignments {
                            row.insert(column.clone(), value.clone());
                        }
                    }
                }
            }
            Statement::Delete { table, conditions } => {
                let target = inner.writable(&table)?;
                check_columns(target, conditions.iter().map(Condition::column))?;
                target
                    .rows
                    .retain(|row| !conditions.iter().all(|c| c.matches(row)));
            }
            Statement::Select { .. } => {
                return Err(SinkError::ClickHouse(
                    "SELECT must go through query()".to_string(),
                ));
            }
        }

        Ok(Summary::default())
    }

    async fn insert(
        &self,
        table: &str,
        rows: &[Vec<Value>],
        columns: &[String],
    ) -> Result<Summary> {
        let mut inner = self.lock();
        inner.statements.push(render_insert(table, rows, columns));

        let target = inner.writable(table)?;
        check_columns(target, columns.iter().map(String::as_str))?;

        for values in rows {
            if values.len() != columns.len() {
                return Err(SinkError::ClickHouse(format!(
                    "row has {} values for {} columns",
                    values.len(),
                    columns.len()
                )));
            }
            let mut row = Row::new();
            for column in &target.columns {
                let value = columns
                    .iter()
                    .position(|c| c == column)
                    .map(|i| values[i].clone())
                    .unwrap_or(Value::Null);
                row.insert(column.clone(), value);
            }
            target.rows.push(row);
        }

        Ok(Summary {
            written_rows: rows.len() as u64,
        })
    }

    async fn query(&self, statement: &str) -> Result<ResultSet> {
        match Parser::new(statement)?.statement()? {
            Statement::Select { table } => {
                let inner = self.lock();
                let table = inner
                    .tables
                    .get(&table)
                    .ok_or_else(|| SinkError::ClickHouse(format!("Table {} doesn't exist", table)))?;
                Ok(ResultSet {
                    rows: table.rows.clone(),
                })
            }
            _ => Err(SinkError::ClickHouse(format!(
                "not a query: {}",
                statement
            ))),
        }
    }
}

fn check_columns<'a>(table: &Table, mut columns: impl Iterator<Item = &'a str>) -> Result<()> {
    match columns.find(|c| !table.columns.iter().any(|t| t.as_str() == *c)) {
        Some(missing) => Err(SinkError::ClickHouse(format!(
            "Missing columns: '{}'",
            missing
        ))),
        None => Ok(()),
    }
}

#[derive(Debug, PartialEq)]
enum Statement {
    Truncate {
        table: String,
    },
    Update {
        table: String,
        assignments: Vec<(String, Value)>,
        conditions: Vec<Condition>,
    },
    Delete {
        table: String,
        conditions: Vec<Condition>,
    },
    Select {
        table: String,
    },
}

#[derive(Debug, PartialEq)]
enum Condition {
    Eq(String, Value),
    IsNull(String),
}

impl Condition {
    fn column(&self) -> &str {
        match self {
            Condition::Eq(column, _) | Condition::IsNull(column) => column,
        }
    }

    fn matches(&self, row: &Row) -> bool {
        match self {
            Condition::Eq(column, value) => row.get(column) == Some(value),
            Condition::IsNull(column) => row.get(column).map_or(true, Value::is_null),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Backquoted identifier
    Ident(String),
    /// Keyword, number or other bare text
    Word(String),
    /// Single-quoted string
    Str(String),
    Eq,
    Comma,
    Dot,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(sql: &str) -> Result<Self> {
        Ok(Self {
            tokens: tokenize(sql)?,
            pos: 0,
        })
    }

    fn statement(mut self) -> Result<Statement> {
        let statement = match self.word()?.to_ascii_uppercase().as_str() {
            "TRUNCATE" => {
                self.keyword("TABLE")?;
                Statement::Truncate {
                    table: self.table()?,
                }
            }
            "ALTER" => {
                self.keyword("TABLE")?;
                let table = self.table()?;
                match self.word()?.to_ascii_uppercase().as_str() {
                    "UPDATE" => {
                        let mut assignments = vec![self.assignment()?];
                        while self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                            assignments.push(self.assignment()?);
                        }
                        self.keyword("WHERE")?;
                        Statement::Update {
                            table,
                            assignments,
                            conditions: self.conditions()?,
                        }
                    }
                    "DELETE" => {
                        self.keyword("WHERE")?;
                        Statement::Delete {
                            table,
                            conditions: self.conditions()?,
                        }
                    }
                    other => return Err(unsupported(other)),
                }
            }
            "SELECT" => {
                self.keyword("*")?;
                self.keyword("FROM")?;
                Statement::Select {
                    table: self.table()?,
                }
            }
            other => return Err(unsupported(other)),
        };

        match self.peek() {
            None => Ok(statement),
            Some(token) => Err(SinkError::ClickHouse(format!(
                "Syntax error: unexpected {:?}",
                token
            ))),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| SinkError::ClickHouse("Syntax error: unexpected end".to_string()))?;
        self.pos += 1;
        Ok(token)
    }

    fn word(&mut self) -> Result<String> {
        match self.next()? {
            Token::Word(w) => Ok(w),
            other => Err(SinkError::ClickHouse(format!(
                "Syntax error: expected keyword, got {:?}",
                other
            ))),
        }
    }

    fn keyword(&mut self, expected: &str) -> Result<()> {
        let word = self.word()?;
        if word.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(SinkError::ClickHouse(format!(
                "Syntax error: expected {}, got {}",
                expected, word
            )))
        }
    }

    fn identifier(&mut self) -> Result<String> {
        match self.next()? {
            Token::Ident(name) | Token::Word(name) => Ok(name),
            other => Err(SinkError::ClickHouse(format!(
                "Syntax error: expected identifier, got {:?}",
                other
            ))),
        }
    }

    fn table(&mut self) -> Result<String> {
        let mut name = self.identifier()?;
        while self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            name.push('.');
            name.push_str(&self.identifier()?);
        }
        Ok(name)
    }

    fn assignment(&mut self) -> Result<(String, Value)> {
        let column = self.identifier()?;
        if self.next()? != Token::Eq {
            return Err(SinkError::ClickHouse(
                "Syntax error: expected '=' in assignment".to_string(),
            ));
        }
        Ok((column, self.value()?))
    }

    fn conditions(&mut self) -> Result<Vec<Condition>> {
        let mut conditions = vec![self.condition()?];
        while matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case("AND")) {
            self.pos += 1;
            conditions.push(self.condition()?);
        }
        Ok(conditions)
    }

    fn condition(&mut self) -> Result<Condition> {
        let column = self.identifier()?;
        match self.next()? {
            Token::Eq => Ok(Condition::Eq(column, self.value()?)),
            Token::Word(w) if w.eq_ignore_ascii_case("IS") => {
                self.keyword("NULL")?;
                Ok(Condition::IsNull(column))
            }
            other => Err(SinkError::ClickHouse(format!(
                "Syntax error: expected comparison, got {:?}",
                other
            ))),
        }
    }

    fn value(&mut self) -> Result<Value> {
        match self.next()? {
            Token::Str(s) => Ok(Value::String(s)),
            Token::Word(w) if w.eq_ignore_ascii_case("NULL") => Ok(Value::Null),
            Token::Word(w) if w == "true" => Ok(Value::Bool(true)),
            Token::Word(w) if w == "false" => Ok(Value::Bool(false)),
            Token::Word(w) => parse_number(&w).ok_or_else(|| {
                SinkError::ClickHouse(format!("Syntax error: bad literal {}", w))
            }),
            other => Err(SinkError::ClickHouse(format!(
                "Syntax error: expected literal, got {:?}",
                other
            ))),
        }
    }
}

fn unsupported(word: &str) -> SinkError {
    SinkError::ClickHouse(format!("Unsupported statement starting at {}", word))
}

fn parse_number(word: &str) -> Option<Value> {
    if let Ok(n) = word.parse::<u64>() {
        return Some(Value::from(n));
    }
    if let Ok(n) = word.parse::<i64>() {
        return Some(Value::from(n));
    }
    word.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '`' => {
                chars.next();
                tokens.push(Token::Ident(quoted(&mut chars, '`')?));
            }
            '\'' => {
                chars.next();
                tokens.push(Token::Str(quoted(&mut chars, '\'')?));
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '=' | ',' | '`' | '\'') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }

    Ok(tokens)
}

/// Read up to the closing `quote`, decoding backslash escapes.
fn quoted(chars: &mut Peekable<Chars<'_>>, quote: char) -> Result<String> {
    let mut out = String::new();
    loop {
        match chars.next() {
            None => {
                return Err(SinkError::ClickHouse(
                    "Syntax error: unterminated quoted text".to_string(),
                ))
            }
            Some(c) if c == quote => return Ok(out),
            Some('\\') => match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('0') => out.push('\0'),
                Some('x') => {
                    let hex: String = chars.by_ref().take(2).collect();
                    let code = u8::from_str_radix(&hex, 16).map_err(|_| {
                        SinkError::ClickHouse(format!("Syntax error: bad escape \\x{}", hex))
                    })?;
                    out.push(char::from(code));
                }
                Some(other) => out.push(other),
                None => {
                    return Err(SinkError::ClickHouse(
                        "Syntax error: dangling escape".to_string(),
                    ))
                }
            },
            Some(c) => out.push(c),
        }
    }
}
