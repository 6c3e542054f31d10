//! Lexer and parser of the harness guest language.
//!
//! ```text
//! fn main() {
//!     x = 1
//!     while x < 3 {
//!         x = add(x, 1)
//!     }
//!     try {
//!         throw "boom"
//!     } catch e {
//!         print e
//!     }
//!     debugger
//!     return x
//! }
//! internal fn add(a, b) {
//!     return a + b
//! }
//! ```
//!
//! Every statement, expression and function body is an instrumentable node.

use indexmap::IndexMap;
use smol_str::SmolStr;
use thiserror::Error;

use crate::host::{EventContext, NodeId};
use crate::source::{LoadedSource, SourceSection, Tags};
use crate::value::Value;

/// Language id reported by harness nodes.
pub const LANGUAGE: &str = "arb";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{uri}:{line}:{column}: {message}")]
pub struct ParseError {
    pub uri: SmolStr,
    pub line: u32,
    pub column: u32,
    pub message: SmolStr,
}

/// Instrumentation identity of a syntax node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: NodeId,
    pub tags: Tags,
    pub section: SourceSection,
    pub internal: bool,
}

impl EventContext for NodeInfo {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn tags(&self) -> Tags {
        self.tags
    }

    fn source_section(&self) -> Option<&SourceSection> {
        Some(&self.section)
    }

    fn is_internal(&self) -> bool {
        self.internal
    }

    fn language(&self) -> Option<&str> {
        Some(LANGUAGE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug)]
pub struct Expr {
    pub info: NodeInfo,
    pub kind: ExprKind,
}

#[derive(Debug)]
pub enum ExprKind {
    Literal(Value),
    Var(SmolStr),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(SmolStr, Vec<Expr>),
}

#[derive(Debug)]
pub struct Stmt {
    pub info: NodeInfo,
    pub kind: StmtKind,
}

#[derive(Debug)]
pub enum StmtKind {
    Assign(SmolStr, Expr),
    Expr(Expr),
    While(Expr, Vec<Stmt>),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    Return(Option<Expr>),
    Throw(Expr),
    Try {
        body: Vec<Stmt>,
        binding: SmolStr,
        handler: Vec<Stmt>,
    },
    Debugger,
    Print(Expr),
}

#[derive(Debug)]
pub struct Function {
    pub name: SmolStr,
    pub params: Vec<SmolStr>,
    pub body: Vec<Stmt>,
    pub root: NodeInfo,
}

/// A parsed source.
#[derive(Debug)]
pub struct Program {
    pub uri: SmolStr,
    pub functions: IndexMap<SmolStr, Function>,
    pub source: LoadedSource,
}

impl Program {
    pub fn parse(uri: &str, text: &str) -> Result<Self, ParseError> {
        Self::parse_with_ids(uri, text, 1)
    }

    /// Parse with node ids starting at `first_id`, for hosts loading several
    /// sources.
    pub fn parse_with_ids(uri: &str, text: &str, first_id: u64) -> Result<Self, ParseError> {
        let tokens = lex(uri, text)?;
        let mut parser = Parser {
            uri: uri.into(),
            tokens,
            pos: 0,
            next_id: first_id,
            internal: false,
            source: LoadedSource::new(uri),
        };
        let functions = parser.program()?;
        Ok(Self {
            uri: uri.into(),
            functions,
            source: parser.source,
        })
    }

    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    /// Highest node id used by this program.
    #[must_use]
    pub fn last_node_id(&self) -> u64 {
        self.functions
            .values()
            .map(|function| function.root.id.0)
            .max()
            .unwrap_or(0)
    }
}

/// Parse a standalone expression, as typed into a debugger console.
pub fn parse_expression(text: &str) -> Result<Expr, ParseError> {
    const URI: &str = "<eval>";
    let mut parser = Parser {
        uri: URI.into(),
        tokens: lex(URI, text)?,
        pos: 0,
        next_id: 0,
        internal: false,
        source: LoadedSource::new(URI),
    };
    parser.skip_newlines();
    let expression = parser.expression()?;
    parser.skip_newlines();
    if parser.peek().kind != TokenKind::Eof {
        return parser.error("unexpected input after expression");
    }
    Ok(expression)
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(SmolStr),
    Int(i64),
    Str(SmolStr),
    Sym(&'static str),
    Newline,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: u32,
    column: u32,
    end_column: u32,
}

const SYMBOLS: [&str; 20] = [
    "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "<", ">", "=", "!", "(", ")",
    "{", "}", ",",
];

fn lex(uri: &str, text: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut last_line = 1;
    for (index, line) in text.lines().enumerate() {
        let line_number = index as u32 + 1;
        last_line = line_number;
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            let column = i as u32 + 1;
            if c.is_whitespace() {
                i += 1;
                continue;
            }
            if c == '#' {
                break;
            }
            let start = i;
            let kind = if c.is_ascii_digit() {
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let digits: String = chars[start..i].iter().collect();
                let value = digits.parse().map_err(|_| ParseError {
                    uri: uri.into(),
                    line: line_number,
                    column,
                    message: "integer out of range".into(),
                })?;
                TokenKind::Int(value)
            } else if c.is_alphabetic() || c == '_' {
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                TokenKind::Ident(chars[start..i].iter().collect::<String>().into())
            } else if c == '"' {
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    i += 1;
                }
                if i == chars.len() {
                    return Err(ParseError {
                        uri: uri.into(),
                        line: line_number,
                        column,
                        message: "unterminated string".into(),
                    });
                }
                i += 1;
                TokenKind::Str(chars[start + 1..i - 1].iter().collect::<String>().into())
            } else {
                let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let Some(symbol) = SYMBOLS.iter().find(|symbol| rest.starts_with(*symbol)) else {
                    return Err(ParseError {
                        uri: uri.into(),
                        line: line_number,
                        column,
                        message: format!("unexpected character '{c}'").into(),
                    });
                };
                i += symbol.len();
                TokenKind::Sym(*symbol)
            };
            tokens.push(Token {
                kind,
                line: line_number,
                column,
                end_column: i as u32,
            });
        }
        tokens.push(Token {
            kind: TokenKind::Newline,
            line: line_number,
            column: chars.len() as u32 + 1,
            end_column: chars.len() as u32 + 1,
        });
    }
    tokens.push(Token {
        kind: TokenKind::Eof,
        line: last_line + 1,
        column: 1,
        end_column: 1,
    });
    Ok(tokens)
}

struct Parser {
    uri: SmolStr,
    tokens: Vec<Token>,
    pos: usize,
    next_id: u64,
    internal: bool,
    source: LoadedSource,
}

type Parsed<T> = Result<T, ParseError>;

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos.saturating_sub(1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error<T>(&self, message: impl Into<SmolStr>) -> Parsed<T> {
        let token = self.peek();
        Err(ParseError {
            uri: self.uri.clone(),
            line: token.line,
            column: token.column,
            message: message.into(),
        })
    }

    fn at_symbol(&self, symbol: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Sym(found) if *found == symbol)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Ident(found) if found == keyword)
    }

    fn expect_symbol(&mut self, symbol: &str) -> Parsed<Token> {
        if self.at_symbol(symbol) {
            Ok(self.advance())
        } else {
            self.error(format!("expected '{symbol}'"))
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Parsed<Token> {
        if self.at_keyword(keyword) {
            Ok(self.advance())
        } else {
            self.error(format!("expected '{keyword}'"))
        }
    }

    fn expect_ident(&mut self) -> Parsed<SmolStr> {
        match self.peek().kind.clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => self.error("expected identifier"),
        }
    }

    fn expect_newline(&mut self) -> Parsed<()> {
        match self.peek().kind {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::Eof => Ok(()),
            _ => self.error("expected end of line"),
        }
    }

    fn skip_newlines(&mut self) {
        while self.peek().kind == TokenKind::Newline {
            self.advance();
        }
    }

    fn node(&mut self, tags: Tags, start: &Token, end: &Token) -> NodeInfo {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let section = SourceSection::new(
            self.uri.clone(),
            start.line,
            start.column,
            end.line,
            end.end_column,
        );
        self.source.sections.push((section.clone(), tags));
        NodeInfo {
            id,
            tags,
            section,
            internal: self.internal,
        }
    }

    fn program(&mut self) -> Parsed<IndexMap<SmolStr, Function>> {
        let mut functions = IndexMap::new();
        self.skip_newlines();
        while self.peek().kind != TokenKind::Eof {
            let function = self.function()?;
            if functions.contains_key(&function.name) {
                return self.error(format!("function '{}' defined twice", function.name));
            }
            functions.insert(function.name.clone(), function);
            self.skip_newlines();
        }
        Ok(functions)
    }

    fn function(&mut self) -> Parsed<Function> {
        let start = self.peek().clone();
        self.internal = self.at_keyword("internal");
        if self.internal {
            self.advance();
        }
        self.expect_keyword("fn")?;
        let name = self.expect_ident()?;
        self.expect_symbol("(")?;
        let mut params = Vec::new();
        if !self.at_symbol(")") {
            loop {
                params.push(self.expect_ident()?);
                if !self.at_symbol(",") {
                    break;
                }
                self.advance();
            }
        }
        self.expect_symbol(")")?;
        let body = self.block()?;
        let end = self.previous().clone();
        let root = self.node(Tags::ROOT, &start, &end);
        self.expect_newline()?;
        self.internal = false;
        Ok(Function {
            name,
            params,
            body,
            root,
        })
    }

    /// `{` NEWLINE statements `}`; leaves the closing brace consumed.
    fn block(&mut self) -> Parsed<Vec<Stmt>> {
        self.expect_symbol("{")?;
        self.expect_newline()?;
        let mut statements = Vec::new();
        loop {
            self.skip_newlines();
            if self.at_symbol("}") {
                self.advance();
                return Ok(statements);
            }
            if self.peek().kind == TokenKind::Eof {
                return self.error("unclosed block");
            }
            statements.push(self.statement()?);
        }
    }

    fn statement(&mut self) -> Parsed<Stmt> {
        let start = self.peek().clone();
        let mut tags = Tags::STATEMENT;
        let kind = match &start.kind {
            TokenKind::Ident(keyword) if keyword == "while" => {
                self.advance();
                let condition = self.expression()?;
                StmtKind::While(condition, self.block()?)
            }
            TokenKind::Ident(keyword) if keyword == "if" => {
                self.advance();
                let condition = self.expression()?;
                let then = self.block()?;
                let otherwise = if self.at_keyword("else") {
                    self.advance();
                    self.block()?
                } else {
                    Vec::new()
                };
                StmtKind::If(condition, then, otherwise)
            }
            TokenKind::Ident(keyword) if keyword == "try" => {
                self.advance();
                tags |= Tags::TRY_BLOCK;
                let body = self.block()?;
                self.expect_keyword("catch")?;
                let binding = self.expect_ident()?;
                let handler = self.block()?;
                StmtKind::Try {
                    body,
                    binding,
                    handler,
                }
            }
            TokenKind::Ident(keyword) if keyword == "return" => {
                self.advance();
                if matches!(self.peek().kind, TokenKind::Newline | TokenKind::Eof) {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.expression()?))
                }
            }
            TokenKind::Ident(keyword) if keyword == "throw" => {
                self.advance();
                StmtKind::Throw(self.expression()?)
            }
            TokenKind::Ident(keyword) if keyword == "print" => {
                self.advance();
                StmtKind::Print(self.expression()?)
            }
            TokenKind::Ident(keyword) if keyword == "debugger" => {
                self.advance();
                tags |= Tags::ALWAYS_HALT;
                StmtKind::Debugger
            }
            TokenKind::Ident(name)
                if matches!(
                    self.tokens.get(self.pos + 1).map(|token| &token.kind),
                    Some(TokenKind::Sym("="))
                ) =>
            {
                let name = name.clone();
                self.advance();
                self.advance();
                StmtKind::Assign(name, self.expression()?)
            }
            _ => StmtKind::Expr(self.expression()?),
        };
        let end = self.previous().clone();
        let info = self.node(tags, &start, &end);
        self.expect_newline()?;
        Ok(Stmt { info, kind })
    }

    fn expression(&mut self) -> Parsed<Expr> {
        self.binary(0)
    }

    fn binary(&mut self, level: usize) -> Parsed<Expr> {
        const LEVELS: [&[(&str, BinaryOp)]; 6] = [
            &[("||", BinaryOp::Or)],
            &[("&&", BinaryOp::And)],
            &[("==", BinaryOp::Eq), ("!=", BinaryOp::Ne)],
            &[
                ("<", BinaryOp::Lt),
                ("<=", BinaryOp::Le),
                (">", BinaryOp::Gt),
                (">=", BinaryOp::Ge),
            ],
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Rem)],
        ];
        if level == LEVELS.len() {
            return self.unary();
        }
        let start = self.peek().clone();
        let mut left = self.binary(level + 1)?;
        loop {
            let Some(op) = LEVELS[level].iter().find_map(|(symbol, op)| {
                self.at_symbol(symbol).then_some(*op)
            }) else {
                return Ok(left);
            };
            self.advance();
            let right = self.binary(level + 1)?;
            let end = self.previous().clone();
            let info = self.node(Tags::EXPRESSION, &start, &end);
            left = Expr {
                info,
                kind: ExprKind::Binary(op, Box::new(left), Box::new(right)),
            };
        }
    }

    fn unary(&mut self) -> Parsed<Expr> {
        let start = self.peek().clone();
        let op = if self.at_symbol("-") {
            UnaryOp::Neg
        } else if self.at_symbol("!") {
            UnaryOp::Not
        } else {
            return self.primary();
        };
        self.advance();
        let operand = self.unary()?;
        let end = self.previous().clone();
        let info = self.node(Tags::EXPRESSION, &start, &end);
        Ok(Expr {
            info,
            kind: ExprKind::Unary(op, Box::new(operand)),
        })
    }

    fn primary(&mut self) -> Parsed<Expr> {
        let start = self.peek().clone();
        let mut tags = Tags::EXPRESSION;
        let kind = match start.kind.clone() {
            TokenKind::Int(value) => {
                self.advance();
                ExprKind::Literal(Value::Int(value))
            }
            TokenKind::Str(value) => {
                self.advance();
                ExprKind::Literal(Value::String(value))
            }
            TokenKind::Sym("(") => {
                self.advance();
                let inner = self.expression()?;
                self.expect_symbol(")")?;
                return Ok(inner);
            }
            TokenKind::Ident(name) => {
                self.advance();
                match name.as_str() {
                    "true" => ExprKind::Literal(Value::Bool(true)),
                    "false" => ExprKind::Literal(Value::Bool(false)),
                    "null" => ExprKind::Literal(Value::Null),
                    _ if self.at_symbol("(") => {
                        self.advance();
                        let mut args = Vec::new();
                        if !self.at_symbol(")") {
                            loop {
                                args.push(self.expression()?);
                                if !self.at_symbol(",") {
                                    break;
                                }
                                self.advance();
                            }
                        }
                        self.expect_symbol(")")?;
                        tags |= Tags::CALL;
                        ExprKind::Call(name, args)
                    }
                    _ => ExprKind::Var(name),
                }
            }
            _ => return self.error("expected expression"),
        };
        let end = self.previous().clone();
        let info = self.node(tags, &start, &end);
        Ok(Expr { info, kind })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "\
fn main() {
    x = 1
    while x < 3 {
        x = add(x, 1)
    }
    debugger
    return x
}
internal fn add(a, b) {
    return a + b
}
";

    #[test]
    fn parses_functions_and_tags_nodes() {
        let program = Program::parse("main.arb", SOURCE).unwrap();
        assert_eq!(program.functions.len(), 2);
        let main = program.function("main").unwrap();
        assert_eq!(main.root.section.start_line, 1);
        assert_eq!(main.root.section.end_line, 8);
        assert_eq!(main.body.len(), 4);
        assert!(main.body[2].info.tags.contains(Tags::ALWAYS_HALT));
        let add = program.function("add").unwrap();
        assert!(add.root.internal);
        assert_eq!(add.params, ["a", "b"]);
    }

    #[test]
    fn statement_sections_span_their_block() {
        let program = Program::parse("main.arb", SOURCE).unwrap();
        let main = program.function("main").unwrap();
        let section = &main.body[1].info.section;
        assert_eq!((section.start_line, section.start_column), (3, 5));
        assert_eq!(section.end_line, 5);
        let StmtKind::While(_, body) = &main.body[1].kind else {
            panic!("expected while");
        };
        let StmtKind::Assign(_, call) = &body[0].kind else {
            panic!("expected assignment");
        };
        assert!(call.info.tags.contains(Tags::CALL | Tags::EXPRESSION));
        assert_eq!(call.info.section.start_column, 13);
    }

    #[test]
    fn reports_position_of_errors() {
        let err = Program::parse("bad.arb", "fn main() {\n    x = (1\n}\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.to_string(), "bad.arb:2:11: expected ')'");
    }
}
