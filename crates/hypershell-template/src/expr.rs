//! A small sandboxed expression evaluator for the `{= EXPR =}` template
//! form. Supports integer arithmetic, string concatenation/comparison, and
//! indexing/slicing on the single free variable `x` (the task argument).
//! Deliberately has no variable assignment, no I/O, and no way to invoke a
//! process — per spec section 9, this is a real re-implementation, not a
//! binding to the host language's `eval`.

use crate::error::TemplateError;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl Value {
    fn as_str(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Str(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
        }
    }

    fn as_int(&self) -> Result<i64, TemplateError> {
        match self {
            Value::Int(n) => Ok(*n),
            Value::Str(s) => s
                .parse()
                .map_err(|_| TemplateError::ExpressionError(format!("cannot coerce {s:?} to int"))),
            Value::Bool(b) => Ok(*b as i64),
        }
    }
}

/// Evaluate `expr` with `x` bound to `arg`, returning its string rendering.
pub fn eval(expr: &str, arg: &str) -> Result<String, TemplateError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(TemplateError::ExpressionError(format!(
            "trailing tokens after expression: {:?}",
            &parser.tokens[parser.pos..]
        )));
    }
    let value = eval_node(&ast, arg)?;
    Ok(value.as_str())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Str(String),
    Ident(String),
    Op(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
}

fn tokenize(input: &str) -> Result<Vec<Token>, TemplateError> {
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let n: i64 = chars[start..i]
                .iter()
                .collect::<String>()
                .parse()
                .map_err(|_| TemplateError::ExpressionError("bad integer literal".into()))?;
            tokens.push(Token::Int(n));
        } else if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let start = i;
            while i < chars.len() && chars[i] != quote {
                i += 1;
            }
            if i >= chars.len() {
                return Err(TemplateError::ExpressionError("unterminated string literal".into()));
            }
            tokens.push(Token::Str(chars[start..i].iter().collect()));
            i += 1;
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            match c {
                '(' => {
                    tokens.push(Token::LParen);
                    i += 1;
                }
                ')' => {
                    tokens.push(Token::RParen);
                    i += 1;
                }
                '[' => {
                    tokens.push(Token::LBracket);
                    i += 1;
                }
                ']' => {
                    tokens.push(Token::RBracket);
                    i += 1;
                }
                ',' => {
                    tokens.push(Token::Comma);
                    i += 1;
                }
                ':' => {
                    tokens.push(Token::Colon);
                    i += 1;
                }
                '+' | '-' | '*' | '/' | '%' => {
                    tokens.push(Token::Op(c.to_string()));
                    i += 1;
                }
                '=' | '!' | '<' | '>' => {
                    let mut op = c.to_string();
                    if i + 1 < chars.len() && chars[i + 1] == '=' {
                        op.push('=');
                        i += 2;
                    } else {
                        i += 1;
                    }
                    tokens.push(Token::Op(op));
                }
                other => {
                    return Err(TemplateError::ExpressionError(format!(
                        "unexpected character '{other}'"
                    )))
                }
            }
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Node {
    IntLit(i64),
    StrLit(String),
    Var,
    Call(String, Vec<Node>),
    Index(Box<Node>, Box<Node>),
    Slice(Box<Node>, Option<Box<Node>>, Option<Box<Node>>),
    BinOp(String, Box<Node>, Box<Node>),
    Neg(Box<Node>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect_op(&mut self, ops: &[&str]) -> Option<String> {
        if let Some(Token::Op(o)) = self.peek() {
            if ops.contains(&o.as_str()) {
                let o = o.clone();
                self.pos += 1;
                return Some(o);
            }
        }
        None
    }

    fn parse_expr(&mut self) -> Result<Node, TemplateError> {
        self.parse_equality()
    }

    fn parse_equality(&mut self) -> Result<Node, TemplateError> {
        let mut lhs = self.parse_comparison()?;
        while let Some(op) = self.expect_op(&["==", "!="]) {
            let rhs = self.parse_comparison()?;
            lhs = Node::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Node, TemplateError> {
        let mut lhs = self.parse_term()?;
        while let Some(op) = self.expect_op(&["<", ">", "<=", ">="]) {
            let rhs = self.parse_term()?;
            lhs = Node::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Node, TemplateError> {
        let mut lhs = self.parse_factor()?;
        while let Some(op) = self.expect_op(&["+", "-"]) {
            let rhs = self.parse_factor()?;
            lhs = Node::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_factor(&mut self) -> Result<Node, TemplateError> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) = self.expect_op(&["*", "/", "%"]) {
            let rhs = self.parse_unary()?;
            lhs = Node::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Node, TemplateError> {
        if self.expect_op(&["-"]).is_some() {
            return Ok(Node::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Node, TemplateError> {
        let mut node = self.parse_primary()?;
        while matches!(self.peek(), Some(Token::LBracket)) {
            self.bump();
            node = self.parse_subscript(node)?;
            match self.bump() {
                Some(Token::RBracket) => {}
                _ => return Err(TemplateError::ExpressionError("expected ']'".into())),
            }
        }
        Ok(node)
    }

    fn parse_subscript(&mut self, base: Node) -> Result<Node, TemplateError> {
        // either `idx` or `[start]:[stop]`
        let first = if matches!(self.peek(), Some(Token::Colon)) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };

        if matches!(self.peek(), Some(Token::Colon)) {
            self.bump();
            let second = if matches!(self.peek(), Some(Token::RBracket)) {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            };
            Ok(Node::Slice(Box::new(base), first, second))
        } else {
            let idx = first.ok_or_else(|| TemplateError::ExpressionError("empty index".into()))?;
            Ok(Node::Index(Box::new(base), idx))
        }
    }

    fn parse_primary(&mut self) -> Result<Node, TemplateError> {
        match self.bump() {
            Some(Token::Int(n)) => Ok(Node::IntLit(n)),
            Some(Token::Str(s)) => Ok(Node::StrLit(s)),
            Some(Token::Ident(name)) if name == "x" => Ok(Node::Var),
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.bump();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        args.push(self.parse_expr()?);
                        while matches!(self.peek(), Some(Token::Comma)) {
                            self.bump();
                            args.push(self.parse_expr()?);
                        }
                    }
                    match self.bump() {
                        Some(Token::RParen) => {}
                        _ => return Err(TemplateError::ExpressionError("expected ')'".into())),
                    }
                    if !matches!(name.as_str(), "len" | "upper" | "lower" | "int" | "str") {
                        return Err(TemplateError::ExpressionError(format!(
                            "unknown builtin '{name}'"
                        )));
                    }
                    Ok(Node::Call(name, args))
                } else {
                    Err(TemplateError::ExpressionError(format!("unknown identifier '{name}'")))
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(TemplateError::ExpressionError("expected ')'".into())),
                }
            }
            other => Err(TemplateError::ExpressionError(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

fn eval_node(node: &Node, arg: &str) -> Result<Value, TemplateError> {
    match node {
        Node::IntLit(n) => Ok(Value::Int(*n)),
        Node::StrLit(s) => Ok(Value::Str(s.clone())),
        Node::Var => Ok(Value::Str(arg.to_string())),
        Node::Neg(inner) => Ok(Value::Int(-eval_node(inner, arg)?.as_int()?)),
        Node::Call(name, args) => {
            let vals: Result<Vec<Value>, TemplateError> =
                args.iter().map(|a| eval_node(a, arg)).collect();
            let vals = vals?;
            let v0 = vals.first().cloned().ok_or_else(|| {
                TemplateError::ExpressionError(format!("{name}() requires an argument"))
            })?;
            match name.as_str() {
                "len" => Ok(Value::Int(v0.as_str().chars().count() as i64)),
                "upper" => Ok(Value::Str(v0.as_str().to_uppercase())),
                "lower" => Ok(Value::Str(v0.as_str().to_lowercase())),
                "int" => Ok(Value::Int(v0.as_int()?)),
                "str" => Ok(Value::Str(v0.as_str())),
                other => Err(TemplateError::ExpressionError(format!("unknown builtin '{other}'"))),
            }
        }
        Node::Index(base, idx) => {
            let s = eval_node(base, arg)?.as_str();
            let chars: Vec<char> = s.chars().collect();
            let i = resolve_index(eval_node(idx, arg)?.as_int()?, chars.len())?;
            Ok(Value::Str(chars[i].to_string()))
        }
        Node::Slice(base, start, stop) => {
            let s = eval_node(base, arg)?.as_str();
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len();
            let start = match start {
                Some(n) => resolve_bound(eval_node(n, arg)?.as_int()?, len),
                None => 0,
            };
            let stop = match stop {
                Some(n) => resolve_bound(eval_node(n, arg)?.as_int()?, len),
                None => len,
            };
            let stop = stop.max(start);
            Ok(Value::Str(chars[start..stop.min(len)].iter().collect()))
        }
        Node::BinOp(op, l, r) => eval_binop(op, eval_node(l, arg)?, eval_node(r, arg)?),
    }
}

fn resolve_index(i: i64, len: usize) -> Result<usize, TemplateError> {
    let idx = if i < 0 { i + len as i64 } else { i };
    if idx < 0 || idx as usize >= len {
        return Err(TemplateError::ExpressionError(format!(
            "index {i} out of range for length {len}"
        )));
    }
    Ok(idx as usize)
}

fn resolve_bound(i: i64, len: usize) -> usize {
    let idx = if i < 0 { i + len as i64 } else { i };
    idx.clamp(0, len as i64) as usize
}

fn eval_binop(op: &str, l: Value, r: Value) -> Result<Value, TemplateError> {
    match op {
        "+" => match (&l, &r) {
            (Value::Str(_), _) | (_, Value::Str(_)) => Ok(Value::Str(format!("{}{}", l.as_str(), r.as_str()))),
            _ => Ok(Value::Int(l.as_int()? + r.as_int()?)),
        },
        "-" => Ok(Value::Int(l.as_int()? - r.as_int()?)),
        "*" => Ok(Value::Int(l.as_int()? * r.as_int()?)),
        "/" => {
            let rhs = r.as_int()?;
            if rhs == 0 {
                return Err(TemplateError::ExpressionError("division by zero".into()));
            }
            Ok(Value::Int(l.as_int()? / rhs))
        }
        "%" => {
            let rhs = r.as_int()?;
            if rhs == 0 {
                return Err(TemplateError::ExpressionError("division by zero".into()));
            }
            Ok(Value::Int(l.as_int()? % rhs))
        }
        "==" => Ok(Value::Bool(l.as_str() == r.as_str())),
        "!=" => Ok(Value::Bool(l.as_str() != r.as_str())),
        "<" | ">" | "<=" | ">=" => {
            let (a, b) = (l.as_int()?, r.as_int()?);
            let result = match op {
                "<" => a < b,
                ">" => a > b,
                "<=" => a <= b,
                ">=" => a >= b,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        other => Err(TemplateError::ExpressionError(format!("unknown operator '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_on_literals() {
        assert_eq!(eval("1 + 2 * 3", "ignored").unwrap(), "7");
    }

    #[test]
    fn string_concatenation_with_x() {
        assert_eq!(eval("x + \"!\"", "hi").unwrap(), "hi!");
    }

    #[test]
    fn indexing_and_slicing_x() {
        assert_eq!(eval("x[0]", "hello").unwrap(), "h");
        assert_eq!(eval("x[1:3]", "hello").unwrap(), "el");
        assert_eq!(eval("x[-1]", "hello").unwrap(), "o");
    }

    #[test]
    fn builtins() {
        assert_eq!(eval("len(x)", "hello").unwrap(), "5");
        assert_eq!(eval("upper(x)", "hi").unwrap(), "HI");
        assert_eq!(eval("int(x) + 1", "41").unwrap(), "42");
    }

    #[test]
    fn unknown_identifier_is_rejected() {
        assert!(eval("system(x)", "hi").is_err());
        assert!(eval("y", "hi").is_err());
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        assert!(eval("x[10]", "hi").is_err());
    }
}
