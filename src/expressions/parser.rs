use super::ast::{BinaryOp, Expr, UnaryOp};
use super::lexer::{Token, tokenize};
use crate::error::BindingError;

/// Parse expression text into an unbound tree.
pub fn parse(text: &str) -> Result<Expr, BindingError> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(BindingError::Parse("Expression is empty".to_string()));
    }

    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or()?;

    match parser.peek() {
        None => Ok(expr),
        Some(Token::RightParen) => Err(BindingError::Parse(
            "Missing open parenthesis for ')'".to_string(),
        )),
        Some(token) => Err(BindingError::Parse(format!(
            "Unexpected '{token}' after end of expression"
        ))),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn or(&mut self) -> Result<Expr, BindingError> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = Self::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, BindingError> {
        let mut left = self.comparison()?;
        while self.eat(&Token::And) {
            let right = self.comparison()?;
            left = Self::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, BindingError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Greater) => BinaryOp::Greater,
                Some(Token::GreaterEqual) => BinaryOp::GreaterEqual,
                Some(Token::Less) => BinaryOp::Less,
                Some(Token::LessEqual) => BinaryOp::LessEqual,
                Some(Token::Equal) => BinaryOp::Equal,
                Some(Token::NotEqual) => BinaryOp::NotEqual,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.additive()?;
            left = Self::binary(op, left, right);
        }
    }

    fn additive(&mut self) -> Result<Expr, BindingError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Self::binary(op, left, right);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, BindingError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Self::binary(op, left, right);
        }
    }

    fn unary(&mut self) -> Result<Expr, BindingError> {
        let op = match self.peek() {
            Some(Token::Minus) => UnaryOp::Negate,
            Some(Token::Not) => UnaryOp::Not,
            Some(Token::Plus) => {
                self.pos += 1;
                return self.unary();
            }
            _ => return self.power(),
        };
        self.pos += 1;
        let operand = self.unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn power(&mut self) -> Result<Expr, BindingError> {
        let base = self.primary()?;
        if self.eat(&Token::Caret) {
            // right associative
            let exponent = self.unary()?;
            return Ok(Self::binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, BindingError> {
        let Some(token) = self.advance() else {
            return Err(BindingError::Parse(
                "Unexpected end of expression".to_string(),
            ));
        };

        match token {
            Token::Number(value) => Ok(Expr::Number(value)),
            Token::Duration(secs) => Ok(Expr::Duration(secs)),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Reference(name) => Ok(Expr::Reference(name)),
            Token::Identifier(name) => {
                if self.eat(&Token::LeftParen) {
                    let args = self.arguments(&name)?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Identifier(name))
                }
            }
            Token::LeftParen => {
                let inner = self.or()?;
                if !self.eat(&Token::RightParen) {
                    return Err(BindingError::Parse(
                        "Missing close parenthesis".to_string(),
                    ));
                }
                Ok(inner)
            }
            other => Err(BindingError::Parse(format!("Unexpected '{other}'"))),
        }
    }

    fn arguments(&mut self, name: &str) -> Result<Vec<Expr>, BindingError> {
        let mut args = Vec::new();
        if self.eat(&Token::RightParen) {
            return Ok(args);
        }

        loop {
            if self.peek().is_none() {
                return Err(missing_close(name));
            }
            if self.peek() == Some(&Token::Comma) {
                return Err(BindingError::Parse(format!(
                    "Empty argument in call to {name}"
                )));
            }

            args.push(self.or()?);

            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RightParen) => return Ok(args),
                None => return Err(missing_close(name)),
                Some(other) => {
                    return Err(BindingError::Parse(format!(
                        "Unexpected '{other}' in call to {name}"
                    )));
                }
            }
        }
    }
}

fn missing_close(name: &str) -> BindingError {
    BindingError::Parse(format!(
        "Missing close parenthesis on call to {}",
        name.to_ascii_uppercase()
    ))
}
