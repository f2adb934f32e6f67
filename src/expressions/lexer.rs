use std::fmt;

use crate::error::BindingError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Duration(f64),
    Identifier(String),
    Reference(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Equal,
    NotEqual,
    And,
    Or,
    Not,
    True,
    False,
    LeftParen,
    RightParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(value) => write!(f, "{value}"),
            Token::Duration(secs) => write!(f, "{secs}s"),
            Token::Identifier(name) => write!(f, "{name}"),
            Token::Reference(name) => write!(f, "[{name}]"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Caret => write!(f, "^"),
            Token::Greater => write!(f, ">"),
            Token::GreaterEqual => write!(f, ">="),
            Token::Less => write!(f, "<"),
            Token::LessEqual => write!(f, "<="),
            Token::Equal => write!(f, "=="),
            Token::NotEqual => write!(f, "!="),
            Token::And => write!(f, "AND"),
            Token::Or => write!(f, "OR"),
            Token::Not => write!(f, "NOT"),
            Token::True => write!(f, "TRUE"),
            Token::False => write!(f, "FALSE"),
            Token::LeftParen => write!(f, "("),
            Token::RightParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
        }
    }
}

fn duration_unit(unit: char) -> Option<f64> {
    match unit {
        's' => Some(1.0),
        'm' => Some(60.0),
        'h' => Some(3600.0),
        'd' => Some(86_400.0),
        'w' => Some(604_800.0),
        _ => None,
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

pub fn tokenize(text: &str) -> Result<Vec<Token>, BindingError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(pos + 1).is_some_and(char::is_ascii_digit))
        {
            let start = pos;
            while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                pos += 1;
            }
            // exponent, e.g. 1e-10
            if pos < chars.len() && (chars[pos] == 'e' || chars[pos] == 'E') {
                let sign = chars.get(pos + 1).is_some_and(|c| *c == '-' || *c == '+');
                let digit_at = if sign { pos + 2 } else { pos + 1 };
                if chars.get(digit_at).is_some_and(char::is_ascii_digit) {
                    pos = digit_at;
                    while pos < chars.len() && chars[pos].is_ascii_digit() {
                        pos += 1;
                    }
                }
            }

            let literal: String = chars[start..pos].iter().collect();
            let value: f64 = literal.parse().map_err(|_| {
                BindingError::Parse(format!("Invalid number literal {literal}"))
            })?;

            let unit = chars.get(pos).copied().and_then(duration_unit);
            let unit_ends = !chars.get(pos + 1).is_some_and(|c| is_identifier_char(*c));
            match unit {
                Some(multiplier) if unit_ends => {
                    tokens.push(Token::Duration(value * multiplier));
                    pos += 1;
                }
                _ => tokens.push(Token::Number(value)),
            }
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = pos;
            while pos < chars.len() && is_identifier_char(chars[pos]) {
                pos += 1;
            }
            let word: String = chars[start..pos].iter().collect();
            let token = match word.to_ascii_uppercase().as_str() {
                "AND" => Token::And,
                "OR" => Token::Or,
                "NOT" => Token::Not,
                "TRUE" => Token::True,
                "FALSE" => Token::False,
                _ => Token::Identifier(word),
            };
            tokens.push(token);
            continue;
        }

        if c == '[' {
            let start = pos + 1;
            let Some(offset) = chars[start..].iter().position(|c| *c == ']') else {
                let rest: String = chars[pos..].iter().collect();
                return Err(BindingError::Parse(format!(
                    "Missing close bracket on reference {rest}"
                )));
            };
            let name: String = chars[start..start + offset].iter().collect();
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(BindingError::Parse("Empty reference []".to_string()));
            }
            tokens.push(Token::Reference(name));
            pos = start + offset + 1;
            continue;
        }

        let next = chars.get(pos + 1).copied();
        let (token, width) = match (c, next) {
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('^', _) => (Token::Caret, 1),
            ('(', _) => (Token::LeftParen, 1),
            (')', _) => (Token::RightParen, 1),
            (',', _) => (Token::Comma, 1),
            ('>', Some('=')) => (Token::GreaterEqual, 2),
            ('>', _) => (Token::Greater, 1),
            ('<', Some('=')) => (Token::LessEqual, 2),
            ('<', Some('>')) => (Token::NotEqual, 2),
            ('<', _) => (Token::Less, 1),
            ('=', Some('=')) => (Token::Equal, 2),
            ('=', _) => (Token::Equal, 1),
            ('!', Some('=')) => (Token::NotEqual, 2),
            ('!', _) => (Token::Not, 1),
            ('&', Some('&')) => (Token::And, 2),
            ('&', _) => (Token::And, 1),
            ('|', Some('|')) => (Token::Or, 2),
            ('|', _) => (Token::Or, 1),
            (']', _) => {
                return Err(BindingError::Parse(format!(
                    "Missing open bracket before position {pos}"
                )));
            }
            _ => {
                return Err(BindingError::Parse(format!(
                    "Unexpected character '{c}' at position {pos}"
                )));
            }
        };
        tokens.push(token);
        pos += width;
    }

    Ok(tokens)
}
