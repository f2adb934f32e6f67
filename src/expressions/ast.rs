use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Equal,
    NotEqual,
    And,
    Or,
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
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEqual => ">=",
            BinaryOp::Less => "<",
            BinaryOp::LessEqual => "<=",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Greater
                | BinaryOp::GreaterEqual
                | BinaryOp::Less
                | BinaryOp::LessEqual
                | BinaryOp::Equal
                | BinaryOp::NotEqual
        )
    }
}

/// Parsed, unbound expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Bool(bool),

    /// Duration literal in seconds (`15m`, `1h`, `5d`)
    Duration(f64),

    /// Bracketed reference, e.g. `[dtmi:com:example:TemperatureSensor;1]`
    Reference(String),

    /// Bare name: parameter, macro, built-in constant or sensor role
    Identifier(String),

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Call {
        name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Replace identifiers by the given expressions. Replacements are not
    /// themselves rewritten.
    pub fn substitute(&self, replacements: &HashMap<String, Expr>) -> Expr {
        if replacements.is_empty() {
            return self.clone();
        }

        match self {
            Expr::Identifier(name) => replacements
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.clone()),
            Expr::Unary { op, operand } => Expr::Unary {
                op: *op,
                operand: Box::new(operand.substitute(replacements)),
            },
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: Box::new(left.substitute(replacements)),
                right: Box::new(right.substitute(replacements)),
            },
            Expr::Call { name, args } => Expr::Call {
                name: name.clone(),
                args: args.iter().map(|arg| arg.substitute(replacements)).collect(),
            },
            Expr::Number(_)
            | Expr::Bool(_)
            | Expr::Duration(_)
            | Expr::Reference(_) => self.clone(),
        }
    }

    /// Every name this expression could refer to: identifiers, references
    /// and called function names.
    pub fn referenced_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Expr::Identifier(name) | Expr::Reference(name) => names.push(name),
            Expr::Unary { operand, .. } => operand.collect_names(names),
            Expr::Binary { left, right, .. } => {
                left.collect_names(names);
                right.collect_names(names);
            }
            Expr::Call { name, args } => {
                names.push(name);
                for arg in args {
                    arg.collect_names(names);
                }
            }
            Expr::Number(_) | Expr::Bool(_) | Expr::Duration(_) => {}
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(value) => write!(f, "{value}"),
            Expr::Bool(value) => write!(f, "{}", if *value { "TRUE" } else { "FALSE" }),
            Expr::Duration(secs) => write!(f, "{secs}s"),
            Expr::Reference(name) => write!(f, "[{name}]"),
            Expr::Identifier(name) => write!(f, "{name}"),
            Expr::Unary {
                op: UnaryOp::Negate,
                operand,
            } => write!(f, "-({operand})"),
            Expr::Unary {
                op: UnaryOp::Not,
                operand,
            } => write!(f, "!({operand})"),
            Expr::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Call { name, args } => {
                write!(f, "{name}(")?;
                for (idx, arg) in args.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}
