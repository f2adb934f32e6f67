//! Rule expression language
//!
//! Expressions are tokenized, parsed into an [`Expr`] tree, then bound
//! against the twins of one equipment and the global variable table. The
//! bound tree is evaluated on every pass of an actor and yields a
//! [`Sample`].
//!
//! ```text
//! text --tokenize--> tokens --parse--> Expr --bind--> BoundExpression --evaluate--> Sample
//! ```

pub mod ast;
pub mod binder;
pub mod eval;
pub mod lexer;
pub mod macros;
pub mod parser;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use binder::{Bound, BindingContext, BoundExpression, ExpressionBinder, Function};
pub use eval::{EvalContext, Sample, evaluate};
pub use macros::{MacroDefinition, MacroTable};
pub use parser::parse;
