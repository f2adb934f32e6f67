//! Binding of parsed expressions against twins, macros and earlier parameters

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::Duration;

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::eval::{EvalContext, Sample, evaluate};
use super::macros::MacroTable;
use super::parser::parse;
use crate::error::{BindingError, EvaluationError};
use crate::timeseries::Aggregation;
use crate::twins::TwinBinding;

/// Scalar functions of the expression language
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Option,
    If,
    IfNan,
    IsNan,
    Abs,
    Sqrt,
    Round,
    Min,
    Max,
    Hour,
    Minute,
    DayOfWeek,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        let function = match name.to_ascii_uppercase().as_str() {
            "OPTION" => Function::Option,
            "IF" => Function::If,
            "IFNAN" => Function::IfNan,
            "ISNAN" => Function::IsNan,
            "ABS" => Function::Abs,
            "SQRT" => Function::Sqrt,
            "ROUND" => Function::Round,
            "MIN" => Function::Min,
            "MAX" => Function::Max,
            "HOUR" => Function::Hour,
            "MINUTE" => Function::Minute,
            "DAYOFWEEK" => Function::DayOfWeek,
            _ => return None,
        };
        Some(function)
    }

    fn arity(self) -> (usize, Option<usize>) {
        match self {
            Function::Option | Function::Min | Function::Max => (1, None),
            Function::If => (3, Some(3)),
            Function::IfNan => (2, Some(2)),
            Function::Round => (1, Some(2)),
            Function::IsNan
            | Function::Abs
            | Function::Sqrt
            | Function::Hour
            | Function::Minute
            | Function::DayOfWeek => (1, Some(1)),
        }
    }
}

/// Expression tree with every name resolved to a concrete source
#[derive(Debug, Clone, PartialEq)]
pub enum Bound {
    Number(f64),
    Bool(bool),

    /// Latest value of a named buffer (sensor twin id or parameter variable)
    Buffer(String),

    Now,

    /// Seconds since the previous sample of the buffer being written
    DeltaTime,

    Unary {
        op: UnaryOp,
        operand: Box<Bound>,
    },

    Binary {
        op: BinaryOp,
        left: Box<Bound>,
        right: Box<Bound>,
    },

    Function {
        function: Function,
        args: Vec<Bound>,
    },

    Temporal {
        aggregation: Aggregation,
        input: Box<Bound>,
        window_secs: f64,
        offset_secs: f64,
    },
}

impl Bound {
    /// Add the name of every buffer this node reads to `names`.
    pub fn collect_buffers(&self, names: &mut BTreeSet<String>) {
        match self {
            Bound::Buffer(name) => {
                names.insert(name.clone());
            }
            Bound::Unary { operand, .. } => operand.collect_buffers(names),
            Bound::Binary { left, right, .. } => {
                left.collect_buffers(names);
                right.collect_buffers(names);
            }
            Bound::Function { args, .. } => {
                for arg in args {
                    arg.collect_buffers(names);
                }
            }
            Bound::Temporal { input, .. } => input.collect_buffers(names),
            Bound::Number(_) | Bound::Bool(_) | Bound::Now | Bound::DeltaTime => {}
        }
    }
}

/// A callable evaluator produced by [`ExpressionBinder`]
#[derive(Debug, Clone, PartialEq)]
pub struct BoundExpression {
    text: String,
    root: Bound,
    inputs: BTreeSet<String>,
    time_dependent: bool,
    required_history: Duration,
}

impl BoundExpression {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn root(&self) -> &Bound {
        &self.root
    }

    /// Buffers read by this expression
    pub fn inputs(&self) -> &BTreeSet<String> {
        &self.inputs
    }

    /// Whether the value can change without any input changing
    pub fn is_time_dependent(&self) -> bool {
        self.time_dependent
    }

    /// Longest look-back of any temporal function used
    pub fn required_history(&self) -> Duration {
        self.required_history
    }

    pub fn evaluate(&self, context: &EvalContext<'_>) -> Result<Sample, EvaluationError> {
        evaluate(&self.root, context)
    }
}

/// Names visible to the expressions of one rule instance
#[derive(Debug, Clone)]
pub struct BindingContext<'a> {
    sensors: &'a [TwinBinding],
    macros: &'a MacroTable,
    variables: HashSet<String>,
    failed: HashMap<String, BindingError>,
}

impl<'a> BindingContext<'a> {
    pub fn new(sensors: &'a [TwinBinding], macros: &'a MacroTable) -> Self {
        Self {
            sensors,
            macros,
            variables: HashSet::new(),
            failed: HashMap::new(),
        }
    }

    /// Make a successfully bound parameter visible to later expressions.
    pub fn declare(&mut self, variable: &str) {
        self.failed.remove(variable);
        self.variables.insert(variable.to_string());
    }

    /// Record a parameter that failed so dependents fail with a clear reason.
    pub fn mark_failed(&mut self, variable: &str, error: BindingError) {
        self.variables.remove(variable);
        self.failed.insert(variable.to_string(), error);
    }

    pub fn bind(&self, text: &str) -> Result<BoundExpression, BindingError> {
        ExpressionBinder::bind(text, self)
    }

    fn sensor(&self, reference: &str) -> Option<&TwinBinding> {
        self.sensors.iter().find(|sensor| sensor.matches(reference))
    }
}

pub struct ExpressionBinder<'c, 'a> {
    context: &'c BindingContext<'a>,
    expanding: Vec<String>,
    inputs: BTreeSet<String>,
    time_dependent: bool,
    required_history_secs: f64,
}

impl<'c, 'a> ExpressionBinder<'c, 'a> {
    pub fn bind(
        text: &str,
        context: &'c BindingContext<'a>,
    ) -> Result<BoundExpression, BindingError> {
        let expr = parse(text)?;
        Self::bind_expr(&expr, text, context)
    }

    pub fn bind_expr(
        expr: &Expr,
        text: &str,
        context: &'c BindingContext<'a>,
    ) -> Result<BoundExpression, BindingError> {
        let mut binder = ExpressionBinder {
            context,
            expanding: Vec::new(),
            inputs: BTreeSet::new(),
            time_dependent: false,
            required_history_secs: 0.0,
        };

        let root = binder.bind_node(expr)?;

        Ok(BoundExpression {
            text: text.to_string(),
            root,
            inputs: binder.inputs,
            time_dependent: binder.time_dependent,
            required_history: Duration::milliseconds(
                (binder.required_history_secs * 1000.0) as i64,
            ),
        })
    }

    fn bind_node(&mut self, expr: &Expr) -> Result<Bound, BindingError> {
        match expr {
            Expr::Number(value) => Ok(Bound::Number(*value)),
            Expr::Bool(value) => Ok(Bound::Bool(*value)),
            Expr::Duration(secs) => Ok(Bound::Number(*secs)),
            Expr::Reference(name) => self.bind_reference(name),
            Expr::Identifier(name) => self.bind_identifier(name),
            Expr::Unary { op, operand } => Ok(Bound::Unary {
                op: *op,
                operand: Box::new(self.bind_node(operand)?),
            }),
            Expr::Binary { op, left, right } => Ok(Bound::Binary {
                op: *op,
                left: Box::new(self.bind_node(left)?),
                right: Box::new(self.bind_node(right)?),
            }),
            Expr::Call { name, args } => self.bind_call(name, args),
        }
    }

    fn buffer(&mut self, name: &str) -> Bound {
        self.inputs.insert(name.to_string());
        Bound::Buffer(name.to_string())
    }

    fn bind_reference(&mut self, name: &str) -> Result<Bound, BindingError> {
        if let Some(sensor) = self.context.sensor(name) {
            let twin_id = sensor.twin_id.clone();
            return Ok(self.buffer(&twin_id));
        }
        if self.context.variables.contains(name) {
            return Ok(self.buffer(name));
        }
        if let Some(err) = self.context.failed.get(name) {
            return Err(failed_dependency(name, err));
        }
        if self.context.macros.contains(name) {
            return self.expand_macro(name, &[]);
        }
        Err(BindingError::NoTwinMatch(name.to_string()))
    }

    fn bind_identifier(&mut self, name: &str) -> Result<Bound, BindingError> {
        if let Some(err) = self.context.failed.get(name) {
            return Err(failed_dependency(name, err));
        }
        if self.context.variables.contains(name) {
            return Ok(self.buffer(name));
        }
        if self.context.macros.contains(name) {
            return self.expand_macro(name, &[]);
        }

        match name.to_ascii_uppercase().as_str() {
            "NOW" => {
                self.time_dependent = true;
                return Ok(Bound::Now);
            }
            "DELTA_TIME_S" => {
                self.time_dependent = true;
                return Ok(Bound::DeltaTime);
            }
            "PI" => return Ok(Bound::Number(std::f64::consts::PI)),
            _ => {}
        }

        if let Some(sensor) = self.context.sensor(name) {
            let twin_id = sensor.twin_id.clone();
            return Ok(self.buffer(&twin_id));
        }

        Err(BindingError::UnknownVariable(name.to_string()))
    }

    fn bind_call(&mut self, name: &str, args: &[Expr]) -> Result<Bound, BindingError> {
        if self.context.macros.contains(name) {
            return self.expand_macro(name, args);
        }

        if let Some(aggregation) = Aggregation::from_name(name) {
            let windowed = args.len() >= 2 && is_duration(&args[1]);
            let scalar_alternative = matches!(aggregation, Aggregation::Min | Aggregation::Max);
            if windowed || !scalar_alternative {
                return self.bind_temporal(name, aggregation, args);
            }
        }

        let Some(function) = Function::from_name(name) else {
            return Err(BindingError::UnknownFunction(name.to_string()));
        };

        let (min, max) = function.arity();
        if args.len() < min || max.is_some_and(|max| args.len() > max) {
            let expected = match max {
                Some(max) if max == min => min.to_string(),
                Some(max) => format!("{min} to {max}"),
                None => format!("at least {min}"),
            };
            return Err(BindingError::Arity {
                function: name.to_ascii_uppercase(),
                expected,
                actual: args.len(),
            });
        }

        let args = args
            .iter()
            .map(|arg| self.bind_node(arg))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Bound::Function { function, args })
    }

    fn bind_temporal(
        &mut self,
        name: &str,
        aggregation: Aggregation,
        args: &[Expr],
    ) -> Result<Bound, BindingError> {
        if !(2..=3).contains(&args.len()) {
            return Err(BindingError::Arity {
                function: name.to_ascii_uppercase(),
                expected: "2 to 3".to_string(),
                actual: args.len(),
            });
        }

        let window_secs = window_seconds(&args[1]).filter(|secs| *secs > 0.0).ok_or_else(|| {
            BindingError::Invalid(format!(
                "{} window must be a positive duration, got {}",
                name.to_ascii_uppercase(),
                args[1]
            ))
        })?;

        let offset_secs = match args.get(2) {
            Some(offset) => window_seconds(offset).map(f64::abs).ok_or_else(|| {
                BindingError::Invalid(format!(
                    "{} offset must be a duration, got {offset}",
                    name.to_ascii_uppercase()
                ))
            })?,
            None => 0.0,
        };

        let input = self.bind_node(&args[0])?;

        self.time_dependent = true;
        self.required_history_secs = self.required_history_secs.max(window_secs + offset_secs);

        Ok(Bound::Temporal {
            aggregation,
            input: Box::new(input),
            window_secs,
            offset_secs,
        })
    }

    fn expand_macro(&mut self, name: &str, args: &[Expr]) -> Result<Bound, BindingError> {
        let definition = match self.context.macros.get(name) {
            Some(Ok(definition)) => definition,
            Some(Err(err)) => return Err(err.clone()),
            None => return Err(BindingError::UnknownVariable(name.to_string())),
        };

        if self.expanding.iter().any(|entry| entry == name) {
            let mut path = self.expanding.clone();
            path.push(name.to_string());
            return Err(BindingError::CircularReference(path.join(" -> ")));
        }

        if definition.parameters.len() != args.len() {
            return Err(BindingError::Arity {
                function: name.to_string(),
                expected: definition.parameters.len().to_string(),
                actual: args.len(),
            });
        }

        let replacements: HashMap<String, Expr> = definition
            .parameters
            .iter()
            .cloned()
            .zip(args.iter().cloned())
            .collect();
        let body = definition.body.substitute(&replacements);

        self.expanding.push(name.to_string());
        let bound = self.bind_node(&body);
        self.expanding.pop();

        bound.map_err(|err| match err {
            BindingError::CircularReference(_) | BindingError::InvalidMacro { .. } => err,
            other => BindingError::InvalidMacro {
                name: name.to_string(),
                reason: other.to_string(),
            },
        })
    }
}

fn failed_dependency(name: &str, err: &BindingError) -> BindingError {
    match err {
        BindingError::FailedDependency(_) => err.clone(),
        _ => BindingError::FailedDependency(name.to_string()),
    }
}

fn is_duration(expr: &Expr) -> bool {
    match expr {
        Expr::Duration(_) => true,
        Expr::Unary {
            op: UnaryOp::Negate,
            operand,
        } => is_duration(operand),
        _ => false,
    }
}

/// Seconds of a window argument; plain numbers are hours.
fn window_seconds(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Duration(secs) => Some(*secs),
        Expr::Number(hours) => Some(hours * 3600.0),
        Expr::Unary {
            op: UnaryOp::Negate,
            operand,
        } => window_seconds(operand).map(|secs| -secs),
        _ => None,
    }
}
