//! Evaluation of bound expressions against the current buffer state

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use super::ast::{BinaryOp, UnaryOp};
use super::binder::{Bound, Function};
use crate::error::EvaluationError;
use crate::timeseries::{Aggregation, TimeSeriesBuffer, TimedValue};

/// .NET ticks at the Unix epoch
const UNIX_EPOCH_TICKS: f64 = 621_355_968_000_000_000.0;
const TICKS_PER_SECOND: f64 = 10_000_000.0;

/// Numbers above this are read as ticks rather than Unix seconds
const TICKS_THRESHOLD: f64 = 1.0e14;

/// Value produced by an expression
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Number(f64),
    Bool(bool),
}

impl Sample {
    pub fn as_f64(self) -> f64 {
        match self {
            Sample::Number(value) => value,
            Sample::Bool(true) => 1.0,
            Sample::Bool(false) => 0.0,
        }
    }

    pub fn as_bool(self) -> bool {
        match self {
            Sample::Number(value) => value != 0.0 && !value.is_nan(),
            Sample::Bool(value) => value,
        }
    }

    pub fn is_nan(self) -> bool {
        matches!(self, Sample::Number(value) if value.is_nan())
    }

    pub fn is_finite(self) -> bool {
        match self {
            Sample::Number(value) => value.is_finite(),
            Sample::Bool(_) => true,
        }
    }

    pub fn to_timed_value(self, timestamp: DateTime<Utc>) -> TimedValue {
        match self {
            Sample::Number(value) => TimedValue::new(timestamp, value),
            Sample::Bool(value) => TimedValue::from_bool(timestamp, value),
        }
    }

    fn from_timed_value(value: &TimedValue) -> Self {
        match value.value_bool {
            Some(flag) => Sample::Bool(flag),
            None => Sample::Number(value.value),
        }
    }
}

pub struct EvalContext<'a> {
    pub now: DateTime<Utc>,
    pub buffers: &'a HashMap<String, TimeSeriesBuffer>,
    pub delta_time_secs: f64,

    /// Read buffers as they were at this instant instead of their tail
    pub as_of: Option<DateTime<Utc>>,
}

impl<'a> EvalContext<'a> {
    pub fn new(now: DateTime<Utc>, buffers: &'a HashMap<String, TimeSeriesBuffer>) -> Self {
        Self {
            now,
            buffers,
            delta_time_secs: 0.0,
            as_of: None,
        }
    }

    pub fn with_delta_time(mut self, secs: f64) -> Self {
        self.delta_time_secs = secs;
        self
    }

    /// The same buffers seen from an earlier instant
    fn at_instant(&self, at: DateTime<Utc>) -> EvalContext<'a> {
        EvalContext {
            now: at,
            buffers: self.buffers,
            delta_time_secs: self.delta_time_secs,
            as_of: Some(at),
        }
    }

    fn read(&self, name: &str) -> Option<&'a TimedValue> {
        let buffer = self.buffers.get(name)?;
        match self.as_of {
            Some(at) => buffer.value_at(at),
            None => buffer.last(),
        }
    }
}

fn absorbs(err: &EvaluationError) -> bool {
    matches!(
        err,
        EvaluationError::MissingValue(_) | EvaluationError::InsufficientData(_)
    )
}

pub fn evaluate(node: &Bound, context: &EvalContext<'_>) -> Result<Sample, EvaluationError> {
    match node {
        Bound::Number(value) => Ok(Sample::Number(*value)),
        Bound::Bool(value) => Ok(Sample::Bool(*value)),
        Bound::Now => Ok(Sample::Number(
            context.now.timestamp_millis() as f64 / 1000.0,
        )),
        Bound::DeltaTime => Ok(Sample::Number(context.delta_time_secs)),
        Bound::Buffer(name) => context
            .read(name)
            .map(Sample::from_timed_value)
            .ok_or_else(|| EvaluationError::MissingValue(name.clone())),
        Bound::Unary { op, operand } => {
            let value = evaluate(operand, context)?;
            Ok(match op {
                UnaryOp::Negate => Sample::Number(-value.as_f64()),
                UnaryOp::Not => Sample::Bool(!value.as_bool()),
            })
        }
        Bound::Binary { op, left, right } => evaluate_binary(*op, left, right, context),
        Bound::Function { function, args } => evaluate_function(*function, args, context),
        Bound::Temporal {
            aggregation,
            input,
            window_secs,
            offset_secs,
        } => evaluate_temporal(*aggregation, input, *window_secs, *offset_secs, context),
    }
}

fn evaluate_binary(
    op: BinaryOp,
    left: &Bound,
    right: &Bound,
    context: &EvalContext<'_>,
) -> Result<Sample, EvaluationError> {
    match op {
        BinaryOp::And => {
            if !evaluate(left, context)?.as_bool() {
                return Ok(Sample::Bool(false));
            }
            return Ok(Sample::Bool(evaluate(right, context)?.as_bool()));
        }
        BinaryOp::Or => {
            if evaluate(left, context)?.as_bool() {
                return Ok(Sample::Bool(true));
            }
            return Ok(Sample::Bool(evaluate(right, context)?.as_bool()));
        }
        _ => {}
    }

    let l = evaluate(left, context)?.as_f64();
    let r = evaluate(right, context)?.as_f64();

    let sample = match op {
        BinaryOp::Add => Sample::Number(l + r),
        BinaryOp::Sub => Sample::Number(l - r),
        BinaryOp::Mul => Sample::Number(l * r),
        BinaryOp::Div => Sample::Number(l / r),
        BinaryOp::Rem => Sample::Number(l % r),
        BinaryOp::Pow => Sample::Number(l.powf(r)),
        BinaryOp::Greater => Sample::Bool(l > r),
        BinaryOp::GreaterEqual => Sample::Bool(l >= r),
        BinaryOp::Less => Sample::Bool(l < r),
        BinaryOp::LessEqual => Sample::Bool(l <= r),
        BinaryOp::Equal => Sample::Bool(l == r),
        BinaryOp::NotEqual => Sample::Bool(l != r),
        BinaryOp::And | BinaryOp::Or => Sample::Bool(l != 0.0 && r != 0.0),
    };

    Ok(sample)
}

fn evaluate_function(
    function: Function,
    args: &[Bound],
    context: &EvalContext<'_>,
) -> Result<Sample, EvaluationError> {
    let number = |idx: usize| -> Result<f64, EvaluationError> {
        let arg = args.get(idx).ok_or_else(|| {
            EvaluationError::TypeMismatch(format!("{function:?} is missing argument {idx}"))
        })?;
        Ok(evaluate(arg, context)?.as_f64())
    };

    match function {
        Function::Option => {
            let mut saw_nan = false;
            let mut last_error = None;
            for arg in args {
                match evaluate(arg, context) {
                    Ok(sample) if !sample.is_nan() => return Ok(sample),
                    Ok(_) => saw_nan = true,
                    Err(err) => last_error = Some(err),
                }
            }
            if saw_nan {
                return Ok(Sample::Number(f64::NAN));
            }
            Err(last_error.unwrap_or_else(|| EvaluationError::MissingValue("OPTION".to_string())))
        }
        Function::If => {
            let branch = if number(0)? != 0.0 { 1 } else { 2 };
            let arg = args.get(branch).ok_or_else(|| {
                EvaluationError::TypeMismatch("IF is missing a branch".to_string())
            })?;
            evaluate(arg, context)
        }
        Function::IfNan => {
            let (Some(value), Some(fallback)) = (args.first(), args.get(1)) else {
                return Err(EvaluationError::TypeMismatch(
                    "IFNAN takes two arguments".to_string(),
                ));
            };
            match evaluate(value, context) {
                Ok(sample) if !sample.is_nan() => Ok(sample),
                Ok(_) => evaluate(fallback, context),
                Err(err) if absorbs(&err) => evaluate(fallback, context),
                Err(err) => Err(err),
            }
        }
        Function::IsNan => match args.first().map(|arg| evaluate(arg, context)) {
            Some(Ok(sample)) => Ok(Sample::Bool(sample.is_nan())),
            Some(Err(err)) if absorbs(&err) => Ok(Sample::Bool(true)),
            Some(Err(err)) => Err(err),
            None => Ok(Sample::Bool(true)),
        },
        Function::Abs => Ok(Sample::Number(number(0)?.abs())),
        Function::Sqrt => Ok(Sample::Number(number(0)?.sqrt())),
        Function::Round => {
            let value = number(0)?;
            let digits = if args.len() > 1 { number(1)? as i32 } else { 0 };
            let factor = 10f64.powi(digits);
            Ok(Sample::Number((value * factor).round() / factor))
        }
        Function::Min | Function::Max => {
            let values = (0..args.len())
                .map(number)
                .collect::<Result<Vec<_>, _>>()?;
            let folded = if function == Function::Min {
                values.into_iter().fold(f64::INFINITY, f64::min)
            } else {
                values.into_iter().fold(f64::NEG_INFINITY, f64::max)
            };
            Ok(Sample::Number(folded))
        }
        Function::Hour | Function::Minute | Function::DayOfWeek => {
            let raw = number(0)?;
            let instant = instant_from_number(raw).ok_or_else(|| {
                EvaluationError::TypeMismatch(format!("{raw} is not a valid point in time"))
            })?;
            let value = match function {
                Function::Hour => instant.hour(),
                Function::Minute => instant.minute(),
                _ => instant.weekday().num_days_from_sunday(),
            };
            Ok(Sample::Number(value as f64))
        }
    }
}

/// Read a number as Unix seconds, or as .NET ticks when it is very large.
fn instant_from_number(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let secs = if value > TICKS_THRESHOLD {
        (value - UNIX_EPOCH_TICKS) / TICKS_PER_SECOND
    } else {
        value
    };
    DateTime::from_timestamp(secs.floor() as i64, 0)
}

/// Saturates at the earliest representable instant
fn seconds_before(at: DateTime<Utc>, secs: f64) -> DateTime<Utc> {
    at.checked_sub_signed(Duration::milliseconds((secs * 1000.0) as i64))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Evaluate `input` at every instant one of its buffers changes within
/// `[start, end]`, plus at `start` when a value is already in effect there.
fn sampled_series(
    input: &Bound,
    names: &BTreeSet<String>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    context: &EvalContext<'_>,
) -> Result<TimeSeriesBuffer, EvaluationError> {
    let mut instants = Vec::new();
    for buffer in names.iter().filter_map(|name| context.buffers.get(name)) {
        if buffer.value_at(start).is_some() {
            instants.push(start);
        }
        instants.extend(buffer.points_in_range(start, end).map(|p| p.timestamp));
    }
    instants.sort_unstable();
    instants.dedup();

    let mut series = TimeSeriesBuffer::new();
    for at in instants {
        match evaluate(input, &context.at_instant(at)) {
            Ok(sample) => {
                series.add_point(sample.to_timed_value(at), None);
            }
            // not every input has a value yet
            Err(err) if absorbs(&err) => {}
            Err(err) => return Err(err),
        }
    }

    Ok(series)
}

fn evaluate_temporal(
    aggregation: Aggregation,
    input: &Bound,
    window_secs: f64,
    offset_secs: f64,
    context: &EvalContext<'_>,
) -> Result<Sample, EvaluationError> {
    let end = seconds_before(context.now, offset_secs);
    let start = seconds_before(end, window_secs);

    let value = match input {
        Bound::Buffer(name) => context
            .buffers
            .get(name)
            .ok_or_else(|| EvaluationError::MissingValue(name.clone()))?
            .aggregate(aggregation, start, end)
            .ok_or_else(|| EvaluationError::InsufficientData(format!("{aggregation:?}({name})")))?,
        _ => {
            let mut names = BTreeSet::new();
            input.collect_buffers(&mut names);
            if names.is_empty() {
                // aggregating a scalar is the scalar itself
                return evaluate(input, context);
            }

            sampled_series(input, &names, start, end, context)?
                .aggregate(aggregation, start, end)
                .ok_or_else(|| {
                    EvaluationError::InsufficientData(format!("{aggregation:?}(expression)"))
                })?
        }
    };

    Ok(match aggregation {
        Aggregation::Any | Aggregation::All => Sample::Bool(value != 0.0),
        _ => Sample::Number(value),
    })
}
