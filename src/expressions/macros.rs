//! Global variables ("macros") resolved once per generation batch
//!
//! Every global variable resolves on its own: a parse error, a cycle or a
//! dependency on a broken macro only poisons that entry, and only the rule
//! expressions that actually use it fail to bind.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::ast::Expr;
use super::binder::{BindingContext, ExpressionBinder};
use super::eval::{EvalContext, Sample};
use super::parser::parse;
use crate::error::BindingError;
use crate::rules::model::{GlobalVariable, VariableType};

#[derive(Debug, Clone, PartialEq)]
pub struct MacroDefinition {
    pub name: String,
    pub variable_type: VariableType,
    pub parameters: Vec<String>,

    /// Value expression with the macro's locals already inlined
    pub body: Expr,
}

#[derive(Debug, Clone, Default)]
pub struct MacroTable {
    entries: HashMap<String, Result<MacroDefinition, BindingError>>,
}

impl MacroTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn resolve(globals: &[GlobalVariable]) -> Self {
        let mut entries = HashMap::new();
        for global in globals {
            if entries.contains_key(&global.name) {
                warn!("duplicate global variable {}, keeping the first", global.name);
                continue;
            }
            entries.insert(global.name.clone(), parse_definition(global));
        }

        let mut table = MacroTable { entries };

        let mut verdicts = HashMap::new();
        let names: Vec<String> = table.entries.keys().cloned().collect();
        for name in &names {
            let _ = table.check(name, &mut Vec::new(), &mut verdicts);
        }
        for (name, verdict) in verdicts {
            if let Err(err) = verdict {
                debug!("global variable {name} failed: {err}");
                table.entries.insert(name, Err(err));
            }
        }

        let folded: Vec<(String, Result<Expr, BindingError>)> = names
            .iter()
            .filter_map(|name| match table.entries.get(name) {
                Some(Ok(def)) if def.variable_type == VariableType::Const => {
                    Some((name.clone(), table.fold_constant(def)))
                }
                _ => None,
            })
            .collect();
        for (name, result) in folded {
            match result {
                Ok(value) => {
                    if let Some(Ok(def)) = table.entries.get_mut(&name) {
                        def.body = value;
                    }
                }
                Err(err) => {
                    debug!("constant {name} failed: {err}");
                    table.entries.insert(name, Err(err));
                }
            }
        }

        table
    }

    pub fn get(&self, name: &str) -> Option<&Result<MacroDefinition, BindingError>> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names and errors of every macro that failed to resolve
    pub fn errors(&self) -> impl Iterator<Item = (&str, &BindingError)> {
        self.entries
            .iter()
            .filter_map(|(name, entry)| entry.as_ref().err().map(|err| (name.as_str(), err)))
    }

    fn check(
        &self,
        name: &str,
        stack: &mut Vec<String>,
        verdicts: &mut HashMap<String, Result<(), BindingError>>,
    ) -> Result<(), BindingError> {
        if let Some(verdict) = verdicts.get(name) {
            return verdict.clone();
        }

        if stack.iter().any(|entry| entry == name) {
            let mut path = stack.clone();
            path.push(name.to_string());
            return Err(BindingError::CircularReference(path.join(" -> ")));
        }

        let definition = match self.entries.get(name) {
            Some(Ok(definition)) => definition,
            Some(Err(err)) => return Err(err.clone()),
            None => return Ok(()),
        };

        stack.push(name.to_string());
        let mut verdict = Ok(());
        for referenced in definition.body.referenced_names() {
            if definition.parameters.iter().any(|p| p == referenced)
                || !self.entries.contains_key(referenced)
            {
                continue;
            }
            if let Err(err) = self.check(referenced, stack, verdicts) {
                verdict = Err(match err {
                    BindingError::CircularReference(_) | BindingError::InvalidMacro { .. } => err,
                    other => BindingError::InvalidMacro {
                        name: referenced.to_string(),
                        reason: other.to_string(),
                    },
                });
                break;
            }
        }
        stack.pop();

        verdicts.insert(name.to_string(), verdict.clone());
        verdict
    }

    fn fold_constant(&self, definition: &MacroDefinition) -> Result<Expr, BindingError> {
        let context = BindingContext::new(&[], self);
        let bound = ExpressionBinder::bind_expr(&definition.body, &definition.name, &context)?;

        if !bound.inputs().is_empty() || bound.is_time_dependent() {
            return Err(BindingError::InvalidMacro {
                name: definition.name.clone(),
                reason: "constants must not depend on telemetry or time".to_string(),
            });
        }

        let buffers = HashMap::new();
        let context = EvalContext::new(chrono::Utc::now(), &buffers);
        match bound.evaluate(&context) {
            Ok(Sample::Number(value)) if value.is_finite() => Ok(Expr::Number(value)),
            Ok(Sample::Bool(value)) => Ok(Expr::Bool(value)),
            Ok(Sample::Number(_)) => Err(BindingError::InvalidMacro {
                name: definition.name.clone(),
                reason: "constant is not a finite number".to_string(),
            }),
            Err(err) => Err(BindingError::InvalidMacro {
                name: definition.name.clone(),
                reason: err.to_string(),
            }),
        }
    }
}

fn parse_definition(global: &GlobalVariable) -> Result<MacroDefinition, BindingError> {
    let invalid = |reason: String| BindingError::InvalidMacro {
        name: global.name.clone(),
        reason,
    };

    let Some(last) = global.expressions.len().checked_sub(1) else {
        return Err(invalid("no expressions defined".to_string()));
    };

    let mut locals: HashMap<String, Expr> = HashMap::new();
    let mut body = None;
    for (idx, expression) in global.expressions.iter().enumerate() {
        let parsed = parse(&expression.expression).map_err(|err| invalid(err.to_string()))?;
        let inlined = parsed.substitute(&locals);
        if idx == last {
            body = Some(inlined);
        } else {
            locals.insert(expression.field_id.clone(), inlined);
        }
    }

    let body = body.ok_or_else(|| invalid("no expressions defined".to_string()))?;

    Ok(MacroDefinition {
        name: global.name.clone(),
        variable_type: global.variable_type,
        parameters: global.parameters.clone(),
        body,
    })
}
