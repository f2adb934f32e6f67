//! Rules, global variables and their instantiation per equipment

pub mod factory;
pub mod instance;
pub mod model;

pub use factory::{GenerationSnapshot, RuleBundle, RuleInstanceFactory};
pub use instance::{BoundParameter, ParameterKind, RuleInstance, RuleInstanceStatus};
pub use model::{
    CumulativeType, GlobalVariable, RESULT, Rule, RuleElement, RuleParameter, RuleTemplate,
    RuleThresholds, VariableType,
};
