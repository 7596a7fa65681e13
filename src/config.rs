//! Which rules a pass runs, in which order.
//!
//! A [`PassConfig`] is plain data and round-trips through JSON:
//!
//! ```json
//! { "name": "arithmetic_simplify",
//!   "rules": ["multiply_by_zero_or_one", "add_by_zero"],
//!   "max_iterations": 100 }
//! ```

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{ConfigSnafu, Result};
use crate::language::rewrites::{
    AddByZero, AdjustAllReduceMulAdd, ConstantDuplicateMul, MultiplyByZeroOrOne,
    OptUpdateZeroTensor, PowerOneEliminate, Rule, TensorAddByZero, TensorMultiplyByOne,
    TensorMultiplyByZero,
};
use crate::optimizer::{Pass, DEFAULT_MAX_ITERATIONS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    MultiplyByZeroOrOne,
    TensorMultiplyByZero,
    TensorMultiplyByOne,
    AddByZero,
    TensorAddByZero,
    OptUpdateZeroTensor,
    ConstantDuplicateMul,
    PowerOneEliminate,
    AdjustAllReduceMulAdd,
}

impl RuleKind {
    pub fn build(self) -> Box<dyn Rule> {
        match self {
            RuleKind::MultiplyByZeroOrOne => Box::new(MultiplyByZeroOrOne::new()),
            RuleKind::TensorMultiplyByZero => Box::new(TensorMultiplyByZero::new()),
            RuleKind::TensorMultiplyByOne => Box::new(TensorMultiplyByOne::new()),
            RuleKind::AddByZero => Box::new(AddByZero::new()),
            RuleKind::TensorAddByZero => Box::new(TensorAddByZero::new()),
            RuleKind::OptUpdateZeroTensor => Box::new(OptUpdateZeroTensor::new()),
            RuleKind::ConstantDuplicateMul => Box::new(ConstantDuplicateMul::new()),
            RuleKind::PowerOneEliminate => Box::new(PowerOneEliminate::new()),
            RuleKind::AdjustAllReduceMulAdd => Box::new(AdjustAllReduceMulAdd::new()),
        }
    }
}

fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PassConfig {
    pub name: String,
    pub rules: Vec<RuleKind>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

impl PassConfig {
    pub fn new(name: &str, rules: &[RuleKind]) -> Self {
        PassConfig {
            name: name.to_string(),
            rules: rules.to_vec(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context(ConfigSnafu)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context(ConfigSnafu)
    }

    pub fn build(&self) -> Pass {
        self.rules
            .iter()
            .fold(Pass::new(&self.name), |pass, kind| {
                pass.with_boxed_rule(kind.build())
            })
            .with_max_iterations(self.max_iterations)
    }

    /// Algebraic identities on scalars and tensors, plus constant folding.
    pub fn arithmetic_simplify() -> Self {
        PassConfig::new(
            "arithmetic_simplify",
            &[
                RuleKind::MultiplyByZeroOrOne,
                RuleKind::TensorMultiplyByOne,
                RuleKind::AddByZero,
                RuleKind::TensorAddByZero,
                RuleKind::OptUpdateZeroTensor,
                RuleKind::ConstantDuplicateMul,
                RuleKind::PowerOneEliminate,
            ],
        )
    }

    /// Multiplication by zero, run once shapes are final.
    pub fn arithmetic_simplify_late() -> Self {
        PassConfig::new("arithmetic_simplify_late", &[RuleKind::TensorMultiplyByZero])
    }

    pub fn all_reduce_reorder() -> Self {
        PassConfig::new("all_reduce_reorder", &[RuleKind::AdjustAllReduceMulAdd])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [RuleKind; 9] = [
        RuleKind::MultiplyByZeroOrOne,
        RuleKind::TensorMultiplyByZero,
        RuleKind::TensorMultiplyByOne,
        RuleKind::AddByZero,
        RuleKind::TensorAddByZero,
        RuleKind::OptUpdateZeroTensor,
        RuleKind::ConstantDuplicateMul,
        RuleKind::PowerOneEliminate,
        RuleKind::AdjustAllReduceMulAdd,
    ];

    #[test]
    fn rule_names_match_config_names() {
        for kind in ALL.iter() {
            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.build().name()));
        }
    }

    #[test]
    fn max_iterations_defaults() {
        let config =
            PassConfig::from_json(r#"{"name": "p", "rules": ["power_one_eliminate"]}"#).unwrap();
        assert_eq!(config.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(config.build().rule_names(), vec!["power_one_eliminate"]);
    }

    #[test]
    fn presets_round_trip() {
        for preset in &[
            PassConfig::arithmetic_simplify(),
            PassConfig::arithmetic_simplify_late(),
            PassConfig::all_reduce_reorder(),
        ] {
            let json = preset.to_json().unwrap();
            assert_eq!(&PassConfig::from_json(&json).unwrap(), preset);
        }
    }

    #[test]
    fn unknown_rules_are_rejected() {
        match PassConfig::from_json(r#"{"name": "p", "rules": ["fold_everything"]}"#) {
            Err(crate::Error::Config { .. }) => (),
            other => panic!("{:?}", other),
        }
    }
}
