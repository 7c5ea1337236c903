//! What-if scenarios derived from a baseline. The engine never sees a variant
//! as anything other than another set of inputs.

use serde::{Deserialize, Serialize};

use super::types::{ExpensePlan, ScenarioInputs};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum VariantSpec {
    /// Multiply every spending level, e.g. 0.9 for ten percent less.
    #[serde(rename_all = "camelCase")]
    ScaleSpending { factor: f64 },
    #[serde(rename_all = "camelCase")]
    ReplaceExpenses { plan: ExpensePlan },
    #[serde(rename_all = "camelCase")]
    BenefitStartAges {
        cpp_start_age: Option<u32>,
        oas_start_age: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    ExitAge { exit_age: u32 },
    /// Rates as ratios, e.g. 0.05.
    #[serde(rename_all = "camelCase")]
    Returns {
        pre_exit_return: Option<f64>,
        post_exit_return: Option<f64>,
    },
}

impl VariantSpec {
    pub fn label(&self) -> String {
        match self {
            VariantSpec::ScaleSpending { factor } => {
                format!("spending x{factor:.2}")
            }
            VariantSpec::ReplaceExpenses { .. } => "alternate spending plan".to_string(),
            VariantSpec::BenefitStartAges {
                cpp_start_age,
                oas_start_age,
            } => {
                let mut parts = Vec::new();
                if let Some(age) = cpp_start_age {
                    parts.push(format!("CPP at {age}"));
                }
                if let Some(age) = oas_start_age {
                    parts.push(format!("OAS at {age}"));
                }
                if parts.is_empty() {
                    "unchanged benefits".to_string()
                } else {
                    parts.join(", ")
                }
            }
            VariantSpec::ExitAge { exit_age } => format!("retire at {exit_age}"),
            VariantSpec::Returns { .. } => "alternate returns".to_string(),
        }
    }
}

/// Builds a modified copy of `baseline`; the baseline is left untouched.
/// Moving the exit age also moves an employer pension that started at the old
/// exit age.
pub fn build_variant(baseline: &ScenarioInputs, spec: &VariantSpec) -> ScenarioInputs {
    let mut inputs = baseline.clone();
    match spec {
        VariantSpec::ScaleSpending { factor } => {
            inputs.expenses = baseline.expenses.scaled(factor.max(0.0));
        }
        VariantSpec::ReplaceExpenses { plan } => {
            inputs.expenses = plan.clone();
        }
        VariantSpec::BenefitStartAges {
            cpp_start_age,
            oas_start_age,
        } => {
            if let Some(age) = cpp_start_age {
                inputs.benefits.cpp_start_age = *age;
            }
            if let Some(age) = oas_start_age {
                inputs.benefits.oas_start_age = *age;
            }
        }
        VariantSpec::ExitAge { exit_age } => {
            if baseline.income.pension_start_age == baseline.exit_age {
                inputs.income.pension_start_age = *exit_age;
            }
            inputs.exit_age = *exit_age;
        }
        VariantSpec::Returns {
            pre_exit_return,
            post_exit_return,
        } => {
            if let Some(rate) = pre_exit_return {
                inputs.assumptions.pre_exit_return = *rate;
            }
            if let Some(rate) = post_exit_return {
                inputs.assumptions.post_exit_return = *rate;
            }
        }
    }
    inputs
}
