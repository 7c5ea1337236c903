use std::fmt;
use std::str::FromStr;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Balances of the three account buckets. Buckets are never negative and the
/// total is always derived, never stored.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct AccountBalances {
    pub deferred: f64,
    pub tax_free: f64,
    pub taxable: f64,
}

impl AccountBalances {
    pub fn new(deferred: f64, tax_free: f64, taxable: f64) -> Self {
        Self {
            deferred: deferred.max(0.0),
            tax_free: tax_free.max(0.0),
            taxable: taxable.max(0.0),
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn total(&self) -> f64 {
        self.deferred + self.tax_free + self.taxable
    }
}

impl Serialize for AccountBalances {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("AccountBalances", 4)?;
        state.serialize_field("deferred", &self.deferred)?;
        state.serialize_field("taxFree", &self.tax_free)?;
        state.serialize_field("taxable", &self.taxable)?;
        state.serialize_field("total", &self.total())?;
        state.end()
    }
}

/// A field collected from a person that may never have been asked, may have
/// been answered with "none", or may carry a value.
///
/// Deserializes from an optional field: a missing key stays `Unset` (with
/// `#[serde(default)]`), `null` becomes `ExplicitlyNone`.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum Answer<T> {
    #[default]
    Unset,
    ExplicitlyNone,
    Valued(T),
}

impl<T> Answer<T> {
    pub fn is_answered(&self) -> bool {
        !matches!(self, Answer::Unset)
    }
}

impl Answer<f64> {
    /// Resolves an amount: unanswered falls back to `default`, "none" is zero.
    pub fn amount_or(self, default: f64) -> f64 {
        match self {
            Answer::Unset => default,
            Answer::ExplicitlyNone => 0.0,
            Answer::Valued(v) => v,
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Answer<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(v) => Answer::Valued(v),
            None => Answer::ExplicitlyNone,
        })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
    Ab,
    Bc,
    Mb,
    Nb,
    Nl,
    Ns,
    Nt,
    Nu,
    On,
    Pe,
    Qc,
    Sk,
    Yt,
}

impl Region {
    pub fn code(self) -> &'static str {
        match self {
            Region::Ab => "AB",
            Region::Bc => "BC",
            Region::Mb => "MB",
            Region::Nb => "NB",
            Region::Nl => "NL",
            Region::Ns => "NS",
            Region::Nt => "NT",
            Region::Nu => "NU",
            Region::On => "ON",
            Region::Pe => "PE",
            Region::Qc => "QC",
            Region::Sk => "SK",
            Region::Yt => "YT",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let region = match s.trim().to_ascii_uppercase().as_str() {
            "AB" => Region::Ab,
            "BC" => Region::Bc,
            "MB" => Region::Mb,
            "NB" => Region::Nb,
            "NL" => Region::Nl,
            "NS" => Region::Ns,
            "NT" => Region::Nt,
            "NU" => Region::Nu,
            "ON" => Region::On,
            "PE" => Region::Pe,
            "QC" => Region::Qc,
            "SK" => Region::Sk,
            "YT" => Region::Yt,
            other => return Err(format!("unknown region code {other:?}")),
        };
        Ok(region)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BenefitKind {
    Cpp,
    Oas,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingLevel {
    pub from_age: u32,
    pub monthly: f64,
}

/// Spending in today's dollars.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum ExpensePlan {
    FixedMonthly(f64),
    Phased(Vec<SpendingLevel>),
}

impl ExpensePlan {
    /// Annual spending at `age` before inflation indexing. Ages before the
    /// first phase use the first phase.
    pub fn annual_at(&self, age: u32) -> f64 {
        let monthly = match self {
            ExpensePlan::FixedMonthly(monthly) => *monthly,
            ExpensePlan::Phased(levels) => levels
                .iter()
                .rev()
                .find(|level| level.from_age <= age)
                .or_else(|| levels.first())
                .map(|level| level.monthly)
                .unwrap_or(0.0),
        };
        (monthly * 12.0).max(0.0)
    }

    pub fn scaled(&self, factor: f64) -> Self {
        match self {
            ExpensePlan::FixedMonthly(monthly) => ExpensePlan::FixedMonthly(monthly * factor),
            ExpensePlan::Phased(levels) => ExpensePlan::Phased(
                levels
                    .iter()
                    .map(|level| SpendingLevel {
                        from_age: level.from_age,
                        monthly: level.monthly * factor,
                    })
                    .collect(),
            ),
        }
    }
}

/// Pre-exit annual contributions, growing each year by `growth_rate`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contributions {
    pub deferred: f64,
    pub tax_free: f64,
    pub taxable: f64,
    pub growth_rate: f64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeSources {
    /// Employer pension in today's dollars at its start age.
    pub pension_annual: f64,
    pub pension_start_age: u32,
    /// Annual pension indexation once in payment.
    pub pension_indexation: f64,
    pub other_annual: f64,
    pub other_end_age: Option<u32>,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assumptions {
    pub pre_exit_return: f64,
    pub post_exit_return: f64,
    pub inflation: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenefitElections {
    pub cpp_start_age: u32,
    pub oas_start_age: u32,
    /// Share of the maximum CPP retirement pension earned (0..=1).
    pub cpp_entitlement: f64,
    /// Share of the full OAS pension (residency-based, 0..=1).
    pub oas_entitlement: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioInputs {
    pub current_age: u32,
    pub exit_age: u32,
    pub horizon_age: u32,
    pub start_year: u32,
    pub region: Region,
    pub balances: AccountBalances,
    pub taxable_cost_basis: Option<f64>,
    pub contributions: Contributions,
    pub income: IncomeSources,
    pub expenses: ExpensePlan,
    pub assumptions: Assumptions,
    pub benefits: BenefitElections,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Accumulation,
    Retirement,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountFlows {
    pub deferred: f64,
    pub tax_free: f64,
    pub taxable: f64,
    pub total: f64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalPlan {
    pub deferred: f64,
    pub tax_free: f64,
    pub taxable: f64,
    pub total: f64,
    pub taxable_gain: f64,
    pub mandatory_minimum: f64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeBreakdown {
    pub cpp: f64,
    pub oas: f64,
    pub oas_clawback: f64,
    pub pension: f64,
    pub other: f64,
    pub withdrawals: f64,
    pub total: f64,
}

impl IncomeBreakdown {
    pub fn guaranteed(&self) -> f64 {
        self.cpp + self.oas + self.pension + self.other
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBreakdown {
    pub federal: f64,
    pub regional: f64,
    pub total: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearResult {
    pub age: u32,
    pub year: u32,
    pub phase: Phase,
    pub starting_balances: AccountBalances,
    pub ending_balances: AccountBalances,
    pub contributions: AccountFlows,
    pub withdrawals: WithdrawalPlan,
    pub income: IncomeBreakdown,
    pub taxable_income: f64,
    pub tax: TaxBreakdown,
    pub expenses: f64,
    pub surplus: f64,
    pub investment_return: f64,
    pub depleted: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculationResults {
    pub years: Vec<YearResult>,
    pub final_balance: f64,
    pub retirement_balance: f64,
    pub depletion_age: Option<u32>,
    pub sustainable: bool,
    pub lifetime_tax: f64,
    pub lifetime_cpp: f64,
    pub lifetime_oas: f64,
    pub lifetime_withdrawals: f64,
    pub first_year_after_tax_income: f64,
}
