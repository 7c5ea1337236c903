mod benefits;
mod engine;
mod error;
mod growth;
mod minimums;
mod sequencer;
mod tables;
mod tax;
mod types;
mod variant;

pub use benefits::{adjustment_factor, annual_benefit, clawback};
pub use engine::{project_with_tables, run_projection, validate_inputs};
pub use error::{EngineError, TaxDataError};
pub use growth::{GrowthOutcome, project};
pub use minimums::{mandatory_minimum, mandatory_regime_active, minimum_percentage};
pub use sequencer::{DEFAULT_GAIN_FRACTION, gain_fraction, sequence};
pub use tables::{
    BenefitAmounts, BundledTaxData, ClawbackThresholds, CreditDefinitions, JurisdictionSchedule,
    RrifSchedule, TaxBracket, TaxDataProvider, TaxTables,
};
pub use tax::{compute_tax, progressive_tax, taxable_income};
pub use types::{
    AccountBalances, AccountFlows, Answer, Assumptions, BenefitElections, BenefitKind,
    CalculationResults, Contributions, ExpensePlan, IncomeBreakdown, IncomeSources, Phase,
    Region, ScenarioInputs, SpendingLevel, TaxBreakdown, WithdrawalPlan, YearResult,
};
pub use variant::{VariantSpec, build_variant};
