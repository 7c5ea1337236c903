use log::debug;

use super::benefits::{
    CPP_EARLIEST_START_AGE, LATEST_START_AGE, OAS_EARLIEST_START_AGE, annual_benefit, clawback,
};
use super::error::EngineError;
use super::growth::project;
use super::minimums::mandatory_regime_active;
use super::sequencer::sequence;
use super::tables::{TaxDataProvider, TaxTables};
use super::tax::{compute_tax, taxable_income};
use super::types::{
    AccountBalances, AccountFlows, BenefitKind, CalculationResults, ExpensePlan, IncomeBreakdown,
    Phase, ScenarioInputs, TaxBreakdown, WithdrawalPlan, YearResult,
};

/// Balances at or below this are treated as exhausted.
const DEPLETION_EPSILON: f64 = 0.005;
const MAX_HORIZON_AGE: u32 = 120;

/// Mutable per-run state; seeded from the inputs and dropped with the run.
#[derive(Debug, Clone, Copy)]
struct AccountState {
    balances: AccountBalances,
    taxable_basis: Option<f64>,
    depleted: bool,
}

impl AccountState {
    fn seed(inputs: &ScenarioInputs) -> Self {
        Self {
            balances: inputs.balances,
            taxable_basis: inputs.taxable_cost_basis.map(|basis| basis.max(0.0)),
            depleted: false,
        }
    }
}

/// Runs a full projection. Validation and the single provider lookup happen
/// before the first simulated year; nothing is returned if either fails.
pub fn run_projection(
    inputs: &ScenarioInputs,
    provider: &dyn TaxDataProvider,
) -> Result<CalculationResults, EngineError> {
    validate_inputs(inputs)?;
    let tables = TaxTables::load(provider, inputs.region, inputs.start_year)?;
    Ok(project_with_tables(inputs, &tables))
}

/// Projection against an already loaded snapshot. The inputs are assumed to
/// be valid.
pub fn project_with_tables(inputs: &ScenarioInputs, tables: &TaxTables) -> CalculationResults {
    let mut state = AccountState::seed(inputs);
    let mut years = Vec::with_capacity(
        (inputs.horizon_age.saturating_sub(inputs.current_age) + 1) as usize,
    );
    let mut depletion_age = None;

    for age in inputs.current_age..=inputs.horizon_age {
        let (mut year, next) = simulate_year(inputs, tables, &state, age);
        state = next;

        if state.depleted {
            state.balances = AccountBalances::zero();
            year.ending_balances = AccountBalances::zero();
        } else if year.phase == Phase::Retirement
            && year.ending_balances.total() <= DEPLETION_EPSILON
            && (year.starting_balances.total() > DEPLETION_EPSILON || year.surplus < 0.0)
        {
            debug!("portfolio depleted at age {age}");
            depletion_age = Some(age);
            state.depleted = true;
            state.balances = AccountBalances::zero();
            year.ending_balances = AccountBalances::zero();
        }
        year.depleted = state.depleted;

        debug!(
            "age {age}: start {:.2} end {:.2} withdrawn {:.2} tax {:.2}",
            year.starting_balances.total(),
            year.ending_balances.total(),
            year.withdrawals.total,
            year.tax.total
        );
        years.push(year);
    }

    summarize(years, inputs.exit_age, depletion_age)
}

fn summarize(
    years: Vec<YearResult>,
    exit_age: u32,
    depletion_age: Option<u32>,
) -> CalculationResults {
    let final_balance = years
        .last()
        .map(|y| y.ending_balances.total())
        .unwrap_or(0.0);
    let retirement_balance = years
        .iter()
        .find(|y| y.age == exit_age)
        .map(|y| y.starting_balances.total())
        .unwrap_or(0.0);
    let first_year_after_tax_income = years
        .iter()
        .find(|y| y.phase == Phase::Retirement)
        .map(|y| y.income.total - y.tax.total)
        .unwrap_or(0.0);

    CalculationResults {
        final_balance,
        retirement_balance,
        depletion_age,
        sustainable: depletion_age.is_none(),
        lifetime_tax: years.iter().map(|y| y.tax.total).sum(),
        lifetime_cpp: years.iter().map(|y| y.income.cpp).sum(),
        lifetime_oas: years.iter().map(|y| y.income.oas).sum(),
        lifetime_withdrawals: years.iter().map(|y| y.withdrawals.total).sum(),
        first_year_after_tax_income,
        years,
    }
}

fn simulate_year(
    inputs: &ScenarioInputs,
    tables: &TaxTables,
    state: &AccountState,
    age: u32,
) -> (YearResult, AccountState) {
    if age < inputs.exit_age {
        accumulation_year(inputs, tables, state, age)
    } else {
        retirement_year(inputs, tables, state, age)
    }
}

fn years_since_start(inputs: &ScenarioInputs, age: u32) -> u32 {
    age.saturating_sub(inputs.current_age)
}

fn price_index(inputs: &ScenarioInputs, age: u32) -> f64 {
    (1.0 + inputs.assumptions.inflation).powi(years_since_start(inputs, age) as i32)
}

fn accumulation_year(
    inputs: &ScenarioInputs,
    tables: &TaxTables,
    state: &AccountState,
    age: u32,
) -> (YearResult, AccountState) {
    let start = state.balances;
    let index = price_index(inputs, age);
    let multiplier =
        (1.0 + inputs.contributions.growth_rate).powi(years_since_start(inputs, age) as i32);
    let deferred_in = (inputs.contributions.deferred * multiplier).max(0.0);
    let tax_free_in = (inputs.contributions.tax_free * multiplier).max(0.0);
    let taxable_in = (inputs.contributions.taxable * multiplier).max(0.0);
    let contributions = AccountFlows {
        deferred: deferred_in,
        tax_free: tax_free_in,
        taxable: taxable_in,
        total: deferred_in + tax_free_in + taxable_in,
    };

    // Still working past the conversion age: only the mandatory minimum leaves.
    let (withdrawals, tax) = if mandatory_regime_active(&tables.rrif, age) {
        let plan = sequence(0.0, &start, age, state.taxable_basis, &tables.rrif);
        let eligible = if age >= tables.benefits.eligibility_age {
            plan.deferred
        } else {
            0.0
        };
        let tax = compute_tax(plan.deferred, eligible, age, tables, index);
        (plan, tax)
    } else {
        (WithdrawalPlan::default(), TaxBreakdown::default())
    };

    let rate = inputs.assumptions.pre_exit_return;
    let deferred = project(start.deferred, contributions.deferred, withdrawals.deferred, rate);
    let tax_free = project(start.tax_free, contributions.tax_free, 0.0, rate);
    let taxable = project(start.taxable, contributions.taxable, 0.0, rate);
    let ending = AccountBalances::new(
        deferred.ending_balance,
        tax_free.ending_balance,
        taxable.ending_balance,
    );

    let income = IncomeBreakdown {
        withdrawals: withdrawals.total,
        total: withdrawals.total,
        ..IncomeBreakdown::default()
    };
    let taxable_income = withdrawals.deferred;

    let year = YearResult {
        age,
        year: inputs.start_year + years_since_start(inputs, age),
        phase: Phase::Accumulation,
        starting_balances: start,
        ending_balances: ending,
        contributions,
        withdrawals,
        income,
        taxable_income,
        tax,
        expenses: 0.0,
        surplus: income.total - tax.total,
        investment_return: deferred.investment_return
            + tax_free.investment_return
            + taxable.investment_return,
        depleted: state.depleted,
    };

    let next = AccountState {
        balances: ending,
        taxable_basis: state
            .taxable_basis
            .map(|basis| basis + contributions.taxable),
        depleted: state.depleted,
    };
    (year, next)
}

fn pension_income(inputs: &ScenarioInputs, age: u32) -> f64 {
    let income = &inputs.income;
    if income.pension_annual <= 0.0 || age < income.pension_start_age {
        return 0.0;
    }
    let at_start = income.pension_annual * price_index(inputs, income.pension_start_age);
    at_start * (1.0 + income.pension_indexation).powi((age - income.pension_start_age) as i32)
}

fn other_income(inputs: &ScenarioInputs, age: u32) -> f64 {
    let income = &inputs.income;
    if income.other_end_age.is_some_and(|end| age >= end) {
        return 0.0;
    }
    (income.other_annual * price_index(inputs, age)).max(0.0)
}

fn retirement_year(
    inputs: &ScenarioInputs,
    tables: &TaxTables,
    state: &AccountState,
    age: u32,
) -> (YearResult, AccountState) {
    let start = state.balances;
    let index = price_index(inputs, age);
    let expenses = inputs.expenses.annual_at(age) * index;

    let cpp = annual_benefit(BenefitKind::Cpp, &inputs.benefits, &tables.benefits, age, index);
    let oas_gross = annual_benefit(BenefitKind::Oas, &inputs.benefits, &tables.benefits, age, index);
    let pension = pension_income(inputs, age);
    let other = other_income(inputs, age);

    let target = (expenses - (cpp + oas_gross + pension + other)).max(0.0);
    let withdrawals = sequence(target, &start, age, state.taxable_basis, &tables.rrif);

    // The clawback is tested on net income including the gross benefit.
    let mut income = IncomeBreakdown {
        cpp,
        oas: oas_gross,
        oas_clawback: 0.0,
        pension,
        other,
        withdrawals: withdrawals.total,
        total: 0.0,
    };
    let clawback_base = taxable_income(&withdrawals, &income, tables.capital_gains_inclusion);
    let oas = clawback(
        oas_gross,
        clawback_base,
        &tables.benefits.oas_clawback.indexed(index),
    );
    income.oas = oas;
    income.oas_clawback = oas_gross - oas;
    income.total = income.guaranteed() + withdrawals.total;

    let taxable_income = taxable_income(&withdrawals, &income, tables.capital_gains_inclusion);
    let eligible_pension_income = pension
        + if age >= tables.benefits.eligibility_age {
            withdrawals.deferred
        } else {
            0.0
        };
    let tax = compute_tax(taxable_income, eligible_pension_income, age, tables, index);

    let rate = inputs.assumptions.post_exit_return;
    let deferred = project(start.deferred, 0.0, withdrawals.deferred, rate);
    let tax_free = project(start.tax_free, 0.0, withdrawals.tax_free, rate);
    let taxable = project(start.taxable, 0.0, withdrawals.taxable, rate);
    let ending = AccountBalances::new(
        deferred.ending_balance,
        tax_free.ending_balance,
        taxable.ending_balance,
    );

    let taxable_basis = state.taxable_basis.map(|basis| {
        if start.taxable <= 0.0 {
            basis
        } else {
            (basis * (1.0 - withdrawals.taxable / start.taxable)).max(0.0)
        }
    });

    let year = YearResult {
        age,
        year: inputs.start_year + years_since_start(inputs, age),
        phase: Phase::Retirement,
        starting_balances: start,
        ending_balances: ending,
        contributions: AccountFlows::default(),
        withdrawals,
        income,
        taxable_income,
        tax,
        expenses,
        surplus: income.total - tax.total - expenses,
        investment_return: deferred.investment_return
            + tax_free.investment_return
            + taxable.investment_return,
        depleted: state.depleted,
    };

    let next = AccountState {
        balances: ending,
        taxable_basis,
        depleted: state.depleted,
    };
    (year, next)
}

fn check_rate(name: &str, rate: f64) -> Result<(), EngineError> {
    if !rate.is_finite() || rate <= -1.0 {
        return Err(EngineError::InvalidScenario(format!(
            "{name} must be a finite rate above -100%"
        )));
    }
    Ok(())
}

fn check_amount(name: &str, amount: f64) -> Result<(), EngineError> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(EngineError::InvalidScenario(format!("{name} must be >= 0")));
    }
    Ok(())
}

/// Structural checks; run before any simulation step.
pub fn validate_inputs(inputs: &ScenarioInputs) -> Result<(), EngineError> {
    let invalid = |msg: &str| -> Result<(), EngineError> {
        Err(EngineError::InvalidScenario(msg.to_string()))
    };

    if inputs.exit_age <= inputs.current_age {
        return invalid("exit age must be after current age");
    }
    if inputs.horizon_age <= inputs.exit_age {
        return invalid("horizon age must be after exit age");
    }
    if inputs.horizon_age > MAX_HORIZON_AGE {
        return invalid("horizon age must be <= 120");
    }

    check_amount("deferred balance", inputs.balances.deferred)?;
    check_amount("tax-free balance", inputs.balances.tax_free)?;
    check_amount("taxable balance", inputs.balances.taxable)?;
    if let Some(basis) = inputs.taxable_cost_basis {
        check_amount("taxable cost basis", basis)?;
    }

    check_amount("deferred contribution", inputs.contributions.deferred)?;
    check_amount("tax-free contribution", inputs.contributions.tax_free)?;
    check_amount("taxable contribution", inputs.contributions.taxable)?;
    check_rate("contribution growth", inputs.contributions.growth_rate)?;

    check_amount("pension income", inputs.income.pension_annual)?;
    check_amount("other income", inputs.income.other_annual)?;
    check_rate("pension indexation", inputs.income.pension_indexation)?;

    check_rate("pre-exit return", inputs.assumptions.pre_exit_return)?;
    check_rate("post-exit return", inputs.assumptions.post_exit_return)?;
    check_rate("inflation", inputs.assumptions.inflation)?;

    let benefits = &inputs.benefits;
    if !(CPP_EARLIEST_START_AGE..=LATEST_START_AGE).contains(&benefits.cpp_start_age) {
        return invalid("CPP start age must be between 60 and 70");
    }
    if !(OAS_EARLIEST_START_AGE..=LATEST_START_AGE).contains(&benefits.oas_start_age) {
        return invalid("OAS start age must be between 65 and 70");
    }
    if !(0.0..=1.0).contains(&benefits.cpp_entitlement)
        || !(0.0..=1.0).contains(&benefits.oas_entitlement)
    {
        return invalid("benefit entitlements must be between 0 and 1");
    }

    match &inputs.expenses {
        ExpensePlan::FixedMonthly(monthly) => check_amount("monthly expenses", *monthly)?,
        ExpensePlan::Phased(levels) => {
            if levels.is_empty() {
                return invalid("phased expense plan needs at least one level");
            }
            for level in levels {
                check_amount("monthly expenses", level.monthly)?;
            }
            if levels.windows(2).any(|w| w[0].from_age >= w[1].from_age) {
                return invalid("expense levels must be in increasing age order");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::TaxDataError;
    use crate::core::minimums::minimum_percentage;
    use crate::core::tables::{
        BenefitAmounts, BundledTaxData, JurisdictionSchedule, RrifSchedule,
    };
    use crate::core::types::{
        Assumptions, BenefitElections, Contributions, IncomeSources, Region, SpendingLevel,
    };
    use proptest::prelude::{prop_assert, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn sample_inputs() -> ScenarioInputs {
        ScenarioInputs {
            current_age: 55,
            exit_age: 62,
            horizon_age: 95,
            start_year: 2024,
            region: Region::On,
            balances: AccountBalances::new(400_000.0, 90_000.0, 120_000.0),
            taxable_cost_basis: Some(80_000.0),
            contributions: Contributions {
                deferred: 15_000.0,
                tax_free: 7_000.0,
                taxable: 5_000.0,
                growth_rate: 0.0,
            },
            income: IncomeSources {
                pension_annual: 12_000.0,
                pension_start_age: 62,
                pension_indexation: 0.0,
                other_annual: 0.0,
                other_end_age: None,
            },
            expenses: ExpensePlan::FixedMonthly(5_000.0),
            assumptions: Assumptions {
                pre_exit_return: 0.06,
                post_exit_return: 0.05,
                inflation: 0.02,
            },
            benefits: BenefitElections {
                cpp_start_age: 65,
                oas_start_age: 65,
                cpp_entitlement: 0.8,
                oas_entitlement: 1.0,
            },
        }
    }

    /// Everything flat and zero so hand calculations stay small.
    fn oracle_inputs() -> ScenarioInputs {
        let mut inputs = sample_inputs();
        inputs.taxable_cost_basis = None;
        inputs.contributions = Contributions::default();
        inputs.income = IncomeSources::default();
        inputs.assumptions = Assumptions {
            pre_exit_return: 0.0,
            post_exit_return: 0.0,
            inflation: 0.0,
        };
        inputs.benefits.cpp_entitlement = 0.0;
        inputs.benefits.oas_entitlement = 0.0;
        inputs
    }

    fn run(inputs: &ScenarioInputs) -> CalculationResults {
        run_projection(inputs, &BundledTaxData).expect("valid projection")
    }

    struct FailingProvider;

    impl TaxDataProvider for FailingProvider {
        fn latest_year(&self) -> u32 {
            2024
        }
        fn federal_schedule(&self, _year: u32) -> Result<JurisdictionSchedule, TaxDataError> {
            Err(TaxDataError::Unavailable("cache offline".to_string()))
        }
        fn regional_schedule(
            &self,
            region: Region,
            year: u32,
        ) -> Result<JurisdictionSchedule, TaxDataError> {
            BundledTaxData.regional_schedule(region, year)
        }
        fn benefit_amounts(&self, year: u32) -> Result<BenefitAmounts, TaxDataError> {
            BundledTaxData.benefit_amounts(year)
        }
        fn capital_gains_inclusion(&self, year: u32) -> Result<f64, TaxDataError> {
            BundledTaxData.capital_gains_inclusion(year)
        }
        fn rrif_schedule(&self) -> Result<RrifSchedule, TaxDataError> {
            BundledTaxData.rrif_schedule()
        }
    }

    #[test]
    fn produces_one_year_per_age_inclusive() {
        let inputs = sample_inputs();
        let results = run(&inputs);
        assert_eq!(results.years.len(), (95 - 55 + 1) as usize);
        assert_eq!(results.years[0].age, 55);
        assert_eq!(results.years[0].year, 2024);
        assert_eq!(results.years.last().map(|y| y.age), Some(95));
        assert_eq!(results.years.last().map(|y| y.year), Some(2064));
        assert!(results.years[..7].iter().all(|y| y.phase == Phase::Accumulation));
        assert!(results.years[7..].iter().all(|y| y.phase == Phase::Retirement));
    }

    #[test]
    fn rejects_exit_not_after_current_age() {
        let mut inputs = sample_inputs();
        inputs.exit_age = inputs.current_age;
        let err = run_projection(&inputs, &BundledTaxData).unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidScenario("exit age must be after current age".to_string())
        );
    }

    #[test]
    fn rejects_horizon_not_after_exit_age() {
        let mut inputs = sample_inputs();
        inputs.horizon_age = inputs.exit_age;
        let err = run_projection(&inputs, &BundledTaxData).unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidScenario("horizon age must be after exit age".to_string())
        );
    }

    #[test]
    fn rejects_unordered_expense_levels() {
        let mut inputs = sample_inputs();
        inputs.expenses = ExpensePlan::Phased(vec![
            SpendingLevel {
                from_age: 75,
                monthly: 4_000.0,
            },
            SpendingLevel {
                from_age: 62,
                monthly: 6_000.0,
            },
        ]);
        assert!(matches!(
            run_projection(&inputs, &BundledTaxData),
            Err(EngineError::InvalidScenario(_))
        ));
    }

    #[test]
    fn rejects_out_of_window_benefit_ages() {
        let mut inputs = sample_inputs();
        inputs.benefits.oas_start_age = 63;
        assert!(matches!(
            run_projection(&inputs, &BundledTaxData),
            Err(EngineError::InvalidScenario(_))
        ));
    }

    #[test]
    fn provider_failure_is_fatal() {
        let err = run_projection(&sample_inputs(), &FailingProvider).unwrap_err();
        assert_eq!(
            err,
            EngineError::TaxData(TaxDataError::Unavailable("cache offline".to_string()))
        );
    }

    #[test]
    fn unsupported_region_is_fatal() {
        let mut inputs = sample_inputs();
        inputs.region = Region::Yt;
        assert!(matches!(
            run_projection(&inputs, &BundledTaxData),
            Err(EngineError::TaxData(TaxDataError::UnknownRegion(_)))
        ));
    }

    #[test]
    fn oracle_accumulation_contributes_then_grows() {
        let mut inputs = oracle_inputs();
        inputs.current_age = 60;
        inputs.exit_age = 62;
        inputs.horizon_age = 63;
        inputs.balances = AccountBalances::new(100.0, 50.0, 20.0);
        inputs.contributions = Contributions {
            deferred: 10.0,
            tax_free: 5.0,
            taxable: 2.0,
            growth_rate: 0.0,
        };
        inputs.assumptions.pre_exit_return = 0.10;
        inputs.expenses = ExpensePlan::FixedMonthly(0.0);

        // Deferred: ((100 + 10) * 1.1 + 10) * 1.1 = 144.1
        // Tax-free: ((50 + 5) * 1.1 + 5) * 1.1 = 72.05
        // Taxable: ((20 + 2) * 1.1 + 2) * 1.1 = 28.82
        let results = run(&inputs);
        let at_exit = &results.years[2];
        assert_eq!(at_exit.age, 62);
        assert_approx(at_exit.starting_balances.deferred, 144.1);
        assert_approx(at_exit.starting_balances.tax_free, 72.05);
        assert_approx(at_exit.starting_balances.taxable, 28.82);
        assert_approx(results.retirement_balance, 244.97);
        assert_approx(results.years[0].contributions.total, 17.0);
        assert_approx(results.years[0].tax.total, 0.0);
    }

    #[test]
    fn oracle_retirement_year_draws_taxable_then_deferred() {
        let mut inputs = oracle_inputs();
        inputs.current_age = 60;
        inputs.exit_age = 61;
        inputs.horizon_age = 62;
        inputs.balances = AccountBalances::new(100_000.0, 50_000.0, 10_000.0);
        inputs.expenses = ExpensePlan::FixedMonthly(2_000.0);

        // Need 24_000: all 10_000 of taxable, then 14_000 of deferred.
        let results = run(&inputs);
        let first = &results.years[1];
        assert_approx(first.withdrawals.taxable, 10_000.0);
        assert_approx(first.withdrawals.deferred, 14_000.0);
        assert_approx(first.withdrawals.tax_free, 0.0);
        assert_approx(first.withdrawals.taxable_gain, 5_000.0);
        // 14_000 + 5_000 * 50% = 16_500 taxable income
        assert_approx(first.taxable_income, 16_500.0);
        assert_approx(first.ending_balances.deferred, 86_000.0);
        assert_approx(first.ending_balances.taxable, 0.0);
        assert_approx(first.ending_balances.tax_free, 50_000.0);
        assert_approx(first.surplus, -first.tax.total);
    }

    #[test]
    fn guaranteed_income_reduces_the_portfolio_draw() {
        let mut inputs = oracle_inputs();
        inputs.current_age = 64;
        inputs.exit_age = 65;
        inputs.horizon_age = 66;
        inputs.balances = AccountBalances::new(200_000.0, 0.0, 0.0);
        inputs.expenses = ExpensePlan::FixedMonthly(3_000.0);
        inputs.income.pension_annual = 10_000.0;
        inputs.income.pension_start_age = 65;
        inputs.benefits.cpp_entitlement = 1.0;
        inputs.benefits.oas_entitlement = 1.0;

        let results = run(&inputs);
        let first = &results.years[1];
        let guaranteed = 16_375.20 + 8_560.08 + 10_000.0;
        assert_approx(first.income.cpp, 16_375.20);
        assert_approx(first.income.oas, 8_560.08);
        assert_approx(first.income.pension, 10_000.0);
        assert_approx(first.withdrawals.deferred, 36_000.0 - guaranteed);
    }

    #[test]
    fn phased_spending_changes_at_trigger_age() {
        let mut inputs = oracle_inputs();
        inputs.current_age = 60;
        inputs.exit_age = 61;
        inputs.horizon_age = 64;
        inputs.balances = AccountBalances::new(0.0, 500_000.0, 0.0);
        inputs.expenses = ExpensePlan::Phased(vec![
            SpendingLevel {
                from_age: 61,
                monthly: 5_000.0,
            },
            SpendingLevel {
                from_age: 63,
                monthly: 3_000.0,
            },
        ]);
        inputs.assumptions.inflation = 0.10;

        let results = run(&inputs);
        // index at 61 is 1.1, at 63 is 1.1^3
        assert_approx(results.years[1].expenses, 60_000.0 * 1.1);
        assert_approx(results.years[2].expenses, 60_000.0 * 1.21);
        assert_approx(results.years[3].expenses, 36_000.0 * 1.331);
        assert_approx(results.years[3].withdrawals.tax_free, 36_000.0 * 1.331);
    }

    #[test]
    fn mandatory_minimum_forces_larger_withdrawal_than_need() {
        let mut inputs = oracle_inputs();
        inputs.current_age = 70;
        inputs.exit_age = 71;
        inputs.horizon_age = 73;
        inputs.balances = AccountBalances::new(500_000.0, 100_000.0, 200_000.0);
        inputs.expenses = ExpensePlan::FixedMonthly(20_000.0 / 12.0);

        let results = run(&inputs);
        let year = &results.years[1];
        assert_eq!(year.age, 71);
        assert_approx(year.withdrawals.deferred, 500_000.0 * 0.0528);
        assert_approx(year.withdrawals.taxable, 0.0);
        assert_approx(year.withdrawals.tax_free, 0.0);
        assert!(year.surplus > 0.0);
    }

    #[test]
    fn late_exit_still_takes_the_minimum_before_exit() {
        let mut inputs = oracle_inputs();
        inputs.current_age = 70;
        inputs.exit_age = 73;
        inputs.horizon_age = 75;
        inputs.balances = AccountBalances::new(1_000_000.0, 0.0, 0.0);
        inputs.expenses = ExpensePlan::FixedMonthly(1_000.0);

        let results = run(&inputs);
        assert_approx(results.years[0].withdrawals.deferred, 0.0);
        let at_71 = &results.years[1];
        assert_eq!(at_71.phase, Phase::Accumulation);
        assert_approx(at_71.withdrawals.deferred, 1_000_000.0 * 0.0528);
        assert!(at_71.tax.total > 0.0);
    }

    #[test]
    fn depletion_is_recorded_once_and_never_resurrects() {
        let mut inputs = oracle_inputs();
        inputs.current_age = 60;
        inputs.exit_age = 61;
        inputs.horizon_age = 80;
        inputs.balances = AccountBalances::new(30_000.0, 20_000.0, 10_000.0);
        inputs.expenses = ExpensePlan::FixedMonthly(2_000.0);
        // Large guaranteed income later on must not refill the portfolio.
        inputs.income.pension_annual = 60_000.0;
        inputs.income.pension_start_age = 70;

        let results = run(&inputs);
        // 60_000 at 24_000 a year: 24k, 24k, 12k -> empty at 63
        assert_eq!(results.depletion_age, Some(63));
        assert!(!results.sustainable);
        for year in results.years.iter().filter(|y| y.age >= 63) {
            assert!(year.depleted);
            assert_eq!(year.ending_balances.total(), 0.0);
        }
        assert!(results.years.iter().filter(|y| y.age >= 70).all(|y| y.surplus > 0.0));
        assert_eq!(results.final_balance, 0.0);
    }

    #[test]
    fn zero_assets_with_covered_spending_is_not_depletion() {
        let mut inputs = oracle_inputs();
        inputs.current_age = 60;
        inputs.exit_age = 61;
        inputs.horizon_age = 70;
        inputs.balances = AccountBalances::zero();
        inputs.expenses = ExpensePlan::FixedMonthly(1_000.0);
        inputs.income.pension_annual = 20_000.0;
        inputs.income.pension_start_age = 61;

        let results = run(&inputs);
        assert_eq!(results.depletion_age, None);
        assert!(results.sustainable);
    }

    #[test]
    fn oas_clawback_applies_to_high_income() {
        let mut inputs = oracle_inputs();
        inputs.current_age = 66;
        inputs.exit_age = 67;
        inputs.horizon_age = 68;
        inputs.balances = AccountBalances::new(0.0, 0.0, 0.0);
        inputs.income.pension_annual = 120_000.0;
        inputs.income.pension_start_age = 67;
        inputs.benefits.oas_entitlement = 1.0;
        inputs.expenses = ExpensePlan::FixedMonthly(1_000.0);

        let results = run(&inputs);
        let year = &results.years[1];
        // (120_000 + 8_560.08 - 90_997) * 15% = 5_634.46 clawed back
        let clawed = (120_000.0 + 8_560.08 - 90_997.0) * 0.15;
        assert_approx(year.income.oas_clawback, clawed);
        assert_approx(year.income.oas, 8_560.08 - clawed);
        // Tax is on the OAS actually kept.
        assert_approx(year.taxable_income, 120_000.0 + 8_560.08 - clawed);
        assert_approx(results.lifetime_oas, year.income.oas + results.years[2].income.oas);
    }

    #[test]
    fn aggregates_sum_the_years() {
        let results = run(&sample_inputs());
        let tax: f64 = results.years.iter().map(|y| y.tax.total).sum();
        let cpp: f64 = results.years.iter().map(|y| y.income.cpp).sum();
        assert_approx_tol(results.lifetime_tax, tax, 1e-6);
        assert_approx_tol(results.lifetime_cpp, cpp, 1e-6);
        let first_retired = results
            .years
            .iter()
            .find(|y| y.phase == Phase::Retirement)
            .expect("retirement year");
        assert_approx(
            results.first_year_after_tax_income,
            first_retired.income.total - first_retired.tax.total,
        );
        assert_approx(
            results.final_balance,
            results.years.last().map(|y| y.ending_balances.total()).unwrap_or(-1.0),
        );
    }

    #[test]
    fn unvalidated_inverted_ages_produce_no_years() {
        let mut inputs = sample_inputs();
        inputs.current_age = 80;
        inputs.horizon_age = 70;
        let tables = TaxTables::load(&BundledTaxData, inputs.region, inputs.start_year)
            .expect("bundled tables");
        let results = project_with_tables(&inputs, &tables);
        assert!(results.years.is_empty());
        assert_eq!(results.final_balance, 0.0);
    }

    #[test]
    fn identical_inputs_produce_bit_identical_results() {
        let inputs = sample_inputs();
        let a = run(&inputs);
        let b = run(&inputs);
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).expect("serialize"),
            serde_json::to_string(&b).expect("serialize")
        );
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(48))]

        #[test]
        fn prop_balances_stay_consistent_and_minimums_hold(
            current_age in 40u32..75,
            exit_offset in 1u32..15,
            horizon_offset in 1u32..30,
            deferred in 0u32..1_500_000,
            tax_free in 0u32..300_000,
            taxable in 0u32..500_000,
            monthly in 0u32..12_000,
            pre_bp in -500i32..1_200,
            post_bp in -500i32..1_000,
            inflation_bp in 0u32..500,
            cpp_age in 60u32..71,
            oas_age in 65u32..71
        ) {
            let mut inputs = sample_inputs();
            inputs.current_age = current_age;
            inputs.exit_age = current_age + exit_offset;
            inputs.horizon_age = (inputs.exit_age + horizon_offset).min(120);
            prop_assert!(validate_inputs(&inputs).is_ok());
            inputs.balances = AccountBalances::new(deferred as f64, tax_free as f64, taxable as f64);
            inputs.taxable_cost_basis = Some(taxable as f64 * 0.6);
            inputs.expenses = ExpensePlan::FixedMonthly(monthly as f64);
            inputs.assumptions = Assumptions {
                pre_exit_return: pre_bp as f64 / 10_000.0,
                post_exit_return: post_bp as f64 / 10_000.0,
                inflation: inflation_bp as f64 / 10_000.0,
            };
            inputs.benefits.cpp_start_age = cpp_age;
            inputs.benefits.oas_start_age = oas_age;
            inputs.income.pension_start_age = inputs.exit_age;

            let schedule = BundledTaxData.rrif_schedule().expect("schedule");
            let results = run(&inputs);
            for year in &results.years {
                for balances in [year.starting_balances, year.ending_balances] {
                    prop_assert!(balances.deferred >= 0.0);
                    prop_assert!(balances.tax_free >= 0.0);
                    prop_assert!(balances.taxable >= 0.0);
                    let sum = balances.deferred + balances.tax_free + balances.taxable;
                    prop_assert!((balances.total() - sum).abs() <= 1e-6);
                }
                prop_assert!(year.withdrawals.total >= 0.0);
                prop_assert!(year.tax.total >= 0.0);
                if mandatory_regime_active(&schedule, year.age) {
                    let floor = year.starting_balances.deferred * minimum_percentage(&schedule, year.age);
                    prop_assert!(year.withdrawals.deferred + 1e-6 >= floor);
                }
            }
        }

        #[test]
        fn prop_larger_starting_balance_never_ends_lower(
            deferred in 0u32..800_000,
            tax_free in 0u32..200_000,
            taxable in 0u32..300_000,
            extra in 1u32..300_000,
            bucket in 0usize..3,
            monthly in 1_000u32..10_000,
            post_bp in -300i32..800
        ) {
            let mut baseline = sample_inputs();
            baseline.balances = AccountBalances::new(deferred as f64, tax_free as f64, taxable as f64);
            baseline.expenses = ExpensePlan::FixedMonthly(monthly as f64);
            baseline.assumptions.post_exit_return = post_bp as f64 / 10_000.0;

            let mut richer = baseline.clone();
            match bucket {
                0 => richer.balances.deferred += extra as f64,
                1 => richer.balances.tax_free += extra as f64,
                _ => richer.balances.taxable += extra as f64,
            }

            let base = run(&baseline);
            let more = run(&richer);
            prop_assert!(more.final_balance + 1e-6 >= base.final_balance);
        }
    }
}
