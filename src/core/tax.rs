use super::tables::{JurisdictionSchedule, TaxBracket, TaxTables};
use super::types::{IncomeBreakdown, TaxBreakdown, WithdrawalPlan};

/// Tax on `income` with each slice taxed at its bracket's marginal rate.
/// Brackets must be ordered by threshold.
pub fn progressive_tax(income: f64, brackets: &[TaxBracket]) -> f64 {
    if income <= 0.0 {
        return 0.0;
    }

    let mut tax = 0.0;
    for (i, bracket) in brackets.iter().enumerate() {
        if income <= bracket.threshold {
            break;
        }
        let upper = brackets
            .get(i + 1)
            .map(|next| next.threshold)
            .unwrap_or(f64::INFINITY);
        tax += (income.min(upper) - bracket.threshold) * bracket.rate;
    }
    tax
}

/// Age amount after the income test.
pub fn age_amount(schedule: &JurisdictionSchedule, net_income: f64) -> f64 {
    let credits = &schedule.credits;
    let excess = (net_income - credits.age_amount_threshold).max(0.0);
    (credits.age_amount - excess * credits.age_amount_reduction_rate).max(0.0)
}

/// Liability for one jurisdiction after non-refundable credits, which are
/// valued at the lowest bracket rate.
pub fn jurisdiction_tax(
    taxable_income: f64,
    eligible_pension_income: f64,
    age: u32,
    eligibility_age: u32,
    schedule: &JurisdictionSchedule,
) -> f64 {
    let gross = progressive_tax(taxable_income, &schedule.brackets);

    let mut credit_base = schedule.credits.basic_personal_amount;
    if age >= eligibility_age {
        credit_base += age_amount(schedule, taxable_income);
        credit_base += eligible_pension_income
            .max(0.0)
            .min(schedule.credits.pension_income_amount);
    }

    (gross - credit_base * schedule.lowest_rate()).max(0.0)
}

/// Federal and regional tax for one year. `index` scales the base-year
/// thresholds and credit amounts.
pub fn compute_tax(
    taxable_income: f64,
    eligible_pension_income: f64,
    age: u32,
    tables: &TaxTables,
    index: f64,
) -> TaxBreakdown {
    let eligibility_age = tables.benefits.eligibility_age;
    let federal = jurisdiction_tax(
        taxable_income,
        eligible_pension_income,
        age,
        eligibility_age,
        &tables.federal.indexed(index),
    );
    let regional = jurisdiction_tax(
        taxable_income,
        eligible_pension_income,
        age,
        eligibility_age,
        &tables.regional.indexed(index),
    );
    TaxBreakdown {
        federal,
        regional,
        total: federal + regional,
    }
}

/// Deferred withdrawals and income are fully taxable, taxable-account gains at
/// the inclusion rate, tax-free withdrawals not at all.
pub fn taxable_income(
    withdrawals: &WithdrawalPlan,
    income: &IncomeBreakdown,
    capital_gains_inclusion: f64,
) -> f64 {
    withdrawals.deferred
        + withdrawals.taxable_gain * capital_gains_inclusion
        + income.cpp
        + income.oas
        + income.pension
        + income.other
}
