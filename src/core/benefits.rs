use super::tables::{BenefitAmounts, ClawbackThresholds};
use super::types::{BenefitElections, BenefitKind};

pub const CPP_EARLIEST_START_AGE: u32 = 60;
pub const OAS_EARLIEST_START_AGE: u32 = 65;
pub const LATEST_START_AGE: u32 = 70;

const CPP_EARLY_REDUCTION_PER_MONTH: f64 = 0.006;
const CPP_DELAY_INCREASE_PER_MONTH: f64 = 0.007;
const OAS_DELAY_INCREASE_PER_MONTH: f64 = 0.006;

/// Multiplier on the reference-age amount for a benefit taken at `start_age`.
///
/// CPP can start early (reduced) or late (increased); OAS only rewards a
/// delay. Start ages outside a benefit's window are clamped to it.
pub fn adjustment_factor(kind: BenefitKind, start_age: u32, reference_age: u32) -> f64 {
    let (earliest, early_rate, delay_rate) = match kind {
        BenefitKind::Cpp => (
            CPP_EARLIEST_START_AGE,
            CPP_EARLY_REDUCTION_PER_MONTH,
            CPP_DELAY_INCREASE_PER_MONTH,
        ),
        BenefitKind::Oas => (reference_age, 0.0, OAS_DELAY_INCREASE_PER_MONTH),
    };
    let start = start_age.clamp(earliest.min(reference_age), LATEST_START_AGE);
    let months = (start as f64 - reference_age as f64) * 12.0;

    if months < 0.0 {
        1.0 + months * early_rate
    } else {
        1.0 + months * delay_rate
    }
}

/// Income-tested reduction: `rate` of every dollar above `lower`. The benefit
/// runs out wherever the reduction reaches it; `upper` only short-cuts incomes
/// that exhaust it.
pub fn clawback(benefit_amount: f64, net_income: f64, thresholds: &ClawbackThresholds) -> f64 {
    let amount = benefit_amount.max(0.0);
    if net_income <= thresholds.lower {
        return amount;
    }
    let remaining = (amount - (net_income - thresholds.lower) * thresholds.rate).max(0.0);
    if net_income >= thresholds.upper && remaining <= 0.0 {
        return 0.0;
    }
    remaining
}

/// Gross benefit paid at `age`, before any clawback. `index` is the
/// cumulative indexation since the tables' base year.
pub fn annual_benefit(
    kind: BenefitKind,
    elections: &BenefitElections,
    amounts: &BenefitAmounts,
    age: u32,
    index: f64,
) -> f64 {
    let (start_age, reference_amount, entitlement) = match kind {
        BenefitKind::Cpp => (
            elections.cpp_start_age,
            amounts.cpp_max_at_reference,
            elections.cpp_entitlement,
        ),
        BenefitKind::Oas => (
            elections.oas_start_age.max(amounts.eligibility_age),
            amounts.oas_full_at_reference,
            elections.oas_entitlement,
        ),
    };
    if age < start_age {
        return 0.0;
    }

    let factor = adjustment_factor(kind, start_age, amounts.reference_age);
    let mut amount = reference_amount * entitlement.clamp(0.0, 1.0) * factor * index;
    if kind == BenefitKind::Oas && age >= amounts.oas_senior_increase_age {
        amount *= 1.0 + amounts.oas_senior_increase;
    }
    amount.max(0.0)
}
