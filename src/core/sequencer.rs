use super::minimums::mandatory_minimum;
use super::tables::RrifSchedule;
use super::types::{AccountBalances, WithdrawalPlan};

/// Gain fraction assumed for a taxable account without cost-basis tracking.
pub const DEFAULT_GAIN_FRACTION: f64 = 0.5;

#[derive(Copy, Clone)]
enum Bucket {
    Taxable,
    Deferred,
    TaxFree,
}

/// Taxable first, then deferred, then tax-free.
const DRAW_ORDER: [Bucket; 3] = [Bucket::Taxable, Bucket::Deferred, Bucket::TaxFree];

pub fn gain_fraction(taxable_balance: f64, cost_basis: Option<f64>) -> f64 {
    match cost_basis {
        Some(basis) if taxable_balance > 0.0 => {
            ((taxable_balance - basis) / taxable_balance).clamp(0.0, 1.0)
        }
        Some(_) => 0.0,
        None => DEFAULT_GAIN_FRACTION,
    }
}

/// Splits a cash need across the accounts.
///
/// The mandatory minimum is always taken from the deferred account first and
/// counts toward the need; whatever the need still requires is drawn in
/// [`DRAW_ORDER`]. Every draw is capped at the bucket's balance, so a need
/// larger than the portfolio yields everything that is left.
pub fn sequence(
    target_amount: f64,
    balances: &AccountBalances,
    age: u32,
    cost_basis: Option<f64>,
    schedule: &RrifSchedule,
) -> WithdrawalPlan {
    let minimum = mandatory_minimum(schedule, balances.deferred, age);
    let required = target_amount.max(minimum).max(0.0);

    let mut plan = WithdrawalPlan {
        mandatory_minimum: minimum,
        ..WithdrawalPlan::default()
    };

    plan.deferred = minimum.min(balances.deferred);
    let mut remaining = (required - plan.deferred).max(0.0);

    for bucket in DRAW_ORDER {
        if remaining <= 0.0 {
            break;
        }
        let (drawn, available) = match bucket {
            Bucket::Taxable => (&mut plan.taxable, balances.taxable),
            Bucket::Deferred => (&mut plan.deferred, balances.deferred),
            Bucket::TaxFree => (&mut plan.tax_free, balances.tax_free),
        };
        let x = remaining.min((available - *drawn).max(0.0));
        *drawn += x;
        remaining -= x;
    }

    plan.total = plan.deferred + plan.tax_free + plan.taxable;
    plan.taxable_gain = plan.taxable * gain_fraction(balances.taxable, cost_basis);
    plan
}
