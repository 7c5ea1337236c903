#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GrowthOutcome {
    pub ending_balance: f64,
    pub investment_return: f64,
}

/// Applies one year's flows and then one year's return.
///
/// The withdrawal is expected to be capped at the available funds already; the
/// net balance is floored at zero regardless, so the ending balance is never
/// negative even for returns below -100%.
pub fn project(
    starting_balance: f64,
    contribution: f64,
    withdrawal: f64,
    rate: f64,
) -> GrowthOutcome {
    let net_balance = (starting_balance + contribution - withdrawal).max(0.0);
    let investment_return = (net_balance * rate).max(-net_balance);
    GrowthOutcome {
        ending_balance: (net_balance + investment_return).max(0.0),
        investment_return,
    }
}
