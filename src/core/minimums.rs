use super::tables::RrifSchedule;

/// Minimum share of the deferred account that must come out at `age`.
///
/// Zero below the first tabled age, the tabled factor inside the range (the
/// nearest lower entry for any gap), and the terminal rate from the terminal
/// age onward.
pub fn minimum_percentage(schedule: &RrifSchedule, age: u32) -> f64 {
    if age >= schedule.terminal_age {
        return schedule.terminal_rate;
    }
    schedule
        .factors
        .iter()
        .rev()
        .find(|(table_age, _)| *table_age <= age)
        .map(|&(_, rate)| rate)
        .unwrap_or(0.0)
}

pub fn mandatory_regime_active(schedule: &RrifSchedule, age: u32) -> bool {
    age >= schedule.conversion_age
}

/// Minimum dollar withdrawal from a deferred balance; zero while the regime
/// is inactive.
pub fn mandatory_minimum(schedule: &RrifSchedule, deferred_balance: f64, age: u32) -> f64 {
    if !mandatory_regime_active(schedule, age) || deferred_balance <= 0.0 {
        return 0.0;
    }
    deferred_balance * minimum_percentage(schedule, age)
}
