//! Meal-rate and fair-share arithmetic. Pure functions, no I/O.
//!
//! The meal rate is the global cost of one meal unit: every member is charged
//! the same rate no matter whose purchases produced the bazar total.

/// `total_bazar / total_meals`, or `0.0` when no meals exist yet.
///
/// Never returns NaN or infinity; non-finite inputs also collapse to zero.
pub fn meal_rate(total_bazar_cost: f64, total_meals: f64) -> f64 {
    if total_meals > 0.0 {
        finite_or_zero(total_bazar_cost / total_meals)
    } else {
        0.0
    }
}

pub fn fair_share(meal_count: f64, meal_rate: f64) -> f64 {
    finite_or_zero(meal_count * meal_rate)
}

/// Positive means the member is in credit, negative means they owe the pool.
pub fn net_balance(deposits: f64, fair_share: f64) -> f64 {
    deposits - fair_share
}

/// Shared cash on hand: everything deposited minus everything spent.
pub fn pool_remaining(total_deposits: f64, total_bazar_cost: f64) -> f64 {
    total_deposits - total_bazar_cost
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_zero_guard() {
        assert_eq!(meal_rate(300.0, 0.0), 0.0);
        assert_eq!(meal_rate(0.0, 0.0), 0.0);
        assert_eq!(meal_rate(f64::MAX, 0.0), 0.0);
        assert!(meal_rate(300.0, 0.0).is_finite());
        assert_eq!(meal_rate(f64::INFINITY, 2.0), 0.0);
    }

    #[test]
    fn test_end_to_end_scenario_arithmetic() {
        let rate = meal_rate(300.0, 30.0);
        assert_eq!(rate, 10.0);

        let a_share = fair_share(10.0, rate);
        let b_share = fair_share(20.0, rate);
        assert_eq!(a_share, 100.0);
        assert_eq!(b_share, 200.0);
        assert_eq!(net_balance(150.0, a_share), 50.0);
        assert_eq!(net_balance(150.0, b_share), -50.0);
    }

    #[test]
    fn test_zero_rate_means_zero_share() {
        assert_eq!(fair_share(12.5, 0.0), 0.0);
        assert_eq!(net_balance(200.0, fair_share(12.5, 0.0)), 200.0);
    }

    #[test]
    fn test_pool_remaining() {
        assert_eq!(pool_remaining(1000.0, 750.0), 250.0);
        assert_eq!(pool_remaining(100.0, 250.0), -150.0);
    }
}
