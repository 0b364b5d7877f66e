//! Signal primitives
//!
//! Pure, stateless evaluators over a position snapshot and policy config.
//! These never mutate the position; the engine commits ladder levels and
//! issues sells based on what they return.

use crate::config::{SmartExitConfig, StopLossConfig, TakeProfitLevel};
use crate::position::Position;

/// Which stop-loss rule fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTrigger {
    HardStop,
    BreakevenFloor,
    TrailingStop,
    NoMomentum,
    Timeout,
}

/// Stop-loss evaluation result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopVerdict {
    pub trigger: Option<StopTrigger>,
    pub pnl_pct: f64,
}

/// Returns the highest unreached ladder level whose multiplier the current
/// price has reached. Preferring the highest level keeps a fast spike from
/// re-triggering lower levels out of order.
pub fn evaluate_take_profit(position: &Position, ladder: &[TakeProfitLevel]) -> Option<usize> {
    let multiple = position.price_multiple();
    ladder
        .iter()
        .enumerate()
        .rev()
        .find(|(idx, level)| {
            multiple >= level.multiplier && !position.tp_levels_hit.contains(&(*idx as u8))
        })
        .map(|(idx, _)| idx)
}

/// Stop-loss / trailing / timeout evaluation, in fixed precedence order.
pub fn evaluate_stop_loss(
    position: &Position,
    config: &StopLossConfig,
    ladder_len: usize,
) -> StopVerdict {
    let pnl_pct = position.price_pnl_pct();
    let levels_hit = position.tp_levels_hit.len();
    let moon_bag = levels_hit >= ladder_len && ladder_len > 0;
    let age = position.age_secs();

    // 1. Hard stop
    if pnl_pct <= config.hard_stop_pct {
        return StopVerdict { trigger: Some(StopTrigger::HardStop), pnl_pct };
    }

    // 2. Breakeven floor: after a partial close, never let realized gains
    //    bleed back below entry.
    if levels_hit >= 1
        && position.status == crate::position::PositionStatus::PartialClose
        && position.current_price < position.entry_price
    {
        return StopVerdict { trigger: Some(StopTrigger::BreakevenFloor), pnl_pct };
    }

    // 3. Trailing stop. A moon bag gets a lower activation and a wider
    //    trail; right after the first take-profit the trail tightens.
    let (activation, trail_pct) = if moon_bag {
        (config.moon_bag_activation_multiplier, config.moon_bag_trailing_pct)
    } else if levels_hit >= 1 {
        (config.trailing_activation_multiplier, config.post_tp_trailing_pct)
    } else {
        (config.trailing_activation_multiplier, config.trailing_pct)
    };
    if position.entry_price > 0.0
        && position.peak_price >= position.entry_price * activation
        && position.drop_from_peak_pct() >= trail_pct
    {
        return StopVerdict { trigger: Some(StopTrigger::TrailingStop), pnl_pct };
    }

    // 4. No-momentum early exit, only before the first level is hit
    if levels_hit == 0 {
        let below_entry = position.current_price < position.entry_price;
        let stagnant = position.price_multiple() < config.no_momentum_stagnant_multiplier;
        if (age >= config.no_momentum_below_entry_secs && below_entry)
            || (age >= config.no_momentum_stagnant_secs && stagnant)
        {
            return StopVerdict { trigger: Some(StopTrigger::NoMomentum), pnl_pct };
        }
    }

    // 5. Timeout, extended by milestones reached. A fully-realized moon
    //    bag earns triple the patience.
    let mut timeout_secs =
        (config.timeout_minutes + config.timeout_bonus_minutes_per_level * levels_hit as u64) * 60;
    if moon_bag {
        timeout_secs *= 3;
    }
    if age >= timeout_secs {
        return StopVerdict { trigger: Some(StopTrigger::Timeout), pnl_pct };
    }

    StopVerdict { trigger: None, pnl_pct }
}

/// Moon-bag split of the remaining tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoonBagSplit {
    pub keep: u64,
    pub sell: u64,
}

/// Floor-round the kept amount; the remainder is sold.
pub fn calculate_moon_bag(position: &Position, keep_pct: f64) -> MoonBagSplit {
    let keep = (position.token_amount_remaining as f64 * keep_pct / 100.0).floor() as u64;
    MoonBagSplit {
        keep,
        sell: position.token_amount_remaining - keep,
    }
}

/// Keep a moon bag only when every ladder level is hit and the position,
/// realized plus remaining value, is in profit.
pub fn should_keep_moon_bag(position: &Position, ladder_len: usize) -> bool {
    position.all_levels_hit(ladder_len)
        && position.sol_returned + position.current_value_sol() > position.sol_invested
}

/// Inputs to the smart-partial-exit confidence score
#[derive(Debug, Clone, Default)]
pub struct SmartExitSignals {
    /// Estimated position value at the first target
    pub position_value_sol: f64,
    pub entry_reserve: Option<u64>,
    pub current_reserve: Option<u64>,
    /// Sell-to-buy ratio over the monitor's trailing window, if known
    pub sell_buy_ratio: Option<f64>,
    pub secs_to_first_target: u64,
    pub cumulative_sells: u64,
    /// Ladder sell percentage for the first level
    pub default_sell_pct: f64,
}

/// Smart-partial-exit recommendation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmartExitDecision {
    pub sell_pct: f64,
    pub confident: bool,
    pub signals_passed: u32,
}

/// At the first take-profit, score four independent health signals. If
/// enough agree, sell less and hold more for the next target. Two hard
/// overrides always force the full default: a position too small to split,
/// and missing entry-reserve data (confidence cannot be computed).
pub fn evaluate_smart_partial_exit(
    signals: &SmartExitSignals,
    config: &SmartExitConfig,
) -> SmartExitDecision {
    let default = SmartExitDecision {
        sell_pct: signals.default_sell_pct,
        confident: false,
        signals_passed: 0,
    };

    if signals.position_value_sol < config.min_position_value_sol {
        return default;
    }
    let entry_reserve = match signals.entry_reserve {
        Some(r) if r > 0 => r,
        _ => return default,
    };

    let mut passed = 0u32;

    // Reserve growth since entry
    if let Some(current) = signals.current_reserve {
        let growth_pct = (current as f64 - entry_reserve as f64) / entry_reserve as f64 * 100.0;
        if growth_pct >= config.reserve_growth_pct {
            passed += 1;
        }
    }

    // Selling pressure in the trailing window
    if let Some(ratio) = signals.sell_buy_ratio {
        if ratio <= config.max_sell_buy_ratio {
            passed += 1;
        }
    }

    // Speed to the first target
    if signals.secs_to_first_target <= config.max_secs_to_first_target {
        passed += 1;
    }

    // Cumulative selling against the pool
    if signals.cumulative_sells <= config.max_cumulative_sells {
        passed += 1;
    }

    if passed >= config.min_signals {
        SmartExitDecision {
            sell_pct: config.reduced_sell_pct,
            confident: true,
            signals_passed: passed,
        }
    } else {
        SmartExitDecision {
            sell_pct: signals.default_sell_pct,
            confident: false,
            signals_passed: passed,
        }
    }
}
