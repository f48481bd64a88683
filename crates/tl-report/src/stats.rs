//! Summary statistics over the equity curve and trade log.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tl_types::Trade;

/// Trading periods per year used for annualisation.
const PERIODS_PER_YEAR: f64 = 252.0;

/// One point on the equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: i64,
    pub equity: Decimal,
}

/// Headline figures for the whole run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StaticStats {
    pub beginning_equity: Decimal,
    pub ending_equity: Decimal,
    pub net_profit: Decimal,
    pub total_return: Decimal,
    pub annualized_return: Option<Decimal>,
    pub volatility: Option<Decimal>,
    pub sharpe_ratio: Option<Decimal>,
    pub sortino_ratio: Option<Decimal>,
    pub max_drawdown: Decimal,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: Option<Decimal>,
    pub profit_factor: Option<Decimal>,
    pub total_fees: Decimal,
}

/// Benchmark regression block. Populated only when a benchmark series is
/// supplied, which the engine does not do on its own.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RegressionStats {
    pub alpha: Option<Decimal>,
    pub beta: Option<Decimal>,
    pub r_squared: Option<Decimal>,
}

/// Per-period series derived from the equity curve.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeseriesStats {
    pub equity_curve: Vec<EquityPoint>,
    pub period_returns: Vec<Decimal>,
    pub cumulative_returns: Vec<Decimal>,
    pub drawdowns: Vec<Decimal>,
}

fn sqrt(value: Decimal) -> Option<Decimal> {
    value.to_f64().filter(|v| *v >= 0.0).and_then(|v| Decimal::from_f64(v.sqrt()))
}

fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<Decimal>() / Decimal::from(values.len()))
}

fn std_dev(values: &[Decimal]) -> Option<Decimal> {
    if values.len() < 2 {
        return None;
    }
    let mu = mean(values)?;
    let variance = values
        .iter()
        .map(|v| (*v - mu) * (*v - mu))
        .sum::<Decimal>()
        / Decimal::from(values.len() - 1);
    sqrt(variance)
}

/// Simple per-period returns of an equity series.
pub fn period_returns(curve: &[EquityPoint]) -> Vec<Decimal> {
    curve
        .windows(2)
        .map(|w| {
            if w[0].equity == Decimal::ZERO {
                Decimal::ZERO
            } else {
                (w[1].equity - w[0].equity) / w[0].equity
            }
        })
        .collect()
}

/// Fraction drawdown from the running equity peak, per point.
pub fn drawdown_series(curve: &[EquityPoint]) -> Vec<Decimal> {
    let mut peak = Decimal::ZERO;
    curve
        .iter()
        .map(|p| {
            if p.equity > peak {
                peak = p.equity;
            }
            if peak == Decimal::ZERO {
                Decimal::ZERO
            } else {
                (peak - p.equity) / peak
            }
        })
        .collect()
}

/// Build the timeseries block from an equity curve.
pub fn timeseries_stats(curve: &[EquityPoint]) -> TimeseriesStats {
    let returns = period_returns(curve);
    let mut cumulative = Vec::with_capacity(returns.len());
    let mut acc = Decimal::ONE;
    for r in &returns {
        acc *= Decimal::ONE + *r;
        cumulative.push(acc - Decimal::ONE);
    }
    TimeseriesStats {
        equity_curve: curve.to_vec(),
        period_returns: returns,
        cumulative_returns: cumulative,
        drawdowns: drawdown_series(curve),
    }
}

/// Build the headline block from the curve and trade log.
pub fn static_stats(
    initial_capital: Decimal,
    curve: &[EquityPoint],
    trades: &[Trade],
    risk_free_rate: Decimal,
) -> StaticStats {
    let beginning_equity = curve
        .first()
        .map(|p| p.equity)
        .unwrap_or(initial_capital);
    let ending_equity = curve.last().map(|p| p.equity).unwrap_or(initial_capital);
    let net_profit = ending_equity - initial_capital;
    let total_return = if initial_capital == Decimal::ZERO {
        Decimal::ZERO
    } else {
        net_profit / initial_capital
    };

    let returns = period_returns(curve);
    let periods = Decimal::from_f64(PERIODS_PER_YEAR).unwrap_or_default();
    let mean_return = mean(&returns);
    let volatility = std_dev(&returns).and_then(|sd| sqrt(periods).map(|a| sd * a));
    let annualized_return = mean_return.map(|mu| mu * periods);

    let sharpe_ratio = match (mean_return, std_dev(&returns)) {
        (Some(mu), Some(sd)) if sd > Decimal::ZERO => {
            let excess = mu - risk_free_rate / periods;
            sqrt(periods).map(|a| excess / sd * a)
        }
        _ => None,
    };

    // Sortino uses downside deviation only.
    let downside: Vec<Decimal> = returns
        .iter()
        .copied()
        .filter(|r| *r < Decimal::ZERO)
        .collect();
    let sortino_ratio = match (mean_return, std_dev(&downside)) {
        (Some(mu), Some(sd)) if sd > Decimal::ZERO => {
            let excess = mu - risk_free_rate / periods;
            sqrt(periods).map(|a| excess / sd * a)
        }
        _ => None,
    };

    let max_drawdown = drawdown_series(curve)
        .into_iter()
        .max()
        .unwrap_or(Decimal::ZERO);

    // Trade-level tallies. Rollover legs net to zero exposure change and are
    // excluded from win/loss counting; fees always accrue.
    let total_fees: Decimal = trades.iter().map(|t| t.fees).sum();
    let scored: Vec<&Trade> = trades.iter().filter(|t| !t.is_rollover).collect();
    let winning_trades = scored
        .iter()
        .filter(|t| t.trade_value - t.fees > Decimal::ZERO)
        .count();
    let losing_trades = scored
        .iter()
        .filter(|t| t.trade_value - t.fees < Decimal::ZERO)
        .count();
    let win_rate = if scored.is_empty() {
        None
    } else {
        Some(Decimal::from(winning_trades) / Decimal::from(scored.len()))
    };

    let gross_gains: Decimal = scored
        .iter()
        .map(|t| t.trade_value - t.fees)
        .filter(|v| *v > Decimal::ZERO)
        .sum();
    let gross_losses: Decimal = scored
        .iter()
        .map(|t| t.trade_value - t.fees)
        .filter(|v| *v < Decimal::ZERO)
        .sum();
    let profit_factor = if gross_losses < Decimal::ZERO {
        Some(gross_gains / -gross_losses)
    } else {
        None
    };

    StaticStats {
        beginning_equity,
        ending_equity,
        net_profit,
        total_return,
        annualized_return,
        volatility,
        sharpe_ratio,
        sortino_ratio,
        max_drawdown,
        total_trades: trades.len(),
        winning_trades,
        losing_trades,
        win_rate,
        profit_factor,
        total_fees,
    }
}
