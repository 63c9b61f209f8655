//! Pure computation of technical indicators over daily OHLCV bars.
//!
//! No I/O, no clocks, no global state: identical input always yields
//! identical output. Series are ordered oldest to newest. A series shorter
//! than an indicator's look-back window makes that indicator unavailable
//! (`None`), never an error for the whole request.
//!
//! RSI uses Wilder's smoothing (factor `1/period`, not the EMA
//! `2/(period+1)`); MACD follows the 12/26/9 EMA convention.

use crate::engine::types::{IndicatorParams, IndicatorSet, MacdOutput};
use crate::types::OhlcvBar;

/// Simple moving average of the last `period` closes.
pub fn sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Exponential moving average series, seeded with the SMA of the first
/// `period` closes. Multiplier `k = 2 / (period + 1)`. Empty when the
/// series is shorter than `period`.
pub fn ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let k = 2.0 / (period as f64 + 1.0);
    let seed = closes[..period].iter().sum::<f64>() / period as f64;

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(seed);
    for &close in &closes[period..] {
        // Seeded above, so last() always exists.
        let prev = *result.last().expect("ema series is seeded");
        result.push(close * k + prev * (1.0 - k));
    }
    result
}

/// Relative Strength Index with Wilder's smoothing.
///
/// Needs `period + 1` closes for the first average. An all-gaining window
/// has no losses and hits the mathematical limit RSI = 100; an all-losing
/// window hits RSI = 0.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let period_f = period as f64;

    let mut avg_gain = changes[..period]
        .iter()
        .map(|&c| if c > 0.0 { c } else { 0.0 })
        .sum::<f64>()
        / period_f;
    let mut avg_loss = changes[..period]
        .iter()
        .map(|&c| if c < 0.0 { -c } else { 0.0 })
        .sum::<f64>()
        / period_f;

    for &c in &changes[period..] {
        let gain = if c > 0.0 { c } else { 0.0 };
        let loss = if c < 0.0 { -c } else { 0.0 };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// MACD line, signal line and histogram at the latest bar.
///
/// Needs `slow + signal` closes so the signal line has a full seed window.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<MacdOutput> {
    if fast == 0 || signal == 0 || fast >= slow || closes.len() < slow + signal {
        return None;
    }

    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);

    // Both series end at the latest bar; the fast one starts earlier.
    let offset = slow - fast;
    let macd_values: Vec<f64> = (0..slow_ema.len())
        .map(|i| fast_ema[i + offset] - slow_ema[i])
        .collect();

    let signal_ema = ema(&macd_values, signal);
    let signal_line = *signal_ema.last()?;
    let macd_line = *macd_values.last()?;

    Some(MacdOutput {
        macd: macd_line,
        signal: signal_line,
        histogram: macd_line - signal_line,
    })
}

/// Compute the full indicator set for a bar series.
pub fn compute(bars: &[OhlcvBar], params: &IndicatorParams) -> IndicatorSet {
    let closes: Vec<f64> = bars.iter().map(|bar| bar.close).collect();

    IndicatorSet {
        sma_short: sma(&closes, params.sma_short),
        sma_long: sma(&closes, params.sma_long),
        rsi: rsi(&closes, params.rsi_period),
        macd: macd(
            &closes,
            params.macd_fast,
            params.macd_slow,
            params.macd_signal,
        ),
    }
}
