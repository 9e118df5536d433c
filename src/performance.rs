//! Performance summary from the trade log
//!
//! The log is replayed against whatever price history is available to build
//! an equity curve. A SELL counts as a win when it closes above the average
//! cost of the position it reduces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::portfolio::TradeRecord;
use crate::types::{Candle, Money, Side};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_return_pct: f64,
    /// Percent of SELLs closed at a profit
    pub win_rate: f64,
    pub total_trades: usize,
    pub buy_trades: usize,
    pub sell_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Peak-to-trough decline of the equity curve, in percent
    pub max_drawdown: f64,
    pub profit_factor: f64,
    pub realized_pnl: Money,
    pub unrealized_pnl: Money,
    pub final_value: Money,
}

#[derive(Debug, Clone, Copy)]
struct Book {
    cash: Money,
    quantity: Money,
    avg_cost: Money,
}

impl Book {
    fn equity(&self, price: Money) -> Money {
        self.cash + self.quantity * price
    }
}

#[derive(Debug, Default)]
struct Tally {
    wins: usize,
    losses: usize,
    gross_profit: Money,
    gross_loss: Money,
    realized: Money,
}

fn apply(book: &mut Book, tally: &mut Tally, trade: &TradeRecord) {
    match trade.side {
        Side::Buy => {
            let held_cost = book.avg_cost * book.quantity;
            book.quantity += trade.quantity;
            book.cash -= trade.total_value;
            book.avg_cost = (held_cost + trade.total_value)
                .checked_div(book.quantity)
                .unwrap_or(trade.price);
        }
        Side::Sell => {
            let pnl = (trade.price - book.avg_cost) * trade.quantity;
            tally.realized += pnl;
            if pnl.is_positive() {
                tally.wins += 1;
                tally.gross_profit += pnl;
            } else {
                tally.losses += 1;
                tally.gross_loss += pnl.abs();
            }
            book.quantity -= trade.quantity;
            book.cash += trade.total_value;
            if book.quantity.is_zero() {
                book.avg_cost = Money::ZERO;
            }
        }
    }
}

fn max_drawdown_pct(initial: Money, equity_curve: &[(DateTime<Utc>, Money)]) -> f64 {
    let mut peak = initial;
    let mut max_dd = 0.0;

    for &(_, equity) in equity_curve {
        if equity > peak {
            peak = equity;
        }
        if peak.is_positive() {
            let dd = ((peak - equity).to_f64()) / peak.to_f64();
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    max_dd * 100.0
}

/// `trades` oldest first; `candles` oldest first; `mark` values any open position
pub fn summarize(
    initial_balance: Money,
    trades: &[TradeRecord],
    candles: &[Candle],
    mark: Option<Money>,
) -> PerformanceSummary {
    let mut book = Book {
        cash: initial_balance,
        quantity: Money::ZERO,
        avg_cost: Money::ZERO,
    };
    let mut tally = Tally::default();
    let mut equity_curve: Vec<(DateTime<Utc>, Money)> = Vec::with_capacity(trades.len() + candles.len());

    let mut pending = trades.iter().peekable();
    for candle in candles {
        while let Some(trade) = pending.next_if(|t| t.timestamp <= candle.datetime) {
            apply(&mut book, &mut tally, trade);
            equity_curve.push((trade.timestamp, book.equity(trade.price)));
        }
        // Equity is flat until the first trade
        if !equity_curve.is_empty() {
            equity_curve.push((candle.datetime, book.equity(candle.close)));
        }
    }
    for trade in pending {
        apply(&mut book, &mut tally, trade);
        equity_curve.push((trade.timestamp, book.equity(trade.price)));
    }

    let mark = mark
        .or_else(|| trades.last().map(|t| t.price))
        .unwrap_or(book.avg_cost);
    let final_value = book.equity(mark);
    if let Some(&(ts, _)) = equity_curve.last() {
        equity_curve.push((ts, final_value));
    }

    let sells = tally.wins + tally.losses;
    let total_return_pct = if initial_balance.is_positive() {
        (final_value - initial_balance).to_f64() / initial_balance.to_f64() * 100.0
    } else {
        0.0
    };
    let win_rate = if sells > 0 {
        tally.wins as f64 / sells as f64 * 100.0
    } else {
        0.0
    };
    let profit_factor = if tally.gross_loss.is_positive() {
        tally.gross_profit.to_f64() / tally.gross_loss.to_f64()
    } else if tally.gross_profit.is_positive() {
        f64::INFINITY
    } else {
        0.0
    };

    PerformanceSummary {
        total_return_pct,
        win_rate,
        total_trades: trades.len(),
        buy_trades: trades.iter().filter(|t| t.side == Side::Buy).count(),
        sell_trades: sells,
        winning_trades: tally.wins,
        losing_trades: tally.losses,
        max_drawdown: max_drawdown_pct(initial_balance, &equity_curve),
        profit_factor,
        realized_pnl: tally.realized,
        unrealized_pnl: (mark - book.avg_cost) * book.quantity,
        final_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn trade(minute: i64, side: Side, qty: Money, price: Money) -> TradeRecord {
        TradeRecord {
            trade_id: format!("{}", minute),
            timestamp: t0() + Duration::minutes(minute),
            side,
            quantity: qty,
            price,
            total_value: qty * price,
            signal_type: "RSI".to_string(),
            indicator_value_at_trade: None,
            resulting_balance: Money::ZERO,
        }
    }

    #[test]
    fn test_empty_log() {
        let summary = summarize(Money::from_i64(10_000), &[], &[], None);
        assert_eq!(summary.total_trades, 0);
        assert_eq!(summary.win_rate, 0.0);
        assert_eq!(summary.max_drawdown, 0.0);
        assert_eq!(summary.final_value, Money::from_i64(10_000));
    }

    #[test]
    fn test_round_trips() {
        let initial = Money::from_i64(1_000);
        let trades = vec![
            trade(0, Side::Buy, Money::from_i64(2), Money::from_i64(100)),
            trade(1, Side::Sell, Money::from_i64(2), Money::from_i64(110)),
            trade(2, Side::Buy, Money::from_i64(2), Money::from_i64(100)),
            trade(3, Side::Sell, Money::from_i64(2), Money::from_i64(95)),
        ];

        let summary = summarize(initial, &trades, &[], None);
        assert_eq!(summary.total_trades, 4);
        assert_eq!(summary.sell_trades, 2);
        assert_relative_eq!(summary.win_rate, 50.0);
        assert_eq!(summary.realized_pnl, Money::from_i64(10));
        assert_eq!(summary.final_value, Money::from_i64(1_010));
        assert_relative_eq!(summary.total_return_pct, 1.0, epsilon = 1e-9);
        assert_relative_eq!(summary.profit_factor, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_drawdown_uses_price_history() {
        let initial = Money::from_i64(1_000);
        let trades = vec![trade(0, Side::Buy, Money::from_i64(5), Money::from_i64(100))];
        // Position marks to 80 on the way, recovers to 100
        let candles: Vec<Candle> = [100, 90, 80, 100]
            .iter()
            .enumerate()
            .map(|(i, &p)| Candle::flat(t0() + Duration::minutes(i as i64 + 1), Money::from_i64(p)))
            .collect();

        let summary = summarize(initial, &trades, &candles, Some(Money::from_i64(100)));
        // 1000 -> 900 is a 10% drawdown
        assert_relative_eq!(summary.max_drawdown, 10.0, epsilon = 1e-9);
        assert_relative_eq!(summary.total_return_pct, 0.0, epsilon = 1e-9);
        assert_eq!(summary.unrealized_pnl, Money::ZERO);
    }

    #[test]
    fn test_weighted_cost_decides_win() {
        let initial = Money::new(dec!(10000));
        let trades = vec![
            trade(0, Side::Buy, Money::ONE, Money::from_i64(100)),
            trade(1, Side::Buy, Money::ONE, Money::from_i64(120)),
            // avg cost 110; 105 is a loss even though it beats the first fill
            trade(2, Side::Sell, Money::from_i64(2), Money::from_i64(105)),
        ];
        let summary = summarize(initial, &trades, &[], None);
        assert_eq!(summary.winning_trades, 0);
        assert_eq!(summary.losing_trades, 1);
        assert_eq!(summary.realized_pnl, Money::from_i64(-10));
    }
}
