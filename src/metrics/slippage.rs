// Slippage estimation by walking one side of the book
// Greedily consumes price levels until the target base quantity is filled
// or the side is exhausted.

use rust_decimal::Decimal;

use crate::core::types::{PriceLevel, Px, Qty, Side, SlippageEstimate};

const BPS_SCALE: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

/// Walk `levels` (already in price priority: bids descending for a sell,
/// asks ascending for a buy) consuming toward `target_qty` base units.
///
/// When the side is exhausted first, the estimate is marked unfilled and the
/// slippage fields describe the partial fill.
pub fn estimate(
    levels: &[PriceLevel],
    mid: Px,
    target_qty: Qty,
    size_usd: u64,
    side: Side,
) -> SlippageEstimate {
    let mut remaining = target_qty;
    let mut filled_qty = Decimal::ZERO;
    let mut total_cost = Decimal::ZERO;
    let mut levels_consumed = 0usize;

    for level in levels {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = level.qty.min(remaining);
        total_cost += level.price * take;
        filled_qty += take;
        remaining -= take;
        levels_consumed += 1;
    }

    if filled_qty.is_zero() {
        return SlippageEstimate {
            size_usd,
            side,
            avg_fill_price: Decimal::ZERO,
            filled_qty: Decimal::ZERO,
            total_cost: Decimal::ZERO,
            levels_consumed: 0,
            slippage_bps: Decimal::ZERO,
            slippage_usd: Decimal::ZERO,
            filled: false,
        };
    }

    let avg_fill_price = total_cost / filled_qty;
    let slippage_abs = (avg_fill_price - mid).abs();
    let slippage_bps = if mid.is_zero() {
        Decimal::ZERO
    } else {
        slippage_abs / mid * BPS_SCALE
    };
    let slippage_usd = slippage_abs * filled_qty;

    SlippageEstimate {
        size_usd,
        side,
        avg_fill_price,
        filled_qty,
        total_cost,
        levels_consumed,
        slippage_bps: slippage_bps.round_dp(4),
        slippage_usd: slippage_usd.round_dp(2),
        filled: remaining <= Decimal::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn levels(pairs: &[(Decimal, Decimal)]) -> Vec<PriceLevel> {
        pairs.iter().map(|(p, q)| PriceLevel::new(*p, *q)).collect()
    }

    #[test]
    fn test_buy_walk_across_three_levels() {
        // Asks ascending: (50010, 3), (50020, 5), (50040, 2); mid = 50000
        let asks = levels(&[
            (dec!(50010), dec!(3)),
            (dec!(50020), dec!(5)),
            (dec!(50040), dec!(2)),
        ]);

        let est = estimate(&asks, dec!(50000), dec!(10), 500_000, Side::Buy);

        assert!(est.filled);
        assert_eq!(est.levels_consumed, 3);
        assert_eq!(est.total_cost, dec!(500210));
        assert_eq!(est.avg_fill_price, dec!(50021));
        assert_eq!(est.slippage_bps, dec!(4.2));
    }

    #[test]
    fn test_sell_single_level() {
        let bids = levels(&[(dec!(50000), dec!(2.0))]);

        let est = estimate(&bids, dec!(50005), dec!(1.0), 50_000, Side::Sell);

        assert!(est.filled);
        assert_eq!(est.levels_consumed, 1);
        assert_eq!(est.avg_fill_price, dec!(50000));
        assert_eq!(est.filled_qty, dec!(1.0));
    }

    #[test]
    fn test_insufficient_liquidity() {
        let bids = levels(&[(dec!(50000), dec!(0.5))]);

        let est = estimate(&bids, dec!(50005), dec!(2.0), 100_000, Side::Sell);

        assert!(!est.filled);
        assert_eq!(est.filled_qty, dec!(0.5));
        assert_eq!(est.levels_consumed, 1);
    }

    #[test]
    fn test_empty_side() {
        let est = estimate(&[], dec!(50000), dec!(1.0), 100_000, Side::Buy);
        assert!(!est.filled);
        assert_eq!(est.filled_qty, Decimal::ZERO);
        assert_eq!(est.slippage_bps, Decimal::ZERO);
    }

    #[test]
    fn test_slippage_monotone_in_size() {
        let asks = levels(&[
            (dec!(50010), dec!(3)),
            (dec!(50020), dec!(5)),
            (dec!(50040), dec!(2)),
            (dec!(50100), dec!(10)),
        ]);
        let mid = dec!(50000);

        let mut prev = Decimal::ZERO;
        for target in [dec!(1), dec!(3), dec!(8), dec!(10), dec!(15)] {
            let est = estimate(&asks, mid, target, 0, Side::Buy);
            assert!(est.filled);
            assert!(
                est.slippage_bps >= prev,
                "slippage not monotone: {} < {}",
                est.slippage_bps,
                prev
            );
            prev = est.slippage_bps;
        }
    }
}
