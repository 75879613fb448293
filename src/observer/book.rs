//! Price-level ladders and the book listener boundary.

use std::collections::BTreeMap;

/// An immutable order book entry passed to listeners.
///
/// `price` is the fixed-point value scaled by 10⁹.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookEntry {
    pub instrument: i32,
    pub price: u64,
    pub amount: i32,
    pub buy: bool,
}

/// Receiver for fixed-depth order book updates.
///
/// Arrays are `depth` long; when the book is shallower the tail slots are
/// `None`. Bids come ordered best (highest) first, asks best (lowest)
/// first.
pub trait BookListener: Send + Sync {
    fn book_update(&self, bids: &[Option<BookEntry>], asks: &[Option<BookEntry>]);
}

/// One side of the book: a price → quantity map.
///
/// A zero size deletes the level; any positive size replaces it.
#[derive(Debug, Default)]
pub(crate) struct Ladder {
    levels: BTreeMap<u64, i32>,
}

impl Ladder {
    pub(crate) fn clear(&mut self) {
        self.levels.clear();
    }

    pub(crate) fn apply(&mut self, price: u64, size: i32) {
        if size > 0 {
            self.levels.insert(price, size);
        } else {
            self.levels.remove(&price);
        }
    }

    /// Extracts the top `depth` levels as listener entries, best first.
    /// Bids (`buy`) iterate from the highest price down, asks from the
    /// lowest up.
    pub(crate) fn top(&self, depth: usize, instrument: i32, buy: bool) -> Vec<Option<BookEntry>> {
        let mut entries = vec![None; depth];
        let levels: Box<dyn Iterator<Item = (&u64, &i32)>> = if buy {
            Box::new(self.levels.iter().rev())
        } else {
            Box::new(self.levels.iter())
        };
        for (slot, (&price, &amount)) in entries.iter_mut().zip(levels) {
            *slot = Some(BookEntry {
                instrument,
                price,
                amount,
                buy,
            });
        }
        entries
    }
}

/// Normalizes a `{mantissa, exponent}` price to the fixed-point ×10⁹
/// representation by shifting the mantissa one decimal digit at a time.
///
/// Precision is lost when the exponent is below −9; the exchange does not
/// price instruments more finely than 10⁻⁹, so nothing real is dropped.
pub(crate) fn scale_price(mantissa: i64, exponent: i32) -> u64 {
    let mut price = mantissa;
    let mut shift = exponent + 9;
    while shift > 0 {
        price = price.wrapping_mul(10);
        shift -= 1;
    }
    while shift < 0 {
        price /= 10;
        shift += 1;
    }
    price as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_price_exponent_range() {
        assert_eq!(scale_price(99, -9), 99);
        assert_eq!(scale_price(99, 0), 99_000_000_000);
        assert_eq!(scale_price(995, -1), 99_500_000_000);
        // Below -9 the tail digits are dropped.
        assert_eq!(scale_price(123_456, -12), 123);
        assert_eq!(scale_price(1_999, -12), 1);
    }

    #[test]
    fn test_ladder_apply_and_delete() {
        let mut ladder = Ladder::default();
        ladder.apply(100, 5);
        ladder.apply(101, 3);
        ladder.apply(100, 7); // replace
        ladder.apply(101, 0); // delete

        let top = ladder.top(2, 1, false);
        assert_eq!(
            top[0],
            Some(BookEntry {
                instrument: 1,
                price: 100,
                amount: 7,
                buy: false
            })
        );
        assert_eq!(top[1], None);
    }

    #[test]
    fn test_top_ordering_per_side() {
        let mut ladder = Ladder::default();
        for (price, size) in [(100u64, 1), (103, 2), (101, 3)] {
            ladder.apply(price, size);
        }

        let bids = ladder.top(3, 1, true);
        let bid_prices: Vec<u64> = bids.iter().flatten().map(|e| e.price).collect();
        assert_eq!(bid_prices, vec![103, 101, 100]);

        let asks = ladder.top(3, 1, false);
        let ask_prices: Vec<u64> = asks.iter().flatten().map(|e| e.price).collect();
        assert_eq!(ask_prices, vec![100, 101, 103]);
    }

    #[test]
    fn test_top_pads_shallow_book() {
        let mut ladder = Ladder::default();
        ladder.apply(50, 1);
        let top = ladder.top(4, 1, true);
        assert!(top[0].is_some());
        assert_eq!(&top[1..], &[None, None, None]);
    }
}
