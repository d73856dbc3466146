use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockflow_core::{AggregateRoot, ProductId, StockId};

/// Business-rule failures for stock arithmetic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StockError {
    /// Amounts must be strictly positive.
    #[error("amount must be greater than zero")]
    InvalidAmount,

    /// Decrement would take the quantity below zero.
    #[error("insufficient stock for product {product_id}: available {available}, requested {requested}")]
    InsufficientStock {
        product_id: ProductId,
        available: u64,
        requested: u64,
    },

    /// Increment would overflow the quantity counter.
    #[error("stock overflow for product {product_id}")]
    Overflow { product_id: ProductId },
}

/// Stock row for one product.
///
/// Invariants:
/// - `quantity` is never negative (unsigned, and every transition is checked)
/// - `version` increases by exactly one per successful mutation
///
/// Transitions are pure: they return the next state and leave `self` untouched,
/// so a storage layer can decide whether the write actually lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    id: StockId,
    product_id: ProductId,
    quantity: u64,
    version: u64,
    updated_at: DateTime<Utc>,
}

impl StockRecord {
    /// A fresh row at version 0.
    pub fn new(product_id: ProductId, quantity: u64) -> Self {
        Self {
            id: StockId::new(),
            product_id,
            quantity,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Rebuild a row from persisted columns.
    pub fn from_parts(
        id: StockId,
        product_id: ProductId,
        quantity: u64,
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            product_id,
            quantity,
            version,
            updated_at,
        }
    }

    pub fn stock_id(&self) -> StockId {
        self.id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn quantity(&self) -> u64 {
        self.quantity
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Quantity after removing `amount`, or why that is not allowed.
    pub fn quantity_after_decrease(&self, amount: u64) -> Result<u64, StockError> {
        if amount == 0 {
            return Err(StockError::InvalidAmount);
        }
        self.quantity
            .checked_sub(amount)
            .ok_or(StockError::InsufficientStock {
                product_id: self.product_id,
                available: self.quantity,
                requested: amount,
            })
    }

    /// Quantity after adding `amount`, or why that is not allowed.
    pub fn quantity_after_increase(&self, amount: u64) -> Result<u64, StockError> {
        if amount == 0 {
            return Err(StockError::InvalidAmount);
        }
        self.quantity
            .checked_add(amount)
            .ok_or(StockError::Overflow {
                product_id: self.product_id,
            })
    }

    /// Next state with `quantity` replaced and the version bumped.
    pub fn with_quantity(&self, quantity: u64) -> Self {
        Self {
            id: self.id,
            product_id: self.product_id,
            quantity,
            version: self.version + 1,
            updated_at: Utc::now(),
        }
    }

    /// Next state after a checked decrease.
    pub fn decreased(&self, amount: u64) -> Result<Self, StockError> {
        let quantity = self.quantity_after_decrease(amount)?;
        Ok(self.with_quantity(quantity))
    }

    /// Next state after a checked increase.
    pub fn increased(&self, amount: u64) -> Result<Self, StockError> {
        let quantity = self.quantity_after_increase(amount)?;
        Ok(self.with_quantity(quantity))
    }
}

impl AggregateRoot for StockRecord {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.product_id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Outcome of an applied stock mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockChange {
    pub product_id: ProductId,
    pub previous_quantity: u64,
    pub quantity: u64,
    /// Version the mutation was applied on top of.
    pub previous_version: u64,
    pub version: u64,
    /// How many store round-trips the strategy needed (1 = no contention).
    pub attempts: u32,
}

impl StockChange {
    pub fn between(before: &StockRecord, after: &StockRecord, attempts: u32) -> Self {
        Self {
            product_id: after.product_id(),
            previous_quantity: before.quantity(),
            quantity: after.quantity(),
            previous_version: before.version(),
            version: after.version(),
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(quantity: u64) -> StockRecord {
        StockRecord::new(ProductId::new(), quantity)
    }

    #[test]
    fn decrease_reduces_quantity_and_bumps_version() {
        let before = record(10);
        let after = before.decreased(4).unwrap();

        assert_eq!(after.quantity(), 6);
        assert_eq!(after.version(), before.version() + 1);
        assert_eq!(after.stock_id(), before.stock_id());
        assert_eq!(before.quantity(), 10);
    }

    #[test]
    fn decrease_to_exactly_zero_is_allowed() {
        let after = record(3).decreased(3).unwrap();
        assert_eq!(after.quantity(), 0);
    }

    #[test]
    fn decrease_below_zero_is_insufficient_stock() {
        let before = record(5);
        let err = before.decreased(6).unwrap_err();

        assert_eq!(
            err,
            StockError::InsufficientStock {
                product_id: before.product_id(),
                available: 5,
                requested: 6,
            }
        );
    }

    #[test]
    fn zero_amounts_are_rejected() {
        assert_eq!(record(5).decreased(0).unwrap_err(), StockError::InvalidAmount);
        assert_eq!(record(5).increased(0).unwrap_err(), StockError::InvalidAmount);
    }

    #[test]
    fn increase_overflow_is_reported() {
        let err = record(u64::MAX).increased(1).unwrap_err();
        assert!(matches!(err, StockError::Overflow { .. }));
    }

    #[test]
    fn change_describes_both_sides() {
        let before = record(8);
        let after = before.decreased(2).unwrap();
        let change = StockChange::between(&before, &after, 1);

        assert_eq!(change.previous_quantity, 8);
        assert_eq!(change.quantity, 6);
        assert_eq!(change.version, change.previous_version + 1);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            #[test]
            fn sequential_decreases_never_go_negative(
                initial in 0u64..1_000,
                amounts in proptest::collection::vec(1u64..50, 0..40)
            ) {
                let mut current = record(initial);
                let mut applied = 0u64;

                for amount in amounts {
                    match current.decreased(amount) {
                        Ok(next) => {
                            applied += amount;
                            current = next;
                        }
                        Err(StockError::InsufficientStock { available, requested, .. }) => {
                            prop_assert!(requested > available);
                            prop_assert_eq!(available, current.quantity());
                        }
                        Err(other) => prop_assert!(false, "unexpected error {:?}", other),
                    }
                }

                prop_assert_eq!(current.quantity(), initial - applied);
            }
        }
    }
}
