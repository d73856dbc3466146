//! Order persistence.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, PoisonError, RwLock};

use stockflow_core::OrderId;
use stockflow_sales::{Order, OrderStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderStoreError {
    #[error("order already exists: {0}")]
    AlreadyExists(OrderId),
    #[error("order not found: {0}")]
    NotFound(OrderId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Order store abstraction.
pub trait OrderStore: Send + Sync {
    fn insert(&self, order: &Order) -> Result<(), OrderStoreError>;

    /// Overwrite an existing order.
    fn update(&self, order: &Order) -> Result<(), OrderStoreError>;

    fn get(&self, order_id: OrderId) -> Result<Option<Order>, OrderStoreError>;

    /// Remove an order; used to undo an insert when a transaction rolls back.
    fn delete(&self, order_id: OrderId) -> Result<(), OrderStoreError>;

    /// Orders in `status`, oldest first.
    fn find_by_status(&self, status: OrderStatus) -> Result<Vec<Order>, OrderStoreError>;
}

impl<S> OrderStore for Arc<S>
where
    S: OrderStore + ?Sized,
{
    fn insert(&self, order: &Order) -> Result<(), OrderStoreError> {
        (**self).insert(order)
    }

    fn update(&self, order: &Order) -> Result<(), OrderStoreError> {
        (**self).update(order)
    }

    fn get(&self, order_id: OrderId) -> Result<Option<Order>, OrderStoreError> {
        (**self).get(order_id)
    }

    fn delete(&self, order_id: OrderId) -> Result<(), OrderStoreError> {
        (**self).delete(order_id)
    }

    fn find_by_status(&self, status: OrderStatus) -> Result<Vec<Order>, OrderStoreError> {
        (**self).find_by_status(status)
    }
}

/// In-memory order store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<OrderId, Order>>,
}

fn poisoned<T>(_: PoisonError<T>) -> OrderStoreError {
    OrderStoreError::Storage("in-memory order store lock poisoned".to_string())
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl OrderStore for InMemoryOrderStore {
    fn insert(&self, order: &Order) -> Result<(), OrderStoreError> {
        let mut orders = self.orders.write().map_err(poisoned)?;
        match orders.entry(order.order_id()) {
            Entry::Occupied(_) => Err(OrderStoreError::AlreadyExists(order.order_id())),
            Entry::Vacant(slot) => {
                slot.insert(order.clone());
                Ok(())
            }
        }
    }

    fn update(&self, order: &Order) -> Result<(), OrderStoreError> {
        let mut orders = self.orders.write().map_err(poisoned)?;
        match orders.get_mut(&order.order_id()) {
            Some(existing) => {
                *existing = order.clone();
                Ok(())
            }
            None => Err(OrderStoreError::NotFound(order.order_id())),
        }
    }

    fn get(&self, order_id: OrderId) -> Result<Option<Order>, OrderStoreError> {
        let orders = self.orders.read().map_err(poisoned)?;
        Ok(orders.get(&order_id).cloned())
    }

    fn delete(&self, order_id: OrderId) -> Result<(), OrderStoreError> {
        let mut orders = self.orders.write().map_err(poisoned)?;
        orders
            .remove(&order_id)
            .map(|_| ())
            .ok_or(OrderStoreError::NotFound(order_id))
    }

    fn find_by_status(&self, status: OrderStatus) -> Result<Vec<Order>, OrderStoreError> {
        let orders = self.orders.read().map_err(poisoned)?;
        let mut matching: Vec<Order> = orders
            .values()
            .filter(|o| o.status() == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then(a.order_id().cmp(&b.order_id()))
        });
        Ok(matching)
    }
}
