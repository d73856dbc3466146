//! Order placement: stock decrement, order persistence and event raise as one
//! transaction.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use stockflow_core::{CustomerId, DomainError, OrderId, ProductId, RequestContext};
use stockflow_inventory::{StockChange, StockError};
use stockflow_sales::{Order, OrderStatus};

use crate::order_store::{OrderStore, OrderStoreError};
use crate::publisher::PublishError;
use crate::stock_ledger::{LedgerError, StockLedger};
use crate::transaction::{RollbackError, UnitOfWork};

/// Why an order could not be placed.
#[derive(Debug, Error)]
pub enum OrderFailure {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] OrderStoreError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    /// The order was rejected and part of the rollback could not be undone.
    #[error(transparent)]
    Unreverted(#[from] RollbackError),
}

impl OrderFailure {
    /// Retrying the same order later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            OrderFailure::Ledger(e) => e.is_transient(),
            OrderFailure::Store(OrderStoreError::Storage(_)) => true,
            _ => false,
        }
    }

    pub fn is_insufficient_stock(&self) -> bool {
        matches!(
            self,
            OrderFailure::Ledger(LedgerError::Stock(StockError::InsufficientStock { .. }))
        )
    }
}

/// A rejected order, persisted as `Failed`, plus the reason.
#[derive(Debug, Error)]
#[error("order {order_id} failed: {cause}", order_id = .order.order_id())]
pub struct PlaceOrderError {
    pub order: Order,
    #[source]
    pub cause: OrderFailure,
}

impl PlaceOrderError {
    pub fn is_transient(&self) -> bool {
        self.cause.is_transient()
    }
}

/// A committed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedOrder {
    pub order: Order,
    pub stock: StockChange,
    /// ID of the `sales.order.placed` envelope.
    pub event_id: Uuid,
}

#[derive(Clone)]
pub struct OrderService {
    ledger: StockLedger,
    orders: Arc<dyn OrderStore>,
    uow: UnitOfWork,
}

impl core::fmt::Debug for OrderService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OrderService")
            .field("ledger", &self.ledger)
            .field("uow", &self.uow)
            .finish_non_exhaustive()
    }
}

impl OrderService {
    pub fn new(ledger: StockLedger, orders: Arc<dyn OrderStore>, uow: UnitOfWork) -> Self {
        Self { ledger, orders, uow }
    }

    pub fn ledger(&self) -> &StockLedger {
        &self.ledger
    }

    /// Reserve stock and record the order, atomically.
    ///
    /// On success the order is `Success` and `sales.order.placed` is published
    /// after commit. On any failure the stock is left (or restored) as it was,
    /// the order is persisted as `Failed` with the reason, and no event is
    /// published.
    #[instrument(
        skip(self, context, customer_id),
        fields(correlation_id = %context.correlation_id())
    )]
    pub fn place_order(
        &self,
        context: &RequestContext,
        customer_id: CustomerId,
        product_id: ProductId,
        quantity: u64,
    ) -> Result<PlacedOrder, PlaceOrderError> {
        let pending = Order::pending(context, customer_id, product_id, quantity);

        let result = self.uow.run(context, |tx| -> Result<PlacedOrder, OrderFailure> {
            let mut order = pending.clone();
            let event = order.mark_success()?;

            // The decrement is visible to other callers from here until commit.
            let stock = self.ledger.decrement_in(tx, product_id, quantity)?;
            self.orders.insert(&order)?;

            let orders = Arc::clone(&self.orders);
            let order_id = order.order_id();
            tx.on_rollback(format!("remove order {order_id}"), move || {
                orders.delete(order_id)?;
                Ok(())
            });

            let event_id = self.uow.publisher().raise(tx, event)?;
            Ok(PlacedOrder {
                order,
                stock,
                event_id,
            })
        });

        match result {
            Ok(placed) => {
                info!(
                    order_id = %placed.order.order_id(),
                    remaining = placed.stock.quantity,
                    "order placed"
                );
                Ok(placed)
            }
            Err(cause) => {
                let mut order = pending;
                if let Err(e) = order.mark_failed(cause.to_string()) {
                    error!(order_id = %order.order_id(), error = %e, "could not mark order failed");
                }
                self.persist_failed(&order);

                warn!(
                    order_id = %order.order_id(),
                    transient = cause.is_transient(),
                    error = %cause,
                    "order rejected"
                );
                Err(PlaceOrderError { order, cause })
            }
        }
    }

    pub fn find_order(&self, order_id: OrderId) -> Result<Option<Order>, OrderStoreError> {
        self.orders.get(order_id)
    }

    pub fn orders_with_status(&self, status: OrderStatus) -> Result<Vec<Order>, OrderStoreError> {
        self.orders.find_by_status(status)
    }

    fn persist_failed(&self, order: &Order) {
        let saved = match self.orders.insert(order) {
            Err(OrderStoreError::AlreadyExists(_)) => self.orders.update(order),
            other => other,
        };
        if let Err(e) = saved {
            error!(order_id = %order.order_id(), error = %e, "failed to persist failed order");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_events::{EventEnvelope, InMemoryTransport};
    use stockflow_sales::OrderEvent;

    use crate::failures::{FailureTracker, InMemoryFailureStore};
    use crate::ledger_store::InMemoryLedgerStore;
    use crate::order_store::InMemoryOrderStore;
    use crate::publisher::{EventPublisher, PublisherConfig};
    use crate::stock_ledger::LedgerConfig;

    struct Fixture {
        service: OrderService,
        orders: Arc<InMemoryOrderStore>,
        transport: Arc<InMemoryTransport>,
        tracker: FailureTracker,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(InMemoryTransport::new());
        let tracker = FailureTracker::new(InMemoryFailureStore::arc());
        let publisher = EventPublisher::new(transport.clone(), tracker.clone(), PublisherConfig::default());
        let ledger = StockLedger::new(InMemoryLedgerStore::arc(), &LedgerConfig::default());
        let orders = InMemoryOrderStore::arc();
        let service = OrderService::new(ledger, orders.clone(), UnitOfWork::new(publisher));
        Fixture {
            service,
            orders,
            transport,
            tracker,
        }
    }

    #[test]
    fn successful_order_commits_and_publishes() {
        let f = fixture();
        let product_id = ProductId::new();
        f.service.ledger().register(product_id, 10).unwrap();

        let placed = f
            .service
            .place_order(&RequestContext::system(), CustomerId::new(), product_id, 4)
            .unwrap();

        assert_eq!(placed.order.status(), OrderStatus::Success);
        assert_eq!(placed.stock.quantity, 6);
        assert_eq!(
            f.service.find_order(placed.order.order_id()).unwrap(),
            Some(placed.order.clone())
        );

        let published = f.transport.published_to("sales-orders");
        assert_eq!(published.len(), 1);
        let envelope = EventEnvelope::<OrderEvent>::decode(&published[0].payload).unwrap();
        assert_eq!(envelope.event_id(), placed.event_id);
        assert_eq!(envelope.actor(), "system");
        let OrderEvent::OrderPlaced(event) = envelope.into_payload();
        assert_eq!(event.order_id, placed.order.order_id());
        assert_eq!(event.quantity, 4);
    }

    #[test]
    fn insufficient_stock_persists_failed_order_without_event() {
        let f = fixture();
        let product_id = ProductId::new();
        f.service.ledger().register(product_id, 2).unwrap();

        let err = f
            .service
            .place_order(&RequestContext::system(), CustomerId::new(), product_id, 3)
            .unwrap_err();

        assert!(err.cause.is_insufficient_stock());
        assert!(!err.is_transient());
        assert_eq!(err.order.status(), OrderStatus::Failed);
        assert!(err.order.failure_reason().unwrap().contains("insufficient stock"));

        let stored = f.orders.get(err.order.order_id()).unwrap().unwrap();
        assert_eq!(stored.status(), OrderStatus::Failed);
        assert_eq!(f.service.ledger().available(product_id).unwrap().quantity(), 2);
        assert_eq!(f.transport.attempts(), 0);
        assert!(f.tracker.find_unretried().unwrap().is_empty());
    }

    #[test]
    fn store_failure_after_decrement_rolls_stock_back() {
        #[derive(Debug)]
        struct RefusingOrders;

        impl OrderStore for RefusingOrders {
            fn insert(&self, order: &Order) -> Result<(), OrderStoreError> {
                match order.status() {
                    OrderStatus::Success => Err(OrderStoreError::Storage("disk full".to_string())),
                    _ => Ok(()),
                }
            }
            fn update(&self, _order: &Order) -> Result<(), OrderStoreError> {
                Ok(())
            }
            fn get(&self, _order_id: OrderId) -> Result<Option<Order>, OrderStoreError> {
                Ok(None)
            }
            fn delete(&self, _order_id: OrderId) -> Result<(), OrderStoreError> {
                Ok(())
            }
            fn find_by_status(&self, _status: OrderStatus) -> Result<Vec<Order>, OrderStoreError> {
                Ok(Vec::new())
            }
        }

        let transport = Arc::new(InMemoryTransport::new());
        let tracker = FailureTracker::new(InMemoryFailureStore::arc());
        let publisher = EventPublisher::new(transport.clone(), tracker.clone(), PublisherConfig::default());
        let ledger = StockLedger::new(InMemoryLedgerStore::arc(), &LedgerConfig::default());
        let service = OrderService::new(ledger, Arc::new(RefusingOrders), UnitOfWork::new(publisher));

        let product_id = ProductId::new();
        service.ledger().register(product_id, 5).unwrap();

        let err = service
            .place_order(&RequestContext::system(), CustomerId::new(), product_id, 2)
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(err.order.status(), OrderStatus::Failed);
        assert_eq!(service.ledger().available(product_id).unwrap().quantity(), 5);
        assert_eq!(transport.attempts(), 0);
        assert!(tracker.find_unretried().unwrap().is_empty());
    }

    #[test]
    fn stock_that_cannot_be_restored_is_reported_on_the_order() {
        use std::sync::Mutex;
        use std::time::Duration;

        use crate::backoff::RetryPolicy;
        use crate::ledger_store::{LedgerStore, StockLock};

        /// Fails the insert while leaving the product's row locked.
        struct LockingOrders {
            ledger_store: Arc<InMemoryLedgerStore>,
            product_id: ProductId,
            held: Mutex<Option<Box<dyn StockLock>>>,
        }

        impl OrderStore for LockingOrders {
            fn insert(&self, order: &Order) -> Result<(), OrderStoreError> {
                if order.status() != OrderStatus::Success {
                    return Ok(());
                }
                let lock = self
                    .ledger_store
                    .lock_and_read(self.product_id, Duration::from_millis(20))
                    .unwrap();
                *self.held.lock().unwrap() = Some(lock);
                Err(OrderStoreError::Storage("disk full".to_string()))
            }
            fn update(&self, _order: &Order) -> Result<(), OrderStoreError> {
                Ok(())
            }
            fn get(&self, _order_id: OrderId) -> Result<Option<Order>, OrderStoreError> {
                Ok(None)
            }
            fn delete(&self, _order_id: OrderId) -> Result<(), OrderStoreError> {
                Ok(())
            }
            fn find_by_status(&self, _status: OrderStatus) -> Result<Vec<Order>, OrderStoreError> {
                Ok(Vec::new())
            }
        }

        let ledger_store = InMemoryLedgerStore::arc();
        let config = LedgerConfig {
            lock_timeout: Duration::from_millis(10),
            ..LedgerConfig::default()
        };
        let ledger = StockLedger::new(ledger_store.clone(), &config)
            .with_restore_retry(RetryPolicy::fixed(2, Duration::from_millis(1)));
        let product_id = ProductId::new();
        ledger.register(product_id, 5).unwrap();

        let transport = Arc::new(InMemoryTransport::new());
        let tracker = FailureTracker::new(InMemoryFailureStore::arc());
        let publisher = EventPublisher::new(transport.clone(), tracker, PublisherConfig::default());
        let orders = Arc::new(LockingOrders {
            ledger_store,
            product_id,
            held: Mutex::new(None),
        });
        let service = OrderService::new(ledger, orders.clone(), UnitOfWork::new(publisher));

        let err = service
            .place_order(&RequestContext::system(), CustomerId::new(), product_id, 2)
            .unwrap_err();

        assert!(matches!(err.cause, OrderFailure::Unreverted(_)));
        assert!(!err.is_transient());
        let reason = err.order.failure_reason().unwrap();
        assert!(reason.contains("disk full"), "{reason}");
        assert!(reason.contains("restore 2 unit(s)"), "{reason}");
        assert_eq!(transport.attempts(), 0);

        orders.held.lock().unwrap().take();
        assert_eq!(service.ledger().available(product_id).unwrap().quantity(), 3);
    }

    #[test]
    fn publish_failure_does_not_fail_the_order() {
        let f = fixture();
        let product_id = ProductId::new();
        f.service.ledger().register(product_id, 1).unwrap();
        f.transport.set_available(false);

        let placed = f
            .service
            .place_order(&RequestContext::system(), CustomerId::new(), product_id, 1)
            .unwrap();

        assert_eq!(placed.order.status(), OrderStatus::Success);
        let failures = f.tracker.find_unretried().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].event_id, placed.event_id);
    }
}
