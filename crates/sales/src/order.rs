use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockflow_core::{AggregateRoot, CustomerId, DomainError, DomainResult, OrderId, ProductId, RequestContext};
use stockflow_events::Event;

/// Order status lifecycle.
///
/// `Pending` is the only non-terminal state; every terminal state is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Success => "success",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

/// Aggregate root: Order (a purchase intent for one product line).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    order_id: OrderId,
    customer_id: CustomerId,
    product_id: ProductId,
    quantity: u64,
    status: OrderStatus,
    failure_reason: Option<String>,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
}

impl Order {
    /// A new pending order, stamped with the acting user from `context`.
    pub fn pending(
        context: &RequestContext,
        customer_id: CustomerId,
        product_id: ProductId,
        quantity: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id: OrderId::new(),
            customer_id,
            product_id,
            quantity,
            status: OrderStatus::Pending,
            failure_reason: None,
            created_by: context.actor().username().to_string(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn quantity(&self) -> u64 {
        self.quantity
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Pending → Success. Returns the event describing the placement.
    pub fn mark_success(&mut self) -> DomainResult<OrderEvent> {
        self.transition(OrderStatus::Success, None)?;
        Ok(OrderEvent::OrderPlaced(OrderPlaced {
            order_id: self.order_id,
            customer_id: self.customer_id,
            product_id: self.product_id,
            quantity: self.quantity,
            created_by: self.created_by.clone(),
            occurred_at: self.updated_at,
        }))
    }

    /// Pending → Failed, keeping the reason for operators.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> DomainResult<()> {
        self.transition(OrderStatus::Failed, Some(reason.into()))
    }

    /// Pending → Cancelled.
    pub fn cancel(&mut self, reason: impl Into<String>) -> DomainResult<()> {
        self.transition(OrderStatus::Cancelled, Some(reason.into()))
    }

    fn transition(&mut self, to: OrderStatus, reason: Option<String>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "order {} is already {} and cannot become {}",
                self.order_id,
                self.status.as_str(),
                to.as_str()
            )));
        }
        self.status = to;
        self.failure_reason = reason;
        self.updated_at = Utc::now();
        self.version += 1;
        Ok(())
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.order_id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Event: OrderPlaced (stock reserved and order committed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub product_id: ProductId,
    pub quantity: u64,
    pub created_by: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderPlaced(OrderPlaced),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderPlaced(_) => "sales.order.placed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderPlaced(e) => e.occurred_at,
        }
    }

    fn aggregate_id(&self) -> Uuid {
        match self {
            OrderEvent::OrderPlaced(e) => *e.order_id.as_uuid(),
        }
    }
}
