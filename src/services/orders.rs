//! Order Lifecycle Store
//!
//! Authoritative in-memory order records. Mutation happens only from the
//! matching engine of the order's symbol (single writer per symbol); the
//! store enforces the order state machine and recomputes fill aggregates.
//! Every mutation enqueues the order id for the store sync worker.

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;

use crate::models::{Order, OrderStatus};
use crate::services::writeback::WriteQueue;

#[derive(Debug, Error)]
pub enum OrderStoreError {
    #[error("order {0} not found")]
    NotFound(i64),

    #[error("illegal order transition {from} -> {to} for order {order_id}")]
    InvalidTransition {
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("fill on order {order_id} exceeds quantity: filled {filled} + {qty} > {quantity}")]
    Overfill {
        order_id: i64,
        filled: Decimal,
        qty: Decimal,
        quantity: Decimal,
    },
}

/// Filters for user order queries.
#[derive(Debug, Default, Clone)]
pub struct OrderFilter {
    pub symbol: Option<String>,
    pub status: Option<OrderStatus>,
    pub before: Option<i64>,
    pub after: Option<i64>,
    pub limit: Option<usize>,
}

impl OrderFilter {
    fn matches(&self, order: &Order) -> bool {
        if let Some(symbol) = &self.symbol {
            if &order.symbol != symbol {
                return false;
            }
        }
        if let Some(status) = self.status {
            if order.status != status {
                return false;
            }
        }
        let created = order.created_at.timestamp_millis();
        if let Some(before) = self.before {
            if created >= before {
                return false;
            }
        }
        if let Some(after) = self.after {
            if created <= after {
                return false;
            }
        }
        true
    }
}

pub struct OrderStore {
    orders: DashMap<i64, Order>,
    queue: Arc<WriteQueue>,
}

impl OrderStore {
    pub fn new(queue: Arc<WriteQueue>) -> Self {
        Self {
            orders: DashMap::new(),
            queue,
        }
    }

    /// Register a freshly created order and enqueue it for persistence.
    pub fn create(&self, order: Order) {
        self.queue.push_order(order.id);
        self.orders.insert(order.id, order);
    }

    /// Insert an order loaded from the durable store at recovery time.
    /// No write-queue entry: the store already holds this state.
    pub fn load_recovered(&self, order: Order) {
        self.orders.insert(order.id, order);
    }

    /// Apply a fill of `qty` at `price`, recomputing the quantity-weighted
    /// average fill price and advancing the status.
    pub fn apply_fill(
        &self,
        order_id: i64,
        qty: Decimal,
        price: Decimal,
    ) -> Result<Order, OrderStoreError> {
        let mut entry = self
            .orders
            .get_mut(&order_id)
            .ok_or(OrderStoreError::NotFound(order_id))?;
        let order = entry.value_mut();

        let new_filled = order.filled_quantity + qty;
        if new_filled > order.quantity {
            return Err(OrderStoreError::Overfill {
                order_id,
                filled: order.filled_quantity,
                qty,
                quantity: order.quantity,
            });
        }

        let next = if new_filled == order.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        if !order.status.can_transition_to(next) {
            return Err(OrderStoreError::InvalidTransition {
                order_id,
                from: order.status,
                to: next,
            });
        }

        // Weighted mean over all fills so far.
        let notional_so_far = order
            .average_fill_price
            .unwrap_or(Decimal::ZERO)
            * order.filled_quantity;
        order.average_fill_price = Some((notional_so_far + price * qty) / new_filled);
        order.filled_quantity = new_filled;
        order.status = next;
        order.updated_at = Utc::now();

        let snapshot = order.clone();
        drop(entry);
        self.queue.push_order(order_id);
        Ok(snapshot)
    }

    /// Move an order to `next`, enforcing the state machine.
    pub fn transition(
        &self,
        order_id: i64,
        next: OrderStatus,
    ) -> Result<Order, OrderStoreError> {
        let mut entry = self
            .orders
            .get_mut(&order_id)
            .ok_or(OrderStoreError::NotFound(order_id))?;
        let order = entry.value_mut();

        if !order.status.can_transition_to(next) {
            return Err(OrderStoreError::InvalidTransition {
                order_id,
                from: order.status,
                to: next,
            });
        }
        order.status = next;
        order.updated_at = Utc::now();

        let snapshot = order.clone();
        drop(entry);
        self.queue.push_order(order_id);
        Ok(snapshot)
    }

    pub fn get(&self, order_id: i64) -> Option<Order> {
        self.orders.get(&order_id).map(|entry| entry.value().clone())
    }

    /// User's orders matching `filter`, newest first.
    pub fn list_by_user(&self, user_id: i64, filter: &OrderFilter) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| entry.user_id == user_id && filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            orders.truncate(limit);
        }
        orders
    }

    /// All open (non-terminal, unfilled-remainder) orders, optionally scoped
    /// to one user and/or symbol. Oldest first, matching book priority.
    pub fn list_open(&self, user_id: Option<i64>, symbol: Option<&str>) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| {
                entry.is_open()
                    && user_id.map_or(true, |uid| entry.user_id == uid)
                    && symbol.map_or(true, |s| entry.symbol == s)
            })
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        orders
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}
