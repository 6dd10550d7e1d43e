//! WebSocket Handler
//!
//! One task per session: a `tokio::select!` loop over the client socket and
//! the event publisher's broadcast receivers, forwarding only the topics the
//! session subscribed to. Per-topic ordering follows from the per-channel
//! broadcast order; a lagged session gets a drop marker (and fresh book
//! snapshots) instead of silently missing events.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::channels::Topic;
use crate::models::{AssetView, OrderSide, OrderView, UserTradeView};
use crate::services::matching::DepthSnapshot;
use crate::AppState;

const DEPTH_SNAPSHOT_LEVELS: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Subscribed {
        channel: String,
    },
    Unsubscribed {
        channel: String,
    },
    Price {
        symbol: String,
        last_price: Decimal,
        last_quantity: Decimal,
        change_24h: Decimal,
        change_percent_24h: Decimal,
        high_24h: Decimal,
        low_24h: Decimal,
        volume_24h: Decimal,
        #[serde(skip_serializing_if = "Option::is_none")]
        mid_price: Option<Decimal>,
        timestamp: i64,
    },
    OrderBookSnapshot {
        #[serde(flatten)]
        snapshot: DepthSnapshot,
    },
    OrderBookDelta {
        symbol: String,
        changes: Vec<LevelView>,
        timestamp: i64,
    },
    Trade {
        #[serde(with = "crate::models::id_str")]
        trade_id: i64,
        symbol: String,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        timestamp: i64,
    },
    Order {
        #[serde(flatten)]
        order: OrderView,
    },
    UserTrade {
        #[serde(flatten)]
        trade: UserTradeView,
    },
    Assets {
        assets: Vec<AssetView>,
    },
    /// Marker for events dropped on a slow session.
    Dropped {
        channel: String,
        count: u64,
    },
    Error {
        code: String,
        message: String,
    },
    Pong,
}

#[derive(Debug, Serialize)]
pub struct LevelView {
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
}

type Sender = SplitSink<WebSocket, Message>;

async fn send(sender: &mut Sender, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(text) => {
            crate::metrics::record_ws_message_sent();
            sender.send(Message::Text(text)).await.is_ok()
        }
        Err(err) => {
            tracing::error!(%err, "failed to serialize server message");
            true
        }
    }
}

pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    crate::metrics::ws_connection_opened();
    let (mut sender, mut receiver) = socket.split();

    let mut subscriptions: HashSet<Topic> = HashSet::new();

    let mut price_rx = state.events.subscribe_prices();
    let mut book_rx = state.events.subscribe_book_deltas();
    let mut trade_rx = state.events.subscribe_trades();
    let mut user_order_rx = state.events.subscribe_user_orders();
    let mut user_trade_rx = state.events.subscribe_user_trades();
    let mut user_asset_rx = state.events.subscribe_user_assets();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_client_message(&text, &state, &mut subscriptions, &mut sender).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        // Disconnect without a closing handshake is routine.
                        tracing::debug!(%err, "websocket closed abruptly");
                        break;
                    }
                    _ => {}
                }
            }

            event = price_rx.recv() => {
                match event {
                    Ok(update) => {
                        if subscriptions.contains(&Topic::Price(update.symbol.clone())) {
                            let msg = ServerMessage::Price {
                                symbol: update.symbol,
                                last_price: update.last_price,
                                last_quantity: update.last_quantity,
                                change_24h: update.change_24h,
                                change_percent_24h: update.change_percent_24h,
                                high_24h: update.high_24h,
                                low_24h: update.low_24h,
                                volume_24h: update.volume_24h,
                                mid_price: update.mid_price,
                                timestamp: update.timestamp,
                            };
                            if !send(&mut sender, &msg).await {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        if !notify_dropped(&mut sender, "price", count).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            event = book_rx.recv() => {
                match event {
                    Ok(delta) => {
                        if subscriptions.contains(&Topic::OrderBook(delta.symbol.clone())) {
                            let msg = ServerMessage::OrderBookDelta {
                                symbol: delta.symbol,
                                changes: delta
                                    .changes
                                    .into_iter()
                                    .map(|c| LevelView {
                                        side: c.side,
                                        price: c.price,
                                        quantity: c.quantity,
                                    })
                                    .collect(),
                                timestamp: delta.timestamp,
                            };
                            if !send(&mut sender, &msg).await {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        // Deltas are incremental; a gap invalidates the
                        // subscriber's book, so follow the marker with fresh
                        // snapshots for every subscribed symbol.
                        if !notify_dropped(&mut sender, "orderbook", count).await {
                            break;
                        }
                        let symbols: Vec<String> = subscriptions
                            .iter()
                            .filter_map(|topic| match topic {
                                Topic::OrderBook(symbol) => Some(symbol.clone()),
                                _ => None,
                            })
                            .collect();
                        let mut alive = true;
                        for symbol in symbols {
                            if !send_book_snapshot(&state, &symbol, &mut sender).await {
                                alive = false;
                                break;
                            }
                        }
                        if !alive {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            event = trade_rx.recv() => {
                match event {
                    Ok(executed) => {
                        if subscriptions.contains(&Topic::Trades(executed.trade.symbol.clone())) {
                            let msg = ServerMessage::Trade {
                                trade_id: executed.trade.id,
                                symbol: executed.trade.symbol.clone(),
                                side: executed.taker_side,
                                price: executed.trade.price,
                                quantity: executed.trade.quantity,
                                timestamp: executed.trade.executed_at,
                            };
                            if !send(&mut sender, &msg).await {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        if !notify_dropped(&mut sender, "trades", count).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            event = user_order_rx.recv() => {
                match event {
                    Ok(update) => {
                        if subscriptions.contains(&Topic::UserOrders(update.user_id)) {
                            let msg = ServerMessage::Order { order: update.order };
                            if !send(&mut sender, &msg).await {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        if !notify_dropped(&mut sender, "userOrders", count).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            event = user_trade_rx.recv() => {
                match event {
                    Ok(update) => {
                        if subscriptions.contains(&Topic::UserTrades(update.user_id)) {
                            let msg = ServerMessage::UserTrade { trade: update.trade };
                            if !send(&mut sender, &msg).await {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        if !notify_dropped(&mut sender, "userTrades", count).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            event = user_asset_rx.recv() => {
                match event {
                    Ok(update) => {
                        if subscriptions.contains(&Topic::UserAssets(update.user_id)) {
                            let msg = ServerMessage::Assets { assets: update.assets };
                            if !send(&mut sender, &msg).await {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        if !notify_dropped(&mut sender, "userAssets", count).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    crate::metrics::ws_connection_closed();
}

/// Returns false when the socket is gone.
async fn handle_client_message(
    text: &str,
    state: &Arc<AppState>,
    subscriptions: &mut HashSet<Topic>,
    sender: &mut Sender,
) -> bool {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(err) => {
            return send(
                sender,
                &ServerMessage::Error {
                    code: "BAD_MESSAGE".to_string(),
                    message: err.to_string(),
                },
            )
            .await;
        }
    };

    match msg {
        ClientMessage::Ping => send(sender, &ServerMessage::Pong).await,
        ClientMessage::Subscribe { channel } => match Topic::parse(&channel) {
            Some(topic) => {
                let confirmed = topic.to_string();
                subscriptions.insert(topic.clone());
                if !send(sender, &ServerMessage::Subscribed { channel: confirmed }).await {
                    return false;
                }
                // New book subscribers start from a full snapshot.
                if let Topic::OrderBook(symbol) = &topic {
                    return send_book_snapshot(state, symbol, sender).await;
                }
                true
            }
            None => {
                send(
                    sender,
                    &ServerMessage::Error {
                        code: "UNKNOWN_TOPIC".to_string(),
                        message: format!("cannot parse topic: {}", channel),
                    },
                )
                .await
            }
        },
        ClientMessage::Unsubscribe { channel } => match Topic::parse(&channel) {
            Some(topic) => {
                subscriptions.remove(&topic);
                send(
                    sender,
                    &ServerMessage::Unsubscribed {
                        channel: topic.to_string(),
                    },
                )
                .await
            }
            None => true,
        },
    }
}

async fn send_book_snapshot(state: &Arc<AppState>, symbol: &str, sender: &mut Sender) -> bool {
    match state.engine.depth(symbol, DEPTH_SNAPSHOT_LEVELS).await {
        Ok(snapshot) => send(sender, &ServerMessage::OrderBookSnapshot { snapshot }).await,
        Err(err) => {
            send(
                sender,
                &ServerMessage::Error {
                    code: "UNKNOWN_SYMBOL".to_string(),
                    message: err.to_string(),
                },
            )
            .await
        }
    }
}

async fn notify_dropped(sender: &mut Sender, channel: &str, count: u64) -> bool {
    tracing::warn!(channel, count, "websocket session lagged; events dropped");
    send(
        sender,
        &ServerMessage::Dropped {
            channel: channel.to_string(),
            count,
        },
    )
    .await
}
