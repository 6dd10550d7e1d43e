//! WebSocket Topic Definitions
//!
//! Topic strings as subscribers send them:
//! `price:<symbol>`, `orderbook:<symbol>`, `trades:<symbol>`,
//! `userOrders:<userId>`, `userTrades:<userId>`, `userAssets:<userId>`.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Price(String),
    OrderBook(String),
    Trades(String),
    UserOrders(i64),
    UserTrades(i64),
    UserAssets(i64),
}

impl Topic {
    pub fn parse(raw: &str) -> Option<Self> {
        let (kind, rest) = raw.split_once(':')?;
        match kind {
            "price" => Some(Topic::Price(rest.to_uppercase())),
            "orderbook" => Some(Topic::OrderBook(rest.to_uppercase())),
            "trades" => Some(Topic::Trades(rest.to_uppercase())),
            "userOrders" => rest.parse().ok().map(Topic::UserOrders),
            "userTrades" => rest.parse().ok().map(Topic::UserTrades),
            "userAssets" => rest.parse().ok().map(Topic::UserAssets),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Price(symbol) => write!(f, "price:{}", symbol),
            Topic::OrderBook(symbol) => write!(f, "orderbook:{}", symbol),
            Topic::Trades(symbol) => write!(f, "trades:{}", symbol),
            Topic::UserOrders(user_id) => write!(f, "userOrders:{}", user_id),
            Topic::UserTrades(user_id) => write!(f, "userTrades:{}", user_id),
            Topic::UserAssets(user_id) => write!(f, "userAssets:{}", user_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_market_topics() {
        assert_eq!(
            Topic::parse("price:btcusdt"),
            Some(Topic::Price("BTCUSDT".to_string()))
        );
        assert_eq!(
            Topic::parse("orderbook:BTCUSDT"),
            Some(Topic::OrderBook("BTCUSDT".to_string()))
        );
        assert_eq!(
            Topic::parse("trades:BTCUSDT"),
            Some(Topic::Trades("BTCUSDT".to_string()))
        );
    }

    #[test]
    fn test_parse_user_topics() {
        assert_eq!(Topic::parse("userOrders:42"), Some(Topic::UserOrders(42)));
        assert_eq!(Topic::parse("userTrades:42"), Some(Topic::UserTrades(42)));
        assert_eq!(Topic::parse("userAssets:42"), Some(Topic::UserAssets(42)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(Topic::parse("klines:BTCUSDT"), None);
        assert_eq!(Topic::parse("userOrders:abc"), None);
        assert_eq!(Topic::parse("price"), None);
    }

    #[test]
    fn test_round_trip() {
        for raw in [
            "price:BTCUSDT",
            "orderbook:BTCUSDT",
            "trades:BTCUSDT",
            "userOrders:7",
            "userTrades:7",
            "userAssets:7",
        ] {
            assert_eq!(Topic::parse(raw).unwrap().to_string(), raw);
        }
    }
}
