//! Feed Wire Messages
//!
//! JSON frame types exchanged with the market data feed.
//!
//! # Client Frames
//!
//! - `hello`: Opens the session, optionally resuming a previous one
//! - `subscribe` / `unsubscribe`: One frame per subscription key
//! - `ping`: Heartbeat probe
//!
//! # Server Frames
//!
//! - `connection`: Handshake reply carrying the session id
//! - `kline_update` / `trade_update`: Market data
//! - `pong`: Heartbeat reply
//! - `subscribed` / `unsubscribed`: Subscription acks
//! - `error`: Server-side error report

use serde::{Deserialize, Serialize};

use crate::application::services::multiplexer::{OutboundCommand, SubscriptionAck};
use crate::domain::market::{CandlePoint, Channel, Interval, Token, TradeTick};
use crate::domain::subscription::{SubscriptionKey, SubscriptionOp};

// =============================================================================
// Client → Server
// =============================================================================

/// Frames sent by the client.
///
/// # Wire Format (JSON)
/// ```json
/// {"op": "hello", "connectionId": "c-42"}
/// {"op": "subscribe", "token": "SOL", "channels": ["kline"], "intervals": ["1m"]}
/// {"op": "unsubscribe", "token": "SOL", "channels": ["trade"]}
/// {"op": "ping"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Session open.
    Hello {
        /// Session to resume, if any.
        #[serde(
            rename = "connectionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        connection_id: Option<String>,
    },
    /// Start streaming a key.
    Subscribe(SubscriptionBody),
    /// Stop streaming a key.
    Unsubscribe(SubscriptionBody),
    /// Heartbeat probe.
    Ping,
}

/// Target of a subscribe or unsubscribe frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionBody {
    /// Token.
    pub token: Token,
    /// Channels.
    pub channels: Vec<Channel>,
    /// Intervals (kline only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intervals: Vec<Interval>,
}

impl SubscriptionBody {
    /// Body addressing exactly one key.
    #[must_use]
    pub fn for_key(key: &SubscriptionKey) -> Self {
        Self {
            token: key.token.clone(),
            channels: vec![key.channel],
            intervals: key.interval.into_iter().collect(),
        }
    }

    /// Keys addressed by the body.
    #[must_use]
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        SubscriptionKey::expand(&self.token, &self.channels, &self.intervals)
    }
}

impl ClientFrame {
    /// Frame for a queued multiplexer command.
    #[must_use]
    pub fn from_command(command: &OutboundCommand) -> Self {
        let body = SubscriptionBody::for_key(&command.key);
        match command.op {
            SubscriptionOp::Subscribe => Self::Subscribe(body),
            SubscriptionOp::Unsubscribe => Self::Unsubscribe(body),
        }
    }

    /// Operation name used in logs and metrics.
    #[must_use]
    pub const fn op(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::Ping => "ping",
        }
    }
}

// =============================================================================
// Server → Client
// =============================================================================

/// Frames sent by the server.
///
/// # Wire Format (JSON)
/// ```json
/// {"type": "connection", "connectionId": "c-42"}
/// {"type": "kline_update", "token": "SOL", "interval": "1m", "data": {...}}
/// {"type": "trade_update", "token": "SOL", "data": {...}}
/// {"type": "pong"}
/// {"type": "subscribed", "token": "SOL", "channels": ["kline"], "intervals": ["1m"]}
/// {"type": "error", "code": 429, "message": "rate limited"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake reply.
    Connection {
        /// Server-assigned session id.
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
    /// Candle created or updated.
    KlineUpdate {
        /// Token.
        token: Token,
        /// Candle interval.
        interval: Interval,
        /// Candle payload.
        data: CandlePoint,
    },
    /// Trade executed.
    TradeUpdate {
        /// Token.
        token: Token,
        /// Trade payload.
        data: TradeTick,
    },
    /// Heartbeat reply.
    Pong,
    /// Subscribe ack.
    Subscribed(SubscriptionBody),
    /// Unsubscribe ack.
    Unsubscribed(SubscriptionBody),
    /// Server-side error.
    Error {
        /// Error code.
        code: i32,
        /// Description.
        message: String,
    },
}

impl ServerFrame {
    /// Every frame type the client understands.
    pub const TYPES: &'static [&'static str] = &[
        "connection",
        "kline_update",
        "trade_update",
        "pong",
        "subscribed",
        "unsubscribed",
        "error",
    ];

    /// Frame type name used in logs and metrics.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::KlineUpdate { .. } => "kline_update",
            Self::TradeUpdate { .. } => "trade_update",
            Self::Pong => "pong",
            Self::Subscribed(_) => "subscribed",
            Self::Unsubscribed(_) => "unsubscribed",
            Self::Error { .. } => "error",
        }
    }

    /// Subscription ack carried by the frame, if any.
    #[must_use]
    pub fn ack(&self) -> Option<SubscriptionAck> {
        match self {
            Self::Subscribed(body) => Some(SubscriptionAck {
                op: SubscriptionOp::Subscribe,
                keys: body.keys(),
            }),
            Self::Unsubscribed(body) => Some(SubscriptionAck {
                op: SubscriptionOp::Unsubscribe,
                keys: body.keys(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_omits_missing_connection_id() {
        let fresh = serde_json::to_string(&ClientFrame::Hello {
            connection_id: None,
        })
        .unwrap();
        assert_eq!(fresh, r#"{"op":"hello"}"#);

        let resumed = serde_json::to_string(&ClientFrame::Hello {
            connection_id: Some("c-1".to_string()),
        })
        .unwrap();
        assert_eq!(resumed, r#"{"op":"hello","connectionId":"c-1"}"#);
    }

    #[test]
    fn subscribe_frame_for_kline_key() {
        let command = OutboundCommand {
            epoch: 1,
            op: SubscriptionOp::Subscribe,
            key: SubscriptionKey::kline("SOL", Interval::OneMinute),
        };

        let json = serde_json::to_string(&ClientFrame::from_command(&command)).unwrap();
        assert_eq!(
            json,
            r#"{"op":"subscribe","token":"SOL","channels":["kline"],"intervals":["1m"]}"#
        );
    }

    #[test]
    fn unsubscribe_frame_for_trade_key_has_no_intervals() {
        let command = OutboundCommand {
            epoch: 1,
            op: SubscriptionOp::Unsubscribe,
            key: SubscriptionKey::trade("SOL"),
        };

        let json = serde_json::to_string(&ClientFrame::from_command(&command)).unwrap();
        assert_eq!(json, r#"{"op":"unsubscribe","token":"SOL","channels":["trade"]}"#);
    }

    #[test]
    fn ping_frame() {
        assert_eq!(
            serde_json::to_string(&ClientFrame::Ping).unwrap(),
            r#"{"op":"ping"}"#
        );
    }

    #[test]
    fn parse_connection_frame() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"connection","connectionId":"abc"}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Connection {
                connection_id: "abc".to_string()
            }
        );
    }

    #[test]
    fn parse_trade_update() {
        let json = r#"{"type":"trade_update","token":"SOL","data":{"price":"1.5",
            "quantity":"10","timestamp":5,"isBuyerMaker":true,"tradeId":"t-9"}}"#;
        let frame: ServerFrame = serde_json::from_str(json).unwrap();

        match frame {
            ServerFrame::TradeUpdate { token, data } => {
                assert_eq!(token, "SOL");
                assert_eq!(data.trade_id, "t-9");
                assert!(data.is_buyer_maker);
            }
            other => panic!("expected trade update, got {other:?}"),
        }
    }

    #[test]
    fn subscribed_ack_expands_keys() {
        let frame: ServerFrame = serde_json::from_str(
            r#"{"type":"subscribed","token":"SOL","channels":["kline","trade"],"intervals":["1m","1h"]}"#,
        )
        .unwrap();

        let ack = frame.ack().unwrap();
        assert_eq!(ack.op, SubscriptionOp::Subscribe);
        assert_eq!(ack.keys.len(), 3);
        assert!(ack.keys.contains(&SubscriptionKey::trade("SOL")));
    }

    #[test]
    fn message_types_are_listed() {
        for frame in [
            ServerFrame::Pong,
            ServerFrame::Error {
                code: 1,
                message: String::new(),
            },
        ] {
            assert!(ServerFrame::TYPES.contains(&frame.message_type()));
        }
    }
}
