//! # Wire Protocol
//!
//! Typed model of the JSON messages exchanged with a Stargrid server, plus
//! the structural classification of inbound payloads.
//!
//! Server → client messages have mutually exclusive top-level shapes:
//! `{"block": {..}}`, `{"tx": {"id": .., "tx": {..}}}` and
//! `{"subscription": {"id": .., "error"?: ..}}`. Anything else is an
//! unknown control message and is dropped, keeping the client forward
//! compatible. Classification inspects the top-level key first and only
//! then decodes the payload, so an unknown shape is never a decode error
//! while a malformed known shape always is.
//!
//! Event attributes use the keyed-object schema: one
//! `{"value": .., "indexed": ..}` object per attribute name.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;

use crate::error::ClientError;
use crate::filter::EventFilter;
use crate::registry::SubscriptionId;

/// The terminal {code, reason} pair delivered when a session ends.
/// Produced exactly once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: Option<String>,
}

/// A block streamed by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct Block {
    /// Raw block bytes as transmitted by the server.
    pub raw: String,
    #[serde(deserialize_with = "u64_lenient")]
    pub height: u64,
    pub hash: String,
    pub chain_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// A transaction event, correlated to one subscription.
#[derive(Debug, Clone)]
pub struct Tx {
    /// The subscription the server matched this transaction to.
    pub subscription_id: SubscriptionId,
    pub raw: String,
    /// Execution error, if the transaction failed on-chain.
    pub error: Option<TxError>,
    pub height: u64,
    /// Raw bytes of the transaction itself.
    pub tx: String,
    /// Hash of the transaction, usable for explorer lookups.
    pub txhash: String,
    pub events: Vec<Event>,
}

/// On-chain execution failure attached to a [`Tx`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TxError {
    pub code: u32,
    pub codespace: String,
    pub message: String,
}

/// A domain event inside a block or transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Name of the event as encountered in the chain logs.
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, EventAttribute>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventAttribute {
    pub value: String,
    /// Whether the chain indexes this attribute.
    #[serde(default)]
    pub indexed: bool,
}

/// Acknowledgement (or rejection) of a prior transaction subscription.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SubscriptionAck {
    pub id: SubscriptionId,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize)]
struct TxEnvelope {
    id: SubscriptionId,
    tx: TxBody,
}

#[derive(Deserialize)]
struct TxBody {
    raw: String,
    #[serde(default)]
    error: Option<TxError>,
    #[serde(deserialize_with = "u64_lenient")]
    height: u64,
    tx: String,
    txhash: String,
    #[serde(default)]
    events: Vec<Event>,
}

impl From<TxEnvelope> for Tx {
    fn from(env: TxEnvelope) -> Self {
        Tx {
            subscription_id: env.id,
            raw: env.tx.raw,
            error: env.tx.error,
            height: env.tx.height,
            tx: env.tx.tx,
            txhash: env.tx.txhash,
            events: env.tx.events,
        }
    }
}

/// One classified inbound payload.
#[derive(Debug)]
pub(crate) enum Inbound {
    Block(Block),
    Tx(Tx),
    Ack(SubscriptionAck),
    /// Unrecognized control message; dropped without error.
    Unknown,
}

impl Inbound {
    /// Classifies and decodes a raw inbound text payload.
    pub(crate) fn parse(text: &str) -> Result<Self, ClientError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ClientError::Decode(e.to_string()))?;
        let Some(object) = value.as_object() else {
            return Err(ClientError::Decode("payload is not a JSON object".into()));
        };

        if let Some(block) = object.get("block") {
            serde_json::from_value::<Block>(block.clone())
                .map(Inbound::Block)
                .map_err(|e| ClientError::Decode(format!("bad block payload: {e}")))
        } else if let Some(tx) = object.get("tx") {
            serde_json::from_value::<TxEnvelope>(tx.clone())
                .map(|env| Inbound::Tx(env.into()))
                .map_err(|e| ClientError::Decode(format!("bad tx payload: {e}")))
        } else if let Some(sub) = object.get("subscription") {
            serde_json::from_value::<SubscriptionAck>(sub.clone())
                .map(Inbound::Ack)
                .map_err(|e| ClientError::Decode(format!("bad subscription payload: {e}")))
        } else {
            Ok(Inbound::Unknown)
        }
    }
}

/// `{"subscribe": "blocks"}`
pub(crate) fn subscribe_blocks_frame() -> String {
    json!({ "subscribe": "blocks" }).to_string()
}

/// `{"subscribe": {"txs": {"id": .., "filters": [..]}}}`
pub(crate) fn subscribe_txs_frame(id: SubscriptionId, filters: &[EventFilter]) -> String {
    json!({ "subscribe": { "txs": { "id": id, "filters": filters } } }).to_string()
}

/// Accepts heights encoded either as a JSON number or as a decimal string;
/// feeds differ on this and both forms are in the wild.
fn u64_lenient<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterExpr;

    #[test]
    fn classifies_block() {
        let payload = r#"{"block":{"raw":"AAAA","height":"42","hash":"0xabc","chain_id":"stargrid-1","time":"2024-01-15T10:30:00Z","events":[]}}"#;
        match Inbound::parse(payload).unwrap() {
            Inbound::Block(block) => {
                assert_eq!(block.height, 42);
                assert_eq!(block.chain_id, "stargrid-1");
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[test]
    fn classifies_tx_with_numeric_height() {
        let payload = r#"{"tx":{"id":7,"tx":{"raw":"AAAA","height":1234,"tx":"BBBB","txhash":"0xdef","events":[{"name":"transfer","attributes":{"amount":{"value":"100","indexed":true}}}]}}}"#;
        match Inbound::parse(payload).unwrap() {
            Inbound::Tx(tx) => {
                assert_eq!(tx.subscription_id, 7);
                assert_eq!(tx.height, 1234);
                assert!(tx.error.is_none());
                let attr = &tx.events[0].attributes["amount"];
                assert_eq!(attr.value, "100");
                assert!(attr.indexed);
            }
            other => panic!("expected tx, got {other:?}"),
        }
    }

    #[test]
    fn classifies_ack_with_error() {
        let payload = r#"{"subscription":{"id":3,"error":"invalid filter"}}"#;
        match Inbound::parse(payload).unwrap() {
            Inbound::Ack(ack) => {
                assert_eq!(ack.id, 3);
                assert_eq!(ack.error.as_deref(), Some("invalid filter"));
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn unknown_top_level_key_is_not_an_error() {
        assert!(matches!(
            Inbound::parse(r#"{"heartbeat":{}}"#).unwrap(),
            Inbound::Unknown
        ));
    }

    #[test]
    fn malformed_known_shape_is_a_decode_error() {
        let result = Inbound::parse(r#"{"tx":{"id":"not a number"}}"#);
        assert!(matches!(result, Err(ClientError::Decode(_))));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        assert!(matches!(
            Inbound::parse("{nope"),
            Err(ClientError::Decode(_))
        ));
    }

    #[test]
    fn subscribe_frames_wire_shape() {
        assert_eq!(subscribe_blocks_frame(), r#"{"subscribe":"blocks"}"#);

        let filters =
            vec![EventFilter::new().with("transfer", "amount", FilterExpr::matches("100"))];
        assert_eq!(
            subscribe_txs_frame(1, &filters),
            r#"{"subscribe":{"txs":{"filters":[{"transfer":{"amount":{"match":"100"}}}],"id":1}}}"#
        );
    }

    #[test]
    fn tx_error_decodes() {
        let payload = r#"{"tx":{"id":1,"tx":{"raw":"AA","error":{"code":5,"codespace":"sdk","message":"insufficient funds"},"height":"9","tx":"BB","txhash":"0x1","events":[]}}}"#;
        match Inbound::parse(payload).unwrap() {
            Inbound::Tx(tx) => {
                let err = tx.error.expect("tx error");
                assert_eq!(err.code, 5);
                assert_eq!(err.codespace, "sdk");
            }
            other => panic!("expected tx, got {other:?}"),
        }
    }
}
