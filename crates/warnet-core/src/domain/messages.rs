//! Decoder for bitcoind's `-capturemessages` files.
//!
//! Each record is framed as:
//!
//! ```text
//! ┌──────────────┬──────────────────┬──────────────┬────────────┐
//! │ time (8, LE) │ msgtype (12, NUL │ length (4,   │ body       │
//! │ microseconds │ padded ASCII)    │ LE)          │ (length)   │
//! └──────────────┴──────────────────┴──────────────┴────────────┘
//! ```
//!
//! Bodies are decoded with the `bitcoin` crate. Unknown or undecodable
//! messages are kept with a hex body and an error marker.

use bitcoin::consensus::encode;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::Magic;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const HEADER_LEN: usize = 8 + 12 + 4;

pub const UNRECOGNIZED: &str = "Unrecognized message type.";
pub const UNDECODABLE: &str = "Unable to deserialize message.";

/// One captured P2P message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Sent by the capturing node
    pub outbound: bool,
    /// Capture time in microseconds since the epoch
    pub time: u64,
    pub size: usize,
    pub msgtype: String,
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decode every complete record in `data`. A truncated trailing record is dropped.
pub fn parse_capture(data: &[u8], outbound: bool) -> Vec<MessageRecord> {
    let mut records = Vec::new();
    let mut rest = data;
    while rest.len() >= HEADER_LEN {
        let time = u64::from_le_bytes(rest[0..8].try_into().unwrap_or_default());
        let raw_type = &rest[8..20];
        let length = u32::from_le_bytes(rest[20..24].try_into().unwrap_or_default()) as usize;
        let Some(body) = rest.get(HEADER_LEN..HEADER_LEN + length) else {
            break;
        };
        records.push(decode_record(time, raw_type, body, outbound));
        rest = &rest[HEADER_LEN + length..];
    }
    records
}

fn decode_record(time: u64, raw_type: &[u8], body: &[u8], outbound: bool) -> MessageRecord {
    let trimmed: Vec<u8> = raw_type.iter().copied().take_while(|b| *b != 0).collect();
    let msgtype = match std::str::from_utf8(&trimmed) {
        Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => s.to_string(),
        _ => "UNREADABLE".to_string(),
    };
    let mut record = MessageRecord {
        outbound,
        time,
        size: body.len(),
        msgtype: msgtype.clone(),
        body: Value::String(hex::encode(body)),
        error: None,
    };

    match decode_payload(raw_type, body) {
        Ok(NetworkMessage::Unknown { .. }) => record.error = Some(UNRECOGNIZED.to_string()),
        Ok(message) => record.body = summarize(&message),
        Err(_) if msgtype == "UNREADABLE" => record.error = Some(UNRECOGNIZED.to_string()),
        Err(_) => record.error = Some(UNDECODABLE.to_string()),
    }
    record
}

/// Rebuild a full wire frame around the body so the crate's own decoder can
/// dispatch on the command.
fn decode_payload(raw_type: &[u8], body: &[u8]) -> Result<NetworkMessage, encode::Error> {
    let checksum = sha256d::Hash::hash(body).to_byte_array();
    let mut frame = Vec::with_capacity(24 + body.len());
    frame.extend_from_slice(&Magic::REGTEST.to_bytes());
    frame.extend_from_slice(raw_type);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum[..4]);
    frame.extend_from_slice(body);
    let raw: RawNetworkMessage = encode::deserialize(&frame)?;
    Ok(raw.payload().clone())
}

fn summarize(message: &NetworkMessage) -> Value {
    match message {
        NetworkMessage::Version(v) => json!({
            "version": v.version,
            "services": v.services.to_u64(),
            "timestamp": v.timestamp,
            "nonce": v.nonce,
            "user_agent": v.user_agent,
            "start_height": v.start_height,
            "relay": v.relay,
        }),
        NetworkMessage::Ping(nonce) | NetworkMessage::Pong(nonce) => json!({ "nonce": nonce }),
        NetworkMessage::Inv(items) | NetworkMessage::GetData(items) | NetworkMessage::NotFound(items) => {
            json!({ "count": items.len(), "items": items.iter().map(|i| format!("{i:?}")).collect::<Vec<_>>() })
        }
        NetworkMessage::Tx(tx) => json!({
            "txid": tx.compute_txid().to_string(),
            "inputs": tx.input.len(),
            "outputs": tx.output.len(),
        }),
        NetworkMessage::Block(block) => json!({
            "hash": block.block_hash().to_string(),
            "tx_count": block.txdata.len(),
        }),
        NetworkMessage::Headers(headers) => json!({ "count": headers.len() }),
        NetworkMessage::Addr(addrs) => json!({ "count": addrs.len() }),
        NetworkMessage::FeeFilter(rate) => json!({ "feerate": rate }),
        NetworkMessage::SendCmpct(m) => json!({ "announce": m.send_compact, "version": m.version }),
        NetworkMessage::Verack
        | NetworkMessage::SendHeaders
        | NetworkMessage::GetAddr
        | NetworkMessage::WtxidRelay
        | NetworkMessage::SendAddrV2
        | NetworkMessage::MemPool => json!({}),
        other => Value::String(format!("{other:?}")),
    }
}
