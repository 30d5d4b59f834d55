use bitcoin::{
    absolute,
    consensus::{Decodable, Encodable},
    transaction, Transaction, TxIn, TxOut,
};
use serde_derive::{Deserialize, Serialize};
use super::{ExtensionError, Result};

const REQUEST: &str = "REQUEST";
const SENT: &str = "SENT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {

    // Unsigned offer from the serving peer: one output, the price, its script.
    Request,

    // Signed payment answering an offer.
    Sent,

}

// Payload of one micropayment extension message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicroPayRequest {

    pub kind: RequestKind,

    pub tx_hex: String,

}

// Bencoded dictionary as it travels on the wire.
#[derive(Serialize, Deserialize, Debug)]
struct WireRecord {

    #[serde(rename = "type")]
    kind: String,

    txhex: String,

}

impl MicroPayRequest {

    pub fn request(tx_hex: String) -> Self {
        Self { kind: RequestKind::Request, tx_hex }
    }

    pub fn sent(tx_hex: String) -> Self {
        Self { kind: RequestKind::Sent, tx_hex }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let kind = match self.kind {
            RequestKind::Request => REQUEST,
            RequestKind::Sent => SENT,
        };
        let record = WireRecord { kind: kind.to_string(), txhex: self.tx_hex.clone() };
        serde_bencode::to_bytes(&record).map_err(|e| ExtensionError::Decode(e.to_string()))
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        let record: WireRecord = serde_bencode::from_bytes(payload)
            .map_err(|e| ExtensionError::Decode(e.to_string()))?;
        let kind = match record.kind.as_str() {
            REQUEST => RequestKind::Request,
            SENT => RequestKind::Sent,
            other => return Err(ExtensionError::Decode(format!("unknown message type {:?}", other))),
        };
        Ok(Self { kind, tx_hex: record.txhex })
    }
}

// Transactions are exchanged in the pre-segwit layout. An offer has no inputs,
// which the segwit-aware consensus codec would otherwise read as a marker byte.
pub fn encode_tx(tx: &Transaction) -> Result<String> {
    let mut buf = Vec::new();
    tx.version.consensus_encode(&mut buf).map_err(encode_err)?;
    tx.input.consensus_encode(&mut buf).map_err(encode_err)?;
    tx.output.consensus_encode(&mut buf).map_err(encode_err)?;
    tx.lock_time.consensus_encode(&mut buf).map_err(encode_err)?;
    Ok(hex::encode(buf))
}

pub fn decode_tx(tx_hex: &str) -> Result<Transaction> {
    let bytes = hex::decode(tx_hex.trim()).map_err(|e| ExtensionError::Decode(e.to_string()))?;
    let mut r = bytes.as_slice();

    let version = transaction::Version::consensus_decode(&mut r).map_err(decode_err)?;
    let input = Vec::<TxIn>::consensus_decode(&mut r).map_err(decode_err)?;
    let output = Vec::<TxOut>::consensus_decode(&mut r).map_err(decode_err)?;
    let lock_time = absolute::LockTime::consensus_decode(&mut r).map_err(decode_err)?;
    if !r.is_empty() {
        return Err(ExtensionError::Decode(format!("{} trailing bytes after transaction", r.len())));
    }

    Ok(Transaction { version, lock_time, input, output })
}

fn encode_err(e: bitcoin::io::Error) -> ExtensionError {
    ExtensionError::Decode(format!("encoding transaction: {}", e))
}

fn decode_err(e: bitcoin::consensus::encode::Error) -> ExtensionError {
    ExtensionError::Decode(format!("decoding transaction: {}", e))
}
