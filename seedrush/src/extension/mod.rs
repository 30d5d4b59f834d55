//! Per-piece micropayments carried on a peer-wire extension slot.
//!
//! The serving side withholds a requested block and sends an unsigned offer
//! (`REQUEST`) with a single output paying its own script the piece price. The
//! requesting side funds and signs the offer from its wallet and answers with
//! the signed transaction (`SENT`). The server broadcasts it, credits the
//! session and lets the engine serve the held block. One offer per connection
//! is outstanding at a time.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use bitcoin::{absolute, transaction, Amount, Transaction, TxOut};
use bytes::Bytes;
use crate::{
    broadcast::{BroadcastError, Broadcaster},
    config::{Config, FeePolicy},
    engine::{BlockInfo, EngineError, PeerConn, PeerHooks},
    registry::Registry,
    wallet::{SharedWallet, WalletError},
    UserEvent, UserTx,
};

mod message;

pub use message::{decode_tx, encode_tx, MicroPayRequest, RequestKind};

pub type Result<T, E = ExtensionError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum ExtensionError {

    #[error("malformed message: {0}")]
    Decode(String),

    #[error("offer rejected: {0}")]
    UnexpectedOffer(String),

    #[error("payment of {paid} sats below piece price {price}")]
    Underpaid { paid: u64, price: u64 },

    #[error("payment without an outstanding offer")]
    Unsolicited,

    #[error("connection is not attached to a torrent")]
    NoTorrent,

    #[error("wallet: {0}")]
    Wallet(#[from] WalletError),

    #[error("broadcast: {0}")]
    Broadcast(#[from] BroadcastError),

    #[error("peer: {0}")]
    Peer(#[from] EngineError),
}

// Where a connection stands in the exchange we initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OfferState {

    // Offer sent, waiting for the signed payment.
    Offered,

    // Payment received, broadcast in flight.
    Settling,

}

#[derive(Clone)]
pub struct MicroPayExtension {

    registry: Arc<Registry>,

    wallet: SharedWallet,

    broadcaster: Arc<dyn Broadcaster>,

    user_tx: UserTx,

    extension_id: u8,

    piece_price: u64,

    fees: FeePolicy,

    // Keyed by remote address, at most one entry per connection.
    pending: Arc<Mutex<HashMap<SocketAddr, OfferState>>>,

}

impl MicroPayExtension {

    pub fn new(
        config: &Config,
        registry: Arc<Registry>,
        wallet: SharedWallet,
        broadcaster: Arc<dyn Broadcaster>,
        user_tx: UserTx,
    ) -> Self {
        Self {
            registry,
            wallet,
            broadcaster,
            user_tx,
            extension_id: config.extension_id,
            piece_price: config.piece_price,
            fees: config.fees,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // Handles one inbound extension message on its own task. Failures end the
    // exchange only, the connection stays up.
    pub fn spawn_message(&self, peer: Arc<dyn PeerConn>, payload: Bytes) -> tokio::task::JoinHandle<()> {
        let ext = self.clone();
        tokio::spawn(async move {
            let address = peer.address();
            if let Err(e) = ext.handle_message(peer, &payload).await {
                tracing::warn!("micropayment exchange with {} aborted: {}", address, e);
            }
        })
    }

    pub async fn handle_message(&self, peer: Arc<dyn PeerConn>, payload: &[u8]) -> Result<()> {
        let msg = MicroPayRequest::from_bytes(payload)?;
        match msg.kind {
            RequestKind::Request => self.handle_request(peer.as_ref(), &msg.tx_hex).await.map(|_| ()),
            RequestKind::Sent => self.handle_sent(peer.as_ref(), &msg.tx_hex).await,
        }
    }

    // Pays a remote offer. The wallet stays locked from building the payment
    // until the change is committed, so concurrent offers never spend the same
    // outputs. Returns the amount paid.
    #[tracing::instrument(skip_all, fields(peer = %peer.address()))]
    pub async fn handle_request(&self, peer: &dyn PeerConn, tx_hex: &str) -> Result<u64> {
        let id = peer.info_hash().ok_or(ExtensionError::NoTorrent)?;
        let offer = decode_tx(tx_hex)?;
        let recipient = self.check_offer(&offer)?;

        let mut wallet = self.wallet.lock().await;
        let payment = wallet.prepare_payment(&recipient, self.piece_price, self.fees)?;
        let reply = MicroPayRequest::sent(encode_tx(&payment.tx)?).to_bytes()?;
        peer.write_extended(self.extension_id, reply)?;
        wallet.commit_payment(&payment);
        drop(wallet);

        tracing::info!(
            "paid {} sats for a piece of {} in tx {} (fee {})",
            self.piece_price, id, payment.txid, payment.fee,
        );
        if let Err(e) = self.registry.record_spent(&id, self.piece_price).await {
            tracing::warn!("could not record spend on {}: {}", id, e);
        }
        self.user_tx.send(UserEvent::WalletUpdated).ok();
        Ok(self.piece_price)
    }

    // Settles our outstanding offer with the payment the peer signed. The
    // broadcast runs without any lock held.
    #[tracing::instrument(skip_all, fields(peer = %peer.address()))]
    pub async fn handle_sent(&self, peer: &dyn PeerConn, tx_hex: &str) -> Result<()> {
        let address = peer.address();
        {
            let mut pending = self.lock_pending();
            match pending.get_mut(&address) {
                Some(state) if *state == OfferState::Offered => *state = OfferState::Settling,
                _ => return Err(ExtensionError::Unsolicited),
            }
        }

        let result = self.settle(peer, tx_hex).await;
        self.lock_pending().remove(&address);
        result
    }

    async fn settle(&self, peer: &dyn PeerConn, tx_hex: &str) -> Result<()> {
        let id = peer.info_hash().ok_or(ExtensionError::NoTorrent)?;
        let tx = decode_tx(tx_hex)?;

        let paid: u64 = tx
            .output
            .iter()
            .filter(|out| out.script_pubkey.as_script() == self.wallet.locking_script())
            .map(|out| out.value.to_sat())
            .sum();
        if paid < self.piece_price {
            return Err(ExtensionError::Underpaid { paid, price: self.piece_price });
        }

        self.broadcaster.broadcast(tx_hex).await?;
        tracing::info!("earned {} sats on {} in tx {}", self.piece_price, id, tx.compute_txid());

        if let Err(e) = self.registry.record_earned(&id, self.piece_price).await {
            tracing::warn!("could not record earning on {}: {}", id, e);
        }
        peer.release_request();
        Ok(())
    }

    // Unsigned transaction asking for the piece price to our own script.
    pub fn offer(&self) -> Result<String> {
        let tx = Transaction {
            version: transaction::Version::ONE,
            lock_time: absolute::LockTime::ZERO,
            input: Vec::new(),
            output: vec![TxOut {
                value: Amount::from_sat(self.piece_price),
                script_pubkey: self.wallet.locking_script().to_owned(),
            }],
        };
        encode_tx(&tx)
    }

    fn send_offer(&self, peer: &dyn PeerConn) -> Result<()> {
        let msg = MicroPayRequest::request(self.offer()?).to_bytes()?;
        peer.write_extended(self.extension_id, msg)?;
        Ok(())
    }

    // Only offers shaped like ours are paid: no inputs, a single output for
    // exactly the piece price.
    fn check_offer(&self, offer: &Transaction) -> Result<bitcoin::ScriptBuf> {
        if !offer.input.is_empty() {
            return Err(ExtensionError::UnexpectedOffer(format!("{} inputs", offer.input.len())));
        }
        match offer.output.as_slice() {
            [out] if out.value.to_sat() == self.piece_price => Ok(out.script_pubkey.clone()),
            [out] => Err(ExtensionError::UnexpectedOffer(format!(
                "asks {} sats, price is {}",
                out.value.to_sat(),
                self.piece_price,
            ))),
            outs => Err(ExtensionError::UnexpectedOffer(format!("{} outputs", outs.len()))),
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, OfferState>> {
        // Entries are plain values, a poisoned map is still consistent.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn has_pending_offer(&self, address: &SocketAddr) -> bool {
        self.lock_pending().contains_key(address)
    }
}

impl PeerHooks for MicroPayExtension {

    fn on_extended_message(&self, peer: Arc<dyn PeerConn>, ext_id: u8, payload: Bytes) {
        if ext_id != self.extension_id {
            tracing::trace!("ignoring extension message on slot {}", ext_id);
            return;
        }
        self.spawn_message(peer, payload);
    }

    // Every block is withheld until paid for.
    fn approve_piece_request(&self, peer: Arc<dyn PeerConn>, block: BlockInfo) -> bool {
        let address = peer.address();
        if peer.info_hash().is_none() {
            tracing::debug!("withholding block {:?} from {}, no torrent attached", block, address);
            return false;
        }

        {
            let mut pending = self.lock_pending();
            if pending.contains_key(&address) {
                return false;
            }
            pending.insert(address, OfferState::Offered);
        }

        // The engine may call back into the hooks while writing.
        match self.send_offer(peer.as_ref()) {
            Ok(()) => tracing::debug!("offered piece {} to {}", block.piece_idx, address),
            Err(e) => {
                tracing::warn!("could not send offer to {}: {}", address, e);
                self.lock_pending().remove(&address);
            }
        }
        false
    }

    fn on_peer_closed(&self, peer: &dyn PeerConn) {
        if self.lock_pending().remove(&peer.address()).is_some() {
            tracing::debug!("dropped pending offer to {}", peer.address());
        }
    }
}
