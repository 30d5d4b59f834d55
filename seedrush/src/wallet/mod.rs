//! Client wallet: spendable outputs, signing credentials and the payment builder.
//!
//! Payments consume the entire UTXO set and leave a single change output
//! behind. The set is replaced as soon as a payment is committed, before the
//! transaction is known to have reached the network; a forced sync restores
//! the indexer's view.

use std::{
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};
use bitcoin::{
    absolute,
    hashes::Hash,
    script::{Builder, PushBytesBuf},
    secp256k1::{Message, Secp256k1},
    sighash::{EcdsaSighashType, SighashCache},
    transaction::{self, OutPoint, Sequence},
    Address, Amount, Network, PrivateKey, PublicKey, Script, ScriptBuf, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use serde_derive::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use crate::config::FeePolicy;

mod keys;
mod indexer;
mod funding;

pub use indexer::UtxoIndexer;
pub use funding::FundingClient;

pub type Result<T, E = WalletError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum WalletError {

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("failed to load credential: {0}")]
    CredentialLoad(String),

    #[error("failed to store credential: {0}")]
    Credential(#[from] std::io::Error),

    #[error("insufficient funds: have {available} sats, need {required} sats")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("wallet sync failed: {0}")]
    Sync(#[from] reqwest::Error),

    #[error("funding request failed: {0}")]
    Funding(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
}

// Unspent output owned by the wallet, as reported by the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {

    pub vout: u32,

    pub satoshis: u64,

    pub txid: String,

}

// A signed transaction ready to hand over, plus the wallet state it leaves behind.
#[derive(Debug, Clone)]
pub struct Payment {

    pub tx: Transaction,

    pub txid: Txid,

    pub input_total: u64,

    pub fee: u64,

    // The only output still spendable by us once the payment is committed.
    pub change: Option<Utxo>,

}

impl Payment {
    pub fn to_hex(&self) -> String {
        bitcoin::consensus::encode::serialize_hex(&self.tx)
    }
}

pub struct Wallet {

    network: Network,

    private_key: PrivateKey,

    public_key: PublicKey,

    address: Address,

    locking_script: ScriptBuf,

    last_sync: Option<Instant>,

    utxos: Vec<Utxo>,

}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address.to_string())
            .field("utxos", &self.utxos)
            .finish_non_exhaustive()
    }
}

impl Wallet {

    pub fn address(&self) -> String {
        self.address.to_string()
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn locking_script(&self) -> &Script {
        &self.locking_script
    }

    pub fn utxos(&self) -> &[Utxo] {
        &self.utxos
    }

    pub fn balance(&self) -> u64 {
        self.utxos.iter().map(|u| u.satoshis).sum()
    }

    pub fn set_utxos(&mut self, utxos: Vec<Utxo>) {
        self.utxos = utxos;
    }

    pub fn add_utxo(&mut self, utxo: Utxo) {
        self.utxos.push(utxo);
    }

    // True when a non forced sync should hit the indexer.
    pub fn sync_due(&self, cooldown: Duration) -> bool {
        self.last_sync.map_or(true, |t| t.elapsed() >= cooldown)
    }

    fn mark_synced(&mut self) {
        self.last_sync = Some(Instant::now());
    }

    // Builds and signs a payment spending every UTXO. Leaves the wallet untouched.
    pub fn prepare_payment(&self, recipient: &Script, amount: u64, fees: FeePolicy) -> Result<Payment> {

        let input_total = self.balance();
        let fee = fees.fee(self.utxos.len());
        let required = amount + fee;
        if input_total < required {
            return Err(WalletError::InsufficientFunds { available: input_total, required });
        }

        let mut tx = Transaction {
            version: transaction::Version::ONE,
            lock_time: absolute::LockTime::ZERO,
            input: Vec::with_capacity(self.utxos.len()),
            output: vec![TxOut {
                value: Amount::from_sat(amount),
                script_pubkey: recipient.to_owned(),
            }],
        };

        for utxo in self.utxos.iter() {
            let txid = Txid::from_str(&utxo.txid)
                .map_err(|e| WalletError::InvalidTransaction(format!("utxo txid {}: {}", utxo.txid, e)))?;
            tx.input.push(TxIn {
                previous_output: OutPoint { txid, vout: utxo.vout },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            });
        }

        let change_amount = input_total - required;
        if change_amount > 0 {
            tx.output.push(TxOut {
                value: Amount::from_sat(change_amount),
                script_pubkey: self.locking_script.clone(),
            });
        }

        self.sign(&mut tx)?;

        let txid = tx.compute_txid();
        let change = (change_amount > 0).then(|| Utxo {
            vout: (tx.output.len() - 1) as u32,
            satoshis: change_amount,
            txid: txid.to_string(),
        });

        Ok(Payment { tx, txid, input_total, fee, change })
    }

    // Spent inputs are gone, only the change output remains.
    pub fn commit_payment(&mut self, payment: &Payment) {
        self.utxos = payment.change.iter().cloned().collect();
    }

    pub fn build_payment(&mut self, recipient: &Script, amount: u64, fees: FeePolicy) -> Result<Payment> {
        let payment = self.prepare_payment(recipient, amount, fees)?;
        self.commit_payment(&payment);
        Ok(payment)
    }

    // P2PKH signatures over every input, SIGHASH_ALL.
    fn sign(&self, tx: &mut Transaction) -> Result<()> {
        let secp = Secp256k1::new();
        let sighash_type = EcdsaSighashType::All;

        let mut script_sigs = Vec::with_capacity(tx.input.len());
        {
            let cache = SighashCache::new(&*tx);
            for idx in 0..tx.input.len() {
                let sighash = cache
                    .legacy_signature_hash(idx, &self.locking_script, sighash_type.to_u32())
                    .map_err(|e| WalletError::Signing(e.to_string()))?;
                let msg = Message::from_digest(sighash.to_byte_array());
                let signature = bitcoin::ecdsa::Signature {
                    signature: secp.sign_ecdsa(&msg, &self.private_key.inner),
                    sighash_type,
                };
                let sig = PushBytesBuf::try_from(signature.to_vec())
                    .map_err(|e| WalletError::Signing(e.to_string()))?;
                script_sigs.push(
                    Builder::new()
                        .push_slice(&sig)
                        .push_key(&self.public_key)
                        .into_script(),
                );
            }
        }

        for (input, script_sig) in tx.input.iter_mut().zip(script_sigs) {
            input.script_sig = script_sig;
        }
        Ok(())
    }
}

// Wallet behind the wallet-scoped lock, shared by peer tasks and the façade.
#[derive(Clone)]
pub struct SharedWallet {

    inner: Arc<Mutex<Wallet>>,

    indexer: UtxoIndexer,

    sync_cooldown: Duration,

    // Immutable after creation, readable without the lock.
    address: String,

    locking_script: ScriptBuf,

}

impl SharedWallet {

    pub fn new(wallet: Wallet, indexer: UtxoIndexer, sync_cooldown: Duration) -> Self {
        Self {
            address: wallet.address(),
            locking_script: wallet.locking_script.clone(),
            inner: Arc::new(Mutex::new(wallet)),
            indexer,
            sync_cooldown,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn locking_script(&self) -> &Script {
        &self.locking_script
    }

    pub async fn lock(&self) -> MutexGuard<'_, Wallet> {
        self.inner.lock().await
    }

    pub async fn balance(&self) -> u64 {
        self.inner.lock().await.balance()
    }

    // Replaces the UTXO set with the indexer's view. Returns false when skipped
    // because of the cooldown. The lock is held across the request so no
    // payment can commit change that the indexer's answer would then erase.
    #[tracing::instrument(skip(self), fields(address = %self.address))]
    pub async fn sync(&self, force: bool) -> Result<bool> {
        let mut wallet = self.inner.lock().await;
        if !force && !wallet.sync_due(self.sync_cooldown) {
            tracing::debug!("sync skipped, cooldown active");
            return Ok(false);
        }

        let utxos = self.indexer.unspent(&self.address).await?;
        tracing::info!("synced {} utxos, balance {} sats", utxos.len(), utxos.iter().map(|u| u.satoshis).sum::<u64>());
        wallet.set_utxos(utxos);
        wallet.mark_synced();
        Ok(true)
    }
}

#[cfg(test)]
mod tests;
