use bitcoin::{
    blockdata::script::Instruction,
    hashes::Hash,
    secp256k1::{Message, Secp256k1},
    sighash::{EcdsaSighashType, SighashCache},
};
use crate::testing::{fake_txid, funded_wallet, MockServer};
use super::*;

const FEES: FeePolicy = FeePolicy { per_input: 20, base: 10 };

fn recipient() -> ScriptBuf {
    Wallet::create(Network::Bitcoin).unwrap().locking_script().to_owned()
}

#[test]
fn test_single_utxo_payment() {
    let mut wallet = funded_wallet(&[1000]);
    let to = recipient();

    let payment = wallet.build_payment(&to, 100, FEES).unwrap();

    assert_eq!(payment.fee, 30);
    assert_eq!(payment.input_total, 1000);
    assert_eq!(payment.tx.input.len(), 1);
    assert_eq!(payment.tx.output.len(), 2);
    assert_eq!(payment.tx.output[0].value, Amount::from_sat(100));
    assert_eq!(payment.tx.output[0].script_pubkey, to);
    assert_eq!(payment.tx.output[1].value, Amount::from_sat(870));
    assert_eq!(&payment.tx.output[1].script_pubkey, wallet.locking_script());

    // Change is recorded at its real output index, 1, behind the payment
    // output; it is not renumbered to 0.
    assert_eq!(
        wallet.utxos(),
        &[Utxo { vout: 1, satoshis: 870, txid: payment.txid.to_string() }]
    );
    assert_eq!(wallet.balance(), 870);
}

#[test]
fn test_all_utxos_consumed() {
    let mut wallet = funded_wallet(&[60, 70, 80]);
    let payment = wallet.build_payment(&recipient(), 100, FEES).unwrap();

    // 210 in, 100 out, 70 fee.
    assert_eq!(payment.tx.input.len(), 3);
    assert_eq!(payment.fee, 70);
    assert_eq!(payment.change.as_ref().map(|c| c.satoshis), Some(40));
    let spent: Vec<_> = payment.tx.input.iter().map(|i| i.previous_output.txid.to_string()).collect();
    assert_eq!(spent, vec![fake_txid(1), fake_txid(2), fake_txid(3)]);
}

#[test]
fn test_exact_amount_leaves_no_change() {
    let mut wallet = funded_wallet(&[130]);
    let payment = wallet.build_payment(&recipient(), 100, FEES).unwrap();

    assert!(payment.change.is_none());
    assert_eq!(payment.tx.output.len(), 1);
    assert!(wallet.utxos().is_empty());
    assert_eq!(wallet.balance(), 0);
}

#[test]
fn test_insufficient_funds_keeps_utxos() {
    let mut wallet = funded_wallet(&[50, 50]);
    let before = wallet.utxos().to_vec();

    // Needs 100 + 2*20 + 10 = 150.
    match wallet.build_payment(&recipient(), 100, FEES) {
        Err(WalletError::InsufficientFunds { available, required }) => {
            assert_eq!(available, 100);
            assert_eq!(required, 150);
        }
        other => panic!("expected insufficient funds, got {:?}", other.map(|p| p.txid)),
    }
    assert_eq!(wallet.utxos(), before.as_slice());
}

#[test]
fn test_empty_wallet() {
    let mut wallet = funded_wallet(&[]);
    assert!(matches!(
        wallet.build_payment(&recipient(), 100, FEES),
        Err(WalletError::InsufficientFunds { available: 0, required: 110 })
    ));
}

#[test]
fn test_prepare_does_not_commit() {
    let wallet = funded_wallet(&[1000]);
    let payment = wallet.prepare_payment(&recipient(), 100, FEES).unwrap();
    assert_eq!(wallet.balance(), 1000);
    assert_eq!(payment.change.map(|c| c.satoshis), Some(870));
}

#[test]
fn test_invalid_utxo_txid() {
    let mut wallet = funded_wallet(&[]);
    wallet.add_utxo(Utxo { vout: 0, satoshis: 1000, txid: "not-a-txid".into() });
    assert!(matches!(
        wallet.prepare_payment(&recipient(), 100, FEES),
        Err(WalletError::InvalidTransaction(_))
    ));
}

#[test]
fn test_inputs_signed() {
    let mut wallet = funded_wallet(&[500, 500]);
    let payment = wallet.build_payment(&recipient(), 100, FEES).unwrap();
    let secp = Secp256k1::verification_only();
    let cache = SighashCache::new(&payment.tx);

    for (idx, input) in payment.tx.input.iter().enumerate() {
        let pushes: Vec<_> = input
            .script_sig
            .instructions()
            .map(|i| match i.unwrap() {
                Instruction::PushBytes(bytes) => bytes.as_bytes().to_vec(),
                Instruction::Op(op) => panic!("unexpected opcode {}", op),
            })
            .collect();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[1], wallet.public_key.to_bytes());

        let signature = bitcoin::ecdsa::Signature::from_slice(&pushes[0]).unwrap();
        assert_eq!(signature.sighash_type, EcdsaSighashType::All);

        let sighash = cache
            .legacy_signature_hash(idx, wallet.locking_script(), EcdsaSighashType::All.to_u32())
            .unwrap();
        let msg = Message::from_digest(sighash.to_byte_array());
        secp.verify_ecdsa(&msg, &signature.signature, &wallet.public_key.inner).unwrap();
    }

    let hex = payment.to_hex();
    let decoded: Transaction = bitcoin::consensus::deserialize(&hex::decode(hex).unwrap()).unwrap();
    assert_eq!(decoded.compute_txid(), payment.txid);
}

#[test]
fn test_credential_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("wif.txt");

    let created = Wallet::load_or_create(&path, Network::Bitcoin).unwrap();
    assert!(path.exists());

    let loaded = Wallet::load_or_create(&path, Network::Bitcoin).unwrap();
    assert_eq!(created.address(), loaded.address());
    assert_eq!(created.locking_script(), loaded.locking_script());
    assert_eq!(loaded.network(), Network::Bitcoin);
    assert!(loaded.address().starts_with('1'));
}

#[test]
fn test_corrupt_credential() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wif.txt");
    std::fs::write(&path, "garbage").unwrap();

    assert!(matches!(
        Wallet::load_or_create(&path, Network::Bitcoin),
        Err(WalletError::CredentialLoad(_))
    ));
    // Left for the user to inspect, not overwritten.
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "garbage");
}

fn indexer_body(utxos: &[(u32, u64, String)]) -> String {
    let unspent: Vec<_> = utxos
        .iter()
        .map(|(vout, satoshis, txid)| serde_json::json!({ "vout": vout, "satoshis": satoshis, "txid": txid }))
        .collect();
    serde_json::json!({ "address": "ignored", "unspent": unspent }).to_string()
}

#[tokio::test]
async fn test_sync_replaces_utxos() {
    let body = indexer_body(&[(0, 400, fake_txid(7)), (2, 600, fake_txid(8))]);
    let server = MockServer::start(move |_| (200, body.clone())).await;
    let wallet = SharedWallet::new(
        funded_wallet(&[5]),
        UtxoIndexer::new(server.url.clone()),
        Duration::from_secs(300),
    );

    assert!(wallet.sync(false).await.unwrap());
    assert_eq!(wallet.balance().await, 1000);
    assert_eq!(wallet.lock().await.utxos()[1], Utxo { vout: 2, satoshis: 600, txid: fake_txid(8) });

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(
        requests[0].path,
        format!("/address/{}/unspent?limit=1000", wallet.address())
    );
}

#[tokio::test]
async fn test_sync_cooldown() {
    let body = indexer_body(&[(0, 400, fake_txid(7))]);
    let server = MockServer::start(move |_| (200, body.clone())).await;
    let wallet = SharedWallet::new(
        funded_wallet(&[]),
        UtxoIndexer::new(server.url.clone()),
        Duration::from_secs(300),
    );

    assert!(wallet.sync(false).await.unwrap());
    assert!(!wallet.sync(false).await.unwrap());
    assert_eq!(server.hits(), 1);

    assert!(wallet.sync(true).await.unwrap());
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn test_payment_waits_for_running_sync() {
    let body = indexer_body(&[(0, 1000, fake_txid(1))]);
    let server = MockServer::start_delayed(Duration::from_millis(300), move |_| (200, body.clone())).await;
    let wallet = SharedWallet::new(
        funded_wallet(&[1000]),
        UtxoIndexer::new(server.url.clone()),
        Duration::from_secs(300),
    );

    let syncing = wallet.clone();
    let sync = tokio::spawn(async move { syncing.sync(true).await });
    // Let the sync take the wallet and start its request.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let to = recipient();
    let first = wallet.lock().await.build_payment(&to, 100, FEES).unwrap();
    assert!(sync.await.unwrap().unwrap());
    assert_eq!(server.hits(), 1);

    // The sync answer must not bring the spent output back.
    assert_eq!(
        wallet.lock().await.utxos(),
        &[Utxo { vout: 1, satoshis: 870, txid: first.txid.to_string() }]
    );
    let second = wallet.lock().await.build_payment(&to, 100, FEES).unwrap();
    assert_eq!(second.tx.input.len(), 1);
    assert_eq!(second.tx.input[0].previous_output, OutPoint { txid: first.txid, vout: 1 });
    assert_ne!(second.tx.input[0].previous_output, first.tx.input[0].previous_output);
}

#[tokio::test]
async fn test_failed_sync_keeps_utxos() {
    let server = MockServer::start(|_| (500, "{}".into())).await;
    let wallet = SharedWallet::new(
        funded_wallet(&[250]),
        UtxoIndexer::new(server.url.clone()),
        Duration::from_secs(300),
    );

    assert!(matches!(wallet.sync(true).await, Err(WalletError::Sync(_))));
    assert_eq!(wallet.balance().await, 250);
    // A failed sync does not start the cooldown.
    assert!(wallet.lock().await.sync_due(Duration::from_secs(300)));
}

#[tokio::test]
async fn test_funding_request() {
    let server = MockServer::start(|req| {
        assert_eq!(req.path, "/createAction");
        (200, serde_json::json!({ "txid": fake_txid(42) }).to_string())
    })
    .await;
    let wallet = funded_wallet(&[]);
    let client = FundingClient::new(server.url.clone(), "seedrush.test".into());

    let utxo = client.request_funds(wallet.locking_script(), 5000).await.unwrap();
    assert_eq!(utxo, Utxo { vout: 0, satoshis: 5000, txid: fake_txid(42) });

    let requests = server.requests();
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].headers.get("originator").map(String::as_str), Some("seedrush.test"));
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["outputs"][0]["satoshis"], 5000);
    assert_eq!(
        body["outputs"][0]["lockingScript"],
        hex::encode(wallet.locking_script().as_bytes())
    );
}
