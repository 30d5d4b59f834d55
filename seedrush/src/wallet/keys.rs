use std::path::Path;
use bip39::Mnemonic;
use bitcoin::{bip32::Xpriv, secp256k1::Secp256k1, Address, Network, PrivateKey, PublicKey, ScriptBuf};
use super::{Result, Wallet, WalletError};

impl Wallet {

    // Fresh credential: entropy -> mnemonic -> seed -> master key -> signing key.
    pub fn create(network: Network) -> Result<Wallet> {
        let entropy: [u8; 32] = rand::random();
        let mnemonic = Mnemonic::from_entropy(&entropy)
            .map_err(|e| WalletError::KeyGeneration(e.to_string()))?;
        let seed = mnemonic.to_seed("");
        let master = Xpriv::new_master(network, &seed)
            .map_err(|e| WalletError::KeyGeneration(e.to_string()))?;
        Ok(Wallet::from_private_key(master.to_priv()))
    }

    // Rebuilds the wallet from a WIF credential file.
    pub fn load(path: &Path) -> Result<Wallet> {
        let wif = std::fs::read_to_string(path)
            .map_err(|e| WalletError::CredentialLoad(format!("{}: {}", path.display(), e)))?;
        let private_key = PrivateKey::from_wif(wif.trim())
            .map_err(|e| WalletError::CredentialLoad(format!("{}: {}", path.display(), e)))?;
        Ok(Wallet::from_private_key(private_key))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.private_key.to_wif())?;
        Ok(())
    }

    // Loads the credential file, creating and storing a new wallet on first run.
    pub fn load_or_create(path: &Path, network: Network) -> Result<Wallet> {
        if path.exists() {
            let wallet = Wallet::load(path)?;
            tracing::info!("loaded wallet {}", wallet.address());
            return Ok(wallet);
        }

        let wallet = Wallet::create(network)?;
        wallet.save(path)?;
        tracing::info!("created wallet {}", wallet.address());
        Ok(wallet)
    }

    pub fn from_private_key(private_key: PrivateKey) -> Wallet {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_private_key(&secp, &private_key);
        let pubkey_hash = public_key.pubkey_hash();
        let network = match private_key.network {
            bitcoin::NetworkKind::Main => Network::Bitcoin,
            bitcoin::NetworkKind::Test => Network::Testnet,
        };

        Wallet {
            network,
            address: Address::p2pkh(pubkey_hash, network),
            locking_script: ScriptBuf::new_p2pkh(&pubkey_hash),
            private_key,
            public_key,
            last_sync: None,
            utxos: Vec::new(),
        }
    }
}
