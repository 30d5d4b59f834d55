use serde_derive::{Deserialize, Serialize};
use bitcoin::Script;
use url::Url;
use super::{Result, Utxo, WalletError};

const FUNDING_LABEL: &str = "SEEDRUSH";

// Asks the user's own wallet, over its JSON HTTP interface, to pay into ours.
#[derive(Debug, Clone)]
pub struct FundingClient {

    client: reqwest::Client,

    url: Url,

    originator: String,

}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CreateActionArgs<'a> {
    description: &'a str,
    outputs: Vec<ActionOutput<'a>>,
    labels: Vec<&'a str>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ActionOutput<'a> {
    output_description: &'a str,
    satoshis: u64,
    locking_script: String,
    tags: Vec<&'a str>,
}

#[derive(Deserialize, Debug)]
struct CreateActionResult {
    txid: Option<String>,
}

impl FundingClient {

    pub fn new(url: Url, originator: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            originator,
        }
    }

    // Returns the funding output, which always sits at index 0.
    pub async fn request_funds(&self, locking_script: &Script, amount: u64) -> Result<Utxo> {
        let args = CreateActionArgs {
            description: "TopUp SeedRush Wallet",
            outputs: vec![ActionOutput {
                output_description: "TopUp SeedRush Wallet Output",
                satoshis: amount,
                locking_script: hex::encode(locking_script.as_bytes()),
                tags: vec![FUNDING_LABEL],
            }],
            labels: vec![FUNDING_LABEL],
        };

        let url = format!("{}/createAction", self.url.as_str().trim_end_matches('/'));
        let resp = self.client
            .post(url)
            .header("Originator", &self.originator)
            .json(&args)
            .send()
            .await
            .map_err(|e| WalletError::Funding(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WalletError::Funding(format!("{}: {}", status, body)));
        }

        let result: CreateActionResult = resp
            .json()
            .await
            .map_err(|e| WalletError::Funding(e.to_string()))?;
        let txid = result
            .txid
            .ok_or_else(|| WalletError::Funding("wallet returned no txid".to_string()))?;

        tracing::info!("funding action created: {} ({} sats)", txid, amount);
        Ok(Utxo { vout: 0, satoshis: amount, txid })
    }
}
