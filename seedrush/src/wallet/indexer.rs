use serde_derive::Deserialize;
use url::Url;
use super::{Result, Utxo};

// Read side of the chain: which outputs an address can still spend.
#[derive(Debug, Clone)]
pub struct UtxoIndexer {

    client: reqwest::Client,

    url: Url,

}

#[derive(Deserialize, Debug, Default)]
struct UnspentResponse {

    #[serde(default)]
    unspent: Vec<Utxo>,

}

impl UtxoIndexer {

    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    pub async fn unspent(&self, address: &str) -> Result<Vec<Utxo>> {
        let url = format!(
            "{}/address/{}/unspent?limit=1000",
            self.url.as_str().trim_end_matches('/'),
            address,
        );
        tracing::debug!("utxo request: {}", url);

        let resp: UnspentResponse = self.client
            .get(url)
            .header("Content-Type", "application/json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp.unspent)
    }
}
