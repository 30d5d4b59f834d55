use serde_derive::{Deserialize, Serialize};
use crate::config::BroadcastConfig;

pub type Result<T> = std::result::Result<T, BroadcastError>;

#[derive(thiserror::Error, Debug)]
pub enum BroadcastError {

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    // The relay explained why it refused the transaction.
    #[error("{0}")]
    Rejected(String),

    #[error("response code received from relay: {0}")]
    Status(u16),

}

// Hands a signed transaction to the network. Ok means the relay accepted it.
#[async_trait::async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, tx_hex: &str) -> Result<()>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitTx<'a> {
    raw_tx: &'a str,
}

#[derive(Deserialize, Debug, Default)]
struct ErrorBody {
    detail: Option<String>,
}

// Transaction processor reached over its JSON HTTP interface.
pub struct ArcBroadcaster {

    client: reqwest::Client,

    config: BroadcastConfig,

}

impl ArcBroadcaster {

    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn submit(&self, tx_hex: &str) -> Result<()> {
        let url = format!("{}/tx", self.config.url.as_str().trim_end_matches('/'));

        let mut req = self.client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-CumulativeFeeValidation", "true")
            .header("X-WaitFor", &self.config.wait_for)
            .header("X-ForceValidation", "false")
            .header("X-SkipScriptValidation", "true")
            .header("X-SkipTxValidation", "true")
            .json(&SubmitTx { raw_tx: tx_hex });
        if let Some(token) = &self.config.token {
            req = req.header("Authorization", token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp.bytes().await?;
        match serde_json::from_slice::<ErrorBody>(&body) {
            Ok(ErrorBody { detail: Some(detail) }) => Err(BroadcastError::Rejected(detail)),
            _ => Err(BroadcastError::Status(status.as_u16())),
        }
    }
}

#[async_trait::async_trait]
impl Broadcaster for ArcBroadcaster {

    // Fixed interval between attempts, gives up after `max_retries` retries.
    #[tracing::instrument(skip_all)]
    async fn broadcast(&self, tx_hex: &str) -> Result<()> {
        let mut retries = 0;
        loop {
            match self.submit(tx_hex).await {
                Ok(()) => return Ok(()),
                Err(e) if retries >= self.config.max_retries => {
                    tracing::warn!("broadcast failed after {} attempts: {}", retries + 1, e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!("broadcast attempt {} failed: {}", retries + 1, e);
                    retries += 1;
                    tokio::time::sleep(self.config.retry_interval).await;
                }
            }
        }
    }
}
