use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected platform response: {status}")]
    UnexpectedStatus { status: u16 },

    #[error("payload parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid broker url: {0}")]
    BrokerUrl(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("provisioning is handled by the setup command: {0}")]
    Provisioning(String),
}
