pub mod broker;
pub mod error;
pub mod http;
pub mod proxy;
pub mod ring;
pub mod transport;

pub use broker::{BrokerSettings, BrokerTransport};
pub use error::TransportError;
pub use http::{CheckInResponse, HttpPolling, PlatformClient, PollConfig, Provisioner};
pub use proxy::{proxy_for_url, ProxyEnv};
pub use ring::LogRing;
pub use transport::{echo_update, AgentHandle, RunAction, Transport};
