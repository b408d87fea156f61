use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("transport error: {0}")]
    Transport(#[from] edgeflow_transport::TransportError),

    #[error("launcher error: {0}")]
    Launch(#[from] edgeflow_launcher::LaunchError),

    #[error("store error: {0}")]
    Store(#[from] edgeflow_store::StoreError),
}
