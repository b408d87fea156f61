pub mod error;
pub mod reconcile;
pub mod retry;

pub use error::ReconcileError;
pub use reconcile::Reconciler;
pub use retry::RetryTimer;
