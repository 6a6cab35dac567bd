mod pipeline_jobs;
mod source_impls;
mod source_traits;
mod tracker;
mod wallet_locks;

pub use pipeline_jobs::*;
pub use source_impls::*;
pub use source_traits::*;
pub use tracker::JobTracker;
pub use wallet_locks::WalletLocks;
