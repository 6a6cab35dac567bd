use anyhow::Result;
use common::types::{TransactionEvent, WalletInfo};

/// Events for one wallet delivered after a feed cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedBatch {
    pub events: Vec<TransactionEvent>,
    /// Cursor to store once the batch has been aggregated.
    pub next_cursor: i64,
    /// Payloads that could not be decoded; skipped.
    pub malformed: u64,
}

/// Source of classified transaction events. Order within a batch is not guaranteed
/// and events may be redelivered.
pub trait TransactionFeed {
    fn fetch_since(
        &self,
        wallet_id: &str,
        cursor: i64,
    ) -> impl std::future::Future<Output = Result<FeedBatch>> + Send;
}

/// Source of wallet creation dates and types.
pub trait WalletRegistry {
    fn wallet(
        &self,
        wallet_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WalletInfo>>> + Send;

    /// Wallets ordered by `wallet_id`, strictly after `after`.
    fn wallets_after(
        &self,
        after: Option<&str>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WalletInfo>>> + Send;
}
