//! DexScreener market data.

mod dex_client;
mod feed;
mod types;

pub use dex_client::DexClient;
pub use feed::{MarketFeed, SnapshotHistory};
