pub mod aggregator;
pub mod backfill;
pub mod candle_store;
pub mod market_cache;
pub mod tick_builder;

// Re-export the main pipeline types (e.g. `use crate::market_data::CandleStore`).
pub use aggregator::CandleAggregator;
pub use backfill::HistoryBackfiller;
pub use candle_store::CandleStore;
pub use market_cache::MarketDataCache;
pub use tick_builder::TickCandleBuilder;
