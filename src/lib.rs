// =============================================================================
// Coinbase Event Engine — market data subscriptions and event triggers
// =============================================================================
//
// Streams tickers and five-minute candles from the Coinbase Advanced Trade
// WebSocket, polls every other candle width over REST, shares both through a
// ref-counted pool, and resolves "wait until this market condition holds"
// requests against that data.
// =============================================================================

pub mod coinbase;
pub mod config;
pub mod indicators;
pub mod market_data;
pub mod stream;
pub mod triggers;
pub mod types;

#[cfg(test)]
mod testing;
