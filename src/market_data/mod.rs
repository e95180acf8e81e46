pub mod candle_buffer;
pub mod poller;
pub mod pool;
pub mod ticker;

pub use candle_buffer::{Candle, CandleBuffer, CandleKey};
pub use poller::{PollSettings, PollingConnection};
pub use pool::{
    CandleCallback, DisconnectCallback, MarketDataPool, PoolDeps, PoolSettings, ResourceKey,
    SubscriptionId, TickerCallback,
};
pub use ticker::{Ticker, TickerCache};
