pub mod auth;
pub mod client;
pub(crate) mod de;

pub use auth::{AnonymousSigner, CdpKeySigner, TokenSigner};
pub use client::{CandleFetcher, CoinbaseClient, MAX_CANDLES_PER_REQUEST};
