//! External collaborators behind traits

pub mod candle_feed;
pub mod credentials;
pub mod exchange;
pub mod market_data;
pub mod notifications;

pub use candle_feed::{timeframe_duration, RestCandleFeed};
pub use credentials::{
    cipher_from_key, AesGcmCipher, CredentialPair, CredentialStatus, CredentialStore,
    CredentialVault, MissingKeyCipher, SecretCipher,
};
pub use exchange::{DryRunOrderClient, OrderClient, OrderFill, OrderRequest, RestOrderClient};
pub use market_data::{snapshot, CandleMarketData, MarketDataProvider};
pub use notifications::{JobNotification, LogNotifier, Notifier};
