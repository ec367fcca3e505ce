pub mod account_pool;
pub mod billing;
pub mod cache;
pub mod creation;
pub mod ingestor;
pub mod poller;
pub mod retry;
pub mod submission;

pub use account_pool::AccountPool;
pub use billing::BillingFinalizer;
pub use cache::CacheService;
pub use creation::CreationService;
