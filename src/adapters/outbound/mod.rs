pub mod credential_store;
pub mod exchange;
pub mod notification;
pub mod persistence;
pub mod rate_limiter;
