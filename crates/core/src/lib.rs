pub mod config;
pub mod email;
pub mod error;
pub mod memory;
pub mod scope;
pub mod service;
pub mod signing;
pub mod store;
pub mod token;
pub mod types;
pub mod webhook;

pub use error::{StoreError, SubscriptionError};
pub use service::SubscriptionService;
