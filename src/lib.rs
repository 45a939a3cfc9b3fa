pub mod app;
pub mod classify;
pub mod client;
pub mod conf;
pub mod deadletter;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod grant;
pub mod ledger;
pub mod observability;
pub mod processor;
pub mod store;
