pub mod cache;
pub mod config;
pub mod github;
pub mod model;
pub mod notifier;
pub mod poller;
pub mod rate;
pub mod state;
pub mod worker;
