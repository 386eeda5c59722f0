pub mod broadcast;
pub mod config;
pub mod dispenser;
pub mod errors;
pub mod executor;
pub mod feed;
pub mod ledger;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod price;
pub mod snapshot;
pub mod store;
pub mod stream;
pub mod testing;
