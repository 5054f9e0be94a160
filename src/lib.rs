pub mod archive;
pub mod compose;
pub mod config;
pub mod error;
pub mod gmail;
pub mod history;
pub mod ledger;
pub mod reconcile;
pub mod server;
pub mod watch;
