pub mod audit;
pub mod config;
pub mod context;
pub mod engine;
pub mod executor;
pub mod flags;
pub mod lock;
pub mod paths;
pub mod reconcile;
pub mod record;
pub mod recovery;
pub mod scanner;
pub mod signature;
pub mod summary;
pub mod txlog;
pub mod util;
pub mod warn;
