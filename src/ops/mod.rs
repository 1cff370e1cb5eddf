pub mod digest;
pub mod fee_manager;
pub mod health;
pub mod model_watcher;
pub mod notify;
