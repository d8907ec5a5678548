pub mod driver;
pub mod proxies;
pub mod watcher;
