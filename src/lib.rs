pub mod barrier;
pub mod client;
pub mod config;
pub mod context;
pub mod flow_table;
pub mod listener;
pub mod records;
pub mod server;
pub mod timing;
pub mod wire;
