pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod http_remote;
pub mod logging;
pub mod model;
pub mod remote;
pub mod stats;
pub mod storage;
pub mod sync;
