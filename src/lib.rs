pub mod config;
pub mod correlator;
pub mod credentials;
pub mod fetch;
pub mod logging;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod store;
