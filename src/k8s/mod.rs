pub mod client;
pub mod identity;
pub mod transport;
pub mod watch;

/// Default user agent sent to every cluster.
///
/// Override with the `FLEETWATCH_USER_AGENT` environment variable.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
