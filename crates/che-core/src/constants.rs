//! Package-level and protocol-level constants.

/// Current version of the client (sourced from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name.
pub const NAME: &str = "che";

/// JSON-RPC protocol version tag carried by every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method that returns the server-assigned client identifier.
pub const CLIENT_ID_METHOD: &str = "websocketIdService/getId";

/// Method used to open a channel subscription.
pub const SUBSCRIBE_METHOD: &str = "subscribe";

/// Method used to close a channel subscription.
pub const UNSUBSCRIBE_METHOD: &str = "unsubscribe";

/// Query parameter carrying the client identifier on reconnection.
pub const CLIENT_ID_PARAM: &str = "clientId";

/// Query parameter carrying the bearer token.
pub const TOKEN_PARAM: &str = "token";
