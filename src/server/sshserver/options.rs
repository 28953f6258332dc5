//! Contains default configuration values for the switchboard server.

/// Address and port the server binds when none is configured.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:1878";

/// Host key file loaded when no path is configured.
pub const DEFAULT_HOST_KEY_FILE: &str = "ssh_host_key";

/// Authorized keys file consulted when no path is configured.
pub const DEFAULT_AUTHORIZED_KEYS_FILE: &str = "authorized_keys";
