//! Module configuration.

use std::path::PathBuf;

/// Configuration consumed at worker start.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Dataplane directory; store material lives under
    /// `{directory}/tls/[stores/{name}/]`.
    pub directory: PathBuf,
    /// Initial credit granted to a network peer for handshake traffic.
    /// The effective budget is capped at the slot capacity.
    pub handshake_window_bytes: usize,
    /// Slots per buffer pool.
    pub slot_count: usize,
    /// Bytes per slot.
    pub slot_capacity: usize,
}

/// Default slot geometry, matching the host pool defaults.
pub const DEFAULT_SLOT_CAPACITY: usize = 65536;
pub const DEFAULT_SLOT_COUNT: usize = 64;

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            handshake_window_bytes: handshake_window_override()
                .unwrap_or(DEFAULT_SLOT_CAPACITY),
            slot_count: DEFAULT_SLOT_COUNT,
            slot_capacity: DEFAULT_SLOT_CAPACITY,
        }
    }
}

impl TlsConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Handshake credit after capping at the slot capacity.
    pub fn effective_handshake_window(&self) -> usize {
        self.handshake_window_bytes.min(self.slot_capacity)
    }
}

fn handshake_window_override() -> Option<usize> {
    std::env::var("tls.handshake.window.bytes")
        .ok()
        .and_then(|v| v.parse().ok())
}

/// Store file properties, every one overridable through the environment.
///
/// All six are read through this one accessor.
pub(crate) fn store_property(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

pub(crate) const PROP_KEYSTORE: &str = "tls.keystore";
pub(crate) const PROP_KEYSTORE_TYPE: &str = "tls.keystore.type";
pub(crate) const PROP_KEYSTORE_PASSWORD: &str = "tls.keystore.password";
pub(crate) const PROP_TRUSTSTORE: &str = "tls.truststore";
pub(crate) const PROP_TRUSTSTORE_TYPE: &str = "tls.truststore.type";
pub(crate) const PROP_TRUSTSTORE_PASSWORD: &str = "tls.truststore.password";

pub(crate) const DEFAULT_KEYSTORE: &str = "keys";
pub(crate) const DEFAULT_TRUSTSTORE: &str = "trust";
pub(crate) const DEFAULT_STORE_TYPE: &str = "PEM";
pub(crate) const DEFAULT_STORE_PASSWORD: &str = "generated";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_window_capped_at_slot_capacity() {
        let mut config = TlsConfig::new(".");
        config.handshake_window_bytes = 1 << 20;
        config.slot_capacity = 65536;
        assert_eq!(config.effective_handshake_window(), 65536);

        config.handshake_window_bytes = 8192;
        assert_eq!(config.effective_handshake_window(), 8192);
    }

    #[test]
    fn store_property_falls_back_to_default() {
        assert_eq!(
            store_property("tls.test.not.set", "fallback"),
            "fallback"
        );
    }
}
