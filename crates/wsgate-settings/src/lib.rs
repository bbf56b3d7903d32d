//! # wsgate-settings
//!
//! Layered configuration for the gateway.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`GatewaySettings::default()`]
//! 2. **Settings file**: `~/.wsgate/settings.json` or an explicit path,
//!    deep-merged over defaults
//! 3. **Environment variables**: `WSGATE_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.server.port, DEFAULT_PORT);
        let _path = settings_path();
    }
}
