//! Shared User-Agent strings for provider negotiation and download traffic.
//!
//! File hosts routinely reject non-browser agents, so every request the core
//! issues presents the same desktop browser identity.

/// Desktop browser User-Agent presented to hosting providers.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// User-Agent for download requests.
#[must_use]
pub(crate) fn default_download_user_agent() -> String {
    BROWSER_USER_AGENT.to_string()
}

/// User-Agent for provider page and API requests.
#[must_use]
pub(crate) fn default_provider_user_agent() -> String {
    BROWSER_USER_AGENT.to_string()
}

/// Identifier sent to the debrid API, which expects a client name rather than a browser.
#[must_use]
pub(crate) fn api_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("vaultdl/{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_and_provider_agents_match() {
        assert_eq!(default_download_user_agent(), default_provider_user_agent());
        assert!(default_download_user_agent().starts_with("Mozilla/5.0"));
    }

    #[test]
    fn test_api_user_agent_carries_crate_version() {
        let ua = api_user_agent();
        assert_eq!(
            ua.strip_prefix("vaultdl/"),
            Some(env!("CARGO_PKG_VERSION")),
            "api UA must be name/version: {ua}"
        );
    }
}
