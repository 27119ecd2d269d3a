//! Shared constants for the supported marketplaces.

/// Site names used as the availability / rate-limit partition key.
///
/// A "site" is one external marketplace; each session tracks an independent
/// availability state per site.
pub mod sites {
    /// Used-book marketplace crawled with a logged-in browser session.
    pub const KONGFUZI: &str = "kongfuzi";

    /// Competing buyback marketplace used for price-delta lookups.
    pub const DUOZHUAYU: &str = "duozhuayu";
}
