pub const PEERCOORD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire version advertised in announcements, independent of the crate version.
pub use peercoord_p2p::schema::API_VERSION;

pub fn git_commit_hash() -> &'static str {
    option_env!("GIT_COMMIT_HASH").unwrap_or("unknown")
}
