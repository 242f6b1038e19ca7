pub mod http;

use crate::database::AnimeRecord;
use crate::error::AppError;
use async_trait::async_trait;

pub use http::HttpGateway;

/// Boundary to the remote index. Implementations are expected to surface
/// their own timeouts as [`AppError::Gateway`]; a page the source does not
/// have is [`AppError::NotFound`] (or `Ok(None)` for owner resolution),
/// which callers treat as expected.
#[async_trait]
pub trait SourceGateway {
    /// Fetch and normalize the full record for one anime by external id.
    async fn fetch_anime(&self, url: &str) -> Result<AnimeRecord, AppError>;

    /// Resolve an episode external id to its owning anime's external id.
    /// `Ok(None)` means the source cannot resolve it.
    async fn resolve_episode_owner(&self, episode_url: &str)
        -> Result<Option<String>, AppError>;

    /// Every anime external id the source currently lists. Used only by the
    /// full directory build.
    async fn list_anime_urls(&self) -> Result<Vec<String>, AppError>;
}
