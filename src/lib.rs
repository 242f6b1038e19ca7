pub mod batch;
pub mod database;
pub mod error;
pub mod gateway;
pub mod normalize;
pub mod reconcile;
pub mod snapshot;

pub use batch::{run_batch, BatchReport};
pub use database::Database;
pub use error::AppError;
pub use gateway::{HttpGateway, SourceGateway};
pub use reconcile::{RecentEpisode, Reconciler};
