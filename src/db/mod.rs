pub mod models;
pub mod repository;

pub use repository::{
    EventRepository, FeedRepository, OAuthIntegrationRepository, RuleRepository,
};
