pub mod event;
pub mod feed;
pub mod oauth_integration;
pub mod rules;

pub use event::EventRepository;
pub use feed::FeedRepository;
pub use oauth_integration::OAuthIntegrationRepository;
pub use rules::RuleRepository;
