pub mod fetcher;
pub mod filter;
pub mod google;
pub mod ics;
pub mod init;
pub mod matching;
pub mod oauth;
pub mod reconcile;
pub mod recurrence;
pub mod rematch;
pub mod resilience;
pub mod sync;
pub mod timezone;
