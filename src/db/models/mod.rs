//! Database models split into separate files.
//! This module re-exports individual model modules so imports like
//! `use crate::db::models::*;` keep working.

pub mod event;
pub mod feed;
pub mod oauth_integration;
pub mod rules;

pub use self::event::*;
pub use self::feed::*;
pub use self::oauth_integration::*;
pub use self::rules::*;
