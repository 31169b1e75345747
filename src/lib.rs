//! Policypilot: health-insurance denial appeals.
//!
//! A case moves from uploaded denial letters through extraction, strategy
//! analysis and a drafted appeal letter to a sent email, then follows the
//! insurer's replies. The [`appeal`] module holds that lifecycle; the
//! external AI, storage and mail services sit behind traits in
//! [`services`] and [`channels::email`].

pub mod appeal;
pub mod channels;
pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod settings;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
