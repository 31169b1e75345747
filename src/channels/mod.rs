//! Ways in and out of the service: the HTTP API and the mail transports.

pub mod email;
pub mod web;
