//! Core library for linking social/media accounts: interactive web login, credential
//! persistence, and signed API access for OAuth1, OAuth2, and cookie-session providers.

pub mod auth;
pub mod config;
pub mod http;
pub mod providers;
