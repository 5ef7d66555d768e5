pub mod auth;
pub mod config_parser;
pub mod endpoints;
pub mod error;
pub mod gateway_util;
pub mod insight;
pub mod observability;
pub mod usage;
