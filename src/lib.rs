pub mod auth_config;
pub mod authenticator;
pub mod commands;
pub mod endpoint;
pub mod event;
pub mod grant;
pub mod http;
pub mod http_client;
pub mod http_session;
pub mod parameters;
pub mod session;
pub mod token;
pub mod trace;
