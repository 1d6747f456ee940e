pub mod database;
pub mod connection;
pub mod config;
pub mod auth;
pub mod users;
pub mod messages;
pub mod presence;
pub mod relay;
