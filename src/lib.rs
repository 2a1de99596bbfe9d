pub mod app;
pub mod clock;
pub mod config;
pub mod content;
pub mod engine;
pub mod error;
pub mod marker;
pub mod models;
pub mod moderation;
pub mod nonce;
pub mod notices;
pub mod settings;
pub mod window;
