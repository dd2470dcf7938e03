pub mod config;
pub mod observer;
