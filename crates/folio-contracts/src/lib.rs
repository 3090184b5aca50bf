pub mod analysis;
pub mod cache;
pub mod data_url;
pub mod error;
pub mod events;
pub mod models;
pub mod repository;
pub mod state;
pub mod store;
pub mod story;
