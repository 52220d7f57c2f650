//! Core library for playlist-reconcile: keeps remote playlists on two catalog
//! providers free of duplicates and in step with each other.
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod fallback;
pub mod manager;
pub mod models;
pub mod normalize;
pub mod retry;
pub mod similarity;
pub mod state;
