#![forbid(unsafe_code)]

//! Download and streaming engine behind the web player.
//!
//! The binaries share everything through this crate: the content store and
//! its namespaces, the download orchestrator with its yt-dlp/ffmpeg adapter,
//! the media library index, range streaming and batch deletion, plus the
//! axum router that exposes all of it.

pub mod adapter;
pub mod api;
pub mod config;
pub mod error;
pub mod library;
pub mod lifecycle;
pub mod metadata;
pub mod orchestrator;
pub mod security;
pub mod store;
pub mod streaming;
