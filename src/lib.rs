//! mediamtx-whep - WHEP viewer client for MediaMTX streams
//!
//! This crate negotiates receive-only WebRTC sessions with a MediaMTX
//! server published behind a home-automation host, keeps them alive
//! across failures, and exposes the widget control protocol.

pub mod auth;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod whep;

pub use error::{AppError, Result};
