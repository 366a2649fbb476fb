//! Plate Scan
//!
//! Job pipeline for number-plate detection in uploaded videos: a durable
//! Redis task queue, a bounded worker pool, and a frame pipeline that probes
//! each video with ffprobe, samples frames with ffmpeg, runs an external
//! detection worker per frame, and persists de-duplicated, validated results
//! to PostgreSQL while streaming progress to subscribers.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod shutdown;
