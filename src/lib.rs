//! Image Classification Pipeline
//!
//! This library implements the background pipeline that moves uploaded
//! images from transient storage through remote classification replicas:
//! a durable Postgres-backed job queue drained by a fixed pool of
//! workers, each bound 1:1 to one classifier endpoint.

pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod services;
