//! Deploy file store: an authoritative local tier replicated to an optional
//! S3 bucket through a durable background job queue.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod jobs;
pub mod models;
pub mod routes;
pub mod services;
