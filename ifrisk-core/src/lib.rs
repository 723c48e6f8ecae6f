//! ifrisk core: resilient ingestion of IF.data regulatory tables, rule-based
//! normalization into canonical metrics, and deterministic risk scoring.
//!
//! Stages, leaf first:
//! - `text`: label cleaning and locale-tolerant number parsing
//! - `data`: transport, retrying fetcher, pagination, checkpoints, identity
//!   map and the per-report ingestion orchestrator
//! - `store`: upsert-by-natural-key sinks (memory and JSON segment files)
//! - `semantic`: rule table, candidate selection, metric aggregation, audit
//! - `scoring`: pure metrics → score/rating/drivers
//! - `pipeline`: per-period ingest, normalize and score stages
//! - `config`: TOML configuration

pub mod config;
pub mod data;
pub mod domain;
pub mod pipeline;
pub mod scoring;
pub mod semantic;
pub mod store;
pub mod text;
