//! Streaming crawl-translate-publish pipeline for serialized Chinese web novels.
//!
//! The orchestrator (`orchestrator::Orchestrator`) wires together a crawl producer, a
//! pool of translator consumers, a background glossary extractor, and a stats
//! publisher around a shared on-disk `BookProgress` record, so a run can be killed at
//! any point and resumed from exactly where it left off.

pub mod chunker;
pub mod config;
pub mod downloader;
pub mod ebook;
pub mod encoding;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod glossary;
pub mod glossary_extractor;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod patterns;
pub mod progress_store;
pub mod rate_limit;
pub mod style;
pub mod term_scorer;
pub mod translation;
