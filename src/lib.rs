#![deny(missing_docs)]

//! Core library for the domain-scoped document question answering server.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Domain lifecycle, ingestion, and query service.
pub mod domains;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Per-page text extraction with OCR fallback.
pub mod extraction;
/// Answer generation client abstraction and adapters.
pub mod generation;
/// Per-domain retrieval indices and their in-process cache.
pub mod index;
/// Structured logging and tracing setup.
pub mod logging;
/// Ingestion and query metrics helpers.
pub mod metrics;
/// On-disk layout of domain artifacts.
pub mod storage;
/// Compact and refine answer synthesis.
pub mod synthesis;
/// Bounded pool for blocking work.
pub mod workers;
