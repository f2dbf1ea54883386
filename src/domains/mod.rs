//! Named document domains: validation, persisted metadata, and the service that drives
//! ingestion and question answering over them.

pub mod name;
pub mod registry;
pub mod service;
pub mod types;

pub use name::{DomainName, validate_filename};
pub use registry::DomainRegistry;
pub use service::{Capabilities, DomainApi, DomainService, ServiceSettings};
pub use types::{
    DocumentInfo, DocumentReport, DomainError, DomainInfo, IngestReport, MultiQueryAnswer,
    QueryAnswer, QueryEvent, QueryEventStream, SourceChunk, SourceDocument,
};
