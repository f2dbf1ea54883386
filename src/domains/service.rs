//! Domain service coordinating the registry, index cache, ingestion, retrieval, and synthesis.

use std::path::PathBuf;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::future::join_all;

use super::name::{DomainName, validate_filename};
use super::registry::DomainRegistry;
use super::types::{
    DocumentInfo, DocumentReport, DomainError, DomainInfo, IngestReport, MultiQueryAnswer,
    QueryAnswer, QueryEvent, QueryEventStream, SourceChunk, SourceDocument,
};
use crate::config::Config;
use crate::embedding::{EmbeddingClient, EmbeddingClientError, build_embedding_client};
use crate::extraction::{PageExtractor, PopplerExtractor, extract_with_fallback};
use crate::generation::{GenerationClient, OllamaGenerationClient, TokenStream};
use crate::index::{
    Chunk, CosineSearch, DomainIndex, IndexCache, RetrievedNode, SimilaritySearch, UpsertOutcome,
};
use crate::metrics::{DomainMetrics, MetricsSnapshot};
use crate::storage::{StorageLayout, remove_file_if_present, stage_file};
use crate::synthesis::{SynthesisMode, Synthesizer};
use crate::workers::WorkerPool;

/// Tunables the service needs; everything else arrives through [`Capabilities`].
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Root directory holding one sub-directory per domain.
    pub data_dir: PathBuf,
    /// Chunks retrieved per domain for every question.
    pub similarity_top_k: usize,
    /// Concurrent blocking workers.
    pub worker_threads: usize,
    /// Token budget of a single prompt.
    pub context_window_tokens: usize,
}

impl ServiceSettings {
    /// Settings taken from the process configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            similarity_top_k: config.similarity_top_k,
            worker_threads: config.worker_threads,
            context_window_tokens: config.context_window_tokens,
        }
    }
}

/// External capabilities injected into the service.
#[derive(Clone)]
pub struct Capabilities {
    /// Computes embeddings for chunks and questions.
    pub embedder: Arc<dyn EmbeddingClient>,
    /// Generates answers.
    pub generator: Arc<dyn GenerationClient>,
    /// Extracts per-page text, with OCR.
    pub extractor: Arc<dyn PageExtractor>,
    /// Ranks a domain's chunks against a query vector.
    pub search: Arc<dyn SimilaritySearch>,
}

impl Capabilities {
    /// Production capabilities selected by configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            embedder: Arc::from(build_embedding_client(config)),
            generator: Arc::new(OllamaGenerationClient::new(
                config.ollama_url.clone(),
                config.llm_model.clone(),
            )),
            extractor: Arc::new(PopplerExtractor::new(config.ocr_render_dpi)),
            search: Arc::new(CosineSearch),
        }
    }
}

/// Owns every domain's lifecycle: metadata, cached indices, ingestion, and question answering.
///
/// Construct once near process start and share it through an `Arc`; the HTTP surface and the
/// CLI both drive the same instance.
pub struct DomainService {
    settings: ServiceSettings,
    layout: StorageLayout,
    registry: DomainRegistry,
    cache: IndexCache,
    workers: WorkerPool,
    embedder: Arc<dyn EmbeddingClient>,
    extractor: Arc<dyn PageExtractor>,
    search: Arc<dyn SimilaritySearch>,
    synthesizer: Synthesizer,
    metrics: Arc<DomainMetrics>,
}

/// Abstraction over the domain service used by external surfaces (HTTP, CLI).
#[async_trait]
pub trait DomainApi: Send + Sync {
    /// Create an empty domain.
    async fn create_domain(&self, name: &str, description: &str) -> Result<DomainInfo, DomainError>;

    /// Every domain, ordered by name.
    async fn list_domains(&self) -> Result<Vec<DomainInfo>, DomainError>;

    /// Metadata of one domain.
    async fn get_domain(&self, name: &str) -> Result<DomainInfo, DomainError>;

    /// Irreversibly delete a domain and everything stored for it.
    async fn delete_domain(&self, name: &str) -> Result<(), DomainError>;

    /// Store, extract, embed, and index documents into a domain.
    async fn ingest(
        &self,
        name: &str,
        documents: Vec<SourceDocument>,
    ) -> Result<IngestReport, DomainError>;

    /// Indexed documents of a domain with their chunk counts.
    async fn list_documents(&self, name: &str) -> Result<Vec<DocumentInfo>, DomainError>;

    /// Remove every chunk of one document and its stored source file.
    async fn delete_document(&self, name: &str, filename: &str) -> Result<(), DomainError>;

    /// Answer a question from one domain.
    async fn query(&self, name: &str, question: &str) -> Result<QueryAnswer, DomainError>;

    /// Answer a question from one domain as an event stream.
    async fn query_stream(&self, name: &str, question: &str)
    -> Result<QueryEventStream, DomainError>;

    /// Answer a question from several domains.
    async fn query_domains(
        &self,
        names: &[String],
        question: &str,
    ) -> Result<MultiQueryAnswer, DomainError>;

    /// Answer a question from several domains as an event stream.
    async fn query_domains_stream(
        &self,
        names: &[String],
        question: &str,
    ) -> Result<QueryEventStream, DomainError>;

    /// Retrieve the current metrics snapshot for diagnostics.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

impl DomainService {
    /// Build a service over `settings.data_dir` using the given capabilities.
    pub fn new(settings: ServiceSettings, capabilities: Capabilities) -> Self {
        let layout = StorageLayout::new(settings.data_dir.clone());
        let workers = WorkerPool::new(settings.worker_threads);
        let Capabilities {
            embedder,
            generator,
            extractor,
            search,
        } = capabilities;
        tracing::debug!(
            data_dir = %settings.data_dir.display(),
            top_k = settings.similarity_top_k,
            workers = settings.worker_threads,
            embedding_model = embedder.model_id(),
            "Initializing domain service"
        );

        Self {
            registry: DomainRegistry::new(layout.clone()),
            cache: IndexCache::new(layout.clone(), workers.clone()),
            synthesizer: Synthesizer::new(generator, settings.context_window_tokens),
            metrics: Arc::new(DomainMetrics::new()),
            settings,
            layout,
            workers,
            embedder,
            extractor,
            search,
        }
    }

    /// Service wired from the process configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            ServiceSettings::from_config(config),
            Capabilities::from_config(config),
        )
    }

    /// Create an empty domain: persist an empty index, then its metadata record.
    pub async fn create_domain(
        &self,
        name: &str,
        description: &str,
    ) -> Result<DomainInfo, DomainError> {
        let name = DomainName::parse(name)?;
        let mut held = self.cache.lock(&name).await;

        let index = DomainIndex::new(self.embedder.model_id());
        let bytes = index.to_bytes()?;
        let registry = self.registry.clone();
        let index_dir = self.layout.index_dir(&name);
        let description = description.to_string();
        let target = name.clone();
        let info = self
            .workers
            .run(move || {
                if registry.exists(&target) {
                    return Err(DomainError::AlreadyExists(target.to_string()));
                }
                DomainIndex::persist_bytes(&index_dir, &bytes)
                    .map_err(DomainError::storage(format!("writing {}", index_dir.display())))?;
                registry.create(&target, &description)
            })
            .await??;

        self.cache.install(&mut held, index);
        tracing::info!(domain = %name, "Domain created");
        Ok(info)
    }

    /// Every domain, ordered by name.
    pub async fn list_domains(&self) -> Result<Vec<DomainInfo>, DomainError> {
        let registry = self.registry.clone();
        self.workers.run(move || registry.list()).await?
    }

    /// Metadata of one domain.
    pub async fn get_domain(&self, name: &str) -> Result<DomainInfo, DomainError> {
        let name = DomainName::parse(name)?;
        let registry = self.registry.clone();
        self.workers.run(move || registry.get(&name)).await?
    }

    /// Irreversibly delete a domain.
    ///
    /// Under the domain's writer lock the cached index is retired first, so nothing can reach it
    /// again, and only then is persisted state removed.
    pub async fn delete_domain(&self, name: &str) -> Result<(), DomainError> {
        let name = DomainName::parse(name)?;
        let mut held = self.cache.lock(&name).await;
        let resident = held.is_loaded();
        self.cache.evict(&mut held);

        let registry = self.registry.clone();
        let target = name.clone();
        let result = self
            .workers
            .run(move || registry.delete(&target))
            .await
            .and_then(|deleted| deleted);
        self.cache.forget(&name, held);

        result?;
        tracing::info!(domain = %name, resident, "Domain deleted");
        Ok(())
    }

    /// Ingest documents into a domain, returning how many chunks were written.
    ///
    /// All filenames are validated before anything is stored. The domain's writer lock is held
    /// for the whole batch. A document whose extraction fails is logged and contributes nothing;
    /// the remaining documents are still processed.
    pub async fn ingest(
        &self,
        name: &str,
        documents: Vec<SourceDocument>,
    ) -> Result<IngestReport, DomainError> {
        let name = DomainName::parse(name)?;
        for document in &documents {
            validate_filename(&document.filename)?;
        }
        self.ensure_exists(&name).await?;

        let mut index = self.cache.write(&name).await?;
        let mut report = IngestReport::default();
        for document in documents {
            let detail = self.ingest_document(&name, &mut index, document).await?;
            report.chunks_written += detail.chunks_written;
            report.documents.push(detail);
        }

        tracing::info!(
            domain = %name,
            documents = report.documents.len(),
            chunks = report.chunks_written,
            total_chunks = index.len(),
            "Ingestion completed"
        );
        Ok(report)
    }

    async fn ingest_document(
        &self,
        name: &DomainName,
        index: &mut DomainIndex,
        document: SourceDocument,
    ) -> Result<DocumentReport, DomainError> {
        let SourceDocument { filename, bytes } = document;
        let path = self.layout.pdf_path(name, &filename);
        let mut report = DocumentReport {
            filename: filename.clone(),
            total_pages: 0,
            chunks_written: 0,
            chunks_inserted: 0,
            chunks_updated: 0,
            chunks_embedded: 0,
            ocr_used: false,
            extraction_error: None,
        };

        // The upload lives under a staged name until its chunks are persisted. Dropping it on any
        // early return discards the file, so `pdfs/` only holds documents the index knows.
        let pdf_dir = self.layout.pdf_dir(name);
        let upload = self
            .workers
            .run(move || stage_file(&pdf_dir, &bytes))
            .await?
            .map_err(DomainError::storage(format!("staging {}", path.display())))?;

        let extractor = self.extractor.clone();
        let source = upload.path().to_path_buf();
        let extracted = match self
            .workers
            .run(move || extract_with_fallback(extractor.as_ref(), &source))
            .await?
        {
            Ok(extracted) => extracted,
            Err(source) => {
                let error = DomainError::Extraction {
                    filename: filename.clone(),
                    source,
                };
                tracing::warn!(domain = %name, error = %error, "Extraction failed; skipping document");
                self.metrics.record_extraction_failure();
                report.extraction_error = Some(error.to_string());
                return Ok(report);
            }
        };
        report.total_pages = extracted.total_pages;
        report.ocr_used = extracted.ocr_used;

        if extracted.pages.is_empty() {
            tracing::info!(
                domain = %name,
                filename = %filename,
                pages = extracted.total_pages,
                ocr = extracted.ocr_used,
                "No extractable text; skipping document"
            );
            return Ok(report);
        }

        let chunks: Vec<Chunk> = extracted
            .pages
            .into_iter()
            .map(|page| Chunk::new(name.as_str(), &filename, page.index, page.text))
            .collect();
        let reused: Vec<Option<Vec<f32>>> = chunks
            .iter()
            .map(|chunk| {
                index
                    .reusable_embedding(&chunk.id, &chunk.content_hash())
                    .map(<[f32]>::to_vec)
            })
            .collect();
        let pending: Vec<String> = chunks
            .iter()
            .zip(&reused)
            .filter(|(_, vector)| vector.is_none())
            .map(|(chunk, _)| chunk.text.clone())
            .collect();
        let expected = pending.len();
        let fresh = if pending.is_empty() {
            Vec::new()
        } else {
            self.embedder.generate_embeddings(pending).await?
        };
        if fresh.len() != expected {
            return Err(DomainError::Embedding(EmbeddingClientError::GenerationFailed(
                format!("expected {expected} vectors, received {}", fresh.len()),
            )));
        }

        report.chunks_embedded = expected;
        let mut next = index.clone();
        let mut fresh = fresh.into_iter();
        for (chunk, vector) in chunks.into_iter().zip(reused) {
            let Some(vector) = vector.or_else(|| fresh.next()) else {
                break;
            };
            match next.upsert(chunk, vector) {
                UpsertOutcome::Inserted => report.chunks_inserted += 1,
                UpsertOutcome::Updated => report.chunks_updated += 1,
                UpsertOutcome::Unchanged => {}
            }
            report.chunks_written += 1;
        }

        // The cached index changes only once its replacement is on disk.
        self.persist(name, &next).await?;
        *index = next;

        let target = path.clone();
        self.workers
            .run(move || upload.persist(&target).map(|_| ()).map_err(|error| error.error))
            .await?
            .map_err(DomainError::storage(format!("storing {}", path.display())))?;
        self.metrics
            .record_document(report.chunks_written as u64, report.ocr_used);
        tracing::info!(
            domain = %name,
            filename = %filename,
            pages = report.total_pages,
            chunks = report.chunks_written,
            inserted = report.chunks_inserted,
            updated = report.chunks_updated,
            embedded = report.chunks_embedded,
            ocr = report.ocr_used,
            "Document ingested"
        );
        Ok(report)
    }

    /// Indexed documents of a domain, ordered by filename.
    pub async fn list_documents(&self, name: &str) -> Result<Vec<DocumentInfo>, DomainError> {
        let name = DomainName::parse(name)?;
        self.ensure_exists(&name).await?;
        let index = self.cache.read(&name).await?;
        Ok(index
            .documents()
            .into_iter()
            .map(|(filename, num_chunks)| DocumentInfo {
                doc_id: filename.clone(),
                filename,
                num_chunks,
            })
            .collect())
    }

    /// Remove every chunk whose filename matches exactly, then the stored source file.
    pub async fn delete_document(&self, name: &str, filename: &str) -> Result<(), DomainError> {
        let name = DomainName::parse(name)?;
        validate_filename(filename)?;
        self.ensure_exists(&name).await?;

        let mut index = self.cache.write(&name).await?;
        let mut next = index.clone();
        let removed = next.remove_file(filename);
        if removed == 0 {
            return Err(DomainError::DocumentNotFound {
                domain: name.to_string(),
                filename: filename.to_string(),
            });
        }
        self.persist(&name, &next).await?;
        *index = next;

        let path = self.layout.pdf_path(&name, filename);
        let target = path.clone();
        let source_removed = self
            .workers
            .run(move || remove_file_if_present(&target))
            .await?
            .map_err(DomainError::storage(format!("removing {}", path.display())))?;

        tracing::info!(
            domain = %name,
            filename,
            chunks = removed,
            source_removed,
            remaining = index.len(),
            "Document deleted"
        );
        Ok(())
    }

    /// Top-k chunks of one domain for `question`, ranked by descending score.
    pub async fn retrieve(
        &self,
        name: &str,
        question: &str,
    ) -> Result<Vec<RetrievedNode>, DomainError> {
        let name = DomainName::parse(name)?;
        self.ensure_exists(&name).await?;
        self.retrieve_from(&name, question).await
    }

    /// Answer a question from one domain in a single synthesis pass.
    pub async fn query(&self, name: &str, question: &str) -> Result<QueryAnswer, DomainError> {
        let domain = DomainName::parse(name)?;
        self.ensure_exists(&domain).await?;
        let nodes = self.retrieve_from(&domain, question).await?;
        let answer = self
            .synthesizer
            .synthesize(SynthesisMode::Compact, question, &nodes)
            .await
            .inspect_err(|error| {
                tracing::error!(domain = %domain, error = %error, "Answer generation failed");
            })?;
        self.metrics.record_query();

        Ok(QueryAnswer {
            answer,
            sources: nodes.iter().map(SourceChunk::from).collect(),
            domain: domain.to_string(),
            question: question.to_string(),
        })
    }

    /// Answer a question from one domain as an event stream.
    ///
    /// Retrieval completes before the stream is returned, so unknown domains fail up front.
    pub async fn query_stream(
        &self,
        name: &str,
        question: &str,
    ) -> Result<QueryEventStream, DomainError> {
        let domain = DomainName::parse(name)?;
        self.ensure_exists(&domain).await?;
        let nodes = self.retrieve_from(&domain, question).await?;
        let sources = nodes.iter().map(SourceChunk::from).collect();
        let tokens = self
            .synthesizer
            .stream(SynthesisMode::Compact, question.to_string(), nodes);
        self.metrics.record_query();
        Ok(answer_events(tokens, sources))
    }

    /// Answer a question from several domains with iterative refinement over the merged nodes.
    pub async fn query_domains(
        &self,
        names: &[String],
        question: &str,
    ) -> Result<MultiQueryAnswer, DomainError> {
        let domains = self.resolve_domains(names).await?;
        let nodes = self.gather(&domains, question).await;
        let answer = self
            .synthesizer
            .synthesize(SynthesisMode::Refine, question, &nodes)
            .await
            .inspect_err(|error| {
                tracing::error!(error = %error, "Multi-domain answer generation failed");
            })?;
        self.metrics.record_query();

        Ok(MultiQueryAnswer {
            answer,
            sources: nodes.iter().map(SourceChunk::from).collect(),
            domains: domains.iter().map(DomainName::to_string).collect(),
            question: question.to_string(),
        })
    }

    /// Answer a question from several domains as an event stream.
    pub async fn query_domains_stream(
        &self,
        names: &[String],
        question: &str,
    ) -> Result<QueryEventStream, DomainError> {
        let domains = self.resolve_domains(names).await?;
        let nodes = self.gather(&domains, question).await;
        let sources = nodes.iter().map(SourceChunk::from).collect();
        let tokens = self
            .synthesizer
            .stream(SynthesisMode::Refine, question.to_string(), nodes);
        self.metrics.record_query();
        Ok(answer_events(tokens, sources))
    }

    /// Return the current metrics snapshot.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Validate a multi-domain request: non-empty, well-formed, and every domain present.
    async fn resolve_domains(&self, names: &[String]) -> Result<Vec<DomainName>, DomainError> {
        if names.is_empty() {
            return Err(DomainError::EmptyDomainList);
        }
        let domains = names
            .iter()
            .map(|name| DomainName::parse(name))
            .collect::<Result<Vec<_>, _>>()?;
        for domain in &domains {
            self.ensure_exists(domain).await?;
        }
        Ok(domains)
    }

    /// Retrieve from every domain concurrently and merge in request order.
    ///
    /// A failing domain is logged and contributes no nodes.
    async fn gather(&self, domains: &[DomainName], question: &str) -> Vec<RetrievedNode> {
        let results = join_all(
            domains
                .iter()
                .map(|domain| self.retrieve_from(domain, question)),
        )
        .await;

        let mut merged = Vec::new();
        for (domain, result) in domains.iter().zip(results) {
            match result {
                Ok(nodes) => merged.extend(nodes.into_iter().map(|node| node.tagged(domain.as_str()))),
                Err(error) => {
                    tracing::warn!(
                        domain = %domain,
                        error = %error,
                        "Retrieval failed; domain contributes no results"
                    );
                }
            }
        }
        merged
    }

    async fn retrieve_from(
        &self,
        domain: &DomainName,
        question: &str,
    ) -> Result<Vec<RetrievedNode>, DomainError> {
        let query = self
            .embedder
            .embed(question)
            .await
            .map_err(|source| DomainError::Retrieval {
                domain: domain.to_string(),
                source,
            })?;
        let index = self.cache.read(domain).await?;
        let search = self.search.clone();
        let k = self.settings.similarity_top_k;
        self.workers
            .run(move || search.search(&index, &query, k))
            .await
    }

    async fn ensure_exists(&self, name: &DomainName) -> Result<(), DomainError> {
        let registry = self.registry.clone();
        let target = name.clone();
        if self.workers.run(move || registry.exists(&target)).await? {
            Ok(())
        } else {
            Err(DomainError::NotFound(name.to_string()))
        }
    }

    /// Write the index and the matching chunk count. Caller holds the writer lock.
    async fn persist(&self, name: &DomainName, index: &DomainIndex) -> Result<(), DomainError> {
        let bytes = index.to_bytes()?;
        let count = index.len();
        let index_dir = self.layout.index_dir(name);
        let registry = self.registry.clone();
        let target = name.clone();
        self.workers
            .run(move || {
                DomainIndex::persist_bytes(&index_dir, &bytes)
                    .map_err(DomainError::storage(format!("writing {}", index_dir.display())))?;
                registry.set_chunk_count(&target, count).map(|_| ())
            })
            .await?
    }
}

/// Turn a token stream into query events: tokens, the sources once, an error if generation
/// failed, and always a terminal `Done`.
fn answer_events(tokens: TokenStream, sources: Vec<SourceChunk>) -> QueryEventStream {
    Box::pin(stream! {
        let mut tokens = tokens;
        let mut failure = None;
        while let Some(item) = tokens.next().await {
            match item {
                Ok(text) => yield QueryEvent::Token(text),
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }
        yield QueryEvent::Sources(sources);
        if let Some(error) = failure {
            tracing::error!(error = %error, "Answer stream failed");
            yield QueryEvent::Error(error.to_string());
        }
        yield QueryEvent::Done;
    })
}

#[async_trait]
impl DomainApi for DomainService {
    async fn create_domain(&self, name: &str, description: &str) -> Result<DomainInfo, DomainError> {
        DomainService::create_domain(self, name, description).await
    }

    async fn list_domains(&self) -> Result<Vec<DomainInfo>, DomainError> {
        DomainService::list_domains(self).await
    }

    async fn get_domain(&self, name: &str) -> Result<DomainInfo, DomainError> {
        DomainService::get_domain(self, name).await
    }

    async fn delete_domain(&self, name: &str) -> Result<(), DomainError> {
        DomainService::delete_domain(self, name).await
    }

    async fn ingest(
        &self,
        name: &str,
        documents: Vec<SourceDocument>,
    ) -> Result<IngestReport, DomainError> {
        DomainService::ingest(self, name, documents).await
    }

    async fn list_documents(&self, name: &str) -> Result<Vec<DocumentInfo>, DomainError> {
        DomainService::list_documents(self, name).await
    }

    async fn delete_document(&self, name: &str, filename: &str) -> Result<(), DomainError> {
        DomainService::delete_document(self, name, filename).await
    }

    async fn query(&self, name: &str, question: &str) -> Result<QueryAnswer, DomainError> {
        DomainService::query(self, name, question).await
    }

    async fn query_stream(
        &self,
        name: &str,
        question: &str,
    ) -> Result<QueryEventStream, DomainError> {
        DomainService::query_stream(self, name, question).await
    }

    async fn query_domains(
        &self,
        names: &[String],
        question: &str,
    ) -> Result<MultiQueryAnswer, DomainError> {
        DomainService::query_domains(self, names, question).await
    }

    async fn query_domains_stream(
        &self,
        names: &[String],
        question: &str,
    ) -> Result<QueryEventStream, DomainError> {
        DomainService::query_domains_stream(self, names, question).await
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        DomainService::metrics_snapshot(self)
    }
}
