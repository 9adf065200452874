use crate::chunking::{chunk_with, ChunkingConfig};
use crate::embeddings::{DevicePreference, EmbeddingProvider, EmbeddingRegistry, DEFAULT_EMBEDDING_DIMENSIONS};
use crate::error::PipelineError;
use crate::extractor::TextExtractor;
use crate::index::VectorIndex;
use crate::language::{LanguageDetector, WhatlangDetector};
use crate::models::{
    BuildOptions, BuildReport, Document, IndexStatus, Page, QueryRequest,
    QueryResponse, DEFAULT_COLLECTION,
};
use crate::normalizer::{PageInput, PageNormalizer};
use crate::services::{
    answer_prompt, Answerer, LeadSummarizer, NoOcr, OcrEngine, PassthroughTranslator, Summarizer,
    Translator, DEFAULT_OLLAMA_URL,
};
use crate::snapshot::{RetryPolicy, SnapshotStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const PREVIEW_LINES: usize = 10;
const PREVIEW_EXCERPT_CHARS: usize = 80;
pub const BUILD_STATUS: &str = "database built";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub collection: String,
    /// Upper bound for extracting and normalizing one document. A worker past it stops before
    /// its next page; a page already at the OCR or translation service runs to completion.
    pub step_timeout: Duration,
    /// How long a build, restore or import waits for another one to finish.
    pub lock_wait: Duration,
    pub embedding_dimensions: usize,
    pub device: DevicePreference,
    pub ollama_url: String,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            collection: DEFAULT_COLLECTION.to_string(),
            step_timeout: Duration::from_secs(300),
            lock_wait: Duration::from_secs(30),
            embedding_dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            device: DevicePreference::Auto,
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// External services the pipeline calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub detector: Arc<dyn LanguageDetector>,
    pub ocr: Arc<dyn OcrEngine>,
    pub translator: Arc<dyn Translator>,
    pub summarizer: Arc<dyn Summarizer>,
    pub answerer: Arc<dyn Answerer>,
}

impl Collaborators {
    /// Local detection, no OCR, no translation and an extractive summary.
    pub fn offline(answerer: Arc<dyn Answerer>) -> Self {
        Self {
            detector: Arc::new(WhatlangDetector),
            ocr: Arc::new(NoOcr),
            translator: Arc::new(PassthroughTranslator),
            summarizer: Arc::new(LeadSummarizer),
            answerer,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HandlePhase {
    Empty,
    Building,
    Loading,
    Ready,
}

struct HandleState {
    phase: HandlePhase,
    index: Option<Arc<VectorIndex>>,
    version: u64,
}

/// Owns the index handle. Build, restore and import are serialized by the transition lock;
/// queries never wait on it and fail with `IndexNotReady` while a transition runs.
pub struct Pipeline {
    config: PipelineConfig,
    extractor: TextExtractor,
    normalizer: Arc<PageNormalizer>,
    embeddings: Arc<EmbeddingRegistry>,
    answerer: Arc<dyn Answerer>,
    store: SnapshotStore,
    state: RwLock<HandleState>,
    transition: Mutex<()>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Result<Self, PipelineError> {
        let normalizer = PageNormalizer::new(
            collaborators.detector,
            collaborators.ocr,
            collaborators.translator,
            collaborators.summarizer,
        )?;
        let embeddings = EmbeddingRegistry::new(
            config.embedding_dimensions,
            config.device,
            config.ollama_url.clone(),
        );
        let store = SnapshotStore::new(&config.data_dir, &config.collection).with_retry(config.retry);

        Ok(Self {
            extractor: TextExtractor::new(),
            normalizer: Arc::new(normalizer),
            embeddings: Arc::new(embeddings),
            answerer: collaborators.answerer,
            store,
            state: RwLock::new(HandleState {
                phase: HandlePhase::Empty,
                index: None,
                version: 0,
            }),
            transition: Mutex::new(()),
            config,
        })
    }

    /// Creates the pipeline and reloads a previously persisted collection, if any.
    pub async fn open(config: PipelineConfig, collaborators: Collaborators) -> Result<Self, PipelineError> {
        let pipeline = Self::new(config, collaborators)?;
        if pipeline.store.exists() {
            if let Err(error) = pipeline.restore().await {
                warn!(kind = error.kind().as_str(), %error, "stored collection not restored");
            }
        }
        Ok(pipeline)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn embeddings(&self) -> &EmbeddingRegistry {
        &self.embeddings
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn status(&self) -> IndexStatus {
        match self.state.read() {
            Ok(state) if state.phase == HandlePhase::Ready => state
                .index
                .as_ref()
                .map(|index| index.status())
                .unwrap_or_default(),
            _ => IndexStatus::default(),
        }
    }

    pub fn phase(&self) -> HandlePhase {
        self.state
            .read()
            .map(|state| state.phase)
            .unwrap_or(HandlePhase::Empty)
    }

    /// Number of indices swapped in since the pipeline was created.
    pub fn version(&self) -> u64 {
        self.state.read().map(|state| state.version).unwrap_or_default()
    }

    /// Extracts, normalizes, chunks and embeds `documents`, then replaces the current index.
    pub async fn build(
        &self,
        documents: Vec<Document>,
        options: BuildOptions,
    ) -> Result<BuildReport, PipelineError> {
        let chunking = ChunkingConfig::new(options.chunk_size, options.chunk_overlap)?;
        if documents.is_empty() {
            return Err(PipelineError::EmptyInput("no documents were provided".to_string()));
        }
        for document in &documents {
            document.resolve_format()?;
        }
        let provider = self.embeddings.get(&options.embedding_model)?;

        let _transition = self.acquire_transition("build").await?;
        let previous = self.begin(HandlePhase::Building)?;
        info!(documents = documents.len(), model = %options.embedding_model, "index building");

        match self.run_build(documents, &options, chunking, provider).await {
            Ok((index, report)) => {
                self.finish(index)?;
                Ok(report)
            }
            Err(error) => {
                self.recover(HandlePhase::Building, previous, &error).await;
                Err(error)
            }
        }
    }

    async fn run_build(
        &self,
        documents: Vec<Document>,
        options: &BuildOptions,
        chunking: ChunkingConfig,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<(VectorIndex, BuildReport), PipelineError> {
        let pages = self.normalize_documents(documents, &options.ocr_language).await;

        let all_texts: Vec<&str> = pages
            .iter()
            .map(|page| page.content_en.as_str())
            .filter(|text| !text.trim().is_empty())
            .collect();
        if all_texts.is_empty() {
            return Err(PipelineError::NoContent(
                "every document yielded empty text".to_string(),
            ));
        }

        let chunks = chunk_with(&all_texts.join(" "), chunking);
        debug!(pages = pages.len(), chunks = chunks.len(), "chunked normalized text");

        let collection = self.config.collection.clone();
        let index = blocking(move || VectorIndex::build(&collection, &chunks, provider.as_ref())).await?;

        let store = self.store.clone();
        let index = blocking(move || store.replace(&index).map(|()| index)).await?;

        let report = BuildReport {
            status: BUILD_STATUS.to_string(),
            num_chunks: index.len(),
            preview: preview_lines(&pages)?,
        };
        Ok((index, report))
    }

    /// Runs every document on its own blocking worker and returns pages in document order.
    ///
    /// A document that fails or exceeds the step timeout contributes no pages.
    pub async fn normalize_documents(&self, documents: Vec<Document>, ocr_language: &str) -> Vec<Page> {
        let mut workers = JoinSet::new();

        for (position, document) in documents.into_iter().enumerate() {
            let extractor = self.extractor.clone();
            let normalizer = self.normalizer.clone();
            let language = ocr_language.to_string();
            let timeout = self.config.step_timeout;

            workers.spawn(async move {
                let name = document.name.clone();
                let deadline = Instant::now() + timeout;
                let work = tokio::task::spawn_blocking(move || {
                    normalize_document(&extractor, &normalizer, &document, &language, deadline)
                });
                let outcome = match tokio::time::timeout(timeout, work).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_error)) => Err(PipelineError::Task(join_error.to_string())),
                    Err(_) => Err(PipelineError::external(
                        "normalization",
                        format!("timed out after {}s", timeout.as_secs_f32()),
                    )),
                };
                (position, name, outcome)
            });
        }

        let mut per_document = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((position, _, Ok(pages))) => per_document.push((position, pages)),
                Ok((_, name, Err(error))) => {
                    warn!(document = %name, kind = error.kind().as_str(), %error, "document excluded from build");
                }
                Err(error) => warn!(%error, "document worker failed"),
            }
        }

        per_document.sort_by_key(|(position, _)| *position);
        per_document
            .into_iter()
            .flat_map(|(_, pages)| pages)
            .enumerate()
            .map(|(position, mut page)| {
                page.ordinal = (position + 1) as u32;
                page
            })
            .collect()
    }

    /// Retrieves the `top_k` nearest chunks and asks the answering model about them.
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse, PipelineError> {
        let retrieved_chunks = self.retrieve(&request.prompt, request.top_k).await?;

        let answerer = self.answerer.clone();
        let prompt = answer_prompt(&retrieved_chunks, &request.prompt);
        let model = request.model;
        let answer = blocking(move || answerer.answer(&model, &prompt)).await?;

        Ok(QueryResponse {
            answer,
            retrieved_chunks,
        })
    }

    pub async fn retrieve(&self, prompt: &str, top_k: usize) -> Result<Vec<String>, PipelineError> {
        if top_k == 0 {
            return Err(PipelineError::InvalidArgument(
                "top_k must be greater than zero".to_string(),
            ));
        }

        let index = self.ready_index()?;
        let metadata = index.metadata();
        let provider = self
            .embeddings
            .get_with_dimensions(&metadata.embedding_model, metadata.dimension)?;
        let prompt = prompt.to_string();
        blocking(move || index.query(&prompt, top_k, provider.as_ref())).await
    }

    /// Reloads the stored collection into memory.
    pub async fn restore(&self) -> Result<IndexStatus, PipelineError> {
        let _transition = self.acquire_transition("restore").await?;
        let previous = self.begin(HandlePhase::Loading)?;
        info!(collection = %self.store.collection(), "index loading");

        let store = self.store.clone();
        match blocking(move || store.load()).await {
            Ok(index) => self.finish(index),
            Err(error) => {
                self.recover(HandlePhase::Loading, previous, &error).await;
                Err(error)
            }
        }
    }

    /// Packs the stored collection into a zip archive.
    pub async fn export_snapshot(&self) -> Result<Vec<u8>, PipelineError> {
        let _transition = self.acquire_transition("export").await?;
        if !self.store.exists() {
            return Err(PipelineError::IndexNotReady(
                "no collection has been stored yet".to_string(),
            ));
        }

        let store = self.store.clone();
        blocking(move || store.export_archive()).await
    }

    /// Replaces the stored collection with an archive and reloads the handle from it.
    pub async fn import_snapshot(&self, archive: Vec<u8>) -> Result<IndexStatus, PipelineError> {
        let _transition = self.acquire_transition("import").await?;
        let previous = self.begin(HandlePhase::Loading)?;
        info!(bytes = archive.len(), "importing snapshot");

        let store = self.store.clone();
        match blocking(move || store.import_archive(&archive)).await {
            Ok(index) => self.finish(index),
            Err(error) => {
                self.recover(HandlePhase::Loading, previous, &error).await;
                Err(error)
            }
        }
    }

    /// Releases cached providers and drops the pipeline off the async runtime.
    pub async fn shutdown(self) {
        self.embeddings.shutdown();
        if let Err(error) = tokio::task::spawn_blocking(move || drop(self)).await {
            warn!(%error, "pipeline teardown failed");
        }
    }

    async fn acquire_transition(&self, operation: &str) -> Result<MutexGuard<'_, ()>, PipelineError> {
        tokio::time::timeout(self.config.lock_wait, self.transition.lock())
            .await
            .map_err(|_| {
                PipelineError::TransientResourceBusy(format!(
                    "{operation} waited {}s for another build or restore",
                    self.config.lock_wait.as_secs_f32()
                ))
            })
    }

    fn begin(&self, phase: HandlePhase) -> Result<Option<Arc<VectorIndex>>, PipelineError> {
        let mut state = self.write_state()?;
        state.phase = phase;
        Ok(state.index.take())
    }

    fn finish(&self, index: VectorIndex) -> Result<IndexStatus, PipelineError> {
        let status = index.status();
        let mut state = self.write_state()?;
        state.index = Some(Arc::new(index));
        state.phase = HandlePhase::Ready;
        state.version += 1;
        info!(count = status.count, version = state.version, "index ready");
        Ok(status)
    }

    /// Puts the prior index back when durable storage still holds it, otherwise resets to empty.
    /// Only a failed build clears what it left on disk; a failed load never touches storage.
    async fn recover(
        &self,
        failed: HandlePhase,
        previous: Option<Arc<VectorIndex>>,
        error: &PipelineError,
    ) {
        let store = self.store.clone();
        let stored = blocking(move || Ok(store.stored_build_id())).await.ok().flatten();

        let restored = previous.filter(|index| stored == Some(index.metadata().build_id));
        if failed == HandlePhase::Building && restored.is_none() && stored.is_some() {
            let store = self.store.clone();
            if let Err(cleanup) = blocking(move || store.remove()).await {
                warn!(%cleanup, "could not remove partial collection");
            }
        }

        let phase = if restored.is_some() {
            HandlePhase::Ready
        } else {
            HandlePhase::Empty
        };
        warn!(kind = error.kind().as_str(), %error, ?phase, "index transition failed");

        match self.state.write() {
            Ok(mut state) => {
                state.index = restored;
                state.phase = phase;
            }
            Err(poisoned) => {
                let mut state = poisoned.into_inner();
                state.index = None;
                state.phase = HandlePhase::Empty;
            }
        }
    }

    fn ready_index(&self) -> Result<Arc<VectorIndex>, PipelineError> {
        let state = self.read_state()?;
        match (state.phase, &state.index) {
            (HandlePhase::Ready, Some(index)) => Ok(index.clone()),
            (HandlePhase::Building, _) => Err(PipelineError::IndexNotReady(
                "index is being rebuilt".to_string(),
            )),
            (HandlePhase::Loading, _) => Err(PipelineError::IndexNotReady(
                "index is being loaded".to_string(),
            )),
            _ => Err(PipelineError::IndexNotReady(
                "vector store not built yet, build the database first".to_string(),
            )),
        }
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, HandleState>, PipelineError> {
        self.state.read().map_err(|_| {
            PipelineError::TransientResourceBusy("index handle lock poisoned".to_string())
        })
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, HandleState>, PipelineError> {
        self.state.write().map_err(|_| {
            PipelineError::TransientResourceBusy("index handle lock poisoned".to_string())
        })
    }
}

fn normalize_document(
    extractor: &TextExtractor,
    normalizer: &PageNormalizer,
    document: &Document,
    ocr_language: &str,
    deadline: Instant,
) -> Result<Vec<Page>, PipelineError> {
    let units = extractor.extract(document)?;
    let mut pages = Vec::with_capacity(units.len());

    for unit in &units {
        if Instant::now() >= deadline {
            return Err(PipelineError::external(
                "normalization",
                format!(
                    "{} stopped at page {} of {} after its deadline",
                    document.name,
                    pages.len() + 1,
                    units.len()
                ),
            ));
        }
        pages.push(normalizer.normalize(
            PageInput {
                source: &document.name,
                unit_index: unit.unit_index,
                raw_text: &unit.text,
                pdf: unit.page_pdf.as_deref(),
            },
            ocr_language,
        ));
    }

    Ok(pages)
}

/// `source,page,excerpt` lines for the first pages that carry text.
fn preview_lines(pages: &[Page]) -> Result<Vec<String>, PipelineError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    for page in pages
        .iter()
        .filter(|page| !page.content_en.trim().is_empty())
        .take(PREVIEW_LINES)
    {
        let excerpt: String = page
            .content_en
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(PREVIEW_EXCERPT_CHARS)
            .collect();
        let number = page.page_number.to_string();
        writer.write_record([page.source.as_str(), number.as_str(), excerpt.as_str()])?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|error| PipelineError::Task(error.to_string()))?;
    Ok(String::from_utf8_lossy(&bytes)
        .lines()
        .map(str::to_string)
        .collect())
}

async fn blocking<T, F>(work: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| PipelineError::Task(error.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{CharacterNgramEmbedder, ComputeDevice};
    use crate::error::ErrorKind;
    use crate::extractor::tests::blank_pdf;
    use crate::services::OcrRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    struct EchoAnswerer;

    impl Answerer for EchoAnswerer {
        fn answer(&self, model: &str, prompt: &str) -> Result<String, PipelineError> {
            Ok(format!("{model}: {} chars of prompt", prompt.len()))
        }
    }

    struct PageOcr;

    impl OcrEngine for PageOcr {
        fn recognize(&self, request: OcrRequest<'_>) -> Result<String, PipelineError> {
            Ok(format!(
                "{} scanned page number {} with readable text",
                request.source, request.page_number
            ))
        }
    }

    fn pipeline(dir: &TempDir, ocr: Arc<dyn OcrEngine>) -> Pipeline {
        pipeline_with_timeout(dir, ocr, Duration::from_secs(30))
    }

    fn pipeline_with_timeout(
        dir: &TempDir,
        ocr: Arc<dyn OcrEngine>,
        step_timeout: Duration,
    ) -> Pipeline {
        let config = PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            lock_wait: Duration::from_millis(200),
            step_timeout,
            ..PipelineConfig::default()
        };
        let collaborators = Collaborators {
            ocr,
            ..Collaborators::offline(Arc::new(EchoAnswerer))
        };
        Pipeline::new(config, collaborators).expect("pipeline")
    }

    #[tokio::test]
    async fn pages_are_numbered_in_document_then_page_order() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir, Arc::new(PageOcr));
        let documents = vec![
            Document::new("first.pdf", blank_pdf(3)),
            Document::new("second.pdf", blank_pdf(2)),
        ];

        let pages = pipeline.normalize_documents(documents, "eng").await;

        let ordinals: Vec<u32> = pages.iter().map(|page| page.ordinal).collect();
        let numbers: Vec<u32> = pages.iter().map(|page| page.page_number).collect();
        let sources: Vec<&str> = pages.iter().map(|page| page.source.as_str()).collect();
        assert_eq!(ordinals, vec![1, 2, 3, 4, 5]);
        assert_eq!(numbers, vec![1, 2, 3, 1, 2]);
        assert_eq!(
            sources,
            vec!["first.pdf", "first.pdf", "first.pdf", "second.pdf", "second.pdf"]
        );
        assert_eq!(pages[4].content_en, "secondpdf scanned page number 2 with readable text");
    }

    #[tokio::test]
    async fn query_before_build_is_not_ready() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir, Arc::new(NoOcr));

        let error = pipeline
            .query(QueryRequest::new("anything"))
            .await
            .expect_err("no index yet");
        assert_eq!(error.kind(), ErrorKind::IndexNotReady);
        assert_eq!(pipeline.status(), IndexStatus { ready: false, count: 0 });
        assert_eq!(pipeline.phase(), HandlePhase::Empty);
    }

    #[tokio::test]
    async fn build_with_only_empty_documents_is_no_content() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir, Arc::new(NoOcr));

        let error = pipeline
            .build(
                vec![
                    Document::new("blank.pdf", blank_pdf(2)),
                    Document::new("empty.csv", b"header\n".to_vec()),
                ],
                BuildOptions::default(),
            )
            .await
            .expect_err("nothing to index");

        assert_eq!(error.kind(), ErrorKind::NoContent);
        assert_eq!(pipeline.phase(), HandlePhase::Empty);
        assert!(!pipeline.store().exists());
    }

    #[tokio::test]
    async fn build_then_query_returns_answer_and_chunks() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir, Arc::new(PageOcr));
        let options = BuildOptions {
            chunk_size: 40,
            chunk_overlap: 5,
            ..BuildOptions::default()
        };

        let report = pipeline
            .build(
                vec![
                    Document::new("scan.pdf", blank_pdf(2)),
                    Document::new("cities.csv", b"city,river\nVaranasi,Ganga\nPune,Mula\n".to_vec()),
                ],
                options,
            )
            .await
            .expect("build succeeds");

        assert_eq!(report.status, BUILD_STATUS);
        assert_eq!(pipeline.status(), IndexStatus { ready: true, count: report.num_chunks });
        assert_eq!(report.preview.len(), 3);
        assert!(report.preview[0].starts_with("scan.pdf,1,"));
        assert!(report.preview[2].starts_with("cities.csv,1,"));

        let response = pipeline
            .query(QueryRequest {
                prompt: "Varanasi Ganga".to_string(),
                top_k: 2,
                model: "tiny".to_string(),
            })
            .await
            .expect("query succeeds");
        assert_eq!(response.retrieved_chunks.len(), 2);
        assert!(response.answer.starts_with("tiny: "));
    }

    #[tokio::test]
    async fn invalid_requests_leave_state_untouched() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir, Arc::new(NoOcr));

        let invalid_chunking = BuildOptions {
            chunk_size: 10,
            chunk_overlap: 10,
            ..BuildOptions::default()
        };
        let error = pipeline
            .build(vec![Document::new("a.csv", b"h\nx\n".to_vec())], invalid_chunking)
            .await
            .expect_err("overlap too large");
        assert_eq!(error.kind(), ErrorKind::InvalidChunkConfig);

        let error = pipeline
            .build(vec![Document::new("a.docx", vec![1, 2, 3])], BuildOptions::default())
            .await
            .expect_err("unsupported");
        assert_eq!(error.kind(), ErrorKind::UnsupportedFormat);

        let error = pipeline
            .build(Vec::new(), BuildOptions::default())
            .await
            .expect_err("no documents");
        assert_eq!(error.kind(), ErrorKind::EmptyInput);
        assert_eq!(pipeline.phase(), HandlePhase::Empty);
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_prior_index() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir, Arc::new(NoOcr));

        pipeline
            .build(
                vec![Document::new("ok.csv", b"word\nmonsoon\nharvest\n".to_vec())],
                BuildOptions::default(),
            )
            .await
            .expect("first build");
        let before = pipeline.status();

        let error = pipeline
            .build(
                vec![Document::new("blank.pdf", blank_pdf(1))],
                BuildOptions::default(),
            )
            .await
            .expect_err("no content");
        assert_eq!(error.kind(), ErrorKind::NoContent);
        assert_eq!(pipeline.phase(), HandlePhase::Ready);
        assert_eq!(pipeline.status(), before);
        assert_eq!(pipeline.version(), 1);
    }

    struct SlowEmbedder {
        inner: CharacterNgramEmbedder,
        delay: Duration,
    }

    impl EmbeddingProvider for SlowEmbedder {
        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
            std::thread::sleep(self.delay);
            self.inner.embed(texts)
        }
    }

    async fn wait_for_phase(pipeline: &Pipeline, phase: HandlePhase) {
        for _ in 0..400 {
            if pipeline.phase() == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pipeline never reached {phase:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rebuild_is_exclusive_and_never_mixes_chunk_sets() {
        let dir = tempdir().expect("tempdir");
        let pipeline = Arc::new(pipeline(&dir, Arc::new(NoOcr)));
        pipeline
            .embeddings()
            .register(Arc::new(SlowEmbedder {
                inner: CharacterNgramEmbedder::new("slow", 128, ComputeDevice::Cpu),
                delay: Duration::from_millis(800),
            }))
            .expect("register");

        pipeline
            .build(
                vec![Document::new("old.csv", b"word\nmonsoon rainfall\n".to_vec())],
                BuildOptions::default(),
            )
            .await
            .expect("first build");

        let slow = BuildOptions {
            embedding_model: "slow".to_string(),
            ..BuildOptions::default()
        };
        let rebuild = {
            let pipeline = pipeline.clone();
            let options = slow.clone();
            tokio::spawn(async move {
                pipeline
                    .build(
                        vec![Document::new("new.csv", b"word\nquarterly revenue\n".to_vec())],
                        options,
                    )
                    .await
            })
        };
        wait_for_phase(&pipeline, HandlePhase::Building).await;

        let busy = pipeline
            .build(vec![Document::new("other.csv", b"word\nharvest\n".to_vec())], slow)
            .await
            .expect_err("second build waits too long");
        assert_eq!(busy.kind(), ErrorKind::TransientResourceBusy);

        let not_ready = pipeline.retrieve("monsoon", 5).await.expect_err("mid rebuild");
        assert_eq!(not_ready.kind(), ErrorKind::IndexNotReady);
        assert_eq!(pipeline.status(), IndexStatus { ready: false, count: 0 });

        rebuild.await.expect("join").expect("rebuild");
        let chunks = pipeline.retrieve("monsoon", 5).await.expect("ready again");
        assert_eq!(chunks, vec!["quarterly revenue".to_string()]);
        assert_eq!(pipeline.version(), 2);
    }

    struct SlowOcr {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl OcrEngine for SlowOcr {
        fn recognize(&self, request: OcrRequest<'_>) -> Result<String, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(format!("late text for page {}", request.page_number))
        }
    }

    #[tokio::test]
    async fn documents_past_their_deadline_are_left_out() {
        let dir = tempdir().expect("tempdir");
        let ocr = Arc::new(SlowOcr {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(150),
        });
        let pipeline = pipeline_with_timeout(&dir, ocr.clone(), Duration::from_millis(50));

        let report = pipeline
            .build(
                vec![
                    Document::new("slow.pdf", blank_pdf(4)),
                    Document::new("good.csv", b"word\nmonsoon rainfall\n".to_vec()),
                ],
                BuildOptions::default(),
            )
            .await
            .expect("remaining document still builds");

        assert_eq!(report.preview.len(), 1);
        assert!(report.preview[0].starts_with("good.csv,1,"));
        assert_eq!(pipeline.phase(), HandlePhase::Ready);

        // The abandoned worker finishes its current page and stops.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(ocr.calls.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn unreadable_documents_are_left_out() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir, Arc::new(NoOcr));

        let report = pipeline
            .build(
                vec![
                    Document::new("broken.pdf", b"%PDF-1.4\n%broken".to_vec()),
                    Document::new("good.csv", b"word\nmonsoon rainfall\n".to_vec()),
                ],
                BuildOptions::default(),
            )
            .await
            .expect("remaining document still builds");

        assert_eq!(report.num_chunks, 1);
        assert_eq!(report.preview, vec!["good.csv,1,monsoon rainfall".to_string()]);
    }

    #[test]
    fn preview_keeps_one_line_per_page() {
        let page = Page {
            source: "notes.csv".to_string(),
            page_number: 1,
            ordinal: 1,
            original_language: "en".to_string(),
            content_original: String::new(),
            content_en: "first line\nsecond line\r\n\tthird".to_string(),
            summary: String::new(),
        };

        let lines = preview_lines(&[page]).expect("preview");
        assert_eq!(lines, vec!["notes.csv,1,first line second line third".to_string()]);
    }

    #[test]
    fn preview_quotes_fields_and_caps_lines() {
        let pages: Vec<Page> = (1..=12)
            .map(|number| Page {
                source: "report, final.pdf".to_string(),
                page_number: number,
                ordinal: number,
                original_language: "en".to_string(),
                content_original: "text".to_string(),
                content_en: "x".repeat(200),
                summary: String::new(),
            })
            .collect();

        let lines = preview_lines(&pages).expect("preview");
        assert_eq!(lines.len(), PREVIEW_LINES);
        assert_eq!(lines[0], format!("\"report, final.pdf\",1,{}", "x".repeat(80)));
    }
}
