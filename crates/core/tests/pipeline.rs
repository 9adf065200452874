use polyrag_core::{
    Answerer, BuildOptions, Collaborators, Document, ErrorKind, HandlePhase, IndexStatus,
    Language, LeadSummarizer, NoOcr, Pipeline, PipelineConfig, PipelineError, QueryRequest,
    Translator, WhatlangDetector,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const HINDI_ROWS: &str = "वाक्य\nनमस्ते दुनिया\n";
const ENGLISH_ROWS: &str = "topic,detail\nmonsoon,rainfall over the western ghats\nharvest,rice paddies in the delta\n";

#[derive(Default)]
struct GlossaryTranslator {
    calls: AtomicUsize,
}

impl Translator for GlossaryTranslator {
    fn translate(
        &self,
        text: &str,
        source: &Language,
        target: &Language,
    ) -> Result<String, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(target.iso639_1, "en");
        if source.iso639_1 == "hi" && text.contains("नमस्ते") {
            Ok("hello world greetings from the north".to_string())
        } else {
            Ok(text.to_string())
        }
    }
}

struct ContextAnswerer;

impl Answerer for ContextAnswerer {
    fn answer(&self, model: &str, prompt: &str) -> Result<String, PipelineError> {
        assert!(prompt.starts_with("Answer the question based on the context below:"));
        let question = prompt.rsplit("Question: ").next().unwrap_or_default();
        Ok(format!("[{model}] {question}"))
    }
}

fn config(data_dir: &Path) -> PipelineConfig {
    PipelineConfig {
        data_dir: data_dir.to_path_buf(),
        ..PipelineConfig::default()
    }
}

fn collaborators(translator: Arc<GlossaryTranslator>) -> Collaborators {
    Collaborators {
        detector: Arc::new(WhatlangDetector),
        ocr: Arc::new(NoOcr),
        translator,
        summarizer: Arc::new(LeadSummarizer),
        answerer: Arc::new(ContextAnswerer),
    }
}

fn documents() -> Vec<Document> {
    vec![
        Document::new("hindi.csv", HINDI_ROWS.as_bytes().to_vec()),
        Document::new("english.csv", ENGLISH_ROWS.as_bytes().to_vec()),
    ]
}

fn options() -> BuildOptions {
    BuildOptions {
        chunk_size: 30,
        chunk_overlap: 5,
        ocr_language: "hin".to_string(),
        ..BuildOptions::default()
    }
}

#[tokio::test]
async fn build_query_reload_and_transfer() -> Result<(), Box<dyn std::error::Error>> {
    let data = tempfile::tempdir()?;
    let translator = Arc::new(GlossaryTranslator::default());
    let pipeline = Pipeline::open(config(data.path()), collaborators(translator.clone())).await?;
    assert_eq!(pipeline.status(), IndexStatus { ready: false, count: 0 });

    let report = pipeline.build(documents(), options()).await?;
    assert_eq!(report.status, "database built");
    assert!(report.num_chunks >= 3);
    assert_eq!(report.preview.len(), 2);
    assert!(report.preview[0].starts_with("hindi.csv,1,hello world greetings"));
    assert!(translator.calls.load(Ordering::SeqCst) >= 2);

    let response = pipeline
        .query(QueryRequest {
            prompt: "rainfall ghats".to_string(),
            top_k: 2,
            model: "qwen3:1.7b".to_string(),
        })
        .await?;
    assert_eq!(response.answer, "[qwen3:1.7b] rainfall ghats");
    assert_eq!(response.retrieved_chunks.len(), 2);

    let before = pipeline.retrieve("rainfall ghats", 3).await?;
    let status = pipeline.status();
    pipeline.shutdown().await;

    let reopened = Pipeline::open(config(data.path()), collaborators(translator.clone())).await?;
    assert_eq!(reopened.phase(), HandlePhase::Ready);
    assert_eq!(reopened.status(), status);
    assert_eq!(reopened.retrieve("rainfall ghats", 3).await?, before);

    let archive = reopened.export_snapshot().await?;
    let elsewhere = tempfile::tempdir()?;
    let target = Pipeline::open(config(elsewhere.path()), collaborators(translator)).await?;
    assert_eq!(target.import_snapshot(archive).await?, status);
    assert_eq!(target.retrieve("rainfall ghats", 3).await?, before);

    let error = target
        .import_snapshot(b"not a zip archive".to_vec())
        .await
        .expect_err("garbage archive");
    assert_eq!(error.kind(), ErrorKind::CorruptIndex);
    assert_eq!(target.status(), status);
    assert_eq!(target.retrieve("rainfall ghats", 3).await?, before);
    Ok(())
}

#[tokio::test]
async fn corrupt_storage_opens_empty() -> Result<(), Box<dyn std::error::Error>> {
    let data = tempfile::tempdir()?;
    let collection = data.path().join("rag_db");
    std::fs::create_dir_all(&collection)?;
    std::fs::write(collection.join("manifest.json"), b"{ truncated")?;

    let pipeline = Pipeline::open(
        config(data.path()),
        collaborators(Arc::new(GlossaryTranslator::default())),
    )
    .await?;
    assert_eq!(pipeline.phase(), HandlePhase::Empty);

    let error = pipeline
        .export_snapshot()
        .await
        .expect_err("nothing valid to export");
    assert_eq!(error.kind(), ErrorKind::CorruptIndex);

    let report = pipeline.build(documents(), options()).await?;
    assert_eq!(pipeline.status(), IndexStatus { ready: true, count: report.num_chunks });
    Ok(())
}

#[tokio::test]
async fn top_k_must_be_positive() -> Result<(), Box<dyn std::error::Error>> {
    let data = tempfile::tempdir()?;
    let pipeline = Pipeline::open(
        config(data.path()),
        collaborators(Arc::new(GlossaryTranslator::default())),
    )
    .await?;
    pipeline.build(documents(), options()).await?;

    let error = pipeline
        .query(QueryRequest {
            top_k: 0,
            ..QueryRequest::new("monsoon")
        })
        .await
        .expect_err("zero top_k");
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
    Ok(())
}

#[tokio::test]
async fn unreadable_entries_survive_a_failed_reload() -> Result<(), Box<dyn std::error::Error>> {
    let data = tempfile::tempdir()?;
    let translator = Arc::new(GlossaryTranslator::default());
    let pipeline = Pipeline::open(config(data.path()), collaborators(translator.clone())).await?;
    pipeline.build(documents(), options()).await?;
    pipeline.shutdown().await;

    let collection = data.path().join("rag_db");
    std::fs::write(collection.join("entries.json"), b"[")?;

    let reopened = Pipeline::open(config(data.path()), collaborators(translator)).await?;
    assert_eq!(reopened.phase(), HandlePhase::Empty);
    assert!(collection.join("manifest.json").is_file());
    assert_eq!(std::fs::read(collection.join("entries.json"))?, b"[");

    let error = reopened.restore().await.expect_err("still corrupt");
    assert_eq!(error.kind(), ErrorKind::CorruptIndex);
    assert!(collection.join("manifest.json").is_file());
    Ok(())
}

#[tokio::test]
async fn reload_uses_the_stored_embedding_dimension() -> Result<(), Box<dyn std::error::Error>> {
    let data = tempfile::tempdir()?;
    let translator = Arc::new(GlossaryTranslator::default());
    let narrow = PipelineConfig {
        embedding_dimensions: 16,
        ..config(data.path())
    };

    let pipeline = Pipeline::open(narrow, collaborators(translator.clone())).await?;
    pipeline.build(documents(), options()).await?;
    let before = pipeline.retrieve("rice paddies", 2).await?;
    pipeline.shutdown().await;

    let reopened = Pipeline::open(config(data.path()), collaborators(translator)).await?;
    assert_eq!(reopened.phase(), HandlePhase::Ready);
    assert_eq!(reopened.retrieve("rice paddies", 2).await?, before);
    Ok(())
}
