#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

// End-to-end pipeline test backed by mock HTTP services and a temporary
// vector store: upload -> OCR -> chunk -> embed -> index -> question -> answer.

use clindex::chunker::Chunker;
use clindex::config::Config;
use clindex::embeddings::EmbeddingClient;
use clindex::generation::CompletionClient;
use clindex::index::VectorIndex;
use clindex::ingest::{DocumentUpload, Ingestor};
use clindex::ocr::OcrClient;
use clindex::retrieval::{NO_CONTEXT_ANSWER, QueryRequest, RetrievalEngine};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const TEST_DIMENSION: usize = 8;

/// Deterministic per-text vectors so search has something to rank.
fn echo_embeddings(request: &Request) -> ResponseTemplate {
    let body: serde_json::Value =
        serde_json::from_slice(&request.body).expect("request body should be json");
    let inputs = body["input"].as_array().expect("input should be an array");

    let data: Vec<serde_json::Value> = inputs
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let length = text.as_str().map_or(0, str::len) as f32;
            let mut vector = vec![1.0_f32; TEST_DIMENSION];
            vector[0] = length / 1000.0;
            json!({ "index": i, "embedding": vector })
        })
        .collect();

    ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
}

async fn mount_services(server: &MockServer) {
    let report = format!(
        "# Admission Note\n\n{}\n\n## Medications\n\n{}",
        "Patient admitted with chest pain, workup unremarkable. ".repeat(15),
        "Prescribed aspirin 81mg daily and scheduled cardiology follow-up. ".repeat(15),
    );

    Mock::given(method("POST"))
        .and(path("/v1/ocr"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "pages": [{ "index": 0, "markdown": report }],
            "model": "mistral-ocr-latest"
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(echo_embeddings)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [
                { "message": { "role": "assistant", "content": "Aspirin 81mg daily." } }
            ]
        })))
        .mount(server)
        .await;
}

fn test_config(base_dir: &TempDir, service_url: &str) -> Config {
    let mut config = Config {
        base_dir: base_dir.path().to_path_buf(),
        ..Config::default()
    };
    config.ocr.base_url = service_url.to_string();
    config.ocr.api_key = "test-key".to_string();
    config.embedding.base_url = service_url.to_string();
    config.embedding.api_key = "test-key".to_string();
    config.embedding.dimension = TEST_DIMENSION as u32;
    config.generation.base_url = service_url.to_string();
    config.generation.api_key = "test-key".to_string();
    config.chunking.chunk_size = 60;
    config.chunking.chunk_overlap = 10;
    config.validate().expect("test config should be valid");
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn full_pipeline_answers_from_ingested_document() {
    let server = MockServer::start().await;
    mount_services(&server).await;

    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = test_config(&temp_dir, &server.uri());

    let index = Arc::new(
        VectorIndex::new(&config)
            .await
            .expect("should create index"),
    );
    let parser = Arc::new(OcrClient::new(&config.ocr).expect("should create ocr client"));
    let embedder = Arc::new(
        EmbeddingClient::new(&config.embedding).expect("should create embedding client"),
    );
    let model = Arc::new(
        CompletionClient::new(&config.generation).expect("should create completion client"),
    );
    let chunker = Chunker::new(&config.chunking).expect("should create chunker");

    let ingestor = Ingestor::new(
        parser,
        chunker,
        Arc::<EmbeddingClient>::clone(&embedder),
        Arc::clone(&index),
    );
    let upload = DocumentUpload {
        doc_id: "admission-1".to_string(),
        document_name: "admission.pdf".to_string(),
        content: b"%PDF-1.4 scanned admission note".to_vec(),
        subject_id: "patient-7".to_string(),
        owner_organization: "clinic-a".to_string(),
        created_by: "dr-jones".to_string(),
    };

    let report = ingestor.ingest(&upload).await.expect("should ingest");
    assert_eq!(report.document_id, "admission-1");
    assert!(report.chunks_indexed > 1);
    assert!(report.tokens_embedded > 0);

    let stored = index
        .chunks_for_document("admission-1", 500)
        .await
        .expect("should fetch stored chunks");
    assert_eq!(stored.len(), report.chunks_indexed);
    assert!(
        stored
            .iter()
            .any(|c| c.section_title.as_deref() == Some("Medications"))
    );

    let engine = RetrievalEngine::new(Arc::clone(&index), embedder, model);
    let answer = engine
        .answer(&QueryRequest {
            question: "What medications were prescribed?".to_string(),
            subject_id: "patient-7".to_string(),
            document_id: None,
            history: Vec::new(),
        })
        .await
        .expect("should answer");

    assert_eq!(answer.answer, "Aspirin 81mg daily.");
    assert!(!answer.sources.is_empty());
    for source in &answer.sources {
        assert_eq!(source.document_id, "admission-1");
        assert!(!source.chunk_id.is_empty());
    }

    // Another subject sees nothing from this patient's record.
    let other = engine
        .answer(&QueryRequest {
            question: "What medications were prescribed?".to_string(),
            subject_id: "patient-8".to_string(),
            document_id: None,
            history: Vec::new(),
        })
        .await
        .expect("should answer");

    assert_eq!(other.answer, NO_CONTEXT_ANSWER);
    assert!(other.sources.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn reingestion_keeps_one_copy_of_the_document() {
    let server = MockServer::start().await;
    mount_services(&server).await;

    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = test_config(&temp_dir, &server.uri());

    let index = Arc::new(
        VectorIndex::new(&config)
            .await
            .expect("should create index"),
    );
    let parser = Arc::new(OcrClient::new(&config.ocr).expect("should create ocr client"));
    let embedder = Arc::new(
        EmbeddingClient::new(&config.embedding).expect("should create embedding client"),
    );
    let chunker = Chunker::new(&config.chunking).expect("should create chunker");

    let ingestor = Ingestor::new(parser, chunker, embedder, Arc::clone(&index));
    let upload = DocumentUpload {
        doc_id: "admission-1".to_string(),
        document_name: "admission.pdf".to_string(),
        content: b"%PDF-1.4 scanned admission note".to_vec(),
        subject_id: "patient-7".to_string(),
        owner_organization: "clinic-a".to_string(),
        created_by: "dr-jones".to_string(),
    };

    ingestor.ingest(&upload).await.expect("should ingest once");
    let first_count = index.count_chunks().await.expect("should count");

    ingestor.ingest(&upload).await.expect("should ingest twice");
    let second_count = index.count_chunks().await.expect("should count");

    assert_eq!(first_count, second_count);
}
