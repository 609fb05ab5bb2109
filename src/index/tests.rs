use super::*;
use crate::config::Config;
use crate::document::ParsedDocument;
use tempfile::TempDir;

const TEST_DIMENSION: usize = 4;

fn test_config() -> (Config, TempDir) {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };
    config.embedding.dimension = TEST_DIMENSION as u32;
    (config, temp_dir)
}

fn test_document(document_id: &str) -> ParsedDocument {
    let mut doc =
        ParsedDocument::from_page_texts("report.pdf", &["# Findings\nAll clear".to_string()]);
    doc.id = document_id.to_string();
    doc
}

fn test_record(document_id: &str, subject_id: &str, sequence_index: u32) -> ChunkRecord {
    ChunkRecord {
        sequence_index,
        document_id: document_id.to_string(),
        document_name: "report.pdf".to_string(),
        text: format!("chunk {} of document {}", sequence_index, document_id),
        section_title: Some("Findings".to_string()),
        page_number: Some(1),
        token_count: 12,
        subject_id: subject_id.to_string(),
        owner_organization: "clinic-a".to_string(),
        created_by: "user-1".to_string(),
        created_at: "2026-01-01T00:00:00Z".to_string(),
    }
}

fn test_vector(seed: f32) -> Vec<f32> {
    (0..TEST_DIMENSION)
        .map(|i| seed.mul_add(0.1, i as f32 * 0.01))
        .collect()
}

#[tokio::test]
async fn index_initialization_is_idempotent() {
    let (config, _temp_dir) = test_config();

    let index = VectorIndex::new(&config).await.expect("should create index");
    assert_eq!(index.table_name, "clinical_documents");
    assert_eq!(index.count_chunks().await.expect("should count"), 0);

    // A second open against the same directory reuses the collection.
    let reopened = VectorIndex::new(&config).await.expect("should reopen index");
    assert_eq!(reopened.count_chunks().await.expect("should count"), 0);
}

#[tokio::test]
async fn index_document_stores_all_chunks() {
    let (config, _temp_dir) = test_config();
    let index = VectorIndex::new(&config).await.expect("should create index");

    let doc = test_document("doc-1");
    let records = vec![
        test_record("doc-1", "subject-1", 0),
        test_record("doc-1", "subject-1", 1),
    ];
    let embeddings = vec![test_vector(1.0), test_vector(2.0)];

    index
        .index_document(&doc, &records, &embeddings)
        .await
        .expect("should index document");

    assert_eq!(index.count_chunks().await.expect("should count"), 2);
    assert!(
        index
            .document_exists("report.pdf")
            .await
            .expect("should check existence")
    );
    assert!(
        !index
            .document_exists("missing.pdf")
            .await
            .expect("should check existence")
    );
}

#[tokio::test]
async fn index_document_rejects_count_mismatch() {
    let (config, _temp_dir) = test_config();
    let index = VectorIndex::new(&config).await.expect("should create index");

    let doc = test_document("doc-1");
    let records = vec![test_record("doc-1", "subject-1", 0)];
    let embeddings = vec![test_vector(1.0), test_vector(2.0)];

    let result = index.index_document(&doc, &records, &embeddings).await;
    assert!(matches!(result, Err(crate::RagError::Index(_))));
    assert_eq!(index.count_chunks().await.expect("should count"), 0);
}

#[tokio::test]
async fn index_document_rejects_wrong_dimension() {
    let (config, _temp_dir) = test_config();
    let index = VectorIndex::new(&config).await.expect("should create index");

    let doc = test_document("doc-1");
    let records = vec![test_record("doc-1", "subject-1", 0)];
    let embeddings = vec![vec![0.1, 0.2]];

    let result = index.index_document(&doc, &records, &embeddings).await;
    let message = result.expect_err("should reject dimension").to_string();
    assert!(
        message.contains("dimension"),
        "unexpected error: {}",
        message
    );
}

#[tokio::test]
async fn reindexing_replaces_previous_chunks() {
    let (config, _temp_dir) = test_config();
    let index = VectorIndex::new(&config).await.expect("should create index");

    let doc = test_document("doc-1");
    let first = vec![
        test_record("doc-1", "subject-1", 0),
        test_record("doc-1", "subject-1", 1),
        test_record("doc-1", "subject-1", 2),
    ];
    let first_embeddings = vec![test_vector(1.0), test_vector(2.0), test_vector(3.0)];
    index
        .index_document(&doc, &first, &first_embeddings)
        .await
        .expect("should index first version");

    // Re-ingesting the same document must not accumulate rows.
    let second = vec![test_record("doc-1", "subject-1", 0)];
    let second_embeddings = vec![test_vector(4.0)];
    index
        .index_document(&doc, &second, &second_embeddings)
        .await
        .expect("should index second version");

    assert_eq!(index.count_chunks().await.expect("should count"), 1);
}

#[tokio::test]
async fn search_is_scoped_to_subject() {
    let (config, _temp_dir) = test_config();
    let index = VectorIndex::new(&config).await.expect("should create index");

    let doc_a = test_document("doc-a");
    index
        .index_document(
            &doc_a,
            &[test_record("doc-a", "111", 0)],
            &[test_vector(1.0)],
        )
        .await
        .expect("should index doc-a");

    let doc_b = test_document("doc-b");
    index
        .index_document(
            &doc_b,
            &[test_record("doc-b", "222", 0)],
            &[test_vector(1.0)],
        )
        .await
        .expect("should index doc-b");

    let results = index
        .search(&test_vector(1.0), "111", 10, None)
        .await
        .expect("should search");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record.subject_id, "111");
    assert_eq!(results[0].record.document_id, "doc-a");
}

#[tokio::test]
async fn search_can_narrow_to_one_document() {
    let (config, _temp_dir) = test_config();
    let index = VectorIndex::new(&config).await.expect("should create index");

    for doc_id in ["doc-a", "doc-b"] {
        let doc = test_document(doc_id);
        index
            .index_document(
                &doc,
                &[test_record(doc_id, "111", 0)],
                &[test_vector(1.0)],
            )
            .await
            .expect("should index document");
    }

    let results = index
        .search(&test_vector(1.0), "111", 10, Some("doc-b"))
        .await
        .expect("should search");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record.document_id, "doc-b");
}

#[tokio::test]
async fn search_on_empty_collection_returns_nothing() {
    let (config, _temp_dir) = test_config();
    let index = VectorIndex::new(&config).await.expect("should create index");

    let results = index
        .search(&test_vector(1.0), "111", 10, None)
        .await
        .expect("search should succeed");

    assert!(results.is_empty());
}

#[tokio::test]
async fn search_rejects_wrong_query_dimension() {
    let (config, _temp_dir) = test_config();
    let index = VectorIndex::new(&config).await.expect("should create index");

    let result = index.search(&[0.1, 0.2], "111", 10, None).await;
    assert!(matches!(result, Err(crate::RagError::Index(_))));
}

#[tokio::test]
async fn chunks_for_document_come_back_in_sequence_order() {
    let (config, _temp_dir) = test_config();
    let index = VectorIndex::new(&config).await.expect("should create index");

    let doc = test_document("doc-1");
    // Insert out of order; reads must still be sorted.
    let records = vec![
        test_record("doc-1", "subject-1", 2),
        test_record("doc-1", "subject-1", 0),
        test_record("doc-1", "subject-1", 1),
    ];
    let embeddings = vec![test_vector(1.0), test_vector(2.0), test_vector(3.0)];
    index
        .index_document(&doc, &records, &embeddings)
        .await
        .expect("should index document");

    let chunks = index
        .chunks_for_document("doc-1", 100)
        .await
        .expect("should fetch chunks");

    let indices: Vec<u32> = chunks.iter().map(|c| c.sequence_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(chunks[0].section_title.as_deref(), Some("Findings"));
    assert_eq!(chunks[0].page_number, Some(1));
}

#[tokio::test]
async fn filters_escape_single_quotes() {
    let (config, _temp_dir) = test_config();
    let index = VectorIndex::new(&config).await.expect("should create index");

    let mut record = test_record("doc-1", "o'brien", 0);
    record.subject_id = "o'brien".to_string();
    let doc = test_document("doc-1");
    index
        .index_document(&doc, &[record], &[test_vector(1.0)])
        .await
        .expect("should index document");

    let results = index
        .search(&test_vector(1.0), "o'brien", 10, None)
        .await
        .expect("quoted subject should not break the filter");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record.subject_id, "o'brien");
}

#[test]
fn escape_literal_doubles_quotes() {
    assert_eq!(escape_literal("plain"), "plain");
    assert_eq!(escape_literal("o'brien"), "o''brien");
    assert_eq!(escape_literal("''"), "''''");
}
