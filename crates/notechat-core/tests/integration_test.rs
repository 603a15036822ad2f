//! Integration tests for notechat-core
//!
//! End-to-end runs over on-disk storage:
//! - Ingest documents and query them back
//! - Generation replacement, append mode and integrity checks
//! - Concurrent readers during re-ingestion
//!
//! Tests that download the MiniLM model are ignored by default.
//! Run with: cargo test --test integration_test -- --ignored --nocapture

use notechat_core::{
    build_prompt, ChatRequest, ChatService, CompletionModel, DocNode, FileStorage, HashingEmbedder,
    IngestMode, IngestOutcome, Ingestor, RagConfig, RagError, Result, Retriever, Storage,
};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::TempDir;

const DIM: usize = 384;

fn config_in(dir: &Path) -> RagConfig {
    RagConfig::with_data_dir(dir)
}

fn storage_for(config: &RagConfig) -> Arc<dyn Storage> {
    Arc::new(FileStorage::from_config(config))
}

fn ingestor(config: &RagConfig, storage: Arc<dyn Storage>) -> Ingestor {
    Ingestor::new(config, Box::new(HashingEmbedder::new(DIM).unwrap()), storage).unwrap()
}

fn retriever(storage: Arc<dyn Storage>) -> Retriever {
    Retriever::new(Box::new(HashingEmbedder::new(DIM).unwrap()), storage, 5)
}

#[test]
fn test_six_hundred_char_document_yields_two_chunks() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let storage = storage_for(&config);

    let text = "alpha beta gamma delta ".repeat(30);
    let text = format!("{}x", &text[..599]);
    assert_eq!(text.len(), 600);

    let report = ingestor(&config, storage.clone())
        .ingest_document(&DocNode::text(text.clone()), "alpha.txt")
        .unwrap();
    assert_eq!(report.outcome, IngestOutcome::Persisted);
    assert_eq!(report.chunks, 2);

    let generation = storage.load().unwrap().unwrap();
    assert_eq!(generation.store().get(0).unwrap().text, &text[..500]);
    assert_eq!(generation.store().get(1).unwrap().text, &text[400..]);
}

#[test]
fn test_empty_document_then_query_reports_no_index() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let storage = storage_for(&config);

    let report = ingestor(&config, storage.clone())
        .ingest_document(&DocNode::container(vec![]), "scan.pdf")
        .unwrap();
    assert_eq!(report.outcome, IngestOutcome::Empty);
    assert_eq!(report.chunks, 0);
    assert!(!config.index_path.exists());

    let err = retriever(storage).retrieve("anything?", 5).unwrap_err();
    assert!(matches!(err, RagError::NoIndexAvailable));
}

#[test]
fn test_query_retrieves_definition_and_prompt_labels_it() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let storage = storage_for(&config);

    let doc = DocNode::container(vec![DocNode::text("X is defined as Y")]);
    ingestor(&config, storage.clone())
        .ingest_document(&doc, "glossary.txt")
        .unwrap();
    ingestor(&config, storage.clone())
        .with_mode(IngestMode::Append)
        .ingest_document(&DocNode::text("Bananas grow in tropical climates"), "fruit.txt")
        .unwrap();

    let chunks = retriever(storage).retrieve("What is X?", 1).unwrap();
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].text.contains("x is defined as y"));

    let prompt = build_prompt(&chunks, "What is X?");
    assert!(prompt.contains("[Chunk 1]\nx is defined as y"));
}

#[test]
fn test_index_and_metadata_stay_aligned() {
    let temp = TempDir::new().unwrap();
    let config = RagConfig {
        chunk_size: 40,
        chunk_overlap: 10,
        ..config_in(temp.path())
    };
    let storage = storage_for(&config);

    let text = "The quick brown fox jumps over the lazy dog. ".repeat(12);
    ingestor(&config, storage.clone())
        .ingest_document(&DocNode::text(text), "fox.txt")
        .unwrap();

    let generation = storage.load().unwrap().unwrap();
    assert_eq!(generation.index().len(), generation.store().len());

    // Every row embeds exactly the text stored at the same position
    let mut embedder = HashingEmbedder::new(DIM).unwrap();
    for (i, chunk) in generation.store().chunks().iter().enumerate() {
        let expected = notechat_core::Embedder::embed_query(&mut embedder, &chunk.text).unwrap();
        let hits = generation.index().search(&expected, 1).unwrap();
        assert!(hits[0].distance < 1e-6);
        assert_eq!(generation.index().vector(i).unwrap(), expected.as_slice());
    }
}

#[test]
fn test_files_on_disk_and_text_dump() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let storage = storage_for(&config);

    let source = temp.path().join("notes.md");
    fs::write(&source, "# Notes\n\nThe launch is scheduled for Monday.").unwrap();
    ingestor(&config, storage.clone()).ingest_file(&source).unwrap();

    assert!(config.index_path.exists());
    assert!(config.metadata_path.exists());

    let metadata: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&config.metadata_path).unwrap()).unwrap();
    let records = metadata.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["source_file"], "notes.md");
    assert_eq!(records[0]["page"], "all");
    assert_eq!(records[0]["content_type"], "text");

    let dump = fs::read_to_string(config.chunks_text_path.as_ref().unwrap()).unwrap();
    assert!(dump.contains("| page all]\n# notes the launch is scheduled for monday."));
}

#[test]
fn test_tampered_metadata_is_rejected() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let storage = storage_for(&config);

    ingestor(&config, storage.clone())
        .ingest_document(
            &DocNode::container(vec![DocNode::text("one ".repeat(200))]),
            "a.txt",
        )
        .unwrap();

    let mut records: Vec<serde_json::Value> =
        serde_json::from_str(&fs::read_to_string(&config.metadata_path).unwrap()).unwrap();
    records.pop();
    fs::write(
        &config.metadata_path,
        serde_json::to_string_pretty(&records).unwrap(),
    )
    .unwrap();

    let err = retriever(storage).retrieve("one", 1).unwrap_err();
    assert!(matches!(err, RagError::PersistenceCorrupt(_)));
}

#[test]
fn test_readers_never_see_mixed_generations() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let storage = storage_for(&config);

    ingestor(&config, storage.clone())
        .ingest_document(&DocNode::text("seed generation"), "seed.txt")
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let storage = storage.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut loads = 0;
                loop {
                    let generation = storage.load().expect("load").expect("generation");
                    assert_eq!(generation.index().len(), generation.store().len());
                    loads += 1;
                    if stop.load(Ordering::SeqCst) {
                        break loads;
                    }
                }
            })
        })
        .collect();

    let mut writer = ingestor(&config, storage.clone());
    for i in 0..20 {
        // Alternate between one and several chunks so sizes differ
        let text = if i % 2 == 0 {
            format!("short generation {i}")
        } else {
            format!("long generation {i} ").repeat(60)
        };
        writer
            .ingest_document(&DocNode::text(text), &format!("gen{i}.txt"))
            .unwrap();
    }
    stop.store(true, Ordering::SeqCst);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
}

#[test]
fn test_concurrent_appenders_keep_every_chunk() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());

    let writers: Vec<_> = (0..2)
        .map(|w| {
            let config = config.clone();
            thread::spawn(move || {
                // Each writer gets its own handle on the same files
                let mut writer =
                    ingestor(&config, storage_for(&config)).with_mode(IngestMode::Append);
                for i in 0..15 {
                    writer
                        .ingest_document(
                            &DocNode::text(format!("writer {w} note {i}")),
                            &format!("w{w}-{i}.txt"),
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let generation = storage_for(&config).load().unwrap().unwrap();
    assert_eq!(generation.len(), 30);
    assert_eq!(generation.store().source_files().len(), 30);
}

struct Echo {
    prompts: Arc<Mutex<Vec<String>>>,
}

impl CompletionModel for Echo {
    fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok("Y".to_string())
    }

    fn name(&self) -> &str {
        "echo"
    }
}

#[test]
fn test_chat_over_ingested_document() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let storage = storage_for(&config);

    ingestor(&config, storage.clone())
        .ingest_document(&DocNode::text("X is defined as Y"), "glossary.txt")
        .unwrap();

    let prompts = Arc::new(Mutex::new(Vec::new()));
    let mut service = ChatService::new(Box::new(Echo {
        prompts: prompts.clone(),
    }))
    .with_retriever(retriever(storage));

    let response = service.ask(&ChatRequest::documents("What is X?")).unwrap();
    assert_eq!(response.answer, "Y");
    assert_eq!(response.chunks_used, 1);
    assert!(prompts.lock().unwrap()[0].contains("[Chunk 1]\nx is defined as y"));
}

#[test]
#[ignore = "downloads sentence-transformers/all-MiniLM-L6-v2"]
fn test_minilm_end_to_end() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let storage = storage_for(&config);

    let embedder = notechat_core::load_embedder(&config.embedding_model_id).unwrap();
    let mut ingestor = Ingestor::new(&config, embedder, storage.clone()).unwrap();
    ingestor
        .ingest_document(
            &DocNode::text("Photosynthesis converts light energy into chemical energy."),
            "biology.txt",
        )
        .unwrap();
    ingestor.set_mode(IngestMode::Append);
    ingestor
        .ingest_document(
            &DocNode::text("The Treaty of Westphalia was signed in 1648."),
            "history.txt",
        )
        .unwrap();

    let embedder = notechat_core::load_embedder(&config.embedding_model_id).unwrap();
    let mut retriever = Retriever::new(embedder, storage, 5);
    let chunks = retriever.retrieve("How do plants make energy?", 1).unwrap();
    assert_eq!(chunks[0].source_file, "biology.txt");
}
