//! BM25 sparse index over Tantivy.
//!
//! The simple tokenizer chain handles Devanagari tokens as-is; stemming is
//! applied to the Latin side only. Tantivy searches are CPU-bound, so the
//! retriever dispatches them through `spawn_blocking`.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Schema, Value, STORED, STRING, TEXT};
use tantivy::{Index, IndexReader, IndexWriter, TantivyDocument};

use crate::vector_store::{Document, ScoredDoc};
use crate::RagError;

pub struct SparseIndex {
    index: Index,
    reader: RwLock<IndexReader>,
    writer: Mutex<IndexWriter>,
    id_field: Field,
    text_field: Field,
}

impl SparseIndex {
    /// RAM-backed index; production can point this at a directory instead.
    pub fn in_ram() -> Result<Self, RagError> {
        let mut schema_builder = Schema::builder();
        let id_field = schema_builder.add_text_field("doc_id", STRING | STORED);
        let text_field = schema_builder.add_text_field("text", TEXT | STORED);
        let schema = schema_builder.build();

        let index = Index::create_in_ram(schema);
        let writer = index
            .writer(15_000_000)
            .map_err(|e| RagError::Store(e.to_string()))?;
        let reader = index
            .reader()
            .map_err(|e| RagError::Store(e.to_string()))?;

        Ok(Self {
            index,
            reader: RwLock::new(reader),
            writer: Mutex::new(writer),
            id_field,
            text_field,
        })
    }

    /// Index a batch and commit. Exclusive with other writers; readers keep
    /// serving the previous generation until the reload below.
    pub fn add_documents(&self, docs: &[Document]) -> Result<(), RagError> {
        {
            let mut writer = self.writer.lock();
            for doc in docs {
                let mut t_doc = TantivyDocument::default();
                t_doc.add_text(self.id_field, &doc.id);
                t_doc.add_text(self.text_field, &doc.text);
                writer
                    .add_document(t_doc)
                    .map_err(|e| RagError::Store(e.to_string()))?;
            }
            writer
                .commit()
                .map_err(|e| RagError::Store(e.to_string()))?;
        }
        self.reader
            .read()
            .reload()
            .map_err(|e| RagError::Store(e.to_string()))?;
        Ok(())
    }

    /// BM25 search. Query terms that fail to parse (stray punctuation from
    /// STT) are dropped rather than erroring the turn.
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredDoc>, RagError> {
        let searcher = self.reader.read().searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.text_field]);

        let sanitized = sanitize_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }

        let parsed = parser
            .parse_query_lenient(&sanitized)
            .0;

        let top = searcher
            .search(&parsed, &TopDocs::with_limit(top_k.max(1)))
            .map_err(|e| RagError::Search(e.to_string()))?;

        let mut results = Vec::with_capacity(top.len());
        for (score, address) in top {
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| RagError::Search(e.to_string()))?;
            let field_text = |field: Field| {
                doc.get_first(field)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            results.push(ScoredDoc {
                doc: Document {
                    id: field_text(self.id_field),
                    text: field_text(self.text_field),
                    metadata: HashMap::new(),
                },
                score,
            });
        }
        Ok(results)
    }
}

fn sanitize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
