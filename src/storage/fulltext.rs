//! BM25 full-text index over knowledge documents (tantivy)

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tantivy::collector::{Count, TopDocs};
use tantivy::query::{QueryParser, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, Value, STORED, STRING, TEXT};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, info};

use super::{AdapterHealth, FullTextStore, TextDocument};
use crate::errors::{MemoryError, Result};

/// 50MB writer heap
const WRITER_HEAP_BYTES: usize = 50_000_000;

const QUERY_SYNTAX_CHARS: [char; 19] = [
    ':', '^', '~', '*', '?', '[', ']', '{', '}', '(', ')', '"', '\\', '/', '+', '-', '!', '&', '|',
];

pub struct TantivyStore {
    index: Index,
    reader: IndexReader,
    writer: Arc<RwLock<IndexWriter>>,
    id_field: Field,
    title_field: Field,
    body_field: Field,
}

impl TantivyStore {
    fn schema() -> (Schema, Field, Field, Field) {
        let mut schema_builder = Schema::builder();
        let id_field = schema_builder.add_text_field("id", STRING | STORED);
        let title_field = schema_builder.add_text_field("title", TEXT);
        let body_field = schema_builder.add_text_field("body", TEXT);
        (schema_builder.build(), id_field, title_field, body_field)
    }

    /// Create or open an index at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let (schema, id_field, title_field, body_field) = Self::schema();

        std::fs::create_dir_all(path).map_err(MemoryError::storage)?;
        let dir = tantivy::directory::MmapDirectory::open(path)
            .context("Failed to open tantivy directory")?;
        let index = if Index::exists(&dir).map_err(MemoryError::storage)? {
            Index::open(dir).context("Failed to open existing full-text index")?
        } else {
            Index::create_in_dir(path, schema).context("Failed to create full-text index")?
        };

        info!("Full-text index initialized at {:?}", path);
        Self::from_index(index, id_field, title_field, body_field)
    }

    /// Index held entirely in RAM
    pub fn in_ram() -> Result<Self> {
        let (schema, id_field, title_field, body_field) = Self::schema();
        Self::from_index(Index::create_in_ram(schema), id_field, title_field, body_field)
    }

    fn from_index(index: Index, id_field: Field, title_field: Field, body_field: Field) -> Result<Self> {
        let writer = index
            .writer(WRITER_HEAP_BYTES)
            .context("Failed to create index writer")?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .context("Failed to create index reader")?;

        Ok(Self {
            index,
            reader,
            writer: Arc::new(RwLock::new(writer)),
            id_field,
            title_field,
            body_field,
        })
    }

    /// Apply `f` to the writer, then commit and reload off the async executor
    async fn write<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&IndexWriter) -> Result<()> + Send + 'static,
    {
        let writer = self.writer.clone();
        let reader = self.reader.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut writer = writer.write();
            f(&writer)?;
            writer.commit().context("Failed to commit full-text index")?;
            reader.reload()?;
            Ok(())
        })
        .await?
    }

    fn contains(&self, id: &str) -> Result<bool> {
        let searcher = self.reader.searcher();
        let query = TermQuery::new(
            Term::from_field_text(self.id_field, id),
            IndexRecordOption::Basic,
        );
        Ok(searcher.search(&query, &Count)? > 0)
    }
}

#[async_trait]
impl FullTextStore for TantivyStore {
    async fn index(&self, doc: TextDocument) -> Result<()> {
        let mut tdoc = TantivyDocument::new();
        tdoc.add_text(self.id_field, &doc.id);
        tdoc.add_text(self.title_field, &doc.title);
        tdoc.add_text(self.body_field, &doc.body);
        let id_term = Term::from_field_text(self.id_field, &doc.id);

        self.write(move |writer| {
            writer.delete_term(id_term);
            writer.add_document(tdoc)?;
            Ok(())
        })
        .await
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<(String, f32)>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let query_parser =
            QueryParser::for_index(&self.index, vec![self.title_field, self.body_field]);

        let escaped = query.replace(QUERY_SYNTAX_CHARS, " ");
        let parsed_query = match query_parser.parse_query(&escaped) {
            Ok(q) => q,
            Err(e) => {
                debug!("Full-text query parse error for '{}': {}", escaped, e);
                return Ok(Vec::new());
            }
        };

        let top_docs = searcher
            .search(&parsed_query, &TopDocs::with_limit(limit))
            .context("Full-text search failed")?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            if let Ok(doc) = searcher.doc::<TantivyDocument>(doc_address) {
                if let Some(id) = doc.get_first(self.id_field).and_then(|v| v.as_str()) {
                    results.push((id.to_string(), score));
                }
            }
        }
        Ok(results)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        if !self.contains(id)? {
            return Ok(false);
        }
        let id_term = Term::from_field_text(self.id_field, id);
        self.write(move |writer| {
            writer.delete_term(id_term);
            Ok(())
        })
        .await?;
        Ok(true)
    }

    async fn health_check(&self) -> AdapterHealth {
        let docs = self.reader.searcher().num_docs();
        let mut health = AdapterHealth::ok("fulltext:tantivy");
        health.detail = Some(format!("{docs} documents"));
        health
    }
}
