//! Integración con Neo4j como vector store para los `:Document`.
//!
//! API pública:
//!   - `VectorStore::similarity_search(&str)` (búsqueda híbrida vector + léxica).
//!   - `Neo4jVectorIndex::ensure_index()` y `refresh_embeddings()`.
//!
//! La búsqueda nunca escribe; sólo `refresh_embeddings` (llamado al arrancar y
//! tras cada ingesta) completa los embeddings que falten.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use neo4rs::{query, Graph};
use tracing::{debug, info};

use crate::error::StoreUnavailableError;
use crate::fulltext::remove_lucene_chars;
use crate::llm::LlmManager;
use crate::models::RetrievedChunk;

pub const VECTOR_INDEX: &str = "vector";
pub const KEYWORD_INDEX: &str = "keyword";
/// K por defecto del almacén; el núcleo no lo reconfigura.
pub const DEFAULT_TOP_K: usize = 4;

const EMBEDDING_DIMENSIONS: i64 = 1536;
const EMBEDDING_BATCH: i64 = 100;

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Fragmentos más similares a la consulta, ordenados por relevancia.
    async fn similarity_search(&self, query: &str) -> Result<Vec<RetrievedChunk>, StoreUnavailableError>;
}

pub struct Neo4jVectorIndex {
    graph: Arc<Graph>,
    llm: LlmManager,
    top_k: usize,
}

impl Neo4jVectorIndex {
    pub fn new(graph: Arc<Graph>, llm: LlmManager) -> Self {
        Self {
            graph,
            llm,
            top_k: DEFAULT_TOP_K,
        }
    }

    /// Garantiza que el índice vectorial sobre `:Document(embedding)` exista.
    pub async fn ensure_index(&self) -> Result<()> {
        // ¿Ya existe el índice? Usamos la sintaxis moderna SHOW VECTOR INDEXES.
        let mut cursor = self
            .graph
            .execute(
                query("SHOW VECTOR INDEXES YIELD name WHERE name = $name RETURN name")
                    .param("name", VECTOR_INDEX),
            )
            .await?;

        if cursor.next().await?.is_some() {
            info!("Índice vectorial '{VECTOR_INDEX}' ya existe.");
            return Ok(());
        }

        let cypher = format!(
            "\
CREATE VECTOR INDEX {VECTOR_INDEX} IF NOT EXISTS
FOR (d:Document)
ON (d.embedding)
OPTIONS {{
  indexConfig: {{
    `vector.dimensions`: {EMBEDDING_DIMENSIONS},
    `vector.similarity_function`: 'cosine'
  }}
}}"
        );

        self.graph.run(query(&cypher)).await?;
        info!("Índice vectorial '{VECTOR_INDEX}' creado.");
        Ok(())
    }

    /// Calcula embeddings para los `:Document` con texto y sin vector.
    /// Devuelve cuántos nodos se han actualizado.
    pub async fn refresh_embeddings(&self) -> Result<usize> {
        let mut updated = 0;

        loop {
            let mut cursor = self
                .graph
                .execute(
                    query(
                        "MATCH (d:Document)
                         WHERE d.embedding IS NULL AND d.text IS NOT NULL
                         RETURN elementId(d) AS id, d.text AS text
                         LIMIT $batch",
                    )
                    .param("batch", EMBEDDING_BATCH),
                )
                .await?;

            let mut ids = Vec::new();
            let mut texts = Vec::new();
            while let Some(row) = cursor.next().await? {
                let id: String = row.get("id").ok_or_else(|| anyhow!("Falta campo 'id' en resultado de Neo4j"))?;
                let text: String = row.get("text").ok_or_else(|| anyhow!("Falta campo 'text' en resultado de Neo4j"))?;
                ids.push(id);
                texts.push(text);
            }

            if ids.is_empty() {
                break;
            }

            let vectors = self.llm.embed_texts(texts).await?;
            for (id, vector) in ids.into_iter().zip(vectors) {
                self.graph
                    .run(
                        query("MATCH (d:Document) WHERE elementId(d) = $id SET d.embedding = $embedding")
                            .param("id", id)
                            .param("embedding", vector),
                    )
                    .await?;
                updated += 1;
            }
        }

        if updated > 0 {
            info!("Embeddings calculados para {updated} documentos.");
        }
        Ok(updated)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f64>, StoreUnavailableError> {
        let mut vectors = self
            .llm
            .embed_texts(vec![text.to_string()])
            .await
            .map_err(StoreUnavailableError::vector)?;
        vectors
            .pop()
            .ok_or_else(|| StoreUnavailableError::vector("No se pudo generar embedding de la query"))
    }
}

#[async_trait]
impl VectorStore for Neo4jVectorIndex {
    async fn similarity_search(&self, query_text: &str) -> Result<Vec<RetrievedChunk>, StoreUnavailableError> {
        let embedding = self.embed_query(query_text).await?;
        let keyword_query = remove_lucene_chars(query_text);

        // Cada fuente se normaliza por su máximo antes de fusionar.
        let vector_branch = "CALL db.index.vector.queryNodes($vector_index, $k, $embedding)
               YIELD node, score
               WITH collect({node: node, score: score}) AS nodes, max(score) AS max
               UNWIND nodes AS n
               RETURN n.node AS node, (n.score / max) AS score";
        let cypher = if keyword_query.is_empty() {
            format!(
                "CALL {{ {vector_branch} }}
                 WITH node, max(score) AS score ORDER BY score DESC LIMIT $k
                 RETURN node.text AS text, score"
            )
        } else {
            format!(
                "CALL {{
                   {vector_branch}
                   UNION
                   CALL db.index.fulltext.queryNodes($keyword_index, $query, {{limit: $k}})
                   YIELD node, score
                   WITH collect({{node: node, score: score}}) AS nodes, max(score) AS max
                   UNWIND nodes AS n
                   RETURN n.node AS node, (n.score / max) AS score
                 }}
                 WITH node, max(score) AS score ORDER BY score DESC LIMIT $k
                 RETURN node.text AS text, score"
            )
        };

        let mut cursor = self
            .graph
            .execute(
                query(&cypher)
                    .param("vector_index", VECTOR_INDEX)
                    .param("keyword_index", KEYWORD_INDEX)
                    .param("k", self.top_k as i64)
                    .param("embedding", embedding)
                    .param("query", keyword_query),
            )
            .await
            .map_err(StoreUnavailableError::vector)?;

        let mut chunks = Vec::new();
        while let Some(row) = cursor.next().await.map_err(StoreUnavailableError::vector)? {
            if let (Some(text), Some(score)) = (row.get::<String>("text"), row.get::<f64>("score")) {
                chunks.push(RetrievedChunk {
                    text,
                    rank: chunks.len(),
                    score,
                });
            }
        }

        debug!("Búsqueda híbrida: {} fragmentos", chunks.len());
        Ok(chunks)
    }
}
