//! Almacén de grafo: búsqueda full-text de entidades, vecindario a un salto y
//! commit por lotes de los documentos de grafo extraídos en la ingesta.

use std::sync::Arc;

use async_trait::async_trait;
use neo4rs::{query, Graph, Txn};
use tracing::{debug, info};

use crate::error::StoreUnavailableError;
use crate::models::{GraphDocument, GraphTriple};
use crate::neo4j_client::{BASE_ENTITY_LABEL, ENTITY_FULLTEXT_INDEX, MENTIONS_RELATION};

/// Opciones de persistencia de un lote de documentos de grafo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOptions {
    /// Añade la etiqueta `__Entity__` a cada nodo extraído.
    pub base_entity_label: bool,
    /// Persiste la ventana de origen como (:Document) enlazada con MENTIONS.
    pub include_source: bool,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            base_entity_label: true,
            include_source: true,
        }
    }
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Vecindario a un salto (ambas direcciones, sin MENTIONS) de los nodos
    /// que casan con la consulta full-text.
    async fn neighborhood(
        &self,
        fulltext_query: &str,
        node_limit: usize,
        line_limit: usize,
    ) -> Result<Vec<GraphTriple>, StoreUnavailableError>;

    async fn add_graph_documents(
        &self,
        documents: &[GraphDocument],
        options: CommitOptions,
    ) -> Result<(), StoreUnavailableError>;
}

pub struct Neo4jGraphStore {
    graph: Arc<Graph>,
}

impl Neo4jGraphStore {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn neighborhood(
        &self,
        fulltext_query: &str,
        node_limit: usize,
        line_limit: usize,
    ) -> Result<Vec<GraphTriple>, StoreUnavailableError> {
        let cypher = format!(
            "CALL db.index.fulltext.queryNodes('{ENTITY_FULLTEXT_INDEX}', $query, {{limit: $node_limit}})
             YIELD node, score
             CALL {{
               WITH node
               MATCH (node)-[r:!{MENTIONS_RELATION}]->(neighbor)
               RETURN node.id AS source, type(r) AS relation, neighbor.id AS target
               UNION ALL
               WITH node
               MATCH (node)<-[r:!{MENTIONS_RELATION}]-(neighbor)
               RETURN neighbor.id AS source, type(r) AS relation, node.id AS target
             }}
             RETURN source, relation, target LIMIT $line_limit"
        );

        let mut cursor = self
            .graph
            .execute(
                query(&cypher)
                    .param("query", fulltext_query)
                    .param("node_limit", node_limit as i64)
                    .param("line_limit", line_limit as i64),
            )
            .await
            .map_err(StoreUnavailableError::graph)?;

        let mut triples = Vec::new();
        while let Some(row) = cursor.next().await.map_err(StoreUnavailableError::graph)? {
            if let (Some(source), Some(relation), Some(target)) = (
                row.get::<String>("source"),
                row.get::<String>("relation"),
                row.get::<String>("target"),
            ) {
                triples.push(GraphTriple { source, relation, target });
            }
        }

        debug!("Consulta '{fulltext_query}': {} relaciones", triples.len());
        Ok(triples)
    }

    async fn add_graph_documents(
        &self,
        documents: &[GraphDocument],
        options: CommitOptions,
    ) -> Result<(), StoreUnavailableError> {
        let tx = self
            .graph
            .start_txn()
            .await
            .map_err(StoreUnavailableError::graph)?;

        for document in documents {
            write_document(&tx, document, options)
                .await
                .map_err(StoreUnavailableError::graph)?;
        }

        tx.commit().await.map_err(StoreUnavailableError::graph)?;
        info!("Lote de {} documentos de grafo persistido.", documents.len());
        Ok(())
    }
}

async fn write_document(
    tx: &Txn,
    document: &GraphDocument,
    options: CommitOptions,
) -> Result<(), neo4rs::Error> {
    let source = &document.source;

    // 1) Ventana de origen
    if options.include_source {
        tx.run(
            query(
                "MERGE (d:Document {id: $id})
                 SET d.text = $text, d.window = $window, d.batch_id = $batch_id,
                     d.ingested_at = datetime($ingested_at)",
            )
            .param("id", source.id.clone())
            .param("text", source.text.clone())
            .param("window", source.window as i64)
            .param("batch_id", source.batch_id.clone())
            .param("ingested_at", source.ingested_at.clone()),
        )
        .await?;
    }

    // 2) Nodos (+ MENTIONS desde el documento)
    for node in &document.nodes {
        let label = sanitize_identifier(&node.node_type, "Entity", false);
        let mut cypher = if options.base_entity_label {
            format!("MERGE (n:{BASE_ENTITY_LABEL} {{id: $id}}) SET n:`{label}`")
        } else {
            format!("MERGE (n:`{label}` {{id: $id}})")
        };
        if options.include_source {
            cypher.push_str(&format!(
                " WITH n MATCH (d:Document {{id: $doc_id}}) MERGE (d)-[:{MENTIONS_RELATION}]->(n)"
            ));
        }
        tx.run(
            query(&cypher)
                .param("id", node.id.clone())
                .param("doc_id", source.id.clone()),
        )
        .await?;
    }

    // 3) Relaciones tipadas y dirigidas
    for rel in &document.relationships {
        let rel_type = sanitize_identifier(&rel.rel_type, "RELATED_TO", true);
        let cypher = if options.base_entity_label {
            format!(
                "MERGE (s:{BASE_ENTITY_LABEL} {{id: $source}})
                 MERGE (t:{BASE_ENTITY_LABEL} {{id: $target}})
                 MERGE (s)-[:`{rel_type}`]->(t)"
            )
        } else {
            format!(
                "MATCH (s {{id: $source}}), (t {{id: $target}})
                 MERGE (s)-[:`{rel_type}`]->(t)"
            )
        };
        tx.run(
            query(&cypher)
                .param("source", rel.source.clone())
                .param("target", rel.target.clone()),
        )
        .await?;
    }

    Ok(())
}

/// Etiquetas y tipos se interpolan en Cypher: sólo alfanuméricos y '_'.
fn sanitize_identifier(raw: &str, fallback: &str, uppercase: bool) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() || c == '-' { '_' } else { c })
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if cleaned.is_empty() {
        return fallback.to_string();
    }
    if uppercase {
        cleaned.to_uppercase()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_cypher_breaking_characters() {
        assert_eq!(sanitize_identifier("Person`) DETACH DELETE n //", "Entity", false), "Person_DETACH_DELETE_n_");
        assert_eq!(sanitize_identifier("works for", "RELATED_TO", true), "WORKS_FOR");
        assert_eq!(sanitize_identifier("  ", "Entity", false), "Entity");
    }

    #[test]
    fn default_options_tag_and_link_sources() {
        let options = CommitOptions::default();
        assert!(options.base_entity_label);
        assert!(options.include_source);
    }
}
