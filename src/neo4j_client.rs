use crate::config::AppConfig;
use anyhow::Result;
use neo4rs::{query, Graph};
use tracing::info;
use url::Url;

/// Etiqueta base común a todas las entidades extraídas.
pub const BASE_ENTITY_LABEL: &str = "__Entity__";
/// Índice full-text sobre `__Entity__(id)` usado por la recuperación estructurada.
pub const ENTITY_FULLTEXT_INDEX: &str = "entity";
/// Relación reservada de procedencia (:Document)-[:MENTIONS]->(entidad).
pub const MENTIONS_RELATION: &str = "MENTIONS";

pub async fn connect_from_config(cfg: &AppConfig) -> Result<Graph> {
    let url = Url::parse(&cfg.neo4j_uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.neo4j_user, &cfg.neo4j_password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea constraints e índices full-text para :Document y :__Entity__.
pub async fn ensure_schema(graph: &Graph) -> Result<()> {
    let statements = [
        // Document.id único (ventanas de ingesta)
        "CREATE CONSTRAINT document_id IF NOT EXISTS
         FOR (d:Document)
         REQUIRE d.id IS UNIQUE",
        // __Entity__.id único
        "CREATE CONSTRAINT entity_id IF NOT EXISTS
         FOR (e:__Entity__)
         REQUIRE e.id IS UNIQUE",
        // Búsqueda difusa de entidades por nombre
        "CREATE FULLTEXT INDEX entity IF NOT EXISTS
         FOR (e:__Entity__)
         ON EACH [e.id]",
        // Parte léxica de la búsqueda híbrida
        "CREATE FULLTEXT INDEX keyword IF NOT EXISTS
         FOR (d:Document)
         ON EACH [d.text]",
    ];

    for stmt in statements {
        graph.run(query(stmt)).await?;
    }

    info!("Esquema de Neo4j asegurado (constraints e índices full-text).");
    Ok(())
}
