//! Recuperación híbrida:
//!   1. Extracción de entidades de la pregunta (salida estructurada del LLM).
//!   2. Vecindario en el grafo de cada entidad vía consulta full-text difusa.
//!   3. Búsqueda por similitud en el índice vectorial, en paralelo con 1-2.
//!
//! Los errores de extracción se degradan a "sin entidades"; la caída de un
//! almacén se degrada o aborta según `StoreFailurePolicy`.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::StoreFailurePolicy;
use crate::error::{RetrievalError, StoreUnavailableError};
use crate::fulltext::generate_full_text_query;
use crate::graph_store::GraphStore;
use crate::llm::LanguageModel;
use crate::settings::GenerationConfig;
use crate::vector_store::VectorStore;

/// Nodos máximos devueltos por la búsqueda full-text de cada entidad.
pub const ENTITY_NODE_LIMIT: usize = 20;
/// Líneas máximas de vecindario por entidad.
pub const NEIGHBORHOOD_LINE_LIMIT: usize = 1000;

/// Resultado de ambas fuentes, listo para componer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievedContext {
    pub structured: String,
    pub unstructured: Vec<String>,
}

/// Elimina duplicados exactos conservando el orden de primera aparición.
pub fn dedupe_entities(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

#[derive(Clone)]
pub struct Retriever {
    llm: Arc<dyn LanguageModel>,
    graph: Arc<dyn GraphStore>,
    vector: Arc<dyn VectorStore>,
    policy: StoreFailurePolicy,
}

impl Retriever {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        graph: Arc<dyn GraphStore>,
        vector: Arc<dyn VectorStore>,
        policy: StoreFailurePolicy,
    ) -> Self {
        Self { llm, graph, vector, policy }
    }

    /// Entidades de la pregunta; vacío si la extracción falla.
    pub async fn entities(&self, question: &str, config: &GenerationConfig) -> Vec<String> {
        match self.llm.extract_entities(question, config).await {
            Ok(names) => dedupe_entities(names),
            Err(e) => {
                warn!("Extracción de entidades fallida, se continúa sin grafo: {e}");
                Vec::new()
            }
        }
    }

    /// Vecindario de todas las entidades, en orden de extracción, una relación por línea.
    pub async fn structured(
        &self,
        question: &str,
        config: &GenerationConfig,
    ) -> Result<String, StoreUnavailableError> {
        let mut lines = Vec::new();
        for entity in self.entities(question, config).await {
            let Some(fulltext_query) = generate_full_text_query(&entity) else {
                debug!("Entidad '{entity}' sin palabras consultables; se omite.");
                continue;
            };
            let triples = self
                .graph
                .neighborhood(&fulltext_query, ENTITY_NODE_LIMIT, NEIGHBORHOOD_LINE_LIMIT)
                .await?;
            lines.extend(triples.iter().map(ToString::to_string));
        }
        Ok(lines.join("\n"))
    }

    pub async fn unstructured(&self, question: &str) -> Result<Vec<String>, StoreUnavailableError> {
        let chunks = self.vector.similarity_search(question).await?;
        Ok(chunks.into_iter().map(|chunk| chunk.text).collect())
    }

    /// Ejecuta ambas fuentes en paralelo y aplica la política de fallo.
    pub async fn retrieve(
        &self,
        question: &str,
        config: &GenerationConfig,
    ) -> Result<RetrievedContext, RetrievalError> {
        let (structured, unstructured) =
            tokio::join!(self.structured(question, config), self.unstructured(question));

        Ok(RetrievedContext {
            structured: self.absorb(structured)?,
            unstructured: self.absorb(unstructured)?,
        })
    }

    fn absorb<T: Default>(&self, result: Result<T, StoreUnavailableError>) -> Result<T, RetrievalError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if self.policy == StoreFailurePolicy::Degrade => {
                warn!("{e}; se continúa con la otra fuente.");
                Ok(T::default())
            }
            Err(e) => Err(RetrievalError(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GraphTriple;
    use crate::testing::{FakeGraphStore, FakeLanguageModel, FakeVectorStore};

    fn triple(s: &str, r: &str, t: &str) -> GraphTriple {
        GraphTriple {
            source: s.into(),
            relation: r.into(),
            target: t.into(),
        }
    }

    fn retriever(
        llm: FakeLanguageModel,
        graph: FakeGraphStore,
        vector: FakeVectorStore,
        policy: StoreFailurePolicy,
    ) -> (Retriever, Arc<FakeGraphStore>) {
        let graph = Arc::new(graph);
        let retriever = Retriever::new(Arc::new(llm), graph.clone(), Arc::new(vector), policy);
        (retriever, graph)
    }

    #[test]
    fn dedupe_keeps_first_occurrence_and_case() {
        let names = vec!["Jon".into(), "Arya".into(), "Jon".into(), "jon".into()];
        assert_eq!(dedupe_entities(names), vec!["Jon", "Arya", "jon"]);
    }

    #[tokio::test]
    async fn structured_output_follows_entity_order() {
        let graph = FakeGraphStore::default()
            .with_triples("Jon~2 AND Snow~2", vec![triple("Jon Snow", "MEMBER_OF", "Night's Watch")])
            .with_triples("Arya~2", vec![
                triple("Arya", "SIBLING_OF", "Jon Snow"),
                triple("Needle", "OWNED_BY", "Arya"),
            ]);
        let llm = FakeLanguageModel::default().with_entities(vec!["Jon Snow", "Arya", "Jon Snow"]);
        let (retriever, graph) =
            retriever(llm, graph, FakeVectorStore::default(), StoreFailurePolicy::Degrade);

        let structured = retriever
            .structured("¿Quién es Jon Snow?", &GenerationConfig::default())
            .await
            .unwrap();

        assert_eq!(
            structured,
            "Jon Snow - MEMBER_OF -> Night's Watch\nArya - SIBLING_OF -> Jon Snow\nNeedle - OWNED_BY -> Arya"
        );
        assert_eq!(graph.queries(), vec!["Jon~2 AND Snow~2", "Arya~2"]);
    }

    #[tokio::test]
    async fn extraction_failure_degrades_to_vector_only() {
        let llm = FakeLanguageModel::default().with_entity_error("respuesta no es JSON");
        let vector = FakeVectorStore::with_chunks(vec!["fragmento"]);
        let (retriever, graph) =
            retriever(llm, FakeGraphStore::default(), vector, StoreFailurePolicy::Abort);

        let context = retriever
            .retrieve("pregunta", &GenerationConfig::default())
            .await
            .unwrap();

        assert_eq!(context.structured, "");
        assert_eq!(context.unstructured, vec!["fragmento"]);
        assert!(graph.queries().is_empty());
    }

    #[tokio::test]
    async fn graph_outage_degrades_under_degrade_policy() {
        let llm = FakeLanguageModel::default().with_entities(vec!["Acme"]);
        let vector = FakeVectorStore::with_chunks(vec!["a", "b"]);
        let (retriever, _) =
            retriever(llm, FakeGraphStore::unavailable(), vector, StoreFailurePolicy::Degrade);

        let context = retriever.retrieve("Acme?", &GenerationConfig::default()).await;
        tokio_test::assert_ok!(&context);
        assert_eq!(context.unwrap().unstructured, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn vector_outage_aborts_under_abort_policy() {
        let llm = FakeLanguageModel::default().with_entities(vec!["Acme"]);
        let (retriever, _) = retriever(
            llm,
            FakeGraphStore::default(),
            FakeVectorStore::unavailable(),
            StoreFailurePolicy::Abort,
        );

        let result = retriever.retrieve("Acme?", &GenerationConfig::default()).await;
        tokio_test::assert_err!(&result);
    }

    #[tokio::test]
    async fn unqueryable_entities_are_skipped() {
        let llm = FakeLanguageModel::default().with_entities(vec!["???", "Acme"]);
        let (retriever, graph) = retriever(
            llm,
            FakeGraphStore::default(),
            FakeVectorStore::default(),
            StoreFailurePolicy::Degrade,
        );

        retriever.structured("q", &GenerationConfig::default()).await.unwrap();
        assert_eq!(graph.queries(), vec!["Acme~2"]);
    }
}
