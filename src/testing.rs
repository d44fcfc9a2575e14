//! Dobles en memoria de los colaboradores externos (LLM, grafo, vector).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::error::{ExtractionError, StoreUnavailableError, TransportError};
use crate::graph_store::{CommitOptions, GraphStore};
use crate::llm::{ChatRequest, ExtractedGraph, FragmentStream, LanguageModel};
use crate::models::{GraphDocument, GraphTriple, RetrievedChunk};
use crate::settings::GenerationConfig;
use crate::vector_store::VectorStore;

#[derive(Default)]
pub struct FakeLanguageModel {
    entities: Option<Result<Vec<String>, String>>,
    graphs: Mutex<VecDeque<Result<ExtractedGraph, String>>>,
    fragments: Vec<Result<String, String>>,
    requests: Mutex<Vec<ChatRequest>>,
    graph_calls: AtomicUsize,
}

impl FakeLanguageModel {
    pub fn with_entities(mut self, names: Vec<&str>) -> Self {
        self.entities = Some(Ok(names.into_iter().map(String::from).collect()));
        self
    }

    pub fn with_entity_error(mut self, reason: &str) -> Self {
        self.entities = Some(Err(reason.to_string()));
        self
    }

    pub fn with_graphs(self, graphs: Vec<Result<ExtractedGraph, String>>) -> Self {
        *self.graphs.lock().unwrap() = graphs.into();
        self
    }

    pub fn with_fragments(mut self, fragments: Vec<&str>) -> Self {
        self.fragments = fragments.into_iter().map(|f| Ok(f.to_string())).collect();
        self
    }

    /// Emite los fragmentos dados y después un error de transporte.
    pub fn with_interrupted_stream(mut self, fragments: Vec<&str>, reason: &str) -> Self {
        self.fragments = fragments.into_iter().map(|f| Ok(f.to_string())).collect();
        self.fragments.push(Err(reason.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn graph_calls(&self) -> usize {
        self.graph_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for FakeLanguageModel {
    async fn extract_entities(
        &self,
        _question: &str,
        _config: &GenerationConfig,
    ) -> Result<Vec<String>, ExtractionError> {
        match &self.entities {
            Some(Ok(names)) => Ok(names.clone()),
            Some(Err(reason)) => Err(ExtractionError(reason.clone())),
            None => Ok(Vec::new()),
        }
    }

    async fn extract_graph(
        &self,
        _text: &str,
        _config: &GenerationConfig,
    ) -> Result<ExtractedGraph, ExtractionError> {
        self.graph_calls.fetch_add(1, Ordering::SeqCst);
        match self.graphs.lock().unwrap().pop_front() {
            Some(Ok(graph)) => Ok(graph),
            Some(Err(reason)) => Err(ExtractionError(reason)),
            None => Ok(ExtractedGraph::default()),
        }
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        _config: &GenerationConfig,
    ) -> Result<FragmentStream, TransportError> {
        self.requests.lock().unwrap().push(request);
        let items: Vec<Result<String, TransportError>> = self
            .fragments
            .iter()
            .map(|item| item.clone().map_err(TransportError::Interrupted))
            .collect();
        Ok(stream::iter(items).boxed())
    }
}

#[derive(Default)]
pub struct FakeGraphStore {
    triples: HashMap<String, Vec<GraphTriple>>,
    unavailable: bool,
    queries: Mutex<Vec<String>>,
    commits: Mutex<Vec<(Vec<GraphDocument>, CommitOptions)>>,
}

impl FakeGraphStore {
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Default::default()
        }
    }

    pub fn with_triples(mut self, query: &str, triples: Vec<GraphTriple>) -> Self {
        self.triples.insert(query.to_string(), triples);
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    pub fn commits(&self) -> Vec<(Vec<GraphDocument>, CommitOptions)> {
        self.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl GraphStore for FakeGraphStore {
    async fn neighborhood(
        &self,
        fulltext_query: &str,
        _node_limit: usize,
        line_limit: usize,
    ) -> Result<Vec<GraphTriple>, StoreUnavailableError> {
        if self.unavailable {
            return Err(StoreUnavailableError::graph("connection refused"));
        }
        self.queries.lock().unwrap().push(fulltext_query.to_string());
        let mut triples = self.triples.get(fulltext_query).cloned().unwrap_or_default();
        triples.truncate(line_limit);
        Ok(triples)
    }

    async fn add_graph_documents(
        &self,
        documents: &[GraphDocument],
        options: CommitOptions,
    ) -> Result<(), StoreUnavailableError> {
        if self.unavailable {
            return Err(StoreUnavailableError::graph("connection refused"));
        }
        self.commits.lock().unwrap().push((documents.to_vec(), options));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeVectorStore {
    chunks: Vec<String>,
    unavailable: bool,
    calls: AtomicUsize,
}

impl FakeVectorStore {
    pub fn with_chunks(chunks: Vec<&str>) -> Self {
        Self {
            chunks: chunks.into_iter().map(String::from).collect(),
            ..Default::default()
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorStore for FakeVectorStore {
    async fn similarity_search(&self, _query: &str) -> Result<Vec<RetrievedChunk>, StoreUnavailableError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(StoreUnavailableError::vector("index offline"));
        }
        Ok(self
            .chunks
            .iter()
            .enumerate()
            .map(|(rank, text)| RetrievedChunk {
                text: text.clone(),
                rank,
                score: 1.0 / (rank + 1) as f64,
            })
            .collect())
    }
}
