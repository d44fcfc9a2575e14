//! Abstracción sobre Rig para trabajar con distintos proveedores de LLM.
//! De momento se implementa OpenAI; Gemini/Ollama quedan preparados para el futuro.
//!
//! El resto del crate sólo conoce el trait `LanguageModel`: extracción
//! estructurada (entidades y grafo) y chat en streaming.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::{AppConfig, LlmProvider};
use crate::error::{ExtractionError, TransportError};
use crate::models::{GraphNode, GraphRelationship};
use crate::settings::GenerationConfig;

const ENTITY_PREAMBLE: &str = "You are extracting organization and person entities from the text.";

const GRAPH_PREAMBLE: &str = r#"
You are a top-tier algorithm designed for extracting information in structured formats to build a knowledge graph.
- Nodes represent entities and concepts. Use the most complete human-readable name of the entity as the node id.
- Node types must be basic, general labels such as 'Person', 'Organization', 'Location' or 'Concept'.
- Relationships connect two node ids. Use general, timeless relationship types in UPPER_SNAKE_CASE (e.g. 'WORKS_FOR', 'MEMBER_OF').
- Use the same id for an entity every time it is mentioned.
Only extract information explicitly present in the text. If nothing can be extracted, return empty lists.
"#;

/// Rol de un turno previo de la conversación.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Petición completa de generación: sistema+contexto, historial y pregunta nueva.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub history: Vec<ChatTurn>,
    pub question: String,
}

/// Secuencia perezosa de fragmentos de respuesta; termina al acabar el modelo.
pub type FragmentStream = BoxStream<'static, Result<String, TransportError>>;

/// Grafo extraído de una ventana de texto, antes de asociarle su documento.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedGraph {
    pub nodes: Vec<GraphNode>,
    pub relationships: Vec<GraphRelationship>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Nombres de personas/organizaciones presentes en la pregunta.
    async fn extract_entities(
        &self,
        question: &str,
        config: &GenerationConfig,
    ) -> Result<Vec<String>, ExtractionError>;

    /// Nodos y relaciones tipadas presentes en una ventana de texto.
    async fn extract_graph(
        &self,
        text: &str,
        config: &GenerationConfig,
    ) -> Result<ExtractedGraph, ExtractionError>;

    async fn stream_chat(
        &self,
        request: ChatRequest,
        config: &GenerationConfig,
    ) -> Result<FragmentStream, TransportError>;
}

// --- Esquemas de salida estructurada ---

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct Entities {
    /// All the person, organization, or business entities that appear in the text
    names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct ExtractedNode {
    id: String,
    #[serde(rename = "type")]
    node_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct ExtractedRelationship {
    source: String,
    target: String,
    #[serde(rename = "type")]
    rel_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct GraphExtraction {
    nodes: Vec<ExtractedNode>,
    relationships: Vec<ExtractedRelationship>,
}

impl From<GraphExtraction> for ExtractedGraph {
    fn from(extraction: GraphExtraction) -> Self {
        Self {
            nodes: extraction
                .nodes
                .into_iter()
                .map(|n| GraphNode { id: n.id, node_type: n.node_type })
                .collect(),
            relationships: extraction
                .relationships
                .into_iter()
                .map(|r| GraphRelationship {
                    source: r.source,
                    target: r.target,
                    rel_type: r.rel_type,
                })
                .collect(),
        }
    }
}

/// Parámetros de muestreo sin equivalente directo en el builder de Rig.
fn sampling_params(config: &GenerationConfig) -> Option<Value> {
    let mut params = Map::new();
    if let Some(seed) = config.seed {
        params.insert("seed".to_string(), json!(seed));
    }
    if let Some(top_p) = config.top_p {
        params.insert("top_p".to_string(), json!(top_p));
    }
    (!params.is_empty()).then_some(Value::Object(params))
}

/// Gestor de LLMs y embeddings.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub embedding_model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            provider: cfg.llm_provider.clone(),
            embedding_model: cfg.llm_embedding_model.clone(),
        }
    }

    fn unsupported(&self, what: &str) -> String {
        format!("Proveedor LLM {:?} aún no implementado para {what}", self.provider)
    }

    // ---------------------------------------------------------------------
    // EMBEDDINGS
    // ---------------------------------------------------------------------

    /// Calcula embeddings para una lista de textos, en el mismo orden.
    pub async fn embed_texts(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f64>>> {
        use rig::client::EmbeddingsClient as _;
        use rig::embeddings::EmbeddingModel as _;
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};

        if !matches!(self.provider, LlmProvider::OpenAI) {
            return Err(anyhow::anyhow!(self.unsupported("embeddings")));
        }

        let client = openai::Client::from_env();
        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };
        let embedding_model = client.embedding_model(model_name);

        let expected = texts.len();
        let embeddings = embedding_model.embed_texts(texts).await?;
        if embeddings.len() != expected {
            return Err(anyhow::anyhow!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                expected
            ));
        }

        Ok(embeddings.into_iter().map(|e| e.vec).collect())
    }
}

#[async_trait]
impl LanguageModel for LlmManager {
    async fn extract_entities(
        &self,
        question: &str,
        config: &GenerationConfig,
    ) -> Result<Vec<String>, ExtractionError> {
        use rig::client::CompletionClient as _;
        use rig::providers::openai;

        if !matches!(self.provider, LlmProvider::OpenAI) {
            return Err(ExtractionError(self.unsupported("extracción")));
        }

        let client = openai::Client::from_env();
        let extractor = client
            .extractor::<Entities>(config.model.as_str())
            .preamble(ENTITY_PREAMBLE)
            .build();

        let prompt = format!(
            "Use the given format to extract information from the following input: {question}"
        );
        let entities = extractor
            .extract(prompt)
            .await
            .map_err(|e| ExtractionError(e.to_string()))?;

        debug!("Entidades extraídas de la pregunta: {:?}", entities.names);
        Ok(entities.names)
    }

    async fn extract_graph(
        &self,
        text: &str,
        config: &GenerationConfig,
    ) -> Result<ExtractedGraph, ExtractionError> {
        use rig::client::CompletionClient as _;
        use rig::providers::openai;

        if !matches!(self.provider, LlmProvider::OpenAI) {
            return Err(ExtractionError(self.unsupported("extracción")));
        }

        let client = openai::Client::from_env();
        let extractor = client
            .extractor::<GraphExtraction>(config.model.as_str())
            .preamble(GRAPH_PREAMBLE)
            .build();

        let extraction = extractor
            .extract(text.to_string())
            .await
            .map_err(|e| ExtractionError(e.to_string()))?;

        Ok(extraction.into())
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        config: &GenerationConfig,
    ) -> Result<FragmentStream, TransportError> {
        use rig::agent::MultiTurnStreamItem;
        use rig::client::CompletionClient as _;
        use rig::completion::Message;
        use rig::providers::openai;
        use rig::streaming::{StreamedAssistantContent, StreamingChat as _};

        if !matches!(self.provider, LlmProvider::OpenAI) {
            return Err(TransportError::Open(self.unsupported("chat")));
        }

        let client = openai::Client::from_env();
        let mut builder = client
            .agent(config.model.as_str())
            .preamble(&request.system_prompt);
        if let Some(temperature) = config.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(params) = sampling_params(config) {
            builder = builder.additional_params(params);
        }
        let agent = builder.build();

        let history: Vec<Message> = request
            .history
            .into_iter()
            .map(|turn| match turn.role {
                Role::User => Message::user(turn.content),
                Role::Assistant => Message::assistant(turn.content),
            })
            .collect();

        let stream = agent.stream_chat(request.question, history).await;

        let fragments = stream.filter_map(|item| async move {
            match item {
                Ok(MultiTurnStreamItem::StreamItem(StreamedAssistantContent::Text(text))) => {
                    Some(Ok(text.text))
                }
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Interrupted(e.to_string()))),
            }
        });

        Ok(fragments.boxed())
    }
}
