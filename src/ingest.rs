//! Ingesta de texto libre en el grafo: ventanas de tokens solapadas,
//! extracción de nodos/relaciones por ventana y commit del lote completo con
//! la ventana de origen como (:Document) para la procedencia.

use std::sync::{Arc, Mutex};

use anyhow::ensure;
use chrono::Utc;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    app_state::Status,
    error::IngestionError,
    graph_store::{CommitOptions, GraphStore},
    llm::LanguageModel,
    models::{GraphDocument, SourceDocument},
    settings::GenerationConfig,
};

pub const WINDOW_TOKENS: usize = 512;
pub const OVERLAP_TOKENS: usize = 125;

/// Resumen de una llamada de ingesta.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestionSummary {
    pub batch_id: String,
    pub windows: usize,
    pub nodes: usize,
    pub relationships: usize,
}

impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} ventanas procesadas, {} nodos y {} relaciones extraídas.",
            self.windows, self.nodes, self.relationships
        )
    }
}

/// Fragmento del texto de entrada que cubre los tokens `[start_token, end_token)`
/// y los bytes `[start_byte, end_byte)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TextWindow<'a> {
    pub text: &'a str,
    pub start_token: usize,
    pub end_token: usize,
    pub start_byte: usize,
    pub end_byte: usize,
}

/// Ventanas de tokens BPE (`cl100k_base`) con solape fijo en tokens.
/// Los cortes se ajustan a límites de carácter, así que cada ventana es una
/// subcadena exacta de la entrada.
#[derive(Clone)]
pub struct TokenWindowSplitter {
    bpe: Arc<CoreBPE>,
    window: usize,
    overlap: usize,
}

impl TokenWindowSplitter {
    pub fn new(window: usize, overlap: usize) -> anyhow::Result<Self> {
        ensure!(window > 0 && overlap < window, "solape {overlap} inválido para ventana {window}");
        Ok(Self {
            bpe: Arc::new(cl100k_base()?),
            window,
            overlap,
        })
    }

    /// Ventana de 512 tokens con 125 de solape.
    pub fn standard() -> anyhow::Result<Self> {
        Self::new(WINDOW_TOKENS, OVERLAP_TOKENS)
    }

    pub fn split<'a>(&self, text: &'a str) -> Vec<TextWindow<'a>> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let tokens = self.bpe.encode_ordinary(text);
        let total = tokens.len();

        // offsets[i]: byte donde empieza el token i, si cae en límite de carácter.
        let mut offsets = vec![None; total + 1];
        offsets[0] = Some(0);
        let (mut anchor, mut anchor_byte) = (0, 0);
        for i in 1..=total {
            if let Ok(piece) = self.bpe.decode(tokens[anchor..i].to_vec()) {
                anchor_byte += piece.len();
                anchor = i;
                offsets[i] = Some(anchor_byte);
            }
        }
        let byte_at = |token: usize| {
            (token..=total)
                .find_map(|t| offsets[t])
                .unwrap_or(text.len())
        };

        let step = self.window - self.overlap;
        let mut windows = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + self.window).min(total);
            let (start_byte, end_byte) = (byte_at(start), byte_at(end));
            windows.push(TextWindow {
                text: &text[start_byte..end_byte],
                start_token: start,
                end_token: end,
                start_byte,
                end_byte,
            });
            if end == total {
                break;
            }
            start += step;
        }
        windows
    }
}

pub struct IngestionPipeline {
    llm: Arc<dyn LanguageModel>,
    graph: Arc<dyn GraphStore>,
    splitter: TokenWindowSplitter,
}

impl IngestionPipeline {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        graph: Arc<dyn GraphStore>,
        splitter: TokenWindowSplitter,
    ) -> Self {
        Self { llm, graph, splitter }
    }

    /// Extrae el grafo de cada ventana y lo persiste en un único commit.
    /// Un fallo en cualquier ventana aborta la llamada; no es atómica frente
    /// a escrituras previas en el almacén.
    pub async fn ingest_text(
        &self,
        text: &str,
        config: &GenerationConfig,
        status_arc: &Mutex<Status>,
    ) -> Result<IngestionSummary, IngestionError> {
        let windows = self.splitter.split(text);
        let batch_id = Uuid::new_v4().to_string();
        let ingested_at = Utc::now().to_rfc3339();
        let mut summary = IngestionSummary {
            batch_id: batch_id.clone(),
            ..Default::default()
        };

        if windows.is_empty() {
            info!("Texto vacío; nada que ingerir.");
            return Ok(summary);
        }

        let total = windows.len();
        let mut documents = Vec::with_capacity(total);
        for (index, window) in windows.iter().enumerate() {
            {
                let mut status = status_arc.lock().unwrap();
                status.message = format!("[{}/{}] Extrayendo grafo de la ventana...", index + 1, total);
                status.progress = index as f32 / total as f32;
            }

            let extracted = self
                .llm
                .extract_graph(window.text, config)
                .await
                .map_err(|source| {
                    error!("Extracción fallida en la ventana {index}: {source}");
                    IngestionError::Extraction { window: index, source }
                })?;

            summary.nodes += extracted.nodes.len();
            summary.relationships += extracted.relationships.len();
            documents.push(GraphDocument {
                nodes: extracted.nodes,
                relationships: extracted.relationships,
                source: SourceDocument {
                    id: Uuid::new_v4().to_string(),
                    text: window.text.to_string(),
                    window: index,
                    batch_id: batch_id.clone(),
                    ingested_at: ingested_at.clone(),
                },
            });
        }
        summary.windows = documents.len();

        {
            let mut status = status_arc.lock().unwrap();
            status.message = "Guardando grafo en Neo4j...".to_string();
            status.progress = 1.0;
        }
        self.graph
            .add_graph_documents(&documents, CommitOptions::default())
            .await?;

        info!("Lote {batch_id} ingerido. {summary}");
        Ok(summary)
    }
}
