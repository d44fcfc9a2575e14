use std::sync::{Arc, Mutex};
use neo4rs::Graph;
use tokio::sync::oneshot;
use crate::{
    chat::ChatService, config::AppConfig, ingest::IngestionPipeline, settings::ConfigProvider,
    vector_store::Neo4jVectorIndex,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub graph: Arc<Graph>,
    pub chat: ChatService,
    pub settings: Arc<ConfigProvider>,
    pub ingestion: Arc<IngestionPipeline>,
    pub vector_index: Arc<Neo4jVectorIndex>,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

/// Estado de la ingesta en segundo plano, consultado por el frontend.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
}
