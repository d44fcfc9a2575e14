// Módulos de la aplicación
mod api;
mod app_state;
mod chat;
mod config;
mod context;
mod conversation;
mod error;
mod fulltext;
mod graph_store;
mod ingest;
mod llm;
mod models;
mod neo4j_client;
mod retrieval;
mod settings;
mod vector_store;

#[cfg(test)]
mod testing;

use crate::app_state::{AppState, Status};
use axum::Router;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().expect("Error al cargar la configuración");

    // 3. Conectar a Neo4j y asegurar esquemas
    let graph = Arc::new(
        neo4j_client::connect_from_config(&cfg)
            .await
            .expect("Error conectando a Neo4j"),
    );
    neo4j_client::ensure_schema(&graph)
        .await
        .expect("Error asegurando el esquema de Neo4j");

    // 4. Modelos y almacenes
    let llm_manager = llm::LlmManager::from_config(&cfg);
    let vector_index = Arc::new(vector_store::Neo4jVectorIndex::new(graph.clone(), llm_manager.clone()));
    vector_index
        .ensure_index()
        .await
        .expect("Error asegurando el índice vectorial");
    match vector_index.refresh_embeddings().await {
        Ok(0) => {}
        Ok(n) => info!("{n} documentos sin embedding actualizados."),
        Err(e) => warn!("No se pudieron calcular los embeddings pendientes: {e}"),
    }

    let llm: Arc<dyn llm::LanguageModel> = Arc::new(llm_manager);
    let graph_store: Arc<dyn graph_store::GraphStore> =
        Arc::new(graph_store::Neo4jGraphStore::new(graph.clone()));

    // 5. Servicios de conversación e ingesta
    let settings = Arc::new(settings::ConfigProvider::new(cfg.settings_path.clone()));
    let retriever = retrieval::Retriever::new(
        llm.clone(),
        graph_store.clone(),
        vector_index.clone(),
        cfg.store_failure_policy,
    );
    let chat = chat::ChatService::new(
        Arc::new(Mutex::new(conversation::Session::new())),
        settings.clone(),
        retriever,
        llm.clone(),
    );
    let splitter = ingest::TokenWindowSplitter::standard().expect("Error cargando el tokenizador");
    let ingestion = Arc::new(ingest::IngestionPipeline::new(llm, graph_store, splitter));

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 6. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        graph,
        chat,
        settings,
        ingestion,
        vector_index,
        status: Arc::new(Mutex::new(Status {
            is_busy: false,
            message: "Servidor listo.".to_string(),
            progress: 0.0,
        })),
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 7. Configurar el router de la API y el servicio de ficheros estáticos
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .fallback_service(ServeDir::new("frontend"))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 8. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .expect("No se pudo abrir el puerto del servidor");
    let server_url = format!("http://{}", server_addr);
    info!("🚀 Servidor escuchando en {}", &server_url);

    // Abrir el frontend en el navegador por defecto
    if webbrowser::open(&server_url).is_err() {
        info!("No se pudo abrir el navegador. Por favor, accede a {} manualmente.", server_url);
    }

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .expect("Error en el servidor HTTP");

    info!("✅ Servidor cerrado correctamente.");
}
