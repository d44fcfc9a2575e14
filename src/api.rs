use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{delete, get, post},
    Router,
};
use futures::stream::{self, Stream};
use neo4rs::query;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Mutex;
use tokio::spawn;
use tracing::{error, info, warn};
use url::Url;

use crate::{
    app_state::{AppState, Status},
    chat::AnswerReceiver,
    conversation::SessionSnapshot,
    error::{ConfigWriteError, ConversationError},
    settings::{ChatModel, ConfigForm},
};

type ApiError = (StatusCode, Json<serde_json::Value>);

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct AskPayload {
    question: String,
}

#[derive(Deserialize)]
pub struct ThreadPayload {
    name: String,
}

#[derive(Deserialize)]
pub struct DocumentPayload {
    text: String,
}

#[derive(Serialize)]
pub struct ConfigResponse {
    config: ConfigForm,
    models: Vec<&'static str>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/ask", post(ask_handler))
        .route("/api/cancel", post(cancel_handler))
        .route("/api/session", get(session_handler))
        .route("/api/session/events", get(session_events_handler))
        .route("/api/threads", post(create_thread_handler))
        .route("/api/threads/select", post(select_thread_handler))
        .route("/api/threads/:name", delete(delete_thread_handler))
        .route("/api/config", get(get_config_handler).put(put_config_handler))
        .route("/api/documents", post(ingest_handler))
        .route("/api/status", get(status_handler))
        .route("/api/neo4j-info", get(neo4j_info_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

fn conversation_error(err: ConversationError) -> ApiError {
    let status = match err {
        ConversationError::Busy(_) | ConversationError::DuplicateThread(_) => StatusCode::CONFLICT,
        ConversationError::UnknownThread(_) => StatusCode::NOT_FOUND,
        ConversationError::EmptyThreadName => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

fn answer_stream(receiver: AnswerReceiver) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream::unfold(receiver, |mut receiver| async move {
        let event = receiver.recv().await?;
        Some((Event::default().json_data(&event), receiver))
    })
}

// --- Handlers de conversación ---

/// Abre la pregunta en el hilo actual y devuelve la respuesta como SSE.
#[axum::debug_handler]
async fn ask_handler(
    State(state): State<AppState>,
    Json(payload): Json<AskPayload>,
) -> Result<axum::response::Response, ApiError> {
    match state.chat.ask(&payload.question).map_err(conversation_error)? {
        Some(receiver) => Ok(Sse::new(answer_stream(receiver))
            .keep_alive(KeepAlive::default())
            .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[axum::debug_handler]
async fn cancel_handler(State(state): State<AppState>) -> StatusCode {
    let current = state.chat.session().lock().unwrap().current().to_string();
    if state.chat.cancel(&current) {
        StatusCode::OK
    } else {
        StatusCode::NO_CONTENT
    }
}

#[axum::debug_handler]
async fn session_handler(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.chat.session().lock().unwrap().snapshot())
}

/// Publica una instantánea completa de la sesión tras cada cambio.
#[axum::debug_handler]
async fn session_events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let receiver = state.chat.session().lock().unwrap().subscribe();
    let snapshots = stream::unfold(receiver, |mut receiver| async move {
        receiver.changed().await.ok()?;
        let snapshot = receiver.borrow_and_update().clone();
        Some((Event::default().json_data(&snapshot), receiver))
    });
    Sse::new(snapshots).keep_alive(KeepAlive::default())
}

#[axum::debug_handler]
async fn create_thread_handler(
    State(state): State<AppState>,
    Json(payload): Json<ThreadPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let mut session = state.chat.session().lock().unwrap();
    session.create_thread(&payload.name).map_err(conversation_error)?;
    Ok((StatusCode::CREATED, Json(session.snapshot())))
}

#[axum::debug_handler]
async fn delete_thread_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let mut session = state.chat.session().lock().unwrap();
    session.delete_thread(&name).map_err(conversation_error)?;
    Ok(Json(session.snapshot()))
}

#[axum::debug_handler]
async fn select_thread_handler(
    State(state): State<AppState>,
    Json(payload): Json<ThreadPayload>,
) -> Json<SessionSnapshot> {
    let mut session = state.chat.session().lock().unwrap();
    session.select_thread(&payload.name);
    Json(session.snapshot())
}

// --- Handlers de configuración ---

#[axum::debug_handler]
async fn get_config_handler(State(state): State<AppState>) -> Json<ConfigResponse> {
    let config = state.settings.read();
    Json(ConfigResponse {
        config: ConfigForm::from(&config),
        models: ChatModel::ALL.iter().map(ChatModel::as_str).collect(),
    })
}

#[axum::debug_handler]
async fn put_config_handler(
    State(state): State<AppState>,
    Json(form): Json<ConfigForm>,
) -> Result<Json<ConfigForm>, ApiError> {
    let config = form.into_config(state.config.seed_policy).map_err(|e| {
        warn!("Configuración rechazada: {e}");
        (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "error": e.to_string() })))
    })?;

    match state.settings.write(&config) {
        Ok(()) => Ok(Json(ConfigForm::from(&config))),
        Err(ConfigWriteError::Validation(e)) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": e.to_string() })),
        )),
        Err(e) => {
            error!("Error guardando la configuración: {e}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            ))
        }
    }
}

// --- Ingesta ---

/// Marca la ingesta como ocupada. Un texto en blanco no toca el estado.
fn begin_ingestion(status: &Mutex<Status>, text: &str) -> Result<bool, ApiError> {
    if text.trim().is_empty() {
        return Ok(false);
    }
    let mut status = status.lock().unwrap();
    if status.is_busy {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({"error": "Ya hay una ingesta en curso."})),
        ));
    }
    status.is_busy = true;
    status.message = "Iniciando ingesta...".to_string();
    status.progress = 0.0;
    Ok(true)
}

#[axum::debug_handler]
async fn ingest_handler(
    State(state): State<AppState>,
    Json(payload): Json<DocumentPayload>,
) -> Result<impl IntoResponse, ApiError> {
    if !begin_ingestion(&state.status, &payload.text)? {
        return Ok(StatusCode::NO_CONTENT);
    }

    spawn(async move {
        let config = state.settings.read();
        let result = state
            .ingestion
            .ingest_text(&payload.text, &config, &state.status)
            .await;

        let message = match result {
            Ok(summary) => {
                // Los nuevos (:Document) necesitan embedding para la búsqueda vectorial.
                if let Err(e) = state.vector_index.refresh_embeddings().await {
                    warn!("No se pudieron calcular los embeddings: {e}");
                }
                format!("¡Ingesta completada! {}", summary)
            }
            Err(err) => {
                error!("Error de ingesta: {}", err);
                format!("Error en la ingesta: {}", err)
            }
        };

        let mut status = state.status.lock().unwrap();
        status.is_busy = false;
        status.progress = 0.0;
        status.message = message;
    });

    Ok(StatusCode::ACCEPTED)
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(state.status.lock().unwrap().clone())
}

#[axum::debug_handler]
async fn neo4j_info_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let browser_url = browser_url(&state.config.neo4j_uri);

    match state.graph.run(query("RETURN 1")).await {
        Ok(_) => Ok(Json(json!({ "status": "ok", "browser_url": browser_url }))),
        Err(e) => {
            error!("Error en el health check de Neo4j: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// URL de Neo4j Browser derivada del URI bolt.
fn browser_url(neo4j_uri: &str) -> String {
    // `bolt` no es un esquema especial: no se puede cambiar a `http` con set_scheme.
    match Url::parse(neo4j_uri).ok().as_ref().and_then(Url::host_str) {
        Some(host) => format!("http://{host}:7474"),
        None => "http://localhost:7474".to_string(),
    }
}

// --- Handler de Apagado ---

#[axum::debug_handler]
async fn shutdown_handler(
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = state.shutdown_sender.lock().unwrap().take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_url_points_at_http_console() {
        assert_eq!(browser_url("bolt://db.local:7687"), "http://db.local:7474");
    }

    #[test]
    fn browser_url_falls_back_to_localhost() {
        assert_eq!(browser_url("no es una url"), "http://localhost:7474");
    }

    #[test]
    fn busy_thread_maps_to_conflict() {
        let (status, _) = conversation_error(ConversationError::Busy("Intros".into()));
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = conversation_error(ConversationError::UnknownThread("x".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn blank_document_leaves_status_untouched() {
        let status = Mutex::new(Status {
            is_busy: false,
            message: "Servidor listo.".into(),
            progress: 0.0,
        });

        assert!(!begin_ingestion(&status, " \n\t").unwrap());

        let status = status.lock().unwrap();
        assert!(!status.is_busy);
        assert_eq!(status.message, "Servidor listo.");
    }

    #[test]
    fn document_ingestion_marks_busy_once() {
        let status = Mutex::new(Status::default());

        assert!(begin_ingestion(&status, "Jon Snow vive en el Muro.").unwrap());
        assert!(status.lock().unwrap().is_busy);

        let (code, _) = begin_ingestion(&status, "Arya Stark").unwrap_err();
        assert_eq!(code, StatusCode::CONFLICT);
    }
}
