//! Errores tipados del dominio (extracción, almacenes, transporte, config, ingesta).
//!
//! Los errores locales de un componente (extracción, caída de un solo almacén)
//! se absorben en la capa de recuperación; los de transporte e ingesta se
//! propagan al llamador.

use thiserror::Error;

/// Salida estructurada del modelo mal formada o llamada de extracción fallida.
#[derive(Debug, Error)]
#[error("extracción estructurada fallida: {0}")]
pub struct ExtractionError(pub String);

/// Almacén de grafo o vectorial inalcanzable (o consulta rechazada).
#[derive(Debug, Error)]
#[error("almacén {store} no disponible: {reason}")]
pub struct StoreUnavailableError {
    pub store: &'static str,
    pub reason: String,
}

impl StoreUnavailableError {
    pub fn graph(reason: impl ToString) -> Self {
        Self { store: "graph", reason: reason.to_string() }
    }

    pub fn vector(reason: impl ToString) -> Self {
        Self { store: "vector", reason: reason.to_string() }
    }
}

/// Fallo del proveedor LLM al abrir o durante el stream de respuesta.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no se pudo abrir el stream del modelo: {0}")]
    Open(String),
    #[error("stream del modelo interrumpido: {0}")]
    Interrupted(String),
}

/// Configuración de generación inválida; bloquea el guardado, nunca la lectura.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigValidationError {
    #[error("el contenido del sistema no puede estar vacío")]
    EmptyContent,
    #[error("el contenido debe tener menos de {max} caracteres (tiene {len})")]
    ContentTooLong { len: usize, max: usize },
    #[error("'{0}' no es un modelo válido")]
    UnknownModel(String),
    #[error("{field} debe estar entre {min} y {max} (recibido {value})")]
    OutOfBounds {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("semilla inválida: '{0}'")]
    InvalidSeed(String),
}

/// Error al persistir la configuración de generación.
#[derive(Debug, Error)]
pub enum ConfigWriteError {
    #[error(transparent)]
    Validation(#[from] ConfigValidationError),
    #[error("no se pudo escribir el fichero de configuración: {0}")]
    Io(#[from] std::io::Error),
    #[error("no se pudo serializar la configuración: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Falla la llamada de ingesta completa; el almacén puede contener ventanas previas.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("extracción de grafo fallida en la ventana {window}: {source}")]
    Extraction {
        window: usize,
        #[source]
        source: ExtractionError,
    },
    #[error(transparent)]
    Store(#[from] StoreUnavailableError),
}

/// Sólo se produce con la política de fallo de almacén `abort`.
#[derive(Debug, Error)]
#[error("recuperación abortada: {0}")]
pub struct RetrievalError(#[from] pub StoreUnavailableError);

#[derive(Debug, Error, PartialEq)]
pub enum ConversationError {
    #[error("el hilo '{0}' ya está procesando una pregunta")]
    Busy(String),
    #[error("el hilo '{0}' no existe")]
    UnknownThread(String),
    #[error("ya existe un hilo llamado '{0}'")]
    DuplicateThread(String),
    #[error("el nombre del hilo no puede estar vacío")]
    EmptyThreadName,
}
