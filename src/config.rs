//! Carga y gestión de configuración del proceso (Neo4j + LLM + políticas).
//!
//! Los parámetros de generación editables por el usuario viven aparte, en
//! `settings` (fichero JSON con caché explícita).

use std::env;
use std::path::PathBuf;
use anyhow::{anyhow, Result};

#[derive(Clone, Debug)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

/// Qué hacer cuando uno de los dos almacenes de recuperación no responde.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StoreFailurePolicy {
    /// Seguir con la fuente que sí respondió (sección vacía para la otra).
    #[default]
    Degrade,
    /// Abortar la pregunta con un `RetrievalError`.
    Abort,
}

impl StoreFailurePolicy {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "degrade" => Ok(Self::Degrade),
            "abort" => Ok(Self::Abort),
            other => Err(anyhow!("Política de fallo de almacén no soportada: {other}")),
        }
    }
}

/// Cómo interpretar una semilla introducida como texto no numérico.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SeedPolicy {
    /// Texto no numérico se convierte en 0.
    #[default]
    Coerce,
    /// Texto no numérico es un error de validación.
    Reject,
}

impl SeedPolicy {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "coerce" => Ok(Self::Coerce),
            "reject" => Ok(Self::Reject),
            other => Err(anyhow!("Política de semilla no soportada: {other}")),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub server_addr: String,

    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,

    pub settings_path: PathBuf,
    pub store_failure_policy: StoreFailurePolicy,
    pub seed_policy: SeedPolicy,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let neo4j_uri = env::var("NEO4J_URI")
            .map_err(|_| anyhow!("Falta NEO4J_URI en el entorno"))?;
        let neo4j_user = env::var("NEO4J_USER")
            .map_err(|_| anyhow!("Falta NEO4J_USER en el entorno"))?;
        let neo4j_password = env::var("NEO4J_PASSWORD")
            .map_err(|_| anyhow!("Falta NEO4J_PASSWORD en el entorno"))?;

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());

        // Relativo al directorio de trabajo, como el fichero original.
        let settings_file =
            env::var("SETTINGS_FILE_PATH").unwrap_or_else(|_| ".config.json".to_string());
        let settings_path = env::current_dir()?.join(settings_file);

        let store_failure_policy = match env::var("STORE_FAILURE_POLICY") {
            Ok(value) => StoreFailurePolicy::from_str(&value)?,
            Err(_) => StoreFailurePolicy::default(),
        };
        let seed_policy = match env::var("SEED_INPUT_POLICY") {
            Ok(value) => SeedPolicy::from_str(&value)?,
            Err(_) => SeedPolicy::default(),
        };

        Ok(Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            server_addr,
            llm_provider,
            llm_embedding_model,
            settings_path,
            store_failure_policy,
            seed_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_policies_case_insensitively() {
        assert_eq!(StoreFailurePolicy::from_str("ABORT").unwrap(), StoreFailurePolicy::Abort);
        assert_eq!(SeedPolicy::from_str("Reject").unwrap(), SeedPolicy::Reject);
        assert!(StoreFailurePolicy::from_str("ignore").is_err());
    }

    #[test]
    fn rejects_unknown_provider() {
        assert!(LlmProvider::from_str("anthropic").is_err());
        assert!(matches!(LlmProvider::from_str("OpenAI").unwrap(), LlmProvider::OpenAI));
    }
}
