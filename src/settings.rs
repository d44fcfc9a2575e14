//! Parámetros de generación persistidos en un fichero JSON plano.
//!
//! `ConfigProvider` es el único dueño de la caché: `read` carga bajo demanda y
//! memoriza, `write` sustituye el registro completo e invalida. La lectura
//! nunca falla: cualquier valor ausente o inválido cae a su valor por defecto.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::SeedPolicy;
use crate::error::{ConfigValidationError, ConfigWriteError};

pub const DEFAULT_SYSTEM_CONTENT: &str =
    "You are a friendly chatbot named Reflex. Respond in markdown.";
pub const SYSTEM_CONTENT_MAX_LENGTH: usize = 1000;

pub const TEMPERATURE_MIN: f64 = 0.0;
pub const TEMPERATURE_MAX: f64 = 2.0;
pub const TOP_P_MIN: f64 = 0.0;
pub const TOP_P_MAX: f64 = 1.0;

const SYSTEM_CONTENT_KEY: &str = "system_content";
const MODEL_KEY: &str = "model";
const TEMPERATURE_KEY: &str = "temperature";
const SEED_KEY: &str = "seed";
const TOP_P_KEY: &str = "top_p";

/// Conjunto cerrado de modelos de chat admitidos.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatModel {
    #[default]
    #[serde(rename = "gpt-4o")]
    Gpt4o,
    #[serde(rename = "gpt-4-turbo")]
    Gpt4Turbo,
    #[serde(rename = "gpt-4")]
    Gpt4,
    #[serde(rename = "gpt-3.5-turbo")]
    Gpt35Turbo,
}

impl ChatModel {
    pub const ALL: [ChatModel; 4] = [
        ChatModel::Gpt4o,
        ChatModel::Gpt4Turbo,
        ChatModel::Gpt4,
        ChatModel::Gpt35Turbo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatModel::Gpt4o => "gpt-4o",
            ChatModel::Gpt4Turbo => "gpt-4-turbo",
            ChatModel::Gpt4 => "gpt-4",
            ChatModel::Gpt35Turbo => "gpt-3.5-turbo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == s)
    }
}

/// Parámetros de generación. `None` significa "sin fijar", distinto de 0.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerationConfig {
    pub content: String,
    pub model: ChatModel,
    pub temperature: Option<f64>,
    pub seed: Option<u64>,
    pub top_p: Option<f64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            content: DEFAULT_SYSTEM_CONTENT.to_string(),
            model: ChatModel::default(),
            temperature: None,
            seed: None,
            top_p: None,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        validate_content(&self.content)?;
        if let Some(t) = self.temperature {
            check_bounds("temperature", t, TEMPERATURE_MIN, TEMPERATURE_MAX)?;
        }
        if let Some(p) = self.top_p {
            check_bounds("top_p", p, TOP_P_MIN, TOP_P_MAX)?;
        }
        Ok(())
    }

    /// Construye la configuración a partir del objeto JSON persistido,
    /// campo a campo, avisando de cada valor descartado.
    fn from_json_map(map: &Map<String, Value>) -> Self {
        let mut config = Self::default();

        match map.get(SYSTEM_CONTENT_KEY) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) if validate_content(s).is_ok() => config.content = s.clone(),
            Some(other) => warn!("'{SYSTEM_CONTENT_KEY}' inválido en configuración ({other}); se usa el valor por defecto."),
        }

        match map.get(MODEL_KEY) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => match ChatModel::parse(s) {
                Some(model) => config.model = model,
                None => warn!(
                    "Modelo '{s}' fuera del conjunto admitido; se usa '{}'.",
                    config.model.as_str()
                ),
            },
            Some(other) => warn!("'{MODEL_KEY}' inválido en configuración ({other}); se usa el valor por defecto."),
        }

        config.temperature = bounded_f64(map, TEMPERATURE_KEY, TEMPERATURE_MIN, TEMPERATURE_MAX);
        config.top_p = bounded_f64(map, TOP_P_KEY, TOP_P_MIN, TOP_P_MAX);

        config.seed = match map.get(SEED_KEY) {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_u64() {
                Some(seed) => Some(seed),
                None => {
                    warn!("'{SEED_KEY}' inválido en configuración ({value}); se ignora.");
                    None
                }
            },
        };

        config
    }
}

fn bounded_f64(map: &Map<String, Value>, key: &str, min: f64, max: f64) -> Option<f64> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(value) => match value.as_f64() {
            Some(v) if (min..=max).contains(&v) => Some(v),
            _ => {
                warn!("'{key}' inválido en configuración ({value}); se trata como no fijado.");
                None
            }
        },
    }
}

fn validate_content(content: &str) -> Result<(), ConfigValidationError> {
    if content.is_empty() {
        return Err(ConfigValidationError::EmptyContent);
    }
    let len = content.chars().count();
    if len > SYSTEM_CONTENT_MAX_LENGTH {
        return Err(ConfigValidationError::ContentTooLong {
            len,
            max: SYSTEM_CONTENT_MAX_LENGTH,
        });
    }
    Ok(())
}

fn check_bounds(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigValidationError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigValidationError::OutOfBounds { field, value, min, max })
    }
}

/// Interpreta la semilla introducida como texto. Vacío = sin fijar.
pub fn parse_seed(input: &str, policy: SeedPolicy) -> Result<Option<u64>, ConfigValidationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if let Ok(seed) = trimmed.parse::<u64>() {
        return Ok(Some(seed));
    }
    let negative = trimmed
        .strip_prefix('-')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()));
    if negative {
        return Err(ConfigValidationError::InvalidSeed(input.to_string()));
    }
    match policy {
        SeedPolicy::Coerce => {
            warn!("Semilla no numérica '{input}' convertida a 0.");
            Ok(Some(0))
        }
        SeedPolicy::Reject => Err(ConfigValidationError::InvalidSeed(input.to_string())),
    }
}

/// Valores tal como llegan del formulario de configuración.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigForm {
    pub content: String,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub seed: String,
    #[serde(default)]
    pub top_p: Option<f64>,
}

impl ConfigForm {
    pub fn into_config(self, seed_policy: SeedPolicy) -> Result<GenerationConfig, ConfigValidationError> {
        let model = ChatModel::parse(&self.model)
            .ok_or_else(|| ConfigValidationError::UnknownModel(self.model.clone()))?;
        let config = GenerationConfig {
            seed: parse_seed(&self.seed, seed_policy)?,
            content: self.content,
            model,
            temperature: self.temperature,
            top_p: self.top_p,
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<&GenerationConfig> for ConfigForm {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            content: config.content.clone(),
            model: config.model.as_str().to_string(),
            temperature: config.temperature,
            seed: config.seed.map(|s| s.to_string()).unwrap_or_default(),
            top_p: config.top_p,
        }
    }
}

/// Registro persistido; siempre se escribe completo.
#[derive(Serialize)]
struct StoredConfig<'a> {
    system_content: &'a str,
    model: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

/// Proveedor de configuración con caché explícita.
#[derive(Debug)]
pub struct ConfigProvider {
    path: PathBuf,
    cache: Mutex<Option<GenerationConfig>>,
}

impl ConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn read(&self) -> GenerationConfig {
        let mut cache = self.cache.lock().unwrap();
        if let Some(config) = cache.as_ref() {
            return config.clone();
        }
        let config = self.load();
        *cache = Some(config.clone());
        config
    }

    /// Sustituye el registro completo (no fusiona) e invalida la caché.
    pub fn write(&self, config: &GenerationConfig) -> Result<(), ConfigWriteError> {
        config.validate()?;
        let stored = StoredConfig {
            system_content: &config.content,
            model: config.model.as_str(),
            temperature: config.temperature,
            seed: config.seed,
            top_p: config.top_p,
        };
        let json = serde_json::to_string_pretty(&stored)?;
        fs::write(&self.path, json)?;
        self.invalidate();
        info!("Configuración de generación guardada en {}", self.path.display());
        Ok(())
    }

    pub fn invalidate(&self) {
        *self.cache.lock().unwrap() = None;
    }

    fn load(&self) -> GenerationConfig {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Sin fichero de configuración en {}; valores por defecto.", self.path.display());
                return GenerationConfig::default();
            }
            Err(e) => {
                warn!("No se pudo leer {}: {e}. Se usan valores por defecto.", self.path.display());
                return GenerationConfig::default();
            }
        };
        if raw.trim().is_empty() {
            return GenerationConfig::default();
        }

        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => GenerationConfig::from_json_map(&map),
            Ok(other) => {
                warn!("El fichero de configuración no es un diccionario: {other}");
                GenerationConfig::default()
            }
            Err(e) => {
                warn!("JSON de configuración inválido ({e}); se usan valores por defecto.");
                GenerationConfig::default()
            }
        }
    }
}
