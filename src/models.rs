//! Modelos de dominio: conversación, resultados de recuperación y documentos de grafo.

use std::fmt;

use serde::Serialize;

/// Par pregunta/respuesta. La pregunta es inmutable; la respuesta sólo crece.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QaPair {
    question: String,
    pub answer: String,
}

impl QaPair {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: String::new(),
        }
    }

    pub fn question(&self) -> &str {
        &self.question
    }
}

/// Hilo de conversación con nombre único dentro de la sesión.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationThread {
    pub name: String,
    pub pairs: Vec<QaPair>,
}

impl ConversationThread {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pairs: Vec::new(),
        }
    }
}

/// Arista (sujeto, relación, objeto) del vecindario de una entidad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphTriple {
    pub source: String,
    pub relation: String,
    pub target: String,
}

impl fmt::Display for GraphTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {} -> {}", self.source, self.relation, self.target)
    }
}

/// Fragmento de texto devuelto por el índice vectorial.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub text: String,
    pub rank: usize,
    pub score: f64,
}

/// Nodo tipado extraído de una ventana (ej: id "Jon Snow", tipo "Person").
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub node_type: String,
}

/// Relación tipada y dirigida entre dos nodos extraídos.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphRelationship {
    pub source: String,
    pub target: String,
    pub rel_type: String,
}

/// Ventana de texto de origen; se persiste como nodo (:Document).
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub id: String,
    pub text: String,
    /// Posición de la ventana dentro de su llamada de ingesta.
    pub window: usize,
    /// Identificador de la llamada de ingesta que la produjo.
    pub batch_id: String,
    /// Instante de ingesta en RFC 3339.
    pub ingested_at: String,
}

/// Resultado de extraer una ventana, con su documento de origen.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphDocument {
    pub nodes: Vec<GraphNode>,
    pub relationships: Vec<GraphRelationship>,
    pub source: SourceDocument,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triple_renders_directional_line() {
        let triple = GraphTriple {
            source: "Jon Snow".into(),
            relation: "MEMBER_OF".into(),
            target: "Night's Watch".into(),
        };
        assert_eq!(triple.to_string(), "Jon Snow - MEMBER_OF -> Night's Watch");
    }

    #[test]
    fn new_pair_starts_with_empty_answer() {
        let pair = QaPair::new("¿Quién es Arya?");
        assert_eq!(pair.question(), "¿Quién es Arya?");
        assert!(pair.answer.is_empty());
    }
}
