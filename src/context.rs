//! Composición del contexto de anclaje y del prompt de sistema.

/// Separador entre fragmentos no estructurados.
pub const DOCUMENT_SEPARATOR: &str = "#Document ";

/// Une datos estructurados (grafo) y no estructurados (vector) en un bloque.
/// Las secciones vacías conservan su cabecera.
pub fn compose_context(structured: &str, unstructured: &[String]) -> String {
    format!(
        "Structured data:\n{structured}\nUnstructured data:\n{}\n",
        unstructured.join(DOCUMENT_SEPARATOR)
    )
}

/// Plantilla de sistema: persona configurada por el usuario + contexto.
pub fn build_system_prompt(system_content: &str, context: &str) -> String {
    format!("{system_content} Respond in markdown.\n\ncontext:\n{context}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_both_headers_when_sources_are_empty() {
        let context = compose_context("", &[]);
        assert!(context.contains("Structured data:"));
        assert!(context.contains("Unstructured data:"));

        let only_graph = compose_context("Jon - KNOWS -> Arya", &[]);
        assert!(only_graph.contains("Unstructured data:"));
        let only_vector = compose_context("", &["texto".to_string()]);
        assert!(only_vector.starts_with("Structured data:\n"));
    }

    #[test]
    fn joins_chunks_with_document_marker() {
        let context = compose_context("a - R -> b", &["uno".into(), "dos".into()]);
        assert_eq!(
            context,
            "Structured data:\na - R -> b\nUnstructured data:\nuno#Document dos\n"
        );
    }

    #[test]
    fn system_prompt_carries_persona_and_context() {
        let prompt = build_system_prompt("Eres Reflex.", "CTX");
        assert!(prompt.starts_with("Eres Reflex. Respond in markdown."));
        assert!(prompt.ends_with("context:\nCTX\n"));
    }
}
