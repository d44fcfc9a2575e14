//! Construcción de consultas full-text (sintaxis Lucene) para Neo4j.

/// Operadores reservados de Lucene que no deben llegar al índice.
const LUCENE_SPECIAL: [&str; 19] = [
    "\\", "+", "-", "&&", "||", "!", "(", ")", "{", "}", "[", "]", "^", "\"", "~", "*", "?", ":",
    "/",
];

/// Sustituye los caracteres reservados por espacios.
pub fn remove_lucene_chars(text: &str) -> String {
    let mut cleaned = text.to_string();
    for special in LUCENE_SPECIAL {
        cleaned = cleaned.replace(special, " ");
    }
    cleaned.trim().to_string()
}

/// Consulta difusa (~2 ediciones por palabra) con todas las palabras unidas por AND.
///
/// `"Jon Snow"` → `"Jon~2 AND Snow~2"`. Devuelve `None` si no queda ninguna palabra.
pub fn generate_full_text_query(entity_name: &str) -> Option<String> {
    let cleaned = remove_lucene_chars(entity_name);
    let words: Vec<String> = cleaned
        .split_whitespace()
        .map(|word| format!("{word}~2"))
        .collect();
    if words.is_empty() {
        return None;
    }
    Some(words.join(" AND "))
}
