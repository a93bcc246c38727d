/// Canonical comparison key for a raw keyword: trimmed, lowercased, `ё` folded
/// to `е`, inner whitespace runs collapsed to one space. Blank input gives "".
pub fn normalize_keyword(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    if lowered.is_empty() {
        return String::new();
    }

    lowered
        .replace('ё', "е")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Splits a delimited keyword string on `;` first, then `,`.
pub fn split_keyword_string(raw: &str) -> Vec<String> {
    let separator = if raw.contains(';') { ';' } else { ',' };
    raw.split(separator)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Normalizes and deduplicates raw keywords, keeping the first-seen display
/// form (trimmed) for each key. Order follows first appearance.
pub fn dedupe_keywords<I, S>(raw: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();
    for value in raw {
        let value = value.as_ref();
        let norm = normalize_keyword(value);
        if norm.is_empty() || !seen.insert(norm.clone()) {
            continue;
        }
        result.push((norm, value.trim().to_string()));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_keyword() {
        assert_eq!(normalize_keyword("  Ёлка  тест  "), "елка тест");
        assert_eq!(normalize_keyword("Sunset\t\nBeach"), "sunset beach");
        assert_eq!(normalize_keyword(""), "");
        assert_eq!(normalize_keyword("   "), "");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in ["  Ёлка  тест  ", "Red Dress", "ÉCOLE", "a\u{00a0}b", "  ", "Ё"] {
            let once = normalize_keyword(raw);
            assert_eq!(normalize_keyword(&once), once, "input {:?}", raw);
        }
    }

    #[test]
    fn test_split_keyword_string_prefers_semicolon() {
        assert_eq!(
            split_keyword_string("red, dress; summer"),
            vec!["red, dress", "summer"]
        );
        assert_eq!(split_keyword_string("red, dress,,"), vec!["red", "dress"]);
    }

    #[test]
    fn test_dedupe_keeps_first_display() {
        let deduped = dedupe_keywords(["Sunset", " sunset ", "", "SEA", "Sea  "]);
        assert_eq!(
            deduped,
            vec![
                ("sunset".to_string(), "Sunset".to_string()),
                ("sea".to_string(), "SEA".to_string()),
            ]
        );
    }
}
