//! Boolean keyword query parser and evaluator.
//!
//! Precedence from loosest to tightest: `OR`, implicit or explicit `AND`,
//! unary `NOT` (`-term`), parenthesized groups, terms. Terms are bare words,
//! quoted phrases, or prefixes (`wedd*`).

use crate::keywords::normalize_keyword;
use std::collections::HashSet;

/// Nesting of groups and negations allowed before a query is rejected.
pub const MAX_QUERY_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    Word,
    Phrase,
    Prefix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryNode {
    Term { value: String, kind: TermKind },
    Not(Box<QueryNode>),
    And(Vec<QueryNode>),
    Or(Vec<QueryNode>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryParseError {
    #[error("unexpected {found} where {expected} was expected")]
    Unexpected {
        expected: &'static str,
        found: &'static str,
    },
    #[error("query nests deeper than {} levels", MAX_QUERY_DEPTH)]
    TooDeep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Phrase(String),
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eof,
}

impl Token {
    fn describe(&self) -> &'static str {
        match self {
            Token::Word(_) | Token::Phrase(_) => "term",
            Token::LParen => "'('",
            Token::RParen => "')'",
            Token::Not => "'-'",
            Token::And => "AND",
            Token::Or => "OR",
            Token::Eof => "end of query",
        }
    }

    fn starts_factor(&self) -> bool {
        matches!(
            self,
            Token::Word(_) | Token::Phrase(_) | Token::LParen | Token::Not
        )
    }
}

fn tokenize(text: &str) -> Vec<Token> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
            continue;
        }

        match ch {
            '"' => {
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != '"' {
                    i += 1;
                }
                let value: String = chars[start..i].iter().collect();
                // Skip the closing quote; an unterminated phrase runs to the end
                i += 1;
                if !value.is_empty() {
                    tokens.push(Token::Phrase(value));
                }
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '-' if i + 1 < chars.len() && !chars[i + 1].is_whitespace() => {
                tokens.push(Token::Not);
                i += 1;
            }
            _ => {
                let start = i;
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && chars[i] != '('
                    && chars[i] != ')'
                {
                    i += 1;
                }
                let value: String = chars[start..i].iter().collect();
                if value.eq_ignore_ascii_case("or") {
                    tokens.push(Token::Or);
                } else if value.eq_ignore_ascii_case("and") {
                    tokens.push(Token::And);
                } else {
                    tokens.push(Token::Word(value));
                }
            }
        }
    }

    tokens.push(Token::Eof);
    tokens
}

struct QueryParser {
    tokens: Vec<Token>,
    index: usize,
    depth: usize,
}

impl QueryParser {
    fn new(text: &str) -> Self {
        Self {
            tokens: tokenize(text),
            index: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> &Token {
        // The token list always ends with Eof and the cursor never passes it
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), QueryParseError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(QueryParseError::Unexpected {
                expected: expected.describe(),
                found: self.peek().describe(),
            })
        }
    }

    fn parse(mut self) -> Result<Option<QueryNode>, QueryParseError> {
        if *self.peek() == Token::Eof {
            return Ok(None);
        }
        let node = self.parse_or()?;
        self.expect(Token::Eof)?;
        Ok(Some(node))
    }

    fn parse_or(&mut self) -> Result<QueryNode, QueryParseError> {
        let mut nodes = vec![self.parse_and()?];
        while *self.peek() == Token::Or {
            self.advance();
            nodes.push(self.parse_and()?);
        }
        Ok(collapse(nodes, QueryNode::Or))
    }

    fn parse_and(&mut self) -> Result<QueryNode, QueryParseError> {
        let mut nodes = vec![self.parse_factor()?];
        loop {
            if *self.peek() == Token::And {
                self.advance();
                nodes.push(self.parse_factor()?);
            } else if self.peek().starts_factor() {
                nodes.push(self.parse_factor()?);
            } else {
                break;
            }
        }
        Ok(collapse(nodes, QueryNode::And))
    }

    fn parse_factor(&mut self) -> Result<QueryNode, QueryParseError> {
        match self.peek() {
            Token::Not => {
                self.advance();
                self.descend()?;
                let inner = self.parse_factor();
                self.depth -= 1;
                Ok(QueryNode::Not(Box::new(inner?)))
            }
            Token::LParen => {
                self.advance();
                self.descend()?;
                let inner = self.parse_or();
                self.depth -= 1;
                let inner = inner?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            _ => match self.advance() {
                Token::Phrase(value) => Ok(QueryNode::Term {
                    value,
                    kind: TermKind::Phrase,
                }),
                Token::Word(value) => Ok(word_term(value)),
                other => Err(QueryParseError::Unexpected {
                    expected: "term",
                    found: other.describe(),
                }),
            },
        }
    }

    fn descend(&mut self) -> Result<(), QueryParseError> {
        self.depth += 1;
        if self.depth > MAX_QUERY_DEPTH {
            return Err(QueryParseError::TooDeep);
        }
        Ok(())
    }
}

fn word_term(value: String) -> QueryNode {
    if value.chars().count() > 1 && value.ends_with('*') {
        let mut stripped = value;
        stripped.pop();
        QueryNode::Term {
            value: stripped,
            kind: TermKind::Prefix,
        }
    } else {
        QueryNode::Term {
            value,
            kind: TermKind::Word,
        }
    }
}

fn collapse(mut nodes: Vec<QueryNode>, wrap: fn(Vec<QueryNode>) -> QueryNode) -> QueryNode {
    if nodes.len() == 1 {
        nodes.remove(0)
    } else {
        wrap(nodes)
    }
}

/// Parses a query, reporting why a malformed one was rejected.
/// An empty query parses to `Ok(None)`.
pub fn try_parse_query(text: &str) -> Result<Option<QueryNode>, QueryParseError> {
    QueryParser::new(text).parse()
}

/// Parses a query. Empty and malformed queries both yield `None`, which
/// matches everything.
pub fn parse_query(text: &str) -> Option<QueryNode> {
    match try_parse_query(text) {
        Ok(node) => node,
        Err(err) => {
            log::debug!("Ignoring malformed query {:?}: {}", text, err);
            None
        }
    }
}

/// Evaluates `node` against a candidate's normalized keywords. `text` is an
/// optional free-text blob (title, description, filename) that phrase and
/// prefix terms may also match.
pub fn evaluate(
    node: Option<&QueryNode>,
    keywords_norm: &HashSet<String>,
    text: Option<&str>,
) -> bool {
    let Some(node) = node else {
        return true;
    };
    let text_norm = text.map(normalize_keyword);
    evaluate_node(node, keywords_norm, text_norm.as_deref())
}

fn evaluate_node(node: &QueryNode, keywords: &HashSet<String>, text: Option<&str>) -> bool {
    match node {
        QueryNode::Term { value, kind } => matches_term(value, *kind, keywords, text),
        QueryNode::Not(inner) => !evaluate_node(inner, keywords, text),
        QueryNode::And(nodes) => nodes.iter().all(|n| evaluate_node(n, keywords, text)),
        QueryNode::Or(nodes) => nodes.iter().any(|n| evaluate_node(n, keywords, text)),
    }
}

fn matches_term(
    value: &str,
    kind: TermKind,
    keywords: &HashSet<String>,
    text: Option<&str>,
) -> bool {
    let norm = normalize_keyword(value);
    if norm.is_empty() {
        return true;
    }

    match kind {
        TermKind::Word => keywords.contains(&norm),
        TermKind::Phrase => {
            keywords.contains(&norm) || text.is_some_and(|blob| blob.contains(norm.as_str()))
        }
        TermKind::Prefix => {
            keywords.iter().any(|k| k.starts_with(norm.as_str()))
                || text.is_some_and(|blob| {
                    blob.split_whitespace()
                        .any(|word| word.starts_with(norm.as_str()))
                })
        }
    }
}

/// Non-negated term values in query order, used to build the engine query string.
pub fn extract_positive_terms(node: Option<&QueryNode>) -> Vec<String> {
    let mut terms = Vec::new();
    if let Some(node) = node {
        collect_positive(node, &mut terms);
    }
    terms
}

fn collect_positive(node: &QueryNode, terms: &mut Vec<String>) {
    match node {
        QueryNode::Term { value, .. } => {
            if !value.is_empty() {
                terms.push(value.clone());
            }
        }
        QueryNode::Not(_) => {}
        QueryNode::And(nodes) | QueryNode::Or(nodes) => {
            for child in nodes {
                collect_positive(child, terms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[&str]) -> HashSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn matches(query: &str, keywords: &[&str]) -> bool {
        evaluate(parse_query(query).as_ref(), &set(keywords), None)
    }

    #[test]
    fn test_simple_and() {
        assert!(matches("wedding summer", &["wedding", "summer"]));
        assert!(!matches("wedding summer", &["wedding"]));
        assert!(matches("wedding AND summer", &["wedding", "summer"]));
    }

    #[test]
    fn test_or() {
        assert!(matches("wedding OR birthday", &["wedding"]));
        assert!(matches("wedding or birthday", &["birthday"]));
        assert!(!matches("wedding OR birthday", &["studio"]));
    }

    #[test]
    fn test_not() {
        assert!(matches("wedding -studio", &["wedding"]));
        assert!(!matches("wedding -studio", &["wedding", "studio"]));
    }

    #[test]
    fn test_prefix() {
        assert!(matches("wedd*", &["wedding"]));
        assert!(!matches("wedd*", &["wed"]));
        assert!(!matches("wedd*", &["studio"]));
    }

    #[test]
    fn test_phrase_is_exact() {
        assert!(matches("\"red dress\"", &["red dress"]));
        assert!(!matches("\"red dress\"", &["red", "dress"]));
    }

    #[test]
    fn test_or_binds_looser_than_and() {
        let ast = parse_query("a b OR c").unwrap();
        assert_eq!(
            ast,
            QueryNode::Or(vec![
                QueryNode::And(vec![word_term("a".into()), word_term("b".into())]),
                word_term("c".into()),
            ])
        );
        assert!(matches("a b OR c", &["c"]));
        assert!(!matches("a (b OR c)", &["c"]));
    }

    #[test]
    fn test_dash_followed_by_space_is_a_term() {
        let ast = parse_query("- wedding").unwrap();
        assert_eq!(
            ast,
            QueryNode::And(vec![word_term("-".into()), word_term("wedding".into())])
        );
        assert_eq!(
            parse_query("-(a b)"),
            Some(QueryNode::Not(Box::new(QueryNode::And(vec![
                word_term("a".into()),
                word_term("b".into()),
            ]))))
        );
    }

    #[test]
    fn test_keywords_are_normalized_before_matching() {
        assert!(matches("ЁЛКА", &["елка"]));
        assert!(matches("Sunset*", &["sunset beach"]));
    }

    #[test]
    fn test_malformed_queries_yield_none() {
        for query in ["(wedding", "wedding)", "wedding OR", "OR wedding", "wedding AND", "()"] {
            assert_eq!(parse_query(query), None, "query {:?}", query);
            assert!(try_parse_query(query).is_err(), "query {:?}", query);
        }
        // A lone trailing dash is a plain term
        assert!(parse_query("a -").is_some());
    }

    #[test]
    fn test_empty_query_matches_everything() {
        assert_eq!(parse_query("   "), None);
        assert!(try_parse_query("").unwrap().is_none());
        assert!(matches("", &[]));
        assert!(matches("(wedding", &["anything"]));
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let deep = format!(
            "{}a{}",
            "(".repeat(MAX_QUERY_DEPTH + 1),
            ")".repeat(MAX_QUERY_DEPTH + 1)
        );
        assert_eq!(try_parse_query(&deep), Err(QueryParseError::TooDeep));

        let ok = format!(
            "{}a{}",
            "(".repeat(MAX_QUERY_DEPTH),
            ")".repeat(MAX_QUERY_DEPTH)
        );
        assert_eq!(parse_query(&ok), Some(word_term("a".into())));

        let negations = format!("{}a", "-".repeat(MAX_QUERY_DEPTH + 1));
        assert_eq!(try_parse_query(&negations), Err(QueryParseError::TooDeep));
    }

    #[test]
    fn test_text_fallback_for_phrase_and_prefix() {
        let keywords = set(&["travel"]);
        let text = Some("Red Dress at the Seaside");

        let phrase = parse_query("\"red dress\"");
        assert!(evaluate(phrase.as_ref(), &keywords, text));
        assert!(!evaluate(phrase.as_ref(), &keywords, None));

        let prefix = parse_query("seas*");
        assert!(evaluate(prefix.as_ref(), &keywords, text));

        // Bare words only match keywords
        let word = parse_query("dress");
        assert!(!evaluate(word.as_ref(), &keywords, text));
    }

    #[test]
    fn test_boolean_laws_hold() {
        let keywords = set(&["a", "c"]);
        let terms = ["a", "b", "c"];
        let singles: Vec<bool> = terms
            .iter()
            .map(|t| evaluate(parse_query(t).as_ref(), &keywords, None))
            .collect();

        let and = evaluate(parse_query("a b c").as_ref(), &keywords, None);
        let or = evaluate(parse_query("a OR b OR c").as_ref(), &keywords, None);
        assert_eq!(and, singles.iter().all(|v| *v));
        assert_eq!(or, singles.iter().any(|v| *v));

        for term in terms {
            let positive = evaluate(parse_query(term).as_ref(), &keywords, None);
            let negated = evaluate(parse_query(&format!("-{}", term)).as_ref(), &keywords, None);
            assert_eq!(negated, !positive);
        }
    }

    #[test]
    fn test_extract_positive_terms_skips_negations() {
        let ast = parse_query("wedding -studio (summer OR \"red dress\") -(x y) wedd*");
        assert_eq!(
            extract_positive_terms(ast.as_ref()),
            vec!["wedding", "summer", "red dress", "wedd"]
        );
        assert!(extract_positive_terms(None).is_empty());
    }
}
