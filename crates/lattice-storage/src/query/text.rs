//! Full-text query syntax, compiled to an FTS5 MATCH expression.

/// A composable full-text query.
///
/// `all_of` AND-joins terms, `any_of` OR-joins, `phrase` quotes, `prefix`
/// appends `*`, `near` uses FTS5's NEAR group, and `raw` passes through
/// untouched.
#[derive(Debug, Clone)]
pub enum TextQuery {
    AllOf(Vec<String>),
    AnyOf(Vec<String>),
    Phrase(String),
    Prefix(String),
    Near {
        a: String,
        b: String,
        distance: u32,
    },
    Raw(String),
}

impl TextQuery {
    pub fn all_of<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TextQuery::AllOf(terms.into_iter().map(Into::into).collect())
    }

    pub fn any_of<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TextQuery::AnyOf(terms.into_iter().map(Into::into).collect())
    }

    pub fn phrase(text: impl Into<String>) -> Self {
        TextQuery::Phrase(text.into())
    }

    pub fn prefix(term: impl Into<String>) -> Self {
        TextQuery::Prefix(term.into())
    }

    pub fn near(a: impl Into<String>, b: impl Into<String>, distance: u32) -> Self {
        TextQuery::Near {
            a: a.into(),
            b: b.into(),
            distance,
        }
    }

    pub fn raw(query: impl Into<String>) -> Self {
        TextQuery::Raw(query.into())
    }

    /// Compile to the FTS5 MATCH expression.
    pub fn to_match_expr(&self) -> String {
        fn quote(term: &str) -> String {
            format!("\"{}\"", term.replace('"', "\"\""))
        }
        match self {
            TextQuery::AllOf(terms) => terms
                .iter()
                .map(|t| quote(t))
                .collect::<Vec<_>>()
                .join(" AND "),
            TextQuery::AnyOf(terms) => terms
                .iter()
                .map(|t| quote(t))
                .collect::<Vec<_>>()
                .join(" OR "),
            TextQuery::Phrase(text) => quote(text),
            TextQuery::Prefix(term) => format!("{}*", quote(term)),
            TextQuery::Near { a, b, distance } => {
                format!("NEAR({} {}, {distance})", quote(a), quote(b))
            }
            TextQuery::Raw(query) => query.clone(),
        }
    }
}

impl From<&str> for TextQuery {
    /// A bare string is an all-terms query.
    fn from(s: &str) -> Self {
        TextQuery::all_of(s.split_whitespace())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_of_joins_with_and() {
        assert_eq!(
            TextQuery::all_of(["good", "coffee"]).to_match_expr(),
            "\"good\" AND \"coffee\""
        );
    }

    #[test]
    fn any_of_joins_with_or() {
        assert_eq!(
            TextQuery::any_of(["tea", "coffee"]).to_match_expr(),
            "\"tea\" OR \"coffee\""
        );
    }

    #[test]
    fn phrase_quotes() {
        assert_eq!(
            TextQuery::phrase("flat white").to_match_expr(),
            "\"flat white\""
        );
    }

    #[test]
    fn prefix_appends_star() {
        assert_eq!(TextQuery::prefix("espr").to_match_expr(), "\"espr\"*");
    }

    #[test]
    fn near_group() {
        assert_eq!(
            TextQuery::near("best", "coffee", 5).to_match_expr(),
            "NEAR(\"best\" \"coffee\", 5)"
        );
    }

    #[test]
    fn embedded_quotes_escape() {
        assert_eq!(
            TextQuery::phrase("say \"hi\"").to_match_expr(),
            "\"say \"\"hi\"\"\""
        );
    }

    #[test]
    fn bare_string_is_all_of() {
        let q: TextQuery = "good coffee".into();
        assert_eq!(q.to_match_expr(), "\"good\" AND \"coffee\"");
    }
}
