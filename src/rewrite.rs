use aho_corasick::{AhoCorasick, BuildError, MatchKind};

/// Literal token substitution for HTML bodies.
///
/// Applied once per cache miss, before compression, so cached bytes already
/// carry the replaced values. All tokens are matched in a single pass, so a
/// replacement value is never rewritten again.
#[derive(Debug, Clone, Default)]
pub struct HtmlRewriter {
    matcher: Option<AhoCorasick>,
    values: Vec<Vec<u8>>,
}

impl HtmlRewriter {
    pub fn new<I, K, V>(replacements: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let (tokens, values): (Vec<String>, Vec<Vec<u8>>) = replacements
            .into_iter()
            .filter(|(token, _)| !token.as_ref().is_empty())
            .map(|(token, value)| (token.as_ref().to_string(), value.as_ref().as_bytes().to_vec()))
            .unzip();

        if tokens.is_empty() {
            return Ok(Self::default());
        }

        // Longest wins when one token is a prefix of another
        let matcher = AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostLongest)
            .build(&tokens)?;
        Ok(Self {
            matcher: Some(matcher),
            values,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.matcher.is_none()
    }

    pub fn applies_to(&self, content_type: &str) -> bool {
        !self.is_empty() && content_type.starts_with("text/html")
    }

    /// Replaces every occurrence of every token. Non-HTML bodies pass
    /// through untouched.
    pub fn rewrite(&self, content_type: &str, body: Vec<u8>) -> Vec<u8> {
        if !self.applies_to(content_type) {
            return body;
        }
        match &self.matcher {
            Some(matcher) => matcher.replace_all_bytes(&body, &self.values),
            None => body,
        }
    }
}
