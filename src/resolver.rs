use crate::common::HtmlTemplates;
use crate::error::{ServeError, StorageError};
use crate::storage::{Backend, ObjectMetadata};
use log::debug;
use percent_encoding::percent_decode_str;

/// Normalised, percent-decoded object key.
///
/// Never contains `..`, `.` or empty segments; the root is the empty key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    key: String,
    trailing_slash: bool,
}

impl ObjectKey {
    /// Builds a key from a request path. Query strings are not part of the
    /// key. Traversal segments and, unless `allow_hidden`, dot-prefixed
    /// segments are rejected.
    pub fn parse(path: &str, allow_hidden: bool) -> Result<Self, ServeError> {
        let path = path.split(['?', '#']).next().unwrap_or("");
        let decoded = percent_decode_str(path)
            .decode_utf8()
            .map_err(|_| ServeError::BadRequest("path is not valid UTF-8".to_string()))?;

        if decoded.contains('\0') || decoded.contains('\\') {
            return Err(ServeError::BadRequest("path contains forbidden characters".to_string()));
        }

        let mut segments = Vec::new();
        for segment in decoded.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(ServeError::Forbidden("parent directory access is not allowed".to_string())),
                hidden if hidden.starts_with('.') && !allow_hidden => {
                    return Err(ServeError::Forbidden(format!("access to '{}' is not allowed", hidden)));
                }
                segment => segments.push(segment),
            }
        }

        Ok(Self {
            key: segments.join("/"),
            trailing_slash: decoded.ends_with('/') && !segments.is_empty(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn is_root(&self) -> bool {
        self.key.is_empty()
    }

    /// Request path ended in `/`, i.e. the client expects a directory.
    pub fn has_trailing_slash(&self) -> bool {
        self.trailing_slash
    }

    /// Identity of the request for caching: the key plus whether a directory
    /// was asked for, since `/a` and `/a/` may resolve differently.
    pub fn request_key(&self) -> String {
        if self.trailing_slash {
            format!("{}/", self.key)
        } else {
            self.key.clone()
        }
    }

    pub fn join(&self, name: &str) -> String {
        if self.key.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.key, name)
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}", self.key)
    }
}

/// Alternative resolutions tried, in order, after the primary lookup fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAction {
    /// `<key>.html`
    HtmlSuffix,
    /// The configured index document at the storage root.
    IndexFile,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackPolicy {
    actions: Vec<FallbackAction>,
}

impl FallbackPolicy {
    pub fn new(actions: Vec<FallbackAction>) -> Self {
        Self { actions }
    }

    /// `.html` suffix first so that `/about` finds `about.html` before the
    /// catch-all index document.
    pub fn from_flags(html_suffix: bool, index_file: bool) -> Self {
        let mut actions = Vec::new();
        if html_suffix {
            actions.push(FallbackAction::HtmlSuffix);
        }
        if index_file {
            actions.push(FallbackAction::IndexFile);
        }
        Self { actions }
    }

    pub fn actions(&self) -> &[FallbackAction] {
        &self.actions
    }
}

/// Outcome of resolving a request key against the storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Object {
        /// Key of the object actually served.
        key: String,
        metadata: ObjectMetadata,
        via_fallback: Option<FallbackAction>,
    },
    /// Synthesised directory listing.
    Listing { body: String },
}

#[derive(Debug, Clone)]
pub struct ContentResolver {
    index_file: String,
    autoindex: bool,
    fallback: FallbackPolicy,
}

impl ContentResolver {
    pub fn new(index_file: impl Into<String>, autoindex: bool, fallback: FallbackPolicy) -> Self {
        Self {
            index_file: index_file.into(),
            autoindex,
            fallback,
        }
    }

    pub fn index_file(&self) -> &str {
        &self.index_file
    }

    pub async fn resolve<B: Backend + ?Sized>(&self, storage: &B, key: &ObjectKey) -> Result<Resolved, ServeError> {
        let primary = match self.resolve_primary(storage, key).await {
            Err(err) if err.is_not_found() => err,
            other => return other,
        };

        for action in self.fallback.actions() {
            let attempt = match action {
                FallbackAction::HtmlSuffix if !key.is_root() => {
                    self.stat_file(storage, &format!("{}.html", key.as_str())).await
                }
                FallbackAction::HtmlSuffix => continue,
                FallbackAction::IndexFile => self.stat_file(storage, &self.index_file).await,
            };

            match attempt {
                Ok((resolved_key, metadata)) => {
                    debug!("{} resolved via {:?} fallback to {}", key, action, resolved_key);
                    return Ok(Resolved::Object {
                        key: resolved_key,
                        metadata,
                        via_fallback: Some(*action),
                    });
                }
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Err(primary)
    }

    async fn resolve_primary<B: Backend + ?Sized>(&self, storage: &B, key: &ObjectKey) -> Result<Resolved, ServeError> {
        let metadata = storage.stat(key.as_str()).await?;
        if !metadata.is_dir {
            if key.has_trailing_slash() {
                return Err(ServeError::NotFound(key.to_string()));
            }
            return Ok(Resolved::Object {
                key: key.as_str().to_string(),
                metadata,
                via_fallback: None,
            });
        }

        if !self.index_file.is_empty() {
            match self.stat_file(storage, &key.join(&self.index_file)).await {
                Ok((index_key, metadata)) => {
                    return Ok(Resolved::Object {
                        key: index_key,
                        metadata,
                        via_fallback: None,
                    });
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }

        if self.autoindex {
            let entries = storage.list(key.as_str()).await?;
            let body = HtmlTemplates::render_directory_listing(&key.to_string(), &entries);
            return Ok(Resolved::Listing { body });
        }

        Err(ServeError::NotFound(key.to_string()))
    }

    /// Stats `key` and only accepts regular objects.
    async fn stat_file<B: Backend + ?Sized>(&self, storage: &B, key: &str) -> Result<(String, ObjectMetadata), StorageError> {
        let metadata = storage.stat(key).await?;
        if metadata.is_dir {
            return Err(StorageError::not_found(key));
        }
        Ok((key.to_string(), metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsBackend;

    #[test]
    fn test_key_normalisation() {
        let key = ObjectKey::parse("/static//css/./site.css?v=3", false).unwrap();
        assert_eq!(key.as_str(), "static/css/site.css");
        assert!(!key.has_trailing_slash());

        let key = ObjectKey::parse("/docs/", false).unwrap();
        assert_eq!(key.as_str(), "docs");
        assert!(key.has_trailing_slash());

        let key = ObjectKey::parse("/hello%20world.txt", false).unwrap();
        assert_eq!(key.as_str(), "hello world.txt");

        let root = ObjectKey::parse("/", false).unwrap();
        assert!(root.is_root());
        assert!(!root.has_trailing_slash());
    }

    #[test]
    fn test_key_rejections() {
        for path in ["/../etc/passwd", "/a/../../b", "/%2e%2e/secret", "/a/%2E%2E"] {
            let err = ObjectKey::parse(path, false).unwrap_err();
            assert!(matches!(err, ServeError::Forbidden(_)), "{}", path);
        }

        assert!(matches!(ObjectKey::parse("/.env", false), Err(ServeError::Forbidden(_))));
        assert!(matches!(ObjectKey::parse("/.git/config", false), Err(ServeError::Forbidden(_))));
        assert_eq!(ObjectKey::parse("/.well-known/x", true).unwrap().as_str(), ".well-known/x");

        assert!(matches!(ObjectKey::parse("/%ff%fe", false), Err(ServeError::BadRequest(_))));
        assert!(matches!(ObjectKey::parse("/a%00b", false), Err(ServeError::BadRequest(_))));
        assert!(matches!(ObjectKey::parse("/a%5c..%5cb", false), Err(ServeError::BadRequest(_))));
    }

    fn site() -> tempfile::TempDir {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::write(root.join("index.html"), "<html>home</html>").unwrap();
        std::fs::write(root.join("about.html"), "<html>about</html>").unwrap();
        std::fs::create_dir(root.join("docs")).unwrap();
        std::fs::write(root.join("docs/index.html"), "<html>docs</html>").unwrap();
        std::fs::create_dir(root.join("assets")).unwrap();
        std::fs::write(root.join("assets/app.js"), "1").unwrap();
        temp_dir
    }

    fn object_key(resolved: Resolved) -> String {
        match resolved {
            Resolved::Object { key, .. } => key,
            Resolved::Listing { .. } => panic!("unexpected listing"),
        }
    }

    #[tokio::test]
    async fn test_index_substitution() {
        let dir = site();
        let storage = FsBackend::new(dir.path());
        let resolver = ContentResolver::new("index.html", false, FallbackPolicy::default());

        let root = resolver.resolve(&storage, &ObjectKey::parse("/", false).unwrap()).await.unwrap();
        assert_eq!(object_key(root), "index.html");

        let docs = resolver.resolve(&storage, &ObjectKey::parse("/docs/", false).unwrap()).await.unwrap();
        assert_eq!(object_key(docs), "docs/index.html");

        // No index and no autoindex
        let err = resolver
            .resolve(&storage, &ObjectKey::parse("/assets", false).unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_autoindex_listing() {
        let dir = site();
        let storage = FsBackend::new(dir.path());
        let resolver = ContentResolver::new("index.html", true, FallbackPolicy::default());

        let resolved = resolver.resolve(&storage, &ObjectKey::parse("/assets/", false).unwrap()).await.unwrap();
        match resolved {
            Resolved::Listing { body } => assert!(body.contains("app.js")),
            other => panic!("expected listing, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fallback_chain_order() {
        let dir = site();
        let storage = FsBackend::new(dir.path());
        let resolver = ContentResolver::new("index.html", false, FallbackPolicy::from_flags(true, true));

        let about = resolver.resolve(&storage, &ObjectKey::parse("/about", false).unwrap()).await.unwrap();
        match about {
            Resolved::Object { key, via_fallback, .. } => {
                assert_eq!(key, "about.html");
                assert_eq!(via_fallback, Some(FallbackAction::HtmlSuffix));
            }
            other => panic!("unexpected {:?}", other),
        }

        let spa = resolver.resolve(&storage, &ObjectKey::parse("/app/route/42", false).unwrap()).await.unwrap();
        match spa {
            Resolved::Object { key, via_fallback, .. } => {
                assert_eq!(key, "index.html");
                assert_eq!(via_fallback, Some(FallbackAction::IndexFile));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exhausted_fallback_is_not_found() {
        let dir = site();
        std::fs::remove_file(dir.path().join("index.html")).unwrap();
        let storage = FsBackend::new(dir.path());
        let resolver = ContentResolver::new("index.html", false, FallbackPolicy::from_flags(true, true));

        let err = resolver
            .resolve(&storage, &ObjectKey::parse("/missing", false).unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
