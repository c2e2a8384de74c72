use flate2::Compression;
use flate2::write::GzEncoder;
use regex::Regex;
use std::io::Write;

/// Content encoding of a prepared body. Cache entries are partitioned by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Identity,
    Gzip,
    Brotli,
    Zstd,
}

/// Server preference order: the modern general purpose codec first, then the
/// widely supported one, then the legacy one.
pub const PREFERENCE: [Encoding; 3] = [Encoding::Zstd, Encoding::Brotli, Encoding::Gzip];

impl Encoding {
    /// Token used in `Accept-Encoding` / `Content-Encoding`.
    pub fn token(&self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Brotli => "br",
            Encoding::Zstd => "zstd",
        }
    }

    /// Value for the `Content-Encoding` header, `None` for identity.
    pub fn content_encoding(&self) -> Option<&'static str> {
        match self {
            Encoding::Identity => None,
            other => Some(other.token()),
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// Parse quality value from Accept-Encoding part (e.g., "gzip;q=0.5" -> 0.5)
fn parse_quality(part: &str) -> f32 {
    part.split(';')
        .skip(1)
        .find_map(|param| {
            let (name, value) = param.split_once('=')?;
            name.trim().eq_ignore_ascii_case("q").then_some(value)
        })
        .and_then(|q| q.trim().parse::<f32>().ok())
        .unwrap_or(1.0)
}

/// Whether the client declares `encoding` acceptable. An explicit entry wins
/// over `*`; `q=0` means "not acceptable".
pub fn accepts_encoding(accept_encoding: &str, encoding: Encoding) -> bool {
    let mut wildcard = None;
    for part in accept_encoding.split(',') {
        let name = part.split(';').next().unwrap_or("").trim();
        if name.eq_ignore_ascii_case(encoding.token()) {
            return parse_quality(part) > 0.0;
        }
        if name == "*" {
            wildcard = Some(parse_quality(part) > 0.0);
        }
    }
    wildcard.unwrap_or(false)
}

/// Check if a MIME type is compressible (text-based or common web formats)
pub fn is_compressible_mime(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    let Some((type_, subtype)) = essence.split_once('/') else {
        return false;
    };

    // Text types are always compressible
    if type_ == "text" {
        return !matches!(subtype, "event-stream");
    }

    if type_ == "application" {
        return matches!(
            subtype,
            "json"
                | "javascript"
                | "x-javascript"
                | "xml"
                | "xhtml+xml"
                | "rss+xml"
                | "atom+xml"
                | "manifest+json"
                | "ld+json"
                | "wasm"
        );
    }

    type_ == "image" && subtype == "svg+xml"
}

/// Decides which encoding a response body gets.
#[derive(Debug, Clone)]
pub struct CompressionPolicy {
    min_length: u64,
    content_type_filter: Option<Regex>,
}

impl CompressionPolicy {
    /// `min_length == 0` disables compression altogether.
    pub fn new(min_length: u64, content_type_filter: Option<Regex>) -> Self {
        Self {
            min_length,
            content_type_filter,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.min_length > 0
    }

    /// The encoding this client would get for a compressible body; used as
    /// the cache partition before the body itself is known.
    pub fn preferred(&self, accept_encoding: Option<&str>) -> Encoding {
        if !self.is_enabled() {
            return Encoding::Identity;
        }
        let Some(accept_encoding) = accept_encoding else {
            return Encoding::Identity;
        };

        PREFERENCE
            .into_iter()
            .find(|encoding| accepts_encoding(accept_encoding, *encoding))
            .unwrap_or(Encoding::Identity)
    }

    /// Whether a body of this type takes part in compression at all.
    pub fn allows_content_type(&self, content_type: &str) -> bool {
        match &self.content_type_filter {
            Some(filter) => filter.is_match(content_type),
            None => is_compressible_mime(content_type),
        }
    }

    /// Full negotiation for a body of `length` bytes.
    pub fn negotiate(&self, accept_encoding: Option<&str>, length: u64, content_type: &str) -> Encoding {
        self.settle(self.preferred(accept_encoding), length, content_type)
    }

    /// Narrows a variant picked by [`preferred`](Self::preferred) once the
    /// body's length and type are known.
    pub fn settle(&self, preferred: Encoding, length: u64, content_type: &str) -> Encoding {
        if length < self.min_length || !self.allows_content_type(content_type) {
            return Encoding::Identity;
        }
        preferred
    }
}

/// Incremental encoder so bodies can be compressed chunk by chunk as they
/// arrive from the backend.
pub enum Encoder {
    Identity(Vec<u8>),
    Gzip(GzEncoder<Vec<u8>>),
    Brotli(Box<brotli::CompressorWriter<Vec<u8>>>),
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
}

impl Encoder {
    pub fn new(encoding: Encoding, size_hint: usize) -> std::io::Result<Self> {
        let buffer = Vec::with_capacity(size_hint);
        Ok(match encoding {
            Encoding::Identity => Encoder::Identity(buffer),
            Encoding::Gzip => Encoder::Gzip(GzEncoder::new(buffer, Compression::default())),
            // quality 5, window 22: a good balance between speed and ratio
            Encoding::Brotli => Encoder::Brotli(Box::new(brotli::CompressorWriter::new(buffer, 4096, 5, 22))),
            Encoding::Zstd => Encoder::Zstd(zstd::stream::write::Encoder::new(buffer, 3)?),
        })
    }

    pub fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        match self {
            Encoder::Identity(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
            Encoder::Gzip(enc) => enc.write_all(chunk),
            Encoder::Brotli(enc) => enc.write_all(chunk),
            Encoder::Zstd(enc) => enc.write_all(chunk),
        }
    }

    pub fn finish(self) -> std::io::Result<Vec<u8>> {
        match self {
            Encoder::Identity(buf) => Ok(buf),
            Encoder::Gzip(enc) => enc.finish(),
            Encoder::Brotli(enc) => Ok(enc.into_inner()),
            Encoder::Zstd(enc) => enc.finish(),
        }
    }
}

/// One-shot helper over [`Encoder`].
pub fn encode(encoding: Encoding, data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = Encoder::new(encoding, data.len() / 2)?;
    encoder.write(data)?;
    encoder.finish()
}
