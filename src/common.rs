use crate::storage::{ByteStream, DirEntry};
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};
use std::time::SystemTime;

/// Body type for every response the server produces: buffered cache entries,
/// backend streams and generated pages alike.
pub type ServeBody = UnsyncBoxBody<Bytes, std::io::Error>;

pub fn full_body(data: impl Into<Bytes>) -> ServeBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed_unsync()
}

pub fn empty_body() -> ServeBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

/// Streams backend chunks straight to the client.
pub fn stream_body(stream: ByteStream) -> ServeBody {
    let frames = stream
        .map_ok(Frame::data)
        .map_err(|e| std::io::Error::other(e.to_string()));
    StreamBody::new(frames).boxed_unsync()
}

/// Template for 404 Not Found error page
const HTML_404_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><title>404 Not Found</title></head>
<body>
    <h1>404 Not Found</h1>
    <p>The requested resource was not found on this server.</p>
</body>
</html>"#;

/// Cache-Control for anything that must be revalidated on every use.
pub const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

/// Common response builders for terminal outcomes.
pub struct ResponseBuilder;

impl ResponseBuilder {
    fn with_body(status: StatusCode, content_type: &'static str, body: Bytes, is_head: bool) -> Response<ServeBody> {
        let length = body.len();
        let mut response = Response::new(if is_head { empty_body() } else { full_body(body) });
        *response.status_mut() = status;

        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
        response
    }

    /// Plain text error with the status' canonical reason as body.
    pub fn error(status: StatusCode, is_head: bool) -> Response<ServeBody> {
        let reason = status.canonical_reason().unwrap_or("Error");
        Self::with_body(status, "text/plain; charset=utf-8", Bytes::from(reason), is_head)
    }

    pub fn not_found(is_head: bool) -> Response<ServeBody> {
        Self::with_body(
            StatusCode::NOT_FOUND,
            "text/html; charset=utf-8",
            Bytes::from_static(HTML_404_TEMPLATE.as_bytes()),
            is_head,
        )
    }

    pub fn method_not_allowed() -> Response<ServeBody> {
        let mut response = Self::error(StatusCode::METHOD_NOT_ALLOWED, false);
        response
            .headers_mut()
            .insert(hyper::header::ALLOW, HeaderValue::from_static("GET, HEAD"));
        response
    }

    pub fn internal_server_error() -> Response<ServeBody> {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, false)
    }

    /// Liveness answer for `/ping`.
    pub fn pong(is_head: bool) -> Response<ServeBody> {
        Self::with_body(StatusCode::OK, "text/plain; charset=utf-8", Bytes::from_static(b"pong"), is_head)
    }
}

/// Template for directory listing page header
const HTML_DIR_LISTING_HEADER: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Directory listing for {path}</title>
    <style>
        body { font-family: Arial, sans-serif; margin: 40px; }
        h1 { color: #333; }
        table { border-collapse: collapse; }
        td { padding: 4px 16px 4px 0; }
        a { text-decoration: none; color: #0066cc; }
        a:hover { text-decoration: underline; }
        .directory { font-weight: bold; }
        .meta { color: #666; }
    </style>
</head>
<body>
    <h1>Directory listing for {path}</h1>
    <table>
"#;

/// Template for directory listing page footer
const HTML_DIR_LISTING_FOOTER: &str = r#"    </table>
</body>
</html>"#;

const HTML_DIR_PARENT_LINK: &str = "        <tr><td><a href=\"../\">📁 ../</a></td><td></td><td></td></tr>\n";

pub struct HtmlTemplates;

impl HtmlTemplates {
    /// Renders an autoindex page for `path`. Hidden entries are omitted and
    /// every name is escaped.
    pub fn render_directory_listing(path: &str, entries: &[DirEntry]) -> String {
        let title = escape_html(path);
        let mut html = String::with_capacity(1024 + entries.len() * 128);
        html.push_str(&HTML_DIR_LISTING_HEADER.replace("{path}", &title));

        if path != "/" {
            html.push_str(HTML_DIR_PARENT_LINK);
        }

        for entry in entries.iter().filter(|e| !e.name.starts_with('.')) {
            let (class, icon, suffix) = if entry.is_dir {
                ("directory", "📁", "/")
            } else {
                ("file", "📄", "")
            };
            let href = percent_encoding::utf8_percent_encode(&entry.name, HREF_ENCODE_SET).to_string();
            let size = match (entry.is_dir, entry.size) {
                (false, Some(size)) => format_size(size),
                _ => "-".to_string(),
            };
            let modified = entry.last_modified.map(format_time).unwrap_or_default();

            html.push_str(&format!(
                "        <tr class=\"{class}\"><td><a href=\"{href}{suffix}\">{icon} {name}{suffix}</a></td><td class=\"meta\">{size}</td><td class=\"meta\">{modified}</td></tr>\n",
                name = escape_html(&entry.name),
            ));
        }

        html.push_str(HTML_DIR_LISTING_FOOTER);
        html
    }
}

const HREF_ENCODE_SET: &percent_encoding::AsciiSet = &percent_encoding::CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn format_size(size: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if size < 1024 {
        return format!("{} B", size);
    }
    let mut value = size as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{:.1} {}", value, unit)
}

fn format_time(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string()
}
