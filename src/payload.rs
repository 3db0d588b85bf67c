//! Operation payloads: buffered [`Content`], streaming [`Reader`], the
//! deferred single-shot [`LazyValue`], and the pluggable [`Serializer`].
//!
//! Serialization headers travel in the HTTP `Content-*` namespace. On the
//! payload side they are projected into a plain map with the `content-`
//! prefix stripped and keys lower-cased (`content-type: application/json`
//! becomes `type: application/json`); rendering onto the wire re-adds the
//! prefix.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt, TryStreamExt};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{de::DeserializeOwned, Serialize};

use crate::{error::PayloadError, CONTENT_TYPE_JSON, CONTENT_TYPE_OCTET_STREAM};

/// A boxed stream of body bytes.
pub type BodyStream = futures::stream::BoxStream<'static, std::io::Result<Bytes>>;

/// Key of the projected content-type entry in a payload header map.
pub const HEADER_TYPE: &str = "type";

/// Key of the projected content-length entry in a payload header map.
pub const HEADER_LENGTH: &str = "length";

/// A fully-buffered payload together with its serialization headers.
///
/// Header keys are the lower-case suffixes of the corresponding `Content-*`
/// HTTP headers, e.g. [`HEADER_TYPE`] for `Content-Type`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Content {
    /// Projected serialization headers.
    pub header: HashMap<String, String>,

    /// Payload bytes.
    pub data: Bytes,
}

impl Content {
    /// An empty payload: no body, no content type.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A raw byte payload with content type `application/octet-stream`.
    #[must_use]
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            header: HashMap::from([(
                HEADER_TYPE.to_owned(),
                CONTENT_TYPE_OCTET_STREAM.to_owned(),
            )]),
            data: data.into(),
        }
    }

    /// The projected content type, if any.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header.get(HEADER_TYPE).map(String::as_str)
    }
}

/// A streaming payload body with its projected transport headers.
///
/// The stream holds the sole live reference to the underlying connection;
/// dropping the reader releases it.
pub struct Reader {
    stream: BodyStream,

    /// Projected `Content-*` headers of the message the body arrived on.
    pub header: HashMap<String, String>,
}

impl Reader {
    /// Wrap a body stream and its projected headers.
    #[must_use]
    pub fn new(stream: BodyStream, header: HashMap<String, String>) -> Self {
        Self { stream, header }
    }

    /// A reader over an already-buffered payload. Used for completions and
    /// in tests.
    #[must_use]
    pub fn from_content(content: Content) -> Self {
        Self {
            stream: stream::once(async move { Ok(content.data) }).boxed(),
            header: content.header,
        }
    }

    /// Drain the stream into a single buffer.
    ///
    /// # Errors
    ///
    /// Returns any I/O error surfaced by the underlying stream.
    pub async fn read_to_end(self) -> std::io::Result<Bytes> {
        collect_stream(self.stream).await
    }

    /// Take the raw stream for manual consumption.
    #[must_use]
    pub fn into_stream(self) -> BodyStream {
        self.stream
    }
}

impl core::fmt::Debug for Reader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Reader")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

/// Drain a body stream into one contiguous buffer.
pub(crate) async fn collect_stream(stream: BodyStream) -> std::io::Result<Bytes> {
    let mut buf = BytesMut::new();
    let mut stream = stream;
    while let Some(chunk) = stream.try_next().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// A deferred, single-shot decode of an operation result.
///
/// Couples the response body stream with the serializer that should decode
/// it. The stream is consumed at most once: [`consume`](Self::consume) and
/// [`into_bytes`](Self::into_bytes) take the value by move, and dropping an
/// unconsumed `LazyValue` releases the underlying connection.
#[derive(Debug)]
pub struct LazyValue<S = JsonSerializer> {
    /// The undecoded body and its projected headers.
    pub reader: Reader,
    serializer: S,
}

impl<S: Serializer> LazyValue<S> {
    /// Pair a reader with the serializer that will decode it.
    #[must_use]
    pub fn new(reader: Reader, serializer: S) -> Self {
        Self { reader, serializer }
    }

    /// Drain the stream and decode the accumulated payload.
    ///
    /// # Errors
    ///
    /// Returns any error from reading the stream or from deserialization.
    pub async fn consume<T: DeserializeOwned>(self) -> Result<T, PayloadError> {
        let Self { reader, serializer } = self;
        let header = reader.header.clone();
        let data = reader.read_to_end().await?;
        serializer.deserialize(&Content { header, data })
    }

    /// Drain the stream without decoding.
    ///
    /// # Errors
    ///
    /// Returns any I/O error surfaced by the underlying stream.
    pub async fn into_bytes(self) -> Result<Bytes, PayloadError> {
        Ok(self.reader.read_to_end().await?)
    }

    /// Hand back the embedded reader for streaming access. The caller owns
    /// the stream from here on.
    #[must_use]
    pub fn into_reader(self) -> Reader {
        self.reader
    }
}

/// Pluggable payload codec.
///
/// Implementations translate between typed values and wire [`Content`].
/// Serialization failures propagate unmodified. The trait is deliberately
/// not object-safe; the client and dispatchers are generic over it.
pub trait Serializer: Clone + Send + Sync + 'static {
    /// Encode a value into wire content.
    ///
    /// # Errors
    ///
    /// Returns an error when the value cannot be encoded.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Content, PayloadError>;

    /// Decode wire content into a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error when the content cannot be decoded as `T`.
    fn deserialize<T: DeserializeOwned>(&self, content: &Content) -> Result<T, PayloadError>;
}

/// Default serializer: JSON bodies with content type `application/json`.
///
/// An empty body decodes as JSON `null`, so `()` round-trips through an
/// absent payload. Raw byte payloads do not pass through a serializer; use
/// [`Content::from_bytes`] and [`LazyValue::into_bytes`] for those.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Content, PayloadError> {
        let data = serde_json::to_vec(value)?;
        Ok(Content {
            header: HashMap::from([(HEADER_TYPE.to_owned(), CONTENT_TYPE_JSON.to_owned())]),
            data: data.into(),
        })
    }

    fn deserialize<T: DeserializeOwned>(&self, content: &Content) -> Result<T, PayloadError> {
        if content.data.is_empty() {
            return Ok(serde_json::from_slice(b"null")?);
        }
        Ok(serde_json::from_slice(&content.data)?)
    }
}

/// Project `Content-*` HTTP headers into a stripped, lower-case map.
pub(crate) fn content_header_from_http(headers: &HeaderMap) -> HashMap<String, String> {
    let mut projected = HashMap::new();
    for (name, value) in headers {
        if let Some(suffix) = name.as_str().strip_prefix("content-") {
            if let Ok(value) = value.to_str() {
                projected.insert(suffix.to_owned(), value.to_owned());
            }
        }
    }
    projected
}

/// Render a projected payload header map back onto HTTP headers, re-adding
/// the `content-` prefix. Entries that do not form valid HTTP headers are
/// skipped.
pub(crate) fn content_header_to_http(header: &HashMap<String, String>, out: &mut HeaderMap) {
    for (key, value) in header {
        let name = format!("content-{}", key.to_ascii_lowercase());
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                out.insert(name, value);
            }
            _ => tracing::debug!(key, "skipping unrepresentable content header"),
        }
    }
}

/// Whether a `Content-Type` value denotes JSON, ignoring parameters.
pub(crate) fn is_media_type_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(CONTENT_TYPE_JSON))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn content_header_projection_round_trips() {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        headers.insert("Content-Length", HeaderValue::from_static("2"));
        headers.insert("Nexus-Request-Id", HeaderValue::from_static("r1"));

        let projected = content_header_from_http(&headers);
        assert_eq!(projected.get("type").map(String::as_str), Some("application/json"));
        assert_eq!(projected.get("length").map(String::as_str), Some("2"));
        assert!(!projected.contains_key("nexus-request-id"));

        let mut restored = HeaderMap::new();
        content_header_to_http(&projected, &mut restored);
        assert_eq!(restored.get("content-type").unwrap(), "application/json");
        assert_eq!(restored.get("content-length").unwrap(), "2");
    }

    #[test]
    fn json_serializer_round_trips_values() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Payload {
            n: u32,
            tag: String,
        }

        let serializer = JsonSerializer;
        let original = Payload {
            n: 42,
            tag: "ok".to_owned(),
        };
        let content = serializer.serialize(&original).unwrap();
        assert_eq!(content.content_type(), Some(CONTENT_TYPE_JSON));

        let decoded: Payload = serializer.deserialize(&content).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn json_serializer_decodes_empty_body_as_null() {
        let serializer = JsonSerializer;
        serializer.deserialize::<()>(&Content::empty()).unwrap();

        let opt: Option<u32> = serializer.deserialize(&Content::empty()).unwrap();
        assert_eq!(opt, None);
    }

    #[test]
    fn empty_and_byte_contents_carry_the_right_types() {
        assert_eq!(Content::empty().content_type(), None);
        assert!(Content::empty().data.is_empty());

        let content = Content::from_bytes(vec![1u8, 2, 3]);
        assert_eq!(content.content_type(), Some(CONTENT_TYPE_OCTET_STREAM));
        assert_eq!(&content.data[..], &[1, 2, 3]);
    }

    #[test]
    fn media_type_detection_ignores_parameters_and_case() {
        assert!(is_media_type_json("application/json"));
        assert!(is_media_type_json("Application/JSON; charset=utf-8"));
        assert!(!is_media_type_json("text/plain"));
        assert!(!is_media_type_json(""));
    }

    #[tokio::test]
    async fn lazy_value_consume_drains_chunked_streams() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"[1,")),
            Ok(Bytes::from_static(b"2,3]")),
        ];
        let reader = Reader::new(stream::iter(chunks).boxed(), HashMap::new());
        let lazy = LazyValue::new(reader, JsonSerializer);

        let decoded: Vec<u32> = lazy.consume().await.unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn lazy_value_into_bytes_skips_decoding() {
        let reader = Reader::from_content(Content::from_bytes(b"raw \xff bytes".to_vec()));
        let lazy = LazyValue::new(reader, JsonSerializer);
        let bytes = lazy.into_bytes().await.unwrap();
        assert_eq!(&bytes[..], b"raw \xff bytes");
    }

    #[tokio::test]
    async fn reader_surfaces_stream_errors() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("connection reset")),
        ];
        let reader = Reader::new(stream::iter(chunks).boxed(), HashMap::new());
        assert!(reader.read_to_end().await.is_err());
    }
}
