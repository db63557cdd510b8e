//! HTTP/1.1 wire parsing and serialization
//!
//! Hand-rolled request/response handling over buffered tokio streams. Bodies
//! are read fully into memory (content-length or chunked), which is what the
//! capture and intercept layers need anyway.

use crate::error::{Error, Result};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];

/// Maximum accepted request line length
const MAX_REQUEST_LINE: usize = 8192;
/// Maximum accepted total header block size
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Read one HTTP/1.1 request from the stream.
///
/// Returns `Ok(None)` on a clean end-of-stream before any request byte (the
/// keep-alive peer went away), an error on a truncated or malformed request.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<http::Request<Bytes>>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let n = reader.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Ok(None);
  }
  if line.len() > MAX_REQUEST_LINE {
    return Err(Error::invalid_request("request line too long"));
  }

  let line_text = String::from_utf8_lossy(&line);
  let parts: Vec<&str> = line_text.split_whitespace().collect();
  if parts.len() < 3 {
    return Err(Error::invalid_request(format!(
      "invalid request line: {}",
      line_text.trim_end()
    )));
  }
  let method = Method::from_bytes(parts[0].as_bytes()).map_err(http::Error::from)?;
  let uri: http::Uri = parts[1]
    .parse()
    .map_err(|_| Error::invalid_request(format!("invalid request target: {}", parts[1])))?;
  let version = parse_version(parts[2])?;

  let headers = read_headers(reader).await?;

  // CONNECT carries no body; everything else goes by the framing headers
  let body = if method == Method::CONNECT {
    Bytes::new()
  } else {
    read_framed_body(reader, &headers).await?
  };

  let mut builder = http::Request::builder()
    .method(method)
    .uri(uri)
    .version(version);
  if let Some(h) = builder.headers_mut() {
    *h = headers;
  }
  Ok(Some(builder.body(body)?))
}

/// Read one HTTP/1.1 response from the stream.
///
/// `head_request` suppresses body reading for responses to HEAD. A response
/// without framing headers is delimited by end-of-stream.
pub async fn read_response<R>(reader: &mut R, head_request: bool) -> Result<http::Response<Bytes>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let n = reader.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Err(Error::connection("connection closed before status line"));
  }
  let line_text = String::from_utf8_lossy(&line);
  let mut parts = line_text.split_whitespace();
  let version = parse_version(parts.next().unwrap_or_default())?;
  let status = parts
    .next()
    .and_then(|s| s.parse::<u16>().ok())
    .and_then(|c| StatusCode::from_u16(c).ok())
    .ok_or_else(|| Error::invalid_request("invalid status line"))?;

  let headers = read_headers(reader).await?;

  let body = if head_request || !status_allows_body(status) {
    Bytes::new()
  } else if has_framing(&headers) {
    read_framed_body(reader, &headers).await?
  } else {
    // No framing headers: the peer signals the end by closing
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Bytes::from(buf)
  };

  let mut builder = http::Response::builder().status(status).version(version);
  if let Some(h) = builder.headers_mut() {
    *h = headers;
  }
  Ok(builder.body(body)?)
}

/// Serialize a request in origin-form wire format.
///
/// A Host header is synthesized from the URI authority when absent, and a
/// Content-Length is added for non-empty bodies.
pub fn request_to_bytes(request: &http::Request<Bytes>) -> Vec<u8> {
  let mut out = Vec::new();
  out.extend(request.method().as_str().as_bytes());
  out.push(b' ');
  out.extend(request.uri().path().as_bytes());
  if let Some(q) = request.uri().query() {
    out.push(b'?');
    out.extend(q.as_bytes());
  }
  out.push(b' ');
  out.extend(format!("{:?}", request.version()).as_bytes());
  out.extend(CR_LF);
  if request.headers().get(http::header::HOST).is_none() {
    if let Some(authority) = request.uri().authority() {
      out.extend(http::header::HOST.as_str().as_bytes());
      out.extend(COLON_SPACE);
      out.extend(authority.as_str().as_bytes());
      out.extend(CR_LF);
    }
  }
  let mut headers = request.headers().clone();
  if !request.body().is_empty() {
    headers
      .entry(http::header::CONTENT_LENGTH)
      .or_insert(HeaderValue::from(request.body().len()));
  }
  for (k, v) in headers.iter() {
    out.extend(k.as_str().as_bytes());
    out.extend(COLON_SPACE);
    out.extend(v.as_bytes());
    out.extend(CR_LF);
  }
  out.extend(CR_LF);
  out.extend(request.body().as_ref());
  out
}

/// Serialize a response to wire format.
///
/// The body is already decoded in memory, so any transfer-encoding header is
/// discarded and the content-length recomputed.
pub fn response_to_bytes(response: &http::Response<Bytes>) -> Vec<u8> {
  let mut out = Vec::new();
  let status = response.status();
  out.extend(
    format!(
      "{:?} {} {}\r\n",
      response.version(),
      status.as_u16(),
      status.canonical_reason().unwrap_or("Unknown")
    )
    .as_bytes(),
  );
  for (k, v) in response.headers() {
    if k == http::header::TRANSFER_ENCODING || k == http::header::CONTENT_LENGTH {
      continue;
    }
    out.extend(k.as_str().as_bytes());
    out.extend(COLON_SPACE);
    out.extend(v.as_bytes());
    out.extend(CR_LF);
  }
  if status_allows_body(status) {
    out.extend(http::header::CONTENT_LENGTH.as_str().as_bytes());
    out.extend(COLON_SPACE);
    out.extend(response.body().len().to_string().as_bytes());
    out.extend(CR_LF);
  }
  out.extend(CR_LF);
  out.extend(response.body().as_ref());
  out
}

/// Parse a single `name: value` header line
pub(crate) fn parse_header(buffer: &[u8]) -> Result<(Option<HeaderName>, Option<HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let buffer = buffer.strip_suffix(&[b'\n']).unwrap_or(buffer);
  for (index, part) in buffer.splitn(2, |b| b == &b':').enumerate() {
    let part = part.strip_prefix(&[b' ']).unwrap_or(part);
    match index {
      0 => match HeaderName::from_bytes(part) {
        Ok(name) => k = Some(name),
        Err(err) => return Err(Error::Http(http::Error::from(err))),
      },
      1 => match HeaderValue::from_bytes(part) {
        Ok(value) => v = Some(value),
        Err(err) => return Err(Error::Http(http::Error::from(err))),
      },
      _ => {}
    }
  }
  Ok((k, v))
}

async fn read_headers<R>(reader: &mut R) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut total = 0usize;
  let mut line = Vec::new();
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 || line == b"\r\n" || line == b"\n" {
      break;
    }
    total += n;
    if total > MAX_HEADERS_SIZE {
      return Err(Error::invalid_request("headers size exceeds maximum"));
    }
    if let Ok((Some(k), Some(v))) = parse_header(&line) {
      if headers.contains_key(&k) {
        headers.append(k, v);
      } else {
        headers.insert(k, v);
      }
    }
  }
  Ok(headers)
}

async fn read_framed_body<R>(reader: &mut R, headers: &HeaderMap) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  if is_chunked(headers) {
    return Ok(Bytes::from(read_chunked_body(reader).await?));
  }
  let content_length: usize = headers
    .get(http::header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse().ok())
    .unwrap_or(0);
  if content_length == 0 {
    return Ok(Bytes::new());
  }
  let mut body = vec![0u8; content_length];
  reader.read_exact(&mut body).await?;
  Ok(Bytes::from(body))
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  loop {
    let mut size_line = Vec::new();
    let n = reader.read_until(b'\n', &mut size_line).await?;
    if n == 0 {
      return Err(Error::connection("connection closed inside chunked body"));
    }
    let size_text = String::from_utf8_lossy(&size_line);
    let size_text = size_text.trim();
    if size_text.is_empty() {
      // CRLF between a chunk and the next size line
      continue;
    }
    let size = usize::from_str_radix(size_text.split(';').next().unwrap_or_default(), 16)
      .map_err(|_| Error::invalid_request(format!("invalid chunk size: {}", size_text)))?;
    if size == 0 {
      // Trailer section, up to the terminating blank line
      loop {
        let mut trailer = Vec::new();
        let n = reader.read_until(b'\n', &mut trailer).await?;
        if n == 0 || trailer == b"\r\n" || trailer == b"\n" {
          break;
        }
      }
      break;
    }
    let mut chunk = vec![0u8; size];
    reader.read_exact(&mut chunk).await?;
    body.append(&mut chunk);
  }
  Ok(body)
}

fn parse_version(text: &str) -> Result<Version> {
  match text {
    "HTTP/0.9" => Ok(Version::HTTP_09),
    "HTTP/1.0" => Ok(Version::HTTP_10),
    "HTTP/1.1" => Ok(Version::HTTP_11),
    "HTTP/2.0" => Ok(Version::HTTP_2),
    "HTTP/3.0" => Ok(Version::HTTP_3),
    _ => Err(Error::invalid_request(format!(
      "invalid http version: {}",
      text
    ))),
  }
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get(http::header::TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false)
}

fn has_framing(headers: &HeaderMap) -> bool {
  headers.contains_key(http::header::CONTENT_LENGTH) || is_chunked(headers)
}

fn status_allows_body(status: StatusCode) -> bool {
  !(status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED)
}
