//! Streaming multipart uploads
//!
//! Builds the multipart/form-data envelope through a producer/consumer
//! pipe: a spawned writer task serializes parts into a bounded channel and
//! the HTTP transport consumes it as the request body, so arbitrarily
//! large files never sit in memory. File parts are base64-encoded in fixed
//! size chunks with progress accounting, and an interrupted upload resumes
//! from the last streamed offset instead of restarting.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, Method, Response};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::Client;
use crate::error::{ClientError, Result};
use crate::response::{check_deprecation, classify};

/// Files are read and encoded in chunks of this size.
const CHUNK_SIZE: usize = 8 * 1024 * 1024;
/// Uploads retry on transport errors and 5xx responses only.
const MULTIPART_MAX_ATTEMPTS: u32 = 3;
const MULTIPART_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Progress callbacks fire at most once per quantum of total size.
const PROGRESS_QUANTUM_PERCENT: u64 = 5;

/// Receives `(bytes_uploaded, total_bytes)` pairs as the upload advances.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, bytes_uploaded: u64, total_bytes: u64);
}

/// One file part of a multipart upload.
#[derive(Debug, Clone)]
pub struct FilePart {
    pub field_name: String,
    pub path: PathBuf,
    /// Defaults to the path's file name.
    pub file_name: Option<String>,
    /// Defaults to `application/octet-stream`.
    pub content_type: Option<String>,
    /// Extra MIME headers installed on this part.
    pub extra_headers: Vec<(String, String)>,
}

impl FilePart {
    pub fn new(field_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            field_name: field_name.into(),
            path: path.into(),
            file_name: None,
            content_type: None,
            extra_headers: Vec::new(),
        }
    }

    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    fn effective_file_name(&self) -> String {
        self.file_name.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.field_name.clone())
        })
    }
}

/// A multipart upload: file parts, plain form fields and an optional
/// progress sink.
#[derive(Clone, Default)]
pub struct MultipartUpload {
    pub files: Vec<FilePart>,
    pub fields: Vec<(String, String)>,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl MultipartUpload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, part: FilePart) -> Self {
        self.files.push(part);
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }
}

/// Raw-byte offset already streamed, shared between attempts so a retry
/// seeks instead of restarting.
#[derive(Debug, Default)]
struct UploadState {
    last_uploaded_byte: Mutex<u64>,
}

impl UploadState {
    fn offset(&self) -> u64 {
        *self.last_uploaded_byte.lock()
    }

    fn advance(&self, bytes: u64) {
        *self.last_uploaded_byte.lock() += bytes;
    }
}

pin_project! {
    /// AsyncRead adapter that advances the shared upload offset and fires
    /// quantized progress callbacks as file bytes flow through it.
    struct ProgressReader<R> {
        #[pin]
        inner: R,
        state: Arc<UploadState>,
        progress: Option<Arc<dyn ProgressSink>>,
        total: u64,
        reported_quanta: u64,
    }
}

impl<R> ProgressReader<R> {
    fn new(
        inner: R,
        state: Arc<UploadState>,
        progress: Option<Arc<dyn ProgressSink>>,
        total: u64,
    ) -> Self {
        let reported_quanta = if total > 0 {
            state.offset() * 100 / total / PROGRESS_QUANTUM_PERCENT
        } else {
            0
        };
        Self {
            inner,
            state,
            progress,
            total,
            reported_quanta,
        }
    }
}

impl<R: AsyncRead> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = (buf.filled().len() - before) as u64;
                if read > 0 {
                    this.state.advance(read);
                    if let Some(sink) = this.progress {
                        if *this.total > 0 {
                            let uploaded = this.state.offset().min(*this.total);
                            let quanta = uploaded * 100 / *this.total / PROGRESS_QUANTUM_PERCENT;
                            if quanta > *this.reported_quanta {
                                *this.reported_quanta = quanta;
                                sink.on_progress(uploaded, *this.total);
                            }
                        }
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Base64 encoder that carries the sub-triplet remainder across chunk
/// boundaries so the output is one continuous stream.
#[derive(Default)]
struct Base64StreamEncoder {
    carry: Vec<u8>,
}

impl Base64StreamEncoder {
    fn encode_chunk(&mut self, input: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(input);
        let keep = data.len() % 3;
        self.carry = data.split_off(data.len() - keep);
        STANDARD.encode(&data)
    }

    fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.carry);
        if rest.is_empty() {
            String::new()
        } else {
            STANDARD.encode(&rest)
        }
    }
}

async fn emit(tx: &mpsc::Sender<std::io::Result<Bytes>>, bytes: Bytes) -> Result<()> {
    tx.send(Ok(bytes)).await.map_err(|_| ClientError::Cancelled)
}

/// Mirrors an I/O failure into the pipe (so the transport aborts the
/// request body with it) and returns it for the writer task.
async fn fail_pipe(tx: &mpsc::Sender<std::io::Result<Bytes>>, err: std::io::Error) -> ClientError {
    let mirrored = std::io::Error::new(err.kind(), err.to_string());
    tx.send(Err(mirrored)).await.ok();
    ClientError::IoError(err)
}

/// Serializes the whole multipart envelope into the pipe: one part per
/// form field, one per file, terminated by the closing boundary. The
/// first `resume_from` raw file bytes are skipped via seek.
#[allow(clippy::too_many_arguments)]
async fn write_envelope(
    tx: mpsc::Sender<std::io::Result<Bytes>>,
    files: Vec<FilePart>,
    fields: Vec<(String, String)>,
    boundary: String,
    state: Arc<UploadState>,
    progress: Option<Arc<dyn ProgressSink>>,
    total: u64,
    resume_from: u64,
) -> Result<()> {
    for (name, value) in &fields {
        let part = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        );
        emit(&tx, Bytes::from(part)).await?;
    }

    let mut remaining_skip = resume_from;
    let mut buf = vec![0u8; CHUNK_SIZE];
    for part in &files {
        let mut header = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n",
            field = part.field_name,
            filename = part.effective_file_name(),
        );
        header.push_str(&format!(
            "Content-Type: {}\r\n",
            part.content_type
                .as_deref()
                .unwrap_or("application/octet-stream")
        ));
        header.push_str("Content-Transfer-Encoding: base64\r\n");
        for (name, value) in &part.extra_headers {
            header.push_str(&format!("{name}: {value}\r\n"));
        }
        header.push_str("\r\n");
        emit(&tx, Bytes::from(header)).await?;

        let mut file = match File::open(&part.path).await {
            Ok(file) => file,
            Err(err) => return Err(fail_pipe(&tx, err).await),
        };
        let size = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(err) => return Err(fail_pipe(&tx, err).await),
        };
        let skip = remaining_skip.min(size);
        if skip > 0 {
            if let Err(err) = file.seek(SeekFrom::Start(skip)).await {
                return Err(fail_pipe(&tx, err).await);
            }
            remaining_skip -= skip;
        }

        let mut reader = ProgressReader::new(file, state.clone(), progress.clone(), total);
        let mut encoder = Base64StreamEncoder::default();
        loop {
            let read = match reader.read(&mut buf).await {
                Ok(read) => read,
                Err(err) => return Err(fail_pipe(&tx, err).await),
            };
            if read == 0 {
                break;
            }
            let encoded = encoder.encode_chunk(&buf[..read]);
            if !encoded.is_empty() {
                emit(&tx, Bytes::from(encoded)).await?;
            }
        }
        let tail = encoder.finish();
        if !tail.is_empty() {
            emit(&tx, Bytes::from(tail)).await?;
        }
        emit(&tx, Bytes::from_static(b"\r\n")).await?;
    }

    emit(&tx, Bytes::from(format!("--{boundary}--\r\n"))).await
}

/// Buffered multipart encoding for messages small enough to sit in
/// memory; the streaming path above is for everything else.
pub(crate) fn encode_inline_multipart(
    fields: &[(String, String)],
    files: &[(String, Vec<u8>)],
) -> (Vec<u8>, String) {
    let boundary = format!("restkit-{}", Uuid::new_v4().simple());
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    for (name, data) in files {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\nContent-Transfer-Encoding: base64\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(STANDARD.encode(data).as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    (body, format!("multipart/form-data; boundary={boundary}"))
}

impl Client {
    /// Streams a multipart upload to the backend. POST and PUT only.
    ///
    /// Retries up to three times, two seconds apart, on transport errors
    /// and 5xx responses; a retry resumes from the last streamed byte
    /// offset. Any other failure surfaces immediately through the
    /// integration's error handler.
    pub async fn do_multipart_request(
        &self,
        method: Method,
        endpoint: &str,
        upload: &MultipartUpload,
    ) -> Result<Response> {
        if method != Method::POST && method != Method::PUT {
            return Err(ClientError::InvalidConfiguration(format!(
                "multipart requests support POST and PUT only, got {method}"
            )));
        }

        self.auth.ensure_valid().await?;
        let (_guard, request_id) = self.admit().await?;
        let url = self.integration.construct_resource_url(endpoint)?;

        let mut total = 0u64;
        for part in &upload.files {
            total += tokio::fs::metadata(&part.path).await?.len();
        }

        let state = Arc::new(UploadState::default());
        let mut last_error: Option<ClientError> = None;

        for attempt in 1..=MULTIPART_MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(MULTIPART_RETRY_DELAY).await;
                self.governor.record_retry();
                info!(
                    request_id = %request_id,
                    attempt = attempt,
                    resume_from = state.offset(),
                    "retrying multipart upload"
                );
            }
            if let Some(pacing) = &self.pacing {
                pacing.until_ready().await;
            }

            let boundary = format!("restkit-{}", Uuid::new_v4().simple());
            let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(4);
            let writer = tokio::spawn(write_envelope(
                tx,
                upload.files.clone(),
                upload.fields.clone(),
                boundary.clone(),
                state.clone(),
                upload.progress.clone(),
                total,
                state.offset(),
            ));

            let started = Instant::now();
            let builder = self
                .build_request(&method, &url, &[], false)
                .await?
                .header(
                    CONTENT_TYPE,
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::wrap_stream(ReceiverStream::new(rx)));
            let send_result = builder.send().await;

            // The body stream is gone either way by now; the writer task
            // must not outlive the call.
            let writer_result: Result<()> = match writer.await {
                Ok(result) => result,
                Err(err) => Err(ClientError::ResponseHandling(format!(
                    "upload writer task failed: {err}"
                ))),
            };

            match send_result {
                Ok(response) => {
                    let category = classify(response.status());
                    self.governor.observe(category, started.elapsed());
                    if attempt == 1 {
                        check_deprecation(response.headers(), endpoint);
                    }

                    if response.status().is_success() {
                        match writer_result {
                            // a dropped pipe after the server already
                            // answered success is not a failure
                            Ok(()) | Err(ClientError::Cancelled) => {}
                            Err(err) => return Err(err),
                        }
                        info!(
                            request_id = %request_id,
                            bytes = total,
                            attempts = attempt,
                            "multipart upload complete"
                        );
                        return Ok(response);
                    }

                    let status = response.status().as_u16();
                    if status >= 500 && attempt < MULTIPART_MAX_ATTEMPTS {
                        warn!(
                            request_id = %request_id,
                            status = status,
                            attempt = attempt,
                            "server error during multipart upload, will retry"
                        );
                        last_error = Some(ClientError::Transient { status });
                        continue;
                    }
                    return Err(self.integration.handle_error_response(response).await);
                }
                Err(err) => {
                    warn!(
                        request_id = %request_id,
                        attempt = attempt,
                        error = %err,
                        "transport error during multipart upload"
                    );
                    last_error = Some(err.into());
                }
            }
        }

        Err(last_error.unwrap_or(ClientError::RetryExhausted {
            attempts: MULTIPART_MAX_ATTEMPTS,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_base64_carry_across_chunks() {
        let data: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        let mut encoder = Base64StreamEncoder::default();
        let mut streamed = String::new();
        for chunk in data.chunks(7) {
            streamed.push_str(&encoder.encode_chunk(chunk));
        }
        streamed.push_str(&encoder.finish());
        assert_eq!(streamed, STANDARD.encode(&data));
    }

    #[test]
    fn test_base64_empty_input() {
        let mut encoder = Base64StreamEncoder::default();
        assert_eq!(encoder.encode_chunk(&[]), "");
        assert_eq!(encoder.finish(), "");
    }

    #[test]
    fn test_inline_multipart_shape() {
        let fields = vec![("kind".to_string(), "report".to_string())];
        let files = vec![("data".to_string(), b"hello".to_vec())];
        let (body, content_type) = encode_inline_multipart(&fields, &files);
        let text = String::from_utf8(body).unwrap();

        assert!(content_type.starts_with("multipart/form-data; boundary="));
        assert!(text.contains("Content-Disposition: form-data; name=\"kind\""));
        assert!(text.contains("Content-Transfer-Encoding: base64"));
        assert!(text.contains(&STANDARD.encode(b"hello")));
        assert!(text.trim_end().ends_with("--"));
    }

    struct CountingSink {
        calls: AtomicU64,
        last: AtomicU64,
    }

    impl ProgressSink for CountingSink {
        fn on_progress(&self, bytes_uploaded: u64, _total: u64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last.store(bytes_uploaded, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_progress_reader_tracks_offset_and_quanta() {
        let data = vec![7u8; 1000];
        let state = Arc::new(UploadState::default());
        let sink = Arc::new(CountingSink {
            calls: AtomicU64::new(0),
            last: AtomicU64::new(0),
        });
        let mut reader = ProgressReader::new(
            std::io::Cursor::new(data),
            state.clone(),
            Some(sink.clone() as Arc<dyn ProgressSink>),
            1000,
        );

        let mut buf = vec![0u8; 100];
        loop {
            let read = reader.read(&mut buf).await.unwrap();
            if read == 0 {
                break;
            }
        }

        assert_eq!(state.offset(), 1000);
        assert_eq!(sink.last.load(Ordering::SeqCst), 1000);
        // 10 reads of 10% each, gated to at most one callback per read
        assert!(sink.calls.load(Ordering::SeqCst) <= 10);
        assert!(sink.calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_envelope_base64_byte_count() {
        let mut source = tempfile::NamedTempFile::new().unwrap();
        let payload = vec![42u8; 1000]; // not a multiple of 3
        source.write_all(&payload).unwrap();
        source.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let state = Arc::new(UploadState::default());
        let part = FilePart::new("file", source.path());
        let boundary = "test-boundary".to_string();
        let writer = tokio::spawn(write_envelope(
            tx,
            vec![part],
            Vec::new(),
            boundary,
            state,
            None,
            1000,
            0,
        ));

        let mut raw = Vec::new();
        while let Some(chunk) = rx.recv().await {
            raw.extend_from_slice(&chunk.unwrap());
        }
        writer.await.unwrap().unwrap();

        let text = String::from_utf8(raw).unwrap();
        let body_start = text.find("\r\n\r\n").unwrap() + 4;
        let body_end = text[body_start..].find("\r\n").unwrap() + body_start;
        let encoded = &text[body_start..body_end];

        // ceil(S * 4 / 3) rounded up to the padded quad
        assert_eq!(encoded.len(), 1000usize.div_ceil(3) * 4);
        assert_eq!(STANDARD.decode(encoded).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_envelope_resume_skips_streamed_bytes() {
        let mut source = tempfile::NamedTempFile::new().unwrap();
        let payload: Vec<u8> = (0u8..=255).cycle().take(600).collect();
        source.write_all(&payload).unwrap();
        source.flush().unwrap();

        let state = Arc::new(UploadState::default());
        state.advance(300);

        let (tx, mut rx) = mpsc::channel(64);
        let writer = tokio::spawn(write_envelope(
            tx,
            vec![FilePart::new("file", source.path())],
            Vec::new(),
            "test-boundary".to_string(),
            state.clone(),
            None,
            600,
            state.offset(),
        ));

        let mut raw = Vec::new();
        while let Some(chunk) = rx.recv().await {
            raw.extend_from_slice(&chunk.unwrap());
        }
        writer.await.unwrap().unwrap();

        let text = String::from_utf8(raw).unwrap();
        let body_start = text.find("\r\n\r\n").unwrap() + 4;
        let body_end = text[body_start..].find("\r\n").unwrap() + body_start;
        let decoded = STANDARD.decode(&text[body_start..body_end]).unwrap();

        assert_eq!(decoded, payload[300..]);
        assert_eq!(state.offset(), 600);
    }

    #[tokio::test]
    async fn test_envelope_missing_file_fails_pipe() {
        let (tx, mut rx) = mpsc::channel(64);
        let writer = tokio::spawn(write_envelope(
            tx,
            vec![FilePart::new("file", "/definitely/not/here")],
            Vec::new(),
            "test-boundary".to_string(),
            Arc::new(UploadState::default()),
            None,
            0,
            0,
        ));

        let mut saw_error = false;
        while let Some(chunk) = rx.recv().await {
            if chunk.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert!(writer.await.unwrap().is_err());
    }

    #[test]
    fn test_file_part_defaults() {
        let part = FilePart::new("payload", "/tmp/archive.zip");
        assert_eq!(part.effective_file_name(), "archive.zip");

        let named = FilePart::new("payload", "/tmp/archive.zip").file_name("renamed.zip");
        assert_eq!(named.effective_file_name(), "renamed.zip");
    }
}
