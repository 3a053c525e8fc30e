//! Request body accumulation with resource ceilings.
//!
//! A [`ContentReceiver`] is picked from the request's content type. Form bodies go to a
//! [`FormDecoder`], everything else to a plain [`BodyBuffer`]. Both keep small bodies in memory
//! and spill larger ones to a temporary file that is removed when the receiver is dropped.
//! [`UploadLimits`] is re-checked after every chunk so oversized or disk-exhausting uploads stop
//! early.

use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use mime::Mime;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::config::HttpConfig;
use crate::protocol::RequestHeader;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("malformed request body: {reason}")]
    Decode { reason: String },

    #[error("The web server is running out of temporary space to store the upload")]
    InsufficientStorage { available: u64, required: u64 },

    #[error("The uploaded file exceeds the maximal upload size of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ContentError {
    pub fn decode<S: ToString>(str: S) -> Self {
        Self::Decode { reason: str.to_string() }
    }

    /// Status of the response that reports this error to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            ContentError::Decode { .. } => StatusCode::BAD_REQUEST,
            ContentError::InsufficientStorage { .. } | ContentError::TooLarge { .. } => StatusCode::INSUFFICIENT_STORAGE,
            ContentError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Free space lookup for the directory holding spill files.
#[cfg_attr(test, mockall::automock)]
pub trait SpaceProbe: Send + Sync {
    fn available_space(&self, path: &Path) -> io::Result<u64>;
}

/// Asks the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        fs4::available_space(path)
    }
}

/// Where and how bodies are buffered.
#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub memory_threshold: usize,
    pub dir: PathBuf,
}

impl From<&HttpConfig> for BufferSettings {
    fn from(config: &HttpConfig) -> Self {
        Self { memory_threshold: config.upload_memory_threshold, dir: config.upload_dir() }
    }
}

/// Size and free-space ceilings applied while a body streams in.
#[derive(Clone)]
pub struct UploadLimits {
    max_upload_size: u64,
    min_free_space: u64,
    probe: Arc<dyn SpaceProbe>,
}

impl UploadLimits {
    pub fn new(max_upload_size: u64, min_free_space: u64, probe: Arc<dyn SpaceProbe>) -> Self {
        Self { max_upload_size, min_free_space, probe }
    }

    pub fn from_config(config: &HttpConfig) -> Self {
        Self::new(config.max_upload_size, config.min_upload_free_space, Arc::new(FsSpaceProbe))
    }

    /// The free-space check only applies once the body lives on disk.
    pub fn check(&self, receiver: &ContentReceiver) -> Result<(), ContentError> {
        if let Some(path) = receiver.spill_path()
            && self.min_free_space > 0
        {
            let available = self.probe.available_space(path)?;
            if available < self.min_free_space {
                debug!(available, required = self.min_free_space, "not enough space to handle upload");
                return Err(ContentError::InsufficientStorage { available, required: self.min_free_space });
            }
        }

        let size = receiver.len();
        if self.max_upload_size > 0 && size > self.max_upload_size {
            debug!(size, limit = self.max_upload_size, "body is too large");
            return Err(ContentError::TooLarge { size, limit: self.max_upload_size });
        }

        Ok(())
    }
}

impl std::fmt::Debug for UploadLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadLimits")
            .field("max_upload_size", &self.max_upload_size)
            .field("min_free_space", &self.min_free_space)
            .finish_non_exhaustive()
    }
}

/// Byte storage that starts in memory and moves to a temporary file past a threshold.
#[derive(Debug)]
pub struct BodyBuffer {
    settings: BufferSettings,
    storage: Storage,
    len: u64,
}

#[derive(Debug)]
enum Storage {
    Memory(BytesMut),
    File(NamedTempFile),
}

impl BodyBuffer {
    pub fn new(settings: BufferSettings) -> Self {
        Self { settings, storage: Storage::Memory(BytesMut::new()), len: 0 }
    }

    pub fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        if let Storage::Memory(buf) = &mut self.storage
            && buf.len() + chunk.len() > self.settings.memory_threshold
        {
            let mut file = NamedTempFile::new_in(&self.settings.dir)?;
            file.write_all(buf)?;
            debug!(path = %file.path().display(), len = buf.len(), "request body spills to disk");
            self.storage = Storage::File(file);
        }

        match &mut self.storage {
            Storage::Memory(buf) => buf.extend_from_slice(chunk),
            Storage::File(file) => file.write_all(chunk)?,
        }
        self.len += chunk.len() as u64;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.storage, Storage::Memory(_))
    }

    /// Location of the spill file, once there is one.
    pub fn path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::Memory(_) => None,
            Storage::File(file) => Some(file.path()),
        }
    }

    /// The whole body, read back from disk if it was spilled.
    pub fn bytes(&self) -> io::Result<Bytes> {
        match &self.storage {
            Storage::Memory(buf) => Ok(Bytes::copy_from_slice(buf)),
            Storage::File(file) => Ok(Bytes::from(std::fs::read(file.path())?)),
        }
    }
}

/// Decoder for `application/x-www-form-urlencoded` and `multipart/form-data` bodies.
#[derive(Debug)]
pub enum FormDecoder {
    UrlEncoded { body: BodyBuffer, fields: Option<Vec<(String, String)>> },
    Multipart { boundary: String, body: BodyBuffer, tail: Vec<u8>, complete: bool },
}

impl FormDecoder {
    pub fn url_encoded(settings: BufferSettings) -> Self {
        FormDecoder::UrlEncoded { body: BodyBuffer::new(settings), fields: None }
    }

    pub fn multipart(content_type: &Mime, settings: BufferSettings) -> Result<Self, ContentError> {
        let boundary = content_type
            .get_param(mime::BOUNDARY)
            .map(|boundary| boundary.as_str().to_string())
            .filter(|boundary| !boundary.is_empty())
            .ok_or_else(|| ContentError::decode("multipart body without boundary"))?;
        Ok(FormDecoder::Multipart { boundary, body: BodyBuffer::new(settings), tail: vec![], complete: false })
    }

    pub fn offer(&mut self, chunk: &[u8], last: bool) -> Result<(), ContentError> {
        match self {
            FormDecoder::UrlEncoded { body, fields } => {
                body.write(chunk)?;
                if last {
                    let data = body.bytes()?;
                    let decoded = serde_urlencoded::from_bytes::<Vec<(String, String)>>(&data)
                        .map_err(ContentError::decode)?;
                    *fields = Some(decoded);
                }
            }
            FormDecoder::Multipart { boundary, body, tail, complete } => {
                body.write(chunk)?;
                if !*complete {
                    // the delimiter may straddle chunks; anything after it is epilogue
                    let closing = closing_delimiter(boundary);
                    tail.extend_from_slice(chunk);
                    if tail.windows(closing.len()).any(|window| window == closing.as_bytes()) {
                        *complete = true;
                        tail.clear();
                    } else if tail.len() >= closing.len() {
                        tail.drain(..=tail.len() - closing.len());
                    }
                }
                if last && !*complete {
                    return Err(ContentError::decode("multipart body is missing its closing delimiter"));
                }
            }
        }
        Ok(())
    }

    /// Decoded fields of a completed urlencoded form.
    pub fn fields(&self) -> Option<&[(String, String)]> {
        match self {
            FormDecoder::UrlEncoded { fields, .. } => fields.as_deref(),
            FormDecoder::Multipart { .. } => None,
        }
    }

    pub fn boundary(&self) -> Option<&str> {
        match self {
            FormDecoder::UrlEncoded { .. } => None,
            FormDecoder::Multipart { boundary, .. } => Some(boundary),
        }
    }

    pub fn is_complete(&self) -> bool {
        match self {
            FormDecoder::UrlEncoded { fields, .. } => fields.is_some(),
            FormDecoder::Multipart { complete, .. } => *complete,
        }
    }

    /// The undecoded body; multipart parts are split by whoever handles the request.
    pub fn raw(&self) -> &BodyBuffer {
        match self {
            FormDecoder::UrlEncoded { body, .. } | FormDecoder::Multipart { body, .. } => body,
        }
    }
}

fn closing_delimiter(boundary: &str) -> String {
    format!("--{boundary}--")
}

/// Accumulates one request body.
#[derive(Debug)]
pub enum ContentReceiver {
    Form(FormDecoder),
    Raw(BodyBuffer),
}

impl ContentReceiver {
    /// Picks form decoding or raw buffering from the request's `Content-Type`.
    pub fn for_request(header: &RequestHeader, settings: BufferSettings) -> Result<Self, ContentError> {
        let content_type = header.content_type().and_then(|value| value.parse::<Mime>().ok());
        let receiver = match content_type {
            Some(value) if value.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str() => {
                ContentReceiver::Form(FormDecoder::url_encoded(settings))
            }
            Some(value) if value.essence_str() == mime::MULTIPART_FORM_DATA.essence_str() => {
                ContentReceiver::Form(FormDecoder::multipart(&value, settings)?)
            }
            _ => ContentReceiver::Raw(BodyBuffer::new(settings)),
        };
        Ok(receiver)
    }

    pub fn offer(&mut self, chunk: &[u8], last: bool) -> Result<(), ContentError> {
        match self {
            ContentReceiver::Form(decoder) => decoder.offer(chunk, last),
            ContentReceiver::Raw(buffer) => Ok(buffer.write(chunk)?),
        }
    }

    pub fn len(&self) -> u64 {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    pub fn spill_path(&self) -> Option<&Path> {
        self.buffer().path()
    }

    pub fn bytes(&self) -> io::Result<Bytes> {
        self.buffer().bytes()
    }

    pub fn form(&self) -> Option<&FormDecoder> {
        match self {
            ContentReceiver::Form(decoder) => Some(decoder),
            ContentReceiver::Raw(_) => None,
        }
    }

    fn buffer(&self) -> &BodyBuffer {
        match self {
            ContentReceiver::Form(decoder) => decoder.raw(),
            ContentReceiver::Raw(buffer) => buffer,
        }
    }
}
