//! Request body for POST/PUT operations.

use bytes::Bytes;

/// Request body with an optional content type.
///
/// The engine sends `Content-Length` for every body, and `Content-Type`
/// when one is given and the caller did not set the header already.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestBody {
    data: Bytes,
    content_type: Option<String>,
}

impl RequestBody {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length in bytes, sent as `Content-Length`.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        RequestBody::new(s)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(v: Vec<u8>) -> Self {
        RequestBody::new(v)
    }
}

impl From<&str> for RequestBody {
    fn from(s: &str) -> Self {
        RequestBody::new(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Bytes> for RequestBody {
    fn from(b: Bytes) -> Self {
        RequestBody::new(b)
    }
}
