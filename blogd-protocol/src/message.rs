//! JSON message types for BRP requests, responses and streamed items.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// BRP operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    // Session management
    Hello,
    Ping,
    Bye,

    // Blog posts
    CreateBlog,
    ReadBlog,
    UpdateBlog,
    DeleteBlog,
    ListBlog,
}

impl Operation {
    /// Returns the wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Hello => "HELLO",
            Operation::Ping => "PING",
            Operation::Bye => "BYE",
            Operation::CreateBlog => "CREATE_BLOG",
            Operation::ReadBlog => "READ_BLOG",
            Operation::UpdateBlog => "UPDATE_BLOG",
            Operation::DeleteBlog => "DELETE_BLOG",
            Operation::ListBlog => "LIST_BLOG",
        }
    }

    /// Returns whether the server answers with a stream of items.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Operation::ListBlog)
    }
}

/// Request message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Message type, always "request".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Unique request ID for correlation.
    pub id: String,

    /// Operation to perform.
    pub op: Operation,

    /// Operation-specific parameters.
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: impl Into<String>, op: Operation) -> Self {
        Self {
            msg_type: "request".to_string(),
            id: id.into(),
            op,
            params: Value::Object(Default::default()),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Error details in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    /// Stable error code.
    pub code: ErrorCode,

    /// Human-readable error message.
    pub message: String,

    /// Whether the caller may retry.
    pub retryable: bool,

    /// Additional error details.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl ResponseError {
    /// Creates a non-retryable error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
            details: HashMap::new(),
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Response message envelope.
///
/// For streaming operations the response closes the stream: it follows the
/// last item and carries either the completion result or the abort error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Message type, always "response".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Request ID this response correlates to.
    pub id: String,

    /// Response status.
    pub status: ResponseStatus,

    /// Result payload (for successful responses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error details (for error responses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            msg_type: "response".to_string(),
            id: id.into(),
            status: ResponseStatus::Ok,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ResponseError) -> Self {
        Self {
            msg_type: "response".to_string(),
            id: id.into(),
            status: ResponseStatus::Error,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }

    /// Returns the error code, if this is an error response.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// One element of a server stream (LIST_BLOG).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamItem {
    /// Message type, always "item".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Request ID of the stream this item belongs to.
    pub id: String,

    /// The streamed post.
    pub blog: BlogPost,
}

impl StreamItem {
    pub fn new(id: impl Into<String>, blog: BlogPost) -> Self {
        Self {
            msg_type: "item".to_string(),
            id: id.into(),
            blog,
        }
    }
}

// ============================================================================
// Blog wire types
// ============================================================================

/// A blog post as seen by callers.
///
/// `id` is the hex form of the backend identifier. It is empty on create
/// requests and assigned by the server. Missing fields decode as empty
/// strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlogPost {
    pub id: String,
    pub author_id: String,
    pub title: String,
    pub content: String,
}

impl BlogPost {
    /// Creates a post without an identifier, as sent on CREATE_BLOG.
    pub fn new(
        author_id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            author_id: author_id.into(),
            title: title.into(),
            content: content.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

// ============================================================================
// Operation-specific parameter types
// ============================================================================

/// Parameters for HELLO request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: u16,
    #[serde(default)]
    pub client_name: Option<String>,
}

/// Result for HELLO response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: u16,
    pub server_name: String,
    pub server_version: String,
    pub session_id: String,
}

/// Parameters for CREATE_BLOG and UPDATE_BLOG requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlogParams {
    #[serde(default)]
    pub blog: BlogPost,
}

/// Result for CREATE_BLOG, READ_BLOG and UPDATE_BLOG responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlogResult {
    pub blog: BlogPost,
}

/// Parameters for READ_BLOG and DELETE_BLOG requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlogIdParams {
    #[serde(default)]
    pub blog_id: String,
}

/// Result for DELETE_BLOG response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteBlogResult {
    pub blog_id: String,
}

/// Result carried by the response that closes a LIST_BLOG stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListBlogSummary {
    /// Number of items sent before the stream closed.
    pub count: u64,
}
