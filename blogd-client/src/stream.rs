//! Client side of a LIST_BLOG stream.

use crate::error::ClientError;
use blogd_protocol::message::{BlogPost, ListBlogSummary, Response};
use tokio::sync::mpsc;

/// A message routed by the read loop to an open stream.
#[derive(Debug)]
pub(crate) enum StreamMessage {
    Item(BlogPost),
    End(Response),
}

/// Posts streamed by the server for one LIST_BLOG request.
///
/// `next` yields posts in server order and returns `None` once the server
/// closes the stream cleanly. An abort from the server, or the connection
/// going away before the stream ends, is yielded once as an error.
/// Dropping the stream early discards the remaining items.
#[derive(Debug)]
pub struct ListStream {
    request_id: String,
    rx: mpsc::UnboundedReceiver<StreamMessage>,
    received: u64,
    summary: Option<ListBlogSummary>,
    done: bool,
}

impl ListStream {
    pub(crate) fn new(request_id: String, rx: mpsc::UnboundedReceiver<StreamMessage>) -> Self {
        Self {
            request_id,
            rx,
            received: 0,
            summary: None,
            done: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Number of posts received so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// The server's closing summary, once the stream ended cleanly.
    pub fn summary(&self) -> Option<&ListBlogSummary> {
        self.summary.as_ref()
    }

    /// Receives the next post.
    pub async fn next(&mut self) -> Option<Result<BlogPost, ClientError>> {
        if self.done {
            return None;
        }

        match self.rx.recv().await {
            Some(StreamMessage::Item(blog)) => {
                self.received += 1;
                Some(Ok(blog))
            }
            Some(StreamMessage::End(response)) => {
                self.done = true;
                if let Some(error) = response.error {
                    return Some(Err(error.into()));
                }
                match response.result.map(serde_json::from_value).transpose() {
                    Ok(summary) => {
                        self.summary = summary;
                        None
                    }
                    Err(e) => Some(Err(e.into())),
                }
            }
            None => {
                self.done = true;
                Some(Err(ClientError::ConnectionClosed))
            }
        }
    }

    /// Drains the stream into a vector, failing on the first error.
    pub async fn collect(mut self) -> Result<Vec<BlogPost>, ClientError> {
        let mut posts = Vec::new();
        while let Some(post) = self.next().await {
            posts.push(post?);
        }
        Ok(posts)
    }
}
