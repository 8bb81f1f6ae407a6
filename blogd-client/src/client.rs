//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use crate::stream::ListStream;
use blogd_protocol::message::*;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// High-level client for blogd.
pub struct Client {
    conn: Arc<Connection>,
    read_task: Mutex<Option<JoinHandle<Result<(), ClientError>>>>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
            read_task: Mutex::new(None),
        }
    }

    /// Creates a client for `addr` and connects it.
    pub async fn connect_to(addr: SocketAddr) -> Result<Self, ClientError> {
        let client = Self::new(ConnectionConfig::new(addr));
        client.connect().await?;
        Ok(client)
    }

    /// Connects to the server and starts the background read loop.
    pub async fn connect(&self) -> Result<HelloResult, ClientError> {
        let hello = self.conn.connect().await?;

        let conn = self.conn.clone();
        let task = tokio::spawn(async move {
            let result = conn.read_loop().await;
            if let Err(ref e) = result {
                tracing::debug!("read loop ended: {}", e);
            }
            result
        });
        if let Some(previous) = self.read_task.lock().await.replace(task) {
            previous.abort();
        }

        Ok(hello)
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
        }
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    async fn request(&self, op: Operation, params: Value) -> Result<Value, ClientError> {
        let response = self.conn.request(op, params).await?;
        if let Some(error) = response.error {
            return Err(error.into());
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn request_blog(&self, op: Operation, params: Value) -> Result<BlogPost, ClientError> {
        let result: BlogResult = serde_json::from_value(self.request(op, params).await?)?;
        Ok(result.blog)
    }

    // =========================================================================
    // Session operations
    // =========================================================================

    /// Pings the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request(Operation::Ping, json!({})).await?;
        Ok(())
    }

    /// Asks the server to end the session. The server closes the connection
    /// after answering.
    pub async fn bye(&self) -> Result<(), ClientError> {
        self.request(Operation::Bye, json!({})).await?;
        Ok(())
    }

    // =========================================================================
    // Blog operations
    // =========================================================================

    /// Creates a post. Any id on `blog` is ignored; the returned post carries
    /// the identifier assigned by the server.
    pub async fn create_blog(&self, blog: &BlogPost) -> Result<BlogPost, ClientError> {
        self.request_blog(Operation::CreateBlog, json!({ "blog": blog }))
            .await
    }

    /// Reads a post by id.
    pub async fn read_blog(&self, blog_id: &str) -> Result<BlogPost, ClientError> {
        self.request_blog(Operation::ReadBlog, json!({ "blog_id": blog_id }))
            .await
    }

    /// Replaces author, title and content of the post identified by `blog.id`.
    pub async fn update_blog(&self, blog: &BlogPost) -> Result<BlogPost, ClientError> {
        self.request_blog(Operation::UpdateBlog, json!({ "blog": blog }))
            .await
    }

    /// Deletes a post and returns the id echoed by the server.
    pub async fn delete_blog(&self, blog_id: &str) -> Result<String, ClientError> {
        let result = self
            .request(Operation::DeleteBlog, json!({ "blog_id": blog_id }))
            .await?;
        let result: DeleteBlogResult = serde_json::from_value(result)?;
        Ok(result.blog_id)
    }

    /// Streams every post.
    pub async fn list_blogs(&self) -> Result<ListStream, ClientError> {
        self.conn.open_stream(Operation::ListBlog, json!({})).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Ok(mut task) = self.read_task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}
