//! Blog request handlers.
//!
//! `BlogService` is stateless apart from its shared collection handle. Each
//! operation is a single storage call (two for UPDATE_BLOG) and runs
//! independently of every other; nothing here locks across calls.

use crate::blog::{to_blog_post, StoredBlogDocument};
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::session::{Session, SessionState};
use blogd_protocol::message::*;
use blogd_protocol::PROTOCOL_VERSION;
use blogd_storage::{from_document, to_document, Cursor, DocumentStore, Filter, ObjectId};
use prometheus::HistogramTimer;
use serde_json::{json, Value};
use std::sync::Arc;

/// Server identity reported on HELLO.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: "blogd".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Handles blog requests against one collection.
pub struct BlogService {
    store: Arc<dyn DocumentStore>,
    info: ServerInfo,
    metrics: Option<Arc<Metrics>>,
}

/// Decodes a wire identifier.
fn parse_id(blog_id: &str) -> Result<ObjectId, ServerError> {
    ObjectId::from_hex(blog_id)
        .map_err(|e| ServerError::InvalidArgument(format!("can't parse ID: {}", e)))
}

fn parse_params<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T, ServerError> {
    // Requests without params carry `null`.
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params.clone()
    };
    serde_json::from_value(params).map_err(|e| ServerError::InvalidRequest(e.to_string()))
}

pub(crate) fn error_response(id: &str, error: &ServerError) -> Response {
    let mut body = ResponseError::new(error.error_code(), error.to_string())
        .with_retryable(error.is_retryable());
    if let ServerError::UnsupportedProtocol(_) = error {
        body = body.with_detail("supported_version", PROTOCOL_VERSION);
    }
    Response::error(id, body)
}

impl BlogService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            info: ServerInfo::default(),
            metrics: None,
        }
    }

    pub fn with_info(mut self, info: ServerInfo) -> Self {
        self.info = info;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Updates gauge metrics from the current collection state.
    pub fn update_gauge_metrics(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .documents_total
                .set(self.store.count_documents() as f64);
        }
    }

    fn record_request(&self, op: Operation) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .requests_total
                .with_label_values(&[op.as_str()])
                .inc();
        }
    }

    fn record_error(&self, error: &ServerError) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .errors_total
                .with_label_values(&[error.error_code().as_str()])
                .inc();
        }
    }

    fn start_timer(&self, op: Operation) -> Option<HistogramTimer> {
        self.metrics.as_ref().map(|m| {
            m.request_duration
                .with_label_values(&[op.as_str()])
                .start_timer()
        })
    }

    /// Handles a unary request and returns its response.
    ///
    /// LIST_BLOG is answered with a stream and must go through `open_list`.
    pub fn handle(&self, session: &mut Session, request: &Request) -> Response {
        session.record_request();
        let timer = self.start_timer(request.op);

        let result = match request.op {
            Operation::Hello => self.handle_hello(session, &request.params),
            Operation::Ping => Ok(json!({"pong": true})),
            Operation::Bye => {
                session.set_state(SessionState::Closing);
                Ok(json!({"goodbye": true}))
            }
            Operation::CreateBlog => self.handle_create_blog(&request.params),
            Operation::ReadBlog => self.handle_read_blog(&request.params),
            Operation::UpdateBlog => self.handle_update_blog(&request.params),
            Operation::DeleteBlog => self.handle_delete_blog(&request.params),
            Operation::ListBlog => Err(ServerError::InvalidRequest(
                "LIST_BLOG is a streaming operation".to_string(),
            )),
        };

        self.record_request(request.op);
        if let Err(ref e) = result {
            tracing::debug!("{} failed: {}", request.op.as_str(), e);
            self.record_error(e);
        }
        drop(timer);
        self.update_gauge_metrics();

        match result {
            Ok(value) => Response::ok(&request.id, value),
            Err(e) => error_response(&request.id, &e),
        }
    }

    fn handle_hello(&self, session: &mut Session, params: &Value) -> Result<Value, ServerError> {
        let hello: HelloParams = parse_params(params)?;
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::UnsupportedProtocol(hello.protocol_version));
        }

        session.complete_handshake(hello.protocol_version, hello.client_name);

        let result = HelloResult {
            protocol_version: PROTOCOL_VERSION,
            server_name: self.info.name.clone(),
            server_version: self.info.version.clone(),
            session_id: session.id.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    fn handle_create_blog(&self, params: &Value) -> Result<Value, ServerError> {
        let p: BlogParams = parse_params(params)?;
        let blog = self.create_blog(&p.blog)?;
        Ok(serde_json::to_value(BlogResult { blog })?)
    }

    fn handle_read_blog(&self, params: &Value) -> Result<Value, ServerError> {
        let p: BlogIdParams = parse_params(params)?;
        let blog = self.read_blog(&p.blog_id)?;
        Ok(serde_json::to_value(BlogResult { blog })?)
    }

    fn handle_update_blog(&self, params: &Value) -> Result<Value, ServerError> {
        let p: BlogParams = parse_params(params)?;
        let blog = self.update_blog(&p.blog)?;
        Ok(serde_json::to_value(BlogResult { blog })?)
    }

    fn handle_delete_blog(&self, params: &Value) -> Result<Value, ServerError> {
        let p: BlogIdParams = parse_params(params)?;
        let blog_id = self.delete_blog(&p.blog_id)?;
        Ok(serde_json::to_value(DeleteBlogResult { blog_id })?)
    }

    /// Inserts a new post. The input id is ignored; the returned post carries
    /// the identifier assigned by the store.
    pub fn create_blog(&self, post: &BlogPost) -> Result<BlogPost, ServerError> {
        let document = StoredBlogDocument::from_post(post);
        let stored = to_document(&document)
            .map_err(|e| ServerError::Internal(format!("internal error: {}", e)))?;

        let result = self
            .store
            .insert_one(stored)
            .map_err(|e| ServerError::from_storage("internal error", e))?;

        let id = ObjectId::from_value(&result.inserted_id).ok_or_else(|| {
            ServerError::Internal(format!("can't convert to OID: {}", result.inserted_id))
        })?;

        tracing::debug!("Created blog {}", id);
        Ok(to_blog_post(&document.with_id(id)))
    }

    /// Fetches and decodes one post. A document that exists but does not
    /// decode is reported as not found.
    fn fetch(&self, id: ObjectId) -> Result<StoredBlogDocument, ServerError> {
        let not_found = |cause: String| {
            ServerError::NotFound(format!("can't find blog with that ID: {}", cause))
        };

        let found = self
            .store
            .find_one(&Filter::by_id(id))
            .map_err(|e| ServerError::from_storage("internal error", e))?;

        match found {
            Some(document) => from_document::<StoredBlogDocument>(document)
                .map_err(|e| not_found(format!("{}: {}", id, e))),
            None => Err(not_found(id.to_hex())),
        }
    }

    /// Reads one post by wire identifier.
    pub fn read_blog(&self, blog_id: &str) -> Result<BlogPost, ServerError> {
        let id = parse_id(blog_id)?;
        let document = self.fetch(id)?;
        Ok(to_blog_post(&document))
    }

    /// Replaces author, title and content of an existing post.
    ///
    /// This is fetch-then-replace without a version check: concurrent
    /// updates of the same post race and the last replace wins.
    pub fn update_blog(&self, post: &BlogPost) -> Result<BlogPost, ServerError> {
        let id = parse_id(&post.id)?;

        let mut document = self.fetch(id)?;
        document.author_id = post.author_id.clone();
        document.title = post.title.clone();
        document.content = post.content.clone();

        let replacement = to_document(&document)
            .map_err(|e| ServerError::Internal(format!("can't update blog: {}", e)))?;
        let result = self
            .store
            .replace_one(&Filter::by_id(id), replacement)
            .map_err(|e| ServerError::from_storage("can't update blog", e))?;

        // Deleted between fetch and replace.
        if result.matched_count == 0 {
            return Err(ServerError::NotFound(format!(
                "can't find blog with that ID: {}",
                id
            )));
        }

        tracing::debug!("Updated blog {} (modified={})", id, result.modified_count);
        Ok(to_blog_post(&document))
    }

    /// Deletes one post and echoes the identifier as sent.
    pub fn delete_blog(&self, blog_id: &str) -> Result<String, ServerError> {
        let id = parse_id(blog_id)?;

        let result = self
            .store
            .delete_one(&Filter::by_id(id))
            .map_err(|e| ServerError::from_storage("can't delete blog", e))?;

        if result.deleted_count == 0 {
            return Err(ServerError::NotFound(format!(
                "can't find blog to delete: {}",
                blog_id
            )));
        }

        tracing::debug!("Deleted blog {}", id);
        Ok(blog_id.to_string())
    }

    /// Opens a stream over every post in natural order.
    pub fn list_blogs(&self) -> Result<BlogStream, ServerError> {
        let cursor = self
            .store
            .find(&Filter::All)
            .map_err(|e| ServerError::from_storage("unknown internal error", e))?;
        Ok(BlogStream::new(cursor, self.metrics.clone()))
    }

    /// Starts a LIST_BLOG request. On failure returns the response that
    /// closes the stream.
    pub fn open_list(
        &self,
        session: &mut Session,
        request: &Request,
    ) -> Result<BlogStream, Response> {
        session.record_request();
        self.record_request(request.op);

        match self.list_blogs() {
            Ok(stream) => Ok(stream.with_timer(self.start_timer(request.op))),
            Err(e) => {
                tracing::warn!("LIST_BLOG failed to open: {}", e);
                self.record_error(&e);
                Err(error_response(&request.id, &e))
            }
        }
    }

    /// Builds the response closing a LIST_BLOG stream after `sent` items.
    pub fn finish_list(
        &self,
        request_id: &str,
        sent: u64,
        outcome: Result<(), ServerError>,
    ) -> Response {
        if let Some(ref metrics) = self.metrics {
            metrics.list_items_streamed_total.inc_by(sent as f64);
        }

        match outcome {
            Ok(()) => Response::ok(request_id, json!({ "count": sent })),
            Err(e) => {
                tracing::warn!("LIST_BLOG aborted after {} items: {}", sent, e);
                self.record_error(&e);
                error_response(request_id, &e)
            }
        }
    }
}

/// Lazily decoded stream of posts over a storage cursor.
///
/// Ends after the cursor is exhausted, or after yielding a single error. The
/// cursor is released exactly once: when the stream ends, errors, or is
/// dropped early.
pub struct BlogStream {
    cursor: Option<Cursor>,
    sent: u64,
    metrics: Option<Arc<Metrics>>,
    timer: Option<HistogramTimer>,
}

impl BlogStream {
    fn new(cursor: Cursor, metrics: Option<Arc<Metrics>>) -> Self {
        if let Some(ref m) = metrics {
            m.open_cursors.inc();
        }
        Self {
            cursor: Some(cursor),
            sent: 0,
            metrics,
            timer: None,
        }
    }

    fn with_timer(mut self, timer: Option<HistogramTimer>) -> Self {
        self.timer = timer;
        self
    }

    /// Number of posts yielded so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn is_released(&self) -> bool {
        self.cursor.is_none()
    }

    fn release(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
            if let Some(ref m) = self.metrics {
                m.open_cursors.dec();
            }
        }
        if let Some(timer) = self.timer.take() {
            timer.observe_duration();
        }
    }
}

impl Iterator for BlogStream {
    type Item = Result<BlogPost, ServerError>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.cursor.as_mut()?.next();
        match next {
            None => {
                self.release();
                None
            }
            Some(Ok(document)) => match from_document::<StoredBlogDocument>(document) {
                Ok(stored) => {
                    self.sent += 1;
                    Some(Ok(to_blog_post(&stored)))
                }
                Err(e) => {
                    self.release();
                    Some(Err(ServerError::Internal(format!(
                        "error while decoding stored blog: {}",
                        e
                    ))))
                }
            },
            Some(Err(e)) => {
                self.release();
                Some(Err(ServerError::from_storage("unknown internal error", e)))
            }
        }
    }
}

impl Drop for BlogStream {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blogd_protocol::ErrorCode;
    use blogd_storage::{
        Collection, DeleteResult, Document, InsertOneResult, StorageError, UpdateResult,
    };
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn test_session() -> Session {
        Session::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 12345))
    }

    fn test_service() -> (Arc<Collection>, BlogService, Session) {
        let collection = Arc::new(Collection::new("blog"));
        let service = BlogService::new(collection.clone());
        (collection, service, test_session())
    }

    fn raw(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    /// Store whose every call fails, or whose insert reports a foreign id.
    struct BrokenStore {
        inserted_id: Option<Value>,
    }

    impl DocumentStore for BrokenStore {
        fn name(&self) -> &str {
            "broken"
        }

        fn insert_one(&self, _document: Document) -> Result<InsertOneResult, StorageError> {
            match self.inserted_id {
                Some(ref id) => Ok(InsertOneResult {
                    inserted_id: id.clone(),
                }),
                None => Err(StorageError::Backend("connection refused".into())),
            }
        }

        fn find_one(&self, _filter: &Filter) -> Result<Option<Document>, StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }

        fn replace_one(
            &self,
            _filter: &Filter,
            _replacement: Document,
        ) -> Result<UpdateResult, StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }

        fn delete_one(&self, _filter: &Filter) -> Result<DeleteResult, StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }

        fn find(&self, _filter: &Filter) -> Result<Cursor, StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }

        fn count_documents(&self) -> u64 {
            0
        }
    }

    /// Store that finds a document but loses it before the replace lands.
    struct VanishingStore {
        inner: Collection,
    }

    impl DocumentStore for VanishingStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn insert_one(&self, document: Document) -> Result<InsertOneResult, StorageError> {
            self.inner.insert_one(document)
        }

        fn find_one(&self, filter: &Filter) -> Result<Option<Document>, StorageError> {
            self.inner.find_one(filter)
        }

        fn replace_one(
            &self,
            filter: &Filter,
            replacement: Document,
        ) -> Result<UpdateResult, StorageError> {
            self.inner.delete_one(filter)?;
            self.inner.replace_one(filter, replacement)
        }

        fn delete_one(&self, filter: &Filter) -> Result<DeleteResult, StorageError> {
            self.inner.delete_one(filter)
        }

        fn find(&self, filter: &Filter) -> Result<Cursor, StorageError> {
            self.inner.find(filter)
        }

        fn count_documents(&self) -> u64 {
            self.inner.count_documents()
        }
    }

    /// Store whose cursor fails after its first document.
    struct FailingCursorStore;

    impl DocumentStore for FailingCursorStore {
        fn name(&self) -> &str {
            "failing-cursor"
        }

        fn insert_one(&self, _document: Document) -> Result<InsertOneResult, StorageError> {
            Err(StorageError::Closed)
        }

        fn find_one(&self, _filter: &Filter) -> Result<Option<Document>, StorageError> {
            Ok(None)
        }

        fn replace_one(
            &self,
            _filter: &Filter,
            _replacement: Document,
        ) -> Result<UpdateResult, StorageError> {
            Ok(UpdateResult::default())
        }

        fn delete_one(&self, _filter: &Filter) -> Result<DeleteResult, StorageError> {
            Ok(DeleteResult::default())
        }

        fn find(&self, _filter: &Filter) -> Result<Cursor, StorageError> {
            let first = raw(json!({"_id": ObjectId::new(), "author_id": "a", "title": "t", "content": "c"}));
            let items = vec![Ok(first), Err(StorageError::Backend("cursor lost".into()))];
            Ok(Cursor::new(items.into_iter()))
        }

        fn count_documents(&self) -> u64 {
            0
        }
    }

    fn example_post() -> BlogPost {
        BlogPost::new("Will", "Hello World", "This is working")
    }

    #[test]
    fn test_hello() {
        let (_c, service, mut session) = test_service();
        let request = Request::new("1", Operation::Hello).with_params(json!({
            "protocol_version": 1,
            "client_name": "test"
        }));

        let response = service.handle(&mut session, &request);
        assert!(response.is_ok());
        assert_eq!(session.state(), SessionState::Ready);
        let result = response.result.unwrap();
        assert_eq!(result["server_name"], "blogd");
        assert_eq!(result["session_id"], session.id.as_str());
    }

    #[test]
    fn test_hello_reports_server_info() {
        let (_c, service, mut session) = test_service();
        let service = service.with_info(ServerInfo {
            name: "blogd-test".to_string(),
            version: "0.0.1".to_string(),
        });
        let request = Request::new("1", Operation::Hello)
            .with_params(json!({"protocol_version": 1}));

        let result = service.handle(&mut session, &request).result.unwrap();
        assert_eq!(result["server_name"], "blogd-test");
        assert_eq!(result["server_version"], "0.0.1");
        assert_eq!(session.client_name(), None);
    }

    #[test]
    fn test_hello_unsupported_protocol_version() {
        let (_c, service, mut session) = test_service();
        let request = Request::new("1", Operation::Hello)
            .with_params(json!({"protocol_version": 999}));

        let response = service.handle(&mut session, &request);
        assert_eq!(response.error_code(), Some(ErrorCode::UnsupportedProtocol));
        assert_eq!(session.state(), SessionState::Connected);
        let error = response.error.unwrap();
        assert_eq!(error.details["supported_version"], json!(PROTOCOL_VERSION));
        assert!(!error.retryable);
    }

    #[test]
    fn test_ping_and_bye() {
        let (_c, service, mut session) = test_service();

        let response = service.handle(&mut session, &Request::new("1", Operation::Ping));
        assert_eq!(response.result.unwrap()["pong"], true);

        let response = service.handle(&mut session, &Request::new("2", Operation::Bye));
        assert!(response.is_ok());
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(session.request_count(), 2);
    }

    #[test]
    fn test_create_then_read() {
        let (collection, service, _session) = test_service();

        let created = service.create_blog(&example_post()).unwrap();
        assert_eq!(created.id.len(), 24);
        assert!(ObjectId::from_hex(&created.id).is_ok());
        assert_eq!(collection.count_documents(), 1);

        let read = service.read_blog(&created.id).unwrap();
        assert_eq!(read, created);
        assert_eq!(read.author_id, "Will");
        assert_eq!(read.title, "Hello World");
        assert_eq!(read.content, "This is working");
    }

    #[test]
    fn test_create_ignores_input_id() {
        let (_c, service, _session) = test_service();
        let post = example_post().with_id("000000000000000000000000");

        let created = service.create_blog(&post).unwrap();
        assert_ne!(created.id, "000000000000000000000000");
    }

    #[test]
    fn test_create_with_missing_fields_via_request() {
        let (_c, service, mut session) = test_service();
        let request = Request::new("1", Operation::CreateBlog)
            .with_params(json!({"blog": {"title": "only a title"}}));

        let response = service.handle(&mut session, &request);
        let blog = &response.result.unwrap()["blog"];
        assert_eq!(blog["title"], "only a title");
        assert_eq!(blog["author_id"], "");
        assert_eq!(blog["content"], "");
    }

    #[test]
    fn test_create_insert_failure_is_internal() {
        let service = BlogService::new(Arc::new(BrokenStore { inserted_id: None }));
        let err = service.create_blog(&example_post()).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Internal);
        assert!(err.to_string().contains("connection refused"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_create_foreign_inserted_id_is_internal() {
        let service = BlogService::new(Arc::new(BrokenStore {
            inserted_id: Some(json!("not-an-object-id")),
        }));
        let err = service.create_blog(&example_post()).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Internal);
        assert!(err.to_string().contains("can't convert to OID"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_malformed_ids_are_invalid_argument() {
        let (_c, service, _session) = test_service();

        for bad in ["125sda589cweFewr9", "", "zzzzzzzzzzzzzzzzzzzzzzzz"] {
            assert_eq!(
                service.read_blog(bad).unwrap_err().error_code(),
                ErrorCode::InvalidArgument
            );
            assert_eq!(
                service.delete_blog(bad).unwrap_err().error_code(),
                ErrorCode::InvalidArgument
            );
            let post = example_post().with_id(bad);
            assert_eq!(
                service.update_blog(&post).unwrap_err().error_code(),
                ErrorCode::InvalidArgument
            );
        }
    }

    #[test]
    fn test_missing_ids_are_not_found() {
        let (_c, service, _session) = test_service();
        let absent = ObjectId::new().to_hex();

        assert_eq!(
            service.read_blog(&absent).unwrap_err().error_code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            service.delete_blog(&absent).unwrap_err().error_code(),
            ErrorCode::NotFound
        );
        let post = example_post().with_id(absent);
        assert_eq!(
            service.update_blog(&post).unwrap_err().error_code(),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn test_undecodable_document_is_not_found() {
        let (collection, service, _session) = test_service();
        let result = collection
            .insert_one(raw(json!({"author_id": 42, "title": ["x"]})))
            .unwrap();
        let id = ObjectId::from_value(&result.inserted_id).unwrap();

        let err = service.read_blog(&id.to_hex()).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::NotFound);

        let err = service
            .update_blog(&example_post().with_id(id.to_hex()))
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_backend_failures_are_internal() {
        let service = BlogService::new(Arc::new(BrokenStore { inserted_id: None }));
        let id = ObjectId::new().to_hex();

        let err = service.read_blog(&id).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Internal);
        assert!(err.is_retryable());

        let err = service.delete_blog(&id).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Internal);
        assert!(err.to_string().contains("can't delete blog"));

        assert_eq!(
            service.list_blogs().err().map(|e| e.error_code()),
            Some(ErrorCode::Internal)
        );
    }

    #[test]
    fn test_update_replaces_fields_and_keeps_id() {
        let (_c, service, _session) = test_service();
        let created = service.create_blog(&example_post()).unwrap();

        let changed = BlogPost::new("James", "What's up", "Content has been changed")
            .with_id(created.id.clone());
        let updated = service.update_blog(&changed).unwrap();
        assert_eq!(updated, changed);

        let read = service.read_blog(&created.id).unwrap();
        assert_eq!(read, changed);

        // Idempotent on content.
        assert_eq!(service.update_blog(&changed).unwrap(), changed);
        assert_eq!(service.read_blog(&created.id).unwrap(), changed);
    }

    #[test]
    fn test_update_lost_to_concurrent_delete_is_not_found() {
        let store = Arc::new(VanishingStore {
            inner: Collection::new("blog"),
        });
        let service = BlogService::new(store);
        let created = service.create_blog(&example_post()).unwrap();

        let err = service
            .update_blog(&example_post().with_id(created.id))
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_delete_twice() {
        let (_c, service, _session) = test_service();
        let created = service.create_blog(&example_post()).unwrap();

        assert_eq!(service.delete_blog(&created.id).unwrap(), created.id);
        assert_eq!(
            service.delete_blog(&created.id).unwrap_err().error_code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            service.read_blog(&created.id).unwrap_err().error_code(),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn test_delete_echoes_wire_id() {
        let (_c, service, _session) = test_service();
        let created = service.create_blog(&example_post()).unwrap();
        let upper = created.id.to_uppercase();

        assert_eq!(service.delete_blog(&upper).unwrap(), upper);
    }

    #[test]
    fn test_list_empty() {
        let (collection, service, _session) = test_service();
        let mut stream = service.list_blogs().unwrap();
        assert!(stream.next().is_none());
        assert!(stream.is_released());
        assert_eq!(stream.sent(), 0);
        assert_eq!(collection.open_cursors(), 0);
    }

    #[test]
    fn test_list_in_creation_order() {
        let (collection, service, _session) = test_service();
        let mut created = Vec::new();
        for n in 0..3 {
            created.push(
                service
                    .create_blog(&BlogPost::new("a", format!("post {}", n), "c"))
                    .unwrap(),
            );
        }

        let listed: Vec<BlogPost> = service
            .list_blogs()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(listed, created);
        assert_eq!(collection.open_cursors(), 0);
    }

    #[test]
    fn test_list_aborts_on_undecodable_document() {
        let (collection, service, _session) = test_service();
        service.create_blog(&example_post()).unwrap();
        collection
            .insert_one(raw(json!({"title": 7})))
            .unwrap();
        service.create_blog(&example_post()).unwrap();

        let mut stream = service.list_blogs().unwrap();
        assert!(stream.next().unwrap().is_ok());

        let err = stream.next().unwrap().unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Internal);
        assert!(!err.is_retryable());
        assert!(stream.is_released());
        assert_eq!(collection.open_cursors(), 0);

        // Ends after the error.
        assert!(stream.next().is_none());
        assert_eq!(stream.sent(), 1);
    }

    #[test]
    fn test_list_aborts_on_cursor_error() {
        let service = BlogService::new(Arc::new(FailingCursorStore));
        let mut stream = service.list_blogs().unwrap();

        assert!(stream.next().unwrap().is_ok());
        let err = stream.next().unwrap().unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Internal);
        assert!(err.to_string().contains("cursor lost"));
        assert!(err.is_retryable());
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_list_dropped_early_releases_cursor() {
        let (collection, service, _session) = test_service();
        for _ in 0..3 {
            service.create_blog(&example_post()).unwrap();
        }

        let mut stream = service.list_blogs().unwrap();
        assert_eq!(collection.open_cursors(), 1);
        stream.next();
        drop(stream);
        assert_eq!(collection.open_cursors(), 0);
    }

    #[test]
    fn test_list_through_handle_is_rejected() {
        let (_c, service, mut session) = test_service();
        let response = service.handle(&mut session, &Request::new("1", Operation::ListBlog));
        assert_eq!(response.error_code(), Some(ErrorCode::BadRequest));
    }

    #[test]
    fn test_malformed_params_are_bad_request() {
        let (_c, service, mut session) = test_service();
        let request = Request::new("1", Operation::ReadBlog).with_params(json!({"blog_id": 5}));
        let response = service.handle(&mut session, &request);
        assert_eq!(response.error_code(), Some(ErrorCode::BadRequest));
        assert_eq!(response.id, "1");
    }

    #[test]
    fn test_request_roundtrip_through_handle() {
        let (_c, service, mut session) = test_service();

        let create = Request::new("1", Operation::CreateBlog)
            .with_params(json!({"blog": example_post()}));
        let response = service.handle(&mut session, &create);
        let id = response.result.unwrap()["blog"]["id"]
            .as_str()
            .unwrap()
            .to_string();

        let read = Request::new("2", Operation::ReadBlog).with_params(json!({"blog_id": id}));
        let response = service.handle(&mut session, &read);
        assert_eq!(response.result.unwrap()["blog"]["title"], "Hello World");

        let delete = Request::new("3", Operation::DeleteBlog).with_params(json!({"blog_id": id}));
        let response = service.handle(&mut session, &delete);
        assert_eq!(response.result.unwrap()["blog_id"], id.as_str());

        let read = Request::new("4", Operation::ReadBlog).with_params(json!({"blog_id": id}));
        let response = service.handle(&mut session, &read);
        assert_eq!(response.error_code(), Some(ErrorCode::NotFound));
        assert!(!response.error.unwrap().retryable);
    }

    #[test]
    fn test_update_without_id_is_invalid_argument() {
        let (_c, service, mut session) = test_service();
        let request = Request::new("1", Operation::UpdateBlog)
            .with_params(json!({"blog": {"title": "no id"}}));
        let response = service.handle(&mut session, &request);
        assert_eq!(response.error_code(), Some(ErrorCode::InvalidArgument));
    }

    #[test]
    fn test_metrics_recorded() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let collection = Arc::new(Collection::new("blog"));
        let service = BlogService::new(collection).with_metrics(metrics.clone());
        let mut session = test_session();

        let create = Request::new("1", Operation::CreateBlog)
            .with_params(json!({"blog": example_post()}));
        service.handle(&mut session, &create);
        let read = Request::new("2", Operation::ReadBlog).with_params(json!({"blog_id": "bad"}));
        service.handle(&mut session, &read);

        let stream = service
            .open_list(&mut session, &Request::new("3", Operation::ListBlog))
            .ok()
            .unwrap();
        assert_eq!(metrics.open_cursors.get(), 1.0);
        let count = stream.count() as u64;
        assert_eq!(metrics.open_cursors.get(), 0.0);
        let end = service.finish_list("3", count, Ok(()));
        assert_eq!(end.result.unwrap()["count"], 1);

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("blogd_requests_total{operation=\"CREATE_BLOG\"} 1"));
        assert!(encoded.contains("blogd_errors_total{code=\"INVALID_ARGUMENT\"} 1"));
        assert!(encoded.contains("blogd_documents_total 1"));
        assert!(encoded.contains("blogd_list_items_streamed_total 1"));
    }

    #[test]
    fn test_finish_list_with_error() {
        let (_c, service, _session) = test_service();
        let response = service.finish_list(
            "9",
            2,
            Err(ServerError::Internal("decode failed".into())),
        );
        assert_eq!(response.id, "9");
        assert_eq!(response.error_code(), Some(ErrorCode::Internal));
        assert!(!response.error.unwrap().retryable);

        let response = service.finish_list(
            "10",
            1,
            Err(ServerError::Unavailable("cursor lost".into())),
        );
        assert_eq!(response.error_code(), Some(ErrorCode::Internal));
        assert!(response.error.unwrap().retryable);
    }

    proptest::proptest! {
        #[test]
        fn prop_non_hex_ids_are_invalid_argument(id in "[^0-9a-fA-F]{0,40}") {
            let (_c, service, _session) = test_service();
            proptest::prop_assert_eq!(
                service.read_blog(&id).unwrap_err().error_code(),
                ErrorCode::InvalidArgument
            );
            proptest::prop_assert_eq!(
                service.delete_blog(&id).unwrap_err().error_code(),
                ErrorCode::InvalidArgument
            );
        }

        #[test]
        fn prop_wrong_length_hex_ids_are_invalid_argument(id in "[0-9a-f]{0,48}") {
            proptest::prop_assume!(id.len() != 24);
            let (_c, service, _session) = test_service();
            let post = BlogPost::new("a", "t", "c").with_id(id);
            proptest::prop_assert_eq!(
                service.update_blog(&post).unwrap_err().error_code(),
                ErrorCode::InvalidArgument
            );
        }

        #[test]
        fn prop_created_post_reads_back_unchanged(
            author in proptest::prelude::any::<String>(),
            title in proptest::prelude::any::<String>(),
            content in "(|\\PC{1,64})",
        ) {
            let (_c, service, _session) = test_service();
            let created = service
                .create_blog(&BlogPost::new(author.clone(), title.clone(), content.clone()))
                .unwrap();
            proptest::prop_assert_eq!(&created.author_id, &author);
            proptest::prop_assert_eq!(&created.title, &title);
            proptest::prop_assert_eq!(&created.content, &content);
            proptest::prop_assert_eq!(service.read_blog(&created.id).unwrap(), created);
        }

        #[test]
        fn prop_unknown_ids_are_not_found(bytes in proptest::prelude::any::<[u8; 12]>()) {
            let (_c, service, _session) = test_service();
            let id = ObjectId::from_bytes(bytes).to_hex();
            proptest::prop_assert_eq!(
                service.read_blog(&id).unwrap_err().error_code(),
                ErrorCode::NotFound
            );
            let post = BlogPost::new("a", "t", "c").with_id(id.clone());
            proptest::prop_assert_eq!(
                service.update_blog(&post).unwrap_err().error_code(),
                ErrorCode::NotFound
            );
            proptest::prop_assert_eq!(
                service.delete_blog(&id).unwrap_err().error_code(),
                ErrorCode::NotFound
            );
        }
    }
}
