//! End-to-end tests: a real server and the client library over TCP.

use blogd_client::{Client, ClientError};
use blogd_protocol::{BlogPost, ErrorCode};
use blogd_server::{Server, ServerConfig, ServerError};
use blogd_storage::{Database, DocumentStore, StorageConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

async fn start_server(
    store: Arc<dyn DocumentStore>,
) -> (Arc<Server>, SocketAddr, JoinHandle<Result<(), ServerError>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        drain_timeout: Duration::from_secs(2),
        ..ServerConfig::new(addr)
    };
    let server = Arc::new(Server::new(config, store));

    let serving = server.clone();
    let handle = tokio::spawn(async move { serving.serve(listener).await });
    (server, addr, handle)
}

fn memory_store() -> Arc<dyn DocumentStore> {
    let db = Database::open(StorageConfig::memory("mydb")).unwrap();
    db.collection("blog").unwrap()
}

fn code(result: Result<impl std::fmt::Debug, ClientError>) -> ErrorCode {
    result.unwrap_err().code().expect("server error")
}

#[tokio::test]
async fn test_blog_lifecycle() {
    let (_server, addr, _handle) = start_server(memory_store()).await;
    let client = Client::connect_to(addr).await.unwrap();

    let created = client
        .create_blog(&BlogPost::new("Will", "Hello World", "This is working"))
        .await
        .unwrap();
    assert_eq!(created.id.len(), 24);
    assert_eq!(created.author_id, "Will");

    assert_eq!(
        code(client.read_blog("aNonExistingID").await),
        ErrorCode::InvalidArgument
    );

    let read = client.read_blog(&created.id).await.unwrap();
    assert_eq!(read, created);

    let changed = BlogPost::new("James", "What's up", "Content has been changed")
        .with_id(created.id.clone());
    let updated = client.update_blog(&changed).await.unwrap();
    assert_eq!(updated, changed);
    // Same content twice leaves the post as it was.
    assert_eq!(client.update_blog(&changed).await.unwrap(), changed);
    assert_eq!(client.read_blog(&created.id).await.unwrap(), changed);

    let second = client
        .create_blog(&BlogPost::new("Ann", "Second", ""))
        .await
        .unwrap();
    let listed = client.list_blogs().await.unwrap().collect().await.unwrap();
    assert_eq!(listed, vec![changed, second.clone()]);

    assert_eq!(client.delete_blog(&created.id).await.unwrap(), created.id);
    assert_eq!(
        code(client.read_blog(&created.id).await),
        ErrorCode::NotFound
    );
    assert_eq!(
        code(client.delete_blog(&created.id).await),
        ErrorCode::NotFound
    );
    assert_eq!(
        code(
            client
                .update_blog(&BlogPost::new("x", "y", "z").with_id(created.id.clone()))
                .await
        ),
        ErrorCode::NotFound
    );

    let listed = client.list_blogs().await.unwrap().collect().await.unwrap();
    assert_eq!(listed, vec![second]);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_malformed_ids_are_invalid_argument() {
    let (_server, addr, _handle) = start_server(memory_store()).await;
    let client = Client::connect_to(addr).await.unwrap();

    for bad in ["", "xyz", "5c0a9a2e8e1b2c3d4e5f6a7", "5c0a9a2e8e1b2c3d4e5f6a7g"] {
        assert_eq!(code(client.read_blog(bad).await), ErrorCode::InvalidArgument);
        assert_eq!(code(client.delete_blog(bad).await), ErrorCode::InvalidArgument);
        assert_eq!(
            code(client.update_blog(&BlogPost::new("a", "t", "c").with_id(bad)).await),
            ErrorCode::InvalidArgument
        );
    }
}

#[tokio::test]
async fn test_empty_list() {
    let (_server, addr, _handle) = start_server(memory_store()).await;
    let client = Client::connect_to(addr).await.unwrap();

    let mut stream = client.list_blogs().await.unwrap();
    assert!(stream.next().await.is_none());
    assert_eq!(stream.received(), 0);
    assert_eq!(stream.summary().unwrap().count, 0);

    // The connection stays usable after a stream closes.
    client.ping().await.unwrap();
    assert_eq!(client.connection().pending_count(), 0);
}

#[tokio::test]
async fn test_unary_request_while_stream_unread() {
    let (_server, addr, _handle) = start_server(memory_store()).await;
    let client = Client::connect_to(addr).await.unwrap();

    let mut first = None;
    for i in 0..400 {
        let created = client
            .create_blog(&BlogPost::new("author", format!("post {}", i), "body"))
            .await
            .unwrap();
        first.get_or_insert(created);
    }
    let first = first.unwrap();

    let mut stream = client.list_blogs().await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), first);

    // The rest of the stream sits unread while another request completes.
    let read = tokio::time::timeout(Duration::from_secs(5), client.read_blog(&first.id))
        .await
        .expect("read stalled behind the open stream")
        .unwrap();
    assert_eq!(read, first);

    let mut rest = 0;
    while let Some(post) = stream.next().await {
        post.unwrap();
        rest += 1;
    }
    assert_eq!(rest, 399);
    assert_eq!(stream.summary().unwrap().count, 400);
}

#[tokio::test]
async fn test_concurrent_clients() {
    let (_server, addr, _handle) = start_server(memory_store()).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        tasks.push(tokio::spawn(async move {
            let client = Client::connect_to(addr).await.unwrap();
            let created = client
                .create_blog(&BlogPost::new(format!("author{}", i), "t", "c"))
                .await
                .unwrap();
            client.read_blog(&created.id).await.unwrap()
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let client = Client::connect_to(addr).await.unwrap();
    let listed = client.list_blogs().await.unwrap().collect().await.unwrap();
    assert_eq!(listed.len(), 8);
}

#[tokio::test]
async fn test_graceful_shutdown_persists() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(StorageConfig::persistent(dir.path(), "mydb")).unwrap();
    let (server, addr, handle) = start_server(db.collection("blog").unwrap()).await;

    let client = Client::connect_to(addr).await.unwrap();
    let created = client
        .create_blog(&BlogPost::new("Will", "Hello World", "This is working"))
        .await
        .unwrap();

    server.shutdown();
    handle.await.unwrap().unwrap();
    assert!(!server.is_running());
    db.close().unwrap();

    assert!(matches!(
        client.ping().await,
        Err(ClientError::ConnectionClosed | ClientError::NotConnected | ClientError::Io(_))
    ));

    let db = Database::open(StorageConfig::persistent(dir.path(), "mydb")).unwrap();
    let (_server, addr, _handle) = start_server(db.collection("blog").unwrap()).await;
    let client = Client::connect_to(addr).await.unwrap();
    assert_eq!(client.read_blog(&created.id).await.unwrap(), created);
}
