//! Persisted blog document and its mapping to the wire entity.

use blogd_protocol::BlogPost;
use blogd_storage::ObjectId;
use serde::{Deserialize, Serialize};

/// A blog post as stored in the collection.
///
/// `id` is `None` only before insertion; the backend assigns it. Missing
/// text fields decode as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlogDocument {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    #[serde(default)]
    pub author_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

impl StoredBlogDocument {
    /// Builds a document from the writable fields of a post. The post's id is
    /// ignored.
    pub fn from_post(post: &BlogPost) -> Self {
        Self {
            id: None,
            author_id: post.author_id.clone(),
            title: post.title.clone(),
            content: post.content.clone(),
        }
    }

    pub fn with_id(mut self, id: ObjectId) -> Self {
        self.id = Some(id);
        self
    }
}

/// Maps a stored document to the wire entity.
pub fn to_blog_post(document: &StoredBlogDocument) -> BlogPost {
    BlogPost {
        id: document.id.map(|id| id.to_hex()).unwrap_or_default(),
        author_id: document.author_id.clone(),
        title: document.title.clone(),
        content: document.content.clone(),
    }
}
