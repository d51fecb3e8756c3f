//! Wire protocol for the build worker and its content store.
//!
//! Two surfaces share these messages:
//! - the content store holds [`CacheEntry`] records, either wrapping a single
//!   file blob or listing the outputs an action produced;
//! - the build client POSTs a [`RemoteWorkRequest`] and reads back a
//!   [`RemoteWorkResponse`].
//!
//! Everything is length-delimited protobuf. The field numbers below are the
//! deployed wire contract; changing them breaks every existing client, so
//! don't.

/// One file in a sandbox, named by its content.
///
/// `path` is relative to the action's working directory and may contain
/// directory components. `content_key` names a [`CacheEntry`] blob wrapper in
/// the content store.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FileEntry {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(string, tag = "2")]
    pub content_key: String,
    #[prost(bool, tag = "3")]
    pub executable: bool,
}

/// A record in the content store.
///
/// Two distinct uses share this frame:
/// - blob wrapper: `file_content` holds the file's bytes, `files` is empty,
///   stored under the file's content key;
/// - action record: `file_content` is empty, `files` lists the outputs an
///   action produced, stored under the client-chosen output key.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CacheEntry {
    #[prost(message, repeated, tag = "1")]
    pub files: Vec<FileEntry>,
    #[prost(bytes = "vec", tag = "2")]
    pub file_content: Vec<u8>,
}

/// One build action: inputs by content key, a command line, an environment,
/// and the outputs the client expects back.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoteWorkRequest {
    #[prost(string, tag = "1")]
    pub output_key: String,
    #[prost(message, repeated, tag = "2")]
    pub input_files: Vec<FileEntry>,
    #[prost(string, repeated, tag = "3")]
    pub arguments: Vec<String>,
    #[prost(map = "string, string", tag = "4")]
    pub environment: std::collections::HashMap<String, String>,
    #[prost(message, repeated, tag = "5")]
    pub output_files: Vec<FileEntry>,
}

/// What the worker says back.
///
/// `success` distinguishes a failed action from a successful one; both come
/// back with HTTP 200. Infrastructure failures before the action starts are
/// HTTP 500 with `exception` set.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoteWorkResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub out: String,
    #[prost(string, tag = "3")]
    pub err: String,
    #[prost(string, tag = "4")]
    pub exception: String,
}
