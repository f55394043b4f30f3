use serde::Deserialize;

/// Round 0 response: the server opens the session and issues its token.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkUploadResponse {
    pub token_upload: String,
}

/// Completion response. The body is server-defined; only `redirect` has
/// meaning to the client, the rest is surfaced verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteUploadResponse {
    #[serde(default)]
    pub redirect: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
