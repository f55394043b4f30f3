use std::{fs::File, io::Read, ops::Range, path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use futures::stream::BoxStream;
use reqwest::{
    Client, StatusCode,
    multipart::{Form, Part},
};
use url::Url;

use crate::rest_types::{ChunkUploadResponse, CompleteUploadResponse};

const MEGABYTE: u64 = 1024 * 1024; // 1MB
pub const CHUNK_SIZE_BYTES: u64 = MEGABYTE;

/// Delay before retrying a round that failed with a transient status.
/// Retries are unbounded and the delay never grows.
pub const RETRY_DELAY: Duration = Duration::from_millis(3000);

pub const CHUNK_UPLOAD_ROUTE: &str = "upload/chunk";
pub const COMPLETE_UPLOAD_ROUTE: &str = "upload/complete";

pub const MSG_FORM_REJECTED: &str = "The upload was rejected. Check the form and try again.";
pub const MSG_FILES_TOO_LARGE: &str = "The selected files are too large to upload.";
pub const MSG_UPLOAD_EXPIRED: &str = "The upload session expired. Start the upload again.";
pub const MSG_INCOMPATIBLE_FILES: &str = "The selected files are not compatible with this upload.";

/// A named file input, keyed the way the server expects its form field.
#[derive(Clone, Debug)]
pub struct FileInput {
    pub field: String,
    pub path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct PlannedFile {
    pub field: String,
    pub path: PathBuf,
    pub file_name: String,
    pub extension: String,
    pub size: u64,
    pub chunk_count: u64,
}

/// The immutable upload plan, captured in full before round 0 is sent.
/// `total_size` declared at completion must equal the sum recorded here.
#[derive(Clone, Debug)]
pub struct UploadPlan {
    pub files: Vec<PlannedFile>,
    pub rounds: u64,
    pub total_size: u64,
}

pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE_BYTES)
}

/// Byte range a file contributes to the given round, or `None` once the
/// file is exhausted (it still gets an empty placeholder field on the wire).
pub fn round_range(size: u64, round: u64) -> Option<Range<u64>> {
    let start = round * CHUNK_SIZE_BYTES;
    if start >= size {
        return None;
    }
    Some(start..size.min(start + CHUNK_SIZE_BYTES))
}

pub fn plan_upload(inputs: &[FileInput]) -> Result<UploadPlan> {
    if inputs.is_empty() {
        bail!("No files selected for upload");
    }

    let mut files = Vec::with_capacity(inputs.len());
    for input in inputs {
        if files
            .iter()
            .any(|planned: &PlannedFile| planned.field == input.field)
        {
            bail!("Duplicate input identifier '{}'", input.field);
        }

        let metadata = std::fs::metadata(&input.path)
            .with_context(|| format!("No file selected for input '{}'", input.field))?;
        if !metadata.is_file() {
            bail!(
                "Input '{}' is not a regular file: {}",
                input.field,
                input.path.display()
            );
        }

        let file_name = input
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| input.field.clone());
        let extension = input
            .path
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();

        files.push(PlannedFile {
            field: input.field.clone(),
            path: input.path.clone(),
            file_name,
            extension,
            size: metadata.len(),
            chunk_count: chunk_count(metadata.len()),
        });
    }

    let rounds = files.iter().map(|file| file.chunk_count).max().unwrap_or(0);
    if rounds == 0 {
        bail!("Nothing to upload: every selected file is empty");
    }

    let total_size = files.iter().map(|file| file.size).sum();

    Ok(UploadPlan {
        files,
        rounds,
        total_size,
    })
}

impl UploadPlan {
    pub fn extensions(&self) -> Vec<&str> {
        self.files
            .iter()
            .map(|file| file.extension.as_str())
            .collect()
    }

    fn open_readers(&self) -> Result<Vec<File>> {
        self.files
            .iter()
            .map(|file| {
                File::open(&file.path)
                    .with_context(|| format!("Failed to open '{}'", file.path.display()))
            })
            .collect()
    }
}

/// Reads every file's slice for one round. Readers must be consumed in round
/// order: each call advances the non-exhausted handles by one chunk.
fn read_round(readers: &mut [File], plan: &UploadPlan, round: u64) -> Result<Vec<Option<Vec<u8>>>> {
    let mut parts = Vec::with_capacity(plan.files.len());
    for (file, reader) in plan.files.iter().zip(readers.iter_mut()) {
        match round_range(file.size, round) {
            Some(range) => {
                let mut buffer = vec![0u8; (range.end - range.start) as usize];
                reader.read_exact(&mut buffer).with_context(|| {
                    format!("Failed to read chunk {} of '{}'", round, file.field)
                })?;
                parts.push(Some(buffer));
            }
            None => parts.push(None),
        }
    }
    Ok(parts)
}

/// Verdict on a failed chunk round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkFault {
    /// Terminal: report the fixed message and abort the sequence.
    Rejected(&'static str),
    /// Retry the same round after `RETRY_DELAY`. `None` when the request
    /// never produced a status (connection-level failure).
    Transient(Option<StatusCode>),
}

/// Classifies the status of a chunk POST. `None` means the round was
/// accepted. Only these four codes terminate the sequence; everything
/// else non-2xx retries forever.
pub fn classify_chunk_status(status: StatusCode) -> Option<ChunkFault> {
    if status.is_success() {
        return None;
    }
    let fault = match status {
        StatusCode::BAD_REQUEST => ChunkFault::Rejected(MSG_FORM_REJECTED),
        StatusCode::PAYLOAD_TOO_LARGE => ChunkFault::Rejected(MSG_FILES_TOO_LARGE),
        StatusCode::REQUEST_TIMEOUT => ChunkFault::Rejected(MSG_UPLOAD_EXPIRED),
        StatusCode::UNPROCESSABLE_ENTITY => ChunkFault::Rejected(MSG_INCOMPATIBLE_FILES),
        other => ChunkFault::Transient(Some(other)),
    };
    Some(fault)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UploadProgress {
    pub rounds_sent: u64,
    pub total_rounds: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> f32 {
        if self.total_rounds == 0 {
            return 0.0;
        }
        (self.rounds_sent as f32 / self.total_rounds as f32) * 100.0
    }
}

#[derive(Clone, Debug)]
pub struct UploadReceipt {
    pub total_size: u64,
    pub redirect: Option<String>,
    pub response: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug)]
pub enum UploadEvent {
    Progress(UploadProgress),
    Retrying {
        round: u64,
        status: Option<StatusCode>,
    },
    Complete(UploadReceipt),
}

enum RoundOutcome {
    Accepted(Option<String>),
    Fault(ChunkFault),
}

pub struct UploadClient {
    client: Client,
    upload_url: Url,
    complete_url: Url,
}

impl UploadClient {
    pub fn new(upload_url: Url, complete_url: Url) -> Self {
        Self {
            client: Client::new(),
            upload_url,
            complete_url,
        }
    }

    /// Sends one chunk round. Round 0 (no token yet) declares the file
    /// extensions and yields the session token; later rounds carry the token.
    async fn post_round(
        &self,
        plan: &UploadPlan,
        token: Option<&str>,
        parts: &[Option<Vec<u8>>],
    ) -> Result<RoundOutcome> {
        let mut form = match token {
            None => Form::new().text(
                "file_extensions",
                serde_json::to_string(&plan.extensions())?,
            ),
            Some(token) => Form::new().text("token_upload", token.to_string()),
        };

        for (file, data) in plan.files.iter().zip(parts) {
            form = match data {
                Some(bytes) => {
                    let part = Part::bytes(bytes.clone())
                        .file_name(file.file_name.clone())
                        .mime_str("application/octet-stream")?;
                    form.part(file.field.clone(), part)
                }
                None => form.text(file.field.clone(), String::new()),
            };
        }

        let response = match self
            .client
            .post(self.upload_url.clone())
            .multipart(form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(_) => return Ok(RoundOutcome::Fault(ChunkFault::Transient(None))),
        };

        if let Some(fault) = classify_chunk_status(response.status()) {
            return Ok(RoundOutcome::Fault(fault));
        }

        if token.is_none() {
            let issued: ChunkUploadResponse = response
                .json()
                .await
                .context("Failed to decode the upload token response")?;
            Ok(RoundOutcome::Accepted(Some(issued.token_upload)))
        } else {
            Ok(RoundOutcome::Accepted(None))
        }
    }

    async fn complete_upload(
        &self,
        plan: &UploadPlan,
        token: &str,
        fields: &[(String, String)],
    ) -> Result<CompleteUploadResponse> {
        let mut form = Form::new()
            .text("total_size", plan.total_size.to_string())
            .text("token_upload", token.to_string());
        for (key, value) in fields {
            form = form.text(key.clone(), value.clone());
        }

        let response = self
            .client
            .post(self.complete_url.clone())
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            bail!(
                "Completion request failed: {} - {}",
                response.status(),
                response.text().await.unwrap_or_default()
            );
        }

        response
            .json()
            .await
            .context("Failed to decode the completion response")
    }

    /// Runs the whole sequence as an event stream: one synchronized round per
    /// step across all files, strictly sequential, then a single completion
    /// request once the round counter reaches the plan's round count.
    pub fn upload<'a>(
        &'a self,
        plan: &'a UploadPlan,
        fields: &'a [(String, String)],
    ) -> BoxStream<'a, Result<UploadEvent>> {
        let stream = async_stream::try_stream! {
            yield UploadEvent::Progress(UploadProgress {
                rounds_sent: 0,
                total_rounds: plan.rounds,
            });

            let mut readers = plan.open_readers()?;
            let mut token: Option<String> = None;

            for round in 0..plan.rounds {
                let parts = read_round(&mut readers, plan, round)?;

                loop {
                    match self.post_round(plan, token.as_deref(), &parts).await? {
                        RoundOutcome::Accepted(issued) => {
                            if let Some(issued) = issued {
                                token = Some(issued);
                            }
                            break;
                        }
                        RoundOutcome::Fault(ChunkFault::Rejected(message)) => {
                            Err(anyhow!(message))?;
                        }
                        RoundOutcome::Fault(ChunkFault::Transient(status)) => {
                            yield UploadEvent::Retrying { round, status };
                            tokio::time::sleep(RETRY_DELAY).await;
                        }
                    }
                }

                yield UploadEvent::Progress(UploadProgress {
                    rounds_sent: round + 1,
                    total_rounds: plan.rounds,
                });
            }

            let token = token.ok_or_else(|| anyhow!("Server issued no upload token"))?;
            let response = self.complete_upload(plan, &token, fields).await?;

            yield UploadEvent::Complete(UploadReceipt {
                total_size: plan.total_size,
                redirect: response.redirect,
                response: response.extra,
            });
        };

        Box::pin(stream)
    }
}
