//! Batch negotiation and per-file upload tracking.
//!
//! A sender proposes a batch with [`TransferService::prepare_upload`]; the
//! call waits until the batch is accepted or rejected for that session (or
//! [`PREPARE_TIMEOUT`] passes). Accepting mints one transmission id per
//! file. Each file is then uploaded once against its transmission id.
//!
//! Record status only moves forward:
//!
//! ```text
//! pending -> in_progress -> completed
//!                        -> failed
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::events::{EventSink, ProtocolEvent};
use crate::session::SessionRegistry;
use crate::sink::{FileSink, StoredFile};
use lanvault_common::{Error, FileId, Result, SessionId, TransmissionId};

/// How long a prepared batch waits for a decision.
pub const PREPARE_TIMEOUT: Duration = Duration::from_secs(300);

const DEFAULT_FOLDER: &str = "Received";
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Metadata of one proposed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub id: FileId,
    pub file_name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub file_type: String,
    /// Hex SHA-256 of the contents; empty skips verification.
    #[serde(default)]
    pub sha256: String,
}

/// Body of `POST /api/v1/prepare-upload`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareUploadRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub files: Vec<FileInfo>,
}

impl PrepareUploadRequest {
    /// Check required fields; returns the parsed session id.
    pub fn validate(&self) -> Result<SessionId> {
        if self.session_id.trim().is_empty() {
            return Err(Error::InvalidInput("sessionId is required".to_string()));
        }
        if self.files.is_empty() {
            return Err(Error::InvalidInput(
                "At least one file is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for file in &self.files {
            if file.id.as_str().trim().is_empty() {
                return Err(Error::InvalidInput("File id is required".to_string()));
            }
            if file.file_name.trim().is_empty() {
                return Err(Error::InvalidInput(format!(
                    "File {} has no name",
                    file.id
                )));
            }
            if !seen.insert(file.id.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "Duplicate file id {}",
                    file.id
                )));
            }
        }

        SessionId::new(self.session_id.clone())
    }

    /// Sum of the declared sizes, saturating at `u64::MAX`.
    fn total_size(&self) -> u64 {
        self.files
            .iter()
            .fold(0u64, |total, f| total.saturating_add(f.size))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransmission {
    pub id: FileId,
    pub transmission_id: TransmissionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareUploadResponse {
    pub files: Vec<FileTransmission>,
}

impl PrepareUploadResponse {
    /// Transmission id minted for `file_id`.
    pub fn transmission_for(&self, file_id: &str) -> Option<&TransmissionId> {
        self.files
            .iter()
            .find(|f| f.id.as_str() == file_id)
            .map(|f| &f.transmission_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

/// One accepted file awaiting or after upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: TransmissionId,
    pub session_id: SessionId,
    pub file: FileInfo,
    pub status: TransferStatus,
}

/// A batch awaiting a decision, as shown to the operator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingBatchInfo {
    pub session_id: SessionId,
    pub title: String,
    pub files: Vec<FileInfo>,
}

struct PendingBatch {
    ticket: u64,
    title: String,
    files: Vec<FileInfo>,
    outcome: oneshot::Sender<Result<PrepareUploadResponse>>,
}

/// Removes this request's batch if the waiting future is dropped.
struct BatchGuard<'a> {
    pending: &'a DashMap<SessionId, PendingBatch>,
    session: SessionId,
    ticket: u64,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if take_batch(self.pending, &self.session, self.ticket).is_some() {
            debug!(session = %self.session, "Prepared batch abandoned by sender");
        }
    }
}

fn take_batch(
    pending: &DashMap<SessionId, PendingBatch>,
    session: &SessionId,
    ticket: u64,
) -> Option<PendingBatch> {
    pending
        .remove_if(session, |_, batch| batch.ticket == ticket)
        .map(|(_, batch)| batch)
}

/// Server side of the transfer protocol.
///
/// Transfer records live for the life of the service, terminal ones
/// included, so a repeated upload keeps getting `Conflict`. They are not
/// tied to session removal.
pub struct TransferService {
    sessions: Arc<SessionRegistry>,
    sink: Arc<dyn FileSink>,
    events: Arc<dyn EventSink>,
    pending: DashMap<SessionId, PendingBatch>,
    transfers: Arc<DashMap<TransmissionId, TransferRecord>>,
    timeout: Duration,
    default_folder: String,
    next_ticket: AtomicU64,
}

impl TransferService {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        sink: Arc<dyn FileSink>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            sessions,
            sink,
            events,
            pending: DashMap::new(),
            transfers: Arc::new(DashMap::new()),
            timeout: PREPARE_TIMEOUT,
            default_folder: DEFAULT_FOLDER.to_string(),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Folder uploads are stored in.
    pub fn with_default_folder(mut self, folder: impl Into<String>) -> Self {
        self.default_folder = folder.into();
        self
    }

    /// Propose a batch and wait for the decision.
    ///
    /// # Errors
    /// - `InvalidInput` if the request fails validation
    /// - `InvalidSession` if the session is unknown
    /// - `Busy` if this session already has a batch awaiting a decision
    /// - `Rejected` if the batch is rejected
    /// - `Timeout` if no decision arrives in time
    pub async fn prepare_upload(
        &self,
        request: PrepareUploadRequest,
    ) -> Result<PrepareUploadResponse> {
        let session = request.validate()?;
        if !self.sessions.contains(&session) {
            warn!(session = %session, "Prepare-upload with unknown session");
            return Err(Error::InvalidSession);
        }

        let total_files = request.files.len();
        let total_size = request.total_size();
        let (tx, mut rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        match self.pending.entry(session.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::Busy(format!(
                    "Session {} already has a batch awaiting a decision",
                    session
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingBatch {
                    ticket,
                    title: request.title.clone(),
                    files: request.files.clone(),
                    outcome: tx,
                });
            }
        }
        let _guard = BatchGuard {
            pending: &self.pending,
            session: session.clone(),
            ticket,
        };

        info!(session = %session, total_files, total_size, "Batch awaiting decision");
        self.events.emit(ProtocolEvent::PrepareUploadRequest {
            session_id: session.clone(),
            title: request.title,
            files: request.files,
            total_files,
            total_size,
        });

        let outcome = match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(received) => received,
            Err(_) => {
                if take_batch(&self.pending, &session, ticket).is_some() {
                    info!(session = %session, "Batch timed out");
                    return Err(Error::Timeout(
                        "Request timeout - no response from recipient".to_string(),
                    ));
                }
                rx.await
            }
        };

        outcome.map_err(|_| Error::Conflict("Batch was abandoned".to_string()))?
    }

    /// Accept the batch pending for `session` and mint transmission ids.
    ///
    /// # Errors
    /// - `NotFound` if no batch is pending or the sender stopped waiting
    pub fn accept(&self, session: &SessionId) -> Result<PrepareUploadResponse> {
        let (_, batch) = self.pending.remove(session).ok_or_else(|| {
            Error::NotFound(format!("No pending transfer for session {}", session))
        })?;

        let mut files = Vec::with_capacity(batch.files.len());
        for file in batch.files {
            let transmission_id = TransmissionId::generate();
            files.push(FileTransmission {
                id: file.id.clone(),
                transmission_id: transmission_id.clone(),
            });
            self.transfers.insert(
                transmission_id.clone(),
                TransferRecord {
                    id: transmission_id,
                    session_id: session.clone(),
                    file,
                    status: TransferStatus::Pending,
                },
            );
        }

        let response = PrepareUploadResponse { files };
        if batch.outcome.send(Ok(response.clone())).is_err() {
            for file in &response.files {
                self.transfers.remove(&file.transmission_id);
            }
            return Err(Error::NotFound(
                "Prepare request is no longer waiting".to_string(),
            ));
        }

        info!(session = %session, files = response.files.len(), "Batch accepted");
        Ok(response)
    }

    /// Reject the batch pending for `session`.
    ///
    /// # Errors
    /// - `NotFound` if no batch is pending
    pub fn reject(&self, session: &SessionId) -> Result<()> {
        let (_, batch) = self.pending.remove(session).ok_or_else(|| {
            Error::NotFound(format!("No pending transfer for session {}", session))
        })?;

        let rejection = Err(Error::Rejected("Transfer rejected by recipient".to_string()));
        if batch.outcome.send(rejection).is_err() {
            debug!(session = %session, "Rejected batch was no longer waiting");
        }
        info!(session = %session, title = %batch.title, "Batch rejected");
        Ok(())
    }

    /// Batches currently awaiting a decision.
    pub fn pending_batches(&self) -> Vec<PendingBatchInfo> {
        self.pending
            .iter()
            .map(|entry| PendingBatchInfo {
                session_id: entry.key().clone(),
                title: entry.title.clone(),
                files: entry.files.clone(),
            })
            .collect()
    }

    pub fn has_pending(&self, session: &SessionId) -> bool {
        self.pending.contains_key(session)
    }

    pub fn transfer(&self, id: &TransmissionId) -> Option<TransferRecord> {
        self.transfers.get(id).map(|r| r.clone())
    }

    /// Check that an upload would be accepted, without changing the record.
    ///
    /// Lets the HTTP layer refuse an upload before reading its body. Fails
    /// with the same errors as [`Self::upload`] before storage starts.
    pub fn check_upload(
        &self,
        session_id: &str,
        transmission_id: &str,
        file_id: &str,
    ) -> Result<()> {
        let (session, transmission, file_id) =
            parse_upload_ids(session_id, transmission_id, file_id)?;
        let record = self.transfers.get(&transmission).ok_or_else(|| {
            Error::NotFound(format!("Transfer {} not found", transmission))
        })?;
        check_record(&record, &session, &file_id)
    }

    /// Receive the body of one accepted file and store it.
    ///
    /// # Errors
    /// - `InvalidInput` if an id is missing or the SHA-256 does not match
    /// - `NotFound` if the transmission id is unknown or `file_id` is not
    ///   the file it was minted for
    /// - `InvalidSession` if the transmission belongs to another session
    /// - `Conflict` if the record already left `pending`
    /// - any storage error, after which the record is `failed`
    ///
    /// Storing runs on its own task, so the record reaches a terminal
    /// status even if the caller stops waiting.
    pub async fn upload(
        &self,
        session_id: &str,
        transmission_id: &str,
        file_id: &str,
        data: Vec<u8>,
    ) -> Result<UploadResponse> {
        let (session, transmission, file_id) =
            parse_upload_ids(session_id, transmission_id, file_id)?;

        let file = {
            let mut record = self.transfers.get_mut(&transmission).ok_or_else(|| {
                Error::NotFound(format!("Transfer {} not found", transmission))
            })?;
            check_record(&record, &session, &file_id)?;
            record.status = TransferStatus::InProgress;
            record.file.clone()
        };

        self.events.emit(ProtocolEvent::FileReceiving {
            session_id: session.clone(),
            file_id: file.id.clone(),
            file_name: file.file_name.clone(),
            file_size: file.size,
        });

        let transfers = Arc::clone(&self.transfers);
        let sink = Arc::clone(&self.sink);
        let events = Arc::clone(&self.events);
        let folder = self.default_folder.clone();

        tokio::spawn(async move {
            let stored = receive(sink.as_ref(), &folder, &file, data).await;
            finish(&transfers, events.as_ref(), &transmission, &session, &file, stored)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

fn parse_upload_ids(
    session_id: &str,
    transmission_id: &str,
    file_id: &str,
) -> Result<(SessionId, TransmissionId, FileId)> {
    Ok((
        SessionId::new(session_id)?,
        TransmissionId::new(transmission_id)?,
        FileId::new(file_id)?,
    ))
}

fn check_record(record: &TransferRecord, session: &SessionId, file_id: &FileId) -> Result<()> {
    if &record.session_id != session {
        warn!(transmission = %record.id, "Upload with mismatched session");
        return Err(Error::InvalidSession);
    }
    if &record.file.id != file_id {
        return Err(Error::NotFound(format!(
            "File {} is not part of transfer {}",
            file_id, record.id
        )));
    }
    match record.status {
        TransferStatus::Pending => Ok(()),
        TransferStatus::Completed => {
            Err(Error::Conflict("Transfer already completed".to_string()))
        }
        TransferStatus::InProgress => {
            Err(Error::Conflict("Transfer already in progress".to_string()))
        }
        TransferStatus::Failed => Err(Error::Conflict("Transfer already failed".to_string())),
    }
}

async fn receive(
    sink: &dyn FileSink,
    folder: &str,
    file: &FileInfo,
    data: Vec<u8>,
) -> Result<StoredFile> {
    let expected = file.sha256.trim();
    if !expected.is_empty() {
        let actual = hex::encode(Sha256::digest(&data));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(Error::InvalidInput(format!(
                "SHA-256 mismatch for file {}",
                file.id
            )));
        }
    }
    if file.size != 0 && file.size != data.len() as u64 {
        warn!(
            file = %file.id,
            declared = file.size,
            received = data.len(),
            "Upload size differs from prepared size"
        );
    }

    let mime_type = if file.file_type.trim().is_empty() {
        DEFAULT_MIME_TYPE
    } else {
        file.file_type.as_str()
    };
    sink.store(folder, &file.file_name, mime_type, data).await
}

fn finish(
    transfers: &DashMap<TransmissionId, TransferRecord>,
    events: &dyn EventSink,
    transmission: &TransmissionId,
    session: &SessionId,
    file: &FileInfo,
    stored: Result<StoredFile>,
) -> Result<UploadResponse> {
    let status = if stored.is_ok() {
        TransferStatus::Completed
    } else {
        TransferStatus::Failed
    };
    if let Some(mut record) = transfers.get_mut(transmission) {
        record.status = status;
    }

    match stored {
        Ok(stored) => {
            info!(transmission = %transmission, vault_id = stored.id, "File received");
            events.emit(ProtocolEvent::FileReceived {
                session_id: session.clone(),
                file_id: file.id.clone(),
                file_name: file.file_name.clone(),
                file_size: stored.size,
                vault_id: stored.id,
            });
            Ok(UploadResponse { success: true })
        }
        Err(e) => {
            warn!(transmission = %transmission, error = %e, "File transfer failed");
            events.emit(ProtocolEvent::TransferFailed {
                session_id: session.clone(),
                file_id: file.id.clone(),
                error: e.to_string(),
            });
            Err(e)
        }
    }
}
