//! Notifications pushed to the UI shell.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::transfer::FileInfo;
use lanvault_common::{FileId, SessionId};

/// Progress notification emitted by the receiver.
///
/// Serialized with an `event` tag carrying the event name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ProtocolEvent {
    #[serde(rename_all = "camelCase")]
    CertificateInfo { fingerprint: String, display: String },

    #[serde(rename_all = "camelCase")]
    RegisterRequestReceived { nonce: String },

    #[serde(rename_all = "camelCase")]
    DeviceRegistered { session_id: SessionId },

    #[serde(rename_all = "camelCase")]
    PrepareUploadRequest {
        session_id: SessionId,
        title: String,
        files: Vec<FileInfo>,
        total_files: usize,
        total_size: u64,
    },

    #[serde(rename_all = "camelCase")]
    FileReceiving {
        session_id: SessionId,
        file_id: FileId,
        file_name: String,
        file_size: u64,
    },

    #[serde(rename_all = "camelCase")]
    FileReceived {
        session_id: SessionId,
        file_id: FileId,
        file_name: String,
        file_size: u64,
        vault_id: i64,
    },

    #[serde(rename_all = "camelCase")]
    TransferFailed {
        session_id: SessionId,
        file_id: FileId,
        error: String,
    },
}

impl ProtocolEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolEvent::CertificateInfo { .. } => "certificate-info",
            ProtocolEvent::RegisterRequestReceived { .. } => "register-request-received",
            ProtocolEvent::DeviceRegistered { .. } => "device-registered",
            ProtocolEvent::PrepareUploadRequest { .. } => "prepare-upload-request",
            ProtocolEvent::FileReceiving { .. } => "file-receiving",
            ProtocolEvent::FileReceived { .. } => "file-received",
            ProtocolEvent::TransferFailed { .. } => "transfer-failed",
        }
    }
}

/// Destination for protocol events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProtocolEvent);
}

/// Logs every event at INFO.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ProtocolEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        info!(event = event.name(), %payload, "Protocol event");
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProtocolEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProtocolEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ProtocolEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

/// Discards events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: ProtocolEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = ProtocolEvent::FileReceiving {
            session_id: SessionId::new("s1").unwrap(),
            file_id: FileId::new("f1").unwrap(),
            file_name: "a.txt".to_string(),
            file_size: 5,
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "file-receiving");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["fileId"], "f1");
        assert_eq!(json["fileName"], "a.txt");
        assert_eq!(json["fileSize"], 5);
        assert_eq!(event.name(), "file-receiving");
    }

    #[test]
    fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(ProtocolEvent::RegisterRequestReceived {
            nonce: "n".to_string(),
        });
        assert_eq!(rx.try_recv().unwrap().name(), "register-request-received");
    }

    #[test]
    fn test_channel_sink_tolerates_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(ProtocolEvent::RegisterRequestReceived {
            nonce: "n".to_string(),
        });
    }
}
