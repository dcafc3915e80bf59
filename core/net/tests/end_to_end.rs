//! Receiver and sender talking over real TLS on localhost.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use lanvault_common::{Error, FileId, SessionId};
use lanvault_crypto::KdfParams;
use lanvault_net::{describe_file, ReceiverConfig, ReceiverServer, SenderClient};
use lanvault_protocol::{ChannelSink, PrepareUploadRequest, ProtocolEvent};
use lanvault_vault::{Vault, VaultPaths};

struct Receiver {
    _dir: tempfile::TempDir,
    vault: Arc<Vault>,
    server: ReceiverServer,
    events: UnboundedReceiver<ProtocolEvent>,
    port: u16,
}

async fn start_receiver() -> Receiver {
    let dir = tempfile::tempdir().unwrap();
    let params = KdfParams {
        memory_cost: 1024,
        time_cost: 1,
        parallelism: 1,
    };
    let vault = Arc::new(Vault::open_with_params(VaultPaths::new(dir.path()), params).unwrap());
    vault.initialize("correct horse").unwrap();

    let config = ReceiverConfig {
        bind_host: "127.0.0.1".to_string(),
        port: 0,
        shutdown_grace_secs: 1,
        ..Default::default()
    };
    let (sink, mut events) = ChannelSink::new();
    let server = ReceiverServer::for_vault(vault.clone(), config, Arc::new(sink));
    let addr = server.start().await.unwrap();

    match next_event(&mut events).await {
        ProtocolEvent::CertificateInfo { fingerprint, display } => {
            assert!(display.contains(&fingerprint));
        }
        other => panic!("unexpected first event {:?}", other),
    }

    Receiver {
        _dir: dir,
        vault,
        server,
        events,
        port: addr.port(),
    }
}

async fn next_event(events: &mut UnboundedReceiver<ProtocolEvent>) -> ProtocolEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("event not emitted in time")
        .expect("event channel closed")
}

async fn wait_for(events: &mut UnboundedReceiver<ProtocolEvent>, name: &str) -> ProtocolEvent {
    loop {
        let event = next_event(events).await;
        if event.name() == name {
            return event;
        }
    }
}

async fn pair(receiver: &mut Receiver, client: &Arc<SenderClient>) -> SessionId {
    let sender = client.clone();
    let registration = tokio::spawn(async move { sender.register("123456", "nonce-1").await });

    wait_for(&mut receiver.events, "register-request-received").await;
    let confirmed = receiver.server.pairing().confirm().unwrap();

    let session = registration.await.unwrap().unwrap();
    assert_eq!(session, confirmed);
    session
}

#[tokio::test]
async fn test_full_transfer_lands_in_vault() {
    let mut receiver = start_receiver().await;
    let client = Arc::new(SenderClient::new("127.0.0.1", receiver.port).unwrap());

    let session = pair(&mut receiver, &client).await;
    assert_eq!(
        client.peer_fingerprint(),
        receiver.server.fingerprint().await
    );

    let data = b"hello from the other laptop".to_vec();
    let file_id = FileId::new("file-1").unwrap();
    let request = PrepareUploadRequest {
        title: "Notes".to_string(),
        session_id: session.to_string(),
        files: vec![describe_file(file_id.clone(), "hello.txt", "text/plain", &data)],
    };

    let sender = client.clone();
    let prepared = tokio::spawn(async move { sender.prepare_upload(&request).await });

    match wait_for(&mut receiver.events, "prepare-upload-request").await {
        ProtocolEvent::PrepareUploadRequest {
            total_files,
            total_size,
            ..
        } => {
            assert_eq!(total_files, 1);
            assert_eq!(total_size, data.len() as u64);
        }
        other => panic!("unexpected event {:?}", other),
    }
    let accepted = receiver.server.transfers().accept(&session).unwrap();
    let response = prepared.await.unwrap().unwrap();
    assert_eq!(response, accepted);

    let transmission = response.transmission_for("file-1").unwrap().clone();
    let uploaded = client
        .upload(
            &session,
            &transmission,
            &file_id,
            "hello.txt",
            "text/plain",
            data.clone(),
        )
        .await
        .unwrap();
    assert!(uploaded.success);

    let vault_id = match wait_for(&mut receiver.events, "file-received").await {
        ProtocolEvent::FileReceived { vault_id, .. } => vault_id,
        other => panic!("unexpected event {:?}", other),
    };
    let record = receiver.vault.record(vault_id).unwrap();
    assert_eq!(record.name, "hello.txt");
    assert_eq!(record.mime_type, "text/plain");
    assert_eq!(receiver.vault.fetch(vault_id).unwrap(), data);

    let folders = receiver.vault.list_folders().unwrap();
    assert!(folders.iter().any(|f| f.name == "Received"));

    let again = client
        .upload(&session, &transmission, &file_id, "hello.txt", "text/plain", data)
        .await;
    assert!(matches!(again, Err(Error::Conflict(_))));

    receiver.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_rejected_registration() {
    let mut receiver = start_receiver().await;
    let client = Arc::new(SenderClient::new("127.0.0.1", receiver.port).unwrap());

    let sender = client.clone();
    let registration = tokio::spawn(async move { sender.register("000000", "n").await });
    wait_for(&mut receiver.events, "register-request-received").await;
    receiver.server.pairing().reject().unwrap();

    assert!(matches!(
        registration.await.unwrap(),
        Err(Error::Rejected(_))
    ));
    receiver.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_wrong_pin_and_missing_fields() {
    let receiver = start_receiver().await;
    receiver
        .server
        .pairing()
        .set_pin(Some("424242".to_string()));
    let client = SenderClient::new("127.0.0.1", receiver.port).unwrap();

    assert!(matches!(
        client.register("111111", "n").await,
        Err(Error::AuthenticationFailure)
    ));
    assert!(matches!(
        client.register("424242", "").await,
        Err(Error::InvalidInput(_))
    ));
    receiver.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_session_is_refused() {
    let receiver = start_receiver().await;
    let client = SenderClient::new("127.0.0.1", receiver.port).unwrap();

    let request = PrepareUploadRequest {
        title: String::new(),
        session_id: "not-a-session".to_string(),
        files: vec![describe_file(
            FileId::new("f").unwrap(),
            "a.bin",
            "",
            b"abc",
        )],
    };
    assert!(matches!(
        client.prepare_upload(&request).await,
        Err(Error::InvalidSession)
    ));
    receiver.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_pinned_fingerprint() {
    let receiver = start_receiver().await;
    let fingerprint = receiver.server.fingerprint().await.unwrap();

    let wrong = SenderClient::pinned("127.0.0.1", receiver.port, "AAAAAAAAAAA=").unwrap();
    assert!(matches!(
        wrong.register("1", "n").await,
        Err(Error::Tls(_))
    ));

    // The right pin gets through TLS and reaches the handler.
    let right = SenderClient::pinned("127.0.0.1", receiver.port, &fingerprint).unwrap();
    let request = PrepareUploadRequest::default();
    assert!(matches!(
        right.prepare_upload(&request).await,
        Err(Error::InvalidInput(_))
    ));
    assert_eq!(right.peer_fingerprint(), Some(fingerprint));

    receiver.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_lifecycle() {
    let receiver = start_receiver().await;
    assert!(receiver.server.is_running().await);
    assert!(matches!(
        receiver.server.start().await,
        Err(Error::Conflict(_))
    ));

    let first = receiver.server.fingerprint().await;
    receiver.server.stop().await.unwrap();
    assert!(!receiver.server.is_running().await);
    assert!(receiver.server.local_addr().await.is_none());
    receiver.server.stop().await.unwrap();

    // Restarting reuses the stored identity.
    receiver.server.start().await.unwrap();
    assert_eq!(receiver.server.fingerprint().await, first);
    receiver.server.stop().await.unwrap();
}
