use super::*;
use crate::auth::AnonymousCredentials;
use crate::config::ClientConfig;
use crate::protocol::smb2_constants::Smb2Command;
use crate::test_support::{addr, MockServer};
use crate::transport::{Endpoint, SmbTransport};
use std::collections::hash_map::DefaultHasher;
use std::time::Duration;

async fn session(server: &Arc<MockServer>) -> Arc<SmbSession> {
    let config = Arc::new(ClientConfig::default());
    let transport = SmbTransport::new(
        Endpoint::new("fileserver", addr("10.0.0.1:445")),
        None,
        Arc::clone(&config),
        server.connector(),
    )
    .acquire();
    let session = SmbSession::new(
        "fileserver",
        transport,
        Arc::new(AnonymousCredentials),
        config,
        None,
    );
    session.acquire();
    session
}

fn detached(share: &str, service: &str) -> SmbTree {
    SmbTree::new(Weak::new(), 1, share, service, false)
}

fn hash_of(tree: &SmbTree) -> u64 {
    let mut hasher = DefaultHasher::new();
    tree.hash(&mut hasher);
    hasher.finish()
}

fn referral(server: &str, share: &str, link: &str) -> Referral {
    Referral {
        server: server.to_string(),
        share: share.to_string(),
        path: String::new(),
        domain: None,
        ttl: Duration::from_secs(300),
        link: link.to_string(),
    }
}

#[test]
fn test_classify() {
    assert_eq!(TreeType::classify("PRINTQ", "LPT1:"), TreeType::Printer);
    assert_eq!(TreeType::classify("PRINTQ", "LPT1"), TreeType::Printer);
    assert_eq!(TreeType::classify("SERIAL", "COMM"), TreeType::Comm);
    assert_eq!(TreeType::classify("IPC$", "?????"), TreeType::NamedPipe);
    assert_eq!(TreeType::classify("ipc$", "A:"), TreeType::NamedPipe);
    assert_eq!(TreeType::classify("DATA", "A:"), TreeType::Share);
    assert_eq!(TreeType::classify("DATA", "?????"), TreeType::Share);
    assert_eq!(TreeType::classify("DATA", "LP"), TreeType::Share);
}

#[test]
fn test_matches() {
    let tree = detached("Data", "A:");
    assert!(tree.matches("DATA", "A:"));
    assert!(tree.matches("data", "A:"));
    assert!(!tree.matches("DATA", "LPT1:"));
    assert!(!tree.matches("OTHER", "A:"));

    let any = detached("Data", "?????");
    assert!(any.matches("DATA", "A:"));
    assert!(any.matches("DATA", "IPC"));
}

#[test]
fn test_identity() {
    let a = detached("Data", "A:");
    let b = detached("DATA", "A:");
    assert_eq!(a, b);
    assert_eq!(hash_of(&a), hash_of(&b));

    assert_ne!(a, detached("DATA", "?????"));
    assert_ne!(a, SmbTree::new(Weak::new(), 2, "DATA", "A:", false));
}

#[tokio::test]
async fn test_domain_dfs_is_sticky() {
    let server = MockServer::new();
    let session = session(&server).await;
    let tree = session.get_or_create_tree("DATA", "A:").await.unwrap();
    assert!(!tree.is_in_domain_dfs());
    tree.mark_domain_dfs();

    tree.tree_disconnect(false, true).await;
    assert!(tree.is_in_domain_dfs());
    tree.tree_connect(None, None).await.unwrap();
    assert!(tree.is_in_domain_dfs());
    tree.tree_disconnect(false, true).await;
    tree.tree_connect(None, None).await.unwrap();
    assert!(tree.is_in_domain_dfs());
    assert_eq!(server.count(Smb2Command::TreeConnect), 3);
    assert_eq!(server.count(Smb2Command::TreeDisconnect), 2);
}

#[test]
fn test_tree_referral_lookup() {
    let tree = detached("Root", "A:");
    assert!(tree.get_tree_referral(r"\dom\root\a").is_none());

    tree.set_tree_referral(referral("fs1", "data", r"\dom\root\a"), r"\dom\root\a");
    tree.set_tree_referral(referral("fs2", "deep", r"\dom\root\a\b"), r"\dom\root\a\b");

    assert_eq!(tree.get_tree_referral(r"\dom\root\a\x").unwrap().server, "fs1");
    assert_eq!(tree.get_tree_referral(r"\DOM\ROOT\A\B\c").unwrap().server, "fs2");
    assert!(tree.get_tree_referral(r"\dom\root\ab").is_none());
    assert!(tree.get_tree_referral("").is_none());

    // Same path replaces the earlier referral
    tree.set_tree_referral(referral("fs3", "data", r"\dom\root\a"), r"\dom\root\a");
    assert_eq!(tree.get_tree_referral(r"\dom\root\a").unwrap().server, "fs3");
}

#[test]
fn test_release_clamps_at_zero() {
    let tree = Arc::new(detached("Data", "A:"));
    let handle = tree.acquire();
    assert_eq!(tree.usage_count(), 1);
    handle.release();
    tree.release();
    assert_eq!(tree.usage_count(), 0);
    tree.acquire();
    assert_eq!(tree.usage_count(), 1);
}

#[tokio::test]
async fn test_same_share_connects_once() {
    let server = MockServer::new();
    let session = session(&server).await;

    let first = session.get_or_create_tree("SHARE", "A:").await.unwrap();
    let second = session.get_or_create_tree("share", "A:").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.usage_count(), 2);
    assert_eq!(session.tree_count(), 1);
    assert_eq!(server.count(Smb2Command::TreeConnect), 1);
    assert_eq!(server.tree_paths(), vec![r"\\fileserver\SHARE".to_string()]);

    assert!(first.is_connected());
    assert_ne!(first.tree_id(), 0);
    assert_eq!(first.tree_type(), TreeType::Share);
    assert_eq!(first.confirmed_service().as_deref(), Some("A:"));
}

#[tokio::test]
async fn test_empty_share_means_ipc() {
    let server = MockServer::new();
    let session = session(&server).await;

    let tree = session.get_or_create_tree("", "").await.unwrap();
    assert_eq!(tree.share(), "IPC$");
    assert_eq!(tree.service(), "?????");
    assert_eq!(tree.tree_type(), TreeType::NamedPipe);
    assert_eq!(tree.confirmed_service().as_deref(), Some("IPC"));
}

#[tokio::test]
async fn test_tree_holds_session() {
    let server = MockServer::new();
    let session = session(&server).await;
    assert_eq!(session.usage_count(), 1);

    let tree = session.get_tree("DATA", "A:");
    assert_eq!(session.usage_count(), 2);
    let again = session.get_tree("DATA", "A:");
    assert_eq!(session.usage_count(), 2);

    again.release();
    tree.release();
    assert_eq!(session.usage_count(), 1);
}

#[tokio::test]
async fn test_dfs_share_flags() {
    let server = MockServer::new();
    server.dfs_shares.lock().insert("ROOT".to_string());
    let session = session(&server).await;

    let tree = session.get_or_create_tree("ROOT", "?????").await.unwrap();
    assert!(tree.is_dfs());
    assert!(tree.share_flags().contains(ShareFlags::DFS_ROOT));

    let plain = session.get_or_create_tree("DATA", "?????").await.unwrap();
    assert!(!plain.is_dfs());
}

#[tokio::test]
async fn test_redirect_surfaces() {
    let server = MockServer::new();
    server.redirect_shares.lock().insert("LINKS".to_string());
    let session = session(&server).await;

    let err = session.get_or_create_tree("LINKS", "?????").await.unwrap_err();
    assert!(err.is_redirect());
    // The failed tree does not hold the session
    assert_eq!(session.usage_count(), 1);

    let tree = session.get_tree("LINKS", "?????");
    assert_eq!(tree.state(), TreeState::Disconnected);
    tree.release();
}

#[tokio::test]
async fn test_missing_share() {
    let server = MockServer::new();
    server.missing_shares.lock().insert("NOPE".to_string());
    let session = session(&server).await;

    let err = session.get_or_create_tree("NOPE", "A:").await.unwrap_err();
    assert_eq!(err.status(), Some(crate::protocol::status::STATUS_BAD_NETWORK_NAME));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let server = MockServer::new();
    let session = session(&server).await;
    let tree = session.get_or_create_tree("DATA", "A:").await.unwrap();
    tree.mark_domain_dfs();

    tree.tree_disconnect(false, true).await;
    assert!(!tree.is_connected());
    assert_eq!(tree.tree_id(), 0);
    tree.tree_disconnect(false, true).await;
    assert_eq!(server.count(Smb2Command::TreeDisconnect), 1);
    assert!(tree.is_in_domain_dfs());

    // In error: no request goes out
    tree.tree_connect(None, None).await.unwrap();
    tree.tree_disconnect(true, false).await;
    assert_eq!(server.count(Smb2Command::TreeDisconnect), 1);
    assert!(!tree.is_connected());
}

#[tokio::test]
async fn test_override_path() {
    let server = MockServer::new();
    let session = session(&server).await;
    let tree = session.get_tree("DATA", "A:");
    tree.tree_connect(Some(r"\\other\DATA"), Some("?????"))
        .await
        .unwrap();
    assert_eq!(server.tree_paths(), vec![r"\\other\DATA".to_string()]);
    // The requested service does not travel on the wire
    assert_eq!(tree.service(), "A:");
    assert_eq!(tree.confirmed_service().as_deref(), Some("A:"));
}

#[tokio::test]
async fn test_send_stamps_tree_id() {
    let server = MockServer::new();
    let session = session(&server).await;
    let tree = session.get_tree("DATA", "A:");

    // Connects on demand
    let response = tree
        .send(Request::new(Operation::Echo), RequestFlags::NONE)
        .await
        .unwrap();
    assert!(tree.is_connected());
    assert_eq!(response.tree_id(), tree.tree_id());
}

#[tokio::test]
async fn test_stale_tree_reconnects_after_reauthentication() {
    let server = MockServer::new();
    let session = session(&server).await;
    let tree = session.get_or_create_tree("DATA", "A:").await.unwrap();
    let old_session_id = session.session_id();

    server.script(
        Smb2Command::Echo,
        crate::protocol::status::STATUS_NETWORK_SESSION_EXPIRED,
    );
    let response = tree
        .send(Request::new(Operation::Echo), RequestFlags::NONE)
        .await
        .unwrap();
    assert_eq!(response.status(), crate::protocol::status::STATUS_SUCCESS);
    assert_ne!(session.session_id(), old_session_id);
    assert_eq!(server.count(Smb2Command::SessionSetup), 2);
    assert_eq!(server.count(Smb2Command::TreeConnect), 2);
    assert!(tree.is_connected());
}
