use super::*;
use crate::test_support::{
    error_body, ioctl_body, negotiate_body, response, session_setup_body, tree_connect_body,
};

fn tree_connect_reply(code: u32, tree_id: u32, share_type: ShareType) -> Bytes {
    let request = Smb2Header::new(Smb2Command::TreeConnect);
    let body = if code == status::STATUS_SUCCESS {
        tree_connect_body(share_type, ShareFlags::DFS, ShareCapabilities::DFS)
    } else {
        error_body()
    };
    response(&request, code, tree_id, body)
}

#[test]
fn test_tree_connect_request_layout() {
    let request = Request::new(Operation::TreeConnect {
        path: r"\\server\share".to_string(),
        flags: 0x0004,
    })
    .with_session(0x1000)
    .with_dfs(true);

    let frame = request.encode(7, Some(Smb2Dialect::Smb302)).unwrap();
    let header = Smb2Header::parse(&frame).unwrap();
    assert_eq!(header.command, Smb2Command::TreeConnect);
    assert_eq!(header.message_id, 7);
    assert_eq!(header.session_id, 0x1000);
    assert!(header.flags.contains(Smb2HeaderFlags::DFS_OPERATIONS));

    let body = &frame[Smb2Header::SIZE..];
    assert_eq!(LittleEndian::read_u16(&body[0..2]), 9);
    // Tree connect flags are reserved below 3.1.1
    assert_eq!(LittleEndian::read_u16(&body[2..4]), 0);
    let len = LittleEndian::read_u16(&body[6..8]) as usize;
    assert_eq!(decode_utf16le(&body[8..8 + len]).unwrap(), r"\\server\share");

    let frame = request.encode(8, Some(Smb2Dialect::Smb311)).unwrap();
    assert_eq!(LittleEndian::read_u16(&frame[Smb2Header::SIZE + 2..]), 0x0004);
}

#[test]
fn test_negotiate_requires_dialects() {
    let request = Request::new(Operation::Negotiate {
        dialects: vec![],
        security_mode: SecurityMode::SIGNING_ENABLED,
        capabilities: Smb2Capabilities::empty(),
        client_guid: Uuid::nil(),
    });
    assert!(matches!(
        request.encode(0, None),
        Err(Error::InvalidParameter(_))
    ));
}

#[test]
fn test_tree_connect_response_service() {
    let disk = Response::decode(
        tree_connect_reply(status::STATUS_SUCCESS, 5, ShareType::Disk),
        false,
        Some(Smb2Dialect::Smb302),
    )
    .unwrap();
    assert!(disk.is_valid());
    assert_eq!(disk.service(), Some("A:"));
    assert_eq!(disk.tree_id(), 5);

    let pipe = Response::decode(
        tree_connect_reply(status::STATUS_SUCCESS, 6, ShareType::Pipe),
        false,
        None,
    )
    .unwrap();
    assert_eq!(pipe.service(), Some("IPC"));

    let printer = Response::decode(
        tree_connect_reply(status::STATUS_SUCCESS, 7, ShareType::Print),
        false,
        None,
    )
    .unwrap();
    assert_eq!(printer.service(), Some("LPT1:"));
}

#[test]
fn test_tree_connect_without_tree_id_is_invalid() {
    let reply = Response::decode(
        tree_connect_reply(status::STATUS_SUCCESS, 0, ShareType::Disk),
        false,
        None,
    )
    .unwrap();
    assert!(!reply.is_valid());

    let failed = Response::decode(
        tree_connect_reply(status::STATUS_BAD_NETWORK_NAME, 0, ShareType::Disk),
        false,
        None,
    )
    .unwrap();
    assert!(!failed.is_valid());
    assert_eq!(failed.body(), &ResponseBody::Empty);
    assert_eq!(failed.service(), None);
}

#[test]
fn test_share_capabilities_ignored_for_legacy_dialect() {
    let frame = tree_connect_reply(status::STATUS_SUCCESS, 3, ShareType::Disk);

    let legacy = Response::decode(frame.clone(), false, Some(Smb2Dialect::Smb210)).unwrap();
    match legacy.body() {
        ResponseBody::TreeConnect(info) => {
            assert!(info.capabilities.is_empty());
            assert!(info.share_flags.contains(ShareFlags::DFS));
        }
        other => panic!("unexpected body {:?}", other),
    }

    let modern = Response::decode(frame, false, Some(Smb2Dialect::Smb300)).unwrap();
    match modern.body() {
        ResponseBody::TreeConnect(info) => {
            assert!(info.capabilities.contains(ShareCapabilities::DFS))
        }
        other => panic!("unexpected body {:?}", other),
    }
}

#[test]
fn test_retained_payload() {
    let frame = tree_connect_reply(status::STATUS_SUCCESS, 3, ShareType::Disk);

    let kept = Response::decode(frame.clone(), true, None).unwrap();
    assert_eq!(kept.raw_payload(), Some(&frame));

    let dropped = Response::decode(frame, false, None).unwrap();
    assert!(dropped.raw_payload().is_none());
}

#[test]
fn test_check_maps_status() {
    let redirect = Response::decode(
        tree_connect_reply(status::STATUS_PATH_NOT_COVERED, 0, ShareType::Disk),
        false,
        None,
    )
    .unwrap();
    match redirect.check(r"\\domain\dfs") {
        Err(Error::DfsRedirect { path }) => assert_eq!(path, r"\\domain\dfs"),
        other => panic!("expected redirect, got {:?}", other),
    }

    let denied = Response::decode(
        tree_connect_reply(status::STATUS_ACCESS_DENIED, 0, ShareType::Disk),
        false,
        None,
    )
    .unwrap();
    let err = denied.check("x").unwrap_err();
    assert_eq!(err.status(), Some(status::STATUS_ACCESS_DENIED));

    let ok = Response::decode(
        tree_connect_reply(status::STATUS_SUCCESS, 1, ShareType::Disk),
        false,
        None,
    )
    .unwrap();
    assert!(ok.check("x").is_ok());
}

#[test]
fn test_warning_status_passes_check() {
    let request = Smb2Header::new(Smb2Command::Ioctl);
    let frame = response(
        &request,
        status::STATUS_BUFFER_OVERFLOW,
        1,
        ioctl_body(fsctl::DFS_GET_REFERRALS, b"partial"),
    );
    let reply = Response::decode(frame, false, None).unwrap();
    assert!(reply.check("x").is_ok());
    match reply.body() {
        ResponseBody::Ioctl { ctl_code, output } => {
            assert_eq!(*ctl_code, fsctl::DFS_GET_REFERRALS);
            assert_eq!(&output[..], b"partial");
        }
        other => panic!("unexpected body {:?}", other),
    }
}

#[test]
fn test_negotiate_response_decode() {
    let request = Smb2Header::new(Smb2Command::Negotiate);
    let frame = response(
        &request,
        status::STATUS_SUCCESS,
        0,
        negotiate_body(Smb2Dialect::Smb300, Smb2Capabilities::MULTI_CHANNEL),
    );
    let reply = Response::decode(frame, false, None).unwrap();
    match reply.body() {
        ResponseBody::Negotiate(info) => {
            assert_eq!(info.dialect, Smb2Dialect::Smb300);
            assert!(info.capabilities.contains(Smb2Capabilities::MULTI_CHANNEL));
            assert_eq!(info.max_read_size, 1 << 20);
            assert!(info.security_blob.is_empty());
        }
        other => panic!("unexpected body {:?}", other),
    }
}

#[test]
fn test_session_setup_response_flags() {
    let mut request = Smb2Header::new(Smb2Command::SessionSetup);
    request.session_id = 0x44;
    let frame = response(
        &request,
        status::STATUS_SUCCESS,
        0,
        session_setup_body(SessionFlags::IS_GUEST.bits()),
    );
    let reply = Response::decode(frame, false, None).unwrap();
    assert_eq!(reply.session_id(), 0x44);
    match reply.body() {
        ResponseBody::SessionSetup { session_flags, .. } => {
            assert!(session_flags.contains(SessionFlags::IS_GUEST))
        }
        other => panic!("unexpected body {:?}", other),
    }
}

#[test]
fn test_request_frame_is_not_a_response() {
    let frame = Request::new(Operation::Echo).encode(1, None).unwrap();
    assert!(matches!(
        Response::decode(frame, false, None),
        Err(Error::InvalidHeader(_))
    ));
}

#[test]
fn test_ioctl_request_carries_input() {
    let request = Request::new(Operation::Ioctl {
        ctl_code: fsctl::QUERY_NETWORK_INTERFACE_INFO,
        file_id: NO_FILE_ID,
        input: Bytes::from_static(b"abc"),
        max_output: 4096,
    })
    .with_tree(9);
    let frame = request.encode(2, None).unwrap();
    let body = &frame[Smb2Header::SIZE..];
    assert_eq!(LittleEndian::read_u16(&body[0..2]), 57);
    assert_eq!(
        LittleEndian::read_u32(&body[4..8]),
        fsctl::QUERY_NETWORK_INTERFACE_INFO
    );
    let offset = LittleEndian::read_u32(&body[24..28]) as usize;
    assert_eq!(&frame[offset..offset + 3], b"abc");
    assert_eq!(Smb2Header::parse(&frame).unwrap().tree_id, 9);
}
