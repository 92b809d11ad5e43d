use std::io::Cursor;
use std::time::Duration;

use anyhow::bail;
use tokio::time::timeout;

use rpc_mamont::protocol::rpc::{handle_message, CallContext, ProgramRegistry};
use rpc_mamont::server::RpcServer;
use rpc_mamont::tcp::TcpTransportClient;
use rpc_mamont::xdr::schema::{Descriptor, Value};
use rpc_mamont::xdr::{self, deserialize, Serialize};

const PROGRAM: u32 = 200_100;

/// A registry with a doubling procedure on versions 1 and 2 and a
/// deliberately failing procedure 9 on version 1.
fn test_registry() -> ProgramRegistry {
    let mut registry = ProgramRegistry::new();
    for version in [1, 2] {
        registry.register(
            PROGRAM,
            version,
            0,
            Descriptor::UnsignedInt,
            Descriptor::UnsignedInt,
            |_ctx, _call, args| match args.as_uint() {
                Some(v) => Ok(Value::UnsignedInt(v.wrapping_mul(2))),
                None => bail!("not an unsigned int"),
            },
        );
    }
    registry.register(PROGRAM, 1, 9, Descriptor::Void, Descriptor::Void, |_ctx, _call, _args| {
        bail!("handler blew up")
    });
    registry
}

fn test_context() -> CallContext {
    CallContext {
        local_port: 0,
        client_addr: "127.0.0.1:1234".to_string(),
        auth: xdr::rpc::auth_unix::default(),
    }
}

fn call_message(xid: u32, prog: u32, vers: u32, proc: u32, args: &[u8]) -> Vec<u8> {
    call_message_vers(xid, 2, prog, vers, proc, args)
}

fn call_message_vers(
    xid: u32,
    rpcvers: u32,
    prog: u32,
    vers: u32,
    proc: u32,
    args: &[u8],
) -> Vec<u8> {
    let call = xdr::rpc::call_body {
        rpcvers,
        prog,
        vers,
        proc,
        cred: xdr::rpc::opaque_auth::default(),
        verf: xdr::rpc::opaque_auth::default(),
    };
    let msg = xdr::rpc::rpc_msg { xid, body: xdr::rpc::rpc_body::CALL(call) };
    let mut buf = Vec::new();
    msg.serialize(&mut buf).expect("serialize rpc_msg");
    buf.extend_from_slice(args);
    buf
}

/// Dispatches one message and splits the reply into its decoded header and
/// the trailing result bytes.
fn dispatch(registry: &ProgramRegistry, message: &[u8]) -> (xdr::rpc::rpc_msg, Vec<u8>) {
    let reply = handle_message(registry, &test_context(), message)
        .expect("dispatch failed")
        .expect("expected a reply");
    let mut cursor = Cursor::new(reply.as_slice());
    let header = deserialize::<xdr::rpc::rpc_msg>(&mut cursor).expect("deserialize reply");
    let rest = reply[cursor.position() as usize..].to_vec();
    (header, rest)
}

fn accept_body_of(header: &xdr::rpc::rpc_msg) -> &xdr::rpc::accept_body {
    match &header.body {
        xdr::rpc::rpc_body::REPLY(xdr::rpc::reply_body::MSG_ACCEPTED(accepted)) => {
            &accepted.reply_data
        }
        other => panic!("expected MSG_ACCEPTED, got {other:?}"),
    }
}

#[test]
fn successful_call_echoes_xid_and_carries_result() {
    let registry = test_registry();
    let args = 21u32.to_be_bytes();
    let (header, rest) = dispatch(&registry, &call_message(7, PROGRAM, 1, 0, &args));

    assert_eq!(header.xid, 7);
    assert!(matches!(accept_body_of(&header), xdr::rpc::accept_body::SUCCESS));

    let result = Descriptor::UnsignedInt.decode(&mut rest.as_slice()).expect("decode result");
    assert_eq!(result.as_uint(), Some(42));
}

#[test]
fn unknown_program_gets_prog_unavail() {
    let registry = test_registry();
    let (header, _) = dispatch(&registry, &call_message(8, PROGRAM + 1, 1, 0, &[]));

    assert_eq!(header.xid, 8);
    assert!(matches!(accept_body_of(&header), xdr::rpc::accept_body::PROG_UNAVAIL));
}

#[test]
fn unknown_version_reports_supported_range() {
    let registry = test_registry();
    let (header, _) = dispatch(&registry, &call_message(9, PROGRAM, 3, 0, &[]));

    match accept_body_of(&header) {
        xdr::rpc::accept_body::PROG_MISMATCH(info) => {
            assert_eq!(info.low, 1);
            assert_eq!(info.high, 2);
        }
        other => panic!("expected PROG_MISMATCH, got {other:?}"),
    }
}

#[test]
fn unknown_procedure_gets_proc_unavail() {
    let registry = test_registry();
    let (header, _) = dispatch(&registry, &call_message(10, PROGRAM, 1, 55, &[]));

    assert_eq!(header.xid, 10);
    assert!(matches!(accept_body_of(&header), xdr::rpc::accept_body::PROC_UNAVAIL));
}

#[test]
fn wrong_rpc_version_is_denied_with_rpc_mismatch() {
    let registry = test_registry();
    let (header, _) =
        dispatch(&registry, &call_message_vers(11, 3, PROGRAM, 1, 0, &0u32.to_be_bytes()));

    assert_eq!(header.xid, 11);
    match header.body {
        xdr::rpc::rpc_body::REPLY(xdr::rpc::reply_body::MSG_DENIED(
            xdr::rpc::rejected_reply::RPC_MISMATCH(info),
        )) => {
            assert_eq!(info.low, 2);
            assert_eq!(info.high, 2);
        }
        other => panic!("expected MSG_DENIED RPC_MISMATCH, got {other:?}"),
    }
}

#[test]
fn undecodable_arguments_get_garbage_args() {
    let registry = test_registry();
    // Truncated argument: the procedure expects a u32 and gets one byte.
    let (header, _) = dispatch(&registry, &call_message(12, PROGRAM, 1, 0, &[0xAB]));

    assert_eq!(header.xid, 12);
    assert!(matches!(accept_body_of(&header), xdr::rpc::accept_body::GARBAGE_ARGS));
}

#[test]
fn failing_handler_gets_system_err() {
    let registry = test_registry();
    let (header, _) = dispatch(&registry, &call_message(13, PROGRAM, 1, 9, &[]));

    assert_eq!(header.xid, 13);
    assert!(matches!(accept_body_of(&header), xdr::rpc::accept_body::SYSTEM_ERR));
}

#[test]
fn result_not_matching_return_shape_gets_system_err() {
    let mut registry = ProgramRegistry::new();
    registry.register(
        PROGRAM,
        1,
        0,
        Descriptor::Void,
        Descriptor::UnsignedInt,
        |_ctx, _call, _args| Ok(Value::String("wrong shape".into())),
    );

    let (header, rest) = dispatch(&registry, &call_message(14, PROGRAM, 1, 0, &[]));
    assert_eq!(header.xid, 14);
    assert!(matches!(accept_body_of(&header), xdr::rpc::accept_body::SYSTEM_ERR));
    assert!(rest.is_empty(), "an error reply must carry no result bytes");
}

#[test]
fn undecodable_header_produces_no_reply() {
    let registry = test_registry();
    let reply = handle_message(&registry, &test_context(), &[1, 2, 3])
        .expect("dispatch failed");
    assert!(reply.is_none());
}

#[test]
fn inbound_reply_message_produces_no_reply() {
    let registry = test_registry();
    let msg = xdr::rpc::success_reply_message(77);
    let mut buf = Vec::new();
    msg.serialize(&mut buf).expect("serialize rpc_msg");

    let reply = handle_message(&registry, &test_context(), &buf).expect("dispatch failed");
    assert!(reply.is_none());
}

#[test]
fn auth_unix_credentials_reach_the_handler() {
    let creds = xdr::rpc::auth_unix {
        stamp: 1,
        machinename: b"testhost".to_vec(),
        uid: 501,
        gid: 20,
        gids: vec![20, 512],
    };
    let mut cred_body = Vec::new();
    creds.serialize(&mut cred_body).expect("serialize auth_unix");

    let mut registry = ProgramRegistry::new();
    registry.register(
        PROGRAM,
        1,
        0,
        Descriptor::Void,
        Descriptor::UnsignedInt,
        |ctx, _call, _args| Ok(Value::UnsignedInt(ctx.auth.uid)),
    );

    let call = xdr::rpc::call_body {
        rpcvers: 2,
        prog: PROGRAM,
        vers: 1,
        proc: 0,
        cred: xdr::rpc::opaque_auth { flavor: xdr::rpc::auth_flavor::AUTH_UNIX, body: cred_body },
        verf: xdr::rpc::opaque_auth::default(),
    };
    let msg = xdr::rpc::rpc_msg { xid: 15, body: xdr::rpc::rpc_body::CALL(call) };
    let mut buf = Vec::new();
    msg.serialize(&mut buf).expect("serialize rpc_msg");

    let (header, rest) = dispatch(&registry, &buf);
    assert!(matches!(accept_body_of(&header), xdr::rpc::accept_body::SUCCESS));
    let result = Descriptor::UnsignedInt.decode(&mut rest.as_slice()).expect("decode result");
    assert_eq!(result.as_uint(), Some(501));
}

#[tokio::test]
async fn end_to_end_call_over_tcp() {
    let mut server = RpcServer::bind("127.0.0.1:0").await.expect("bind server");
    server.register(
        PROGRAM,
        1,
        0,
        Descriptor::string(64),
        Descriptor::string(64),
        |_ctx, _call, args| match args.as_str() {
            Some(text) => Ok(Value::String(text.to_uppercase())),
            None => bail!("not a string"),
        },
    );
    let addr = server.local_addr().expect("server addr");

    let mut client =
        TcpTransportClient::connect(&addr.to_string()).await.expect("connect client");
    let args = Descriptor::string(64)
        .encode_to_vec(&Value::String("hello".into()))
        .expect("encode args");
    client.push_message(call_message(99, PROGRAM, 1, 0, &args), true);

    let reply = timeout(Duration::from_secs(5), async {
        loop {
            server.cycle(Duration::from_millis(10)).await;
            client.cycle(Duration::from_millis(10)).await.expect("client cycle");
            if let Some(reply) = client.pop_message() {
                return reply;
            }
        }
    })
    .await
    .expect("no reply within timeout");

    let mut cursor = Cursor::new(reply.as_slice());
    let header = deserialize::<xdr::rpc::rpc_msg>(&mut cursor).expect("deserialize reply");
    assert_eq!(header.xid, 99);
    assert!(matches!(accept_body_of(&header), xdr::rpc::accept_body::SUCCESS));

    let result = Descriptor::string(64)
        .decode(&mut &reply[cursor.position() as usize..])
        .expect("decode result");
    assert_eq!(result.as_str(), Some("HELLO"));
}
