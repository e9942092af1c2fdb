//! Transaction-level tests over loopback UDP

use std::time::Duration;

use voxide_sip_core::types::MessageExt;
use voxide_sip_core::{
    Method, Request, Response, StatusCode, TransportKind, UserAgent,
};

fn options_request(to_host: &str) -> Request {
    let mut req = Request::new(Method::Options, format!("sip:{}", to_host).parse().unwrap());
    req.headers.push("From", "<sip:tester@127.0.0.1>;tag=tag1");
    req.headers.push("To", format!("<sip:{}>", to_host));
    req.headers.push("Call-ID", voxide_sip_core::new_call_id());
    req.headers.push("CSeq", "1 OPTIONS");
    req
}

#[tokio::test]
async fn options_round_trip_over_udp() {
    let server = UserAgent::new();
    let server_addr = server.bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let mut incoming = server.take_incoming().unwrap();

    let client = UserAgent::new();
    client.bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap();

    // Server answers the first request with 200.
    let responder = tokio::spawn(async move {
        let req = incoming.recv().await.expect("incoming request");
        assert_eq!(req.request.method, Method::Options);
        let tx = req.tx.expect("server transaction");
        tx.respond(Response::for_request(StatusCode::OK, &tx.request))
            .await
            .unwrap();
    });

    let req = options_request(&server_addr.to_string());
    let mut tx = client
        .send_request(req, server_addr, TransportKind::Udp)
        .await
        .unwrap();
    let resp = tokio::time::timeout(Duration::from_secs(5), tx.wait_final())
        .await
        .expect("response before timeout")
        .unwrap();
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.cseq().unwrap().method, Method::Options);

    responder.await.unwrap();
}

#[tokio::test]
async fn request_retransmission_is_absorbed() {
    let server = UserAgent::new();
    let server_addr = server.bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let mut incoming = server.take_incoming().unwrap();

    // Raw client socket so we control retransmission ourselves.
    let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut req = options_request(&server_addr.to_string());
    req.headers.push_front(
        "Via",
        format!(
            "SIP/2.0/UDP 127.0.0.1:{};branch=z9hG4bKretrans1",
            sock.local_addr().unwrap().port()
        ),
    );
    let wire = req.render();

    sock.send_to(&wire, server_addr).await.unwrap();
    let first = incoming.recv().await.unwrap();
    first
        .tx
        .as_ref()
        .unwrap()
        .respond_status(StatusCode::OK)
        .await
        .unwrap();

    // The retransmitted request must not surface again; the transaction
    // replays its stored response instead.
    sock.send_to(&wire, server_addr).await.unwrap();
    let mut buf = [0u8; 2048];

    let mut responses = 0;
    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_secs(2), sock.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) => {
                let text = String::from_utf8_lossy(&buf[..n]).to_string();
                assert!(text.starts_with("SIP/2.0 200"));
                responses += 1;
            }
            _ => break,
        }
    }
    assert_eq!(responses, 2, "expected the 200 to be replayed once");

    assert!(
        tokio::time::timeout(Duration::from_millis(200), incoming.recv())
            .await
            .is_err(),
        "retransmission must not reach the application"
    );
}
