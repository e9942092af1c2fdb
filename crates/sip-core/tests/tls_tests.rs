//! SIP over TLS with a self-signed listener certificate

use std::time::Duration;

use voxide_sip_core::types::MessageExt;
use voxide_sip_core::{
    Method, Request, StatusCode, TlsConfig, TransportKind, UserAgent,
};

fn self_signed() -> TlsConfig {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).unwrap();
    TlsConfig {
        cert_pem: cert.pem().into_bytes(),
        key_pem: key_pair.serialize_pem().into_bytes(),
        insecure_skip_verify: true,
    }
}

#[tokio::test]
async fn options_round_trip_over_tls() {
    let server = UserAgent::new();
    let server_addr = server
        .bind_tls("127.0.0.1:0".parse().unwrap(), self_signed())
        .await
        .unwrap();
    let mut incoming = server.take_incoming().unwrap();

    let client = UserAgent::new();
    client
        .bind_tls("127.0.0.1:0".parse().unwrap(), self_signed())
        .await
        .unwrap();

    let responder = tokio::spawn(async move {
        let req = incoming.recv().await.expect("incoming request");
        assert_eq!(req.transport, TransportKind::Tls);
        let tx = req.tx.expect("server transaction");
        tx.respond_status(StatusCode::OK).await.unwrap();
    });

    let mut req = Request::new(
        Method::Options,
        format!("sip:{};transport=tls", server_addr).parse().unwrap(),
    );
    req.headers.push("From", "<sip:tester@127.0.0.1>;tag=t1");
    req.headers
        .push("To", format!("<sip:{}>", server_addr));
    req.headers.push("Call-ID", voxide_sip_core::new_call_id());
    req.headers.push("CSeq", "1 OPTIONS");

    let mut tx = client
        .send_request(req, server_addr, TransportKind::Tls)
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
