//! End-to-end call flows over loopback UDP

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use voxide::media::{copy_audio, AudioReader, AudioWriter, Codec, PCMA, PCMU, TELEPHONE_EVENT};
use voxide::sip::{StatusCode, TransportKind, Uri};
use voxide::{Endpoint, EndpointConfig, InviteOptions, TransportConfig};

async fn endpoint_with(codecs: Vec<Codec>) -> Arc<Endpoint> {
    let config = EndpointConfig {
        transports: vec![TransportConfig::udp("127.0.0.1:0".parse().unwrap())],
        media_ip: "127.0.0.1".parse().unwrap(),
        codecs,
        ..Default::default()
    };
    Endpoint::new(config).await.unwrap()
}

fn uri_of(endpoint: &Endpoint, user: &str) -> Uri {
    format!(
        "sip:{}@{}",
        user,
        endpoint.local_addr(TransportKind::Udp).unwrap()
    )
    .parse()
    .unwrap()
}

#[tokio::test]
async fn echo_call_round_trips_media() {
    let server = endpoint_with(vec![PCMU, PCMA, TELEPHONE_EVENT]).await;
    let caller = endpoint_with(vec![PCMU, TELEPHONE_EVENT]).await;

    let serving = server.clone();
    tokio::spawn(async move {
        serving
            .serve(|call| async move {
                assert_eq!(call.to_user(), "alice");
                if call.answer().await.is_err() {
                    return;
                }
                let mut reader = call.audio_reader().unwrap();
                let mut writer = call.audio_writer().unwrap();
                let frame = call
                    .media()
                    .session()
                    .unwrap()
                    .audio_codec()
                    .unwrap()
                    .payload_frame_len();
                copy_audio(&mut reader, &mut writer, frame).await.ok();
            })
            .await
            .unwrap();
    });

    let dummy = caller.clone();
    tokio::spawn(async move {
        dummy.serve(|_call| async move {}).await.ok();
    });

    let call = caller
        .dial(uri_of(&server, "alice"), InviteOptions::default())
        .await
        .unwrap();

    // Negotiated down to the caller's PCMU.
    let codec = call.media().session().unwrap().audio_codec().unwrap();
    assert_eq!(codec, PCMU);

    let payload: Vec<u8> = (0..160u32).map(|i| (i % 249) as u8).collect();
    let mut writer = call.audio_writer().unwrap();
    writer.write(&payload).await.unwrap();

    let mut reader = call.audio_reader().unwrap();
    let mut echoed = [0u8; 512];
    let n = tokio::time::timeout(Duration::from_secs(3), reader.read(&mut echoed))
        .await
        .expect("echo within deadline")
        .unwrap();
    assert_eq!(n, 160);
    assert_eq!(&echoed[..160], &payload[..]);

    call.hangup().await.unwrap();
}

#[tokio::test]
async fn rejected_call_surfaces_status() {
    let server = endpoint_with(vec![PCMU]).await;
    let caller = endpoint_with(vec![PCMU]).await;

    let serving = server.clone();
    tokio::spawn(async move {
        serving
            .serve(|call| async move {
                call.respond(StatusCode::BUSY_HERE, None, None, &[])
                    .await
                    .ok();
            })
            .await
            .unwrap();
    });

    let err = caller
        .dial(uri_of(&server, "busy"), InviteOptions::default())
        .await
        .unwrap_err();
    match err {
        voxide::VoxideError::CallRejected { code, .. } => assert_eq!(code, 486),
        other => panic!("expected CallRejected, got {:?}", other),
    }
}

#[tokio::test]
async fn refer_transfer_notifies_and_carries_referred_by() {
    let transferee = endpoint_with(vec![PCMU, TELEPHONE_EVENT]).await;
    let transferor = endpoint_with(vec![PCMU, TELEPHONE_EVENT]).await;
    let target = endpoint_with(vec![PCMU, TELEPHONE_EVENT]).await;

    // The transferee answers and stays in the call until it ends.
    let serving = transferee.clone();
    tokio::spawn(async move {
        serving
            .serve(|call| async move {
                if call.answer().await.is_ok() {
                    call.wait_terminated().await;
                }
            })
            .await
            .unwrap();
    });

    // The transfer target answers and reports the Referred-By it saw.
    let (referred_by_tx, mut referred_by_rx) = mpsc::unbounded_channel();
    let serving_target = target.clone();
    tokio::spawn(async move {
        serving_target
            .serve(move |call| {
                let referred_by_tx = referred_by_tx.clone();
                async move {
                    let referred_by = call
                        .invite_request()
                        .headers
                        .get("Referred-By")
                        .map(str::to_string);
                    referred_by_tx.send(referred_by).ok();
                    if call.answer().await.is_ok() {
                        call.wait_terminated().await;
                    }
                }
            })
            .await
            .unwrap();
    });

    let dummy = transferor.clone();
    tokio::spawn(async move {
        dummy.serve(|_call| async move {}).await.ok();
    });

    let call = transferor
        .dial(uri_of(&transferee, "bob"), InviteOptions::default())
        .await
        .unwrap();

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    call.on_notify(move |code| {
        notify_tx.send(code).ok();
    });

    call.refer(&uri_of(&target, "carol")).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), notify_rx.recv())
        .await
        .expect("first NOTIFY")
        .unwrap();
    assert_eq!(first, 100, "first NOTIFY carries SIP/2.0 100 Trying");

    let last = tokio::time::timeout(Duration::from_secs(5), notify_rx.recv())
        .await
        .expect("terminal NOTIFY")
        .unwrap();
    assert_eq!(last, 200, "terminal NOTIFY carries SIP/2.0 200 OK");

    let referred_by = tokio::time::timeout(Duration::from_secs(2), referred_by_rx.recv())
        .await
        .expect("target saw the INVITE")
        .unwrap();
    assert!(
        referred_by.is_some(),
        "triggered INVITE must carry Referred-By"
    );

    call.hangup().await.ok();
}

#[tokio::test]
async fn refer_to_busy_target_reports_failure() {
    let transferee = endpoint_with(vec![PCMU]).await;
    let transferor = endpoint_with(vec![PCMU]).await;
    let target = endpoint_with(vec![PCMU]).await;

    let serving = transferee.clone();
    tokio::spawn(async move {
        serving
            .serve(|call| async move {
                if call.answer().await.is_ok() {
                    call.wait_terminated().await;
                }
            })
            .await
            .unwrap();
    });

    let busy = target.clone();
    tokio::spawn(async move {
        busy.serve(|call| async move {
            call.respond(StatusCode::BUSY_HERE, None, None, &[])
                .await
                .ok();
        })
        .await
        .unwrap();
    });

    let dummy = transferor.clone();
    tokio::spawn(async move {
        dummy.serve(|_call| async move {}).await.ok();
    });

    let call = transferor
        .dial(uri_of(&transferee, "bob"), InviteOptions::default())
        .await
        .unwrap();

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    call.on_notify(move |code| {
        notify_tx.send(code).ok();
    });

    call.refer(&uri_of(&target, "nobody")).await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let code = tokio::time::timeout(Duration::from_secs(5), notify_rx.recv())
            .await
            .expect("NOTIFY within deadline")
            .unwrap();
        seen.push(code);
    }
    assert_eq!(seen[0], 100);
    assert_eq!(seen[1], 486, "failure sipfrag mirrors the target's answer");

    call.hangup().await.ok();
}
