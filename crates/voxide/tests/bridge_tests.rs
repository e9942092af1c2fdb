//! Proxy bridge and mixer behavior over loopback calls

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use voxide::media::{AudioReader, AudioWriter, Codec, PCMA, PCMU};
use voxide::sip::{TransportKind, Uri};
use voxide::{
    Bridge, DialogSession, Endpoint, EndpointConfig, InviteOptions, Mixer, TransportConfig,
};

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

/// Serving endpoint that answers and parks every call into `bridge`,
/// reporting each add outcome
fn serve_into_bridge(
    endpoint: Arc<Endpoint>,
    bridge: Arc<Bridge>,
    results: mpsc::UnboundedSender<Result<(), String>>,
) {
    tokio::spawn(async move {
        endpoint
            .serve(move |call| {
                let bridge = bridge.clone();
                let results = results.clone();
                async move {
                    if call.answer().await.is_err() {
                        return;
                    }
                    let outcome = bridge
                        .add_dialog_session(call.clone())
                        .await
                        .map_err(|e| e.to_string());
                    let ok = outcome.is_ok();
                    results.send(outcome).ok();
                    if ok {
                        call.wait_terminated().await;
                    }
                }
            })
            .await
            .unwrap();
    });
}

#[tokio::test]
async fn proxy_bridge_forwards_bytes_between_legs() {
    let server = endpoint_with(vec![PCMA, PCMU]).await;
    let leg_a = endpoint_with(vec![PCMA]).await;
    let leg_b = endpoint_with(vec![PCMA]).await;

    let bridge = Bridge::new();
    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    serve_into_bridge(server.clone(), bridge.clone(), results_tx);

    for endpoint in [&leg_a, &leg_b] {
        let dummy = endpoint.clone();
        tokio::spawn(async move {
            dummy.serve(|_call| async move {}).await.ok();
        });
    }

    let call_a = leg_a
        .dial(uri_of(&server, "bridge"), InviteOptions::default())
        .await
        .unwrap();
    results_rx.recv().await.unwrap().unwrap();
    let call_b = leg_b
        .dial(uri_of(&server, "bridge"), InviteOptions::default())
        .await
        .unwrap();
    results_rx.recv().await.unwrap().unwrap();
    assert_eq!(bridge.member_count(), 2);

    // A speaks, B hears the identical bytes.
    let message = b"hello world";
    let payload: Vec<u8> = message.iter().copied().cycle().take(1600).collect();
    let mut writer = call_a.audio_writer().unwrap();
    let mut reader = call_b.audio_reader().unwrap();

    let send = tokio::spawn({
        let payload = payload.clone();
        async move {
            writer.write(&payload).await.unwrap();
        }
    });

    let mut received = Vec::new();
    let mut buf = [0u8; 512];
    while received.len() < payload.len() {
        let n = tokio::time::timeout(Duration::from_secs(3), reader.read(&mut buf))
            .await
            .expect("bridged frame within deadline")
            .unwrap();
        received.extend_from_slice(&buf[..n]);
    }
    send.await.unwrap();
    assert_eq!(&received[..payload.len()], &payload[..]);

    call_a.hangup().await.ok();
    call_b.hangup().await.ok();
}

#[tokio::test]
async fn proxy_bridge_refuses_a_third_member() {
    let server = endpoint_with(vec![PCMU]).await;
    let legs = [
        endpoint_with(vec![PCMU]).await,
        endpoint_with(vec![PCMU]).await,
        endpoint_with(vec![PCMU]).await,
    ];

    let bridge = Bridge::new();
    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    serve_into_bridge(server.clone(), bridge.clone(), results_tx);

    let mut calls = Vec::new();
    for leg in &legs {
        let dummy = leg.clone();
        tokio::spawn(async move {
            dummy.serve(|_call| async move {}).await.ok();
        });
        calls.push(
            leg.dial(uri_of(&server, "bridge"), InviteOptions::default())
                .await
                .unwrap(),
        );
    }

    let outcomes: Vec<_> = [
        results_rx.recv().await.unwrap(),
        results_rx.recv().await.unwrap(),
        results_rx.recv().await.unwrap(),
    ]
    .into_iter()
    .collect();
    assert!(outcomes[0].is_ok());
    assert!(outcomes[1].is_ok());
    let err = outcomes[2].as_ref().unwrap_err();
    assert!(
        err.contains("bridge only supports 2"),
        "unexpected error: {err}"
    );

    for call in calls {
        call.hangup().await.ok();
    }
}

#[tokio::test]
async fn proxy_bridge_refuses_codec_mismatch() {
    let server = endpoint_with(vec![PCMU, PCMA]).await;
    let leg_ulaw = endpoint_with(vec![PCMU]).await;
    let leg_alaw = endpoint_with(vec![PCMA]).await;

    let bridge = Bridge::new();
    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    serve_into_bridge(server.clone(), bridge.clone(), results_tx);

    for endpoint in [&leg_ulaw, &leg_alaw] {
        let dummy = endpoint.clone();
        tokio::spawn(async move {
            dummy.serve(|_call| async move {}).await.ok();
        });
    }

    let call_u = leg_ulaw
        .dial(uri_of(&server, "bridge"), InviteOptions::default())
        .await
        .unwrap();
    results_rx.recv().await.unwrap().unwrap();

    let call_a = leg_alaw
        .dial(uri_of(&server, "bridge"), InviteOptions::default())
        .await
        .unwrap();
    let err = results_rx.recv().await.unwrap().unwrap_err();
    assert!(
        err.contains("no transcoding supported"),
        "unexpected error: {err}"
    );
    assert_eq!(bridge.member_count(), 1, "existing member untouched");

    call_u.hangup().await.ok();
    call_a.hangup().await.ok();
}

#[tokio::test]
async fn mixer_carries_speech_and_subtracts_self() {
    let server = endpoint_with(vec![PCMU]).await;
    let legs = [
        endpoint_with(vec![PCMU]).await,
        endpoint_with(vec![PCMU]).await,
        endpoint_with(vec![PCMU]).await,
    ];

    let mixer = Mixer::new();
    let serving = server.clone();
    let mix = mixer.clone();
    tokio::spawn(async move {
        serving
            .serve(move |call| {
                let mix = mix.clone();
                async move {
                    if call.answer().await.is_err() {
                        return;
                    }
                    if mix.add_dialog_session(call.clone()).await.is_ok() {
                        call.wait_terminated().await;
                        mix.remove_dialog_session(&call.session_id()).await.ok();
                    }
                }
            })
            .await
            .unwrap();
    });

    let mut calls = Vec::new();
    for leg in &legs {
        let dummy = leg.clone();
        tokio::spawn(async move {
            dummy.serve(|_call| async move {}).await.ok();
        });
        calls.push(
            leg.dial(uri_of(&server, "mix"), InviteOptions::default())
                .await
                .unwrap(),
        );
    }
    // Let membership settle.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mixer.member_count().await, 3);
    assert_eq!(mixer.state(), voxide::mixer::MIXER_RUNNING);

    // Only the first member speaks: a loud square-ish tone in µ-law.
    let speaker = &calls[0];
    let loud: Vec<u8> = std::iter::repeat([0x05u8, 0x85u8])
        .flatten()
        .take(160 * 25)
        .collect();
    let mut writer = speaker.audio_writer().unwrap();
    let speak = tokio::spawn(async move {
        writer.write(&loud).await.ok();
    });

    // A listener hears non-silence; the speaker hears the mix minus
    // themselves, which is silence here.
    let mut listener_reader = calls[1].audio_reader().unwrap();
    let mut speaker_reader = calls[0].audio_reader().unwrap();

    let mut heard_speech = false;
    let mut buf = [0u8; 512];
    for _ in 0..30 {
        let n = match tokio::time::timeout(
            Duration::from_millis(500),
            listener_reader.read(&mut buf),
        )
        .await
        {
            Ok(Ok(n)) => n,
            _ => break,
        };
        // µ-law silence encodes as 0xFF/0x7F; the tone does not.
        if buf[..n].iter().filter(|&&b| b != 0xFF && b != 0x7F).count() > n / 2 {
            heard_speech = true;
            break;
        }
    }
    assert!(heard_speech, "listener never heard the speaker");

    let mut speaker_heard_self = false;
    for _ in 0..10 {
        let n = match tokio::time::timeout(
            Duration::from_millis(500),
            speaker_reader.read(&mut buf),
        )
        .await
        {
            Ok(Ok(n)) => n,
            _ => break,
        };
        if buf[..n].iter().filter(|&&b| b != 0xFF && b != 0x7F).count() > n / 2 {
            speaker_heard_self = true;
            break;
        }
    }
    assert!(
        !speaker_heard_self,
        "speaker must not hear their own contribution"
    );

    speak.await.unwrap();
    for call in calls {
        call.hangup().await.ok();
    }
}
