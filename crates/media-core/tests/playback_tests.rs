//! Playback engine tests: in-memory WAV, RTP packetization, ranged HTTP

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use voxide_media_core::{
    AudioPlayback, AudioWriter, MediaError, MediaSession, Result as MediaResult, RtpPacket,
    RtpWriter, PCMU,
};

/// 8 kHz mono 16-bit WAV with `n` samples of a ramp, built with hound
fn wav_fixture(n: usize) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..n {
            writer.write_sample(((i * 37) % 20000) as i16 - 10000).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

#[derive(Default)]
struct CountingSink {
    frames: Vec<usize>,
}

#[async_trait]
impl AudioWriter for CountingSink {
    async fn write(&mut self, buf: &[u8]) -> MediaResult<usize> {
        self.frames.push(buf.len());
        Ok(buf.len())
    }
}

#[tokio::test]
async fn plays_wav_in_codec_frames() {
    // Half a second of audio: 4000 samples, 8000 PCM bytes, 25 full frames.
    let wav = wav_fixture(4000);
    let mut playback = AudioPlayback::new(Box::new(CountingSink::default()), PCMU).unwrap();
    let written = playback.play(Cursor::new(wav), "audio/wav").await.unwrap();
    assert_eq!(written, 8000);
    assert_eq!(playback.total_written(), 8000);
}

#[tokio::test]
async fn rejects_mismatched_wav() {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 44_100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.finalize().unwrap();
    }
    let mut playback = AudioPlayback::new(Box::new(CountingSink::default()), PCMU).unwrap();
    let err = playback
        .play(Cursor::new(cursor.into_inner()), "audio/wav")
        .await
        .unwrap_err();
    assert!(matches!(err, MediaError::InvalidWav(_)));
}

#[tokio::test]
async fn playback_over_rtp_paces_one_packet_per_frame() {
    let session = Arc::new(
        MediaSession::new("127.0.0.1".parse().unwrap(), vec![PCMU])
            .await
            .unwrap(),
    );
    // Receive on a raw socket standing in for the peer.
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_port = peer.local_addr().unwrap().port();
    let remote_sdp = format!(
        "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=t\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\n\
         m=audio {} RTP/AVP 0\r\n",
        peer_port
    );
    session.set_remote_sdp(remote_sdp.as_bytes()).unwrap();

    let writer = Arc::new(RtpWriter::new(session.clone()).unwrap());
    let mut playback = AudioPlayback::new(Box::new(writer), PCMU).unwrap();

    // 300 ms of audio: 2400 samples, 15 packets.
    let wav = wav_fixture(2400);
    let play = tokio::spawn(async move {
        playback.play(Cursor::new(wav), "audio/wav").await.unwrap()
    });

    let mut buf = [0u8; 2048];
    let mut packets = Vec::new();
    for _ in 0..15 {
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .expect("packet within deadline")
            .unwrap();
        packets.push(RtpPacket::parse(&buf[..n]).unwrap());
    }
    let written = play.await.unwrap();
    assert_eq!(written, 4800, "all PCM bytes written");

    for pair in packets.windows(2) {
        assert_eq!(
            pair[1].header.sequence_number,
            pair[0].header.sequence_number.wrapping_add(1)
        );
        assert_eq!(pair[1].header.timestamp.wrapping_sub(pair[0].header.timestamp), 160);
    }
    assert!(packets.iter().all(|p| p.payload.len() == 160));
    assert!(packets.iter().all(|p| p.header.payload_type == 0));
}

/// Minimal range-aware HTTP server for one resource
async fn serve_ranges(
    listener: TcpListener,
    body: Arc<Vec<u8>>,
    ranges_tx: mpsc::UnboundedSender<String>,
) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let body = body.clone();
        let ranges_tx = ranges_tx.clone();
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                // One request per iteration; connections are reused.
                let head_end = loop {
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                };
                let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                buf.drain(..head_end);

                let range = head
                    .lines()
                    .find_map(|l| l.strip_prefix("Range: bytes="))
                    .map(str::to_string);
                let response = match range {
                    Some(spec) => {
                        ranges_tx.send(spec.clone()).ok();
                        let (start, end) = spec.split_once('-').unwrap();
                        let start: usize = start.parse().unwrap();
                        let end: usize = end.parse::<usize>().unwrap().min(body.len() - 1);
                        let slice = &body[start..=end];
                        let mut resp = format!(
                            "HTTP/1.1 206 Partial Content\r\n\
                             Content-Range: bytes {}-{}/{}\r\n\
                             Content-Length: {}\r\n\
                             Content-Type: audio/wav\r\n\r\n",
                            start,
                            end,
                            body.len(),
                            slice.len()
                        )
                        .into_bytes();
                        resp.extend_from_slice(slice);
                        resp
                    }
                    None => {
                        let mut resp = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\
                             Content-Type: audio/wav\r\n\r\n",
                            body.len()
                        )
                        .into_bytes();
                        resp.extend_from_slice(&body);
                        resp
                    }
                };
                if stream.write_all(&response).await.is_err() {
                    return;
                }
            }
        });
    }
}

#[tokio::test]
async fn play_url_walks_doubling_range_windows() {
    // ~10 KB resource: 0-1023, 1024-3071, 3072-7167, 7168-...
    let wav = Arc::new(wav_fixture(5000));
    let total = wav.len();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (ranges_tx, mut ranges_rx) = mpsc::unbounded_channel();
    tokio::spawn(serve_ranges(listener, wav.clone(), ranges_tx));

    let mut playback = AudioPlayback::new(Box::new(CountingSink::default()), PCMU).unwrap();
    let written = playback
        .play_url(&format!("http://{}/demo.wav", addr))
        .await
        .unwrap();
    assert_eq!(written as usize, 5000 * 2);

    let mut seen = Vec::new();
    while let Ok(r) = ranges_rx.try_recv() {
        seen.push(r);
    }
    assert_eq!(seen[0], "0-1023");
    assert_eq!(seen[1], "1024-3071");
    assert_eq!(seen[2], "3072-7167");
    // Requested windows keep doubling even when the tail is shorter.
    assert_eq!(seen[3], "7168-15359");
    assert!(total <= 15360, "fixture should fit the fourth window");
}

#[tokio::test]
async fn play_url_surfaces_http_errors() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut sink = [0u8; 1024];
        let _ = stream.read(&mut sink).await;
        let _ = stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .await;
    });

    let mut playback = AudioPlayback::new(Box::new(CountingSink::default()), PCMU).unwrap();
    let err = playback
        .play_url(&format!("http://{}/missing.wav", addr))
        .await
        .unwrap_err();
    assert!(matches!(err, MediaError::Fetch(_)));
}
