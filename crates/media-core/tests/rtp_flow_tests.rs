//! RTP reader/writer flow over loopback sessions

use std::sync::Arc;
use std::time::Duration;

use voxide_media_core::{
    AudioReader, DtmfReader, DtmfWriter, MediaError, MediaSession, RtpReader, RtpScope,
    RtpWriter, PCMA, PCMU, TELEPHONE_EVENT,
};

async fn session_pair() -> (Arc<MediaSession>, Arc<MediaSession>) {
    let codecs = vec![PCMU, PCMA, TELEPHONE_EVENT];
    let a = MediaSession::new("127.0.0.1".parse().unwrap(), codecs.clone())
        .await
        .unwrap();
    let b = MediaSession::new("127.0.0.1".parse().unwrap(), codecs)
        .await
        .unwrap();
    let a_sdp = a.local_sdp();
    let b_sdp = b.local_sdp();
    a.set_remote_sdp(b_sdp.as_bytes()).unwrap();
    b.set_remote_sdp(a_sdp.as_bytes()).unwrap();
    (Arc::new(a), Arc::new(b))
}

#[tokio::test]
async fn paced_frames_arrive_in_order() {
    let (a, b) = session_pair().await;
    let writer = RtpWriter::new(a.clone()).unwrap();
    let reader = RtpReader::new(b.clone()).unwrap();

    let payload: Vec<u8> = (0..480).map(|i| (i % 251) as u8).collect();
    let write = tokio::spawn({
        let writer = Arc::new(writer);
        async move {
            let n = writer.write_payload(&payload).await.unwrap();
            assert_eq!(n, 480);
            writer
        }
    });

    let mut buf = [0u8; 512];
    let mut last_seq = None;
    let mut last_ts = None;
    for i in 0..3 {
        let n = tokio::time::timeout(Duration::from_secs(2), reader.read_payload(&mut buf))
            .await
            .expect("frame within deadline")
            .unwrap();
        assert_eq!(n, 160, "frame {}", i);
        let header = reader.last_header();
        if let Some(seq) = last_seq {
            assert_eq!(header.sequence_number, u16::wrapping_add(seq, 1));
        }
        if let Some(ts) = last_ts {
            assert_eq!(header.timestamp.wrapping_sub(ts), 160);
        }
        assert_eq!(header.marker, i == 0, "marker only on the first packet");
        last_seq = Some(header.sequence_number);
        last_ts = Some(header.timestamp);
    }
    write.await.unwrap();
}

#[tokio::test]
async fn partial_trailing_frame_is_zero_padded() {
    let (a, b) = session_pair().await;
    let writer = Arc::new(RtpWriter::new(a.clone()).unwrap());
    let reader = RtpReader::new(b.clone()).unwrap();

    // Zero-byte write: no packet, no sequence advance.
    assert_eq!(writer.write_payload(&[]).await.unwrap(), 0);

    let n = writer.write_payload(&[0x7F; 200]).await.unwrap();
    assert_eq!(n, 200);

    let mut buf = [0u8; 512];
    let first = reader.read_payload(&mut buf).await.unwrap();
    assert_eq!(first, 160);
    assert!(buf[..160].iter().all(|&b| b == 0x7F));

    let second = reader.read_payload(&mut buf).await.unwrap();
    assert_eq!(second, 160, "trailing frame padded to full length");
    assert!(buf[..40].iter().all(|&b| b == 0x7F));
    assert!(buf[40..160].iter().all(|&b| b == 0));
}

#[tokio::test]
async fn read_deadline_and_close_semantics() {
    let (_a, b) = session_pair().await;
    let reader = RtpReader::new(b.clone()).unwrap();

    b.stop_rtp(RtpScope::Read, tokio::time::Instant::now());
    let mut buf = [0u8; 256];
    assert!(matches!(
        reader.read_payload(&mut buf).await,
        Err(MediaError::Timeout)
    ));

    b.start_rtp(RtpScope::Read);
    b.close();
    assert!(matches!(
        reader.read_payload(&mut buf).await,
        Err(MediaError::Eof)
    ));
}

#[tokio::test]
async fn dtmf_digits_are_diverted_and_deduplicated() {
    let (a, b) = session_pair().await;
    let writer = Arc::new(RtpWriter::new(a.clone()).unwrap());
    let dtmf_writer = DtmfWriter::new(writer.clone());

    let reader = Arc::new(RtpReader::new(b.clone()).unwrap());
    let mut dtmf_reader = DtmfReader::new(&reader);

    // The diversion only runs while audio reads are in flight.
    let audio_pump = tokio::spawn({
        let mut source = reader.clone();
        async move {
            let mut buf = [0u8; 512];
            loop {
                match source.read(&mut buf).await {
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        }
    });

    dtmf_writer.write_digit('5').await.unwrap();
    let digit = tokio::time::timeout(Duration::from_secs(2), dtmf_reader.recv())
        .await
        .expect("digit within deadline");
    assert_eq!(digit, Some('5'));

    dtmf_writer.write_digit('#').await.unwrap();
    let digit = tokio::time::timeout(Duration::from_secs(2), dtmf_reader.recv())
        .await
        .expect("digit within deadline");
    assert_eq!(digit, Some('#'));

    // Closing the session ends both the audio pump and the digit stream.
    b.close();
    audio_pump.await.unwrap();
    assert_eq!(dtmf_reader.recv().await, None);
}

#[tokio::test]
async fn session_swap_continues_sequence_and_timestamp() {
    let (a, b) = session_pair().await;
    let writer = Arc::new(RtpWriter::new(a.clone()).unwrap());
    let reader = RtpReader::new(b.clone()).unwrap();

    writer.write_payload(&[1u8; 160]).await.unwrap();
    let mut buf = [0u8; 512];
    reader.read_payload(&mut buf).await.unwrap();
    let before = reader.last_header();

    // Fork the sending side, as a re-INVITE would, and keep writing.
    let forked = Arc::new(a.fork().await.unwrap());
    writer.update_session(forked).await.unwrap();
    writer.write_payload(&[2u8; 160]).await.unwrap();

    reader.read_payload(&mut buf).await.unwrap();
    let after = reader.last_header();

    assert_eq!(
        after.sequence_number,
        before.sequence_number.wrapping_add(1),
        "sequence continues across the swap"
    );
    assert!(
        after.timestamp.wrapping_sub(before.timestamp) >= 160,
        "timestamp advances monotonically across the swap"
    );
}
