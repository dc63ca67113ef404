use framelink::network::{decode_length, FrameCodec, LENGTH_PREFIX_SIZE};
use framelink::AppError;
use tokio::io::{duplex, AsyncWriteExt};

#[tokio::test]
async fn test_frames_survive_one_byte_chunks() {
    let codec = FrameCodec::default();
    // the pipe never holds more than a single byte
    let (mut tx, mut rx) = duplex(1);

    let writer = tokio::spawn(async move {
        for payload in ["hello", "", "grüße", "last"] {
            codec.write_frame(&mut tx, payload).await.unwrap();
        }
    });

    let mut received = Vec::new();
    while let Some(payload) = codec.read_frame(&mut rx).await.unwrap() {
        received.push(payload);
    }
    writer.await.unwrap();
    assert_eq!(received, vec!["hello", "", "grüße", "last"]);
}

#[tokio::test]
async fn test_end_of_stream_versus_reset() {
    let codec = FrameCodec::default();

    let mut empty: &[u8] = &[];
    assert!(codec.read_frame(&mut empty).await.unwrap().is_none());

    let mut short_prefix: &[u8] = &[5, 0];
    assert!(matches!(
        codec.read_frame(&mut short_prefix).await,
        Err(AppError::ConnectionReset(_))
    ));

    let mut short_payload: &[u8] = &[5, 0, 0, 0, b'h', b'e'];
    assert!(matches!(
        codec.read_frame(&mut short_payload).await,
        Err(AppError::ConnectionReset(_))
    ));
}

#[tokio::test]
async fn test_reader_stops_at_frame_boundary() {
    let codec = FrameCodec::default();
    let mut wire = codec.encode("first").unwrap().to_vec();
    wire.extend_from_slice(&codec.encode("second").unwrap());
    let mut reader: &[u8] = &wire;

    assert_eq!(codec.read_frame(&mut reader).await.unwrap().unwrap(), "first");
    assert_eq!(codec.read_frame(&mut reader).await.unwrap().unwrap(), "second");
    assert!(codec.read_frame(&mut reader).await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_frames_are_rejected() {
    let codec = FrameCodec::new(8);

    let mut negative: &[u8] = &(-1i32).to_le_bytes();
    assert!(matches!(
        codec.read_frame(&mut negative).await,
        Err(AppError::MalformedFrame(_))
    ));

    let mut oversized: &[u8] = &9i32.to_le_bytes();
    assert!(matches!(
        codec.read_frame(&mut oversized).await,
        Err(AppError::FrameTooLarge { size: 9, limit: 8 })
    ));

    let mut not_utf8: &[u8] = &[2, 0, 0, 0, 0xff, 0xfe];
    assert!(matches!(
        codec.read_frame(&mut not_utf8).await,
        Err(AppError::MalformedFrame(_))
    ));
}

#[tokio::test]
async fn test_prefix_is_little_endian() {
    let codec = FrameCodec::default();
    let (mut tx, mut rx) = duplex(64);
    tx.write_all(&[3, 0, 0, 0]).await.unwrap();
    tx.write_all(b"abc").await.unwrap();
    drop(tx);

    assert_eq!(decode_length([3, 0, 0, 0]), 3);
    assert_eq!(codec.encode("abc").unwrap()[..LENGTH_PREFIX_SIZE], [3, 0, 0, 0]);
    assert_eq!(codec.read_frame(&mut rx).await.unwrap().unwrap(), "abc");
}
