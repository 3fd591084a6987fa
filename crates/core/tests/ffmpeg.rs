use slomo_core::ffmpeg::Ffmpeg;
use slomo_core::frame_store::{FrameStore, FrameWriter};
use slomo_core::types::{Dimensions, Frame};

/// Needs an `ffmpeg` binary on PATH.
#[test]
#[ignore]
fn encode_then_extract_preserves_frames() {
    let temp = tempfile::tempdir().unwrap();
    let frames_dir = temp.path().join("frames");
    let decoded_dir = temp.path().join("decoded");
    std::fs::create_dir_all(&decoded_dir).unwrap();
    let video = temp.path().join("clip.mkv");

    let dims = Dimensions::new(64, 32);
    let mut writer = FrameWriter::create(&frames_dir).unwrap();
    for value in [0u8, 64, 128, 192, 255] {
        writer
            .write(&Frame::new(vec![value; dims.pixel_count() * 3], dims))
            .unwrap();
    }

    let ffmpeg = Ffmpeg::default();
    ffmpeg.encode_video(&frames_dir, 24.0, &video).unwrap();
    assert!(video.is_file());

    ffmpeg.extract_frames(&video, &decoded_dir).unwrap();
    let store = FrameStore::open(&decoded_dir).unwrap();
    assert_eq!(store.len(), 5);
    assert_eq!(store.dimensions().unwrap(), dims);
}
