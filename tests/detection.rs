mod common;

use bytes::Bytes;
use common::render_page;
use image::{GrayImage, Luma};
use tablemap_tracker::camera::{Frame, PixelFormat};
use tablemap_tracker::detection::MarkerDetector;

#[test]
fn detector_finds_every_marker_with_its_identity() {
    let markers = [
        (0u16, 30, 30, 64),
        (77, 150, 40, 72),
        (1234, 290, 30, 64),
        (40000, 60, 180, 80),
        (65535, 240, 190, 64),
    ];
    let img = render_page(420, 320, &markers);
    let detections = MarkerDetector::default().detect(&img);
    assert_eq!(detections.len(), markers.len());

    let mut found: Vec<u16> = detections.iter().map(|d| d.identity()).collect();
    found.sort_unstable();
    let mut expected: Vec<u16> = markers.iter().map(|m| m.0).collect();
    expected.sort_unstable();
    assert_eq!(found, expected);

    for d in &detections {
        let &(_, left, top, size) = markers.iter().find(|m| m.0 == d.identity()).unwrap();
        let c = d.corners().center();
        let expected = (left as f64 + size as f64 / 2.0, top as f64 + size as f64 / 2.0);
        assert!((c.x - expected.0).abs() < 1.5 && (c.y - expected.1).abs() < 1.5);
        assert!(d.pose().is_none());
    }
}

#[test]
fn empty_frame_yields_no_detections() {
    let detector = MarkerDetector::default();
    let blank = GrayImage::from_pixel(320, 240, Luma([200]));
    assert!(detector.detect(&blank).is_empty());

    let noise = GrayImage::from_fn(320, 240, |x, y| Luma([((x * 31 + y * 17) % 256) as u8]));
    assert!(detector.detect(&noise).is_empty());
}

#[test]
fn color_frames_are_detected_through_luma() {
    let img = render_page(200, 160, &[(512, 60, 40, 72)]);
    let rgb: Vec<u8> = img.pixels().flat_map(|p| [p[0], p[0], p[0]]).collect();
    let frame = Frame::new(200, 160, PixelFormat::Rgb8, Bytes::from(rgb)).unwrap();
    let detections = MarkerDetector::default().detect_frame(&frame).unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].identity(), 512);
}
