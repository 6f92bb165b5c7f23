//! Unit tests for protocol message encoding and decoding.

use std::path::PathBuf;

use serde_json::{json, Value};

use diffusion_bridge::models::request::GenerationRequest;
use diffusion_bridge::protocol::message::{
    decode_frame, decode_line, encode_line, Command, NewImagePayload, ProgressPayload, Response,
    DESTINATION_MARKER, SOURCE_MARKER,
};
use diffusion_bridge::AppError;

/// Split an outbound line into its marker, code, and parsed payload.
fn split_outbound(line: &str) -> (String, String, Value) {
    assert!(line.ends_with('\n'), "line must be newline-terminated: {line:?}");
    assert_eq!(line.matches('\n').count(), 1, "exactly one newline");
    let mut parts = line.trim_end().splitn(3, ' ');
    let marker = parts.next().expect("marker").to_owned();
    let code = parts.next().expect("code").to_owned();
    let payload = serde_json::from_str(parts.next().expect("payload")).expect("json payload");
    (marker, code, payload)
}

// ── Encoding ──────────────────────────────────────────────────────────────────

#[test]
fn text_to_image_uses_worker_field_names() {
    let request = GenerationRequest::new("a cat");
    let line = Command::generate(&request).encode().expect("encode");

    let (marker, code, payload) = split_outbound(&line);
    assert_eq!(marker, SOURCE_MARKER);
    assert_eq!(code, "t2im");
    assert_eq!(
        payload,
        json!({
            "prompt": "a cat",
            "img_width": 512,
            "img_height": 512,
            "num_imgs": 1,
            "num_inference_steps": 20,
            "guidance_scale": 7.5,
        })
    );
}

#[test]
fn request_round_trips_through_payload() {
    let mut request = GenerationRequest::new("a lighthouse at dusk");
    request.width = 768;
    request.height = 384;
    request.image_count = 3;
    request.inference_steps = 42;
    request.guidance_scale = 12.25;
    request.input_image = Some(PathBuf::from("/in/photo.png"));
    request.mask_image = Some(PathBuf::from("/in/mask.png"));
    request.strength = Some(0.5);

    let line = Command::generate(&request).encode().expect("encode");
    let (_, _, payload) = split_outbound(&line);

    assert_eq!(payload["prompt"], "a lighthouse at dusk");
    assert_eq!(payload["img_width"], 768);
    assert_eq!(payload["img_height"], 384);
    assert_eq!(payload["num_imgs"], 3);
    assert_eq!(payload["num_inference_steps"], 42);
    assert_eq!(payload["guidance_scale"].as_f64(), Some(12.25));
    assert_eq!(payload["input_image"], "/in/photo.png");
    assert_eq!(payload["mask_image"], "/in/mask.png");
    assert_eq!(payload["img_strength"].as_f64(), Some(0.5));
}

#[test]
fn optional_fields_are_omitted_when_absent() {
    let line = Command::generate(&GenerationRequest::new("x"))
        .encode()
        .expect("encode");
    let (_, _, payload) = split_outbound(&line);

    let object = payload.as_object().expect("object");
    assert!(!object.contains_key("input_image"));
    assert!(!object.contains_key("mask_image"));
    assert!(!object.contains_key("img_strength"));
}

#[test]
fn prompt_newlines_stay_on_one_line() {
    let line = Command::generate(&GenerationRequest::new("line one\nline two"))
        .encode()
        .expect("encode");
    let (_, _, payload) = split_outbound(&line);
    assert_eq!(payload["prompt"], "line one\nline two");
}

#[test]
fn stop_has_empty_object_payload() {
    assert_eq!(Command::Stop.encode().expect("encode"), "b2py stop {}\n");
    assert_eq!(Command::Stop.code(), "stop");
}

#[test]
fn encode_line_rejects_bad_code() {
    let result = encode_line("toolong", &json!({}));
    assert!(matches!(result, Err(AppError::Io(_))));
}

#[test]
fn encode_line_rejects_non_object_payload() {
    let result = encode_line("t2im", &json!([1, 2, 3]));
    assert!(matches!(result, Err(AppError::Io(_))));
}

// ── Decoding ──────────────────────────────────────────────────────────────────

#[test]
fn decodes_progress() {
    let response = decode_line(r#"sdbk dnpr {"current_step": 4, "total_steps": 20, "status": "Denoising"}"#)
        .expect("decode")
        .expect("protocol line");

    assert_eq!(
        response,
        Response::Progress(ProgressPayload {
            current_step: 4,
            total_steps: Some(20),
            status: Some("Denoising".into()),
        })
    );
}

#[test]
fn decodes_progress_without_optional_fields() {
    let response = decode_line(r#"sdbk dnpr {"current_step": 1}"#)
        .expect("decode")
        .expect("protocol line");

    match response {
        Response::Progress(progress) => {
            assert_eq!(progress.current_step, 1);
            assert!(progress.total_steps.is_none());
            assert!(progress.status.is_none());
        }
        other => panic!("expected Progress, got {other:?}"),
    }
}

#[test]
fn decodes_status_label() {
    let response = decode_line(r#"sdbk mltl {"status": "Loading model"}"#)
        .expect("decode")
        .expect("protocol line");
    assert_eq!(response, Response::Status("Loading model".into()));
}

#[test]
fn decodes_new_image() {
    let response = decode_line(r#"sdbk nwim {"generated_img_path": "/out/1.png"}"#)
        .expect("decode")
        .expect("protocol line");

    assert_eq!(
        response,
        Response::NewImage(NewImagePayload {
            generated_img_path: PathBuf::from("/out/1.png"),
            aux_output_image_path: None,
        })
    );
}

#[test]
fn decodes_worker_error() {
    let response = decode_line(r#"sdbk errr {"message": "CUDA out of memory"}"#)
        .expect("decode")
        .expect("protocol line");
    assert_eq!(response, Response::Error("CUDA out of memory".into()));
}

#[test]
fn unknown_code_is_preserved() {
    let response = decode_line(r#"sdbk cack {"ok": true}"#)
        .expect("decode")
        .expect("protocol line");

    match response {
        Response::Unrecognized { code, payload } => {
            assert_eq!(code, "cack");
            assert_eq!(payload, json!({"ok": true}));
        }
        other => panic!("expected Unrecognized, got {other:?}"),
    }
}

#[test]
fn non_protocol_lines_are_skipped() {
    for noise in [
        "",
        "Loading checkpoint shards: 100%",
        "b2py t2im {}",
        "sdbkdnpr {}",
        "  sdbk dnpr {}",
    ] {
        assert_eq!(decode_line(noise).expect("noise is not an error"), None, "{noise:?}");
    }
}

#[test]
fn frame_keeps_marker_and_code() {
    let frame = decode_frame("sdbk dnpr {\"current_step\": 1}\r\n")
        .expect("decode")
        .expect("frame");
    assert_eq!(frame.marker, DESTINATION_MARKER);
    assert_eq!(frame.code, "dnpr");
    assert_eq!(frame.payload, json!({"current_step": 1}));
}

#[test]
fn malformed_marked_lines_are_decode_errors() {
    for bad in [
        "sdbk",
        "sdbk dnpr",
        "sdbk dnpr   ",
        "sdbk dn {}",
        "sdbk dnpr {not json",
        "sdbk dnpr [1, 2]",
        "sdbk dnpr \"text\"",
    ] {
        let result = decode_line(bad);
        assert!(
            matches!(result, Err(AppError::Decode(_))),
            "expected decode error for {bad:?}, got {result:?}"
        );
    }
}

#[test]
fn known_code_with_wrong_fields_is_decode_error() {
    let result = decode_line(r#"sdbk nwim {"path": "/out/1.png"}"#);
    assert!(matches!(result, Err(AppError::Decode(ref msg)) if msg.contains("nwim")));

    let result = decode_line(r#"sdbk dnpr {"current_step": "three"}"#);
    assert!(matches!(result, Err(AppError::Decode(_))));
}
