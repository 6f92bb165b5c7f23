//! Unit tests for generation request defaults and range validation.

use std::path::PathBuf;

use diffusion_bridge::models::request::GenerationRequest;
use diffusion_bridge::settings::Settings;
use diffusion_bridge::AppError;

fn validation_message(request: &GenerationRequest) -> String {
    match request.validate() {
        Err(AppError::Validation(msg)) => msg,
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn defaults_are_valid() {
    let request = GenerationRequest::new("a cat");
    assert_eq!(request.width, 512);
    assert_eq!(request.height, 512);
    assert_eq!(request.image_count, 1);
    assert_eq!(request.inference_steps, 20);
    assert!((request.guidance_scale - 7.5).abs() < f32::EPSILON);
    request.validate().expect("defaults validate");
}

#[test]
fn from_settings_copies_defaults() {
    let settings = Settings {
        default_width: 768,
        default_height: 640,
        default_inference_steps: 35,
        default_guidance_scale: 9.0,
        ..Settings::default()
    };

    let request = GenerationRequest::from_settings("a dog", &settings);

    assert_eq!(request.prompt, "a dog");
    assert_eq!(request.width, 768);
    assert_eq!(request.height, 640);
    assert_eq!(request.inference_steps, 35);
    assert!((request.guidance_scale - 9.0).abs() < f32::EPSILON);
    assert_eq!(request.image_count, 1);
}

#[test]
fn boundaries_are_inclusive() {
    let mut request = GenerationRequest::new("edge");
    request.width = 256;
    request.height = 1024;
    request.inference_steps = 10;
    request.guidance_scale = 20.0;
    request.image_count = 10;
    request.validate().expect("lower/upper bounds are accepted");

    request.inference_steps = 50;
    request.guidance_scale = 1.0;
    request.validate().expect("other bounds are accepted");
}

#[test]
fn blank_prompt_is_rejected() {
    let request = GenerationRequest::new("   ");
    assert!(validation_message(&request).contains("prompt"));
}

#[test]
fn out_of_range_width_is_rejected() {
    let mut request = GenerationRequest::new("a cat");
    request.width = 255;
    assert!(validation_message(&request).contains("width"));

    request.width = 1025;
    assert!(validation_message(&request).contains("width"));
}

#[test]
fn out_of_range_height_is_rejected() {
    let mut request = GenerationRequest::new("a cat");
    request.height = 2048;
    assert!(validation_message(&request).contains("height"));
}

#[test]
fn zero_image_count_is_rejected() {
    let mut request = GenerationRequest::new("a cat");
    request.image_count = 0;
    assert!(validation_message(&request).contains("image count"));
}

#[test]
fn out_of_range_steps_are_rejected() {
    let mut request = GenerationRequest::new("a cat");
    request.inference_steps = 9;
    assert!(validation_message(&request).contains("inference steps"));

    request.inference_steps = 51;
    assert!(validation_message(&request).contains("inference steps"));
}

#[test]
fn out_of_range_guidance_is_rejected() {
    let mut request = GenerationRequest::new("a cat");
    request.guidance_scale = 0.5;
    assert!(validation_message(&request).contains("guidance"));

    request.guidance_scale = f32::NAN;
    assert!(validation_message(&request).contains("guidance"));
}

#[test]
fn strength_must_be_a_fraction() {
    let mut request = GenerationRequest::new("a cat");
    request.input_image = Some(PathBuf::from("/in.png"));
    request.strength = Some(1.5);
    assert!(validation_message(&request).contains("strength"));

    request.strength = Some(0.75);
    request.validate().expect("fractional strength is accepted");
}

#[test]
fn mask_requires_input_image() {
    let mut request = GenerationRequest::new("a cat");
    request.mask_image = Some(PathBuf::from("/mask.png"));
    assert!(validation_message(&request).contains("mask"));

    request.input_image = Some(PathBuf::from("/in.png"));
    request.validate().expect("mask with input image is accepted");
}
