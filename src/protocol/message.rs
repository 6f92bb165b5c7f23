//! Encoding and decoding of worker protocol lines.
//!
//! Every line has the shape `<marker> <code> <json-object>`: a 4-character
//! marker, a 4-character code, and a compact JSON payload. Outbound lines
//! carry [`SOURCE_MARKER`]; inbound lines carry [`DESTINATION_MARKER`].
//!
//! # Known inbound codes
//!
//! | Code   | Maps to                        |
//! |--------|--------------------------------|
//! | `dnpr` | [`Response::Progress`]         |
//! | `mltl` | [`Response::Status`]           |
//! | `nwim` | [`Response::NewImage`]         |
//! | `errr` | [`Response::Error`]            |
//! | other  | [`Response::Unrecognized`]     |

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::request::GenerationRequest;
use crate::{AppError, Result};

/// Marker prefixed to every line we send.
pub const SOURCE_MARKER: &str = "b2py";
/// Marker prefixed to every protocol line the worker sends.
pub const DESTINATION_MARKER: &str = "sdbk";

/// Command code for text-to-image generation.
pub const CODE_TEXT_TO_IMAGE: &str = "t2im";
/// Command code asking the worker to abandon the current generation.
pub const CODE_STOP: &str = "stop";

/// Response code for step progress.
pub const CODE_PROGRESS: &str = "dnpr";
/// Response code for a status label change.
pub const CODE_STATUS: &str = "mltl";
/// Response code for a finished image.
pub const CODE_NEW_IMAGE: &str = "nwim";
/// Response code for a worker-side error.
pub const CODE_ERROR: &str = "errr";

const TOKEN_LEN: usize = 4;

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Payload of a `t2im` command, using the field names the worker expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextToImagePayload {
    /// Text prompt.
    pub prompt: String,
    /// Image width in pixels.
    pub img_width: u32,
    /// Image height in pixels.
    pub img_height: u32,
    /// Number of images.
    pub num_imgs: u32,
    /// Denoising step count.
    pub num_inference_steps: u32,
    /// Guidance scale.
    pub guidance_scale: f32,
    /// Source image for image-to-image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_image: Option<String>,
    /// Inpainting mask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_image: Option<String>,
    /// Image-to-image strength.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_strength: Option<f32>,
}

impl From<&GenerationRequest> for TextToImagePayload {
    fn from(request: &GenerationRequest) -> Self {
        Self {
            prompt: request.prompt.clone(),
            img_width: request.width,
            img_height: request.height,
            num_imgs: request.image_count,
            num_inference_steps: request.inference_steps,
            guidance_scale: request.guidance_scale,
            input_image: request
                .input_image
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            mask_image: request
                .mask_image
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            img_strength: request.strength,
        }
    }
}

/// Commands sent to the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Start a text-to-image (or image-to-image) generation.
    TextToImage(TextToImagePayload),
    /// Abandon the generation in flight.
    Stop,
}

impl Command {
    /// Build the start command for `request`.
    #[must_use]
    pub fn generate(request: &GenerationRequest) -> Self {
        Self::TextToImage(TextToImagePayload::from(request))
    }

    /// Four-letter command code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::TextToImage(_) => CODE_TEXT_TO_IMAGE,
            Self::Stop => CODE_STOP,
        }
    }

    /// Encode as a complete, newline-terminated protocol line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String> {
        match self {
            Self::TextToImage(payload) => encode_line(self.code(), payload),
            Self::Stop => encode_line(self.code(), &Map::new()),
        }
    }
}

/// Encode `payload` under command `code` as `b2py <code> <json>\n`.
///
/// # Errors
///
/// Returns `AppError::Io` if `code` is not a 4-character ASCII token or the
/// payload does not serialize to a JSON object.
pub fn encode_line<T: Serialize + ?Sized>(code: &str, payload: &T) -> Result<String> {
    if !is_token(code) {
        return Err(AppError::Io(format!("invalid command code: {code:?}")));
    }

    let value = serde_json::to_value(payload)
        .map_err(|err| AppError::Io(format!("failed to serialize {code} payload: {err}")))?;
    if !value.is_object() {
        return Err(AppError::Io(format!("{code} payload must be a JSON object")));
    }

    // serde_json's compact form never contains a raw newline.
    Ok(format!("{SOURCE_MARKER} {code} {value}\n"))
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// A structurally valid protocol line.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Destination marker.
    pub marker: String,
    /// Response code.
    pub code: String,
    /// Parsed JSON object.
    pub payload: Value,
}

/// Split a line into its marker, code, and JSON payload.
///
/// Returns `Ok(None)` for lines that do not begin with
/// [`DESTINATION_MARKER`]: workers routinely print library warnings and
/// other noise to stdout, and those lines are not ours to judge.
///
/// # Errors
///
/// Returns `AppError::Decode` when a marked line lacks the
/// three-token shape or its payload is not a JSON object.
pub fn decode_frame(line: &str) -> Result<Option<Frame>> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.splitn(3, ' ');

    let marker = parts.next().unwrap_or_default();
    if marker != DESTINATION_MARKER {
        return Ok(None);
    }

    let code = parts
        .next()
        .filter(|code| is_token(code))
        .ok_or_else(|| AppError::Decode(format!("missing or malformed response code in {line:?}")))?;

    let raw_payload = parts
        .next()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| AppError::Decode(format!("missing payload for {code} response")))?;

    let payload: Map<String, Value> = serde_json::from_str(raw_payload)
        .map_err(|err| AppError::Decode(format!("malformed json in {code} response: {err}")))?;

    Ok(Some(Frame {
        marker: marker.to_owned(),
        code: code.to_owned(),
        payload: Value::Object(payload),
    }))
}

/// Step progress reported by the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressPayload {
    /// Step just completed.
    pub current_step: u32,
    /// Total steps, as the worker sees them.
    #[serde(default)]
    pub total_steps: Option<u32>,
    /// Phase description.
    #[serde(default)]
    pub status: Option<String>,
}

/// A finished image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewImagePayload {
    /// Path of the generated image.
    pub generated_img_path: PathBuf,
    /// Secondary output (e.g., an unblended inpainting result).
    #[serde(default)]
    pub aux_output_image_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    message: String,
}

/// Decoded worker response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Step progress.
    Progress(ProgressPayload),
    /// Phase label change without a step update.
    Status(String),
    /// One generated image.
    NewImage(NewImagePayload),
    /// Worker-side failure message.
    Error(String),
    /// A code we do not interpret; kept so callers can log it.
    Unrecognized {
        /// Response code.
        code: String,
        /// Raw payload.
        payload: Value,
    },
}

impl Response {
    /// Interpret a frame according to its response code.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Decode` if a known code carries a payload that is
    /// missing required fields.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let Frame { code, payload, .. } = frame;
        match code.as_str() {
            CODE_PROGRESS => Ok(Self::Progress(parse_payload(&code, payload)?)),
            CODE_STATUS => {
                let parsed: StatusPayload = parse_payload(&code, payload)?;
                Ok(Self::Status(parsed.status))
            }
            CODE_NEW_IMAGE => Ok(Self::NewImage(parse_payload(&code, payload)?)),
            CODE_ERROR => {
                let parsed: ErrorPayload = parse_payload(&code, payload)?;
                Ok(Self::Error(parsed.message))
            }
            _ => Ok(Self::Unrecognized { code, payload }),
        }
    }
}

/// Decode one line into a [`Response`], or `Ok(None)` for non-protocol noise.
///
/// # Errors
///
/// Returns `AppError::Decode` for marked lines that fail to parse.
pub fn decode_line(line: &str) -> Result<Option<Response>> {
    decode_frame(line)?.map(Response::from_frame).transpose()
}

fn parse_payload<T: DeserializeOwned>(code: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|err| AppError::Decode(format!("invalid {code} payload: {err}")))
}

fn is_token(candidate: &str) -> bool {
    candidate.len() == TOKEN_LEN && candidate.bytes().all(|b| b.is_ascii_alphanumeric())
}
