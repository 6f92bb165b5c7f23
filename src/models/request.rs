//! Generation request model and range validation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::settings::Settings;
use crate::{AppError, Result};

/// Smallest accepted image edge in pixels.
pub const MIN_DIMENSION: u32 = 256;
/// Largest accepted image edge in pixels.
pub const MAX_DIMENSION: u32 = 1024;
/// Largest number of images produced by one request.
pub const MAX_IMAGE_COUNT: u32 = 10;
/// Inclusive bounds for the inference step count.
pub const STEP_RANGE: (u32, u32) = (10, 50);
/// Inclusive bounds for the guidance scale.
pub const GUIDANCE_RANGE: (f32, f32) = (1.0, 20.0);

/// Parameters for one image generation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GenerationRequest {
    /// Text prompt; must not be blank.
    pub prompt: String,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Number of images to generate.
    pub image_count: u32,
    /// Number of denoising steps.
    pub inference_steps: u32,
    /// Classifier-free guidance scale.
    pub guidance_scale: f32,
    /// Source image for image-to-image runs.
    #[serde(default)]
    pub input_image: Option<PathBuf>,
    /// Inpainting mask; requires `input_image`.
    #[serde(default)]
    pub mask_image: Option<PathBuf>,
    /// How far to move away from `input_image` (0.0 to 1.0).
    #[serde(default)]
    pub strength: Option<f32>,
}

impl GenerationRequest {
    /// Build a request with the stock defaults (512x512, 1 image, 20 steps, 7.5).
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            width: 512,
            height: 512,
            image_count: 1,
            inference_steps: 20,
            guidance_scale: 7.5,
            input_image: None,
            mask_image: None,
            strength: None,
        }
    }

    /// Build a request whose tunables are seeded from the user's settings.
    #[must_use]
    pub fn from_settings(prompt: impl Into<String>, settings: &Settings) -> Self {
        Self {
            width: settings.default_width,
            height: settings.default_height,
            inference_steps: settings.default_inference_steps,
            guidance_scale: settings.default_guidance_scale,
            ..Self::new(prompt)
        }
    }

    /// Check every bounded field before the request is handed to the worker.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(AppError::Validation("prompt must not be empty".into()));
        }

        check_dimension("width", self.width)?;
        check_dimension("height", self.height)?;

        if self.image_count == 0 || self.image_count > MAX_IMAGE_COUNT {
            return Err(AppError::Validation(format!(
                "image count must be between 1 and {MAX_IMAGE_COUNT}, got {}",
                self.image_count
            )));
        }

        check_steps("inference steps", self.inference_steps)?;
        check_guidance("guidance scale", self.guidance_scale)?;

        if let Some(strength) = self.strength {
            if !(0.0..=1.0).contains(&strength) {
                return Err(AppError::Validation(format!(
                    "strength must be between 0.0 and 1.0, got {strength}"
                )));
            }
        }

        if self.mask_image.is_some() && self.input_image.is_none() {
            return Err(AppError::Validation(
                "mask image requires an input image".into(),
            ));
        }

        Ok(())
    }
}

/// Validate an image edge length against [`MIN_DIMENSION`]..=[`MAX_DIMENSION`].
pub(crate) fn check_dimension(field: &str, value: u32) -> Result<()> {
    if (MIN_DIMENSION..=MAX_DIMENSION).contains(&value) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "{field} must be between {MIN_DIMENSION} and {MAX_DIMENSION}, got {value}"
        )))
    }
}

pub(crate) fn check_steps(field: &str, value: u32) -> Result<()> {
    let (min, max) = STEP_RANGE;
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "{field} must be between {min} and {max}, got {value}"
        )))
    }
}

pub(crate) fn check_guidance(field: &str, value: f32) -> Result<()> {
    let (min, max) = GUIDANCE_RANGE;
    // NaN fails the range check as well.
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "{field} must be between {min:.1} and {max:.1}, got {value}"
        )))
    }
}
