//! Quality profile table
//!
//! Profiles form a fixed, enumerated set. Their numeric parameters come from
//! configuration and are validated once at startup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of a supported output quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProfileName {
    #[serde(rename = "480p")]
    Sd480,
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "1080p")]
    Fhd1080,
}

impl ProfileName {
    /// All profiles in ascending resolution order.
    pub const ALL: [ProfileName; 3] = [ProfileName::Sd480, ProfileName::Hd720, ProfileName::Fhd1080];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileName::Sd480 => "480p",
            ProfileName::Hd720 => "720p",
            ProfileName::Fhd1080 => "1080p",
        }
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "480p" | "480" => Ok(ProfileName::Sd480),
            "720p" | "720" => Ok(ProfileName::Hd720),
            "1080p" | "1080" => Ok(ProfileName::Fhd1080),
            other => Err(format!("unknown quality profile '{}'", other)),
        }
    }
}

/// Static output configuration for one quality.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityProfile {
    pub name: ProfileName,
    /// Output frame height in pixels; width follows the aspect ratio.
    pub height: u32,
    /// Target output size in MB (2^20 bytes).
    pub target_size_mb: f64,
    /// Audio bitrate in kbps.
    pub audio_bitrate_kbps: u32,
    /// Constant rate factor passed alongside the bitrate cap.
    #[serde(default = "default_crf")]
    pub crf: u8,
    /// Encoder preset (e.g. "medium").
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Encoder tune (e.g. "film"); omitted from the command when unset.
    #[serde(default = "default_tune")]
    pub tune: Option<String>,
}

fn default_crf() -> u8 {
    23
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_tune() -> Option<String> {
    Some("film".to_string())
}

impl QualityProfile {
    /// Built-in parameters for a profile.
    pub fn builtin(name: ProfileName) -> Self {
        let (height, target_size_mb, audio_bitrate_kbps, crf) = match name {
            ProfileName::Sd480 => (480, 90.0, 64, 23),
            ProfileName::Hd720 => (720, 185.0, 96, 24),
            ProfileName::Fhd1080 => (1080, 280.0, 128, 25),
        };
        Self {
            name,
            height,
            target_size_mb,
            audio_bitrate_kbps,
            crf,
            preset: default_preset(),
            tune: default_tune(),
        }
    }

    /// Audio bitrate in bits per second.
    pub fn audio_bitrate_bps(&self) -> u64 {
        u64::from(self.audio_bitrate_kbps) * 1000
    }

    /// Check the profile's own fields. Returns a human-readable reason on failure.
    pub fn check(&self) -> Result<(), String> {
        if !self.target_size_mb.is_finite() || self.target_size_mb <= 0.0 {
            return Err(format!(
                "profile {}: target_size_mb must be positive, got {}",
                self.name, self.target_size_mb
            ));
        }
        if self.height == 0 {
            return Err(format!("profile {}: height must be non-zero", self.name));
        }
        if self.audio_bitrate_kbps == 0 {
            return Err(format!("profile {}: audio_bitrate_kbps must be non-zero", self.name));
        }
        if self.preset.trim().is_empty() {
            return Err(format!("profile {}: preset must not be empty", self.name));
        }
        Ok(())
    }
}

/// The built-in table, one entry per profile.
pub fn default_profiles() -> Vec<QualityProfile> {
    ProfileName::ALL.iter().map(|n| QualityProfile::builtin(*n)).collect()
}
