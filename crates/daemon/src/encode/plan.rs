//! Bitrate planning from a size budget.
//!
//! `video_bps = (target_mb * margin * 8 * 2^20) / duration - audio_bps`,
//! clamped to the configured floor and ceiling. A non-positive result means
//! the budget cannot hold the audio track alone and the plan is rejected.

use relay_daemon_config::{QualityProfile, TranscodeConfig};
use serde::Serialize;
use thiserror::Error;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    #[error("Target size must be positive, got {0} MB")]
    InvalidBudget(f64),

    #[error("Input duration must be positive, got {0} s")]
    InvalidDuration(f64),

    #[error("Budget of {target_mb} MB over {duration_secs:.1} s leaves no room for video after {audio_bps} bps audio")]
    NoVideoBudget {
        target_mb: f64,
        duration_secs: f64,
        audio_bps: u64,
    },
}

/// Encoder parameters derived for one (input, profile) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BitratePlan {
    pub video_bps: u64,
    pub maxrate_bps: u64,
    pub bufsize_bits: u64,
    pub audio_bps: u64,
    pub height: u32,
    pub preset: String,
    pub crf: u8,
    pub tune: Option<String>,
    /// The size budget in bytes.
    pub budget_bytes: u64,
    /// True when the bitrate hit the floor or ceiling.
    pub clamped: bool,
}

/// Plan-relevant subset of the transcode configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanLimits {
    pub margin: f64,
    pub min_video_bps: u64,
    pub max_video_bps: u64,
    pub maxrate_factor: f64,
    pub bufsize_factor: f64,
    pub fast_preset: String,
    pub efficient_codecs: Vec<String>,
}

impl PlanLimits {
    pub fn from_config(config: &TranscodeConfig) -> Self {
        Self {
            margin: config.size_margin,
            min_video_bps: config.min_video_bitrate_kbps * 1000,
            max_video_bps: config.max_video_bitrate_kbps * 1000,
            maxrate_factor: config.maxrate_factor,
            bufsize_factor: config.bufsize_factor,
            fast_preset: config.fast_preset.clone(),
            efficient_codecs: config.efficient_codecs.clone(),
        }
    }

    /// Inputs already in a modern codec get the faster preset.
    fn preset_for(&self, profile: &QualityProfile, input_codec: Option<&str>) -> String {
        let efficient = input_codec
            .map(|codec| {
                let codec = codec.to_lowercase();
                self.efficient_codecs.iter().any(|c| codec.contains(&c.to_lowercase()))
            })
            .unwrap_or(false);
        if efficient {
            self.fast_preset.clone()
        } else {
            profile.preset.clone()
        }
    }
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self::from_config(&TranscodeConfig::default())
    }
}

/// Budget in bytes for a size in MB.
pub fn budget_bytes(target_mb: f64) -> u64 {
    (target_mb * BYTES_PER_MB) as u64
}

/// Compute encoder parameters for `profile` given the input duration.
pub fn plan_bitrate(
    target_mb: f64,
    duration_secs: f64,
    profile: &QualityProfile,
    input_codec: Option<&str>,
    limits: &PlanLimits,
) -> Result<BitratePlan, PlanError> {
    if !target_mb.is_finite() || target_mb <= 0.0 {
        return Err(PlanError::InvalidBudget(target_mb));
    }
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return Err(PlanError::InvalidDuration(duration_secs));
    }

    let audio_bps = profile.audio_bitrate_bps();
    let total_bps = target_mb * limits.margin * 8.0 * BYTES_PER_MB / duration_secs;
    let raw = total_bps - audio_bps as f64;
    if raw <= 0.0 {
        return Err(PlanError::NoVideoBudget {
            target_mb,
            duration_secs,
            audio_bps,
        });
    }

    let raw = raw as u64;
    let video_bps = raw.clamp(limits.min_video_bps, limits.max_video_bps.max(limits.min_video_bps));
    Ok(BitratePlan {
        video_bps,
        maxrate_bps: (video_bps as f64 * limits.maxrate_factor) as u64,
        bufsize_bits: (video_bps as f64 * limits.bufsize_factor) as u64,
        audio_bps,
        height: profile.height,
        preset: limits.preset_for(profile, input_codec),
        crf: profile.crf,
        tune: profile.tune.clone(),
        budget_bytes: budget_bytes(target_mb),
        clamped: video_bps != raw,
    })
}
