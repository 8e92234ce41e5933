//! Transcoding: probing, bitrate planning, ffmpeg invocation and supervision.

pub mod ffmpeg;
pub mod plan;
pub mod probe;
pub mod transcoder;

pub use ffmpeg::{build_ffmpeg_args, test_encode_args, FfmpegParams, FfmpegProgress, VideoEncoder};
pub use plan::{plan_bitrate, BitratePlan, PlanError, PlanLimits};
pub use probe::{probe_file, ProbeError, ProbeResult};
pub use transcoder::{
    TranscodeCoordinator, TranscodeError, TranscodeRequest, TranscodeSettings, TranscodedFile,
};
