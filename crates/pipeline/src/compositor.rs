//! Final-artifact assembly.
//!
//! A [`Compositor`] turns the ordered segment clips of a job into one
//! video. [`FfmpegCompositor`] uses the concat demuxer with stream copy, so
//! clips must share codec parameters; [`ConcatCompositor`] joins raw bytes
//! and is meant for developer mode and tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use foundry_core::config::CompositorKind;

use crate::error::CompositionError;

#[async_trait]
pub trait Compositor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Join `clips` in order.
    async fn compose(&self, clips: Vec<Vec<u8>>) -> Result<Vec<u8>, CompositionError>;
}

pub fn build_compositor(kind: CompositorKind) -> Arc<dyn Compositor> {
    match kind {
        CompositorKind::Concat => Arc::new(ConcatCompositor),
        CompositorKind::Ffmpeg => Arc::new(FfmpegCompositor::new()),
    }
}

/// Byte-level concatenation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcatCompositor;

#[async_trait]
impl Compositor for ConcatCompositor {
    fn name(&self) -> &'static str {
        "concat"
    }

    async fn compose(&self, clips: Vec<Vec<u8>>) -> Result<Vec<u8>, CompositionError> {
        if clips.is_empty() {
            return Err(CompositionError::EmptyInput);
        }
        Ok(clips.concat())
    }
}

/// `ffmpeg -f concat -safe 0 -i list.txt -c copy` over a scratch directory.
#[derive(Debug, Clone)]
pub struct FfmpegCompositor {
    binary: PathBuf,
}

impl Default for FfmpegCompositor {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegCompositor {
    /// Use `ffmpeg` from `PATH`.
    pub fn new() -> Self {
        Self::with_binary("ffmpeg")
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, dir: &Path, list: &Path, output: &Path) -> Result<(), CompositionError> {
        let result = tokio::process::Command::new(&self.binary)
            .current_dir(dir)
            .args(["-y", "-v", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(list)
            .args(["-c", "copy"])
            .arg(output)
            .output()
            .await
            .map_err(CompositionError::FfmpegNotFound)?;

        if !result.status.success() {
            return Err(CompositionError::FfmpegFailed {
                exit_code: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).to_string(),
            });
        }
        Ok(())
    }
}

/// Clip file name for position `index`.
fn clip_name(index: usize) -> String {
    format!("clip_{index:04}.mp4")
}

/// Concat demuxer input listing `count` clips in order.
pub fn concat_list(count: usize) -> String {
    (0..count)
        .map(|i| format!("file '{}'\n", clip_name(i)))
        .collect()
}

#[async_trait]
impl Compositor for FfmpegCompositor {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn compose(&self, clips: Vec<Vec<u8>>) -> Result<Vec<u8>, CompositionError> {
        if clips.is_empty() {
            return Err(CompositionError::EmptyInput);
        }

        let scratch = tempfile::tempdir()?;
        let dir = scratch.path();
        let count = clips.len();
        for (index, clip) in clips.into_iter().enumerate() {
            tokio::fs::write(dir.join(clip_name(index)), clip).await?;
        }
        let list = dir.join("list.txt");
        tokio::fs::write(&list, concat_list(count)).await?;
        let output = dir.join("output.mp4");

        tracing::debug!(clips = count, dir = %dir.display(), "Running ffmpeg concat");
        self.run(dir, &list, &output).await?;

        Ok(tokio::fs::read(&output).await?)
    }
}
