use crate::error::AppError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Lines of stderr kept for the error message.
const STDERR_TAIL: usize = 20;

/// Thin wrapper over the ffmpeg binary: audio extraction and clip cutting.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    path: PathBuf,
    sample_rate: u32,
}

impl Ffmpeg {
    pub fn new(path: &Path, sample_rate: u32) -> Self {
        Self {
            path: path.to_path_buf(),
            sample_rate,
        }
    }

    pub fn extract_audio_args(&self, video: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-y", "-hide_banner", "-loglevel", "error", "-i"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(video.as_os_str().to_owned());
        for a in ["-vn", "-ac", "1", "-ar"] {
            args.push(a.into());
        }
        args.push(self.sample_rate.to_string().into());
        for a in ["-c:a", "pcm_s16le"] {
            args.push(a.into());
        }
        args.push(output.as_os_str().to_owned());
        args
    }

    pub fn cut_clip_args(&self, video: &Path, start: f64, end: f64, output: &Path) -> Vec<OsString> {
        let duration = (end - start).max(0.0);
        let mut args: Vec<OsString> = ["-y", "-hide_banner", "-loglevel", "error", "-ss"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(format!("{:.3}", start).into());
        args.push("-i".into());
        args.push(video.as_os_str().to_owned());
        args.push("-t".into());
        args.push(format!("{:.3}", duration).into());
        for a in ["-c:v", "libx264", "-c:a", "aac", "-movflags", "+faststart"] {
            args.push(a.into());
        }
        args.push(output.as_os_str().to_owned());
        args
    }

    /// Mono PCM WAV at the configured sample rate.
    pub async fn extract_audio(
        &self,
        video: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        if !video.exists() {
            return Err(AppError::Io(format!("video not found: {}", video.display())));
        }
        log::info!("Extracting audio: {} -> {}", video.display(), output.display());
        self.run(self.extract_audio_args(video, output), cancel).await
    }

    pub async fn cut_clip(
        &self,
        video: &Path,
        start: f64,
        end: f64,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        if !video.exists() {
            return Err(AppError::Io(format!("video not found: {}", video.display())));
        }
        log::info!(
            "Cutting clip {:.2}s-{:.2}s of {} -> {}",
            start,
            end,
            video.display(),
            output.display()
        );
        self.run(self.cut_clip_args(video, start, end, output), cancel).await
    }

    pub async fn version(&self) -> Option<String> {
        let output = Command::new(&self.path).arg("-version").output().await.ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|l| l.to_string())
    }

    async fn run(&self, args: Vec<OsString>, cancel: &CancellationToken) -> Result<(), AppError> {
        let mut child = Command::new(&self.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Media(format!("Failed to spawn {}: {}", self.path.display(), e)))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Media("ffmpeg stderr unavailable".into()))?;
        let mut reader = BufReader::new(stderr).lines();
        let mut tail: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Killing ffmpeg subprocess");
                    let _ = child.kill().await;
                    return Err(AppError::Cancelled);
                }
                line = reader.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if tail.len() == STDERR_TAIL {
                                tail.remove(0);
                            }
                            tail.push(line);
                        }
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(AppError::Cancelled);
            }
            status = child.wait() => status
                .map_err(|e| AppError::Media(format!("Failed to wait for ffmpeg: {}", e)))?,
        };

        if !status.success() {
            return Err(AppError::Media(format!(
                "ffmpeg failed with status {}: {}",
                status,
                tail.join(" | ")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_audio_args() {
        let ff = Ffmpeg::new(Path::new("ffmpeg"), 16000);
        let args: Vec<String> = ff
            .extract_audio_args(Path::new("/v/ep01.mp4"), Path::new("/w/a.wav"))
            .into_iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        let joined = args.join(" ");
        assert!(joined.contains("-i /v/ep01.mp4"));
        assert!(joined.contains("-ac 1 -ar 16000"));
        assert_eq!(args.last().map(String::as_str), Some("/w/a.wav"));
    }

    #[test]
    fn test_cut_clip_args() {
        let ff = Ffmpeg::new(Path::new("ffmpeg"), 16000);
        let args: Vec<String> = ff
            .cut_clip_args(Path::new("/v/ep01.mp4"), 11.8, 14.1, Path::new("/c/x.mp4"))
            .into_iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        let joined = args.join(" ");
        assert!(joined.contains("-ss 11.800 -i /v/ep01.mp4 -t 2.300"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_media_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let video = temp.path().join("ep01.mp4");
        std::fs::write(&video, b"x").unwrap();
        let ff = Ffmpeg::new(Path::new("/nonexistent/ffmpeg"), 16000);
        let err = ff
            .extract_audio(&video, &temp.path().join("a.wav"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Media(_)));
    }
}
