use anyhow::{bail, Context};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

use crate::error::Result;

/// Probed properties of an image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageProbe {
    pub width: u32,
    pub height: u32,
    /// Frame count; anything above 1 is treated as animated.
    pub frames: u32,
}

/// Options for a re-encode pass.
#[derive(Debug, Clone, Default)]
pub struct TranscodeOptions {
    /// Encoder quality (1-100).
    pub quality: Option<u32>,
    /// Square bounding box; aspect ratio is preserved by the encoder.
    pub resize: Option<u32>,
    /// Drop embedded metadata profiles (Exif and friends).
    pub strip_metadata: bool,
}

impl TranscodeOptions {
    pub fn quality(quality: u32) -> Self {
        Self {
            quality: Some(quality),
            ..Default::default()
        }
    }
}

/// Capability interface over external media tooling.
///
/// The engine only ever talks to this trait, so tests can swap in a fake
/// backend and never touch real binaries. The output format of `transcode`
/// is chosen by the destination path's extension.
#[async_trait]
pub trait CodecBackend: Send + Sync {
    /// Detect the MIME type of a file.
    async fn probe_mime(&self, path: &Path) -> Result<String>;

    /// Dimensions and frame count of an image file.
    async fn probe_image(&self, path: &Path) -> Result<ImageProbe>;

    /// Dimensions of an image file.
    async fn probe_dimensions(&self, path: &Path) -> Result<(u32, u32)>;

    /// Re-encode `src` into `dst`, optionally resizing and stripping
    /// metadata.
    async fn transcode(&self, src: &Path, dst: &Path, opts: &TranscodeOptions) -> Result<()>;

    /// Decode the first frame of a video into a JPEG at `dst`.
    async fn extract_first_frame(&self, src: &Path, dst: &Path) -> Result<()>;
}

/// Codec backend that shells out to `file`, `magick`, and `ffmpeg`.
#[derive(Debug, Default, Clone)]
pub struct ShellCodec;

impl ShellCodec {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CodecBackend for ShellCodec {
    async fn probe_mime(&self, path: &Path) -> Result<String> {
        let mut cmd = Command::new("file");
        cmd.arg("--mime-type").arg("-b").arg(path);
        let out = run(cmd).await?;
        Ok(out.trim().to_string())
    }

    async fn probe_image(&self, path: &Path) -> Result<ImageProbe> {
        let mut cmd = Command::new("magick");
        cmd.arg("identify")
            .arg("-format")
            .arg("%w,%h,%n\\n")
            .arg(path);
        let out = run(cmd).await?;
        Ok(parse_image_probe(&out)?)
    }

    async fn probe_dimensions(&self, path: &Path) -> Result<(u32, u32)> {
        let mut cmd = Command::new("magick");
        cmd.arg("identify")
            .arg("-format")
            .arg("%w,%h\\n")
            .arg(path);
        let out = run(cmd).await?;
        Ok(parse_dimensions(&out)?)
    }

    async fn transcode(&self, src: &Path, dst: &Path, opts: &TranscodeOptions) -> Result<()> {
        let mut cmd = Command::new("magick");
        cmd.arg(src);
        if let Some(quality) = opts.quality {
            cmd.arg("-quality").arg(quality.to_string());
        }
        if let Some(bound) = opts.resize {
            cmd.arg("-resize").arg(format!("{bound}x{bound}"));
        }
        if opts.strip_metadata {
            cmd.arg("+profile").arg("*");
        }
        cmd.arg(dst);
        run(cmd).await?;
        debug!(src = %src.display(), dst = %dst.display(), "transcoded");
        Ok(())
    }

    async fn extract_first_frame(&self, src: &Path, dst: &Path) -> Result<()> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-i")
            .arg(src)
            .arg("-vf")
            .arg(r"select=eq(n\,0)")
            .arg("-vsync")
            .arg("vfr")
            .arg("-q:v")
            .arg("2")
            .arg(dst);
        run(cmd).await?;
        Ok(())
    }
}

/// Run a subprocess to completion, returning stdout as UTF-8.
async fn run(mut cmd: Command) -> anyhow::Result<String> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to spawn {program}"))?;
    if !output.status.success() {
        bail!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `identify -format %w,%h,%n` output. Animated images repeat the
/// format per frame; the first line carries everything we need since the
/// frame count is the same on each.
fn parse_image_probe(out: &str) -> anyhow::Result<ImageProbe> {
    let line = out.lines().next().unwrap_or("").trim();
    let mut parts = line.split(',');
    let width = next_field(&mut parts, line, "width")?;
    let height = next_field(&mut parts, line, "height")?;
    let frames = next_field(&mut parts, line, "frames")?;
    Ok(ImageProbe {
        width,
        height,
        frames,
    })
}

/// Parse `identify -format %w,%h` output.
fn parse_dimensions(out: &str) -> anyhow::Result<(u32, u32)> {
    let line = out.lines().next().unwrap_or("").trim();
    let mut parts = line.split(',');
    let width = next_field(&mut parts, line, "width")?;
    let height = next_field(&mut parts, line, "height")?;
    Ok((width, height))
}

fn next_field<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    line: &str,
    name: &str,
) -> anyhow::Result<u32> {
    parts
        .next()
        .and_then(|f| f.trim().parse().ok())
        .with_context(|| format!("missing {name} in identify output: {line:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_probe() {
        let probe = parse_image_probe("1000,500,1\n").unwrap();
        assert_eq!(
            probe,
            ImageProbe {
                width: 1000,
                height: 500,
                frames: 1
            }
        );
    }

    #[test]
    fn test_parse_image_probe_animated() {
        // Animated gifs repeat the line once per frame.
        let probe = parse_image_probe("64,64,10\n64,64,10\n").unwrap();
        assert_eq!(probe.frames, 10);
    }

    #[test]
    fn test_parse_image_probe_garbage() {
        assert!(parse_image_probe("").is_err());
        assert!(parse_image_probe("12,x,1").is_err());
    }

    #[test]
    fn test_parse_dimensions() {
        assert_eq!(parse_dimensions("480,240\n").unwrap(), (480, 240));
    }
}
