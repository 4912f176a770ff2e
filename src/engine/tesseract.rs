//! Tesseract subprocess engine.
//!
//! Recognition shells out to the `tesseract` binary in TSV mode rather than
//! linking libtesseract: the subprocess boundary isolates engine crashes
//! from the pipeline, needs no C build plumbing, and matches how the worker
//! pool already treats recognition as an external process concern.
//!
//! TSV output is one row per detected element with a `level` column; level
//! 5 rows are words carrying text and a confidence. Words are grouped back
//! into line regions (`block_num`/`par_num`/`line_num`) because line-level
//! boxes position an invisible text layer far better than per-word
//! fragments.

use crate::config::QualityMode;
use crate::engine::{OcrEngine, TextRegion};
use crate::error::PageFailure;
use async_trait::async_trait;
use image::DynamicImage;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Configuration for [`TesseractEngine`].
#[derive(Debug, Clone)]
pub struct TesseractConfig {
    /// Engine-native language codes joined with `+` on the command line.
    pub languages: Vec<String>,
    pub quality: QualityMode,
    /// Binary override; defaults to `tesseract` on `PATH` or the
    /// `TESSERACT_PATH` environment variable.
    pub program: Option<PathBuf>,
    /// Per-invocation timeout.
    pub timeout_secs: u64,
}

impl Default for TesseractConfig {
    fn default() -> Self {
        Self {
            languages: vec!["eng".to_string()],
            quality: QualityMode::Balanced,
            program: None,
            timeout_secs: 120,
        }
    }
}

/// OCR engine backed by a `tesseract` subprocess per call.
pub struct TesseractEngine {
    config: TesseractConfig,
    program: PathBuf,
    lang_arg: String,
}

impl TesseractEngine {
    pub fn new(config: TesseractConfig) -> Self {
        let program = config
            .program
            .clone()
            .or_else(|| std::env::var_os("TESSERACT_PATH").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("tesseract"));
        let lang_arg = config.languages.join("+");
        Self {
            config,
            program,
            lang_arg,
        }
    }

    /// Engine flags for the configured quality mode.
    ///
    /// OEM 1 is the LSTM recognizer; `tessedit_do_invert=0` skips the
    /// inverted-text second pass, which roughly halves runtime on scans
    /// that never contain white-on-black text.
    fn quality_args(&self) -> Vec<&'static str> {
        match self.config.quality {
            QualityMode::Fast => vec!["--oem", "1", "--psm", "3", "-c", "tessedit_do_invert=0"],
            QualityMode::Balanced => vec!["--oem", "1", "--psm", "3"],
            QualityMode::High => vec!["--oem", "1", "--psm", "11"],
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    async fn recognize(
        &self,
        page_index: u32,
        image: &DynamicImage,
    ) -> Result<Vec<TextRegion>, PageFailure> {
        let recog_failed = |detail: String| PageFailure::RecognitionFailed {
            page: page_index,
            detail,
        };

        // Tesseract reads from a file; a managed tempfile keeps cleanup
        // automatic even on the error paths.
        let input = tempfile::Builder::new()
            .prefix("textlayer-ocr-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| recog_failed(format!("tempfile: {e}")))?;
        image
            .save_with_format(input.path(), image::ImageFormat::Png)
            .map_err(|e| recog_failed(format!("write page image: {e}")))?;

        let child = Command::new(&self.program)
            .arg(input.path())
            .arg("stdout")
            .arg("-l")
            .arg(&self.lang_arg)
            .args(self.quality_args())
            .arg("tsv")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| recog_failed(format!("failed to execute {}: {e}", self.program.display())))?;

        let output = match timeout(
            Duration::from_secs(self.config.timeout_secs),
            child.wait_with_output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(recog_failed(format!("wait for tesseract: {e}"))),
            Err(_) => {
                return Err(PageFailure::Timeout {
                    page: page_index,
                    secs: self.config.timeout_secs,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(recog_failed(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        let regions = parse_tsv(&tsv);
        debug!(page = page_index, regions = regions.len(), "recognition done");
        Ok(regions)
    }

    fn languages(&self) -> &[String] {
        &self.config.languages
    }
}

/// Parse tesseract TSV output into line-grouped regions.
fn parse_tsv(tsv: &str) -> Vec<TextRegion> {
    struct Line {
        key: (u32, u32, u32),
        words: Vec<String>,
        x0: f32,
        y0: f32,
        x1: f32,
        y1: f32,
        conf_sum: f32,
        conf_count: u32,
    }

    let mut lines: Vec<Line> = Vec::new();

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        // level page block par line word left top width height conf text
        if cols.len() < 12 {
            continue;
        }
        if cols[0] != "5" {
            continue;
        }
        let text = cols[11].trim();
        if text.is_empty() {
            continue;
        }
        let (Ok(block), Ok(par), Ok(line)) = (
            cols[2].parse::<u32>(),
            cols[3].parse::<u32>(),
            cols[4].parse::<u32>(),
        ) else {
            continue;
        };
        let (Ok(left), Ok(top), Ok(width), Ok(height)) = (
            cols[6].parse::<f32>(),
            cols[7].parse::<f32>(),
            cols[8].parse::<f32>(),
            cols[9].parse::<f32>(),
        ) else {
            continue;
        };
        let conf: f32 = cols[10].parse().unwrap_or(-1.0);
        if conf < 0.0 {
            continue;
        }

        let key = (block, par, line);
        match lines.last_mut() {
            Some(current) if current.key == key => {
                current.words.push(text.to_string());
                current.x0 = current.x0.min(left);
                current.y0 = current.y0.min(top);
                current.x1 = current.x1.max(left + width);
                current.y1 = current.y1.max(top + height);
                current.conf_sum += conf;
                current.conf_count += 1;
            }
            _ => lines.push(Line {
                key,
                words: vec![text.to_string()],
                x0: left,
                y0: top,
                x1: left + width,
                y1: top + height,
                conf_sum: conf,
                conf_count: 1,
            }),
        }
    }

    if lines.is_empty() {
        warn!("no words above confidence floor in recognition output");
    }

    lines
        .into_iter()
        .map(|line| {
            let confidence = (line.conf_sum / line.conf_count as f32 / 100.0).clamp(0.0, 1.0);
            TextRegion::from_rect(
                line.words.join(" "),
                line.x0,
                line.y0,
                line.x1 - line.x0,
                line.y1 - line.y0,
                confidence,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn parse_tsv_groups_words_into_lines() {
        let tsv = format!(
            "{HEADER}\n\
             1\t1\t0\t0\t0\t0\t0\t0\t1000\t1400\t-1\t\n\
             5\t1\t1\t1\t1\t1\t100\t200\t80\t30\t95.1\tHello\n\
             5\t1\t1\t1\t1\t2\t190\t202\t90\t28\t91.3\tworld\n\
             5\t1\t1\t1\t2\t1\t100\t260\t120\t30\t88.0\tSecond\n"
        );
        let regions = parse_tsv(&tsv);
        assert_eq!(regions.len(), 2);

        assert_eq!(regions[0].text, "Hello world");
        assert_eq!(regions[0].x0(), 100.0);
        assert_eq!(regions[0].y0(), 200.0);
        assert_eq!(regions[0].x1(), 280.0);
        assert_eq!(regions[0].y1(), 232.0);
        assert!((regions[0].confidence - 0.932).abs() < 0.001);

        assert_eq!(regions[1].text, "Second");
    }

    #[test]
    fn parse_tsv_drops_negative_confidence_rows() {
        let tsv = format!(
            "{HEADER}\n\
             5\t1\t1\t1\t1\t1\t10\t10\t50\t20\t-1\tghost\n\
             5\t1\t1\t1\t1\t2\t70\t10\t50\t20\t80\treal\n"
        );
        let regions = parse_tsv(&tsv);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].text, "real");
    }

    #[test]
    fn parse_tsv_handles_malformed_rows() {
        let tsv = format!("{HEADER}\nnot\ttab\tseparated\n5\t1\t1\n");
        assert!(parse_tsv(&tsv).is_empty());
    }

    #[test]
    fn quality_modes_change_flags() {
        let fast = TesseractEngine::new(TesseractConfig {
            quality: QualityMode::Fast,
            ..Default::default()
        });
        let high = TesseractEngine::new(TesseractConfig {
            quality: QualityMode::High,
            ..Default::default()
        });
        assert!(fast.quality_args().contains(&"tessedit_do_invert=0"));
        assert!(high.quality_args().contains(&"11"));
    }

    #[test]
    fn language_arg_joins_with_plus() {
        let engine = TesseractEngine::new(TesseractConfig {
            languages: vec!["eng".into(), "deu".into()],
            ..Default::default()
        });
        assert_eq!(engine.lang_arg, "eng+deu");
        assert_eq!(engine.languages(), &["eng".to_string(), "deu".to_string()]);
    }
}
