//! Output file naming

use std::path::{Path, PathBuf};

/// Run-level postfix, e.g. `-resample02-s10-mean0427`
pub fn output_postfix(resample_iter: usize, ddim_step: usize, mean: u32) -> String {
    format!("-resample{resample_iter:02}-s{ddim_step:02}-mean{mean:04}")
}

/// File-name stem derived from the video prompt.
///
/// Spaces become underscores and the final character is dropped (prompts
/// are typically typed with a closing period). Path separators are
/// replaced so the name always stays inside its directory.
pub fn prompt_stem(prompt: &str) -> String {
    let mut stem: String = prompt
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' => '_',
            c => c,
        })
        .collect();
    stem.pop();
    stem
}

/// Names of everything written for one sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNames {
    /// Run postfix plus the sample index
    pub sample_postfix: String,
    /// `<stem><sample_postfix>-<new frames>.gif`
    pub gif_file: String,
    /// `gif_file` without its extension; also the frame directory name
    pub video_name: String,
}

impl OutputNames {
    pub fn new(prompt: &str, postfix: &str, sample_idx: usize, num_new_frames: usize) -> Self {
        let sample_postfix = format!("{postfix}-{sample_idx:02}");
        let gif_file = format!(
            "{}{}-{:02}.gif",
            prompt_stem(prompt),
            sample_postfix,
            num_new_frames
        );
        let video_name = gif_file
            .strip_suffix(".gif")
            .unwrap_or(&gif_file)
            .to_string();
        Self {
            sample_postfix,
            gif_file,
            video_name,
        }
    }

    /// JPEG name of frame `index`; index 0 is the seed frame
    pub fn frame_file(&self, index: usize) -> String {
        format!("{}{:03}.jpg", self.video_name, index)
    }

    /// Directory holding this sample's JPEG frames
    pub fn frame_dir(&self, output_img_dir: &Path) -> PathBuf {
        output_img_dir.join(&self.video_name)
    }

    pub fn gif_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.gif_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postfix_format() {
        assert_eq!(output_postfix(2, 10, 427), "-resample02-s10-mean0427");
        assert_eq!(output_postfix(0, 5, 9999), "-resample00-s05-mean9999");
    }

    #[test]
    fn test_prompt_stem_drops_last_char() {
        assert_eq!(prompt_stem("a cat running."), "a_cat_running");
        assert_eq!(prompt_stem("x"), "");
        assert_eq!(prompt_stem(""), "");
        assert_eq!(prompt_stem("up/down now"), "up_down_no");
    }

    #[test]
    fn test_output_names() {
        let names = OutputNames::new("a red car.", "-resample02-s10-mean0001", 0, 15);
        assert_eq!(names.sample_postfix, "-resample02-s10-mean0001-00");
        assert_eq!(names.gif_file, "a_red_car-resample02-s10-mean0001-00-15.gif");
        assert_eq!(names.video_name, "a_red_car-resample02-s10-mean0001-00-15");
        assert_eq!(
            names.frame_file(0),
            "a_red_car-resample02-s10-mean0001-00-15000.jpg"
        );
        assert_eq!(
            names.frame_file(12),
            "a_red_car-resample02-s10-mean0001-00-15012.jpg"
        );
        assert_eq!(
            names.frame_dir(Path::new("imgs")),
            Path::new("imgs").join("a_red_car-resample02-s10-mean0001-00-15")
        );
    }
}
