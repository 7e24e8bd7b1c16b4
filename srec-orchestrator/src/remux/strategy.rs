//! Remux strategies and their ffmpeg invocations.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::process::CommandSpec;

/// Audio bitstream filter that repairs ADTS AAC for MP4-family containers.
pub const AUDIO_REPAIR_FILTER: &str = "aac_adtstoasc";

const MUXING_QUEUE_SIZE: &str = "4096";

/// Strategies in the order they are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemuxStrategy {
    /// Stream copy with the audio repair filter.
    CopyWithBsf,
    /// Stream copy with regenerated timestamps and a larger mux queue.
    RelaxedSync,
    /// Demux into elementary streams, then combine them.
    TwoStep,
}

impl RemuxStrategy {
    pub const ORDER: [RemuxStrategy; 3] = [Self::CopyWithBsf, Self::RelaxedSync, Self::TwoStep];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CopyWithBsf => "copy_with_bsf",
            Self::RelaxedSync => "relaxed_sync",
            Self::TwoStep => "two_step",
        }
    }

    /// Invocations to run in sequence. All but `TwoStep` use one. Every
    /// invocation that writes the target carries the audio repair filter.
    pub fn invocations(&self, ffmpeg: &str, input: &RemuxInput, target: &Path) -> Vec<CommandSpec> {
        match self {
            Self::CopyWithBsf => {
                let mut args = base_args();
                args.extend(input.args());
                args.extend(copy_all_streams());
                args.extend(repair_args());
                args.extend(container_args(target));
                args.push(path_arg(target));
                vec![CommandSpec::new(ffmpeg, args)]
            }
            Self::RelaxedSync => {
                let mut args = base_args();
                args.extend(owned(&["-fflags", "+genpts+igndts"]));
                args.extend(input.args());
                args.extend(copy_all_streams());
                args.extend(repair_args());
                args.extend(owned(&[
                    "-avoid_negative_ts",
                    "make_zero",
                    "-max_muxing_queue_size",
                    MUXING_QUEUE_SIZE,
                ]));
                args.extend(container_args(target));
                args.push(path_arg(target));
                vec![CommandSpec::new(ffmpeg, args)]
            }
            Self::TwoStep => {
                let (video, audio) = intermediate_paths(target);

                let mut split = base_args();
                split.extend(input.args());
                split.extend(owned(&["-map", "0:v:0?", "-c", "copy", "-f", "mpegts"]));
                split.push(path_arg(&video));
                split.extend(owned(&["-map", "0:a:0?", "-c", "copy", "-f", "adts"]));
                split.push(path_arg(&audio));

                let mut combine = base_args();
                combine.extend(owned(&["-fflags", "+genpts", "-i"]));
                combine.push(path_arg(&video));
                combine.push("-i".to_string());
                combine.push(path_arg(&audio));
                combine.extend(owned(&["-map", "0:v?", "-map", "1:a?", "-c", "copy"]));
                combine.extend(repair_args());
                combine.extend(owned(&["-avoid_negative_ts", "make_zero"]));
                combine.extend(container_args(target));
                combine.push(path_arg(target));

                vec![
                    CommandSpec::new(ffmpeg, split),
                    CommandSpec::new(ffmpeg, combine),
                ]
            }
        }
    }
}

impl std::fmt::Display for RemuxStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the remux tool reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemuxInput {
    /// A single raw container file.
    File(PathBuf),
    /// A concat list describing the segments of a directory artifact.
    ConcatList(PathBuf),
}

impl RemuxInput {
    fn args(&self) -> Vec<String> {
        match self {
            Self::File(path) => vec!["-i".to_string(), path_arg(path)],
            Self::ConcatList(list) => {
                let mut args = owned(&["-f", "concat", "-safe", "0", "-i"]);
                args.push(path_arg(list));
                args
            }
        }
    }
}

/// Scratch files of the two-step strategy, next to the target.
pub fn intermediate_paths(target: &Path) -> (PathBuf, PathBuf) {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "remux".to_string());
    (
        target.with_file_name(format!("{stem}.video.tmp.ts")),
        target.with_file_name(format!("{stem}.audio.tmp.aac")),
    )
}

fn base_args() -> Vec<String> {
    owned(&["-y", "-hide_banner", "-nostdin", "-loglevel", "warning"])
}

fn copy_all_streams() -> Vec<String> {
    owned(&["-map", "0:v?", "-map", "0:a?", "-c", "copy"])
}

fn repair_args() -> Vec<String> {
    vec!["-bsf:a".to_string(), AUDIO_REPAIR_FILTER.to_string()]
}

fn container_args(target: &Path) -> Vec<String> {
    let ext = target
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("mp4" | "m4v" | "mov") => owned(&["-movflags", "+faststart"]),
        _ => Vec::new(),
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
