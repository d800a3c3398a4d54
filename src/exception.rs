//! Turns a captured backtrace into the structured `$exception_*` property
//! bag. Frames are parsed out of the standard backtrace rendering, classified
//! as in-app or library code, and annotated with surrounding source lines
//! when the file is readable.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::message::Properties;

/// Most frames kept per stack trace, most recent first.
const MAX_FRAMES: usize = 50;
/// Lines of source context captured on each side of the error line.
const CONTEXT_LINES: usize = 5;

/// Path substrings that mark a frame as library (not application) code:
/// the toolchain source tree, registry checkouts, system install prefixes,
/// and vendored dependencies.
const LIBRARY_PATH_MARKERS: &[&str] = &[
    "/rustc/",
    "/.cargo/",
    "/.rustup/",
    "/library/std/",
    "/library/core/",
    "/library/alloc/",
    "/usr/lib/",
    "/vendor/",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct StackFrame {
    pub filename: String,
    pub abs_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colno: Option<u32>,
    pub function: String,
    pub in_app: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_line: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pre_context: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub post_context: Vec<String>,
}

fn frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\d+:\s+(.+?)\s*$").expect("frame regex is valid"))
}

fn location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s+at\s+(.+?):(\d+)(?::(\d+))?\s*$").expect("location regex is valid")
    })
}

fn is_in_app(abs_path: &str) -> bool {
    !LIBRARY_PATH_MARKERS
        .iter()
        .any(|marker| abs_path.contains(marker))
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned())
}

/// Attach the error line and up to [`CONTEXT_LINES`] lines on each side.
/// Read failures leave the context fields empty.
fn attach_source_context(frame: &mut StackFrame) {
    let Some(lineno) = frame.lineno else {
        return;
    };
    let Ok(source) = std::fs::read_to_string(&frame.abs_path) else {
        return;
    };
    let lines: Vec<&str> = source.lines().collect();
    let index = lineno as usize;
    if index == 0 || index > lines.len() {
        return;
    }
    let index = index - 1;
    frame.context_line = Some(lines[index].to_owned());
    frame.pre_context = lines[index.saturating_sub(CONTEXT_LINES)..index]
        .iter()
        .map(|l| (*l).to_owned())
        .collect();
    let post_end = (index + 1 + CONTEXT_LINES).min(lines.len());
    frame.post_context = lines[index + 1..post_end]
        .iter()
        .map(|l| (*l).to_owned())
        .collect();
}

/// Parse the rendered backtrace into structured frames, most recent first.
/// The standard rendering already lists the innermost frame first, so order
/// is preserved while truncating to [`MAX_FRAMES`].
pub(crate) fn parse_frames(backtrace: &str) -> Vec<StackFrame> {
    let mut frames: Vec<StackFrame> = Vec::new();
    for line in backtrace.lines() {
        if let Some(captures) = frame_re().captures(line) {
            if frames.len() >= MAX_FRAMES {
                break;
            }
            frames.push(StackFrame {
                filename: String::new(),
                abs_path: String::new(),
                lineno: None,
                colno: None,
                function: captures[1].to_owned(),
                in_app: true,
                context_line: None,
                pre_context: Vec::new(),
                post_context: Vec::new(),
            });
        } else if let Some(captures) = location_re().captures(line) {
            if let Some(frame) = frames.last_mut() {
                // A frame line may be followed by several rendered
                // locations (inlined frames); keep the first.
                if !frame.abs_path.is_empty() {
                    continue;
                }
                frame.abs_path = captures[1].to_owned();
                frame.filename = basename(&frame.abs_path);
                frame.lineno = captures[2].parse().ok();
                frame.colno = captures.get(3).and_then(|c| c.as_str().parse().ok());
                frame.in_app = is_in_app(&frame.abs_path);
                attach_source_context(frame);
            }
        }
    }
    frames
}

fn exception_record(
    exception_type: &str,
    message: &str,
    frames: Option<Vec<StackFrame>>,
    handled: bool,
    synthetic: bool,
) -> Value {
    let mut record = json!({
        "type": exception_type,
        "value": message,
        "mechanism": {
            "type": "generic",
            "handled": handled,
            "synthetic": synthetic,
        },
    });
    if let Some(frames) = frames {
        record["stacktrace"] = json!({ "frames": frames });
    }
    record
}

fn property_bag(exception_type: &str, message: &str, record: Value) -> Properties {
    let mut properties = Properties::new();
    properties.insert("$exception_type".to_owned(), exception_type.into());
    properties.insert("$exception_message".to_owned(), message.into());
    properties.insert("$exception_list".to_owned(), Value::Array(vec![record]));
    properties
}

/// Property bag for a real error with a captured backtrace.
pub(crate) fn error_properties(
    exception_type: &str,
    message: &str,
    backtrace: &str,
) -> Properties {
    let frames = parse_frames(backtrace);
    let frames = if frames.is_empty() { None } else { Some(frames) };
    let record = exception_record(exception_type, message, frames, true, false);
    property_bag(exception_type, message, record)
}

/// Property bag for a synthetic capture from a plain string. Carries no
/// stack trace.
pub(crate) fn message_properties(message: &str) -> Properties {
    let record = exception_record("Error", message, None, true, true);
    property_bag("Error", message, record)
}

/// Last path segment of a fully-qualified type name, e.g.
/// `std::io::Error` becomes `Error`.
pub(crate) fn short_type_name(full: &str) -> &str {
    full.rsplit("::").next().unwrap_or(full)
}
