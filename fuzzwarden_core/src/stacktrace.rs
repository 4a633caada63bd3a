//! Stack frames from sanitizer and JVM reports.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// One frame of a crash stack trace. A `column` of 0 means the tool did
/// not report one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub source_file: String,
    pub function: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub column: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl StackFrame {
    /// `file:line[:column]`
    pub fn location(&self) -> String {
        if self.column == 0 {
            format!("{}:{}", self.source_file, self.line)
        } else {
            format!("{}:{}:{}", self.source_file, self.line, self.column)
        }
    }
}

// `    #3 0x4f3a2b in parse_header /src/parser.c:42:7`
static NATIVE_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*#\d+\s+0x[0-9a-fA-F]+\s+in\s+(?P<function>.+?)\s+(?P<file>[^\s:]+):(?P<line>\d+)(?::(?P<column>\d+))?\s*$",
    )
    .expect("native frame pattern is valid")
});

// Any native frame line, symbolized or not.
static NATIVE_FRAME_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*#\d+\s+0x[0-9a-fA-F]+").expect("frame line pattern is valid")
});

// `\tat com.example.Parser.parse(Parser.java:17)`
static JVM_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*at\s+(?:[\w.$-]+/)*(?P<function>[\w.$<>]+)\((?P<file>[^:()]+\.(?:java|kt)):(?P<line>\d+)\)",
    )
    .expect("jvm frame pattern is valid")
});

static JVM_FRAME_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*at\s+\S+\(.*\)\s*$").expect("jvm line pattern is valid"));

const RUNTIME_FUNCTION_PREFIXES: &[&str] = &[
    "__sanitizer",
    "__asan",
    "__ubsan",
    "__lsan",
    "__msan",
    "__tsan",
    "__interceptor",
    "__libc_start",
    "_start",
    "fuzzer::",
    "com.code_intelligence.jazzer.",
    "jdk.internal.",
    "java.lang.reflect.",
    "sun.reflect.",
];

const RUNTIME_PATH_MARKERS: &[&str] = &["compiler-rt", "/libfuzzer/", "/sanitizer_common/"];

/// Whether the line belongs to a stack trace at all, parsed or not.
pub fn is_frame_line(line: &str) -> bool {
    NATIVE_FRAME_LINE.is_match(line) || JVM_FRAME_LINE.is_match(line)
}

/// Parses a single frame. Returns `None` for lines that are not frames,
/// frames without source location and frames inside the sanitizer or
/// engine runtime.
pub fn parse_frame(line: &str) -> Option<StackFrame> {
    let caps = NATIVE_FRAME
        .captures(line)
        .or_else(|| JVM_FRAME.captures(line))?;

    let frame = StackFrame {
        function: caps["function"].to_string(),
        source_file: caps["file"].to_string(),
        line: caps["line"].parse().ok()?,
        column: caps
            .name("column")
            .and_then(|c| c.as_str().parse().ok())
            .unwrap_or(0),
    };
    if is_runtime_frame(&frame) {
        return None;
    }
    Some(frame)
}

fn is_runtime_frame(frame: &StackFrame) -> bool {
    RUNTIME_FUNCTION_PREFIXES
        .iter()
        .any(|p| frame.function.starts_with(p))
        || RUNTIME_PATH_MARKERS
            .iter()
            .any(|m| frame.source_file.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_symbolized_native_frame() {
        let frame =
            parse_frame("    #1 0x55d3c2 in exploreMe(int, int, std::string) /src/explore_me.cpp:18:11")
                .unwrap();
        assert_eq!(frame.function, "exploreMe(int, int, std::string)");
        assert_eq!(frame.source_file, "/src/explore_me.cpp");
        assert_eq!(frame.line, 18);
        assert_eq!(frame.column, 11);
        assert_eq!(frame.location(), "/src/explore_me.cpp:18:11");
    }

    #[test]
    fn column_is_optional() {
        let frame = parse_frame("#0 0x4f3a2b in parse_header /src/parser.c:42").unwrap();
        assert_eq!(frame.column, 0);
        assert_eq!(frame.location(), "/src/parser.c:42");
    }

    #[test]
    fn skips_runtime_frames() {
        assert!(parse_frame("#0 0x4a in __asan_memcpy /llvm/compiler-rt/lib/asan/asan_interceptors.cpp:22:3").is_none());
        assert!(parse_frame("#5 0x51 in fuzzer::Fuzzer::ExecuteCallback(unsigned char const*, unsigned long) /src/FuzzerLoop.cpp:611:15").is_none());
        assert!(parse_frame("#9 0x7f in __libc_start_main /csu/libc-start.c:308:16").is_none());
    }

    #[test]
    fn unsymbolized_frames_are_frame_lines_without_location() {
        let line = "    #2 0x7f12ab in (/lib/x86_64-linux-gnu/libc.so.6+0x2409a)";
        assert!(is_frame_line(line));
        assert!(parse_frame(line).is_none());
    }

    #[test]
    fn parses_jvm_frame() {
        let line = "\tat com.example.ExploreMe.exploreMe(ExploreMe.java:13)";
        assert!(is_frame_line(line));
        let frame = parse_frame(line).unwrap();
        assert_eq!(frame.function, "com.example.ExploreMe.exploreMe");
        assert_eq!(frame.source_file, "ExploreMe.java");
        assert_eq!(frame.line, 13);
    }

    #[test]
    fn skips_jazzer_frames() {
        let line = "\tat com.code_intelligence.jazzer.driver.FuzzTargetRunner.runOne(FuzzTargetRunner.java:220)";
        assert!(is_frame_line(line));
        assert!(parse_frame(line).is_none());
    }

    #[test]
    fn ordinary_lines_are_not_frames() {
        assert!(!is_frame_line("INFO: Seed: 3265"));
        assert!(parse_frame("SUMMARY: AddressSanitizer: heap-buffer-overflow").is_none());
    }
}
