use once_cell::sync::Lazy;
use regex::Regex;

/// CSI sequences, OSC strings and two-byte escapes
static RE_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("escape pattern is valid")
});

/// Remove terminal escape sequences and carriage returns so text can be drawn as-is
pub fn strip(text: &str) -> String {
    RE_ESCAPE.replace_all(text, "").replace('\r', "")
}
