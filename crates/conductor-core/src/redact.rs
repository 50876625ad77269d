//! Secret redaction for captured agent output.
//!
//! Every line read from an agent process passes through [`redact_secrets`]
//! exactly once, before it is buffered, persisted or delivered to a
//! subscriber. Matches are replaced with [`REDACTED`].

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Placeholder substituted for every secret-shaped match.
pub const REDACTED: &str = "[REDACTED]";

/// Prefix-anchored credential formats. Order matters: the more specific
/// `sk-ant-` form must run before the generic `sk-` one.
#[allow(clippy::expect_used)]
static PREFIXED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"sk-ant-[a-zA-Z0-9\-_]{20,}",
        r"sk-[a-zA-Z0-9]{20,}",
        r"AKIA[0-9A-Z]{16}",
        r"gh[pousr]_[a-zA-Z0-9]{36}",
        r"github_pat_[a-zA-Z0-9_]{22,}",
        r"xox[abpr]-[a-zA-Z0-9\-]{10,}",
        r"Bearer\s+[a-zA-Z0-9\-_.=]{20,}",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex is valid"))
    .collect()
});

/// `key = value` style assignments; the key and separator are kept.
#[allow(clippy::expect_used)]
static ASSIGNMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(api[_-]?key|secret|token|password|passwd)(\s*[=:]\s*)['"]?[a-zA-Z0-9\-_.]{16,}"#,
    )
    .expect("static regex is valid")
});

/// Long hex runs. 40-char git object ids are deliberately below the threshold.
#[allow(clippy::expect_used)]
static HEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-fA-F]{48,}\b").expect("static regex is valid"));

/// Long base64-alphabet runs; filtered further by [`looks_like_credential`].
#[allow(clippy::expect_used)]
static BASE64_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/_\-]{40,}={0,2}").expect("static regex is valid"));

/// Replace every secret-shaped substring in `input` with [`REDACTED`].
///
/// Returns `Cow::Borrowed` when nothing matched so the common case does not
/// allocate.
pub fn redact_secrets(input: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(input);

    for re in PREFIXED_PATTERNS.iter() {
        if re.is_match(&out) {
            out = Cow::Owned(re.replace_all(&out, REDACTED).into_owned());
        }
    }

    if ASSIGNMENT_RE.is_match(&out) {
        out = Cow::Owned(
            ASSIGNMENT_RE
                .replace_all(&out, |caps: &Captures<'_>| {
                    format!("{}{}{REDACTED}", &caps[1], &caps[2])
                })
                .into_owned(),
        );
    }

    if HEX_RE.is_match(&out) {
        out = Cow::Owned(HEX_RE.replace_all(&out, REDACTED).into_owned());
    }

    if BASE64_RE.is_match(&out) {
        let replaced = BASE64_RE.replace_all(&out, |caps: &Captures<'_>| {
            let candidate = &caps[0];
            if looks_like_credential(candidate) {
                REDACTED.to_string()
            } else {
                candidate.to_string()
            }
        });
        if let Cow::Owned(s) = replaced {
            out = Cow::Owned(s);
        }
    }

    out
}

/// Mixed character classes and few path separators: random key material
/// rather than an identifier or a filesystem path.
fn looks_like_credential(candidate: &str) -> bool {
    let has_digit = candidate.bytes().any(|b| b.is_ascii_digit());
    let has_upper = candidate.bytes().any(|b| b.is_ascii_uppercase());
    let has_lower = candidate.bytes().any(|b| b.is_ascii_lowercase());
    let slashes = candidate.bytes().filter(|&b| b == b'/').count();
    let separators = candidate.bytes().filter(|&b| b == b'_' || b == b'-').count();
    has_digit && has_upper && has_lower && slashes < 3 && separators < 4
}
