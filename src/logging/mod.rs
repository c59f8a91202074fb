use once_cell::sync::Lazy;
use regex::Regex;
use tracing_subscriber::EnvFilter;

/// Maximum message length before truncation
const MAX_LINE_LENGTH: usize = 2048;

/// Default filter when RUST_LOG is unset
pub const DEFAULT_FILTER: &str = "opsrelay=info,warn";

/// Sensitive patterns to redact
static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // SSH Private key blocks
        r"(?s)-----BEGIN[^-]*PRIVATE KEY-----.*?-----END[^-]*PRIVATE KEY-----",
        r"(?s)-----BEGIN[^-]*KEY-----.*?-----END[^-]*KEY-----",
        // Authorization headers
        r"(?i)authorization\s*:\s*(bearer|basic)\s+[^\s]+",
        // Generic secrets by key name (key=value patterns)
        r#"(?i)(password|passwd|pwd|secret|token|private[_-]?key|passphrase)\s*[:=]\s*["']?[^\s"']+["']?"#,
        // Long base64 blobs (key material)
        r"[A-Za-z0-9+/]{64,}={0,2}",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Sanitize a string by removing sensitive information
pub fn sanitize(input: &str) -> String {
    let mut result = input.to_string();

    for pattern in SENSITIVE_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    if result.len() > MAX_LINE_LENGTH {
        let mut cut = MAX_LINE_LENGTH;
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        result = format!("{}... [truncated]", &result[..cut]);
    }

    result
}

/// Install the global fmt subscriber. `filter` overrides RUST_LOG when set.
pub fn init_tracing(filter: Option<&str>) {
    let env_filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()),
    };

    // A subscriber may already be installed by the hosting process
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}
