/// Machine-type pattern helpers shared by the lifecycle policy and settings.
///
/// Patterns are comma-separated template names with `*` wildcard support
/// (case-insensitive). Nothing else is glob syntax.

/// Machine classes that cannot be powered off without losing state
/// (instances backed by ephemeral local disks).
pub const DEFAULT_UNSTOPPABLE_TEMPLATE_PATTERNS: &str = "*-LOCALSSD,*-EPHEMERAL";

/// Parse comma-separated patterns.
///
/// - Trims whitespace
/// - Drops empty entries
/// - If input is None, returns the default patterns; an explicit empty string
///   means "no patterns"
pub fn parse_template_patterns(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or(DEFAULT_UNSTOPPABLE_TEMPLATE_PATTERNS)
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Return true if `template` matches at least one pattern.
pub fn template_matches_patterns(template: &str, patterns: &[String]) -> bool {
    let name = template.trim().to_ascii_uppercase();
    if name.is_empty() {
        return false;
    }
    patterns
        .iter()
        .map(|p| p.trim().to_ascii_uppercase())
        .filter(|p| !p.is_empty())
        .any(|p| glob_match(&name, &p))
}

fn glob_match(name: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return name == pattern;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];

    // Fixed prefix and suffix must both fit without overlapping.
    if name.len() < first.len() + last.len() || !name.starts_with(first) || !name.ends_with(last) {
        return false;
    }

    let end = name.len() - last.len();
    let mut idx = first.len();
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match name[idx..end].find(part) {
            Some(pos) => idx += pos + part.len(),
            None => return false,
        }
    }
    true
}
