use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

/// Typed frontmatter: the well-known keys projected out, everything else
/// passed through verbatim in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frontmatter {
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub aliases: Vec<String>,
    pub css_classes: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub extra: Vec<(String, Value)>,
    /// Lines consumed, including both `---` delimiters. Zero when the
    /// document has no frontmatter block.
    pub lines_consumed: usize,
}

impl Frontmatter {
    pub fn is_present(&self) -> bool {
        self.lines_consumed > 0
    }
}

/// Parse a leading `---` block. An unterminated block is not frontmatter;
/// the whole text is then body content.
pub fn parse_frontmatter(lines: &[&str]) -> Frontmatter {
    let mut fm = Frontmatter::default();

    if lines.first().map(|l| l.trim_end()) != Some("---") {
        return fm;
    }
    let Some(close) = lines
        .iter()
        .skip(1)
        .position(|l| l.trim_end() == "---")
        .map(|i| i + 1)
    else {
        return fm;
    };

    for line in &lines[1..close] {
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        let Some((key, raw_value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let raw_value = raw_value.trim();

        match key {
            "title" => fm.title = Some(unquote(raw_value).to_string()),
            "tags" => fm.tags = parse_string_list(raw_value),
            "aliases" => fm.aliases = parse_string_list(raw_value),
            "cssclasses" => fm.css_classes = parse_string_list(raw_value),
            "created" => fm.created = parse_date(raw_value),
            "modified" => fm.modified = parse_date(raw_value),
            _ => fm.extra.push((key.to_string(), parse_value(raw_value))),
        }
    }

    fm.lines_consumed = close + 1;
    fm
}

/// `[a, b]` or bare comma-separated items, quotes stripped.
fn parse_string_list(raw: &str) -> Vec<String> {
    let inner = raw
        .strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .unwrap_or(raw);
    inner
        .split(',')
        .map(|item| unquote(item.trim()).to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = unquote(raw);
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Scalars become typed JSON values: booleans, numbers, arrays; ISO dates and
/// everything else stay strings.
fn parse_value(raw: &str) -> Value {
    if raw.starts_with('[') && raw.ends_with(']') {
        return Value::Array(parse_string_list(raw).into_iter().map(Value::String).collect());
    }
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(unquote(raw).to_string())
}

fn unquote(raw: &str) -> &str {
    let raw = raw.trim();
    raw.strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')))
        .unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<&str> {
        text.lines().collect()
    }

    #[test]
    fn parses_known_keys_and_passthrough() {
        let text = "---\ntitle: Note A\ntags: [alpha, beta]\naliases: one, two\ncustom: 42\nflag: true\n---\nbody";
        let fm = parse_frontmatter(&lines(text));

        assert_eq!(fm.title.as_deref(), Some("Note A"));
        assert_eq!(fm.tags, vec!["alpha", "beta"]);
        assert_eq!(fm.aliases, vec!["one", "two"]);
        assert_eq!(fm.lines_consumed, 7);
        assert_eq!(fm.extra[0], ("custom".to_string(), Value::from(42)));
        assert_eq!(fm.extra[1], ("flag".to_string(), Value::Bool(true)));
    }

    #[test]
    fn parses_iso_dates() {
        let text = "---\ncreated: 2024-03-01\nmodified: 2024-03-02T10:30:00Z\n---";
        let fm = parse_frontmatter(&lines(text));
        assert_eq!(fm.created.unwrap().to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert_eq!(fm.modified.unwrap().to_rfc3339(), "2024-03-02T10:30:00+00:00");
    }

    #[test]
    fn unterminated_block_is_not_frontmatter() {
        let fm = parse_frontmatter(&lines("---\ntitle: dangling\nbody text"));
        assert!(!fm.is_present());
        assert!(fm.title.is_none());
    }

    #[test]
    fn missing_frontmatter_consumes_nothing() {
        let fm = parse_frontmatter(&lines("# Heading\nbody"));
        assert_eq!(fm.lines_consumed, 0);
    }
}
