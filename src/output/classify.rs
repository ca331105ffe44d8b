use serde_json::Value;

use crate::model::{ExecutionOutput, OutputKind, META_CONTENT_TYPE, META_SIZE};

fn looks_like_json(content: &str) -> bool {
    let content = content.trim();
    (content.starts_with('{') && content.ends_with('}'))
        || (content.starts_with('[') && content.ends_with(']'))
}

fn looks_like_xml(content: &str) -> bool {
    content.trim_start().starts_with('<')
}

fn looks_like_html(content: &str) -> bool {
    let content = content.trim_start();
    content.starts_with("<!DOCTYPE html>") || content.starts_with("<html>") || content.contains("<body>")
}

/// MIME type guessed from the shape of the text.
pub fn content_type(content: &str) -> &'static str {
    if looks_like_json(content) {
        "application/json"
    } else if looks_like_html(content) {
        "text/html"
    } else if looks_like_xml(content) {
        "application/xml"
    } else {
        "text/plain"
    }
}

/// Turn one flushed chunk of program output into an output entry.
///
/// JSON objects become structured data (pretty-printed), JSON arrays become
/// collections, markup-looking text becomes markup, anything else is text.
pub fn classify(raw: &str) -> ExecutionOutput {
    let trimmed = raw.trim_end();

    let parsed = if looks_like_json(trimmed) {
        serde_json::from_str::<Value>(trimmed).ok()
    } else {
        None
    };

    let (kind, content) = match parsed {
        Some(Value::Array(_)) => (OutputKind::Collection, trimmed.to_string()),
        Some(value) => {
            let pretty = serde_json::to_string_pretty(&value).unwrap_or_else(|_| trimmed.to_string());
            (OutputKind::StructuredData, pretty)
        }
        None if looks_like_xml(trimmed) || looks_like_html(trimmed) => {
            (OutputKind::Markup, trimmed.to_string())
        }
        None => (OutputKind::Text, trimmed.to_string()),
    };

    ExecutionOutput::new(kind, content)
        .with_metadata(META_SIZE, raw.len().to_string())
        .with_metadata(META_CONTENT_TYPE, content_type(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text() {
        let output = classify("hi\n");
        assert_eq!(output.kind, OutputKind::Text);
        assert_eq!(output.content, "hi");
        assert_eq!(output.metadata[META_SIZE], "3");
        assert_eq!(output.metadata[META_CONTENT_TYPE], "text/plain");
    }

    #[test]
    fn test_object_is_pretty_printed() {
        let output = classify("{\"a\":1,\"b\":[2]}\n");
        assert_eq!(output.kind, OutputKind::StructuredData);
        assert_eq!(output.content, "{\n  \"a\": 1,\n  \"b\": [\n    2\n  ]\n}");
        assert_eq!(output.metadata[META_CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_array_is_collection() {
        let output = classify("[1,2,3]");
        assert_eq!(output.kind, OutputKind::Collection);
        assert_eq!(output.content, "[1,2,3]");
    }

    #[test]
    fn test_scalars_stay_text() {
        assert_eq!(classify("42").kind, OutputKind::Text);
        assert_eq!(classify("true").kind, OutputKind::Text);
    }

    #[test]
    fn test_broken_json_is_text() {
        let output = classify("{not json}");
        assert_eq!(output.kind, OutputKind::Text);
        assert_eq!(output.metadata[META_CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_markup() {
        let xml = classify("<?xml version=\"1.0\"?><a/>");
        assert_eq!(xml.kind, OutputKind::Markup);
        assert_eq!(xml.metadata[META_CONTENT_TYPE], "application/xml");
        let html = classify("<html><body>x</body></html>");
        assert_eq!(html.metadata[META_CONTENT_TYPE], "text/html");
    }
}
