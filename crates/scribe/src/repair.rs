//! JSON repair for truncated LLM output
//!
//! Some providers cut generation mid-object. Repair balances brackets,
//! terminates an open string, and strips trailing commas so the payload
//! parses. Already-valid JSON passes through untouched (repair is
//! idempotent). If repair still fails to parse, the caller treats the
//! extraction as degraded and falls back to regex.

/// Repair a possibly truncated JSON payload
pub fn repair_json(raw: &str) -> String {
    let trimmed = strip_wrapping(raw);
    if serde_json::from_str::<serde_json::Value>(&trimmed).is_ok() {
        return trimmed;
    }

    let mut out = String::with_capacity(trimmed.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in trimmed.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    // Terminate a string the model was cut off inside
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    // Drop a trailing comma (and whitespace) before closing
    while out
        .trim_end()
        .ends_with(',')
    {
        let end = out.trim_end().len();
        out.truncate(end - 1);
    }

    // Close whatever is still open, innermost first, stripping trailing
    // commas as each scope closes
    while let Some(close) = stack.pop() {
        while out.trim_end().ends_with(',') {
            let end = out.trim_end().len();
            out.truncate(end - 1);
        }
        out.push(close);
    }

    out
}

/// Strip markdown fences and any prose around the first JSON object
fn strip_wrapping(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    let text = text.trim();
    match text.find('{') {
        Some(start) => {
            // Keep up to the matching end if the payload already closes
            let candidate = &text[start..];
            match candidate.rfind('}') {
                Some(end) if serde_json::from_str::<serde_json::Value>(&candidate[..=end]).is_ok() => {
                    candidate[..=end].to_string()
                }
                _ => candidate.to_string(),
            }
        }
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_json_unchanged() {
        let valid = r#"{"language": "en", "material": "RF"}"#;
        assert_eq!(repair_json(valid), valid);
    }

    #[test]
    fn test_repair_is_idempotent() {
        let truncated = r#"{"language": "en", "accessories": ["EXL""#;
        let once = repair_json(truncated);
        let twice = repair_json(&once);
        assert_eq!(once, twice);
        assert!(serde_json::from_str::<serde_json::Value>(&once).is_ok());
    }

    #[test]
    fn test_repairs_missing_braces() {
        let truncated = r#"{"language": "en", "numeric_constraints": [{"value": 3000, "unit": "m3/h""#;
        let repaired = repair_json(truncated);
        let value: serde_json::Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["numeric_constraints"][0]["value"], 3000);
    }

    #[test]
    fn test_repairs_open_string() {
        let truncated = r#"{"project_name": "Riversi"#;
        let repaired = repair_json(truncated);
        let value: serde_json::Value = serde_json::from_str(&repaired).unwrap();
        assert!(value["project_name"].as_str().unwrap().starts_with("Riversi"));
    }

    #[test]
    fn test_strips_trailing_comma() {
        let bad = r#"{"a": 1, "b": 2,"#;
        let repaired = repair_json(bad);
        let value: serde_json::Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["b"], 2);
    }

    #[test]
    fn test_strips_markdown_fences_and_prose() {
        let fenced = "Here is the extraction:\n```json\n{\"language\": \"en\"}\n```";
        let repaired = repair_json(fenced);
        let value: serde_json::Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["language"], "en");
    }
}
