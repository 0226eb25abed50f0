//! Markdown tables for human-readable output.

use serde_json::{Map, Value};

/// Builds one markdown table from JSON rows.
///
/// ```
/// use serde_json::json;
/// use sp_connectors::markdown::TableBuilder;
///
/// let md = TableBuilder::new("Users")
///     .headers(&["id", "name"])
///     .render(&[json!({"id": 1, "name": "ann"})]);
/// assert_eq!(md, "### Users\n|id|name|\n|---|---|\n| 1 | ann |\n");
/// ```
pub struct TableBuilder {
    name: String,
    headers: Option<Vec<String>>,
    header_transform: Option<fn(&str) -> String>,
    remove_null: bool,
}

impl TableBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            headers: None,
            header_transform: None,
            remove_null: false,
        }
    }

    /// Columns to show, in order. Defaults to every key, in order of first appearance.
    pub fn headers(mut self, headers: &[&str]) -> Self {
        self.headers = Some(headers.iter().map(|h| h.to_string()).collect());
        self
    }

    /// Renames column labels; the keys used for lookup are unchanged.
    pub fn header_labels(mut self, transform: fn(&str) -> String) -> Self {
        self.header_transform = Some(transform);
        self
    }

    /// Drops columns that are empty in every row.
    pub fn remove_null(mut self, remove: bool) -> Self {
        self.remove_null = remove;
        self
    }

    pub fn render(&self, rows: &[Value]) -> String {
        let mut out = String::new();
        if !self.name.is_empty() {
            out.push_str("### ");
            out.push_str(&self.name);
            out.push('\n');
        }

        let rows: Vec<Map<String, Value>> = rows
            .iter()
            .map(|row| match row {
                Value::Object(map) => map.clone(),
                other => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other.clone());
                    map
                }
            })
            .collect();

        if rows.is_empty() {
            out.push_str("**No entries.**\n");
            return out;
        }

        let mut headers = match &self.headers {
            Some(headers) => headers.clone(),
            None => {
                let mut keys: Vec<String> = Vec::new();
                for row in &rows {
                    for key in row.keys() {
                        if !keys.contains(key) {
                            keys.push(key.clone());
                        }
                    }
                }
                keys
            }
        };

        if self.remove_null {
            headers.retain(|h| rows.iter().any(|row| !is_empty_cell(row.get(h))));
        }

        if headers.is_empty() {
            out.push_str("**No entries.**\n");
            return out;
        }

        let labels: Vec<String> = headers
            .iter()
            .map(|h| match self.header_transform {
                Some(transform) => transform(h),
                None => h.clone(),
            })
            .collect();

        out.push('|');
        out.push_str(&labels.join("|"));
        out.push_str("|\n|");
        out.push_str(&vec!["---"; headers.len()].join("|"));
        out.push_str("|\n");

        for row in &rows {
            let cells: Vec<String> = headers
                .iter()
                .map(|h| escape_cell(&format_cell(row.get(h).unwrap_or(&Value::Null))))
                .collect();
            out.push_str("| ");
            out.push_str(&cells.join(" | "));
            out.push_str(" |\n");
        }

        out
    }
}

/// Renders a table from a JSON array (or a single object).
pub fn table_to_markdown(name: &str, rows: &Value, headers: Option<&[&str]>) -> String {
    let rows: Vec<Value> = match rows {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    };
    let mut builder = TableBuilder::new(name);
    if let Some(headers) = headers {
        builder = builder.headers(headers);
    }
    builder.render(&rows)
}

/// Text of one cell before escaping.
pub fn format_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(items) => {
            if items.iter().all(|v| !v.is_object() && !v.is_array()) {
                items.iter().map(format_cell).collect::<Vec<_>>().join(",\n")
            } else {
                value.to_string()
            }
        }
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}: {}", k, format_cell(v)))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace("\r\n", "<br>").replace('\n', "<br>")
}

fn is_empty_cell(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        _ => false,
    }
}

/// `PascalCase` to `Pascal Case`, keeping acronyms together (`VPRScore` to `VPR Score`).
pub fn pascal_to_space(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if i > 0 && c.is_uppercase() {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).map_or(false, |n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_is_lower) {
                out.push(' ');
            }
        }
        if c == '_' {
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `snake_case` to `Snake Case`.
pub fn string_to_table_header(s: &str) -> String {
    s.replace('_', " ")
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_table() {
        let rows = json!([{"a": 1, "b": "x"}, {"a": 2, "b": null}]);
        assert_eq!(
            table_to_markdown("T", &rows, None),
            "### T\n|a|b|\n|---|---|\n| 1 | x |\n| 2 |  |\n"
        );
    }

    #[test]
    fn test_empty_table() {
        assert_eq!(table_to_markdown("T", &json!([]), None), "### T\n**No entries.**\n");
        assert_eq!(table_to_markdown("T", &Value::Null, Some(&["a"])), "### T\n**No entries.**\n");
    }

    #[test]
    fn test_cell_rendering() {
        let rows = json!([{
            "list": ["a", "b"],
            "obj": {"k": "v", "n": 2},
            "pipe": "a|b",
            "multi": "l1\nl2",
            "flag": true
        }]);
        let md = TableBuilder::new("")
            .headers(&["list", "obj", "pipe", "multi", "flag"])
            .render(rows.as_array().unwrap());
        assert_eq!(
            md,
            "|list|obj|pipe|multi|flag|\n|---|---|---|---|---|\n| a,<br>b | k: v<br>n: 2 | a\\|b | l1<br>l2 | true |\n"
        );
    }

    #[test]
    fn test_remove_null_and_labels() {
        let rows = vec![json!({"ScanId": 1, "Empty": null}), json!({"ScanId": 2, "Empty": ""})];
        let md = TableBuilder::new("Scans")
            .header_labels(pascal_to_space)
            .remove_null(true)
            .render(&rows);
        assert_eq!(md, "### Scans\n|Scan Id|\n|---|\n| 1 |\n| 2 |\n");
    }

    #[test]
    fn test_header_helpers() {
        assert_eq!(pascal_to_space("IsActive"), "Is Active");
        assert_eq!(pascal_to_space("VPRScore"), "VPR Score");
        assert_eq!(pascal_to_space("ipv4Address"), "ipv4 Address");
        assert_eq!(string_to_table_header("asset_id"), "Asset Id");
        assert_eq!(string_to_table_header("NAME"), "Name");
    }
}
