//! Recoverable field-set records
//!
//! A [`FieldSet`] is a tree of string values addressed by dotted paths
//! (`Segments.0.DataBlocks.Count`). It is the on-disk form of insert
//! progress: written as `Key=value` lines and closed by an `End` line.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// Line that terminates a serialized field set
const END_MARKER: &str = "End";

/// Errors produced while reading field sets
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldSetError {
    #[error("line {line}: expected key=value, got {text:?}")]
    MalformedLine { line: usize, text: String },

    #[error("line {line}: empty key segment in {key:?}")]
    EmptyKey { line: usize, key: String },

    #[error("missing End terminator")]
    MissingEnd,

    #[error("field {key}: cannot parse {value:?}: {reason}")]
    Parse {
        key: String,
        value: String,
        reason: String,
    },
}

/// Hierarchical string record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    values: BTreeMap<String, String>,
    subsets: BTreeMap<String, FieldSet>,
}

impl FieldSet {
    /// Create an empty field set
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.subsets.values().all(FieldSet::is_empty)
    }

    /// Store a string value; dots in `key` address nested subsets
    pub fn put_single(&mut self, key: &str, value: impl Into<String>) {
        match key.split_once('.') {
            Some((head, rest)) => self
                .subsets
                .entry(head.to_string())
                .or_default()
                .put_single(rest, value),
            None => {
                self.values.insert(key.to_string(), value.into());
            }
        }
    }

    /// Store any displayable value
    pub fn put(&mut self, key: &str, value: impl Display) {
        self.put_single(key, value.to_string());
    }

    /// Attach a nested field set under `key`, replacing any previous one
    pub fn put_subset(&mut self, key: &str, subset: FieldSet) {
        match key.split_once('.') {
            Some((head, rest)) => self
                .subsets
                .entry(head.to_string())
                .or_default()
                .put_subset(rest, subset),
            None => {
                self.subsets.insert(key.to_string(), subset);
            }
        }
    }

    /// Look up a value by dotted path
    pub fn get(&self, key: &str) -> Option<&str> {
        match key.split_once('.') {
            Some((head, rest)) => self.subsets.get(head)?.get(rest),
            None => self.values.get(key).map(String::as_str),
        }
    }

    /// Look up and parse a value; `Ok(None)` when absent
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, FieldSetError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|e| FieldSetError::Parse {
                key: key.to_string(),
                value: raw.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Look up a nested subset by dotted path
    pub fn subset(&self, key: &str) -> Option<&FieldSet> {
        match key.split_once('.') {
            Some((head, rest)) => self.subsets.get(head)?.subset(rest),
            None => self.subsets.get(key),
        }
    }

    /// Detach a direct subset
    pub fn remove_subset(&mut self, key: &str) -> Option<FieldSet> {
        self.subsets.remove(key)
    }

    /// Direct `(key, value)` pairs of this level
    pub fn values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialize to the line format
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        self.write_lines("", &mut out);
        out.push_str(END_MARKER);
        out.push('\n');
        out
    }

    fn write_lines(&self, prefix: &str, out: &mut String) {
        for (key, value) in &self.values {
            out.push_str(prefix);
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        for (key, subset) in &self.subsets {
            subset.write_lines(&format!("{}{}.", prefix, key), out);
        }
    }

    /// Parse the line format produced by [`FieldSet::to_text`]
    pub fn from_text(text: &str) -> Result<Self, FieldSetError> {
        let mut fs = FieldSet::new();

        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if line == END_MARKER {
                return Ok(fs);
            }

            let (key, value) = line.split_once('=').ok_or_else(|| FieldSetError::MalformedLine {
                line: line_no,
                text: line.to_string(),
            })?;

            if key.split('.').any(str::is_empty) {
                return Err(FieldSetError::EmptyKey {
                    line: line_no,
                    key: key.to_string(),
                });
            }

            fs.put_single(key, value);
        }

        Err(FieldSetError::MissingEnd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_nested_put_and_get() {
        let mut fs = FieldSet::new();
        fs.put_single("Type", "SplitFileInserter");
        fs.put("Segments.Count", 3);
        fs.put("Segments.0.Encoded", true);

        assert_eq!(fs.get("Type"), Some("SplitFileInserter"));
        assert_eq!(fs.get("Segments.Count"), Some("3"));
        assert_eq!(fs.subset("Segments").unwrap().get("0.Encoded"), Some("true"));
        assert_eq!(fs.get("Segments.1.Encoded"), None);
    }

    #[test]
    fn test_text_roundtrip() {
        let mut segment = FieldSet::new();
        segment.put("SegmentNumber", 0);
        segment.put("DataBlocks.Count", 2);

        let mut fs = FieldSet::new();
        fs.put("DataLength", 65536u64);
        fs.put("CompressionCodec", -1i16);
        fs.put_subset("Segments.0", segment);
        fs.put("Segments.Count", 1);

        let text = fs.to_text();
        assert!(text.ends_with("End\n"));
        assert!(text.contains("Segments.0.DataBlocks.Count=2\n"));

        let parsed = FieldSet::from_text(&text).unwrap();
        assert_eq!(parsed, fs);
    }

    #[test]
    fn test_value_may_contain_equals() {
        let mut fs = FieldSet::new();
        fs.put_single("Message", "a=b");
        let parsed = FieldSet::from_text(&fs.to_text()).unwrap();
        assert_eq!(parsed.get("Message"), Some("a=b"));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            FieldSet::from_text("DataLength=1\n"),
            Err(FieldSetError::MissingEnd)
        );
        assert!(matches!(
            FieldSet::from_text("DataLength\nEnd\n"),
            Err(FieldSetError::MalformedLine { line: 1, .. })
        ));
        assert!(matches!(
            FieldSet::from_text("Segments..Count=1\nEnd\n"),
            Err(FieldSetError::EmptyKey { line: 1, .. })
        ));
    }

    #[test]
    fn test_get_parsed() {
        let mut fs = FieldSet::new();
        fs.put_single("DataLength", "12345");
        fs.put_single("SegmentSize", "many");

        assert_eq!(fs.get_parsed::<u64>("DataLength").unwrap(), Some(12345));
        assert_eq!(fs.get_parsed::<u64>("Missing").unwrap(), None);
        assert!(matches!(
            fs.get_parsed::<i32>("SegmentSize"),
            Err(FieldSetError::Parse { .. })
        ));
    }

    #[test]
    fn test_remove_subset() {
        let mut fs = FieldSet::new();
        fs.put("Segments.0.Encoded", false);
        let removed = fs.remove_subset("Segments").unwrap();
        assert_eq!(removed.get("0.Encoded"), Some("false"));
        assert!(fs.is_empty());
    }
}
