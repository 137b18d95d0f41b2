use std::collections::HashMap;
use std::path::Path;

/// Id-to-token mapping loaded from the model's `vocab.json`.
///
/// The file is scanned for `"token": id` pairs rather than parsed as JSON:
/// exported vocabularies vary in surrounding structure (wrapping objects,
/// trailing commas, comments) and the pipeline only needs the pairs. A
/// missing file yields an empty mapping so captioning can still run and
/// render raw ids.
#[derive(Debug, Default, Clone)]
pub struct Vocabulary {
    map: HashMap<i64, String>,
}

impl Vocabulary {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    /// Scans `content` for `"token": id` pairs. Malformed entries are
    /// skipped; scanning resumes after the broken entry. Later occurrences of
    /// an id overwrite earlier ones.
    pub fn parse(content: &str) -> Self {
        let mut map = HashMap::new();
        let bytes = content.as_bytes();
        let mut i = 0usize;
        while i < bytes.len() {
            if bytes[i] != b'"' {
                i += 1;
                continue;
            }
            // Key: everything up to the next unescaped quote.
            let key_start = i + 1;
            let mut j = key_start;
            let mut closed = false;
            while j < bytes.len() {
                match bytes[j] {
                    b'\\' => j += 2,
                    b'"' => {
                        closed = true;
                        break;
                    }
                    _ => j += 1,
                }
            }
            if !closed {
                // Unterminated quote: nothing left to parse.
                break;
            }
            let token = &content[key_start..j];
            i = j + 1;

            // ": <integer>" with optional sign and whitespace.
            let mut k = i;
            while k < bytes.len() && (bytes[k] as char).is_whitespace() {
                k += 1;
            }
            if k >= bytes.len() || bytes[k] != b':' {
                continue;
            }
            k += 1;
            while k < bytes.len() && (bytes[k] as char).is_whitespace() {
                k += 1;
            }
            let num_start = k;
            if k < bytes.len() && bytes[k] == b'-' {
                k += 1;
            }
            let digits_start = k;
            while k < bytes.len() && bytes[k].is_ascii_digit() {
                k += 1;
            }
            if k == digits_start {
                continue;
            }
            if let Ok(id) = content[num_start..k].parse::<i64>() {
                map.insert(id, token.to_string());
            }
            i = k;
        }
        Self { map }
    }

    pub fn get(&self, id: i64) -> Option<&str> {
        self.map.get(&id).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Renders a generated sequence (BOS already stripped) as text. Stops at
    /// the first EOS id; ids absent from the vocabulary render as `<id>` so
    /// the output stays auditable.
    pub fn detokenize(&self, ids: &[i64], eos_id: i64) -> String {
        let mut words = Vec::new();
        for &id in ids {
            if id == eos_id {
                break;
            }
            match self.get(id) {
                Some(tok) => words.push(tok.to_string()),
                None => words.push(format!("<{id}>")),
            }
        }
        words.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_simple_object() {
        let v = Vocabulary::parse(r#"{"hello": 101, "world": -5}"#);
        assert_eq!(v.len(), 2);
        assert_eq!(v.get(101), Some("hello"));
        assert_eq!(v.get(-5), Some("world"));
    }

    #[test]
    fn skips_malformed_entries() {
        // Second entry is missing its value; third still parses.
        let v = Vocabulary::parse(r#""a": 1, "broken": , "b": 2"#);
        assert_eq!(v.get(1), Some("a"));
        assert_eq!(v.get(2), Some("b"));
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn ignores_pairs_without_colon() {
        let v = Vocabulary::parse(r#""stray" "a": 7"#);
        assert_eq!(v.get(7), Some("a"));
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn unterminated_quote_ends_scan() {
        let v = Vocabulary::parse(r#""a": 1, "unclosed: 9"#);
        assert_eq!(v.get(1), Some("a"));
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn missing_file_is_empty() {
        let v = Vocabulary::load(Path::new("/nonexistent/vocab.json"));
        assert!(v.is_empty());
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"cat": 3, "dog": 4}}"#).unwrap();
        let v = Vocabulary::load(file.path());
        assert_eq!(v.get(3), Some("cat"));
        assert_eq!(v.get(4), Some("dog"));
    }

    #[test]
    fn detokenize_renders_unknown_ids() {
        let v = Vocabulary::parse(r#"{"a": 7, "b": 3}"#);
        assert_eq!(v.detokenize(&[7, 9999, 3], 50256), "a <9999> b");
    }

    #[test]
    fn detokenize_stops_at_eos() {
        let v = Vocabulary::parse(r#"{"a": 7, "b": 3}"#);
        assert_eq!(v.detokenize(&[7, 50256, 3], 50256), "a");
        assert_eq!(v.detokenize(&[50256], 50256), "");
    }
}
