//! Vocabulary loader for `tokens.txt`, sherpa-onnx style.
//!
//! Each line is `<token> <id>`, whitespace-separated, IDs monotonically
//! increasing from 0. Sub-word tokens may contain spaces themselves (BPE
//! `▁` markers), so splitting happens on the *last* whitespace run only.

use std::path::Path;

use crate::error::{NextalkError, Result};

/// An id-indexed vocabulary, loaded once at engine initialization.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    id_to_token: Vec<String>,
}

impl Vocabulary {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            NextalkError::ModelLoadFailed(format!("reading {}: {e}", path.display()))
        })?;

        let mut entries: Vec<(usize, String)> = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }
            let Some(split_at) = line.rfind(char::is_whitespace) else {
                return Err(NextalkError::ModelLoadFailed(format!(
                    "{}: line {} missing id column: {line:?}",
                    path.display(),
                    line_no + 1
                )));
            };
            let token = &line[..split_at];
            let id_str = line[split_at..].trim();
            let id: usize = id_str.parse().map_err(|_| {
                NextalkError::ModelLoadFailed(format!(
                    "{}: line {} has non-numeric id {id_str:?}",
                    path.display(),
                    line_no + 1
                ))
            })?;
            entries.push((id, token.to_string()));
        }

        if entries.is_empty() {
            return Err(NextalkError::ModelIncomplete {
                missing: vec!["tokens.txt".into()],
            });
        }

        entries.sort_by_key(|(id, _)| *id);
        let id_to_token: Vec<String> = entries.into_iter().map(|(_, tok)| tok).collect();

        Ok(Self { id_to_token })
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    pub fn token(&self, id: usize) -> Option<&str> {
        self.id_to_token.get(id).map(String::as_str)
    }

    /// Join a sequence of token ids into display text.
    ///
    /// BPE word-boundary markers (`▁`) become spaces; everything else is
    /// concatenated directly, matching the sherpa-onnx convention.
    pub fn decode(&self, ids: &[i64]) -> String {
        let mut out = String::new();
        for &id in ids {
            let Some(tok) = self.token(id as usize) else {
                continue;
            };
            if let Some(rest) = tok.strip_prefix('\u{2581}') {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(rest);
            } else {
                out.push_str(tok);
            }
        }
        out.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tokens(contents: &str) -> tempfile_path {
        let path = std::env::temp_dir().join(format!(
            "nextalk-tokens-test-{}-{:?}",
            std::process::id(),
            std::time::Instant::now()
        ));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        tempfile_path(path)
    }

    struct tempfile_path(std::path::PathBuf);
    impl Drop for tempfile_path {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn loads_and_sorts_by_id() {
        let f = write_tokens("b 1\na 0\n\u{2581}hello 2\n");
        let vocab = Vocabulary::load(&f.0).unwrap();
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.token(0), Some("a"));
        assert_eq!(vocab.token(1), Some("b"));
    }

    #[test]
    fn decode_joins_word_pieces_on_boundary_marker() {
        let f = write_tokens("\u{2581}hel 0\nlo 1\n\u{2581}world 2\n");
        let vocab = Vocabulary::load(&f.0).unwrap();
        assert_eq!(vocab.decode(&[0, 1, 2]), "hello world");
    }

    #[test]
    fn empty_file_is_incomplete_error() {
        let f = write_tokens("");
        let err = Vocabulary::load(&f.0).unwrap_err();
        assert!(matches!(err, NextalkError::ModelIncomplete { .. }));
    }
}
