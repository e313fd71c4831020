//! Tagged TSV reader/writer and the in-memory tabular dataset

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::Sentence;

/// Parse tagged sentences from any buffered reader
///
/// Lines are trimmed. A blank line closes the current sentence; runs of
/// blank lines never produce empty sentences. Lines that do not split into
/// exactly `token<TAB>tag` are skipped.
pub fn parse_conll<R: BufRead>(reader: R) -> Result<Vec<Sentence>> {
    let mut sentences = Vec::new();
    let mut tokens = Vec::new();
    let mut tags = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", line_num + 1))?;
        let line = line.trim();

        if line.is_empty() {
            if !tokens.is_empty() {
                sentences.push(Sentence {
                    tokens: std::mem::take(&mut tokens),
                    ner_tags: std::mem::take(&mut tags),
                });
            }
            continue;
        }

        let parts: Vec<&str> = line.split('\t').collect();
        match parts.as_slice() {
            [token, tag] => {
                tokens.push(token.to_string());
                tags.push(tag.to_string());
            }
            _ => {
                tracing::debug!(
                    "Skipping malformed line {} ({} fields): {:?}",
                    line_num + 1,
                    parts.len(),
                    line
                );
            }
        }
    }

    // File may not end with a blank line
    if !tokens.is_empty() {
        sentences.push(Sentence {
            tokens,
            ner_tags: tags,
        });
    }

    Ok(sentences)
}

/// Read a tagged TSV file
pub fn read_conll_file(path: impl AsRef<Path>) -> Result<Vec<Sentence>> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("Failed to open tagged file: {:?}", path))?;
    let sentences = parse_conll(BufReader::new(file))
        .with_context(|| format!("Failed to parse tagged file: {:?}", path))?;

    tracing::info!("Read {} sentences from {:?}", sentences.len(), path);
    Ok(sentences)
}

/// Serialize sentences in the tagged format
pub fn format_conll<W: Write>(writer: &mut W, sentences: &[Sentence]) -> Result<()> {
    for sentence in sentences {
        sentence.validate()?;
        for (token, tag) in sentence.pairs() {
            writeln!(writer, "{}\t{}", token, tag)?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

/// Write sentences to `{dir}/{name}.tsv`, returning the written path
pub fn write_conll_file(
    dir: impl AsRef<Path>,
    sentences: &[Sentence],
    name: &str,
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {:?}", dir))?;

    let path = dir.join(format!("{}.tsv", name));
    let file =
        File::create(&path).with_context(|| format!("Failed to create file: {:?}", path))?;
    let mut writer = BufWriter::new(file);
    format_conll(&mut writer, sentences)?;
    writer.flush()?;

    tracing::info!("Wrote {} sentences to {:?}", sentences.len(), path);
    Ok(path)
}

/// Sentences addressed by index, with `tokens` and `ner_tags` columns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaggedDataset {
    rows: Vec<Sentence>,
}

impl TaggedDataset {
    /// Create a dataset from sentences
    pub fn from_sentences(rows: Vec<Sentence>) -> Self {
        Self { rows }
    }

    /// Load a dataset from a tagged TSV file
    pub fn from_conll_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_sentences(read_conll_file(path)?))
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Get a row by index
    pub fn get(&self, idx: usize) -> Option<&Sentence> {
        self.rows.get(idx)
    }

    /// All rows
    pub fn sentences(&self) -> &[Sentence] {
        &self.rows
    }

    /// The `tokens` column
    pub fn tokens(&self) -> Vec<&[String]> {
        self.rows.iter().map(|s| s.tokens.as_slice()).collect()
    }

    /// The `ner_tags` column
    pub fn ner_tags(&self) -> Vec<&[String]> {
        self.rows.iter().map(|s| s.ner_tags.as_slice()).collect()
    }

    /// Build a new dataset from the given rows, in the given order
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        let rows = indices
            .iter()
            .map(|&idx| {
                self.rows.get(idx).cloned().ok_or_else(|| {
                    anyhow::anyhow!("Index {} out of range for dataset of {} rows", idx, self.len())
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rows })
    }

    /// Sorted, de-duplicated tag set
    pub fn label_set(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .rows
            .iter()
            .flat_map(|s| s.ner_tags.iter().cloned())
            .collect();
        labels.sort();
        labels.dedup();
        labels
    }

    /// Write to `{dir}/{name}.tsv`
    pub fn write_conll(&self, dir: impl AsRef<Path>, name: &str) -> Result<PathBuf> {
        write_conll_file(dir, &self.rows, name)
    }

    /// Export one JSON object per row
    pub fn to_jsonl(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file =
            File::create(path).with_context(|| format!("Failed to create file: {:?}", path))?;
        let mut writer = BufWriter::new(file);
        for row in &self.rows {
            serde_json::to_writer(&mut writer, row)?;
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Load rows written by [`TaggedDataset::to_jsonl`]
    pub fn from_jsonl(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open dataset file: {:?}", path))?;

        let mut rows = Vec::new();
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read line {}", line_num + 1))?;
            if line.trim().is_empty() {
                continue;
            }
            let row: Sentence = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse JSON at line {}", line_num + 1))?;
            row.validate()
                .with_context(|| format!("Invalid row at line {}", line_num + 1))?;
            rows.push(row);
        }

        Ok(Self { rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Mario\tB-PER\nRossi\tI-PER\nvive\tO\n\nRoma\tB-LOC\n\n\n\nciao\tO\n";

    fn sentence(pairs: &[(&str, &str)]) -> Sentence {
        Sentence {
            tokens: pairs.iter().map(|(t, _)| t.to_string()).collect(),
            ner_tags: pairs.iter().map(|(_, g)| g.to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_groups_on_blank_lines() {
        let sentences = parse_conll(SAMPLE.as_bytes()).unwrap();

        // Trailing sentence without a blank line still counts; repeated blanks do not
        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[0].tokens, vec!["Mario", "Rossi", "vive"]);
        assert_eq!(sentences[0].ner_tags, vec!["B-PER", "I-PER", "O"]);
        assert_eq!(sentences[2].tokens, vec!["ciao"]);
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let input = "a\tO\nbroken line\nb\tB-ORG\textra\nc\tB-LOC\n";
        let sentences = parse_conll(input.as_bytes()).unwrap();

        assert_eq!(sentences.len(), 1);
        assert_eq!(sentences[0].tokens, vec!["a", "c"]);
        assert_eq!(sentences[0].ner_tags, vec!["O", "B-LOC"]);
    }

    #[test]
    fn test_parse_trims_whitespace_lines() {
        let input = "  a\tO  \n   \n\r\nb\tO\r\n";
        let sentences = parse_conll(input.as_bytes()).unwrap();
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0].tokens, vec!["a"]);
        assert_eq!(sentences[1].tokens, vec!["b"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(parse_conll("".as_bytes()).unwrap().is_empty());
        assert!(parse_conll("\n\n".as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn test_write_then_read() {
        let temp_dir = tempfile::tempdir().unwrap();
        let sentences = vec![
            sentence(&[("Mario", "B-PER"), ("Rossi", "I-PER")]),
            sentence(&[("a", "O"), ("Milano", "B-LOC"), (".", "O")]),
        ];

        let path = write_conll_file(temp_dir.path(), &sentences, "val").unwrap();
        assert_eq!(path, temp_dir.path().join("val.tsv"));

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "Mario\tB-PER\nRossi\tI-PER\n\na\tO\nMilano\tB-LOC\n.\tO\n\n");

        let loaded = read_conll_file(&path).unwrap();
        assert_eq!(loaded, sentences);
    }

    #[test]
    fn test_write_rejects_mismatched_sentence() {
        let temp_dir = tempfile::tempdir().unwrap();
        let bad = Sentence {
            tokens: vec!["a".to_string()],
            ner_tags: vec![],
        };
        assert!(write_conll_file(temp_dir.path(), &[bad], "bad").is_err());
    }

    #[test]
    fn test_read_missing_file() {
        let result = read_conll_file("/nonexistent/train.tsv");
        assert!(result.is_err_and(|e| e.to_string().contains("Failed to open")));
    }

    #[test]
    fn test_dataset_select_and_columns() {
        let dataset = TaggedDataset::from_sentences(parse_conll(SAMPLE.as_bytes()).unwrap());

        let selected = dataset.select(&[2, 0]).unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected.tokens()[0], &["ciao".to_string()][..]);
        assert_eq!(selected.ner_tags()[1][0], "B-PER");

        assert!(dataset.select(&[3]).is_err());
        assert_eq!(dataset.label_set(), vec!["B-LOC", "B-PER", "I-PER", "O"]);
    }

    #[test]
    fn test_jsonl_export() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.jsonl");
        let dataset = TaggedDataset::from_sentences(parse_conll(SAMPLE.as_bytes()).unwrap());

        dataset.to_jsonl(&path).unwrap();
        let first_line = fs::read_to_string(&path)
            .unwrap()
            .lines()
            .next()
            .unwrap()
            .to_string();
        assert_eq!(
            first_line,
            r#"{"tokens":["Mario","Rossi","vive"],"ner_tags":["B-PER","I-PER","O"]}"#
        );

        let loaded = TaggedDataset::from_jsonl(&path).unwrap();
        assert_eq!(loaded, dataset);
    }
}
