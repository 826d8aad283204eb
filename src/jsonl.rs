use crate::models::Record;
use std::fs::{ self, File };
use std::io::{ self, BufRead, BufReader, BufWriter, Lines, Write };
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("malformed record at line {line}: {reason}")] Malformed {
        line: usize,
        reason: String,
    },
    #[error("failed to read input at line {line}: {source}")] Read {
        line: usize,
        #[source]
        source: io::Error,
    },
}

impl RecordError {
    pub fn line(&self) -> usize {
        match self {
            RecordError::Malformed { line, .. } | RecordError::Read { line, .. } => *line,
        }
    }
}

pub fn parse_line(line_no: usize, line: &str) -> Result<Record, RecordError> {
    let record: Record = serde_json::from_str(line).map_err(|e| RecordError::Malformed {
        line: line_no,
        reason: e.to_string(),
    })?;
    record.validate().map_err(|reason| RecordError::Malformed { line: line_no, reason })?;
    Ok(record)
}

/// Lazily yields records in file order. Blank lines are skipped; any other
/// line that does not hold a valid record is reported with its 1-based number.
pub struct RecordReader<R> {
    lines: Lines<R>,
    line_no: usize,
}

impl RecordReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { lines: inner.lines(), line_no: 0 }
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<Record, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            self.line_no += 1;
            let line = match line {
                Ok(line) => line,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    return Some(
                        Err(RecordError::Malformed {
                            line: self.line_no,
                            reason: "line is not valid UTF-8".to_string(),
                        })
                    );
                }
                Err(e) => {
                    return Some(Err(RecordError::Read { line: self.line_no, source: e }));
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(parse_line(self.line_no, &line));
        }
    }
}

/// Writes one compact JSON object per line and flushes after every record.
pub struct RecordWriter<W: Write> {
    inner: W,
}

impl RecordWriter<BufWriter<File>> {
    /// Creates or truncates `path`, creating missing parent directories.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write(&mut self, record: &Record) -> io::Result<()> {
        serde_json::to_writer(&mut self.inner, record)?;
        self.inner.write_all(b"\n")?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn read_all(input: &str) -> Vec<Result<Record, RecordError>> {
        RecordReader::new(Cursor::new(input.to_string())).collect()
    }

    #[test]
    fn reads_records_in_order() {
        let input =
            "{\"id\":1,\"role\":[\"user\"],\"text\":[\"a\"]}\n{\"id\":2,\"role\":[\"user\"],\"text\":[\"b\"]}\n";
        let ids: Vec<i64> = read_all(input)
            .into_iter()
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn reports_invalid_json_with_line_number() {
        let input = [
            r#"{"id":1,"role":["user"],"text":["a"]}"#,
            r#"{"id":2,"role":["user"],"text":["b"]}"#,
            r#"{"id":3,"role":["user"],"text":["c"]"#,
            r#"{"id":4,"role":["user"],"text":["d"]}"#,
            r#"{"id":5,"role":["user"],"text":["e"]}"#,
        ].join("\n");
        let results = read_all(&input);
        assert_eq!(results.len(), 5);
        match &results[2] {
            Err(RecordError::Malformed { line, .. }) => assert_eq!(*line, 3),
            other => panic!("expected malformed line 3, got {:?}", other),
        }
    }

    #[test]
    fn missing_field_is_malformed() {
        let results = read_all(r#"{"id":1,"role":["user"]}"#);
        let err = results.into_iter().next().unwrap().unwrap_err();
        assert_eq!(err.line(), 1);
        assert!(err.to_string().contains("text"));
    }

    #[test]
    fn wrong_types_are_malformed() {
        assert!(read_all(r#"{"id":"one","role":["user"],"text":["a"]}"#)[0].is_err());
        assert!(read_all(r#"{"id":1,"role":"user","text":["a"]}"#)[0].is_err());
        assert!(read_all(r#"[1,["user"],["a"]]"#)[0].is_err());
    }

    #[test]
    fn mismatched_lengths_are_malformed() {
        let err = read_all(r#"{"id":1,"role":["user","m"],"text":["a"]}"#)
            .remove(0)
            .unwrap_err();
        assert!(matches!(err, RecordError::Malformed { line: 1, .. }));
    }

    #[test]
    fn blank_lines_are_skipped_but_counted() {
        let input = "\n{\"id\":1,\"role\":[\"user\"],\"text\":[\"a\"]}\n   \nnot json\n";
        let results = read_all(input);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().id, 1);
        assert_eq!(results[1].as_ref().unwrap_err().line(), 4);
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let bytes = b"{\"id\":1,\"role\":[\"user\"],\"text\":[\"\xff\"]}\n".to_vec();
        let results: Vec<_> = RecordReader::new(Cursor::new(bytes)).collect();
        assert!(matches!(results[0], Err(RecordError::Malformed { line: 1, .. })));
    }

    #[test]
    fn writer_emits_one_compact_line_per_record() {
        let mut writer = RecordWriter::new(Vec::new());
        let mut record = Record::new(1, "user", "こんにちは");
        writer.write(&record).unwrap();
        record.push_turn("m1", "hi");
        writer.write(&record).unwrap();

        let out = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"id":1,"role":["user"],"text":["こんにちは"]}"#);
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn create_truncates_and_makes_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/out/result.jsonl");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "old content\nmore old content\n").unwrap();

        let mut writer = RecordWriter::create(&path).unwrap();
        writer.write(&Record::new(7, "user", "fresh")).unwrap();

        // flushed already, no drop needed
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"id\":7,\"role\":[\"user\"],\"text\":[\"fresh\"]}\n");

        let other = dir.path().join("a/b/c.jsonl");
        RecordWriter::create(&other).unwrap();
        assert!(other.exists());
    }

    #[test]
    fn reopening_restarts_the_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        fs::write(&path, "{\"id\":1,\"role\":[\"user\"],\"text\":[\"a\"]}\n").unwrap();

        let first: Vec<_> = RecordReader::open(&path).unwrap().collect();
        let second: Vec<_> = RecordReader::open(&path).unwrap().collect();
        assert_eq!(first.len(), 1);
        assert_eq!(second[0].as_ref().unwrap().id, 1);
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempdir().unwrap();
        assert!(RecordReader::open(dir.path().join("nope.jsonl")).is_err());
    }
}
