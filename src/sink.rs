//! Result persistence

use std::fs;
use std::path::PathBuf;

use chrono::Local;
use serde_json::Value;
use tracing::info;

use crate::error::ProbeError;

/// A finished record that can be written out
pub trait Exportable {
    /// Structured form, one JSON object per record
    fn record(&self) -> Value;

    fn csv_header() -> &'static [&'static str];

    /// Flattened form, one row per leaf item
    fn csv_rows(&self) -> Vec<Vec<String>>;
}

/// Persists a finished batch
pub trait ResultSink {
    /// Returns the paths written
    fn persist<R: Exportable>(&self, results: &[R]) -> Result<Vec<PathBuf>, ProbeError>;
}

/// Writes `<stem>_<timestamp>.json` and `<stem>_<timestamp>.csv` into a directory
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
    stem: String,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
        }
    }
}

impl ResultSink for FileSink {
    fn persist<R: Exportable>(&self, results: &[R]) -> Result<Vec<PathBuf>, ProbeError> {
        fs::create_dir_all(&self.dir)?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S");

        let json_path = self.dir.join(format!("{}_{stamp}.json", self.stem));
        let records: Vec<Value> = results.iter().map(Exportable::record).collect();
        fs::write(&json_path, serde_json::to_string_pretty(&records)?)?;

        let csv_path = self.dir.join(format!("{}_{stamp}.csv", self.stem));
        fs::write(&csv_path, to_csv(R::csv_header(), results))?;

        info!(
            records = results.len(),
            json = %json_path.display(),
            csv = %csv_path.display(),
            "Results written"
        );
        Ok(vec![json_path, csv_path])
    }
}

fn to_csv<R: Exportable>(header: &[&str], results: &[R]) -> String {
    let mut out = csv_line(header.iter().copied());
    for row in results.iter().flat_map(Exportable::csv_rows) {
        out.push_str(&csv_line(row.iter().map(String::as_str)));
    }
    out
}

fn csv_line<'a>(fields: impl Iterator<Item = &'a str>) -> String {
    let mut line = fields.map(csv_field).collect::<Vec<_>>().join(",");
    line.push('\n');
    line
}

/// Quote a field containing a separator, quote or line break
fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Row(&'static str, &'static str);

    impl Exportable for Row {
        fn record(&self) -> Value {
            json!({"name": self.0, "note": self.1})
        }

        fn csv_header() -> &'static [&'static str] {
            &["name", "note"]
        }

        fn csv_rows(&self) -> Vec<Vec<String>> {
            vec![vec![self.0.to_owned(), self.1.to_owned()]]
        }
    }

    #[test]
    fn test_csv_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn test_persist_writes_both_forms() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("out"), "sites");
        let paths = sink
            .persist(&[Row("shop.com", "ok"), Row("store.io", "blocked, captcha")])
            .unwrap();

        assert_eq!(paths.len(), 2);
        let json_name = paths[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(json_name.starts_with("sites_"));
        assert!(json_name.ends_with(".json"));
        // sites_YYYYmmdd_HHMMSS.json
        assert_eq!(json_name.len(), "sites_".len() + 15 + ".json".len());

        let records: Vec<Value> = serde_json::from_str(&fs::read_to_string(&paths[0]).unwrap()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["note"], "blocked, captcha");

        let csv = fs::read_to_string(&paths[1]).unwrap();
        assert_eq!(csv, "name,note\nshop.com,ok\nstore.io,\"blocked, captcha\"\n");
    }

    #[test]
    fn test_empty_batch_writes_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let paths = FileSink::new(dir.path(), "venues").persist::<Row>(&[]).unwrap();
        assert_eq!(fs::read_to_string(&paths[0]).unwrap().trim(), "[]");
        assert_eq!(fs::read_to_string(&paths[1]).unwrap(), "name,note\n");
    }
}
