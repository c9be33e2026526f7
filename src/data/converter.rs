//! CSV review export to instruction JSON

use anyhow::{Context, Result};
use std::path::Path;

use super::{InstructionRecord, ReviewRecord};

/// Cell values read as missing, matching pandas' default `na_values`
pub const NA_VALUES: [&str; 19] = [
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// Converter configuration
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    /// Header of the review text column
    pub text_column: String,
    /// Header of the rating column
    pub rating_column: String,
    /// Ratings at or above this value are labelled positive
    pub positive_threshold: f64,
    /// Hard cap on emitted records (first N survivors, not a sample)
    pub max_records: usize,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            text_column: "Review Text".to_string(),
            rating_column: "Rating".to_string(),
            positive_threshold: 4.0,
            max_records: 500,
        }
    }
}

impl ConverterConfig {
    /// Set the record cap
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }

    /// Set the positive threshold
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.positive_threshold = threshold;
        self
    }
}

/// Counters from one conversion run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionStats {
    /// CSV rows read before the cap was reached
    pub rows_read: usize,
    /// Rows skipped because the review text was empty
    pub rows_dropped: usize,
    /// Records kept
    pub records_written: usize,
    pub positive: usize,
    pub negative: usize,
}

impl std::fmt::Display for ConversionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} rows read, {} dropped, {} records ({} positive / {} negative)",
            self.rows_read, self.rows_dropped, self.records_written, self.positive, self.negative
        )
    }
}

/// Converts review CSVs into instruction records
#[derive(Debug, Clone, Default)]
pub struct DatasetConverter {
    config: ConverterConfig,
}

impl DatasetConverter {
    pub fn new(config: ConverterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// Read a CSV file and build instruction records in source order
    pub fn convert_csv(&self, path: impl AsRef<Path>) -> Result<Vec<InstructionRecord>> {
        let path = path.as_ref();
        let (records, stats) = self.convert_reader(open_reader(path)?)?;
        tracing::info!("Converted {:?}: {}", path, stats);
        Ok(records)
    }

    /// Convert a CSV file and write the records as a JSON array
    pub fn convert_file(
        &self,
        csv_path: impl AsRef<Path>,
        json_path: impl AsRef<Path>,
    ) -> Result<ConversionStats> {
        let csv_path = csv_path.as_ref();
        let (records, stats) = self.convert_reader(open_reader(csv_path)?)?;
        save_json(&records, json_path.as_ref())?;

        tracing::info!(
            "Converted {:?} -> {:?}: {}",
            csv_path,
            json_path.as_ref(),
            stats
        );
        Ok(stats)
    }

    fn convert_reader<R: std::io::Read>(
        &self,
        mut reader: csv::Reader<R>,
    ) -> Result<(Vec<InstructionRecord>, ConversionStats)> {
        let headers = reader.headers().context("Failed to read CSV headers")?.clone();
        let text_idx = column_index(&headers, &self.config.text_column)?;
        let rating_idx = column_index(&headers, &self.config.rating_column)?;

        let mut records = Vec::new();
        let mut stats = ConversionStats::default();

        for (row_num, result) in reader.records().enumerate() {
            if records.len() >= self.config.max_records {
                break;
            }

            // Header is line 1
            let row = result.with_context(|| format!("Failed to read CSV row {}", row_num + 2))?;
            stats.rows_read += 1;

            let review = parse_review(&row, text_idx, rating_idx)
                .with_context(|| format!("Invalid CSV row {}", row_num + 2))?;

            match InstructionRecord::from_review(&review, self.config.positive_threshold) {
                Some(record) => {
                    if record.output == "positive" {
                        stats.positive += 1;
                    } else {
                        stats.negative += 1;
                    }
                    records.push(record);
                }
                None => stats.rows_dropped += 1,
            }
        }

        stats.records_written = records.len();
        Ok((records, stats))
    }
}

fn open_reader(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV file: {:?}", path))
}

fn is_na(value: &str) -> bool {
    NA_VALUES.contains(&value)
}

fn column_index(headers: &csv::StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .ok_or_else(|| anyhow::anyhow!("CSV must have '{}' column", name))
}

fn parse_review(row: &csv::StringRecord, text_idx: usize, rating_idx: usize) -> Result<ReviewRecord> {
    let review_text = row
        .get(text_idx)
        .filter(|t| !is_na(t))
        .map(|t| t.to_string());

    let rating = match row.get(rating_idx).map(str::trim) {
        None => None,
        Some(raw) if is_na(raw) => None,
        Some(raw) => Some(
            raw.parse::<f64>()
                .with_context(|| format!("Rating is not numeric: {:?}", raw))?,
        ),
    };

    Ok(ReviewRecord {
        review_text,
        rating,
    })
}

/// Write records as a pretty-printed (2-space) JSON array
pub fn save_json(records: &[InstructionRecord], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    let json = serde_json::to_string_pretty(records)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

/// Read records written by [`save_json`]
pub fn load_json(path: impl AsRef<Path>) -> Result<Vec<InstructionRecord>> {
    let path = path.as_ref();
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read file: {:?}", path))?;
    let records: Vec<InstructionRecord> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse instruction records: {:?}", path))?;

    tracing::info!("Loaded {} instruction records from {:?}", records.len(), path);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn csv_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn test_convert_scenarios() {
        let file = csv_file(
            ",Clothing ID,Review Text,Rating\n\
             0,767,\"Loved it, fits great!\",5\n\
             1,1080,\"Terrible quality, returned it\",1\n\
             2,1077,,3\n",
        );

        let records = DatasetConverter::default().convert_csv(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            InstructionRecord {
                instruction: "Classify the sentiment of this review: 'Loved it, fits great!'"
                    .to_string(),
                input: String::new(),
                output: "positive".to_string(),
            }
        );
        assert_eq!(records[1].output, "negative");
    }

    #[test]
    fn test_cap_is_truncation_in_order() {
        let mut content = String::from("Review Text,Rating\n");
        for i in 0..20 {
            if i % 4 == 0 {
                content.push_str(",5\n");
            } else {
                content.push_str(&format!("review {},{}\n", i, i % 5 + 1));
            }
        }
        let file = csv_file(&content);

        let converter = DatasetConverter::new(ConverterConfig::default().with_max_records(10));
        let records = converter.convert_csv(file.path()).unwrap();

        // 20 rows, 5 empty -> 15 survivors, capped at 10
        assert_eq!(records.len(), 10);
        assert_eq!(
            records[0].instruction,
            "Classify the sentiment of this review: 'review 1'"
        );
        assert_eq!(
            records[9].instruction,
            "Classify the sentiment of this review: 'review 13'"
        );
    }

    #[test]
    fn test_count_without_cap() {
        let file = csv_file("Review Text,Rating\na,5\n,2\nb,4\n,1\nc,3\n");
        let records = DatasetConverter::default().convert_csv(file.path()).unwrap();
        assert_eq!(records.len(), 3);
        let labels: Vec<_> = records.iter().map(|r| r.output.as_str()).collect();
        assert_eq!(labels, vec!["positive", "positive", "negative"]);
    }

    #[test]
    fn test_na_markers_are_missing() {
        let file = csv_file(
            "Review Text,Rating
             NA,5
             N/A,5
             nan,4
             #N/A,4
             na,5
             Nothing wrong,NULL
             runs big,n/a
             soft,NaN
",
        );
        let (records, stats) = DatasetConverter::default()
            .convert_reader(open_reader(file.path()).unwrap())
            .unwrap();

        // Only the lowercase "na" is a real review among the first five
        assert_eq!(stats.rows_read, 8);
        assert_eq!(stats.rows_dropped, 4);
        assert_eq!(
            records[0].instruction,
            "Classify the sentiment of this review: 'na'"
        );
        assert_eq!(records[0].output, "positive");

        // Missing ratings are never positive
        let labels: Vec<_> = records[1..].iter().map(|r| r.output.as_str()).collect();
        assert_eq!(labels, vec!["negative", "negative", "negative"]);
    }

    #[test]
    fn test_multiline_and_quoted_text() {
        let file = csv_file("Review Text,Rating\n\"Runs small.\nSays \"\"XL\"\" but isn't\",2\n");
        let records = DatasetConverter::default().convert_csv(file.path()).unwrap();
        assert_eq!(
            records[0].instruction,
            "Classify the sentiment of this review: 'Runs small.\nSays \"XL\" but isn't'"
        );
    }

    #[test]
    fn test_missing_column_is_error() {
        let file = csv_file("Text,Stars\nhello,5\n");
        let err = DatasetConverter::default()
            .convert_csv(file.path())
            .unwrap_err();
        assert!(err.to_string().contains("Review Text"));
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = DatasetConverter::default().convert_csv("/nonexistent/reviews.csv");
        assert!(result.is_err());
    }

    #[test]
    fn test_non_numeric_rating_is_error() {
        let file = csv_file("Review Text,Rating\nnice,five\n");
        assert!(DatasetConverter::default().convert_csv(file.path()).is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let dir = TempDir::new().unwrap();
        let json_path = dir.path().join("sentiment_instructions.json");
        let records = vec![
            InstructionRecord {
                instruction: "Classify the sentiment of this review: 'Tr\u{e8}s jolie \u{1f60d}'"
                    .to_string(),
                input: String::new(),
                output: "positive".to_string(),
            },
            InstructionRecord {
                instruction: "Classify the sentiment of this review: 'tab\there \"quoted\"'"
                    .to_string(),
                input: String::new(),
                output: "negative".to_string(),
            },
        ];

        save_json(&records, &json_path).unwrap();
        let loaded = load_json(&json_path).unwrap();
        assert_eq!(loaded, records);

        let raw = std::fs::read_to_string(&json_path).unwrap();
        assert!(raw.starts_with("[\n  {\n    \"instruction\""));
    }

    #[test]
    fn test_convert_file_stats() {
        let file = csv_file("Review Text,Rating\na,5\n,2\nb,1\n");
        let dir = TempDir::new().unwrap();
        let json_path = dir.path().join("out.json");

        let stats = DatasetConverter::default()
            .convert_file(file.path(), &json_path)
            .unwrap();

        assert_eq!(
            stats,
            ConversionStats {
                rows_read: 3,
                rows_dropped: 1,
                records_written: 2,
                positive: 1,
                negative: 1,
            }
        );
        assert_eq!(load_json(&json_path).unwrap().len(), 2);
    }
}
