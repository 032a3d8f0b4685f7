use anyhow::Result;

/// Supported recipient source formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Csv,
    Tsv,
}

impl Format {
    /// Parse format from string (case-insensitive)
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(Format::Csv),
            "tsv" => Ok(Format::Tsv),
            _ => Err(anyhow::anyhow!(
                "Unsupported format: {}. Supported formats: csv, tsv",
                s
            )),
        }
    }

    /// Auto-detect format from a file path extension
    pub fn detect_from_path(path: &str) -> Option<Self> {
        let lower = path.to_lowercase();

        if lower.ends_with(".csv") {
            Some(Format::Csv)
        } else if lower.ends_with(".tsv") {
            Some(Format::Tsv)
        } else {
            None
        }
    }

    pub fn delimited_config(self) -> DelimitedConfig {
        match self {
            Format::Csv => DelimitedConfig::csv(),
            Format::Tsv => DelimitedConfig::tsv(),
        }
    }
}

/// Configuration for delimited file reading (CSV, TSV)
///
/// Recipient sources always carry a header row: the phone column and every
/// template attribute are addressed by name.
#[derive(Debug, Clone)]
pub struct DelimitedConfig {
    pub delimiter: u8,
    pub quote: u8,
}

impl Default for DelimitedConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote: b'"',
        }
    }
}

impl DelimitedConfig {
    pub fn csv() -> Self {
        Self::default()
    }

    pub fn tsv() -> Self {
        Self {
            delimiter: b'\t',
            quote: b'"',
        }
    }

    /// Create from string representations (`\t` is accepted for tab)
    pub fn from_strings(delimiter: &str, quote: &str) -> Result<Self> {
        let delimiter_byte = if delimiter == "\\t" {
            b'\t'
        } else if delimiter.len() == 1 {
            delimiter.as_bytes()[0]
        } else {
            anyhow::bail!("Delimiter must be a single character or \\t");
        };

        let quote_byte = if quote.len() == 1 {
            quote.as_bytes()[0]
        } else {
            anyhow::bail!("Quote must be a single character");
        };

        Ok(Self {
            delimiter: delimiter_byte,
            quote: quote_byte,
        })
    }

    pub(crate) fn reader_builder(&self) -> csv::ReaderBuilder {
        let mut builder = csv::ReaderBuilder::new();
        builder
            .delimiter(self.delimiter)
            .quote(self.quote)
            .has_headers(true)
            .trim(csv::Trim::Headers);
        builder
    }
}
