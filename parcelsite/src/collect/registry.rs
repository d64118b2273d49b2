use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info};

use crate::commons::basic_functions::value_as_text;
use crate::commons::filter::Expr;
use crate::error::Error;

/// Rows kept from both company datasets
pub const DEFAULT_REGISTRY_FILTER: &str =
    "County != 'SURREY' & District in ['EAST SUFFOLK', 'SOUTH NORFOLK']";

/// Columns joined onto the parcels
pub const DEFAULT_REGISTRY_FIELDS: &[&str] = &[
    "Title Number",
    "Tenure",
    "Proprietor Name (1)",
    "Proprietor Name (2)",
    "Proprietor Name (3)",
    "Proprietor Name (4)",
];

/// Column prefix of the UK companies dataset (CCOD)
pub const DOMESTIC_PREFIX: &str = "dom_";
/// Column prefix of the overseas companies dataset (OCOD)
pub const FOREIGN_PREFIX: &str = "for_";

/// Row filter and column selection applied while an extract is streamed, so
/// rejected records are never turned into rows
#[derive(Debug, Clone, Default)]
pub struct RegistryScan {
    pub filter: Option<Expr>,
    /// Columns to keep, in order; every column when None
    pub fields: Option<Vec<String>>,
}

/// Land Registry company ownership extract (CCOD or OCOD) as a table of text cells
#[derive(Debug, Clone)]
pub struct CompanyRegistry {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

impl CompanyRegistry {
    /// Load a comma separated extract with a header row.
    /// `encoding` is a WHATWG label (`utf-8`, `latin1`, ...), UTF-8 when None.
    /// Empty cells become null.
    pub fn read<P: AsRef<Path>>(path: P, encoding: Option<&str>) -> Result<Self> {
        Self::read_with(path, encoding, &RegistryScan::default())
    }

    /// [`CompanyRegistry::read`] keeping only the records matching `scan.filter`
    pub fn read_with<P: AsRef<Path>>(
        path: P,
        encoding: Option<&str>,
        scan: &RegistryScan,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;

        let mut buffer = Vec::new();
        BufReader::new(file)
            .read_to_end(&mut buffer)
            .with_context(|| format!("Failed to read CSV file: {}", path.display()))?;

        let label = encoding.unwrap_or("utf-8");
        let encoding = encoding_rs::Encoding::for_label(label.as_bytes())
            .with_context(|| format!("Unknown text encoding: {}", label))?;
        let (decoded, _, had_errors) = encoding.decode(&buffer);
        if had_errors {
            debug!("{} contains bytes invalid for {}", path.display(), encoding.name());
        }

        let registry = Self::from_csv_str_with(&decoded, scan)
            .with_context(|| format!("Failed to parse CSV file: {}", path.display()))?;
        info!("Read {} registry rows from {}", registry.len(), path.display());
        Ok(registry)
    }

    pub fn from_csv_str(text: &str) -> Result<Self> {
        Self::from_csv_str_with(text, &RegistryScan::default())
    }

    pub fn from_csv_str_with(text: &str, scan: &RegistryScan) -> Result<Self> {
        let mut rdr = ReaderBuilder::new()
            .delimiter(b',')
            .has_headers(true)
            .from_reader(text.as_bytes());

        let header: Vec<String> = rdr
            .headers()
            .context("Failed to read CSV header")?
            .iter()
            .map(str::to_string)
            .collect();
        let position = |name: &str| header.iter().position(|c| c == name);

        let selected: Vec<(usize, String)> = match &scan.fields {
            Some(fields) => fields
                .iter()
                .map(|f| {
                    position(f)
                        .map(|idx| (idx, f.clone()))
                        .ok_or_else(|| Error::MissingColumn(f.clone()))
                })
                .collect::<Result<_, Error>>()?,
            None => header.iter().cloned().enumerate().collect(),
        };

        // Only the filtered columns are materialized before the filter runs.
        // Columns absent from the header are missing, which reads as null
        let filter_cells: Vec<(usize, String)> = scan
            .filter
            .as_ref()
            .map(|expr| {
                expr.columns()
                    .into_iter()
                    .filter_map(|c| position(c).map(|idx| (idx, c.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let mut cells: Map<String, Value> = filter_cells
            .iter()
            .map(|(_, c)| (c.clone(), Value::Null))
            .collect();

        let mut record = StringRecord::new();
        let mut scanned = 0usize;
        let mut rows = Vec::new();
        while rdr
            .read_record(&mut record)
            .with_context(|| format!("Failed to read CSV record {}", scanned + 1))?
        {
            scanned += 1;
            if let Some(expr) = &scan.filter {
                for (idx, column) in &filter_cells {
                    if let Some(slot) = cells.get_mut(column) {
                        *slot = cell_value(record.get(*idx));
                    }
                }
                if !expr.eval(&cells) {
                    continue;
                }
            }
            let row: Map<String, Value> = selected
                .iter()
                .map(|(idx, column)| (column.clone(), cell_value(record.get(*idx))))
                .collect();
            rows.push(row);
        }
        if scan.filter.is_some() {
            debug!("Registry filter kept {} of {} records", rows.len(), scanned);
        }

        Ok(CompanyRegistry {
            columns: selected.into_iter().map(|(_, c)| c).collect(),
            rows,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn filter(&mut self, expr: &Expr) {
        let before = self.rows.len();
        self.rows.retain(|row| expr.eval(row));
        debug!("Registry filter kept {} of {} rows", self.rows.len(), before);
    }

    pub fn filter_str(&mut self, expr: &str) -> Result<()> {
        let expr = Expr::parse(expr).with_context(|| format!("Invalid registry filter: {}", expr))?;
        self.filter(&expr);
        Ok(())
    }

    /// Keep only the given columns, in the given order
    pub fn select<S: AsRef<str>>(&mut self, fields: &[S]) -> Result<(), Error> {
        for field in fields {
            if !self.columns.iter().any(|c| c == field.as_ref()) {
                return Err(Error::MissingColumn(field.as_ref().to_string()));
            }
        }

        for row in &mut self.rows {
            let mut selected = Map::with_capacity(fields.len());
            for field in fields {
                let value = row.remove(field.as_ref()).unwrap_or(Value::Null);
                selected.insert(field.as_ref().to_string(), value);
            }
            *row = selected;
        }
        self.columns = fields.iter().map(|f| f.as_ref().to_string()).collect();
        Ok(())
    }

    pub fn add_prefix(&mut self, prefix: &str) {
        for row in &mut self.rows {
            *row = std::mem::take(row)
                .into_iter()
                .map(|(k, v)| (format!("{}{}", prefix, k), v))
                .collect();
        }
        self.columns = self
            .columns
            .iter()
            .map(|c| format!("{}{}", prefix, c))
            .collect();
    }

    /// Rows keyed by `column` for a many-to-one join. Null keys never match.
    pub fn index_by(&self, column: &str) -> Result<HashMap<String, &Map<String, Value>>, Error> {
        if !self.columns.iter().any(|c| c == column) {
            return Err(Error::MissingColumn(column.to_string()));
        }

        let mut index = HashMap::with_capacity(self.rows.len());
        for row in &self.rows {
            let key = match row.get(column) {
                None | Some(Value::Null) => continue,
                Some(v) => value_as_text(v),
            };
            if index.insert(key.clone(), row).is_some() {
                return Err(Error::DuplicateKey {
                    column: column.to_string(),
                    key,
                });
            }
        }
        Ok(index)
    }
}

fn cell_value(cell: Option<&str>) -> Value {
    match cell {
        Some(c) if !c.is_empty() => Value::String(c.to_string()),
        _ => Value::Null,
    }
}
