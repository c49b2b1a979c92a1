use calamine::{open_workbook_auto, Data, Reader};
use csv_async::AsyncReaderBuilder;
use derive_more::{Display, Error};
use futures::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;

pub const REQUIRED_COLUMNS_MODERN: [&str; 8] = [
    "codigo",
    "id_categoria",
    "id_subcategoria",
    "Nome",
    "Quantidade",
    "Descricao",
    "Vlr Bruto",
    "Vlr Unitario",
];

pub const REQUIRED_COLUMNS_LEGACY: [&str; 9] = [
    "PRODUTO",
    "CATEGORIA",
    "SUBCATEGORIA",
    "DESCRIÇÃO",
    "REGIÃO",
    "PRAZO DE ENTREGA",
    "VALOR UNITÁRIO",
    "KIT",
    "OBSERVAÇÕES",
];

pub const KIT_COLUMN_MODERN: &str = "Codigo Amarração";
pub const ACTIVE_COLUMN_MODERN: &str = "ativo";

pub const IMAGE_COLUMNS: [&str; 6] = [
    "image_url",
    "image_urls",
    "imagem_url",
    "imagens_url",
    "url_imagem",
    "url_imagens",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SheetFormat {
    #[default]
    Auto,
    Delimited,
    Spreadsheet,
}

impl SheetFormat {
    /// Resolves `Auto` by file extension; `.csv` is delimited, the rest is
    /// assumed to be a spreadsheet.
    pub fn resolve_for(self, path: &str) -> SheetFormat {
        match self {
            SheetFormat::Auto => {
                if path.to_lowercase().ends_with(".csv") {
                    SheetFormat::Delimited
                } else {
                    SheetFormat::Spreadsheet
                }
            }
            other => other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    Modern,
    Legacy,
}

#[derive(Debug, Display, Error)]
pub enum SheetError {
    #[display("unable to read {path}: {reason}")]
    Read { path: String, reason: String },
    #[display("file has no data rows")]
    Empty,
    #[display("missing required columns: {_0:?}")]
    #[error(ignore)]
    MissingColumns(Vec<String>),
}

/// A fully materialized sheet: normalized headers plus stringified cells.
#[derive(Clone, Debug, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Trimmed cell content, `None` when the column is absent or the cell is
    /// blank (or a stray pandas `nan`/`none` literal).
    pub fn cell<'a>(&self, row: &'a [String], name: &str) -> Option<&'a str> {
        let idx = self.column(name)?;
        let value = row.get(idx)?.trim();
        if value.is_empty()
            || value.eq_ignore_ascii_case("nan")
            || value.eq_ignore_ascii_case("none")
        {
            None
        } else {
            Some(value)
        }
    }
}

/// How a record references its category: by id (modern layout) or by name
/// (legacy layout, created on demand).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CategoryRef {
    Id(i64),
    Name(String),
}

#[derive(Clone, Debug)]
pub struct CatalogRecord {
    /// 1-based sheet row, header included, for error reporting.
    pub row: usize,
    pub code: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<CategoryRef>,
    pub subcategory: Option<CategoryRef>,
    pub unit_price: Option<Decimal>,
    pub quantity: i64,
    pub kit_parent_code: Option<String>,
    pub active: bool,
    pub image_links: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct RowSkip {
    pub row: usize,
    pub reason: String,
}

pub async fn read_table(path: &str, format: SheetFormat) -> Result<Table, SheetError> {
    let format = format.resolve_for(path);
    let mut table = match format {
        SheetFormat::Delimited | SheetFormat::Auto => read_delimited(path).await?,
        SheetFormat::Spreadsheet => read_spreadsheet(path)?,
    };
    normalize_headers(&mut table.headers);
    if format == SheetFormat::Spreadsheet {
        for header in &mut table.headers {
            *header = header.to_uppercase();
        }
    }
    log::info!(
        "Read {path}: {} row(s), {} column(s)",
        table.rows.len(),
        table.headers.len()
    );
    Ok(table)
}

async fn read_delimited(path: &str) -> Result<Table, SheetError> {
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| SheetError::Read {
            path: path.to_string(),
            reason: err.to_string(),
        })?;
    let mut rdr = AsyncReaderBuilder::new()
        .delimiter(b',')
        .flexible(true)
        .create_reader(data.as_bytes());
    let headers = rdr
        .headers()
        .await
        .map_err(|err| SheetError::Read {
            path: path.to_string(),
            reason: err.to_string(),
        })?
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let width = headers.len();
    let mut rows = Vec::new();
    let mut records = rdr.records();
    while let Some(record) = records.next().await {
        match record {
            Ok(record) => {
                let mut row: Vec<String> = record.iter().map(ToString::to_string).collect();
                row.resize(width, String::new());
                rows.push(row);
            }
            // A single malformed record is not fatal; the row count in the
            // summary will not include it.
            Err(err) => log::warn!("Skipping malformed record in {path}: {err}"),
        }
    }
    Ok(Table { headers, rows })
}

fn read_spreadsheet(path: &str) -> Result<Table, SheetError> {
    let mut workbook = open_workbook_auto(path).map_err(|err| SheetError::Read {
        path: path.to_string(),
        reason: err.to_string(),
    })?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(SheetError::Empty)?
        .map_err(|err| SheetError::Read {
            path: path.to_string(),
            reason: err.to_string(),
        })?;
    let mut rows_iter = range.rows();
    let headers: Vec<String> = rows_iter
        .next()
        .ok_or(SheetError::Empty)?
        .iter()
        .map(cell_to_string)
        .collect();
    let width = headers.len();
    let rows = rows_iter
        .map(|row| {
            let mut row: Vec<String> = row.iter().map(cell_to_string).collect();
            row.resize(width, String::new());
            row
        })
        .collect();
    Ok(Table { headers, rows })
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        // Integral floats come back as "9089", not "9089.0".
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}

/// Trims headers and replaces blank or duplicate ones with a positional
/// `COLUNA_<n>` placeholder (1-based, matching the row numbers users see).
pub fn normalize_headers(headers: &mut [String]) {
    let mut seen = HashSet::new();
    for (idx, header) in headers.iter_mut().enumerate() {
        let mut name = header.trim().to_string();
        if name.is_empty() || !seen.insert(name.clone()) {
            name = format!("COLUNA_{}", idx + 1);
            log::warn!("Column {idx} is blank or duplicated, renaming to {name}");
            seen.insert(name.clone());
        }
        *header = name;
    }
}

pub fn detect_layout(table: &Table) -> Layout {
    let has = |name: &str| table.column(name).is_some();
    if has("codigo") && has("Nome") {
        Layout::Modern
    } else if has("PRODUTO") && has("CATEGORIA") {
        Layout::Legacy
    } else {
        log::warn!(
            "Unable to detect the sheet layout, assuming the modern one. Columns: {:?}",
            table.headers
        );
        Layout::Modern
    }
}

pub fn validate_columns(table: &Table, layout: Layout) -> Result<(), SheetError> {
    let required: &[&str] = match layout {
        Layout::Modern => &REQUIRED_COLUMNS_MODERN,
        Layout::Legacy => &REQUIRED_COLUMNS_LEGACY,
    };
    let missing: Vec<String> = required
        .iter()
        .filter(|name| table.column(name).is_none())
        .map(ToString::to_string)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SheetError::MissingColumns(missing))
    }
}

pub fn extract_records(table: &Table, layout: Layout) -> (Vec<CatalogRecord>, Vec<RowSkip>) {
    match layout {
        Layout::Modern => extract_modern(table),
        Layout::Legacy => extract_legacy(table),
    }
}

fn extract_modern(table: &Table) -> (Vec<CatalogRecord>, Vec<RowSkip>) {
    let mut records = Vec::new();
    let mut skips = Vec::new();
    for (idx, row) in table.rows.iter().enumerate() {
        let row_no = idx + 2;
        let code = table.cell(row, "codigo").map(ToString::to_string);
        let name = table.cell(row, "Nome").unwrap_or_default().to_string();
        if code.is_none() && name.is_empty() {
            log::debug!("Row {row_no} skipped: no code and no name");
            continue;
        }
        let category = match parse_id_cell(table.cell(row, "id_categoria")) {
            Ok(id) => id.map(CategoryRef::Id),
            Err(raw) => {
                skips.push(RowSkip {
                    row: row_no,
                    reason: format!("id_categoria is not a number: {raw}"),
                });
                continue;
            }
        };
        let subcategory = match parse_id_cell(table.cell(row, "id_subcategoria")) {
            Ok(id) => id.map(CategoryRef::Id),
            Err(raw) => {
                skips.push(RowSkip {
                    row: row_no,
                    reason: format!("id_subcategoria is not a number: {raw}"),
                });
                continue;
            }
        };
        let quantity = match parse_id_cell(table.cell(row, "Quantidade")) {
            Ok(q) => q.unwrap_or(1).max(1),
            Err(raw) => {
                skips.push(RowSkip {
                    row: row_no,
                    reason: format!("Quantidade is not a number: {raw}"),
                });
                continue;
            }
        };
        let unit_price = table
            .cell(row, "Vlr Unitario")
            .and_then(parse_locale_decimal)
            .or_else(|| table.cell(row, "Vlr Bruto").and_then(parse_locale_decimal));
        let kit_parent_code = table
            .cell(row, KIT_COLUMN_MODERN)
            .and_then(stringify_kit_code);
        let active = table
            .cell(row, ACTIVE_COLUMN_MODERN)
            .map(parse_active)
            .unwrap_or(true);
        let image_links = IMAGE_COLUMNS
            .iter()
            .find_map(|name| table.cell(row, name))
            .map(parse_image_links)
            .unwrap_or_default();
        records.push(CatalogRecord {
            row: row_no,
            code,
            name,
            description: table.cell(row, "Descricao").map(ToString::to_string),
            category,
            subcategory,
            unit_price,
            quantity,
            kit_parent_code,
            active,
            image_links,
        });
    }
    (records, skips)
}

fn extract_legacy(table: &Table) -> (Vec<CatalogRecord>, Vec<RowSkip>) {
    let mut records = Vec::new();
    let skips = Vec::new();
    for (idx, row) in table.rows.iter().enumerate() {
        let row_no = idx + 2;
        let name = match table.cell(row, "PRODUTO") {
            Some(name) => name.to_string(),
            None => {
                log::debug!("Row {row_no} skipped: no PRODUTO");
                continue;
            }
        };
        let category = table
            .cell(row, "CATEGORIA")
            .map(|n| CategoryRef::Name(n.to_string()));
        let subcategory = table
            .cell(row, "SUBCATEGORIA")
            .map(|n| CategoryRef::Name(n.to_string()));
        let unit_price = table
            .cell(row, "VALOR UNITÁRIO")
            .and_then(parse_locale_decimal);
        records.push(CatalogRecord {
            row: row_no,
            code: None,
            name,
            description: table.cell(row, "DESCRIÇÃO").map(ToString::to_string),
            category,
            subcategory,
            unit_price,
            quantity: 1,
            // The legacy sheet has no kit code column; its KIT column names a
            // grouping, not a parent code.
            kit_parent_code: None,
            active: true,
            image_links: vec![],
        });
    }
    (records, skips)
}

fn parse_id_cell(cell: Option<&str>) -> Result<Option<i64>, String> {
    match cell {
        None => Ok(None),
        Some(raw) => {
            if let Ok(id) = raw.parse::<i64>() {
                return Ok(Some(id));
            }
            // Spreadsheet numerics may surface as floats ("12.0").
            match raw.parse::<f64>() {
                Ok(f) if f.fract() == 0.0 => Ok(Some(f as i64)),
                _ => Err(raw.to_string()),
            }
        }
    }
}

/// Kit references arrive as text or as spreadsheet numerics ("9089.0");
/// both normalize to the plain string form of the code.
pub fn stringify_kit_code(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(stripped) = raw.strip_suffix(".0") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return Some(stripped.to_string());
        }
    }
    Some(raw.to_string())
}

pub fn parse_active(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "true" | "1" | "sim" | "s" | "yes" | "y"
    )
}

/// Parses a value with a comma decimal separator and dot thousands separators
/// ("1.234,56"); plain "1234.56" also passes. Anything else is `None` so the
/// row can still go through with no price.
pub fn parse_locale_decimal(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(value) = raw.parse::<Decimal>() {
        return Some(value.round_dp(2));
    }
    let cleaned = raw.replace('.', "").replace(',', ".");
    cleaned.parse::<Decimal>().ok().map(|v| v.round_dp(2))
}

/// Accepts a JSON array, an unquoted bracket list, a `;`- or `,`-separated
/// list, or a single bare URL; keeps first-occurrence order and drops in-cell
/// duplicates.
pub fn parse_image_links(cell: &str) -> Vec<String> {
    let cell = cell.trim();
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") || cell.eq_ignore_ascii_case("none") {
        return vec![];
    }
    let items: Vec<String> = if let Ok(parsed) = serde_json::from_str::<Vec<String>>(cell) {
        parsed
    } else {
        let inner = if cell.starts_with('[') && cell.ends_with(']') {
            cell[1..cell.len() - 1].trim()
        } else {
            cell
        };
        if inner.contains(';') {
            inner.split(';').map(ToString::to_string).collect()
        } else if inner.contains(',') {
            inner.split(',').map(ToString::to_string).collect()
        } else {
            vec![inner.to_string()]
        }
    };
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(|link| link.trim().to_string())
        .filter(|link| !link.is_empty())
        .filter(|link| seen.insert(link.clone()))
        .collect()
}

#[cfg(test)]
pub mod test {

    use super::*;
    use rust_decimal_macros::dec;

    fn table(headers: &[&str], rows: &[&[&str]]) -> Table {
        let mut headers: Vec<String> = headers.iter().map(ToString::to_string).collect();
        normalize_headers(&mut headers);
        Table {
            headers,
            rows: rows
                .iter()
                .map(|r| r.iter().map(ToString::to_string).collect())
                .collect(),
        }
    }

    #[test]
    fn normalizes_blank_and_duplicate_headers() {
        let mut headers = vec![
            " codigo ".to_string(),
            "".to_string(),
            "Nome".to_string(),
            "Nome".to_string(),
        ];
        normalize_headers(&mut headers);
        assert_eq!(vec!["codigo", "COLUNA_2", "Nome", "COLUNA_4"], headers);
    }

    #[test]
    fn detects_layouts() {
        let modern = table(&["codigo", "Nome"], &[]);
        assert_eq!(Layout::Modern, detect_layout(&modern));
        let legacy = table(&["PRODUTO", "CATEGORIA"], &[]);
        assert_eq!(Layout::Legacy, detect_layout(&legacy));
        let ambiguous = table(&["foo", "bar"], &[]);
        assert_eq!(Layout::Modern, detect_layout(&ambiguous));
    }

    #[test]
    fn reports_missing_columns() {
        let t = table(&["codigo", "Nome"], &[]);
        match validate_columns(&t, Layout::Modern) {
            Err(SheetError::MissingColumns(missing)) => {
                assert!(missing.contains(&"id_categoria".to_string()));
                assert!(missing.contains(&"Vlr Unitario".to_string()));
            }
            other => panic!("expected missing columns, got {other:?}"),
        }
    }

    #[test]
    fn parses_locale_decimals() {
        assert_eq!(Some(dec!(1234.56)), parse_locale_decimal("1.234,56"));
        assert_eq!(Some(dec!(1234.56)), parse_locale_decimal("1234.56"));
        assert_eq!(Some(dec!(10.50)), parse_locale_decimal("10,5"));
        assert_eq!(Some(dec!(100.00)), parse_locale_decimal("100"));
        assert_eq!(None, parse_locale_decimal("dez reais"));
        assert_eq!(None, parse_locale_decimal(""));
    }

    #[test]
    fn stringifies_kit_codes() {
        assert_eq!(Some("9089".to_string()), stringify_kit_code("9089.0"));
        assert_eq!(Some("9089".to_string()), stringify_kit_code("9089"));
        assert_eq!(Some("KIT-A".to_string()), stringify_kit_code(" KIT-A "));
        assert_eq!(None, stringify_kit_code("   "));
    }

    #[test]
    fn extracts_image_links_from_every_shape() {
        assert_eq!(
            vec!["https://a/1.jpg", "https://a/2.jpg"],
            parse_image_links(r#"["https://a/1.jpg", "https://a/2.jpg"]"#)
        );
        assert_eq!(
            vec!["https://a/1.jpg", "https://a/2.jpg"],
            parse_image_links("[https://a/1.jpg, https://a/2.jpg]")
        );
        assert_eq!(
            vec!["https://a/1.jpg", "https://a/2.jpg"],
            parse_image_links("https://a/1.jpg;https://a/2.jpg")
        );
        assert_eq!(
            vec!["https://a/1.jpg", "https://a/2.jpg"],
            parse_image_links("https://a/1.jpg,https://a/2.jpg")
        );
        assert_eq!(vec!["https://a/1.jpg"], parse_image_links("https://a/1.jpg"));
        assert_eq!(Vec::<String>::new(), parse_image_links("nan"));
    }

    #[test]
    fn drops_in_cell_duplicates_keeping_order() {
        assert_eq!(
            vec!["https://a/2.jpg", "https://a/1.jpg"],
            parse_image_links("https://a/2.jpg,https://a/1.jpg,https://a/2.jpg")
        );
    }

    #[test]
    fn extracts_modern_records() {
        let t = table(
            &[
                "codigo",
                "id_categoria",
                "id_subcategoria",
                "Nome",
                "Quantidade",
                "Descricao",
                "Codigo Amarração",
                "Vlr Bruto",
                "Vlr Unitario",
                "image_url",
            ],
            &[
                &[
                    "9090",
                    "1",
                    "2",
                    "Kit ferramentas",
                    "3",
                    "Kit completo",
                    "",
                    "120,00",
                    "99,90",
                    "https://drive.google.com/file/d/abc/view",
                ],
                &[
                    "9091",
                    "1",
                    "",
                    "Chave de fenda",
                    "",
                    "",
                    "9090.0",
                    "",
                    "10,00",
                    "",
                ],
                &["", "1", "", "", "", "", "", "", "", ""],
                &["9092", "x", "", "Alicate", "", "", "", "", "5,00", ""],
            ],
        );
        let (records, skips) = extract_records(&t, Layout::Modern);
        assert_eq!(2, records.len());
        assert_eq!(1, skips.len());

        let first = &records[0];
        assert_eq!(Some("9090".to_string()), first.code);
        assert_eq!(Some(CategoryRef::Id(1)), first.category);
        assert_eq!(Some(CategoryRef::Id(2)), first.subcategory);
        assert_eq!(Some(dec!(99.90)), first.unit_price);
        assert_eq!(3, first.quantity);
        assert_eq!(None, first.kit_parent_code);
        assert_eq!(1, first.image_links.len());

        let second = &records[1];
        assert_eq!(Some("9090".to_string()), second.kit_parent_code);
        assert_eq!(1, second.quantity);
        assert_eq!(None, second.subcategory);

        assert_eq!(5, skips[0].row);
    }

    #[test]
    fn falls_back_to_gross_price() {
        let t = table(
            &["codigo", "Nome", "Vlr Bruto", "Vlr Unitario"],
            &[&["1", "Martelo", "50,00", ""]],
        );
        let (records, _) = extract_records(&t, Layout::Modern);
        assert_eq!(Some(dec!(50.00)), records[0].unit_price);
    }

    #[test]
    fn extracts_legacy_records() {
        let t = table(
            &[
                "PRODUTO",
                "CATEGORIA",
                "SUBCATEGORIA",
                "DESCRIÇÃO",
                "REGIÃO",
                "PRAZO DE ENTREGA",
                "VALOR UNITÁRIO",
                "KIT",
                "OBSERVAÇÕES",
            ],
            &[
                &[
                    "Martelo",
                    "Ferramentas",
                    "Manuais",
                    "Martelo de unha",
                    "Sul",
                    "5 dias",
                    "35.90",
                    "",
                    "",
                ],
                &["", "Ferramentas", "", "", "", "", "", "", ""],
            ],
        );
        let (records, skips) = extract_records(&t, Layout::Legacy);
        assert_eq!(1, records.len());
        assert!(skips.is_empty());
        let record = &records[0];
        assert_eq!("Martelo", record.name);
        assert_eq!(None, record.code);
        assert_eq!(
            Some(CategoryRef::Name("Ferramentas".to_string())),
            record.category
        );
        assert_eq!(Some(dec!(35.90)), record.unit_price);
        assert!(record.image_links.is_empty());
    }
}
