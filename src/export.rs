use crate::sheet::Table;
use itertools::Itertools;
use rust_xlsxwriter::Workbook;

/// Column appended to the regenerated sheet with each product's final list
/// of public image URLs.
pub const RESULT_COLUMN: &str = "imagens_publicas";

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// The `[url1, url2]` cell format the input sheets use for link lists.
pub fn bracketed_list(urls: &[String]) -> String {
    if urls.is_empty() {
        String::new()
    } else {
        format!("[{}]", urls.iter().join(", "))
    }
}

/// Rebuilds the input sheet row-for-row with `imagens_publicas` appended.
/// `image_cells` is indexed by data-row position.
pub fn result_workbook(table: &Table, image_cells: &[String]) -> Result<Vec<u8>, anyhow::Error> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Produtos")?;
    let result_col = table.headers.len() as u16;
    for (col, header) in table.headers.iter().enumerate() {
        sheet.write_string(0, col as u16, header.as_str())?;
    }
    sheet.write_string(0, result_col, RESULT_COLUMN)?;
    for (idx, row) in table.rows.iter().enumerate() {
        let out_row = (idx + 1) as u32;
        for (col, cell) in row.iter().enumerate() {
            sheet.write_string(out_row, col as u16, cell.as_str())?;
        }
        let cell = image_cells.get(idx).map(String::as_str).unwrap_or_default();
        sheet.write_string(out_row, result_col, cell)?;
    }
    Ok(workbook.save_to_buffer()?)
}

#[cfg(test)]
pub mod test {

    use super::*;

    #[test]
    fn formats_bracketed_lists() {
        assert_eq!("", bracketed_list(&[]));
        assert_eq!(
            "[https://s/a.jpg]",
            bracketed_list(&["https://s/a.jpg".to_string()])
        );
        assert_eq!(
            "[https://s/a.jpg, https://s/b.jpg]",
            bracketed_list(&["https://s/a.jpg".to_string(), "https://s/b.jpg".to_string()])
        );
    }

    #[test]
    fn writes_a_workbook_with_the_result_column() {
        let table = Table {
            headers: vec!["codigo".to_string(), "Nome".to_string()],
            rows: vec![
                vec!["9090".to_string(), "Martelo".to_string()],
                vec!["9091".to_string(), "Alicate".to_string()],
            ],
        };
        let cells = vec!["[https://s/a.jpg]".to_string(), String::new()];
        let bytes = result_workbook(&table, &cells).expect("workbook");
        // XLSX files are ZIP containers.
        assert_eq!(&bytes[..4], b"PK\x03\x04");
    }
}
