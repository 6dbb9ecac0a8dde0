use std::io::Write;

use crate::db::{CellValue, ColumnInfo, QueryResult};
use crate::error::Result;

/// Write a result as CSV; NULL cells become empty fields.
pub fn write_csv(result: &QueryResult, out: &mut dyn Write, include_header: bool) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    if include_header {
        writer.write_record(result.columns.iter().map(|c| c.name.as_str()))?;
    }
    for row in &result.rows {
        writer.write_record(row.iter().map(CellValue::to_text))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn to_csv(result: &QueryResult) -> Result<String> {
    let mut buf = Vec::new();
    write_csv(result, &mut buf, true)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Parse CSV with a header line into a result of text cells. Fields equal
/// to `null` are read back as NULL; every other field, empty ones included,
/// stays text.
pub fn read_csv(bytes: &[u8], null: &str) -> Result<QueryResult> {
    let mut reader = csv::Reader::from_reader(bytes);
    let columns = reader
        .headers()?
        .iter()
        .map(|name| ColumnInfo::new(name, "text"))
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(
            record
                .iter()
                .map(|field| {
                    if field == null {
                        CellValue::Null
                    } else {
                        CellValue::Text(field.to_string())
                    }
                })
                .collect(),
        );
    }
    Ok(QueryResult::new(columns, rows))
}

/// The CSV body after its header line.
pub fn strip_header(bytes: &[u8]) -> Result<&[u8]> {
    let mut reader = csv::Reader::from_reader(bytes);
    reader.headers()?;
    let offset = reader.position().byte() as usize;
    Ok(bytes.get(offset..).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_result() -> QueryResult {
        QueryResult::new(
            vec![
                ColumnInfo::new("entity_id", "int4"),
                ColumnInfo::new("race", "text"),
                ColumnInfo::new("note", "text"),
            ],
            vec![
                vec![
                    CellValue::Int32(1),
                    CellValue::Text("white".into()),
                    CellValue::Text("has, comma".into()),
                ],
                vec![
                    CellValue::Int32(2),
                    CellValue::Null,
                    CellValue::Text("say \"hi\"".into()),
                ],
            ],
        )
    }

    #[test]
    fn test_to_csv_escapes() {
        let csv = to_csv(&make_result()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "entity_id,race,note");
        assert_eq!(lines[1], "1,white,\"has, comma\"");
        assert_eq!(lines[2], "2,,\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_write_csv_without_header() {
        let mut buf = Vec::new();
        write_csv(&make_result(), &mut buf, false).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("1,white,"));
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_read_csv_nulls_and_quotes() {
        let result = read_csv(b"entity_id,race\n1,white\n2,\n3,\"a,b\"\n", "").unwrap();
        assert_eq!(result.columns.len(), 2);
        assert_eq!(result.row_count, 3);
        assert_eq!(result.rows[1][1], CellValue::Null);
        assert_eq!(result.rows[2][1], CellValue::Text("a,b".into()));
    }

    #[test]
    fn test_read_csv_null_marker_keeps_empty_text() {
        let result = read_csv(b"entity_id,race\n1,\"\"\n2,\\N\n", "\\N").unwrap();
        assert_eq!(result.rows[0][1], CellValue::Text(String::new()));
        assert_eq!(result.rows[1][1], CellValue::Null);
    }

    #[test]
    fn test_read_csv_header_only() {
        let result = read_csv(b"entity_id,as_of_date\n", "").unwrap();
        assert_eq!(result.columns.len(), 2);
        assert!(result.is_empty());
    }

    #[test]
    fn test_strip_header() {
        assert_eq!(strip_header(b"a,b\n1,2\n").unwrap(), b"1,2\n");
        assert_eq!(strip_header(b"a,b\n").unwrap(), b"");
    }
}
