use anyhow::Result;
use arrow_array::cast::AsArray;
use arrow_array::types::{Int64Type, TimestampSecondType, UInt8Type};
use arrow_array::{Array, RecordBatch};
use arrow_schema::{DataType, SchemaRef, TimeUnit};
use comfy_table::{Cell, Table};
use serde_json::{Map, Value};
use std::fmt::Write;

fn format_value(array: &dyn Array, idx: usize) -> String {
    if array.is_null(idx) {
        return "NULL".to_string();
    }
    match array.data_type() {
        DataType::Utf8 => array.as_string::<i32>().value(idx).to_string(),
        DataType::Int64 => array.as_primitive::<Int64Type>().value(idx).to_string(),
        DataType::UInt8 => array.as_primitive::<UInt8Type>().value(idx).to_string(),
        DataType::Timestamp(TimeUnit::Second, _) => {
            let ts = array.as_primitive::<TimestampSecondType>();
            match ts.value_as_datetime(idx) {
                Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
                None => ts.value(idx).to_string(),
            }
        }
        DataType::List(_) => {
            let items = array.as_list::<i32>().value(idx);
            let parts: Vec<String> = (0..items.len())
                .map(|i| match items.data_type() {
                    DataType::Utf8 => format!("'{}'", format_value(items.as_ref(), i)),
                    _ => format_value(items.as_ref(), i),
                })
                .collect();
            format!("[{}]", parts.join(","))
        }
        other => format!("<{other}>"),
    }
}

fn json_value(array: &dyn Array, idx: usize) -> Value {
    if array.is_null(idx) {
        return Value::Null;
    }
    match array.data_type() {
        DataType::Int64 => Value::from(array.as_primitive::<Int64Type>().value(idx)),
        DataType::UInt8 => Value::from(array.as_primitive::<UInt8Type>().value(idx)),
        DataType::List(_) => {
            let items = array.as_list::<i32>().value(idx);
            Value::Array((0..items.len()).map(|i| json_value(items.as_ref(), i)).collect())
        }
        _ => Value::String(format_value(array, idx)),
    }
}

/// Render batches as a comfy-table grid followed by a row count.
pub fn render_table(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<String> {
    let mut table = Table::new();
    table.set_header(schema.fields().iter().map(|f| f.name().as_str()));
    let mut total_rows = 0;
    for batch in batches {
        total_rows += batch.num_rows();
        for row_idx in 0..batch.num_rows() {
            let row: Vec<Cell> = batch
                .columns()
                .iter()
                .map(|col| Cell::new(format_value(col.as_ref(), row_idx)))
                .collect();
            table.add_row(row);
        }
    }
    let mut output = String::new();
    writeln!(output, "{table}")?;
    writeln!(
        output,
        "({} row{})",
        total_rows,
        if total_rows == 1 { "" } else { "s" }
    )?;
    Ok(output)
}

/// One JSON object per row.
pub fn render_json_lines(batches: &[RecordBatch]) -> Result<String> {
    let mut output = String::new();
    for batch in batches {
        let schema = batch.schema();
        for row_idx in 0..batch.num_rows() {
            let mut object = Map::new();
            for (field, col) in schema.fields().iter().zip(batch.columns()) {
                object.insert(field.name().clone(), json_value(col.as_ref(), row_idx));
            }
            writeln!(output, "{}", serde_json::to_string(&Value::Object(object))?)?;
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutascope_core::{BlockNumber, MutationEntry, MutationRowsBuilder};

    fn batch() -> RecordBatch {
        let mut rows = MutationRowsBuilder::new();
        rows.append(
            "db1",
            "t2",
            &MutationEntry {
                id: "0001".into(),
                command: "DELETE WHERE x = 1".into(),
                create_time: 1_700_000_000,
                block_numbers: vec![
                    BlockNumber { partition_id: "a".into(), number: 3 },
                    BlockNumber { partition_id: "b".into(), number: 4 },
                ],
                parts_to_do: 2,
                is_done: false,
            },
        )
        .unwrap();
        rows.finish().unwrap()
    }

    #[test]
    fn test_render_table() {
        let batch = batch();
        let out = render_table(&batch.schema(), &[batch]).unwrap();
        assert!(out.contains("mutation_id"));
        assert!(out.contains("2023-11-14 22:13:20"));
        assert!(out.contains("['a','b']"));
        assert!(out.contains("[3,4]"));
        assert!(out.ends_with("(1 row)\n"));
    }

    #[test]
    fn test_render_json_lines() {
        let out = render_json_lines(&[batch()]).unwrap();
        let row: Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(row["database"], "db1");
        assert_eq!(row["block_numbers.partition_id"], serde_json::json!(["a", "b"]));
        assert_eq!(row["block_numbers.number"], serde_json::json!([3, 4]));
        assert_eq!(row["parts_to_do"], 2);
        assert_eq!(row["is_done"], 0);
    }
}
