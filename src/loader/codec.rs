//! Gzip-compressed CSV encoding of staged batches.
//!
//! Files have no header row and every field is quoted, so an empty string
//! stays distinguishable from a missing value. The matching warehouse file
//! format is [`FILE_FORMAT`].

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use snafu::prelude::*;

use crate::error::{CodecError, CsvSnafu, FieldCountSnafu, FieldValueSnafu, GzipSnafu};
use crate::mapper::{ColumnTuple, ColumnValue, TableSchema};

/// Warehouse file format clause for files produced by [`encode`].
///
/// `NULL_IF = ()` turns off the `\N` null marker: every field is a value.
pub const FILE_FORMAT: &str = "TYPE = CSV COMPRESSION = GZIP \
     FIELD_OPTIONALLY_ENCLOSED_BY = '\"' EMPTY_FIELD_AS_NULL = FALSE NULL_IF = ()";

/// Encode rows as gzip CSV.
pub fn encode(rows: &[ColumnTuple]) -> Result<Bytes, CodecError> {
    let gzip = GzEncoder::new(Vec::new(), Compression::default());
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .quote_style(csv::QuoteStyle::Always)
        .from_writer(gzip);

    for row in rows {
        writer
            .write_record(row.values().iter().map(ToString::to_string))
            .context(CsvSnafu)?;
    }

    let gzip = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .context(GzipSnafu)?;
    Ok(Bytes::from(gzip.finish().context(GzipSnafu)?))
}

/// Decode a staged file back into rows typed by `schema`.
pub fn decode(bytes: &[u8], schema: &TableSchema) -> Result<Vec<ColumnTuple>, CodecError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(GzDecoder::new(bytes));

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.context(CsvSnafu)?;
        ensure!(
            record.len() == schema.len(),
            FieldCountSnafu {
                row: index,
                found: record.len(),
                expected: schema.len(),
            }
        );

        let values = schema
            .columns()
            .iter()
            .zip(record.iter())
            .map(|(column, text)| {
                ColumnValue::parse(column.column_type, text).context(FieldValueSnafu {
                    row: index,
                    column: column.name,
                    value: text,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(ColumnTuple(values));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::map_record;
    use crate::record::parse_payload;

    #[test]
    fn test_values_survive_json_to_staged_file() {
        let payloads: [&[u8]; 3] = [
            br#"{"id":"a1","name":"Alice","age":30,"price":9.99}"#,
            br#"{"id":"q\"1","name":"Smith, J.","age":-1,"price":0.1}"#,
            br#"{"id":"","name":"line\nbreak","age":2147483647,"price":1e-7}"#,
        ];
        let rows: Vec<ColumnTuple> = payloads
            .iter()
            .map(|p| map_record(&parse_payload(p).unwrap()))
            .collect();

        let bytes = encode(&rows).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);

        let decoded = decode(&bytes, &TableSchema::events()).unwrap();
        assert_eq!(decoded, rows);
        assert_eq!(decoded[0].values()[3], ColumnValue::Float(9.99));
        assert_eq!(decoded[2].values()[0], ColumnValue::String(String::new()));
    }

    #[test]
    fn test_null_marker_is_loaded_as_text() {
        assert!(FILE_FORMAT.contains("NULL_IF = ()"));

        let rows = vec![map_record(
            &parse_payload(br#"{"id":"\\N","name":"\\N","age":0,"price":0.0}"#).unwrap(),
        )];
        assert_eq!(rows[0].values()[0], ColumnValue::String("\\N".to_string()));

        let decoded = decode(&encode(&rows).unwrap(), &TableSchema::events()).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn test_all_fields_quoted() {
        let bytes = encode(&[ColumnTuple(vec![
            ColumnValue::String("a".to_string()),
            ColumnValue::Integer(3),
        ])])
        .unwrap();
        let mut text = String::new();
        std::io::Read::read_to_string(&mut GzDecoder::new(&bytes[..]), &mut text).unwrap();
        assert_eq!(text, "\"a\",\"3\"\n");
    }

    #[test]
    fn test_decode_rejects_wrong_arity() {
        let bytes = encode(&[ColumnTuple(vec![ColumnValue::Integer(3)])]).unwrap();
        let err = decode(&bytes, &TableSchema::events()).unwrap_err();
        assert!(matches!(err, CodecError::FieldCount { found: 1, .. }));
    }

    #[test]
    fn test_empty_batch_is_valid_gzip() {
        let bytes = encode(&[]).unwrap();
        assert!(decode(&bytes, &TableSchema::events()).unwrap().is_empty());
    }
}
