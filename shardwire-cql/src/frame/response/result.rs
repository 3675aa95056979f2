use crate::errors::CqlResponseKind;
use crate::frame::frame_errors::{LowLevelDeserializationError, ResponseParseError};
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;
use crate::value::{ColumnType, CqlValue};
use bytes::Bytes;

const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    pub col_count: usize,
    /// Opaque resume point; present when the server has more pages.
    pub paging_state: Option<Bytes>,
    pub col_specs: Vec<ColumnSpec>,
}

impl ResultMetadata {
    pub fn col_specs(&self) -> &[ColumnSpec] {
        &self.col_specs
    }

    /// Position of the column with the given name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.col_specs.iter().position(|spec| spec.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    pub columns: Vec<Option<CqlValue>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    SchemaChange(SchemaChange),
}

fn malformed(err: impl Into<LowLevelDeserializationError>) -> ResponseParseError {
    ResponseParseError::malformed(CqlResponseKind::Result, err)
}

fn deser_table_spec(buf: &mut &[u8]) -> std::result::Result<TableSpec, LowLevelDeserializationError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_result_metadata(
    buf: &mut &[u8],
) -> std::result::Result<ResultMetadata, LowLevelDeserializationError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;
    let no_metadata = flags & FLAG_NO_METADATA != 0;

    let col_count = types::read_int_length(buf)?;

    let paging_state = has_more_pages
        .then(|| types::read_bytes(buf).map(Bytes::copy_from_slice))
        .transpose()?;

    if no_metadata {
        return Ok(ResultMetadata {
            col_count,
            paging_state,
            col_specs: vec![],
        });
    }

    let global_table_spec = global_tables_spec
        .then(|| deser_table_spec(buf))
        .transpose()?;

    let mut col_specs = Vec::with_capacity(types::capacity_hint(col_count, buf, 4));
    for _ in 0..col_count {
        let table_spec = match &global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf)?,
        };
        let name = types::read_string(buf)?.to_owned();
        let typ = ColumnType::deserialize(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }

    Ok(ResultMetadata {
        col_count,
        paging_state,
        col_specs,
    })
}

fn deser_rows(buf: &mut &[u8]) -> std::result::Result<Rows, LowLevelDeserializationError> {
    let metadata = deser_result_metadata(buf)?;

    let rows_count = types::read_int_length(buf)?;
    let row_size = metadata.col_count.saturating_mul(4);
    let mut rows = Vec::with_capacity(types::capacity_hint(rows_count, buf, row_size));
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(types::capacity_hint(metadata.col_count, buf, 4));
        for i in 0..metadata.col_count {
            let cell = types::read_bytes_opt(buf)?;
            let value = match (cell, metadata.col_specs.get(i)) {
                (None, _) => None,
                (Some(mut raw), Some(spec)) => Some(CqlValue::deserialize(&spec.typ, &mut raw)?),
                (Some(raw), None) => Some(CqlValue::Raw(Bytes::copy_from_slice(raw))),
            };
            columns.push(value);
        }
        rows.push(Row { columns });
    }

    Ok(Rows { metadata, rows })
}

/// Parses the body of a RESULT response.
pub fn deserialize(buf: &mut &[u8]) -> std::result::Result<Result, ResponseParseError> {
    Ok(match types::read_int(buf).map_err(malformed)? {
        0x0001 => Result::Void,
        0x0002 => Result::Rows(deser_rows(buf).map_err(malformed)?),
        0x0003 => Result::SetKeyspace(SetKeyspace {
            keyspace_name: types::read_string(buf).map_err(malformed)?.to_owned(),
        }),
        0x0004 => return Err(ResponseParseError::UnsupportedResultKind("Prepared")),
        0x0005 => Result::SchemaChange(SchemaChange {
            event: SchemaChangeEvent::deserialize(buf)?,
        }),
        kind => return Err(ResponseParseError::UnknownResultKind(kind)),
    })
}

impl Result {
    /// Encodes a RESULT body. Only test servers need this direction.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> std::result::Result<(), std::num::TryFromIntError> {
        match self {
            Result::Void => types::write_int(0x0001, buf),
            Result::Rows(rows) => {
                types::write_int(0x0002, buf);
                rows.serialize(buf)?;
            }
            Result::SetKeyspace(set_keyspace) => {
                types::write_int(0x0003, buf);
                types::write_string(&set_keyspace.keyspace_name, buf)?;
            }
            Result::SchemaChange(change) => {
                types::write_int(0x0005, buf);
                change.event.serialize(buf)?;
            }
        }
        Ok(())
    }
}

impl Rows {
    fn serialize(&self, buf: &mut Vec<u8>) -> std::result::Result<(), std::num::TryFromIntError> {
        let mut flags = 0;
        if self.metadata.paging_state.is_some() {
            flags |= FLAG_HAS_MORE_PAGES;
        }
        types::write_int(flags, buf);
        types::write_int(self.metadata.col_specs.len().try_into()?, buf);
        if let Some(paging_state) = &self.metadata.paging_state {
            types::write_bytes(paging_state, buf)?;
        }
        for spec in &self.metadata.col_specs {
            types::write_string(&spec.table_spec.ks_name, buf)?;
            types::write_string(&spec.table_spec.table_name, buf)?;
            types::write_string(&spec.name, buf)?;
            spec.typ.serialize(buf)?;
        }

        types::write_int(self.rows.len().try_into()?, buf);
        for row in &self.rows {
            for cell in &row.columns {
                match cell {
                    Some(value) => {
                        let mut raw = Vec::new();
                        value.serialize(&mut raw)?;
                        types::write_bytes(&raw, buf)?;
                    }
                    None => types::write_int(-1, buf),
                }
            }
        }
        Ok(())
    }
}
