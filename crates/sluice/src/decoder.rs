//! MariaDB binlog event decoder
//!
//! Decodes the replication events the pump consumes:
//! - GTID_EVENT / GTID_LIST_EVENT (MariaDB transaction ids)
//! - XID_EVENT (explicit transaction end)
//! - QUERY_EVENT (DDL and statement-based DML)
//! - TABLE_MAP_EVENT
//! - WRITE_ROWS / UPDATE_ROWS / DELETE_ROWS (v1, row-based replication)
//! - ROTATE_EVENT and FORMAT_DESCRIPTION_EVENT (stream bookkeeping)
//!
//! Everything else is surfaced as [`BinlogEvent::Ignored`].

use anyhow::{bail, Result};
use bytes::{Buf, Bytes};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use tracing::trace;

use crate::gtid::Gtid;

/// Binlog event type codes. MariaDB-specific events start at 160.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    QueryEvent = 2,
    StopEvent = 3,
    RotateEvent = 4,
    FormatDescriptionEvent = 15,
    XidEvent = 16,
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    HeartbeatLogEvent = 27,
    AnnotateRowsEvent = 160,
    BinlogCheckpointEvent = 161,
    GtidEvent = 162,
    GtidListEvent = 163,
    Unknown = 0,
}

impl EventType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatLogEvent,
            160 => EventType::AnnotateRowsEvent,
            161 => EventType::BinlogCheckpointEvent,
            162 => EventType::GtidEvent,
            163 => EventType::GtidListEvent,
            _ => EventType::Unknown,
        }
    }

    pub fn is_row_event(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV1
                | EventType::UpdateRowsEventV1
                | EventType::DeleteRowsEventV1
        )
    }
}

/// Column types as carried in table map events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => ColumnType::VarString,
        }
    }
}

/// Common 19-byte event header.
#[derive(Debug, Clone)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub type_code: u8,
    pub server_id: u32,
    pub event_length: u32,
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("event header too short: {} bytes", data.len());
        }

        let mut cursor = Cursor::new(data);
        let timestamp = cursor.get_u32_le();
        let type_code = cursor.get_u8();
        let server_id = cursor.get_u32_le();
        let event_length = cursor.get_u32_le();
        let next_position = cursor.get_u32_le();
        let flags = cursor.get_u16_le();

        Ok(Self {
            timestamp,
            event_type: EventType::from_u8(type_code),
            type_code,
            server_id,
            event_length,
            next_position,
            flags,
        })
    }
}

/// Decoded binlog event.
#[derive(Debug, Clone)]
pub enum BinlogEvent {
    FormatDescription(FormatDescriptionEvent),
    Rotate(RotateEvent),
    Gtid(GtidEvent),
    GtidList(GtidListEvent),
    TableMap(TableMapEvent),
    Rows(RowsEvent),
    Xid(XidEvent),
    Query(QueryEvent),
    Heartbeat,
    Ignored(u8),
}

#[derive(Debug, Clone)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub header_length: u8,
    pub checksum: ChecksumAlg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlg {
    Off,
    Crc32,
}

#[derive(Debug, Clone)]
pub struct RotateEvent {
    pub position: u64,
    pub next_log: String,
}

/// Transaction start.
#[derive(Debug, Clone)]
pub struct GtidEvent {
    pub gtid: Gtid,
    pub flags: u8,
}

impl GtidEvent {
    /// The transaction is a single auto-committed statement; no XID event
    /// follows it.
    pub const FL_STANDALONE: u8 = 0x01;

    pub fn is_standalone(&self) -> bool {
        self.flags & Self::FL_STANDALONE != 0
    }
}

/// The set of transaction ids valid at the start of a binlog.
#[derive(Debug, Clone)]
pub struct GtidListEvent {
    pub gtids: Vec<Gtid>,
}

/// Binds a numeric table id to a schema for the rest of the session.
#[derive(Debug, Clone)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub flags: u16,
    pub database: String,
    pub table: String,
    pub column_count: usize,
    pub column_types: Vec<ColumnType>,
    pub column_metadata: Vec<u16>,
    pub null_bitmap: Vec<u8>,
}

impl TableMapEvent {
    /// The `database.table` identifier the filter matches against.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

/// Which mutation a rows event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowsOp {
    Write,
    Update,
    Delete,
}

/// Row-image batch referring to a previously seen table id.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub op: RowsOp,
    pub table_id: u64,
    pub flags: u16,
    pub column_count: usize,
    pub rows: Vec<RowImage>,
}

/// One decoded row image.
#[derive(Debug, Clone)]
pub struct RowImage {
    /// Present for UPDATE and DELETE
    pub before: Option<Vec<ColumnValue>>,
    /// Present for WRITE and UPDATE
    pub after: Option<Vec<ColumnValue>>,
}

/// Explicit transaction end.
#[derive(Debug, Clone)]
pub struct XidEvent {
    pub transaction_nr: u64,
}

/// DDL or statement-based DML.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub thread_id: u32,
    pub exec_time: u32,
    pub error_code: u16,
    pub database: String,
    pub statement: String,
}

/// Decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    SignedInt(i64),
    UnsignedInt(u64),
    Float(f32),
    Double(f64),
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Date {
        year: u16,
        month: u8,
        day: u8,
    },
    Time {
        hours: u8,
        minutes: u8,
        seconds: u8,
        microseconds: u32,
        negative: bool,
    },
    DateTime {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        microsecond: u32,
    },
    Timestamp(u32),
    Year(u16),
    Enum(u16),
    Set(u64),
    Bit(Vec<u8>),
}

/// Stateful decoder. Table map events are cached so later row events can be
/// interpreted; the format description event fixes the checksum algorithm
/// for the rest of the stream.
pub struct BinlogDecoder {
    table_cache: HashMap<u64, TableMapEvent>,
    checksum: ChecksumAlg,
}

impl Default for BinlogDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BinlogDecoder {
    pub fn new() -> Self {
        Self {
            table_cache: HashMap::new(),
            checksum: ChecksumAlg::Off,
        }
    }

    /// Decode one framed event.
    pub fn decode(&mut self, data: &Bytes) -> Result<BinlogEvent> {
        let header = EventHeader::parse(data)?;
        let mut payload = &data[EventHeader::SIZE..];

        // Events after the format description carry a CRC32 trailer when
        // checksums are negotiated; strip it before decoding.
        if self.checksum == ChecksumAlg::Crc32
            && header.event_type != EventType::FormatDescriptionEvent
            && payload.len() >= 4
        {
            payload = &payload[..payload.len() - 4];
        }

        trace!(
            "decoding {:?} event, {} bytes payload",
            header.event_type,
            payload.len()
        );

        match header.event_type {
            EventType::FormatDescriptionEvent => {
                let event = decode_format_description(payload)?;
                self.checksum = event.checksum;
                Ok(BinlogEvent::FormatDescription(event))
            }
            EventType::RotateEvent => Ok(BinlogEvent::Rotate(decode_rotate(payload)?)),
            EventType::GtidEvent => Ok(BinlogEvent::Gtid(decode_gtid(&header, payload)?)),
            EventType::GtidListEvent => Ok(BinlogEvent::GtidList(decode_gtid_list(payload)?)),
            EventType::TableMapEvent => {
                let event = decode_table_map(payload)?;
                self.table_cache.insert(event.table_id, event.clone());
                Ok(BinlogEvent::TableMap(event))
            }
            EventType::WriteRowsEventV1 => Ok(BinlogEvent::Rows(
                self.decode_rows(payload, RowsOp::Write)?,
            )),
            EventType::UpdateRowsEventV1 => Ok(BinlogEvent::Rows(
                self.decode_rows(payload, RowsOp::Update)?,
            )),
            EventType::DeleteRowsEventV1 => Ok(BinlogEvent::Rows(
                self.decode_rows(payload, RowsOp::Delete)?,
            )),
            EventType::XidEvent => Ok(BinlogEvent::Xid(decode_xid(payload)?)),
            EventType::QueryEvent => Ok(BinlogEvent::Query(decode_query(payload)?)),
            EventType::HeartbeatLogEvent => Ok(BinlogEvent::Heartbeat),
            _ => Ok(BinlogEvent::Ignored(header.type_code)),
        }
    }

    /// Table map previously seen for `table_id`, if any.
    pub fn table(&self, table_id: u64) -> Option<&TableMapEvent> {
        self.table_cache.get(&table_id)
    }

    fn decode_rows(&self, data: &[u8], op: RowsOp) -> Result<RowsEvent> {
        let mut cursor = Cursor::new(data);

        let table_id = read_table_id(&mut cursor)?;
        let flags = cursor.get_u16_le();
        let column_count = read_packed_int(&mut cursor)? as usize;

        let bitmap_len = column_count.div_ceil(8);
        let mut columns_present = vec![0u8; bitmap_len];
        cursor.read_exact(&mut columns_present)?;

        let columns_update = if op == RowsOp::Update {
            let mut bitmap = vec![0u8; bitmap_len];
            cursor.read_exact(&mut bitmap)?;
            Some(bitmap)
        } else {
            None
        };

        let table_map = self.table_cache.get(&table_id);
        let rows = decode_row_images(
            &mut cursor,
            table_map,
            column_count,
            &columns_present,
            columns_update.as_deref(),
            op,
        )?;

        Ok(RowsEvent {
            op,
            table_id,
            flags,
            column_count,
            rows,
        })
    }
}

fn decode_format_description(data: &[u8]) -> Result<FormatDescriptionEvent> {
    let mut cursor = Cursor::new(data);

    let binlog_version = cursor.get_u16_le();

    let mut server_version_bytes = [0u8; 50];
    cursor.read_exact(&mut server_version_bytes)?;
    let server_version = String::from_utf8_lossy(&server_version_bytes)
        .trim_end_matches('\0')
        .to_string();

    let create_timestamp = cursor.get_u32_le();
    let header_length = cursor.get_u8();

    // When checksums are on, the payload ends with [alg:u8][crc32:u32];
    // otherwise the algorithm byte is the very last one.
    let checksum = if data.len() >= 5 && data[data.len() - 5] == 1 {
        ChecksumAlg::Crc32
    } else {
        ChecksumAlg::Off
    };

    Ok(FormatDescriptionEvent {
        binlog_version,
        server_version,
        create_timestamp,
        header_length,
        checksum,
    })
}

fn decode_rotate(data: &[u8]) -> Result<RotateEvent> {
    let mut cursor = Cursor::new(data);

    let position = cursor.get_u64_le();
    let mut name_bytes = vec![0u8; data.len() - cursor.position() as usize];
    cursor.read_exact(&mut name_bytes)?;
    let next_log = String::from_utf8_lossy(&name_bytes)
        .trim_end_matches('\0')
        .to_string();

    Ok(RotateEvent { position, next_log })
}

fn decode_gtid(header: &EventHeader, data: &[u8]) -> Result<GtidEvent> {
    if data.len() < 13 {
        bail!("GTID event too short: {} bytes", data.len());
    }
    let mut cursor = Cursor::new(data);

    // MariaDB layout: sequence, domain, flags; the server id comes from the
    // common event header.
    let sequence = cursor.get_u64_le();
    let domain = cursor.get_u32_le();
    let flags = cursor.get_u8();

    Ok(GtidEvent {
        gtid: Gtid::new(domain, header.server_id, sequence),
        flags,
    })
}

fn decode_gtid_list(data: &[u8]) -> Result<GtidListEvent> {
    let mut cursor = Cursor::new(data);

    // Count occupies the low 28 bits; the top bits carry list flags.
    let count = (cursor.get_u32_le() & 0x0FFF_FFFF) as usize;
    let mut gtids = Vec::with_capacity(count);
    for _ in 0..count {
        let domain = cursor.get_u32_le();
        let server_id = cursor.get_u32_le();
        let sequence = cursor.get_u64_le();
        gtids.push(Gtid::new(domain, server_id, sequence));
    }

    Ok(GtidListEvent { gtids })
}

fn decode_xid(data: &[u8]) -> Result<XidEvent> {
    let mut cursor = Cursor::new(data);
    Ok(XidEvent {
        transaction_nr: cursor.get_u64_le(),
    })
}

fn decode_query(data: &[u8]) -> Result<QueryEvent> {
    let mut cursor = Cursor::new(data);

    let thread_id = cursor.get_u32_le();
    let exec_time = cursor.get_u32_le();
    let database_len = cursor.get_u8() as usize;
    let error_code = cursor.get_u16_le();

    let status_vars_len = cursor.get_u16_le() as usize;
    cursor.advance(status_vars_len);

    let mut database_bytes = vec![0u8; database_len];
    cursor.read_exact(&mut database_bytes)?;
    let database = String::from_utf8_lossy(&database_bytes).to_string();
    cursor.get_u8(); // null terminator

    let mut statement_bytes = vec![0u8; data.len() - cursor.position() as usize];
    cursor.read_exact(&mut statement_bytes)?;
    let statement = String::from_utf8_lossy(&statement_bytes).to_string();

    Ok(QueryEvent {
        thread_id,
        exec_time,
        error_code,
        database,
        statement,
    })
}

fn decode_table_map(data: &[u8]) -> Result<TableMapEvent> {
    let mut cursor = Cursor::new(data);

    let table_id = read_table_id(&mut cursor)?;
    let flags = cursor.get_u16_le();

    let database_len = cursor.get_u8() as usize;
    let mut database_bytes = vec![0u8; database_len];
    cursor.read_exact(&mut database_bytes)?;
    let database = String::from_utf8_lossy(&database_bytes).to_string();
    cursor.get_u8(); // null terminator

    let table_len = cursor.get_u8() as usize;
    let mut table_bytes = vec![0u8; table_len];
    cursor.read_exact(&mut table_bytes)?;
    let table = String::from_utf8_lossy(&table_bytes).to_string();
    cursor.get_u8(); // null terminator

    let column_count = read_packed_int(&mut cursor)? as usize;

    let mut column_types = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        column_types.push(ColumnType::from_u8(cursor.get_u8()));
    }

    let _metadata_len = read_packed_int(&mut cursor)? as usize;
    let column_metadata = decode_column_metadata(&column_types, &mut cursor)?;

    let null_bitmap_len = column_count.div_ceil(8);
    let mut null_bitmap = vec![0u8; null_bitmap_len];
    cursor.read_exact(&mut null_bitmap)?;

    Ok(TableMapEvent {
        table_id,
        flags,
        database,
        table,
        column_count,
        column_types,
        column_metadata,
        null_bitmap,
    })
}

fn decode_column_metadata(
    column_types: &[ColumnType],
    cursor: &mut Cursor<&[u8]>,
) -> Result<Vec<u16>> {
    let mut metadata = Vec::with_capacity(column_types.len());

    for col_type in column_types {
        let meta = match col_type {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Geometry => cursor.get_u8() as u16,
            ColumnType::Bit | ColumnType::Varchar | ColumnType::VarString => cursor.get_u16_le(),
            ColumnType::NewDecimal => {
                let precision = cursor.get_u8();
                let scale = cursor.get_u8();
                ((precision as u16) << 8) | (scale as u16)
            }
            ColumnType::String | ColumnType::Enum | ColumnType::Set => {
                // Real type in the high byte, length in the low byte
                let b1 = cursor.get_u8();
                let b2 = cursor.get_u8();
                ((b1 as u16) << 8) | (b2 as u16)
            }
            ColumnType::Time2 | ColumnType::DateTime2 | ColumnType::Timestamp2 => {
                cursor.get_u8() as u16
            }
            _ => 0,
        };
        metadata.push(meta);
    }

    Ok(metadata)
}

fn decode_row_images(
    cursor: &mut Cursor<&[u8]>,
    table_map: Option<&TableMapEvent>,
    column_count: usize,
    columns_present: &[u8],
    columns_update: Option<&[u8]>,
    op: RowsOp,
) -> Result<Vec<RowImage>> {
    let mut rows = Vec::new();

    while cursor.has_remaining() {
        let present_count = count_set_bits(columns_present);
        let null_bitmap_len = present_count.div_ceil(8);
        if cursor.remaining() < null_bitmap_len {
            break;
        }

        match op {
            RowsOp::Write => {
                let after = decode_one_image(cursor, table_map, column_count, columns_present)?;
                rows.push(RowImage {
                    before: None,
                    after: Some(after),
                });
            }
            RowsOp::Delete => {
                let before = decode_one_image(cursor, table_map, column_count, columns_present)?;
                rows.push(RowImage {
                    before: Some(before),
                    after: None,
                });
            }
            RowsOp::Update => {
                let before = decode_one_image(cursor, table_map, column_count, columns_present)?;

                let update_bitmap = columns_update.unwrap_or(columns_present);
                let update_null_len = count_set_bits(update_bitmap).div_ceil(8);
                if cursor.remaining() < update_null_len {
                    rows.push(RowImage {
                        before: Some(before),
                        after: None,
                    });
                    break;
                }

                let after = decode_one_image(cursor, table_map, column_count, update_bitmap)?;
                rows.push(RowImage {
                    before: Some(before),
                    after: Some(after),
                });
            }
        }
    }

    Ok(rows)
}

fn decode_one_image(
    cursor: &mut Cursor<&[u8]>,
    table_map: Option<&TableMapEvent>,
    column_count: usize,
    columns_bitmap: &[u8],
) -> Result<Vec<ColumnValue>> {
    let present_count = count_set_bits(columns_bitmap);
    let null_bitmap_len = present_count.div_ceil(8);
    let mut null_bitmap = vec![0u8; null_bitmap_len];
    cursor.read_exact(&mut null_bitmap)?;

    let mut values = Vec::with_capacity(column_count);
    let mut null_idx = 0;

    for col_idx in 0..column_count {
        if !is_bit_set(columns_bitmap, col_idx) {
            continue;
        }

        if is_bit_set(&null_bitmap, null_idx) {
            values.push(ColumnValue::Null);
            null_idx += 1;
            continue;
        }

        let col_type = table_map
            .and_then(|tm| tm.column_types.get(col_idx))
            .copied()
            .unwrap_or(ColumnType::VarString);
        let metadata = table_map
            .and_then(|tm| tm.column_metadata.get(col_idx))
            .copied()
            .unwrap_or(0);

        values.push(decode_column_value(cursor, col_type, metadata)?);
        null_idx += 1;
    }

    Ok(values)
}

fn decode_column_value(
    cursor: &mut Cursor<&[u8]>,
    col_type: ColumnType,
    metadata: u16,
) -> Result<ColumnValue> {
    match col_type {
        ColumnType::Tiny => Ok(ColumnValue::SignedInt(cursor.get_i8() as i64)),
        ColumnType::Short => Ok(ColumnValue::SignedInt(cursor.get_i16_le() as i64)),
        ColumnType::Int24 => {
            let b1 = cursor.get_u8() as u32;
            let b2 = cursor.get_u8() as u32;
            let b3 = cursor.get_u8() as u32;
            let val = b1 | (b2 << 8) | (b3 << 16);
            let signed = if val & 0x80_0000 != 0 {
                (val | 0xFF00_0000) as i32
            } else {
                val as i32
            };
            Ok(ColumnValue::SignedInt(signed as i64))
        }
        ColumnType::Long => Ok(ColumnValue::SignedInt(cursor.get_i32_le() as i64)),
        ColumnType::LongLong => Ok(ColumnValue::SignedInt(cursor.get_i64_le())),
        ColumnType::Float => Ok(ColumnValue::Float(cursor.get_f32_le())),
        ColumnType::Double => Ok(ColumnValue::Double(cursor.get_f64_le())),
        ColumnType::Year => Ok(ColumnValue::Year(cursor.get_u8() as u16 + 1900)),
        ColumnType::Date | ColumnType::NewDate => {
            let packed = cursor.get_u8() as u32
                | ((cursor.get_u8() as u32) << 8)
                | ((cursor.get_u8() as u32) << 16);
            Ok(ColumnValue::Date {
                year: ((packed >> 9) & 0x7FFF) as u16,
                month: ((packed >> 5) & 0x0F) as u8,
                day: (packed & 0x1F) as u8,
            })
        }
        ColumnType::Time => {
            let packed = cursor.get_u8() as u32
                | ((cursor.get_u8() as u32) << 8)
                | ((cursor.get_u8() as u32) << 16);
            Ok(ColumnValue::Time {
                hours: (packed / 10000) as u8,
                minutes: ((packed / 100) % 100) as u8,
                seconds: (packed % 100) as u8,
                microseconds: 0,
                negative: false,
            })
        }
        ColumnType::DateTime => {
            let packed = cursor.get_u64_le();
            Ok(ColumnValue::DateTime {
                year: (packed / 10_000_000_000) as u16,
                month: ((packed / 100_000_000) % 100) as u8,
                day: ((packed / 1_000_000) % 100) as u8,
                hour: ((packed / 10_000) % 100) as u8,
                minute: ((packed / 100) % 100) as u8,
                second: (packed % 100) as u8,
                microsecond: 0,
            })
        }
        ColumnType::Timestamp => Ok(ColumnValue::Timestamp(cursor.get_u32_le())),
        ColumnType::Timestamp2 => {
            let ts = cursor.get_u32();
            let _frac = read_fractional_seconds(cursor, metadata as u8)?;
            Ok(ColumnValue::Timestamp(ts))
        }
        ColumnType::DateTime2 => {
            let packed = read_be_uint(cursor, 5)?;
            let frac = read_fractional_seconds(cursor, metadata as u8)?;

            let year_month = (packed >> 22) & 0x1FFFF;
            Ok(ColumnValue::DateTime {
                year: (year_month / 13) as u16,
                month: (year_month % 13) as u8,
                day: ((packed >> 17) & 0x1F) as u8,
                hour: ((packed >> 12) & 0x1F) as u8,
                minute: ((packed >> 6) & 0x3F) as u8,
                second: (packed & 0x3F) as u8,
                microsecond: frac,
            })
        }
        ColumnType::Time2 => {
            let packed = read_be_uint(cursor, 3)? as u32;
            let frac = read_fractional_seconds(cursor, metadata as u8)?;

            let negative = (packed & 0x80_0000) == 0;
            let value = if negative {
                0x80_0000 - (packed & 0x7F_FFFF)
            } else {
                packed & 0x7F_FFFF
            };

            Ok(ColumnValue::Time {
                hours: ((value >> 12) & 0x3FF) as u8,
                minutes: ((value >> 6) & 0x3F) as u8,
                seconds: (value & 0x3F) as u8,
                microseconds: frac,
                negative,
            })
        }
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if metadata < 256 {
                cursor.get_u8() as usize
            } else {
                cursor.get_u16_le() as usize
            };
            let mut bytes = vec![0u8; len];
            cursor.read_exact(&mut bytes)?;
            Ok(ColumnValue::String(
                String::from_utf8_lossy(&bytes).to_string(),
            ))
        }
        ColumnType::String => {
            // ENUM and SET are stored as fixed strings with the real type in
            // the metadata high byte.
            let real_type = (metadata >> 8) as u8;
            let max_len = metadata & 0xFF;

            if real_type == ColumnType::Enum as u8 {
                let val = if max_len == 1 {
                    cursor.get_u8() as u16
                } else {
                    cursor.get_u16_le()
                };
                Ok(ColumnValue::Enum(val))
            } else if real_type == ColumnType::Set as u8 {
                // max_len is the pack length in bytes, not a member count
                let byte_count = max_len as usize;
                let mut val = 0u64;
                for i in 0..byte_count {
                    val |= (cursor.get_u8() as u64) << (i * 8);
                }
                Ok(ColumnValue::Set(val))
            } else {
                let len = if max_len < 256 {
                    cursor.get_u8() as usize
                } else {
                    cursor.get_u16_le() as usize
                };
                let mut bytes = vec![0u8; len];
                cursor.read_exact(&mut bytes)?;
                Ok(ColumnValue::String(
                    String::from_utf8_lossy(&bytes).to_string(),
                ))
            }
        }
        ColumnType::Blob | ColumnType::TinyBlob | ColumnType::MediumBlob | ColumnType::LongBlob => {
            let len_bytes = metadata as usize;
            let len = match len_bytes {
                1 => cursor.get_u8() as usize,
                2 => cursor.get_u16_le() as usize,
                3 => {
                    let b1 = cursor.get_u8() as usize;
                    let b2 = cursor.get_u8() as usize;
                    let b3 = cursor.get_u8() as usize;
                    b1 | (b2 << 8) | (b3 << 16)
                }
                4 => cursor.get_u32_le() as usize,
                _ => cursor.get_u8() as usize,
            };
            let mut bytes = vec![0u8; len];
            cursor.read_exact(&mut bytes)?;
            Ok(ColumnValue::Bytes(bytes))
        }
        ColumnType::NewDecimal => {
            let precision = (metadata >> 8) as usize;
            let scale = (metadata & 0xFF) as usize;
            Ok(ColumnValue::Decimal(decode_decimal(
                cursor, precision, scale,
            )?))
        }
        ColumnType::Bit => {
            let nbits = ((metadata >> 8) * 8 + (metadata & 0xFF)) as usize;
            let len = nbits.div_ceil(8);
            let mut bytes = vec![0u8; len];
            cursor.read_exact(&mut bytes)?;
            Ok(ColumnValue::Bit(bytes))
        }
        ColumnType::Enum => {
            let val = if metadata == 1 {
                cursor.get_u8() as u16
            } else {
                cursor.get_u16_le()
            };
            Ok(ColumnValue::Enum(val))
        }
        ColumnType::Set => {
            let byte_count = metadata as usize;
            let mut val = 0u64;
            for i in 0..byte_count {
                val |= (cursor.get_u8() as u64) << (i * 8);
            }
            Ok(ColumnValue::Set(val))
        }
        _ => {
            let len = cursor.get_u8() as usize;
            let mut bytes = vec![0u8; len];
            cursor.read_exact(&mut bytes)?;
            Ok(ColumnValue::Bytes(bytes))
        }
    }
}

// Helper functions

fn read_table_id(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let b1 = cursor.get_u8() as u64;
    let b2 = cursor.get_u8() as u64;
    let b3 = cursor.get_u8() as u64;
    let b4 = cursor.get_u8() as u64;
    let b5 = cursor.get_u8() as u64;
    let b6 = cursor.get_u8() as u64;
    Ok(b1 | (b2 << 8) | (b3 << 16) | (b4 << 24) | (b5 << 32) | (b6 << 40))
}

fn read_packed_int(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let first = cursor.get_u8();
    match first {
        0..=250 => Ok(first as u64),
        252 => Ok(cursor.get_u16_le() as u64),
        253 => {
            let b1 = cursor.get_u8() as u64;
            let b2 = cursor.get_u8() as u64;
            let b3 = cursor.get_u8() as u64;
            Ok(b1 | (b2 << 8) | (b3 << 16))
        }
        254 => Ok(cursor.get_u64_le()),
        _ => bail!("invalid packed integer prefix: {}", first),
    }
}

fn read_fractional_seconds(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<u32> {
    let bytes = (fsp as usize).div_ceil(2);
    let mut val = 0u32;
    for _ in 0..bytes {
        val = (val << 8) | (cursor.get_u8() as u32);
    }
    Ok(val * 10u32.pow(6 - fsp as u32))
}

fn read_be_uint(cursor: &mut Cursor<&[u8]>, bytes: usize) -> Result<u64> {
    let mut val = 0u64;
    for _ in 0..bytes {
        val = (val << 8) | (cursor.get_u8() as u64);
    }
    Ok(val)
}

fn count_set_bits(bitmap: &[u8]) -> usize {
    bitmap.iter().map(|b| b.count_ones() as usize).sum()
}

fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    let byte_idx = idx / 8;
    let bit_idx = idx % 8;
    byte_idx < bitmap.len() && (bitmap[byte_idx] & (1 << bit_idx)) != 0
}

fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> Result<String> {
    let int_digits = precision - scale;
    let int_words = int_digits / 9;
    let int_leftover = int_digits % 9;
    let frac_words = scale / 9;
    let frac_leftover = scale % 9;

    let leftover_bytes = |digits: usize| -> usize {
        match digits {
            0 => 0,
            1..=2 => 1,
            3..=4 => 2,
            5..=6 => 3,
            _ => 4,
        }
    };

    let int_leftover_bytes = leftover_bytes(int_leftover);
    let frac_leftover_bytes = leftover_bytes(frac_leftover);
    let total_bytes = int_leftover_bytes + int_words * 4 + frac_words * 4 + frac_leftover_bytes;

    let mut bytes = vec![0u8; total_bytes];
    cursor.read_exact(&mut bytes)?;

    // The sign bit is stored inverted so encoded values sort correctly;
    // negative values are stored as the complement.
    let negative = (bytes[0] & 0x80) == 0;
    bytes[0] ^= 0x80;
    if negative {
        for b in bytes.iter_mut() {
            *b = !*b;
        }
    }

    let mut result = String::new();
    if negative {
        result.push('-');
    }

    let mut word_cursor = Cursor::new(bytes.as_slice());
    let mut int_part = String::new();

    if int_leftover_bytes > 0 {
        let val = read_be_uint(&mut word_cursor, int_leftover_bytes)? as u32;
        if val > 0 || int_words == 0 {
            int_part.push_str(&val.to_string());
        }
    }

    for _ in 0..int_words {
        let val = word_cursor.get_u32();
        if int_part.is_empty() && val == 0 {
            continue;
        }
        if int_part.is_empty() {
            int_part.push_str(&val.to_string());
        } else {
            int_part.push_str(&format!("{:09}", val));
        }
    }

    if int_part.is_empty() {
        int_part.push('0');
    }
    result.push_str(&int_part);

    if scale > 0 {
        result.push('.');
        for _ in 0..frac_words {
            let val = word_cursor.get_u32();
            result.push_str(&format!("{:09}", val));
        }
        if frac_leftover_bytes > 0 {
            let val = read_be_uint(&mut word_cursor, frac_leftover_bytes)? as u32;
            result.push_str(&format!("{:0width$}", val, width = frac_leftover));
        }
    }

    Ok(result)
}
