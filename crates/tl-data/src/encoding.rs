//! Binary codec for recorded market-data streams.
//!
//! A stream is a sequence of length-prefixed messages, each carrying a
//! 16-byte header followed by a type-specific body, terminated by a
//! zero-length marker and a metadata trailer (schema, time bounds, and the
//! native-id -> ticker mappings needed to remap instruments on replay).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use tl_types::{
    BboQuote, BidAskPair, DataSourceError, MarketRecord, OhlcvBar, SchemaError, TlError,
    TlResult, DEPTH_LEVELS,
};

const RECORD_TYPE_BAR: u8 = 1;
const RECORD_TYPE_QUOTE: u8 = 2;

const HEADER_LEN: usize = 16;

/// Stream-level metadata written after the final record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamMetadata {
    pub schema: String,
    pub start_ns: i64,
    pub end_ns: i64,
    /// Native instrument id (as written by the recorder) -> data ticker.
    pub mappings: HashMap<u32, String>,
}

impl StreamMetadata {
    pub fn ticker(&self, native_id: u32) -> Option<&str> {
        self.mappings.get(&native_id).map(String::as_str)
    }
}

/// An in-memory recorded stream with a replay cursor.
#[derive(Debug)]
pub struct RecordBuffer {
    records: Vec<MarketRecord>,
    cursor: usize,
    pub metadata: StreamMetadata,
}

impl RecordBuffer {
    pub fn new(records: Vec<MarketRecord>, metadata: StreamMetadata) -> Self {
        Self {
            records,
            cursor: 0,
            metadata,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> TlResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|_| DataSourceError::FileNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> TlResult<Self> {
        decode_stream(bytes)
    }

    /// Pop the next record, advancing the cursor. `None` once exhausted.
    pub fn replay(&mut self) -> Option<MarketRecord> {
        let record = self.records.get(self.cursor).cloned();
        if record.is_some() {
            self.cursor += 1;
        }
        record
    }

    pub fn remaining(&self) -> usize {
        self.records.len() - self.cursor
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Serialize `records` + `metadata` into the wire format. Used by the
/// capture tooling and by tests that fabricate replay files.
pub fn encode_stream(
    records: &[MarketRecord],
    metadata: &StreamMetadata,
    out: &mut impl Write,
) -> TlResult<()> {
    for record in records {
        let mut body = Vec::new();
        let record_type = match record {
            MarketRecord::Bar(bar) => {
                body.extend_from_slice(&bar.open.to_le_bytes());
                body.extend_from_slice(&bar.high.to_le_bytes());
                body.extend_from_slice(&bar.low.to_le_bytes());
                body.extend_from_slice(&bar.close.to_le_bytes());
                body.extend_from_slice(&(bar.volume as i64).to_le_bytes());
                RECORD_TYPE_BAR
            }
            MarketRecord::Quote(quote) => {
                body.extend_from_slice(&quote.price.to_le_bytes());
                body.extend_from_slice(&quote.size.to_le_bytes());
                body.push(quote.side);
                body.push(quote.flags);
                body.extend_from_slice(&quote.ts_recv.to_le_bytes());
                body.extend_from_slice(&quote.sequence.to_le_bytes());
                for i in 0..DEPTH_LEVELS {
                    let level = quote.levels.get(i).copied().unwrap_or_default();
                    body.extend_from_slice(&level.bid_px.to_le_bytes());
                    body.extend_from_slice(&level.ask_px.to_le_bytes());
                    body.extend_from_slice(&level.bid_sz.to_le_bytes());
                    body.extend_from_slice(&level.ask_sz.to_le_bytes());
                    body.extend_from_slice(&level.bid_ct.to_le_bytes());
                    body.extend_from_slice(&level.ask_ct.to_le_bytes());
                }
                RECORD_TYPE_QUOTE
            }
            MarketRecord::EndOfDay(_) => {
                // Synthetic only; never recorded.
                continue;
            }
        };

        let total = (HEADER_LEN + body.len()) as u32;
        out.write_all(&total.to_le_bytes())?;
        out.write_all(&[record_type])?;
        out.write_all(&record.instrument_id().to_le_bytes())?;
        out.write_all(&record.ts_event().to_le_bytes())?;
        out.write_all(&[record.rollover_flag() as u8])?;
        out.write_all(&[0u8; 2])?; // reserved
        out.write_all(&body)?;
    }

    // Zero-length marker, then the trailer.
    out.write_all(&0u32.to_le_bytes())?;
    let schema_bytes = metadata.schema.as_bytes();
    out.write_all(&(schema_bytes.len() as u16).to_le_bytes())?;
    out.write_all(schema_bytes)?;
    out.write_all(&metadata.start_ns.to_le_bytes())?;
    out.write_all(&metadata.end_ns.to_le_bytes())?;
    out.write_all(&(metadata.mappings.len() as u32).to_le_bytes())?;
    let mut native_ids: Vec<_> = metadata.mappings.keys().copied().collect();
    native_ids.sort_unstable();
    for native_id in native_ids {
        let ticker = metadata.mappings[&native_id].as_bytes();
        out.write_all(&native_id.to_le_bytes())?;
        out.write_all(&(ticker.len() as u16).to_le_bytes())?;
        out.write_all(ticker)?;
    }
    Ok(())
}

/// Convenience wrapper writing a fabricated stream to disk.
pub fn write_stream_file(
    path: impl AsRef<Path>,
    records: &[MarketRecord],
    metadata: &StreamMetadata,
) -> TlResult<()> {
    let mut file = std::fs::File::create(path)?;
    encode_stream(records, metadata, &mut file)
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> TlResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(DataSourceError::TruncatedStream.into());
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> TlResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> TlResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> TlResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> TlResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

fn decode_stream(bytes: &[u8]) -> TlResult<RecordBuffer> {
    let mut reader = ByteReader::new(bytes);
    let mut records = Vec::new();

    loop {
        let total = reader.u32()?;
        if total == 0 {
            break;
        }
        if (total as usize) < HEADER_LEN {
            return Err(SchemaError::MalformedBody {
                message: format!("message length {total} shorter than header"),
            }
            .into());
        }

        let record_type = reader.u8()?;
        let instrument_id = reader.u32()?;
        let ts_event = reader.i64()?;
        let rollover_flag = reader.u8()? != 0;
        reader.take(2)?; // reserved

        let record = match record_type {
            RECORD_TYPE_BAR => MarketRecord::Bar(OhlcvBar {
                instrument_id,
                ts_event,
                rollover_flag,
                open: reader.i64()?,
                high: reader.i64()?,
                low: reader.i64()?,
                close: reader.i64()?,
                volume: reader.i64()? as u64,
            }),
            RECORD_TYPE_QUOTE => {
                let price = reader.i64()?;
                let size = reader.u32()?;
                let side = reader.u8()?;
                let flags = reader.u8()?;
                let ts_recv = reader.i64()?;
                let sequence = reader.u32()?;
                let mut levels = Vec::with_capacity(DEPTH_LEVELS);
                for _ in 0..DEPTH_LEVELS {
                    levels.push(BidAskPair {
                        bid_px: reader.i64()?,
                        ask_px: reader.i64()?,
                        bid_sz: reader.u32()?,
                        ask_sz: reader.u32()?,
                        bid_ct: reader.u32()?,
                        ask_ct: reader.u32()?,
                    });
                }
                MarketRecord::Quote(BboQuote {
                    instrument_id,
                    ts_event,
                    rollover_flag,
                    price,
                    size,
                    side,
                    flags,
                    ts_recv,
                    sequence,
                    levels,
                })
            }
            other => {
                return Err(SchemaError::UnknownRecordType { record_type: other }.into());
            }
        };
        records.push(record);
    }

    let schema_len = reader.u16()? as usize;
    let schema = String::from_utf8(reader.take(schema_len)?.to_vec()).map_err(|_| {
        TlError::from(SchemaError::MalformedBody {
            message: "schema string is not utf-8".to_string(),
        })
    })?;
    let start_ns = reader.i64()?;
    let end_ns = reader.i64()?;
    let mapping_count = reader.u32()?;
    let mut mappings = HashMap::with_capacity(mapping_count as usize);
    for _ in 0..mapping_count {
        let native_id = reader.u32()?;
        let ticker_len = reader.u16()? as usize;
        let ticker = String::from_utf8(reader.take(ticker_len)?.to_vec()).map_err(|_| {
            TlError::from(SchemaError::MalformedBody {
                message: "ticker mapping is not utf-8".to_string(),
            })
        })?;
        mappings.insert(native_id, ticker);
    }

    Ok(RecordBuffer::new(
        records,
        StreamMetadata {
            schema,
            start_ns,
            end_ns,
            mappings,
        },
    ))
}

/// Read and decode a full stream from any reader.
pub fn read_stream(reader: &mut impl Read) -> TlResult<RecordBuffer> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    RecordBuffer::from_bytes(&bytes)
}
