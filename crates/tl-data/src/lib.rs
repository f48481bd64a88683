pub mod book;
pub mod encoding;
pub mod historical;
pub mod live;
pub mod midas;

pub use book::{OrderBook, OrderBookService};
pub use encoding::{encode_stream, read_stream, write_stream_file, RecordBuffer, StreamMetadata};
pub use historical::{session_date, unix_to_iso, HistoricalAdaptor};
pub use live::{FeedRecord, LiveFeedAdaptor};
pub use midas::MidasClient;
