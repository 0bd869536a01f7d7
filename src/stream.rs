mod reader;
mod writer;

pub use reader::BlockStreamReader;
pub use writer::{BlockStreamWriter, PartStreams, StreamSink};
