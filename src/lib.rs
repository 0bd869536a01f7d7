pub mod block;
pub mod encoding;
mod error;
pub mod fs;
pub mod merge;
mod options;
pub mod part;
pub mod stream;
pub mod table;

pub use block::{InMemoryBlock, Item};
pub use error::{Error, Result};
pub use merge::{merge_block_streams, PrepareBlockFn};
pub use options::TableOptions;
pub use part::{Part, PartSearch};
pub use stream::{BlockStreamReader, BlockStreamWriter};
pub use table::{Table, TableSearch, TableStats};
