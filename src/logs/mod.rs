// Logs module - Log lines, sources and tagging

mod docker;
mod line;
mod source;
mod tagger;

pub use docker::{classify_failure, DockerCliSource};
pub use line::{split_timestamp, LineSplitter, LogLine, TaggedLine};
pub use source::{LiveStream, LogSource};
pub use tagger::{LineTagger, Tag, MAX_LABEL_LEN, PALETTE, PALETTE_SIZE};
