pub mod command;
pub mod response;

pub use response::{Chunk, Node, ParseError, parse, parse_attrs, reassemble};
