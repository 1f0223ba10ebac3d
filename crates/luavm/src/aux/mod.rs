// Small shared utilities: the per-state scratch buffer, number <->
// string conversion, and chunk-id compression for error messages.

mod buffer;
mod chunk_id;
mod numconv;

pub use buffer::MBuffer;
pub use chunk_id::chunk_id;
pub use numconv::{number_to_str, str_to_number};
