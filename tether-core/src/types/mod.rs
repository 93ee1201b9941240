mod primitives;
mod records;

pub use primitives::*;
pub use records::*;
