pub mod output;
pub mod plan;
pub mod price;
pub mod schedule;
pub mod sequence;
pub mod types;
pub mod ups;

pub use output::*;
pub use plan::*;
pub use price::*;
pub use schedule::*;
pub use sequence::*;
pub use types::*;
pub use ups::*;
