pub mod decision;
pub mod market_data;
pub mod position;

pub use decision::*;
pub use market_data::*;
pub use position::*;
