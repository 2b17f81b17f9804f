pub mod category;
pub mod unit;

pub use category::CategoryMapper;
pub use unit::UnitMapper;
