pub mod checkpoint;
pub mod driver;
pub mod executor;
pub mod external;
