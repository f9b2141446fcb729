pub mod documents;
pub mod records;
