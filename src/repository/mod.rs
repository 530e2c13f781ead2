pub mod records;
pub mod table_service;
