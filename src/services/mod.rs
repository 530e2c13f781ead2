pub mod audit;
pub mod owner_report;
