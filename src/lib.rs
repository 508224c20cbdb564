pub mod aggregator;
pub mod cli;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod ledger;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod scope;
pub mod tools;
