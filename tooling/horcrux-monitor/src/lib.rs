pub mod alerter;
pub mod catalog;
pub mod checks;
pub mod collector;
pub mod config;
pub mod engine;
pub mod evaluator;
pub mod models;
pub mod prometheus;
pub mod render;
pub mod report;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod tracker;
